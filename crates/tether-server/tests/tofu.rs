use std::fs;
use std::sync::Arc;

use tempfile::TempDir;
use tether_client::{Client, ClientConfig, ClientError};
use tether_crypto::KnownServer;
use tether_server::{Server, ServerConfig};

async fn start_server(dir: &TempDir) -> (Arc<Server>, tokio::task::JoinHandle<()>, u16) {
    let config = ServerConfig::default().with_identity_path(dir.path().join("server_key.json"));
    let server = Arc::new(Server::bind(("127.0.0.1", 0), config).await.expect("bind"));
    let port = server.local_addr().expect("local addr").port();
    let run = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });
    (server, run, port)
}

#[tokio::test]
async fn first_contact_is_recorded_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, run, port) = start_server(&dir).await;

    let trust_path = dir.path().join("known_servers.json");
    let client =
        Client::new(ClientConfig::default().with_trust_path(&trust_path)).expect("client");
    client.connect("127.0.0.1", port).await.expect("connect");

    let raw = fs::read(&trust_path).expect("trust store written");
    let records: Vec<KnownServer> = serde_json::from_slice(&raw).expect("parse trust store");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].host, "127.0.0.1");
    assert_eq!(records[0].port, port);
    assert_eq!(records[0].fingerprint, server.identity_fingerprint());

    client.disconnect().await.expect("disconnect");
    server.stop().await;
    run.await.expect("accept loop");
}

#[tokio::test]
async fn pinned_mismatch_aborts_and_persists_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (server, run, port) = start_server(&dir).await;

    // Pin a fingerprint that cannot match the server's fresh identity.
    let trust_path = dir.path().join("known_servers.json");
    let poisoned = vec![KnownServer {
        host: "127.0.0.1".to_string(),
        port,
        fingerprint: "AA:".repeat(31) + "AA",
    }];
    fs::write(&trust_path, serde_json::to_vec_pretty(&poisoned).expect("encode"))
        .expect("seed trust store");
    let before = fs::read(&trust_path).expect("read trust store");

    let client =
        Client::new(ClientConfig::default().with_trust_path(&trust_path)).expect("client");
    let err = client.connect("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::IdentityMismatch { ref host, port: p } if host == "127.0.0.1" && p == port
    ));
    assert!(!client.is_connected());

    let after = fs::read(&trust_path).expect("read trust store");
    assert_eq!(before, after);

    server.stop().await;
    run.await.expect("accept loop");
}
