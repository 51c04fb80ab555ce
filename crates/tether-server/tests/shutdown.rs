use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tether_client::{Client, ClientConfig};
use tether_core::{
    codec_to_vec, frame, BufferPool, Packet, ProtocolConfig, SystemPacket,
    DEFAULT_MAX_PACKET_SIZE,
};
use tether_crypto::{new_challenge, ClientHandshake, EphemeralKeyPair};
use tether_server::{Server, ServerConfig};
use tokio::net::TcpStream;

async fn start_server(
    dir: &TempDir,
    config: ServerConfig,
) -> (Arc<Server>, tokio::task::JoinHandle<()>, u16) {
    let server = Arc::new(Server::bind(("127.0.0.1", 0), config).await.expect("bind"));
    let port = server.local_addr().expect("local addr").port();
    let run = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });
    (server, run, port)
}

async fn raw_handshake(stream: &mut TcpStream) {
    let pool = BufferPool::default();
    let max = DEFAULT_MAX_PACKET_SIZE;

    let buf = loop {
        match frame::read_frame(stream, &pool, max).await.expect("read") {
            Some(buf) => break buf,
            None => continue,
        }
    };
    let hello = Packet::decode(&buf).expect("decode identity");
    assert_eq!(hello.system_kind(), Some(SystemPacket::Handshake));

    let ephemeral = EphemeralKeyPair::generate().expect("ephemeral");
    let reply = ClientHandshake {
        challenge: new_challenge().to_vec(),
        client_ephemeral_key: ephemeral.public_key_der().to_vec(),
    };
    let packet = Packet::system(SystemPacket::Handshake, codec_to_vec(&reply).expect("encode"));
    frame::write_frame(stream, &packet.encode(max).expect("encode"), max)
        .await
        .expect("write client handshake");

    loop {
        match frame::read_frame(stream, &pool, max).await.expect("read") {
            Some(_) => break,
            None => continue,
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn graceful_shutdown_clears_the_registry_despite_a_laggard() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ServerConfig::default()
        .with_identity_path(dir.path().join("server_key.json"))
        .with_protocol(ProtocolConfig::default())
        .with_shutdown_grace(Duration::from_secs(5));
    let (server, run, port) = start_server(&dir, config).await;

    let reasons: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let mut clients = Vec::new();
    for index in 0..9 {
        let client = Client::new(
            ClientConfig::default()
                .with_trust_path(dir.path().join(format!("known_servers_{index}.json"))),
        )
        .expect("client");
        let reasons = Arc::clone(&reasons);
        client.on_disconnected(move |reason| {
            reasons.lock().expect("lock").push(reason.map(str::to_string));
        });
        client.connect("127.0.0.1", port).await.expect("connect");
        clients.push(client);
    }

    // The tenth client completes the handshake, then never reads again.
    let mut laggard = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("laggard connect");
    raw_handshake(&mut laggard).await;

    wait_until(|| server.client_count() == 10).await;

    tokio::time::timeout(Duration::from_secs(8), server.stop())
        .await
        .expect("stop within the grace window");
    assert_eq!(server.client_count(), 0);
    run.await.expect("accept loop");

    wait_until(|| reasons.lock().expect("lock").len() == 9).await;
    for reason in reasons.lock().expect("lock").iter() {
        assert_eq!(reason.as_deref(), Some("Server is shutting down."));
    }
    for client in &clients {
        assert!(!client.is_connected());
    }

    drop(laggard);
}
