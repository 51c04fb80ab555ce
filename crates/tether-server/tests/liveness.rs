use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tether_core::{
    codec_to_vec, frame, BufferPool, KeepAliveConfig, Packet, ProtocolConfig, SystemPacket,
    DEFAULT_MAX_PACKET_SIZE,
};
use tether_crypto::{new_challenge, ClientHandshake, EphemeralKeyPair};
use tether_server::{Server, ServerConfig};
use tokio::net::TcpStream;

async fn start_server(
    dir: &TempDir,
    protocol: ProtocolConfig,
) -> (Arc<Server>, tokio::task::JoinHandle<()>, u16) {
    let config = ServerConfig::default()
        .with_identity_path(dir.path().join("server_key.json"))
        .with_protocol(protocol);
    let server = Arc::new(Server::bind(("127.0.0.1", 0), config).await.expect("bind"));
    let port = server.local_addr().expect("local addr").port();
    let run = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });
    (server, run, port)
}

/// Complete the wire handshake by hand so the connection can then go
/// perfectly silent: no keep-alives, no reads, no writes.
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

#[tokio::test]
async fn stalled_client_is_disconnected_by_the_scheduler() {
    let dir = tempfile::tempdir().expect("tempdir");
    let protocol = ProtocolConfig::default().with_keep_alive(KeepAliveConfig {
        interval: Duration::from_millis(100),
        timeout: Duration::from_millis(400),
    });
    let (server, run, port) = start_server(&dir, protocol).await;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    server.events().on_client_disconnected(move |_| {
        if let Some(tx) = tx.lock().expect("lock").take() {
            let _ = tx.send(());
        }
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect");
    raw_handshake(&mut stream).await;
    let started = Instant::now();

    tokio::time::timeout(Duration::from_secs(3), rx)
        .await
        .expect("scheduler disconnect in time")
        .expect("disconnect event");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300),
        "disconnected too early: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(1400),
        "disconnected too late: {elapsed:?}"
    );
    assert_eq!(server.client_count(), 0);

    drop(stream);
    server.stop().await;
    run.await.expect("accept loop");
}
