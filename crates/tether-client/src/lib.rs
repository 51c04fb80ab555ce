//! Connecting side of the Tether protocol.
//!
//! A [`Client`] holds one active session at a time. `connect` runs the full
//! TOFU handshake before the session is published, so a failed or rejected
//! handshake leaves the client reconnectable. Inbound packets are dispatched
//! through a [`PacketRouter`] and multi-subscriber event hooks; the shared
//! keep-alive scheduler keeps an idle session visibly alive to the server.

mod handshake;
mod session;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use tether_core::{
    BufferPool, CodecError, FrameError, KeepAlivePeer, KeepAliveScheduler, Packet, PacketError,
    PacketRouter, ProtocolConfig,
};
use tether_crypto::{CryptoError, HandshakeError, KexError, TrustError, TrustStore};

use session::{Session, SessionEnd};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is not connected")]
    NotConnected,
    #[error("server identity for {host}:{port} does not match the pinned fingerprint")]
    IdentityMismatch { host: String, port: u16 },
    #[error("handshake timed out")]
    HandshakeTimedOut,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Kex(#[from] KexError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builder-style client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub protocol: ProtocolConfig,
    /// Location of the persisted TOFU store.
    pub trust_path: PathBuf,
}

impl ClientConfig {
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_trust_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_path = path.into();
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            trust_path: PathBuf::from("known_servers.json"),
        }
    }
}

type PacketHook = Arc<dyn Fn(&Packet) + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(Option<&str>) + Send + Sync>;

#[derive(Default)]
struct ClientEvents {
    packets: RwLock<Vec<PacketHook>>,
    disconnected: RwLock<Vec<DisconnectHook>>,
}

impl ClientEvents {
    fn emit_packet(&self, packet: &Packet) {
        for hook in self.packets.read().iter() {
            hook(packet);
        }
    }

    fn emit_disconnected(&self, reason: Option<&str>) {
        for hook in self.disconnected.read().iter() {
            hook(reason);
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    trust: TrustStore,
    connected: AtomicBool,
    session: Mutex<Option<Arc<Session>>>,
    scheduler: Arc<KeepAliveScheduler>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    router: PacketRouter<Client>,
    events: ClientEvents,
    pool: BufferPool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        if let Some(task) = self.scheduler_task.get_mut().take() {
            task.abort();
        }
        if let Some(session) = self.session.get_mut().take() {
            session.cancel_token().cancel();
        }
    }
}

/// A Tether client. Cheap to clone; all clones share the same single
/// session slot.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let trust = TrustStore::open(&config.trust_path)?;
        let scheduler = KeepAliveScheduler::new(config.protocol.keep_alive);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                trust,
                connected: AtomicBool::new(false),
                session: Mutex::new(None),
                scheduler,
                scheduler_task: Mutex::new(None),
                router: PacketRouter::new(),
                events: ClientEvents::default(),
                pool: BufferPool::default(),
            }),
        })
    }

    /// Identifier router for inbound application packets. Handlers receive a
    /// clone of this client as context.
    pub fn router(&self) -> &PacketRouter<Client> {
        &self.inner.router
    }

    pub fn on_packet_received<F>(&self, hook: F)
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.inner.events.packets.write().push(Arc::new(hook));
    }

    pub fn on_disconnected<F>(&self, hook: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.inner.events.disconnected.write().push(Arc::new(hook));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.inner.trust
    }

    /// Connect and handshake. At most one session may be active; a second
    /// call without an intervening disconnect fails with `AlreadyConnected`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ClientError> {
        if self
            .inner
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClientError::AlreadyConnected);
        }
        match self.connect_inner(host, port).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.connected.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn connect_inner(&self, host: &str, port: u16) -> Result<(), ClientError> {
        let protocol = self.inner.config.protocol.clone();
        let stream = TcpStream::connect((host, port)).await?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let sealer = match tokio::time::timeout(
            protocol.handshake_timeout,
            handshake::drive(
                &mut reader,
                &mut writer,
                &self.inner.trust,
                host,
                port,
                &self.inner.pool,
                protocol.max_packet_size,
            ),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::HandshakeTimedOut),
        };

        self.ensure_scheduler();
        let session = Session::new(
            writer,
            Arc::new(sealer),
            Arc::downgrade(&self.inner.scheduler),
            protocol.max_packet_size,
        );
        *self.inner.session.lock() = Some(Arc::clone(&session));
        self.inner
            .scheduler
            .register(Arc::clone(&session) as Arc<dyn KeepAlivePeer>);

        let client = self.clone();
        tokio::spawn(async move { run_session(client, session, reader).await });
        tracing::info!(target: "tether::client", host, port, "connected");
        Ok(())
    }

    /// Send a packet over the active session.
    pub async fn send(&self, packet: Packet) -> Result<(), ClientError> {
        let session = self
            .inner
            .session
            .lock()
            .clone()
            .ok_or(ClientError::NotConnected)?;
        session.send(packet).await
    }

    /// Tell the server goodbye and tear the session down.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let session = { self.inner.session.lock().clone() };
        let Some(session) = session else {
            return Err(ClientError::NotConnected);
        };
        session.send_goodbye().await;
        session.teardown().await;
        Ok(())
    }

    pub(crate) async fn dispatch(&self, packet: Packet) {
        self.inner.events.emit_packet(&packet);
        if let Some(handler) = self.inner.router.route(self.clone(), packet) {
            handler.await;
        }
    }

    async fn finish_session(&self, session: &Arc<Session>, end: SessionEnd) {
        self.inner.scheduler.unregister(session.liveness_key());
        session.teardown().await;
        {
            let mut slot = self.inner.session.lock();
            if slot
                .as_ref()
                .map(|current| Arc::ptr_eq(current, session))
                .unwrap_or(false)
            {
                *slot = None;
            }
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        let reason = match end {
            SessionEnd::ServerRequested(reason) => reason,
            SessionEnd::Silent => None,
        };
        self.inner.events.emit_disconnected(reason.as_deref());
        tracing::info!(target: "tether::client", "disconnected");
    }

    fn ensure_scheduler(&self) {
        let mut guard = self.inner.scheduler_task.lock();
        if guard.is_none() {
            *guard = Some(self.inner.scheduler.start());
        }
    }
}

async fn run_session(client: Client, session: Arc<Session>, mut reader: OwnedReadHalf) {
    let end = session.read_loop(&mut reader, &client.inner.pool, &client).await;
    client.finish_session(&session, end).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_the_conventional_store() {
        let config = ClientConfig::default();
        assert_eq!(config.trust_path, PathBuf::from("known_servers.json"));
    }

    #[test]
    fn corrupt_trust_store_fails_construction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_servers.json");
        std::fs::write(&path, b"not json").expect("write");
        assert!(matches!(
            Client::new(ClientConfig::default().with_trust_path(&path)),
            Err(ClientError::Trust(_))
        ));
    }
}
