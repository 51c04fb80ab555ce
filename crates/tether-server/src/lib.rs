//! Server orchestration for Tether.
//!
//! [`Server`] owns the listener, the connection registry and the broadcast
//! gate, and shares one keep-alive scheduler across every accepted
//! connection. Each accepted stream is handshake-promoted on its own task
//! before it appears in the registry; packet dispatch goes through a
//! [`PacketRouter`] keyed by identifier.

mod connection;
mod events;
mod handshake;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_core::{
    BufferPool, KeepAlivePeer, KeepAliveScheduler, Packet, PacketRouter, ProtocolConfig,
    RateLimiter,
};
use tether_crypto::{fingerprint, IdentityError, ServerIdentity};

pub use connection::{Connection, SendError};
pub use events::ServerEvents;
pub use handshake::HandshakeFailure;

const SHUTDOWN_REASON: &str = "Server is shutting down.";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("no connected client with id {0}")]
    UnknownClient(Uuid),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Builder-style server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol: ProtocolConfig,
    /// Location of the persisted signing identity.
    pub identity_path: PathBuf,
    /// Permits on the broadcast fan-out gate.
    pub broadcast_concurrency: usize,
    /// How long `stop` waits for per-client tasks before force-closing.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = path.into();
        self
    }

    pub fn with_broadcast_concurrency(mut self, permits: usize) -> Self {
        self.broadcast_concurrency = permits.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            identity_path: PathBuf::from("server_key.json"),
            broadcast_concurrency: 100,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

struct Shared {
    protocol: ProtocolConfig,
    identity: ServerIdentity,
    registry: DashMap<Uuid, Arc<Connection>>,
    tasks: DashMap<Uuid, JoinHandle<()>>,
    router: PacketRouter<Arc<Connection>>,
    scheduler: Arc<KeepAliveScheduler>,
    events: ServerEvents,
    broadcast_gate: Arc<Semaphore>,
    conn_cancel: CancellationToken,
    pool: BufferPool,
}

/// The accept loop, registry and broadcast front of a Tether server.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    shared: Arc<Shared>,
    accept_cancel: CancellationToken,
    scheduler_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind the listener, load (or mint) the signing identity and start the
    /// keep-alive scheduler.
    pub async fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let identity = ServerIdentity::load_or_generate(&config.identity_path)?;
        let scheduler = KeepAliveScheduler::new(config.protocol.keep_alive);
        let scheduler_task = scheduler.start();

        tracing::info!(
            target: "tether::server",
            addr = %listener.local_addr()?,
            fingerprint = %fingerprint(identity.public_key_der()),
            "server listening"
        );

        let shared = Arc::new(Shared {
            protocol: config.protocol.clone(),
            identity,
            registry: DashMap::new(),
            tasks: DashMap::new(),
            router: PacketRouter::new(),
            scheduler,
            events: ServerEvents::default(),
            broadcast_gate: Arc::new(Semaphore::new(config.broadcast_concurrency)),
            conn_cancel: CancellationToken::new(),
            pool: BufferPool::default(),
        });

        Ok(Self {
            config,
            listener,
            shared,
            accept_cancel: CancellationToken::new(),
            scheduler_task: parking_lot::Mutex::new(Some(scheduler_task)),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Identifier router for application packets.
    pub fn router(&self) -> &PacketRouter<Arc<Connection>> {
        &self.shared.router
    }

    /// Lifecycle notification hooks.
    pub fn events(&self) -> &ServerEvents {
        &self.shared.events
    }

    /// Colon-hex fingerprint of the server's identity key.
    pub fn identity_fingerprint(&self) -> String {
        fingerprint(self.shared.identity.public_key_der())
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Accept connections until [`Server::stop`] is called. Each accepted
    /// stream gets its own task for the handshake and read loop.
    pub async fn run(&self) {
        loop {
            let accepted = tokio::select! {
                _ = self.accept_cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(target: "tether::server", error = %err, "accept failed");
                    continue;
                }
            };

            let id = Uuid::new_v4();
            let shared = Arc::clone(&self.shared);
            // The task waits for its handle to be registered so that a
            // connection that dies instantly still cleans up its slot.
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(async move {
                let _ = ready_rx.await;
                serve_connection(shared, id, stream, peer).await;
            });
            self.shared.tasks.insert(id, task);
            let _ = ready_tx.send(());
        }
    }

    pub async fn send_to_client(&self, client: Uuid, packet: Packet) -> Result<(), ServerError> {
        let connection = self
            .shared
            .registry
            .get(&client)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ServerError::UnknownClient(client))?;
        Ok(connection.send(packet).await?)
    }

    /// Fan a packet out to every connected client, bounded by the broadcast
    /// gate. A failed send silently disconnects that client only.
    pub async fn broadcast(&self, packet: Packet) {
        if !packet.is_encrypted() {
            // Warm the envelope cache so every arm shares one serialization.
            let _ = packet.encode(self.shared.protocol.max_packet_size);
        }
        let arms: Vec<_> = self
            .shared
            .registry
            .iter()
            .map(|entry| {
                let connection = Arc::clone(entry.value());
                let packet = packet.clone();
                let gate = Arc::clone(&self.shared.broadcast_gate);
                tokio::spawn(async move {
                    let Ok(_permit) = gate.acquire_owned().await else {
                        return;
                    };
                    if let Err(err) = connection.send(packet).await {
                        tracing::debug!(
                            target: "tether::server",
                            client = %connection.id(),
                            error = %err,
                            "broadcast send failed, dropping client"
                        );
                        connection.disconnect_silent().await;
                    }
                })
            })
            .collect();
        for arm in arms {
            let _ = arm.await;
        }
    }

    /// Graceful shutdown: stop accepting, tell every client, then wait for
    /// per-client tasks up to the configured grace before force-closing the
    /// stragglers. Errors on this path are swallowed.
    pub async fn stop(&self) {
        tracing::info!(target: "tether::server", "server stopping");
        self.accept_cancel.cancel();

        let clients: Vec<Arc<Connection>> = self
            .shared
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let goodbyes: Vec<_> = clients
            .into_iter()
            .map(|connection| {
                tokio::spawn(async move { connection.disconnect(Some(SHUTDOWN_REASON)).await })
            })
            .collect();
        for goodbye in goodbyes {
            let _ = goodbye.await;
        }

        let ids: Vec<Uuid> = self.shared.tasks.iter().map(|entry| *entry.key()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, handle)) = self.shared.tasks.remove(&id) {
                handles.push(handle);
            }
        }
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(self.config.shutdown_grace, join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(target: "tether::server", "grace expired, force-closing remaining clients");
            for abort in aborts {
                abort.abort();
            }
        }

        let leftovers: Vec<Arc<Connection>> = self
            .shared
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in leftovers {
            connection.disconnect_silent().await;
        }
        self.shared.registry.clear();

        self.shared.scheduler.shutdown();
        if let Some(task) = self.scheduler_task.lock().take() {
            let _ = task.await;
        }
        self.shared.conn_cancel.cancel();
        tracing::info!(target: "tether::server", "server stopped");
    }
}

/// Per-connection supervisor: handshake, registration, read loop, cleanup.
async fn serve_connection(shared: Arc<Shared>, id: Uuid, stream: TcpStream, peer: std::net::SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let max_len = shared.protocol.max_packet_size;

    let handshake = tokio::time::timeout(
        shared.protocol.handshake_timeout,
        handshake::drive(
            &mut reader,
            &mut writer,
            &shared.identity,
            &shared.pool,
            max_len,
        ),
    )
    .await;
    let sealer = match handshake {
        Ok(Ok(sealer)) => sealer,
        Ok(Err(err)) => {
            tracing::warn!(target: "tether::server", %peer, error = %err, "handshake failed");
            shared.tasks.remove(&id);
            return;
        }
        Err(_) => {
            tracing::warn!(target: "tether::server", %peer, "handshake timed out");
            shared.tasks.remove(&id);
            return;
        }
    };

    let connection = Connection::new(
        id,
        peer,
        writer,
        Arc::new(sealer),
        RateLimiter::new(shared.protocol.rate_limits),
        shared.conn_cancel.child_token(),
        Arc::downgrade(&shared.scheduler),
        max_len,
    );
    shared.registry.insert(id, Arc::clone(&connection));
    shared
        .scheduler
        .register(Arc::clone(&connection) as Arc<dyn KeepAlivePeer>);
    shared.events.emit_connected(&connection);
    tracing::info!(target: "tether::server", client = %id, %peer, "client connected");

    connection
        .read_loop(&mut reader, &shared.pool, &shared.router, &shared.events)
        .await;

    shared.scheduler.unregister(connection.liveness_key());
    connection.disconnect_silent().await;
    shared.registry.remove(&id);
    shared.tasks.remove(&id);
    shared.events.emit_disconnected(&connection);
    tracing::info!(target: "tether::server", client = %id, %peer, "client disconnected");
}
