use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether_core::{
    decode_reason, encode_reason, frame, BufferPool, FrameError, KeepAlivePeer,
    KeepAliveScheduler, Packet, PacketError, PacketRouter, RateLimiter, SystemPacket,
};
use tether_crypto::{CryptoError, PacketSealer};

use crate::events::ServerEvents;

/// Budget for best-effort writes on the disconnect path; a peer that cannot
/// take a goodbye envelope this fast is treated as unreachable.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

const RATE_LIMIT_REASON: &str = "Rate limit exceeded.";

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Server-side state for one accepted, handshake-promoted stream.
///
/// The write half lives behind the send mutex; the read half is owned by the
/// connection's read loop. `disconnected` flips at most once, making every
/// disconnect path idempotent. The crypto sealer is bound at construction,
/// which only happens after a successful handshake, and never changes.
pub struct Connection {
    id: Uuid,
    peer: SocketAddr,
    liveness_key: u64,
    writer: Mutex<OwnedWriteHalf>,
    sealer: Arc<dyn PacketSealer>,
    limiter: RateLimiter,
    disconnected: AtomicBool,
    cancel: CancellationToken,
    liveness: Weak<KeepAliveScheduler>,
    max_packet_size: usize,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        sealer: Arc<dyn PacketSealer>,
        limiter: RateLimiter,
        cancel: CancellationToken,
        liveness: Weak<KeepAliveScheduler>,
        max_packet_size: usize,
    ) -> Arc<Self> {
        let mut key = [0u8; 8];
        key.copy_from_slice(&id.as_bytes()[..8]);
        Arc::new(Self {
            id,
            peer,
            liveness_key: u64::from_le_bytes(key),
            writer: Mutex::new(writer),
            sealer,
            limiter,
            disconnected: AtomicBool::new(false),
            cancel,
            liveness,
            max_packet_size,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Seal, encode and write one packet. Writes from concurrent producers
    /// are serialized by the send mutex, so a single producer's packets
    /// arrive in order.
    pub async fn send(&self, packet: Packet) -> Result<(), SendError> {
        if self.is_disconnected() {
            return Err(SendError::Closed);
        }
        let mut packet = packet;
        self.sealer.encrypt(&mut packet)?;
        let body = packet.encode(self.max_packet_size)?;

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(SendError::Closed),
            written = async {
                let mut writer = self.writer.lock().await;
                frame::write_frame(&mut *writer, &body, self.max_packet_size).await
            } => written?,
        }

        if let Some(scheduler) = self.liveness.upgrade() {
            scheduler.mark_sent(self.liveness_key);
        }
        Ok(())
    }

    /// Disconnect with a best-effort goodbye envelope, then the silent path.
    /// Idempotent: only the first caller does any work.
    pub async fn disconnect(&self, reason: Option<&str>) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send_goodbye(reason).await;
        self.teardown().await;
    }

    /// Disconnect without telling the peer, for paths where the peer is
    /// already gone or already asked for this.
    pub(crate) async fn disconnect_silent(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown().await;
    }

    async fn send_goodbye(&self, reason: Option<&str>) {
        let payload = reason.map(encode_reason).unwrap_or_default();
        let packet = Packet::system(SystemPacket::Disconnect, payload);
        let Ok(body) = packet.encode(self.max_packet_size) else {
            return;
        };
        let _ = tokio::time::timeout(GOODBYE_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            let _ = frame::write_frame(&mut *writer, &body, self.max_packet_size).await;
        })
        .await;
    }

    async fn teardown(&self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(GOODBYE_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        })
        .await;
    }

    /// Pump inbound frames until a terminal condition.
    ///
    /// Liveness is refreshed on every frame, keep-alives included. System
    /// packets bypass the rate limiter; a single limiter rejection ends the
    /// session with the policy reason. Decode and crypto failures are fatal.
    pub(crate) async fn read_loop(
        self: &Arc<Self>,
        reader: &mut OwnedReadHalf,
        pool: &BufferPool,
        router: &PacketRouter<Arc<Connection>>,
        events: &ServerEvents,
    ) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = frame::read_frame(reader, pool, self.max_packet_size) => frame,
            };

            let buf = match frame {
                Ok(Some(buf)) => buf,
                Ok(None) => {
                    self.mark_received();
                    continue;
                }
                Err(FrameError::ConnectionClosed) => {
                    tracing::debug!(target: "tether::server", client = %self.id, "peer closed the stream");
                    break;
                }
                Err(err) => {
                    tracing::warn!(target: "tether::server", client = %self.id, error = %err, "transport failure, dropping client");
                    break;
                }
            };

            self.mark_received();
            let frame_len = buf.len();
            let mut packet = match Packet::decode(&buf) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::warn!(target: "tether::server", client = %self.id, error = %err, "malformed envelope, dropping client");
                    break;
                }
            };
            drop(buf);

            if packet.is_reserved() {
                match packet.system_kind() {
                    Some(SystemPacket::KeepAlive) => {}
                    Some(SystemPacket::Disconnect) => {
                        let reason = decode_reason(packet.payload());
                        tracing::info!(
                            target: "tether::server",
                            client = %self.id,
                            reason = reason.as_deref().unwrap_or(""),
                            "client requested disconnect"
                        );
                        self.disconnect_silent().await;
                        break;
                    }
                    Some(SystemPacket::Handshake) | None => {
                        tracing::trace!(target: "tether::server", client = %self.id, identifier = packet.id(), "ignoring reserved packet");
                    }
                }
                continue;
            }

            if !self.limiter.try_consume(frame_len) {
                tracing::warn!(target: "tether::server", client = %self.id, "rate limit exceeded, dropping client");
                self.disconnect(Some(RATE_LIMIT_REASON)).await;
                break;
            }

            if let Err(err) = self.sealer.decrypt(&mut packet) {
                tracing::warn!(target: "tether::server", client = %self.id, error = %err, "packet failed authentication, dropping client");
                break;
            }

            events.emit_packet(self, &packet);
            if let Some(handler) = router.route(Arc::clone(self), packet) {
                handler.await;
            }
        }
    }

    fn mark_received(&self) {
        if let Some(scheduler) = self.liveness.upgrade() {
            scheduler.mark_received(self.liveness_key);
        }
    }
}

#[async_trait]
impl KeepAlivePeer for Connection {
    fn liveness_key(&self) -> u64 {
        self.liveness_key
    }

    async fn send_keep_alive(&self) {
        if self.is_disconnected() {
            return;
        }
        let written = tokio::select! {
            _ = self.cancel.cancelled() => return,
            written = async {
                let mut writer = self.writer.lock().await;
                frame::write_keep_alive(&mut *writer).await
            } => written,
        };
        match written {
            Ok(()) => {
                if let Some(scheduler) = self.liveness.upgrade() {
                    scheduler.mark_sent(self.liveness_key);
                }
            }
            Err(err) => {
                tracing::debug!(target: "tether::server", client = %self.id, error = %err, "keep-alive write failed");
                self.disconnect_silent().await;
            }
        }
    }

    async fn disconnect_idle(&self) {
        tracing::info!(target: "tether::server", client = %self.id, "disconnecting idle client");
        self.disconnect_silent().await;
    }
}
