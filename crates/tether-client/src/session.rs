use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tether_core::{
    decode_reason, frame, BufferPool, FrameError, KeepAlivePeer, KeepAliveScheduler, Packet,
    SystemPacket,
};
use tether_crypto::PacketSealer;

use crate::{Client, ClientError};

const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// One established client session: the write half, the bound sealer and the
/// liveness plumbing. Mirrors the server-side connection, minus the rate
/// limiter (the server polices, the client behaves).
pub(crate) struct Session {
    liveness_key: u64,
    writer: Mutex<OwnedWriteHalf>,
    sealer: Arc<dyn PacketSealer>,
    disconnected: AtomicBool,
    cancel: CancellationToken,
    liveness: Weak<KeepAliveScheduler>,
    max_packet_size: usize,
}

/// Why a session ended, as observed by the read loop.
pub(crate) enum SessionEnd {
    /// The server sent a `Disconnect` envelope, possibly with a reason.
    ServerRequested(Option<String>),
    /// Transport error, cancellation or local teardown.
    Silent,
}

impl Session {
    pub(crate) fn new(
        writer: OwnedWriteHalf,
        sealer: Arc<dyn PacketSealer>,
        liveness: Weak<KeepAliveScheduler>,
        max_packet_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            liveness_key: rand::random(),
            writer: Mutex::new(writer),
            sealer,
            disconnected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            liveness,
            max_packet_size,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) async fn send(&self, packet: Packet) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        let mut packet = packet;
        self.sealer.encrypt(&mut packet)?;
        let body = packet.encode(self.max_packet_size)?;

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(ClientError::NotConnected),
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

    /// Best-effort `Disconnect` envelope ahead of a local teardown.
    pub(crate) async fn send_goodbye(&self) {
        let packet = Packet::system(SystemPacket::Disconnect, Vec::new());
        let Ok(body) = packet.encode(self.max_packet_size) else {
            return;
        };
        let _ = tokio::time::timeout(GOODBYE_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            let _ = frame::write_frame(&mut *writer, &body, self.max_packet_size).await;
        })
        .await;
    }

    /// Idempotent teardown: cancel the loops and shut the stream down.
    pub(crate) async fn teardown(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let _ = tokio::time::timeout(GOODBYE_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        })
        .await;
    }

    /// Pump inbound frames until the server disconnects us, the transport
    /// dies or the session is cancelled.
    pub(crate) async fn read_loop(
        self: &Arc<Self>,
        reader: &mut OwnedReadHalf,
        pool: &BufferPool,
        client: &Client,
    ) -> SessionEnd {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Silent,
                frame = frame::read_frame(reader, pool, self.max_packet_size) => frame,
            };

            let buf = match frame {
                Ok(Some(buf)) => buf,
                Ok(None) => {
                    self.mark_received();
                    continue;
                }
                Err(FrameError::ConnectionClosed) => {
                    tracing::debug!(target: "tether::client", "server closed the stream");
                    return SessionEnd::Silent;
                }
                Err(err) => {
                    tracing::warn!(target: "tether::client", error = %err, "transport failure");
                    return SessionEnd::Silent;
                }
            };

            self.mark_received();
            let mut packet = match Packet::decode(&buf) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::warn!(target: "tether::client", error = %err, "malformed envelope from server");
                    return SessionEnd::Silent;
                }
            };
            drop(buf);

            if packet.is_reserved() {
                match packet.system_kind() {
                    Some(SystemPacket::KeepAlive) => {}
                    Some(SystemPacket::Disconnect) => {
                        let reason = decode_reason(packet.payload());
                        tracing::info!(
                            target: "tether::client",
                            reason = reason.as_deref().unwrap_or(""),
                            "server requested disconnect"
                        );
                        return SessionEnd::ServerRequested(reason);
                    }
                    Some(SystemPacket::Handshake) | None => {
                        tracing::trace!(target: "tether::client", identifier = packet.id(), "ignoring reserved packet");
                    }
                }
                continue;
            }

            if let Err(err) = self.sealer.decrypt(&mut packet) {
                tracing::warn!(target: "tether::client", error = %err, "packet failed authentication");
                return SessionEnd::Silent;
            }

            client.dispatch(packet).await;
        }
    }

    fn mark_received(&self) {
        if let Some(scheduler) = self.liveness.upgrade() {
            scheduler.mark_received(self.liveness_key);
        }
    }
}

#[async_trait]
impl KeepAlivePeer for Session {
    fn liveness_key(&self) -> u64 {
        self.liveness_key
    }

    async fn send_keep_alive(&self) {
        if self.is_closed() {
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
                tracing::debug!(target: "tether::client", error = %err, "keep-alive write failed");
                self.teardown().await;
            }
        }
    }

    async fn disconnect_idle(&self) {
        tracing::info!(target: "tether::client", "server went silent past the timeout");
        self.teardown().await;
    }
}
