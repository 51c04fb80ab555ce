use std::sync::Arc;

use parking_lot::RwLock;

use tether_core::Packet;

use crate::connection::Connection;

type ConnectionHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type PacketHook = Arc<dyn Fn(&Arc<Connection>, &Packet) + Send + Sync>;

/// Multi-subscriber notification hooks for server lifecycle events.
///
/// Subscribers run inline on the task that raised the event, so they must
/// not block; expensive work belongs in a queue the subscriber owns.
#[derive(Default)]
pub struct ServerEvents {
    connected: RwLock<Vec<ConnectionHook>>,
    disconnected: RwLock<Vec<ConnectionHook>>,
    packets: RwLock<Vec<PacketHook>>,
}

impl ServerEvents {
    pub fn on_client_connected<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.connected.write().push(Arc::new(hook));
    }

    pub fn on_client_disconnected<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.disconnected.write().push(Arc::new(hook));
    }

    pub fn on_packet_received<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>, &Packet) + Send + Sync + 'static,
    {
        self.packets.write().push(Arc::new(hook));
    }

    pub(crate) fn emit_connected(&self, connection: &Arc<Connection>) {
        for hook in self.connected.read().iter() {
            hook(connection);
        }
    }

    pub(crate) fn emit_disconnected(&self, connection: &Arc<Connection>) {
        for hook in self.disconnected.read().iter() {
            hook(connection);
        }
    }

    pub(crate) fn emit_packet(&self, connection: &Arc<Connection>, packet: &Packet) {
        for hook in self.packets.read().iter() {
            hook(connection, packet);
        }
    }
}
