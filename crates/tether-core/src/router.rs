use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;

use crate::packet::{Packet, PacketId};

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type PacketHandler<C> = Arc<dyn Fn(C, Packet) -> HandlerFuture + Send + Sync>;

/// Maps application packet identifiers to handler callbacks.
///
/// Registration may happen at any time, including while other tasks are
/// dispatching; lookups go through sharded map reads and never block
/// writers on the happy path. Registering `None` is an explicit ignore.
pub struct PacketRouter<C> {
    handlers: DashMap<u16, Option<PacketHandler<C>>>,
}

impl<C> PacketRouter<C> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, id: PacketId, handler: Option<PacketHandler<C>>) {
        self.handlers.insert(id.raw(), handler);
    }

    /// Convenience wrapper that boxes an async closure.
    pub fn register_fn<F, Fut>(&self, id: PacketId, handler: F)
    where
        F: Fn(C, Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: PacketHandler<C> =
            Arc::new(move |ctx, packet| Box::pin(handler(ctx, packet)));
        self.register(id, Some(handler));
    }

    /// Look up the handler for `packet` and hand back its future.
    ///
    /// Unknown identifiers are diagnosed but not fatal; a slot registered
    /// with no handler swallows the packet silently.
    pub fn route(&self, ctx: C, packet: Packet) -> Option<HandlerFuture> {
        match self.handlers.get(&packet.id()) {
            Some(slot) => slot.as_ref().map(|handler| handler(ctx, packet)),
            None => {
                tracing::debug!(
                    target: "tether::router",
                    identifier = packet.id(),
                    "no handler registered for packet identifier"
                );
                None
            }
        }
    }
}

impl<C> Default for PacketRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}
