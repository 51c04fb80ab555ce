//! Core transport primitives for Tether.
//!
//! This crate carries everything both sides of a connection share: the
//! length-prefixed framing codec, the packet envelope and its typed view,
//! the identifier router, the keep-alive scheduler and the per-client rate
//! limiter. Anything touching keys or sockets end-to-end lives in the
//! `tether-crypto`, `tether-server` and `tether-client` crates.

pub mod codec;
pub mod config;
pub mod frame;
pub mod keepalive;
pub mod limiter;
pub mod packet;
pub mod pool;
pub mod router;

pub use codec::{
    decode_reason, encode_reason, from_slice as codec_from_slice, to_vec as codec_to_vec,
    Error as CodecError,
};
pub use config::{KeepAliveConfig, ProtocolConfig, DEFAULT_MAX_PACKET_SIZE};
pub use frame::{read_frame, write_frame, write_keep_alive, FrameError, LEN_PREFIX_LEN};
pub use keepalive::{KeepAlivePeer, KeepAliveScheduler};
pub use limiter::{RateLimiter, RateLimits};
pub use packet::{
    Packet, PacketError, PacketId, SystemPacket, TypedPacket, RESERVED_ID_MAX,
};
pub use pool::{BufferPool, PooledBuf};
pub use router::{HandlerFuture, PacketHandler, PacketRouter};
