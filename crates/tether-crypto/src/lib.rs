//! Identity and session crypto for Tether.
//!
//! Covers the long-term server signing identity, the client's
//! trust-on-first-use store, ephemeral ECDH key agreement, the AEAD packet
//! sealer installed after a handshake, and the handshake message types
//! themselves. The handshake *drivers* live with the sockets, in
//! `tether-server` and `tether-client`.

pub mod handshake;
pub mod identity;
pub mod kex;
mod persist;
pub mod seal;
pub mod trust;

pub use handshake::{
    new_challenge, transcript, verify_identity_signature, ClientHandshake, HandshakeError,
    ServerHandshake, CHALLENGE_LEN,
};
pub use identity::{IdentityError, ServerIdentity};
pub use kex::{EphemeralKeyPair, KexError};
pub use seal::{AeadSealer, CryptoError, PacketSealer, PlaintextSealer, NONCE_LEN, TAG_LEN};
pub use trust::{fingerprint, KnownServer, TrustError, TrustStore};
