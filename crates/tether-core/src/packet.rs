use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::codec::{self, Error as CodecError};

/// Identifiers `0..=RESERVED_ID_MAX` belong to the protocol itself.
pub const RESERVED_ID_MAX: u16 = 100;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("identifier {0} is inside the reserved system range")]
    ReservedIdentifier(u16),
    #[error("encoded envelope is {len} bytes, limit {max}")]
    TooLarge { len: usize, max: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Application-facing packet identifier.
///
/// Construction rejects the reserved system range; system identifiers are
/// only reachable through [`SystemPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(u16);

impl PacketId {
    pub fn application(raw: u16) -> Result<Self, PacketError> {
        if raw <= RESERVED_ID_MAX {
            return Err(PacketError::ReservedIdentifier(raw));
        }
        Ok(Self(raw))
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

/// The closed set of system packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemPacket {
    Handshake = 1,
    Disconnect = 2,
    KeepAlive = 3,
}

impl SystemPacket {
    pub const fn raw(self) -> u16 {
        self as u16
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Handshake),
            2 => Some(Self::Disconnect),
            3 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

/// On-wire shape of the envelope: the ordered triple.
#[derive(Serialize, Deserialize)]
struct WireEnvelope(u16, bool, Vec<u8>);

/// The envelope exchanged inside every non-keep-alive frame.
///
/// Serialized bytes are cached so a broadcast does not re-encode per
/// receiver; the cache is dropped whenever the payload is replaced (which is
/// what encryption does).
#[derive(Debug)]
pub struct Packet {
    id: u16,
    encrypted: bool,
    payload: Vec<u8>,
    cached: OnceCell<Bytes>,
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            encrypted: self.encrypted,
            payload: self.payload.clone(),
            cached: self.cached.clone(),
        }
    }
}

impl Packet {
    pub fn new(id: PacketId, encrypted: bool, payload: Vec<u8>) -> Self {
        Self {
            id: id.raw(),
            encrypted,
            payload,
            cached: OnceCell::new(),
        }
    }

    /// Build an application packet whose payload is an encoded record.
    pub fn from_record<T: Serialize>(
        id: PacketId,
        encrypted: bool,
        record: &T,
    ) -> Result<Self, PacketError> {
        Ok(Self::new(id, encrypted, codec::to_vec(record)?))
    }

    /// Build a system packet. System traffic is never encrypted.
    pub fn system(kind: SystemPacket, payload: Vec<u8>) -> Self {
        Self {
            id: kind.raw(),
            encrypted: false,
            payload,
            cached: OnceCell::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_reserved(&self) -> bool {
        self.id <= RESERVED_ID_MAX
    }

    pub fn system_kind(&self) -> Option<SystemPacket> {
        SystemPacket::from_raw(self.id)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Swap in a new payload, invalidating any cached serialization.
    pub fn replace_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
        self.cached.take();
    }

    /// Serialize the envelope, enforcing the size limit. The result is cached
    /// and shared by clones made afterwards.
    pub fn encode(&self, max_len: usize) -> Result<Bytes, PacketError> {
        let bytes = self.cached.get_or_try_init(|| {
            let wire = WireEnvelope(self.id, self.encrypted, self.payload.clone());
            codec::to_vec(&wire).map(Bytes::from)
        })?;
        if bytes.len() > max_len {
            return Err(PacketError::TooLarge {
                len: bytes.len(),
                max: max_len,
            });
        }
        Ok(bytes.clone())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let WireEnvelope(id, encrypted, payload) = codec::from_slice(bytes)?;
        Ok(Self {
            id,
            encrypted,
            payload,
            cached: OnceCell::new(),
        })
    }

    /// Wrap the packet in a lazily decoded typed view.
    pub fn view<T: DeserializeOwned>(self) -> TypedPacket<T> {
        TypedPacket {
            packet: self,
            record: OnceCell::new(),
        }
    }
}

/// A typed view over an envelope payload.
///
/// The record is decoded at most once, on first access; the raw payload is
/// kept as-is and is never re-encoded on resend.
#[derive(Debug)]
pub struct TypedPacket<T> {
    packet: Packet,
    record: OnceCell<T>,
}

impl<T: DeserializeOwned> TypedPacket<T> {
    pub fn record(&self) -> Result<&T, CodecError> {
        self.record
            .get_or_try_init(|| codec::from_slice(self.packet.payload()))
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn into_packet(self) -> Packet {
        self.packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_id(raw: u16) -> PacketId {
        PacketId::application(raw).expect("valid application id")
    }

    #[test]
    fn application_ids_reject_the_reserved_range() {
        assert!(matches!(
            PacketId::application(0),
            Err(PacketError::ReservedIdentifier(0))
        ));
        assert!(matches!(
            PacketId::application(100),
            Err(PacketError::ReservedIdentifier(100))
        ));
        assert_eq!(PacketId::application(101).expect("valid").raw(), 101);
    }

    #[test]
    fn envelope_roundtrips() {
        let packet = Packet::new(app_id(200), true, b"payload".to_vec());
        let bytes = packet.encode(1024).expect("encode");
        let back = Packet::decode(&bytes).expect("decode");
        assert_eq!(back.id(), 200);
        assert!(back.is_encrypted());
        assert_eq!(back.payload(), b"payload");
    }

    #[test]
    fn encode_enforces_the_limit() {
        let packet = Packet::new(app_id(101), false, vec![0u8; 512]);
        assert!(packet.encode(16).is_err());
        assert!(packet.encode(1024).is_ok());
    }

    #[test]
    fn replacing_the_payload_invalidates_the_cache() {
        let mut packet = Packet::new(app_id(101), true, b"plain".to_vec());
        let first = packet.encode(1024).expect("encode");
        packet.replace_payload(b"sealed".to_vec());
        let second = packet.encode(1024).expect("encode");
        assert_ne!(first, second);
        let back = Packet::decode(&second).expect("decode");
        assert_eq!(back.payload(), b"sealed");
    }

    #[test]
    fn clones_share_the_cached_encoding() {
        let packet = Packet::new(app_id(150), false, b"broadcast".to_vec());
        let encoded = packet.encode(1024).expect("encode");
        let clone = packet.clone();
        let from_clone = clone.encode(1024).expect("encode clone");
        // Bytes clones share storage, so the broadcast path serializes once.
        assert_eq!(encoded.as_ptr(), from_clone.as_ptr());
    }

    #[test]
    fn typed_view_decodes_lazily_and_once() {
        let packet =
            Packet::from_record(app_id(101), false, &"Hello".to_string()).expect("packet");
        let view = packet.view::<String>();
        assert_eq!(view.record().expect("decode"), "Hello");
        assert_eq!(view.record().expect("cached"), "Hello");
    }

    #[test]
    fn system_ids_map_both_ways() {
        assert_eq!(SystemPacket::from_raw(1), Some(SystemPacket::Handshake));
        assert_eq!(SystemPacket::from_raw(2), Some(SystemPacket::Disconnect));
        assert_eq!(SystemPacket::from_raw(3), Some(SystemPacket::KeepAlive));
        assert_eq!(SystemPacket::from_raw(4), None);
        assert_eq!(SystemPacket::KeepAlive.raw(), 3);
    }
}
