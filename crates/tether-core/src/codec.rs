//! Wire codec for envelope and handshake records.
//!
//! Everything that crosses the wire inside a frame body is one CBOR value:
//! the envelope triple, a handshake record, or a disconnect reason. A frame
//! carries exactly one record, so decoding enforces that the whole buffer is
//! consumed; leftover bytes mean a corrupt or hostile frame, not padding.

use std::io::Cursor;

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("record does not fit the wire codec: {0}")]
    Encode(String),
    #[error("malformed wire record: {0}")]
    Decode(String),
    #[error("wire record leaves {0} trailing bytes undecoded")]
    TrailingBytes(usize),
}

/// Encode one record as a single CBOR value.
pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, Error>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|err| Error::Encode(err.to_string()))?;
    Ok(buf)
}

/// Decode one record, requiring it to span the entire buffer.
pub fn from_slice<T>(bytes: &[u8]) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    let mut cursor = Cursor::new(bytes);
    let value =
        ciborium::de::from_reader(&mut cursor).map_err(|err| Error::Decode(err.to_string()))?;
    let consumed = cursor.position() as usize;
    if consumed < bytes.len() {
        return Err(Error::TrailingBytes(bytes.len() - consumed));
    }
    Ok(value)
}

/// Encode a human-readable reason for a `Disconnect` payload. The goodbye
/// path is best-effort, so this never fails; a reason that somehow cannot
/// encode becomes the empty payload.
pub fn encode_reason(reason: &str) -> Vec<u8> {
    to_vec(&reason).unwrap_or_default()
}

/// Decode the optional reason carried by a `Disconnect` payload. An empty
/// or undecodable payload is simply no reason.
pub fn decode_reason(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }
    from_slice(payload).ok()
}
