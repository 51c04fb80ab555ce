use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of the client's random challenge.
pub const CHALLENGE_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("expected a handshake packet, received identifier {0}")]
    UnexpectedPacket(u16),
    #[error("handshake field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("challenge must be {CHALLENGE_LEN} bytes, received {0}")]
    BadChallenge(usize),
    #[error("server signature does not verify against the pinned identity")]
    BadSignature,
    #[error("peer disconnected during the handshake")]
    PeerDisconnected,
}

/// Second handshake message: the client's challenge and ephemeral key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHandshake {
    pub challenge: Vec<u8>,
    pub client_ephemeral_key: Vec<u8>,
}

/// Third handshake message: the server's ephemeral key and its signature
/// over the whole transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHandshake {
    pub server_ephemeral_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Fresh 32-byte random challenge.
pub fn new_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// The byte string the identity signature covers:
/// `challenge ‖ client_ephemeral ‖ server_ephemeral`.
pub fn transcript(challenge: &[u8], client_ephemeral: &[u8], server_ephemeral: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(challenge.len() + client_ephemeral.len() + server_ephemeral.len());
    out.extend_from_slice(challenge);
    out.extend_from_slice(client_ephemeral);
    out.extend_from_slice(server_ephemeral);
    out
}

/// Verify a DER ECDSA-SHA256 signature over `message` against an
/// SPKI-encoded identity key. Every failure mode collapses into
/// [`HandshakeError::BadSignature`]: a malformed key or signature from the
/// wire is as untrustworthy as a wrong one.
pub fn verify_identity_signature(
    identity_public_der: &[u8],
    message: &[u8],
    signature_der: &[u8],
) -> Result<(), HandshakeError> {
    let key = VerifyingKey::from_public_key_der(identity_public_der)
        .map_err(|_| HandshakeError::BadSignature)?;
    let signature =
        Signature::from_der(signature_der).map_err(|_| HandshakeError::BadSignature)?;
    key.verify(message, &signature)
        .map_err(|_| HandshakeError::BadSignature)
}
