use p256::ecdh::EphemeralSecret;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::PublicKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum KexError {
    #[error("peer public key is not a valid P-256 SPKI encoding")]
    InvalidPeerKey,
    #[error("failed to encode ephemeral public key")]
    Encode,
}

/// One-shot ephemeral ECDH key pair over P-256.
///
/// Deriving the session key consumes the pair, so a secret can never be
/// reused across handshakes.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public_der: Vec<u8>,
}

impl EphemeralKeyPair {
    pub fn generate() -> Result<Self, KexError> {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_der = secret
            .public_key()
            .to_public_key_der()
            .map_err(|_| KexError::Encode)?
            .as_bytes()
            .to_vec();
        Ok(Self { secret, public_der })
    }

    /// SubjectPublicKeyInfo encoding of the ephemeral public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Run the key agreement against the peer's SPKI-encoded public key and
    /// hash the shared secret down to the 32-byte session key.
    pub fn derive_shared_key(self, peer_public_der: &[u8]) -> Result<[u8; 32], KexError> {
        let peer = PublicKey::from_public_key_der(peer_public_der)
            .map_err(|_| KexError::InvalidPeerKey)?;
        let shared = self.secret.diffie_hellman(&peer);
        let digest = Sha256::digest(shared.raw_secret_bytes());
        Ok(digest.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_session_key() {
        let client = EphemeralKeyPair::generate().expect("client pair");
        let server = EphemeralKeyPair::generate().expect("server pair");

        let client_pub = client.public_key_der().to_vec();
        let server_pub = server.public_key_der().to_vec();

        let client_key = client.derive_shared_key(&server_pub).expect("client derive");
        let server_key = server.derive_shared_key(&client_pub).expect("server derive");
        assert_eq!(client_key, server_key);
    }

    #[test]
    fn distinct_pairs_disagree() {
        let a = EphemeralKeyPair::generate().expect("pair a");
        let b = EphemeralKeyPair::generate().expect("pair b");
        let c = EphemeralKeyPair::generate().expect("pair c");

        let b_pub = b.public_key_der().to_vec();
        let key_ab = a.derive_shared_key(&b_pub).expect("derive ab");
        let key_cb = c.derive_shared_key(&b_pub).expect("derive cb");
        assert_ne!(key_ab, key_cb);
    }

    #[test]
    fn garbage_peer_key_is_rejected() {
        let pair = EphemeralKeyPair::generate().expect("pair");
        assert!(matches!(
            pair.derive_shared_key(b"not an spki blob"),
            Err(KexError::InvalidPeerKey)
        ));
    }
}
