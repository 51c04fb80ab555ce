use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use tether_core::Packet;

/// Nonce length for the packet AEAD (96-bit).
pub const NONCE_LEN: usize = 12;
/// Authentication tag length (128-bit).
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to encrypt packet payload")]
    Encrypt,
    #[error("failed to authenticate packet payload")]
    Decrypt,
    #[error("invalid session key material")]
    KeyInit,
    #[error("encrypted payload shorter than nonce and tag")]
    Truncated,
}

/// The crypto capability of a connection: seal outbound payloads, open
/// inbound ones. Bound once, at handshake completion.
///
/// Packets whose `encrypted` flag is clear pass through both methods
/// untouched.
pub trait PacketSealer: Send + Sync {
    fn encrypt(&self, packet: &mut Packet) -> Result<(), CryptoError>;
    fn decrypt(&self, packet: &mut Packet) -> Result<(), CryptoError>;
}

/// No-op sealer for the pre-handshake window.
#[derive(Debug, Default)]
pub struct PlaintextSealer;

impl PacketSealer for PlaintextSealer {
    fn encrypt(&self, _packet: &mut Packet) -> Result<(), CryptoError> {
        Ok(())
    }

    fn decrypt(&self, _packet: &mut Packet) -> Result<(), CryptoError> {
        Ok(())
    }
}

/// AES-256-GCM sealer over the session key derived from the handshake.
///
/// Each encrypted payload becomes `nonce ‖ tag ‖ ciphertext`
/// (12 + 16 + n bytes) under a fresh random nonce.
pub struct AeadSealer {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AeadSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadSealer").finish_non_exhaustive()
    }
}

impl AeadSealer {
    pub fn new(mut key: [u8; 32]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::KeyInit)?;
        key.zeroize();
        Ok(Self { cipher })
    }
}

impl PacketSealer for AeadSealer {
    fn encrypt(&self, packet: &mut Packet) -> Result<(), CryptoError> {
        if !packet.is_encrypted() {
            return Ok(());
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), packet.payload())
            .map_err(|_| CryptoError::Encrypt)?;

        // The cipher emits ciphertext followed by the tag; the wire layout
        // puts the tag in front of the ciphertext.
        let split = sealed.len() - TAG_LEN;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed[split..]);
        out.extend_from_slice(&sealed[..split]);
        packet.replace_payload(out);
        Ok(())
    }

    fn decrypt(&self, packet: &mut Packet) -> Result<(), CryptoError> {
        if !packet.is_encrypted() {
            return Ok(());
        }

        let payload = packet.payload();
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, rest) = payload.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut joined = Vec::with_capacity(rest.len());
        joined.extend_from_slice(ciphertext);
        joined.extend_from_slice(tag);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), joined.as_slice())
            .map_err(|_| CryptoError::Decrypt)?;
        packet.replace_payload(plain);
        Ok(())
    }
}
