use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use p256::SecretKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::persist::write_atomic;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode identity key material")]
    Encode,
    #[error("failed to serialize identity file: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    #[serde(rename = "PrivateKey")]
    private_key: String,
    #[serde(rename = "PublicKey")]
    public_key: String,
}

/// Long-term ECDSA-P256 signing identity of a server.
///
/// Loaded from disk when present, generated and persisted on first run. The
/// private key is stored as base64 SEC1 DER, the public key as base64 SPKI.
pub struct ServerIdentity {
    path: PathBuf,
    signing: SigningKey,
    public_der: Vec<u8>,
}

impl ServerIdentity {
    /// Load the identity at `path`, or generate and persist a fresh pair if
    /// the file is absent or unreadable.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref().to_path_buf();
        match Self::load(&path) {
            Some(identity) => Ok(identity),
            None => Self::generate(path),
        }
    }

    fn load(path: &Path) -> Option<ServerIdentity> {
        let raw = fs::read(path).ok()?;
        let file: IdentityFile = serde_json::from_slice(&raw).ok()?;
        let der = BASE64_STANDARD.decode(file.private_key).ok()?;
        let secret = SecretKey::from_sec1_der(&der).ok()?;
        let public_der = spki_bytes(&secret)?;
        Some(ServerIdentity {
            path: path.to_path_buf(),
            signing: SigningKey::from(secret),
            public_der,
        })
    }

    fn generate(path: PathBuf) -> Result<Self, IdentityError> {
        let secret = SecretKey::random(&mut OsRng);
        let private_der = secret.to_sec1_der().map_err(|_| IdentityError::Encode)?;
        let public_der = spki_bytes(&secret).ok_or(IdentityError::Encode)?;

        let file = IdentityFile {
            private_key: BASE64_STANDARD.encode(private_der.as_slice()),
            public_key: BASE64_STANDARD.encode(&public_der),
        };
        write_atomic(&path, &serde_json::to_vec_pretty(&file)?)?;
        tracing::info!(
            target: "tether::identity",
            path = %path.display(),
            "generated new server identity key pair"
        );

        Ok(Self {
            path,
            signing: SigningKey::from(secret),
            public_der,
        })
    }

    /// SubjectPublicKeyInfo encoding of the identity public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// ECDSA-SHA256 signature over `message`, DER encoded.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing.sign(message);
        signature.to_der().as_bytes().to_vec()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn spki_bytes(secret: &SecretKey) -> Option<Vec<u8>> {
    let document = secret.public_key().to_public_key_der().ok()?;
    Some(document.as_bytes().to_vec())
}
