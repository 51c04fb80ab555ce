use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::persist::write_atomic;

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trust store is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A pinned server: first-contact fingerprint for a host and port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownServer {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Fingerprint")]
    pub fingerprint: String,
}

/// Trust-on-first-use store backed by `known_servers.json`.
///
/// The whole record list is re-serialized on every change, under a single
/// lock, through a temp file and an atomic rename.
pub struct TrustStore {
    path: PathBuf,
    known: Mutex<Vec<KnownServer>>,
}

impl TrustStore {
    /// Load the store at `path`. A missing file is an empty store; a present
    /// but unparseable file is an error rather than silently discarded
    /// pinning data.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrustError> {
        let path = path.as_ref().to_path_buf();
        let known = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            known: Mutex::new(known),
        })
    }

    /// Apply TOFU policy to `public_key_der` for `(host, port)`.
    ///
    /// A known endpoint returns whether the fingerprint still matches; an
    /// unknown endpoint is recorded, persisted and trusted.
    pub fn verify_or_trust(
        &self,
        host: &str,
        port: u16,
        public_key_der: &[u8],
    ) -> Result<bool, TrustError> {
        let observed = fingerprint(public_key_der);
        let mut known = self.known.lock();

        if let Some(record) = known
            .iter()
            .find(|record| record.host == host && record.port == port)
        {
            return Ok(record.fingerprint == observed);
        }

        known.push(KnownServer {
            host: host.to_string(),
            port,
            fingerprint: observed.clone(),
        });
        write_atomic(&self.path, &serde_json::to_vec_pretty(&*known)?)?;
        tracing::info!(
            target: "tether::trust",
            host,
            port,
            fingerprint = %observed,
            "recorded new server fingerprint on first contact"
        );
        Ok(true)
    }

    /// The pinned fingerprint for an endpoint, if any.
    pub fn lookup(&self, host: &str, port: u16) -> Option<String> {
        self.known
            .lock()
            .iter()
            .find(|record| record.host == host && record.port == port)
            .map(|record| record.fingerprint.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// SHA-256 fingerprint of a public-key encoding, rendered as uppercase
/// colon-separated hex.
pub fn fingerprint(public_key_der: &[u8]) -> String {
    let digest = Sha256::digest(public_key_der);
    let mut out = String::with_capacity(digest.len() * 3 - 1);
    for (index, byte) in digest.iter().enumerate() {
        if index > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_uppercase_colon_hex() {
        let fp = fingerprint(b"some public key");
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp
            .chars()
            .all(|c| c == ':' || c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        // Deterministic for the same input.
        assert_eq!(fp, fingerprint(b"some public key"));
    }

    #[test]
    fn first_contact_records_and_trusts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_servers.json");
        let store = TrustStore::open(&path).expect("open");

        assert!(store
            .verify_or_trust("localhost", 25565, b"key-a")
            .expect("trust"));
        assert_eq!(store.lookup("localhost", 25565), Some(fingerprint(b"key-a")));

        // Reload from disk and match the same key.
        let reloaded = TrustStore::open(&path).expect("reload");
        assert!(reloaded
            .verify_or_trust("localhost", 25565, b"key-a")
            .expect("verify"));
    }

    #[test]
    fn mismatched_key_is_rejected_and_nothing_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_servers.json");
        let store = TrustStore::open(&path).expect("open");
        assert!(store
            .verify_or_trust("localhost", 25565, b"key-a")
            .expect("trust"));
        let before = fs::read(&path).expect("read store");

        assert!(!store
            .verify_or_trust("localhost", 25565, b"key-b")
            .expect("verify"));
        let after = fs::read(&path).expect("read store");
        assert_eq!(before, after);
    }

    #[test]
    fn endpoints_are_pinned_independently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TrustStore::open(dir.path().join("known_servers.json")).expect("open");

        assert!(store
            .verify_or_trust("localhost", 25565, b"key-a")
            .expect("trust"));
        assert!(store
            .verify_or_trust("localhost", 25566, b"key-b")
            .expect("trust"));
        assert!(!store
            .verify_or_trust("localhost", 25566, b"key-a")
            .expect("verify"));
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_servers.json");
        fs::write(&path, b"[{ truncated").expect("write garbage");
        assert!(matches!(TrustStore::open(&path), Err(TrustError::Parse(_))));
    }
}
