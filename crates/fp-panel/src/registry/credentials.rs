//! Sealing of stored node passwords
//!
//! AES-256-GCM with a key file owned by the control plane. Sealed values are
//! `base64(nonce || ciphertext)`.

use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

use fp_core::PanelError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn from_key(key: &[u8]) -> Result<Self, PanelError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            PanelError::Storage(format!("credential key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self { cipher })
    }

    /// Throwaway key; sealed values do not survive the process
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Load the key at `path`, generating it (mode 0600) on first use
    pub fn load_or_create(path: &Path) -> Result<Self, PanelError> {
        if path.exists() {
            let key = std::fs::read(path)
                .map_err(|e| PanelError::Storage(format!("{}: {}", path.display(), e)))?;
            return Self::from_key(&key);
        }

        tracing::info!("Generating credential key at {:?}", path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PanelError::Storage(format!("{}: {}", parent.display(), e)))?;
        }
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        write_private(path, &key)?;
        Self::from_key(&key)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, PanelError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| PanelError::Storage("credential encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, PanelError> {
        let raw = STANDARD
            .decode(sealed)
            .map_err(|_| PanelError::Storage("sealed credential is not base64".into()))?;
        if raw.len() <= NONCE_LEN {
            return Err(PanelError::Storage("sealed credential is truncated".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                PanelError::Storage("stored credential cannot be decrypted with this key".into())
            })?;
        String::from_utf8(plaintext)
            .map_err(|_| PanelError::Storage("stored credential is not UTF-8".into()))
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), PanelError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| PanelError::Storage(format!("{}: {}", path.display(), e)))?;
    file.write_all(bytes)
        .map_err(|e| PanelError::Storage(format!("{}: {}", path.display(), e)))
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), PanelError> {
    std::fs::write(path, bytes).map_err(|e| PanelError::Storage(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let cipher = CredentialCipher::ephemeral();
        let sealed = cipher.seal("hunter2").unwrap();
        assert!(!sealed.contains("hunter2"));
        assert_ne!(sealed, cipher.seal("hunter2").unwrap());
        assert_eq!(cipher.open(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn other_key_cannot_open() {
        let sealed = CredentialCipher::ephemeral().seal("secret").unwrap();
        assert!(CredentialCipher::ephemeral().open(&sealed).is_err());
        assert!(CredentialCipher::ephemeral().open("AAAA").is_err());
    }

    #[test]
    fn key_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("credential.key");
        let sealed = CredentialCipher::load_or_create(&path)
            .unwrap()
            .seal("pw")
            .unwrap();
        let reopened = CredentialCipher::load_or_create(&path).unwrap();
        assert_eq!(reopened.open(&sealed).unwrap(), "pw");
        assert_eq!(std::fs::read(&path).unwrap().len(), KEY_LEN);
    }
}
