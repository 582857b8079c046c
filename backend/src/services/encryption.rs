//! Archive encryption.
//!
//! AES-256-GCM with a key derived from the configured passphrase via
//! HMAC-SHA256 over a fixed context string.
//!
//! Ciphertext format: nonce (12 bytes) || AES-GCM ciphertext+tag

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

const KDF_CONTEXT: &[u8] = b"backup-orchestrator/archive-encryption/aes-256-gcm/v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Suffix appended to encrypted archive names.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
}

impl From<EncryptionError> for AppError {
    fn from(e: EncryptionError) -> Self {
        AppError::Internal(e.to_string())
    }
}

fn derive_key(passphrase: &str) -> std::result::Result<[u8; 32], EncryptionError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(passphrase.as_bytes())
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
    mac.update(KDF_CONTEXT);
    Ok(mac.finalize().into_bytes().into())
}

pub struct ArchiveEncryption {
    cipher: Aes256Gcm,
}

impl ArchiveEncryption {
    pub fn from_passphrase(passphrase: &str) -> std::result::Result<Self, EncryptionError> {
        let key = derive_key(passphrase)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, EncryptionError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> std::result::Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::CiphertextTooShort);
        }
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| EncryptionError::DecryptionFailed)
    }
}

/// Encrypt `archive` into a sibling file with the `.enc` suffix and return
/// its path. The plaintext file is removed.
pub async fn encrypt_file(archive: &Path, passphrase: Option<&str>) -> Result<PathBuf> {
    let passphrase = passphrase.ok_or_else(|| {
        AppError::Dependency(
            "policy requires encryption but no encryption key is configured".into(),
        )
    })?;
    let encryption = ArchiveEncryption::from_passphrase(passphrase)?;

    let mut target = archive.as_os_str().to_owned();
    target.push(ENCRYPTED_SUFFIX);
    let target = PathBuf::from(target);

    let plaintext = tokio::fs::read(archive).await?;
    let ciphertext = tokio::task::spawn_blocking(move || encryption.encrypt(&plaintext))
        .await
        .map_err(|e| AppError::Internal(format!("encryption task failed: {}", e)))??;
    tokio::fs::write(&target, ciphertext).await?;
    tokio::fs::remove_file(archive).await?;

    Ok(target)
}
