//! Password-encrypted credential artifacts.
//!
//! This module provides:
//! - [`EncryptedArtifact`] - The persisted `{salt, iterations, nonce, ciphertext, tag}` record
//! - [`CredentialVault`] - Seals and opens artifacts with a password-derived key
//!
//! # Artifact Format
//!
//! A flat binary layout, integers big-endian:
//!
//! ```text
//! magic "MGV1" (4) | iterations u32 (4) | salt (16) | nonce (12) | ciphertext (n) | tag (16)
//! ```
//!
//! The 36-byte header is authenticated as AEAD associated data, so a flipped
//! bit anywhere in the artifact fails decryption.
//!
//! # Example
//!
//! ```rust
//! use mailgate_core::vault::CredentialVault;
//!
//! let vault = CredentialVault::with_iterations(1_000);
//! let artifact = vault.encrypt(b"{\"installed\":{}}", b"correct").unwrap();
//!
//! let plaintext = vault.decrypt(&artifact, b"correct").unwrap();
//! assert_eq!(&plaintext[..], b"{\"installed\":{}}");
//! assert!(vault.decrypt(&artifact, b"wrong").is_err());
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::kdf::{self, DEFAULT_ITERATIONS, SALT_LEN};

const MAGIC: &[u8; 4] = b"MGV1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 4 + SALT_LEN + NONCE_LEN;
const ITERATIONS_RANGE: std::ops::Range<usize> = 4..8;

/// Largest round count accepted when parsing an artifact.
pub const MAX_ITERATIONS: u32 = 50_000_000;

/// Error type for vault operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    /// Bad KDF parameters or an unusable artifact location.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The password is wrong or the artifact is damaged.
    ///
    /// The two cases are deliberately indistinguishable.
    #[error("wrong password or corrupt data")]
    WrongPasswordOrCorruptData,

    /// No artifact exists at the given path.
    #[error("artifact not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// Reading or writing the artifact file failed.
    #[error("I/O error on {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

/// A sealed credential blob, ready for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedArtifact {
    iterations: u32,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
    tag: [u8; TAG_LEN],
}

impl EncryptedArtifact {
    /// PBKDF2 round count the artifact was sealed with.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// The artifact's salt.
    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    fn header(iterations: u32, salt: &[u8; SALT_LEN], nonce: &[u8; NONCE_LEN]) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(MAGIC);
        header[ITERATIONS_RANGE].copy_from_slice(&iterations.to_be_bytes());
        header[8..8 + SALT_LEN].copy_from_slice(salt);
        header[8 + SALT_LEN..].copy_from_slice(nonce);
        header
    }

    /// Serialize into the flat on-disk layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&Self::header(self.iterations, &self.salt, &self.nonce));
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse the flat on-disk layout.
    ///
    /// Malformed input is reported as [`VaultError::WrongPasswordOrCorruptData`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() < HEADER_LEN + TAG_LEN || &bytes[..4] != MAGIC {
            return Err(VaultError::WrongPasswordOrCorruptData);
        }

        let mut raw_iterations = [0u8; 4];
        raw_iterations.copy_from_slice(&bytes[ITERATIONS_RANGE]);
        let iterations = u32::from_be_bytes(raw_iterations);
        if iterations == 0 || iterations > MAX_ITERATIONS {
            return Err(VaultError::WrongPasswordOrCorruptData);
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[8..8 + SALT_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[8 + SALT_LEN..HEADER_LEN]);

        let tag_start = bytes.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&bytes[tag_start..]);

        Ok(Self {
            iterations,
            salt,
            nonce,
            ciphertext: bytes[HEADER_LEN..tag_start].to_vec(),
            tag,
        })
    }
}

/// Seals and opens [`EncryptedArtifact`]s with AES-256-GCM under a
/// PBKDF2-derived key.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    iterations: u32,
}

impl CredentialVault {
    /// Create a vault using [`DEFAULT_ITERATIONS`] for new artifacts.
    pub fn new() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// Create a vault with a custom round count for new artifacts.
    ///
    /// Decryption always uses the round count stored in the artifact.
    pub fn with_iterations(iterations: u32) -> Self {
        Self { iterations }
    }

    /// Round count applied to newly sealed artifacts.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Encrypt `plaintext` under a fresh random salt.
    pub fn encrypt(&self, plaintext: &[u8], password: &[u8]) -> Result<EncryptedArtifact, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        self.seal(plaintext, password, salt)
    }

    /// Encrypt `plaintext` reusing an existing salt.
    ///
    /// Used when re-sealing a rotated token cache in place. A fresh nonce is
    /// still generated for every call.
    pub fn encrypt_with_salt(
        &self,
        plaintext: &[u8],
        password: &[u8],
        salt: &[u8; SALT_LEN],
    ) -> Result<EncryptedArtifact, VaultError> {
        self.seal(plaintext, password, *salt)
    }

    fn seal(
        &self,
        plaintext: &[u8],
        password: &[u8],
        salt: [u8; SALT_LEN],
    ) -> Result<EncryptedArtifact, VaultError> {
        let key = kdf::derive_key(password, &salt, self.iterations)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let header = EncryptedArtifact::header(self.iterations, &salt, &nonce);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|e| VaultError::Configuration {
            message: format!("invalid key length: {}", e),
        })?;

        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| VaultError::Configuration {
                message: "encryption failed".to_string(),
            })?;

        let tag_start = sealed.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);

        Ok(EncryptedArtifact {
            iterations: self.iterations,
            salt,
            nonce,
            ciphertext: sealed,
            tag,
        })
    }

    /// Decrypt an artifact and verify its integrity tag.
    ///
    /// # Errors
    ///
    /// [`VaultError::WrongPasswordOrCorruptData`] for a wrong password or any
    /// tampering; [`VaultError::Configuration`] for an empty password.
    pub fn decrypt(
        &self,
        artifact: &EncryptedArtifact,
        password: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let key = kdf::derive_key(password, &artifact.salt, artifact.iterations)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|_| VaultError::WrongPasswordOrCorruptData)?;

        let header = EncryptedArtifact::header(artifact.iterations, &artifact.salt, &artifact.nonce);
        let mut sealed = Vec::with_capacity(artifact.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&artifact.ciphertext);
        sealed.extend_from_slice(&artifact.tag);

        cipher
            .decrypt(
                Nonce::from_slice(&artifact.nonce),
                Payload {
                    msg: &sealed,
                    aad: &header,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| VaultError::WrongPasswordOrCorruptData)
    }

    /// Read an artifact file.
    pub fn load(path: &Path) -> Result<EncryptedArtifact, VaultError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(io_error(path, e)),
        };
        EncryptedArtifact::from_bytes(&bytes)
    }

    /// Write an artifact file atomically (unique temp file + rename).
    ///
    /// Concurrent writers never interleave; the last rename wins. On Unix the
    /// file is created with mode `0600`.
    pub fn store(path: &Path, artifact: &EncryptedArtifact) -> Result<(), VaultError> {
        let file_name = path.file_name().ok_or_else(|| VaultError::Configuration {
            message: format!("artifact path has no file name: {}", path.display()),
        })?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
        }

        let mut tmp_name = std::ffi::OsString::from(".");
        tmp_name.push(file_name);
        tmp_name.push(format!(".{}.{:08x}.tmp", std::process::id(), OsRng.next_u32()));
        let tmp_path = path.with_file_name(tmp_name);

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp_path).map_err(|e| io_error(&tmp_path, e))?;
        let written = file
            .write_all(&artifact.to_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| io_error(&tmp_path, e));
        drop(file);

        let result = written.and_then(|_| fs::rename(&tmp_path, path).map_err(|e| io_error(path, e)));
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
            return result;
        }
        tracing::debug!("Stored encrypted artifact at {}", path.display());
        Ok(())
    }

    /// Delete an artifact file. A missing file is not an error.
    pub fn remove(path: &Path) -> Result<(), VaultError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        }
    }
}

impl Default for CredentialVault {
    fn default() -> Self {
        Self::new()
    }
}

fn io_error(path: &Path, err: std::io::Error) -> VaultError {
    VaultError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::with_iterations(1_000)
    }

    #[test]
    fn test_round_trip() {
        let vault = vault();
        for plaintext in [&b""[..], b"x", b"{\"installed\":{\"client_id\":\"abc\"}}", &[0u8; 4096][..]] {
            let artifact = vault.encrypt(plaintext, b"correct").unwrap();
            let bytes = artifact.to_bytes();
            let parsed = EncryptedArtifact::from_bytes(&bytes).unwrap();
            assert_eq!(&vault.decrypt(&parsed, b"correct").unwrap()[..], plaintext);
        }
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_encryption() {
        let vault = vault();
        let a = vault.encrypt(b"same", b"correct").unwrap();
        let b = vault.encrypt(b"same", b"correct").unwrap();
        assert_ne!(a.salt(), b.salt());
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_encrypt_with_salt_keeps_salt() {
        let vault = vault();
        let first = vault.encrypt(b"v1", b"correct").unwrap();
        let second = vault.encrypt_with_salt(b"v2", b"correct", first.salt()).unwrap();

        assert_eq!(first.salt(), second.salt());
        assert_ne!(first.to_bytes(), second.to_bytes());
        assert_eq!(&vault.decrypt(&second, b"correct").unwrap()[..], b"v2");
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let vault = vault();
        let bytes = vault.encrypt(b"client-secret", b"correct").unwrap().to_bytes();

        for byte in (0..bytes.len()).filter(|b| !ITERATIONS_RANGE.contains(b)) {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[byte] ^= 1 << bit;
                let result = EncryptedArtifact::from_bytes(&tampered)
                    .and_then(|a| vault.decrypt(&a, b"correct"));
                assert_eq!(
                    result.unwrap_err(),
                    VaultError::WrongPasswordOrCorruptData,
                    "byte {} bit {} accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_iteration_field_tampering_is_detected() {
        let vault = vault();
        let bytes = vault.encrypt(b"client-secret", b"correct").unwrap().to_bytes();

        // Low bits change the round count cheaply; the top bit pushes it out of range.
        let flips = [(7, 0), (7, 3), (6, 1), (6, 7), (4, 7)];
        for (byte, bit) in flips {
            let mut tampered = bytes.clone();
            tampered[byte] ^= 1 << bit;
            let result = EncryptedArtifact::from_bytes(&tampered)
                .and_then(|a| vault.decrypt(&a, b"correct"));
            assert_eq!(result.unwrap_err(), VaultError::WrongPasswordOrCorruptData);
        }
    }

    #[test]
    fn test_wrong_password_matches_corruption_error() {
        let vault = vault();
        let artifact = vault.encrypt(b"client-secret", b"correct").unwrap();

        let wrong = vault.decrypt(&artifact, b"wrong").unwrap_err();

        let mut bytes = artifact.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let corrupt = vault
            .decrypt(&EncryptedArtifact::from_bytes(&bytes).unwrap(), b"correct")
            .unwrap_err();

        assert_eq!(wrong, corrupt);
        assert_eq!(wrong.to_string(), corrupt.to_string());
    }

    #[test]
    fn test_truncated_artifact_is_corrupt() {
        let bytes = vault().encrypt(b"abc", b"correct").unwrap().to_bytes();
        for len in [0, 3, 10, HEADER_LEN, HEADER_LEN + TAG_LEN - 1] {
            assert_eq!(
                EncryptedArtifact::from_bytes(&bytes[..len]).unwrap_err(),
                VaultError::WrongPasswordOrCorruptData
            );
        }
    }

    #[test]
    fn test_decrypt_uses_stored_iterations() {
        let sealed = CredentialVault::with_iterations(2_000)
            .encrypt(b"payload", b"correct")
            .unwrap();
        assert_eq!(sealed.iterations(), 2_000);

        let opened = CredentialVault::with_iterations(5).decrypt(&sealed, b"correct").unwrap();
        assert_eq!(&opened[..], b"payload");
    }

    #[test]
    fn test_empty_password_is_configuration_error() {
        assert!(matches!(
            vault().encrypt(b"data", b""),
            Err(VaultError::Configuration { .. })
        ));
    }

    #[test]
    fn test_store_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("token.encrypted");
        let vault = vault();

        let artifact = vault.encrypt(b"tokens", b"correct").unwrap();
        CredentialVault::store(&path, &artifact).unwrap();

        let loaded = CredentialVault::load(&path).unwrap();
        assert_eq!(loaded, artifact);
        let leftovers = fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(leftovers, 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_failed_store_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.encrypted");
        // A non-empty directory in the way makes the final rename fail.
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        let artifact = vault().encrypt(b"tokens", b"correct").unwrap();
        assert!(matches!(
            CredentialVault::store(&path, &artifact),
            Err(VaultError::Io { .. })
        ));

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("token.encrypted")]);
    }

    #[test]
    fn test_remove_ignores_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.encrypted");
        CredentialVault::store(&path, &vault().encrypt(b"tokens", b"correct").unwrap()).unwrap();

        CredentialVault::remove(&path).unwrap();
        assert!(!path.exists());
        CredentialVault::remove(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.encrypted");
        assert!(matches!(
            CredentialVault::load(&path),
            Err(VaultError::NotFound { .. })
        ));
    }
}
