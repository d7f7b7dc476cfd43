//! Password-based key derivation.
//!
//! Keys are derived with PBKDF2-HMAC-SHA256. The output length matches the
//! AES-256-GCM key size used by [`CredentialVault`](crate::vault::CredentialVault).

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::vault::VaultError;

/// Derived key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Salt length in bytes generated for every new artifact.
pub const SALT_LEN: usize = 16;

/// Default PBKDF2 round count for newly sealed artifacts.
pub const DEFAULT_ITERATIONS: u32 = 600_000;

/// Round count below which operators are warned at setup time.
pub const RECOMMENDED_MIN_ITERATIONS: u32 = 100_000;

/// A derived symmetric key, wiped on drop.
pub type DerivedKey = Zeroizing<[u8; KEY_LEN]>;

/// Derive a fixed-length key from `password` and `salt`.
///
/// Deterministic: the same inputs always produce the same key.
///
/// # Errors
///
/// Returns [`VaultError::Configuration`] for an empty password, an empty salt
/// or a zero iteration count.
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Result<DerivedKey, VaultError> {
    if password.is_empty() {
        return Err(VaultError::Configuration {
            message: "password must not be empty".to_string(),
        });
    }
    if salt.is_empty() {
        return Err(VaultError::Configuration {
            message: "salt must not be empty".to_string(),
        });
    }
    if iterations == 0 {
        return Err(VaultError::Configuration {
            message: "iteration count must be at least 1".to_string(),
        });
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key[..]);
    Ok(key)
}
