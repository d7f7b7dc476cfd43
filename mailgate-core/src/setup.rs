//! Operator setup helpers: sealing and checking the client-secret artifact.

use std::path::Path;

use crate::error::MailgateError;
use crate::secret::Secret;
use crate::token::ClientSecret;
use crate::vault::{CredentialVault, EncryptedArtifact};

/// Seal a downloaded credentials document into `output`.
///
/// The document is validated before anything is written.
pub fn seal_client_secret(
    vault: &CredentialVault,
    document: &[u8],
    password: &Secret,
    output: &Path,
) -> Result<ClientSecret, MailgateError> {
    let client = ClientSecret::from_json(document).map_err(|e| MailgateError::Config {
        message: format!(
            "not a credentials document (line {}, column {})",
            e.line(),
            e.column()
        ),
    })?;

    let artifact = vault.encrypt(document, password.expose_bytes())?;
    CredentialVault::store(output, &artifact)?;
    tracing::info!("Sealed client secret into {}", output.display());
    Ok(client)
}

/// Open the client-secret artifact at `path` and parse it.
pub fn open_client_secret(path: &Path, password: &Secret) -> Result<ClientSecret, MailgateError> {
    let artifact: EncryptedArtifact = CredentialVault::load(path)?;
    let plaintext = CredentialVault::new().decrypt(&artifact, password.expose_bytes())?;
    ClientSecret::from_json(&plaintext).map_err(|e| MailgateError::Config {
        message: format!(
            "decrypted data is not a credentials document (line {}, column {})",
            e.line(),
            e.column()
        ),
    })
}
