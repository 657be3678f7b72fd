// crates/service-gate-core/src/signature.rs
// ============================================================================
// Module: Signature Validator
// Description: Minute-bucket request signatures for server-to-server calls.
// Purpose: Authenticate callers by app key and secret without a token.
// Dependencies: sha2, hex, subtle, crate::{directory, store, clock}
// ============================================================================

//! ## Overview
//! The signature is `hex(sha256(app_key || secret || bucket))`, where
//! `bucket` is the current time floored to the minute in unix seconds. There
//! is no grace for the adjacent bucket: a signature minted at `:59.9` fails
//! when checked at `:00.1`.
//!
//! After the signature matches, the request sub-path must start with the URI
//! of one of the target provider's op APIs whose name appears in the
//! credential's grants for that provider's triple.
//!
//! Security posture: comparison is constant time; the secret never leaves
//! this module.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use sha2::Digest;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::directory::DirectoryError;
use crate::directory::ProviderDirectory;
use crate::records::ApplicationCredential;
use crate::store::DirectoryStore;
use crate::store::StoreError;
use crate::store::find_credential_by_key;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Signature validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// No credential carries the app key.
    #[error("cannot find application permission by appKey")]
    UnknownAppKey,
    /// Signature does not match the current bucket.
    #[error("invalid signature")]
    InvalidSignature,
    /// No active provider serves the triple.
    #[error("provider not found")]
    ProviderNotFound,
    /// Sub-path is outside the granted op URIs.
    #[error("no permission for {0}")]
    PathNotGranted(String),
    /// Directory failure.
    #[error("signature validation unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for SignatureError {
    fn from(err: StoreError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<DirectoryError> for SignatureError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::ProviderNotFound => Self::ProviderNotFound,
            DirectoryError::Unavailable(detail) => Self::Unavailable(detail),
        }
    }
}

// ============================================================================
// SECTION: Signing
// ============================================================================

/// Floors `unix_seconds` to the start of its minute.
#[must_use]
pub const fn minute_bucket(unix_seconds: i64) -> i64 {
    unix_seconds - unix_seconds.rem_euclid(60)
}

/// Signature a caller must present during the bucket containing `unix_seconds`.
#[must_use]
pub fn expected_signature(app_key: &str, secret: &str, unix_seconds: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(app_key.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.update(minute_bucket(unix_seconds).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// SECTION: Validator
// ============================================================================

/// Validates signed machine-to-machine requests.
pub struct SignatureValidator {
    /// Credential source.
    store: Arc<dyn DirectoryStore>,
    /// Provider lookup.
    directory: Arc<ProviderDirectory>,
    /// Time source for the bucket.
    clock: Arc<dyn Clock>,
}

impl SignatureValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        directory: Arc<ProviderDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
        }
    }

    /// Validates a signed request for `sub_path` on the provider at the triple.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError`] describing the first failed check.
    pub async fn validate(
        &self,
        app_key: &str,
        signature: &str,
        sub_path: &str,
        data_type: &str,
        group: &str,
        version: &str,
    ) -> Result<(), SignatureError> {
        let credential = find_credential_by_key(self.store.as_ref(), app_key)
            .await?
            .ok_or(SignatureError::UnknownAppKey)?;
        let now = self.clock.now().unix_timestamp();
        let expected = expected_signature(app_key, &credential.secret, now);
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(SignatureError::InvalidSignature);
        }
        let provider = self.directory.get_provider(data_type, group, version)?;
        let granted = granted_uris(&credential, &provider);
        let path = if sub_path.starts_with('/') {
            sub_path.to_string()
        } else {
            format!("/{sub_path}")
        };
        debug!(app_key, path = %path, uris = %granted.join(","), "signature accepted");
        if granted.iter().any(|uri| path.starts_with(uri.as_str())) {
            Ok(())
        } else {
            Err(SignatureError::PathNotGranted(path))
        }
    }
}

/// URIs of the provider's op APIs named by the credential's grants for its triple.
fn granted_uris(
    credential: &ApplicationCredential,
    provider: &crate::records::ProviderRecord,
) -> Vec<String> {
    let granted_ops: BTreeSet<&str> = credential
        .permissions
        .iter()
        .filter(|perm| {
            perm.data_type == provider.data_type
                && perm.group == provider.group
                && perm.version == provider.version
        })
        .flat_map(|perm| perm.ops.iter().map(String::as_str))
        .collect();
    provider
        .op_apis
        .iter()
        .filter(|api| granted_ops.contains(api.name.as_str()))
        .map(|api| api.uri.clone())
        .collect()
}
