// crates/service-gate-core/src/access_token.rs
// ============================================================================
// Module: Access Token Service
// Description: Challenge-response issuance and validation of scoped tokens.
// Purpose: Bind short-lived bearer tokens to a single capability grant.
// Dependencies: bcrypt, base64, crate::{cache, capability, clock, records}
// ============================================================================

//! ## Overview
//! An application proves possession of its secret by sending a bcrypt hash of
//! `app_key || timestamp || secret` together with the timestamp. The service
//! checks the timestamp against a 10 second skew window (inclusive), verifies
//! the hash, and mints `base64(client_digest)` as the access token. The token
//! is cached for five minutes bound to the requested capability, stamped with
//! the owning app key.
//!
//! Validation is a cache lookup followed by a full-match include check of the
//! single requested op, so a token validates only for the exact triple and
//! op it was issued for.
//!
//! Security posture: tokens are bearer credentials; the cache is the only
//! place they live and entries are never persisted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::cache::TtlCache;
use crate::capability::PermissionRequirement;
use crate::clock::Clock;
use crate::records::ApplicationCredential;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Lifetime of an issued token.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);
/// Maximum number of live tokens.
pub const ACCESS_TOKEN_CAPACITY: usize = 1000;
/// Accepted distance between client timestamp and server time, inclusive.
pub const MAX_CLOCK_SKEW_SECS: i64 = 10;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Token issuance request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenRequest {
    /// Public key of the requesting application.
    pub app_key: String,
    /// Client time in unix seconds.
    pub timestamp: i64,
    /// Bcrypt hash of `app_key || timestamp || secret`.
    pub token: String,
    /// Capability the token should carry.
    pub perm: PermissionRequirement,
}

/// Successfully issued token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Bearer token value.
    pub access_token: String,
    /// Instant the cache entry lapses.
    pub expires_at: OffsetDateTime,
}

/// Access token failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessTokenError {
    /// Client timestamp outside the skew window.
    #[error("request time expired")]
    RequestExpired,
    /// Client digest does not verify against the credential.
    #[error("invalid auth token: {0}")]
    InvalidDigest(String),
    /// Requested capability is not granted to the application.
    #[error("permission required is not allowed")]
    PermissionNotAllowed,
    /// Token is unknown or has expired.
    #[error("token not found in cache or expired")]
    TokenNotFound,
    /// Token does not cover the requested operation.
    #[error("access denied")]
    AccessDenied,
}

// ============================================================================
// SECTION: Service
// ============================================================================

/// Issues and validates scoped access tokens.
///
/// # Invariants
/// - Every cached requirement carries the issuing credential's key.
pub struct AccessTokenService {
    /// Token to capability map.
    cache: TtlCache<String, PermissionRequirement>,
    /// Time source for skew checks.
    clock: Arc<dyn Clock>,
}

impl AccessTokenService {
    /// Creates a service with the default TTL and capacity.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_limits(ACCESS_TOKEN_CAPACITY, ACCESS_TOKEN_TTL, clock)
    }

    /// Creates a service with explicit cache limits.
    #[must_use]
    pub fn with_limits(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: TtlCache::new(capacity, ttl, Arc::clone(&clock)),
            clock,
        }
    }

    /// Verifies the client challenge and returns the raw token value.
    ///
    /// Does not check the requested capability or touch the cache.
    ///
    /// # Errors
    ///
    /// Returns [`AccessTokenError::RequestExpired`] outside the skew window
    /// and [`AccessTokenError::InvalidDigest`] when the hash does not verify.
    pub fn issue(
        &self,
        request: &AccessTokenRequest,
        credential: &ApplicationCredential,
    ) -> Result<String, AccessTokenError> {
        let now = self.clock.now().unix_timestamp();
        if now.abs_diff(request.timestamp) > MAX_CLOCK_SKEW_SECS.unsigned_abs() {
            return Err(AccessTokenError::RequestExpired);
        }
        let preimage = format!("{}{}{}", request.app_key, request.timestamp, credential.secret);
        let verified = bcrypt::verify(preimage, &request.token)
            .map_err(|err| AccessTokenError::InvalidDigest(err.to_string()))?;
        if !verified {
            return Err(AccessTokenError::InvalidDigest("digest mismatch".to_string()));
        }
        Ok(STANDARD.encode(request.token.as_bytes()))
    }

    /// Issues a token, checks the grant, and caches the scoped capability.
    ///
    /// # Errors
    ///
    /// Returns issuance errors from [`Self::issue`] and
    /// [`AccessTokenError::PermissionNotAllowed`] when no grant partially
    /// includes the requested capability.
    pub fn grant(
        &self,
        request: &AccessTokenRequest,
        credential: &ApplicationCredential,
    ) -> Result<IssuedToken, AccessTokenError> {
        let access_token = self.issue(request, credential)?;
        if !credential.grants(&request.perm, false) {
            return Err(AccessTokenError::PermissionNotAllowed);
        }
        let mut scoped = request.perm.clone();
        scoped.owner_app_key.clone_from(&credential.key);
        self.cache.insert(access_token.clone(), scoped);
        Ok(IssuedToken {
            access_token,
            expires_at: self.clock.now() + self.cache.ttl(),
        })
    }

    /// Validates a token for one operation and returns the owning app key.
    ///
    /// # Errors
    ///
    /// Returns [`AccessTokenError::TokenNotFound`] on a cache miss and
    /// [`AccessTokenError::AccessDenied`] when the token does not cover the
    /// exact op and triple.
    pub fn validate(
        &self,
        token: &str,
        op: &str,
        data_type: &str,
        version: &str,
        group: &str,
    ) -> Result<String, AccessTokenError> {
        let granted = self.cache.get(&token.to_string()).ok_or(AccessTokenError::TokenNotFound)?;
        let requested = PermissionRequirement::single_op(op, data_type, version, group);
        if !granted.includes(&requested, true) {
            return Err(AccessTokenError::AccessDenied);
        }
        Ok(granted.owner_app_key)
    }
}
