// crates/service-gate-server/src/authn.rs
// ============================================================================
// Module: Authentication Chain
// Description: Ordered union of pluggable request authenticators.
// Purpose: Establish the caller identity for the gateway layer.
// Dependencies: async-trait, axum, reqwest, service-gate-core, tokio, tracing
// ============================================================================

//! ## Overview
//! [`AuthnChain`] asks each [`Authenticator`] in order. The first identity
//! wins. A member that does not recognise the request answers `Ok(None)`.
//! Errors come in two kinds: a terminal error means the member matched the
//! request and rejected it, which aborts the chain; any other error is
//! remembered and the next member is tried.
//!
//! Members, in priority order:
//! 1. [`CachedIdentityAuthenticator`]: user token from header or cookie,
//!    verified remotely once and cached for five minutes.
//! 2. [`NonceAuthenticator`]: shared nonce plus a trusted user header.
//! 3. [`TokenReviewAuthenticator`]: delegated bearer token review.
//! 4. [`OidcAuthenticator`]: bearer token checked at the issuer's userinfo
//!    endpoint, with discovery refreshed in the background.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use service_gate_config::AuthnConfig;
use service_gate_config::OidcConfig;
use service_gate_core::Clock;
use service_gate_core::TtlCache;
use service_gate_core::UserInfo;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::headers;
use crate::jwt;
use crate::nonce::NonceSource;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Group granted to callers authenticated by the shared nonce.
pub const NONCE_BACKEND_GROUP: &str = "authelia:backend";
/// Identity cache lifetime.
pub const IDENTITY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Identity cache capacity.
pub const IDENTITY_CACHE_CAPACITY: usize = 1000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Authentication failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthnError {
    /// Member recognised the request and rejected it; aborts the chain.
    #[error("authentication rejected: {0}")]
    Rejected(String),
    /// Credential was not accepted by this member.
    #[error("authentication failed: {0}")]
    Invalid(String),
    /// Member could not reach its backing service.
    #[error("authentication unavailable: {0}")]
    Unavailable(String),
}

impl AuthnError {
    /// Returns true when the error ends the chain.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

// ============================================================================
// SECTION: Contract
// ============================================================================

/// One identity source.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    /// Returns the caller identity, `None` when the request is not recognised.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserInfo>, AuthnError>;
}

/// Ordered union of authenticators.
pub struct AuthnChain {
    /// Members in priority order.
    members: Vec<Arc<dyn Authenticator>>,
}

impl AuthnChain {
    /// Creates a chain.
    #[must_use]
    pub fn new(members: Vec<Arc<dyn Authenticator>>) -> Self {
        Self {
            members,
        }
    }

    /// Runs the members in order.
    ///
    /// # Errors
    ///
    /// Returns the first terminal error, or the collected non-terminal errors
    /// when no member produced an identity.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserInfo>, AuthnError> {
        let mut failures = Vec::new();
        for member in &self.members {
            match member.authenticate(headers).await {
                Ok(Some(user)) => {
                    debug!(authenticator = member.name(), user = %user.name, "request authenticated");
                    return Ok(Some(user));
                }
                Ok(None) => {}
                Err(err) if err.is_terminal() => {
                    warn!(authenticator = member.name(), error = %err, "authentication aborted");
                    return Err(err);
                }
                Err(err) => {
                    debug!(authenticator = member.name(), error = %err, "authenticator failed");
                    failures.push(format!("{}: {err}", member.name()));
                }
            }
        }
        if failures.is_empty() { Ok(None) } else { Err(AuthnError::Invalid(failures.join("; "))) }
    }
}

/// Chain built from configuration plus the OIDC member, when configured.
pub struct BuiltChain {
    /// The chain.
    pub chain: AuthnChain,
    /// OIDC member whose discovery refresh must be started.
    pub oidc: Option<Arc<OidcAuthenticator>>,
}

/// Builds the chain from `[authn]`.
///
/// # Errors
///
/// Returns [`AuthnError::Unavailable`] when an HTTP client cannot be built.
pub fn build_chain(
    config: &AuthnConfig,
    nonce: Arc<NonceSource>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
) -> Result<BuiltChain, AuthnError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| AuthnError::Unavailable(err.to_string()))?;
    let mut members: Vec<Arc<dyn Authenticator>> = vec![
        Arc::new(CachedIdentityAuthenticator::new(
            config.identity_verifier_url.clone(),
            client.clone(),
            clock,
        )),
        Arc::new(NonceAuthenticator::new(nonce)),
    ];
    if let Some(url) = &config.token_review_url {
        members.push(Arc::new(TokenReviewAuthenticator::new(
            url.clone(),
            config.token_review_audiences.clone(),
            client.clone(),
        )));
    }
    let oidc = config.oidc.as_ref().map(|oidc| Arc::new(OidcAuthenticator::new(oidc, client)));
    if let Some(oidc) = &oidc {
        members.push(Arc::clone(oidc) as Arc<dyn Authenticator>);
    }
    info!(members = members.len(), "authentication chain ready");
    Ok(BuiltChain {
        chain: AuthnChain::new(members),
        oidc,
    })
}

/// `Bearer` credential of the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers::header_str(headers, AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

// ============================================================================
// SECTION: Cached Identity
// ============================================================================

/// Identity claims carried by user tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IdentityClaims {
    /// User name.
    #[serde(default)]
    pub username: String,
    /// Group memberships.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Second-factor level.
    #[serde(rename = "mfa", default)]
    pub mfa_level: i64,
}

/// User token authenticator backed by a remote verifier and a TTL cache.
pub struct CachedIdentityAuthenticator {
    /// Verifier base URL; without it only cached identities are accepted.
    verifier_url: Option<String>,
    /// Outbound client.
    client: reqwest::Client,
    /// Identities keyed by raw token.
    cache: TtlCache<String, UserInfo>,
}

impl CachedIdentityAuthenticator {
    /// Creates the authenticator.
    #[must_use]
    pub fn new(verifier_url: Option<String>, client: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self {
            verifier_url,
            client,
            cache: TtlCache::new(IDENTITY_CACHE_CAPACITY, IDENTITY_CACHE_TTL, clock),
        }
    }

    /// Verifies `token` remotely, then reads its claims without re-checking them.
    async fn verify(&self, base_url: &str, token: &str) -> Result<UserInfo, AuthnError> {
        let url = format!("{}/auth/token/verify", base_url.trim_end_matches('/'));
        let reply = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "access_token": token }))
            .send()
            .await
            .map_err(|err| AuthnError::Unavailable(err.to_string()))?;
        let status = reply.status();
        let body: Value = reply.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(AuthnError::Invalid(format!("token verify returned {}", status.as_u16())));
        }
        if body.get("status").and_then(Value::as_str) == Some("invalid token") {
            return Err(AuthnError::Invalid("token verification failed".to_string()));
        }
        let claims = jwt::decode_unverified(token).map_err(|err| AuthnError::Invalid(err.to_string()))?;
        let claims: IdentityClaims = serde_json::from_value(Value::Object(claims))
            .map_err(|err| AuthnError::Invalid(err.to_string()))?;
        if claims.username.is_empty() {
            return Err(AuthnError::Invalid("token has no username".to_string()));
        }
        debug!(user = %claims.username, mfa = claims.mfa_level, "identity token verified");
        Ok(UserInfo::named(&claims.username, claims.groups))
    }
}

#[async_trait]
impl Authenticator for CachedIdentityAuthenticator {
    fn name(&self) -> &'static str {
        "cached_identity"
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserInfo>, AuthnError> {
        let token = match headers::header_str(headers, headers::AUTHORIZATION_TOKEN) {
            Some(token) => token.to_string(),
            None => match headers::cookie_value(headers, headers::AUTH_TOKEN_COOKIE) {
                Some(token) => token,
                None => return Ok(None),
            },
        };
        if let Some(user) = self.cache.get(&token) {
            return Ok(Some(user));
        }
        let Some(base_url) = &self.verifier_url else {
            return Ok(None);
        };
        let user = self.verify(base_url, &token).await?;
        self.cache.insert(token, user.clone());
        Ok(Some(user))
    }
}

// ============================================================================
// SECTION: Nonce
// ============================================================================

/// Trusts the user header of callers that present the shared nonce.
pub struct NonceAuthenticator {
    /// Shared nonce.
    nonce: Arc<NonceSource>,
}

impl NonceAuthenticator {
    /// Creates the authenticator.
    #[must_use]
    pub const fn new(nonce: Arc<NonceSource>) -> Self {
        Self {
            nonce,
        }
    }
}

#[async_trait]
impl Authenticator for NonceAuthenticator {
    fn name(&self) -> &'static str {
        "nonce"
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserInfo>, AuthnError> {
        let Some(presented) = headers::header_str(headers, headers::AUTHELIA_NONCE) else {
            return Ok(None);
        };
        if !self.nonce.matches(presented) {
            return Err(AuthnError::Invalid("nonce mismatch".to_string()));
        }
        let Some(user) = headers::header_str(headers, headers::BFL_USER) else {
            return Err(AuthnError::Rejected("nonce without trusted user header".to_string()));
        };
        Ok(Some(UserInfo::named(user, vec![NONCE_BACKEND_GROUP.to_string()])))
    }
}

// ============================================================================
// SECTION: Token Review
// ============================================================================

/// Token review reply.
#[derive(Debug, Default, Deserialize)]
struct TokenReviewReply {
    /// Review status.
    #[serde(default)]
    status: TokenReviewStatus,
}

/// Token review status.
#[derive(Debug, Default, Deserialize)]
struct TokenReviewStatus {
    /// True when the token is valid.
    #[serde(default)]
    authenticated: bool,
    /// Reviewed user.
    #[serde(default)]
    user: ReviewedUser,
    /// Failure text.
    #[serde(default)]
    error: String,
}

/// User returned by a token review.
#[derive(Debug, Default, Deserialize)]
struct ReviewedUser {
    /// User name.
    #[serde(default)]
    username: String,
    /// Stable id.
    #[serde(default)]
    uid: String,
    /// Group memberships.
    #[serde(default)]
    groups: Vec<String>,
}

/// Delegates bearer tokens to a token review endpoint.
pub struct TokenReviewAuthenticator {
    /// Review endpoint.
    url: String,
    /// Audiences requested in the review.
    audiences: Vec<String>,
    /// Outbound client.
    client: reqwest::Client,
}

impl TokenReviewAuthenticator {
    /// Creates the authenticator.
    #[must_use]
    pub const fn new(url: String, audiences: Vec<String>, client: reqwest::Client) -> Self {
        Self {
            url,
            audiences,
            client,
        }
    }
}

#[async_trait]
impl Authenticator for TokenReviewAuthenticator {
    fn name(&self) -> &'static str {
        "token_review"
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserInfo>, AuthnError> {
        let Some(token) = bearer_token(headers) else {
            return Ok(None);
        };
        let review = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenReview",
            "spec": { "token": token, "audiences": self.audiences },
        });
        let reply = self
            .client
            .post(&self.url)
            .json(&review)
            .send()
            .await
            .map_err(|err| AuthnError::Unavailable(err.to_string()))?;
        if !reply.status().is_success() {
            return Err(AuthnError::Unavailable(format!(
                "token review returned {}",
                reply.status().as_u16()
            )));
        }
        let reply: TokenReviewReply =
            reply.json().await.map_err(|err| AuthnError::Unavailable(err.to_string()))?;
        if !reply.status.authenticated || reply.status.user.username.is_empty() {
            let reason = if reply.status.error.is_empty() {
                "token not authenticated".to_string()
            } else {
                reply.status.error
            };
            return Err(AuthnError::Invalid(reason));
        }
        let user = reply.status.user;
        Ok(Some(UserInfo {
            uid: if user.uid.is_empty() { user.username.clone() } else { user.uid },
            name: user.username,
            groups: user.groups,
        }))
    }
}

// ============================================================================
// SECTION: OIDC
// ============================================================================

/// Subset of the issuer discovery document.
#[derive(Debug, Clone, Deserialize)]
struct Discovery {
    /// Userinfo endpoint.
    userinfo_endpoint: String,
}

/// Validates bearer tokens at the issuer's userinfo endpoint.
pub struct OidcAuthenticator {
    /// Issuer base URL.
    issuer_url: String,
    /// Claim holding the user name.
    username_claim: String,
    /// Claim holding the groups.
    groups_claim: String,
    /// Refresh interval.
    refresh_interval: Duration,
    /// Latest discovery document.
    discovery: RwLock<Option<Discovery>>,
    /// Outbound client.
    client: reqwest::Client,
}

impl OidcAuthenticator {
    /// Creates the authenticator; discovery is loaded by [`Self::refresh`].
    #[must_use]
    pub fn new(config: &OidcConfig, client: reqwest::Client) -> Self {
        Self {
            issuer_url: config.issuer_url.trim_end_matches('/').to_string(),
            username_claim: config.username_claim.clone(),
            groups_claim: config.groups_claim.clone(),
            refresh_interval: config.refresh_interval(),
            discovery: RwLock::new(None),
            client,
        }
    }

    /// Reloads the discovery document.
    ///
    /// # Errors
    ///
    /// Returns [`AuthnError::Unavailable`] when the document cannot be fetched.
    pub async fn refresh(&self) -> Result<(), AuthnError> {
        let url = format!("{}/.well-known/openid-configuration", self.issuer_url);
        let reply = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| AuthnError::Unavailable(err.to_string()))?;
        let discovery: Discovery =
            reply.json().await.map_err(|err| AuthnError::Unavailable(err.to_string()))?;
        if let Ok(mut slot) = self.discovery.write() {
            *slot = Some(discovery);
        }
        debug!(issuer = %self.issuer_url, "oidc discovery refreshed");
        Ok(())
    }

    /// Refreshes discovery now and on every interval until `cancel` fires.
    pub fn spawn_refresh(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.refresh_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh().await {
                            warn!(error = %err, "oidc discovery refresh failed");
                        }
                    }
                }
            }
        })
    }

    /// Userinfo endpoint of the loaded discovery document.
    fn userinfo_endpoint(&self) -> Option<String> {
        self.discovery
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|discovery| discovery.userinfo_endpoint.clone()))
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    fn name(&self) -> &'static str {
        "oidc"
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserInfo>, AuthnError> {
        let Some(token) = bearer_token(headers) else {
            return Ok(None);
        };
        let Some(endpoint) = self.userinfo_endpoint() else {
            return Err(AuthnError::Unavailable("oidc discovery not loaded".to_string()));
        };
        let reply = self
            .client
            .get(&endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| AuthnError::Unavailable(err.to_string()))?;
        let status = reply.status().as_u16();
        if status == 401 || status == 403 {
            return Err(AuthnError::Invalid("oidc token rejected".to_string()));
        }
        if !reply.status().is_success() {
            return Err(AuthnError::Unavailable(format!("userinfo returned {status}")));
        }
        let claims: Value =
            reply.json().await.map_err(|err| AuthnError::Unavailable(err.to_string()))?;
        let Some(name) = claims.get(&self.username_claim).and_then(Value::as_str) else {
            return Err(AuthnError::Invalid(format!("claim {} missing", self.username_claim)));
        };
        let groups = claims
            .get(&self.groups_claim)
            .and_then(Value::as_array)
            .map(|groups| groups.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Some(UserInfo::named(name, groups)))
    }
}

#[cfg(test)]
mod tests;
