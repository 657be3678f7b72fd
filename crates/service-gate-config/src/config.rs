// crates/service-gate-config/src/config.rs
// ============================================================================
// Module: Service Gate Configuration
// Description: Configuration loading and validation for Service Gate.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: service-gate-core, serde, toml, url
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits.
//! Missing or invalid configuration fails closed.
//!
//! Every section defaults sensibly except `[identity]`, which must name the
//! tenant owner. The tenant identity and nonce settings are turned into
//! explicit values here and handed to components at construction time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use service_gate_core::ApplicationCredential;
use service_gate_core::ProviderKind;
use service_gate_core::ProviderRecord;
use service_gate_core::TenantIdentity;
use service_gate_core::capability::KNOWN_DATA_TYPES;
use service_gate_core::rbac::ClusterRole;
use service_gate_core::rbac::RoleBinding;
use thiserror::Error;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "service-gate.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "SERVICE_GATE_CONFIG";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Upper bound on dispatcher workers.
const MAX_DISPATCH_WORKERS: usize = 64;

// ============================================================================
// SECTION: Root Config
// ============================================================================

/// Service Gate configuration root.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceGateConfig {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Tenant identity.
    pub identity: IdentityConfig,
    /// Shared service nonce.
    #[serde(default)]
    pub nonce: NonceConfig,
    /// Application registration settings.
    #[serde(default)]
    pub registrar: RegistrarConfig,
    /// Outbound call timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Event dispatcher settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Gateway authentication chain.
    #[serde(default)]
    pub authn: AuthnConfig,
    /// Gateway authorization chain.
    #[serde(default)]
    pub authz: AuthzConfig,
    /// Built-in event module.
    #[serde(default)]
    pub events: EventsConfig,
    /// Records seeded into the in-memory stores.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    /// Log filter settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceGateConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml(content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.identity.validate()?;
        self.nonce.validate()?;
        self.timeouts.validate()?;
        self.dispatcher.validate()?;
        self.authn.validate()?;
        self.authz.validate()?;
        self.events.validate()?;
        self.bootstrap.validate()?;
        Ok(())
    }

    /// Tenant identity derived from `[identity]`.
    #[must_use]
    pub fn tenant(&self) -> TenantIdentity {
        self.identity.tenant()
    }
}

// ============================================================================
// SECTION: Server
// ============================================================================

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Access-control and routing API bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Optional gateway layer bind address.
    #[serde(default)]
    pub gateway_bind: Option<String>,
    /// Maximum inbound body size.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Graceful shutdown window in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            gateway_bind: None,
            max_body_bytes: default_max_body_bytes(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerConfig {
    /// Parsed API bind address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the address does not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind(&self.bind, "server.bind")
    }

    /// Parsed gateway bind address, when configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the address does not parse.
    pub fn gateway_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.gateway_bind.as_deref().map(|bind| parse_bind(bind, "server.gateway_bind")).transpose()
    }

    /// Graceful shutdown window.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Validates listener settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_body_bytes must be greater than zero".to_string(),
            ));
        }
        let api = self.bind_addr()?;
        if let Some(gateway) = self.gateway_addr()?
            && gateway == api
        {
            return Err(ConfigError::Invalid(
                "server.gateway_bind must differ from server.bind".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default API bind address.
fn default_bind() -> String {
    "0.0.0.0:80".to_string()
}

/// Default max body size (8 MiB).
const fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

/// Default graceful shutdown window.
const fn default_shutdown_grace_secs() -> u64 {
    120
}

// ============================================================================
// SECTION: Identity
// ============================================================================

/// Tenant served by this instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Owning user.
    pub owner: String,
    /// Tenant namespace; defaults to `user-system-<owner>`.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl IdentityConfig {
    /// Tenant identity value.
    #[must_use]
    pub fn tenant(&self) -> TenantIdentity {
        let mut tenant = TenantIdentity::for_owner(&self.owner);
        if let Some(namespace) = &self.namespace {
            tenant.namespace.clone_from(namespace);
        }
        tenant
    }

    /// Validates identity settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.owner.trim().is_empty() || self.owner.trim() != self.owner {
            return Err(ConfigError::Invalid(
                "identity.owner must be non-empty and trimmed".to_string(),
            ));
        }
        if let Some(namespace) = &self.namespace
            && namespace.trim().is_empty()
        {
            return Err(ConfigError::Invalid("identity.namespace must be non-empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Nonce
// ============================================================================

/// Shared service nonce settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NonceConfig {
    /// Peers allowed to read the nonce.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Rotation interval in seconds; zero keeps the nonce for the process lifetime.
    #[serde(default)]
    pub rotate_interval_secs: u64,
    /// Fixed initial nonce; a random one is generated when absent.
    #[serde(default)]
    pub value: Option<String>,
}

impl NonceConfig {
    /// Parsed allowlist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when an entry is not an IP address.
    pub fn allowed_addrs(&self) -> Result<BTreeSet<IpAddr>, ConfigError> {
        self.allowed_ips
            .iter()
            .map(|ip| {
                ip.parse::<IpAddr>()
                    .map_err(|_| ConfigError::Invalid(format!("nonce.allowed_ips: invalid ip {ip}")))
            })
            .collect()
    }

    /// Rotation interval, when rotation is enabled.
    #[must_use]
    pub const fn rotate_interval(&self) -> Option<Duration> {
        if self.rotate_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.rotate_interval_secs))
        }
    }

    /// Validates nonce settings.
    fn validate(&self) -> Result<(), ConfigError> {
        self.allowed_addrs()?;
        if let Some(value) = &self.value
            && value.is_empty()
        {
            return Err(ConfigError::Invalid("nonce.value must be non-empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Registrar
// ============================================================================

/// Application registration settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrarConfig {
    /// HS256 secret for identity tokens on register and unregister.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

// ============================================================================
// SECTION: Timeouts
// ============================================================================

/// Outbound call timeouts in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Structured provider calls.
    #[serde(default = "default_provider_ms")]
    pub provider_ms: u64,
    /// Legacy v1 passthrough.
    #[serde(default = "default_legacy_ms")]
    pub legacy_ms: u64,
    /// Legacy v2 passthrough, which may stream.
    #[serde(default = "default_legacy_stream_ms")]
    pub legacy_stream_ms: u64,
    /// Watcher dispatch.
    #[serde(default = "default_dispatch_ms")]
    pub dispatch_ms: u64,
    /// External identity verification.
    #[serde(default = "default_verify_ms")]
    pub verify_ms: u64,
    /// Notification push.
    #[serde(default = "default_notification_ms")]
    pub notification_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            provider_ms: default_provider_ms(),
            legacy_ms: default_legacy_ms(),
            legacy_stream_ms: default_legacy_stream_ms(),
            dispatch_ms: default_dispatch_ms(),
            verify_ms: default_verify_ms(),
            notification_ms: default_notification_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Structured provider call timeout.
    #[must_use]
    pub const fn provider(&self) -> Duration {
        Duration::from_millis(self.provider_ms)
    }

    /// Legacy v1 timeout.
    #[must_use]
    pub const fn legacy(&self) -> Duration {
        Duration::from_millis(self.legacy_ms)
    }

    /// Legacy v2 timeout.
    #[must_use]
    pub const fn legacy_stream(&self) -> Duration {
        Duration::from_millis(self.legacy_stream_ms)
    }

    /// Dispatch timeout.
    #[must_use]
    pub const fn dispatch(&self) -> Duration {
        Duration::from_millis(self.dispatch_ms)
    }

    /// Verification timeout.
    #[must_use]
    pub const fn verify(&self) -> Duration {
        Duration::from_millis(self.verify_ms)
    }

    /// Notification timeout.
    #[must_use]
    pub const fn notification(&self) -> Duration {
        Duration::from_millis(self.notification_ms)
    }

    /// Validates timeouts.
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("provider_ms", self.provider_ms),
            ("legacy_ms", self.legacy_ms),
            ("legacy_stream_ms", self.legacy_stream_ms),
            ("dispatch_ms", self.dispatch_ms),
            ("verify_ms", self.verify_ms),
            ("notification_ms", self.notification_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "timeouts.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Default structured provider timeout (2 minutes).
const fn default_provider_ms() -> u64 {
    120_000
}

/// Default legacy timeout (2 seconds).
const fn default_legacy_ms() -> u64 {
    2_000
}

/// Default streaming legacy timeout (1 hour).
const fn default_legacy_stream_ms() -> u64 {
    3_600_000
}

/// Default dispatch timeout (2 seconds).
const fn default_dispatch_ms() -> u64 {
    2_000
}

/// Default verification timeout (10 seconds).
const fn default_verify_ms() -> u64 {
    10_000
}

/// Default notification timeout (5 seconds).
const fn default_notification_ms() -> u64 {
    5_000
}

// ============================================================================
// SECTION: Dispatcher
// ============================================================================

/// Event dispatcher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Number of drain workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Optional cap on items drained per second across workers.
    #[serde(default)]
    pub max_per_second: Option<u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_per_second: None,
        }
    }
}

impl DispatcherConfig {
    /// Validates dispatcher settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.workers > MAX_DISPATCH_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "dispatcher.workers must be between 1 and {MAX_DISPATCH_WORKERS}"
            )));
        }
        if self.max_per_second == Some(0) {
            return Err(ConfigError::Invalid(
                "dispatcher.max_per_second must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default worker count.
const fn default_workers() -> usize {
    1
}

// ============================================================================
// SECTION: Authentication
// ============================================================================

/// Gateway authentication chain settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthnConfig {
    /// Base URL of the external identity verifier.
    #[serde(default)]
    pub identity_verifier_url: Option<String>,
    /// Token review endpoint.
    #[serde(default)]
    pub token_review_url: Option<String>,
    /// Audiences sent with token reviews.
    #[serde(default)]
    pub token_review_audiences: Vec<String>,
    /// OIDC settings; enables the OIDC authenticator.
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
}

impl AuthnConfig {
    /// Validates authentication settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.identity_verifier_url {
            validate_url(url, "authn.identity_verifier_url")?;
        }
        if let Some(url) = &self.token_review_url {
            validate_url(url, "authn.token_review_url")?;
        }
        if let Some(oidc) = &self.oidc {
            oidc.validate()?;
        }
        Ok(())
    }
}

/// OIDC authenticator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    /// Issuer URL.
    pub issuer_url: String,
    /// Claim holding the user name.
    #[serde(default = "default_username_claim")]
    pub username_claim: String,
    /// Claim holding group memberships.
    #[serde(default = "default_groups_claim")]
    pub groups_claim: String,
    /// Discovery refresh interval in seconds.
    #[serde(default = "default_oidc_refresh_secs")]
    pub refresh_secs: u64,
}

impl OidcConfig {
    /// Discovery refresh interval.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    /// Validates OIDC settings.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_url(&self.issuer_url, "authn.oidc.issuer_url")?;
        if self.username_claim.is_empty() || self.groups_claim.is_empty() {
            return Err(ConfigError::Invalid("authn.oidc claims must be non-empty".to_string()));
        }
        if self.refresh_secs == 0 {
            return Err(ConfigError::Invalid(
                "authn.oidc.refresh_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default username claim.
fn default_username_claim() -> String {
    "preferred_username".to_string()
}

/// Default groups claim.
fn default_groups_claim() -> String {
    "groups".to_string()
}

/// Default discovery refresh interval.
const fn default_oidc_refresh_secs() -> u64 {
    300
}

// ============================================================================
// SECTION: Authorization
// ============================================================================

/// Gateway authorization chain settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthzConfig {
    /// Static allow rules checked first.
    #[serde(default)]
    pub static_rules: Vec<StaticRule>,
    /// Subject access review endpoint checked last.
    #[serde(default)]
    pub subject_access_review_url: Option<String>,
}

impl AuthzConfig {
    /// Validates authorization settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.subject_access_review_url {
            validate_url(url, "authz.subject_access_review_url")?;
        }
        for rule in &self.static_rules {
            if rule.user.is_none() && rule.group.is_none() && rule.path.is_none() {
                return Err(ConfigError::Invalid(
                    "authz.static_rules entries must name a user, group, or path".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Static allow rule; absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticRule {
    /// User name.
    #[serde(default)]
    pub user: Option<String>,
    /// Group name.
    #[serde(default)]
    pub group: Option<String>,
    /// Verb.
    #[serde(default)]
    pub verb: Option<String>,
    /// Path; a trailing `*` matches by prefix.
    #[serde(default)]
    pub path: Option<String>,
}

// ============================================================================
// SECTION: Events
// ============================================================================

/// Built-in event module settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// Address other services use to reach this instance.
    #[serde(default = "default_events_endpoint")]
    pub endpoint: String,
    /// Notification push URL; defaults to the tenant's notification server.
    #[serde(default)]
    pub notification_url: Option<String>,
    /// Events retained in memory.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_events_endpoint(),
            notification_url: None,
            max_events: default_max_events(),
        }
    }
}

impl EventsConfig {
    /// Validates event settings.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("events.endpoint must be non-empty".to_string()));
        }
        if let Some(url) = &self.notification_url {
            validate_url(url, "events.notification_url")?;
        }
        if self.max_events == 0 {
            return Err(ConfigError::Invalid(
                "events.max_events must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default self endpoint.
fn default_events_endpoint() -> String {
    "localhost".to_string()
}

/// Default event retention.
const fn default_max_events() -> usize {
    10_000
}

// ============================================================================
// SECTION: Bootstrap
// ============================================================================

/// Records seeded into the in-memory directory and RBAC stores.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Provider and watcher records.
    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
    /// Application credentials.
    #[serde(default)]
    pub credentials: Vec<ApplicationCredential>,
    /// Cluster roles.
    #[serde(default)]
    pub roles: Vec<ClusterRole>,
    /// Role bindings.
    #[serde(default)]
    pub bindings: Vec<RoleBinding>,
}

impl BootstrapConfig {
    /// Validates seeded records.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for record in &self.providers {
            if !names.insert(record.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate bootstrap.providers name: {}",
                    record.name
                )));
            }
            validate_provider(record)?;
        }
        let mut apps = BTreeSet::new();
        for credential in &self.credentials {
            if credential.app.is_empty() || credential.key.is_empty() || credential.secret.is_empty()
            {
                return Err(ConfigError::Invalid(
                    "bootstrap.credentials entries need app, key, and secret".to_string(),
                ));
            }
            if !apps.insert(credential.app.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate bootstrap.credentials app: {}",
                    credential.app
                )));
            }
        }
        Ok(())
    }
}

/// Validates one seeded provider record.
fn validate_provider(record: &ProviderRecord) -> Result<(), ConfigError> {
    if record.name.is_empty() || record.endpoint.is_empty() {
        return Err(ConfigError::Invalid(
            "bootstrap.providers entries need name and endpoint".to_string(),
        ));
    }
    if !KNOWN_DATA_TYPES.contains(&record.data_type.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "bootstrap.providers {}: unknown dataType {}",
            record.name, record.data_type
        )));
    }
    match record.kind {
        ProviderKind::Provider if !record.callbacks.is_empty() => Err(ConfigError::Invalid(format!(
            "bootstrap.providers {}: providers cannot declare callbacks",
            record.name
        ))),
        ProviderKind::Watcher if !record.op_apis.is_empty() => Err(ConfigError::Invalid(format!(
            "bootstrap.providers {}: watchers cannot declare opApis",
            record.name
        ))),
        _ => Ok(()),
    }
}

// ============================================================================
// SECTION: Logging
// ============================================================================

/// Log filter settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive; `RUST_LOG` takes precedence.
    #[serde(default)]
    pub filter: Option<String>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from CLI, environment, or default.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against security limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Parses a bind address.
fn parse_bind(bind: &str, field: &str) -> Result<SocketAddr, ConfigError> {
    bind.trim().parse().map_err(|_| ConfigError::Invalid(format!("{field}: invalid bind address")))
}

/// Requires an absolute http(s) URL.
fn validate_url(value: &str, field: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|err| ConfigError::Invalid(format!("{field}: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Invalid(format!("{field}: unsupported scheme {other}"))),
    }
}
