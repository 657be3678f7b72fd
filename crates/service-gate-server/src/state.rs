// crates/service-gate-server/src/state.rs
// ============================================================================
// Module: Gateway State
// Description: Shared handler state assembled from configuration.
// Purpose: Wire stores, chains, and outbound clients once at startup.
// Dependencies: service-gate-core, service-gate-config, reqwest, thiserror
// ============================================================================

//! ## Overview
//! [`GateState::build`] turns a validated [`ServiceGateConfig`] into the
//! state every handler shares, plus the pieces that need a runtime to start:
//! the dispatch queue, the watcher fanout, and the OIDC discovery member.
//! Stores are process-local and seeded from `[bootstrap]`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use service_gate_config::ConfigError;
use service_gate_config::ServiceGateConfig;
use service_gate_core::AccessTokenService;
use service_gate_core::Clock;
use service_gate_core::DirectoryStore;
use service_gate_core::InMemoryDirectoryStore;
use service_gate_core::ProviderDirectory;
use service_gate_core::SignatureValidator;
use service_gate_core::SystemClock;
use service_gate_core::TenantIdentity;
use service_gate_core::rbac::InMemoryRbacStore;
use service_gate_core::rbac::RbacStore;
use thiserror::Error;

use crate::audit::AccessAuditSink;
use crate::audit::TracingAuditSink;
use crate::authn;
use crate::authn::AuthnChain;
use crate::authn::AuthnError;
use crate::authn::OidcAuthenticator;
use crate::authz;
use crate::authz::AuthzChain;
use crate::authz::AuthzError;
use crate::dispatcher::DispatchError;
use crate::dispatcher::DispatchQueue;
use crate::dispatcher::EventDispatcher;
use crate::dispatcher::WatcherFanout;
use crate::events::EventError;
use crate::events::EventLog;
use crate::events::EventModule;
use crate::nonce::NonceSource;
use crate::router::RequestRouter;
use crate::router::RouterError;
use crate::router::RouterTimeouts;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Startup wiring failures.
#[derive(Debug, Error)]
pub enum StateError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Router client could not be built.
    #[error("router: {0}")]
    Router(#[from] RouterError),
    /// Authentication chain could not be built.
    #[error("authn: {0}")]
    Authn(#[from] AuthnError),
    /// Authorization chain could not be built.
    #[error("authz: {0}")]
    Authz(#[from] AuthzError),
    /// Dispatcher client could not be built.
    #[error("dispatcher: {0}")]
    Dispatch(#[from] DispatchError),
    /// Event module could not be built.
    #[error("events: {0}")]
    Events(#[from] EventError),
    /// Gateway client could not be built.
    #[error("gateway client: {0}")]
    Client(String),
}

// ============================================================================
// SECTION: State
// ============================================================================

/// State shared by every handler.
pub struct GateState {
    /// Tenant served by this instance.
    pub tenant: TenantIdentity,
    /// Service-auth nonce.
    pub nonce: Arc<NonceSource>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Providers and credentials.
    pub store: Arc<dyn DirectoryStore>,
    /// Watched provider snapshot.
    pub directory: Arc<ProviderDirectory>,
    /// Access token issuance and validation.
    pub tokens: AccessTokenService,
    /// Legacy v2 signature checks.
    pub signatures: SignatureValidator,
    /// Structured provider calls.
    pub router: RequestRouter,
    /// Watcher fanout queue.
    pub dispatcher: EventDispatcher,
    /// Built-in event provider.
    pub events: EventModule,
    /// Roles and bindings.
    pub rbac: Arc<dyn RbacStore>,
    /// Gateway authentication.
    pub authn: AuthnChain,
    /// Gateway authorization.
    pub authz: AuthzChain,
    /// Streaming client for gateway proxying.
    pub gateway_client: reqwest::Client,
    /// HS256 secret for registrar user tokens.
    pub registrar_secret: Option<String>,
    /// Body cap for buffered relays.
    pub max_body_bytes: usize,
    /// Access decision sink.
    pub audit: Arc<dyn AccessAuditSink>,
}

/// State plus the pieces started by the server runtime.
pub struct StateParts {
    /// Shared state.
    pub state: Arc<GateState>,
    /// Queue drained by dispatch workers.
    pub queue: DispatchQueue,
    /// Callback delivery used by the workers.
    pub fanout: Arc<WatcherFanout>,
    /// OIDC member needing discovery refresh.
    pub oidc: Option<Arc<OidcAuthenticator>>,
}

impl GateState {
    /// Builds state from `config` on the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when config values or clients are invalid.
    pub fn from_config(config: &ServiceGateConfig) -> Result<StateParts, StateError> {
        Self::build(config, Arc::new(SystemClock), Arc::new(TracingAuditSink))
    }

    /// Builds state from `config` with an explicit clock and audit sink.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when config values or clients are invalid.
    pub fn build(
        config: &ServiceGateConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AccessAuditSink>,
    ) -> Result<StateParts, StateError> {
        let tenant = config.tenant();
        let nonce =
            Arc::new(NonceSource::new(config.nonce.value.clone(), config.nonce.allowed_addrs()?));
        let bootstrap = &config.bootstrap;
        let store: Arc<dyn DirectoryStore> = Arc::new(InMemoryDirectoryStore::seeded(
            bootstrap.providers.clone(),
            bootstrap.credentials.clone(),
        ));
        let rbac: Arc<dyn RbacStore> = Arc::new(InMemoryRbacStore::seeded(
            bootstrap.roles.clone(),
            bootstrap.bindings.clone(),
        ));
        let directory = Arc::new(ProviderDirectory::new(Arc::clone(&store)));
        let timeouts = &config.timeouts;

        let router = RequestRouter::new(
            Arc::clone(&directory),
            Arc::clone(&nonce),
            tenant.clone(),
            RouterTimeouts {
                provider: timeouts.provider(),
                legacy: timeouts.legacy(),
                legacy_stream: timeouts.legacy_stream(),
            },
        )?;
        let (dispatcher, queue) = EventDispatcher::channel();
        let fanout = Arc::new(WatcherFanout::new(
            Arc::clone(&directory),
            Arc::clone(&nonce),
            timeouts.dispatch(),
        )?);
        let events = EventModule::new(
            EventLog::new(config.events.max_events, Arc::clone(&clock)),
            Arc::clone(&nonce),
            tenant.clone(),
            config.events.notification_url.clone(),
            timeouts.notification(),
        )?;
        let authn = authn::build_chain(
            &config.authn,
            Arc::clone(&nonce),
            Arc::clone(&clock),
            timeouts.verify(),
        )?;
        let authz = authz::build_chain(&config.authz, Arc::clone(&rbac), timeouts.verify())?;
        let gateway_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| StateError::Client(err.to_string()))?;

        let state = Arc::new(Self {
            tenant,
            tokens: AccessTokenService::new(Arc::clone(&clock)),
            signatures: SignatureValidator::new(
                Arc::clone(&store),
                Arc::clone(&directory),
                Arc::clone(&clock),
            ),
            nonce,
            clock,
            store,
            directory,
            router,
            dispatcher,
            events,
            rbac,
            authn: authn.chain,
            authz,
            gateway_client,
            registrar_secret: config.registrar.jwt_secret.clone(),
            max_body_bytes: config.server.max_body_bytes,
            audit,
        });
        Ok(StateParts {
            state,
            queue,
            fanout,
            oidc: authn.oidc,
        })
    }
}
