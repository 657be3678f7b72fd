// crates/service-gate-server/src/server.rs
// ============================================================================
// Module: Service Gate Server
// Description: Route tables, background tasks, and listener lifecycle.
// Purpose: Serve the API and gateway listeners until cancelled.
// Dependencies: axum, tokio, tokio-util, tracing
// ============================================================================

//! ## Overview
//! Two listeners share one [`GateState`]:
//! - the API listener serves the access-control, data, legacy, event, and
//!   registration routes,
//! - the optional gateway listener runs every request through the authn and
//!   authz chains and proxies it to the bound service.
//!
//! [`serve`] syncs the directory, registers the event module, starts the
//! dispatcher workers and refresh loops, then serves until the token is
//! cancelled. Listeners drain within the configured grace period.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::middleware;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::any;
use axum::routing::get;
use axum::routing::post;
use service_gate_config::ServiceGateConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::access;
use crate::audit::AccessAuditEvent;
use crate::dispatcher;
use crate::events;
use crate::events::EVENT_ROUTE;
use crate::events::PATH_DISPATCH_EVENT;
use crate::events::PATH_FIRE_EVENT;
use crate::events::PATH_LIST_EVENT;
use crate::gateway;
use crate::headers;
use crate::legacy;
use crate::registry;
use crate::response::ApiError;
use crate::response::log_failures;
use crate::router;
use crate::state::GateState;
use crate::state::StateError;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Server lifecycle failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// State could not be assembled.
    #[error(transparent)]
    State(#[from] StateError),
    /// Startup registration or sync failed.
    #[error("startup failed: {0}")]
    Startup(String),
    /// Listener could not bind.
    #[error("bind {addr} failed: {reason}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// OS error.
        reason: String,
    },
    /// Listener stopped with an error.
    #[error("listener failed: {0}")]
    Serve(String),
}

// ============================================================================
// SECTION: Routes
// ============================================================================

/// Routes served on the API listener.
pub fn api_router(state: Arc<GateState>) -> Router {
    let registration = Router::new()
        .route("/provider/v2alpha1/register", post(registry::provider_register))
        .route("/provider/v2alpha1/unregister", post(registry::provider_unregister))
        .route("/permission/v2alpha1/register", post(registry::permission_register))
        .route("/permission/v2alpha1/unregister", post(registry::permission_unregister))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_identity));

    Router::new()
        .route("/permission/v1alpha1/access", post(access::access))
        .route("/permission/v1alpha1/register", post(access::register))
        .route("/permission/v1alpha1/unregister", post(access::unregister))
        .route("/permission/v1alpha1/nonce", get(access::nonce))
        .route(&format!("{EVENT_ROUTE}{PATH_FIRE_EVENT}"), post(events::fire_event))
        .route(&format!("{EVENT_ROUTE}{PATH_LIST_EVENT}"), post(events::list_event))
        .route(&format!("{EVENT_ROUTE}{PATH_DISPATCH_EVENT}"), post(events::dispatch_event))
        .route("/legacy/v1alpha1/{group}/{version}/{*subpath}", any(legacy::legacy_v1))
        .route(
            "/system-server/v2/{datatype}/{group}/{version}/{*subpath}",
            any(legacy::legacy_v2),
        )
        .route("/{datatype}/{group}/{version}", get(router::list).post(router::create))
        .route(
            "/{datatype}/{group}/{version}/{id}",
            get(router::get_one)
                .put(router::update)
                .delete(router::delete)
                .post(router::action),
        )
        .merge(registration)
        .layer(middleware::from_fn(log_failures))
        .with_state(state)
}

/// Routes served on the gateway listener.
pub fn gateway_router(state: Arc<GateState>) -> Router {
    Router::new()
        .fallback(gateway::gateway)
        .layer(middleware::from_fn(log_failures))
        .with_state(state)
}

/// Authenticates registration calls and pins `X-BFL-USER` to the result.
async fn require_identity(
    State(state): State<Arc<GateState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let user = match state.authn.authenticate(request.headers()).await {
        Ok(Some(user)) => user,
        Ok(None) | Err(_) => {
            state.audit.record(&AccessAuditEvent::denied(
                "registration_authn",
                None,
                &path,
                "unauthenticated",
            ));
            return ApiError::unauthorized("Unauthorized").into_response();
        }
    };
    let Ok(value) = HeaderValue::from_str(&user.name) else {
        return ApiError::bad_request("invalid user name").into_response();
    };
    request.headers_mut().insert(headers::BFL_USER, value);
    next.run(request).await
}

// ============================================================================
// SECTION: Lifecycle
// ============================================================================

/// Builds state from `config` and serves until `cancel` fires.
///
/// # Errors
///
/// Returns [`ServerError`] when startup fails, a listener cannot bind, or a
/// listener stops with an error.
pub async fn serve(config: &ServiceGateConfig, cancel: CancellationToken) -> Result<(), ServerError> {
    let parts = GateState::from_config(config)?;
    let state = parts.state;

    state.directory.sync().await.map_err(|err| ServerError::Startup(err.to_string()))?;
    events::register_module(state.store.as_ref(), &state.tenant, &config.events.endpoint)
        .await
        .map_err(|err| ServerError::Startup(format!("event module registration: {err}")))?;

    let mut background = dispatcher::spawn_workers(
        parts.queue,
        parts.fanout,
        config.dispatcher.workers,
        config.dispatcher.max_per_second,
        &cancel,
    );
    background.push(Arc::clone(&state.directory).spawn_watch(cancel.clone()));
    if let Some(oidc) = parts.oidc {
        background.push(oidc.spawn_refresh(cancel.clone()));
    }
    if let Some(interval) = config.nonce.rotate_interval() {
        background.push(Arc::clone(&state.nonce).spawn_rotation(interval, cancel.clone()));
    }

    let mut listeners = JoinSet::new();
    let api_addr = config.server.bind_addr().map_err(|err| ServerError::Startup(err.to_string()))?;
    let api = bind(api_addr).await?;
    info!(addr = %api_addr, "api listener ready");
    listeners.spawn(run_listener(api, api_router(Arc::clone(&state)), cancel.clone()));
    if let Some(addr) = config.server.gateway_addr().map_err(|err| ServerError::Startup(err.to_string()))?
    {
        let gateway = bind(addr).await?;
        info!(addr = %addr, "gateway listener ready");
        listeners.spawn(run_listener(gateway, gateway_router(Arc::clone(&state)), cancel.clone()));
    }

    let early = tokio::select! {
        () = cancel.cancelled() => None,
        joined = listeners.join_next() => joined,
    };
    cancel.cancel();
    let mut outcome = Ok(());
    if let Some(joined) = early {
        outcome = listener_result(joined);
    }

    let grace = config.server.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = listeners.join_next().await {
            if let Err(err) = listener_result(joined) {
                error!(error = %err, "listener stopped with error");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs(), "shutdown grace elapsed; aborting listeners");
        listeners.abort_all();
    }
    for task in background {
        task.abort();
    }
    info!("service gate stopped");
    outcome
}

/// Binds a listener.
async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|err| ServerError::Bind {
        addr,
        reason: err.to_string(),
    })
}

/// Serves `app` until `cancel` fires.
async fn run_listener(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|err| ServerError::Serve(err.to_string()))
}

/// Flattens a joined listener task.
fn listener_result(
    joined: Result<Result<(), ServerError>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    joined.map_err(|err| ServerError::Serve(err.to_string()))?
}
