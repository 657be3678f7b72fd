// crates/service-gate-server/src/lib.rs
// ============================================================================
// Module: Service Gate Server
// Description: HTTP surfaces of the gateway.
// Purpose: Compose core primitives into access-control and routing pipelines.
// Dependencies: service-gate-core, service-gate-config, axum, reqwest, tokio
// ============================================================================

//! ## Overview
//! The API listener issues access tokens, routes typed data calls to
//! directory-selected providers, relays legacy passthrough and websocket
//! traffic, fans mutations out to watchers, and maintains provider roles and
//! bindings. The gateway listener authenticates and authorizes every request
//! before proxying it to the service bound by the matching role.
//!
//! Security posture: every inbound header and body is untrusted until a
//! chain member or token check accepts it.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod access;
pub mod audit;
pub mod authn;
pub mod authz;
pub mod dispatcher;
pub mod events;
pub mod gateway;
pub mod headers;
pub mod jwt;
pub mod legacy;
pub mod nonce;
pub mod registry;
pub mod response;
pub mod router;
pub mod server;
pub mod state;
pub mod tunnel;

#[cfg(test)]
mod testing;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use server::ServerError;
pub use server::api_router;
pub use server::gateway_router;
pub use server::serve;
pub use state::GateState;
pub use state::StateError;
pub use state::StateParts;
