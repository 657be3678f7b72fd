// crates/service-gate-config/src/lib.rs
// ============================================================================
// Module: Service Gate Config Library
// Description: Canonical config model and validation.
// Purpose: Single source of truth for service-gate.toml semantics.
// Dependencies: service-gate-core, serde, toml
// ============================================================================

//! ## Overview
//! `service-gate-config` defines the configuration model for Service Gate
//! with strict, fail-closed validation.
//!
//! Security posture: config inputs are untrusted and validated before use.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
