// crates/service-gate-server/src/nonce.rs
// ============================================================================
// Module: Service Nonce
// Description: Shared secret used to authenticate internal service calls.
// Purpose: Own the rotating nonce and the allowlist of peers that may read it.
// Dependencies: subtle, tokio, tokio-util, uuid, tracing
// ============================================================================

//! ## Overview
//! One [`NonceSource`] is built at startup and shared by reference with every
//! component that injects or checks the internal service-auth header. The
//! value may rotate on a fixed interval; readers always see a whole value.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Rotating shared nonce.
pub struct NonceSource {
    /// Current value.
    current: RwLock<String>,
    /// Peers allowed to fetch the value.
    allowed: BTreeSet<IpAddr>,
}

impl NonceSource {
    /// Creates a source with `initial` or a random value.
    #[must_use]
    pub fn new(initial: Option<String>, allowed: BTreeSet<IpAddr>) -> Self {
        Self {
            current: RwLock::new(initial.unwrap_or_else(random_nonce)),
            allowed,
        }
    }

    /// Current nonce value.
    #[must_use]
    pub fn current(&self) -> String {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns true when `candidate` equals the current value, compared in
    /// constant time.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let current = self.current();
        !current.is_empty() && bool::from(current.as_bytes().ct_eq(candidate.as_bytes()))
    }

    /// Replaces the value with a fresh random one.
    pub fn rotate(&self) -> String {
        let fresh = random_nonce();
        self.current.write().unwrap_or_else(PoisonError::into_inner).clone_from(&fresh);
        fresh
    }

    /// Returns true when `peer` may read the nonce.
    #[must_use]
    pub fn is_allowed(&self, peer: IpAddr) -> bool {
        self.allowed.contains(&peer)
    }

    /// Rotates the nonce every `interval` until `cancel` fires.
    pub fn spawn_rotation(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.rotate();
                        info!("service nonce rotated");
                    }
                }
            }
        })
    }
}

/// Random nonce value.
fn random_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}
