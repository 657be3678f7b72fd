// crates/service-gate-server/src/dispatcher.rs
// ============================================================================
// Module: Event Dispatcher
// Description: Queued, best-effort fanout of mutations to watchers.
// Purpose: Notify watcher callbacks without blocking the request path.
// Dependencies: tokio, tokio-util, reqwest, service-gate-core, tracing
// ============================================================================

//! ## Overview
//! [`EventDispatcher::enqueue`] pushes onto an unbounded FIFO and never
//! blocks. Worker tasks share the receiving end and drain it until the
//! shutdown token fires. An optional shared ticker paces the workers to a
//! maximum number of items per second.
//!
//! For each item, [`WatcherFanout::deliver`] resolves the active watchers
//! of the item's triple and POSTs the dispatch payload to every callback
//! whose op equals the item's op and whose filters accept the item's data.
//! Delivery is at-most-once: the first failing callback ends the item, which
//! is logged and dropped. Nothing is retried.
//!
//! Invariants:
//! - `enqueue` never waits on workers or the network.
//! - A callback whose filters cannot be evaluated is skipped, not failed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use serde_json::Value;
use service_gate_core::DirectoryError;
use service_gate_core::ProviderDirectory;
use service_gate_core::filter::evaluate_filters;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::headers;
use crate::nonce::NonceSource;
use crate::router::DispatchRequest;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Fanout failures for one item.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Watcher lookup failed.
    #[error("watcher lookup failed: {0}")]
    Lookup(#[from] DirectoryError),
    /// Callback could not be reached.
    #[error("dispatch to {url} failed: {message}")]
    Transport {
        /// Callback URL.
        url: String,
        /// Transport error text.
        message: String,
    },
    /// Callback answered with status 400 or above.
    #[error("dispatch to {url} failed: code {status}, {body}")]
    Upstream {
        /// Callback URL.
        url: String,
        /// Callback status.
        status: u16,
        /// Callback body.
        body: String,
    },
    /// HTTP client could not be built.
    #[error("dispatch client: {0}")]
    Client(String),
}

// ============================================================================
// SECTION: Queue
// ============================================================================

/// Cloneable handle used to enqueue dispatch items.
#[derive(Clone)]
pub struct EventDispatcher {
    /// Sending half of the FIFO.
    sender: mpsc::UnboundedSender<DispatchRequest>,
}

/// Receiving half of the FIFO, consumed by [`spawn_workers`].
pub struct DispatchQueue {
    /// Receiver shared by workers.
    receiver: mpsc::UnboundedReceiver<DispatchRequest>,
}

impl EventDispatcher {
    /// Creates the handle and the queue it feeds.
    #[must_use]
    pub fn channel() -> (Self, DispatchQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
            },
            DispatchQueue {
                receiver,
            },
        )
    }

    /// Queues `item`; dropped with a warning once workers have stopped.
    pub fn enqueue(&self, item: DispatchRequest) {
        let op = item.request.op.clone();
        if self.sender.send(item).is_err() {
            warn!(op = %op, "dispatcher stopped; event dropped");
        }
    }
}

// ============================================================================
// SECTION: Fanout
// ============================================================================

/// Delivers one item to its matching watcher callbacks.
pub struct WatcherFanout {
    /// Watcher lookup.
    directory: Arc<ProviderDirectory>,
    /// Service-auth nonce.
    nonce: Arc<NonceSource>,
    /// Outbound client.
    client: reqwest::Client,
    /// Per-callback timeout.
    timeout: Duration,
}

impl WatcherFanout {
    /// Creates a fanout with a per-callback `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Client`] when the HTTP client cannot be built.
    pub fn new(
        directory: Arc<ProviderDirectory>,
        nonce: Arc<NonceSource>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DispatchError::Client(err.to_string()))?;
        Ok(Self {
            directory,
            nonce,
            client,
            timeout,
        })
    }

    /// POSTs `item` to every matching callback and returns how many were sent.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] on the first lookup, transport, or status
    /// failure; later callbacks are not attempted.
    pub async fn deliver(&self, item: &DispatchRequest) -> Result<usize, DispatchError> {
        let request = &item.request;
        let watchers =
            self.directory.get_watchers(&request.data_type, &request.group, &request.version)?;
        let data = request.data.clone().unwrap_or(Value::Null);
        let mut delivered = 0;
        for watcher in &watchers {
            for callback in watcher.callbacks.iter().filter(|callback| callback.op == request.op) {
                match evaluate_filters(&data, &callback.filters) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(watcher = %watcher.name, uri = %callback.uri, "callback filtered out");
                        continue;
                    }
                    Err(err) => {
                        warn!(watcher = %watcher.name, uri = %callback.uri, error = %err, "callback filter failed");
                        continue;
                    }
                }
                let url = watcher.url_for(&callback.uri);
                self.post(&url, item).await?;
                info!(watcher = %watcher.name, url = %url, op = %request.op, "event dispatched");
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Sends one dispatch POST.
    async fn post(&self, url: &str, item: &DispatchRequest) -> Result<(), DispatchError> {
        let reply = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(headers::BACKEND_NONCE, self.nonce.current())
            .json(item)
            .send()
            .await
            .map_err(|err| DispatchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let status = reply.status().as_u16();
        if status >= 400 {
            let body = reply.text().await.unwrap_or_default();
            return Err(DispatchError::Upstream {
                url: url.to_string(),
                status,
                body,
            });
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Workers
// ============================================================================

/// Starts `workers` drain loops over `queue`.
///
/// With `max_per_second` set, all workers share one ticker so the combined
/// drain rate stays under the limit.
pub fn spawn_workers(
    queue: DispatchQueue,
    fanout: Arc<WatcherFanout>,
    workers: usize,
    max_per_second: Option<u32>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(queue.receiver));
    let pace = max_per_second.filter(|rate| *rate > 0).map(|rate| {
        let mut ticker = tokio::time::interval(Duration::from_secs(1) / rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Arc::new(Mutex::new(ticker))
    });
    (0 .. workers.max(1))
        .map(|worker| {
            let receiver = Arc::clone(&receiver);
            let fanout = Arc::clone(&fanout);
            let pace = pace.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                drain(worker, &receiver, &fanout, pace.as_deref(), &cancel).await;
            })
        })
        .collect()
}

/// One worker loop.
async fn drain(
    worker: usize,
    receiver: &Mutex<mpsc::UnboundedReceiver<DispatchRequest>>,
    fanout: &WatcherFanout,
    pace: Option<&Mutex<Interval>>,
    cancel: &CancellationToken,
) {
    debug!(worker, "dispatch worker started");
    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => None,
            item = async { receiver.lock().await.recv().await } => item,
        };
        let Some(item) = item else {
            break;
        };
        if let Some(pace) = pace {
            pace.lock().await.tick().await;
        }
        if let Err(err) = fanout.deliver(&item).await {
            warn!(worker, op = %item.request.op, error = %err, "dispatch failed; event dropped");
        }
    }
    debug!(worker, "dispatch worker stopped");
}

#[cfg(test)]
mod tests;
