// crates/service-gate-core/src/directory.rs
// ============================================================================
// Module: Provider Directory
// Description: Watch-synchronized snapshot of provider and watcher records.
// Purpose: Resolve (dataType, group, version) to active backends without I/O.
// Dependencies: tokio, tokio-util, tracing, crate::store
// ============================================================================

//! ## Overview
//! [`ProviderDirectory`] mirrors the store's provider collection in memory.
//! Lookups scan the snapshot and never touch the network. A background task
//! subscribes to the store's change stream, applies upserts and removals, and
//! falls back to a full resync when it lags behind the stream.
//!
//! Only `active` records are visible. [`ProviderDirectory::get_provider`]
//! never returns a watcher and [`ProviderDirectory::get_watchers`] never
//! returns a provider.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::records::ProviderKind;
use crate::records::ProviderRecord;
use crate::store::DirectoryStore;
use crate::store::ProviderEvent;
use crate::store::StoreError;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Directory lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// No active provider serves the triple.
    #[error("provider not found")]
    ProviderNotFound,
    /// Snapshot could not be read or refreshed.
    #[error("provider directory unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for DirectoryError {
    fn from(err: StoreError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

// ============================================================================
// SECTION: Directory
// ============================================================================

/// Local provider snapshot kept current from a [`DirectoryStore`].
pub struct ProviderDirectory {
    /// Backing directory service.
    store: Arc<dyn DirectoryStore>,
    /// Records by name.
    snapshot: RwLock<BTreeMap<String, ProviderRecord>>,
}

impl ProviderDirectory {
    /// Creates an empty directory; call [`Self::sync`] before serving.
    #[must_use]
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(BTreeMap::new()),
        }
    }

    /// Backing store handle.
    #[must_use]
    pub fn store(&self) -> Arc<dyn DirectoryStore> {
        Arc::clone(&self.store)
    }

    /// Replaces the snapshot with a fresh listing.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] when listing fails.
    pub async fn sync(&self) -> Result<(), DirectoryError> {
        let records = self.store.list_providers().await?;
        let count = records.len();
        let fresh: BTreeMap<String, ProviderRecord> =
            records.into_iter().map(|record| (record.name.clone(), record)).collect();
        let mut snapshot = self
            .snapshot
            .write()
            .map_err(|_| DirectoryError::Unavailable("snapshot lock poisoned".to_string()))?;
        *snapshot = fresh;
        debug!(records = count, "provider directory synced");
        Ok(())
    }

    /// Applies a single change event.
    pub fn apply(&self, event: ProviderEvent) {
        let Ok(mut snapshot) = self.snapshot.write() else {
            warn!("provider directory snapshot lock poisoned; event dropped");
            return;
        };
        match event {
            ProviderEvent::Added(record) => {
                info!(name = %record.name, kind = record.kind.as_str(), "provider record added");
                snapshot.insert(record.name.clone(), record);
            }
            ProviderEvent::Modified(record) => {
                info!(name = %record.name, kind = record.kind.as_str(), "provider record updated");
                snapshot.insert(record.name.clone(), record);
            }
            ProviderEvent::Deleted(record) => {
                info!(name = %record.name, kind = record.kind.as_str(), "provider record deleted");
                snapshot.remove(&record.name);
            }
        }
    }

    /// Returns the first active provider serving the triple.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::ProviderNotFound`] when nothing matches.
    pub fn get_provider(
        &self,
        data_type: &str,
        group: &str,
        version: &str,
    ) -> Result<ProviderRecord, DirectoryError> {
        self.select(ProviderKind::Provider, data_type, group, version)?
            .into_iter()
            .next()
            .ok_or(DirectoryError::ProviderNotFound)
    }

    /// Returns every active watcher for the triple, possibly none.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] when the snapshot is unreadable.
    pub fn get_watchers(
        &self,
        data_type: &str,
        group: &str,
        version: &str,
    ) -> Result<Vec<ProviderRecord>, DirectoryError> {
        self.select(ProviderKind::Watcher, data_type, group, version)
    }

    /// Clones matching active records out of the snapshot.
    fn select(
        &self,
        kind: ProviderKind,
        data_type: &str,
        group: &str,
        version: &str,
    ) -> Result<Vec<ProviderRecord>, DirectoryError> {
        let snapshot = self
            .snapshot
            .read()
            .map_err(|_| DirectoryError::Unavailable("snapshot lock poisoned".to_string()))?;
        Ok(snapshot
            .values()
            .filter(|record| {
                record.is_active() && record.kind == kind && record.serves(data_type, group, version)
            })
            .cloned()
            .collect())
    }

    /// Follows the store's change stream until `cancel` fires.
    ///
    /// Subscribes before the initial listing so no change between the two is
    /// lost. A lagged receiver triggers a full resync.
    pub fn spawn_watch(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.store.watch_providers();
        tokio::spawn(async move {
            if let Err(err) = self.sync().await {
                warn!(error = %err, "initial provider directory sync failed");
            }
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => self.apply(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "provider watch lagged; resyncing");
                            if let Err(err) = self.sync().await {
                                warn!(error = %err, "provider directory resync failed");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("provider directory watch stopped");
        })
    }
}
