// crates/service-gate-core/src/store.rs
// ============================================================================
// Module: Directory Store
// Description: Directory service contract and an in-memory implementation.
// Purpose: Persist provider records and application credentials.
// Dependencies: async-trait, tokio, crate::records
// ============================================================================

//! ## Overview
//! [`DirectoryStore`] is the list/get/create/update/delete contract over the
//! two directory collections, plus a change stream for provider records that
//! keeps the local provider snapshot current. [`InMemoryDirectoryStore`] is
//! the bundled implementation used by the server and by tests.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::records::ApplicationCredential;
use crate::records::ProviderRecord;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Buffered provider change events per subscriber.
const WATCH_BUFFER: usize = 256;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Directory store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Named record does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Named record already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// Backend failure.
    #[error("directory store error: {0}")]
    Backend(String),
}

// ============================================================================
// SECTION: Change Events
// ============================================================================

/// Provider record change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Record created.
    Added(ProviderRecord),
    /// Record replaced.
    Modified(ProviderRecord),
    /// Record removed.
    Deleted(ProviderRecord),
}

// ============================================================================
// SECTION: Store Contract
// ============================================================================

/// Directory service holding provider records and application credentials.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Lists every provider and watcher record.
    async fn list_providers(&self) -> Result<Vec<ProviderRecord>, StoreError>;

    /// Fetches a provider record by name.
    async fn get_provider(&self, name: &str) -> Result<Option<ProviderRecord>, StoreError>;

    /// Creates a provider record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] when the name is taken.
    async fn create_provider(&self, record: ProviderRecord) -> Result<(), StoreError>;

    /// Replaces an existing provider record.
    async fn update_provider(&self, record: ProviderRecord) -> Result<(), StoreError>;

    /// Deletes a provider record by name.
    async fn delete_provider(&self, name: &str) -> Result<(), StoreError>;

    /// Subscribes to provider record changes.
    fn watch_providers(&self) -> broadcast::Receiver<ProviderEvent>;

    /// Lists every application credential.
    async fn list_credentials(&self) -> Result<Vec<ApplicationCredential>, StoreError>;

    /// Fetches a credential by application name.
    async fn get_credential(&self, app: &str) -> Result<Option<ApplicationCredential>, StoreError>;

    /// Creates a credential.
    async fn create_credential(&self, credential: ApplicationCredential)
    -> Result<(), StoreError>;

    /// Replaces an existing credential.
    async fn update_credential(&self, credential: ApplicationCredential)
    -> Result<(), StoreError>;

    /// Deletes a credential by application name.
    async fn delete_credential(&self, app: &str) -> Result<(), StoreError>;
}

/// Finds the credential whose public key is `app_key`.
///
/// # Errors
///
/// Returns [`StoreError`] when listing fails.
pub async fn find_credential_by_key(
    store: &dyn DirectoryStore,
    app_key: &str,
) -> Result<Option<ApplicationCredential>, StoreError> {
    let credentials = store.list_credentials().await?;
    Ok(credentials.into_iter().find(|credential| credential.key == app_key))
}

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// Process-local directory store.
///
/// # Invariants
/// - Every successful provider mutation is broadcast after the map is updated.
#[derive(Clone)]
pub struct InMemoryDirectoryStore {
    /// Provider records by name.
    providers: Arc<Mutex<BTreeMap<String, ProviderRecord>>>,
    /// Credentials by application name.
    credentials: Arc<Mutex<BTreeMap<String, ApplicationCredential>>>,
    /// Provider change fan-out.
    events: broadcast::Sender<ProviderEvent>,
}

impl Default for InMemoryDirectoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            providers: Arc::new(Mutex::new(BTreeMap::new())),
            credentials: Arc::new(Mutex::new(BTreeMap::new())),
            events,
        }
    }

    /// Creates a store preloaded with records.
    #[must_use]
    pub fn seeded(providers: Vec<ProviderRecord>, credentials: Vec<ApplicationCredential>) -> Self {
        let store = Self::new();
        if let Ok(mut guard) = store.providers.lock() {
            guard.extend(providers.into_iter().map(|record| (record.name.clone(), record)));
        }
        if let Ok(mut guard) = store.credentials.lock() {
            guard.extend(credentials.into_iter().map(|cred| (cred.app.clone(), cred)));
        }
        store
    }

    /// Locks the provider map.
    fn providers(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, ProviderRecord>>, StoreError> {
        self.providers
            .lock()
            .map_err(|_| StoreError::Backend("provider map mutex poisoned".to_string()))
    }

    /// Locks the credential map.
    fn credentials(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, ApplicationCredential>>, StoreError>
    {
        self.credentials
            .lock()
            .map_err(|_| StoreError::Backend("credential map mutex poisoned".to_string()))
    }

    /// Publishes a change; having no subscribers is not an error.
    fn publish(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectoryStore {
    async fn list_providers(&self) -> Result<Vec<ProviderRecord>, StoreError> {
        Ok(self.providers()?.values().cloned().collect())
    }

    async fn get_provider(&self, name: &str) -> Result<Option<ProviderRecord>, StoreError> {
        Ok(self.providers()?.get(name).cloned())
    }

    async fn create_provider(&self, record: ProviderRecord) -> Result<(), StoreError> {
        {
            let mut guard = self.providers()?;
            if guard.contains_key(&record.name) {
                return Err(StoreError::AlreadyExists(format!("provider {}", record.name)));
            }
            guard.insert(record.name.clone(), record.clone());
        }
        self.publish(ProviderEvent::Added(record));
        Ok(())
    }

    async fn update_provider(&self, record: ProviderRecord) -> Result<(), StoreError> {
        {
            let mut guard = self.providers()?;
            let Some(slot) = guard.get_mut(&record.name) else {
                return Err(StoreError::NotFound(format!("provider {}", record.name)));
            };
            *slot = record.clone();
        }
        self.publish(ProviderEvent::Modified(record));
        Ok(())
    }

    async fn delete_provider(&self, name: &str) -> Result<(), StoreError> {
        let removed = self
            .providers()?
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(format!("provider {name}")))?;
        self.publish(ProviderEvent::Deleted(removed));
        Ok(())
    }

    fn watch_providers(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    async fn list_credentials(&self) -> Result<Vec<ApplicationCredential>, StoreError> {
        Ok(self.credentials()?.values().cloned().collect())
    }

    async fn get_credential(&self, app: &str) -> Result<Option<ApplicationCredential>, StoreError> {
        Ok(self.credentials()?.get(app).cloned())
    }

    async fn create_credential(
        &self,
        credential: ApplicationCredential,
    ) -> Result<(), StoreError> {
        let mut guard = self.credentials()?;
        if guard.contains_key(&credential.app) {
            return Err(StoreError::AlreadyExists(format!("application {}", credential.app)));
        }
        guard.insert(credential.app.clone(), credential);
        Ok(())
    }

    async fn update_credential(
        &self,
        credential: ApplicationCredential,
    ) -> Result<(), StoreError> {
        let mut guard = self.credentials()?;
        let Some(slot) = guard.get_mut(&credential.app) else {
            return Err(StoreError::NotFound(format!("application {}", credential.app)));
        };
        *slot = credential;
        Ok(())
    }

    async fn delete_credential(&self, app: &str) -> Result<(), StoreError> {
        self.credentials()?
            .remove(app)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("application {app}")))
    }
}
