// crates/service-gate-server/src/events.rs
// ============================================================================
// Module: Event Module
// Description: Built-in event provider and notification watcher.
// Purpose: Store fired events, page through them, and push notifications.
// Dependencies: axum, reqwest, time, service-gate-core, tracing
// ============================================================================

//! ## Overview
//! The gateway registers itself as the provider and watcher of the event
//! triple `(event, message-disptahcer.system-server, v1)`. Calls routed to
//! that triple come back in through three internal endpoints:
//! - `fire-event` appends the event to a bounded in-memory log,
//! - `list-event` pages through the log, newest first,
//! - `dispatch-event` turns a notification event into an alert and pushes it
//!   to the tenant's notification server.
//!
//! Each endpoint re-validates the access token carried in the body against
//! the body's own op and triple.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use service_gate_core::Clock;
use service_gate_core::DirectoryStore;
use service_gate_core::ProviderKind;
use service_gate_core::ProviderRecord;
use service_gate_core::StoreError;
use service_gate_core::TenantIdentity;
use service_gate_core::capability::DATA_TYPE_EVENT;
use service_gate_core::capability::OP_CREATE;
use service_gate_core::capability::OP_LIST;
use service_gate_core::capability::is_watcher_supported;
use service_gate_core::records::Callback;
use service_gate_core::records::OpApi;
use thiserror::Error;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::macros::format_description;
use tracing::info;
use tracing::warn;

use crate::headers;
use crate::nonce::NonceSource;
use crate::response::ApiError;
use crate::response::success;
use crate::response::success_empty;
use crate::router::DispatchRequest;
use crate::router::ListParam;
use crate::router::ProxyRequest;
use crate::state::GateState;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Provider group of the event module.
pub const EVENT_GROUP: &str = "message-disptahcer.system-server";
/// Version of the event module.
pub const EVENT_VERSION: &str = "v1";
/// Directory name of the event provider record.
pub const EVENT_PROVIDER_NAME: &str = "default-event-provider";
/// Directory name of the event watcher record.
pub const EVENT_WATCHER_NAME: &str = "default-event-watcher";
/// Route prefix of the module.
pub const EVENT_ROUTE: &str = "/message-dispatcher/v1alpha1";
/// Fire endpoint below [`EVENT_ROUTE`].
pub const PATH_FIRE_EVENT: &str = "/fire-event";
/// List endpoint below [`EVENT_ROUTE`].
pub const PATH_LIST_EVENT: &str = "/list-event";
/// Dispatch endpoint below [`EVENT_ROUTE`].
pub const PATH_DISPATCH_EVENT: &str = "/dispatch-event";

/// Event types forwarded to the notification server.
const NOTIFICATION_EVENT_TYPE: &str = "notification";

// ============================================================================
// SECTION: Event Shapes
// ============================================================================

/// Event carried in the `data` of event module calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Event schema version.
    #[serde(default)]
    pub version: String,
    /// Message and payload.
    #[serde(default)]
    pub data: EventData,
}

/// Body of an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Human-readable message.
    #[serde(rename = "msg", default)]
    pub message: String,
    /// Arbitrary payload.
    #[serde(default)]
    pub payload: Value,
}

/// Alert pushed to the notification server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    /// Alert labels.
    pub labels: BTreeMap<String, String>,
    /// Alert annotations.
    pub annotations: BTreeMap<String, String>,
}

impl Alert {
    /// Builds the alert for `event` in `namespace`.
    #[must_use]
    pub fn for_event(event: &Event, namespace: &str) -> Self {
        Self {
            labels: BTreeMap::from([
                ("namespace".to_string(), namespace.to_string()),
                ("type".to_string(), event.event_type.clone()),
                ("version".to_string(), event.version.clone()),
                ("payload".to_string(), event.data.payload.to_string()),
            ]),
            annotations: BTreeMap::from([("message".to_string(), event.data.message.clone())]),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Event module failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Request does not target the event module.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Event or filter could not be parsed.
    #[error("invalid event request: {0}")]
    Invalid(String),
    /// Notification push failed.
    #[error("push notification: {0}")]
    Notify(String),
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Unsupported(_) | EventError::Invalid(_) => Self::bad_request(err.to_string()),
            EventError::Notify(_) => Self::new(axum::http::StatusCode::BAD_GATEWAY, err.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Event Log
// ============================================================================

/// Stored event row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Monotonic id.
    pub id: u64,
    /// Event type.
    pub event_type: String,
    /// Serialized event.
    pub raw_message: String,
    /// Insertion time.
    pub create_time: OffsetDateTime,
}

/// Bounded in-memory event log; the oldest rows are evicted first.
pub struct EventLog {
    /// Rows, oldest first.
    rows: Mutex<VecDeque<StoredEvent>>,
    /// Next id to assign.
    next_id: Mutex<u64>,
    /// Retained rows.
    capacity: usize,
    /// Time source for `create_time`.
    clock: Arc<dyn Clock>,
}

impl EventLog {
    /// Creates a log retaining `capacity` rows.
    #[must_use]
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(VecDeque::new()),
            next_id: Mutex::new(1),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// Appends `event` and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Invalid`] when the event cannot be serialized or
    /// the log lock is poisoned.
    pub fn append(&self, event: &Event) -> Result<u64, EventError> {
        let raw_message =
            serde_json::to_string(event).map_err(|err| EventError::Invalid(err.to_string()))?;
        let id = {
            let mut next = self.next_id.lock().map_err(|_| poisoned())?;
            let id = *next;
            *next += 1;
            id
        };
        let mut rows = self.rows.lock().map_err(|_| poisoned())?;
        rows.push_back(StoredEvent {
            id,
            event_type: event.event_type.clone(),
            raw_message,
            create_time: self.clock.now(),
        });
        while rows.len() > self.capacity {
            rows.pop_front();
        }
        Ok(id)
    }

    /// Returns events matching `param`, newest first.
    ///
    /// `create_time` takes one bound (upper) or two (inclusive range) in
    /// `YYYY-MM-DD HH:MM:SS` UTC. `id`, `event_type`, and `raw_message` take
    /// a list of accepted values. A missing page or a zero limit returns every
    /// match after the offset.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Invalid`] for unknown filter columns, unparsable
    /// times, or rows that no longer decode.
    pub fn list(&self, param: &ListParam) -> Result<Vec<Event>, EventError> {
        let predicates = param
            .filters
            .iter()
            .map(|(column, values)| RowFilter::parse(column, values))
            .collect::<Result<Vec<_>, _>>()?;
        let rows = self.rows.lock().map_err(|_| poisoned())?;
        let mut matched: Vec<&StoredEvent> =
            rows.iter().filter(|row| predicates.iter().all(|filter| filter.accepts(row))).collect();
        matched.sort_by(|a, b| b.create_time.cmp(&a.create_time).then(b.id.cmp(&a.id)));
        let (offset, limit) = param.page.map_or((0, 0), |page| (page.offset, page.limit));
        let limit = if limit == 0 { usize::MAX } else { limit };
        matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| {
                serde_json::from_str(&row.raw_message)
                    .map_err(|err| EventError::Invalid(err.to_string()))
            })
            .collect()
    }

    /// Number of retained rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or_default()
    }

    /// Returns true when no rows are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock failure.
fn poisoned() -> EventError {
    EventError::Invalid("event log lock poisoned".to_string())
}

/// One compiled list filter.
enum RowFilter {
    /// `create_time <= bound`.
    Before(OffsetDateTime),
    /// `start <= create_time <= end`.
    Between(OffsetDateTime, OffsetDateTime),
    /// Column value is one of the listed values.
    In(&'static str, Vec<String>),
}

impl RowFilter {
    /// Compiles a filter for `column`.
    fn parse(column: &str, values: &[String]) -> Result<Self, EventError> {
        match column {
            "create_time" => match values {
                [bound] => Ok(Self::Before(parse_time(bound)?)),
                [start, end, ..] => Ok(Self::Between(parse_time(start)?, parse_time(end)?)),
                [] => Err(EventError::Invalid("create_time filter needs a value".to_string())),
            },
            "id" => Ok(Self::In("id", values.to_vec())),
            "event_type" => Ok(Self::In("event_type", values.to_vec())),
            "raw_message" => Ok(Self::In("raw_message", values.to_vec())),
            other => Err(EventError::Invalid(format!("unknown filter column {other}"))),
        }
    }

    /// Returns true when `row` passes.
    fn accepts(&self, row: &StoredEvent) -> bool {
        match self {
            Self::Before(bound) => row.create_time <= *bound,
            Self::Between(start, end) => *start <= row.create_time && row.create_time <= *end,
            Self::In(column, values) => {
                let cell = match *column {
                    "id" => row.id.to_string(),
                    "event_type" => row.event_type.clone(),
                    _ => row.raw_message.clone(),
                };
                values.contains(&cell)
            }
        }
    }
}

/// Parses `YYYY-MM-DD HH:MM:SS` as UTC.
fn parse_time(value: &str) -> Result<OffsetDateTime, EventError> {
    PrimitiveDateTime::parse(value, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| EventError::Invalid(format!("time {value}: {err}")))
}

// ============================================================================
// SECTION: Module
// ============================================================================

/// Event log plus the notification pusher.
pub struct EventModule {
    /// Stored events.
    log: EventLog,
    /// Service-auth nonce used as the push credential.
    nonce: Arc<NonceSource>,
    /// Tenant the module serves.
    tenant: TenantIdentity,
    /// Push target.
    notification_url: String,
    /// Outbound client.
    client: reqwest::Client,
}

impl EventModule {
    /// Creates the module.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Notify`] when the HTTP client cannot be built.
    pub fn new(
        log: EventLog,
        nonce: Arc<NonceSource>,
        tenant: TenantIdentity,
        notification_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EventError> {
        let notification_url = notification_url.unwrap_or_else(|| {
            format!("http://notifications-server.{}/notification/system/push", tenant.user_space())
        });
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| EventError::Notify(err.to_string()))?;
        Ok(Self {
            log,
            nonce,
            tenant,
            notification_url,
            client,
        })
    }

    /// Event log.
    #[must_use]
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    /// Pushes the alert for `event` to the notification server.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Notify`] when the push fails or is not answered
    /// with 200.
    pub async fn notify(&self, event: &Event) -> Result<(), EventError> {
        let alert = Alert::for_event(event, &self.tenant.namespace);
        let reply = self
            .client
            .post(&self.notification_url)
            .basic_auth(headers::BACKEND_NONCE, Some(self.nonce.current()))
            .json(&alert)
            .send()
            .await
            .map_err(|err| EventError::Notify(err.to_string()))?;
        let status = reply.status();
        if status != reqwest::StatusCode::OK {
            let body = reply.text().await.unwrap_or_default();
            return Err(EventError::Notify(format!("{}, {body}", status.as_u16())));
        }
        info!(event_type = %event.event_type, "notification pushed");
        Ok(())
    }
}

// ============================================================================
// SECTION: Registration
// ============================================================================

/// Directory records announcing the event module at `endpoint`.
#[must_use]
pub fn module_records(tenant: &TenantIdentity, endpoint: &str) -> [ProviderRecord; 2] {
    let base = ProviderRecord {
        namespace: tenant.namespace.clone(),
        group: EVENT_GROUP.to_string(),
        data_type: DATA_TYPE_EVENT.to_string(),
        version: EVENT_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        description: "default event provider in system-server".to_string(),
        ..ProviderRecord::default()
    };
    let provider = ProviderRecord {
        name: EVENT_PROVIDER_NAME.to_string(),
        kind: ProviderKind::Provider,
        op_apis: vec![
            OpApi {
                name: OP_CREATE.to_string(),
                uri: format!("{EVENT_ROUTE}{PATH_FIRE_EVENT}"),
            },
            OpApi {
                name: OP_LIST.to_string(),
                uri: format!("{EVENT_ROUTE}{PATH_LIST_EVENT}"),
            },
        ],
        ..base.clone()
    };
    let watcher = ProviderRecord {
        name: EVENT_WATCHER_NAME.to_string(),
        kind: ProviderKind::Watcher,
        callbacks: vec![Callback {
            op: OP_CREATE.to_string(),
            uri: format!("{EVENT_ROUTE}{PATH_DISPATCH_EVENT}"),
            filters: BTreeMap::from([(
                "type".to_string(),
                vec![NOTIFICATION_EVENT_TYPE.to_string()],
            )]),
        }],
        ..base
    };
    [watcher, provider]
}

/// Replaces the module's directory records.
///
/// # Errors
///
/// Returns [`StoreError`] when any store call fails; callers treat this as
/// fatal to startup.
pub async fn register_module(
    store: &dyn DirectoryStore,
    tenant: &TenantIdentity,
    endpoint: &str,
) -> Result<(), StoreError> {
    for record in module_records(tenant, endpoint) {
        if store.get_provider(&record.name).await?.is_some() {
            store.delete_provider(&record.name).await?;
        }
        info!(name = %record.name, kind = record.kind.as_str(), "registering event module record");
        store.create_provider(record).await?;
    }
    Ok(())
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

/// `POST /message-dispatcher/v1alpha1/fire-event`.
pub async fn fire_event(
    State(state): State<Arc<GateState>>,
    Json(request): Json<ProxyRequest>,
) -> Result<Response, ApiError> {
    let event = checked_event(&state, &request)?;
    info!(event_type = %event.event_type, "fire event");
    let id = state.events.log().append(&event)?;
    info!(id, "event stored");
    Ok(success_empty())
}

/// `POST /message-dispatcher/v1alpha1/list-event`.
pub async fn list_event(
    State(state): State<Arc<GateState>>,
    Json(request): Json<ProxyRequest>,
) -> Result<Response, ApiError> {
    validate_request(&state, &request)?;
    let param: ListParam = match request.param {
        Some(param) => {
            serde_json::from_value(param).map_err(|err| EventError::Invalid(err.to_string()))?
        }
        None => ListParam::default(),
    };
    let events = state.events.log().list(&param)?;
    Ok(success(events))
}

/// `POST /message-dispatcher/v1alpha1/dispatch-event`.
pub async fn dispatch_event(
    State(state): State<Arc<GateState>>,
    Json(request): Json<DispatchRequest>,
) -> Result<Response, ApiError> {
    if !is_watcher_supported(&request.request.op) {
        return Err(EventError::Unsupported("method not provided".to_string()).into());
    }
    let event = checked_event(&state, &request.request)?;
    info!(event_type = %event.event_type, "dispatch event");
    state.events.notify(&event).await.map_err(|err| {
        warn!(error = %err, "notification push failed");
        ApiError::from(err)
    })?;
    Ok(success_empty())
}

/// Validates the token and target, then decodes the event.
fn checked_event(state: &GateState, request: &ProxyRequest) -> Result<Event, ApiError> {
    validate_request(state, request)?;
    let data = request.data.clone().unwrap_or(Value::Null);
    serde_json::from_value(data)
        .map_err(|err| EventError::Invalid(format!("event data: {err}")).into())
}

/// Validates the body token and the event triple.
fn validate_request(state: &GateState, request: &ProxyRequest) -> Result<(), ApiError> {
    state
        .tokens
        .validate(&request.token, &request.op, &request.data_type, &request.version, &request.group)
        .map_err(|err| ApiError::forbidden(err.to_string()))?;
    if request.data_type != DATA_TYPE_EVENT {
        return Err(EventError::Unsupported("wrong data type".to_string()).into());
    }
    if request.group != EVENT_GROUP {
        return Err(EventError::Unsupported("group error".to_string()).into());
    }
    Ok(())
}
