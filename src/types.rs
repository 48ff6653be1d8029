use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id! {
    /// Unique identifier for a project (tenant boundary).
    ///
    /// Strongly typed to avoid accidental mixing with other entity ids.
    ProjectId
}

entity_id! {
    /// Unique identifier for a registered webhook endpoint.
    WebhookId
}

entity_id! {
    /// Unique identifier for a published event.
    EventId
}

entity_id! {
    /// Unique identifier for a delivery (one event to one webhook).
    ///
    /// Doubles as the queue's dedup key, so a delivery never has two jobs
    /// in flight at once.
    DeliveryId
}

/// Tenant boundary. Owns webhooks and, transitively, events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Opaque bearer credential presented on API calls.
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(),
            name: name.into(),
            api_key: api_key.into(),
            created_at: Utc::now(),
        }
    }
}

/// Destination for webhook delivery.
///
/// A webhook is a pure configuration row: where to POST, which secret signs
/// the payload, and whether fan-out should still target it. Webhooks are
/// never deleted by the pipeline, only flipped inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub project_id: ProjectId,
    pub url: String,
    /// Per-webhook signing secret (`whsec_` prefixed).
    pub secret: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn new(project_id: ProjectId, url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: WebhookId::new(),
            project_id,
            url: url.into(),
            secret: secret.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// An immutable published fact.
///
/// `(project_id, idempotency_key)` is unique: submitting the same key twice
/// must yield the same event row. Events are never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub project_id: ProjectId,
    pub event_type: String,
    /// Opaque JSON payload, forwarded verbatim to endpoints.
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        project_id: ProjectId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            project_id,
            event_type: event_type.into(),
            payload,
            idempotency_key: idempotency_key.into(),
            created_at: Utc::now(),
        }
    }
}

/// Delivery lifecycle status.
///
/// `Pending` means not yet attempted (fresh fan-out or replay). `Retrying`
/// is the resting state between a failed attempt and its re-run. `Success`
/// and `Dead` are terminal; only `Dead` can be replayed. `Failed` marks a
/// non-retryable data fault and is likewise never revisited by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
    Dead,
}

impl DeliveryStatus {
    /// Whether the queue is expected to run (or re-run) this delivery.
    pub fn awaits_attempt(&self) -> bool {
        matches!(self, DeliveryStatus::Pending | DeliveryStatus::Retrying)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Retrying => "RETRYING",
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

/// The unit of work: one event bound for one webhook.
///
/// At most one delivery exists per `(event_id, webhook_id)` pair; the record
/// store enforces the invariant at creation time. Mutated only by the worker
/// (status, attempt, response, error) or by replay (reset to `Pending`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub event_id: EventId,
    pub webhook_id: WebhookId,
    pub status: DeliveryStatus,
    /// Attempt number, owned by the queue: the attempt that ran last on a
    /// settled delivery, or the attempt that will run next on a resting one.
    pub attempt: u32,
    pub response_code: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(event_id: EventId, webhook_id: WebhookId) -> Self {
        let now = Utc::now();
        Self {
            id: DeliveryId::new(),
            event_id,
            webhook_id,
            status: DeliveryStatus::Pending,
            attempt: 1,
            response_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Coarse outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    Failed,
}

/// Immutable audit record of one execution of a delivery.
///
/// The heavyweight request/response capture lives in the attempt log store;
/// this row carries the reference key plus enough to list attempts cheaply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub delivery_id: DeliveryId,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    /// Key of the full request/response capture in the attempt log store.
    pub log_key: String,
    pub response_code: Option<u16>,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn new(
        delivery_id: DeliveryId,
        attempt_number: u32,
        outcome: AttemptOutcome,
        log_key: impl Into<String>,
        response_code: Option<u16>,
        latency_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            delivery_id,
            attempt_number,
            outcome,
            log_key: log_key.into(),
            response_code,
            latency_ms,
            created_at: Utc::now(),
        }
    }
}
