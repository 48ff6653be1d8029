//! A webhook event-to-delivery pipeline.
//!
//! Projects register webhook endpoints and publish events; the pipeline
//! fans each event out to every active endpoint, delivers it with an
//! HMAC-SHA256 proof of authenticity, retries failures on an exponential
//! backoff budget, and keeps dead-lettered deliveries inspectable and
//! replayable.
//!
//! ## Guarantees
//! - Idempotent intake: one event per `(project, idempotency key)`
//! - Exactly-once fan-out: one delivery per `(event, webhook)` pair
//! - At-least-once delivery with bounded, backed-off retries
//! - A full per-attempt audit trail, success and failure alike
//!
//! ## Non-Guarantees
//! - Exactly-once delivery to the remote endpoint (receivers can detect
//!   replays via the signed timestamp)
//! - Ordering between deliveries of different events
//! - Endpoint-side deduplication
//!
//! The relational record store and the attempt-log object store are
//! consumed as capability traits; in-memory implementations are provided
//! for tests and single-process use.

mod api;
mod attempt_log;
mod error;
mod gateway;
mod queue;
mod replay;
mod signing;
mod store;
mod types;
mod worker;

pub use api::{courier_router, ApiState, IDEMPOTENCY_KEY_HEADER};
pub use attempt_log::{
    AttemptLog, AttemptLogStore, AttemptRequest, AttemptResponse, InMemoryObjectStore, ObjectStore,
};
pub use error::{AttemptFailure, CourierError, ErrorBody, JobError, StoreError};
pub use gateway::{EventGateway, IngestReceipt, IngestRequest};
pub use queue::{DeliveryQueue, Job, JobHandler, QueueConfig};
pub use replay::ReplayController;
pub use signing::{
    compute_signature, is_timestamp_fresh, parse_signature_header, signature_header,
    verify_signature, verify_webhook_request, ParsedSignature, VerificationError,
    SIGNATURE_HEADER,
};
pub use store::{DeliveryView, EventInsert, InMemoryRecordStore, RecordStore};
pub use types::{
    AttemptOutcome, Delivery, DeliveryAttempt, DeliveryId, DeliveryStatus, Event, EventId,
    Project, ProjectId, Webhook, WebhookId,
};
pub use worker::{DeliveryWorker, WorkerConfig, EVENT_TYPE_HEADER};
