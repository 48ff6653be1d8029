use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CourierError;
use crate::queue::DeliveryQueue;
use crate::store::RecordStore;
use crate::types::{EventId, ProjectId};

/// A validated-on-entry intake request.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
}

/// What the publisher gets back. `duplicate` flags a replayed idempotency
/// key; the event id is the same one the original submission returned.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub event_id: EventId,
    pub duplicate: bool,
}

/// Front door of the pipeline: validates, persists the event idempotently,
/// fans out one delivery per active webhook, and enqueues each.
///
/// Store and queue handles are injected at construction and shared for the
/// process lifetime.
pub struct EventGateway {
    store: Arc<dyn RecordStore>,
    queue: Arc<DeliveryQueue>,
}

impl EventGateway {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<DeliveryQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn ingest(
        &self,
        project_id: ProjectId,
        request: IngestRequest,
    ) -> Result<IngestReceipt, CourierError> {
        if request.event_type.trim().is_empty() {
            return Err(CourierError::Validation("event type is required".into()));
        }
        if request.payload.is_null() {
            return Err(CourierError::Validation("payload is required".into()));
        }
        if request.idempotency_key.trim().is_empty() {
            return Err(CourierError::Validation(
                "idempotency key is required".into(),
            ));
        }

        let inserted = self
            .store
            .insert_event(
                project_id,
                &request.event_type,
                request.payload,
                &request.idempotency_key,
            )
            .await?;
        let (event, duplicate) = inserted.into_parts();

        // Fan out to every active webhook that does not yet have a delivery
        // for this event. The store's pair uniqueness does the dedup, so a
        // re-sent event only picks up webhooks registered in between, and
        // two racing submissions of the same key cannot double-create.
        let webhooks = self.store.active_webhooks(project_id).await?;
        let mut fanned_out = 0usize;

        for webhook in webhooks {
            let Some(delivery) = self.store.create_delivery(event.id, webhook.id).await? else {
                continue;
            };
            // Dedup key = delivery id: a gateway crash-and-retry between the
            // row insert and here cannot double-enqueue.
            self.queue.enqueue(delivery.id).await?;
            fanned_out += 1;
        }

        tracing::info!(
            target: "courier_gateway",
            event_id = %event.id,
            project_id = %project_id,
            event_type = %event.event_type,
            duplicate,
            fanned_out,
            "event accepted"
        );

        Ok(IngestReceipt {
            event_id: event.id,
            duplicate,
        })
    }

    /// Reconciliation sweep: re-enqueue every delivery resting in a runnable
    /// state. Covers rows whose enqueue was lost to a crash, and retries
    /// that were waiting on backoff when the previous process stopped.
    /// Safe to run at any time; already-queued ids are no-ops.
    pub async fn resync(&self) -> Result<usize, CourierError> {
        let deliveries = self.store.runnable_deliveries().await?;
        let mut requeued = 0usize;

        for delivery in deliveries {
            if self.queue.enqueue_at(delivery.id, delivery.attempt).await? {
                requeued += 1;
            }
        }

        if requeued > 0 {
            tracing::info!(
                target: "courier_gateway",
                requeued,
                "requeued resting deliveries"
            );
        }

        Ok(requeued)
    }
}
