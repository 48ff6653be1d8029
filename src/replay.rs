use std::sync::Arc;

use crate::error::CourierError;
use crate::queue::DeliveryQueue;
use crate::store::RecordStore;
use crate::types::{DeliveryId, DeliveryStatus, ProjectId};

/// Re-injects dead-lettered deliveries into the pipeline.
pub struct ReplayController {
    store: Arc<dyn RecordStore>,
    queue: Arc<DeliveryQueue>,
}

impl ReplayController {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<DeliveryQueue>) -> Self {
        Self { store, queue }
    }

    /// Reset a `Dead` delivery to `Pending` with a fresh attempt budget and
    /// enqueue it. A delivery owned by another project presents as absent.
    pub async fn replay(
        &self,
        project_id: ProjectId,
        delivery_id: DeliveryId,
    ) -> Result<(), CourierError> {
        let Some(delivery) = self.store.load_delivery(delivery_id).await? else {
            return Err(CourierError::NotFound("delivery"));
        };
        let Some(event) = self.store.load_event(delivery.event_id).await? else {
            return Err(CourierError::NotFound("delivery"));
        };
        if event.project_id != project_id {
            return Err(CourierError::NotFound("delivery"));
        }

        if delivery.status != DeliveryStatus::Dead {
            return Err(CourierError::InvalidState {
                status: delivery.status,
            });
        }

        // Clears the error and response code along with the counters.
        self.store
            .update_delivery(delivery.id, DeliveryStatus::Pending, 1, None, None)
            .await?;

        // Same dedup key as the original job, so a double replay cannot put
        // two jobs in flight.
        let admitted = self.queue.enqueue(delivery.id).await?;
        if !admitted {
            tracing::warn!(
                target: "courier_replay",
                delivery_id = %delivery.id,
                "previous job still settling, leaving the delivery for the resync sweep"
            );
        }

        tracing::info!(
            target: "courier_replay",
            delivery_id = %delivery.id,
            project_id = %project_id,
            "dead delivery replayed"
        );
        Ok(())
    }
}
