use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    Delivery, DeliveryAttempt, DeliveryId, DeliveryStatus, Event, EventId, Project, ProjectId,
    Webhook, WebhookId,
};

/// Outcome of an idempotent event insert.
#[derive(Debug, Clone)]
pub enum EventInsert {
    /// First occurrence of `(project_id, idempotency_key)`.
    Inserted(Event),
    /// The key was already ingested; the existing row is returned unchanged.
    Duplicate(Event),
}

impl EventInsert {
    pub fn into_parts(self) -> (Event, bool) {
        match self {
            EventInsert::Inserted(event) => (event, false),
            EventInsert::Duplicate(event) => (event, true),
        }
    }
}

/// A delivery joined with its event and webhook, for listings.
#[derive(Debug, Clone)]
pub struct DeliveryView {
    pub delivery: Delivery,
    pub event: Event,
    pub webhook: Webhook,
}

/// Relational persistence capability consumed by the pipeline.
///
/// The store is expected to enforce two uniqueness invariants:
/// `(project_id, idempotency_key)` on events and `(event_id, webhook_id)`
/// on deliveries. Everything else is point lookups and field updates.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_project(&self, name: &str, api_key: &str) -> Result<Project, StoreError>;

    async fn find_project_by_api_key(&self, api_key: &str)
        -> Result<Option<Project>, StoreError>;

    async fn create_webhook(
        &self,
        project_id: ProjectId,
        url: &str,
        secret: &str,
    ) -> Result<Webhook, StoreError>;

    async fn set_webhook_active(&self, id: WebhookId, active: bool) -> Result<(), StoreError>;

    async fn list_webhooks(&self, project_id: ProjectId) -> Result<Vec<Webhook>, StoreError>;

    /// Webhooks eligible for fan-out right now.
    async fn active_webhooks(&self, project_id: ProjectId) -> Result<Vec<Webhook>, StoreError>;

    /// Insert an event, or return the existing row on an idempotency-key
    /// conflict. The conflict is recovered here, never surfaced as an error.
    async fn insert_event(
        &self,
        project_id: ProjectId,
        event_type: &str,
        payload: serde_json::Value,
        idempotency_key: &str,
    ) -> Result<EventInsert, StoreError>;

    /// Create a delivery for the pair, or return `None` if one already
    /// exists. `None` means "already fanned out", not a fault.
    async fn create_delivery(
        &self,
        event_id: EventId,
        webhook_id: WebhookId,
    ) -> Result<Option<Delivery>, StoreError>;

    async fn load_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError>;

    async fn load_event(&self, id: EventId) -> Result<Option<Event>, StoreError>;

    async fn load_webhook(&self, id: WebhookId) -> Result<Option<Webhook>, StoreError>;

    /// Overwrite the mutable delivery fields in one shot. `response_code`
    /// and `error` are stored as given, so passing `None` clears them.
    async fn update_delivery(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        attempt: u32,
        response_code: Option<u16>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn record_attempt(&self, attempt: DeliveryAttempt) -> Result<(), StoreError>;

    async fn list_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError>;

    /// Most-recent-first page of a project's deliveries, optionally filtered
    /// by status, with event and webhook rows embedded.
    async fn list_deliveries(
        &self,
        project_id: ProjectId,
        status: Option<DeliveryStatus>,
        limit: usize,
    ) -> Result<Vec<DeliveryView>, StoreError>;

    /// Deliveries resting in a runnable state, for the reconciliation sweep.
    async fn runnable_deliveries(&self) -> Result<Vec<Delivery>, StoreError>;
}

#[derive(Default)]
struct Inner {
    projects: HashMap<ProjectId, Project>,
    webhooks: HashMap<WebhookId, Webhook>,
    events: HashMap<EventId, Event>,
    deliveries: HashMap<DeliveryId, Delivery>,
    attempts: Vec<DeliveryAttempt>,
    /// Unique index backing idempotent intake.
    event_keys: HashMap<(ProjectId, String), EventId>,
    /// Unique index backing one-delivery-per-pair.
    delivery_pairs: HashSet<(EventId, WebhookId)>,
    /// Insertion order, newest last; stands in for a created_at index.
    delivery_order: Vec<DeliveryId>,
}

/// In-memory record store for tests, demos, and single-process deployments.
///
/// One mutex over the whole state keeps the two uniqueness checks atomic
/// with their inserts, which is the part a real backend gets from its
/// unique constraints.
#[derive(Default)]
pub struct InMemoryRecordStore {
    inner: Mutex<Inner>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_project(&self, name: &str, api_key: &str) -> Result<Project, StoreError> {
        let project = Project::new(name, api_key);
        let mut inner = self.inner.lock().await;
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn find_project_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<Project>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .projects
            .values()
            .find(|p| p.api_key == api_key)
            .cloned())
    }

    async fn create_webhook(
        &self,
        project_id: ProjectId,
        url: &str,
        secret: &str,
    ) -> Result<Webhook, StoreError> {
        let webhook = Webhook::new(project_id, url, secret);
        let mut inner = self.inner.lock().await;
        inner.webhooks.insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    async fn set_webhook_active(&self, id: WebhookId, active: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(webhook) = inner.webhooks.get_mut(&id) {
            webhook.is_active = active;
        }
        Ok(())
    }

    async fn list_webhooks(&self, project_id: ProjectId) -> Result<Vec<Webhook>, StoreError> {
        let inner = self.inner.lock().await;
        let mut webhooks: Vec<Webhook> = inner
            .webhooks
            .values()
            .filter(|w| w.project_id == project_id)
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| w.created_at);
        Ok(webhooks)
    }

    async fn active_webhooks(&self, project_id: ProjectId) -> Result<Vec<Webhook>, StoreError> {
        let mut webhooks = self.list_webhooks(project_id).await?;
        webhooks.retain(|w| w.is_active);
        Ok(webhooks)
    }

    async fn insert_event(
        &self,
        project_id: ProjectId,
        event_type: &str,
        payload: serde_json::Value,
        idempotency_key: &str,
    ) -> Result<EventInsert, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (project_id, idempotency_key.to_string());

        if let Some(existing_id) = inner.event_keys.get(&key) {
            let existing = inner.events[existing_id].clone();
            return Ok(EventInsert::Duplicate(existing));
        }

        let event = Event::new(project_id, event_type, payload, idempotency_key);
        inner.event_keys.insert(key, event.id);
        inner.events.insert(event.id, event.clone());
        Ok(EventInsert::Inserted(event))
    }

    async fn create_delivery(
        &self,
        event_id: EventId,
        webhook_id: WebhookId,
    ) -> Result<Option<Delivery>, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.delivery_pairs.insert((event_id, webhook_id)) {
            return Ok(None);
        }

        let delivery = Delivery::new(event_id, webhook_id);
        inner.delivery_order.push(delivery.id);
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(Some(delivery))
    }

    async fn load_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.deliveries.get(&id).cloned())
    }

    async fn load_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(&id).cloned())
    }

    async fn load_webhook(&self, id: WebhookId) -> Result<Option<Webhook>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.webhooks.get(&id).cloned())
    }

    async fn update_delivery(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        attempt: u32,
        response_code: Option<u16>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(delivery) = inner.deliveries.get_mut(&id) else {
            return Err(StoreError(format!("delivery {id} vanished mid-update")));
        };
        delivery.status = status;
        delivery.attempt = attempt;
        delivery.response_code = response_code;
        delivery.last_error = error;
        delivery.updated_at = Utc::now();
        Ok(())
    }

    async fn record_attempt(&self, attempt: DeliveryAttempt) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.attempts.push(attempt);
        Ok(())
    }

    async fn list_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        let mut attempts: Vec<DeliveryAttempt> = inner
            .attempts
            .iter()
            .filter(|a| a.delivery_id == delivery_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn list_deliveries(
        &self,
        project_id: ProjectId,
        status: Option<DeliveryStatus>,
        limit: usize,
    ) -> Result<Vec<DeliveryView>, StoreError> {
        let inner = self.inner.lock().await;
        let mut views = Vec::new();

        for id in inner.delivery_order.iter().rev() {
            if views.len() >= limit {
                break;
            }
            let Some(delivery) = inner.deliveries.get(id) else {
                continue;
            };
            if let Some(wanted) = status {
                if delivery.status != wanted {
                    continue;
                }
            }
            let Some(event) = inner.events.get(&delivery.event_id) else {
                continue;
            };
            if event.project_id != project_id {
                continue;
            }
            let Some(webhook) = inner.webhooks.get(&delivery.webhook_id) else {
                continue;
            };
            views.push(DeliveryView {
                delivery: delivery.clone(),
                event: event.clone(),
                webhook: webhook.clone(),
            });
        }

        Ok(views)
    }

    async fn runnable_deliveries(&self) -> Result<Vec<Delivery>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .values()
            .filter(|d| d.status.awaits_attempt())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn event_insert_is_idempotent_per_project_and_key() {
        let store = InMemoryRecordStore::new();
        let project = store.create_project("acme", "key").await.unwrap();

        let first = store
            .insert_event(project.id, "order.created", json!({"id": 42}), "abc-1")
            .await
            .unwrap();
        let (event, duplicate) = first.into_parts();
        assert!(!duplicate);

        let second = store
            .insert_event(project.id, "order.created", json!({"id": 42}), "abc-1")
            .await
            .unwrap();
        let (same, duplicate) = second.into_parts();
        assert!(duplicate);
        assert_eq!(same.id, event.id);

        // The same key under another project is a fresh event.
        let other = store.create_project("other", "key2").await.unwrap();
        let third = store
            .insert_event(other.id, "order.created", json!({"id": 42}), "abc-1")
            .await
            .unwrap();
        assert!(matches!(third, EventInsert::Inserted(_)));
    }

    #[tokio::test]
    async fn delivery_pair_is_unique() {
        let store = InMemoryRecordStore::new();
        let project = store.create_project("acme", "key").await.unwrap();
        let webhook = store
            .create_webhook(project.id, "http://localhost/hook", "whsec_x")
            .await
            .unwrap();
        let (event, _) = store
            .insert_event(project.id, "t", json!({}), "k")
            .await
            .unwrap()
            .into_parts();

        let created = store.create_delivery(event.id, webhook.id).await.unwrap();
        assert!(created.is_some());
        let again = store.create_delivery(event.id, webhook.id).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_status_filtered() {
        let store = InMemoryRecordStore::new();
        let project = store.create_project("acme", "key").await.unwrap();
        let webhook = store
            .create_webhook(project.id, "http://localhost/hook", "whsec_x")
            .await
            .unwrap();

        let mut ids = Vec::new();
        for n in 0..3 {
            let (event, _) = store
                .insert_event(project.id, "t", json!({"n": n}), format!("k-{n}").as_str())
                .await
                .unwrap()
                .into_parts();
            let delivery = store
                .create_delivery(event.id, webhook.id)
                .await
                .unwrap()
                .unwrap();
            ids.push(delivery.id);
        }

        store
            .update_delivery(ids[1], DeliveryStatus::Dead, 5, None, Some("boom".into()))
            .await
            .unwrap();

        let all = store.list_deliveries(project.id, None, 50).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].delivery.id, ids[2]);
        assert_eq!(all[2].delivery.id, ids[0]);

        let dead = store
            .list_deliveries(project.id, Some(DeliveryStatus::Dead), 50)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].delivery.id, ids[1]);

        let limited = store.list_deliveries(project.id, None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}
