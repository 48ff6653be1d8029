use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{DeliveryId, EventId, ProjectId};

/// Object storage capability: durable, strongly consistent puts and gets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return the key.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// In-memory object store for tests and demos.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects.lock().await.get(key).cloned())
    }
}

/// Request half of an attempt capture. The signature header value is
/// redacted before it gets here; everything else is stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

/// Response half, absent when the request never produced a status line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResponse {
    pub status: u16,
    pub body: String,
}

/// Full capture of one delivery attempt, written on success and failure
/// alike so the audit trail has no gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptLog {
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
    pub request: AttemptRequest,
    pub response: Option<AttemptResponse>,
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Append-only store of attempt captures, addressed by a structured key.
#[derive(Clone)]
pub struct AttemptLogStore {
    objects: Arc<dyn ObjectStore>,
}

impl AttemptLogStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Key layout: `project_{p}/event_{e}/delivery_{d}/attempt_{n}.json`.
    pub fn log_key(
        project_id: ProjectId,
        event_id: EventId,
        delivery_id: DeliveryId,
        attempt: u32,
    ) -> String {
        format!(
            "project_{project_id}/event_{event_id}/delivery_{delivery_id}/attempt_{attempt}.json"
        )
    }

    pub async fn write(
        &self,
        project_id: ProjectId,
        event_id: EventId,
        delivery_id: DeliveryId,
        log: &AttemptLog,
    ) -> Result<String, StoreError> {
        let key = Self::log_key(project_id, event_id, delivery_id, log.attempt);
        let bytes = serde_json::to_vec_pretty(log)
            .map_err(|e| StoreError(format!("attempt log serialization: {e}")))?;
        self.objects.put(&key, bytes).await
    }

    pub async fn read(&self, key: &str) -> Result<Option<AttemptLog>, StoreError> {
        let Some(bytes) = self.objects.get(key).await? else {
            return Ok(None);
        };
        let log = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError(format!("attempt log deserialization: {e}")))?;
        Ok(Some(log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_then_read_round_trips_under_the_structured_key() {
        let objects = Arc::new(InMemoryObjectStore::new());
        let logs = AttemptLogStore::new(objects.clone());

        let project_id = ProjectId::new();
        let event_id = EventId::new();
        let delivery_id = DeliveryId::new();

        let log = AttemptLog {
            attempt: 3,
            recorded_at: Utc::now(),
            request: AttemptRequest {
                url: "http://localhost/hook".into(),
                headers: BTreeMap::from([("X-Signature".into(), "[redacted]".into())]),
                body: json!({"id": 42}),
            },
            response: Some(AttemptResponse {
                status: 500,
                body: "oops".into(),
            }),
            error: Some("endpoint returned HTTP 500".into()),
            latency_ms: 12,
        };

        let key = logs.write(project_id, event_id, delivery_id, &log).await.unwrap();
        assert_eq!(
            key,
            format!("project_{project_id}/event_{event_id}/delivery_{delivery_id}/attempt_3.json")
        );

        let loaded = logs.read(&key).await.unwrap().expect("stored log");
        assert_eq!(loaded.attempt, 3);
        assert_eq!(loaded.response.unwrap().status, 500);
        assert_eq!(loaded.request.headers["X-Signature"], "[redacted]");
    }
}
