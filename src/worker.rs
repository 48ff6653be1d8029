use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::attempt_log::{AttemptLog, AttemptLogStore, AttemptRequest, AttemptResponse};
use crate::error::{AttemptFailure, CourierError, JobError};
use crate::queue::{Job, JobHandler};
use crate::signing;
use crate::store::RecordStore;
use crate::types::{
    AttemptOutcome, Delivery, DeliveryAttempt, DeliveryStatus, Event, Webhook,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Header naming the event type on outbound deliveries.
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";

const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Cap on a single outbound request; a hung endpoint must not stall the
    /// pool. Timeout counts as a failed attempt.
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Response bodies are truncated to this many chars in the attempt log.
    pub max_response_chars: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            user_agent: "webhook-courier/0.1".to_string(),
            max_response_chars: 4096,
        }
    }
}

/// Queue consumer executing one delivery attempt per job.
pub struct DeliveryWorker {
    store: Arc<dyn RecordStore>,
    logs: AttemptLogStore,
    http_client: reqwest::Client,
    config: WorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        logs: AttemptLogStore,
        config: WorkerConfig,
    ) -> Result<Self, CourierError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CourierError::Internal(format!("http client: {e}")))?;

        Ok(Self {
            store,
            logs,
            http_client,
            config,
        })
    }

    /// Load the delivery with its event and webhook. A missing delivery row
    /// means the data model is corrupt, not a transient fault; same for a
    /// dangling event or webhook reference, except the delivery row is still
    /// there to be marked.
    async fn load_dispatch(&self, job: &Job) -> Result<(Delivery, Event, Webhook), JobError> {
        let delivery = self
            .store
            .load_delivery(job.delivery_id)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;

        let Some(delivery) = delivery else {
            tracing::error!(
                target: "courier_worker",
                delivery_id = %job.delivery_id,
                "delivery row missing, refusing to retry"
            );
            return Err(JobError::Fatal("delivery row missing".into()));
        };

        let event = self
            .store
            .load_event(delivery.event_id)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;
        let webhook = self
            .store
            .load_webhook(delivery.webhook_id)
            .await
            .map_err(|e| JobError::Retry(e.to_string()))?;

        match (event, webhook) {
            (Some(event), Some(webhook)) => Ok((delivery, event, webhook)),
            (event, _) => {
                let missing = if event.is_none() { "event" } else { "webhook" };
                tracing::error!(
                    target: "courier_worker",
                    delivery_id = %delivery.id,
                    missing,
                    "referenced row missing, marking delivery failed"
                );
                let diagnostic = format!("referenced {missing} row missing");
                if let Err(e) = self
                    .store
                    .update_delivery(
                        delivery.id,
                        DeliveryStatus::Failed,
                        job.attempt,
                        None,
                        Some(diagnostic.clone()),
                    )
                    .await
                {
                    tracing::error!(
                        target: "courier_worker",
                        delivery_id = %delivery.id,
                        error = %e,
                        "failed to mark delivery failed"
                    );
                }
                Err(JobError::Fatal(diagnostic))
            }
        }
    }

    /// POST the signed payload. Only a 2xx response counts as success.
    async fn send_request(
        &self,
        webhook: &Webhook,
        event: &Event,
        payload: &[u8],
        signature: &str,
    ) -> (Option<u16>, Option<String>, Option<AttemptFailure>) {
        let result = self
            .http_client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header(EVENT_TYPE_HEADER, &event.event_type)
            .header(signing::SIGNATURE_HEADER, signature)
            .body(payload.to_vec())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(self.config.max_response_chars)
                    .collect();
                let failure = if (200..300).contains(&status) {
                    None
                } else {
                    Some(AttemptFailure::Status(status))
                };
                (Some(status), Some(body), failure)
            }
            Err(err) if err.is_timeout() => (None, None, Some(AttemptFailure::Timeout)),
            Err(err) => (None, None, Some(AttemptFailure::Network(err.to_string()))),
        }
    }

    /// Best-effort audit trail: a log or attempt-row write failure is logged
    /// and must not change the delivery outcome.
    async fn record_audit(
        &self,
        delivery: &Delivery,
        event: &Event,
        webhook: &Webhook,
        job: &Job,
        response_status: Option<u16>,
        response_body: Option<String>,
        failure: Option<&AttemptFailure>,
        latency_ms: u64,
    ) {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(EVENT_TYPE_HEADER.to_string(), event.event_type.clone());
        headers.insert(signing::SIGNATURE_HEADER.to_string(), REDACTED.to_string());

        let log = AttemptLog {
            attempt: job.attempt,
            recorded_at: Utc::now(),
            request: AttemptRequest {
                url: webhook.url.clone(),
                headers,
                body: event.payload.clone(),
            },
            response: response_status.map(|status| AttemptResponse {
                status,
                body: response_body.unwrap_or_default(),
            }),
            error: failure.map(|f| f.to_string()),
            latency_ms,
        };

        let log_key = match self
            .logs
            .write(event.project_id, event.id, delivery.id, &log)
            .await
        {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(
                    target: "courier_worker",
                    delivery_id = %delivery.id,
                    attempt = job.attempt,
                    error = %e,
                    "attempt log write failed"
                );
                // Keep the reference anyway; the key is deterministic.
                AttemptLogStore::log_key(event.project_id, event.id, delivery.id, job.attempt)
            }
        };

        let outcome = if failure.is_none() {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Failed
        };
        let attempt_row = DeliveryAttempt::new(
            delivery.id,
            job.attempt,
            outcome,
            log_key,
            response_status,
            latency_ms,
        );

        if let Err(e) = self.store.record_attempt(attempt_row).await {
            tracing::warn!(
                target: "courier_worker",
                delivery_id = %delivery.id,
                attempt = job.attempt,
                error = %e,
                "attempt row write failed"
            );
        }
    }
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let (delivery, event, webhook) = self.load_dispatch(job).await?;

        let payload = serde_json::to_vec(&event.payload)
            .map_err(|e| JobError::Fatal(format!("payload serialization: {e}")))?;
        let timestamp = Utc::now().timestamp().max(0) as u64;
        let signature = signing::signature_header(&webhook.secret, timestamp, &payload);

        let started = Instant::now();
        let (response_status, response_body, failure) = self
            .send_request(&webhook, &event, &payload, &signature)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        self.record_audit(
            &delivery,
            &event,
            &webhook,
            job,
            response_status,
            response_body,
            failure.as_ref(),
            latency_ms,
        )
        .await;

        match failure {
            None => {
                self.store
                    .update_delivery(
                        delivery.id,
                        DeliveryStatus::Success,
                        job.attempt,
                        response_status,
                        None,
                    )
                    .await
                    .map_err(|e| JobError::Retry(e.to_string()))?;

                tracing::info!(
                    target: "courier_worker",
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    event_id = %event.id,
                    attempt = job.attempt,
                    response_code = response_status,
                    latency_ms,
                    "delivery succeeded"
                );
                metric_inc("courier.delivery.succeeded");
                Ok(())
            }
            Some(failure) => {
                let error_text = failure.to_string();

                // The queue abandons an exhausted job without calling back,
                // so the dead-letter write has to happen here, before the
                // failure is re-raised.
                if job.is_last_attempt() {
                    self.store
                        .update_delivery(
                            delivery.id,
                            DeliveryStatus::Dead,
                            job.attempt,
                            response_status,
                            Some(error_text.clone()),
                        )
                        .await
                        .map_err(|e| JobError::Retry(e.to_string()))?;

                    tracing::warn!(
                        target: "courier_worker",
                        delivery_id = %delivery.id,
                        webhook_id = %webhook.id,
                        attempt = job.attempt,
                        error = %error_text,
                        "attempt budget exhausted, delivery dead-lettered"
                    );
                    metric_inc("courier.delivery.dead_lettered");
                } else {
                    self.store
                        .update_delivery(
                            delivery.id,
                            DeliveryStatus::Retrying,
                            job.attempt + 1,
                            response_status,
                            Some(error_text.clone()),
                        )
                        .await
                        .map_err(|e| JobError::Retry(e.to_string()))?;

                    tracing::warn!(
                        target: "courier_worker",
                        delivery_id = %delivery.id,
                        webhook_id = %webhook.id,
                        attempt = job.attempt,
                        error = %error_text,
                        "attempt failed, retry scheduled"
                    );
                    metric_inc("courier.delivery.retried");
                }

                Err(JobError::Retry(error_text))
            }
        }
    }
}
