use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CourierError;
use crate::gateway::{EventGateway, IngestRequest};
use crate::replay::ReplayController;
use crate::store::{DeliveryView, RecordStore};
use crate::types::{DeliveryId, DeliveryStatus, EventId, Project, WebhookId};

/// Header carrying the caller-supplied idempotency key on intake.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn RecordStore>,
    gateway: Arc<EventGateway>,
    replay: Arc<ReplayController>,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<EventGateway>,
        replay: Arc<ReplayController>,
    ) -> Self {
        Self {
            store,
            gateway,
            replay,
        }
    }
}

/// The boundary router: intake, replay, delivery listing, and webhook
/// registration. Every route requires a project API key.
pub fn courier_router(state: ApiState) -> Router {
    Router::new()
        .route("/events", post(ingest_event))
        .route("/deliveries", get(list_deliveries))
        .route("/deliveries/{id}/replay", post(replay_delivery))
        .route("/webhooks", post(create_webhook).get(list_webhooks))
        .with_state(state)
}

/// Resolve the bearer credential to a project, or fail `Unauthorized`.
async fn require_project(
    store: &dyn RecordStore,
    headers: &HeaderMap,
) -> Result<Project, CourierError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(CourierError::Unauthorized)?;
    let api_key = value
        .strip_prefix("Bearer ")
        .ok_or(CourierError::Unauthorized)?;

    store
        .find_project_by_api_key(api_key)
        .await?
        .ok_or(CourierError::Unauthorized)
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IngestBody {
    #[serde(rename = "type")]
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    #[serde(rename = "projectId")]
    project_id: Option<crate::types::ProjectId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    event_id: EventId,
    status: &'static str,
    duplicate: bool,
}

async fn ingest_event(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<IngestBody>,
) -> Result<Json<IngestResponse>, CourierError> {
    let project = require_project(&*state.store, &headers).await?;

    if let Some(claimed) = body.project_id {
        if claimed != project.id {
            return Err(CourierError::Validation(
                "projectId does not match the authenticated project".into(),
            ));
        }
    }

    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let receipt = state
        .gateway
        .ingest(
            project.id,
            IngestRequest {
                event_type: body.event_type.unwrap_or_default(),
                payload: body.payload.unwrap_or(serde_json::Value::Null),
                idempotency_key,
            },
        )
        .await?;

    Ok(Json(IngestResponse {
        event_id: receipt.event_id,
        status: "accepted",
        duplicate: receipt.duplicate,
    }))
}

// ---------------------------------------------------------------------------
// Delivery listing
// ---------------------------------------------------------------------------

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct ListDeliveriesQuery {
    status: Option<DeliveryStatus>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventSummary {
    id: EventId,
    #[serde(rename = "type")]
    event_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookSummary {
    id: WebhookId,
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliverySummary {
    id: DeliveryId,
    status: DeliveryStatus,
    attempt: u32,
    response_code: Option<u16>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    event: EventSummary,
    webhook: WebhookSummary,
}

#[derive(Debug, Serialize)]
struct DeliveriesResponse {
    deliveries: Vec<DeliverySummary>,
}

fn view_to_summary(view: DeliveryView) -> DeliverySummary {
    DeliverySummary {
        id: view.delivery.id,
        status: view.delivery.status,
        attempt: view.delivery.attempt,
        response_code: view.delivery.response_code,
        error: view.delivery.last_error,
        created_at: view.delivery.created_at,
        event: EventSummary {
            id: view.event.id,
            event_type: view.event.event_type,
        },
        webhook: WebhookSummary {
            id: view.webhook.id,
            url: view.webhook.url,
        },
    }
}

async fn list_deliveries(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListDeliveriesQuery>,
) -> Result<Json<DeliveriesResponse>, CourierError> {
    let project = require_project(&*state.store, &headers).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let views = state
        .store
        .list_deliveries(project.id, query.status, limit)
        .await?;

    Ok(Json(DeliveriesResponse {
        deliveries: views.into_iter().map(view_to_summary).collect(),
    }))
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayResponse {
    message: &'static str,
    delivery_id: DeliveryId,
}

async fn replay_delivery(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(delivery_id): Path<DeliveryId>,
) -> Result<Json<ReplayResponse>, CourierError> {
    let project = require_project(&*state.store, &headers).await?;

    state.replay.replay(project.id, delivery_id).await?;

    Ok(Json(ReplayResponse {
        message: "delivery replayed",
        delivery_id,
    }))
}

// ---------------------------------------------------------------------------
// Webhook registration
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateWebhookBody {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookCreated {
    id: WebhookId,
    url: String,
    secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRow {
    id: WebhookId,
    url: String,
    secret: String,
    is_active: bool,
    created_at: DateTime<Utc>,
}

/// Generate a fresh signing secret from the OS CSPRNG.
fn generate_webhook_secret() -> String {
    use rand::rngs::OsRng;
    use rand::RngCore;

    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    format!("whsec_{}", hex::encode(bytes))
}

async fn create_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<CreateWebhookBody>,
) -> Result<Json<WebhookCreated>, CourierError> {
    let project = require_project(&*state.store, &headers).await?;

    let url = body.url.unwrap_or_default();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(CourierError::Validation(
            "url is required and must be http(s)".into(),
        ));
    }

    let secret = generate_webhook_secret();
    let webhook = state.store.create_webhook(project.id, &url, &secret).await?;

    tracing::info!(
        target: "courier_api",
        webhook_id = %webhook.id,
        project_id = %project.id,
        "webhook registered"
    );

    Ok(Json(WebhookCreated {
        id: webhook.id,
        url: webhook.url,
        secret: webhook.secret,
    }))
}

async fn list_webhooks(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<WebhookRow>>, CourierError> {
    let project = require_project(&*state.store, &headers).await?;

    let webhooks = state.store.list_webhooks(project.id).await?;
    Ok(Json(
        webhooks
            .into_iter()
            .map(|w| WebhookRow {
                id: w.id,
                url: w.url,
                secret: w.secret,
                is_active: w.is_active,
                created_at: w.created_at,
            })
            .collect(),
    ))
}
