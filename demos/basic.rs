//! Wire the whole pipeline against an in-process receiver and watch one
//! event travel from intake to a delivered webhook.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;

use webhook_courier::{
    AttemptLogStore, DeliveryQueue, DeliveryWorker, EventGateway, InMemoryObjectStore,
    InMemoryRecordStore, IngestRequest, QueueConfig, RecordStore, WorkerConfig,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // A stand-in endpoint that just acknowledges deliveries.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let app = Router::new().route("/hook", post(|| async { "ok" }));
        let _ = axum::serve(listener, app).await;
    });

    let store = Arc::new(InMemoryRecordStore::new());
    let logs = AttemptLogStore::new(Arc::new(InMemoryObjectStore::new()));
    let worker = DeliveryWorker::new(store.clone(), logs, WorkerConfig::default()).expect("worker");
    let queue = Arc::new(DeliveryQueue::new(QueueConfig::default(), Arc::new(worker)));
    let gateway = EventGateway::new(store.clone(), queue.clone());

    let project = store.create_project("demo", "demo-key").await.unwrap();
    store
        .create_webhook(project.id, &url, "whsec_demo")
        .await
        .unwrap();

    let receipt = gateway
        .ingest(
            project.id,
            IngestRequest {
                event_type: "order.created".into(),
                payload: json!({"id": 42}),
                idempotency_key: "abc-1".into(),
            },
        )
        .await
        .unwrap();
    println!("accepted event {} (duplicate: {})", receipt.event_id, receipt.duplicate);

    tokio::time::sleep(Duration::from_millis(300)).await;
    for view in store.list_deliveries(project.id, None, 10).await.unwrap() {
        println!(
            "delivery {} -> {} [{}] attempt {}",
            view.delivery.id, view.webhook.url, view.delivery.status, view.delivery.attempt
        );
    }

    queue.shutdown().await;
}
