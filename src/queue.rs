use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::error::{CourierError, JobError};
use crate::types::DeliveryId;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    /// Total attempt budget per job, first attempt included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per subsequent failure.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_size: 1_000,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            jitter: Duration::from_millis(250),
        }
    }
}

/// One scheduled execution of a delivery.
///
/// `attempt` is the queue's own counter and the authoritative one; handlers
/// persist it rather than keeping a parallel count.
#[derive(Debug, Clone)]
pub struct Job {
    pub delivery_id: DeliveryId,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Job {
    /// Whether a failure of this execution would exhaust the budget.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Consumer side of the queue: one call per delivery attempt.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

struct JobReport {
    job: Job,
    result: Result<(), JobError>,
}

/// Durable-queue stand-in: at-least-once job execution keyed by delivery id.
///
/// Workers pull from a shared ready channel; a scheduler task owns the
/// backoff heap and the dedup set bookkeeping. A delivery id stays in the
/// dedup set from enqueue until its job completes or is abandoned, which
/// both makes enqueue idempotent and guarantees two executions of the same
/// delivery never overlap.
pub struct DeliveryQueue {
    config: QueueConfig,
    is_running: Arc<AtomicBool>,
    dedup: Arc<RwLock<HashSet<DeliveryId>>>,
    ready_tx: Mutex<Option<mpsc::Sender<Job>>>,
    notify: Arc<Notify>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryQueue {
    pub fn new(config: QueueConfig, handler: Arc<dyn JobHandler>) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(config.queue_size.max(1));
        let shared_rx = Arc::new(Mutex::new(ready_rx));
        let (report_tx, report_rx) = mpsc::channel(config.queue_size.max(1));

        let is_running = Arc::new(AtomicBool::new(true));
        let dedup = Arc::new(RwLock::new(HashSet::new()));
        let notify = Arc::new(Notify::new());

        let mut worker_handles = Vec::with_capacity(config.worker_count.max(1));
        for _ in 0..config.worker_count.max(1) {
            worker_handles.push(tokio::spawn(worker_loop(
                shared_rx.clone(),
                handler.clone(),
                report_tx.clone(),
                dedup.clone(),
            )));
        }
        // The report channel must close once the last worker exits.
        drop(report_tx);

        let scheduler_handle = tokio::spawn(scheduler_loop(
            report_rx,
            ready_tx.clone(),
            notify.clone(),
            is_running.clone(),
            config.clone(),
        ));

        Self {
            config,
            is_running,
            dedup,
            ready_tx: Mutex::new(Some(ready_tx)),
            notify,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            worker_handles: Mutex::new(worker_handles),
        }
    }

    /// Admit a fresh job for the delivery. Returns `Ok(false)` when a job
    /// with this key is already pending or running.
    pub async fn enqueue(&self, delivery_id: DeliveryId) -> Result<bool, CourierError> {
        self.enqueue_at(delivery_id, 1).await
    }

    /// Admit a job resuming at the given attempt number. Used by the
    /// reconciliation sweep so a recovered delivery keeps its spent budget.
    pub async fn enqueue_at(
        &self,
        delivery_id: DeliveryId,
        attempt: u32,
    ) -> Result<bool, CourierError> {
        if !self.is_running() {
            return Err(CourierError::QueueClosed);
        }

        {
            let mut dedup = self.dedup.write().await;
            if !dedup.insert(delivery_id) {
                return Ok(false);
            }
        }

        let job = Job {
            delivery_id,
            attempt: attempt.clamp(1, self.config.max_attempts),
            max_attempts: self.config.max_attempts,
        };

        let tx = { self.ready_tx.lock().await.clone() };
        let sent = match tx {
            Some(tx) => tx.send(job).await.is_ok(),
            None => false,
        };

        if !sent {
            self.dedup.write().await.remove(&delivery_id);
            return Err(CourierError::QueueClosed);
        }

        metric_inc("courier.queue.enqueued");
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Jobs currently pending, scheduled, or running.
    pub async fn active_jobs(&self) -> usize {
        self.dedup.read().await.len()
    }

    /// Stop intake, let in-flight attempts finish, and drain the tasks.
    /// Retries still waiting on backoff are dropped; a reconciliation sweep
    /// picks them up on the next start.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.ready_tx.lock().await.take();
        self.notify.notify_waiters();

        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            let _ = handle.await;
        }

        let mut workers = self.worker_handles.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    handler: Arc<dyn JobHandler>,
    report_tx: mpsc::Sender<JobReport>,
    dedup: Arc<RwLock<HashSet<DeliveryId>>>,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(job) = job else { break };

        metric_inc("courier.queue.attempt_started");
        let result = handler.handle(&job).await;

        // Release the dedup key the moment the job settles, so anything
        // observing the terminal status (a replay, most importantly) can
        // enqueue again right away.
        let terminal = match &result {
            Ok(()) => true,
            Err(JobError::Fatal(_)) => true,
            Err(JobError::Retry(_)) => job.attempt >= job.max_attempts,
        };
        if terminal {
            dedup.write().await.remove(&job.delivery_id);
        }

        if report_tx.send(JobReport { job, result }).await.is_err() {
            break;
        }
    }
}

async fn scheduler_loop(
    mut report_rx: mpsc::Receiver<JobReport>,
    ready_tx: mpsc::Sender<Job>,
    notify: Arc<Notify>,
    is_running: Arc<AtomicBool>,
    config: QueueConfig,
) {
    let mut delay_heap: BinaryHeap<TimedJob> = BinaryHeap::new();

    loop {
        if !is_running.load(Ordering::SeqCst) {
            if !delay_heap.is_empty() {
                tracing::info!(
                    target: "courier_queue",
                    dropped = delay_heap.len(),
                    "dropping scheduled retries at shutdown"
                );
            }
            return;
        }

        // Move due retries into the ready channel.
        let now = Instant::now();
        while delay_heap.peek().is_some_and(|t| t.ready_at <= now) {
            let timed = delay_heap.pop().expect("due job");
            if ready_tx.send(timed.job).await.is_err() {
                return;
            }
        }

        let next_ready = delay_heap.peek().map(|t| t.ready_at);

        tokio::select! {
            report = report_rx.recv() => match report {
                Some(report) => handle_report(report, &mut delay_heap, &config),
                None => return,
            },
            _ = notify.notified() => {}
            _ = sleep_until(next_ready.unwrap_or_else(Instant::now)), if next_ready.is_some() => {}
        }
    }
}

fn handle_report(report: JobReport, delay_heap: &mut BinaryHeap<TimedJob>, config: &QueueConfig) {
    let job = report.job;
    match report.result {
        Ok(()) => {
            metric_inc("courier.queue.completed");
        }
        Err(JobError::Fatal(reason)) => {
            tracing::error!(
                target: "courier_queue",
                delivery_id = %job.delivery_id,
                attempt = job.attempt,
                %reason,
                "job abandoned on fatal error"
            );
            metric_inc("courier.queue.abandoned");
        }
        Err(JobError::Retry(reason)) => {
            if job.attempt >= job.max_attempts {
                tracing::warn!(
                    target: "courier_queue",
                    delivery_id = %job.delivery_id,
                    attempt = job.attempt,
                    %reason,
                    "retry budget exhausted; job abandoned"
                );
                metric_inc("courier.queue.exhausted");
            } else {
                let delay = retry_delay(job.attempt, config) + jitter_delay(config.jitter);
                delay_heap.push(TimedJob {
                    ready_at: Instant::now() + delay,
                    job: Job {
                        attempt: job.attempt + 1,
                        ..job
                    },
                });
                metric_inc("courier.queue.retry_scheduled");
            }
        }
    }
}

/// Exponential backoff for the attempt after `failed_attempt`:
/// `base * 2^(failed_attempt - 1)`, capped.
fn retry_delay(failed_attempt: u32, config: &QueueConfig) -> Duration {
    let base = (config.backoff_base.as_millis() as u64).max(1);
    let max = (config.backoff_max.as_millis() as u64).max(base);
    let pow = 2u64
        .checked_pow(failed_attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base.saturating_mul(pow).min(max))
}

fn jitter_delay(jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

#[derive(Debug)]
struct TimedJob {
    ready_at: Instant,
    job: Job,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config(max_attempts: u32) -> QueueConfig {
        QueueConfig {
            worker_count: 2,
            queue_size: 16,
            max_attempts,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            jitter: Duration::from_millis(0),
        }
    }

    struct CountingHandler {
        calls: AtomicU32,
        delay: Duration,
        result: fn() -> Result<(), JobError>,
    }

    impl CountingHandler {
        fn new(result: fn() -> Result<(), JobError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                delay: Duration::from_millis(0),
                result,
            })
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.result)()
        }
    }

    async fn wait_until(queue: &DeliveryQueue) {
        for _ in 0..400 {
            if queue.active_jobs().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not quiesce");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = QueueConfig {
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            ..Default::default()
        };
        assert_eq!(retry_delay(1, &config), Duration::from_secs(5));
        assert_eq!(retry_delay(2, &config), Duration::from_secs(10));
        assert_eq!(retry_delay(3, &config), Duration::from_secs(20));
        assert_eq!(retry_delay(12, &config), Duration::from_secs(300));
        assert_eq!(retry_delay(64, &config), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_a_no_op_while_the_job_lives() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            // Long enough that the second enqueue lands while the first
            // job is still running.
            delay: Duration::from_millis(100),
            result: || Ok(()),
        });
        let queue = DeliveryQueue::new(fast_config(5), handler.clone());

        let id = DeliveryId::new();
        assert!(queue.enqueue(id).await.unwrap());
        assert!(!queue.enqueue(id).await.unwrap());

        wait_until(&queue).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn retryable_failure_runs_exactly_the_budget() {
        let handler = CountingHandler::new(|| Err(JobError::Retry("boom".into())));
        let queue = DeliveryQueue::new(fast_config(3), handler.clone());

        queue.enqueue(DeliveryId::new()).await.unwrap();
        wait_until(&queue).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let handler = CountingHandler::new(|| Err(JobError::Fatal("corrupt".into())));
        let queue = DeliveryQueue::new(fast_config(5), handler.clone());

        queue.enqueue(DeliveryId::new()).await.unwrap();
        wait_until(&queue).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_refused() {
        let handler = CountingHandler::new(|| Ok(()));
        let queue = DeliveryQueue::new(fast_config(5), handler);
        queue.shutdown().await;

        let err = queue.enqueue(DeliveryId::new()).await.unwrap_err();
        assert!(matches!(err, CourierError::QueueClosed));
    }

    #[tokio::test]
    async fn completed_key_can_be_enqueued_again() {
        let handler = CountingHandler::new(|| Ok(()));
        let queue = DeliveryQueue::new(fast_config(5), handler.clone());

        let id = DeliveryId::new();
        queue.enqueue(id).await.unwrap();
        wait_until(&queue).await;
        assert!(queue.enqueue(id).await.unwrap());
        wait_until(&queue).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        queue.shutdown().await;
    }
}
