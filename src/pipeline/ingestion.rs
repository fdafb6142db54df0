//! Pipeline ingestion - consume, dispatch, queue, persist
//!
//! Two kinds of long-lived task connected by one bounded mpsc queue:
//! - `ConsumeWorker` (one per subscribed topic): read, decode the `type`
//!   header, save schemas inline, park not-yet-eligible query events, push
//!   query events onto the queue, then commit.
//! - `PersistWorker` (exactly one): pop query events, persist them, escalate
//!   store failures to the retry / dead-letter topics.
//!
//! A full queue blocks the consume side; that is the only backpressure.
//! Shutdown is a shared `CancellationToken`: consumers stop reading, the
//! persist worker closes the queue, drains it for up to `drain_timeout`, and
//! requeues whatever is left onto the retry topic.

use super::backoff::ReadBackoff;
use super::config::PipelineConfig;
use super::db::QueryStore;
use super::query_events::QueryEventHandler;
use super::retry::{Escalation, RetryEscalator};
use super::schema::{SchemaEventHandler, SchemaRegistry};
use super::types::{EventEnvelope, InboundEvent};
use crate::bus::{BusConsumer, BusMessage};
use crate::error::IngestError;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Running counters shared by all workers
#[derive(Debug, Default)]
pub struct PipelineStats {
    consumed: AtomicU64,
    read_failures: AtomicU64,
    unrecognized: AtomicU64,
    schemas_saved: AtomicU64,
    schemas_rejected: AtomicU64,
    queries_enqueued: AtomicU64,
    queries_persisted: AtomicU64,
    queries_invalid: AtomicU64,
    queries_retried: AtomicU64,
    queries_dead_lettered: AtomicU64,
    queries_requeued: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub consumed: u64,
    pub read_failures: u64,
    pub unrecognized: u64,
    pub schemas_saved: u64,
    pub schemas_rejected: u64,
    pub queries_enqueued: u64,
    pub queries_persisted: u64,
    pub queries_invalid: u64,
    pub queries_retried: u64,
    pub queries_dead_lettered: u64,
    pub queries_requeued: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            consumed: get(&self.consumed),
            read_failures: get(&self.read_failures),
            unrecognized: get(&self.unrecognized),
            schemas_saved: get(&self.schemas_saved),
            schemas_rejected: get(&self.schemas_rejected),
            queries_enqueued: get(&self.queries_enqueued),
            queries_persisted: get(&self.queries_persisted),
            queries_invalid: get(&self.queries_invalid),
            queries_retried: get(&self.queries_retried),
            queries_dead_lettered: get(&self.queries_dead_lettered),
            queries_requeued: get(&self.queries_requeued),
        }
    }
}

/// Result of one consume step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    SchemaSaved,
    SchemaRejected,
    QueryEnqueued,
    Unrecognized,
    ReadFailed,
    /// Shutdown observed; the in-flight message (if any) was not committed
    Stopped,
}

/// Consume-and-dispatch loop for one topic
pub struct ConsumeWorker {
    consumer: Box<dyn BusConsumer>,
    schema_handler: Arc<SchemaEventHandler>,
    queue: mpsc::Sender<EventEnvelope>,
    backoff: ReadBackoff,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
}

impl ConsumeWorker {
    pub fn new(
        consumer: Box<dyn BusConsumer>,
        schema_handler: Arc<SchemaEventHandler>,
        queue: mpsc::Sender<EventEnvelope>,
        backoff: ReadBackoff,
        stats: Arc<PipelineStats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            consumer,
            schema_handler,
            queue,
            backoff,
            stats,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log::info!("📥 Consuming from {}", self.consumer.topic());

        while self.step().await != StepOutcome::Stopped {}

        log::info!("✅ Consumer stopped: {}", self.consumer.topic());
    }

    /// Read one message, dispatch it, commit it
    pub async fn step(&mut self) -> StepOutcome {
        let read = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return StepOutcome::Stopped,
            read = self.consumer.read() => read,
        };

        let message = match read {
            Ok(message) => {
                self.backoff.reset();
                message
            }
            Err(e) => {
                bump(&self.stats.read_failures);
                log::warn!("⚠️  {}", e);
                if !self.backoff.wait(&self.shutdown).await {
                    return StepOutcome::Stopped;
                }
                return StepOutcome::ReadFailed;
            }
        };

        bump(&self.stats.consumed);
        let outcome = self.dispatch(&message).await;

        // Uncommitted messages are redelivered after restart
        if outcome == StepOutcome::Stopped {
            return outcome;
        }

        if let Err(e) = self.consumer.commit(&message).await {
            log::warn!("⚠️  {}", e);
        }
        outcome
    }

    async fn dispatch(&mut self, message: &BusMessage) -> StepOutcome {
        match InboundEvent::decode(message) {
            InboundEvent::Unrecognized(reason) => {
                bump(&self.stats.unrecognized);
                log::warn!(
                    "⚠️  Dropping message {}@{}: {}",
                    message.topic,
                    message.offset,
                    reason
                );
                StepOutcome::Unrecognized
            }
            InboundEvent::Schema(envelope) => {
                match self.schema_handler.save_schema(&envelope.payload).await {
                    Ok(_) => {
                        bump(&self.stats.schemas_saved);
                        StepOutcome::SchemaSaved
                    }
                    Err(e @ IngestError::StoreWrite(_)) => {
                        // Registry already holds the new generation
                        bump(&self.stats.schemas_saved);
                        log::error!("❌ Parsed schema not persisted: {}", e);
                        StepOutcome::SchemaSaved
                    }
                    Err(e) => {
                        bump(&self.stats.schemas_rejected);
                        log::warn!("⚠️  Schema event rejected: {}", e);
                        StepOutcome::SchemaRejected
                    }
                }
            }
            InboundEvent::Query(envelope) => self.enqueue(envelope).await,
        }
    }

    async fn enqueue(&mut self, envelope: EventEnvelope) -> StepOutcome {
        if let Some(not_before) = envelope.not_before {
            let wait = (not_before - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                log::debug!(
                    "Parking query event (retry {}) for {:?}",
                    envelope.retry_count,
                    wait
                );
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return StepOutcome::Stopped,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => StepOutcome::Stopped,
            sent = self.queue.send(envelope) => match sent {
                Ok(()) => {
                    bump(&self.stats.queries_enqueued);
                    StepOutcome::QueryEnqueued
                }
                Err(_) => StepOutcome::Stopped,
            },
        }
    }
}

/// Single persist-and-escalate worker
pub struct PersistWorker {
    queue: mpsc::Receiver<EventEnvelope>,
    queue_capacity: usize,
    handler: QueryEventHandler,
    escalator: Arc<RetryEscalator>,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
}

impl PersistWorker {
    pub fn new(
        queue: mpsc::Receiver<EventEnvelope>,
        queue_capacity: usize,
        handler: QueryEventHandler,
        escalator: Arc<RetryEscalator>,
        stats: Arc<PipelineStats>,
        shutdown: CancellationToken,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            queue_capacity,
            handler,
            escalator,
            stats,
            shutdown,
            drain_timeout,
        }
    }

    pub async fn run(mut self) {
        log::info!("💾 Persist worker started");

        let period = Duration::from_secs(10);
        let mut throughput_timer = interval_at(Instant::now() + period, period);
        let mut window_start = Instant::now();
        let mut window_count = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.queue.recv() => match next {
                    Some(envelope) => {
                        self.persist(envelope).await;
                        window_count += 1;
                    }
                    None => {
                        log::warn!("⚠️  Query queue closed, stopping persist worker");
                        return;
                    }
                },
                _ = throughput_timer.tick() => {
                    let per_sec = window_count as f64 / window_start.elapsed().as_secs_f64();
                    log::info!(
                        "📊 Persist rate: {:.1} queries/sec (window: {}) | queue: {}/{}",
                        per_sec,
                        window_count,
                        self.queue.len(),
                        self.queue_capacity
                    );
                    window_start = Instant::now();
                    window_count = 0;
                }
            }
        }

        self.drain().await;
    }

    /// Persist one envelope; escalate on store failure
    pub async fn persist(&self, mut envelope: EventEnvelope) {
        match self.handler.save(&envelope.payload).await {
            Ok(()) => bump(&self.stats.queries_persisted),
            Err(IngestError::StoreWrite(e)) => {
                log::error!("❌ Failed to save query event: {}", e);
                match self.escalator.escalate(&mut envelope).await {
                    Escalation::Retry { .. } => bump(&self.stats.queries_retried),
                    Escalation::DeadLetter { .. } => bump(&self.stats.queries_dead_lettered),
                }
            }
            Err(e) => {
                bump(&self.stats.queries_invalid);
                log::warn!("⚠️  Dropping query event: {}", e);
            }
        }
    }

    /// Close the queue, persist what fits in `drain_timeout`, requeue the rest
    async fn drain(&mut self) {
        self.queue.close();
        let deadline = Instant::now() + self.drain_timeout;

        log::info!(
            "🔄 Draining {} queued query events (timeout: {:?})",
            self.queue.len(),
            self.drain_timeout
        );

        let mut drained = 0u64;
        loop {
            if Instant::now() >= deadline {
                let mut requeued = 0u64;
                while let Ok(envelope) = self.queue.try_recv() {
                    self.escalator.requeue(&envelope).await;
                    bump(&self.stats.queries_requeued);
                    requeued += 1;
                }
                if requeued > 0 {
                    log::warn!("⚠️  Drain timed out, requeued {} query events", requeued);
                }
                break;
            }

            match tokio::time::timeout_at(deadline, self.queue.recv()).await {
                Ok(Some(envelope)) => {
                    self.persist(envelope).await;
                    drained += 1;
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        log::info!("✅ Persist worker stopped ({} drained)", drained);
    }
}

/// Wires consume workers, the queue and the persist worker together
pub struct IngestionPipeline {
    schema_handler: Arc<SchemaEventHandler>,
    store: Arc<dyn QueryStore>,
    escalator: Arc<RetryEscalator>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn QueryStore>,
        escalator: RetryEscalator,
        config: PipelineConfig,
    ) -> Self {
        Self {
            schema_handler: Arc::new(SchemaEventHandler::new(registry, store.clone())),
            store,
            escalator: Arc::new(escalator),
            config,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    fn read_backoff(&self) -> ReadBackoff {
        ReadBackoff::new(
            self.config.read_backoff_initial(),
            self.config.read_backoff_max(),
            self.config.read_failure_circuit_threshold,
        )
    }

    /// Run until `shutdown` is cancelled and the queue is drained
    pub async fn run(
        self,
        consumers: Vec<Box<dyn BusConsumer>>,
        shutdown: CancellationToken,
    ) -> StatsSnapshot {
        log::info!("🚀 Starting ingestion pipeline");
        log::info!("   ├─ Topics: {}", consumers.len());
        log::info!("   ├─ Queue capacity: {}", self.config.queue_capacity);
        log::info!("   └─ Max retries: {}", self.config.max_retry_count);

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        let persist = PersistWorker::new(
            rx,
            self.config.queue_capacity,
            QueryEventHandler::new(self.store.clone()),
            self.escalator.clone(),
            self.stats.clone(),
            shutdown.clone(),
            self.config.drain_timeout(),
        );
        let persist_handle = tokio::spawn(persist.run());

        let consume_handles: Vec<_> = consumers
            .into_iter()
            .map(|consumer| {
                let worker = ConsumeWorker::new(
                    consumer,
                    self.schema_handler.clone(),
                    tx.clone(),
                    self.read_backoff(),
                    self.stats.clone(),
                    shutdown.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        drop(tx);

        for handle in consume_handles {
            if let Err(e) = handle.await {
                log::error!("❌ Consume worker panicked: {}", e);
            }
        }
        if let Err(e) = persist_handle.await {
            log::error!("❌ Persist worker panicked: {}", e);
        }

        let stats = self.stats.snapshot();
        log::info!("🛑 Ingestion pipeline stopped");
        log::info!("   ├─ Consumed: {}", stats.consumed);
        log::info!("   ├─ Persisted: {}", stats.queries_persisted);
        log::info!("   ├─ Retried: {}", stats.queries_retried);
        log::info!("   ├─ Dead-lettered: {}", stats.queries_dead_lettered);
        log::info!("   └─ Requeued at shutdown: {}", stats.queries_requeued);
        stats
    }
}
