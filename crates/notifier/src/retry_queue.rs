//! Retry queue and the background worker that redrives it.
//!
//! Chunks that gave up inline land here. Every `poll_interval` the worker pops up
//! to `batch_size` items and sends each one again with its stored payload. An
//! accepted redrive is dropped from the queue. A failed one goes back to the tail,
//! minus any address the provider reported as permanently invalid, until it
//! reaches `max_attempts`, then moves to the dead-letter store.
//!
//! Popped items stay counted as in flight until they are settled or requeued,
//! so [`RetryQueue::pending`] never reads zero while a redrive is running.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use pulse_common::types::{
    DeadLetterEntry, DeliveryOutcome, DispatchOptions, NotificationPayload,
};

use crate::chunk::ChunkFate;
use crate::client::{DeliveryClient, align_outcomes};
use crate::dead_letter::DeadLetterStore;
use crate::lifecycle::TokenLifecycleManager;
use crate::metrics::MetricsEmitter;

/// A chunk waiting for redrive.
#[derive(Debug, Clone)]
pub struct RetryQueueItem {
    pub id: Uuid,
    pub addresses: Vec<String>,
    /// Shared with every other chunk of the same dispatch
    pub payload: Arc<NotificationPayload>,
    pub options: DispatchOptions,
    /// Redrives attempted so far
    pub attempts: u32,
    pub last_error: Option<serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl RetryQueueItem {
    pub fn new(
        addresses: Vec<String>,
        payload: Arc<NotificationPayload>,
        options: DispatchOptions,
        last_error: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            addresses,
            payload,
            options,
            attempts: 0,
            last_error: Some(last_error),
            enqueued_at: Utc::now(),
        }
    }

    fn into_dead_letter(self) -> DeadLetterEntry {
        DeadLetterEntry {
            id: self.id,
            addresses: self.addresses,
            attempts: self.attempts,
            last_error: self.last_error.unwrap_or(serde_json::Value::Null),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<RetryQueueItem>,
    /// Items handed out by `pop_batch` and not yet settled or requeued
    in_flight: usize,
}

/// FIFO of pending redrives, shared between dispatches and the worker.
#[derive(Debug, Clone, Default)]
pub struct RetryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, item: RetryQueueItem) {
        self.state.lock().await.items.push_back(item);
    }

    pub async fn extend(&self, items: impl IntoIterator<Item = RetryQueueItem>) {
        self.state.lock().await.items.extend(items);
    }

    /// Remove and return up to `max` items from the head. Each one counts as in
    /// flight until passed to [`requeue`](Self::requeue) or [`settle`](Self::settle).
    pub async fn pop_batch(&self, max: usize) -> Vec<RetryQueueItem> {
        let mut state = self.state.lock().await;
        let take = max.min(state.items.len());
        state.in_flight += take;
        state.items.drain(..take).collect()
    }

    /// Return an in-flight item to the tail.
    pub async fn requeue(&self, item: RetryQueueItem) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.items.push_back(item);
    }

    /// Mark an in-flight item as finished for good.
    pub async fn settle(&self) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Items waiting in the queue, excluding in-flight ones.
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }

    /// Queued plus in-flight items; zero only once every chunk is resolved.
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.items.len() + state.in_flight
    }

    /// Copy of the queued items, head first.
    pub async fn snapshot(&self) -> Vec<RetryQueueItem> {
        self.state.lock().await.items.iter().cloned().collect()
    }
}

/// What one worker tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub redriven: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Items dropped because every address left in them is permanently invalid
    pub retired: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.redriven + self.requeued + self.dead_lettered + self.retired == 0
    }
}

/// Performs the redrive of queued chunks; one call to [`Redriver::tick`] is one
/// worker wake-up.
pub struct Redriver {
    queue: RetryQueue,
    client: Arc<dyn DeliveryClient>,
    lifecycle: Arc<TokenLifecycleManager>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<MetricsEmitter>,
    max_attempts: u32,
    batch_size: usize,
}

impl Redriver {
    pub fn new(
        queue: RetryQueue,
        client: Arc<dyn DeliveryClient>,
        lifecycle: Arc<TokenLifecycleManager>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<MetricsEmitter>,
        max_attempts: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            client,
            lifecycle,
            dead_letters,
            metrics,
            max_attempts: max_attempts.max(1),
            batch_size: batch_size.max(1),
        }
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Redrive up to `batch_size` items once.
    ///
    /// Outcomes from every answered redrive in the tick go through one lifecycle
    /// plan, so an address shared by several queued chunks is retired once.
    pub async fn tick(&self) -> TickReport {
        let items = self.queue.pop_batch(self.batch_size).await;
        if items.is_empty() {
            return TickReport::default();
        }

        let mut report = TickReport::default();
        let mut answered = Vec::new();
        for item in items {
            match self.redrive(item, &mut answered).await {
                ChunkFate::RedrivenSuccess => report.redriven += 1,
                ChunkFate::Requeued => report.requeued += 1,
                ChunkFate::DeadLettered => report.dead_lettered += 1,
                ChunkFate::Retired => report.retired += 1,
                ChunkFate::Delivered | ChunkFate::RetryQueued => {}
            }
        }

        let plan = self
            .lifecycle
            .plan(answered.iter().map(|(address, outcome)| (address.as_str(), outcome)));
        let deactivated = self.lifecycle.apply(&plan).await;

        let depth = self.queue.len().await;
        tracing::info!(
            redriven = report.redriven,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            retired = report.retired,
            deactivated,
            depth,
            "Retry queue tick finished"
        );
        self.metrics.record_queue(depth, report.dead_lettered).await;

        report
    }

    /// Send one item again and settle or requeue it. Per-address outcomes of an
    /// answered send are appended to `answered`.
    async fn redrive(
        &self,
        mut item: RetryQueueItem,
        answered: &mut Vec<(String, DeliveryOutcome)>,
    ) -> ChunkFate {
        let error = match self
            .client
            .send(&item.addresses, &item.payload, &item.options)
            .await
        {
            Ok(response) => {
                let outcomes = align_outcomes(&item.addresses, &response);
                let accepted = outcomes.iter().any(DeliveryOutcome::is_success);
                let failure_count = outcomes.iter().filter(|o| !o.is_success()).count();
                let remaining: Vec<String> = item
                    .addresses
                    .iter()
                    .zip(&outcomes)
                    .filter(|(_, outcome)| {
                        !outcome
                            .error_code()
                            .is_some_and(|code| self.lifecycle.is_permanent(code))
                    })
                    .map(|(address, _)| address.clone())
                    .collect();
                answered.extend(item.addresses.iter().cloned().zip(outcomes));

                if accepted {
                    tracing::debug!(
                        item = %item.id,
                        addresses = item.addresses.len(),
                        attempts = item.attempts + 1,
                        fate = ?ChunkFate::RedrivenSuccess,
                        "Redrive accepted"
                    );
                    self.queue.settle().await;
                    return ChunkFate::RedrivenSuccess;
                }

                if remaining.is_empty() {
                    tracing::info!(
                        item = %item.id,
                        addresses = item.addresses.len(),
                        fate = ?ChunkFate::Retired,
                        "Every queued address is permanently invalid, dropping chunk"
                    );
                    self.queue.settle().await;
                    return ChunkFate::Retired;
                }

                item.addresses = remaining;
                serde_json::json!({
                    "class": "rejected",
                    "message": "provider accepted no address in the chunk",
                    "failureCount": failure_count,
                })
            }
            Err(e) => {
                tracing::debug!(item = %item.id, error = %e, "Redrive failed");
                e.to_json()
            }
        };

        item.attempts += 1;
        item.last_error = Some(error);

        if item.attempts < self.max_attempts {
            self.queue.requeue(item).await;
            return ChunkFate::Requeued;
        }

        let entry = item.into_dead_letter();
        tracing::warn!(
            item = %entry.id,
            addresses = entry.addresses.len(),
            attempts = entry.attempts,
            fate = ?ChunkFate::DeadLettered,
            "Retry attempts exhausted, moving chunk to dead-letter store"
        );
        if let Err(e) = self.dead_letters.append(&entry).await {
            tracing::error!(
                item = %entry.id,
                error = %e,
                "Failed to persist dead-letter entry"
            );
        }
        self.queue.settle().await;
        ChunkFate::DeadLettered
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the background task that calls [`Redriver::tick`] on an interval.
pub struct RetryWorker {
    redriver: Arc<Redriver>,
    poll_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl RetryWorker {
    pub fn new(redriver: Arc<Redriver>, poll_interval: Duration) -> Self {
        Self {
            redriver,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    pub fn redriver(&self) -> &Arc<Redriver> {
        &self.redriver
    }

    /// Spawn the worker unless it is already running. Returns `true` if a task
    /// was spawned by this call.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.redriver),
            self.poll_interval,
            signal,
        ));
        *running = Some(Running { shutdown, handle });

        tracing::info!(
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Retry worker started"
        );
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Signal the worker and wait for it to exit. No-op when not running.
    pub async fn shutdown(&self) {
        let Some(Running { shutdown, handle }) = self.running.lock().await.take() else {
            return;
        };

        // The task may already be gone; a closed channel is fine.
        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Retry worker task ended abnormally");
        }
        tracing::info!("Retry worker stopped");
    }
}

async fn run_worker(
    redriver: Arc<Redriver>,
    poll_interval: Duration,
    mut signal: watch::Receiver<bool>,
) {
    let first_tick = tokio::time::Instant::now() + poll_interval;
    let mut ticker = tokio::time::interval_at(first_tick, poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                redriver.tick().await;
            }
            changed = signal.changed() => {
                if changed.is_err() || *signal.borrow() {
                    break;
                }
            }
        }
    }
}
