//! Bulk dispatch: partition, fan out to a bounded worker pool, aggregate.
//!
//! A dispatch call always produces a [`DispatchResult`] whose success and failure
//! counts add up to the number of input addresses. Chunks that could not be
//! delivered inline are handed to the retry queue and counted as failures with
//! code `retry_queued` (or `deadline_exceeded` when the caller's deadline cut
//! them short).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use pulse_common::config::{MAX_CONCURRENCY, PushConfig};
use pulse_common::error::StoreError;
use pulse_common::types::{
    AddressResponse, DeadLetterEntry, DeliveryOutcome, DeviceAddress, DispatchOptions,
    DispatchResult, NotificationPayload,
};

use crate::backoff::BackoffPolicy;
use crate::chunk::{Chunk, ChunkFate, partition};
use crate::client::{DeliveryClient, align_outcomes};
use crate::dead_letter::{DeadLetterStore, MemoryDeadLetterStore};
use crate::error::DispatchError;
use crate::lifecycle::TokenLifecycleManager;
use crate::metrics::{MetricsEmitter, MetricsSink, TracingMetricsSink};
use crate::normalize::normalize;
use crate::retry_queue::{Redriver, RetryQueue, RetryQueueItem, RetryWorker};
use crate::token_store::{NoopTokenStore, TokenStore};

/// Failure code for addresses whose chunk was handed to the retry queue.
pub const RETRY_QUEUED: &str = "retry_queued";

/// Failure code for addresses whose chunk had not finished when the deadline fired.
pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";

/// Failure code for addresses whose chunk worker died without reporting.
pub const DISPATCH_ABORTED: &str = "dispatch_aborted";

/// Progress of a single dispatch call. Every call reaches `Aggregated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    New,
    Partitioned,
    Dispatching,
    Aggregated,
}

/// Result of pushing one chunk through send-with-retry.
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub fate: ChunkFate,
    /// One outcome per chunk address, in chunk order
    pub outcomes: Vec<DeliveryOutcome>,
    pub attempts: u32,
    pub last_error: Option<serde_json::Value>,
}

impl ChunkReport {
    fn queued(len: usize, code: &str, attempts: u32, last_error: serde_json::Value) -> Self {
        Self {
            fate: ChunkFate::RetryQueued,
            outcomes: vec![DeliveryOutcome::failure(code); len],
            attempts,
            last_error: Some(last_error),
        }
    }
}

/// Number of workers to run for `chunks` chunks.
///
/// `min(configured, chunks)` with `configured` held to `1..=MAX_CONCURRENCY`;
/// zero only when there is nothing to send.
pub fn effective_concurrency(configured: usize, chunks: usize) -> usize {
    if chunks == 0 {
        return 0;
    }
    configured.clamp(1, MAX_CONCURRENCY).min(chunks)
}

/// Send one chunk, retrying transient whole-batch failures with backoff.
///
/// A provider answer is final even if every address failed. When inline
/// attempts run out, or the failure is not transient, the chunk is reported
/// as queued for redrive.
pub async fn send_with_retry(
    client: &dyn DeliveryClient,
    backoff: &BackoffPolicy,
    chunk: &Chunk,
    payload: &NotificationPayload,
    options: &DispatchOptions,
) -> ChunkReport {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let error = match client.send(&chunk.addresses, payload, options).await {
            Ok(response) => {
                return ChunkReport {
                    fate: ChunkFate::Delivered,
                    outcomes: align_outcomes(&chunk.addresses, &response),
                    attempts,
                    last_error: None,
                };
            }
            Err(e) => e,
        };

        let retryable = error.is_retryable();
        if retryable && backoff.should_retry(attempts) {
            let delay = backoff.delay(attempts - 1);
            tracing::warn!(
                chunk = chunk.index,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Transient send failure, backing off"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        tracing::warn!(
            chunk = chunk.index,
            addresses = chunk.len(),
            attempts,
            retryable,
            error = %error,
            "Giving up on chunk inline, queueing for redrive"
        );
        return ChunkReport::queued(chunk.len(), RETRY_QUEUED, attempts, error.to_json());
    }
}

/// Fans bulk notifications out to the delivery client and owns the retry worker.
pub struct PushDispatcher {
    config: PushConfig,
    client: Arc<dyn DeliveryClient>,
    backoff: BackoffPolicy,
    lifecycle: Arc<TokenLifecycleManager>,
    metrics: Arc<MetricsEmitter>,
    dead_letters: Arc<dyn DeadLetterStore>,
    queue: RetryQueue,
    worker: RetryWorker,
}

pub struct PushDispatcherBuilder {
    config: PushConfig,
    client: Arc<dyn DeliveryClient>,
    token_store: Option<Arc<dyn TokenStore>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    permanent_error_codes: Option<Vec<String>>,
}

impl PushDispatcherBuilder {
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Override the configured permanent-failure codes.
    pub fn permanent_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permanent_error_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> PushDispatcher {
        let config = self.config.clamped();

        let token_store = self
            .token_store
            .unwrap_or_else(|| Arc::new(NoopTokenStore));
        let dead_letters = self
            .dead_letter_store
            .unwrap_or_else(|| Arc::new(MemoryDeadLetterStore::new()));
        let sink = self
            .metrics_sink
            .unwrap_or_else(|| Arc::new(TracingMetricsSink));
        let codes = self
            .permanent_error_codes
            .unwrap_or_else(|| config.permanent_error_codes.clone());

        let lifecycle = Arc::new(TokenLifecycleManager::new(token_store, codes));
        let metrics = Arc::new(MetricsEmitter::new(sink, &config));
        let queue = RetryQueue::new();

        let redriver = Redriver::new(
            queue.clone(),
            Arc::clone(&self.client),
            Arc::clone(&lifecycle),
            Arc::clone(&dead_letters),
            Arc::clone(&metrics),
            config.max_retry_attempts,
            config.queue_batch_size,
        );
        let worker = RetryWorker::new(Arc::new(redriver), config.queue_poll_interval());

        PushDispatcher {
            backoff: BackoffPolicy::from_config(&config),
            config,
            client: self.client,
            lifecycle,
            metrics,
            dead_letters,
            queue,
            worker,
        }
    }
}

impl PushDispatcher {
    pub fn builder(config: PushConfig, client: Arc<dyn DeliveryClient>) -> PushDispatcherBuilder {
        PushDispatcherBuilder {
            config,
            client,
            token_store: None,
            dead_letter_store: None,
            metrics_sink: None,
            permanent_error_codes: None,
        }
    }

    pub fn new(config: PushConfig, client: Arc<dyn DeliveryClient>) -> Self {
        Self::builder(config, client).build()
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub fn retry_worker(&self) -> &RetryWorker {
        &self.worker
    }

    /// Start the retry worker. Idempotent; returns `true` if it was spawned now.
    pub async fn start(&self) -> bool {
        self.worker.start().await
    }

    /// Stop the retry worker. Queued items stay in memory.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    /// Queued chunks plus any the worker is redriving right now.
    pub async fn pending_redrives(&self) -> usize {
        self.queue.pending().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.dead_letters.load().await
    }

    /// Deliver `payload` to every address.
    ///
    /// Only a payload the delivery client rejects up front is an error. Delivery
    /// failures of any kind are counted in the result.
    pub async fn dispatch(
        &self,
        addresses: &[String],
        payload: NotificationPayload,
        options: DispatchOptions,
    ) -> Result<DispatchResult, DispatchError> {
        let dispatch_id = Uuid::new_v4();
        tracing::debug!(
            dispatch = %dispatch_id,
            addresses = addresses.len(),
            phase = ?DispatchPhase::New,
            "Dispatch received"
        );

        if addresses.is_empty() {
            tracing::debug!(dispatch = %dispatch_id, "No addresses, nothing to send");
            return Ok(DispatchResult {
                dispatch_id,
                responses: options.include_responses.then(Vec::new),
                ..DispatchResult::default()
            });
        }

        let payload = normalize(payload);
        self.client
            .validate(&payload, &options)
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
        let payload = Arc::new(payload);

        let chunks = Arc::new(partition(addresses, self.config.chunk_size));
        let concurrency = effective_concurrency(self.config.concurrency, chunks.len());
        tracing::debug!(
            dispatch = %dispatch_id,
            chunks = chunks.len(),
            concurrency,
            phase = ?DispatchPhase::Partitioned,
            "Addresses partitioned"
        );

        let (slots, deadline_hit) = self
            .run_chunks(dispatch_id, &chunks, &payload, &options, concurrency)
            .await;

        let mut outcomes = Vec::with_capacity(addresses.len());
        let mut queued = Vec::new();
        for (chunk, slot) in chunks.iter().zip(slots) {
            let report = slot.unwrap_or_else(|| {
                let (code, message) = if deadline_hit {
                    (DEADLINE_EXCEEDED, "dispatch deadline passed before the chunk finished")
                } else {
                    (DISPATCH_ABORTED, "chunk worker stopped before reporting")
                };
                ChunkReport::queued(
                    chunk.len(),
                    code,
                    0,
                    serde_json::json!({"class": code, "message": message}),
                )
            });

            if report.fate == ChunkFate::RetryQueued {
                queued.push(RetryQueueItem::new(
                    chunk.addresses.clone(),
                    Arc::clone(&payload),
                    options.clone(),
                    report.last_error.unwrap_or(serde_json::Value::Null),
                ));
            }
            outcomes.extend(report.outcomes);
        }

        let success_count = outcomes.iter().filter(|o| o.is_success()).count();
        let mut result = DispatchResult {
            dispatch_id,
            success_count,
            failure_count: outcomes.len() - success_count,
            responses: None,
            deactivated: 0,
            retry_queued_chunks: queued.len(),
        };

        if !queued.is_empty() {
            self.queue.extend(queued).await;
            self.worker.start().await;
            self.metrics.record_queue(self.queue.len().await, 0).await;
        }

        let plan = self
            .lifecycle
            .plan(addresses.iter().map(String::as_str).zip(&outcomes));
        result.deactivated = self.lifecycle.apply(&plan).await;

        if options.include_responses {
            result.responses = Some(
                outcomes
                    .into_iter()
                    .enumerate()
                    .map(|(index, outcome)| AddressResponse { index, outcome })
                    .collect(),
            );
        }

        tracing::info!(
            dispatch = %dispatch_id,
            success = result.success_count,
            failure = result.failure_count,
            deactivated = result.deactivated,
            retry_queued_chunks = result.retry_queued_chunks,
            phase = ?DispatchPhase::Aggregated,
            "Dispatch finished"
        );

        self.metrics.record_dispatch(&result).await;
        Ok(result)
    }

    /// [`dispatch`](Self::dispatch) for addresses read from the token directory.
    pub async fn dispatch_to_devices(
        &self,
        devices: &[DeviceAddress],
        payload: NotificationPayload,
        options: DispatchOptions,
    ) -> Result<DispatchResult, DispatchError> {
        let addresses: Vec<String> = devices.iter().map(|d| d.value.clone()).collect();
        self.dispatch(&addresses, payload, options).await
    }

    /// Run every chunk through a pool of `concurrency` workers.
    ///
    /// Returns one slot per chunk (empty if the chunk never reported) and
    /// whether the deadline cut the run short.
    async fn run_chunks(
        &self,
        dispatch_id: Uuid,
        chunks: &Arc<Vec<Chunk>>,
        payload: &Arc<NotificationPayload>,
        options: &DispatchOptions,
        concurrency: usize,
    ) -> (Vec<Option<ChunkReport>>, bool) {
        let cursor = Arc::new(AtomicUsize::new(0));
        let slots: Arc<Mutex<Vec<Option<ChunkReport>>>> =
            Arc::new(Mutex::new(vec![None; chunks.len()]));
        let shared_options = Arc::new(options.clone());

        tracing::debug!(
            dispatch = %dispatch_id,
            workers = concurrency,
            phase = ?DispatchPhase::Dispatching,
            "Starting chunk workers"
        );

        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            let chunks = Arc::clone(chunks);
            let payload = Arc::clone(payload);
            let options = Arc::clone(&shared_options);
            let cursor = Arc::clone(&cursor);
            let slots = Arc::clone(&slots);
            let client = Arc::clone(&self.client);
            let backoff = self.backoff;

            workers.spawn(async move {
                loop {
                    let next = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(chunk) = chunks.get(next) else {
                        break;
                    };
                    let report =
                        send_with_retry(client.as_ref(), &backoff, chunk, &payload, &options)
                            .await;
                    tracing::debug!(
                        chunk = chunk.index,
                        attempts = report.attempts,
                        fate = ?report.fate,
                        "Chunk finished"
                    );
                    slots.lock().await[next] = Some(report);
                }
            });
        }

        let mut deadline_hit = false;
        match options.deadline() {
            Some(deadline) => {
                if tokio::time::timeout(deadline, join_workers(&mut workers))
                    .await
                    .is_err()
                {
                    deadline_hit = true;
                    tracing::warn!(
                        dispatch = %dispatch_id,
                        deadline_ms = options.deadline_ms,
                        "Dispatch deadline reached, aborting unfinished chunks"
                    );
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                }
            }
            None => join_workers(&mut workers).await,
        }

        let reports = std::mem::take(&mut *slots.lock().await);
        (reports, deadline_hit)
    }
}

async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined
            && e.is_panic()
        {
            tracing::error!(error = %e, "Chunk worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_concurrency() {
        assert_eq!(effective_concurrency(5, 0), 0);
        assert_eq!(effective_concurrency(5, 3), 3);
        assert_eq!(effective_concurrency(5, 40), 5);
        assert_eq!(effective_concurrency(0, 4), 1);
        assert_eq!(effective_concurrency(64, 40), MAX_CONCURRENCY);
    }

    #[test]
    fn test_queued_report_fails_every_address() {
        let report = ChunkReport::queued(3, RETRY_QUEUED, 2, serde_json::json!({}));
        assert_eq!(report.fate, ChunkFate::RetryQueued);
        assert_eq!(report.outcomes.len(), 3);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.error_code() == Some(RETRY_QUEUED))
        );
    }
}
