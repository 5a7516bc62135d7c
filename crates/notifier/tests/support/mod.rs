//! Fakes shared by the notifier integration tests.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use pulse_common::config::PushConfig;
use pulse_common::error::StoreError;
use pulse_common::types::{
    AddressResponse, BatchResponse, DeadLetterEntry, DeliveryOutcome, DispatchOptions,
    NotificationPayload,
};
use pulse_notifier::{DeadLetterStore, DeliveryClient, DeliveryError, MetricsSink, TokenStore};

/// Config with near-zero backoff and a worker that never wakes on its own.
pub fn test_config() -> PushConfig {
    PushConfig {
        backoff_base_ms: 1,
        backoff_jitter_ms: 0,
        backoff_max_ms: 5,
        queue_poll_interval_ms: 3_600_000,
        ..PushConfig::default()
    }
}

pub fn addresses(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("token-{i}")).collect()
}

pub fn data_payload(kind: &str) -> NotificationPayload {
    let mut payload = NotificationPayload::default();
    payload.data.insert("type".to_string(), kind.to_string());
    payload
}

/// Build a batch response by mapping each address to an outcome.
pub fn respond(
    addresses: &[String],
    outcome: impl Fn(&str) -> DeliveryOutcome,
) -> BatchResponse {
    let responses: Vec<AddressResponse> = addresses
        .iter()
        .enumerate()
        .map(|(index, address)| AddressResponse {
            index,
            outcome: outcome(address),
        })
        .collect();
    let success_count = responses.iter().filter(|r| r.outcome.is_success()).count();
    BatchResponse {
        success_count,
        failure_count: responses.len() - success_count,
        responses,
    }
}

pub fn all_success(addresses: &[String]) -> BatchResponse {
    respond(addresses, |a| DeliveryOutcome::success(format!("msg-{a}")))
}

pub fn http_error(status: u16) -> DeliveryError {
    DeliveryError::Http {
        status,
        message: format!("status {status}"),
    }
}

type Responder = dyn Fn(usize, &[String]) -> Result<BatchResponse, DeliveryError> + Send + Sync;

/// Delivery client driven by a closure of `(call number, addresses)`.
pub struct FakeClient {
    responder: Box<Responder>,
    delay: Duration,
    reject_payloads: bool,
    calls: Mutex<Vec<Vec<String>>>,
    payloads: Mutex<Vec<NotificationPayload>>,
    call_counter: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeClient {
    pub fn new(
        responder: impl Fn(usize, &[String]) -> Result<BatchResponse, DeliveryError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            reject_payloads: false,
            calls: Mutex::new(Vec::new()),
            payloads: Mutex::new(Vec::new()),
            call_counter: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_, addresses| Ok(all_success(addresses)))
    }

    pub fn failing(status: u16) -> Self {
        Self::new(move |_, _| Err(http_error(status)))
    }

    /// Fails the first `n` calls with a 503, then succeeds.
    pub fn failing_first(n: usize) -> Self {
        Self::new(move |call, addresses| {
            if call < n {
                Err(http_error(503))
            } else {
                Ok(all_success(addresses))
            }
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejecting_payloads(mut self) -> Self {
        self.reject_payloads = true;
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_counter.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<NotificationPayload> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryClient for FakeClient {
    async fn send(
        &self,
        addresses: &[String],
        payload: &NotificationPayload,
        _options: &DispatchOptions,
    ) -> Result<BatchResponse, DeliveryError> {
        let call = self.call_counter.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(addresses.to_vec());
        self.payloads.lock().unwrap().push(payload.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = (self.responder)(call, addresses);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn validate(
        &self,
        _payload: &NotificationPayload,
        _options: &DispatchOptions,
    ) -> Result<(), DeliveryError> {
        if self.reject_payloads {
            return Err(DeliveryError::InvalidPayload("rejected by test".to_string()));
        }
        Ok(())
    }
}

/// Token store that records every call.
#[derive(Default)]
pub struct RecordingTokenStore {
    pub deactivated: Mutex<Vec<Vec<String>>>,
    pub touched: Mutex<Vec<Vec<String>>>,
    pub fail: bool,
}

impl RecordingTokenStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn deactivate_calls(&self) -> Vec<Vec<String>> {
        self.deactivated.lock().unwrap().clone()
    }

    pub fn touch_calls(&self) -> Vec<Vec<String>> {
        self.touched.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenStore for RecordingTokenStore {
    async fn deactivate(&self, addresses: &[String]) -> anyhow::Result<()> {
        self.deactivated.lock().unwrap().push(addresses.to_vec());
        if self.fail {
            anyhow::bail!("token directory unavailable");
        }
        Ok(())
    }

    async fn touch_last_used(&self, addresses: &[String]) -> anyhow::Result<()> {
        self.touched.lock().unwrap().push(addresses.to_vec());
        Ok(())
    }
}

/// Metrics sink that records every metric and alert.
#[derive(Default)]
pub struct RecordingSink {
    pub metrics: Mutex<Vec<(String, f64)>>,
    pub alerts: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingSink {
    pub fn alerts_named(&self, name: &str) -> Vec<serde_json::Value> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, info)| info.clone())
            .collect()
    }

    pub fn values_named(&self, name: &str) -> Vec<f64> {
        self.metrics
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn report_metric(
        &self,
        name: &str,
        value: f64,
        _labels: &[(&str, String)],
    ) -> anyhow::Result<()> {
        self.metrics.lock().unwrap().push((name.to_string(), value));
        Ok(())
    }

    async fn alert(&self, name: &str, info: serde_json::Value) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push((name.to_string(), info));
        Ok(())
    }
}

/// Dead-letter store whose writes always fail.
pub struct BrokenDeadLetterStore;

#[async_trait]
impl DeadLetterStore for BrokenDeadLetterStore {
    async fn append(&self, _entry: &DeadLetterEntry) -> Result<(), StoreError> {
        Err(StoreError::Internal("disk full".to_string()))
    }

    async fn load(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        Ok(Vec::new())
    }
}
