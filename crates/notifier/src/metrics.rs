//! Dispatch metrics and threshold alerts.
//!
//! Signals:
//! - `push.dispatch.success` / `push.dispatch.failure` - per-dispatch counts
//! - `push.invalid_rate` - deactivated / processed, alert `push.invalid_rate_high`
//! - `push.retry_queue.depth` - alert `push.retry_queue.depth_high` on the rising edge
//! - `push.dlq.appended` - chunks dead-lettered in a worker tick
//!
//! Sink failures are logged and never reach the delivery path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use pulse_common::config::PushConfig;
use pulse_common::types::DispatchResult;

pub const INVALID_RATE: &str = "push.invalid_rate";
pub const INVALID_RATE_HIGH: &str = "push.invalid_rate_high";
pub const DISPATCH_SUCCESS: &str = "push.dispatch.success";
pub const DISPATCH_FAILURE: &str = "push.dispatch.failure";
pub const QUEUE_DEPTH: &str = "push.retry_queue.depth";
pub const QUEUE_DEPTH_HIGH: &str = "push.retry_queue.depth_high";
pub const DLQ_APPENDED: &str = "push.dlq.appended";

/// External metrics/alerting backend.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn report_metric(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, String)],
    ) -> anyhow::Result<()>;

    async fn alert(&self, name: &str, info: serde_json::Value) -> anyhow::Result<()>;
}

/// Sink that writes metrics and alerts to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn report_metric(
        &self,
        name: &str,
        value: f64,
        labels: &[(&str, String)],
    ) -> anyhow::Result<()> {
        tracing::info!(metric = name, value, labels = ?labels, "metric");
        Ok(())
    }

    async fn alert(&self, name: &str, info: serde_json::Value) -> anyhow::Result<()> {
        tracing::warn!(alert = name, info = %info, "alert raised");
        Ok(())
    }
}

/// `deactivated / processed`, or 0 when nothing was processed.
#[allow(clippy::cast_precision_loss)]
pub fn invalid_rate(deactivated: usize, processed: usize) -> f64 {
    if processed == 0 {
        0.0
    } else {
        deactivated as f64 / processed as f64
    }
}

pub struct MetricsEmitter {
    sink: Arc<dyn MetricsSink>,
    invalid_rate_threshold: f64,
    queue_depth_threshold: usize,
    depth_alerting: AtomicBool,
}

impl MetricsEmitter {
    pub fn new(sink: Arc<dyn MetricsSink>, config: &PushConfig) -> Self {
        Self {
            sink,
            invalid_rate_threshold: config.invalid_rate_threshold,
            queue_depth_threshold: config.queue_depth_alert_threshold,
            depth_alerting: AtomicBool::new(false),
        }
    }

    /// Report a finished dispatch. Returns `true` if an invalid-rate alert fired.
    #[allow(clippy::cast_precision_loss)]
    pub async fn record_dispatch(&self, result: &DispatchResult) -> bool {
        let labels = [("dispatch_id", result.dispatch_id.to_string())];
        let processed = result.total();
        let rate = invalid_rate(result.deactivated, processed);

        self.report(DISPATCH_SUCCESS, result.success_count as f64, &labels)
            .await;
        self.report(DISPATCH_FAILURE, result.failure_count as f64, &labels)
            .await;
        self.report(INVALID_RATE, rate, &labels).await;

        if processed == 0 || rate < self.invalid_rate_threshold {
            return false;
        }

        tracing::warn!(
            dispatch_id = %result.dispatch_id,
            rate,
            threshold = self.invalid_rate_threshold,
            deactivated = result.deactivated,
            processed,
            "Invalid address rate above threshold"
        );

        self.raise(
            INVALID_RATE_HIGH,
            serde_json::json!({
                "dispatchId": result.dispatch_id,
                "invalidRate": rate,
                "threshold": self.invalid_rate_threshold,
                "deactivated": result.deactivated,
                "successCount": result.success_count,
                "failureCount": result.failure_count,
            }),
        )
        .await;
        true
    }

    /// Report retry queue depth after a worker tick.
    ///
    /// The depth alert fires once when the threshold is crossed and re-arms
    /// when the queue drops back below it.
    #[allow(clippy::cast_precision_loss)]
    pub async fn record_queue(&self, depth: usize, dead_lettered: usize) {
        self.report(QUEUE_DEPTH, depth as f64, &[]).await;
        if dead_lettered > 0 {
            self.report(DLQ_APPENDED, dead_lettered as f64, &[]).await;
        }

        let above = depth >= self.queue_depth_threshold;
        let was_above = self.depth_alerting.swap(above, Ordering::SeqCst);
        if above && !was_above {
            self.raise(
                QUEUE_DEPTH_HIGH,
                serde_json::json!({
                    "depth": depth,
                    "threshold": self.queue_depth_threshold,
                }),
            )
            .await;
        }
    }

    async fn report(&self, name: &str, value: f64, labels: &[(&str, String)]) {
        if let Err(e) = self.sink.report_metric(name, value, labels).await {
            tracing::debug!(metric = name, error = %e, "Failed to report metric");
        }
    }

    async fn raise(&self, name: &str, info: serde_json::Value) {
        if let Err(e) = self.sink.alert(name, info).await {
            tracing::warn!(alert = name, error = %e, "Failed to raise alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_rate() {
        assert_eq!(invalid_rate(0, 0), 0.0);
        assert_eq!(invalid_rate(5, 0), 0.0);
        assert!((invalid_rate(5, 50) - 0.10).abs() < f64::EPSILON);
        assert!((invalid_rate(1, 4) - 0.25).abs() < f64::EPSILON);
    }
}
