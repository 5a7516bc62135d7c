use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A provider-issued device address as held by the token directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceAddress {
    /// Opaque token string, the only thing the provider understands
    #[sqlx(rename = "token")]
    pub value: String,
    /// Owning user, used for audience grouping upstream
    pub user_id: Uuid,
}

/// The user-visible part of a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayBlock {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl DisplayBlock {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            image: None,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.title.trim().is_empty() && self.body.trim().is_empty()
    }
}

/// Notification content passed through to the delivery client.
///
/// Platform hint blocks are opaque JSON and are forwarded untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<DisplayBlock>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apns: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webpush: Option<serde_json::Value>,
}

impl NotificationPayload {
    /// True when no display title/body is present.
    pub fn is_data_only(&self) -> bool {
        self.notification.as_ref().is_none_or(DisplayBlock::is_blank)
    }
}

/// Per-dispatch delivery options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOptions {
    /// Provider-level dedupe tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    /// Time-to-live in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u32>,
    /// Return one response per input address in the dispatch result
    #[serde(default)]
    pub include_responses: bool,
    /// Overall deadline for the dispatch call in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl DispatchOptions {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Result of delivering to a single address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success {
        #[serde(default, rename = "messageId")]
        message_id: String,
    },
    Failure {
        #[serde(rename = "errorCode")]
        error_code: String,
    },
}

impl DeliveryOutcome {
    pub fn success(message_id: impl Into<String>) -> Self {
        Self::Success {
            message_id: message_id.into(),
        }
    }

    pub fn failure(error_code: impl Into<String>) -> Self {
        Self::Failure {
            error_code: error_code.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error_code } => Some(error_code),
        }
    }
}

/// An outcome tagged with the position of its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressResponse {
    pub index: usize,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

/// What the delivery client returns for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub success_count: usize,
    pub failure_count: usize,
    #[serde(default)]
    pub responses: Vec<AddressResponse>,
}

/// Aggregate handed back to the caller of a dispatch.
///
/// `success_count + failure_count` always equals the number of input addresses.
/// A failure may still be delivered later by the retry queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub dispatch_id: Uuid,
    pub success_count: usize,
    pub failure_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<AddressResponse>>,
    /// Distinct addresses retired as permanently invalid
    pub deactivated: usize,
    /// Chunks handed to the retry queue
    pub retry_queued_chunks: usize,
}

impl DispatchResult {
    pub fn total(&self) -> usize {
        self.success_count + self.failure_count
    }
}

/// A chunk that exhausted every redrive, as persisted to the dead-letter store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub addresses: Vec<String>,
    pub attempts: u32,
    pub last_error: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
