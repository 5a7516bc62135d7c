//! Typed errors for push delivery.
//!
//! A whole-batch send failure is either:
//! - Transient (429, 5xx, rate-limit/quota/unavailable shapes) - retried inline with backoff
//! - Unknown (anything else) - not retried inline, handed straight to the retry queue
//!
//! Per-address failures are never errors; they travel as `DeliveryOutcome::Failure`.

use thiserror::Error;

/// Message fragments that mark a provider failure as temporary.
const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "rate_limit",
    "too many requests",
    "quota",
    "throttl",
    "unavailable",
    "internal",
    "timeout",
    "timed out",
    "try again",
];

/// Whole-batch failure reported by a delivery client.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection refused, reset, or timed out before a response arrived.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-success HTTP status.
    #[error("Provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The provider answered with a structured error code.
    #[error("Provider error {code}: {message}")]
    Provider { code: String, message: String },

    /// The payload was rejected before any network call.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Retry classification of a [`DeliveryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate-limit or server-side shaped; worth retrying after a backoff.
    Transient,
    /// Anything else; not retried inline.
    Unknown,
}

impl ErrorClass {
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl DeliveryError {
    /// Classify this error for the backoff policy.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Transport(_) => ErrorClass::Transient,
            Self::Http { status, message } => {
                if is_transient_status(*status) || matches_transient_text(message) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Unknown
                }
            }
            Self::Provider { code, message } => {
                if matches_transient_text(code) || matches_transient_text(message) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Unknown
                }
            }
            Self::InvalidPayload(_) => ErrorClass::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify().is_retryable()
    }

    /// JSON form stored as a queue item's / dead letter's `lastError`.
    pub fn to_json(&self) -> serde_json::Value {
        let class = match self.classify() {
            ErrorClass::Transient => "transient",
            ErrorClass::Unknown => "unknown",
        };
        let mut value = serde_json::json!({
            "class": class,
            "message": self.to_string(),
        });
        match self {
            Self::Http { status, .. } => value["status"] = serde_json::json!(status),
            Self::Provider { code, .. } => value["code"] = serde_json::json!(code),
            Self::Transport(_) | Self::InvalidPayload(_) => {}
        }
        value
    }
}

/// Errors a caller of `PushDispatcher::dispatch` can see.
///
/// Delivery failures are never reported here; they are counted in the result.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Payload rejected by delivery client: {0}")]
    InvalidPayload(String),
}

fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Matches rate-limit/5xx shaped text, including bare status codes in a message.
fn matches_transient_text(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .any(is_transient_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_429_and_5xx_are_transient() {
        for status in [429, 500, 502, 503, 599] {
            let err = DeliveryError::Http {
                status,
                message: String::new(),
            };
            assert!(err.is_retryable(), "status {status} should be retryable");
        }
    }

    #[test]
    fn test_http_4xx_is_unknown() {
        let err = DeliveryError::Http {
            status: 400,
            message: "invalid argument".to_string(),
        };
        assert_eq!(err.classify(), ErrorClass::Unknown);

        let err = DeliveryError::Http {
            status: 401,
            message: "bad credentials".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provider_code_patterns() {
        let err = DeliveryError::Provider {
            code: "messaging/message-rate-exceeded".to_string(),
            message: "Quota exceeded for project".to_string(),
        };
        assert!(err.is_retryable());

        let err = DeliveryError::Provider {
            code: "messaging/server-unavailable".to_string(),
            message: String::new(),
        };
        assert!(err.is_retryable());

        let err = DeliveryError::Provider {
            code: "messaging/invalid-argument".to_string(),
            message: "Request contains an invalid argument".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_status_code_embedded_in_message() {
        let err = DeliveryError::Provider {
            code: "UNKNOWN".to_string(),
            message: "upstream returned 503 from gateway".to_string(),
        };
        assert!(err.is_retryable());

        let err = DeliveryError::Provider {
            code: "UNKNOWN".to_string(),
            message: "request 4040 failed".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_is_transient_and_invalid_payload_is_not() {
        assert!(DeliveryError::Transport("connection reset".to_string()).is_retryable());
        assert!(!DeliveryError::InvalidPayload("too large".to_string()).is_retryable());
    }

    #[test]
    fn test_to_json_carries_class_and_status() {
        let err = DeliveryError::Http {
            status: 429,
            message: "Too Many Requests".to_string(),
        };
        let json = err.to_json();
        assert_eq!(json["class"], "transient");
        assert_eq!(json["status"], 429);
        assert_eq!(
            json["message"],
            "Provider returned HTTP 429: Too Many Requests"
        );
    }
}
