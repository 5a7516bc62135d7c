//! Delivery client seam.
//!
//! The dispatcher talks to the push provider only through [`DeliveryClient`].
//! [`HttpDeliveryClient`] forwards batches to a push relay over HTTP; provider
//! specifics live behind that relay.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use pulse_common::config::PushConfig;
use pulse_common::error::ConfigError;
use pulse_common::types::{
    BatchResponse, DeliveryOutcome, DispatchOptions, DisplayBlock, NotificationPayload,
};

use crate::error::DeliveryError;

/// Error code for an address the client returned no response for.
pub const MISSING_RESPONSE: &str = "missing_response";

/// Serialized payload ceiling accepted by the relay (bytes).
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// Sends one batch of addresses to the push provider.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Deliver `payload` to every address in `addresses`.
    ///
    /// Per-address failures are reported in the response, never as `Err`.
    /// `Err` means the whole batch failed in transport or at the provider.
    async fn send(
        &self,
        addresses: &[String],
        payload: &NotificationPayload,
        options: &DispatchOptions,
    ) -> Result<BatchResponse, DeliveryError>;

    /// Reject malformed payloads before any network call.
    fn validate(
        &self,
        _payload: &NotificationPayload,
        _options: &DispatchOptions,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Line up a batch response with the addresses that were sent.
///
/// Always returns exactly one outcome per address. Responses with an
/// out-of-range index are ignored; addresses with no response are failures.
pub fn align_outcomes(addresses: &[String], response: &BatchResponse) -> Vec<DeliveryOutcome> {
    let mut outcomes: Vec<Option<DeliveryOutcome>> = vec![None; addresses.len()];
    for entry in &response.responses {
        if let Some(slot) = outcomes.get_mut(entry.index)
            && slot.is_none()
        {
            *slot = Some(entry.outcome.clone());
        }
    }

    if response.responses.is_empty() && response.failure_count == 0 && !addresses.is_empty() {
        if response.success_count >= addresses.len() {
            // Some relays omit per-address responses when the whole batch succeeded.
            return vec![DeliveryOutcome::success(String::new()); addresses.len()];
        }
        tracing::warn!(
            addresses = addresses.len(),
            success_count = response.success_count,
            "Batch response carried no per-address results"
        );
    }

    outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| DeliveryOutcome::failure(MISSING_RESPONSE)))
        .collect()
}

/// Wire body posted to the push relay.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayRequest<'a> {
    tokens: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    notification: Option<&'a DisplayBlock>,
    data: &'a std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    android: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    apns: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    webpush: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collapse_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_seconds: Option<u32>,
}

/// Relay error body, e.g. `{"code": "messaging/quota-exceeded", "message": "..."}`.
#[derive(Debug, serde::Deserialize)]
struct RelayErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// Delivery client that posts batches to a push relay endpoint.
#[derive(Debug, Clone)]
pub struct HttpDeliveryClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpDeliveryClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// Build from `PUSH_RELAY_URL` / `PUSH_RELAY_API_KEY` / `PUSH_RELAY_TIMEOUT_MS`.
    pub fn from_config(config: &PushConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .relay_url
            .clone()
            .ok_or(ConfigError::Missing("PUSH_RELAY_URL"))?;
        Self::new(endpoint, config.relay_api_key.clone(), config.relay_timeout())
    }

    fn request_body<'a>(
        addresses: &'a [String],
        payload: &'a NotificationPayload,
        options: &'a DispatchOptions,
    ) -> RelayRequest<'a> {
        RelayRequest {
            tokens: addresses,
            notification: payload.notification.as_ref(),
            data: &payload.data,
            android: payload.android.as_ref(),
            apns: payload.apns.as_ref(),
            webpush: payload.webpush.as_ref(),
            collapse_key: options.collapse_key.as_deref(),
            ttl_seconds: options.ttl_seconds,
        }
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn send(
        &self,
        addresses: &[String],
        payload: &NotificationPayload,
        options: &DispatchOptions,
    ) -> Result<BatchResponse, DeliveryError> {
        let body = Self::request_body(addresses, payload, options);

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<BatchResponse>()
                .await
                .map_err(|e| DeliveryError::Provider {
                    code: "invalid_response".to_string(),
                    message: e.to_string(),
                });
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<RelayErrorBody>(&text) {
            Ok(RelayErrorBody {
                code: Some(code),
                message,
            }) if !status.is_server_error() && status.as_u16() != 429 => {
                Err(DeliveryError::Provider {
                    code,
                    message: message.unwrap_or_default(),
                })
            }
            _ => Err(DeliveryError::Http {
                status: status.as_u16(),
                message: text,
            }),
        }
    }

    fn validate(
        &self,
        payload: &NotificationPayload,
        options: &DispatchOptions,
    ) -> Result<(), DeliveryError> {
        if payload.notification.is_none() && payload.data.is_empty() {
            return Err(DeliveryError::InvalidPayload(
                "payload has neither a display block nor data".to_string(),
            ));
        }

        let body = Self::request_body(&[], payload, options);
        let size = serde_json::to_vec(&body)
            .map_err(|e| DeliveryError::InvalidPayload(e.to_string()))?
            .len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(DeliveryError::InvalidPayload(format!(
                "payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::types::AddressResponse;

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i}")).collect()
    }

    #[test]
    fn test_align_outcomes_by_index() {
        let response = BatchResponse {
            success_count: 1,
            failure_count: 1,
            responses: vec![
                AddressResponse {
                    index: 1,
                    outcome: DeliveryOutcome::failure("unregistered"),
                },
                AddressResponse {
                    index: 0,
                    outcome: DeliveryOutcome::success("m-0"),
                },
            ],
        };
        let outcomes = align_outcomes(&addresses(2), &response);
        assert_eq!(outcomes[0], DeliveryOutcome::success("m-0"));
        assert_eq!(outcomes[1], DeliveryOutcome::failure("unregistered"));
    }

    #[test]
    fn test_align_outcomes_fills_missing_and_ignores_out_of_range() {
        let response = BatchResponse {
            success_count: 1,
            failure_count: 0,
            responses: vec![
                AddressResponse {
                    index: 0,
                    outcome: DeliveryOutcome::success("m-0"),
                },
                AddressResponse {
                    index: 9,
                    outcome: DeliveryOutcome::success("stray"),
                },
            ],
        };
        let outcomes = align_outcomes(&addresses(3), &response);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[1].error_code(), Some(MISSING_RESPONSE));
        assert_eq!(outcomes[2].error_code(), Some(MISSING_RESPONSE));
    }

    #[test]
    fn test_align_outcomes_whole_batch_success_without_responses() {
        let response = BatchResponse {
            success_count: 2,
            failure_count: 0,
            responses: Vec::new(),
        };
        let outcomes = align_outcomes(&addresses(2), &response);
        assert!(outcomes.iter().all(DeliveryOutcome::is_success));
    }

    #[test]
    fn test_validate_rejects_empty_and_oversized() {
        let client =
            HttpDeliveryClient::new("http://relay.invalid/send", None, Duration::from_secs(1))
                .unwrap();
        let options = DispatchOptions::default();

        let empty = NotificationPayload::default();
        assert!(client.validate(&empty, &options).is_err());

        let mut big = NotificationPayload::default();
        big.data.insert("blob".to_string(), "x".repeat(MAX_PAYLOAD_BYTES));
        assert!(matches!(
            client.validate(&big, &options),
            Err(DeliveryError::InvalidPayload(_))
        ));

        let mut ok = NotificationPayload::default();
        ok.data.insert("type".to_string(), "fall_detected".to_string());
        assert!(client.validate(&ok, &options).is_ok());
    }
}
