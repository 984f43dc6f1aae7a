//! Delivery Gateway - Hands outbound messages to the email provider

use async_trait::async_trait;
use outreach_common::config::GatewayConfig;
use outreach_common::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Message handed to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Provider identifiers for an accepted send
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
}

/// Classified gateway failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Worth retrying later (timeouts, throttling, provider outages)
    #[error("transient gateway failure: {0}")]
    Transient(String),

    /// Retrying cannot help
    #[error("permanent gateway failure: {message}")]
    Permanent {
        message: String,
        invalid_recipient: bool,
    },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    pub fn invalid_recipient(&self) -> bool {
        matches!(
            self,
            GatewayError::Permanent {
                invalid_recipient: true,
                ..
            }
        )
    }
}

impl From<GatewayError> for Error {
    fn from(e: GatewayError) -> Self {
        Error::Gateway(e.to_string())
    }
}

/// Outbound delivery boundary
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn send(
        &self,
        account_id: &str,
        email: &OutboundEmail,
    ) -> std::result::Result<SendReceipt, GatewayError>;
}

/// HTTP gateway for grant-based provider APIs
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGateway {
    /// Create a new HTTP gateway
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn send_url(&self, account_id: &str) -> String {
        format!("{}/grants/{}/messages/send", self.base_url, account_id)
    }
}

#[async_trait]
impl DeliveryGateway for HttpGateway {
    async fn send(
        &self,
        account_id: &str,
        email: &OutboundEmail,
    ) -> std::result::Result<SendReceipt, GatewayError> {
        let mut request = self.client.post(self.send_url(account_id)).json(email);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_builder() => {
                return Err(GatewayError::Permanent {
                    message: format!("Invalid request: {}", e),
                    invalid_recipient: false,
                })
            }
            Err(e) => return Err(GatewayError::Transient(e.to_string())),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(account_id = %account_id, status = %status, "Gateway responded");

        if status.is_success() {
            return Ok(receipt_from_body(&body));
        }
        Err(classify_failure(status, &body))
    }
}

/// Read provider ids from a success body; providers nest them differently
fn receipt_from_body(body: &str) -> SendReceipt {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return SendReceipt::default();
    };

    let pick = |keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|key| {
            value
                .get(*key)
                .or_else(|| value.get("data").and_then(|d| d.get(*key)))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
    };

    SendReceipt {
        provider_message_id: pick(&["provider_message_id", "message_id", "id"]),
        provider_thread_id: pick(&["provider_thread_id", "thread_id"]),
    }
}

fn classify_failure(status: StatusCode, body: &str) -> GatewayError {
    let detail: String = body.chars().take(500).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), detail);

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return GatewayError::Transient(message);
    }

    let lowered = body.to_ascii_lowercase();
    let invalid_recipient = status == StatusCode::UNPROCESSABLE_ENTITY
        || lowered.contains("invalid recipient")
        || lowered.contains("invalid_recipient");

    GatewayError::Permanent {
        message,
        invalid_recipient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn email() -> OutboundEmail {
        OutboundEmail {
            to: "lead@example.com".to_string(),
            subject: "Quick question".to_string(),
            body: "Hi there".to_string(),
        }
    }

    fn gateway(uri: &str) -> HttpGateway {
        HttpGateway::new(&GatewayConfig {
            base_url: uri.to_string(),
            api_key: Some("secret-key".to_string()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_success_reads_nested_ids() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/grants/grant-a/messages/send"))
            .and(header("authorization", "Bearer secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "request_id": "req-1",
                "data": {"id": "pm-123", "thread_id": "th-9"}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let receipt = gateway(&mock_server.uri())
            .send("grant-a", &email())
            .await
            .unwrap();

        assert_eq!(
            receipt,
            SendReceipt {
                provider_message_id: Some("pm-123".to_string()),
                provider_thread_id: Some("th-9".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_server_errors_and_throttling_are_transient() {
        for status in [503, 429, 408] {
            let mock_server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("try later"))
                .expect(1)
                .mount(&mock_server)
                .await;

            let err = gateway(&mock_server.uri())
                .send("grant-a", &email())
                .await
                .unwrap_err();
            assert!(err.is_transient(), "status {} should be transient", status);
        }
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error": "Invalid recipient address"}"#),
            )
            .mount(&mock_server)
            .await;

        let err = gateway(&mock_server.uri())
            .send("grant-a", &email())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.invalid_recipient());
    }

    #[tokio::test]
    async fn test_other_client_errors_are_permanent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("grant not found"))
            .mount(&mock_server)
            .await;

        let err = gateway(&mock_server.uri())
            .send("grant-a", &email())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Permanent {
                invalid_recipient: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transient() {
        // Nothing listens on the discard port
        let err = gateway("http://127.0.0.1:9")
            .send("grant-a", &email())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
