//! Cloud API messaging gateway client

use super::{GatewayError, GatewayReceipt, MessagingGateway, OutboundMessage};
use async_trait::async_trait;
use outreach_common::config::GatewayConfig;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest error body kept in a rejection reason
const MAX_REASON_LEN: usize = 300;

#[derive(Serialize)]
struct SendRequest<'a> {
    messaging_product: &'static str,
    recipient_type: &'static str,
    to: String,
    #[serde(flatten)]
    message: &'a OutboundMessage,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

/// HTTP client for the Cloud API `/{version}/{route_id}/messages` endpoint
pub struct CloudApiGateway {
    config: GatewayConfig,
    client: Client,
}

impl CloudApiGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Get authorization header if an access token is configured
    fn auth_header(&self) -> Option<(&'static str, String)> {
        self.config
            .access_token
            .as_ref()
            .map(|token| ("Authorization", format!("Bearer {}", token)))
    }

    fn build_request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = self.client.post(&url);

        if let Some((header, value)) = self.auth_header() {
            request = request.header(header, value);
        }

        request
    }

    fn messages_path(&self, route_id: &str) -> String {
        format!(
            "/{}/{}/messages",
            self.config.api_version.trim_matches('/'),
            route_id
        )
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

/// Digits only; the gateway wants international numbers without `+` or separators
fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn rejection_reason(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.code {
            Some(code) => format!("{} (code {})", envelope.error.message, code),
            None => envelope.error.message,
        },
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        Err(_) => body.chars().take(MAX_REASON_LEN).collect(),
    }
}

#[async_trait]
impl MessagingGateway for CloudApiGateway {
    async fn send(
        &self,
        to: &str,
        route_id: &str,
        message: &OutboundMessage,
    ) -> Result<GatewayReceipt, GatewayError> {
        let to = normalize_phone(to);
        if to.is_empty() {
            return Err(GatewayError::Rejected {
                status: StatusCode::BAD_REQUEST.as_u16(),
                reason: "recipient has no usable phone number".to_string(),
            });
        }

        let body = SendRequest {
            messaging_product: "whatsapp",
            recipient_type: "individual",
            to,
            message,
        };

        let response = self
            .build_request(&self.messages_path(route_id))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.timeout())
                } else {
                    GatewayError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.timeout())
            } else {
                GatewayError::Transport(format!("Failed to read response body: {}", e))
            }
        })?;

        if !status.is_success() {
            let reason = rejection_reason(status, &text);
            warn!("Gateway rejected {} message: {} - {}", message.kind(), status, reason);
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }

        let parsed: SendResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let message_id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                GatewayError::MalformedResponse("response carries no message id".to_string())
            })?;

        debug!("Gateway accepted message {}", message_id);
        Ok(GatewayReceipt { message_id })
    }
}
