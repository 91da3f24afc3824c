//! Messaging gateway boundary
//!
//! The dispatcher only ever calls [`MessagingGateway::send`]. The production
//! implementation talks to the Cloud API over HTTP; tests swap in fakes.

mod client;
mod payload;

pub use client::CloudApiGateway;
pub use payload::{
    Language, MediaLink, OutboundMessage, Parameter, PayloadComponent, TemplatePayload, TextBody,
};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Gateway acknowledgement of an accepted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReceipt {
    pub message_id: String,
}

/// Per-send failure. Every variant is recorded against the recipient and is
/// retryable under the campaign's retry policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Gateway rejected message ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gateway transport error: {0}")]
    Transport(String),

    #[error("Malformed gateway response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send one message to `to` through the sender identified by `route_id`.
    ///
    /// Never retries internally.
    async fn send(
        &self,
        to: &str,
        route_id: &str,
        message: &OutboundMessage,
    ) -> Result<GatewayReceipt, GatewayError>;
}
