//! Outreach Core - Campaign dispatch engine
//!
//! This crate drives bulk messaging campaigns: scheduled activation with
//! prepaid billing, rate-limited batched sends through the messaging
//! gateway, resumable checkpoints and per-recipient retries.

pub mod dispatch;
pub mod gateway;

pub use dispatch::{
    CampaignOutcome, DispatchError, DispatchMetrics, DispatchSettings, DispatchSummary,
    DispatchWorker, Dispatcher,
};
pub use gateway::{CloudApiGateway, GatewayError, GatewayReceipt, MessagingGateway, OutboundMessage};
