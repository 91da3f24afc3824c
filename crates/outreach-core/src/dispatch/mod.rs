//! Campaign dispatch - Scheduling, batched sends, retries and billing

mod audience;
mod billing;
mod dispatcher;
mod metrics;
mod pacer;
mod retry;
pub mod schedule;
mod summary;
mod template;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use audience::AudienceResolver;
pub use billing::{ActivationCharge, BillingLedger};
pub use dispatcher::{DispatchError, DispatchSettings, Dispatcher};
pub use metrics::{DispatchMetrics, SendPass};
pub use pacer::Pacer;
pub use retry::{next_retry_time, RetryPolicy};
pub use summary::{CampaignOutcome, DispatchSummary};
pub use template::{RenderedMessage, TemplateRenderer};
pub use worker::DispatchWorker;
