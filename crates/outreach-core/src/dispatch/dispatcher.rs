//! Dispatcher - Drives campaigns from activation through sends and retries
//!
//! One call to [`Dispatcher::run_at`] is a single pass over every campaign
//! that needs attention:
//!
//! 1. scheduled campaigns whose send time has passed are charged and activated
//! 2. active campaigns are locked with the processing guard
//! 3. due retries are sent; if there were any, the campaign is done for this run
//! 4. otherwise the next batch of the audience is sent, resuming from the checkpoint
//!
//! Failures are isolated per recipient (recorded as failed attempts) and per
//! campaign (the campaign is marked failed, the run continues).
//!
//! Progress is persisted after every sub-batch of `retry_batch_size` sends.
//! Each write renews the guard lease and only applies while this run still
//! holds the guard; a run that finds its guard taken over stops the pass.

use super::audience::AudienceResolver;
use super::billing::{ActivationCharge, BillingLedger};
use super::metrics::{DispatchMetrics, SendPass};
use super::pacer::Pacer;
use super::retry::RetryPolicy;
use super::schedule;
use super::summary::{CampaignOutcome, DispatchSummary};
use super::template::{RenderedMessage, TemplateRenderer};
use crate::gateway::{GatewayError, MessagingGateway};
use chrono::{DateTime, SubsecRound, Utc};
use outreach_common::config::DispatcherConfig;
use outreach_common::types::{CampaignId, Credits, RecipientId, SenderAccountId, TemplateId};
use outreach_storage::filter::FilterError;
use outreach_storage::models::{
    Campaign, CampaignProgress, CampaignStatus, DeliveryAttempt, MessageSpec, MessageTemplate,
    NewThreadMessage, Recipient, SenderAccount, VariableBinding,
};
use outreach_storage::repository::Repositories;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Upper bound for configured grace periods and leases (ten years)
const MAX_WINDOW_SECS: i64 = 10 * 365 * 24 * 3600;

/// Errors that end one campaign's processing for this run
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Template {0} not found")]
    TemplateNotFound(TemplateId),

    #[error("Template {0} has no components")]
    EmptyTemplate(TemplateId),

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Sender account {0} not found")]
    SenderAccountNotFound(SenderAccountId),

    #[error("No sender accounts configured")]
    NoSenderAccounts,

    #[error("Invalid audience filter: {0}")]
    Filter(#[from] FilterError),

    #[error("insufficient balance")]
    InsufficientBalance { required: Credits, balance: Credits },

    #[error("Campaign status {0} is not dispatchable")]
    NotDispatchable(String),

    #[error("Processing guard was taken over by another run")]
    GuardLost,

    #[error(transparent)]
    Storage(#[from] outreach_common::Error),
}

/// Pacing and batching knobs
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// New recipients (and at most as many retries) per campaign per run
    pub batch_size: usize,
    /// Sends per persisted sub-batch; each write renews the guard lease
    pub retry_batch_size: usize,
    /// Minimum spacing between gateway calls
    pub send_interval: Duration,
    /// Active campaigns wait this long after creation before the first send
    pub grace_period: chrono::Duration,
    /// Guards older than this are considered abandoned
    pub guard_lease: chrono::Duration,
    /// Bound on a single gateway call
    pub send_timeout: Duration,
}

impl From<&DispatcherConfig> for DispatchSettings {
    /// Sub-batches are clamped so that one of them always finishes inside the
    /// guard lease, even when every send waits out the full timeout.
    fn from(config: &DispatcherConfig) -> Self {
        let mut settings = Self {
            batch_size: config.batch_size.max(1),
            retry_batch_size: config.retry_batch_size.max(1),
            send_interval: config.send_interval(),
            grace_period: window(config.grace_period_secs),
            guard_lease: window(config.guard_lease_secs),
            send_timeout: config.send_timeout(),
        };

        let fits = settings.sub_batch_within_lease();
        if fits == 0 {
            warn!(
                "send_interval + send_timeout ({:?}) is not shorter than the guard lease ({}s)",
                settings.send_interval.saturating_add(settings.send_timeout),
                config.guard_lease_secs
            );
        }
        let fits = fits.max(1);
        if settings.retry_batch_size > fits {
            warn!(
                "retry_batch_size {} cannot finish within the guard lease, using {}",
                settings.retry_batch_size, fits
            );
            settings.retry_batch_size = fits;
        }
        settings
    }
}

impl DispatchSettings {
    /// Largest sub-batch whose worst-case duration stays under the guard lease
    pub fn sub_batch_within_lease(&self) -> usize {
        let lease = self.guard_lease.to_std().unwrap_or(Duration::ZERO).as_millis();
        let per_send = self.send_interval.saturating_add(self.send_timeout).as_millis().max(1);
        usize::try_from(lease.saturating_sub(1) / per_send).unwrap_or(usize::MAX)
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(MAX_WINDOW_SECS).min(MAX_WINDOW_SECS))
}

/// This run's hold on one campaign's processing guard.
///
/// The stamp written to `processing_started_at` is the holder token. It moves
/// forward on every checkpoint by the time spent holding the guard, so a long
/// pass keeps its lease alive.
struct GuardLease {
    campaign_id: CampaignId,
    stamp: DateTime<Utc>,
    acquired_at: DateTime<Utc>,
    held_since: tokio::time::Instant,
}

impl GuardLease {
    fn new(campaign_id: CampaignId, now: DateTime<Utc>) -> Self {
        Self {
            campaign_id,
            stamp: lease_stamp(now),
            acquired_at: now,
            held_since: tokio::time::Instant::now(),
        }
    }

    fn renewal(&self) -> DateTime<Utc> {
        let held = chrono::Duration::from_std(self.held_since.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        lease_stamp(self.acquired_at + held).max(self.stamp)
    }
}

/// Stamps are compared after a round trip through a microsecond column
fn lease_stamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

enum Activation {
    NotDue(Option<chrono::Duration>),
    Activated(String),
    /// Another run activated it first
    Lost,
}

enum Content {
    Template {
        template: MessageTemplate,
        bindings: Vec<VariableBinding>,
    },
    Text(String),
}

/// Everything a campaign needs before its first send; built once per pass
struct SendContext<'a> {
    campaign: &'a Campaign,
    content: Content,
    accounts: Vec<SenderAccount>,
}

impl SendContext<'_> {
    /// Recipient affiliation first, then the campaign default, then the owner's first account
    fn account_for(&self, recipient: &Recipient) -> Result<&SenderAccount, String> {
        match recipient.sender_account_id.or(self.campaign.sender_account_id) {
            Some(id) => self
                .accounts
                .iter()
                .find(|a| a.id == id)
                .ok_or_else(|| format!("Sender account {} not found for recipient", id)),
            None => self
                .accounts
                .first()
                .ok_or_else(|| "No sender accounts configured".to_string()),
        }
    }

    fn render(&self, renderer: &TemplateRenderer, recipient: &Recipient) -> RenderedMessage {
        match &self.content {
            Content::Template { template, bindings } => renderer.render(template, bindings, recipient),
            Content::Text(body) => renderer.render_text(body),
        }
    }
}

/// Result of one gateway call, before it becomes a [`DeliveryAttempt`]
struct Delivery {
    result: Result<String, String>,
    sender_account_id: Option<SenderAccountId>,
    rendered_text: Option<String>,
}

impl Delivery {
    fn stamp(&self, mut attempt: DeliveryAttempt) -> DeliveryAttempt {
        if self.sender_account_id.is_some() {
            attempt.sender_account_id = self.sender_account_id;
        }
        if self.rendered_text.is_some() {
            attempt.rendered_text = self.rendered_text.clone();
        }
        attempt
    }
}

pub struct Dispatcher {
    repos: Repositories,
    gateway: Arc<dyn MessagingGateway>,
    renderer: TemplateRenderer,
    audience: AudienceResolver,
    billing: BillingLedger,
    settings: DispatchSettings,
    metrics: Option<DispatchMetrics>,
    /// Shared by every campaign and run of this dispatcher
    pacer: Mutex<Option<Pacer>>,
}

impl Dispatcher {
    pub fn new(
        repos: Repositories,
        gateway: Arc<dyn MessagingGateway>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            audience: AudienceResolver::new(repos.recipients.clone()),
            billing: BillingLedger::new(repos.wallets.clone()),
            renderer: TemplateRenderer::new(),
            repos,
            gateway,
            settings,
            metrics: None,
            pacer: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: DispatchMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub async fn run(&self) -> outreach_common::Result<DispatchSummary> {
        self.run_at(Utc::now()).await
    }

    /// Run one pass as of `now`. Only the candidate query can fail the run.
    pub async fn run_at(&self, now: DateTime<Utc>) -> outreach_common::Result<DispatchSummary> {
        let started = Instant::now();
        let mut summary = DispatchSummary::new(now);

        let candidates = self
            .repos
            .campaigns
            .list_dispatchable(now, self.settings.guard_lease)
            .await?;
        debug!("Dispatch run: {} candidate campaigns", candidates.len());

        for campaign in candidates {
            if !self.needs_attention(&campaign, now) {
                continue;
            }
            let outcome = self.process_campaign(campaign, now).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_campaign(outcome.label());
            }
            summary.push(outcome);
        }

        let elapsed = started.elapsed();
        summary.finished_at =
            now + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        if let Some(metrics) = &self.metrics {
            metrics.record_run(elapsed.as_secs_f64());
        }

        if summary.found > 0 {
            info!(
                "Dispatch run finished in {:?}: {} campaigns found, {} processed",
                elapsed, summary.found, summary.processed
            );
        }
        Ok(summary)
    }

    fn needs_attention(&self, campaign: &Campaign, now: DateTime<Utc>) -> bool {
        match campaign.status_enum() {
            Some(CampaignStatus::Scheduled) => true,
            Some(CampaignStatus::Active) => {
                let progress = &campaign.progress.0;
                if campaign.created_at + self.settings.grace_period <= now
                    || progress.next_index.is_some()
                {
                    return true;
                }
                let policy = RetryPolicy::new(campaign.retry.0.clone());
                progress.attempts.iter().any(|a| policy.is_eligible(a, now))
            }
            _ => false,
        }
    }

    async fn process_campaign(&self, campaign: Campaign, now: DateTime<Utc>) -> CampaignOutcome {
        let id = campaign.id;
        let name = campaign.name.clone();

        match self.try_process(campaign, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = e.to_string();
                error!(campaign_id = %id, "Campaign {} failed: {}", name, reason);
                if let Err(store_err) = self.repos.campaigns.mark_failed(id, &reason, now).await {
                    error!(campaign_id = %id, "Failed to mark campaign failed: {}", store_err);
                }
                CampaignOutcome::failed(id, name, reason)
            }
        }
    }

    async fn try_process(
        &self,
        mut campaign: Campaign,
        now: DateTime<Utc>,
    ) -> Result<CampaignOutcome, DispatchError> {
        let mut activation_note = None;

        match campaign.status_enum() {
            Some(CampaignStatus::Scheduled) => match self.activate(&campaign, now).await? {
                Activation::NotDue(remaining) => {
                    let note = match remaining {
                        Some(remaining) => {
                            format!("scheduled, sends in {}", schedule::format_remaining(remaining))
                        }
                        None => "scheduled".to_string(),
                    };
                    return Ok(CampaignOutcome::skipped(&campaign, note));
                }
                Activation::Lost => {
                    return Ok(CampaignOutcome::skipped(&campaign, "activated by another run"));
                }
                Activation::Activated(note) => {
                    campaign.status = CampaignStatus::Active.to_string();
                    activation_note = Some(note);
                }
            },
            Some(CampaignStatus::Active) => {}
            _ => return Err(DispatchError::NotDispatchable(campaign.status.clone())),
        }

        let mut guard = GuardLease::new(campaign.id, now);
        let acquired = self
            .repos
            .campaigns
            .try_acquire_guard(campaign.id, guard.stamp, self.settings.guard_lease)
            .await?;
        if !acquired {
            debug!(campaign_id = %campaign.id, "Processing guard held elsewhere, skipping");
            let outcome = CampaignOutcome::skipped(&campaign, "processing guard held by another run");
            return Ok(with_note(outcome, activation_note));
        }

        let outcome = match self.process_guarded(&campaign, &mut guard, now).await {
            Err(DispatchError::GuardLost) => {
                warn!(campaign_id = %campaign.id, "Processing guard taken over mid-pass, stopping");
                let outcome =
                    CampaignOutcome::skipped(&campaign, "processing guard taken over by another run");
                return Ok(with_note(outcome, activation_note));
            }
            result => result?,
        };

        // Completion clears the guard on its own
        match self.repos.campaigns.release_guard(campaign.id, guard.stamp).await {
            Ok(true) => {}
            Ok(false) => debug!(campaign_id = %campaign.id, "Processing guard already released"),
            Err(e) => warn!(campaign_id = %campaign.id, "Failed to release processing guard: {}", e),
        }

        Ok(with_note(outcome, activation_note))
    }

    async fn activate(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<Activation, DispatchError> {
        if !schedule::is_due(campaign.schedule(), now) {
            return Ok(Activation::NotDue(schedule::time_remaining(
                campaign.schedule(),
                now,
            )));
        }

        let note = match self.billing.charge_activation(campaign).await? {
            ActivationCharge::NotRequired => "activated".to_string(),
            ActivationCharge::Charged { amount, balance } => {
                format!("activated, charged {} credits (balance {})", amount, balance)
            }
            ActivationCharge::AlreadyCharged { .. } => "activated, already charged".to_string(),
            ActivationCharge::InsufficientFunds { required, balance } => {
                return Err(DispatchError::InsufficientBalance { required, balance });
            }
        };

        if !self.repos.campaigns.activate(campaign.id, now).await? {
            return Ok(Activation::Lost);
        }

        info!(campaign_id = %campaign.id, "Campaign {} activated", campaign.name);
        Ok(Activation::Activated(note))
    }

    async fn process_guarded(
        &self,
        campaign: &Campaign,
        guard: &mut GuardLease,
        now: DateTime<Utc>,
    ) -> Result<CampaignOutcome, DispatchError> {
        let policy = RetryPolicy::new(campaign.retry.0.clone());
        let mut progress = campaign.progress.0.clone();

        // Retries beyond the batch stay eligible for the next run
        let due: Vec<RecipientId> = progress
            .attempts
            .iter()
            .filter(|a| policy.is_eligible(a, now))
            .map(|a| a.recipient_id)
            .take(self.settings.batch_size.max(1))
            .collect();

        if !due.is_empty() {
            return self
                .retry_pass(campaign, guard, &policy, &mut progress, due, now)
                .await;
        }

        self.send_pass(campaign, guard, &policy, &mut progress, now).await
    }

    async fn retry_pass(
        &self,
        campaign: &Campaign,
        guard: &mut GuardLease,
        policy: &RetryPolicy,
        progress: &mut CampaignProgress,
        due: Vec<RecipientId>,
        now: DateTime<Utc>,
    ) -> Result<CampaignOutcome, DispatchError> {
        info!(campaign_id = %campaign.id, "Retrying {} failed deliveries", due.len());

        let context = self.prepare(campaign).await?;
        let eligible: HashMap<RecipientId, Recipient> = self
            .repos
            .recipients
            .list_opted_in_by_ids(campaign.owner_id, &due)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let (mut sent, mut failed) = (0u64, 0u64);

        for chunk in due.chunks(self.settings.retry_batch_size.max(1)) {
            for recipient_id in chunk {
                let Some(previous) = progress.attempts.get(recipient_id).cloned() else {
                    continue;
                };

                let updated = match eligible.get(recipient_id) {
                    None => {
                        debug!(recipient_id = %recipient_id, "Recipient no longer eligible, not retrying");
                        policy.give_up(&previous, "recipient is no longer eligible", now)
                    }
                    Some(recipient) => {
                        self.pace().await;
                        let delivery = self.deliver(&context, recipient, now, SendPass::Retry).await;
                        let attempt = match &delivery.result {
                            Ok(message_id) => {
                                sent += 1;
                                policy.on_retry_success(&previous, message_id.clone(), now)
                            }
                            Err(error) => {
                                failed += 1;
                                policy.on_retry_failure(&previous, error.clone(), now)
                            }
                        };
                        delivery.stamp(attempt)
                    }
                };
                progress.attempts.upsert(updated);
            }

            progress.recount();
            progress.last_processed_at = Some(now);
            self.checkpoint(guard, progress).await?;
        }

        Ok(CampaignOutcome::processed(
            campaign,
            sent,
            failed,
            format!("retried {} deliveries", due.len()),
        ))
    }

    async fn send_pass(
        &self,
        campaign: &Campaign,
        guard: &mut GuardLease,
        policy: &RetryPolicy,
        progress: &mut CampaignProgress,
        now: DateTime<Utc>,
    ) -> Result<CampaignOutcome, DispatchError> {
        let audience = self.audience.resolve(campaign).await?;

        // Recipients that left the audience keep their records and stay in the total
        let current: HashSet<RecipientId> = audience.iter().map(|r| r.id).collect();
        let departed = progress
            .attempts
            .iter()
            .filter(|a| !current.contains(&a.recipient_id))
            .count();
        progress.total = (audience.len() + departed) as u64;

        if audience.is_empty() {
            progress.next_index = None;
            progress.last_processed_at = Some(now);
            progress.recount();
            self.checkpoint(guard, progress).await?;
            return self.finish(campaign, progress, 0, 0, "no matching recipients", now).await;
        }

        let context = self.prepare(campaign).await?;

        // Audience positions still without a record. The whole audience is checked,
        // not just the tail after the checkpoint: when earlier members leave, later
        // ones shift left past the stored index.
        let pending: Vec<usize> = audience
            .iter()
            .enumerate()
            .filter(|(_, r)| !progress.attempts.contains(&r.id))
            .map(|(index, _)| index)
            .collect();
        let batch_len = pending.len().min(self.settings.batch_size.max(1));
        let chunk_size = self.settings.retry_batch_size.max(1);

        let (mut sent, mut failed) = (0u64, 0u64);

        for (n, chunk) in pending[..batch_len].chunks(chunk_size).enumerate() {
            for &index in chunk {
                let recipient = &audience[index];
                self.pace().await;
                let delivery = self.deliver(&context, recipient, now, SendPass::New).await;
                let attempt = match &delivery.result {
                    Ok(message_id) => {
                        sent += 1;
                        DeliveryAttempt::sent(recipient.id, message_id.clone(), now)
                    }
                    Err(error) => {
                        failed += 1;
                        policy.on_first_failure(DeliveryAttempt::failed(recipient.id, error.clone(), now))
                    }
                };
                progress.attempts.upsert(delivery.stamp(attempt));
            }

            progress.recount();
            progress.last_processed_at = Some(now);
            progress.next_index = pending.get(n * chunk_size + chunk.len()).copied();
            self.checkpoint(guard, progress).await?;
        }

        if batch_len == 0 {
            // Every member already has a record
            progress.recount();
            progress.last_processed_at = Some(now);
            progress.next_index = None;
            self.checkpoint(guard, progress).await?;
        }

        if let Some(&next) = pending.get(batch_len) {
            info!(
                campaign_id = %campaign.id,
                "Checkpoint at {} of {} recipients", next, audience.len()
            );
            return Ok(CampaignOutcome::processed(
                campaign,
                sent,
                failed,
                format!("sent batch of {}, resuming at {} of {}", batch_len, next, audience.len()),
            ));
        }

        let note = format!("audience of {} exhausted", audience.len());
        self.finish(campaign, progress, sent, failed, note, now).await
    }

    /// Audience exhausted: one-time campaigns complete once no retry is outstanding
    async fn finish(
        &self,
        campaign: &Campaign,
        progress: &CampaignProgress,
        sent: u64,
        failed: u64,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<CampaignOutcome, DispatchError> {
        let note = note.into();
        if campaign.is_ongoing() {
            return Ok(CampaignOutcome::processed(campaign, sent, failed, note));
        }

        let awaiting_retry = progress
            .attempts
            .iter()
            .filter(|a| a.is_failed() && !a.max_retries_reached)
            .count();
        if awaiting_retry > 0 {
            return Ok(CampaignOutcome::processed(
                campaign,
                sent,
                failed,
                format!("{}; {} deliveries awaiting retry", note, awaiting_retry),
            ));
        }

        self.repos.campaigns.mark_completed(campaign.id, now).await?;
        info!(campaign_id = %campaign.id, "Campaign {} completed", campaign.name);
        Ok(CampaignOutcome::processed(
            campaign,
            sent,
            failed,
            format!("{}; completed", note),
        ))
    }

    /// Persist progress and renew the guard lease
    async fn checkpoint(
        &self,
        guard: &mut GuardLease,
        progress: &CampaignProgress,
    ) -> Result<(), DispatchError> {
        let renewed = guard.renewal();
        let saved = self
            .repos
            .campaigns
            .save_progress(guard.campaign_id, progress, guard.stamp, renewed)
            .await?;
        if !saved {
            return Err(DispatchError::GuardLost);
        }
        guard.stamp = renewed;
        Ok(())
    }

    /// Wait for the next send slot
    async fn pace(&self) {
        let mut pacer = self.pacer.lock().await;
        pacer
            .get_or_insert_with(|| Pacer::new(self.settings.send_interval))
            .ready()
            .await;
    }

    /// Load what every send of this pass needs. Any failure here is a setup error.
    async fn prepare<'a>(&self, campaign: &'a Campaign) -> Result<SendContext<'a>, DispatchError> {
        let accounts = self
            .repos
            .sender_accounts
            .list_by_owner(campaign.owner_id)
            .await?;
        if accounts.is_empty() {
            return Err(DispatchError::NoSenderAccounts);
        }
        if let Some(id) = campaign.sender_account_id {
            if !accounts.iter().any(|a| a.id == id) {
                return Err(DispatchError::SenderAccountNotFound(id));
            }
        }

        let content = match &campaign.message.0 {
            MessageSpec::Template {
                template_id,
                variables,
            } => {
                let template = self
                    .repos
                    .templates
                    .get(campaign.owner_id, *template_id)
                    .await?
                    .ok_or(DispatchError::TemplateNotFound(*template_id))?;
                if template.components.is_empty() {
                    return Err(DispatchError::EmptyTemplate(*template_id));
                }
                Content::Template {
                    template,
                    bindings: variables.clone(),
                }
            }
            MessageSpec::Text { body } => {
                if body.trim().is_empty() {
                    return Err(DispatchError::EmptyMessage);
                }
                Content::Text(body.clone())
            }
        };

        Ok(SendContext {
            campaign,
            content,
            accounts,
        })
    }

    /// Send to one recipient. Never fails; errors become part of the [`Delivery`].
    async fn deliver(
        &self,
        context: &SendContext<'_>,
        recipient: &Recipient,
        now: DateTime<Utc>,
        pass: SendPass,
    ) -> Delivery {
        let account = match context.account_for(recipient) {
            Ok(account) => account,
            Err(error) => {
                warn!(recipient_id = %recipient.id, "Cannot route message: {}", error);
                if let Some(metrics) = &self.metrics {
                    metrics.record_send(pass, false);
                }
                return Delivery {
                    result: Err(error),
                    sender_account_id: None,
                    rendered_text: None,
                };
            }
        };

        let rendered = context.render(&self.renderer, recipient);
        let send = self
            .gateway
            .send(&recipient.phone, &account.route_id, &rendered.message);
        let result = match tokio::time::timeout(self.settings.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.settings.send_timeout)),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_send(pass, result.is_ok());
        }

        match result {
            Ok(receipt) => {
                debug!(
                    campaign_id = %context.campaign.id,
                    recipient_id = %recipient.id,
                    "Sent {}", receipt.message_id
                );
                self.record_contact(context.campaign, recipient, account, &receipt.message_id, &rendered.text, now)
                    .await;
                Delivery {
                    result: Ok(receipt.message_id),
                    sender_account_id: Some(account.id),
                    rendered_text: Some(rendered.text),
                }
            }
            Err(e) => {
                warn!(
                    campaign_id = %context.campaign.id,
                    recipient_id = %recipient.id,
                    "Send failed: {}", e
                );
                Delivery {
                    result: Err(e.to_string()),
                    sender_account_id: Some(account.id),
                    rendered_text: Some(rendered.text),
                }
            }
        }
    }

    /// Thread entry and last-contacted stamp. Failures here do not undo the send.
    async fn record_contact(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        account: &SenderAccount,
        message_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) {
        let entry = NewThreadMessage {
            campaign_id: Some(campaign.id),
            sender_account_id: Some(account.id),
            gateway_message_id: Some(message_id.to_string()),
            body: text.to_string(),
            sent_at: now,
        };
        if let Err(e) = self
            .repos
            .threads
            .append_message(campaign.owner_id, recipient.id, entry)
            .await
        {
            warn!(recipient_id = %recipient.id, "Failed to append thread message: {}", e);
        }

        if let Err(e) = self
            .repos
            .recipients
            .touch_last_contacted(recipient.id, now)
            .await
        {
            warn!(recipient_id = %recipient.id, "Failed to update last contacted: {}", e);
        }
    }
}

fn with_note(outcome: CampaignOutcome, note: Option<String>) -> CampaignOutcome {
    match note {
        Some(note) => outcome.with_leading_note(&note),
        None => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{add_recipient, test_settings, CampaignBuilder, Harness};
    use crate::gateway::OutboundMessage;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use outreach_storage::models::{
        AudienceSpec, CampaignStatus, DeliveryStatus, Pricing, RetryConfig, Schedule,
        TemplateComponent,
    };
    use outreach_storage::repository::{
        CampaignRepository, RecipientRepository, SenderAccountRepository, TemplateRepository,
        ThreadRepository, WalletRepository,
    };
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn retries(count: u32, interval_days: u32) -> RetryConfig {
        RetryConfig {
            enabled: true,
            count,
            interval_days,
            start_date: None,
        }
    }

    #[tokio::test]
    async fn test_large_audience_spans_runs_via_checkpoint() {
        let h = Harness::new().await;
        let recipients = h.recipients(120).await;
        let id = h
            .insert(CampaignBuilder::new(h.owner).recipients(&recipients).build())
            .await;
        let now = Utc::now();

        let summary = h.dispatcher.run_at(now).await.unwrap();
        assert_eq!(summary.found, 1);
        assert_eq!(summary.outcome(id).unwrap().sent, 50);
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.progress.next_index, Some(50));
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Active));
        assert!(!campaign.processing);

        h.dispatcher.run_at(now).await.unwrap();
        assert_eq!(h.campaign(id).await.progress.next_index, Some(100));

        h.dispatcher.run_at(now).await.unwrap();
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.progress.next_index, None);
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Completed));
        assert_eq!(campaign.progress.total, 120);
        assert_eq!(campaign.progress.sent + campaign.progress.failed, 120);
        assert_eq!(h.gateway.calls().len(), 120);

        let after = h.dispatcher.run_at(now).await.unwrap();
        assert_eq!(after.found, 0);
        assert_eq!(h.gateway.calls().len(), 120);
    }

    #[tokio::test]
    async fn test_repeated_runs_never_resend() {
        let h = Harness::new().await;
        let recipients = h.recipients(5).await;
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .ongoing()
                    .recipients(&recipients)
                    .build(),
            )
            .await;
        let now = Utc::now();

        h.dispatcher.run_at(now).await.unwrap();
        let second = h.dispatcher.run_at(now).await.unwrap();

        assert_eq!(h.gateway.calls().len(), 5);
        assert_eq!(second.outcome(id).unwrap().sent, 0);
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Active));
        assert_eq!(campaign.progress.sent, 5);
    }

    #[tokio::test]
    async fn test_existing_records_are_skipped_after_lost_checkpoint() {
        let h = Harness::new().await;
        let recipients = h.recipients(4).await;
        let mut progress = CampaignProgress::default();
        progress.attempts.upsert(DeliveryAttempt::sent(
            recipients[1].id,
            "wamid.earlier".to_string(),
            Utc::now(),
        ));
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&recipients)
                    .progress(progress)
                    .build(),
            )
            .await;

        h.dispatcher.run_at(Utc::now()).await.unwrap();

        assert_eq!(h.gateway.calls_to(&recipients[1].phone), 0);
        assert_eq!(h.gateway.calls().len(), 3);
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.progress.sent, 4);
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Completed));
    }

    #[tokio::test]
    async fn test_concurrent_runs_send_each_recipient_once() {
        let h = Harness::new().await;
        let recipients = h.recipients(30).await;
        h.insert(CampaignBuilder::new(h.owner).recipients(&recipients).build())
            .await;
        let other = Dispatcher::new(
            Repositories::memory(h.store.as_ref().clone()),
            h.gateway.clone(),
            test_settings(),
        );

        let now = Utc::now();
        let (a, b) = tokio::join!(h.dispatcher.run_at(now), other.run_at(now));
        a.unwrap();
        b.unwrap();

        assert_eq!(h.gateway.calls().len(), 30);
    }

    #[tokio::test]
    async fn test_live_guard_excludes_campaign_and_stale_guard_is_taken_over() {
        let h = Harness::new().await;
        let recipients = h.recipients(2).await;
        let now = Utc::now();
        let live = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&recipients)
                    .guarded_since(now - ChronoDuration::minutes(1))
                    .build(),
            )
            .await;

        let summary = h.dispatcher.run_at(now).await.unwrap();
        assert!(summary.outcome(live).is_none());
        assert!(h.gateway.calls().is_empty());

        let later = now + ChronoDuration::minutes(30);
        let summary = h.dispatcher.run_at(later).await.unwrap();
        assert!(summary.outcome(live).unwrap().processed);
        assert_eq!(h.gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_grace_period_delays_first_send() {
        let mut settings = test_settings();
        settings.grace_period = ChronoDuration::minutes(2);
        let h = Harness::with_settings(settings).await;
        let recipients = h.recipients(1).await;
        let now = Utc::now();
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&recipients)
                    .created_at(now - ChronoDuration::seconds(30))
                    .build(),
            )
            .await;

        let summary = h.dispatcher.run_at(now).await.unwrap();
        assert_eq!(summary.found, 0);

        let summary = h
            .dispatcher
            .run_at(now + ChronoDuration::minutes(2))
            .await
            .unwrap();
        assert_eq!(summary.outcome(id).unwrap().sent, 1);
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_scheduled_campaign() {
        let h = Harness::new().await;
        let recipients = h.recipients(3).await;
        h.store.credit(h.owner, 300, "top up").await.unwrap();
        let now = Utc::now();
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .status(CampaignStatus::Scheduled)
                    .recipients(&recipients)
                    .schedule(Schedule {
                        send_at: (now - ChronoDuration::minutes(5)).naive_utc(),
                        timezone: "UTC".to_string(),
                    })
                    .pricing(Pricing { total_cost: 500 })
                    .build(),
            )
            .await;

        let summary = h.dispatcher.run_at(now).await.unwrap();

        let outcome = summary.outcome(id).unwrap();
        assert_eq!(outcome.error.as_deref(), Some("insufficient balance"));
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Failed));
        assert_eq!(campaign.failure_reason.as_deref(), Some("insufficient balance"));
        assert_eq!(
            WalletRepository::get(h.store.as_ref(), h.owner)
                .await
                .unwrap()
                .unwrap()
                .balance,
            300
        );
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_campaign_waits_then_activates_and_sends() {
        let h = Harness::new().await;
        let recipients = h.recipients(2).await;
        h.store.credit(h.owner, 1000, "top up").await.unwrap();
        let send_at = NaiveDate::from_ymd_opt(2030, 1, 15)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .status(CampaignStatus::Scheduled)
                    .recipients(&recipients)
                    .schedule(Schedule {
                        send_at,
                        timezone: "Asia/Kolkata".to_string(),
                    })
                    .pricing(Pricing { total_cost: 400 })
                    .build(),
            )
            .await;

        // 09:00 in Kolkata is 03:30 UTC
        let before = send_at.and_utc() - ChronoDuration::hours(6);
        let summary = h.dispatcher.run_at(before).await.unwrap();
        let outcome = summary.outcome(id).unwrap();
        assert!(!outcome.processed);
        assert_eq!(outcome.note.as_deref(), Some("scheduled, sends in 30m"));
        assert_eq!(h.campaign(id).await.status_enum(), Some(CampaignStatus::Scheduled));

        let at = send_at.and_utc() - ChronoDuration::minutes(330);
        let summary = h.dispatcher.run_at(at).await.unwrap();
        let outcome = summary.outcome(id).unwrap();
        assert!(outcome.processed);
        assert_eq!(outcome.sent, 2);

        let campaign = h.campaign(id).await;
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Completed));
        assert_eq!(campaign.activated_at, Some(at));
        assert_eq!(h.store.transactions(h.owner).await.unwrap().len(), 2);
        assert_eq!(
            WalletRepository::get(h.store.as_ref(), h.owner)
                .await
                .unwrap()
                .unwrap()
                .balance,
            600
        );
    }

    #[tokio::test]
    async fn test_disabled_retries_record_failure_once() {
        let h = Harness::new().await;
        let recipients = h.recipients(3).await;
        h.gateway.fail_for(&recipients[0].phone);
        let id = h
            .insert(CampaignBuilder::new(h.owner).recipients(&recipients).build())
            .await;
        let now = Utc::now();

        h.dispatcher.run_at(now).await.unwrap();

        let campaign = h.campaign(id).await;
        let attempt = campaign.progress.attempts.get(&recipients[0].id).unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Failed);
        assert!(attempt.max_retries_reached);
        assert_eq!(
            attempt.error.as_deref(),
            Some("Gateway rejected message (400): number is not registered")
        );
        assert_eq!(campaign.progress.sent, 2);
        assert_eq!(campaign.progress.failed, 1);
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Completed));

        h.dispatcher.run_at(now + ChronoDuration::days(30)).await.unwrap();
        assert_eq!(h.gateway.calls_to(&recipients[0].phone), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_then_completion() {
        let h = Harness::new().await;
        let recipients = h.recipients(2).await;
        let bad = &recipients[0];
        h.gateway.fail_for(&bad.phone);
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&recipients)
                    .retry(retries(2, 1))
                    .build(),
            )
            .await;
        let t0 = Utc::now();

        h.dispatcher.run_at(t0).await.unwrap();
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Active));
        assert_eq!(
            campaign.progress.attempts.get(&bad.id).unwrap().next_retry_at,
            Some(t0 + ChronoDuration::days(1))
        );

        // Not due yet: the retry pass must not fire early
        h.dispatcher
            .run_at(t0 + ChronoDuration::hours(23))
            .await
            .unwrap();
        assert_eq!(h.gateway.calls_to(&bad.phone), 1);

        let summary = h
            .dispatcher
            .run_at(t0 + ChronoDuration::days(1))
            .await
            .unwrap();
        assert_eq!(summary.outcome(id).unwrap().failed, 1);
        assert_eq!(
            h.campaign(id).await.progress.attempts.get(&bad.id).unwrap().next_retry_at,
            Some(t0 + ChronoDuration::days(2))
        );

        h.dispatcher
            .run_at(t0 + ChronoDuration::days(2))
            .await
            .unwrap();
        let attempt = h.campaign(id).await.progress.attempts.get(&bad.id).cloned().unwrap();
        assert_eq!(attempt.retry_count, 2);
        assert!(attempt.max_retries_reached);

        h.dispatcher
            .run_at(t0 + ChronoDuration::days(3))
            .await
            .unwrap();
        h.dispatcher
            .run_at(t0 + ChronoDuration::days(30))
            .await
            .unwrap();

        assert_eq!(h.gateway.calls_to(&bad.phone), 3);
        let campaign = h.campaign(id).await;
        assert!(campaign.progress.attempts.get(&bad.id).unwrap().max_retries_reached);
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Completed));
        assert_eq!(campaign.progress.sent + campaign.progress.failed, 2);
    }

    #[tokio::test]
    async fn test_successful_retry_overwrites_record() {
        let h = Harness::new().await;
        let recipients = h.recipients(1).await;
        let r = &recipients[0];
        h.gateway.fail_for(&r.phone);
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&recipients)
                    .retry(retries(3, 2))
                    .build(),
            )
            .await;
        let t0 = Utc::now();

        h.dispatcher.run_at(t0).await.unwrap();
        h.gateway.recover(&r.phone);
        let summary = h
            .dispatcher
            .run_at(t0 + ChronoDuration::days(2))
            .await
            .unwrap();
        assert_eq!(summary.outcome(id).unwrap().note.as_deref(), Some("retried 1 deliveries"));

        let campaign = h.campaign(id).await;
        let attempt = campaign.progress.attempts.get(&r.id).unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Sent);
        assert_eq!(attempt.error, None);
        assert_eq!(attempt.next_retry_at, None);
        assert_eq!(campaign.progress.sent, 1);
        assert_eq!(campaign.progress.failed, 0);
        // Retry pass does not also run the new-recipient pass
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Active));

        h.dispatcher
            .run_at(t0 + ChronoDuration::days(2))
            .await
            .unwrap();
        assert_eq!(h.campaign(id).await.status_enum(), Some(CampaignStatus::Completed));
    }

    #[tokio::test]
    async fn test_opted_out_recipient_is_not_retried() {
        let h = Harness::new().await;
        let r = add_recipient(&h.store, h.owner, "15559990000", false).await;
        let mut progress = CampaignProgress::default();
        progress.attempts.upsert(
            RetryPolicy::new(retries(3, 1)).on_first_failure(DeliveryAttempt::failed(
                r.id,
                "timeout".to_string(),
                Utc::now() - ChronoDuration::days(2),
            )),
        );
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&[r.clone()])
                    .retry(retries(3, 1))
                    .progress(progress)
                    .build(),
            )
            .await;

        h.dispatcher.run_at(Utc::now()).await.unwrap();

        let attempt = h.campaign(id).await.progress.attempts.get(&r.id).cloned().unwrap();
        assert!(attempt.max_retries_reached);
        assert_eq!(attempt.error.as_deref(), Some("recipient is no longer eligible"));
        assert_eq!(h.gateway.calls_to(&r.phone), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_is_isolated_per_campaign() {
        let h = Harness::new().await;
        let recipients = h.recipients(2).await;
        let missing_template = Uuid::new_v4();
        let broken = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .name("Broken")
                    .recipients(&recipients)
                    .message(MessageSpec::Template {
                        template_id: missing_template,
                        variables: Vec::new(),
                    })
                    .build(),
            )
            .await;
        let healthy = h
            .insert(CampaignBuilder::new(h.owner).name("Healthy").recipients(&recipients).build())
            .await;

        let summary = h.dispatcher.run_at(Utc::now()).await.unwrap();

        assert_eq!(summary.found, 2);
        assert_eq!(summary.processed, 1);
        let failed = summary.outcome(broken).unwrap();
        assert_eq!(
            failed.error.as_deref(),
            Some(format!("Template {} not found", missing_template).as_str())
        );
        assert_eq!(summary.outcome(healthy).unwrap().sent, 2);

        let campaign = h.campaign(broken).await;
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Failed));
        assert!(!campaign.processing);
        assert!(campaign.progress.attempts.is_empty());
        assert_eq!(h.gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_template_and_no_accounts_are_setup_errors() {
        let h = Harness::new().await;
        let recipients = h.recipients(1).await;
        let template = TemplateRepository::create(h.store.as_ref(), h.owner, "blank", "en", Vec::new())
            .await
            .unwrap();
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&recipients)
                    .message(MessageSpec::Template {
                        template_id: template.id,
                        variables: Vec::new(),
                    })
                    .build(),
            )
            .await;

        let summary = h.dispatcher.run_at(Utc::now()).await.unwrap();
        assert!(summary.outcome(id).unwrap().error.as_deref().unwrap().contains("no components"));

        let stranger = Uuid::new_v4();
        let r = add_recipient(&h.store, stranger, "15551110000", true).await;
        let orphan = h
            .insert(CampaignBuilder::new(stranger).recipients(&[r]).build())
            .await;
        let summary = h.dispatcher.run_at(Utc::now()).await.unwrap();
        assert_eq!(
            summary.outcome(orphan).unwrap().error.as_deref(),
            Some("No sender accounts configured")
        );
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_audience_completes_one_time_but_not_ongoing() {
        let h = Harness::new().await;
        let one_time = h.insert(CampaignBuilder::new(h.owner).build()).await;
        let ongoing = h.insert(CampaignBuilder::new(h.owner).ongoing().build()).await;

        let summary = h.dispatcher.run_at(Utc::now()).await.unwrap();

        assert!(summary.outcome(one_time).unwrap().error.is_none());
        assert_eq!(h.campaign(one_time).await.status_enum(), Some(CampaignStatus::Completed));
        assert_eq!(h.campaign(ongoing).await.status_enum(), Some(CampaignStatus::Active));
    }

    #[tokio::test]
    async fn test_template_send_routes_by_affiliation_and_records_thread() {
        let h = Harness::new().await;
        let second = SenderAccountRepository::create(h.store.as_ref(), h.owner, "Support", "waba-2", "route-2")
            .await
            .unwrap();
        let template = TemplateRepository::create(
            h.store.as_ref(),
            h.owner,
            "promo_code",
            "en_US",
            vec![TemplateComponent::Body {
                text: "Hi {{1}}, your code is {{2}}".to_string(),
            }],
        )
        .await
        .unwrap();

        let affiliated = RecipientRepository::create(
            h.store.as_ref(),
            outreach_storage::models::CreateRecipient {
                owner_id: h.owner,
                phone: "15552220000".to_string(),
                name: Some("Asha".to_string()),
                opted_in: true,
                sender_account_id: Some(second.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let unrouted = RecipientRepository::create(
            h.store.as_ref(),
            outreach_storage::models::CreateRecipient {
                owner_id: h.owner,
                phone: "15552220001".to_string(),
                opted_in: true,
                sender_account_id: Some(Uuid::new_v4()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let plain = add_recipient(&h.store, h.owner, "15552220002", true).await;

        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&[affiliated.clone(), unrouted.clone(), plain.clone()])
                    .message(MessageSpec::Template {
                        template_id: template.id,
                        variables: vec![
                            VariableBinding::field("1", "name"),
                            VariableBinding::literal("2", "ABC123"),
                        ],
                    })
                    .build(),
            )
            .await;
        let now = Utc::now();

        h.dispatcher.run_at(now).await.unwrap();

        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].to, affiliated.phone);
        assert_eq!(calls[0].route_id, "route-2");
        assert!(matches!(calls[0].message, OutboundMessage::Template { .. }));
        assert_eq!(calls[1].to, plain.phone);
        assert_eq!(calls[1].route_id, h.account.route_id);

        let campaign = h.campaign(id).await;
        let failed = campaign.progress.attempts.get(&unrouted.id).unwrap();
        assert!(failed.error.as_deref().unwrap().contains("not found for recipient"));

        let sent = campaign.progress.attempts.get(&affiliated.id).unwrap();
        assert_eq!(sent.sender_account_id, Some(second.id));
        assert_eq!(sent.rendered_text.as_deref(), Some("Hi Asha, your code is ABC123"));

        let thread = h.store.list_messages(h.owner, affiliated.id).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].body, "Hi Asha, your code is ABC123");
        assert_eq!(thread[0].campaign_id, Some(id));
        assert_eq!(thread[0].gateway_message_id, sent.message_id);

        let plain_thread = h.store.list_messages(h.owner, plain.id).await.unwrap();
        assert_eq!(plain_thread[0].body, "Hi [1], your code is ABC123");

        let contacted = RecipientRepository::get(h.store.as_ref(), affiliated.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contacted.last_contacted_at, Some(now));
        assert!(h.store.list_messages(h.owner, unrouted.id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_timeout_is_recorded_as_failure() {
        let mut settings = test_settings();
        settings.send_timeout = Duration::from_secs(2);
        let h = Harness::with_settings(settings).await;
        let recipients = h.recipients(1).await;
        h.gateway.respond_after(Duration::from_secs(10));
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&recipients)
                    .retry(retries(1, 1))
                    .build(),
            )
            .await;

        h.dispatcher.run_at(Utc::now()).await.unwrap();

        let campaign = h.campaign(id).await;
        let attempt = campaign.progress.attempts.get(&recipients[0].id).unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Failed);
        assert_eq!(attempt.error.as_deref(), Some("Gateway call timed out after 2s"));
        assert!(attempt.next_retry_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_are_paced() {
        let mut settings = test_settings();
        settings.send_interval = Duration::from_millis(1000);
        let h = Harness::with_settings(settings).await;
        let recipients = h.recipients(4).await;
        h.insert(CampaignBuilder::new(h.owner).recipients(&recipients).build())
            .await;

        let started = tokio::time::Instant::now();
        h.dispatcher.run_at(Utc::now()).await.unwrap();

        assert_eq!(h.gateway.calls().len(), 4);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_settings_from_config() {
        let config = DispatcherConfig {
            batch_size: 0,
            grace_period_secs: 120,
            ..Default::default()
        };
        let settings = DispatchSettings::from(&config);
        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.grace_period, chrono::Duration::minutes(2));
        assert_eq!(settings.send_interval, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_members_shifted_past_the_checkpoint_are_still_sent() {
        let mut settings = test_settings();
        settings.batch_size = 2;
        let h = Harness::with_settings(settings).await;
        let recipients = h.recipients(4).await;
        let id = h
            .insert(CampaignBuilder::new(h.owner).recipients(&recipients).build())
            .await;
        let now = Utc::now();

        h.dispatcher.run_at(now).await.unwrap();
        assert_eq!(h.campaign(id).await.progress.next_index, Some(2));

        // The first recipient leaves the audience; everyone after it moves up one position
        let mut campaign = h.campaign(id).await;
        campaign.audience = outreach_storage::Json(AudienceSpec::Recipients {
            ids: recipients[1..].iter().map(|r| r.id).collect(),
        });
        h.store.put_campaign(campaign).await;

        let summary = h.dispatcher.run_at(now).await.unwrap();
        assert_eq!(summary.outcome(id).unwrap().sent, 2);
        h.dispatcher.run_at(now).await.unwrap();

        assert_eq!(h.gateway.calls_to(&recipients[2].phone), 1);
        assert_eq!(h.gateway.calls_to(&recipients[3].phone), 1);
        assert_eq!(h.gateway.calls().len(), 4);
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.progress.total, 4);
        assert_eq!(campaign.progress.sent + campaign.progress.failed, 4);
        assert_eq!(campaign.progress.next_index, None);
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_pass_renews_its_guard_lease() {
        let mut settings = test_settings();
        settings.send_timeout = Duration::from_secs(30);
        let h = Harness::with_settings(settings.clone()).await;
        h.gateway.respond_after(Duration::from_secs(20));
        let recipients = h.recipients(50).await;
        let id = h
            .insert(CampaignBuilder::new(h.owner).recipients(&recipients).build())
            .await;
        let other = Dispatcher::new(
            Repositories::memory(h.store.as_ref().clone()),
            h.gateway.clone(),
            settings,
        );

        // 50 sends at 20s each outlast the 15 minute lease
        let now = Utc::now();
        let (first, second) = tokio::join!(h.dispatcher.run_at(now), async {
            tokio::time::sleep(Duration::from_secs(960)).await;
            other.run_at(now + ChronoDuration::seconds(960)).await
        });

        assert_eq!(second.unwrap().found, 0);
        assert_eq!(first.unwrap().outcome(id).unwrap().sent, 50);
        assert_eq!(h.gateway.calls().len(), 50);
        for recipient in &recipients {
            assert_eq!(h.gateway.calls_to(&recipient.phone), 1);
        }
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.progress.sent, 50);
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Completed));
        assert!(!campaign.processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_stops_when_guard_is_taken_over() {
        let mut settings = test_settings();
        settings.send_timeout = Duration::from_secs(30);
        let h = Harness::with_settings(settings).await;
        h.gateway.respond_after(Duration::from_secs(20));
        let recipients = h.recipients(20).await;
        let id = h
            .insert(CampaignBuilder::new(h.owner).recipients(&recipients).build())
            .await;

        let now = Utc::now();
        let takeover = now + ChronoDuration::minutes(16);
        let (summary, taken) = tokio::join!(h.dispatcher.run_at(now), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            CampaignRepository::try_acquire_guard(
                h.store.as_ref(),
                id,
                takeover,
                ChronoDuration::minutes(15),
            )
            .await
        });
        assert!(taken.unwrap());

        let summary = summary.unwrap();
        let outcome = summary.outcome(id).unwrap();
        assert!(!outcome.processed);
        assert_eq!(
            outcome.note.as_deref(),
            Some("processing guard taken over by another run")
        );

        // Only the first sub-batch went out; its progress write was refused
        assert_eq!(h.gateway.calls().len(), 10);
        let campaign = h.campaign(id).await;
        assert!(campaign.progress.attempts.is_empty());
        assert!(campaign.processing);
        assert_eq!(campaign.processing_started_at, Some(takeover));
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Active));
    }

    #[tokio::test]
    async fn test_retry_pass_is_capped_per_run() {
        let mut settings = test_settings();
        settings.batch_size = 2;
        let h = Harness::with_settings(settings).await;
        let recipients = h.recipients(3).await;
        let t0 = Utc::now();
        let policy = RetryPolicy::new(retries(3, 2));
        let mut progress = CampaignProgress::default();
        for recipient in &recipients {
            progress.attempts.upsert(policy.on_first_failure(DeliveryAttempt::failed(
                recipient.id,
                "number is not registered".to_string(),
                t0,
            )));
        }
        let id = h
            .insert(
                CampaignBuilder::new(h.owner)
                    .recipients(&recipients)
                    .retry(retries(3, 2))
                    .progress(progress)
                    .build(),
            )
            .await;
        let later = t0 + ChronoDuration::days(2);

        let first = h.dispatcher.run_at(later).await.unwrap();
        assert_eq!(first.outcome(id).unwrap().note.as_deref(), Some("retried 2 deliveries"));
        assert_eq!(h.gateway.calls().len(), 2);

        let second = h.dispatcher.run_at(later).await.unwrap();
        assert_eq!(second.outcome(id).unwrap().note.as_deref(), Some("retried 1 deliveries"));
        assert_eq!(h.gateway.calls().len(), 3);

        h.dispatcher.run_at(later).await.unwrap();
        let campaign = h.campaign(id).await;
        assert_eq!(campaign.progress.sent, 3);
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_spans_campaigns() {
        let mut settings = test_settings();
        settings.send_interval = Duration::from_millis(1000);
        let h = Harness::with_settings(settings).await;
        let recipients = h.recipients(4).await;
        for (i, recipient) in recipients.iter().enumerate() {
            h.insert(
                CampaignBuilder::new(h.owner)
                    .name(&format!("Flash sale {}", i))
                    .recipients(std::slice::from_ref(recipient))
                    .build(),
            )
            .await;
        }

        let started = tokio::time::Instant::now();
        let summary = h.dispatcher.run_at(Utc::now()).await.unwrap();

        assert_eq!(summary.processed, 4);
        assert_eq!(h.gateway.calls().len(), 4);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_sub_batches_are_clamped_to_the_guard_lease() {
        let config = DispatcherConfig {
            guard_lease_secs: 60,
            send_timeout_secs: 30,
            send_interval_ms: 1000,
            retry_batch_size: 10,
            ..Default::default()
        };
        let settings = DispatchSettings::from(&config);
        assert_eq!(settings.retry_batch_size, 1);
        assert_eq!(settings.batch_size, config.batch_size);

        let defaults = DispatchSettings::default();
        assert_eq!(defaults.sub_batch_within_lease(), 29);
        assert_eq!(defaults.retry_batch_size, 10);
    }
}
