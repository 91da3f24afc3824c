//! In-process store
//!
//! Implements every repository trait over a single mutex-protected state.
//! Conditional updates (guard, activation, debit) run under that mutex,
//! which gives them the same all-or-nothing behaviour as the SQL versions.
//! Used by tests and by the `memory` database backend.

use crate::filter::RecipientFilter;
use crate::models::{
    Campaign, CampaignProgress, CampaignStatus, CreateCampaign, CreateRecipient, DebitOutcome,
    DebitRequest, MessageTemplate, NewThreadMessage, Recipient, SenderAccount, TemplateComponent,
    Thread, ThreadMessage, Wallet, WalletTransaction,
};
use crate::repository::{
    CampaignRepository, RecipientRepository, SenderAccountRepository, TemplateRepository,
    ThreadRepository, WalletRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use outreach_common::types::{AccountId, CampaignId, Credits, RecipientId, TemplateId};
use outreach_common::{Error, Result};
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    campaigns: Vec<Campaign>,
    recipients: Vec<Recipient>,
    sender_accounts: Vec<SenderAccount>,
    templates: HashMap<TemplateId, MessageTemplate>,
    threads: Vec<Thread>,
    thread_messages: Vec<ThreadMessage>,
    wallets: HashMap<AccountId, Wallet>,
    transactions: Vec<WalletTransaction>,
}

impl State {
    fn campaign_mut(&mut self, id: CampaignId) -> Result<&mut Campaign> {
        self.campaigns
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("Campaign {}", id)))
    }

    fn balance(&self, account_id: AccountId) -> Credits {
        self.wallets.get(&account_id).map(|w| w.balance).unwrap_or(0)
    }
}

/// Shared in-memory store; clones see the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a campaign verbatim
    pub async fn put_campaign(&self, campaign: Campaign) {
        let mut state = self.state.lock().await;
        match state.campaigns.iter_mut().find(|c| c.id == campaign.id) {
            Some(existing) => *existing = campaign,
            None => state.campaigns.push(campaign),
        }
    }
}

fn is_guard_free(campaign: &Campaign, cutoff: DateTime<Utc>) -> bool {
    !campaign.processing || campaign.processing_started_at.map_or(true, |t| t < cutoff)
}

fn is_held_by(campaign: &Campaign, holder: DateTime<Utc>) -> bool {
    campaign.processing && campaign.processing_started_at == Some(holder)
}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::now_v7(),
            owner_id: input.owner_id,
            name: input.name,
            campaign_type: input.campaign_type.to_string(),
            status: input.status.to_string(),
            message: Json(input.message),
            audience: Json(input.audience),
            schedule: input.schedule.map(Json),
            retry: Json(input.retry),
            pricing: input.pricing.map(Json),
            sender_account_id: input.sender_account_id,
            progress: Json(CampaignProgress::default()),
            processing: false,
            processing_started_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            activated_at: None,
            completed_at: None,
            failed_at: None,
        };

        self.state.lock().await.campaigns.push(campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let state = self.state.lock().await;
        Ok(state.campaigns.iter().find(|c| c.id == id).cloned())
    }

    async fn list_dispatchable(&self, now: DateTime<Utc>, lease: Duration) -> Result<Vec<Campaign>> {
        let cutoff = now - lease;
        let state = self.state.lock().await;
        let mut campaigns: Vec<Campaign> = state
            .campaigns
            .iter()
            .filter(|c| match c.status_enum() {
                Some(CampaignStatus::Scheduled) => true,
                Some(CampaignStatus::Active) => is_guard_free(c, cutoff),
                _ => false,
            })
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn try_acquire_guard(&self, id: CampaignId, now: DateTime<Utc>, lease: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let campaign = state.campaign_mut(id)?;

        if campaign.status_enum() != Some(CampaignStatus::Active) || !is_guard_free(campaign, now - lease) {
            return Ok(false);
        }

        campaign.processing = true;
        campaign.processing_started_at = Some(now);
        campaign.updated_at = now;
        Ok(true)
    }

    async fn release_guard(&self, id: CampaignId, holder: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let campaign = state.campaign_mut(id)?;
        if !is_held_by(campaign, holder) {
            return Ok(false);
        }
        campaign.processing = false;
        campaign.processing_started_at = None;
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn save_progress(
        &self,
        id: CampaignId,
        progress: &CampaignProgress,
        holder: DateTime<Utc>,
        renewed: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let campaign = state.campaign_mut(id)?;
        if !is_held_by(campaign, holder) {
            return Ok(false);
        }
        campaign.progress = Json(progress.clone());
        campaign.processing_started_at = Some(renewed);
        campaign.updated_at = renewed;
        Ok(true)
    }

    async fn activate(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let campaign = state.campaign_mut(id)?;
        if campaign.status_enum() != Some(CampaignStatus::Scheduled) {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Active.to_string();
        campaign.activated_at = Some(now);
        campaign.updated_at = now;
        Ok(true)
    }

    async fn mark_completed(&self, id: CampaignId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let campaign = state.campaign_mut(id)?;
        campaign.status = CampaignStatus::Completed.to_string();
        campaign.completed_at = Some(now);
        campaign.updated_at = now;
        campaign.processing = false;
        campaign.processing_started_at = None;
        Ok(())
    }

    async fn mark_failed(&self, id: CampaignId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let campaign = state.campaign_mut(id)?;
        campaign.status = CampaignStatus::Failed.to_string();
        campaign.failure_reason = Some(reason.to_string());
        campaign.failed_at = Some(now);
        campaign.updated_at = now;
        campaign.processing = false;
        campaign.processing_started_at = None;
        Ok(())
    }
}

#[async_trait]
impl RecipientRepository for MemoryStore {
    async fn create(&self, input: CreateRecipient) -> Result<Recipient> {
        let recipient = Recipient {
            id: Uuid::now_v7(),
            owner_id: input.owner_id,
            phone: input.phone,
            name: input.name,
            email: input.email,
            opted_in: input.opted_in,
            tags: input.tags,
            custom_fields: serde_json::Value::Object(input.custom_fields),
            sender_account_id: input.sender_account_id,
            last_contacted_at: None,
            created_at: Utc::now(),
        };

        self.state.lock().await.recipients.push(recipient.clone());
        Ok(recipient)
    }

    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        let state = self.state.lock().await;
        Ok(state.recipients.iter().find(|r| r.id == id).cloned())
    }

    async fn list_opted_in_by_ids(&self, owner_id: AccountId, ids: &[RecipientId]) -> Result<Vec<Recipient>> {
        let state = self.state.lock().await;
        let mut found: Vec<Recipient> = state
            .recipients
            .iter()
            .filter(|r| r.owner_id == owner_id && r.opted_in && ids.contains(&r.id))
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        Ok(found)
    }

    async fn list_matching(&self, filter: &RecipientFilter) -> Result<Vec<Recipient>> {
        let state = self.state.lock().await;
        let mut found: Vec<Recipient> = state
            .recipients
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        Ok(found)
    }

    async fn touch_last_contacted(&self, id: RecipientId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(recipient) = state.recipients.iter_mut().find(|r| r.id == id) {
            recipient.last_contacted_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl SenderAccountRepository for MemoryStore {
    async fn create(
        &self,
        owner_id: AccountId,
        display_name: &str,
        external_account_id: &str,
        route_id: &str,
    ) -> Result<SenderAccount> {
        let account = SenderAccount {
            id: Uuid::now_v7(),
            owner_id,
            display_name: display_name.to_string(),
            external_account_id: external_account_id.to_string(),
            route_id: route_id.to_string(),
            created_at: Utc::now(),
        };

        self.state.lock().await.sender_accounts.push(account.clone());
        Ok(account)
    }

    async fn list_by_owner(&self, owner_id: AccountId) -> Result<Vec<SenderAccount>> {
        let state = self.state.lock().await;
        Ok(state
            .sender_accounts
            .iter()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn create(
        &self,
        owner_id: AccountId,
        name: &str,
        language: &str,
        components: Vec<TemplateComponent>,
    ) -> Result<MessageTemplate> {
        let template = MessageTemplate {
            id: Uuid::now_v7(),
            owner_id,
            name: name.to_string(),
            language: language.to_string(),
            components: Json(components),
            created_at: Utc::now(),
        };

        self.state
            .lock()
            .await
            .templates
            .insert(template.id, template.clone());
        Ok(template)
    }

    async fn get(&self, owner_id: AccountId, id: TemplateId) -> Result<Option<MessageTemplate>> {
        let state = self.state.lock().await;
        Ok(state
            .templates
            .get(&id)
            .filter(|t| t.owner_id == owner_id)
            .cloned())
    }
}

#[async_trait]
impl ThreadRepository for MemoryStore {
    async fn append_message(
        &self,
        owner_id: AccountId,
        recipient_id: RecipientId,
        message: NewThreadMessage,
    ) -> Result<ThreadMessage> {
        let mut state = self.state.lock().await;

        let thread_id = match state
            .threads
            .iter_mut()
            .find(|t| t.owner_id == owner_id && t.recipient_id == recipient_id)
        {
            Some(thread) => {
                thread.message_count += 1;
                thread.last_message_at = message.sent_at;
                thread.id
            }
            None => {
                let thread = Thread {
                    id: Uuid::now_v7(),
                    owner_id,
                    recipient_id,
                    message_count: 1,
                    created_at: message.sent_at,
                    last_message_at: message.sent_at,
                };
                let id = thread.id;
                state.threads.push(thread);
                id
            }
        };

        let entry = ThreadMessage {
            id: Uuid::now_v7(),
            thread_id,
            direction: "outbound".to_string(),
            campaign_id: message.campaign_id,
            sender_account_id: message.sender_account_id,
            gateway_message_id: message.gateway_message_id,
            body: message.body,
            created_at: message.sent_at,
        };
        state.thread_messages.push(entry.clone());
        Ok(entry)
    }

    async fn list_messages(&self, owner_id: AccountId, recipient_id: RecipientId) -> Result<Vec<ThreadMessage>> {
        let state = self.state.lock().await;
        let Some(thread) = state
            .threads
            .iter()
            .find(|t| t.owner_id == owner_id && t.recipient_id == recipient_id)
        else {
            return Ok(Vec::new());
        };

        Ok(state
            .thread_messages
            .iter()
            .filter(|m| m.thread_id == thread.id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WalletRepository for MemoryStore {
    async fn get(&self, account_id: AccountId) -> Result<Option<Wallet>> {
        Ok(self.state.lock().await.wallets.get(&account_id).cloned())
    }

    async fn credit(&self, account_id: AccountId, amount: Credits, reason: &str) -> Result<Credits> {
        if amount <= 0 {
            return Err(Error::Validation("Credit amount must be positive".to_string()));
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;
        let wallet = state.wallets.entry(account_id).or_insert_with(|| Wallet {
            account_id,
            balance: 0,
            updated_at: now,
        });
        wallet.balance += amount;
        wallet.updated_at = now;
        let balance = wallet.balance;

        state.transactions.push(WalletTransaction {
            id: Uuid::now_v7(),
            account_id,
            kind: "credit".to_string(),
            amount,
            balance_after: balance,
            reason: reason.to_string(),
            reference_id: None,
            created_at: now,
        });
        Ok(balance)
    }

    async fn debit(&self, request: DebitRequest) -> Result<DebitOutcome> {
        if request.amount <= 0 {
            return Err(Error::Validation("Debit amount must be positive".to_string()));
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;

        let already = state.transactions.iter().any(|t| {
            t.account_id == request.account_id
                && t.kind == "debit"
                && t.reference_id == Some(request.reference_id)
        });
        if already {
            return Ok(DebitOutcome::AlreadyRecorded {
                balance: state.balance(request.account_id),
            });
        }

        let current = state.balance(request.account_id);
        if current < request.amount {
            return Ok(DebitOutcome::InsufficientFunds { balance: current });
        }
        let Some(wallet) = state.wallets.get_mut(&request.account_id) else {
            return Ok(DebitOutcome::InsufficientFunds { balance: 0 });
        };
        wallet.balance -= request.amount;
        wallet.updated_at = now;
        let balance = wallet.balance;

        state.transactions.push(WalletTransaction {
            id: Uuid::now_v7(),
            account_id: request.account_id,
            kind: "debit".to_string(),
            amount: request.amount,
            balance_after: balance,
            reason: request.reason,
            reference_id: Some(request.reference_id),
            created_at: now,
        });
        Ok(DebitOutcome::Debited { balance })
    }

    async fn transactions(&self, account_id: AccountId) -> Result<Vec<WalletTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }
}
