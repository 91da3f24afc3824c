//! Shared fixtures for dispatch tests

use super::{DispatchSettings, Dispatcher};
use crate::gateway::{GatewayError, GatewayReceipt, MessagingGateway, OutboundMessage};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use outreach_common::types::{AccountId, CampaignId, SenderAccountId};
use outreach_storage::memory::MemoryStore;
use outreach_storage::models::{
    AudienceSpec, Campaign, CampaignProgress, CampaignStatus, CampaignType, CreateRecipient,
    MessageSpec, Pricing, Recipient, RetryConfig, Schedule, SenderAccount,
};
use outreach_storage::repository::{
    CampaignRepository, RecipientRepository, Repositories, SenderAccountRepository,
};
use outreach_storage::Json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub fn test_settings() -> DispatchSettings {
    DispatchSettings {
        batch_size: 50,
        retry_batch_size: 10,
        send_interval: std::time::Duration::ZERO,
        grace_period: Duration::zero(),
        guard_lease: Duration::minutes(15),
        send_timeout: std::time::Duration::from_secs(5),
    }
}

/// Builds campaigns directly, bypassing the create path
pub struct CampaignBuilder {
    campaign: Campaign,
}

impl CampaignBuilder {
    pub fn new(owner_id: AccountId) -> Self {
        let created_at = Utc::now() - Duration::hours(1);
        Self {
            campaign: Campaign {
                id: Uuid::now_v7(),
                owner_id,
                name: "Spring sale".to_string(),
                campaign_type: CampaignType::OneTime.to_string(),
                status: CampaignStatus::Active.to_string(),
                message: Json(MessageSpec::Text {
                    body: "Spring sale starts today".to_string(),
                }),
                audience: Json(AudienceSpec::Recipients { ids: Vec::new() }),
                schedule: None,
                retry: Json(RetryConfig::default()),
                pricing: None,
                sender_account_id: None,
                progress: Json(CampaignProgress::default()),
                processing: false,
                processing_started_at: None,
                failure_reason: None,
                created_at,
                updated_at: created_at,
                activated_at: None,
                completed_at: None,
                failed_at: None,
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.campaign.name = name.to_string();
        self
    }

    pub fn ongoing(mut self) -> Self {
        self.campaign.campaign_type = CampaignType::Ongoing.to_string();
        self
    }

    pub fn status(mut self, status: CampaignStatus) -> Self {
        self.campaign.status = status.to_string();
        self
    }

    pub fn message(mut self, message: MessageSpec) -> Self {
        self.campaign.message = Json(message);
        self
    }

    pub fn audience(mut self, audience: AudienceSpec) -> Self {
        self.campaign.audience = Json(audience);
        self
    }

    pub fn recipients(self, recipients: &[Recipient]) -> Self {
        self.audience(AudienceSpec::Recipients {
            ids: recipients.iter().map(|r| r.id).collect(),
        })
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.campaign.schedule = Some(Json(schedule));
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.campaign.retry = Json(retry);
        self
    }

    pub fn pricing(mut self, pricing: Pricing) -> Self {
        self.campaign.pricing = Some(Json(pricing));
        self
    }

    pub fn sender_account(mut self, id: SenderAccountId) -> Self {
        self.campaign.sender_account_id = Some(id);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.campaign.created_at = at;
        self.campaign.updated_at = at;
        self
    }

    pub fn progress(mut self, progress: CampaignProgress) -> Self {
        self.campaign.progress = Json(progress);
        self
    }

    pub fn guarded_since(mut self, at: DateTime<Utc>) -> Self {
        self.campaign.processing = true;
        self.campaign.processing_started_at = Some(at);
        self
    }

    pub fn build(self) -> Campaign {
        self.campaign
    }
}

pub async fn add_recipient(store: &MemoryStore, owner_id: AccountId, phone: &str, opted_in: bool) -> Recipient {
    RecipientRepository::create(
        store,
        CreateRecipient {
            owner_id,
            phone: phone.to_string(),
            opted_in,
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

/// One call seen by [`FakeGateway`]
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub to: String,
    pub route_id: String,
    pub message: OutboundMessage,
}

/// Gateway double: records every call and rejects configured numbers
#[derive(Default)]
pub struct FakeGateway {
    calls: Mutex<Vec<SentRecord>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<std::time::Duration>>,
    counter: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, phone: &str) {
        self.failing.lock().unwrap().insert(phone.to_string());
    }

    pub fn recover(&self, phone: &str) {
        self.failing.lock().unwrap().remove(phone);
    }

    pub fn respond_after(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<SentRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, phone: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.to == phone).count()
    }
}

#[async_trait]
impl MessagingGateway for FakeGateway {
    async fn send(
        &self,
        to: &str,
        route_id: &str,
        message: &OutboundMessage,
    ) -> Result<GatewayReceipt, GatewayError> {
        self.calls.lock().unwrap().push(SentRecord {
            to: to.to_string(),
            route_id: route_id.to_string(),
            message: message.clone(),
        });

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(to) {
            return Err(GatewayError::Rejected {
                status: 400,
                reason: "number is not registered".to_string(),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayReceipt {
            message_id: format!("wamid.{}", n),
        })
    }
}

/// Memory store, fake gateway, one owner with one sender account
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub dispatcher: Dispatcher,
    pub owner: AccountId,
    pub account: SenderAccount,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: DispatchSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = FakeGateway::new();
        let owner = Uuid::new_v4();
        let account = SenderAccountRepository::create(store.as_ref(), owner, "Main line", "waba-1", "route-1")
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(
            Repositories::memory(store.as_ref().clone()),
            gateway.clone(),
            settings,
        );

        Self {
            store,
            gateway,
            dispatcher,
            owner,
            account,
        }
    }

    pub async fn recipients(&self, count: usize) -> Vec<Recipient> {
        let mut recipients = Vec::with_capacity(count);
        for i in 0..count {
            recipients.push(add_recipient(&self.store, self.owner, &format!("1555{:07}", i), true).await);
        }
        recipients
    }

    pub async fn insert(&self, campaign: Campaign) -> CampaignId {
        let id = campaign.id;
        self.store.put_campaign(campaign).await;
        id
    }

    pub async fn campaign(&self, id: CampaignId) -> Campaign {
        CampaignRepository::get(self.store.as_ref(), id)
            .await
            .unwrap()
            .unwrap()
    }
}
