//! Database models

use chrono::{DateTime, NaiveDateTime, Utc};
use outreach_common::types::{
    AccountId, CampaignId, Credits, RecipientId, SenderAccountId, TemplateId, ThreadId,
    TransactionId,
};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;

use crate::filter::FilterExpression;

// ============================================================================
// Campaigns
// ============================================================================

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Active,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Active => write!(f, "active"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Campaign type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    /// Sent once to the resolved audience, then completed
    OneTime,
    /// Stays active and picks up newly matching recipients on later runs
    Ongoing,
}

impl std::fmt::Display for CampaignType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignType::OneTime => write!(f, "one_time"),
            CampaignType::Ongoing => write!(f, "ongoing"),
        }
    }
}

impl std::str::FromStr for CampaignType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(CampaignType::OneTime),
            "ongoing" => Ok(CampaignType::Ongoing),
            _ => Err(format!("Invalid campaign type: {}", s)),
        }
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner_id: AccountId,
    pub name: String,
    pub campaign_type: String,
    pub status: String,
    pub message: Json<MessageSpec>,
    pub audience: Json<AudienceSpec>,
    pub schedule: Option<Json<Schedule>>,
    pub retry: Json<RetryConfig>,
    pub pricing: Option<Json<Pricing>>,
    /// Sender account used for recipients without an affiliation
    pub sender_account_id: Option<SenderAccountId>,
    pub progress: Json<CampaignProgress>,
    /// Processing guard; see `processing_started_at` for its lease start
    pub processing: bool,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Get status as enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// Get campaign type as enum
    pub fn type_enum(&self) -> Option<CampaignType> {
        self.campaign_type.parse().ok()
    }

    pub fn is_ongoing(&self) -> bool {
        self.type_enum() == Some(CampaignType::Ongoing)
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref().map(|s| &s.0)
    }

    /// Cost to charge on activation, if the campaign is priced
    pub fn activation_cost(&self) -> Option<Credits> {
        self.pricing
            .as_ref()
            .map(|p| p.0.total_cost)
            .filter(|cost| *cost > 0)
    }
}

/// What a campaign sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSpec {
    /// Pre-approved gateway template with variable bindings
    Template {
        template_id: TemplateId,
        #[serde(default)]
        variables: Vec<VariableBinding>,
    },
    /// Free-text body sent verbatim
    Text { body: String },
}

/// A template variable binding. `key` is either a position ("1") or a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableBinding {
    pub key: String,
    pub value: BindingValue,
}

impl VariableBinding {
    pub fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: BindingValue::Static {
                value: value.into(),
            },
        }
    }

    pub fn field(key: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: BindingValue::Field {
                field: field.into(),
            },
        }
    }
}

/// Where a bound value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum BindingValue {
    Static { value: String },
    /// Recipient field such as `name`, `phone`, `email` or `custom.<key>`
    Field { field: String },
}

/// Who a campaign targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudienceSpec {
    Recipients { ids: Vec<RecipientId> },
    Filter(FilterExpression),
}

/// Scheduled send time, expressed as wall-clock time in `timezone`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub send_at: NaiveDateTime,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of retries after the initial attempt
    #[serde(default)]
    pub count: u32,
    #[serde(default = "default_interval_days")]
    pub interval_days: u32,
    /// When set, the first retry happens exactly at this instant
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 0,
            interval_days: default_interval_days(),
            start_date: None,
        }
    }
}

fn default_interval_days() -> u32 {
    1
}

/// Prepaid pricing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub total_cost: Credits,
}

/// Create campaign input
#[derive(Debug, Clone)]
pub struct CreateCampaign {
    pub owner_id: AccountId,
    pub name: String,
    pub campaign_type: CampaignType,
    pub status: CampaignStatus,
    pub message: MessageSpec,
    pub audience: AudienceSpec,
    pub schedule: Option<Schedule>,
    pub retry: RetryConfig,
    pub pricing: Option<Pricing>,
    pub sender_account_id: Option<SenderAccountId>,
}

// ============================================================================
// Campaign progress and delivery attempts
// ============================================================================

/// Persisted progress of a campaign between dispatcher runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignProgress {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub delivered: u64,
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub attempts: AttemptLog,
    /// Audience position the next run resumes from
    #[serde(default)]
    pub next_index: Option<usize>,
    #[serde(default)]
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl CampaignProgress {
    /// Recompute `sent`/`failed` from the attempt log.
    ///
    /// `delivered` and `read` come from gateway status callbacks and are left alone.
    pub fn recount(&mut self) {
        self.sent = self.attempts.count_with(DeliveryStatus::Sent) as u64;
        self.failed = self.attempts.count_with(DeliveryStatus::Failed) as u64;
    }
}

/// Outcome of the latest attempt for one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// Per-recipient delivery record, mutated in place on retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub recipient_id: RecipientId,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Anchor for retry backoff
    #[serde(default)]
    pub first_failed_at: Option<DateTime<Utc>>,
    pub attempted_at: DateTime<Utc>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries_reached: bool,
    #[serde(default)]
    pub sender_account_id: Option<SenderAccountId>,
    #[serde(default)]
    pub rendered_text: Option<String>,
}

impl DeliveryAttempt {
    pub fn sent(recipient_id: RecipientId, message_id: String, at: DateTime<Utc>) -> Self {
        Self {
            recipient_id,
            status: DeliveryStatus::Sent,
            message_id: Some(message_id),
            error: None,
            retry_count: 0,
            first_failed_at: None,
            attempted_at: at,
            next_retry_at: None,
            max_retries_reached: false,
            sender_account_id: None,
            rendered_text: None,
        }
    }

    pub fn failed(recipient_id: RecipientId, error: String, at: DateTime<Utc>) -> Self {
        Self {
            recipient_id,
            status: DeliveryStatus::Failed,
            message_id: None,
            error: Some(error),
            retry_count: 0,
            first_failed_at: Some(at),
            attempted_at: at,
            next_retry_at: None,
            max_retries_reached: false,
            sender_account_id: None,
            rendered_text: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == DeliveryStatus::Failed
    }
}

/// Ordered attempt history with a recipient-keyed index.
///
/// Serialized as a plain JSON array; the index is rebuilt on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<DeliveryAttempt>", into = "Vec<DeliveryAttempt>")]
pub struct AttemptLog {
    entries: Vec<DeliveryAttempt>,
    index: HashMap<RecipientId, usize>,
}

impl AttemptLog {
    pub fn get(&self, recipient_id: &RecipientId) -> Option<&DeliveryAttempt> {
        self.index.get(recipient_id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, recipient_id: &RecipientId) -> bool {
        self.index.contains_key(recipient_id)
    }

    /// Insert a new record, or overwrite the existing one for the same recipient
    /// while keeping its position in the log.
    pub fn upsert(&mut self, attempt: DeliveryAttempt) {
        match self.index.get(&attempt.recipient_id) {
            Some(&i) => self.entries[i] = attempt,
            None => {
                self.index.insert(attempt.recipient_id, self.entries.len());
                self.entries.push(attempt);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeliveryAttempt> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_with(&self, status: DeliveryStatus) -> usize {
        self.entries.iter().filter(|a| a.status == status).count()
    }
}

impl From<Vec<DeliveryAttempt>> for AttemptLog {
    fn from(attempts: Vec<DeliveryAttempt>) -> Self {
        let mut log = AttemptLog::default();
        for attempt in attempts {
            log.upsert(attempt);
        }
        log
    }
}

impl From<AttemptLog> for Vec<DeliveryAttempt> {
    fn from(log: AttemptLog) -> Self {
        log.entries
    }
}

// ============================================================================
// Recipients
// ============================================================================

/// Recipient (contact) model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub owner_id: AccountId,
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub opted_in: bool,
    pub tags: Vec<String>,
    pub custom_fields: serde_json::Value,
    pub sender_account_id: Option<SenderAccountId>,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Recipient {
    pub fn custom_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.custom_fields.get(key).filter(|v| !v.is_null())
    }

    /// Custom field rendered as text, if present and non-empty
    pub fn custom_field_text(&self, key: &str) -> Option<String> {
        self.custom_field(key)
            .map(value_to_text)
            .filter(|s| !s.is_empty())
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter()
            .any(|wanted| self.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)))
    }
}

/// Flatten a JSON scalar into the text used for rendering and comparisons
pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Create recipient input
#[derive(Debug, Clone, Default)]
pub struct CreateRecipient {
    pub owner_id: AccountId,
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub opted_in: bool,
    pub tags: Vec<String>,
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
    pub sender_account_id: Option<SenderAccountId>,
}

// ============================================================================
// Sender accounts and templates
// ============================================================================

/// A gateway sender identity owned by an account
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SenderAccount {
    pub id: SenderAccountId,
    pub owner_id: AccountId,
    pub display_name: String,
    /// Business account id at the gateway
    pub external_account_id: String,
    /// Routing id (phone number id) the gateway addresses sends by
    pub route_id: String,
    pub created_at: DateTime<Utc>,
}

/// Message template model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: TemplateId,
    pub owner_id: AccountId,
    /// Template name as registered with the gateway
    pub name: String,
    pub language: String,
    pub components: Json<Vec<TemplateComponent>>,
    pub created_at: DateTime<Utc>,
}

/// Structural piece of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateComponent {
    Header(HeaderComponent),
    Body { text: String },
    Footer { text: String },
    Buttons { buttons: Vec<TemplateButton> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderComponent {
    pub format: HeaderFormat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFormat {
    Text,
    Image,
    Video,
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateButton {
    pub kind: ButtonKind,
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonKind {
    QuickReply,
    Url,
    PhoneNumber,
}

// ============================================================================
// Conversation threads
// ============================================================================

/// Conversation thread with one recipient
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub owner_id: AccountId,
    pub recipient_id: RecipientId,
    pub message_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

/// Entry in a conversation thread
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: uuid::Uuid,
    pub thread_id: ThreadId,
    pub direction: String,
    pub campaign_id: Option<CampaignId>,
    pub sender_account_id: Option<SenderAccountId>,
    pub gateway_message_id: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Outbound message to append to a thread
#[derive(Debug, Clone)]
pub struct NewThreadMessage {
    pub campaign_id: Option<CampaignId>,
    pub sender_account_id: Option<SenderAccountId>,
    pub gateway_message_id: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

// ============================================================================
// Wallets
// ============================================================================

/// Prepaid balance of an owning account
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub account_id: AccountId,
    pub balance: Credits,
    pub updated_at: DateTime<Utc>,
}

/// Ledger entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub kind: String,
    pub amount: Credits,
    pub balance_after: Credits,
    pub reason: String,
    pub reference_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Debit request
#[derive(Debug, Clone)]
pub struct DebitRequest {
    pub account_id: AccountId,
    pub amount: Credits,
    pub reason: String,
    /// Debits are idempotent per reference id
    pub reference_id: uuid::Uuid,
}

/// Debit outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    Debited { balance: Credits },
    /// A debit with the same reference already exists; nothing was charged
    AlreadyRecorded { balance: Credits },
    InsufficientFunds { balance: Credits },
}
