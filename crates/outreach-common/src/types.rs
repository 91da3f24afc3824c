//! Common types for Outreach

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Unique identifier for owning accounts (wallet holders)
pub type AccountId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for recipients (contacts)
pub type RecipientId = Uuid;

/// Unique identifier for sender accounts
pub type SenderAccountId = Uuid;

/// Unique identifier for message templates
pub type TemplateId = Uuid;

/// Unique identifier for conversation threads
pub type ThreadId = Uuid;

/// Unique identifier for ledger transactions
pub type TransactionId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Amount of prepaid credits, in the smallest billable unit
pub type Credits = i64;
