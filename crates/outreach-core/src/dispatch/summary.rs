//! Run summaries returned by the trigger surface

use chrono::{DateTime, Utc};
use outreach_common::types::CampaignId;
use outreach_storage::models::Campaign;
use serde::{Deserialize, Serialize};

/// Outcome of one dispatcher invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Campaigns that needed attention this run
    pub found: usize,
    /// Campaigns that sent or retried at least one batch
    pub processed: usize,
    pub campaigns: Vec<CampaignOutcome>,
}

impl DispatchSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            found: 0,
            processed: 0,
            campaigns: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: CampaignOutcome) {
        self.found += 1;
        if outcome.processed {
            self.processed += 1;
        }
        self.campaigns.push(outcome);
    }

    pub fn outcome(&self, id: CampaignId) -> Option<&CampaignOutcome> {
        self.campaigns.iter().find(|c| c.id == id)
    }
}

/// Per-campaign line of a [`DispatchSummary`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignOutcome {
    pub id: CampaignId,
    pub name: String,
    pub processed: bool,
    /// Successful sends in this run
    pub sent: u64,
    /// Failed sends in this run
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CampaignOutcome {
    pub fn processed(campaign: &Campaign, sent: u64, failed: u64, note: impl Into<String>) -> Self {
        Self {
            id: campaign.id,
            name: campaign.name.clone(),
            processed: true,
            sent,
            failed,
            note: Some(note.into()),
            error: None,
        }
    }

    /// Nothing was sent: still waiting on a schedule, or another run owns it
    pub fn skipped(campaign: &Campaign, note: impl Into<String>) -> Self {
        Self {
            id: campaign.id,
            name: campaign.name.clone(),
            processed: false,
            sent: 0,
            failed: 0,
            note: Some(note.into()),
            error: None,
        }
    }

    pub fn failed(id: CampaignId, name: String, error: impl Into<String>) -> Self {
        Self {
            id,
            name,
            processed: false,
            sent: 0,
            failed: 0,
            note: None,
            error: Some(error.into()),
        }
    }

    /// Metrics label
    pub fn label(&self) -> &'static str {
        if self.error.is_some() {
            "failed"
        } else if self.processed {
            "processed"
        } else {
            "skipped"
        }
    }

    /// Prefix the note, e.g. with an activation message
    pub fn with_leading_note(mut self, leading: &str) -> Self {
        self.note = Some(match self.note.take() {
            Some(note) => format!("{}; {}", leading, note),
            None => leading.to_string(),
        });
        self
    }
}
