//! Billing Ledger - Prepaid charges for campaign activation

use outreach_common::types::{AccountId, Credits};
use outreach_common::Result;
use outreach_storage::models::{Campaign, DebitOutcome, DebitRequest};
use outreach_storage::repository::WalletRepository;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of charging a campaign on activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationCharge {
    /// Campaign has no price
    NotRequired,
    Charged { amount: Credits, balance: Credits },
    /// An earlier run already charged this campaign
    AlreadyCharged { balance: Credits },
    InsufficientFunds { required: Credits, balance: Credits },
}

pub struct BillingLedger {
    wallets: Arc<dyn WalletRepository>,
}

impl BillingLedger {
    pub fn new(wallets: Arc<dyn WalletRepository>) -> Self {
        Self { wallets }
    }

    /// Debit `amount` once per `reference_id`
    pub async fn debit(
        &self,
        account_id: AccountId,
        amount: Credits,
        reason: &str,
        reference_id: Uuid,
    ) -> Result<DebitOutcome> {
        self.wallets
            .debit(DebitRequest {
                account_id,
                amount,
                reason: reason.to_string(),
                reference_id,
            })
            .await
    }

    /// Charge the campaign's price to its owner, keyed by the campaign id
    pub async fn charge_activation(&self, campaign: &Campaign) -> Result<ActivationCharge> {
        let Some(amount) = campaign.activation_cost() else {
            return Ok(ActivationCharge::NotRequired);
        };

        let reason = format!("campaign activation: {}", campaign.name);
        let outcome = self
            .debit(campaign.owner_id, amount, &reason, campaign.id)
            .await?;

        Ok(match outcome {
            DebitOutcome::Debited { balance } => {
                info!(
                    campaign_id = %campaign.id,
                    "Charged {} credits for campaign activation, balance {}", amount, balance
                );
                ActivationCharge::Charged { amount, balance }
            }
            DebitOutcome::AlreadyRecorded { balance } => {
                info!(campaign_id = %campaign.id, "Campaign activation already charged");
                ActivationCharge::AlreadyCharged { balance }
            }
            DebitOutcome::InsufficientFunds { balance } => {
                warn!(
                    campaign_id = %campaign.id,
                    "Insufficient balance for activation: required {}, available {}", amount, balance
                );
                ActivationCharge::InsufficientFunds {
                    required: amount,
                    balance,
                }
            }
        })
    }
}
