//! Audience Resolver - Turns a campaign audience into recipients

use super::DispatchError;
use outreach_storage::filter::RecipientFilter;
use outreach_storage::models::{AudienceSpec, Campaign, Recipient};
use outreach_storage::repository::RecipientRepository;
use std::sync::Arc;
use tracing::debug;

pub struct AudienceResolver {
    recipients: Arc<dyn RecipientRepository>,
}

impl AudienceResolver {
    pub fn new(recipients: Arc<dyn RecipientRepository>) -> Self {
        Self { recipients }
    }

    /// Opted-in recipients of the campaign owner, in stable order.
    ///
    /// An empty result is not an error.
    pub async fn resolve(&self, campaign: &Campaign) -> Result<Vec<Recipient>, DispatchError> {
        let recipients = match &campaign.audience.0 {
            AudienceSpec::Recipients { ids } => {
                self.recipients
                    .list_opted_in_by_ids(campaign.owner_id, ids)
                    .await?
            }
            AudienceSpec::Filter(expression) => {
                let filter = RecipientFilter::compile(campaign.owner_id, expression)?;
                self.recipients.list_matching(&filter).await?
            }
        };

        debug!(
            campaign_id = %campaign.id,
            "Resolved audience of {} recipients", recipients.len()
        );
        Ok(recipients)
    }
}
