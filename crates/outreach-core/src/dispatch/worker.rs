//! Dispatch Worker - Invokes the dispatcher on a fixed interval

use super::Dispatcher;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Periodic trigger for [`Dispatcher::run`]
pub struct DispatchWorker {
    dispatcher: Arc<Dispatcher>,
    /// Interval between runs (seconds)
    poll_interval_secs: u64,
    shutdown: CancellationToken,
}

impl DispatchWorker {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            poll_interval_secs: 60,
            shutdown: CancellationToken::new(),
        }
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs.max(1);
        self
    }

    /// Stop the loop when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run until shutdown. A run in progress is finished before stopping.
    pub async fn run(&self) {
        let mut ticker = interval(Duration::from_secs(self.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Dispatch worker started (interval: {}s)", self.poll_interval_secs);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.dispatcher.run().await {
                Ok(summary) if summary.found > 0 => {
                    for outcome in summary.campaigns.iter().filter(|c| c.error.is_some()) {
                        error!(
                            campaign_id = %outcome.id,
                            "Campaign {} failed: {}",
                            outcome.name,
                            outcome.error.as_deref().unwrap_or_default()
                        );
                    }
                }
                Ok(_) => debug!("Dispatch run found nothing to do"),
                Err(e) => error!("Dispatch run failed: {}", e),
            }
        }

        info!("Dispatch worker stopped");
    }
}
