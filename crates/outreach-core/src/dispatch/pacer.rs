//! Send pacing
//!
//! Keeps gateway calls at least `spacing` apart. The first call goes
//! through immediately; a zero spacing disables pacing.

use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

pub struct Pacer {
    ticker: Option<Interval>,
}

impl Pacer {
    /// Must be created inside a Tokio runtime
    pub fn new(spacing: Duration) -> Self {
        if spacing.is_zero() {
            return Self { ticker: None };
        }

        let mut ticker = interval(spacing);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker: Some(ticker),
        }
    }

    /// Wait until the next send is allowed
    pub async fn ready(&mut self) {
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.tick().await;
        }
    }
}
