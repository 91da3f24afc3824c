//! Retry policy for failed deliveries
//!
//! Backoff is linear: retry `k` (0-indexed) is due `interval_days * (k + 1)`
//! days after the first failure. A configured start date replaces the
//! anchor, with the first retry due exactly at that date.

use chrono::{DateTime, Duration, Utc};
use outreach_storage::models::{DeliveryAttempt, DeliveryStatus, RetryConfig};

/// When retry number `retry_count` becomes due
pub fn next_retry_time(
    retry_count: u32,
    interval_days: u32,
    anchor: DateTime<Utc>,
    start_override: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let interval = i64::from(interval_days);
    match start_override {
        Some(start) => start + Duration::days(interval * i64::from(retry_count)),
        None => anchor + Duration::days(interval * (i64::from(retry_count) + 1)),
    }
}

/// Applies a campaign's [`RetryConfig`] to delivery records.
///
/// Evaluation never mutates; the `on_*` methods return the updated record
/// for the dispatcher to store.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn is_eligible(&self, attempt: &DeliveryAttempt, now: DateTime<Utc>) -> bool {
        self.config.enabled
            && attempt.is_failed()
            && !attempt.max_retries_reached
            && attempt.retry_count < self.config.count
            && attempt.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Record produced by a failed first send
    pub fn on_first_failure(&self, mut attempt: DeliveryAttempt) -> DeliveryAttempt {
        self.schedule(&mut attempt);
        attempt
    }

    pub fn on_retry_failure(
        &self,
        previous: &DeliveryAttempt,
        error: String,
        now: DateTime<Utc>,
    ) -> DeliveryAttempt {
        let mut attempt = previous.clone();
        attempt.status = DeliveryStatus::Failed;
        attempt.message_id = None;
        attempt.error = Some(error);
        attempt.retry_count += 1;
        attempt.first_failed_at = previous.first_failed_at.or(Some(previous.attempted_at));
        attempt.attempted_at = now;
        self.schedule(&mut attempt);
        attempt
    }

    pub fn on_retry_success(
        &self,
        previous: &DeliveryAttempt,
        message_id: String,
        now: DateTime<Utc>,
    ) -> DeliveryAttempt {
        let mut attempt = previous.clone();
        attempt.status = DeliveryStatus::Sent;
        attempt.message_id = Some(message_id);
        attempt.error = None;
        attempt.attempted_at = now;
        attempt.next_retry_at = None;
        attempt.max_retries_reached = false;
        attempt
    }

    /// Stop retrying a recipient that can no longer be sent to
    pub fn give_up(&self, previous: &DeliveryAttempt, reason: &str, now: DateTime<Utc>) -> DeliveryAttempt {
        let mut attempt = previous.clone();
        attempt.error = Some(reason.to_string());
        attempt.attempted_at = now;
        attempt.next_retry_at = None;
        attempt.max_retries_reached = true;
        attempt
    }

    fn schedule(&self, attempt: &mut DeliveryAttempt) {
        if !self.config.enabled || attempt.retry_count >= self.config.count {
            attempt.next_retry_at = None;
            attempt.max_retries_reached = true;
            return;
        }

        let anchor = attempt.first_failed_at.unwrap_or(attempt.attempted_at);
        attempt.next_retry_at = Some(next_retry_time(
            attempt.retry_count,
            self.config.interval_days,
            anchor,
            self.config.start_date,
        ));
        attempt.max_retries_reached = false;
    }
}
