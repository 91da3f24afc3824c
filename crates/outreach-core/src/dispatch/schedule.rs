//! Schedule gate for scheduled campaigns
//!
//! Send times are wall-clock times in a named zone. Zones map to fixed UTC
//! offsets; daylight saving time is not applied.

use chrono::{DateTime, Duration, TimeZone, Utc};
use outreach_storage::models::Schedule;

/// Zone name to offset from UTC in minutes
const ZONE_OFFSETS: &[(&str, i32)] = &[
    ("UTC", 0),
    ("GMT", 0),
    ("Etc/UTC", 0),
    ("Europe/London", 0),
    ("Europe/Lisbon", 0),
    ("Africa/Lagos", 60),
    ("Europe/Paris", 60),
    ("Europe/Berlin", 60),
    ("Europe/Madrid", 60),
    ("Europe/Rome", 60),
    ("Africa/Cairo", 120),
    ("Africa/Johannesburg", 120),
    ("Europe/Athens", 120),
    ("Africa/Nairobi", 180),
    ("Asia/Riyadh", 180),
    ("Europe/Istanbul", 180),
    ("Europe/Moscow", 180),
    ("Asia/Dubai", 240),
    ("Asia/Karachi", 300),
    ("Asia/Kolkata", 330),
    ("Asia/Calcutta", 330),
    ("IST", 330),
    ("Asia/Kathmandu", 345),
    ("Asia/Dhaka", 360),
    ("Asia/Bangkok", 420),
    ("Asia/Jakarta", 420),
    ("Asia/Singapore", 480),
    ("Asia/Shanghai", 480),
    ("Asia/Hong_Kong", 480),
    ("Asia/Manila", 480),
    ("Asia/Tokyo", 540),
    ("Asia/Seoul", 540),
    ("Australia/Sydney", 600),
    ("Pacific/Auckland", 720),
    ("America/Sao_Paulo", -180),
    ("America/New_York", -300),
    ("America/Toronto", -300),
    ("America/Chicago", -360),
    ("America/Mexico_City", -360),
    ("America/Denver", -420),
    ("America/Los_Angeles", -480),
];

/// Fixed offset for `zone`; unknown zones are treated as UTC
pub fn timezone_offset_minutes(zone: &str) -> i32 {
    let zone = zone.trim();
    ZONE_OFFSETS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(zone))
        .map(|(_, offset)| *offset)
        .unwrap_or(0)
}

/// UTC instant the schedule opens at
pub fn due_at(schedule: &Schedule) -> DateTime<Utc> {
    let offset = Duration::minutes(i64::from(timezone_offset_minutes(&schedule.timezone)));
    Utc.from_utc_datetime(&(schedule.send_at - offset))
}

/// No schedule means always due
pub fn is_due(schedule: Option<&Schedule>, now: DateTime<Utc>) -> bool {
    schedule.map_or(true, |s| due_at(s) <= now)
}

/// Time left before the gate opens, if it is still closed
pub fn time_remaining(schedule: Option<&Schedule>, now: DateTime<Utc>) -> Option<Duration> {
    let remaining = due_at(schedule?) - now;
    (remaining > Duration::zero()).then_some(remaining)
}

/// Short human form used in run summaries, e.g. `1d 2h 5m`
pub fn format_remaining(remaining: Duration) -> String {
    let total_minutes = (remaining.num_seconds() + 59) / 60;
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes % (24 * 60)) / 60;
    let minutes = total_minutes % 60;

    match (days, hours) {
        (0, 0) => format!("{}m", minutes),
        (0, _) => format!("{}h {}m", hours, minutes),
        _ => format!("{}d {}h {}m", days, hours, minutes),
    }
}
