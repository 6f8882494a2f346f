//! Subscription facts derived from a profile's end date.
//!
//! These are pure functions of the end date and the current time. Nothing
//! here is cached, so results are always consistent with the latest profile.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A subscription ending within this many days is reported as expiring soon.
pub const EXPIRING_SOON_DAYS: u32 = 14;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    ExpiringSoon,
    Expired,
    Inactive,
}

impl SubscriptionStatus {
    /// Both `Active` and `ExpiringSoon` still grant access.
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::ExpiringSoon)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::ExpiringSoon => "expiring_soon",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whole days left, rounded up. Zero once the end date has passed.
pub fn remaining_days(end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u32 {
    let Some(end) = end else {
        return 0;
    };
    let seconds = (end - now).num_seconds();
    if seconds <= 0 {
        return 0;
    }
    // Ceiling division; `seconds` is positive here
    let days = (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;
    u32::try_from(days).unwrap_or(u32::MAX)
}

pub fn status(end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> SubscriptionStatus {
    match end {
        None => SubscriptionStatus::Inactive,
        Some(end) if end <= now => SubscriptionStatus::Expired,
        Some(_) if remaining_days(end, now) <= EXPIRING_SOON_DAYS => SubscriptionStatus::ExpiringSoon,
        Some(_) => SubscriptionStatus::Active,
    }
}
