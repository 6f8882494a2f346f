use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::subscription::{self, SubscriptionStatus};

/// Profile of the signed-in user as returned by the profile endpoint.
///
/// Only the fields the session layer reasons about are typed; everything else
/// the server sends is kept in `extra` so the presentation layer can read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(
        rename = "subscriptionEndDate",
        default,
        deserialize_with = "flexible_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub subscription_end_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.email.clone())
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| "unknown user".to_string())
    }

    pub fn subscription_status_at(&self, now: DateTime<Utc>) -> SubscriptionStatus {
        subscription::status(self.subscription_end_date, now)
    }

    pub fn remaining_subscription_days_at(&self, now: DateTime<Utc>) -> u32 {
        subscription::remaining_days(self.subscription_end_date, now)
    }

    pub fn subscription_status(&self) -> SubscriptionStatus {
        self.subscription_status_at(Utc::now())
    }

    pub fn remaining_subscription_days(&self) -> u32 {
        self.remaining_subscription_days_at(Utc::now())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates (midnight UTC).
/// Anything else is treated as absent.
fn flexible_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    Ok(NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc()))
}
