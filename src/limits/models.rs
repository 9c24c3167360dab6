use std::fmt;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Quota value meaning "no limit".
pub const UNBOUNDED: i64 = -1;

/// key: limit-keys -> allow-listed quota identifiers
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LimitKey {
    MonthlyResponses,
}

impl LimitKey {
    pub const ALL: [LimitKey; 1] = [LimitKey::MonthlyResponses];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKey::MonthlyResponses => "monthly_responses",
        }
    }

    /// Keys are validated against the allow-list, never inferred.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == value.trim())
    }

    pub fn reset_period(&self) -> ResetPeriod {
        match self {
            LimitKey::MonthlyResponses => ResetPeriod::Monthly,
        }
    }

    /// Entitlement key looked up in the plan catalog.
    pub fn entitlement_key(&self) -> &'static str {
        match self {
            LimitKey::MonthlyResponses => "casting.responses.monthly",
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResetPeriod {
    Monthly,
}

impl ResetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetPeriod::Monthly => "monthly",
        }
    }

    /// Half-open usage window `[start, end)` containing `now`.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            ResetPeriod::Monthly => {
                let start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .unwrap_or(now);
                let end = start
                    .checked_add_months(Months::new(1))
                    .unwrap_or(start);
                (start, end)
            }
        }
    }
}

/// What the plan catalog yields for a principal and key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanQuota {
    pub plan_code: String,
    pub plan_name: String,
    pub base: i64,
}

impl PlanQuota {
    pub fn free_tier(base: i64) -> Self {
        Self {
            plan_code: "free".to_string(),
            plan_name: "Free".to_string(),
            base,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.base < 0
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LimitStatus {
    pub key: LimitKey,
    pub plan_name: String,
    pub base: i64,
    pub override_total: i64,
    pub used: i64,
    pub remaining: i64,
    pub reset_period: ResetPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl LimitStatus {
    /// Effective allowance for the period, `UNBOUNDED` when the plan has no limit.
    pub fn effective_limit(&self) -> i64 {
        if self.base < 0 {
            UNBOUNDED
        } else {
            self.base.saturating_add(self.override_total)
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.base < 0
    }
}

/// `max(0, base + overrides - used)`, or `UNBOUNDED` for unbounded plans.
pub fn remaining(base: i64, override_total: i64, used: i64) -> i64 {
    if base < 0 {
        return UNBOUNDED;
    }
    base.saturating_add(override_total)
        .saturating_sub(used)
        .max(0)
}

/// key: limit-override -> append-only adjustment log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitOverride {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub limit_key: LimitKey,
    pub delta: i64,
    pub reason: String,
    pub actor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct LimitOverrideRow {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub limit_key: String,
    pub delta: i64,
    pub reason: String,
    pub actor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LimitOverrideRow> for LimitOverride {
    type Error = String;

    fn try_from(row: LimitOverrideRow) -> Result<Self, Self::Error> {
        let limit_key = LimitKey::parse(&row.limit_key)
            .ok_or_else(|| format!("unknown limit key `{}`", row.limit_key))?;
        Ok(LimitOverride {
            id: row.id,
            principal_id: row.principal_id,
            limit_key,
            delta: row.delta,
            reason: row.reason,
            actor_id: row.actor_id,
            created_at: row.created_at,
        })
    }
}

/// Structured veto carrying what a caller needs to render an upgrade prompt.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LimitExceeded {
    pub key: LimitKey,
    pub current: i64,
    pub limit: i64,
    pub plan_name: String,
    pub upgrade_hint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_rejected() {
        assert_eq!(
            LimitKey::parse("monthly_responses"),
            Some(LimitKey::MonthlyResponses)
        );
        assert_eq!(LimitKey::parse("daily_castings"), None);
        assert_eq!(LimitKey::parse(""), None);
    }

    #[test]
    fn remaining_clamps_at_zero() {
        assert_eq!(remaining(5, 0, 2), 3);
        assert_eq!(remaining(5, 2, 2), 5);
        assert_eq!(remaining(5, -3, 4), 0);
        assert_eq!(remaining(UNBOUNDED, 10, 400), UNBOUNDED);
    }

    #[test]
    fn monthly_window_spans_calendar_month() {
        let now = Utc.with_ymd_and_hms(2024, 12, 17, 15, 4, 5).unwrap();
        let (start, end) = ResetPeriod::Monthly.window(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }
}
