use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CastingStatus {
    Draft,
    Active,
    Closed,
}

impl CastingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CastingStatus::Draft => "draft",
            CastingStatus::Active => "active",
            CastingStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(CastingStatus::Draft),
            "active" => Some(CastingStatus::Active),
            "closed" => Some(CastingStatus::Closed),
            _ => None,
        }
    }
}

/// key: casting-model -> capacity-bearing aggregate
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Casting {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub status: CastingStatus,
    /// `None` means unbounded.
    pub required_headcount: Option<i32>,
    pub accepted_count: i32,
    pub requirements: CastingRequirements,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Casting {
    pub fn new(owner_id: Uuid, title: impl Into<String>, required_headcount: Option<i32>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            title: title.into(),
            status: CastingStatus::Active,
            required_headcount,
            accepted_count: 0,
            requirements: CastingRequirements::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_requirements(mut self, requirements: CastingRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Guard of the accepted-count increment.
    pub fn has_capacity(&self) -> bool {
        if self.status == CastingStatus::Closed {
            return false;
        }
        match self.required_headcount {
            Some(required) => self.accepted_count < required,
            None => true,
        }
    }

    /// Applies one guarded acceptance, closing the casting when it fills up.
    /// Returns `false` without touching `self` when the guard fails.
    pub fn record_acceptance(&mut self, now: DateTime<Utc>) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.accepted_count += 1;
        if let Some(required) = self.required_headcount {
            if self.accepted_count >= required {
                self.status = CastingStatus::Closed;
            }
        }
        self.updated_at = now;
        true
    }
}

/// Eligibility restrictions checked before anything is billed.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CastingRequirements {
    pub min_age: Option<i32>,
    pub max_age: Option<i32>,
    pub gender: Option<String>,
    pub city: Option<String>,
    pub application_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
pub(crate) struct CastingRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub status: String,
    pub required_headcount: Option<i32>,
    pub accepted_count: i32,
    pub min_age: Option<i32>,
    pub max_age: Option<i32>,
    pub gender: Option<String>,
    pub city: Option<String>,
    pub application_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<CastingRow> for Casting {
    type Error = String;

    fn try_from(row: CastingRow) -> Result<Self, Self::Error> {
        let status = CastingStatus::parse(&row.status)
            .ok_or_else(|| format!("unknown casting status `{}`", row.status))?;
        Ok(Casting {
            id: row.id,
            owner_id: row.owner_id,
            title: row.title,
            status,
            required_headcount: row.required_headcount,
            accepted_count: row.accepted_count,
            requirements: CastingRequirements {
                min_age: row.min_age,
                max_age: row.max_age,
                gender: row.gender,
                city: row.city,
                application_deadline: row.application_deadline,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// key: response-status -> ordered lifecycle with an explicit transition table
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Pending,
    Viewed,
    Shortlisted,
    Accepted,
    Rejected,
}

impl ResponseStatus {
    pub const ALL: [ResponseStatus; 5] = [
        ResponseStatus::Pending,
        ResponseStatus::Viewed,
        ResponseStatus::Shortlisted,
        ResponseStatus::Accepted,
        ResponseStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Pending => "pending",
            ResponseStatus::Viewed => "viewed",
            ResponseStatus::Shortlisted => "shortlisted",
            ResponseStatus::Accepted => "accepted",
            ResponseStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value.trim())
    }

    /// The single source of truth for status writes.
    pub fn allowed_transitions(&self) -> &'static [ResponseStatus] {
        use ResponseStatus::*;
        match self {
            Pending => &[Viewed, Shortlisted, Accepted, Rejected],
            Viewed => &[Shortlisted, Accepted, Rejected],
            Shortlisted => &[Accepted, Rejected],
            Accepted | Rejected => &[],
        }
    }

    pub fn can_transition_to(&self, next: ResponseStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

/// key: casting-response -> the business record gated by billing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub id: Uuid,
    pub casting_id: Uuid,
    pub applicant_id: Uuid,
    pub status: ResponseStatus,
    pub cover_letter: Option<String>,
    /// Units taken from the credit ledger when the quota did not cover it.
    pub charged_amount: i64,
    /// Status the response left when it was rejected.
    pub rejected_from: Option<ResponseStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Response {
    pub fn pending(
        id: Uuid,
        casting_id: Uuid,
        applicant_id: Uuid,
        cover_letter: Option<String>,
        charged_amount: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            casting_id,
            applicant_id,
            status: ResponseStatus::Pending,
            cover_letter,
            charged_amount,
            rejected_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Writes `status`, remembering where a rejection came from.
    pub fn move_to(&mut self, status: ResponseStatus, now: DateTime<Utc>) {
        if status == ResponseStatus::Rejected {
            self.rejected_from = Some(self.status);
        }
        self.status = status;
        self.updated_at = now;
    }

    /// Only a rejection straight out of `pending` returns the charge.
    pub fn refund_owed(&self) -> bool {
        self.status == ResponseStatus::Rejected
            && self.rejected_from == Some(ResponseStatus::Pending)
            && self.charged_amount > 0
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ResponseRow {
    pub id: Uuid,
    pub casting_id: Uuid,
    pub applicant_id: Uuid,
    pub status: String,
    pub cover_letter: Option<String>,
    pub charged_amount: i64,
    pub rejected_from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ResponseRow> for Response {
    type Error = String;

    fn try_from(row: ResponseRow) -> Result<Self, Self::Error> {
        let status = ResponseStatus::parse(&row.status)
            .ok_or_else(|| format!("unknown response status `{}`", row.status))?;
        let rejected_from = row
            .rejected_from
            .map(|raw| {
                ResponseStatus::parse(&raw)
                    .ok_or_else(|| format!("unknown response status `{raw}`"))
            })
            .transpose()?;
        Ok(Response {
            id: row.id,
            casting_id: row.casting_id,
            applicant_id: row.applicant_id,
            status,
            cover_letter: row.cover_letter,
            charged_amount: row.charged_amount,
            rejected_from,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Profile attributes consulted by eligibility checks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct ApplicantProfile {
    pub principal_id: Uuid,
    pub display_name: String,
    pub age: Option<i32>,
    pub gender: Option<String>,
    pub city: Option<String>,
}
