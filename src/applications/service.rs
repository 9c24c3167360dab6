use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{ApplicantProfile, Casting, CastingRequirements, CastingStatus, Response};
use super::profiles::ProfileDirectory;
use crate::identity::Identity;
use crate::ledger::{Ledger, LedgerError, RelatedEntity};
use crate::limits::{LimitError, LimitEvaluator, LimitExceeded, LimitKey};
use crate::notifications::{Notification, NotificationDispatcher};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Ineligibility {
    #[error("profile has no age but the casting restricts it")]
    AgeUnknown,
    #[error("minimum age is {min}, profile age is {age}")]
    TooYoung { min: i32, age: i32 },
    #[error("maximum age is {max}, profile age is {age}")]
    TooOld { max: i32, age: i32 },
    #[error("casting is limited to gender `{required}`")]
    Gender { required: String },
    #[error("casting is limited to city `{required}`")]
    City { required: String },
}

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("applicant profile not found")]
    ProfileNotFound,
    #[error("casting not found")]
    CastingNotFound,
    #[error("casting is not accepting responses")]
    CastingNotActive,
    #[error("applications closed at {0}")]
    DeadlinePassed(DateTime<Utc>),
    #[error("cannot respond to your own casting")]
    OwnCasting,
    #[error("already responded to this casting")]
    AlreadyApplied,
    #[error("not eligible: {0}")]
    NotEligible(Ineligibility),
    #[error("monthly allowance used up and credit balance {balance} is below {required}")]
    BillingRequired {
        balance: i64,
        required: i64,
        limit: LimitExceeded,
    },
    #[error("profile lookup failed: {0}")]
    Profiles(anyhow::Error),
    #[error(transparent)]
    Limit(#[from] LimitError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum BillingPath {
    QuotaCovered,
    Charged {
        transaction_id: Uuid,
        amount: i64,
        balance: i64,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct ApplicationReceipt {
    pub response: Response,
    pub billing: BillingPath,
}

/// key: hybrid-billing -> quota first, credit ledger as fallback, one unit per charge
#[derive(Clone)]
pub struct ApplicationService {
    store: Arc<dyn Store>,
    credits: Ledger,
    limits: LimitEvaluator,
    profiles: Arc<dyn ProfileDirectory>,
    notifier: Arc<dyn NotificationDispatcher>,
    response_cost: i64,
}

impl ApplicationService {
    pub fn new(
        store: Arc<dyn Store>,
        limits: LimitEvaluator,
        profiles: Arc<dyn ProfileDirectory>,
        notifier: Arc<dyn NotificationDispatcher>,
        response_cost: i64,
    ) -> Self {
        Self {
            credits: Ledger::credit(store.clone()),
            store,
            limits,
            profiles,
            notifier,
            response_cost: response_cost.max(1),
        }
    }

    pub async fn apply_to_casting(
        &self,
        identity: &Identity,
        casting_id: Uuid,
        cover_letter: Option<String>,
    ) -> Result<ApplicationReceipt, ApplicationError> {
        let applicant_id = identity.principal_id;
        let now = Utc::now();

        // Everything that can reject the application runs before any balance is touched.
        let profile = self
            .profiles
            .profile(applicant_id)
            .await
            .map_err(ApplicationError::Profiles)?
            .ok_or(ApplicationError::ProfileNotFound)?;
        let casting = self
            .store
            .find_casting(casting_id)
            .await?
            .ok_or(ApplicationError::CastingNotFound)?;
        validate_casting(&casting, applicant_id, now)?;
        if self
            .store
            .find_application(casting_id, applicant_id)
            .await?
            .is_some()
        {
            return Err(ApplicationError::AlreadyApplied);
        }
        check_eligibility(&casting.requirements, &profile).map_err(ApplicationError::NotEligible)?;

        let key = LimitKey::MonthlyResponses;
        let used = self.limits.usage(applicant_id, key).await?;
        let receipt = match self.limits.can_consume(applicant_id, key, used).await {
            Ok(()) => self.create_covered(casting_id, applicant_id, cover_letter, now).await?,
            Err(LimitError::Exceeded(exceeded)) => {
                self.create_charged(casting_id, applicant_id, cover_letter, exceeded, now)
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            response_id = %receipt.response.id,
            %casting_id,
            %applicant_id,
            charged = matches!(receipt.billing, BillingPath::Charged { .. }),
            "casting response created"
        );
        self.notifier.dispatch(Notification::ResponseCreated {
            response_id: receipt.response.id,
            casting_id,
            employer_id: casting.owner_id,
            applicant_id,
            charged: matches!(receipt.billing, BillingPath::Charged { .. }),
        });

        Ok(receipt)
    }

    async fn create_covered(
        &self,
        casting_id: Uuid,
        applicant_id: Uuid,
        cover_letter: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApplicationReceipt, ApplicationError> {
        let response = Response::pending(
            Uuid::new_v4(),
            casting_id,
            applicant_id,
            cover_letter,
            0,
            now,
        );
        let mut unit = self.store.begin().await?;
        if !unit.insert_response(&response).await? {
            return Err(ApplicationError::AlreadyApplied);
        }
        unit.commit().await?;
        Ok(ApplicationReceipt {
            response,
            billing: BillingPath::QuotaCovered,
        })
    }

    /// Deduction and record share one unit: neither exists without the other.
    async fn create_charged(
        &self,
        casting_id: Uuid,
        applicant_id: Uuid,
        cover_letter: Option<String>,
        exceeded: LimitExceeded,
        now: DateTime<Utc>,
    ) -> Result<ApplicationReceipt, ApplicationError> {
        let response_id = Uuid::new_v4();
        let reference = response_id.to_string();
        let mut unit = self.store.begin().await?;

        let charge = self
            .credits
            .deduct_in(
                unit.as_mut(),
                applicant_id,
                self.response_cost,
                Some(&reference),
                Some(RelatedEntity::response(response_id)),
            )
            .await;
        let outcome = match charge {
            Ok(outcome) => outcome,
            Err(LedgerError::InsufficientFunds { balance, requested }) => {
                debug!(%applicant_id, balance, requested, "response requires billing");
                return Err(ApplicationError::BillingRequired {
                    balance,
                    required: requested,
                    limit: exceeded,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let response = Response::pending(
            response_id,
            casting_id,
            applicant_id,
            cover_letter,
            self.response_cost,
            now,
        );
        if !unit.insert_response(&response).await? {
            return Err(ApplicationError::AlreadyApplied);
        }
        unit.commit().await?;

        Ok(ApplicationReceipt {
            response,
            billing: BillingPath::Charged {
                transaction_id: outcome.transaction().id,
                amount: self.response_cost,
                balance: outcome.balance(),
            },
        })
    }
}

fn validate_casting(
    casting: &Casting,
    applicant_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), ApplicationError> {
    if casting.owner_id == applicant_id {
        return Err(ApplicationError::OwnCasting);
    }
    if casting.status != CastingStatus::Active {
        return Err(ApplicationError::CastingNotActive);
    }
    if let Some(deadline) = casting.requirements.application_deadline {
        if now >= deadline {
            return Err(ApplicationError::DeadlinePassed(deadline));
        }
    }
    Ok(())
}

pub fn check_eligibility(
    requirements: &CastingRequirements,
    profile: &ApplicantProfile,
) -> Result<(), Ineligibility> {
    if requirements.min_age.is_some() || requirements.max_age.is_some() {
        let age = profile.age.ok_or(Ineligibility::AgeUnknown)?;
        if let Some(min) = requirements.min_age {
            if age < min {
                return Err(Ineligibility::TooYoung { min, age });
            }
        }
        if let Some(max) = requirements.max_age {
            if age > max {
                return Err(Ineligibility::TooOld { max, age });
            }
        }
    }
    if let Some(required) = &requirements.gender {
        if !matches_ignoring_case(profile.gender.as_deref(), required) {
            return Err(Ineligibility::Gender {
                required: required.clone(),
            });
        }
    }
    if let Some(required) = &requirements.city {
        if !matches_ignoring_case(profile.city.as_deref(), required) {
            return Err(Ineligibility::City {
                required: required.clone(),
            });
        }
    }
    Ok(())
}

fn matches_ignoring_case(actual: Option<&str>, required: &str) -> bool {
    actual
        .map(|value| value.trim().eq_ignore_ascii_case(required.trim()))
        .unwrap_or(false)
}
