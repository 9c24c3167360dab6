use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::catalog::PlanCatalog;
use super::models::{
    remaining, LimitExceeded, LimitKey, LimitOverride, LimitStatus, PlanQuota,
};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("unknown limit key `{0}`")]
    UnknownKey(String),
    #[error("override reason is required")]
    MissingReason,
    #[error("override delta must be non-zero")]
    ZeroAdjustment,
    #[error("limit value must be non-negative, got {0}")]
    InvalidTarget(i64),
    #[error("{0} is unbounded on the current plan")]
    Unbounded(LimitKey),
    #[error("{} limit reached ({}/{}) on the {} plan", .0.key, .0.current, .0.limit, .0.plan_name)]
    Exceeded(LimitExceeded),
    #[error("adjusting {key} by {delta} would leave an allowance of {resulting}")]
    WouldGoNegative {
        key: LimitKey,
        base: i64,
        override_total: i64,
        delta: i64,
        resulting: i64,
    },
    #[error("adjusting {key} by {delta} overflows an override total of {override_total}")]
    Overflow {
        key: LimitKey,
        override_total: i64,
        delta: i64,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug)]
enum Adjustment {
    By(i64),
    To(i64),
}

/// key: limit-evaluator -> quota status, consumption checks, audited overrides
///
/// Reads are snapshot-consistent only; callers that bill on exhaustion
/// re-verify inside their own unit of work.
#[derive(Clone)]
pub struct LimitEvaluator {
    store: Arc<dyn Store>,
    catalog: Arc<dyn PlanCatalog>,
    free_tier_quota: i64,
}

impl LimitEvaluator {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<dyn PlanCatalog>, free_tier_quota: i64) -> Self {
        Self {
            store,
            catalog,
            free_tier_quota,
        }
    }

    pub fn parse_key(raw: &str) -> Result<LimitKey, LimitError> {
        LimitKey::parse(raw).ok_or_else(|| LimitError::UnknownKey(raw.to_string()))
    }

    /// Never fails: an unreachable catalog or missing subscription yields the free tier.
    pub async fn plan_quota(&self, principal_id: Uuid, key: LimitKey) -> PlanQuota {
        match self.catalog.quota_for(principal_id, key).await {
            Ok(Some(quota)) => quota,
            Ok(None) => PlanQuota::free_tier(self.free_tier_quota),
            Err(err) => {
                warn!(
                    ?err,
                    %principal_id,
                    key = key.as_str(),
                    "plan catalog unavailable; falling back to free tier"
                );
                PlanQuota::free_tier(self.free_tier_quota)
            }
        }
    }

    /// Consumption of `key` in the current reset period.
    pub async fn usage(&self, principal_id: Uuid, key: LimitKey) -> Result<i64, LimitError> {
        let (start, end) = key.reset_period().window(Utc::now());
        let used = match key {
            LimitKey::MonthlyResponses => {
                self.store.count_responses(principal_id, start, end).await?
            }
        };
        Ok(used)
    }

    pub async fn status(&self, principal_id: Uuid, key: LimitKey) -> Result<LimitStatus, LimitError> {
        let used = self.usage(principal_id, key).await?;
        self.status_with_usage(principal_id, key, used).await
    }

    /// `Ok(())` when one more unit fits the allowance given `current_usage`.
    pub async fn can_consume(
        &self,
        principal_id: Uuid,
        key: LimitKey,
        current_usage: i64,
    ) -> Result<(), LimitError> {
        let status = self
            .status_with_usage(principal_id, key, current_usage)
            .await?;
        if status.is_unbounded() || current_usage < status.effective_limit() {
            return Ok(());
        }
        Err(LimitError::Exceeded(LimitExceeded {
            key,
            current: current_usage,
            limit: status.effective_limit(),
            upgrade_hint: upgrade_hint(key, &status.plan_name),
            plan_name: status.plan_name,
        }))
    }

    /// Appends a signed adjustment. Bounded allowances may not be driven negative.
    pub async fn adjust_override(
        &self,
        actor_id: Uuid,
        principal_id: Uuid,
        key: LimitKey,
        delta: i64,
        reason: &str,
    ) -> Result<LimitStatus, LimitError> {
        if delta == 0 {
            return Err(LimitError::ZeroAdjustment);
        }
        self.record_override(actor_id, principal_id, key, Adjustment::By(delta), reason)
            .await
    }

    /// Appends whatever delta brings `base + overrides` to `value`.
    pub async fn set_limit(
        &self,
        actor_id: Uuid,
        principal_id: Uuid,
        key: LimitKey,
        value: i64,
        reason: &str,
    ) -> Result<LimitStatus, LimitError> {
        if value < 0 {
            return Err(LimitError::InvalidTarget(value));
        }
        self.record_override(actor_id, principal_id, key, Adjustment::To(value), reason)
            .await
    }

    pub async fn overrides(
        &self,
        principal_id: Uuid,
        key: LimitKey,
    ) -> Result<Vec<LimitOverride>, LimitError> {
        Ok(self.store.list_overrides(principal_id, key).await?)
    }

    /// Reads the override total, checks the bound and appends in one unit, so
    /// concurrent adjustments for the same principal and key queue behind each other.
    async fn record_override(
        &self,
        actor_id: Uuid,
        principal_id: Uuid,
        key: LimitKey,
        adjustment: Adjustment,
        reason: &str,
    ) -> Result<LimitStatus, LimitError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LimitError::MissingReason);
        }
        let quota = self.plan_quota(principal_id, key).await;
        if quota.is_unbounded() && matches!(adjustment, Adjustment::To(_)) {
            return Err(LimitError::Unbounded(key));
        }

        let mut unit = self.store.begin().await?;
        let override_total = unit.lock_override_total(principal_id, key).await?;
        let overflow = |delta| LimitError::Overflow {
            key,
            override_total,
            delta,
        };
        let delta = match adjustment {
            Adjustment::By(delta) => delta,
            Adjustment::To(value) => quota
                .base
                .checked_add(override_total)
                .and_then(|current| value.checked_sub(current))
                .ok_or_else(|| overflow(value))?,
        };
        if delta == 0 {
            drop(unit);
            return self.status(principal_id, key).await;
        }
        let new_total = override_total
            .checked_add(delta)
            .ok_or_else(|| overflow(delta))?;
        if !quota.is_unbounded() {
            let resulting = quota
                .base
                .checked_add(new_total)
                .ok_or_else(|| overflow(delta))?;
            if resulting < 0 {
                return Err(LimitError::WouldGoNegative {
                    key,
                    base: quota.base,
                    override_total,
                    delta,
                    resulting,
                });
            }
        }

        let record = LimitOverride {
            id: Uuid::new_v4(),
            principal_id,
            limit_key: key,
            delta,
            reason: reason.to_string(),
            actor_id,
            created_at: Utc::now(),
        };
        unit.append_override(&record).await?;
        unit.commit().await?;
        info!(
            %actor_id,
            %principal_id,
            key = key.as_str(),
            delta,
            reason,
            "limit override recorded"
        );

        self.status(principal_id, key).await
    }

    async fn status_with_usage(
        &self,
        principal_id: Uuid,
        key: LimitKey,
        used: i64,
    ) -> Result<LimitStatus, LimitError> {
        let quota = self.plan_quota(principal_id, key).await;
        let override_total = self.store.override_total(principal_id, key).await?;
        let reset_period = key.reset_period();
        let (period_start, period_end) = reset_period.window(Utc::now());
        Ok(LimitStatus {
            key,
            plan_name: quota.plan_name,
            base: quota.base,
            override_total,
            used,
            remaining: remaining(quota.base, override_total, used),
            reset_period,
            period_start,
            period_end,
        })
    }
}

fn upgrade_hint(key: LimitKey, plan_name: &str) -> String {
    match key {
        LimitKey::MonthlyResponses => format!(
            "The {plan_name} plan's monthly responses are used up. Upgrade your plan or pay for this response with credits."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::catalog::StaticPlanCatalog;
    use crate::limits::models::UNBOUNDED;
    use crate::store::MemoryStore;

    fn evaluator(quota: Option<PlanQuota>) -> LimitEvaluator {
        let catalog = match quota {
            Some(quota) => StaticPlanCatalog::new(quota),
            None => StaticPlanCatalog::empty(),
        };
        LimitEvaluator::new(Arc::new(MemoryStore::new()), Arc::new(catalog), 3)
    }

    fn pro(base: i64) -> PlanQuota {
        PlanQuota {
            plan_code: "pro".to_string(),
            plan_name: "Pro".to_string(),
            base,
        }
    }

    struct BrokenCatalog;

    #[async_trait::async_trait]
    impl PlanCatalog for BrokenCatalog {
        async fn quota_for(
            &self,
            _principal_id: Uuid,
            _key: LimitKey,
        ) -> anyhow::Result<Option<PlanQuota>> {
            Err(anyhow::anyhow!("catalog offline"))
        }
    }

    #[tokio::test]
    async fn unreachable_catalog_degrades_to_free_tier() {
        let evaluator = LimitEvaluator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BrokenCatalog),
            3,
        );
        let status = evaluator
            .status(Uuid::new_v4(), LimitKey::MonthlyResponses)
            .await
            .unwrap();
        assert_eq!(status.base, 3);
        assert_eq!(status.plan_name, "Free");
        assert_eq!(status.remaining, 3);
    }

    #[tokio::test]
    async fn exhausted_allowance_carries_upgrade_details() {
        let evaluator = evaluator(Some(pro(2)));
        let principal_id = Uuid::new_v4();
        evaluator
            .can_consume(principal_id, LimitKey::MonthlyResponses, 1)
            .await
            .unwrap();

        let err = evaluator
            .can_consume(principal_id, LimitKey::MonthlyResponses, 2)
            .await
            .unwrap_err();
        match err {
            LimitError::Exceeded(exceeded) => {
                assert_eq!(exceeded.current, 2);
                assert_eq!(exceeded.limit, 2);
                assert_eq!(exceeded.plan_name, "Pro");
                assert!(exceeded.upgrade_hint.contains("Pro"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unbounded_plan_always_allows() {
        let evaluator = evaluator(Some(pro(UNBOUNDED)));
        let principal_id = Uuid::new_v4();
        evaluator
            .can_consume(principal_id, LimitKey::MonthlyResponses, 10_000)
            .await
            .unwrap();
        let status = evaluator
            .status(principal_id, LimitKey::MonthlyResponses)
            .await
            .unwrap();
        assert_eq!(status.remaining, UNBOUNDED);

        evaluator
            .adjust_override(Uuid::new_v4(), principal_id, LimitKey::MonthlyResponses, -50, "cleanup")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn overrides_accumulate_and_cannot_go_negative() {
        let evaluator = evaluator(None);
        let admin = Uuid::new_v4();
        let principal_id = Uuid::new_v4();

        let status = evaluator
            .adjust_override(admin, principal_id, LimitKey::MonthlyResponses, 4, "promo")
            .await
            .unwrap();
        assert_eq!(status.override_total, 4);
        assert_eq!(status.effective_limit(), 7);

        let err = evaluator
            .adjust_override(admin, principal_id, LimitKey::MonthlyResponses, -8, "abuse")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LimitError::WouldGoNegative { resulting: -1, .. }
        ));

        let status = evaluator
            .adjust_override(admin, principal_id, LimitKey::MonthlyResponses, -7, "abuse")
            .await
            .unwrap();
        assert_eq!(status.effective_limit(), 0);
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn set_limit_appends_the_difference() {
        let evaluator = evaluator(None);
        let admin = Uuid::new_v4();
        let principal_id = Uuid::new_v4();

        let status = evaluator
            .set_limit(admin, principal_id, LimitKey::MonthlyResponses, 10, "partner")
            .await
            .unwrap();
        assert_eq!(status.effective_limit(), 10);

        let status = evaluator
            .set_limit(admin, principal_id, LimitKey::MonthlyResponses, 1, "partner ended")
            .await
            .unwrap();
        assert_eq!(status.effective_limit(), 1);

        let history = evaluator
            .overrides(principal_id, LimitKey::MonthlyResponses)
            .await
            .unwrap();
        let deltas: Vec<i64> = history.iter().map(|record| record.delta).collect();
        assert_eq!(deltas, vec![-9, 7]);
    }

    #[tokio::test]
    async fn blank_reason_is_rejected() {
        let evaluator = evaluator(None);
        let err = evaluator
            .adjust_override(Uuid::new_v4(), Uuid::new_v4(), LimitKey::MonthlyResponses, 1, "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, LimitError::MissingReason));
        assert!(matches!(
            LimitEvaluator::parse_key("weekly_castings"),
            Err(LimitError::UnknownKey(_))
        ));
    }
}
