use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::models::{LimitKey, PlanQuota, UNBOUNDED};

/// key: plan-catalog -> base quota per principal
///
/// `Ok(None)` means the principal has no active subscription. Errors are not
/// fatal to callers: the evaluator degrades to the free tier.
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn quota_for(&self, principal_id: Uuid, key: LimitKey) -> Result<Option<PlanQuota>>;
}

/// Same quota for every principal.
#[derive(Clone, Debug)]
pub struct StaticPlanCatalog {
    quota: Option<PlanQuota>,
}

impl StaticPlanCatalog {
    pub fn new(quota: PlanQuota) -> Self {
        Self { quota: Some(quota) }
    }

    /// Catalog that never finds a subscription.
    pub fn empty() -> Self {
        Self { quota: None }
    }
}

#[async_trait]
impl PlanCatalog for StaticPlanCatalog {
    async fn quota_for(&self, _principal_id: Uuid, _key: LimitKey) -> Result<Option<PlanQuota>> {
        Ok(self.quota.clone())
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionQuotaRow {
    code: String,
    name: String,
    status: String,
    current_period_end: Option<DateTime<Utc>>,
    limit_quantity: Option<i64>,
}

impl SubscriptionQuotaRow {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.status != "active" && self.status != "trialing" {
            return false;
        }
        if let Some(end) = self.current_period_end {
            if end < now {
                return false;
            }
        }
        true
    }
}

/// Reads the latest subscription and its plan entitlement from Postgres.
#[derive(Clone)]
pub struct PgPlanCatalog {
    pool: PgPool,
}

impl PgPlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanCatalog for PgPlanCatalog {
    async fn quota_for(&self, principal_id: Uuid, key: LimitKey) -> Result<Option<PlanQuota>> {
        let row = sqlx::query_as::<_, SubscriptionQuotaRow>(
            r#"
            SELECT
                p.code,
                p.name,
                s.status,
                s.current_period_end,
                e.limit_quantity
            FROM principal_subscriptions s
            JOIN billing_plans p ON p.id = s.plan_id
            LEFT JOIN billing_plan_entitlements e
                ON e.plan_id = p.id AND e.entitlement_key = $2
            WHERE s.principal_id = $1
            ORDER BY s.updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(principal_id)
        .bind(key.entitlement_key())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        if !row.is_active(Utc::now()) {
            return Ok(None);
        }

        // A plan without the entitlement does not restrict it.
        Ok(Some(PlanQuota {
            plan_code: row.code,
            plan_name: row.name,
            base: row.limit_quantity.unwrap_or(UNBOUNDED),
        }))
    }
}
