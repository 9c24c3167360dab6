use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    ApplyOutcome, LedgerKind, LedgerTransaction, Page, ReconciliationReport, TransactionFilter,
    TransactionKind,
};
use crate::error::{AppError, AppResult};
use crate::identity::Identity;
use crate::services::BillingServices;

/// key: ledger-api -> balances, history, admin grants and audits
pub async fn get_balance(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path(ledger): Path<String>,
) -> AppResult<Json<BalanceResponse>> {
    let kind = parse_ledger(&ledger)?;
    let balance = services
        .ledger(kind)
        .balance(identity.principal_id)
        .await?;
    Ok(Json(BalanceResponse {
        ledger: kind,
        principal_id: identity.principal_id,
        balance,
    }))
}

pub async fn list_transactions(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path(ledger): Path<String>,
    Query(page): Query<Page>,
) -> AppResult<Json<Vec<LedgerTransaction>>> {
    let kind = parse_ledger(&ledger)?;
    let transactions = services
        .ledger(kind)
        .list_transactions(identity.principal_id, page)
        .await?;
    Ok(Json(transactions))
}

pub async fn admin_grant(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path((ledger, principal_id)): Path<(String, Uuid)>,
    Json(payload): Json<GrantRequest>,
) -> AppResult<Json<ApplyOutcome>> {
    identity.require_admin()?;
    let ledger = services.ledger(parse_ledger(&ledger)?);
    let reference = payload.reference.as_deref();
    let outcome = if payload.purchase {
        ledger.purchase(principal_id, payload.amount, reference).await?
    } else {
        let description = payload
            .description
            .unwrap_or_else(|| format!("granted by {}", identity.principal_id));
        ledger
            .grant(principal_id, payload.amount, reference, &description)
            .await?
    };
    Ok(Json(outcome))
}

pub async fn admin_search(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path(ledger): Path<String>,
    Query(query): Query<SearchQuery>,
) -> AppResult<Json<Vec<LedgerTransaction>>> {
    identity.require_admin()?;
    let kind = parse_ledger(&ledger)?;
    let filter = query.into_filter()?;
    let transactions = services.ledger(kind).search_transactions(&filter).await?;
    Ok(Json(transactions))
}

pub async fn admin_reconcile(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path((ledger, principal_id)): Path<(String, Uuid)>,
) -> AppResult<Json<ReconciliationReport>> {
    identity.require_admin()?;
    let report = services
        .ledger(parse_ledger(&ledger)?)
        .reconcile(principal_id)
        .await?;
    if !report.consistent {
        tracing::error!(
            ledger = report.ledger.as_str(),
            %principal_id,
            balance = report.balance,
            ledger_sum = report.ledger_sum,
            "balance does not match transaction history"
        );
    }
    Ok(Json(report))
}

fn parse_ledger(raw: &str) -> AppResult<LedgerKind> {
    LedgerKind::parse(raw).ok_or_else(|| AppError::NotFound(format!("ledger `{raw}`")))
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub ledger: LedgerKind,
    pub principal_id: Uuid,
    pub balance: i64,
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub amount: i64,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Records a paid purchase instead of a free grant. Credit ledger only.
    #[serde(default)]
    pub purchase: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub principal_id: Option<Uuid>,
    pub kind: Option<String>,
    pub related_entity_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl SearchQuery {
    fn into_filter(self) -> AppResult<TransactionFilter> {
        let kind = match self.kind.as_deref() {
            Some(raw) => Some(
                TransactionKind::parse(raw)
                    .ok_or_else(|| AppError::BadRequest(format!("unknown transaction kind `{raw}`")))?,
            ),
            None => None,
        };
        let defaults = Page::default();
        Ok(TransactionFilter {
            principal_id: self.principal_id,
            kind,
            related_entity_id: self.related_entity_id,
            created_after: self.created_after,
            created_before: self.created_before,
            page: Page {
                limit: self.limit.unwrap_or(defaults.limit),
                offset: self.offset.unwrap_or(defaults.offset),
            },
        })
    }
}
