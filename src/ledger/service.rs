use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{
    ApplyOutcome, ApplyRequest, LedgerKind, LedgerTransaction, Page, ReconciliationReport,
    RelatedEntity, TransactionFilter, TransactionKind,
};
use crate::store::{Store, StoreError, UnitOfWork};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("{kind} transactions cannot carry a delta of {delta}")]
    InvalidDelta { kind: &'static str, delta: i64 },
    #[error("{kind} transactions are not allowed on the {ledger} ledger")]
    KindNotAllowed {
        ledger: &'static str,
        kind: &'static str,
    },
    #[error("{ledger} deductions require an idempotency reference")]
    MissingReference { ledger: &'static str },
    #[error("delta {delta} would overflow a balance of {balance}")]
    Overflow { balance: i64, delta: i64 },
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
    #[error("reference `{reference}` already used with delta {existing_delta}, not {requested_delta}")]
    ReferenceConflict {
        reference: String,
        existing_delta: i64,
        requested_delta: i64,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Expected outcomes of correct concurrent use, as opposed to bad input or infrastructure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientFunds { .. } | LedgerError::ReferenceConflict { .. }
        )
    }
}

/// key: ledger-service -> the only sanctioned way to mutate a balance
///
/// One type serves both ledgers; [`LedgerKind`] selects the tables and the
/// per-ledger kind policy.
#[derive(Clone)]
pub struct Ledger {
    kind: LedgerKind,
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(kind: LedgerKind, store: Arc<dyn Store>) -> Self {
        Self { kind, store }
    }

    pub fn wallet(store: Arc<dyn Store>) -> Self {
        Self::new(LedgerKind::Wallet, store)
    }

    pub fn credit(store: Arc<dyn Store>) -> Self {
        Self::new(LedgerKind::Credit, store)
    }

    pub fn kind(&self) -> LedgerKind {
        self.kind
    }

    pub async fn balance(&self, principal_id: Uuid) -> Result<i64, LedgerError> {
        Ok(self
            .store
            .provision_balance(self.kind, principal_id)
            .await?
            .balance)
    }

    /// Applies one signed delta in its own unit of work.
    pub async fn apply(&self, request: ApplyRequest) -> Result<ApplyOutcome, LedgerError> {
        self.validate(&request)?;
        let mut unit = self.store.begin().await?;
        let outcome = self.apply_validated(unit.as_mut(), &request).await?;
        unit.commit().await?;
        self.log_outcome(&outcome);
        Ok(outcome)
    }

    /// Applies one signed delta inside a caller-owned unit of work. Nothing is
    /// durable until the caller commits that unit.
    pub async fn apply_in(
        &self,
        unit: &mut dyn UnitOfWork,
        request: ApplyRequest,
    ) -> Result<ApplyOutcome, LedgerError> {
        self.validate(&request)?;
        self.apply_validated(unit, &request).await
    }

    pub async fn deduct(
        &self,
        principal_id: Uuid,
        amount: i64,
        reference: Option<&str>,
        related: Option<RelatedEntity>,
    ) -> Result<ApplyOutcome, LedgerError> {
        let request = self.deduction(principal_id, amount, reference, related)?;
        self.apply(request).await
    }

    pub async fn deduct_in(
        &self,
        unit: &mut dyn UnitOfWork,
        principal_id: Uuid,
        amount: i64,
        reference: Option<&str>,
        related: Option<RelatedEntity>,
    ) -> Result<ApplyOutcome, LedgerError> {
        let request = self.deduction(principal_id, amount, reference, related)?;
        self.apply_in(unit, request).await
    }

    pub async fn refund(
        &self,
        principal_id: Uuid,
        amount: i64,
        reference: Option<&str>,
        related: Option<RelatedEntity>,
    ) -> Result<ApplyOutcome, LedgerError> {
        let request = credit_request(principal_id, amount, TransactionKind::Refund, reference)?;
        self.apply(with_related(request, related)).await
    }

    pub async fn refund_in(
        &self,
        unit: &mut dyn UnitOfWork,
        principal_id: Uuid,
        amount: i64,
        reference: Option<&str>,
        related: Option<RelatedEntity>,
    ) -> Result<ApplyOutcome, LedgerError> {
        let request = credit_request(principal_id, amount, TransactionKind::Refund, reference)?;
        self.apply_in(unit, with_related(request, related)).await
    }

    /// Wallet top-up or credit admin grant. References are optional here.
    pub async fn grant(
        &self,
        principal_id: Uuid,
        amount: i64,
        reference: Option<&str>,
        description: &str,
    ) -> Result<ApplyOutcome, LedgerError> {
        let request = credit_request(principal_id, amount, self.kind.grant_kind(), reference)?
            .with_description(description);
        self.apply(request).await
    }

    /// Paid credit purchase; only valid on the credit ledger.
    pub async fn purchase(
        &self,
        principal_id: Uuid,
        amount: i64,
        reference: Option<&str>,
    ) -> Result<ApplyOutcome, LedgerError> {
        let request = credit_request(principal_id, amount, TransactionKind::Purchase, reference)?
            .with_description("credit purchase");
        self.apply(request).await
    }

    pub async fn list_transactions(
        &self,
        principal_id: Uuid,
        page: Page,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        Ok(self
            .store
            .list_transactions(self.kind, principal_id, page)
            .await?)
    }

    pub async fn search_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        Ok(self.store.search_transactions(self.kind, filter).await?)
    }

    /// Existence check for caller-level idempotency ("already refunded?").
    pub async fn has_transaction(
        &self,
        kind: TransactionKind,
        related_entity_id: Uuid,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .store
            .has_transaction(self.kind, kind, related_entity_id)
            .await?)
    }

    pub async fn reconcile(&self, principal_id: Uuid) -> Result<ReconciliationReport, LedgerError> {
        let balance = self.balance(principal_id).await?;
        let ledger_sum = self.store.ledger_sum(self.kind, principal_id).await?;
        Ok(ReconciliationReport {
            ledger: self.kind,
            principal_id,
            balance,
            ledger_sum,
            consistent: balance == ledger_sum,
        })
    }

    fn deduction(
        &self,
        principal_id: Uuid,
        amount: i64,
        reference: Option<&str>,
        related: Option<RelatedEntity>,
    ) -> Result<ApplyRequest, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let reference = reference.map(str::trim).filter(|value| !value.is_empty());
        if reference.is_none() && self.kind.deduction_requires_reference() {
            return Err(LedgerError::MissingReference {
                ledger: self.kind.as_str(),
            });
        }
        let mut request = ApplyRequest::new(principal_id, -amount, self.kind.deduct_kind());
        if let Some(reference) = reference {
            request = request.with_reference(reference);
        }
        Ok(with_related(request, related))
    }

    fn validate(&self, request: &ApplyRequest) -> Result<(), LedgerError> {
        if !request.kind.permitted_on(self.kind) {
            return Err(LedgerError::KindNotAllowed {
                ledger: self.kind.as_str(),
                kind: request.kind.as_str(),
            });
        }
        // i64::MIN has no positive counterpart to report as the requested amount.
        if request.delta == i64::MIN || !request.kind.accepts_delta(request.delta) {
            return Err(LedgerError::InvalidDelta {
                kind: request.kind.as_str(),
                delta: request.delta,
            });
        }
        Ok(())
    }

    async fn apply_validated(
        &self,
        unit: &mut dyn UnitOfWork,
        request: &ApplyRequest,
    ) -> Result<ApplyOutcome, LedgerError> {
        let balance = unit.lock_balance(self.kind, request.principal_id).await?;
        let reference = request.normalized_reference();

        if let Some(reference) = reference {
            if let Some(existing) = unit
                .find_by_reference(self.kind, request.principal_id, request.kind, reference)
                .await?
            {
                return resolve_replay(existing, request.delta, balance);
            }
        }

        let new_balance = balance
            .checked_add(request.delta)
            .ok_or(LedgerError::Overflow {
                balance,
                delta: request.delta,
            })?;
        if new_balance < 0 {
            return Err(LedgerError::InsufficientFunds {
                balance,
                requested: -request.delta,
            });
        }

        let now = Utc::now();
        let transaction = LedgerTransaction {
            id: Uuid::new_v4(),
            principal_id: request.principal_id,
            delta: request.delta,
            kind: request.kind,
            reference: reference.map(str::to_string),
            related_entity: request.related_entity.clone(),
            description: request.description.clone(),
            created_at: now,
        };

        if !unit.append_transaction(self.kind, &transaction).await? {
            // A concurrent writer claimed the reference first; resolve against its row.
            let reference = reference.unwrap_or_default();
            let existing = unit
                .find_by_reference(self.kind, request.principal_id, request.kind, reference)
                .await?
                .ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "reference `{reference}` reported taken but not found"
                    ))
                })?;
            return resolve_replay(existing, request.delta, balance);
        }

        unit.set_balance(self.kind, request.principal_id, new_balance, now)
            .await?;

        Ok(ApplyOutcome::Applied {
            transaction,
            balance: new_balance,
        })
    }

    fn log_outcome(&self, outcome: &ApplyOutcome) {
        let transaction = outcome.transaction();
        if outcome.is_replay() {
            debug!(
                ledger = self.kind.as_str(),
                principal_id = %transaction.principal_id,
                reference = ?transaction.reference,
                "ledger apply replayed existing transaction"
            );
        } else {
            info!(
                ledger = self.kind.as_str(),
                principal_id = %transaction.principal_id,
                kind = transaction.kind.as_str(),
                delta = transaction.delta,
                balance = outcome.balance(),
                "ledger transaction applied"
            );
        }
    }
}

fn resolve_replay(
    existing: LedgerTransaction,
    requested_delta: i64,
    balance: i64,
) -> Result<ApplyOutcome, LedgerError> {
    if existing.delta == requested_delta {
        Ok(ApplyOutcome::Replayed {
            transaction: existing,
            balance,
        })
    } else {
        Err(LedgerError::ReferenceConflict {
            reference: existing.reference.unwrap_or_default(),
            existing_delta: existing.delta,
            requested_delta,
        })
    }
}

fn credit_request(
    principal_id: Uuid,
    amount: i64,
    kind: TransactionKind,
    reference: Option<&str>,
) -> Result<ApplyRequest, LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    let mut request = ApplyRequest::new(principal_id, amount, kind);
    if let Some(reference) = reference {
        request = request.with_reference(reference);
    }
    Ok(request)
}

fn with_related(request: ApplyRequest, related: Option<RelatedEntity>) -> ApplyRequest {
    match related {
        Some(related) => request.with_related(related),
        None => request,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn credit_ledger() -> Ledger {
        Ledger::credit(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn balance_is_lazily_provisioned() {
        let ledger = credit_ledger();
        assert_eq!(ledger.balance(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn validation_happens_before_any_lock() {
        let ledger = Ledger::wallet(Arc::new(MemoryStore::new()));
        let principal_id = Uuid::new_v4();

        let err = ledger.deduct(principal_id, 0, Some("r"), None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(0)));

        let err = ledger.deduct(principal_id, 3, None, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::MissingReference { ledger: "wallet" }));

        let err = ledger.purchase(principal_id, 3, None).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::KindNotAllowed {
                ledger: "wallet",
                kind: "purchase"
            }
        ));
    }

    #[tokio::test]
    async fn credit_deductions_may_omit_reference() {
        let ledger = credit_ledger();
        let principal_id = Uuid::new_v4();
        ledger.grant(principal_id, 4, None, "welcome").await.unwrap();
        let outcome = ledger.deduct(principal_id, 1, None, None).await.unwrap();
        assert_eq!(outcome.balance(), 3);
        assert_eq!(outcome.transaction().kind, TransactionKind::Deduction);
    }

    #[tokio::test]
    async fn apply_rejects_mismatched_sign() {
        let ledger = credit_ledger();
        let request = ApplyRequest::new(Uuid::new_v4(), 5, TransactionKind::Deduction);
        let err = ledger.apply(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDelta { delta: 5, .. }));
    }

    #[tokio::test]
    async fn oversized_grants_are_refused_without_changing_the_balance() {
        let ledger = credit_ledger();
        let principal_id = Uuid::new_v4();
        ledger.grant(principal_id, 1, None, "seed").await.unwrap();

        let err = ledger
            .grant(principal_id, i64::MAX, None, "typo")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Overflow {
                balance: 1,
                delta: i64::MAX
            }
        ));

        let request = ApplyRequest::new(principal_id, i64::MIN, TransactionKind::AdminGrant);
        let err = ledger.apply(request).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidDelta { .. }));

        let report = ledger.reconcile(principal_id).await.unwrap();
        assert_eq!(report.balance, 1);
        assert!(report.consistent);
    }

    #[tokio::test]
    async fn failed_apply_in_leaves_unit_clean() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = Ledger::credit(store.clone());
        let principal_id = Uuid::new_v4();
        let mut unit = store.begin().await.unwrap();
        let err = ledger
            .deduct_in(unit.as_mut(), principal_id, 1, Some("resp-1"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                balance: 0,
                requested: 1
            }
        ));
        drop(unit);
        assert!(ledger
            .list_transactions(principal_id, Page::default())
            .await
            .unwrap()
            .is_empty());
    }
}
