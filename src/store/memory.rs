//! In-process store with the same transactional contract as [`super::PgStore`].
//!
//! A unit of work takes the single writer permit and mutates a private copy of
//! the committed state; the copy is published on commit and discarded on drop.
//! Readers work off the last committed snapshot and never wait for writers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, UnitOfWork};
use crate::applications::models::{Casting, Response, ResponseStatus};
use crate::ledger::models::{
    Balance, LedgerKind, LedgerTransaction, Page, TransactionFilter, TransactionKind,
};
use crate::limits::models::{LimitKey, LimitOverride};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
struct MemoryState {
    balances: HashMap<(LedgerKind, Uuid), Balance>,
    transactions: Vec<(LedgerKind, LedgerTransaction)>,
    overrides: Vec<LimitOverride>,
    castings: HashMap<Uuid, Casting>,
    responses: HashMap<Uuid, Response>,
}

impl MemoryState {
    fn provision(&mut self, ledger: LedgerKind, principal_id: Uuid) -> &mut Balance {
        self.balances
            .entry((ledger, principal_id))
            .or_insert_with(|| Balance {
                principal_id,
                balance: 0,
                updated_at: Utc::now(),
            })
    }

    fn ledger_transactions(
        &self,
        ledger: LedgerKind,
    ) -> impl Iterator<Item = &LedgerTransaction> + '_ {
        self.transactions
            .iter()
            .filter(move |(kind, _)| *kind == ledger)
            .map(|(_, transaction)| transaction)
    }

    fn override_total(&self, principal_id: Uuid, key: LimitKey) -> i64 {
        self.overrides
            .iter()
            .filter(|record| record.principal_id == principal_id && record.limit_key == key)
            .map(|record| record.delta)
            .sum()
    }

    fn has_related(&self, ledger: LedgerKind, kind: TransactionKind, related_id: Uuid) -> bool {
        self.ledger_transactions(ledger).any(|transaction| {
            transaction.kind == kind
                && transaction
                    .related_entity
                    .as_ref()
                    .map(|related| related.entity_id == related_id)
                    .unwrap_or(false)
        })
    }
}

fn newest_first(mut transactions: Vec<LedgerTransaction>, page: Page) -> Vec<LedgerTransaction> {
    let page = page.clamped();
    transactions.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    transactions
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

/// key: memory-store -> serialized units over a committed snapshot
#[derive(Clone)]
pub struct MemoryStore {
    writer: Arc<Mutex<()>>,
    committed: Arc<RwLock<Arc<MemoryState>>>,
    lock_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            writer: Arc::new(Mutex::new(())),
            committed: Arc::new(RwLock::new(Arc::new(MemoryState::default()))),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    fn snapshot(&self) -> Arc<MemoryState> {
        match self.committed.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn open(&self) -> StoreResult<MemoryUnitOfWork> {
        let permit = tokio::time::timeout(self.lock_timeout, self.writer.clone().lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout)?;
        let working = self.snapshot().as_ref().clone();
        Ok(MemoryUnitOfWork {
            permit: Some(permit),
            committed: self.committed.clone(),
            working,
        })
    }
}

pub struct MemoryUnitOfWork {
    permit: Option<OwnedMutexGuard<()>>,
    committed: Arc<RwLock<Arc<MemoryState>>>,
    working: MemoryState,
}

impl MemoryUnitOfWork {
    fn state(&mut self) -> StoreResult<&mut MemoryState> {
        if self.permit.is_none() {
            return Err(StoreError::Finished);
        }
        Ok(&mut self.working)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_balance(&mut self, ledger: LedgerKind, principal_id: Uuid) -> StoreResult<i64> {
        let state = self.state()?;
        Ok(state.provision(ledger, principal_id).balance)
    }

    async fn find_by_reference(
        &mut self,
        ledger: LedgerKind,
        principal_id: Uuid,
        kind: TransactionKind,
        reference: &str,
    ) -> StoreResult<Option<LedgerTransaction>> {
        let state = self.state()?;
        Ok(state
            .ledger_transactions(ledger)
            .find(|transaction| {
                transaction.principal_id == principal_id
                    && transaction.kind == kind
                    && transaction.reference.as_deref() == Some(reference)
            })
            .cloned())
    }

    async fn has_related_transaction(
        &mut self,
        ledger: LedgerKind,
        kind: TransactionKind,
        related_entity_id: Uuid,
    ) -> StoreResult<bool> {
        let state = self.state()?;
        Ok(state.has_related(ledger, kind, related_entity_id))
    }

    async fn append_transaction(
        &mut self,
        ledger: LedgerKind,
        transaction: &LedgerTransaction,
    ) -> StoreResult<bool> {
        let state = self.state()?;
        if let Some(reference) = transaction.reference.as_deref() {
            let taken = state.ledger_transactions(ledger).any(|existing| {
                existing.principal_id == transaction.principal_id
                    && existing.kind == transaction.kind
                    && existing.reference.as_deref() == Some(reference)
            });
            if taken {
                return Ok(false);
            }
        }
        state.transactions.push((ledger, transaction.clone()));
        Ok(true)
    }

    async fn set_balance(
        &mut self,
        ledger: LedgerKind,
        principal_id: Uuid,
        balance: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let state = self.state()?;
        if balance < 0 {
            return Err(StoreError::Corrupt(format!(
                "{} balance for {principal_id} would be negative",
                ledger.as_str()
            )));
        }
        let row = state.provision(ledger, principal_id);
        row.balance = balance;
        row.updated_at = now;
        Ok(())
    }

    async fn insert_response(&mut self, response: &Response) -> StoreResult<bool> {
        let state = self.state()?;
        let duplicate = state.responses.values().any(|existing| {
            existing.casting_id == response.casting_id
                && existing.applicant_id == response.applicant_id
        });
        if duplicate {
            return Ok(false);
        }
        state.responses.insert(response.id, response.clone());
        Ok(true)
    }

    async fn lock_response(&mut self, response_id: Uuid) -> StoreResult<Option<Response>> {
        let state = self.state()?;
        Ok(state.responses.get(&response_id).cloned())
    }

    async fn set_response_status(
        &mut self,
        response_id: Uuid,
        status: ResponseStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let state = self.state()?;
        if let Some(response) = state.responses.get_mut(&response_id) {
            response.move_to(status, now);
        }
        Ok(())
    }

    async fn lock_override_total(
        &mut self,
        principal_id: Uuid,
        key: LimitKey,
    ) -> StoreResult<i64> {
        let state = self.state()?;
        Ok(state.override_total(principal_id, key))
    }

    async fn append_override(&mut self, record: &LimitOverride) -> StoreResult<()> {
        let state = self.state()?;
        state.overrides.push(record.clone());
        Ok(())
    }

    async fn increment_accepted(
        &mut self,
        casting_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Casting>> {
        let state = self.state()?;
        let Some(casting) = state.castings.get_mut(&casting_id) else {
            return Ok(None);
        };
        if casting.record_acceptance(now) {
            Ok(Some(casting.clone()))
        } else {
            Ok(None)
        }
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let permit = self.permit.take().ok_or(StoreError::Finished)?;
        let published = Arc::new(std::mem::take(&mut self.working));
        match self.committed.write() {
            Ok(mut guard) => *guard = published,
            Err(poisoned) => *poisoned.into_inner() = published,
        }
        drop(permit);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(self.open().await?))
    }

    async fn provision_balance(
        &self,
        ledger: LedgerKind,
        principal_id: Uuid,
    ) -> StoreResult<Balance> {
        // An unseen principal reads as zero; `lock_balance` creates the row on first write.
        Ok(self
            .snapshot()
            .balances
            .get(&(ledger, principal_id))
            .cloned()
            .unwrap_or_else(|| Balance {
                principal_id,
                balance: 0,
                updated_at: Utc::now(),
            }))
    }

    async fn list_transactions(
        &self,
        ledger: LedgerKind,
        principal_id: Uuid,
        page: Page,
    ) -> StoreResult<Vec<LedgerTransaction>> {
        let snapshot = self.snapshot();
        let transactions = snapshot
            .ledger_transactions(ledger)
            .filter(|transaction| transaction.principal_id == principal_id)
            .cloned()
            .collect();
        Ok(newest_first(transactions, page))
    }

    async fn search_transactions(
        &self,
        ledger: LedgerKind,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<LedgerTransaction>> {
        let snapshot = self.snapshot();
        let transactions = snapshot
            .ledger_transactions(ledger)
            .filter(|transaction| filter.matches(transaction))
            .cloned()
            .collect();
        Ok(newest_first(transactions, filter.page))
    }

    async fn has_transaction(
        &self,
        ledger: LedgerKind,
        kind: TransactionKind,
        related_entity_id: Uuid,
    ) -> StoreResult<bool> {
        Ok(self.snapshot().has_related(ledger, kind, related_entity_id))
    }

    async fn ledger_sum(&self, ledger: LedgerKind, principal_id: Uuid) -> StoreResult<i64> {
        Ok(self
            .snapshot()
            .ledger_transactions(ledger)
            .filter(|transaction| transaction.principal_id == principal_id)
            .map(|transaction| transaction.delta)
            .sum())
    }

    async fn override_total(&self, principal_id: Uuid, key: LimitKey) -> StoreResult<i64> {
        Ok(self.snapshot().override_total(principal_id, key))
    }

    async fn list_overrides(
        &self,
        principal_id: Uuid,
        key: LimitKey,
    ) -> StoreResult<Vec<LimitOverride>> {
        let mut records: Vec<LimitOverride> = self
            .snapshot()
            .overrides
            .iter()
            .filter(|record| record.principal_id == principal_id && record.limit_key == key)
            .cloned()
            .collect();
        records.reverse();
        Ok(records)
    }

    async fn count_responses(
        &self,
        applicant_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<i64> {
        Ok(self
            .snapshot()
            .responses
            .values()
            .filter(|response| {
                response.applicant_id == applicant_id
                    && response.created_at >= since
                    && response.created_at < until
            })
            .count() as i64)
    }

    async fn insert_casting(&self, casting: &Casting) -> StoreResult<()> {
        let mut unit = self.open().await?;
        unit.state()?.castings.insert(casting.id, casting.clone());
        unit.commit().await
    }

    async fn find_casting(&self, casting_id: Uuid) -> StoreResult<Option<Casting>> {
        Ok(self.snapshot().castings.get(&casting_id).cloned())
    }

    async fn find_response(&self, response_id: Uuid) -> StoreResult<Option<Response>> {
        Ok(self.snapshot().responses.get(&response_id).cloned())
    }

    async fn find_application(
        &self,
        casting_id: Uuid,
        applicant_id: Uuid,
    ) -> StoreResult<Option<Response>> {
        Ok(self
            .snapshot()
            .responses
            .values()
            .find(|response| {
                response.casting_id == casting_id && response.applicant_id == applicant_id
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_unit_rolls_back() {
        let store = MemoryStore::new();
        let principal_id = Uuid::new_v4();
        {
            let mut unit = store.begin().await.unwrap();
            unit.lock_balance(LedgerKind::Credit, principal_id)
                .await
                .unwrap();
            unit.set_balance(LedgerKind::Credit, principal_id, 40, Utc::now())
                .await
                .unwrap();
        }
        let balance = store
            .provision_balance(LedgerKind::Credit, principal_id)
            .await
            .unwrap();
        assert_eq!(balance.balance, 0);
    }

    #[tokio::test]
    async fn held_unit_times_out_second_writer() {
        let store = MemoryStore::new().with_lock_timeout(Duration::from_millis(20));
        let _held = store.begin().await.unwrap();
        let err = store.begin().await.err().expect("writer permit is held");
        assert!(matches!(err, StoreError::LockTimeout));
    }

    #[tokio::test]
    async fn readers_do_not_wait_for_writers() {
        let store = MemoryStore::new().with_lock_timeout(Duration::from_millis(20));
        let principal_id = Uuid::new_v4();
        let _held = store.begin().await.unwrap();
        let sum = store
            .ledger_sum(LedgerKind::Wallet, principal_id)
            .await
            .unwrap();
        assert_eq!(sum, 0);

        let balance = store
            .provision_balance(LedgerKind::Wallet, principal_id)
            .await
            .unwrap();
        assert_eq!(balance.balance, 0);
        assert_eq!(balance.principal_id, principal_id);
    }
}
