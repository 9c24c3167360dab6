//! Persistence seam for ledgers, limit overrides, castings and responses.
//!
//! All coordination happens in the backing store: a [`UnitOfWork`] is one atomic
//! unit that either commits every write or none of them. Dropping a unit without
//! calling [`UnitOfWork::commit`] rolls it back, which is also what happens when
//! the surrounding future is cancelled.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::applications::models::{Casting, Response, ResponseStatus};
use crate::ledger::models::{
    Balance, LedgerKind, LedgerTransaction, Page, TransactionFilter, TransactionKind,
};
use crate::limits::models::{LimitKey, LimitOverride};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("timed out waiting for a row lock")]
    LockTimeout,
    #[error("unit of work already finished")]
    Finished,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One open atomic unit. Row locks taken through it are held until commit or drop.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Locks the principal's balance row, provisioning a zero row first if absent.
    async fn lock_balance(&mut self, ledger: LedgerKind, principal_id: Uuid) -> StoreResult<i64>;

    async fn find_by_reference(
        &mut self,
        ledger: LedgerKind,
        principal_id: Uuid,
        kind: TransactionKind,
        reference: &str,
    ) -> StoreResult<Option<LedgerTransaction>>;

    async fn has_related_transaction(
        &mut self,
        ledger: LedgerKind,
        kind: TransactionKind,
        related_entity_id: Uuid,
    ) -> StoreResult<bool>;

    /// Returns `false` when (principal, kind, reference) is already taken.
    async fn append_transaction(
        &mut self,
        ledger: LedgerKind,
        transaction: &LedgerTransaction,
    ) -> StoreResult<bool>;

    async fn set_balance(
        &mut self,
        ledger: LedgerKind,
        principal_id: Uuid,
        balance: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Returns `false` when the applicant already responded to the casting.
    async fn insert_response(&mut self, response: &Response) -> StoreResult<bool>;

    async fn lock_response(&mut self, response_id: Uuid) -> StoreResult<Option<Response>>;

    async fn set_response_status(
        &mut self,
        response_id: Uuid,
        status: ResponseStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Serializes override writers for (principal, key) until the unit ends and
    /// returns the committed override total.
    async fn lock_override_total(
        &mut self,
        principal_id: Uuid,
        key: LimitKey,
    ) -> StoreResult<i64>;

    async fn append_override(&mut self, record: &LimitOverride) -> StoreResult<()>;

    /// Guarded increment of the casting's accepted count; closes the casting in the
    /// same write when it reaches the required headcount. `None` when the guard fails.
    async fn increment_accepted(
        &mut self,
        casting_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Casting>>;

    async fn commit(&mut self) -> StoreResult<()>;
}

/// Entry point to the backing store. Reads here take no locks.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;

    /// Current balance, zero for a principal that has never been written. Postgres
    /// provisions the row here; other stores may defer that to the first write.
    async fn provision_balance(
        &self,
        ledger: LedgerKind,
        principal_id: Uuid,
    ) -> StoreResult<Balance>;

    async fn list_transactions(
        &self,
        ledger: LedgerKind,
        principal_id: Uuid,
        page: Page,
    ) -> StoreResult<Vec<LedgerTransaction>>;

    async fn search_transactions(
        &self,
        ledger: LedgerKind,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<LedgerTransaction>>;

    async fn has_transaction(
        &self,
        ledger: LedgerKind,
        kind: TransactionKind,
        related_entity_id: Uuid,
    ) -> StoreResult<bool>;

    async fn ledger_sum(&self, ledger: LedgerKind, principal_id: Uuid) -> StoreResult<i64>;

    async fn override_total(&self, principal_id: Uuid, key: LimitKey) -> StoreResult<i64>;

    async fn list_overrides(
        &self,
        principal_id: Uuid,
        key: LimitKey,
    ) -> StoreResult<Vec<LimitOverride>>;

    async fn count_responses(
        &self,
        applicant_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<i64>;

    async fn insert_casting(&self, casting: &Casting) -> StoreResult<()>;

    async fn find_casting(&self, casting_id: Uuid) -> StoreResult<Option<Casting>>;

    async fn find_response(&self, response_id: Uuid) -> StoreResult<Option<Response>>;

    async fn find_application(
        &self,
        casting_id: Uuid,
        applicant_id: Uuid,
    ) -> StoreResult<Option<Response>>;
}
