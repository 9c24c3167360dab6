use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, UnitOfWork};
use crate::applications::models::{Casting, CastingRow, Response, ResponseRow, ResponseStatus};
use crate::ledger::models::{
    Balance, LedgerKind, LedgerTransaction, Page, TransactionFilter, TransactionKind,
    TransactionRow,
};
use crate::limits::models::{LimitKey, LimitOverride, LimitOverrideRow};

const TRANSACTION_COLUMNS: &str = "id, principal_id, delta, kind, reference, related_entity_type, related_entity_id, description, created_at";
const CASTING_COLUMNS: &str = "id, owner_id, title, status, required_headcount, accepted_count, min_age, max_age, gender, city, application_deadline, created_at, updated_at";
const RESPONSE_COLUMNS: &str =
    "id, casting_id, applicant_id, status, cover_letter, charged_amount, rejected_from, created_at, updated_at";

/// Postgres SQLSTATE raised when `lock_timeout` elapses.
const LOCK_NOT_AVAILABLE: &str = "55P03";

fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            return StoreError::LockTimeout;
        }
    }
    StoreError::Database(err)
}

fn convert<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = String>,
{
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(StoreError::Corrupt))
        .collect()
}

/// key: pg-store -> row-level locking over `PgPool`
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub struct PgUnitOfWork {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    fn tx(&mut self) -> StoreResult<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(StoreError::Finished)
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_balance(&mut self, ledger: LedgerKind, principal_id: Uuid) -> StoreResult<i64> {
        let table = ledger.balance_table();
        let tx = self.tx()?;
        sqlx::query(&format!(
            "INSERT INTO {table} (principal_id, balance, updated_at) VALUES ($1, 0, NOW()) ON CONFLICT (principal_id) DO NOTHING"
        ))
        .bind(principal_id)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;

        let balance: i64 = sqlx::query_scalar(&format!(
            "SELECT balance FROM {table} WHERE principal_id = $1 FOR UPDATE"
        ))
        .bind(principal_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(balance)
    }

    async fn find_by_reference(
        &mut self,
        ledger: LedgerKind,
        principal_id: Uuid,
        kind: TransactionKind,
        reference: &str,
    ) -> StoreResult<Option<LedgerTransaction>> {
        let table = ledger.transaction_table();
        let tx = self.tx()?;
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM {table} WHERE principal_id = $1 AND kind = $2 AND reference = $3"
        ))
        .bind(principal_id)
        .bind(kind.as_str())
        .bind(reference)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify)?;
        row.map(|row| LedgerTransaction::try_from(row).map_err(StoreError::Corrupt))
            .transpose()
    }

    async fn has_related_transaction(
        &mut self,
        ledger: LedgerKind,
        kind: TransactionKind,
        related_entity_id: Uuid,
    ) -> StoreResult<bool> {
        let table = ledger.transaction_table();
        let tx = self.tx()?;
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {table} WHERE kind = $1 AND related_entity_id = $2)"
        ))
        .bind(kind.as_str())
        .bind(related_entity_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(exists)
    }

    async fn append_transaction(
        &mut self,
        ledger: LedgerKind,
        transaction: &LedgerTransaction,
    ) -> StoreResult<bool> {
        let table = ledger.transaction_table();
        let tx = self.tx()?;
        let (related_type, related_id) = match &transaction.related_entity {
            Some(related) => (Some(related.entity_type.clone()), Some(related.entity_id)),
            None => (None, None),
        };
        let result = sqlx::query(&format!(
            "INSERT INTO {table} ({TRANSACTION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT (principal_id, kind, reference) DO NOTHING"
        ))
        .bind(transaction.id)
        .bind(transaction.principal_id)
        .bind(transaction.delta)
        .bind(transaction.kind.as_str())
        .bind(&transaction.reference)
        .bind(related_type)
        .bind(related_id)
        .bind(&transaction.description)
        .bind(transaction.created_at)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_balance(
        &mut self,
        ledger: LedgerKind,
        principal_id: Uuid,
        balance: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let table = ledger.balance_table();
        let tx = self.tx()?;
        sqlx::query(&format!(
            "UPDATE {table} SET balance = $1, updated_at = $2 WHERE principal_id = $3"
        ))
        .bind(balance)
        .bind(now)
        .bind(principal_id)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn insert_response(&mut self, response: &Response) -> StoreResult<bool> {
        let tx = self.tx()?;
        let result = sqlx::query(&format!(
            "INSERT INTO casting_responses ({RESPONSE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT (casting_id, applicant_id) DO NOTHING"
        ))
        .bind(response.id)
        .bind(response.casting_id)
        .bind(response.applicant_id)
        .bind(response.status.as_str())
        .bind(&response.cover_letter)
        .bind(response.charged_amount)
        .bind(response.rejected_from.map(|status| status.as_str()))
        .bind(response.created_at)
        .bind(response.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(result.rows_affected() == 1)
    }

    async fn lock_response(&mut self, response_id: Uuid) -> StoreResult<Option<Response>> {
        let tx = self.tx()?;
        let row = sqlx::query_as::<_, ResponseRow>(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM casting_responses WHERE id = $1 FOR UPDATE"
        ))
        .bind(response_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify)?;
        row.map(|row| Response::try_from(row).map_err(StoreError::Corrupt))
            .transpose()
    }

    async fn set_response_status(
        &mut self,
        response_id: Uuid,
        status: ResponseStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let tx = self.tx()?;
        // The right-hand `status` is the value before this update.
        sqlx::query(
            r#"
            UPDATE casting_responses
            SET status = $1,
                rejected_from = CASE WHEN $1 = 'rejected' THEN status ELSE rejected_from END,
                updated_at = $2
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(response_id)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn lock_override_total(
        &mut self,
        principal_id: Uuid,
        key: LimitKey,
    ) -> StoreResult<i64> {
        let tx = self.tx()?;
        // Overrides are append-only, so there is no row to lock; an advisory lock
        // scoped to the transaction stands in for one.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("limit_overrides:{principal_id}:{}", key.as_str()))
            .execute(&mut **tx)
            .await
            .map_err(classify)?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(delta), 0)::BIGINT FROM limit_overrides WHERE principal_id = $1 AND limit_key = $2",
        )
        .bind(principal_id)
        .bind(key.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(total)
    }

    async fn append_override(&mut self, record: &LimitOverride) -> StoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            "INSERT INTO limit_overrides (id, principal_id, limit_key, delta, reason, actor_id, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id)
        .bind(record.principal_id)
        .bind(record.limit_key.as_str())
        .bind(record.delta)
        .bind(&record.reason)
        .bind(record.actor_id)
        .bind(record.created_at)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn increment_accepted(
        &mut self,
        casting_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Casting>> {
        let tx = self.tx()?;
        // Under READ COMMITTED a concurrent updater re-evaluates the WHERE clause
        // against the committed row, so the guard holds without a prior read.
        let row = sqlx::query_as::<_, CastingRow>(&format!(
            r#"
            UPDATE castings
            SET accepted_count = accepted_count + 1,
                status = CASE
                    WHEN required_headcount IS NOT NULL AND accepted_count + 1 >= required_headcount
                        THEN 'closed'
                    ELSE status
                END,
                updated_at = $2
            WHERE id = $1
              AND status <> 'closed'
              AND (required_headcount IS NULL OR accepted_count < required_headcount)
            RETURNING {CASTING_COLUMNS}
            "#
        ))
        .bind(casting_id)
        .bind(now)
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify)?;
        row.map(|row| Casting::try_from(row).map_err(StoreError::Corrupt))
            .transpose()
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit().await.map_err(classify)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout_ms
        ))
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        Ok(Box::new(PgUnitOfWork { tx: Some(tx) }))
    }

    async fn provision_balance(
        &self,
        ledger: LedgerKind,
        principal_id: Uuid,
    ) -> StoreResult<Balance> {
        let table = ledger.balance_table();
        sqlx::query(&format!(
            "INSERT INTO {table} (principal_id, balance, updated_at) VALUES ($1, 0, NOW()) ON CONFLICT (principal_id) DO NOTHING"
        ))
        .bind(principal_id)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        let (balance, updated_at): (i64, DateTime<Utc>) = sqlx::query_as(&format!(
            "SELECT balance, updated_at FROM {table} WHERE principal_id = $1"
        ))
        .bind(principal_id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(Balance {
            principal_id,
            balance,
            updated_at,
        })
    }

    async fn list_transactions(
        &self,
        ledger: LedgerKind,
        principal_id: Uuid,
        page: Page,
    ) -> StoreResult<Vec<LedgerTransaction>> {
        let page = page.clamped();
        let table = ledger.transaction_table();
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM {table} WHERE principal_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(principal_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        convert(rows)
    }

    async fn search_transactions(
        &self,
        ledger: LedgerKind,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<LedgerTransaction>> {
        let page = filter.page.clamped();
        let table = ledger.transaction_table();
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM {table}
            WHERE ($1::uuid IS NULL OR principal_id = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::uuid IS NULL OR related_entity_id = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at < $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#
        ))
        .bind(filter.principal_id)
        .bind(filter.kind.map(|kind| kind.as_str()))
        .bind(filter.related_entity_id)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        convert(rows)
    }

    async fn has_transaction(
        &self,
        ledger: LedgerKind,
        kind: TransactionKind,
        related_entity_id: Uuid,
    ) -> StoreResult<bool> {
        let table = ledger.transaction_table();
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {table} WHERE kind = $1 AND related_entity_id = $2)"
        ))
        .bind(kind.as_str())
        .bind(related_entity_id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(exists)
    }

    async fn ledger_sum(&self, ledger: LedgerKind, principal_id: Uuid) -> StoreResult<i64> {
        let table = ledger.transaction_table();
        let sum: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(SUM(delta), 0)::BIGINT FROM {table} WHERE principal_id = $1"
        ))
        .bind(principal_id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(sum)
    }

    async fn override_total(&self, principal_id: Uuid, key: LimitKey) -> StoreResult<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(delta), 0)::BIGINT FROM limit_overrides WHERE principal_id = $1 AND limit_key = $2",
        )
        .bind(principal_id)
        .bind(key.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(total)
    }

    async fn list_overrides(
        &self,
        principal_id: Uuid,
        key: LimitKey,
    ) -> StoreResult<Vec<LimitOverride>> {
        let rows = sqlx::query_as::<_, LimitOverrideRow>(
            "SELECT id, principal_id, limit_key, delta, reason, actor_id, created_at FROM limit_overrides WHERE principal_id = $1 AND limit_key = $2 ORDER BY created_at DESC, id DESC",
        )
        .bind(principal_id)
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        convert(rows)
    }

    async fn count_responses(
        &self,
        applicant_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM casting_responses WHERE applicant_id = $1 AND created_at >= $2 AND created_at < $3",
        )
        .bind(applicant_id)
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;
        Ok(count)
    }

    async fn insert_casting(&self, casting: &Casting) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO castings ({CASTING_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(casting.id)
        .bind(casting.owner_id)
        .bind(&casting.title)
        .bind(casting.status.as_str())
        .bind(casting.required_headcount)
        .bind(casting.accepted_count)
        .bind(casting.requirements.min_age)
        .bind(casting.requirements.max_age)
        .bind(&casting.requirements.gender)
        .bind(&casting.requirements.city)
        .bind(casting.requirements.application_deadline)
        .bind(casting.created_at)
        .bind(casting.updated_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn find_casting(&self, casting_id: Uuid) -> StoreResult<Option<Casting>> {
        let row = sqlx::query_as::<_, CastingRow>(&format!(
            "SELECT {CASTING_COLUMNS} FROM castings WHERE id = $1"
        ))
        .bind(casting_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.map(|row| Casting::try_from(row).map_err(StoreError::Corrupt))
            .transpose()
    }

    async fn find_response(&self, response_id: Uuid) -> StoreResult<Option<Response>> {
        let row = sqlx::query_as::<_, ResponseRow>(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM casting_responses WHERE id = $1"
        ))
        .bind(response_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.map(|row| Response::try_from(row).map_err(StoreError::Corrupt))
            .transpose()
    }

    async fn find_application(
        &self,
        casting_id: Uuid,
        applicant_id: Uuid,
    ) -> StoreResult<Option<Response>> {
        let row = sqlx::query_as::<_, ResponseRow>(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM casting_responses WHERE casting_id = $1 AND applicant_id = $2"
        ))
        .bind(casting_id)
        .bind(applicant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.map(|row| Response::try_from(row).map_err(StoreError::Corrupt))
            .transpose()
    }
}
