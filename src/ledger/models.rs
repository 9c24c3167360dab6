use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: ledger-kind -> wallet (self-service) and credit (money-backed) ledgers
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Wallet,
    Credit,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Wallet => "wallet",
            LedgerKind::Credit => "credit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wallet" => Some(LedgerKind::Wallet),
            "credit" | "credits" => Some(LedgerKind::Credit),
            _ => None,
        }
    }

    pub fn balance_table(&self) -> &'static str {
        match self {
            LedgerKind::Wallet => "wallet_balances",
            LedgerKind::Credit => "credit_balances",
        }
    }

    pub fn transaction_table(&self) -> &'static str {
        match self {
            LedgerKind::Wallet => "wallet_transactions",
            LedgerKind::Credit => "credit_transactions",
        }
    }

    /// Kind written by `Ledger::deduct`.
    pub fn deduct_kind(&self) -> TransactionKind {
        match self {
            LedgerKind::Wallet => TransactionKind::Payment,
            LedgerKind::Credit => TransactionKind::Deduction,
        }
    }

    /// Kind written by `Ledger::grant`.
    pub fn grant_kind(&self) -> TransactionKind {
        match self {
            LedgerKind::Wallet => TransactionKind::TopUp,
            LedgerKind::Credit => TransactionKind::AdminGrant,
        }
    }

    /// Wallet payments must always be replay-safe; credit deductions may omit a reference.
    pub fn deduction_requires_reference(&self) -> bool {
        matches!(self, LedgerKind::Wallet)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    TopUp,
    Payment,
    Refund,
    Deduction,
    Purchase,
    AdminGrant,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::TopUp => "top_up",
            TransactionKind::Payment => "payment",
            TransactionKind::Refund => "refund",
            TransactionKind::Deduction => "deduction",
            TransactionKind::Purchase => "purchase",
            TransactionKind::AdminGrant => "admin_grant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "top_up" => Some(TransactionKind::TopUp),
            "payment" => Some(TransactionKind::Payment),
            "refund" => Some(TransactionKind::Refund),
            "deduction" => Some(TransactionKind::Deduction),
            "purchase" => Some(TransactionKind::Purchase),
            "admin_grant" => Some(TransactionKind::AdminGrant),
            _ => None,
        }
    }

    pub fn permitted_on(&self, ledger: LedgerKind) -> bool {
        match ledger {
            LedgerKind::Wallet => matches!(
                self,
                TransactionKind::TopUp | TransactionKind::Payment | TransactionKind::Refund
            ),
            LedgerKind::Credit => matches!(
                self,
                TransactionKind::Deduction
                    | TransactionKind::Refund
                    | TransactionKind::Purchase
                    | TransactionKind::AdminGrant
            ),
        }
    }

    /// Whether `delta` carries the sign this kind implies. Admin grants may claw back.
    pub fn accepts_delta(&self, delta: i64) -> bool {
        if delta == 0 {
            return false;
        }
        match self {
            TransactionKind::Payment | TransactionKind::Deduction => delta < 0,
            TransactionKind::TopUp | TransactionKind::Refund | TransactionKind::Purchase => {
                delta > 0
            }
            TransactionKind::AdminGrant => true,
        }
    }
}

/// Business entity a transaction was written for (e.g. a casting response).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelatedEntity {
    pub entity_type: String,
    pub entity_id: Uuid,
}

impl RelatedEntity {
    pub fn response(response_id: Uuid) -> Self {
        Self {
            entity_type: "casting_response".to_string(),
            entity_id: response_id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balance {
    pub principal_id: Uuid,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

/// key: ledger-transaction -> append-only, immutable once written
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub delta: i64,
    pub kind: TransactionKind,
    pub reference: Option<String>,
    pub related_entity: Option<RelatedEntity>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct TransactionRow {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub delta: i64,
    pub kind: String,
    pub reference: Option<String>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<Uuid>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for LedgerTransaction {
    type Error = String;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let kind = TransactionKind::parse(&row.kind)
            .ok_or_else(|| format!("unknown transaction kind `{}`", row.kind))?;
        let related_entity = match (row.related_entity_type, row.related_entity_id) {
            (Some(entity_type), Some(entity_id)) => Some(RelatedEntity {
                entity_type,
                entity_id,
            }),
            _ => None,
        };
        Ok(LedgerTransaction {
            id: row.id,
            principal_id: row.principal_id,
            delta: row.delta,
            kind,
            reference: row.reference,
            related_entity,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

/// Input to `Ledger::apply`, the single mutating entry point.
#[derive(Clone, Debug)]
pub struct ApplyRequest {
    pub principal_id: Uuid,
    pub delta: i64,
    pub kind: TransactionKind,
    pub reference: Option<String>,
    pub related_entity: Option<RelatedEntity>,
    pub description: String,
}

impl ApplyRequest {
    pub fn new(principal_id: Uuid, delta: i64, kind: TransactionKind) -> Self {
        Self {
            principal_id,
            delta,
            kind,
            reference: None,
            related_entity: None,
            description: String::new(),
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_related(mut self, related: RelatedEntity) -> Self {
        self.related_entity = Some(related);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Blank references are treated as absent.
    pub(crate) fn normalized_reference(&self) -> Option<&str> {
        self.reference
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        transaction: LedgerTransaction,
        balance: i64,
    },
    /// Same reference, same delta: nothing new was written.
    Replayed {
        transaction: LedgerTransaction,
        balance: i64,
    },
}

impl ApplyOutcome {
    pub fn transaction(&self) -> &LedgerTransaction {
        match self {
            ApplyOutcome::Applied { transaction, .. } | ApplyOutcome::Replayed { transaction, .. } => {
                transaction
            }
        }
    }

    pub fn balance(&self) -> i64 {
        match self {
            ApplyOutcome::Applied { balance, .. } | ApplyOutcome::Replayed { balance, .. } => {
                *balance
            }
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, ApplyOutcome::Replayed { .. })
    }
}

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Page {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_LIMIT
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    pub fn clamped(self) -> Self {
        Self {
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
            offset: self.offset.max(0),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TransactionFilter {
    pub principal_id: Option<Uuid>,
    pub kind: Option<TransactionKind>,
    pub related_entity_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub page: Page,
}

impl TransactionFilter {
    pub fn matches(&self, transaction: &LedgerTransaction) -> bool {
        if let Some(principal_id) = self.principal_id {
            if transaction.principal_id != principal_id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if transaction.kind != kind {
                return false;
            }
        }
        if let Some(related_id) = self.related_entity_id {
            let linked = transaction
                .related_entity
                .as_ref()
                .map(|related| related.entity_id == related_id)
                .unwrap_or(false);
            if !linked {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if transaction.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if transaction.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// Conservation audit for a single principal.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub ledger: LedgerKind,
    pub principal_id: Uuid,
    pub balance: i64,
    pub ledger_sum: i64,
    pub consistent: bool,
}
