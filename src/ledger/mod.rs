pub mod api;
pub mod models;
pub mod service;

pub use models::{
    ApplyOutcome, ApplyRequest, Balance, LedgerKind, LedgerTransaction, Page,
    ReconciliationReport, RelatedEntity, TransactionFilter, TransactionKind,
};
pub use service::{Ledger, LedgerError};
