use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::applications::{ApplicationError, TransitionError};
use crate::ledger::LedgerError;
use crate::limits::{LimitError, LimitExceeded};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{message}")]
    BillingRequired {
        message: String,
        balance: i64,
        required: i64,
        limit: LimitExceeded,
    },
    #[error("{0}")]
    Unprocessable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BillingRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self, status = status.as_u16(), "request rejected");
        }
        let body = match &self {
            AppError::BillingRequired {
                balance,
                required,
                limit,
                ..
            } => json!({
                "error": self.to_string(),
                "balance": balance,
                "required": required,
                "limit": limit,
            }),
            // Infrastructure details stay in the log.
            AppError::Internal(_) => json!({ "error": "internal error" }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidDelta { .. }
            | LedgerError::KindNotAllowed { .. }
            | LedgerError::MissingReference { .. }
            | LedgerError::Overflow { .. } => AppError::BadRequest(err.to_string()),
            LedgerError::InsufficientFunds { .. } | LedgerError::ReferenceConflict { .. } => {
                AppError::Conflict(err.to_string())
            }
            LedgerError::Store(err) => err.into(),
        }
    }
}

impl From<LimitError> for AppError {
    fn from(err: LimitError) -> Self {
        match err {
            LimitError::UnknownKey(_)
            | LimitError::MissingReason
            | LimitError::ZeroAdjustment
            | LimitError::InvalidTarget(_)
            | LimitError::Overflow { .. }
            | LimitError::Unbounded(_) => AppError::BadRequest(err.to_string()),
            LimitError::Exceeded(_) => AppError::Conflict(err.to_string()),
            LimitError::WouldGoNegative { .. } => AppError::Unprocessable(err.to_string()),
            LimitError::Store(err) => err.into(),
        }
    }
}

impl From<ApplicationError> for AppError {
    fn from(err: ApplicationError) -> Self {
        match err {
            ApplicationError::ProfileNotFound | ApplicationError::CastingNotFound => {
                AppError::NotFound(err.to_string())
            }
            ApplicationError::OwnCasting => AppError::Forbidden,
            ApplicationError::CastingNotActive
            | ApplicationError::DeadlinePassed(_)
            | ApplicationError::NotEligible(_) => AppError::BadRequest(err.to_string()),
            ApplicationError::AlreadyApplied => AppError::Conflict(err.to_string()),
            ApplicationError::BillingRequired {
                balance,
                required,
                ref limit,
            } => AppError::BillingRequired {
                message: err.to_string(),
                balance,
                required,
                limit: limit.clone(),
            },
            ApplicationError::Profiles(inner) => AppError::Internal(format!("{inner:#}")),
            ApplicationError::Limit(inner) => inner.into(),
            ApplicationError::Ledger(inner) => inner.into(),
            ApplicationError::Store(inner) => inner.into(),
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::ResponseNotFound | TransitionError::CastingNotFound => {
                AppError::NotFound(err.to_string())
            }
            TransitionError::Forbidden => AppError::Forbidden,
            TransitionError::InvalidStatusTransition { .. }
            | TransitionError::CastingFullOrClosed
            | TransitionError::NotRejected(_) => AppError::Conflict(err.to_string()),
            TransitionError::Ledger(inner) => inner.into(),
            TransitionError::Store(inner) => inner.into(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
