use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApplicationReceipt, ResponseStatus, TransitionReceipt};
use crate::error::{AppError, AppResult};
use crate::identity::Identity;
use crate::ledger::LedgerTransaction;
use crate::services::BillingServices;

/// key: applications-api -> respond to castings, move responses through review
pub async fn create_response(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path(casting_id): Path<Uuid>,
    Json(payload): Json<CreateResponseRequest>,
) -> AppResult<(StatusCode, Json<ApplicationReceipt>)> {
    let cover_letter = payload
        .cover_letter
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let receipt = services
        .applications
        .apply_to_casting(&identity, casting_id, cover_letter)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn update_status(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path(response_id): Path<Uuid>,
    Json(payload): Json<StatusUpdateRequest>,
) -> AppResult<Json<TransitionReceipt>> {
    let status = ResponseStatus::parse(&payload.status)
        .ok_or_else(|| AppError::BadRequest(format!("unknown status `{}`", payload.status)))?;
    let receipt = services
        .transitions
        .set_status(&identity, response_id, status)
        .await?;
    Ok(Json(receipt))
}

pub async fn settle_refund(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path(response_id): Path<Uuid>,
) -> AppResult<Json<RefundSettlement>> {
    identity.require_admin()?;
    let refund = services
        .transitions
        .settle_rejection_refund(response_id)
        .await?;
    Ok(Json(RefundSettlement {
        response_id,
        refund,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateResponseRequest {
    #[serde(default)]
    pub cover_letter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct RefundSettlement {
    pub response_id: Uuid,
    /// `None` when nothing was owed or the refund already exists.
    pub refund: Option<LedgerTransaction>,
}
