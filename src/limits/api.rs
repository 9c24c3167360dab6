use axum::{
    extract::{Extension, Path},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{LimitEvaluator, LimitOverride, LimitStatus};
use crate::error::AppResult;
use crate::identity::Identity;
use crate::services::BillingServices;

pub async fn get_status(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path(key): Path<String>,
) -> AppResult<Json<LimitStatus>> {
    let key = LimitEvaluator::parse_key(&key)?;
    let status = services.limits.status(identity.principal_id, key).await?;
    Ok(Json(status))
}

pub async fn adjust_override(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path((principal_id, key)): Path<(Uuid, String)>,
    Json(payload): Json<AdjustRequest>,
) -> AppResult<Json<LimitStatus>> {
    identity.require_admin()?;
    let key = LimitEvaluator::parse_key(&key)?;
    let status = services
        .limits
        .adjust_override(
            identity.principal_id,
            principal_id,
            key,
            payload.delta,
            &payload.reason,
        )
        .await?;
    Ok(Json(status))
}

pub async fn set_limit(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path((principal_id, key)): Path<(Uuid, String)>,
    Json(payload): Json<SetLimitRequest>,
) -> AppResult<Json<LimitStatus>> {
    identity.require_admin()?;
    let key = LimitEvaluator::parse_key(&key)?;
    let status = services
        .limits
        .set_limit(
            identity.principal_id,
            principal_id,
            key,
            payload.value,
            &payload.reason,
        )
        .await?;
    Ok(Json(status))
}

pub async fn list_overrides(
    Extension(services): Extension<BillingServices>,
    identity: Identity,
    Path((principal_id, key)): Path<(Uuid, String)>,
) -> AppResult<Json<Vec<LimitOverride>>> {
    identity.require_admin()?;
    let key = LimitEvaluator::parse_key(&key)?;
    let overrides = services.limits.overrides(principal_id, key).await?;
    Ok(Json(overrides))
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub delta: i64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct SetLimitRequest {
    pub value: i64,
    pub reason: String,
}
