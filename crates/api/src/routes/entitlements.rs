//! Entitlement queries for the rest of the platform
//!
//! Mounted behind the subscription access gate: a blocked school gets 402
//! here, a read-only school may look but not ask to create.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use schoolsaas_billing::{canonical_feature_key, LimitValue, UsageCheck};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiResult, extract::AppJson, state::AppState};

#[derive(Debug, Serialize)]
pub struct FeatureCheckResponse {
    pub feature_key: String,
    pub canonical_key: String,
    pub enabled: bool,
}

pub async fn check_feature(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(feature_key): Path<String>,
) -> ApiResult<Json<FeatureCheckResponse>> {
    let org_id = auth_user.authorization().require_org_id()?;
    let enabled = state
        .billing
        .entitlements
        .is_feature_enabled(org_id, &feature_key)
        .await?;

    Ok(Json(FeatureCheckResponse {
        canonical_key: canonical_feature_key(&feature_key).to_string(),
        feature_key,
        enabled,
    }))
}

#[derive(Debug, Serialize)]
pub struct LimitResponse {
    pub resource_key: String,
    pub limit: LimitValue,
}

pub async fn get_limit(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(resource_key): Path<String>,
) -> ApiResult<Json<LimitResponse>> {
    let org_id = auth_user.authorization().require_org_id()?;
    let limit = state
        .billing
        .entitlements
        .get_limit(org_id, &resource_key)
        .await?;
    Ok(Json(LimitResponse {
        resource_key,
        limit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckRequest {
    pub resource_key: String,
    pub current: i64,
}

/// Asked before creating a resource; `allowed` is false once the limit is hit
pub async fn check_create(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppJson(req): AppJson<CreateCheckRequest>,
) -> ApiResult<Json<UsageCheck>> {
    let org_id = auth_user.authorization().require_org_id()?;
    let check = state
        .billing
        .entitlements
        .check_usage(org_id, &req.resource_key, req.current)
        .await?;
    Ok(Json(check))
}
