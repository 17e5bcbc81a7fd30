//! Organization-scoped subscription routes
//!
//! Reachable regardless of subscription state so a lapsed school can see
//! why it is blocked, renew and report a payment.

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use schoolsaas_billing::{
    CreateRenewalRequest, CreatedRenewal, DiscountCode, PaymentRecord, PlanDetails, PriceQuote,
    PriceRequest, RenewalRequest, SubmitOutcome, SubmitPayment, SubscriptionHistoryEntry,
    SubscriptionStatusView, UsageCheck,
};
use schoolsaas_shared::{permissions, AccessLevel, Currency};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::ApiResult,
    extract::{AppJson, AppQuery},
    state::AppState,
};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

#[derive(Debug, Serialize)]
pub struct StatusLiteResponse {
    pub status: &'static str,
    pub access_level: AccessLevel,
    pub can_read: bool,
    pub can_write: bool,
}

/// Cheap status check polled by clients on every page load
pub async fn status_lite(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<StatusLiteResponse>> {
    let org_id = auth_user.authorization().require_org_id()?;
    let access = state.billing.entitlements.access(org_id).await?;

    Ok(Json(StatusLiteResponse {
        status: access.status_label(),
        access_level: access.access_level,
        can_read: access.can_read,
        can_write: access.can_write,
    }))
}

pub async fn status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionStatusView>> {
    let org_id = auth_user
        .authorization()
        .require_org_permission(permissions::SUBSCRIPTION_READ)?;
    Ok(Json(state.billing.subscriptions.status_view(org_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub resource_key: String,
    pub current: i64,
}

pub async fn usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppQuery(query): AppQuery<UsageQuery>,
) -> ApiResult<Json<UsageCheck>> {
    let org_id = auth_user
        .authorization()
        .require_org_permission(permissions::SUBSCRIPTION_READ)?;
    let check = state
        .billing
        .entitlements
        .check_usage(org_id, &query.resource_key, query.current)
        .await?;
    Ok(Json(check))
}

#[derive(Debug, Serialize)]
pub struct FeaturesResponse {
    pub features: Vec<String>,
}

pub async fn features(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<FeaturesResponse>> {
    let org_id = auth_user
        .authorization()
        .require_org_permission(permissions::SUBSCRIPTION_READ)?;
    let mut features = state.billing.entitlements.enabled_features(org_id).await?;
    features.sort();
    Ok(Json(FeaturesResponse { features }))
}

pub async fn plans(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<PlanDetails>>> {
    let org_id = auth_user.authorization().require_org_id()?;
    Ok(Json(state.billing.plans.list_available_plans(org_id).await?))
}

pub async fn calculate_price(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppJson(req): AppJson<PriceRequest>,
) -> ApiResult<Json<PriceQuote>> {
    let org_id = auth_user.authorization().require_org_id()?;
    Ok(Json(state.billing.pricing.calculate(org_id, &req).await?))
}

#[derive(Debug, Deserialize)]
pub struct ValidateDiscountRequest {
    pub code: String,
    pub plan_id: Uuid,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub additional_schools: i32,
}

#[derive(Debug, Serialize)]
pub struct ValidateDiscountResponse {
    pub valid: bool,
    pub discount: DiscountCode,
    pub quote: PriceQuote,
}

/// Rejections surface as 422 with a machine-readable `reason`
pub async fn validate_discount(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppJson(req): AppJson<ValidateDiscountRequest>,
) -> ApiResult<Json<ValidateDiscountResponse>> {
    let org_id = auth_user.authorization().require_org_id()?;
    let discount = state
        .billing
        .discounts
        .validate_code(org_id, &req.code, req.plan_id, req.currency)
        .await?;
    let quote = state
        .billing
        .pricing
        .calculate(
            org_id,
            &PriceRequest {
                plan_id: req.plan_id,
                currency: req.currency,
                additional_schools: req.additional_schools,
                discount_code: Some(req.code),
            },
        )
        .await?;

    Ok(Json(ValidateDiscountResponse {
        valid: true,
        discount,
        quote,
    }))
}

pub async fn create_renewal_request(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppJson(req): AppJson<CreateRenewalRequest>,
) -> ApiResult<(StatusCode, Json<CreatedRenewal>)> {
    let created = state
        .billing
        .renewals
        .create_renewal_request(&auth_user.authorization(), req)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// 201 for a new payment, 200 when the renewal already had a pending one
pub async fn submit_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppJson(req): AppJson<SubmitPayment>,
) -> ApiResult<(StatusCode, Json<SubmitOutcome>)> {
    let outcome = state
        .billing
        .payments
        .submit_payment(&auth_user.authorization(), req)
        .await?;
    let status = if outcome.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

pub async fn renewal_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<RenewalRequest>>> {
    let org_id = auth_user
        .authorization()
        .require_org_permission(permissions::SUBSCRIPTION_READ)?;
    Ok(Json(state.billing.renewals.renewal_history(org_id).await?))
}

pub async fn payment_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<PaymentRecord>>> {
    let org_id = auth_user
        .authorization()
        .require_org_permission(permissions::SUBSCRIPTION_READ)?;
    Ok(Json(state.billing.payments.payment_history(org_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub async fn history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> ApiResult<Json<Vec<SubscriptionHistoryEntry>>> {
    let org_id = auth_user
        .authorization()
        .require_org_permission(permissions::SUBSCRIPTION_READ)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.billing.history.list(org_id, limit).await?))
}
