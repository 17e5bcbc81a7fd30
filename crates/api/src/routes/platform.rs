//! Platform operator routes
//!
//! Every handler requires `subscription.admin` granted under the platform
//! organization. Services enforce it; read-only handlers that go straight to
//! the catalog or checker enforce it here.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use schoolsaas_billing::{
    ActivationParams, AddonGrant, ConfirmOutcome, DiscountCode, FeatureAddon,
    InvariantCheckSummary, InvariantViolation, LimitOverride, LimitOverrideGrant,
    NewDiscountCode, NewPlan, OrganizationSubscription, PaymentRecord, Plan, PlanDetails,
    PlanLimit, PlanLimitInput, PlanUpdate, RenewalRequest,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, extract::AppJson, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

// =============================================================================
// Payments and renewals
// =============================================================================

pub async fn pending_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<PaymentRecord>>> {
    let payments = state
        .billing
        .payments
        .list_pending(&auth_user.authorization())
        .await?;
    Ok(Json(payments))
}

/// Confirming twice returns the original outcome, tagged `already_confirmed`
pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(payment_id): Path<Uuid>,
) -> ApiResult<Json<ConfirmOutcome>> {
    let outcome = state
        .billing
        .payments
        .confirm_payment(&auth_user.authorization(), payment_id)
        .await?;
    Ok(Json(outcome))
}

pub async fn reject_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(payment_id): Path<Uuid>,
    AppJson(req): AppJson<ReasonRequest>,
) -> ApiResult<Json<PaymentRecord>> {
    let payment = state
        .billing
        .payments
        .reject_payment(&auth_user.authorization(), payment_id, &req.reason)
        .await?;
    Ok(Json(payment))
}

pub async fn pending_renewals(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<RenewalRequest>>> {
    let renewals = state
        .billing
        .renewals
        .list_pending(&auth_user.authorization())
        .await?;
    Ok(Json(renewals))
}

pub async fn reject_renewal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(renewal_id): Path<Uuid>,
    AppJson(req): AppJson<ReasonRequest>,
) -> ApiResult<Json<RenewalRequest>> {
    let renewal = state
        .billing
        .renewals
        .reject_renewal(&auth_user.authorization(), renewal_id, &req.reason)
        .await?;
    Ok(Json(renewal))
}

// =============================================================================
// Subscriptions
// =============================================================================

pub async fn start_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<OrganizationSubscription>)> {
    let subscription = state
        .billing
        .subscriptions
        .start_trial(&auth_user.authorization(), org_id)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn activate_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    AppJson(params): AppJson<ActivationParams>,
) -> ApiResult<Json<OrganizationSubscription>> {
    let subscription = state
        .billing
        .subscriptions
        .activate(&auth_user.authorization(), org_id, params)
        .await?;
    Ok(Json(subscription))
}

pub async fn suspend_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    AppJson(req): AppJson<ReasonRequest>,
) -> ApiResult<Json<OrganizationSubscription>> {
    let subscription = state
        .billing
        .subscriptions
        .suspend(&auth_user.authorization(), org_id, &req.reason)
        .await?;
    Ok(Json(subscription))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    AppJson(req): AppJson<ReasonRequest>,
) -> ApiResult<Json<OrganizationSubscription>> {
    let subscription = state
        .billing
        .subscriptions
        .cancel(&auth_user.authorization(), org_id, &req.reason)
        .await?;
    Ok(Json(subscription))
}

pub async fn grant_addon(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    AppJson(grant): AppJson<AddonGrant>,
) -> ApiResult<(StatusCode, Json<FeatureAddon>)> {
    let addon = state
        .billing
        .entitlements
        .grant_feature_addon(&auth_user.authorization(), org_id, grant)
        .await?;
    Ok((StatusCode::CREATED, Json(addon)))
}

pub async fn grant_limit_override(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(org_id): Path<Uuid>,
    AppJson(grant): AppJson<LimitOverrideGrant>,
) -> ApiResult<(StatusCode, Json<LimitOverride>)> {
    let limit_override = state
        .billing
        .entitlements
        .grant_limit_override(&auth_user.authorization(), org_id, grant)
        .await?;
    Ok((StatusCode::CREATED, Json(limit_override)))
}

// =============================================================================
// Discount codes
// =============================================================================

pub async fn list_discount_codes(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<DiscountCode>>> {
    let codes = state
        .billing
        .discounts
        .list_codes(&auth_user.authorization())
        .await?;
    Ok(Json(codes))
}

pub async fn create_discount_code(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppJson(new_code): AppJson<NewDiscountCode>,
) -> ApiResult<(StatusCode, Json<DiscountCode>)> {
    let code = state
        .billing
        .discounts
        .create_code(&auth_user.authorization(), new_code)
        .await?;
    Ok((StatusCode::CREATED, Json(code)))
}

// =============================================================================
// Plans
// =============================================================================

pub async fn list_plans(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Plan>>> {
    auth_user.authorization().require_platform_admin()?;
    Ok(Json(state.billing.plans.list_plans(true).await?))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    AppJson(new_plan): AppJson<NewPlan>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    let plan = state
        .billing
        .plans
        .create_plan(&auth_user.authorization(), new_plan)
        .await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<PlanDetails>> {
    auth_user.authorization().require_platform_admin()?;
    Ok(Json(state.billing.plans.get_plan_details(plan_id).await?))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(plan_id): Path<Uuid>,
    AppJson(update): AppJson<PlanUpdate>,
) -> ApiResult<Json<Plan>> {
    let plan = state
        .billing
        .plans
        .update_plan(&auth_user.authorization(), plan_id, update)
        .await?;
    Ok(Json(plan))
}

#[derive(Debug, Deserialize)]
pub struct PlanFeaturesRequest {
    pub feature_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PlanFeaturesResponse {
    pub plan_id: Uuid,
    pub feature_keys: Vec<String>,
}

pub async fn set_plan_features(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(plan_id): Path<Uuid>,
    AppJson(req): AppJson<PlanFeaturesRequest>,
) -> ApiResult<Json<PlanFeaturesResponse>> {
    let feature_keys = state
        .billing
        .plans
        .set_plan_features(&auth_user.authorization(), plan_id, req.feature_keys)
        .await?;
    Ok(Json(PlanFeaturesResponse {
        plan_id,
        feature_keys,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PlanLimitsRequest {
    pub limits: Vec<PlanLimitInput>,
}

pub async fn set_plan_limits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(plan_id): Path<Uuid>,
    AppJson(req): AppJson<PlanLimitsRequest>,
) -> ApiResult<Json<Vec<PlanLimit>>> {
    let limits = state
        .billing
        .plans
        .set_plan_limits(&auth_user.authorization(), plan_id, req.limits)
        .await?;
    Ok(Json(limits))
}

// =============================================================================
// Invariants
// =============================================================================

pub async fn run_invariant_checks(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    auth_user.authorization().require_platform_admin()?;
    Ok(Json(state.billing.invariants.run_all_checks().await?))
}

/// Unknown check names are 404
pub async fn run_invariant_check(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(check): Path<String>,
) -> ApiResult<Json<Vec<InvariantViolation>>> {
    auth_user.authorization().require_platform_admin()?;
    Ok(Json(state.billing.invariants.run_check(&check).await?))
}
