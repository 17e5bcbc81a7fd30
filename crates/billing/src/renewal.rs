//! Renewal requests
//!
//! An organization asks for a plan; the quote is frozen on the request so the
//! amount confirmed later is the amount the organization saw.

use schoolsaas_shared::{permissions, Currency, RenewalStatus};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::authz::AuthorizationContext;
use crate::error::{is_unique_violation, BillingError, BillingResult};
use crate::history::{HistoryAction, HistoryRecord, HistoryService};
use crate::pricing::{PriceCalculator, PriceQuote, PriceRequest};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RenewalRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Subscription current when the request was made
    pub subscription_id: Option<Uuid>,
    pub requested_plan_id: Uuid,
    pub additional_schools: i32,
    pub discount_code_id: Option<Uuid>,
    pub currency: Currency,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub status: RenewalStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    pub processed_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    pub payment_record_id: Option<Uuid>,
    pub rejection_reason: Option<String>,
    pub notes: Option<String>,
}

pub(crate) const RENEWAL_COLUMNS: &str = r#"
    id, organization_id, subscription_id, requested_plan_id, additional_schools,
    discount_code_id, currency, subtotal_cents, discount_cents, total_cents, status,
    requested_at, processed_by, processed_at, payment_record_id, rejection_reason, notes
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRenewalRequest {
    pub requested_plan_id: Uuid,
    #[serde(default)]
    pub additional_schools: i32,
    pub discount_code: Option<String>,
    #[serde(default)]
    pub currency: Currency,
    pub notes: Option<String>,
}

impl CreateRenewalRequest {
    fn price_request(&self) -> PriceRequest {
        PriceRequest {
            plan_id: self.requested_plan_id,
            currency: self.currency,
            additional_schools: self.additional_schools,
            discount_code: self.discount_code.clone(),
        }
    }
}

/// A new request together with the quote it was created from
#[derive(Debug, Clone, Serialize)]
pub struct CreatedRenewal {
    pub renewal: RenewalRequest,
    pub quote: PriceQuote,
}

#[derive(Clone)]
pub struct RenewalService {
    pool: PgPool,
    pricing: PriceCalculator,
}

impl RenewalService {
    pub fn new(pool: PgPool, pricing: PriceCalculator) -> Self {
        Self { pool, pricing }
    }

    pub async fn get(&self, renewal_id: Uuid) -> BillingResult<RenewalRequest> {
        let renewal: Option<RenewalRequest> = sqlx::query_as(&format!(
            "SELECT {} FROM renewal_requests WHERE id = $1",
            RENEWAL_COLUMNS
        ))
        .bind(renewal_id)
        .fetch_optional(&self.pool)
        .await?;

        renewal.ok_or_else(|| {
            BillingError::NotFound(format!("Renewal request {} not found", renewal_id))
        })
    }

    pub async fn create_renewal_request(
        &self,
        ctx: &AuthorizationContext,
        request: CreateRenewalRequest,
    ) -> BillingResult<CreatedRenewal> {
        let org_id = ctx.require_org_permission(permissions::SUBSCRIPTION_RENEW)?;

        // Rejects unavailable plans, negative school counts and bad codes
        let quote = self
            .pricing
            .calculate(org_id, &request.price_request())
            .await?;

        let current_subscription_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM organization_subscriptions WHERE organization_id = $1 AND is_current",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let result = sqlx::query_as::<_, RenewalRequest>(&format!(
            r#"
            INSERT INTO renewal_requests (
                organization_id, subscription_id, requested_plan_id, additional_schools,
                discount_code_id, currency, subtotal_cents, discount_cents, total_cents, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            RENEWAL_COLUMNS
        ))
        .bind(org_id)
        .bind(current_subscription_id)
        .bind(quote.plan_id)
        .bind(quote.additional_schools)
        .bind(quote.discount_code_id)
        .bind(quote.currency)
        .bind(quote.subtotal_cents)
        .bind(quote.discount_cents)
        .bind(quote.total_cents)
        .bind(&request.notes)
        .fetch_one(&self.pool)
        .await;

        let renewal = match result {
            Ok(renewal) => renewal,
            Err(e) if is_unique_violation(&e, "idx_renewal_requests_one_pending") => {
                tracing::warn!(
                    org_id = %org_id,
                    "Renewal request rejected: another request is pending"
                );
                return Err(BillingError::validation(
                    "renewal_request",
                    "a renewal request is already pending",
                ));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            org_id = %org_id,
            renewal_id = %renewal.id,
            plan_id = %renewal.requested_plan_id,
            total_cents = renewal.total_cents,
            currency = %renewal.currency,
            "Renewal request created"
        );
        Ok(CreatedRenewal { renewal, quote })
    }

    pub async fn list_pending(&self, ctx: &AuthorizationContext) -> BillingResult<Vec<RenewalRequest>> {
        ctx.require_platform_admin()?;
        let renewals: Vec<RenewalRequest> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM renewal_requests
            WHERE status = 'pending'
            ORDER BY requested_at
            "#,
            RENEWAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(renewals)
    }

    pub async fn renewal_history(&self, org_id: Uuid) -> BillingResult<Vec<RenewalRequest>> {
        let renewals: Vec<RenewalRequest> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM renewal_requests
            WHERE organization_id = $1
            ORDER BY requested_at DESC
            "#,
            RENEWAL_COLUMNS
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(renewals)
    }

    pub async fn reject_renewal(
        &self,
        ctx: &AuthorizationContext,
        renewal_id: Uuid,
        reason: &str,
    ) -> BillingResult<RenewalRequest> {
        ctx.require_platform_admin()?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BillingError::validation("reason", "must not be empty"));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let renewal = lock_renewal(&mut tx, renewal_id).await?;
        if renewal.status != RenewalStatus::Pending {
            return Err(BillingError::validation(
                "renewal_request",
                format!("renewal request is already {}", renewal.status),
            ));
        }

        let rejected = mark_renewal_rejected(&mut tx, renewal_id, ctx.user_id, reason).await?;

        // A pending payment for a rejected request can never be confirmed
        sqlx::query(
            r#"
            UPDATE payment_records SET
                status = 'rejected',
                rejection_reason = $2,
                updated_at = NOW()
            WHERE renewal_request_id = $1 AND status = 'pending'
            "#,
        )
        .bind(renewal_id)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        HistoryService::log_in_tx(
            &mut tx,
            HistoryRecord::new(rejected.organization_id, HistoryAction::RenewalRejected)
                .subscription(rejected.subscription_id)
                .plans(None, Some(rejected.requested_plan_id))
                .performed_by(Some(ctx.user_id))
                .notes(reason)
                .metadata(serde_json::json!({ "renewal_request_id": rejected.id })),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %rejected.organization_id,
            renewal_id = %rejected.id,
            rejected_by = %ctx.user_id,
            "Renewal request rejected"
        );
        Ok(rejected)
    }
}

pub(crate) async fn lock_renewal(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    renewal_id: Uuid,
) -> BillingResult<RenewalRequest> {
    let renewal: Option<RenewalRequest> = sqlx::query_as(&format!(
        "SELECT {} FROM renewal_requests WHERE id = $1 FOR UPDATE",
        RENEWAL_COLUMNS
    ))
    .bind(renewal_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| BillingError::Database(e.to_string()))?;

    renewal.ok_or_else(|| {
        BillingError::NotFound(format!("Renewal request {} not found", renewal_id))
    })
}

pub(crate) async fn mark_renewal_rejected(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    renewal_id: Uuid,
    processed_by: Uuid,
    reason: &str,
) -> BillingResult<RenewalRequest> {
    let renewal: RenewalRequest = sqlx::query_as(&format!(
        r#"
        UPDATE renewal_requests SET
            status = 'rejected',
            rejection_reason = $2,
            processed_by = $3,
            processed_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        RENEWAL_COLUMNS
    ))
    .bind(renewal_id)
    .bind(reason)
    .bind(processed_by)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| BillingError::Database(e.to_string()))?;
    Ok(renewal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_defaults() {
        let json = serde_json::json!({
            "requested_plan_id": Uuid::nil(),
        });
        let request: CreateRenewalRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.additional_schools, 0);
        assert_eq!(request.currency, Currency::Afn);
        assert!(request.discount_code.is_none());

        let price = request.price_request();
        assert_eq!(price.plan_id, Uuid::nil());
        assert_eq!(price.additional_schools, 0);
    }

    #[test]
    fn test_create_request_with_code() {
        let json = serde_json::json!({
            "requested_plan_id": Uuid::nil(),
            "additional_schools": 2,
            "discount_code": "welcome",
            "currency": "USD",
        });
        let request: CreateRenewalRequest = serde_json::from_value(json).unwrap();
        let price = request.price_request();
        assert_eq!(price.currency, Currency::Usd);
        assert_eq!(price.discount_code.as_deref(), Some("welcome"));
    }
}
