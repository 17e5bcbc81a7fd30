//! Manual payment reconciliation
//!
//! Organizations report offline payments against a renewal request; an
//! operator confirms or rejects them. Confirmation is the only path from a
//! renewal request to an active subscription and runs as one transaction:
//!
//! 1. Lock the linked renewal request, then the payment row
//!    (confirmed → no-op, rejected → error)
//! 2. Mark the payment confirmed
//! 3. Approve the renewal request
//! 4. Retire the current subscription and insert the new active row
//! 5. Consume one use of the discount code, aborting if it ran out
//! 6. Record the redemption and bind the payment to the new subscription

use std::sync::Arc;

use schoolsaas_shared::{
    iso_date, permissions, Currency, PaymentMethod, PaymentStatus, RenewalStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::authz::AuthorizationContext;
use crate::discount::DiscountService;
use crate::entitlement::EntitlementCache;
use crate::error::{is_unique_violation, BillingError, BillingResult};
use crate::history::{HistoryAction, HistoryRecord, HistoryService};
use crate::plans::{Plan, PLAN_COLUMNS};
use crate::renewal::{lock_renewal, mark_renewal_rejected, RenewalRequest, RENEWAL_COLUMNS};
use crate::subscriptions::{
    ActivationParams, OrganizationSubscription, SubscriptionService, SUBSCRIPTION_COLUMNS,
};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub renewal_request_id: Option<Uuid>,
    /// Set when confirmation activated a subscription
    pub subscription_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    #[serde(with = "iso_date")]
    pub payment_date: Date,
    pub status: PaymentStatus,
    pub confirmed_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub confirmed_at: Option<OffsetDateTime>,
    pub discount_code_id: Option<Uuid>,
    pub discount_amount_cents: i64,
    pub notes: Option<String>,
    pub rejection_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const PAYMENT_COLUMNS: &str = r#"
    id, organization_id, renewal_request_id, subscription_id, amount_cents, currency,
    payment_method, payment_reference, payment_date, status, confirmed_by, confirmed_at,
    discount_code_id, discount_amount_cents, notes, rejection_reason, created_at
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitPayment {
    pub renewal_request_id: Uuid,
    pub amount_cents: i64,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    #[serde(with = "iso_date")]
    pub payment_date: Date,
    pub notes: Option<String>,
}

impl SubmitPayment {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount_cents < 0 {
            return Err(BillingError::validation("amount_cents", "must be >= 0"));
        }
        Ok(())
    }
}

/// Submission result; resubmitting against the same renewal is a no-op
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "payment", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Created(PaymentRecord),
    Existing(PaymentRecord),
}

impl SubmitOutcome {
    pub fn payment(&self) -> &PaymentRecord {
        match self {
            Self::Created(payment) | Self::Existing(payment) => payment,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed {
        payment: PaymentRecord,
        subscription: Option<OrganizationSubscription>,
    },
    /// Payment was confirmed earlier; nothing changed
    AlreadyConfirmed {
        payment: PaymentRecord,
        subscription: Option<OrganizationSubscription>,
    },
}

impl ConfirmOutcome {
    pub fn payment(&self) -> &PaymentRecord {
        match self {
            Self::Confirmed { payment, .. } | Self::AlreadyConfirmed { payment, .. } => payment,
        }
    }

    pub fn subscription(&self) -> Option<&OrganizationSubscription> {
        match self {
            Self::Confirmed { subscription, .. } | Self::AlreadyConfirmed { subscription, .. } => {
                subscription.as_ref()
            }
        }
    }
}

#[derive(Clone)]
pub struct PaymentService {
    pool: PgPool,
    cache: Arc<EntitlementCache>,
}

impl PaymentService {
    pub fn new(pool: PgPool, cache: Arc<EntitlementCache>) -> Self {
        Self { pool, cache }
    }

    pub async fn get(&self, payment_id: Uuid) -> BillingResult<PaymentRecord> {
        let payment: Option<PaymentRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_records WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        payment.ok_or_else(|| BillingError::NotFound(format!("Payment {} not found", payment_id)))
    }

    pub async fn submit_payment(
        &self,
        ctx: &AuthorizationContext,
        submission: SubmitPayment,
    ) -> BillingResult<SubmitOutcome> {
        let org_id = ctx.require_org_permission(permissions::SUBSCRIPTION_RENEW)?;
        submission.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let renewal = lock_renewal(&mut tx, submission.renewal_request_id).await?;
        if renewal.organization_id != org_id {
            // Do not reveal other tenants' requests
            return Err(BillingError::NotFound(format!(
                "Renewal request {} not found",
                renewal.id
            )));
        }
        if renewal.status != RenewalStatus::Pending {
            return Err(BillingError::validation(
                "renewal_request_id",
                format!("renewal request is already {}", renewal.status),
            ));
        }
        if submission.currency != renewal.currency {
            return Err(BillingError::validation(
                "currency",
                format!("renewal request is priced in {}", renewal.currency),
            ));
        }

        let existing: Option<PaymentRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM payment_records
            WHERE renewal_request_id = $1 AND status = 'pending'
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(renewal.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        if let Some(payment) = existing {
            tracing::warn!(
                org_id = %org_id,
                renewal_id = %renewal.id,
                payment_id = %payment.id,
                "Payment already submitted for renewal request"
            );
            return Ok(SubmitOutcome::Existing(payment));
        }

        let result = sqlx::query_as::<_, PaymentRecord>(&format!(
            r#"
            INSERT INTO payment_records (
                organization_id, renewal_request_id, amount_cents, currency, payment_method,
                payment_reference, payment_date, discount_code_id, discount_amount_cents, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(org_id)
        .bind(renewal.id)
        .bind(submission.amount_cents)
        .bind(submission.currency)
        .bind(submission.payment_method)
        .bind(&submission.payment_reference)
        .bind(submission.payment_date)
        .bind(renewal.discount_code_id)
        .bind(renewal.discount_cents)
        .bind(&submission.notes)
        .fetch_one(&mut *tx)
        .await;

        let payment = match result {
            Ok(payment) => payment,
            Err(e) if is_unique_violation(&e, "idx_payment_records_one_pending") => {
                return Err(BillingError::ConcurrentModification(
                    "Payment submitted concurrently for this renewal request".to_string(),
                ));
            }
            Err(e) => return Err(BillingError::Database(e.to_string())),
        };

        sqlx::query("UPDATE renewal_requests SET payment_record_id = $2 WHERE id = $1")
            .bind(renewal.id)
            .bind(payment.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        if payment.amount_cents != renewal.total_cents {
            tracing::warn!(
                org_id = %org_id,
                payment_id = %payment.id,
                amount_cents = payment.amount_cents,
                expected_cents = renewal.total_cents,
                "Submitted amount differs from renewal quote"
            );
        }
        tracing::info!(
            org_id = %org_id,
            renewal_id = %renewal.id,
            payment_id = %payment.id,
            amount_cents = payment.amount_cents,
            "Payment submitted"
        );
        Ok(SubmitOutcome::Created(payment))
    }

    pub async fn confirm_payment(
        &self,
        ctx: &AuthorizationContext,
        payment_id: Uuid,
    ) -> BillingResult<ConfirmOutcome> {
        ctx.require_platform_admin()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let (payment, renewal) = lock_payment_with_renewal(&mut tx, payment_id).await?;
        match payment.status {
            PaymentStatus::Confirmed => {
                let subscription = match payment.subscription_id {
                    Some(id) => Some(fetch_subscription(&mut tx, id).await?),
                    None => None,
                };
                tx.commit()
                    .await
                    .map_err(|e| BillingError::Database(e.to_string()))?;
                tracing::warn!(
                    payment_id = %payment.id,
                    org_id = %payment.organization_id,
                    "Payment already confirmed; returning existing result"
                );
                return Ok(ConfirmOutcome::AlreadyConfirmed {
                    payment,
                    subscription,
                });
            }
            PaymentStatus::Rejected => {
                return Err(BillingError::validation(
                    "payment_id",
                    "payment has been rejected",
                ));
            }
            PaymentStatus::Pending => {}
        }

        let now = OffsetDateTime::now_utc();
        let org_id = payment.organization_id;

        sqlx::query(
            r#"
            UPDATE payment_records SET
                status = 'confirmed',
                confirmed_by = $2,
                confirmed_at = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(ctx.user_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let mut subscription = None;
        if let Some(renewal) = renewal {
            if renewal.status != RenewalStatus::Pending {
                return Err(BillingError::validation(
                    "renewal_request",
                    format!("renewal request is already {}", renewal.status),
                ));
            }
            approve_renewal(&mut tx, &renewal, payment.id, ctx.user_id).await?;

            let plan: Plan = sqlx::query_as(&format!(
                "SELECT {} FROM subscription_plans WHERE id = $1",
                PLAN_COLUMNS
            ))
            .bind(renewal.requested_plan_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            let params = ActivationParams {
                plan_id: plan.id,
                currency: payment.currency,
                amount_paid_cents: payment.amount_cents,
                additional_schools: renewal.additional_schools,
                notes: payment.notes.clone(),
            };
            let activation = SubscriptionService::activate_in_tx(
                &mut tx,
                org_id,
                &plan,
                &params,
                Some(ctx.user_id),
                now,
            )
            .await?;

            if let Some(code_id) = payment.discount_code_id {
                let counter =
                    DiscountService::increment_usage_in_tx(&mut tx, code_id, org_id).await?;
                if let Some(rejection) = counter.rejection() {
                    tracing::warn!(
                        payment_id = %payment.id,
                        discount_code_id = %code_id,
                        reason = rejection.code(),
                        "Discount code no longer usable at confirmation; rolling back"
                    );
                    return Err(rejection.into());
                }
                DiscountService::record_redemption_in_tx(
                    &mut tx,
                    code_id,
                    org_id,
                    payment.id,
                    payment.discount_amount_cents,
                )
                .await?;
            }

            sqlx::query("UPDATE payment_records SET subscription_id = $2 WHERE id = $1")
                .bind(payment.id)
                .bind(activation.subscription.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;

            subscription = Some(activation.subscription);
        }

        HistoryService::log_in_tx(
            &mut tx,
            HistoryRecord::new(org_id, HistoryAction::PaymentConfirmed)
                .subscription(subscription.as_ref().map(|s| s.id))
                .performed_by(Some(ctx.user_id))
                .metadata(serde_json::json!({
                    "payment_id": payment.id,
                    "amount_cents": payment.amount_cents,
                    "currency": payment.currency,
                    "renewal_request_id": payment.renewal_request_id,
                })),
        )
        .await?;

        let confirmed = lock_payment(&mut tx, payment.id).await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.cache.invalidate(org_id).await;

        tracing::info!(
            org_id = %org_id,
            payment_id = %confirmed.id,
            subscription_id = ?confirmed.subscription_id,
            confirmed_by = %ctx.user_id,
            "Payment confirmed"
        );
        Ok(ConfirmOutcome::Confirmed {
            payment: confirmed,
            subscription,
        })
    }

    /// Reject a pending payment and the renewal request it was filed against
    pub async fn reject_payment(
        &self,
        ctx: &AuthorizationContext,
        payment_id: Uuid,
        reason: &str,
    ) -> BillingResult<PaymentRecord> {
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

        let (payment, renewal) = lock_payment_with_renewal(&mut tx, payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(BillingError::validation(
                "payment_id",
                format!("payment is already {}", payment.status),
            ));
        }

        let rejected: PaymentRecord = sqlx::query_as(&format!(
            r#"
            UPDATE payment_records SET
                status = 'rejected',
                rejection_reason = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment.id)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        if let Some(renewal) = renewal.filter(|r| r.status == RenewalStatus::Pending) {
            mark_renewal_rejected(&mut tx, renewal.id, ctx.user_id, reason).await?;
        }

        HistoryService::log_in_tx(
            &mut tx,
            HistoryRecord::new(payment.organization_id, HistoryAction::PaymentRejected)
                .performed_by(Some(ctx.user_id))
                .notes(reason)
                .metadata(serde_json::json!({
                    "payment_id": payment.id,
                    "renewal_request_id": payment.renewal_request_id,
                })),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            org_id = %payment.organization_id,
            payment_id = %payment.id,
            rejected_by = %ctx.user_id,
            "Payment rejected"
        );
        Ok(rejected)
    }

    pub async fn list_pending(&self, ctx: &AuthorizationContext) -> BillingResult<Vec<PaymentRecord>> {
        ctx.require_platform_admin()?;
        let payments: Vec<PaymentRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM payment_records
            WHERE status = 'pending'
            ORDER BY created_at
            "#,
            PAYMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    pub async fn payment_history(&self, org_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let payments: Vec<PaymentRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM payment_records
            WHERE organization_id = $1
            ORDER BY created_at DESC
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }
}

/// Lock a payment together with its renewal request.
///
/// Renewal row first, then payment row. `reject_renewal` and
/// `submit_payment` take the same order.
async fn lock_payment_with_renewal(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    payment_id: Uuid,
) -> BillingResult<(PaymentRecord, Option<RenewalRequest>)> {
    let renewal_id: Option<Option<Uuid>> =
        sqlx::query_scalar("SELECT renewal_request_id FROM payment_records WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
    let renewal_id = renewal_id
        .ok_or_else(|| BillingError::NotFound(format!("Payment {} not found", payment_id)))?;

    let renewal = match renewal_id {
        Some(id) => Some(lock_renewal(tx, id).await?),
        None => None,
    };
    let payment = lock_payment(tx, payment_id).await?;
    Ok((payment, renewal))
}

async fn lock_payment(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    payment_id: Uuid,
) -> BillingResult<PaymentRecord> {
    let payment: Option<PaymentRecord> = sqlx::query_as(&format!(
        "SELECT {} FROM payment_records WHERE id = $1 FOR UPDATE",
        PAYMENT_COLUMNS
    ))
    .bind(payment_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| BillingError::Database(e.to_string()))?;

    payment.ok_or_else(|| BillingError::NotFound(format!("Payment {} not found", payment_id)))
}

async fn approve_renewal(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    renewal: &RenewalRequest,
    payment_id: Uuid,
    processed_by: Uuid,
) -> BillingResult<RenewalRequest> {
    let approved: RenewalRequest = sqlx::query_as(&format!(
        r#"
        UPDATE renewal_requests SET
            status = 'approved',
            payment_record_id = $2,
            processed_by = $3,
            processed_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        RENEWAL_COLUMNS
    ))
    .bind(renewal.id)
    .bind(payment_id)
    .bind(processed_by)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| BillingError::Database(e.to_string()))?;
    Ok(approved)
}

async fn fetch_subscription(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    subscription_id: Uuid,
) -> BillingResult<OrganizationSubscription> {
    let sub: OrganizationSubscription = sqlx::query_as(&format!(
        "SELECT {} FROM organization_subscriptions WHERE id = $1",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(subscription_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| BillingError::Database(e.to_string()))?;
    Ok(sub)
}
