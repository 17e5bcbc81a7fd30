//! Subscription state machine
//!
//! Owns the current entitlement row per organization. Each activation
//! retires the current row (`is_current = false`, `superseded_by = new id`)
//! and inserts a fresh one, so an organization's history is the chain of
//! superseded rows. The partial unique index on `(organization_id) WHERE
//! is_current` guarantees a single current row.

use std::sync::Arc;

use schoolsaas_shared::{AccessLevel, Currency, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::authz::AuthorizationContext;
use crate::entitlement::EntitlementCache;
use crate::error::{BillingError, BillingResult};
use crate::history::{HistoryAction, HistoryRecord, HistoryService};
use crate::plans::{Plan, PlanCatalog, PLAN_COLUMNS, TRIAL_PLAN_SLUG};
use crate::pricing;
use crate::status::{days_until, derive_status, status_message, AccessSnapshot, SubscriptionWindows};

/// Trial length when the trial plan does not set one
const DEFAULT_TRIAL_DAYS: i32 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrganizationSubscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    /// Stored status; see [`OrganizationSubscription::effective_status`]
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub grace_period_ends_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub readonly_period_ends_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub suspension_reason: Option<String>,
    pub auto_renew: bool,
    pub currency: Currency,
    pub amount_paid_cents: i64,
    pub additional_schools: i32,
    pub notes: Option<String>,
    pub is_current: bool,
    pub superseded_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub superseded_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl OrganizationSubscription {
    pub fn windows(&self) -> SubscriptionWindows {
        SubscriptionWindows {
            trial_ends_at: self.trial_ends_at,
            expires_at: self.expires_at,
            grace_period_ends_at: self.grace_period_ends_at,
            readonly_period_ends_at: self.readonly_period_ends_at,
        }
    }

    /// Status at `now`, derived from the stored windows
    pub fn effective_status(&self, now: OffsetDateTime) -> SubscriptionStatus {
        derive_status(self.status, &self.windows(), now)
    }
}

pub(crate) const SUBSCRIPTION_COLUMNS: &str = r#"
    id, organization_id, plan_id, status, started_at, expires_at, trial_ends_at,
    grace_period_ends_at, readonly_period_ends_at, cancelled_at, suspension_reason,
    auto_renew, currency, amount_paid_cents, additional_schools, notes,
    is_current, superseded_by, superseded_at, created_at
"#;

/// What a new subscription row should carry
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationParams {
    pub plan_id: Uuid,
    #[serde(default)]
    pub currency: Currency,
    pub amount_paid_cents: i64,
    #[serde(default)]
    pub additional_schools: i32,
    pub notes: Option<String>,
}

impl ActivationParams {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount_paid_cents < 0 {
            return Err(BillingError::validation("amount_paid_cents", "must be >= 0"));
        }
        if self.additional_schools < 0 {
            return Err(BillingError::validation(
                "additional_schools",
                "must be >= 0",
            ));
        }
        Ok(())
    }
}

/// Outcome of an activation inside a transaction
#[derive(Debug, Clone)]
pub struct Activation {
    pub subscription: OrganizationSubscription,
    pub action: HistoryAction,
    pub previous_subscription_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub max_schools: i32,
}

/// Detailed status shown on the organization's billing page
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatusView {
    pub status: &'static str,
    pub access_level: AccessLevel,
    pub message: String,
    pub can_read: bool,
    pub can_write: bool,
    pub plan: Option<PlanSummary>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_period_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub readonly_period_ends_at: Option<OffsetDateTime>,
    pub days_left: Option<i64>,
    pub trial_days_left: Option<i64>,
    pub is_trial: bool,
    pub additional_schools: i32,
    pub total_schools_allowed: i32,
}

impl SubscriptionStatusView {
    /// Pure assembly of the view at `now`
    pub fn build(
        subscription: Option<&OrganizationSubscription>,
        plan: Option<&Plan>,
        now: OffsetDateTime,
    ) -> Self {
        let Some(sub) = subscription else {
            let snapshot = AccessSnapshot::from_status(None);
            return Self {
                status: snapshot.status_label(),
                access_level: snapshot.access_level,
                message: status_message(None, None, None),
                can_read: false,
                can_write: false,
                plan: None,
                started_at: None,
                expires_at: None,
                trial_ends_at: None,
                grace_period_ends_at: None,
                readonly_period_ends_at: None,
                days_left: None,
                trial_days_left: None,
                is_trial: false,
                additional_schools: 0,
                total_schools_allowed: 0,
            };
        };

        let status = sub.effective_status(now);
        let snapshot = AccessSnapshot::from_status(Some(status));
        let is_trial = status == SubscriptionStatus::Trial;
        let trial_days_left = sub
            .trial_ends_at
            .filter(|_| is_trial)
            .map(|ends| days_until(ends, now));

        Self {
            status: snapshot.status_label(),
            access_level: snapshot.access_level,
            message: status_message(
                Some(status),
                trial_days_left,
                sub.suspension_reason.as_deref(),
            ),
            can_read: snapshot.can_read,
            can_write: snapshot.can_write,
            plan: plan.map(|p| PlanSummary {
                id: p.id,
                name: p.name.clone(),
                slug: p.slug.clone(),
                max_schools: p.max_schools,
            }),
            started_at: Some(sub.started_at),
            expires_at: Some(sub.expires_at),
            trial_ends_at: sub.trial_ends_at,
            grace_period_ends_at: Some(sub.grace_period_ends_at),
            readonly_period_ends_at: Some(sub.readonly_period_ends_at),
            days_left: Some(days_until(sub.expires_at, now)),
            trial_days_left,
            is_trial,
            additional_schools: sub.additional_schools,
            total_schools_allowed: plan
                .map_or(0, |p| p.max_schools)
                .saturating_add(sub.additional_schools),
        }
    }
}

/// A subscription whose expiry is a fixed number of days away
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExpiryReminder {
    pub subscription_id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    plans: PlanCatalog,
    cache: Arc<EntitlementCache>,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, plans: PlanCatalog, cache: Arc<EntitlementCache>) -> Self {
        Self { pool, plans, cache }
    }

    pub async fn current_subscription(
        &self,
        org_id: Uuid,
    ) -> BillingResult<Option<OrganizationSubscription>> {
        let sub: Option<OrganizationSubscription> = sqlx::query_as(&format!(
            "SELECT {} FROM organization_subscriptions WHERE organization_id = $1 AND is_current",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    pub async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<OrganizationSubscription> {
        let sub: Option<OrganizationSubscription> = sqlx::query_as(&format!(
            "SELECT {} FROM organization_subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or_else(|| {
            BillingError::NotFound(format!("Subscription {} not found", subscription_id))
        })
    }

    pub async fn status_view(&self, org_id: Uuid) -> BillingResult<SubscriptionStatusView> {
        let sub = self.current_subscription(org_id).await?;
        let plan = match &sub {
            Some(sub) => Some(self.plans.get_plan(sub.plan_id).await?),
            None => None,
        };
        Ok(SubscriptionStatusView::build(
            sub.as_ref(),
            plan.as_ref(),
            OffsetDateTime::now_utc(),
        ))
    }

    /// Put a new organization on the trial plan
    pub async fn start_trial(
        &self,
        ctx: &AuthorizationContext,
        org_id: Uuid,
    ) -> BillingResult<OrganizationSubscription> {
        ctx.require_platform_admin()?;
        let plan = self
            .plans
            .get_plan_by_slug(TRIAL_PLAN_SLUG)
            .await?
            .filter(|plan| plan.is_active)
            .ok_or_else(|| BillingError::NotFound("Trial plan not found".to_string()))?;
        let trial_days = if plan.trial_days > 0 {
            plan.trial_days
        } else {
            DEFAULT_TRIAL_DAYS
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        lock_organization(&mut tx, org_id).await?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM organization_subscriptions WHERE organization_id = $1 AND is_current",
        )
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        if existing.is_some() {
            return Err(BillingError::validation(
                "organization_id",
                "organization already has a subscription",
            ));
        }

        let now = OffsetDateTime::now_utc();
        let windows = SubscriptionWindows::for_trial(&plan, trial_days, now);

        let subscription: OrganizationSubscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO organization_subscriptions (
                organization_id, plan_id, status, started_at, expires_at, trial_ends_at,
                grace_period_ends_at, readonly_period_ends_at, currency, amount_paid_cents,
                additional_schools, is_current
            )
            VALUES ($1, $2, 'trial', $3, $4, $5, $6, $7, $8, 0, 0, TRUE)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(org_id)
        .bind(plan.id)
        .bind(now)
        .bind(windows.expires_at)
        .bind(windows.trial_ends_at)
        .bind(windows.grace_period_ends_at)
        .bind(windows.readonly_period_ends_at)
        .bind(Currency::default())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        HistoryService::log_in_tx(
            &mut tx,
            HistoryRecord::new(org_id, HistoryAction::TrialStarted)
                .subscription(Some(subscription.id))
                .plans(None, Some(plan.id))
                .statuses(None, Some(SubscriptionStatus::Trial))
                .performed_by(Some(ctx.user_id))
                .notes(format!("Trial started for {} days", trial_days)),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.cache.invalidate(org_id).await;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            trial_days = trial_days,
            "Trial subscription started"
        );
        Ok(subscription)
    }

    /// Operator activation without a payment record
    pub async fn activate(
        &self,
        ctx: &AuthorizationContext,
        org_id: Uuid,
        params: ActivationParams,
    ) -> BillingResult<OrganizationSubscription> {
        ctx.require_platform_admin()?;
        params.validate()?;
        let plan = self.plans.get_plan(params.plan_id).await?;
        plan.ensure_active()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let activation = Self::activate_in_tx(
            &mut tx,
            org_id,
            &plan,
            &params,
            Some(ctx.user_id),
            OffsetDateTime::now_utc(),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.cache.invalidate(org_id).await;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %activation.subscription.id,
            plan_id = %plan.id,
            action = %activation.action,
            activated_by = %ctx.user_id,
            "Subscription activated by operator"
        );
        Ok(activation.subscription)
    }

    /// Retire the organization's current row and insert an active one.
    ///
    /// Caller owns the transaction and must invalidate the entitlement cache
    /// after committing.
    pub(crate) async fn activate_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        org_id: Uuid,
        plan: &Plan,
        params: &ActivationParams,
        performed_by: Option<Uuid>,
        now: OffsetDateTime,
    ) -> BillingResult<Activation> {
        plan.ensure_active()?;
        lock_organization(tx, org_id).await?;

        let previous: Option<OrganizationSubscription> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM organization_subscriptions
            WHERE organization_id = $1 AND is_current
            FOR UPDATE
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(org_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let new_id = Uuid::new_v4();
        let windows = SubscriptionWindows::for_activation(plan, now);

        let mut previous_total_cents = 0;
        if let Some(prev) = &previous {
            let prev_plan: Plan = sqlx::query_as(&format!(
                "SELECT {} FROM subscription_plans WHERE id = $1",
                PLAN_COLUMNS
            ))
            .bind(prev.plan_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
            previous_total_cents = pricing::quote(
                &prev_plan,
                params.currency,
                prev.additional_schools,
                None,
                None,
            )?
            .subtotal_cents;

            sqlx::query(
                r#"
                UPDATE organization_subscriptions SET
                    is_current = FALSE,
                    superseded_by = $2,
                    superseded_at = $3,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(prev.id)
            .bind(new_id)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        }

        let new_total_cents =
            pricing::quote(plan, params.currency, params.additional_schools, None, None)?
                .subtotal_cents;
        let action = HistoryAction::for_plan_change(
            previous.as_ref().map(|p| p.plan_id),
            previous_total_cents,
            plan.id,
            new_total_cents,
        );

        let subscription: OrganizationSubscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO organization_subscriptions (
                id, organization_id, plan_id, status, started_at, expires_at,
                grace_period_ends_at, readonly_period_ends_at, currency,
                amount_paid_cents, additional_schools, notes, is_current
            )
            VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $8, $9, $10, $11, TRUE)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(new_id)
        .bind(org_id)
        .bind(plan.id)
        .bind(now)
        .bind(windows.expires_at)
        .bind(windows.grace_period_ends_at)
        .bind(windows.readonly_period_ends_at)
        .bind(params.currency)
        .bind(params.amount_paid_cents)
        .bind(params.additional_schools)
        .bind(&params.notes)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        HistoryService::log_in_tx(
            tx,
            HistoryRecord::new(org_id, action)
                .subscription(Some(subscription.id))
                .plans(previous.as_ref().map(|p| p.plan_id), Some(plan.id))
                .statuses(
                    previous.as_ref().map(|p| p.effective_status(now)),
                    Some(SubscriptionStatus::Active),
                )
                .performed_by(performed_by)
                .notes(format!("Subscription {} to {}", action, plan.name))
                .metadata(serde_json::json!({
                    "amount_paid_cents": params.amount_paid_cents,
                    "currency": params.currency,
                    "additional_schools": params.additional_schools,
                    "previous_subscription_id": previous.as_ref().map(|p| p.id),
                })),
        )
        .await?;

        Ok(Activation {
            subscription,
            action,
            previous_subscription_id: previous.map(|p| p.id),
        })
    }

    pub async fn suspend(
        &self,
        ctx: &AuthorizationContext,
        org_id: Uuid,
        reason: &str,
    ) -> BillingResult<OrganizationSubscription> {
        self.set_sticky_status(ctx, org_id, SubscriptionStatus::Suspended, reason)
            .await
    }

    pub async fn cancel(
        &self,
        ctx: &AuthorizationContext,
        org_id: Uuid,
        reason: &str,
    ) -> BillingResult<OrganizationSubscription> {
        self.set_sticky_status(ctx, org_id, SubscriptionStatus::Cancelled, reason)
            .await
    }

    async fn set_sticky_status(
        &self,
        ctx: &AuthorizationContext,
        org_id: Uuid,
        target: SubscriptionStatus,
        reason: &str,
    ) -> BillingResult<OrganizationSubscription> {
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

        // Same order as activation: organization, then its current row
        lock_organization(&mut tx, org_id).await?;

        let current: Option<OrganizationSubscription> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM organization_subscriptions
            WHERE organization_id = $1 AND is_current
            FOR UPDATE
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let current = current.ok_or_else(|| {
            BillingError::NotFound(format!("Organization {} has no subscription", org_id))
        })?;

        let now = OffsetDateTime::now_utc();
        let from_status = current.effective_status(now);

        let (action, updated) = match target {
            SubscriptionStatus::Suspended => {
                let updated: OrganizationSubscription = sqlx::query_as(&format!(
                    r#"
                    UPDATE organization_subscriptions SET
                        status = 'suspended',
                        suspension_reason = $2,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING {}
                    "#,
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(current.id)
                .bind(reason)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
                (HistoryAction::Suspended, updated)
            }
            SubscriptionStatus::Cancelled => {
                let updated: OrganizationSubscription = sqlx::query_as(&format!(
                    r#"
                    UPDATE organization_subscriptions SET
                        status = 'cancelled',
                        cancelled_at = $2,
                        auto_renew = FALSE,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING {}
                    "#,
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(current.id)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
                (HistoryAction::Cancelled, updated)
            }
            other => {
                return Err(BillingError::Internal(format!(
                    "{} is not an administrative status",
                    other
                )));
            }
        };

        HistoryService::log_in_tx(
            &mut tx,
            HistoryRecord::new(org_id, action)
                .subscription(Some(current.id))
                .plans(Some(current.plan_id), Some(current.plan_id))
                .statuses(Some(from_status), Some(target))
                .performed_by(Some(ctx.user_id))
                .notes(reason),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.cache.invalidate(org_id).await;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %updated.id,
            from_status = %from_status,
            to_status = %target,
            performed_by = %ctx.user_id,
            "Subscription status set by operator"
        );
        Ok(updated)
    }

    /// Current, non-sticky subscriptions expiring between `days_ahead` and
    /// `days_ahead + 1` days from `now`
    pub async fn expiring_in(
        &self,
        days_ahead: u32,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<ExpiryReminder>> {
        let window_start = now + Duration::days(i64::from(days_ahead));
        let window_end = window_start + Duration::days(1);

        let rows: Vec<ExpiryReminder> = sqlx::query_as(
            r#"
            SELECT id AS subscription_id, organization_id, plan_id, status, expires_at
            FROM organization_subscriptions
            WHERE is_current
              AND status NOT IN ('suspended', 'cancelled')
              AND expires_at >= $1
              AND expires_at < $2
            ORDER BY expires_at
            "#,
        )
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Write derived statuses back to the stored column so reporting queries
    /// see them. Reads never depend on this.
    pub async fn sync_stored_statuses(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let rows: Vec<OrganizationSubscription> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM organization_subscriptions
            WHERE is_current AND status NOT IN ('suspended', 'cancelled')
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut updated = 0;
        for sub in rows {
            let derived = sub.effective_status(now);
            if derived == sub.status {
                continue;
            }

            // Guarded by the old status so an operator change in between wins
            let rows_affected = sqlx::query(
                r#"
                UPDATE organization_subscriptions SET status = $3, updated_at = NOW()
                WHERE id = $1 AND status = $2 AND is_current
                "#,
            )
            .bind(sub.id)
            .bind(sub.status)
            .bind(derived)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if rows_affected > 0 {
                updated += rows_affected;
                self.cache.invalidate(sub.organization_id).await;
                tracing::debug!(
                    org_id = %sub.organization_id,
                    from_status = %sub.status,
                    to_status = %derived,
                    "Stored subscription status synced"
                );
            }
        }
        Ok(updated)
    }
}

/// Serialize writers per organization, including ones without a subscription
pub(crate) async fn lock_organization(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    org_id: Uuid,
) -> BillingResult<()> {
    let found: Option<Uuid> =
        sqlx::query_scalar("SELECT id FROM organizations WHERE id = $1 FOR UPDATE")
            .bind(org_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

    found
        .map(|_| ())
        .ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", org_id)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plans::tests::plan_fixture;
    use time::macros::datetime;

    pub(crate) fn subscription_fixture(
        plan: &Plan,
        status: SubscriptionStatus,
        started_at: OffsetDateTime,
    ) -> OrganizationSubscription {
        let windows = SubscriptionWindows::for_activation(plan, started_at);
        OrganizationSubscription {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            plan_id: plan.id,
            status,
            started_at,
            expires_at: windows.expires_at,
            trial_ends_at: None,
            grace_period_ends_at: windows.grace_period_ends_at,
            readonly_period_ends_at: windows.readonly_period_ends_at,
            cancelled_at: None,
            suspension_reason: None,
            auto_renew: false,
            currency: Currency::Afn,
            amount_paid_cents: 22_000,
            additional_schools: 2,
            notes: None,
            is_current: true,
            superseded_by: None,
            superseded_at: None,
            created_at: started_at,
        }
    }

    #[test]
    fn test_status_view_without_subscription() {
        let view = SubscriptionStatusView::build(None, None, OffsetDateTime::now_utc());
        assert_eq!(view.status, "none");
        assert_eq!(view.access_level, AccessLevel::None);
        assert!(!view.can_read);
        assert!(!view.can_write);
        assert!(view.plan.is_none());
        assert_eq!(view.message, "No active subscription");
    }

    #[test]
    fn test_status_view_active() {
        let plan = plan_fixture("pro", 20_000, 1_000);
        let sub = subscription_fixture(
            &plan,
            SubscriptionStatus::Active,
            datetime!(2026-01-01 00:00 UTC),
        );
        let view = SubscriptionStatusView::build(
            Some(&sub),
            Some(&plan),
            datetime!(2026-12-01 00:00 UTC),
        );

        assert_eq!(view.status, "active");
        assert_eq!(view.access_level, AccessLevel::Full);
        assert_eq!(view.days_left, Some(31));
        assert_eq!(view.trial_days_left, None);
        assert_eq!(view.total_schools_allowed, 3);
        assert_eq!(view.plan.as_ref().map(|p| p.slug.as_str()), Some("pro"));
    }

    #[test]
    fn test_status_view_grace_period() {
        let plan = plan_fixture("pro", 20_000, 1_000);
        let sub = subscription_fixture(
            &plan,
            SubscriptionStatus::Active,
            datetime!(2026-01-01 00:00 UTC),
        );
        let view = SubscriptionStatusView::build(
            Some(&sub),
            Some(&plan),
            datetime!(2027-01-05 00:00 UTC),
        );
        assert_eq!(view.status, "grace_period");
        assert!(view.can_write);
        assert_eq!(view.days_left, Some(0));
    }

    #[test]
    fn test_status_view_suspended_message() {
        let plan = plan_fixture("pro", 20_000, 1_000);
        let mut sub = subscription_fixture(
            &plan,
            SubscriptionStatus::Suspended,
            datetime!(2026-01-01 00:00 UTC),
        );
        sub.suspension_reason = Some("Chargeback".to_string());
        let view = SubscriptionStatusView::build(
            Some(&sub),
            Some(&plan),
            datetime!(2026-02-01 00:00 UTC),
        );
        assert_eq!(view.status, "suspended");
        assert_eq!(view.message, "Account suspended: Chargeback");
        assert!(!view.can_read);
    }

    fn lazy_service() -> SubscriptionService {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let cache = Arc::new(EntitlementCache::default());
        SubscriptionService::new(pool.clone(), PlanCatalog::new(pool, cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_trial_start_requires_platform_admin() {
        let school = AuthorizationContext::organization(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![schoolsaas_shared::permissions::SUBSCRIPTION_ADMIN.to_string()],
        );
        let err = lazy_service()
            .start_trial(&school, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));
    }

    #[test]
    fn test_school_allowance_saturates() {
        let mut plan = plan_fixture("district", 20_000, 1_000);
        plan.max_schools = i32::MAX;
        let sub = subscription_fixture(
            &plan,
            SubscriptionStatus::Active,
            datetime!(2026-01-01 00:00 UTC),
        );
        let view = SubscriptionStatusView::build(
            Some(&sub),
            Some(&plan),
            datetime!(2026-02-01 00:00 UTC),
        );
        assert_eq!(view.total_schools_allowed, i32::MAX);
    }

    #[test]
    fn test_activation_params_validation() {
        let params = ActivationParams {
            plan_id: Uuid::new_v4(),
            currency: Currency::Afn,
            amount_paid_cents: -5,
            additional_schools: 0,
            notes: None,
        };
        assert!(params.validate().is_err());
    }
}
