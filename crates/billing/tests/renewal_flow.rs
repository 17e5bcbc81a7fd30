//! Renewal → payment → activation against a migrated PostgreSQL database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p schoolsaas-billing -- --ignored`

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::time::Duration as StdDuration;

use schoolsaas_billing::{
    ActivationParams, AuthorizationContext, BillingConfig, BillingError, BillingService,
    ConfirmOutcome, CreateRenewalRequest, DiscountRejection, NewDiscountCode, NewPlan, Plan,
    PlanUpdate, SubmitOutcome, SubmitPayment,
};
use schoolsaas_shared::{
    permissions, run_migrations, Currency, PaymentMethod, PaymentStatus, RenewalStatus,
    SubscriptionStatus,
};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

struct Harness {
    pool: PgPool,
    billing: BillingService,
    operator: AuthorizationContext,
}

async fn harness() -> Harness {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();

    Harness {
        billing: BillingService::new(pool.clone(), BillingConfig::default()),
        operator: AuthorizationContext::platform(
            Uuid::new_v4(),
            vec![permissions::SUBSCRIPTION_ADMIN.to_string()],
        ),
        pool,
    }
}

impl Harness {
    async fn organization(&self) -> (Uuid, AuthorizationContext) {
        let org_id: Uuid =
            sqlx::query_scalar("INSERT INTO organizations (name) VALUES ($1) RETURNING id")
                .bind(format!("School {}", Uuid::new_v4()))
                .fetch_one(&self.pool)
                .await
                .unwrap();
        let ctx = AuthorizationContext::organization(
            org_id,
            Uuid::new_v4(),
            vec![
                permissions::SUBSCRIPTION_READ.to_string(),
                permissions::SUBSCRIPTION_RENEW.to_string(),
            ],
        );
        (org_id, ctx)
    }

    /// 200 AFN per year plus 10 AFN per additional school
    async fn pro_plan(&self) -> Plan {
        let new_plan: NewPlan = serde_json::from_value(serde_json::json!({
            "slug": format!("pro-{}", Uuid::new_v4().simple()),
            "name": "Pro",
            "price_yearly_afn_cents": 20_000,
            "price_yearly_usd_cents": 250,
            "per_school_price_afn_cents": 1_000,
            "per_school_price_usd_cents": 12,
        }))
        .unwrap();
        self.billing
            .plans
            .create_plan(&self.operator, new_plan)
            .await
            .unwrap()
    }

    /// Percentage code with a unique name
    async fn discount_code(&self, percent_bps: i64, max_uses: Option<i32>, per_org: i32) -> String {
        let code = format!("SAVE{}", &Uuid::new_v4().simple().to_string()[..8]).to_uppercase();
        let new_code: NewDiscountCode = serde_json::from_value(serde_json::json!({
            "code": code,
            "name": "Test code",
            "discount_type": "percentage",
            "discount_value": percent_bps,
            "max_uses": max_uses,
            "max_uses_per_org": per_org,
        }))
        .unwrap();
        self.billing
            .discounts
            .create_code(&self.operator, new_code)
            .await
            .unwrap();
        code
    }

    async fn activate(&self, org_id: Uuid, plan: &Plan) {
        self.billing
            .subscriptions
            .activate(
                &self.operator,
                org_id,
                ActivationParams {
                    plan_id: plan.id,
                    currency: Currency::Afn,
                    amount_paid_cents: 20_000,
                    additional_schools: 0,
                    notes: None,
                },
            )
            .await
            .unwrap();
    }

    /// Renewal plus a submitted payment for the quoted total
    async fn pending_payment(
        &self,
        ctx: &AuthorizationContext,
        plan: &Plan,
        code: Option<&str>,
    ) -> (Uuid, Uuid) {
        let created = self
            .billing
            .renewals
            .create_renewal_request(ctx, renewal_for(plan, 0, code))
            .await
            .unwrap();
        let payment = self
            .submit(ctx, created.renewal.id, created.quote.total_cents)
            .await;
        (created.renewal.id, payment.payment().id)
    }

    async fn code_uses(&self, code: &str) -> i32 {
        sqlx::query_scalar("SELECT current_uses FROM discount_codes WHERE code = $1")
            .bind(code)
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn submit(&self, ctx: &AuthorizationContext, renewal_id: Uuid, amount: i64) -> SubmitOutcome {
        self.billing
            .payments
            .submit_payment(
                ctx,
                SubmitPayment {
                    renewal_request_id: renewal_id,
                    amount_cents: amount,
                    currency: Currency::Afn,
                    payment_method: PaymentMethod::BankTransfer,
                    payment_reference: Some("BANK-0042".to_string()),
                    payment_date: OffsetDateTime::now_utc().date(),
                    notes: None,
                },
            )
            .await
            .unwrap()
    }
}

fn renewal_for(plan: &Plan, schools: i32, code: Option<&str>) -> CreateRenewalRequest {
    CreateRenewalRequest {
        requested_plan_id: plan.id,
        additional_schools: schools,
        discount_code: code.map(str::to_string),
        currency: Currency::Afn,
        notes: None,
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_confirming_220_afn_payment_activates_pro() {
    let h = harness().await;
    let (org_id, ctx) = h.organization().await;
    h.billing
        .subscriptions
        .start_trial(&h.operator, org_id)
        .await
        .unwrap();
    let plan = h.pro_plan().await;

    let created = h
        .billing
        .renewals
        .create_renewal_request(&ctx, renewal_for(&plan, 2, None))
        .await
        .unwrap();
    assert_eq!(created.quote.total_cents, 22_000);

    let submitted = h.submit(&ctx, created.renewal.id, 22_000).await;
    assert!(submitted.is_created());

    let outcome = h
        .billing
        .payments
        .confirm_payment(&h.operator, submitted.payment().id)
        .await
        .unwrap();
    let subscription = outcome.subscription().cloned().unwrap();

    assert_eq!(subscription.plan_id, plan.id);
    assert_eq!(subscription.additional_schools, 2);
    assert_eq!(subscription.amount_paid_cents, 22_000);
    assert_eq!(
        subscription.effective_status(OffsetDateTime::now_utc()),
        SubscriptionStatus::Active
    );

    let view = h.billing.subscriptions.status_view(org_id).await.unwrap();
    assert_eq!(view.status, "active");
    assert_eq!(view.total_schools_allowed, 3);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_confirmation_is_idempotent() {
    let h = harness().await;
    let (org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;

    let created = h
        .billing
        .renewals
        .create_renewal_request(&ctx, renewal_for(&plan, 0, None))
        .await
        .unwrap();
    let payment_id = h.submit(&ctx, created.renewal.id, 20_000).await.payment().id;

    let first = h
        .billing
        .payments
        .confirm_payment(&h.operator, payment_id)
        .await
        .unwrap();
    let second = h
        .billing
        .payments
        .confirm_payment(&h.operator, payment_id)
        .await
        .unwrap();

    assert!(matches!(first, ConfirmOutcome::Confirmed { .. }));
    assert!(matches!(second, ConfirmOutcome::AlreadyConfirmed { .. }));
    assert_eq!(
        first.subscription().map(|s| s.id),
        second.subscription().map(|s| s.id)
    );

    let current_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM organization_subscriptions WHERE organization_id = $1 AND is_current",
    )
    .bind(org_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(current_rows, 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_resubmitting_returns_existing_payment() {
    let h = harness().await;
    let (_org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;

    let created = h
        .billing
        .renewals
        .create_renewal_request(&ctx, renewal_for(&plan, 1, None))
        .await
        .unwrap();

    let first = h.submit(&ctx, created.renewal.id, 21_000).await;
    let second = h.submit(&ctx, created.renewal.id, 21_000).await;

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.payment().id, second.payment().id);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_second_pending_renewal_rejected() {
    let h = harness().await;
    let (_org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;

    h.billing
        .renewals
        .create_renewal_request(&ctx, renewal_for(&plan, 0, None))
        .await
        .unwrap();
    let err = h
        .billing
        .renewals
        .create_renewal_request(&ctx, renewal_for(&plan, 0, None))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Validation { ref field, .. } if field == "renewal_request"));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_exhausted_code_rolls_back_confirmation() {
    let h = harness().await;
    let plan = h.pro_plan().await;
    let code = format!("ONCE{}", &Uuid::new_v4().simple().to_string()[..8]).to_uppercase();

    let new_code: NewDiscountCode = serde_json::from_value(serde_json::json!({
        "code": code,
        "name": "Single use",
        "discount_type": "percentage",
        "discount_value": 1_000,
        "max_uses": 1,
    }))
    .unwrap();
    h.billing
        .discounts
        .create_code(&h.operator, new_code)
        .await
        .unwrap();

    // Both organizations validate the code while it still has a use left
    let (org_a, ctx_a) = h.organization().await;
    let (org_b, ctx_b) = h.organization().await;
    let renewal_a = h
        .billing
        .renewals
        .create_renewal_request(&ctx_a, renewal_for(&plan, 0, Some(&code)))
        .await
        .unwrap();
    let renewal_b = h
        .billing
        .renewals
        .create_renewal_request(&ctx_b, renewal_for(&plan, 0, Some(&code)))
        .await
        .unwrap();
    assert_eq!(renewal_a.quote.total_cents, 18_000);

    let pay_a = h.submit(&ctx_a, renewal_a.renewal.id, 18_000).await.payment().id;
    let pay_b = h.submit(&ctx_b, renewal_b.renewal.id, 18_000).await.payment().id;

    h.billing
        .payments
        .confirm_payment(&h.operator, pay_a)
        .await
        .unwrap();
    let err = h
        .billing
        .payments
        .confirm_payment(&h.operator, pay_b)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::DiscountRejected(DiscountRejection::Exhausted)
    ));

    // Nothing from the failed confirmation survived
    let payment_b = h.billing.payments.get(pay_b).await.unwrap();
    assert_eq!(payment_b.status.to_string(), "pending");
    assert!(h
        .billing
        .subscriptions
        .current_subscription(org_b)
        .await
        .unwrap()
        .is_none());
    assert!(h
        .billing
        .subscriptions
        .current_subscription(org_a)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_retired_plan_cannot_be_activated() {
    let h = harness().await;
    let (org_id, _ctx) = h.organization().await;
    let plan = h.pro_plan().await;
    h.billing
        .plans
        .update_plan(
            &h.operator,
            plan.id,
            PlanUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = h
        .billing
        .subscriptions
        .activate(
            &h.operator,
            org_id,
            ActivationParams {
                plan_id: plan.id,
                currency: Currency::Afn,
                amount_paid_cents: 20_000,
                additional_schools: 0,
                notes: None,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Validation { ref field, .. } if field == "plan_id"));
    assert!(h
        .billing
        .subscriptions
        .current_subscription(org_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_plan_retired_before_confirmation_blocks_activation() {
    let h = harness().await;
    let (org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;
    let (_renewal_id, payment_id) = h.pending_payment(&ctx, &plan, None).await;

    h.billing
        .plans
        .update_plan(
            &h.operator,
            plan.id,
            PlanUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = h
        .billing
        .payments
        .confirm_payment(&h.operator, payment_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { ref field, .. } if field == "plan_id"));

    let payment = h.billing.payments.get(payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(h
        .billing
        .subscriptions
        .current_subscription(org_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_reject_renewal_rejects_its_pending_payment() {
    let h = harness().await;
    let (_org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;
    let (renewal_id, payment_id) = h.pending_payment(&ctx, &plan, None).await;

    let rejected = h
        .billing
        .renewals
        .reject_renewal(&h.operator, renewal_id, "Wrong bank account")
        .await
        .unwrap();
    assert_eq!(rejected.status, RenewalStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("Wrong bank account"));

    let payment = h.billing.payments.get(payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Rejected);

    let err = h
        .billing
        .payments
        .confirm_payment(&h.operator, payment_id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { .. }));

    // The school may ask again
    h.billing
        .renewals
        .create_renewal_request(&ctx, renewal_for(&plan, 0, None))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_reject_payment_rejects_its_renewal() {
    let h = harness().await;
    let (_org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;
    let (renewal_id, payment_id) = h.pending_payment(&ctx, &plan, None).await;

    let rejected = h
        .billing
        .payments
        .reject_payment(&h.operator, payment_id, "Transfer never arrived")
        .await
        .unwrap();
    assert_eq!(rejected.status, PaymentStatus::Rejected);

    let renewal = h.billing.renewals.get(renewal_id).await.unwrap();
    assert_eq!(renewal.status, RenewalStatus::Rejected);

    let err = h
        .billing
        .payments
        .reject_payment(&h.operator, payment_id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { ref field, .. } if field == "payment_id"));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_confirm_waits_for_renewal_lock_held_by_reject() {
    let h = harness().await;
    let (_org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;
    let (renewal_id, payment_id) = h.pending_payment(&ctx, &plan, None).await;

    // Take locks in the order reject_renewal does: renewal row, then payments
    let mut tx = h.pool.begin().await.unwrap();
    sqlx::query("SELECT id FROM renewal_requests WHERE id = $1 FOR UPDATE")
        .bind(renewal_id)
        .execute(&mut *tx)
        .await
        .unwrap();

    let billing = h.billing.clone();
    let operator = h.operator.clone();
    let confirm =
        tokio::spawn(async move { billing.payments.confirm_payment(&operator, payment_id).await });
    tokio::time::sleep(StdDuration::from_millis(500)).await;

    sqlx::query(
        "UPDATE payment_records SET status = 'rejected' WHERE renewal_request_id = $1 AND status = 'pending'",
    )
    .bind(renewal_id)
    .execute(&mut *tx)
    .await
    .unwrap();
    sqlx::query("UPDATE renewal_requests SET status = 'rejected' WHERE id = $1")
        .bind(renewal_id)
        .execute(&mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let err = confirm.await.unwrap().unwrap_err();
    assert!(
        matches!(err, BillingError::Validation { ref field, .. } if field == "payment_id"),
        "expected a validation error, got {err:?}"
    );
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_confirmations_activate_once() {
    let h = harness().await;
    let (org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;
    let code = h.discount_code(1_000, Some(10), 1).await;
    let (_renewal_id, payment_id) = h.pending_payment(&ctx, &plan, Some(&code)).await;

    let confirms = (0..4).map(|_| {
        let billing = h.billing.clone();
        let operator = h.operator.clone();
        tokio::spawn(async move { billing.payments.confirm_payment(&operator, payment_id).await })
    });
    let mut confirmed = 0;
    let mut already = 0;
    for handle in confirms.collect::<Vec<_>>() {
        match handle.await.unwrap().unwrap() {
            ConfirmOutcome::Confirmed { .. } => confirmed += 1,
            ConfirmOutcome::AlreadyConfirmed { .. } => already += 1,
        }
    }
    assert_eq!((confirmed, already), (1, 3));

    assert_eq!(h.code_uses(&code).await, 1);
    let redemptions: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM discount_code_usage WHERE organization_id = $1",
    )
    .bind(org_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(redemptions, 1);

    let subscriptions: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM organization_subscriptions WHERE organization_id = $1",
    )
    .bind(org_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(subscriptions, 1);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_org_cap_enforced_at_confirmation() {
    let h = harness().await;
    let (org_id, ctx) = h.organization().await;
    let plan = h.pro_plan().await;
    let code = h.discount_code(1_000, None, 1).await;
    let (_renewal_id, payment_id) = h.pending_payment(&ctx, &plan, Some(&code)).await;

    // A redemption for this organization lands after the quote was taken
    let earlier_payment: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO payment_records
            (organization_id, amount_cents, currency, payment_method, payment_date, status)
        VALUES ($1, 0, 'AFN', 'cash', CURRENT_DATE, 'confirmed')
        RETURNING id
        "#,
    )
    .bind(org_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    sqlx::query(
        r#"
        INSERT INTO discount_code_usage
            (discount_code_id, organization_id, payment_record_id, discount_applied_cents)
        SELECT id, $2, $3, 0 FROM discount_codes WHERE code = $1
        "#,
    )
    .bind(&code)
    .bind(org_id)
    .bind(earlier_payment)
    .execute(&h.pool)
    .await
    .unwrap();

    let err = h
        .billing
        .payments
        .confirm_payment(&h.operator, payment_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::DiscountRejected(DiscountRejection::OrgCapReached)
    ));

    assert_eq!(h.code_uses(&code).await, 0);
    let payment = h.billing.payments.get(payment_id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_suspension_and_cancellation_survive_status_sync() {
    let h = harness().await;
    let plan = h.pro_plan().await;
    let (suspended_org, _) = h.organization().await;
    let (cancelled_org, _) = h.organization().await;
    h.activate(suspended_org, &plan).await;
    h.activate(cancelled_org, &plan).await;

    h.billing
        .subscriptions
        .suspend(&h.operator, suspended_org, "Chargeback")
        .await
        .unwrap();
    h.billing
        .subscriptions
        .cancel(&h.operator, cancelled_org, "School closed")
        .await
        .unwrap();

    // Far past every window: a non-sticky row would be synced to expired
    let later = OffsetDateTime::now_utc() + Duration::days(800);
    h.billing
        .subscriptions
        .sync_stored_statuses(later)
        .await
        .unwrap();

    let suspended = h
        .billing
        .subscriptions
        .current_subscription(suspended_org)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(suspended.status, SubscriptionStatus::Suspended);
    assert_eq!(suspended.suspension_reason.as_deref(), Some("Chargeback"));
    assert_eq!(suspended.effective_status(later), SubscriptionStatus::Suspended);

    let cancelled = h
        .billing
        .subscriptions
        .current_subscription(cancelled_org)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    let view = h.billing.subscriptions.status_view(suspended_org).await.unwrap();
    assert_eq!(view.status, "suspended");
    assert!(!view.can_read);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_expiry_reminders_find_subscription_in_window() {
    let h = harness().await;
    let plan = h.pro_plan().await;
    let (org_id, _) = h.organization().await;
    h.activate(org_id, &plan).await;

    let sub = h
        .billing
        .subscriptions
        .current_subscription(org_id)
        .await
        .unwrap()
        .unwrap();

    // Thirty days and one hour before expiry
    let now = sub.expires_at - Duration::days(30) - Duration::hours(1);
    let reminders = h.billing.subscriptions.expiring_in(30, now).await.unwrap();
    let reminder = reminders
        .iter()
        .find(|r| r.organization_id == org_id)
        .expect("subscription due in 30 days");
    assert_eq!(reminder.subscription_id, sub.id);
    assert_eq!(reminder.expires_at, sub.expires_at);

    let too_early = h.billing.subscriptions.expiring_in(14, now).await.unwrap();
    assert!(too_early.iter().all(|r| r.organization_id != org_id));

    // Suspended schools get no reminder
    h.billing
        .subscriptions
        .suspend(&h.operator, org_id, "Under review")
        .await
        .unwrap();
    let reminders = h.billing.subscriptions.expiring_in(30, now).await.unwrap();
    assert!(reminders.iter().all(|r| r.organization_id != org_id));
}
