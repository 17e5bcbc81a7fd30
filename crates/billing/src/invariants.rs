//! Billing Invariants Module
//!
//! Runnable consistency checks over subscriptions, renewals, payments and
//! discount counters. Checks only read. Each violation carries enough context
//! to find the offending rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected
    pub org_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Organization may have paid for access it does not have, or vice versa
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Counters drifted, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleCurrentRow {
    org_id: Uuid,
    current_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BrokenChainRow {
    subscription_id: Uuid,
    org_id: Uuid,
    is_current: bool,
    superseded_by: Option<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct UnboundPaymentRow {
    payment_id: Uuid,
    org_id: Uuid,
    renewal_request_id: Uuid,
    confirmed_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct DiscountUsageRow {
    discount_code_id: Uuid,
    code: String,
    current_uses: i32,
    max_uses: Option<i32>,
    recorded_uses: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ApprovedRenewalRow {
    renewal_id: Uuid,
    org_id: Uuid,
    payment_record_id: Option<Uuid>,
    payment_status: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingPaymentsRow {
    renewal_request_id: Uuid,
    org_id: Uuid,
    pending_count: i64,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_current_subscription().await?);
        violations.extend(self.check_superseded_chain().await?);
        violations.extend(self.check_confirmed_payment_bound().await?);
        violations.extend(self.check_discount_uses_within_cap().await?);
        violations.extend(self.check_approved_renewal_has_payment().await?);
        violations.extend(self.check_single_pending_payment_per_renewal().await?);

        let summary = InvariantCheckSummary::from_violations(now, violations);
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Billing invariants healthy");
        } else {
            tracing::error!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }
        Ok(summary)
    }

    /// Invariant 1: at most one current subscription per organization
    async fn check_single_current_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleCurrentRow> = sqlx::query_as(
            r#"
            SELECT organization_id AS org_id, COUNT(*) AS current_count
            FROM organization_subscriptions
            WHERE is_current
            GROUP BY organization_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_current_subscription".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Organization has {} current subscriptions (expected 1)",
                    row.current_count
                ),
                context: serde_json::json!({
                    "current_count": row.current_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: retired rows point at their replacement, current rows do not
    async fn check_superseded_chain(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BrokenChainRow> = sqlx::query_as(
            r#"
            SELECT id AS subscription_id, organization_id AS org_id, is_current, superseded_by
            FROM organization_subscriptions
            WHERE (NOT is_current AND superseded_by IS NULL)
               OR (is_current AND superseded_by IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "superseded_chain".to_string(),
                org_ids: vec![row.org_id],
                description: if row.is_current {
                    format!(
                        "Current subscription {} is marked as superseded",
                        row.subscription_id
                    )
                } else {
                    format!(
                        "Retired subscription {} has no replacement",
                        row.subscription_id
                    )
                },
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "is_current": row.is_current,
                    "superseded_by": row.superseded_by,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: a confirmed renewal payment activated a subscription
    async fn check_confirmed_payment_bound(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnboundPaymentRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, organization_id AS org_id, renewal_request_id, confirmed_at
            FROM payment_records
            WHERE status = 'confirmed'
              AND renewal_request_id IS NOT NULL
              AND subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "confirmed_payment_bound".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Confirmed payment {} did not activate a subscription",
                    row.payment_id
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "renewal_request_id": row.renewal_request_id,
                    "confirmed_at": row.confirmed_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: usage counters stay within the cap and match redemptions
    async fn check_discount_uses_within_cap(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DiscountUsageRow> = sqlx::query_as(
            r#"
            SELECT
                dc.id AS discount_code_id,
                dc.code,
                dc.current_uses,
                dc.max_uses,
                COUNT(u.id) AS recorded_uses
            FROM discount_codes dc
            LEFT JOIN discount_code_usage u ON u.discount_code_id = dc.id
            GROUP BY dc.id, dc.code, dc.current_uses, dc.max_uses
            HAVING (dc.max_uses IS NOT NULL AND dc.current_uses > dc.max_uses)
                OR dc.current_uses <> COUNT(u.id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let over_cap = matches!(row.max_uses, Some(max) if row.current_uses > max);
                InvariantViolation {
                    invariant: "discount_uses_within_cap".to_string(),
                    org_ids: vec![],
                    description: if over_cap {
                        format!("Discount code '{}' was used beyond its cap", row.code)
                    } else {
                        format!(
                            "Discount code '{}' counter ({}) does not match recorded redemptions ({})",
                            row.code, row.current_uses, row.recorded_uses
                        )
                    },
                    context: serde_json::json!({
                        "discount_code_id": row.discount_code_id,
                        "current_uses": row.current_uses,
                        "max_uses": row.max_uses,
                        "recorded_uses": row.recorded_uses,
                    }),
                    severity: if over_cap {
                        ViolationSeverity::Critical
                    } else {
                        ViolationSeverity::Medium
                    },
                }
            })
            .collect())
    }

    /// Invariant 5: approved renewals are backed by a confirmed payment
    async fn check_approved_renewal_has_payment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ApprovedRenewalRow> = sqlx::query_as(
            r#"
            SELECT
                r.id AS renewal_id,
                r.organization_id AS org_id,
                r.payment_record_id,
                p.status AS payment_status
            FROM renewal_requests r
            LEFT JOIN payment_records p ON p.id = r.payment_record_id
            WHERE r.status = 'approved'
              AND (p.id IS NULL OR p.status <> 'confirmed')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "approved_renewal_has_payment".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Approved renewal {} has no confirmed payment",
                    row.renewal_id
                ),
                context: serde_json::json!({
                    "renewal_id": row.renewal_id,
                    "payment_record_id": row.payment_record_id,
                    "payment_status": row.payment_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: at most one pending payment per renewal request
    async fn check_single_pending_payment_per_renewal(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PendingPaymentsRow> = sqlx::query_as(
            r#"
            SELECT renewal_request_id, organization_id AS org_id, COUNT(*) AS pending_count
            FROM payment_records
            WHERE status = 'pending' AND renewal_request_id IS NOT NULL
            GROUP BY renewal_request_id, organization_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_pending_payment_per_renewal".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Renewal {} has {} pending payments (expected at most 1)",
                    row.renewal_request_id, row.pending_count
                ),
                context: serde_json::json!({
                    "renewal_request_id": row.renewal_request_id,
                    "pending_count": row.pending_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_current_subscription" => self.check_single_current_subscription().await,
            "superseded_chain" => self.check_superseded_chain().await,
            "confirmed_payment_bound" => self.check_confirmed_payment_bound().await,
            "discount_uses_within_cap" => self.check_discount_uses_within_cap().await,
            "approved_renewal_has_payment" => self.check_approved_renewal_has_payment().await,
            "single_pending_payment_per_renewal" => {
                self.check_single_pending_payment_per_renewal().await
            }
            other => Err(BillingError::NotFound(format!(
                "Unknown invariant check '{}'",
                other
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_current_subscription",
            "superseded_chain",
            "confirmed_payment_bound",
            "discount_uses_within_cap",
            "approved_renewal_has_payment",
            "single_pending_payment_per_renewal",
        ]
    }
}
