//! Subscription audit trail
//!
//! Append-only. Rows are written inside the same transaction as the change
//! they describe, so a rolled-back activation leaves no history behind.

use schoolsaas_shared::SubscriptionStatus;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    TrialStarted,
    Activated,
    Renewed,
    Upgraded,
    Downgraded,
    Suspended,
    Cancelled,
    AddonAdded,
    LimitOverride,
    PaymentConfirmed,
    PaymentRejected,
    RenewalRejected,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::TrialStarted => "trial_started",
            HistoryAction::Activated => "activated",
            HistoryAction::Renewed => "renewed",
            HistoryAction::Upgraded => "upgraded",
            HistoryAction::Downgraded => "downgraded",
            HistoryAction::Suspended => "suspended",
            HistoryAction::Cancelled => "cancelled",
            HistoryAction::AddonAdded => "addon_added",
            HistoryAction::LimitOverride => "limit_override",
            HistoryAction::PaymentConfirmed => "payment_confirmed",
            HistoryAction::PaymentRejected => "payment_rejected",
            HistoryAction::RenewalRejected => "renewal_rejected",
        }
    }

    /// Classify a plan change by comparing what the old and new subscription cost
    pub fn for_plan_change(
        previous_plan_id: Option<Uuid>,
        previous_total_cents: i64,
        new_plan_id: Uuid,
        new_total_cents: i64,
    ) -> Self {
        match previous_plan_id {
            None => HistoryAction::Activated,
            Some(_) if new_total_cents > previous_total_cents => HistoryAction::Upgraded,
            Some(_) if new_total_cents < previous_total_cents => HistoryAction::Downgraded,
            Some(old) if old == new_plan_id => HistoryAction::Renewed,
            Some(_) => HistoryAction::Activated,
        }
    }
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionHistoryEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub action: HistoryAction,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: Option<SubscriptionStatus>,
    pub performed_by: Option<Uuid>,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A history row about to be written
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub action: HistoryAction,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: Option<SubscriptionStatus>,
    pub performed_by: Option<Uuid>,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
}

impl HistoryRecord {
    pub fn new(organization_id: Uuid, action: HistoryAction) -> Self {
        Self {
            organization_id,
            subscription_id: None,
            action,
            from_plan_id: None,
            to_plan_id: None,
            from_status: None,
            to_status: None,
            performed_by: None,
            notes: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn subscription(mut self, subscription_id: Option<Uuid>) -> Self {
        self.subscription_id = subscription_id;
        self
    }

    pub fn plans(mut self, from: Option<Uuid>, to: Option<Uuid>) -> Self {
        self.from_plan_id = from;
        self.to_plan_id = to;
        self
    }

    pub fn statuses(
        mut self,
        from: Option<SubscriptionStatus>,
        to: Option<SubscriptionStatus>,
    ) -> Self {
        self.from_status = from;
        self.to_status = to;
        self
    }

    pub fn performed_by(mut self, user_id: Option<Uuid>) -> Self {
        self.performed_by = user_id;
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Clone)]
pub struct HistoryService {
    pool: PgPool,
}

impl HistoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) async fn log_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: HistoryRecord,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_history (
                organization_id, subscription_id, action, from_plan_id, to_plan_id,
                from_status, to_status, performed_by, notes, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.organization_id)
        .bind(record.subscription_id)
        .bind(record.action)
        .bind(record.from_plan_id)
        .bind(record.to_plan_id)
        .bind(record.from_status)
        .bind(record.to_status)
        .bind(record.performed_by)
        .bind(&record.notes)
        .bind(&record.metadata)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(())
    }

    /// Most recent entries first
    pub async fn list(&self, org_id: Uuid, limit: i64) -> BillingResult<Vec<SubscriptionHistoryEntry>> {
        let entries: Vec<SubscriptionHistoryEntry> = sqlx::query_as(
            r#"
            SELECT id, organization_id, subscription_id, action, from_plan_id, to_plan_id,
                   from_status, to_status, performed_by, notes, metadata, created_at
            FROM subscription_history
            WHERE organization_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_change_classification() {
        let basic = Uuid::new_v4();
        let pro = Uuid::new_v4();

        assert_eq!(
            HistoryAction::for_plan_change(None, 0, pro, 20_000),
            HistoryAction::Activated
        );
        assert_eq!(
            HistoryAction::for_plan_change(Some(basic), 12_000, pro, 20_000),
            HistoryAction::Upgraded
        );
        assert_eq!(
            HistoryAction::for_plan_change(Some(pro), 20_000, basic, 12_000),
            HistoryAction::Downgraded
        );
        assert_eq!(
            HistoryAction::for_plan_change(Some(pro), 20_000, pro, 20_000),
            HistoryAction::Renewed
        );
    }

    #[test]
    fn test_record_builder() {
        let org = Uuid::new_v4();
        let record = HistoryRecord::new(org, HistoryAction::Suspended)
            .statuses(
                Some(SubscriptionStatus::Active),
                Some(SubscriptionStatus::Suspended),
            )
            .notes("Fraud review");

        assert_eq!(record.organization_id, org);
        assert_eq!(record.to_status, Some(SubscriptionStatus::Suspended));
        assert_eq!(record.notes.as_deref(), Some("Fraud review"));
        assert_eq!(record.metadata, serde_json::json!({}));
    }

    #[test]
    fn test_action_serialization() {
        assert_eq!(
            serde_json::to_string(&HistoryAction::PaymentConfirmed).unwrap(),
            "\"payment_confirmed\""
        );
        assert_eq!(HistoryAction::LimitOverride.to_string(), "limit_override");
    }
}
