//! Plan catalog
//!
//! Plans are versioned by value, not by reference: a subscription snapshots
//! price, currency, school count and window end timestamps at activation, so
//! editing a plan here never changes a live subscription.

use std::sync::Arc;

use schoolsaas_shared::Currency;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::authz::AuthorizationContext;
use crate::entitlement::EntitlementCache;
use crate::error::{is_unique_violation, BillingError, BillingResult};

/// Slug of the plan new organizations start on
pub const TRIAL_PLAN_SLUG: &str = "trial";

/// Default usage warning threshold (percent of the limit)
pub const DEFAULT_WARNING_THRESHOLD: i32 = 80;

/// A resource limit: either a finite maximum or unlimited.
///
/// Stored as a nullable `BIGINT` where `NULL` means unlimited and serialized
/// the same way (`null`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<i64>", into = "Option<i64>")]
pub enum LimitValue {
    Unlimited,
    Max(i64),
}

impl LimitValue {
    /// The wider of two grants. Unlimited dominates any finite value.
    pub fn widen(self, other: LimitValue) -> LimitValue {
        match (self, other) {
            (LimitValue::Unlimited, _) | (_, LimitValue::Unlimited) => LimitValue::Unlimited,
            (LimitValue::Max(a), LimitValue::Max(b)) => LimitValue::Max(a.max(b)),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, LimitValue::Unlimited)
    }

    pub fn as_option(&self) -> Option<i64> {
        match self {
            LimitValue::Unlimited => None,
            LimitValue::Max(v) => Some(*v),
        }
    }
}

impl From<Option<i64>> for LimitValue {
    fn from(value: Option<i64>) -> Self {
        match value {
            None => LimitValue::Unlimited,
            Some(v) => LimitValue::Max(v.max(0)),
        }
    }
}

impl From<LimitValue> for Option<i64> {
    fn from(value: LimitValue) -> Self {
        value.as_option()
    }
}

impl std::fmt::Display for LimitValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitValue::Unlimited => write!(f, "unlimited"),
            LimitValue::Max(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub price_yearly_afn_cents: i64,
    pub price_yearly_usd_cents: i64,
    pub per_school_price_afn_cents: i64,
    pub per_school_price_usd_cents: i64,
    pub trial_days: i32,
    pub grace_period_days: i32,
    pub readonly_period_days: i32,
    pub max_schools: i32,
    pub billing_period_days: i32,
    pub is_active: bool,
    pub is_default: bool,
    pub is_custom: bool,
    pub custom_for_organization_id: Option<Uuid>,
    pub sort_order: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Plan {
    /// Yearly base price in `currency`
    pub fn price_cents(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Afn => self.price_yearly_afn_cents,
            Currency::Usd => self.price_yearly_usd_cents,
        }
    }

    /// Price of one school beyond the plan allowance in `currency`
    pub fn per_school_price_cents(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Afn => self.per_school_price_afn_cents,
            Currency::Usd => self.per_school_price_usd_cents,
        }
    }

    /// Retired plans keep existing subscriptions but cannot start new ones
    pub fn ensure_active(&self) -> BillingResult<()> {
        if !self.is_active {
            return Err(BillingError::validation(
                "plan_id",
                format!("plan {} is not active", self.slug),
            ));
        }
        Ok(())
    }

    /// Whether `org_id` may pick this plan for a renewal
    pub fn is_available_to(&self, org_id: Uuid) -> bool {
        if !self.is_active {
            return false;
        }
        if self.is_custom {
            return self.custom_for_organization_id == Some(org_id);
        }
        true
    }
}

/// A limit attached to a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimit {
    pub resource_key: String,
    pub limit_value: LimitValue,
    pub warning_threshold: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanLimitRow {
    resource_key: String,
    limit_value: Option<i64>,
    warning_threshold: i32,
}

impl From<PlanLimitRow> for PlanLimit {
    fn from(row: PlanLimitRow) -> Self {
        PlanLimit {
            resource_key: row.resource_key,
            limit_value: row.limit_value.into(),
            warning_threshold: row.warning_threshold,
        }
    }
}

/// Plan together with its feature and limit grants
#[derive(Debug, Clone, Serialize)]
pub struct PlanDetails {
    #[serde(flatten)]
    pub plan: Plan,
    pub features: Vec<String>,
    pub limits: Vec<PlanLimit>,
}

/// Operator input for creating a plan
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub price_yearly_afn_cents: i64,
    #[serde(default)]
    pub price_yearly_usd_cents: i64,
    #[serde(default)]
    pub per_school_price_afn_cents: i64,
    #[serde(default)]
    pub per_school_price_usd_cents: i64,
    #[serde(default)]
    pub trial_days: i32,
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: i32,
    #[serde(default = "default_readonly_period_days")]
    pub readonly_period_days: i32,
    #[serde(default = "default_max_schools")]
    pub max_schools: i32,
    #[serde(default = "default_billing_period_days")]
    pub billing_period_days: i32,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_custom: bool,
    pub custom_for_organization_id: Option<Uuid>,
    #[serde(default)]
    pub sort_order: i32,
}

fn default_grace_period_days() -> i32 {
    14
}

fn default_readonly_period_days() -> i32 {
    60
}

fn default_max_schools() -> i32 {
    1
}

fn default_billing_period_days() -> i32 {
    365
}

impl NewPlan {
    pub fn validate(&self) -> BillingResult<()> {
        let slug = self.slug.trim();
        if slug.is_empty()
            || !slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(BillingError::validation(
                "slug",
                "must be non-empty lowercase letters, digits, '-' or '_'",
            ));
        }
        if self.name.trim().is_empty() {
            return Err(BillingError::validation("name", "must not be empty"));
        }
        validate_plan_numbers(
            Some(self.price_yearly_afn_cents),
            Some(self.price_yearly_usd_cents),
            Some(self.per_school_price_afn_cents),
            Some(self.per_school_price_usd_cents),
            Some(self.trial_days),
            Some(self.grace_period_days),
            Some(self.readonly_period_days),
            Some(self.max_schools),
            Some(self.billing_period_days),
        )?;
        if self.is_custom && self.custom_for_organization_id.is_none() {
            return Err(BillingError::validation(
                "custom_for_organization_id",
                "custom plans must name their organization",
            ));
        }
        Ok(())
    }
}

/// Operator input for editing a plan; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_yearly_afn_cents: Option<i64>,
    pub price_yearly_usd_cents: Option<i64>,
    pub per_school_price_afn_cents: Option<i64>,
    pub per_school_price_usd_cents: Option<i64>,
    pub trial_days: Option<i32>,
    pub grace_period_days: Option<i32>,
    pub readonly_period_days: Option<i32>,
    pub max_schools: Option<i32>,
    pub billing_period_days: Option<i32>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
    pub sort_order: Option<i32>,
}

impl PlanUpdate {
    pub fn validate(&self) -> BillingResult<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(BillingError::validation("name", "must not be empty"));
            }
        }
        validate_plan_numbers(
            self.price_yearly_afn_cents,
            self.price_yearly_usd_cents,
            self.per_school_price_afn_cents,
            self.per_school_price_usd_cents,
            self.trial_days,
            self.grace_period_days,
            self.readonly_period_days,
            self.max_schools,
            self.billing_period_days,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn validate_plan_numbers(
    price_afn: Option<i64>,
    price_usd: Option<i64>,
    per_school_afn: Option<i64>,
    per_school_usd: Option<i64>,
    trial_days: Option<i32>,
    grace_period_days: Option<i32>,
    readonly_period_days: Option<i32>,
    max_schools: Option<i32>,
    billing_period_days: Option<i32>,
) -> BillingResult<()> {
    let money = [
        ("price_yearly_afn_cents", price_afn),
        ("price_yearly_usd_cents", price_usd),
        ("per_school_price_afn_cents", per_school_afn),
        ("per_school_price_usd_cents", per_school_usd),
    ];
    for (field, value) in money {
        if matches!(value, Some(v) if v < 0) {
            return Err(BillingError::validation(field, "must be >= 0"));
        }
    }

    let counts = [
        ("trial_days", trial_days),
        ("grace_period_days", grace_period_days),
        ("readonly_period_days", readonly_period_days),
        ("max_schools", max_schools),
    ];
    for (field, value) in counts {
        if matches!(value, Some(v) if v < 0) {
            return Err(BillingError::validation(field, "must be >= 0"));
        }
    }

    if matches!(billing_period_days, Some(v) if v <= 0) {
        return Err(BillingError::validation(
            "billing_period_days",
            "must be > 0",
        ));
    }
    Ok(())
}

/// Operator input for one plan limit
#[derive(Debug, Clone, Deserialize)]
pub struct PlanLimitInput {
    pub resource_key: String,
    pub limit_value: LimitValue,
    pub warning_threshold: Option<i32>,
}

pub(crate) const PLAN_COLUMNS: &str = r#"
    id, slug, name, description,
    price_yearly_afn_cents, price_yearly_usd_cents,
    per_school_price_afn_cents, per_school_price_usd_cents,
    trial_days, grace_period_days, readonly_period_days, max_schools,
    billing_period_days, is_active, is_default, is_custom,
    custom_for_organization_id, sort_order, created_at, updated_at
"#;

/// Plan catalog reads and operator writes
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
    cache: Arc<EntitlementCache>,
}

impl PlanCatalog {
    pub fn new(pool: PgPool, cache: Arc<EntitlementCache>) -> Self {
        Self { pool, cache }
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(&format!(
            "SELECT {} FROM subscription_plans WHERE id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))
    }

    pub async fn get_plan_by_slug(&self, slug: &str) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(&format!(
            "SELECT {} FROM subscription_plans WHERE slug = $1",
            PLAN_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    /// Plan with its feature keys and limits
    pub async fn get_plan_details(&self, plan_id: Uuid) -> BillingResult<PlanDetails> {
        let plan = self.get_plan(plan_id).await?;
        let features = self.plan_features(plan_id).await?;
        let limits = self.plan_limits(plan_id).await?;
        Ok(PlanDetails {
            plan,
            features,
            limits,
        })
    }

    pub async fn list_plans(&self, include_inactive: bool) -> BillingResult<Vec<Plan>> {
        let plans: Vec<Plan> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscription_plans
            WHERE is_active OR $1
            ORDER BY sort_order, name
            "#,
            PLAN_COLUMNS
        ))
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    /// Plans an organization may renew onto: active public plans plus any
    /// custom plan made for it, with their feature and limit grants
    pub async fn list_available_plans(&self, org_id: Uuid) -> BillingResult<Vec<PlanDetails>> {
        let plans: Vec<Plan> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscription_plans
            WHERE is_active
              AND (NOT is_custom OR custom_for_organization_id = $1)
            ORDER BY sort_order, name
            "#,
            PLAN_COLUMNS
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let mut details = Vec::with_capacity(plans.len());
        for plan in plans {
            let features = self.plan_features(plan.id).await?;
            let limits = self.plan_limits(plan.id).await?;
            details.push(PlanDetails {
                plan,
                features,
                limits,
            });
        }
        Ok(details)
    }

    pub async fn plan_features(&self, plan_id: Uuid) -> BillingResult<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT feature_key FROM plan_features
            WHERE plan_id = $1 AND is_enabled
            ORDER BY feature_key
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    pub async fn plan_limits(&self, plan_id: Uuid) -> BillingResult<Vec<PlanLimit>> {
        let rows: Vec<PlanLimitRow> = sqlx::query_as(
            r#"
            SELECT resource_key, limit_value, warning_threshold
            FROM plan_limits
            WHERE plan_id = $1
            ORDER BY resource_key
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PlanLimit::from).collect())
    }

    pub async fn create_plan(
        &self,
        ctx: &AuthorizationContext,
        new_plan: NewPlan,
    ) -> BillingResult<Plan> {
        ctx.require_platform_admin()?;
        new_plan.validate()?;

        let result = sqlx::query_as::<_, Plan>(&format!(
            r#"
            INSERT INTO subscription_plans (
                slug, name, description,
                price_yearly_afn_cents, price_yearly_usd_cents,
                per_school_price_afn_cents, per_school_price_usd_cents,
                trial_days, grace_period_days, readonly_period_days, max_schools,
                billing_period_days, is_default, is_custom,
                custom_for_organization_id, sort_order
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {}
            "#,
            PLAN_COLUMNS
        ))
        .bind(new_plan.slug.trim())
        .bind(new_plan.name.trim())
        .bind(&new_plan.description)
        .bind(new_plan.price_yearly_afn_cents)
        .bind(new_plan.price_yearly_usd_cents)
        .bind(new_plan.per_school_price_afn_cents)
        .bind(new_plan.per_school_price_usd_cents)
        .bind(new_plan.trial_days)
        .bind(new_plan.grace_period_days)
        .bind(new_plan.readonly_period_days)
        .bind(new_plan.max_schools)
        .bind(new_plan.billing_period_days)
        .bind(new_plan.is_default)
        .bind(new_plan.is_custom)
        .bind(new_plan.custom_for_organization_id)
        .bind(new_plan.sort_order)
        .fetch_one(&self.pool)
        .await;

        let plan = match result {
            Ok(plan) => plan,
            Err(e) if is_unique_violation(&e, "subscription_plans_slug_key") => {
                return Err(BillingError::validation("slug", "already exists"));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            plan_id = %plan.id,
            slug = %plan.slug,
            created_by = %ctx.user_id,
            "Plan created"
        );
        Ok(plan)
    }

    pub async fn update_plan(
        &self,
        ctx: &AuthorizationContext,
        plan_id: Uuid,
        update: PlanUpdate,
    ) -> BillingResult<Plan> {
        ctx.require_platform_admin()?;
        update.validate()?;

        let plan: Option<Plan> = sqlx::query_as(&format!(
            r#"
            UPDATE subscription_plans SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                price_yearly_afn_cents = COALESCE($4, price_yearly_afn_cents),
                price_yearly_usd_cents = COALESCE($5, price_yearly_usd_cents),
                per_school_price_afn_cents = COALESCE($6, per_school_price_afn_cents),
                per_school_price_usd_cents = COALESCE($7, per_school_price_usd_cents),
                trial_days = COALESCE($8, trial_days),
                grace_period_days = COALESCE($9, grace_period_days),
                readonly_period_days = COALESCE($10, readonly_period_days),
                max_schools = COALESCE($11, max_schools),
                billing_period_days = COALESCE($12, billing_period_days),
                is_active = COALESCE($13, is_active),
                is_default = COALESCE($14, is_default),
                sort_order = COALESCE($15, sort_order),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .bind(update.name.as_deref().map(str::trim))
        .bind(&update.description)
        .bind(update.price_yearly_afn_cents)
        .bind(update.price_yearly_usd_cents)
        .bind(update.per_school_price_afn_cents)
        .bind(update.per_school_price_usd_cents)
        .bind(update.trial_days)
        .bind(update.grace_period_days)
        .bind(update.readonly_period_days)
        .bind(update.max_schools)
        .bind(update.billing_period_days)
        .bind(update.is_active)
        .bind(update.is_default)
        .bind(update.sort_order)
        .fetch_optional(&self.pool)
        .await?;

        let plan = plan.ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))?;

        tracing::info!(
            plan_id = %plan.id,
            updated_by = %ctx.user_id,
            "Plan updated"
        );
        Ok(plan)
    }

    /// Replace the feature grants of a plan
    pub async fn set_plan_features(
        &self,
        ctx: &AuthorizationContext,
        plan_id: Uuid,
        feature_keys: Vec<String>,
    ) -> BillingResult<Vec<String>> {
        ctx.require_platform_admin()?;
        self.get_plan(plan_id).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM plan_features WHERE plan_id = $1")
            .bind(plan_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        for key in &feature_keys {
            let known: Option<String> = sqlx::query_scalar(
                "SELECT feature_key FROM feature_definitions WHERE feature_key = $1",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            if known.is_none() {
                return Err(BillingError::validation(
                    "feature_keys",
                    format!("unknown feature '{}'", key),
                ));
            }

            sqlx::query(
                r#"
                INSERT INTO plan_features (plan_id, feature_key, is_enabled)
                VALUES ($1, $2, TRUE)
                ON CONFLICT (plan_id, feature_key) DO NOTHING
                "#,
            )
            .bind(plan_id)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        // Every organization on this plan sees the change
        self.cache.clear().await;

        tracing::info!(
            plan_id = %plan_id,
            feature_count = feature_keys.len(),
            updated_by = %ctx.user_id,
            "Plan features replaced"
        );
        self.plan_features(plan_id).await
    }

    /// Replace the limit grants of a plan
    pub async fn set_plan_limits(
        &self,
        ctx: &AuthorizationContext,
        plan_id: Uuid,
        limits: Vec<PlanLimitInput>,
    ) -> BillingResult<Vec<PlanLimit>> {
        ctx.require_platform_admin()?;
        self.get_plan(plan_id).await?;

        for limit in &limits {
            if let Some(threshold) = limit.warning_threshold {
                if !(1..=100).contains(&threshold) {
                    return Err(BillingError::validation(
                        "warning_threshold",
                        "must be between 1 and 100",
                    ));
                }
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM plan_limits WHERE plan_id = $1")
            .bind(plan_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        for limit in &limits {
            let known: Option<String> = sqlx::query_scalar(
                "SELECT resource_key FROM limit_definitions WHERE resource_key = $1",
            )
            .bind(&limit.resource_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            if known.is_none() {
                return Err(BillingError::validation(
                    "resource_key",
                    format!("unknown resource '{}'", limit.resource_key),
                ));
            }

            sqlx::query(
                r#"
                INSERT INTO plan_limits (plan_id, resource_key, limit_value, warning_threshold)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (plan_id, resource_key) DO UPDATE SET
                    limit_value = EXCLUDED.limit_value,
                    warning_threshold = EXCLUDED.warning_threshold
                "#,
            )
            .bind(plan_id)
            .bind(&limit.resource_key)
            .bind(limit.limit_value.as_option())
            .bind(limit.warning_threshold.unwrap_or(DEFAULT_WARNING_THRESHOLD))
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.cache.clear().await;

        tracing::info!(
            plan_id = %plan_id,
            limit_count = limits.len(),
            updated_by = %ctx.user_id,
            "Plan limits replaced"
        );
        self.plan_limits(plan_id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn plan_fixture(slug: &str, afn_cents: i64, per_school_afn_cents: i64) -> Plan {
        let now = OffsetDateTime::now_utc();
        Plan {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            description: None,
            price_yearly_afn_cents: afn_cents,
            price_yearly_usd_cents: afn_cents / 80,
            per_school_price_afn_cents: per_school_afn_cents,
            per_school_price_usd_cents: per_school_afn_cents / 80,
            trial_days: 0,
            grace_period_days: 14,
            readonly_period_days: 60,
            max_schools: 1,
            billing_period_days: 365,
            is_active: true,
            is_default: false,
            is_custom: false,
            custom_for_organization_id: None,
            sort_order: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_limit_value_widen() {
        assert_eq!(
            LimitValue::Max(10).widen(LimitValue::Max(25)),
            LimitValue::Max(25)
        );
        assert_eq!(
            LimitValue::Max(10).widen(LimitValue::Unlimited),
            LimitValue::Unlimited
        );
        assert_eq!(
            LimitValue::Unlimited.widen(LimitValue::Max(0)),
            LimitValue::Unlimited
        );
    }

    #[test]
    fn test_limit_value_serde_uses_null_for_unlimited() {
        assert_eq!(serde_json::to_string(&LimitValue::Unlimited).unwrap(), "null");
        assert_eq!(serde_json::to_string(&LimitValue::Max(5)).unwrap(), "5");
        let parsed: LimitValue = serde_json::from_str("null").unwrap();
        assert_eq!(parsed, LimitValue::Unlimited);
    }

    #[test]
    fn test_plan_prices_by_currency() {
        let plan = plan_fixture("pro", 20_000, 1_000);
        assert_eq!(plan.price_cents(Currency::Afn), 20_000);
        assert_eq!(plan.per_school_price_cents(Currency::Afn), 1_000);
        assert_eq!(plan.price_cents(Currency::Usd), 250);
    }

    #[test]
    fn test_custom_plan_availability() {
        let org = Uuid::new_v4();
        let mut plan = plan_fixture("custom", 0, 0);
        plan.is_custom = true;
        plan.custom_for_organization_id = Some(org);

        assert!(plan.is_available_to(org));
        assert!(!plan.is_available_to(Uuid::new_v4()));

        plan.is_active = false;
        assert!(!plan.is_available_to(org));
    }

    #[test]
    fn test_retired_plan_cannot_be_activated() {
        let mut plan = plan_fixture("pro", 20_000, 1_000);
        assert!(plan.ensure_active().is_ok());

        plan.is_active = false;
        assert!(matches!(
            plan.ensure_active(),
            Err(BillingError::Validation { ref field, .. }) if field == "plan_id"
        ));
    }

    #[test]
    fn test_new_plan_validation() {
        let mut new_plan: NewPlan = serde_json::from_value(serde_json::json!({
            "slug": "gold",
            "name": "Gold",
            "price_yearly_afn_cents": 100000
        }))
        .unwrap();
        assert!(new_plan.validate().is_ok());
        assert_eq!(new_plan.billing_period_days, 365);
        assert_eq!(new_plan.grace_period_days, 14);

        new_plan.slug = "Gold Plan".to_string();
        assert!(new_plan.validate().is_err());

        new_plan.slug = "gold".to_string();
        new_plan.billing_period_days = 0;
        assert!(matches!(
            new_plan.validate(),
            Err(BillingError::Validation { ref field, .. }) if field == "billing_period_days"
        ));
    }

    #[test]
    fn test_plan_update_rejects_negative_price() {
        let update = PlanUpdate {
            price_yearly_usd_cents: Some(-1),
            ..Default::default()
        };
        assert!(update.validate().is_err());
        assert!(PlanUpdate::default().validate().is_ok());
    }
}
