//! Entitlement gate
//!
//! Answers "may this organization use feature X" and "how much of resource Y
//! may it create" for the rest of the platform.
//!
//! ## Rules
//!
//! 1. A feature is enabled when the subscription grants access (not blocked,
//!    not absent) AND the plan grants it or an unexpired add-on does.
//! 2. A limit is the wider of the plan limit and any unexpired override;
//!    unlimited dominates. No plan grant means a limit of 0.
//! 3. Results are cached per organization for a short TTL. Every write that
//!    touches an organization invalidates its entry.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use schoolsaas_shared::{Currency, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::authz::AuthorizationContext;
use crate::error::{BillingError, BillingResult};
use crate::history::{HistoryAction, HistoryRecord, HistoryService};
use crate::plans::{LimitValue, DEFAULT_WARNING_THRESHOLD};
use crate::status::{derive_status, AccessSnapshot, SubscriptionWindows};

/// Default cache TTL
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Upper bound on cached organizations; the oldest entries are evicted first
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Alternate feature keys and the canonical key they resolve to
const FEATURE_ALIASES: &[(&str, &str)] = &[("timetable", "timetables"), ("reports", "pdf_reports")];

pub fn canonical_feature_key(key: &str) -> &str {
    FEATURE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map_or(key, |(_, canonical)| *canonical)
}

/// The key itself, its canonical form and every alias of that canonical form
pub fn feature_key_variants(key: &str) -> Vec<&str> {
    let canonical = canonical_feature_key(key);
    let mut variants = vec![key];
    if canonical != key {
        variants.push(canonical);
    }
    for (alias, target) in FEATURE_ALIASES {
        if *target == canonical && !variants.contains(alias) {
            variants.push(*alias);
        }
    }
    variants
}

// =============================================================================
// Cache
// =============================================================================

/// Everything the gate knows about one organization at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrgEntitlement {
    pub access: AccessSnapshot,
    pub plan_id: Option<Uuid>,
    pub features: BTreeSet<String>,
}

impl OrgEntitlement {
    pub fn has_feature(&self, key: &str) -> bool {
        feature_key_variants(key)
            .into_iter()
            .any(|variant| self.features.contains(variant))
    }
}

#[derive(Debug, Clone)]
struct CachedEntitlement {
    entitlement: OrgEntitlement,
    cached_at: Instant,
}

/// Per-organization entitlement cache shared by every billing service
#[derive(Debug)]
pub struct EntitlementCache {
    ttl: Duration,
    entries: RwLock<HashMap<Uuid, CachedEntitlement>>,
    /// Bumped on every invalidation; loads that started earlier are not cached
    generation: AtomicU64,
}

impl Default for EntitlementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl EntitlementCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Take before loading; pass the value to [`EntitlementCache::insert`]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn get(&self, org_id: Uuid) -> Option<OrgEntitlement> {
        let entries = self.entries.read().await;
        entries
            .get(&org_id)
            .filter(|cached| cached.cached_at.elapsed() < self.ttl)
            .map(|cached| cached.entitlement.clone())
    }

    /// Store a snapshot loaded at `generation`. Skipped when any
    /// invalidation ran since, as the snapshot may predate that write.
    pub async fn insert(&self, org_id: Uuid, generation: u64, entitlement: OrgEntitlement) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.write().await;
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(org_id = %org_id, "Stale entitlement snapshot not cached");
            return;
        }
        if entries.len() >= MAX_CACHE_ENTRIES && !entries.contains_key(&org_id) {
            let ttl = self.ttl;
            entries.retain(|_, cached| cached.cached_at.elapsed() < ttl);
            if entries.len() >= MAX_CACHE_ENTRIES {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, cached)| cached.cached_at)
                    .map(|(id, _)| *id)
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            org_id,
            CachedEntitlement {
                entitlement,
                cached_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, org_id: Uuid) {
        let mut entries = self.entries.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.remove(&org_id);
        tracing::debug!(org_id = %org_id, "Entitlement cache invalidated");
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
        tracing::debug!("Entitlement cache cleared");
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// =============================================================================
// Computation
// =============================================================================

/// Current subscription columns needed to derive access
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CurrentSubscriptionRow {
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub expires_at: OffsetDateTime,
    pub grace_period_ends_at: OffsetDateTime,
    pub readonly_period_ends_at: OffsetDateTime,
}

impl CurrentSubscriptionRow {
    pub fn windows(&self) -> SubscriptionWindows {
        SubscriptionWindows {
            trial_ends_at: self.trial_ends_at,
            expires_at: self.expires_at,
            grace_period_ends_at: self.grace_period_ends_at,
            readonly_period_ends_at: self.readonly_period_ends_at,
        }
    }
}

/// Raw rows an entitlement is computed from
#[derive(Debug, Clone, Default)]
pub struct RawEntitlementData {
    pub subscription: Option<CurrentSubscriptionRow>,
    pub plan_features: Vec<String>,
    pub addon_features: Vec<String>,
}

/// Pure: same inputs, same entitlement
pub fn compute_entitlement(raw: &RawEntitlementData, now: OffsetDateTime) -> OrgEntitlement {
    let status = raw
        .subscription
        .as_ref()
        .map(|sub| derive_status(sub.status, &sub.windows(), now));
    let access = AccessSnapshot::from_status(status);

    let features = if access.can_read {
        raw.plan_features
            .iter()
            .chain(raw.addon_features.iter())
            .map(|key| canonical_feature_key(key).to_string())
            .collect()
    } else {
        BTreeSet::new()
    };

    OrgEntitlement {
        access,
        plan_id: raw.subscription.as_ref().map(|sub| sub.plan_id),
        features,
    }
}

/// Result of checking a resource count against its limit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageCheck {
    pub resource_key: String,
    pub current: i64,
    pub limit: LimitValue,
    /// `None` when unlimited
    pub remaining: Option<i64>,
    /// Percent of the limit in use, one decimal place
    pub percentage: f64,
    pub warning_threshold: i32,
    pub warning: bool,
    pub blocked: bool,
    pub message: Option<String>,
}

impl UsageCheck {
    pub fn allowed(&self) -> bool {
        !self.blocked
    }
}

/// Pure usage evaluation
pub fn evaluate_usage(
    resource_key: &str,
    current: i64,
    limit: LimitValue,
    warning_threshold: i32,
) -> UsageCheck {
    let current = current.max(0);
    match limit {
        LimitValue::Unlimited => UsageCheck {
            resource_key: resource_key.to_string(),
            current,
            limit,
            remaining: None,
            percentage: 0.0,
            warning_threshold,
            warning: false,
            blocked: false,
            message: None,
        },
        LimitValue::Max(0) => UsageCheck {
            resource_key: resource_key.to_string(),
            current,
            limit,
            remaining: Some(0),
            percentage: 100.0,
            warning_threshold,
            warning: false,
            blocked: true,
            message: Some("This feature is not available on your current plan.".to_string()),
        },
        LimitValue::Max(max) => {
            let percentage = ((current as f64 / max as f64) * 1000.0).round() / 10.0;
            let blocked = current >= max;
            let warning = !blocked && percentage >= f64::from(warning_threshold);
            let message = if blocked {
                Some(format!(
                    "You have reached your {} limit ({}). Please upgrade your plan to add more.",
                    resource_key, max
                ))
            } else if warning {
                Some(format!(
                    "You are using {}% of your {} limit ({}/{}).",
                    percentage, resource_key, current, max
                ))
            } else {
                None
            };
            UsageCheck {
                resource_key: resource_key.to_string(),
                current,
                limit,
                remaining: Some((max - current).max(0)),
                percentage,
                warning_threshold,
                warning,
                blocked,
                message,
            }
        }
    }
}

// =============================================================================
// Grants
// =============================================================================

/// Operator input for a feature add-on
#[derive(Debug, Clone, Deserialize)]
pub struct AddonGrant {
    pub feature_key: String,
    #[serde(default)]
    pub price_paid_cents: i64,
    #[serde(default)]
    pub currency: Currency,
    /// Defaults to the current subscription's expiry
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// Operator input for a limit override
#[derive(Debug, Clone, Deserialize)]
pub struct LimitOverrideGrant {
    pub resource_key: String,
    pub limit_value: LimitValue,
    pub reason: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeatureAddon {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub feature_key: String,
    pub is_enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub price_paid_cents: i64,
    pub currency: Currency,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitOverride {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub resource_key: String,
    pub limit_value: LimitValue,
    pub reason: String,
    pub granted_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct LimitOverrideRow {
    id: Uuid,
    organization_id: Uuid,
    resource_key: String,
    limit_value: Option<i64>,
    reason: String,
    granted_by: Option<Uuid>,
    expires_at: Option<OffsetDateTime>,
}

impl From<LimitOverrideRow> for LimitOverride {
    fn from(row: LimitOverrideRow) -> Self {
        LimitOverride {
            id: row.id,
            organization_id: row.organization_id,
            resource_key: row.resource_key,
            limit_value: row.limit_value.into(),
            reason: row.reason,
            granted_by: row.granted_by,
            expires_at: row.expires_at,
        }
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    cache: Arc<EntitlementCache>,
    default_warning_threshold: i32,
}

impl EntitlementService {
    pub fn new(pool: PgPool, cache: Arc<EntitlementCache>) -> Self {
        Self {
            pool,
            cache,
            default_warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }

    /// Threshold used when a plan limit row does not exist
    pub fn with_default_warning_threshold(mut self, threshold: i32) -> Self {
        self.default_warning_threshold = threshold.clamp(1, 100);
        self
    }

    pub fn cache(&self) -> &Arc<EntitlementCache> {
        &self.cache
    }

    /// Cached entitlement, computed on miss
    pub async fn entitlement(&self, org_id: Uuid) -> BillingResult<OrgEntitlement> {
        if let Some(cached) = self.cache.get(org_id).await {
            return Ok(cached);
        }

        let generation = self.cache.generation();
        let raw = self.load_raw(org_id).await?;
        let entitlement = compute_entitlement(&raw, OffsetDateTime::now_utc());
        self.cache
            .insert(org_id, generation, entitlement.clone())
            .await;
        Ok(entitlement)
    }

    async fn load_raw(&self, org_id: Uuid) -> BillingResult<RawEntitlementData> {
        let subscription: Option<CurrentSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT plan_id, status, trial_ends_at, expires_at,
                   grace_period_ends_at, readonly_period_ends_at
            FROM organization_subscriptions
            WHERE organization_id = $1 AND is_current
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(subscription) = subscription else {
            return Ok(RawEntitlementData::default());
        };

        let plan_features: Vec<String> = sqlx::query_scalar(
            "SELECT feature_key FROM plan_features WHERE plan_id = $1 AND is_enabled",
        )
        .bind(subscription.plan_id)
        .fetch_all(&self.pool)
        .await?;

        let addon_features: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT feature_key FROM organization_feature_addons
            WHERE organization_id = $1
              AND is_enabled
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(RawEntitlementData {
            subscription: Some(subscription),
            plan_features,
            addon_features,
        })
    }

    pub async fn access(&self, org_id: Uuid) -> BillingResult<AccessSnapshot> {
        Ok(self.entitlement(org_id).await?.access)
    }

    pub async fn is_feature_enabled(&self, org_id: Uuid, feature_key: &str) -> BillingResult<bool> {
        Ok(self.entitlement(org_id).await?.has_feature(feature_key))
    }

    pub async fn enabled_features(&self, org_id: Uuid) -> BillingResult<Vec<String>> {
        Ok(self
            .entitlement(org_id)
            .await?
            .features
            .into_iter()
            .collect())
    }

    /// Effective limit and its warning threshold
    async fn limit_with_threshold(
        &self,
        org_id: Uuid,
        resource_key: &str,
    ) -> BillingResult<(LimitValue, i32)> {
        let entitlement = self.entitlement(org_id).await?;

        let plan_limit: Option<(Option<i64>, i32)> = match entitlement.plan_id {
            Some(plan_id) => {
                sqlx::query_as(
                    r#"
                    SELECT limit_value, warning_threshold FROM plan_limits
                    WHERE plan_id = $1 AND resource_key = $2
                    "#,
                )
                .bind(plan_id)
                .bind(resource_key)
                .fetch_optional(&self.pool)
                .await?
            }
            None => None,
        };

        let (mut limit, threshold) = match plan_limit {
            Some((value, threshold)) => (LimitValue::from(value), threshold),
            None => (LimitValue::Max(0), self.default_warning_threshold),
        };

        let overrides: Vec<Option<i64>> = sqlx::query_scalar(
            r#"
            SELECT limit_value FROM organization_limit_overrides
            WHERE organization_id = $1
              AND resource_key = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(org_id)
        .bind(resource_key)
        .fetch_all(&self.pool)
        .await?;

        for value in overrides {
            limit = limit.widen(LimitValue::from(value));
        }

        Ok((limit, threshold))
    }

    pub async fn get_limit(&self, org_id: Uuid, resource_key: &str) -> BillingResult<LimitValue> {
        Ok(self.limit_with_threshold(org_id, resource_key).await?.0)
    }

    pub async fn check_usage(
        &self,
        org_id: Uuid,
        resource_key: &str,
        current_count: i64,
    ) -> BillingResult<UsageCheck> {
        if current_count < 0 {
            return Err(BillingError::validation("current", "must be >= 0"));
        }
        let (limit, threshold) = self.limit_with_threshold(org_id, resource_key).await?;
        let check = evaluate_usage(resource_key, current_count, limit, threshold);

        if check.blocked {
            tracing::debug!(
                org_id = %org_id,
                resource_key = %resource_key,
                current = current_count,
                limit = %limit,
                "Resource limit reached"
            );
        }
        Ok(check)
    }

    /// Enable a feature add-on for an organization (operator)
    pub async fn grant_feature_addon(
        &self,
        ctx: &AuthorizationContext,
        org_id: Uuid,
        grant: AddonGrant,
    ) -> BillingResult<FeatureAddon> {
        ctx.require_platform_admin()?;
        if grant.price_paid_cents < 0 {
            return Err(BillingError::validation("price_paid_cents", "must be >= 0"));
        }
        let feature_key = canonical_feature_key(grant.feature_key.trim()).to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let known: Option<String> =
            sqlx::query_scalar("SELECT feature_key FROM feature_definitions WHERE feature_key = $1")
                .bind(&feature_key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        if known.is_none() {
            return Err(BillingError::validation(
                "feature_key",
                format!("unknown feature '{}'", feature_key),
            ));
        }

        let current: Option<(Uuid, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT id, expires_at FROM organization_subscriptions
            WHERE organization_id = $1 AND is_current
            "#,
        )
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let expires_at = grant.expires_at.or(current.map(|(_, expires)| expires));

        let addon: FeatureAddon = sqlx::query_as(
            r#"
            INSERT INTO organization_feature_addons
                (organization_id, feature_key, is_enabled, started_at, expires_at,
                 price_paid_cents, currency)
            VALUES ($1, $2, TRUE, NOW(), $3, $4, $5)
            ON CONFLICT (organization_id, feature_key) DO UPDATE SET
                is_enabled = TRUE,
                started_at = NOW(),
                expires_at = EXCLUDED.expires_at,
                price_paid_cents = EXCLUDED.price_paid_cents,
                currency = EXCLUDED.currency,
                updated_at = NOW()
            RETURNING id, organization_id, feature_key, is_enabled, started_at,
                      expires_at, price_paid_cents, currency
            "#,
        )
        .bind(org_id)
        .bind(&feature_key)
        .bind(expires_at)
        .bind(grant.price_paid_cents)
        .bind(grant.currency)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        HistoryService::log_in_tx(
            &mut tx,
            HistoryRecord::new(org_id, HistoryAction::AddonAdded)
                .subscription(current.map(|(id, _)| id))
                .performed_by(Some(ctx.user_id))
                .notes(format!("Added feature addon: {}", feature_key))
                .metadata(serde_json::json!({
                    "feature_key": feature_key,
                    "price_paid_cents": grant.price_paid_cents,
                    "currency": grant.currency,
                })),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.cache.invalidate(org_id).await;

        tracing::info!(
            org_id = %org_id,
            feature_key = %addon.feature_key,
            granted_by = %ctx.user_id,
            "Feature addon granted"
        );
        Ok(addon)
    }

    /// Raise a resource limit for an organization (operator)
    pub async fn grant_limit_override(
        &self,
        ctx: &AuthorizationContext,
        org_id: Uuid,
        grant: LimitOverrideGrant,
    ) -> BillingResult<LimitOverride> {
        ctx.require_platform_admin()?;
        let reason = grant.reason.trim();
        if reason.is_empty() {
            return Err(BillingError::validation("reason", "must not be empty"));
        }
        let resource_key = grant.resource_key.trim();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let known: Option<String> = sqlx::query_scalar(
            "SELECT resource_key FROM limit_definitions WHERE resource_key = $1",
        )
        .bind(resource_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        if known.is_none() {
            return Err(BillingError::validation(
                "resource_key",
                format!("unknown resource '{}'", resource_key),
            ));
        }

        let row: LimitOverrideRow = sqlx::query_as(
            r#"
            INSERT INTO organization_limit_overrides
                (organization_id, resource_key, limit_value, reason, granted_by, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (organization_id, resource_key) DO UPDATE SET
                limit_value = EXCLUDED.limit_value,
                reason = EXCLUDED.reason,
                granted_by = EXCLUDED.granted_by,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            RETURNING id, organization_id, resource_key, limit_value, reason,
                      granted_by, expires_at
            "#,
        )
        .bind(org_id)
        .bind(resource_key)
        .bind(grant.limit_value.as_option())
        .bind(reason)
        .bind(ctx.user_id)
        .bind(grant.expires_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let subscription_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM organization_subscriptions WHERE organization_id = $1 AND is_current",
        )
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        HistoryService::log_in_tx(
            &mut tx,
            HistoryRecord::new(org_id, HistoryAction::LimitOverride)
                .subscription(subscription_id)
                .performed_by(Some(ctx.user_id))
                .notes(format!(
                    "Added limit override for {}: {}",
                    resource_key, grant.limit_value
                ))
                .metadata(serde_json::json!({
                    "resource_key": resource_key,
                    "limit_value": grant.limit_value,
                    "reason": reason,
                })),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.cache.invalidate(org_id).await;

        tracing::info!(
            org_id = %org_id,
            resource_key = %resource_key,
            limit_value = %grant.limit_value,
            granted_by = %ctx.user_id,
            "Limit override granted"
        );
        Ok(row.into())
    }
}
