//! Discount codes
//!
//! Validation and pricing are pure functions over a loaded [`DiscountCode`];
//! [`DiscountService`] loads codes, counts redemptions and owns the
//! conditional usage counter used during payment confirmation.

use schoolsaas_shared::{iso_date, Currency, DiscountType};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::authz::AuthorizationContext;
use crate::error::{is_unique_violation, BillingError, BillingResult, DiscountRejection};

/// Basis points representing 100%
pub const FULL_PERCENTAGE_BPS: i64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DiscountCode {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    /// Basis points for percentage codes, cents for fixed codes
    pub discount_value: i64,
    pub max_discount_cents: Option<i64>,
    pub currency: Option<Currency>,
    pub applicable_plan_id: Option<Uuid>,
    pub max_uses: Option<i32>,
    pub current_uses: i32,
    pub max_uses_per_org: i32,
    #[serde(with = "iso_date::option")]
    pub valid_from: Option<Date>,
    #[serde(with = "iso_date::option")]
    pub valid_until: Option<Date>,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// What a code is being applied to
#[derive(Debug, Clone, Copy)]
pub struct DiscountContext {
    pub plan_id: Uuid,
    pub currency: Currency,
    pub today: Date,
    /// Redemptions of this code already recorded for the organization
    pub org_redemptions: i64,
}

impl DiscountCode {
    /// Check every applicability rule, first failure wins
    pub fn check(&self, ctx: &DiscountContext) -> Result<(), DiscountRejection> {
        if !self.is_active {
            return Err(DiscountRejection::Inactive);
        }
        if matches!(self.valid_from, Some(from) if ctx.today < from) {
            return Err(DiscountRejection::NotYetValid);
        }
        if matches!(self.valid_until, Some(until) if ctx.today > until) {
            return Err(DiscountRejection::Expired);
        }
        if matches!(self.currency, Some(currency) if currency != ctx.currency) {
            return Err(DiscountRejection::WrongCurrency);
        }
        if matches!(self.applicable_plan_id, Some(plan_id) if plan_id != ctx.plan_id) {
            return Err(DiscountRejection::WrongPlan);
        }
        if matches!(self.max_uses, Some(max) if self.current_uses >= max) {
            return Err(DiscountRejection::Exhausted);
        }
        if ctx.org_redemptions >= i64::from(self.max_uses_per_org) {
            return Err(DiscountRejection::OrgCapReached);
        }
        Ok(())
    }

    /// Discount in cents for `subtotal_cents`, always within `0..=subtotal_cents`
    pub fn discount_for(&self, subtotal_cents: i64) -> i64 {
        let subtotal = subtotal_cents.max(0);
        let raw = match self.discount_type {
            DiscountType::Percentage => {
                let bps = i128::from(self.discount_value.clamp(0, FULL_PERCENTAGE_BPS));
                let amount = i128::from(subtotal) * bps / i128::from(FULL_PERCENTAGE_BPS);
                let amount = i64::try_from(amount).unwrap_or(subtotal);
                match self.max_discount_cents {
                    Some(cap) => amount.min(cap.max(0)),
                    None => amount,
                }
            }
            DiscountType::Fixed => self.discount_value.max(0),
        };
        raw.clamp(0, subtotal)
    }
}

/// Result of a conditional usage increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterResult {
    Incremented,
    Exhausted,
    /// The organization already used the code `max_uses_per_org` times
    OrgCapReached,
}

impl CounterResult {
    /// Rejection to abort the surrounding transaction with
    pub fn rejection(self) -> Option<DiscountRejection> {
        match self {
            Self::Incremented => None,
            Self::Exhausted => Some(DiscountRejection::Exhausted),
            Self::OrgCapReached => Some(DiscountRejection::OrgCapReached),
        }
    }
}

/// Operator input for a new discount code
#[derive(Debug, Clone, Deserialize)]
pub struct NewDiscountCode {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub max_discount_cents: Option<i64>,
    pub currency: Option<Currency>,
    pub applicable_plan_id: Option<Uuid>,
    pub max_uses: Option<i32>,
    #[serde(default = "default_max_uses_per_org")]
    pub max_uses_per_org: i32,
    #[serde(default, with = "iso_date::option")]
    pub valid_from: Option<Date>,
    #[serde(default, with = "iso_date::option")]
    pub valid_until: Option<Date>,
}

fn default_max_uses_per_org() -> i32 {
    1
}

impl NewDiscountCode {
    /// Normalized code (trimmed, uppercased)
    pub fn normalized_code(&self) -> String {
        normalize_code(&self.code)
    }

    pub fn validate(&self) -> BillingResult<()> {
        let code = self.normalized_code();
        if code.is_empty() || code.len() > 50 {
            return Err(BillingError::validation("code", "must be 1-50 characters"));
        }
        if code.chars().any(char::is_whitespace) {
            return Err(BillingError::validation("code", "must not contain spaces"));
        }
        if self.name.trim().is_empty() {
            return Err(BillingError::validation("name", "must not be empty"));
        }
        match self.discount_type {
            DiscountType::Percentage => {
                if !(1..=FULL_PERCENTAGE_BPS).contains(&self.discount_value) {
                    return Err(BillingError::validation(
                        "discount_value",
                        "percentage must be between 1 and 10000 basis points",
                    ));
                }
            }
            DiscountType::Fixed => {
                if self.discount_value <= 0 {
                    return Err(BillingError::validation(
                        "discount_value",
                        "fixed amount must be > 0",
                    ));
                }
            }
        }
        if matches!(self.max_discount_cents, Some(v) if v < 0) {
            return Err(BillingError::validation("max_discount_cents", "must be >= 0"));
        }
        if matches!(self.max_uses, Some(v) if v < 0) {
            return Err(BillingError::validation("max_uses", "must be >= 0"));
        }
        if self.max_uses_per_org < 0 {
            return Err(BillingError::validation("max_uses_per_org", "must be >= 0"));
        }
        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until) {
            if from > until {
                return Err(BillingError::validation(
                    "valid_until",
                    "must not be before valid_from",
                ));
            }
        }
        Ok(())
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

const DISCOUNT_COLUMNS: &str = r#"
    id, code, name, description, discount_type, discount_value, max_discount_cents,
    currency, applicable_plan_id, max_uses, current_uses, max_uses_per_org,
    valid_from, valid_until, is_active, created_by, created_at
"#;

#[derive(Clone)]
pub struct DiscountService {
    pool: PgPool,
}

impl DiscountService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_code(&self, code: &str) -> BillingResult<Option<DiscountCode>> {
        let discount: Option<DiscountCode> = sqlx::query_as(&format!(
            "SELECT {} FROM discount_codes WHERE code = $1",
            DISCOUNT_COLUMNS
        ))
        .bind(normalize_code(code))
        .fetch_optional(&self.pool)
        .await?;
        Ok(discount)
    }

    pub async fn get(&self, discount_code_id: Uuid) -> BillingResult<DiscountCode> {
        let discount: Option<DiscountCode> = sqlx::query_as(&format!(
            "SELECT {} FROM discount_codes WHERE id = $1",
            DISCOUNT_COLUMNS
        ))
        .bind(discount_code_id)
        .fetch_optional(&self.pool)
        .await?;

        discount.ok_or_else(|| {
            BillingError::NotFound(format!("Discount code {} not found", discount_code_id))
        })
    }

    pub async fn redemption_count(&self, discount_code_id: Uuid, org_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM discount_code_usage
            WHERE discount_code_id = $1 AND organization_id = $2
            "#,
        )
        .bind(discount_code_id)
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Load `code` and check it applies to `plan_id`/`currency` for `org_id`
    pub async fn validate_code(
        &self,
        org_id: Uuid,
        code: &str,
        plan_id: Uuid,
        currency: Currency,
    ) -> BillingResult<DiscountCode> {
        let discount = self
            .find_by_code(code)
            .await?
            .ok_or(BillingError::DiscountRejected(DiscountRejection::UnknownCode))?;

        let org_redemptions = self.redemption_count(discount.id, org_id).await?;
        let ctx = DiscountContext {
            plan_id,
            currency,
            today: OffsetDateTime::now_utc().date(),
            org_redemptions,
        };

        if let Err(rejection) = discount.check(&ctx) {
            tracing::warn!(
                org_id = %org_id,
                code = %discount.code,
                reason = rejection.code(),
                "Discount code rejected"
            );
            return Err(rejection.into());
        }
        Ok(discount)
    }

    pub async fn list_codes(&self, ctx: &AuthorizationContext) -> BillingResult<Vec<DiscountCode>> {
        ctx.require_platform_admin()?;
        let codes: Vec<DiscountCode> = sqlx::query_as(&format!(
            "SELECT {} FROM discount_codes ORDER BY created_at DESC",
            DISCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(codes)
    }

    pub async fn create_code(
        &self,
        ctx: &AuthorizationContext,
        new_code: NewDiscountCode,
    ) -> BillingResult<DiscountCode> {
        ctx.require_platform_admin()?;
        new_code.validate()?;

        let result = sqlx::query_as::<_, DiscountCode>(&format!(
            r#"
            INSERT INTO discount_codes (
                code, name, description, discount_type, discount_value, max_discount_cents,
                currency, applicable_plan_id, max_uses, max_uses_per_org,
                valid_from, valid_until, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            DISCOUNT_COLUMNS
        ))
        .bind(new_code.normalized_code())
        .bind(new_code.name.trim())
        .bind(&new_code.description)
        .bind(new_code.discount_type)
        .bind(new_code.discount_value)
        .bind(new_code.max_discount_cents)
        .bind(new_code.currency)
        .bind(new_code.applicable_plan_id)
        .bind(new_code.max_uses)
        .bind(new_code.max_uses_per_org)
        .bind(new_code.valid_from)
        .bind(new_code.valid_until)
        .bind(ctx.user_id)
        .fetch_one(&self.pool)
        .await;

        let discount = match result {
            Ok(discount) => discount,
            Err(e) if is_unique_violation(&e, "discount_codes_code_key") => {
                return Err(BillingError::validation("code", "already exists"));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            discount_code_id = %discount.id,
            code = %discount.code,
            created_by = %ctx.user_id,
            "Discount code created"
        );
        Ok(discount)
    }

    /// Bump `current_uses` unless the code is exhausted or `org_id` hit its
    /// per-organization cap. Runs inside the caller's transaction; the row
    /// lock taken by the UPDATE serializes concurrent confirmations, and the
    /// caller holds the organization lock.
    pub(crate) async fn increment_usage_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        discount_code_id: Uuid,
        org_id: Uuid,
    ) -> BillingResult<CounterResult> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE discount_codes SET
                current_uses = current_uses + 1,
                updated_at = NOW()
            WHERE id = $1
              AND (max_uses IS NULL OR current_uses < max_uses)
              AND max_uses_per_org > (
                  SELECT COUNT(*) FROM discount_code_usage
                  WHERE discount_code_id = $1 AND organization_id = $2
              )
            "#,
        )
        .bind(discount_code_id)
        .bind(org_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?
        .rows_affected();

        if rows_affected > 0 {
            return Ok(CounterResult::Incremented);
        }

        let exhausted: Option<bool> = sqlx::query_scalar(
            "SELECT max_uses IS NOT NULL AND current_uses >= max_uses FROM discount_codes WHERE id = $1",
        )
        .bind(discount_code_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(match exhausted {
            Some(false) => CounterResult::OrgCapReached,
            _ => CounterResult::Exhausted,
        })
    }

    /// Record a redemption for a payment. Returns false when one already exists.
    pub(crate) async fn record_redemption_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        discount_code_id: Uuid,
        org_id: Uuid,
        payment_record_id: Uuid,
        discount_applied_cents: i64,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            INSERT INTO discount_code_usage
                (discount_code_id, organization_id, payment_record_id, discount_applied_cents)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (payment_record_id) DO NOTHING
            "#,
        )
        .bind(discount_code_id)
        .bind(org_id)
        .bind(payment_record_id)
        .bind(discount_applied_cents)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?
        .rows_affected();

        Ok(rows_affected > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_counter_result_rejections() {
        assert_eq!(CounterResult::Incremented.rejection(), None);
        assert_eq!(
            CounterResult::Exhausted.rejection(),
            Some(DiscountRejection::Exhausted)
        );
        assert_eq!(
            CounterResult::OrgCapReached.rejection(),
            Some(DiscountRejection::OrgCapReached)
        );
    }

    pub(crate) fn code_fixture(discount_type: DiscountType, value: i64) -> DiscountCode {
        DiscountCode {
            id: Uuid::new_v4(),
            code: "WELCOME".to_string(),
            name: "Welcome".to_string(),
            description: None,
            discount_type,
            discount_value: value,
            max_discount_cents: None,
            currency: None,
            applicable_plan_id: None,
            max_uses: None,
            current_uses: 0,
            max_uses_per_org: 1,
            valid_from: None,
            valid_until: None,
            is_active: true,
            created_by: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn context(plan_id: Uuid) -> DiscountContext {
        DiscountContext {
            plan_id,
            currency: Currency::Afn,
            today: date!(2026 - 03 - 15),
            org_redemptions: 0,
        }
    }

    #[test]
    fn test_percentage_discount() {
        let code = code_fixture(DiscountType::Percentage, 1_000);
        assert_eq!(code.discount_for(22_000), 2_200);
    }

    #[test]
    fn test_percentage_discount_respects_cap() {
        let mut code = code_fixture(DiscountType::Percentage, 5_000);
        code.max_discount_cents = Some(3_000);
        assert_eq!(code.discount_for(22_000), 3_000);
    }

    #[test]
    fn test_fixed_discount_never_exceeds_subtotal() {
        let code = code_fixture(DiscountType::Fixed, 50_000);
        assert_eq!(code.discount_for(22_000), 22_000);
        assert_eq!(code.discount_for(0), 0);
    }

    #[test]
    fn test_check_date_window() {
        let plan_id = Uuid::new_v4();
        let mut code = code_fixture(DiscountType::Fixed, 100);
        code.valid_from = Some(date!(2026 - 04 - 01));
        assert_eq!(
            code.check(&context(plan_id)),
            Err(DiscountRejection::NotYetValid)
        );

        code.valid_from = Some(date!(2026 - 01 - 01));
        code.valid_until = Some(date!(2026 - 03 - 14));
        assert_eq!(code.check(&context(plan_id)), Err(DiscountRejection::Expired));

        // Both bounds inclusive
        code.valid_until = Some(date!(2026 - 03 - 15));
        assert_eq!(code.check(&context(plan_id)), Ok(()));
    }

    #[test]
    fn test_check_currency_and_plan() {
        let plan_id = Uuid::new_v4();
        let mut code = code_fixture(DiscountType::Fixed, 100);
        code.currency = Some(Currency::Usd);
        assert_eq!(
            code.check(&context(plan_id)),
            Err(DiscountRejection::WrongCurrency)
        );

        code.currency = Some(Currency::Afn);
        code.applicable_plan_id = Some(Uuid::new_v4());
        assert_eq!(code.check(&context(plan_id)), Err(DiscountRejection::WrongPlan));

        code.applicable_plan_id = Some(plan_id);
        assert_eq!(code.check(&context(plan_id)), Ok(()));
    }

    #[test]
    fn test_check_usage_caps() {
        let plan_id = Uuid::new_v4();
        let mut code = code_fixture(DiscountType::Fixed, 100);
        code.max_uses = Some(3);
        code.current_uses = 3;
        assert_eq!(code.check(&context(plan_id)), Err(DiscountRejection::Exhausted));

        code.current_uses = 2;
        let mut ctx = context(plan_id);
        ctx.org_redemptions = 1;
        assert_eq!(code.check(&ctx), Err(DiscountRejection::OrgCapReached));
    }

    #[test]
    fn test_inactive_code_rejected_first() {
        let mut code = code_fixture(DiscountType::Fixed, 100);
        code.is_active = false;
        code.max_uses = Some(0);
        assert_eq!(
            code.check(&context(Uuid::new_v4())),
            Err(DiscountRejection::Inactive)
        );
    }

    #[test]
    fn test_new_code_validation() {
        let new_code: NewDiscountCode = serde_json::from_value(serde_json::json!({
            "code": " spring26 ",
            "name": "Spring",
            "discount_type": "percentage",
            "discount_value": 2500,
            "valid_from": "2026-03-01",
            "valid_until": "2026-05-31"
        }))
        .unwrap();
        assert!(new_code.validate().is_ok());
        assert_eq!(new_code.normalized_code(), "SPRING26");
        assert_eq!(new_code.max_uses_per_org, 1);

        let too_much = NewDiscountCode {
            discount_value: 10_001,
            ..new_code.clone()
        };
        assert!(too_much.validate().is_err());

        let backwards = NewDiscountCode {
            valid_from: Some(date!(2026 - 06 - 01)),
            ..new_code
        };
        assert!(backwards.validate().is_err());
    }
}
