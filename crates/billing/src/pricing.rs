//! Renewal price calculation

use schoolsaas_shared::Currency;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::discount::{DiscountCode, DiscountService};
use crate::error::{BillingError, BillingResult};
use crate::plans::{Plan, PlanCatalog};

/// Itemized price for a plan, school count and optional discount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub plan_id: Uuid,
    pub currency: Currency,
    pub base_price_cents: i64,
    pub additional_schools: i32,
    pub per_school_price_cents: i64,
    pub schools_price_cents: i64,
    pub subtotal_cents: i64,
    pub discount_code_id: Option<Uuid>,
    pub discount_code: Option<String>,
    pub discount_cents: i64,
    pub total_cents: i64,
    /// Total was entered manually by an operator
    pub amount_overridden: bool,
}

/// Price a plan. `discount` must already have passed [`DiscountCode::check`].
pub fn quote(
    plan: &Plan,
    currency: Currency,
    additional_schools: i32,
    discount: Option<&DiscountCode>,
    override_total_cents: Option<i64>,
) -> BillingResult<PriceQuote> {
    if additional_schools < 0 {
        return Err(BillingError::validation(
            "additional_schools",
            "must be >= 0",
        ));
    }
    if matches!(override_total_cents, Some(v) if v < 0) {
        return Err(BillingError::validation("amount_cents", "must be >= 0"));
    }

    let base_price_cents = plan.price_cents(currency);
    let per_school_price_cents = plan.per_school_price_cents(currency);
    let schools_price_cents = per_school_price_cents
        .checked_mul(i64::from(additional_schools))
        .ok_or_else(|| BillingError::validation("additional_schools", "price overflow"))?;
    let subtotal_cents = base_price_cents
        .checked_add(schools_price_cents)
        .ok_or_else(|| BillingError::validation("additional_schools", "price overflow"))?;

    let discount_cents = discount.map_or(0, |code| code.discount_for(subtotal_cents));
    let computed_total = (subtotal_cents - discount_cents).max(0);

    Ok(PriceQuote {
        plan_id: plan.id,
        currency,
        base_price_cents,
        additional_schools,
        per_school_price_cents,
        schools_price_cents,
        subtotal_cents,
        discount_code_id: discount.map(|code| code.id),
        discount_code: discount.map(|code| code.code.clone()),
        discount_cents,
        total_cents: override_total_cents.unwrap_or(computed_total),
        amount_overridden: override_total_cents.is_some(),
    })
}

/// Price request as submitted by an organization
#[derive(Debug, Clone, Deserialize)]
pub struct PriceRequest {
    pub plan_id: Uuid,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub additional_schools: i32,
    pub discount_code: Option<String>,
}

#[derive(Clone)]
pub struct PriceCalculator {
    plans: PlanCatalog,
    discounts: DiscountService,
}

impl PriceCalculator {
    pub fn new(plans: PlanCatalog, discounts: DiscountService) -> Self {
        Self { plans, discounts }
    }

    /// Quote `request` for `org_id`, validating plan availability and code
    pub async fn calculate(&self, org_id: Uuid, request: &PriceRequest) -> BillingResult<PriceQuote> {
        let plan = self.plans.get_plan(request.plan_id).await?;
        if !plan.is_available_to(org_id) {
            return Err(BillingError::validation(
                "plan_id",
                "plan is not available",
            ));
        }

        let discount = match request.discount_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Some(
                self.discounts
                    .validate_code(org_id, code, plan.id, request.currency)
                    .await?,
            ),
            _ => None,
        };

        quote(
            &plan,
            request.currency,
            request.additional_schools,
            discount.as_ref(),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discount::tests::code_fixture;
    use crate::plans::tests::plan_fixture;
    use schoolsaas_shared::DiscountType;

    #[test]
    fn test_quote_with_additional_schools() {
        // Pro 200 AFN + 10 AFN per school x 2 = 220 AFN
        let plan = plan_fixture("pro", 20_000, 1_000);
        let quote = quote(&plan, Currency::Afn, 2, None, None).unwrap();

        assert_eq!(quote.base_price_cents, 20_000);
        assert_eq!(quote.schools_price_cents, 2_000);
        assert_eq!(quote.subtotal_cents, 22_000);
        assert_eq!(quote.discount_cents, 0);
        assert_eq!(quote.total_cents, 22_000);
        assert!(!quote.amount_overridden);
    }

    #[test]
    fn test_quote_applies_discount() {
        let plan = plan_fixture("pro", 20_000, 1_000);
        let code = code_fixture(DiscountType::Percentage, 2_500);
        let quote = quote(&plan, Currency::Afn, 0, Some(&code), None).unwrap();

        assert_eq!(quote.discount_cents, 5_000);
        assert_eq!(quote.total_cents, 15_000);
        assert_eq!(quote.discount_code.as_deref(), Some("WELCOME"));
    }

    #[test]
    fn test_quote_rejects_negative_schools() {
        let plan = plan_fixture("pro", 20_000, 1_000);
        assert!(matches!(
            quote(&plan, Currency::Afn, -1, None, None),
            Err(BillingError::Validation { ref field, .. }) if field == "additional_schools"
        ));
    }

    #[test]
    fn test_quote_override_replaces_total() {
        let plan = plan_fixture("pro", 20_000, 1_000);
        let quote = quote(&plan, Currency::Afn, 1, None, Some(18_000)).unwrap();
        assert_eq!(quote.subtotal_cents, 21_000);
        assert_eq!(quote.total_cents, 18_000);
        assert!(quote.amount_overridden);
    }

    #[test]
    fn test_quote_overflow_is_validation_error() {
        let plan = plan_fixture("huge", 0, i64::MAX / 2);
        assert!(quote(&plan, Currency::Afn, 3, None, None).is_err());
    }
}
