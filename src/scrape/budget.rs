//! Cost ceiling for a paid scrape run.
//!
//! Money is carried in integer micro-dollars so that budget splits and the
//! inverse pricing function are exact.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::BudgetConfig;
use crate::error::JobError;
use crate::ScrapeRequest;

const MICROS_PER_CENT: u64 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usd(u64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    pub const fn from_micros(micros: u64) -> Self {
        Usd(micros)
    }

    pub const fn from_cents(cents: u64) -> Self {
        Usd(cents * MICROS_PER_CENT)
    }

    /// Rounds to the nearest micro-dollar; negative and non-finite input is zero.
    pub fn from_dollars(dollars: f64) -> Self {
        if !dollars.is_finite() || dollars <= 0.0 {
            return Usd::ZERO;
        }
        Usd((dollars * 1_000_000.0).round() as u64)
    }

    pub const fn micros(&self) -> u64 {
        self.0
    }

    /// Dollars with two decimals, truncated so a ceiling is never raised.
    pub fn floor_dollars(&self) -> String {
        let cents = self.0 / MICROS_PER_CENT;
        format!("{}.{:02}", cents / 100, cents % 100)
    }

    pub fn saturating_sub(self, other: Usd) -> Usd {
        Usd(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }

    pub fn abs_diff(self, other: Usd) -> Usd {
        Usd(self.0.abs_diff(other.0))
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cents = (self.0 + MICROS_PER_CENT / 2) / MICROS_PER_CENT;
        write!(f, "${}.{:02}", cents / 100, cents % 100)
    }
}

/// Linear per-item price, rounded up to the next micro-dollar.
pub fn cost_of(items: u64, price_per_thousand: Usd) -> Usd {
    let micros = (items as u128 * price_per_thousand.0 as u128).div_ceil(1000);
    Usd(micros.min(u64::MAX as u128) as u64)
}

/// Inverse of [`cost_of`]: how many items `budget` pays for.
pub fn items_for(budget: Usd, price_per_thousand: Usd) -> u64 {
    if price_per_thousand.0 == 0 {
        return 0;
    }
    let items = budget.0 as u128 * 1000 / price_per_thousand.0 as u128;
    items.min(u64::MAX as u128) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    Explicit,
    IncludedWindow,
    BudgetMaximum,
}

/// Every number behind a run's budget decision, recorded before the run
/// starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPlan {
    pub monthly_cap: Usd,
    pub monthly_spent: Usd,
    pub monthly_remaining: Usd,
    pub per_run_ceiling: Usd,
    pub effective_run_budget: Usd,
    pub timeline_count: Option<u64>,
    pub timeline_count_source: Option<CountSource>,
    pub timeline_estimate: Usd,
    pub social_budget: Option<Usd>,
    pub social_max_items: Option<u64>,
}

/// Decides how many items of each category a run may request.
pub fn plan(
    request: &ScrapeRequest,
    config: &BudgetConfig,
    monthly_spent: Usd,
) -> Result<BudgetPlan, JobError> {
    if request.username.trim().is_empty() {
        return Err(JobError::Validation("A username is required".into()));
    }
    if request.categories.is_empty() {
        return Err(JobError::Validation(
            "Select at least one category to back up".into(),
        ));
    }

    let monthly_remaining = config.monthly_cap.saturating_sub(monthly_spent);
    let effective_run_budget = config.per_run_ceiling.min(monthly_remaining);
    if effective_run_budget == Usd::ZERO {
        return Err(JobError::Validation(format!(
            "Monthly snapshot budget of {} is used up",
            config.monthly_cap
        )));
    }

    let mut plan = BudgetPlan {
        monthly_cap: config.monthly_cap,
        monthly_spent,
        monthly_remaining,
        per_run_ceiling: config.per_run_ceiling,
        effective_run_budget,
        timeline_count: None,
        timeline_count_source: None,
        timeline_estimate: Usd::ZERO,
        social_budget: None,
        social_max_items: None,
    };

    if request.wants_timeline() {
        let (count, source) = match &request.timeline_count {
            Some(raw) => (explicit_count(raw)?, CountSource::Explicit),
            None if request.wants_social_graph() => {
                (config.included_timeline_items, CountSource::IncludedWindow)
            }
            None => (
                items_for(effective_run_budget, config.timeline_price_per_thousand),
                CountSource::BudgetMaximum,
            ),
        };
        if count == 0 {
            return Err(JobError::Validation(format!(
                "A run budget of {effective_run_budget} does not cover any posts"
            )));
        }
        let estimate = cost_of(count, config.timeline_price_per_thousand);
        if estimate > effective_run_budget {
            return Err(JobError::Validation(format!(
                "{count} posts would cost about {estimate}, over this run's budget of {effective_run_budget}"
            )));
        }
        plan.timeline_count = Some(count);
        plan.timeline_count_source = Some(source);
        plan.timeline_estimate = estimate;
    }

    if request.wants_social_graph() {
        let residual = effective_run_budget.saturating_sub(plan.timeline_estimate);
        let max_items = items_for(residual, config.social_price_per_thousand);
        if max_items == 0 {
            return Err(JobError::Validation(format!(
                "No budget left for followers or following after {} of posts",
                plan.timeline_estimate
            )));
        }
        plan.social_budget = Some(residual);
        plan.social_max_items = Some(max_items);
    }

    Ok(plan)
}

fn explicit_count(raw: &serde_json::Number) -> Result<u64, JobError> {
    match raw.as_u64() {
        Some(count) if count > 0 => Ok(count),
        _ => Err(JobError::Validation(format!(
            "Post count must be a positive whole number, got {raw}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScrapeCategory;

    fn request(categories: &[ScrapeCategory], count: Option<serde_json::Number>) -> ScrapeRequest {
        ScrapeRequest {
            username: "jack".into(),
            categories: categories.to_vec(),
            timeline_count: count,
        }
    }

    fn config(monthly_cap: Usd, per_run: Usd) -> BudgetConfig {
        BudgetConfig {
            monthly_cap,
            per_run_ceiling: per_run,
            included_timeline_items: 100,
            timeline_price_per_thousand: Usd::from_cents(40),
            social_price_per_thousand: Usd::from_cents(40),
        }
    }

    #[test]
    fn timeline_only_spends_whole_remaining_budget() {
        let cfg = config(Usd::from_cents(1_000), Usd::from_cents(500));
        let plan = plan(
            &request(&[ScrapeCategory::Posts], None),
            &cfg,
            Usd::from_cents(800),
        )
        .unwrap();
        assert_eq!(plan.monthly_remaining, Usd::from_cents(200));
        assert_eq!(plan.effective_run_budget, Usd::from_cents(200));
        assert_eq!(plan.timeline_count, Some(5000));
        assert_eq!(plan.timeline_count_source, Some(CountSource::BudgetMaximum));
        assert_eq!(plan.timeline_estimate, Usd::from_cents(200));
        assert_eq!(plan.social_max_items, None);
    }

    #[test]
    fn social_graph_keeps_timeline_to_included_window() {
        let cfg = config(Usd::from_cents(1_000), Usd::from_cents(500));
        let plan = plan(
            &request(&[ScrapeCategory::Posts, ScrapeCategory::Followers], None),
            &cfg,
            Usd::ZERO,
        )
        .unwrap();
        assert_eq!(plan.effective_run_budget, Usd::from_cents(500));
        assert_eq!(plan.timeline_count, Some(100));
        assert_eq!(plan.timeline_estimate, Usd::from_cents(4));
        assert_eq!(plan.social_budget, Some(Usd::from_cents(496)));
        assert_eq!(plan.social_max_items, Some(12_400));
    }

    #[test]
    fn explicit_count_is_honored_exactly() {
        let cfg = config(Usd::from_cents(1_000), Usd::from_cents(500));
        let plan = plan(
            &request(&[ScrapeCategory::Posts], Some(250.into())),
            &cfg,
            Usd::ZERO,
        )
        .unwrap();
        assert_eq!(plan.timeline_count, Some(250));
        assert_eq!(plan.timeline_count_source, Some(CountSource::Explicit));
    }

    #[test]
    fn fractional_or_non_positive_counts_are_rejected() {
        let cfg = config(Usd::from_cents(1_000), Usd::from_cents(500));
        for raw in [
            serde_json::Number::from_f64(12.5).unwrap(),
            serde_json::Number::from(0),
            serde_json::Number::from(-4),
        ] {
            let err = plan(&request(&[ScrapeCategory::Posts], Some(raw)), &cfg, Usd::ZERO)
                .unwrap_err();
            assert!(matches!(err, JobError::Validation(_)));
        }
    }

    #[test]
    fn estimate_over_budget_is_rejected() {
        let cfg = config(Usd::from_cents(1_000), Usd::from_cents(500));
        let err = plan(
            &request(&[ScrapeCategory::Posts], Some(20_000.into())),
            &cfg,
            Usd::ZERO,
        )
        .unwrap_err();
        assert!(err.to_string().contains("over this run's budget of $5.00"));
    }

    #[test]
    fn social_graph_without_residual_is_rejected() {
        let cfg = config(Usd::from_cents(1_000), Usd::from_cents(500));
        let err = plan(
            &request(
                &[ScrapeCategory::Posts, ScrapeCategory::Following],
                Some(12_500.into()),
            ),
            &cfg,
            Usd::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn exhausted_month_is_rejected() {
        let cfg = config(Usd::from_cents(1_000), Usd::from_cents(500));
        let err = plan(
            &request(&[ScrapeCategory::Followers], None),
            &cfg,
            Usd::from_cents(1_200),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn pricing_rounds_cost_up_and_items_down() {
        let price = Usd::from_cents(40);
        assert_eq!(cost_of(1, price), Usd::from_micros(400));
        assert_eq!(cost_of(3, Usd::from_micros(333)), Usd::from_micros(1));
        assert_eq!(items_for(Usd::from_micros(799), price), 1);
        assert_eq!(items_for(Usd::from_cents(200), price), 5000);
        assert_eq!(items_for(Usd::from_cents(200), Usd::ZERO), 0);
    }

    #[test]
    fn display_rounds_to_cents() {
        assert_eq!(Usd::from_cents(205).to_string(), "$2.05");
        assert_eq!(Usd::from_micros(4_999).to_string(), "$0.00");
        assert_eq!(Usd::from_micros(5_000).to_string(), "$0.01");
        assert_eq!(Usd::from_dollars(1.234567).micros(), 1_234_567);
    }

    #[test]
    fn charge_ceiling_is_truncated_to_cents() {
        assert_eq!(Usd::from_micros(1_239_999).floor_dollars(), "1.23");
        assert_eq!(Usd::from_micros(9_999).floor_dollars(), "0.00");
        assert_eq!(Usd::from_cents(1_005).floor_dollars(), "10.05");
    }
}
