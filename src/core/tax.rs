//! UK tax rules used by the simulator: income tax, National Insurance,
//! Plan 2 repayments and interest, and tax on a General Investment Account.
//!
//! Tax year 2025/26 is the base year. Income tax and NI thresholds stay frozen
//! until April 2028 and then grow with CPI.

use serde::Serialize;

use super::types::{InterestRateModel, Region};

pub const CPI_RATE: f64 = 0.02;
pub const BASE_TAX_YEAR: i32 = 2025;

pub const PERSONAL_ALLOWANCE: f64 = 12_570.0;
pub const PA_TAPER_THRESHOLD: f64 = 100_000.0;
pub const IT_FREEZE_UNTIL: i32 = 2028;

const ENGLAND_BANDS: [(f64, f64); 3] = [
    (50_270.0, 0.20),
    (125_140.0, 0.40),
    (f64::INFINITY, 0.45),
];

const SCOTLAND_BANDS: [(f64, f64); 6] = [
    (15_397.0, 0.19),
    (27_491.0, 0.20),
    (43_662.0, 0.21),
    (75_000.0, 0.42),
    (125_140.0, 0.45),
    (f64::INFINITY, 0.48),
];

pub const NI_FREEZE_UNTIL: i32 = 2028;
const NI_BANDS: [(f64, f64); 3] = [
    (12_570.0, 0.00),
    (50_270.0, 0.08),
    (f64::INFINITY, 0.02),
];

pub const SL_PLAN2_PUBLISHED_THRESHOLDS: [(i32, f64); 2] = [(2025, 28_470.0), (2026, 29_385.0)];
pub const SL_PLAN2_FREEZE_VALUE: f64 = 29_385.0;
pub const SL_PLAN2_FREEZE_UNTIL: i32 = 2030;
pub const SL_REPAYMENT_RATE: f64 = 0.09;
pub const SL_INTEREST_UPPER_THRESHOLD: f64 = 51_245.0;
pub const SL_INTEREST_MAX_PREMIUM: f64 = 0.03;
pub const SL_WRITE_OFF_YEARS: u32 = 30;

pub const CGT_ANNUAL_EXEMPT: f64 = 3_000.0;
pub const CGT_BASIC_RATE: f64 = 0.18;
pub const CGT_HIGHER_RATE: f64 = 0.24;

pub const DIVIDEND_ALLOWANCE: f64 = 500.0;
pub const DIVIDEND_BASIC_RATE: f64 = 0.0875;
pub const DIVIDEND_HIGHER_RATE: f64 = 0.3375;
pub const DIVIDEND_ADDITIONAL_RATE: f64 = 0.3935;

pub const BASIC_RATE_LIMIT: f64 = 50_270.0;
pub const ADDITIONAL_RATE_LIMIT: f64 = 125_140.0;

/// Share of total portfolio return treated as capital growth; the rest is
/// paid out as dividends.
pub const PORTFOLIO_CAPITAL_GROWTH_SHARE: f64 = 0.70;
pub const PORTFOLIO_DIVIDEND_SHARE: f64 = 0.30;

fn round_pennies(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Threshold after a freeze that ends in `freeze_until`, then CPI growth.
pub fn adjust_threshold(base: f64, freeze_until: i32, tax_year: i32) -> f64 {
    if tax_year < freeze_until {
        return base;
    }
    base * (1.0 + CPI_RATE).powi(tax_year - freeze_until)
}

pub fn personal_allowance(gross_income: f64, tax_year: i32) -> f64 {
    let allowance = adjust_threshold(PERSONAL_ALLOWANCE, IT_FREEZE_UNTIL, tax_year);
    let taper_start = adjust_threshold(PA_TAPER_THRESHOLD, IT_FREEZE_UNTIL, tax_year);
    let reduction = (gross_income - taper_start).max(0.0) / 2.0;
    (allowance - reduction).max(0.0)
}

pub fn income_tax(gross_income: f64, region: Region, tax_year: i32) -> f64 {
    let bands: &[(f64, f64)] = match region {
        Region::England => &ENGLAND_BANDS,
        Region::Scotland => &SCOTLAND_BANDS,
    };

    let standard_allowance = adjust_threshold(PERSONAL_ALLOWANCE, IT_FREEZE_UNTIL, tax_year);
    let taxable = (gross_income - personal_allowance(gross_income, tax_year)).max(0.0);

    // Band limits are quoted on gross income for someone with the standard
    // allowance; their widths apply to taxable income whatever the taper does.
    let mut tax = 0.0;
    let mut band_floor = 0.0;
    for &(upper, rate) in bands {
        let band_ceil = if upper.is_infinite() {
            f64::INFINITY
        } else {
            adjust_threshold(upper, IT_FREEZE_UNTIL, tax_year) - standard_allowance
        };
        let in_band = (taxable - band_floor).clamp(0.0, (band_ceil - band_floor).max(0.0));
        tax += in_band * rate;
        band_floor = band_ceil;
    }

    round_pennies(tax)
}

pub fn national_insurance(gross_income: f64, tax_year: i32) -> f64 {
    let mut ni = 0.0;
    let mut prev_upper = 0.0;
    for &(upper, rate) in &NI_BANDS {
        let upper = if upper.is_infinite() {
            upper
        } else {
            adjust_threshold(upper, NI_FREEZE_UNTIL, tax_year)
        };
        let in_band = (gross_income - prev_upper).clamp(0.0, upper - prev_upper);
        ni += in_band * rate;
        prev_upper = upper;
    }
    round_pennies(ni)
}

/// Mandatory annual Plan 2 repayment.
pub fn student_loan_repayment(gross_income: f64, threshold: f64) -> f64 {
    ((gross_income - threshold) * SL_REPAYMENT_RATE).max(0.0)
}

/// Annual loan interest rate for one tax year.
pub fn student_loan_interest_rate(
    model: InterestRateModel,
    gross_income: f64,
    rpi: f64,
    threshold: f64,
    indexation: f64,
) -> f64 {
    match model {
        InterestRateModel::Fixed { annual_rate } => annual_rate,
        InterestRateModel::RpiLinked { premium } => rpi + premium,
        InterestRateModel::Plan2 {
            max_premium,
            upper_threshold,
        } => {
            let upper = upper_threshold * indexation;
            let fraction = if upper <= threshold {
                if gross_income > threshold { 1.0 } else { 0.0 }
            } else {
                ((gross_income - threshold) / (upper - threshold)).clamp(0.0, 1.0)
            };
            rpi + fraction * max_premium
        }
    }
}

pub fn take_home_pay(
    gross_income: f64,
    region: Region,
    tax_year: i32,
    student_loan_threshold: Option<f64>,
) -> f64 {
    let it = income_tax(gross_income, region, tax_year);
    let ni = national_insurance(gross_income, tax_year);
    let sl = student_loan_threshold
        .map(|threshold| student_loan_repayment(gross_income, threshold))
        .unwrap_or(0.0);
    gross_income - it - ni - sl
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginalRates {
    pub income_tax_pct: f64,
    pub ni_pct: f64,
    pub student_loan_pct: f64,
    pub total_marginal_pct: f64,
    pub effective_pct: f64,
}

/// Marginal and effective deduction rates at `salary`, measured with a £1
/// pay rise.
pub fn marginal_rate_breakdown(
    salary: f64,
    region: Region,
    tax_year: i32,
    student_loan_threshold: Option<f64>,
) -> MarginalRates {
    let raised = salary + 1.0;
    let sl = |income: f64| {
        student_loan_threshold
            .map(|threshold| student_loan_repayment(income, threshold))
            .unwrap_or(0.0)
    };

    let it = (
        income_tax(salary, region, tax_year),
        income_tax(raised, region, tax_year),
    );
    let ni = (
        national_insurance(salary, tax_year),
        national_insurance(raised, tax_year),
    );
    let loan = (sl(salary), sl(raised));

    let it_marginal = it.1 - it.0;
    let ni_marginal = ni.1 - ni.0;
    let sl_marginal = loan.1 - loan.0;
    let total_deductions = it.0 + ni.0 + loan.0;
    let effective = if salary > 0.0 {
        total_deductions / salary
    } else {
        0.0
    };

    let pct = |v: f64| round_pennies(v * 100.0);
    MarginalRates {
        income_tax_pct: pct(it_marginal),
        ni_pct: pct(ni_marginal),
        student_loan_pct: pct(sl_marginal),
        total_marginal_pct: pct(it_marginal + ni_marginal + sl_marginal),
        effective_pct: pct(effective),
    }
}

/// CGT plus dividend tax for GIA holdings; the rate band follows the
/// investor's employment income.
pub fn investment_tax(gains: f64, dividends: f64, taxable_income: f64, tax_year: i32) -> f64 {
    let basic_limit = adjust_threshold(BASIC_RATE_LIMIT, IT_FREEZE_UNTIL, tax_year);
    let additional_limit = adjust_threshold(ADDITIONAL_RATE_LIMIT, IT_FREEZE_UNTIL, tax_year);

    let taxable_gains = (gains - CGT_ANNUAL_EXEMPT).max(0.0);
    let cgt_rate = if taxable_income <= basic_limit {
        CGT_BASIC_RATE
    } else {
        CGT_HIGHER_RATE
    };

    let taxable_dividends = (dividends - DIVIDEND_ALLOWANCE).max(0.0);
    let dividend_rate = if taxable_income <= basic_limit {
        DIVIDEND_BASIC_RATE
    } else if taxable_income <= additional_limit {
        DIVIDEND_HIGHER_RATE
    } else {
        DIVIDEND_ADDITIONAL_RATE
    };

    round_pennies(taxable_gains * cgt_rate + taxable_dividends * dividend_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RepaymentThresholdSchedule;
    use proptest::prelude::{prop_assert, proptest};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn plan2_threshold(year: i32) -> f64 {
        RepaymentThresholdSchedule::plan2().threshold(year, 0.032)
    }

    #[test]
    fn england_income_tax_matches_published_examples() {
        assert_approx_tol(income_tax(35_000.0, Region::England, 2025), 4_486.0, 0.01);
        assert_approx_tol(income_tax(60_000.0, Region::England, 2025), 11_432.0, 0.01);
    }

    #[test]
    fn allowance_taper_raises_tax_at_110k() {
        assert_approx_tol(income_tax(110_000.0, Region::England, 2025), 33_432.0, 0.01);
        assert_approx_tol(personal_allowance(110_000.0, 2025), 7_570.0, 1e-9);
        assert_approx_tol(personal_allowance(130_000.0, 2025), 0.0, 1e-9);
    }

    #[test]
    fn scotland_starter_band_is_taxed_at_nineteen_percent() {
        // 2,827 at 19% then 2,603 at 20%.
        let tax = income_tax(18_000.0, Region::Scotland, 2025);
        assert_approx_tol(tax, 2_827.0 * 0.19 + 2_603.0 * 0.20, 0.01);
    }

    #[test]
    fn national_insurance_on_35k() {
        assert_approx_tol(national_insurance(35_000.0, 2025), 1_794.40, 0.005);
    }

    #[test]
    fn plan2_repayments_match_published_examples() {
        let threshold = plan2_threshold(2025);
        assert_approx_tol(student_loan_repayment(35_000.0, threshold), 587.70, 1e-6);
        assert_approx_tol(student_loan_repayment(60_000.0, threshold), 2_837.70, 1e-6);
        assert_approx_tol(student_loan_repayment(20_000.0, threshold), 0.0, 1e-12);
    }

    #[test]
    fn plan2_threshold_freezes_then_tracks_rpi() {
        assert_approx_tol(plan2_threshold(2025), 28_470.0, 1e-9);
        assert_approx_tol(plan2_threshold(2026), 29_385.0, 1e-9);
        assert_approx_tol(plan2_threshold(2029), 29_385.0, 1e-9);
        assert_approx_tol(plan2_threshold(2030), 29_385.0, 1e-9);
        assert_approx_tol(plan2_threshold(2032), 29_385.0 * 1.032 * 1.032, 1e-6);
    }

    #[test]
    fn plan2_interest_slides_between_rpi_and_rpi_plus_three() {
        let threshold = plan2_threshold(2025);
        let model = InterestRateModel::plan2();
        let at_35k = student_loan_interest_rate(model, 35_000.0, 0.032, threshold, 1.0);
        let at_60k = student_loan_interest_rate(model, 60_000.0, 0.032, threshold, 1.0);
        let at_20k = student_loan_interest_rate(model, 20_000.0, 0.032, threshold, 1.0);
        assert_approx_tol(at_35k * 100.0, 3.2 + 0.86, 0.01);
        assert_approx_tol(at_60k, 0.062, 1e-12);
        assert_approx_tol(at_20k, 0.032, 1e-12);
    }

    #[test]
    fn fixed_and_rpi_linked_rates_ignore_income() {
        let fixed = InterestRateModel::Fixed { annual_rate: 0.045 };
        let linked = InterestRateModel::RpiLinked { premium: 0.01 };
        assert_approx_tol(
            student_loan_interest_rate(fixed, 90_000.0, 0.05, 28_000.0, 1.0),
            0.045,
            1e-12,
        );
        assert_approx_tol(
            student_loan_interest_rate(linked, 10_000.0, 0.05, 28_000.0, 1.0),
            0.06,
            1e-12,
        );
    }

    #[test]
    fn marginal_rates_include_loan_and_taper() {
        let threshold = Some(plan2_threshold(2025));
        let at = |salary| marginal_rate_breakdown(salary, Region::England, 2025, threshold);
        assert_approx_tol(at(35_000.0).total_marginal_pct, 37.0, 1.0);
        assert_approx_tol(at(60_000.0).total_marginal_pct, 51.0, 1.0);
        assert_approx_tol(at(110_000.0).total_marginal_pct, 71.0, 1.0);
    }

    #[test]
    fn take_home_pay_deducts_all_components() {
        let threshold = plan2_threshold(2025);
        let net = take_home_pay(35_000.0, Region::England, 2025, Some(threshold));
        assert_approx_tol(net, 35_000.0 - 4_486.0 - 1_794.40 - 587.70, 0.02);
    }

    #[test]
    fn investment_tax_respects_allowances_and_bands() {
        assert_approx_tol(investment_tax(3_000.0, 500.0, 40_000.0, 2025), 0.0, 1e-12);
        assert_approx_tol(
            investment_tax(4_000.0, 0.0, 40_000.0, 2025),
            1_000.0 * CGT_BASIC_RATE,
            0.01,
        );
        assert_approx_tol(
            investment_tax(0.0, 1_500.0, 200_000.0, 2025),
            1_000.0 * DIVIDEND_ADDITIONAL_RATE,
            0.01,
        );
    }

    proptest! {
        #[test]
        fn income_tax_never_decreases_with_income(income in 0.0f64..400_000.0, raise in 0.0f64..50_000.0) {
            for region in [Region::England, Region::Scotland] {
                let low = income_tax(income, region, 2025);
                let high = income_tax(income + raise, region, 2025);
                prop_assert!(high + 0.01 >= low, "tax fell from {low} to {high}");
            }
        }

        #[test]
        fn deductions_never_exceed_gross(income in 0.0f64..1_000_000.0) {
            let net = take_home_pay(income, Region::England, 2030, Some(29_385.0));
            prop_assert!(net <= income + 1e-9);
            prop_assert!(net >= 0.0);
        }
    }
}
