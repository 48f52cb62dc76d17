use serde::{Deserialize, Serialize};

use super::tax;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    England,
    Scotland,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentWrapper {
    Isa,
    Gia,
}

/// How the loan's annual interest rate is set each tax year.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InterestRateModel {
    Fixed {
        annual_rate: f64,
    },
    /// RPI plus a flat premium.
    RpiLinked { premium: f64 },
    /// RPI at or below the repayment threshold, RPI + `max_premium` at or above
    /// `upper_threshold`, linear in between.
    Plan2 {
        max_premium: f64,
        upper_threshold: f64,
    },
}

impl InterestRateModel {
    pub fn plan2() -> Self {
        InterestRateModel::Plan2 {
            max_premium: tax::SL_INTEREST_MAX_PREMIUM,
            upper_threshold: tax::SL_INTEREST_UPPER_THRESHOLD,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalaryModel {
    pub initial: f64,
    pub growth_mean: f64,
    pub growth_volatility: f64,
    pub redundancy_probability: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InflationModel {
    pub mean: f64,
    pub volatility: f64,
    pub return_correlation: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentModel {
    pub expected_return: f64,
    pub volatility: f64,
    pub wrapper: InvestmentWrapper,
}

/// Plan 2 repayment thresholds by tax year.
///
/// Published values win; earlier unpublished years sit at `frozen_value`
/// until `frozen_until`, after which the threshold grows with RPI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepaymentThresholdSchedule {
    pub published: Vec<(i32, f64)>,
    pub frozen_value: f64,
    pub frozen_until: i32,
}

impl RepaymentThresholdSchedule {
    pub fn plan2() -> Self {
        Self {
            published: tax::SL_PLAN2_PUBLISHED_THRESHOLDS.to_vec(),
            frozen_value: tax::SL_PLAN2_FREEZE_VALUE,
            frozen_until: tax::SL_PLAN2_FREEZE_UNTIL,
        }
    }

    /// A threshold that never moves.
    pub fn flat(value: f64) -> Self {
        Self {
            published: Vec::new(),
            frozen_value: value,
            frozen_until: i32::MAX,
        }
    }

    pub fn threshold(&self, tax_year: i32, rpi: f64) -> f64 {
        if let Some(&(_, value)) = self.published.iter().find(|(year, _)| *year == tax_year) {
            return value;
        }
        if tax_year < self.frozen_until {
            return self.frozen_value;
        }
        let years = tax_year - self.frozen_until;
        self.frozen_value * (1.0 + rpi).powi(years)
    }

    /// Ratio by which the schedule has been indexed past its freeze.
    pub fn indexation(&self, tax_year: i32, rpi: f64) -> f64 {
        if tax_year < self.frozen_until || self.frozen_value <= 0.0 {
            1.0
        } else {
            self.threshold(tax_year, rpi) / self.frozen_value
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParameters {
    pub loan_balance: f64,
    pub salary: SalaryModel,
    pub region: Region,
    pub interest_rate: InterestRateModel,
    pub inflation: InflationModel,
    pub thresholds: RepaymentThresholdSchedule,
    pub monthly_overpayment: f64,
    pub investment: InvestmentModel,
    pub age: u32,
    pub years_since_first_repayment: u32,
    pub write_off_years: u32,
    pub base_tax_year: i32,
    pub trials: u32,
    pub seed: Option<u64>,
}

impl SimulationParameters {
    /// Years left until the balance is written off. Zero when the inputs are
    /// inconsistent; validation rejects that case.
    pub fn horizon_years(&self) -> u32 {
        self.write_off_years
            .saturating_sub(self.years_since_first_repayment)
    }

    pub fn horizon_months(&self) -> u32 {
        self.horizon_years() * 12
    }

    pub fn write_off_age(&self) -> u32 {
        self.age + self.horizon_years()
    }
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            loan_balance: 45_000.0,
            salary: SalaryModel {
                initial: 35_000.0,
                growth_mean: 0.035,
                growth_volatility: 0.02,
                redundancy_probability: 0.03,
            },
            region: Region::England,
            interest_rate: InterestRateModel::plan2(),
            inflation: InflationModel {
                mean: 0.032,
                volatility: 0.015,
                return_correlation: 0.3,
            },
            thresholds: RepaymentThresholdSchedule::plan2(),
            monthly_overpayment: 200.0,
            investment: InvestmentModel {
                expected_return: 0.07,
                volatility: 0.15,
                wrapper: InvestmentWrapper::Isa,
            },
            age: 25,
            years_since_first_repayment: 1,
            write_off_years: tax::SL_WRITE_OFF_YEARS,
            base_tax_year: tax::BASE_TAX_YEAR,
            trials: 10_000,
            seed: Some(42),
        }
    }
}

/// What one strategy ended with on one simulated path.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOutcome {
    pub total_repaid: f64,
    pub interest_accrued: f64,
    /// Balance forgiven at the horizon.
    pub written_off: f64,
    /// 1-based month in which the balance reached zero.
    pub cleared_at_month: Option<u32>,
    pub contributions: f64,
    pub portfolio_value: f64,
}

impl StrategyOutcome {
    pub fn is_finite(&self) -> bool {
        self.total_repaid.is_finite()
            && self.interest_accrued.is_finite()
            && self.written_off.is_finite()
            && self.contributions.is_finite()
            && self.portfolio_value.is_finite()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialResult {
    pub index: u32,
    pub overpay: StrategyOutcome,
    pub invest: StrategyOutcome,
}

impl TrialResult {
    /// Terminal portfolio of investing minus that of overpaying.
    pub fn invest_advantage(&self) -> f64 {
        self.invest.portfolio_value - self.overpay.portfolio_value
    }

    pub fn invest_wins(&self) -> bool {
        self.invest.portfolio_value > self.overpay.portfolio_value
    }

    pub fn overpay_wins(&self) -> bool {
        self.overpay.portfolio_value > self.invest.portfolio_value
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionStats {
    pub mean: f64,
    pub min: f64,
    pub p10: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub p90: f64,
    pub max: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySummary {
    pub net_worth: DistributionStats,
    pub total_repaid: DistributionStats,
    pub interest_accrued: DistributionStats,
    pub written_off: DistributionStats,
    pub loan_cleared_rate: f64,
    /// Only reported when at least half of the trials clear the loan.
    pub median_months_to_clear: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialWarning {
    pub trial_index: u32,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub seed: u64,
    pub trials_requested: u32,
    pub trials_included: u32,
    pub overpay: StrategySummary,
    pub invest: StrategySummary,
    pub invest_advantage: DistributionStats,
    pub probability_invest_wins: f64,
    pub warnings: Vec<TrialWarning>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearSnapshot {
    pub year: u32,
    pub age: u32,
    pub tax_year: i32,
    pub median_salary: f64,
    pub median_rpi: f64,
    pub overpay_balance: PercentileBand,
    pub overpay_portfolio: PercentileBand,
    pub invest_balance: PercentileBand,
    pub invest_portfolio: PercentileBand,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBand {
    pub p10: f64,
    pub median: f64,
    pub p90: f64,
}
