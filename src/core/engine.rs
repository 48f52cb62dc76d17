use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, warn};

use super::error::SimulationError;
use super::market::{MarketPath, draw_path};
use super::tax;
use super::types::{
    DistributionStats, InvestmentWrapper, PercentileBand, SimulationParameters, SimulationSummary,
    StrategyOutcome, StrategySummary, TrialResult, TrialWarning, YearSnapshot,
};

/// Balances at or below this are treated as repaid.
const CLEARED_EPSILON: f64 = 0.01;

/// Shared flag an interactive caller can flip to stop a long run between
/// trials.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Execution {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Clone, Debug, Default)]
pub struct RunControl {
    pub execution: Execution,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Copy)]
struct LoanAccount {
    balance: f64,
    total_repaid: f64,
    interest_accrued: f64,
    cleared_at_month: Option<u32>,
}

impl LoanAccount {
    fn new(balance: f64) -> Self {
        Self {
            balance,
            total_repaid: 0.0,
            interest_accrued: 0.0,
            cleared_at_month: (balance <= CLEARED_EPSILON).then_some(0),
        }
    }

    fn is_active(&self) -> bool {
        self.cleared_at_month.is_none()
    }

    /// Accrues one month of interest, then pays up to `available`. Returns
    /// what was actually paid.
    fn step(&mut self, monthly_rate: f64, available: f64, month: u32) -> f64 {
        if !self.is_active() {
            return 0.0;
        }

        let interest = self.balance * monthly_rate;
        self.interest_accrued += interest;
        self.balance += interest;

        let payment = available.min(self.balance).max(0.0);
        self.balance -= payment;
        self.total_repaid += payment;

        if self.balance <= CLEARED_EPSILON {
            self.balance = 0.0;
            self.cleared_at_month = Some(month);
        }
        payment
    }

    fn write_off(&mut self) -> f64 {
        std::mem::replace(&mut self.balance, 0.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Portfolio {
    wrapper: InvestmentWrapper,
    value: f64,
    contributions: f64,
    growth_this_year: f64,
    cgt_exempt_used: f64,
}

impl Portfolio {
    fn new(wrapper: InvestmentWrapper) -> Self {
        Self {
            wrapper,
            value: 0.0,
            contributions: 0.0,
            growth_this_year: 0.0,
            cgt_exempt_used: 0.0,
        }
    }

    fn contribute_and_grow(&mut self, contribution: f64, monthly_return: f64) {
        self.value += contribution;
        self.contributions += contribution;
        let growth = self.value * monthly_return;
        self.value += growth;
        self.growth_this_year += growth;
    }

    /// GIA holdings pay dividend tax every year and use up the annual CGT
    /// exemption on part of the capital growth.
    fn close_tax_year(&mut self, salary: f64, tax_year: i32) {
        let growth = std::mem::replace(&mut self.growth_this_year, 0.0).max(0.0);
        if self.wrapper == InvestmentWrapper::Isa {
            return;
        }

        let dividends = growth * tax::PORTFOLIO_DIVIDEND_SHARE;
        let dividend_tax = tax::investment_tax(0.0, dividends, salary, tax_year);
        self.value -= dividend_tax.min(self.value);
        self.cgt_exempt_used +=
            (growth * tax::PORTFOLIO_CAPITAL_GROWTH_SHARE).min(tax::CGT_ANNUAL_EXEMPT);
    }

    /// Realises the remaining capital gain at the horizon.
    fn settle(&mut self, salary: f64, tax_year: i32) {
        if self.wrapper == InvestmentWrapper::Isa {
            return;
        }
        let capital_gain =
            (self.value - self.contributions).max(0.0) * tax::PORTFOLIO_CAPITAL_GROWTH_SHARE;
        let unrealised = (capital_gain - self.cgt_exempt_used).max(0.0);
        let cgt = tax::investment_tax(unrealised, 0.0, salary, tax_year);
        self.value -= cgt.min(self.value);
    }
}

/// Year-end state of one trial, used for the yearly trace.
#[derive(Debug, Clone, Copy)]
struct YearTracePoint {
    salary: f64,
    rpi: f64,
    overpay_balance: f64,
    overpay_portfolio: f64,
    invest_balance: f64,
    invest_portfolio: f64,
}

fn outcome(loan: &LoanAccount, written_off: f64, portfolio: &Portfolio) -> StrategyOutcome {
    StrategyOutcome {
        total_repaid: loan.total_repaid,
        interest_accrued: loan.interest_accrued,
        written_off,
        cleared_at_month: loan.cleared_at_month,
        contributions: portfolio.contributions,
        portfolio_value: portfolio.value,
    }
}

/// Runs both strategies over one drawn path.
fn simulate_path(
    params: &SimulationParameters,
    index: u32,
    path: &MarketPath,
    mut trace: Option<&mut Vec<YearTracePoint>>,
) -> TrialResult {
    let overpayment = params.monthly_overpayment;
    let policy_rpi = params.inflation.mean;
    let salaries = path.salaries(params.salary.initial);

    let mut overpay_loan = LoanAccount::new(params.loan_balance);
    let mut invest_loan = LoanAccount::new(params.loan_balance);
    let mut overpay_pot = Portfolio::new(params.investment.wrapper);
    let mut invest_pot = Portfolio::new(params.investment.wrapper);

    let mut month = 0_u32;
    let mut last_tax_year = params.base_tax_year;
    for (year_idx, (sample, &salary)) in path.years.iter().zip(&salaries).enumerate() {
        let tax_year = params.base_tax_year + year_idx as i32;
        last_tax_year = tax_year;

        let threshold = params.thresholds.threshold(tax_year, policy_rpi);
        let indexation = params.thresholds.indexation(tax_year, policy_rpi);
        let annual_rate = tax::student_loan_interest_rate(
            params.interest_rate,
            salary,
            sample.rpi,
            threshold,
            indexation,
        );
        let monthly_rate = annual_rate / 12.0;
        let mandatory = tax::student_loan_repayment(salary, threshold) / 12.0;

        for &monthly_return in &sample.monthly_returns {
            month += 1;

            // Whatever the loan no longer needs goes into the portfolio.
            let budget = mandatory + overpayment;
            let paid = overpay_loan.step(monthly_rate, budget, month);
            overpay_pot.contribute_and_grow(budget - paid, monthly_return);

            let paid = invest_loan.step(monthly_rate, mandatory, month);
            invest_pot.contribute_and_grow(overpayment + (mandatory - paid), monthly_return);
        }

        overpay_pot.close_tax_year(salary, tax_year);
        invest_pot.close_tax_year(salary, tax_year);

        if let Some(points) = trace.as_mut() {
            points.push(YearTracePoint {
                salary,
                rpi: sample.rpi,
                overpay_balance: overpay_loan.balance,
                overpay_portfolio: overpay_pot.value,
                invest_balance: invest_loan.balance,
                invest_portfolio: invest_pot.value,
            });
        }
    }

    let final_salary = salaries.last().copied().unwrap_or(params.salary.initial);
    overpay_pot.settle(final_salary, last_tax_year);
    invest_pot.settle(final_salary, last_tax_year);

    let overpay_written_off = overpay_loan.write_off();
    let invest_written_off = invest_loan.write_off();

    TrialResult {
        index,
        overpay: outcome(&overpay_loan, overpay_written_off, &overpay_pot),
        invest: outcome(&invest_loan, invest_written_off, &invest_pot),
    }
}

/// One trial with its own random stream derived from `(seed, index)`.
pub fn simulate_trial(params: &SimulationParameters, seed: u64, index: u32) -> TrialResult {
    let path = draw_path(params, seed, index);
    simulate_path(params, index, &path, None)
}

fn checked_trial(params: &SimulationParameters, seed: u64, index: u32) -> Result<TrialResult, TrialWarning> {
    let result = simulate_trial(params, seed, index);
    if result.overpay.is_finite() && result.invest.is_finite() {
        Ok(result)
    } else {
        Err(non_finite_warning(index))
    }
}

fn non_finite_warning(index: u32) -> TrialWarning {
    TrialWarning {
        trial_index: index,
        reason: "non-finite value in trial outcome".to_string(),
    }
}

fn log_excluded(warning: &TrialWarning) {
    warn!(
        trial = warning.trial_index,
        reason = %warning.reason,
        "excluding trial from summary"
    );
}

/// Every included trial of one run, in trial-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialBatch {
    pub seed: u64,
    pub results: Vec<TrialResult>,
    pub warnings: Vec<TrialWarning>,
}

pub fn run(params: &SimulationParameters) -> Result<SimulationSummary, SimulationError> {
    run_with(params, &RunControl::default())
}

pub fn run_with(
    params: &SimulationParameters,
    control: &RunControl,
) -> Result<SimulationSummary, SimulationError> {
    let batch = run_trials(params, control)?;
    Ok(summarize(params.trials, batch))
}

/// Validates, then runs every trial. Non-finite trials are dropped with a
/// warning; a run where none survive fails.
pub fn run_trials(
    params: &SimulationParameters,
    control: &RunControl,
) -> Result<TrialBatch, SimulationError> {
    params.validate()?;
    let seed = resolve_seed(params);
    let started = Instant::now();
    debug!(
        trials = params.trials,
        seed,
        horizon_years = params.horizon_years(),
        execution = ?control.execution,
        "starting simulation"
    );

    let outcomes = collect_trials(params, control, |index| {
        checked_trial(params, seed, index)
    })?;

    let mut results = Vec::with_capacity(outcomes.len());
    let mut warnings = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(result) => results.push(result),
            Err(warning) => {
                log_excluded(&warning);
                warnings.push(warning);
            }
        }
    }

    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        included = results.len(),
        excluded = warnings.len(),
        "simulation finished"
    );

    if results.is_empty() {
        return Err(SimulationError::NoValidTrials {
            excluded: warnings.len() as u32,
        });
    }
    Ok(TrialBatch {
        seed,
        results,
        warnings,
    })
}

fn resolve_seed(params: &SimulationParameters) -> u64 {
    params.seed.unwrap_or_else(rand::random::<u64>)
}

/// Evaluates `trial` for every index, in index order, honouring the
/// execution mode and cancellation token.
fn collect_trials<T, F>(
    params: &SimulationParameters,
    control: &RunControl,
    trial: F,
) -> Result<Vec<T>, SimulationError>
where
    T: Send,
    F: Fn(u32) -> T + Sync + Send,
{
    let cancel = control.cancel.as_ref();
    let guarded = |index: u32| {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            None
        } else {
            Some(trial(index))
        }
    };

    let outcomes: Vec<Option<T>> = match control.execution {
        Execution::Sequential => (0..params.trials).map(guarded).collect(),
        Execution::Parallel => (0..params.trials).into_par_iter().map(guarded).collect(),
    };

    let completed = outcomes.iter().filter(|o| o.is_some()).count() as u32;
    if completed < params.trials {
        return Err(SimulationError::Cancelled { completed });
    }
    Ok(outcomes.into_iter().flatten().collect())
}

/// Aggregates a non-empty batch.
pub fn summarize(trials_requested: u32, batch: TrialBatch) -> SimulationSummary {
    let TrialBatch {
        seed,
        results,
        warnings,
    } = batch;
    let n = results.len().max(1) as f64;
    let wins = results.iter().filter(|r| r.invest_wins()).count();

    SimulationSummary {
        seed,
        trials_requested,
        trials_included: results.len() as u32,
        overpay: summarize_strategy(results.iter().map(|r| &r.overpay)),
        invest: summarize_strategy(results.iter().map(|r| &r.invest)),
        invest_advantage: distribution(results.iter().map(TrialResult::invest_advantage).collect()),
        probability_invest_wins: wins as f64 / n,
        warnings,
    }
}

fn summarize_strategy<'a>(outcomes: impl Iterator<Item = &'a StrategyOutcome> + Clone) -> StrategySummary {
    let column = |f: fn(&StrategyOutcome) -> f64| outcomes.clone().map(f).collect::<Vec<_>>();

    let trials = outcomes.clone().count();
    let mut cleared_months: Vec<f64> = outcomes
        .clone()
        .filter_map(|o| o.cleared_at_month)
        .map(f64::from)
        .collect();
    let loan_cleared_rate = if trials == 0 {
        0.0
    } else {
        cleared_months.len() as f64 / trials as f64
    };
    let median_months_to_clear = if loan_cleared_rate >= 0.5 && !cleared_months.is_empty() {
        Some(percentile(&mut cleared_months, 50.0))
    } else {
        None
    };

    StrategySummary {
        net_worth: distribution(column(|o| o.portfolio_value)),
        total_repaid: distribution(column(|o| o.total_repaid)),
        interest_accrued: distribution(column(|o| o.interest_accrued)),
        written_off: distribution(column(|o| o.written_off)),
        loan_cleared_rate,
        median_months_to_clear,
    }
}

/// Mean over the values in trial order, then order statistics.
fn distribution(mut values: Vec<f64>) -> DistributionStats {
    if values.is_empty() {
        return DistributionStats::default();
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.sort_by(|a, b| a.total_cmp(b));
    DistributionStats {
        mean,
        min: values[0],
        p10: percentile_sorted(&values, 10.0),
        p25: percentile_sorted(&values, 25.0),
        median: percentile_sorted(&values, 50.0),
        p75: percentile_sorted(&values, 75.0),
        p90: percentile_sorted(&values, 90.0),
        max: values[values.len() - 1],
    }
}

pub(crate) fn percentile(values: &mut [f64], p: f64) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(values, p)
}

fn percentile_sorted(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

struct YearlyAccumulator {
    salary: Vec<Vec<f64>>,
    rpi: Vec<Vec<f64>>,
    overpay_balance: Vec<Vec<f64>>,
    overpay_portfolio: Vec<Vec<f64>>,
    invest_balance: Vec<Vec<f64>>,
    invest_portfolio: Vec<Vec<f64>>,
}

impl YearlyAccumulator {
    fn new(year_count: usize, expected_samples: usize) -> Self {
        let make = || {
            (0..year_count)
                .map(|_| Vec::with_capacity(expected_samples))
                .collect::<Vec<_>>()
        };

        Self {
            salary: make(),
            rpi: make(),
            overpay_balance: make(),
            overpay_portfolio: make(),
            invest_balance: make(),
            invest_portfolio: make(),
        }
    }

    fn push(&mut self, index: usize, point: YearTracePoint) {
        self.salary[index].push(point.salary);
        self.rpi[index].push(point.rpi);
        self.overpay_balance[index].push(point.overpay_balance);
        self.overpay_portfolio[index].push(point.overpay_portfolio);
        self.invest_balance[index].push(point.invest_balance);
        self.invest_portfolio[index].push(point.invest_portfolio);
    }

    fn into_results(mut self, params: &SimulationParameters) -> Vec<YearSnapshot> {
        let band = |values: &mut Vec<f64>| {
            values.sort_by(|a, b| a.total_cmp(b));
            PercentileBand {
                p10: percentile_sorted(values, 10.0),
                median: percentile_sorted(values, 50.0),
                p90: percentile_sorted(values, 90.0),
            }
        };

        (0..self.salary.len())
            .map(|idx| YearSnapshot {
                year: idx as u32 + 1,
                age: params.age + idx as u32 + 1,
                tax_year: params.base_tax_year + idx as i32,
                median_salary: percentile(&mut self.salary[idx], 50.0),
                median_rpi: percentile(&mut self.rpi[idx], 50.0),
                overpay_balance: band(&mut self.overpay_balance[idx]),
                overpay_portfolio: band(&mut self.overpay_portfolio[idx]),
                invest_balance: band(&mut self.invest_balance[idx]),
                invest_portfolio: band(&mut self.invest_portfolio[idx]),
            })
            .collect()
    }
}

/// Year-by-year percentile bands of balances and portfolios, taken at each
/// tax-year end (before the final write-off).
pub fn run_yearly_trace(
    params: &SimulationParameters,
    control: &RunControl,
) -> Result<Vec<YearSnapshot>, SimulationError> {
    params.validate()?;
    let seed = resolve_seed(params);
    let year_count = params.horizon_years() as usize;

    let traces = collect_trials(params, control, |index| {
        let path = draw_path(params, seed, index);
        let mut trace = Vec::with_capacity(year_count);
        let result = simulate_path(params, index, &path, Some(&mut trace));
        if result.overpay.is_finite() && result.invest.is_finite() {
            Ok(trace)
        } else {
            Err(non_finite_warning(index))
        }
    })?;

    let mut acc = YearlyAccumulator::new(year_count, traces.len());
    let mut included = 0_u32;
    let mut excluded = 0_u32;
    for trace in traces {
        match trace {
            Ok(points) => {
                included += 1;
                for (idx, point) in points.into_iter().enumerate() {
                    acc.push(idx, point);
                }
            }
            Err(warning) => {
                log_excluded(&warning);
                excluded += 1;
            }
        }
    }
    if included == 0 {
        return Err(SimulationError::NoValidTrials { excluded });
    }

    Ok(acc.into_results(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{InterestRateModel, RepaymentThresholdSchedule};
    use crate::core::ValidationError;
    use proptest::prelude::{ProptestConfig, prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn sample_params() -> SimulationParameters {
        SimulationParameters {
            trials: 200,
            seed: Some(42),
            ..SimulationParameters::default()
        }
    }

    /// Constant salary, no market noise, flat threshold.
    fn deterministic_params() -> SimulationParameters {
        let mut params = sample_params();
        params.trials = 1;
        params.salary.initial = 40_000.0;
        params.salary.growth_mean = 0.0;
        params.salary.growth_volatility = 0.0;
        params.salary.redundancy_probability = 0.0;
        params.inflation.mean = 0.0;
        params.inflation.volatility = 0.0;
        params.investment.expected_return = 0.0;
        params.investment.volatility = 0.0;
        params.interest_rate = InterestRateModel::Fixed { annual_rate: 0.0 };
        params.thresholds = RepaymentThresholdSchedule::flat(27_295.0);
        params.years_since_first_repayment = 1;
        params
    }

    const FLAT_MONTHLY_REPAYMENT: f64 = (40_000.0 - 27_295.0) * 0.09 / 12.0;

    #[test]
    fn run_is_deterministic_for_a_fixed_seed() {
        let params = sample_params();
        let a = run(&params).expect("valid run");
        let b = run(&params).expect("valid run");
        assert_eq!(a, b);
        assert_eq!(a.seed, 42);
    }

    #[test]
    fn sequential_and_parallel_runs_agree_bit_for_bit() {
        let params = sample_params();
        let sequential = run_with(
            &params,
            &RunControl {
                execution: Execution::Sequential,
                cancel: None,
            },
        )
        .expect("valid run");
        let parallel = run(&params).expect("valid run");
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn different_seeds_give_different_distributions() {
        let mut params = sample_params();
        let a = run(&params).expect("valid run");
        params.seed = Some(43);
        let b = run(&params).expect("valid run");
        assert_ne!(a.invest.net_worth.mean, b.invest.net_worth.mean);
    }

    #[test]
    fn missing_seed_is_drawn_and_reported() {
        let mut params = sample_params();
        params.trials = 5;
        params.seed = None;
        let summary = run(&params).expect("valid run");
        params.seed = Some(summary.seed);
        let replay = run(&params).expect("valid run");
        assert_eq!(summary, replay);
    }

    #[test]
    fn single_trial_summary_equals_the_trial() {
        let mut params = sample_params();
        params.trials = 1;
        let summary = run(&params).expect("valid run");
        let trial = simulate_trial(&params, 42, 0);

        assert_eq!(summary.trials_included, 1);
        assert_eq!(summary.overpay.net_worth.mean, trial.overpay.portfolio_value);
        assert_eq!(summary.invest.net_worth.mean, trial.invest.portfolio_value);
        assert_eq!(summary.invest.written_off.mean, trial.invest.written_off);
        assert_eq!(summary.invest_advantage.mean, trial.invest_advantage());
        assert_eq!(summary.invest_advantage.median, trial.invest_advantage());
    }

    #[test]
    fn zero_return_and_volatility_leave_only_contributions() {
        for wrapper in [InvestmentWrapper::Isa, InvestmentWrapper::Gia] {
            let mut params = sample_params();
            params.investment.expected_return = 0.0;
            params.investment.volatility = 0.0;
            params.investment.wrapper = wrapper;
            for index in 0..20 {
                let trial = simulate_trial(&params, 42, index);
                assert_eq!(trial.invest.portfolio_value, trial.invest.contributions);
                assert_eq!(trial.overpay.portfolio_value, trial.overpay.contributions);
            }
        }
    }

    #[test]
    fn invest_contributions_are_the_overpayment_stream_below_threshold() {
        let mut params = deterministic_params();
        params.salary.initial = 20_000.0;
        params.monthly_overpayment = 150.0;
        let trial = simulate_trial(&params, 1, 0);
        let months = params.horizon_months() as f64;
        assert_approx(trial.invest.portfolio_value, 150.0 * months);
        assert_approx(trial.invest.written_off, params.loan_balance);
    }

    #[test]
    fn zero_interest_mandatory_repayments_fall_linearly() {
        let mut params = deterministic_params();
        params.loan_balance = 50_000.0;
        params.monthly_overpayment = 0.0;

        let trial = simulate_trial(&params, 3, 0);
        let months = params.horizon_months() as f64;
        assert_approx(trial.invest.interest_accrued, 0.0);
        assert_approx(trial.invest.total_repaid, FLAT_MONTHLY_REPAYMENT * months);
        assert_approx(
            trial.invest.written_off,
            50_000.0 - FLAT_MONTHLY_REPAYMENT * months,
        );

        let years = run_yearly_trace(&params, &RunControl::default()).expect("valid trace");
        let mut previous = 50_000.0;
        for year in &years {
            assert_approx(previous - year.invest_balance.median, FLAT_MONTHLY_REPAYMENT * 12.0);
            previous = year.invest_balance.median;
        }
    }

    #[test]
    fn zero_interest_loan_clears_when_repayments_cover_it() {
        let mut params = deterministic_params();
        params.loan_balance = 30_000.0;
        params.monthly_overpayment = 0.0;

        let trial = simulate_trial(&params, 3, 0);
        let expected_month = (30_000.0 / FLAT_MONTHLY_REPAYMENT).ceil() as u32;
        assert_eq!(trial.invest.cleared_at_month, Some(expected_month));
        assert_approx(trial.invest.total_repaid, 30_000.0);
        assert_approx(trial.invest.written_off, 0.0);
        // Freed repayments are invested for the remaining months.
        let remaining = params.horizon_months() - expected_month;
        assert!(trial.invest.contributions > FLAT_MONTHLY_REPAYMENT * remaining as f64 - EPS);
    }

    #[test]
    fn overpaying_clears_sooner_and_then_invests_the_whole_budget() {
        let mut params = deterministic_params();
        params.loan_balance = 30_000.0;
        params.monthly_overpayment = 400.0;

        let trial = simulate_trial(&params, 3, 0);
        let budget = FLAT_MONTHLY_REPAYMENT + 400.0;
        let expected_month = (30_000.0 / budget).ceil() as u32;
        assert_eq!(trial.overpay.cleared_at_month, Some(expected_month));
        assert_approx(trial.overpay.total_repaid, 30_000.0);

        let months = params.horizon_months() as f64;
        assert_approx(trial.overpay.contributions, budget * months - 30_000.0);
        assert_approx(trial.invest.contributions, budget * months - trial.invest.total_repaid);
    }

    #[test]
    fn unaffordable_loan_is_written_off_at_the_horizon() {
        let mut params = deterministic_params();
        params.salary.initial = 20_000.0;
        params.interest_rate = InterestRateModel::Fixed { annual_rate: 0.05 };
        params.monthly_overpayment = 0.0;

        let trial = simulate_trial(&params, 9, 0);
        assert_eq!(trial.invest.total_repaid, 0.0);
        assert_eq!(trial.invest.cleared_at_month, None);
        assert!(trial.invest.written_off > params.loan_balance);
        assert_approx_tol(
            trial.invest.written_off,
            params.loan_balance + trial.invest.interest_accrued,
            1e-6,
        );
    }

    #[test]
    fn zero_overpayment_makes_both_strategies_identical() {
        let mut params = sample_params();
        params.monthly_overpayment = 0.0;
        let summary = run(&params).expect("valid run");
        assert_eq!(summary.invest_advantage.min, 0.0);
        assert_eq!(summary.invest_advantage.max, 0.0);
        assert_eq!(summary.probability_invest_wins, 0.0);
    }

    #[test]
    fn repaid_loan_makes_both_strategies_identical() {
        let mut params = sample_params();
        params.loan_balance = 0.0;
        let summary = run(&params).expect("valid run");
        assert_eq!(summary.overpay.loan_cleared_rate, 1.0);
        assert_eq!(summary.overpay.median_months_to_clear, Some(0.0));
        assert_eq!(summary.invest_advantage.max, 0.0);
    }

    #[test]
    fn overpay_strategy_invests_nothing_before_clearing() {
        let mut params = sample_params();
        params.loan_balance = 90_000.0;
        params.trials = 10;
        let years = run_yearly_trace(&params, &RunControl::default()).expect("valid trace");
        assert_eq!(years[0].overpay_portfolio.p90, 0.0);
        assert!(years[0].invest_portfolio.p10 > 0.0);
        assert_eq!(years.len(), params.horizon_years() as usize);
        assert_eq!(years[0].age, params.age + 1);
    }

    #[test]
    fn larger_overpayments_never_raise_mean_interest() {
        let mut params = sample_params();
        params.trials = 100;
        let mut previous = f64::INFINITY;
        for overpayment in [0.0, 50.0, 100.0, 200.0, 400.0, 800.0] {
            params.monthly_overpayment = overpayment;
            let summary = run(&params).expect("valid run");
            let interest = summary.overpay.interest_accrued.mean;
            assert!(
                interest <= previous,
                "interest rose to {interest} at overpayment {overpayment}"
            );
            previous = interest;
        }
    }

    #[test]
    fn validation_happens_before_any_trial() {
        let mut params = sample_params();
        params.trials = 0;
        assert_eq!(
            run(&params),
            Err(SimulationError::Invalid(ValidationError::NoTrials))
        );
    }

    #[test]
    fn cancelled_token_stops_the_run() {
        let params = sample_params();
        let token = CancellationToken::new();
        token.cancel();
        for execution in [Execution::Sequential, Execution::Parallel] {
            let control = RunControl {
                execution,
                cancel: Some(token.clone()),
            };
            assert_eq!(
                run_with(&params, &control),
                Err(SimulationError::Cancelled { completed: 0 })
            );
        }
    }

    #[test]
    fn excluded_trials_are_reported_in_the_summary() {
        let good = simulate_trial(&sample_params(), 42, 0);
        let batch = TrialBatch {
            seed: 42,
            results: vec![good],
            warnings: vec![TrialWarning {
                trial_index: 1,
                reason: "non-finite value in trial outcome".to_string(),
            }],
        };
        let summary = summarize(2, batch);
        assert_eq!(summary.trials_requested, 2);
        assert_eq!(summary.trials_included, 1);
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.warnings[0].trial_index, 1);
        assert_eq!(summary.invest.net_worth.mean, good.invest.portfolio_value);
    }

    #[test]
    fn pathological_volatility_fails_the_run_when_nothing_survives() {
        let mut params = sample_params();
        params.trials = 8;
        params.investment.volatility = 1e200;
        assert_eq!(
            run(&params),
            Err(SimulationError::NoValidTrials { excluded: 8 })
        );
    }

    #[test]
    fn trace_counts_trials_it_excludes() {
        let mut params = sample_params();
        params.trials = 6;
        params.investment.volatility = 1e200;
        for execution in [Execution::Sequential, Execution::Parallel] {
            let control = RunControl {
                execution,
                cancel: None,
            };
            assert_eq!(
                run_yearly_trace(&params, &control),
                Err(SimulationError::NoValidTrials { excluded: 6 })
            );
        }
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_approx(percentile(&mut values, 50.0), 2.5);
        assert_approx(percentile(&mut values, 0.0), 1.0);
        assert_approx(percentile(&mut values, 100.0), 4.0);
        assert_approx(percentile(&mut [], 50.0), 0.0);
    }

    #[test]
    fn distribution_orders_its_percentiles() {
        let stats = distribution((1..=101).map(f64::from).collect());
        assert_approx(stats.mean, 51.0);
        assert_approx(stats.min, 1.0);
        assert_approx(stats.p10, 11.0);
        assert_approx(stats.median, 51.0);
        assert_approx(stats.p90, 91.0);
        assert_approx(stats.max, 101.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn overpaying_more_never_adds_interest_on_any_path(
            seed in 0u64..1_000,
            index in 0u32..50,
            low in 0.0f64..600.0,
            extra in 0.0f64..600.0,
        ) {
            let mut params = sample_params();
            params.monthly_overpayment = low;
            let a = simulate_trial(&params, seed, index);
            params.monthly_overpayment = low + extra;
            let b = simulate_trial(&params, seed, index);
            prop_assert!(b.overpay.interest_accrued <= a.overpay.interest_accrued);
            prop_assert!(b.overpay.written_off <= a.overpay.written_off);
            // Overpayment never touches the invest strategy's loan.
            prop_assert!(b.invest.total_repaid == a.invest.total_repaid);
        }

        #[test]
        fn monetary_outcomes_are_non_negative(seed in 0u64..1_000, index in 0u32..50, gia in proptest::bool::ANY) {
            let mut params = sample_params();
            if gia {
                params.investment.wrapper = InvestmentWrapper::Gia;
            }
            let trial = simulate_trial(&params, seed, index);
            for o in [trial.overpay, trial.invest] {
                prop_assert!(o.total_repaid >= 0.0);
                prop_assert!(o.interest_accrued >= 0.0);
                prop_assert!(o.written_off >= 0.0);
                prop_assert!(o.contributions >= 0.0);
                prop_assert!(o.portfolio_value >= 0.0);
            }
        }
    }
}
