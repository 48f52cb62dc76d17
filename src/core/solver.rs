use serde::Serialize;
use tracing::{debug, info};

use super::engine::{RunControl, TrialBatch, percentile, run_trials};
use super::error::{SimulationError, ValidationError};
use super::tax;
use super::types::SimulationParameters;

/// Monthly overpayments tried by the breakeven table.
pub const BREAKEVEN_OVERPAYMENTS: [f64; 11] = [
    0.0, 50.0, 100.0, 150.0, 200.0, 250.0, 300.0, 400.0, 500.0, 750.0, 1_000.0,
];
pub const BREAKEVEN_TRIALS: u32 = 1_000;

pub const SWEEP_LOANS: [f64; 5] = [25_000.0, 35_000.0, 45_000.0, 55_000.0, 65_000.0];
pub const SWEEP_SALARIES: [f64; 6] = [30_000.0, 40_000.0, 50_000.0, 60_000.0, 80_000.0, 100_000.0];
pub const SWEEP_OVERPAYMENTS: [f64; 7] = [0.0, 100.0, 200.0, 300.0, 500.0, 750.0, 1_000.0];
pub const SWEEP_TRIALS: u32 = 500;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Winner {
    /// Overpaying the loan (or paying it off outright).
    Overpay,
    Invest,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakevenRow {
    pub monthly_overpayment: f64,
    pub loan_cleared_rate: f64,
    /// Present only when at least half of the trials clear the loan.
    pub median_year_cleared: Option<f64>,
    pub median_age_cleared: Option<f64>,
    pub median_net_worth_overpay: f64,
    pub median_net_worth_invest: f64,
    pub overpay_win_rate: f64,
    pub winner: Winner,
    /// Winner's margin in median net worth.
    pub advantage: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakevenResult {
    pub seed: u64,
    pub rows: Vec<BreakevenRow>,
    /// Lowest tested overpayment at which overpaying wins most trials.
    pub breakeven: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct LevelEval {
    loan_cleared_rate: f64,
    median_months_to_clear: Option<f64>,
    median_net_worth_overpay: f64,
    median_net_worth_invest: f64,
    median_invest_advantage: f64,
    overpay_win_rate: f64,
}

fn evaluate_level(
    base: &SimulationParameters,
    seed: u64,
    monthly_overpayment: f64,
    trials: u32,
    control: &RunControl,
) -> Result<LevelEval, SimulationError> {
    let params = SimulationParameters {
        monthly_overpayment,
        trials,
        seed: Some(seed),
        ..base.clone()
    };
    let TrialBatch { results, .. } = run_trials(&params, control)?;
    let n = results.len() as f64;

    let mut overpay_worth: Vec<f64> = results.iter().map(|r| r.overpay.portfolio_value).collect();
    let mut invest_worth: Vec<f64> = results.iter().map(|r| r.invest.portfolio_value).collect();
    let mut advantage: Vec<f64> = results.iter().map(|r| r.invest_advantage()).collect();
    let mut cleared: Vec<f64> = results
        .iter()
        .filter_map(|r| r.overpay.cleared_at_month)
        .map(f64::from)
        .collect();

    let loan_cleared_rate = cleared.len() as f64 / n;
    let median_months_to_clear = (loan_cleared_rate >= 0.5 && !cleared.is_empty())
        .then(|| percentile(&mut cleared, 50.0));

    Ok(LevelEval {
        loan_cleared_rate,
        median_months_to_clear,
        median_net_worth_overpay: percentile(&mut overpay_worth, 50.0),
        median_net_worth_invest: percentile(&mut invest_worth, 50.0),
        median_invest_advantage: percentile(&mut advantage, 50.0),
        overpay_win_rate: results.iter().filter(|r| r.overpay_wins()).count() as f64 / n,
    })
}

/// Runs each of [`BREAKEVEN_OVERPAYMENTS`] with the same seed and finds the
/// first level at which overpaying wins more than half of the trials.
pub fn breakeven_table(
    params: &SimulationParameters,
    control: &RunControl,
) -> Result<BreakevenResult, SimulationError> {
    params.validate()?;
    let seed = params.seed.unwrap_or_else(rand::random::<u64>);

    let mut rows = Vec::with_capacity(BREAKEVEN_OVERPAYMENTS.len());
    let mut breakeven = None;
    for overpayment in BREAKEVEN_OVERPAYMENTS {
        let eval = evaluate_level(params, seed, overpayment, BREAKEVEN_TRIALS, control)?;
        let median_year_cleared = eval.median_months_to_clear.map(|m| m / 12.0);
        let (winner, advantage) = if eval.overpay_win_rate > 0.5 {
            (
                Winner::Overpay,
                eval.median_net_worth_overpay - eval.median_net_worth_invest,
            )
        } else {
            (
                Winner::Invest,
                eval.median_net_worth_invest - eval.median_net_worth_overpay,
            )
        };
        if breakeven.is_none() && winner == Winner::Overpay {
            breakeven = Some(overpayment);
        }
        debug!(overpayment, win_rate = eval.overpay_win_rate, "breakeven level");

        rows.push(BreakevenRow {
            monthly_overpayment: overpayment,
            loan_cleared_rate: eval.loan_cleared_rate,
            median_year_cleared,
            median_age_cleared: median_year_cleared.map(|y| params.age as f64 + y),
            median_net_worth_overpay: eval.median_net_worth_overpay,
            median_net_worth_invest: eval.median_net_worth_invest,
            overpay_win_rate: eval.overpay_win_rate,
            winner,
            advantage,
        });
    }

    Ok(BreakevenResult {
        seed,
        rows,
        breakeven,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakevenSolveConfig {
    /// Share of trials overpaying must win.
    pub target_win_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub trials_per_iteration: u32,
    pub final_trials: u32,
}

impl Default for BreakevenSolveConfig {
    fn default() -> Self {
        Self {
            target_win_rate: 0.5,
            search_min: 0.0,
            search_max: 2_000.0,
            tolerance: 5.0,
            max_iterations: 24,
            trials_per_iteration: BREAKEVEN_TRIALS,
            final_trials: BREAKEVEN_TRIALS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakevenIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate: f64,
    pub overpay_win_rate: f64,
    pub win_rate_ci_half_width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakevenSolveResult {
    pub config: BreakevenSolveConfig,
    pub seed: u64,
    pub solved_overpayment: Option<f64>,
    pub achieved_win_rate: Option<f64>,
    pub achieved_win_rate_ci_half_width: Option<f64>,
    pub iterations: Vec<BreakevenIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    win_rate: f64,
    ci_half_width: f64,
}

impl CandidateEval {
    fn meets(self, target: f64) -> bool {
        self.win_rate + 1e-12 >= target
    }
}

fn evaluate_candidate(
    params: &SimulationParameters,
    seed: u64,
    candidate: f64,
    trials: u32,
    control: &RunControl,
) -> Result<CandidateEval, SimulationError> {
    let eval = evaluate_level(params, seed, candidate.max(0.0), trials, control)?;
    Ok(CandidateEval {
        win_rate: eval.overpay_win_rate,
        ci_half_width: binomial_ci_half_width(eval.overpay_win_rate, trials),
    })
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

/// Bisects on the monthly overpayment for the lowest amount at which
/// overpaying wins at least `target_win_rate` of the trials.
pub fn solve_breakeven(
    params: &SimulationParameters,
    config: BreakevenSolveConfig,
    control: &RunControl,
) -> Result<BreakevenSolveResult, SimulationError> {
    params.validate()?;
    validate_config(config)?;
    let seed = params.seed.unwrap_or_else(rand::random::<u64>);
    let evaluate = |candidate: f64, trials: u32| {
        evaluate_candidate(params, seed, candidate, trials, control)
    };

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate(config.search_min, config.trials_per_iteration)?;
    let high_eval = evaluate(config.search_max, config.trials_per_iteration)?;

    let mut solved = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.meets(config.target_win_rate) {
        solved = Some(config.search_min);
        converged = true;
        feasible = true;
        message = "Overpaying already wins at the lower bound.".to_string();
    } else if !high_eval.meets(config.target_win_rate) {
        feasible = false;
        message = "Overpaying never reaches the target within the search bounds.".to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate(mid, config.trials_per_iteration)?;
            iterations.push(BreakevenIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate: mid,
                overpay_win_rate: eval.win_rate,
                win_rate_ci_half_width: eval.ci_half_width,
            });

            if eval.meets(config.target_win_rate) {
                hi = mid;
            } else {
                lo = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                break;
            }
        }
        solved = Some(hi);
        feasible = true;
        message = if converged {
            "Solved breakeven overpayment.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    let mut achieved_win_rate = None;
    let mut achieved_win_rate_ci_half_width = None;
    if let Some(value) = solved {
        let final_eval = evaluate(value, config.final_trials)?;
        achieved_win_rate = Some(final_eval.win_rate);
        achieved_win_rate_ci_half_width = Some(final_eval.ci_half_width);
    }
    debug!(
        ?solved,
        iterations = iterations.len(),
        converged,
        feasible,
        "breakeven search finished"
    );

    Ok(BreakevenSolveResult {
        config,
        seed,
        solved_overpayment: solved,
        achieved_win_rate,
        achieved_win_rate_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

fn validate_config(config: BreakevenSolveConfig) -> Result<(), ValidationError> {
    let malformed = |reason: &str| {
        Err(ValidationError::SolverConfig {
            reason: reason.to_string(),
        })
    };
    if !(0.0..=1.0).contains(&config.target_win_rate) {
        return malformed("target_win_rate must be between 0 and 1");
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return malformed("search bounds must be finite");
    }
    if config.search_min < 0.0 {
        return malformed("search_min must be >= 0");
    }
    if config.search_max <= config.search_min {
        return malformed("search_max must be greater than search_min");
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return malformed("tolerance must be > 0");
    }
    if config.max_iterations == 0 {
        return malformed("max_iterations must be > 0");
    }
    if config.trials_per_iteration == 0 || config.final_trials == 0 {
        return malformed("trial counts must be > 0");
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepGrid {
    pub loan_balances: Vec<f64>,
    pub salaries: Vec<f64>,
    pub overpayments: Vec<f64>,
}

impl Default for SweepGrid {
    fn default() -> Self {
        Self {
            loan_balances: SWEEP_LOANS.to_vec(),
            salaries: SWEEP_SALARIES.to_vec(),
            overpayments: SWEEP_OVERPAYMENTS.to_vec(),
        }
    }
}

impl SweepGrid {
    pub fn len(&self) -> usize {
        self.loan_balances.len() * self.salaries.len() * self.overpayments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepCell {
    pub loan_balance: f64,
    pub salary: f64,
    pub monthly_overpayment: f64,
    /// Positive when investing beats overpaying.
    pub median_invest_advantage: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResult {
    pub seed: u64,
    pub trials_per_cell: u32,
    pub grid: SweepGrid,
    /// Loan-major, then salary, then overpayment.
    pub cells: Vec<SweepCell>,
}

impl SweepResult {
    pub fn cell(&self, loan: usize, salary: usize, overpayment: usize) -> Option<&SweepCell> {
        let salaries = self.grid.salaries.len();
        let overpayments = self.grid.overpayments.len();
        if salary >= salaries || overpayment >= overpayments {
            return None;
        }
        self.cells
            .get((loan * salaries + salary) * overpayments + overpayment)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SweepProgress {
    pub completed: usize,
    pub total: usize,
}

/// Median invest advantage for every loan × salary × overpayment
/// combination, each cell run with the same seed.
pub fn parameter_sweep(
    base: &SimulationParameters,
    grid: &SweepGrid,
    trials_per_cell: u32,
    control: &RunControl,
    mut on_progress: impl FnMut(SweepProgress),
) -> Result<SweepResult, SimulationError> {
    let params = SimulationParameters {
        trials: trials_per_cell,
        ..base.clone()
    };
    params.validate()?;
    let seed = params.seed.unwrap_or_else(rand::random::<u64>);

    let total = grid.len();
    let mut cells = Vec::with_capacity(total);
    let mut last_decile = 0;
    for &loan_balance in &grid.loan_balances {
        for &salary in &grid.salaries {
            for &monthly_overpayment in &grid.overpayments {
                let mut cell_params = params.clone();
                cell_params.loan_balance = loan_balance;
                cell_params.salary.initial = salary;
                let eval =
                    evaluate_level(&cell_params, seed, monthly_overpayment, trials_per_cell, control)?;
                cells.push(SweepCell {
                    loan_balance,
                    salary,
                    monthly_overpayment,
                    median_invest_advantage: eval.median_invest_advantage,
                });

                let completed = cells.len();
                on_progress(SweepProgress { completed, total });
                let decile = completed * 10 / total;
                if decile > last_decile {
                    last_decile = decile;
                    info!(completed, total, "sweep progress");
                }
            }
        }
    }

    Ok(SweepResult {
        seed,
        trials_per_cell,
        grid: grid.clone(),
        cells,
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LumpSumComparison {
    pub lump_sum: f64,
    pub years: u32,
    pub expected_return: f64,
    pub annual_mandatory: f64,
    /// Freed mandatory repayments invested yearly after paying off today.
    pub payoff_value: f64,
    /// The lump sum invested today while mandatory repayments continue.
    pub invest_value: f64,
    pub total_mandatory_saved: f64,
    pub winner: Winner,
    pub advantage: f64,
    pub advantage_pct: f64,
}

/// Deterministic "pay the balance off now or invest it" at a fixed return.
pub fn lump_sum_comparison(
    loan_balance: f64,
    annual_mandatory: f64,
    expected_return: f64,
    years: u32,
) -> LumpSumComparison {
    let r = expected_return;
    let t = years as f64;

    let payoff_value = if r.abs() > 1e-12 {
        annual_mandatory * (((1.0 + r).powf(t) - 1.0) / r)
    } else {
        annual_mandatory * t
    };
    let invest_value = loan_balance * (1.0 + r).powf(t);

    let (winner, advantage) = if invest_value >= payoff_value {
        (Winner::Invest, invest_value - payoff_value)
    } else {
        (Winner::Overpay, payoff_value - invest_value)
    };
    let loser = invest_value.min(payoff_value);
    let advantage_pct = if loser > 0.0 {
        advantage / loser * 100.0
    } else {
        0.0
    };

    LumpSumComparison {
        lump_sum: loan_balance,
        years,
        expected_return,
        annual_mandatory,
        payoff_value,
        invest_value,
        total_mandatory_saved: annual_mandatory * t,
        winner,
        advantage,
        advantage_pct,
    }
}

/// Lump-sum comparison at the starting salary and threshold.
pub fn lump_sum_for(params: &SimulationParameters) -> LumpSumComparison {
    let threshold = params
        .thresholds
        .threshold(params.base_tax_year, params.inflation.mean);
    let annual_mandatory = tax::student_loan_repayment(params.salary.initial, threshold);
    lump_sum_comparison(
        params.loan_balance,
        annual_mandatory,
        params.investment.expected_return,
        params.horizon_years(),
    )
}
