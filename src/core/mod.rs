mod engine;
mod error;
mod market;
mod solver;
pub mod tax;
mod types;
mod validation;

pub use engine::{
    CancellationToken, Execution, RunControl, TrialBatch, run, run_trials, run_with,
    run_yearly_trace, simulate_trial, summarize,
};
pub use error::{SimulationError, ValidationError};
pub use market::{MarketPath, YearSample, derive_trial_seed, draw_path, monthly_log_params};
pub use solver::{
    BREAKEVEN_OVERPAYMENTS, BREAKEVEN_TRIALS, BreakevenIteration, BreakevenResult, BreakevenRow,
    BreakevenSolveConfig, BreakevenSolveResult, LumpSumComparison, SWEEP_TRIALS, SweepCell,
    SweepGrid, SweepProgress, SweepResult, Winner, breakeven_table, lump_sum_comparison,
    lump_sum_for, parameter_sweep, solve_breakeven,
};
pub use validation::{MAX_AGE, MAX_WRITE_OFF_YEARS, TAX_YEAR_RANGE};
pub use types::{
    DistributionStats, InflationModel, InterestRateModel, InvestmentModel, InvestmentWrapper,
    PercentileBand, Region, RepaymentThresholdSchedule, SalaryModel, SimulationParameters,
    SimulationSummary, StrategyOutcome, StrategySummary, TrialResult, TrialWarning, YearSnapshot,
};
