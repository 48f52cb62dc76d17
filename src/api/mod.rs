mod render;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::core::{
    BreakevenSolveConfig, Execution, InflationModel, InterestRateModel, InvestmentModel,
    InvestmentWrapper, Region, RepaymentThresholdSchedule, RunControl, SWEEP_TRIALS, SalaryModel,
    SimulationParameters, SweepGrid, breakeven_table, lump_sum_for, parameter_sweep, run_with,
    run_yearly_trace, solve_breakeven, tax,
};

pub use render::{format_gbp, format_pct};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliRegion {
    England,
    Scotland,
}

impl From<CliRegion> for Region {
    fn from(value: CliRegion) -> Self {
        match value {
            CliRegion::England => Region::England,
            CliRegion::Scotland => Region::Scotland,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliWrapper {
    Isa,
    Gia,
}

impl From<CliWrapper> for InvestmentWrapper {
    fn from(value: CliWrapper) -> Self {
        match value {
            CliWrapper::Isa => InvestmentWrapper::Isa,
            CliWrapper::Gia => InvestmentWrapper::Gia,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliInterestModel {
    #[serde(alias = "plan-2")]
    Plan2,
    Fixed,
    #[serde(alias = "rpiLinked", alias = "rpi_linked")]
    RpiLinked,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "loanmc",
    about = "Monte Carlo comparison of overpaying a Plan 2 student loan versus investing"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        help = "Log filter such as info or loanmc=debug; RUST_LOG takes precedence"
    )]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compare both strategies for one set of inputs.
    Simulate(RunArgs),
    /// Try a ladder of overpayments and find where overpaying starts to win.
    Breakeven {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, help = "Also bisect for the exact breakeven overpayment")]
        solve: bool,
        #[arg(
            long,
            default_value_t = 50.0,
            value_parser = parse_percent,
            help = "Share of trials overpaying must win when solving, in percent"
        )]
        target_win_rate: f64,
    },
    /// Median invest advantage over a loan × salary × overpayment grid.
    Sweep {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, default_value_t = SWEEP_TRIALS)]
        sweep_trials: u32,
    },
    /// Year-by-year percentile bands of balances and portfolios.
    Trace(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub flags: ParamArgs,
    #[arg(
        long = "params",
        value_name = "FILE",
        help = "camelCase JSON file whose fields override the flags"
    )]
    pub params_file: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[arg(long, help = "Run trials on one thread")]
    pub sequential: bool,
}

impl RunArgs {
    fn control(&self) -> RunControl {
        RunControl {
            execution: if self.sequential {
                Execution::Sequential
            } else {
                Execution::Parallel
            },
            cancel: None,
        }
    }

    fn load_flags(&self) -> Result<ParamArgs, String> {
        let mut flags = self.flags.clone();
        if let Some(path) = &self.params_file {
            let json = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
            let payload = payload_from_json(&json)?;
            apply_payload(&mut flags, payload);
        }
        Ok(flags)
    }
}

/// Simulation inputs as typed on the command line: money in pounds (a
/// leading `£` and thousands separators are accepted) and rates in percent.
#[derive(Args, Debug, Clone)]
pub struct ParamArgs {
    #[arg(long, default_value = "45000", value_parser = parse_currency)]
    pub loan_balance: f64,
    #[arg(long, default_value = "35000", value_parser = parse_currency)]
    pub salary: f64,
    #[arg(long, default_value_t = 3.5, value_parser = parse_percent, help = "Mean annual salary growth in percent")]
    pub salary_growth: f64,
    #[arg(long, default_value_t = 2.0, value_parser = parse_percent)]
    pub salary_volatility: f64,
    #[arg(
        long,
        default_value_t = 3.0,
        value_parser = parse_percent,
        help = "Yearly chance of a pay freeze in percent"
    )]
    pub redundancy_probability: f64,
    #[arg(long, value_enum, default_value_t = CliRegion::England)]
    pub region: CliRegion,

    #[arg(long, value_enum, default_value_t = CliInterestModel::Plan2)]
    pub interest_model: CliInterestModel,
    #[arg(long, value_parser = parse_percent, help = "Annual rate in percent for --interest-model fixed")]
    pub interest_rate: Option<f64>,
    #[arg(long, value_parser = parse_percent, help = "Premium over RPI in percent for --interest-model rpi-linked")]
    pub rpi_premium: Option<f64>,
    #[arg(
        long,
        value_parser = parse_currency,
        help = "Use one repayment threshold for every year instead of the Plan 2 schedule"
    )]
    pub repayment_threshold: Option<f64>,

    #[arg(long, default_value_t = 3.2, value_parser = parse_percent)]
    pub rpi_mean: f64,
    #[arg(long, default_value_t = 1.5, value_parser = parse_percent)]
    pub rpi_volatility: f64,
    #[arg(
        long,
        default_value_t = 0.3,
        allow_negative_numbers = true,
        help = "Correlation between RPI and the year's market return"
    )]
    pub rpi_return_correlation: f64,

    #[arg(long, default_value = "200", value_parser = parse_currency)]
    pub overpayment: f64,
    #[arg(long, default_value_t = 7.0, value_parser = parse_percent, allow_negative_numbers = true)]
    pub investment_return: f64,
    #[arg(long, default_value_t = 15.0, value_parser = parse_percent)]
    pub investment_volatility: f64,
    #[arg(long, value_enum, default_value_t = CliWrapper::Isa)]
    pub wrapper: CliWrapper,

    #[arg(long, default_value_t = 25)]
    pub age: u32,
    #[arg(long, default_value_t = 1)]
    pub years_since_first_repayment: u32,
    #[arg(long, default_value_t = tax::SL_WRITE_OFF_YEARS)]
    pub write_off_years: u32,
    #[arg(long, default_value_t = tax::BASE_TAX_YEAR)]
    pub base_tax_year: i32,
    #[arg(long, default_value_t = 10_000)]
    pub trials: u32,
    #[arg(long, help = "Random seed; drawn from entropy and reported when omitted")]
    pub seed: Option<u64>,
}

impl Default for ParamArgs {
    fn default() -> Self {
        Self {
            loan_balance: 45_000.0,
            salary: 35_000.0,
            salary_growth: 3.5,
            salary_volatility: 2.0,
            redundancy_probability: 3.0,
            region: CliRegion::England,
            interest_model: CliInterestModel::Plan2,
            interest_rate: None,
            rpi_premium: None,
            repayment_threshold: None,
            rpi_mean: 3.2,
            rpi_volatility: 1.5,
            rpi_return_correlation: 0.3,
            overpayment: 200.0,
            investment_return: 7.0,
            investment_volatility: 15.0,
            wrapper: CliWrapper::Isa,
            age: 25,
            years_since_first_repayment: 1,
            write_off_years: tax::SL_WRITE_OFF_YEARS,
            base_tax_year: tax::BASE_TAX_YEAR,
            trials: 10_000,
            seed: None,
        }
    }
}

/// JSON overrides; every present field replaces the matching flag, in the
/// same units.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ParamsPayload {
    loan_balance: Option<f64>,
    salary: Option<f64>,
    salary_growth: Option<f64>,
    salary_volatility: Option<f64>,
    redundancy_probability: Option<f64>,
    region: Option<CliRegion>,

    interest_model: Option<CliInterestModel>,
    interest_rate: Option<f64>,
    rpi_premium: Option<f64>,
    repayment_threshold: Option<f64>,

    rpi_mean: Option<f64>,
    rpi_volatility: Option<f64>,
    rpi_return_correlation: Option<f64>,

    overpayment: Option<f64>,
    investment_return: Option<f64>,
    investment_volatility: Option<f64>,
    wrapper: Option<CliWrapper>,

    age: Option<u32>,
    years_since_first_repayment: Option<u32>,
    write_off_years: Option<u32>,
    base_tax_year: Option<i32>,
    #[serde(alias = "iterations")]
    trials: Option<u32>,
    seed: Option<u64>,
}

fn payload_from_json(json: &str) -> Result<ParamsPayload, String> {
    serde_json::from_str::<ParamsPayload>(json).map_err(|e| format!("Invalid params JSON: {e}"))
}

fn apply_payload(flags: &mut ParamArgs, payload: ParamsPayload) {
    macro_rules! apply {
        ($($field:ident),* $(,)?) => {
            $(
                if let Some(v) = payload.$field {
                    flags.$field = v;
                }
            )*
        };
    }
    apply!(
        loan_balance,
        salary,
        salary_growth,
        salary_volatility,
        redundancy_probability,
        region,
        interest_model,
        rpi_mean,
        rpi_volatility,
        rpi_return_correlation,
        overpayment,
        investment_return,
        investment_volatility,
        wrapper,
        age,
        years_since_first_repayment,
        write_off_years,
        base_tax_year,
        trials,
    );

    if payload.interest_rate.is_some() {
        flags.interest_rate = payload.interest_rate;
    }
    if payload.rpi_premium.is_some() {
        flags.rpi_premium = payload.rpi_premium;
    }
    if payload.repayment_threshold.is_some() {
        flags.repayment_threshold = payload.repayment_threshold;
    }
    if payload.seed.is_some() {
        flags.seed = payload.seed;
    }
}

/// Strips `£`, commas, underscores and spaces before parsing.
pub fn parse_currency(raw: &str) -> Result<f64, String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '£' | ',' | '_' | ' '))
        .collect();
    let value = cleaned
        .parse::<f64>()
        .map_err(|_| format!("'{raw}' is not an amount of money"))?;
    if !value.is_finite() {
        return Err(format!("'{raw}' is not a finite amount"));
    }
    Ok(value)
}

/// Accepts `7`, `7.5` or `7.5%`.
pub fn parse_percent(raw: &str) -> Result<f64, String> {
    let value = raw
        .trim()
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("'{raw}' is not a percentage"))?;
    if !value.is_finite() {
        return Err(format!("'{raw}' is not a finite percentage"));
    }
    Ok(value)
}

fn build_params(flags: &ParamArgs) -> Result<SimulationParameters, String> {
    let interest_rate = match flags.interest_model {
        CliInterestModel::Plan2 => InterestRateModel::plan2(),
        CliInterestModel::Fixed => {
            let Some(rate) = flags.interest_rate else {
                return Err("--interest-rate is required when --interest-model is fixed".to_string());
            };
            InterestRateModel::Fixed {
                annual_rate: rate / 100.0,
            }
        }
        CliInterestModel::RpiLinked => InterestRateModel::RpiLinked {
            premium: flags.rpi_premium.unwrap_or(0.0) / 100.0,
        },
    };
    if flags.interest_model != CliInterestModel::Fixed && flags.interest_rate.is_some() {
        return Err("--interest-rate only applies to --interest-model fixed".to_string());
    }
    if flags.interest_model != CliInterestModel::RpiLinked && flags.rpi_premium.is_some() {
        return Err("--rpi-premium only applies to --interest-model rpi-linked".to_string());
    }

    let thresholds = match flags.repayment_threshold {
        Some(value) => RepaymentThresholdSchedule::flat(value),
        None => RepaymentThresholdSchedule::plan2(),
    };

    let params = SimulationParameters {
        loan_balance: flags.loan_balance,
        salary: SalaryModel {
            initial: flags.salary,
            growth_mean: flags.salary_growth / 100.0,
            growth_volatility: flags.salary_volatility / 100.0,
            redundancy_probability: flags.redundancy_probability / 100.0,
        },
        region: flags.region.into(),
        interest_rate,
        inflation: InflationModel {
            mean: flags.rpi_mean / 100.0,
            volatility: flags.rpi_volatility / 100.0,
            return_correlation: flags.rpi_return_correlation,
        },
        thresholds,
        monthly_overpayment: flags.overpayment,
        investment: InvestmentModel {
            expected_return: flags.investment_return / 100.0,
            volatility: flags.investment_volatility / 100.0,
            wrapper: flags.wrapper.into(),
        },
        age: flags.age,
        years_since_first_repayment: flags.years_since_first_repayment,
        write_off_years: flags.write_off_years,
        base_tax_year: flags.base_tax_year,
        trials: flags.trials,
        seed: flags.seed,
    };
    params.validate().map_err(|e| e.to_string())?;
    Ok(params)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Failed to encode JSON: {e}"))
}

/// Runs one command and returns what should be printed to stdout.
pub fn run_cli(cli: Cli) -> Result<String, String> {
    match cli.command {
        Command::Simulate(run) => {
            let params = build_params(&run.load_flags()?)?;
            let summary = run_with(&params, &run.control()).map_err(|e| e.to_string())?;
            let snapshot = render::Snapshot::new(&params);
            let lump_sum = lump_sum_for(&params);
            match run.format {
                OutputFormat::Json => to_json(&render::SimulateResponse {
                    parameters: &params,
                    now: snapshot,
                    summary: &summary,
                    lump_sum,
                }),
                OutputFormat::Text => Ok(render::simulation_text(
                    &params, &snapshot, &summary, &lump_sum,
                )),
            }
        }
        Command::Breakeven {
            run,
            solve,
            target_win_rate,
        } => {
            let params = build_params(&run.load_flags()?)?;
            let control = run.control();
            let table = breakeven_table(&params, &control).map_err(|e| e.to_string())?;
            let solved = if solve {
                let config = BreakevenSolveConfig {
                    target_win_rate: target_win_rate / 100.0,
                    ..BreakevenSolveConfig::default()
                };
                let params = SimulationParameters {
                    seed: Some(table.seed),
                    ..params.clone()
                };
                Some(solve_breakeven(&params, config, &control).map_err(|e| e.to_string())?)
            } else {
                None
            };
            match run.format {
                OutputFormat::Json => to_json(&render::BreakevenResponse {
                    table: &table,
                    solved: solved.as_ref(),
                }),
                OutputFormat::Text => Ok(render::breakeven_text(&table, solved.as_ref())),
            }
        }
        Command::Sweep { run, sweep_trials } => {
            let params = build_params(&run.load_flags()?)?;
            let grid = SweepGrid::default();
            info!(cells = grid.len(), trials = sweep_trials, "starting sweep");
            let result = parameter_sweep(&params, &grid, sweep_trials, &run.control(), |_| {})
                .map_err(|e| e.to_string())?;
            match run.format {
                OutputFormat::Json => to_json(&result),
                OutputFormat::Text => Ok(render::sweep_text(&result)),
            }
        }
        Command::Trace(run) => {
            let params = build_params(&run.load_flags()?)?;
            let years = run_yearly_trace(&params, &run.control()).map_err(|e| e.to_string())?;
            match run.format {
                OutputFormat::Json => to_json(&years),
                OutputFormat::Text => Ok(render::trace_text(&years)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid command line")
    }

    fn run_args(cli: Cli) -> RunArgs {
        match cli.command {
            Command::Simulate(run) | Command::Trace(run) => run,
            Command::Breakeven { run, .. } | Command::Sweep { run, .. } => run,
        }
    }

    #[test]
    fn flag_defaults_match_library_defaults() {
        let run = run_args(parse(&["loanmc", "simulate", "--seed", "42"]));
        let params = build_params(&run.flags).expect("valid params");
        assert_eq!(params, SimulationParameters::default());
    }

    #[test]
    fn parse_currency_accepts_pound_signs_and_separators() {
        assert_approx(parse_currency("£45,000").expect("valid"), 45_000.0);
        assert_approx(parse_currency("1_250.50").expect("valid"), 1_250.5);
        assert_approx(parse_currency(" 200 ").expect("valid"), 200.0);
        assert!(parse_currency("lots").is_err());
        assert!(parse_currency("inf").is_err());
    }

    #[test]
    fn parse_percent_accepts_trailing_sign() {
        assert_approx(parse_percent("7").expect("valid"), 7.0);
        assert_approx(parse_percent("3.2%").expect("valid"), 3.2);
        assert!(parse_percent("seven").is_err());
    }

    #[test]
    fn percent_flags_become_fractions() {
        let run = run_args(parse(&[
            "loanmc",
            "simulate",
            "--loan-balance",
            "£30,000",
            "--investment-return",
            "6.5%",
            "--salary-growth",
            "4",
            "--interest-model",
            "fixed",
            "--interest-rate",
            "4.5",
            "--wrapper",
            "gia",
            "--region",
            "scotland",
        ]));
        let params = build_params(&run.flags).expect("valid params");
        assert_approx(params.loan_balance, 30_000.0);
        assert_approx(params.investment.expected_return, 0.065);
        assert_approx(params.salary.growth_mean, 0.04);
        assert_eq!(
            params.interest_rate,
            InterestRateModel::Fixed { annual_rate: 0.045 }
        );
        assert_eq!(params.investment.wrapper, InvestmentWrapper::Gia);
        assert_eq!(params.region, Region::Scotland);
    }

    #[test]
    fn fixed_model_requires_a_rate() {
        let mut flags = ParamArgs::default();
        flags.interest_model = CliInterestModel::Fixed;
        let err = build_params(&flags).expect_err("must require a rate");
        assert!(err.contains("--interest-rate"));
    }

    #[test]
    fn stray_rate_flags_are_rejected() {
        let mut flags = ParamArgs::default();
        flags.rpi_premium = Some(1.0);
        let err = build_params(&flags).expect_err("premium without rpi-linked");
        assert!(err.contains("--rpi-premium"));
    }

    #[test]
    fn core_validation_errors_surface_with_field_names() {
        let mut flags = ParamArgs::default();
        flags.years_since_first_repayment = 30;
        let err = build_params(&flags).expect_err("empty horizon");
        assert!(err.contains("write-off term"));

        let mut flags = ParamArgs::default();
        flags.overpayment = -5.0;
        let err = build_params(&flags).expect_err("negative overpayment");
        assert!(err.contains("monthly_overpayment"));
    }

    #[test]
    fn flat_threshold_flag_replaces_schedule() {
        let mut flags = ParamArgs::default();
        flags.repayment_threshold = Some(27_295.0);
        let params = build_params(&flags).expect("valid params");
        assert_eq!(params.thresholds, RepaymentThresholdSchedule::flat(27_295.0));
    }

    #[test]
    fn payload_overrides_only_present_fields() {
        let mut flags = ParamArgs::default();
        let payload = payload_from_json(
            r#"{
                "loanBalance": 60000,
                "overpayment": 350,
                "region": "scotland",
                "wrapper": "gia",
                "interestModel": "rpi-linked",
                "rpiPremium": 1.5,
                "iterations": 500,
                "seed": 9
            }"#,
        )
        .expect("valid payload");
        apply_payload(&mut flags, payload);

        assert_approx(flags.loan_balance, 60_000.0);
        assert_approx(flags.overpayment, 350.0);
        assert_approx(flags.salary, 35_000.0);
        assert_eq!(flags.region, CliRegion::Scotland);
        assert_eq!(flags.trials, 500);
        assert_eq!(flags.seed, Some(9));

        let params = build_params(&flags).expect("valid params");
        assert_eq!(
            params.interest_rate,
            InterestRateModel::RpiLinked { premium: 0.015 }
        );
        assert_eq!(params.investment.wrapper, InvestmentWrapper::Gia);
    }

    #[test]
    fn payload_rejects_unknown_enum_values() {
        let err = payload_from_json(r#"{"region":"wales"}"#).expect_err("unknown region");
        assert!(err.contains("Invalid params JSON"));
    }

    #[test]
    fn params_file_is_applied_over_flags() {
        let path = std::env::temp_dir().join(format!("loanmc-params-{}.json", std::process::id()));
        fs::write(&path, r#"{"salary": 52000, "trials": 50}"#).expect("write temp params");
        let run = RunArgs {
            flags: ParamArgs::default(),
            params_file: Some(path.clone()),
            format: OutputFormat::Json,
            sequential: true,
        };
        let flags = run.load_flags().expect("valid file");
        fs::remove_file(&path).ok();
        assert_approx(flags.salary, 52_000.0);
        assert_eq!(flags.trials, 50);
        assert_eq!(run.control().execution, Execution::Sequential);
    }

    #[test]
    fn missing_params_file_is_reported() {
        let run = RunArgs {
            flags: ParamArgs::default(),
            params_file: Some(PathBuf::from("/nonexistent/loanmc.json")),
            format: OutputFormat::Text,
            sequential: false,
        };
        let err = run.load_flags().expect_err("missing file");
        assert!(err.contains("Failed to read"));
    }

    #[test]
    fn simulate_json_reports_seed_and_summary() {
        let cli = parse(&[
            "loanmc", "simulate", "--trials", "50", "--seed", "7", "--format", "json",
        ]);
        let out = run_cli(cli).expect("simulation runs");
        let json: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
        assert_eq!(json["summary"]["seed"], 7);
        assert_eq!(json["summary"]["trialsIncluded"], 50);
        assert!(json["summary"]["probabilityInvestWins"].is_number());
        assert!(json["lumpSum"]["investValue"].is_number());
        assert!(json["now"]["takeHomePay"].is_number());
    }

    #[test]
    fn simulate_text_contains_verdict() {
        let cli = parse(&["loanmc", "simulate", "--trials", "50", "--seed", "7"]);
        let out = run_cli(cli).expect("simulation runs");
        assert!(out.contains("VERDICT"));
        assert!(out.contains("Seed: 7"));
    }

    #[test]
    fn trace_has_one_row_per_year() {
        let cli = parse(&[
            "loanmc",
            "trace",
            "--trials",
            "20",
            "--seed",
            "3",
            "--years-since-first-repayment",
            "25",
            "--format",
            "json",
        ]);
        let out = run_cli(cli).expect("trace runs");
        let json: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
        assert_eq!(json.as_array().map(Vec::len), Some(5));
    }

    #[test]
    fn invalid_input_is_an_error_not_a_panic() {
        let cli = parse(&["loanmc", "simulate", "--trials", "0"]);
        let err = run_cli(cli).expect_err("zero trials");
        assert!(err.contains("trials must be > 0"));
    }

    #[test]
    fn oversized_age_is_rejected_before_rendering() {
        let cli = parse(&["loanmc", "simulate", "--age", "4294967295", "--trials", "5"]);
        let err = run_cli(cli).expect_err("age out of range");
        assert!(err.contains("age"));
    }
}
