use serde::Serialize;

use crate::core::{
    BreakevenResult, BreakevenSolveResult, LumpSumComparison, SimulationParameters,
    SimulationSummary, SweepResult, Winner, YearSnapshot, tax,
};

const LABEL_WIDTH: usize = 38;

/// Where the borrower stands in the first simulated tax year.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub tax_year: i32,
    pub repayment_threshold: f64,
    pub take_home_pay: f64,
    pub marginal: tax::MarginalRates,
    pub annual_mandatory: f64,
    pub monthly_mandatory: f64,
    pub loan_interest_rate: f64,
    pub years_until_write_off: u32,
    pub write_off_age: u32,
}

impl Snapshot {
    pub fn new(params: &SimulationParameters) -> Self {
        let tax_year = params.base_tax_year;
        let rpi = params.inflation.mean;
        let threshold = params.thresholds.threshold(tax_year, rpi);
        let salary = params.salary.initial;
        let annual_mandatory = tax::student_loan_repayment(salary, threshold);

        Self {
            tax_year,
            repayment_threshold: threshold,
            take_home_pay: tax::take_home_pay(salary, params.region, tax_year, Some(threshold)),
            marginal: tax::marginal_rate_breakdown(salary, params.region, tax_year, Some(threshold)),
            annual_mandatory,
            monthly_mandatory: annual_mandatory / 12.0,
            loan_interest_rate: tax::student_loan_interest_rate(
                params.interest_rate,
                salary,
                rpi,
                threshold,
                params.thresholds.indexation(tax_year, rpi),
            ),
            years_until_write_off: params.horizon_years(),
            write_off_age: params.write_off_age(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse<'a> {
    pub parameters: &'a SimulationParameters,
    pub now: Snapshot,
    pub summary: &'a SimulationSummary,
    pub lump_sum: LumpSumComparison,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakevenResponse<'a> {
    pub table: &'a BreakevenResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solved: Option<&'a BreakevenSolveResult>,
}

/// `£12,345` style, rounded to whole pounds.
pub fn format_gbp(value: f64) -> String {
    let rounded = value.round();
    let sign = if rounded < 0.0 { "-" } else { "" };
    let digits = format!("{:.0}", rounded.abs());
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{sign}£{grouped}")
}

pub fn format_pct(value: f64) -> String {
    format!("{value:.1}%")
}

fn line(out: &mut String, text: impl AsRef<str>) {
    out.push_str(text.as_ref());
    out.push('\n');
}

fn row(out: &mut String, label: &str, value: impl AsRef<str>) {
    line(out, format!("  {label:<width$}{}", value.as_ref(), width = LABEL_WIDTH));
}

fn heading(out: &mut String, title: &str) {
    line(out, title);
    line(out, "=".repeat(title.chars().count()));
}

struct Verdict {
    winner: Winner,
    advantage: f64,
    advantage_pct: f64,
}

fn verdict(summary: &SimulationSummary) -> Verdict {
    let overpay = summary.overpay.net_worth.median;
    let invest = summary.invest.net_worth.median;
    let (winner, advantage) = if invest >= overpay {
        (Winner::Invest, invest - overpay)
    } else {
        (Winner::Overpay, overpay - invest)
    };
    let loser = overpay.min(invest);
    Verdict {
        winner,
        advantage,
        advantage_pct: if loser > 0.0 {
            advantage / loser * 100.0
        } else {
            0.0
        },
    }
}

fn verdict_text(
    params: &SimulationParameters,
    snapshot: &Snapshot,
    summary: &SimulationSummary,
    verdict: &Verdict,
) -> String {
    let overpay = format_gbp(params.monthly_overpayment);
    let advantage = format_gbp(verdict.advantage);
    let advantage_pct = format_pct(verdict.advantage_pct);
    let years = snapshot.years_until_write_off;
    let loan_rate = format_pct(snapshot.loan_interest_rate * 100.0);
    let market = format_pct(params.investment.expected_return * 100.0);
    let cleared_pct = summary.overpay.loan_cleared_rate * 100.0;
    let cleared_age = summary
        .overpay
        .median_months_to_clear
        .map(|months| params.age as f64 + months / 12.0);
    let years_investing = summary
        .overpay
        .median_months_to_clear
        .map(|months| years as f64 - months / 12.0)
        .unwrap_or(0.0);
    let freed = format_gbp(params.monthly_overpayment + snapshot.monthly_mandatory);

    match (verdict.winner, cleared_age) {
        (Winner::Invest, Some(age)) if cleared_pct >= 60.0 => format!(
            "Investing {overpay}/mo wins by {advantage} ({advantage_pct}). Overpaying would \
             clear the loan by age {age:.0} and free {freed}/mo for {years_investing:.0} years, \
             but investing from day one for the full {years} years at ~{market} outweighs the \
             {loan_rate} loan interest saved."
        ),
        (Winner::Invest, _) => format!(
            "Investing {overpay}/mo wins by {advantage} ({advantage_pct}). Overpayments clear \
             the loan before write-off at age {} in only {cleared_pct:.0}% of scenarios; the \
             rest goes towards a debt that is forgiven anyway. {years} years of growth at \
             ~{market} beat the {loan_rate} loan interest you would save.",
            snapshot.write_off_age
        ),
        (Winner::Overpay, age) => format!(
            "Overpaying {overpay}/mo wins by {advantage} ({advantage_pct}). Clearing the loan \
             by age {} ({cleared_pct:.0}% of scenarios) frees {freed}/mo to invest for \
             {years_investing:.0} years, which beats investing {overpay}/mo from day one.",
            age.map(|a| format!("{a:.0}"))
                .unwrap_or_else(|| snapshot.write_off_age.to_string())
        ),
    }
}

pub fn simulation_text(
    params: &SimulationParameters,
    snapshot: &Snapshot,
    summary: &SimulationSummary,
    lump_sum: &LumpSumComparison,
) -> String {
    let mut out = String::new();
    let m = &snapshot.marginal;

    heading(&mut out, "YOU NOW");
    row(&mut out, "Age", params.age.to_string());
    row(&mut out, "Salary", format_gbp(params.salary.initial));
    row(&mut out, "Loan balance", format_gbp(params.loan_balance));
    row(&mut out, "Take-home pay (annual)", format_gbp(snapshot.take_home_pay));
    row(&mut out, "Take-home pay (monthly)", format_gbp(snapshot.take_home_pay / 12.0));
    row(&mut out, "Marginal rate", format_pct(m.total_marginal_pct));
    row(
        &mut out,
        "  Breakdown",
        format!(
            "{} IT + {} NI + {} SL",
            format_pct(m.income_tax_pct),
            format_pct(m.ni_pct),
            format_pct(m.student_loan_pct)
        ),
    );
    row(&mut out, "Monthly mandatory repayment", format_gbp(snapshot.monthly_mandatory));
    row(&mut out, "Loan interest rate", format_pct(snapshot.loan_interest_rate * 100.0));
    row(&mut out, "Years until write-off", snapshot.years_until_write_off.to_string());
    row(&mut out, "Age at write-off", snapshot.write_off_age.to_string());
    out.push('\n');

    heading(
        &mut out,
        &format!("OPTION A: OVERPAY {}/MO", format_gbp(params.monthly_overpayment)),
    );
    match summary.overpay.median_months_to_clear {
        Some(months) => row(
            &mut out,
            "Loan clears at age (median)",
            format!("{:.0}", params.age as f64 + months / 12.0),
        ),
        None => row(&mut out, "Loan clears at age (median)", "Does not clear"),
    }
    row(
        &mut out,
        "Simulations where loan clears",
        format_pct(summary.overpay.loan_cleared_rate * 100.0),
    );
    row(&mut out, "Net worth at write-off (median)", format_gbp(summary.overpay.net_worth.median));
    row(&mut out, "Total repaid (median)", format_gbp(summary.overpay.total_repaid.median));
    row(&mut out, "Interest accrued (median)", format_gbp(summary.overpay.interest_accrued.median));
    out.push('\n');

    heading(
        &mut out,
        &format!("OPTION B: INVEST {}/MO", format_gbp(params.monthly_overpayment)),
    );
    row(&mut out, "Investment duration", format!("{} years", snapshot.years_until_write_off));
    row(&mut out, "Amount written off (median)", format_gbp(summary.invest.written_off.median));
    row(&mut out, "Net worth at write-off (median)", format_gbp(summary.invest.net_worth.median));
    row(&mut out, "Total repaid (median)", format_gbp(summary.invest.total_repaid.median));
    row(
        &mut out,
        "Net worth range (p10 to p90)",
        format!(
            "{} to {}",
            format_gbp(summary.invest.net_worth.p10),
            format_gbp(summary.invest.net_worth.p90)
        ),
    );
    out.push('\n');

    let verdict = verdict(summary);
    heading(&mut out, "VERDICT");
    line(&mut out, format!("  {}", verdict_text(params, snapshot, summary, &verdict)));
    row(
        &mut out,
        "Investing wins in",
        format_pct(summary.probability_invest_wins * 100.0),
    );
    row(
        &mut out,
        "Invest advantage (p10 / median / p90)",
        format!(
            "{} / {} / {}",
            format_gbp(summary.invest_advantage.p10),
            format_gbp(summary.invest_advantage.median),
            format_gbp(summary.invest_advantage.p90)
        ),
    );
    out.push('\n');

    heading(&mut out, "HYPOTHETICAL: LUMP SUM");
    row(&mut out, "Pay off now, then invest freed", format_gbp(lump_sum.payoff_value));
    row(&mut out, "Invest the lump sum instead", format_gbp(lump_sum.invest_value));
    row(
        &mut out,
        "Better option",
        match lump_sum.winner {
            Winner::Invest => "invest the lump sum",
            Winner::Overpay => "pay off now",
        },
    );
    out.push('\n');

    line(
        &mut out,
        format!(
            "Seed: {}  Trials: {}/{}",
            summary.seed, summary.trials_included, summary.trials_requested
        ),
    );
    for warning in &summary.warnings {
        line(
            &mut out,
            format!(
                "Warning: trial {} excluded ({})",
                warning.trial_index, warning.reason
            ),
        );
    }
    out
}

pub fn breakeven_text(table: &BreakevenResult, solved: Option<&BreakevenSolveResult>) -> String {
    let mut out = String::new();
    heading(&mut out, "BREAKEVEN");
    line(
        &mut out,
        format!(
            "  {:>10}  {:>8}  {:>10}  {:>12}  {:>12}  {:>8}  {:>12}",
            "Overpay", "Clears", "Clear age", "NW overpay", "NW invest", "Winner", "Margin"
        ),
    );
    for r in &table.rows {
        let age = r
            .median_age_cleared
            .map(|a| format!("{a:.0}"))
            .unwrap_or_else(|| "-".to_string());
        let winner = match r.winner {
            Winner::Overpay => "overpay",
            Winner::Invest => "invest",
        };
        line(
            &mut out,
            format!(
                "  {:>10}  {:>8}  {:>10}  {:>12}  {:>12}  {:>8}  {:>12}",
                format_gbp(r.monthly_overpayment),
                format_pct(r.loan_cleared_rate * 100.0),
                age,
                format_gbp(r.median_net_worth_overpay),
                format_gbp(r.median_net_worth_invest),
                winner,
                format_gbp(r.advantage)
            ),
        );
    }
    out.push('\n');
    match table.breakeven {
        Some(amount) => line(
            &mut out,
            format!("Breakeven overpayment: {}/month", format_gbp(amount)),
        ),
        None => line(&mut out, "Investing wins at every tested overpayment."),
    }

    if let Some(solved) = solved {
        line(&mut out, &solved.message);
        if let (Some(value), Some(rate), Some(ci)) = (
            solved.solved_overpayment,
            solved.achieved_win_rate,
            solved.achieved_win_rate_ci_half_width,
        ) {
            line(
                &mut out,
                format!(
                    "Solved overpayment: {}/month (overpay wins {} ± {})",
                    format_gbp(value),
                    format_pct(rate * 100.0),
                    format_pct(ci * 100.0)
                ),
            );
        }
    }
    line(&mut out, format!("Seed: {}", table.seed));
    out
}

pub fn sweep_text(result: &SweepResult) -> String {
    let mut out = String::new();
    heading(&mut out, "MEDIAN INVEST ADVANTAGE");
    for (l, loan) in result.grid.loan_balances.iter().enumerate() {
        line(&mut out, format!("Loan {}", format_gbp(*loan)));
        let mut header = format!("  {:>10}", "Salary");
        for overpay in &result.grid.overpayments {
            header.push_str(&format!("  {:>10}", format_gbp(*overpay)));
        }
        line(&mut out, header);
        for (s, salary) in result.grid.salaries.iter().enumerate() {
            let mut cells = format!("  {:>10}", format_gbp(*salary));
            for o in 0..result.grid.overpayments.len() {
                let value = result
                    .cell(l, s, o)
                    .map(|c| format_gbp(c.median_invest_advantage))
                    .unwrap_or_default();
                cells.push_str(&format!("  {value:>10}"));
            }
            line(&mut out, cells);
        }
        out.push('\n');
    }
    line(
        &mut out,
        format!(
            "Positive values favour investing. Seed: {}  Trials per cell: {}",
            result.seed, result.trials_per_cell
        ),
    );
    out
}

pub fn trace_text(years: &[YearSnapshot]) -> String {
    let mut out = String::new();
    heading(&mut out, "YEAR BY YEAR (MEDIAN)");
    line(
        &mut out,
        format!(
            "  {:>4}  {:>4}  {:>10}  {:>6}  {:>12}  {:>12}  {:>12}  {:>12}",
            "Year", "Age", "Salary", "RPI", "Bal overpay", "Pot overpay", "Bal invest", "Pot invest"
        ),
    );
    for y in years {
        line(
            &mut out,
            format!(
                "  {:>4}  {:>4}  {:>10}  {:>6}  {:>12}  {:>12}  {:>12}  {:>12}",
                y.year,
                y.age,
                format_gbp(y.median_salary),
                format_pct(y.median_rpi * 100.0),
                format_gbp(y.overpay_balance.median),
                format_gbp(y.overpay_portfolio.median),
                format_gbp(y.invest_balance.median),
                format_gbp(y.invest_portfolio.median)
            ),
        );
    }
    out
}
