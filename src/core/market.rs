use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use super::types::SimulationParameters;

pub const MONTHS_PER_YEAR: usize = 12;

const RPI_FLOOR: f64 = 0.0;
const RPI_CAP: f64 = 0.12;
const SALARY_GROWTH_FLOOR: f64 = -0.05;
const SALARY_GROWTH_CAP: f64 = 0.15;

/// Random draws for one tax year of one trial.
#[derive(Debug, Clone, Copy)]
pub struct YearSample {
    pub monthly_returns: [f64; MONTHS_PER_YEAR],
    pub rpi: f64,
    pub salary_growth: f64,
}

/// Everything random about one trial, drawn before either strategy runs so
/// both face the same market.
#[derive(Debug, Clone)]
pub struct MarketPath {
    pub years: Vec<YearSample>,
}

impl MarketPath {
    /// Annual salary for each simulated year; year 0 is the starting salary.
    pub fn salaries(&self, initial: f64) -> Vec<f64> {
        let mut salary = initial;
        self.years
            .iter()
            .enumerate()
            .map(|(idx, year)| {
                if idx > 0 {
                    salary *= 1.0 + year.salary_growth;
                }
                salary
            })
            .collect()
    }
}

/// Monthly log-return parameters `(mu, sigma)` for an annual arithmetic
/// mean and volatility.
pub fn monthly_log_params(expected_return: f64, volatility: f64) -> (f64, f64) {
    let gross = 1.0 + expected_return;
    let annual_var = (1.0 + (volatility * volatility) / (gross * gross)).ln();
    let annual_mu = gross.ln() - annual_var / 2.0;
    let months = MONTHS_PER_YEAR as f64;
    (annual_mu / months, (annual_var / months).sqrt())
}

/// Draws the full path for `trial_index`. The number of draws per year is
/// fixed, so a path depends only on the seed, the index and the market
/// parameters.
pub fn draw_path(params: &SimulationParameters, seed: u64, trial_index: u32) -> MarketPath {
    let mut rng = StdRng::seed_from_u64(derive_trial_seed(seed, trial_index));
    let (mu, sigma) = monthly_log_params(
        params.investment.expected_return,
        params.investment.volatility,
    );
    let rho = params.inflation.return_correlation;
    let orth = (1.0 - rho * rho).max(0.0).sqrt();
    let salary = params.salary;

    let years = (0..params.horizon_years())
        .map(|_| {
            let mut monthly_returns = [0.0; MONTHS_PER_YEAR];
            let mut shock_sum = 0.0;
            for slot in monthly_returns.iter_mut() {
                let z: f64 = StandardNormal.sample(&mut rng);
                shock_sum += z;
                *slot = (mu + sigma * z).exp() - 1.0;
            }
            let year_shock = shock_sum / (MONTHS_PER_YEAR as f64).sqrt();

            let z_rpi: f64 = StandardNormal.sample(&mut rng);
            let rpi = (params.inflation.mean
                + params.inflation.volatility * (rho * year_shock + orth * z_rpi))
                .clamp(RPI_FLOOR, RPI_CAP);

            let z_salary: f64 = StandardNormal.sample(&mut rng);
            let redundant = rng.gen_bool(salary.redundancy_probability);
            let salary_growth = if redundant {
                0.0
            } else {
                (salary.growth_mean + salary.growth_volatility * z_salary)
                    .clamp(SALARY_GROWTH_FLOOR, SALARY_GROWTH_CAP)
            };

            YearSample {
                monthly_returns,
                rpi,
                salary_growth,
            }
        })
        .collect();

    MarketPath { years }
}

/// Seed for one trial's stream; independent of how trials are scheduled.
pub fn derive_trial_seed(base_seed: u64, trial_index: u32) -> u64 {
    splitmix64(base_seed ^ splitmix64(trial_index as u64))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
