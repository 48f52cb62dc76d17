use super::error::ValidationError;
use super::types::{InterestRateModel, RepaymentThresholdSchedule, SimulationParameters};

fn finite(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::NotFinite { field, value })
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if finite(field, value)? < 0.0 {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}

/// Latest age a borrower can be modelled at.
pub const MAX_AGE: u32 = 150;
pub const MAX_WRITE_OFF_YEARS: u32 = 100;
pub const TAX_YEAR_RANGE: (i32, i32) = (1990, 2200);

fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if !(min..=max).contains(&finite(field, value)?) {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl SimulationParameters {
    /// Rejects anything the engine cannot simulate. Nothing is clamped.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.trials == 0 {
            return Err(ValidationError::NoTrials);
        }
        in_range("age", f64::from(self.age), 0.0, f64::from(MAX_AGE))?;
        in_range(
            "write_off_years",
            f64::from(self.write_off_years),
            1.0,
            f64::from(MAX_WRITE_OFF_YEARS),
        )?;
        in_range(
            "base_tax_year",
            f64::from(self.base_tax_year),
            f64::from(TAX_YEAR_RANGE.0),
            f64::from(TAX_YEAR_RANGE.1),
        )?;
        if self.years_since_first_repayment >= self.write_off_years {
            return Err(ValidationError::EmptyHorizon {
                years_since: self.years_since_first_repayment,
                write_off_years: self.write_off_years,
            });
        }

        non_negative("loan_balance", self.loan_balance)?;
        non_negative("monthly_overpayment", self.monthly_overpayment)?;

        non_negative("salary.initial", self.salary.initial)?;
        in_range("salary.growth_mean", self.salary.growth_mean, -1.0, 1.0)?;
        non_negative("salary.growth_volatility", self.salary.growth_volatility)?;
        in_range(
            "salary.redundancy_probability",
            self.salary.redundancy_probability,
            0.0,
            1.0,
        )?;

        in_range("investment.expected_return", self.investment.expected_return, -0.99, 10.0)?;
        non_negative("investment.volatility", self.investment.volatility)?;

        finite("inflation.mean", self.inflation.mean)?;
        non_negative("inflation.volatility", self.inflation.volatility)?;
        in_range(
            "inflation.return_correlation",
            self.inflation.return_correlation,
            -1.0,
            1.0,
        )?;

        validate_rate_model(self.interest_rate)?;
        validate_thresholds(&self.thresholds)?;
        Ok(())
    }
}

fn validate_rate_model(model: InterestRateModel) -> Result<(), ValidationError> {
    let malformed = |reason: String| Err(ValidationError::RateModel { reason });
    match model {
        InterestRateModel::Fixed { annual_rate } => {
            if !annual_rate.is_finite() || !(0.0..=1.0).contains(&annual_rate) {
                return malformed(format!("fixed annual rate {annual_rate} is not in [0, 1]"));
            }
        }
        InterestRateModel::RpiLinked { premium } => {
            if !premium.is_finite() || !(0.0..=1.0).contains(&premium) {
                return malformed(format!("RPI premium {premium} is not in [0, 1]"));
            }
        }
        InterestRateModel::Plan2 {
            max_premium,
            upper_threshold,
        } => {
            if !max_premium.is_finite() || !(0.0..=1.0).contains(&max_premium) {
                return malformed(format!("maximum premium {max_premium} is not in [0, 1]"));
            }
            if !upper_threshold.is_finite() || upper_threshold <= 0.0 {
                return malformed(format!("upper threshold {upper_threshold} must be > 0"));
            }
        }
    }
    Ok(())
}

fn validate_thresholds(schedule: &RepaymentThresholdSchedule) -> Result<(), ValidationError> {
    let malformed = |reason: String| Err(ValidationError::ThresholdSchedule { reason });
    if !schedule.frozen_value.is_finite() || schedule.frozen_value <= 0.0 {
        return malformed(format!(
            "frozen value {} must be > 0",
            schedule.frozen_value
        ));
    }
    for &(year, value) in &schedule.published {
        if !value.is_finite() || value <= 0.0 {
            return malformed(format!("threshold for {year} must be > 0, got {value}"));
        }
    }
    if schedule
        .published
        .windows(2)
        .any(|pair| pair[1].0 <= pair[0].0)
    {
        return malformed("published years must be strictly increasing".to_string());
    }
    Ok(())
}
