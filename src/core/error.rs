use thiserror::Error;

/// A parameter that cannot be simulated, reported before any trial runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("trials must be > 0")]
    NoTrials,

    #[error("{field} must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("{field} must be >= 0, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error(
        "years since first repayment ({years_since}) must be less than the write-off term ({write_off_years})"
    )]
    EmptyHorizon { years_since: u32, write_off_years: u32 },

    #[error("interest rate model is malformed: {reason}")]
    RateModel { reason: String },

    #[error("repayment threshold schedule is malformed: {reason}")]
    ThresholdSchedule { reason: String },

    #[error("breakeven search is malformed: {reason}")]
    SolverConfig { reason: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimulationError {
    #[error("invalid parameters: {0}")]
    Invalid(#[from] ValidationError),

    #[error("simulation cancelled after {completed} trials")]
    Cancelled { completed: u32 },

    #[error("every trial produced non-finite values ({excluded} excluded)")]
    NoValidTrials { excluded: u32 },
}
