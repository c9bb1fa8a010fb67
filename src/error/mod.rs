use diffsol::error::DiffsolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EpiError {
    // ─────────────────────────────────────────────────────────────────────────
    // Construction Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to parse a JSON configuration
    #[error("Failed to parse JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    /// A compartment name that is not part of the declared compartment types
    #[error("Compartment '{name}' is not available ({context})")]
    UnknownCompartment { name: String, context: String },

    /// A parameter that has neither a constant nor a time-variant registration
    #[error("Parameter '{name}' is not declared ({context})")]
    UnknownParameter { name: String, context: String },

    /// A compartment type declared twice
    #[error("Duplicate compartment name: '{name}'")]
    DuplicateCompartment { name: String },

    /// A name that contains reserved characters
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Requested birth approach '{0}' is unavailable")]
    UnsupportedBirthApproach(String),

    #[error("Birth approach '{approach}' requires parameter '{parameter}'")]
    MissingBirthParameter { approach: String, parameter: String },

    #[error("No integration times requested")]
    EmptyTimes,

    #[error("Negative value {value} requested for '{name}'")]
    NegativeValue { name: String, value: f64 },

    #[error("Parameter '{name}' has non-finite value {value}")]
    NonFiniteParameter { name: String, value: f64 },

    #[error("Requested integration time {time} is not finite")]
    NonFiniteTime { time: f64 },

    /// A death flow that also names a destination
    #[error("Death flow from '{origin}' must not have a destination ('{destination}')")]
    DeathFlowWithDestination { origin: String, destination: String },

    #[error("Transition flow from '{origin}' requires a destination")]
    MissingDestination { origin: String },

    #[error("Flow from '{origin}' is not a death flow")]
    NotADeathFlow { origin: String },

    #[error("Invalid interpolated time variant: {reason}")]
    InvalidInterpolation { reason: String },

    #[error("Equilibrium stopping tolerance must be positive, got {tolerance}")]
    InvalidTolerance { tolerance: f64 },

    /// Requested starting values sum beyond the declared population
    #[error("Initial conditions sum to {total}, which exceeds the starting population of {population}")]
    InitialConditionsExceedPopulation { total: f64, population: f64 },

    // ─────────────────────────────────────────────────────────────────────────
    // Stratification Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Stratification '{0}' has already been applied")]
    DuplicateStratification(String),

    #[error("Stratification '{0}' requests no strata")]
    EmptyStrata(String),

    #[error("Stratum '{stratum}' is listed more than once in stratification '{stratification}'")]
    DuplicateStratum {
        stratification: String,
        stratum: String,
    },

    /// An adjustment or proportion names a stratum outside the requested set
    #[error("Stratum '{stratum}' referenced by {context} is not one of the strata requested for '{stratification}'")]
    UnknownStratum {
        stratification: String,
        stratum: String,
        context: String,
    },

    #[error("Age breakpoint '{0}' is not numeric")]
    NonNumericAgeBreakpoint(String),

    #[error("Age stratification must apply to all compartments, but a subset was requested: {0:?}")]
    AgeCompartmentSubset(Vec<String>),

    #[error("Invalid proportions for stratification '{stratification}': {reason}")]
    InvalidProportions {
        stratification: String,
        reason: String,
    },

    #[error("Infectiousness adjustments for '{stratification}' require the infectious compartment '{infectious}' to be stratified")]
    InfectiousnessNotStratified {
        stratification: String,
        infectious: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Integration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Maximum step must be positive and finite, got {step}")]
    InvalidStepSize { step: f64 },

    #[error("State vector has length {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("The step size of the ODE solver went to zero near t = {time}, check for parameters close to 0.0 or INFINITE")]
    StepSizeTooSmall { time: f64 },

    #[error("Error in the ODE solver: {0}")]
    SolverError(#[from] DiffsolError),
}

impl EpiError {
    /// Create an unknown compartment error
    pub fn unknown_compartment(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnknownCompartment {
            name: name.into(),
            context: context.into(),
        }
    }

    /// Create an unknown parameter error
    pub fn unknown_parameter(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnknownParameter {
            name: name.into(),
            context: context.into(),
        }
    }

    /// Create an invalid name error
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown stratum error
    pub fn unknown_stratum(
        stratification: impl Into<String>,
        stratum: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self::UnknownStratum {
            stratification: stratification.into(),
            stratum: stratum.into(),
            context: context.into(),
        }
    }
}
