pub mod builder;
pub mod compartment;
pub mod config;
pub mod flow;
pub mod parameter;
pub mod stratify;

use std::collections::HashMap;

use crate::error::EpiError;
pub use builder::ModelBuilder;
use compartment::{CompartmentStore, StratumTag};
use config::{BirthApproach, ModelConfig, OutputConnection};
use flow::FlowRegistry;
use parameter::{ParameterName, ParameterStore, TimeVariant};
use stratify::StratificationRecord;

/// Parameter scaling births under [`BirthApproach::AddCrudeBirthRate`]
pub const CRUDE_BIRTH_RATE: &str = "crude_birth_rate";
/// Death rate applied to every compartment without an explicit flow
pub const UNIVERSAL_DEATH_RATE: &str = "universal_death_rate";
/// Base name of the per-stratum share of births
pub const ENTRY_FRACTION: &str = "entry_fraction";

/// A compartmental model together with every stratification applied to it
///
/// Built once from a [`ModelConfig`], then deepened with
/// [`StratifiedModel::stratify`]. All stratification must happen before the
/// model is run.
#[derive(Debug, Clone)]
pub struct StratifiedModel {
    pub(crate) times: Vec<f64>,
    pub(crate) compartment_types: Vec<String>,
    pub(crate) compartments: CompartmentStore,
    pub(crate) flows: FlowRegistry,
    pub(crate) parameters: ParameterStore,
    pub(crate) infectious_compartment: String,
    pub(crate) entry_compartment: String,
    pub(crate) birth_approach: BirthApproach,
    pub(crate) output_connections: Vec<OutputConnection>,
    pub(crate) track_total_deaths: bool,
    pub(crate) equilibrium_stopping_tolerance: Option<f64>,
    pub(crate) infectiousness: HashMap<StratumTag, f64>,
    pub(crate) stratifications: Vec<StratificationRecord>,
}

impl StratifiedModel {
    pub fn builder(config: ModelConfig) -> ModelBuilder {
        ModelBuilder::new(config)
    }

    /// Build a model that only uses constant parameters
    pub fn new(config: ModelConfig) -> Result<Self, EpiError> {
        ModelBuilder::new(config).build()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn compartment_types(&self) -> &[String] {
        &self.compartment_types
    }

    pub fn compartments(&self) -> &CompartmentStore {
        &self.compartments
    }

    /// Rendered compartment names in state-vector order
    pub fn compartment_names(&self) -> Vec<String> {
        self.compartments
            .names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    /// Number of stratifications applied so far
    pub fn depth(&self) -> usize {
        self.flows.depth()
    }

    pub fn stratifications(&self) -> &[StratificationRecord] {
        &self.stratifications
    }

    pub fn infectious_compartment(&self) -> &str {
        &self.infectious_compartment
    }

    pub fn entry_compartment(&self) -> &str {
        &self.entry_compartment
    }

    pub fn birth_approach(&self) -> BirthApproach {
        self.birth_approach
    }

    pub fn output_connections(&self) -> &[OutputConnection] {
        &self.output_connections
    }

    pub fn tracks_total_deaths(&self) -> bool {
        self.track_total_deaths
    }

    pub fn equilibrium_stopping_tolerance(&self) -> Option<f64> {
        self.equilibrium_stopping_tolerance
    }

    /// Relative infectiousness of one stratum, `1.0` unless adjusted
    pub fn infectiousness(&self, tag: &StratumTag) -> f64 {
        self.infectiousness.get(tag).copied().unwrap_or(1.0)
    }

    /// Register a time-variant component, by base or by rendered stratified name
    pub fn add_time_variant(&mut self, name: &str, function: TimeVariant) -> Result<(), EpiError> {
        let name = ParameterName::parse(name)?;
        self.parameters.set_time_variant(name, function);
        Ok(())
    }

    /// Whether any component registered in the store has this base name
    pub(crate) fn declares_base(&self, base: &str) -> bool {
        self.parameters.has_base(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{self, FlowRequest};
    use approx::assert_relative_eq;

    fn sir_config() -> ModelConfig {
        let mut config = ModelConfig::new(
            config::linspace(0.0, 60.0 / 365.0, 60),
            &["susceptible", "infectious", "recovered"],
        );
        config.initial_conditions.insert("infectious".to_string(), 0.001);
        config.parameters.insert("beta".to_string(), 400.0);
        config.parameters.insert("recovery".to_string(), 365.0 / 13.0);
        config.parameters.insert("infect_death".to_string(), 1.0);
        config.flows = vec![
            FlowRequest::standard("recovery", "infectious", "recovered"),
            FlowRequest::infection_density("beta", "susceptible", "infectious"),
            FlowRequest::death("infect_death", "infectious"),
        ];
        config
    }

    #[test]
    fn test_build_sir_model() {
        let model = StratifiedModel::new(sir_config()).unwrap();
        assert_eq!(
            model.compartment_names(),
            vec!["susceptible", "infectious", "recovered"]
        );
        assert_relative_eq!(model.compartments().values()[0], 0.999);
        assert_relative_eq!(model.compartments().total(), 1.0);
        assert_eq!(model.flows().len(), 3);
        assert_eq!(model.depth(), 0);
        // universal death rate is declared with a neutral default
        assert!(model
            .parameters()
            .is_declared(&ParameterName::new(UNIVERSAL_DEATH_RATE)));
    }

    #[test]
    fn test_remainder_goes_to_default_starting_compartment() {
        let mut config = sir_config();
        config.default_starting_compartment = Some("recovered".to_string());
        let model = StratifiedModel::new(config).unwrap();
        assert_relative_eq!(model.compartments().values()[0], 0.0);
        assert_relative_eq!(model.compartments().values()[2], 0.999);
    }

    #[test]
    fn test_initial_conditions_exceeding_population() {
        let mut config = sir_config();
        config.initial_conditions.insert("susceptible".to_string(), 1.5);
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::InitialConditionsExceedPopulation { .. })
        ));
    }

    #[test]
    fn test_initial_conditions_not_topped_up() {
        let mut config = sir_config();
        config.initial_conditions_to_total = false;
        let model = StratifiedModel::new(config).unwrap();
        assert_relative_eq!(model.compartments().total(), 0.001);
    }

    #[test]
    fn test_undeclared_compartments_rejected() {
        let mut config = sir_config();
        config.infectious_compartment = "exposed".to_string();
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::UnknownCompartment { .. })
        ));

        let mut config = sir_config();
        config.entry_compartment = "newborn".to_string();
        assert!(StratifiedModel::new(config).is_err());

        let mut config = sir_config();
        config.default_starting_compartment = Some("elsewhere".to_string());
        assert!(StratifiedModel::new(config).is_err());

        let mut config = sir_config();
        config
            .flows
            .push(FlowRequest::standard("recovery", "infectious", "immune"));
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::UnknownCompartment { .. })
        ));
    }

    #[test]
    fn test_undeclared_flow_parameter_rejected() {
        let mut config = sir_config();
        config
            .flows
            .push(FlowRequest::standard("waning", "recovered", "susceptible"));
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_time_variant_declares_parameter() {
        let mut config = sir_config();
        config
            .flows
            .push(FlowRequest::standard("waning", "recovered", "susceptible"));
        let model = StratifiedModel::builder(config)
            .time_variant("waning", |t| 0.1 * t)
            .build()
            .unwrap();
        assert_eq!(model.flows().len(), 4);
    }

    #[test]
    fn test_crude_birth_rate_required() {
        let mut config = sir_config();
        config.birth_approach = BirthApproach::AddCrudeBirthRate;
        assert!(matches!(
            StratifiedModel::new(config.clone()),
            Err(EpiError::MissingBirthParameter { .. })
        ));
        config.parameters.insert(CRUDE_BIRTH_RATE.to_string(), 0.02);
        assert!(StratifiedModel::new(config).is_ok());
    }

    #[test]
    fn test_replace_deaths_tracks_deaths() {
        let mut config = sir_config();
        config.birth_approach = BirthApproach::ReplaceDeaths;
        let model = StratifiedModel::new(config).unwrap();
        assert!(model.tracks_total_deaths());
    }

    #[test]
    fn test_unsorted_times_are_sorted() {
        let mut config = sir_config();
        config.times = vec![2.0, 0.0, 1.0];
        let model = StratifiedModel::new(config).unwrap();
        assert_eq!(model.times(), &[0.0, 1.0, 2.0]);

        let mut config = sir_config();
        config.times.clear();
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::EmptyTimes)
        ));
    }

    #[test]
    fn test_marker_in_names_rejected() {
        let mut config = sir_config();
        config.compartment_types.push("Xray".to_string());
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_death_flow_with_destination_rejected() {
        let mut config = sir_config();
        let mut death = FlowRequest::death("infect_death", "infectious");
        death.destination = Some("recovered".to_string());
        config.flows.push(death);
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::DeathFlowWithDestination { origin, destination })
                if origin == "infectious" && destination == "recovered"
        ));

        let mut config = sir_config();
        let mut recovery = FlowRequest::standard("recovery", "infectious", "recovered");
        recovery.destination = None;
        config.flows.push(recovery);
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::MissingDestination { origin }) if origin == "infectious"
        ));
    }

    #[test]
    fn test_invalid_values_are_named() {
        let mut config = sir_config();
        config.parameters.insert("beta".to_string(), f64::NAN);
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::NonFiniteParameter { name, .. }) if name == "beta"
        ));

        let mut config = sir_config();
        config.times.push(f64::INFINITY);
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::NonFiniteTime { .. })
        ));

        let mut config = sir_config();
        config.equilibrium_stopping_tolerance = Some(0.0);
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::InvalidTolerance { tolerance }) if tolerance == 0.0
        ));
    }

    #[test]
    fn test_initial_conditions_exceeding_population_without_top_up() {
        let mut config = sir_config();
        config.initial_conditions_to_total = false;
        config.initial_conditions.insert("susceptible".to_string(), 1.2);
        assert!(matches!(
            StratifiedModel::new(config),
            Err(EpiError::InitialConditionsExceedPopulation { .. })
        ));
    }

    #[test]
    fn test_time_variant_added_after_stratification() {
        use crate::model::stratify::{Adjustment, StratificationRequest};

        let mut model = StratifiedModel::new(sir_config()).unwrap();
        model
            .stratify(
                StratificationRequest::new("risk", ["low", "high"])
                    .adjust("beta", Adjustment::new().value("low", 0.5).value("high", 2.0)),
            )
            .unwrap();
        model
            .add_time_variant("betaXrisk_high", TimeVariant::new(|t| 1.0 + t))
            .unwrap();

        let high = ParameterName::parse("betaXrisk_high").unwrap();
        let low = ParameterName::parse("betaXrisk_low").unwrap();
        let resolved = model.parameters().resolve(&high).unwrap();
        assert!(resolved.is_time_variant());
        // the time variant replaces the constant 2.0 adjustment, not the base
        assert_relative_eq!(resolved.value(2.0), 400.0 * 3.0);
        assert_relative_eq!(model.parameters().resolve(&low).unwrap().value(2.0), 200.0);

        assert!(matches!(
            model.add_time_variant("betaXrisk", TimeVariant::new(|_| 1.0)),
            Err(EpiError::InvalidName { .. })
        ));
    }
}
