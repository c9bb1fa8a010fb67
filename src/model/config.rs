//! Typed model configuration

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

use crate::error::EpiError;
use crate::model::compartment::StratumTag;
use crate::model::flow::FlowKind;

/// How new individuals enter the population
///
/// Selected once at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BirthApproach {
    /// No births
    #[default]
    #[serde(alias = "no_births", alias = "no_birth")]
    None,
    /// `crude_birth_rate × total population`
    AddCrudeBirthRate,
    /// Births equal to the deaths of the same evaluation
    ReplaceDeaths,
}

impl BirthApproach {
    pub fn as_str(&self) -> &'static str {
        match self {
            BirthApproach::None => "none",
            BirthApproach::AddCrudeBirthRate => "add_crude_birth_rate",
            BirthApproach::ReplaceDeaths => "replace_deaths",
        }
    }
}

impl FromStr for BirthApproach {
    type Err = EpiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "no_births" | "no_birth" => Ok(BirthApproach::None),
            "add_crude_birth_rate" => Ok(BirthApproach::AddCrudeBirthRate),
            "replace_deaths" => Ok(BirthApproach::ReplaceDeaths),
            other => Err(EpiError::UnsupportedBirthApproach(other.to_string())),
        }
    }
}

impl fmt::Display for BirthApproach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unstratified flow between compartment types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowRequest {
    #[serde(rename = "type")]
    pub kind: FlowKind,
    pub parameter: String,
    #[serde(alias = "from")]
    pub origin: String,
    #[serde(alias = "to", default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl FlowRequest {
    pub fn standard(parameter: &str, origin: &str, destination: &str) -> Self {
        Self::transition(FlowKind::Standard, parameter, origin, destination)
    }

    pub fn infection_density(parameter: &str, origin: &str, destination: &str) -> Self {
        Self::transition(FlowKind::InfectionDensity, parameter, origin, destination)
    }

    pub fn infection_frequency(parameter: &str, origin: &str, destination: &str) -> Self {
        Self::transition(FlowKind::InfectionFrequency, parameter, origin, destination)
    }

    pub fn death(parameter: &str, origin: &str) -> Self {
        FlowRequest {
            kind: FlowKind::CompartmentDeath,
            parameter: parameter.to_string(),
            origin: origin.to_string(),
            destination: None,
        }
    }

    fn transition(kind: FlowKind, parameter: &str, origin: &str, destination: &str) -> Self {
        FlowRequest {
            kind,
            parameter: parameter.to_string(),
            origin: origin.to_string(),
            destination: Some(destination.to_string()),
        }
    }
}

/// A derived output accumulating every transition between two compartment stems
///
/// When `origin_strata` is non-empty, only flows whose origin compartment carries
/// all of the listed layers contribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConnection {
    pub name: String,
    pub origin: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origin_strata: Vec<StratumTag>,
}

impl OutputConnection {
    pub fn new(name: &str, origin: &str, destination: &str) -> Self {
        OutputConnection {
            name: name.to_string(),
            origin: origin.to_string(),
            destination: destination.to_string(),
            origin_strata: Vec::new(),
        }
    }

    /// Restrict the connection to origins in the given stratum
    pub fn with_origin_stratum(mut self, stratification: &str, stratum: &str) -> Self {
        self.origin_strata.push(StratumTag::new(stratification, stratum));
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_infectious() -> String {
    "infectious".to_string()
}

fn default_entry() -> String {
    "susceptible".to_string()
}

fn default_population() -> f64 {
    1.0
}

/// Everything needed to build an unstratified model
///
/// # Example
///
/// ```ignore
/// let config = ModelConfig::from_json(r#"{
///     "times": [0.0, 1.0, 2.0],
///     "compartment_types": ["susceptible", "infectious", "recovered"],
///     "initial_conditions": {"infectious": 0.001},
///     "parameters": {"beta": 400.0, "recovery": 28.07},
///     "flows": [
///         {"type": "infection_density", "parameter": "beta", "from": "susceptible", "to": "infectious"},
///         {"type": "standard", "parameter": "recovery", "from": "infectious", "to": "recovered"}
///     ]
/// }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Requested output times
    pub times: Vec<f64>,
    /// Unstratified compartment stems, in state-vector order
    pub compartment_types: Vec<String>,
    #[serde(default)]
    pub initial_conditions: HashMap<String, f64>,
    /// Constant parameter values
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
    #[serde(default)]
    pub flows: Vec<FlowRequest>,
    /// Top up the initial conditions to `starting_population`
    #[serde(default = "default_true")]
    pub initial_conditions_to_total: bool,
    #[serde(default = "default_infectious")]
    pub infectious_compartment: String,
    #[serde(default)]
    pub birth_approach: BirthApproach,
    /// Compartment receiving births
    #[serde(default = "default_entry")]
    pub entry_compartment: String,
    #[serde(default = "default_population")]
    pub starting_population: f64,
    /// Compartment receiving the unallocated population; the entry compartment if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_starting_compartment: Option<String>,
    /// Stop integrating once every rate of change falls below this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equilibrium_stopping_tolerance: Option<f64>,
    #[serde(default)]
    pub output_connections: Vec<OutputConnection>,
    /// Track deaths in each evaluation even when births do not need them
    #[serde(default)]
    pub track_total_deaths: bool,
}

impl ModelConfig {
    pub fn new(times: Vec<f64>, compartment_types: &[&str]) -> Self {
        ModelConfig {
            times,
            compartment_types: compartment_types.iter().map(|c| c.to_string()).collect(),
            initial_conditions: HashMap::new(),
            parameters: HashMap::new(),
            flows: Vec::new(),
            initial_conditions_to_total: true,
            infectious_compartment: default_infectious(),
            birth_approach: BirthApproach::None,
            entry_compartment: default_entry(),
            starting_population: default_population(),
            default_starting_compartment: None,
            equilibrium_stopping_tolerance: None,
            output_connections: Vec::new(),
            track_total_deaths: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, EpiError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, EpiError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Evenly spaced times from `start` to `end` inclusive
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_with_defaults() {
        let json = r#"{
            "times": [0.0, 1.0],
            "compartment_types": ["susceptible", "infectious", "recovered"],
            "initial_conditions": {"infectious": 0.001},
            "parameters": {"beta": 400.0, "recovery": 28.0, "infect_death": 1.0},
            "flows": [
                {"type": "standard_flows", "parameter": "recovery", "from": "infectious", "to": "recovered"},
                {"type": "infection_density", "parameter": "beta", "from": "susceptible", "to": "infectious"},
                {"type": "compartment_death", "parameter": "infect_death", "from": "infectious"}
            ],
            "birth_approach": "no_births"
        }"#;
        let config = ModelConfig::from_json(json).unwrap();
        assert_eq!(config.flows.len(), 3);
        assert_eq!(config.flows[0].kind, FlowKind::Standard);
        assert_eq!(config.flows[2].destination, None);
        assert_eq!(config.birth_approach, BirthApproach::None);
        assert!(config.initial_conditions_to_total);
        assert_eq!(config.entry_compartment, "susceptible");
        assert_eq!(config.starting_population, 1.0);
    }

    #[test]
    fn test_unknown_fields_and_approaches_rejected() {
        let unknown_field = r#"{"times": [0.0], "compartment_types": ["a"], "report": true}"#;
        assert!(ModelConfig::from_json(unknown_field).is_err());

        let bad_approach =
            r#"{"times": [0.0], "compartment_types": ["a"], "birth_approach": "immigration"}"#;
        assert!(matches!(
            ModelConfig::from_json(bad_approach),
            Err(EpiError::ParseError(_))
        ));
        assert!(matches!(
            "immigration".parse::<BirthApproach>(),
            Err(EpiError::UnsupportedBirthApproach(_))
        ));
        assert_eq!(
            "replace_deaths".parse::<BirthApproach>().unwrap(),
            BirthApproach::ReplaceDeaths
        );
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = ModelConfig::new(linspace(0.0, 1.0, 3), &["susceptible", "infectious"]);
        config
            .flows
            .push(FlowRequest::infection_frequency("beta", "susceptible", "infectious"));
        config.output_connections.push(
            OutputConnection::new("incidence", "susceptible", "infectious")
                .with_origin_stratum("age", "0"),
        );
        let parsed = ModelConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(0.0, 1.0, 3), vec![0.0, 0.5, 1.0]);
        assert_eq!(linspace(2.0, 5.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }
}
