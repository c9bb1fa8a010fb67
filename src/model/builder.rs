use std::collections::{HashMap, HashSet};

use crate::error::EpiError;
use crate::model::compartment::{check_name, CompartmentName, CompartmentStore};
use crate::model::config::{BirthApproach, ModelConfig};
use crate::model::flow::{Flow, FlowKind, FlowRegistry};
use crate::model::parameter::{ParameterName, ParameterStore, TimeVariant};
use crate::model::{StratifiedModel, CRUDE_BIRTH_RATE, UNIVERSAL_DEATH_RATE};

/// Assembles and validates a [`StratifiedModel`]
///
/// # Example
///
/// ```ignore
/// let model = StratifiedModel::builder(config)
///     .time_variant("beta", |t| 400.0 * (1.0 + 0.1 * t.sin()))
///     .build()?;
/// ```
pub struct ModelBuilder {
    config: ModelConfig,
    time_variants: Vec<(String, TimeVariant)>,
}

impl ModelBuilder {
    pub fn new(config: ModelConfig) -> Self {
        ModelBuilder {
            config,
            time_variants: Vec::new(),
        }
    }

    pub fn time_variant<F>(self, name: &str, function: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        self.time_variant_fn(name, TimeVariant::new(function))
    }

    pub fn time_variant_fn(mut self, name: &str, function: TimeVariant) -> Self {
        self.time_variants.push((name.to_string(), function));
        self
    }

    pub fn build(self) -> Result<StratifiedModel, EpiError> {
        let ModelBuilder {
            config,
            time_variants,
        } = self;

        // 1. Times
        let times = validate_times(config.times.clone())?;

        // 2. Compartment types
        let mut declared = HashSet::new();
        for compartment in &config.compartment_types {
            check_name(compartment, false)?;
            if !declared.insert(compartment.as_str()) {
                return Err(EpiError::DuplicateCompartment {
                    name: compartment.clone(),
                });
            }
        }
        let require_declared = |name: &str, context: &str| {
            if declared.contains(name) {
                Ok(())
            } else {
                Err(EpiError::unknown_compartment(name, context))
            }
        };
        require_declared(&config.infectious_compartment, "infectious compartment")?;
        require_declared(&config.entry_compartment, "entry compartment")?;
        if let Some(default) = &config.default_starting_compartment {
            require_declared(default, "default starting compartment")?;
        }

        // 3. Parameters
        let mut parameters = ParameterStore::new();
        for (name, value) in &config.parameters {
            check_name(name, false)?;
            if !value.is_finite() {
                return Err(EpiError::NonFiniteParameter {
                    name: name.clone(),
                    value: *value,
                });
            }
            parameters.set_constant(ParameterName::new(name.as_str()), *value);
        }
        for (name, function) in time_variants {
            parameters.set_time_variant(ParameterName::parse(&name)?, function);
        }
        let universal_death_rate = ParameterName::new(UNIVERSAL_DEATH_RATE);
        if !parameters.is_declared(&universal_death_rate) {
            parameters.set_constant(universal_death_rate, 0.0);
        }

        // 4. Flows
        let mut flows = FlowRegistry::new();
        for request in &config.flows {
            let context = format!("flow using '{}'", request.parameter);
            let parameter = ParameterName::new(request.parameter.as_str());
            if !parameters.is_declared(&parameter) {
                return Err(EpiError::unknown_parameter(&request.parameter, context));
            }
            require_declared(&request.origin, &context)?;
            let origin = CompartmentName::new(request.origin.as_str());
            match (request.kind, &request.destination) {
                (FlowKind::CompartmentDeath, None) => {
                    flows.add_death(Flow::death(parameter, origin))?;
                }
                (FlowKind::CompartmentDeath, Some(destination)) => {
                    return Err(EpiError::DeathFlowWithDestination {
                        origin: request.origin.clone(),
                        destination: destination.clone(),
                    });
                }
                (kind, Some(destination)) => {
                    require_declared(destination, &context)?;
                    flows.add_transition(Flow::transition(
                        kind,
                        parameter,
                        origin,
                        CompartmentName::new(destination.as_str()),
                    )?)?;
                }
                (_, None) => {
                    return Err(EpiError::MissingDestination {
                        origin: request.origin.clone(),
                    });
                }
            }
        }

        // 5. Births
        let track_total_deaths = match config.birth_approach {
            BirthApproach::AddCrudeBirthRate => {
                if !parameters.is_declared(&ParameterName::new(CRUDE_BIRTH_RATE)) {
                    return Err(EpiError::MissingBirthParameter {
                        approach: config.birth_approach.to_string(),
                        parameter: CRUDE_BIRTH_RATE.to_string(),
                    });
                }
                config.track_total_deaths
            }
            BirthApproach::ReplaceDeaths => true,
            BirthApproach::None => config.track_total_deaths,
        };

        // 6. Output connections
        for connection in &config.output_connections {
            let context = format!("output connection '{}'", connection.name);
            require_declared(&connection.origin, &context)?;
            require_declared(&connection.destination, &context)?;
        }

        if let Some(tolerance) = config.equilibrium_stopping_tolerance {
            if tolerance.is_nan() || tolerance <= 0.0 {
                return Err(EpiError::InvalidTolerance { tolerance });
            }
        }

        // 7. Initial conditions
        let compartments = initial_compartments(&config)?;

        tracing::info!(
            "integrating from time {} to {}",
            times[0],
            times[times.len() - 1]
        );
        tracing::info!(
            "infectious compartment is '{}', birth approach is {}",
            config.infectious_compartment,
            config.birth_approach
        );

        Ok(StratifiedModel {
            times,
            compartment_types: config.compartment_types,
            compartments,
            flows,
            parameters,
            infectious_compartment: config.infectious_compartment,
            entry_compartment: config.entry_compartment,
            birth_approach: config.birth_approach,
            output_connections: config.output_connections,
            track_total_deaths,
            equilibrium_stopping_tolerance: config.equilibrium_stopping_tolerance,
            infectiousness: HashMap::new(),
            stratifications: Vec::new(),
        })
    }
}

fn validate_times(mut times: Vec<f64>) -> Result<Vec<f64>, EpiError> {
    if times.is_empty() {
        return Err(EpiError::EmptyTimes);
    }
    if let Some(bad) = times.iter().find(|t| !t.is_finite()) {
        return Err(EpiError::NonFiniteTime { time: *bad });
    }
    if times.windows(2).any(|pair| pair[0] > pair[1]) {
        tracing::warn!("requested integration times are not sorted, now sorting");
        times.sort_by(|a, b| a.total_cmp(b));
    }
    Ok(times)
}

/// Starting values for the unstratified compartments, topped up to the total if requested
fn initial_compartments(config: &ModelConfig) -> Result<CompartmentStore, EpiError> {
    for (name, value) in &config.initial_conditions {
        if !config.compartment_types.contains(name) {
            return Err(EpiError::unknown_compartment(name, "initial conditions"));
        }
        if !value.is_finite() || *value < 0.0 {
            return Err(EpiError::NegativeValue {
                name: name.clone(),
                value: *value,
            });
        }
    }
    if !config.starting_population.is_finite() || config.starting_population < 0.0 {
        return Err(EpiError::NegativeValue {
            name: "starting_population".to_string(),
            value: config.starting_population,
        });
    }

    let requested: f64 = config.initial_conditions.values().sum();
    if requested - config.starting_population > f64::EPSILON * config.starting_population.max(1.0) {
        return Err(EpiError::InitialConditionsExceedPopulation {
            total: requested,
            population: config.starting_population,
        });
    }

    let mut store = CompartmentStore::new();
    for compartment in &config.compartment_types {
        let value = match config.initial_conditions.get(compartment) {
            Some(value) => *value,
            None => {
                tracing::debug!(
                    "no starting value requested for {} so set to zero",
                    compartment
                );
                0.0
            }
        };
        store.add(CompartmentName::new(compartment.as_str()), value)?;
    }

    if config.initial_conditions_to_total {
        let remainder = config.starting_population - store.total();
        let target = match &config.default_starting_compartment {
            Some(default) => default.clone(),
            None => {
                tracing::info!(
                    "no default starting compartment requested for unallocated population, so will be allocated to entry compartment {}",
                    config.entry_compartment
                );
                config.entry_compartment.clone()
            }
        };
        let target = CompartmentName::new(target);
        let current = store.get(&target).unwrap_or(0.0);
        store.set(&target, current + remainder.max(0.0));
    }

    Ok(store)
}

