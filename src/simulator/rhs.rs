use crate::error::EpiError;
use crate::model::compartment::CompartmentName;
use crate::model::config::{BirthApproach, OutputConnection};
use crate::model::flow::{FlowCategory, FlowKind};
use crate::model::parameter::{ParameterName, ResolvedParameter};
use crate::model::{StratifiedModel, CRUDE_BIRTH_RATE, ENTRY_FRACTION, UNIVERSAL_DEATH_RATE};
use crate::simulator::tracker::{TrackedQuantities, Tracker};
use crate::simulator::V;

#[derive(Debug, Clone)]
struct Transition {
    kind: FlowKind,
    rate: ResolvedParameter,
    origin: usize,
    destination: usize,
    outputs: Vec<usize>,
}

#[derive(Debug, Clone)]
struct Death {
    rate: ResolvedParameter,
    origin: usize,
}

/// Right-hand side of a model, compiled to state-vector indices
///
/// Every parameter is resolved once here. Evaluation walks the compiled flows
/// in a fixed order: transitions, derived outputs, deaths, universal deaths,
/// births.
///
/// Frequency-dependent infection divides by the total population without a
/// guard; an empty population produces non-finite rates.
#[derive(Debug, Clone)]
pub struct ModelRhs {
    nstates: usize,
    transitions: Vec<Transition>,
    deaths: Vec<Death>,
    universal_deaths: Vec<(usize, ResolvedParameter)>,
    infectious: Vec<(usize, f64)>,
    birth_approach: BirthApproach,
    crude_birth_rate: Option<ResolvedParameter>,
    entry: Vec<(usize, f64)>,
    track_total_deaths: bool,
    output_names: Vec<String>,
}

fn index_of(model: &StratifiedModel, name: &CompartmentName) -> Result<usize, EpiError> {
    model
        .compartments()
        .index_of(name)
        .ok_or_else(|| EpiError::unknown_compartment(name.to_string(), "active flow"))
}

fn connects(
    connection: &OutputConnection,
    origin: &CompartmentName,
    destination: &CompartmentName,
) -> bool {
    origin.stem() == connection.origin
        && destination.stem() == connection.destination
        && connection
            .origin_strata
            .iter()
            .all(|tag| origin.layers().contains(tag))
}

impl ModelRhs {
    pub fn new(model: &StratifiedModel) -> Result<Self, EpiError> {
        let depth = model.depth();
        let parameters = model.parameters();
        let connections = model.output_connections();

        let mut transitions = Vec::new();
        for flow in model.flows().active_flows(FlowCategory::Transition, depth) {
            let Some(destination) = flow.destination() else {
                continue;
            };
            let outputs = connections
                .iter()
                .enumerate()
                .filter(|(_, connection)| connects(connection, flow.origin(), destination))
                .map(|(i, _)| i)
                .collect();
            transitions.push(Transition {
                kind: flow.kind(),
                rate: parameters.resolve(flow.parameter())?,
                origin: index_of(model, flow.origin())?,
                destination: index_of(model, destination)?,
                outputs,
            });
        }

        let deaths = model
            .flows()
            .active_flows(FlowCategory::Death, depth)
            .map(|flow| {
                Ok(Death {
                    rate: parameters.resolve(flow.parameter())?,
                    origin: index_of(model, flow.origin())?,
                })
            })
            .collect::<Result<Vec<_>, EpiError>>()?;

        let mut universal_deaths = Vec::new();
        let mut infectious = Vec::new();
        let mut entry = Vec::new();
        for (index, name) in model.compartments().names().iter().enumerate() {
            let universal = ParameterName::with_layers(UNIVERSAL_DEATH_RATE, name.layers());
            if let Some(rate) = parameters.resolve_optional(&universal) {
                if rate.is_time_variant() || rate.value(0.0) != 0.0 {
                    universal_deaths.push((index, rate));
                }
            }

            if name.stem() == model.infectious_compartment() {
                let weight: f64 = name
                    .layers()
                    .iter()
                    .map(|tag| model.infectiousness(tag))
                    .product();
                infectious.push((index, weight));
            }

            if name.stem() == model.entry_compartment() {
                let share: f64 = name
                    .layers()
                    .iter()
                    .map(|tag| {
                        parameters
                            .constant_value(&ParameterName::with_layers(
                                ENTRY_FRACTION,
                                std::slice::from_ref(tag),
                            ))
                            .unwrap_or(1.0)
                    })
                    .product();
                entry.push((index, share));
            }
        }

        let crude_birth_rate = match model.birth_approach() {
            BirthApproach::AddCrudeBirthRate => {
                Some(parameters.resolve(&ParameterName::new(CRUDE_BIRTH_RATE))?)
            }
            _ => None,
        };

        tracing::debug!(
            "compiled {} transitions, {} deaths and {} universal death rates over {} compartments",
            transitions.len(),
            deaths.len(),
            universal_deaths.len(),
            model.compartments().len()
        );

        Ok(ModelRhs {
            nstates: model.compartments().len(),
            transitions,
            deaths,
            universal_deaths,
            infectious,
            birth_approach: model.birth_approach(),
            crude_birth_rate,
            entry,
            track_total_deaths: model.tracks_total_deaths(),
            output_names: connections.iter().map(|c| c.name.clone()).collect(),
        })
    }

    pub fn nstates(&self) -> usize {
        self.nstates
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// A fresh tracker sized for this model's derived outputs
    pub fn tracker(&self) -> Tracker {
        Tracker::new(&self.output_names)
    }

    pub fn quantities(&self, x: &V) -> TrackedQuantities {
        TrackedQuantities {
            infectious_population: self.infectious.iter().map(|(i, w)| w * x[*i]).sum(),
            total_population: x.sum(),
            total_deaths: self.track_total_deaths.then_some(0.0),
        }
    }

    #[inline(always)]
    fn multiplier(kind: FlowKind, quantities: &TrackedQuantities) -> f64 {
        match kind {
            FlowKind::InfectionDensity => quantities.infectious_population,
            FlowKind::InfectionFrequency => {
                quantities.infectious_population / quantities.total_population
            }
            _ => 1.0,
        }
    }

    /// Evaluate the rates of change, updating the tracker
    pub fn rhs(&self, x: &V, t: f64, dx: &mut V, tracker: &mut Tracker) {
        self.evaluate(x, t, dx, Some(tracker));
    }

    /// Evaluate the rates of change without side effects
    pub fn rhs_untracked(&self, x: &V, t: f64, dx: &mut V) {
        self.evaluate(x, t, dx, None);
    }

    fn evaluate(&self, x: &V, t: f64, dx: &mut V, mut tracker: Option<&mut Tracker>) {
        dx.fill(0.0);
        let quantities = self.quantities(x);
        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.begin(quantities);
        }

        for transition in &self.transitions {
            let flow = transition.rate.value(t)
                * x[transition.origin]
                * Self::multiplier(transition.kind, &quantities);
            dx[transition.origin] -= flow;
            dx[transition.destination] += flow;
            if let Some(tracker) = tracker.as_deref_mut() {
                for &output in &transition.outputs {
                    tracker.accumulate(output, flow);
                }
            }
        }
        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.record(t);
        }

        let mut total_deaths = 0.0;
        for death in &self.deaths {
            let flow = death.rate.value(t) * x[death.origin];
            dx[death.origin] -= flow;
            total_deaths += flow;
        }
        for (index, rate) in &self.universal_deaths {
            let flow = rate.value(t) * x[*index];
            dx[*index] -= flow;
            total_deaths += flow;
        }
        if self.track_total_deaths {
            if let Some(tracker) = tracker.as_deref_mut() {
                tracker.set_total_deaths(total_deaths);
            }
        }

        let births = match self.birth_approach {
            BirthApproach::None => 0.0,
            BirthApproach::AddCrudeBirthRate => self
                .crude_birth_rate
                .as_ref()
                .map_or(0.0, |rate| rate.value(t) * quantities.total_population),
            BirthApproach::ReplaceDeaths => total_deaths,
        };
        if births != 0.0 {
            for (index, share) in &self.entry {
                dx[*index] += births * share;
            }
        }
    }

    /// Jacobian-vector product `J(x) v` of the rates of change
    pub fn jac_mul(&self, x: &V, t: f64, v: &V, y: &mut V) {
        y.fill(0.0);
        let quantities = self.quantities(x);
        let infectious_v: f64 = self.infectious.iter().map(|(i, w)| w * v[*i]).sum();
        let total_v = v.sum();

        for transition in &self.transitions {
            let rate = transition.rate.value(t);
            let (o, d) = (transition.origin, transition.destination);
            let dflow = match transition.kind {
                FlowKind::InfectionDensity => {
                    rate * (v[o] * quantities.infectious_population + x[o] * infectious_v)
                }
                FlowKind::InfectionFrequency => {
                    let n = quantities.total_population;
                    let i = quantities.infectious_population;
                    rate * (v[o] * i / n + x[o] * infectious_v / n - x[o] * i * total_v / (n * n))
                }
                _ => rate * v[o],
            };
            y[o] -= dflow;
            y[d] += dflow;
        }

        let mut dtotal_deaths = 0.0;
        for death in &self.deaths {
            let dflow = death.rate.value(t) * v[death.origin];
            y[death.origin] -= dflow;
            dtotal_deaths += dflow;
        }
        for (index, rate) in &self.universal_deaths {
            let dflow = rate.value(t) * v[*index];
            y[*index] -= dflow;
            dtotal_deaths += dflow;
        }

        let dbirths = match self.birth_approach {
            BirthApproach::None => 0.0,
            BirthApproach::AddCrudeBirthRate => self
                .crude_birth_rate
                .as_ref()
                .map_or(0.0, |rate| rate.value(t) * total_v),
            BirthApproach::ReplaceDeaths => dtotal_deaths,
        };
        if dbirths != 0.0 {
            for (index, share) in &self.entry {
                y[*index] += dbirths * share;
            }
        }
    }

    /// Summed transition rates of every derived output at one state
    pub fn output_values(&self, x: &V, t: f64) -> Vec<f64> {
        let quantities = self.quantities(x);
        let mut values = vec![0.0; self.output_names.len()];
        for transition in self.transitions.iter().filter(|tr| !tr.outputs.is_empty()) {
            let flow = transition.rate.value(t)
                * x[transition.origin]
                * Self::multiplier(transition.kind, &quantities);
            for &output in &transition.outputs {
                values[output] += flow;
            }
        }
        values
    }
}
