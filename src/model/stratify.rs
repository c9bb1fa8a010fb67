//! Subdivision of compartments and flows along a new dimension

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::EpiError;
use crate::model::compartment::{check_name, CompartmentName, StratumTag};
use crate::model::flow::{Flow, FlowCategory, FlowKind};
use crate::model::parameter::ParameterName;
use crate::model::{StratifiedModel, ENTRY_FRACTION, UNIVERSAL_DEATH_RATE};

/// Name that switches on the age-specific behaviour of a stratification
pub const AGE: &str = "age";

/// Requested strata: explicit labels, numeric breakpoints, or a count labelled `1..=n`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Strata {
    Count(usize),
    Labels(Vec<String>),
    /// Numeric labels, typically age breakpoints; `5.0` is labelled `5`
    Breakpoints(Vec<f64>),
}

impl Strata {
    pub fn labels(&self) -> Vec<String> {
        match self {
            Strata::Count(n) => (1..=*n).map(|i| i.to_string()).collect(),
            Strata::Labels(labels) => labels.clone(),
            Strata::Breakpoints(values) => values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl From<usize> for Strata {
    fn from(n: usize) -> Self {
        Strata::Count(n)
    }
}

impl From<&[&str]> for Strata {
    fn from(labels: &[&str]) -> Self {
        Strata::Labels(labels.iter().map(|l| l.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Strata {
    fn from(labels: [&str; N]) -> Self {
        Strata::from(&labels[..])
    }
}

impl<const N: usize> From<[f64; N]> for Strata {
    fn from(values: [f64; N]) -> Self {
        Strata::Breakpoints(values.to_vec())
    }
}

/// Per-stratum values for one base parameter
///
/// A stratum listed in `overwrite` replaces every shallower component of the
/// parameter instead of multiplying it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Adjustment {
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overwrite: Vec<String>,
}

impl Adjustment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Multiply the inherited value for this stratum
    pub fn value(mut self, stratum: &str, value: f64) -> Self {
        self.values.insert(stratum.to_string(), value);
        self
    }

    /// Replace the inherited value for this stratum
    pub fn overwrite(mut self, stratum: &str, value: f64) -> Self {
        self.values.insert(stratum.to_string(), value);
        if !self.overwrite.iter().any(|s| s == stratum) {
            self.overwrite.push(stratum.to_string());
        }
        self
    }

    fn overwrites(&self, stratum: &str) -> bool {
        self.overwrite.iter().any(|s| s == stratum)
    }
}

/// One call to [`StratifiedModel::stratify`]
///
/// # Example
///
/// ```ignore
/// let request = StratificationRequest::new("risk", ["low", "high"])
///     .proportion("high", 0.2)
///     .adjust("recovery", Adjustment::new().value("low", 0.7).value("high", 0.5));
/// model.stratify(request)?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StratificationRequest {
    pub name: String,
    pub strata: Strata,
    /// Stems to stratify; all compartment types when empty
    #[serde(default)]
    pub compartments: Vec<String>,
    /// Adjustments keyed by base parameter name
    #[serde(default)]
    pub adjustments: HashMap<String, Adjustment>,
    /// Starting proportions keyed by stratum
    #[serde(default)]
    pub proportions: HashMap<String, f64>,
    /// Relative infectiousness keyed by stratum
    #[serde(default)]
    pub infectiousness: HashMap<String, f64>,
}

impl StratificationRequest {
    pub fn new(name: &str, strata: impl Into<Strata>) -> Self {
        StratificationRequest {
            name: name.to_string(),
            strata: strata.into(),
            compartments: Vec::new(),
            adjustments: HashMap::new(),
            proportions: HashMap::new(),
            infectiousness: HashMap::new(),
        }
    }

    pub fn compartments(mut self, stems: &[&str]) -> Self {
        self.compartments = stems.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn adjust(mut self, parameter: &str, adjustment: Adjustment) -> Self {
        self.adjustments.insert(parameter.to_string(), adjustment);
        self
    }

    pub fn proportion(mut self, stratum: &str, value: f64) -> Self {
        self.proportions.insert(stratum.to_string(), value);
        self
    }

    pub fn infectiousness(mut self, stratum: &str, value: f64) -> Self {
        self.infectiousness.insert(stratum.to_string(), value);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, EpiError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A stratification that has been applied to a model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratificationRecord {
    pub name: String,
    /// Strata in application order (ascending breakpoints for age)
    pub strata: Vec<String>,
    /// Stems that were stratified
    pub compartments: Vec<String>,
    /// Normalized starting proportions, aligned with `strata`
    pub proportions: Vec<f64>,
    pub generation: usize,
}

/// A request after validation, with every default filled in
struct Plan {
    name: String,
    labels: Vec<String>,
    tags: Vec<StratumTag>,
    stems: Vec<String>,
    adjustments: HashMap<String, Adjustment>,
    proportions: Vec<f64>,
    infectiousness: Vec<(StratumTag, f64)>,
    breakpoints: Option<Vec<f64>>,
    entry_fractions: Option<Vec<f64>>,
}

impl Plan {
    fn stratifies(&self, stem: &str) -> bool {
        self.stems.iter().any(|s| s == stem)
    }
}

impl StratifiedModel {
    /// Apply one stratification
    ///
    /// The request is fully validated before anything is changed, so a failed
    /// call leaves the model untouched.
    pub fn stratify(&mut self, request: StratificationRequest) -> Result<(), EpiError> {
        let plan = self.plan(request)?;
        let generation = self.flows.begin_generation();

        // snapshot before ageing flows join the current generation
        let transitions = self.flows.active_ids(FlowCategory::Transition);
        let deaths = self.flows.active_ids(FlowCategory::Death);
        let parents: Vec<(CompartmentName, f64)> = self
            .compartments
            .iter()
            .filter(|(name, _)| plan.stratifies(name.stem()))
            .map(|(name, value)| (name.clone(), value))
            .collect();

        if let Some(breakpoints) = &plan.breakpoints {
            self.add_ageing_flows(&plan, breakpoints, &parents)?;
        }

        for (parent, value) in &parents {
            for (tag, proportion) in plan.tags.iter().zip(&plan.proportions) {
                self.compartments
                    .add(parent.stratified(tag.clone()), value * proportion)?;
            }
            self.compartments.remove(parent);
        }

        self.expand_transitions(&plan, &transitions)?;

        if let Some(fractions) = &plan.entry_fractions {
            for (tag, fraction) in plan.tags.iter().zip(fractions) {
                self.parameters.set_constant(
                    ParameterName::with_layers(ENTRY_FRACTION, std::slice::from_ref(tag)),
                    *fraction,
                );
            }
        }

        self.expand_deaths(&plan, &deaths)?;

        if let Some(adjustment) = plan.adjustments.get(UNIVERSAL_DEATH_RATE) {
            let mut lineages: Vec<&[StratumTag]> = Vec::new();
            for (parent, _) in &parents {
                if !lineages.contains(&parent.layers()) {
                    lineages.push(parent.layers());
                }
            }
            for lineage in lineages {
                let inherited = ParameterName::with_layers(UNIVERSAL_DEATH_RATE, lineage);
                for tag in &plan.tags {
                    self.register_adjustment(&inherited, tag, adjustment);
                }
            }
        }

        for (tag, multiplier) in &plan.infectiousness {
            self.infectiousness.insert(tag.clone(), *multiplier);
        }

        tracing::debug!(
            "stratified {:?} by '{}' into {} strata at generation {}, now {} compartments",
            plan.stems,
            plan.name,
            plan.labels.len(),
            generation,
            self.compartments.len()
        );

        self.stratifications.push(StratificationRecord {
            name: plan.name,
            strata: plan.labels,
            compartments: plan.stems,
            proportions: plan.proportions,
            generation,
        });
        Ok(())
    }

    fn plan(&self, request: StratificationRequest) -> Result<Plan, EpiError> {
        let StratificationRequest {
            name,
            strata,
            compartments,
            mut adjustments,
            proportions,
            infectiousness,
        } = request;

        check_name(&name, true)?;
        if self.stratifications.iter().any(|s| s.name == name) {
            return Err(EpiError::DuplicateStratification(name));
        }

        let mut labels = strata.labels();
        if labels.is_empty() {
            return Err(EpiError::EmptyStrata(name));
        }
        let mut seen = HashSet::new();
        for label in &labels {
            check_name(label, false)?;
            if !seen.insert(label.as_str()) {
                return Err(EpiError::DuplicateStratum {
                    stratification: name.clone(),
                    stratum: label.clone(),
                });
            }
        }

        let breakpoints = if name == AGE {
            if !compartments.is_empty() {
                return Err(EpiError::AgeCompartmentSubset(compartments));
            }
            let (sorted_labels, breakpoints) = age_breakpoints(labels)?;
            labels = sorted_labels;
            Some(breakpoints)
        } else {
            None
        };

        let stems = if compartments.is_empty() {
            self.compartment_types.clone()
        } else {
            for stem in &compartments {
                if !self.compartment_types.contains(stem) {
                    return Err(EpiError::unknown_compartment(
                        stem,
                        format!("stratification '{}'", name),
                    ));
                }
            }
            compartments
        };

        for (parameter, adjustment) in adjustments.iter_mut() {
            if parameter != ENTRY_FRACTION && !self.declares_base(parameter) {
                return Err(EpiError::unknown_parameter(
                    parameter,
                    format!("adjustment for stratification '{}'", name),
                ));
            }
            let context = format!("adjustment of '{}'", parameter);
            for stratum in adjustment.values.keys().chain(&adjustment.overwrite) {
                if !labels.contains(stratum) {
                    return Err(EpiError::unknown_stratum(&name, stratum, context));
                }
            }
            for label in &labels {
                if !adjustment.values.contains_key(label) {
                    tracing::warn!(
                        "no adjustment of '{}' requested for stratum '{}' of '{}', using 1.0",
                        parameter,
                        label,
                        name
                    );
                    adjustment.values.insert(label.clone(), 1.0);
                }
            }
        }

        let proportions = normalized_proportions(&name, &labels, &proportions)?;

        let mut heterogeneous = Vec::new();
        if !infectiousness.is_empty() {
            if !stems.contains(&self.infectious_compartment) {
                return Err(EpiError::InfectiousnessNotStratified {
                    stratification: name,
                    infectious: self.infectious_compartment.clone(),
                });
            }
            for (stratum, multiplier) in infectiousness {
                if !labels.contains(&stratum) {
                    return Err(EpiError::unknown_stratum(
                        &name,
                        stratum,
                        "infectiousness adjustment",
                    ));
                }
                if !multiplier.is_finite() || multiplier < 0.0 {
                    return Err(EpiError::NegativeValue {
                        name: format!("infectiousness of '{}'", stratum),
                        value: multiplier,
                    });
                }
                heterogeneous.push((StratumTag::new(name.as_str(), stratum), multiplier));
            }
        }

        let entry_fractions = if stems.contains(&self.entry_compartment) {
            let fractions: Vec<f64> = if breakpoints.is_some() {
                (0..labels.len())
                    .map(|i| if i == 0 { 1.0 } else { 0.0 })
                    .collect()
            } else if let Some(adjustment) = adjustments.get(ENTRY_FRACTION) {
                labels
                    .iter()
                    .map(|label| adjustment.values.get(label).copied().unwrap_or(1.0))
                    .collect()
            } else {
                proportions.clone()
            };
            let total: f64 = fractions.iter().sum();
            if fractions.iter().any(|f| !f.is_finite() || *f < 0.0) || total <= 0.0 {
                return Err(EpiError::InvalidProportions {
                    stratification: name,
                    reason: "entry fractions must be non-negative and not all zero".to_string(),
                });
            }
            Some(fractions.into_iter().map(|f| f / total).collect())
        } else {
            None
        };

        let tags = labels
            .iter()
            .map(|label| StratumTag::new(name.as_str(), label.as_str()))
            .collect();

        Ok(Plan {
            name,
            labels,
            tags,
            stems,
            adjustments,
            proportions,
            infectiousness: heterogeneous,
            breakpoints,
            entry_fractions,
        })
    }

    fn add_ageing_flows(
        &mut self,
        plan: &Plan,
        breakpoints: &[f64],
        parents: &[(CompartmentName, f64)],
    ) -> Result<(), EpiError> {
        for (i, pair) in breakpoints.windows(2).enumerate() {
            let (from, to) = (&plan.tags[i], &plan.tags[i + 1]);
            let parameter =
                ParameterName::new(format!("ageing{}to{}", from.stratum(), to.stratum()));
            self.parameters.set_constant(parameter.clone(), 1.0 / (pair[1] - pair[0]));
            for (parent, _) in parents {
                self.flows.add_transition(Flow::transition(
                    FlowKind::Standard,
                    parameter.clone(),
                    parent.stratified(from.clone()),
                    parent.stratified(to.clone()),
                )?)?;
            }
        }
        Ok(())
    }

    fn expand_transitions(&mut self, plan: &Plan, ids: &[usize]) -> Result<(), EpiError> {
        let split = 1.0 / plan.tags.len() as f64;
        for &id in ids {
            let Some(flow) = self.flows.get(id).cloned() else {
                continue;
            };
            let Some(destination) = flow.destination() else {
                continue;
            };
            let origin_stratified = plan.stratifies(flow.origin().stem());
            let destination_stratified = plan.stratifies(destination.stem());
            if !origin_stratified && !destination_stratified {
                continue;
            }

            self.flows.supersede(id);
            for tag in &plan.tags {
                let parameter = match plan.adjustments.get(flow.parameter().base()) {
                    Some(adjustment) => self.register_adjustment(flow.parameter(), tag, adjustment),
                    None if !origin_stratified => {
                        let parameter = flow.parameter().stratified(tag.clone());
                        self.parameters.set_constant(parameter.clone(), split);
                        parameter
                    }
                    None => flow.parameter().clone(),
                };
                let origin = if origin_stratified {
                    flow.origin().stratified(tag.clone())
                } else {
                    flow.origin().clone()
                };
                let destination = if destination_stratified {
                    destination.stratified(tag.clone())
                } else {
                    destination.clone()
                };
                self.flows.add_transition(Flow::transition(
                    flow.kind(),
                    parameter,
                    origin,
                    destination,
                )?)?;
            }
        }
        Ok(())
    }

    fn expand_deaths(&mut self, plan: &Plan, ids: &[usize]) -> Result<(), EpiError> {
        for &id in ids {
            let Some(flow) = self.flows.get(id).cloned() else {
                continue;
            };
            if !plan.stratifies(flow.origin().stem()) {
                continue;
            }
            self.flows.supersede(id);
            for tag in &plan.tags {
                let parameter = match plan.adjustments.get(flow.parameter().base()) {
                    Some(adjustment) => self.register_adjustment(flow.parameter(), tag, adjustment),
                    None => flow.parameter().clone(),
                };
                self.flows
                    .add_death(Flow::death(parameter, flow.origin().stratified(tag.clone())))?;
            }
        }
        Ok(())
    }

    /// Register the adjusted component of `inherited` for one stratum and return its name
    fn register_adjustment(
        &mut self,
        inherited: &ParameterName,
        tag: &StratumTag,
        adjustment: &Adjustment,
    ) -> ParameterName {
        let parameter = inherited.stratified(tag.clone());
        let value = adjustment.values.get(tag.stratum()).copied().unwrap_or(1.0);
        self.parameters.set_constant(parameter.clone(), value);
        if adjustment.overwrites(tag.stratum()) {
            self.parameters.mark_overwrite(parameter.clone());
        }
        parameter
    }
}

/// Sort age labels by numeric value, inserting `0` when absent
fn age_breakpoints(labels: Vec<String>) -> Result<(Vec<String>, Vec<f64>), EpiError> {
    let mut parsed = labels
        .into_iter()
        .map(|label| match label.parse::<f64>() {
            Ok(age) if age.is_finite() && age >= 0.0 => Ok((label, age)),
            _ => Err(EpiError::NonNumericAgeBreakpoint(label)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if !parsed.iter().any(|(_, age)| *age == 0.0) {
        parsed.push(("0".to_string(), 0.0));
    }
    parsed.sort_by(|a, b| a.1.total_cmp(&b.1));
    if let Some(pair) = parsed.windows(2).find(|pair| pair[0].1 == pair[1].1) {
        return Err(EpiError::DuplicateStratum {
            stratification: AGE.to_string(),
            stratum: pair[1].0.clone(),
        });
    }
    Ok(parsed.into_iter().unzip())
}

fn normalized_proportions(
    name: &str,
    labels: &[String],
    requested: &HashMap<String, f64>,
) -> Result<Vec<f64>, EpiError> {
    for (stratum, value) in requested {
        if !labels.contains(stratum) {
            return Err(EpiError::unknown_stratum(name, stratum, "starting proportions"));
        }
        if !value.is_finite() || *value < 0.0 {
            return Err(EpiError::InvalidProportions {
                stratification: name.to_string(),
                reason: format!("proportion {} for stratum '{}'", value, stratum),
            });
        }
    }
    let default = 1.0 / labels.len() as f64;
    let raw: Vec<f64> = labels
        .iter()
        .map(|label| requested.get(label).copied().unwrap_or(default))
        .collect();
    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return Err(EpiError::InvalidProportions {
            stratification: name.to_string(),
            reason: "proportions sum to zero".to_string(),
        });
    }
    Ok(raw.into_iter().map(|p| p / total).collect())
}
