use serde::{Deserialize, Serialize};

use crate::error::EpiError;
use crate::model::compartment::CompartmentName;
use crate::model::parameter::ParameterName;

/// Rate law of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// `rate × origin`
    #[serde(alias = "standard_flows")]
    Standard,
    /// `rate × origin × infectious population`
    InfectionDensity,
    /// `rate × origin × infectious population ÷ total population`
    InfectionFrequency,
    /// `rate × origin`, leaving the system
    CompartmentDeath,
}

impl FlowKind {
    pub fn category(&self) -> FlowCategory {
        match self {
            FlowKind::CompartmentDeath => FlowCategory::Death,
            _ => FlowCategory::Transition,
        }
    }
}

/// Flows are registered and applied in two separate groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowCategory {
    Transition,
    Death,
}

/// One flow record
///
/// `generation` is the stratification depth at which the record became
/// authoritative for its endpoints and never changes afterwards. A record is
/// superseded once a later stratification replaces it with per-stratum copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    kind: FlowKind,
    parameter: ParameterName,
    origin: CompartmentName,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<CompartmentName>,
    generation: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    superseded_at: Option<usize>,
}

impl Flow {
    /// A transition between two compartments
    pub fn transition(
        kind: FlowKind,
        parameter: ParameterName,
        origin: CompartmentName,
        destination: CompartmentName,
    ) -> Result<Self, EpiError> {
        if kind.category() != FlowCategory::Transition {
            return Err(EpiError::DeathFlowWithDestination {
                origin: origin.to_string(),
                destination: destination.to_string(),
            });
        }
        Ok(Flow {
            kind,
            parameter,
            origin,
            destination: Some(destination),
            generation: 0,
            superseded_at: None,
        })
    }

    /// A death flow out of one compartment
    pub fn death(parameter: ParameterName, origin: CompartmentName) -> Self {
        Flow {
            kind: FlowKind::CompartmentDeath,
            parameter,
            origin,
            destination: None,
            generation: 0,
            superseded_at: None,
        }
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    pub fn parameter(&self) -> &ParameterName {
        &self.parameter
    }

    pub fn origin(&self) -> &CompartmentName {
        &self.origin
    }

    pub fn destination(&self) -> Option<&CompartmentName> {
        self.destination.as_ref()
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn superseded_at(&self) -> Option<usize> {
        self.superseded_at
    }

    /// Whether this record is the authoritative one at the given depth
    #[inline(always)]
    pub fn is_active(&self, depth: usize) -> bool {
        self.generation <= depth && self.superseded_at.map_or(true, |at| at > depth)
    }
}

/// Append-only arena of flow records across all stratification depths
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowRegistry {
    flows: Vec<Flow>,
    depth: usize,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stratification depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Open a new generation; subsequent additions are tagged with it
    pub(crate) fn begin_generation(&mut self) -> usize {
        self.depth += 1;
        self.depth
    }

    pub fn add_transition(&mut self, mut flow: Flow) -> Result<(), EpiError> {
        if flow.kind.category() != FlowCategory::Transition || flow.destination.is_none() {
            return Err(EpiError::MissingDestination {
                origin: flow.origin.to_string(),
            });
        }
        flow.generation = self.depth;
        flow.superseded_at = None;
        self.flows.push(flow);
        Ok(())
    }

    pub fn add_death(&mut self, mut flow: Flow) -> Result<(), EpiError> {
        if flow.kind.category() != FlowCategory::Death {
            return Err(EpiError::NotADeathFlow {
                origin: flow.origin.to_string(),
            });
        }
        flow.generation = self.depth;
        flow.superseded_at = None;
        self.flows.push(flow);
        Ok(())
    }

    /// Records of one category that are active at `depth`, in insertion order
    pub fn active_flows(
        &self,
        category: FlowCategory,
        depth: usize,
    ) -> impl Iterator<Item = &Flow> + Clone + '_ {
        self.flows
            .iter()
            .filter(move |flow| flow.kind.category() == category && flow.is_active(depth))
    }

    /// Positions of the currently active records of one category
    pub(crate) fn active_ids(&self, category: FlowCategory) -> Vec<usize> {
        self.flows
            .iter()
            .enumerate()
            .filter(|(_, flow)| flow.kind.category() == category && flow.is_active(self.depth))
            .map(|(id, _)| id)
            .collect()
    }

    pub(crate) fn get(&self, id: usize) -> Option<&Flow> {
        self.flows.get(id)
    }

    /// Mark a record as replaced at the current depth
    pub(crate) fn supersede(&mut self, id: usize) {
        let depth = self.depth;
        if let Some(flow) = self.flows.get_mut(id) {
            flow.superseded_at.get_or_insert(depth);
        }
    }

    /// Every record ever registered, superseded ones included
    pub fn all(&self) -> &[Flow] {
        &self.flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Serialize the full provenance of the registry
    pub fn to_json(&self) -> Result<String, EpiError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
