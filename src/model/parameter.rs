use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use crate::error::EpiError;
use crate::model::compartment::{StratumTag, STRATUM_MARKER};

/// Structured parameter identifier: a base name plus the layers at which it was adjusted
///
/// Each prefix of the layer list is a *component* of the parameter. Components
/// are registered independently during stratification and composed again by
/// [`ParameterStore::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterName {
    base: String,
    layers: Vec<StratumTag>,
}

impl ParameterName {
    pub fn new(base: impl Into<String>) -> Self {
        ParameterName {
            base: base.into(),
            layers: Vec::new(),
        }
    }

    /// Parse a rendered name such as `recoveryXrisk_high`
    pub fn parse(name: &str) -> Result<Self, EpiError> {
        let mut parts = name.split(STRATUM_MARKER);
        let base = parts.next().unwrap_or_default();
        if base.is_empty() {
            return Err(EpiError::invalid_name(name, "missing base parameter name"));
        }
        let layers = parts
            .map(|suffix| StratumTag::parse_suffix(suffix, name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ParameterName {
            base: base.to_string(),
            layers,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn layers(&self) -> &[StratumTag] {
        &self.layers
    }

    pub fn with_layers(base: impl Into<String>, layers: &[StratumTag]) -> Self {
        ParameterName {
            base: base.into(),
            layers: layers.to_vec(),
        }
    }

    pub fn stratified(&self, tag: StratumTag) -> Self {
        let mut child = self.clone();
        child.layers.push(tag);
        child
    }

    /// Components from the base (outermost) to the full name (deepest)
    pub fn components(&self) -> impl Iterator<Item = ParameterName> + '_ {
        (0..=self.layers.len()).map(move |depth| ParameterName {
            base: self.base.clone(),
            layers: self.layers[..depth].to_vec(),
        })
    }
}

impl fmt::Display for ParameterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        for tag in &self.layers {
            write!(f, "{}", tag)?;
        }
        Ok(())
    }
}

impl From<&str> for ParameterName {
    fn from(base: &str) -> Self {
        ParameterName::new(base)
    }
}

/// An externally supplied function of time
#[derive(Clone)]
pub struct TimeVariant(Arc<dyn Fn(f64) -> f64 + Send + Sync>);

impl TimeVariant {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        TimeVariant(Arc::new(func))
    }

    /// Piecewise-linear interpolation through `(time, value)` points
    ///
    /// Values are carried forward (or backward) outside the observed range.
    pub fn interpolated(mut points: Vec<(f64, f64)>) -> Result<Self, EpiError> {
        if points.is_empty() {
            return Err(EpiError::InvalidInterpolation {
                reason: "at least one point is required".to_string(),
            });
        }
        if points.iter().any(|(t, v)| !t.is_finite() || !v.is_finite()) {
            return Err(EpiError::InvalidInterpolation {
                reason: "points must be finite".to_string(),
            });
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        points.dedup_by(|later, earlier| later.0 == earlier.0);

        Ok(TimeVariant::new(move |time| {
            let first = points[0];
            let last = points[points.len() - 1];
            if time <= first.0 {
                return first.1;
            }
            if time >= last.0 {
                return last.1;
            }
            // partition_point gives the first point strictly after `time`
            let upper = points.partition_point(|(t, _)| *t <= time);
            let (t0, v0) = points[upper - 1];
            let (t1, v1) = points[upper];
            v0 + (v1 - v0) * (time - t0) / (t1 - t0)
        }))
    }

    #[inline(always)]
    pub fn evaluate(&self, time: f64) -> f64 {
        (self.0)(time)
    }
}

impl fmt::Debug for TimeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimeVariant(<fn>)")
    }
}

/// A parameter decomposed and composed once, ready for repeated evaluation
#[derive(Debug, Clone)]
pub struct ResolvedParameter {
    constant: f64,
    time_variants: Vec<TimeVariant>,
}

impl ResolvedParameter {
    pub fn constant(value: f64) -> Self {
        ResolvedParameter {
            constant: value,
            time_variants: Vec::new(),
        }
    }

    /// Adjusted value at `time`: product of constants times product of time variants
    #[inline(always)]
    pub fn value(&self, time: f64) -> f64 {
        self.time_variants
            .iter()
            .fold(self.constant, |acc, tv| acc * tv.evaluate(time))
    }

    pub fn is_time_variant(&self) -> bool {
        !self.time_variants.is_empty()
    }
}

/// Registry of constant and time-variant parameter components
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    constants: HashMap<ParameterName, f64>,
    time_variants: HashMap<ParameterName, TimeVariant>,
    overwrites: HashSet<ParameterName>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_constant(&mut self, name: ParameterName, value: f64) {
        self.constants.insert(name, value);
    }

    pub fn set_time_variant(&mut self, name: ParameterName, function: TimeVariant) {
        self.time_variants.insert(name, function);
    }

    /// Flag a component so that every shallower component is ignored on resolution
    pub fn mark_overwrite(&mut self, name: ParameterName) {
        self.overwrites.insert(name);
    }

    pub fn constant_value(&self, name: &ParameterName) -> Option<f64> {
        self.constants.get(name).copied()
    }

    pub fn is_overwrite(&self, name: &ParameterName) -> bool {
        self.overwrites.contains(name)
    }

    /// Whether this exact component is registered, as a constant or as a time variant
    pub fn is_declared(&self, name: &ParameterName) -> bool {
        self.constants.contains_key(name) || self.time_variants.contains_key(name)
    }

    /// Whether any component with this base name is registered
    pub fn has_base(&self, base: &str) -> bool {
        self.constants.keys().any(|name| name.base == base)
            || self.time_variants.keys().any(|name| name.base == base)
    }

    /// Compose a parameter, or `None` when no component of it is registered
    pub fn resolve_optional(&self, name: &ParameterName) -> Option<ResolvedParameter> {
        let components: Vec<ParameterName> = name.components().collect();
        let start = components
            .iter()
            .rposition(|component| self.overwrites.contains(component))
            .unwrap_or(0);

        let mut resolved = ResolvedParameter::constant(1.0);
        let mut found = false;
        for component in &components[start..] {
            if let Some(function) = self.time_variants.get(component) {
                resolved.time_variants.push(function.clone());
                found = true;
            } else if let Some(value) = self.constants.get(component) {
                resolved.constant *= value;
                found = true;
            }
        }
        found.then_some(resolved)
    }

    /// Compose a parameter that must exist
    pub fn resolve(&self, name: &ParameterName) -> Result<ResolvedParameter, EpiError> {
        self.resolve_optional(name)
            .ok_or_else(|| EpiError::unknown_parameter(name.to_string(), "parameter resolution"))
    }
}
