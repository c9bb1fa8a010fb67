use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EpiError;

/// Character separating a stem from each stratification layer in rendered names
pub const STRATUM_MARKER: char = 'X';

/// One stratification layer applied to a compartment or parameter, e.g. `age_5`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StratumTag {
    stratification: String,
    stratum: String,
}

impl StratumTag {
    pub fn new(stratification: impl Into<String>, stratum: impl Into<String>) -> Self {
        StratumTag {
            stratification: stratification.into(),
            stratum: stratum.into(),
        }
    }

    pub fn stratification(&self) -> &str {
        &self.stratification
    }

    pub fn stratum(&self) -> &str {
        &self.stratum
    }

    /// Parse the text following a marker, `<stratification>_<stratum>`
    pub(crate) fn parse_suffix(suffix: &str, full: &str) -> Result<Self, EpiError> {
        match suffix.split_once('_') {
            Some((stratification, stratum)) if !stratification.is_empty() && !stratum.is_empty() => {
                Ok(StratumTag::new(stratification, stratum))
            }
            _ => Err(EpiError::invalid_name(
                full,
                format!("layer '{}' is not of the form <stratification>_<stratum>", suffix),
            )),
        }
    }
}

impl fmt::Display for StratumTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}_{}", STRATUM_MARKER, self.stratification, self.stratum)
    }
}

/// Reject names that would make rendered identifiers ambiguous
pub(crate) fn check_name(name: &str, forbid_underscore: bool) -> Result<(), EpiError> {
    if name.is_empty() {
        return Err(EpiError::invalid_name(name, "names must not be empty"));
    }
    if name.contains(STRATUM_MARKER) {
        return Err(EpiError::invalid_name(
            name,
            format!("the character '{}' is reserved as the stratum marker", STRATUM_MARKER),
        ));
    }
    if forbid_underscore && name.contains('_') {
        return Err(EpiError::invalid_name(
            name,
            "stratification names must not contain '_'",
        ));
    }
    Ok(())
}

/// Structured compartment identifier: a stem plus its ordered stratification layers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompartmentName {
    stem: String,
    layers: Vec<StratumTag>,
}

impl CompartmentName {
    pub fn new(stem: impl Into<String>) -> Self {
        CompartmentName {
            stem: stem.into(),
            layers: Vec::new(),
        }
    }

    /// Parse a rendered identifier such as `infectiousXage_5Xrisk_high`
    pub fn parse(name: &str) -> Result<Self, EpiError> {
        let mut parts = name.split(STRATUM_MARKER);
        let stem = parts.next().unwrap_or_default();
        if stem.is_empty() {
            return Err(EpiError::invalid_name(name, "missing stem"));
        }
        let layers = parts
            .map(|suffix| StratumTag::parse_suffix(suffix, name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompartmentName {
            stem: stem.to_string(),
            layers,
        })
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn layers(&self) -> &[StratumTag] {
        &self.layers
    }

    pub fn is_stratified(&self) -> bool {
        !self.layers.is_empty()
    }

    /// The child identifier for one stratum of a new layer
    pub fn stratified(&self, tag: StratumTag) -> Self {
        let mut child = self.clone();
        child.layers.push(tag);
        child
    }

    /// The stratum this compartment belongs to for the given stratification, if any
    pub fn stratum_for(&self, stratification: &str) -> Option<&str> {
        self.layers
            .iter()
            .find(|tag| tag.stratification == stratification)
            .map(|tag| tag.stratum.as_str())
    }
}

impl fmt::Display for CompartmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stem)?;
        for tag in &self.layers {
            write!(f, "{}", tag)?;
        }
        Ok(())
    }
}

impl From<&str> for CompartmentName {
    fn from(stem: &str) -> Self {
        CompartmentName::new(stem)
    }
}

/// Ordered collection of compartments and their current values
///
/// The position of a compartment is its index in the state vector handed to
/// the integrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompartmentStore {
    names: Vec<CompartmentName>,
    values: Vec<f64>,
}

impl CompartmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a compartment
    pub fn add(&mut self, name: CompartmentName, value: f64) -> Result<(), EpiError> {
        if self.index_of(&name).is_some() {
            return Err(EpiError::DuplicateCompartment {
                name: name.to_string(),
            });
        }
        if value < 0.0 {
            return Err(EpiError::NegativeValue {
                name: name.to_string(),
                value,
            });
        }
        self.names.push(name);
        self.values.push(value);
        Ok(())
    }

    /// Remove a compartment, returning its value
    pub fn remove(&mut self, name: &CompartmentName) -> Option<f64> {
        let index = self.index_of(name)?;
        self.names.remove(index);
        Some(self.values.remove(index))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[CompartmentName] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn index_of(&self, name: &CompartmentName) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, name: &CompartmentName) -> Option<f64> {
        self.index_of(name).map(|i| self.values[i])
    }

    pub(crate) fn set(&mut self, name: &CompartmentName, value: f64) -> bool {
        match self.index_of(name) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CompartmentName, f64)> + '_ {
        self.names.iter().zip(self.values.iter().copied())
    }

    /// Sum of all compartments sharing a stem
    pub fn stem_total(&self, stem: &str) -> f64 {
        self.iter()
            .filter(|(name, _)| name.stem() == stem)
            .map(|(_, value)| value)
            .sum()
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_and_parse_roundtrip() {
        let name = CompartmentName::new("infectious")
            .stratified(StratumTag::new("age", "5"))
            .stratified(StratumTag::new("risk", "high"));
        assert_eq!(name.to_string(), "infectiousXage_5Xrisk_high");
        assert_eq!(CompartmentName::parse("infectiousXage_5Xrisk_high").unwrap(), name);
        assert_eq!(name.stem(), "infectious");
        assert_eq!(name.stratum_for("risk"), Some("high"));
        assert_eq!(name.stratum_for("hiv"), None);
    }

    #[test]
    fn test_parse_rejects_malformed_layer() {
        assert!(CompartmentName::parse("susceptibleXage").is_err());
        assert!(CompartmentName::parse("Xage_1").is_err());
    }

    #[test]
    fn test_store_add_remove_keeps_order() {
        let mut store = CompartmentStore::new();
        store.add("susceptible".into(), 0.9).unwrap();
        store.add("infectious".into(), 0.1).unwrap();
        store.add("recovered".into(), 0.0).unwrap();
        assert!(store.add("infectious".into(), 0.2).is_err());

        assert_eq!(store.remove(&"infectious".into()), Some(0.1));
        let names: Vec<String> = store.names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["susceptible", "recovered"]);
        assert_eq!(store.remove(&"infectious".into()), None);
    }

    #[test]
    fn test_stem_total_sums_strata() {
        let mut store = CompartmentStore::new();
        let stem = CompartmentName::new("susceptible");
        store.add(stem.stratified(StratumTag::new("risk", "low")), 0.3).unwrap();
        store.add(stem.stratified(StratumTag::new("risk", "high")), 0.6).unwrap();
        store.add("infectious".into(), 0.1).unwrap();
        assert!((store.stem_total("susceptible") - 0.9).abs() < 1e-12);
        assert!((store.total() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_values_rejected() {
        let mut store = CompartmentStore::new();
        assert!(matches!(
            store.add("susceptible".into(), -1.0),
            Err(EpiError::NegativeValue { .. })
        ));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("age", true).is_ok());
        assert!(check_name("Xpert", false).is_err());
        assert!(check_name("risk_group", true).is_err());
        assert!(check_name("risk_group", false).is_ok());
    }
}
