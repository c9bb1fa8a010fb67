use serde::Serialize;

/// Population-level quantities recomputed at the start of every evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TrackedQuantities {
    /// Sum over infectious compartments, weighted by relative infectiousness
    pub infectious_population: f64,
    pub total_population: f64,
    /// Deaths accumulated during the evaluation, when tracked
    pub total_deaths: Option<f64>,
}

/// A named series of summed transition rates
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedOutput {
    name: String,
    times: Vec<f64>,
    values: Vec<f64>,
}

impl DerivedOutput {
    pub fn new(name: &str) -> Self {
        DerivedOutput {
            name: name.to_string(),
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    pub(crate) fn from_points(name: &str, times: Vec<f64>, values: Vec<f64>) -> Self {
        DerivedOutput {
            name: name.to_string(),
            times,
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    fn push(&mut self, time: f64, value: f64) {
        self.times.push(time);
        self.values.push(value);
    }
}

/// Side-effect state of the tracked right-hand side
///
/// One point is appended to every derived output per evaluation, so the
/// series are sampled wherever the integrator chose to evaluate.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    quantities: TrackedQuantities,
    accumulators: Vec<f64>,
    outputs: Vec<DerivedOutput>,
    evaluations: usize,
}

impl Tracker {
    pub fn new<S: AsRef<str>>(output_names: &[S]) -> Self {
        Tracker {
            quantities: TrackedQuantities::default(),
            accumulators: vec![0.0; output_names.len()],
            outputs: output_names
                .iter()
                .map(|name| DerivedOutput::new(name.as_ref()))
                .collect(),
            evaluations: 0,
        }
    }

    /// Quantities from the most recent evaluation
    pub fn quantities(&self) -> TrackedQuantities {
        self.quantities
    }

    pub fn outputs(&self) -> &[DerivedOutput] {
        &self.outputs
    }

    pub fn into_outputs(self) -> Vec<DerivedOutput> {
        self.outputs
    }

    /// Number of tracked evaluations so far
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub(crate) fn begin(&mut self, quantities: TrackedQuantities) {
        self.quantities = quantities;
        self.evaluations += 1;
    }

    #[inline(always)]
    pub(crate) fn accumulate(&mut self, output: usize, value: f64) {
        self.accumulators[output] += value;
    }

    /// Append the accumulated values at `time` and reset the accumulators
    pub(crate) fn record(&mut self, time: f64) {
        for (output, accumulated) in self.outputs.iter_mut().zip(self.accumulators.iter_mut()) {
            output.push(time, *accumulated);
            *accumulated = 0.0;
        }
    }

    pub(crate) fn set_total_deaths(&mut self, deaths: f64) {
        self.quantities.total_deaths = Some(deaths);
    }
}
