pub mod ode;
pub mod rhs;
pub mod tracker;

use std::{cell::RefCell, rc::Rc};

use ndarray::{Array1, Array2, Axis};

use crate::error::EpiError;
use crate::model::compartment::CompartmentName;
use crate::model::flow::FlowRegistry;
use crate::model::StratifiedModel;
use ode::Bdf;
use rhs::ModelRhs;
use tracker::{DerivedOutput, TrackedQuantities, Tracker};

pub(crate) type T = f64;
pub(crate) type V = nalgebra::DVector<T>;
pub(crate) type M = nalgebra::DMatrix<T>;

/// A system of ordinary differential equations as seen by an [`Integrator`]
///
/// `rhs` may record side effects; `rhs_untracked` and `jac_mul` must not.
pub trait OdeSystem {
    fn nstates(&self) -> usize;

    fn rhs(&self, x: &V, t: T, dx: &mut V);

    fn rhs_untracked(&self, x: &V, t: T, dx: &mut V);

    /// Jacobian-vector product `J(x) v`
    fn jac_mul(&self, x: &V, t: T, v: &V, y: &mut V);
}

/// A compiled model together with its derived-output tracker
pub struct TrackedSystem {
    rhs: ModelRhs,
    tracker: RefCell<Tracker>,
}

impl TrackedSystem {
    pub fn new(rhs: ModelRhs) -> Self {
        let tracker = RefCell::new(rhs.tracker());
        TrackedSystem { rhs, tracker }
    }

    pub fn model_rhs(&self) -> &ModelRhs {
        &self.rhs
    }

    /// Quantities from the most recent tracked evaluation
    pub fn quantities(&self) -> TrackedQuantities {
        self.tracker.borrow().quantities()
    }

    pub fn take_outputs(&self) -> Vec<DerivedOutput> {
        self.tracker.replace(self.rhs.tracker()).into_outputs()
    }
}

impl OdeSystem for TrackedSystem {
    fn nstates(&self) -> usize {
        self.rhs.nstates()
    }

    fn rhs(&self, x: &V, t: T, dx: &mut V) {
        self.rhs.rhs(x, t, dx, &mut self.tracker.borrow_mut());
    }

    fn rhs_untracked(&self, x: &V, t: T, dx: &mut V) {
        self.rhs.rhs_untracked(x, t, dx);
    }

    fn jac_mul(&self, x: &V, t: T, v: &V, y: &mut V) {
        self.rhs.jac_mul(x, t, v, y);
    }
}

/// States at each requested time
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// One row per requested time, one column per state
    pub states: Array2<f64>,
    /// Requested time at which equilibrium stopped the integration
    pub equilibrium_time: Option<f64>,
}

/// An ODE integration service
pub trait Integrator {
    /// Integrate from `y0` at `times[0]`, returning one row per requested time
    ///
    /// With an `equilibrium_tolerance`, integration stops at the first
    /// requested time where every rate of change is below the tolerance, and
    /// the remaining rows repeat that state.
    fn integrate(
        &self,
        system: Rc<dyn OdeSystem>,
        y0: &V,
        times: &[f64],
        equilibrium_tolerance: Option<f64>,
    ) -> Result<Trajectory, EpiError>;
}

/// Whether every rate of change at `(y, t)` is below `tolerance` in magnitude
pub(crate) fn at_equilibrium(system: &dyn OdeSystem, y: &V, t: T, tolerance: f64) -> bool {
    let mut dy = V::zeros(system.nstates());
    system.rhs_untracked(y, t, &mut dy);
    dy.amax() < tolerance
}

/// Shared preamble of the integrators
pub(crate) fn check_inputs(
    system: &dyn OdeSystem,
    y0: &V,
    times: &[f64],
) -> Result<(), EpiError> {
    if times.is_empty() {
        return Err(EpiError::EmptyTimes);
    }
    if y0.len() != system.nstates() {
        return Err(EpiError::DimensionMismatch {
            expected: system.nstates(),
            actual: y0.len(),
        });
    }
    Ok(())
}

/// Write `state` into `row` and every row after it
pub(crate) fn fill_rows_from(states: &mut Array2<f64>, row: usize, state: &V) {
    for mut out in states.axis_iter_mut(Axis(0)).skip(row) {
        for (j, value) in state.iter().enumerate() {
            out[j] = *value;
        }
    }
}

/// Everything produced by one integration of a model
#[derive(Debug, Clone)]
pub struct ModelResults {
    times: Vec<f64>,
    compartments: Vec<CompartmentName>,
    outputs: Array2<f64>,
    derived_outputs: Vec<DerivedOutput>,
    requested_derived_outputs: Vec<DerivedOutput>,
    flows: FlowRegistry,
    equilibrium_time: Option<f64>,
}

impl ModelResults {
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn compartment_names(&self) -> Vec<String> {
        self.compartments.iter().map(|c| c.to_string()).collect()
    }

    pub fn compartments(&self) -> &[CompartmentName] {
        &self.compartments
    }

    /// Compartment values, one row per requested time in compartment order
    pub fn outputs(&self) -> &Array2<f64> {
        &self.outputs
    }

    /// Trajectory of one compartment by rendered name
    pub fn compartment_trajectory(&self, name: &str) -> Option<Array1<f64>> {
        let name = CompartmentName::parse(name).ok()?;
        let index = self.compartments.iter().position(|c| *c == name)?;
        Some(self.outputs.column(index).to_owned())
    }

    /// Trajectory summed over every compartment sharing a stem
    pub fn stem_total(&self, stem: &str) -> Array1<f64> {
        let mut total = Array1::zeros(self.times.len());
        for (index, compartment) in self.compartments.iter().enumerate() {
            if compartment.stem() == stem {
                total += &self.outputs.column(index);
            }
        }
        total
    }

    /// Population summed over all compartments at each requested time
    pub fn total_population(&self) -> Array1<f64> {
        self.outputs.sum_axis(Axis(1))
    }

    /// Derived outputs sampled at every tracked evaluation of the integrator
    pub fn derived_outputs(&self) -> &[DerivedOutput] {
        &self.derived_outputs
    }

    /// Derived outputs re-evaluated on the trajectory at the requested times
    pub fn requested_derived_outputs(&self) -> &[DerivedOutput] {
        &self.requested_derived_outputs
    }

    pub fn derived_output(&self, name: &str) -> Option<&DerivedOutput> {
        self.requested_derived_outputs
            .iter()
            .find(|output| output.name() == name)
    }

    /// Every flow record of the model, superseded generations included
    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    pub fn equilibrium_time(&self) -> Option<f64> {
        self.equilibrium_time
    }
}

impl StratifiedModel {
    /// Integrate the model with the default BDF integrator
    pub fn run(&self) -> Result<ModelResults, EpiError> {
        self.run_with(&Bdf::default())
    }

    pub fn run_with<I: Integrator + ?Sized>(
        &self,
        integrator: &I,
    ) -> Result<ModelResults, EpiError> {
        let rhs = ModelRhs::new(self)?;
        let system = Rc::new(TrackedSystem::new(rhs));
        let y0 = V::from_column_slice(self.compartments().values());

        let trajectory = integrator.integrate(
            system.clone(),
            &y0,
            self.times(),
            self.equilibrium_stopping_tolerance(),
        )?;
        if let Some(time) = trajectory.equilibrium_time {
            tracing::info!("equilibrium reached at time {}", time);
        }

        let model_rhs = system.model_rhs();
        let mut requested: Vec<Vec<f64>> = vec![Vec::new(); model_rhs.output_names().len()];
        for (row, &time) in trajectory.states.axis_iter(Axis(0)).zip(self.times()) {
            let state = V::from_iterator(row.len(), row.iter().copied());
            for (series, value) in requested.iter_mut().zip(model_rhs.output_values(&state, time)) {
                series.push(value);
            }
        }
        let requested_derived_outputs = model_rhs
            .output_names()
            .iter()
            .zip(requested)
            .map(|(name, values)| DerivedOutput::from_points(name, self.times().to_vec(), values))
            .collect();

        Ok(ModelResults {
            times: self.times().to_vec(),
            compartments: self.compartments().names().to_vec(),
            outputs: trajectory.states,
            derived_outputs: system.take_outputs(),
            requested_derived_outputs,
            flows: self.flows().clone(),
            equilibrium_time: trajectory.equilibrium_time,
        })
    }
}
