mod rk4;

pub use rk4::Rk4;

use std::rc::Rc;

use diffsol::{
    error::{DiffsolError, OdeSolverError},
    NalgebraLU, OdeBuilder, OdeSolverMethod, OdeSolverStopReason,
};
use ndarray::Array2;

use crate::error::EpiError;
use crate::simulator::{
    at_equilibrium, check_inputs, fill_rows_from, Integrator, OdeSystem, Trajectory, M, T, V,
};

const RTOL: f64 = 1e-6;
const ATOL: f64 = 1e-9;
const H0: f64 = 1e-4;

/// Tolerances and initial step of the BDF integrator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverSettings {
    pub rtol: f64,
    pub atol: f64,
    pub h0: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            rtol: RTOL,
            atol: ATOL,
            h0: H0,
        }
    }
}

/// Variable-order BDF integration through `diffsol`
#[derive(Debug, Clone, Copy, Default)]
pub struct Bdf {
    settings: SolverSettings,
}

impl Bdf {
    pub fn new(settings: SolverSettings) -> Self {
        Bdf { settings }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }
}

impl Integrator for Bdf {
    fn integrate(
        &self,
        system: Rc<dyn OdeSystem>,
        y0: &V,
        times: &[f64],
        equilibrium_tolerance: Option<f64>,
    ) -> Result<Trajectory, EpiError> {
        check_inputs(system.as_ref(), y0, times)?;
        let nstates = system.nstates();
        let mut states = Array2::zeros((times.len(), nstates));
        fill_rows_from(&mut states, 0, y0);

        let rhs_system = system.clone();
        let jac_system = system.clone();
        let init = y0.clone();
        let problem = OdeBuilder::<M>::new()
            .atol(vec![self.settings.atol; nstates])
            .rtol(self.settings.rtol)
            .t0(times[0])
            .h0(self.settings.h0)
            .rhs_implicit(
                move |x: &V, _p: &V, t: T, y: &mut V| rhs_system.rhs(x, t, y),
                move |x: &V, _p: &V, t: T, v: &V, y: &mut V| jac_system.jac_mul(x, t, v, y),
            )
            .init(move |_p: &V, _t: T| init.clone())
            .build()?;
        let mut solver = problem.bdf::<NalgebraLU<f64>>()?;

        if let Some(tolerance) = equilibrium_tolerance {
            if at_equilibrium(system.as_ref(), y0, times[0], tolerance) {
                return Ok(Trajectory {
                    states,
                    equilibrium_time: Some(times[0]),
                });
            }
        }

        for (row, &time) in times.iter().enumerate().skip(1) {
            match solver.set_stop_time(time) {
                Ok(_) => loop {
                    match solver.step() {
                        Ok(OdeSolverStopReason::TstopReached) => break,
                        Ok(_) => continue,
                        Err(DiffsolError::OdeSolverError(
                            OdeSolverError::StepSizeTooSmall { .. },
                        )) => {
                            return Err(EpiError::StepSizeTooSmall { time });
                        }
                        Err(err) => return Err(err.into()),
                    }
                },
                // a repeated requested time
                Err(DiffsolError::OdeSolverError(OdeSolverError::StopTimeAtCurrentTime)) => {}
                Err(err) => return Err(err.into()),
            }

            let y = solver.state().y.clone();
            fill_rows_from(&mut states, row, &y);
            if let Some(tolerance) = equilibrium_tolerance {
                if at_equilibrium(system.as_ref(), &y, time, tolerance) {
                    return Ok(Trajectory {
                        states,
                        equilibrium_time: Some(time),
                    });
                }
            }
        }

        Ok(Trajectory {
            states,
            equilibrium_time: None,
        })
    }
}
