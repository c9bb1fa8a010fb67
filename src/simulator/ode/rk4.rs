use std::rc::Rc;

use ndarray::Array2;

use crate::error::EpiError;
use crate::simulator::{
    at_equilibrium, check_inputs, fill_rows_from, Integrator, OdeSystem, Trajectory, T, V,
};

/// Classical fourth-order Runge-Kutta with a fixed maximum step
///
/// Each interval between requested times is split into equal steps no longer
/// than `max_step`.
#[derive(Debug, Clone, Copy)]
pub struct Rk4 {
    max_step: f64,
}

impl Rk4 {
    pub fn new(max_step: f64) -> Result<Self, EpiError> {
        if !max_step.is_finite() || max_step <= 0.0 {
            return Err(EpiError::InvalidStepSize { step: max_step });
        }
        Ok(Rk4 { max_step })
    }

    fn step(
        &self,
        system: &dyn OdeSystem,
        t: T,
        h: T,
        y: &mut V,
        k: &mut [V; 4],
        scratch: &mut V,
    ) {
        system.rhs(y, t, &mut k[0]);

        scratch.copy_from(&*y);
        scratch.axpy(h / 2.0, &k[0], 1.0);
        system.rhs(scratch, t + h / 2.0, &mut k[1]);

        scratch.copy_from(&*y);
        scratch.axpy(h / 2.0, &k[1], 1.0);
        system.rhs(scratch, t + h / 2.0, &mut k[2]);

        scratch.copy_from(&*y);
        scratch.axpy(h, &k[2], 1.0);
        system.rhs(scratch, t + h, &mut k[3]);

        for i in 0..y.len() {
            y[i] += h / 6.0 * (k[0][i] + 2.0 * k[1][i] + 2.0 * k[2][i] + k[3][i]);
        }
    }
}

impl Integrator for Rk4 {
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

        let mut y = y0.clone();
        let mut scratch = V::zeros(nstates);
        let mut k = [
            V::zeros(nstates),
            V::zeros(nstates),
            V::zeros(nstates),
            V::zeros(nstates),
        ];

        if let Some(tolerance) = equilibrium_tolerance {
            if at_equilibrium(system.as_ref(), &y, times[0], tolerance) {
                return Ok(Trajectory {
                    states,
                    equilibrium_time: Some(times[0]),
                });
            }
        }

        for row in 1..times.len() {
            let (start, end) = (times[row - 1], times[row]);
            let steps = ((end - start) / self.max_step).ceil() as usize;
            if steps > 0 {
                let h = (end - start) / steps as f64;
                for i in 0..steps {
                    let t = start + i as f64 * h;
                    self.step(system.as_ref(), t, h, &mut y, &mut k, &mut scratch);
                }
            }

            fill_rows_from(&mut states, row, &y);
            if let Some(tolerance) = equilibrium_tolerance {
                if at_equilibrium(system.as_ref(), &y, end, tolerance) {
                    return Ok(Trajectory {
                        states,
                        equilibrium_time: Some(end),
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Harmonic oscillator `x'' = -x`
    struct Oscillator;

    impl OdeSystem for Oscillator {
        fn nstates(&self) -> usize {
            2
        }

        fn rhs(&self, x: &V, _t: T, dx: &mut V) {
            dx[0] = x[1];
            dx[1] = -x[0];
        }

        fn rhs_untracked(&self, x: &V, t: T, dx: &mut V) {
            self.rhs(x, t, dx);
        }

        fn jac_mul(&self, _x: &V, _t: T, v: &V, y: &mut V) {
            y[0] = v[1];
            y[1] = -v[0];
        }
    }

    #[test]
    fn test_rk4_oscillator() {
        let times = [0.0, 1.0, std::f64::consts::PI];
        let trajectory = Rk4::new(1e-3)
            .unwrap()
            .integrate(Rc::new(Oscillator), &V::from_vec(vec![1.0, 0.0]), &times, None)
            .unwrap();
        assert_relative_eq!(trajectory.states[[1, 0]], 1f64.cos(), epsilon = 1e-9);
        assert_relative_eq!(trajectory.states[[2, 0]], -1.0, epsilon = 1e-9);
        assert_relative_eq!(trajectory.states[[2, 1]], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rk4_rejects_non_positive_step() {
        assert!(matches!(
            Rk4::new(0.0),
            Err(EpiError::InvalidStepSize { step }) if step == 0.0
        ));
        assert!(matches!(Rk4::new(f64::NAN), Err(EpiError::InvalidStepSize { .. })));
        assert!(matches!(Rk4::new(f64::INFINITY), Err(EpiError::InvalidStepSize { .. })));
    }
}
