//! Simulation smoother (Durbin and Koopman, 2002).
//!
//! A draw from the joint distribution of states and disturbances given the
//! data is built in three stages:
//!   1. simulate `(alpha+, eps+, eta+, y+)` from the model with the supplied
//!      standard normal variates,
//!   2. filter and smooth `y+` (same missing pattern, same configuration),
//!   3. draw = smoothed(real) + simulated - smoothed(simulated).
//!
//! The smoother output on the real data does not depend on the variates, so
//! [`SimulationSmoother`] computes it once and reuses it for every draw.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, SsmError, Stage};
use crate::kalman::{kalman_filter, FilterResult};
use crate::scalar::{psd_sqrt, KalmanScalar};
use crate::smoother::{kalman_smoother, SmootherResult};
use crate::state_space::{Observations, StateSpace};
use crate::types::{DiffuseMethod, FilterTiming};

/// Standard normal inputs of one simulation draw.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationVariates<T: KalmanScalar> {
    /// One block per period: `k_endog` measurement variates followed by
    /// `k_posdef` state variates.
    pub disturbance: Vec<DVector<T>>,
    /// `k_states` variates for the initial state.
    pub initial_state: DVector<T>,
}

impl<T: KalmanScalar> SimulationVariates<T> {
    pub fn zeros(ss: &StateSpace<T>) -> Self {
        Self {
            disturbance: vec![DVector::zeros(ss.k_endog + ss.k_posdef); ss.nobs],
            initial_state: DVector::zeros(ss.k_states),
        }
    }

    /// Split a flat buffer of `(k_endog + k_posdef) * nobs` disturbance
    /// variates, period by period.
    pub fn from_slices(ss: &StateSpace<T>, disturbance: &[T], initial_state: &[T]) -> Result<Self> {
        let block = ss.k_endog + ss.k_posdef;
        if disturbance.len() != block * ss.nobs {
            return Err(SsmError::LengthMismatch {
                what: "disturbance variates",
                expected: block * ss.nobs,
                got: disturbance.len(),
            });
        }
        let variates = Self {
            disturbance: disturbance
                .chunks(block)
                .map(DVector::from_column_slice)
                .collect(),
            initial_state: DVector::from_column_slice(initial_state),
        };
        variates.validate(ss)?;
        Ok(variates)
    }

    /// Fresh standard normal variates from `rng`.
    pub fn draw<R: Rng + ?Sized>(ss: &StateSpace<T>, rng: &mut R) -> Self {
        let mut normal = || {
            let x: f64 = StandardNormal.sample(&mut *rng);
            nalgebra::convert::<f64, T>(x)
        };
        let block = ss.k_endog + ss.k_posdef;
        let disturbance = (0..ss.nobs)
            .map(|_| DVector::from_fn(block, |_, _| normal()))
            .collect();
        let initial_state = DVector::from_fn(ss.k_states, |_, _| normal());
        Self {
            disturbance,
            initial_state,
        }
    }

    fn validate(&self, ss: &StateSpace<T>) -> Result<()> {
        if self.disturbance.len() != ss.nobs {
            return Err(SsmError::LengthMismatch {
                what: "disturbance variate periods",
                expected: ss.nobs,
                got: self.disturbance.len(),
            });
        }
        let block = ss.k_endog + ss.k_posdef;
        if let Some(bad) = self.disturbance.iter().find(|v| v.len() != block) {
            return Err(SsmError::LengthMismatch {
                what: "disturbance variates per period",
                expected: block,
                got: bad.len(),
            });
        }
        if self.initial_state.len() != ss.k_states {
            return Err(SsmError::LengthMismatch {
                what: "initial state variates",
                expected: ss.k_states,
                got: self.initial_state.len(),
            });
        }
        Ok(())
    }
}

/// One conditional draw, plus the unconditional series it was built from.
#[derive(Debug, Clone)]
pub struct SimulationResult<T: KalmanScalar> {
    pub simulated_state: Vec<DVector<T>>,
    pub simulated_measurement_disturbance: Vec<DVector<T>>,
    pub simulated_state_disturbance: Vec<DVector<T>>,
    /// Unconditionally simulated observations `y+` (`k_endog x nobs`).
    pub generated_obs: DMatrix<T>,
    /// Unconditionally simulated states `alpha+`, `nobs + 1` entries.
    pub generated_state: Vec<DVector<T>>,
}

/// Simulation smoother with the real-data smoother output cached.
pub struct SimulationSmoother<'a, T: KalmanScalar> {
    ss: &'a StateSpace<T>,
    smoothed: SmootherResult<T>,
}

impl<'a, T: KalmanScalar> SimulationSmoother<'a, T> {
    /// Smooth the real data once.
    pub fn new(ss: &'a StateSpace<T>, filter: FilterResult<T>) -> Result<Self> {
        let smoothed = kalman_smoother(ss, filter)?;
        Ok(Self { ss, smoothed })
    }

    /// Reuse an existing smoother output.
    pub fn from_smoothed(ss: &'a StateSpace<T>, smoothed: SmootherResult<T>) -> Self {
        Self { ss, smoothed }
    }

    pub fn smoothed(&self) -> &SmootherResult<T> {
        &self.smoothed
    }

    /// One conditional draw from the given variates.
    pub fn simulate(&self, variates: &SimulationVariates<T>) -> Result<SimulationResult<T>> {
        variates.validate(self.ss)?;
        let ss = self.ss;
        let filter = &self.smoothed.filter;
        let generated = generate(ss, filter, variates);

        let data = Observations::new(generated.obs.clone(), filter.missing.clone())?;
        let fake = kalman_filter(ss, &data, &filter.initialization, &filter.config)
            .and_then(|f| kalman_smoother(ss, f))
            .map_err(|e| e.in_stage(Stage::SimulationSmoother))?;

        let real = &self.smoothed;
        let correct = |smoothed: &DVector<T>, simulated: &DVector<T>, refit: &DVector<T>| {
            smoothed + simulated - refit
        };

        let n = ss.nobs;
        let simulated_state = (0..n)
            .map(|t| {
                correct(
                    &real.smoothed_state[t],
                    &generated.state[t],
                    &fake.smoothed_state[t],
                )
            })
            .collect();
        let simulated_measurement_disturbance = (0..n)
            .map(|t| {
                correct(
                    &real.smoothed_measurement_disturbance[t],
                    &generated.measurement_disturbance[t],
                    &fake.smoothed_measurement_disturbance[t],
                )
            })
            .collect();
        let simulated_state_disturbance = (0..n)
            .map(|t| {
                correct(
                    &real.smoothed_state_disturbance[t],
                    &generated.state_disturbance[t],
                    &fake.smoothed_state_disturbance[t],
                )
            })
            .collect();

        Ok(SimulationResult {
            simulated_state,
            simulated_measurement_disturbance,
            simulated_state_disturbance,
            generated_obs: generated.obs,
            generated_state: generated.state,
        })
    }

    /// Independent draws in parallel, one per element of `variates`.
    pub fn simulate_many(
        &self,
        variates: &[SimulationVariates<T>],
    ) -> Vec<Result<SimulationResult<T>>> {
        debug!(draws = variates.len(), "running simulation smoother draws");
        variates.par_iter().map(|v| self.simulate(v)).collect()
    }
}

/// One conditional draw given the real-data filter output.
///
/// Smooths the real data on every call; use [`SimulationSmoother`] for
/// repeated draws.
pub fn simulate<T: KalmanScalar>(
    ss: &StateSpace<T>,
    filter: &FilterResult<T>,
    variates: &SimulationVariates<T>,
) -> Result<SimulationResult<T>> {
    SimulationSmoother::new(ss, filter.clone())?.simulate(variates)
}

struct Generated<T: KalmanScalar> {
    obs: DMatrix<T>,
    state: Vec<DVector<T>>,
    measurement_disturbance: Vec<DVector<T>>,
    state_disturbance: Vec<DVector<T>>,
}

/// Forward simulation of the model from standard normal variates.
fn generate<T: KalmanScalar>(
    ss: &StateSpace<T>,
    filter: &FilterResult<T>,
    variates: &SimulationVariates<T>,
) -> Generated<T> {
    let (n, p, r) = (ss.nobs, ss.k_endog, ss.k_posdef);
    let config = &filter.config;

    let start = match config.timing {
        FilterTiming::Predicted => filter.initialization.clone(),
        FilterTiming::Filtered => filter.initialization.predicted_through(ss),
    };
    // Exact diffuse directions are not drawn: they cancel in the correction.
    let cov0 = match config.diffuse {
        DiffuseMethod::Approximate => start.approximate_cov(config.kappa),
        DiffuseMethod::Exact => start.stationary_cov.clone(),
    };

    let mut alpha = &start.constant + psd_sqrt(&cov0) * &variates.initial_state;
    let mut obs = DMatrix::zeros(p, n);
    let mut state = Vec::with_capacity(n + 1);
    let mut measurement_disturbance = Vec::with_capacity(n);
    let mut state_disturbance = Vec::with_capacity(n);

    let invariant = ss.is_time_invariant();
    let mut obs_root = psd_sqrt(ss.obs_cov(0));
    let mut state_root = psd_sqrt(ss.state_cov(0));

    for t in 0..n {
        if !invariant && t > 0 {
            obs_root = psd_sqrt(ss.obs_cov(t));
            state_root = psd_sqrt(ss.state_cov(t));
        }
        let u = &variates.disturbance[t];
        let eps = &obs_root * u.rows(0, p);
        let eta = &state_root * u.rows(p, r);

        let y = ss.design(t) * &alpha + ss.obs_intercept(t) + &eps;
        obs.set_column(t, &y);

        let next = ss.transition(t) * &alpha + ss.state_intercept(t) + ss.selection(t) * &eta;
        state.push(std::mem::replace(&mut alpha, next));
        measurement_disturbance.push(eps);
        state_disturbance.push(eta);
    }
    state.push(alpha);

    Generated {
        obs,
        state,
        measurement_disturbance,
        state_disturbance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initialization::Initialization;
    use crate::types::FilterConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ar1(nobs: usize) -> StateSpace<f64> {
        StateSpace::builder(1, 1, 1, nobs)
            .design(DMatrix::from_element(1, 1, 1.0))
            .obs_cov(DMatrix::from_element(1, 1, 0.3))
            .transition(DMatrix::from_element(1, 1, 0.8))
            .selection(DMatrix::from_element(1, 1, 1.0))
            .state_cov(DMatrix::from_element(1, 1, 1.0))
            .build()
            .unwrap()
    }

    fn filtered(ss: &StateSpace<f64>) -> FilterResult<f64> {
        let data = Observations::from_rows(&[vec![0.5, f64::NAN, -0.3, 1.2, 0.1]]).unwrap();
        let init = Initialization::stationary(ss).unwrap();
        kalman_filter(ss, &data, &init, &FilterConfig::default()).unwrap()
    }

    #[test]
    fn test_zero_variates_reproduce_smoothed() {
        let ss = ar1(5);
        let sim = SimulationSmoother::new(&ss, filtered(&ss)).unwrap();
        let draw = sim.simulate(&SimulationVariates::zeros(&ss)).unwrap();
        let smoothed = sim.smoothed();
        for t in 0..5 {
            assert!((draw.simulated_state[t][0] - smoothed.smoothed_state[t][0]).abs() < 1e-12);
            assert!(
                (draw.simulated_measurement_disturbance[t][0]
                    - smoothed.smoothed_measurement_disturbance[t][0])
                    .abs()
                    < 1e-12
            );
            assert!(
                (draw.simulated_state_disturbance[t][0] - smoothed.smoothed_state_disturbance[t][0])
                    .abs()
                    < 1e-12
            );
        }
    }

    #[test]
    fn test_draw_is_consistent_with_model() {
        // every draw satisfies the observation and state equations exactly
        let ss = ar1(5);
        let sim = SimulationSmoother::new(&ss, filtered(&ss)).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let draw = sim.simulate(&SimulationVariates::draw(&ss, &mut rng)).unwrap();
        let y = [0.5, f64::NAN, -0.3, 1.2, 0.1];
        for t in 0..5 {
            if !y[t].is_nan() {
                let fit = draw.simulated_state[t][0] + draw.simulated_measurement_disturbance[t][0];
                assert!((fit - y[t]).abs() < 1e-10, "t={}", t);
            }
            if t + 1 < 5 {
                let next = 0.8 * draw.simulated_state[t][0] + draw.simulated_state_disturbance[t][0];
                assert!((next - draw.simulated_state[t + 1][0]).abs() < 1e-10, "t={}", t);
            }
        }
    }

    #[test]
    fn test_simulate_many_matches_sequential() {
        let ss = ar1(5);
        let sim = SimulationSmoother::new(&ss, filtered(&ss)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let variates: Vec<_> = (0..4).map(|_| SimulationVariates::draw(&ss, &mut rng)).collect();
        let parallel = sim.simulate_many(&variates);
        for (v, par) in variates.iter().zip(parallel) {
            let seq = sim.simulate(v).unwrap();
            let par = par.unwrap();
            for t in 0..5 {
                assert!((seq.simulated_state[t][0] - par.simulated_state[t][0]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_variate_lengths_checked() {
        let ss = ar1(5);
        assert!(SimulationVariates::from_slices(&ss, &[0.0; 9], &[0.0]).is_err());
        assert!(SimulationVariates::from_slices(&ss, &[0.0; 10], &[0.0, 0.0]).is_err());
        let ok = SimulationVariates::from_slices(&ss, &[0.0; 10], &[0.0]).unwrap();
        assert_eq!(ok, SimulationVariates::zeros(&ss));
    }

    #[test]
    fn test_generate_zero_variates_follow_means() {
        let ss = ar1(3);
        let filter = filtered_short(&ss);
        let generated = generate(&ss, &filter, &SimulationVariates::zeros(&ss));
        assert!(generated.state.iter().all(|s| s[0].abs() < 1e-15));
        assert!(generated.obs.iter().all(|y| y.abs() < 1e-15));
    }

    fn filtered_short(ss: &StateSpace<f64>) -> FilterResult<f64> {
        let data = Observations::from_rows(&[vec![0.5, -0.3, 1.2]]).unwrap();
        let init = Initialization::stationary(ss).unwrap();
        kalman_filter(ss, &data, &init, &FilterConfig::default()).unwrap()
    }
}
