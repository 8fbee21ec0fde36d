//! Rayon-based parallel evaluation of many parameter points or data sets.
//!
//! The recursions are sequential in time, so parallelism is across
//! independent runs. Every element carries its own `Result`: one parameter
//! point with a non-positive-definite forecast error covariance does not
//! abort the batch.

use rayon::prelude::*;

use crate::error::Result;
use crate::initialization::Initialization;
use crate::kalman::{kalman_filter, FilterResult};
use crate::scalar::KalmanScalar;
use crate::smoother::{filter_and_smooth, SmootherResult};
use crate::state_space::{Observations, StateSpace};
use crate::types::FilterConfig;

/// Filter one data set under many representations in parallel.
///
/// `init_for` builds the initialization of each representation, so that
/// e.g. a stationary initialization follows the parameter point.
pub fn batch_filter<T, F>(
    models: &[StateSpace<T>],
    data: &Observations<T>,
    init_for: F,
    config: &FilterConfig,
) -> Vec<Result<FilterResult<T>>>
where
    T: KalmanScalar,
    F: Fn(&StateSpace<T>) -> Result<Initialization<T>> + Sync,
{
    models
        .par_iter()
        .map(|ss| {
            let init = init_for(ss)?;
            kalman_filter(ss, data, &init, config)
        })
        .collect()
}

/// Log-likelihood of one data set under many representations in parallel.
pub fn batch_loglike<T, F>(
    models: &[StateSpace<T>],
    data: &Observations<T>,
    init_for: F,
    config: &FilterConfig,
) -> Vec<Result<T>>
where
    T: KalmanScalar,
    F: Fn(&StateSpace<T>) -> Result<Initialization<T>> + Sync,
{
    batch_filter(models, data, init_for, config)
        .into_iter()
        .map(|res| res.map(|filter| filter.llf()))
        .collect()
}

/// Filter and smooth one data set under many representations in parallel.
pub fn batch_smooth<T, F>(
    models: &[StateSpace<T>],
    data: &Observations<T>,
    init_for: F,
    config: &FilterConfig,
) -> Vec<Result<SmootherResult<T>>>
where
    T: KalmanScalar,
    F: Fn(&StateSpace<T>) -> Result<Initialization<T>> + Sync,
{
    models
        .par_iter()
        .map(|ss| {
            let init = init_for(ss)?;
            filter_and_smooth(ss, data, &init, config)
        })
        .collect()
}

/// Log-likelihood of many data sets under one representation in parallel.
pub fn batch_loglike_series<T: KalmanScalar>(
    ss: &StateSpace<T>,
    series: &[Observations<T>],
    init: &Initialization<T>,
    config: &FilterConfig,
) -> Vec<Result<T>> {
    series
        .par_iter()
        .map(|data| kalman_filter(ss, data, init, config).map(|filter| filter.llf()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    fn ar1(phi: f64, nobs: usize) -> StateSpace<f64> {
        StateSpace::builder(1, 1, 1, nobs)
            .design(DMatrix::from_element(1, 1, 1.0))
            .obs_cov(DMatrix::from_element(1, 1, 0.1))
            .transition(DMatrix::from_element(1, 1, phi))
            .selection(DMatrix::from_element(1, 1, 1.0))
            .state_cov(DMatrix::from_element(1, 1, 1.0))
            .build()
            .unwrap()
    }

    fn get_ar1_data() -> Observations<f64> {
        Observations::from_rows(&[vec![0.3, -0.1, 0.8, 1.1, 0.4, -0.6, -0.2, 0.5]]).unwrap()
    }

    #[test]
    fn test_batch_loglike_matches_single() {
        let data = get_ar1_data();
        let models: Vec<_> = [0.2, 0.5, 0.9].iter().map(|&phi| ar1(phi, 8)).collect();
        let config = FilterConfig::default();
        let results = batch_loglike(&models, &data, Initialization::stationary, &config);

        assert_eq!(results.len(), 3);
        for (ss, res) in models.iter().zip(results) {
            let init = Initialization::stationary(ss).unwrap();
            let single = kalman_filter(ss, &data, &init, &config).unwrap().llf();
            assert!((res.unwrap() - single).abs() < 1e-15);
        }
    }

    #[test]
    fn test_batch_error_handling() {
        // a unit root has no stationary initialization
        let data = get_ar1_data();
        let models = vec![ar1(0.5, 8), ar1(1.0, 8)];
        let results = batch_filter(&models, &data, Initialization::stationary, &FilterConfig::default());
        assert!(results[0].is_ok(), "stationary point should succeed");
        assert!(results[1].is_err(), "unit root point should fail");
    }

    #[test]
    fn test_batch_smooth_matches_single() {
        let data = get_ar1_data();
        let models = vec![ar1(0.5, 8)];
        let init_for = |ss: &StateSpace<f64>| Ok(Initialization::diffuse(ss.k_states));
        let config = FilterConfig::default();
        let results = batch_smooth(&models, &data, init_for, &config);
        let single =
            filter_and_smooth(&models[0], &data, &Initialization::diffuse(1), &config).unwrap();
        let batched = results.into_iter().next().unwrap().unwrap();
        assert_eq!(batched.smoothed_state, single.smoothed_state);
    }

    #[test]
    fn test_batch_loglike_series() {
        let ss = ar1(0.5, 3);
        let init = Initialization::known(DVector::zeros(1), DMatrix::from_element(1, 1, 1.0)).unwrap();
        let series = vec![
            Observations::from_rows(&[vec![0.1, 0.2, 0.3]]).unwrap(),
            Observations::from_rows(&[vec![0.1, 0.2]]).unwrap(),
        ];
        let results = batch_loglike_series(&ss, &series, &init, &FilterConfig::default());
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_configuration());
    }

    #[test]
    fn test_batch_empty() {
        let models: Vec<StateSpace<f64>> = vec![];
        let results = batch_loglike(&models, &get_ar1_data(), Initialization::stationary, &FilterConfig::default());
        assert!(results.is_empty());
    }
}
