//! Cross-checks between filtering modes, timings, scalar types and
//! initializations on a multivariate unobserved-components model.

use nalgebra::{Complex, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use ssm_rs::scalar::solve_discrete_lyapunov;
use ssm_rs::{
    filter_and_smooth, kalman_filter, DiffuseMethod, FilterConfig, FilterMethod, FilterTiming,
    Initialization, Observations, SimulationSmoother, SimulationVariates, SmootherResult,
    StateSpace,
};

const NOBS: usize = 40;

/// Trend with stochastic slope plus an AR(2) cycle, observed through a
/// noisy output series and a second series loading on the cycle only.
///
/// States: [level, slope, cycle, cycle_{t-1}]
fn uc_model(obs_cov: DMatrix<f64>) -> StateSpace<f64> {
    let design = DMatrix::from_row_slice(2, 4, &[1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.5, 0.0]);
    let transition = DMatrix::from_row_slice(
        4,
        4,
        &[
            1.0, 1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.5, -0.6, //
            0.0, 0.0, 1.0, 0.0,
        ],
    );
    let selection = DMatrix::from_row_slice(
        4,
        3,
        &[
            1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0, //
            0.0, 0.0, 0.0,
        ],
    );
    StateSpace::builder(2, 4, 3, NOBS)
        .design(design)
        .obs_intercept(DVector::from_vec(vec![0.0, 0.2]))
        .obs_cov(obs_cov)
        .transition(transition)
        .selection(selection)
        .state_cov(DMatrix::from_diagonal(&DVector::from_vec(vec![0.3, 0.01, 0.5])))
        .build()
        .unwrap()
}

fn correlated_obs_cov() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[0.4, 0.1, 0.1, 0.3])
}

fn diagonal_obs_cov() -> DMatrix<f64> {
    DMatrix::from_diagonal(&DVector::from_vec(vec![0.4, 0.3]))
}

/// Diffuse level and slope, stationary cycle.
fn uc_init() -> Initialization<f64> {
    let phi = DMatrix::from_row_slice(2, 2, &[1.5, -0.6, 1.0, 0.0]);
    let q = DMatrix::from_row_slice(2, 2, &[0.5, 0.0, 0.0, 0.0]);
    let cycle = solve_discrete_lyapunov(&phi, &q).unwrap();
    let mut stationary = DMatrix::zeros(4, 4);
    stationary.view_mut((2, 2), (2, 2)).copy_from(&cycle);
    let diffuse = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 1.0, 0.0, 0.0]));
    Initialization::mixed(DVector::zeros(4), stationary, diffuse).unwrap()
}

/// Simulated from the model; the second series loses t = 3..6, both are
/// missing at t = 10, the first is missing at t = 20.
fn uc_data(seed: u64) -> Observations<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut normal = || -> f64 { StandardNormal.sample(&mut rng) };
    let (mut level, mut slope, mut c1, mut c2) = (10.0, 0.1, 0.0, 0.0);
    let mut values = DMatrix::zeros(2, NOBS);
    for t in 0..NOBS {
        values[(0, t)] = level + c1 + 0.6 * normal();
        values[(1, t)] = 0.2 + 0.5 * c1 + 0.5 * normal();
        let next = 1.5 * c1 - 0.6 * c2 + 0.7 * normal();
        c2 = c1;
        c1 = next;
        level += slope + 0.5 * normal();
        slope += 0.1 * normal();
    }
    for t in 3..6 {
        values[(1, t)] = f64::NAN;
    }
    values[(0, 10)] = f64::NAN;
    values[(1, 10)] = f64::NAN;
    values[(0, 20)] = f64::NAN;
    Observations::from_nan(values)
}

fn close(a: f64, b: f64, digits: i32) -> bool {
    (a - b).abs() <= 10f64.powi(-digits) * b.abs().max(1.0)
}

fn assert_vectors_close(a: &[DVector<f64>], b: &[DVector<f64>], digits: i32, what: &str) {
    assert_eq!(a.len(), b.len(), "{} length", what);
    for (t, (x, y)) in a.iter().zip(b).enumerate() {
        for i in 0..x.len() {
            assert!(close(x[i], y[i], digits), "{}[{}][{}]: {} vs {}", what, t, i, x[i], y[i]);
        }
    }
}

fn assert_matrices_close(a: &[DMatrix<f64>], b: &[DMatrix<f64>], digits: i32, what: &str) {
    assert_eq!(a.len(), b.len(), "{} length", what);
    for (t, (x, y)) in a.iter().zip(b).enumerate() {
        assert_eq!(x.shape(), y.shape(), "{}[{}] shape", what, t);
        for i in 0..x.nrows() {
            for j in 0..x.ncols() {
                assert!(close(x[(i, j)], y[(i, j)], digits), "{}[{}][({}, {})]: {} vs {}", what, t, i, j, x[(i, j)], y[(i, j)]);
            }
        }
    }
}

fn smooth(ss: &StateSpace<f64>, data: &Observations<f64>, config: &FilterConfig) -> SmootherResult<f64> {
    filter_and_smooth(ss, data, &uc_init(), config).unwrap()
}

fn reconcile(conv: &SmootherResult<f64>, uni: &SmootherResult<f64>) {
    assert_eq!(conv.filter.nobs_diffuse, uni.filter.nobs_diffuse);
    assert_vectors_close(&conv.filter.predicted_state, &uni.filter.predicted_state, 8, "predicted_state");
    assert_vectors_close(&conv.filter.filtered_state, &uni.filter.filtered_state, 8, "filtered_state");
    for t in 0..NOBS {
        assert!(
            close(conv.filter.llf_obs[t], uni.filter.llf_obs[t], 8),
            "llf_obs[{}]: {} vs {}",
            t,
            conv.filter.llf_obs[t],
            uni.filter.llf_obs[t]
        );
    }
    assert_vectors_close(&conv.smoothed_state, &uni.smoothed_state, 8, "smoothed_state");
    for t in 0..NOBS {
        let diff = &conv.smoothed_state_disturbance[t] - &uni.smoothed_state_disturbance[t];
        assert!(diff.amax() < 1e-7, "smoothed_state_disturbance[{}]", t);
    }
    assert_vectors_close(
        &conv.smoothed_measurement_disturbance,
        &uni.smoothed_measurement_disturbance,
        8,
        "smoothed_measurement_disturbance",
    );
    assert_matrices_close(&conv.smoothed_state_cov, &uni.smoothed_state_cov, 8, "smoothed_state_cov");
    assert_matrices_close(
        &conv.smoothed_state_disturbance_cov,
        &uni.smoothed_state_disturbance_cov,
        8,
        "smoothed_state_disturbance_cov",
    );
    assert_matrices_close(
        &conv.scaled_smoothed_estimator_cov,
        &uni.scaled_smoothed_estimator_cov,
        8,
        "scaled_smoothed_estimator_cov",
    );
}

/// Both modes fed the same variates must give the same conditional draw.
fn reconcile_draws(ss: &StateSpace<f64>, data: &Observations<f64>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let variates: Vec<SimulationVariates<f64>> =
        (0..3).map(|_| SimulationVariates::draw(ss, &mut rng)).collect();

    let conv_filter = kalman_filter(ss, data, &uc_init(), &FilterConfig::default()).unwrap();
    let uni_filter = kalman_filter(ss, data, &uc_init(), &FilterConfig::univariate()).unwrap();
    let conv = SimulationSmoother::new(ss, conv_filter).unwrap();
    let uni = SimulationSmoother::new(ss, uni_filter).unwrap();

    for v in &variates {
        let a = conv.simulate(v).unwrap();
        let b = uni.simulate(v).unwrap();
        assert_eq!(a.generated_obs, b.generated_obs);
        assert_vectors_close(&a.simulated_state, &b.simulated_state, 8, "simulated_state");
        assert_vectors_close(
            &a.simulated_state_disturbance,
            &b.simulated_state_disturbance,
            8,
            "simulated_state_disturbance",
        );
        assert_vectors_close(
            &a.simulated_measurement_disturbance,
            &b.simulated_measurement_disturbance,
            8,
            "simulated_measurement_disturbance",
        );
    }
}

#[test]
fn test_conventional_univariate_reconcile_correlated() {
    let ss = uc_model(correlated_obs_cov());
    let data = uc_data(7);
    let conv = smooth(&ss, &data, &FilterConfig::default());
    let uni = smooth(&ss, &data, &FilterConfig::univariate());
    assert!(conv.filter.nobs_diffuse >= 2);
    reconcile(&conv, &uni);
    reconcile_draws(&ss, &data, 17);
}

#[test]
fn test_conventional_univariate_reconcile_diagonal() {
    let ss = uc_model(diagonal_obs_cov());
    let data = uc_data(11);
    let conv = smooth(&ss, &data, &FilterConfig::default());
    let uni = smooth(&ss, &data, &FilterConfig::univariate());
    reconcile(&conv, &uni);
    reconcile_draws(&ss, &data, 19);

    // with a diagonal observation covariance the sequential smoother gets
    // the marginal variances right; only cross terms are dropped
    for t in 0..NOBS {
        for i in 0..2 {
            let a = conv.smoothed_measurement_disturbance_cov[t][(i, i)];
            let b = uni.smoothed_measurement_disturbance_cov[t][(i, i)];
            assert!(close(a, b, 8), "measurement disturbance var[{}][{}]: {} vs {}", t, i, a, b);
        }
    }
}

#[test]
fn test_filtered_timing_matches_predicted_timing() {
    let ss = uc_model(correlated_obs_cov());
    let data = uc_data(3);

    // a known initialization for the pre-sample period...
    let a0 = DVector::from_vec(vec![9.5, 0.1, 0.2, -0.1]);
    let p0 = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 0.5, 1.0, 1.0]));
    let filtered_init = Initialization::known(a0.clone(), p0.clone()).unwrap();

    // ...and the same distribution moved one step forward by hand
    let t0 = ss.transition(0);
    let rqr = ss.selection(0) * ss.state_cov(0) * ss.selection(0).transpose();
    let predicted_init = Initialization::known(
        t0 * &a0 + ss.state_intercept(0),
        t0 * &p0 * t0.transpose() + rqr,
    )
    .unwrap();

    let config = FilterConfig::default();
    let shifted = filter_and_smooth(
        &ss,
        &data,
        &filtered_init,
        &config.clone().with_timing(FilterTiming::Filtered),
    )
    .unwrap();
    let direct = filter_and_smooth(&ss, &data, &predicted_init, &config).unwrap();

    assert!(shifted.filter.timing_init_filtered());
    assert_vectors_close(&shifted.smoothed_state, &direct.smoothed_state, 10, "smoothed_state");
    assert_vectors_close(
        &shifted.smoothed_state_disturbance,
        &direct.smoothed_state_disturbance,
        10,
        "smoothed_state_disturbance",
    );
    assert!(close(shifted.filter.llf(), direct.filter.llf(), 10));
}

#[test]
fn test_fully_missing_period_is_degenerate() {
    let ss = uc_model(correlated_obs_cov());
    let data = uc_data(5);
    for method in [FilterMethod::Conventional, FilterMethod::Univariate] {
        let res = kalman_filter(&ss, &data, &uc_init(), &FilterConfig::default().with_method(method)).unwrap();
        let f = &res;
        assert_eq!(f.llf_obs[10], 0.0);
        assert_eq!(f.filtered_state[10], f.predicted_state[10]);
        assert_eq!(f.filtered_state_cov[10], f.predicted_state_cov[10]);
        assert!(f.forecasts_error[10].iter().all(|v| v.is_nan()));
        // partially missing periods report NaN only where data is missing
        assert!(f.forecasts_error[4][1].is_nan());
        assert!(f.forecasts_error[4][0].is_finite());
    }
}

#[test]
fn test_exact_diffuse_close_to_large_kappa() {
    let ss = uc_model(correlated_obs_cov());
    let data = uc_data(13);
    let exact = smooth(&ss, &data, &FilterConfig::default());
    let config = FilterConfig {
        kappa: 1e8,
        ..FilterConfig::default().with_diffuse(DiffuseMethod::Approximate)
    };
    let approx = smooth(&ss, &data, &config);

    let d = exact.filter.nobs_diffuse;
    for t in d..NOBS {
        assert!((exact.filter.llf_obs[t] - approx.filter.llf_obs[t]).abs() < 1e-4, "llf_obs[{}]", t);
        let diff = &exact.smoothed_state[t] - &approx.smoothed_state[t];
        assert!(diff.amax() < 1e-4, "smoothed_state[{}]", t);
    }
}

#[test]
fn test_complex_step_derivative_of_llf() {
    // d llf / d sigma2_eps for a local level model
    let y = [1.2, 0.7, 1.9, 2.4, f64::NAN, 2.0, 3.1, 2.6];
    let n = y.len();

    let llf_real = |sigma2: f64| -> f64 {
        let ss = StateSpace::builder(1, 1, 1, n)
            .design(DMatrix::from_element(1, 1, 1.0))
            .obs_cov(DMatrix::from_element(1, 1, sigma2))
            .transition(DMatrix::from_element(1, 1, 1.0))
            .selection(DMatrix::from_element(1, 1, 1.0))
            .state_cov(DMatrix::from_element(1, 1, 0.4))
            .build()
            .unwrap();
        let data = Observations::from_nan(DMatrix::from_row_slice(1, n, &y));
        let init = Initialization::known(DVector::zeros(1), DMatrix::from_element(1, 1, 5.0)).unwrap();
        kalman_filter(&ss, &data, &init, &FilterConfig::default()).unwrap().llf()
    };

    let h = 1e-20;
    let sigma2 = 0.8;
    let c = |x: f64| Complex::new(x, 0.0);
    let ss = StateSpace::builder(1, 1, 1, n)
        .design(DMatrix::from_element(1, 1, c(1.0)))
        .obs_cov(DMatrix::from_element(1, 1, Complex::new(sigma2, h)))
        .transition(DMatrix::from_element(1, 1, c(1.0)))
        .selection(DMatrix::from_element(1, 1, c(1.0)))
        .state_cov(DMatrix::from_element(1, 1, c(0.4)))
        .build()
        .unwrap();
    let values = DMatrix::from_fn(1, n, |_, t| c(y[t]));
    let mut missing = DMatrix::from_element(1, n, false);
    missing[(0, 4)] = true;
    let data = Observations::new(values, missing).unwrap();
    let init = Initialization::known(DVector::zeros(1), DMatrix::from_element(1, 1, c(5.0))).unwrap();

    for method in [FilterMethod::Conventional, FilterMethod::Univariate] {
        let llf = kalman_filter(&ss, &data, &init, &FilterConfig::default().with_method(method))
            .unwrap()
            .llf();
        let complex_step = llf.im / h;
        let eps = 1e-6;
        let central = (llf_real(sigma2 + eps) - llf_real(sigma2 - eps)) / (2.0 * eps);
        assert!((llf.re - llf_real(sigma2)).abs() < 1e-12);
        assert!((complex_step - central).abs() < 1e-6, "{} vs {}", complex_step, central);
    }
}

#[test]
fn test_single_precision_matches_double() {
    let y = [1.2f64, 0.7, 1.9, 2.4, 2.2, 2.0, 3.1, 2.6];
    let n = y.len();
    let build = |f: &dyn Fn(f64) -> f32| {
        StateSpace::builder(1, 1, 1, n)
            .design(DMatrix::from_element(1, 1, f(1.0)))
            .obs_cov(DMatrix::from_element(1, 1, f(0.8)))
            .transition(DMatrix::from_element(1, 1, f(1.0)))
            .selection(DMatrix::from_element(1, 1, f(1.0)))
            .state_cov(DMatrix::from_element(1, 1, f(0.4)))
            .build()
            .unwrap()
    };
    let ss32 = build(&|x| x as f32);
    let data32 = Observations::fully_observed(DMatrix::from_fn(1, n, |_, t| y[t] as f32));
    let res32 = filter_and_smooth(&ss32, &data32, &Initialization::diffuse(1), &FilterConfig::default()).unwrap();

    let ss64 = StateSpace::builder(1, 1, 1, n)
        .design(DMatrix::from_element(1, 1, 1.0))
        .obs_cov(DMatrix::from_element(1, 1, 0.8))
        .transition(DMatrix::from_element(1, 1, 1.0))
        .selection(DMatrix::from_element(1, 1, 1.0))
        .state_cov(DMatrix::from_element(1, 1, 0.4))
        .build()
        .unwrap();
    let data64 = Observations::fully_observed(DMatrix::from_row_slice(1, n, &y));
    let res64 = filter_and_smooth(&ss64, &data64, &Initialization::diffuse(1), &FilterConfig::default()).unwrap();

    assert_eq!(res32.filter.nobs_diffuse, res64.filter.nobs_diffuse);
    assert!((res32.filter.llf() as f64 - res64.filter.llf()).abs() < 1e-4);
    for t in 0..n {
        assert!((res32.smoothed_state[t][0] as f64 - res64.smoothed_state[t][0]).abs() < 1e-4);
    }
}

#[test]
fn test_numerical_failure_reports_time() {
    // a zero observation variance and a degenerate state make F_t = 0
    let ss = StateSpace::builder(1, 1, 1, 4)
        .design(DMatrix::from_element(1, 1, 1.0))
        .obs_cov(DMatrix::from_element(1, 1, 0.0))
        .transition(DMatrix::from_element(1, 1, 1.0))
        .selection(DMatrix::from_element(1, 1, 1.0))
        .state_cov(DMatrix::from_element(1, 1, 0.0))
        .build()
        .unwrap();
    let data = Observations::from_rows(&[vec![f64::NAN, 1.0, 2.0, 3.0]]).unwrap();
    let init = Initialization::known(DVector::zeros(1), DMatrix::zeros(1, 1)).unwrap();
    let err = kalman_filter(&ss, &data, &init, &FilterConfig::default()).unwrap_err();
    assert!(err.is_numerical());
    assert_eq!(err.time(), Some(1));
}

fn local_level_with_obs_var(obs_var: f64, state_var: f64, nobs: usize) -> StateSpace<f64> {
    StateSpace::builder(1, 1, 1, nobs)
        .design(DMatrix::from_element(1, 1, 1.0))
        .obs_cov(DMatrix::from_element(1, 1, obs_var))
        .transition(DMatrix::from_element(1, 1, 1.0))
        .selection(DMatrix::from_element(1, 1, 1.0))
        .state_cov(DMatrix::from_element(1, 1, state_var))
        .build()
        .unwrap()
}

#[test]
fn test_negative_forecast_variance_fatal_in_both_methods() {
    // F_0 = 0.5 - 2 < 0
    let ss = local_level_with_obs_var(-2.0, 0.5, 3);
    let data = Observations::from_rows(&[vec![1.0, 2.0, 3.0]]).unwrap();
    let init = Initialization::known(DVector::zeros(1), DMatrix::from_element(1, 1, 0.5)).unwrap();
    for method in [FilterMethod::Conventional, FilterMethod::Univariate] {
        let err = kalman_filter(&ss, &data, &init, &FilterConfig::default().with_method(method)).unwrap_err();
        assert!(err.is_numerical(), "{:?}: {}", method, err);
        assert_eq!(err.time(), Some(0), "{:?}", method);
    }

    // the diffuse step itself is fine; F_1 = -1.5 - 2 fails right after it
    let diffuse = Initialization::diffuse(1);
    for method in [FilterMethod::Conventional, FilterMethod::Univariate] {
        let err = kalman_filter(&ss, &data, &diffuse, &FilterConfig::default().with_method(method)).unwrap_err();
        assert!(err.is_numerical(), "{:?}: {}", method, err);
        assert_eq!(err.time(), Some(1), "{:?}", method);
    }
}

#[test]
fn test_zero_forecast_variance_skipped_sequentially() {
    // F_t = 0 exactly: the joint update cannot factor it, the sequential
    // update treats the coordinate as uninformative
    let ss = local_level_with_obs_var(0.0, 0.0, 2);
    let data = Observations::from_rows(&[vec![1.0, 2.0]]).unwrap();
    let init = Initialization::known(DVector::zeros(1), DMatrix::zeros(1, 1)).unwrap();

    let err = kalman_filter(&ss, &data, &init, &FilterConfig::default()).unwrap_err();
    assert_eq!(err.time(), Some(0));

    let res = kalman_filter(&ss, &data, &init, &FilterConfig::univariate()).unwrap();
    assert_eq!(res.llf(), 0.0);
    assert_eq!(res.filtered_state[0], res.predicted_state[0]);
    assert_eq!(res.filtered_state[1], res.predicted_state[1]);
}
