use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{Result, SsmError, Stage};
use crate::initialization::Initialization;
use crate::kalman::{kalman_filter, FilterResult, StepKind};
use crate::scalar::{symmetrize, KalmanScalar};
use crate::state_space::{Observations, StateSpace};
use crate::types::FilterConfig;
use crate::univariate::{self, CoordinateErrors, DiffuseCarry};

/// Output of [`kalman_smoother`]. Owns the filter output it was computed from.
///
/// `scaled_smoothed_estimator[t]` is `r_t`, the information about `alpha_{t+1}`
/// carried back from periods after `t` (zero at the last period), and
/// `scaled_smoothed_estimator_cov[t]` is `N_t`. The values before the first
/// period are in `initial_scaled_smoothed_estimator` / `_cov`.
#[derive(Debug, Clone)]
pub struct SmootherResult<T: KalmanScalar> {
    pub filter: FilterResult<T>,
    pub smoothed_state: Vec<DVector<T>>,
    pub smoothed_state_cov: Vec<DMatrix<T>>,
    pub smoothed_forecasts: Vec<DVector<T>>,
    pub smoothed_measurement_disturbance: Vec<DVector<T>>,
    pub smoothed_measurement_disturbance_cov: Vec<DMatrix<T>>,
    pub smoothed_state_disturbance: Vec<DVector<T>>,
    pub smoothed_state_disturbance_cov: Vec<DMatrix<T>>,
    pub scaled_smoothed_estimator: Vec<DVector<T>>,
    pub scaled_smoothed_estimator_cov: Vec<DMatrix<T>>,
    pub initial_scaled_smoothed_estimator: DVector<T>,
    pub initial_scaled_smoothed_estimator_cov: DMatrix<T>,
}

/// Fixed-interval smoother: one backward pass producing smoothed states,
/// disturbances and the scaled smoothed estimator.
///
/// Backward recursion from r_{n-1} = 0, N_{n-1} = 0:
///   eta_hat_t = Q_t R_t' r_t,   Var = Q_t - Q_t R_t' N_t R_t Q_t
///   u_t       = F_t^{-1} v_t - K_t' T_t' r_t
///   eps_hat_t = H_t u_t
///   r_{t-1}   = Z_t' u_t + T_t' r_t
///   N_{t-1}   = Z_t' F_t^{-1} Z_t + L_t' T_t' N_t T_t L_t,   L_t = I - K_t Z_t
///   alpha_hat_t = a_t + P_t r_{t-1},  V_t = P_t - P_t N_{t-1} P_t
///
/// Periods filtered sequentially run the same recursion coordinate by
/// coordinate; periods of the exact diffuse phase carry the additional
/// `(r1, N1, N2)` terms.
pub fn kalman_smoother<T: KalmanScalar>(
    ss: &StateSpace<T>,
    filter: FilterResult<T>,
) -> Result<SmootherResult<T>> {
    if ss.nobs != filter.nobs || ss.k_endog != filter.k_endog || ss.k_states != filter.k_states {
        return Err(SsmError::Configuration(format!(
            "filter output (k_endog={}, k_states={}, nobs={}) does not match the representation (k_endog={}, k_states={}, nobs={})",
            filter.k_endog, filter.k_states, filter.nobs, ss.k_endog, ss.k_states, ss.nobs
        )));
    }
    let (n, m, p) = (ss.nobs, ss.k_states, ss.k_endog);
    debug!(nobs = n, nobs_diffuse = filter.nobs_diffuse, "running Kalman smoother");

    let mut smoothed_state = vec![DVector::zeros(m); n];
    let mut smoothed_state_cov = vec![DMatrix::zeros(m, m); n];
    let mut smoothed_forecasts = vec![DVector::zeros(p); n];
    let mut meas = vec![DVector::zeros(p); n];
    let mut meas_cov = vec![DMatrix::zeros(p, p); n];
    let mut state_dist = vec![DVector::zeros(ss.k_posdef); n];
    let mut state_dist_cov = vec![DMatrix::zeros(ss.k_posdef, ss.k_posdef); n];
    let mut sse = vec![DVector::zeros(m); n];
    let mut sse_cov = vec![DMatrix::zeros(m, m); n];

    let mut carry = DiffuseCarry::new(DVector::zeros(m), DMatrix::zeros(m, m));

    for t in (0..n).rev() {
        sse[t] = carry.r0.clone();
        sse_cov[t] = carry.n0.clone();

        let qr = ss.state_cov(t) * ss.selection(t).transpose();
        state_dist[t] = &qr * &carry.r0;
        state_dist_cov[t] = symmetrize(&(ss.state_cov(t) - &qr * &carry.n0 * qr.transpose()));

        let diffuse = t < filter.nobs_diffuse;
        carry.transition_back(ss.transition(t));

        let (eps, eps_cov) = match &filter.steps[t] {
            StepKind::Missing => (DVector::zeros(p), ss.obs_cov(t).clone()),
            StepKind::Conventional { observed } => {
                conventional_step(ss, &filter, t, observed, &mut carry.r0, &mut carry.n0)?
            }
            StepKind::Univariate(block) => {
                let errors: CoordinateErrors<T> = if diffuse {
                    univariate::diffuse_smooth_step(block, &filter, t, &mut carry)
                } else {
                    univariate::smooth_step(block, &filter, t, &mut carry.r0, &mut carry.n0)
                };
                univariate::measurement_disturbance(ss.obs_cov(t), block, &errors)
            }
        };
        meas[t] = eps;
        meas_cov[t] = eps_cov;

        let a = &filter.predicted_state[t];
        let p_star = &filter.predicted_state_cov[t];
        let (state, cov) = if diffuse {
            let p_inf = &filter.predicted_diffuse_state_cov[t];
            let cross = p_inf * &carry.n1 * p_star;
            (
                a + p_star * &carry.r0 + p_inf * &carry.r1,
                p_star
                    - p_star * &carry.n0 * p_star
                    - &cross
                    - cross.transpose()
                    - p_inf * &carry.n2 * p_inf,
            )
        } else {
            (a + p_star * &carry.r0, p_star - p_star * &carry.n0 * p_star)
        };
        smoothed_forecasts[t] = ss.design(t) * &state + ss.obs_intercept(t);
        smoothed_state[t] = state;
        smoothed_state_cov[t] = symmetrize(&cov);
    }

    debug!("Kalman smoother complete");
    Ok(SmootherResult {
        filter,
        smoothed_state,
        smoothed_state_cov,
        smoothed_forecasts,
        smoothed_measurement_disturbance: meas,
        smoothed_measurement_disturbance_cov: meas_cov,
        smoothed_state_disturbance: state_dist,
        smoothed_state_disturbance_cov: state_dist_cov,
        scaled_smoothed_estimator: sse,
        scaled_smoothed_estimator_cov: sse_cov,
        initial_scaled_smoothed_estimator: carry.r0,
        initial_scaled_smoothed_estimator_cov: carry.n0,
    })
}

/// Filter then smooth.
pub fn filter_and_smooth<T: KalmanScalar>(
    ss: &StateSpace<T>,
    data: &Observations<T>,
    init: &Initialization<T>,
    config: &FilterConfig,
) -> Result<SmootherResult<T>> {
    let filter = kalman_filter(ss, data, init, config)?;
    kalman_smoother(ss, filter)
}

/// Multivariate backward step over the observed block of period `t`.
///
/// Returns the smoothed measurement disturbance and its covariance; missing
/// coordinates get their conditional mean given the observed ones.
fn conventional_step<T: KalmanScalar>(
    ss: &StateSpace<T>,
    filter: &FilterResult<T>,
    t: usize,
    observed: &[usize],
    r: &mut DVector<T>,
    n: &mut DMatrix<T>,
) -> Result<(DVector<T>, DMatrix<T>)> {
    let m = ss.k_states;
    let z = ss.design(t).select_rows(observed);
    let f = filter.forecasts_error_cov[t]
        .select_rows(observed)
        .select_columns(observed);
    let factor = T::factor(f)
        .ok_or_else(|| T::factor_error(Stage::Smoother, t, "forecasts_error_cov"))?;
    let f_inv = factor.inverse();

    let v = filter.forecasts_error[t].select_rows(observed);
    let k = filter.kalman_gain[t].select_columns(observed);
    let kt = k.transpose();

    let u = factor.solve_vector(&v) - &kt * &*r;
    let d = &f_inv + &kt * &*n * &k;
    let l = DMatrix::<T>::identity(m, m) - &k * &z;

    *r = z.transpose() * &u + &*r;
    *n = symmetrize(&(z.transpose() * &f_inv * &z + l.transpose() * &*n * &l));

    let obs_cov = ss.obs_cov(t);
    let w = obs_cov.select_columns(observed);
    let eps = &w * &u;
    let eps_cov = obs_cov - &w * d * w.transpose();
    Ok((eps, symmetrize(&eps_cov)))
}
