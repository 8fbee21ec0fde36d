use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace, warn};

use crate::error::{Result, SsmError, Stage};
use crate::initialization::Initialization;
use crate::scalar::{ldl, ln_2pi, max_abs, nan, symmetrize, KalmanScalar};
use crate::state_space::{Observations, StateSpace};
use crate::types::{DiffuseMethod, FilterConfig, FilterMethod, FilterTiming};
use crate::univariate::{self, ObservationBlock};

/// How the observations of one time step entered the filter.
#[derive(Debug, Clone)]
pub(crate) enum StepKind<T: KalmanScalar> {
    Missing,
    Conventional { observed: Vec<usize> },
    Univariate(ObservationBlock<T>),
}

/// Output of [`kalman_filter`].
///
/// Per-step sequences have `nobs` entries, except the predicted sequences
/// which carry one more: `predicted_state[nobs]` is the out-of-sample
/// prediction. Entries tied to a missing coordinate are NaN, never zero.
///
/// In univariate mode (and throughout the exact diffuse phase, which is always
/// sequential) `forecasts_error`, `forecasts_error_cov` and `kalman_gain`
/// hold the per-coordinate quantities of the sequential update in the
/// diagonalized coordinates; `forecasts_error_cov` is then diagonal on the
/// observed block.
#[derive(Debug, Clone)]
pub struct FilterResult<T: KalmanScalar> {
    pub k_endog: usize,
    pub k_states: usize,
    pub nobs: usize,
    pub config: FilterConfig,
    /// Initialization as supplied, before any timing shift.
    pub initialization: Initialization<T>,
    pub missing: DMatrix<bool>,
    /// Leading periods handled by the exact diffuse recursions.
    pub nobs_diffuse: usize,

    pub predicted_state: Vec<DVector<T>>,
    pub predicted_state_cov: Vec<DMatrix<T>>,
    /// `P_inf` of each prediction; zero outside the diffuse phase.
    pub predicted_diffuse_state_cov: Vec<DMatrix<T>>,
    pub filtered_state: Vec<DVector<T>>,
    pub filtered_state_cov: Vec<DMatrix<T>>,
    pub forecasts: Vec<DVector<T>>,
    pub forecasts_error: Vec<DVector<T>>,
    pub forecasts_error_cov: Vec<DMatrix<T>>,
    /// `F_inf` of each diffuse step; zero outside the diffuse phase.
    pub forecasts_error_diffuse_cov: Vec<DMatrix<T>>,
    /// Filtering gain `P Z' F^{-1}` (`k_states x k_endog`), zero columns for
    /// missing coordinates.
    pub kalman_gain: Vec<DMatrix<T>>,
    /// Diffuse gain `M_inf / F_inf` of each diffuse step.
    pub kalman_gain_diffuse: Vec<DMatrix<T>>,
    /// Log-likelihood contribution of each period.
    pub llf_obs: Vec<T>,

    pub(crate) steps: Vec<StepKind<T>>,
}

impl<T: KalmanScalar> FilterResult<T> {
    /// Log-likelihood, excluding the first `loglikelihood_burn` periods.
    pub fn llf(&self) -> T {
        self.llf_obs
            .iter()
            .skip(self.config.loglikelihood_burn)
            .fold(T::zero(), |acc, &l| acc + l)
    }

    pub fn filter_univariate(&self) -> bool {
        self.config.method == FilterMethod::Univariate
    }

    pub fn timing_init_filtered(&self) -> bool {
        self.config.timing == FilterTiming::Filtered
    }

    /// `C^{-1} v` with `C C' = F` on the observed block of each period.
    ///
    /// Coordinates that are missing, have a zero forecast variance, or are
    /// still informative about diffuse directions are NaN.
    pub fn standardized_forecasts_error(&self) -> Vec<DVector<T>> {
        (0..self.nobs)
            .map(|t| {
                let mut out = DVector::from_element(self.k_endog, nan::<T>());
                let observed = crate::state_space::observed_indices(&self.missing, t);
                if observed.is_empty() {
                    return out;
                }
                let f = self.forecasts_error_cov[t]
                    .select_rows(&observed)
                    .select_columns(&observed);
                let v = self.forecasts_error[t].select_rows(&observed);
                let (l, d) = ldl(&f);
                let w = l.solve_lower_triangular_unchecked(&v);
                for (j, &i) in observed.iter().enumerate() {
                    let diffuse = t < self.nobs_diffuse
                        && self.forecasts_error_diffuse_cov[t][(i, i)].real_part()
                            > self.config.tolerance_diffuse;
                    if !diffuse && d[j].real_part() > 0.0 {
                        out[i] = w[j] / d[j].sqrt();
                    }
                }
                out
            })
            .collect()
    }
}

/// Output of one time step's update, before it is appended to the result.
pub(crate) struct StepRecord<T: KalmanScalar> {
    pub forecasts_error: DVector<T>,
    pub forecasts_error_cov: DMatrix<T>,
    pub forecasts_error_diffuse_cov: DMatrix<T>,
    pub kalman_gain: DMatrix<T>,
    pub kalman_gain_diffuse: DMatrix<T>,
    pub llf: T,
}

impl<T: KalmanScalar> StepRecord<T> {
    /// Everything NaN (or zero for gains), as for a fully missing step.
    pub fn new(k_endog: usize, k_states: usize, diffuse: bool) -> Self {
        let diffuse_cov = if diffuse {
            DMatrix::from_element(k_endog, k_endog, nan::<T>())
        } else {
            DMatrix::zeros(k_endog, k_endog)
        };
        Self {
            forecasts_error: DVector::from_element(k_endog, nan::<T>()),
            forecasts_error_cov: DMatrix::from_element(k_endog, k_endog, nan::<T>()),
            forecasts_error_diffuse_cov: diffuse_cov,
            kalman_gain: DMatrix::zeros(k_states, k_endog),
            kalman_gain_diffuse: DMatrix::zeros(k_states, k_endog),
            llf: T::zero(),
        }
    }

    /// Zero the observed block of the covariances ahead of a sequential update.
    pub fn clear_observed(&mut self, observed: &[usize], diffuse: bool) {
        for &i in observed {
            for &k in observed {
                self.forecasts_error_cov[(i, k)] = T::zero();
                if diffuse {
                    self.forecasts_error_diffuse_cov[(i, k)] = T::zero();
                }
            }
        }
    }
}

/// Run the Kalman filter over every period of `data`.
///
/// State equation:  alpha_{t+1} = T_t alpha_t + c_t + R_t eta_t
/// Observation:     y_t         = Z_t alpha_t + d_t + eps_t
///
/// Per period:
///   - forecast:  v_t = y_t - Z_t a_t - d_t,  F_t = Z_t P_t Z_t' + H_t
///   - update:    K_t = P_t Z_t' F_t^{-1},  a_{t|t} = a_t + K_t v_t,
///                P_{t|t} = P_t - K_t Z_t P_t
///   - predict:   a_{t+1} = T_t a_{t|t} + c_t,  P_{t+1} = T_t P_{t|t} T_t' + R_t Q_t R_t'
///
/// Only the observed coordinates of a period enter its update. A diffuse
/// initialization is handled exactly (`DiffuseMethod::Exact`) or by
/// inflating the diffuse part with `config.kappa`.
pub fn kalman_filter<T: KalmanScalar>(
    ss: &StateSpace<T>,
    data: &Observations<T>,
    init: &Initialization<T>,
    config: &FilterConfig,
) -> Result<FilterResult<T>> {
    check_inputs(ss, data, init, config)?;
    let (n, k_endog, m) = (ss.nobs, ss.k_endog, ss.k_states);

    let start = match config.timing {
        FilterTiming::Predicted => init.clone(),
        FilterTiming::Filtered => init.predicted_through(ss),
    };

    let mut a = start.constant.clone();
    let mut diffuse = config.diffuse == DiffuseMethod::Exact
        && max_abs(&start.diffuse_cov) >= config.tolerance_diffuse;
    let (mut p_star, mut p_inf) = match config.diffuse {
        DiffuseMethod::Exact if diffuse => (start.stationary_cov.clone(), start.diffuse_cov.clone()),
        DiffuseMethod::Exact => (start.stationary_cov.clone(), DMatrix::zeros(m, m)),
        DiffuseMethod::Approximate => (start.approximate_cov(config.kappa), DMatrix::zeros(m, m)),
    };
    let kappa: T = nalgebra::convert(config.kappa);

    debug!(
        nobs = n,
        k_endog,
        k_states = m,
        method = ?config.method,
        diffuse,
        "running Kalman filter"
    );

    let mut out = FilterResult {
        k_endog,
        k_states: m,
        nobs: n,
        config: config.clone(),
        initialization: init.clone(),
        missing: data.missing().clone(),
        nobs_diffuse: 0,
        predicted_state: Vec::with_capacity(n + 1),
        predicted_state_cov: Vec::with_capacity(n + 1),
        predicted_diffuse_state_cov: Vec::with_capacity(n + 1),
        filtered_state: Vec::with_capacity(n),
        filtered_state_cov: Vec::with_capacity(n),
        forecasts: Vec::with_capacity(n),
        forecasts_error: Vec::with_capacity(n),
        forecasts_error_cov: Vec::with_capacity(n),
        forecasts_error_diffuse_cov: Vec::with_capacity(n),
        kalman_gain: Vec::with_capacity(n),
        kalman_gain_diffuse: Vec::with_capacity(n),
        llf_obs: Vec::with_capacity(n),
        steps: Vec::with_capacity(n),
    };

    for t in 0..n {
        if diffuse && config.max_diffuse_steps.is_some_and(|cap| t >= cap) {
            warn!(
                t,
                max_abs_diffuse_cov = max_abs(&p_inf),
                "diffuse phase hit max_diffuse_steps; folding the remaining diffuse covariance with kappa"
            );
            p_star += &p_inf * kappa;
            p_inf.fill(T::zero());
            diffuse = false;
            out.nobs_diffuse = t;
        }

        out.predicted_state.push(a.clone());
        out.predicted_state_cov.push(p_star.clone());
        out.predicted_diffuse_state_cov.push(p_inf.clone());

        let design = ss.design(t);
        out.forecasts.push(design * &a + ss.obs_intercept(t));

        let observed = data.observed_indices(t);
        let mut record = StepRecord::new(k_endog, m, diffuse);
        let mut a_f = a.clone();
        let mut p_f = p_star.clone();
        let mut p_inf_f = p_inf.clone();

        let kind = if observed.is_empty() {
            record.forecasts_error_cov = design * &p_star * design.transpose() + ss.obs_cov(t);
            if diffuse {
                record.forecasts_error_diffuse_cov = design * &p_inf * design.transpose();
            }
            StepKind::Missing
        } else if diffuse {
            let block = ObservationBlock::new(ss, data, t, observed);
            univariate::diffuse_update(&block, t, &mut a_f, &mut p_f, &mut p_inf_f, &mut record, config)?;
            StepKind::Univariate(block)
        } else if config.method == FilterMethod::Univariate {
            let block = ObservationBlock::new(ss, data, t, observed);
            univariate::update(&block, t, &mut a_f, &mut p_f, &mut record, config.tolerance)?;
            StepKind::Univariate(block)
        } else {
            conventional_update(ss, data, t, &observed, &mut a_f, &mut p_f, &mut record)?;
            StepKind::Conventional { observed }
        };

        let transition = ss.transition(t);
        a = transition * &a_f + ss.state_intercept(t);
        p_star = symmetrize(&(transition * &p_f * transition.transpose() + ss.selected_state_cov(t)));
        if diffuse {
            p_inf = symmetrize(&(transition * &p_inf_f * transition.transpose()));
            if max_abs(&p_inf) < config.tolerance_diffuse {
                trace!(t, "exact diffuse phase complete");
                p_inf.fill(T::zero());
                diffuse = false;
                out.nobs_diffuse = t + 1;
            }
        }

        out.filtered_state.push(a_f);
        out.filtered_state_cov.push(p_f);
        out.forecasts_error.push(record.forecasts_error);
        out.forecasts_error_cov.push(record.forecasts_error_cov);
        out.forecasts_error_diffuse_cov.push(record.forecasts_error_diffuse_cov);
        out.kalman_gain.push(record.kalman_gain);
        out.kalman_gain_diffuse.push(record.kalman_gain_diffuse);
        out.llf_obs.push(record.llf);
        out.steps.push(kind);
    }

    if diffuse {
        debug!("diffuse phase did not complete within the sample");
        out.nobs_diffuse = n;
    }
    out.predicted_state.push(a);
    out.predicted_state_cov.push(p_star);
    out.predicted_diffuse_state_cov.push(p_inf);

    debug!(
        llf = out.llf().real_part(),
        nobs_diffuse = out.nobs_diffuse,
        "Kalman filter complete"
    );
    Ok(out)
}

/// Multivariate update with the observed block of period `t`.
fn conventional_update<T: KalmanScalar>(
    ss: &StateSpace<T>,
    data: &Observations<T>,
    t: usize,
    observed: &[usize],
    a: &mut DVector<T>,
    p: &mut DMatrix<T>,
    record: &mut StepRecord<T>,
) -> Result<()> {
    let half: T = nalgebra::convert(0.5);
    let z = ss.design(t).select_rows(observed);
    let h = ss.obs_cov(t).select_rows(observed).select_columns(observed);
    let y = data.column(t).select_rows(observed);

    let v = y - &z * &*a - ss.obs_intercept(t).select_rows(observed);
    let pz = &*p * z.transpose();
    let f = symmetrize(&(&z * &pz + h));

    let factor = T::factor(f.clone())
        .ok_or_else(|| T::factor_error(Stage::Filter, t, "forecasts_error_cov"))?;
    let gain = factor.solve(&pz.transpose()).transpose();

    *a += &gain * &v;
    *p = symmetrize(&(&*p - &gain * pz.transpose()));

    let dim: T = nalgebra::convert(observed.len() as f64);
    let quad = v.dot(&factor.solve_vector(&v));
    record.llf = -(dim * ln_2pi::<T>() + factor.ln_det() + quad) * half;

    for (j, &i) in observed.iter().enumerate() {
        record.forecasts_error[i] = v[j];
        record.kalman_gain.set_column(i, &gain.column(j));
        for (l, &k) in observed.iter().enumerate() {
            record.forecasts_error_cov[(i, k)] = f[(j, l)];
        }
    }
    Ok(())
}

fn check_inputs<T: KalmanScalar>(
    ss: &StateSpace<T>,
    data: &Observations<T>,
    init: &Initialization<T>,
    config: &FilterConfig,
) -> Result<()> {
    if data.k_endog() != ss.k_endog {
        return Err(SsmError::LengthMismatch {
            what: "observation vector",
            expected: ss.k_endog,
            got: data.k_endog(),
        });
    }
    if data.nobs() != ss.nobs {
        return Err(SsmError::LengthMismatch {
            what: "observation sample",
            expected: ss.nobs,
            got: data.nobs(),
        });
    }
    init.validate(ss.k_states)?;
    if !(config.kappa > 0.0 && config.tolerance >= 0.0 && config.tolerance_diffuse >= 0.0) {
        return Err(SsmError::Configuration(format!(
            "kappa must be positive and tolerances non-negative, got kappa={}, tolerance={}, tolerance_diffuse={}",
            config.kappa, config.tolerance, config.tolerance_diffuse
        )));
    }
    for t in 0..data.nobs() {
        for i in data.observed_indices(t) {
            let y = data.values()[(i, t)];
            if !y.is_finite() {
                return Err(SsmError::DataError(format!(
                    "observation ({}, {}) is not finite but is not marked missing",
                    i, t
                )));
            }
        }
    }
    Ok(())
}
