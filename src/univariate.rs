//! Sequential processing of the observation vector.
//!
//! Each observed coordinate of a time step is folded into the state as its own
//! scalar update, so no `k_endog x k_endog` matrix is ever inverted. A
//! non-diagonal observation covariance is first diagonalized with an LDL'
//! transform of the observed block:
//!
//!   H_oo = L D L',  y* = L^{-1} (y_o - d_o),  Z* = L^{-1} Z_o,  h = diag(D)
//!
//! which leaves the likelihood unchanged. The exact diffuse phase of the
//! filter always runs through this module, since it handles observation
//! vectors that are only partially informative about the diffuse directions.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, Stage};
use crate::kalman::{FilterResult, StepRecord};
use crate::scalar::{is_diagonal, ldl, ln_2pi, symmetrize, KalmanScalar};
use crate::state_space::{Observations, StateSpace};
use crate::types::FilterConfig;

/// Observed part of one time step, in diagonalized coordinates.
#[derive(Debug, Clone)]
pub(crate) struct ObservationBlock<T: KalmanScalar> {
    /// Original coordinate index of each row.
    pub observed: Vec<usize>,
    /// Transformed design rows Z*.
    pub design: DMatrix<T>,
    /// Transformed observations y*, intercept removed.
    pub obs: DVector<T>,
    /// Transformed observation variances h.
    pub obs_var: DVector<T>,
    /// Unit lower triangular L, when H_oo was not already diagonal.
    pub transform: Option<DMatrix<T>>,
}

impl<T: KalmanScalar> ObservationBlock<T> {
    pub fn new(ss: &StateSpace<T>, data: &Observations<T>, t: usize, observed: Vec<usize>) -> Self {
        let z = ss.design(t).select_rows(&observed);
        let h = ss.obs_cov(t).select_rows(&observed).select_columns(&observed);
        let y = data.column(t).select_rows(&observed) - ss.obs_intercept(t).select_rows(&observed);

        if is_diagonal(&h) {
            return Self {
                observed,
                design: z,
                obs: y,
                obs_var: h.diagonal(),
                transform: None,
            };
        }

        let (l, d) = ldl(&h);
        Self {
            observed,
            design: l.solve_lower_triangular_unchecked(&z),
            obs: l.solve_lower_triangular_unchecked(&y),
            obs_var: d,
            transform: Some(l),
        }
    }

    fn row(&self, j: usize) -> DVector<T> {
        self.design.row(j).transpose()
    }
}

/// Sequential filter update of `(a, P)` with every observed coordinate.
///
/// A coordinate whose forecast variance is zero within `tolerance` carries
/// no information and is skipped; a negative one is fatal.
pub(crate) fn update<T: KalmanScalar>(
    block: &ObservationBlock<T>,
    t: usize,
    a: &mut DVector<T>,
    p: &mut DMatrix<T>,
    record: &mut StepRecord<T>,
    tolerance: f64,
) -> Result<()> {
    let half: T = nalgebra::convert(0.5);
    record.clear_observed(&block.observed, false);

    for (j, &i) in block.observed.iter().enumerate() {
        let z = block.row(j);
        let m = &*p * &z;
        let f = z.dot(&m) + block.obs_var[j];
        let v = block.obs[j] - z.dot(&*a);

        record.forecasts_error[i] = v;
        record.forecasts_error_cov[(i, i)] = f;

        if f.real_part() < -tolerance {
            return Err(T::factor_error(Stage::Filter, t, "forecasts_error_cov"));
        }
        if f.real_part() <= tolerance {
            continue;
        }
        let k = &m / f;
        *a += &k * v;
        *p -= &k * m.transpose();
        record.llf -= (ln_2pi::<T>() + f.ln() + v * v / f) * half;
        record.kalman_gain.set_column(i, &k);
    }
    *p = symmetrize(p);
    Ok(())
}

/// Exact diffuse sequential update of `(a, P_*, P_inf)`.
///
/// For a coordinate with `F_inf > 0` the gain columns hold
/// `K0 = M_inf / F_inf` (diffuse) and `K1 = M_* / F_inf - M_inf F_* / F_inf^2`;
/// otherwise the ordinary gain `M_* / F_*` is used and `K0` is zero.
pub(crate) fn diffuse_update<T: KalmanScalar>(
    block: &ObservationBlock<T>,
    t: usize,
    a: &mut DVector<T>,
    p_star: &mut DMatrix<T>,
    p_inf: &mut DMatrix<T>,
    record: &mut StepRecord<T>,
    config: &FilterConfig,
) -> Result<()> {
    let half: T = nalgebra::convert(0.5);
    record.clear_observed(&block.observed, true);

    for (j, &i) in block.observed.iter().enumerate() {
        let z = block.row(j);
        let m_inf = &*p_inf * &z;
        let f_inf = z.dot(&m_inf);
        let m_star = &*p_star * &z;
        let f_star = z.dot(&m_star) + block.obs_var[j];
        let v = block.obs[j] - z.dot(&*a);

        record.forecasts_error[i] = v;
        record.forecasts_error_cov[(i, i)] = f_star;
        record.forecasts_error_diffuse_cov[(i, i)] = f_inf;

        if f_inf.real_part() < -config.tolerance_diffuse {
            return Err(T::factor_error(Stage::Filter, t, "forecasts_error_diffuse_cov"));
        }
        if f_inf.real_part() > config.tolerance_diffuse {
            let k0 = &m_inf / f_inf;
            let k1 = &m_star / f_inf - &m_inf * (f_star / (f_inf * f_inf));

            *a += &k0 * v;
            *p_inf -= &k0 * m_inf.transpose();
            let cross = &k0 * m_star.transpose();
            *p_star += &k0 * k0.transpose() * f_star - &cross - cross.transpose();
            record.llf -= (ln_2pi::<T>() + f_inf.ln()) * half;

            record.kalman_gain_diffuse.set_column(i, &k0);
            record.kalman_gain.set_column(i, &k1);
        } else if f_star.real_part() < -config.tolerance {
            return Err(T::factor_error(Stage::Filter, t, "forecasts_error_cov"));
        } else if f_star.real_part() > config.tolerance {
            let k = &m_star / f_star;
            *a += &k * v;
            *p_star -= &k * m_star.transpose();
            record.llf -= (ln_2pi::<T>() + f_star.ln() + v * v / f_star) * half;
            record.kalman_gain.set_column(i, &k);
        }
    }
    *p_star = symmetrize(p_star);
    *p_inf = symmetrize(p_inf);
    Ok(())
}

/// Per-coordinate smoothing output of one time step.
///
/// `u` is the smoothing error of each transformed coordinate and `d` the
/// diagonal of its variance, so that the smoothed disturbance of coordinate
/// `j` is `h_j u_j` with variance `h_j - h_j^2 d_j`.
pub(crate) struct CoordinateErrors<T: KalmanScalar> {
    pub u: DVector<T>,
    pub d: DVector<T>,
}

impl<T: KalmanScalar> CoordinateErrors<T> {
    fn zeros(n: usize) -> Self {
        Self {
            u: DVector::zeros(n),
            d: DVector::zeros(n),
        }
    }
}

/// Backward pass over the coordinates of step `t`, updating `(r, N)` in place.
///
/// On entry `(r, N)` refer to the filtered state of `t`; on exit they are
/// `r_{t-1}`, `N_{t-1}`.
pub(crate) fn smooth_step<T: KalmanScalar>(
    block: &ObservationBlock<T>,
    filter: &FilterResult<T>,
    t: usize,
    r: &mut DVector<T>,
    n: &mut DMatrix<T>,
) -> CoordinateErrors<T> {
    let mut out = CoordinateErrors::zeros(block.observed.len());

    for (j, &i) in block.observed.iter().enumerate().rev() {
        let f = filter.forecasts_error_cov[t][(i, i)];
        if f.real_part() <= filter.config.tolerance {
            continue;
        }
        let z = block.row(j);
        let v = filter.forecasts_error[t][i];
        let k = filter.kalman_gain[t].column(i).into_owned();

        let nk = &*n * &k;
        let s = k.dot(&nk);
        out.u[j] = v / f - k.dot(&*r);
        out.d[j] = f.recip() + s;

        *r += &z * out.u[j];
        *n = backward_quadratic(n, &z, &nk, s, f.recip());
    }
    out
}

/// `z z' / F + L' N L` for `L = I - k z'`, with `nk = N k` and `s = k' N k`.
fn backward_quadratic<T: KalmanScalar>(
    n: &DMatrix<T>,
    z: &DVector<T>,
    nk: &DVector<T>,
    s: T,
    f_inv: T,
) -> DMatrix<T> {
    let cross = z * nk.transpose();
    let zz = z * z.transpose();
    symmetrize(&(n - &cross - cross.transpose() + zz * (s + f_inv)))
}

/// Carried quantities of the exact diffuse backward recursion.
#[derive(Debug, Clone)]
pub(crate) struct DiffuseCarry<T: KalmanScalar> {
    pub r0: DVector<T>,
    pub r1: DVector<T>,
    pub n0: DMatrix<T>,
    pub n1: DMatrix<T>,
    pub n2: DMatrix<T>,
}

impl<T: KalmanScalar> DiffuseCarry<T> {
    pub fn new(r0: DVector<T>, n0: DMatrix<T>) -> Self {
        let m = r0.len();
        Self {
            r0,
            r1: DVector::zeros(m),
            n0,
            n1: DMatrix::zeros(m, m),
            n2: DMatrix::zeros(m, m),
        }
    }

    /// Move every carried quantity back through the transition: x -> T' x, N -> T' N T.
    pub fn transition_back(&mut self, transition: &DMatrix<T>) {
        let tt = transition.transpose();
        self.r0 = &tt * &self.r0;
        self.r1 = &tt * &self.r1;
        self.n0 = &tt * &self.n0 * transition;
        self.n1 = &tt * &self.n1 * transition;
        self.n2 = &tt * &self.n2 * transition;
    }
}

/// Backward pass over the coordinates of a diffuse step.
pub(crate) fn diffuse_smooth_step<T: KalmanScalar>(
    block: &ObservationBlock<T>,
    filter: &FilterResult<T>,
    t: usize,
    carry: &mut DiffuseCarry<T>,
) -> CoordinateErrors<T> {
    let m = carry.r0.len();
    let eye = DMatrix::<T>::identity(m, m);
    let mut out = CoordinateErrors::zeros(block.observed.len());

    for (j, &i) in block.observed.iter().enumerate().rev() {
        let f_inf = filter.forecasts_error_diffuse_cov[t][(i, i)];
        let f_star = filter.forecasts_error_cov[t][(i, i)];
        let v = filter.forecasts_error[t][i];
        let z = block.row(j);
        let zz = &z * z.transpose();

        if f_inf.real_part() > filter.config.tolerance_diffuse {
            let k0 = filter.kalman_gain_diffuse[t].column(i).into_owned();
            let k1 = filter.kalman_gain[t].column(i).into_owned();
            let l0 = &eye - &k0 * z.transpose();
            let l1 = -(&k1 * z.transpose());
            let (l0t, l1t) = (l0.transpose(), l1.transpose());
            let c = &*carry;

            out.u[j] = -k0.dot(&c.r0);
            out.d[j] = k0.dot(&(&c.n0 * &k0));

            let r1 = &z * (v / f_inf) + &l0t * &c.r1 + &l1t * &c.r0;
            let r0 = &l0t * &c.r0;
            let n2 = -(&zz * (f_star / (f_inf * f_inf)))
                + &l0t * &c.n2 * &l0
                + &l1t * &c.n1 * &l0
                + &l0t * &c.n1 * &l1
                + &l1t * &c.n0 * &l1;
            let n1 = &zz / f_inf
                + &l0t * &c.n1 * &l0
                + &l1t * &c.n0 * &l0
                + &l0t * &c.n0 * &l1;
            let n0 = &l0t * &c.n0 * &l0;

            carry.r0 = r0;
            carry.r1 = r1;
            carry.n0 = symmetrize(&n0);
            carry.n1 = symmetrize(&n1);
            carry.n2 = symmetrize(&n2);
        } else if f_star.real_part() > filter.config.tolerance {
            let k = filter.kalman_gain[t].column(i).into_owned();
            let l = &eye - &k * z.transpose();
            let lt = l.transpose();

            let nk = &carry.n0 * &k;
            let s = k.dot(&nk);
            out.u[j] = v / f_star - k.dot(&carry.r0);
            out.d[j] = f_star.recip() + s;

            carry.r0 += &z * out.u[j];
            carry.n0 = backward_quadratic(&carry.n0, &z, &nk, s, f_star.recip());
            carry.r1 = &lt * &carry.r1;
            carry.n1 = &lt * &carry.n1 * &l;
            carry.n2 = &lt * &carry.n2 * &l;
        }
    }
    out
}

/// Map transformed-coordinate smoothing errors back to the measurement
/// disturbance of every coordinate.
///
/// With `W = H[:, o] L'^{-1}`, the smoothed disturbance is `W u` and its
/// covariance `H - W diag(d) W'`. Coordinates missing at this step receive
/// their conditional mean given the observed ones. Only the diagonal of the
/// per-coordinate error variance is tracked, so cross-covariances between
/// coordinates of the same step are approximate.
pub(crate) fn measurement_disturbance<T: KalmanScalar>(
    obs_cov: &DMatrix<T>,
    block: &ObservationBlock<T>,
    errors: &CoordinateErrors<T>,
) -> (DVector<T>, DMatrix<T>) {
    let mut w = obs_cov.select_columns(&block.observed);
    if let Some(l) = &block.transform {
        w = l.solve_lower_triangular_unchecked(&w.transpose()).transpose();
    }
    let disturbance = &w * &errors.u;
    let cov = obs_cov - &w * DMatrix::from_diagonal(&errors.d) * w.transpose();
    (disturbance, symmetrize(&cov))
}
