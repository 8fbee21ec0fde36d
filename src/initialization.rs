use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsmError};
use crate::scalar::{max_abs, solve_discrete_lyapunov, KalmanScalar};
use crate::state_space::StateSpace;

/// Distribution of the initial state.
///
/// The covariance is split as `P_0 = P_* + P_inf`: `P_*` is the informative
/// (known) part, `P_inf` marks directions with infinite variance. A known
/// initialization has `P_inf = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Initialization<T: KalmanScalar> {
    /// Initial state mean a_0.
    pub constant: DVector<T>,
    /// Informative covariance P_*.
    pub stationary_cov: DMatrix<T>,
    /// Diffuse covariance P_inf.
    pub diffuse_cov: DMatrix<T>,
}

impl<T: KalmanScalar> Initialization<T> {
    /// Known mean and covariance.
    pub fn known(constant: DVector<T>, cov: DMatrix<T>) -> Result<Self> {
        let k = constant.len();
        Self::mixed(constant, cov, DMatrix::zeros(k, k))
    }

    /// Approximate diffuse initialization.
    /// - a_0 = 0
    /// - P_0 = kappa * I_{k_states}
    pub fn approximate_diffuse(k_states: usize, kappa: f64) -> Self {
        let kappa: T = nalgebra::convert(kappa);
        Self {
            constant: DVector::zeros(k_states),
            stationary_cov: DMatrix::identity(k_states, k_states) * kappa,
            diffuse_cov: DMatrix::zeros(k_states, k_states),
        }
    }

    pub fn default_kappa() -> f64 {
        1e6
    }

    /// Exact diffuse initialization: a_0 = 0, P_* = 0, P_inf = I.
    pub fn diffuse(k_states: usize) -> Self {
        Self {
            constant: DVector::zeros(k_states),
            stationary_cov: DMatrix::zeros(k_states, k_states),
            diffuse_cov: DMatrix::identity(k_states, k_states),
        }
    }

    /// Partially diffuse initialization with explicit components.
    pub fn mixed(
        constant: DVector<T>,
        stationary_cov: DMatrix<T>,
        diffuse_cov: DMatrix<T>,
    ) -> Result<Self> {
        let init = Self {
            constant,
            stationary_cov,
            diffuse_cov,
        };
        init.validate(init.k_states())?;
        Ok(init)
    }

    /// Unconditional distribution of a stationary model at t = 0.
    ///
    /// Mean `(I - T)^{-1} c`, covariance solving `P = T P T' + R Q R'`.
    pub fn stationary(ss: &StateSpace<T>) -> Result<Self> {
        let m = ss.k_states;
        let transition = ss.transition(0);
        let unit_root = || {
            SsmError::Configuration(
                "stationary initialization requires a transition matrix without unit roots"
                    .to_string(),
            )
        };

        let i_minus_t = DMatrix::<T>::identity(m, m) - transition;
        let constant = i_minus_t
            .lu()
            .solve(ss.state_intercept(0))
            .ok_or_else(unit_root)?;
        let cov = solve_discrete_lyapunov(transition, ss.selected_state_cov(0))
            .ok_or_else(unit_root)?;

        Ok(Self {
            constant,
            stationary_cov: cov,
            diffuse_cov: DMatrix::zeros(m, m),
        })
    }

    pub fn k_states(&self) -> usize {
        self.constant.len()
    }

    /// True when any direction has infinite variance.
    pub fn is_diffuse(&self) -> bool {
        max_abs(&self.diffuse_cov) > 0.0
    }

    /// `P_* + kappa * P_inf`, the approximate-diffuse stand-in for `P_0`.
    pub fn approximate_cov(&self, kappa: f64) -> DMatrix<T> {
        let kappa: T = nalgebra::convert(kappa);
        &self.stationary_cov + &self.diffuse_cov * kappa
    }

    /// Move the initialization from the pre-sample filtered slot to its
    /// one-step-ahead prediction through the time-0 state equation.
    pub(crate) fn predicted_through(&self, ss: &StateSpace<T>) -> Self {
        let t0 = ss.transition(0);
        Self {
            constant: t0 * &self.constant + ss.state_intercept(0),
            stationary_cov: t0 * &self.stationary_cov * t0.transpose()
                + ss.selected_state_cov(0),
            diffuse_cov: t0 * &self.diffuse_cov * t0.transpose(),
        }
    }

    pub(crate) fn validate(&self, k_states: usize) -> Result<()> {
        if self.constant.len() != k_states {
            return Err(SsmError::shape(
                "initial_state",
                k_states,
                self.constant.len(),
            ));
        }
        for (name, m) in [
            ("initial_state_cov", &self.stationary_cov),
            ("initial_diffuse_state_cov", &self.diffuse_cov),
        ] {
            if m.nrows() != k_states || m.ncols() != k_states {
                return Err(SsmError::shape(
                    name,
                    format!("{}x{}", k_states, k_states),
                    m.shape(),
                ));
            }
        }
        if self.constant.iter().any(|x| !x.is_finite())
            || self.stationary_cov.iter().any(|x| !x.is_finite())
        {
            return Err(SsmError::DataError(
                "initialization contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }
}
