/// How the observation vector of a time step is folded into the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMethod {
    /// Multivariate update with the full forecast error covariance.
    #[default]
    Conventional,
    /// Sequential scalar updates, one per observed coordinate.
    Univariate,
}

/// Treatment of the diffuse part of the initial state covariance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffuseMethod {
    /// Exact diffuse recursions until the diffuse covariance vanishes.
    #[default]
    Exact,
    /// Replace the diffuse part by `kappa` times itself.
    Approximate,
}

/// Which slot the initialization anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterTiming {
    /// The initialization is `predicted_state[0]`, i.e. `E(alpha_0)`.
    #[default]
    Predicted,
    /// The initialization is the pre-sample filtered state; `predicted_state[0]`
    /// is its one-step-ahead prediction through the time-0 state equation.
    Filtered,
}

/// Run configuration, passed by reference to every filter, smoother and
/// simulation call.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    pub method: FilterMethod,
    pub diffuse: DiffuseMethod,
    pub timing: FilterTiming,
    /// Leading periods excluded from `FilterResult::llf()`.
    pub loglikelihood_burn: usize,
    /// Cap on exact diffuse steps; `None` lets the phase run until `P_inf` vanishes.
    pub max_diffuse_steps: Option<usize>,
    /// Threshold below which `F_inf` and `P_inf` are treated as zero.
    pub tolerance_diffuse: f64,
    /// Threshold below which a univariate forecast error variance skips the update.
    pub tolerance: f64,
    /// Variance inflation for approximate diffuse treatment.
    pub kappa: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            method: FilterMethod::Conventional,
            diffuse: DiffuseMethod::Exact,
            timing: FilterTiming::Predicted,
            loglikelihood_burn: 0,
            max_diffuse_steps: None,
            tolerance_diffuse: 1e-9,
            tolerance: 1e-12,
            kappa: 1e6,
        }
    }
}

impl FilterConfig {
    pub fn univariate() -> Self {
        Self {
            method: FilterMethod::Univariate,
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: FilterMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_timing(mut self, timing: FilterTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_diffuse(mut self, diffuse: DiffuseMethod) -> Self {
        self.diffuse = diffuse;
        self
    }

    pub fn with_burn(mut self, burn: usize) -> Self {
        self.loglikelihood_burn = burn;
        self
    }
}
