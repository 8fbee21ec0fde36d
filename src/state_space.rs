use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SsmError};
use crate::scalar::KalmanScalar;

/// A system matrix (or vector) that is either fixed or indexed by time.
///
/// Recursions only ever call [`TimeVarying::at`], so they never branch on
/// which case applies.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeVarying<M> {
    Invariant(M),
    Varying(Vec<M>),
}

impl<M> TimeVarying<M> {
    /// The value in force at time `t`.
    pub fn at(&self, t: usize) -> &M {
        match self {
            TimeVarying::Invariant(m) => m,
            TimeVarying::Varying(v) => &v[t],
        }
    }

    pub fn is_time_varying(&self) -> bool {
        matches!(self, TimeVarying::Varying(_))
    }

    fn values(&self) -> &[M] {
        match self {
            TimeVarying::Invariant(m) => std::slice::from_ref(m),
            TimeVarying::Varying(v) => v,
        }
    }

    /// A one-element sequence is the same as a fixed value.
    fn normalized(self) -> Self {
        match self {
            TimeVarying::Varying(mut v) if v.len() == 1 => {
                TimeVarying::Invariant(v.swap_remove(0))
            }
            other => other,
        }
    }
}

impl<T: KalmanScalar> From<DMatrix<T>> for TimeVarying<DMatrix<T>> {
    fn from(m: DMatrix<T>) -> Self {
        TimeVarying::Invariant(m)
    }
}

impl<T: KalmanScalar> From<Vec<DMatrix<T>>> for TimeVarying<DMatrix<T>> {
    fn from(v: Vec<DMatrix<T>>) -> Self {
        TimeVarying::Varying(v)
    }
}

impl<T: KalmanScalar> From<DVector<T>> for TimeVarying<DVector<T>> {
    fn from(v: DVector<T>) -> Self {
        TimeVarying::Invariant(v)
    }
}

impl<T: KalmanScalar> From<Vec<DVector<T>>> for TimeVarying<DVector<T>> {
    fn from(v: Vec<DVector<T>>) -> Self {
        TimeVarying::Varying(v)
    }
}

impl<T: KalmanScalar> TimeVarying<DMatrix<T>> {
    /// Build a matrix from an array given by its `shape` and an element
    /// accessor `f(row, col, t)`.
    ///
    /// The shape must be `(nrows, ncols)` or `(nrows, ncols, n)` with `n`
    /// either 1 or `nobs`; see [`validate_matrix_shape`].
    pub fn matrix_from_array<F>(
        name: &str,
        shape: &[usize],
        nrows: usize,
        ncols: usize,
        nobs: Option<usize>,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(usize, usize, usize) -> T,
    {
        validate_matrix_shape(name, shape, nrows, ncols, nobs)?;
        let n = if shape.len() == 3 { shape[2] } else { 1 };
        let mats: Vec<DMatrix<T>> = (0..n)
            .map(|t| DMatrix::from_fn(nrows, ncols, |i, j| f(i, j, t)))
            .collect();
        Ok(TimeVarying::Varying(mats).normalized())
    }
}

impl<T: KalmanScalar> TimeVarying<DVector<T>> {
    /// Build a vector from an array given by its `shape` and an element
    /// accessor `f(row, t)`; see [`validate_vector_shape`].
    pub fn vector_from_array<F>(
        name: &str,
        shape: &[usize],
        nrows: usize,
        nobs: Option<usize>,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(usize, usize) -> T,
    {
        validate_vector_shape(name, shape, nrows, nobs)?;
        let n = if shape.len() == 2 { shape[1] } else { 1 };
        let vecs: Vec<DVector<T>> = (0..n)
            .map(|t| DVector::from_fn(nrows, |i, _| f(i, t)))
            .collect();
        Ok(TimeVarying::Varying(vecs).normalized())
    }
}

/// Check the shape of a (possibly time-varying) matrix array.
///
/// Accepts `(nrows, ncols)` and, when `nobs` is known, `(nrows, ncols, 1)`
/// or `(nrows, ncols, nobs)`. Anything else is an error naming `name`.
pub fn validate_matrix_shape(
    name: &str,
    shape: &[usize],
    nrows: usize,
    ncols: usize,
    nobs: Option<usize>,
) -> Result<()> {
    let expected = match nobs {
        Some(n) => format!("({nrows}, {ncols}) or ({nrows}, {ncols}, 1|{n})"),
        None => format!("({nrows}, {ncols})"),
    };
    let bad = || SsmError::shape(name, &expected, shape);

    match shape.len() {
        2 | 3 => {}
        _ => return Err(bad()),
    }
    if shape[0] != nrows || shape[1] != ncols {
        return Err(bad());
    }
    if shape.len() == 3 {
        match nobs {
            Some(n) if shape[2] == n || shape[2] == 1 => {}
            _ => return Err(bad()),
        }
    }
    Ok(())
}

/// Check the shape of a (possibly time-varying) vector array.
///
/// Accepts `(nrows,)` and, when `nobs` is known, `(nrows, 1)` or
/// `(nrows, nobs)`.
pub fn validate_vector_shape(
    name: &str,
    shape: &[usize],
    nrows: usize,
    nobs: Option<usize>,
) -> Result<()> {
    let expected = match nobs {
        Some(n) => format!("({nrows},) or ({nrows}, 1|{n})"),
        None => format!("({nrows},)"),
    };
    let bad = || SsmError::shape(name, &expected, shape);

    match shape.len() {
        1 | 2 => {}
        _ => return Err(bad()),
    }
    if shape[0] != nrows {
        return Err(bad());
    }
    if shape.len() == 2 {
        match nobs {
            Some(n) if shape[1] == n || shape[1] == 1 => {}
            _ => return Err(bad()),
        }
    }
    Ok(())
}

/// Linear Gaussian state space representation.
///
/// State equation:  alpha_{t+1} = T_t * alpha_t + c_t + R_t * eta_t
/// Observation:     y_t         = Z_t * alpha_t + d_t + eps_t
///
/// where eta_t ~ N(0, Q_t), eps_t ~ N(0, H_t). Every matrix is validated
/// against `(k_endog, k_states, k_posdef, nobs)` when the representation is
/// built; after that it is read-only.
#[derive(Debug, Clone)]
pub struct StateSpace<T: KalmanScalar> {
    pub k_endog: usize,
    pub k_states: usize,
    pub k_posdef: usize,
    pub nobs: usize,
    design: TimeVarying<DMatrix<T>>,          // Z: k_endog × k_states
    obs_intercept: TimeVarying<DVector<T>>,   // d: k_endog
    obs_cov: TimeVarying<DMatrix<T>>,         // H: k_endog × k_endog
    transition: TimeVarying<DMatrix<T>>,      // T: k_states × k_states
    state_intercept: TimeVarying<DVector<T>>, // c: k_states
    selection: TimeVarying<DMatrix<T>>,       // R: k_states × k_posdef
    state_cov: TimeVarying<DMatrix<T>>,       // Q: k_posdef × k_posdef
    selected_state_cov: TimeVarying<DMatrix<T>>, // R Q R'
}

impl<T: KalmanScalar> StateSpace<T> {
    pub fn builder(
        k_endog: usize,
        k_states: usize,
        k_posdef: usize,
        nobs: usize,
    ) -> StateSpaceBuilder<T> {
        StateSpaceBuilder {
            k_endog,
            k_states,
            k_posdef,
            nobs,
            design: None,
            obs_intercept: None,
            obs_cov: None,
            transition: None,
            state_intercept: None,
            selection: None,
            state_cov: None,
        }
    }

    pub fn design(&self, t: usize) -> &DMatrix<T> {
        self.design.at(t)
    }

    pub fn obs_intercept(&self, t: usize) -> &DVector<T> {
        self.obs_intercept.at(t)
    }

    pub fn obs_cov(&self, t: usize) -> &DMatrix<T> {
        self.obs_cov.at(t)
    }

    pub fn transition(&self, t: usize) -> &DMatrix<T> {
        self.transition.at(t)
    }

    pub fn state_intercept(&self, t: usize) -> &DVector<T> {
        self.state_intercept.at(t)
    }

    pub fn selection(&self, t: usize) -> &DMatrix<T> {
        self.selection.at(t)
    }

    pub fn state_cov(&self, t: usize) -> &DMatrix<T> {
        self.state_cov.at(t)
    }

    /// `R_t Q_t R_t'`.
    pub fn selected_state_cov(&self, t: usize) -> &DMatrix<T> {
        self.selected_state_cov.at(t)
    }

    /// True when no system matrix varies over time.
    pub fn is_time_invariant(&self) -> bool {
        !(self.design.is_time_varying()
            || self.obs_intercept.is_time_varying()
            || self.obs_cov.is_time_varying()
            || self.transition.is_time_varying()
            || self.state_intercept.is_time_varying()
            || self.selection.is_time_varying()
            || self.state_cov.is_time_varying())
    }
}

/// Collects system matrices and validates them all in [`StateSpaceBuilder::build`].
///
/// Matrices that are never set default to time-invariant zeros.
#[derive(Debug, Clone)]
pub struct StateSpaceBuilder<T: KalmanScalar> {
    k_endog: usize,
    k_states: usize,
    k_posdef: usize,
    nobs: usize,
    design: Option<TimeVarying<DMatrix<T>>>,
    obs_intercept: Option<TimeVarying<DVector<T>>>,
    obs_cov: Option<TimeVarying<DMatrix<T>>>,
    transition: Option<TimeVarying<DMatrix<T>>>,
    state_intercept: Option<TimeVarying<DVector<T>>>,
    selection: Option<TimeVarying<DMatrix<T>>>,
    state_cov: Option<TimeVarying<DMatrix<T>>>,
}

impl<T: KalmanScalar> StateSpaceBuilder<T> {
    pub fn design(mut self, m: impl Into<TimeVarying<DMatrix<T>>>) -> Self {
        self.design = Some(m.into());
        self
    }

    pub fn obs_intercept(mut self, v: impl Into<TimeVarying<DVector<T>>>) -> Self {
        self.obs_intercept = Some(v.into());
        self
    }

    pub fn obs_cov(mut self, m: impl Into<TimeVarying<DMatrix<T>>>) -> Self {
        self.obs_cov = Some(m.into());
        self
    }

    pub fn transition(mut self, m: impl Into<TimeVarying<DMatrix<T>>>) -> Self {
        self.transition = Some(m.into());
        self
    }

    pub fn state_intercept(mut self, v: impl Into<TimeVarying<DVector<T>>>) -> Self {
        self.state_intercept = Some(v.into());
        self
    }

    pub fn selection(mut self, m: impl Into<TimeVarying<DMatrix<T>>>) -> Self {
        self.selection = Some(m.into());
        self
    }

    pub fn state_cov(mut self, m: impl Into<TimeVarying<DMatrix<T>>>) -> Self {
        self.state_cov = Some(m.into());
        self
    }

    /// Validate every shape and assemble the representation.
    pub fn build(self) -> Result<StateSpace<T>> {
        let (p, m, r, n) = (self.k_endog, self.k_states, self.k_posdef, self.nobs);

        if p == 0 || m == 0 {
            return Err(SsmError::Configuration(format!(
                "k_endog and k_states must be positive, got k_endog={}, k_states={}",
                p, m
            )));
        }
        if r > m {
            return Err(SsmError::Configuration(format!(
                "k_posdef={} exceeds k_states={}",
                r, m
            )));
        }

        let design = matrix_or_zeros(self.design, p, m);
        let obs_intercept = vector_or_zeros(self.obs_intercept, p);
        let obs_cov = matrix_or_zeros(self.obs_cov, p, p);
        let transition = matrix_or_zeros(self.transition, m, m);
        let state_intercept = vector_or_zeros(self.state_intercept, m);
        let selection = matrix_or_zeros(self.selection, m, r);
        let state_cov = matrix_or_zeros(self.state_cov, r, r);

        check_matrix("design", &design, p, m, n)?;
        check_vector("obs_intercept", &obs_intercept, p, n)?;
        check_matrix("obs_cov", &obs_cov, p, p, n)?;
        check_matrix("transition", &transition, m, m, n)?;
        check_vector("state_intercept", &state_intercept, m, n)?;
        check_matrix("selection", &selection, m, r, n)?;
        check_matrix("state_cov", &state_cov, r, r, n)?;

        let selected_state_cov = match (&selection, &state_cov) {
            (TimeVarying::Invariant(rm), TimeVarying::Invariant(q)) => {
                TimeVarying::Invariant(rm * q * rm.transpose())
            }
            _ => TimeVarying::Varying(
                (0..n)
                    .map(|t| selection.at(t) * state_cov.at(t) * selection.at(t).transpose())
                    .collect(),
            ),
        };

        Ok(StateSpace {
            k_endog: p,
            k_states: m,
            k_posdef: r,
            nobs: n,
            design,
            obs_intercept,
            obs_cov,
            transition,
            state_intercept,
            selection,
            state_cov,
            selected_state_cov,
        })
    }
}

fn matrix_or_zeros<T: KalmanScalar>(
    m: Option<TimeVarying<DMatrix<T>>>,
    nrows: usize,
    ncols: usize,
) -> TimeVarying<DMatrix<T>> {
    m.map(TimeVarying::normalized)
        .unwrap_or_else(|| TimeVarying::Invariant(DMatrix::zeros(nrows, ncols)))
}

fn vector_or_zeros<T: KalmanScalar>(
    v: Option<TimeVarying<DVector<T>>>,
    nrows: usize,
) -> TimeVarying<DVector<T>> {
    v.map(TimeVarying::normalized)
        .unwrap_or_else(|| TimeVarying::Invariant(DVector::zeros(nrows)))
}

fn check_length<M>(name: &str, tv: &TimeVarying<M>, nobs: usize) -> Result<()> {
    if let TimeVarying::Varying(v) = tv {
        if v.is_empty() {
            return Err(SsmError::shape(name, "at least 1 time step", 0));
        }
        if v.len() != nobs {
            return Err(SsmError::shape(
                name,
                format!("1 or {} time steps", nobs),
                v.len(),
            ));
        }
    }
    Ok(())
}

fn check_matrix<T: KalmanScalar>(
    name: &str,
    tv: &TimeVarying<DMatrix<T>>,
    nrows: usize,
    ncols: usize,
    nobs: usize,
) -> Result<()> {
    check_length(name, tv, nobs)?;
    for (t, m) in tv.values().iter().enumerate() {
        if m.nrows() != nrows || m.ncols() != ncols {
            let label = if tv.is_time_varying() {
                format!("{}[t={}]", name, t)
            } else {
                name.to_string()
            };
            return Err(SsmError::shape(
                &label,
                format!("{}x{}", nrows, ncols),
                (m.nrows(), m.ncols()),
            ));
        }
    }
    Ok(())
}

fn check_vector<T: KalmanScalar>(
    name: &str,
    tv: &TimeVarying<DVector<T>>,
    nrows: usize,
    nobs: usize,
) -> Result<()> {
    check_length(name, tv, nobs)?;
    for (t, v) in tv.values().iter().enumerate() {
        if v.len() != nrows {
            let label = if tv.is_time_varying() {
                format!("{}[t={}]", name, t)
            } else {
                name.to_string()
            };
            return Err(SsmError::shape(&label, nrows, v.len()));
        }
    }
    Ok(())
}

/// Observed data `(k_endog × nobs)` with an explicit missing-value mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations<T: KalmanScalar> {
    values: DMatrix<T>,
    missing: DMatrix<bool>,
}

impl<T: KalmanScalar> Observations<T> {
    /// Pair values with a mask of the same shape; `true` marks a missing entry.
    pub fn new(values: DMatrix<T>, missing: DMatrix<bool>) -> Result<Self> {
        if values.shape() != missing.shape() {
            return Err(SsmError::shape(
                "missing",
                format!("{}x{}", values.nrows(), values.ncols()),
                missing.shape(),
            ));
        }
        Ok(Self { values, missing })
    }

    /// Treat NaN entries as missing.
    pub fn from_nan(values: DMatrix<T>) -> Self {
        let missing = values.map(crate::scalar::is_nan);
        Self { values, missing }
    }

    pub fn fully_observed(values: DMatrix<T>) -> Self {
        let missing = DMatrix::from_element(values.nrows(), values.ncols(), false);
        Self { values, missing }
    }

    /// One series per row, one time step per column.
    pub fn from_rows(rows: &[Vec<T>]) -> Result<Self> {
        let k_endog = rows.len();
        let nobs = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != nobs) {
            return Err(SsmError::LengthMismatch {
                what: "observation series",
                expected: nobs,
                got: bad.len(),
            });
        }
        Ok(Self::from_nan(DMatrix::from_fn(k_endog, nobs, |i, t| rows[i][t])))
    }

    pub fn k_endog(&self) -> usize {
        self.values.nrows()
    }

    pub fn nobs(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &DMatrix<T> {
        &self.values
    }

    pub fn missing(&self) -> &DMatrix<bool> {
        &self.missing
    }

    pub fn is_missing(&self, i: usize, t: usize) -> bool {
        self.missing[(i, t)]
    }

    pub fn column(&self, t: usize) -> DVector<T> {
        self.values.column(t).into_owned()
    }

    /// Indices of the observed coordinates at time `t`.
    pub fn observed_indices(&self, t: usize) -> Vec<usize> {
        observed_indices(&self.missing, t)
    }

    pub fn nmissing(&self, t: usize) -> usize {
        self.missing.column(t).iter().filter(|&&m| m).count()
    }
}

pub(crate) fn observed_indices(missing: &DMatrix<bool>, t: usize) -> Vec<usize> {
    missing
        .column(t)
        .iter()
        .enumerate()
        .filter(|(_, &m)| !m)
        .map(|(i, _)| i)
        .collect()
}
