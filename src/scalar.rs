//! Numeric working types and the small dense helpers the recursions share.
//!
//! Every recursion is generic over [`KalmanScalar`], implemented for `f32`,
//! `f64`, `Complex<f32>` and `Complex<f64>`. Complex instantiations exist for
//! complex-step differentiation of the likelihood, so all transposes are
//! plain transposes and covariance blocks are complex *symmetric*, never
//! Hermitian.

use nalgebra::{Cholesky, Complex, ComplexField, DMatrix, DVector, Dyn, LU};

use crate::error::{SsmError, Stage};

/// Scalar type a filter, smoother or simulation smoother runs in.
pub trait KalmanScalar: ComplexField + Copy {
    /// Factor a symmetric covariance block.
    ///
    /// Real types use a Cholesky factorization and reject matrices that are
    /// not positive definite; complex types use LU and reject singular ones.
    fn factor(m: DMatrix<Self>) -> Option<Factor<Self>>;

    /// Error reported when [`KalmanScalar::factor`] rejects a matrix.
    fn factor_error(stage: Stage, time: usize, matrix: &'static str) -> SsmError;

    /// Real part as `f64`, used for tolerance and sign decisions.
    fn real_part(self) -> f64;
}

macro_rules! impl_real_scalar {
    ($t:ty) => {
        impl KalmanScalar for $t {
            fn factor(m: DMatrix<Self>) -> Option<Factor<Self>> {
                Cholesky::new(m).map(Factor::Cholesky)
            }

            fn factor_error(stage: Stage, time: usize, matrix: &'static str) -> SsmError {
                SsmError::NotPositiveDefinite { stage, time, matrix }
            }

            fn real_part(self) -> f64 {
                self as f64
            }
        }
    };
}

macro_rules! impl_complex_scalar {
    ($t:ty) => {
        impl KalmanScalar for Complex<$t> {
            fn factor(m: DMatrix<Self>) -> Option<Factor<Self>> {
                let lu = LU::new(m);
                let inverse = lu.try_inverse()?;
                Some(Factor::Lu { lu, inverse })
            }

            fn factor_error(stage: Stage, time: usize, matrix: &'static str) -> SsmError {
                SsmError::Singular { stage, time, matrix }
            }

            fn real_part(self) -> f64 {
                self.re as f64
            }
        }
    };
}

impl_real_scalar!(f32);
impl_real_scalar!(f64);
impl_complex_scalar!(f32);
impl_complex_scalar!(f64);

/// Factorization of a forecast error covariance block.
pub enum Factor<T: KalmanScalar> {
    Cholesky(Cholesky<T, Dyn>),
    Lu {
        lu: LU<T, Dyn, Dyn>,
        inverse: DMatrix<T>,
    },
}

impl<T: KalmanScalar> Factor<T> {
    /// Solve `F X = B`.
    pub fn solve(&self, b: &DMatrix<T>) -> DMatrix<T> {
        match self {
            Factor::Cholesky(chol) => chol.solve(b),
            Factor::Lu { inverse, .. } => inverse * b,
        }
    }

    /// Solve `F x = b`.
    pub fn solve_vector(&self, b: &DVector<T>) -> DVector<T> {
        match self {
            Factor::Cholesky(chol) => chol.solve(b),
            Factor::Lu { inverse, .. } => inverse * b,
        }
    }

    /// `F^{-1}`.
    pub fn inverse(&self) -> DMatrix<T> {
        match self {
            Factor::Cholesky(chol) => chol.inverse(),
            Factor::Lu { inverse, .. } => inverse.clone(),
        }
    }

    /// `ln |F|`.
    pub fn ln_det(&self) -> T {
        match self {
            Factor::Cholesky(chol) => {
                let two: T = nalgebra::convert(2.0);
                chol.l_dirty()
                    .diagonal()
                    .iter()
                    .fold(T::zero(), |acc, &d| acc + d.ln() * two)
            }
            Factor::Lu { lu, .. } => lu.determinant().ln(),
        }
    }
}

/// NaN in the working type; marks "not estimated at this step".
pub fn nan<T: KalmanScalar>() -> T {
    nalgebra::convert(f64::NAN)
}

pub fn is_nan<T: KalmanScalar>(x: T) -> bool {
    #[allow(clippy::eq_op)]
    let unequal = x != x;
    unequal
}

/// `ln(2 pi)` in the working type.
pub(crate) fn ln_2pi<T: KalmanScalar>() -> T {
    nalgebra::convert::<f64, T>(std::f64::consts::TAU).ln()
}

pub(crate) fn max_abs<T: KalmanScalar>(m: &DMatrix<T>) -> f64 {
    m.iter().fold(0.0, |acc, &x| acc.max(x.real_part().abs()))
}

pub(crate) fn symmetrize<T: KalmanScalar>(m: &DMatrix<T>) -> DMatrix<T> {
    let half: T = nalgebra::convert(0.5);
    (m + m.transpose()) * half
}

/// True when every off-diagonal entry is exactly zero.
pub(crate) fn is_diagonal<T: KalmanScalar>(m: &DMatrix<T>) -> bool {
    let n = m.nrows();
    (0..n).all(|j| (0..n).all(|i| i == j || m[(i, j)] == T::zero()))
}

/// Unit-lower-triangular LDL' decomposition of a symmetric matrix.
///
/// Pivots with a magnitude below `1e-12` times the largest diagonal entry are
/// treated as zero and their column of `L` is left empty, which is exact for
/// positive semi-definite input.
pub fn ldl<T: KalmanScalar>(m: &DMatrix<T>) -> (DMatrix<T>, DVector<T>) {
    let n = m.nrows();
    let mut l = DMatrix::<T>::identity(n, n);
    let mut d = DVector::<T>::zeros(n);
    let scale = (0..n).fold(0.0f64, |acc, i| acc.max(m[(i, i)].real_part().abs()));
    let tol = 1e-12 * scale.max(f64::MIN_POSITIVE);

    for j in 0..n {
        let mut dj = m[(j, j)];
        for k in 0..j {
            dj -= l[(j, k)] * l[(j, k)] * d[k];
        }
        d[j] = dj;
        if dj.real_part().abs() <= tol {
            d[j] = T::zero();
            continue;
        }
        for i in (j + 1)..n {
            let mut s = m[(i, j)];
            for k in 0..j {
                s -= l[(i, k)] * l[(j, k)] * d[k];
            }
            l[(i, j)] = s / dj;
        }
    }
    (l, d)
}

/// Square root `S` with `S S' = M` of a positive semi-definite matrix.
///
/// Built from the LDL' factors, so singular covariances (fixed states,
/// degenerate disturbances) are accepted. Negative pivots are clipped to 0.
pub fn psd_sqrt<T: KalmanScalar>(m: &DMatrix<T>) -> DMatrix<T> {
    let (mut l, d) = ldl(m);
    for j in 0..d.len() {
        let root = if d[j].real_part() > 0.0 {
            d[j].sqrt()
        } else {
            T::zero()
        };
        let mut col = l.column_mut(j);
        col *= root;
    }
    l
}

/// Solve the discrete Lyapunov equation `P = T P T' + Q`.
///
/// Returns `None` when `I - T (x) T` is singular, i.e. `T` has a root on the
/// unit circle.
pub fn solve_discrete_lyapunov<T: KalmanScalar>(
    transition: &DMatrix<T>,
    q: &DMatrix<T>,
) -> Option<DMatrix<T>> {
    let n = transition.nrows();
    let kron = transition.kronecker(transition);
    let lhs = DMatrix::<T>::identity(n * n, n * n) - kron;
    let rhs = DVector::from_column_slice(q.as_slice());
    let vec_p = LU::new(lhs).solve(&rhs)?;
    if vec_p.iter().any(|x| !x.is_finite()) {
        return None;
    }
    Some(symmetrize(&DMatrix::from_column_slice(n, n, vec_p.as_slice())))
}
