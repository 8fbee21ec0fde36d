//! Helpers for the code that builds representations: companion matrices,
//! differencing and the Monahan (1984) stationarity transform.

use nalgebra::DMatrix;

use crate::error::{Result, SsmError};

/// Companion matrix of a lag polynomial `1 + p_1 L + ... + p_n L^n`.
///
/// `polynomial` holds `[p_0, p_1, ..., p_n]` with `p_0 != 0`. The result is
/// `n x n` with ones on the superdiagonal and first column `-p[1..] / p_0`,
/// i.e. the transition matrix of an AR(n) in state space form.
pub fn companion_matrix(polynomial: &[f64]) -> Result<DMatrix<f64>> {
    if polynomial.len() < 2 {
        return Err(SsmError::Configuration(format!(
            "companion matrix needs a polynomial of degree >= 1, got {} coefficients",
            polynomial.len()
        )));
    }
    let lead = polynomial[0];
    if lead == 0.0 {
        return Err(SsmError::Configuration(
            "leading polynomial coefficient must be non-zero".to_string(),
        ));
    }

    let n = polynomial.len() - 1;
    let mut matrix = DMatrix::zeros(n, n);
    for i in 0..n {
        matrix[(i, 0)] = -polynomial[i + 1] / lead;
        if i + 1 < n {
            matrix[(i, i + 1)] = 1.0;
        }
    }
    Ok(matrix)
}

/// Seasonal then simple differencing of a series.
///
/// Applies `(1 - L^k_seasons)^seasonal_diff` followed by `(1 - L)^diff`; the
/// result is shorter by `diff + seasonal_diff * k_seasons` (or empty).
pub fn diff(series: &[f64], diff: usize, seasonal_diff: usize, k_seasons: usize) -> Vec<f64> {
    let mut out = series.to_vec();
    if k_seasons > 0 {
        for _ in 0..seasonal_diff {
            out = lag_difference(&out, k_seasons);
        }
    }
    for _ in 0..diff {
        out = lag_difference(&out, 1);
    }
    out
}

fn lag_difference(x: &[f64], lag: usize) -> Vec<f64> {
    if x.len() <= lag {
        return vec![];
    }
    x[lag..].iter().zip(x.iter()).map(|(a, b)| a - b).collect()
}

// ---------------------------------------------------------------------------
// Monahan (1984) / Jones (1980) parameter transformations
// ---------------------------------------------------------------------------

/// Transform unconstrained parameters to stationary AR coefficients.
///
/// Algorithm:
/// 1. Map each x[k] to a partial autocorrelation `r[k] = x[k] / sqrt(1 + x[k]^2)`
/// 2. Levinson-Durbin recursion to get the AR coefficients
/// 3. Negate the final row: `constrained = -y[n-1][:]`
pub fn constrain_stationary_univariate(unconstrained: &[f64]) -> Vec<f64> {
    let n = unconstrained.len();
    if n == 0 {
        return vec![];
    }

    let pacf: Vec<f64> = unconstrained
        .iter()
        .map(|&x| x / (1.0 + x * x).sqrt())
        .collect();

    let mut y = vec![vec![0.0; n]; n];
    for k in 0..n {
        for i in 0..k {
            y[k][i] = y[k - 1][i] + pacf[k] * y[k - 1][k - i - 1];
        }
        y[k][k] = pacf[k];
    }

    y[n - 1].iter().map(|&v| -v).collect()
}

/// Inverse of [`constrain_stationary_univariate`].
pub fn unconstrain_stationary_univariate(constrained: &[f64]) -> Vec<f64> {
    let n = constrained.len();
    if n == 0 {
        return vec![];
    }

    let mut y = vec![vec![0.0; n]; n];
    for i in 0..n {
        y[n - 1][i] = -constrained[i];
    }

    for k in (1..n).rev() {
        let rk = y[k][k];
        let denom = (1.0 - rk * rk).max(1e-15);
        for i in 0..k {
            y[k - 1][i] = (y[k][i] - rk * y[k][k - i - 1]) / denom;
        }
    }

    (0..n)
        .map(|k| {
            let r = y[k][k];
            r / (1.0 - r * r).max(1e-15).sqrt()
        })
        .collect()
}

/// True when every eigenvalue of the companion matrix of `polynomial` lies
/// strictly inside a circle of radius `threshold` (1 for invertibility).
pub fn is_invertible(polynomial: &[f64], threshold: f64) -> Result<bool> {
    let companion = companion_matrix(polynomial)?;
    Ok(companion
        .complex_eigenvalues()
        .iter()
        .all(|ev| ev.norm() < threshold))
}
