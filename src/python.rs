//! Python bindings (feature `python`).
//!
//! Models are passed as a dict of numpy arrays keyed by matrix name
//! (`design`, `obs_intercept`, `obs_cov`, `transition`, `state_intercept`,
//! `selection`, `state_cov`), each either fixed or with a trailing time axis.
//! `endog` is `(k_endog, nobs)` with NaN marking missing entries.

use nalgebra::{DMatrix, DVector};
use numpy::ndarray::{Array2, Array3};
use numpy::{IntoPyArray, PyReadonlyArrayDyn};
use pyo3::exceptions::{PyArithmeticError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::error::SsmError;
use crate::initialization::Initialization;
use crate::kalman::{kalman_filter, FilterResult};
use crate::simulation::{SimulationSmoother, SimulationVariates};
use crate::smoother::{kalman_smoother, SmootherResult};
use crate::state_space::{
    validate_matrix_shape, validate_vector_shape, Observations, StateSpace, TimeVarying,
};
use crate::types::{DiffuseMethod, FilterConfig, FilterMethod, FilterTiming};

impl From<SsmError> for PyErr {
    fn from(e: SsmError) -> PyErr {
        if e.is_numerical() {
            PyArithmeticError::new_err(e.to_string())
        } else {
            PyValueError::new_err(e.to_string())
        }
    }
}

fn array_arg<'py>(
    dict: &Bound<'py, PyDict>,
    name: &str,
) -> PyResult<Option<PyReadonlyArrayDyn<'py, f64>>> {
    match dict.get_item(name)? {
        Some(obj) => Ok(Some(obj.extract()?)),
        None => Ok(None),
    }
}

fn matrix_arg(
    model: &Bound<'_, PyDict>,
    name: &str,
    nrows: usize,
    ncols: usize,
    nobs: usize,
) -> PyResult<Option<TimeVarying<DMatrix<f64>>>> {
    let Some(arr) = array_arg(model, name)? else {
        return Ok(None);
    };
    let view = arr.as_array();
    let timed = view.ndim() == 3;
    let tv = TimeVarying::matrix_from_array(name, view.shape(), nrows, ncols, Some(nobs), |i, j, t| {
        if timed {
            view[&[i, j, t][..]]
        } else {
            view[&[i, j][..]]
        }
    })?;
    Ok(Some(tv))
}

fn vector_arg(
    model: &Bound<'_, PyDict>,
    name: &str,
    nrows: usize,
    nobs: usize,
) -> PyResult<Option<TimeVarying<DVector<f64>>>> {
    let Some(arr) = array_arg(model, name)? else {
        return Ok(None);
    };
    let view = arr.as_array();
    let timed = view.ndim() == 2;
    let tv = TimeVarying::vector_from_array(name, view.shape(), nrows, Some(nobs), |i, t| {
        if timed {
            view[&[i, t][..]]
        } else {
            view[&[i][..]]
        }
    })?;
    Ok(Some(tv))
}

fn leading_dim(model: &Bound<'_, PyDict>, name: &str, axis: usize) -> PyResult<usize> {
    let arr = array_arg(model, name)?
        .ok_or_else(|| PyValueError::new_err(format!("model is missing '{}'", name)))?;
    arr.as_array()
        .shape()
        .get(axis)
        .copied()
        .ok_or_else(|| PyValueError::new_err(format!("'{}' has too few dimensions", name)))
}

fn build_observations(endog: &PyReadonlyArrayDyn<'_, f64>) -> PyResult<Observations<f64>> {
    let view = endog.as_array();
    let values = match view.ndim() {
        1 => DMatrix::from_fn(1, view.len(), |_, t| view[&[t][..]]),
        2 => DMatrix::from_fn(view.shape()[0], view.shape()[1], |i, t| view[&[i, t][..]]),
        _ => return Err(SsmError::shape("endog", "(nobs,) or (k_endog, nobs)", view.shape()).into()),
    };
    Ok(Observations::from_nan(values))
}

fn build_model(model: &Bound<'_, PyDict>, k_endog: usize, nobs: usize) -> PyResult<StateSpace<f64>> {
    let k_states = leading_dim(model, "transition", 0)?;
    let k_posdef = if model.contains("state_cov")? {
        leading_dim(model, "state_cov", 0)?
    } else {
        k_states
    };

    let mut builder = StateSpace::builder(k_endog, k_states, k_posdef, nobs);
    if let Some(m) = matrix_arg(model, "design", k_endog, k_states, nobs)? {
        builder = builder.design(m);
    }
    if let Some(v) = vector_arg(model, "obs_intercept", k_endog, nobs)? {
        builder = builder.obs_intercept(v);
    }
    if let Some(m) = matrix_arg(model, "obs_cov", k_endog, k_endog, nobs)? {
        builder = builder.obs_cov(m);
    }
    if let Some(m) = matrix_arg(model, "transition", k_states, k_states, nobs)? {
        builder = builder.transition(m);
    }
    if let Some(v) = vector_arg(model, "state_intercept", k_states, nobs)? {
        builder = builder.state_intercept(v);
    }
    if let Some(m) = matrix_arg(model, "selection", k_states, k_posdef, nobs)? {
        builder = builder.selection(m);
    }
    if let Some(m) = matrix_arg(model, "state_cov", k_posdef, k_posdef, nobs)? {
        builder = builder.state_cov(m);
    }
    Ok(builder.build()?)
}

/// `None` means exact diffuse; otherwise keys `constant`, `stationary_cov`
/// and optionally `diffuse_cov`.
fn build_initialization(
    init: Option<&Bound<'_, PyDict>>,
    k_states: usize,
) -> PyResult<Initialization<f64>> {
    let Some(init) = init else {
        return Ok(Initialization::diffuse(k_states));
    };
    let square = |name: &str| -> PyResult<DMatrix<f64>> {
        match array_arg(init, name)? {
            Some(arr) => {
                let view = arr.as_array();
                validate_matrix_shape(name, view.shape(), k_states, k_states, None)?;
                Ok(DMatrix::from_fn(k_states, k_states, |i, j| view[&[i, j][..]]))
            }
            None => Ok(DMatrix::zeros(k_states, k_states)),
        }
    };
    let constant = match array_arg(init, "constant")? {
        Some(arr) => {
            let view = arr.as_array();
            validate_vector_shape("constant", view.shape(), k_states, None)?;
            DVector::from_fn(k_states, |i, _| view[&[i][..]])
        }
        None => DVector::zeros(k_states),
    };
    Ok(Initialization::mixed(
        constant,
        square("stationary_cov")?,
        square("diffuse_cov")?,
    )?)
}

fn build_config(
    method: &str,
    diffuse: &str,
    timing: &str,
    kappa: f64,
    loglikelihood_burn: usize,
) -> PyResult<FilterConfig> {
    let method = match method {
        "conventional" => FilterMethod::Conventional,
        "univariate" => FilterMethod::Univariate,
        other => return Err(PyValueError::new_err(format!("unknown filter method '{}'", other))),
    };
    let diffuse = match diffuse {
        "exact" => DiffuseMethod::Exact,
        "approximate" => DiffuseMethod::Approximate,
        other => return Err(PyValueError::new_err(format!("unknown diffuse method '{}'", other))),
    };
    let timing = match timing {
        "predicted" => FilterTiming::Predicted,
        "filtered" => FilterTiming::Filtered,
        other => return Err(PyValueError::new_err(format!("unknown timing '{}'", other))),
    };
    Ok(FilterConfig {
        method,
        diffuse,
        timing,
        loglikelihood_burn,
        kappa,
        ..Default::default()
    })
}

fn vectors_to_array(v: &[DVector<f64>], rows: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, v.len()), |(i, t)| v[t][i])
}

fn matrices_to_array(m: &[DMatrix<f64>], rows: usize, cols: usize) -> Array3<f64> {
    Array3::from_shape_fn((rows, cols, m.len()), |(i, j, t)| m[t][(i, j)])
}

fn filter_dict<'py>(py: Python<'py>, res: &FilterResult<f64>, dict: &Bound<'py, PyDict>) -> PyResult<()> {
    let (p, m) = (res.k_endog, res.k_states);
    dict.set_item("llf", res.llf())?;
    dict.set_item("llf_obs", res.llf_obs.clone())?;
    dict.set_item("nobs_diffuse", res.nobs_diffuse)?;
    dict.set_item("filter_univariate", res.filter_univariate())?;
    dict.set_item("timing_init_filtered", res.timing_init_filtered())?;
    dict.set_item("predicted_state", vectors_to_array(&res.predicted_state, m).into_pyarray(py))?;
    dict.set_item("predicted_state_cov", matrices_to_array(&res.predicted_state_cov, m, m).into_pyarray(py))?;
    dict.set_item(
        "predicted_diffuse_state_cov",
        matrices_to_array(&res.predicted_diffuse_state_cov, m, m).into_pyarray(py),
    )?;
    dict.set_item("filtered_state", vectors_to_array(&res.filtered_state, m).into_pyarray(py))?;
    dict.set_item("filtered_state_cov", matrices_to_array(&res.filtered_state_cov, m, m).into_pyarray(py))?;
    dict.set_item("forecasts", vectors_to_array(&res.forecasts, p).into_pyarray(py))?;
    dict.set_item("forecasts_error", vectors_to_array(&res.forecasts_error, p).into_pyarray(py))?;
    dict.set_item("forecasts_error_cov", matrices_to_array(&res.forecasts_error_cov, p, p).into_pyarray(py))?;
    dict.set_item(
        "standardized_forecasts_error",
        vectors_to_array(&res.standardized_forecasts_error(), p).into_pyarray(py),
    )?;
    dict.set_item("kalman_gain", matrices_to_array(&res.kalman_gain, m, p).into_pyarray(py))?;
    Ok(())
}

fn smoother_dict<'py>(py: Python<'py>, res: &SmootherResult<f64>, dict: &Bound<'py, PyDict>) -> PyResult<()> {
    filter_dict(py, &res.filter, dict)?;
    let (p, m) = (res.filter.k_endog, res.filter.k_states);
    let r = res.smoothed_state_disturbance.first().map_or(0, |v| v.len());
    dict.set_item("smoothed_state", vectors_to_array(&res.smoothed_state, m).into_pyarray(py))?;
    dict.set_item("smoothed_state_cov", matrices_to_array(&res.smoothed_state_cov, m, m).into_pyarray(py))?;
    dict.set_item("smoothed_forecasts", vectors_to_array(&res.smoothed_forecasts, p).into_pyarray(py))?;
    dict.set_item(
        "smoothed_measurement_disturbance",
        vectors_to_array(&res.smoothed_measurement_disturbance, p).into_pyarray(py),
    )?;
    dict.set_item(
        "smoothed_measurement_disturbance_cov",
        matrices_to_array(&res.smoothed_measurement_disturbance_cov, p, p).into_pyarray(py),
    )?;
    dict.set_item(
        "smoothed_state_disturbance",
        vectors_to_array(&res.smoothed_state_disturbance, r).into_pyarray(py),
    )?;
    dict.set_item(
        "smoothed_state_disturbance_cov",
        matrices_to_array(&res.smoothed_state_disturbance_cov, r, r).into_pyarray(py),
    )?;
    dict.set_item(
        "scaled_smoothed_estimator",
        vectors_to_array(&res.scaled_smoothed_estimator, m).into_pyarray(py),
    )?;
    dict.set_item(
        "scaled_smoothed_estimator_cov",
        matrices_to_array(&res.scaled_smoothed_estimator_cov, m, m).into_pyarray(py),
    )?;
    Ok(())
}

struct Prepared {
    ss: StateSpace<f64>,
    data: Observations<f64>,
    init: Initialization<f64>,
    config: FilterConfig,
}

#[allow(clippy::too_many_arguments)]
fn prepare(
    endog: &PyReadonlyArrayDyn<'_, f64>,
    model: &Bound<'_, PyDict>,
    initialization: Option<&Bound<'_, PyDict>>,
    method: &str,
    diffuse: &str,
    timing: &str,
    kappa: f64,
    loglikelihood_burn: usize,
) -> PyResult<Prepared> {
    let data = build_observations(endog)?;
    let ss = build_model(model, data.k_endog(), data.nobs())?;
    let init = build_initialization(initialization, ss.k_states)?;
    let config = build_config(method, diffuse, timing, kappa, loglikelihood_burn)?;
    Ok(Prepared { ss, data, init, config })
}

/// Smoke-test function: returns the version string.
#[pyfunction]
fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Run the Kalman filter.
///
/// Returns a dict with the predicted/filtered states and covariances,
/// forecasts, forecast errors and their covariances, gains and `llf_obs`.
#[pyfunction]
#[pyo3(signature = (endog, model, initialization=None, method="conventional",
                    diffuse="exact", timing="predicted", kappa=1e6, loglikelihood_burn=0))]
#[allow(clippy::too_many_arguments)]
fn filter<'py>(
    py: Python<'py>,
    endog: PyReadonlyArrayDyn<'py, f64>,
    model: &Bound<'py, PyDict>,
    initialization: Option<&Bound<'py, PyDict>>,
    method: &str,
    diffuse: &str,
    timing: &str,
    kappa: f64,
    loglikelihood_burn: usize,
) -> PyResult<Py<PyDict>> {
    let prep = prepare(&endog, model, initialization, method, diffuse, timing, kappa, loglikelihood_burn)?;
    let res = py.allow_threads(|| kalman_filter(&prep.ss, &prep.data, &prep.init, &prep.config))?;
    let dict = PyDict::new(py);
    filter_dict(py, &res, &dict)?;
    Ok(dict.into())
}

/// Run the Kalman filter and smoother.
#[pyfunction]
#[pyo3(signature = (endog, model, initialization=None, method="conventional",
                    diffuse="exact", timing="predicted", kappa=1e6, loglikelihood_burn=0))]
#[allow(clippy::too_many_arguments)]
fn smooth<'py>(
    py: Python<'py>,
    endog: PyReadonlyArrayDyn<'py, f64>,
    model: &Bound<'py, PyDict>,
    initialization: Option<&Bound<'py, PyDict>>,
    method: &str,
    diffuse: &str,
    timing: &str,
    kappa: f64,
    loglikelihood_burn: usize,
) -> PyResult<Py<PyDict>> {
    let prep = prepare(&endog, model, initialization, method, diffuse, timing, kappa, loglikelihood_burn)?;
    let res = py.allow_threads(|| {
        let filtered = kalman_filter(&prep.ss, &prep.data, &prep.init, &prep.config)?;
        kalman_smoother(&prep.ss, filtered)
    })?;
    let dict = PyDict::new(py);
    smoother_dict(py, &res, &dict)?;
    Ok(dict.into())
}

/// Draw from the conditional distribution of states and disturbances.
///
/// `disturbance_variates` holds `(k_endog + k_posdef) * nobs` standard
/// normals, period by period; `initial_state_variates` holds `k_states`.
#[pyfunction]
#[pyo3(signature = (endog, model, disturbance_variates, initial_state_variates,
                    initialization=None, method="conventional", diffuse="exact",
                    timing="predicted", kappa=1e6))]
#[allow(clippy::too_many_arguments)]
fn simulate<'py>(
    py: Python<'py>,
    endog: PyReadonlyArrayDyn<'py, f64>,
    model: &Bound<'py, PyDict>,
    disturbance_variates: PyReadonlyArrayDyn<'py, f64>,
    initial_state_variates: PyReadonlyArrayDyn<'py, f64>,
    initialization: Option<&Bound<'py, PyDict>>,
    method: &str,
    diffuse: &str,
    timing: &str,
    kappa: f64,
) -> PyResult<Py<PyDict>> {
    let prep = prepare(&endog, model, initialization, method, diffuse, timing, kappa, 0)?;
    let variates = SimulationVariates::from_slices(
        &prep.ss,
        disturbance_variates.as_slice()?,
        initial_state_variates.as_slice()?,
    )?;
    let draw = py.allow_threads(|| {
        let filtered = kalman_filter(&prep.ss, &prep.data, &prep.init, &prep.config)?;
        SimulationSmoother::new(&prep.ss, filtered)?.simulate(&variates)
    })?;

    let (p, m, r) = (prep.ss.k_endog, prep.ss.k_states, prep.ss.k_posdef);
    let dict = PyDict::new(py);
    dict.set_item("simulated_state", vectors_to_array(&draw.simulated_state, m).into_pyarray(py))?;
    dict.set_item(
        "simulated_measurement_disturbance",
        vectors_to_array(&draw.simulated_measurement_disturbance, p).into_pyarray(py),
    )?;
    dict.set_item(
        "simulated_state_disturbance",
        vectors_to_array(&draw.simulated_state_disturbance, r).into_pyarray(py),
    )?;
    dict.set_item(
        "generated_obs",
        Array2::from_shape_fn((p, prep.ss.nobs), |(i, t)| draw.generated_obs[(i, t)]).into_pyarray(py),
    )?;
    dict.set_item("generated_state", vectors_to_array(&draw.generated_state, m).into_pyarray(py))?;
    Ok(dict.into())
}

/// Python module definition.
#[pymodule]
fn ssm_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(version, m)?)?;
    m.add_function(wrap_pyfunction!(filter, m)?)?;
    m.add_function(wrap_pyfunction!(smooth, m)?)?;
    m.add_function(wrap_pyfunction!(simulate, m)?)?;
    Ok(())
}
