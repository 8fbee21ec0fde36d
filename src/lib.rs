//! Linear Gaussian state space models: Kalman filtering, smoothing and
//! simulation smoothing over a generic scalar type.
//!
//! The filter supports conventional and univariate (observation by
//! observation) updates, missing data, exact and approximate diffuse
//! initialization, and time-varying system matrices. Smoothing produces
//! states, disturbances and their covariances; the simulation smoother
//! draws from their joint conditional distribution given fixed variates.

pub mod error;
pub mod scalar;
pub mod types;
pub mod state_space;
pub mod initialization;
pub mod kalman;
mod univariate;
pub mod smoother;
pub mod simulation;
pub mod tools;
pub mod batch;

#[cfg(feature = "python")]
mod python;

pub use error::{Result, SsmError, Stage};
pub use initialization::Initialization;
pub use kalman::{kalman_filter, FilterResult};
pub use scalar::KalmanScalar;
pub use simulation::{simulate, SimulationResult, SimulationSmoother, SimulationVariates};
pub use smoother::{filter_and_smooth, kalman_smoother, SmootherResult};
pub use state_space::{Observations, StateSpace, StateSpaceBuilder, TimeVarying};
pub use types::{DiffuseMethod, FilterConfig, FilterMethod, FilterTiming};
