//! Landmark-based particle filter localization
//!
//! This crate implements recursive Bayesian localization of a vehicle on a known, static 2-D map using a
//! Sequential Monte Carlo estimator (particle filter). The filter is driven one cycle at a time by a host loop:
//! noisy control inputs (velocity and yaw rate) propagate a population of pose hypotheses, noisy landmark
//! detections expressed in the vehicle frame re-weight them, and resampling concentrates the population on the
//! likely poses. The filter itself does not read telemetry or maps from disk; the [sim] module provides a thin
//! CSV-backed harness for that, and the `pfloc` binary wraps the harness in a command line interface.
//!
//! The crate is primarily built off of the following dependencies:
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Gaussian
//!   noise for initialization and prediction, uniform draws for resampling.
//! - [`rayon`](https://crates.io/crates/rayon): data-parallel prediction and weighting across particles.
//! - [`nalgebra`](https://crates.io/crates/nalgebra): frame rotations and the population covariance.
//!
//! ## Crate overview
//!
//! - [motion]: The velocity/yaw-rate motion model used by the prediction step.
//! - [observation]: Observation frame transforms, nearest-landmark association, and the Gaussian sensor model.
//! - [particle]: The particle filter itself (initialization, prediction, weighting, resampling, state export).
//! - [map]: The static landmark map.
//! - [config]: Serializable filter and simulation configuration (JSON/YAML/TOML).
//! - [sim]: Dataset loading and the closed-loop localization driver.
//! - [error]: The error type shared by every fallible operation.
//!
//! ## Frames and state
//!
//! Poses are expressed in the map frame as $(x, y, \theta)$ with $\theta$ the heading in radians measured
//! counter-clockwise from the map $x$ axis. Observations arrive in the vehicle frame (forward, left) and are
//! rotated by $\theta$ and translated by $(x, y)$ before association:
//!
//! $$
//! \begin{bmatrix} x_m \\\\ y_m \end{bmatrix} =
//! \begin{bmatrix} \cos\theta & -\sin\theta \\\\ \sin\theta & \cos\theta \end{bmatrix}
//! \begin{bmatrix} x_o \\\\ y_o \end{bmatrix} + \begin{bmatrix} x \\\\ y \end{bmatrix}
//! $$
//!
//! Headings are never assumed to be wrapped. Any comparison of two headings goes through [wrap_to_pi].
pub mod config;
pub mod error;
pub mod map;
pub mod motion;
pub mod observation;
pub mod particle;
pub mod sim;

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{self, Display};

pub use error::{FilterError, Result};
pub use map::{Landmark, Map};
pub use motion::ControlInput;
pub use observation::{LandmarkObservation, MeasurementNoise};
pub use particle::{EstimateStrategy, Particle, ParticleFilter, ResamplingStrategy};

/// A planar pose in the map frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Position along the map x axis (m)
    pub x: f64,
    /// Position along the map y axis (m)
    pub y: f64,
    /// Heading (rad), counter-clockwise from the map x axis
    pub theta: f64,
}
impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose { x, y, theta }
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }
    /// Euclidean distance between the positions of two poses
    pub fn distance(&self, other: &Pose) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
    /// Heading difference `self - other` wrapped to [-π, π)
    pub fn heading_error(&self, other: &Pose) -> f64 {
        wrap_to_pi(self.theta - other.theta)
    }
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4}, {:.4} rad)", self.x, self.y, self.theta)
    }
}

/// Per-axis standard deviations of a pose, used for both the initial pose
/// uncertainty and the process noise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseStd {
    /// Standard deviation along x (m)
    pub x: f64,
    /// Standard deviation along y (m)
    pub y: f64,
    /// Standard deviation of the heading (rad)
    pub theta: f64,
}
impl PoseStd {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        PoseStd { x, y, theta }
    }
    /// Zero noise on every axis
    pub fn zero() -> Self {
        PoseStd::default()
    }
    pub(crate) fn validate(&self, what: &str) -> Result<()> {
        error::require_non_negative(&format!("{what} std x"), self.x)?;
        error::require_non_negative(&format!("{what} std y"), self.y)?;
        error::require_non_negative(&format!("{what} std theta"), self.theta)
    }
}

/// Wrap an angle to the range [-π, π) radians
///
/// # Example
/// ```rust
/// use pfloc::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    (angle + PI).rem_euclid(2.0 * PI) - PI
}
