//! Velocity / yaw-rate motion model
//!
//! Each particle is propagated with the constant turn rate and velocity (CTRV) model. For a
//! heading $\theta$, speed $v$, yaw rate $\omega$ and time step $\Delta t$:
//!
//! $$
//! \theta' = \theta + \omega \Delta t, \quad
//! x' = x + \frac{v}{\omega}\left(\sin\theta' - \sin\theta\right), \quad
//! y' = y + \frac{v}{\omega}\left(\cos\theta - \cos\theta'\right)
//! $$
//!
//! When $|\omega|$ is below [YAW_RATE_EPSILON] the vehicle drives a straight line instead:
//! $x' = x + v \Delta t \cos\theta$, $y' = y + v \Delta t \sin\theta$. Driving straight is a normal
//! operating condition, so the straight-line branch is a first-class path rather than a guard.
//!
//! Zero-mean Gaussian process noise is added to all three pose components after the deterministic
//! step.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{self, FilterError, Result};
use crate::{Pose, PoseStd};

/// Yaw rates with a magnitude below this threshold (rad/s) use the straight-line model.
pub const YAW_RATE_EPSILON: f64 = 1e-6;

/// Control input applied over one prediction step
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    /// Linear velocity (m/s)
    pub velocity: f64,
    /// Yaw rate (rad/s)
    pub yaw_rate: f64,
}
impl ControlInput {
    pub fn new(velocity: f64, yaw_rate: f64) -> Self {
        ControlInput { velocity, yaw_rate }
    }
    pub(crate) fn validate(&self) -> Result<()> {
        error::require_finite("velocity", self.velocity)?;
        error::require_finite("yaw rate", self.yaw_rate)
    }
}

/// Zero-mean Gaussian noise on each pose component.
///
/// The distributions are built once per prediction step and shared immutably; the random state
/// lives in the generator passed to [ProcessNoise::sample], never in the distribution.
#[derive(Clone, Copy, Debug)]
pub struct ProcessNoise {
    x: Normal<f64>,
    y: Normal<f64>,
    theta: Normal<f64>,
}
impl ProcessNoise {
    pub fn new(std: &PoseStd) -> Result<Self> {
        std.validate("process noise")?;
        let normal = |sigma: f64| {
            Normal::new(0.0, sigma).map_err(|e| FilterError::InvalidInput(e.to_string()))
        };
        Ok(ProcessNoise {
            x: normal(std.x)?,
            y: normal(std.y)?,
            theta: normal(std.theta)?,
        })
    }
    /// Draw one independent `(dx, dy, dtheta)` perturbation.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> (f64, f64, f64) {
        (
            self.x.sample(rng),
            self.y.sample(rng),
            self.theta.sample(rng),
        )
    }
}

/// Deterministic part of the motion model.
pub fn step(pose: &Pose, dt: f64, control: &ControlInput) -> Pose {
    let ControlInput { velocity, yaw_rate } = *control;
    if yaw_rate.abs() < YAW_RATE_EPSILON {
        Pose {
            x: pose.x + velocity * dt * pose.theta.cos(),
            y: pose.y + velocity * dt * pose.theta.sin(),
            theta: pose.theta,
        }
    } else {
        let theta = pose.theta + yaw_rate * dt;
        Pose {
            x: pose.x + velocity / yaw_rate * (theta.sin() - pose.theta.sin()),
            y: pose.y + velocity / yaw_rate * (pose.theta.cos() - theta.cos()),
            theta,
        }
    }
}

/// Propagate a pose through the motion model and add one fresh draw of process noise.
///
/// Returns `NumericalInstability` if the propagated pose is not finite; the input pose is left
/// untouched in that case.
pub fn propagate<R: Rng + ?Sized>(
    pose: &mut Pose,
    dt: f64,
    control: &ControlInput,
    noise: &ProcessNoise,
    rng: &mut R,
) -> Result<()> {
    let mut next = step(pose, dt, control);
    let (dx, dy, dtheta) = noise.sample(rng);
    next.x += dx;
    next.y += dy;
    next.theta += dtheta;
    if !next.is_finite() {
        return Err(FilterError::NumericalInstability(format!(
            "motion update produced non-finite pose {next} from {pose}"
        )));
    }
    *pose = next;
    Ok(())
}
