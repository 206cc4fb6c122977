//! Observation model: frame transform, landmark association and sensor likelihood
//!
//! Observations arrive in the vehicle frame. For every particle they are moved into the map frame
//! under that particle's own pose hypothesis, matched to their nearest map landmark, and scored with
//! an axis-aligned bivariate Gaussian:
//!
//! $$
//! p(z \mid l) = \frac{1}{2\pi\sigma_x\sigma_y}
//! \exp\left(-\frac{(z_x - l_x)^2}{2\sigma_x^2} - \frac{(z_y - l_y)^2}{2\sigma_y^2}\right)
//! $$
//!
//! The product over many observations underflows quickly, so the particle filter works with the sum
//! of [log_norm_prob] values instead of the raw product.

use nalgebra::{Rotation2, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::Pose;
use crate::error::{self, FilterError, Result};
use crate::map::Landmark;

/// A landmark detection.
///
/// Coordinates are in the vehicle frame (forward, left) as received from sensing and in the map
/// frame after [transform_to_map]. `id` is `None` until the observation has been associated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LandmarkObservation {
    pub id: Option<i32>,
    pub x: f64,
    pub y: f64,
}
impl LandmarkObservation {
    pub fn new(x: f64, y: f64) -> Self {
        LandmarkObservation { id: None, x, y }
    }
}

/// Measurement noise standard deviations of a landmark detection (m)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementNoise {
    pub x: f64,
    pub y: f64,
}
impl Default for MeasurementNoise {
    fn default() -> Self {
        MeasurementNoise { x: 0.3, y: 0.3 }
    }
}
impl MeasurementNoise {
    pub fn new(x: f64, y: f64) -> Self {
        MeasurementNoise { x, y }
    }
    pub(crate) fn validate(&self) -> Result<()> {
        error::require_positive("measurement std x", self.x)?;
        error::require_positive("measurement std y", self.y)
    }
}

/// Rotate a vehicle-frame observation by the pose heading and translate it by the pose position.
pub fn transform_to_map(pose: &Pose, observation: &LandmarkObservation) -> LandmarkObservation {
    let rotated = Rotation2::new(pose.theta) * Vector2::new(observation.x, observation.y);
    LandmarkObservation {
        id: observation.id,
        x: rotated.x + pose.x,
        y: rotated.y + pose.y,
    }
}

/// For every observation, the nearest landmark by Euclidean distance.
///
/// The result is parallel to `observations`. Distance ties go to the landmark that comes first in
/// `landmarks`. An empty observation set yields an empty result; observations without any
/// landmark to match against are rejected.
pub fn associate(
    observations: &[LandmarkObservation],
    landmarks: &[Landmark],
) -> Result<Vec<Landmark>> {
    if observations.is_empty() {
        return Ok(Vec::new());
    }
    if landmarks.is_empty() {
        return Err(FilterError::InvalidInput(format!(
            "cannot associate {} observations against an empty map",
            observations.len()
        )));
    }
    Ok(observations
        .iter()
        .map(|obs| nearest(obs.x, obs.y, landmarks))
        .collect())
}

fn nearest(x: f64, y: f64, landmarks: &[Landmark]) -> Landmark {
    let mut best = landmarks[0];
    let mut best_distance = best.distance_squared(x, y);
    for landmark in &landmarks[1..] {
        let distance = landmark.distance_squared(x, y);
        if distance < best_distance {
            best_distance = distance;
            best = *landmark;
        }
    }
    best
}

/// Label each observation with the id of its nearest predicted landmark, in place.
///
/// Same nearest-neighbour rule and tie-break as [associate]; observations are left unlabelled when
/// `predicted` is empty.
pub fn data_association(predicted: &[Landmark], observations: &mut [LandmarkObservation]) {
    if predicted.is_empty() {
        return;
    }
    for obs in observations.iter_mut() {
        obs.id = Some(nearest(obs.x, obs.y, predicted).id);
    }
}

/// Bivariate Gaussian density of an observation around a landmark with independent axes.
pub fn norm_prob(
    landmark: &Landmark,
    observation: &LandmarkObservation,
    noise: &MeasurementNoise,
) -> f64 {
    log_norm_prob(landmark, observation, noise).exp()
}

/// Natural log of [norm_prob].
pub fn log_norm_prob(
    landmark: &Landmark,
    observation: &LandmarkObservation,
    noise: &MeasurementNoise,
) -> f64 {
    let dx = observation.x - landmark.x;
    let dy = observation.y - landmark.y;
    -dx * dx / (2.0 * noise.x * noise.x)
        - dy * dy / (2.0 * noise.y * noise.y)
        - (2.0 * PI * noise.x * noise.y).ln()
}

/// Everything one weighting pass learns about a single particle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleEvidence {
    /// Sum of the log densities of all observations
    pub log_likelihood: f64,
    /// Associated landmark id per observation
    pub associations: Vec<i32>,
    /// Map-frame x of each observation
    pub sense_x: Vec<f64>,
    /// Map-frame y of each observation
    pub sense_y: Vec<f64>,
}

/// Transform, associate and score an observation set for one pose hypothesis.
///
/// `candidates` is the landmark set the observations may be matched to. An empty observation set
/// yields a log-likelihood of zero (likelihood one).
pub fn evaluate(
    pose: &Pose,
    observations: &[LandmarkObservation],
    candidates: &[Landmark],
    noise: &MeasurementNoise,
) -> Result<ParticleEvidence> {
    let mut sensed: Vec<LandmarkObservation> = observations
        .iter()
        .map(|obs| transform_to_map(pose, obs))
        .collect();
    let predicted = associate(&sensed, candidates)?;
    if predicted.len() != sensed.len() {
        return Err(FilterError::InvalidInput(format!(
            "association produced {} landmarks for {} observations",
            predicted.len(),
            sensed.len()
        )));
    }
    data_association(&predicted, &mut sensed);

    let log_likelihood: f64 = predicted
        .iter()
        .zip(sensed.iter())
        .map(|(landmark, obs)| log_norm_prob(landmark, obs, noise))
        .sum();
    if log_likelihood.is_nan() {
        return Err(FilterError::NumericalInstability(format!(
            "log-likelihood is NaN for pose {pose}"
        )));
    }
    Ok(ParticleEvidence {
        log_likelihood,
        associations: sensed.iter().filter_map(|obs| obs.id).collect(),
        sense_x: sensed.iter().map(|obs| obs.x).collect(),
        sense_y: sensed.iter().map(|obs| obs.y).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::FRAC_PI_2;

    fn two_landmarks() -> Vec<Landmark> {
        vec![Landmark::new(1, 0.0, 0.0), Landmark::new(2, 10.0, 10.0)]
    }

    #[test]
    fn test_transform_translation_only() {
        let pose = Pose::new(5.0, 3.0, 0.0);
        let map_obs = transform_to_map(&pose, &LandmarkObservation::new(0.0, 0.0));
        assert_approx_eq!(map_obs.x, 5.0, 1e-12);
        assert_approx_eq!(map_obs.y, 3.0, 1e-12);
    }

    #[test]
    fn test_transform_rotation() {
        let pose = Pose::new(0.0, 0.0, FRAC_PI_2);
        let map_obs = transform_to_map(&pose, &LandmarkObservation::new(1.0, 0.0));
        assert_approx_eq!(map_obs.x, 0.0, 1e-12);
        assert_approx_eq!(map_obs.y, 1.0, 1e-12);
    }

    #[test]
    fn test_transform_rotation_and_translation() {
        // vehicle at (4, 5) facing -pi/2, landmark 2 m ahead and 1 m to the left
        let pose = Pose::new(4.0, 5.0, -FRAC_PI_2);
        let map_obs = transform_to_map(&pose, &LandmarkObservation::new(2.0, 1.0));
        assert_approx_eq!(map_obs.x, 5.0, 1e-12);
        assert_approx_eq!(map_obs.y, 3.0, 1e-12);
    }

    #[test]
    fn test_association_nearest() {
        let landmarks = two_landmarks();
        let observations = vec![
            LandmarkObservation::new(1.0, 1.0),
            LandmarkObservation::new(9.0, 9.0),
        ];
        let predicted = associate(&observations, &landmarks).unwrap();
        assert_eq!(predicted[0].id, 1);
        assert_eq!(predicted[1].id, 2);
    }

    #[test]
    fn test_association_tie_prefers_first_landmark() {
        let observations = vec![LandmarkObservation::new(5.0, 5.0)];
        let predicted = associate(&observations, &two_landmarks()).unwrap();
        assert_eq!(predicted[0].id, 1);

        let reversed: Vec<Landmark> = two_landmarks().into_iter().rev().collect();
        let predicted = associate(&observations, &reversed).unwrap();
        assert_eq!(predicted[0].id, 2);
    }

    #[test]
    fn test_association_empty_inputs() {
        assert!(associate(&[], &two_landmarks()).unwrap().is_empty());
        assert!(associate(&[], &[]).unwrap().is_empty());
        let result = associate(&[LandmarkObservation::new(1.0, 1.0)], &[]);
        assert!(matches!(result, Err(FilterError::InvalidInput(_))));
    }

    #[test]
    fn test_data_association_labels_in_place() {
        let mut observations = vec![
            LandmarkObservation::new(9.5, 10.2),
            LandmarkObservation::new(-0.3, 0.1),
        ];
        data_association(&two_landmarks(), &mut observations);
        assert_eq!(observations[0].id, Some(2));
        assert_eq!(observations[1].id, Some(1));

        let mut unlabelled = vec![LandmarkObservation::new(1.0, 1.0)];
        data_association(&[], &mut unlabelled);
        assert_eq!(unlabelled[0].id, None);
    }

    #[test]
    fn test_norm_prob_peak() {
        let noise = MeasurementNoise::new(0.3, 0.5);
        let landmark = Landmark::new(1, 2.0, 3.0);
        let obs = LandmarkObservation::new(2.0, 3.0);
        assert_approx_eq!(norm_prob(&landmark, &obs, &noise), 1.0 / (2.0 * PI * 0.3 * 0.5), 1e-12);
    }

    #[test]
    fn test_norm_prob_strictly_decreasing() {
        let noise = MeasurementNoise::new(0.3, 0.3);
        let landmark = Landmark::new(1, 0.0, 0.0);
        let mut previous = f64::INFINITY;
        for i in 0..20 {
            let d = i as f64 * 0.05;
            let p = norm_prob(&landmark, &LandmarkObservation::new(d, d), &noise);
            assert!(p < previous, "density must decrease with distance");
            previous = p;
        }
    }

    #[test]
    fn test_norm_prob_matches_closed_form() {
        let noise = MeasurementNoise::new(0.3, 0.3);
        let landmark = Landmark::new(1, 5.0, 3.0);
        let obs = LandmarkObservation::new(6.0, 3.0);
        let expected = (-1.0_f64 / (2.0 * 0.09)).exp() / (2.0 * PI * 0.09);
        assert_approx_eq!(norm_prob(&landmark, &obs, &noise), expected, 1e-12);
    }

    #[test]
    fn test_log_space_avoids_underflow() {
        let noise = MeasurementNoise::new(0.01, 0.01);
        let landmark = Landmark::new(1, 0.0, 0.0);
        let obs = LandmarkObservation::new(1.0, 1.0);
        assert_eq!(norm_prob(&landmark, &obs, &noise), 0.0);
        let log_p = log_norm_prob(&landmark, &obs, &noise);
        assert!(log_p.is_finite());
        assert!(log_p < -1000.0);
    }

    #[test]
    fn test_evaluate_per_pose() {
        let landmarks = two_landmarks();
        let noise = MeasurementNoise::new(0.3, 0.3);
        let observations = vec![LandmarkObservation::new(1.0, 0.0)];

        // the correct pose sees the landmark exactly where it is
        let good = evaluate(&Pose::new(-1.0, 0.0, 0.0), &observations, &landmarks, &noise).unwrap();
        let bad = evaluate(&Pose::new(-1.5, 0.2, 0.1), &observations, &landmarks, &noise).unwrap();
        assert!(good.log_likelihood > bad.log_likelihood);
        assert_eq!(good.associations, vec![1]);
        assert_approx_eq!(good.sense_x[0], 0.0, 1e-12);
        assert_approx_eq!(good.sense_y[0], 0.0, 1e-12);
        assert_approx_eq!(good.log_likelihood, -(2.0 * PI * 0.09_f64).ln(), 1e-12);
    }

    #[test]
    fn test_evaluate_no_observations() {
        let evidence = evaluate(&Pose::default(), &[], &[], &MeasurementNoise::default()).unwrap();
        assert_eq!(evidence.log_likelihood, 0.0);
        assert!(evidence.associations.is_empty());
    }
}
