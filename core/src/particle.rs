//! Landmark particle filter
//!
//! [ParticleFilter] owns a fixed-size population of pose hypotheses and runs the estimation cycle
//! `predict` → `update_weights` → `resample`. Prediction and weighting are independent per particle
//! and run on the rayon thread pool. Each particle draws its noise from its own generator, seeded
//! from the filter's master generator in a sequential phase, so a seeded filter produces the same
//! population regardless of the number of worker threads. Resampling is sequential and closes the
//! cycle.
//!
//! Weights are reset at the start of every weighting pass: the weight of a particle reflects only
//! the evidence of the most recent observation set. The pass is computed in log space and the
//! weights are scaled so that the most likely particle has weight one.
//!
//! Every step is all-or-nothing: if any particle fails, the population is left as it was before
//! the call and the error is returned.

use log::{debug, trace, warn};
use nalgebra::Matrix3;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{self, Debug, Display};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use crate::config::FilterConfig;
use crate::error::{self, FilterError, Result};
use crate::map::{Landmark, Map};
use crate::motion::{self, ControlInput, ProcessNoise};
use crate::observation::{self, LandmarkObservation, MeasurementNoise, ParticleEvidence};
use crate::{Pose, PoseStd, wrap_to_pi};

/// A weighted pose hypothesis
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Particle {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub weight: f64,
    /// Log-likelihood of the most recent observation set
    pub log_likelihood: f64,
    /// Landmark id matched to each observation in the most recent weighting pass
    pub associations: Vec<i32>,
    /// Map-frame x of each observation in the most recent weighting pass
    pub sense_x: Vec<f64>,
    /// Map-frame y of each observation in the most recent weighting pass
    pub sense_y: Vec<f64>,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("theta", &self.theta)
            .field("weight", &self.weight)
            .field("associations", &self.associations)
            .finish()
    }
}
impl Particle {
    pub fn new(id: usize, pose: Pose, weight: f64) -> Particle {
        Particle {
            id,
            x: pose.x,
            y: pose.y,
            theta: pose.theta,
            weight,
            ..Default::default()
        }
    }
    pub fn pose(&self) -> Pose {
        Pose::new(self.x, self.y, self.theta)
    }
    pub fn set_pose(&mut self, pose: Pose) {
        self.x = pose.x;
        self.y = pose.y;
        self.theta = pose.theta;
    }
    fn set_evidence(&mut self, evidence: ParticleEvidence) {
        self.log_likelihood = evidence.log_likelihood;
        self.associations = evidence.associations;
        self.sense_x = evidence.sense_x;
        self.sense_y = evidence.sense_y;
    }
    fn clear_evidence(&mut self) {
        self.log_likelihood = 0.0;
        self.associations.clear();
        self.sense_x.clear();
        self.sense_y.clear();
    }
}

/// How the filter picks the survivors of a resampling step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// Low-variance resampling: one uniform offset, then a fixed stride of 1/N.
    #[default]
    Systematic,
    /// N independent draws from the weight distribution.
    Multinomial,
    /// One independent uniform draw inside each of the N strata of width 1/N.
    Stratified,
    /// Deterministic floor(N w) copies, remainder drawn systematically from the residuals.
    Residual,
}
impl ResamplingStrategy {
    /// Select `weights.len()` ancestor indices with probability proportional to weight.
    ///
    /// Weights need not be normalized, but must be finite and non-negative with a positive sum,
    /// otherwise `DegenerateWeights` is returned.
    pub fn select<R: Rng + ?Sized>(&self, weights: &[f64], rng: &mut R) -> Result<Vec<usize>> {
        let normalized = normalize(weights)?;
        let n = normalized.len();
        let indices = match self {
            ResamplingStrategy::Systematic => {
                let offset = rng.random::<f64>() / n as f64;
                walk(&normalized, (0..n).map(|k| offset + k as f64 / n as f64))
            }
            ResamplingStrategy::Stratified => {
                let positions: Vec<f64> = (0..n)
                    .map(|k| (k as f64 + rng.random::<f64>()) / n as f64)
                    .collect();
                walk(&normalized, positions.into_iter())
            }
            ResamplingStrategy::Multinomial => {
                let distribution = WeightedIndex::new(&normalized)
                    .map_err(|e| FilterError::DegenerateWeights(e.to_string()))?;
                (0..n).map(|_| distribution.sample(rng)).collect()
            }
            ResamplingStrategy::Residual => Self::residual(&normalized, rng),
        };
        Ok(indices)
    }
    fn residual<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
        let n = weights.len();
        let mut indices = Vec::with_capacity(n);
        let mut residual = vec![0.0; n];
        for (i, &w) in weights.iter().enumerate() {
            let copies = (w * n as f64).floor() as usize;
            indices.extend(std::iter::repeat_n(i, copies));
            residual[i] = w * n as f64 - copies as f64;
        }
        let remaining = n.saturating_sub(indices.len());
        if remaining > 0 {
            // floor() can leave every residual at zero only through rounding; fall back to the weights
            let residual = normalize(&residual).unwrap_or_else(|_| weights.to_vec());
            let offset = rng.random::<f64>() / remaining as f64;
            indices.extend(walk(
                &residual,
                (0..remaining).map(|k| offset + k as f64 / remaining as f64),
            ));
        }
        indices.truncate(n);
        indices
    }
}

/// Scale weights to sum to one.
pub fn normalize(weights: &[f64]) -> Result<Vec<f64>> {
    if weights.is_empty() {
        return Err(FilterError::DegenerateWeights("no weights".to_string()));
    }
    if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(FilterError::DegenerateWeights(format!(
            "weight {w} is negative or non-finite"
        )));
    }
    let sum: f64 = weights.iter().sum();
    if !(sum > 0.0 && sum.is_finite()) {
        return Err(FilterError::DegenerateWeights(format!(
            "weights sum to {sum}"
        )));
    }
    Ok(weights.iter().map(|w| w / sum).collect())
}

/// Walk the cumulative distribution of normalized `weights` with ascending positions in [0, 1).
///
/// Zero-weight entries are never selected, including when rounding leaves the cumulative sum
/// slightly below one.
fn walk(weights: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last_positive = weights.iter().rposition(|&w| w > 0.0).unwrap_or(0);
    let mut indices = Vec::with_capacity(weights.len());
    let mut i = 0;
    let mut cumulative = weights[0];
    for u in positions {
        while (u >= cumulative || weights[i] == 0.0) && i < last_positive {
            i += 1;
            cumulative += weights[i];
        }
        indices.push(i);
    }
    indices
}

/// How [ParticleFilter::best_estimate] reduces the population to a single pose
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStrategy {
    /// Weight-averaged position with a weighted circular mean of the headings.
    #[default]
    WeightedMean,
    /// Pose of the particle with the largest weight (first one on ties).
    HighestWeight,
}

/// Sequential Monte Carlo localization filter on a static landmark map
#[derive(Clone)]
pub struct ParticleFilter {
    num_particles: usize,
    particles: Vec<Particle>,
    initialized: bool,
    resampling_strategy: ResamplingStrategy,
    estimate_strategy: EstimateStrategy,
    sensor_range: Option<f64>,
    rng: StdRng,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        let mut s = f.debug_struct("ParticleFilter");
        s.field("num_particles", &self.num_particles)
            .field("initialized", &self.initialized)
            .field("resampling_strategy", &self.resampling_strategy)
            .field("estimate_strategy", &self.estimate_strategy)
            .field("sensor_range", &self.sensor_range);
        if self.initialized {
            s.field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            );
            if let Ok(ess) = self.effective_sample_size() {
                s.field("effective_particles", &ess);
            }
            if let Ok(estimate) = self.best_estimate() {
                s.field("estimate", &format_args!("{estimate}"));
            }
        }
        s.finish()
    }
}
impl ParticleFilter {
    /// Create an uninitialized filter with `num_particles` particles and an entropy-seeded generator.
    pub fn new(num_particles: usize) -> Result<Self> {
        Self::new_with_seed(num_particles, rand::random())
    }

    /// Create an uninitialized filter with a specific random seed.
    ///
    /// This is useful for reproducible tests.
    pub fn new_with_seed(num_particles: usize, seed: u64) -> Result<Self> {
        if num_particles == 0 {
            return Err(FilterError::InvalidInput(
                "number of particles must be at least 1".to_string(),
            ));
        }
        Ok(ParticleFilter {
            num_particles,
            particles: Vec::new(),
            initialized: false,
            resampling_strategy: ResamplingStrategy::default(),
            estimate_strategy: EstimateStrategy::default(),
            sensor_range: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Create an uninitialized filter from configuration.
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let filter = match config.seed {
            Some(seed) => Self::new_with_seed(config.num_particles, seed)?,
            None => Self::new(config.num_particles)?,
        };
        filter
            .with_resampling_strategy(config.resampling)
            .with_estimate_strategy(config.estimate)
            .with_sensor_range(config.sensor_range)
    }

    pub fn with_resampling_strategy(mut self, strategy: ResamplingStrategy) -> Self {
        self.resampling_strategy = strategy;
        self
    }

    pub fn with_estimate_strategy(mut self, strategy: EstimateStrategy) -> Self {
        self.estimate_strategy = strategy;
        self
    }

    /// Restrict association candidates to landmarks within `range` of each particle.
    ///
    /// A particle with no landmark in range falls back to the whole map.
    pub fn with_sensor_range(mut self, range: Option<f64>) -> Result<Self> {
        if let Some(range) = range {
            error::require_positive("sensor range", range)?;
        }
        self.sensor_range = range;
        Ok(self)
    }

    pub fn num_particles(&self) -> usize {
        self.num_particles
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Read-only view of the population (empty before initialization)
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Weights in population order (empty before initialization)
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }

    pub fn resampling_strategy(&self) -> ResamplingStrategy {
        self.resampling_strategy
    }

    pub fn estimate_strategy(&self) -> EstimateStrategy {
        self.estimate_strategy
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(FilterError::NotInitialized)
        }
    }

    /// Sample the population around an initial pose estimate.
    ///
    /// Each coordinate of each particle is drawn independently from a normal distribution centred
    /// on `pose` with the matching standard deviation in `std`. All weights start at one. Calling
    /// this again discards the current population.
    pub fn initialize(&mut self, pose: Pose, std: &PoseStd) -> Result<()> {
        if !pose.is_finite() {
            return Err(FilterError::InvalidInput(format!(
                "initial pose {pose} is not finite"
            )));
        }
        std.validate("initial pose")?;
        let normal = |mean: f64, sigma: f64| {
            Normal::new(mean, sigma).map_err(|e| FilterError::InvalidInput(e.to_string()))
        };
        let dist_x = normal(pose.x, std.x)?;
        let dist_y = normal(pose.y, std.y)?;
        let dist_theta = normal(pose.theta, std.theta)?;

        self.particles = (0..self.num_particles)
            .map(|id| {
                let sample = Pose::new(
                    dist_x.sample(&mut self.rng),
                    dist_y.sample(&mut self.rng),
                    dist_theta.sample(&mut self.rng),
                );
                Particle::new(id, sample, 1.0)
            })
            .collect();
        self.initialized = true;
        debug!(
            "initialized {} particles around {} with std ({}, {}, {})",
            self.num_particles, pose, std.x, std.y, std.theta
        );
        Ok(())
    }

    /// Independent per-particle generator seeds for one parallel phase.
    fn draw_seeds(&mut self) -> Vec<u64> {
        (0..self.particles.len()).map(|_| self.rng.random()).collect()
    }

    /// Propagate every particle through the motion model with fresh process noise.
    pub fn predict(&mut self, dt: f64, std: &PoseStd, control: &ControlInput) -> Result<()> {
        self.ensure_initialized()?;
        error::require_positive("time step", dt)?;
        control.validate()?;
        let noise = ProcessNoise::new(std)?;
        let seeds = self.draw_seeds();

        let poses: Vec<Pose> = self
            .particles
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(particle, &seed)| -> Result<Pose> {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut pose = particle.pose();
                motion::propagate(&mut pose, dt, control, &noise, &mut rng)?;
                Ok(pose)
            })
            .collect::<Result<Vec<Pose>>>()?;

        for (particle, pose) in self.particles.iter_mut().zip(poses) {
            particle.set_pose(pose);
        }
        debug!(
            "predicted {} particles over dt = {dt} with v = {}, yaw rate = {}",
            self.particles.len(),
            control.velocity,
            control.yaw_rate
        );
        Ok(())
    }

    /// Landmarks a particle at `pose` may be associated with, and whether the range gate fell back
    /// to the whole map.
    fn candidates<'a>(&self, pose: &Pose, map: &'a Map) -> (Cow<'a, [Landmark]>, bool) {
        match self.sensor_range {
            Some(range) => {
                let in_range = map.within_range(pose.x, pose.y, range);
                if in_range.is_empty() {
                    (Cow::Borrowed(map.landmarks()), true)
                } else {
                    (Cow::Owned(in_range), false)
                }
            }
            None => (Cow::Borrowed(map.landmarks()), false),
        }
    }

    /// Re-weight every particle by the likelihood of `observations`.
    ///
    /// Each particle transforms the vehicle-frame observations with its own pose, associates them
    /// with the nearest landmarks, and scores them with the bivariate Gaussian sensor model.
    /// Previous weights are discarded. The resulting weights are `exp(l_i - max_j l_j)` where `l_i`
    /// is the log-likelihood of particle `i`, so the best particle has weight one. An empty
    /// observation set leaves every weight at one.
    pub fn update_weights(
        &mut self,
        noise: &MeasurementNoise,
        observations: &[LandmarkObservation],
        map: &Map,
    ) -> Result<()> {
        self.ensure_initialized()?;
        noise.validate()?;
        for obs in observations {
            if !obs.x.is_finite() || !obs.y.is_finite() {
                return Err(FilterError::InvalidInput(format!(
                    "observation ({}, {}) is not finite",
                    obs.x, obs.y
                )));
            }
        }
        if !observations.is_empty() && map.is_empty() {
            return Err(FilterError::InvalidInput(format!(
                "{} observations but the map has no landmarks",
                observations.len()
            )));
        }

        let results: Vec<(ParticleEvidence, bool)> = self
            .particles
            .par_iter()
            .map(|particle| -> Result<(ParticleEvidence, bool)> {
                let pose = particle.pose();
                let (candidates, fell_back) = self.candidates(&pose, map);
                let evidence = observation::evaluate(&pose, observations, &candidates, noise)?;
                Ok((evidence, fell_back))
            })
            .collect::<Result<Vec<_>>>()?;

        let max_log_likelihood = results
            .iter()
            .map(|(evidence, _)| evidence.log_likelihood)
            .fold(f64::NEG_INFINITY, f64::max);
        if !max_log_likelihood.is_finite() {
            return Err(FilterError::DegenerateWeights(format!(
                "best log-likelihood is {max_log_likelihood}"
            )));
        }
        let fallbacks = results.iter().filter(|(_, fell_back)| *fell_back).count();
        if fallbacks > 0 {
            warn!(
                "{fallbacks} of {} particles had no landmark within the sensor range",
                self.particles.len()
            );
        }

        for (particle, (evidence, _)) in self.particles.iter_mut().zip(results) {
            particle.weight = (evidence.log_likelihood - max_log_likelihood).exp();
            particle.set_evidence(evidence);
        }
        debug!(
            "weighted {} particles against {} observations, best log-likelihood {max_log_likelihood:.4}",
            self.particles.len(),
            observations.len()
        );
        Ok(())
    }

    /// Overwrite the weights, e.g. with weights computed by an external sensor model.
    pub fn set_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.ensure_initialized()?;
        if weights.len() != self.particles.len() {
            return Err(FilterError::InvalidInput(format!(
                "expected {} weights, got {}",
                self.particles.len(),
                weights.len()
            )));
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(FilterError::InvalidInput(format!(
                "weight {w} is negative or non-finite"
            )));
        }
        for (particle, &w) in self.particles.iter_mut().zip(weights) {
            particle.weight = w;
        }
        Ok(())
    }

    /// Draw a new population with replacement, proportionally to weight.
    ///
    /// Survivors are copies of their ancestors, renumbered `0..N`, with weight one and cleared
    /// association data. No noise is added here; diversity comes back in the next prediction.
    pub fn resample(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        let weights = self.weights();
        let indices = self.resampling_strategy.select(&weights, &mut self.rng)?;
        self.particles = indices
            .iter()
            .enumerate()
            .map(|(id, &ancestor)| {
                let mut particle = self.particles[ancestor].clone();
                particle.id = id;
                particle.weight = 1.0;
                particle.clear_evidence();
                particle
            })
            .collect();
        trace!(
            "resampled {} particles with {:?}",
            self.particles.len(),
            self.resampling_strategy
        );
        Ok(())
    }

    /// Resample only when the effective sample size drops below `threshold` × N.
    ///
    /// A threshold of 1.0 or more always resamples. Returns true if resampling was performed.
    pub fn resample_if_needed(&mut self, threshold: f64) -> Result<bool> {
        let n_eff = self.effective_sample_size()?;
        if threshold >= 1.0 || n_eff < threshold * self.num_particles as f64 {
            self.resample()?;
            Ok(true)
        } else {
            debug!("skipping resample, effective sample size {n_eff:.1}");
            Ok(false)
        }
    }

    /// N_eff = (Σ w)² / Σ w²
    pub fn effective_sample_size(&self) -> Result<f64> {
        self.ensure_initialized()?;
        let normalized = normalize(&self.weights())?;
        Ok(1.0 / normalized.iter().map(|w| w * w).sum::<f64>())
    }

    /// Single pose estimate of the population, according to the configured [EstimateStrategy].
    pub fn best_estimate(&self) -> Result<Pose> {
        self.ensure_initialized()?;
        let weights = normalize(&self.weights())?;
        let estimate = match self.estimate_strategy {
            EstimateStrategy::WeightedMean => weighted_mean(&self.particles, &weights),
            EstimateStrategy::HighestWeight => {
                let mut best = &self.particles[0];
                for particle in &self.particles[1..] {
                    if particle.weight > best.weight {
                        best = particle;
                    }
                }
                best.pose()
            }
        };
        Ok(estimate)
    }

    /// Weighted covariance of `(x, y, theta)` about the weighted mean.
    ///
    /// Heading deviations are wrapped to [-π, π) before they enter the covariance.
    pub fn covariance(&self) -> Result<Matrix3<f64>> {
        self.ensure_initialized()?;
        let weights = normalize(&self.weights())?;
        let mean = weighted_mean(&self.particles, &weights);
        let mut cov = Matrix3::<f64>::zeros();
        for (particle, w) in self.particles.iter().zip(weights) {
            let diff = nalgebra::Vector3::new(
                particle.x - mean.x,
                particle.y - mean.y,
                wrap_to_pi(particle.theta - mean.theta),
            );
            cov += w * diff * diff.transpose();
        }
        Ok(cov)
    }

    /// Write one `x y theta` line per particle.
    pub fn write_trace<W: io::Write>(&self, writer: W) -> Result<()> {
        self.ensure_initialized()?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .from_writer(writer);
        for particle in &self.particles {
            writer.serialize((particle.x, particle.y, particle.theta))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Append the current population to a trace file, creating it if needed.
    pub fn append_trace<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.write_trace(file)
    }
}

fn weighted_mean(particles: &[Particle], weights: &[f64]) -> Pose {
    let mut mean = Pose::default();
    let mut sin_sum = 0.0;
    let mut cos_sum = 0.0;
    for (particle, w) in particles.iter().zip(weights) {
        mean.x += w * particle.x;
        mean.y += w * particle.y;
        sin_sum += w * particle.theta.sin();
        cos_sum += w * particle.theta.cos();
    }
    mean.theta = sin_sum.atan2(cos_sum);
    mean
}
