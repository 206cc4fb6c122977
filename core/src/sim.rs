//! Dataset loading and the closed-loop localization driver.
//!
//! This module provides:
//! - [Dataset]: a landmark map, per-cycle controls and observations, and optional ground truth,
//!   read from CSV files
//! - [run_localization]: the host loop that drives a [ParticleFilter] through every cycle
//! - [LocalizationResult]: per-cycle estimates (and errors when ground truth is known), with CSV
//!   import/export
//! - [ErrorSummary]: aggregate accuracy of a run
//!
//! File formats (all with a header row):
//! - map: `id,x,y`
//! - control: `velocity,yaw_rate`, one row per cycle; the control of cycle `k` moves the vehicle
//!   from cycle `k` to cycle `k + 1`
//! - observations: `step,x,y`, vehicle-frame detections; cycles without rows observe nothing
//! - ground truth: `x,y,theta`, one row per cycle

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::SimulationConfig;
use crate::error::{FilterError, Result};
use crate::map::Map;
use crate::motion::ControlInput;
use crate::observation::LandmarkObservation;
use crate::particle::ParticleFilter;
use crate::{Pose, wrap_to_pi};

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
struct ObservationRecord {
    step: usize,
    x: f64,
    y: f64,
}

fn read_records<T, P>(path: P) -> Result<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: T = result?;
        records.push(record);
    }
    Ok(records)
}

fn write_records<T: Serialize, P: AsRef<Path>>(records: &[T], path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Everything a localization run consumes
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    pub map: Map,
    /// One control per cycle
    pub controls: Vec<ControlInput>,
    /// Vehicle-frame observations, one set per cycle
    pub observations: Vec<Vec<LandmarkObservation>>,
    /// True pose per cycle, when known
    pub ground_truth: Option<Vec<Pose>>,
}

impl Dataset {
    /// Assemble a dataset, checking that the per-cycle sequences line up.
    pub fn new(
        map: Map,
        controls: Vec<ControlInput>,
        observations: Vec<Vec<LandmarkObservation>>,
        ground_truth: Option<Vec<Pose>>,
    ) -> Result<Self> {
        if observations.len() != controls.len() {
            return Err(FilterError::InvalidInput(format!(
                "{} observation sets for {} control cycles",
                observations.len(),
                controls.len()
            )));
        }
        if let Some(truth) = &ground_truth
            && truth.len() < controls.len()
        {
            return Err(FilterError::InvalidInput(format!(
                "ground truth has {} rows for {} cycles",
                truth.len(),
                controls.len()
            )));
        }
        Ok(Dataset {
            map,
            controls,
            observations,
            ground_truth,
        })
    }

    /// Read a dataset from the CSV files named in a simulation configuration.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        let map = Map::from_csv(&config.map)?;
        let controls: Vec<ControlInput> = read_records(&config.control)?;
        let observations = read_observations(&config.observations, controls.len())?;
        let ground_truth = match &config.ground_truth {
            Some(path) => Some(read_records::<Pose, _>(path)?),
            None => None,
        };
        info!(
            "loaded {} landmarks and {} cycles",
            map.len(),
            controls.len()
        );
        Dataset::new(map, controls, observations, ground_truth)
    }

    pub fn num_cycles(&self) -> usize {
        self.controls.len()
    }
}

/// Read `step,x,y` rows and group them into `num_cycles` observation sets.
pub fn read_observations<P: AsRef<Path>>(
    path: P,
    num_cycles: usize,
) -> Result<Vec<Vec<LandmarkObservation>>> {
    let records: Vec<ObservationRecord> = read_records(path)?;
    let mut observations = vec![Vec::new(); num_cycles];
    for record in records {
        let cycle = observations.get_mut(record.step).ok_or_else(|| {
            FilterError::InvalidInput(format!(
                "observation for step {} but only {num_cycles} cycles",
                record.step
            ))
        })?;
        cycle.push(LandmarkObservation::new(record.x, record.y));
    }
    Ok(observations)
}

/// Write grouped observation sets as `step,x,y` rows.
pub fn write_observations<P: AsRef<Path>>(
    observations: &[Vec<LandmarkObservation>],
    path: P,
) -> Result<()> {
    let records: Vec<ObservationRecord> = observations
        .iter()
        .enumerate()
        .flat_map(|(step, set)| {
            set.iter().map(move |obs| ObservationRecord {
                step,
                x: obs.x,
                y: obs.y,
            })
        })
        .collect();
    write_records(&records, path)
}

pub fn write_controls<P: AsRef<Path>>(controls: &[ControlInput], path: P) -> Result<()> {
    write_records(controls, path)
}

pub fn write_ground_truth<P: AsRef<Path>>(poses: &[Pose], path: P) -> Result<()> {
    write_records(poses, path)
}

/// Filter output for one cycle
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LocalizationResult {
    pub step: usize,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    /// Effective sample size after the weighting pass
    pub effective_sample_size: f64,
    pub error_x: Option<f64>,
    pub error_y: Option<f64>,
    /// Heading error wrapped to [-π, π)
    pub error_theta: Option<f64>,
}

impl LocalizationResult {
    pub fn estimate(&self) -> Pose {
        Pose::new(self.x, self.y, self.theta)
    }

    /// Position error magnitude, when ground truth is known
    pub fn position_error(&self) -> Option<f64> {
        match (self.error_x, self.error_y) {
            (Some(dx), Some(dy)) => Some(dx.hypot(dy)),
            _ => None,
        }
    }

    pub fn to_csv<P: AsRef<Path>>(results: &[Self], path: P) -> Result<()> {
        write_records(results, path)
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        read_records(path)
    }
}

/// Aggregate accuracy of a run against ground truth
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub cycles: usize,
    pub mean_position_error: f64,
    pub max_position_error: f64,
    pub rmse_x: f64,
    pub rmse_y: f64,
    pub rmse_theta: f64,
}

impl ErrorSummary {
    /// Summarize the cycles that carry ground-truth errors. Returns `None` if there are none.
    pub fn from_results(results: &[LocalizationResult]) -> Option<Self> {
        let errors: Vec<(f64, f64, f64)> = results
            .iter()
            .filter_map(|r| Some((r.error_x?, r.error_y?, r.error_theta?)))
            .collect();
        if errors.is_empty() {
            return None;
        }
        let n = errors.len() as f64;
        let position: Vec<f64> = errors.iter().map(|(dx, dy, _)| dx.hypot(*dy)).collect();
        let rms = |f: fn(&(f64, f64, f64)) -> f64| {
            (errors.iter().map(|e| f(e).powi(2)).sum::<f64>() / n).sqrt()
        };
        Some(ErrorSummary {
            cycles: errors.len(),
            mean_position_error: position.iter().sum::<f64>() / n,
            max_position_error: position.iter().cloned().fold(0.0, f64::max),
            rmse_x: rms(|e| e.0),
            rmse_y: rms(|e| e.1),
            rmse_theta: rms(|e| e.2),
        })
    }
}

/// Drive a particle filter through every cycle of a dataset.
///
/// Cycle 0 initializes the filter around the configured initial pose (or the first ground truth
/// pose); every later cycle first predicts with the previous cycle's control. Each cycle then
/// weights the particles against that cycle's observations, records the estimate, appends the
/// population to the trace file if one is configured, and resamples when the effective sample
/// size falls below the configured threshold. The trace file is only ever appended to, so an
/// existing trace keeps its earlier contents. The first error aborts the run.
pub fn run_localization(
    dataset: &Dataset,
    config: &SimulationConfig,
) -> Result<Vec<LocalizationResult>> {
    config.validate()?;
    let initial_pose = match (&config.initial_pose, &dataset.ground_truth) {
        (Some(pose), _) => *pose,
        (None, Some(truth)) if !truth.is_empty() => truth[0],
        _ => {
            return Err(FilterError::InvalidInput(
                "no initial pose configured and no ground truth to start from".to_string(),
            ));
        }
    };
    let filter_config = &config.filter;
    let mut pf = ParticleFilter::from_config(filter_config)?;

    let mut results = Vec::with_capacity(dataset.num_cycles());
    for step in 0..dataset.num_cycles() {
        if step == 0 {
            pf.initialize(initial_pose, &filter_config.init_std)?;
        } else {
            pf.predict(
                config.delta_t,
                &filter_config.process_std,
                &dataset.controls[step - 1],
            )?;
        }
        let observations = dataset.observations.get(step).ok_or_else(|| {
            FilterError::InvalidInput(format!("no observation set for step {step}"))
        })?;
        pf.update_weights(&filter_config.measurement_std, observations, &dataset.map)?;
        let estimate = pf.best_estimate()?;
        let effective_sample_size = pf.effective_sample_size()?;
        if effective_sample_size < 2.0 {
            warn!("step {step}: effective sample size collapsed to {effective_sample_size:.2}");
        }
        if let Some(trace) = &config.trace {
            pf.append_trace(trace)?;
        }

        let truth = dataset
            .ground_truth
            .as_ref()
            .and_then(|t| t.get(step).copied());
        let result = LocalizationResult {
            step,
            x: estimate.x,
            y: estimate.y,
            theta: estimate.theta,
            effective_sample_size,
            error_x: truth.map(|t| estimate.x - t.x),
            error_y: truth.map(|t| estimate.y - t.y),
            error_theta: truth.map(|t| wrap_to_pi(estimate.theta - t.theta)),
        };
        debug!(
            "step {step}: estimate {estimate}, n_eff {effective_sample_size:.1}, error {:?}",
            result.position_error()
        );
        results.push(result);

        pf.resample_if_needed(filter_config.resample_threshold)?;
    }
    if let Some(summary) = ErrorSummary::from_results(&results) {
        info!(
            "{} cycles: mean position error {:.3} m, max {:.3} m, heading RMSE {:.4} rad",
            summary.cycles,
            summary.mean_position_error,
            summary.max_position_error,
            summary.rmse_theta
        );
    }
    Ok(results)
}

/// Load the dataset named in `config`, run it, and write the estimates if an output is set.
pub fn run_from_config(config: &SimulationConfig) -> Result<Vec<LocalizationResult>> {
    let dataset = Dataset::from_config(config)?;
    let results = run_localization(&dataset, config)?;
    if let Some(output) = &config.output {
        LocalizationResult::to_csv(&results, output)?;
        info!("wrote {} estimates to {}", results.len(), output.display());
    }
    Ok(results)
}
