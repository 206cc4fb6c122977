//! End-to-end localization tests on synthetic datasets
//!
//! Each test builds a landmark field and drives a simulated vehicle through it with the same
//! motion model the filter uses. Detections are the landmarks within sensor range, expressed in
//! the vehicle frame and perturbed with Gaussian noise. The filter then has to track the true
//! trajectory from those detections alone.
//!
//! The error bounds are regression checks chosen well above what the filter achieves on these
//! tracks, not theoretical limits.
use std::fs;

use assert_approx_eq::assert_approx_eq;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use pfloc::config::{FilterConfig, SimulationConfig};
use pfloc::motion;
use pfloc::sim::{self, Dataset, ErrorSummary, LocalizationResult};
use pfloc::{
    ControlInput, FilterError, Landmark, LandmarkObservation, Map, MeasurementNoise,
    ParticleFilter, Pose, PoseStd, ResamplingStrategy,
};

const DELTA_T: f64 = 0.1;
const SENSOR_RANGE: f64 = 50.0;

/// Landmarks on a jittered grid covering [-60, 60] x [-60, 60]
fn landmark_field() -> Map {
    let mut rng = StdRng::seed_from_u64(11);
    let jitter = Normal::new(0.0, 3.0).unwrap();
    let mut landmarks = Vec::new();
    let mut id = 1;
    for i in -3..=3 {
        for j in -3..=3 {
            landmarks.push(Landmark::new(
                id,
                20.0 * i as f64 + jitter.sample(&mut rng),
                20.0 * j as f64 + jitter.sample(&mut rng),
            ));
            id += 1;
        }
    }
    Map::new(landmarks).unwrap()
}

/// Vehicle-frame detections of every landmark within range of `pose`
fn observe(
    pose: &Pose,
    map: &Map,
    noise: &Normal<f64>,
    rng: &mut StdRng,
) -> Vec<LandmarkObservation> {
    let (sin, cos) = pose.theta.sin_cos();
    map.landmarks()
        .iter()
        .filter(|l| l.distance_squared(pose.x, pose.y) <= SENSOR_RANGE * SENSOR_RANGE)
        .map(|l| {
            let dx = l.x - pose.x;
            let dy = l.y - pose.y;
            LandmarkObservation::new(
                cos * dx + sin * dy + noise.sample(rng),
                -sin * dx + cos * dy + noise.sample(rng),
            )
        })
        .collect()
}

fn synthetic_dataset(controls: Vec<ControlInput>, start: Pose) -> Dataset {
    let map = landmark_field();
    let mut rng = StdRng::seed_from_u64(5);
    let noise = Normal::new(0.0, 0.1).unwrap();
    let mut truth = Vec::with_capacity(controls.len());
    let mut observations = Vec::with_capacity(controls.len());
    let mut pose = start;
    for k in 0..controls.len() {
        if k > 0 {
            pose = motion::step(&pose, DELTA_T, &controls[k - 1]);
        }
        observations.push(observe(&pose, &map, &noise, &mut rng));
        truth.push(pose);
    }
    Dataset::new(map, controls, observations, Some(truth)).unwrap()
}

fn circle_dataset(cycles: usize) -> Dataset {
    synthetic_dataset(
        vec![ControlInput::new(5.0, 0.2); cycles],
        Pose::new(0.0, -25.0, 0.0),
    )
}

fn config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        delta_t: DELTA_T,
        filter: FilterConfig {
            num_particles: 200,
            seed: Some(seed),
            sensor_range: Some(SENSOR_RANGE),
            init_std: PoseStd::new(0.3, 0.3, 0.01),
            process_std: PoseStd::new(0.1, 0.1, 0.005),
            measurement_std: MeasurementNoise::new(0.3, 0.3),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn test_tracks_circular_trajectory() {
    let dataset = circle_dataset(300);
    let results = sim::run_localization(&dataset, &config(42)).unwrap();
    assert_eq!(results.len(), 300);

    let summary = ErrorSummary::from_results(&results).unwrap();
    assert_eq!(summary.cycles, 300);
    assert!(
        summary.mean_position_error < 1.0,
        "mean position error {:.3} m",
        summary.mean_position_error
    );
    assert!(
        summary.max_position_error < 3.0,
        "max position error {:.3} m",
        summary.max_position_error
    );
    assert!(summary.rmse_theta < 0.1, "heading RMSE {:.4}", summary.rmse_theta);
}

#[test]
fn test_tracks_straight_line() {
    let dataset = synthetic_dataset(
        vec![ControlInput::new(4.0, 0.0); 200],
        Pose::new(-40.0, 5.0, 0.0),
    );
    let results = sim::run_localization(&dataset, &config(3)).unwrap();
    let summary = ErrorSummary::from_results(&results).unwrap();
    assert!(summary.mean_position_error < 1.0);

    let last = results.last().unwrap();
    let truth = dataset.ground_truth.as_ref().unwrap()[199];
    assert_approx_eq!(truth.x, -40.0 + 4.0 * DELTA_T * 199.0, 1e-9);
    assert!(last.estimate().distance(&truth) < 2.0);
}

#[test]
fn test_same_seed_repeats_run() {
    let dataset = circle_dataset(60);
    let first = sim::run_localization(&dataset, &config(8)).unwrap();
    let second = sim::run_localization(&dataset, &config(8)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_population_and_weights_stay_valid_over_many_cycles() {
    let dataset = circle_dataset(150);
    let cfg = config(21);
    let mut pf = ParticleFilter::from_config(&cfg.filter).unwrap();
    let start = dataset.ground_truth.as_ref().unwrap()[0];
    pf.initialize(start, &cfg.filter.init_std).unwrap();

    for step in 0..dataset.num_cycles() {
        if step > 0 {
            pf.predict(DELTA_T, &cfg.filter.process_std, &dataset.controls[step - 1])
                .unwrap();
        }
        pf.update_weights(
            &cfg.filter.measurement_std,
            &dataset.observations[step],
            &dataset.map,
        )
        .unwrap();
        let weights = pf.weights();
        assert_eq!(weights.len(), 200);
        assert!(weights.iter().all(|w| w.is_finite() && *w >= 0.0 && *w <= 1.0));
        let max = weights.iter().cloned().fold(0.0, f64::max);
        assert_approx_eq!(max, 1.0, 1e-12);

        pf.resample().unwrap();
        assert_eq!(pf.particles().len(), 200);
        for (id, particle) in pf.particles().iter().enumerate() {
            assert_eq!(particle.id, id);
            assert_eq!(particle.weight, 1.0);
            assert!(particle.associations.is_empty());
        }
    }
}

#[test]
fn test_every_resampling_strategy_localizes() {
    let dataset = circle_dataset(120);
    for strategy in [
        ResamplingStrategy::Systematic,
        ResamplingStrategy::Multinomial,
        ResamplingStrategy::Stratified,
        ResamplingStrategy::Residual,
    ] {
        let mut cfg = config(17);
        cfg.filter.resampling = strategy;
        let results = sim::run_localization(&dataset, &cfg).unwrap();
        let summary = ErrorSummary::from_results(&results).unwrap();
        assert!(
            summary.mean_position_error < 1.5,
            "{strategy:?}: mean position error {:.3} m",
            summary.mean_position_error
        );
    }
}

#[test]
fn test_adaptive_resampling_localizes() {
    let dataset = circle_dataset(100);
    let mut cfg = config(4);
    cfg.filter.resample_threshold = 0.5;
    let results = sim::run_localization(&dataset, &cfg).unwrap();
    assert_eq!(results.len(), 100);
    assert!(
        results
            .iter()
            .all(|r| r.effective_sample_size >= 1.0 - 1e-9 && r.effective_sample_size <= 200.0 + 1e-9)
    );
    let summary = ErrorSummary::from_results(&results).unwrap();
    assert!(summary.mean_position_error < 1.5);
}

#[test]
fn test_degenerate_weights_are_rejected() {
    let mut pf = ParticleFilter::new_with_seed(10, 1).unwrap();
    pf.initialize(Pose::new(0.0, 0.0, 0.0), &PoseStd::new(0.1, 0.1, 0.01))
        .unwrap();
    pf.set_weights(&[0.0; 10]).unwrap();
    assert!(matches!(pf.resample(), Err(FilterError::DegenerateWeights(_))));
    assert!(matches!(
        pf.best_estimate(),
        Err(FilterError::DegenerateWeights(_))
    ));
}

#[test]
fn test_operations_before_initialization() {
    let map = landmark_field();
    let mut pf = ParticleFilter::new_with_seed(10, 1).unwrap();
    assert!(matches!(
        pf.predict(DELTA_T, &PoseStd::zero(), &ControlInput::new(1.0, 0.0)),
        Err(FilterError::NotInitialized)
    ));
    assert!(matches!(
        pf.update_weights(&MeasurementNoise::default(), &[], &map),
        Err(FilterError::NotInitialized)
    ));
    assert!(matches!(pf.resample(), Err(FilterError::NotInitialized)));
    assert!(pf.particles().is_empty());
}

#[test]
fn test_trace_appends_every_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace.txt");
    fs::write(&trace, "earlier run\n").unwrap();

    let dataset = circle_dataset(5);
    let mut cfg = config(2);
    cfg.filter.num_particles = 20;
    cfg.trace = Some(trace.clone());
    sim::run_localization(&dataset, &cfg).unwrap();
    sim::run_localization(&dataset, &cfg).unwrap();

    let contents = fs::read_to_string(&trace).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1 + 2 * 5 * 20);
    assert_eq!(lines[0], "earlier run");
    for line in &lines[1..] {
        let fields: Vec<f64> = line
            .split(' ')
            .map(|f| f.parse::<f64>().unwrap())
            .collect();
        assert_eq!(fields.len(), 3);
    }
}

#[test]
fn test_run_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = circle_dataset(50);

    let map_path = dir.path().join("map.csv");
    let control_path = dir.path().join("control.csv");
    let observation_path = dir.path().join("observations.csv");
    let truth_path = dir.path().join("ground_truth.csv");
    let output_path = dir.path().join("out").join("estimate.csv");
    dataset.map.to_csv(&map_path).unwrap();
    sim::write_controls(&dataset.controls, &control_path).unwrap();
    sim::write_observations(&dataset.observations, &observation_path).unwrap();
    sim::write_ground_truth(dataset.ground_truth.as_ref().unwrap(), &truth_path).unwrap();

    let mut cfg = config(42);
    cfg.map = map_path;
    cfg.control = control_path;
    cfg.observations = observation_path;
    cfg.ground_truth = Some(truth_path);
    cfg.output = Some(output_path.clone());

    let results = sim::run_from_config(&cfg).unwrap();
    let written = LocalizationResult::from_csv(&output_path).unwrap();
    assert_eq!(written.len(), 50);
    assert_eq!(written.len(), results.len());
    for (a, b) in written.iter().zip(&results) {
        assert_eq!(a.step, b.step);
        assert_approx_eq!(a.x, b.x, 1e-9);
        assert!(a.error_x.is_some());
    }
}
