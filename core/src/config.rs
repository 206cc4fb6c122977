//! Filter and simulation configuration
//!
//! Both configuration structs can be read from and written to JSON, YAML or TOML; the format is
//! chosen from the file extension. Every field has a default, so a configuration file only needs
//! to name the values it changes.
//!
//! ```toml
//! delta_t = 0.1
//! map = "data/map.csv"
//! control = "data/control.csv"
//! observations = "data/observations.csv"
//! output = "results/estimate.csv"
//!
//! [filter]
//! num_particles = 200
//! seed = 42
//! resampling = "systematic"
//!
//! [filter.measurement_std]
//! x = 0.3
//! y = 0.3
//! ```

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{self, FilterError, Result};
use crate::observation::MeasurementNoise;
use crate::particle::{EstimateStrategy, ResamplingStrategy};
use crate::{Pose, PoseStd};

fn default_num_particles() -> usize {
    100
}
fn default_init_std() -> PoseStd {
    PoseStd::new(0.3, 0.3, 0.01)
}
fn default_process_std() -> PoseStd {
    PoseStd::new(0.3, 0.3, 0.01)
}
fn default_resample_threshold() -> f64 {
    1.0
}
fn default_delta_t() -> f64 {
    0.1
}

/// Parameters of the particle filter itself
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Number of particles (at least one)
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,

    /// Random number generator seed. Use the same seed to repeat a run exactly; leave unset to
    /// seed from system entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Only associate with landmarks within this range of a particle (m)
    #[serde(default)]
    pub sensor_range: Option<f64>,

    #[serde(default)]
    pub resampling: ResamplingStrategy,

    #[serde(default)]
    pub estimate: EstimateStrategy,

    /// Resample when the effective sample size drops below this fraction of the particle count.
    /// A value of 1.0 or more resamples on every cycle.
    #[serde(default = "default_resample_threshold")]
    pub resample_threshold: f64,

    /// Standard deviations of the initial pose estimate (GPS uncertainty)
    #[serde(default = "default_init_std")]
    pub init_std: PoseStd,

    /// Standard deviations of the process noise added on every prediction
    #[serde(default = "default_process_std")]
    pub process_std: PoseStd,

    /// Standard deviations of a landmark detection
    #[serde(default)]
    pub measurement_std: MeasurementNoise,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: default_num_particles(),
            seed: None,
            init_std: default_init_std(),
            process_std: default_process_std(),
            measurement_std: MeasurementNoise::default(),
            sensor_range: None,
            resampling: ResamplingStrategy::default(),
            estimate: EstimateStrategy::default(),
            resample_threshold: default_resample_threshold(),
        }
    }
}

impl FilterConfig {
    /// Check every value the filter will rely on before a run starts.
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidInput(
                "number of particles must be at least 1".to_string(),
            ));
        }
        self.init_std.validate("initial pose")?;
        self.process_std.validate("process noise")?;
        self.measurement_std.validate()?;
        if let Some(range) = self.sensor_range {
            error::require_positive("sensor range", range)?;
        }
        error::require_non_negative("resample threshold", self.resample_threshold)
    }
}

/// A complete closed-loop localization run over a recorded dataset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Landmark map CSV (`id,x,y`)
    #[serde(default)]
    pub map: PathBuf,

    /// Control CSV (`velocity,yaw_rate`), one row per cycle
    #[serde(default)]
    pub control: PathBuf,

    /// Observation CSV (`step,x,y`), vehicle-frame detections grouped by cycle
    #[serde(default)]
    pub observations: PathBuf,

    /// Optional ground truth CSV (`x,y,theta`), one row per cycle
    #[serde(default)]
    pub ground_truth: Option<PathBuf>,

    /// Estimate CSV written at the end of the run
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Particle trace appended on every cycle (`x y theta` per particle)
    #[serde(default)]
    pub trace: Option<PathBuf>,

    /// Time between cycles (s)
    #[serde(default = "default_delta_t")]
    pub delta_t: f64,

    /// Initial pose estimate. Defaults to the first ground truth row when unset.
    #[serde(default)]
    pub initial_pose: Option<Pose>,

    #[serde(default)]
    pub filter: FilterConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            map: PathBuf::new(),
            control: PathBuf::new(),
            observations: PathBuf::new(),
            ground_truth: None,
            output: None,
            trace: None,
            delta_t: default_delta_t(),
            initial_pose: None,
            filter: FilterConfig::default(),
        }
    }
}

/// Serialization format of a configuration file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}
impl ConfigFormat {
    /// Pick the format from the file extension (`.json`, `.yaml`/`.yml`, `.toml`).
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_lowercase);
        match extension.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(FilterError::Config(format!(
                "{}: expected a .json, .yaml, .yml or .toml configuration file",
                path.display()
            ))),
        }
    }
}

/// Configuration types that can be stored as JSON, YAML or TOML.
pub trait ConfigFile: Serialize + DeserializeOwned {
    fn encode(&self, format: ConfigFormat) -> Result<String> {
        let text = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(|e| e.to_string()),
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::to_string(self).map_err(|e| e.to_string()),
        };
        text.map_err(|e| FilterError::Config(format!("cannot encode {format:?}: {e}")))
    }

    fn decode(text: &str, format: ConfigFormat) -> Result<Self> {
        let value = match format {
            ConfigFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str(text).map_err(|e| e.to_string()),
        };
        value.map_err(|e| FilterError::Config(format!("invalid {format:?}: {e}")))
    }

    /// Write in the format named by the file extension, creating parent directories.
    fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = self.encode(ConfigFormat::from_path(path)?)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    /// Read in the format named by the file extension.
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let text = fs::read_to_string(path)
            .map_err(|e| FilterError::Config(format!("{}: {e}", path.display())))?;
        Self::decode(&text, format).map_err(|e| match e {
            FilterError::Config(msg) => FilterError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }
}

impl ConfigFile for FilterConfig {}
impl ConfigFile for SimulationConfig {}

impl SimulationConfig {
    /// Load and validate a simulation configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        error::require_positive("delta_t", self.delta_t)?;
        if let Some(pose) = &self.initial_pose
            && !pose.is_finite()
        {
            return Err(FilterError::InvalidInput(format!(
                "initial pose {pose} is not finite"
            )));
        }
        self.filter.validate()
    }
}
