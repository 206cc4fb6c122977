//! Static landmark map
//!
//! The map is loaded once before the first cycle and never mutated afterwards. Landmark order is
//! significant: nearest-landmark association breaks distance ties in favour of the landmark that
//! appears first in the map.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{FilterError, Result};

/// A single map landmark in the map frame
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: i32,
    pub x: f64,
    pub y: f64,
}
impl Landmark {
    pub fn new(id: i32, x: f64, y: f64) -> Self {
        Landmark { id, x, y }
    }
    /// Squared Euclidean distance to a map-frame point
    pub fn distance_squared(&self, x: f64, y: f64) -> f64 {
        let dx = self.x - x;
        let dy = self.y - y;
        dx * dx + dy * dy
    }
}

/// Ordered, immutable collection of landmarks with unique ids
#[derive(Clone, Debug, Default)]
pub struct Map {
    landmarks: Vec<Landmark>,
}
impl Map {
    /// Build a map, rejecting duplicate ids and non-finite coordinates.
    pub fn new(landmarks: Vec<Landmark>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(landmarks.len());
        for landmark in &landmarks {
            if !landmark.x.is_finite() || !landmark.y.is_finite() {
                return Err(FilterError::InvalidInput(format!(
                    "landmark {} has non-finite coordinates",
                    landmark.id
                )));
            }
            if !seen.insert(landmark.id) {
                return Err(FilterError::InvalidInput(format!(
                    "duplicate landmark id {}",
                    landmark.id
                )));
            }
        }
        Ok(Map { landmarks })
    }
    /// Reads a map from a CSV file with an `id,x,y` header.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pfloc::Map;
    ///
    /// let map = Map::from_csv("./data/map.csv").expect("Failed to read map");
    /// println!("Loaded {} landmarks", map.len());
    /// ```
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut landmarks = Vec::new();
        for result in rdr.deserialize() {
            let landmark: Landmark = result?;
            landmarks.push(landmark);
        }
        Map::new(landmarks)
    }
    /// Writes the map to a CSV file with an `id,x,y` header.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for landmark in &self.landmarks {
            writer.serialize(landmark)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
    pub fn get(&self, id: i32) -> Option<&Landmark> {
        self.landmarks.iter().find(|l| l.id == id)
    }
    /// Landmarks whose distance to `(x, y)` is at most `range`, in map order.
    pub fn within_range(&self, x: f64, y: f64, range: f64) -> Vec<Landmark> {
        let range_squared = range * range;
        self.landmarks
            .iter()
            .filter(|l| l.distance_squared(x, y) <= range_squared)
            .copied()
            .collect()
    }
}
