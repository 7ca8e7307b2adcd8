use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::context::RaceContext;
use crate::data::{CategoryEncoder, Compound, LapRecord};
use crate::error::{PitwiseError, Result};
use crate::gbdt::GradientBoostedTrees;

pub const PACKAGE_SCHEMA_VERSION: u32 = 1;

// column order of every feature matrix, persisted with the package
pub const FEATURE_NAMES: [&str; 8] = [
    "tyre_life",
    "race_lap_number",
    "compound_code",
    "circuit_code",
    "track_temp",
    "air_temp",
    "is_fresh_tyre",
    "top_speed",
];

// everything inference needs for one driver. written once by the trainer,
// read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverModelPackage {
    pub schema_version: u32,
    pub driver_id: String,
    pub model: GradientBoostedTrees,
    pub compound_encoder: CategoryEncoder,
    pub circuit_encoder: CategoryEncoder,
    pub features: Vec<String>,
}

impl DriverModelPackage {
    pub fn path_for(models_dir: &Path, driver_id: &str) -> PathBuf {
        models_dir.join(format!("{driver_id}_pkg.json"))
    }

    // overwrites whatever package the driver had before
    pub fn save(&self, models_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(models_dir)?;
        let path = Self::path_for(models_dir, &self.driver_id);
        fs::write(&path, serde_json::to_vec(self)?)?;
        Ok(path)
    }

    pub fn load(models_dir: &Path, driver_id: &str) -> Result<Self> {
        let path = Self::path_for(models_dir, driver_id);
        if !path.exists() {
            return Err(PitwiseError::MissingModel { driver: driver_id.to_string() });
        }
        let pkg: Self = serde_json::from_slice(&fs::read(&path)?)?;
        let layout_ok = pkg.features.iter().map(String::as_str).eq(FEATURE_NAMES) && pkg.model.n_features() == FEATURE_NAMES.len();
        if pkg.schema_version != PACKAGE_SCHEMA_VERSION || !layout_ok {
            warn!(driver = %driver_id, found = pkg.schema_version, "model package from another schema, retrain required");
            return Err(PitwiseError::MissingModel { driver: driver_id.to_string() });
        }
        Ok(pkg)
    }
}

/// Feature matrix for training rows, columns in `FEATURE_NAMES` order.
pub fn feature_matrix(laps: &[LapRecord], compounds: &CategoryEncoder, circuits: &CategoryEncoder) -> Array2<f64> {
    let mut x = Array2::zeros((laps.len(), FEATURE_NAMES.len()));
    for (mut row, lap) in x.rows_mut().into_iter().zip(laps) {
        row[0] = lap.tyre_life;
        row[1] = lap.race_lap_number as f64;
        row[2] = compounds.encode_or_default(lap.compound.as_str()) as f64;
        row[3] = circuits.encode_or_default(&lap.circuit_name) as f64;
        row[4] = lap.track_temp;
        row[5] = lap.air_temp;
        row[6] = if lap.is_fresh_tyre { 1.0 } else { 0.0 };
        row[7] = lap.top_speed;
    }
    x
}

// weighted mean absolute error, used for the training report
pub fn weighted_mae(pred: &Array1<f64>, truth: &Array1<f64>, weights: &Array1<f64>) -> f64 {
    let total: f64 = weights.sum();
    if total <= 0.0 {
        return f64::NAN;
    }
    pred.iter().zip(truth).zip(weights).map(|((p, t), w)| w * (p - t).abs()).sum::<f64>() / total
}

// plain least-squares fit over the same features. only a yardstick for the
// boosted model, so a singular design just means "no baseline".
pub fn linear_baseline_mae(x: &Array2<f64>, y: &Array1<f64>, weights: &Array1<f64>) -> Option<f64> {
    let ds = Dataset::new(x.clone(), y.clone());
    let fitted = LinearRegression::new().fit(&ds).ok()?;
    let pred: Array1<f64> = fitted.predict(x);
    let mae = weighted_mae(&pred, y, weights);
    mae.is_finite().then_some(mae)
}

/// Anything that can price a stint.
pub trait StintTimeModel {
    /// Total seconds for `length` laps on a fresh set, starting on race lap `start_lap`.
    fn stint_time(&self, compound: Compound, start_lap: u32, length: u32) -> f64;
}

// evaluates a driver package under one race context
pub struct StintPredictor<'a> {
    package: &'a DriverModelPackage,
    context: &'a RaceContext,
}

impl<'a> StintPredictor<'a> {
    pub fn new(package: &'a DriverModelPackage, context: &'a RaceContext) -> Self {
        Self { package, context }
    }

    // compound by label so data from outside the closed enum still prices;
    // labels the encoder never saw fall back to code 0
    pub fn predict_label(&self, compound: &str, start_lap: u32, length: u32) -> f64 {
        if length == 0 {
            return 0.0;
        }
        let compound_code = self.package.compound_encoder.encode_or_default(compound) as f64;
        let circuit_code = self.package.circuit_encoder.encode_or_default(&self.context.circuit_name) as f64;

        let mut x = Array2::zeros((length as usize, FEATURE_NAMES.len()));
        for (i, mut row) in x.rows_mut().into_iter().enumerate() {
            row[0] = (i + 1) as f64;
            row[1] = (start_lap as usize + i) as f64;
            row[2] = compound_code;
            row[3] = circuit_code;
            row[4] = self.context.track_temp;
            row[5] = self.context.air_temp;
            row[6] = 1.0;
            row[7] = self.context.avg_top_speed;
        }
        let per_lap: Array1<f64> = self.package.model.predict(&x);
        per_lap.sum()
    }
}

impl StintTimeModel for StintPredictor<'_> {
    fn stint_time(&self, compound: Compound, start_lap: u32, length: u32) -> f64 {
        self.predict_label(compound.as_str(), start_lap, length)
    }
}
