use linfa::prelude::*;
use ndarray::Array1;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::{FeatureParams, TrainingParams};
use crate::data::{build_training_set, load_driver_laps, CategoryEncoder, LapRecord};
use crate::error::{PitwiseError, Result};
use crate::gbdt::BoostingParams;
use crate::model::{
    feature_matrix, linear_baseline_mae, weighted_mae, DriverModelPackage, FEATURE_NAMES, PACKAGE_SCHEMA_VERSION,
};

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub driver: String,
    pub rows: usize,
    pub synthetic_rows: usize,
    pub train_mae: f64,
    /// Same metric for an ordinary least-squares fit, when one exists.
    pub baseline_mae: Option<f64>,
    pub package_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedDriver {
    pub driver: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub trained: Vec<TrainingReport>,
    pub skipped: Vec<SkippedDriver>,
}

// fits one degradation model per driver
pub struct DegradationTrainer<'a> {
    features: &'a FeatureParams,
    training: &'a TrainingParams,
}

impl<'a> DegradationTrainer<'a> {
    pub fn new(features: &'a FeatureParams, training: &'a TrainingParams) -> Self {
        Self { features, training }
    }

    /// Builds the training set for one driver and fits the package.
    pub fn train_driver(&self, driver_id: &str, laps: Vec<LapRecord>) -> Result<(DriverModelPackage, TrainingReport)> {
        let set = build_training_set(driver_id, laps, self.features)?;

        // encoders are fit on this driver's rows only
        let compound_encoder = CategoryEncoder::fit(set.laps.iter().map(|l| l.compound.as_str()));
        let circuit_encoder = CategoryEncoder::fit(set.laps.iter().map(|l| l.circuit_name.as_str()));

        let x = feature_matrix(&set.laps, &compound_encoder, &circuit_encoder);
        let y: Array1<f64> = set.laps.iter().map(|l| l.lap_time_seconds).collect();
        let w: Array1<f64> = set.laps.iter().map(|l| l.sample_weight).collect();

        let dataset = Dataset::new(x, y).with_weights(w.mapv(|v| v as f32));
        let model = BoostingParams::from(self.training).fit(&dataset)?;

        let pred: Array1<f64> = model.predict(dataset.records());
        let train_mae = weighted_mae(&pred, dataset.targets(), &w);
        let baseline_mae = linear_baseline_mae(dataset.records(), dataset.targets(), &w);
        info!(
            driver = %driver_id,
            rows = set.laps.len(),
            synthetic = set.synthetic_rows,
            trees = model.n_trees(),
            train_mae,
            baseline_mae = ?baseline_mae,
            "fitted degradation model"
        );

        let package = DriverModelPackage {
            schema_version: PACKAGE_SCHEMA_VERSION,
            driver_id: driver_id.to_string(),
            model,
            compound_encoder,
            circuit_encoder,
            features: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        };
        let report = TrainingReport {
            driver: driver_id.to_string(),
            rows: set.laps.len(),
            synthetic_rows: set.synthetic_rows,
            train_mae,
            baseline_mae,
            package_path: None,
        };
        Ok((package, report))
    }

    // one `<DRIVER>.csv` in, one `<DRIVER>_pkg.json` out
    pub fn train_file(&self, csv_path: &Path, models_dir: &Path) -> Result<TrainingReport> {
        let driver_id = driver_code(csv_path);
        let laps = load_driver_laps(csv_path, self.features)?;
        let (package, mut report) = self.train_driver(&driver_id, laps)?;
        report.package_path = Some(package.save(models_dir)?);
        Ok(report)
    }

    /// Trains every driver export in `processed_dir`.
    ///
    /// A driver that fails (too few laps, unreadable file, failed fit) is
    /// logged and skipped; the rest of the batch still runs.
    pub fn train_all(&self, processed_dir: &Path, models_dir: &Path) -> Result<BatchSummary> {
        let mut files: Vec<PathBuf> = fs::read_dir(processed_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "csv"))
            .collect();
        files.sort();

        if files.is_empty() {
            warn!(dir = %processed_dir.display(), "no driver exports to train on");
        }
        info!(drivers = files.len(), "training degradation models");

        let mut summary = BatchSummary::default();
        for file in files {
            let driver = driver_code(&file);
            match self.train_file(&file, models_dir) {
                Ok(report) => summary.trained.push(report),
                Err(e @ PitwiseError::InsufficientTrainingData { .. }) => {
                    warn!(driver = %driver, "{e}");
                    summary.skipped.push(SkippedDriver { driver, reason: e.to_string() });
                }
                Err(e) => {
                    error!(driver = %driver, error = %e, "training failed");
                    summary.skipped.push(SkippedDriver { driver, reason: e.to_string() });
                }
            }
        }
        Ok(summary)
    }
}

fn driver_code(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use crate::data::tests::stint_laps;
    use crate::data::Compound;
    use crate::model::{StintPredictor, StintTimeModel};
    use std::io::Write;

    fn quick() -> TrainingParams {
        TrainingParams { n_estimators: 25, ..TrainingParams::default() }
    }

    fn write_export(dir: &Path, driver: &str, rows: usize) {
        let mut f = fs::File::create(dir.join(format!("{driver}.csv"))).unwrap();
        writeln!(f, "LapTimeSec,RaceLapNumber,TyreLife,Compound,Stint,Driver,Year,Circuit,SessionType,TrackTemp,AirTemp,IsFreshTyre,TopSpeed").unwrap();
        for i in 0..rows {
            let (compound, stint, life) = if i < rows / 2 { ("SOFT", 1, i + 1) } else { ("MEDIUM", 2, i + 1 - rows / 2) };
            let time = 95.0 + 0.08 * life as f64;
            writeln!(f, "{time},{},{life},{compound},{stint},{driver},2024,Bahrain Grand Prix,R,35.0,25.0,1,310.0", i + 1)
                .unwrap();
        }
    }

    #[test]
    fn batch_trains_fifty_and_skips_forty_nine() {
        let data = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        write_export(data.path(), "VER", 50);
        write_export(data.path(), "SAR", 49);

        let features = FeatureParams::default();
        let training = quick();
        let summary = DegradationTrainer::new(&features, &training).train_all(data.path(), models.path()).unwrap();

        assert_eq!(summary.trained.len(), 1);
        assert_eq!(summary.trained[0].driver, "VER");
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].driver, "SAR");
        assert!(DriverModelPackage::path_for(models.path(), "VER").exists());
        assert!(!DriverModelPackage::path_for(models.path(), "SAR").exists());
    }

    #[test]
    fn broken_export_does_not_stop_the_batch() {
        let data = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        fs::write(data.path().join("ALO.csv"), "LapTimeSec,Driver\nnot-a-number,ALO\n").unwrap();
        write_export(data.path(), "NOR", 60);
        fs::write(data.path().join("notes.txt"), "ignored").unwrap();

        let features = FeatureParams::default();
        let training = quick();
        let summary = DegradationTrainer::new(&features, &training).train_all(data.path(), models.path()).unwrap();

        assert_eq!(summary.trained.iter().map(|r| r.driver.as_str()).collect::<Vec<_>>(), vec!["NOR"]);
        assert_eq!(summary.skipped.iter().map(|r| r.driver.as_str()).collect::<Vec<_>>(), vec!["ALO"]);
    }

    #[test]
    fn retraining_overwrites_the_package() {
        let data = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        let features = FeatureParams::default();
        let training = quick();
        let trainer = DegradationTrainer::new(&features, &training);

        write_export(data.path(), "PIA", 60);
        trainer.train_all(data.path(), models.path()).unwrap();
        write_export(data.path(), "PIA", 80);
        let summary = trainer.train_all(data.path(), models.path()).unwrap();

        assert_eq!(summary.trained[0].rows, 80 + 40);
        let pkg = DriverModelPackage::load(models.path(), "PIA").unwrap();
        assert_eq!(pkg.driver_id, "PIA");
        assert_eq!(fs::read_dir(models.path()).unwrap().count(), 1);
    }

    #[test]
    fn medium_history_still_prices_hard_stints() {
        let features = FeatureParams::default();
        let training = quick();
        let trainer = DegradationTrainer::new(&features, &training);
        let (pkg, report) = trainer.train_driver("VER", stint_laps(Compound::Medium, 1, 60)).unwrap();

        assert_eq!(report.synthetic_rows, 60);
        assert_eq!(pkg.compound_encoder.classes(), &["HARD", "MEDIUM"]);
        assert_eq!(pkg.features.len(), 8);
        assert!(report.train_mae.is_finite());

        let ctx = context(57);
        let predictor = StintPredictor::new(&pkg, &ctx);
        let medium = predictor.stint_time(Compound::Medium, 1, 20);
        let hard = predictor.stint_time(Compound::Hard, 1, 20);
        // extrapolated HARD is the slower compound on a fresh set
        assert!(hard > medium, "hard {hard} vs medium {medium}");
    }

    #[test]
    fn training_is_deterministic() {
        let features = FeatureParams::default();
        let training = quick();
        let trainer = DegradationTrainer::new(&features, &training);
        let (a, _) = trainer.train_driver("VER", stint_laps(Compound::Soft, 1, 55)).unwrap();
        let (b, _) = trainer.train_driver("VER", stint_laps(Compound::Soft, 1, 55)).unwrap();
        assert_eq!(a.model, b.model);
    }
}
