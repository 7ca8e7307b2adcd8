use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use csv::ReaderBuilder;
use tracing::{debug, warn};

use crate::config::FeatureParams;
use crate::error::{PitwiseError, Result};

// tyre hardness category. anything else the feed emits (UNKNOWN, TEST, MIXED,
// wets) is rejected when a row crosses into LapRecord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Compound {
    Soft,
    Medium,
    Hard,
}

impl Compound {
    pub const ALL: [Compound; 3] = [Compound::Soft, Compound::Medium, Compound::Hard];

    pub fn as_str(self) -> &'static str {
        match self {
            Compound::Soft => "SOFT",
            Compound::Medium => "MEDIUM",
            Compound::Hard => "HARD",
        }
    }
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compound {
    type Err = PitwiseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "SOFT" => Ok(Compound::Soft),
            "MEDIUM" => Ok(Compound::Medium),
            "HARD" => Ok(Compound::Hard),
            other => Err(PitwiseError::InvalidCompound(other.to_string())),
        }
    }
}

// renaming all the columns of the per-driver export we need to use
#[derive(Debug, Deserialize)]
struct RawLapRow {
    #[serde(rename = "LapTimeSec")] lap_time_seconds: Option<f64>,
    #[serde(rename = "RaceLapNumber")] race_lap_number: Option<f64>,
    #[serde(rename = "TyreLife")] tyre_life: Option<f64>,
    #[serde(rename = "Compound")] compound: String,
    #[serde(rename = "Stint")] stint: Option<f64>,
    #[serde(rename = "Driver")] driver: String,
    #[serde(rename = "Year")] year: i32,
    #[serde(rename = "Circuit")] circuit: String,
    #[serde(rename = "SessionType")] session_type: String,
    #[serde(rename = "TrackTemp")] track_temp: Option<f64>,
    #[serde(rename = "AirTemp")] air_temp: Option<f64>,
    #[serde(rename = "IsFreshTyre", default)] is_fresh_tyre: Option<f64>,
    #[serde(rename = "TopSpeed", default)] top_speed: Option<f64>,
    #[serde(rename = "IsAccurate", default)] is_accurate: Option<String>,
}

// one cleaned lap. immutable once the builder is done with it.
#[derive(Debug, Clone, PartialEq)]
pub struct LapRecord {
    pub driver_id: String,
    pub year: i32,
    pub circuit_name: String,
    pub session_type: String,
    pub stint_id: u32,
    pub race_lap_number: u32,
    pub tyre_life: f64,
    pub compound: Compound,
    pub track_temp: f64,
    pub air_temp: f64,
    pub top_speed: f64,
    pub is_fresh_tyre: bool,
    pub lap_time_seconds: f64,
    pub sample_weight: f64,
    /// Row was extrapolated from another compound rather than observed.
    pub is_synthetic: bool,
}

// rows that passed the filters but still have sensor gaps (temps, speed trap)
struct PartialLap {
    lap: LapRecord,
    track_temp: Option<f64>,
    air_temp: Option<f64>,
    top_speed: Option<f64>,
}

fn flag_is_true(raw: &Option<String>) -> bool {
    // column absent means the export was already filtered upstream
    match raw.as_deref().map(|s| s.trim().to_lowercase()) {
        None => true,
        Some(s) => matches!(s.as_str(), "true" | "1" | "1.0" | "yes" | ""),
    }
}

/// Reads a driver's lap export and applies the ingestion filters.
///
/// Drops inaccurate laps, excluded or unparseable compounds, and rows without a
/// lap time, tyre life or lap number. Gaps in temperature and top speed are
/// filled with the driver's mean for that column.
pub fn load_driver_laps<P: AsRef<Path>>(path: P, params: &FeatureParams) -> Result<Vec<LapRecord>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path.as_ref())?;
    let mut rows = Vec::new();
    let mut rejected_compounds = 0usize;

    for res in reader.deserialize() {
        let raw: RawLapRow = res?;
        if params.require_accurate && !flag_is_true(&raw.is_accurate) {
            continue;
        }
        let label = raw.compound.trim().to_uppercase();
        if params.excluded_compounds.iter().any(|c| c.eq_ignore_ascii_case(&label)) {
            continue;
        }
        let compound = match label.parse::<Compound>() {
            Ok(c) => c,
            Err(_) => {
                rejected_compounds += 1;
                continue;
            }
        };
        let (lap_time, tyre_life, lap_number) = match (raw.lap_time_seconds, raw.tyre_life, raw.race_lap_number) {
            (Some(t), Some(l), Some(n)) if t.is_finite() && l.is_finite() && n >= 1.0 => (t, l, n),
            _ => continue,
        };

        rows.push(PartialLap {
            lap: LapRecord {
                driver_id: raw.driver,
                year: raw.year,
                circuit_name: raw.circuit,
                session_type: raw.session_type,
                stint_id: raw.stint.map_or(0, |s| s.max(0.0).round() as u32),
                race_lap_number: lap_number.round() as u32,
                tyre_life,
                compound,
                track_temp: 0.0,
                air_temp: 0.0,
                top_speed: 0.0,
                is_fresh_tyre: raw.is_fresh_tyre.map_or(true, |f| f != 0.0),
                lap_time_seconds: lap_time,
                sample_weight: 1.0,
                is_synthetic: false,
            },
            track_temp: raw.track_temp.filter(|v| v.is_finite()),
            air_temp: raw.air_temp.filter(|v| v.is_finite()),
            top_speed: raw.top_speed.filter(|v| v.is_finite()),
        });
    }

    if rejected_compounds > 0 {
        debug!(rejected = rejected_compounds, "dropped laps on compounds outside SOFT/MEDIUM/HARD");
    }

    let track_mean = mean_of(rows.iter().filter_map(|r| r.track_temp)).unwrap_or(params.default_track_temp);
    let air_mean = mean_of(rows.iter().filter_map(|r| r.air_temp)).unwrap_or(params.default_air_temp);
    let speed_mean = mean_of(rows.iter().filter_map(|r| r.top_speed)).unwrap_or(params.default_top_speed);

    Ok(rows
        .into_iter()
        .map(|p| {
            let mut lap = p.lap;
            lap.track_temp = p.track_temp.unwrap_or(track_mean);
            lap.air_temp = p.air_temp.unwrap_or(air_mean);
            lap.top_speed = p.top_speed.unwrap_or(speed_mean);
            lap
        })
        .collect())
}

fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { None } else { Some(sum / n as f64) }
}

// output of the feature builder for one driver
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub laps: Vec<LapRecord>,
    pub synthetic_rows: usize,
}

/// Turns cleaned laps into a weighted, trainable set.
///
/// Rows recorded for another driver are dropped first. The row threshold is
/// checked on observed laps only, before any synthetic rows are added.
pub fn build_training_set(driver_id: &str, mut laps: Vec<LapRecord>, params: &FeatureParams) -> Result<TrainingSet> {
    let before = laps.len();
    laps.retain(|l| l.driver_id == driver_id);
    if laps.len() < before {
        warn!(driver = %driver_id, dropped = before - laps.len(), "export contains laps of other drivers");
    }
    if laps.len() < params.min_rows {
        return Err(PitwiseError::InsufficientTrainingData {
            driver: driver_id.to_string(),
            rows: laps.len(),
            required: params.min_rows,
        });
    }

    extrapolate_hard_from_medium(&mut laps, params);
    let synthetic_rows = laps.iter().filter(|l| l.is_synthetic).count();
    if synthetic_rows > 0 {
        warn!(driver = %driver_id, synthetic = synthetic_rows, "no HARD laps observed, extrapolated from MEDIUM");
    }
    assign_sample_weights(&mut laps, params);

    Ok(TrainingSet { laps, synthetic_rows })
}

// placeholder heuristic: a HARD lap is a MEDIUM lap that is slower and has
// worn proportionally less. only applied when HARD was never run.
pub fn extrapolate_hard_from_medium(laps: &mut Vec<LapRecord>, params: &FeatureParams) {
    if laps.iter().any(|l| l.compound == Compound::Hard) {
        return;
    }
    let synthetic: Vec<LapRecord> = laps
        .iter()
        .filter(|l| l.compound == Compound::Medium)
        .map(|l| LapRecord {
            compound: Compound::Hard,
            lap_time_seconds: l.lap_time_seconds + params.hard_lap_time_penalty,
            tyre_life: l.tyre_life * params.hard_tyre_life_scale,
            is_synthetic: true,
            ..l.clone()
        })
        .collect();
    laps.extend(synthetic);
}

// weight every lap by the length of the stint it belongs to. short stints are
// mostly out-laps, formation laps and neutralised running.
pub fn assign_sample_weights(laps: &mut [LapRecord], params: &FeatureParams) {
    let mut stint_lengths: HashMap<(i32, String, String, u32), usize> = HashMap::new();
    for lap in laps.iter() {
        *stint_lengths.entry(stint_key(lap)).or_default() += 1;
    }
    for lap in laps.iter_mut() {
        let len = stint_lengths.get(&stint_key(lap)).copied().unwrap_or(0);
        lap.sample_weight = if len > params.short_stint_laps { len as f64 } else { params.short_stint_weight };
    }
}

fn stint_key(lap: &LapRecord) -> (i32, String, String, u32) {
    (lap.year, lap.circuit_name.clone(), lap.session_type.clone(), lap.stint_id)
}

/// Dense integer codes for a categorical column, fit per driver.
///
/// Codes follow the sorted order of the labels seen at fit time. Labels never
/// seen during fit map to code 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    classes: Vec<String>,
}

impl CategoryEncoder {
    pub fn fit<'a, I: IntoIterator<Item = &'a str>>(labels: I) -> Self {
        let classes: BTreeSet<String> = labels.into_iter().map(str::to_string).collect();
        Self { classes: classes.into_iter().collect() }
    }

    pub fn transform(&self, label: &str) -> Option<u32> {
        self.classes.binary_search_by(|c| c.as_str().cmp(label)).ok().map(|i| i as u32)
    }

    pub fn encode_or_default(&self, label: &str) -> u32 {
        self.transform(label).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn lap(compound: Compound, stint: u32, lap_no: u32, tyre_life: f64, time: f64) -> LapRecord {
        LapRecord {
            driver_id: "VER".to_string(),
            year: 2024,
            circuit_name: "Bahrain Grand Prix".to_string(),
            session_type: "R".to_string(),
            stint_id: stint,
            race_lap_number: lap_no,
            tyre_life,
            compound,
            track_temp: 35.0,
            air_temp: 25.0,
            top_speed: 310.0,
            is_fresh_tyre: true,
            lap_time_seconds: time,
            sample_weight: 1.0,
            is_synthetic: false,
        }
    }

    // n laps in one long stint on the given compound, linear degradation
    pub(crate) fn stint_laps(compound: Compound, stint: u32, n: u32) -> Vec<LapRecord> {
        (1..=n).map(|i| lap(compound, stint, i, i as f64, 95.0 + 0.05 * i as f64)).collect()
    }

    const HEADER: &str = "LapTimeSec,RaceLapNumber,TyreLife,Compound,Stint,Driver,Year,Circuit,SessionType,TrackTemp,AirTemp,IsFreshTyre,TopSpeed,IsAccurate";

    #[test]
    fn compound_parsing_is_closed() {
        assert_eq!("soft".parse::<Compound>().unwrap(), Compound::Soft);
        assert_eq!(" HARD ".parse::<Compound>().unwrap(), Compound::Hard);
        assert!("INTERMEDIATE".parse::<Compound>().is_err());
        assert!("MIXED".parse::<Compound>().is_err());
    }

    #[test]
    fn ingestion_applies_filters_and_fills_gaps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER}").unwrap();
        writeln!(file, "95.1,1,1,SOFT,1,VER,2024,Bahrain Grand Prix,R,34.0,24.0,1,300.0,True").unwrap();
        writeln!(file, "95.2,2,2,SOFT,1,VER,2024,Bahrain Grand Prix,R,36.0,26.0,1,,True").unwrap();
        writeln!(file, "95.3,3,3,SOFT,1,VER,2024,Bahrain Grand Prix,R,35.0,25.0,1,320.0,False").unwrap();
        writeln!(file, "95.4,4,4,UNKNOWN,1,VER,2024,Bahrain Grand Prix,R,35.0,25.0,1,310.0,True").unwrap();
        writeln!(file, "95.5,5,5,TEST,1,VER,2024,Bahrain Grand Prix,R,35.0,25.0,1,310.0,True").unwrap();
        writeln!(file, ",6,6,MEDIUM,2,VER,2024,Bahrain Grand Prix,R,35.0,25.0,1,310.0,True").unwrap();
        writeln!(file, "96.0,7,,MEDIUM,2,VER,2024,Bahrain Grand Prix,R,35.0,25.0,1,310.0,True").unwrap();
        writeln!(file, "96.1,8,1,INTERMEDIATE,3,VER,2024,Bahrain Grand Prix,R,35.0,25.0,0,310.0,True").unwrap();
        writeln!(file, "96.2,9,2,MEDIUM,2,VER,2024,Bahrain Grand Prix,R,,25.0,0,340.0,True").unwrap();
        // no lap number, so the lap cannot be placed in the race
        writeln!(file, "96.3,,3,MEDIUM,2,VER,2024,Bahrain Grand Prix,R,35.0,25.0,0,310.0,True").unwrap();
        writeln!(file, "96.4,0,4,MEDIUM,2,VER,2024,Bahrain Grand Prix,R,35.0,25.0,0,310.0,True").unwrap();
        file.flush().unwrap();

        let laps = load_driver_laps(file.path(), &FeatureParams::default()).unwrap();
        assert_eq!(laps.len(), 3);
        assert_eq!(laps[0].compound, Compound::Soft);
        // speed gap filled with the mean of observed speeds (300, 340)
        assert!((laps[1].top_speed - 320.0).abs() < 1e-9);
        // track temp gap filled with the mean of 34 and 36
        assert!((laps[2].track_temp - 35.0).abs() < 1e-9);
        assert!(!laps[2].is_fresh_tyre);
        assert!(laps.iter().all(|l| !l.is_synthetic));
        assert_eq!(laps.iter().map(|l| l.race_lap_number).collect::<Vec<_>>(), vec![1, 2, 9]);
    }

    #[test]
    fn threshold_is_fifty_observed_rows() {
        let params = FeatureParams::default();
        let short = stint_laps(Compound::Medium, 1, 49);
        match build_training_set("VER", short, &params) {
            Err(PitwiseError::InsufficientTrainingData { rows, required, .. }) => {
                assert_eq!(rows, 49);
                assert_eq!(required, 50);
            }
            other => panic!("expected insufficient data, got {other:?}"),
        }
        assert!(build_training_set("VER", stint_laps(Compound::Medium, 1, 50), &params).is_ok());
    }

    #[test]
    fn medium_only_driver_gets_synthetic_hard_rows() {
        let params = FeatureParams::default();
        let laps = stint_laps(Compound::Medium, 1, 50);
        let set = build_training_set("VER", laps.clone(), &params).unwrap();

        assert_eq!(set.synthetic_rows, 50);
        let hard: Vec<_> = set.laps.iter().filter(|l| l.compound == Compound::Hard).collect();
        assert_eq!(hard.len(), 50);
        for (syn, orig) in hard.iter().zip(laps.iter()) {
            assert!(syn.is_synthetic);
            assert!((syn.lap_time_seconds - (orig.lap_time_seconds + 0.8)).abs() < 1e-9);
            assert!((syn.tyre_life - orig.tyre_life * 0.8).abs() < 1e-9);
        }
    }

    #[test]
    fn laps_of_other_drivers_do_not_count() {
        let params = FeatureParams::default();
        let mut laps = stint_laps(Compound::Medium, 1, 49);
        laps.extend(stint_laps(Compound::Medium, 2, 10).into_iter().map(|mut l| {
            l.driver_id = "PER".to_string();
            l
        }));
        assert!(matches!(
            build_training_set("VER", laps.clone(), &params),
            Err(PitwiseError::InsufficientTrainingData { rows: 49, .. })
        ));

        laps.extend(stint_laps(Compound::Hard, 3, 5));
        let set = build_training_set("VER", laps, &params).unwrap();
        assert_eq!(set.laps.len(), 54);
        assert!(set.laps.iter().all(|l| l.driver_id == "VER" && !l.is_synthetic));
        assert_eq!(set.synthetic_rows, 0);
    }

    #[test]
    fn observed_hard_suppresses_extrapolation() {
        let params = FeatureParams::default();
        let mut laps = stint_laps(Compound::Medium, 1, 40);
        laps.extend(stint_laps(Compound::Hard, 2, 20));
        let set = build_training_set("VER", laps, &params).unwrap();
        assert_eq!(set.synthetic_rows, 0);
        assert_eq!(set.laps.len(), 60);
    }

    #[test]
    fn short_stints_are_down_weighted() {
        let params = FeatureParams::default();
        let mut laps = stint_laps(Compound::Soft, 1, 3);
        laps.extend(stint_laps(Compound::Soft, 2, 4));
        assign_sample_weights(&mut laps, &params);
        assert!(laps[..3].iter().all(|l| l.sample_weight == 0.5));
        assert!(laps[3..].iter().all(|l| l.sample_weight == 4.0));
    }

    #[test]
    fn same_stint_id_in_other_session_is_a_different_stint() {
        let params = FeatureParams::default();
        let mut laps = stint_laps(Compound::Soft, 1, 5);
        let mut fp2 = stint_laps(Compound::Soft, 1, 2);
        fp2.iter_mut().for_each(|l| l.session_type = "FP2".to_string());
        laps.extend(fp2);
        assign_sample_weights(&mut laps, &params);
        assert_eq!(laps[0].sample_weight, 5.0);
        assert_eq!(laps[6].sample_weight, 0.5);
    }

    #[test]
    fn encoder_codes_are_sorted_and_unseen_falls_back() {
        let enc = CategoryEncoder::fit(["SOFT", "HARD", "MEDIUM", "HARD"]);
        assert_eq!(enc.classes(), &["HARD", "MEDIUM", "SOFT"]);
        assert_eq!(enc.transform("SOFT"), Some(2));
        assert_eq!(enc.transform("WET"), None);
        assert_eq!(enc.encode_or_default("WET"), 0);
    }
}
