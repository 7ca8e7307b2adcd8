// Configuration objects for the engine.
//
// Every rule table the trainer, resolver and search engine read lives here and
// is passed in explicitly, so a different rule set (new tyre allocation,
// different pit lanes) is a config file rather than a code change.
// Every section has working defaults, so a config file only lists overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::{Level, TechProfile};
use crate::data::Compound;
use crate::error::Result;

/// One value per dry compound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompoundTable<T> {
    pub soft: T,
    pub medium: T,
    pub hard: T,
}

impl<T: Copy> CompoundTable<T> {
    pub fn get(&self, compound: Compound) -> T {
        match compound {
            Compound::Soft => self.soft,
            Compound::Medium => self.medium,
            Compound::Hard => self.hard,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathsConfig,
    pub features: FeatureParams,
    pub training: TrainingParams,
    pub rules: StrategyRules,
    pub context: ContextParams,
}

impl EngineConfig {
    /// Loads a JSON config; no path means built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let data = fs::read_to_string(p)?;
                Ok(serde_json::from_str(&data)?)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-driver lap exports, one `<DRIVER>.csv` each.
    pub processed_dir: PathBuf,
    pub models_dir: PathBuf,
    /// Home of the race-context cache and the driver registry.
    pub data_dir: PathBuf,
    /// Exported race sessions read by the session provider.
    pub sessions_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            processed_dir: PathBuf::from("data/processed"),
            models_dir: PathBuf::from("models"),
            data_dir: PathBuf::from("data"),
            sessions_dir: PathBuf::from("data/sessions"),
        }
    }
}

impl PathsConfig {
    pub fn context_cache_path(&self) -> PathBuf {
        self.data_dir.join("race_contexts.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("drivers_metadata.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub min_rows: usize,
    pub require_accurate: bool,
    pub excluded_compounds: Vec<String>,
    /// Seconds added to a MEDIUM lap to stand in for a HARD lap.
    pub hard_lap_time_penalty: f64,
    /// Scale applied to MEDIUM tyre life for the extrapolated HARD rows.
    pub hard_tyre_life_scale: f64,
    /// Stints of this many laps or fewer get `short_stint_weight`.
    pub short_stint_laps: usize,
    pub short_stint_weight: f64,
    pub default_track_temp: f64,
    pub default_air_temp: f64,
    pub default_top_speed: f64,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            min_rows: 50,
            require_accurate: true,
            excluded_compounds: vec!["UNKNOWN".into(), "TEST".into(), "MIXED".into()],
            hard_lap_time_penalty: 0.8,
            hard_tyre_life_scale: 0.8,
            short_stint_laps: 3,
            short_stint_weight: 0.5,
            default_track_temp: 35.0,
            default_air_temp: 25.0,
            default_top_speed: 300.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self { n_estimators: 200, learning_rate: 0.1, max_depth: 4, min_samples_leaf: 1, seed: 42 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyRules {
    /// Share of race distance a compound can cover before it is unusable.
    pub tyre_life_fraction: CompoundTable<f64>,
    /// Standing-start loss by starting compound.
    pub launch_penalty: CompoundTable<f64>,
    /// Lower is softer.
    pub hardness_rank: CompoundTable<u8>,
    /// Flat cost of the extra stop on two-stop plans.
    pub multi_stop_bias: f64,
    /// Stop-lap scan step for one-stop plans.
    pub one_stop_step: usize,
    /// Stint-length scan step for two-stop plans.
    pub two_stop_step: usize,
    /// Shortest opening/closing stint.
    pub min_edge_stint: u32,
    /// Shortest first and middle stint on two-stop plans.
    pub min_inner_stint: u32,
    /// Two-stop first stints stay below this share of the race.
    pub first_stint_share: f64,
    pub top_n: usize,
}

impl Default for StrategyRules {
    fn default() -> Self {
        Self {
            tyre_life_fraction: CompoundTable { soft: 0.35, medium: 0.60, hard: 0.75 },
            launch_penalty: CompoundTable { soft: 0.0, medium: 1.5, hard: 4.0 },
            hardness_rank: CompoundTable { soft: 1, medium: 2, hard: 3 },
            multi_stop_bias: 4.0,
            one_stop_step: 2,
            two_stop_step: 3,
            min_edge_stint: 5,
            min_inner_stint: 10,
            first_stint_share: 0.5,
            top_n: 5,
        }
    }
}

impl StrategyRules {
    pub fn max_life(&self, compound: Compound, total_laps: u32) -> u32 {
        (total_laps as f64 * self.tyre_life_fraction.get(compound)).floor() as u32
    }

    pub fn rank(&self, compound: Compound) -> u8 {
        self.hardness_rank.get(compound)
    }
}

/// Substring rule: applies when `pattern` appears in the circuit name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitRule<T> {
    pub pattern: String,
    pub value: T,
}

impl<T> CircuitRule<T> {
    fn matches(&self, circuit: &str) -> bool {
        circuit.to_lowercase().contains(&self.pattern.to_lowercase())
    }
}

fn first_match<'a, T>(rules: &'a [CircuitRule<T>], circuit: &str) -> Option<&'a T> {
    rules.iter().find(|r| r.matches(circuit)).map(|r| &r.value)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackContext {
    pub total_laps: u32,
    pub track_temp: f64,
    pub air_temp: f64,
    pub avg_top_speed: f64,
}

impl Default for FallbackContext {
    fn default() -> Self {
        Self { total_laps: 57, track_temp: 35.0, air_temp: 25.0, avg_top_speed: 300.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    pub default_pit_loss: f64,
    pub pit_loss_overrides: Vec<CircuitRule<f64>>,
    pub fallback: FallbackContext,
    pub circuits: Vec<CircuitRule<TechProfile>>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            default_pit_loss: 22.5,
            pit_loss_overrides: Vec::new(),
            fallback: FallbackContext::default(),
            circuits: default_circuit_table(),
        }
    }
}

impl ContextParams {
    pub fn pit_loss_for(&self, circuit: &str) -> f64 {
        first_match(&self.pit_loss_overrides, circuit).copied().unwrap_or(self.default_pit_loss)
    }

    pub fn tech_profile_for(&self, circuit: &str) -> TechProfile {
        first_match(&self.circuits, circuit).copied().unwrap_or_default()
    }
}

fn default_circuit_table() -> Vec<CircuitRule<TechProfile>> {
    use Level::*;
    // (pattern, tyre degradation, downforce, overtaking difficulty)
    let rows: [(&str, Level, Level, Level); 20] = [
        ("Bahrain", High, Medium, Low),
        ("Saudi", Low, Low, Medium),
        ("Australian", Medium, Medium, Medium),
        ("Japanese", High, High, High),
        ("Chinese", Medium, Medium, Medium),
        ("Miami", Medium, Medium, Medium),
        ("Emilia", Medium, High, High),
        ("Monaco", Low, High, High),
        ("Canadian", Medium, Low, Low),
        ("Spanish", High, High, High),
        ("Austrian", Medium, Medium, Low),
        ("British", High, High, Medium),
        ("Hungarian", Medium, High, High),
        ("Belgian", Medium, Low, Low),
        ("Dutch", Medium, High, High),
        ("Italian", Low, Low, Low),
        ("Singapore", Medium, High, High),
        ("Qatar", High, High, Medium),
        ("Las Vegas", Low, Low, Low),
        ("Abu Dhabi", Medium, Medium, Medium),
    ];
    rows.into_iter()
        .map(|(pattern, degradation, downforce, overtaking_difficulty)| CircuitRule {
            pattern: pattern.to_string(),
            value: TechProfile { degradation, downforce, overtaking_difficulty },
        })
        .collect()
}
