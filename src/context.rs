//! Static per-race parameters for the strategy search.
//!
//! A `RaceContext` is resolved once per (year, event) from the race session
//! and cached on disk indefinitely. Cached entries carry a schema version; an
//! entry written by an older schema, or one missing the tech profile, is
//! treated as a miss and regenerated. When the session cannot be loaded the
//! resolver hands back a fixed fallback context instead of failing, so the
//! search always has something to run on.
//!
//! The cache file has no locking; run one resolver per data directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ContextParams;
use crate::error::{PitwiseError, Result};

pub const CONTEXT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Low,
    Medium,
    High,
    #[default]
    Unknown,
}

/// Coarse technical character of a circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechProfile {
    pub degradation: Level,
    pub downforce: Level,
    pub overtaking_difficulty: Level,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceContext {
    #[serde(default)]
    pub schema_version: u32,
    pub circuit_name: String,
    pub total_laps: u32,
    pub track_temp: f64,
    pub air_temp: f64,
    #[serde(rename = "pit_loss")]
    pub pit_loss_seconds: f64,
    pub avg_top_speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_reference: Option<String>,
    #[serde(default)]
    pub tech_info: Option<TechProfile>,
}

impl RaceContext {
    pub fn is_complete(&self) -> bool {
        self.schema_version >= CONTEXT_SCHEMA_VERSION && self.tech_info.is_some()
    }

    pub fn fallback(event: &str, params: &ContextParams) -> Self {
        Self {
            schema_version: CONTEXT_SCHEMA_VERSION,
            circuit_name: event.to_string(),
            total_laps: params.fallback.total_laps,
            track_temp: params.fallback.track_temp,
            air_temp: params.fallback.air_temp,
            pit_loss_seconds: params.default_pit_loss,
            avg_top_speed: params.fallback.avg_top_speed,
            map_reference: None,
            tech_info: Some(TechProfile::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLap {
    pub lap_number: u32,
    #[serde(default)]
    pub speed_trap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    pub track_temp: f64,
    pub air_temp: f64,
}

// one row of the classification, feeds the driver registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedDriver {
    pub code: String,
    pub full_name: String,
    pub team: String,
}

/// Race session as exported by the telemetry provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceSession {
    pub event_name: String,
    pub laps: Vec<SessionLap>,
    #[serde(default)]
    pub weather: Vec<WeatherSample>,
    #[serde(default)]
    pub map_reference: Option<String>,
    #[serde(default)]
    pub results: Vec<ClassifiedDriver>,
}

pub trait SessionProvider {
    fn load_race(&self, year: i32, event: &str) -> Result<RaceSession>;
}

// reads sessions exported as `<year>_<Event_Name>.json`
pub struct JsonSessionProvider {
    dir: PathBuf,
}

impl JsonSessionProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn session_path(&self, year: i32, event: &str) -> PathBuf {
        self.dir.join(format!("{year}_{}.json", event.replace(' ', "_")))
    }
}

impl SessionProvider for JsonSessionProvider {
    fn load_race(&self, year: i32, event: &str) -> Result<RaceSession> {
        let path = self.session_path(year, event);
        let data = fs::read(&path)
            .map_err(|e| PitwiseError::ContextResolution(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

// raw JSON per entry, so one malformed or outdated entry never poisons the file
pub struct ContextCache {
    path: PathBuf,
    entries: BTreeMap<String, serde_json::Value>,
}

impl ContextCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "race context cache unreadable, starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn key(year: i32, event: &str) -> String {
        format!("{year}_{event}")
    }

    pub fn get(&self, year: i32, event: &str) -> Option<RaceContext> {
        let raw = self.entries.get(&Self::key(year, event))?;
        match serde_json::from_value(raw.clone()) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                debug!(year, event, error = %e, "cached context does not parse");
                None
            }
        }
    }

    pub fn insert(&mut self, year: i32, event: &str, ctx: &RaceContext) -> Result<()> {
        self.entries.insert(Self::key(year, event), serde_json::to_value(ctx)?);
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&self.entries)?)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct RaceContextResolver<'a, P> {
    provider: P,
    cache: ContextCache,
    params: &'a ContextParams,
}

impl<'a, P: SessionProvider> RaceContextResolver<'a, P> {
    pub fn new(provider: P, cache: ContextCache, params: &'a ContextParams) -> Self {
        Self { provider, cache, params }
    }

    #[cfg(test)]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Cached context when complete, otherwise a fresh one (persisted), otherwise the fallback.
    pub fn resolve(&mut self, year: i32, event: &str) -> RaceContext {
        if let Some(ctx) = self.cache.get(year, event) {
            if ctx.is_complete() {
                return ctx;
            }
            info!(year, event, "cached context predates current schema, regenerating");
        }

        match self.fetch(year, event) {
            Ok(ctx) => {
                let stored = self.cache.insert(year, event, &ctx).and_then(|_| self.cache.save());
                if let Err(e) = stored {
                    warn!(path = %self.cache.path().display(), error = %e, "could not persist race context");
                }
                ctx
            }
            Err(e) => {
                warn!(year, event, error = %e, "race context unavailable, using fallback");
                RaceContext::fallback(event, self.params)
            }
        }
    }

    fn fetch(&self, year: i32, event: &str) -> Result<RaceContext> {
        let session = self.provider.load_race(year, event)?;
        let total_laps = session
            .laps
            .iter()
            .map(|l| l.lap_number)
            .max()
            .filter(|&n| n > 0)
            .ok_or_else(|| PitwiseError::ContextResolution(format!("{year} {event}: session has no laps")))?;

        let fallback = &self.params.fallback;
        let track_temp = mean(session.weather.iter().map(|w| w.track_temp)).map(round1).unwrap_or(fallback.track_temp);
        let air_temp = mean(session.weather.iter().map(|w| w.air_temp)).map(round1).unwrap_or(fallback.air_temp);
        let avg_top_speed = mean(session.laps.iter().filter_map(|l| l.speed_trap)).unwrap_or(fallback.avg_top_speed);

        let circuit_name = if session.event_name.trim().is_empty() { event.to_string() } else { session.event_name };
        let ctx = RaceContext {
            schema_version: CONTEXT_SCHEMA_VERSION,
            total_laps,
            track_temp,
            air_temp,
            pit_loss_seconds: self.params.pit_loss_for(&circuit_name),
            avg_top_speed,
            map_reference: session.map_reference,
            tech_info: Some(self.params.tech_profile_for(&circuit_name)),
            circuit_name,
        };
        info!(year, event, laps = ctx.total_laps, circuit = %ctx.circuit_name, "resolved race context");
        Ok(ctx)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.filter(|v| v.is_finite()).fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
