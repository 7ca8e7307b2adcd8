use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::context::ClassifiedDriver;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub id: String,
    pub name: String,
    pub current_team: String,
    pub last_seen: i32,
}

// driver code -> who they are and where they last raced. informational only,
// the search never reads it.
pub struct DriverRegistry {
    path: PathBuf,
    drivers: BTreeMap<String, DriverRecord>,
}

impl DriverRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let drivers = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "driver registry unreadable, starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self { path, drivers }
    }

    // a newer season moves the driver to the new team; older seasons never overwrite
    pub fn update(&mut self, code: &str, full_name: &str, team: &str, year: i32) {
        match self.drivers.get_mut(code) {
            None => {
                self.drivers.insert(
                    code.to_string(),
                    DriverRecord {
                        id: code.to_string(),
                        name: full_name.to_string(),
                        current_team: team.to_string(),
                        last_seen: year,
                    },
                );
            }
            Some(rec) if year >= rec.last_seen => {
                rec.current_team = team.to_string();
                rec.last_seen = year;
            }
            Some(_) => {}
        }
    }

    pub fn record_results(&mut self, year: i32, results: &[ClassifiedDriver]) {
        for r in results {
            self.update(&r.code, &r.full_name, &r.team, year);
        }
    }

    #[cfg(test)]
    pub fn get(&self, code: &str) -> Option<&DriverRecord> {
        self.drivers.get(code)
    }

    pub fn drivers(&self) -> impl Iterator<Item = &DriverRecord> {
        self.drivers.values()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&self.drivers)?)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_season_moves_team_older_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = DriverRegistry::open(dir.path().join("drivers_metadata.json"));
        reg.update("HAM", "Lewis Hamilton", "Mercedes", 2024);
        reg.update("HAM", "Lewis Hamilton", "Ferrari", 2025);
        reg.update("HAM", "Lewis Hamilton", "McLaren", 2012);

        let ham = reg.get("HAM").unwrap();
        assert_eq!(ham.current_team, "Ferrari");
        assert_eq!(ham.last_seen, 2025);
    }

    #[test]
    fn session_results_register_every_classified_driver() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = DriverRegistry::open(dir.path().join("drivers_metadata.json"));
        reg.record_results(
            2024,
            &[
                ClassifiedDriver { code: "VER".into(), full_name: "Max Verstappen".into(), team: "Red Bull Racing".into() },
                ClassifiedDriver { code: "LEC".into(), full_name: "Charles Leclerc".into(), team: "Ferrari".into() },
            ],
        );
        assert_eq!(reg.drivers().count(), 2);
        assert_eq!(reg.get("LEC").unwrap().last_seen, 2024);
    }

    #[test]
    fn registry_survives_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("drivers_metadata.json");
        let mut reg = DriverRegistry::open(&path);
        reg.update("NOR", "Lando Norris", "McLaren", 2024);
        reg.save().unwrap();

        let reopened = DriverRegistry::open(&path);
        assert_eq!(reopened.drivers().count(), 1);
        assert_eq!(reopened.get("NOR").unwrap().name, "Lando Norris");
    }
}
