// Caller-facing entry point: one request in, one response object out.
// The response is either the full report or an error-only object, never both.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::error;

use crate::config::StrategyRules;
use crate::context::{RaceContext, RaceContextResolver, SessionProvider};
use crate::error::Result;
use crate::model::{DriverModelPackage, StintPredictor};
use crate::strategy::{StrategyCandidate, StrategyEngine};

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyRequest {
    pub driver: String,
    pub gp: String,
    pub year: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyView {
    #[serde(flatten)]
    pub candidate: StrategyCandidate,
    pub formatted_time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyReport {
    pub driver: String,
    pub gp: String,
    pub year: i32,
    pub context: RaceContext,
    pub strategies: Vec<StrategyView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StrategyResponse {
    Success(StrategyReport),
    Failure { error: String },
}

pub fn predict_strategy<P: SessionProvider>(
    req: &StrategyRequest,
    models_dir: &Path,
    rules: &StrategyRules,
    resolver: &mut RaceContextResolver<'_, P>,
) -> StrategyResponse {
    match build_report(req, models_dir, rules, resolver) {
        Ok(report) => StrategyResponse::Success(report),
        Err(e) => {
            error!(driver = %req.driver, gp = %req.gp, year = req.year, error = %e, "strategy request failed");
            StrategyResponse::Failure { error: e.to_string() }
        }
    }
}

fn build_report<P: SessionProvider>(
    req: &StrategyRequest,
    models_dir: &Path,
    rules: &StrategyRules,
    resolver: &mut RaceContextResolver<'_, P>,
) -> Result<StrategyReport> {
    // no model means no answer, before touching the session provider
    let package = DriverModelPackage::load(models_dir, &req.driver)?;
    let context = resolver.resolve(req.year, &req.gp);

    let predictor = StintPredictor::new(&package, &context);
    let strategies = StrategyEngine::new(rules)
        .find_best_strategies(&predictor, &context)
        .into_iter()
        .map(|candidate| StrategyView { formatted_time: format_race_time(candidate.total_time), candidate })
        .collect();

    Ok(StrategyReport { driver: req.driver.clone(), gp: req.gp.clone(), year: req.year, context, strategies })
}

// "1h 32m 3s"
pub fn format_race_time(total_seconds: f64) -> String {
    let secs = total_seconds.max(0.0);
    let hours = (secs / 3600.0).floor();
    let minutes = ((secs % 3600.0) / 60.0).floor();
    let seconds = (secs % 60.0).floor();
    format!("{hours}h {minutes}m {seconds}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextParams;
    use crate::context::{ContextCache, JsonSessionProvider};
    use crate::model::tests::package;

    #[test]
    fn race_time_formatting() {
        assert_eq!(format_race_time(5523.7), "1h 32m 3s");
        assert_eq!(format_race_time(59.99), "0h 0m 59s");
    }

    #[test]
    fn missing_model_is_an_error_only_object() {
        let dir = tempfile::tempdir().unwrap();
        let params = ContextParams::default();
        let mut resolver = RaceContextResolver::new(
            JsonSessionProvider::new(dir.path()),
            ContextCache::open(dir.path().join("race_contexts.json")),
            &params,
        );
        let req = StrategyRequest { driver: "XYZ".into(), gp: "Bahrain Grand Prix".into(), year: 2024 };
        let resp = predict_strategy(&req, dir.path(), &StrategyRules::default(), &mut resolver);

        let json = serde_json::to_value(&resp).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj["error"].as_str().unwrap().contains("XYZ"));
    }

    #[test]
    fn offline_provider_still_yields_a_full_report() {
        let dir = tempfile::tempdir().unwrap();
        package().save(dir.path()).unwrap();
        let params = ContextParams::default();
        let mut resolver = RaceContextResolver::new(
            JsonSessionProvider::new(dir.path().join("sessions")),
            ContextCache::open(dir.path().join("race_contexts.json")),
            &params,
        );
        let req = StrategyRequest { driver: "VER".into(), gp: "Bahrain Grand Prix".into(), year: 2024 };
        let resp = predict_strategy(&req, dir.path(), &StrategyRules::default(), &mut resolver);

        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["context"]["total_laps"], 57);
        assert_eq!(json["context"]["tech_info"]["degradation"], "UNKNOWN");
        let strategies = json["strategies"].as_array().unwrap();
        assert_eq!(strategies.len(), 5);
        for s in strategies {
            assert!(matches!(s["type"].as_str(), Some("1 Stop") | Some("2 Stops")));
            let laps: u64 = s["laps"].as_array().unwrap().iter().map(|v| v.as_u64().unwrap()).sum();
            assert_eq!(laps, 57);
            assert!(s["formatted_time"].as_str().unwrap().contains('h'));
        }
    }
}
