mod api;
mod config;
mod context;
mod data;
mod error;
mod gbdt;
mod model;
mod registry;
mod strategy;
mod trainer;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use api::{predict_strategy, StrategyRequest, StrategyResponse};
use config::EngineConfig;
use context::{ContextCache, JsonSessionProvider, RaceContextResolver, SessionProvider};
use registry::DriverRegistry;
use trainer::DegradationTrainer;

#[derive(Parser, Debug)]
#[command(name = "pitwise", about = "Tyre degradation models and pit-stop strategy search", version)]
struct Cli {
    /// JSON config file; built-in defaults when omitted.
    #[arg(long, global = true, env = "PITWISE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train one model per driver export.
    Train,
    /// Rank pit strategies for a driver at an event.
    Predict {
        #[arg(long)]
        driver: String,
        #[arg(long)]
        gp: String,
        #[arg(long)]
        year: i32,
    },
    /// Resolve (and cache) the race context for an event.
    Context {
        #[arg(long)]
        gp: String,
        #[arg(long)]
        year: i32,
    },
    /// Show the driver registry, optionally importing a session's classification first.
    Drivers {
        #[arg(long, requires = "year")]
        import_gp: Option<String>,
        #[arg(long)]
        year: Option<i32>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

// stdout is reserved for the JSON answer, logs go to stderr
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cfg = match EngineConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            // predict must still answer with a JSON object
            if matches!(cli.command, Commands::Predict { .. }) {
                return print_json(&StrategyResponse::Failure { error: format!("config: {e}") });
            }
            return Err(e).context("loading config");
        }
    };
    let paths = &cfg.paths;

    match cli.command {
        Commands::Train => {
            let trainer = DegradationTrainer::new(&cfg.features, &cfg.training);
            let summary = trainer
                .train_all(&paths.processed_dir, &paths.models_dir)
                .with_context(|| format!("reading {}", paths.processed_dir.display()))?;
            tracing::info!(trained = summary.trained.len(), skipped = summary.skipped.len(), "training finished");
            print_json(&summary)
        }
        Commands::Predict { driver, gp, year } => {
            let mut resolver = RaceContextResolver::new(
                JsonSessionProvider::new(&paths.sessions_dir),
                ContextCache::open(paths.context_cache_path()),
                &cfg.context,
            );
            let req = StrategyRequest { driver, gp, year };
            let resp = predict_strategy(&req, &paths.models_dir, &cfg.rules, &mut resolver);
            print_json(&resp)
        }
        Commands::Context { gp, year } => {
            let mut resolver = RaceContextResolver::new(
                JsonSessionProvider::new(&paths.sessions_dir),
                ContextCache::open(paths.context_cache_path()),
                &cfg.context,
            );
            print_json(&resolver.resolve(year, &gp))
        }
        Commands::Drivers { import_gp, year } => {
            let mut registry = DriverRegistry::open(paths.registry_path());
            if let (Some(gp), Some(year)) = (import_gp, year) {
                let session = JsonSessionProvider::new(&paths.sessions_dir)
                    .load_race(year, &gp)
                    .with_context(|| format!("loading {year} {gp}"))?;
                registry.record_results(year, &session.results);
                registry
                    .save()
                    .with_context(|| format!("writing {}", registry.path().display()))?;
            }
            let drivers: Vec<_> = registry.drivers().collect();
            print_json(&drivers)
        }
    }
}
