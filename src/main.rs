//! Mechanical Karma - race telemetry health scoring
//!
//! # Usage
//!
//! ```bash
//! # Process a telemetry export (optionally with lap markers and results)
//! mechanical-karma ingest --telemetry vir_telemetry.csv \
//!     --lap-start vir_lap_start.csv --lap-end vir_lap_end.csv \
//!     --results results.csv
//!
//! # Re-run inference / karma over the stored feature table
//! mechanical-karma infer
//! mechanical-karma karma-stream --smoothing 0.5 --max-lap 12
//!
//! # Print one vehicle's report
//! mechanical-karma report --vehicle GR86-002 --max-lap 10
//!
//! # HTTP boundary, applying results to every upload
//! mechanical-karma serve --addr 0.0.0.0:5000 --results results.csv
//! ```
//!
//! # Environment Variables
//!
//! - `KARMA_CONFIG`: Path to a TOML config file (default: ./karma_config.toml)
//! - `KARMA_CORS_ORIGINS`: Comma-separated allowed origins for the HTTP API
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use mechanical_karma::api::{create_app, AppState};
use mechanical_karma::config::{self, KarmaConfig};
use mechanical_karma::ingest::{LapBoundaries, RaceResults, RawTable};
use mechanical_karma::{ArtifactStore, Diagnostics, KarmaPipeline, ModelRegistry, ProcessedRace, RaceSideTables};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "mechanical-karma")]
#[command(about = "Race telemetry to per-component mechanical karma")]
#[command(version)]
struct CliArgs {
    /// Config file (overrides KARMA_CONFIG and ./karma_config.toml)
    #[arg(long, global = true, env = "KARMA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory with model artifacts (overrides paths.artifact_dir)
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,

    /// Directory for processed tables (overrides <paths.data_root>/processed)
    #[arg(long, global = true)]
    processed: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Normalize, lap-assign, aggregate, infer and score a telemetry file
    Ingest {
        /// Raw telemetry CSV (long or wide format)
        #[arg(long)]
        telemetry: PathBuf,
        /// Lap start markers CSV
        #[arg(long, requires = "lap_end")]
        lap_start: Option<PathBuf>,
        /// Lap end markers CSV
        #[arg(long, requires = "lap_start")]
        lap_end: Option<PathBuf>,
        /// Race results CSV with STATUS column
        #[arg(long)]
        results: Option<PathBuf>,
    },

    /// Recompute risk predictions from the stored feature table
    Infer,

    /// Recompute the karma stream from the stored feature table
    KarmaStream {
        /// EWMA weight of the previous karma value, in [0, 1)
        #[arg(long)]
        smoothing: Option<f64>,
        /// Only laps up to and including this one
        #[arg(long)]
        max_lap: Option<u32>,
    },

    /// Print a vehicle report as JSON
    Report {
        #[arg(long)]
        vehicle: String,
        #[arg(long)]
        max_lap: Option<u32>,
        /// Race results CSV for the DNF flag
        #[arg(long)]
        results: Option<PathBuf>,
    },

    /// Serve the HTTP API
    Serve {
        /// Override the bind address (default: server.addr)
        #[arg(short, long)]
        addr: Option<String>,
        /// Lap start markers CSV applied to uploads
        #[arg(long, requires = "lap_end")]
        lap_start: Option<PathBuf>,
        /// Lap end markers CSV applied to uploads
        #[arg(long, requires = "lap_start")]
        lap_end: Option<PathBuf>,
        /// Race results CSV applied to uploads
        #[arg(long)]
        results: Option<PathBuf>,
    },
}

// ============================================================================
// Helpers
// ============================================================================

fn load_config(path: Option<&Path>) -> Result<KarmaConfig> {
    match path {
        Some(p) => KarmaConfig::load_from_file(p)
            .with_context(|| format!("Failed to load config from {}", p.display())),
        None => Ok(KarmaConfig::load()),
    }
}

fn load_registry(dir: &Path) -> ModelRegistry {
    let mut diag = Diagnostics::new();
    let registry = ModelRegistry::load(dir, &mut diag);
    if !registry.has_any() {
        warn!(dir = %dir.display(), "No risk model loaded; predictions will be unavailable");
    }
    registry
}

fn stored_race(store: &ArtifactStore, pipeline: &KarmaPipeline<'_>) -> Result<ProcessedRace> {
    pipeline
        .load_stored(store)?
        .with_context(|| format!("No feature table in {}; run `ingest` first", store.dir().display()))
}

fn read_table(path: &Path) -> Result<RawTable> {
    RawTable::from_path(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_results(path: &Path, config: &KarmaConfig) -> Result<RaceResults> {
    RaceResults::from_table(&read_table(path)?, &config.columns.vehicle)
        .with_context(|| format!("Invalid results table {}", path.display()))
}

/// Lap markers and results from the command line. Boundary warnings land in
/// `diag`.
fn load_side_tables(
    config: &KarmaConfig,
    lap_markers: Option<(&Path, &Path)>,
    results: Option<&Path>,
    diag: &mut Diagnostics,
) -> Result<RaceSideTables> {
    let boundaries = match lap_markers {
        Some((start, end)) => Some(LapBoundaries::from_tables(
            &read_table(start)?,
            &read_table(end)?,
            &config.columns.vehicle,
            diag,
        )?),
        None => None,
    };
    let results = results.map(|path| read_results(path, config)).transpose()?;
    Ok(RaceSideTables { boundaries, results })
}

// ============================================================================
// Commands
// ============================================================================

fn run_ingest(
    pipeline: &KarmaPipeline<'_>,
    store: &ArtifactStore,
    telemetry: &Path,
    lap_markers: Option<(&Path, &Path)>,
    results: Option<&Path>,
) -> Result<()> {
    let table = read_table(telemetry)?;
    let mut boundary_diag = Diagnostics::new();
    let side = load_side_tables(pipeline.config(), lap_markers, results, &mut boundary_diag)?;

    let mut race = pipeline.process(&table, side.inputs())?;
    race.diagnostics.extend(boundary_diag);
    pipeline.persist(store, &race)?;

    let summary = race.summary();
    info!(
        vehicles = summary.vehicles.len(),
        laps = summary.total_laps,
        dnf_flags = race.dnf.len(),
        warnings = summary.warnings.len(),
        dir = %store.dir().display(),
        "Ingest complete"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_serve(
    config: KarmaConfig,
    registry: ModelRegistry,
    store: ArtifactStore,
    side: RaceSideTables,
    addr: String,
) -> Result<()> {
    let state = AppState::new(Arc::new(config), Arc::new(registry))
        .with_store(store)
        .with_side_tables(side);
    match state.restore().await {
        Ok(0) => info!("No persisted feature table, waiting for uploads"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to restore persisted features"),
    }

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("HTTP API listening on http://{}/api", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let mut karma_config = load_config(args.config.as_deref())?;
    if let Some(dir) = &args.artifacts {
        karma_config.paths.artifact_dir = dir.clone();
    }
    if let SubCommand::KarmaStream {
        smoothing: Some(s), ..
    } = &args.command
    {
        karma_config.karma.smoothing = *s;
        karma_config.validate()?;
    }
    config::init(karma_config);
    let cfg = config::get();

    let store = ArtifactStore::new(args.processed.clone().unwrap_or_else(|| cfg.processed_dir()));
    let registry = load_registry(&cfg.paths.artifact_dir);

    match args.command {
        SubCommand::Ingest {
            telemetry,
            lap_start,
            lap_end,
            results,
        } => {
            let pipeline = KarmaPipeline::new(cfg, &registry);
            let markers = lap_start.as_deref().zip(lap_end.as_deref());
            run_ingest(&pipeline, &store, &telemetry, markers, results.as_deref())
        }
        SubCommand::Infer => {
            let pipeline = KarmaPipeline::new(cfg, &registry);
            let race = stored_race(&store, &pipeline)?;
            let path = store.save_predictions(&race.predictions)?;
            info!(laps = race.predictions.len(), path = %path.display(), "Predictions written");
            Ok(())
        }
        SubCommand::KarmaStream { max_lap, .. } => {
            let pipeline = KarmaPipeline::new(cfg, &registry);
            let race = stored_race(&store, &pipeline)?;
            let karma = pipeline.karma(&race, max_lap);
            let path = store.save_karma(&karma)?;
            info!(points = karma.len(), max_lap = ?max_lap, path = %path.display(), "Karma stream written");
            Ok(())
        }
        SubCommand::Report {
            vehicle,
            max_lap,
            results,
        } => {
            let pipeline = KarmaPipeline::new(cfg, &registry);
            let mut race = stored_race(&store, &pipeline)?;
            if let Some(path) = results {
                race.apply_results(&read_results(&path, cfg)?);
            }
            let report = pipeline
                .vehicle_report(&race, &vehicle, max_lap)
                .with_context(|| format!("Vehicle '{}' not found", vehicle))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        SubCommand::Serve {
            addr,
            lap_start,
            lap_end,
            results,
        } => {
            let addr = addr.unwrap_or_else(|| cfg.server.addr.clone());
            let markers = lap_start.as_deref().zip(lap_end.as_deref());
            let mut diag = Diagnostics::new();
            let side = load_side_tables(cfg, markers, results.as_deref(), &mut diag)?;
            for warning in diag.messages() {
                warn!(%warning, "Lap marker warning");
            }
            run_serve(cfg.clone(), registry, store, side, addr).await
        }
    }
}
