//! fleetsync - inspect and maintain the local fleet data cache

mod cli;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use fleetsync_core::{
    adaptive_interval, derive_alerts, top_alerts, AlertSnapshot, BlobStore, CacheStore,
    Collection, FileBlobStore, PatchOutcome, PersistenceBridge, SqliteBlobStore, SyncConfig,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fleetsync",
    version,
    about = "Inspect and maintain the local fleet data cache",
    long_about = "Offline tooling for the fleetsync cache snapshot.\n\
                  \n\
                  Examples:\n\
                    fleetsync inspect                       # Cached collections and their age\n\
                    fleetsync alerts --top 5                # Most severe alerts\n\
                    fleetsync alerts --at 2026-06-01 --json # Alerts as of a date\n\
                    fleetsync replay events.jsonl           # Apply a change-event log\n\
                    fleetsync policy fuels --frequency 12   # Adaptive refresh interval\n\
                    fleetsync clear-cache                   # Drop the snapshot\n\
                  \n\
                  Environment Variables:\n\
                    FLEETSYNC_STATE_DIR                     # Override state directory\n\
                    FLEETSYNC_CONFIG                        # Path to a TOML config\n\
                    FLEETSYNC_LOG                           # Log filter (default: warn)\n\
                    FLEETSYNC_NO_COLOR                      # Disable ANSI colors"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the cache snapshot (default: platform data dir)
    #[arg(long, env = "FLEETSYNC_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Sync configuration file (TOML)
    #[arg(long, env = "FLEETSYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Snapshot storage backend
    #[arg(long, value_enum, default_value_t = Backend::File, global = true)]
    backend: Backend,

    /// Disable ANSI colors (log-friendly)
    #[arg(long, env = "FLEETSYNC_NO_COLOR", global = true)]
    no_color: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    File,
    Sqlite,
}

#[derive(Subcommand)]
enum Command {
    /// Show cached collections, record counts and freshness
    Inspect {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Derive alerts from the cached snapshot
    Alerts {
        /// Show only the N most severe alerts
        #[arg(long, short = 'n')]
        top: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Evaluate as of this date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        at: Option<String>,
    },
    /// Apply a JSON-lines change-event log to the snapshot
    Replay {
        /// One change event per line
        events: PathBuf,
    },
    /// Print the adaptive refresh interval of a collection
    Policy {
        /// Collection name (employees, equipment, vehicles, ...)
        collection: String,
        /// Reads per hour
        #[arg(long, short = 'f', default_value = "0")]
        frequency: f64,
    },
    /// Delete the cache snapshot
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => dirs::data_local_dir()
            .map(|d| d.join("fleetsync"))
            .context("Could not determine state directory")?,
    };
    let config = load_config(cli.config.as_deref(), &state_dir)?;
    let no_color = cli.no_color;

    match cli.command {
        Command::Inspect { json } => {
            run_inspect(&state_dir, cli.backend, config, json, no_color)?;
        }
        Command::Alerts { top, json, at } => {
            run_alerts(&state_dir, cli.backend, config, top, json, at, no_color)?;
        }
        Command::Replay { events } => {
            run_replay(&state_dir, cli.backend, config, &events).await?;
        }
        Command::Policy {
            collection,
            frequency,
        } => {
            run_policy(&config, &collection, frequency)?;
        }
        Command::ClearCache => {
            run_clear_cache(&state_dir, cli.backend, &config)?;
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("FLEETSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Explicit `--config`, else `config.toml` in the state directory, else
/// defaults
fn load_config(explicit: Option<&Path>, state_dir: &Path) -> Result<SyncConfig> {
    if let Some(path) = explicit {
        return SyncConfig::load(path);
    }
    let default_path = state_dir.join("config.toml");
    if default_path.exists() {
        return SyncConfig::load(&default_path);
    }
    Ok(SyncConfig::default())
}

fn open_blobs(state_dir: &Path, backend: Backend) -> Result<Arc<dyn BlobStore>> {
    Ok(match backend {
        Backend::File => Arc::new(FileBlobStore::in_dir(state_dir)),
        Backend::Sqlite => Arc::new(SqliteBlobStore::open(state_dir)?),
    })
}

/// Persistence bridge plus a store hydrated from it
fn open_cache(
    state_dir: &Path,
    backend: Backend,
    config: SyncConfig,
) -> Result<(PersistenceBridge, CacheStore)> {
    let bridge = PersistenceBridge::new(open_blobs(state_dir, backend)?, &config);
    let store = CacheStore::new(Arc::new(config));
    let report = bridge.hydrate(&store, Utc::now());
    if let Some(failure) = report.failure {
        bail!("Failed to read cache snapshot at {}: {}", bridge.describe(), failure);
    }
    if let Some(version) = report.discarded_version {
        eprintln!("Snapshot format v{} is not supported; ignoring it.", version);
    }
    if !report.expired.is_empty() {
        eprintln!(
            "Ignored {} expired collection(s): {}",
            report.expired.len(),
            join(&report.expired)
        );
    }
    Ok((bridge, store))
}

fn run_inspect(
    state_dir: &Path,
    backend: Backend,
    config: SyncConfig,
    json: bool,
    no_color: bool,
) -> Result<()> {
    let (bridge, store) = open_cache(state_dir, backend, config)?;
    if !json {
        println!("Snapshot: {}", bridge.describe());
        println!();
    }
    println!(
        "{}",
        cli::format_entries(&store.snapshot(), Utc::now(), json, no_color)
    );
    Ok(())
}

fn run_alerts(
    state_dir: &Path,
    backend: Backend,
    config: SyncConfig,
    top: Option<usize>,
    json: bool,
    at: Option<String>,
    no_color: bool,
) -> Result<()> {
    let now = match at {
        Some(s) => cli::parse_at(&s)?,
        None => Utc::now(),
    };
    let (_bridge, store) = open_cache(state_dir, backend, config)?;

    let alerts = derive_alerts(&AlertSnapshot::from_store(&store), now);
    let total = alerts.len();
    let alerts = match top {
        Some(n) => top_alerts(alerts, n),
        None => alerts,
    };

    println!("{}", cli::format_alerts(&alerts, json, no_color));
    if !json && alerts.len() < total {
        println!("({} of {} alerts shown)", alerts.len(), total);
    }
    Ok(())
}

async fn run_replay(
    state_dir: &Path,
    backend: Backend,
    config: SyncConfig,
    events_path: &Path,
) -> Result<()> {
    let content = tokio::fs::read_to_string(events_path)
        .await
        .with_context(|| format!("Failed to read event log: {}", events_path.display()))?;
    let (bridge, store) = open_cache(state_dir, backend, config)?;

    let mut seen_ids = HashSet::new();
    let (mut applied, mut ignored, mut rejected) = (0usize, 0usize, 0usize);

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let event = match cli::parse_event_line(line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(line = line_no, error = %format!("{:#}", e), "Skipping event");
                rejected += 1;
                continue;
            }
        };
        if let Some(id) = &event.event_id {
            if !seen_ids.insert(id.clone()) {
                ignored += 1;
                continue;
            }
        }
        match store.patch(event.collection, &event) {
            Ok(PatchOutcome::Ignored) => ignored += 1,
            Ok(_) => applied += 1,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping event");
                rejected += 1;
            }
        }
    }

    let report = bridge.snapshot(&store, Utc::now())?;
    println!(
        "Replayed {}: {} applied, {} ignored, {} rejected",
        events_path.display(),
        applied,
        ignored,
        rejected
    );
    println!(
        "Saved {} collection(s) to {} ({} bytes)",
        report.saved.len(),
        bridge.describe(),
        report.bytes
    );
    if !report.oversized.is_empty() {
        println!("Not persisted (too large): {}", join(&report.oversized));
    }
    Ok(())
}

fn run_policy(config: &SyncConfig, collection: &str, frequency: f64) -> Result<()> {
    let collection: Collection = collection.parse()?;
    if !frequency.is_finite() || frequency < 0.0 {
        bail!("Frequency must be a non-negative number of reads per hour");
    }

    let Some(policy) = config.refresh_policy(collection) else {
        println!("{} has no background refresh policy.", collection);
        return Ok(());
    };
    let interval = adaptive_interval(&policy, frequency);
    println!(
        "{} at {} reads/hour: refresh every {} (base {}, bounds {}..{})",
        collection,
        frequency,
        cli::format_duration(interval),
        cli::format_duration(policy.base_interval),
        cli::format_duration(policy.min_interval),
        cli::format_duration(policy.max_interval),
    );
    Ok(())
}

fn run_clear_cache(state_dir: &Path, backend: Backend, config: &SyncConfig) -> Result<()> {
    let bridge = PersistenceBridge::new(open_blobs(state_dir, backend)?, config);
    bridge.clear()?;
    println!("Cleared cache snapshot at {}", bridge.describe());
    Ok(())
}

fn join(collections: &[Collection]) -> String {
    collections
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
