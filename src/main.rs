use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use skywatch::config::{LoggingConfig, SkywatchConfig};
use skywatch::detect::engine::ScanEngine;
use skywatch::observation::Domain;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "skywatch",
    about = "Multi-source telemetry anomaly detection for satellites, filings, and markets",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (defaults: $SKYWATCH_CONFIG, /etc/skywatch/skywatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + per-domain scan loops)
    Serve {
        /// Bind address (overrides api.bind)
        #[arg(long, env = "SKYWATCH_BIND")]
        bind: Option<String>,
    },

    /// Load observations from a JSON-lines file
    Ingest {
        /// Input file, one observation record per line
        #[arg(long)]
        file: PathBuf,
    },

    /// Run an anomaly scan now
    Scan {
        /// Domain to scan (orbital, regulatory, market, news); all when omitted
        #[arg(long)]
        domain: Option<Domain>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List anomaly signals
    Signals {
        /// Include expired signals
        #[arg(long)]
        all: bool,

        /// Maximum rows
        #[arg(long, default_value = "50")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show the current cross-source divergence view
    Divergence {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show feed freshness per entity and source
    Freshness {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect the scan schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Ground coverage radius for a satellite altitude
    Footprint {
        /// Altitude above the surface (km)
        #[arg(long)]
        altitude: f64,

        /// Minimum elevation angle (degrees)
        #[arg(long, default_value = "10")]
        elevation: f64,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview (at most 744)
        #[arg(long, default_value = "24", value_parser = clap::value_parser!(u64).range(1..=skywatch::scheduler::MAX_PREVIEW_HOURS))]
        hours: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SkywatchConfig::load(path)?,
        None => SkywatchConfig::load_or_default(),
    };
    init_tracing(&config.logging);
    let config = Arc::new(config);

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, "Starting Skywatch daemon");
            skywatch::serve(config, &bind).await?;
        }
        Commands::Ingest { file } => {
            let pool = skywatch::open_store(&config)?;
            let report = tokio::task::spawn_blocking(move || skywatch::ingest::ingest_file(&pool, &file)).await??;
            println!(
                "Read {} records: {} stored, {} duplicates, {} skipped, {} derived.",
                report.lines, report.stored, report.duplicates, report.skipped, report.derived
            );
        }
        Commands::Scan { domain, json } => {
            let pool = skywatch::open_store(&config)?;
            let engine = ScanEngine::new(pool, config.clone());
            let domains: Vec<Domain> = match domain {
                Some(d) => vec![d],
                None => Domain::ALL.to_vec(),
            };
            let mut reports = Vec::new();
            for d in domains {
                reports.push(engine.run_scan(d).await?);
            }
            if json {
                print_json(&reports)?;
            } else {
                println!(
                    "{:<11} | {:>6} | {:>9} | {:>11} | {:>5} | {:>7} | {:>9}",
                    "Domain", "Series", "Anomalies", "Divergences", "Stale", "Created", "Refreshed"
                );
                println!("{:-<11}-|-{:-<6}-|-{:-<9}-|-{:-<11}-|-{:-<5}-|-{:-<7}-|-{:-<9}", "", "", "", "", "", "", "");
                for r in reports {
                    println!(
                        "{:<11} | {:>6} | {:>9} | {:>11} | {:>5} | {:>7} | {:>9}",
                        r.domain.as_str(),
                        r.series_scanned,
                        r.anomalies,
                        r.divergences,
                        r.stale,
                        r.signals_created,
                        r.signals_refreshed
                    );
                }
            }
        }
        Commands::Signals { all, limit, json } => {
            let pool = skywatch::open_store(&config)?;
            let store = skywatch::signal::SignalStore::new(pool);
            let signals = if all { store.list_all(limit)? } else { store.list_active(Utc::now(), limit)? };
            if json {
                print_json(&signals)?;
            } else if signals.is_empty() {
                println!("No signals.");
            } else {
                println!(
                    "{:<20} | {:<18} | {:<8} | {:<12} | {:>8} | Expires",
                    "Detected", "Type", "Severity", "Entity", "Z"
                );
                for s in signals {
                    println!(
                        "{:<20} | {:<18} | {:<8} | {:<12} | {:>8} | {}",
                        s.detected_at.format("%Y-%m-%d %H:%M:%S"),
                        s.anomaly_type.as_str(),
                        s.severity.as_str(),
                        s.entity_id,
                        fmt_opt(s.z_score),
                        s.expires_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        Commands::Divergence { json } => {
            let pool = skywatch::open_store(&config)?;
            let rows = ScanEngine::new(pool, config.clone()).divergence()?;
            if json {
                print_json(&rows)?;
            } else if rows.is_empty() {
                println!("No entities with comparable dual-source readings.");
            } else {
                for r in rows {
                    println!(
                        "{:<12} {} {} vs {} {} | delta {:.6} | gap {:.1}h | {}",
                        r.entity_id,
                        r.source_a,
                        r.source_a_value,
                        r.source_b,
                        r.source_b_value,
                        r.delta,
                        r.epoch_gap,
                        if r.diverged { "DIVERGED" } else { "ok" }
                    );
                }
            }
        }
        Commands::Freshness { json } => {
            let pool = skywatch::open_store(&config)?;
            let rows = ScanEngine::new(pool, config.clone()).freshness(Utc::now())?;
            if json {
                print_json(&rows)?;
            } else if rows.is_empty() {
                println!("No observations or tracked entities.");
            } else {
                println!("{:<12} | {:<11} | {:>9} | Tier", "Entity", "Source", "Hours old");
                for r in rows {
                    println!(
                        "{:<12} | {:<11} | {:>9} | {}",
                        r.entity_id,
                        r.source.as_str(),
                        r.hours_old.map(|h| format!("{:.1}", h)).unwrap_or_else(|| "-".to_string()),
                        r.tier.as_str()
                    );
                }
            }
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::DryRun { hours } => {
                let scheduler = skywatch::scheduler::Scheduler::from_config(&config)?;
                let preview = scheduler.preview_next_runs(Utc::now(), hours);
                if preview.is_empty() {
                    println!("No runs scheduled in next {} hours.", hours);
                } else {
                    println!("Upcoming runs (next {} hours):", hours);
                    for run in preview {
                        println!("{} : {} scan", run.at.to_rfc3339(), run.domain);
                    }
                }
            }
        },
        Commands::Footprint { altitude, elevation } => {
            let radius = skywatch::geometry::footprint_radius_km(altitude, elevation);
            let half_angle = skywatch::geometry::footprint_half_angle(altitude, elevation);
            println!(
                "Altitude {:.1} km, min elevation {:.1} deg: footprint radius {:.2} km (half-angle {:.3} deg)",
                altitude,
                elevation,
                radius,
                skywatch::geometry::rad_to_deg(half_angle)
            );
        }
    }

    Ok(())
}
