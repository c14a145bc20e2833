//! CropWatch - Agricultural Sensor Intelligence
//!
//! Command-line entry point for model training, anomaly detection, and
//! recommendation processing over a local farm database.
//!
//! # Usage
//!
//! ```bash
//! # Seed a local database with synthetic readings
//! cropwatch seed --plots 3 --count 100 --with-anomaly
//!
//! # Train the moisture model from pooled recent readings
//! cropwatch train moisture
//!
//! # Run detection for one plot, or across everything
//! cropwatch detect --plot 1 moisture
//! cropwatch batch-detect
//!
//! # Produce recommendations for the anomaly backlog
//! cropwatch process-pending
//! ```
//!
//! # Environment Variables
//!
//! - `CROPWATCH_CONFIG`: Path to the TOML config (default: ./farm_config.toml)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cropwatch::agent::AgentService;
use cropwatch::config::{self, FarmConfig};
use cropwatch::detector::ModelRepository;
use cropwatch::pipeline::{DetectionService, PairStatus};
use cropwatch::store::{FarmStore, SledStore};
use cropwatch::types::{PlotId, Reading, SensorKind};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "cropwatch")]
#[command(about = "Agricultural sensor anomaly detection and recommendations")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Populate the database with synthetic sensor readings
    Seed {
        /// Number of plots to seed
        #[arg(long, default_value_t = 3)]
        plots: u32,

        /// Readings per (plot, sensor) stream
        #[arg(long, default_value_t = 100)]
        count: usize,

        /// Append a moisture collapse to plot 1 for demo detection
        #[arg(long)]
        with_anomaly: bool,
    },

    /// Train the model for one sensor kind from pooled recent readings
    Train {
        kind: SensorKind,

        /// Newest pooled readings to train on
        #[arg(long, default_value_t = 500)]
        data_points: usize,
    },

    /// Run one detection pass for a (plot, kind) stream
    Detect {
        #[arg(long)]
        plot: PlotId,

        kind: SensorKind,
    },

    /// Run detection across plots and sensor kinds
    BatchDetect {
        /// Restrict to specific plots (default: all known plots)
        #[arg(long, value_delimiter = ',')]
        plots: Option<Vec<PlotId>>,

        /// Restrict to specific kinds (default: all kinds)
        #[arg(long, value_delimiter = ',')]
        kinds: Option<Vec<SensorKind>>,
    },

    /// Show model training status for every sensor kind
    Status,

    /// Generate recommendations for anomalies that lack one
    ProcessPending {
        /// Restrict to one plot
        #[arg(long)]
        plot: Option<PlotId>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    config::init(FarmConfig::load());
    let cfg = config::get();

    let store = SledStore::open(&cfg.paths.data_dir)
        .with_context(|| format!("failed to open database at {}", cfg.paths.data_dir.display()))?;
    let models = ModelRepository::new(&cfg.paths.model_dir);

    match args.command {
        Command::Seed {
            plots,
            count,
            with_anomaly,
        } => seed(&store, plots, count, with_anomaly)?,

        Command::Train { kind, data_points } => {
            let service = DetectionService::new(&store, models);
            let outcome = service.train(kind, data_points)?;
            println!(
                "Trained {} model on {} windows (mean score {:.4}), saved to {}",
                outcome.kind,
                outcome.stats.n_samples,
                outcome.stats.mean_score,
                outcome.model_path.display()
            );
        }

        Command::Detect { plot, kind } => {
            let service = DetectionService::new(&store, models);
            let report = service.detect(plot, kind)?;
            println!(
                "Plot {plot} {kind}: {} windows scored, {} anomalies stored",
                report.total_windows, report.anomalies_detected
            );
            for id in &report.created_record_ids {
                if let Some(record) = store.anomaly(*id)? {
                    println!(
                        "  anomaly #{id}: score {:.3}, confidence {:.3}, severity {}",
                        record.score, record.model_confidence, record.severity
                    );
                }
            }
        }

        Command::BatchDetect { plots, kinds } => {
            let service = DetectionService::new(&store, models);
            let report = service.batch_detect(plots, kinds)?;
            for pair in &report.pairs {
                match pair {
                    PairStatus::Success { plot, kind, anomalies } => {
                        println!("plot {plot} {kind}: {anomalies} anomalies")
                    }
                    PairStatus::Skipped { plot, kind, reason } => {
                        println!("plot {plot} {kind}: skipped ({reason})")
                    }
                    PairStatus::Error { plot, kind, message } => {
                        println!("plot {plot} {kind}: ERROR {message}")
                    }
                }
            }
            println!(
                "{} pairs: {} ok, {} skipped, {} failed, {} anomalies total",
                report.pairs.len(),
                report.succeeded,
                report.skipped,
                report.failed,
                report.total_anomalies
            );
        }

        Command::Status => {
            let service = DetectionService::new(&store, models);
            for kind in SensorKind::ALL {
                let status = service.model_status(kind);
                if status.trained {
                    let trained_on = status
                        .training_date
                        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!(
                        "{kind}: trained on {} samples ({trained_on}), model at {}",
                        status.training_data_size,
                        status.model_path.display()
                    );
                } else {
                    println!("{kind}: not trained");
                }
            }
        }

        Command::ProcessPending { plot } => {
            let service = AgentService::new(&store);
            let summary = service.process_pending(plot)?;
            println!(
                "Processed {}/{} pending anomalies ({} failed)",
                summary.processed, summary.total_pending, summary.failed
            );
        }
    }

    store.flush()?;
    Ok(())
}

/// Seed synthetic readings within each sensor's normal band, optionally
/// ending plot 1's moisture stream with a collapse toward drought levels.
fn seed(store: &SledStore, plots: u32, count: usize, with_anomaly: bool) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(Utc::now().timestamp() as u64);
    let start = Utc::now() - Duration::minutes((count as i64 + 15) * 15);
    let mut inserted = 0usize;

    for plot in 1..=plots {
        for kind in SensorKind::ALL {
            let (center, spread) = match kind {
                SensorKind::Moisture => (60.0, 8.0),
                SensorKind::Temperature => (23.0, 4.0),
                SensorKind::Humidity => (60.0, 10.0),
            };
            for i in 0..count {
                store.insert_reading(Reading {
                    id: 0,
                    plot,
                    kind,
                    value: center + rng.gen_range(-spread..spread),
                    timestamp: start + Duration::minutes(i as i64 * 15),
                    source: "seed".to_string(),
                })?;
                inserted += 1;
            }
        }
    }

    if with_anomaly {
        // Ramp plot 1 moisture down to drought territory
        let mut value: f64 = 60.0;
        for i in 0..12 {
            value -= 2.5;
            store.insert_reading(Reading {
                id: 0,
                plot: 1,
                kind: SensorKind::Moisture,
                value: value.max(33.0),
                timestamp: start + Duration::minutes((count as i64 + i) * 15),
                source: "seed".to_string(),
            })?;
            inserted += 1;
        }
    }

    info!(plots, readings = inserted, "Seeded synthetic data");
    println!("Seeded {inserted} readings across {plots} plots");
    Ok(())
}
