//! Sensorium Binary Entry Point
//!
//! Runs the collectors on their schedules, or performs one-shot collection,
//! health checking and baseline capture. Core functionality is provided by
//! the `sensorium` library crate.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sensorium::{
    alert::{AlertFile, Notifier},
    collector::{
        Collector, CollectorRegistry, CycleReport, bridge::BridgeCollector, cloud::CloudCollector,
    },
    config::{AppConfig, Secrets},
    health::HealthChecker,
    logging::{LogRotationManager, init_stderr_tracing, init_tracing},
    perf::{BaselineStore, Comparison},
    storage::{ReadingStore, StorageBuilder},
};

/// Sensorium - Reliable Sensor Collection
#[derive(Parser, Debug)]
#[command(name = "sensorium", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        default_value = "config/sensorium.yaml",
        env = "SENSORIUM_CONFIG"
    )]
    config: PathBuf,

    /// Database file path (overrides config file)
    #[arg(long, global = true, env = "SENSORIUM_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Command {
    /// Run collectors on their schedules until Ctrl+C or SIGTERM
    #[default]
    Run,
    /// Run one cycle of each enabled collector and exit
    CollectOnce,
    /// Validate the deployment; exits 0 (pass), 1 (failures) or 2 (critical)
    Health,
    /// Capture one measured cycle per collector into the baseline file
    Baseline,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_default();

    if let Command::Health = command {
        let code = health(&cli).await?;
        std::process::exit(code);
    }

    let mut config = AppConfig::load(&cli.config)?;
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }

    let rotation = match init_tracing(&config.logging) {
        Ok(manager) => Some(manager),
        Err(e) => {
            init_stderr_tracing()?;
            tracing::warn!(error = %e, "File logging unavailable; logging to stderr only");
            None
        }
    };

    tracing::info!("Sensorium - Reliable Sensor Collection");
    tracing::info!(
        config = %cli.config.display(),
        database = %config.database.path.display(),
        command = ?command,
        "Configuration loaded"
    );

    let store = StorageBuilder::from_config(&config.database)?.build().await?;
    if store.is_degraded() {
        tracing::warn!(
            journal_mode = %store.startup_journal_mode(),
            "Running without WAL; concurrent writers will contend for locks"
        );
    }

    let registry = CollectorRegistry::new().await?;
    for collector in build_collectors(&config, &store)? {
        registry.spawn(collector).await?;
    }
    if registry.job_count().await == 0 {
        tracing::warn!("No collectors enabled");
    }

    match command {
        Command::Run => {
            log_reports(&registry.run_once().await);
            registry.start().await?;
            tracing::info!("Press Ctrl+C to shutdown");
            shutdown_signal().await;

            tracing::info!("Shutting down collectors...");
            if let Err(e) = registry.shutdown().await {
                tracing::error!(error = %e, "Failed to shutdown collectors");
            }
        }
        Command::CollectOnce => {
            let reports = registry.run_once().await;
            log_reports(&reports);
            for report in &reports {
                println!("{}", summary(report));
            }
        }
        Command::Baseline => {
            let baseline = BaselineStore::new(&config.performance.baseline_path);
            for report in registry.run_once().await {
                let Some(metric) = report.metric else {
                    continue;
                };
                let line = format!(
                    "{}: {}ms, {} bytes ({})",
                    metric.collector, metric.duration_ms, metric.payload_bytes, metric.optimization
                );
                match baseline.record(metric.clone())? {
                    Some(previous) => {
                        let change = Comparison::between(&previous, &metric);
                        println!(
                            "{line}; duration {}, payload {} vs previous baseline",
                            percent(change.duration_change_pct),
                            percent(change.payload_change_pct)
                        );
                    }
                    None => println!("{line}; no previous baseline"),
                }
            }
            println!("Baseline written to {}", baseline.path().display());
        }
        Command::Health => unreachable!("handled before startup"),
    }

    if let Some(rotation) = rotation {
        log_rotation_status(&rotation);
    }

    tracing::info!("Shutting down storage...");
    if let Err(e) = store.checkpoint().await {
        tracing::warn!(error = %e, "Final WAL checkpoint failed");
    }
    store.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Run the standard health check. Never touches the log directory.
async fn health(cli: &Cli) -> Result<i32, Box<dyn Error>> {
    init_stderr_tracing()?;

    // The config validator reports load failures; the rest run on defaults.
    let mut config = AppConfig::load(&cli.config).unwrap_or_default();
    if let Some(path) = &cli.db_path {
        config.database.path = path.clone();
    }

    let report = HealthChecker::standard(&cli.config, &config).run().await;
    print!("{}", report.render());
    Ok(report.exit_code())
}

/// Build every enabled collector.
fn build_collectors(
    config: &AppConfig,
    store: &ReadingStore,
) -> Result<Vec<Arc<dyn Collector>>, Box<dyn Error>> {
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();
    if config.collectors.enabled_bridge().is_none() && config.collectors.enabled_cloud().is_none()
    {
        return Ok(collectors);
    }

    let secrets = Secrets::load(&config.secrets_path)?;
    secrets.require_for(&config.collectors)?;
    let retry = config.retry.policy()?;

    if let Some(bridge) = config.collectors.enabled_bridge() {
        let credentials = secrets.bridge.as_ref().ok_or("bridge secrets missing")?;
        collectors.push(Arc::new(BridgeCollector::new(
            bridge,
            credentials,
            retry.clone(),
            store.clone(),
        )?));
    }

    if let Some(cloud) = config.collectors.enabled_cloud() {
        let credentials = secrets.cloud.as_ref().ok_or("cloud secrets missing")?;
        let notifier = Notifier::from_config(config.alert.notification.as_ref())?;
        collectors.push(Arc::new(CloudCollector::new(
            cloud,
            credentials,
            retry,
            store.clone(),
            AlertFile::new(&config.alert.path),
            notifier,
        )?));
    }

    Ok(collectors)
}

fn summary(report: &CycleReport) -> String {
    let mut line = format!(
        "{}: devices={} stored={} duplicates={} rejected={} failed={} empty={}",
        report.collector,
        report.devices,
        report.stored,
        report.duplicates,
        report.rejected,
        report.failed,
        report.empty
    );
    if let Some(error) = &report.error {
        line.push_str(&format!(" error=\"{error}\""));
    }
    line
}

fn log_reports(reports: &[CycleReport]) {
    for report in reports {
        tracing::info!(summary = %summary(report), "Initial collection cycle finished");
    }
}

fn percent(change: Option<f64>) -> String {
    change.map_or_else(|| "n/a".to_string(), |pct| format!("{pct:+.1}%"))
}

fn log_rotation_status(rotation: &LogRotationManager) {
    let status = rotation.status();
    tracing::info!(
        active_bytes = status.active_bytes,
        backups = status.backup_count,
        total_bytes = status.total_bytes,
        rotations = status.rotations,
        failed_rotations = status.failed_rotations,
        skipped_low_disk = status.skipped_low_disk,
        "Log rotation status"
    );
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
