use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use routespark::backtest::{refresh_learning_snapshots, Backtester, SnapshotRefreshOutcome};
use routespark::cache::ForecastCache;
use routespark::calibration::{BandCalibrator, CalibrationOutcome, CalibratorSettings};
use routespark::cli::{parse_routes_arg, Cli, Command};
use routespark::clock::SystemClock;
use routespark::config::Config;
use routespark::docstore::MemoryDocumentStore;
use routespark::engine::{ForecastEngine, NoLowQuantity};
use routespark::observability::init_tracing;
use routespark::orchestrator::RetrainOrchestrator;
use routespark::queue::{ExportWorker, FsArchiveSource, FsBlobStore, PurgeWorker};
use routespark::storage::{self, OrderStore, PgOrderStore};

fn worker_id(role: &str) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{role}-{host}-{}", std::process::id())
}

/// Flip the shutdown signal on SIGINT/SIGTERM.
fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

struct Services {
    orders: Arc<PgOrderStore>,
    docs: Arc<MemoryDocumentStore>,
    clock: Arc<SystemClock>,
    config: Config,
}

async fn build_services(config: Config) -> anyhow::Result<Services> {
    let pool = storage::connect(&config.database)
        .await
        .context("database connection failed")?;
    Ok(Services {
        orders: Arc::new(PgOrderStore::new(pool)),
        docs: Arc::new(MemoryDocumentStore::new()),
        clock: Arc::new(SystemClock),
        config,
    })
}

fn build_backtester(services: &Services) -> Arc<Backtester> {
    Arc::new(Backtester::new(
        services.orders.clone(),
        services.orders.clone(),
        services.clock.clone(),
        services.config.forecast.clone(),
        services.config.bands.clone(),
        services.config.backtest.clone(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Command::Retrain { interval, once } => {
            let mut config = config;
            if let Some(interval) = interval {
                config.orchestrator.interval_seconds = interval;
            }
            let services = build_services(config).await?;
            let engine = Arc::new(ForecastEngine::new(
                services.orders.clone(),
                services.orders.clone(),
                Arc::new(NoLowQuantity),
                services.clock.clone(),
                services.config.forecast.clone(),
                services.config.bands.clone(),
            ));
            let cache = Arc::new(
                ForecastCache::new(
                    services.docs.clone(),
                    services.orders.clone(),
                    services.clock.clone(),
                )
                .with_snapshot_dir("data/forecast-snapshots".into()),
            );
            let calibrator = Arc::new(BandCalibrator::new(
                services.orders.clone(),
                services.clock.clone(),
                CalibratorSettings::from(&services.config.bands),
            ));
            let backtester = build_backtester(&services);
            let orchestrator = RetrainOrchestrator::new(
                services.orders.clone(),
                services.docs.clone(),
                engine,
                cache,
                calibrator,
                backtester,
                services.clock.clone(),
                services.config.clone(),
            );

            if once {
                let reports = orchestrator.tick().await?;
                info!(routes = reports.len(), "single retrain tick complete");
                return Ok(());
            }
            orchestrator.run(spawn_signal_handler()).await;
        }

        Command::ExportWorker { poll_seconds, once } => {
            let mut config = config;
            if let Some(poll) = poll_seconds {
                config.export.poll_seconds = poll.max(5);
            }
            let services = build_services(config).await?;
            if services.config.export.blob_root.trim().is_empty() {
                return Err(routespark::domain::CoreError::StorageBucketNotConfigured.into());
            }
            let worker = ExportWorker::new(
                services.docs.clone(),
                Arc::new(FsArchiveSource::new("data/archive")),
                Arc::new(FsBlobStore::new(services.config.export.blob_root.clone())),
                services.clock.clone(),
                services.config.export.clone(),
                worker_id("archive-export"),
            );
            if once {
                let claimed = worker.tick().await?;
                info!(claimed, "single export cycle complete");
                return Ok(());
            }
            worker.run(spawn_signal_handler()).await?;
        }

        Command::PurgeWorker { poll_seconds, once } => {
            let mut config = config;
            if let Some(poll) = poll_seconds {
                config.purge.poll_seconds = poll.max(30);
            }
            let services = build_services(config).await?;
            let worker = PurgeWorker::new(
                services.docs.clone(),
                services.orders.clone(),
                Arc::new(FsArchiveSource::new("data/archive")),
                Arc::new(FsBlobStore::new(services.config.export.blob_root.clone())),
                services.clock.clone(),
                services.config.purge.clone(),
                worker_id("archive-purge"),
            );
            if once {
                worker.cycle().await?;
                info!("single purge cycle complete");
                return Ok(());
            }
            worker.run(spawn_signal_handler()).await?;
        }

        Command::Calibrate { routes, force } => {
            let services = build_services(config).await?;
            let routes = match parse_routes_arg(routes.as_deref()) {
                Some(routes) => routes,
                None => services.orders.synced_routes().await?,
            };
            anyhow::ensure!(!routes.is_empty(), "no routes to calibrate");

            let calibrator = BandCalibrator::new(
                services.orders.clone(),
                services.clock.clone(),
                CalibratorSettings::from(&services.config.bands),
            );
            let backtester = build_backtester(&services);

            let mut updated_total = 0usize;
            for route in &routes {
                let run = backtester.run(std::slice::from_ref(route)).await?;
                let outcome = if force {
                    calibrator
                        .calibrate_route(route, &run.folds, &run.sources)
                        .await?
                } else {
                    calibrator
                        .calibrate_route_if_due(route, &run.folds, &run.sources)
                        .await?
                };
                match outcome {
                    CalibrationOutcome::SkippedRecent { days_since_last } => {
                        info!(route, days_since_last, "calibration skipped (recent run)");
                    }
                    CalibrationOutcome::NoData => {
                        info!(route, "calibration skipped (no backtest folds)");
                    }
                    CalibrationOutcome::Updated { schedules } => {
                        let updated = schedules.iter().filter(|s| s.updated).count();
                        updated_total += updated;
                        for schedule in schedules {
                            info!(
                                route,
                                schedule = %schedule.schedule_key,
                                coverage = schedule.observed_coverage,
                                old_scale = schedule.old_scale,
                                new_scale = schedule.new_scale,
                                drift = schedule.drift,
                                skew = schedule.skew,
                                "schedule calibration"
                            );
                        }
                    }
                }
            }
            info!(updated_total, "band calibration complete");
        }

        Command::Backtest {
            routes,
            output_dir,
            max_folds,
            min_train_orders,
        } => {
            let mut config = config;
            if let Some(dir) = output_dir {
                config.backtest.output_dir = dir;
            }
            if let Some(folds) = max_folds {
                config.backtest.max_folds = folds;
            }
            if let Some(min_train) = min_train_orders {
                config.backtest.min_train_orders = min_train;
            }
            let services = build_services(config).await?;
            let routes = match parse_routes_arg(routes.as_deref()) {
                Some(routes) => routes,
                None => services.orders.synced_routes().await?,
            };
            anyhow::ensure!(!routes.is_empty(), "no routes to evaluate");

            let backtester = build_backtester(&services);
            // Force every requested route so snapshots always regenerate.
            let force = routes.iter().cloned().collect();
            let outcome = refresh_learning_snapshots(
                backtester.as_ref(),
                services.orders.clone(),
                services.clock.clone(),
                &services.config.backtest,
                &routes,
                &force,
            )
            .await?;
            match outcome {
                SnapshotRefreshOutcome::Refreshed { paths, .. } => {
                    info!(
                        folds = %paths.folds.display(),
                        scorecard = %paths.scorecard.display(),
                        "backtest snapshots written"
                    );
                }
                SnapshotRefreshOutcome::NoData { .. } => {
                    anyhow::bail!("backtest completed with no folds evaluated");
                }
                _ => {}
            }
        }
    }

    Ok(())
}
