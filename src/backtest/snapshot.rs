//! Weekly learning-snapshot refresh.
//!
//! Re-runs the walk-forward backtest for routes that are due (or forced),
//! writes CSV snapshots for the learning card, and tracks per-route refresh
//! state so the cadence is deterministic across restarts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::BacktestConfig;
use crate::domain::{RefreshState, RefreshStatus};
use crate::storage::OrderStore;

use super::{summarize_scorecard, Backtester, BacktestResult, FoldMetrics, SourceBreakdownRow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub folds: PathBuf,
    pub scorecard: PathBuf,
    pub sources: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRefreshOutcome {
    NoRoutes,
    SkippedNotDue,
    NoData { routes_due: Vec<String> },
    Refreshed {
        routes_refreshed: Vec<String>,
        routes_no_data: Vec<String>,
        paths: SnapshotPaths,
    },
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> BacktestResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

async fn due_routes(
    store: &dyn OrderStore,
    clock: &dyn Clock,
    routes: &[String],
    force: &HashSet<String>,
    min_days_between_runs: u32,
) -> BacktestResult<Vec<String>> {
    let now = clock.now_utc();
    let mut due = Vec::new();
    for route in routes {
        if force.contains(route) {
            due.push(route.clone());
            continue;
        }
        let state = store.refresh_state_get(route).await?;
        match state.and_then(|s| s.last_refreshed_at) {
            None => due.push(route.clone()),
            Some(last) => {
                if now - last >= Duration::days(min_days_between_runs.max(1) as i64) {
                    due.push(route.clone());
                }
            }
        }
    }
    due.sort();
    due.dedup();
    Ok(due)
}

/// Refresh snapshots for due routes. Retrained routes are passed in `force`
/// so their snapshots update immediately.
pub async fn refresh_learning_snapshots(
    backtester: &Backtester,
    store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    config: &BacktestConfig,
    routes: &[String],
    force: &HashSet<String>,
) -> BacktestResult<SnapshotRefreshOutcome> {
    if routes.is_empty() {
        return Ok(SnapshotRefreshOutcome::NoRoutes);
    }

    let due = due_routes(
        store.as_ref(),
        clock.as_ref(),
        routes,
        force,
        config.refresh_min_days_between_runs,
    )
    .await?;
    if due.is_empty() {
        return Ok(SnapshotRefreshOutcome::SkippedNotDue);
    }
    info!(routes = ?due, "learning snapshot refresh starting");

    let now = clock.now_utc();
    let run = match backtester.run(&due).await {
        Ok(run) => run,
        Err(error) => {
            let message = error.to_string();
            for route in &due {
                let state = RefreshState {
                    route_number: route.clone(),
                    last_refreshed_at: Some(now),
                    last_status: RefreshStatus::Error,
                    last_scorecard_file: None,
                    last_folds_file: None,
                    last_sources_file: None,
                    last_fold_count: 0,
                    last_error: Some(message.clone()),
                };
                if let Err(upsert_error) = store.refresh_state_upsert(&state).await {
                    warn!(route, %upsert_error, "failed recording refresh error");
                }
            }
            return Err(error);
        }
    };

    if run.folds.is_empty() {
        for route in &due {
            let state = RefreshState {
                route_number: route.clone(),
                last_refreshed_at: Some(now),
                last_status: RefreshStatus::NoData,
                last_scorecard_file: None,
                last_folds_file: None,
                last_sources_file: None,
                last_fold_count: 0,
                last_error: None,
            };
            store.refresh_state_upsert(&state).await?;
        }
        return Ok(SnapshotRefreshOutcome::NoData { routes_due: due });
    }

    // Per-route correction proxies feed the scorecard rows.
    let mut proxies = Vec::new();
    for route in &due {
        match store
            .correction_proxies(route, crate::config::ForecastConfig::default().since_days)
            .await
        {
            Ok(mut rows) => proxies.append(&mut rows),
            Err(error) => warn!(route, %error, "correction proxies unavailable"),
        }
    }
    let scorecards = summarize_scorecard(&run.folds, &proxies);

    let out_dir = PathBuf::from(&config.output_dir);
    std::fs::create_dir_all(&out_dir)?;
    let stamp = now.format("%Y%m%d_%H%M%S").to_string();
    let folds_path = out_dir.join(format!("walk_forward_folds_{stamp}.csv"));
    let scorecard_path = out_dir.join(format!("walk_forward_scorecard_{stamp}.csv"));
    let sources_path = out_dir.join(format!("walk_forward_sources_{stamp}.csv"));

    write_csv::<FoldMetrics>(&folds_path, &run.folds)?;
    write_csv(&scorecard_path, &scorecards)?;
    let sources_written = if run.sources.is_empty() {
        None
    } else {
        write_csv::<SourceBreakdownRow>(&sources_path, &run.sources)?;
        Some(sources_path)
    };

    let mut refreshed = Vec::new();
    let mut no_data = Vec::new();
    for route in &due {
        let fold_count = run
            .folds
            .iter()
            .filter(|f| &f.route_number == route)
            .count() as u32;
        let status = if fold_count > 0 {
            refreshed.push(route.clone());
            RefreshStatus::Refreshed
        } else {
            no_data.push(route.clone());
            RefreshStatus::NoData
        };
        let state = RefreshState {
            route_number: route.clone(),
            last_refreshed_at: Some(now),
            last_status: status,
            last_scorecard_file: Some(scorecard_path.display().to_string()),
            last_folds_file: Some(folds_path.display().to_string()),
            last_sources_file: sources_written
                .as_ref()
                .map(|p| p.display().to_string()),
            last_fold_count: fold_count,
            last_error: None,
        };
        store.refresh_state_upsert(&state).await?;
    }

    info!(
        refreshed = refreshed.len(),
        no_data = no_data.len(),
        scorecard = %scorecard_path.display(),
        "learning snapshots refreshed"
    );
    Ok(SnapshotRefreshOutcome::Refreshed {
        routes_refreshed: refreshed,
        routes_no_data: no_data,
        paths: SnapshotPaths {
            folds: folds_path,
            scorecard: scorecard_path,
            sources: sources_written,
        },
    })
}
