//! Scheduler - One-shot and rolling backups
//!
//! Without an interval a single backup runs into the configured output. With
//! one, every run (the first immediately, the rest on a fixed timer) gets its
//! own rotated snapshot directory under the output, and runs never overlap:
//! a slow backup delays the next tick instead of running alongside it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backup::{BackupConfig, BackupExecutor};
use crate::error::{BackupError, Result};
use crate::rotation;

/// Parse an interval such as `24h`, `1h30m`, `90s` or `500ms`
///
/// A bare number is taken as seconds. Units are `ms`, `s`, `m`, `h` and `d`.
pub fn parse_interval(input: &str) -> Result<Duration> {
    let normalized = input.trim().to_lowercase();
    let invalid = |reason: &str| BackupError::DurationParse {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if normalized.is_empty() {
        return Err(invalid("empty interval"));
    }

    let total = match normalized.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => {
            let mut total = Duration::ZERO;
            let mut rest = normalized.as_str();

            while !rest.is_empty() {
                let number_end = rest
                    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                    .ok_or_else(|| invalid("missing unit"))?;
                if number_end == 0 {
                    return Err(invalid("expected a number"));
                }

                let value: f64 = rest[..number_end]
                    .parse()
                    .map_err(|_| invalid("invalid number"))?;
                rest = &rest[number_end..];

                let unit_end = rest
                    .find(|c: char| c.is_ascii_digit() || c == '.')
                    .unwrap_or(rest.len());
                let seconds_per_unit = match &rest[..unit_end] {
                    "ms" => 0.001,
                    "s" => 1.0,
                    "m" => 60.0,
                    "h" => 3600.0,
                    "d" => 86400.0,
                    _ => return Err(invalid("unknown unit, use ms, s, m, h or d")),
                };
                rest = &rest[unit_end..];

                let segment = Duration::try_from_secs_f64(value * seconds_per_unit)
                    .map_err(|_| invalid("interval out of range"))?;
                total = total
                    .checked_add(segment)
                    .ok_or_else(|| invalid("interval out of range"))?;
            }

            total
        }
    };

    if total.is_zero() {
        return Err(invalid("interval must be greater than zero"));
    }

    Ok(total)
}

/// Run a backup once, or on a rolling schedule when `interval` is set
///
/// In scheduled mode `config.output` is the parent of the snapshot
/// directories. The first run happens before this returns control to the
/// timer, and its failure aborts scheduling. Any later failure stops the
/// schedule and is returned.
pub async fn start_backup(
    executor: Arc<BackupExecutor>,
    mut config: BackupConfig,
    interval: &str,
    max_backups: usize,
) -> Result<()> {
    if interval.trim().is_empty() {
        executor.run(&config).await?;
        return Ok(());
    }

    let period = parse_interval(interval)?;
    let parent = config.output.clone();

    info!(
        "Starting continuous backup every {:?} into {}, keeping {} snapshots",
        period,
        parent.display(),
        max_backups
    );

    run_tick(&executor, &mut config, &parent, max_backups).await?;

    let schedule = tokio::spawn(run_schedule(executor, config, parent, period, max_backups));

    match schedule.await {
        Ok(result) => result,
        Err(e) => Err(BackupError::Scheduler(e.to_string())),
    }
}

/// Await `schedule`, returning early when the process receives ctrl-c
pub async fn run_until_ctrl_c(schedule: impl Future<Output = Result<()>>) -> Result<()> {
    tokio::pin!(schedule);

    tokio::select! {
        result = &mut schedule => result,
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("Shutdown signal received, stopping scheduler");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to listen for ctrl-c: {}", e);
                schedule.await
            }
        },
    }
}

async fn run_schedule(
    executor: Arc<BackupExecutor>,
    mut config: BackupConfig,
    parent: PathBuf,
    period: Duration,
    max_backups: usize,
) -> Result<()> {
    // The first run already happened synchronously
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!("Starting scheduled backup");

        if let Err(e) = run_tick(&executor, &mut config, &parent, max_backups).await {
            error!("Scheduled backup failed, stopping scheduler: {}", e.full_message());
            return Err(e);
        }
    }
}

async fn run_tick(
    executor: &BackupExecutor,
    config: &mut BackupConfig,
    parent: &Path,
    max_backups: usize,
) -> Result<()> {
    let snapshot_parent = parent.to_path_buf();
    config.output = tokio::task::spawn_blocking(move || {
        rotation::rolling_dir(&snapshot_parent, max_backups)
    })
    .await
    .map_err(|e| BackupError::Scheduler(format!("snapshot rotation task failed: {}", e)))??;
    let report = executor.run(config).await?;

    info!(
        "Snapshot {} finished with {} repositories",
        config.output.display(),
        report.repositories
    );
    Ok(())
}
