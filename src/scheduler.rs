use crate::engine::Engine;
use crate::stats::Pass;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

pub struct SchedulerHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the timers and wait for passes already started to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task failed");
        }
    }
}

/// Start the write, zip and defluff timers. Must be called inside a tokio runtime.
pub fn start(engine: Arc<Engine>) -> SchedulerHandle {
    let shutdown = Arc::new(Notify::new());
    let task = tokio::spawn(run(engine, shutdown.clone()));
    SchedulerHandle { shutdown, task }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn schedule_next(engine: &Engine, pass: Pass, period: Duration) {
    if let Ok(delta) = chrono::Duration::from_std(period) {
        engine.stats_tracker().set_next(pass, Utc::now() + delta);
    }
}

async fn run(engine: Arc<Engine>, shutdown: Arc<Notify>) {
    let config = engine.config().clone();
    let write_period = config.write_period();
    let zip_period = config.zip_period();
    let defluff_period = config.defluff_period();

    let mut write = ticker(write_period);
    let mut zip = config.zip_enabled.then(|| ticker(zip_period));
    let mut defluff = config.defluff_enabled.then(|| ticker(defluff_period));

    schedule_next(&engine, Pass::Write, write_period);
    if zip.is_some() {
        schedule_next(&engine, Pass::Zip, zip_period);
    }
    if defluff.is_some() {
        schedule_next(&engine, Pass::Defluff, defluff_period);
    }
    info!(
        write_secs = write_period.as_secs(),
        zip = config.zip_enabled,
        defluff = config.defluff_enabled,
        "scheduler started"
    );

    let mut passes = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                break;
            }
            _ = write.tick() => {
                schedule_next(&engine, Pass::Write, write_period);
                let engine = engine.clone();
                passes.spawn_blocking(move || {
                    engine.write_cycle();
                });
            }
            _ = tick(&mut zip) => {
                schedule_next(&engine, Pass::Zip, zip_period);
                let engine = engine.clone();
                passes.spawn_blocking(move || {
                    if let Err(e) = engine.zip() {
                        error!(error = %e, "zip failed");
                    }
                });
            }
            _ = tick(&mut defluff) => {
                schedule_next(&engine, Pass::Defluff, defluff_period);
                let engine = engine.clone();
                passes.spawn_blocking(move || {
                    engine.defluff();
                });
            }
            Some(finished) = passes.join_next(), if !passes.is_empty() => {
                if let Err(e) = finished {
                    error!(error = %e, "maintenance pass panicked");
                }
            }
        }
    }

    debug!(in_flight = passes.len(), "scheduler stopping");
    while let Some(finished) = passes.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "maintenance pass panicked");
        }
    }
    info!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, IntervalUnit};

    #[tokio::test]
    async fn test_scheduler_flushes_on_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_storage_dir(dir.path());
        config.write_interval = 1;
        config.interval_unit = IntervalUnit::Seconds;
        let engine = Arc::new(Engine::open(config).unwrap());
        engine.ingest("chan", "tick tock");

        let handle = start(engine.clone());
        tokio::time::sleep(Duration::from_millis(1600)).await;
        handle.shutdown().await;

        assert!(engine.layout().chain_path("chan").unwrap().exists());
        assert!(engine.registry().get("chan").unwrap().lock().delta.is_empty());
        assert!(engine.stats().next_write.is_some());
        assert!(engine.stats().next_zip.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_before_first_tick() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(Engine::open(EngineConfig::with_storage_dir(dir.path())).unwrap());
        engine.ingest("chan", "never flushed");
        let handle = start(engine.clone());
        handle.shutdown().await;
        assert!(!engine.layout().chain_path("chan").unwrap().exists());
    }
}
