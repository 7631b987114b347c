use crate::error::Result;
use crate::registry::{WorkerRegistry, WorkerStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::warn;

/// Scheduled maintenance passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    Write,
    Zip,
    Defluff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakIntake {
    pub chain: String,
    pub amount: u64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationRecord {
    pub millis: u64,
    pub finished: DateTime<Utc>,
}

/// The part of the stats that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Lifetime {
    inputs: u64,
    outputs: u64,
    start: DateTime<Utc>,
    peak_intake: Option<PeakIntake>,
}

impl Default for Lifetime {
    fn default() -> Self {
        Lifetime {
            inputs: 0,
            outputs: 0,
            start: Utc::now(),
            peak_intake: None,
        }
    }
}

#[derive(Debug)]
struct StatsState {
    lifetime: Lifetime,
    session_inputs: u64,
    session_outputs: u64,
    session_start: DateTime<Utc>,
    next_write: Option<DateTime<Utc>>,
    next_zip: Option<DateTime<Utc>>,
    next_defluff: Option<DateTime<Utc>>,
    durations: BTreeMap<String, DurationRecord>,
}

/// Read-only view handed to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub lifetime_inputs: u64,
    pub lifetime_outputs: u64,
    pub session_inputs: u64,
    pub session_outputs: u64,
    pub lifetime_start: DateTime<Utc>,
    pub session_start: DateTime<Utc>,
    pub lifetime_uptime_secs: i64,
    pub session_uptime_secs: i64,
    pub next_write: Option<DateTime<Utc>>,
    pub next_zip: Option<DateTime<Utc>>,
    pub next_defluff: Option<DateTime<Utc>>,
    pub time_until_write_secs: Option<i64>,
    pub workers: usize,
    pub intake: Vec<WorkerStats>,
    pub peak_intake: Option<PeakIntake>,
    pub durations: BTreeMap<String, DurationRecord>,
}

/// Counters, schedule timestamps and operation durations. Lifetime fields are
/// persisted to the stats document; session fields restart with the process.
#[derive(Debug)]
pub struct Stats {
    path: PathBuf,
    state: Mutex<StatsState>,
}

impl Stats {
    /// Load lifetime counters from `path`. A missing or unreadable document starts fresh.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let lifetime = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "stats document unreadable, starting fresh");
                Lifetime::default()
            }),
            Err(_) => Lifetime::default(),
        };
        Stats {
            path,
            state: Mutex::new(StatsState {
                lifetime,
                session_inputs: 0,
                session_outputs: 0,
                session_start: Utc::now(),
                next_write: None,
                next_zip: None,
                next_defluff: None,
                durations: BTreeMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StatsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state().lifetime)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        fs::write(&temp, bytes)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    pub fn record_input(&self) {
        let mut state = self.state();
        state.lifetime.inputs += 1;
        state.session_inputs += 1;
    }

    pub fn record_output(&self) {
        let mut state = self.state();
        state.lifetime.outputs += 1;
        state.session_outputs += 1;
    }

    /// Keep `amount` as the peak intake if it beats the current record.
    pub fn record_peak(&self, chain: &str, amount: u64) -> bool {
        let mut state = self.state();
        let beaten = state
            .lifetime
            .peak_intake
            .as_ref()
            .is_none_or(|peak| amount > peak.amount);
        if beaten && amount > 0 {
            state.lifetime.peak_intake = Some(PeakIntake {
                chain: chain.to_string(),
                amount,
                time: Utc::now(),
            });
            return true;
        }
        false
    }

    pub fn record_duration(&self, name: &str, elapsed: Duration) {
        self.state().durations.insert(
            name.to_string(),
            DurationRecord {
                millis: elapsed.as_millis() as u64,
                finished: Utc::now(),
            },
        );
    }

    pub fn set_next(&self, pass: Pass, when: DateTime<Utc>) {
        let mut state = self.state();
        match pass {
            Pass::Write => state.next_write = Some(when),
            Pass::Zip => state.next_zip = Some(when),
            Pass::Defluff => state.next_defluff = Some(when),
        }
    }

    pub fn snapshot(&self, registry: &WorkerRegistry) -> StatsSnapshot {
        let intake = registry.worker_stats();
        let now = Utc::now();
        let state = self.state();
        StatsSnapshot {
            lifetime_inputs: state.lifetime.inputs,
            lifetime_outputs: state.lifetime.outputs,
            session_inputs: state.session_inputs,
            session_outputs: state.session_outputs,
            lifetime_start: state.lifetime.start,
            session_start: state.session_start,
            lifetime_uptime_secs: (now - state.lifetime.start).num_seconds(),
            session_uptime_secs: (now - state.session_start).num_seconds(),
            next_write: state.next_write,
            next_zip: state.next_zip,
            next_defluff: state.next_defluff,
            time_until_write_secs: state.next_write.map(|t| (t - now).num_seconds().max(0)),
            workers: intake.len(),
            intake,
            peak_intake: state.lifetime.peak_intake.clone(),
            durations: state.durations.clone(),
        }
    }
}
