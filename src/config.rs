use crate::error::{MarkovError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_WRITE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
}

impl IntervalUnit {
    pub fn as_duration(self) -> Duration {
        match self {
            IntervalUnit::Seconds => Duration::from_secs(1),
            IntervalUnit::Minutes => Duration::from_secs(60),
            IntervalUnit::Hours => Duration::from_secs(3600),
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = MarkovError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(IntervalUnit::Seconds),
            "m" | "min" | "minute" | "minutes" => Ok(IntervalUnit::Minutes),
            "h" | "hour" | "hours" => Ok(IntervalUnit::Hours),
            other => Err(MarkovError::InvalidInput(format!(
                "unknown interval unit '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntervalUnit::Seconds => "seconds",
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
        };
        f.write_str(name)
    }
}

/// Separator and sentinel tokens shared by ingestion, generation and compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    pub separator: String,
    pub start: String,
    pub end: String,
}

impl Keys {
    pub fn is_sentinel(&self, word: &str) -> bool {
        word == self.start || word == self.end
    }
}

/// Engine configuration. Every field has a default so partial JSON documents load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage_dir: PathBuf,
    pub archive_path: Option<PathBuf>,

    pub separator: String,
    pub start_key: String,
    pub end_key: String,
    pub token_group_size: usize,

    pub write_interval: u64,
    pub interval_unit: IntervalUnit,

    pub zip_enabled: bool,
    pub zip_interval_secs: u64,

    pub defluff_enabled: bool,
    pub defluff_threshold: u64,
    pub defluff_interval_secs: u64,

    pub min_chain_parents: usize,
    pub max_walk_steps: usize,
    pub abort_on_shrink: bool,
    pub replace_attempts: usize,
    pub replace_backoff_ms: u64,

    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./markov-chains"),
            archive_path: None,
            separator: " ".to_string(),
            start_key: "b5G(n1$I!4g".to_string(),
            end_key: "e1$D(n7".to_string(),
            token_group_size: 1,
            write_interval: 1,
            interval_unit: IntervalUnit::Minutes,
            zip_enabled: false,
            zip_interval_secs: 6 * 3600,
            defluff_enabled: false,
            defluff_threshold: 15,
            defluff_interval_secs: 24 * 3600,
            min_chain_parents: 0,
            max_walk_steps: 512,
            abort_on_shrink: false,
            replace_attempts: 5,
            replace_backoff_ms: 200,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at a specific storage directory (tests, embedding).
    pub fn with_storage_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            storage_dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration document. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.separator.is_empty() {
            return Err(MarkovError::InvalidInput("separator must not be empty".into()));
        }
        if self.start_key.is_empty() || self.end_key.is_empty() {
            return Err(MarkovError::InvalidInput("sentinel keys must not be empty".into()));
        }
        if self.start_key == self.end_key {
            return Err(MarkovError::InvalidInput(
                "start and end keys must differ".into(),
            ));
        }
        if self.start_key.contains(&self.separator) || self.end_key.contains(&self.separator) {
            return Err(MarkovError::InvalidInput(
                "sentinel keys must not contain the separator".into(),
            ));
        }
        if self.token_group_size == 0 {
            return Err(MarkovError::InvalidInput("token_group_size must be at least 1".into()));
        }
        if self.max_walk_steps == 0 {
            return Err(MarkovError::InvalidInput("max_walk_steps must be at least 1".into()));
        }
        if self.replace_attempts == 0 {
            return Err(MarkovError::InvalidInput("replace_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn keys(&self) -> Keys {
        Keys {
            separator: self.separator.clone(),
            start: self.start_key.clone(),
            end: self.end_key.clone(),
        }
    }

    /// A zero interval falls back to one minute.
    pub fn write_period(&self) -> Duration {
        if self.write_interval == 0 {
            return DEFAULT_WRITE_PERIOD;
        }
        let unit = self.interval_unit.as_duration().as_secs();
        Duration::from_secs(unit.saturating_mul(self.write_interval))
    }

    pub fn zip_period(&self) -> Duration {
        Duration::from_secs(self.zip_interval_secs.max(1))
    }

    pub fn defluff_period(&self) -> Duration {
        Duration::from_secs(self.defluff_interval_secs.max(1))
    }

    pub fn replace_backoff(&self) -> Duration {
        Duration::from_millis(self.replace_backoff_ms)
    }
}
