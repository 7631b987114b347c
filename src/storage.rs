use crate::error::{MarkovError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const CHAIN_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";
const STATS_DIR: &str = "stats";

/// Location of every file the engine owns under the storage directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
    archive: Option<PathBuf>,
}

impl StorageLayout {
    pub fn new<P: AsRef<Path>>(base_dir: P, archive: Option<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            archive,
        }
    }

    /// Create the storage and stats directories.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;
        fs::create_dir_all(self.stats_dir())?;
        Ok(())
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.base_dir.join(STATS_DIR)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.stats_dir().join("stats.json")
    }

    pub fn chain_path(&self, name: &str) -> Result<PathBuf> {
        validate_chain_name(name)?;
        Ok(self.base_dir.join(format!("{}.{}", name, CHAIN_EXTENSION)))
    }

    /// Scratch file for a rewrite of `name`; `purpose` keeps concurrent kinds apart.
    pub fn temp_path(&self, name: &str, purpose: &str) -> Result<PathBuf> {
        validate_chain_name(name)?;
        Ok(self
            .base_dir
            .join(format!("{}_{}.{}.{}", name, purpose, CHAIN_EXTENSION, TEMP_EXTENSION)))
    }

    /// Snapshot archive, by default a sibling `<storage_dir>.zip`.
    pub fn archive_path(&self) -> PathBuf {
        match &self.archive {
            Some(path) => path.clone(),
            None => {
                let mut name = self
                    .base_dir
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| "markov-chains".into());
                name.push(".zip");
                self.base_dir.with_file_name(name)
            }
        }
    }

    pub fn archive_temp_path(&self) -> PathBuf {
        let archive = self.archive_path();
        let mut name = archive.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        archive.with_file_name(name)
    }

    /// Names of every chain document in the storage directory, sorted.
    pub fn chain_names(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(CHAIN_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Err(e) = validate_chain_name(stem) {
                warn!(file = %path.display(), error = %e, "ignoring file that is not a chain document");
                continue;
            }
            names.push(stem.to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Delete scratch files left behind by an interrupted rewrite.
    pub fn remove_stale_temp_files(&self) -> Result<usize> {
        if !self.base_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
                fs::remove_file(&path)?;
                debug!(path = %path.display(), "removed stale temporary file");
                removed += 1;
            }
        }
        let archive_temp = self.archive_temp_path();
        if archive_temp.exists() {
            fs::remove_file(&archive_temp)?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Chain names become file names, so path syntax is rejected.
pub fn validate_chain_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name == STATS_DIR;
    if bad {
        return Err(MarkovError::InvalidInput(format!("invalid chain name '{}'", name)));
    }
    Ok(())
}

/// Replace `target` with `replacement`.
///
/// `rename` over an existing file is atomic on POSIX. If it fails the target is
/// removed and the rename retried, up to `attempts` times with `backoff` between tries.
pub fn replace_file(replacement: &Path, target: &Path, attempts: usize, backoff: Duration) -> Result<()> {
    if !replacement.exists() {
        return Err(MarkovError::Io(std::io::Error::new(
            ErrorKind::NotFound,
            format!("replacement {} does not exist", replacement.display()),
        )));
    }
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match fs::rename(replacement, target) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(file = %target.display(), attempt, error = %e, "atomic replace failed");
                match fs::remove_file(target) {
                    Ok(()) => {}
                    Err(remove) if remove.kind() == ErrorKind::NotFound => {}
                    Err(remove) => warn!(file = %target.display(), error = %remove, "could not remove target"),
                }
                if fs::rename(replacement, target).is_ok() {
                    return Ok(());
                }
                last_error = Some(e);
                if attempt < attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }
    Err(MarkovError::Io(last_error.unwrap_or_else(|| {
        std::io::Error::new(ErrorKind::Other, "replace failed")
    })))
}
