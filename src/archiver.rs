use crate::error::Result;
use crate::registry::WorkerRegistry;
use crate::storage::{replace_file, StorageLayout};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveOutcome {
    pub entries: usize,
    pub bytes: u64,
}

/// Snapshot every chain file, plus the stats directory, into the archive.
///
/// Each chain is copied under its worker lock, so no chain is caught mid-rewrite,
/// but chains are captured one after another rather than all at once.
pub fn write_archive(
    layout: &StorageLayout,
    registry: &WorkerRegistry,
    attempts: usize,
    backoff: Duration,
) -> Result<ArchiveOutcome> {
    let archive = layout.archive_path();
    let temp = layout.archive_temp_path();
    if let Some(parent) = archive.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let entries = match fill_archive(layout, registry, &temp) {
        Ok(entries) => entries,
        Err(e) => {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
    };

    replace_file(&temp, &archive, attempts, backoff)?;
    let bytes = fs::metadata(&archive)?.len();
    info!(archive = %archive.display(), entries, bytes, "wrote chain archive");
    Ok(ArchiveOutcome { entries, bytes })
}

fn fill_archive(layout: &StorageLayout, registry: &WorkerRegistry, temp: &Path) -> Result<usize> {
    let root = layout
        .base_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("markov-chains")
        .to_string();
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(File::create(temp)?);
    let mut entries = 0;

    for name in layout.chain_names()? {
        let worker = registry.get_or_create(&name);
        let _guard = worker.lock();
        let path = layout.chain_path(&name)?;
        // Removed while we waited for the lock.
        let Ok(file) = File::open(&path) else {
            continue;
        };
        zip.start_file(format!("{}/{}.json", root, name), options)?;
        io::copy(&mut BufReader::new(file), &mut zip)?;
        entries += 1;
        debug!(chain = %name, "archived chain");
    }

    let stats_dir = layout.stats_dir();
    if stats_dir.is_dir() {
        let mut files: Vec<_> = fs::read_dir(&stats_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        for path in files {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            zip.start_file(format!("{}/stats/{}", root, file_name), options)?;
            io::copy(&mut BufReader::new(File::open(&path)?), &mut zip)?;
            entries += 1;
        }
    }

    zip.finish()?.sync_all()?;
    Ok(entries)
}
