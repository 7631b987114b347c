use crate::chain::{Chain, Parent};
use crate::codec::{write_empty, ChainDecoder, ChainEncoder};
use crate::error::{MarkovError, Result};
use crate::storage::{replace_file, StorageLayout};
use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub parents_written: usize,
    pub merged: usize,
    pub appended: usize,
    pub old_size: u64,
    pub new_size: u64,
}

impl MergeOutcome {
    pub fn shrank(&self) -> bool {
        self.new_size < self.old_size
    }
}

/// Merge knobs taken from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub abort_on_shrink: bool,
    pub replace_attempts: usize,
    pub replace_backoff: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            abort_on_shrink: false,
            replace_attempts: 5,
            replace_backoff: Duration::from_millis(200),
        }
    }
}

/// Stream `existing` into `encoder`, folding in the matching parents of `delta`.
///
/// Existing parents keep their order; delta parents with no counterpart on disk
/// are appended afterwards in the order they were first seen. The delta is only
/// borrowed, so a failed merge leaves it intact.
pub fn merge_stream<R: BufRead, W: Write>(
    existing: ChainDecoder<R>,
    delta: &Chain,
    encoder: &mut ChainEncoder<W>,
) -> Result<MergeOutcome> {
    let mut consumed = vec![false; delta.len()];
    let mut outcome = MergeOutcome::default();

    for parent in existing {
        let parent = parent?;
        match delta.position(&parent.word) {
            Some(i) if !consumed[i] => {
                consumed[i] = true;
                let mut merged = parent;
                merged.absorb(&delta.parents()[i]);
                encoder.add(&merged)?;
                outcome.merged += 1;
            }
            _ => {
                if !parent.is_empty() {
                    encoder.add(&parent)?;
                }
            }
        }
    }

    for (parent, used) in delta.parents().iter().zip(&consumed) {
        if !*used && !parent.is_empty() {
            encoder.add(parent)?;
            outcome.appended += 1;
        }
    }

    outcome.parents_written = encoder.entries();
    Ok(outcome)
}

/// Fold `delta` into the chain file for `name` and swap the result in.
///
/// The caller holds the channel lock and clears the delta only on success.
pub fn merge_chain_file(
    layout: &StorageLayout,
    name: &str,
    delta: &Chain,
    options: MergeOptions,
) -> Result<MergeOutcome> {
    let path = layout.chain_path(name)?;
    let temp = layout.temp_path(name, "merge")?;

    if !path.exists() {
        write_empty(&path)?;
    }
    let old_size = fs::metadata(&path)?.len();

    let mut outcome = match write_merged(&path, &temp, delta) {
        Ok(outcome) => outcome,
        Err(e) => {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
    };

    outcome.old_size = old_size;
    outcome.new_size = fs::metadata(&temp)?.len();

    if !delta.is_empty() && outcome.shrank() {
        if options.abort_on_shrink {
            let _ = fs::remove_file(&temp);
            return Err(MarkovError::SizeShrink {
                path,
                old: outcome.old_size,
                new: outcome.new_size,
            });
        }
        warn!(
            chain = %name,
            old_size = outcome.old_size,
            new_size = outcome.new_size,
            "merged chain is smaller than before, possible data loss"
        );
    }

    replace_file(&temp, &path, options.replace_attempts, options.replace_backoff)?;
    debug!(
        chain = %name,
        merged = outcome.merged,
        appended = outcome.appended,
        bytes = outcome.new_size,
        "merged delta into chain"
    );
    Ok(outcome)
}

fn write_merged(path: &Path, temp: &Path, delta: &Chain) -> Result<MergeOutcome> {
    let decoder = ChainDecoder::open(path)?;
    let mut encoder = ChainEncoder::create(temp)?;
    let outcome = merge_stream(decoder, delta, &mut encoder)?;
    encoder.finish_file()?;
    Ok(outcome)
}

/// Collect a whole chain file into memory. Only used where the file is known to be small.
pub fn read_chain_file(layout: &StorageLayout, name: &str) -> Result<Vec<Parent>> {
    ChainDecoder::open(layout.chain_path(name)?)?.collect()
}
