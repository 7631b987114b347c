use crate::archiver::{write_archive, ArchiveOutcome};
use crate::compactor::{cleanse_chain_file, cleanse_delta, defluff_chain_file, DefluffOutcome};
use crate::config::{EngineConfig, Keys};
use crate::error::{MarkovError, Result};
use crate::generator::{Generator, Instructions};
use crate::ingest::extract;
use crate::merge::{merge_chain_file, MergeOptions};
use crate::registry::{Worker, WorkerRegistry};
use crate::stats::{Stats, StatsSnapshot};
use crate::storage::{validate_chain_name, StorageLayout};
use crate::tokenizer::Tokenizer;
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Result of one write cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub flushed: usize,
    pub failed: usize,
    pub peak: Option<(String, u64)>,
}

/// Holds the maintenance gate and keeps the busy flag raised until dropped.
struct GateGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    busy: &'a AtomicBool,
}

impl<'a> GateGuard<'a> {
    fn new(guard: MutexGuard<'a, ()>, busy: &'a AtomicBool) -> Self {
        busy.store(true, Ordering::Release);
        GateGuard { _guard: guard, busy }
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// The storage and generation engine for every channel under one storage directory.
///
/// Ingestion and generation may be called from any number of threads. The
/// maintenance passes (`write_cycle`, `defluff`, `zip`, `cleanse`) are
/// serialized by a process-wide gate.
pub struct Engine {
    config: EngineConfig,
    layout: StorageLayout,
    keys: Keys,
    tokenizer: Tokenizer,
    registry: WorkerRegistry,
    gate: Mutex<()>,
    busy: AtomicBool,
    stats: Stats,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let layout = StorageLayout::new(&config.storage_dir, config.archive_path.clone());
        layout.ensure()?;

        let removed = layout.remove_stale_temp_files()?;
        if removed > 0 {
            info!(removed, "removed temporary files from an interrupted run");
        }

        let registry = WorkerRegistry::new();
        for name in layout.chain_names()? {
            registry.get_or_create(&name);
        }
        let stats = Stats::load(layout.stats_path());
        let keys = config.keys();
        let tokenizer = Tokenizer::new(keys.clone(), config.token_group_size);

        info!(
            dir = %layout.base_dir.display(),
            chains = registry.len(),
            "opened chain storage"
        );
        Ok(Engine {
            config,
            layout,
            keys,
            tokenizer,
            registry,
            gate: Mutex::new(()),
            busy: AtomicBool::new(false),
            stats,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn stats_tracker(&self) -> &Stats {
        &self.stats
    }

    fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            abort_on_shrink: self.config.abort_on_shrink,
            replace_attempts: self.config.replace_attempts,
            replace_backoff: self.config.replace_backoff(),
        }
    }

    /// Buffer one message for `channel`. Never touches disk; empty or
    /// unusable input is dropped silently.
    pub fn ingest(&self, channel: &str, text: &str) {
        if validate_chain_name(channel).is_err() {
            debug!(channel, "ignoring message for invalid channel name");
            return;
        }
        let Some(sequence) = self.tokenizer.sequence(text) else {
            return;
        };
        let worker = self.registry.get_or_create(channel);
        {
            let mut state = worker.lock();
            extract(&mut state.delta, &sequence);
            state.intake += 1;
        }
        self.stats.record_input();
    }

    pub fn generate(&self, instructions: &Instructions) -> Result<String> {
        self.generate_with(instructions, &mut rand::thread_rng())
    }

    /// Generate with a caller-supplied random source.
    ///
    /// Fails with `Busy` instead of waiting when the chain is being written.
    pub fn generate_with<R: Rng + ?Sized>(&self, instructions: &Instructions, rng: &mut R) -> Result<String> {
        validate_chain_name(&instructions.chain)?;
        let worker = self
            .registry
            .get(&instructions.chain)
            .ok_or_else(|| MarkovError::NotFound(format!("no chain named '{}'", instructions.chain)))?;
        let _guard = worker
            .try_lock()
            .ok_or_else(|| MarkovError::Busy(format!("chain '{}' is busy", instructions.chain)))?;

        let mut generator = Generator::new(
            self.layout.chain_path(&instructions.chain)?,
            self.keys.clone(),
            self.config.max_walk_steps,
            self.config.min_chain_parents,
        );
        let text = generator.generate(instructions.method, &instructions.target, rng)?;
        self.stats.record_output();
        Ok(text)
    }

    /// True when the chain has a worker and a document on disk, i.e. it can be generated from.
    pub fn chain_exists(&self, name: &str) -> bool {
        if !self.registry.contains(name) {
            return false;
        }
        match self.layout.chain_path(name) {
            Ok(path) => path.is_file(),
            Err(_) => false,
        }
    }

    /// Every registered channel, including those with only buffered input.
    pub fn known_chains(&self) -> Vec<String> {
        self.registry.names()
    }

    /// True while a write, defluff, zip or cleanse pass holds the maintenance gate.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.registry)
    }

    pub fn save_stats(&self) -> Result<()> {
        self.stats.save()
    }

    fn lock_gate(&self) -> GateGuard<'_> {
        GateGuard::new(self.gate.lock().unwrap_or_else(PoisonError::into_inner), &self.busy)
    }

    fn try_gate(&self) -> Option<GateGuard<'_>> {
        let guard = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(GateGuard::new(guard, &self.busy))
    }

    /// Block until no maintenance pass is running.
    pub fn wait_until_idle(&self) {
        drop(self.lock_gate());
    }

    /// Flush every non-empty delta into its chain file.
    ///
    /// Returns `None` without doing anything when another maintenance pass holds the gate.
    #[instrument(level = "debug", skip_all)]
    pub fn write_cycle(&self) -> Option<WriteReport> {
        let Some(_gate) = self.try_gate() else {
            debug!("maintenance in progress, skipping write cycle");
            return None;
        };
        let started = Instant::now();
        let options = self.merge_options();

        let pending: Vec<_> = self
            .registry
            .workers()
            .into_iter()
            .filter(|worker| !worker.lock().delta.is_empty())
            .collect();

        let results = fan_out(pending, |worker| {
            let mut state = worker.lock();
            if state.delta.is_empty() {
                return Ok(None);
            }
            merge_chain_file(&self.layout, worker.name(), &state.delta, options)?;
            let intake = state.intake;
            state.delta.clear();
            state.intake = 0;
            Ok(Some(intake))
        });

        let mut report = WriteReport::default();
        for (name, result) in results {
            match result {
                Ok(Some(intake)) => {
                    report.flushed += 1;
                    if report.peak.as_ref().is_none_or(|(_, best)| intake > *best) {
                        report.peak = Some((name, intake));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(chain = %name, error = %e, "failed to write chain, delta kept for next cycle");
                }
            }
        }

        if let Some((chain, amount)) = &report.peak {
            if self.stats.record_peak(chain, *amount) {
                info!(chain = %chain, amount, "new peak intake");
            }
        }
        if let Err(e) = self.stats.save() {
            warn!(error = %e, "failed to save stats");
        }
        let elapsed = started.elapsed();
        self.stats.record_duration("write", elapsed);
        if report.flushed > 0 || report.failed > 0 {
            info!(
                flushed = report.flushed,
                failed = report.failed,
                elapsed_ms = elapsed.as_millis() as u64,
                "write cycle finished"
            );
        }
        Some(report)
    }

    /// Prune low-weight edges from every chain. Waits for the maintenance gate.
    #[instrument(skip_all, fields(threshold = self.config.defluff_threshold))]
    pub fn defluff(&self) -> DefluffOutcome {
        let _gate = self.lock_gate();
        let started = Instant::now();
        let threshold = self.config.defluff_threshold;
        let options = self.merge_options();

        let results = fan_out(self.registry.workers(), |worker| {
            let _state = worker.lock();
            defluff_chain_file(&self.layout, worker.name(), threshold, options)
        });

        let mut total = DefluffOutcome::default();
        for (name, result) in results {
            match result {
                Ok(outcome) => total += outcome,
                Err(e) => error!(chain = %name, error = %e, "failed to defluff chain"),
            }
        }
        let elapsed = started.elapsed();
        self.stats.record_duration("defluff", elapsed);
        info!(
            threshold,
            edges_removed = total.edges_removed,
            parents_removed = total.parents_removed,
            elapsed_ms = elapsed.as_millis() as u64,
            "defluff finished"
        );
        total
    }

    /// Snapshot the storage directory into the archive. Waits for the maintenance gate.
    #[instrument(skip_all)]
    pub fn zip(&self) -> Result<ArchiveOutcome> {
        let _gate = self.lock_gate();
        let started = Instant::now();
        let outcome = write_archive(
            &self.layout,
            &self.registry,
            self.config.replace_attempts,
            self.config.replace_backoff(),
        )?;
        self.stats.record_duration("zip", started.elapsed());
        Ok(outcome)
    }

    /// Remove every record of `word` from every chain, on disk and in unflushed
    /// deltas. Returns the number of records removed.
    #[instrument(skip(self))]
    pub fn cleanse(&self, word: &str) -> Result<usize> {
        if word.is_empty() || word.contains(self.keys.separator.as_str()) || self.keys.is_sentinel(word) {
            return Err(MarkovError::InvalidInput(format!("cannot cleanse '{}'", word)));
        }
        let _gate = self.lock_gate();
        let started = Instant::now();
        let options = self.merge_options();
        let separator = self.keys.separator.as_str();

        let mut removed = 0;
        let mut first_error = None;
        for worker in self.registry.workers() {
            let mut state = worker.lock();
            removed += cleanse_delta(&mut state.delta, word, separator);
            match cleanse_chain_file(&self.layout, worker.name(), word, separator, options) {
                Ok(count) => removed += count,
                Err(e) => {
                    error!(chain = %worker.name(), error = %e, "failed to cleanse chain");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.stats.record_duration("cleanse", started.elapsed());
        info!(removed, "cleanse finished");
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}

/// Run `task` for every worker, at most `available_parallelism` threads at a time,
/// and collect the results by chain name.
fn fan_out<T, F>(workers: Vec<Arc<Worker>>, task: F) -> Vec<(String, Result<T>)>
where
    T: Send,
    F: Fn(&Worker) -> Result<T> + Sync,
{
    let width = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    let mut results = Vec::with_capacity(workers.len());
    for batch in workers.chunks(width) {
        thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .map(|worker| {
                    let worker: &Worker = worker;
                    let task = &task;
                    (worker, thread::Builder::new().spawn_scoped(scope, move || task(worker)))
                })
                .collect();
            for (worker, handle) in handles {
                let name = worker.name().to_string();
                let result = match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(MarkovError::Other(format!("task for '{}' panicked", name)))),
                    Err(e) => {
                        warn!(chain = %name, error = %e, "could not spawn thread, running inline");
                        task(worker)
                    }
                };
                results.push((name, result));
            }
        });
    }
    results
}
