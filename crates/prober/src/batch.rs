//! Batch orchestration over a directory tree.
//!
//! Files from all groups are flattened into one task list and dispatched in
//! discovery order through a semaphore-bounded pool. Each result lands in an
//! index-addressed slot, so record order never depends on completion order.

use crate::discover::{discover_groups, FileGroup};
use crate::engine::ProbeEngine;
use crate::parse::ParsedFields;
use crate::record::{BatchResult, ProbeRecord};
use crate::registry::BackendDescriptor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Error type for batch runs
#[derive(Debug, Error)]
pub enum BatchError {
    /// Root is missing or holds no supported audio files
    #[error("no supported audio files found under {0}")]
    EmptyInput(PathBuf),
}

/// Shared cancellation signal. Raising it stops dispatch of new probes;
/// probes already running finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a batch run.
#[derive(Debug, Clone)]
pub struct BatchRun {
    /// One result per group that had at least one probe dispatched
    pub groups: Vec<BatchResult>,
    pub cancelled: bool,
    /// Files never dispatched because of cancellation
    pub skipped_files: usize,
}

struct Dispatched {
    group: usize,
    slot: usize,
    path: PathBuf,
    handle: JoinHandle<ProbeRecord>,
}

/// Runs the probe engine across many files with bounded concurrency.
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    engine: ProbeEngine,
    workers: usize,
}

impl BatchOrchestrator {
    /// A pool of `workers` concurrent probes (at least one).
    pub fn new(engine: ProbeEngine, workers: u32) -> Self {
        Self {
            engine,
            workers: workers.max(1) as usize,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Discover groups under `root` and probe every file with `backend`.
    pub async fn run(
        &self,
        root: &Path,
        backend: Arc<BackendDescriptor>,
        cancel: &CancelFlag,
    ) -> Result<BatchRun, BatchError> {
        let groups = discover_groups(root);
        if groups.is_empty() {
            return Err(BatchError::EmptyInput(root.to_path_buf()));
        }
        info!(
            root = %root.display(),
            groups = groups.len(),
            files = groups.iter().map(|g| g.files.len()).sum::<usize>(),
            workers = self.workers,
            backend = backend.label(),
            "starting batch"
        );
        Ok(self.run_groups(groups, backend, cancel).await)
    }

    /// Probe already-discovered groups.
    pub async fn run_groups(
        &self,
        groups: Vec<FileGroup>,
        backend: Arc<BackendDescriptor>,
        cancel: &CancelFlag,
    ) -> BatchRun {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let tasks: Vec<(usize, usize, &PathBuf)> = groups
            .iter()
            .enumerate()
            .flat_map(|(g, group)| group.files.iter().enumerate().map(move |(i, p)| (g, i, p)))
            .collect();
        let total = tasks.len();

        let mut dispatched = Vec::with_capacity(total);
        for (group, slot, path) in tasks {
            if cancel.is_cancelled() {
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // Waiting for a permit can take a while; check again before starting
            if cancel.is_cancelled() {
                break;
            }

            let engine = self.engine.clone();
            let backend = Arc::clone(&backend);
            let file = path.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                match engine.probe(&file, &backend).await {
                    Ok(record) => record,
                    Err(e) => failed_record(&file, backend.label(), e.to_string()),
                }
            });
            dispatched.push(Dispatched {
                group,
                slot,
                path: path.clone(),
                handle,
            });
        }

        let cancelled = cancel.is_cancelled() && dispatched.len() < total;
        let skipped_files = total - dispatched.len();
        if cancelled {
            warn!(
                dispatched = dispatched.len(),
                skipped = skipped_files,
                "batch cancelled; waiting for in-flight probes"
            );
        }

        let mut slots: Vec<Vec<Option<ProbeRecord>>> =
            groups.iter().map(|g| vec![None; g.files.len()]).collect();
        for task in dispatched {
            let record = match task.handle.await {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %task.path.display(), error = %e, "probe task failed");
                    failed_record(&task.path, backend.label(), format!("probe task failed: {}", e))
                }
            };
            debug!(path = %task.path.display(), status = %record.status, "probe finished");
            slots[task.group][task.slot] = Some(record);
        }

        let results = groups
            .into_iter()
            .zip(slots)
            .filter_map(|(group, slots)| {
                let records: Vec<ProbeRecord> = slots.into_iter().flatten().collect();
                if records.is_empty() {
                    return None;
                }
                let result = BatchResult::finalize(group.name, records);
                info!(
                    group = %result.group_name,
                    total = result.total_count,
                    success = result.success_count,
                    errors = result.error_count,
                    not_found = result.not_found_count,
                    "group finished"
                );
                Some(result)
            })
            .collect();

        BatchRun {
            groups: results,
            cancelled,
            skipped_files,
        }
    }
}

fn failed_record(path: &Path, backend: &str, message: String) -> ProbeRecord {
    ProbeRecord::error(
        path.to_path_buf(),
        backend,
        message,
        &ParsedFields::default(),
        Vec::new(),
        std::fs::metadata(path).ok().map(|m| m.len()),
        String::new(),
    )
}
