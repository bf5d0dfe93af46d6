//! Durable run-state persistence and startup reconciliation
//!
//! All run records live in memory and are mirrored to a single JSON file
//! through a serialized write queue. Writes are coalesced: while a write
//! is pending, further save requests fold into it. On startup the stored
//! records are reconciled against the live process table, which is how
//! the orchestrator tolerates its own restarts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::jsonc;
use crate::supervisor::{ProcessStatus, ProcessSupervisor};
use crate::template::RunConfig;

use super::{Run, RunStatus};

/// Errors from the run store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] jsonc::JsoncError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),
}

struct Inner {
    path: PathBuf,
    runs: DashMap<String, Run>,
}

impl Inner {
    fn write_now(&self) -> Result<(), jsonc::JsoncError> {
        let snapshot: BTreeMap<String, Run> = self
            .runs
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        jsonc::write_file_atomic(&self.path, &snapshot)
    }
}

/// Durable key-value store of run records (keys = run ids)
pub struct RunStore {
    inner: Arc<Inner>,
    write_tx: mpsc::Sender<()>,
}

impl RunStore {
    /// Create a store backed by the given file; spawns the writer task
    pub fn new(path: PathBuf) -> Self {
        let inner = Arc::new(Inner {
            path,
            runs: DashMap::new(),
        });

        // Capacity 1: a pending signal absorbs any number of save
        // requests, so writes serialize and coalesce
        let (write_tx, mut write_rx) = mpsc::channel::<()>(1);
        let writer = inner.clone();
        tokio::spawn(async move {
            while write_rx.recv().await.is_some() {
                if let Err(e) = writer.write_now() {
                    error!("Failed to persist run state: {}", e);
                }
            }
        });

        Self { inner, write_tx }
    }

    fn enqueue_write(&self) {
        let _ = self.write_tx.try_send(());
    }

    /// Upsert a run record and schedule a durable write
    pub fn save(&self, run: Run) {
        self.inner.runs.insert(run.id.clone(), run);
        self.enqueue_write();
    }

    /// Mutate a run in place, returning the updated copy
    pub fn update<F>(&self, run_id: &str, mutate: F) -> Result<Run, StoreError>
    where
        F: FnOnce(&mut Run),
    {
        let updated = {
            let mut entry = self
                .inner
                .runs
                .get_mut(run_id)
                .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
            mutate(entry.value_mut());
            entry.value().clone()
        };
        self.enqueue_write();
        Ok(updated)
    }

    /// Mutate a run in memory without scheduling a durable write.
    ///
    /// Used for high-frequency progress updates; callers pair it with
    /// [`RunStore::request_persist`] on their own throttle.
    pub fn update_quiet<F>(&self, run_id: &str, mutate: F) -> Result<Run, StoreError>
    where
        F: FnOnce(&mut Run),
    {
        let mut entry = self
            .inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        mutate(entry.value_mut());
        Ok(entry.value().clone())
    }

    /// Schedule a durable write of the current in-memory state
    pub fn request_persist(&self) {
        self.enqueue_write();
    }

    /// Get a run by id
    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.inner.runs.get(run_id).map(|r| r.value().clone())
    }

    /// All stored runs
    pub fn all(&self) -> Vec<Run> {
        self.inner.runs.iter().map(|r| r.value().clone()).collect()
    }

    /// Number of stored runs
    pub fn count(&self) -> usize {
        self.inner.runs.len()
    }

    /// Remove a run record
    pub fn remove(&self, run_id: &str) -> Option<Run> {
        let removed = self.inner.runs.remove(run_id).map(|(_, r)| r);
        if removed.is_some() {
            self.enqueue_write();
        }
        removed
    }

    /// Write the current state synchronously (shutdown path)
    pub fn flush(&self) -> Result<(), StoreError> {
        Ok(self.inner.write_now()?)
    }

    /// Load stored runs and reconcile them against the live process table.
    ///
    /// A stored run whose compute process is alive is restored as running
    /// (or paused when the scheduler had parked it); a stored `running`
    /// run with no live process becomes `stopped` as of now. Total
    /// generations are re-derived from the on-disk working config so
    /// stale persisted values self-heal.
    pub async fn load(&self, supervisor: &dyn ProcessSupervisor) -> Result<usize, StoreError> {
        if !self.inner.path.exists() {
            info!("No persisted run state at {}", self.inner.path.display());
            return Ok(0);
        }

        let stored: BTreeMap<String, Run> = jsonc::read_file(&self.inner.path)?;
        let processes = supervisor.list().await?;

        let alive = |name: &str| {
            processes.iter().any(|p| {
                p.name == name
                    && matches!(p.status, ProcessStatus::Online | ProcessStatus::Launching)
            })
        };

        let mut count = 0;
        for (id, mut run) in stored {
            if alive(&run.compute_name) {
                run.status = if run.paused_by_scheduler {
                    RunStatus::Paused
                } else {
                    RunStatus::Running
                };
                info!("Reconciled run {} as {} (compute alive)", id, run.status);
            } else if run.status == RunStatus::Running || run.status == RunStatus::Starting {
                run.status = RunStatus::Stopped;
                run.stopped_at = Some(Utc::now());
                info!("Reconciled run {} as stopped (compute gone)", id);
            }

            if let Some(total) = derive_total_generations_from_disk(&run) {
                run.progress.total_generations = Some(total);
            }

            self.inner.runs.insert(id, run);
            count += 1;
        }

        self.enqueue_write();
        Ok(count)
    }
}

/// Total generations from a run config: `ceil(numberOfEvals / batchSize)`,
/// falling back to `maxGenerations` when either divisor field is absent.
pub fn derive_total_generations(config: &RunConfig) -> Option<u64> {
    match (config.number_of_evals, config.batch_size) {
        (Some(evals), Some(batch)) if batch > 0 => Some(evals.div_ceil(batch)),
        _ => config.max_generations,
    }
}

fn derive_total_generations_from_disk(run: &Run) -> Option<u64> {
    match jsonc::read_file::<RunConfig>(&run.run_config_path) {
        Ok(config) => derive_total_generations(&config),
        Err(e) => {
            warn!(
                "Cannot re-derive total generations for {}: {}",
                run.id, e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{new_run_id, Progress};
    use crate::supervisor::{compute_process_name, FakeSupervisor, ProcessSpec};

    fn sample_run(id: &str) -> Run {
        Run {
            id: id.to_string(),
            template_name: "T".into(),
            ecosystem_variant: Some("default".into()),
            status: RunStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            paused_at: None,
            resumed_at: None,
            stopped_at: None,
            ended_at: None,
            pause_count: 1,
            total_active_millis: 12_000,
            time_slice_started_at: None,
            auto_scheduled: true,
            paused_by_scheduler: false,
            compute_name: compute_process_name(id),
            working_dir: PathBuf::from("/tmp/working").join(id),
            service_info: None,
            progress: Progress {
                generation: Some(7),
                ..Default::default()
            },
            run_config_path: PathBuf::from("/nonexistent/evolution-run-config.jsonc"),
            hyperparameters_path: PathBuf::new(),
            wrapper_config_path: PathBuf::new(),
            exit_code: None,
        }
    }

    #[test]
    fn test_derive_total_generations() {
        let mut config = RunConfig::default();
        config.number_of_evals = Some(10_000);
        config.batch_size = Some(32);
        assert_eq!(derive_total_generations(&config), Some(313));

        config.batch_size = None;
        config.max_generations = Some(500);
        assert_eq!(derive_total_generations(&config), Some(500));

        config.max_generations = None;
        assert_eq!(derive_total_generations(&config), None);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-state.json");

        let store = RunStore::new(path.clone());
        let id = new_run_id();
        let run = sample_run(&id);
        store.save(run.clone());
        store.flush().unwrap();

        // Reload into a fresh store against an empty process table
        let supervisor = FakeSupervisor::new();
        let reloaded_store = RunStore::new(path);
        let count = reloaded_store.load(&supervisor).await.unwrap();
        assert_eq!(count, 1);

        let reloaded = reloaded_store.get(&id).unwrap();
        assert_eq!(reloaded.template_name, run.template_name);
        assert_eq!(reloaded.pause_count, run.pause_count);
        assert_eq!(reloaded.total_active_millis, run.total_active_millis);
        assert_eq!(reloaded.progress.generation, run.progress.generation);
        assert_eq!(reloaded.auto_scheduled, run.auto_scheduled);
    }

    #[tokio::test]
    async fn test_reconciliation_marks_dead_runs_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-state.json");

        let store = RunStore::new(path.clone());
        let id = new_run_id();
        store.save(sample_run(&id));
        store.flush().unwrap();

        let supervisor = FakeSupervisor::new();
        let reloaded = RunStore::new(path);
        reloaded.load(&supervisor).await.unwrap();

        let run = reloaded.get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert!(run.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_reconciliation_keeps_live_runs_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-state.json");

        let store = RunStore::new(path.clone());
        let id = new_run_id();
        store.save(sample_run(&id));
        store.flush().unwrap();

        // The compute process is still alive in the supervisor
        let supervisor = FakeSupervisor::new();
        supervisor
            .start(ProcessSpec::new(compute_process_name(&id), "kromosynth.js"))
            .await
            .unwrap();

        let reloaded = RunStore::new(path);
        reloaded.load(&supervisor).await.unwrap();

        let run = reloaded.get(&id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.stopped_at.is_none());
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("run-state.json"));

        let id = new_run_id();
        store.save(sample_run(&id));

        let updated = store
            .update(&id, |run| run.progress.generation = Some(50))
            .unwrap();
        assert_eq!(updated.progress.generation, Some(50));

        assert!(store.remove(&id).is_some());
        assert!(store.get(&id).is_none());
        assert!(matches!(
            store.update(&id, |_| {}),
            Err(StoreError::NotFound(_))
        ));
    }
}
