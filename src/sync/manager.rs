//! Sync manager
//!
//! Owns per-run sync state and timers. A run's cycles never overlap (a
//! per-run guard); distinct runs sync in parallel. Within a cycle the
//! database mirror always runs before analysis-file uploads so the
//! central replica has matching state when files arrive.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SyncConfiguration;
use crate::events::{EventBus, OrchestratorEvent};
use crate::jsonc;
use crate::run::Run;

use super::{CentralClient, SyncState, ANALYSIS_SUBDIRS, DB_FILES};

/// Per-file cap on the external binary-sync tool
const DB_TOOL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Delay before a freshly registered run's first periodic tick, giving
/// the compute process time to create its first files
const FIRST_TICK_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy)]
struct CycleStats {
    db_files: usize,
    uploaded: usize,
    skipped: usize,
    errors: usize,
}

struct RunSyncEntry {
    run_id: String,
    working_dir: PathBuf,
    in_cycle: AtomicBool,
    state: parking_lot::RwLock<SyncState>,
    timer: parking_lot::Mutex<Option<CancellationToken>>,
}

/// Replicates run outputs to the central service
pub struct SyncManager {
    weak: std::sync::Weak<SyncManager>,
    config: SyncConfiguration,
    state_path: PathBuf,
    bus: EventBus,
    client: Option<CentralClient>,
    entries: DashMap<String, Arc<RunSyncEntry>>,
    /// States of runs not currently registered, kept for persistence
    dormant: DashMap<String, SyncState>,
    first_tick_delay: Duration,
}

impl SyncManager {
    /// Create a sync manager, recovering persisted per-run state
    pub fn new(config: SyncConfiguration, state_path: PathBuf, bus: EventBus) -> Arc<Self> {
        let client = match (&config.service_url, &config.api_key) {
            (Some(url), Some(key)) => CentralClient::new(url, key)
                .map_err(|e| warn!("Analysis sync disabled: {}", e))
                .ok(),
            _ => None,
        };

        let dormant = DashMap::new();
        if state_path.exists() {
            match jsonc::read_file::<std::collections::BTreeMap<String, SyncState>>(&state_path) {
                Ok(states) => {
                    for (id, state) in states {
                        dormant.insert(id, state);
                    }
                }
                Err(e) => warn!("Ignoring unreadable sync state: {}", e),
            }
        }

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            state_path,
            bus,
            client,
            entries: DashMap::new(),
            dormant,
            first_tick_delay: FIRST_TICK_DELAY,
        })
    }

    fn handle(&self) -> Arc<Self> {
        self.weak.upgrade().expect("sync manager dropped")
    }

    /// Register a run: restore its state, start its periodic timer, and
    /// advise the central service (best effort).
    pub fn register_run(&self, run: &Run) {
        if !self.config.enabled {
            return;
        }
        if self.entries.contains_key(&run.id) {
            return;
        }

        let state = self
            .dormant
            .remove(&run.id)
            .map(|(_, s)| s)
            .unwrap_or_default();

        let entry = Arc::new(RunSyncEntry {
            run_id: run.id.clone(),
            working_dir: run.working_dir.clone(),
            in_cycle: AtomicBool::new(false),
            state: parking_lot::RwLock::new(state),
            timer: parking_lot::Mutex::new(None),
        });
        self.entries.insert(run.id.clone(), entry.clone());
        self.start_timer(entry);

        if self.client.is_some() {
            let run_id = run.id.clone();
            let template = run.template_name.clone();
            let variant = run.ecosystem_variant.clone();
            let started = run.started_at.unwrap_or(run.created_at);
            let this = self.handle();
            tokio::spawn(async move {
                if let Some(client) = &this.client {
                    if let Err(e) = client
                        .register(&run_id, &template, variant.as_deref(), started)
                        .await
                    {
                        debug!("Advisory registration of {} failed: {}", run_id, e);
                    }
                }
            });
        }

        info!("Registered run {} for sync", run.id);
    }

    /// Unregister a run on a terminal transition, parking its state
    pub fn unregister_run(&self, run_id: &str) {
        if let Some((_, entry)) = self.entries.remove(run_id) {
            if let Some(timer) = entry.timer.lock().take() {
                timer.cancel();
            }
            self.dormant
                .insert(run_id.to_string(), entry.state.read().clone());
            self.persist();
            info!("Unregistered run {} from sync", run_id);
        }
    }

    /// Stop all timers and persist (shutdown path)
    pub fn shutdown(&self) {
        for entry in self.entries.iter() {
            if let Some(timer) = entry.timer.lock().take() {
                timer.cancel();
            }
        }
        self.persist();
    }

    /// Run one sync cycle for a run, unless one is already in flight.
    ///
    /// Returns whether a cycle actually ran.
    pub async fn trigger(&self, run_id: &str, reason: &str) -> bool {
        let Some(entry) = self.entries.get(run_id).map(|e| e.value().clone()) else {
            return false;
        };
        self.run_cycle(&entry, reason).await
    }

    /// Fire-and-forget trigger for event-driven syncs
    pub fn trigger_detached(&self, run_id: &str, reason: &str) {
        let this = self.handle();
        let run_id = run_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            this.trigger(&run_id, &reason).await;
        });
    }

    fn start_timer(&self, entry: Arc<RunSyncEntry>) {
        let cancel = CancellationToken::new();
        *entry.timer.lock() = Some(cancel.clone());

        let interval_ms = entry
            .state
            .read()
            .interval_ms
            .unwrap_or(self.config.interval_ms);
        let first_delay = self.first_tick_delay;
        let max_attempts = self.config.retry_max_attempts;
        let this = self.handle();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(first_delay) => {}
            }

            loop {
                this.run_cycle(&entry, "periodic").await;

                if entry.state.read().consecutive_errors >= max_attempts {
                    warn!(
                        "Disabling periodic sync for run {} after {} consecutive failures",
                        entry.run_id, max_attempts
                    );
                    return;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                }
            }
        });
    }

    /// One guarded cycle: databases first, then analysis files.
    async fn run_cycle(&self, entry: &Arc<RunSyncEntry>, reason: &str) -> bool {
        if entry
            .in_cycle
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync cycle for {} already in flight", entry.run_id);
            return false;
        }
        let _guard = scopeguard::guard((), |_| {
            entry.in_cycle.store(false, Ordering::SeqCst);
        });

        self.bus.publish(OrchestratorEvent::SyncStarted {
            run_id: entry.run_id.clone(),
            reason: reason.to_string(),
        });

        let mut stats = CycleStats::default();
        self.sync_databases(entry, &mut stats).await;
        self.sync_analysis_files(entry, &mut stats).await;

        {
            let mut state = entry.state.write();
            if stats.errors == 0 {
                state.cycles_completed += 1;
                state.consecutive_errors = 0;
            } else {
                state.consecutive_errors += 1;
            }
        }
        self.persist();

        if stats.errors == 0 {
            self.bus.publish(OrchestratorEvent::SyncCompleted {
                run_id: entry.run_id.clone(),
                db_files: stats.db_files,
                uploaded: stats.uploaded,
                skipped: stats.skipped,
            });
        } else {
            self.bus.publish(OrchestratorEvent::SyncError {
                run_id: entry.run_id.clone(),
                message: format!("{} errors during sync cycle", stats.errors),
            });
        }
        true
    }

    /// Mirror the database files through the external binary-sync tool.
    async fn sync_databases(&self, entry: &Arc<RunSyncEntry>, stats: &mut CycleStats) {
        let (Some(host), Some(base)) = (&self.config.remote_host, &self.config.remote_base_path)
        else {
            return;
        };

        for file in DB_FILES {
            let local = entry.working_dir.join(file);
            if !local.exists() {
                continue;
            }

            let remote = format!("{}:{}/{}/{}", host, base, entry.run_id, file);
            match self.run_db_tool(&local, &remote).await {
                Ok(()) => {
                    stats.db_files += 1;
                    let mut state = entry.state.write();
                    state.db_files_synced += 1;
                    state.last_db_sync = Some(Utc::now());
                }
                Err(message) => {
                    // A failed file never aborts the cycle
                    warn!("Database sync of {} failed: {}", local.display(), message);
                    stats.errors += 1;
                    entry.state.write().record_error(message);
                }
            }
        }
    }

    async fn run_db_tool(&self, local: &std::path::Path, remote: &str) -> Result<(), String> {
        let mut child = tokio::process::Command::new(&self.config.db_tool)
            .arg(local)
            .arg(remote)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| format!("cannot spawn {}: {}", self.config.db_tool, e))?;

        match tokio::time::timeout(DB_TOOL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(format!("{} exited with {}", self.config.db_tool, status)),
            Ok(Err(e)) => Err(format!("wait failed: {}", e)),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(format!("{} timed out after {:?}", self.config.db_tool, DB_TOOL_TIMEOUT))
            }
        }
    }

    /// Upload analysis files the central service is missing.
    async fn sync_analysis_files(&self, entry: &Arc<RunSyncEntry>, stats: &mut CycleStats) {
        let Some(client) = &self.client else {
            return;
        };

        for subdir in ANALYSIS_SUBDIRS {
            let local_dir = entry.working_dir.join(subdir);
            if !local_dir.is_dir() {
                continue;
            }

            let remote: std::collections::HashSet<String> =
                match client.list_remote(&entry.run_id, subdir).await {
                    Ok(files) => files.into_iter().map(|f| f.name).collect(),
                    Err(e) if e.is_fatal_for_cycle() => {
                        warn!("Sync cycle for {} aborted: {}", entry.run_id, e);
                        stats.errors += 1;
                        entry.state.write().record_error(e.to_string());
                        return;
                    }
                    Err(e) => {
                        stats.errors += 1;
                        entry.state.write().record_error(e.to_string());
                        continue;
                    }
                };

            let local_files: Vec<(String, PathBuf)> = WalkDir::new(&local_dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| (e.file_name().to_string_lossy().to_string(), e.into_path()))
                .collect();

            for (name, path) in local_files {
                if remote.contains(&name) {
                    stats.skipped += 1;
                    continue;
                }
                match client.upload(&entry.run_id, subdir, &name, &path).await {
                    Ok(()) => {
                        stats.uploaded += 1;
                        let mut state = entry.state.write();
                        state.files_uploaded += 1;
                        state.last_file_sync = Some(Utc::now());
                    }
                    Err(e) if e.is_fatal_for_cycle() => {
                        warn!("Sync cycle for {} aborted: {}", entry.run_id, e);
                        stats.errors += 1;
                        entry.state.write().record_error(e.to_string());
                        return;
                    }
                    Err(e) => {
                        stats.errors += 1;
                        entry.state.write().record_error(e.to_string());
                    }
                }
            }
        }
    }

    /// Sync state snapshot for a run, if known
    pub fn state_of(&self, run_id: &str) -> Option<SyncState> {
        self.entries
            .get(run_id)
            .map(|e| e.state.read().clone())
            .or_else(|| self.dormant.get(run_id).map(|s| s.value().clone()))
    }

    fn persist(&self) {
        let mut all: std::collections::BTreeMap<String, SyncState> = self
            .dormant
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for entry in self.entries.iter() {
            all.insert(entry.key().clone(), entry.value().state.read().clone());
        }

        if let Err(e) = jsonc::write_file_atomic(&self.state_path, &all) {
            warn!("Failed to persist sync state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{new_run_id, Progress, RunStatus};

    fn disabled_config() -> SyncConfiguration {
        SyncConfiguration::default()
    }

    fn enabled_config() -> SyncConfiguration {
        SyncConfiguration {
            enabled: true,
            ..SyncConfiguration::default()
        }
    }

    fn sample_run(id: &str, working_dir: PathBuf) -> Run {
        Run {
            id: id.to_string(),
            template_name: "T".into(),
            ecosystem_variant: None,
            status: RunStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            paused_at: None,
            resumed_at: None,
            stopped_at: None,
            ended_at: None,
            pause_count: 0,
            total_active_millis: 0,
            time_slice_started_at: None,
            auto_scheduled: false,
            paused_by_scheduler: false,
            compute_name: crate::supervisor::compute_process_name(id),
            working_dir,
            service_info: None,
            progress: Progress::default(),
            run_config_path: PathBuf::new(),
            hyperparameters_path: PathBuf::new(),
            wrapper_config_path: PathBuf::new(),
            exit_code: None,
        }
    }

    #[tokio::test]
    async fn test_disabled_sync_ignores_registration() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let manager = SyncManager::new(
            disabled_config(),
            dir.path().join("sync-state.json"),
            bus,
        );

        let run = sample_run(&new_run_id(), dir.path().to_path_buf());
        manager.register_run(&run);
        assert!(!manager.trigger(&run.id, "manual").await);
    }

    #[tokio::test]
    async fn test_cycles_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let manager = SyncManager::new(
            enabled_config(),
            dir.path().join("sync-state.json"),
            bus,
        );

        let id = new_run_id();
        let run = sample_run(&id, dir.path().to_path_buf());
        manager.register_run(&run);

        let entry = manager.entries.get(&id).unwrap().value().clone();
        // Simulate an in-flight cycle
        entry.in_cycle.store(true, Ordering::SeqCst);
        assert!(!manager.trigger(&id, "manual").await);

        entry.in_cycle.store(false, Ordering::SeqCst);
        assert!(manager.trigger(&id, "manual").await);
    }

    #[tokio::test]
    async fn test_cycle_with_nothing_configured_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let manager = SyncManager::new(
            enabled_config(),
            dir.path().join("sync-state.json"),
            bus,
        );

        let id = new_run_id();
        manager.register_run(&sample_run(&id, dir.path().to_path_buf()));
        assert!(manager.trigger(&id, "manual").await);

        // sync-started then sync-completed
        assert_eq!(rx.recv().await.unwrap().name(), "sync-started");
        assert_eq!(rx.recv().await.unwrap().name(), "sync-completed");

        let state = manager.state_of(&id).unwrap();
        assert_eq!(state.cycles_completed, 1);
        assert_eq!(state.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_unregister_parks_state() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let manager = SyncManager::new(
            enabled_config(),
            dir.path().join("sync-state.json"),
            bus,
        );

        let id = new_run_id();
        manager.register_run(&sample_run(&id, dir.path().to_path_buf()));
        manager.trigger(&id, "manual").await;
        manager.unregister_run(&id);

        // State survives unregistration and persists to disk
        assert_eq!(manager.state_of(&id).unwrap().cycles_completed, 1);
        assert!(dir.path().join("sync-state.json").exists());
        assert!(!manager.trigger(&id, "manual").await);
    }

    #[tokio::test]
    async fn test_state_recovered_on_construction() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("sync-state.json");
        let id = new_run_id();

        {
            let manager = SyncManager::new(enabled_config(), state_path.clone(), EventBus::new());
            manager.register_run(&sample_run(&id, dir.path().to_path_buf()));
            manager.trigger(&id, "manual").await;
            manager.shutdown();
        }

        let manager = SyncManager::new(enabled_config(), state_path, EventBus::new());
        assert_eq!(manager.state_of(&id).unwrap().cycles_completed, 1);
    }
}
