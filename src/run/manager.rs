//! Run manager
//!
//! Owns the full lifecycle of runs: bring-up of the service cluster and
//! the compute process, pause/resume with fresh allocations, exit
//! classification, progress extraction from the log stream, and the
//! working-config files the compute process consumes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::events::{EndReason, EventBus, OrchestratorEvent};
use crate::jsonc;
use crate::services::{ServiceDependencyManager, ServicesError};
use crate::supervisor::{
    compute_process_name, run_id_of, LifecycleEvent, ProcessSpec, ProcessStatus,
    ProcessSupervisor, SupervisorEvent,
};
use crate::sync::SyncManager;
use crate::template::TemplateStore;

use super::store::derive_total_generations;
use super::{new_run_id, Progress, ProgressParser, Run, RunStatus, RunStore};

/// Minimum spacing between durable progress writes per run
const PROGRESS_PERSIST_INTERVAL: Duration = Duration::from_secs(30);

/// Errors from run operations
#[derive(Debug, Error)]
pub enum RunError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("run not found: {0}")]
    NotFound(String),

    #[error("run {run_id} is {status}, cannot {operation}")]
    IllegalState {
        run_id: String,
        status: RunStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Services(#[from] ServicesError),

    #[error(transparent)]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    #[error(transparent)]
    Store(#[from] super::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Persistence(#[from] jsonc::JsoncError),
}

/// Options for starting a run
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Ecosystem variant; falls back to the global default, then to the
    /// template's `default` variant when it has one
    pub ecosystem_variant: Option<String>,

    /// Whether the auto-run scheduler owns this run
    pub auto_scheduled: bool,
}

/// A run record merged with the live supervisor snapshot
#[derive(Debug, Clone)]
pub struct RunView {
    pub run: Run,
    /// Run status as the process manager sees it right now
    pub live_status: Option<RunStatus>,
    pub pid: Option<u32>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

fn map_process_status(status: ProcessStatus) -> RunStatus {
    match status {
        ProcessStatus::Online => RunStatus::Running,
        ProcessStatus::Stopped => RunStatus::Stopped,
        ProcessStatus::Errored => RunStatus::Failed,
        ProcessStatus::Launching => RunStatus::Starting,
        ProcessStatus::Stopping => RunStatus::Running,
    }
}

/// Exclusive owner of run records and their lifecycle
pub struct RunManager {
    weak: std::sync::Weak<RunManager>,
    config: Arc<Configuration>,
    templates: Arc<TemplateStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    services: Arc<ServiceDependencyManager>,
    store: Arc<RunStore>,
    sync: Option<Arc<SyncManager>>,
    bus: EventBus,
    op_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    last_progress_persist: DashMap<String, Instant>,
}

impl RunManager {
    /// Create the manager and start consuming the supervisor event stream
    pub fn new(
        config: Arc<Configuration>,
        templates: Arc<TemplateStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
        services: Arc<ServiceDependencyManager>,
        store: Arc<RunStore>,
        sync: Option<Arc<SyncManager>>,
        bus: EventBus,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            templates,
            supervisor,
            services,
            store,
            sync,
            bus,
            op_locks: DashMap::new(),
            last_progress_persist: DashMap::new(),
        });
        manager.start_event_pump();
        manager
    }

    fn handle(&self) -> Arc<Self> {
        self.weak.upgrade().expect("run manager dropped")
    }

    /// The event bus runs and sync publish on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The backing store
    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    async fn lock_run(&self, run_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .op_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Start a fresh run of a template. Returns the new run id.
    pub async fn start_run(
        &self,
        template_name: &str,
        options: StartOptions,
    ) -> Result<String, RunError> {
        let template = self
            .templates
            .get(template_name)
            .ok_or_else(|| RunError::TemplateNotFound(template_name.to_string()))?;

        let defaults = self.config.load_global_defaults();
        let variant = options
            .ecosystem_variant
            .or(defaults.ecosystem_variant)
            .or_else(|| {
                template
                    .ecosystems
                    .contains_key("default")
                    .then(|| "default".to_string())
            });

        let run_id = new_run_id();
        let working_dir = self.config.run_working_dir(&run_id);
        std::fs::create_dir_all(&working_dir)?;

        info!(
            "Starting run {} of template {} (variant {:?})",
            run_id, template_name, variant
        );

        let (service_info, injected_config) = self
            .services
            .start_services_for_run(&run_id, &template, variant.as_deref())
            .await?;

        let total_generations = derive_total_generations(&injected_config);

        let paths = match self.write_working_configs(
            &run_id,
            template_name,
            &injected_config,
            &template.hyperparameters,
            &working_dir,
        ) {
            Ok(paths) => paths,
            Err(e) => {
                self.services.stop_services_for_run(&run_id).await;
                return Err(e);
            }
        };

        let compute_name = compute_process_name(&run_id);
        let spec = self.compute_spec(&run_id, &paths.wrapper, &working_dir);
        if let Err(e) = self.supervisor.start(spec).await {
            error!("Compute process for run {} failed to start: {}", run_id, e);
            self.services.stop_services_for_run(&run_id).await;
            return Err(e.into());
        }

        let mut run = Run {
            id: run_id.clone(),
            template_name: template_name.to_string(),
            ecosystem_variant: variant.clone(),
            status: RunStatus::Starting,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            resumed_at: None,
            stopped_at: None,
            ended_at: None,
            pause_count: 0,
            total_active_millis: 0,
            time_slice_started_at: None,
            auto_scheduled: options.auto_scheduled,
            paused_by_scheduler: false,
            compute_name,
            working_dir,
            service_info: Some(service_info),
            progress: Progress {
                total_generations,
                ..Default::default()
            },
            run_config_path: paths.run_config,
            hyperparameters_path: paths.hyperparameters,
            wrapper_config_path: paths.wrapper,
            exit_code: None,
        };
        // Services are up and compute is spawned
        let _ = run.transition(RunStatus::Running);
        run.time_slice_started_at = Some(Utc::now());
        self.store.save(run.clone());

        self.bus.publish(OrchestratorEvent::RunStarted {
            run_id: run_id.clone(),
            template_name: template_name.to_string(),
            ecosystem_variant: variant,
        });

        if let Some(sync) = &self.sync {
            sync.register_run(&run);
        }

        Ok(run_id)
    }

    /// Stop a run on user request. Legal from `running` and `paused`.
    pub async fn stop_run(&self, run_id: &str) -> Result<(), RunError> {
        let _guard = self.lock_run(run_id).await;
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;

        if !matches!(run.status, RunStatus::Running | RunStatus::Paused) {
            return Err(RunError::IllegalState {
                run_id: run_id.to_string(),
                status: run.status,
                operation: "stop",
            });
        }

        info!("Stopping run {}", run_id);

        // Transition first so the compute exit event is not classified
        self.store.update(run_id, |r| {
            if r.status == RunStatus::Running {
                accumulate_active_time(r);
            }
            // A stopped run must never be resumed by the scheduler
            r.paused_by_scheduler = false;
            let _ = r.transition(RunStatus::Stopped);
        })?;

        self.teardown_processes(&run).await;

        if let Some(sync) = &self.sync {
            if self.config.sync.sync_on_stop {
                sync.trigger(run_id, "stop").await;
            }
            sync.unregister_run(run_id);
        }

        self.store.flush()?;
        self.bus.publish(OrchestratorEvent::RunStopped {
            run_id: run_id.to_string(),
        });
        Ok(())
    }

    /// Pause a run, releasing its processes and ports. Legal only from
    /// `running`. `by_scheduler` marks the pause as scheduler-driven so
    /// only the scheduler will consider resuming it.
    pub async fn pause_run(&self, run_id: &str, by_scheduler: bool) -> Result<(), RunError> {
        let _guard = self.lock_run(run_id).await;
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;

        if run.status != RunStatus::Running {
            return Err(RunError::IllegalState {
                run_id: run_id.to_string(),
                status: run.status,
                operation: "pause",
            });
        }

        info!("Pausing run {} (by_scheduler={})", run_id, by_scheduler);

        self.store.update(run_id, |r| {
            accumulate_active_time(r);
            r.pause_count += 1;
            r.paused_by_scheduler = by_scheduler;
            let _ = r.transition(RunStatus::Paused);
        })?;

        self.teardown_processes(&run).await;

        // Paused state is durable before the call returns
        self.store.flush()?;
        self.bus.publish(OrchestratorEvent::RunPaused {
            run_id: run_id.to_string(),
        });

        if let Some(sync) = &self.sync {
            if self.config.sync.sync_on_pause {
                sync.trigger_detached(run_id, "pause");
            }
        }
        Ok(())
    }

    /// Resume a run from `paused`, `stopped`, or `failed`. Services come
    /// back on a fresh allocation and the working config is rewritten
    /// with the new endpoints; the compute process finds its checkpoint
    /// on disk by itself.
    pub async fn resume_run(&self, run_id: &str) -> Result<(), RunError> {
        let _guard = self.lock_run(run_id).await;
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;

        if !matches!(
            run.status,
            RunStatus::Paused | RunStatus::Stopped | RunStatus::Failed
        ) {
            return Err(RunError::IllegalState {
                run_id: run_id.to_string(),
                status: run.status,
                operation: "resume",
            });
        }

        let template = self
            .templates
            .get(&run.template_name)
            .ok_or_else(|| RunError::TemplateNotFound(run.template_name.clone()))?;

        info!("Resuming run {} of template {}", run_id, run.template_name);

        let (service_info, injected_config) = self
            .services
            .start_services_for_run(run_id, &template, run.ecosystem_variant.as_deref())
            .await?;

        // Fresh endpoints for the respawned compute process
        if let Err(e) = jsonc::write_file_atomic(&run.run_config_path, &injected_config) {
            self.services.stop_services_for_run(run_id).await;
            return Err(e.into());
        }

        let spec = self.compute_spec(run_id, &run.wrapper_config_path, &run.working_dir);
        if let Err(e) = self.supervisor.start(spec).await {
            self.services.stop_services_for_run(run_id).await;
            return Err(e.into());
        }

        let updated = self.store.update(run_id, |r| {
            r.service_info = Some(service_info);
            r.exit_code = None;
            r.paused_by_scheduler = false;
            let _ = r.transition(RunStatus::Running);
            r.time_slice_started_at = Some(Utc::now());
        })?;

        self.bus.publish(OrchestratorEvent::RunResumed {
            run_id: run_id.to_string(),
        });
        if let Some(sync) = &self.sync {
            sync.register_run(&updated);
        }
        Ok(())
    }

    /// A run merged with its live process snapshot
    pub async fn get_run(&self, run_id: &str) -> Option<RunView> {
        let run = self.store.get(run_id)?;
        let snapshot = self
            .supervisor
            .describe(&run.compute_name)
            .await
            .ok()
            .flatten();

        Some(RunView {
            live_status: snapshot.as_ref().map(|s| map_process_status(s.status)),
            pid: snapshot.as_ref().and_then(|s| s.pid),
            cpu_percent: snapshot.as_ref().map(|s| s.cpu_percent).unwrap_or(0.0),
            memory_bytes: snapshot.as_ref().map(|s| s.memory_bytes).unwrap_or(0),
            run,
        })
    }

    /// All runs merged with live snapshots
    pub async fn get_all_runs(&self) -> Vec<RunView> {
        let mut views = Vec::new();
        for run in self.store.all() {
            if let Some(view) = self.get_run(&run.id).await {
                views.push(view);
            }
        }
        views.sort_by(|a, b| a.run.id.cmp(&b.run.id));
        views
    }

    /// Stop all active runs, then flush state (shutdown path)
    pub async fn shutdown(&self) {
        info!("Stopping all active runs...");
        for run in self.store.all() {
            if matches!(run.status, RunStatus::Running | RunStatus::Starting) {
                if let Err(e) = self.stop_run(&run.id).await {
                    warn!("Error stopping run {} during shutdown: {}", run.id, e);
                }
            }
        }
        if let Some(sync) = &self.sync {
            sync.shutdown();
        }
        if let Err(e) = self.store.flush() {
            error!("Failed to flush run state: {}", e);
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn teardown_processes(&self, run: &Run) {
        if let Err(e) = self.supervisor.stop(&run.compute_name).await {
            debug!("Compute stop for {}: {}", run.id, e);
        }
        if let Err(e) = self.supervisor.delete(&run.compute_name).await {
            debug!("Compute delete for {}: {}", run.id, e);
        }
        self.services.stop_services_for_run(&run.id).await;
    }

    fn compute_spec(&self, run_id: &str, wrapper: &PathBuf, working_dir: &PathBuf) -> ProcessSpec {
        let runtime = &self.config.runtime;
        let mut spec = ProcessSpec::new(
            compute_process_name(run_id),
            runtime.cli_script.to_string_lossy().to_string(),
        );
        spec.interpreter = Some(runtime.node_path.clone());
        spec.args = vec![
            "evolution-runs".into(),
            "--evolution-runs-config-json-file".into(),
            wrapper.to_string_lossy().to_string(),
        ];
        spec.cwd = Some(working_dir.clone());
        spec.autorestart = false;
        spec.max_memory_restart_mb = Some(self.config.compute.max_memory_mb);
        spec.out_log = Some(self.config.system.log_directory.join(format!("{}.out.log", run_id)));
        spec.err_log = Some(self.config.system.log_directory.join(format!("{}.err.log", run_id)));
        spec
    }

    fn write_working_configs(
        &self,
        run_id: &str,
        label: &str,
        config: &crate::template::RunConfig,
        hyperparameters: &serde_json::Value,
        working_dir: &PathBuf,
    ) -> Result<WorkingConfigPaths, RunError> {
        let run_config = working_dir.join("evolution-run-config.jsonc");
        let hyper = working_dir.join("evolutionary-hyperparameters.jsonc");
        let wrapper = working_dir.join("evolution-runs-config.jsonc");

        jsonc::write_file_atomic(&run_config, config)?;
        jsonc::write_file_atomic(&hyper, hyperparameters)?;

        let wrapper_doc = serde_json::json!({
            "baseEvolutionRunConfigFile": run_config,
            "baseEvolutionaryHyperparametersFile": hyper,
            "evoRuns": [{
                "label": label,
                "iterations": [{ "id": format!("{}_{}", run_id, label) }],
            }],
            "currentEvolutionRunIndex": 0,
            "currentEvolutionRunIteration": 0,
        });
        jsonc::write_file_atomic(&wrapper, &wrapper_doc)?;

        Ok(WorkingConfigPaths {
            run_config,
            hyperparameters: hyper,
            wrapper,
        })
    }

    fn start_event_pump(&self) {
        let this = self.handle();
        let mut events = self.supervisor.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.handle_supervisor_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Run manager lagged {} supervisor events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_supervisor_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Log { name, stream, line } => {
                let Some(run_id) = run_id_of(&name).map(str::to_string) else {
                    return;
                };

                if name == compute_process_name(&run_id) {
                    self.append_combined_log(&run_id, &line);
                    if let Some(delta) = ProgressParser::parse(&line) {
                        self.apply_progress(&run_id, &delta);
                    }
                }

                self.bus.publish(OrchestratorEvent::RunLog {
                    run_id,
                    stream,
                    line,
                });
            }
            SupervisorEvent::Lifecycle {
                name,
                event: LifecycleEvent::Exit { code },
            } => {
                // Only compute exits classify a run; service exits are
                // the supervisor's restart business
                if let Some(run_id) = run_id_of(&name).map(str::to_string) {
                    if name == compute_process_name(&run_id) {
                        let this = self.handle();
                        tokio::spawn(async move {
                            this.handle_compute_exit(&run_id, code).await;
                        });
                    }
                }
            }
            SupervisorEvent::Lifecycle { .. } | SupervisorEvent::Message { .. } => {}
        }
    }

    fn append_combined_log(&self, run_id: &str, line: &str) {
        use std::io::Write;
        let path = self
            .config
            .system
            .log_directory
            .join(format!("{}.combined.log", run_id));
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{}", line));
    }

    fn apply_progress(&self, run_id: &str, delta: &super::ProgressDelta) {
        let mut changed = false;
        let updated = self.store.update_quiet(run_id, |r| {
            changed = r.progress.apply(delta);
        });
        let Ok(run) = updated else { return };
        if !changed {
            return;
        }

        self.bus.publish(OrchestratorEvent::RunProgress {
            run_id: run_id.to_string(),
            progress: run.progress.clone(),
        });

        // Throttle durable writes to bound write amplification
        let due = self
            .last_progress_persist
            .get(run_id)
            .map(|t| t.elapsed() >= PROGRESS_PERSIST_INTERVAL)
            .unwrap_or(true);
        if due {
            self.last_progress_persist
                .insert(run_id.to_string(), Instant::now());
            self.store.request_persist();
        }
    }

    async fn handle_compute_exit(&self, run_id: &str, code: Option<i32>) {
        let _guard = self.lock_run(run_id).await;
        let Some(run) = self.store.get(run_id) else {
            return;
        };
        // A pause or stop already accounted for this process going away
        if run.status != RunStatus::Running {
            debug!(
                "Ignoring compute exit for run {} in state {}",
                run_id, run.status
            );
            return;
        }

        let reason = if code == Some(0) {
            EndReason::Terminated
        } else {
            EndReason::Failed
        };
        info!(
            "Compute for run {} exited with {:?}, classifying as {}",
            run_id, code, reason
        );

        let update = self.store.update(run_id, |r| {
            accumulate_active_time(r);
            let _ = r.transition(match reason {
                EndReason::Terminated => RunStatus::Terminated,
                _ => RunStatus::Failed,
            });
            if reason == EndReason::Failed {
                r.exit_code = code;
            }
        });
        if let Err(e) = update {
            error!("Cannot record exit of run {}: {}", run_id, e);
            return;
        }

        let _ = self.supervisor.delete(&run.compute_name).await;
        self.services.stop_services_for_run(run_id).await;

        // The final sync completes before run-ended goes out
        if let Some(sync) = &self.sync {
            if self.config.sync.sync_on_stop {
                sync.trigger(run_id, "run-ended").await;
            }
            sync.unregister_run(run_id);
        }

        self.bus.publish(OrchestratorEvent::RunEnded {
            run_id: run_id.to_string(),
            reason,
            exit_code: code,
        });
    }
}

struct WorkingConfigPaths {
    run_config: PathBuf,
    hyperparameters: PathBuf,
    wrapper: PathBuf,
}

/// Fold the elapsed slice into the run's active-time total
fn accumulate_active_time(run: &mut Run) {
    if let Some(started) = run.time_slice_started_at.take() {
        let elapsed = (Utc::now() - started).num_milliseconds().max(0) as u64;
        run.total_active_millis += elapsed;
    }
}
