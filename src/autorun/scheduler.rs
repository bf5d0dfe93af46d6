//! Core auto-run scheduler implementation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerSeedConfiguration;
use crate::events::{EndReason, EventBus, OrchestratorEvent};
use crate::jsonc;
use crate::run::{RunError, RunManager, RunStatus, StartOptions};
use crate::template::TemplateStore;

use super::{AutoRunConfig, ScheduleMode, TemplateSlot};

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("no rotation slot for: {0}")]
    SlotNotFound(String),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("persistence error: {0}")]
    Persistence(#[from] jsonc::JsoncError),
}

struct SliceTimers {
    warning: JoinHandle<()>,
    expiry: JoinHandle<()>,
}

impl SliceTimers {
    fn abort(&self) {
        self.warning.abort();
        self.expiry.abort();
    }
}

/// Time-sliced scheduler over the template rotation
pub struct AutoRunScheduler {
    weak: std::sync::Weak<AutoRunScheduler>,
    run_manager: Arc<RunManager>,
    templates: Arc<TemplateStore>,
    bus: EventBus,
    path: PathBuf,
    /// Scheduler-wide mutex: slot filling and timer callbacks serialize
    /// through it and never run concurrently for the same template
    state: tokio::sync::Mutex<AutoRunConfig>,
    timers: DashMap<String, SliceTimers>,
    /// Wall-clock duration of one "minute"; tests shrink this
    slice_unit: Duration,
}

impl AutoRunScheduler {
    /// Create a scheduler, recovering the persisted rotation when it
    /// exists and seeding from the daemon config otherwise.
    pub fn new(
        run_manager: Arc<RunManager>,
        templates: Arc<TemplateStore>,
        bus: EventBus,
        path: PathBuf,
        seed: &SchedulerSeedConfiguration,
    ) -> Arc<Self> {
        Self::with_slice_unit(run_manager, templates, bus, path, seed, Duration::from_secs(60))
    }

    /// Create a scheduler with a custom slice unit (tests)
    pub fn with_slice_unit(
        run_manager: Arc<RunManager>,
        templates: Arc<TemplateStore>,
        bus: EventBus,
        path: PathBuf,
        seed: &SchedulerSeedConfiguration,
        slice_unit: Duration,
    ) -> Arc<Self> {
        let config = if path.exists() {
            jsonc::read_file(&path).unwrap_or_else(|e| {
                warn!("Ignoring unreadable scheduler config: {}", e);
                Self::seeded(seed)
            })
        } else {
            Self::seeded(seed)
        };

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            run_manager,
            templates,
            bus,
            path,
            state: tokio::sync::Mutex::new(config),
            timers: DashMap::new(),
            slice_unit,
        })
    }

    fn handle(&self) -> Arc<Self> {
        self.weak.upgrade().expect("scheduler dropped")
    }

    fn seeded(seed: &SchedulerSeedConfiguration) -> AutoRunConfig {
        AutoRunConfig {
            enabled: seed.enabled,
            max_concurrent: seed.max_concurrent.max(1),
            mode: match seed.mode.as_str() {
                "priority" => ScheduleMode::Priority,
                _ => ScheduleMode::RoundRobin,
            },
            pause_on_failure: seed.pause_on_failure,
            max_failures_before_pause: seed.max_failures_before_pause,
            ..Default::default()
        }
    }

    /// Purge stale rotation entries, subscribe to run events, and fill
    /// slots when the scheduler is enabled and not paused.
    pub async fn initialize(&self) {
        {
            let mut state = self.state.lock().await;
            let before = state.templates.len();
            let templates = &self.templates;
            state
                .templates
                .retain(|slot| templates.exists(&slot.template_name));
            if state.templates.len() != before {
                info!(
                    "Purged {} rotation entries pointing to missing templates",
                    before - state.templates.len()
                );
            }
            self.persist(&state);
        }

        self.start_event_listener();

        let state = self.state.lock().await;
        if state.enabled && !state.paused {
            let mut state = state;
            self.fill_slots_locked(&mut state).await;
            self.persist(&state);
        }
    }

    // ========================================================================
    // Rotation mutations
    // ========================================================================

    /// Add (or replace) a template slot in the rotation
    pub async fn add_template(&self, slot: TemplateSlot) -> Result<(), SchedulerError> {
        if !self.templates.exists(&slot.template_name) {
            return Err(SchedulerError::TemplateNotFound(slot.template_name));
        }

        let mut state = self.state.lock().await;
        let key = slot.key();
        state.templates.retain(|s| s.key() != key);
        state.templates.push(slot);
        self.persist(&state);

        self.bus.publish(OrchestratorEvent::TemplateConfigChange {
            template_name: key,
        });
        Ok(())
    }

    /// Remove a slot, clearing any active timer
    pub async fn remove_template(&self, key: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        let position = state
            .templates
            .iter()
            .position(|s| s.key() == key)
            .ok_or_else(|| SchedulerError::SlotNotFound(key.to_string()))?;

        self.clear_timers(key);
        state.templates.remove(position);
        self.persist(&state);

        self.bus.publish(OrchestratorEvent::TemplateConfigChange {
            template_name: key.to_string(),
        });
        Ok(())
    }

    /// Enable a slot; verifies the template still exists
    pub async fn enable_template(&self, key: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        let slot = state
            .templates
            .iter_mut()
            .find(|s| s.key() == key)
            .ok_or_else(|| SchedulerError::SlotNotFound(key.to_string()))?;

        if !self.templates.exists(&slot.template_name) {
            return Err(SchedulerError::TemplateNotFound(slot.template_name.clone()));
        }
        slot.enabled = true;
        self.fill_slots_locked(&mut state).await;
        self.persist(&state);
        Ok(())
    }

    /// Disable a slot; its running slice keeps going until expiry
    pub async fn disable_template(&self, key: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        let slot = state
            .templates
            .iter_mut()
            .find(|s| s.key() == key)
            .ok_or_else(|| SchedulerError::SlotNotFound(key.to_string()))?;
        slot.enabled = false;
        self.persist(&state);
        Ok(())
    }

    /// Raise or lower the concurrency ceiling
    pub async fn set_max_concurrent(&self, max: usize) {
        let mut state = self.state.lock().await;
        state.max_concurrent = max.max(1);
        self.fill_slots_locked(&mut state).await;
        self.persist(&state);
    }

    // ========================================================================
    // Scheduler lifecycle
    // ========================================================================

    /// Turn the scheduler on and fill free slots
    pub async fn enable(&self) {
        let mut state = self.state.lock().await;
        state.enabled = true;
        self.fill_slots_locked(&mut state).await;
        self.persist(&state);
        self.publish_status(&state);
    }

    /// Turn the scheduler off; all slice timers die with it
    pub async fn disable(&self) {
        let mut state = self.state.lock().await;
        state.enabled = false;
        self.clear_all_timers();
        self.persist(&state);
        self.publish_status(&state);
    }

    /// Resume after a failure pause, resetting the failure counter
    pub async fn resume_scheduling(&self) {
        let mut state = self.state.lock().await;
        state.paused = false;
        state.pause_reason = None;
        state.consecutive_failures = 0;
        self.fill_slots_locked(&mut state).await;
        self.persist(&state);
        self.publish_status(&state);
    }

    /// Current configuration snapshot
    pub async fn config(&self) -> AutoRunConfig {
        self.state.lock().await.clone()
    }

    fn publish_status(&self, state: &AutoRunConfig) {
        self.bus.publish(OrchestratorEvent::AutoRunStatusChange {
            enabled: state.enabled,
            paused: state.paused,
            reason: state.pause_reason.clone(),
        });
    }

    // ========================================================================
    // Slot filling
    // ========================================================================

    fn run_is_running(&self, run_id: &Option<String>) -> bool {
        run_id
            .as_ref()
            .and_then(|id| self.run_manager.store().get(id))
            .map(|run| run.status == RunStatus::Running)
            .unwrap_or(false)
    }

    /// Fill free slots until the ceiling is reached. Caller holds the
    /// scheduler mutex. `yielding` names a slot that just gave up its
    /// slice; it only re-qualifies when no other candidate exists, which
    /// is what makes same-priority templates take turns.
    async fn fill_slots_locked(&self, state: &mut AutoRunConfig) {
        self.fill_slots_excluding(state, None).await;
    }

    async fn fill_slots_excluding(
        &self,
        state: &mut AutoRunConfig,
        yielding: Option<&str>,
    ) {
        if !state.enabled || state.paused {
            return;
        }

        let mut yielding = yielding.map(str::to_string);
        loop {
            let active = state
                .templates
                .iter()
                .filter(|s| self.run_is_running(&s.current_run_id))
                .count();
            if active >= state.max_concurrent {
                return;
            }

            let candidate = self
                .select_candidate(state, yielding.as_deref())
                .or_else(|| self.select_candidate(state, None));
            let Some(index) = candidate else {
                return;
            };
            yielding = None;

            if !self.start_slot(state, index).await {
                // Starting failed; do not spin on the same candidate
                return;
            }
        }
    }

    /// Pick the next slot per the configured mode
    fn select_candidate(&self, state: &AutoRunConfig, exclude: Option<&str>) -> Option<usize> {
        let free = state.templates.iter().enumerate().filter(|(_, slot)| {
            slot.enabled
                && exclude != Some(slot.key().as_str())
                && !self.run_is_running(&slot.current_run_id)
        });

        match state.mode {
            ScheduleMode::Priority => free.min_by_key(|(_, s)| s.priority).map(|(i, _)| i),
            ScheduleMode::RoundRobin => free
                .min_by_key(|(_, s)| s.last_run_at.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN))
                .map(|(i, _)| i),
        }
    }

    /// Start or resume a run for a slot. Returns whether a run occupies
    /// the slot afterwards.
    async fn start_slot(&self, state: &mut AutoRunConfig, index: usize) -> bool {
        let (template_name, variant, minutes, key) = {
            let slot = &state.templates[index];
            (
                slot.template_name.clone(),
                slot.ecosystem_variant.clone(),
                slot.time_slice_minutes,
                slot.key(),
            )
        };

        // A run the scheduler parked earlier resumes; otherwise fresh
        let parked = self.run_manager.store().all().into_iter().find(|run| {
            run.auto_scheduled
                && run.paused_by_scheduler
                && run.status == RunStatus::Paused
                && run.template_name == template_name
                && run.ecosystem_variant == variant
        });

        let run_id = match parked {
            Some(run) => match self.run_manager.resume_run(&run.id).await {
                Ok(()) => {
                    info!("Scheduler resumed run {} for slot {}", run.id, key);
                    Some(run.id)
                }
                Err(e) => {
                    error!("Scheduler failed to resume run {}: {}", run.id, e);
                    None
                }
            },
            None => {
                let options = StartOptions {
                    ecosystem_variant: variant.clone(),
                    auto_scheduled: true,
                };
                match self.run_manager.start_run(&template_name, options).await {
                    Ok(id) => {
                        info!("Scheduler started run {} for slot {}", id, key);
                        Some(id)
                    }
                    Err(e) => {
                        error!("Scheduler failed to start {}: {}", template_name, e);
                        None
                    }
                }
            }
        };

        let Some(run_id) = run_id else {
            return false;
        };

        {
            let slot = &mut state.templates[index];
            slot.current_run_id = Some(run_id.clone());
            slot.last_run_at = Some(Utc::now());
        }
        self.persist(state);

        self.start_slice_timers(&key, &run_id, minutes, &template_name);
        self.bus.publish(OrchestratorEvent::TimeSliceStarted {
            run_id,
            template_name,
            minutes,
        });
        true
    }

    // ========================================================================
    // Slice timers
    // ========================================================================

    fn slice_duration(&self, minutes: u64) -> Duration {
        self.slice_unit * minutes as u32
    }

    fn start_slice_timers(
        &self,
        key: &str,
        run_id: &str,
        minutes: u64,
        template_name: &str,
    ) {
        self.clear_timers(key);

        let total = self.slice_duration(minutes);
        let warning_lead = std::cmp::min(self.slice_duration(5), total / 2);

        let warning = {
            let bus = self.bus.clone();
            let run_id = run_id.to_string();
            let template_name = template_name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(total - warning_lead).await;
                bus.publish(OrchestratorEvent::TimeSliceEnding {
                    run_id,
                    template_name,
                    remaining_secs: warning_lead.as_secs(),
                });
            })
        };

        let expiry = {
            let this = self.handle();
            let key = key.to_string();
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(total).await;
                this.handle_expiry(&key, &run_id).await;
            })
        };

        self.timers.insert(key.to_string(), SliceTimers { warning, expiry });
    }

    fn clear_timers(&self, key: &str) {
        if let Some((_, timers)) = self.timers.remove(key) {
            timers.abort();
        }
    }

    fn clear_all_timers(&self) {
        let keys: Vec<String> = self.timers.iter().map(|t| t.key().clone()).collect();
        for key in keys {
            self.clear_timers(&key);
        }
    }

    /// A slot's slice ran out: park the run and hand the slot on
    async fn handle_expiry(&self, key: &str, run_id: &str) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return;
        }

        debug!("Time slice of slot {} expired (run {})", key, run_id);

        match self.run_manager.pause_run(run_id, true).await {
            Ok(()) => {}
            Err(RunError::IllegalState { .. }) | Err(RunError::NotFound(_)) => {
                // The run ended on its own just before the timer fired
            }
            Err(e) => warn!("Failed to pause run {} at slice expiry: {}", run_id, e),
        }

        let mut template_name = String::new();
        if let Some(slot) = state.templates.iter_mut().find(|s| s.key() == key) {
            slot.current_run_id = None;
            slot.total_run_time_minutes += slot.time_slice_minutes;
            template_name = slot.template_name.clone();
        }
        self.timers.remove(key);

        self.bus.publish(OrchestratorEvent::TimeSliceExpired {
            run_id: run_id.to_string(),
            template_name,
        });

        self.fill_slots_excluding(&mut state, Some(key)).await;
        self.persist(&state);
    }

    // ========================================================================
    // Run-ended handling
    // ========================================================================

    fn start_event_listener(&self) {
        let this = self.handle();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(OrchestratorEvent::RunEnded {
                        run_id, reason, ..
                    }) => {
                        this.handle_run_ended(&run_id, reason).await;
                    }
                    Ok(OrchestratorEvent::RunStopped { run_id }) => {
                        this.handle_run_released(&run_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Scheduler lagged {} bus events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// A run ended naturally or crashed: free its slot, track failures
    async fn handle_run_ended(&self, run_id: &str, reason: EndReason) {
        let auto = self
            .run_manager
            .store()
            .get(run_id)
            .map(|r| r.auto_scheduled)
            .unwrap_or(false);
        if !auto {
            return;
        }

        let mut state = self.state.lock().await;

        if let Some(slot) = state
            .templates
            .iter_mut()
            .find(|s| s.current_run_id.as_deref() == Some(run_id))
        {
            let key = slot.key();
            slot.current_run_id = None;
            self.clear_timers(&key);
        }

        if reason == EndReason::Failed {
            state.consecutive_failures += 1;
            warn!(
                "Auto-scheduled run {} failed ({} consecutive)",
                run_id, state.consecutive_failures
            );

            if state.pause_on_failure
                && state.consecutive_failures >= state.max_failures_before_pause
            {
                state.paused = true;
                state.pause_reason = Some(format!(
                    "paused after {} consecutive run failures",
                    state.consecutive_failures
                ));
                self.clear_all_timers();
                self.persist(&state);
                self.publish_status(&state);
                return;
            }
        } else {
            state.consecutive_failures = 0;
        }

        self.fill_slots_locked(&mut state).await;
        self.persist(&state);
    }

    /// A user stop freed a slot outside the scheduler's own flow
    async fn handle_run_released(&self, run_id: &str) {
        let mut state = self.state.lock().await;
        let Some(slot) = state
            .templates
            .iter_mut()
            .find(|s| s.current_run_id.as_deref() == Some(run_id))
        else {
            return;
        };

        let key = slot.key();
        slot.current_run_id = None;
        self.clear_timers(&key);
        self.fill_slots_locked(&mut state).await;
        self.persist(&state);
    }

    fn persist(&self, state: &AutoRunConfig) {
        if let Err(e) = jsonc::write_file_atomic(&self.path, state) {
            error!("Failed to persist scheduler config: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::events::EventBus;
    use crate::ports::PortAllocator;
    use crate::services::ServiceDependencyManager;
    use crate::supervisor::{compute_process_name, FakeSupervisor};
    use crate::template::{RunConfig, Template, TemplateStore};
    use std::collections::HashMap;

    struct Harness {
        scheduler: Arc<AutoRunScheduler>,
        manager: Arc<RunManager>,
        fake: Arc<FakeSupervisor>,
        bus: EventBus,
        _dir: tempfile::TempDir,
    }

    fn bare_template(name: &str) -> Template {
        Template {
            name: name.into(),
            run_config: RunConfig::default(),
            hyperparameters: serde_json::Value::Null,
            ecosystems: HashMap::new(),
        }
    }

    async fn harness(seed: SchedulerSeedConfiguration, slice_unit: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Configuration::rooted_at(dir.path()));
        config.ensure_directories().unwrap();

        let fake = Arc::new(FakeSupervisor::new());
        let allocator = Arc::new(PortAllocator::new());
        let services = Arc::new(
            ServiceDependencyManager::new(
                fake.clone(),
                allocator,
                config.runtime.clone(),
                config.system.log_directory.clone(),
            )
            .with_readiness_window(Duration::from_millis(10), Duration::from_millis(500)),
        );

        let templates = Arc::new(TemplateStore::new());
        templates.register(bare_template("A"));
        templates.register(bare_template("B"));

        let store = Arc::new(crate::run::RunStore::new(config.run_state_path()));
        let bus = EventBus::new();

        let manager = RunManager::new(
            config.clone(),
            templates.clone(),
            fake.clone(),
            services,
            store,
            None,
            bus.clone(),
        );

        let scheduler = AutoRunScheduler::with_slice_unit(
            manager.clone(),
            templates,
            bus.clone(),
            config.auto_run_config_path(),
            &seed,
            slice_unit,
        );

        Harness {
            scheduler,
            manager,
            fake,
            bus,
            _dir: dir,
        }
    }

    fn priority_seed() -> SchedulerSeedConfiguration {
        SchedulerSeedConfiguration {
            enabled: true,
            max_concurrent: 1,
            mode: "priority".into(),
            pause_on_failure: true,
            max_failures_before_pause: 2,
        }
    }

    fn slot(template: &str, priority: u32, minutes: u64) -> TemplateSlot {
        TemplateSlot {
            priority,
            time_slice_minutes: minutes,
            ..TemplateSlot::new(template, None)
        }
    }

    #[tokio::test]
    async fn test_priority_rotation_alternates() {
        let h = harness(priority_seed(), Duration::from_millis(60)).await;
        let mut events = h.bus.subscribe();

        h.scheduler.add_template(slot("A", 1, 2)).await.unwrap();
        h.scheduler.add_template(slot("B", 2, 2)).await.unwrap();
        h.scheduler.initialize().await;

        // A runs first (lowest priority value)
        let config = h.scheduler.config().await;
        let slot_a = config.templates.iter().find(|s| s.key() == "A").unwrap();
        let first_run = slot_a.current_run_id.clone().unwrap();
        assert_eq!(
            h.manager.store().get(&first_run).unwrap().template_name,
            "A"
        );

        // Wait for the slice to expire; B takes over, A is paused
        let mut expired = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while expired.len() < 2 && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Ok(OrchestratorEvent::TimeSliceExpired { run_id, .. })) => {
                    expired.push(run_id);
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(expired.len() >= 2, "expected at least two expiries");
        assert_eq!(expired[0], first_run);

        let first = h.manager.store().get(&first_run).unwrap();
        // After its second turn started, A's first run had been parked
        // and resumed by the scheduler at least once
        assert!(first.pause_count >= 1);
        assert!(first.auto_scheduled);
    }

    #[tokio::test]
    async fn test_max_concurrent_is_respected() {
        let mut seed = priority_seed();
        seed.max_concurrent = 1;
        let h = harness(seed, Duration::from_millis(60)).await;

        h.scheduler.add_template(slot("A", 1, 1000)).await.unwrap();
        h.scheduler.add_template(slot("B", 2, 1000)).await.unwrap();
        h.scheduler.initialize().await;

        let running: usize = h
            .manager
            .store()
            .all()
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .count();
        assert_eq!(running, 1);

        // Raising the ceiling fills the freed capacity
        h.scheduler.set_max_concurrent(2).await;
        let running: usize = h
            .manager
            .store()
            .all()
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .count();
        assert_eq!(running, 2);
    }

    #[tokio::test]
    async fn test_failure_backoff_pauses_scheduler() {
        let h = harness(priority_seed(), Duration::from_millis(60)).await;
        let mut events = h.bus.subscribe();

        h.scheduler.add_template(slot("A", 1, 1000)).await.unwrap();
        h.scheduler.initialize().await;

        for _ in 0..2 {
            // Crash whichever run currently holds the slot
            let run_id = h
                .scheduler
                .config()
                .await
                .templates[0]
                .current_run_id
                .clone()
                .expect("slot should be filled");
            h.fake.emit_exit(&compute_process_name(&run_id), 1);

            // Wait until the scheduler has digested the failure
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                let config = h.scheduler.config().await;
                if config.paused || config.templates[0].current_run_id.as_deref() != Some(run_id.as_str()) {
                    break;
                }
                assert!(tokio::time::Instant::now() < deadline, "failure not digested");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !h.scheduler.config().await.paused {
            assert!(tokio::time::Instant::now() < deadline, "scheduler never paused");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let config = h.scheduler.config().await;
        assert!(config.pause_reason.as_ref().unwrap().contains("failures"));
        assert_eq!(config.consecutive_failures, 2);

        // No further runs are scheduled while paused
        let running = h
            .manager
            .store()
            .all()
            .iter()
            .filter(|r| r.status == RunStatus::Running)
            .count();
        assert_eq!(running, 0);

        // resume_scheduling clears the counter and refills
        h.scheduler.resume_scheduling().await;
        let config = h.scheduler.config().await;
        assert!(!config.paused);
        assert_eq!(config.consecutive_failures, 0);

        let mut saw_status_change = false;
        while let Ok(event) = events.try_recv() {
            if event.name() == "auto-run-status-change" {
                saw_status_change = true;
            }
        }
        assert!(saw_status_change);
    }

    #[tokio::test]
    async fn test_disable_stops_slice_expiry() {
        let h = harness(priority_seed(), Duration::from_millis(40)).await;

        h.scheduler.add_template(slot("A", 1, 2)).await.unwrap();
        h.scheduler.initialize().await;

        h.scheduler.disable().await;
        let mut events = h.bus.subscribe();

        // Well past where the slice would have expired
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(event) = events.try_recv() {
            assert_ne!(event.name(), "time-slice-expired");
        }
    }

    #[tokio::test]
    async fn test_initialize_purges_missing_templates() {
        let h = harness(priority_seed(), Duration::from_millis(60)).await;

        h.scheduler.add_template(slot("A", 1, 1000)).await.unwrap();
        {
            // Sneak a stale entry into the rotation
            let mut state = h.scheduler.state.lock().await;
            state.templates.push(TemplateSlot::new("deleted-template", None));
        }

        h.scheduler.initialize().await;
        let config = h.scheduler.config().await;
        assert!(config
            .templates
            .iter()
            .all(|s| s.template_name != "deleted-template"));
    }

    #[tokio::test]
    async fn test_add_template_requires_existing_template() {
        let h = harness(priority_seed(), Duration::from_millis(60)).await;
        let result = h.scheduler.add_template(TemplateSlot::new("nope", None)).await;
        assert!(matches!(result, Err(SchedulerError::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn test_round_robin_prefers_never_run() {
        let mut seed = priority_seed();
        seed.mode = "round-robin".into();
        let h = harness(seed, Duration::from_millis(60)).await;

        let mut slot_a = slot("A", 1, 1000);
        slot_a.last_run_at = Some(Utc::now());
        h.scheduler.add_template(slot_a).await.unwrap();
        h.scheduler.add_template(slot("B", 2, 1000)).await.unwrap();
        h.scheduler.initialize().await;

        // B has never run and wins over the recently-run A
        let config = h.scheduler.config().await;
        let slot_b = config.templates.iter().find(|s| s.key() == "B").unwrap();
        assert!(slot_b.current_run_id.is_some());
    }
}
