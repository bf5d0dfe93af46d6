//! Main daemon command - wires the orchestrator together and runs it

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use kromosynth_orchestrator::autorun::AutoRunScheduler;
use kromosynth_orchestrator::config::Configuration;
use kromosynth_orchestrator::events::EventBus;
use kromosynth_orchestrator::jsonc;
use kromosynth_orchestrator::ports::PortAllocator;
use kromosynth_orchestrator::run::{RunManager, RunStatus, RunStore};
use kromosynth_orchestrator::services::ServiceDependencyManager;
use kromosynth_orchestrator::supervisor::{LocalSupervisor, ProcessSupervisor};
use kromosynth_orchestrator::sync::SyncManager;
use kromosynth_orchestrator::template::{Template, TemplateStore};

/// Run the daemon
pub async fn run(config_path: &str) -> Result<()> {
    // Load configuration
    info!("Loading configuration from: {}", config_path);
    let config = Arc::new(Configuration::load(config_path)?);

    info!("Configuration loaded successfully");
    info!(
        "  Working directory: {}",
        config.system.working_directory.display()
    );
    info!("  Log directory: {}", config.system.log_directory.display());
    info!("  Sync enabled: {}", config.sync.enabled);

    let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(LocalSupervisor::with_kill_grace(
        Duration::from_secs(config.compute.kill_grace_secs),
    ));
    let allocator = Arc::new(PortAllocator::new());
    let bus = EventBus::new();

    // Templates arrive as parsed objects; the on-disk JSONC files under
    // working/templates/ are the built-in adapter for them
    let templates = Arc::new(TemplateStore::new());
    load_templates(&config, &templates);
    info!("Loaded {} templates", templates.names().len());

    let services = Arc::new(ServiceDependencyManager::new(
        supervisor.clone(),
        allocator.clone(),
        config.runtime.clone(),
        config.system.log_directory.clone(),
    ));

    let sync = SyncManager::new(config.sync.clone(), config.sync_state_path(), bus.clone());

    // Reconcile persisted runs against the live process table
    let store = Arc::new(RunStore::new(config.run_state_path()));
    let reconciled = store
        .load(supervisor.as_ref())
        .await
        .context("Failed to load run state")?;
    info!("Reconciled {} persisted runs", reconciled);

    let manager = RunManager::new(
        config.clone(),
        templates.clone(),
        supervisor.clone(),
        services,
        store.clone(),
        Some(sync.clone()),
        bus.clone(),
    );

    // Runs that survived our restart keep syncing
    for run in store.all() {
        if run.status == RunStatus::Running {
            sync.register_run(&run);
        }
    }

    let scheduler = AutoRunScheduler::new(
        manager.clone(),
        templates.clone(),
        bus.clone(),
        config.auto_run_config_path(),
        &config.scheduler,
    );
    scheduler.initialize().await;

    info!("Orchestrator is up");

    // Run until ctrl-c, then unwind: scheduler timers, active runs
    // (implying final syncs), state flush
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C handler")?;
    warn!("Received shutdown signal, stopping runs...");

    scheduler.disable().await;
    manager.shutdown().await;

    info!("Daemon stopped");
    Ok(())
}

/// Parse template files from `working/templates/`, tolerating comments
fn load_templates(config: &Configuration, store: &TemplateStore) {
    let dir = config.system.working_directory.join("templates");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_template = path
            .extension()
            .map(|e| e == "jsonc" || e == "json")
            .unwrap_or(false);
        if !is_template {
            continue;
        }

        match jsonc::read_file::<Template>(&path) {
            Ok(template) => {
                info!("Loaded template {} from {}", template.name, path.display());
                store.register(template);
            }
            Err(e) => warn!("Skipping template {}: {}", path.display(), e),
        }
    }
}
