//! Configuration structures and loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::jsonc;

/// Main orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// System paths and settings
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Paths to the compute CLI, service scripts, and interpreters
    #[serde(default)]
    pub runtime: RuntimeConfiguration,

    /// Compute process settings
    #[serde(default)]
    pub compute: ComputeConfiguration,

    /// Central sync settings
    #[serde(default)]
    pub sync: SyncConfiguration,

    /// Auto-run scheduler seed, used only when no persisted scheduler
    /// config exists yet
    #[serde(default)]
    pub scheduler: SchedulerSeedConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        config.system.resolve_paths(&config_base_dir(config_path));
        config.apply_env_overrides();
        config.ensure_directories()?;

        Ok(config)
    }

    /// Default configuration rooted at the given directory (tests, tooling)
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Configuration {
            debug: false,
            system: SystemConfiguration::default(),
            runtime: RuntimeConfiguration::default(),
            compute: ComputeConfiguration::default(),
            sync: SyncConfiguration::default(),
            scheduler: SchedulerSeedConfiguration::default(),
        };
        config.system.working_directory = root.join("working");
        config.system.log_directory = root.join("logs");
        config
    }

    /// Apply environment overrides; env sits between the file and
    /// explicit per-request options in precedence.
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = var("KROMOSYNTH_CLI_SCRIPT") {
            self.runtime.cli_script = PathBuf::from(v);
        }
        if let Some(v) = var("KROMOSYNTH_SERVICES_DIR") {
            self.runtime.services_dir = PathBuf::from(v);
        }
        if let Some(v) = var("KROMOSYNTH_NODE_PATH") {
            self.runtime.node_path = v;
        }
        if let Some(v) = var("KROMOSYNTH_PYTHON_PATH") {
            self.runtime.python_path = v;
        }
        if let Some(v) = var("KROMOSYNTH_MODEL_DIR") {
            self.runtime.model_dir = PathBuf::from(v);
        }

        if let Some(v) = var("KROMOSYNTH_SYNC_ENABLED") {
            self.sync.enabled = v == "true" || v == "1";
        }
        if let Some(v) = var("KROMOSYNTH_SYNC_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.sync.interval_ms = v;
        }
        if let Some(v) = var("KROMOSYNTH_SYNC_REMOTE_HOST") {
            self.sync.remote_host = Some(v);
        }
        if let Some(v) = var("KROMOSYNTH_SYNC_REMOTE_PATH") {
            self.sync.remote_base_path = Some(v);
        }
        if let Some(v) = var("KROMOSYNTH_SYNC_SERVICE_URL") {
            self.sync.service_url = Some(v);
        }
        if let Some(v) = var("KROMOSYNTH_SYNC_API_KEY") {
            self.sync.api_key = Some(v);
        }
    }

    /// Create the working and log directories
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.system.working_directory)?;
        std::fs::create_dir_all(&self.system.log_directory)?;
        Ok(())
    }

    /// Path of the durable run-state file
    pub fn run_state_path(&self) -> PathBuf {
        self.system.working_directory.join("run-state.json")
    }

    /// Path of the durable sync-state file
    pub fn sync_state_path(&self) -> PathBuf {
        self.system.working_directory.join("sync-state.json")
    }

    /// Path of the persisted scheduler configuration
    pub fn auto_run_config_path(&self) -> PathBuf {
        self.system.working_directory.join("auto-run-config.json")
    }

    /// Path of the global per-run option defaults
    pub fn global_defaults_path(&self) -> PathBuf {
        self.system.working_directory.join("global-defaults.json")
    }

    /// A run's working directory
    pub fn run_working_dir(&self, run_id: &str) -> PathBuf {
        self.system.working_directory.join(run_id)
    }

    /// Load the global per-run defaults, lowest-priority option source
    pub fn load_global_defaults(&self) -> GlobalDefaults {
        let path = self.global_defaults_path();
        if !path.exists() {
            return GlobalDefaults::default();
        }
        jsonc::read_file(&path).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable global defaults: {}", e);
            GlobalDefaults::default()
        })
    }
}

/// Directory that relative paths in a config file resolve against.
///
/// A file like `/etc/kromosynth/orchestrator.toml` anchors at
/// `/etc/kromosynth`; a bare filename like `orchestrator.toml` has no
/// parent component and anchors at the process working directory.
fn config_base_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// System paths and settings
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Directory holding per-run working directories and state files
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    /// Directory for per-run rolling log files
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
}

impl SystemConfiguration {
    /// Resolve relative paths against the config file's directory
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        self.working_directory = resolve_path(&self.working_directory, base_dir);
        self.log_directory = resolve_path(&self.log_directory, base_dir);
    }
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            log_directory: default_log_directory(),
        }
    }
}

fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn default_working_directory() -> PathBuf {
    PathBuf::from("working")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

/// Paths to the compute CLI, service scripts, and interpreters
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfiguration {
    /// The kromosynth-cli entry script run as the compute process
    #[serde(default = "default_cli_script")]
    pub cli_script: PathBuf,

    /// Directory holding the auxiliary service scripts
    #[serde(default = "default_services_dir")]
    pub services_dir: PathBuf,

    /// Node interpreter
    #[serde(default = "default_node_path")]
    pub node_path: String,

    /// Python interpreter
    #[serde(default = "default_python_path")]
    pub python_path: String,

    /// Directory of pretrained models handed to feature services
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Memory ceiling applied to services that declare none
    #[serde(default)]
    pub default_service_memory_mb: Option<u64>,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            cli_script: default_cli_script(),
            services_dir: default_services_dir(),
            node_path: default_node_path(),
            python_path: default_python_path(),
            model_dir: default_model_dir(),
            default_service_memory_mb: None,
        }
    }
}

fn default_cli_script() -> PathBuf {
    PathBuf::from("kromosynth-cli/cli-app/kromosynth.js")
}

fn default_services_dir() -> PathBuf {
    PathBuf::from("kromosynth-services")
}

fn default_node_path() -> String {
    "node".into()
}

fn default_python_path() -> String {
    "python3".into()
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

/// Compute process settings
#[derive(Debug, Clone, Deserialize)]
pub struct ComputeConfiguration {
    /// Memory ceiling for the compute process in MB
    #[serde(default = "default_compute_memory_mb")]
    pub max_memory_mb: u64,

    /// Kill-grace when stopping processes, in seconds
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

impl Default for ComputeConfiguration {
    fn default() -> Self {
        Self {
            max_memory_mb: default_compute_memory_mb(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

fn default_compute_memory_mb() -> u64 {
    8192
}

fn default_kill_grace_secs() -> u64 {
    10
}

/// Central sync settings
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfiguration {
    /// Master switch
    #[serde(default)]
    pub enabled: bool,

    /// Periodic sync interval per run, in milliseconds
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,

    /// Trigger a sync when a run pauses
    #[serde(default = "default_true")]
    pub sync_on_pause: bool,

    /// Trigger a sync when a run stops or ends
    #[serde(default = "default_true")]
    pub sync_on_stop: bool,

    /// Remote host for database mirroring (`user@host`)
    #[serde(default)]
    pub remote_host: Option<String>,

    /// Base path on the remote host
    #[serde(default)]
    pub remote_base_path: Option<String>,

    /// Central analysis-sync service URL
    #[serde(default)]
    pub service_url: Option<String>,

    /// API key for the analysis-sync service
    #[serde(default)]
    pub api_key: Option<String>,

    /// Incremental binary-sync tool invoked per database file
    #[serde(default = "default_db_tool")]
    pub db_tool: String,

    /// Consecutive cycle failures before the periodic timer self-cancels
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

impl Default for SyncConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_sync_interval_ms(),
            sync_on_pause: true,
            sync_on_stop: true,
            remote_host: None,
            remote_base_path: None,
            service_url: None,
            api_key: None,
            db_tool: default_db_tool(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

fn default_sync_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_db_tool() -> String {
    "rsync".into()
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// Scheduler seed configuration, consulted only when
/// `working/auto-run-config.json` does not exist yet
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSeedConfiguration {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// `round-robin` or `priority`
    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default = "default_true")]
    pub pause_on_failure: bool,

    #[serde(default = "default_max_failures")]
    pub max_failures_before_pause: u32,
}

impl Default for SchedulerSeedConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: default_max_concurrent(),
            mode: default_mode(),
            pause_on_failure: true,
            max_failures_before_pause: default_max_failures(),
        }
    }
}

fn default_max_concurrent() -> usize {
    1
}

fn default_mode() -> String {
    "round-robin".into()
}

fn default_max_failures() -> u32 {
    3
}

/// Global per-run option defaults from `working/global-defaults.json`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalDefaults {
    /// Default ecosystem variant when a request names none
    pub ecosystem_variant: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::rooted_at(Path::new("/srv/kromosynth"));
        assert_eq!(
            config.run_state_path(),
            PathBuf::from("/srv/kromosynth/working/run-state.json")
        );
        assert_eq!(config.sync.interval_ms, 300_000);
        assert_eq!(config.sync.retry_max_attempts, 5);
        assert!(config.sync.sync_on_pause);
        assert_eq!(config.compute.max_memory_mb, 8192);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            debug = true

            [system]
            working_directory = "/data/working"
            log_directory = "/data/logs"

            [sync]
            enabled = true
            remote_host = "sync@central"
            remote_base_path = "/replica/evoruns"

            [scheduler]
            enabled = true
            max_concurrent = 2
            mode = "priority"
        "#;

        let config: Configuration = toml::from_str(toml_str).unwrap();
        assert!(config.debug);
        assert!(config.sync.enabled);
        assert_eq!(config.sync.remote_host.as_deref(), Some("sync@central"));
        assert_eq!(config.scheduler.max_concurrent, 2);
        assert_eq!(config.scheduler.mode, "priority");
    }

    #[test]
    fn test_config_base_dir() {
        assert_eq!(
            config_base_dir(Path::new("/etc/kromosynth/orchestrator.toml")),
            PathBuf::from("/etc/kromosynth")
        );

        // A bare filename anchors at the process working directory
        let anchored = config_base_dir(Path::new("orchestrator.toml"));
        assert!(anchored.is_absolute() || anchored == PathBuf::from("."));
    }

    #[test]
    fn test_run_working_dir() {
        let config = Configuration::rooted_at(Path::new("/srv"));
        assert_eq!(
            config.run_working_dir("abc"),
            PathBuf::from("/srv/working/abc")
        );
    }
}
