//! Process supervision
//!
//! A uniform abstraction over the node-local process manager. The run and
//! service layers only ever talk to the [`ProcessSupervisor`] trait; the
//! real backend spawns and tracks OS processes, the in-memory fake drives
//! deterministic tests.

mod fake;
mod local;

pub use fake::FakeSupervisor;
pub use local::LocalSupervisor;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::template::ExecMode;

/// Fixed prefix of compute process names
pub const COMPUTE_PREFIX: &str = "kromosynth-evolution-run";

/// Build a service process name: `<logical>_<runId>`.
///
/// The run id is always the strict suffix after the final `_`; logical
/// names never contain `_` and run ids never contain it either, so
/// extraction by [`run_id_of`] is unambiguous.
pub fn service_process_name(logical: &str, run_id: &str) -> String {
    debug_assert!(!logical.contains('_'), "logical name contains run-id separator");
    format!("{}_{}", logical, run_id)
}

/// Build the compute process name for a run: `<prefix>-<runId>`
pub fn compute_process_name(run_id: &str) -> String {
    format!("{}-{}", COMPUTE_PREFIX, run_id)
}

/// Extract the run id embedded in a process name, if any
pub fn run_id_of(name: &str) -> Option<&str> {
    if let Some(id) = name.strip_prefix(COMPUTE_PREFIX).and_then(|s| s.strip_prefix('-')) {
        return Some(id);
    }
    name.rsplit_once('_').map(|(_, id)| id)
}

/// Whether a process name belongs to the given run
pub fn belongs_to_run(name: &str, run_id: &str) -> bool {
    run_id_of(name) == Some(run_id)
}

/// Errors from supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process not found: {0}")]
    NotFound(String),

    #[error("process already exists: {0}")]
    AlreadyExists(String),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Status of a tracked process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Online,
    Stopped,
    Errored,
    Launching,
    Stopping,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Online => write!(f, "online"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Errored => write!(f, "errored"),
            ProcessStatus::Launching => write!(f, "launching"),
            ProcessStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Staggered periodic-restart schedule for a stateless service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicRestart {
    /// Minute of the hour at which the restart fires
    pub minute_offset: u8,

    /// Hour stride between restarts
    pub every_hours: u8,
}

impl PeriodicRestart {
    /// Render as a five-field cron expression
    pub fn cron(&self) -> String {
        format!("{} */{} * * *", self.minute_offset, self.every_hours)
    }
}

/// Declarative description of a process to start
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Process name; carries the owning run id as a suffix
    pub name: String,

    /// Script or executable path
    pub script: String,

    /// Arguments
    pub args: Vec<String>,

    /// Working directory
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    pub env: HashMap<String, String>,

    /// Interpreter (node, python, ...); absent means the script is
    /// executed directly
    pub interpreter: Option<String>,

    /// Number of parallel instances
    pub instances: u16,

    /// Execution mode
    pub exec_mode: ExecMode,

    /// Base port; cluster instances get `base + index` via the PORT
    /// environment variable
    pub port: Option<u16>,

    /// Whether the process manager restarts the process when it dies
    pub autorestart: bool,

    /// Memory ceiling in MB triggering an instance restart
    pub max_memory_restart_mb: Option<u64>,

    /// Periodic restart schedule
    pub periodic_restart: Option<PeriodicRestart>,

    /// Path of the stdout log file
    pub out_log: Option<PathBuf>,

    /// Path of the stderr log file
    pub err_log: Option<PathBuf>,
}

impl ProcessSpec {
    /// Minimal spec with defaults for the optional knobs
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            interpreter: None,
            instances: 1,
            exec_mode: ExecMode::Fork,
            port: None,
            autorestart: false,
            max_memory_restart_mb: None,
            periodic_restart: None,
            out_log: None,
            err_log: None,
        }
    }
}

/// Snapshot of a tracked process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    /// Process name
    pub name: String,

    /// Current status
    pub status: ProcessStatus,

    /// Pid of the first live instance
    pub pid: Option<u32>,

    /// CPU usage percentage across instances
    pub cpu_percent: f32,

    /// Resident set size across instances, in bytes
    pub memory_bytes: u64,

    /// Configured instance count
    pub instances: u16,
}

/// Which stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Lifecycle transitions reported on the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Restart,
    Exit { code: Option<i32> },
}

/// Events published by a supervisor.
///
/// Three categories: raw log lines, structured messages from the child
/// (stdout lines of the form `@msg <json>`), and lifecycle transitions.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Log {
        name: String,
        stream: StreamKind,
        line: String,
    },
    Message {
        name: String,
        payload: serde_json::Value,
    },
    Lifecycle {
        name: String,
        event: LifecycleEvent,
    },
}

impl SupervisorEvent {
    /// Name of the process the event concerns
    pub fn process_name(&self) -> &str {
        match self {
            SupervisorEvent::Log { name, .. } => name,
            SupervisorEvent::Message { name, .. } => name,
            SupervisorEvent::Lifecycle { name, .. } => name,
        }
    }
}

/// Uniform interface over the process manager.
///
/// `start`/`stop`/`delete` are serialized internally; the event stream is
/// a bounded broadcast, so a slow consumer lags and drops packets instead
/// of blocking the producer.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start a process according to its spec
    async fn start(&self, spec: ProcessSpec) -> SupervisorResult<ProcessSnapshot>;

    /// Stop a process with a kill-grace, keeping it tracked
    async fn stop(&self, name: &str) -> SupervisorResult<()>;

    /// Remove a process from tracking, stopping it first if needed
    async fn delete(&self, name: &str) -> SupervisorResult<()>;

    /// Snapshot all tracked processes
    async fn list(&self) -> SupervisorResult<Vec<ProcessSnapshot>>;

    /// Snapshot one process by name
    async fn describe(&self, name: &str) -> SupervisorResult<Option<ProcessSnapshot>>;

    /// Subscribe to the event stream
    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let id = "0190a1b2-c3d4-7000-8000-0123456789ab";

        let service = service_process_name("kromosynth-gRPC-variation", id);
        assert_eq!(service, format!("kromosynth-gRPC-variation_{}", id));
        assert_eq!(run_id_of(&service), Some(id));

        let compute = compute_process_name(id);
        assert_eq!(compute, format!("kromosynth-evolution-run-{}", id));
        assert_eq!(run_id_of(&compute), Some(id));
    }

    #[test]
    fn test_belongs_to_run() {
        let id = "0190a1b2-c3d4-7000-8000-0123456789ab";
        assert!(belongs_to_run(&service_process_name("kromosynth-render", id), id));
        assert!(belongs_to_run(&compute_process_name(id), id));
        assert!(!belongs_to_run("unrelated-process", id));
        assert!(!belongs_to_run(&compute_process_name("other"), id));
    }

    #[test]
    fn test_periodic_restart_cron() {
        let schedule = PeriodicRestart { minute_offset: 20, every_hours: 2 };
        assert_eq!(schedule.cron(), "20 */2 * * *");
    }
}
