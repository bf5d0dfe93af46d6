//! Run model and lifecycle management
//!
//! A run is one attempt at a long-running evolutionary search: one compute
//! process plus a cluster of auxiliary services, a port allocation, and a
//! working directory. The run manager owns every mutation of a run record;
//! everything else observes through the store or the event bus.

mod manager;
mod progress;
mod store;

pub use manager::{RunError, RunManager, RunView, StartOptions};
pub use progress::{ProgressDelta, ProgressParser};
pub use store::{RunStore, StoreError};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::ServiceInfo;

/// Mint a fresh run id: unique, sortable, time-ordered.
///
/// UUID v7 renders to hyphenated lowercase and can never contain `_`, the
/// process-name separator, so ids survive suffix extraction intact.
pub fn new_run_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Starting,
    Running,
    Paused,
    Stopped,
    Terminated,
    Failed,
}

impl RunStatus {
    /// Whether the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Stopped | RunStatus::Terminated | RunStatus::Failed
        )
    }

    /// Whether the lifecycle graph permits `self -> to`
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Starting, Running)
                | (Running, Stopped)
                | (Running, Terminated)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Stopped)
                // Resumption re-enters the lifecycle from any resting state
                | (Stopped, Running)
                | (Failed, Running)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Starting => write!(f, "starting"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Stopped => write!(f, "stopped"),
            RunStatus::Terminated => write!(f, "terminated"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Monotonic progress vector extracted from compute logs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Progress {
    pub generation: Option<u64>,
    pub total_generations: Option<u64>,
    /// Archive coverage in `[0, 1]`
    pub coverage: Option<f64>,
    pub qd_score: Option<f64>,
    pub best_fitness: Option<f64>,
    pub completion_percent: Option<f64>,
}

/// Error for transitions the lifecycle graph forbids
#[derive(Debug, Error)]
#[error("illegal run transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// The central run record.
///
/// Serializable to the run store; live process stats (pid, cpu, rss) are
/// deliberately absent and merged in by [`RunManager::get_run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub template_name: String,
    pub ecosystem_variant: Option<String>,
    pub status: RunStatus,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Scheduler bookkeeping
    pub pause_count: u32,
    pub total_active_millis: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_slice_started_at: Option<DateTime<Utc>>,
    pub auto_scheduled: bool,
    /// Derived flag: the last pause came from the scheduler, so the
    /// scheduler may resume this run. A user stop clears it.
    pub paused_by_scheduler: bool,

    /// Name of the compute process in the supervisor
    pub compute_name: String,
    /// The run's working directory
    pub working_dir: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_info: Option<ServiceInfo>,

    pub progress: Progress,

    /// Working-config files consumed by the compute process
    pub run_config_path: PathBuf,
    pub hyperparameters_path: PathBuf,
    pub wrapper_config_path: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Run {
    /// Transition the run, enforcing the lifecycle graph and stamping the
    /// transition timestamp.
    pub fn transition(&mut self, to: RunStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(to) {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        match to {
            RunStatus::Running => {
                if self.status == RunStatus::Starting {
                    self.started_at = Some(now);
                } else {
                    self.resumed_at = Some(now);
                }
            }
            RunStatus::Paused => self.paused_at = Some(now),
            RunStatus::Stopped => self.stopped_at = Some(now),
            RunStatus::Terminated | RunStatus::Failed => self.ended_at = Some(now),
            RunStatus::Starting => {}
        }

        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_sortable_and_separator_free() {
        let a = new_run_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_run_id();

        assert!(a < b, "ids must be time-ordered");
        assert!(!a.contains('_'));
    }

    #[test]
    fn test_legal_transitions() {
        use RunStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Running.can_transition_to(Terminated));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        use RunStatus::*;
        assert!(!Terminated.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Failed));
        assert!(!Paused.can_transition_to(Terminated));
        assert!(!Starting.can_transition_to(Paused));
        assert!(!Stopped.can_transition_to(Paused));
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let mut run = Run {
            id: new_run_id(),
            template_name: "t".into(),
            ecosystem_variant: None,
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
            auto_scheduled: false,
            paused_by_scheduler: false,
            compute_name: "c".into(),
            working_dir: PathBuf::from("/tmp"),
            service_info: None,
            progress: Progress::default(),
            run_config_path: PathBuf::new(),
            hyperparameters_path: PathBuf::new(),
            wrapper_config_path: PathBuf::new(),
            exit_code: None,
        };

        run.transition(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());

        run.transition(RunStatus::Paused).unwrap();
        assert!(run.paused_at.is_some());

        let err = run.transition(RunStatus::Failed).unwrap_err();
        assert_eq!(err.from, RunStatus::Paused);
    }
}
