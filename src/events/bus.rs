//! Event bus for pub/sub messaging
//!
//! Broadcasts run lifecycle, scheduler, and sync notifications to external
//! adapters (the control surface, log sinks). Subscribers that fall behind
//! lose messages instead of blocking the producers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::run::Progress;
use crate::supervisor::StreamKind;

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// Compute exited with code 0
    Terminated,

    /// Compute exited with a non-zero code
    Failed,

    /// The user stopped the run
    Stopped,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Terminated => write!(f, "terminated"),
            EndReason::Failed => write!(f, "failed"),
            EndReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Events published through the orchestrator bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: String,
        template_name: String,
        ecosystem_variant: Option<String>,
    },

    RunStopped {
        run_id: String,
    },

    RunPaused {
        run_id: String,
    },

    RunResumed {
        run_id: String,
    },

    RunProgress {
        run_id: String,
        progress: Progress,
    },

    RunLog {
        run_id: String,
        stream: StreamKind,
        line: String,
    },

    RunEnded {
        run_id: String,
        reason: EndReason,
        exit_code: Option<i32>,
    },

    TimeSliceStarted {
        run_id: String,
        template_name: String,
        minutes: u64,
    },

    TimeSliceEnding {
        run_id: String,
        template_name: String,
        remaining_secs: u64,
    },

    TimeSliceExpired {
        run_id: String,
        template_name: String,
    },

    AutoRunStatusChange {
        enabled: bool,
        paused: bool,
        reason: Option<String>,
    },

    TemplateConfigChange {
        template_name: String,
    },

    SyncStarted {
        run_id: String,
        reason: String,
    },

    SyncCompleted {
        run_id: String,
        db_files: usize,
        uploaded: usize,
        skipped: usize,
    },

    SyncError {
        run_id: String,
        message: String,
    },
}

impl OrchestratorEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::RunStarted { .. } => "run-started",
            OrchestratorEvent::RunStopped { .. } => "run-stopped",
            OrchestratorEvent::RunPaused { .. } => "run-paused",
            OrchestratorEvent::RunResumed { .. } => "run-resumed",
            OrchestratorEvent::RunProgress { .. } => "run-progress",
            OrchestratorEvent::RunLog { .. } => "run-log",
            OrchestratorEvent::RunEnded { .. } => "run-ended",
            OrchestratorEvent::TimeSliceStarted { .. } => "time-slice-started",
            OrchestratorEvent::TimeSliceEnding { .. } => "time-slice-ending",
            OrchestratorEvent::TimeSliceExpired { .. } => "time-slice-expired",
            OrchestratorEvent::AutoRunStatusChange { .. } => "auto-run-status-change",
            OrchestratorEvent::TemplateConfigChange { .. } => "template-config-change",
            OrchestratorEvent::SyncStarted { .. } => "sync-started",
            OrchestratorEvent::SyncCompleted { .. } => "sync-completed",
            OrchestratorEvent::SyncError { .. } => "sync-error",
        }
    }

    /// Run id the event concerns, when it concerns one
    pub fn run_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::RunStarted { run_id, .. }
            | OrchestratorEvent::RunStopped { run_id }
            | OrchestratorEvent::RunPaused { run_id }
            | OrchestratorEvent::RunResumed { run_id }
            | OrchestratorEvent::RunProgress { run_id, .. }
            | OrchestratorEvent::RunLog { run_id, .. }
            | OrchestratorEvent::RunEnded { run_id, .. }
            | OrchestratorEvent::TimeSliceStarted { run_id, .. }
            | OrchestratorEvent::TimeSliceEnding { run_id, .. }
            | OrchestratorEvent::TimeSliceExpired { run_id, .. }
            | OrchestratorEvent::SyncStarted { run_id, .. }
            | OrchestratorEvent::SyncCompleted { run_id, .. }
            | OrchestratorEvent::SyncError { run_id, .. } => Some(run_id),
            OrchestratorEvent::AutoRunStatusChange { .. }
            | OrchestratorEvent::TemplateConfigChange { .. } => None,
        }
    }
}

/// How many events the bus buffers per subscriber before it starts
/// dropping. `run-log` traffic dominates: a compute process logs a few
/// hundred lines per generation, so one buffer absorbs a full
/// generation burst plus the surrounding lifecycle chatter.
const BUS_CAPACITY: usize = 2048;

/// Broadcast bus carrying orchestrator events to external adapters.
///
/// Cloning shares the underlying channel. Publishing never blocks: an
/// adapter that falls behind lags and loses events rather than slowing
/// the run manager, scheduler, or sync manager down.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus sized for [`BUS_CAPACITY`] buffered events
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the bus; only events published after this call are
    /// delivered to the new receiver
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to every current subscriber.
    ///
    /// With no adapter connected the event simply evaporates; that is
    /// the normal state before the control surface attaches.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of currently attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
