//! Event bus for orchestrator-wide notifications

mod bus;

pub use bus::{EndReason, EventBus, OrchestratorEvent};
