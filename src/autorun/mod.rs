//! Time-sliced auto-run scheduling
//!
//! Maintains up to `max_concurrent` auto-scheduled runs by rotating
//! through enabled template slots. A slot's run holds its place for one
//! time slice, then yields: the run is paused by the scheduler and the
//! freed slot goes to the next candidate. Consecutive failures pause the
//! scheduler itself instead of storming.

mod scheduler;

pub use scheduler::{AutoRunScheduler, SchedulerError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slot selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleMode {
    /// Oldest `last_run_at` first
    RoundRobin,

    /// Lowest `priority` value first
    Priority,
}

impl Default for ScheduleMode {
    fn default() -> Self {
        ScheduleMode::RoundRobin
    }
}

/// One template rotation entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSlot {
    pub template_name: String,

    #[serde(default)]
    pub ecosystem_variant: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Lower wins in priority mode
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_time_slice_minutes")]
    pub time_slice_minutes: u64,

    #[serde(default)]
    pub current_run_id: Option<String>,

    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub total_run_time_minutes: u64,
}

impl TemplateSlot {
    /// A fresh slot for a template
    pub fn new(template_name: impl Into<String>, ecosystem_variant: Option<String>) -> Self {
        Self {
            template_name: template_name.into(),
            ecosystem_variant,
            enabled: true,
            priority: 0,
            time_slice_minutes: default_time_slice_minutes(),
            current_run_id: None,
            last_run_at: None,
            total_run_time_minutes: 0,
        }
    }

    /// Stable key of the slot within the rotation
    pub fn key(&self) -> String {
        match &self.ecosystem_variant {
            Some(variant) => format!("{}@{}", self.template_name, variant),
            None => self.template_name.clone(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_time_slice_minutes() -> u64 {
    60
}

/// Persisted scheduler configuration (`working/auto-run-config.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoRunConfig {
    pub enabled: bool,
    pub max_concurrent: usize,
    pub mode: ScheduleMode,
    pub pause_on_failure: bool,
    pub max_failures_before_pause: u32,

    pub consecutive_failures: u32,
    pub paused: bool,
    pub pause_reason: Option<String>,

    pub templates: Vec<TemplateSlot>,
}
