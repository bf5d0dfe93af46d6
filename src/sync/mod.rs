//! Replication of run outputs to the central service
//!
//! Each registered run gets periodic and event-driven sync cycles: the
//! database files are mirrored first through an external incremental
//! binary-sync tool, then analysis files are uploaded that the central
//! service does not have yet.

mod client;
mod manager;

pub use client::{CentralClient, RemoteFileEntry, SyncClientError};
pub use manager::SyncManager;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Database files mirrored from a run's working directory
pub const DB_FILES: [&str; 2] = ["genomes.sqlite", "features.sqlite"];

/// Subdirectories scanned for analysis-file uploads
pub const ANALYSIS_SUBDIRS: [&str; 2] = ["analysisResults", "generationFeatures"];

/// Bound on the per-run ring of recent sync errors
pub const MAX_ERROR_RING: usize = 20;

/// One recorded sync error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Per-run sync state, persisted across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncState {
    pub last_db_sync: Option<DateTime<Utc>>,
    pub last_file_sync: Option<DateTime<Utc>>,

    pub cycles_completed: u64,
    pub db_files_synced: u64,
    pub files_uploaded: u64,

    pub consecutive_errors: u32,

    /// Bounded ring of recent errors, newest last
    pub recent_errors: VecDeque<SyncErrorRecord>,

    /// Per-run interval override in milliseconds
    pub interval_ms: Option<u64>,
}

impl SyncState {
    /// Append an error, keeping the ring bounded
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.recent_errors.push_back(SyncErrorRecord {
            at: Utc::now(),
            message: message.into(),
        });
        while self.recent_errors.len() > MAX_ERROR_RING {
            self.recent_errors.pop_front();
        }
    }
}
