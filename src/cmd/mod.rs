//! CLI subcommands

pub mod diagnostics;
pub mod root;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Check the environment the orchestrator depends on
    Diagnostics,
}
