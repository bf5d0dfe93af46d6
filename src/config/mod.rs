//! Configuration module

mod config;

pub use config::{
    ComputeConfiguration, Configuration, GlobalDefaults, RuntimeConfiguration,
    SchedulerSeedConfiguration, SyncConfiguration, SystemConfiguration,
};
