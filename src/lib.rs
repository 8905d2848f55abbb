pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::Cli;
pub use adapters::{LocalStorage, OrgMeterClient, SqliteStore};
pub use config::SyncConfig;
pub use core::{
    etl::ImportEngine,
    export::Exporter,
    pipeline::OrgMeterPipeline,
    runner::{ImportRunner, RunOptions, RunSummary},
};
pub use utils::error::{ImportError, Result};
