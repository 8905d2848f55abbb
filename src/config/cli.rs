use crate::core::EntityKind;
use crate::utils::logger::LogFormat;
use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "orgmeter-sync")]
#[command(about = "Imports OrgMeter records into a local store and tracks downstream sync")]
pub struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true, default_value = "orgmeter-sync.toml")]
    pub config: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override monitoring setting from config
    #[arg(long, global = true)]
    pub monitor: Option<bool>,

    /// compact or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Fetch records from OrgMeter and upsert them into the store
    Import {
        /// Only these funders (repeatable)
        #[arg(long)]
        funder: Vec<String>,

        /// Comma separated entity kinds, e.g. merchants,advances
        #[arg(long, value_delimiter = ',')]
        entity: Vec<EntityKind>,

        /// Ignore checkpoints and start every entity from page 1
        #[arg(long)]
        full: bool,

        /// Show what would be imported without calling the API
        #[arg(long)]
        dry_run: bool,
    },

    /// Record counts and checkpoints per entity
    Status {
        #[arg(long)]
        funder: Option<String>,
    },

    /// List records waiting to be synced downstream
    Pending {
        #[arg(long)]
        funder: String,

        #[arg(long)]
        entity: EntityKind,

        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Mark a record as synced
    MarkSynced {
        #[arg(long)]
        funder: String,

        #[arg(long)]
        entity: EntityKind,

        #[arg(long)]
        id: String,

        #[arg(long)]
        sync_id: String,
    },

    /// Write a zip of CSV and JSON files for one funder
    Export {
        #[arg(long)]
        funder: String,

        #[arg(long, value_delimiter = ',')]
        entity: Vec<EntityKind>,

        /// Output directory, defaults to export.output_path
        #[arg(long)]
        output: Option<String>,
    },
}
