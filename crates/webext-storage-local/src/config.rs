use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Configuration for the webext-storage-local tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "webext-storage-local")]
#[command(about = "Filesystem storage area shared between processes, with synchronized cells")]
pub struct Config {
    /// Base directory of the storage area
    #[arg(long, env = "WEBEXT_STORAGE_DIR", global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Deadline for each storage call, in milliseconds
    #[arg(long, default_value = "5000", env = "WEBEXT_STORAGE_TIMEOUT_MS", global = true)]
    pub timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the stored string for a key
    Get { key: String },

    /// Store a raw string under a key
    Set { key: String, value: String },

    /// Remove a key
    Remove { key: String },

    /// Bind a synchronized cell and print every transition.
    /// Lines read from stdin are assigned to the cell.
    Watch {
        #[arg(default_value = "webext-demo")]
        key: String,

        /// Default value, parsed as JSON when possible
        #[arg(long, default_value = "Storage Demo")]
        default: String,

        /// Merge stored object fields over the default's fields
        #[arg(long)]
        merge_defaults: bool,

        /// Do not persist the default when the key is absent
        #[arg(long)]
        no_write_defaults: bool,
    },
}

impl Config {
    /// Get the effective storage directory.
    pub fn effective_storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("webext-storage")
                .join("local")
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
