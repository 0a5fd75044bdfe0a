use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::kv::CLOUDFLARE_API_BASE;

/// Configuration for the webext-storage-cloudflare tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "webext-storage-cloudflare")]
#[command(about = "Cloudflare KV storage area with synchronized cells")]
pub struct Config {
    /// Cloudflare account ID
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    pub cloudflare_account_id: String,

    /// Cloudflare API token (needs KV read and write permissions)
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    pub cloudflare_api_token: String,

    /// KV namespace ID holding the values
    #[arg(long, env = "KV_NAMESPACE_ID")]
    pub kv_namespace_id: String,

    /// Cloudflare API endpoint
    #[arg(long, default_value = CLOUDFLARE_API_BASE, env = "CLOUDFLARE_API_BASE", global = true)]
    pub api_base: String,

    /// Deadline for each storage call, in milliseconds
    #[arg(long, default_value = "10000", env = "WEBEXT_STORAGE_TIMEOUT_MS", global = true)]
    pub timeout_ms: u64,

    /// Polling interval for change detection (seconds)
    #[arg(long, default_value = "5", env = "WATCH_POLL_INTERVAL", global = true)]
    pub watch_poll_interval_secs: u64,

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

        /// Do not persist the default when the key is absent
        #[arg(long)]
        no_write_defaults: bool,
    },
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.watch_poll_interval_secs.max(1))
    }
}
