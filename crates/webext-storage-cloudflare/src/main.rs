mod config;
mod kv;
mod watch;

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use webext_storage_core::{
    CellOptions, Snapshot, StorageArea, StorageBackend, SyncedCell, TimeoutBackend, Value,
};

use config::{Command, Config};
use kv::KvStorage;
use watch::PollingChangeFeed;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    info!("KV namespace: {}", config.kv_namespace_id);
    let poll_interval = config.poll_interval();

    let kv = KvStorage::new(
        config.cloudflare_account_id.clone(),
        config.kv_namespace_id.clone(),
        config.cloudflare_api_token.clone(),
    )
    .with_api_base(config.api_base.clone());
    let backend: Arc<dyn StorageBackend> =
        Arc::new(TimeoutBackend::new(Arc::new(kv), config.timeout()));

    match config.command {
        Command::Get { key } => match backend.get(&key).await? {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("No value stored for '{}'", key),
        },
        Command::Set { key, value } => {
            backend.set(&key, &value).await?;
            info!("Stored '{}'", key);
        }
        Command::Remove { key } => {
            backend.remove(&key).await?;
            info!("Removed '{}'", key);
        }
        Command::Watch {
            key,
            default,
            no_write_defaults,
        } => {
            info!("Poll interval: {:?}", poll_interval);
            let feed = PollingChangeFeed::start(backend.clone(), poll_interval);
            feed.watch_key(&key).await?;

            let area = StorageArea::new(backend).with_feed(Arc::new(feed));
            let options = CellOptions::new().write_defaults(!no_write_defaults);
            let cell = SyncedCell::bind(&area, key, Value::from_json_or_text(&default), options);
            run_watch(cell).await;
        }
    }

    Ok(())
}

/// Print every transition of the cell and assign stdin lines to it until
/// shutdown.
async fn run_watch(cell: SyncedCell) {
    let mut shutdown_rx = create_shutdown_signal();
    let mut snapshots = cell.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    cell.ready().await;
    info!("Cell '{}' ready ({})", cell.key(), cell.tag());
    print_snapshot(&snapshots.borrow_and_update());

    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|&v| v) => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                print_snapshot(&snapshots.borrow_and_update());
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => cell.set(Value::from_json_or_text(line.trim())).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    cell.dispose().await;
    info!("Shutdown complete");
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "[{}] {:?}: {}",
        snapshot.revision, snapshot.origin, snapshot.value
    );
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
            info!("Received SIGTERM, initiating shutdown");
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
