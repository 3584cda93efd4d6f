use color_eyre::Result;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use toybridge::config::{config_dir, AppConfig};
use toybridge::status::StatusLevel;
use toybridge::BridgeHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    info!("Using config {}", config_path.display());
    let config = AppConfig::load_or_create(&config_path).await?;

    let tuning_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(config_dir);
    let tuning_path = config.tuning_path(&tuning_dir);

    let bridge = BridgeHandle::spawn(config, tuning_path).await?;

    // Without a UI attached, surface warnings and errors on the console.
    let mut status_rx = bridge.status();
    let status_task = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(entry) if entry.level != StatusLevel::Info => warn!("{}", entry),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Status feed skipped {} entries", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");

    bridge.shutdown().await?;
    status_task.abort();
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
