//! mesh-sync - multi-zone control-plane sync core
//!
//! Binary entry point: logging, configuration and signal handling around
//! the control plane.

use mesh_sync::application::ControlPlane;
use mesh_sync::config::load_config;
use mesh_sync::infrastructure::{shutdown_signal, ShutdownController};
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let control_plane = ControlPlane::new(cfg)?;

    let shutdown = ShutdownController::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    control_plane.run(shutdown).await
}
