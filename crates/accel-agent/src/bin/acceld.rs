//! Main binary for the accelerator slot daemon (acceld)

use accel_agent::{http, init_logging, AgentConfig, Container};
use accel_controller::Controller;
use accel_driver::MockDriver;
use anyhow::Context;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "acceld")]
#[command(about = "Accelerator slot controller daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data root directory
    #[arg(long, value_name = "DIR")]
    data_root: Option<PathBuf>,

    /// Override the HTTP bind address
    #[arg(long, value_name = "ADDR")]
    listen: Option<std::net::SocketAddr>,

    /// Override the log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AgentConfig::load_from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(data_root) = cli.data_root {
        config.core.data_root = data_root;
    }
    if let Some(listen) = cli.listen {
        config.http.listen = listen;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging)?;
    info!(data_root = %config.core.data_root.display(), "starting acceld");

    let controller = Controller::new(config.core.clone())?;

    if config.core.enable_mock_driver {
        controller
            .register_builtin(Arc::new(MockDriver::new(
                "mock",
                vec![
                    "ipsec.dh".to_string(),
                    "ipsec.aes".to_string(),
                    "snow3g".to_string(),
                ],
            )))
            .await?;
    }
    controller
        .preload_plugins()
        .await
        .context("failed to load accelerator driver plugins")?;

    // reconcile persisted slots against the saved container records
    let mut active: HashMap<String, String> = HashMap::new();
    for container in Container::load_all(&config.containers_dir()) {
        active.extend(container.active_slots());
    }
    controller.cleanup_slots(&active).await;

    let app = http::router(controller);
    let listener = tokio::net::TcpListener::bind(config.http.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.http.listen))?;
    info!(listen = %config.http.listen, "serving accelerator API");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
