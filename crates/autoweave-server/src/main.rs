//! AutoWeave host entry point.
//!
//! Exit codes: 0 clean shutdown, 1 fatal configuration error, 2 ingress
//! stream unreachable at start, 3 host security lock, >128 signal-induced.

use autoweave_server::lifecycle::LifecycleController;
use autoweave_server::state::AppState;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_STREAM: i32 = 2;
const EXIT_SECURITY_LOCK: i32 = 3;

/// AutoWeave — plugin-driven job orchestration host
#[derive(Parser, Debug)]
#[command(name = "autoweave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the plugin root directory
    #[arg(long)]
    plugin_root: Option<PathBuf>,

    /// Keep all queue state in memory (no Redis persistence)
    #[arg(long)]
    ephemeral: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autoweave=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match autoweave_core::AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration invalid");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(root) = cli.plugin_root {
        config.plugins.root = root;
    }

    let state = match AppState::build(config, cli.ephemeral).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to build the host");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let mut controller = LifecycleController::new(state);
    if let Err(e) = controller.start().await {
        error!(error = %e, kind = e.kind(), "Startup failed");
        let code = match e.kind() {
            "stream-error" => EXIT_STREAM,
            _ => EXIT_CONFIG,
        };
        controller.stop().await;
        std::process::exit(code);
    }

    let code = run_until_signal(&controller).await;
    controller.stop().await;
    info!(code, "Exiting");
    std::process::exit(code);
}

/// Wait for a termination signal or a host security lock
async fn run_until_signal(controller: &LifecycleController) -> i32 {
    let host = controller.state().host.clone();
    let mut lock_poll = tokio::time::interval(Duration::from_secs(1));

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler installs");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received");
                    return EXIT_OK;
                }
                _ = sigterm.recv() => {
                    info!("Termination signal received");
                    return EXIT_OK;
                }
                _ = lock_poll.tick() => {
                    if host.is_locked() {
                        error!("Host locked after repeated security violations");
                        return EXIT_SECURITY_LOCK;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                return EXIT_OK;
            }
            _ = lock_poll.tick() => {
                if host.is_locked() {
                    error!("Host locked after repeated security violations");
                    return EXIT_SECURITY_LOCK;
                }
            }
        }
    }
}
