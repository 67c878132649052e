//! Process entry point: parse arguments, load configuration, start the
//! connection server and wait for a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use peergate::config::{load_config, PeergateConfig};
use peergate::lifecycle::Shutdown;
use peergate::net::{init_tls, ConnectionServer, ServerContext};
use peergate::observability::logging::init_logging;
use peergate::observability::metrics::init_metrics;

#[derive(Parser, Debug)]
#[command(name = "peergate", about = "Peer-to-peer search node network core")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    validate: bool,
}

/// What `--validate` reports. Without `--config` there is no file to
/// check, and saying so beats a misleading blanket "ok".
fn validate_report(config_path: Option<&std::path::Path>) -> String {
    match config_path {
        Some(path) => format!("configuration ok: {}", path.display()),
        None => "no configuration file given; built-in defaults are in effect".to_string(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        None => PeergateConfig::default(),
    };

    if cli.validate {
        println!("{}", validate_report(cli.config.as_deref()));
        return;
    }

    init_logging(&config.observability);
    if let Err(e) = init_metrics(&config.observability) {
        tracing::error!(error = %e, "metrics disabled");
    }

    let tls = match init_tls(&mut config.tls, &config.proxy.name) {
        Ok(tls) => tls,
        Err(e) => {
            tracing::error!(error = %e, "TLS initialization failed");
            std::process::exit(1);
        }
    };

    let ctx = match ServerContext::new(config) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!(error = %e, "failed to build server context");
            std::process::exit(1);
        }
    };

    let shutdown = Shutdown::new();
    let server = match ConnectionServer::bind(ctx, tls, shutdown.clone()).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let server_task = tokio::spawn(server.run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }
    shutdown.trigger();
    let _ = server_task.await;
}
