//! nestdb - in-memory hierarchical key-value store
//!
//! Serves the line-delimited JSON command protocol over TCP, sweeps expired
//! keys, and reports its lifecycle to a supervising process on stdout.

use clap::Parser;
use nestdb_core::Database;
use nestdb_server::metrics::run_metrics_server;
use nestdb_server::supervisor::forward_to_stdout;
use nestdb_server::{
    CommandHandler, Config, ExpirySweeper, Metrics, Server, ServerConfig, ServerError, Supervisor,
    SupervisorEvent,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nestdb")]
#[command(version, about = "In-memory hierarchical key-value store")]
struct Cli {
    /// Port to listen on
    port: Option<u16>,

    /// Shared secret clients must present in init
    secret: Option<String>,

    /// Milliseconds between expiry sweeps
    expiry_accuracy_ms: Option<u64>,

    /// YAML configuration file
    #[arg(short, long, env = "NESTDB_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Applies command line values on top of `config`.
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(secret) = self.secret.as_deref().filter(|s| !s.is_empty()) {
            config.auth.secret = Some(secret.to_string());
            config.auth.secret_hash = None;
        }
        if let Some(ms) = self.expiry_accuracy_ms {
            config.expiry.accuracy_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let (supervisor, events) = Supervisor::channel();
    let forwarder = tokio::spawn(forward_to_stdout(events));

    let result = run(cli, supervisor.clone()).await;
    if let Err(ref e) = result {
        tracing::error!("{}", e);
        supervisor.report(SupervisorEvent::error(e));
    }

    drop(supervisor);
    let _ = forwarder.await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli, supervisor: Supervisor) -> Result<(), ServerError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(ref path) = cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }
    cli.apply(&mut config);
    config.validate()?;

    tracing::info!("Starting nestdb server");
    tracing::info!(
        "  Bind address: {}:{}",
        config.network.host,
        config.network.port
    );
    tracing::info!("  Expiry accuracy: {}ms", config.expiry.accuracy_ms);
    if config.auth.is_disabled() {
        tracing::info!("  Authentication: disabled");
    } else {
        tracing::info!("  Authentication: shared secret");
    }

    let metrics = if config.metrics.enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        None
    };

    let db = Arc::new(Mutex::new(Database::new()));

    let mut handler = CommandHandler::new(db.clone())
        .with_validator(config.auth.validator())
        .with_report_is_watching(config.protocol.report_is_watching);
    let mut sweeper = ExpirySweeper::new(db, config.expiry.interval());
    let mut server_config = ServerConfig::from_config(&config);
    if let Some(ref metrics) = metrics {
        handler = handler.with_metrics(metrics.clone());
        sweeper = sweeper.with_metrics(metrics.clone());
        server_config = server_config.with_metrics(metrics.clone());
    }

    let server = Arc::new(Server::new(server_config, handler).with_supervisor(supervisor));
    let sweeper = Arc::new(sweeper);

    let sweeper_handle = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run().await })
    };

    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        })
    });

    let signal_handle = {
        let server = server.clone();
        let sweeper = sweeper.clone();
        let metrics_shutdown = metrics_shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Received shutdown signal, stopping server...");
            server.shutdown();
            sweeper.shutdown();
            let _ = metrics_shutdown.send(());
        })
    };

    let result = server.run().await;

    // The signal task holds a server handle, and with it a supervisor sender.
    signal_handle.abort();

    sweeper.shutdown();
    let _ = metrics_shutdown.send(());
    let _ = sweeper_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    result?;
    tracing::info!("Server stopped");
    Ok(())
}
