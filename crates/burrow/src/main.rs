use std::sync::Arc;

use anyhow::Context;
use burrow::config::Config;
use burrow::edge::{EdgeContext, EdgeServer};
use burrow::metrics::MetricsServer;
use burrow::net::bind_listener;
use burrow::registry::SessionRegistry;
use burrow::tunnel::{ControlServer, ControlSettings};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Public HTTP edge relaying requests to clients over WebSocket tunnels
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "BURROW_CONFIG")]
    config: Option<String>,

    /// Public HTTP port (overrides edge.port)
    #[arg(long, env = "BURROW_HTTP_PORT")]
    http_port: Option<u16>,

    /// Control channel port (overrides control.port)
    #[arg(long, env = "BURROW_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Response wait bound in milliseconds (overrides tunnel.request_timeout_ms)
    #[arg(long, env = "BURROW_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> Result<Config, anyhow::Error> {
        let mut config = match self.config {
            Some(ref path) => Config::from_file(path)
                .with_context(|| format!("Failed to load configuration from {path}"))?,
            None => Config::default(),
        };

        if let Some(port) = self.http_port {
            config.edge.port = port;
        }
        if let Some(port) = self.control_port {
            config.control.port = port;
        }
        if let Some(timeout) = self.request_timeout_ms {
            config.tunnel.request_timeout_ms = timeout;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.load_config()?;
    let registry = Arc::new(SessionRegistry::new());
    let shutdown = CancellationToken::new();

    let edge_listener = bind_listener(&config.edge.host, config.edge.port)
        .with_context(|| format!("Failed to bind edge port {}", config.edge.port))?;
    let control_listener = bind_listener(&config.control.host, config.control.port)
        .with_context(|| format!("Failed to bind control port {}", config.control.port))?;

    let edge = EdgeServer::new(edge_listener, EdgeContext::new(&config, Arc::clone(&registry)));
    let control = ControlServer::new(
        control_listener,
        ControlSettings::from_config(&config),
        Arc::clone(&registry),
    );

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(edge.run(shutdown.clone()));
    tasks.spawn(control.run(shutdown.clone()));

    if config.metrics.enabled {
        let listener = bind_listener(&config.edge.host, config.metrics.port)
            .with_context(|| format!("Failed to bind metrics port {}", config.metrics.port))?;
        tasks.spawn(MetricsServer::new(listener).run(shutdown.clone()));
    }

    info!(
        "Request timeout {} ms, up to {} in-flight requests per client",
        config.tunnel.request_timeout_ms, config.tunnel.max_in_flight
    );

    let mut result = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        Some(finished) = tasks.join_next() => {
            result = match finished {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("server task panicked: {e}")),
            };
            if let Err(ref e) = result {
                error!("Server stopped: {:#}", e);
            }
        }
    }

    shutdown.cancel();
    let closed = registry.close_all("edge shutting down");
    info!("Closed {} sessions", closed);
    while tasks.join_next().await.is_some() {}

    result
}
