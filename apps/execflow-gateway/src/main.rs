#![forbid(unsafe_code)]

//! **execflow-gateway** – HTTP entrypoint for the feature execution platform.
//!
//! Accepts feature requests over HTTP, assigns an execution identity,
//! publishes the first event onto the broker, and serves the DLQ operator
//! surface alongside a health check.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use execflow_backends::new_backends_with_fallback;
use execflow_gateway::settings::Settings;
use execflow_gateway::{build_router, GatewayState};
use execflow_hlc::HlcClock;
use execflow_queue::{parse_broker_scheme, BrokerScheme, InMemoryBroker, QueuePublisher};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "execflow-gateway")]
#[command(about = "Feature execution platform gateway")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML), loaded before environment overrides.
    #[arg(long, default_value = "config/gateway.toml")]
    config: String,

    /// HTTP server port; overrides the configured value when set.
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error); overrides the configured value.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config).context("failed to load gateway settings")?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(log_level) = cli.log_level {
        settings.log_level = log_level;
    }

    init_logging(&settings.log_level)?;
    info!("starting execflow-gateway v{}", env!("CARGO_PKG_VERSION"));

    let broker_scheme = parse_broker_scheme(&settings.broker_uri).context("unrecognized broker uri")?;
    let publisher: Arc<dyn QueuePublisher> = match broker_scheme {
        BrokerScheme::Mem => Arc::new(InMemoryBroker::new()),
        BrokerScheme::Nats | BrokerScheme::Kafka => {
            anyhow::bail!("broker scheme {:?} is named but has no adapter in this build", broker_scheme)
        }
    };

    let backend_config = settings.backend_config();
    let backends = new_backends_with_fallback(&backend_config, publisher.clone(), &settings.main_queue)
        .await
        .context("failed to construct backend set")?;
    info!(
        sequence = ?backends.resolved.sequence,
        dedup = ?backends.resolved.dedup,
        lock = ?backends.resolved.lock,
        dlq = ?backends.resolved.dlq,
        "resolved backends"
    );

    let state = GatewayState {
        publisher,
        requests_queue: settings.requests_queue.clone(),
        allowed_hosts: settings.allowed_hosts.clone(),
        clock: Arc::new(HlcClock::new()),
    };

    let app = build_router(state, backends.dlq).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.port))
        .await
        .with_context(|| format!("failed to bind to port {}", settings.port))?;
    info!("listening on port {}", settings.port);

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(err) = result {
                error!("http server error: {err}");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("execflow-gateway stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = format!("execflow_gateway={log_level},execflow_retry={log_level},execflow_dlq={log_level}");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
