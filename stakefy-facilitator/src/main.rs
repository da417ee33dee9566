//! stakefy facilitator HTTP server.
//!
//! # Usage
//!
//! ```bash
//! # Run with default config (config.toml in current directory)
//! cargo run -p stakefy-facilitator --release
//!
//! # Run with custom config path
//! CONFIG=/path/to/config.toml cargo run -p stakefy-facilitator
//!
//! # Configure logging level
//! RUST_LOG=stakefy=debug,info cargo run -p stakefy-facilitator
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to TOML configuration file (default: `config.toml`)
//! - `HOST` - Override bind address
//! - `PORT` - Override port
//! - `RUST_LOG` - Log level filter (default: `info`)
//!
//! A `.env` file in the working directory is loaded first.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use clap::Parser;
use stakefy::Facilitator;
use stakefy::ledger::{InMemoryLedger, Ledger};
use stakefy::session::PaymentSessionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use stakefy_facilitator::config::FacilitatorConfig;
use stakefy_facilitator::handlers::{AppState, facilitator_router};
use stakefy_facilitator::ledger_client::RemoteLedger;
use stakefy_facilitator::util::Shutdown;
use stakefy_facilitator::webhook::WebhookNotifier;

/// How long queued webhooks may run after the server stops.
const WEBHOOK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often unpaid sessions past their retention window are removed.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "stakefy-facilitator", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Bind address, overriding the configuration file.
    #[arg(long, env = "HOST")]
    host: Option<IpAddr>,

    /// Port, overriding the configuration file.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        tracing::error!("Facilitator failed: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = FacilitatorConfig::load_from(&args.config)?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    tracing::info!(
        host = %config.host,
        port = config.port,
        fee_percentage = %config.fee_percentage,
        "Loaded configuration"
    );

    let ledger = build_ledger(&config)?;
    if config.fee_address.trim().is_empty() {
        tracing::warn!("fee_address is not set: payment settlement will be refused");
    }

    let notifier = Arc::new(WebhookNotifier::new(config.webhook.clone())?);
    let facilitator = Facilitator::new(Arc::clone(&ledger), config.session_config()?)
        .with_events(Arc::<WebhookNotifier>::clone(&notifier));
    let sessions = facilitator.sessions().clone();
    let state = Arc::new(AppState {
        facilitator,
        ledger,
    });

    let app = facilitator_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let shutdown = Shutdown::listen()?;
    let token = shutdown.token();
    let sweeper = spawn_session_sweeper(sessions, shutdown.token());
    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Facilitator listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    if let Err(e) = sweeper.await {
        tracing::warn!("Session sweeper stopped abnormally: {e}");
    }
    if !notifier.drain(WEBHOOK_DRAIN_TIMEOUT).await {
        tracing::warn!("Webhook deliveries still pending at exit were dropped");
    }
    shutdown.wait().await;
    tracing::info!("Facilitator shut down gracefully");
    Ok(())
}

fn spawn_session_sweeper(sessions: PaymentSessionManager, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticks.tick() => {
                    if let Err(e) = sessions.prune_expired().await {
                        tracing::warn!(error = %e, "Session sweep failed");
                    }
                }
            }
        }
    })
}

fn build_ledger(config: &FacilitatorConfig) -> Result<Arc<dyn Ledger>, Box<dyn std::error::Error>> {
    let Some(url) = config.ledger.url.clone() else {
        tracing::warn!("No ledger url configured: using the in-memory development ledger");
        return Ok(Arc::new(InMemoryLedger::new()));
    };
    tracing::info!(url = %url, "Using remote ledger");
    let mut ledger =
        RemoteLedger::try_new(url)?.with_timeout(Duration::from_secs(config.ledger.timeout_secs));
    if let Some(token) = config.ledger.auth_token.as_deref().filter(|t| !t.is_empty()) {
        ledger = ledger.with_auth_token(token);
    }
    Ok(Arc::new(ledger))
}
