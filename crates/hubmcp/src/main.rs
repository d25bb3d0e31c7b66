//! `hubmcp`: the orchestration gateway binary.
//!
//! Wires the initialization order the core's design notes mandate:
//! `EncryptionKey -> Registry -> SessionManager -> Janitor -> Bridge`. Tests
//! construct each of these fresh; this binary is the one place production
//! assembles them into a single running process.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use hubmcp_crypto::EncryptionKey;
use hubmcp_gateway::{router, AllowAllPolicy, BridgeState, GatewayConfig, Orchestrator};
use hubmcp_registry::ServerRegistry;
use hubmcp_session::{Janitor, SessionManager};

use cli::{Cli, Command};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::CheckConfig => check_config(),
        Command::Serve => serve().await,
    }
}

fn check_config() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().context("loading GatewayConfig")?;
    EncryptionKey::from_base64(&config.encryption_key_b64).context("MCP_ENCRYPTION_KEY")?;
    println!("configuration OK");
    println!("  bind_addr = {}", config.bind_addr);
    println!("  idle_timeout = {:?}", config.session.idle_timeout);
    println!("  cleanup_interval = {:?}", config.session.cleanup_interval);
    println!("  outbound_queue_capacity = {}", config.outbound_queue_capacity);
    println!("  auth_secret configured = {}", config.auth_secret.is_some());
    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().context("loading GatewayConfig")?;

    // EncryptionKey -> Registry -> SessionManager -> Janitor -> Bridge.
    let encryption_key = Arc::new(
        EncryptionKey::from_base64(&config.encryption_key_b64).context("MCP_ENCRYPTION_KEY")?,
    );

    let registry = Arc::new(
        ServerRegistry::connect(&config.database_url)
            .await
            .context("connecting to DATABASE_URL")?,
    );

    let manager = Arc::new(SessionManager::new(Arc::clone(&registry), config.session.clone()));

    let janitor = Janitor::new(Arc::clone(&manager));
    let shutdown = janitor.shutdown_handle();
    let janitor_task = tokio::spawn(janitor.run());

    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&manager), Arc::new(AllowAllPolicy)));

    let bridge_state = BridgeState::new(
        Arc::clone(&manager),
        orchestrator,
        Arc::clone(&registry),
        Arc::clone(&encryption_key),
        config.outbound_queue_capacity,
    );

    let app = router(bridge_state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(60))),
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    info!(bind_addr = %config.bind_addr, "hubmcp gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    let _ = shutdown.send(true);
    janitor_task.await.context("joining janitor task")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received, draining sessions");
}
