//! Finance Freedom - Account Security Backend
//! Mission: Serve registration, login, sessions and verified account changes

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use finance_freedom_backend::{
    auth::{
        mailer::LogMailer,
        object_store::LocalObjectStore,
        router,
        secrets::{EnvSecretProvider, SecretProvider},
        AuthState,
    },
    clock::SystemClock,
    config::{AppConfig, DEFAULT_LOG_FILTER, SIGNING_KEY_VAR},
    middleware::request_logging,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::{net::TcpListener, time::interval};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEV_SIGNING_KEY: &str = "finance-freedom-dev-signing-key-change-me";

#[derive(Parser, Debug)]
#[command(name = "finance-freedom")]
#[command(about = "Finance Freedom account security backend")]
struct Args {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// SQLite database path (overrides AUTH_DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Refuse to start without a configured signing key
    #[arg(long, env = "REQUIRE_SIGNING_KEY", default_value_t = false)]
    require_signing_key: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut config = AppConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(db_path) = args.db_path {
        config.auth_db_path = db_path;
    }

    info!("Starting Finance Freedom backend");
    info!(db = %config.auth_db_path, objects = %config.object_store_root.display(), "Storage");

    let mut secrets = EnvSecretProvider::new(SIGNING_KEY_VAR);
    if !args.require_signing_key {
        secrets = secrets.with_fallback(DEV_SIGNING_KEY);
    }
    let secrets = Arc::new(secrets);
    // Fail fast on a missing key instead of on the first login
    secrets.signing_key().context("Signing key unavailable")?;

    let state = AuthState::from_config(
        &config,
        secrets,
        Arc::new(LogMailer),
        Arc::new(LocalObjectStore::new(config.object_store_root.clone())),
        Arc::new(SystemClock),
    )
    .context("Failed to initialise auth core")?;

    spawn_maintenance(state.clone(), config.prune_interval);

    let app = router(state)
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

/// Periodically drop idle quota buckets and expired token rows
fn spawn_maintenance(state: AuthState, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;

            let pruned = state.limiter.prune_idle();
            let service = state.service.clone();
            match tokio::task::spawn_blocking(move || service.purge_expired()).await {
                Ok(Ok((refresh, verification))) => {
                    info!(pruned, refresh, verification, "Maintenance sweep complete");
                }
                Ok(Err(e)) => error!(error = %e, "Token purge failed"),
                Err(e) => error!(error = %e, "Token purge task panicked"),
            }
        }
    });
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
