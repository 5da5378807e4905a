//! ==============================================================================
//! main.rs - bin level host entry point
//! ==============================================================================
//!
//! purpose:
//!     receives fill-level reports from waste-bin sensors (esp8266 firmware),
//!     validates them, stores them in the hosted database, and serves the
//!     reading history and current bin levels to the dashboard.
//!
//! responsibilities:
//!     - load configuration (host.toml + required environment credentials)
//!     - set up structured logging
//!     - pick the reading store backend (hosted REST database or in-memory)
//!     - subscribe to table changes and log them
//!     - serve the http endpoint until ctrl+c / SIGTERM
//!
//! relationships:
//!     - uses: config.rs (settings), store.rs (persistence), notify.rs (changes)
//!     - serves: api.rs (router)
//!
//! architecture:
//!
//!     ┌──────────────┐   POST / GET   ┌────────────────────────────────┐
//!     │ bin sensors  │ ─────────────► │            api.rs              │
//!     │ dashboards   │ ◄───────────── │  validate ─► store ─► respond  │
//!     └──────────────┘                └───────────────┬────────────────┘
//!                                                     │ ReadingStore
//!                                        ┌────────────┴────────────┐
//!                                        ▼                         ▼
//!                                 ┌─────────────┐           ┌─────────────┐
//!                                 │  RestStore  │           │ MemoryStore │
//!                                 │ (hosted db) │           │   (local)   │
//!                                 └─────────────┘           └─────────────┘
//!
//! ==============================================================================

mod api;
mod config;
mod domain;
mod error;
mod notify;
mod store;
mod validation;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

use config::{Backend, HostConfig, StoreCredentials};
use notify::{ChangeEvent, ChangeFeed, OnChange, PollingFeed};
use store::{MemoryStore, ReadingStore, RestStore};

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration, then logging from it
    let (config, source) = HostConfig::load_or_default();
    init_logging(&config.logging.level);

    tracing::info!("Bin Level Host - sensor ingestion endpoint");
    source.log();
    config.log_summary();

    // step 2: reading store and its change feed
    let (store, feed) = build_store(&config)?;

    // step 3: log every change to the reading table
    let on_change: OnChange = Arc::new(|event: ChangeEvent| {
        tracing::info!("[NOTIFY] reading table changed: {:?}", event);
    });
    let subscription = feed.map(|feed| feed.subscribe(on_change));

    // step 4: serve until shutdown
    let app = api::router(api::AppState::new(store));
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!("[STARTUP] Endpoint live at http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if let Some(subscription) = subscription {
        subscription.unsubscribe();
    }
    tracing::info!("Server shut down");
    Ok(())
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();
}

/// store plus the feed that reports its changes, if any
fn build_store(config: &HostConfig) -> Result<(Arc<dyn ReadingStore>, Option<Box<dyn ChangeFeed>>)> {
    match config.store.backend {
        Backend::Rest => {
            // missing credentials stop startup here, never at request time
            let creds = StoreCredentials::from_env().context("hosted store is not configured")?;
            let store: Arc<dyn ReadingStore> = Arc::new(RestStore::new(
                &creds.url,
                &creds.key,
                &config.store.table,
                Duration::from_secs(config.store.timeout_seconds),
            )?);
            tracing::info!("[STARTUP] Using hosted store at {}", creds.url);

            let feed: Option<Box<dyn ChangeFeed>> = match config.notify.poll_interval_seconds {
                0 => None,
                secs => Some(Box::new(PollingFeed::new(store.clone(), Duration::from_secs(secs)))),
            };
            Ok((store, feed))
        }
        Backend::Memory => {
            tracing::warn!("[STARTUP] Using in-memory store, readings are lost on exit");
            let store = Arc::new(MemoryStore::new());
            let feed: Box<dyn ChangeFeed> = Box::new(store.feed().clone());
            Ok((store as Arc<dyn ReadingStore>, Some(feed)))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
