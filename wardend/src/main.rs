//! Warden Daemon
//!
//! Position lifecycle reconciliation engine.
//!
//! # Usage
//!
//! ```bash
//! # Start with default configuration
//! cargo run -p wardend
//!
//! # JSON logs, two exchanges, faster reconciliation
//! WARDEN_LOG_FORMAT=json WARDEN_EXCHANGES=binance,bybit WARDEN_SYNC_INTERVAL_SECS=30 \
//!     cargo run -p wardend
//! ```
//!
//! # Environment Variables
//!
//! - `WARDEN_ENV`: Environment (test, development, production)
//! - `WARDEN_API_HOST` / `WARDEN_API_PORT`: API bind address (default 0.0.0.0:8080)
//! - `WARDEN_EXCHANGES`: Comma-separated exchange ids (default: binance)
//! - `WARDEN_LOG_FORMAT`: `json` for structured logs
//! - `DATABASE_URL`: PostgreSQL store (feature `postgres`)
//!
//! See `Config::from_env` for the full list.

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wardend::{Config, Daemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("wardend=info".parse()?);
    let json = std::env::var("WARDEN_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        exchanges = ?config.exchanges.iter().map(|e| e.as_str()).collect::<Vec<_>>(),
        "Warden Daemon"
    );

    #[cfg(feature = "postgres")]
    if let Some(url) = config.database_url.clone() {
        let store = std::sync::Arc::new(warden_store::PgStore::connect(&url, 10).await?);
        store.migrate().await?;
        info!("Using PostgreSQL store");
        Daemon::with_stub_exchanges(config, store)?.run().await?;
        return Ok(());
    }

    // Create and run daemon
    let daemon = Daemon::new_stub(config)?;
    daemon.run().await?;

    Ok(())
}
