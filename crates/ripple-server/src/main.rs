//! # Ripple Server
//!
//! Realtime event distribution with automatic provider failover.
//!
//! ## Usage
//!
//! ```bash
//! # Run with ripple.toml in the working directory
//! ripple
//!
//! # Override settings from the environment
//! RIPPLE__PORT=8080 RIPPLE__AUTH__JWT_SECRET=... ripple
//!
//! # Use the upstream change feed as a fallback
//! RIPPLE__EXTERNAL__ENABLED=true RIPPLE__EXTERNAL__URL=wss://db.example.com/realtime/v1 ripple
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "ripple=info,ripple_core=info,ripple_transport=info";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = config::Config::load()?;
    let session_store = if cfg!(feature = "redis") && config.session.redis_url.is_some() {
        "redis"
    } else {
        "memory"
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %format!("{}:{}", config.host, config.port),
        namespace = %config.realtime.namespace,
        primary = %config.realtime.primary,
        fallback = ?config.realtime.fallback,
        external = config.external.enabled,
        session_store,
        "Starting Ripple"
    );

    metrics::init_metrics();
    handlers::run_server(config).await
}
