//! Analytics service server.
//!
//! This binary:
//! - Loads configuration from the environment (and `.env`)
//! - Selects the rate limit counter store (Redis or in-process)
//! - Starts the Redpanda event consumer unless `ENABLE_KAFKA=false`
//! - Serves HTTP until Ctrl+C or SIGTERM
//!
//! # Usage
//!
//! ```bash
//! KAFKA_BROKER=localhost:9092 REDIS_URL=redis://localhost:6379 cargo run --bin analytics-service
//! ```

use analytics_service::{Application, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        address = %config.server.address(),
        kafka_enabled = config.redpanda.enabled,
        brokers = %config.redpanda.brokers,
        "Starting analytics service"
    );

    let app = Application::build(config).await?;
    app.run().await?;

    tracing::info!("Analytics service stopped");
    Ok(())
}
