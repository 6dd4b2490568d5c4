//! Application lifecycle management and graceful shutdown.
//!
//! [`Application`] wires the process together and owns its lifecycle:
//!
//! 1. **Build**: install the metrics recorder, select the rate limit counter
//!    store, create the breaker and limiter, build the event consumer, bind
//!    the listener
//! 2. **Run**: spawn the consumer, serve HTTP
//! 3. **Shutdown**: on Ctrl+C or SIGTERM stop accepting requests, then stop
//!    the consumer (cancel the read loop, drop the broker session)
//!
//! # Example
//!
//! ```rust,ignore
//! let app = Application::build(Config::from_env()?).await?;
//! app.run().await?;
//! ```

use crate::config::Config;
use crate::events::{AnalyticsEventHandler, BeatCreatedDispatcher, HttpBeatMetricsTrigger};
use crate::server::build_router;
use analytics_core::environment::{Clock, SystemClock};
use analytics_runtime::circuit_breaker::CircuitBreaker;
use analytics_runtime::consumer::EventConsumer;
use analytics_runtime::metrics::MetricsServer;
use analytics_runtime::rate_limit::{RateLimiter, select_counter_store};
use analytics_web::AppState;
use anyhow::Context;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Running application with all background tasks.
pub struct Application {
    /// TCP listener for HTTP server
    listener: TcpListener,

    /// Axum router with all HTTP routes
    router: axum::Router,

    /// Event consumer; `None` when `ENABLE_KAFKA` is off
    consumer: Option<EventConsumer>,

    /// Application configuration
    config: Arc<Config>,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("listener", &self.listener.local_addr().ok())
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Build every component from `config` and bind the listener.
    ///
    /// An unreachable Redis is not an error: the limiter falls back to
    /// in-process counters. An unreachable broker is not an error either; the
    /// consumer keeps retrying once running.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The metrics recorder cannot be installed
    /// - The dispatcher's HTTP client cannot be built
    /// - The listener cannot bind
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let mut metrics = MetricsServer::new();
        metrics.start().context("Failed to start metrics recorder")?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = select_counter_store(config.rate_limit.redis_url.as_deref(), clock).await;
        let limiter = Arc::new(RateLimiter::new(config.rate_limiter_config(), store));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker_config()));

        let consumer = if config.redpanda.enabled {
            Some(build_consumer(&config)?)
        } else {
            info!("Kafka consumer disabled (ENABLE_KAFKA=false)");
            None
        };

        let mut state = AppState::new(breaker, limiter).with_metrics(metrics.handle().cloned());
        if let Some(consumer) = &consumer {
            state = state.with_consumer(consumer.clone());
        }

        let address = config.server.address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {address}"))?;

        Ok(Self {
            listener,
            router: build_router(state),
            consumer,
            config,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until Ctrl+C or SIGTERM, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP server fails.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP server fails.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let consumer_handle = self.consumer.as_ref().map(EventConsumer::spawn);
        if consumer_handle.is_some() {
            info!(
                brokers = %self.config.redpanda.brokers,
                topic = %self.config.redpanda.input_topic,
                "Event consumer started"
            );
        }

        info!(address = ?self.listener.local_addr().ok(), "HTTP server listening for requests");
        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

        info!("HTTP server stopped, initiating graceful shutdown...");

        if let Some(handle) = consumer_handle {
            let timeout = Duration::from_secs(self.config.server.shutdown_timeout);
            match tokio::time::timeout(timeout, handle.stop()).await {
                Ok(()) => info!("Event consumer stopped gracefully"),
                Err(_) => warn!(timeout_secs = timeout.as_secs(), "Event consumer shutdown timed out"),
            }
        }

        info!("Graceful shutdown complete");
        Ok(())
    }
}

fn build_consumer(config: &Config) -> anyhow::Result<EventConsumer> {
    let trigger = HttpBeatMetricsTrigger::new(
        config.dispatcher.endpoint.clone(),
        Duration::from_secs(config.dispatcher.timeout_secs),
    )?;
    let dispatcher = BeatCreatedDispatcher::new(Arc::new(trigger), config.dispatch_retry_policy());

    let consumer = EventConsumer::builder()
        .config(config.consumer_config())
        .connector(Arc::new(config.redpanda_connector()))
        .handler(Arc::new(AnalyticsEventHandler::new(dispatcher)))
        .build()?;

    Ok(consumer)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// A signal handler that cannot be installed never fires; the other one
/// still does.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
