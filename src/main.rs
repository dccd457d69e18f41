//! Ticket validation gate server
//! Single-binary service: HTTP decision surface plus the background
//! reconciler draining the offline queue.

use anyhow::{Context, Result};
use clap::{Arg, Command};
use std::net::SocketAddr;
use std::sync::Arc;
use ticket_gate::config::Config;
use ticket_gate::database::DatabaseManager;
use ticket_gate::handlers::{create_router, AppState};
use ticket_gate::idempotency::RedisIdempotencyCache;
use ticket_gate::offline::RedisOfflineQueue;
use ticket_gate::pipeline::{DecisionPipeline, GateSettings};
use ticket_gate::rate_limit::RedisRateLimiter;
use ticket_gate::replay::RedisReplayGuard;
use ticket_gate::token::TokenVerifier;
use ticket_gate::worker::ReconcilerWorker;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let matches = Command::new("gate-server")
        .version("1.0.0")
        .author("Gate Team")
        .about("Ticket validation gate service")
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Server host"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("init-schema")
                .long("init-schema")
                .help("Run database migrations and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // Load configuration
    info!("Loading configuration from environment");
    let mut config = Config::from_env().context("Failed to load configuration")?;

    // Override with command line arguments
    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }

    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    config.validate().context("Configuration validation failed")?;
    let config = Arc::new(config);

    // Initialize services
    info!("Initializing services...");

    let database = DatabaseManager::new(&config.database)
        .await
        .context("Failed to initialize database")?;

    database.migrate().await.context("Failed to run migrations")?;

    if matches.get_flag("init-schema") {
        info!("Schema initialized successfully");
        return Ok(());
    }

    let redis_client =
        redis::Client::open(config.redis.url.as_str()).context("Invalid REDIS_URL")?;
    let cache = redis_client
        .get_connection_manager()
        .await
        .context("Failed to connect to Redis")?;

    let database = Arc::new(database);
    let queue = Arc::new(RedisOfflineQueue::new(
        cache.clone(),
        config.gate.default_offline_mode,
    ));

    let pipeline = Arc::new(DecisionPipeline::new(
        TokenVerifier::new(config.gate.signing_secret.as_bytes()),
        Arc::new(RedisRateLimiter::new(cache.clone())),
        Arc::new(RedisIdempotencyCache::new(cache.clone())),
        Arc::new(RedisReplayGuard::new(cache.clone())),
        queue.clone(),
        queue.clone(),
        database.clone(),
        GateSettings::from(&config.gate),
    ));

    // Independent control loop draining the offline queue
    let worker = ReconcilerWorker::new(queue.clone(), queue, database.clone());
    tokio::spawn(worker.run());

    let state = AppState {
        pipeline,
        database,
        cache,
    };

    // Create router with middleware
    let app = create_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(config.request_timeout()))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
    );

    // Start server
    let addr = SocketAddr::new(
        config.server.host.parse().context("Invalid server host")?,
        config.server.port,
    );

    info!("Starting ticket validation gate on {}", addr);
    print_config_summary(&config);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ticket_gate=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Print configuration summary
fn print_config_summary(config: &Config) {
    info!("=== Configuration Summary ===");
    info!("Server: {}:{}", config.server.host, config.server.port);
    info!("Redis URL: {}", config.redis.url);
    info!("Database pool: {} connections", config.database.max_connections);
    info!(
        "Rate limit: burst {}, {:.3} tokens/s sustained",
        config.gate.rate_capacity, config.gate.rate_refill_per_sec
    );
    info!("Default offline mode: {}", config.gate.default_offline_mode);
    info!("Request timeout: {}s", config.server.request_timeout_secs);
    info!("================================");
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
