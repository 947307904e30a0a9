//! API Gateway - CLI Application
//!
//! - `start`: run the gateway
//! - `validate`: check a configuration file
//! - `init`: write a sample configuration
//! - `hash-password`: produce a bcrypt hash for seeded users

use api_gateway::{
    api::{router, AppState, Stores},
    auth::hash_password,
    config::{CounterBackend, GatewayConfig},
    proxy::ProxyForwarder,
    store::{CounterStore, MemoryCounterStore, MemoryStore, RedisCounterStore},
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How often expired in-memory counters are swept
const COUNTER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for pending access log records
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// API Gateway - request admission and forwarding for registered backends
#[derive(Parser)]
#[command(name = "api-gateway")]
#[command(version, about = "Request admission and forwarding for backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
    /// Print a bcrypt hash for a seeded user's password
    HashPassword {
        password: String,
        /// bcrypt cost factor
        #[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
        cost: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
        Commands::HashPassword { password, cost } => {
            println!("{}", hash_password(&password, cost)?)
        }
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = GatewayConfig::from_file(config_path)?;
    info!("Loaded configuration from {}", config_path);

    let store = Arc::new(MemoryStore::new());
    config.seed(&store).await?;

    let mut degraded = None;
    let counters: Option<Arc<dyn CounterStore>> = match config.rate_limit.backend {
        CounterBackend::Memory => {
            let counters = Arc::new(MemoryCounterStore::new());
            spawn_counter_sweeper(counters.clone());
            Some(counters)
        }
        CounterBackend::Redis => {
            let url = config.rate_limit.redis_url.clone().unwrap_or_default();
            match RedisCounterStore::connect(&url).await {
                Ok(counters) => {
                    info!("Rate limit counters stored in redis");
                    Some(Arc::new(counters))
                }
                Err(e) => {
                    warn!("Redis unavailable, rate limiting disabled: {}", e);
                    degraded = Some(format!("rate limiting disabled: {}", e));
                    None
                }
            }
        }
        CounterBackend::Disabled => {
            warn!("Rate limiting disabled by configuration");
            degraded = Some("rate limiting disabled by configuration".to_string());
            None
        }
    };

    let forwarder = Arc::new(ProxyForwarder::new(Duration::from_secs(config.proxy.timeout))?);
    let addr: SocketAddr = config.server_addr().parse()?;

    let (state, writer) = AppState::new(config, Stores::memory(store), counters, forwarder);
    if let Some(reason) = degraded {
        state.health.set_degraded(reason);
    }

    let app = router(state.clone());

    if state.config.health.enabled {
        info!("Health endpoint enabled at {}", state.config.health.path);
    }
    if state.config.metrics.enabled {
        info!("Metrics endpoint enabled at {}", state.config.metrics.path);
    }

    info!("Starting gateway server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    state.health.set_ready(true);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Shutting down, draining access log");
    state.health.set_ready(false);
    state.logger.flush().await;
    drop(state);
    if tokio::time::timeout(LOG_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("Access log writer did not stop in time");
    }

    Ok(())
}

fn spawn_counter_sweeper(counters: Arc<MemoryCounterStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COUNTER_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let purged = counters.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Swept expired rate limit counters");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
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

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}:{}", config.server.host, config.server.port);
            println!("Management API: {}", config.server.api_prefix);
            println!("Rate limit backend: {:?}", config.rate_limit.backend);
            println!(
                "Global limit: {} requests / {}s",
                config.rate_limit.global_limit, config.rate_limit.global_window
            );
            println!("Users: {}", config.users.len());
            println!("API Keys: {}", config.api_keys.len());
            println!();
            println!("Services:");
            for seed in &config.services {
                let svc = &seed.service;
                println!(
                    "  {}/{} → {} ({}, {} req/{}s)",
                    seed.owner,
                    svc.name,
                    svc.base_url,
                    svc.status,
                    svc.rate_limit,
                    svc.rate_limit_duration
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    let admin_hash = hash_password("change-me", bcrypt::DEFAULT_COST)?;
    let sample_config = format!(
        r#"# API Gateway Configuration

[server]
host = "0.0.0.0"
port = 8080
api_prefix = "/api"

[auth]
# May also be supplied through GATEWAY_JWT_SECRET
jwt_secret = "replace-with-a-long-random-secret"
token_expire_minutes = 11520

[rate_limit]
backend = "memory"  # Options: memory, redis, disabled
# redis_url = "redis://127.0.0.1:6379"
global_limit = 120
global_window = 60

[proxy]
timeout = 60

[access_log]
buffer = 1024

[metrics]
enabled = true
path = "/metrics"

[health]
enabled = true
path = "/health"

# Initial password is "change-me"; regenerate with `api-gateway hash-password`
[[users]]
username = "admin"
email = "admin@example.com"
password_hash = "{admin_hash}"
role = "admin"

[[services]]
owner = "admin"
name = "orders"
description = "Order service"
base_url = "http://localhost:3001"
visibility = "public"
rate_limit = 60
rate_limit_duration = 60
require_authentication = true
auth_header_name = "X-User-Id"
forward_headers = ["content-type", "x-request-id"]
"#
    );

    std::fs::write(output_path, sample_config)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}
