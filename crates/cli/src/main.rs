use std::sync::Arc;

use clap::Parser;
use roombus_config::Config;
use roombus_credentials::ApiKeyStore;
use roombus_gateway::server::{ServerConfig, build_gateway_app};
use roombus_room::{SqliteLogBucketStore, SqliteUsageCounterStore};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Start a roombus gateway instance.
#[derive(Parser)]
#[command(name = "roombus", about = "Roombus — multi-tenant WebSocket message bus")]
struct Cli {
    /// Address to bind to (overrides `BIND_ADDR`).
    #[arg(long)]
    bind: Option<String>,
    /// SQLite connection string (overrides `DATABASE_URL`).
    #[arg(long)]
    database_url: Option<String>,
    /// Bearer secret required on `/api-keys` routes (overrides `SERVICE_KEY`).
    #[arg(long)]
    service_key: Option<String>,
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.log_json {
        registry.with(fmt::layer().json().with_target(true).with_thread_ids(false)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = Config::load()?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }
    if let Some(service_key) = cli.service_key {
        config.service_key = Some(service_key);
    }

    info!(version = env!("CARGO_PKG_VERSION"), bind = %config.bind_addr, "roombus starting");

    let pool = sqlx::SqlitePool::connect(&config.database_url).await?;
    let api_keys = Arc::new(ApiKeyStore::new(pool.clone()).await?);
    let log_store = Arc::new(SqliteLogBucketStore::new(pool.clone()).await?);
    let usage_store = Arc::new(SqliteUsageCounterStore::new(pool).await?);

    let app = build_gateway_app(ServerConfig {
        config: Arc::new(config.clone()),
        api_keys,
        log_store,
        usage_store,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(bind = %config.bind_addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;

    Ok(())
}
