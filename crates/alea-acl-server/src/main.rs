use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use alea_acl::{connect_cache, AclEngine, AclStore, Database, MigrationRunner};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

mod config;
mod server;
mod telemetry;

use config::ServerConfig;

/// ALeA ACL server - nested access-control lists over HTTP
#[derive(Parser, Debug)]
#[command(name = "alea-acl-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address (overrides ALEA_BIND_ADDR)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// libSQL database file (overrides ALEA_DB_PATH)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Cache backend: memory or redis (overrides ALEA_CACHE_BACKEND)
    #[arg(short, long)]
    cache: Option<String>,

    /// Redis URL for the redis backend (overrides ALEA_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    log_json: bool,

    /// Skip the full recompute at startup
    #[arg(long)]
    skip_recompute: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env()?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(path) = cli.db_path {
        config.db_path = Some(path);
    }
    config.override_cache(cli.cache.as_deref(), cli.redis_url)?;
    config.log_json |= cli.log_json;

    telemetry::init(config.log_json)?;

    info!("ALeA ACL server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let db = match &config.db_path {
        Some(path) => Database::open_local("acl", path).await?,
        None => Database::in_memory("acl").await?,
    };
    let db = Arc::new(db);
    MigrationRunner::acl()
        .run(&db)
        .await
        .context("failed to migrate ACL database")?;

    let cache = connect_cache(&config.cache)
        .await
        .context("failed to connect cache backend")?;

    let engine = AclEngine::new(AclStore::new(Arc::clone(&db)), cache);
    if cli.skip_recompute {
        info!("Skipping startup recompute");
    } else {
        let report = engine.recompute_all().await?;
        info!(
            acls = report.acls,
            assignments = report.assignments,
            dropped = report.dropped,
            "Startup recompute finished"
        );
    }

    let state = Arc::new(server::AppState::new(engine, db));
    server::start(config.bind_addr, state).await?;

    Ok(())
}
