use std::sync::Arc;

use clap::Parser;
use lendscope_core::store::PgOfferStore;
use lendscope_core::{LendscopeConfig, PgCache};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use lendscope_server::auth::Authenticator;
use lendscope_server::http::{start_http_server, HttpState};
use lendscope_server::services::Services;
use lendscope_server::subsystems::reembed::run_reembed_worker;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "lendscope.toml")]
    config: String,

    /// Check database connectivity and exit.
    #[arg(long)]
    health: bool,

    /// Print a bearer token for this user id and exit.
    #[arg(long, value_name = "USER_ID")]
    issue_token: Option<String>,

    /// Lifetime of an issued token, in minutes.
    #[arg(long, default_value_t = 60)]
    token_minutes: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match LendscopeConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .init();

    if let Some(user_id) = args.issue_token {
        let token = Authenticator::from_env()?.issue(&user_id, args.token_minutes)?;
        println!("{}", token);
        return Ok(());
    }

    let pool = match lendscope_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match lendscope_core::db::health_check(&pool).await {
            Ok(v) => println!("PostgreSQL connected: {}", v),
            Err(e) => {
                println!("PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match lendscope_core::db::check_pgvector(&pool).await {
            Ok(v) => println!("pgvector version: {}", v),
            Err(e) => {
                println!("pgvector check failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("Lendscope DB health check passed");
        return Ok(());
    }

    if config.database.run_migrations {
        lendscope_core::db::run_migrations(&pool).await?;
        tracing::info!("Migrations applied");
    }

    let auth = Authenticator::from_env()?;
    let services = Arc::new(Services::connect(config.clone(), pool.clone()).await?);

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Re-index backfill, plus expiry of cache rows when they live in Postgres.
    let cache = (config.cache.backend != "memory").then(|| Arc::new(PgCache::new(pool.clone())));
    tokio::spawn(run_reembed_worker(
        Arc::new(PgOfferStore::new(pool.clone())),
        services.indexer(),
        cache,
        config.embedding.clone(),
        tx.subscribe(),
    ));

    if !config.http.enabled {
        tracing::warn!("HTTP API disabled via config, running background workers only");
        let mut shutdown = tx.subscribe();
        let _ = shutdown.recv().await;
        return Ok(());
    }

    let state = Arc::new(HttpState { services, auth });
    start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
