//! kennel engine.
//!
//! Holds the job queue, signs result upload URLs, turns completed scans
//! into parse jobs and evaluates cascading rules on reported findings.
//! The queue lives in Postgres when `DATABASE_URL` is set and in memory
//! otherwise.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kennel_config::{Config, ConfigLoad, ConfigLoader, RulesSource};
use kennel_core::{
    DisabledStorage, EngineSettings, InMemoryQueueService, MIGRATOR,
    ObjectStorageGateway, PostgresQueueService, QueueService, S3Gateway,
    ScanJobService,
    cascade::{NoRules, RuleSource, StaticRules},
    cluster::KubeRuleSource,
};
use kennel_engine::{AppState, create_app};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kennel-engine")]
#[command(about = "Job queue and cascading rule engine for kennel scans")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a TOML configuration file
    #[arg(long, env = "KENNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;

    if let Some(Command::Migrate) = cli.command {
        let url = config
            .database
            .url
            .as_deref()
            .context("DATABASE_URL is required to run migrations")?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL for migration")?;
        MIGRATOR.run(&pool).await.context("database migration failed")?;
        info!("Database migrations applied successfully");
        return Ok(());
    }

    run_server(config).await
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host.clone() {
        config.server.host = host;
    }

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "loaded configuration file");
    }
    warnings.log();
    Ok(config)
}

async fn build_queue(config: &Config) -> anyhow::Result<Arc<dyn QueueService>> {
    let Some(url) = config.database.url.as_deref() else {
        warn!("DATABASE_URL not set; jobs are kept in memory and lost on restart");
        return Ok(Arc::new(InMemoryQueueService::new()));
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    let queue = PostgresQueueService::new(pool)
        .await
        .context("queue failed to initialize")?;
    Ok(Arc::new(queue))
}

fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn ObjectStorageGateway>> {
    if config.storage.bucket.is_none() {
        warn!("no storage bucket configured; upload URL requests will fail");
        return Ok(Arc::new(DisabledStorage));
    }
    let gateway = S3Gateway::from_config(&config.storage)
        .context("failed to configure object storage")?;
    info!(storage = ?gateway, "object storage configured");
    Ok(Arc::new(gateway))
}

async fn build_rules(config: &Config) -> anyhow::Result<Arc<dyn RuleSource>> {
    let cascade = &config.cascade;
    match cascade.rules_source {
        RulesSource::Kubernetes => {
            let client = kube::Client::try_default()
                .await
                .context("failed to build cluster client for cascading rules")?;
            info!(namespace = %cascade.namespace, "cascading rules read from the cluster");
            Ok(Arc::new(KubeRuleSource::new(client, &cascade.namespace)))
        }
        RulesSource::File => {
            let path = cascade
                .rules_path
                .as_ref()
                .context("cascade.rules_path is required for file rules")?;
            let rules = StaticRules::from_json_file(path).with_context(|| {
                format!("failed to load cascading rules from {}", path.display())
            })?;
            Ok(Arc::new(rules))
        }
        RulesSource::None => {
            info!("cascading rules disabled");
            Ok(Arc::new(NoRules))
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let queue = build_queue(&config).await?;
    let storage = build_storage(&config)?;
    let rules = build_rules(&config).await?;
    let settings = EngineSettings::from(&config.engine);

    let service = ScanJobService::new(queue, storage, rules, settings);
    let app = create_app(AppState::new(service));

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "Starting kennel engine");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("kennel engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
