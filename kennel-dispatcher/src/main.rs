//! kennel dispatcher.
//!
//! Watches `ScanType` and `ParseDefinition` resources, claims queued jobs
//! of the known types from the engine and creates one cluster workload per
//! claimed job.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kennel_config::{ConfigLoad, ConfigLoader};
use kennel_core::{
    Dispatcher, DispatcherSettings, EngineClient,
    cluster::{
        CascadingRuleResource, KubeDefinitionSource, KubeWorkloadSink,
        ParseDefinition, ScanType,
    },
};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kennel-dispatcher")]
#[command(about = "Launches queued kennel jobs as cluster workloads")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a TOML configuration file
    #[arg(long, env = "KENNEL_CONFIG")]
    config: Option<PathBuf>,

    /// How long to wait for the definition watches to list once
    #[arg(
        long,
        env = "DEFINITIONS_READY_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    ready_timeout: Duration,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the custom resource definitions kennel reads, as JSON, and exit
    Crds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Crds) = cli.command {
        let crds = [ScanType::crd(), ParseDefinition::crd(), CascadingRuleResource::crd()];
        for crd in crds {
            let rendered = serde_json::to_string_pretty(&crd)?;
            println!("{rendered}");
        }
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kube=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad { config, warnings } =
        loader.load().context("failed to load configuration")?;
    warnings.log();
    let dispatcher_config = config.dispatcher;

    let client = kube::Client::try_default()
        .await
        .context("failed to build cluster client")?;
    let namespace = dispatcher_config.namespace.clone();

    let definitions = tokio::time::timeout(
        cli.ready_timeout,
        KubeDefinitionSource::start(client.clone(), &namespace),
    )
    .await
    .with_context(|| {
        format!(
            "definition watches in namespace {namespace} not ready after {}",
            humantime::format_duration(cli.ready_timeout)
        )
    })?
    .context("failed to watch job definitions")?;

    let engine = EngineClient::new(&dispatcher_config.engine_address)
        .context("failed to build engine client")?;
    let workloads = KubeWorkloadSink::new(client, &namespace);

    info!(
        engine = %dispatcher_config.engine_address,
        namespace = %namespace,
        "Starting kennel dispatcher"
    );
    let dispatcher = Dispatcher::new(
        Arc::new(engine),
        Arc::new(definitions),
        Arc::new(workloads),
        DispatcherSettings::from_config(&dispatcher_config),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    dispatcher.run(shutdown).await;
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
