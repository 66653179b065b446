//! lurcher: result extraction sidecar.
//!
//! Runs next to a scanner container, waits for it to terminate, uploads
//! the declared result files to their presigned URLs and reports the
//! upload summary to the engine.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use kennel_core::{
    EngineClient,
    cluster::KubePodStatusSource,
    lurcher::{
        ContainerStatusSource, FileExtraction, HttpUploader, Lurcher, LurcherSettings,
    },
};
use kennel_model::JobId;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "lurcher")]
#[command(about = "Uploads scan results once the scanner container exits")]
struct Cli {
    /// Result file as `<location>,<resultType>,<uploadUrl>`; repeatable
    #[arg(long = "file")]
    files: Vec<String>,

    /// Id of the scan job the results belong to
    #[arg(long)]
    scan_id: JobId,

    /// Name of the scanner container to wait for
    #[arg(long)]
    main_container_name: String,

    /// Base URL of the engine
    #[arg(long, env = "ENGINE_ADDRESS")]
    engine_address: Url,

    /// Shared volume the scanner writes its results to
    #[arg(long, default_value = "/home/kennel")]
    results_dir: PathBuf,

    /// Do not wait for the scanner container; upload right away
    #[arg(long, default_value_t = false)]
    skip_k8s: bool,

    /// Namespace of this pod
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of this pod, `HOSTNAME` when unset
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Delay between container status checks
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    poll_interval: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kube=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let files = cli
        .files
        .iter()
        .map(|raw| {
            raw.parse::<FileExtraction>()
                .with_context(|| format!("invalid --file argument '{raw}'"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let settings = LurcherSettings::new(
        cli.scan_id,
        cli.main_container_name.clone(),
        cli.results_dir.clone(),
        files,
    )
    .context("result files must live directly in the results directory")?
    .with_poll_interval(cli.poll_interval);

    let status: Option<Arc<dyn ContainerStatusSource>> = if cli.skip_k8s {
        None
    } else {
        let pod_name = cli
            .pod_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .context("POD_NAME or HOSTNAME is required unless --skip-k8s is set")?;
        let client = kube::Client::try_default()
            .await
            .context("failed to build cluster client")?;
        let source: Arc<dyn ContainerStatusSource> =
            Arc::new(KubePodStatusSource::new(client, &cli.namespace, pod_name));
        Some(source)
    };

    let engine = EngineClient::new(&cli.engine_address)
        .context("failed to build engine client")?;

    info!(
        scan_id = %cli.scan_id,
        container = %cli.main_container_name,
        files = settings.files.len(),
        "Starting lurcher"
    );
    let lurcher = Lurcher::new(
        settings,
        status,
        Arc::new(HttpUploader::default()),
        Arc::new(engine),
    );

    match lurcher.run().await {
        Ok(report) => {
            info!(
                uploaded = report.uploaded.len(),
                failed = report.failed.len(),
                "lurcher finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "lurcher failed");
            Err(err).context("failed to report scan completion")
        }
    }
}
