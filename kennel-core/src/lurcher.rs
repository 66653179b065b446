//! Result-extraction sidecar.
//!
//! The lurcher runs next to a scanner container in the same pod. It waits
//! for the scanner to terminate, uploads the declared result files from the
//! shared results volume one after another, and reports the files that made
//! it to the engine. The scanner never learns the sidecar exists.

use std::{
    fmt,
    path::{Component, Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use kennel_model::{JobId, UploadedFile};
use reqwest::header::CONTENT_LENGTH;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    broker::JobBroker,
    error::{Result, ScanError},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One `--file <location>,<resultType>,<uploadUrl>` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExtraction {
    pub location: PathBuf,
    pub result_type: String,
    pub upload_url: Url,
}

impl FileExtraction {
    pub fn file_name(&self) -> Option<&str> {
        self.location.file_name().and_then(|n| n.to_str())
    }

    /// Rejects files that do not sit directly in `results_dir`. A bare file
    /// name is taken to be relative to it.
    pub fn ensure_in(&self, results_dir: &Path) -> Result<()> {
        let inside = match self.location.parent() {
            Some(parent) if parent.as_os_str().is_empty() => true,
            Some(parent) => same_dir(parent, results_dir),
            None => false,
        };
        let plain_name = matches!(
            self.location.components().next_back(),
            Some(Component::Normal(_))
        );
        if inside && plain_name {
            Ok(())
        } else {
            Err(ScanError::InvalidJob(format!(
                "result file {} is not inside the results directory {}",
                self.location.display(),
                results_dir.display()
            )))
        }
    }

    /// Where the file is read from inside the sidecar.
    pub fn source_path(&self, results_dir: &Path) -> Option<PathBuf> {
        self.file_name().map(|name| results_dir.join(name))
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    a.components().eq(b.components())
}

impl FromStr for FileExtraction {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, ',');
        let (Some(location), Some(result_type), Some(url)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ScanError::InvalidJob(format!(
                "expected <location>,<resultType>,<uploadUrl>, got '{raw}'"
            )));
        };
        if location.is_empty() || result_type.is_empty() {
            return Err(ScanError::InvalidJob(format!(
                "file location and result type must be set in '{raw}'"
            )));
        }
        let upload_url = Url::parse(url).map_err(|e| {
            ScanError::InvalidJob(format!("invalid upload url for {location}: {e}"))
        })?;
        Ok(Self {
            location: PathBuf::from(location),
            result_type: result_type.to_string(),
            upload_url,
        })
    }
}

/// Reads the primary container's lifecycle from the control plane.
#[async_trait]
pub trait ContainerStatusSource: Send + Sync {
    /// Exit code once `container` has terminated, `None` while it has not.
    async fn terminated_exit_code(&self, container: &str) -> Result<Option<i32>>;
}

/// Streams a local file to an upload URL.
#[async_trait]
pub trait ResultUploader: Send + Sync {
    /// Returns the number of bytes sent.
    async fn upload(&self, path: &Path, url: &Url) -> Result<u64>;
}

/// Single `PUT` with a known content length.
#[derive(Debug, Clone, Default)]
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultUploader for HttpUploader {
    async fn upload(&self, path: &Path, url: &Url) -> Result<u64> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .client
            .put(url.clone())
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %detail, "upload rejected");
            return Err(ScanError::HttpStatus {
                status,
                url: redact(url),
            });
        }
        Ok(size)
    }
}

/// URL without its query string, which carries the signature.
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LurcherPhase {
    WaitingForPrimary,
    Uploading,
    ReportingCompletion,
    Done,
}

impl fmt::Display for LurcherPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LurcherPhase::WaitingForPrimary => "waiting-for-primary",
            LurcherPhase::Uploading => "uploading",
            LurcherPhase::ReportingCompletion => "reporting-completion",
            LurcherPhase::Done => "done",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LurcherSettings {
    pub scan_id: JobId,
    pub main_container: String,
    pub results_dir: PathBuf,
    pub files: Vec<FileExtraction>,
    pub poll_interval: Duration,
}

impl LurcherSettings {
    /// Validates every declared file against the results directory.
    pub fn new(
        scan_id: JobId,
        main_container: impl Into<String>,
        results_dir: impl Into<PathBuf>,
        files: Vec<FileExtraction>,
    ) -> Result<Self> {
        let results_dir = results_dir.into();
        for file in &files {
            file.ensure_in(&results_dir)?;
        }
        Ok(Self {
            scan_id,
            main_container: main_container.into(),
            results_dir,
            files,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LurcherReport {
    pub uploaded: Vec<UploadedFile>,
    pub failed: Vec<String>,
}

pub struct Lurcher {
    settings: LurcherSettings,
    /// `None` skips waiting for the primary container.
    status: Option<Arc<dyn ContainerStatusSource>>,
    uploader: Arc<dyn ResultUploader>,
    broker: Arc<dyn JobBroker>,
}

impl fmt::Debug for Lurcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lurcher")
            .field("settings", &self.settings)
            .field("waits_for_primary", &self.status.is_some())
            .finish()
    }
}

impl Lurcher {
    pub fn new(
        settings: LurcherSettings,
        status: Option<Arc<dyn ContainerStatusSource>>,
        uploader: Arc<dyn ResultUploader>,
        broker: Arc<dyn JobBroker>,
    ) -> Self {
        Self {
            settings,
            status,
            uploader,
            broker,
        }
    }

    /// Runs to completion. Only a failed completion report is an error;
    /// individual upload failures are logged and left out of the report.
    pub async fn run(&self) -> Result<LurcherReport> {
        let mut phase = LurcherPhase::WaitingForPrimary;
        let mut report = LurcherReport::default();
        loop {
            debug!(scan_id = %self.settings.scan_id, phase = %phase, "lurcher phase");
            phase = match phase {
                LurcherPhase::WaitingForPrimary => {
                    if let Some(status) = &self.status {
                        self.wait_for_primary(status.as_ref()).await;
                    } else {
                        info!("skipping wait for the primary container");
                    }
                    LurcherPhase::Uploading
                }
                LurcherPhase::Uploading => {
                    report = self.upload_all().await;
                    LurcherPhase::ReportingCompletion
                }
                LurcherPhase::ReportingCompletion => {
                    self.broker
                        .report_completion(self.settings.scan_id, report.uploaded.clone())
                        .await
                        .inspect_err(|err| {
                            error!(
                                scan_id = %self.settings.scan_id,
                                error = %err,
                                "failed to report scan completion"
                            );
                        })?;
                    info!(
                        scan_id = %self.settings.scan_id,
                        uploaded = report.uploaded.len(),
                        failed = report.failed.len(),
                        "reported scan completion"
                    );
                    LurcherPhase::Done
                }
                LurcherPhase::Done => return Ok(report),
            };
        }
    }

    /// Polls until the primary container has terminated. Lookup errors are
    /// logged and retried; there is no timeout.
    async fn wait_for_primary(&self, status: &dyn ContainerStatusSource) {
        let container = &self.settings.main_container;
        info!(container = %container, "waiting for primary container to terminate");
        loop {
            match status.terminated_exit_code(container).await {
                Ok(Some(exit_code)) => {
                    info!(
                        container = %container,
                        exit_code,
                        "primary container terminated"
                    );
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        container = %container,
                        error = %err,
                        "failed to read container status"
                    );
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn upload_all(&self) -> LurcherReport {
        let mut report = LurcherReport::default();
        for file in &self.settings.files {
            let Some(file_name) = file.file_name().map(str::to_string) else {
                report.failed.push(file.location.display().to_string());
                continue;
            };
            let Some(path) = file.source_path(&self.settings.results_dir) else {
                report.failed.push(file_name);
                continue;
            };

            let started = Instant::now();
            match self.uploader.upload(&path, &file.upload_url).await {
                Ok(size) => {
                    info!(
                        file = %file_name,
                        bytes = size,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "uploaded result file"
                    );
                    report.uploaded.push(UploadedFile {
                        file_name,
                        upload_size: size,
                        result_type: Some(file.result_type.clone()),
                    });
                }
                Err(err) => {
                    warn!(file = %file_name, error = %err, "failed to upload result file");
                    report.failed.push(file_name);
                }
            }
        }
        report
    }
}
