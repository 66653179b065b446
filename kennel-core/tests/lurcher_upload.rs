use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::CONTENT_LENGTH},
    routing::put,
};
use kennel_core::{
    ClaimRequest, JobBroker, Result, ScanError,
    lurcher::{FileExtraction, HttpUploader, Lurcher, LurcherSettings},
};
use kennel_model::{JobId, UploadedFile, wire::LockedJob};
use url::Url;

#[derive(Clone, Default)]
struct Received {
    bodies: Arc<Mutex<BTreeMap<String, (Vec<u8>, Option<String>)>>>,
}

async fn store(
    State(received): State<Received>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if name == "broken" {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    received
        .bodies
        .lock()
        .unwrap()
        .insert(name, (body.to_vec(), length));
    StatusCode::OK
}

async fn spawn_store() -> (SocketAddr, Received) {
    let received = Received::default();
    let app = Router::new()
        .route("/bucket/{name}", put(store))
        .with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, received)
}

#[derive(Default)]
struct CountingBroker {
    reports: Mutex<Vec<(JobId, Vec<UploadedFile>)>>,
}

#[async_trait]
impl JobBroker for CountingBroker {
    async fn claim_next(&self, _: &ClaimRequest) -> Result<Option<LockedJob>> {
        Ok(None)
    }

    async fn issue_upload_url(&self, _: JobId, _: &str) -> Result<Url> {
        Err(ScanError::StorageUnavailable("not used by the lurcher".into()))
    }

    async fn mark_running(&self, _: JobId, _: &str) -> Result<()> {
        Ok(())
    }

    async fn report_completion(&self, job_id: JobId, files: Vec<UploadedFile>) -> Result<()> {
        self.reports.lock().unwrap().push((job_id, files));
        Ok(())
    }
}

#[tokio::test]
async fn failed_upload_does_not_block_the_others() {
    let (addr, received) = spawn_store().await;
    let results = tempfile::tempdir().unwrap();
    std::fs::write(results.path().join("one.xml"), "<nmaprun/>").unwrap();
    std::fs::write(results.path().join("two.xml"), "<broken/>").unwrap();
    std::fs::write(results.path().join("three.json"), "[]").unwrap();

    let declared = [
        ("one.xml", "nmap-xml", "one"),
        ("two.xml", "nmap-xml", "broken"),
        ("three.json", "json", "three"),
    ];
    let files: Vec<FileExtraction> = declared
        .iter()
        .map(|(file, result_type, target)| {
            format!(
                "{}/{file},{result_type},http://{addr}/bucket/{target}?X-Amz-Signature=abc",
                results.path().display()
            )
            .parse()
            .unwrap()
        })
        .collect();

    let scan_id = JobId::new();
    let settings = LurcherSettings::new(scan_id, "nmap", results.path(), files).unwrap();
    let broker = Arc::new(CountingBroker::default());
    let lurcher = Lurcher::new(
        settings,
        None,
        Arc::new(HttpUploader::default()),
        broker.clone(),
    );

    let report = lurcher.run().await.unwrap();
    assert_eq!(report.failed, vec!["two.xml"]);

    let reports = broker.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let (reported_id, files) = &reports[0];
    assert_eq!(*reported_id, scan_id);
    let names: Vec<_> = files.iter().map(|f| f.file_name.as_str()).collect();
    assert_eq!(names, vec!["one.xml", "three.json"]);
    assert_eq!(files[0].upload_size, 10);
    assert_eq!(files[1].result_type.as_deref(), Some("json"));

    let bodies = received.bodies.lock().unwrap();
    assert_eq!(bodies["one"].0, b"<nmaprun/>");
    assert_eq!(bodies["one"].1.as_deref(), Some("10"));
    assert_eq!(bodies["three"].0, b"[]");
    assert!(!bodies.contains_key("broken"));
}

#[tokio::test]
async fn failed_completion_report_is_an_error() {
    struct DownBroker;

    #[async_trait]
    impl JobBroker for DownBroker {
        async fn claim_next(&self, _: &ClaimRequest) -> Result<Option<LockedJob>> {
            Ok(None)
        }
        async fn issue_upload_url(&self, _: JobId, _: &str) -> Result<Url> {
            Err(ScanError::StorageUnavailable("down".into()))
        }
        async fn mark_running(&self, _: JobId, _: &str) -> Result<()> {
            Ok(())
        }
        async fn report_completion(&self, _: JobId, _: Vec<UploadedFile>) -> Result<()> {
            Err(ScanError::QueueUnavailable("engine unreachable".into()))
        }
    }

    let results = tempfile::tempdir().unwrap();
    let settings = LurcherSettings::new(JobId::new(), "nmap", results.path(), vec![]).unwrap();
    let lurcher = Lurcher::new(
        settings,
        None,
        Arc::new(HttpUploader::default()),
        Arc::new(DownBroker),
    );
    assert!(lurcher.run().await.is_err());
}
