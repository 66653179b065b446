//! A scan from submission through upload, parsing and a cascaded follow-up,
//! with the engine, dispatcher and lurcher wired together in-process.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{Router, body::Bytes, extract::Path as UrlPath, routing::put};
use k8s_openapi::api::batch::v1::{Job as Workload, JobTemplateSpec};
use kennel_core::{
    DispatcherSettings, EngineSettings, InMemoryQueueService, ObjectStorageGateway,
    ReconcileOutcome, Result, ScanError, ScanJobService, UrlMethod,
    cascade::{PARENT_SCAN_ANNOTATION, StaticRules},
    cluster::{
        ExtractResult, JobDefinition, ParserDefinition, ScanDefinition, WorkloadSettings,
        WorkloadSink,
    },
    dispatcher::Dispatcher,
    lurcher::{FileExtraction, HttpUploader, Lurcher, LurcherSettings},
};
use kennel_model::{
    CHAIN_ANNOTATION, CascadeSpec, CascadingRule, Finding, JobId, JobState, JobSubmission,
    Severity,
};
use kube::ResourceExt;
use serde_json::json;
use url::Url;

/// Signs keys as plain URLs on a local object store.
struct LocalStorage {
    addr: SocketAddr,
}

#[async_trait]
impl ObjectStorageGateway for LocalStorage {
    async fn presign(&self, method: UrlMethod, key: &str) -> Result<Url> {
        let op = match method {
            UrlMethod::Put => "put",
            UrlMethod::Get => "get",
        };
        Url::parse(&format!("http://{}/bucket/{key}?op={op}", self.addr))
            .map_err(|e| ScanError::Internal(e.to_string()))
    }
}

type Objects = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

async fn spawn_object_store() -> (SocketAddr, Objects) {
    let objects: Objects = Arc::default();
    let stored = objects.clone();
    let app = Router::new().route(
        "/bucket/{*key}",
        put(move |UrlPath(key): UrlPath<String>, body: Bytes| {
            let stored = stored.clone();
            async move {
                stored.lock().unwrap().insert(key, body.to_vec());
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, objects)
}

/// Records each workload along with the job state the engine reported
/// at the moment the workload was created.
struct SnapshotSink {
    engine: Arc<ScanJobService>,
    created: tokio::sync::Mutex<Vec<(Workload, JobState)>>,
}

#[async_trait]
impl WorkloadSink for SnapshotSink {
    async fn create(&self, workload: Workload) -> Result<String> {
        let job_id: JobId = workload
            .labels()
            .get("kennel.io/job-id")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| ScanError::Cluster("workload without job id label".into()))?;
        let state = self.engine.get(job_id).await?.state;
        let name = workload.name_any();
        self.created.lock().await.push((workload, state));
        Ok(name)
    }
}

fn definitions(results_dir: &Path) -> Vec<JobDefinition> {
    let output = results_dir.join("nmap-results.xml").display().to_string();
    let job_template: JobTemplateSpec = serde_json::from_value(json!({
        "spec": { "template": { "spec": { "containers": [
            { "name": "nmap", "image": "kennel/scanner-nmap",
              "command": ["nmap", "-oX", output] }
        ]}}}
    }))
    .unwrap();
    vec![
        JobDefinition::Scan(ScanDefinition {
            name: "nmap".into(),
            tenant: None,
            job_template,
            extract_results: vec![ExtractResult {
                location: output,
                result_type: "nmap-xml".into(),
            }],
        }),
        JobDefinition::Parse(ParserDefinition {
            name: "nmap-xml".into(),
            tenant: None,
            image: "kennel/parser-nmap".into(),
            handles_results_type: "nmap-xml".into(),
        }),
    ]
}

fn dispatcher_settings(results_dir: PathBuf) -> DispatcherSettings {
    DispatcherSettings {
        tenant: "default".into(),
        claimant: "cluster-a".into(),
        poll_interval: Duration::from_millis(5),
        workload: WorkloadSettings {
            namespace: "scans".into(),
            lurcher_image: "kennel/lurcher".into(),
            service_account: "lurcher".into(),
            results_dir,
            engine_address: Url::parse("http://engine:3000").unwrap(),
            ttl_after_finished: Duration::from_secs(300),
        },
    }
}

fn tls_rule() -> CascadingRule {
    CascadingRule::new(
        "tls-scan",
        "sslyze",
        ["--regular", "{{$.hostOrIP}}:{{attributes.port}}"],
    )
        .matching(json!({
            "category": "Open Port",
            "attributes": { "service": "https" }
        }))
}

fn flag_values(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}

#[tokio::test]
async fn nmap_scan_flows_into_parse_and_cascade() {
    let (addr, objects) = spawn_object_store().await;
    let results = tempfile::tempdir().unwrap();

    let engine = Arc::new(ScanJobService::new(
        Arc::new(InMemoryQueueService::new()),
        Arc::new(LocalStorage { addr }),
        Arc::new(StaticRules::new(vec![tls_rule()])),
        EngineSettings::default(),
    ));
    let sink = Arc::new(SnapshotSink {
        engine: engine.clone(),
        created: tokio::sync::Mutex::default(),
    });
    let mut dispatcher = Dispatcher::new(
        engine.clone(),
        Arc::new(definitions(results.path())),
        sink.clone(),
        dispatcher_settings(results.path().to_path_buf()),
    );

    let scan_id = engine
        .submit(
            JobSubmission::new("nmap", "default", vec!["-Pn".into(), "example.com".into()])
                .with_cascades(Some(CascadeSpec::default())),
        )
        .await
        .unwrap();

    // Claim and launch the scanner.
    let outcome = dispatcher.reconcile_once().await.unwrap();
    assert!(matches!(
        outcome,
        ReconcileOutcome::Dispatched { job_id, .. } if job_id == scan_id
    ));

    let lurcher_args = {
        let created = sink.created.lock().await;
        let (workload, state_at_launch) = &created[0];
        assert_eq!(*state_at_launch, JobState::Locked);
        let pod = workload.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let command = pod.containers[0].command.as_ref().unwrap();
        assert!(command.ends_with(&["-Pn".to_string(), "example.com".to_string()]));

        let sidecar = &pod.containers[1];
        let args = sidecar.args.clone().unwrap();
        assert_eq!(flag_values(&args, "--scan-id"), vec![scan_id.to_string()]);
        args
    };
    let running = engine.get(scan_id).await.unwrap();
    assert_eq!(running.state, JobState::Running);
    assert_eq!(running.claimed_by.as_deref(), Some("cluster-a"));

    // The scanner writes its output and the sidecar ships it.
    std::fs::write(results.path().join("nmap-results.xml"), "<nmaprun/>").unwrap();
    let files: Vec<FileExtraction> = flag_values(&lurcher_args, "--file")
        .iter()
        .map(|arg| arg.parse().unwrap())
        .collect();
    let settings = LurcherSettings::new(scan_id, "nmap", results.path(), files).unwrap();
    let uploader = Arc::new(HttpUploader::default());
    let report = Lurcher::new(settings, None, uploader, engine.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(report.uploaded.len(), 1);
    assert!(report.failed.is_empty());

    let key = format!("scan-{scan_id}/nmap-results.xml");
    assert_eq!(objects.lock().unwrap()[&key], b"<nmaprun/>");

    let completed = engine.get(scan_id).await.unwrap();
    assert_eq!(completed.state, JobState::Completed);
    assert_eq!(completed.uploaded_files[0].upload_size, 10);
    assert_eq!(engine.queue_depth("default", "parse:nmap-xml").await.unwrap(), 1);

    // The parse job goes to the parser image with a download URL.
    let outcome = dispatcher.reconcile_once().await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Dispatched { .. }));
    {
        let created = sink.created.lock().await;
        let (workload, _) = &created[1];
        let pod = workload.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("kennel/parser-nmap"));
        let args = pod.containers[0].args.as_ref().unwrap();
        assert!(args[0].ends_with(&format!("{key}?op=get")));
        assert_eq!(args[1], scan_id.to_string());
    }

    // The parser reports findings; the https port cascades once.
    let findings = vec![
        Finding::new("Open Port: 443", "Open Port", Severity::Informational)
            .with_attribute("hostname", "example.com")
            .with_attribute("port", 443)
            .with_attribute("service", "https"),
        Finding::new("Open Port: 22", "Open Port", Severity::Informational)
            .with_attribute("hostname", "example.com")
            .with_attribute("port", 22)
            .with_attribute("service", "ssh"),
    ];
    let cascaded = engine.record_findings(scan_id, findings.clone()).await.unwrap();
    assert_eq!(cascaded.len(), 1);

    let follow_up = engine.get(cascaded[0]).await.unwrap();
    assert_eq!(follow_up.job_type, "sslyze");
    assert_eq!(follow_up.parameters, vec!["--regular", "example.com:443"]);
    assert_eq!(follow_up.metadata.annotations[CHAIN_ANNOTATION], "tls-scan");
    assert_eq!(
        follow_up.metadata.annotations[PARENT_SCAN_ANNOTATION],
        completed.name()
    );
    let expected_prefix = format!("sslyze-{scan_id}-tls-scan-");
    assert!(follow_up.name().starts_with(&expected_prefix));
    assert_eq!(follow_up.name().len(), expected_prefix.len() + 5);

    let summary = engine.get(scan_id).await.unwrap().findings.unwrap();
    assert_eq!(summary.count, 2);

    // A repeated report updates the summary but cascades nothing new.
    let again = engine.record_findings(scan_id, findings).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(engine.queue_depth("default", "sslyze").await.unwrap(), 1);
}
