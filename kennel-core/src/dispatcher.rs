//! Reconcile loop turning claimed jobs into cluster workloads.

use std::{fmt, path::Path, sync::Arc, time::Duration};

use kennel_config::DispatcherConfig;
use kennel_model::{JobId, wire::LockedJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broker::JobBroker,
    cluster::{
        DefinitionCache, DefinitionSource, FileUpload, JobDefinition,
        ScanDefinition, WorkloadSettings, WorkloadSink, build_parse_workload,
        build_scan_workload,
    },
    error::{Result, ScanError},
    queue::ClaimRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub tenant: String,
    pub claimant: String,
    pub poll_interval: Duration,
    pub workload: WorkloadSettings,
}

impl DispatcherSettings {
    pub fn from_config(cfg: &DispatcherConfig) -> Self {
        Self {
            tenant: cfg.tenant.clone(),
            claimant: cfg.claimant.clone(),
            poll_interval: cfg.poll_interval,
            workload: WorkloadSettings::from_config(cfg),
        }
    }
}

/// What one reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No job definitions are known, nothing was claimed.
    NoDefinitions,
    /// Every candidate queue was empty.
    Idle,
    Dispatched { job_id: JobId, workload: String },
    /// A job was claimed but no workload exists for it. The job stays
    /// claimed.
    Abandoned { job_id: JobId, reason: String },
}

pub struct Dispatcher {
    broker: Arc<dyn JobBroker>,
    definitions: Arc<dyn DefinitionSource>,
    workloads: Arc<dyn WorkloadSink>,
    cache: DefinitionCache,
    settings: DispatcherSettings,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cache", &self.cache)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        definitions: Arc<dyn DefinitionSource>,
        workloads: Arc<dyn WorkloadSink>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            broker,
            definitions,
            workloads,
            cache: DefinitionCache::new(),
            settings,
        }
    }

    /// One pass: refresh definitions, claim at most one job, launch its
    /// workload. Errors are infrastructure failures from the definition
    /// source or the claim; the caller retries on the next tick.
    pub async fn reconcile_once(&mut self) -> Result<ReconcileOutcome> {
        self.cache.refresh(self.definitions.as_ref()).await?;
        let candidates = self.cache.candidate_types(&self.settings.tenant);
        if candidates.is_empty() {
            warn!(
                tenant = %self.settings.tenant,
                "no job definitions available"
            );
            return Ok(ReconcileOutcome::NoDefinitions);
        }

        let request = ClaimRequest::new(
            candidates,
            self.settings.tenant.clone(),
            Some(self.settings.claimant.clone()),
        );
        let Some(job) = self.broker.claim_next(&request).await? else {
            debug!(candidates = ?request.job_types, "no job available");
            return Ok(ReconcileOutcome::Idle);
        };
        info!(job_id = %job.id, job_type = %job.job_type, "claimed job");

        match self.launch(&job).await {
            Ok(workload) => {
                if let Err(err) =
                    self.broker.mark_running(job.id, &workload).await
                {
                    warn!(
                        job_id = %job.id,
                        workload = %workload,
                        error = %err,
                        "failed to record running workload"
                    );
                }
                info!(job_id = %job.id, workload = %workload, "workload created");
                Ok(ReconcileOutcome::Dispatched {
                    job_id: job.id,
                    workload,
                })
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    error = %err,
                    "failed to launch workload"
                );
                Ok(ReconcileOutcome::Abandoned {
                    job_id: job.id,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn launch(&self, job: &LockedJob) -> Result<String> {
        let definition = self
            .cache
            .get(&self.settings.tenant, &job.job_type)
            .ok_or_else(|| {
                ScanError::InvalidJob(format!(
                    "no definition for job type '{}'",
                    job.job_type
                ))
            })?;
        let workload = match definition {
            JobDefinition::Scan(def) => {
                let uploads = self.upload_targets(job, def).await?;
                build_scan_workload(job, def, &uploads, &self.settings.workload)?
            }
            JobDefinition::Parse(def) => {
                build_parse_workload(job, def, &self.settings.workload)
            }
        };
        self.workloads.create(workload).await
    }

    async fn upload_targets(
        &self,
        job: &LockedJob,
        def: &ScanDefinition,
    ) -> Result<Vec<FileUpload>> {
        let mut uploads = Vec::with_capacity(def.extract_results.len());
        for result in &def.extract_results {
            let file_name = Path::new(&result.location)
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    ScanError::InvalidJob(format!(
                        "scan type '{}' declares result location '{}' \
                         without a file name",
                        def.name, result.location
                    ))
                })?;
            let upload_url =
                self.broker.issue_upload_url(job.id, file_name).await?;
            uploads.push(FileUpload {
                location: result.location.clone(),
                result_type: result.result_type.clone(),
                upload_url,
            });
        }
        Ok(uploads)
    }

    /// Reconciles until `shutdown` fires. Passes never overlap. After a
    /// dispatch the next pass starts immediately, otherwise it waits one
    /// poll interval.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            tenant = %self.settings.tenant,
            claimant = %self.settings.claimant,
            poll_interval = ?self.settings.poll_interval,
            "dispatcher started"
        );
        loop {
            let dispatched = match self.reconcile_once().await {
                Ok(ReconcileOutcome::Dispatched { .. }) => true,
                Ok(_) => false,
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "reconcile failed, retrying");
                    false
                }
                Err(err) => {
                    error!(error = %err, "reconcile failed");
                    false
                }
            };
            if dispatched && !shutdown.is_cancelled() {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        info!("dispatcher shutting down");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use k8s_openapi::api::batch::v1::{Job as Workload, JobTemplateSpec};
    use kennel_model::{JobState, JobSubmission, UploadedFile};
    use kube::ResourceExt;
    use serde_json::json;
    use tokio::sync::Mutex;
    use url::Url;

    use super::*;
    use crate::{
        cascade::NoRules,
        cluster::{ExtractResult, ParserDefinition},
        engine::{EngineSettings, ScanJobService},
        queue::InMemoryQueueService,
        storage::{ObjectStorageGateway, UrlMethod},
    };

    struct FakeStorage;

    #[async_trait]
    impl ObjectStorageGateway for FakeStorage {
        async fn presign(&self, _: UrlMethod, key: &str) -> Result<Url> {
            Url::parse(&format!("https://store.example/{key}"))
                .map_err(|e| ScanError::Internal(e.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        created: Mutex<Vec<Workload>>,
        fail: bool,
    }

    #[async_trait]
    impl WorkloadSink for RecordingSink {
        async fn create(&self, workload: Workload) -> Result<String> {
            if self.fail {
                return Err(ScanError::Cluster("admission webhook denied".into()));
            }
            let name = workload.name_any();
            self.created.lock().await.push(workload);
            Ok(name)
        }
    }

    fn nmap() -> JobDefinition {
        let job_template: JobTemplateSpec = serde_json::from_value(json!({
            "spec": { "template": { "spec": { "containers": [
                { "name": "nmap", "image": "kennel/scanner-nmap",
                  "command": ["nmap", "-oX", "/home/kennel/nmap-results.xml"] }
            ]}}}
        }))
        .unwrap();
        JobDefinition::Scan(ScanDefinition {
            name: "nmap".into(),
            tenant: None,
            job_template,
            extract_results: vec![ExtractResult {
                location: "/home/kennel/nmap-results.xml".into(),
                result_type: "nmap-xml".into(),
            }],
        })
    }

    fn nmap_parser() -> JobDefinition {
        JobDefinition::Parse(ParserDefinition {
            name: "nmap-xml".into(),
            tenant: None,
            image: "kennel/parser-nmap".into(),
            handles_results_type: "nmap-xml".into(),
        })
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            tenant: "default".into(),
            claimant: "cluster-a".into(),
            poll_interval: Duration::from_millis(5),
            workload: WorkloadSettings {
                namespace: "default".into(),
                lurcher_image: "kennel/lurcher".into(),
                service_account: "lurcher".into(),
                results_dir: PathBuf::from("/home/kennel"),
                engine_address: Url::parse("http://engine:3000").unwrap(),
                ttl_after_finished: Duration::from_secs(300),
            },
        }
    }

    fn engine() -> Arc<ScanJobService> {
        Arc::new(ScanJobService::new(
            Arc::new(InMemoryQueueService::new()),
            Arc::new(FakeStorage),
            Arc::new(NoRules),
            EngineSettings::default(),
        ))
    }

    #[tokio::test]
    async fn no_definitions_claims_nothing() {
        let engine = engine();
        let id = engine
            .submit(JobSubmission::new("nmap", "default", vec![]))
            .await
            .unwrap();
        let mut dispatcher = Dispatcher::new(
            engine.clone(),
            Arc::new(Vec::<JobDefinition>::new()),
            Arc::new(RecordingSink::default()),
            settings(),
        );
        assert_eq!(
            dispatcher.reconcile_once().await.unwrap(),
            ReconcileOutcome::NoDefinitions
        );
        assert_eq!(engine.get(id).await.unwrap().state, JobState::Queued);
    }

    #[tokio::test]
    async fn claimed_scan_becomes_running_workload() {
        let engine = engine();
        let id = engine
            .submit(JobSubmission::new(
                "nmap",
                "default",
                vec!["-Pn".into(), "example.com".into()],
            ))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut dispatcher = Dispatcher::new(
            engine.clone(),
            Arc::new(vec![nmap(), nmap_parser()]),
            sink.clone(),
            settings(),
        );

        let outcome = dispatcher.reconcile_once().await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Dispatched {
                job_id: id,
                workload: format!("nmap-{id}"),
            }
        );
        let job = engine.get(id).await.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.claimed_by.as_deref(), Some("cluster-a"));
        assert_eq!(job.workload, Some(format!("nmap-{id}")));

        let created = sink.created.lock().await;
        let pod = created[0]
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();
        let args = pod.containers[1].args.as_ref().unwrap();
        let file_arg = format!(
            "/home/kennel/nmap-results.xml,nmap-xml,\
             https://store.example/scan-{id}/nmap-results.xml"
        );
        assert!(args.contains(&file_arg));

        assert_eq!(
            dispatcher.reconcile_once().await.unwrap(),
            ReconcileOutcome::Idle
        );
    }

    #[tokio::test]
    async fn parse_jobs_get_parser_workloads() {
        let engine = engine();
        let id = engine
            .submit(JobSubmission::new("nmap", "default", vec![]))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut dispatcher = Dispatcher::new(
            engine.clone(),
            Arc::new(vec![nmap(), nmap_parser()]),
            sink.clone(),
            settings(),
        );
        dispatcher.reconcile_once().await.unwrap();
        engine
            .report_completion(
                id,
                vec![UploadedFile {
                    file_name: "nmap-results.xml".into(),
                    upload_size: 512,
                    result_type: Some("nmap-xml".into()),
                }],
            )
            .await
            .unwrap();

        let outcome = dispatcher.reconcile_once().await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Dispatched { .. }));
        let created = sink.created.lock().await;
        assert_eq!(created.len(), 2);
        let pod = created[1].spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("kennel/parser-nmap"));
    }

    #[tokio::test]
    async fn failed_creation_leaves_job_claimed() {
        let engine = engine();
        let id = engine
            .submit(JobSubmission::new("nmap", "default", vec![]))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let mut dispatcher =
            Dispatcher::new(engine.clone(), Arc::new(vec![nmap()]), sink, settings());

        let outcome = dispatcher.reconcile_once().await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Abandoned { job_id, .. } if job_id == id
        ));
        assert_eq!(engine.get(id).await.unwrap().state, JobState::Locked);
    }

    fn tenant_nmap(tenant: &str, image: &str) -> JobDefinition {
        let JobDefinition::Scan(mut def) = nmap() else {
            unreachable!("nmap is a scan definition");
        };
        def.tenant = Some(tenant.into());
        let pod = def
            .job_template
            .spec
            .as_mut()
            .and_then(|job| job.template.spec.as_mut())
            .unwrap();
        pod.containers[0].image = Some(image.into());
        JobDefinition::Scan(def)
    }

    #[tokio::test]
    async fn tenant_scoped_definitions_do_not_shadow_each_other() {
        let engine = engine();
        let id = engine
            .submit(JobSubmission::new("nmap", "team-b", vec![]))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut dispatcher = Dispatcher::new(
            engine.clone(),
            Arc::new(vec![
                tenant_nmap("team-a", "kennel/nmap-a"),
                tenant_nmap("team-b", "kennel/nmap-b"),
            ]),
            sink.clone(),
            DispatcherSettings {
                tenant: "team-b".into(),
                ..settings()
            },
        );

        let outcome = dispatcher.reconcile_once().await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Dispatched { job_id, .. } if job_id == id
        ));
        let created = sink.created.lock().await;
        let pod = created[0]
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("kennel/nmap-b"));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let dispatcher = Dispatcher::new(
            engine(),
            Arc::new(Vec::<JobDefinition>::new()),
            Arc::new(RecordingSink::default()),
            settings(),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher exits after cancellation")
            .unwrap();
    }
}
