//! Control-plane adapters backed by the Kubernetes API.

use std::{fmt, pin::pin};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::{batch::v1::Job as Workload, core::v1::Pod};
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, PostParams},
    runtime::{WatchStreamExt, reflector, reflector::Store, watcher},
};
use kennel_model::{CascadingRule, LabelSelector};
use tracing::{debug, info, warn};

use super::{
    definitions::{DefinitionSource, JobDefinition, ParserDefinition, ScanDefinition},
    resources::{CascadingRuleResource, ParseDefinition, ScanType},
};
use crate::{
    cascade::RuleSource,
    error::{Result, ScanError},
    lurcher::ContainerStatusSource,
};

/// Creates workloads. Creating a workload that already exists counts as
/// success.
#[async_trait]
pub trait WorkloadSink: Send + Sync {
    /// Returns the workload name.
    async fn create(&self, workload: Workload) -> Result<String>;
}

/// Reflector-backed [`DefinitionSource`]. Watches `ScanType` and
/// `ParseDefinition` resources in one namespace.
#[derive(Clone)]
pub struct KubeDefinitionSource {
    scan_types: Store<ScanType>,
    parsers: Store<ParseDefinition>,
}

impl fmt::Debug for KubeDefinitionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeDefinitionSource")
            .field("scan_types", &self.scan_types.state().len())
            .field("parsers", &self.parsers.state().len())
            .finish()
    }
}

impl KubeDefinitionSource {
    /// Starts both watches and waits for their first full listing. Fails
    /// when a watch stream ends before it ever became ready.
    pub async fn start(client: Client, namespace: &str) -> Result<Self> {
        let scan_types = spawn_reflector::<ScanType>(Api::namespaced(
            client.clone(),
            namespace,
        ));
        let parsers = spawn_reflector::<ParseDefinition>(Api::namespaced(
            client, namespace,
        ));

        scan_types
            .wait_until_ready()
            .await
            .map_err(|e| {
                ScanError::Cluster(format!(
                    "ScanType watch never became ready: {e}"
                ))
            })?;
        parsers.wait_until_ready().await.map_err(|e| {
            ScanError::Cluster(format!("ParseDefinition watch never became ready: {e}"))
        })?;
        info!(
            namespace,
            scan_types = scan_types.state().len(),
            parsers = parsers.state().len(),
            "job definition watches ready"
        );
        Ok(Self {
            scan_types,
            parsers,
        })
    }
}

fn spawn_reflector<K>(api: Api<K>) -> Store<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let (reader, writer) = reflector::store();
    let kind = K::kind(&()).to_string();
    tokio::spawn(async move {
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects();
        let mut stream = pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(object) => debug!(
                    kind = %kind,
                    name = %object.name_any(),
                    "definition applied"
                ),
                Err(err) => warn!(kind = %kind, error = %err, "definition watch error"),
            }
        }
        warn!(kind = %kind, "definition watch stream ended");
    });
    reader
}

#[async_trait]
impl DefinitionSource for KubeDefinitionSource {
    async fn definitions(&self) -> Result<Vec<JobDefinition>> {
        let scans = self.scan_types.state().into_iter().map(|scan_type| {
            JobDefinition::Scan(ScanDefinition {
                name: scan_type.name_any(),
                tenant: scan_type.spec.tenant.clone(),
                job_template: scan_type.spec.job_template.clone(),
                extract_results: scan_type.spec.extract_results.clone(),
            })
        });
        let parsers = self.parsers.state().into_iter().map(|parser| {
            JobDefinition::Parse(ParserDefinition {
                name: parser.name_any(),
                tenant: parser.spec.tenant.clone(),
                image: parser.spec.image.clone(),
                handles_results_type: parser.spec.handles_results_type.clone(),
            })
        });
        Ok(scans.chain(parsers).collect())
    }
}

#[derive(Clone)]
pub struct KubeWorkloadSink {
    jobs: Api<Workload>,
}

impl fmt::Debug for KubeWorkloadSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeWorkloadSink").finish_non_exhaustive()
    }
}

impl KubeWorkloadSink {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            jobs: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl WorkloadSink for KubeWorkloadSink {
    async fn create(&self, workload: Workload) -> Result<String> {
        let name = workload.name_any();
        match self.jobs.create(&PostParams::default(), &workload).await {
            Ok(created) => Ok(created.name_any()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(workload = %name, "workload already exists");
                Ok(name)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Reads this pod's container statuses.
#[derive(Clone)]
pub struct KubePodStatusSource {
    pods: Api<Pod>,
    pod_name: String,
}

impl fmt::Debug for KubePodStatusSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubePodStatusSource")
            .field("pod_name", &self.pod_name)
            .finish()
    }
}

impl KubePodStatusSource {
    pub fn new(client: Client, namespace: &str, pod_name: impl Into<String>) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            pod_name: pod_name.into(),
        }
    }
}

#[async_trait]
impl ContainerStatusSource for KubePodStatusSource {
    async fn terminated_exit_code(&self, container: &str) -> Result<Option<i32>> {
        let pod = self.pods.get(&self.pod_name).await?;
        Ok(pod
            .status
            .and_then(|status| status.container_statuses)
            .unwrap_or_default()
            .into_iter()
            .find(|status| status.name == container)
            .and_then(|status| status.state)
            .and_then(|state| state.terminated)
            .map(|terminated| terminated.exit_code))
    }
}

/// Lists `CascadingRule` resources by label selector.
#[derive(Clone)]
pub struct KubeRuleSource {
    rules: Api<CascadingRuleResource>,
}

impl fmt::Debug for KubeRuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeRuleSource").finish_non_exhaustive()
    }
}

impl KubeRuleSource {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            rules: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl RuleSource for KubeRuleSource {
    async fn rules(&self, selector: &LabelSelector) -> Result<Vec<CascadingRule>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_selector_string());
        }
        let listed = self.rules.list(&params).await?;
        Ok(listed
            .items
            .into_iter()
            .map(|resource| CascadingRule {
                name: resource.name_any(),
                labels: resource.metadata.labels.clone().unwrap_or_default(),
                spec: resource.spec.rule,
            })
            .collect())
    }
}
