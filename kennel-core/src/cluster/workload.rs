//! Builds cluster workloads for claimed jobs.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use k8s_openapi::{
    api::{
        batch::v1::{Job as Workload, JobSpec},
        core::v1::{
            Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
            ObjectFieldSelector, PodSpec, PodTemplateSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kennel_config::DispatcherConfig;
use kennel_model::{EnvVar as JobEnvVar, resource_name, wire::LockedJob};
use url::Url;

use super::definitions::{ParserDefinition, ScanDefinition};
use crate::error::{Result, ScanError};

pub const RESULTS_VOLUME: &str = "scan-results";
pub const LURCHER_CONTAINER: &str = "lurcher";
pub const PARSER_CONTAINER: &str = "parser";

pub const LABEL_JOB_ID: &str = "kennel.io/job-id";
pub const LABEL_KIND: &str = "kennel.io/kind";
pub const LABEL_JOB_TYPE: &str = "kennel.io/job-type";

const SCAN_KIND: &str = "scan-job";
const PARSE_KIND: &str = "parse-job";
const PARSER_BACKOFF_LIMIT: i32 = 3;

/// Workload settings shared by every job a dispatcher launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSettings {
    pub namespace: String,
    pub lurcher_image: String,
    pub service_account: String,
    pub results_dir: PathBuf,
    pub engine_address: Url,
    pub ttl_after_finished: Duration,
}

impl WorkloadSettings {
    pub fn from_config(cfg: &DispatcherConfig) -> Self {
        Self {
            namespace: cfg.namespace.clone(),
            lurcher_image: cfg.lurcher_image.clone(),
            service_account: cfg.service_account.clone(),
            results_dir: cfg.results_dir.clone(),
            engine_address: cfg.engine_address.clone(),
            ttl_after_finished: cfg.ttl_after_finished,
        }
    }

    fn ttl_seconds(&self) -> i32 {
        i32::try_from(self.ttl_after_finished.as_secs()).unwrap_or(i32::MAX)
    }
}

/// One declared result file and the URL the sidecar uploads it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub location: String,
    pub result_type: String,
    pub upload_url: Url,
}

impl FileUpload {
    /// `<location>,<resultType>,<url>`, the sidecar's `--file` value.
    pub fn to_arg(&self) -> String {
        format!("{},{},{}", self.location, self.result_type, self.upload_url)
    }
}

/// Label values allow `[A-Za-z0-9._-]`, at most 63 characters, and must
/// start and end alphanumeric.
pub fn label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '.'
            }
        })
        .take(63)
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn workload_labels(job: &LockedJob, kind: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_JOB_ID.to_string(), job.id.to_string()),
        (LABEL_KIND.to_string(), kind.to_string()),
        (LABEL_JOB_TYPE.to_string(), label_value(&job.job_type)),
    ])
}

fn merge_labels(meta: &mut ObjectMeta, labels: &BTreeMap<String, String>) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

/// Job variables replace template variables of the same name.
fn apply_job_env(container: &mut Container, env: &[JobEnvVar]) {
    if env.is_empty() {
        return;
    }
    let vars = container.env.get_or_insert_with(Vec::new);
    for var in env {
        vars.retain(|existing| existing.name != var.name);
        vars.push(EnvVar {
            name: var.name.clone(),
            value: Some(var.value.clone()),
            ..EnvVar::default()
        });
    }
}

fn results_mount(settings: &WorkloadSettings, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: RESULTS_VOLUME.to_string(),
        mount_path: settings.results_dir.display().to_string(),
        read_only: read_only.then_some(true),
        ..VolumeMount::default()
    }
}

fn lurcher_container(
    job: &LockedJob,
    primary: &str,
    uploads: &[FileUpload],
    settings: &WorkloadSettings,
) -> Container {
    let mut args = vec![
        "--scan-id".to_string(),
        job.id.to_string(),
        "--main-container-name".to_string(),
        primary.to_string(),
        "--engine-address".to_string(),
        settings.engine_address.to_string(),
        "--results-dir".to_string(),
        settings.results_dir.display().to_string(),
    ];
    for upload in uploads {
        args.push("--file".to_string());
        args.push(upload.to_arg());
    }
    Container {
        name: LURCHER_CONTAINER.to_string(),
        image: Some(settings.lurcher_image.clone()),
        args: Some(args),
        env: Some(vec![
            field_env("NAMESPACE", "metadata.namespace"),
            field_env("POD_NAME", "metadata.name"),
        ]),
        volume_mounts: Some(vec![results_mount(settings, true)]),
        ..Container::default()
    }
}

/// Scanner workload: the definition's job template with the job's
/// parameters appended to the primary container's command and the job's
/// environment set on it, a shared results volume, and the lurcher sidecar.
///
/// The primary container is the template's first container. Other
/// template containers are kept as they are.
pub fn build_scan_workload(
    job: &LockedJob,
    definition: &ScanDefinition,
    uploads: &[FileUpload],
    settings: &WorkloadSettings,
) -> Result<Workload> {
    let template = &definition.job_template;
    let mut spec: JobSpec = template.spec.clone().ok_or_else(|| {
        ScanError::InvalidJob(format!(
            "scan type '{}' has no job spec in its template",
            definition.name
        ))
    })?;
    let labels = workload_labels(job, SCAN_KIND);

    let pod_meta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    merge_labels(pod_meta, &labels);

    let pod: &mut PodSpec = spec.template.spec.as_mut().ok_or_else(|| {
        ScanError::InvalidJob(format!(
            "scan type '{}' has no pod spec in its template",
            definition.name
        ))
    })?;
    let primary = pod.containers.first_mut().ok_or_else(|| {
        ScanError::InvalidJob(format!(
            "scan type '{}' declares no containers",
            definition.name
        ))
    })?;

    match primary.command.as_mut() {
        Some(command) => command.extend(job.parameters.iter().cloned()),
        None => primary
            .args
            .get_or_insert_with(Vec::new)
            .extend(job.parameters.iter().cloned()),
    }
    apply_job_env(primary, &job.env);
    primary
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(results_mount(settings, false));
    let primary_name = primary.name.clone();

    pod.containers
        .push(lurcher_container(job, &primary_name, uploads, settings));
    pod.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: RESULTS_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    });
    pod.service_account_name = Some(settings.service_account.clone());
    if pod.restart_policy.is_none() {
        pod.restart_policy = Some("Never".to_string());
    }
    if spec.ttl_seconds_after_finished.is_none() {
        spec.ttl_seconds_after_finished = Some(settings.ttl_seconds());
    }

    let mut metadata = template.metadata.clone().unwrap_or_default();
    metadata.name = Some(resource_name(&job.job_type, &job.id));
    metadata.namespace = Some(settings.namespace.clone());
    metadata.generate_name = None;
    merge_labels(&mut metadata, &labels);

    Ok(Workload {
        metadata,
        spec: Some(spec),
        ..Workload::default()
    })
}

/// Parser workload: one container running the parser image with the job's
/// parameters, which are the result download URL and the scan id.
pub fn build_parse_workload(
    job: &LockedJob,
    definition: &ParserDefinition,
    settings: &WorkloadSettings,
) -> Workload {
    let labels = workload_labels(job, PARSE_KIND);
    let container = Container {
        name: PARSER_CONTAINER.to_string(),
        image: Some(definition.image.clone()),
        args: Some(job.parameters.clone()),
        env: Some(vec![
            EnvVar {
                name: "ENGINE_ADDRESS".to_string(),
                value: Some(settings.engine_address.to_string()),
                ..EnvVar::default()
            },
            field_env("NAMESPACE", "metadata.namespace"),
        ]),
        ..Container::default()
    };

    Workload {
        metadata: ObjectMeta {
            name: Some(resource_name(&job.job_type, &job.id)),
            namespace: Some(settings.namespace.clone()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(PARSER_BACKOFF_LIMIT),
            ttl_seconds_after_finished: Some(settings.ttl_seconds()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Workload::default()
    }
}
