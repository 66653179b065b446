//! Custom resources watched by the dispatcher and the rule source.

use k8s_openapi::api::batch::v1::JobTemplateSpec;
use kennel_model::CascadingRuleSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "kennel.io";

/// A result file a scanner leaves in the shared results directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractResult {
    /// Absolute path inside the scanner container.
    pub location: String,
    /// Result type, e.g. `nmap-xml`. Selects the parser.
    #[serde(rename = "type")]
    pub result_type: String,
}

/// Deployable scanner. The resource name is the job type.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "kennel.io", version = "v1", kind = "ScanType", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ScanTypeSpec {
    pub job_template: JobTemplateSpec,
    #[serde(default)]
    pub extract_results: Vec<ExtractResult>,
    /// Only serve this tenant. Unset serves every tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Parser for one result type. Served under `parse:<handlesResultsType>`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "kennel.io", version = "v1", kind = "ParseDefinition", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ParseDefinitionSpec {
    pub image: String,
    pub handles_results_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kennel.io",
    version = "v1",
    kind = "CascadingRule",
    root = "CascadingRuleResource",
    namespaced
)]
pub struct CascadingRuleResourceSpec {
    #[serde(flatten)]
    pub rule: CascadingRuleSpec,
}
