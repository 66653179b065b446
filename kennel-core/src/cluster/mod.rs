//! Cluster control plane: job definitions, workload construction and the
//! Kubernetes adapters.

mod definitions;
mod kubernetes;
mod resources;
mod workload;

pub use definitions::{
    DefinitionCache, DefinitionSource, JobDefinition, ParserDefinition,
    ScanDefinition,
};
pub use kubernetes::{
    KubeDefinitionSource, KubePodStatusSource, KubeRuleSource,
    KubeWorkloadSink, WorkloadSink,
};
pub use resources::{
    CascadingRuleResource, CascadingRuleResourceSpec, ExtractResult, GROUP,
    ParseDefinition, ParseDefinitionSpec, ScanType, ScanTypeSpec,
};
pub use workload::{
    FileUpload, LABEL_JOB_ID, LABEL_JOB_TYPE, LABEL_KIND, LURCHER_CONTAINER,
    PARSER_CONTAINER, RESULTS_VOLUME, WorkloadSettings, build_parse_workload,
    build_scan_workload, label_value,
};
