//! Locally cached view of which job types can be deployed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::JobTemplateSpec;
use kennel_model::parse_job_type;
use tracing::{debug, warn};

use super::resources::ExtractResult;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct ScanDefinition {
    pub name: String,
    pub tenant: Option<String>,
    pub job_template: JobTemplateSpec,
    pub extract_results: Vec<ExtractResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserDefinition {
    pub name: String,
    pub tenant: Option<String>,
    pub image: String,
    pub handles_results_type: String,
}

/// How to run one job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDefinition {
    Scan(ScanDefinition),
    Parse(ParserDefinition),
}

impl JobDefinition {
    /// Queue name served by this definition. Parsers serve
    /// `parse:<resultType>`.
    pub fn job_type(&self) -> String {
        match self {
            JobDefinition::Scan(def) => def.name.clone(),
            JobDefinition::Parse(def) => parse_job_type(&def.handles_results_type),
        }
    }

    pub fn tenant(&self) -> Option<&str> {
        match self {
            JobDefinition::Scan(def) => def.tenant.as_deref(),
            JobDefinition::Parse(def) => def.tenant.as_deref(),
        }
    }

    /// Definitions without a tenant serve every tenant.
    pub fn serves(&self, tenant: &str) -> bool {
        self.tenant().is_none_or(|t| t == tenant)
    }
}

/// Where definitions come from. Implementations return a snapshot and may
/// lag behind the cluster.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn definitions(&self) -> Result<Vec<JobDefinition>>;
}

#[async_trait]
impl DefinitionSource for Vec<JobDefinition> {
    async fn definitions(&self) -> Result<Vec<JobDefinition>> {
        Ok(self.clone())
    }
}

/// Definitions keyed by job type and tenant scope, refreshed at the start
/// of every reconcile pass.
#[derive(Debug, Default, Clone)]
pub struct DefinitionCache {
    entries: BTreeMap<(String, Option<String>), JobDefinition>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in a fresh snapshot. When two definitions claim the same job
    /// type for the same tenant scope the first one wins.
    pub fn replace(&mut self, definitions: Vec<JobDefinition>) {
        let mut entries = BTreeMap::new();
        for def in definitions {
            let key = (def.job_type(), def.tenant().map(str::to_string));
            if entries.contains_key(&key) {
                warn!(
                    job_type = %key.0,
                    tenant = ?key.1,
                    "duplicate job definition ignored"
                );
                continue;
            }
            entries.insert(key, def);
        }
        self.entries = entries;
    }

    pub async fn refresh(
        &mut self,
        source: &dyn DefinitionSource,
    ) -> Result<usize> {
        let definitions = source.definitions().await?;
        self.replace(definitions);
        debug!(definitions = self.entries.len(), "refreshed job definitions");
        Ok(self.entries.len())
    }

    /// Claimable types for `tenant`: scanner types first, then parser
    /// pseudo-types, each group in name order.
    pub fn candidate_types(&self, tenant: &str) -> Vec<String> {
        let mut scans = Vec::new();
        let mut parsers = Vec::new();
        let mut previous: Option<&str> = None;
        for (job_type, _) in self.entries.keys() {
            if previous == Some(job_type.as_str()) {
                continue;
            }
            previous = Some(job_type);
            match self.get(tenant, job_type) {
                Some(JobDefinition::Scan(_)) => scans.push(job_type.clone()),
                Some(JobDefinition::Parse(_)) => parsers.push(job_type.clone()),
                None => {}
            }
        }
        scans.extend(parsers);
        scans
    }

    /// Definition of `job_type` as seen by `tenant`. A definition scoped to
    /// the tenant shadows one without a tenant.
    pub fn get(&self, tenant: &str, job_type: &str) -> Option<&JobDefinition> {
        self.entries
            .get(&(job_type.to_string(), Some(tenant.to_string())))
            .or_else(|| self.entries.get(&(job_type.to_string(), None)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(name: &str, tenant: Option<&str>) -> JobDefinition {
        JobDefinition::Scan(ScanDefinition {
            name: name.to_string(),
            tenant: tenant.map(str::to_string),
            job_template: JobTemplateSpec::default(),
            extract_results: Vec::new(),
        })
    }

    fn parser(result_type: &str) -> JobDefinition {
        JobDefinition::Parse(ParserDefinition {
            name: format!("{result_type}-parser"),
            tenant: None,
            image: "kennel/parser".into(),
            handles_results_type: result_type.into(),
        })
    }

    #[tokio::test]
    async fn candidates_list_scanners_then_parsers() {
        let source = vec![
            parser("nmap-xml"),
            scan("zap", None),
            scan("nmap", None),
            scan("internal-only", Some("team-a")),
        ];
        let mut cache = DefinitionCache::new();
        assert_eq!(cache.refresh(&source).await.unwrap(), 4);
        assert_eq!(
            cache.candidate_types("default"),
            vec!["nmap", "zap", "parse:nmap-xml"]
        );
        assert_eq!(
            cache.candidate_types("team-a"),
            vec!["internal-only", "nmap", "zap", "parse:nmap-xml"]
        );
        assert!(matches!(
            cache.get("default", "parse:nmap-xml"),
            Some(JobDefinition::Parse(_))
        ));
    }

    #[tokio::test]
    async fn refresh_replaces_previous_snapshot() {
        let mut cache = DefinitionCache::new();
        cache.refresh(&vec![scan("nmap", None)]).await.unwrap();
        cache.refresh(&vec![scan("zap", None)]).await.unwrap();
        assert!(cache.get("default", "nmap").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn first_duplicate_wins_within_a_tenant() {
        let mut cache = DefinitionCache::new();
        let mut second = scan("nmap", Some("a"));
        if let JobDefinition::Scan(def) = &mut second {
            def.extract_results.push(ExtractResult {
                location: "/home/kennel/second.xml".into(),
                result_type: "nmap-xml".into(),
            });
        }
        cache.replace(vec![scan("nmap", Some("a")), second]);
        assert_eq!(cache.len(), 1);
        let Some(JobDefinition::Scan(def)) = cache.get("a", "nmap") else {
            panic!("nmap should be deployable for tenant a");
        };
        assert!(def.extract_results.is_empty());
    }

    #[test]
    fn tenants_with_the_same_job_type_each_see_their_own() {
        for order in [["team-a", "team-b"], ["team-b", "team-a"]] {
            let mut cache = DefinitionCache::new();
            cache.replace(
                order.iter().map(|t| scan("nmap", Some(t))).collect(),
            );
            for tenant in ["team-a", "team-b"] {
                assert_eq!(cache.candidate_types(tenant), vec!["nmap"]);
                assert_eq!(
                    cache.get(tenant, "nmap").and_then(JobDefinition::tenant),
                    Some(tenant)
                );
            }
            assert!(cache.candidate_types("team-c").is_empty());
        }
    }

    #[test]
    fn tenant_definition_shadows_shared_one() {
        let mut cache = DefinitionCache::new();
        cache.replace(vec![scan("nmap", None), scan("nmap", Some("team-a"))]);
        assert_eq!(cache.candidate_types("team-a"), vec!["nmap"]);
        assert_eq!(
            cache.get("team-a", "nmap").and_then(JobDefinition::tenant),
            Some("team-a")
        );
        assert_eq!(
            cache.get("team-b", "nmap").and_then(JobDefinition::tenant),
            None
        );
        assert!(cache.get("team-b", "nmap").is_some());
    }
}
