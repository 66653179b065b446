//! Cascading rule engine: turns a finished job's findings into follow-up
//! job submissions.
//!
//! A rule already recorded in the parent's [`CascadeChain`] is skipped for
//! the whole parent, which is the only guard against rescan loops. Two
//! distinct rules that keep triggering each other are not detected.

mod matcher;
mod sources;
mod template;

pub use matcher::{matches_predicate, wildcard_matches};
pub use sources::{NoRules, RuleSource, StaticRules};
pub use template::{render, template_context};

use std::collections::BTreeMap;

use kennel_model::{
    CHAIN_ANNOTATION, CascadeChain, CascadingRule, EnvVar, Finding, Job,
    JobMetadata, JobSubmission, OwnerReference, wire::ScanView,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Name of the job that produced a cascaded job.
pub const PARENT_SCAN_ANNOTATION: &str = "cascading.kennel.io/parent-scan";
/// Id of the finding that triggered a cascaded job.
pub const MATCHED_FINDING_ANNOTATION: &str =
    "cascading.kennel.io/matched-finding";
pub const HOOK_ANNOTATION: &str = "kennel.io/hook";
pub const HOOK_NAME: &str = "cascading-scans";

/// Whether any of the rule's predicates matches the finding.
pub fn rule_matches(rule: &CascadingRule, finding: &Value) -> bool {
    rule.spec
        .matches
        .any_of
        .iter()
        .any(|predicate| matches_predicate(finding, predicate))
}

/// Plans one follow-up submission per matching (rule, finding) pair.
///
/// Rules whose name is already in `parent`'s chain produce nothing. Every
/// submission carries the parent's chain extended by the rule's name, an
/// owner reference to the parent and the parent's cascade selector. Its
/// environment is the rule's `env`, after the parent's own when the parent
/// asks for it to be inherited.
pub fn plan_cascades(
    parent: &Job,
    findings: &[Finding],
    rules: &[CascadingRule],
) -> Vec<JobSubmission> {
    let chain = parent.chain();
    let view = ScanView::from(parent);
    let parent_env = inheritable_env(parent, rules);
    let finding_values: Vec<Value> = findings
        .iter()
        .map(|f| serde_json::to_value(f).unwrap_or(Value::Null))
        .collect();

    let mut planned = Vec::new();
    for rule in rules {
        if rule.name.is_empty() {
            warn!(parent = %parent.id, "ignoring cascading rule without a name");
            continue;
        }
        let Ok(next_chain) = chain.extended(rule.name.as_str()) else {
            debug!(
                parent = %parent.id,
                rule = %rule.name,
                chain = %chain,
                "rule already applied in this chain, skipping"
            );
            continue;
        };

        for (finding, value) in findings.iter().zip(&finding_values) {
            if !rule_matches(rule, value) {
                continue;
            }
            planned.push(cascaded_submission(
                parent,
                &view,
                finding,
                rule,
                &next_chain,
                &parent_env,
            ));
        }
    }

    debug!(
        parent = %parent.id,
        findings = findings.len(),
        rules = rules.len(),
        planned = planned.len(),
        "evaluated cascading rules"
    );
    planned
}

fn cascaded_submission(
    parent: &Job,
    view: &ScanView,
    finding: &Finding,
    rule: &CascadingRule,
    chain: &CascadeChain,
    parent_env: &[EnvVar],
) -> JobSubmission {
    let context = template_context(finding, view);
    let scan_type = render(&rule.spec.scan_spec.scan_type, &context);
    let parameters = rule
        .spec
        .scan_spec
        .parameters
        .iter()
        .map(|p| render(p, &context))
        .collect();
    let rendered = |map: &BTreeMap<String, String>| {
        map.iter()
            .map(|(k, v)| (k.clone(), render(v, &context)))
            .collect::<BTreeMap<String, String>>()
    };

    let cascades = parent.cascades.clone().unwrap_or_default();
    let labels = merge_inherited(
        &parent.metadata.labels,
        rendered(&rule.spec.scan_labels),
        cascades.inherit_labels,
    );
    let mut annotations = merge_inherited(
        &parent.metadata.annotations,
        rendered(&rule.spec.scan_annotations),
        cascades.inherit_annotations,
    );
    annotations.insert(HOOK_ANNOTATION.to_string(), HOOK_NAME.to_string());
    annotations
        .insert(PARENT_SCAN_ANNOTATION.to_string(), parent.name().to_string());
    annotations
        .insert(MATCHED_FINDING_ANNOTATION.to_string(), finding.id.clone());
    annotations.insert(CHAIN_ANNOTATION.to_string(), chain.to_annotation());

    let prefix = cascaded_name(parent, &scan_type, &rule.name);
    JobSubmission::new(scan_type, parent.tenant.clone(), parameters)
        .with_metadata(JobMetadata {
            name: String::new(),
            generate_name: Some(format!("{prefix}-")),
            labels,
            annotations,
            owner: Some(OwnerReference::scan(parent)),
        })
        .with_cascades(parent.cascades.clone())
        .with_env(
            parent_env
                .iter()
                .chain(&rule.spec.scan_spec.env)
                .cloned()
                .collect(),
        )
}

/// The parent's environment as passed on to its follow-ups. Variables the
/// rule that produced the parent added apply to the parent only.
fn inheritable_env(parent: &Job, rules: &[CascadingRule]) -> Vec<EnvVar> {
    if !parent.cascades.as_ref().is_some_and(|c| c.inherit_env) {
        return Vec::new();
    }
    let chain = parent.chain();
    let parent_rule = chain
        .rules()
        .last()
        .and_then(|name| rules.iter().find(|rule| &rule.name == name));
    parent
        .env
        .iter()
        .filter(|var| {
            parent_rule
                .is_none_or(|rule| !rule.spec.scan_spec.env.contains(*var))
        })
        .cloned()
        .collect()
}

/// `<parent name with its leading type swapped for scan_type>-<rule>`.
pub fn cascaded_name(
    parent: &Job,
    scan_type: &str,
    rule_name: &str,
) -> String {
    let name = parent.name();
    let prefix = match name.strip_prefix(parent.job_type.as_str()) {
        Some(rest) if !parent.job_type.is_empty() => {
            format!("{scan_type}{rest}")
        }
        _ => name.to_string(),
    };
    format!("{prefix}-{rule_name}")
}

/// Parent entries overlaid with the rule's entries, or only the rule's
/// entries when inheritance is off.
fn merge_inherited(
    parent: &BTreeMap<String, String>,
    rule: BTreeMap<String, String>,
    inherit: bool,
) -> BTreeMap<String, String> {
    if !inherit {
        return rule;
    }
    let mut merged = parent.clone();
    merged.extend(rule);
    merged
}
