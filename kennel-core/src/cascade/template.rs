//! `{{path}}` placeholder rendering for follow-up job templates.

use std::sync::LazyLock;

use kennel_model::{Finding, wire::ScanView};
use regex::{Captures, Regex};
use serde_json::{Map, Value, json};

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\{?\s*([^{}\s]+)\s*\}?\}\}")
        .expect("placeholder regex should compile")
});

/// Replaces every `{{dotted.path}}` in `template` with the value found at
/// that path in `context`. Missing values render as an empty string,
/// strings render verbatim and anything else renders as JSON. No HTML
/// escaping is applied. `{{{path}}}` is accepted as an alias.
pub fn render(template: &str, context: &Value) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &Captures<'_>| {
            lookup(context, &caps[1]).map(display).unwrap_or_default()
        })
        .into_owned()
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    if path == "." {
        return Some(context);
    }
    path.split('.').try_fold(context, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Template context for one triggering finding: the finding's fields, the
/// parent job's `metadata`/`spec`/`status`, and helper values under `$`.
/// Parent keys shadow finding keys of the same name.
pub fn template_context(finding: &Finding, parent: &ScanView) -> Value {
    let mut context = match serde_json::to_value(finding) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if let Ok(Value::Object(parent)) = serde_json::to_value(parent) {
        context.extend(parent);
    }
    context.insert(
        "$".to_string(),
        json!({ "hostOrIP": finding.host_or_ip() }),
    );
    Value::Object(context)
}
