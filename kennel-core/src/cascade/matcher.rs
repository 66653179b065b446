//! Partial structural matching of findings against rule predicates.

use regex::Regex;
use serde_json::Value;

/// Whether `finding` satisfies `predicate`.
///
/// Objects match when every key of the predicate is present in the finding
/// and its value matches recursively; keys the predicate does not mention
/// are ignored. Arrays match when every predicate element matches some
/// element of the finding's array. String predicates compare exactly or as
/// a case-sensitive wildcard pattern (see [`wildcard_matches`]). Numbers
/// compare by value, so `443` and `443.0` are equal.
pub fn matches_predicate(finding: &Value, predicate: &Value) -> bool {
    match (finding, predicate) {
        (Value::Object(found), Value::Object(wanted)) => wanted
            .iter()
            .all(|(key, want)| {
                found
                    .get(key)
                    .is_some_and(|have| matches_predicate(have, want))
            }),
        (Value::Array(found), Value::Array(wanted)) => wanted
            .iter()
            .all(|want| found.iter().any(|have| matches_predicate(have, want))),
        (Value::String(have), Value::String(want)) => {
            have == want || wildcard_matches(have, want)
        }
        (Value::Number(have), Value::Number(want)) => {
            have == want || have.as_f64() == want.as_f64()
        }
        (have, want) => have == want,
    }
}

/// Anchored wildcard comparison. `*` matches any run of characters and
/// every other character is literal. A leading `!` negates the pattern.
pub fn wildcard_matches(value: &str, pattern: &str) -> bool {
    let (negated, pattern) = match pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let source = format!(
        "^{}$",
        pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*")
    );
    match Regex::new(&source) {
        Ok(re) => re.is_match(value) != negated,
        Err(_) => false,
    }
}
