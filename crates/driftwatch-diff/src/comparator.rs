use driftwatch_types::{Change, Resource, Severity};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Domain comparator: structural equality rules over two versions of the
/// same resource, producing the field-level changes.
pub type Comparator = Arc<dyn Fn(&Resource, &Resource) -> Vec<Change> + Send + Sync>;

/// Configuration keys whose edits are treated as high severity.
const SENSITIVE_KEY_HINTS: &[&str] = &[
    "security", "policy", "role", "iam", "public", "ingress", "egress", "acl", "secret",
];

/// Default comparator: walks `configuration` and `tags` key sets and emits
/// one change per differing entry.
pub fn structural_comparator() -> Comparator {
    Arc::new(compare_structural)
}

fn compare_structural(baseline: &Resource, current: &Resource) -> Vec<Change> {
    let mut changes = Vec::new();

    let config_keys: BTreeSet<&String> = baseline
        .configuration
        .keys()
        .chain(current.configuration.keys())
        .collect();
    for key in config_keys {
        let old = baseline.configuration.get(key.as_str());
        let new = current.configuration.get(key.as_str());
        match (old, new) {
            (Some(old), Some(new)) if old != new => changes.push(Change {
                field: "configuration".to_string(),
                path: format!("configuration.{key}"),
                old_value: Some(old.clone()),
                new_value: Some(new.clone()),
                severity: config_key_severity(key),
                description: format!("configuration value changed: {key}"),
            }),
            (Some(old), None) => changes.push(Change {
                field: "configuration".to_string(),
                path: format!("configuration.{key}"),
                old_value: Some(old.clone()),
                new_value: None,
                severity: config_key_severity(key),
                description: format!("configuration key removed: {key}"),
            }),
            (None, Some(new)) => changes.push(Change {
                field: "configuration".to_string(),
                path: format!("configuration.{key}"),
                old_value: None,
                new_value: Some(new.clone()),
                severity: config_key_severity(key),
                description: format!("configuration key added: {key}"),
            }),
            _ => {}
        }
    }

    let tag_keys: BTreeSet<&String> = baseline.tags.keys().chain(current.tags.keys()).collect();
    for key in tag_keys {
        let old = baseline.tags.get(key.as_str());
        let new = current.tags.get(key.as_str());
        if old != new {
            changes.push(Change {
                field: "tags".to_string(),
                path: format!("tags.{key}"),
                old_value: old.map(|v| serde_json::Value::String(v.clone())),
                new_value: new.map(|v| serde_json::Value::String(v.clone())),
                severity: Severity::Low,
                description: format!("tag changed: {key}"),
            });
        }
    }

    changes
}

fn config_key_severity(key: &str) -> Severity {
    let lowered = key.to_ascii_lowercase();
    if SENSITIVE_KEY_HINTS
        .iter()
        .any(|hint| lowered.contains(hint))
    {
        Severity::High
    } else {
        Severity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(id: &str) -> Resource {
        Resource::new(id, "deployment", id, "kubernetes")
    }

    #[test]
    fn test_identical_resources_produce_no_changes() {
        let a = resource("frontend").with_config("replicas", json!(3));
        let compare = structural_comparator();
        assert!(compare(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_value_edit_is_medium() {
        let baseline = resource("frontend")
            .with_config("replicas", json!(3))
            .with_config("image", json!("frontend:v2.1.0"));
        let current = resource("frontend")
            .with_config("replicas", json!(7))
            .with_config("image", json!("frontend:v2.1.0"));

        let changes = structural_comparator()(&baseline, &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "configuration.replicas");
        assert_eq!(changes[0].severity, Severity::Medium);
        assert_eq!(changes[0].old_value, Some(json!(3)));
        assert_eq!(changes[0].new_value, Some(json!(7)));
    }

    #[test]
    fn test_sensitive_keys_are_high() {
        let baseline = resource("sg").with_config("security_groups", json!(["sg-1"]));
        let current = resource("sg").with_config("security_groups", json!(["sg-1", "sg-2"]));

        let changes = structural_comparator()(&baseline, &current);
        assert_eq!(changes[0].severity, Severity::High);
    }

    #[test]
    fn test_added_and_removed_keys_are_reported() {
        let baseline = resource("r").with_config("old_key", json!("x"));
        let current = resource("r").with_config("new_key", json!("y"));

        let changes = structural_comparator()(&baseline, &current);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| c.description.contains("removed")));
        assert!(changes.iter().any(|c| c.description.contains("added")));
    }

    #[test]
    fn test_tag_changes_are_low() {
        let baseline = resource("r").with_tag("env", "staging");
        let current = resource("r").with_tag("env", "prod");

        let changes = structural_comparator()(&baseline, &current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "tags");
        assert_eq!(changes[0].severity, Severity::Low);
    }
}
