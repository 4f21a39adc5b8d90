use driftwatch_types::Resource;
use serde::Deserialize;
use std::collections::HashMap;

/// On-disk IaC state document.
///
/// The consumed shape is the Terraform state container: a version header,
/// a serial, and resources each carrying one or more instances.
#[derive(Debug, Clone, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub terraform_version: String,
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub resources: Vec<StateResource>,
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub instances: Vec<StateInstance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateInstance {
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl StateFile {
    /// Flatten the document into resources.
    ///
    /// Every `(type, name, instance_index)` triple yields one resource with
    /// the synthesized id `"{type}.{name}[{index}]"`, `configuration` taken
    /// from the instance attributes, and metadata decorated with the source
    /// file and state version.
    pub fn into_resources(self, state_file: &str) -> Vec<Resource> {
        let state_version = self.version.to_string();
        let terraform_version = self.terraform_version;
        let serial = self.serial;

        let mut resources = Vec::new();
        for state_resource in self.resources {
            let provider = normalize_provider(&state_resource.provider);
            for (index, instance) in state_resource.instances.into_iter().enumerate() {
                let id = format!(
                    "{}.{}[{}]",
                    state_resource.resource_type, state_resource.name, index
                );
                let mut resource = Resource::new(
                    id,
                    state_resource.resource_type.clone(),
                    state_resource.name.clone(),
                    provider.clone(),
                );
                resource.configuration = instance.attributes;
                resource.metadata.state_file = Some(state_file.to_string());
                resource.metadata.state_version = Some(state_version.clone());
                if !terraform_version.is_empty() {
                    resource.metadata.extras.insert(
                        "terraform_version".to_string(),
                        serde_json::Value::String(terraform_version.clone()),
                    );
                }
                resource
                    .metadata
                    .extras
                    .insert("serial".to_string(), serde_json::json!(serial));
                resources.push(resource);
            }
        }
        resources
    }
}

/// Reduce a Terraform provider reference to its short name.
///
/// `provider["registry.terraform.io/hashicorp/aws"]` becomes `aws`;
/// anything without that shape passes through unchanged.
fn normalize_provider(raw: &str) -> String {
    let inner = raw
        .strip_prefix("provider[\"")
        .and_then(|rest| rest.strip_suffix("\"]"))
        .unwrap_or(raw);
    inner
        .rsplit('/')
        .next()
        .unwrap_or(inner)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STATE: &str = r#"{
        "version": 4,
        "terraform_version": "1.5.7",
        "serial": 42,
        "resources": [
            {
                "type": "aws_instance",
                "name": "web",
                "provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
                "instances": [
                    {"attributes": {"instance_type": "t3.micro", "ami": "ami-1"}},
                    {"attributes": {"instance_type": "t3.large", "ami": "ami-1"}}
                ]
            }
        ],
        "outputs": {}
    }"#;

    #[test]
    fn test_instances_expand_with_indexed_ids() {
        let state: StateFile = serde_json::from_str(STATE).unwrap();
        let resources = state.into_resources("prod.tfstate");

        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].id, "aws_instance.web[0]");
        assert_eq!(resources[1].id, "aws_instance.web[1]");
        assert_eq!(resources[0].provider, "aws");
        assert_eq!(resources[0].configuration["instance_type"], json!("t3.micro"));
        assert_eq!(
            resources[0].metadata.state_file.as_deref(),
            Some("prod.tfstate")
        );
        assert_eq!(resources[0].metadata.state_version.as_deref(), Some("4"));
    }

    #[test]
    fn test_provider_normalization() {
        assert_eq!(
            normalize_provider("provider[\"registry.terraform.io/hashicorp/google\"]"),
            "google"
        );
        assert_eq!(normalize_provider("aws"), "aws");
        assert_eq!(normalize_provider(""), "");
    }

    #[test]
    fn test_missing_sections_default() {
        let state: StateFile = serde_json::from_str(r#"{"version": 4}"#).unwrap();
        assert!(state.resources.is_empty());
        assert!(state.into_resources("x.tfstate").is_empty());
    }
}
