use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Serialize, Serializer};

use crate::cloud::Provider;
use crate::error::TerraformError;

/// File name of the generated configuration.
pub const TERRAFORM_FILE: &str = "kubernetes.tf.json";

/// A value that Terraform interpolates, or a plain string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal(String);

impl Literal {
    pub fn string(value: impl Into<String>) -> Self {
        Literal(value.into())
    }

    /// A reference to an attribute of another resource in the same output.
    pub fn property(ty: &str, name: &str, prop: &str) -> Self {
        Literal(format!("${{{ty}.{}.{prop}}}", sanitize_name(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for Literal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Terraform resource names cannot contain dots.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[derive(Default)]
struct Output {
    resources: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    outputs: BTreeMap<String, serde_json::Value>,
    files: BTreeMap<String, Vec<u8>>,
}

/// Collects rendered resources and writes them as Terraform JSON.
pub struct TerraformTarget {
    provider: Provider,
    region: String,
    output: Mutex<Output>,
}

impl TerraformTarget {
    pub fn new(provider: Provider, region: impl Into<String>) -> Self {
        Self {
            provider,
            region: region.into(),
            output: Mutex::new(Output::default()),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    fn output(&self) -> MutexGuard<'_, Output> {
        match self.output.lock() {
            Ok(output) => output,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Adds `resource.<ty>.<name>`. Each resource may be rendered once.
    pub fn render_resource<R: Serialize>(
        &self,
        ty: &str,
        name: &str,
        resource: &R,
    ) -> Result<(), TerraformError> {
        let value = serde_json::to_value(resource)?;
        let name = sanitize_name(name);

        let mut output = self.output();
        let resources = output.resources.entry(ty.to_string()).or_default();
        if resources.contains_key(&name) {
            return Err(TerraformError::DuplicateResource(ty.to_string(), name));
        }

        tracing::debug!(ty, %name, "Rendered terraform resource");
        resources.insert(name, value);
        Ok(())
    }

    pub fn add_output(&self, name: &str, value: &Literal) -> Result<(), TerraformError> {
        let value = serde_json::json!({ "value": value });
        self.output().outputs.insert(sanitize_name(name), value);
        Ok(())
    }

    /// Stores `contents` next to the configuration and returns an expression
    /// that reads it back.
    pub fn add_file(
        &self,
        ty: &str,
        name: &str,
        key: &str,
        contents: impl Into<Vec<u8>>,
    ) -> Literal {
        let path = format!("data/{ty}_{}_{key}", sanitize_name(name));
        let literal = Literal(format!("${{file(\"${{path.module}}/{path}\")}}"));
        self.output().files.insert(path, contents.into());
        literal
    }

    /// A rendered resource, as JSON.
    pub fn resource(&self, ty: &str, name: &str) -> Option<serde_json::Value> {
        self.output()
            .resources
            .get(ty)?
            .get(&sanitize_name(name))
            .cloned()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.output().files.get(path).cloned()
    }

    pub fn to_json(&self) -> Result<String, TerraformError> {
        let output = self.output();
        let provider = self.provider.terraform_name();

        let mut document = serde_json::json!({
            "provider": { provider: { "region": self.region } },
            "resource": output.resources,
            "terraform": {
                "required_version": ">= 0.15.0",
                "required_providers": {
                    provider: { "source": provider_source(self.provider) }
                }
            }
        });

        if !output.outputs.is_empty() {
            document["output"] = serde_json::to_value(&output.outputs)?;
        }

        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Writes the configuration and its data files under `dir`.
    pub fn write(&self, dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, TerraformError> {
        std::fs::create_dir_all(dir)?;

        let mut written = Vec::new();
        let config = dir.join(TERRAFORM_FILE);
        std::fs::write(&config, self.to_json()?)?;
        written.push(config);

        for (path, contents) in &self.output().files {
            let path = dir.join(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, contents)?;
            written.push(path);
        }

        tracing::info!(%dir, files = written.len(), "Wrote terraform output");
        Ok(written)
    }
}

fn provider_source(provider: Provider) -> &'static str {
    match provider {
        Provider::Aws => "hashicorp/aws",
        Provider::Gce => "hashicorp/google",
        Provider::OpenStack => "terraform-provider-openstack/openstack",
        Provider::DigitalOcean => "digitalocean/digitalocean",
        Provider::Scaleway => "scaleway/scaleway",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Lb {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        internal: Option<bool>,
        subnet: Literal,
    }

    #[test]
    fn literal_references() {
        let literal = Literal::property("aws_subnet", "us-east-1a.cluster1", "id");
        assert_eq!(literal.as_str(), "${aws_subnet.us-east-1a-cluster1.id}");
        assert_eq!(
            serde_json::to_string(&literal).unwrap(),
            "\"${aws_subnet.us-east-1a-cluster1.id}\""
        );
    }

    #[test]
    fn renders_resources_once() {
        let target = TerraformTarget::new(Provider::Aws, "us-east-1");
        let lb = Lb {
            name: "api".into(),
            internal: None,
            subnet: Literal::property("aws_subnet", "a", "id"),
        };

        target.render_resource("aws_lb", "api.cluster1", &lb).unwrap();
        let err = target.render_resource("aws_lb", "api.cluster1", &lb).unwrap_err();
        assert!(matches!(err, TerraformError::DuplicateResource(_, _)));

        let json: serde_json::Value = serde_json::from_str(&target.to_json().unwrap()).unwrap();
        assert_eq!(json["resource"]["aws_lb"]["api-cluster1"]["name"], "api");
        assert!(json["resource"]["aws_lb"]["api-cluster1"].get("internal").is_none());
        assert_eq!(json["provider"]["aws"]["region"], "us-east-1");
    }

    #[test]
    fn side_files_are_referenced_and_written() {
        let target = TerraformTarget::new(Provider::Scaleway, "fr-par");
        let literal = target.add_file(
            "scaleway_instance_server",
            "nodes.cluster1",
            "user_data",
            "#!/bin/sh",
        );
        assert_eq!(
            literal.as_str(),
            "${file(\"${path.module}/data/scaleway_instance_server_nodes-cluster1_user_data\")}"
        );

        let dir = std::env::temp_dir().join(format!("cloudup-terraform-{}", std::process::id()));
        let dir = Utf8PathBuf::from_path_buf(dir).unwrap();
        let written = target.write(&dir).unwrap();

        assert_eq!(written.len(), 2);
        assert!(dir.join(TERRAFORM_FILE).exists());
        assert_eq!(
            std::fs::read_to_string(
                dir.join("data/scaleway_instance_server_nodes-cluster1_user_data")
            )
            .unwrap(),

            "#!/bin/sh"
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
