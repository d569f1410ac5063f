use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cloud::{self, Filter, Provider, Resource, ResourceKind, ResourceSpec};
use crate::core::{Context, Field, Lifecycle};
use crate::error::TaskError;
use crate::link::{Link, Resolved, TaskKey};
use crate::target::{ApiTarget, Literal, TerraformTarget};
use crate::task::{Changes, Delta, Deletion, Differ, TypedTask};
use crate::tasks::network::Network;
use crate::tasks::{DeleteResource, resolved, terraform_type};

const PROTOCOLS: &[&str] = &["tcp", "udp", "icmp", "esp", "ah", "sctp", "ipip", "all"];

/// A rule admitting traffic into instances of a network.
///
/// `allowed` entries are either a bare protocol (`"udp"`) or a protocol with
/// a port or port range (`"tcp:443"`, `"tcp:30000-32767"`).
#[derive(Debug, Clone, PartialEq)]
pub struct FirewallRule {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub network: Field<Link<Network>>,
    pub source_ranges: Vec<String>,
    pub source_tags: Vec<String>,
    pub target_tags: Vec<String>,
    pub allowed: Vec<String>,
    pub priority: Field<u32>,
    pub id: Resolved<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FirewallAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network_id: Option<String>,
    #[serde(default)]
    source_ranges: Vec<String>,
    #[serde(default)]
    source_tags: Vec<String>,
    #[serde(default)]
    target_tags: Vec<String>,
    #[serde(default)]
    allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
}

fn parse_allowed(rule: &str) -> Result<(&str, Option<&str>), TaskError> {
    let (protocol, ports) = match rule.split_once(':') {
        Some((protocol, ports)) => (protocol, Some(ports)),
        None => (rule, None),
    };

    if !PROTOCOLS.contains(&protocol) {
        return Err(TaskError::invalid(format!("unknown protocol in allowed rule {rule:?}")));
    }

    if let Some(ports) = ports {
        let valid = ports
            .split('-')
            .all(|port| port.parse::<u16>().is_ok())
            && ports.split('-').count() <= 2;
        if !valid {
            return Err(TaskError::invalid(format!("invalid ports in allowed rule {rule:?}")));
        }
    }

    Ok((protocol, ports))
}

fn canonical(values: &mut Vec<String>) {
    values.sort();
    values.dedup();
}

impl FirewallRule {
    pub fn new(name: impl Into<String>, network: &Link<Network>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::Sync,
            network: Field::Set(network.clone()),
            source_ranges: Vec::new(),
            source_tags: Vec::new(),
            target_tags: Vec::new(),
            allowed: Vec::new(),
            priority: Field::Unset,
            id: Resolved::new(),
        }
    }

    pub fn allow(mut self, rule: impl Into<String>) -> Self {
        self.allowed.push(rule.into());
        self
    }

    pub fn from_ranges<S: Into<String>>(mut self, ranges: impl IntoIterator<Item = S>) -> Self {
        self.source_ranges.extend(ranges.into_iter().map(Into::into));
        self
    }

    pub fn from_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.source_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn to_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.target_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    fn from_resource(&self, resource: Resource) -> Result<Self, TaskError> {
        let attributes: FirewallAttributes = resource.attributes()?;

        let network = match (attributes.network_id, &self.network) {
            (None, _) => Field::Unset,
            (Some(id), Field::Set(link)) if link.id.get() == Some(&id) => Field::Set(link.clone()),
            (Some(id), _) => Field::Set(Link::detached(Network {
                id: Resolved::known(id.clone()),
                ..Network::new(id)
            })),
        };

        Ok(Self {
            name: self.name.clone(),
            lifecycle: self.lifecycle,
            network,
            source_ranges: attributes.source_ranges,
            source_tags: attributes.source_tags,
            target_tags: attributes.target_tags,
            allowed: attributes.allowed,
            priority: Field::from_option(attributes.priority),
            id: Resolved::known(resource.id),
        })
    }
}

#[derive(Serialize)]
struct TerraformFirewall {
    name: String,
    network: Literal,
    allow: Vec<TerraformAllow>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    source_ranges: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    source_tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    target_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
}

#[derive(Serialize)]
struct TerraformAllow {
    protocol: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
}

impl TypedTask for FirewallRule {
    const KIND: &'static str = "FirewallRule";

    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn dependencies(&self) -> Vec<TaskKey> {
        self.network.get().map(Link::key).into_iter().collect()
    }

    fn find(&self, ctx: &Context) -> Result<Option<Self>, TaskError> {
        let cloud = ctx.cloud();
        let filter = Filter::by_name(&self.name);
        let resource = cloud::find_one(ctx, cloud.as_ref(), ResourceKind::Firewall, &filter)?;
        resource.map(|r| self.from_resource(r)).transpose()
    }

    fn normalize(&mut self, _ctx: &Context) -> Result<(), TaskError> {
        canonical(&mut self.source_ranges);
        canonical(&mut self.source_tags);
        canonical(&mut self.target_tags);
        canonical(&mut self.allowed);
        Ok(())
    }

    fn publish(&self, actual: &Self) {
        if let Some(id) = actual.id.cloned() {
            self.id.set(id);
        }
    }

    fn diff(actual: &Self, expected: &Self) -> Changes<Self> {
        let mut differ = Differ::new();
        let delta = Self {
            network: differ.field("Network", &actual.network, &expected.network),
            source_ranges: differ.list(
                "SourceRanges",
                &actual.source_ranges,
                &expected.source_ranges,
            ),
            source_tags: differ.list("SourceTags", &actual.source_tags, &expected.source_tags),
            target_tags: differ.list("TargetTags", &actual.target_tags, &expected.target_tags),
            allowed: differ.list("Allowed", &actual.allowed, &expected.allowed),
            priority: differ.field("Priority", &actual.priority, &expected.priority),
            ..expected.clone()
        };
        differ.finish(delta)
    }

    fn check_changes(
        actual: Option<&Self>,
        expected: &Self,
        changes: &Self,
    ) -> Result<(), TaskError> {
        match actual {
            None => {
                if !expected.network.is_set() {
                    return Err(TaskError::RequiredField("Network"));
                }
                if expected.allowed.is_empty() {
                    return Err(TaskError::RequiredField("Allowed"));
                }
            }
            Some(_) => {
                if !changes.network.is_unset() {
                    return Err(TaskError::CannotChangeField("Network"));
                }
            }
        }

        for rule in &changes.allowed {
            parse_allowed(rule)?;
        }
        Ok(())
    }

    fn render_api(
        _target: &ApiTarget,
        ctx: &Context,
        delta: Delta<'_, Self>,
    ) -> Result<(), TaskError> {
        let cloud = ctx.cloud();
        let expected = delta.expected;

        let Some(actual) = delta.actual else {
            let network = expected.network.get().ok_or(TaskError::RequiredField("Network"))?;
            let attributes = FirewallAttributes {
                network_id: Some(resolved(network, |n| &n.id)?.to_string()),
                source_ranges: expected.source_ranges.clone(),
                source_tags: expected.source_tags.clone(),
                target_tags: expected.target_tags.clone(),
                allowed: expected.allowed.clone(),
                priority: expected.priority.get().copied(),
            };
            let spec = ResourceSpec::new(&expected.name).with_attributes(&attributes)?;

            tracing::info!(
                name = %expected.name,
                allowed = ?attributes.allowed,
                "Creating firewall rule"
            );
            let resource = ctx.write("create firewall rule", || {
                cloud.create(ResourceKind::Firewall, spec.clone())
            })?;
            expected.id.set(resource.id);
            return Ok(());
        };

        let id = actual
            .id
            .get()
            .ok_or_else(|| TaskError::invalid("actual firewall rule has no ID"))?;

        // Lists are replaced as a whole, so an emptied list still has to be sent.
        let changes = delta.changes;
        let mut patch = serde_json::Map::new();
        for (key, actual, expected) in [
            ("source_ranges", &actual.source_ranges, &expected.source_ranges),
            ("source_tags", &actual.source_tags, &expected.source_tags),
            ("target_tags", &actual.target_tags, &expected.target_tags),
            ("allowed", &actual.allowed, &expected.allowed),
        ] {
            if actual != expected {
                patch.insert(key.to_string(), serde_json::json!(expected));
            }
        }
        if let Some(priority) = changes.priority.get() {
            patch.insert("priority".to_string(), serde_json::json!(priority));
        }

        if !patch.is_empty() {
            tracing::info!(
                name = %expected.name,
                fields = ?patch.keys().collect::<Vec<_>>(),
                "Updating firewall rule"
            );
            let patch = serde_json::Value::Object(patch);
            ctx.write("update firewall rule", || {
                cloud.update(ResourceKind::Firewall, id, patch.clone())
            })?;
        }

        Ok(())
    }

    fn render_terraform(
        target: &TerraformTarget,
        _ctx: &Context,
        delta: Delta<'_, Self>,
    ) -> Result<(), TaskError> {
        let expected = delta.expected;
        let provider = target.provider();
        if provider != Provider::Gce {
            return Err(TaskError::Unsupported(format!(
                "firewall rules on {provider:?} in terraform"
            )));
        }

        let ty = terraform_type(provider, ResourceKind::Firewall)?;
        let network_ty = terraform_type(provider, ResourceKind::Network)?;
        let network = expected.network.get().ok_or(TaskError::RequiredField("Network"))?;

        let mut allow: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for rule in &expected.allowed {
            let (protocol, ports) = parse_allowed(rule)?;
            let entry = allow.entry(protocol).or_default();
            entry.extend(ports.map(str::to_string));
        }

        let firewall = TerraformFirewall {
            name: expected.name.clone(),
            network: Literal::property(network_ty, network.name(), "name"),
            allow: allow
                .into_iter()
                .map(|(protocol, ports)| TerraformAllow {
                    protocol: protocol.to_string(),
                    ports,
                })
                .collect(),
            source_ranges: expected.source_ranges.clone(),
            source_tags: expected.source_tags.clone(),
            target_tags: expected.target_tags.clone(),
            priority: expected.priority.get().copied(),
        };

        target.render_resource(ty, &expected.name, &firewall)?;
        Ok(())
    }

    fn deletion(&self, actual: &Self) -> Option<Box<dyn Deletion>> {
        DeleteResource::new(ResourceKind::Firewall, actual.id.cloned()?, &self.name).boxed()
    }
}
