use serde::{Deserialize, Serialize};

use crate::cloud::{self, Filter, Resource, ResourceKind, ResourceSpec, Tags};
use crate::core::{Context, Field, Lifecycle};
use crate::error::TaskError;
use crate::link::{Link, Resolved, TaskKey};
use crate::target::{ApiTarget, Literal, TerraformTarget};
use crate::task::{Changes, Delta, Deletion, Differ, TypedTask};
use crate::tasks::network::Network;
use crate::tasks::{DeleteResource, owned_tags, resolved, terraform_type};

/// A set of backends a load balancer listener forwards to.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroup {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub network: Field<Link<Network>>,
    pub port: Field<u16>,
    pub protocol: Field<String>,
    pub healthy_threshold: Field<u32>,
    pub unhealthy_threshold: Field<u32>,
    pub tags: Tags,
    pub id: Resolved<String>,
    pub arn: Resolved<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TargetGroupAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    healthy_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unhealthy_threshold: Option<u32>,
}

/// Extracts the name of a target group from its ARN, which ends in
/// `targetgroup/<name>/<id>`.
pub fn target_group_name_from_arn(arn: &str) -> Result<&str, TaskError> {
    arn.split_once("targetgroup/")
        .and_then(|(_, rest)| rest.split('/').next())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| TaskError::invalid(format!("error parsing target group ARN {arn:?}")))
}

impl TargetGroup {
    pub fn new(name: impl Into<String>, network: &Link<Network>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::Sync,
            network: Field::Set(network.clone()),
            port: Field::Unset,
            protocol: Field::Unset,
            healthy_threshold: Field::Unset,
            unhealthy_threshold: Field::Unset,
            tags: Tags::new(),
            id: Resolved::new(),
            arn: Resolved::new(),
        }
    }

    /// A target group seen through the ARN a listener forwards to.
    pub(crate) fn from_arn(arn: &str) -> Result<Self, TaskError> {
        let name = target_group_name_from_arn(arn)?;
        Ok(Self {
            name: name.to_string(),
            lifecycle: Lifecycle::Sync,
            network: Field::Unset,
            port: Field::Unset,
            protocol: Field::Unset,
            healthy_threshold: Field::Unset,
            unhealthy_threshold: Field::Unset,
            tags: Tags::new(),
            id: Resolved::new(),
            arn: Resolved::known(arn.to_string()),
        })
    }

    pub fn with_port(mut self, port: u16, protocol: impl Into<String>) -> Self {
        self.port = Field::Set(port);
        self.protocol = Field::Set(protocol.into());
        self
    }

    pub fn with_thresholds(mut self, healthy: u32, unhealthy: u32) -> Self {
        self.healthy_threshold = Field::Set(healthy);
        self.unhealthy_threshold = Field::Set(unhealthy);
        self
    }

    fn from_resource(&self, resource: Resource) -> Result<Self, TaskError> {
        let attributes: TargetGroupAttributes = resource.attributes()?;

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
            port: Field::from_option(attributes.port),
            protocol: Field::from_option(attributes.protocol),
            healthy_threshold: Field::from_option(attributes.healthy_threshold),
            unhealthy_threshold: Field::from_option(attributes.unhealthy_threshold),
            tags: resource.tags,
            id: Resolved::known(resource.id),
            arn: attributes.arn.map(Resolved::known).unwrap_or_default(),
        })
    }
}

/// Adds and removes backend addresses of a target group, keeping the rest.
pub(crate) fn update_targets(
    ctx: &Context,
    group: &TargetGroup,
    add: &[String],
    remove: &[String],
) -> Result<(), TaskError> {
    let cloud = ctx.cloud();
    let id = resolved_group_id(group)?;

    let resource = ctx.read("get target group", || cloud.get(ResourceKind::TargetGroup, id))?;
    let mut targets: Vec<String> = resource
        .attributes
        .get("targets")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    targets.retain(|target| !remove.contains(target));
    for target in add {
        if !targets.contains(target) {
            targets.push(target.clone());
        }
    }
    targets.sort();

    tracing::info!(group = %group.name, ?add, ?remove, "Updating target group backends");
    let patch = serde_json::json!({ "targets": targets });
    ctx.write("update target group backends", || {
        cloud.update(ResourceKind::TargetGroup, id, patch.clone())
    })?;
    Ok(())
}

fn resolved_group_id(group: &TargetGroup) -> Result<&str, TaskError> {
    group
        .id
        .get()
        .map(String::as_str)
        .ok_or_else(|| TaskError::invalid(format!("target group {} has no ID", group.name)))
}

#[derive(Serialize)]
struct TerraformTargetGroup {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vpc_id: Option<Literal>,
    health_check: TerraformHealthCheck,
    tags: Tags,
}

#[derive(Serialize)]
struct TerraformHealthCheck {
    #[serde(skip_serializing_if = "Option::is_none")]
    healthy_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unhealthy_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
}

impl TypedTask for TargetGroup {
    const KIND: &'static str = "TargetGroup";

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
        let resource = cloud::find_one(ctx, cloud.as_ref(), ResourceKind::TargetGroup, &filter)?;

        resource.map(|r| self.from_resource(r)).transpose()
    }

    fn own(&mut self, ctx: &Context) -> Result<(), TaskError> {
        self.tags = owned_tags(ctx, &self.name, &self.tags);
        Ok(())
    }

    fn publish(&self, actual: &Self) {
        if let Some(id) = actual.id.cloned() {
            self.id.set(id);
        }
        if let Some(arn) = actual.arn.cloned() {
            self.arn.set(arn);
        }
    }

    fn diff(actual: &Self, expected: &Self) -> Changes<Self> {
        let mut differ = Differ::new();
        let delta = Self {
            network: differ.field("Network", &actual.network, &expected.network),
            port: differ.field("Port", &actual.port, &expected.port),
            protocol: differ.field("Protocol", &actual.protocol, &expected.protocol),
            healthy_threshold: differ.field(
                "HealthyThreshold",
                &actual.healthy_threshold,
                &expected.healthy_threshold,
            ),
            unhealthy_threshold: differ.field(
                "UnhealthyThreshold",
                &actual.unhealthy_threshold,
                &expected.unhealthy_threshold,
            ),
            tags: differ.map("Tags", &actual.tags, &expected.tags),
            ..expected.clone()
        };
        differ.finish(delta)
    }

    fn check_changes(
        actual: Option<&Self>,
        expected: &Self,
        changes: &Self,
    ) -> Result<(), TaskError> {
        if actual.is_none() {
            if !expected.network.is_set() {
                return Err(TaskError::RequiredField("Network"));
            }
            if !expected.port.is_set() {
                return Err(TaskError::RequiredField("Port"));
            }
            if !expected.protocol.is_set() {
                return Err(TaskError::RequiredField("Protocol"));
            }
            return Ok(());
        }

        if !changes.network.is_unset() {
            return Err(TaskError::CannotChangeField("Network"));
        }
        if !changes.port.is_unset() {
            return Err(TaskError::CannotChangeField("Port"));
        }
        if !changes.protocol.is_unset() {
            return Err(TaskError::CannotChangeField("Protocol"));
        }
        Ok(())
    }

    fn render_api(
        target: &ApiTarget,
        ctx: &Context,
        delta: Delta<'_, Self>,
    ) -> Result<(), TaskError> {
        let cloud = ctx.cloud();
        let expected = delta.expected;

        let Some(actual) = delta.actual else {
            let network = expected.network.get().ok_or(TaskError::RequiredField("Network"))?;
            let attributes = TargetGroupAttributes {
                arn: None,
                network_id: Some(resolved(network, |n| &n.id)?.to_string()),
                port: expected.port.get().copied(),
                protocol: expected.protocol.get().cloned(),
                healthy_threshold: expected.healthy_threshold.get().copied(),
                unhealthy_threshold: expected.unhealthy_threshold.get().copied(),
            };
            let spec = ResourceSpec::new(&expected.name)
                .with_tags(expected.tags.clone())
                .with_attributes(&attributes)?;

            tracing::info!(name = %expected.name, port = ?attributes.port, "Creating target group");
            let resource = ctx.write("create target group", || {
                cloud.create(ResourceKind::TargetGroup, spec.clone())
            })?;
            let created: TargetGroupAttributes = resource.attributes()?;
            expected.id.set(resource.id);
            if let Some(arn) = created.arn {
                expected.arn.set(arn);
            }
            return Ok(());
        };

        let id = resolved_group_id(actual)?;
        let changes = delta.changes;
        let mut patch = serde_json::Map::new();
        if let Some(healthy) = changes.healthy_threshold.get() {
            patch.insert("healthy_threshold".to_string(), serde_json::json!(healthy));
        }
        if let Some(unhealthy) = changes.unhealthy_threshold.get() {
            patch.insert("unhealthy_threshold".to_string(), serde_json::json!(unhealthy));
        }
        if !patch.is_empty() {
            tracing::info!(
                name = %expected.name,
                fields = ?patch.keys().collect::<Vec<_>>(),
                "Modifying target group health check"
            );
            let patch = serde_json::Value::Object(patch);
            ctx.write("update target group", || {
                cloud.update(ResourceKind::TargetGroup, id, patch.clone())
            })?;
        }

        if !changes.tags.is_empty() {
            target.sync_tags(
                ctx,
                cloud.as_ref(),
                ResourceKind::TargetGroup,
                id,
                &actual.tags,
                &expected.tags,
            )?;
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
        let ty = terraform_type(provider, ResourceKind::TargetGroup)?;
        let network_ty = terraform_type(provider, ResourceKind::Network)?;

        let group = TerraformTargetGroup {
            name: expected.name.clone(),
            port: expected.port.get().copied(),
            protocol: expected.protocol.get().cloned(),
            vpc_id: expected
                .network
                .get()
                .map(|network| Literal::property(network_ty, network.name(), "id")),
            health_check: TerraformHealthCheck {
                healthy_threshold: expected.healthy_threshold.get().copied(),
                unhealthy_threshold: expected.unhealthy_threshold.get().copied(),
                protocol: expected.protocol.get().cloned(),
            },
            tags: expected.tags.clone(),
        };

        target.render_resource(ty, &expected.name, &group)?;
        Ok(())
    }

    fn deletion(&self, actual: &Self) -> Option<Box<dyn Deletion>> {
        DeleteResource::new(ResourceKind::TargetGroup, actual.id.cloned()?, &self.name).boxed()
    }
}
