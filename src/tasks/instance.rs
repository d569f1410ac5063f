use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cloud::{
    self, CLUSTER_TAG, Cloud, Filter, Provider, Resource, ResourceKind, ResourceSpec,
    ResourceState, Tags,
};
use crate::core::{Context, Field, Lifecycle};
use crate::error::TaskError;
use crate::link::{Link, TaskKey};
use crate::target::terraform::sanitize_name;
use crate::target::{ApiTarget, Literal, TerraformTarget};
use crate::task::{Changes, Delta, Differ, TypedTask};
use crate::tasks::target_group::{TargetGroup, update_targets};
use crate::tasks::{owned_tags, terraform_type};

/// Tag carrying the instance group a server belongs to.
pub const INSTANCE_GROUP_TAG: &str = "kops.k8s.io/instancegroup";
/// Tag carrying the role of a server.
pub const ROLE_TAG: &str = "kops.k8s.io/role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceRole {
    ControlPlane,
    Node,
}

impl InstanceRole {
    fn as_str(self) -> &'static str {
        match self {
            InstanceRole::ControlPlane => "control-plane",
            InstanceRole::Node => "node",
        }
    }
}

/// A number of identical servers, scaled by count.
///
/// Servers of a control-plane group are registered as backends of
/// `target_group` when they are created and removed from it when the group
/// shrinks.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceGroup {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub zone: Field<String>,
    pub role: Field<InstanceRole>,
    pub commercial_type: Field<String>,
    pub image: Field<String>,
    pub count: u32,
    /// Cloud-init payload. Servers never report it back.
    pub user_data: Field<String>,
    pub tags: Tags,
    pub target_group: Field<Link<TargetGroup>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstanceAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<InstanceRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    commercial_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_ip: Option<String>,
}

impl InstanceGroup {
    pub fn new(name: impl Into<String>, role: InstanceRole) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::Sync,
            zone: Field::Unset,
            role: Field::Set(role),
            commercial_type: Field::Unset,
            image: Field::Unset,
            count: 1,
            user_data: Field::Unset,
            tags: Tags::new(),
            target_group: Field::Unset,
        }
    }

    pub fn with_server(
        mut self,
        zone: impl Into<String>,
        commercial_type: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        self.zone = Field::Set(zone.into());
        self.commercial_type = Field::Set(commercial_type.into());
        self.image = Field::Set(image.into());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_user_data(mut self, user_data: impl Into<String>) -> Self {
        self.user_data = Field::Set(user_data.into());
        self
    }

    pub fn with_target_group(mut self, target_group: &Link<TargetGroup>) -> Self {
        self.target_group = Field::Set(target_group.clone());
        self
    }

    fn is_control_plane(&self) -> bool {
        self.role == Field::Set(InstanceRole::ControlPlane)
    }

    /// Instance calls are zonal: servers live behind the client of their zone.
    fn cloud(&self, ctx: &Context) -> Result<Arc<dyn Cloud>, TaskError> {
        match self.zone.get() {
            Some(zone) => ctx.cloud_in(zone),
            None => Ok(ctx.cloud()),
        }
    }

    /// Servers of this group, oldest first by creation date. Servers without
    /// one sort last, by id.
    fn servers(&self, ctx: &Context) -> Result<Vec<Resource>, TaskError> {
        let cloud = self.cloud(ctx)?;
        let mut filter = Filter::any().with_tag(INSTANCE_GROUP_TAG, &self.name);
        if !ctx.cluster_name().is_empty() {
            filter = filter.with_tag(CLUSTER_TAG, ctx.cluster_name());
        }

        let mut servers = cloud::list_all(ctx, cloud.as_ref(), ResourceKind::Instance, &filter)?;
        servers.sort_by_cached_key(|server| {
            let created = server.attributes["creation_date"].as_str().map(str::to_string);
            (created.is_none(), created, server.id.clone())
        });
        Ok(servers)
    }

    fn create_server(&self, ctx: &Context, index: usize) -> Result<Option<String>, TaskError> {
        let cloud = self.cloud(ctx)?;
        let attributes = InstanceAttributes {
            zone: self.zone.get().cloned(),
            role: self.role.get().copied(),
            commercial_type: self.commercial_type.get().cloned(),
            image: self.image.get().cloned(),
            private_ip: None,
        };
        let spec = ResourceSpec::new(format!("{}-{index}", self.name))
            .with_tags(self.tags.clone())
            .with_attributes(&attributes)?;

        tracing::info!(group = %self.name, server = %spec.name, "Creating server");
        let created = ctx.write("create server", || {
            cloud.create(ResourceKind::Instance, spec.clone())
        })?;
        let id = created.id.clone();

        let mut server = created;
        ctx.wait_until(&format!("server {id} of group {} to run", self.name), || {
            server = ctx.read("get server", || cloud.get(ResourceKind::Instance, &id))?;
            match server.state {
                ResourceState::Active => Ok(true),
                ResourceState::Provisioning => Ok(false),
                ResourceState::Failed => Err(TaskError::invalid(format!(
                    "server {id} of group {} failed",
                    self.name
                ))),
            }
        })?;

        if let Some(user_data) = self.user_data.get() {
            let patch = serde_json::json!({ "user_data": user_data });
            ctx.write("set server user data", || {
                cloud.update(ResourceKind::Instance, &id, patch.clone())
            })?;
        }

        let attributes: InstanceAttributes = server.attributes()?;
        Ok(attributes.private_ip)
    }
}

#[derive(Serialize)]
struct TerraformInstanceIp {
    count: u32,
}

#[derive(Serialize)]
struct TerraformInstance {
    count: u32,
    name: String,
    ip_id: Literal,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    commercial_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    zone: Option<String>,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<TerraformUserData>,
}

#[derive(Serialize)]
struct TerraformUserData {
    #[serde(rename = "cloud-init")]
    cloud_init: Literal,
}

impl TypedTask for InstanceGroup {
    const KIND: &'static str = "InstanceGroup";

    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn dependencies(&self) -> Vec<TaskKey> {
        self.target_group.get().map(Link::key).into_iter().collect()
    }

    fn find(&self, ctx: &Context) -> Result<Option<Self>, TaskError> {
        let servers = self.servers(ctx)?;
        let Some(server) = servers.first() else {
            return Ok(None);
        };

        let attributes: InstanceAttributes = server.attributes()?;
        Ok(Some(Self {
            name: self.name.clone(),
            lifecycle: self.lifecycle,
            zone: Field::from_option(attributes.zone),
            role: Field::from_option(attributes.role),
            commercial_type: Field::from_option(attributes.commercial_type),
            image: Field::from_option(attributes.image),
            count: u32::try_from(servers.len()).unwrap_or(u32::MAX),
            user_data: self.user_data.clone(),
            tags: server.tags.clone(),
            target_group: self.target_group.clone(),
        }))
    }

    fn own(&mut self, ctx: &Context) -> Result<(), TaskError> {
        let mut tags = owned_tags(ctx, &self.name, &self.tags);
        tags.insert(INSTANCE_GROUP_TAG.to_string(), self.name.clone());
        if let Some(role) = self.role.get() {
            tags.insert(ROLE_TAG.to_string(), role.as_str().to_string());
        }
        self.tags = tags;
        Ok(())
    }

    fn diff(actual: &Self, expected: &Self) -> Changes<Self> {
        let mut differ = Differ::new();
        let delta = Self {
            zone: differ.field("Zone", &actual.zone, &expected.zone),
            role: differ.field("Role", &actual.role, &expected.role),
            commercial_type: differ.field(
                "CommercialType",
                &actual.commercial_type,
                &expected.commercial_type,
            ),
            image: differ.field("Image", &actual.image, &expected.image),
            count: differ.value("Count", &actual.count, &expected.count),
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
            if expected.name.is_empty() {
                return Err(TaskError::RequiredField("Name"));
            }
            if !expected.zone.is_set() {
                return Err(TaskError::RequiredField("Zone"));
            }
            if !expected.commercial_type.is_set() {
                return Err(TaskError::RequiredField("CommercialType"));
            }
            if !expected.image.is_set() {
                return Err(TaskError::RequiredField("Image"));
            }
            return Ok(());
        }

        if !changes.zone.is_unset() {
            return Err(TaskError::CannotChangeField("Zone"));
        }
        if !changes.commercial_type.is_unset() {
            return Err(TaskError::CannotChangeField("CommercialType"));
        }
        if !changes.image.is_unset() {
            return Err(TaskError::CannotChangeField("Image"));
        }
        Ok(())
    }

    fn render_api(
        target: &ApiTarget,
        ctx: &Context,
        delta: Delta<'_, Self>,
    ) -> Result<(), TaskError> {
        let expected = delta.expected;
        let cloud = expected.cloud(ctx)?;
        let existing = match delta.actual {
            Some(_) => expected.servers(ctx)?,
            None => Vec::new(),
        };

        let wanted = usize::try_from(expected.count).unwrap_or(usize::MAX);
        let mut added = Vec::new();
        let mut removed = Vec::new();

        if !delta.changes.tags.is_empty() {
            for server in &existing {
                target.sync_tags(
                    ctx,
                    cloud.as_ref(),
                    ResourceKind::Instance,
                    &server.id,
                    &server.tags,
                    &expected.tags,
                )?;
            }
        }

        if wanted > existing.len() {
            for index in existing.len()..wanted {
                if let Some(ip) = expected.create_server(ctx, index)? {
                    added.push(ip);
                }
            }
        }

        if wanted < existing.len() {
            for server in &existing[wanted..] {
                let attributes: InstanceAttributes = server.attributes()?;
                tracing::info!(group = %expected.name, server = %server.id, "Deleting server");
                ctx.delete("delete server", || cloud.delete(ResourceKind::Instance, &server.id))?;
                removed.extend(attributes.private_ip);
            }
        }

        if expected.is_control_plane()
            && (!added.is_empty() || !removed.is_empty())
            && let Some(target_group) = expected.target_group.get()
        {
            update_targets(ctx, target_group, &added, &removed)?;
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
        if provider != Provider::Scaleway {
            return Err(TaskError::Unsupported(format!(
                "instance groups on {provider:?} in terraform"
            )));
        }

        let ty = terraform_type(provider, ResourceKind::Instance)?;
        let ip_ty = "scaleway_instance_ip";
        let ip = TerraformInstanceIp {
            count: expected.count,
        };
        target.render_resource(ip_ty, &expected.name, &ip)?;

        let user_data = expected.user_data.get().map(|user_data| TerraformUserData {
            cloud_init: target.add_file(ty, &expected.name, "user_data", user_data.as_bytes()),
        });

        let instance = TerraformInstance {
            count: expected.count,
            name: expected.name.clone(),
            ip_id: Literal::string(format!(
                "${{{ip_ty}.{}[count.index].id}}",
                sanitize_name(&expected.name)
            )),
            commercial_type: expected.commercial_type.get().cloned(),
            image: expected.image.get().cloned(),
            zone: expected.zone.get().cloned(),
            tags: expected.tags.iter().map(|(key, value)| format!("{key}={value}")).collect(),
            user_data,
        };
        target.render_resource(ty, &expected.name, &instance)?;
        Ok(())
    }
}
