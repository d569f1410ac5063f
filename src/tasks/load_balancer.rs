use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cloud::{self, Filter, Resource, ResourceKind, ResourceSpec, ResourceState, Tags};
use crate::core::{Context, Field, Lifecycle};
use crate::error::TaskError;
use crate::link::{Link, Resolved, TaskKey};
use crate::target::{ApiTarget, Literal, TerraformTarget};
use crate::task::{Changes, Delta, Deletion, Differ, TypedTask};
use crate::tasks::network::{Network, Subnet};
use crate::tasks::target_group::{TargetGroup, target_group_name_from_arn};
use crate::tasks::{DeleteResource, owned_tags, resolved, terraform_type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    InternetFacing,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAddressType {
    Ipv4,
    Dualstack,
}

/// Attachment of a load balancer to a subnet, optionally pinning its address.
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetMapping {
    pub subnet: Link<Subnet>,
    pub allocation_id: Field<String>,
    pub private_ipv4: Field<String>,
}

impl SubnetMapping {
    pub fn new(subnet: &Link<Subnet>) -> Self {
        Self {
            subnet: subnet.clone(),
            allocation_id: Field::Unset,
            private_ipv4: Field::Unset,
        }
    }

    fn address(&self) -> Option<&str> {
        self.allocation_id.as_deref().or(self.private_ipv4.as_deref())
    }

    fn subnet_id(&self) -> &str {
        self.subnet
            .id
            .get()
            .map(String::as_str)
            .unwrap_or_else(|| self.subnet.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub port: u16,
    pub target_group_name: String,
    pub ssl_certificate_id: Field<String>,
    pub ssl_policy: Field<String>,
}

impl Listener {
    pub fn tcp(port: u16, target_group_name: impl Into<String>) -> Self {
        Self {
            port,
            target_group_name: target_group_name.into(),
            ssl_certificate_id: Field::Unset,
            ssl_policy: Field::Unset,
        }
    }

    pub fn with_tls(mut self, certificate_id: impl Into<String>, policy: Option<String>) -> Self {
        self.ssl_certificate_id = Field::Set(certificate_id.into());
        self.ssl_policy = Field::from_option(policy);
        self
    }

    fn protocol(&self) -> &'static str {
        if self.ssl_certificate_id.is_set() { "TLS" } else { "TCP" }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccessLog {
    pub enabled: Field<bool>,
    pub s3_bucket: Field<String>,
    pub s3_prefix: Field<String>,
}

/// A layer 4 load balancer, usually fronting the cluster API.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkLoadBalancer {
    pub name: String,
    pub lifecycle: Lifecycle,
    /// Name of the load balancer in the cloud, which is more restricted than
    /// task names.
    pub load_balancer_name: Field<String>,
    /// Classic load balancer this one replaces.
    pub clb_name: Field<String>,
    pub network: Field<Link<Network>>,
    pub subnet_mappings: Vec<SubnetMapping>,
    pub listeners: Vec<Listener>,
    pub target_groups: Vec<Link<TargetGroup>>,
    pub scheme: Field<Scheme>,
    pub cross_zone: Field<bool>,
    pub ip_address_type: Field<IpAddressType>,
    pub access_log: Field<AccessLog>,
    pub tags: Tags,
    pub for_api_server: bool,

    pub id: Resolved<String>,
    pub arn: Resolved<String>,
    pub dns_name: Resolved<String>,
    pub hosted_zone_id: Resolved<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LoadBalancerAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dns_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hosted_zone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheme: Option<Scheme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip_address_type: Option<IpAddressType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    subnet_mappings: Vec<SubnetMappingAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cross_zone: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_log: Option<AccessLogAttributes>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubnetMappingAttributes {
    subnet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_ipv4: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessLogAttributes {
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s3_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s3_prefix: Option<String>,
}

impl AccessLogAttributes {
    fn from_access_log(access_log: &AccessLog) -> Self {
        Self {
            enabled: access_log.enabled.value_or_default(),
            s3_bucket: access_log.s3_bucket.get().cloned(),
            s3_prefix: access_log.s3_prefix.get().cloned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ListenerAttributes {
    port: u16,
    protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_group_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ssl_certificate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ssl_policy: Option<String>,
}

impl NetworkLoadBalancer {
    pub fn new(name: impl Into<String>, load_balancer_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::Sync,
            load_balancer_name: Field::Set(load_balancer_name.into()),
            clb_name: Field::Unset,
            network: Field::Unset,
            subnet_mappings: Vec::new(),
            listeners: Vec::new(),
            target_groups: Vec::new(),
            scheme: Field::Unset,
            cross_zone: Field::Unset,
            ip_address_type: Field::Unset,
            access_log: Field::Unset,
            tags: Tags::new(),
            for_api_server: false,
            id: Resolved::new(),
            arn: Resolved::new(),
            dns_name: Resolved::new(),
            hosted_zone_id: Resolved::new(),
        }
    }

    pub fn with_network(mut self, network: &Link<Network>) -> Self {
        self.network = Field::Set(network.clone());
        self
    }

    pub fn with_subnet(mut self, subnet: &Link<Subnet>) -> Self {
        self.subnet_mappings.push(SubnetMapping::new(subnet));
        self
    }

    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_target_group(mut self, target_group: &Link<TargetGroup>) -> Self {
        self.target_groups.push(target_group.clone());
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = Field::Set(scheme);
        self
    }

    pub fn with_cross_zone(mut self, enabled: bool) -> Self {
        self.cross_zone = Field::Set(enabled);
        self
    }

    pub fn with_access_log(mut self, access_log: AccessLog) -> Self {
        self.access_log = Field::Set(access_log);
        self
    }

    /// Marks the load balancer for retirement of the classic one named `name`.
    pub fn replacing_classic(mut self, name: impl Into<String>) -> Self {
        self.clb_name = Field::Set(name.into());
        self
    }

    pub fn for_api_server(mut self) -> Self {
        self.for_api_server = true;
        self
    }

    fn from_resource(&self, ctx: &Context, resource: Resource) -> Result<Self, TaskError> {
        let cloud = ctx.cloud();
        let attributes: LoadBalancerAttributes = resource.attributes()?;

        let network = match (attributes.network_id, &self.network) {
            (None, _) => Field::Unset,
            (Some(id), Field::Set(link)) if link.id.get() == Some(&id) => Field::Set(link.clone()),
            (Some(id), _) => Field::Set(Link::detached(Network {
                id: Resolved::known(id.clone()),
                ..Network::new(id)
            })),
        };

        let subnet_mappings = attributes
            .subnet_mappings
            .into_iter()
            .map(|mapping| {
                let subnet = self
                    .subnet_mappings
                    .iter()
                    .find(|expected| expected.subnet.id.get() == Some(&mapping.subnet_id))
                    .map(|expected| expected.subnet.clone())
                    .unwrap_or_else(|| {
                        Link::detached(Subnet::shared(&mapping.subnet_id, &mapping.subnet_id))
                    });

                SubnetMapping {
                    subnet,
                    allocation_id: Field::from_option(mapping.allocation_id),
                    private_ipv4: Field::from_option(mapping.private_ipv4),
                }
            })
            .collect();

        let mut listeners = Vec::new();
        let mut target_groups = Vec::new();
        let filter = Filter::by_parent(&resource.id);
        let children = cloud::list_all(ctx, cloud.as_ref(), ResourceKind::Listener, &filter)?;
        for child in children {
            let listener: ListenerAttributes = child.attributes()?;
            let mut target_group_name = String::new();

            if let Some(arn) = &listener.target_group_arn {
                target_group_name = target_group_name_from_arn(arn)?.to_string();
                let link = match self.target_groups.iter().find(|tg| tg.arn.get() == Some(arn)) {
                    Some(link) => link.clone(),
                    None => Link::detached(TargetGroup::from_arn(arn)?),
                };
                target_groups.push(link);
            }

            listeners.push(Listener {
                port: listener.port,
                target_group_name,
                ssl_certificate_id: Field::from_option(listener.ssl_certificate_id),
                ssl_policy: Field::from_option(listener.ssl_policy),
            });
        }

        let access_log = attributes.access_log.map(|log| AccessLog {
            enabled: Field::Set(log.enabled),
            s3_bucket: Field::from_option(log.s3_bucket),
            s3_prefix: Field::from_option(log.s3_prefix),
        });

        Ok(Self {
            name: self.name.clone(),
            lifecycle: self.lifecycle,
            load_balancer_name: Field::Set(resource.name),
            clb_name: self.clb_name.clone(),
            network,
            subnet_mappings,
            listeners,
            target_groups,
            scheme: Field::from_option(attributes.scheme),
            cross_zone: Field::from_option(attributes.cross_zone),
            ip_address_type: Field::from_option(attributes.ip_address_type),
            access_log: Field::from_option(access_log),
            tags: resource.tags,
            for_api_server: self.for_api_server,
            id: Resolved::known(resource.id),
            arn: attributes.arn.map(Resolved::known).unwrap_or_default(),
            dns_name: attributes.dns_name.map(Resolved::known).unwrap_or_default(),
            hosted_zone_id: attributes.hosted_zone_id.map(Resolved::known).unwrap_or_default(),
        })
    }

    fn mapping_attributes(&self) -> Result<Vec<SubnetMappingAttributes>, TaskError> {
        self.subnet_mappings
            .iter()
            .map(|mapping| -> Result<SubnetMappingAttributes, TaskError> {
                Ok(SubnetMappingAttributes {
                    subnet_id: resolved(&mapping.subnet, |s| &s.id)?.to_string(),
                    allocation_id: mapping.allocation_id.get().cloned(),
                    private_ipv4: mapping.private_ipv4.get().cloned(),
                })
            })
            .collect()
    }

    fn create_listeners(
        &self,
        ctx: &Context,
        lb_id: &str,
        load_balancer_name: &str,
        listeners: &[Listener],
    ) -> Result<(), TaskError> {
        let cloud = ctx.cloud();

        for listener in listeners {
            let target_group = self
                .target_groups
                .iter()
                .find(|tg| tg.name() == listener.target_group_name)
                .ok_or_else(|| {
                    TaskError::invalid(format!(
                        "target group {} not found for listener on port {}",
                        listener.target_group_name, listener.port
                    ))
                })?;

            let attributes = ListenerAttributes {
                port: listener.port,
                protocol: listener.protocol().to_string(),
                target_group_arn: Some(resolved(target_group, |tg| &tg.arn)?.to_string()),
                ssl_certificate_id: listener.ssl_certificate_id.get().cloned(),
                ssl_policy: listener.ssl_policy.get().cloned(),
            };
            let spec = ResourceSpec::new(format!("{load_balancer_name}-{}", listener.port))
                .with_parent(lb_id)
                .with_attributes(&attributes)?;

            tracing::info!(
                port = listener.port,
                protocol = %attributes.protocol,
                "Creating listener for NLB"
            );
            ctx.write("create listener", || cloud.create(ResourceKind::Listener, spec.clone()))?;
        }

        Ok(())
    }
}

fn publish_outputs(task: &NetworkLoadBalancer, resource: &Resource) -> Result<(), TaskError> {
    let attributes: LoadBalancerAttributes = resource.attributes()?;
    task.id.set(resource.id.clone());
    if let Some(arn) = attributes.arn {
        task.arn.set(arn);
    }
    if let Some(dns_name) = attributes.dns_name {
        task.dns_name.set(dns_name);
    }
    if let Some(hosted_zone_id) = attributes.hosted_zone_id {
        task.hosted_zone_id.set(hosted_zone_id);
    }
    Ok(())
}

#[derive(Serialize)]
struct TerraformLoadBalancer {
    name: String,
    internal: bool,
    load_balancer_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address_type: Option<IpAddressType>,
    subnet_mapping: Vec<TerraformSubnetMapping>,
    enable_cross_zone_load_balancing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_logs: Option<TerraformAccessLog>,
    tags: Tags,
}

#[derive(Serialize)]
struct TerraformSubnetMapping {
    subnet_id: Literal,
    #[serde(skip_serializing_if = "Option::is_none")]
    allocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_ipv4_address: Option<String>,
}

#[derive(Serialize)]
struct TerraformAccessLog {
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
}

#[derive(Serialize)]
struct TerraformListener {
    load_balancer_arn: Literal,
    port: u16,
    protocol: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssl_policy: Option<String>,
    default_action: Vec<TerraformListenerAction>,
}

#[derive(Serialize)]
struct TerraformListenerAction {
    #[serde(rename = "type")]
    kind: &'static str,
    target_group_arn: Literal,
}

impl TypedTask for NetworkLoadBalancer {
    const KIND: &'static str = "NetworkLoadBalancer";

    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn dependencies(&self) -> Vec<TaskKey> {
        let mut dependencies: Vec<TaskKey> =
            self.network.get().map(Link::key).into_iter().collect();
        dependencies.extend(self.subnet_mappings.iter().map(|m| m.subnet.key()));
        dependencies.extend(self.target_groups.iter().map(Link::key));
        dependencies
    }

    fn find(&self, ctx: &Context) -> Result<Option<Self>, TaskError> {
        let cloud = ctx.cloud();
        let resource =
            cloud::find_by_name_tag(ctx, cloud.as_ref(), ResourceKind::LoadBalancer, &self.name)?;
        let Some(resource) = resource else {
            return Ok(None);
        };

        let actual = self.from_resource(ctx, resource)?;
        tracing::debug!(name = %self.name, actual = ?actual, "Found NLB");
        Ok(Some(actual))
    }

    fn own(&mut self, ctx: &Context) -> Result<(), TaskError> {
        self.tags = owned_tags(ctx, &self.name, &self.tags);
        Ok(())
    }

    fn normalize(&mut self, _ctx: &Context) -> Result<(), TaskError> {
        self.subnet_mappings
            .sort_by(|a, b| a.subnet.name().cmp(b.subnet.name()));
        self.listeners.sort_by_key(|listener| listener.port);
        self.target_groups.sort_by(|a, b| a.name().cmp(b.name()));

        if self.ip_address_type.is_unset() {
            let ipv4_only = self
                .subnet_mappings
                .iter()
                .any(|mapping| !mapping.subnet.has_ipv6());
            self.ip_address_type = Field::Set(if ipv4_only {
                IpAddressType::Ipv4
            } else {
                IpAddressType::Dualstack
            });
        }

        Ok(())
    }

    fn fill_unset(&mut self, actual: &Self) {
        // Renaming would replace the load balancer, keep whatever name it has.
        if let Field::Set(name) = &actual.load_balancer_name
            && self.load_balancer_name.get() != Some(name)
        {
            tracing::debug!(name = %name, "Reusing existing load balancer name");
            self.load_balancer_name = Field::Set(name.clone());
        }

        // An existing internal IPv4 load balancer cannot become dualstack.
        if actual.scheme == Field::Set(Scheme::Internal)
            && actual.ip_address_type == Field::Set(IpAddressType::Ipv4)
        {
            self.ip_address_type = actual.ip_address_type.clone();
        }
    }

    fn publish(&self, actual: &Self) {
        for (output, value) in [
            (&self.id, &actual.id),
            (&self.arn, &actual.arn),
            (&self.dns_name, &actual.dns_name),
            (&self.hosted_zone_id, &actual.hosted_zone_id),
        ] {
            if let Some(value) = value.cloned() {
                output.set(value);
            }
        }
    }

    fn diff(actual: &Self, expected: &Self) -> Changes<Self> {
        let mut differ = Differ::new();
        let delta = Self {
            load_balancer_name: differ.field(
                "LoadBalancerName",
                &actual.load_balancer_name,
                &expected.load_balancer_name,
            ),
            network: differ.field("Network", &actual.network, &expected.network),
            subnet_mappings: differ.list(
                "SubnetMappings",
                &actual.subnet_mappings,
                &expected.subnet_mappings,
            ),
            listeners: differ.list("Listeners", &actual.listeners, &expected.listeners),
            target_groups: differ.list(
                "TargetGroups",
                &actual.target_groups,
                &expected.target_groups,
            ),
            scheme: differ.field("Scheme", &actual.scheme, &expected.scheme),
            cross_zone: differ.field(
                "CrossZoneLoadBalancing",
                &actual.cross_zone,
                &expected.cross_zone,
            ),
            ip_address_type: differ.field(
                "IpAddressType",
                &actual.ip_address_type,
                &expected.ip_address_type,
            ),
            access_log: differ.field("AccessLog", &actual.access_log, &expected.access_log),
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
        let Some(actual) = actual else {
            if expected.name.is_empty() {
                return Err(TaskError::RequiredField("Name"));
            }
            if expected.subnet_mappings.is_empty() {
                return Err(TaskError::RequiredField("SubnetMappings"));
            }
            if let Field::Set(access_log) = &expected.access_log {
                match access_log.enabled {
                    Field::Set(true) if !access_log.s3_bucket.is_set() => {
                        return Err(TaskError::RequiredField("AccessLog.S3Bucket"));
                    }
                    Field::Set(_) => {}
                    _ => return Err(TaskError::RequiredField("AccessLog.Enabled")),
                }
            }
            return Ok(());
        };

        if !changes.subnet_mappings.is_empty() {
            let expected_subnets: BTreeMap<&str, Option<&str>> = expected
                .subnet_mappings
                .iter()
                .map(|mapping| (mapping.subnet_id(), mapping.address()))
                .collect();

            for mapping in &actual.subnet_mappings {
                let Some(address) = expected_subnets.get(mapping.subnet_id()) else {
                    return Err(TaskError::invalid(
                        "network load balancers do not support detaching subnets",
                    ));
                };
                if *address != mapping.address() {
                    return Err(TaskError::invalid(
                        "network load balancers do not support modifying address settings",
                    ));
                }
            }
        }

        if !changes.scheme.is_unset() {
            return Err(TaskError::CannotChangeField("Scheme"));
        }
        if !changes.network.is_unset() {
            return Err(TaskError::CannotChangeField("Network"));
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

        if expected.listeners.len() != expected.target_groups.len() {
            return Err(TaskError::invalid(format!(
                "nlb listeners and target groups do not match: {} listeners vs {} target groups",
                expected.listeners.len(),
                expected.target_groups.len()
            )));
        }

        let Some(actual) = delta.actual else {
            let load_balancer_name = expected
                .load_balancer_name
                .get()
                .ok_or(TaskError::RequiredField("LoadBalancerName"))?;
            for target_group in &expected.target_groups {
                if !target_group.arn.is_resolved() {
                    return Err(TaskError::invalid(format!(
                        "missing required target group ARN for NLB creation {}",
                        target_group.key()
                    )));
                }
            }

            let attributes = LoadBalancerAttributes {
                network_id: expected
                    .network
                    .get()
                    .map(|network| resolved(network, |n| &n.id).map(str::to_string))
                    .transpose()?,
                scheme: expected.scheme.get().copied(),
                ip_address_type: expected.ip_address_type.get().copied(),
                subnet_mappings: expected.mapping_attributes()?,
                cross_zone: expected.cross_zone.get().copied(),
                access_log: expected.access_log.get().map(AccessLogAttributes::from_access_log),
                ..Default::default()
            };
            let spec = ResourceSpec::new(load_balancer_name)
                .with_tags(expected.tags.clone())
                .with_attributes(&attributes)?;

            tracing::info!(name = %load_balancer_name, "Creating NLB");
            let created = ctx.write("create NLB", || {
                cloud.create(ResourceKind::LoadBalancer, spec.clone())
            })?;
            let id = created.id.clone();

            ctx.wait_until(&format!("NLB {load_balancer_name} to become active"), || {
                let resource = ctx.read("get NLB", || cloud.get(ResourceKind::LoadBalancer, &id))?;
                match resource.state {
                    ResourceState::Active => Ok(true),
                    ResourceState::Provisioning => Ok(false),
                    ResourceState::Failed => Err(TaskError::invalid(format!(
                        "NLB {load_balancer_name} failed to provision"
                    ))),
                }
            })?;

            publish_outputs(expected, &created)?;
            expected.create_listeners(ctx, &id, load_balancer_name, &expected.listeners)?;
            return Ok(());
        };

        let changes = delta.changes;
        let id = actual
            .id
            .get()
            .ok_or_else(|| TaskError::invalid("actual NLB has no ID"))?;
        let load_balancer_name = actual.load_balancer_name.as_deref().unwrap_or(&expected.name);

        if let Some(ip_address_type) = changes.ip_address_type.get() {
            tracing::info!(name = %load_balancer_name, ?ip_address_type, "Setting IP address type");
            let patch = serde_json::json!({ "ip_address_type": ip_address_type });
            ctx.write("set NLB IP address type", || {
                cloud.update(ResourceKind::LoadBalancer, id, patch.clone())
            })?;
        }

        if !changes.subnet_mappings.is_empty() {
            let current: BTreeMap<&str, Option<&str>> = actual
                .subnet_mappings
                .iter()
                .map(|mapping| (mapping.subnet_id(), mapping.address()))
                .collect();
            let attach = expected
                .subnet_mappings
                .iter()
                .any(|mapping| current.get(mapping.subnet_id()) != Some(&mapping.address()));

            if attach {
                tracing::info!(name = %load_balancer_name, "Attaching NLB to new subnets");
                let patch =
                    serde_json::json!({ "subnet_mappings": expected.mapping_attributes()? });
                ctx.write("set NLB subnets", || {
                    cloud.update(ResourceKind::LoadBalancer, id, patch.clone())
                })?;
            }
        }

        if !changes.listeners.is_empty() {
            let filter = Filter::by_parent(id);
            let existing = cloud::list_all(ctx, cloud.as_ref(), ResourceKind::Listener, &filter)?;
            for listener in existing {
                tracing::debug!(listener = %listener.id, "Deleting listener before recreating it");
                ctx.delete("delete listener", || {
                    cloud.delete(ResourceKind::Listener, &listener.id)
                })?;
            }
            expected.create_listeners(ctx, id, load_balancer_name, &changes.listeners)?;
        }

        let mut patch = serde_json::Map::new();
        if let Some(cross_zone) = changes.cross_zone.get() {
            patch.insert("cross_zone".into(), serde_json::json!(cross_zone));
        }
        if let Some(access_log) = changes.access_log.get() {
            let access_log = AccessLogAttributes::from_access_log(access_log);
            patch.insert("access_log".into(), serde_json::to_value(access_log)?);
        }
        if !patch.is_empty() {
            tracing::info!(
                name = %load_balancer_name,
                attributes = ?patch.keys().collect::<Vec<_>>(),
                "Modifying NLB attributes"
            );
            let patch = serde_json::Value::Object(patch);
            ctx.write("modify NLB attributes", || {
                cloud.update(ResourceKind::LoadBalancer, id, patch.clone())
            })?;
        }

        if !changes.tags.is_empty() {
            target.sync_tags(
                ctx,
                cloud.as_ref(),
                ResourceKind::LoadBalancer,
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
        let lb_ty = terraform_type(provider, ResourceKind::LoadBalancer)?;
        let listener_ty = terraform_type(provider, ResourceKind::Listener)?;
        let subnet_ty = terraform_type(provider, ResourceKind::Subnet)?;
        let target_group_ty = terraform_type(provider, ResourceKind::TargetGroup)?;

        let load_balancer_name = expected
            .load_balancer_name
            .get()
            .ok_or(TaskError::RequiredField("LoadBalancerName"))?;

        let lb = TerraformLoadBalancer {
            name: load_balancer_name.clone(),
            internal: expected.scheme == Field::Set(Scheme::Internal),
            load_balancer_type: "network",
            ip_address_type: expected
                .ip_address_type
                .get()
                .copied()
                .filter(|ty| *ty == IpAddressType::Dualstack),
            subnet_mapping: expected
                .subnet_mappings
                .iter()
                .map(|mapping| TerraformSubnetMapping {
                    subnet_id: Literal::property(subnet_ty, mapping.subnet.name(), "id"),
                    allocation_id: mapping.allocation_id.get().cloned(),
                    private_ipv4_address: mapping.private_ipv4.get().cloned(),
                })
                .collect(),
            enable_cross_zone_load_balancing: expected.cross_zone.value_or_default(),
            access_logs: expected
                .access_log
                .get()
                .filter(|log| log.enabled.value_or_default())
                .map(|log| TerraformAccessLog {
                    enabled: true,
                    bucket: log.s3_bucket.get().cloned(),
                    prefix: log.s3_prefix.get().cloned(),
                }),
            tags: expected.tags.clone(),
        };
        target.render_resource(lb_ty, &expected.name, &lb)?;

        for listener in &expected.listeners {
            let target_group = expected
                .target_groups
                .iter()
                .find(|tg| tg.name() == listener.target_group_name)
                .ok_or_else(|| {
                    TaskError::invalid(format!(
                        "target group not found for NLB listener on port {}",
                        listener.port
                    ))
                })?;

            let rendered = TerraformListener {
                load_balancer_arn: Literal::property(lb_ty, &expected.name, "id"),
                port: listener.port,
                protocol: listener.protocol(),
                certificate_arn: listener.ssl_certificate_id.get().cloned(),
                ssl_policy: listener
                    .ssl_policy
                    .get()
                    .cloned()
                    .filter(|_| listener.ssl_certificate_id.is_set()),
                default_action: vec![TerraformListenerAction {
                    kind: "forward",
                    target_group_arn: Literal::property(target_group_ty, target_group.name(), "id"),
                }],
            };
            let name = format!("{}-{}", expected.name, listener.port);
            target.render_resource(listener_ty, &name, &rendered)?;
        }

        if expected.for_api_server {
            target.add_output(
                &format!("{}-dns-name", expected.name),
                &Literal::property(lb_ty, &expected.name, "dns_name"),
            )?;
        }

        Ok(())
    }

    fn deletion(&self, actual: &Self) -> Option<Box<dyn Deletion>> {
        let name = actual.load_balancer_name.get().unwrap_or(&self.name);
        DeleteResource::new(ResourceKind::LoadBalancer, actual.id.cloned()?, name).boxed()
    }

    /// Retires the classic load balancer this one replaces.
    fn find_deletions(&self, ctx: &Context) -> Result<Vec<Box<dyn Deletion>>, TaskError> {
        let Some(clb_name) = self.clb_name.get() else {
            return Ok(Vec::new());
        };

        let cloud = ctx.cloud();
        let kind = ResourceKind::ClassicLoadBalancer;
        let Some(clb) = cloud::find_by_name_tag(ctx, cloud.as_ref(), kind, clb_name)? else {
            return Ok(Vec::new());
        };

        tracing::debug!(name = %clb.name, id = %clb.id, "Found classic load balancer to retire");
        Ok(DeleteResource::new(kind, clb.id, clb.name)
            .boxed()
            .into_iter()
            .collect())
    }

    fn api_addresses(&self) -> Vec<String> {
        if !self.for_api_server {
            return Vec::new();
        }
        self.dns_name.cloned().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Provider;
    use crate::cloud::mock::Operation;
    use crate::executor::Outcome;
    use crate::registry::Registry;
    use crate::tasks::testing;

    const SUBNETS: [&str; 3] = ["us-east-1a", "us-east-1b", "us-east-1c"];
    const TARGET_GROUP: &str = "tcp-cluster1-vpjolq";

    /// Registers a network, three subnets and a target group, plus a load
    /// balancer attached to the `mapped` zones.
    fn register(
        registry: &mut Registry,
        mapped: &[&str],
        configure: impl FnOnce(NetworkLoadBalancer) -> NetworkLoadBalancer,
    ) -> Link<NetworkLoadBalancer> {
        let network = registry
            .add(Network::new(testing::CLUSTER).with_cidr("10.0.0.0/16"))
            .unwrap();

        let mut lb = NetworkLoadBalancer::new("api.cluster1.example.com", "api-cluster1-vpjolq")
            .with_network(&network)
            .for_api_server();

        for (i, zone) in SUBNETS.iter().enumerate() {
            let subnet = registry
                .add(
                    Subnet::new(format!("{zone}.{}", testing::CLUSTER), &network)
                        .with_cidr(format!("10.0.{}.0/19", i * 32))
                        .with_zone(*zone),
                )
                .unwrap();
            if mapped.contains(zone) {
                lb = lb.with_subnet(&subnet);
            }
        }

        let target_group = registry
            .add(TargetGroup::new(TARGET_GROUP, &network).with_port(443, "TCP"))
            .unwrap();

        let lb = lb
            .with_target_group(&target_group)
            .with_listener(Listener::tcp(443, TARGET_GROUP));
        registry.add(configure(lb)).unwrap()
    }

    fn apply(
        cloud: &std::sync::Arc<crate::cloud::mock::MockCloud>,
        mapped: &[&str],
        configure: impl FnOnce(NetworkLoadBalancer) -> NetworkLoadBalancer,
    ) -> (Link<NetworkLoadBalancer>, crate::executor::ApplyReport) {
        let mut registry = Registry::new();
        let lb = register(&mut registry, mapped, configure);
        let report = testing::apply(cloud, registry);
        (lb, report)
    }

    fn lb_attributes(cloud: &crate::cloud::mock::MockCloud) -> LoadBalancerAttributes {
        let resources = cloud.resources(ResourceKind::LoadBalancer);
        assert_eq!(resources.len(), 1);
        resources[0].attributes().unwrap()
    }

    #[test]
    fn create_requires_subnet_mappings() {
        let lb = NetworkLoadBalancer::new("api.cluster1", "api-cluster1");
        let err = NetworkLoadBalancer::check_changes(None, &lb, &lb).unwrap_err();
        assert!(matches!(err, TaskError::RequiredField("SubnetMappings")));
    }

    #[test]
    fn enabled_access_log_requires_bucket() {
        let subnet = Link::detached(Subnet::shared("a", "subnet-a"));
        let lb = NetworkLoadBalancer::new("api.cluster1", "api-cluster1")
            .with_subnet(&subnet)
            .with_access_log(AccessLog {
                enabled: Field::Set(true),
                ..AccessLog::default()
            });
        let err = NetworkLoadBalancer::check_changes(None, &lb, &lb).unwrap_err();
        assert!(matches!(err, TaskError::RequiredField("AccessLog.S3Bucket")));

        let lb = lb.with_access_log(AccessLog::default());
        let err = NetworkLoadBalancer::check_changes(None, &lb, &lb).unwrap_err();
        assert!(matches!(err, TaskError::RequiredField("AccessLog.Enabled")));
    }

    #[test]
    fn creates_listeners_and_publishes_outputs() {
        let cloud = testing::cloud(Provider::Aws);
        let (lb, report) = apply(&cloud, &SUBNETS, |lb| lb);

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(report.outcome(&lb.key()), Some(&Outcome::Created));

        let attributes = lb_attributes(&cloud);
        assert_eq!(attributes.subnet_mappings.len(), 3);
        assert_eq!(attributes.ip_address_type, Some(IpAddressType::Ipv4));

        let listeners = cloud.resources(ResourceKind::Listener);
        assert_eq!(listeners.len(), 1);
        let listener: ListenerAttributes = listeners[0].attributes().unwrap();
        assert_eq!(listener.protocol, "TCP");
        assert_eq!(
            target_group_name_from_arn(listener.target_group_arn.as_deref().unwrap()).unwrap(),
            TARGET_GROUP
        );

        let dns_name = lb.dns_name.cloned().unwrap();
        assert!(lb.arn.is_resolved());
        assert_eq!(report.api_addresses, vec![dns_name]);
    }

    #[test]
    fn reapply_is_a_no_op() {
        let cloud = testing::cloud(Provider::Aws);
        apply(&cloud, &SUBNETS, |lb| lb.with_cross_zone(true));

        cloud.reset_calls();
        let (lb, report) = apply(&cloud, &SUBNETS, |lb| lb.with_cross_zone(true));

        assert!(report.is_success(), "{}", report.summary());
        assert!(
            report
                .tasks
                .iter()
                .all(|task| task.outcome == Outcome::Unchanged),
            "{}",
            report.summary()
        );
        assert_eq!(cloud.mutations(), 0);
        // Outputs come from find when nothing is rendered.
        assert!(lb.dns_name.is_resolved());
        assert_eq!(report.api_addresses.len(), 1);
    }

    #[test]
    fn attaching_a_subnet_is_allowed() {
        let cloud = testing::cloud(Provider::Aws);
        apply(&cloud, &SUBNETS[..2], |lb| lb);

        cloud.reset_calls();
        let (lb, report) = apply(&cloud, &SUBNETS, |lb| lb);

        assert_eq!(report.outcome(&lb.key()), Some(&Outcome::Updated(vec!["SubnetMappings"])));
        assert_eq!(cloud.calls(Operation::Update), 1);
        assert_eq!(lb_attributes(&cloud).subnet_mappings.len(), 3);
    }

    #[test]
    fn detaching_a_subnet_is_rejected() {
        let cloud = testing::cloud(Provider::Aws);
        apply(&cloud, &SUBNETS[..2], |lb| lb);

        cloud.reset_calls();
        let (lb, report) = apply(&cloud, &[SUBNETS[0], SUBNETS[2]], |lb| lb);

        match report.outcome(&lb.key()) {
            Some(Outcome::Failed(TaskError::Invalid(message))) => {
                assert_eq!(message, "network load balancers do not support detaching subnets");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(cloud.mutations(), 0);
        assert!(report.into_result().is_err());
    }

    #[test]
    fn pinned_addresses_cannot_change() {
        let cloud = testing::cloud(Provider::Aws);
        apply(&cloud, &SUBNETS[..1], |lb| lb);

        let (lb, report) = apply(&cloud, &SUBNETS[..1], |mut lb| {
            lb.subnet_mappings[0].private_ipv4 = Field::Set("10.0.0.10".into());
            lb
        });

        match report.outcome(&lb.key()) {
            Some(Outcome::Failed(TaskError::Invalid(message))) => {
                assert_eq!(
                    message,
                    "network load balancers do not support modifying address settings"
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn scheme_is_immutable() {
        let cloud = testing::cloud(Provider::Aws);
        apply(&cloud, &SUBNETS, |lb| lb.with_scheme(Scheme::InternetFacing));

        cloud.reset_calls();
        let (lb, report) = apply(&cloud, &SUBNETS, |lb| lb.with_scheme(Scheme::Internal));

        assert!(matches!(
            report.outcome(&lb.key()),
            Some(Outcome::Failed(TaskError::CannotChangeField("Scheme")))
        ));
        assert_eq!(cloud.mutations(), 0);
    }

    #[test]
    fn listener_changes_recreate_listeners() {
        let cloud = testing::cloud(Provider::Aws);
        apply(&cloud, &SUBNETS, |lb| lb);

        cloud.reset_calls();
        let (lb, report) = apply(&cloud, &SUBNETS, |mut lb| {
            lb.listeners = vec![Listener::tcp(443, TARGET_GROUP)
                .with_tls("arn:cert", Some("ELBSecurityPolicy-2016-08".into()))];
            lb
        });

        assert_eq!(report.outcome(&lb.key()), Some(&Outcome::Updated(vec!["Listeners"])));
        assert_eq!(cloud.calls(Operation::Delete), 1);
        assert_eq!(cloud.calls(Operation::Create), 1);

        let listeners = cloud.resources(ResourceKind::Listener);
        assert_eq!(listeners.len(), 1);
        let listener: ListenerAttributes = listeners[0].attributes().unwrap();
        assert_eq!(listener.protocol, "TLS");
        assert_eq!(listener.ssl_certificate_id.as_deref(), Some("arn:cert"));
    }

    #[test]
    fn existing_name_is_kept() {
        let cloud = testing::cloud(Provider::Aws);
        apply(&cloud, &SUBNETS, |lb| lb);

        cloud.reset_calls();
        let (lb, report) = apply(&cloud, &SUBNETS, |mut lb| {
            lb.load_balancer_name = Field::Set("api-cluster1-renamed".into());
            lb
        });

        assert_eq!(report.outcome(&lb.key()), Some(&Outcome::Unchanged));
        assert_eq!(cloud.mutations(), 0);
    }

    #[test]
    fn internal_ipv4_stays_ipv4() {
        let subnet =
            Link::detached(Subnet::shared("a", "subnet-a").with_ipv6_cidr("2001:db8::/64"));
        let mut actual = NetworkLoadBalancer::new("api", "api").with_scheme(Scheme::Internal);
        actual.ip_address_type = Field::Set(IpAddressType::Ipv4);

        let cloud = testing::cloud(Provider::Aws);
        let mut expected = NetworkLoadBalancer::new("api", "api").with_subnet(&subnet);
        testing::with_context(&cloud, |ctx| expected.normalize(ctx)).unwrap();
        assert_eq!(expected.ip_address_type, Field::Set(IpAddressType::Dualstack));

        expected.fill_unset(&actual);
        assert_eq!(expected.ip_address_type, Field::Set(IpAddressType::Ipv4));
    }

    #[test]
    fn normalize_is_order_independent_and_idempotent() {
        let cloud = testing::cloud(Provider::Aws);
        let subnets: Vec<Link<Subnet>> = ["c", "a", "b"]
            .iter()
            .map(|name| Link::detached(Subnet::shared(*name, format!("subnet-{name}"))))
            .collect();

        let mut forward = NetworkLoadBalancer::new("api", "api")
            .with_listener(Listener::tcp(443, "tls"))
            .with_listener(Listener::tcp(80, "tcp"));
        let mut backward = NetworkLoadBalancer::new("api", "api")
            .with_listener(Listener::tcp(80, "tcp"))
            .with_listener(Listener::tcp(443, "tls"));
        for subnet in &subnets {
            forward = forward.with_subnet(subnet);
        }
        for subnet in subnets.iter().rev() {
            backward = backward.with_subnet(subnet);
        }

        testing::with_context(&cloud, |ctx| {
            forward.normalize(ctx).unwrap();
            backward.normalize(ctx).unwrap();
            assert_eq!(forward, backward);

            let once = forward.clone();
            forward.normalize(ctx).unwrap();
            assert_eq!(forward, once);
        });

        let names: Vec<&str> = forward.subnet_mappings.iter().map(|m| m.subnet.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(forward.listeners[0].port, 80);
    }

    #[test]
    fn classic_load_balancer_is_retired_after_apply() {
        let cloud = testing::cloud(Provider::Aws);
        cloud.insert(
            ResourceKind::ClassicLoadBalancer,
            ResourceSpec::new("api-cluster1-legacy").with_tags(Tags::from([(
                crate::cloud::NAME_TAG.to_string(),
                "api.cluster1.example.com".to_string(),
            )])),
        );

        let (_, report) = apply(&cloud, &SUBNETS, |lb| {
            lb.replacing_classic("api.cluster1.example.com")
        });

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(report.deletions.len(), 1);
        assert_eq!(report.deletions[0].kind, "ClassicLoadBalancer");
        assert_eq!(report.deletions[0].item, "api-cluster1-legacy");
        assert!(cloud.resources(ResourceKind::ClassicLoadBalancer).is_empty());
    }

    #[test]
    fn renders_terraform() {
        let cloud = testing::cloud(Provider::Aws);
        let mut registry = Registry::new();
        register(&mut registry, &SUBNETS, |mut lb| {
            lb.listeners = vec![Listener::tcp(443, TARGET_GROUP).with_tls("arn:cert", None)];
            lb
        });
        let target = testing::terraform(&cloud, registry);

        let lb = target.resource("aws_lb", "api.cluster1.example.com").unwrap();
        assert_eq!(lb["name"], "api-cluster1-vpjolq");
        assert_eq!(lb["load_balancer_type"], "network");
        assert_eq!(lb["internal"], false);
        assert_eq!(
            lb["subnet_mapping"][0]["subnet_id"],
            "${aws_subnet.us-east-1a-cluster1-example-com.id}"
        );

        assert!(lb.get("ip_address_type").is_none());

        let listener = target.resource("aws_lb_listener", "api.cluster1.example.com-443").unwrap();
        assert_eq!(listener["protocol"], "TLS");
        assert_eq!(listener["load_balancer_arn"], "${aws_lb.api-cluster1-example-com.id}");
        assert_eq!(
            listener["default_action"][0]["target_group_arn"],
            "${aws_lb_target_group.tcp-cluster1-vpjolq.id}"
        );

        let json = target.to_json().unwrap();
        assert!(json.contains("api-cluster1-example-com-dns-name"));
        assert_eq!(cloud.mutations(), 0);
    }
}
