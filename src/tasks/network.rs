use serde::{Deserialize, Serialize};

use crate::cloud::{self, Provider, Resource, ResourceKind, ResourceSpec, Tags};
use crate::core::{Context, Field, Lifecycle};
use crate::error::TaskError;
use crate::link::{Link, Resolved, TaskKey};
use crate::target::{ApiTarget, Literal, TerraformTarget};
use crate::task::{Changes, Delta, Deletion, Differ, TypedTask};
use crate::tasks::{DeleteResource, owned_tags, resolved, terraform_type};

/// A private network (VPC) the cluster lives in.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub cidr: Field<String>,
    pub enable_dns_hostnames: Field<bool>,
    pub tags: Tags,
    /// Networks not owned by the cluster keep whatever tags they have.
    pub shared: bool,
    pub id: Resolved<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enable_dns_hostnames: Option<bool>,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::Sync,
            cidr: Field::Unset,
            enable_dns_hostnames: Field::Unset,
            tags: Tags::new(),
            shared: false,
            id: Resolved::new(),
        }
    }

    /// An existing network referenced by ID, which the cluster only uses.
    pub fn shared(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            lifecycle: Lifecycle::ExistsAndWarnIfChanges,
            shared: true,
            id: Resolved::known(id.into()),
            ..Self::new(name)
        }
    }

    pub fn with_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.cidr = Field::Set(cidr.into());
        self
    }

    fn from_resource(&self, resource: Resource) -> Result<Self, TaskError> {
        let attributes: NetworkAttributes = resource.attributes()?;
        Ok(Self {
            name: self.name.clone(),
            lifecycle: self.lifecycle,
            cidr: Field::from_option(attributes.cidr),
            enable_dns_hostnames: Field::from_option(attributes.enable_dns_hostnames),
            tags: resource.tags,
            shared: self.shared,
            id: Resolved::known(resource.id),
        })
    }
}

#[derive(Serialize)]
struct TerraformNetwork {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cidr_block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_dns_hostnames: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_create_subnetworks: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<Tags>,
}

impl TypedTask for Network {
    const KIND: &'static str = "Network";

    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn find(&self, ctx: &Context) -> Result<Option<Self>, TaskError> {
        let cloud = ctx.cloud();
        let resource = match self.id.get() {
            Some(id) => cloud::get_optional(ctx, cloud.as_ref(), ResourceKind::Network, id)?,
            None => {
                cloud::find_by_name_tag(ctx, cloud.as_ref(), ResourceKind::Network, &self.name)?
            }
        };

        let Some(resource) = resource else {
            tracing::debug!(name = %self.name, "Network not found");
            return Ok(None);
        };

        Ok(Some(self.from_resource(resource)?))
    }

    fn own(&mut self, ctx: &Context) -> Result<(), TaskError> {
        if !self.shared {
            self.tags = owned_tags(ctx, &self.name, &self.tags);
        }
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
            cidr: differ.field("Cidr", &actual.cidr, &expected.cidr),
            enable_dns_hostnames: differ.field(
                "EnableDnsHostnames",
                &actual.enable_dns_hostnames,
                &expected.enable_dns_hostnames,
            ),
            tags: if expected.shared {
                Tags::new()
            } else {
                differ.map("Tags", &actual.tags, &expected.tags)
            },
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
                if expected.shared {
                    return Err(TaskError::invalid(format!(
                        "shared network {} does not exist",
                        expected.name
                    )));
                }
                if !expected.cidr.is_set() {
                    return Err(TaskError::RequiredField("Cidr"));
                }
            }
            Some(_) => {
                if !changes.cidr.is_unset() {
                    return Err(TaskError::CannotChangeField("Cidr"));
                }
            }
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
            let attributes = NetworkAttributes {
                cidr: expected.cidr.get().cloned(),
                enable_dns_hostnames: expected.enable_dns_hostnames.get().copied(),
            };
            let spec = ResourceSpec::new(&expected.name)
                .with_tags(expected.tags.clone())
                .with_attributes(&attributes)?;

            tracing::info!(name = %expected.name, cidr = ?attributes.cidr, "Creating network");
            let resource = ctx.write("create network", || {
                cloud.create(ResourceKind::Network, spec.clone())
            })?;
            expected.id.set(resource.id);
            return Ok(());
        };

        let id = resolved_id(actual)?;
        if let Some(enabled) = delta.changes.enable_dns_hostnames.get() {
            let patch = serde_json::json!({ "enable_dns_hostnames": enabled });
            ctx.write("update network", || cloud.update(ResourceKind::Network, id, patch.clone()))?;
        }

        if !delta.changes.tags.is_empty() {
            target.sync_tags(
                ctx,
                cloud.as_ref(),
                ResourceKind::Network,
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
        if expected.shared {
            return Ok(());
        }

        let provider = target.provider();
        let ty = terraform_type(provider, ResourceKind::Network)?;
        let aws = provider == Provider::Aws;

        let network = TerraformNetwork {
            name: (!aws).then(|| expected.name.clone()),
            cidr_block: expected.cidr.get().cloned().filter(|_| aws),
            ip_range: expected
                .cidr
                .get()
                .cloned()
                .filter(|_| provider == Provider::DigitalOcean),
            enable_dns_hostnames: expected.enable_dns_hostnames.get().copied().filter(|_| aws),
            auto_create_subnetworks: (provider == Provider::Gce).then_some(false),
            tags: aws.then(|| expected.tags.clone()),
        };

        target.render_resource(ty, &expected.name, &network)?;
        Ok(())
    }

    fn deletion(&self, actual: &Self) -> Option<Box<dyn Deletion>> {
        if self.shared {
            return None;
        }
        DeleteResource::new(ResourceKind::Network, actual.id.cloned()?, &self.name).boxed()
    }
}

fn resolved_id<T: HasId>(actual: &T) -> Result<&str, TaskError> {
    actual
        .resolved_id()
        .get()
        .map(String::as_str)
        .ok_or_else(|| TaskError::invalid("actual resource has no ID"))
}

trait HasId {
    fn resolved_id(&self) -> &Resolved<String>;
}

impl HasId for Network {
    fn resolved_id(&self) -> &Resolved<String> {
        &self.id
    }
}

impl HasId for Subnet {
    fn resolved_id(&self) -> &Resolved<String> {
        &self.id
    }
}

/// A subnet of a [`Network`] in a single zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Subnet {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub network: Field<Link<Network>>,
    pub cidr: Field<String>,
    pub ipv6_cidr: Field<String>,
    pub zone: Field<String>,
    pub tags: Tags,
    pub shared: bool,
    pub id: Resolved<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubnetAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ipv6_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    zone: Option<String>,
}

impl Subnet {
    pub fn new(name: impl Into<String>, network: &Link<Network>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::Sync,
            network: Field::Set(network.clone()),
            cidr: Field::Unset,
            ipv6_cidr: Field::Unset,
            zone: Field::Unset,
            tags: Tags::new(),
            shared: false,
            id: Resolved::new(),
        }
    }

    /// An existing subnet known by ID.
    pub fn shared(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::ExistsAndWarnIfChanges,
            network: Field::Unset,
            cidr: Field::Unset,
            ipv6_cidr: Field::Unset,
            zone: Field::Unset,
            tags: Tags::new(),
            shared: true,
            id: Resolved::known(id.into()),
        }
    }

    pub fn with_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.cidr = Field::Set(cidr.into());
        self
    }

    pub fn with_ipv6_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.ipv6_cidr = Field::Set(cidr.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Field::Set(zone.into());
        self
    }

    pub fn has_ipv6(&self) -> bool {
        self.ipv6_cidr.is_set()
    }

    fn from_resource(&self, resource: Resource) -> Result<Self, TaskError> {
        let attributes: SubnetAttributes = resource.attributes()?;

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
            cidr: Field::from_option(attributes.cidr),
            ipv6_cidr: Field::from_option(attributes.ipv6_cidr),
            zone: Field::from_option(attributes.zone),
            tags: resource.tags,
            shared: self.shared,
            id: Resolved::known(resource.id),
        })
    }
}

#[derive(Serialize)]
struct TerraformSubnet {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vpc_id: Option<Literal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<Literal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cidr_block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_cidr_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv6_cidr_block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    availability_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<Tags>,
}

impl TypedTask for Subnet {
    const KIND: &'static str = "Subnet";

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
        let resource = match self.id.get() {
            Some(id) => cloud::get_optional(ctx, cloud.as_ref(), ResourceKind::Subnet, id)?,
            None => cloud::find_by_name_tag(ctx, cloud.as_ref(), ResourceKind::Subnet, &self.name)?,
        };

        resource.map(|r| self.from_resource(r)).transpose()
    }

    fn own(&mut self, ctx: &Context) -> Result<(), TaskError> {
        if !self.shared {
            self.tags = owned_tags(ctx, &self.name, &self.tags);
        }
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
            cidr: differ.field("Cidr", &actual.cidr, &expected.cidr),
            ipv6_cidr: differ.field("Ipv6Cidr", &actual.ipv6_cidr, &expected.ipv6_cidr),
            zone: differ.field("Zone", &actual.zone, &expected.zone),
            tags: if expected.shared {
                Tags::new()
            } else {
                differ.map("Tags", &actual.tags, &expected.tags)
            },
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
                if expected.shared {
                    return Err(TaskError::invalid(format!(
                        "shared subnet {} does not exist",
                        expected.name
                    )));
                }
                if !expected.network.is_set() {
                    return Err(TaskError::RequiredField("Network"));
                }
                if !expected.cidr.is_set() {
                    return Err(TaskError::RequiredField("Cidr"));
                }
            }
            Some(actual) => {
                if !changes.network.is_unset() {
                    return Err(TaskError::CannotChangeField("Network"));
                }
                if !changes.cidr.is_unset() {
                    return Err(TaskError::CannotChangeField("Cidr"));
                }
                if !changes.zone.is_unset() {
                    return Err(TaskError::CannotChangeField("Zone"));
                }
                // An IPv6 block can be associated later, but never swapped.
                if actual.ipv6_cidr.is_set() && !changes.ipv6_cidr.is_unset() {
                    return Err(TaskError::CannotChangeField("Ipv6Cidr"));
                }
            }
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
            let attributes = SubnetAttributes {
                network_id: Some(resolved(network, |n| &n.id)?.to_string()),
                cidr: expected.cidr.get().cloned(),
                ipv6_cidr: expected.ipv6_cidr.get().cloned(),
                zone: expected.zone.get().cloned(),
            };
            let spec = ResourceSpec::new(&expected.name)
                .with_tags(expected.tags.clone())
                .with_attributes(&attributes)?;

            tracing::info!(
                name = %expected.name,
                cidr = ?attributes.cidr,
                zone = ?attributes.zone,
                "Creating subnet"
            );
            let resource = ctx.write("create subnet", || {
                cloud.create(ResourceKind::Subnet, spec.clone())
            })?;
            expected.id.set(resource.id);
            return Ok(());
        };

        let id = resolved_id(actual)?;
        if let Some(ipv6_cidr) = delta.changes.ipv6_cidr.get() {
            tracing::info!(name = %expected.name, ipv6_cidr, "Associating IPv6 block");
            let patch = serde_json::json!({ "ipv6_cidr": ipv6_cidr });
            ctx.write("update subnet", || cloud.update(ResourceKind::Subnet, id, patch.clone()))?;
        }

        if !delta.changes.tags.is_empty() {
            target.sync_tags(
                ctx,
                cloud.as_ref(),
                ResourceKind::Subnet,
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
        if expected.shared {
            return Ok(());
        }

        let provider = target.provider();
        let ty = terraform_type(provider, ResourceKind::Subnet)?;
        let network_ty = terraform_type(provider, ResourceKind::Network)?;
        let network = expected
            .network
            .get()
            .map(|network| Literal::property(network_ty, network.name(), "id"));
        let aws = provider == Provider::Aws;

        let subnet = TerraformSubnet {
            name: (!aws).then(|| expected.name.clone()),
            vpc_id: network.clone().filter(|_| aws),
            network: network.filter(|_| !aws),
            cidr_block: expected.cidr.get().cloned().filter(|_| aws),
            ip_cidr_range: expected.cidr.get().cloned().filter(|_| !aws),
            ipv6_cidr_block: expected.ipv6_cidr.get().cloned().filter(|_| aws),
            availability_zone: expected.zone.get().cloned().filter(|_| aws),
            tags: aws.then(|| expected.tags.clone()),
        };

        target.render_resource(ty, &expected.name, &subnet)?;
        Ok(())
    }

    fn deletion(&self, actual: &Self) -> Option<Box<dyn Deletion>> {
        if self.shared {
            return None;
        }
        DeleteResource::new(ResourceKind::Subnet, actual.id.cloned()?, &self.name).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Cloud;
    use crate::cloud::mock::Operation;
    use crate::executor::Outcome;
    use crate::registry::Registry;
    use crate::tasks::testing;

    fn register(registry: &mut Registry) -> (Link<Network>, Link<Subnet>) {
        let network = registry
            .add(Network::new("cluster1.example.com").with_cidr("10.0.0.0/16"))
            .unwrap();
        let subnet = registry
            .add(
                Subnet::new("us-east-1a.cluster1.example.com", &network)
                    .with_cidr("10.0.32.0/19")
                    .with_zone("us-east-1a"),
            )
            .unwrap();
        (network, subnet)
    }

    #[test]
    fn creates_then_converges() {
        let cloud = testing::cloud(Provider::Aws);

        let mut registry = Registry::new();
        let (network, subnet) = register(&mut registry);
        let report = testing::apply(&cloud, registry);

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(report.outcome(&network.key()), Some(&Outcome::Created));
        let network_id = network.id.cloned().unwrap();
        let created = cloud.resources(ResourceKind::Subnet);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].attributes["network_id"], network_id.as_str());
        assert_eq!(created[0].tag("KubernetesCluster"), Some("cluster1.example.com"));
        assert!(subnet.id.is_resolved());

        cloud.reset_calls();
        let mut registry = Registry::new();
        let (network, subnet) = register(&mut registry);
        let report = testing::apply(&cloud, registry);

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(report.outcome(&network.key()), Some(&Outcome::Unchanged));
        assert_eq!(report.outcome(&subnet.key()), Some(&Outcome::Unchanged));
        assert_eq!(cloud.mutations(), 0);
        assert_eq!(network.id.cloned(), Some(network_id));
    }

    #[test]
    fn drifted_tags_are_restored() {
        let cloud = testing::cloud(Provider::Aws);
        let mut registry = Registry::new();
        let (network, subnet) = register(&mut registry);
        testing::apply(&cloud, registry);

        let network_id = network.id.cloned().unwrap();
        let subnet_id = subnet.id.cloned().unwrap();
        cloud
            .remove_tags(ResourceKind::Network, &network_id, &["KubernetesCluster".to_string()])
            .unwrap();
        cloud
            .set_tags(
                ResourceKind::Subnet,
                &subnet_id,
                &Tags::from([("team".to_string(), "net".to_string())]),
            )
            .unwrap();

        cloud.reset_calls();
        let mut registry = Registry::new();
        let (network, subnet) = register(&mut registry);
        let report = testing::apply(&cloud, registry);

        assert_eq!(report.outcome(&network.key()), Some(&Outcome::Updated(vec!["Tags"])));
        assert_eq!(report.outcome(&subnet.key()), Some(&Outcome::Updated(vec!["Tags"])));
        assert_eq!(cloud.calls(Operation::SetTags), 1);
        assert_eq!(cloud.calls(Operation::RemoveTags), 1);

        let restored = cloud.resource(ResourceKind::Network, &network_id).unwrap();
        assert_eq!(restored.tag("KubernetesCluster"), Some("cluster1.example.com"));
        let cleaned = cloud.resource(ResourceKind::Subnet, &subnet_id).unwrap();
        assert_eq!(cleaned.tag("team"), None);

        cloud.reset_calls();
        let mut registry = Registry::new();
        register(&mut registry);
        testing::apply(&cloud, registry);
        assert_eq!(cloud.mutations(), 0);
    }

    #[test]
    fn create_requires_cidr() {
        let network = Network::new("cluster1");
        let err = Network::check_changes(None, &network, &network).unwrap_err();
        assert!(matches!(err, TaskError::RequiredField("Cidr")));

        let network = network.with_cidr("10.0.0.0/16");
        assert!(Network::check_changes(None, &network, &network).is_ok());
    }

    #[test]
    fn cidr_is_immutable() {
        let cloud = testing::cloud(Provider::Aws);
        let mut registry = Registry::new();
        register(&mut registry);
        testing::apply(&cloud, registry);

        cloud.reset_calls();
        let mut registry = Registry::new();
        let network = registry
            .add(Network::new("cluster1.example.com").with_cidr("172.16.0.0/16"))
            .unwrap();
        let report = testing::apply(&cloud, registry);

        assert!(matches!(
            report.outcome(&network.key()),
            Some(Outcome::Failed(TaskError::CannotChangeField("Cidr")))
        ));
        assert_eq!(cloud.mutations(), 0);
    }

    #[test]
    fn subnet_can_gain_ipv6_but_not_swap_it() {
        let cloud = testing::cloud(Provider::Aws);
        let mut registry = Registry::new();
        register(&mut registry);
        testing::apply(&cloud, registry);

        let mut registry = Registry::new();
        let network = registry
            .add(Network::new("cluster1.example.com").with_cidr("10.0.0.0/16"))
            .unwrap();
        let subnet = registry
            .add(
                Subnet::new("us-east-1a.cluster1.example.com", &network)
                    .with_cidr("10.0.32.0/19")
                    .with_ipv6_cidr("2001:db8::/64"),
            )
            .unwrap();
        let report = testing::apply(&cloud, registry);
        assert_eq!(report.outcome(&subnet.key()), Some(&Outcome::Updated(vec!["Ipv6Cidr"])));
        assert_eq!(cloud.calls(Operation::Update), 1);

        let mut registry = Registry::new();
        let network = registry
            .add(Network::new("cluster1.example.com").with_cidr("10.0.0.0/16"))
            .unwrap();
        let subnet = registry
            .add(
                Subnet::new("us-east-1a.cluster1.example.com", &network)
                    .with_ipv6_cidr("2001:db8:1::/64"),
            )

            .unwrap();
        let report = testing::apply(&cloud, registry);
        assert!(matches!(
            report.outcome(&subnet.key()),
            Some(Outcome::Failed(TaskError::CannotChangeField("Ipv6Cidr")))
        ));
    }

    #[test]
    fn shared_network_is_only_observed() {
        let cloud = testing::cloud(Provider::Aws);
        let existing = cloud.insert(
            ResourceKind::Network,
            ResourceSpec::new("corp")
                .with_tags(Tags::from([("team".to_string(), "net".to_string())]))
                .with_attributes(&serde_json::json!({ "cidr": "10.1.0.0/16" }))
                .unwrap(),
        );

        let mut registry = Registry::new();
        let network = registry
            .add(Network::shared("corp", existing.id.clone()).with_cidr("10.1.0.0/16"))
            .unwrap();
        let report = testing::apply(&cloud, registry);

        assert_eq!(report.outcome(&network.key()), Some(&Outcome::Unchanged));
        assert_eq!(cloud.mutations(), 0);
    }

    #[test]
    fn renders_terraform_with_references() {
        let cloud = testing::cloud(Provider::Aws);
        let mut registry = Registry::new();
        register(&mut registry);
        let target = testing::terraform(&cloud, registry);

        let vpc = target.resource("aws_vpc", "cluster1.example.com").unwrap();
        assert_eq!(vpc["cidr_block"], "10.0.0.0/16");

        let subnet = target.resource("aws_subnet", "us-east-1a.cluster1.example.com").unwrap();
        assert_eq!(subnet["vpc_id"], "${aws_vpc.cluster1-example-com.id}");
        assert_eq!(subnet["availability_zone"], "us-east-1a");
        assert_eq!(cloud.mutations(), 0);
    }

    #[test]
    fn not_exists_removes_the_subnet() {
        let cloud = testing::cloud(Provider::Aws);
        let mut registry = Registry::new();
        register(&mut registry);
        testing::apply(&cloud, registry);
        assert_eq!(cloud.resources(ResourceKind::Subnet).len(), 1);

        let mut registry = Registry::new();
        let network = registry
            .add(Network::new("cluster1.example.com").with_cidr("10.0.0.0/16"))
            .unwrap();
        let subnet = registry
            .add(Subnet {
                lifecycle: Lifecycle::NotExists,
                ..Subnet::new("us-east-1a.cluster1.example.com", &network)
            })
            .unwrap();
        let report = testing::apply(&cloud, registry);

        assert_eq!(report.outcome(&subnet.key()), Some(&Outcome::Deleted));
        assert!(cloud.resources(ResourceKind::Subnet).is_empty());
        assert_eq!(cloud.resources(ResourceKind::Network).len(), 1);
    }
}
