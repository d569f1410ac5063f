//! Concrete infrastructure tasks.

pub mod firewall;
pub mod instance;
pub mod load_balancer;
pub mod network;
pub mod target_group;

pub use firewall::FirewallRule;
pub use instance::{InstanceGroup, InstanceRole};
pub use load_balancer::{
    AccessLog, IpAddressType, Listener, NetworkLoadBalancer, Scheme, SubnetMapping,
};
pub use network::{Network, Subnet};
pub use target_group::TargetGroup;

use crate::cloud::{CLUSTER_TAG, NAME_TAG, Provider, ResourceKind, Tags};
use crate::core::Context;
use crate::error::TaskError;
use crate::link::{Link, Resolved};
use crate::task::{Deletion, TypedTask};

/// Terraform resource type of a resource kind on a provider.
pub(crate) fn terraform_type(
    provider: Provider,
    kind: ResourceKind,
) -> Result<&'static str, TaskError> {
    use Provider as P;
    use ResourceKind as K;

    let ty = match (provider, kind) {
        (P::Aws, K::Network) => "aws_vpc",
        (P::Aws, K::Subnet) => "aws_subnet",
        (P::Aws, K::LoadBalancer) => "aws_lb",
        (P::Aws, K::Listener) => "aws_lb_listener",
        (P::Aws, K::TargetGroup) => "aws_lb_target_group",
        (P::Aws, K::Instance) => "aws_instance",
        (P::Aws, K::Firewall) => "aws_security_group",
        (P::Gce, K::Network) => "google_compute_network",
        (P::Gce, K::Subnet) => "google_compute_subnetwork",
        (P::Gce, K::Firewall) => "google_compute_firewall",
        (P::Gce, K::Instance) => "google_compute_instance",
        (P::OpenStack, K::Network) => "openstack_networking_network_v2",
        (P::OpenStack, K::Subnet) => "openstack_networking_subnet_v2",
        (P::OpenStack, K::Firewall) => "openstack_networking_secgroup_v2",
        (P::OpenStack, K::Instance) => "openstack_compute_instance_v2",
        (P::DigitalOcean, K::Network) => "digitalocean_vpc",
        (P::DigitalOcean, K::Firewall) => "digitalocean_firewall",
        (P::DigitalOcean, K::Instance) => "digitalocean_droplet",
        (P::Scaleway, K::Network) => "scaleway_vpc",
        (P::Scaleway, K::Subnet) => "scaleway_vpc_private_network",
        (P::Scaleway, K::Instance) => "scaleway_instance_server",
        (P::Scaleway, K::LoadBalancer) => "scaleway_lb",
        (provider, kind) => {
            return Err(TaskError::Unsupported(format!("{kind} on {provider:?} in terraform")));
        }
    };

    Ok(ty)
}

/// Tags every owned resource carries on top of the ones the task asks for.
pub(crate) fn owned_tags(ctx: &Context, name: &str, tags: &Tags) -> Tags {
    let mut owned = tags.clone();
    owned
        .entry(NAME_TAG.to_string())
        .or_insert_with(|| name.to_string());
    if !ctx.cluster_name().is_empty() {
        owned
            .entry(CLUSTER_TAG.to_string())
            .or_insert_with(|| ctx.cluster_name().to_string());
    }
    owned
}

/// The resolved output of a dependency, which has to be there once the
/// dependency is done.
pub(crate) fn resolved<'a, T: TypedTask>(
    link: &'a Link<T>,
    output: impl Fn(&'a T) -> &'a Resolved<String>,
) -> Result<&'a str, TaskError> {
    output(&**link)
        .get()
        .map(String::as_str)
        .ok_or_else(|| TaskError::invalid(format!("{} has not been resolved yet", link.key())))
}

/// Deletes a single resource by ID. A resource that is already gone counts
/// as deleted.
#[derive(Debug)]
pub(crate) struct DeleteResource {
    kind: ResourceKind,
    label: String,
    id: String,
    name: String,
}

impl DeleteResource {
    pub(crate) fn new(kind: ResourceKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            label: kind.to_string(),
            id: id.into(),
            name: name.into(),
        }
    }

    pub(crate) fn boxed(self) -> Option<Box<dyn Deletion>> {
        Some(Box::new(self))
    }
}

impl Deletion for DeleteResource {
    fn kind(&self) -> &str {
        &self.label
    }

    fn item(&self) -> String {
        self.name.clone()
    }

    fn delete(&self, ctx: &Context) -> Result<(), TaskError> {
        let cloud = ctx.cloud();
        tracing::info!(kind = %self.kind, id = %self.id, name = %self.name, "Deleting");

        let what = format!("delete {} {}", self.kind, self.id);
        match ctx.delete(&what, || cloud.delete(self.kind, &self.id)) {

            Err(TaskError::Cloud(err)) if err.is_not_found() => Ok(()),
            result => result,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::cloud::mock::MockCloud;
    use crate::cloud::{Cloud, CloudPool, Provider};
    use crate::core::{ApplyOptions, CancelToken, Context};
    use crate::executor::{ApplyReport, Executor};
    use crate::registry::Registry;
    use crate::retry::BackoffPolicies;
    use crate::target::{Target, TerraformTarget};

    pub(crate) const CLUSTER: &str = "cluster1.example.com";

    pub(crate) fn cloud(provider: Provider) -> Arc<MockCloud> {
        cloud_in(provider, "us-east-1")
    }

    pub(crate) fn cloud_in(provider: Provider, region: &str) -> Arc<MockCloud> {
        Arc::new(MockCloud::new(provider, region))
    }

    pub(crate) fn options() -> ApplyOptions {
        ApplyOptions::default()
            .with_cluster_name(CLUSTER)
            .with_backoff(BackoffPolicies::immediate())
    }

    fn run(cloud: &Arc<MockCloud>, registry: Registry, target: Target) -> (ApplyReport, Target) {
        run_in(CloudPool::new(cloud.clone()), registry, target)
    }

    fn run_in(clouds: CloudPool, registry: Registry, target: Target) -> (ApplyReport, Target) {
        let plan = registry.finish().unwrap();
        let executor = Executor::new(clouds, target).with_options(options());
        let report = executor.run(&plan).unwrap();
        (report, executor.into_target())
    }

    pub(crate) fn apply(cloud: &Arc<MockCloud>, registry: Registry) -> ApplyReport {
        run(cloud, registry, Target::api()).0
    }

    /// Applies against several regional clouds, the first one being the default.
    pub(crate) fn apply_in(clouds: &[Arc<MockCloud>], registry: Registry) -> ApplyReport {
        let (default, others) = clouds.split_first().unwrap();
        let pool = others
            .iter()
            .fold(CloudPool::new(default.clone()), |pool, cloud| pool.with_region(cloud.clone()));
        run_in(pool, registry, Target::api()).0
    }

    pub(crate) fn dry_run(cloud: &Arc<MockCloud>, registry: Registry) -> (ApplyReport, Target) {
        run(cloud, registry, Target::dry_run())
    }

    pub(crate) fn terraform(cloud: &Arc<MockCloud>, registry: Registry) -> TerraformTarget {
        let target = Target::Terraform(TerraformTarget::new(cloud.provider(), "us-east-1"));
        let (report, target) = run(cloud, registry, target);
        assert!(report.is_success(), "{}", report.summary());
        match target {
            Target::Terraform(terraform) => terraform,
            _ => unreachable!(),
        }
    }

    /// Runs `f` with a context bound to `cloud`, outside of any executor.
    pub(crate) fn with_context<R>(cloud: &Arc<MockCloud>, f: impl FnOnce(&Context) -> R) -> R {
        let clouds = CloudPool::new(cloud.clone());
        let options = options();
        let cancel = CancelToken::new();
        let ctx = Context::new(&clouds, &options, &cancel);
        f(&ctx)
    }
}
