//! The capability through which tasks observe and mutate a cloud.
//!
//! Provider SDKs live outside this crate. They are adapted to the narrow
//! [`Cloud`] trait, which speaks in generic [`Resource`]s carrying typed,
//! serde-encoded attributes.

pub mod mock;

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::Context;
use crate::error::{CloudError, TaskError};

/// Tag used to find resources that carry the task name.
pub const NAME_TAG: &str = "Name";

/// Tag marking resources owned by a cluster.
pub const CLUSTER_TAG: &str = "KubernetesCluster";

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    Aws,
    Gce,
    OpenStack,
    DigitalOcean,
    Scaleway,
}

impl Provider {
    /// Name of the provider block in Terraform output.
    pub fn terraform_name(self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gce => "google",
            Provider::OpenStack => "openstack",
            Provider::DigitalOcean => "digitalocean",
            Provider::Scaleway => "scaleway",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Network,
    Subnet,
    LoadBalancer,
    ClassicLoadBalancer,
    Listener,
    TargetGroup,
    Instance,
    Firewall,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResourceState {
    Provisioning,
    #[default]
    Active,
    Failed,
}

/// A cloud resource as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: String,
    pub name: String,
    /// ID of the owning resource, e.g. the load balancer of a listener.
    pub parent: Option<String>,
    pub tags: Tags,
    pub state: ResourceState,
    pub attributes: serde_json::Value,
}

impl Resource {
    /// Decodes the provider attributes into the typed view of a task.
    pub fn attributes<A: DeserializeOwned>(&self) -> Result<A, TaskError> {
        Ok(serde_json::from_value(self.attributes.clone())?)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Request body for creating a resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSpec {
    pub name: String,
    pub parent: Option<String>,
    pub tags: Tags,
    pub attributes: serde_json::Value,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: serde_json::Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_attributes<A: Serialize>(mut self, attributes: &A) -> Result<Self, TaskError> {
        self.attributes = serde_json::to_value(attributes)?;
        Ok(self)
    }
}

/// Selects resources in [`Cloud::list`]. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub name: Option<String>,
    pub parent: Option<String>,
    pub tags: Tags,
}

impl Filter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_parent(parent: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if self.name.as_ref().is_some_and(|name| *name != resource.name) {
            return false;
        }
        if self.parent.is_some() && self.parent != resource.parent {
            return false;
        }
        self.tags
            .iter()
            .all(|(key, value)| resource.tag(key) == Some(value.as_str()))
    }
}

/// A single page of results, with the token for the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

/// A provider account in a single region.
pub trait Cloud: Send + Sync {
    fn provider(&self) -> Provider;

    fn region(&self) -> &str;

    fn list(
        &self,
        kind: ResourceKind,
        filter: &Filter,
        page: Option<&str>,
    ) -> Result<Page<Resource>, CloudError>;

    fn get(&self, kind: ResourceKind, id: &str) -> Result<Resource, CloudError>;

    fn create(&self, kind: ResourceKind, spec: ResourceSpec) -> Result<Resource, CloudError>;

    /// Merges `patch` into the attributes of the resource.
    fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<Resource, CloudError>;

    fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), CloudError>;

    fn set_tags(&self, kind: ResourceKind, id: &str, tags: &Tags) -> Result<(), CloudError>;

    fn remove_tags(&self, kind: ResourceKind, id: &str, keys: &[String]) -> Result<(), CloudError>;
}

/// Lists every page of `kind` matching `filter`, each page under the read
/// policy.
pub fn list_all(
    ctx: &Context,
    cloud: &dyn Cloud,
    kind: ResourceKind,
    filter: &Filter,
) -> Result<Vec<Resource>, TaskError> {
    let mut items = Vec::new();
    let mut token: Option<String> = None;

    loop {
        let page = ctx.read(&format!("list {kind}"), || {
            cloud.list(kind, filter, token.as_deref())
        })?;
        items.extend(page.items);

        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(items)
}

/// Looks up a resource by ID, treating "not found" as absence.
pub fn get_optional(
    ctx: &Context,
    cloud: &dyn Cloud,
    kind: ResourceKind,
    id: &str,
) -> Result<Option<Resource>, TaskError> {
    match ctx.read(&format!("get {kind} {id}"), || cloud.get(kind, id)) {
        Ok(resource) => Ok(Some(resource)),
        Err(TaskError::Cloud(err)) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Finds the single resource matching `filter`. More than one match means the
/// cloud holds state this plan cannot reason about.
pub fn find_one(
    ctx: &Context,
    cloud: &dyn Cloud,
    kind: ResourceKind,
    filter: &Filter,
) -> Result<Option<Resource>, TaskError> {
    let mut found = list_all(ctx, cloud, kind, filter)?;
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        n => Err(TaskError::invalid(format!(
            "found {n} {kind} resources matching {filter:?}, expected at most one"
        ))),
    }
}

/// Finds the single resource carrying `Name=<name>`.
pub fn find_by_name_tag(
    ctx: &Context,
    cloud: &dyn Cloud,
    kind: ResourceKind,
    name: &str,
) -> Result<Option<Resource>, TaskError> {
    find_one(ctx, cloud, kind, &Filter::any().with_tag(NAME_TAG, name))
}

type CloudFactory = Box<dyn Fn(&str) -> Result<Arc<dyn Cloud>, CloudError> + Send + Sync>;

/// Per-region clouds for a single apply run.
///
/// Clients for regions other than the default one are created lazily through
/// the factory and kept for the lifetime of the pool. Dropping the pool drops
/// the clients.
pub struct CloudPool {
    default: Arc<dyn Cloud>,
    regions: Mutex<BTreeMap<String, Arc<dyn Cloud>>>,
    factory: Option<CloudFactory>,
}

impl CloudPool {
    pub fn new(default: Arc<dyn Cloud>) -> Self {
        let mut regions = BTreeMap::new();
        regions.insert(default.region().to_string(), default.clone());
        Self {
            default,
            regions: Mutex::new(regions),
            factory: None,
        }
    }

    /// Registers an already constructed cloud for its region.
    pub fn with_region(self, cloud: Arc<dyn Cloud>) -> Self {
        if let Ok(mut regions) = self.regions.lock() {
            regions.insert(cloud.region().to_string(), cloud);
        }
        self
    }

    pub fn with_factory(
        mut self,
        factory: impl Fn(&str) -> Result<Arc<dyn Cloud>, CloudError> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn provider(&self) -> Provider {
        self.default.provider()
    }

    pub fn default_region(&self) -> &str {
        self.default.region()
    }

    pub fn default_cloud(&self) -> Arc<dyn Cloud> {
        self.default.clone()
    }

    pub fn region(&self, region: &str) -> Result<Arc<dyn Cloud>, CloudError> {
        let mut regions = self
            .regions
            .lock()
            .map_err(|_| CloudError::Other("cloud pool lock poisoned".into()))?;

        if let Some(cloud) = regions.get(region) {
            return Ok(cloud.clone());
        }

        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| CloudError::Other(format!("no cloud configured for region {region}")))?;

        tracing::debug!(region, "Creating cloud client");
        let cloud = factory(region)?;
        regions.insert(region.to_string(), cloud.clone());
        Ok(cloud)
    }
}
