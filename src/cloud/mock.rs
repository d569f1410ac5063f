//! An in-memory [`Cloud`] for tests and local dry runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::cloud::{
    Cloud, Filter, Page, Provider, Resource, ResourceKind, ResourceSpec, ResourceState, Tags,
};
use crate::error::CloudError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
    SetTags,
    RemoveTags,
}

impl Operation {
    pub fn is_mutating(self) -> bool {
        !matches!(self, Operation::List | Operation::Get)
    }
}

#[derive(Default)]
struct State {
    resources: BTreeMap<(ResourceKind, String), Resource>,
    /// Remaining `get` calls before a provisioning resource turns active.
    provisioning: HashMap<String, u32>,
    calls: HashMap<Operation, usize>,
    faults: VecDeque<(Operation, CloudError)>,
    next_id: u64,
}

impl State {
    fn record(&mut self, op: Operation) -> Result<(), CloudError> {
        *self.calls.entry(op).or_default() += 1;

        match self.faults.iter().position(|(fault, _)| *fault == op) {
            Some(index) => match self.faults.remove(index) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn resource_mut(&mut self, kind: ResourceKind, id: &str) -> Result<&mut Resource, CloudError> {
        self.resources
            .get_mut(&(kind, id.to_string()))
            .ok_or_else(|| CloudError::not_found(kind, id))
    }
}

/// Keeps resources in a map and counts every call made against it.
///
/// Load balancers and instances start out [`ResourceState::Provisioning`]
/// and turn active after a configurable number of `get` calls, which lets
/// tests exercise the wait loops of render.
pub struct MockCloud {
    provider: Provider,
    region: String,
    page_size: usize,
    provisioning_polls: u32,
    state: Mutex<State>,
}

impl MockCloud {
    pub fn new(provider: Provider, region: impl Into<String>) -> Self {
        Self {
            provider,
            region: region.into(),
            page_size: 50,
            provisioning_polls: 1,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_provisioning_polls(mut self, polls: u32) -> Self {
        self.provisioning_polls = polls;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Seeds a resource without counting it as a call.
    pub fn insert(&self, kind: ResourceKind, spec: ResourceSpec) -> Resource {
        let mut state = self.state();
        let resource = self.build(&mut state, kind, spec, ResourceState::Active);
        state
            .resources
            .insert((kind, resource.id.clone()), resource.clone());
        resource
    }

    /// Makes the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: Operation, err: CloudError) {
        self.state().faults.push_back((op, err));
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of calls that could have changed the cloud.
    pub fn mutations(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(op, _)| op.is_mutating())
            .map(|(_, count)| count)
            .sum()
    }

    pub fn reset_calls(&self) {
        self.state().calls.clear();
    }

    pub fn resources(&self, kind: ResourceKind) -> Vec<Resource> {
        self.state()
            .resources
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn resource(&self, kind: ResourceKind, id: &str) -> Option<Resource> {
        self.state().resources.get(&(kind, id.to_string())).cloned()
    }

    fn build(
        &self,
        state: &mut State,
        kind: ResourceKind,
        spec: ResourceSpec,
        status: ResourceState,
    ) -> Resource {
        state.next_id += 1;
        let id = format!("{}-{:06}", id_prefix(kind), state.next_id);

        let mut attributes = match spec.attributes {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        let mut generated = |key: &str, value: String| {
            attributes
                .entry(key.to_string())
                .or_insert(serde_json::Value::String(value));
        };

        match kind {
            ResourceKind::LoadBalancer => {
                let arn = format!("arn:mock:{}:loadbalancer/{}/{id}", self.region, spec.name);
                generated("arn", arn);
                generated("dns_name", format!("{}-{id}.elb.{}.mock", spec.name, self.region));
                generated("hosted_zone_id", "ZMOCK0000001".to_string());
            }
            ResourceKind::TargetGroup => {
                let arn = format!("arn:mock:{}:targetgroup/{}/{id}", self.region, spec.name);
                generated("arn", arn);
            }
            ResourceKind::ClassicLoadBalancer => {
                generated("dns_name", format!("{}-{id}.clb.{}.mock", spec.name, self.region));
            }
            ResourceKind::Instance => {
                let n = state.next_id;
                generated("private_ip", format!("10.0.{}.{}", (n / 250) % 250, n % 250 + 2));
                // Logical clock, one tick per created resource.
                generated("creation_date", format!("2024-01-01T00:00:00.{n:06}Z"));
            }
            _ => {}
        }

        Resource {
            kind,
            id,
            name: spec.name,
            parent: spec.parent,
            tags: spec.tags,
            state: status,
            attributes: serde_json::Value::Object(attributes),
        }
    }
}

fn id_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Network => "net",
        ResourceKind::Subnet => "subnet",
        ResourceKind::LoadBalancer => "lb",
        ResourceKind::ClassicLoadBalancer => "clb",
        ResourceKind::Listener => "listener",
        ResourceKind::TargetGroup => "tg",
        ResourceKind::Instance => "srv",
        ResourceKind::Firewall => "fw",
    }
}

impl Cloud for MockCloud {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn region(&self) -> &str {
        &self.region
    }

    fn list(
        &self,
        kind: ResourceKind,
        filter: &Filter,
        page: Option<&str>,
    ) -> Result<Page<Resource>, CloudError> {
        let mut state = self.state();
        state.record(Operation::List)?;

        let start = match page {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| CloudError::Rejected(format!("invalid page token {token}")))?,
            None => 0,
        };

        let matching: Vec<_> = state
            .resources
            .values()
            .filter(|r| r.kind == kind && filter.matches(r))
            .collect();

        let end = (start + self.page_size).min(matching.len());
        let items = matching
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let next = (end < matching.len()).then(|| end.to_string());

        Ok(Page { items, next })
    }

    fn get(&self, kind: ResourceKind, id: &str) -> Result<Resource, CloudError> {
        let mut state = self.state();
        state.record(Operation::Get)?;

        let activate = match state.provisioning.get_mut(id) {
            Some(remaining) if *remaining > 1 => {
                *remaining -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };

        if activate {
            state.provisioning.remove(id);
            state.resource_mut(kind, id)?.state = ResourceState::Active;
        }

        state
            .resources
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| CloudError::not_found(kind, id))
    }

    fn create(&self, kind: ResourceKind, spec: ResourceSpec) -> Result<Resource, CloudError> {
        let mut state = self.state();
        state.record(Operation::Create)?;

        if spec.name.is_empty() {
            return Err(CloudError::Rejected(format!("{kind} name must not be empty")));
        }
        if let Some(parent) = &spec.parent
            && !state.resources.keys().any(|(_, id)| id == parent)
        {
            return Err(CloudError::Rejected(format!("parent {parent} of {kind} does not exist")));
        }

        let provisions = matches!(kind, ResourceKind::LoadBalancer | ResourceKind::Instance)
            && self.provisioning_polls > 0;
        let status = if provisions {
            ResourceState::Provisioning
        } else {
            ResourceState::Active
        };

        let resource = self.build(&mut state, kind, spec, status);
        if provisions {
            state
                .provisioning
                .insert(resource.id.clone(), self.provisioning_polls);
        }
        state
            .resources
            .insert((kind, resource.id.clone()), resource.clone());

        Ok(resource)
    }

    fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<Resource, CloudError> {

        let mut state = self.state();
        state.record(Operation::Update)?;

        let resource = state.resource_mut(kind, id)?;
        let serde_json::Value::Object(patch) = patch else {
            return Err(CloudError::Rejected("update patch must be an object".into()));
        };

        if let serde_json::Value::Object(attributes) = &mut resource.attributes {
            attributes.extend(patch);
        } else {
            resource.attributes = serde_json::Value::Object(patch);
        }

        Ok(resource.clone())
    }

    fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), CloudError> {
        let mut state = self.state();
        state.record(Operation::Delete)?;

        state.provisioning.remove(id);
        state
            .resources
            .remove(&(kind, id.to_string()))
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(kind, id))
    }

    fn set_tags(&self, kind: ResourceKind, id: &str, tags: &Tags) -> Result<(), CloudError> {
        let mut state = self.state();
        state.record(Operation::SetTags)?;

        let resource = state.resource_mut(kind, id)?;
        resource
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn remove_tags(&self, kind: ResourceKind, id: &str, keys: &[String]) -> Result<(), CloudError> {
        let mut state = self.state();
        state.record(Operation::RemoveTags)?;

        let resource = state.resource_mut(kind, id)?;
        for key in keys {
            resource.tags.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_resources_turn_active_after_polls() {
        let cloud = MockCloud::new(Provider::Aws, "us-east-1").with_provisioning_polls(2);
        let lb = cloud
            .create(ResourceKind::LoadBalancer, ResourceSpec::new("api"))
            .unwrap();
        assert_eq!(lb.state, ResourceState::Provisioning);

        let first = cloud.get(ResourceKind::LoadBalancer, &lb.id).unwrap();
        assert_eq!(first.state, ResourceState::Provisioning);
        let second = cloud.get(ResourceKind::LoadBalancer, &lb.id).unwrap();
        assert_eq!(second.state, ResourceState::Active);
    }

    #[test]
    fn generated_attributes() {
        let cloud = MockCloud::new(Provider::Aws, "us-east-1");
        let tg = cloud
            .create(ResourceKind::TargetGroup, ResourceSpec::new("tcp-api"))
            .unwrap();
        let arn = tg.attributes["arn"].as_str().unwrap();
        assert!(arn.contains("targetgroup/tcp-api/"));
    }

    #[test]
    fn faults_fire_once() {
        let cloud = MockCloud::new(Provider::Aws, "us-east-1");
        cloud.fail_next(Operation::Create, CloudError::Throttled("slow down".into()));

        assert!(cloud.create(ResourceKind::Network, ResourceSpec::new("a")).is_err());
        assert!(cloud.create(ResourceKind::Network, ResourceSpec::new("a")).is_ok());
        assert_eq!(cloud.calls(Operation::Create), 2);
        assert_eq!(cloud.mutations(), 2);
    }

    #[test]
    fn update_merges_attributes() {
        let cloud = MockCloud::new(Provider::Gce, "europe-west1");
        let spec = ResourceSpec::new("fw")
            .with_attributes(&serde_json::json!({ "priority": 1000, "disabled": false }))
            .unwrap();
        let fw = cloud.create(ResourceKind::Firewall, spec).unwrap();

        let updated = cloud
            .update(ResourceKind::Firewall, &fw.id, serde_json::json!({ "disabled": true }))
            .unwrap();
        assert_eq!(updated.attributes["priority"], 1000);
        assert_eq!(updated.attributes["disabled"], true);
    }

    #[test]
    fn children_need_an_existing_parent() {
        let cloud = MockCloud::new(Provider::Aws, "us-east-1");
        let err = cloud
            .create(ResourceKind::Listener, ResourceSpec::new("443").with_parent("lb-missing"))
            .unwrap_err();
        assert!(matches!(err, CloudError::Rejected(_)));
    }
}
