//! Where rendered changes go.

pub mod terraform;

use std::fmt::Display;
use std::sync::Mutex;

use crate::cloud::{Cloud, ResourceKind, Tags};
use crate::core::Context;
use crate::error::TaskError;
use crate::link::TaskKey;

pub use terraform::{Literal, TerraformTarget};

/// Selects how the executor renders changes.
pub enum Target {
    /// Apply changes directly through the cloud APIs.
    Api(ApiTarget),
    /// Describe the desired state as Terraform JSON.
    Terraform(TerraformTarget),
    /// Record what would change without touching anything.
    DryRun(DryRunTarget),
}

impl Target {
    pub fn api() -> Self {
        Target::Api(ApiTarget::new())
    }

    pub fn dry_run() -> Self {
        Target::DryRun(DryRunTarget::new())
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, Target::DryRun(_))
    }

    pub fn as_dry_run(&self) -> Option<&DryRunTarget> {
        match self {
            Target::DryRun(target) => Some(target),
            _ => None,
        }
    }
}

/// Tag keys managed by the provider itself, never added or removed by us.
const RESERVED_TAG_PREFIXES: &[&str] = &["aws:", "goog-", "openstack:"];

fn is_reserved_tag(key: &str) -> bool {
    RESERVED_TAG_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// Applies changes through live cloud calls.
#[derive(Debug, Default)]
pub struct ApiTarget {}

impl ApiTarget {
    pub fn new() -> Self {
        Self {}
    }

    /// Brings the tags of a resource from `actual` to `expected`, adding or
    /// overwriting first and removing stale keys afterwards.
    pub fn sync_tags(
        &self,
        ctx: &Context,
        cloud: &dyn Cloud,
        kind: ResourceKind,
        id: &str,
        actual: &Tags,
        expected: &Tags,
    ) -> Result<(), TaskError> {
        let add: Tags = expected
            .iter()
            .filter(|(key, value)| !is_reserved_tag(key) && actual.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let remove: Vec<String> = actual
            .keys()
            .filter(|key| !is_reserved_tag(key) && !expected.contains_key(*key))
            .cloned()
            .collect();

        if !add.is_empty() {
            tracing::debug!(%kind, id, tags = ?add, "Adding tags");
            ctx.write(&format!("tag {kind} {id}"), || cloud.set_tags(kind, id, &add))?;
        }

        if !remove.is_empty() {
            tracing::debug!(%kind, id, tags = ?remove, "Removing tags");
            ctx.write(&format!("untag {kind} {id}"), || cloud.remove_tags(kind, id, &remove))?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Create,
    Update(Vec<&'static str>),
    Delete { kind: String, item: String },
}

impl Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannedAction::Create => f.write_str("create"),
            PlannedAction::Update(fields) => write!(f, "update {}", fields.join(", ")),
            PlannedAction::Delete { kind, item } => write!(f, "delete {kind} {item}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub key: TaskKey,
    pub action: PlannedAction,
}

/// Collects the changes an apply would make.
#[derive(Debug, Default)]
pub struct DryRunTarget {
    changes: Mutex<Vec<PlannedChange>>,
}

impl DryRunTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, key: TaskKey, action: PlannedAction) {
        tracing::info!(task = %key, %action, "Would apply");
        match self.changes.lock() {
            Ok(mut changes) => changes.push(PlannedChange { key, action }),
            Err(poisoned) => poisoned.into_inner().push(PlannedChange { key, action }),
        }
    }

    /// The planned changes, sorted by task key.
    pub fn changes(&self) -> Vec<PlannedChange> {
        let mut changes = match self.changes.lock() {
            Ok(changes) => changes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cloud::mock::{MockCloud, Operation};
    use crate::cloud::{CloudPool, Provider, ResourceSpec};
    use crate::core::{ApplyOptions, CancelToken};
    use crate::retry::BackoffPolicies;

    #[test]
    fn sync_tags_adds_and_removes() {
        let cloud = Arc::new(MockCloud::new(Provider::Aws, "us-east-1"));
        let actual = Tags::from([
            ("Name".to_string(), "api".to_string()),
            ("stale".to_string(), "yes".to_string()),
            ("aws:cloudformation:stack-name".to_string(), "x".to_string()),
        ]);
        let resource = cloud.insert(
            ResourceKind::LoadBalancer,
            ResourceSpec::new("api").with_tags(actual.clone()),
        );

        let expected = Tags::from([
            ("Name".to_string(), "api".to_string()),
            ("owner".to_string(), "infra".to_string()),
        ]);

        let pool = CloudPool::new(cloud.clone());
        let options = ApplyOptions::default().with_backoff(BackoffPolicies::immediate());
        let cancel = CancelToken::new();
        let ctx = Context::new(&pool, &options, &cancel);

        ApiTarget::new()
            .sync_tags(
                &ctx,
                cloud.as_ref(),
                ResourceKind::LoadBalancer,
                &resource.id,
                &actual,
                &expected,
            )

            .unwrap();

        let tags = cloud
            .resource(ResourceKind::LoadBalancer, &resource.id)
            .unwrap()
            .tags;
        assert_eq!(tags.get("owner").map(String::as_str), Some("infra"));
        assert!(!tags.contains_key("stale"));
        assert!(tags.contains_key("aws:cloudformation:stack-name"));
        assert_eq!(cloud.calls(Operation::SetTags), 1);
        assert_eq!(cloud.calls(Operation::RemoveTags), 1);
    }

    #[test]
    fn dry_run_sorts_changes() {
        let target = DryRunTarget::new();
        target.record(TaskKey::new("Subnet", "b"), PlannedAction::Create);
        target.record(TaskKey::new("Network", "a"), PlannedAction::Update(vec!["Tags"]));

        let changes = target.changes();
        assert_eq!(changes[0].key, TaskKey::new("Network", "a"));
        assert_eq!(changes[0].action.to_string(), "update Tags");
        assert_eq!(changes[1].action, PlannedAction::Create);
    }
}
