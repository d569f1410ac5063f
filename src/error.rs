use std::fmt::Write;

use thiserror::Error;

use crate::cloud::ResourceKind;
use crate::link::TaskKey;

/// Errors returned by a [`Cloud`](crate::cloud::Cloud) implementation.
///
/// The variants are deliberately coarse: the engine only needs to know
/// whether a call can be retried and whether a resource is simply absent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

impl CloudError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        CloudError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }

    /// Throttling and eventual-consistency gaps are worth another attempt,
    /// everything else is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Throttled(_) | CloudError::Unavailable(_))
    }
}

/// Failure of a single task while diffing, validating or rendering.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Field is required: {0}")]
    RequiredField(&'static str),

    #[error("Field cannot be changed: {0}")]
    CannotChangeField(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error("Resource does not exist, but its lifecycle requires it to")]
    MissingResource,

    #[error("Resource differs from the expected state in: {}", .0.join(", "))]
    Drift(Vec<&'static str>),

    #[error("Rendering {0} is not supported for this target")]
    Unsupported(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Couldn't decode cloud resource attributes.\n{0}")]
    Attributes(#[from] serde_json::Error),

    #[error(transparent)]
    Terraform(#[from] TerraformError),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn invalid(message: impl Into<String>) -> Self {
        TaskError::Invalid(message.into())
    }

    /// Validation errors are never retried and never reach a render call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TaskError::RequiredField(_)
                | TaskError::CannotChangeField(_)
                | TaskError::Invalid(_)
                | TaskError::Drift(_)
        )
    }
}

/// Errors that make the task graph itself untrustworthy. These abort the whole
/// apply before any cloud mutation happens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task of kind '{0}' has an empty name")]
    Unnamed(&'static str),

    #[error("Task {0} was registered twice with different definitions")]
    DuplicateTask(TaskKey),

    #[error("Task {task} depends on {dependency}, which was never registered")]
    UnknownDependency { task: TaskKey, dependency: TaskKey },

    #[error("Dependency cycle detected in task graph:\n{}", format_cycles(.0))]
    Cycle(Vec<Vec<TaskKey>>),
}

fn format_cycles(cycles: &[Vec<TaskKey>]) -> String {
    let mut out = String::new();
    for cycle in cycles {
        let names: Vec<_> = cycle.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "  - {}", names.join(" -> "));
    }
    out
}

/// Aggregated result of an apply that did not fully converge.
#[derive(Debug, Error)]
#[error("{}", describe_apply(self))]
pub struct ApplyError {
    /// Tasks that failed on their own.
    pub failed: Vec<(TaskKey, TaskError)>,
    /// Tasks that were never attempted because a dependency failed.
    pub blocked: Vec<(TaskKey, TaskKey)>,
    /// Tasks that were not started before the run was cancelled.
    pub cancelled: Vec<TaskKey>,
    /// Deletions that were attempted and failed.
    pub deletions: Vec<(String, TaskError)>,
}

fn describe_apply(err: &ApplyError) -> String {
    let mut out = format!(
        "{} task(s) failed, {} blocked, {} cancelled",
        err.failed.len(),
        err.blocked.len(),
        err.cancelled.len()
    );

    for (key, error) in &err.failed {
        let _ = write!(out, "\n  {key}: {error}");
    }
    for (key, by) in &err.blocked {
        let _ = write!(out, "\n  {key}: blocked by {by}");
    }
    for key in &err.cancelled {
        let _ = write!(out, "\n  {key}: cancelled");
    }
    for (item, error) in &err.deletions {
        let _ = write!(out, "\n  delete {item}: {error}");
    }

    out
}

#[derive(Debug, Error)]
pub enum TerraformError {
    #[error("Resource {0}.{1} was rendered twice")]
    DuplicateResource(String, String),

    #[error("Couldn't write terraform output.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't serialize terraform resource.\n{0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(CloudError::Throttled("slow down".into()).is_transient());
        assert!(CloudError::Unavailable("503".into()).is_transient());
        assert!(!CloudError::Rejected("bad name".into()).is_transient());
        assert!(!CloudError::not_found(ResourceKind::LoadBalancer, "lb-1").is_transient());
        assert!(CloudError::not_found(ResourceKind::LoadBalancer, "lb-1").is_not_found());
    }

    #[test]
    fn cycle_report_lists_tasks() {
        let err = GraphError::Cycle(vec![vec![
            TaskKey::new("Test", "a"),
            TaskKey::new("Test", "b"),
            TaskKey::new("Test", "c"),
        ]]);
        let text = err.to_string();
        assert!(text.contains("Test/a -> Test/b -> Test/c"), "{text}");
    }

    #[test]
    fn apply_error_lists_failures_and_fallout() {
        let err = ApplyError {
            failed: vec![(TaskKey::new("Subnet", "a"), TaskError::RequiredField("Cidr"))],
            blocked: vec![(TaskKey::new("Instance", "b"), TaskKey::new("Subnet", "a"))],
            cancelled: vec![],
            deletions: vec![],
        };
        let text = err.to_string();
        assert!(text.starts_with("1 task(s) failed, 1 blocked, 0 cancelled"));
        assert!(text.contains("Subnet/a: Field is required: Cidr"));
        assert!(text.contains("Instance/b: blocked by Subnet/a"));
    }
}
