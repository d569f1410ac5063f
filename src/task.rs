use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::core::{Context, Field, Lifecycle};
use crate::error::TaskError;
use crate::executor::TaskState;
use crate::executor::report::Outcome;
use crate::link::TaskKey;
use crate::target::{ApiTarget, PlannedAction, Target, TerraformTarget};

/// The three views of a task handed to render.
///
/// `expected` is the normalized desired state. `changes` holds only the
/// fields that differ from `actual`, or all of `expected` when the resource
/// does not exist yet.
pub struct Delta<'a, T> {
    pub actual: Option<&'a T>,
    pub expected: &'a T,
    pub changes: &'a T,
}

impl<T> Clone for Delta<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Delta<'_, T> {}

/// The result of comparing actual with expected state.
#[derive(Debug, Clone, PartialEq)]
pub struct Changes<T> {
    /// A task instance populated only where expected differs from actual.
    pub delta: T,
    /// Names of the fields that differ.
    pub fields: Vec<&'static str>,
    /// Whether the resource has to be created.
    pub create: bool,
}

impl<T> Changes<T> {
    pub fn create(expected: T) -> Self {
        Self {
            delta: expected,
            fields: Vec::new(),
            create: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.create && self.fields.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|name| *name == field)
    }
}

/// Field-by-field comparison helper used by [`TypedTask::diff`].
///
/// Each method returns the value to store in the delta instance: the expected
/// value when it differs, or the "no change" value when it does not.
#[derive(Debug, Default)]
pub struct Differ {
    fields: Vec<&'static str>,
}

impl Differ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field<T: PartialEq + Clone>(
        &mut self,
        name: &'static str,
        actual: &Field<T>,
        expected: &Field<T>,
    ) -> Field<T> {
        if expected.is_unset() || expected == actual {
            return Field::Unset;
        }
        self.fields.push(name);
        expected.clone()
    }

    pub fn value<T: PartialEq + Clone + Default>(
        &mut self,
        name: &'static str,
        actual: &T,
        expected: &T,
    ) -> T {
        if expected == actual {
            return T::default();
        }
        self.fields.push(name);
        expected.clone()
    }

    /// Lists are compared as a whole, after normalize has sorted them.
    pub fn list<T: PartialEq + Clone>(
        &mut self,
        name: &'static str,
        actual: &[T],
        expected: &[T],
    ) -> Vec<T> {
        if expected == actual {
            return Vec::new();
        }
        self.fields.push(name);
        expected.to_vec()
    }

    pub fn map(
        &mut self,
        name: &'static str,
        actual: &BTreeMap<String, String>,
        expected: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        if expected == actual {
            return BTreeMap::new();
        }
        self.fields.push(name);
        expected.clone()
    }

    pub fn finish<T>(self, delta: T) -> Changes<T> {
        Changes {
            delta,
            fields: self.fields,
            create: false,
        }
    }
}

/// Removes a resource that should no longer exist.
pub trait Deletion: Debug + Send + Sync {
    /// Kind of the resource, for reports.
    fn kind(&self) -> &str;

    /// A human readable identification of the resource.
    fn item(&self) -> String;

    fn delete(&self, ctx: &Context) -> Result<(), TaskError>;
}

/// A unit of infrastructure with a desired state.
///
/// Implementors describe how to discover the actual state of their resource
/// and how to move it towards the desired one. The engine calls the methods
/// in a fixed order: [`find`](Self::find) once, [`own`](Self::own) on the
/// desired state, [`normalize`](Self::normalize) on both sides,
/// [`fill_unset`](Self::fill_unset), [`diff`](Self::diff),
/// [`check_changes`](Self::check_changes) and finally one of the render
/// methods, depending on the target.
pub trait TypedTask: Clone + PartialEq + Debug + Send + Sync + 'static {
    /// Name of the task kind, unique within the process.
    const KIND: &'static str;

    fn name(&self) -> &str;

    fn lifecycle(&self) -> Lifecycle;

    /// Keys of the tasks that have to be done before this one starts.
    fn dependencies(&self) -> Vec<TaskKey> {
        Vec::new()
    }

    /// Discovers the actual state of the resource, `None` if absent.
    fn find(&self, ctx: &Context) -> Result<Option<Self>, TaskError>;

    /// Adds what the engine manages on every resource it owns, such as
    /// ownership tags. Runs on the desired state only, so the same values
    /// missing from the live resource show up as changes.
    fn own(&mut self, _ctx: &Context) -> Result<(), TaskError> {
        Ok(())
    }

    /// Puts the task into canonical form. Must be idempotent.
    fn normalize(&mut self, _ctx: &Context) -> Result<(), TaskError> {
        Ok(())
    }

    /// Copies values from the actual resource into fields the desired state
    /// has no opinion on, or cannot change.
    fn fill_unset(&mut self, _actual: &Self) {}

    /// Records identifiers of an existing resource into the task's outputs.
    fn publish(&self, _actual: &Self) {}

    fn diff(actual: &Self, expected: &Self) -> Changes<Self>;

    /// Rejects changes that cannot be rendered.
    fn check_changes(
        actual: Option<&Self>,
        expected: &Self,
        changes: &Self,
    ) -> Result<(), TaskError>;

    fn render_api(
        target: &ApiTarget,
        ctx: &Context,
        delta: Delta<'_, Self>,
    ) -> Result<(), TaskError>;

    fn render_terraform(
        _target: &TerraformTarget,
        _ctx: &Context,
        _delta: Delta<'_, Self>,
    ) -> Result<(), TaskError> {
        Err(TaskError::Unsupported(Self::KIND.to_string()))
    }

    /// Deletion of the actual resource, used when the lifecycle is
    /// [`Lifecycle::NotExists`].
    fn deletion(&self, _actual: &Self) -> Option<Box<dyn Deletion>> {
        None
    }

    /// Resources this task replaces and which should be removed once the
    /// whole plan has been applied.
    fn find_deletions(&self, _ctx: &Context) -> Result<Vec<Box<dyn Deletion>>, TaskError> {
        Ok(Vec::new())
    }

    /// Addresses under which the cluster API becomes reachable.
    fn api_addresses(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The type-erased face of [`TypedTask`], stored in the task graph.
pub(crate) trait Task: Send + Sync {
    fn key(&self) -> TaskKey;

    fn dependencies(&self) -> Vec<TaskKey>;

    fn run(&self, ctx: &Context, target: &Target) -> Result<Outcome, TaskError>;

    fn find_deletions(&self, ctx: &Context) -> Result<Vec<Box<dyn Deletion>>, TaskError>;

    fn api_addresses(&self) -> Vec<String>;
}

impl<T: TypedTask> Task for T {
    fn key(&self) -> TaskKey {
        TaskKey::new(T::KIND, self.name())
    }

    fn dependencies(&self) -> Vec<TaskKey> {
        T::dependencies(self)
    }

    fn run(&self, ctx: &Context, target: &Target) -> Result<Outcome, TaskError> {
        run_task(self, ctx, target)
    }

    fn find_deletions(&self, ctx: &Context) -> Result<Vec<Box<dyn Deletion>>, TaskError> {
        T::find_deletions(self, ctx)
    }

    fn api_addresses(&self) -> Vec<String> {
        T::api_addresses(self)
    }
}

/// Drives one task through find, diff, validation and render.
fn run_task<T: TypedTask>(task: &T, ctx: &Context, target: &Target) -> Result<Outcome, TaskError> {
    let key = TaskKey::new(T::KIND, task.name());
    let lifecycle = ctx.options.lifecycle_for(T::KIND, task.lifecycle());

    if lifecycle == Lifecycle::Ignore {
        tracing::debug!(task = %key, "Lifecycle is Ignore, skipping");
        return Ok(Outcome::Skipped);
    }

    ctx.transition(TaskState::Diffing);
    let mut actual = task.find(ctx)?;
    if let Some(actual) = &actual {
        task.publish(actual);
    }

    if lifecycle == Lifecycle::NotExists {
        return remove_existing(task, actual.as_ref(), ctx, target, &key);
    }

    let mut expected = task.clone();
    expected.own(ctx)?;
    expected.normalize(ctx)?;
    if let Some(actual) = actual.as_mut() {
        actual.normalize(ctx)?;
        expected.fill_unset(actual);
    }

    let changes = match &actual {
        Some(actual) => T::diff(actual, &expected),
        None => Changes::create(expected.clone()),
    };
    tracing::debug!(
        task = %key,
        create = changes.create,
        fields = ?changes.fields,
        "Computed changes"
    );

    if lifecycle.is_read_only() {
        if actual.is_none() {
            return Err(TaskError::MissingResource);
        }
        if changes.is_empty() {
            return Ok(Outcome::Unchanged);
        }
        if lifecycle == Lifecycle::ExistsAndWarnIfChanges {
            tracing::warn!(
                task = %key,
                fields = ?changes.fields,
                "Resource differs from the expected state, leaving it alone"
            );
            return Ok(Outcome::Warned(changes.fields));
        }
        return Err(TaskError::Drift(changes.fields));
    }

    // Terraform output describes every resource, converged or not.
    if changes.is_empty() && !matches!(target, Target::Terraform(_)) {
        tracing::debug!(task = %key, "No changes");
        return Ok(Outcome::Unchanged);
    }

    ctx.transition(TaskState::Validating);
    T::check_changes(actual.as_ref(), &expected, &changes.delta)?;

    ctx.transition(TaskState::Rendering);
    let delta = Delta {
        actual: actual.as_ref(),
        expected: &expected,
        changes: &changes.delta,
    };

    match target {
        Target::Api(api) => T::render_api(api, ctx, delta)?,
        Target::Terraform(terraform) => T::render_terraform(terraform, ctx, delta)?,
        Target::DryRun(dry_run) => {
            let action = if changes.create {
                PlannedAction::Create
            } else {
                PlannedAction::Update(changes.fields.clone())
            };
            dry_run.record(key.clone(), action);
        }
    }

    Ok(if changes.create {
        tracing::info!(task = %key, "Created");
        Outcome::Created
    } else if changes.is_empty() {
        Outcome::Unchanged
    } else {
        tracing::info!(task = %key, fields = ?changes.fields, "Updated");
        Outcome::Updated(changes.fields)
    })
}

fn remove_existing<T: TypedTask>(
    task: &T,
    actual: Option<&T>,
    ctx: &Context,
    target: &Target,
    key: &TaskKey,
) -> Result<Outcome, TaskError> {
    let Some(actual) = actual else {
        return Ok(Outcome::Unchanged);
    };

    let deletion = task
        .deletion(actual)
        .ok_or_else(|| TaskError::Unsupported(format!("deleting {}", T::KIND)))?;

    ctx.transition(TaskState::Rendering);
    match target {
        Target::Api(_) => {
            tracing::info!(
                task = %key,
                item = %deletion.item(),
                "Deleting resource that should not exist"
            );
            deletion.delete(ctx)?;
        }
        Target::Terraform(_) => {
            tracing::warn!(
                task = %key,
                item = %deletion.item(),
                "Terraform target does not delete resources"
            );
            return Ok(Outcome::Skipped);
        }
        Target::DryRun(dry_run) => dry_run.record(
            key.clone(),
            PlannedAction::Delete {
                kind: deletion.kind().to_string(),
                item: deletion.item(),
            },
        ),
    }

    Ok(Outcome::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differ_ignores_unset_expected() {
        let mut differ = Differ::new();
        let delta = differ.field("Cidr", &Field::Set("10.0.0.0/16".to_string()), &Field::Unset);
        assert_eq!(delta, Field::Unset);

        let zone = Field::Set("a".to_string());
        let delta = differ.field("Zone", &zone, &zone);

        assert_eq!(delta, Field::Unset);

        let changes = differ.finish(());
        assert!(changes.is_empty());
    }

    #[test]
    fn differ_collects_changed_fields() {
        let mut differ = Differ::new();
        let cidr = differ.field("Cidr", &Field::Unset, &Field::Set("10.0.0.0/16".to_string()));
        let list = differ.list("Ports", &[80, 443], &[443]);
        let same = differ.list("Tags", &["a"], &["a"]);
        let count = differ.value("Count", &1u32, &3u32);

        assert_eq!(cidr.as_deref(), Some("10.0.0.0/16"));
        assert_eq!(list, vec![443]);
        assert!(same.is_empty());
        assert_eq!(count, 3);

        let changes = differ.finish(());
        assert_eq!(changes.fields, vec!["Cidr", "Ports", "Count"]);
        assert!(changes.contains("Ports"));
        assert!(!changes.contains("Tags"));
    }

    #[test]
    fn empty_is_a_change_from_set() {
        let mut differ = Differ::new();
        let delta = differ.field("Policy", &Field::Set("strict".to_string()), &Field::Empty);
        assert_eq!(delta, Field::Empty);
        assert!(!differ.finish(()).is_empty());
    }
}
