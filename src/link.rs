use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::task::TypedTask;

/// Identity of a task: its kind plus a name unique within that kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskKey {
    pub kind: &'static str,
    pub name: String,
}

impl TaskKey {
    pub fn new(kind: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn of<T: TypedTask>(name: impl Into<String>) -> Self {
        Self::new(T::KIND, name)
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A typed reference to another task.
///
/// Links handed out by the [`Registry`](crate::Registry) point at the
/// registered task, so reading a [`Resolved`] output through a link sees the
/// value once the target task has been rendered. Dependencies are declared
/// by returning [`Link::key`] from [`TypedTask::dependencies`].
///
/// Two links are equal when they point at the same task identity, which is
/// also how actual and expected references are compared while diffing.
pub struct Link<T> {
    task: Arc<T>,
}

impl<T: TypedTask> Link<T> {
    pub(crate) fn new(task: Arc<T>) -> Self {
        Self { task }
    }

    /// A link to a task that is not registered anywhere.
    ///
    /// Used when discovering actual state that references resources the
    /// current plan knows nothing about.
    pub fn detached(task: T) -> Self {
        Self {
            task: Arc::new(task),
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(T::KIND, self.task.name())
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
        }
    }
}

impl<T> Deref for Link<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.task
    }
}

impl<T: TypedTask> PartialEq for Link<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.task, &other.task) || self.name() == other.name()
    }
}

impl<T: TypedTask> Eq for Link<T> {}

impl<T: TypedTask> Hash for Link<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

impl<T: TypedTask> Debug for Link<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Link({})", self.key())
    }
}

/// A write-once output of a task, such as a provider-assigned ID or ARN.
///
/// All clones share the same cell, so the value written by the owning task
/// while it runs is visible through every link to it. Nothing but the owning
/// task may write it.
pub struct Resolved<T> {
    cell: Arc<OnceLock<T>>,
}

impl<T> Resolved<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// A cell that already holds a value, for resources known up front.
    pub fn known(value: T) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(value);
        Self {
            cell: Arc::new(cell),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: PartialEq + Debug> Resolved<T> {
    /// Records the value. A second write with the same value is a no-op, a
    /// second write with a different value is ignored and logged.
    pub fn set(&self, value: T) {
        if let Err(value) = self.cell.set(value)
            && self.cell.get() != Some(&value)
        {
            tracing::warn!(
                current = ?self.cell.get(),
                ignored = ?value,
                "Resolved value was already set"
            );
        }
    }
}

impl<T: Clone> Resolved<T> {
    pub fn cloned(&self) -> Option<T> {
        self.cell.get().cloned()
    }
}

impl<T> Default for Resolved<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Resolved<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: PartialEq> PartialEq for Resolved<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cell.get() == other.cell.get()
    }
}

impl<T: Debug> Debug for Resolved<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cell.get() {
            Some(value) => write!(f, "Resolved({value:?})"),
            None => f.write_str("Unresolved"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_is_shared_and_write_once() {
        let arn: Resolved<String> = Resolved::new();
        let copy = arn.clone();
        assert!(!copy.is_resolved());

        arn.set("arn:1".to_string());
        arn.set("arn:2".to_string());

        assert_eq!(copy.get().map(String::as_str), Some("arn:1"));
    }

    #[test]
    fn task_key_display() {
        assert_eq!(
            TaskKey::new("Subnet", "us-east-1a.cluster1").to_string(),
            "Subnet/us-east-1a.cluster1"
        );

    }
}
