use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cloud::{Cloud, CloudPool};
use crate::error::{CloudError, TaskError};
use crate::executor::TaskState;
use crate::link::TaskKey;
use crate::retry::{self, BackoffPolicies};

/// What the engine is allowed to do about a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Create or update the resource as needed.
    #[default]
    Sync,
    /// The resource must exist and match, any difference is an error.
    ExistsAndValidates,
    /// The resource must exist, differences are only logged.
    ExistsAndWarnIfChanges,
    /// The resource must not exist, it gets deleted when found.
    NotExists,
    /// The task is skipped entirely.
    Ignore,
}

impl Lifecycle {
    /// Lifecycles under which the engine never mutates the resource.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Lifecycle::ExistsAndValidates | Lifecycle::ExistsAndWarnIfChanges | Lifecycle::Ignore
        )
    }
}

impl Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Lifecycle::Sync => "Sync",
            Lifecycle::ExistsAndValidates => "ExistsAndValidates",
            Lifecycle::ExistsAndWarnIfChanges => "ExistsAndWarnIfChanges",
            Lifecycle::NotExists => "NotExists",
            Lifecycle::Ignore => "Ignore",
        };
        f.write_str(text)
    }
}

/// A task field with three states.
///
/// `Unset` means the builder had no opinion, so the field never produces a
/// change and may be filled in from the actual resource. `Empty` is an
/// explicit request for "nothing", which is not the same thing on most clouds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Field<T> {
    #[default]
    Unset,
    Empty,
    Set(T),
}

impl<T> Field<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Field::Set(value),
            None => Field::Unset,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Field::Unset)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Field::Set(_))
    }

    /// The value, if one was set.
    pub fn get(&self) -> Option<&T> {
        match self {
            Field::Set(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Field<&T> {
        match self {
            Field::Unset => Field::Unset,
            Field::Empty => Field::Empty,
            Field::Set(value) => Field::Set(value),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Field<U> {
        match self {
            Field::Unset => Field::Unset,
            Field::Empty => Field::Empty,
            Field::Set(value) => Field::Set(f(value)),
        }
    }

    /// Copies the actual value when this side has no opinion.
    pub fn fill_from(&mut self, actual: &Field<T>)
    where
        T: Clone,
    {
        if self.is_unset() {
            *self = actual.clone();
        }
    }
}

impl<T: Clone + Default> Field<T> {
    pub fn value_or_default(&self) -> T {
        self.get().cloned().unwrap_or_default()
    }
}

impl Field<String> {
    pub fn as_deref(&self) -> Option<&str> {
        self.get().map(String::as_str)
    }
}

impl<T> From<T> for Field<T> {
    fn from(value: T) -> Self {
        Field::Set(value)
    }
}

/// Cooperative cancellation shared by the executor, retries and polls.
///
/// Cloning the token shares the flag, so cancelling any clone cancels all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone that additionally trips once `timeout` has elapsed.
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            flag: self.flag.clone(),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails fast with [`TaskError::Cancelled`] once the token has tripped.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    /// Sleeps for `duration` in short slices, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        const SLICE: Duration = Duration::from_millis(50);

        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep(SLICE.min(until - now));
        }
    }
}

/// Knobs for a single apply run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyOptions {
    /// Cluster the tasks belong to, used to tag owned resources.
    pub cluster_name: String,
    /// Upper bound on tasks running at the same time.
    pub max_concurrency: usize,
    pub backoff: BackoffPolicies,
    /// Wall-clock limit for the whole run.
    pub deadline: Option<Duration>,
    /// Per-kind lifecycle overrides, keyed by task kind.
    pub lifecycle_overrides: BTreeMap<String, Lifecycle>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            max_concurrency: 10,
            backoff: BackoffPolicies::default(),
            deadline: None,
            lifecycle_overrides: BTreeMap::new(),
        }
    }
}

impl ApplyOptions {
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicies) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_lifecycle(mut self, kind: impl Into<String>, lifecycle: Lifecycle) -> Self {
        self.lifecycle_overrides.insert(kind.into(), lifecycle);
        self
    }

    /// The lifecycle that applies to a task of `kind` declaring `declared`.
    pub fn lifecycle_for(&self, kind: &str, declared: Lifecycle) -> Lifecycle {
        self.lifecycle_overrides
            .get(kind)
            .copied()
            .unwrap_or(declared)
    }
}

/// Everything a task can reach while it runs.
pub struct Context<'a> {
    pub clouds: &'a CloudPool,
    pub options: &'a ApplyOptions,
    pub cancel: &'a CancelToken,
    pub(crate) key: Option<TaskKey>,
    pub(crate) span: tracing::Span,
    state: Mutex<TaskState>,
}

impl<'a> Context<'a> {
    pub fn new(clouds: &'a CloudPool, options: &'a ApplyOptions, cancel: &'a CancelToken) -> Self {
        Self {
            clouds,
            options,
            cancel,
            key: None,
            span: tracing::Span::none(),
            state: Mutex::new(TaskState::Pending),
        }
    }

    pub(crate) fn for_task(mut self, key: TaskKey, span: tracing::Span) -> Self {
        self.key = Some(key);
        self.span = span;
        self
    }

    /// The cloud for the default region.
    pub fn cloud(&self) -> Arc<dyn Cloud> {
        self.clouds.default_cloud()
    }

    pub fn cloud_in(&self, region: &str) -> Result<Arc<dyn Cloud>, TaskError> {
        Ok(self.clouds.region(region)?)
    }

    pub fn cluster_name(&self) -> &str {
        &self.options.cluster_name
    }

    /// Runs a read call under the read backoff policy.
    pub fn read<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, CloudError>,
    ) -> Result<T, TaskError> {
        retry::retry(&self.options.backoff.read, self.cancel, what, op)
    }

    /// Runs a create or update call under the write backoff policy.
    pub fn write<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, CloudError>,
    ) -> Result<T, TaskError> {
        retry::retry(&self.options.backoff.write, self.cancel, what, op)
    }

    pub fn delete<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, CloudError>,
    ) -> Result<T, TaskError> {
        retry::retry(&self.options.backoff.delete, self.cancel, what, op)
    }

    /// Polls `probe` under the poll policy until it reports `true`.
    pub fn wait_until(
        &self,
        what: &str,
        probe: impl FnMut() -> Result<bool, TaskError>,
    ) -> Result<(), TaskError> {
        self.span.pb_set_message(&format!("Waiting for {what}"));
        retry::wait_until(&self.options.backoff.poll, self.cancel, what, probe)
    }

    pub(crate) fn transition(&self, next: TaskState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !state.can_advance_to(next) {
            tracing::warn!(from = %*state, to = %next, "Unexpected task state transition");
        }
        *state = next;

        if let Some(key) = &self.key {
            tracing::trace!(task = %key, state = %next);
            self.span.pb_set_message(&format!("{next} {key}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_fill_only_when_unset() {
        let actual = Field::Set("lb-1234".to_string());

        let mut unset = Field::Unset;
        unset.fill_from(&actual);
        assert_eq!(unset, actual);

        let mut empty: Field<String> = Field::Empty;
        empty.fill_from(&actual);
        assert_eq!(empty, Field::Empty);

        let mut set = Field::Set("mine".to_string());
        set.fill_from(&actual);
        assert_eq!(set.as_deref(), Some("mine"));
    }

    #[test]
    fn field_accessors() {
        let field: Field<u16> = 443.into();
        assert!(field.is_set());
        assert_eq!(field.get(), Some(&443));
        assert_eq!(field.clone().map(u32::from), Field::Set(443u32));
        assert_eq!(Field::<u16>::Empty.value_or_default(), 0);
        assert_eq!(Field::from_option(None::<u16>), Field::Unset);
    }

    #[test]
    fn lifecycle_overrides_by_kind() {
        let options =
            ApplyOptions::default().with_lifecycle("Subnet", Lifecycle::ExistsAndWarnIfChanges);
        assert_eq!(
            options.lifecycle_for("Subnet", Lifecycle::Sync),
            Lifecycle::ExistsAndWarnIfChanges
        );
        assert_eq!(options.lifecycle_for("Network", Lifecycle::Sync), Lifecycle::Sync);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ApplyOptions = serde_json::from_str(
            r#"{
                "cluster_name": "cluster1",
                "lifecycle_overrides": { "Network": "ExistsAndValidates" }
            }"#,

        )
        .unwrap();

        assert_eq!(options.cluster_name, "cluster1");
        assert_eq!(options.max_concurrency, 10);
        assert_eq!(options.backoff, BackoffPolicies::default());
        assert_eq!(
            options.lifecycle_for("Network", Lifecycle::Sync),
            Lifecycle::ExistsAndValidates
        );
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn cancel_token_deadline() {
        let token = CancelToken::new().with_deadline(Duration::ZERO);
        assert!(token.is_cancelled());
        assert!(matches!(
            token.sleep(Duration::from_secs(60)),
            Err(TaskError::Cancelled)
        ));
    }
}
