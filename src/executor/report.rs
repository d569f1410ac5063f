use std::fmt::Write;
use std::time::{Duration, Instant};

use console::style;

use crate::error::{ApplyError, TaskError};
use crate::link::TaskKey;
use crate::registry::Plan;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// How a single task ended.
#[derive(Debug)]
pub enum Outcome {
    Created,
    Updated(Vec<&'static str>),
    Unchanged,
    /// The resource differs, but the lifecycle forbids touching it.
    Warned(Vec<&'static str>),
    Deleted,
    Skipped,
    Failed(TaskError),
    Blocked { by: TaskKey },
    Cancelled,
}

impl Outcome {
    /// Whether dependents were allowed to run after this task.
    pub fn is_done(&self) -> bool {
        !matches!(self, Outcome::Failed(_) | Outcome::Blocked { .. } | Outcome::Cancelled)
    }

    fn label(&self, dry_run: bool) -> String {
        match (self, dry_run) {
            (Outcome::Created, false) => "created".into(),
            (Outcome::Created, true) => "would create".into(),
            (Outcome::Updated(fields), false) => format!("updated {}", fields.join(", ")),
            (Outcome::Updated(fields), true) => format!("would update {}", fields.join(", ")),
            (Outcome::Deleted, false) => "deleted".into(),
            (Outcome::Deleted, true) => "would delete".into(),
            (Outcome::Unchanged, _) => "unchanged".into(),
            (Outcome::Warned(fields), _) => format!("differs in {}", fields.join(", ")),
            (Outcome::Skipped, _) => "skipped".into(),
            (Outcome::Failed(err), _) => format!("failed: {err}"),
            (Outcome::Blocked { by }, _) => format!("blocked by {by}"),
            (Outcome::Cancelled, _) => "cancelled".into(),
        }
    }

    fn color(&self) -> &'static str {
        match self {
            Outcome::Created | Outcome::Updated(_) | Outcome::Deleted => "#90EE90",
            Outcome::Unchanged | Outcome::Skipped => "#ADD8E6",
            Outcome::Warned(_) => "#FFD580",
            Outcome::Failed(_) => "#FF7F7F",
            Outcome::Blocked { .. } | Outcome::Cancelled => "#D3D3D3",
        }
    }
}

impl PartialEq for Outcome {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Outcome::Updated(a), Outcome::Updated(b)) => a == b,
            (Outcome::Warned(a), Outcome::Warned(b)) => a == b,
            (Outcome::Blocked { by: a }, Outcome::Blocked { by: b }) => a == b,
            // Errors carry no equality of their own.
            (Outcome::Failed(a), Outcome::Failed(b)) => a.to_string() == b.to_string(),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

#[derive(Debug)]
pub struct TaskReport {
    pub key: TaskKey,
    pub outcome: Outcome,
    /// Missing for tasks that never started.
    pub execution: Option<TaskExecution>,
}

#[derive(Debug)]
pub struct DeletionReport {
    pub kind: String,
    pub item: String,
    pub result: Result<(), TaskError>,
}

/// Everything an apply did, task by task in execution order.
#[derive(Debug)]
pub struct ApplyReport {
    pub tasks: Vec<TaskReport>,
    pub deletions: Vec<DeletionReport>,
    /// Addresses the cluster API can be reached at.
    pub api_addresses: Vec<String>,
    pub dry_run: bool,
    pub duration: Duration,
}

impl ApplyReport {
    pub fn outcome(&self, key: &TaskKey) -> Option<&Outcome> {
        self.tasks
            .iter()
            .find(|task| task.key == *key)
            .map(|task| &task.outcome)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&TaskKey, &TaskError)> {
        self.tasks.iter().filter_map(|task| match &task.outcome {
            Outcome::Failed(err) => Some((&task.key, err)),
            _ => None,
        })
    }

    /// Tasks that changed something, or would have on a dry run.
    pub fn changed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|task| {
            matches!(task.outcome, Outcome::Created | Outcome::Updated(_) | Outcome::Deleted)
        })
    }

    /// No task failed, was blocked or was cancelled.
    pub fn is_converged(&self) -> bool {
        self.tasks.iter().all(|task| task.outcome.is_done())
    }

    pub fn is_success(&self) -> bool {
        self.is_converged() && self.deletions.iter().all(|d| d.result.is_ok())
    }

    /// A human readable, styled summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();

        for task in &self.tasks {
            let label = task.outcome.label(self.dry_run);
            let label = match &task.outcome {
                Outcome::Created | Outcome::Updated(_) | Outcome::Deleted => style(label).green(),
                Outcome::Warned(_) => style(label).yellow(),
                Outcome::Failed(_) => style(label).red().bold(),
                Outcome::Blocked { .. } | Outcome::Cancelled => style(label).red(),
                Outcome::Unchanged | Outcome::Skipped => style(label).dim(),
            };

            let _ = write!(out, "{:<48} {}", task.key.to_string(), label);
            if let Some(execution) = &task.execution {
                let _ = write!(out, " {}", style(format!("({:.2?})", execution.duration)).dim());
            }
            out.push('\n');
        }

        for deletion in &self.deletions {
            let verb = if self.dry_run { "would delete" } else { "deleted" };
            let line = match &deletion.result {
                Ok(()) => style(format!("{verb} {} {}", deletion.kind, deletion.item)).green(),
                Err(err) => style(format!(
                    "failed to delete {} {}: {err}",
                    deletion.kind, deletion.item
                ))
                .red(),

            };
            let _ = writeln!(out, "{line}");
        }

        for address in &self.api_addresses {
            let _ = writeln!(out, "API address: {}", style(address).cyan());
        }

        let failed = self.tasks.iter().filter(|t| !t.outcome.is_done()).count();
        let _ = write!(
            out,
            "{} tasks, {} changed, {} not converged in {:.2?}",
            self.tasks.len(),
            self.changed().count(),
            failed,
            self.duration
        );

        out
    }

    /// Renders the applied graph as a Mermaid diagram, colored by outcome.
    ///
    /// * **Green**: changed
    /// * **Blue**: unchanged or skipped
    /// * **Orange**: differs but left alone
    /// * **Red**: failed
    /// * **Grey**: blocked or cancelled
    pub fn render_mermaid(&self, plan: &Plan) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for index in plan.graph.node_indices() {
            let key = &plan.graph[index].key;
            let name = key.to_string().replace('"', "\\\"");

            let (label, color) = match self.outcome(key) {
                Some(outcome) => (outcome.label(self.dry_run).replace('"', "'"), outcome.color()),
                None => ("not run".to_string(), "#D3D3D3"),
            };

            let _ = writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {:?} fill:{}", index.index(), color);
        }

        for edge in plan.graph.raw_edges() {
            let _ = writeln!(f, "    {:?} --> {:?}", edge.source().index(), edge.target().index());
        }

        f
    }

    /// Turns a report with failures into an error listing all of them.
    pub fn into_result(self) -> Result<ApplyReport, ApplyError> {
        if self.is_success() {
            return Ok(self);
        }

        let mut error = ApplyError {
            failed: Vec::new(),
            blocked: Vec::new(),
            cancelled: Vec::new(),
            deletions: Vec::new(),
        };

        for task in self.tasks {
            match task.outcome {
                Outcome::Failed(err) => error.failed.push((task.key, err)),
                Outcome::Blocked { by } => error.blocked.push((task.key, by)),
                Outcome::Cancelled => error.cancelled.push(task.key),
                _ => {}
            }
        }

        for deletion in self.deletions {
            if let Err(err) = deletion.result {
                error
                    .deletions
                    .push((format!("{} {}", deletion.kind, deletion.item), err));
            }
        }

        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcomes: Vec<(&str, Outcome)>) -> ApplyReport {
        ApplyReport {
            tasks: outcomes
                .into_iter()
                .map(|(name, outcome)| TaskReport {
                    key: TaskKey::new("Probe", name),
                    outcome,
                    execution: None,
                })
                .collect(),
            deletions: Vec::new(),
            api_addresses: vec!["api.example.com".into()],
            dry_run: false,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn summary_lists_every_task() {
        console::set_colors_enabled(false);
        let report = report(vec![
            ("a", Outcome::Created),
            ("b", Outcome::Updated(vec!["Tags"])),
            ("c", Outcome::Unchanged),
        ]);

        let summary = report.summary();
        assert!(summary.contains("Probe/a"));
        assert!(summary.contains("updated Tags"));
        assert!(summary.contains("API address: api.example.com"));
        assert!(summary.contains("3 tasks, 2 changed, 0 not converged"));
    }

    #[test]
    fn into_result_keeps_successful_reports() {
        let report = report(vec![("a", Outcome::Created), ("b", Outcome::Skipped)]);
        let report = report.into_result().unwrap();
        assert_eq!(report.tasks.len(), 2);
    }

    #[test]
    fn failed_deletions_fail_the_apply() {
        let mut report = report(vec![("a", Outcome::Unchanged)]);
        report.deletions.push(DeletionReport {
            kind: "ClassicLoadBalancer".into(),
            item: "api-cluster1".into(),
            result: Err(TaskError::Timeout("delete".into())),
        });

        assert!(report.is_converged());
        let err = report.into_result().unwrap_err();
        assert_eq!(err.deletions.len(), 1);
        assert!(err.to_string().contains("delete ClassicLoadBalancer api-cluster1"));
    }

    #[test]
    fn outcome_equality() {
        assert_eq!(Outcome::Created, Outcome::Created);
        assert_ne!(Outcome::Created, Outcome::Unchanged);
        assert_eq!(
            Outcome::Failed(TaskError::RequiredField("Name")),
            Outcome::Failed(TaskError::RequiredField("Name"))
        );
    }
}
