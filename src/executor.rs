pub mod report;

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cloud::CloudPool;
use crate::core::{ApplyOptions, CancelToken, Context};
use crate::error::TaskError;
use crate::registry::Plan;
use crate::target::{PlannedAction, Target};
use crate::task::Deletion;

pub use report::{ApplyReport, DeletionReport, Outcome, TaskExecution, TaskReport};

type Outcomes = HashMap<NodeIndex, (Outcome, Option<TaskExecution>)>;

/// Where a task is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Diffing,
    Validating,
    Rendering,
    Done,
    Failed,
    /// A dependency failed or was blocked, the task never started.
    Blocked,
    /// The run was cancelled before the task started.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed | TaskState::Blocked | TaskState::Cancelled
        )
    }

    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, next),
            (Pending, Diffing | Done | Failed | Blocked | Cancelled)
                | (Diffing, Validating | Rendering | Done | Failed)
                | (Validating, Rendering | Failed)
                | (Rendering, Done | Failed)
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TaskState::Pending => "Pending",
            TaskState::Diffing => "Diffing",
            TaskState::Validating => "Validating",
            TaskState::Rendering => "Rendering",
            TaskState::Done => "Done",
            TaskState::Failed => "Failed",
            TaskState::Blocked => "Blocked",
            TaskState::Cancelled => "Cancelled",
        };
        f.write_str(text)
    }
}

/// Applies a [`Plan`] against a [`Target`].
pub struct Executor {
    clouds: CloudPool,
    target: Target,
    options: ApplyOptions,
    cancel: CancelToken,
}

impl Executor {
    pub fn new(clouds: CloudPool, target: Target) -> Self {
        Self {
            clouds,
            target,
            options: ApplyOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Shares an external cancellation token with the run.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn into_target(self) -> Target {
        self.target
    }

    /// Runs every task of the plan, then the deletions it asks for.
    ///
    /// The returned error only covers failures of the executor itself. Task
    /// failures are part of the [`ApplyReport`], see
    /// [`ApplyReport::into_result`].
    pub fn run(&self, plan: &Plan) -> anyhow::Result<ApplyReport> {
        let cancel = match self.options.deadline {
            Some(deadline) => self.cancel.with_deadline(deadline),
            None => self.cancel.clone(),
        };

        let started = Instant::now();
        let mut outcomes = self.run_tasks(plan, &cancel)?;

        let mut report = ApplyReport {
            tasks: Vec::with_capacity(plan.len()),
            deletions: Vec::new(),
            api_addresses: Vec::new(),
            dry_run: self.target.is_dry_run(),
            duration: Duration::ZERO,
        };

        for &index in &plan.order {
            let node = &plan.graph[index];
            let (outcome, execution) = outcomes
                .remove(&index)
                .unwrap_or((Outcome::Cancelled, None));

            if outcome.is_done() {
                report.api_addresses.extend(node.task.api_addresses());
            }

            report.tasks.push(TaskReport {
                key: node.key.clone(),
                outcome,
                execution,
            });
        }

        report.api_addresses.sort();
        report.api_addresses.dedup();

        if report.is_converged() && !cancel.is_cancelled() {
            report.deletions = self.run_deletions(plan, &cancel);
        } else if !report.is_converged() {
            tracing::warn!("Not all tasks converged, skipping deletions");
        }

        report.duration = started.elapsed();
        tracing::info!(
            tasks = report.tasks.len(),
            failed = report.failed().count(),
            duration = ?report.duration,
            "Apply finished"
        );

        Ok(report)
    }

    /// Walks the graph in dependency order on a bounded thread pool.
    ///
    /// Every task starts with the number of its dependencies. Whenever a task
    /// finishes successfully, the counts of its dependents go down and those
    /// reaching zero are spawned. A failed task never releases its
    /// dependents, they are marked blocked instead.
    fn run_tasks(
        &self,
        plan: &Plan,
        cancel: &CancelToken,
    ) -> anyhow::Result<Outcomes> {
        let graph = &plan.graph;

        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        let mut dependency_counts: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|i| {
                let count = graph
                    .neighbors_directed(i, petgraph::Direction::Incoming)
                    .count();
                (i, count)
            })
            .collect();

        let mut outcomes = Outcomes::new();
        let total_tasks = graph.node_count() as u64;

        if total_tasks == 0 {
            return Ok(outcomes);
        }

        let root_span = tracing::span!(Level::INFO, "applying_tasks");
        root_span.pb_set_length(total_tasks);
        root_span.pb_set_style(&crate::utils::style_root()?);
        root_span.pb_set_message("Applying tasks...");
        let _enter = root_span.enter();

        let pb_style = crate::utils::style_task()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.max_concurrency.max(1))
            .thread_name(|i| format!("cloudup-worker-{i}"))
            .build()?;

        pool.in_place_scope(|s| -> anyhow::Result<()> {
            let (result_sender, result_receiver) =
                channel::<(NodeIndex, Result<Outcome, TaskError>, TaskExecution)>();

            let mut in_flight = 0usize;

            let spawn_task = |index: NodeIndex| {
                let node = &graph[index];
                let task = node.task.clone();
                let key = node.key.clone();
                let sender = result_sender.clone();
                let pb_style = pb_style.clone();

                s.spawn(move |_| {
                    let span = tracing::span!(Level::INFO, "task", name = %key);
                    span.pb_set_style(&pb_style);
                    span.pb_set_message(&format!("Pending {key}"));
                    let _enter = span.enter();

                    let ctx = Context::new(&self.clouds, &self.options, cancel)
                        .for_task(key.clone(), span.clone());
                    let start = Instant::now();

                    // A panicking task only owns its own clone of the desired
                    // state, so nothing shared is left half-written.
                    let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        task.run(&ctx, &self.target)
                    })) {
                        Ok(result) => result,
                        Err(panic) => {
                            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                                s.to_string()
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                s.clone()
                            } else {
                                String::from("unknown payload")
                            };
                            Err(TaskError::Panicked(msg))
                        }
                    };

                    match &result {
                        Ok(_) => ctx.transition(TaskState::Done),
                        Err(err) => {
                            ctx.transition(TaskState::Failed);
                            if err.is_validation() {
                                tracing::error!(
                                    task = %key,
                                    error = %err,
                                    "Rejected change, nothing was touched"
                                );
                            } else {
                                tracing::error!(task = %key, error = %err, "Task failed");
                            }
                        }
                    }

                    let execution = TaskExecution {
                        start,
                        duration: start.elapsed(),
                    };

                    // The receiver only goes away once every task reported.
                    let _ = sender.send((index, result, execution));
                });
            };

            let start_or_cancel = |index: NodeIndex,
                                   in_flight: &mut usize,
                                   outcomes: &mut Outcomes| {

                if cancel.is_cancelled() {
                    outcomes.insert(index, (Outcome::Cancelled, None));
                } else {
                    *in_flight += 1;
                    spawn_task(index);
                }
            };

            // Seed initial tasks
            for index in graph.node_indices() {
                if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                    start_or_cancel(index, &mut in_flight, &mut outcomes);
                }
            }

            // Scheduler loop
            while in_flight > 0 {
                let (index, result, execution) = result_receiver
                    .recv()
                    .map_err(|_| anyhow::anyhow!("Task result channel closed unexpectedly"))?;
                in_flight -= 1;
                root_span.pb_inc(1);

                match result {
                    Ok(outcome) => {
                        outcomes.insert(index, (outcome, Some(execution)));

                        for &dependent in dependents.get(&index).into_iter().flatten() {
                            if let Some(count) = dependency_counts.get_mut(&dependent) {
                                *count -= 1;
                                if *count == 0 {
                                    start_or_cancel(dependent, &mut in_flight, &mut outcomes);
                                }
                            }
                        }
                    }
                    Err(TaskError::Cancelled) => {
                        outcomes.insert(index, (Outcome::Cancelled, Some(execution)));
                    }
                    Err(err) => {
                        outcomes.insert(index, (Outcome::Failed(err), Some(execution)));
                        block_dependents(plan, &dependents, index, &mut outcomes);
                    }
                }
            }

            Ok(())
        })?;

        // Whatever never got a chance to start was waiting on a cancelled task.
        for index in graph.node_indices() {
            outcomes.entry(index).or_insert((Outcome::Cancelled, None));
        }

        Ok(outcomes)
    }

    /// Applies the deletions requested by finished tasks.
    fn run_deletions(&self, plan: &Plan, cancel: &CancelToken) -> Vec<DeletionReport> {
        let ctx = Context::new(&self.clouds, &self.options, cancel);
        let mut deletions: Vec<Box<dyn Deletion>> = Vec::new();
        let mut reports = Vec::new();

        for &index in &plan.order {
            let node = &plan.graph[index];
            match node.task.find_deletions(&ctx) {
                Ok(found) => deletions.extend(found),
                Err(err) => {
                    tracing::error!(task = %node.key, error = %err, "Couldn't look up deletions");
                    reports.push(DeletionReport {
                        kind: node.key.kind.to_string(),
                        item: node.key.name.clone(),
                        result: Err(err),
                    });
                }
            }
        }

        for deletion in deletions {
            let result = match &self.target {
                Target::Api(_) => {
                    tracing::info!(kind = deletion.kind(), item = %deletion.item(), "Deleting");
                    deletion.delete(&ctx)
                }
                Target::Terraform(_) => {
                    tracing::warn!(
                        kind = deletion.kind(),
                        item = %deletion.item(),
                        "Terraform target does not apply deletions, delete manually"
                    );
                    continue;
                }
                Target::DryRun(target) => {
                    target.record(
                        crate::link::TaskKey::new("Deletion", deletion.item()),
                        PlannedAction::Delete {
                            kind: deletion.kind().to_string(),
                            item: deletion.item(),
                        },
                    );
                    Ok(())
                }
            };

            if let Err(err) = &result {
                tracing::error!(
                    kind = deletion.kind(),
                    item = %deletion.item(),
                    error = %err,
                    "Deletion failed"
                );
            }

            reports.push(DeletionReport {
                kind: deletion.kind().to_string(),
                item: deletion.item(),
                result,
            });
        }

        reports
    }
}

/// Marks everything reachable from a failed task as blocked by it.
fn block_dependents(
    plan: &Plan,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    failed: NodeIndex,
    outcomes: &mut Outcomes,
) {
    let by = plan.graph[failed].key.clone();
    let mut queue: VecDeque<NodeIndex> =
        dependents.get(&failed).cloned().unwrap_or_default().into();

    while let Some(index) = queue.pop_front() {
        if outcomes.contains_key(&index) {
            continue;
        }

        tracing::warn!(
            task = %plan.graph[index].key,
            blocked_by = %by,
            "Task blocked by failed dependency"
        );
        outcomes.insert(index, (Outcome::Blocked { by: by.clone() }, None));
        queue.extend(dependents.get(&index).into_iter().flatten());
    }
}
