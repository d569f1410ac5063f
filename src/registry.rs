use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::error::GraphError;
use crate::link::{Link, TaskKey};
use crate::task::{Task, TypedTask};

struct Entry {
    key: TaskKey,
    task: Arc<dyn Task>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Collects the tasks of a cluster before they are applied.
///
/// Model builders add tasks here and wire them together through the
/// [`Link`]s returned by [`Registry::add`]. Once everything is registered,
/// [`Registry::finish`] validates the dependency graph and turns it into a
/// [`Plan`] for the [`Executor`](crate::Executor).
///
/// ```rust,ignore
/// let mut registry = Registry::new();
/// let network = registry.add(Network::new("cluster1"))?;
/// let subnet = registry.add(Subnet::new("us-east-1a.cluster1", &network))?;
/// let plan = registry.finish()?;
/// ```
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
    index: HashMap<TaskKey, usize>,
}

impl Registry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task and returns a link to it.
    ///
    /// Registering an identical task twice returns the existing link, while a
    /// different task under the same key is an error.
    pub fn add<T: TypedTask>(&mut self, task: T) -> Result<Link<T>, GraphError> {
        if task.name().is_empty() {
            return Err(GraphError::Unnamed(T::KIND));
        }

        let key = TaskKey::new(T::KIND, task.name());

        if let Some(&existing) = self.index.get(&key) {
            let entry = &self.entries[existing];
            return match entry.any.clone().downcast::<T>() {
                Ok(registered) if *registered == task => Ok(Link::new(registered)),
                _ => Err(GraphError::DuplicateTask(key)),
            };
        }

        let task = Arc::new(task);
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(Entry {
            key,
            task: task.clone(),
            any: task.clone(),
        });

        Ok(Link::new(task))
    }

    /// Looks up a registered task by name.
    pub fn get<T: TypedTask>(&self, name: &str) -> Option<Link<T>> {
        let index = self.index.get(&TaskKey::new(T::KIND, name))?;
        let task = self.entries[*index].any.clone().downcast::<T>().ok()?;
        Some(Link::new(task))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the dependency graph, rejecting unknown dependencies and cycles.
    pub fn finish(self) -> Result<Plan, GraphError> {
        let mut graph: Graph<Node, ()> = Graph::with_capacity(self.entries.len(), 0);
        let mut nodes = HashMap::with_capacity(self.entries.len());

        for entry in &self.entries {
            let index = graph.add_node(Node {
                key: entry.key.clone(),
                task: entry.task.clone(),
            });
            nodes.insert(entry.key.clone(), index);
        }

        for entry in &self.entries {
            let target = nodes[&entry.key];
            for dependency in entry.task.dependencies() {
                let source = nodes
                    .get(&dependency)
                    .copied()
                    .ok_or_else(|| GraphError::UnknownDependency {
                        task: entry.key.clone(),
                        dependency: dependency.clone(),
                    })?;

                // Edges point from the dependency to the dependent.
                graph.update_edge(source, target, ());
            }
        }

        let order = match petgraph::algo::toposort(&graph, None) {
            Ok(order) => order,
            Err(_) => return Err(GraphError::Cycle(find_cycles(&graph))),
        };

        Ok(Plan { graph, order })
    }
}

/// Every strongly connected component that forms a cycle, including tasks
/// that depend on themselves.
fn find_cycles(graph: &Graph<Node, ()>) -> Vec<Vec<TaskKey>> {
    let mut cycles: Vec<Vec<TaskKey>> = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| {
            let mut keys: Vec<_> = scc.into_iter().map(|i| graph[i].key.clone()).collect();
            keys.sort();
            keys
        })
        .collect();

    cycles.sort();
    cycles
}

pub(crate) struct Node {
    pub(crate) key: TaskKey,
    pub(crate) task: Arc<dyn Task>,
}

/// A validated, acyclic task graph ready to be applied.
pub struct Plan {
    pub(crate) graph: Graph<Node, ()>,
    pub(crate) order: Vec<NodeIndex>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Task keys in a valid execution order.
    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.order.iter().map(|&index| &self.graph[index].key)
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, key: &TaskKey) -> Vec<&TaskKey> {
        let Some(index) = self.graph.node_indices().find(|&i| self.graph[i].key == *key) else {
            return Vec::new();
        };

        self.graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
            .map(|dep| &self.graph[dep].key)
            .collect()
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let key = &self.graph[index].key;
            let name = key.to_string().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(f, "    {:?} --> {:?}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::{Context, Lifecycle};
    use crate::error::TaskError;
    use crate::target::ApiTarget;
    use crate::task::{Changes, Delta, Differ};

    /// A task with free-form dependencies and no cloud behind it.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Probe {
        pub name: String,
        pub deps: Vec<TaskKey>,
        pub value: u32,
    }

    impl Probe {
        pub(crate) fn new(name: &str, deps: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                deps: deps.iter().map(|d| TaskKey::new("Probe", *d)).collect(),
                value: 0,
            }
        }
    }

    impl TypedTask for Probe {
        const KIND: &'static str = "Probe";

        fn name(&self) -> &str {
            &self.name
        }

        fn lifecycle(&self) -> Lifecycle {
            Lifecycle::Sync
        }

        fn dependencies(&self) -> Vec<TaskKey> {
            self.deps.clone()
        }

        fn find(&self, _: &Context) -> Result<Option<Self>, TaskError> {
            Ok(None)
        }

        fn diff(actual: &Self, expected: &Self) -> Changes<Self> {
            let mut differ = Differ::new();
            let value = differ.value("Value", &actual.value, &expected.value);
            differ.finish(Self { value, ..expected.clone() })
        }

        fn check_changes(_: Option<&Self>, _: &Self, _: &Self) -> Result<(), TaskError> {
            Ok(())
        }

        fn render_api(_: &ApiTarget, _: &Context, _: Delta<'_, Self>) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn identical_registration_returns_existing_link() {
        let mut registry = Registry::new();
        let first = registry.add(Probe::new("a", &[])).unwrap();
        let second = registry.add(Probe::new("a", &[])).unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let mut registry = Registry::new();
        registry.add(Probe::new("a", &[])).unwrap();

        let mut other = Probe::new("a", &[]);
        other.value = 7;
        let err = registry.add(other).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTask(TaskKey::new("Probe", "a")));
    }

    #[test]
    fn unnamed_tasks_are_rejected() {
        let mut registry = Registry::new();
        assert_eq!(registry.add(Probe::new("", &[])).unwrap_err(), GraphError::Unnamed("Probe"));
    }

    #[test]
    fn get_returns_registered_link() {
        let mut registry = Registry::new();
        registry.add(Probe::new("a", &[])).unwrap();

        assert_eq!(registry.get::<Probe>("a").map(|l| l.key()), Some(TaskKey::new("Probe", "a")));
        assert!(registry.get::<Probe>("b").is_none());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut registry = Registry::new();
        registry.add(Probe::new("a", &["missing"])).unwrap();

        let err = registry.finish().err().unwrap();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                task: TaskKey::new("Probe", "a"),
                dependency: TaskKey::new("Probe", "missing"),
            }
        );
    }

    #[test]
    fn cycle_is_reported_with_every_member() {
        let mut registry = Registry::new();
        registry.add(Probe::new("a", &["b"])).unwrap();
        registry.add(Probe::new("b", &["c"])).unwrap();
        registry.add(Probe::new("c", &["a"])).unwrap();
        registry.add(Probe::new("d", &[])).unwrap();

        let err = registry.finish().err().unwrap();
        assert_eq!(
            err,
            GraphError::Cycle(vec![vec![
                TaskKey::new("Probe", "a"),
                TaskKey::new("Probe", "b"),
                TaskKey::new("Probe", "c"),
            ]])
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut registry = Registry::new();
        registry.add(Probe::new("a", &["a"])).unwrap();

        let err = registry.finish().err().unwrap();
        assert_eq!(err, GraphError::Cycle(vec![vec![TaskKey::new("Probe", "a")]]));
    }

    #[test]
    fn plan_orders_dependencies_first() {
        let mut registry = Registry::new();
        registry.add(Probe::new("frontend", &["backend"])).unwrap();
        registry.add(Probe::new("backend", &["lb"])).unwrap();
        registry.add(Probe::new("lb", &[])).unwrap();

        let plan = registry.finish().unwrap();
        let order: Vec<_> = plan.keys().map(|k| k.name.as_str()).collect();
        assert_eq!(order, vec!["lb", "backend", "frontend"]);
        assert_eq!(
            plan.dependencies_of(&TaskKey::new("Probe", "backend")),
            vec![&TaskKey::new("Probe", "lb")]
        );


        let mermaid = plan.to_string();
        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("Probe/frontend"));
    }
}
