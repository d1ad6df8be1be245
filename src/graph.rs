//! Task registry and dependency validation
//!
//! Tasks are registered from the parsed program before anything runs, so
//! forward references between tasks are legal. Before a task is scheduled
//! the subgraph reachable from it is built with petgraph and checked for
//! missing dependencies and cycles.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{KilnError, Result};
use crate::script::ast::{Block, Program};

/// A declared task input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoDecl {
    pub path: String,
    /// Absence of the file is not an error
    pub optional: bool,
    /// Expected BLAKE3 hex digest of the contents
    pub hash: Option<String>,
}

impl IoDecl {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            optional: false,
            hash: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A named task from the build script
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDef {
    pub name: String,
    pub dependencies: Vec<String>,
    pub inputs: Vec<IoDecl>,
    pub outputs: Vec<IoDecl>,
    pub body: Block,
}

impl TaskDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            body: Block::default(),
        }
    }

    /// Whether the task has anything for the incremental cache to compare
    pub fn is_tracked(&self) -> bool {
        !self.inputs.is_empty()
    }
}

/// Registry of every task defined by one script
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<String, Arc<TaskDef>>,
    /// Registration (source) order
    order: Vec<String>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every task definition of a program
    pub fn from_program(program: &Program) -> Result<Self> {
        let mut graph = Self::new();
        for task in program.tasks() {
            graph.register_task(Arc::clone(task))?;
        }
        Ok(graph)
    }

    /// Add a task; names must be unique
    pub fn register_task(&mut self, task: Arc<TaskDef>) -> Result<()> {
        if self.tasks.contains_key(&task.name) {
            return Err(KilnError::DuplicateTask {
                name: task.name.clone(),
            });
        }
        self.order.push(task.name.clone());
        self.tasks.insert(task.name.clone(), task);
        Ok(())
    }

    /// Get a task by name
    pub fn get_task(&self, name: &str) -> Option<Arc<TaskDef>> {
        self.tasks.get(name).cloned()
    }

    /// Check if a task exists
    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Task names in definition order
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Get direct dependencies of a task
    pub fn dependencies(&self, name: &str) -> Option<&[String]> {
        self.tasks.get(name).map(|t| t.dependencies.as_slice())
    }

    fn not_found(&self, name: &str) -> KilnError {
        KilnError::TaskNotFound {
            name: name.to_string(),
            available: self.order.clone(),
        }
    }

    /// Build the DAG of everything reachable from `root`.
    /// Edges go from dependency TO dependent (dependency runs first).
    fn subgraph(&self, root: &str) -> Result<DiGraph<Arc<TaskDef>, ()>> {
        let root_task = self.get_task(root).ok_or_else(|| self.not_found(root))?;

        let mut graph = DiGraph::new();
        let mut index: HashMap<String, NodeIndex> = HashMap::new();
        index.insert(root.to_string(), graph.add_node(root_task));
        let mut queue = vec![root.to_string()];

        while let Some(name) = queue.pop() {
            let task_idx = index[&name];
            let task = Arc::clone(&graph[task_idx]);

            for dep in &task.dependencies {
                let dep_idx = match index.get(dep) {
                    Some(idx) => *idx,
                    None => {
                        let dep_task =
                            self.get_task(dep)
                                .ok_or_else(|| KilnError::DependencyNotFound {
                                    task: task.name.clone(),
                                    dependency: dep.clone(),
                                })?;
                        let idx = graph.add_node(dep_task);
                        index.insert(dep.clone(), idx);
                        queue.push(dep.clone());
                        idx
                    }
                };
                graph.add_edge(dep_idx, task_idx, ());
            }
        }

        Ok(graph)
    }

    /// Check that every transitive dependency of `root` exists and that
    /// there is no cycle among them
    pub fn validate(&self, root: &str) -> Result<()> {
        self.execution_order(root).map(|_| ())
    }

    /// Tasks needed by `root` (itself included), dependencies first
    pub fn execution_order(&self, root: &str) -> Result<Vec<Arc<TaskDef>>> {
        let graph = self.subgraph(root)?;
        let sorted = toposort(&graph, None).map_err(|cycle| KilnError::CycleDetected {
            cycle: Self::describe_cycle(&graph, cycle.node_id()),
        })?;

        Ok(sorted.into_iter().map(|idx| Arc::clone(&graph[idx])).collect())
    }

    /// Readable `a -> b -> a` path, following "requires" edges
    fn describe_cycle(graph: &DiGraph<Arc<TaskDef>, ()>, start: NodeIndex) -> String {
        let mut path = vec![start];
        let mut visited = HashSet::new();

        if Self::walk_back(graph, start, start, &mut visited, &mut path) {
            path.iter()
                .map(|idx| graph[*idx].name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        } else {
            graph[start].name.clone()
        }
    }

    fn walk_back(
        graph: &DiGraph<Arc<TaskDef>, ()>,
        current: NodeIndex,
        target: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> bool {
        for next in graph.neighbors_directed(current, Direction::Incoming) {
            if next == target {
                path.push(target);
                return true;
            }

            if visited.insert(next) {
                path.push(next);
                if Self::walk_back(graph, next, target, visited, path) {
                    return true;
                }
                path.pop();
            }
        }

        false
    }
}

/// Stages of tasks that could run side by side (used for `--dry-run`)
#[derive(Debug)]
pub struct ExecutionPlan {
    pub stages: Vec<Vec<Arc<TaskDef>>>,
}

impl ExecutionPlan {
    /// Group an execution order by depth: every task lands one stage after
    /// its deepest dependency
    pub fn from_order(tasks: &[Arc<TaskDef>]) -> Self {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut stages: Vec<Vec<Arc<TaskDef>>> = Vec::new();

        for task in tasks {
            let stage = task
                .dependencies
                .iter()
                .filter_map(|d| depth.get(d.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);

            depth.insert(task.name.as_str(), stage);
            if stages.len() <= stage {
                stages.resize_with(stage + 1, Vec::new);
            }
            stages[stage].push(Arc::clone(task));
        }

        Self { stages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, deps: &[&str]) -> Arc<TaskDef> {
        let mut t = TaskDef::new(name);
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        Arc::new(t)
    }

    fn diamond() -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph.register_task(task("d", &[])).unwrap();
        graph.register_task(task("a", &["d"])).unwrap();
        graph.register_task(task("b", &["d"])).unwrap();
        graph.register_task(task("c", &["a", "b"])).unwrap();
        graph
    }

    fn position(names: &[String], name: &str) -> usize {
        names.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_execution_order() {
        let graph = diamond();
        let order: Vec<String> = graph
            .execution_order("c")
            .unwrap()
            .iter()
            .map(|t| t.name.clone())
            .collect();

        assert_eq!(order.len(), 4);
        assert!(position(&order, "d") < position(&order, "a"));
        assert!(position(&order, "d") < position(&order, "b"));
        assert!(position(&order, "a") < position(&order, "c"));
        assert!(position(&order, "b") < position(&order, "c"));
    }

    #[test]
    fn test_order_only_includes_reachable_tasks() {
        let mut graph = diamond();
        graph.register_task(task("unrelated", &[])).unwrap();

        let order = graph.execution_order("a").unwrap();
        let names: Vec<_> = order.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["d", "a"]);
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = TaskGraph::new();
        graph.register_task(task("a", &["b"])).unwrap();
        graph.register_task(task("b", &["a"])).unwrap();

        let err = graph.validate("a").unwrap_err();
        let KilnError::CycleDetected { cycle } = err else {
            panic!("expected a cycle error, got {err:?}");
        };
        assert!(cycle == "a -> b -> a" || cycle == "b -> a -> b", "{cycle}");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = TaskGraph::new();
        graph.register_task(task("loop", &["loop"])).unwrap();

        assert!(matches!(
            graph.validate("loop"),
            Err(KilnError::CycleDetected { ref cycle }) if cycle == "loop -> loop"
        ));
    }

    #[test]
    fn test_missing_dependency() {
        let mut graph = TaskGraph::new();
        graph.register_task(task("build", &["codegen"])).unwrap();

        assert!(matches!(
            graph.validate("build"),
            Err(KilnError::DependencyNotFound { ref task, ref dependency })
                if task == "build" && dependency == "codegen"
        ));
        assert!(matches!(
            graph.validate("deploy"),
            Err(KilnError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut graph = TaskGraph::new();
        graph.register_task(task("a", &[])).unwrap();
        assert!(matches!(
            graph.register_task(task("a", &[])),
            Err(KilnError::DuplicateTask { .. })
        ));
    }

    #[test]
    fn test_plan_stages() {
        let graph = diamond();
        assert_eq!(graph.dependencies("c"), Some(&["a".to_string(), "b".to_string()][..]));

        let plan = ExecutionPlan::from_order(&graph.execution_order("c").unwrap());
        let stages: Vec<Vec<&str>> = plan
            .stages
            .iter()
            .map(|s| {
                let mut names: Vec<_> = s.iter().map(|t| t.name.as_str()).collect();
                names.sort();
                names
            })
            .collect();
        assert_eq!(stages, vec![vec!["d"], vec!["a", "b"], vec!["c"]]);
    }
}
