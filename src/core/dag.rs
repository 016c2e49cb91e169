//! Task dependency graph and wave planning.
//!
//! The graph is stored as an adjacency map (task -> dependency ids) plus a
//! reverse index (task -> dependents). Tasks never point at each other; the
//! petgraph view used for cycle detection is built on demand from the maps.
//!
//! Planning happens once per run: [`TaskGraph::validate`] collects every
//! problem in one pass so a broken project file can be fixed in one go, and
//! [`TaskGraph::compute_waves`] layers the tasks so that each wave only
//! depends on strictly earlier waves.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, GraphError, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// A group of tasks whose dependencies all lie in earlier waves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// Zero-based position in the run.
    pub index: usize,
    /// Task ids in this wave, sorted.
    pub task_ids: Vec<TaskId>,
}

impl Wave {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    /// One-based number for display.
    pub fn number(&self) -> usize {
        self.index + 1
    }
}

/// Map each task id to the index of the wave that contains it.
pub fn wave_lookup(waves: &[Wave]) -> HashMap<TaskId, usize> {
    waves
        .iter()
        .flat_map(|w| w.task_ids.iter().map(move |id| (id.clone(), w.index)))
        .collect()
}

/// The task dependency graph.
#[derive(Clone, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    /// Reverse index: dependency id -> ids of tasks that depend on it.
    dependents: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a task list, rejecting duplicate ids.
    pub fn from_tasks<I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = Task>,
    {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task)?;
        }
        Ok(graph)
    }

    /// Add a task. Dependencies may reference tasks added later; unknown
    /// references are reported by [`validate`](Self::validate).
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::Config(format!("duplicate task id '{}'", task.id)));
        }
        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn dependency_count(&self) -> usize {
        self.tasks.values().map(|t| t.dependencies.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All tasks in id order.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Direct dependencies of a task (empty for unknown ids).
    pub fn get_dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.tasks
            .get(id)
            .map(|t| t.dependencies.clone())
            .unwrap_or_default()
    }

    /// Tasks that directly depend on `id`.
    pub fn get_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    /// Every task reachable through dependency edges from `id`, excluding
    /// `id` itself unless it sits on a cycle.
    pub fn get_transitive_dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<TaskId> = self.get_dependencies(id).into_iter().collect();
        while let Some(dep) = stack.pop() {
            if seen.insert(dep.clone()) {
                stack.extend(self.get_dependencies(&dep));
            }
        }
        seen
    }

    // ========== Planning ==========

    /// Check the graph and return every problem found.
    ///
    /// Unknown references and cycles are detected independently, so a graph
    /// with both gets both reported. Validation has no side effects and is
    /// idempotent.
    pub fn validate(&self) -> Vec<GraphError> {
        let mut errors = Vec::new();

        for task in self.tasks.values() {
            let missing: Vec<TaskId> = task
                .dependencies
                .iter()
                .filter(|dep| !self.tasks.contains_key(*dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                errors.push(GraphError::UnknownDependency {
                    task: task.id.clone(),
                    missing,
                });
            }
        }

        errors.extend(self.find_cycles());
        errors
    }

    /// Layer the tasks into execution waves.
    ///
    /// Each iteration collects every remaining task whose dependencies are
    /// already scheduled, so waves are as wide as the graph allows. Fails if
    /// an iteration makes no progress while tasks remain.
    pub fn compute_waves(&self) -> Result<Vec<Wave>> {
        let mut scheduled: HashSet<&TaskId> = HashSet::new();
        let mut remaining: BTreeSet<&TaskId> = self.tasks.keys().collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<&TaskId> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    self.tasks[*id]
                        .dependencies
                        .iter()
                        .all(|dep| scheduled.contains(dep))
                })
                .collect();

            if ready.is_empty() {
                return Err(Error::Graph(vec![GraphError::Stalled {
                    remaining: remaining.into_iter().cloned().collect(),
                }]));
            }

            for id in &ready {
                remaining.remove(*id);
                scheduled.insert(*id);
            }
            waves.push(Wave {
                index: waves.len(),
                task_ids: ready.into_iter().cloned().collect(),
            });
        }

        Ok(waves)
    }

    /// Validate, then compute waves. Any validation error aborts planning
    /// before waves are computed.
    pub fn plan(&self) -> Result<Vec<Wave>> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(Error::Graph(errors));
        }
        self.compute_waves()
    }

    /// Strongly connected components with more than one task, or a task that
    /// depends on itself, are cycles. Each is reported once with a concrete
    /// path starting at its smallest id.
    fn find_cycles(&self) -> Vec<GraphError> {
        let mut graph: DiGraph<&TaskId, ()> = DiGraph::new();
        let mut index: HashMap<&TaskId, NodeIndex> = HashMap::new();
        for id in self.tasks.keys() {
            index.insert(id, graph.add_node(id));
        }
        // Edge task -> dependency, following "depends on".
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                if let Some(&to) = index.get(dep) {
                    graph.add_edge(index[&task.id], to, ());
                }
            }
        }

        let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let members: BTreeSet<&TaskId> = scc.iter().map(|n| graph[*n]).collect();
                self.cycle_path(&members)
            })
            .collect();
        cycles.sort();

        cycles
            .into_iter()
            .map(|path| GraphError::Cycle { path })
            .collect()
    }

    /// Walk dependency edges inside one strongly connected component until
    /// the walk returns to its starting task.
    fn cycle_path(&self, members: &BTreeSet<&TaskId>) -> Vec<TaskId> {
        let Some(&start) = members.iter().next() else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut visited: HashSet<&TaskId> = HashSet::from([start]);
        // Each frame holds the candidate next hops still to try.
        let mut frames: Vec<Vec<&TaskId>> = vec![self.next_hops(start, members)];

        while let Some(frame) = frames.last_mut() {
            let Some(next) = frame.pop() else {
                frames.pop();
                path.pop();
                continue;
            };
            if next == start {
                return path.into_iter().cloned().collect();
            }
            if visited.insert(next) {
                path.push(next);
                frames.push(self.next_hops(next, members));
            }
        }

        members.iter().map(|id| (*id).clone()).collect()
    }

    fn next_hops<'a>(&'a self, id: &TaskId, members: &BTreeSet<&TaskId>) -> Vec<&'a TaskId> {
        let mut hops: Vec<&TaskId> = self.tasks[id]
            .dependencies
            .iter()
            .filter(|dep| members.contains(dep))
            .collect();
        // Popped from the back, so reverse to try the smallest id first.
        hops.reverse();
        hops
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
