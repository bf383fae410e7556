//! Task dependency DAG: cycle and depth validation, deterministic topological
//! order, ready-set computation, and cascading-failure propagation.
//!
//! Tasks live in a flat arena indexed by position; edges are index adjacency
//! lists pointing from a dependency to its dependents. Cycle detection is an
//! iterative three-colour DFS, so deep chains cannot overflow the stack.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use orchestra_types::{DependencyError, GraphConfig, Result, Task, TaskStatus};

use crate::store::Transaction;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Sorted by `(created_at, id)` so index order doubles as the tie-break order.
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    /// `dependencies[n]`: the tasks `n` waits on.
    dependencies: Vec<Vec<usize>>,
    /// `dependents[n]`: the tasks waiting on `n`.
    dependents: Vec<Vec<usize>>,
    max_depth: usize,
}

/// Result of a successful validation pass.
struct Analysis {
    order: Vec<usize>,
    depth: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    /// Build the graph from a set of tasks. Every `depends_on` entry must name a
    /// task in the same set; duplicate entries are collapsed.
    pub fn build(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut tasks: Vec<Task> = tasks.into_iter().collect();
        tasks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(DependencyError::DuplicateTask {
                    task: task.id.clone(),
                }
                .into());
            }
        }

        let mut dependencies = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                if !seen.insert(dep.as_str()) {
                    continue;
                }
                let &d = index
                    .get(dep)
                    .ok_or_else(|| DependencyError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    })?;
                dependencies[i].push(d);
                dependents[d].push(i);
            }
        }

        Ok(Self {
            tasks,
            index,
            dependencies,
            dependents,
            max_depth: GraphConfig::default().max_dependency_depth,
        })
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Direct dependents of `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        match self.index.get(id) {
            Some(&i) => self.dependents[i]
                .iter()
                .map(|&d| self.tasks[d].id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Check the whole graph for cycles and over-deep chains.
    pub fn validate(&self) -> Result<()> {
        self.analyze().map(|_| ())
    }

    /// Longest path from a root task, per task id. Fails like [`validate`](Self::validate).
    pub fn depths(&self) -> Result<HashMap<String, usize>> {
        let analysis = self.analyze()?;
        Ok(self
            .tasks
            .iter()
            .zip(analysis.depth)
            .map(|(t, d)| (t.id.clone(), d))
            .collect())
    }

    /// Total order with every task after all of its dependencies. Ties among
    /// unconstrained tasks break by creation time, then id.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let analysis = self.analyze()?;
        Ok(analysis
            .order
            .into_iter()
            .map(|i| self.tasks[i].id.clone())
            .collect())
    }

    /// Unstarted tasks (pending or ready) whose dependencies have all completed.
    pub fn ready_set(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(i, t)| {
                t.status.is_claimable()
                    && self.dependencies[*i]
                        .iter()
                        .all(|&d| self.tasks[d].status == TaskStatus::Completed)
            })
            .map(|(_, t)| t)
            .collect()
    }

    /// All transitive dependents of `id`, in breadth-first order.
    pub fn descendants(&self, id: &str) -> Result<Vec<String>> {
        let &start = self
            .index
            .get(id)
            .ok_or_else(|| orchestra_types::OrchestraError::not_found("Task", id))?;

        let mut visited = vec![false; self.tasks.len()];
        visited[start] = true;
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for &next in &self.dependents[current] {
                if !visited[next] {
                    visited[next] = true;
                    out.push(self.tasks[next].id.clone());
                    queue.push_back(next);
                }
            }
        }
        Ok(out)
    }

    /// Mark every non-terminal transitive dependent of `failed_id` as blocked,
    /// recording the failed task in its metadata. Statuses are read from the
    /// transaction, not from this graph's snapshot, so the writes commit
    /// atomically with the failure itself. Returns the newly blocked ids.
    ///
    /// With `cascade` disabled nothing is touched.
    pub fn propagate_failure(
        &self,
        tx: &mut Transaction<'_>,
        failed_id: &str,
        cascade: bool,
    ) -> Result<Vec<String>> {
        if !cascade {
            return Ok(Vec::new());
        }
        let mut blocked = Vec::new();
        for id in self.descendants(failed_id)? {
            let status = tx.task(&id)?.status;
            if status.is_terminal() || status == TaskStatus::Blocked {
                continue;
            }
            tx.block(&id, failed_id)?;
            blocked.push(id);
        }
        if !blocked.is_empty() {
            tracing::info!(task = %failed_id, blocked = blocked.len(), "Cascaded failure to dependents");
        }
        Ok(blocked)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn analyze(&self) -> Result<Analysis> {
        if let Some(cycle) = self.find_cycle() {
            return Err(DependencyError::Cycle { cycle }.into());
        }

        let order = self.kahn_order();
        let mut depth = vec![0usize; self.tasks.len()];
        for &n in &order {
            depth[n] = self.dependencies[n]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
            if depth[n] > self.max_depth {
                return Err(DependencyError::DepthExceeded {
                    task: self.tasks[n].id.clone(),
                    depth: depth[n],
                    max: self.max_depth,
                }
                .into());
            }
        }
        Ok(Analysis { order, depth })
    }

    /// Iterative three-colour DFS along dependency -> dependent edges.
    /// Returns one witness cycle, first node repeated at the end.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut color = vec![Color::White; self.tasks.len()];

        for root in 0..self.tasks.len() {
            if color[root] != Color::White {
                continue;
            }
            // (node, index of the next outgoing edge to explore)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            color[root] = Color::Gray;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                if let Some(&child) = self.dependents[node].get(top.1) {
                    top.1 += 1;
                    match color[child] {
                        Color::White => {
                            color[child] = Color::Gray;
                            stack.push((child, 0));
                        }
                        Color::Gray => {
                            let pos = stack
                                .iter()
                                .position(|&(n, _)| n == child)
                                .unwrap_or(0);
                            let mut cycle: Vec<String> = stack[pos..]
                                .iter()
                                .map(|&(n, _)| self.tasks[n].id.clone())
                                .collect();
                            cycle.push(self.tasks[child].id.clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }
        None
    }

    /// Kahn's algorithm with a min-heap on arena index (= creation order, then id).
    /// Only called on acyclic graphs.
    fn kahn_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut heap: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(Reverse(n)) = heap.pop() {
            order.push(n);
            for &dep in &self.dependents[n] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    heap.push(Reverse(dep));
                }
            }
        }
        order
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use orchestra_types::OrchestraError;

    /// Task with a creation time offset by `seq` seconds so ordering is predictable.
    pub(crate) fn task(id: &str, deps: &[&str], seq: i64) -> Task {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seq);
        Task {
            id: id.into(),
            project_id: "p".into(),
            title: id.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            dependency_depth: 0,
            retry_count: 0,
            metadata: HashMap::new(),
            created_at: created,
            updated_at: created,
            version: 0,
        }
    }

    fn with_status(mut t: Task, status: TaskStatus) -> Task {
        t.status = status;
        t
    }

    fn cycle_of(result: Result<()>) -> Vec<String> {
        match result {
            Err(OrchestraError::Dependency(DependencyError::Cycle { cycle })) => cycle,
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn acyclic_graph_validates() {
        let g = DependencyGraph::build(vec![
            task("a", &[], 0),
            task("b", &["a"], 1),
            task("c", &["a", "b"], 2),
        ])
        .unwrap();
        assert!(g.validate().is_ok());
    }

    #[test]
    fn three_node_cycle_rejected_with_witness() {
        let g = DependencyGraph::build(vec![
            task("a", &["c"], 0),
            task("b", &["a"], 1),
            task("c", &["b"], 2),
        ])
        .unwrap();
        let cycle = cycle_of(g.validate());
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        for id in ["a", "b", "c"] {
            assert!(cycle.contains(&id.to_string()));
        }
    }

    #[test]
    fn self_dependency_is_a_one_node_cycle() {
        let g = DependencyGraph::build(vec![task("a", &["a"], 0)]).unwrap();
        assert_eq!(cycle_of(g.validate()), vec!["a".to_string(), "a".to_string()]);
    }

    #[test]
    fn cycle_detected_away_from_the_roots() {
        // root -> x -> y -> z -> x ; the cycle is not reachable from an in-degree-0 node
        // in a way Kahn alone would report, DFS must still find it.
        let g = DependencyGraph::build(vec![
            task("root", &[], 0),
            task("x", &["root", "z"], 1),
            task("y", &["x"], 2),
            task("z", &["y"], 3),
            task("other", &[], 4),
        ])
        .unwrap();
        let cycle = cycle_of(g.validate());
        assert!(!cycle.contains(&"root".to_string()));
        assert!(cycle.contains(&"x".to_string()));
    }

    #[test]
    fn unknown_dependency_rejected_at_build() {
        let err = DependencyGraph::build(vec![task("a", &["ghost"], 0)]).unwrap_err();
        assert!(matches!(
            err,
            OrchestraError::Dependency(DependencyError::UnknownDependency { ref dependency, .. })
                if dependency == "ghost"
        ));
    }

    #[test]
    fn duplicate_ids_rejected_at_build() {
        let err = DependencyGraph::build(vec![task("a", &[], 0), task("a", &[], 1)]).unwrap_err();
        assert!(matches!(
            err,
            OrchestraError::Dependency(DependencyError::DuplicateTask { .. })
        ));
    }

    #[test]
    fn depth_limit_enforced() {
        // chain t0 <- t1 <- ... <- t4 has depth 4
        let chain: Vec<Task> = (0..5)
            .map(|i| {
                let deps: Vec<String> = if i == 0 { vec![] } else { vec![format!("t{}", i - 1)] };
                let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
                task(&format!("t{i}"), &dep_refs, i)
            })
            .collect();

        let ok = DependencyGraph::build(chain.clone()).unwrap().with_max_depth(4);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.depths().unwrap()["t4"], 4);

        let too_deep = DependencyGraph::build(chain).unwrap().with_max_depth(3);
        match too_deep.validate() {
            Err(OrchestraError::Dependency(DependencyError::DepthExceeded { task, depth, max })) => {
                assert_eq!(task, "t4");
                assert_eq!(depth, 4);
                assert_eq!(max, 3);
            }
            other => panic!("expected depth error, got {other:?}"),
        }
    }

    #[test]
    fn depth_is_longest_path() {
        let g = DependencyGraph::build(vec![
            task("a", &[], 0),
            task("b", &["a"], 1),
            task("c", &["b"], 2),
            task("d", &["a", "c"], 3),
        ])
        .unwrap();
        let depths = g.depths().unwrap();
        assert_eq!(depths["a"], 0);
        assert_eq!(depths["d"], 3);
    }

    #[test]
    fn topological_order_respects_edges_and_is_complete() {
        let tasks = vec![
            task("d", &["b", "c"], 0),
            task("c", &["a"], 1),
            task("b", &["a"], 2),
            task("a", &[], 3),
            task("e", &[], 4),
        ];
        let g = DependencyGraph::build(tasks.clone()).unwrap();
        let order = g.topological_order().unwrap();

        assert_eq!(order.len(), tasks.len());
        let unique: HashSet<_> = order.iter().collect();
        assert_eq!(unique.len(), order.len());

        let pos: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        for t in &tasks {
            for dep in &t.depends_on {
                assert!(pos[dep.as_str()] < pos[t.id.as_str()], "{dep} before {}", t.id);
            }
        }
    }

    #[test]
    fn topological_ties_break_by_creation_then_id() {
        let g = DependencyGraph::build(vec![
            task("zeta", &[], 0),
            task("beta", &[], 1),
            task("alpha", &[], 1),
        ])
        .unwrap();
        assert_eq!(g.topological_order().unwrap(), vec!["zeta", "alpha", "beta"]);
    }

    #[test]
    fn topological_order_fails_on_cycle() {
        let g = DependencyGraph::build(vec![task("a", &["b"], 0), task("b", &["a"], 1)]).unwrap();
        assert!(g.topological_order().is_err());
    }

    #[test]
    fn ready_set_requires_completed_dependencies() {
        let g = DependencyGraph::build(vec![
            with_status(task("a", &[], 0), TaskStatus::Completed),
            task("b", &["a"], 1),
            task("c", &["b"], 2),
            with_status(task("d", &[], 3), TaskStatus::InProgress),
            with_status(task("e", &[], 4), TaskStatus::Ready),
        ])
        .unwrap();
        let ready: Vec<&str> = g.ready_set().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["b", "e"]);
    }

    #[test]
    fn ready_set_is_idempotent() {
        let g = DependencyGraph::build(vec![
            with_status(task("a", &[], 0), TaskStatus::Completed),
            task("b", &["a"], 1),
            task("c", &[], 2),
        ])
        .unwrap();
        let first: Vec<String> = g.ready_set().iter().map(|t| t.id.clone()).collect();
        let second: Vec<String> = g.ready_set().iter().map(|t| t.id.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn failed_dependency_keeps_dependent_out_of_ready_set() {
        let g = DependencyGraph::build(vec![
            with_status(task("a", &[], 0), TaskStatus::Failed),
            task("b", &["a"], 1),
        ])
        .unwrap();
        assert!(g.ready_set().is_empty());
    }

    #[test]
    fn descendants_are_transitive() {
        // a -> b, a -> c, c -> d ; e unrelated
        let g = DependencyGraph::build(vec![
            task("a", &[], 0),
            task("b", &["a"], 1),
            task("c", &["a"], 2),
            task("d", &["c"], 3),
            task("e", &[], 4),
        ])
        .unwrap();
        let mut desc = g.descendants("a").unwrap();
        desc.sort();
        assert_eq!(desc, vec!["b", "c", "d"]);
        assert!(g.descendants("e").unwrap().is_empty());
        assert!(g.descendants("missing").is_err());
    }

    #[test]
    fn dependents_of_lists_direct_edges_only() {
        let g = DependencyGraph::build(vec![
            task("a", &[], 0),
            task("b", &["a"], 1),
            task("c", &["b"], 2),
        ])
        .unwrap();
        assert_eq!(g.dependents_of("a"), vec!["b"]);
    }

    #[test]
    fn long_chain_does_not_overflow() {
        let n = 50_000;
        let tasks: Vec<Task> = (0..n)
            .map(|i| {
                let dep = format!("t{}", i.max(1) - 1);
                if i == 0 {
                    task("t0", &[], 0)
                } else {
                    task(&format!("t{i}"), &[dep.as_str()], i)
                }
            })
            .collect();
        let g = DependencyGraph::build(tasks).unwrap().with_max_depth(n as usize);
        assert!(g.validate().is_ok());
    }
}
