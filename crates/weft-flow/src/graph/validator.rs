use std::collections::{HashMap, HashSet};

use weft_core::error::{Result, WeftError};
use weft_core::types::NodeId;

/// Adjacency access needed to check a dependency graph.
pub trait DependencyGraph {
    fn has_node(&self, id: &NodeId) -> bool;

    /// The nodes `id` depends on, or `None` if `id` is absent.
    fn dependencies_of(&self, id: &NodeId) -> Option<&[NodeId]>;

    /// Every node id, in a stable order.
    fn all_ids(&self) -> Vec<&NodeId>;
}

/// Outcome of checking a proposed `source -> target` connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub is_valid: bool,
    /// Human-readable reason when rejected.
    pub reason: Option<String>,
}

impl Validation {
    pub fn accepted() -> Self {
        Self {
            is_valid: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Check whether `target` may start depending on `source`.
pub fn validate<G: DependencyGraph + ?Sized>(
    graph: &G,
    source: &NodeId,
    target: &NodeId,
) -> Validation {
    match check_connection(graph, source, target) {
        Ok(()) => Validation::accepted(),
        Err(e) => Validation::rejected(e.to_string()),
    }
}

/// Like [`validate`], but returns the specific rejection as an error.
pub fn check_connection<G: DependencyGraph + ?Sized>(
    graph: &G,
    source: &NodeId,
    target: &NodeId,
) -> Result<()> {
    if source == target {
        return Err(WeftError::SelfConnection(source.to_string()));
    }
    if !graph.has_node(source) {
        return Err(WeftError::NodeNotFound(source.to_string()));
    }
    if !graph.has_node(target) {
        return Err(WeftError::NodeNotFound(target.to_string()));
    }
    // The new edge closes a cycle iff target is already upstream of source.
    if reachable(graph, source, target) {
        return Err(WeftError::CycleDetected {
            from: source.to_string(),
            to: target.to_string(),
        });
    }
    Ok(())
}

/// Whether `goal` can be reached from `start` by following `depends_on` edges.
fn reachable<G: DependencyGraph + ?Sized>(graph: &G, start: &NodeId, goal: &NodeId) -> bool {
    let mut visited: HashSet<&NodeId> = HashSet::new();
    let mut stack: Vec<&NodeId> = vec![start];

    while let Some(id) = stack.pop() {
        if id == goal {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(deps) = graph.dependencies_of(id) {
            stack.extend(deps.iter().filter(|d| !visited.contains(d)));
        }
    }
    false
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Find a dependency cycle, returned as the path of ids that closes it.
pub fn find_cycle<G: DependencyGraph + ?Sized>(graph: &G) -> Option<Vec<NodeId>> {
    let mut marks: HashMap<&NodeId, Mark> = HashMap::new();

    for root in graph.all_ids() {
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root, Mark::OnPath);
        // (node, index of the next dependency to follow)
        let mut path: Vec<(&NodeId, usize)> = vec![(root, 0)];

        while let Some(frame) = path.last_mut() {
            let id: &NodeId = frame.0;
            let deps = graph.dependencies_of(id).unwrap_or_default();
            let Some(dep) = deps.get(frame.1) else {
                marks.insert(id, Mark::Done);
                path.pop();
                continue;
            };
            frame.1 += 1;

            match marks.get(dep).copied() {
                Some(Mark::Done) => {}
                Some(Mark::OnPath) => {
                    let pos = path.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<NodeId> =
                        path[pos..].iter().map(|(n, _)| (*n).clone()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                None => {
                    marks.insert(dep, Mark::OnPath);
                    path.push((dep, 0));
                }
            }
        }
    }
    None
}

/// Check every structural invariant: no self-loops, no dangling
/// dependencies, no cycles.
pub fn check_integrity<G: DependencyGraph + ?Sized>(graph: &G) -> Result<()> {
    for id in graph.all_ids() {
        for dep in graph.dependencies_of(id).unwrap_or_default() {
            if dep == id {
                return Err(WeftError::InvalidGraph(format!("node {} depends on itself", id)));
            }
            if !graph.has_node(dep) {
                return Err(WeftError::InvalidGraph(format!(
                    "node {} depends on missing node {}",
                    id, dep
                )));
            }
        }
    }

    if let Some(cycle) = find_cycle(graph) {
        let path: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
        return Err(WeftError::InvalidGraph(format!(
            "dependency cycle: {}",
            path.join(" -> ")
        )));
    }
    Ok(())
}
