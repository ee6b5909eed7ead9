//! Dependency-graph checks for workflow configs.
//!
//! The graph is stored as `{task_id, dependencies}` entries and rebuilt
//! into an adjacency map on demand; validation is three-color DFS, ordering
//! is Kahn's algorithm.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{EngineError, EngineResult};

/// Adjacency map: child task id -> the ids it depends on.
pub type DependencyGraph = HashMap<i64, Vec<i64>>;

/// Check that every declared dependency points into the child set.
pub fn validate_edges(graph: &DependencyGraph) -> EngineResult<()> {
    for (task_id, deps) in graph {
        for dep in deps {
            if !graph.contains_key(dep) {
                return Err(EngineError::Validation(format!(
                    "child task {task_id} depends on {dep}, which is not in the workflow"
                )));
            }
        }
    }
    Ok(())
}

/// Reject cyclic dependency graphs.
pub fn detect_cycles(graph: &DependencyGraph) -> EngineResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: i64,
        graph: &DependencyGraph,
        colors: &mut HashMap<i64, Color>,
    ) -> EngineResult<()> {
        colors.insert(node, Color::Gray);
        for &dep in graph.get(&node).map(Vec::as_slice).unwrap_or_default() {
            match colors.get(&dep).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    return Err(EngineError::Validation(format!(
                        "workflow dependency cycle through task {dep}"
                    )));
                }
                Color::White => visit(dep, graph, colors)?,
                Color::Black => {}
            }
        }
        colors.insert(node, Color::Black);
        Ok(())
    }

    let mut colors = HashMap::new();
    for &node in graph.keys() {
        if colors.get(&node).copied().unwrap_or(Color::White) == Color::White {
            visit(node, graph, &mut colors)?;
        }
    }
    Ok(())
}

/// Topological order via Kahn's algorithm, seeded in `declared_order` so
/// independent children run in the order the config lists them.
pub fn topological_order(
    declared_order: &[i64],
    graph: &DependencyGraph,
) -> EngineResult<Vec<i64>> {
    let mut in_degree: HashMap<i64, usize> = graph
        .iter()
        .map(|(&id, deps)| (id, deps.len()))
        .collect();

    // Reverse edges: who unblocks whom.
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for (&id, deps) in graph {
        for &dep in deps {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut queue: VecDeque<i64> = declared_order
        .iter()
        .copied()
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(id) = queue.pop_front() {
        order.push(id);
        for &dependent in dependents.get(&id).map(Vec::as_slice).unwrap_or_default() {
            let degree = in_degree
                .get_mut(&dependent)
                .expect("dependent is in the graph");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() != graph.len() {
        return Err(EngineError::Validation(
            "workflow has no valid execution order (dependency cycle)".to_string(),
        ));
    }
    Ok(order)
}

/// Children not yet accounted for whose dependencies are all done
/// (successfully or not), in declared order.
pub fn ready_set(
    declared_order: &[i64],
    graph: &DependencyGraph,
    done: &HashSet<i64>,
) -> Vec<i64> {
    declared_order
        .iter()
        .copied()
        .filter(|id| !done.contains(id))
        .filter(|id| {
            graph
                .get(id)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .all(|dep| done.contains(dep))
        })
        .collect()
}
