//! Dependency-graph analysis for workflow steps.
//!
//! Uses `petgraph` to model the `after` edges as a directed graph.
//! Topological sort detects cycles; the execution order returned here keeps
//! the workflow's declaration order among steps whose dependencies are
//! equally satisfied, because dispatch order is observable behaviour.

use std::collections::{HashMap, HashSet, VecDeque};

use bioflow_types::workflow::WorkflowDefinition;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate that the `after` edges form a DAG over existing steps.
pub fn validate_dag(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let index_of: HashMap<&str, usize> = def
        .steps
        .keys()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = def
        .steps
        .keys()
        .map(|name| graph.add_node(name.as_str()))
        .collect();

    for (name, step) in &def.steps {
        let to = index_of[name.as_str()];
        for dep in &step.after {
            let from = index_of.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{name}' depends on unknown step '{dep}'"
                ))
            })?;
            graph.add_edge(node_indices[*from], node_indices[to], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let step = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{step}'"))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Execution order
// ---------------------------------------------------------------------------

/// Topological order of step names with declaration-order tie-breaking.
///
/// Kahn's algorithm over the `after` edges; among steps whose dependencies
/// are all satisfied, the one declared first in the workflow document comes
/// first. The scheduler's ready queue relies on the same ordering rule.
pub fn execution_order(def: &WorkflowDefinition) -> Result<Vec<String>, WorkflowError> {
    validate_dag(def)?;

    let names: Vec<&str> = def.steps.keys().map(String::as_str).collect();
    let mut indegree: HashMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();
    for (name, step) in &def.steps {
        *indegree.get_mut(name.as_str()).unwrap() += step.after.len();
    }

    let dependents = dependents_of(def);

    // Seed the queue in declaration order; pushed entries also arrive in
    // declaration order because dependents_of preserves it.
    let mut queue: VecDeque<&str> = names
        .iter()
        .copied()
        .filter(|n| indegree[n] == 0)
        .collect();
    let mut order = Vec::with_capacity(names.len());

    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            for dependent in deps {
                let d = indegree.get_mut(dependent.as_str()).unwrap();
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dependent.as_str());
                }
            }
        }
    }

    Ok(order)
}

// ---------------------------------------------------------------------------
// Dependent maps (used for skip fan-out)
// ---------------------------------------------------------------------------

/// Reverse adjacency: step name -> names of steps whose `after` contains it,
/// in declaration order.
pub fn dependents_of(def: &WorkflowDefinition) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, step) in &def.steps {
        for dep in &step.after {
            map.entry(dep.clone()).or_default().push(name.clone());
        }
    }
    map
}

/// Transitive closure of dependents for a step: every step that directly or
/// indirectly lists it in `after`.
pub fn transitive_dependents(
    step_name: &str,
    dependents: &HashMap<String, Vec<String>>,
) -> HashSet<String> {
    let mut visited = HashSet::new();
    let mut stack = vec![step_name.to_string()];

    while let Some(current) = stack.pop() {
        if let Some(children) = dependents.get(&current) {
            for child in children {
                if visited.insert(child.clone()) {
                    stack.push(child.clone());
                }
            }
        }
    }

    visited
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
