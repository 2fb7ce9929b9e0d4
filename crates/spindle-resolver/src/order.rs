use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ConcretizationError, ConcretizationResult};
use crate::graph::Graph;

/// Kahn's algorithm over the graph's edges, leaves first, ties broken by name.
pub(crate) fn topo_order(graph: &Graph) -> ConcretizationResult<Vec<String>> {
    let mut reverse: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();

    for (name, node) in &graph.nodes {
        let children = node
            .edges
            .keys()
            .filter(|child| graph.nodes.contains_key(*child))
            .collect::<Vec<_>>();
        in_degree.insert(name, children.len());
        for child in children {
            reverse.entry(child).or_default().insert(name);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter_map(|(name, degree)| (*degree == 0).then_some(*name))
        .collect();
    let mut ordered = Vec::new();

    while let Some(next) = ready.pop_first() {
        ordered.push(next.to_string());
        if let Some(parents) = reverse.get(next) {
            for parent in parents {
                if let Some(degree) = in_degree.get_mut(parent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(parent);
                    }
                }
            }
        }
    }

    if ordered.len() != graph.nodes.len() {
        let cycle_nodes = graph
            .nodes
            .keys()
            .filter(|name| !ordered.contains(name))
            .cloned()
            .collect::<Vec<_>>();
        return Err(ConcretizationError::CyclicDependency {
            packages: cycle_nodes,
        });
    }

    Ok(ordered)
}
