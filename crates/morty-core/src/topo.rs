//! Deterministic topological sorting (Kahn's algorithm).
//!
//! Used twice by the plan graph: once over module names and once per module
//! over job indices. Ties are broken by the node's natural ordering so that
//! identical input always yields identical output, which is what makes the
//! execution order reproducible across restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

/// The dependency graph contains a cycle.
///
/// `node` is one node that sits on a cycle; `involved` lists every node the
/// sort could not place (cycle members plus anything downstream of them).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected at {node:?} (unsorted: {})", involved.join(", "))]
pub struct CycleError {
    pub node: String,
    pub involved: Vec<String>,
}

/// Sort `nodes` so that every node comes after all of its dependencies.
///
/// `deps_of` returns the direct dependencies of a node. Dependencies that are
/// not themselves in `nodes` are ignored (treated as already satisfied).
/// Duplicate dependency entries count once.
pub fn sort<N, F, I>(nodes: &[N], deps_of: F) -> Result<Vec<N>, CycleError>
where
    N: Ord + Clone + fmt::Display,
    F: Fn(&N) -> I,
    I: IntoIterator<Item = N>,
{
    let known: BTreeSet<&N> = nodes.iter().collect();

    // in_degree[n] = number of distinct in-graph dependencies of n.
    // dependents[d] = nodes that list d as a dependency.
    let mut in_degree: BTreeMap<N, usize> = BTreeMap::new();
    let mut deps: BTreeMap<N, BTreeSet<N>> = BTreeMap::new();
    let mut dependents: BTreeMap<N, BTreeSet<N>> = BTreeMap::new();

    for node in nodes {
        let node_deps: BTreeSet<N> = deps_of(node)
            .into_iter()
            .filter(|d| known.contains(d))
            .collect();
        in_degree.insert(node.clone(), node_deps.len());
        for dep in &node_deps {
            dependents
                .entry(dep.clone())
                .or_default()
                .insert(node.clone());
        }
        deps.insert(node.clone(), node_deps);
    }

    // A BTreeSet keeps the ready queue sorted on every insertion.
    let mut ready: BTreeSet<N> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(n, _)| n.clone())
        .collect();

    let mut sorted = Vec::with_capacity(in_degree.len());
    while let Some(node) = ready.pop_first() {
        if let Some(children) = dependents.get(&node) {
            for child in children {
                if let Some(deg) = in_degree.get_mut(child) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(child.clone());
                    }
                }
            }
        }
        sorted.push(node);
    }

    if sorted.len() < in_degree.len() {
        let remaining: BTreeSet<N> = in_degree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(n, _)| n)
            .collect();
        let node = remaining
            .first()
            .map(|start| find_cycle_member(start, &remaining, &deps).to_string())
            .unwrap_or_default();
        return Err(CycleError {
            node,
            involved: remaining.iter().map(ToString::to_string).collect(),
        });
    }

    Ok(sorted)
}

/// Walk unsorted dependencies until a node repeats; that node is on a cycle.
///
/// Every unsorted node has at least one unsorted dependency, so the walk
/// always revisits a node within `remaining.len()` steps.
fn find_cycle_member<N>(start: &N, remaining: &BTreeSet<N>, deps: &BTreeMap<N, BTreeSet<N>>) -> N
where
    N: Ord + Clone,
{
    let mut visited = BTreeSet::new();
    let mut current = start.clone();
    loop {
        if !visited.insert(current.clone()) {
            return current;
        }
        let next = deps
            .get(&current)
            .and_then(|ds| ds.iter().find(|d| remaining.contains(*d)))
            .cloned();
        match next {
            Some(n) => current = n,
            None => return current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps<'a>(table: &'a [(&'a str, &'a [&'a str])]) -> impl Fn(&String) -> Vec<String> + 'a {
        move |n: &String| {
            table
                .iter()
                .find(|(name, _)| *name == n.as_str())
                .map(|(_, ds)| ds.iter().map(|d| d.to_string()).collect())
                .unwrap_or_default()
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sorts_chain_in_dependency_order() {
        let table: &[(&str, &[&str])] = &[
            ("cli", &["quicksort_core", "file_handler"]),
            ("file_handler", &["quicksort_core"]),
            ("quicksort_core", &[]),
        ];
        let nodes = names(&["cli", "file_handler", "quicksort_core"]);
        let order = sort(&nodes, deps(table)).unwrap();
        assert_eq!(order, names(&["quicksort_core", "file_handler", "cli"]));
    }

    #[test]
    fn independent_nodes_come_out_lexicographically() {
        let table: &[(&str, &[&str])] = &[];
        let nodes = names(&["zeta", "alpha", "mid"]);
        let order = sort(&nodes, deps(table)).unwrap();
        assert_eq!(order, names(&["alpha", "mid", "zeta"]));
    }

    #[test]
    fn newly_freed_nodes_are_merged_into_sorted_queue() {
        // "b" frees up after "a" but must still come before "c".
        let table: &[(&str, &[&str])] = &[("b", &["a"]), ("c", &[]), ("d", &["c"])];
        let nodes = names(&["d", "c", "b", "a"]);
        let order = sort(&nodes, deps(table)).unwrap();
        assert_eq!(order, names(&["a", "b", "c", "d"]));
    }

    #[test]
    fn output_is_identical_across_input_permutations() {
        let table: &[(&str, &[&str])] = &[("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])];
        let first = sort(&names(&["a", "b", "c", "d"]), deps(table)).unwrap();
        let second = sort(&names(&["d", "c", "b", "a"]), deps(table)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ignores_unknown_and_duplicate_dependencies() {
        let table: &[(&str, &[&str])] = &[("b", &["a", "a", "external"])];
        let order = sort(&names(&["a", "b"]), deps(table)).unwrap();
        assert_eq!(order, names(&["a", "b"]));
    }

    #[test]
    fn reports_two_node_cycle() {
        let table: &[(&str, &[&str])] = &[("a", &["b"]), ("b", &["a"])];
        let err = sort(&names(&["a", "b"]), deps(table)).unwrap_err();
        assert!(err.node == "a" || err.node == "b");
        assert_eq!(err.involved, names(&["a", "b"]));
    }

    #[test]
    fn cycle_member_excludes_downstream_nodes() {
        // x -> y -> z -> x is the cycle; w only depends on it.
        let table: &[(&str, &[&str])] =
            &[("w", &["x"]), ("x", &["z"]), ("y", &["x"]), ("z", &["y"])];
        let err = sort(&names(&["w", "x", "y", "z"]), deps(table)).unwrap_err();
        assert_ne!(err.node, "w");
        assert!(err.involved.contains(&"w".to_string()));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let table: &[(&str, &[&str])] = &[("a", &["a"])];
        let err = sort(&names(&["a"]), deps(table)).unwrap_err();
        assert_eq!(err.node, "a");
    }

    #[test]
    fn sorts_numeric_job_indices() {
        let table = |n: &usize| -> Vec<usize> {
            match n {
                1 => vec![3],
                2 => vec![1],
                _ => vec![],
            }
        };
        let order = sort(&[1usize, 2, 3], table).unwrap();
        assert_eq!(order, vec![3, 1, 2]);
    }
}
