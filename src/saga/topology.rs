//! Dependency map to execution layers
//!
//! Layering uses Kahn's algorithm. Each frontier of zero in-degree nodes
//! becomes one layer, sorted so that identical inputs always produce
//! identical layers.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Cycle detected among: {}", remaining.join(", "))]
    CycleDetected {
        /// Nodes that could not be placed in any layer
        remaining: Vec<String>,
    },

    #[error("'{node}' depends on unknown '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
}

/// Partition the keys of `deps` into layers.
///
/// `deps` maps each node to the nodes it depends on. Every key appears in
/// exactly one layer, and all of its dependencies appear in strictly earlier
/// layers. Fails without a partial result if the graph contains a cycle.
pub fn compute_layers<K>(deps: &HashMap<K, Vec<K>>) -> Result<Vec<Vec<K>>, TopologyError>
where
    K: Clone + Eq + Hash + Ord + Display,
{
    let mut in_degree: HashMap<&K, usize> = deps.keys().map(|k| (k, 0)).collect();
    let mut successors: HashMap<&K, Vec<&K>> = HashMap::new();

    for (node, node_deps) in deps {
        let unique: HashSet<&K> = node_deps.iter().collect();
        for dep in unique {
            if !deps.contains_key(dep) {
                return Err(TopologyError::UnknownDependency {
                    node: node.to_string(),
                    dependency: dep.to_string(),
                });
            }
            successors.entry(dep).or_default().push(node);
            *in_degree.entry(node).or_insert(0) += 1;
        }
    }

    let mut frontier: Vec<&K> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(k, _)| *k)
        .collect();
    frontier.sort();

    let mut layers = Vec::new();
    let mut processed = 0;

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for node in &frontier {
            if let Some(children) = successors.get(node) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*child);
                        }
                    }
                }
            }
        }
        processed += frontier.len();
        layers.push(frontier.iter().map(|k| (*k).clone()).collect());
        next.sort();
        frontier = next;
    }

    if processed < deps.len() {
        let mut remaining: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(k, _)| k.to_string())
            .collect();
        remaining.sort();
        return Err(TopologyError::CycleDetected { remaining });
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(edges: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    fn assert_valid_layering(input: &HashMap<String, Vec<String>>, layers: &[Vec<String>]) {
        let mut position = HashMap::new();
        for (i, layer) in layers.iter().enumerate() {
            for id in layer {
                assert!(position.insert(id.clone(), i).is_none(), "{} placed twice", id);
            }
        }
        assert_eq!(position.len(), input.len());
        for (id, id_deps) in input {
            for dep in id_deps {
                assert!(position[dep] < position[id], "{} not before {}", dep, id);
            }
        }
    }

    #[test]
    fn test_diamond() {
        let input = deps(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let layers = compute_layers(&input).unwrap();
        assert_eq!(
            layers,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_valid_layering(&input, &layers);
    }

    #[test]
    fn test_independent_nodes_share_sorted_layer() {
        let input = deps(&[("zeta", &[]), ("alpha", &[]), ("mid", &[])]);
        let layers = compute_layers(&input).unwrap();
        assert_eq!(layers, vec![vec!["alpha", "mid", "zeta"]]);
    }

    #[test]
    fn test_uneven_depths() {
        let input = deps(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("x", &[]),
            ("y", &["x", "c"]),
            ("z", &["a", "a"]),
        ]);
        let layers = compute_layers(&input).unwrap();
        assert_valid_layering(&input, &layers);
        assert_eq!(layers.len(), 4);
    }

    #[test]
    fn test_empty_map() {
        let input: HashMap<String, Vec<String>> = HashMap::new();
        assert!(compute_layers(&input).unwrap().is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let input = deps(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("root", &[])]);
        let err = compute_layers(&input).unwrap_err();
        assert_eq!(
            err,
            TopologyError::CycleDetected {
                remaining: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            }
        );
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let input = deps(&[("a", &["a"])]);
        assert!(matches!(
            compute_layers(&input),
            Err(TopologyError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let input = deps(&[("a", &["ghost"])]);
        assert_eq!(
            compute_layers(&input).unwrap_err(),
            TopologyError::UnknownDependency {
                node: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }
}
