//! Cycle detection over plugin and module type dependency graphs.
//!
//! Two graphs are checked separately: plugins keyed by name (edges from
//! `base` and `dependencies`), and module types keyed by
//! `(plugin name, module type name)` (edges from the module type `base`).
//! Both report a cycle as the visited path, e.g. `a <- b <- a`.

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;

/// Search `graph` for a cycle.
///
/// Nodes are visited in map order and edges in list order, so the reported
/// cycle is deterministic. The returned path starts and ends on the same
/// node. Edges to nodes missing from the map are ignored.
pub fn find_cycle<K>(graph: &BTreeMap<K, Vec<K>>) -> Option<Vec<K>>
where
    K: Ord + Hash + Clone,
{
    let mut done: HashSet<K> = HashSet::new();

    for start in graph.keys() {
        if done.contains(start) {
            continue;
        }
        let mut path: Vec<K> = Vec::new();
        if let Some(cycle) = visit(graph, start, &mut path, &mut done) {
            return Some(cycle);
        }
    }

    None
}

fn visit<K>(
    graph: &BTreeMap<K, Vec<K>>,
    node: &K,
    path: &mut Vec<K>,
    done: &mut HashSet<K>,
) -> Option<Vec<K>>
where
    K: Ord + Hash + Clone,
{
    if let Some(pos) = path.iter().position(|n| n == node) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(node.clone());
        return Some(cycle);
    }
    if done.contains(node) {
        return None;
    }

    path.push(node.clone());
    for next in graph.get(node).into_iter().flatten() {
        if !graph.contains_key(next) {
            continue;
        }
        if let Some(cycle) = visit(graph, next, path, done) {
            return Some(cycle);
        }
    }
    path.pop();
    done.insert(node.clone());

    None
}

/// Render a cycle as `a <- b <- a`.
pub fn format_cycle<K, F>(cycle: &[K], label: F) -> String
where
    F: Fn(&K) -> String,
{
    cycle.iter().map(label).collect::<Vec<_>>().join(" <- ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(node, deps)| {
                (
                    node.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_acyclic_graph() {
        let g = graph(&[("a", &["b", "c"]), ("b", &["c"]), ("c", &[])]);
        assert!(find_cycle(&g).is_none());
    }

    #[test]
    fn test_two_node_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let cycle = find_cycle(&g).unwrap();
        assert_eq!(format_cycle(&cycle, |s| s.clone()), "a <- b <- a");
    }

    #[test]
    fn test_self_reference() {
        let g = graph(&[("a", &["a"])]);
        let cycle = find_cycle(&g).unwrap();
        assert_eq!(format_cycle(&cycle, |s| s.clone()), "a <- a");
    }

    #[test]
    fn test_cycle_reported_from_entry_point() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["b"])]);
        let cycle = find_cycle(&g).unwrap();
        assert_eq!(format_cycle(&cycle, |s| s.clone()), "b <- c <- b");
    }

    #[test]
    fn test_missing_nodes_are_ignored() {
        let g = graph(&[("a", &["missing"])]);
        assert!(find_cycle(&g).is_none());
    }

    #[test]
    fn test_tuple_keys() {
        let mut g: BTreeMap<(String, String), Vec<(String, String)>> = BTreeMap::new();
        let foo = ("a".to_string(), "foo".to_string());
        let bar = ("b".to_string(), "bar".to_string());
        g.insert(foo.clone(), vec![bar.clone()]);
        g.insert(bar.clone(), vec![foo.clone()]);

        let cycle = find_cycle(&g).unwrap();
        let rendered =
            format_cycle(&cycle, |(plugin, ty)| format!("{} (from plugin {})", ty, plugin));
        assert_eq!(
            rendered,
            "foo (from plugin a) <- bar (from plugin b) <- foo (from plugin a)"
        );
    }
}
