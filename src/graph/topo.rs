// src/graph/topo.rs

use std::collections::HashSet;
use std::hash::Hash;

/// A cycle discovered during [`topo_sort`]: `node` was reached again while
/// it was still on the DFS stack, via `parent`.
///
/// Cycle detection is a normal, reportable outcome here, not a panic or an
/// error type: callers decide how fatal it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle<T> {
    pub node: T,
    pub parent: T,
}

/// Topologically sort `items` under the given child relation.
///
/// The returned order is *reverse* topological: dependents come before
/// their dependencies. Reverse the result to get "dependencies first".
///
/// Children that are not present in `items` are ignored; the sort only
/// orders the given item set and treats external references as leaves.
/// Self-edges are skipped rather than reported as cycles.
///
/// The DFS keeps its own frame stack on the heap, so arbitrarily deep
/// dependency chains cannot overflow the call stack.
pub fn topo_sort<T, F>(items: &HashSet<T>, children_of: F) -> Result<Vec<T>, Cycle<T>>
where
    T: Clone + Eq + Hash,
    F: Fn(&T) -> HashSet<T>,
{
    let mut sorted = Vec::with_capacity(items.len());
    let mut visited: HashSet<T> = HashSet::new();
    // Nodes on the current DFS path, distinct from `visited`: only a back
    // edge to one of these is a cycle.
    let mut on_path: HashSet<T> = HashSet::new();
    let mut stack: Vec<(T, std::collections::hash_set::IntoIter<T>)> = Vec::new();

    for root in items {
        if visited.contains(root) {
            continue;
        }
        visited.insert(root.clone());
        on_path.insert(root.clone());
        stack.push((root.clone(), children_of(root).into_iter()));

        loop {
            let descend = match stack.last_mut() {
                None => break,
                Some((node, children)) => loop {
                    match children.next() {
                        None => break None,
                        Some(child) => {
                            if child == *node || !items.contains(&child) {
                                continue;
                            }
                            if on_path.contains(&child) {
                                return Err(Cycle {
                                    node: child,
                                    parent: node.clone(),
                                });
                            }
                            if visited.contains(&child) {
                                continue;
                            }
                            break Some(child);
                        }
                    }
                },
            };

            match descend {
                Some(child) => {
                    visited.insert(child.clone());
                    on_path.insert(child.clone());
                    let children = children_of(&child).into_iter();
                    stack.push((child, children));
                }
                None => {
                    // Frame exhausted; the node leaves the path finished.
                    if let Some((node, _)) = stack.pop() {
                        on_path.remove(&node);
                        sorted.push(node);
                    }
                }
            }
        }
    }

    sorted.reverse();
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn run(
        nodes: &[&str],
        edges: &[(&str, &str)],
    ) -> Result<Vec<String>, Cycle<String>> {
        let items: HashSet<String> = nodes.iter().map(|s| s.to_string()).collect();
        let mut children: HashMap<String, HashSet<String>> = HashMap::new();
        for (from, to) in edges {
            children
                .entry(from.to_string())
                .or_default()
                .insert(to.to_string());
        }
        topo_sort(&items, |n| children.get(n).cloned().unwrap_or_default())
    }

    /// `edges` read as "parent depends on child", so in the (reverse
    /// topological) output every parent must come before its children.
    fn assert_valid_order(sorted: &[String], edges: &[(&str, &str)]) {
        let pos: HashMap<&str, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        for (parent, child) in edges {
            let (Some(&p), Some(&c)) = (pos.get(parent), pos.get(child)) else {
                continue;
            };
            assert!(p < c, "'{parent}' must precede '{child}' in {sorted:?}");
        }
    }

    #[test]
    fn empty_graph_sorts_to_nothing() {
        assert_eq!(run(&[], &[]).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn chain_sorts_dependents_first() {
        let edges = [("a", "b"), ("b", "c")];
        let sorted = run(&["a", "b", "c"], &edges).unwrap();
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_respects_all_edges() {
        let edges = [("top", "left"), ("top", "right"), ("left", "bottom"), ("right", "bottom")];
        let sorted = run(&["top", "left", "right", "bottom"], &edges).unwrap();
        assert_eq!(sorted.len(), 4);
        assert_valid_order(&sorted, &edges);
    }

    #[test]
    fn two_cycle_is_reported() {
        let result = run(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let cycle = result.unwrap_err();
        assert_ne!(cycle.node, cycle.parent);
    }

    #[test]
    fn self_edge_is_not_a_cycle() {
        let sorted = run(&["a", "b"], &[("a", "a"), ("a", "b")]).unwrap();
        assert_eq!(sorted, vec!["a", "b"]);
    }

    #[test]
    fn external_children_are_ignored() {
        // "b" points at "missing", which is not in the item set.
        let sorted = run(&["a", "b"], &[("a", "b"), ("b", "missing")]).unwrap();
        assert_eq!(sorted, vec!["a", "b"]);
    }

    #[test]
    fn cycle_behind_a_chain_is_found() {
        let result = run(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "c"), ("c", "d"), ("d", "b")],
        );
        assert!(result.is_err());
    }

    #[test]
    fn deep_chain_does_not_overflow_the_stack() {
        let n: u32 = 100_000;
        let items: HashSet<u32> = (0..n).collect();
        let sorted = topo_sort(&items, |i| {
            if i + 1 < n {
                HashSet::from([i + 1])
            } else {
                HashSet::new()
            }
        })
        .unwrap();
        assert_eq!(sorted.len(), n as usize);
        assert_eq!(sorted.first(), Some(&0));
        assert_eq!(sorted.last(), Some(&(n - 1)));
    }

    #[test]
    fn disconnected_components_all_appear() {
        let sorted = run(&["a", "b", "x", "y"], &[("a", "b"), ("x", "y")]).unwrap();
        assert_eq!(sorted.len(), 4);
        assert_valid_order(&sorted, &[("a", "b"), ("x", "y")]);
    }
}
