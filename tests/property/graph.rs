use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use builddag::graph::{compute_closure, topo_sort};

type Graph = HashMap<u32, HashSet<u32>>;

/// Random DAG over nodes `0..n`: node `i` may only point at nodes `< i`,
/// which makes cycles impossible by construction.
fn dag_strategy(max_nodes: u32) -> impl Strategy<Value = Graph> {
    (1..=max_nodes).prop_flat_map(|n| {
        proptest::collection::vec(
            proptest::collection::vec(any::<u32>(), 0..8),
            n as usize,
        )
        .prop_map(move |raw| {
            let mut graph: Graph = HashMap::new();
            for (i, targets) in raw.into_iter().enumerate() {
                let i = i as u32;
                let edges: HashSet<u32> = targets
                    .into_iter()
                    .filter(|_| i > 0)
                    .map(|t| t % i.max(1))
                    .collect();
                graph.insert(i, edges);
            }
            graph
        })
    })
}

fn children(graph: &Graph, node: &u32) -> HashSet<u32> {
    graph.get(node).cloned().unwrap_or_default()
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

async fn closure_of(graph: &Graph, seeds: Vec<u32>) -> HashSet<u32> {
    let graph = std::sync::Arc::new(graph.clone());
    compute_closure(seeds, move |node| {
        let graph = std::sync::Arc::clone(&graph);
        async move {
            Ok::<_, std::convert::Infallible>(children(&graph, &node))
        }
    })
    .await
    .unwrap()
}

proptest! {
    #[test]
    fn closure_contains_seeds_and_is_closed(graph in dag_strategy(24)) {
        let seeds: Vec<u32> = graph.keys().copied().filter(|k| k % 3 == 0).collect();
        let closure = block_on(closure_of(&graph, seeds.clone()));

        for seed in &seeds {
            prop_assert!(closure.contains(seed));
        }
        for node in &closure {
            for child in children(&graph, node) {
                prop_assert!(closure.contains(&child), "not closed at {node} -> {child}");
            }
        }
    }

    #[test]
    fn closure_is_idempotent(graph in dag_strategy(24)) {
        let seeds: Vec<u32> = graph.keys().copied().take(3).collect();
        let once = block_on(closure_of(&graph, seeds));
        let twice = block_on(closure_of(&graph, once.iter().copied().collect()));
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn topo_sort_orders_every_dag(graph in dag_strategy(24)) {
        let items: HashSet<u32> = graph.keys().copied().collect();
        let sorted = topo_sort(&items, |n| children(&graph, n)).unwrap();

        prop_assert_eq!(sorted.len(), items.len());
        // Reverse topological: every node precedes its children.
        let pos: HashMap<u32, usize> =
            sorted.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        for node in &items {
            for child in children(&graph, node) {
                prop_assert!(pos[node] < pos[&child], "{node} must precede {child}");
            }
        }
    }

    #[test]
    fn planted_cycle_is_always_detected(len in 2u32..16, extra in dag_strategy(8)) {
        // A ring 0 -> 1 -> ... -> len-1 -> 0, plus unrelated DAG nodes
        // shifted above the ring.
        let mut graph: Graph = HashMap::new();
        for i in 0..len {
            graph.insert(i, HashSet::from([(i + 1) % len]));
        }
        for (node, edges) in extra {
            graph
                .entry(node + len)
                .or_default()
                .extend(edges.into_iter().map(|e| e + len));
        }

        let items: HashSet<u32> = graph.keys().copied().collect();
        let result = topo_sort(&items, |n| children(&graph, n));
        prop_assert!(result.is_err());
    }
}
