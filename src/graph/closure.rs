// src/graph/closure.rs

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;

use tokio::task::JoinSet;

/// Compute the closure of `seeds` under `edges_of`.
///
/// Edge lookups run concurrently on the runtime via a [`JoinSet`]; a node is
/// expanded at most once, so self-edges and cycles terminate. The result
/// always contains every seed and is closed under `edges_of` restricted to
/// reachable nodes. Traversal order is unspecified.
///
/// The first edge-lookup error wins: it is returned to the caller and the
/// remaining in-flight lookups are aborted when the `JoinSet` is dropped.
/// Errors travel back as values, never across threads by unwinding.
pub async fn compute_closure<T, E, F, Fut>(
    seeds: impl IntoIterator<Item = T>,
    edges_of: F,
) -> Result<HashSet<T>, E>
where
    T: Clone + Eq + Hash + Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<HashSet<T>, E>> + Send + 'static,
{
    let mut visited: HashSet<T> = HashSet::new();
    let mut in_flight = JoinSet::new();

    for seed in seeds {
        if visited.insert(seed.clone()) {
            in_flight.spawn(edges_of(seed));
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        let edges = match joined {
            Ok(Ok(edges)) => edges,
            Ok(Err(e)) => return Err(e),
            Err(join_err) if join_err.is_panic() => {
                std::panic::resume_unwind(join_err.into_panic())
            }
            // Aborted task; nothing to merge.
            Err(_) => continue,
        };

        for next in edges {
            if visited.insert(next.clone()) {
                in_flight.spawn(edges_of(next));
            }
        }
    }

    Ok(visited)
}
