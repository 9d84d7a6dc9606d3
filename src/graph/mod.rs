// src/graph/mod.rs

//! Generic graph utilities: reachability closure and cycle-detecting
//! topological sort.
//!
//! These carry no scheduling state; they are pure functions over
//! caller-supplied edge functions. The worker and the derivation goal use
//! them to expand "build this" requests into full dependency sets and to
//! reject impossible build orders.

pub mod closure;
pub mod topo;

pub use closure::compute_closure;
pub use topo::{topo_sort, Cycle};
