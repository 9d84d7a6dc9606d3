// src/lib.rs

//! Goal-oriented build scheduling for content-addressed package stores.
//!
//! The crate turns "realise these store paths / derivation outputs" into a
//! dependency-ordered run of substitutions and builds. Everything that
//! touches disk or network lives behind the [`store`] traits; this crate
//! only decides what runs, where, and when.

pub mod capability;
pub mod config;
pub mod errors;
pub mod goal;
pub mod graph;
pub mod logging;
pub mod store;
pub mod types;
pub mod worker;

use std::sync::Arc;

use crate::config::ConfigFile;
use crate::errors::Result;
use crate::store::{BuildExecutor, Store, Substituter};
use crate::types::{BuildMode, DerivedPath};

pub use crate::goal::{FailureKind, GoalOutcome, SuccessStatus};
pub use crate::worker::{InterruptHandle, RealizeOutcome, Worker};

/// High-level entry point for embedders.
///
/// Wires a [`Worker`] from a validated configuration and the given
/// collaborators, then drives every request to a terminal outcome. Each
/// call is one independent run: goal identity and substituter cooldowns do
/// not carry over.
pub async fn realize(
    config: &ConfigFile,
    store: Arc<dyn Store>,
    substituters: Vec<Arc<dyn Substituter>>,
    executor: Arc<dyn BuildExecutor>,
    requests: Vec<DerivedPath>,
    mode: BuildMode,
) -> Result<Vec<RealizeOutcome>> {
    let worker = Worker::new(
        config.scheduler_config(),
        store,
        substituters,
        executor,
        config.machines(),
    );
    worker.realize(requests, mode).await
}
