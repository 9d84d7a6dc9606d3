// src/store/mod.rs

//! Collaborator interfaces required by the scheduler.
//!
//! The scheduler's boundary is deliberately narrow: it asks a store "is this
//! path valid / can you substitute it / run this build and tell me the
//! result" and does not care how those operations are implemented. On-disk
//! layout, archive formats, wire protocols and signature checking all live
//! behind these traits.

pub mod derivation;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::capability::Machine;
use crate::types::{BuildMode, DrvOutputId, OutputName, StorePath};

pub use derivation::Derivation;

/// Errors reported by store collaborators.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("path '{0}' is not known to this store")]
    InvalidPath(StorePath),

    #[error("substituter unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O failed: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether this error indicts the connection rather than one path.
    ///
    /// Connection-level failures put the substituter on cooldown for the
    /// rest of the run; path-level ones only skip the current candidate.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Metadata about a valid (or substitutable) store path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub path: StorePath,
    /// Paths this one references; all of them must be made valid before the
    /// path itself, to keep the closure invariant.
    pub references: BTreeSet<StorePath>,
    pub nar_size: u64,
    /// Compressed transfer size, when the substituter knows it.
    pub download_size: Option<u64>,
}

/// A substituter's claim that a derivation output resolves to a store path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMapping {
    pub id: DrvOutputId,
    pub output_path: StorePath,
}

/// Terminal status of one build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    Substituted,
    AlreadyValid,
    PermanentFailure,
    TransientFailure,
    TimedOut,
}

/// What the executor produced for one derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub output_paths: BTreeMap<OutputName, StorePath>,
    pub error_msg: Option<String>,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        matches!(
            self.status,
            BuildStatus::Built | BuildStatus::Substituted | BuildStatus::AlreadyValid
        )
    }
}

/// Which stream a build log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChannel {
    Stdout,
    Stderr,
}

/// Handle an executor uses to stream build log lines back to the worker.
///
/// The worker routes each line to the owning goal's `handle_child_output`;
/// dropping the handle signals EOF.
#[derive(Debug, Clone)]
pub struct BuildLog {
    tx: mpsc::Sender<(LogChannel, String)>,
}

impl BuildLog {
    pub fn new(tx: mpsc::Sender<(LogChannel, String)>) -> Self {
        Self { tx }
    }

    /// Emit one log line. Lost lines are acceptable if the worker has
    /// already moved on (e.g. the goal was cancelled).
    pub async fn line(&self, channel: LogChannel, text: impl Into<String>) {
        let _ = self.tx.send((channel, text.into())).await;
    }
}

/// The content-addressed store the scheduler realises paths into.
#[async_trait]
pub trait Store: Send + Sync {
    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError>;

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError>;

    /// Read a derivation the scheduler was pointed at. The scheduler treats
    /// the result as an opaque task description.
    async fn read_derivation(&self, path: &StorePath) -> Result<Derivation, StoreError>;
}

/// A remote cache that may hold pre-built artifacts.
#[async_trait]
pub trait Substituter: Send + Sync {
    fn uri(&self) -> &str;

    /// Lower values are tried first.
    fn priority(&self) -> u32 {
        0
    }

    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError>;

    async fn query_output_mapping(
        &self,
        id: &DrvOutputId,
    ) -> Result<Option<OutputMapping>, StoreError>;

    /// Fetch `path` into the local store at `destination` (these differ when
    /// repairing a corrupt path).
    async fn fetch_to(
        &self,
        path: &StorePath,
        destination: &StorePath,
    ) -> Result<(), StoreError>;
}

/// Runs one derivation to completion, locally or on a remote builder.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn build(
        &self,
        drv: &Derivation,
        wanted: &[OutputName],
        mode: BuildMode,
        machine: &Machine,
        log: BuildLog,
    ) -> Result<BuildResult, StoreError>;
}
