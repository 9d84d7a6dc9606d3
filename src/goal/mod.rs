// src/goal/mod.rs

//! The goal abstraction: a schedulable unit of work with identity, state
//! and dependency edges.
//!
//! Goals are explicit state machines driven by the worker's trampoline.
//! Each [`Goal::step`] call performs one unit of non-blocking progress and
//! answers with a [`GoalStep`]: wait for other goals, hand the worker an
//! async job to run, or finish. All waitee bookkeeping and state
//! transitions happen on the worker's coordinating loop; job futures only
//! report back through the worker's event channel.

pub mod derivation;
pub mod drv_output;
pub mod substitution;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::capability::Machine;
use crate::config::SchedulerConfig;
use crate::graph::Cycle;
use crate::store::{
    BuildExecutor, BuildResult, Derivation, LogChannel, OutputMapping, PathInfo, Store,
    StoreError, Substituter,
};
use crate::types::{BuildMode, DrvOutputId, JobCategory, OutputName, OutputsSpec, StorePath};
use crate::worker::counters::Counters;
use crate::worker::WorkerEvent;

pub use derivation::DerivationGoal;
pub use drv_output::DrvOutputSubstitutionGoal;
pub use substitution::PathSubstitutionGoal;

/// Stable identity of a goal, used for deduplication: at most one live goal
/// exists per key within a worker.
pub type GoalKey = String;

/// Where a goal is in its lifecycle. Owned by the worker, never mutated by
/// the goal itself.
#[derive(Debug, Clone)]
pub enum GoalState {
    /// Created, not yet started.
    Pending,
    /// Blocked on waitee goals, a slot, or outstanding I/O bookkeeping.
    Waiting,
    /// Eligible for the worker to resume.
    Runnable,
    /// Currently stepping, or has an outstanding job.
    Running,
    /// Terminal; never re-entered.
    Done(GoalOutcome),
}

/// How a finished goal succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessStatus {
    Built,
    Substituted,
    AlreadyValid,
    /// A drv-output mapping was resolved (and its path realised).
    Resolved,
}

/// Machine-readable classification of a goal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A waitee failed; this goal never ran its own work.
    DependencyFailed,
    /// No substituter could supply the artifact. Expected and non-fatal:
    /// the caller decides whether to fall back to a build.
    SubstituterUnavailable,
    /// The builder executed and reported failure.
    BuildFailed,
    /// The task graph contains a cycle; the request is unsatisfiable.
    InputCycle,
    Timeout,
    Interrupted,
    /// The scheduler stopped making progress; indicates an internal bug.
    Deadlock,
    /// No capability can run this task's system/features.
    ResourceExhausted,
    /// A store collaborator failed in a way the goal cannot recover from.
    StoreFailure,
}

/// Terminal outcome of a goal.
#[derive(Debug, Clone)]
pub enum GoalOutcome {
    Success {
        status: SuccessStatus,
        /// Realised paths, keyed by output name ("out" for opaque paths).
        outputs: BTreeMap<OutputName, StorePath>,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl GoalOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        GoalOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GoalOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            GoalOutcome::Success { .. } => None,
            GoalOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// A goal another goal wants to wait on. The worker creates the goal if no
/// live goal with the same key exists yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalRequest {
    Substitution {
        path: StorePath,
        repair: bool,
    },
    DrvOutput {
        id: DrvOutputId,
        /// Path this output is locally expected at, used when no
        /// substituter knows a mapping.
        known_path: StorePath,
    },
    Derivation {
        drv_path: StorePath,
        outputs: OutputsSpec,
        mode: BuildMode,
    },
}

impl GoalRequest {
    pub fn key(&self) -> GoalKey {
        match self {
            GoalRequest::Substitution { path, .. } => format!("sub:{path}"),
            GoalRequest::DrvOutput { id, .. } => format!("drv-output:{id}"),
            GoalRequest::Derivation {
                drv_path, outputs, ..
            } => format!("drv:{drv_path}!{outputs}"),
        }
    }
}

/// Result of one async job run on behalf of a goal.
#[derive(Debug)]
pub enum JobOutput {
    PathValid(Result<bool, StoreError>),
    PathInfo {
        substituter: String,
        result: Result<Option<PathInfo>, StoreError>,
    },
    Fetch {
        substituter: String,
        result: Result<(), StoreError>,
    },
    OutputMapping {
        substituter: String,
        result: Result<Option<OutputMapping>, StoreError>,
    },
    Derivation(Result<Derivation, StoreError>),
    /// Which of the wanted output paths are currently valid.
    ValidOutputs(Result<BTreeMap<OutputName, bool>, StoreError>),
    /// The input-derivation closure was expanded and checked for cycles.
    InputGraph(Result<(), InputGraphError>),
    Build(Result<BuildResult, StoreError>),
    /// The configured build timeout elapsed before the executor answered.
    BuildTimedOut,
}

/// Why expanding a derivation's input graph failed.
#[derive(Debug, Clone)]
pub enum InputGraphError {
    Cycle(Cycle<StorePath>),
    Store(StoreError),
}

/// Why a goal is being resumed.
#[derive(Debug)]
pub enum Resume {
    /// First transition out of `Pending`.
    Start,
    /// Every registered waitee finished.
    WaiteesDone {
        nr_failed: usize,
        /// How many of the failures were "no substitute available".
        nr_no_substituters: usize,
        /// Terminal outcomes of this round's waitees, in registration
        /// order. Lets a goal pick up what its waitees produced, e.g. the
        /// store path an output mapping actually resolved to.
        outcomes: Vec<GoalOutcome>,
    },
    /// An async job issued by this goal completed.
    Job(JobOutput),
}

/// An async job a goal asks the worker to run. Must be self-contained
/// (owning `Arc` clones of whatever collaborators it touches).
pub type GoalJob = Pin<Box<dyn Future<Output = JobOutput> + Send + 'static>>;

/// What a goal wants next after one step.
pub enum GoalStep {
    /// Register waitees and suspend until they are all done. An empty list
    /// resumes the goal immediately with `WaiteesDone`.
    WaitForGoals(Vec<GoalRequest>),
    /// Run `job` on the runtime. `slot` names the category ceiling the job
    /// occupies (`None` for administrative work that is never limited);
    /// `machine` attributes the job to an executor for load accounting.
    StartJob {
        job: GoalJob,
        slot: Option<JobCategory>,
        machine: Option<String>,
    },
    /// Terminal.
    Finish(GoalOutcome),
}

/// Everything a goal may consult while stepping. Borrowed from the worker
/// for the duration of one `step` call; jobs get owned clones instead.
pub struct GoalContext<'a> {
    pub config: &'a SchedulerConfig,
    pub store: &'a Arc<dyn Store>,
    pub substituters: &'a [Arc<dyn Substituter>],
    pub executor: &'a Arc<dyn BuildExecutor>,
    pub machines: &'a [Machine],
    /// Substituters on cooldown for the rest of this run after a
    /// connection-level failure.
    pub failed_substituters: &'a mut HashSet<String>,
    pub counters: &'a Counters,
    /// Builds currently running per machine name; feeds capability ranking.
    pub machine_loads: &'a HashMap<String, usize>,
    /// Channel for job futures that stream data back mid-flight
    /// (build logs).
    pub events: &'a mpsc::Sender<WorkerEvent>,
}

impl GoalContext<'_> {
    /// Substituters to try, best first, skipping those on cooldown.
    pub fn candidate_substituters(&self) -> Vec<Arc<dyn Substituter>> {
        self.substituters
            .iter()
            .filter(|sub| !self.failed_substituters.contains(sub.uri()))
            .cloned()
            .collect()
    }
}

/// Shared contract implemented by every goal kind. The worker treats all
/// kinds uniformly through this trait.
pub trait Goal: Send {
    /// Stable identity for deduplication.
    fn key(&self) -> GoalKey;

    /// Human-readable name for tracing.
    fn name(&self) -> String;

    /// Which concurrency ceiling this goal's real work counts against.
    fn job_category(&self) -> JobCategory;

    /// Perform one unit of non-blocking progress.
    fn step(&mut self, ctx: &mut GoalContext<'_>, resume: Resume) -> GoalStep;

    /// Called when a job owned by this goal produced output on a live
    /// stream. Default is a no-op for goals with no live I/O.
    fn handle_child_output(&mut self, _channel: LogChannel, _line: &str) {}

    /// Called when a job's output stream closed.
    fn handle_eof(&mut self, _channel: LogChannel) {}

    /// Release resources. Invoked exactly once when the goal becomes done,
    /// regardless of success or failure; must be safe to call again and
    /// must never panic.
    fn cleanup(&mut self) {}

    /// Produce the outcome for a goal whose allotted time ran out.
    /// Equivalent to cancellation: the goal must not keep any slot.
    fn timed_out(&mut self, reason: String) -> GoalOutcome {
        GoalOutcome::failure(FailureKind::Timeout, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_request_keys_are_distinct_per_kind() {
        let path = StorePath::new("/store/aaa-foo");
        let sub = GoalRequest::Substitution {
            path: path.clone(),
            repair: false,
        };
        let drv = GoalRequest::Derivation {
            drv_path: path.clone(),
            outputs: OutputsSpec::All,
            mode: BuildMode::Normal,
        };
        let out = GoalRequest::DrvOutput {
            id: DrvOutputId {
                drv_path: path.clone(),
                output: "out".to_string(),
            },
            known_path: path,
        };
        let keys: HashSet<GoalKey> =
            [sub.key(), drv.key(), out.key()].into_iter().collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn goal_request_key_ignores_repair_flag() {
        // Repairing and fetching the same path must share one goal.
        let path = StorePath::new("/store/aaa-foo");
        let a = GoalRequest::Substitution {
            path: path.clone(),
            repair: false,
        };
        let b = GoalRequest::Substitution { path, repair: true };
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn outcome_accessors() {
        let ok = GoalOutcome::Success {
            status: SuccessStatus::Built,
            outputs: BTreeMap::new(),
        };
        assert!(ok.is_success());
        assert_eq!(ok.failure_kind(), None);

        let failed = GoalOutcome::failure(FailureKind::BuildFailed, "exit 1");
        assert!(!failed.is_success());
        assert_eq!(failed.failure_kind(), Some(FailureKind::BuildFailed));
    }
}
