#![allow(dead_code)]

use std::sync::Arc;

use builddag::config::SchedulerConfig;
use builddag::goal::{FailureKind, GoalOutcome, SuccessStatus};
use builddag::store::{Derivation, Substituter};
use builddag::worker::Worker;
use builddag_test_utils::builders::{drv_path, local_machine};
use builddag_test_utils::fakes::{FakeExecutor, FakeStore, FakeSubstituter};

/// One set of fake collaborators plus the config knobs a test wants to
/// turn. `worker()` can be called repeatedly; each call is a fresh run
/// against the same fakes.
pub struct Fixture {
    pub store: FakeStore,
    pub executor: FakeExecutor,
    pub substituters: Vec<FakeSubstituter>,
    pub config: SchedulerConfig,
}

impl Fixture {
    pub fn new() -> Self {
        builddag_test_utils::init_tracing();
        let store = FakeStore::new();
        let executor = FakeExecutor::new(store.clone());
        Self {
            store,
            executor,
            substituters: Vec::new(),
            config: SchedulerConfig::default(),
        }
    }

    /// A fixture with substitution turned off, for pure build tests.
    pub fn builds_only() -> Self {
        let mut fixture = Self::new();
        fixture.config.try_substitutes = false;
        fixture
    }

    pub fn add_substituter(&mut self, uri: &str, priority: u32) -> FakeSubstituter {
        let substituter = FakeSubstituter::new(uri, priority, self.store.clone());
        self.substituters.push(substituter.clone());
        substituter
    }

    pub fn add_drv(&self, drv: Derivation) {
        self.store.add_derivation(drv_path(&drv.name), drv);
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.config.clone(),
            Arc::new(self.store.clone()),
            self.substituters
                .iter()
                .map(|s| Arc::new(s.clone()) as Arc<dyn Substituter>)
                .collect(),
            Arc::new(self.executor.clone()),
            vec![local_machine()],
        )
    }
}

pub fn assert_success(outcome: &GoalOutcome, expected: SuccessStatus) {
    match outcome {
        GoalOutcome::Success { status, .. } => assert_eq!(*status, expected),
        GoalOutcome::Failure { kind, message } => {
            panic!("expected success ({expected:?}), got {kind:?}: {message}")
        }
    }
}

pub fn assert_failure(outcome: &GoalOutcome, expected: FailureKind) {
    match outcome {
        GoalOutcome::Failure { kind, .. } => assert_eq!(*kind, expected),
        GoalOutcome::Success { status, .. } => {
            panic!("expected failure ({expected:?}), got success {status:?}")
        }
    }
}
