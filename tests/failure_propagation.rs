mod common;

use builddag::goal::{FailureKind, GoalOutcome, SuccessStatus};
use builddag::types::BuildMode;
use builddag_test_utils::builders::{request, DerivationBuilder};
use builddag_test_utils::with_timeout;
use common::{assert_failure, assert_success, Fixture};

#[tokio::test]
async fn failed_dependency_stops_the_dependent() {
    let fixture = Fixture::builds_only();
    fixture.add_drv(DerivationBuilder::new("a").build());
    fixture.add_drv(DerivationBuilder::new("b").input("a").build());
    fixture.executor.fail_build("a", "exit status 1");

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("b")], BuildMode::Normal),
    )
    .await
    .unwrap();

    assert_failure(&outcomes[0].outcome, FailureKind::DependencyFailed);
    // The dependent's builder is never invoked.
    assert_eq!(fixture.executor.started(), vec!["a"]);
}

#[tokio::test]
async fn keep_going_finishes_independent_branches() {
    let mut fixture = Fixture::builds_only();
    fixture.config.keep_going = true;
    fixture.add_drv(DerivationBuilder::new("bad").build());
    fixture.add_drv(DerivationBuilder::new("good").build());
    fixture.executor.fail_build("bad", "exit status 1");

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("bad"), request("good")], BuildMode::Normal),
    )
    .await
    .unwrap();

    assert_failure(&outcomes[0].outcome, FailureKind::BuildFailed);
    assert_success(&outcomes[1].outcome, SuccessStatus::Built);
}

#[tokio::test]
async fn fail_fast_interrupts_the_rest_of_the_run() {
    let mut fixture = Fixture::builds_only();
    fixture.config.keep_going = false;
    fixture.add_drv(DerivationBuilder::new("bad").build());
    fixture.add_drv(DerivationBuilder::new("slow").build());
    fixture.executor.fail_build("bad", "exit status 1");
    fixture.executor.hang_build("slow");

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("bad"), request("slow")], BuildMode::Normal),
    )
    .await
    .unwrap();

    assert_failure(&outcomes[0].outcome, FailureKind::BuildFailed);
    assert_failure(&outcomes[1].outcome, FailureKind::Interrupted);
    match &outcomes[1].outcome {
        GoalOutcome::Failure { message, .. } => {
            assert!(
                message.contains("aborting run after failure"),
                "message names the abort cause: {message}"
            );
        }
        GoalOutcome::Success { .. } => unreachable!(),
    }
}

#[tokio::test]
async fn build_failure_message_carries_the_log_tail() {
    let fixture = Fixture::builds_only();
    fixture.add_drv(DerivationBuilder::new("a").build());
    fixture
        .executor
        .fail_build("a", "undefined reference to `main'");

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("a")], BuildMode::Normal),
    )
    .await
    .unwrap();

    match &outcomes[0].outcome {
        GoalOutcome::Failure { kind, message } => {
            assert_eq!(*kind, FailureKind::BuildFailed);
            assert!(message.contains("undefined reference"));
            assert!(
                message.contains("building a"),
                "log tail is appended: {message}"
            );
        }
        GoalOutcome::Success { .. } => panic!("build should have failed"),
    }
}

#[tokio::test]
async fn input_cycle_is_fatal_before_any_build() {
    let fixture = Fixture::builds_only();
    fixture.add_drv(DerivationBuilder::new("a").input("b").build());
    fixture.add_drv(DerivationBuilder::new("b").input("a").build());

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("a")], BuildMode::Normal),
    )
    .await
    .unwrap();

    assert_failure(&outcomes[0].outcome, FailureKind::InputCycle);
    assert!(fixture.executor.started().is_empty());
}

#[tokio::test]
async fn missing_derivation_is_a_store_failure() {
    let fixture = Fixture::builds_only();

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("ghost")], BuildMode::Normal),
    )
    .await
    .unwrap();

    assert_failure(&outcomes[0].outcome, FailureKind::StoreFailure);
}

#[tokio::test]
async fn mixed_outcomes_are_reported_per_request() {
    let mut fixture = Fixture::builds_only();
    fixture.config.keep_going = true;
    fixture.add_drv(DerivationBuilder::new("ok").build());
    fixture.add_drv(DerivationBuilder::new("broken").build());
    fixture.add_drv(DerivationBuilder::new("downstream").input("broken").build());
    fixture.executor.fail_build("broken", "exit status 2");

    let outcomes = with_timeout(fixture.worker().realize(
        vec![request("ok"), request("broken"), request("downstream")],
        BuildMode::Normal,
    ))
    .await
    .unwrap();

    assert_success(&outcomes[0].outcome, SuccessStatus::Built);
    assert_failure(&outcomes[1].outcome, FailureKind::BuildFailed);
    assert_failure(&outcomes[2].outcome, FailureKind::DependencyFailed);
}
