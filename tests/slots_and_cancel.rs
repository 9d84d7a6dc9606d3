mod common;

use std::time::Duration;

use builddag::goal::{FailureKind, SuccessStatus};
use builddag::types::BuildMode;
use builddag_test_utils::builders::{request, DerivationBuilder};
use builddag_test_utils::with_timeout;
use common::{assert_failure, assert_success, Fixture};

#[tokio::test]
async fn build_concurrency_never_exceeds_the_ceiling() {
    let mut fixture = Fixture::builds_only();
    fixture.config.max_build_jobs = 4;

    let requests: Vec<_> = (0..50)
        .map(|i| {
            let name = format!("job{i}");
            fixture.add_drv(DerivationBuilder::new(&name).build());
            request(&name)
        })
        .collect();

    let outcomes = with_timeout(fixture.worker().realize(requests, BuildMode::Normal))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 50);
    for outcome in &outcomes {
        assert_success(&outcome.outcome, SuccessStatus::Built);
    }
    assert_eq!(fixture.executor.started().len(), 50);
    assert!(
        fixture.executor.max_concurrent() <= 4,
        "high watermark was {}",
        fixture.executor.max_concurrent()
    );
}

#[tokio::test]
async fn hung_build_fails_with_timeout() {
    let mut fixture = Fixture::builds_only();
    fixture.config.build_timeout = Some(Duration::from_millis(50));
    fixture.add_drv(DerivationBuilder::new("stuck").build());
    fixture.executor.hang_build("stuck");

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("stuck")], BuildMode::Normal),
    )
    .await
    .unwrap();

    assert_failure(&outcomes[0].outcome, FailureKind::Timeout);
}

#[tokio::test]
async fn timed_out_build_releases_its_slot() {
    let mut fixture = Fixture::builds_only();
    fixture.config.max_build_jobs = 1;
    fixture.config.keep_going = true;
    fixture.config.build_timeout = Some(Duration::from_millis(50));
    fixture.add_drv(DerivationBuilder::new("stuck").build());
    fixture.add_drv(DerivationBuilder::new("after").build());
    fixture.executor.hang_build("stuck");

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("stuck"), request("after")], BuildMode::Normal),
    )
    .await
    .unwrap();

    assert_failure(&outcomes[0].outcome, FailureKind::Timeout);
    // The freed slot lets the parked build run.
    assert_success(&outcomes[1].outcome, SuccessStatus::Built);
}

#[tokio::test]
async fn interrupt_drives_open_goals_to_interrupted() {
    let fixture = Fixture::builds_only();
    fixture.add_drv(DerivationBuilder::new("stuck").build());
    fixture.executor.hang_build("stuck");

    let worker = fixture.worker();
    let handle = worker.interrupt_handle();
    let run = tokio::spawn(worker.realize(vec![request("stuck")], BuildMode::Normal));

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.interrupt().await;

    let outcomes = with_timeout(async { run.await.unwrap() }).await.unwrap();
    assert_failure(&outcomes[0].outcome, FailureKind::Interrupted);
    // The build did start before the interruption.
    assert_eq!(fixture.executor.started(), vec!["stuck"]);
}

#[tokio::test]
async fn interrupt_with_several_running_builds_releases_everything() {
    let mut fixture = Fixture::builds_only();
    fixture.config.max_build_jobs = 3;
    for name in ["a", "b", "c"] {
        fixture.add_drv(DerivationBuilder::new(name).build());
        fixture.executor.hang_build(name);
    }

    let worker = fixture.worker();
    let counters = worker.counters();
    let handle = worker.interrupt_handle();
    let run = tokio::spawn(worker.realize(
        vec![request("a"), request("b"), request("c")],
        BuildMode::Normal,
    ));

    // Interrupt only once all three builds are actually in flight.
    with_timeout(async {
        while fixture.executor.started().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    handle.interrupt().await;

    let outcomes = with_timeout(async { run.await.unwrap() }).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        assert_failure(&outcome.outcome, FailureKind::Interrupted);
    }
    let snapshot = counters.snapshot();
    assert_eq!(snapshot.running_builds, 0, "running gauge back to zero");
    assert_eq!(snapshot.expected_builds, 0, "expectation guards released");

    // Slots and fakes are intact; a fresh run still works.
    fixture.add_drv(DerivationBuilder::new("later").build());
    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("later")], BuildMode::Normal),
    )
    .await
    .unwrap();
    assert_success(&outcomes[0].outcome, SuccessStatus::Built);
}

#[tokio::test]
async fn counters_settle_after_a_run() {
    let fixture = Fixture::builds_only();
    for name in ["a", "b", "c"] {
        fixture.add_drv(DerivationBuilder::new(name).build());
    }

    let worker = fixture.worker();
    let counters = worker.counters();
    let outcomes = with_timeout(worker.realize(
        vec![request("a"), request("b"), request("c")],
        BuildMode::Normal,
    ))
    .await
    .unwrap();
    assert_eq!(outcomes.len(), 3);

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.done_builds, 3);
    assert_eq!(snapshot.failed_builds, 0);
    assert_eq!(snapshot.running_builds, 0, "running gauge returns to zero");
    assert_eq!(snapshot.expected_builds, 0, "expectation guards released");
}

#[tokio::test]
async fn no_capable_machine_exhausts_resources() {
    let fixture = Fixture::builds_only();
    fixture.add_drv(
        DerivationBuilder::new("exotic")
            .system("riscv64-linux")
            .build(),
    );

    let outcomes = with_timeout(
        fixture
            .worker()
            .realize(vec![request("exotic")], BuildMode::Normal),
    )
    .await
    .unwrap();

    assert_failure(&outcomes[0].outcome, FailureKind::ResourceExhausted);
    assert!(fixture.executor.started().is_empty());
}
