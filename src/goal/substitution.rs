// src/goal/substitution.rs

//! Realise one opaque store path by fetching it from a substituter.
//!
//! The goal walks the configured substituters best-first: query path info,
//! realise the references the info announces (as sibling substitution
//! goals), then fetch under a substitution slot. A connection-level failure
//! puts the substituter on cooldown for the rest of the run; a mere miss
//! only moves on to the next candidate.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::goal::{
    FailureKind, Goal, GoalContext, GoalKey, GoalOutcome, GoalRequest, GoalStep, JobOutput,
    Resume, SuccessStatus,
};
use crate::store::{PathInfo, Substituter};
use crate::types::{JobCategory, StorePath};
use crate::worker::counters::GaugeGuard;

#[derive(Clone, Copy)]
enum SubState {
    Init,
    CheckingValidity,
    QueryingInfo,
    WaitingForReferences,
    Fetching,
}

pub struct PathSubstitutionGoal {
    path: StorePath,
    repair: bool,
    state: SubState,
    /// Candidates not yet tried, best first. Filled lazily on first need so
    /// the cooldown set is consulted as late as possible.
    candidates: Option<VecDeque<Arc<dyn Substituter>>>,
    current: Option<Arc<dyn Substituter>>,
    info: Option<PathInfo>,
    expected: Option<GaugeGuard>,
    expected_nar: Option<GaugeGuard>,
    expected_download: Option<GaugeGuard>,
}

impl PathSubstitutionGoal {
    pub fn new(path: StorePath, repair: bool, expected: GaugeGuard) -> Self {
        Self {
            path,
            repair,
            state: SubState::Init,
            candidates: None,
            current: None,
            info: None,
            expected: Some(expected),
            expected_nar: None,
            expected_download: None,
        }
    }

    fn success(&self, status: SuccessStatus) -> GoalStep {
        GoalStep::Finish(GoalOutcome::Success {
            status,
            outputs: BTreeMap::from([("out".to_string(), self.path.clone())]),
        })
    }

    /// Pop the next substituter worth asking and query it, or give up.
    fn try_next(&mut self, ctx: &mut GoalContext<'_>) -> GoalStep {
        let candidates = self
            .candidates
            .get_or_insert_with(|| ctx.candidate_substituters().into());

        // The cooldown set may have grown since the queue was built.
        let next = loop {
            match candidates.pop_front() {
                Some(sub) if ctx.failed_substituters.contains(sub.uri()) => continue,
                other => break other,
            }
        };

        let Some(sub) = next else {
            debug!(path = %self.path, "no substitute available");
            return GoalStep::Finish(GoalOutcome::failure(
                FailureKind::SubstituterUnavailable,
                format!("no substitute available for '{}'", self.path),
            ));
        };

        self.current = Some(sub.clone());
        self.state = SubState::QueryingInfo;

        let path = self.path.clone();
        GoalStep::StartJob {
            job: Box::pin(async move {
                let uri = sub.uri().to_string();
                let result = sub.query_path_info(&path).await;
                JobOutput::PathInfo {
                    substituter: uri,
                    result,
                }
            }),
            slot: None,
            machine: None,
        }
    }

    fn on_path_info(
        &mut self,
        ctx: &mut GoalContext<'_>,
        substituter: String,
        result: Result<Option<PathInfo>, crate::store::StoreError>,
    ) -> GoalStep {
        match result {
            Err(err) => {
                warn!(substituter = %substituter, error = %err, "substituter query failed");
                if err.is_connection_level() {
                    ctx.failed_substituters.insert(substituter);
                }
                self.try_next(ctx)
            }
            Ok(None) => {
                debug!(substituter = %substituter, path = %self.path, "substituter miss");
                self.try_next(ctx)
            }
            Ok(Some(info)) => {
                if info.path != self.path {
                    warn!(
                        substituter = %substituter,
                        expected = %self.path,
                        got = %info.path,
                        "substituter answered for the wrong path"
                    );
                    return self.try_next(ctx);
                }

                self.expected_nar = Some(ctx.counters.expected_nar_size.maintain(info.nar_size));
                if let Some(download) = info.download_size {
                    self.expected_download =
                        Some(ctx.counters.expected_download_size.maintain(download));
                }

                // References must be valid before the path itself; realise
                // them as sibling substitution goals.
                let waitees: Vec<GoalRequest> = info
                    .references
                    .iter()
                    .filter(|reference| **reference != self.path)
                    .map(|reference| GoalRequest::Substitution {
                        path: reference.clone(),
                        repair: false,
                    })
                    .collect();

                self.info = Some(info);
                self.state = SubState::WaitingForReferences;
                GoalStep::WaitForGoals(waitees)
            }
        }
    }

    fn start_fetch(&mut self) -> GoalStep {
        // A current substituter always exists here: this state is only
        // reached after a successful info query.
        let Some(sub) = self.current.clone() else {
            return GoalStep::Finish(GoalOutcome::failure(
                FailureKind::StoreFailure,
                format!("internal: lost substituter while fetching '{}'", self.path),
            ));
        };

        self.state = SubState::Fetching;
        let path = self.path.clone();
        GoalStep::StartJob {
            job: Box::pin(async move {
                let uri = sub.uri().to_string();
                let result = sub.fetch_to(&path, &path).await;
                JobOutput::Fetch {
                    substituter: uri,
                    result,
                }
            }),
            slot: Some(JobCategory::Substitution),
            machine: None,
        }
    }
}

impl Goal for PathSubstitutionGoal {
    fn key(&self) -> GoalKey {
        format!("sub:{}", self.path)
    }

    fn name(&self) -> String {
        format!("substitution of '{}'", self.path)
    }

    fn job_category(&self) -> JobCategory {
        JobCategory::Substitution
    }

    fn step(&mut self, ctx: &mut GoalContext<'_>, resume: Resume) -> GoalStep {
        match (self.state, resume) {
            (SubState::Init, Resume::Start) => {
                if self.repair {
                    // Repair refetches regardless of local validity.
                    return self.try_next(ctx);
                }
                self.state = SubState::CheckingValidity;
                let store = ctx.store.clone();
                let path = self.path.clone();
                GoalStep::StartJob {
                    job: Box::pin(async move {
                        JobOutput::PathValid(store.is_valid_path(&path).await)
                    }),
                    slot: None,
                    machine: None,
                }
            }

            (SubState::CheckingValidity, Resume::Job(JobOutput::PathValid(result))) => {
                match result {
                    Err(err) => GoalStep::Finish(GoalOutcome::failure(
                        FailureKind::StoreFailure,
                        format!("cannot check validity of '{}': {err}", self.path),
                    )),
                    Ok(true) => self.success(SuccessStatus::AlreadyValid),
                    Ok(false) => self.try_next(ctx),
                }
            }

            (
                SubState::QueryingInfo,
                Resume::Job(JobOutput::PathInfo {
                    substituter,
                    result,
                }),
            ) => self.on_path_info(ctx, substituter, result),

            (
                SubState::WaitingForReferences,
                Resume::WaiteesDone {
                    nr_failed,
                    nr_no_substituters,
                    ..
                },
            ) => {
                if nr_failed > 0 {
                    // Missing references mean the closure cannot be
                    // completed from caches; report it as "no substitute"
                    // when that is the root cause so callers can fall back
                    // to building.
                    let kind = if nr_no_substituters > 0 {
                        FailureKind::SubstituterUnavailable
                    } else {
                        FailureKind::DependencyFailed
                    };
                    return GoalStep::Finish(GoalOutcome::failure(
                        kind,
                        format!(
                            "cannot substitute '{}': {nr_failed} of its references failed",
                            self.path
                        ),
                    ));
                }
                self.start_fetch()
            }

            (
                SubState::Fetching,
                Resume::Job(JobOutput::Fetch {
                    substituter,
                    result,
                }),
            ) => match result {
                Ok(()) => self.success(SuccessStatus::Substituted),
                Err(err) => {
                    warn!(
                        substituter = %substituter,
                        path = %self.path,
                        error = %err,
                        "substitution failed"
                    );
                    if err.is_connection_level() {
                        ctx.failed_substituters.insert(substituter);
                    }
                    // Start over with the next candidate; its info may
                    // announce different references, which is fine because
                    // already-done waitees report back immediately.
                    self.expected_nar = None;
                    self.expected_download = None;
                    self.try_next(ctx)
                }
            },

            (_, resume) => GoalStep::Finish(GoalOutcome::failure(
                FailureKind::StoreFailure,
                format!(
                    "internal: substitution of '{}' resumed with unexpected {resume:?}",
                    self.path
                ),
            )),
        }
    }

    fn cleanup(&mut self) {
        self.expected.take();
        self.expected_nar.take();
        self.expected_download.take();
        self.candidates = None;
        self.current = None;
    }
}
