// src/goal/drv_output.rs

//! Resolve one concrete derivation output without building it.
//!
//! Substituters are asked, best first, whether they know which store path
//! the output maps to; the winning path (or the locally recorded one, when
//! nobody knows better) is then realised through an ordinary path
//! substitution goal. This keeps mapping resolution separate from path
//! transfer, so several outputs resolving to the same path share one fetch.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::goal::{
    FailureKind, Goal, GoalContext, GoalKey, GoalOutcome, GoalRequest, GoalStep, JobOutput,
    Resume, SuccessStatus,
};
use crate::store::{OutputMapping, StoreError, Substituter};
use crate::types::{DrvOutputId, JobCategory, StorePath};

enum OutputState {
    Init,
    Querying,
    WaitingForPath(StorePath),
}

pub struct DrvOutputSubstitutionGoal {
    id: DrvOutputId,
    /// Path the local derivation says this output lands at; the fallback
    /// when no substituter knows a mapping.
    known_path: StorePath,
    state: OutputState,
    candidates: Option<VecDeque<Arc<dyn Substituter>>>,
}

impl DrvOutputSubstitutionGoal {
    pub fn new(id: DrvOutputId, known_path: StorePath) -> Self {
        Self {
            id,
            known_path,
            state: OutputState::Init,
            candidates: None,
        }
    }

    fn wait_for_path(&mut self, path: StorePath) -> GoalStep {
        let request = GoalRequest::Substitution {
            path: path.clone(),
            repair: false,
        };
        self.state = OutputState::WaitingForPath(path);
        GoalStep::WaitForGoals(vec![request])
    }

    fn try_next(&mut self, ctx: &mut GoalContext<'_>) -> GoalStep {
        let candidates = self
            .candidates
            .get_or_insert_with(|| ctx.candidate_substituters().into());

        let next = loop {
            match candidates.pop_front() {
                Some(sub) if ctx.failed_substituters.contains(sub.uri()) => continue,
                other => break other,
            }
        };

        let Some(sub) = next else {
            debug!(id = %self.id, path = %self.known_path, "no mapping found, using local path");
            return self.wait_for_path(self.known_path.clone());
        };

        self.state = OutputState::Querying;
        let id = self.id.clone();
        GoalStep::StartJob {
            job: Box::pin(async move {
                let uri = sub.uri().to_string();
                let result = sub.query_output_mapping(&id).await;
                JobOutput::OutputMapping {
                    substituter: uri,
                    result,
                }
            }),
            slot: None,
            machine: None,
        }
    }

    fn on_mapping(
        &mut self,
        ctx: &mut GoalContext<'_>,
        substituter: String,
        result: Result<Option<OutputMapping>, StoreError>,
    ) -> GoalStep {
        match result {
            Err(err) => {
                warn!(substituter = %substituter, error = %err, "mapping query failed");
                if err.is_connection_level() {
                    ctx.failed_substituters.insert(substituter);
                }
                self.try_next(ctx)
            }
            Ok(None) => self.try_next(ctx),
            Ok(Some(mapping)) => {
                if mapping.id != self.id {
                    warn!(
                        substituter = %substituter,
                        expected = %self.id,
                        got = %mapping.id,
                        "substituter answered for the wrong output"
                    );
                    return self.try_next(ctx);
                }
                debug!(id = %self.id, path = %mapping.output_path, "output mapping resolved");
                self.wait_for_path(mapping.output_path)
            }
        }
    }
}

impl Goal for DrvOutputSubstitutionGoal {
    fn key(&self) -> GoalKey {
        format!("drv-output:{}", self.id)
    }

    fn name(&self) -> String {
        format!("substitution of output '{}'", self.id)
    }

    fn job_category(&self) -> JobCategory {
        // Coordination only; the actual transfer is slotted inside the
        // path substitution goal this one waits on.
        JobCategory::Administration
    }

    fn step(&mut self, ctx: &mut GoalContext<'_>, resume: Resume) -> GoalStep {
        // Every arm either finishes or installs the next state.
        let state = std::mem::replace(&mut self.state, OutputState::Init);
        match (state, resume) {
            (OutputState::Init, Resume::Start) => self.try_next(ctx),

            (
                OutputState::Querying,
                Resume::Job(JobOutput::OutputMapping {
                    substituter,
                    result,
                }),
            ) => self.on_mapping(ctx, substituter, result),

            (
                OutputState::WaitingForPath(path),
                Resume::WaiteesDone {
                    nr_failed,
                    nr_no_substituters,
                    ..
                },
            ) => {
                if nr_failed > 0 {
                    let kind = if nr_no_substituters > 0 {
                        FailureKind::SubstituterUnavailable
                    } else {
                        FailureKind::DependencyFailed
                    };
                    return GoalStep::Finish(GoalOutcome::failure(
                        kind,
                        format!("cannot realise output '{}' at '{path}'", self.id),
                    ));
                }
                GoalStep::Finish(GoalOutcome::Success {
                    status: SuccessStatus::Resolved,
                    outputs: BTreeMap::from([(self.id.output.clone(), path)]),
                })
            }

            (_, resume) => GoalStep::Finish(GoalOutcome::failure(
                FailureKind::StoreFailure,
                format!(
                    "internal: output substitution of '{}' resumed with unexpected {resume:?}",
                    self.id
                ),
            )),
        }
    }

    fn cleanup(&mut self) {
        self.candidates = None;
    }
}
