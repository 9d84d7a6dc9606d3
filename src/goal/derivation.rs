// src/goal/derivation.rs

//! Realise some outputs of a derivation.
//!
//! The canonical flow: load the derivation, check which wanted outputs are
//! already valid, try to substitute the missing ones, and only when that
//! does not pan out, realise every input and run the build on the
//! best-ranked capable machine. Substitution failure is expected and falls
//! back to building; dependency failure is not and propagates.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capability::{rank_candidates, Machine};
use crate::goal::{
    FailureKind, Goal, GoalContext, GoalJob, GoalKey, GoalOutcome, GoalRequest, GoalStep,
    InputGraphError, JobOutput, Resume, SuccessStatus,
};
use crate::graph::{compute_closure, topo_sort};
use crate::store::{
    BuildExecutor, BuildLog, BuildResult, BuildStatus, Derivation, LogChannel, Store, StoreError,
};
use crate::types::{BuildMode, DrvOutputId, JobCategory, OutputName, OutputsSpec, StorePath};
use crate::worker::counters::GaugeGuard;
use crate::worker::WorkerEvent;

#[derive(Clone, Copy)]
enum DrvState {
    Init,
    LoadingDrv,
    CheckingOutputs,
    SubstitutingOutputs,
    LoadingInputGraph,
    WaitingForInputs,
    Building,
}

pub struct DerivationGoal {
    drv_path: StorePath,
    outputs_spec: OutputsSpec,
    mode: BuildMode,
    state: DrvState,
    drv: Option<Derivation>,
    /// Outputs selected by the spec, resolved once the derivation loads.
    wanted: Vec<(OutputName, StorePath)>,
    /// Subset of `wanted` that still needs substituting or building.
    missing: Vec<(OutputName, StorePath)>,
    log_tail: VecDeque<String>,
    log_tail_limit: usize,
    expected: Option<GaugeGuard>,
}

impl DerivationGoal {
    pub fn new(
        drv_path: StorePath,
        outputs_spec: OutputsSpec,
        mode: BuildMode,
        log_tail_limit: usize,
        expected: GaugeGuard,
    ) -> Self {
        Self {
            drv_path,
            outputs_spec,
            mode,
            state: DrvState::Init,
            drv: None,
            wanted: Vec::new(),
            missing: Vec::new(),
            log_tail: VecDeque::new(),
            log_tail_limit,
            expected: Some(expected),
        }
    }

    fn wanted_map(&self) -> BTreeMap<OutputName, StorePath> {
        self.wanted.iter().cloned().collect()
    }

    /// Realised paths after a successful substitution round: the local
    /// derivation's paths, overridden wherever a waitee resolved an output
    /// mapping to a different store path.
    fn substituted_outputs(&self, outcomes: &[GoalOutcome]) -> BTreeMap<OutputName, StorePath> {
        let mut outputs = self.wanted_map();
        for outcome in outcomes {
            if let GoalOutcome::Success {
                outputs: resolved, ..
            } = outcome
            {
                for (name, path) in resolved {
                    if outputs.contains_key(name) {
                        outputs.insert(name.clone(), path.clone());
                    }
                }
            }
        }
        outputs
    }

    fn fail(&self, kind: FailureKind, message: impl Into<String>) -> GoalStep {
        GoalStep::Finish(GoalOutcome::failure(kind, message))
    }

    fn tail_suffix(&self) -> String {
        if self.log_tail.is_empty() {
            return String::new();
        }
        let lines: Vec<&str> = self.log_tail.iter().map(|l| l.as_str()).collect();
        format!("; last log lines:\n{}", lines.join("\n"))
    }

    fn start_output_check(&mut self, ctx: &GoalContext<'_>) -> GoalStep {
        self.state = DrvState::CheckingOutputs;
        let store = Arc::clone(ctx.store);
        let paths = self.wanted.clone();
        GoalStep::StartJob {
            job: Box::pin(async move {
                let mut valid = BTreeMap::new();
                for (name, path) in paths {
                    match store.is_valid_path(&path).await {
                        Ok(is_valid) => {
                            valid.insert(name, is_valid);
                        }
                        Err(err) => return JobOutput::ValidOutputs(Err(err)),
                    }
                }
                JobOutput::ValidOutputs(Ok(valid))
            }),
            slot: None,
            machine: None,
        }
    }

    fn on_outputs_checked(
        &mut self,
        ctx: &GoalContext<'_>,
        valid: BTreeMap<OutputName, bool>,
    ) -> GoalStep {
        // Repair and check modes redo the work even for valid outputs.
        self.missing = match self.mode {
            BuildMode::Normal => self
                .wanted
                .iter()
                .filter(|(name, _)| !valid.get(name).copied().unwrap_or(false))
                .cloned()
                .collect(),
            BuildMode::Repair | BuildMode::Check => self.wanted.clone(),
        };

        if self.missing.is_empty() {
            debug!(drv = %self.drv_path, "all wanted outputs already valid");
            return GoalStep::Finish(GoalOutcome::Success {
                status: SuccessStatus::AlreadyValid,
                outputs: self.wanted_map(),
            });
        }

        let substitutable = self
            .drv
            .as_ref()
            .map(|drv| drv.substitutable)
            .unwrap_or(false);

        // Check mode exists to re-run the builder, so caches are no help.
        if self.mode == BuildMode::Normal && ctx.config.try_substitutes && substitutable {
            self.state = DrvState::SubstitutingOutputs;
            let waitees = self
                .missing
                .iter()
                .map(|(name, path)| GoalRequest::DrvOutput {
                    id: DrvOutputId {
                        drv_path: self.drv_path.clone(),
                        output: name.clone(),
                    },
                    known_path: path.clone(),
                })
                .collect();
            return GoalStep::WaitForGoals(waitees);
        }

        self.start_input_graph(ctx)
    }

    /// Expand the transitive input-derivation graph and reject cycles
    /// before committing to any build work.
    fn start_input_graph(&mut self, ctx: &GoalContext<'_>) -> GoalStep {
        self.state = DrvState::LoadingInputGraph;
        let store = Arc::clone(ctx.store);
        let root = self.drv_path.clone();
        GoalStep::StartJob {
            job: Box::pin(async move {
                let edges: Arc<Mutex<HashMap<StorePath, HashSet<StorePath>>>> =
                    Arc::new(Mutex::new(HashMap::new()));

                let edges_seen = Arc::clone(&edges);
                let closure = compute_closure([root], move |path: StorePath| {
                    let store = Arc::clone(&store);
                    let edges = Arc::clone(&edges_seen);
                    async move {
                        let drv = store.read_derivation(&path).await?;
                        let children: HashSet<StorePath> =
                            drv.input_drvs.keys().cloned().collect();
                        edges.lock().unwrap().insert(path, children.clone());
                        Ok::<_, StoreError>(children)
                    }
                })
                .await;

                let result = match closure {
                    Err(err) => Err(InputGraphError::Store(err)),
                    Ok(nodes) => {
                        let edges = edges.lock().unwrap();
                        topo_sort(&nodes, |path| {
                            edges.get(path).cloned().unwrap_or_default()
                        })
                        .map(|_| ())
                        .map_err(InputGraphError::Cycle)
                    }
                };
                JobOutput::InputGraph(result)
            }),
            slot: None,
            machine: None,
        }
    }

    fn start_input_waitees(&mut self) -> GoalStep {
        self.state = DrvState::WaitingForInputs;
        let Some(drv) = self.drv.as_ref() else {
            return self.fail(
                FailureKind::StoreFailure,
                format!("internal: derivation '{}' vanished mid-flight", self.drv_path),
            );
        };

        let mut waitees = Vec::new();
        for (input_drv, outputs) in &drv.input_drvs {
            if outputs.is_empty() {
                continue;
            }
            // Direct input derivations are realised recursively; their
            // own substitution-or-build decision happens in their goal.
            if let Ok(spec) = OutputsSpec::names(outputs.iter().cloned()) {
                waitees.push(GoalRequest::Derivation {
                    drv_path: input_drv.clone(),
                    outputs: spec,
                    mode: BuildMode::Normal,
                });
            }
        }
        for src in &drv.input_srcs {
            waitees.push(GoalRequest::Substitution {
                path: src.clone(),
                repair: false,
            });
        }
        GoalStep::WaitForGoals(waitees)
    }

    fn start_build(&mut self, ctx: &GoalContext<'_>) -> GoalStep {
        let Some(drv) = self.drv.as_ref() else {
            return self.fail(
                FailureKind::StoreFailure,
                format!("internal: derivation '{}' vanished mid-flight", self.drv_path),
            );
        };

        let no_local_builds = ctx.config.max_build_jobs == 0;
        let ranked = rank_candidates(ctx.machines, drv, |name| {
            ctx.machine_loads.get(name).copied().unwrap_or(0)
        });
        let chosen = ranked
            .into_iter()
            .find(|machine| !(no_local_builds && machine.is_local()));

        let Some(machine) = chosen else {
            return self.fail(
                FailureKind::ResourceExhausted,
                format!(
                    "no machine can build '{}' (system '{}', required features {:?})",
                    self.drv_path, drv.system, drv.required_features
                ),
            );
        };

        info!(drv = %self.drv_path, machine = %machine.name, "starting build");
        self.state = DrvState::Building;

        let slot = if machine.is_local() {
            Some(JobCategory::Build)
        } else {
            // Remote concurrency is the remote's business; ranking already
            // steers load away from busy machines.
            None
        };
        let machine_name = machine.name.clone();
        let job = make_build_job(
            Arc::clone(ctx.executor),
            drv.clone(),
            self.missing.iter().map(|(name, _)| name.clone()).collect(),
            self.mode,
            machine.clone(),
            ctx.events.clone(),
            self.key(),
            ctx.config.build_timeout,
        );
        GoalStep::StartJob {
            job,
            slot,
            machine: Some(machine_name),
        }
    }

    fn on_build_result(&mut self, result: Result<BuildResult, StoreError>) -> GoalStep {
        let result = match result {
            Err(err) => {
                return self.fail(
                    FailureKind::StoreFailure,
                    format!("build of '{}' could not run: {err}", self.drv_path),
                );
            }
            Ok(result) => result,
        };

        match result.status {
            BuildStatus::Built | BuildStatus::Substituted | BuildStatus::AlreadyValid => {
                let status = match result.status {
                    BuildStatus::Built => SuccessStatus::Built,
                    BuildStatus::Substituted => SuccessStatus::Substituted,
                    _ => SuccessStatus::AlreadyValid,
                };
                let outputs = if result.output_paths.is_empty() {
                    self.wanted_map()
                } else {
                    result.output_paths
                };
                GoalStep::Finish(GoalOutcome::Success { status, outputs })
            }
            BuildStatus::TimedOut => {
                let outcome = self.timed_out(format!("build of '{}' timed out", self.drv_path));
                GoalStep::Finish(outcome)
            }
            BuildStatus::PermanentFailure | BuildStatus::TransientFailure => {
                let detail = result
                    .error_msg
                    .unwrap_or_else(|| "builder reported failure".to_string());
                self.fail(
                    FailureKind::BuildFailed,
                    format!(
                        "builder for '{}' failed: {detail}{}",
                        self.drv_path,
                        self.tail_suffix()
                    ),
                )
            }
        }
    }
}

impl Goal for DerivationGoal {
    fn key(&self) -> GoalKey {
        format!("drv:{}!{}", self.drv_path, self.outputs_spec)
    }

    fn name(&self) -> String {
        format!("building of '{}!{}'", self.drv_path, self.outputs_spec)
    }

    fn job_category(&self) -> JobCategory {
        JobCategory::Build
    }

    fn step(&mut self, ctx: &mut GoalContext<'_>, resume: Resume) -> GoalStep {
        match (self.state, resume) {
            (DrvState::Init, Resume::Start) => {
                self.state = DrvState::LoadingDrv;
                let store = Arc::clone(ctx.store);
                let path = self.drv_path.clone();
                GoalStep::StartJob {
                    job: Box::pin(async move {
                        JobOutput::Derivation(store.read_derivation(&path).await)
                    }),
                    slot: None,
                    machine: None,
                }
            }

            (DrvState::LoadingDrv, Resume::Job(JobOutput::Derivation(result))) => match result {
                Err(err) => self.fail(
                    FailureKind::StoreFailure,
                    format!("cannot read derivation '{}': {err}", self.drv_path),
                ),
                Ok(drv) => {
                    self.wanted = drv.wanted_outputs(&self.outputs_spec);
                    if self.wanted.is_empty() {
                        return self.fail(
                            FailureKind::StoreFailure,
                            format!(
                                "derivation '{}' has no output matching '{}'",
                                self.drv_path, self.outputs_spec
                            ),
                        );
                    }
                    self.drv = Some(drv);
                    self.start_output_check(ctx)
                }
            },

            (DrvState::CheckingOutputs, Resume::Job(JobOutput::ValidOutputs(result))) => {
                match result {
                    Err(err) => self.fail(
                        FailureKind::StoreFailure,
                        format!(
                            "cannot check outputs of '{}': {err}",
                            self.drv_path
                        ),
                    ),
                    Ok(valid) => self.on_outputs_checked(ctx, valid),
                }
            }

            (
                DrvState::SubstitutingOutputs,
                Resume::WaiteesDone {
                    nr_failed,
                    outcomes,
                    ..
                },
            ) => {
                if nr_failed == 0 {
                    return GoalStep::Finish(GoalOutcome::Success {
                        status: SuccessStatus::Substituted,
                        outputs: self.substituted_outputs(&outcomes),
                    });
                }
                // Substitution is opportunistic; fall back to building.
                debug!(
                    drv = %self.drv_path,
                    nr_failed,
                    "substitution did not cover all outputs, falling back to build"
                );
                self.start_input_graph(ctx)
            }

            (DrvState::LoadingInputGraph, Resume::Job(JobOutput::InputGraph(result))) => {
                match result {
                    Err(InputGraphError::Cycle(cycle)) => self.fail(
                        FailureKind::InputCycle,
                        format!(
                            "dependency cycle in the inputs of '{}': '{}' <-> '{}'",
                            self.drv_path, cycle.node, cycle.parent
                        ),
                    ),
                    Err(InputGraphError::Store(err)) => self.fail(
                        FailureKind::StoreFailure,
                        format!("cannot expand inputs of '{}': {err}", self.drv_path),
                    ),
                    Ok(()) => self.start_input_waitees(),
                }
            }

            (DrvState::WaitingForInputs, Resume::WaiteesDone { nr_failed, .. }) => {
                if nr_failed > 0 {
                    return self.fail(
                        FailureKind::DependencyFailed,
                        format!(
                            "{nr_failed} dependencies of '{}' failed",
                            self.drv_path
                        ),
                    );
                }
                self.start_build(ctx)
            }

            (DrvState::Building, Resume::Job(JobOutput::Build(result))) => {
                self.on_build_result(result)
            }

            (DrvState::Building, Resume::Job(JobOutput::BuildTimedOut)) => {
                warn!(drv = %self.drv_path, "build timed out");
                let outcome = self.timed_out(format!(
                    "build of '{}' exceeded the configured timeout",
                    self.drv_path
                ));
                GoalStep::Finish(outcome)
            }

            (_, resume) => self.fail(
                FailureKind::StoreFailure,
                format!(
                    "internal: build of '{}' resumed with unexpected {resume:?}",
                    self.drv_path
                ),
            ),
        }
    }

    fn handle_child_output(&mut self, _channel: LogChannel, line: &str) {
        if self.log_tail.len() == self.log_tail_limit {
            self.log_tail.pop_front();
        }
        if self.log_tail_limit > 0 {
            self.log_tail.push_back(line.to_string());
        }
    }

    fn cleanup(&mut self) {
        self.expected.take();
        self.drv = None;
        self.log_tail.clear();
    }
}

/// Build job: runs the executor while forwarding its log stream to the
/// worker as child-output events, then reports the result. The whole thing
/// races against the configured timeout.
#[allow(clippy::too_many_arguments)]
fn make_build_job(
    executor: Arc<dyn BuildExecutor>,
    drv: Derivation,
    wanted: Vec<OutputName>,
    mode: BuildMode,
    machine: Machine,
    events: mpsc::Sender<WorkerEvent>,
    key: GoalKey,
    timeout: Option<Duration>,
) -> GoalJob {
    Box::pin(async move {
        let (log_tx, mut log_rx) = mpsc::channel(64);
        let log = BuildLog::new(log_tx);

        let build =
            async move { executor.build(&drv, &wanted, mode, &machine, log).await };
        tokio::pin!(build);

        let run = async {
            loop {
                tokio::select! {
                    maybe_line = log_rx.recv() => match maybe_line {
                        Some((channel, line)) => {
                            let _ = events
                                .send(WorkerEvent::ChildOutput {
                                    key: key.clone(),
                                    channel,
                                    line,
                                })
                                .await;
                        }
                        // Executor dropped its log handle early; just wait
                        // for the result.
                        None => break (&mut build).await,
                    },
                    result = &mut build => break result,
                }
            }
        };

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => JobOutput::Build(result),
                Err(_) => JobOutput::BuildTimedOut,
            },
            None => JobOutput::Build(run.await),
        };

        // Lines the select loop never got to are still part of the log.
        while let Ok((channel, line)) = log_rx.try_recv() {
            let _ = events
                .send(WorkerEvent::ChildOutput {
                    key: key.clone(),
                    channel,
                    line,
                })
                .await;
        }
        let _ = events.send(WorkerEvent::ChildEof { key }).await;
        output
    })
}
