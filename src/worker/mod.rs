// src/worker/mod.rs

//! The coordinating scheduler loop.
//!
//! One worker owns every goal of a run. Goal state only ever changes on
//! this loop: async jobs run on the runtime but report back through a
//! single event channel, so steps never race. The loop alternates between
//! draining the runnable queue, admitting slot-parked jobs, and sleeping on
//! the event channel until something completes.

pub mod counters;
pub mod slots;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::capability::Machine;
use crate::config::SchedulerConfig;
use crate::errors::{BuilddagError, Result};
use crate::goal::{
    DerivationGoal, DrvOutputSubstitutionGoal, FailureKind, Goal, GoalContext, GoalJob,
    GoalKey, GoalOutcome, GoalRequest, GoalState, GoalStep, JobOutput, PathSubstitutionGoal,
    Resume,
};
use crate::store::{BuildExecutor, LogChannel, Store, Substituter};
use crate::types::{BuildMode, DerivedPath, JobCategory};

use counters::Counters;
use slots::SlotTable;

/// Events delivered to the coordinating loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// An async job issued by a goal completed.
    JobFinished { key: GoalKey, output: JobOutput },
    /// A build job produced one log line.
    ChildOutput {
        key: GoalKey,
        channel: LogChannel,
        line: String,
    },
    /// A build job's log stream closed.
    ChildEof { key: GoalKey },
    /// External request to stop the run.
    Interrupted,
}

/// Result of one top-level request after a run.
#[derive(Debug, Clone)]
pub struct RealizeOutcome {
    pub request: DerivedPath,
    pub outcome: GoalOutcome,
}

/// Cloneable handle that asks a running worker to stop.
///
/// Open goals transition to a failed `Interrupted` outcome and in-flight
/// jobs are aborted; [`Worker::realize`] still returns the per-request
/// outcomes it has.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: mpsc::Sender<WorkerEvent>,
}

impl InterruptHandle {
    pub async fn interrupt(&self) {
        let _ = self.tx.send(WorkerEvent::Interrupted).await;
    }
}

struct GoalEntry {
    goal: Box<dyn Goal>,
    state: GoalState,
    /// Keys this goal is currently waiting on.
    waitees: HashSet<GoalKey>,
    /// Every waitee key of the current round, finished ones included, in
    /// registration order.
    round: Vec<GoalKey>,
    /// Keys waiting on this goal.
    waiters: HashSet<GoalKey>,
    /// Failure accounting for the current wait round.
    nr_failed: usize,
    nr_no_substituters: usize,
}

struct JobHandle {
    handle: JoinHandle<()>,
    slot: Option<JobCategory>,
    machine: Option<String>,
}

struct ParkedJob {
    key: GoalKey,
    job: GoalJob,
    category: JobCategory,
    machine: Option<String>,
}

/// Why a goal is queued for resumption. `WaiteesDone` payloads are read
/// from the entry's accounting at dispatch time, not enqueue time, so late
/// failures are never missed.
enum ResumeKind {
    Start,
    WaiteesDone,
    Job(JobOutput),
}

pub struct Worker {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    /// Sorted best-first (ascending priority) at construction.
    substituters: Vec<Arc<dyn Substituter>>,
    executor: Arc<dyn BuildExecutor>,
    machines: Vec<Machine>,

    counters: Counters,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,

    goals: HashMap<GoalKey, GoalEntry>,
    runnable: VecDeque<(GoalKey, ResumeKind)>,
    wanting_slot: VecDeque<ParkedJob>,
    jobs: HashMap<GoalKey, JobHandle>,
    slots: SlotTable,
    machine_loads: HashMap<String, usize>,
    failed_substituters: HashSet<String>,
    top_goals: HashSet<GoalKey>,
    aborting: bool,
}

impl Worker {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        mut substituters: Vec<Arc<dyn Substituter>>,
        executor: Arc<dyn BuildExecutor>,
        machines: Vec<Machine>,
    ) -> Self {
        substituters.sort_by_key(|sub| sub.priority());
        let (events_tx, events_rx) = mpsc::channel(256);
        let slots = SlotTable::new(config.max_build_jobs, config.max_substitution_jobs);
        Self {
            config,
            store,
            substituters,
            executor,
            machines,
            counters: Counters::default(),
            events_tx,
            events_rx,
            goals: HashMap::new(),
            runnable: VecDeque::new(),
            wanting_slot: VecDeque::new(),
            jobs: HashMap::new(),
            slots,
            machine_loads: HashMap::new(),
            failed_substituters: HashSet::new(),
            top_goals: HashSet::new(),
            aborting: false,
        }
    }

    /// Shared progress gauges; clone before starting the run to watch it.
    pub fn counters(&self) -> Counters {
        self.counters.clone()
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Drive every request to a terminal outcome.
    ///
    /// Consumes the worker: goal identity and the substituter cooldown set
    /// are scoped to one run. Returns one outcome per request, in request
    /// order; `Err` is reserved for scheduler-level faults (deadlock).
    pub async fn realize(
        mut self,
        requests: Vec<DerivedPath>,
        mode: BuildMode,
    ) -> Result<Vec<RealizeOutcome>> {
        let mut tops: Vec<(DerivedPath, GoalKey)> = Vec::new();
        for request in requests {
            let goal_request = match &request {
                DerivedPath::Opaque(path) => GoalRequest::Substitution {
                    path: path.clone(),
                    repair: mode == BuildMode::Repair,
                },
                DerivedPath::Built { drv_path, outputs } => GoalRequest::Derivation {
                    drv_path: drv_path.clone(),
                    outputs: outputs.clone(),
                    mode,
                },
            };
            let key = self.ensure_goal(&goal_request);
            self.top_goals.insert(key.clone());
            tops.push((request, key));
        }
        info!(requests = tops.len(), "starting run");

        loop {
            while let Some((key, kind)) = self.runnable.pop_front() {
                self.resume_goal(key, kind);
            }
            self.admit_parked();

            if self.all_done(&tops) {
                break;
            }

            if self.jobs.is_empty() && self.runnable.is_empty() {
                let unresolved = self
                    .goals
                    .values()
                    .filter(|entry| !matches!(entry.state, GoalState::Done(_)))
                    .count();
                error!(unresolved, "no runnable goals and no outstanding jobs");
                return Err(BuilddagError::Deadlock { unresolved });
            }

            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.dispatch_event(event);
            // Whatever else already arrived can be handled in the same pass.
            while let Ok(event) = self.events_rx.try_recv() {
                self.dispatch_event(event);
            }
        }

        info!(
            done_builds = self.counters.done_builds.get(),
            done_substitutions = self.counters.done_substitutions.get(),
            "run finished"
        );

        Ok(tops
            .into_iter()
            .map(|(request, key)| {
                let outcome = match self.goals.get(&key).map(|entry| &entry.state) {
                    Some(GoalState::Done(outcome)) => outcome.clone(),
                    _ => GoalOutcome::failure(
                        FailureKind::Interrupted,
                        format!("'{request}' was never resolved"),
                    ),
                };
                RealizeOutcome { request, outcome }
            })
            .collect())
    }

    fn all_done(&self, tops: &[(DerivedPath, GoalKey)]) -> bool {
        tops.iter().all(|(_, key)| {
            matches!(
                self.goals.get(key).map(|entry| &entry.state),
                Some(GoalState::Done(_))
            )
        })
    }

    /// Look up the live goal for `request`, creating and scheduling it if
    /// none exists. Finished goals stay in the table, so repeated requests
    /// reuse their outcome instead of redoing the work.
    fn ensure_goal(&mut self, request: &GoalRequest) -> GoalKey {
        let key = request.key();
        if self.goals.contains_key(&key) {
            return key;
        }

        let goal: Box<dyn Goal> = match request {
            GoalRequest::Substitution { path, repair } => Box::new(PathSubstitutionGoal::new(
                path.clone(),
                *repair,
                self.counters.expected_substitutions.maintain(1),
            )),
            GoalRequest::DrvOutput { id, known_path } => Box::new(
                DrvOutputSubstitutionGoal::new(id.clone(), known_path.clone()),
            ),
            GoalRequest::Derivation {
                drv_path,
                outputs,
                mode,
            } => Box::new(DerivationGoal::new(
                drv_path.clone(),
                outputs.clone(),
                *mode,
                self.config.log_tail_lines,
                self.counters.expected_builds.maintain(1),
            )),
        };

        trace!(key = %key, name = %goal.name(), "creating goal");
        self.goals.insert(
            key.clone(),
            GoalEntry {
                goal,
                state: GoalState::Pending,
                waitees: HashSet::new(),
                round: Vec::new(),
                waiters: HashSet::new(),
                nr_failed: 0,
                nr_no_substituters: 0,
            },
        );
        self.runnable.push_back((key.clone(), ResumeKind::Start));
        key
    }

    fn resume_goal(&mut self, key: GoalKey, kind: ResumeKind) {
        let outcomes = if matches!(kind, ResumeKind::WaiteesDone) {
            self.round_outcomes(&key)
        } else {
            Vec::new()
        };
        let step = {
            let Some(entry) = self.goals.get_mut(&key) else {
                return;
            };
            if matches!(entry.state, GoalState::Done(_)) {
                return;
            }
            entry.state = GoalState::Running;

            let resume = match kind {
                ResumeKind::Start => Resume::Start,
                ResumeKind::WaiteesDone => Resume::WaiteesDone {
                    nr_failed: entry.nr_failed,
                    nr_no_substituters: entry.nr_no_substituters,
                    outcomes,
                },
                ResumeKind::Job(output) => Resume::Job(output),
            };

            let mut ctx = GoalContext {
                config: &self.config,
                store: &self.store,
                substituters: &self.substituters,
                executor: &self.executor,
                machines: &self.machines,
                failed_substituters: &mut self.failed_substituters,
                counters: &self.counters,
                machine_loads: &self.machine_loads,
                events: &self.events_tx,
            };
            entry.goal.step(&mut ctx, resume)
        };

        match step {
            GoalStep::Finish(outcome) => self.finish_goal(&key, outcome),
            GoalStep::WaitForGoals(requests) => self.add_waitees(&key, requests),
            GoalStep::StartJob { job, slot, machine } => {
                self.start_job(key, job, slot, machine)
            }
        }
    }

    /// Terminal outcomes of the goal's current waitee round, in
    /// registration order.
    fn round_outcomes(&self, key: &GoalKey) -> Vec<GoalOutcome> {
        let Some(entry) = self.goals.get(key) else {
            return Vec::new();
        };
        entry
            .round
            .iter()
            .filter_map(|wkey| match self.goals.get(wkey).map(|e| &e.state) {
                Some(GoalState::Done(outcome)) => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    /// Register a fresh round of waitees for `key`. Failure accounting is
    /// reset: each wait round reports only its own waitees' failures.
    fn add_waitees(&mut self, key: &GoalKey, requests: Vec<GoalRequest>) {
        let mut nr_failed = 0;
        let mut nr_no_substituters = 0;
        let mut pending: HashSet<GoalKey> = HashSet::new();
        let mut round: Vec<GoalKey> = Vec::new();
        let mut seen: HashSet<GoalKey> = HashSet::new();

        for request in requests {
            let wkey = self.ensure_goal(&request);
            if wkey == *key || !seen.insert(wkey.clone()) {
                continue;
            }
            round.push(wkey.clone());
            let Some(wentry) = self.goals.get_mut(&wkey) else {
                continue;
            };
            match &wentry.state {
                GoalState::Done(outcome) => {
                    if !outcome.is_success() {
                        nr_failed += 1;
                        if outcome.failure_kind() == Some(FailureKind::SubstituterUnavailable) {
                            nr_no_substituters += 1;
                        }
                    }
                }
                _ => {
                    wentry.waiters.insert(key.clone());
                    pending.insert(wkey);
                }
            }
        }

        let Some(entry) = self.goals.get_mut(key) else {
            return;
        };
        entry.nr_failed = nr_failed;
        entry.nr_no_substituters = nr_no_substituters;
        entry.waitees = pending;
        entry.round = round;
        if entry.waitees.is_empty() {
            entry.state = GoalState::Runnable;
            self.runnable
                .push_back((key.clone(), ResumeKind::WaiteesDone));
        } else {
            entry.state = GoalState::Waiting;
        }
    }

    fn start_job(
        &mut self,
        key: GoalKey,
        job: GoalJob,
        slot: Option<JobCategory>,
        machine: Option<String>,
    ) {
        if let Some(category) = slot {
            if !self.slots.try_acquire(category) {
                trace!(key = %key, ?category, "no free slot, parking job");
                if let Some(entry) = self.goals.get_mut(&key) {
                    entry.state = GoalState::Waiting;
                }
                self.wanting_slot.push_back(ParkedJob {
                    key,
                    job,
                    category,
                    machine,
                });
                return;
            }
        }
        self.spawn_job(key, job, slot, machine);
    }

    /// Hand freed slots to parked jobs, oldest first per category.
    fn admit_parked(&mut self) {
        let mut still_parked = VecDeque::new();
        while let Some(parked) = self.wanting_slot.pop_front() {
            let gone = matches!(
                self.goals.get(&parked.key).map(|entry| &entry.state),
                None | Some(GoalState::Done(_))
            );
            if gone {
                continue;
            }
            if self.slots.try_acquire(parked.category) {
                if let Some(entry) = self.goals.get_mut(&parked.key) {
                    entry.state = GoalState::Running;
                }
                self.spawn_job(parked.key, parked.job, Some(parked.category), parked.machine);
            } else {
                still_parked.push_back(parked);
            }
        }
        self.wanting_slot = still_parked;
    }

    fn spawn_job(
        &mut self,
        key: GoalKey,
        job: GoalJob,
        slot: Option<JobCategory>,
        machine: Option<String>,
    ) {
        if machine.is_some() {
            self.counters.running_builds.add(1);
        } else {
            match slot {
                Some(JobCategory::Build) => self.counters.running_builds.add(1),
                Some(JobCategory::Substitution) => self.counters.running_substitutions.add(1),
                _ => {}
            }
        }
        if let Some(name) = &machine {
            *self.machine_loads.entry(name.clone()).or_insert(0) += 1;
        }

        let events = self.events_tx.clone();
        let job_key = key.clone();
        let handle = tokio::spawn(async move {
            let output = job.await;
            let _ = events
                .send(WorkerEvent::JobFinished {
                    key: job_key,
                    output,
                })
                .await;
        });
        self.jobs.insert(
            key,
            JobHandle {
                handle,
                slot,
                machine,
            },
        );
    }

    fn release_job_resources(&mut self, handle: &JobHandle) {
        if let Some(category) = handle.slot {
            self.slots.release(category);
        }
        if let Some(name) = &handle.machine {
            if let Some(load) = self.machine_loads.get_mut(name) {
                *load = load.saturating_sub(1);
            }
            self.counters.running_builds.sub(1);
        } else {
            match handle.slot {
                Some(JobCategory::Build) => self.counters.running_builds.sub(1),
                Some(JobCategory::Substitution) => self.counters.running_substitutions.sub(1),
                _ => {}
            }
        }
    }

    fn dispatch_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::JobFinished { key, output } => {
                // Resources come back before any admission decision so a
                // freed slot is visible to the next pass.
                if let Some(handle) = self.jobs.remove(&key) {
                    self.release_job_resources(&handle);
                }
                self.runnable.push_back((key, ResumeKind::Job(output)));
            }
            WorkerEvent::ChildOutput { key, channel, line } => {
                if let Some(entry) = self.goals.get_mut(&key) {
                    if !matches!(entry.state, GoalState::Done(_)) {
                        entry.goal.handle_child_output(channel, &line);
                    }
                }
            }
            WorkerEvent::ChildEof { key } => {
                if let Some(entry) = self.goals.get_mut(&key) {
                    if !matches!(entry.state, GoalState::Done(_)) {
                        entry.goal.handle_eof(LogChannel::Stdout);
                        entry.goal.handle_eof(LogChannel::Stderr);
                    }
                }
            }
            WorkerEvent::Interrupted => {
                self.abort_run("interrupted".to_string());
            }
        }
    }

    /// Drive `key` to `outcome`: run cleanup, settle counters, wake
    /// waiters, and enforce the fail-fast policy for top-level goals.
    fn finish_goal(&mut self, key: &GoalKey, outcome: GoalOutcome) {
        let (category, name) = {
            let Some(entry) = self.goals.get_mut(key) else {
                return;
            };
            if matches!(entry.state, GoalState::Done(_)) {
                return;
            }
            entry.goal.cleanup();
            let category = entry.goal.job_category();
            let name = entry.goal.name();
            entry.state = GoalState::Done(outcome.clone());
            (category, name)
        };

        match &outcome {
            GoalOutcome::Success { status, .. } => {
                debug!(goal = %name, ?status, "goal finished");
            }
            GoalOutcome::Failure { kind, message } => {
                warn!(goal = %name, ?kind, %message, "goal failed");
            }
        }

        match category {
            JobCategory::Build => {
                self.counters.done_builds.add(1);
                if !outcome.is_success() {
                    self.counters.failed_builds.add(1);
                }
            }
            JobCategory::Substitution => {
                self.counters.done_substitutions.add(1);
                if !outcome.is_success() {
                    self.counters.failed_substitutions.add(1);
                }
            }
            JobCategory::Administration => {}
        }

        let waiters = match self.goals.get_mut(key) {
            Some(entry) => std::mem::take(&mut entry.waiters),
            None => return,
        };
        let failed = !outcome.is_success();
        let no_substituters =
            outcome.failure_kind() == Some(FailureKind::SubstituterUnavailable);

        for wkey in waiters {
            let Some(wentry) = self.goals.get_mut(&wkey) else {
                continue;
            };
            if matches!(wentry.state, GoalState::Done(_)) {
                continue;
            }
            wentry.waitees.remove(key);
            if failed {
                wentry.nr_failed += 1;
                if no_substituters {
                    wentry.nr_no_substituters += 1;
                }
            }
            if wentry.waitees.is_empty() && matches!(wentry.state, GoalState::Waiting) {
                wentry.state = GoalState::Runnable;
                self.runnable
                    .push_back((wkey.clone(), ResumeKind::WaiteesDone));
            }
        }

        if failed && !self.config.keep_going && !self.aborting && self.top_goals.contains(key)
        {
            self.abort_run(format!("aborting run after failure of {name}"));
        }
    }

    /// Stop everything: abort in-flight jobs, drop queued work, and finish
    /// every open goal as interrupted.
    fn abort_run(&mut self, reason: String) {
        if self.aborting {
            return;
        }
        self.aborting = true;
        warn!(%reason, "aborting run");

        let handles: Vec<JobHandle> = self.jobs.drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.handle.abort();
            self.release_job_resources(&handle);
        }
        self.runnable.clear();
        self.wanting_slot.clear();

        let open: Vec<GoalKey> = self
            .goals
            .iter()
            .filter(|(_, entry)| !matches!(entry.state, GoalState::Done(_)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in open {
            self.finish_goal(
                &key,
                GoalOutcome::failure(FailureKind::Interrupted, reason.clone()),
            );
        }
    }
}
