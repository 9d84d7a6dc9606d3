// src/capability/mod.rs

//! Executor capability model.
//!
//! A capability describes what a given executor (the local machine or a
//! configured remote builder) is allowed to run. Matching is pure set
//! containment; ranking orders equally-capable executors by speed under
//! their current load.

use std::collections::BTreeSet;

use crate::types::OutputName;

/// Anything that can be matched against a capability: exposes the platform
/// it must run on and the features it requires.
pub trait Schedulable {
    fn system(&self) -> &str;
    fn required_features(&self) -> &BTreeSet<String>;
    /// Advisory: prefer a local executor when one is eligible, e.g. because
    /// copy overhead would dominate a cheap build.
    fn prefers_local(&self) -> bool {
        false
    }
}

/// What one executor is able and willing to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCapability {
    pub system: String,
    pub supported_features: BTreeSet<String>,
    /// Features a task *must* require for this capability to accept it.
    /// Lets a builder be reserved for e.g. `big-parallel` work only.
    pub mandatory_features: BTreeSet<String>,
}

impl BuildCapability {
    /// Whether `task` can run under this capability.
    ///
    /// Both directions are checked: the capability must support everything
    /// the task requires, and the task must require everything the
    /// capability mandates. A `"builtin"` system matches any capability.
    pub fn can_build(&self, task: &dyn Schedulable) -> bool {
        if task.system() != "builtin" && task.system() != self.system {
            return false;
        }
        let required = task.required_features();
        required.iter().all(|f| self.supported_features.contains(f))
            && self.mandatory_features.iter().all(|f| required.contains(f))
    }
}

/// A [`BuildCapability`] plus the scheduling knobs the worker needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulableCapability {
    pub capability: BuildCapability,
    /// Concurrency ceiling; `None` means unlimited (or remote-controlled).
    pub max_jobs: Option<u32>,
    pub is_local: bool,
    /// Relative speed, > 0. Higher is preferred; divided by current load
    /// when ranking.
    pub speed_factor: f32,
}

/// A named executor: the local machine or one configured remote builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    /// Stable name, used for load accounting ("local" for the local machine).
    pub name: String,
    pub capabilities: Vec<SchedulableCapability>,
}

impl Machine {
    pub fn can_build(&self, task: &dyn Schedulable) -> bool {
        self.capabilities
            .iter()
            .any(|sc| sc.capability.can_build(task))
    }

    pub fn is_local(&self) -> bool {
        self.capabilities.iter().any(|sc| sc.is_local)
    }
}

/// Rank machines eligible for `task` best-first.
///
/// Ordering key: `speed_factor / (1 + current_load)` descending, where the
/// load is the number of builds the worker currently has running on that
/// machine. When the task prefers local execution, eligible local machines
/// sort ahead of remote ones; the preference is advisory, not a filter, so
/// remote machines stay in the list.
pub fn rank_candidates<'a>(
    machines: &'a [Machine],
    task: &dyn Schedulable,
    load_of: impl Fn(&str) -> usize,
) -> Vec<&'a Machine> {
    let mut eligible: Vec<(&Machine, f32)> = machines
        .iter()
        .filter(|m| m.can_build(task))
        .map(|m| {
            let speed: f32 = m
                .capabilities
                .iter()
                .filter(|sc| sc.capability.can_build(task))
                .map(|sc| sc.speed_factor)
                .fold(0.0, f32::max);
            let load = load_of(&m.name) as f32;
            (m, speed / (1.0 + load))
        })
        .collect();

    eligible.sort_by(|(a, score_a), (b, score_b)| {
        if task.prefers_local() {
            match (a.is_local(), b.is_local()) {
                (true, false) => return std::cmp::Ordering::Less,
                (false, true) => return std::cmp::Ordering::Greater,
                _ => {}
            }
        }
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    eligible.into_iter().map(|(m, _)| m).collect()
}
