// src/config/model.rs

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

use crate::capability::{BuildCapability, Machine, SchedulableCapability};
use crate::errors::BuilddagError;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [scheduler]
/// max_build_jobs = 4
/// max_substitution_jobs = 16
/// keep_going = false
///
/// [local]
/// system = "x86_64-linux"
/// supported_features = ["kvm"]
///
/// [[machine]]
/// name = "builder1"
/// systems = ["aarch64-linux"]
/// max_jobs = 8
/// speed_factor = 2.0
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub local: LocalSection,

    /// Remote builders from `[[machine]]`.
    #[serde(default)]
    pub machine: Vec<MachineConfig>,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// Ceiling on concurrently running local builds. `0` disallows local
    /// builds entirely (everything must be substituted or built remotely).
    #[serde(default = "default_max_build_jobs")]
    pub max_build_jobs: usize,

    /// Ceiling on concurrently running substitutions.
    #[serde(default = "default_max_substitution_jobs")]
    pub max_substitution_jobs: usize,

    /// Keep realising independent branches after one goal fails.
    #[serde(default)]
    pub keep_going: bool,

    /// Consult substituters before building locally.
    #[serde(default = "default_true")]
    pub try_substitutes: bool,

    /// Abort a build after this many seconds; absent means no limit.
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,

    /// How many trailing build log lines to keep for failure messages.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_max_build_jobs() -> usize {
    4
}

fn default_max_substitution_jobs() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_log_tail_lines() -> usize {
    25
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_build_jobs: default_max_build_jobs(),
            max_substitution_jobs: default_max_substitution_jobs(),
            keep_going: false,
            try_substitutes: true,
            build_timeout_secs: None,
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// `[local]` section: the capability of this machine.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalSection {
    #[serde(default = "default_system")]
    pub system: String,

    #[serde(default)]
    pub supported_features: BTreeSet<String>,

    #[serde(default)]
    pub mandatory_features: BTreeSet<String>,

    #[serde(default = "default_speed_factor")]
    pub speed_factor: f32,
}

fn default_system() -> String {
    // What the scheduler runs on is really the embedder's call; this is the
    // fallback for configs that do not say.
    std::env::consts::ARCH.to_string() + "-" + std::env::consts::OS
}

fn default_speed_factor() -> f32 {
    1.0
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            system: default_system(),
            supported_features: BTreeSet::new(),
            mandatory_features: BTreeSet::new(),
            speed_factor: default_speed_factor(),
        }
    }
}

/// `[[machine]]` section: one configured remote builder.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    pub name: String,

    /// Platforms this builder accepts; one capability per entry.
    pub systems: Vec<String>,

    #[serde(default)]
    pub supported_features: BTreeSet<String>,

    #[serde(default)]
    pub mandatory_features: BTreeSet<String>,

    /// Concurrency ceiling on the remote side; absent means the remote
    /// controls it.
    #[serde(default)]
    pub max_jobs: Option<u32>,

    #[serde(default = "default_speed_factor")]
    pub speed_factor: f32,
}

/// A validated configuration.
///
/// Only constructible through [`TryFrom<RawConfigFile>`], which runs the
/// checks in [`crate::config::validate`].
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub scheduler: SchedulerSection,
    pub local: LocalSection,
    pub machine: Vec<MachineConfig>,
}

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = BuilddagError;

    fn try_from(raw: RawConfigFile) -> Result<Self, Self::Error> {
        crate::config::validate::validate_config(&raw)?;
        Ok(ConfigFile {
            scheduler: raw.scheduler,
            local: raw.local,
            machine: raw.machine,
        })
    }
}

impl ConfigFile {
    /// The explicit settings struct handed to the worker.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_build_jobs: self.scheduler.max_build_jobs,
            max_substitution_jobs: self.scheduler.max_substitution_jobs,
            keep_going: self.scheduler.keep_going,
            try_substitutes: self.scheduler.try_substitutes,
            build_timeout: self.scheduler.build_timeout_secs.map(Duration::from_secs),
            log_tail_lines: self.scheduler.log_tail_lines,
        }
    }

    /// The capability records admitted for this run: the local machine
    /// followed by every configured remote builder.
    pub fn machines(&self) -> Vec<Machine> {
        let mut machines = vec![Machine {
            name: "local".to_string(),
            capabilities: vec![SchedulableCapability {
                capability: BuildCapability {
                    system: self.local.system.clone(),
                    supported_features: self.local.supported_features.clone(),
                    mandatory_features: self.local.mandatory_features.clone(),
                },
                max_jobs: Some(self.scheduler.max_build_jobs as u32),
                is_local: true,
                speed_factor: self.local.speed_factor,
            }],
        }];

        for mc in &self.machine {
            machines.push(Machine {
                name: mc.name.clone(),
                capabilities: mc
                    .systems
                    .iter()
                    .map(|system| SchedulableCapability {
                        capability: BuildCapability {
                            system: system.clone(),
                            supported_features: mc.supported_features.clone(),
                            mandatory_features: mc.mandatory_features.clone(),
                        },
                        max_jobs: mc.max_jobs,
                        is_local: false,
                        speed_factor: mc.speed_factor,
                    })
                    .collect(),
            });
        }

        machines
    }
}

/// Settings the worker actually consumes.
///
/// Constructed once (from [`ConfigFile::scheduler_config`] or directly in
/// tests) and passed into the worker; goals never read ambient global state,
/// so independent workers with independent settings can coexist in one
/// process.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_build_jobs: usize,
    pub max_substitution_jobs: usize,
    pub keep_going: bool,
    pub try_substitutes: bool,
    pub build_timeout: Option<Duration>,
    pub log_tail_lines: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let section = SchedulerSection::default();
        Self {
            max_build_jobs: section.max_build_jobs,
            max_substitution_jobs: section.max_substitution_jobs,
            keep_going: section.keep_going,
            try_substitutes: section.try_substitutes,
            build_timeout: None,
            log_tail_lines: section.log_tail_lines,
        }
    }
}
