// src/store/derivation.rs

//! Derivations as the scheduler sees them.
//!
//! A derivation is produced upstream by the evaluator; the scheduler only
//! reads the pieces that matter for ordering and placement: outputs, input
//! edges, platform and feature requirements.

use std::collections::{BTreeMap, BTreeSet};

use crate::capability::Schedulable;
use crate::types::{OutputName, OutputsSpec, StorePath};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub name: String,
    /// Output name to the store path the build will produce for it.
    pub outputs: BTreeMap<OutputName, StorePath>,
    /// Input derivations and which of their outputs this build consumes.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<OutputName>>,
    /// Input sources already in the store (or substitutable).
    pub input_srcs: BTreeSet<StorePath>,
    pub system: String,
    pub required_features: BTreeSet<String>,
    /// Hint that copy overhead would dominate this build.
    pub prefers_local: bool,
    /// Whether remote caches may be consulted for this derivation's outputs.
    pub substitutable: bool,
}

impl Derivation {
    /// The (name, path) pairs of outputs selected by `spec`.
    pub fn wanted_outputs(&self, spec: &OutputsSpec) -> Vec<(OutputName, StorePath)> {
        self.outputs
            .iter()
            .filter(|(name, _)| spec.contains(name))
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect()
    }

    pub fn output_path(&self, name: &str) -> Option<&StorePath> {
        self.outputs.get(name)
    }
}

impl Schedulable for Derivation {
    fn system(&self) -> &str {
        &self.system
    }

    fn required_features(&self) -> &BTreeSet<String> {
        &self.required_features
    }

    fn prefers_local(&self) -> bool {
        self.prefers_local
    }
}
