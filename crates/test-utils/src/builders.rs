#![allow(dead_code)]

//! Builders and naming helpers for test graphs.

use std::collections::{BTreeMap, BTreeSet};

use builddag::capability::{BuildCapability, Machine, SchedulableCapability};
use builddag::store::Derivation;
use builddag::types::{DerivedPath, OutputsSpec, StorePath};

/// The platform every test derivation runs on unless overridden.
pub const TEST_SYSTEM: &str = "x86_64-linux";

/// Store path of the derivation named `name`.
pub fn drv_path(name: &str) -> StorePath {
    StorePath::new(format!("/store/{name}.drv"))
}

/// Store path of the `out` output of the derivation named `name`.
pub fn out_path(name: &str) -> StorePath {
    StorePath::new(format!("/store/{name}-out"))
}

/// A top-level request for the `out` output of `name`.
pub fn request(name: &str) -> DerivedPath {
    DerivedPath::Built {
        drv_path: drv_path(name),
        outputs: OutputsSpec::All,
    }
}

/// The local machine capability used by most tests.
pub fn local_machine() -> Machine {
    Machine {
        name: "local".to_string(),
        capabilities: vec![SchedulableCapability {
            capability: BuildCapability {
                system: TEST_SYSTEM.to_string(),
                supported_features: BTreeSet::new(),
                mandatory_features: BTreeSet::new(),
            },
            max_jobs: Some(4),
            is_local: true,
            speed_factor: 1.0,
        }],
    }
}

/// Builder for test [`Derivation`]s. Defaults: one `out` output at
/// [`out_path`], no inputs, [`TEST_SYSTEM`], substitutable.
pub struct DerivationBuilder {
    drv: Derivation,
}

impl DerivationBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            drv: Derivation {
                name: name.to_string(),
                outputs: BTreeMap::from([("out".to_string(), out_path(name))]),
                input_drvs: BTreeMap::new(),
                input_srcs: BTreeSet::new(),
                system: TEST_SYSTEM.to_string(),
                required_features: BTreeSet::new(),
                prefers_local: false,
                substitutable: true,
            },
        }
    }

    pub fn output(mut self, name: &str, path: StorePath) -> Self {
        self.drv.outputs.insert(name.to_string(), path);
        self
    }

    /// Depend on the `out` output of the derivation named `input`.
    pub fn input(mut self, input: &str) -> Self {
        self.drv
            .input_drvs
            .insert(drv_path(input), BTreeSet::from(["out".to_string()]));
        self
    }

    pub fn input_src(mut self, path: StorePath) -> Self {
        self.drv.input_srcs.insert(path);
        self
    }

    pub fn system(mut self, system: &str) -> Self {
        self.drv.system = system.to_string();
        self
    }

    pub fn require_feature(mut self, feature: &str) -> Self {
        self.drv.required_features.insert(feature.to_string());
        self
    }

    pub fn prefers_local(mut self) -> Self {
        self.drv.prefers_local = true;
        self
    }

    pub fn not_substitutable(mut self) -> Self {
        self.drv.substitutable = false;
        self
    }

    pub fn build(self) -> Derivation {
        self.drv
    }
}
