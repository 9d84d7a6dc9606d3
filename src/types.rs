// src/types.rs

//! Small shared types used across the scheduler.

use std::collections::BTreeSet;
use std::fmt;

use crate::errors::BuilddagError;

/// A path in the content-addressed store.
///
/// The scheduler treats these as opaque identifiers; how they map onto disk
/// is the store collaborator's business.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(pub String);

impl StorePath {
    pub fn new(s: impl Into<String>) -> Self {
        StorePath(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorePath {
    fn from(s: &str) -> Self {
        StorePath(s.to_string())
    }
}

/// Name of one derivation output (e.g. `"out"`, `"dev"`).
pub type OutputName = String;

/// Identity of one concrete derivation output, independent of whether it is
/// built or substituted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvOutputId {
    pub drv_path: StorePath,
    pub output: OutputName,
}

impl fmt::Display for DrvOutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.drv_path, self.output)
    }
}

/// Which outputs of a derivation a request wants.
///
/// "Want nothing" is not representable: the `Names` variant is only
/// constructed through [`OutputsSpec::names`], which rejects the empty set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputsSpec {
    All,
    Names(BTreeSet<OutputName>),
}

impl OutputsSpec {
    /// Build an explicit named subset; fails on an empty iterator.
    pub fn names<I, S>(names: I) -> Result<Self, BuilddagError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OutputName>,
    {
        let set: BTreeSet<OutputName> = names.into_iter().map(Into::into).collect();
        if set.is_empty() {
            return Err(BuilddagError::EmptyOutputsSpec);
        }
        Ok(OutputsSpec::Names(set))
    }

    /// Whether the given output name is covered by this spec.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            OutputsSpec::All => true,
            OutputsSpec::Names(names) => names.contains(name),
        }
    }
}

impl fmt::Display for OutputsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputsSpec::All => f.write_str("*"),
            OutputsSpec::Names(names) => {
                let joined: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

/// A top-level realisation request: either an opaque store path (substitute
/// or verify it) or some outputs of a derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivedPath {
    Opaque(StorePath),
    Built {
        drv_path: StorePath,
        outputs: OutputsSpec,
    },
}

impl fmt::Display for DerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivedPath::Opaque(path) => write!(f, "{path}"),
            DerivedPath::Built { drv_path, outputs } => write!(f, "{drv_path}!{outputs}"),
        }
    }
}

/// How a request should treat already-present results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Reuse valid paths, substitute or build the rest.
    #[default]
    Normal,
    /// Rebuild/refetch paths that are present but possibly corrupt.
    Repair,
    /// Re-run the build even for valid paths, to verify determinism.
    Check,
}

/// Scheduling hint: which concurrency ceiling a goal's work counts against.
///
/// Builds are CPU/disk bound, substitutions network bound; keeping the
/// ceilings separate stops a flood of cheap substitution lookups from
/// starving build slots and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobCategory {
    Build,
    Substitution,
    /// Goals that only coordinate other goals; never slot-limited.
    Administration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_spec_rejects_empty_names() {
        let empty: Vec<String> = Vec::new();
        assert!(OutputsSpec::names(empty).is_err());
    }

    #[test]
    fn outputs_spec_names_dedups_and_matches() {
        let spec = OutputsSpec::names(["out", "dev", "out"]).unwrap();
        assert!(spec.contains("out"));
        assert!(spec.contains("dev"));
        assert!(!spec.contains("doc"));
        assert_eq!(spec.to_string(), "dev,out");
    }

    #[test]
    fn outputs_spec_all_matches_everything() {
        assert!(OutputsSpec::All.contains("anything"));
    }

    #[test]
    fn derived_path_display_is_stable() {
        let req = DerivedPath::Built {
            drv_path: StorePath::new("/store/abc-foo.drv"),
            outputs: OutputsSpec::names(["out"]).unwrap(),
        };
        assert_eq!(req.to_string(), "/store/abc-foo.drv!out");
    }
}
