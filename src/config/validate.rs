// src/config/validate.rs

use std::collections::HashSet;

use crate::config::model::RawConfigFile;
use crate::errors::{BuilddagError, Result};

/// Run semantic validation against a loaded configuration.
///
/// This checks:
/// - `max_substitution_jobs >= 1` (substitutions can never be distributed,
///   so a zero ceiling would wedge every substitution goal)
/// - speed factors are > 0
/// - machine names are non-empty and unique
/// - every machine declares at least one system
pub fn validate_config(raw: &RawConfigFile) -> Result<()> {
    validate_scheduler(raw)?;
    validate_local(raw)?;
    validate_machines(raw)?;
    Ok(())
}

fn validate_scheduler(raw: &RawConfigFile) -> Result<()> {
    if raw.scheduler.max_substitution_jobs == 0 {
        return Err(BuilddagError::ConfigError(
            "[scheduler].max_substitution_jobs must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_local(raw: &RawConfigFile) -> Result<()> {
    if raw.local.system.trim().is_empty() {
        return Err(BuilddagError::ConfigError(
            "[local].system must not be empty".to_string(),
        ));
    }
    if raw.local.speed_factor <= 0.0 {
        return Err(BuilddagError::ConfigError(format!(
            "[local].speed_factor must be > 0 (got {})",
            raw.local.speed_factor
        )));
    }
    Ok(())
}

fn validate_machines(raw: &RawConfigFile) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();

    for mc in &raw.machine {
        if mc.name.trim().is_empty() {
            return Err(BuilddagError::ConfigError(
                "[[machine]].name must not be empty".to_string(),
            ));
        }
        if mc.name == "local" {
            return Err(BuilddagError::ConfigError(
                "the machine name 'local' is reserved for the local machine".to_string(),
            ));
        }
        if !seen.insert(mc.name.as_str()) {
            return Err(BuilddagError::ConfigError(format!(
                "duplicate machine name '{}'",
                mc.name
            )));
        }
        if mc.systems.is_empty() {
            return Err(BuilddagError::ConfigError(format!(
                "machine '{}' must declare at least one system",
                mc.name
            )));
        }
        if mc.speed_factor <= 0.0 {
            return Err(BuilddagError::ConfigError(format!(
                "machine '{}' has speed_factor {} (must be > 0)",
                mc.name, mc.speed_factor
            )));
        }
    }

    Ok(())
}
