// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Loads the dispatcher's policy knobs from a YAML file (with `.env`
//! overrides for the file path), the way the rest of this workspace loads
//! its settings: a `Lazy` static plus a `settings()` accessor, so call
//! sites just write `settings().freeze_ceiling` instead of threading a
//! config object through every constructor.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::{info, warn};

/// The dispatcher's freeze/defrost policy knobs, loadable from a file
/// instead of hard-coded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// If a task is frozen too many times, report it as a terminal failure
    /// (`true`) or silently forget it (`false`).
    pub failed_on_too_frozen: bool,
    /// If a task fails to dispatch (the `next_stage` callback errors),
    /// freeze it for a later retry (`true`) or forget it (`false`).
    pub freeze_on_failed_dispatch: bool,
    /// If a task needs an executor type that hasn't connected yet, freeze
    /// it until one does (`true`) or forget it (`false`).
    pub freeze_on_unknown_executor: bool,
    /// How many times a task may be frozen before it is declared a
    /// terminal failure.
    pub freeze_ceiling: u32,
    /// How long a frozen task sits before the age-based sweep defrosts it
    /// regardless of whether a matching executor type has connected.
    pub defrost_age_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            failed_on_too_frozen: true,
            freeze_on_failed_dispatch: true,
            freeze_on_unknown_executor: true,
            freeze_ceiling: dispatch_core::DEFAULT_FREEZE_CEILING,
            defrost_age_secs: dispatch_core::DEFAULT_DEFROST_AGE.as_secs(),
        }
    }
}

impl DispatcherSettings {
    pub fn defrost_age(&self) -> Duration {
        Duration::from_secs(self.defrost_age_secs)
    }

    pub fn to_policy(&self) -> dispatch_core::DispatcherPolicy {
        dispatch_core::DispatcherPolicy {
            failed_on_too_frozen: self.failed_on_too_frozen,
            freeze_on_failed_dispatch: self.freeze_on_failed_dispatch,
            freeze_on_unknown_executor: self.freeze_on_unknown_executor,
            freeze_ceiling: self.freeze_ceiling,
            defrost_age: self.defrost_age(),
        }
    }

    fn load() -> Self {
        let _ = dotenv::dotenv();
        let path = std::env::var("DISPATCH_CONFIG").unwrap_or_else(|_| "dispatch.yaml".to_string());
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_yaml::from_str(&raw) {
                Ok(settings) => {
                    info!(path = %path, "loaded dispatcher settings");
                    settings
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "failed to parse dispatcher settings, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path, "no dispatcher settings file found, using defaults");
                Self::default()
            }
        }
    }
}

static SETTINGS: Lazy<DispatcherSettings> = Lazy::new(DispatcherSettings::load);

/// The process-wide dispatcher settings, loaded once on first access.
pub fn settings() -> &'static DispatcherSettings {
    &SETTINGS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_dispatch_core_constants() {
        let s = DispatcherSettings::default();
        assert_eq!(s.freeze_ceiling, dispatch_core::DEFAULT_FREEZE_CEILING);
        assert_eq!(s.defrost_age(), dispatch_core::DEFAULT_DEFROST_AGE);
    }

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let parsed: DispatcherSettings = serde_yaml::from_str("freeze_ceiling: 5\n").unwrap();
        assert_eq!(parsed.freeze_ceiling, 5);
        assert!(parsed.failed_on_too_frozen);
    }
}
