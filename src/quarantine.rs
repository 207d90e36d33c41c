use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::storage::{read_json_if_exists, write_json_atomic};
use crate::verifier::Violation;

/// Supervisory state of the integrity monitor. While `active`, violations
/// are logged but never trigger another rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineState {
    pub active: bool,
    pub entered_at: Option<String>,
    pub generation: Option<String>,
    pub reason: Option<String>,
    pub rolled_back_to: Option<String>,
    #[serde(default)]
    pub seen_violations: Vec<String>,
    pub cleared_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QuarantineStore {
    path: PathBuf,
}

impl QuarantineStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("quarantine.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<QuarantineState> {
        Ok(read_json_if_exists(&self.path, "quarantine state")?.unwrap_or_default())
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.load()?.active)
    }

    pub fn enter(
        &self,
        generation: &str,
        violation: &Violation,
        rolled_back_to: Option<&str>,
    ) -> Result<QuarantineState> {
        let state = QuarantineState {
            active: true,
            entered_at: Some(Utc::now().to_rfc3339()),
            generation: Some(generation.to_string()),
            reason: Some(format!(
                "{} on {}: {}",
                violation.reason_kind(),
                violation.path,
                violation.detail
            )),
            rolled_back_to: rolled_back_to.map(ToString::to_string),
            seen_violations: vec![violation.fingerprint()],
            cleared_at: None,
        };
        write_json_atomic(&self.path, &state, "quarantine state")?;
        Ok(state)
    }

    /// Remembers a violation observed while quarantined. Returns `true` the
    /// first time a given violation is seen.
    pub fn note_violation(&self, violation: &Violation) -> Result<bool> {
        let mut state = self.load()?;
        let fingerprint = violation.fingerprint();
        if state.seen_violations.contains(&fingerprint) {
            return Ok(false);
        }
        state.seen_violations.push(fingerprint);
        write_json_atomic(&self.path, &state, "quarantine state")?;
        Ok(true)
    }

    /// Lifts quarantine and returns the state that was cleared, or `None`
    /// when the monitor was not quarantined.
    pub fn clear(&self) -> Result<Option<QuarantineState>> {
        let previous = self.load()?;
        if !previous.active {
            return Ok(None);
        }
        let cleared = QuarantineState {
            active: false,
            cleared_at: Some(Utc::now().to_rfc3339()),
            seen_violations: Vec::new(),
            ..previous.clone()
        };
        write_json_atomic(&self.path, &cleared, "quarantine state")?;
        Ok(Some(previous))
    }
}
