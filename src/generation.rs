use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bundle::{MANIFEST_FILE, SIGNATURE_FILE};
use crate::error::{LifecycleError, LifecycleResult};
use crate::storage::{read_json_if_exists, write_json_atomic};

const RECORD_FILE: &str = "generation.json";
const TREE_DIR: &str = "tree";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Staged,
    Activating,
    Active,
    RollbackTarget,
    Quarantined,
    Retired,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::RollbackTarget => "rollback_target",
            Self::Quarantined => "quarantined",
            Self::Retired => "retired",
        }
    }
}

impl Display for GenerationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub version: String,
    pub sequence: u64,
    pub status: GenerationStatus,
    pub manifest_sha256: String,
    pub location: PathBuf,
    pub artifact_count: usize,
    pub total_bytes: u64,
    pub staged_at: String,
    pub updated_at: String,
    pub status_note: Option<String>,
}

/// On-disk home of every generation: `<root>/<version>/{generation.json,
/// manifest.json, manifest.sig, tree/}`. Records outlive their trees so a
/// retired generation can still be reported.
#[derive(Debug, Clone)]
pub struct GenerationStore {
    root: PathBuf,
}

impl GenerationStore {
    pub fn new(root: impl AsRef<Path>) -> LifecycleResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed creating generations dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation_dir(&self, version: &str) -> PathBuf {
        self.root.join(version)
    }

    pub fn tree_dir(&self, version: &str) -> PathBuf {
        self.generation_dir(version).join(TREE_DIR)
    }

    pub fn manifest_path(&self, version: &str) -> PathBuf {
        self.generation_dir(version).join(MANIFEST_FILE)
    }

    pub fn signature_path(&self, version: &str) -> PathBuf {
        self.generation_dir(version).join(SIGNATURE_FILE)
    }

    fn record_path(&self, version: &str) -> PathBuf {
        self.generation_dir(version).join(RECORD_FILE)
    }

    pub fn find(&self, version: &str) -> LifecycleResult<Option<Generation>> {
        let record = read_json_if_exists(&self.record_path(version), "generation record")?;
        Ok(record)
    }

    pub fn load(&self, version: &str) -> LifecycleResult<Generation> {
        self.find(version)?
            .ok_or_else(|| LifecycleError::GenerationNotFound {
                version: version.to_string(),
            })
    }

    pub fn save(&self, generation: &Generation) -> LifecycleResult<()> {
        write_json_atomic(
            &self.record_path(&generation.version),
            generation,
            "generation record",
        )?;
        Ok(())
    }

    pub fn set_status(
        &self,
        version: &str,
        status: GenerationStatus,
        note: Option<String>,
    ) -> LifecycleResult<Generation> {
        let mut generation = self.load(version)?;
        generation.status = status;
        generation.updated_at = Utc::now().to_rfc3339();
        if note.is_some() {
            generation.status_note = note;
        }
        self.save(&generation)?;
        Ok(generation)
    }

    /// All known generations ordered by staging sequence.
    pub fn list(&self) -> LifecycleResult<Vec<Generation>> {
        let mut generations = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed listing generations in {}", self.root.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed reading generations dir {}", self.root.display())
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(version) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            if let Some(generation) = self.find(&version)? {
                generations.push(generation);
            }
        }
        generations.sort_by_key(|generation| generation.sequence);
        Ok(generations)
    }

    pub fn next_sequence(&self) -> LifecycleResult<u64> {
        Ok(self
            .list()?
            .iter()
            .map(|generation| generation.sequence)
            .max()
            .unwrap_or(0)
            + 1)
    }
}
