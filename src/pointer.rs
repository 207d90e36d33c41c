use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::storage::{atomic_tmp_path, read_json_if_exists, write_json_atomic};

/// The single record every reader dereferences to find the served
/// generation. Replaced whole by rename, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerRecord {
    pub active: Option<String>,
    pub rollback_target: Option<String>,
    pub epoch: u64,
    pub updated_at: Option<String>,
    /// Clean monitor cycles left before the rollback target is retired.
    #[serde(default)]
    pub rollback_window_remaining: Option<u32>,
}

impl PointerRecord {
    pub fn next(&self) -> Self {
        Self {
            active: self.active.clone(),
            rollback_target: self.rollback_target.clone(),
            epoch: self.epoch + 1,
            updated_at: Some(Utc::now().to_rfc3339()),
            rollback_window_remaining: self.rollback_window_remaining,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PointerStore {
    record_path: PathBuf,
    link_path: PathBuf,
}

impl PointerStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            record_path: state_dir.join("current.json"),
            link_path: state_dir.join("current"),
        }
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    pub fn link_path(&self) -> &Path {
        &self.link_path
    }

    pub fn load(&self) -> Result<PointerRecord> {
        Ok(read_json_if_exists(&self.record_path, "pointer record")?.unwrap_or_default())
    }

    /// The commit point of every activation and rollback.
    pub fn commit(&self, record: &PointerRecord) -> Result<()> {
        write_json_atomic(&self.record_path, record, "pointer record")
    }

    /// Repoints the service link at `tree` with a rename over the old link,
    /// so the service sees either the old tree or the new one.
    pub fn swap_link(&self, tree: &Path) -> Result<()> {
        let tmp = atomic_tmp_path(&self.link_path);
        match fs::symlink_metadata(&tmp) {
            Ok(_) => fs::remove_file(&tmp)
                .with_context(|| format!("failed removing leftover link {}", tmp.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed inspecting link {}", tmp.display()))
            }
        }
        create_link(tree, &tmp)?;
        fs::rename(&tmp, &self.link_path).with_context(|| {
            format!(
                "failed replacing service link {} -> {}",
                tmp.display(),
                self.link_path.display()
            )
        })?;
        Ok(())
    }

    pub fn link_target(&self) -> Option<PathBuf> {
        read_link(&self.link_path)
    }
}

#[cfg(unix)]
fn create_link(tree: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(tree, link).with_context(|| {
        format!(
            "failed creating service link {} -> {}",
            link.display(),
            tree.display()
        )
    })
}

#[cfg(unix)]
fn read_link(link: &Path) -> Option<PathBuf> {
    fs::read_link(link).ok()
}

// Without symlinks the link is a one-line file naming the tree.
#[cfg(not(unix))]
fn create_link(tree: &Path, link: &Path) -> Result<()> {
    fs::write(link, tree.display().to_string())
        .with_context(|| format!("failed writing service link {}", link.display()))
}

#[cfg(not(unix))]
fn read_link(link: &Path) -> Option<PathBuf> {
    fs::read_to_string(link)
        .ok()
        .map(|raw| PathBuf::from(raw.trim()))
}
