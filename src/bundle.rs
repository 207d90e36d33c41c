use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LifecycleError, LifecycleResult};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SIGNATURE_FILE: &str = "manifest.sig";
pub const PAYLOAD_DIR: &str = "payload";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: String,
    pub size: u64,
}

/// Authenticated description of one release: every artifact path with its
/// expected digest and size. Paths are kept ordered so hashing order and
/// "first mismatch" are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub artifacts: BTreeMap<String, ManifestEntry>,
}

/// A bundle directory as handed to us by the release pipeline.
#[derive(Debug, Clone)]
pub struct Bundle {
    root: PathBuf,
}

impl Bundle {
    pub fn open(root: impl AsRef<Path>) -> LifecycleResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(LifecycleError::ManifestCorrupt {
                reason: format!("bundle directory does not exist: {}", root.display()),
            });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn signature_path(&self) -> PathBuf {
        self.root.join(SIGNATURE_FILE)
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.root.join(PAYLOAD_DIR)
    }

    pub fn artifact_path(&self, relative: &str) -> PathBuf {
        self.payload_dir().join(relative)
    }

    pub fn read_manifest_bytes(&self) -> LifecycleResult<Vec<u8>> {
        let path = self.manifest_path();
        fs::read(&path).map_err(|err| LifecycleError::ManifestCorrupt {
            reason: format!("failed reading manifest {}: {}", path.display(), err),
        })
    }
}

impl Manifest {
    pub fn parse(raw: &[u8]) -> LifecycleResult<Self> {
        let manifest: Manifest =
            serde_json::from_slice(raw).map_err(|err| LifecycleError::ManifestCorrupt {
                reason: format!("failed decoding manifest: {}", err),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> LifecycleResult<()> {
        validate_version(&self.version)?;
        if self.artifacts.is_empty() {
            return Err(LifecycleError::ManifestCorrupt {
                reason: "manifest lists no artifacts".to_string(),
            });
        }
        for (path, entry) in &self.artifacts {
            validate_artifact_path(path)?;
            if entry.sha256.len() != 64 || !entry.sha256.chars().all(|ch| ch.is_ascii_hexdigit())
            {
                return Err(LifecycleError::ManifestCorrupt {
                    reason: format!(
                        "artifact '{}' sha256 must be a 64-character hex string",
                        path
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.artifacts.values().map(|entry| entry.size).sum()
    }
}

pub fn manifest_digest(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    format!("{:x}", hasher.finalize())
}

fn validate_version(version: &str) -> LifecycleResult<()> {
    parse_version_components(version).map(|_| ())
}

fn validate_artifact_path(raw: &str) -> LifecycleResult<()> {
    let corrupt = |reason: &str| LifecycleError::ManifestCorrupt {
        reason: format!("artifact path '{}' {}", raw, reason),
    };
    if raw.trim().is_empty() || raw != raw.trim() {
        return Err(corrupt("is empty or padded"));
    }
    if raw.contains('\\') {
        return Err(corrupt("must use '/' separators"));
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(corrupt("must be relative"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(corrupt("must not contain '.', '..' or root components")),
        }
    }
    if raw.split('/').any(|segment| segment.is_empty() || segment == ".") {
        return Err(corrupt("must be normalized"));
    }
    Ok(())
}

/// Dotted numeric version ("1.10.2", optional leading `v`). The version is also
/// the generation directory name.
pub fn parse_version_components(raw: &str) -> LifecycleResult<Vec<u64>> {
    let trimmed = raw.trim();
    let corrupt = |reason: String| LifecycleError::ManifestCorrupt { reason };
    if trimmed.is_empty() || trimmed != raw {
        return Err(corrupt(format!("version '{}' is empty or padded", raw)));
    }
    let normalized = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let mut components = Vec::new();
    for part in normalized.split('.') {
        if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(corrupt(format!(
                "version '{}' must be dot-separated numeric components",
                raw
            )));
        }
        let value = part.parse::<u64>().map_err(|_| {
            corrupt(format!("version component '{}' in '{}' is too large", part, raw))
        })?;
        components.push(value);
    }
    Ok(components)
}

pub fn compare_versions(lhs: &str, rhs: &str) -> LifecycleResult<Ordering> {
    let lhs = parse_version_components(lhs)?;
    let rhs = parse_version_components(rhs)?;
    let len = lhs.len().max(rhs.len());
    for idx in 0..len {
        let left = lhs.get(idx).copied().unwrap_or(0);
        let right = rhs.get(idx).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}
