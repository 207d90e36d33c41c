use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::RetentionMode;
use crate::error::{LifecycleError, LifecycleResult};
use crate::generation::{Generation, GenerationStore};
use crate::verifier::VerifiedBundle;

/// Where generation trees physically live. The lifecycle core only asks for
/// a location to be produced or released; how that happens is up to the
/// implementation.
pub trait DeploymentSubstrate: Send + Sync {
    /// Produces a fresh, sealed tree for `bundle` and returns its location.
    /// Must never write into a tree that is currently being served.
    fn materialize(&self, bundle: &VerifiedBundle) -> LifecycleResult<PathBuf>;

    /// Releases a retired generation's tree. Returns whether anything was
    /// physically removed.
    fn retire(&self, generation: &Generation) -> LifecycleResult<bool>;
}

/// Copies artifacts into `generations/<version>/tree`, re-hashing each byte
/// stream while copying, then marks every file read-only.
pub struct DirectorySubstrate {
    store: GenerationStore,
    mode: RetentionMode,
}

impl DirectorySubstrate {
    pub fn new(store: GenerationStore, mode: RetentionMode) -> Self {
        Self { store, mode }
    }
}

impl DeploymentSubstrate for DirectorySubstrate {
    fn materialize(&self, bundle: &VerifiedBundle) -> LifecycleResult<PathBuf> {
        let version = bundle.version();
        let tree = self.store.tree_dir(version);
        let scratch = self.store.generation_dir(version).join("tree.staging");
        remove_tree(&scratch)?;
        fs::create_dir_all(&scratch)
            .with_context(|| format!("failed creating staging tree {}", scratch.display()))?;

        for (path, expected) in &bundle.manifest().artifacts {
            let source = bundle.bundle().artifact_path(path);
            let target = scratch.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed creating {}", parent.display()))?;
            }
            let (sha256, size) = copy_and_hash(&source, &target).with_context(|| {
                format!(
                    "failed copying artifact {} -> {}",
                    source.display(),
                    target.display()
                )
            })?;
            // The bundle is outside our control between verify and copy.
            if !sha256.eq_ignore_ascii_case(&expected.sha256) || size != expected.size {
                remove_tree(&scratch)?;
                return Err(LifecycleError::UnverifiedBundle {
                    reason: format!("artifact '{}' changed after verification", path),
                });
            }
            seal_file(&target)?;
        }

        remove_tree(&tree)?;
        fs::rename(&scratch, &tree).with_context(|| {
            format!(
                "failed moving staging tree {} -> {}",
                scratch.display(),
                tree.display()
            )
        })?;
        debug!(version, tree = %tree.display(), "generation tree materialized");
        Ok(tree)
    }

    fn retire(&self, generation: &Generation) -> LifecycleResult<bool> {
        match self.mode {
            RetentionMode::Keep => Ok(false),
            RetentionMode::Remove => {
                let tree = self.store.tree_dir(&generation.version);
                let existed = tree.exists();
                remove_tree(&tree)?;
                if existed {
                    info!(version = %generation.version, "retired generation tree removed");
                }
                Ok(existed)
            }
        }
    }
}

fn copy_and_hash(source: &Path, target: &Path) -> io::Result<(String, u64)> {
    let mut input = fs::File::open(source)?;
    let mut output = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        size += n as u64;
    }
    output.sync_all()?;
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn seal_file(path: &Path) -> LifecycleResult<()> {
    let mut permissions = fs::metadata(path)
        .with_context(|| format!("failed reading metadata {}", path.display()))?
        .permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("failed sealing {}", path.display()))?;
    Ok(())
}

/// Removes a tree that may contain read-only files.
pub(crate) fn remove_tree(path: &Path) -> LifecycleResult<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed inspecting {}", path.display()))
                .into())
        }
    }
    unseal(path).with_context(|| format!("failed unsealing {}", path.display()))?;
    fs::remove_dir_all(path).with_context(|| format!("failed removing {}", path.display()))?;
    Ok(())
}

#[allow(clippy::permissions_set_readonly_false)]
fn unseal(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            unseal(&entry?.path())?;
        }
        return Ok(());
    }
    if metadata.is_file() && metadata.permissions().readonly() {
        let mut permissions = metadata.permissions();
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{to_lower_hex, Ed25519Backend};
    use crate::bundle::{manifest_digest, Bundle, Manifest, ManifestEntry};
    use crate::verifier::Verifier;
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn verified_bundle(root: &Path, contents: &str) -> VerifiedBundle {
        let signing = SigningKey::from_bytes(&[9; 32]);
        fs::create_dir_all(root.join("payload/bin")).expect("mkdir");
        fs::write(root.join("payload/bin/app"), contents).expect("write");
        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            "bin/app".to_string(),
            ManifestEntry {
                sha256: manifest_digest(contents.as_bytes()),
                size: contents.len() as u64,
            },
        );
        let manifest = Manifest {
            version: "2.0.0".to_string(),
            created_at: None,
            key_id: None,
            artifacts,
        };
        let raw = serde_json::to_vec(&manifest).expect("encode");
        fs::write(root.join("manifest.json"), &raw).expect("manifest");
        fs::write(root.join("manifest.sig"), signing.sign(&raw).to_bytes()).expect("sig");
        let backend = Ed25519Backend::from_key_material(&[(
            "k".to_string(),
            to_lower_hex(signing.verifying_key().as_bytes()),
        )])
        .expect("backend");
        Verifier::new(Arc::new(backend))
            .verify(&Bundle::open(root).expect("bundle"))
            .expect("verify")
    }

    #[test]
    fn materialize_copies_seals_and_replaces_previous_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = GenerationStore::new(dir.path().join("generations")).expect("store");
        let substrate = DirectorySubstrate::new(store.clone(), RetentionMode::Remove);

        let first = verified_bundle(&dir.path().join("b1"), "one");
        let tree = substrate.materialize(&first).expect("materialize");
        assert_eq!(fs::read_to_string(tree.join("bin/app")).expect("read"), "one");
        assert!(fs::metadata(tree.join("bin/app"))
            .expect("meta")
            .permissions()
            .readonly());

        let second = verified_bundle(&dir.path().join("b2"), "two");
        let tree = substrate.materialize(&second).expect("restage");
        assert_eq!(fs::read_to_string(tree.join("bin/app")).expect("read"), "two");
        assert!(!store.generation_dir("2.0.0").join("tree.staging").exists());
    }

    #[test]
    fn bundle_swapped_after_verification_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = GenerationStore::new(dir.path().join("generations")).expect("store");
        let substrate = DirectorySubstrate::new(store.clone(), RetentionMode::Remove);

        let bundle_dir = dir.path().join("b1");
        let verified = verified_bundle(&bundle_dir, "one");
        fs::write(bundle_dir.join("payload/bin/app"), "evil").expect("swap");

        let err = substrate.materialize(&verified).expect_err("swapped");
        assert!(matches!(err, LifecycleError::UnverifiedBundle { .. }));
        assert!(!store.tree_dir("2.0.0").exists());
    }
}
