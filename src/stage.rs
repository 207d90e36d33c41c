use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};

use crate::bundle::{compare_versions, manifest_digest};
use crate::error::{LifecycleError, LifecycleResult};
use crate::generation::{Generation, GenerationStatus, GenerationStore};
use crate::ledger::{Ledger, LedgerEvent, LedgerEventKind};
use crate::lock::OperationLock;
use crate::pointer::PointerStore;
use crate::storage::write_bytes_atomic;
use crate::substrate::DeploymentSubstrate;
use crate::verifier::VerifiedBundle;

/// Turns a verified bundle into an isolated, inactive generation.
pub struct StageManager {
    store: GenerationStore,
    pointer: PointerStore,
    substrate: Arc<dyn DeploymentSubstrate>,
    ledger: Arc<Ledger>,
    require_monotonic_version: bool,
}

impl StageManager {
    pub fn new(
        store: GenerationStore,
        pointer: PointerStore,
        substrate: Arc<dyn DeploymentSubstrate>,
        ledger: Arc<Ledger>,
        require_monotonic_version: bool,
    ) -> Self {
        Self {
            store,
            pointer,
            substrate,
            ledger,
            require_monotonic_version,
        }
    }

    /// Stages `bundle` under its version. Re-staging a version that is still
    /// Staged replaces the earlier copy; other generations are untouched.
    /// The caller holds the activation lock.
    #[instrument(skip(self, bundle, _lock), fields(version = %bundle.version()))]
    pub fn stage(
        &self,
        bundle: &VerifiedBundle,
        _lock: &OperationLock,
    ) -> LifecycleResult<Generation> {
        let version = bundle.version().to_string();

        let on_disk = bundle.bundle().read_manifest_bytes()?;
        if manifest_digest(&on_disk) != bundle.manifest_sha256() {
            return Err(LifecycleError::UnverifiedBundle {
                reason: "manifest changed after verification".to_string(),
            });
        }

        let existing = self.store.find(&version)?;
        if let Some(existing) = existing.as_ref() {
            match existing.status {
                GenerationStatus::Staged | GenerationStatus::Retired => {}
                status => {
                    return Err(LifecycleError::InvalidTransition {
                        version: version.clone(),
                        status: status.to_string(),
                        reason: "only staged or retired generations can be re-staged".to_string(),
                    })
                }
            }
        }

        let pointer = self.pointer.load()?;
        if self.require_monotonic_version {
            if let Some(active) = pointer.active.as_deref() {
                if compare_versions(&version, active)? != Ordering::Greater {
                    return Err(LifecycleError::VersionRegression {
                        candidate: version,
                        active: active.to_string(),
                    });
                }
            }
        }

        let location = self.substrate.materialize(bundle)?;
        write_bytes_atomic(
            &self.store.manifest_path(&version),
            bundle.manifest_bytes(),
            "stored manifest",
        )?;
        write_bytes_atomic(
            &self.store.signature_path(&version),
            bundle.signature(),
            "stored signature",
        )?;

        let now = Utc::now().to_rfc3339();
        let sequence = match existing.as_ref() {
            Some(existing) => existing.sequence,
            None => self.store.next_sequence()?,
        };
        let generation = Generation {
            version: version.clone(),
            sequence,
            status: GenerationStatus::Staged,
            manifest_sha256: bundle.manifest_sha256().to_string(),
            location,
            artifact_count: bundle.manifest().artifacts.len(),
            total_bytes: bundle.manifest().total_bytes(),
            staged_at: now.clone(),
            updated_at: now,
            status_note: None,
        };
        self.store.save(&generation)?;

        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::Staged,
            json!({
                "version": version,
                "manifest_sha256": generation.manifest_sha256,
                "artifact_count": generation.artifact_count,
                "total_bytes": generation.total_bytes,
                "restaged": existing.is_some(),
            }),
        ));
        info!(
            version = %generation.version,
            artifacts = generation.artifact_count,
            "generation staged"
        );
        Ok(generation)
    }
}
