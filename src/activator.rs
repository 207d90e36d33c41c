use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::generation::{Generation, GenerationStatus, GenerationStore};
use crate::ledger::{Ledger, LedgerEvent, LedgerEventKind};
use crate::lock::{LockPolicy, OperationLock};
use crate::notify::ReloadNotifier;
use crate::observability;
use crate::pointer::{PointerRecord, PointerStore};
use crate::substrate::DeploymentSubstrate;
use crate::verifier::{VerificationResult, Verifier, Violation};

#[derive(Debug, Clone, Serialize)]
pub struct TransitionReport {
    pub kind: String,
    pub active: Option<String>,
    pub previous_active: Option<String>,
    pub rollback_target: Option<String>,
    pub retired: Vec<String>,
    pub quarantined: Option<String>,
    pub epoch: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub rollback_target: Option<String>,
    pub window_remaining: Option<u32>,
    pub retired: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileFix {
    pub version: String,
    pub from: GenerationStatus,
    pub to: GenerationStatus,
}

/// Owner of the generation pointer. Every promotion or demotion of a
/// generation goes through here under the activation lock.
pub struct Activator {
    store: GenerationStore,
    pointer: PointerStore,
    verifier: Arc<Verifier>,
    substrate: Arc<dyn DeploymentSubstrate>,
    ledger: Arc<Ledger>,
    notifier: Arc<dyn ReloadNotifier>,
    lock_path: PathBuf,
    lock_policy: LockPolicy,
    rollback_clean_cycles: u32,
}

impl Activator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: GenerationStore,
        pointer: PointerStore,
        verifier: Arc<Verifier>,
        substrate: Arc<dyn DeploymentSubstrate>,
        ledger: Arc<Ledger>,
        notifier: Arc<dyn ReloadNotifier>,
        lock_path: PathBuf,
        lock_policy: LockPolicy,
        rollback_clean_cycles: u32,
    ) -> Self {
        Self {
            store,
            pointer,
            verifier,
            substrate,
            ledger,
            notifier,
            lock_path,
            lock_policy,
            rollback_clean_cycles,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn lock_policy(&self) -> LockPolicy {
        self.lock_policy
    }

    /// Takes the activation lock without waiting.
    pub fn try_lock(&self, operation: &str) -> LifecycleResult<OperationLock> {
        OperationLock::try_acquire(&self.lock_path, operation, self.lock_policy)
    }

    pub fn pointer(&self) -> LifecycleResult<PointerRecord> {
        Ok(self.pointer.load()?)
    }

    pub fn activate(&self, version: &str) -> LifecycleResult<TransitionReport> {
        let lock = self
            .try_lock("activate")
            .inspect_err(|err| self.record_activation_failure(version, err))?;
        self.activate_locked(version, &lock)
    }

    #[instrument(skip(self, _lock))]
    pub fn activate_locked(
        &self,
        version: &str,
        _lock: &OperationLock,
    ) -> LifecycleResult<TransitionReport> {
        let result = self.promote_staged(version, LedgerEventKind::Activated);
        record_outcome("activate", &result);
        result
    }

    pub fn rollback(&self, reason: &str) -> LifecycleResult<TransitionReport> {
        let lock = self
            .try_lock("rollback")
            .inspect_err(|err| self.record_rollback_failure(json!({ "reason": reason }), err))?;
        self.rollback_locked(reason, &lock)
    }

    /// Demotes the active generation to Quarantined and promotes the
    /// rollback target.
    #[instrument(skip(self, _lock))]
    pub fn rollback_locked(
        &self,
        reason: &str,
        _lock: &OperationLock,
    ) -> LifecycleResult<TransitionReport> {
        let result = self.rollback_inner(reason);
        if let Err(err) = &result {
            self.record_rollback_failure(json!({ "reason": reason }), err);
        }
        record_outcome("rollback", &result);
        result
    }

    /// Operator recovery to a retained generation: the rollback target is
    /// swapped back in, a staged generation is activated.
    pub fn recover(&self, version: &str) -> LifecycleResult<TransitionReport> {
        let lock = self
            .try_lock("recover")
            .inspect_err(|err| self.record_rollback_failure(json!({ "recover_to": version }), err))?;
        let result = self.recover_locked(version, &lock);
        if let Err(err @ LifecycleError::RollbackUnavailable { .. }) = &result {
            self.record_rollback_failure(json!({ "recover_to": version }), err);
        }
        record_outcome("recover", &result);
        result
    }

    fn recover_locked(
        &self,
        version: &str,
        _lock: &OperationLock,
    ) -> LifecycleResult<TransitionReport> {
        let pointer = self.pointer.load()?;
        let unavailable = |reason: String| LifecycleError::RollbackUnavailable { reason };
        let Some(target) = self.store.find(version)? else {
            return Err(unavailable(format!("generation {} is not known", version)));
        };

        match target.status {
            GenerationStatus::Active if pointer.active.as_deref() == Some(version) => {
                Ok(TransitionReport {
                    kind: "recovered".to_string(),
                    active: pointer.active.clone(),
                    previous_active: pointer.active.clone(),
                    rollback_target: pointer.rollback_target.clone(),
                    retired: Vec::new(),
                    quarantined: None,
                    epoch: pointer.epoch,
                    reason: Some("already active".to_string()),
                })
            }
            GenerationStatus::RollbackTarget
                if pointer.rollback_target.as_deref() == Some(version) =>
            {
                self.swap_in_rollback_target(&pointer, &target)
            }
            GenerationStatus::Staged => self.promote_staged(version, LedgerEventKind::Recovered),
            status => Err(unavailable(format!(
                "generation {} is {} and cannot be recovered",
                version, status
            ))),
        }
    }

    /// Called by the monitor after a clean cycle. Counts the rollback window
    /// down and retires the rollback target when it reaches zero.
    pub fn record_clean_cycle_locked(
        &self,
        _lock: &OperationLock,
    ) -> LifecycleResult<RetentionReport> {
        let pointer = self.pointer.load()?;
        let Some(target) = pointer.rollback_target.clone() else {
            return Ok(RetentionReport {
                rollback_target: None,
                window_remaining: None,
                retired: None,
            });
        };

        let remaining = pointer
            .rollback_window_remaining
            .unwrap_or(self.rollback_clean_cycles)
            .saturating_sub(1);
        if remaining > 0 {
            let mut next = pointer.next();
            next.rollback_window_remaining = Some(remaining);
            self.pointer.commit(&next)?;
            return Ok(RetentionReport {
                rollback_target: Some(target),
                window_remaining: Some(remaining),
                retired: None,
            });
        }

        let mut next = pointer.next();
        next.rollback_target = None;
        next.rollback_window_remaining = None;
        self.pointer.commit(&next)?;
        self.retire_generation(&target, "rollback window elapsed without integrity failures");
        Ok(RetentionReport {
            rollback_target: None,
            window_remaining: None,
            retired: Some(target),
        })
    }

    /// Restarts the rollback window after a cycle that was not clean.
    pub fn reset_rollback_window_locked(&self, _lock: &OperationLock) -> LifecycleResult<()> {
        let pointer = self.pointer.load()?;
        if pointer.rollback_target.is_none()
            || pointer.rollback_window_remaining == Some(self.rollback_clean_cycles)
        {
            return Ok(());
        }
        let mut next = pointer.next();
        next.rollback_window_remaining = Some(self.rollback_clean_cycles);
        self.pointer.commit(&next)?;
        Ok(())
    }

    /// Brings generation records in line with the pointer record after a
    /// crash. Records are corrected; no ledger history is written.
    pub fn reconcile(&self) -> LifecycleResult<Vec<ReconcileFix>> {
        let lock = match self.try_lock("reconcile") {
            Ok(lock) => lock,
            Err(LifecycleError::ActivationConflict { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let pointer = self.pointer.load()?;
        let mut fixes = Vec::new();
        for generation in self.store.list()? {
            let version = generation.version.as_str();
            let expected = if pointer.active.as_deref() == Some(version) {
                GenerationStatus::Active
            } else if pointer.rollback_target.as_deref() == Some(version) {
                GenerationStatus::RollbackTarget
            } else {
                match generation.status {
                    GenerationStatus::Activating => GenerationStatus::Staged,
                    GenerationStatus::Active | GenerationStatus::RollbackTarget => {
                        GenerationStatus::Retired
                    }
                    status => status,
                }
            };
            if expected == generation.status {
                continue;
            }
            warn!(
                version,
                from = %generation.status,
                to = %expected,
                "reconciling generation record with pointer"
            );
            self.store.set_status(
                version,
                expected,
                Some("reconciled with pointer record".to_string()),
            )?;
            if expected == GenerationStatus::Retired {
                self.substrate.retire(&generation)?;
            }
            fixes.push(ReconcileFix {
                version: version.to_string(),
                from: generation.status,
                to: expected,
            });
        }
        if let Some(active) = pointer.active.as_deref() {
            let tree = self.store.tree_dir(active);
            if self.pointer.link_target().as_deref() != Some(tree.as_path()) {
                self.pointer.swap_link(&tree)?;
            }
        }
        drop(lock);
        Ok(fixes)
    }

    fn promote_staged(
        &self,
        version: &str,
        kind: LedgerEventKind,
    ) -> LifecycleResult<TransitionReport> {
        let pointer = self.pointer.load()?;
        let target = self.store.load(version)?;
        if target.status != GenerationStatus::Staged {
            return Err(LifecycleError::InvalidTransition {
                version: version.to_string(),
                status: target.status.to_string(),
                reason: "only staged generations can be activated".to_string(),
            });
        }

        if let Err(err) = self.verify_in_place(&target) {
            self.record_activation_failure(version, &err);
            return Err(err);
        }

        self.store
            .set_status(version, GenerationStatus::Activating, None)?;

        let mut next = pointer.next();
        next.active = Some(version.to_string());
        next.rollback_target = pointer.active.clone();
        next.rollback_window_remaining = pointer
            .active
            .as_ref()
            .map(|_| self.rollback_clean_cycles);

        if let Err(err) = self.commit_and_link(&pointer, &next, &target.location) {
            self.settle_status(version, GenerationStatus::Staged);
            self.record_activation_failure(version, &err);
            return Err(err);
        }

        let mut retired = Vec::new();
        if let Some(previous) = pointer.active.as_deref() {
            self.settle_status(previous, GenerationStatus::RollbackTarget);
        }
        if let Some(superseded) = pointer.rollback_target.as_deref() {
            self.retire_generation(superseded, "superseded by a newer rollback target");
            retired.push(superseded.to_string());
        }
        self.settle_status(version, GenerationStatus::Active);

        self.ledger.append_safe(LedgerEvent::new(
            kind,
            json!({
                "version": version,
                "previous_active": pointer.active,
                "rollback_target": next.rollback_target,
                "manifest_sha256": target.manifest_sha256,
                "epoch": next.epoch,
            }),
        ));
        info!(
            version,
            previous = ?pointer.active,
            epoch = next.epoch,
            "generation activated"
        );
        self.notifier.notify();

        Ok(TransitionReport {
            kind: kind.as_str().to_string(),
            active: next.active,
            previous_active: pointer.active,
            rollback_target: next.rollback_target,
            retired,
            quarantined: None,
            epoch: next.epoch,
            reason: None,
        })
    }

    fn rollback_inner(&self, reason: &str) -> LifecycleResult<TransitionReport> {
        let pointer = self.pointer.load()?;
        let Some(target_version) = pointer.rollback_target.clone() else {
            return Err(LifecycleError::RollbackUnavailable {
                reason: "no rollback target is retained".to_string(),
            });
        };
        let target = self.store.load(&target_version)?;
        self.verify_rollback_target(&target)?;

        let failing = pointer.active.clone();
        if let Some(failing) = failing.as_deref() {
            self.store.set_status(
                failing,
                GenerationStatus::Quarantined,
                Some(reason.to_string()),
            )?;
        }

        let mut next = pointer.next();
        next.active = Some(target_version.clone());
        next.rollback_target = None;
        next.rollback_window_remaining = None;

        if let Err(err) = self.commit_and_link(&pointer, &next, &target.location) {
            if let Some(failing) = failing.as_deref() {
                self.settle_status(failing, GenerationStatus::Active);
            }
            return Err(err);
        }
        self.settle_status(&target_version, GenerationStatus::Active);

        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::RolledBack,
            json!({
                "from": failing,
                "to": target_version,
                "reason": reason,
                "epoch": next.epoch,
            }),
        ));
        warn!(from = ?failing, to = %target_version, reason, "rolled back");
        self.notifier.notify();

        Ok(TransitionReport {
            kind: LedgerEventKind::RolledBack.as_str().to_string(),
            active: next.active,
            previous_active: failing.clone(),
            rollback_target: None,
            retired: Vec::new(),
            quarantined: failing,
            epoch: next.epoch,
            reason: Some(reason.to_string()),
        })
    }

    fn swap_in_rollback_target(
        &self,
        pointer: &PointerRecord,
        target: &Generation,
    ) -> LifecycleResult<TransitionReport> {
        self.verify_rollback_target(target)?;

        let mut next = pointer.next();
        next.active = Some(target.version.clone());
        next.rollback_target = pointer.active.clone();
        next.rollback_window_remaining = pointer
            .active
            .as_ref()
            .map(|_| self.rollback_clean_cycles);
        if let Err(err) = self.commit_and_link(pointer, &next, &target.location) {
            self.record_activation_failure(&target.version, &err);
            return Err(err);
        }

        if let Some(previous) = pointer.active.as_deref() {
            self.settle_status(previous, GenerationStatus::RollbackTarget);
        }
        self.settle_status(&target.version, GenerationStatus::Active);

        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::Recovered,
            json!({
                "version": target.version,
                "previous_active": pointer.active,
                "rollback_target": next.rollback_target,
                "epoch": next.epoch,
            }),
        ));
        info!(version = %target.version, "recovered to rollback target");
        self.notifier.notify();

        Ok(TransitionReport {
            kind: LedgerEventKind::Recovered.as_str().to_string(),
            active: next.active,
            previous_active: pointer.active.clone(),
            rollback_target: next.rollback_target,
            retired: Vec::new(),
            quarantined: None,
            epoch: next.epoch,
            reason: None,
        })
    }

    /// Commits the pointer record, then repoints the service link. A link
    /// failure restores the previous record so the pair never disagrees.
    fn commit_and_link(
        &self,
        previous: &PointerRecord,
        next: &PointerRecord,
        tree: &Path,
    ) -> LifecycleResult<()> {
        if let Err(err) = self.pointer.commit(next) {
            return Err(LifecycleError::ActivationFailed {
                reason: format!("{:#}", err),
            });
        }
        if let Err(err) = self.pointer.swap_link(tree) {
            if let Err(restore_err) = self.pointer.commit(previous) {
                warn!(error = %restore_err, "failed restoring pointer record after link failure");
            }
            return Err(LifecycleError::ActivationFailed {
                reason: format!("{:#}", err),
            });
        }
        Ok(())
    }

    /// Record update around a pointer commit. The pointer is authoritative,
    /// so a failed write is logged and left for `reconcile` to repair.
    fn settle_status(&self, version: &str, status: GenerationStatus) {
        if let Err(err) = self.store.set_status(version, status, None) {
            warn!(
                version,
                status = %status,
                error = %err,
                "failed updating generation record; reconcile will repair it"
            );
        }
    }

    fn verify_in_place(&self, generation: &Generation) -> LifecycleResult<()> {
        let manifest = self
            .verifier
            .sealed_manifest(&self.store, generation)?
            .map_err(Violation::into_error)?;
        match self.verifier.verify_live(generation, &manifest)? {
            VerificationResult::Valid => Ok(()),
            VerificationResult::Invalid(violation) => Err(violation.into_error()),
        }
    }

    fn verify_rollback_target(&self, target: &Generation) -> LifecycleResult<()> {
        self.verify_in_place(target)
            .map_err(|err| match err {
                LifecycleError::TransientIo { .. } | LifecycleError::Storage(_) => err,
                other => LifecycleError::RollbackUnavailable {
                    reason: format!(
                        "rollback target {} failed verification: {}",
                        target.version, other
                    ),
                },
            })
    }

    fn retire_generation(&self, version: &str, reason: &str) {
        let generation = match self.store.set_status(
            version,
            GenerationStatus::Retired,
            Some(reason.to_string()),
        ) {
            Ok(generation) => generation,
            Err(err) => {
                warn!(version, error = %err, "failed marking generation retired");
                return;
            }
        };
        let removed = match self.substrate.retire(&generation) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(version, error = %err, "retention mechanism failed");
                false
            }
        };
        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::Retired,
            json!({ "version": version, "reason": reason, "removed": removed }),
        ));
        info!(version, removed, "generation retired");
    }

    pub fn record_activation_failure(&self, version: &str, err: &LifecycleError) {
        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::ActivationFailed,
            json!({ "version": version, "error": err.kind(), "message": err.to_string() }),
        ));
    }

    /// `subject` names what was attempted; the error is merged into it.
    fn record_rollback_failure(&self, mut subject: Value, err: &LifecycleError) {
        subject["error"] = json!(err.kind());
        subject["message"] = json!(err.to_string());
        self.ledger
            .append_safe(LedgerEvent::new(LedgerEventKind::RollbackFailed, subject));
    }
}

fn record_outcome(kind: &str, result: &LifecycleResult<TransitionReport>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    };
    observability::record_activation(kind, outcome);
}
