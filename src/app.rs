use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::activator::{Activator, TransitionReport};
use crate::auth::{AuthScope, Authorizer};
use crate::backend::{Ed25519Backend, VerificationBackend};
use crate::bundle::Bundle;
use crate::config::Settings;
use crate::error::{LifecycleError, LifecycleResult};
use crate::generation::{Generation, GenerationStore};
use crate::ledger::{
    Ledger, LedgerEntry, LedgerEvent, LedgerEventKind, LedgerSigningPolicy, LedgerVerifyReport,
};
use crate::lock::{force_unlock, lock_status, LockPolicy, LockStatusReport};
use crate::monitor::{CycleReport, CycleTrigger, IntegrityMonitor, MonitorRunSummary};
use crate::notify::{CommandNotifier, NoopNotifier, ReloadNotifier};
use crate::pointer::{PointerRecord, PointerStore};
use crate::quarantine::{QuarantineState, QuarantineStore};
use crate::stage::StageManager;
use crate::substrate::{DeploymentSubstrate, DirectorySubstrate};
use crate::verifier::{BundleVerifyReport, VerificationResult, Verifier};

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub verification: BundleVerifyReport,
    pub generation: Generation,
    pub transition: Option<TransitionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveVerifyReport {
    pub version: String,
    pub result: VerificationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerHealth {
    pub entries: usize,
    pub valid: bool,
    pub corrupt_index: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state_dir: String,
    pub pointer: PointerRecord,
    pub service_link: Option<String>,
    pub active: Option<Generation>,
    pub rollback_target: Option<Generation>,
    pub quarantine: QuarantineState,
    pub ledger: LedgerHealth,
    pub lock: LockStatusReport,
}

pub struct GenguardApp {
    settings: Settings,
    store: GenerationStore,
    pointer: PointerStore,
    ledger: Arc<Ledger>,
    verifier: Arc<Verifier>,
    stage: StageManager,
    activator: Arc<Activator>,
    quarantine: QuarantineStore,
    auth: Authorizer,
}

impl GenguardApp {
    pub fn new(settings: Settings) -> LifecycleResult<Self> {
        let backend = Ed25519Backend::from_key_material(&settings.trusted_public_keys)?;
        let notifier: Arc<dyn ReloadNotifier> =
            match CommandNotifier::from_command_line(&settings.reload_command) {
                Some(notifier) => Arc::new(notifier),
                None => Arc::new(NoopNotifier),
            };
        Self::with_components(settings, Arc::new(backend), notifier)
    }

    /// Wires the lifecycle around caller-supplied collaborators.
    pub fn with_components(
        settings: Settings,
        backend: Arc<dyn VerificationBackend>,
        notifier: Arc<dyn ReloadNotifier>,
    ) -> LifecycleResult<Self> {
        let state_dir = settings.state_dir.clone();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed creating state dir {}", state_dir.display()))?;

        let lock_policy = LockPolicy {
            stale_after_secs: settings.lock_stale_after_secs,
            auto_recover_stale: settings.auto_recover_stale_lock,
        };
        let store = GenerationStore::new(state_dir.join("generations"))?;
        let pointer = PointerStore::new(&state_dir);
        let ledger = Arc::new(Ledger::open(
            state_dir.join("ledger.jsonl"),
            LedgerSigningPolicy {
                key_id: settings.ledger.signing_key_id.clone(),
                key: settings.ledger.signing_key.clone(),
                require_signed: settings.ledger.require_signed,
            },
            lock_policy,
        )?);
        let verifier = Arc::new(Verifier::new(backend));
        let substrate: Arc<dyn DeploymentSubstrate> = Arc::new(DirectorySubstrate::new(
            store.clone(),
            settings.retention.mode,
        ));
        let stage = StageManager::new(
            store.clone(),
            pointer.clone(),
            Arc::clone(&substrate),
            Arc::clone(&ledger),
            settings.require_monotonic_version,
        );
        let activator = Arc::new(Activator::new(
            store.clone(),
            pointer.clone(),
            Arc::clone(&verifier),
            substrate,
            Arc::clone(&ledger),
            notifier,
            state_dir.join("activation.lock"),
            lock_policy,
            settings.retention.rollback_clean_cycles,
        ));
        let quarantine = QuarantineStore::new(&state_dir);
        let auth = Authorizer::new(
            settings.update_token_sha256.clone(),
            settings.quarantine_token_sha256.clone(),
        );

        let fixes = activator.reconcile()?;
        if !fixes.is_empty() {
            warn!(count = fixes.len(), "generation records reconciled on startup");
        }

        Ok(Self {
            settings,
            store,
            pointer,
            ledger,
            verifier,
            stage,
            activator,
            quarantine,
            auth,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn activator(&self) -> &Arc<Activator> {
        &self.activator
    }

    /// Checks a bundle without touching live state.
    pub fn verify_bundle(&self, path: &Path) -> LifecycleResult<BundleVerifyReport> {
        let bundle = Bundle::open(path).inspect_err(|err| {
            self.record_verification_failure(path, "bundle", err);
        })?;
        match self.verifier.verify(&bundle) {
            Ok(verified) => {
                let report = BundleVerifyReport::from(&verified);
                self.ledger.append_safe(LedgerEvent::new(
                    LedgerEventKind::Verified,
                    json!({
                        "target": "bundle",
                        "bundle": report.bundle,
                        "version": report.version,
                        "manifest_sha256": report.manifest_sha256,
                    }),
                ));
                Ok(report)
            }
            Err(err) => {
                self.record_verification_failure(path, "bundle", &err);
                Err(err)
            }
        }
    }

    /// Re-hashes the active generation in place.
    pub fn verify_active(&self) -> LifecycleResult<LiveVerifyReport> {
        let pointer = self.pointer.load()?;
        let Some(active) = pointer.active else {
            return Err(anyhow!("no generation is active").into());
        };
        let generation = self.store.load(&active)?;
        let result = match self.verifier.sealed_manifest(&self.store, &generation)? {
            Ok(manifest) => self.verifier.verify_live(&generation, &manifest)?,
            Err(violation) => VerificationResult::Invalid(violation),
        };
        match &result {
            VerificationResult::Valid => {
                self.ledger.append_safe(LedgerEvent::new(
                    LedgerEventKind::Verified,
                    json!({ "target": "live", "version": active }),
                ));
            }
            VerificationResult::Invalid(violation) => {
                self.ledger.append_safe(LedgerEvent::new(
                    LedgerEventKind::VerificationFailed,
                    json!({
                        "target": "live",
                        "version": active,
                        "error": violation.reason_kind(),
                        "path": violation.path,
                        "detail": violation.detail,
                    }),
                ));
            }
        }
        Ok(LiveVerifyReport {
            version: active,
            result,
        })
    }

    /// Verify, stage and (unless `stage_only`) activate a bundle.
    pub fn update(
        &self,
        path: &Path,
        token: Option<&str>,
        stage_only: bool,
    ) -> LifecycleResult<UpdateReport> {
        self.authorize(AuthScope::Update, "update", token)?;

        let bundle = Bundle::open(path).inspect_err(|err| {
            self.record_verification_failure(path, "bundle", err);
        })?;
        let verified = self.verifier.verify(&bundle).inspect_err(|err| {
            self.record_verification_failure(path, "bundle", err);
        })?;
        let verification = BundleVerifyReport::from(&verified);
        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::Verified,
            json!({
                "target": "bundle",
                "bundle": verification.bundle,
                "version": verification.version,
                "manifest_sha256": verification.manifest_sha256,
            }),
        ));

        let lock = self.activator.try_lock("update").inspect_err(|err| {
            self.activator
                .record_activation_failure(verified.version(), err);
        })?;
        let generation = self.stage.stage(&verified, &lock).inspect_err(|err| {
            self.record_verification_failure(path, "stage", err);
        })?;
        let transition = if stage_only {
            None
        } else {
            Some(self.activator.activate_locked(&generation.version, &lock)?)
        };
        drop(lock);

        let generation = self.store.load(&generation.version)?;
        info!(version = %generation.version, status = %generation.status, "update finished");
        Ok(UpdateReport {
            verification,
            generation,
            transition,
        })
    }

    pub fn activate(&self, version: &str, token: Option<&str>) -> LifecycleResult<TransitionReport> {
        self.authorize(AuthScope::Update, "activate", token)?;
        self.activator.activate(version)
    }

    pub fn rollback(&self, reason: &str, token: Option<&str>) -> LifecycleResult<TransitionReport> {
        self.authorize(AuthScope::Update, "rollback", token)?;
        self.activator.rollback(reason)
    }

    pub fn recover(&self, version: &str, token: Option<&str>) -> LifecycleResult<TransitionReport> {
        self.authorize(AuthScope::Update, "recover", token)?;
        self.activator.recover(version)
    }

    pub fn status(&self) -> LifecycleResult<StatusReport> {
        let pointer = self.pointer.load()?;
        let active = match pointer.active.as_deref() {
            Some(version) => self.store.find(version)?,
            None => None,
        };
        let rollback_target = match pointer.rollback_target.as_deref() {
            Some(version) => self.store.find(version)?,
            None => None,
        };
        let ledger = match self.ledger.verify_chain() {
            Ok(report) => LedgerHealth {
                entries: report.entries,
                valid: true,
                corrupt_index: None,
                error: None,
            },
            Err(err) => {
                warn!(error = %err, "ledger chain verification failed");
                let corrupt_index = match &err {
                    LifecycleError::LedgerCorrupt { index, .. } => Some(*index),
                    _ => None,
                };
                LedgerHealth {
                    entries: self.ledger.entries().map(|entries| entries.len()).unwrap_or(0),
                    valid: false,
                    corrupt_index,
                    error: Some(err.to_string()),
                }
            }
        };
        Ok(StatusReport {
            state_dir: self.settings.state_dir.display().to_string(),
            service_link: self
                .pointer
                .link_target()
                .map(|target| target.display().to_string()),
            pointer,
            active,
            rollback_target,
            quarantine: self.quarantine.load()?,
            ledger,
            lock: lock_status(self.activator.lock_path(), self.activator.lock_policy())?,
        })
    }

    pub fn generations(&self) -> LifecycleResult<Vec<Generation>> {
        self.store.list()
    }

    pub fn ledger_tail(&self, limit: usize) -> LifecycleResult<Vec<LedgerEntry>> {
        self.ledger.tail(limit)
    }

    pub fn ledger_verify(&self) -> LifecycleResult<LedgerVerifyReport> {
        self.ledger.verify_chain()
    }

    pub fn monitor(&self) -> IntegrityMonitor {
        IntegrityMonitor::new(
            Arc::clone(&self.activator),
            Arc::clone(&self.verifier),
            self.store.clone(),
            Arc::clone(&self.ledger),
            self.quarantine.clone(),
            self.settings.monitor.clone(),
        )
    }

    /// One monitor cycle including the baseline scan when it is enabled.
    pub fn monitor_once(&self) -> LifecycleResult<CycleReport> {
        self.monitor()
            .run_cycle(1, self.settings.monitor.baseline_scan_every.is_some())
    }

    pub fn run_monitor(&self, trigger: &mut dyn CycleTrigger) -> MonitorRunSummary {
        self.monitor().run(trigger)
    }

    pub fn quarantine_status(&self) -> LifecycleResult<QuarantineState> {
        Ok(self.quarantine.load()?)
    }

    pub fn quarantine_clear(
        &self,
        confirm: bool,
        token: Option<&str>,
    ) -> LifecycleResult<Option<QuarantineState>> {
        if !confirm {
            return Err(anyhow!(
                "quarantine clear requires explicit confirmation. Re-run with --confirm"
            )
            .into());
        }
        self.authorize(AuthScope::QuarantineClear, "quarantine-clear", token)?;
        let cleared = self.quarantine.clear()?;
        if let Some(previous) = cleared.as_ref() {
            self.ledger.append_safe(LedgerEvent::new(
                LedgerEventKind::QuarantineCleared,
                json!({
                    "generation": previous.generation,
                    "reason": previous.reason,
                    "entered_at": previous.entered_at,
                }),
            ));
            info!(generation = ?previous.generation, "quarantine cleared by operator");
        }
        Ok(cleared)
    }

    pub fn lock_status(&self) -> LifecycleResult<LockStatusReport> {
        Ok(lock_status(
            self.activator.lock_path(),
            self.activator.lock_policy(),
        )?)
    }

    pub fn force_unlock(&self, confirm: bool) -> LifecycleResult<LockStatusReport> {
        if !confirm {
            return Err(anyhow!(
                "lock force-unlock requires explicit confirmation. Re-run with --confirm"
            )
            .into());
        }
        Ok(force_unlock(
            self.activator.lock_path(),
            self.activator.lock_policy(),
        )?)
    }

    pub fn status_json(&self) -> LifecycleResult<String> {
        encode("ok", &self.status()?, "status")
    }

    pub fn generations_json(&self) -> LifecycleResult<String> {
        encode("ok", &self.generations()?, "generations")
    }

    pub fn verify_bundle_json(&self, path: &Path) -> LifecycleResult<String> {
        encode("valid", &self.verify_bundle(path)?, "verify")
    }

    /// Live check; a violation is returned as the matching error so the
    /// CLI exits with the verification code.
    pub fn verify_active_json(&self) -> LifecycleResult<String> {
        let report = self.verify_active()?;
        if let VerificationResult::Invalid(violation) = report.result {
            return Err(violation.into_error());
        }
        encode("valid", &report, "verify")
    }

    pub fn update_json(
        &self,
        path: &Path,
        token: Option<&str>,
        stage_only: bool,
    ) -> LifecycleResult<String> {
        let report = self.update(path, token, stage_only)?;
        let status = if stage_only { "staged" } else { "activated" };
        encode(status, &report, "update")
    }

    pub fn activate_json(&self, version: &str, token: Option<&str>) -> LifecycleResult<String> {
        encode("activated", &self.activate(version, token)?, "activate")
    }

    pub fn rollback_json(&self, reason: &str, token: Option<&str>) -> LifecycleResult<String> {
        encode("rolled_back", &self.rollback(reason, token)?, "rollback")
    }

    pub fn recover_json(&self, version: &str, token: Option<&str>) -> LifecycleResult<String> {
        encode("recovered", &self.recover(version, token)?, "recover")
    }

    pub fn ledger_show_json(&self, limit: usize) -> LifecycleResult<String> {
        encode("ok", &self.ledger_tail(limit)?, "ledger show")
    }

    pub fn ledger_verify_json(&self) -> LifecycleResult<String> {
        encode("ok", &self.ledger_verify()?, "ledger verify")
    }

    pub fn quarantine_status_json(&self) -> LifecycleResult<String> {
        encode("ok", &self.quarantine_status()?, "quarantine status")
    }

    pub fn quarantine_clear_json(
        &self,
        confirm: bool,
        token: Option<&str>,
    ) -> LifecycleResult<String> {
        match self.quarantine_clear(confirm, token)? {
            Some(previous) => encode("cleared", &previous, "quarantine clear"),
            None => encode("not_quarantined", &self.quarantine_status()?, "quarantine clear"),
        }
    }

    pub fn lock_status_json(&self) -> LifecycleResult<String> {
        encode("ok", &self.lock_status()?, "lock status")
    }

    pub fn force_unlock_json(&self, confirm: bool) -> LifecycleResult<String> {
        encode("ok", &self.force_unlock(confirm)?, "lock force-unlock")
    }

    pub fn monitor_once_json(&self) -> LifecycleResult<String> {
        let report = self.monitor_once()?;
        encode(report.outcome.as_str(), &report, "monitor cycle")
    }

    fn authorize(&self, scope: AuthScope, operation: &str, token: Option<&str>) -> LifecycleResult<()> {
        self.auth.authorize(scope, token).inspect_err(|err| {
            warn!(operation, scope = %scope, "authorization denied");
            self.ledger.append_safe(LedgerEvent::new(
                LedgerEventKind::AuthorizationDenied,
                json!({
                    "operation": operation,
                    "scope": scope.as_str(),
                    "error": err.kind(),
                    "message": err.to_string(),
                }),
            ));
        })
    }

    fn record_verification_failure(&self, path: &Path, stage: &str, err: &LifecycleError) {
        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::VerificationFailed,
            json!({
                "target": stage,
                "bundle": path.display().to_string(),
                "error": err.kind(),
                "message": err.to_string(),
            }),
        ));
    }
}

fn encode<T: Serialize>(status: &str, report: &T, label: &str) -> LifecycleResult<String> {
    Ok(serde_json::to_string_pretty(&json!({
        "status": status,
        "report": report
    }))
    .with_context(|| format!("failed to encode {} result", label))?)
}
