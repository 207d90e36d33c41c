use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::activator::{Activator, RetentionReport, TransitionReport};
use crate::config::MonitorSettings;
use crate::error::{LifecycleError, LifecycleResult};
use crate::generation::{Generation, GenerationStore};
use crate::ledger::{Ledger, LedgerEvent, LedgerEventKind};
use crate::lock::OperationLock;
use crate::observability;
use crate::quarantine::QuarantineStore;
use crate::verifier::{VerificationResult, Verifier, Violation, ViolationKind};

const SHUTDOWN_POLL_MS: u64 = 200;

/// Decides when the next monitor cycle runs.
pub trait CycleTrigger {
    /// Blocks until a cycle is due. `false` ends the loop.
    fn wait_next(&mut self) -> bool;
}

/// Fires at once, then every `interval`, until `shutdown` is raised.
pub struct IntervalTrigger {
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    fired: bool,
}

impl IntervalTrigger {
    pub fn new(interval: Duration, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            interval,
            shutdown,
            fired: false,
        }
    }
}

impl CycleTrigger for IntervalTrigger {
    fn wait_next(&mut self) -> bool {
        if self.shutdown.load(Ordering::Relaxed) {
            return false;
        }
        if !self.fired {
            self.fired = true;
            return true;
        }
        let deadline = Instant::now() + self.interval;
        while Instant::now() < deadline {
            if self.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            thread::sleep(left.min(Duration::from_millis(SHUTDOWN_POLL_MS)));
        }
        !self.shutdown.load(Ordering::Relaxed)
    }
}

/// Fires a fixed number of times without sleeping.
pub struct FixedCycles {
    remaining: u64,
}

impl FixedCycles {
    pub fn new(cycles: u64) -> Self {
        Self { remaining: cycles }
    }
}

impl CycleTrigger for FixedCycles {
    fn wait_next(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Clean,
    Idle,
    Deferred,
    RolledBack,
    QuarantinedWithoutRollback,
    PassiveViolation,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Idle => "idle",
            Self::Deferred => "deferred",
            Self::RolledBack => "rolled_back",
            Self::QuarantinedWithoutRollback => "quarantined_without_rollback",
            Self::PassiveViolation => "passive_violation",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcome: CycleOutcome,
    pub active: Option<String>,
    pub attempts: u32,
    pub baseline_scanned: bool,
    pub quarantined: bool,
    pub violation: Option<Violation>,
    pub rollback: Option<TransitionReport>,
    pub retention: Option<RetentionReport>,
    pub detail: Option<String>,
}

impl CycleReport {
    fn new(cycle: u64, outcome: CycleOutcome) -> Self {
        Self {
            cycle,
            outcome,
            active: None,
            attempts: 0,
            baseline_scanned: false,
            quarantined: false,
            violation: None,
            rollback: None,
            retention: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorRunSummary {
    pub cycles: u64,
    pub clean: u64,
    pub deferred: u64,
    pub rollbacks: u64,
    pub violations: u64,
    pub errors: u64,
    pub last: Option<CycleReport>,
}

pub struct IntegrityMonitor {
    activator: Arc<Activator>,
    verifier: Arc<Verifier>,
    store: GenerationStore,
    ledger: Arc<Ledger>,
    quarantine: QuarantineStore,
    settings: MonitorSettings,
}

impl IntegrityMonitor {
    pub fn new(
        activator: Arc<Activator>,
        verifier: Arc<Verifier>,
        store: GenerationStore,
        ledger: Arc<Ledger>,
        quarantine: QuarantineStore,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            activator,
            verifier,
            store,
            ledger,
            quarantine,
            settings,
        }
    }

    /// Runs cycles until the trigger stops. A failing cycle is logged and the
    /// loop keeps watching; a cycle in progress always completes.
    pub fn run(&self, trigger: &mut dyn CycleTrigger) -> MonitorRunSummary {
        let mut summary = MonitorRunSummary::default();
        while trigger.wait_next() {
            summary.cycles += 1;
            let baseline = self
                .settings
                .baseline_scan_every
                .is_some_and(|every| summary.cycles % every == 0);
            match self.run_cycle(summary.cycles, baseline) {
                Ok(report) => {
                    match report.outcome {
                        CycleOutcome::Clean | CycleOutcome::Idle => summary.clean += 1,
                        CycleOutcome::Deferred => summary.deferred += 1,
                        CycleOutcome::RolledBack => {
                            summary.rollbacks += 1;
                            summary.violations += 1;
                        }
                        CycleOutcome::QuarantinedWithoutRollback
                        | CycleOutcome::PassiveViolation => summary.violations += 1,
                    }
                    summary.last = Some(report);
                }
                Err(err) => {
                    summary.errors += 1;
                    observability::record_monitor_cycle("error");
                    error!(cycle = summary.cycles, error = %err, "monitor cycle failed");
                }
            }
        }
        info!(cycles = summary.cycles, rollbacks = summary.rollbacks, "monitor stopped");
        summary
    }

    #[instrument(skip(self))]
    pub fn run_cycle(&self, cycle: u64, baseline: bool) -> LifecycleResult<CycleReport> {
        let lock = match self.activator.try_lock("monitor") {
            Ok(lock) => lock,
            Err(LifecycleError::ActivationConflict { holder }) => {
                info!(holder = %holder, "activation lock busy; deferring cycle");
                observability::record_monitor_cycle(CycleOutcome::Deferred.as_str());
                let mut report = CycleReport::new(cycle, CycleOutcome::Deferred);
                report.detail = Some(holder);
                return Ok(report);
            }
            Err(err) => return Err(err),
        };

        let report = self.run_cycle_locked(cycle, baseline, &lock)?;
        observability::record_monitor_cycle(report.outcome.as_str());
        Ok(report)
    }

    fn run_cycle_locked(
        &self,
        cycle: u64,
        baseline: bool,
        lock: &OperationLock,
    ) -> LifecycleResult<CycleReport> {
        let quarantined = self.quarantine.is_active()?;
        let pointer = self.activator.pointer()?;
        let Some(active) = pointer.active.clone() else {
            let mut report = CycleReport::new(cycle, CycleOutcome::Idle);
            report.quarantined = quarantined;
            return Ok(report);
        };

        let generation = self.store.load(&active)?;
        let (result, attempts, baseline_scanned) = self.check_generation(&generation, baseline)?;

        let mut report = CycleReport::new(cycle, CycleOutcome::Clean);
        report.active = Some(active.clone());
        report.attempts = attempts;
        report.baseline_scanned = baseline_scanned;
        report.quarantined = quarantined;

        let violation = match result {
            VerificationResult::Valid => {
                report.retention = Some(self.activator.record_clean_cycle_locked(lock)?);
                return Ok(report);
            }
            VerificationResult::Invalid(violation) => violation,
        };

        self.activator.reset_rollback_window_locked(lock)?;
        report.violation = Some(violation.clone());

        if quarantined {
            report.outcome = CycleOutcome::PassiveViolation;
            let first_sighting = self.quarantine.note_violation(&violation)?;
            warn!(
                version = %active,
                kind = violation.kind.as_str(),
                path = %violation.path,
                first_sighting,
                "integrity violation while quarantined; rollback suspended"
            );
            if first_sighting {
                self.record_violation(&active, &violation, "none");
            }
            return Ok(report);
        }

        error!(
            version = %active,
            kind = violation.kind.as_str(),
            path = %violation.path,
            detail = %violation.detail,
            "integrity violation on active generation"
        );
        self.record_violation(&active, &violation, "rollback");

        let reason = format!(
            "{} on {}: {}",
            violation.reason_kind(),
            violation.path,
            violation.detail
        );
        let rolled_back_to = match self.activator.rollback_locked(&reason, lock) {
            Ok(transition) => {
                report.outcome = CycleOutcome::RolledBack;
                let target = transition.active.clone();
                report.rollback = Some(transition);
                target
            }
            Err(err) => {
                report.outcome = CycleOutcome::QuarantinedWithoutRollback;
                report.detail = Some(err.to_string());
                error!(version = %active, error = %err, "rollback failed; active generation left in place");
                None
            }
        };

        self.quarantine
            .enter(&active, &violation, rolled_back_to.as_deref())?;
        report.quarantined = true;
        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::QuarantineEntered,
            json!({
                "generation": active,
                "reason": reason,
                "rolled_back_to": rolled_back_to,
            }),
        ));
        Ok(report)
    }

    /// Authenticates the stored manifest, re-hashes the tree against it and
    /// optionally runs the baseline scan. Returns the verdict, the number of
    /// reads it took and whether the scan ran.
    fn check_generation(
        &self,
        generation: &Generation,
        baseline: bool,
    ) -> LifecycleResult<(VerificationResult, u32, bool)> {
        let (sealed, mut attempts) =
            self.with_retry(|| self.verifier.sealed_manifest(&self.store, generation))?;
        let manifest = match sealed.and_then(|sealed| sealed) {
            Ok(manifest) => manifest,
            Err(violation) => return Ok((VerificationResult::Invalid(violation), attempts, false)),
        };

        let (live, live_attempts) =
            self.with_retry(|| self.verifier.verify_live(generation, &manifest))?;
        attempts += live_attempts;
        let live = live.unwrap_or_else(VerificationResult::Invalid);
        if !baseline || !live.is_valid() {
            return Ok((live, attempts, false));
        }

        let (scan, scan_attempts) =
            self.with_retry(|| self.verifier.baseline_scan(generation, &manifest))?;
        Ok((
            scan.unwrap_or_else(VerificationResult::Invalid),
            attempts + scan_attempts,
            true,
        ))
    }

    /// Retries transient read failures with capped exponential backoff.
    /// When every attempt is inconclusive the read counts as a violation.
    fn with_retry<T, F>(&self, mut check: F) -> LifecycleResult<(Result<T, Violation>, u32)>
    where
        F: FnMut() -> LifecycleResult<T>,
    {
        let retries = self.settings.retry_attempts;
        let mut attempt = 0u32;
        loop {
            match check() {
                Ok(value) => return Ok((Ok(value), attempt + 1)),
                Err(LifecycleError::TransientIo { path, message }) => {
                    if attempt >= retries {
                        warn!(path = %path, attempts = attempt + 1, "transient read failures exhausted retries");
                        return Ok((
                            Err(Violation {
                                kind: ViolationKind::Unreadable,
                                path,
                                detail: format!(
                                    "unreadable after {} attempts: {}",
                                    attempt + 1,
                                    message
                                ),
                            }),
                            attempt + 1,
                        ));
                    }
                    let delay_ms = compute_retry_delay_ms(
                        self.settings.retry_backoff_ms,
                        self.settings.retry_max_backoff_ms,
                        attempt,
                    );
                    warn!(path = %path, message = %message, attempt = attempt + 1, delay_ms, "transient read failure; retrying");
                    thread::sleep(Duration::from_millis(delay_ms));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record_violation(&self, version: &str, violation: &Violation, action: &str) {
        self.ledger.append_safe(LedgerEvent::new(
            LedgerEventKind::IntegrityViolation,
            json!({
                "version": version,
                "kind": violation.reason_kind(),
                "violation": violation.kind.as_str(),
                "path": violation.path,
                "detail": violation.detail,
                "action": action,
            }),
        ));
    }
}

fn compute_retry_delay_ms(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let safe_base = base_ms.max(1);
    let shift = attempt.min(12);
    let factor = 1u64 << shift;
    let candidate = safe_base.saturating_mul(factor);
    candidate.min(max_ms.max(safe_base))
}
