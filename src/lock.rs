use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LifecycleError, LifecycleResult};

/// Exclusive, cross-process lock backed by a `create_new` file. Released on
/// drop.
#[derive(Debug)]
pub struct OperationLock {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub stale_after_secs: Option<u64>,
    pub auto_recover_stale: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            stale_after_secs: Some(900),
            auto_recover_stale: true,
        }
    }
}

/// Body of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub operation: String,
    pub pid: u32,
    pub started_at: String,
}

impl Display for LockHolder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (pid {}, since {})",
            self.operation, self.pid, self.started_at
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatusReport {
    pub lock_path: String,
    pub lock_exists: bool,
    pub holder: Option<LockHolder>,
    pub age_secs: Option<u64>,
    pub stale: bool,
    pub stale_after_secs: Option<u64>,
    pub auto_recover_stale_lock: bool,
    pub force_unlocked: bool,
}

/// What is currently on disk at the lock path.
struct Snapshot {
    exists: bool,
    holder: Option<LockHolder>,
    age_secs: Option<u64>,
}

impl Snapshot {
    fn is_stale(&self, policy: LockPolicy) -> bool {
        match (policy.stale_after_secs.filter(|secs| *secs > 0), self.age_secs) {
            (Some(threshold), Some(age)) => age >= threshold,
            _ => false,
        }
    }

    fn describe(&self, path: &Path) -> String {
        match self.holder.as_ref() {
            Some(holder) => format!("{} holds {}", holder, path.display()),
            None => format!("another operation holds {}", path.display()),
        }
    }
}

impl OperationLock {
    /// Takes the lock or fails at once with `ActivationConflict`. A stale
    /// lock is removed first when the policy allows it.
    pub fn try_acquire(path: &Path, operation: &str, policy: LockPolicy) -> LifecycleResult<Self> {
        if let Some(lock) = create_lock_file(path, operation)? {
            return Ok(lock);
        }

        let snapshot = snapshot(path)?;
        let stale = snapshot.is_stale(policy);
        if stale && policy.auto_recover_stale {
            warn!(
                lock = %path.display(),
                holder = ?snapshot.holder,
                age_secs = snapshot.age_secs.unwrap_or(0),
                "removing stale operation lock"
            );
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("failed removing stale lock {}", path.display()))
                        .into())
                }
            }
            if let Some(lock) = create_lock_file(path, operation)? {
                return Ok(lock);
            }
            let snapshot = self::snapshot(path)?;
            return Err(LifecycleError::ActivationConflict {
                holder: snapshot.describe(path),
            });
        }

        let mut holder = snapshot.describe(path);
        if stale {
            holder.push_str("; lock appears stale, re-run with lock force-unlock --confirm");
        }
        Err(LifecycleError::ActivationConflict { holder })
    }

    /// Retries `try_acquire` for a bounded number of attempts. Used where a
    /// short wait is acceptable (ledger appends) but queuing forever is not.
    pub fn acquire_with_retry(
        path: &Path,
        operation: &str,
        policy: LockPolicy,
        attempts: u32,
        delay: Duration,
    ) -> LifecycleResult<Self> {
        let mut last_conflict = None;
        for attempt in 0..attempts.max(1) {
            match Self::try_acquire(path, operation, policy) {
                Ok(lock) => return Ok(lock),
                Err(conflict @ LifecycleError::ActivationConflict { .. }) => {
                    last_conflict = Some(conflict);
                    if attempt + 1 < attempts {
                        thread::sleep(delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_conflict
            .unwrap_or_else(|| anyhow!("could not take lock {}", path.display()).into()))
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => eprintln!(
                "{{\"event\":\"lock_release_failed\",\"lock\":{},\"message\":{}}}",
                serde_json::to_string(&self.path.display().to_string())
                    .unwrap_or_else(|_| "\"<encode-error>\"".to_string()),
                serde_json::to_string(&err.to_string())
                    .unwrap_or_else(|_| "\"<encode-error>\"".to_string())
            ),
        }
    }
}

pub fn lock_status(path: &Path, policy: LockPolicy) -> Result<LockStatusReport> {
    let snapshot = snapshot(path)?;
    Ok(report(path, policy, snapshot, false))
}

/// Removes the lock regardless of its holder and reports what was removed.
pub fn force_unlock(path: &Path, policy: LockPolicy) -> Result<LockStatusReport> {
    let snapshot = snapshot(path)?;
    let removed = match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            return Err(err).with_context(|| format!("failed removing lock {}", path.display()))
        }
    };
    let mut report = report(path, policy, snapshot, removed);
    report.lock_exists = path.exists();
    Ok(report)
}

/// `Ok(None)` when the lock file already exists.
fn create_lock_file(path: &Path, operation: &str) -> Result<Option<OperationLock>> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed creating lock {}", path.display()))
        }
    };
    let lock = OperationLock {
        path: path.to_path_buf(),
    };
    let holder = LockHolder {
        operation: operation.trim().to_string(),
        pid: std::process::id(),
        started_at: Utc::now().to_rfc3339(),
    };
    let body = serde_json::to_vec(&holder).context("failed encoding lock holder")?;
    file.write_all(&body)
        .with_context(|| format!("failed writing lock {}", path.display()))?;
    Ok(Some(lock))
}

fn snapshot(path: &Path) -> Result<Snapshot> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(Snapshot {
                exists: false,
                holder: None,
                age_secs: None,
            })
        }
        Err(err) => return Err(err).with_context(|| format!("failed reading lock {}", path.display())),
    };
    // An empty or half-written body has no holder; its age falls back to
    // the file's mtime so an abandoned one still goes stale.
    let holder = serde_json::from_slice::<LockHolder>(&raw).ok();
    let age_secs = match holder
        .as_ref()
        .and_then(|holder| DateTime::parse_from_rfc3339(&holder.started_at).ok())
    {
        Some(started) => Some(
            (Utc::now() - started.with_timezone(&Utc))
                .num_seconds()
                .max(0) as u64,
        ),
        None => modified_age_secs(path),
    };
    Ok(Snapshot {
        exists: true,
        holder,
        age_secs,
    })
}

fn modified_age_secs(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default()
            .as_secs(),
    )
}

fn report(
    path: &Path,
    policy: LockPolicy,
    snapshot: Snapshot,
    force_unlocked: bool,
) -> LockStatusReport {
    LockStatusReport {
        lock_path: path.display().to_string(),
        lock_exists: snapshot.exists,
        stale: snapshot.exists && snapshot.is_stale(policy),
        holder: snapshot.holder,
        age_secs: snapshot.age_secs,
        stale_after_secs: policy.stale_after_secs,
        auto_recover_stale_lock: policy.auto_recover_stale,
        force_unlocked,
    }
}
