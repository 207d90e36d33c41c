use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::error::{LifecycleError, LifecycleResult};
use crate::lock::{LockPolicy, OperationLock};

const SIGNATURE_ALGORITHM: &str = "hmac-sha256";
const APPEND_LOCK_ATTEMPTS: u32 = 50;
const APPEND_LOCK_DELAY_MS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    Verified,
    VerificationFailed,
    Staged,
    Activated,
    ActivationFailed,
    RolledBack,
    RollbackFailed,
    Recovered,
    Retired,
    IntegrityViolation,
    QuarantineEntered,
    QuarantineCleared,
    AuthorizationDenied,
}

impl LedgerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::VerificationFailed => "verification_failed",
            Self::Staged => "staged",
            Self::Activated => "activated",
            Self::ActivationFailed => "activation_failed",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
            Self::Recovered => "recovered",
            Self::Retired => "retired",
            Self::IntegrityViolation => "integrity_violation",
            Self::QuarantineEntered => "quarantine_entered",
            Self::QuarantineCleared => "quarantine_cleared",
            Self::AuthorizationDenied => "authorization_denied",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEvent {
    pub kind: LedgerEventKind,
    pub payload: Value,
}

impl LedgerEvent {
    pub fn new(kind: LedgerEventKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSignature {
    pub key_id: String,
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub timestamp: String,
    pub kind: LedgerEventKind,
    pub payload: Value,
    pub prev_hash: Option<String>,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<LedgerSignature>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerVerifyReport {
    pub ledger_path: String,
    pub entries: usize,
    pub signed_entries: usize,
    pub last_hash: Option<String>,
    pub valid: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerSigningPolicy {
    pub key_id: Option<String>,
    pub key: Option<String>,
    pub require_signed: bool,
}

/// Append-only JSONL ledger. Each entry's hash covers the previous entry's
/// hash plus this entry's body; the optional HMAC signs that hash with a key
/// separate from bundle signing keys.
pub struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
    signing: LedgerSigningPolicy,
    lock_policy: LockPolicy,
    writer: Mutex<()>,
}

impl Ledger {
    pub fn open(
        path: impl AsRef<Path>,
        signing: LedgerSigningPolicy,
        lock_policy: LockPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating ledger dir {}", parent.display()))?;
        }
        let lock_path = path.with_extension("lock");
        let signing = LedgerSigningPolicy {
            key_id: signing
                .key_id
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            key: signing
                .key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            require_signed: signing.require_signed,
        };
        Ok(Self {
            path,
            lock_path,
            signing,
            lock_policy,
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: LedgerEvent) -> LifecycleResult<LedgerEntry> {
        let _writer = self
            .writer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let _lock = OperationLock::acquire_with_retry(
            &self.lock_path,
            "ledger-append",
            self.lock_policy,
            APPEND_LOCK_ATTEMPTS,
            Duration::from_millis(APPEND_LOCK_DELAY_MS),
        )?;

        if self.signing.require_signed && self.signing.key.is_none() {
            return Err(anyhow!(
                "ledger signing is required but GENGUARD_LEDGER_SIGNING_KEY is not configured"
            )
            .into());
        }

        let (seq, prev_hash) = match self.read_tail()? {
            Some(last) => (last.seq + 1, Some(last.hash)),
            None => (0, None),
        };
        let timestamp = Utc::now().to_rfc3339();
        let hash = compute_entry_hash(
            seq,
            &timestamp,
            event.kind,
            prev_hash.as_deref(),
            &event.payload,
        )?;
        let signature = match self.signing.key.as_deref() {
            Some(key) => Some(LedgerSignature {
                key_id: self
                    .signing
                    .key_id
                    .clone()
                    .unwrap_or_else(|| "default".to_string()),
                algorithm: SIGNATURE_ALGORITHM.to_string(),
                value: compute_hmac_sha256_hex(&hash, key)?,
            }),
            None => None,
        };
        let entry = LedgerEntry {
            seq,
            timestamp,
            kind: event.kind,
            payload: event.payload,
            prev_hash,
            hash,
            signature,
        };

        let line = serde_json::to_string(&entry).context("failed encoding ledger entry")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening ledger {}", self.path.display()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .with_context(|| format!("failed writing ledger {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed syncing ledger {}", self.path.display()))?;

        debug!(seq = entry.seq, kind = entry.kind.as_str(), "ledger entry appended");
        Ok(entry)
    }

    /// Appends and logs instead of failing. Used on paths where the ledger
    /// must not block protecting the live generation.
    pub fn append_safe(&self, event: LedgerEvent) -> Option<LedgerEntry> {
        let kind = event.kind;
        match self.append(event) {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!(kind = kind.as_str(), error = %err, "ledger append failed");
                eprintln!(
                    "{{\"event\":\"ledger_append_error\",\"kind\":\"{}\",\"message\":{}}}",
                    kind.as_str(),
                    serde_json::to_string(&err.to_string())
                        .unwrap_or_else(|_| "\"<encode-error>\"".to_string())
                );
                None
            }
        }
    }

    /// Decodes every entry. A line that does not decode is reported as
    /// corruption at its index.
    pub fn entries(&self) -> LifecycleResult<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for (index, line) in self.read_lines()?.iter().enumerate() {
            entries.push(decode_entry(index, line)?);
        }
        Ok(entries)
    }

    pub fn tail(&self, limit: usize) -> LifecycleResult<Vec<LedgerEntry>> {
        let entries = self.entries()?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    /// Recomputes the chain from the first entry. Fails at the first entry
    /// whose hash, link, sequence or signature diverges; every entry before
    /// that index verified.
    pub fn verify_chain(&self) -> LifecycleResult<LedgerVerifyReport> {
        let lines = self.read_lines()?;
        let mut expected_prev_hash: Option<String> = None;
        let mut signed_entries = 0usize;

        for (index, line) in lines.iter().enumerate() {
            let corrupt = |reason: String| LifecycleError::LedgerCorrupt { index, reason };
            let entry = decode_entry(index, line)?;

            if entry.seq != index as u64 {
                return Err(corrupt(format!(
                    "sequence {} does not match position {}",
                    entry.seq, index
                )));
            }
            if entry.prev_hash != expected_prev_hash {
                return Err(corrupt("prev_hash does not link to previous entry".to_string()));
            }
            let computed = compute_entry_hash(
                entry.seq,
                &entry.timestamp,
                entry.kind,
                entry.prev_hash.as_deref(),
                &entry.payload,
            )
            .map_err(|err| corrupt(err.to_string()))?;
            if computed != entry.hash.trim().to_ascii_lowercase() {
                return Err(corrupt("entry hash mismatch".to_string()));
            }

            match (&entry.signature, self.signing.key.as_deref()) {
                (Some(signature), Some(key)) => {
                    verify_entry_signature(&entry.hash, signature, key)
                        .map_err(|err| corrupt(err.to_string()))?;
                    signed_entries += 1;
                }
                (Some(_), None) => signed_entries += 1,
                (None, _) if self.signing.require_signed => {
                    return Err(corrupt("entry is unsigned while signing is required".to_string()));
                }
                (None, _) => {}
            }

            expected_prev_hash = Some(computed);
        }

        Ok(LedgerVerifyReport {
            ledger_path: self.path.display().to_string(),
            entries: lines.len(),
            signed_entries,
            last_hash: expected_prev_hash,
            valid: true,
        })
    }

    /// Raw non-blank lines. Decoding is left to the caller so a line that is
    /// not UTF-8 is reported as corruption at its index.
    fn read_lines(&self) -> LifecycleResult<Vec<Vec<u8>>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed reading ledger {}", self.path.display()))
                    .into())
            }
        };
        Ok(raw
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(<[u8]>::to_vec)
            .collect())
    }

    fn read_tail(&self) -> LifecycleResult<Option<LedgerEntry>> {
        let lines = self.read_lines()?;
        let Some(last_line) = lines.last() else {
            return Ok(None);
        };
        let entry = decode_entry(lines.len() - 1, last_line)?;
        Ok(Some(entry))
    }
}

fn decode_entry(index: usize, line: &[u8]) -> LifecycleResult<LedgerEntry> {
    let text = std::str::from_utf8(line).map_err(|err| LifecycleError::LedgerCorrupt {
        index,
        reason: format!("entry is not valid UTF-8: {}", err),
    })?;
    serde_json::from_str::<LedgerEntry>(text).map_err(|err| LifecycleError::LedgerCorrupt {
        index,
        reason: format!("failed decoding entry: {}", err),
    })
}

fn compute_entry_hash(
    seq: u64,
    timestamp: &str,
    kind: LedgerEventKind,
    prev_hash: Option<&str>,
    payload: &Value,
) -> Result<String> {
    let payload = serde_json::to_string(payload).context("failed encoding ledger payload")?;
    let material = format!(
        "prev_hash={}\nseq={}\ntimestamp={}\nkind={}\npayload={}\n",
        prev_hash.unwrap_or_default(),
        seq,
        timestamp,
        kind.as_str(),
        payload
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn compute_hmac_sha256_hex(payload: &str, signing_key: &str) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .context("invalid ledger signing key")?;
    mac.update(payload.as_bytes());
    let bytes = mac.finalize().into_bytes();
    Ok(bytes.iter().map(|byte| format!("{:02x}", byte)).collect())
}

fn verify_entry_signature(hash: &str, signature: &LedgerSignature, key: &str) -> Result<()> {
    if signature.algorithm.trim() != SIGNATURE_ALGORITHM {
        return Err(anyhow!(
            "unsupported ledger signature algorithm '{}'",
            signature.algorithm
        ));
    }
    let expected = compute_hmac_sha256_hex(hash, key)?;
    if signature.value.trim().to_ascii_lowercase() != expected {
        return Err(anyhow!(
            "ledger signature mismatch (key id '{}')",
            signature.key_id
        ));
    }
    Ok(())
}
