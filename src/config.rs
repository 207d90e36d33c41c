use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const ENV_FILE_ENV: &str = "GENGUARD_ENV_FILE";

#[derive(Debug, Clone)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub trusted_public_keys: Vec<(String, String)>,
    pub require_monotonic_version: bool,
    pub ledger: LedgerSettings,
    pub monitor: MonitorSettings,
    pub retention: RetentionSettings,
    pub reload_command: Vec<String>,
    pub lock_stale_after_secs: Option<u64>,
    pub auto_recover_stale_lock: bool,
    pub update_token_sha256: Option<String>,
    pub quarantine_token_sha256: Option<String>,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub signing_key_id: Option<String>,
    pub signing_key: Option<String>,
    pub require_signed: bool,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub baseline_scan_every: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionMode {
    Remove,
    Keep,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub rollback_clean_cycles: u32,
    pub mode: RetentionMode,
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub state_dir: PathBuf,
    pub trusted_key_ids: Vec<String>,
    pub ledger_signing_enabled: bool,
    pub monitor_interval_secs: u64,
    pub rollback_clean_cycles: u32,
    pub retention_mode: RetentionMode,
    pub reload_command_configured: bool,
    pub warnings: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            retry_attempts: 3,
            retry_backoff_ms: 200,
            retry_max_backoff_ms: 2000,
            baseline_scan_every: Some(10),
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            rollback_clean_cycles: 5,
            mode: RetentionMode::Remove,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let state_dir = env::var("GENGUARD_STATE_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| PathBuf::from(value.trim()))
            .unwrap_or_else(|| PathBuf::from("./genguard-state"));

        let mut trusted_public_keys = Vec::new();
        if let Some(raw) = read_non_empty_env("GENGUARD_TRUSTED_PUBLIC_KEYS") {
            for (key_id, key) in parse_keyring(&raw) {
                push_unique_key(&mut trusted_public_keys, key_id, key);
            }
        }
        if let Some(key) = read_non_empty_env("GENGUARD_TRUSTED_PUBLIC_KEY") {
            let key_id = read_non_empty_env("GENGUARD_TRUSTED_PUBLIC_KEY_ID")
                .unwrap_or_else(|| "default".to_string());
            push_unique_key(&mut trusted_public_keys, key_id, key);
        }

        let ledger = LedgerSettings {
            signing_key_id: read_non_empty_env("GENGUARD_LEDGER_SIGNING_KEY_ID"),
            signing_key: read_non_empty_env("GENGUARD_LEDGER_SIGNING_KEY"),
            require_signed: read_bool_env("GENGUARD_REQUIRE_SIGNED_LEDGER", false),
        };

        let defaults = MonitorSettings::default();
        let baseline_scan_every = read_u64_env(
            "GENGUARD_MONITOR_BASELINE_SCAN_EVERY",
            defaults.baseline_scan_every.unwrap_or(0),
        );
        let monitor = MonitorSettings {
            interval_secs: read_u64_env("GENGUARD_MONITOR_INTERVAL_SECS", defaults.interval_secs)
                .max(1),
            retry_attempts: read_u32_env(
                "GENGUARD_MONITOR_RETRY_ATTEMPTS",
                defaults.retry_attempts,
            ),
            retry_backoff_ms: read_u64_env(
                "GENGUARD_MONITOR_RETRY_BACKOFF_MS",
                defaults.retry_backoff_ms,
            ),
            retry_max_backoff_ms: read_u64_env(
                "GENGUARD_MONITOR_RETRY_MAX_BACKOFF_MS",
                defaults.retry_max_backoff_ms,
            ),
            baseline_scan_every: Some(baseline_scan_every).filter(|value| *value > 0),
        };

        let retention = RetentionSettings {
            rollback_clean_cycles: read_u32_env(
                "GENGUARD_ROLLBACK_RETENTION_CYCLES",
                RetentionSettings::default().rollback_clean_cycles,
            ),
            mode: read_retention_mode("GENGUARD_RETENTION_MODE"),
        };

        let lock_stale_after_secs =
            Some(read_u64_env("GENGUARD_LOCK_STALE_AFTER_SECS", 900)).filter(|value| *value > 0);

        Ok(Self {
            state_dir,
            trusted_public_keys,
            require_monotonic_version: read_bool_env("GENGUARD_REQUIRE_MONOTONIC_VERSION", true),
            ledger,
            monitor,
            retention,
            reload_command: read_args_env("GENGUARD_RELOAD_COMMAND"),
            lock_stale_after_secs,
            auto_recover_stale_lock: read_bool_env("GENGUARD_AUTO_RECOVER_STALE_LOCK", true),
            update_token_sha256: read_non_empty_env("GENGUARD_UPDATE_TOKEN_SHA256")
                .map(|value| value.to_ascii_lowercase()),
            quarantine_token_sha256: read_non_empty_env("GENGUARD_QUARANTINE_TOKEN_SHA256")
                .map(|value| value.to_ascii_lowercase()),
            otlp_endpoint: read_non_empty_env("GENGUARD_OTEL_EXPORTER_OTLP_ENDPOINT")
                .or_else(|| read_non_empty_env("OTEL_EXPORTER_OTLP_ENDPOINT")),
        })
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();

        if self.trusted_public_keys.is_empty() {
            warnings.push(
                "No trusted bundle key configured. Set GENGUARD_TRUSTED_PUBLIC_KEY or GENGUARD_TRUSTED_PUBLIC_KEYS; every bundle will fail signature checks"
                    .to_string(),
            );
        }
        for (key_id, key) in &self.trusted_public_keys {
            if !is_valid_ed25519_key_material(key) {
                warnings.push(format!(
                    "Trusted key '{}' must be base64 or 64-character hex Ed25519 public key",
                    key_id
                ));
            }
        }
        if self.ledger.require_signed && self.ledger.signing_key.is_none() {
            warnings.push(
                "GENGUARD_REQUIRE_SIGNED_LEDGER=true but GENGUARD_LEDGER_SIGNING_KEY is missing; appends will fail"
                    .to_string(),
            );
        }
        if self
            .ledger
            .signing_key
            .as_ref()
            .is_some_and(|key| key.chars().count() < 16)
        {
            warnings.push(
                "GENGUARD_LEDGER_SIGNING_KEY is short; use at least 16 characters".to_string(),
            );
        }
        if self.ledger.signing_key_id.is_some() && self.ledger.signing_key.is_none() {
            warnings.push(
                "GENGUARD_LEDGER_SIGNING_KEY_ID is set but GENGUARD_LEDGER_SIGNING_KEY is missing"
                    .to_string(),
            );
        }
        if self.retention.rollback_clean_cycles == 0 {
            warnings.push(
                "GENGUARD_ROLLBACK_RETENTION_CYCLES is 0; the rollback target is retired after the first clean cycle"
                    .to_string(),
            );
        }
        if self.monitor.retry_max_backoff_ms < self.monitor.retry_backoff_ms {
            warnings.push(
                "GENGUARD_MONITOR_RETRY_MAX_BACKOFF_MS should be >= GENGUARD_MONITOR_RETRY_BACKOFF_MS"
                    .to_string(),
            );
        }
        if self.monitor.baseline_scan_every.is_none() {
            warnings.push(
                "GENGUARD_MONITOR_BASELINE_SCAN_EVERY is 0/disabled; unlisted artifacts will not be detected"
                    .to_string(),
            );
        }
        if !self.require_monotonic_version {
            warnings.push(
                "GENGUARD_REQUIRE_MONOTONIC_VERSION=false; older bundles can be staged over newer ones"
                    .to_string(),
            );
        }
        if self.auto_recover_stale_lock && self.lock_stale_after_secs.is_none() {
            warnings.push(
                "GENGUARD_AUTO_RECOVER_STALE_LOCK=true but GENGUARD_LOCK_STALE_AFTER_SECS is 0/disabled"
                    .to_string(),
            );
        }
        for (name, digest) in [
            ("GENGUARD_UPDATE_TOKEN_SHA256", &self.update_token_sha256),
            (
                "GENGUARD_QUARANTINE_TOKEN_SHA256",
                &self.quarantine_token_sha256,
            ),
        ] {
            if digest
                .as_ref()
                .is_some_and(|value| value.len() != 64 || !value.chars().all(|ch| ch.is_ascii_hexdigit()))
            {
                warnings.push(format!(
                    "{} must be a 64-character SHA-256 hex string",
                    name
                ));
            }
        }
        if self.update_token_sha256.is_some()
            && self.update_token_sha256 == self.quarantine_token_sha256
        {
            warnings.push(
                "Update and quarantine-clear tokens are identical; use distinct credentials per scope"
                    .to_string(),
            );
        }

        DoctorReport {
            state_dir: self.state_dir.clone(),
            trusted_key_ids: self
                .trusted_public_keys
                .iter()
                .map(|(key_id, _)| key_id.clone())
                .collect(),
            ledger_signing_enabled: self.ledger.signing_key.is_some(),
            monitor_interval_secs: self.monitor.interval_secs,
            rollback_clean_cycles: self.retention.rollback_clean_cycles,
            retention_mode: self.retention.mode,
            reload_command_configured: !self.reload_command.is_empty(),
            warnings,
        }
    }
}

impl RetentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remove => "remove",
            Self::Keep => "keep",
        }
    }
}

fn parse_keyring(raw: &str) -> Vec<(String, String)> {
    let mut keys = Vec::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key_id, key) = match entry.split_once('=') {
            Some((key_id, key)) => (key_id.trim(), key.trim()),
            None => ("default", entry),
        };
        if key_id.is_empty() || key.is_empty() {
            continue;
        }
        keys.push((key_id.to_string(), key.to_string()));
    }
    keys
}

fn push_unique_key(keys: &mut Vec<(String, String)>, key_id: String, key: String) {
    if let Some(existing) = keys
        .iter_mut()
        .find(|(existing_id, _)| existing_id.eq_ignore_ascii_case(&key_id))
    {
        existing.1 = key;
    } else {
        keys.push((key_id, key));
    }
}

fn is_valid_ed25519_key_material(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.len() == 64 && trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return true;
    }

    decode_base64(trimmed).is_ok_and(|decoded| decoded.len() == 32)
}

fn decode_base64(value: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::general_purpose;
    use base64::Engine as _;

    general_purpose::STANDARD
        .decode(value)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(value))
        .or_else(|_| general_purpose::URL_SAFE.decode(value))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(value))
}

fn read_retention_mode(key: &str) -> RetentionMode {
    match read_non_empty_env(key)
        .map(|value| value.to_ascii_lowercase())
        .as_deref()
    {
        Some("keep") | Some("noop") | Some("none") => RetentionMode::Keep,
        _ => RetentionMode::Remove,
    }
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_u32_env(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn read_args_env(key: &str) -> Vec<String> {
    let Some(value) = env::var(key).ok() else {
        return Vec::new();
    };

    value
        .split_whitespace()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_keyring;

    #[test]
    fn keyring_parses_ids_and_bare_keys() {
        let keys = parse_keyring("release=abcd; ;ffff;=skip;rotated= 0102 ");
        assert_eq!(
            keys,
            vec![
                ("release".to_string(), "abcd".to_string()),
                ("default".to_string(), "ffff".to_string()),
                ("rotated".to_string(), "0102".to_string()),
            ]
        );
    }
}
