use std::fs;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{LifecycleError, LifecycleResult};

/// Digest and byte length of one file as observed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub sha256: String,
    pub size: u64,
}

/// Capabilities the verifier needs from a cryptographic/scanning backend.
///
/// The core never inspects key material or walks trees itself, so tests can
/// script every answer.
pub trait VerificationBackend: Send + Sync {
    /// Checks a detached signature over the exact manifest bytes.
    fn verify_signature(
        &self,
        manifest: &[u8],
        signature: &[u8],
        key_id: Option<&str>,
    ) -> LifecycleResult<()>;

    fn content_hash(&self, path: &Path) -> io::Result<ContentDigest>;

    /// Lists every regular file or link below `root` as a `/`-separated
    /// relative path, sorted.
    fn baseline_scan(&self, root: &Path) -> io::Result<Vec<String>>;
}

pub struct Ed25519Backend {
    keys: Vec<(String, VerifyingKey)>,
}

impl Ed25519Backend {
    pub fn from_key_material(keys: &[(String, String)]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(keys.len());
        for (key_id, raw) in keys {
            let key = parse_ed25519_public_key(raw)
                .with_context(|| format!("invalid trusted public key '{}'", key_id))?;
            parsed.push((key_id.clone(), key));
        }
        Ok(Self { keys: parsed })
    }
}

impl VerificationBackend for Ed25519Backend {
    fn verify_signature(
        &self,
        manifest: &[u8],
        signature: &[u8],
        key_id: Option<&str>,
    ) -> LifecycleResult<()> {
        if self.keys.is_empty() {
            return Err(LifecycleError::SignatureInvalid {
                reason: "no trusted public key is configured".to_string(),
            });
        }
        let signature = parse_ed25519_signature(signature).map_err(|err| {
            LifecycleError::SignatureInvalid {
                reason: err.to_string(),
            }
        })?;

        let key_id = key_id.map(str::trim).filter(|value| !value.is_empty());
        let candidates = match key_id {
            Some(key_id) => {
                let matched = self
                    .keys
                    .iter()
                    .filter(|(id, _)| id.eq_ignore_ascii_case(key_id))
                    .collect::<Vec<_>>();
                if matched.is_empty() {
                    return Err(LifecycleError::SignatureInvalid {
                        reason: format!("manifest key id '{}' is not trusted", key_id),
                    });
                }
                matched
            }
            None => self.keys.iter().collect(),
        };

        if candidates
            .iter()
            .any(|(_, key)| key.verify(manifest, &signature).is_ok())
        {
            return Ok(());
        }
        Err(LifecycleError::SignatureInvalid {
            reason: "manifest signature verification failed".to_string(),
        })
    }

    fn content_hash(&self, path: &Path) -> io::Result<ContentDigest> {
        compute_sha256(path)
    }

    fn baseline_scan(&self, root: &Path) -> io::Result<Vec<String>> {
        let mut found = Vec::new();
        scan_dir(root, root, &mut found)?;
        found.sort();
        Ok(found)
    }
}

pub fn compute_sha256(path: &Path) -> io::Result<ContentDigest> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok(ContentDigest {
        sha256: format!("{:x}", hasher.finalize()),
        size,
    })
}

fn scan_dir(root: &Path, dir: &Path, found: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            scan_dir(root, &path, found)?;
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        let parts = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        found.push(parts.join("/"));
    }
    Ok(())
}

pub fn parse_ed25519_public_key(raw: &str) -> Result<VerifyingKey> {
    let bytes = decode_hex_or_base64(raw)?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("Ed25519 public key must decode to 32 bytes"))?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|_| anyhow!("invalid Ed25519 public key bytes"))
}

fn parse_ed25519_signature(raw: &[u8]) -> Result<Signature> {
    if raw.len() == 64 {
        let signature_bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| anyhow!("invalid Ed25519 signature bytes"))?;
        return Ok(Signature::from_bytes(&signature_bytes));
    }

    let text = std::str::from_utf8(raw)
        .context("manifest signature must be UTF-8 text or 64-byte raw signature")?
        .trim();
    if text.is_empty() {
        return Err(anyhow!("manifest signature file is empty"));
    }

    let decoded = decode_hex_or_base64(text)?;
    let signature_bytes: [u8; 64] = decoded
        .try_into()
        .map_err(|_| anyhow!("Ed25519 signature must decode to 64 bytes"))?;
    Ok(Signature::from_bytes(&signature_bytes))
}

pub(crate) fn decode_hex_or_base64(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("value is empty"));
    }
    if trimmed.len() % 2 == 0 && trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return decode_hex_string(trimmed);
    }

    general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|_| anyhow!("value must be base64 or hex encoded"))
}

fn decode_hex_string(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(anyhow!("hex value length must be even"));
    }

    let mut out = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| anyhow!("value must contain valid hexadecimal characters"))?;
        out.push(byte);
    }
    Ok(out)
}

pub(crate) fn to_lower_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<String>()
}
