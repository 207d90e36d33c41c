use std::fmt::{Display, Formatter};

use sha2::{Digest, Sha256};

use crate::error::{LifecycleError, LifecycleResult};

/// Operator actions that are authorized independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScope {
    Update,
    QuarantineClear,
}

impl AuthScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::QuarantineClear => "quarantine_clear",
        }
    }
}

impl Display for AuthScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token check per scope. Only SHA-256 digests of tokens are configured; a
/// scope without a digest is open.
#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    update_token_sha256: Option<String>,
    quarantine_token_sha256: Option<String>,
}

impl Authorizer {
    pub fn new(
        update_token_sha256: Option<String>,
        quarantine_token_sha256: Option<String>,
    ) -> Self {
        Self {
            update_token_sha256: update_token_sha256.map(|value| value.trim().to_ascii_lowercase()),
            quarantine_token_sha256: quarantine_token_sha256
                .map(|value| value.trim().to_ascii_lowercase()),
        }
    }

    pub fn authorize(&self, scope: AuthScope, token: Option<&str>) -> LifecycleResult<()> {
        let Some(expected) = self.digest_for(scope) else {
            return Ok(());
        };
        let Some(token) = token.map(str::trim).filter(|value| !value.is_empty()) else {
            return Err(LifecycleError::Unauthorized {
                scope: scope.to_string(),
                reason: "a token is required (--token)".to_string(),
            });
        };
        let presented = token_digest(token);
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            return Err(LifecycleError::Unauthorized {
                scope: scope.to_string(),
                reason: "token does not match this scope".to_string(),
            });
        }
        Ok(())
    }

    fn digest_for(&self, scope: AuthScope) -> Option<&str> {
        match scope {
            AuthScope::Update => self.update_token_sha256.as_deref(),
            AuthScope::QuarantineClear => self.quarantine_token_sha256.as_deref(),
        }
        .filter(|value| !value.is_empty())
    }
}

pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    lhs.iter()
        .zip(rhs.iter())
        .fold(0u8, |acc, (left, right)| acc | (left ^ right))
        == 0
}
