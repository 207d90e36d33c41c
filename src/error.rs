use thiserror::Error;

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_FAILURE: i32 = 1;
pub const EXIT_VERIFICATION_FAILURE: i32 = 2;
pub const EXIT_ACTIVATION_CONFLICT: i32 = 3;
pub const EXIT_ROLLBACK_UNAVAILABLE: i32 = 4;
pub const EXIT_LEDGER_CORRUPT: i32 = 5;
pub const EXIT_ACTIVATION_FAILED: i32 = 6;
pub const EXIT_UNAUTHORIZED: i32 = 7;

/// Every failure a lifecycle operation can report to its caller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("manifest signature invalid: {reason}")]
    SignatureInvalid { reason: String },

    #[error("artifact hash mismatch at '{path}': {detail}")]
    HashMismatch { path: String, detail: String },

    #[error("manifest corrupt: {reason}")]
    ManifestCorrupt { reason: String },

    #[error("bundle is not verified: {reason}")]
    UnverifiedBundle { reason: String },

    #[error("version {candidate} is not newer than active version {active}")]
    VersionRegression { candidate: String, active: String },

    #[error("activation conflict: {holder}")]
    ActivationConflict { holder: String },

    #[error("activation failed: {reason}")]
    ActivationFailed { reason: String },

    #[error("rollback unavailable: {reason}")]
    RollbackUnavailable { reason: String },

    #[error("ledger corrupt at entry {index}: {reason}")]
    LedgerCorrupt { index: usize, reason: String },

    #[error("transient I/O error at '{path}': {message}")]
    TransientIo { path: String, message: String },

    #[error("generation {version} not found")]
    GenerationNotFound { version: String },

    #[error("generation {version} is {status}; {reason}")]
    InvalidTransition {
        version: String,
        status: String,
        reason: String,
    },

    #[error("unauthorized for scope {scope}: {reason}")]
    Unauthorized { scope: String, reason: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Short stable name used in ledger payloads, metrics and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::ManifestCorrupt { .. } => "manifest_corrupt",
            Self::UnverifiedBundle { .. } => "unverified_bundle",
            Self::VersionRegression { .. } => "version_regression",
            Self::ActivationConflict { .. } => "activation_conflict",
            Self::ActivationFailed { .. } => "activation_failed",
            Self::RollbackUnavailable { .. } => "rollback_unavailable",
            Self::LedgerCorrupt { .. } => "ledger_corrupt",
            Self::TransientIo { .. } => "transient_io",
            Self::GenerationNotFound { .. } => "generation_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Storage(_) => "storage",
        }
    }

    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid { .. }
                | Self::HashMismatch { .. }
                | Self::ManifestCorrupt { .. }
                | Self::UnverifiedBundle { .. }
                | Self::VersionRegression { .. }
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            _ if self.is_verification_failure() => EXIT_VERIFICATION_FAILURE,
            Self::ActivationConflict { .. } => EXIT_ACTIVATION_CONFLICT,
            Self::RollbackUnavailable { .. } => EXIT_ROLLBACK_UNAVAILABLE,
            Self::LedgerCorrupt { .. } => EXIT_LEDGER_CORRUPT,
            Self::ActivationFailed { .. } => EXIT_ACTIVATION_FAILED,
            Self::Unauthorized { .. } => EXIT_UNAUTHORIZED,
            _ => EXIT_GENERIC_FAILURE,
        }
    }
}
