use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::backend::VerificationBackend;
use crate::bundle::{
    manifest_digest, Bundle, Manifest, ManifestEntry, MANIFEST_FILE, SIGNATURE_FILE,
};
use crate::error::{LifecycleError, LifecycleResult};
use crate::generation::{Generation, GenerationStore};
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    HashMismatch,
    SizeMismatch,
    Missing,
    Unlisted,
    Unreadable,
    ManifestAltered,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HashMismatch => "hash_mismatch",
            Self::SizeMismatch => "size_mismatch",
            Self::Missing => "missing",
            Self::Unlisted => "unlisted",
            Self::Unreadable => "unreadable",
            Self::ManifestAltered => "manifest_altered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub path: String,
    pub detail: String,
}

impl Violation {
    /// Stable identity used to record each distinct violation once.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.kind.as_str(), self.path, self.detail)
    }

    pub fn into_error(self) -> LifecycleError {
        match self.kind {
            ViolationKind::HashMismatch | ViolationKind::SizeMismatch => {
                LifecycleError::HashMismatch {
                    path: self.path,
                    detail: self.detail,
                }
            }
            ViolationKind::Missing | ViolationKind::Unlisted | ViolationKind::ManifestAltered => {
                LifecycleError::ManifestCorrupt {
                    reason: format!("'{}' {}", self.path, self.detail),
                }
            }
            ViolationKind::Unreadable => LifecycleError::TransientIo {
                path: self.path,
                message: self.detail,
            },
        }
    }

    /// Error-taxonomy name recorded as the rollback reason.
    pub fn reason_kind(&self) -> &'static str {
        match self.kind {
            ViolationKind::HashMismatch | ViolationKind::SizeMismatch => "HashMismatch",
            ViolationKind::Missing
            | ViolationKind::Unlisted
            | ViolationKind::ManifestAltered => "ManifestCorrupt",
            ViolationKind::Unreadable => "TransientIOError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationResult {
    Valid,
    Invalid(Violation),
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// A bundle whose signature and content have been checked. Only the
/// verifier constructs one, so staging can demand proof of verification.
#[derive(Debug, Clone)]
pub struct VerifiedBundle {
    bundle: Bundle,
    manifest: Manifest,
    manifest_bytes: Vec<u8>,
    signature: Vec<u8>,
    manifest_sha256: String,
}

impl VerifiedBundle {
    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn manifest_sha256(&self) -> &str {
        &self.manifest_sha256
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleVerifyReport {
    pub bundle: String,
    pub version: String,
    pub manifest_sha256: String,
    pub key_id: Option<String>,
    pub artifact_count: usize,
    pub total_bytes: u64,
}

impl From<&VerifiedBundle> for BundleVerifyReport {
    fn from(value: &VerifiedBundle) -> Self {
        Self {
            bundle: value.bundle.root().display().to_string(),
            version: value.manifest.version.clone(),
            manifest_sha256: value.manifest_sha256.clone(),
            key_id: value.manifest.key_id.clone(),
            artifact_count: value.manifest.artifacts.len(),
            total_bytes: value.manifest.total_bytes(),
        }
    }
}

pub struct Verifier {
    backend: Arc<dyn VerificationBackend>,
}

impl Verifier {
    pub fn new(backend: Arc<dyn VerificationBackend>) -> Self {
        Self { backend }
    }

    /// Pure check of an incoming bundle: signature first, then presence of
    /// every listed artifact, then content hashes in manifest order.
    #[instrument(skip(self, bundle), fields(bundle = %bundle.root().display()))]
    pub fn verify(&self, bundle: &Bundle) -> LifecycleResult<VerifiedBundle> {
        let started = Instant::now();
        let result = self.verify_inner(bundle);
        let outcome = match &result {
            Ok(_) => "valid",
            Err(err) => err.kind(),
        };
        observability::record_verification("bundle", outcome, started.elapsed());
        result
    }

    fn verify_inner(&self, bundle: &Bundle) -> LifecycleResult<VerifiedBundle> {
        let manifest_bytes = bundle.read_manifest_bytes()?;
        let signature_path = bundle.signature_path();
        let signature = match fs::read(&signature_path) {
            Ok(signature) => signature,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(LifecycleError::SignatureInvalid {
                    reason: format!("detached signature {} is missing", signature_path.display()),
                })
            }
            Err(err) => {
                return Err(LifecycleError::SignatureInvalid {
                    reason: format!(
                        "failed reading signature {}: {}",
                        signature_path.display(),
                        err
                    ),
                })
            }
        };

        let key_id = peek_key_id(&manifest_bytes);
        self.backend
            .verify_signature(&manifest_bytes, &signature, key_id.as_deref())?;

        let manifest = Manifest::parse(&manifest_bytes)?;

        for path in manifest.artifacts.keys() {
            let artifact = bundle.artifact_path(path);
            if !artifact.is_file() {
                return Err(LifecycleError::ManifestCorrupt {
                    reason: format!("manifest references '{}' which is absent from the bundle", path),
                });
            }
        }

        for (path, expected) in &manifest.artifacts {
            let observed = self
                .backend
                .content_hash(&bundle.artifact_path(path))
                .map_err(|err| LifecycleError::TransientIo {
                    path: path.clone(),
                    message: err.to_string(),
                })?;
            if let Some(violation) = compare_digest(path, expected, &observed) {
                return Err(violation.into_error());
            }
        }

        debug!(version = %manifest.version, artifacts = manifest.artifacts.len(), "bundle verified");
        let manifest_sha256 = manifest_digest(&manifest_bytes);
        Ok(VerifiedBundle {
            bundle: bundle.clone(),
            manifest,
            manifest_bytes,
            signature,
            manifest_sha256,
        })
    }

    /// Loads the manifest stored beside a generation and proves it is the
    /// one authenticated at staging: its digest must equal the recorded one
    /// and its detached signature must still verify. A missing or altered
    /// manifest comes back as a violation; other read failures are
    /// `TransientIo`.
    pub fn sealed_manifest(
        &self,
        store: &GenerationStore,
        generation: &Generation,
    ) -> LifecycleResult<Result<Manifest, Violation>> {
        let altered = |path: &str, detail: String| Violation {
            kind: ViolationKind::ManifestAltered,
            path: path.to_string(),
            detail,
        };

        let Some(manifest_bytes) = read_stored(&store.manifest_path(&generation.version))? else {
            return Ok(Err(altered(
                MANIFEST_FILE,
                "stored manifest is missing".to_string(),
            )));
        };
        let digest = manifest_digest(&manifest_bytes);
        if !digest.eq_ignore_ascii_case(&generation.manifest_sha256) {
            return Ok(Err(altered(
                MANIFEST_FILE,
                format!(
                    "stored manifest sha256 {} differs from {} recorded at staging",
                    digest, generation.manifest_sha256
                ),
            )));
        }

        let Some(signature) = read_stored(&store.signature_path(&generation.version))? else {
            return Ok(Err(altered(
                SIGNATURE_FILE,
                "stored signature is missing".to_string(),
            )));
        };
        let key_id = peek_key_id(&manifest_bytes);
        if let Err(err) = self
            .backend
            .verify_signature(&manifest_bytes, &signature, key_id.as_deref())
        {
            return Ok(Err(altered(
                SIGNATURE_FILE,
                format!("stored signature no longer verifies: {}", err),
            )));
        }

        Ok(Manifest::parse(&manifest_bytes)
            .map_err(|err| altered(MANIFEST_FILE, err.to_string())))
    }

    /// Re-hashes a deployed generation in place against its stored manifest.
    /// A missing artifact is a violation; any other read failure is returned
    /// as `TransientIo` so the caller can retry.
    #[instrument(skip(self, generation, manifest), fields(version = %generation.version))]
    pub fn verify_live(
        &self,
        generation: &Generation,
        manifest: &Manifest,
    ) -> LifecycleResult<VerificationResult> {
        let started = Instant::now();
        let result = self.verify_live_inner(&generation.location, manifest);
        let outcome = match &result {
            Ok(VerificationResult::Valid) => "valid",
            Ok(VerificationResult::Invalid(violation)) => violation.kind.as_str(),
            Err(err) => err.kind(),
        };
        observability::record_verification("live", outcome, started.elapsed());
        result
    }

    fn verify_live_inner(
        &self,
        location: &Path,
        manifest: &Manifest,
    ) -> LifecycleResult<VerificationResult> {
        for (path, expected) in &manifest.artifacts {
            let observed = match self.backend.content_hash(&location.join(path)) {
                Ok(observed) => observed,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Ok(VerificationResult::Invalid(Violation {
                        kind: ViolationKind::Missing,
                        path: path.clone(),
                        detail: "listed artifact is missing from the live tree".to_string(),
                    }));
                }
                Err(err) => {
                    return Err(LifecycleError::TransientIo {
                        path: path.clone(),
                        message: err.to_string(),
                    })
                }
            };
            if let Some(violation) = compare_digest(path, expected, &observed) {
                return Ok(VerificationResult::Invalid(violation));
            }
        }
        Ok(VerificationResult::Valid)
    }

    /// Full-tree walk that flags files present in the live tree but absent
    /// from the manifest.
    pub fn baseline_scan(
        &self,
        generation: &Generation,
        manifest: &Manifest,
    ) -> LifecycleResult<VerificationResult> {
        let found = self
            .backend
            .baseline_scan(&generation.location)
            .map_err(|err| LifecycleError::TransientIo {
                path: generation.location.display().to_string(),
                message: err.to_string(),
            })?;
        let unlisted = found
            .into_iter()
            .find(|path| !manifest.artifacts.contains_key(path));
        Ok(match unlisted {
            Some(path) => VerificationResult::Invalid(Violation {
                kind: ViolationKind::Unlisted,
                path,
                detail: "file is present in the live tree but not listed in the manifest"
                    .to_string(),
            }),
            None => VerificationResult::Valid,
        })
    }
}

fn read_stored(path: &Path) -> LifecycleResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LifecycleError::TransientIo {
            path: path.display().to_string(),
            message: err.to_string(),
        }),
    }
}

fn compare_digest(
    path: &str,
    expected: &ManifestEntry,
    observed: &crate::backend::ContentDigest,
) -> Option<Violation> {
    if !expected.sha256.eq_ignore_ascii_case(&observed.sha256) {
        return Some(Violation {
            kind: ViolationKind::HashMismatch,
            path: path.to_string(),
            detail: format!(
                "expected sha256 {}, found {}",
                expected.sha256.to_ascii_lowercase(),
                observed.sha256
            ),
        });
    }
    if expected.size != observed.size {
        return Some(Violation {
            kind: ViolationKind::SizeMismatch,
            path: path.to_string(),
            detail: format!("expected {} bytes, found {}", expected.size, observed.size),
        });
    }
    None
}

/// The key id is needed before the manifest is authenticated, so it is read
/// leniently and only used to pick a candidate key.
fn peek_key_id(manifest_bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(manifest_bytes)
        .ok()
        .and_then(|value| {
            value
                .get("key_id")
                .and_then(|key_id| key_id.as_str())
                .map(ToString::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{to_lower_hex, ContentDigest, Ed25519Backend};
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::BTreeMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_bundle(root: &Path, signing: &SigningKey, files: &[(&str, &str)]) -> Manifest {
        let mut artifacts = BTreeMap::new();
        for (path, contents) in files {
            let target = root.join("payload").join(path);
            fs::create_dir_all(target.parent().expect("parent")).expect("mkdir");
            fs::write(&target, contents).expect("write artifact");
            artifacts.insert(
                path.to_string(),
                ManifestEntry {
                    sha256: manifest_digest(contents.as_bytes()),
                    size: contents.len() as u64,
                },
            );
        }
        let manifest = Manifest {
            version: "1.0.0".to_string(),
            created_at: None,
            key_id: Some("release".to_string()),
            artifacts,
        };
        let raw = serde_json::to_vec_pretty(&manifest).expect("encode");
        fs::write(root.join("manifest.json"), &raw).expect("write manifest");
        let signature = signing.sign(&raw).to_bytes();
        fs::write(root.join("manifest.sig"), to_lower_hex(&signature)).expect("write sig");
        manifest
    }

    fn verifier(signing: &SigningKey) -> Verifier {
        let public = to_lower_hex(signing.verifying_key().as_bytes());
        let backend = Ed25519Backend::from_key_material(&[("release".to_string(), public)])
            .expect("backend");
        Verifier::new(Arc::new(backend))
    }

    #[test]
    fn flipped_byte_reports_hash_mismatch_on_that_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signing = SigningKey::from_bytes(&[3; 32]);
        write_bundle(
            dir.path(),
            &signing,
            &[("app.bin", "binary"), ("lib/core.so", "library")],
        );
        let verifier = verifier(&signing);
        let bundle = Bundle::open(dir.path()).expect("bundle");
        verifier.verify(&bundle).expect("clean bundle verifies");

        fs::write(dir.path().join("payload/lib/core.so"), b"librarz").expect("flip");
        match verifier.verify(&bundle).expect_err("tampered") {
            LifecycleError::HashMismatch { path, .. } => assert_eq!(path, "lib/core.so"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_signature_fails_before_manifest_is_trusted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signing = SigningKey::from_bytes(&[3; 32]);
        write_bundle(dir.path(), &signing, &[("app.bin", "binary")]);
        fs::remove_file(dir.path().join("manifest.sig")).expect("remove sig");

        let err = verifier(&signing)
            .verify(&Bundle::open(dir.path()).expect("bundle"))
            .expect_err("unsigned");
        assert!(matches!(err, LifecycleError::SignatureInvalid { .. }));
    }

    #[test]
    fn absent_artifact_is_manifest_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signing = SigningKey::from_bytes(&[3; 32]);
        write_bundle(dir.path(), &signing, &[("app.bin", "binary"), ("cfg.toml", "x=1")]);
        fs::remove_file(dir.path().join("payload/cfg.toml")).expect("remove");

        let err = verifier(&signing)
            .verify(&Bundle::open(dir.path()).expect("bundle"))
            .expect_err("absent");
        assert!(matches!(err, LifecycleError::ManifestCorrupt { .. }));
    }

    struct CountingBackend {
        hashes: AtomicUsize,
    }

    impl VerificationBackend for CountingBackend {
        fn verify_signature(&self, _: &[u8], _: &[u8], _: Option<&str>) -> LifecycleResult<()> {
            Err(LifecycleError::SignatureInvalid {
                reason: "scripted rejection".to_string(),
            })
        }

        fn content_hash(&self, _: &Path) -> io::Result<ContentDigest> {
            self.hashes.fetch_add(1, Ordering::SeqCst);
            Ok(ContentDigest {
                sha256: String::new(),
                size: 0,
            })
        }

        fn baseline_scan(&self, _: &Path) -> io::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn signature_is_checked_before_any_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signing = SigningKey::from_bytes(&[3; 32]);
        write_bundle(dir.path(), &signing, &[("app.bin", "binary")]);
        let backend = Arc::new(CountingBackend {
            hashes: AtomicUsize::new(0),
        });
        let verifier = Verifier::new(backend.clone());

        let err = verifier
            .verify(&Bundle::open(dir.path()).expect("bundle"))
            .expect_err("rejected");
        assert!(matches!(err, LifecycleError::SignatureInvalid { .. }));
        assert_eq!(backend.hashes.load(Ordering::SeqCst), 0);
    }

    fn stored_generation(
        store: &GenerationStore,
        bundle_root: &Path,
        manifest_raw: &[u8],
    ) -> Generation {
        fs::create_dir_all(store.generation_dir("1.0.0")).expect("generation dir");
        fs::write(store.manifest_path("1.0.0"), manifest_raw).expect("store manifest");
        fs::copy(
            bundle_root.join("manifest.sig"),
            store.signature_path("1.0.0"),
        )
        .expect("store signature");
        Generation {
            version: "1.0.0".to_string(),
            sequence: 1,
            status: crate::generation::GenerationStatus::Active,
            manifest_sha256: manifest_digest(manifest_raw),
            location: store.tree_dir("1.0.0"),
            artifact_count: 1,
            total_bytes: 6,
            staged_at: "2024-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
            status_note: None,
        }
    }

    #[test]
    fn rewritten_stored_manifest_is_a_violation_even_with_a_matching_record() {
        let bundle_dir = tempfile::tempdir().expect("tempdir");
        let state_dir = tempfile::tempdir().expect("tempdir");
        let signing = SigningKey::from_bytes(&[3; 32]);
        let manifest = write_bundle(bundle_dir.path(), &signing, &[("app.bin", "binary")]);
        let raw = fs::read(bundle_dir.path().join("manifest.json")).expect("read manifest");
        let store = GenerationStore::new(state_dir.path()).expect("store");
        let generation = stored_generation(&store, bundle_dir.path(), &raw);
        let verifier = verifier(&signing);

        let sealed = verifier
            .sealed_manifest(&store, &generation)
            .expect("readable")
            .expect("authentic manifest");
        assert_eq!(sealed, manifest);

        let mut forged = manifest.clone();
        forged.artifacts.insert(
            "app.bin".to_string(),
            ManifestEntry {
                sha256: manifest_digest(b"evil"),
                size: 4,
            },
        );
        let forged_raw = serde_json::to_vec_pretty(&forged).expect("encode");
        fs::write(store.manifest_path("1.0.0"), &forged_raw).expect("forge manifest");

        let violation = verifier
            .sealed_manifest(&store, &generation)
            .expect("readable")
            .expect_err("digest differs from staging");
        assert_eq!(violation.kind, ViolationKind::ManifestAltered);
        assert_eq!(violation.path, MANIFEST_FILE);
        assert_eq!(violation.reason_kind(), "ManifestCorrupt");

        let mut rewritten_record = generation.clone();
        rewritten_record.manifest_sha256 = manifest_digest(&forged_raw);
        let violation = verifier
            .sealed_manifest(&store, &rewritten_record)
            .expect("readable")
            .expect_err("signature does not cover the forgery");
        assert_eq!(violation.kind, ViolationKind::ManifestAltered);
        assert_eq!(violation.path, SIGNATURE_FILE);
    }

    #[test]
    fn missing_stored_manifest_is_a_violation() {
        let bundle_dir = tempfile::tempdir().expect("tempdir");
        let state_dir = tempfile::tempdir().expect("tempdir");
        let signing = SigningKey::from_bytes(&[3; 32]);
        write_bundle(bundle_dir.path(), &signing, &[("app.bin", "binary")]);
        let raw = fs::read(bundle_dir.path().join("manifest.json")).expect("read manifest");
        let store = GenerationStore::new(state_dir.path()).expect("store");
        let generation = stored_generation(&store, bundle_dir.path(), &raw);
        fs::remove_file(store.manifest_path("1.0.0")).expect("remove manifest");

        let violation = verifier(&signing)
            .sealed_manifest(&store, &generation)
            .expect("missing is not an I/O error")
            .expect_err("missing manifest");
        assert_eq!(violation.kind, ViolationKind::ManifestAltered);
        assert!(violation.detail.contains("missing"));
    }
}
