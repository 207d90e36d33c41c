use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ed25519_dalek::{Signer, SigningKey};
use genguard::app::GenguardApp;
use genguard::config::Settings;
use genguard::error::LifecycleError;
use genguard::generation::{GenerationStatus, GenerationStore};
use genguard::ledger::LedgerEventKind;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn reset_genguard_env() {
    for key in [
        "GENGUARD_STATE_DIR",
        "GENGUARD_TRUSTED_PUBLIC_KEYS",
        "GENGUARD_TRUSTED_PUBLIC_KEY",
        "GENGUARD_TRUSTED_PUBLIC_KEY_ID",
        "GENGUARD_LEDGER_SIGNING_KEY",
        "GENGUARD_LEDGER_SIGNING_KEY_ID",
        "GENGUARD_REQUIRE_SIGNED_LEDGER",
        "GENGUARD_REQUIRE_MONOTONIC_VERSION",
        "GENGUARD_MONITOR_INTERVAL_SECS",
        "GENGUARD_MONITOR_RETRY_ATTEMPTS",
        "GENGUARD_MONITOR_RETRY_BACKOFF_MS",
        "GENGUARD_MONITOR_RETRY_MAX_BACKOFF_MS",
        "GENGUARD_MONITOR_BASELINE_SCAN_EVERY",
        "GENGUARD_ROLLBACK_RETENTION_CYCLES",
        "GENGUARD_RETENTION_MODE",
        "GENGUARD_RELOAD_COMMAND",
        "GENGUARD_LOCK_STALE_AFTER_SECS",
        "GENGUARD_AUTO_RECOVER_STALE_LOCK",
        "GENGUARD_UPDATE_TOKEN_SHA256",
        "GENGUARD_QUARANTINE_TOKEN_SHA256",
        "GENGUARD_OTEL_EXPORTER_OTLP_ENDPOINT",
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        "GENGUARD_ENV_FILE",
    ] {
        std::env::remove_var(key);
    }
}

fn to_lower_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<String>()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

struct Workspace {
    temp: tempfile::TempDir,
    signing: SigningKey,
}

impl Workspace {
    fn new(extra_env: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let signing = SigningKey::from_bytes(&[7; 32]);
        let env_file = temp.path().join(".env");
        fs::write(
            &env_file,
            format!(
                "GENGUARD_STATE_DIR={}\nGENGUARD_TRUSTED_PUBLIC_KEYS=release={}\nGENGUARD_MONITOR_RETRY_ATTEMPTS=0\n{}",
                temp.path().join("state").display(),
                to_lower_hex(signing.verifying_key().as_bytes()),
                extra_env
            ),
        )
        .expect("write env");
        std::env::set_var("GENGUARD_ENV_FILE", env_file.display().to_string());
        Self { temp, signing }
    }

    fn state_dir(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    fn app(&self) -> GenguardApp {
        let settings = Settings::load().expect("load settings");
        GenguardApp::new(settings).expect("new app")
    }

    fn bundle(&self, version: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.temp.path().join("bundles").join(version);
        write_bundle(&root, &self.signing, version, files);
        root
    }

    fn tree(&self, version: &str) -> PathBuf {
        self.state_dir().join("generations").join(version).join("tree")
    }
}

fn write_bundle(root: &Path, signing: &SigningKey, version: &str, files: &[(&str, &str)]) {
    let mut artifacts = serde_json::Map::new();
    for (path, contents) in files {
        let target = root.join("payload").join(path);
        fs::create_dir_all(target.parent().expect("parent")).expect("mkdir payload");
        fs::write(&target, contents).expect("write artifact");
        artifacts.insert(
            path.to_string(),
            json!({ "sha256": sha256_hex(contents.as_bytes()), "size": contents.len() }),
        );
    }
    let manifest = json!({
        "version": version,
        "key_id": "release",
        "artifacts": artifacts,
    });
    let raw = serde_json::to_vec_pretty(&manifest).expect("encode manifest");
    fs::write(root.join("manifest.json"), &raw).expect("write manifest");
    let signature = signing.sign(&raw).to_bytes();
    fs::write(root.join("manifest.sig"), to_lower_hex(&signature)).expect("write signature");
}

#[allow(clippy::permissions_set_readonly_false)]
fn overwrite_sealed(path: &Path, contents: &str) {
    let mut permissions = fs::metadata(path).expect("metadata").permissions();
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions).expect("unseal");
    fs::write(path, contents).expect("overwrite");
}

fn ledger_kinds(app: &GenguardApp) -> Vec<LedgerEventKind> {
    app.ledger_tail(usize::MAX)
        .expect("ledger tail")
        .into_iter()
        .map(|entry| entry.kind)
        .collect()
}

#[test]
fn update_activates_and_second_update_retains_rollback_target() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    let first = workspace.bundle("1.0.0", &[("app.bin", "one"), ("lib/core.so", "core-1")]);
    let report = app.update(&first, None, false).expect("first update");
    assert_eq!(report.generation.status, GenerationStatus::Active);
    assert_eq!(report.verification.version, "1.0.0");
    let transition = report.transition.expect("transition");
    assert_eq!(transition.active.as_deref(), Some("1.0.0"));
    assert_eq!(transition.rollback_target, None);

    let second = workspace.bundle("1.1.0", &[("app.bin", "two"), ("lib/core.so", "core-2")]);
    app.update(&second, None, false).expect("second update");

    let status = app.status().expect("status");
    assert_eq!(status.pointer.active.as_deref(), Some("1.1.0"));
    assert_eq!(status.pointer.rollback_target.as_deref(), Some("1.0.0"));
    assert_eq!(
        status.rollback_target.expect("rollback record").status,
        GenerationStatus::RollbackTarget
    );
    assert!(status.ledger.valid);
    let link = PathBuf::from(status.service_link.expect("service link"));
    assert_eq!(link, workspace.tree("1.1.0"));
    assert_eq!(
        fs::read_to_string(workspace.tree("1.1.0").join("app.bin")).expect("read live"),
        "two"
    );

    let kinds = ledger_kinds(&app);
    assert_eq!(
        kinds
            .iter()
            .filter(|kind| **kind == LedgerEventKind::Activated)
            .count(),
        2
    );
    app.ledger_verify().expect("ledger chain verifies");
}

#[test]
fn tampered_bundle_is_rejected_without_creating_a_generation() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    let bundle = workspace.bundle("1.0.0", &[("app.bin", "original")]);
    fs::write(bundle.join("payload").join("app.bin"), "originaL").expect("tamper");

    let err = app
        .update(&bundle, None, false)
        .expect_err("tampered bundle must fail");
    assert!(matches!(err, LifecycleError::HashMismatch { ref path, .. } if path == "app.bin"));
    assert_eq!(err.exit_code(), 2);
    assert!(app.generations().expect("generations").is_empty());
    assert_eq!(app.status().expect("status").pointer.active, None);
    assert_eq!(
        ledger_kinds(&app).last(),
        Some(&LedgerEventKind::VerificationFailed)
    );
}

#[test]
fn unsigned_bundle_is_rejected_as_signature_invalid() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    let bundle = workspace.bundle("1.0.0", &[("app.bin", "payload")]);
    fs::remove_file(bundle.join("manifest.sig")).expect("remove signature");

    let err = app
        .verify_bundle(&bundle)
        .expect_err("missing signature must fail");
    assert!(matches!(err, LifecycleError::SignatureInvalid { .. }));
}

#[test]
fn older_bundle_is_refused_as_version_regression() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    app.update(&workspace.bundle("2.0.0", &[("app.bin", "two")]), None, false)
        .expect("update 2.0.0");
    let err = app
        .update(&workspace.bundle("1.5.0", &[("app.bin", "old")]), None, false)
        .expect_err("older version must be refused");
    assert!(matches!(err, LifecycleError::VersionRegression { .. }));
    assert_eq!(err.exit_code(), 2);
    assert!(app.generations().expect("list").iter().all(|g| g.version != "1.5.0"));
}

#[test]
fn rollback_restores_previous_tree_byte_for_byte() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    app.update(
        &workspace.bundle("1.0.0", &[("app.bin", "stable"), ("etc/app.conf", "port=1")]),
        None,
        false,
    )
    .expect("update 1.0.0");
    app.update(
        &workspace.bundle("1.1.0", &[("app.bin", "broken"), ("etc/app.conf", "port=2")]),
        None,
        false,
    )
    .expect("update 1.1.0");

    let transition = app
        .rollback("operator saw errors", None)
        .expect("rollback");
    assert_eq!(transition.active.as_deref(), Some("1.0.0"));
    assert_eq!(transition.quarantined.as_deref(), Some("1.1.0"));

    let status = app.status().expect("status");
    assert_eq!(status.pointer.active.as_deref(), Some("1.0.0"));
    assert_eq!(status.pointer.rollback_target, None);
    let live = PathBuf::from(status.service_link.expect("link"));
    assert_eq!(fs::read(live.join("app.bin")).expect("read"), b"stable");
    assert_eq!(fs::read(live.join("etc/app.conf")).expect("read"), b"port=1");

    let generations = app.generations().expect("list");
    let failed = generations
        .iter()
        .find(|generation| generation.version == "1.1.0")
        .expect("1.1.0 record");
    assert_eq!(failed.status, GenerationStatus::Quarantined);
    assert_eq!(failed.status_note.as_deref(), Some("operator saw errors"));

    let err = app
        .rollback("again", None)
        .expect_err("no second rollback target");
    assert!(matches!(err, LifecycleError::RollbackUnavailable { .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(
        ledger_kinds(&app).last(),
        Some(&LedgerEventKind::RollbackFailed)
    );
}

#[test]
fn recover_swaps_rollback_target_and_refuses_retired_generations() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    for (version, body) in [("1.0.0", "a"), ("1.1.0", "b"), ("1.2.0", "c")] {
        app.update(&workspace.bundle(version, &[("app.bin", body)]), None, false)
            .expect("update");
    }

    let generations = app.generations().expect("list");
    let oldest = generations
        .iter()
        .find(|generation| generation.version == "1.0.0")
        .expect("1.0.0 record");
    assert_eq!(oldest.status, GenerationStatus::Retired);
    assert!(!workspace.tree("1.0.0").exists());

    let err = app
        .recover("1.0.0", None)
        .expect_err("retired generation is gone");
    assert!(matches!(err, LifecycleError::RollbackUnavailable { .. }));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(
        ledger_kinds(&app).last(),
        Some(&LedgerEventKind::RollbackFailed)
    );

    let transition = app.recover("1.1.0", None).expect("recover rollback target");
    assert_eq!(transition.kind, "recovered");
    assert_eq!(transition.active.as_deref(), Some("1.1.0"));
    assert_eq!(transition.rollback_target.as_deref(), Some("1.2.0"));

    let status = app.status().expect("status");
    assert_eq!(status.pointer.active.as_deref(), Some("1.1.0"));
    assert_eq!(status.pointer.rollback_target.as_deref(), Some("1.2.0"));
    assert_eq!(
        status.rollback_target.expect("target record").status,
        GenerationStatus::RollbackTarget
    );
}

#[test]
fn activation_conflicts_while_lock_is_held() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    app.update(&workspace.bundle("1.0.0", &[("app.bin", "a")]), None, true)
        .expect("stage 1.0.0");

    let held = app.activator().try_lock("test-holder").expect("take lock");
    let err = app
        .activate("1.0.0", None)
        .expect_err("lock is held elsewhere");
    match &err {
        LifecycleError::ActivationConflict { holder } => {
            assert!(holder.contains("test-holder"), "holder: {holder}")
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 3);
    let last = app
        .ledger_tail(1)
        .expect("ledger tail")
        .pop()
        .expect("conflict is recorded");
    assert_eq!(last.kind, LedgerEventKind::ActivationFailed);
    assert_eq!(last.payload["version"], "1.0.0");
    assert_eq!(last.payload["error"], "activation_conflict");

    let cycle = app.monitor_once().expect("monitor cycle");
    assert_eq!(cycle.outcome.as_str(), "deferred");

    drop(held);
    app.activate("1.0.0", None).expect("activate after release");
    assert!(!app.lock_status().expect("lock status").lock_exists);
}

#[test]
fn update_conflicts_while_lock_is_held_and_stages_nothing() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();
    let bundle = workspace.bundle("1.0.0", &[("app.bin", "a")]);

    let held = app.activator().try_lock("test-holder").expect("take lock");
    let err = app
        .update(&bundle, None, true)
        .expect_err("lock is held elsewhere");
    assert!(matches!(err, LifecycleError::ActivationConflict { .. }));
    assert!(app.generations().expect("generations").is_empty());
    let last = app
        .ledger_tail(1)
        .expect("ledger tail")
        .pop()
        .expect("conflict is recorded");
    assert_eq!(last.kind, LedgerEventKind::ActivationFailed);
    assert_eq!(last.payload["version"], "1.0.0");

    drop(held);
    app.update(&bundle, None, true).expect("update after release");
}

#[test]
fn concurrent_activations_admit_exactly_one_winner() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    app.update(&workspace.bundle("1.0.0", &[("app.bin", "a")]), None, true)
        .expect("stage 1.0.0");

    let activator = app.activator();
    let results = std::thread::scope(|scope| {
        let handles = (0..4)
            .map(|_| scope.spawn(|| activator.activate("1.0.0")))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect::<Vec<_>>()
    });

    let winners = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);
    for result in results.iter().filter_map(|result| result.as_ref().err()) {
        assert!(
            matches!(
                result,
                LifecycleError::ActivationConflict { .. } | LifecycleError::InvalidTransition { .. }
            ),
            "unexpected error: {result:?}"
        );
    }
    assert_eq!(
        app.status().expect("status").pointer.active.as_deref(),
        Some("1.0.0")
    );
}

#[test]
fn failed_pointer_commit_leaves_previous_generation_live() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    app.update(&workspace.bundle("1.0.0", &[("app.bin", "a")]), None, false)
        .expect("update 1.0.0");
    app.update(&workspace.bundle("1.1.0", &[("app.bin", "b")]), None, true)
        .expect("stage 1.1.0");
    let before = app.status().expect("status before");

    let blocker = workspace.state_dir().join("current.json.tmp");
    fs::create_dir_all(&blocker).expect("block tmp slot");

    let err = app
        .activate("1.1.0", None)
        .expect_err("pointer commit must fail");
    assert!(matches!(err, LifecycleError::ActivationFailed { .. }));
    assert_eq!(err.exit_code(), 6);

    let after = app.status().expect("status after");
    assert_eq!(after.pointer, before.pointer);
    assert_eq!(after.service_link, before.service_link);
    let staged = app
        .generations()
        .expect("list")
        .into_iter()
        .find(|generation| generation.version == "1.1.0")
        .expect("1.1.0 record");
    assert_eq!(staged.status, GenerationStatus::Staged);
    assert_eq!(
        ledger_kinds(&app).last(),
        Some(&LedgerEventKind::ActivationFailed)
    );

    fs::remove_dir_all(&blocker).expect("unblock");
    app.activate("1.1.0", None).expect("activate after unblock");
}

#[test]
fn record_write_failure_after_pointer_commit_still_completes_activation() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    app.update(&workspace.bundle("1.0.0", &[("app.bin", "a")]), None, false)
        .expect("update 1.0.0");
    app.update(&workspace.bundle("1.1.0", &[("app.bin", "b")]), None, true)
        .expect("stage 1.1.0");

    let blocker = workspace
        .state_dir()
        .join("generations")
        .join("1.0.0")
        .join("generation.json.tmp");
    fs::create_dir_all(&blocker).expect("block record tmp slot");

    let transition = app
        .activate("1.1.0", None)
        .expect("pointer commit decides the outcome");
    assert_eq!(transition.active.as_deref(), Some("1.1.0"));
    assert_eq!(transition.rollback_target.as_deref(), Some("1.0.0"));
    assert_eq!(
        ledger_kinds(&app).last(),
        Some(&LedgerEventKind::Activated)
    );
    let stale = app
        .generations()
        .expect("list")
        .into_iter()
        .find(|generation| generation.version == "1.0.0")
        .expect("1.0.0 record");
    assert_eq!(stale.status, GenerationStatus::Active);

    fs::remove_dir_all(&blocker).expect("unblock");
    let restarted = workspace.app();
    let repaired = restarted
        .generations()
        .expect("list")
        .into_iter()
        .find(|generation| generation.version == "1.0.0")
        .expect("1.0.0 record");
    assert_eq!(repaired.status, GenerationStatus::RollbackTarget);
    assert_eq!(
        restarted.status().expect("status").pointer.active.as_deref(),
        Some("1.1.0")
    );
}

#[test]
fn activation_rechecks_staged_tree_before_switching() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    app.update(&workspace.bundle("1.0.0", &[("app.bin", "a")]), None, true)
        .expect("stage 1.0.0");
    overwrite_sealed(&workspace.tree("1.0.0").join("app.bin"), "evil");

    let err = app
        .activate("1.0.0", None)
        .expect_err("tampered staged tree must not go live");
    assert!(matches!(err, LifecycleError::HashMismatch { .. }));
    assert_eq!(app.status().expect("status").pointer.active, None);
}

#[test]
fn startup_reconciles_interrupted_activation() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    {
        let app = workspace.app();
        app.update(&workspace.bundle("1.0.0", &[("app.bin", "a")]), None, false)
            .expect("update 1.0.0");
        app.update(&workspace.bundle("1.1.0", &[("app.bin", "b")]), None, true)
            .expect("stage 1.1.0");
    }

    let store = GenerationStore::new(workspace.state_dir().join("generations")).expect("store");
    store
        .set_status("1.1.0", GenerationStatus::Activating, None)
        .expect("simulate crash mid-activation");

    let app = workspace.app();
    let generations = app.generations().expect("list");
    let interrupted = generations
        .iter()
        .find(|generation| generation.version == "1.1.0")
        .expect("1.1.0 record");
    assert_eq!(interrupted.status, GenerationStatus::Staged);
    assert_eq!(
        app.status().expect("status").pointer.active.as_deref(),
        Some("1.0.0")
    );
    app.activate("1.1.0", None).expect("activation can be retried");
}

#[test]
fn update_token_is_required_when_configured() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new(&format!(
        "GENGUARD_UPDATE_TOKEN_SHA256={}\n",
        sha256_hex(b"deploy-secret")
    ));
    let app = workspace.app();
    let bundle = workspace.bundle("1.0.0", &[("app.bin", "a")]);

    let err = app
        .update(&bundle, None, false)
        .expect_err("token is required");
    assert!(matches!(err, LifecycleError::Unauthorized { .. }));
    assert!(err.to_string().contains("--token"));
    assert_eq!(err.exit_code(), 7);
    let denied = app
        .ledger_tail(1)
        .expect("ledger tail")
        .pop()
        .expect("denial is recorded");
    assert_eq!(denied.kind, LedgerEventKind::AuthorizationDenied);
    assert_eq!(denied.payload["operation"], "update");
    assert_eq!(denied.payload["scope"], "update");

    let err = app
        .update(&bundle, Some("wrong"), false)
        .expect_err("wrong token");
    assert!(matches!(err, LifecycleError::Unauthorized { .. }));
    assert!(app.generations().expect("list").is_empty());

    app.update(&bundle, Some("deploy-secret"), false)
        .expect("authorized update");
    let err = app
        .rollback("no token", None)
        .expect_err("rollback is update-scoped");
    assert!(matches!(err, LifecycleError::Unauthorized { .. }));
    assert_eq!(
        ledger_kinds(&app).last(),
        Some(&LedgerEventKind::AuthorizationDenied)
    );
}

#[test]
fn status_surfaces_ledger_tampering() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("GENGUARD_LEDGER_SIGNING_KEY=ledger-hmac-key-0123456789\n");
    let app = workspace.app();

    app.update(&workspace.bundle("1.0.0", &[("app.bin", "a")]), None, false)
        .expect("update 1.0.0");
    let report = app.ledger_verify().expect("clean chain");
    assert!(report.entries >= 3);
    assert_eq!(report.signed_entries, report.entries);

    let ledger_path = workspace.state_dir().join("ledger.jsonl");
    let raw = fs::read_to_string(&ledger_path).expect("read ledger");
    let mut lines = raw.lines().map(ToString::to_string).collect::<Vec<_>>();
    let mut entry: Value = serde_json::from_str(&lines[1]).expect("decode entry");
    entry["payload"]["forged"] = Value::Bool(true);
    lines[1] = serde_json::to_string(&entry).expect("encode entry");
    fs::write(&ledger_path, format!("{}\n", lines.join("\n"))).expect("rewrite ledger");

    let status = app.status().expect("status still answers");
    assert!(!status.ledger.valid);
    assert_eq!(status.ledger.corrupt_index, Some(1));
    assert_eq!(status.pointer.active.as_deref(), Some("1.0.0"));

    let err = app.ledger_verify().expect_err("tampered chain");
    assert!(matches!(err, LifecycleError::LedgerCorrupt { index: 1, .. }));
    assert_eq!(err.exit_code(), 5);
}

#[test]
fn non_utf8_ledger_byte_is_reported_as_ledger_corruption() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();
    app.update(&workspace.bundle("1.0.0", &[("app.bin", "a")]), None, false)
        .expect("update 1.0.0");

    let ledger_path = workspace.state_dir().join("ledger.jsonl");
    let mut raw = fs::read(&ledger_path).expect("read ledger");
    let second_line = raw
        .iter()
        .position(|byte| *byte == b'\n')
        .expect("first newline")
        + 1;
    raw[second_line + 1] = 0xFF;
    fs::write(&ledger_path, &raw).expect("rewrite ledger");

    let status = app.status().expect("status still answers");
    assert!(!status.ledger.valid);
    assert_eq!(status.ledger.corrupt_index, Some(1));

    let err = app.ledger_verify().expect_err("tampered chain");
    assert!(matches!(err, LifecycleError::LedgerCorrupt { index: 1, .. }));
    assert_eq!(err.exit_code(), 5);
}

#[test]
fn json_facade_wraps_reports_with_status() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
    reset_genguard_env();
    let workspace = Workspace::new("");
    let app = workspace.app();

    let bundle = workspace.bundle("1.0.0", &[("app.bin", "a")]);
    let staged: Value =
        serde_json::from_str(&app.update_json(&bundle, None, true).expect("update json"))
            .expect("parse update json");
    assert_eq!(staged["status"], "staged");
    assert_eq!(staged["report"]["generation"]["status"], "staged");

    let activated: Value =
        serde_json::from_str(&app.activate_json("1.0.0", None).expect("activate json"))
            .expect("parse activate json");
    assert_eq!(activated["status"], "activated");
    assert_eq!(activated["report"]["active"], "1.0.0");

    let verified: Value =
        serde_json::from_str(&app.verify_active_json().expect("verify json")).expect("parse");
    assert_eq!(verified["status"], "valid");
    assert_eq!(verified["report"]["result"]["status"], "valid");
}
