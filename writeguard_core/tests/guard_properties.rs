#![cfg(unix)]

use chrono::Utc;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use writeguard_core::{
    AuditAction, GrantStatus, GuardConfig, GuardError, LivenessState, ManualClock,
    PermissionLedger, ProtectionGate,
};

/// Rejects successful `GRANTED` rows so the grant commit fails while failure
/// rows can still be written.
const REJECT_GRANTS: &str = "
CREATE TRIGGER reject_grants BEFORE INSERT ON access_log
WHEN NEW.action = 'GRANTED' AND NEW.success = 1
BEGIN SELECT RAISE(ABORT, 'audit store unavailable'); END;
";

struct Harness {
    dir: TempDir,
    root: PathBuf,
    clock: Arc<ManualClock>,
    gate: Arc<ProtectionGate>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness() -> Harness {
    harness_with_ledger(|_| PermissionLedger::in_memory().unwrap())
}

/// A harness whose ledger lives in `<tmp>/ledger.db`, outside the protected
/// root, so tests can reach it through a second connection.
fn file_backed_harness() -> (Harness, PathBuf) {
    let mut db = PathBuf::new();
    let h = harness_with_ledger(|dir| {
        db = dir.join("ledger.db");
        PermissionLedger::open(&db).unwrap()
    });
    (h, db)
}

fn harness_with_ledger(open: impl FnOnce(&Path) -> PermissionLedger) -> Harness {
    init_tracing();

    let dir = tempdir().unwrap();
    let root = dir.path().join("project");
    fs::create_dir_all(root.join("src/nested")).unwrap();
    fs::create_dir_all(root.join(".git")).unwrap();
    for (name, body) in [
        ("Cargo.toml", "[package]"),
        ("src/lib.rs", "pub mod nested;"),
        ("src/nested/mod.rs", "pub fn f() {}"),
        (".git/HEAD", "ref: refs/heads/main"),
    ] {
        let path = root.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();
    }

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let gate = ProtectionGate::with_parts(
        GuardConfig::with_roots([&root]),
        open(dir.path()),
        clock.clone(),
    )
    .unwrap();

    Harness {
        dir,
        root,
        clock,
        gate: Arc::new(gate),
    }
}

fn write_bits(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o222
}

#[test]
fn default_deny_after_initialization() {
    let h = harness();
    for name in ["Cargo.toml", "src/lib.rs", "src/nested/mod.rs"] {
        assert_eq!(write_bits(&h.root.join(name)), 0, "{} is writable", name);
    }
    // VCS metadata is left alone
    assert_eq!(write_bits(&h.root.join(".git/HEAD")), 0o222);
    assert_eq!(h.gate.liveness(), LivenessState::Lockdown);
}

#[test]
fn grant_round_trip() {
    let h = harness();
    let file = h.root.join("src/lib.rs");
    h.gate.heartbeat();

    assert!(h
        .gate
        .grant_permission(&file, "T1", "agentX", Some(Duration::from_secs(300)))
        .unwrap());
    assert_eq!(write_bits(&file), 0o200);

    let decision = h.gate.check_permission(&file);
    assert!(decision.allowed);
    assert_eq!(decision.task_id.as_deref(), Some("T1"));
    assert_eq!(decision.agent.as_deref(), Some("agentX"));
    let expires_in = decision.expires_in.unwrap();
    assert!((299..=300).contains(&expires_in));

    let status = h.gate.get_status();
    assert!(status.monitoring_active);
    assert_eq!(status.active_permissions, 1);
    assert_eq!(status.permissions[0].task_id, "T1");
}

#[test]
fn expiry_relocks_file() {
    let h = harness();
    let file = h.root.join("src/lib.rs");
    h.gate.heartbeat();
    h.gate
        .grant_permission(&file, "T1", "agentX", Some(Duration::from_secs(1)))
        .unwrap();

    h.clock.advance(chrono::Duration::seconds(2));
    assert!(!h.gate.check_permission(&file).allowed);
    assert_eq!(write_bits(&file), 0);

    let events = h
        .gate
        .ledger()
        .events_for_path(&file.canonicalize().unwrap())
        .unwrap();
    assert_eq!(events.last().unwrap().action, AuditAction::Expired);
}

#[test]
fn scope_pass_through() {
    let h = harness();
    let outside = h.dir.path().join("scratch.txt");
    fs::write(&outside, "notes").unwrap();
    fs::set_permissions(&outside, fs::Permissions::from_mode(0o644)).unwrap();

    let events_before = h.gate.ledger().event_count().unwrap();
    h.gate.heartbeat();
    assert!(h.gate.grant_permission(&outside, "T1", "agentX", None).unwrap());

    assert_eq!(h.gate.ledger().event_count().unwrap(), events_before);
    assert_eq!(
        fs::metadata(&outside).unwrap().permissions().mode() & 0o777,
        0o644
    );
    assert_eq!(h.gate.get_status().active_permissions, 0);
}

#[test]
fn liveness_lockdown_relocks_granted_files() {
    let h = harness();
    let lib = h.root.join("src/lib.rs");
    let manifest = h.root.join("Cargo.toml");
    h.gate.heartbeat();
    h.gate.grant_permission(&lib, "T1", "agentX", None).unwrap();
    h.gate.grant_permission(&manifest, "T2", "agentY", None).unwrap();

    h.clock.advance(chrono::Duration::seconds(31));
    let report = h.gate.check_liveness().unwrap();
    assert_eq!(report.grants_cleared, 2);

    let status = h.gate.get_status();
    assert!(!status.monitoring_active);
    assert_eq!(status.active_permissions, 0);
    assert_eq!(write_bits(&lib), 0);
    assert_eq!(write_bits(&manifest), 0);

    let rows = h
        .gate
        .ledger()
        .grants_for_path(&lib.canonicalize().unwrap())
        .unwrap();
    assert_eq!(rows[0].status, GrantStatus::Revoked);
}

#[test]
fn heartbeat_after_lockdown_does_not_reopen_files() {
    let h = harness();
    let lib = h.root.join("src/lib.rs");
    h.gate.heartbeat();
    h.gate.grant_permission(&lib, "T1", "agentX", None).unwrap();
    h.gate.enter_lockdown().unwrap();

    assert_eq!(h.gate.heartbeat(), LivenessState::Lockdown);
    assert_eq!(h.gate.liveness(), LivenessState::Active);
    assert_eq!(write_bits(&lib), 0);
    assert!(!h.gate.check_permission(&lib).allowed);

    // Only a fresh grant opens the file again
    assert!(h.gate.grant_permission(&lib, "T1", "agentX", None).unwrap());
    assert_eq!(write_bits(&lib), 0o200);
}

#[test]
fn mismatched_revoke_leaves_grant() {
    let h = harness();
    let file = h.root.join("src/lib.rs");
    h.gate.heartbeat();
    h.gate.grant_permission(&file, "T1", "agentX", None).unwrap();

    assert!(!h.gate.revoke_permission(&file, Some("T2")).unwrap());
    let decision = h.gate.check_permission(&file);
    assert!(decision.allowed);
    assert_eq!(decision.task_id.as_deref(), Some("T1"));
    assert_eq!(write_bits(&file), 0o200);
}

#[test]
fn idempotent_lockdown() {
    let h = harness();
    let file = h.root.join("src/lib.rs");
    h.gate.heartbeat();
    h.gate.grant_permission(&file, "T1", "agentX", None).unwrap();

    let lockdowns_before = h
        .gate
        .ledger()
        .events_with_action(AuditAction::Lockdown)
        .unwrap()
        .len();

    assert!(h.gate.enter_lockdown().is_some());
    assert_eq!(h.gate.liveness(), LivenessState::Lockdown);
    assert!(h.gate.enter_lockdown().is_none());
    assert_eq!(h.gate.liveness(), LivenessState::Lockdown);
    assert!(h.gate.check_liveness().is_none());

    let lockdowns_after = h
        .gate
        .ledger()
        .events_with_action(AuditAction::Lockdown)
        .unwrap()
        .len();
    assert_eq!(lockdowns_after, lockdowns_before + 1);
    assert_eq!(write_bits(&file), 0);
}

#[test]
fn concurrent_grants_and_lockdown_never_leave_grants_behind() {
    let h = harness();
    h.gate.heartbeat();

    let files: Vec<PathBuf> = (0..8)
        .map(|i| {
            let path = h.root.join(format!("src/file_{}.rs", i));
            fs::write(&path, "").unwrap();
            path
        })
        .collect();

    let workers: Vec<_> = files
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, file)| {
            let gate = h.gate.clone();
            thread::spawn(move || {
                for round in 0..20 {
                    let task = format!("T{}-{}", i, round);
                    let _ = gate.grant_permission(&file, &task, "agent", None);
                    let _ = gate.check_permission(&file);
                }
            })
        })
        .collect();

    h.gate.enter_lockdown();
    for worker in workers {
        worker.join().unwrap();
    }

    // Anything granted before the lockdown is gone; nothing was granted after.
    assert_eq!(h.gate.liveness(), LivenessState::Lockdown);
    assert_eq!(h.gate.get_status().active_permissions, 0);
    for file in &files {
        assert_eq!(write_bits(file), 0, "{:?} left writable", file);
    }
}

#[test]
fn file_stays_locked_until_grant_is_audited() {
    let (h, db) = file_backed_harness();
    let file = h.root.join("src/lib.rs");
    h.gate.heartbeat();

    // Hold the database so the grant commit has to wait.
    let blocker = rusqlite::Connection::open(&db).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let gate = h.gate.clone();
    let target = file.clone();
    let grant = thread::spawn(move || gate.grant_permission(&target, "T1", "agentX", None));

    for _ in 0..20 {
        assert_eq!(write_bits(&file), 0, "unlocked before the audit row was committed");
        thread::sleep(Duration::from_millis(10));
    }
    blocker.execute_batch("ROLLBACK").unwrap();

    assert!(grant.join().unwrap().unwrap());
    assert_eq!(write_bits(&file), 0o200);
    let events = h
        .gate
        .ledger()
        .events_for_path(&file.canonicalize().unwrap())
        .unwrap();
    assert_eq!(events.last().unwrap().action, AuditAction::Granted);
}

#[test]
fn failed_audit_write_never_unlocks() {
    let (h, db) = file_backed_harness();
    let file = h.root.join("src/lib.rs");
    h.gate.heartbeat();
    rusqlite::Connection::open(&db)
        .unwrap()
        .execute_batch(REJECT_GRANTS)
        .unwrap();

    let result = h.gate.grant_permission(&file, "T1", "agentX", None);
    assert!(matches!(result, Err(GuardError::Persistence(_))));
    assert_eq!(write_bits(&file), 0);
    assert!(!h.gate.check_permission(&file).allowed);

    let canonical = file.canonicalize().unwrap();
    assert!(h.gate.ledger().grants_for_path(&canonical).unwrap().is_empty());
    let events = h.gate.ledger().events_for_path(&canonical).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, AuditAction::Granted);
    assert!(!events[0].success);
}

#[test]
fn failed_renewal_keeps_prior_grant() {
    let (h, db) = file_backed_harness();
    let file = h.root.join("src/lib.rs");
    h.gate.heartbeat();
    assert!(h.gate.grant_permission(&file, "T1", "agentX", None).unwrap());

    rusqlite::Connection::open(&db)
        .unwrap()
        .execute_batch(REJECT_GRANTS)
        .unwrap();

    // Same task renewing, then another task superseding: both fail.
    assert!(h.gate.grant_permission(&file, "T1", "agentX", None).is_err());
    assert!(h.gate.grant_permission(&file, "T2", "agentY", None).is_err());

    let decision = h.gate.check_permission(&file);
    assert!(decision.allowed);
    assert_eq!(decision.task_id.as_deref(), Some("T1"));
    assert_eq!(write_bits(&file), 0o200);

    let rows = h
        .gate
        .ledger()
        .grants_for_path(&file.canonicalize().unwrap())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task_id, "T1");
    assert_eq!(rows[0].status, GrantStatus::Active);
}

#[test]
fn ledger_inside_protected_root_stays_writable() {
    init_tracing();
    let dir = tempdir().unwrap();
    let root = dir.path().join("project");
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("src/lib.rs"), "").unwrap();

    let mut config = GuardConfig::with_roots([&root]);
    config.ledger_path = root.join("state/permissions.db");
    let ledger = config.ledger_path.clone();

    let gate = ProtectionGate::new(config.clone()).unwrap();
    assert_eq!(write_bits(&ledger) & 0o200, 0o200);
    assert_eq!(write_bits(&root.join("src/lib.rs")), 0);

    gate.heartbeat();
    gate.enter_lockdown().unwrap();
    assert_eq!(write_bits(&ledger) & 0o200, 0o200);

    gate.heartbeat();
    let result = gate.grant_permission(&ledger, "T1", "agentX", None);
    assert!(matches!(result, Err(GuardError::InvalidRequest(_))));
    drop(gate);

    // A restart can still open the ledger for writing.
    let gate = ProtectionGate::new(config).unwrap();
    assert_eq!(gate.liveness(), LivenessState::Lockdown);
}

#[test]
fn out_of_range_timeout_is_rejected_at_construction() {
    let dir = tempdir().unwrap();
    let mut config = GuardConfig::with_roots([dir.path()]);
    config.heartbeat_timeout_seconds = u64::MAX / 2;

    let result = ProtectionGate::with_parts(
        config,
        PermissionLedger::in_memory().unwrap(),
        Arc::new(ManualClock::default()),
    );
    assert!(matches!(result, Err(GuardError::Config(_))));
}
