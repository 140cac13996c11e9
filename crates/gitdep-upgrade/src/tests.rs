use super::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context};
use gitdep_core::timestamp::parse_rfc3339;
use gitdep_core::{CommitId, DependencyConfig, LockEntry, LockFile, PROJECT_MANIFEST_FILE};
use gitdep_exec::{ExecError, OutputLine};
use gitdep_registry::ProcessRegistry;
use gitdep_source::{ResolvedRevision, UpstreamResolver};
use gitdep_state::{
    acquire_claim, read_claim, read_lock_file, write_lock_file, ClaimError, ProjectLayout,
    SnapshotStore, UpgradeClaim,
};

const COMMIT_V1: &str = "1111111111111111111111111111111111111111";
const COMMIT_V2: &str = "2222222222222222222222222222222222222222";
const SOURCE: &str = "https://example.test/foo";

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_layout(label: &str) -> ProjectLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "gitdep-upgrade-tests-{label}-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    fs::create_dir_all(&path).expect("must create project root");
    ProjectLayout::new(path)
}

/// Serves fixed revisions without touching git.
#[derive(Default)]
struct FakeUpstream {
    revisions: BTreeMap<String, (&'static str, String)>,
}

impl FakeUpstream {
    fn with_revision(mut self, reference: &str, commit: &'static str, config: &str) -> Self {
        self.revisions
            .insert(reference.to_string(), (commit, config.to_string()));
        self
    }
}

impl UpstreamResolver for FakeUpstream {
    fn resolve(&self, name: &str, _source: &str, reference: &str) -> anyhow::Result<ResolvedRevision> {
        let (commit, config) = self
            .revisions
            .iter()
            .find(|(known, (commit, _))| known.as_str() == reference || *commit == reference)
            .map(|(_, revision)| revision)
            .ok_or_else(|| anyhow!("ref '{reference}' does not exist in upstream of '{name}'"))?;
        let config = if config.is_empty() {
            DependencyConfig::empty()
        } else {
            DependencyConfig::from_yaml_str(config)
                .map_err(anyhow::Error::new)
                .with_context(|| format!("invalid dependency.yaml for '{name}'"))?
        };
        Ok(ResolvedRevision {
            commit: CommitId::parse(commit)?,
            config,
            checkout: None,
        })
    }
}

#[derive(Default)]
struct RecordingObserver {
    transitions: Vec<(UpgradeState, UpgradeState)>,
    started: Vec<(Step, String)>,
    lines: Vec<(Step, String)>,
}

impl UpgradeObserver for RecordingObserver {
    fn on_transition(&mut self, from: UpgradeState, to: UpgradeState) {
        self.transitions.push((from, to));
    }

    fn on_step_started(&mut self, step: Step, command: &gitdep_core::Command, _pid: u32) {
        self.started.push((step, command.name.clone()));
    }

    fn on_output(&mut self, step: Step, line: &OutputLine) {
        self.lines.push((step, line.text.clone()));
    }
}

fn write_manifest(layout: &ProjectLayout, extra: &str) {
    fs::write(
        layout.root().join(PROJECT_MANIFEST_FILE),
        format!("{extra}[dependencies.foo]\nsource = \"{SOURCE}\"\n"),
    )
    .expect("must write manifest");
}

fn lock_at_v1(layout: &ProjectLayout) -> LockFile {
    let lock = LockFile::new()
        .with_entry(
            "foo",
            LockEntry::new(
                SOURCE,
                "v1",
                CommitId::parse(COMMIT_V1).expect("commit"),
                parse_rfc3339("2026-09-01T08:00:00Z").expect("timestamp"),
            )
            .expect("valid entry"),
        )
        .expect("valid name");
    write_lock_file(&layout.lock_path(), &lock).expect("must write lock");
    lock
}

fn config_with(migration: &str, verify: &str) -> String {
    format!(
        r#"
apiVersion: gitdep/v1
commands:
  migrate:
    run: {migration:?}
  check:
    run: {verify:?}
changes:
  v2:
    type: breaking
    description: Renamed the client module
    migration: migrate
    verify: check
"#
    )
}

#[cfg(unix)]
fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg("exit 0")
        .spawn()
        .expect("must spawn short-lived process");
    let pid = child.id();
    child.wait().expect("must reap short-lived process");
    pid
}

fn remaining_snapshots(layout: &ProjectLayout) -> usize {
    SnapshotStore::new(layout.snapshots_dir())
        .list()
        .expect("must list snapshots")
        .len()
}

#[test]
fn state_machine_follows_declared_transitions() {
    let mut machine = UpgradeMachine::new();
    assert_eq!(machine.state(), UpgradeState::Idle);
    machine
        .advance(UpgradeState::Snapshotted)
        .expect("snapshot first");
    machine
        .advance(UpgradeState::MigrationDone)
        .expect("migration may be skipped");

    let err = machine
        .advance(UpgradeState::Committed)
        .expect_err("verify cannot be bypassed");
    assert_eq!(err.from, UpgradeState::MigrationDone);
    assert_eq!(err.to, UpgradeState::Committed);

    machine
        .advance(UpgradeState::RollingBack)
        .expect("failure rolls back");
    machine
        .advance(UpgradeState::RolledBack)
        .expect("rollback completes");
    assert!(machine.state().is_terminal());
    assert_eq!(
        machine.history(),
        &[
            UpgradeState::Idle,
            UpgradeState::Snapshotted,
            UpgradeState::MigrationDone,
            UpgradeState::RollingBack,
            UpgradeState::RolledBack,
        ]
    );
}

#[test]
fn rolling_back_is_not_reachable_from_idle_or_terminal_states() {
    assert!(!UpgradeState::Idle.can_transition_to(UpgradeState::RollingBack));
    assert!(!UpgradeState::Committed.can_transition_to(UpgradeState::RollingBack));
    assert!(!UpgradeState::RollingBack.can_transition_to(UpgradeState::RollingBack));
    assert!(UpgradeState::VerifyRunning.can_transition_to(UpgradeState::RollingBack));
    assert_eq!(UpgradeState::RollbackFailed.to_string(), "rollback_failed");
}

#[test]
fn exit_codes_follow_error_kind() {
    assert_eq!(UpgradeError::Validation(anyhow!("bad")).exit_code(), EXIT_VALIDATION);
    assert_eq!(UpgradeError::Resolve(anyhow!("offline")).exit_code(), 1);
    let rollback = UpgradeError::RollbackFailed {
        dependency: "foo".to_string(),
        cause: Box::new(UpgradeError::Commit(anyhow!("disk full"))),
        restore: anyhow!("snapshot missing"),
        snapshot: None,
    };
    assert_eq!(rollback.exit_code(), EXIT_ROLLBACK_FAILED);
    assert!(rollback.to_string().contains("ROLLBACK FAILED"));
}

#[cfg(unix)]
#[test]
fn upgrade_runs_migration_and_verify_then_commits() {
    let layout = test_layout("success");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let upstream = FakeUpstream::default().with_revision(
        "v2",
        COMMIT_V2,
        &config_with(
            "printf '%s>%s %s' \"$GITDEP_FROM_REF\" \"$GITDEP_TO_REF\" \"$GITDEP_TO_COMMIT\" > migrated.txt",
            "echo verified",
        ),
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream);
    let mut observer = RecordingObserver::default();

    let outcome = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut observer)
        .expect("upgrade must succeed");

    assert_eq!(outcome.previous.map(|entry| entry.reference), Some("v1".to_string()));
    assert_eq!(outcome.entry.reference, "v2");
    assert_eq!(outcome.entry.commit.as_str(), COMMIT_V2);
    assert_eq!(
        outcome.history,
        vec![
            UpgradeState::Idle,
            UpgradeState::Snapshotted,
            UpgradeState::MigrationRunning,
            UpgradeState::MigrationDone,
            UpgradeState::VerifyRunning,
            UpgradeState::VerifyDone,
            UpgradeState::Committed,
        ]
    );
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.steps.iter().all(|step| step.log_path.is_file()));

    let migrated = fs::read_to_string(layout.root().join("migrated.txt")).expect("must read marker");
    assert_eq!(migrated, format!("v1>v2 {COMMIT_V2}"));

    let lock = read_lock_file(&layout.lock_path())
        .expect("must read lock")
        .expect("lock must exist");
    let entry = lock.get("foo").expect("foo must be locked");
    assert_eq!(entry.reference, "v2");
    assert!(entry.consumed_at > parse_rfc3339("2026-09-01T08:00:00Z").expect("timestamp"));

    assert_eq!(remaining_snapshots(&layout), 0);
    assert!(read_claim(&layout, "foo").expect("must read claim").is_none());
    assert_eq!(
        observer.started,
        vec![
            (Step::Migration, "migrate".to_string()),
            (Step::Verify, "check".to_string())
        ]
    );
    assert!(observer
        .lines
        .contains(&(Step::Verify, "verified".to_string())));
    assert_eq!(observer.transitions.len(), 6);

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn failed_verify_restores_lock_file_byte_for_byte() {
    let layout = test_layout("verify-fails");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let before = fs::read(layout.lock_path()).expect("must read lock");
    let upstream = FakeUpstream::default().with_revision(
        "v2",
        COMMIT_V2,
        &config_with("true", "echo boom >&2; exit 1"),
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream);
    let mut observer = RecordingObserver::default();

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut observer)
        .expect_err("verify failure must abort");

    assert!(err.rolled_back());
    assert_eq!(err.exit_code(), 1);
    let failure = err.step_failure().expect("step failure must be reported");
    assert_eq!(failure.step, Step::Verify);
    assert_eq!(failure.command, "check");
    assert_eq!(failure.exit_code, Some(1));
    assert_eq!(failure.output.stderr, "boom\n");
    assert!(err.to_string().contains("verify command 'check' exited with status 1"));

    assert_eq!(fs::read(layout.lock_path()).expect("must read lock"), before);
    assert_eq!(remaining_snapshots(&layout), 0);
    assert!(read_claim(&layout, "foo").expect("must read claim").is_none());
    assert_eq!(
        observer.transitions.last(),
        Some(&(UpgradeState::RollingBack, UpgradeState::RolledBack))
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn failed_lock_commit_restores_lock_file() {
    let layout = test_layout("commit-fails");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let before = fs::read(layout.lock_path()).expect("must read lock");
    // Verify passes but leaves a directory where the lock file must be written.
    let upstream = FakeUpstream::default().with_revision(
        "v2",
        COMMIT_V2,
        &config_with("true", "rm dependency.lock && mkdir -p dependency.lock/blocked"),
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream);
    let mut observer = RecordingObserver::default();

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut observer)
        .expect_err("lock commit must fail");

    assert!(matches!(err, UpgradeError::Commit(_)), "{err}");
    assert!(err.rolled_back());
    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().contains("failed to commit lock file"), "{err}");

    assert!(layout.lock_path().is_file());
    assert_eq!(fs::read(layout.lock_path()).expect("must read lock"), before);
    assert_eq!(remaining_snapshots(&layout), 0);
    assert!(read_claim(&layout, "foo").expect("must read claim").is_none());
    assert!(observer
        .transitions
        .contains(&(UpgradeState::VerifyDone, UpgradeState::RollingBack)));
    assert_eq!(
        observer.transitions.last(),
        Some(&(UpgradeState::RollingBack, UpgradeState::RolledBack))
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn failed_first_upgrade_removes_lock_file_again() {
    let layout = test_layout("first-upgrade-fails");
    write_manifest(&layout, "");
    let upstream = FakeUpstream::default().with_revision(
        "v2",
        COMMIT_V2,
        &config_with("exit 7", "true"),
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream);

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut NoopObserver)
        .expect_err("migration failure must abort");

    let failure = err.step_failure().expect("step failure");
    assert_eq!(failure.step, Step::Migration);
    assert_eq!(failure.exit_code, Some(7));
    assert!(!layout.lock_path().exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn timed_out_step_rolls_back_with_timeout_error() {
    let layout = test_layout("timeout");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let before = fs::read(layout.lock_path()).expect("must read lock");
    let upstream =
        FakeUpstream::default().with_revision("v2", COMMIT_V2, &config_with("sleep 30", "true"));
    let orchestrator = Orchestrator::new(layout.clone(), upstream);

    let request = UpgradeRequest::new("foo", "v2")
        .with_timeout(Some(std::time::Duration::from_millis(300)));
    let err = orchestrator
        .upgrade(&request, &mut NoopObserver)
        .expect_err("timeout must abort");

    let failure = err.step_failure().expect("step failure");
    assert!(matches!(failure.error, Some(ExecError::Timeout(_))));
    assert_eq!(fs::read(layout.lock_path()).expect("must read lock"), before);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn skip_flags_spawn_nothing() {
    let layout = test_layout("skip");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let upstream = FakeUpstream::default().with_revision(
        "v2",
        COMMIT_V2,
        &config_with("touch migrated.txt", "touch verified.txt"),
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream);
    let mut observer = RecordingObserver::default();

    let request = UpgradeRequest::new("foo", "v2")
        .skip_migration(true)
        .skip_verify(true);
    let outcome = orchestrator
        .upgrade(&request, &mut observer)
        .expect("upgrade must succeed");

    assert!(outcome.steps.is_empty());
    assert!(observer.started.is_empty());
    assert!(!layout.root().join("migrated.txt").exists());
    assert!(!layout.root().join("verified.txt").exists());
    assert_eq!(outcome.entry.reference, "v2");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn upgrade_without_declared_change_commits_directly() {
    let layout = test_layout("no-change");
    write_manifest(&layout, "");
    let upstream = FakeUpstream::default().with_revision("v3", COMMIT_V2, "");
    let orchestrator = Orchestrator::new(layout.clone(), upstream);

    let outcome = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v3"), &mut NoopObserver)
        .expect("upgrade must succeed");

    assert!(outcome.previous.is_none());
    assert!(outcome.steps.is_empty());
    let lock = read_lock_file(&layout.lock_path())
        .expect("must read lock")
        .expect("lock must exist");
    assert_eq!(lock.get("foo").map(|entry| entry.source.as_str()), Some(SOURCE));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn upgrade_of_unknown_ref_leaves_project_untouched() {
    let layout = test_layout("unknown-ref");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let before = fs::read(layout.lock_path()).expect("must read lock");
    let orchestrator = Orchestrator::new(layout.clone(), FakeUpstream::default());

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v9"), &mut NoopObserver)
        .expect_err("unknown ref must fail");

    assert!(matches!(err, UpgradeError::Resolve(_)));
    assert!(err.to_string().contains("does not exist"));
    assert_eq!(fs::read(layout.lock_path()).expect("must read lock"), before);
    assert!(!layout.state_dir().exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn invalid_dependency_config_is_a_validation_error() {
    let layout = test_layout("invalid-config");
    write_manifest(&layout, "");
    let upstream = FakeUpstream::default().with_revision(
        "v2",
        COMMIT_V2,
        "apiVersion: gitdep/v1\nchanges:\n  v2:\n    migration: missing\n",
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream);

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut NoopObserver)
        .expect_err("invalid config must fail");
    assert_eq!(err.exit_code(), EXIT_VALIDATION);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn undeclared_dependency_without_source_is_rejected() {
    let layout = test_layout("no-source");
    let orchestrator = Orchestrator::new(layout.clone(), FakeUpstream::default());

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("bar", "v1"), &mut NoopObserver)
        .expect_err("missing source must fail");
    assert!(matches!(err, UpgradeError::Validation(_)));
    assert!(err.to_string().contains("no known source"));

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("Bad Name", "v1"), &mut NoopObserver)
        .expect_err("invalid name must fail");
    assert_eq!(err.exit_code(), EXIT_VALIDATION);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn invalid_manifest_timeout_setting_is_rejected() {
    let layout = test_layout("zero-timeout");
    write_manifest(&layout, "[settings]\ntimeout_secs = 0\n\n");
    let orchestrator = Orchestrator::new(
        layout.clone(),
        FakeUpstream::default().with_revision("v2", COMMIT_V2, ""),
    );

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut NoopObserver)
        .expect_err("zero timeout must fail");
    assert_eq!(err.exit_code(), EXIT_VALIDATION);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn apply_creates_and_replaces_entries_without_running_commands() {
    let layout = test_layout("apply");
    let upstream = FakeUpstream::default()
        .with_revision("v1", COMMIT_V1, "")
        .with_revision("v2", COMMIT_V2, &config_with("touch migrated.txt", "exit 1"));
    let orchestrator = Orchestrator::new(layout.clone(), upstream);

    let created = orchestrator
        .apply(
            &ApplyRequest::new("foo", "v1").with_source("HTTPS://Example.test/foo/"),
            &mut NoopObserver,
        )
        .expect("apply must create entry");
    assert!(created.previous.is_none());
    assert_eq!(created.entry.source, SOURCE);

    let replaced = orchestrator
        .apply(
            &ApplyRequest::new("foo", "v2").with_source(SOURCE),
            &mut NoopObserver,
        )
        .expect("apply must replace entry");
    assert_eq!(replaced.previous.map(|entry| entry.reference), Some("v1".to_string()));
    assert_eq!(replaced.entry.commit.as_str(), COMMIT_V2);
    assert!(!layout.root().join("migrated.txt").exists());

    let lock = read_lock_file(&layout.lock_path())
        .expect("must read lock")
        .expect("lock must exist");
    assert_eq!(lock.dependencies.len(), 1);
    assert_eq!(remaining_snapshots(&layout), 0);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn concurrent_upgrade_of_same_dependency_is_refused() {
    let layout = test_layout("concurrent");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let before = fs::read(layout.lock_path()).expect("must read lock");
    layout.ensure_state_dirs().expect("must create state dirs");
    let holder = UpgradeClaim {
        txid: "tx-1-holder".to_string(),
        pid: std::process::id(),
        dependency: "foo".to_string(),
        from_ref: Some("v1".to_string()),
        to_ref: "v2".to_string(),
        snapshot_id: None,
        state: "verify_running".to_string(),
        started_at: gitdep_core::timestamp::now_utc(),
    };
    acquire_claim(&layout, &holder).expect("first claim must succeed");

    let orchestrator = Orchestrator::new(
        layout.clone(),
        FakeUpstream::default().with_revision("v2", COMMIT_V2, ""),
    );
    let err = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut NoopObserver)
        .expect_err("second upgrade must be refused");

    assert!(matches!(
        err,
        UpgradeError::Claim(ClaimError::InProgress { ref txid, .. }) if txid == "tx-1-holder"
    ));
    assert_eq!(fs::read(layout.lock_path()).expect("must read lock"), before);
    assert_eq!(
        read_claim(&layout, "foo")
            .expect("must read claim")
            .map(|claim| claim.txid),
        Some(holder.txid)
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn plan_reports_steps_without_touching_lock() {
    let layout = test_layout("plan");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let before = fs::read(layout.lock_path()).expect("must read lock");
    let upstream = FakeUpstream::default().with_revision(
        "v2",
        COMMIT_V2,
        &config_with("touch migrated.txt", "touch verified.txt"),
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream);

    let plan = orchestrator
        .plan(&UpgradeRequest::new("foo", "v2").skip_verify(true))
        .expect("plan must succeed");

    assert_eq!(plan.commit.as_str(), COMMIT_V2);
    assert_eq!(plan.previous.map(|entry| entry.reference), Some("v1".to_string()));
    assert_eq!(plan.migration.map(|command| command.name), Some("migrate".to_string()));
    assert!(plan.verify.is_none());
    assert_eq!(plan.skipped, vec![(Step::Verify, "check".to_string())]);
    assert!(plan.change.expect("change must be declared").is_breaking());
    assert_eq!(
        plan.transitions,
        vec![
            UpgradeState::Idle,
            UpgradeState::Snapshotted,
            UpgradeState::MigrationRunning,
            UpgradeState::MigrationDone,
            UpgradeState::VerifyDone,
            UpgradeState::Committed,
        ]
    );
    assert!(plan.blocked_by.is_none());

    assert_eq!(fs::read(layout.lock_path()).expect("must read lock"), before);
    assert!(!layout.root().join("migrated.txt").exists());
    assert!(!layout.state_dir().exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn failed_rollback_requires_repair() {
    let layout = test_layout("rollback-fails");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let upstream = FakeUpstream::default().with_revision(
        "v2",
        COMMIT_V2,
        &config_with("true", "rm -rf .gitdep/snapshots; exit 1"),
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream);

    let err = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut NoopObserver)
        .expect_err("upgrade must fail");
    assert_eq!(err.exit_code(), EXIT_ROLLBACK_FAILED);
    assert!(!err.rolled_back());
    assert!(err.to_string().contains("ROLLBACK FAILED"));
    assert_eq!(
        err.step_failure().map(|failure| failure.step),
        Some(Step::Verify)
    );

    let claim = read_claim(&layout, "foo")
        .expect("must read claim")
        .expect("claim must stay behind");
    assert!(claim.requires_repair());

    let blocked = orchestrator
        .upgrade(&UpgradeRequest::new("foo", "v2"), &mut NoopObserver)
        .expect_err("upgrade must be blocked");
    assert!(blocked.to_string().contains("requires repair"));

    let repaired = orchestrator.repair("foo").expect("repair must succeed");
    assert_eq!(repaired.claim.map(|claim| claim.txid), Some(claim.txid));
    assert!(repaired.restored.is_none());
    assert!(read_claim(&layout, "foo").expect("must read claim").is_none());

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn repair_restores_snapshot_of_dead_transaction() {
    let layout = test_layout("repair");
    lock_at_v1(&layout);
    let before = fs::read(layout.lock_path()).expect("must read lock");
    layout.ensure_state_dirs().expect("must create state dirs");

    let store = SnapshotStore::new(layout.snapshots_dir());
    let snapshot = store
        .create(&[layout.lock_path()])
        .expect("must snapshot lock");
    fs::write(layout.lock_path(), "half written").expect("must clobber lock");
    let pid = exited_pid();
    let orphan = UpgradeClaim {
        txid: format!("tx-1-{pid}"),
        pid,
        dependency: "foo".to_string(),
        from_ref: Some("v1".to_string()),
        to_ref: "v2".to_string(),
        snapshot_id: Some(snapshot.as_str().to_string()),
        state: "verify_done".to_string(),
        started_at: gitdep_core::timestamp::now_utc(),
    };
    acquire_claim(&layout, &orphan).expect("must claim");

    let orchestrator = Orchestrator::new(layout.clone(), FakeUpstream::default());
    let outcome = orchestrator.repair("foo").expect("repair must succeed");

    assert_eq!(outcome.restored, Some(snapshot));
    assert_eq!(fs::read(layout.lock_path()).expect("must read lock"), before);
    assert_eq!(remaining_snapshots(&layout), 0);
    assert!(read_claim(&layout, "foo").expect("must read claim").is_none());

    let nothing = orchestrator.repair("foo").expect("second repair is a no-op");
    assert!(nothing.claim.is_none());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn repair_refuses_live_transaction() {
    let layout = test_layout("repair-live");
    layout.ensure_state_dirs().expect("must create state dirs");
    let live = UpgradeClaim {
        txid: "tx-1-live".to_string(),
        pid: std::process::id(),
        dependency: "foo".to_string(),
        from_ref: None,
        to_ref: "v2".to_string(),
        snapshot_id: None,
        state: "migration_running".to_string(),
        started_at: gitdep_core::timestamp::now_utc(),
    };
    acquire_claim(&layout, &live).expect("must claim");

    let orchestrator = Orchestrator::new(layout.clone(), FakeUpstream::default());
    let err = orchestrator.repair("foo").expect_err("live claim must be refused");
    assert!(matches!(err, UpgradeError::Claim(ClaimError::InProgress { .. })));
    assert!(read_claim(&layout, "foo").expect("must read claim").is_some());

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn run_command_uses_locked_revision_and_registry() {
    let layout = test_layout("run");
    write_manifest(&layout, "");
    lock_at_v1(&layout);
    let registry_root = layout.root().join("cache").join("processes");
    let upstream = FakeUpstream::default().with_revision(
        "v1",
        COMMIT_V1,
        "apiVersion: gitdep/v1\ncommands:\n  lint:\n    run: echo \"$GITDEP_DEPENDENCY@$GITDEP_TO_COMMIT\"; exit 4\n",
    );
    let orchestrator = Orchestrator::new(layout.clone(), upstream)
        .with_registry(ProcessRegistry::new(&registry_root));
    let mut observer = RecordingObserver::default();

    let output = orchestrator
        .run_command("foo", "lint", None, &mut observer)
        .expect("command must run");
    assert_eq!(output.exit_code, Some(4));
    assert!(!output.success);
    assert_eq!(output.stdout, format!("foo@{COMMIT_V1}\n"));
    assert_eq!(observer.started, vec![(Step::Run, "lint".to_string())]);
    assert!(ProcessRegistry::new(&registry_root)
        .list_active()
        .expect("must list registry")
        .is_empty());

    let err = orchestrator
        .run_command("foo", "missing", None, &mut NoopObserver)
        .expect_err("unknown command must fail");
    assert_eq!(err.exit_code(), EXIT_VALIDATION);
    assert!(err.to_string().contains("available: lint"));

    let err = orchestrator
        .run_command("bar", "lint", None, &mut NoopObserver)
        .expect_err("unlocked dependency must fail");
    assert!(err.to_string().contains("is not locked"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn request_builders_set_fields() {
    let request = UpgradeRequest::new("foo", "v2")
        .with_source(PathBuf::from("/srv/foo").display().to_string())
        .skip_verify(true);
    assert_eq!(request.source.as_deref(), Some("/srv/foo"));
    assert!(request.skip_verify);
    assert!(!request.skip_migration);
    assert!(request.timeout.is_none());
}
