use std::env;
use std::time::Duration;

use anyhow::anyhow;
use gitdep_core::{
    normalize_source, timestamp::now_utc, validate_dependency_name, Change, Command, CommitId,
    DependencyConfig, LockEntry, LockFile, ProjectManifest, ValidationError,
};
use gitdep_exec::{resolve_timeout, ProcessOutput, TIMEOUT_ENV};
use gitdep_registry::{process_alive, ProcessRegistry};
use gitdep_source::{ResolvedRevision, UpstreamResolver};
use gitdep_state::{
    acquire_claim, new_txid, read_claim, read_lock_file, read_project_manifest, release_claim,
    update_claim, write_lock_file, ClaimError, ProjectLayout, SnapshotId, SnapshotStore,
    UpgradeClaim,
};
use tracing::{debug, error, info, warn};

use crate::steps::{execute_step, StepContext};
use crate::{
    ApplyRequest, RepairOutcome, Step, StepFailure, UpgradeError, UpgradeMachine,
    UpgradeObserver, UpgradeOutcome, UpgradePlan, UpgradeRequest, UpgradeState,
};

/// Drives upgrades of one project's dependencies.
pub struct Orchestrator<R> {
    layout: ProjectLayout,
    resolver: R,
    registry: Option<ProcessRegistry>,
}

struct ProjectContext {
    manifest: ProjectManifest,
    previous: Option<LockEntry>,
    source: String,
}

struct SelectedSteps<'a> {
    change: Option<&'a Change>,
    migration: Option<&'a Command>,
    verify: Option<&'a Command>,
    skipped: Vec<(Step, String)>,
}

impl<R: UpstreamResolver> Orchestrator<R> {
    pub fn new(layout: ProjectLayout, resolver: R) -> Self {
        Self {
            layout,
            resolver,
            registry: None,
        }
    }

    /// Registers every spawned command so `gitdep ps` can see it.
    pub fn with_registry(mut self, registry: ProcessRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn plan(&self, request: &UpgradeRequest) -> Result<UpgradePlan, UpgradeError> {
        validate_request(&request.dependency, &request.to_ref)?;
        let context = self.load_context(&request.dependency, request.source.as_deref())?;
        let resolved = self.resolve(&request.dependency, &context.source, &request.to_ref)?;
        let selected = select_steps(
            &resolved.config,
            &request.to_ref,
            request.skip_migration,
            request.skip_verify,
        );

        let mut transitions = vec![UpgradeState::Idle, UpgradeState::Snapshotted];
        if selected.migration.is_some() {
            transitions.push(UpgradeState::MigrationRunning);
        }
        transitions.push(UpgradeState::MigrationDone);
        if selected.verify.is_some() {
            transitions.push(UpgradeState::VerifyRunning);
        }
        transitions.push(UpgradeState::VerifyDone);
        transitions.push(UpgradeState::Committed);

        let blocked_by = read_claim(&self.layout, &request.dependency)?;

        Ok(UpgradePlan {
            dependency: request.dependency.clone(),
            source: context.source,
            previous: context.previous,
            to_ref: request.to_ref.clone(),
            commit: resolved.commit.clone(),
            change: selected.change.cloned(),
            migration: selected.migration.cloned(),
            verify: selected.verify.cloned(),
            skipped: selected.skipped,
            transitions,
            blocked_by,
        })
    }

    /// Moves `request.dependency` to `request.to_ref`: snapshot, migration,
    /// verify, then the lock write. Any failure after the snapshot restores
    /// it before returning.
    pub fn upgrade(
        &self,
        request: &UpgradeRequest,
        observer: &mut dyn UpgradeObserver,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        validate_request(&request.dependency, &request.to_ref)?;
        let context = self.load_context(&request.dependency, request.source.as_deref())?;
        let timeout = step_timeout(request.timeout, &context.manifest)?;
        let resolved = self.resolve(&request.dependency, &context.source, &request.to_ref)?;
        let selected = select_steps(
            &resolved.config,
            &request.to_ref,
            request.skip_migration,
            request.skip_verify,
        );
        for (step, command) in &selected.skipped {
            info!(dependency = %request.dependency, step = %step, command = %command, "skipping {step} command");
        }

        let from_ref = context.previous.as_ref().map(|entry| entry.reference.clone());
        let mut tx = Transaction::begin(
            &self.layout,
            &request.dependency,
            from_ref.as_deref(),
            &request.to_ref,
        )?;
        tx.snapshot(observer)?;

        let txid = tx.claim.txid.clone();
        let ctx = StepContext {
            layout: &self.layout,
            registry: self.registry.as_ref(),
            dependency: &request.dependency,
            txid: &txid,
            from_ref: from_ref.as_deref(),
            to_ref: &request.to_ref,
            commit: &resolved.commit,
            checkout: resolved.checkout.as_deref(),
            timeout,
        };

        let mut steps = Vec::new();
        let planned = [
            (
                Step::Migration,
                selected.migration,
                UpgradeState::MigrationRunning,
                UpgradeState::MigrationDone,
            ),
            (
                Step::Verify,
                selected.verify,
                UpgradeState::VerifyRunning,
                UpgradeState::VerifyDone,
            ),
        ];
        for (step, command, running, done) in planned {
            if let Some(command) = command {
                tx.advance(running, observer)?;
                let report = match execute_step(&ctx, step, command, observer) {
                    Ok(report) if report.exit_code == 0 => report,
                    Ok(report) => {
                        let failure = StepFailure::from(report);
                        return Err(tx.rollback(UpgradeError::Step(Box::new(failure)), observer));
                    }
                    Err(failure) => {
                        return Err(tx.rollback(UpgradeError::Step(Box::new(failure)), observer));
                    }
                };
                steps.push(report);
            }
            tx.advance(done, observer)?;
        }

        let entry = match self.commit_entry(
            &request.dependency,
            &context.source,
            &request.to_ref,
            &resolved.commit,
        ) {
            Ok(entry) => entry,
            Err(err) => return Err(tx.rollback(UpgradeError::Commit(err), observer)),
        };
        let history = tx.commit(observer)?;

        info!(
            dependency = %request.dependency,
            txid = %txid,
            to_ref = %request.to_ref,
            commit = %resolved.commit.short(),
            "upgrade committed"
        );
        Ok(UpgradeOutcome {
            dependency: request.dependency.clone(),
            txid,
            previous: context.previous,
            entry,
            steps,
            history,
        })
    }

    /// Records `request.to_ref` in the lock file without running any
    /// declared command.
    pub fn apply(
        &self,
        request: &ApplyRequest,
        observer: &mut dyn UpgradeObserver,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        validate_request(&request.dependency, &request.to_ref)?;
        let context = self.load_context(&request.dependency, request.source.as_deref())?;
        let resolved = self.resolve(&request.dependency, &context.source, &request.to_ref)?;

        let from_ref = context.previous.as_ref().map(|entry| entry.reference.clone());
        let mut tx = Transaction::begin(
            &self.layout,
            &request.dependency,
            from_ref.as_deref(),
            &request.to_ref,
        )?;
        tx.snapshot(observer)?;
        tx.advance(UpgradeState::MigrationDone, observer)?;
        tx.advance(UpgradeState::VerifyDone, observer)?;

        let entry = match self.commit_entry(
            &request.dependency,
            &context.source,
            &request.to_ref,
            &resolved.commit,
        ) {
            Ok(entry) => entry,
            Err(err) => return Err(tx.rollback(UpgradeError::Commit(err), observer)),
        };
        let txid = tx.claim.txid.clone();
        let history = tx.commit(observer)?;

        info!(
            dependency = %request.dependency,
            txid = %txid,
            to_ref = %request.to_ref,
            commit = %resolved.commit.short(),
            "applied lock entry"
        );
        Ok(UpgradeOutcome {
            dependency: request.dependency.clone(),
            txid,
            previous: context.previous,
            entry,
            steps: Vec::new(),
            history,
        })
    }

    /// Runs a named command of a dependency at its locked revision. A
    /// non-zero exit is reported through the returned output, not as an
    /// error.
    pub fn run_command(
        &self,
        dependency: &str,
        command_name: &str,
        timeout: Option<Duration>,
        observer: &mut dyn UpgradeObserver,
    ) -> Result<ProcessOutput, UpgradeError> {
        validate_dependency_name(dependency).map_err(UpgradeError::Validation)?;
        let manifest = read_project_manifest(&self.layout).map_err(UpgradeError::Validation)?;
        let lock = read_lock_file(&self.layout.lock_path()).map_err(UpgradeError::Validation)?;
        let entry = lock
            .as_ref()
            .and_then(|lock| lock.get(dependency))
            .cloned()
            .ok_or_else(|| {
                UpgradeError::Validation(anyhow!(
                    "dependency '{dependency}' is not locked; run `gitdep apply {dependency} --to <ref>` first"
                ))
            })?;
        let timeout = step_timeout(timeout, &manifest)?;

        let resolved = self.resolve(dependency, &entry.source, entry.commit.as_str())?;
        let Some(command) = resolved.config.command(command_name) else {
            let available = resolved
                .config
                .commands
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>();
            return Err(UpgradeError::Validation(anyhow!(
                "dependency '{dependency}' declares no command '{command_name}' at {} (available: {})",
                entry.commit.short(),
                if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                }
            )));
        };

        let txid = new_txid()?;
        let ctx = StepContext {
            layout: &self.layout,
            registry: self.registry.as_ref(),
            dependency,
            txid: &txid,
            from_ref: Some(&entry.reference),
            to_ref: &entry.reference,
            commit: &entry.commit,
            checkout: resolved.checkout.as_deref(),
            timeout,
        };
        match execute_step(&ctx, Step::Run, command, observer) {
            Ok(report) => Ok(report.output),
            Err(failure) => Err(UpgradeError::Step(Box::new(failure))),
        }
    }

    /// Clears the claim of an interrupted or failed upgrade, restoring its
    /// snapshot first when one is still on disk.
    pub fn repair(&self, dependency: &str) -> Result<RepairOutcome, UpgradeError> {
        validate_dependency_name(dependency).map_err(UpgradeError::Validation)?;
        let Some(claim) = read_claim(&self.layout, dependency)? else {
            debug!(dependency, "nothing to repair");
            return Ok(RepairOutcome {
                claim: None,
                restored: None,
            });
        };

        if !claim.requires_repair() && process_alive(claim.pid)? {
            return Err(UpgradeError::Claim(ClaimError::InProgress {
                dependency: dependency.to_string(),
                txid: claim.txid,
                pid: claim.pid,
            }));
        }

        let store = SnapshotStore::new(self.layout.snapshots_dir());
        let mut restored = None;
        if let Some(raw) = claim.snapshot_id.as_deref() {
            let id = SnapshotId::parse(raw)?;
            if store.exists(&id) {
                store.restore(&id)?;
                if let Err(err) = store.delete(&id) {
                    warn!(dependency, snapshot = %id, "failed to delete restored snapshot: {err:#}");
                }
                restored = Some(id);
            } else {
                warn!(dependency, snapshot = %raw, "snapshot referenced by claim is gone; nothing to restore");
            }
        }
        release_claim(&self.layout, dependency)?;

        info!(dependency, txid = %claim.txid, state = %claim.state, "repaired upgrade claim");
        Ok(RepairOutcome {
            claim: Some(claim),
            restored,
        })
    }

    fn load_context(
        &self,
        dependency: &str,
        explicit_source: Option<&str>,
    ) -> Result<ProjectContext, UpgradeError> {
        let manifest = read_project_manifest(&self.layout).map_err(UpgradeError::Validation)?;
        let lock = read_lock_file(&self.layout.lock_path()).map_err(UpgradeError::Validation)?;
        let previous = lock
            .as_ref()
            .and_then(|lock| lock.get(dependency))
            .cloned();

        let source = explicit_source
            .map(str::to_string)
            .or_else(|| manifest.source_for(dependency).map(str::to_string))
            .or_else(|| previous.as_ref().map(|entry| entry.source.clone()))
            .ok_or_else(|| {
                UpgradeError::Validation(anyhow!(
                    "dependency '{dependency}' has no known source; declare it in gitdep.toml or pass --source"
                ))
            })?;
        let source = normalize_source(&source).map_err(UpgradeError::Validation)?;

        Ok(ProjectContext {
            manifest,
            previous,
            source,
        })
    }

    fn resolve(
        &self,
        dependency: &str,
        source: &str,
        reference: &str,
    ) -> Result<ResolvedRevision, UpgradeError> {
        self.resolver
            .resolve(dependency, source, reference)
            .map_err(|err| {
                if err.downcast_ref::<ValidationError>().is_some() {
                    UpgradeError::Validation(err)
                } else {
                    UpgradeError::Resolve(err)
                }
            })
    }

    /// Writes the new entry over the lock file as it is now, so commits of
    /// other dependencies since this upgrade started are kept.
    fn commit_entry(
        &self,
        dependency: &str,
        source: &str,
        reference: &str,
        commit: &CommitId,
    ) -> anyhow::Result<LockEntry> {
        let path = self.layout.lock_path();
        let entry = LockEntry::new(source, reference, commit.clone(), now_utc())?;
        let next = read_lock_file(&path)?
            .unwrap_or_else(LockFile::new)
            .with_entry(dependency, entry.clone())?;
        write_lock_file(&path, &next)?;
        Ok(entry)
    }
}

fn validate_request(dependency: &str, to_ref: &str) -> Result<(), UpgradeError> {
    validate_dependency_name(dependency).map_err(UpgradeError::Validation)?;
    if to_ref.trim().is_empty() {
        return Err(UpgradeError::Validation(anyhow!(
            "target ref for '{dependency}' must not be empty"
        )));
    }
    Ok(())
}

/// Explicit value, then `GITDEP_COMMAND_TIMEOUT`, then `gitdep.toml`.
fn step_timeout(
    explicit: Option<Duration>,
    manifest: &ProjectManifest,
) -> Result<Option<Duration>, UpgradeError> {
    if explicit.is_some() {
        return Ok(explicit);
    }
    let from_env = resolve_timeout(None, env::var(TIMEOUT_ENV).ok().as_deref())
        .map_err(UpgradeError::Validation)?;
    Ok(from_env.or_else(|| manifest.timeout()))
}

/// Only the change declared for the target ref contributes commands.
fn select_steps<'a>(
    config: &'a DependencyConfig,
    to_ref: &str,
    skip_migration: bool,
    skip_verify: bool,
) -> SelectedSteps<'a> {
    let change = config.change(to_ref);
    let mut selected = SelectedSteps {
        change,
        migration: None,
        verify: None,
        skipped: Vec::new(),
    };
    let Some(change) = change else {
        return selected;
    };

    if let Some(command) = config.migration_for(change) {
        if skip_migration {
            selected.skipped.push((Step::Migration, command.name.clone()));
        } else {
            selected.migration = Some(command);
        }
    }
    if let Some(command) = config.verify_for(change) {
        if skip_verify {
            selected.skipped.push((Step::Verify, command.name.clone()));
        } else {
            selected.verify = Some(command);
        }
    }
    selected
}

/// One claimed upgrade. The claim file mirrors the machine state so a
/// crashed or failed transaction can be found and repaired.
struct Transaction<'a> {
    layout: &'a ProjectLayout,
    store: SnapshotStore,
    machine: UpgradeMachine,
    claim: UpgradeClaim,
    snapshot: Option<SnapshotId>,
}

impl<'a> Transaction<'a> {
    fn begin(
        layout: &'a ProjectLayout,
        dependency: &str,
        from_ref: Option<&str>,
        to_ref: &str,
    ) -> Result<Self, UpgradeError> {
        layout.ensure_state_dirs().map_err(UpgradeError::Snapshot)?;
        let machine = UpgradeMachine::new();
        let claim = UpgradeClaim {
            txid: new_txid()?,
            pid: std::process::id(),
            dependency: dependency.to_string(),
            from_ref: from_ref.map(str::to_string),
            to_ref: to_ref.to_string(),
            snapshot_id: None,
            state: machine.state().as_str().to_string(),
            started_at: now_utc(),
        };
        acquire_claim(layout, &claim)?;
        debug!(dependency, txid = %claim.txid, "upgrade transaction started");

        Ok(Self {
            layout,
            store: SnapshotStore::new(layout.snapshots_dir()),
            machine,
            claim,
            snapshot: None,
        })
    }

    fn snapshot(&mut self, observer: &mut dyn UpgradeObserver) -> Result<(), UpgradeError> {
        let id = match self.store.create(&[self.layout.lock_path()]) {
            Ok(id) => id,
            Err(err) => {
                self.release();
                return Err(UpgradeError::Snapshot(err));
            }
        };
        self.claim.snapshot_id = Some(id.as_str().to_string());
        self.snapshot = Some(id);
        self.advance(UpgradeState::Snapshotted, observer)
    }

    /// Moves to `next`, rolling back if the move is not allowed.
    fn advance(
        &mut self,
        next: UpgradeState,
        observer: &mut dyn UpgradeObserver,
    ) -> Result<(), UpgradeError> {
        match self.enter(next, observer) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.rollback(err, observer)),
        }
    }

    fn enter(
        &mut self,
        next: UpgradeState,
        observer: &mut dyn UpgradeObserver,
    ) -> Result<(), UpgradeError> {
        let from = self.machine.advance(next)?;
        debug!(
            dependency = %self.claim.dependency,
            txid = %self.claim.txid,
            "upgrade {from} -> {next}"
        );
        observer.on_transition(from, next);

        self.claim.state = next.as_str().to_string();
        if matches!(next, UpgradeState::Committed | UpgradeState::RolledBack) {
            self.release();
        } else if let Err(err) = update_claim(self.layout, &self.claim) {
            warn!(
                dependency = %self.claim.dependency,
                txid = %self.claim.txid,
                "failed to record upgrade state {next}: {err:#}"
            );
        }
        Ok(())
    }

    fn commit(
        &mut self,
        observer: &mut dyn UpgradeObserver,
    ) -> Result<Vec<UpgradeState>, UpgradeError> {
        self.advance(UpgradeState::Committed, observer)?;
        self.discard_snapshot();
        Ok(self.machine.history().to_vec())
    }

    /// Restores the snapshot after `cause`. Returns `cause` when the project
    /// is back where it started, or a rollback failure that leaves the claim
    /// in place for `gitdep repair`.
    fn rollback(
        &mut self,
        cause: UpgradeError,
        observer: &mut dyn UpgradeObserver,
    ) -> UpgradeError {
        warn!(
            dependency = %self.claim.dependency,
            txid = %self.claim.txid,
            "upgrade failed, rolling back: {cause}"
        );
        let Some(id) = self.snapshot.clone() else {
            self.release();
            return cause;
        };
        if let Err(err) = self.enter(UpgradeState::RollingBack, observer) {
            warn!(txid = %self.claim.txid, "{err}");
        }

        match self.store.restore(&id) {
            Ok(()) => {
                if let Err(err) = self.enter(UpgradeState::RolledBack, observer) {
                    warn!(txid = %self.claim.txid, "{err}");
                    self.release();
                }
                self.discard_snapshot();
                info!(
                    dependency = %self.claim.dependency,
                    txid = %self.claim.txid,
                    "rolled back to snapshot {id}"
                );
                cause
            }
            Err(restore) => {
                if let Err(err) = self.enter(UpgradeState::RollbackFailed, observer) {
                    warn!(txid = %self.claim.txid, "{err}");
                }
                error!(
                    dependency = %self.claim.dependency,
                    txid = %self.claim.txid,
                    snapshot = %id,
                    "rollback failed: {restore:#}"
                );
                UpgradeError::RollbackFailed {
                    dependency: self.claim.dependency.clone(),
                    cause: Box::new(cause),
                    restore,
                    snapshot: Some(id),
                }
            }
        }
    }

    fn discard_snapshot(&mut self) {
        if let Some(id) = self.snapshot.take() {
            if let Err(err) = self.store.delete(&id) {
                warn!(txid = %self.claim.txid, snapshot = %id, "failed to delete snapshot: {err:#}");
            }
        }
    }

    fn release(&self) {
        if let Err(err) = release_claim(self.layout, &self.claim.dependency) {
            warn!(
                dependency = %self.claim.dependency,
                txid = %self.claim.txid,
                "failed to release upgrade claim: {err:#}"
            );
        }
    }
}
