use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use gitdep_core::timestamp::format_rfc3339;
use gitdep_core::{parse_command_ref, Command, LockFile};
use gitdep_exec::{kill_process_tree, OutputLine, OutputStream};
use gitdep_registry::{process_alive, ProcessEntry, ProcessRegistry};
use gitdep_source::GitUpstream;
use gitdep_state::{list_claims, read_lock_file, CacheLayout, ProjectLayout, UpgradeClaim};
use gitdep_upgrade::{
    ApplyRequest, Orchestrator, RepairOutcome, Step, UpgradeError, UpgradeObserver,
    UpgradeOutcome, UpgradePlan, UpgradeRequest,
};
use indicatif::ProgressBar;
use time::OffsetDateTime;
use tracing::debug;

use crate::render::{render_status_line, OutputStyle, TerminalRenderer};

pub(crate) struct CliContext {
    pub(crate) layout: ProjectLayout,
    pub(crate) cache: CacheLayout,
    pub(crate) renderer: TerminalRenderer,
    pub(crate) verbose: bool,
}

impl CliContext {
    pub(crate) fn new(project: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let root = match project {
            Some(root) => root,
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        let cache = CacheLayout::from_env()?;
        debug!(
            project = %root.display(),
            cache = %cache.root().display(),
            "resolved gitdep context"
        );
        Ok(Self {
            layout: ProjectLayout::new(root),
            cache,
            renderer: TerminalRenderer::current(),
            verbose,
        })
    }

    fn registry(&self) -> ProcessRegistry {
        ProcessRegistry::new(self.cache.processes_dir())
    }

    fn orchestrator(&self) -> Orchestrator<GitUpstream> {
        Orchestrator::new(self.layout.clone(), GitUpstream::new(self.cache.repos_dir()))
            .with_registry(self.registry())
    }
}

pub(crate) struct UpgradeArgs {
    pub(crate) dependency: String,
    pub(crate) to_ref: String,
    pub(crate) source: Option<String>,
    pub(crate) skip_migration: bool,
    pub(crate) skip_verify: bool,
    pub(crate) dry_run: bool,
    pub(crate) timeout: Option<Duration>,
}

/// Shows progress on the spinner and, when asked, streams command output.
struct CliObserver {
    spinner: Option<ProgressBar>,
    stream_output: bool,
}

impl CliObserver {
    fn new(spinner: Option<ProgressBar>, stream_output: bool) -> Self {
        Self {
            spinner,
            stream_output,
        }
    }

    fn finish(&self) {
        if let Some(spinner) = &self.spinner {
            spinner.finish_and_clear();
        }
    }
}

impl UpgradeObserver for CliObserver {
    fn on_step_started(&mut self, step: Step, command: &Command, pid: u32) {
        if let Some(spinner) = &self.spinner {
            spinner.set_message(format!("{step} '{}' (pid {pid})", command.name));
        }
    }

    fn on_output(&mut self, _step: Step, line: &OutputLine) {
        if !self.stream_output {
            return;
        }
        let print = || match line.stream {
            OutputStream::Stdout => println!("{}", line.text),
            OutputStream::Stderr => eprintln!("{}", line.text),
        };
        match &self.spinner {
            Some(spinner) => spinner.suspend(print),
            None => print(),
        }
    }
}

pub(crate) fn run_upgrade_flow(ctx: &CliContext, args: UpgradeArgs) -> Result<u8> {
    let mut request = UpgradeRequest::new(&args.dependency, &args.to_ref)
        .skip_migration(args.skip_migration)
        .skip_verify(args.skip_verify)
        .with_timeout(args.timeout);
    if let Some(source) = args.source {
        request = request.with_source(source);
    }
    let orchestrator = ctx.orchestrator();

    if args.dry_run {
        let plan = orchestrator.plan(&request)?;
        ctx.renderer
            .print_section(&format!("upgrade plan for {}", args.dependency));
        ctx.renderer.print_lines(&format_plan_lines(&plan));
        return Ok(0);
    }

    let spinner = ctx.renderer.start_spinner(&format!(
        "upgrading {} to {}",
        args.dependency, args.to_ref
    ));
    let mut observer = CliObserver::new(spinner, ctx.verbose);
    let result = orchestrator.upgrade(&request, &mut observer);
    observer.finish();

    match result {
        Ok(outcome) => {
            ctx.renderer
                .print_lines(&format_upgrade_outcome_lines(&outcome, ctx.renderer.style()));
            Ok(0)
        }
        Err(err) => {
            ctx.renderer
                .print_lines(&format_failure_lines(&err, ctx.renderer.style(), true));
            Err(err.into())
        }
    }
}

pub(crate) fn run_apply_flow(
    ctx: &CliContext,
    dependency: &str,
    to_ref: &str,
    source: Option<String>,
) -> Result<u8> {
    let mut request = ApplyRequest::new(dependency, to_ref);
    if let Some(source) = source {
        request = request.with_source(source);
    }
    let mut observer = CliObserver::new(None, false);
    let outcome = ctx.orchestrator().apply(&request, &mut observer)?;
    ctx.renderer
        .print_lines(&format_upgrade_outcome_lines(&outcome, ctx.renderer.style()));
    Ok(0)
}

pub(crate) fn run_command_flow(
    ctx: &CliContext,
    command_ref: &str,
    timeout: Option<Duration>,
) -> Result<u8> {
    let (dependency, command) =
        parse_command_ref(command_ref).map_err(UpgradeError::Validation)?;
    let mut observer = CliObserver::new(None, true);

    match ctx
        .orchestrator()
        .run_command(&dependency, &command, timeout, &mut observer)
    {
        Ok(output) => Ok(output
            .exit_code
            .map_or(1, |code| u8::try_from(code).unwrap_or(1))),
        Err(err) => {
            if err.step_failure().is_some() {
                ctx.renderer
                    .print_lines(&format_failure_lines(&err, ctx.renderer.style(), false));
            }
            Err(err.into())
        }
    }
}

pub(crate) fn run_ps_flow(ctx: &CliContext, repo: Option<PathBuf>) -> Result<u8> {
    let registry = ctx.registry();
    let entries = match repo {
        Some(repo) => registry.list_active_for_repo(&repo)?,
        None => registry.list_active()?,
    };
    ctx.renderer.print_lines(&format_process_rows(&entries));
    Ok(0)
}

pub(crate) fn run_status_flow(ctx: &CliContext) -> Result<u8> {
    let lock = read_lock_file(&ctx.layout.lock_path())?;
    let claims = list_claims(&ctx.layout)?;
    ctx.renderer.print_section("dependencies");
    ctx.renderer.print_lines(&format_status_lines(
        lock.as_ref(),
        &claims,
        ctx.renderer.style(),
    ));
    Ok(0)
}

pub(crate) fn run_kill_flow(ctx: &CliContext, pid: u32) -> Result<u8> {
    let registry = ctx.registry();
    let Some(entry) = registry.get(pid)? else {
        return Err(anyhow!(
            "pid {pid} is not a registered gitdep process (see `gitdep ps`)"
        ));
    };

    if process_alive(pid)? {
        kill_process_tree(pid)?;
        registry.deregister(pid)?;
        ctx.renderer.print_status(
            "ok",
            &format!("killed pid {pid} ({})", entry.command),
        );
    } else {
        registry.deregister(pid)?;
        ctx.renderer.print_status(
            "warn",
            &format!("pid {pid} had already exited; removed its registry record"),
        );
    }
    Ok(0)
}

pub(crate) fn run_repair_flow(ctx: &CliContext, dependency: &str) -> Result<u8> {
    let outcome = ctx.orchestrator().repair(dependency)?;
    ctx.renderer.print_lines(&format_repair_lines(
        dependency,
        &outcome,
        ctx.renderer.style(),
    ));
    Ok(0)
}

fn format_timestamp(value: &OffsetDateTime) -> String {
    format_rfc3339(value).unwrap_or_else(|_| value.to_string())
}

pub(crate) fn format_process_rows(entries: &[ProcessEntry]) -> Vec<String> {
    if entries.is_empty() {
        return vec!["no running gitdep processes".to_string()];
    }

    let mut lines = vec![format!(
        "{:<8} {:<10} {:<25} {:<30} COMMAND",
        "PID", "STATUS", "STARTED", "REPO"
    )];
    for entry in entries {
        let repo = entry
            .repo
            .as_ref()
            .map(|repo| repo.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "{:<8} {:<10} {:<25} {:<30} {}",
            entry.pid,
            entry.status.to_string(),
            format_timestamp(&entry.start_time),
            repo,
            entry.command
        ));
    }
    lines
}

pub(crate) fn format_status_lines(
    lock: Option<&LockFile>,
    claims: &[UpgradeClaim],
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = Vec::new();
    match lock {
        Some(lock) if !lock.dependencies.is_empty() => {
            for (name, entry) in &lock.dependencies {
                lines.push(format!(
                    "{name} {} {} {}",
                    entry.reference,
                    entry.commit.short(),
                    format_timestamp(&entry.consumed_at)
                ));
            }
        }
        _ => lines.push("no locked dependencies".to_string()),
    }

    for claim in claims {
        let message = if claim.requires_repair() {
            format!(
                "{}: rollback failed (txid={}); inspect the project and run `gitdep repair {}`",
                claim.dependency, claim.txid, claim.dependency
            )
        } else {
            format!(
                "{}: upgrade to {} pending (txid={} pid={} state={})",
                claim.dependency, claim.to_ref, claim.txid, claim.pid, claim.state
            )
        };
        lines.push(render_status_line(style, "warn", &message));
    }
    lines
}

pub(crate) fn format_plan_lines(plan: &UpgradePlan) -> Vec<String> {
    let from = plan
        .previous
        .as_ref()
        .map(|entry| format!("{} ({})", entry.reference, entry.commit.short()))
        .unwrap_or_else(|| "(not locked)".to_string());
    let mut lines = vec![
        format!("dependency: {}", plan.dependency),
        format!("source: {}", plan.source),
        format!("from: {from}"),
        format!("to: {} ({})", plan.to_ref, plan.commit.short()),
    ];

    match &plan.change {
        Some(change) => {
            let kind = change.change_type.as_deref().unwrap_or("unspecified");
            lines.push(format!("change: {kind}: {}", change.description));
        }
        None => lines.push("change: none declared".to_string()),
    }
    if let Some(command) = &plan.migration {
        lines.push(format!("migration: {} ({})", command.name, command.run));
    }
    if let Some(command) = &plan.verify {
        lines.push(format!("verify: {} ({})", command.name, command.run));
    }
    for (step, command) in &plan.skipped {
        lines.push(format!("skipped {step}: {command}"));
    }

    let transitions = plan
        .transitions
        .iter()
        .map(|state| state.as_str())
        .collect::<Vec<_>>();
    lines.push(format!("transitions: {}", transitions.join(" -> ")));
    if let Some(claim) = &plan.blocked_by {
        lines.push(format!(
            "blocked: claim txid={} state={} pid={}",
            claim.txid, claim.state, claim.pid
        ));
    }
    lines
}

pub(crate) fn format_upgrade_outcome_lines(
    outcome: &UpgradeOutcome,
    style: OutputStyle,
) -> Vec<String> {
    let from = outcome
        .previous
        .as_ref()
        .map(|entry| entry.reference.as_str())
        .unwrap_or("(none)");
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "{}: {from} -> {} ({})",
            outcome.dependency,
            outcome.entry.reference,
            outcome.entry.commit.short()
        ),
    )];
    for step in &outcome.steps {
        lines.push(format!(
            "  {} '{}' exited 0 (log: {})",
            step.step,
            step.command,
            step.log_path.display()
        ));
    }
    lines
}

/// The failed step, what it printed, and whether the lock file was restored.
pub(crate) fn format_failure_lines(
    err: &UpgradeError,
    style: OutputStyle,
    transactional: bool,
) -> Vec<String> {
    let mut lines = Vec::new();

    if let Some(failure) = err.step_failure() {
        lines.push(render_status_line(
            style,
            "err",
            &format!(
                "{} command '{}' {}",
                failure.step,
                failure.command,
                failure.reason()
            ),
        ));
        let captured = failure.output.combined();
        if captured.is_empty() {
            lines.push("  (no output captured)".to_string());
        } else {
            lines.push(format!("--- output of {} '{}' ---", failure.step, failure.command));
            lines.extend(captured.lines().map(str::to_string));
            lines.push("---".to_string());
        }
        if let Some(log_path) = &failure.log_path {
            lines.push(format!("  log: {}", log_path.display()));
        }
    }

    if !transactional {
        return lines;
    }
    match err {
        UpgradeError::RollbackFailed {
            dependency,
            snapshot,
            ..
        } => {
            lines.push(render_status_line(
                style,
                "err",
                &format!(
                    "ROLLBACK FAILED: dependency.lock may be inconsistent (snapshot {}); inspect the project and run `gitdep repair {dependency}`",
                    snapshot.as_ref().map(|id| id.as_str()).unwrap_or("none")
                ),
            ));
        }
        err if err.rolled_back() => {
            lines.push(render_status_line(
                style,
                "ok",
                "rolled back: dependency.lock restored to its previous state",
            ));
        }
        _ => {}
    }
    lines
}

pub(crate) fn format_repair_lines(
    dependency: &str,
    outcome: &RepairOutcome,
    style: OutputStyle,
) -> Vec<String> {
    let Some(claim) = &outcome.claim else {
        return vec![render_status_line(
            style,
            "ok",
            &format!("{dependency}: nothing to repair"),
        )];
    };

    let mut lines = Vec::new();
    if let Some(snapshot) = &outcome.restored {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("{dependency}: restored snapshot {snapshot}"),
        ));
    }
    lines.push(render_status_line(
        style,
        "ok",
        &format!(
            "{dependency}: cleared claim txid={} (state={})",
            claim.txid, claim.state
        ),
    ));
    lines
}
