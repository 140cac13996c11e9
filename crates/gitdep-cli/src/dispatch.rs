use anyhow::Result;

use crate::command_flows::{
    run_apply_flow, run_command_flow, run_kill_flow, run_ps_flow, run_repair_flow,
    run_status_flow, run_upgrade_flow, CliContext, UpgradeArgs,
};
use crate::completion::write_completions_script;
use crate::{Cli, Commands};

/// Runs one parsed invocation and returns the process exit code.
pub(crate) fn run_cli(cli: Cli) -> Result<u8> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        write_completions_script(shell, &mut stdout)?;
        return Ok(0);
    }

    let ctx = CliContext::new(cli.project, cli.verbose)?;
    match cli.command {
        Commands::Upgrade {
            dependency,
            to_ref,
            source,
            skip_migration,
            skip_verify,
            dry_run,
            timeout,
        } => run_upgrade_flow(
            &ctx,
            UpgradeArgs {
                dependency,
                to_ref,
                source,
                skip_migration,
                skip_verify,
                dry_run,
                timeout,
            },
        ),
        Commands::Apply {
            dependency,
            to_ref,
            source,
        } => run_apply_flow(&ctx, &dependency, &to_ref, source),
        Commands::Ps { repo } => run_ps_flow(&ctx, repo),
        Commands::Run { command, timeout } => run_command_flow(&ctx, &command, timeout),
        Commands::Status => run_status_flow(&ctx),
        Commands::Kill { pid } => run_kill_flow(&ctx, pid),
        Commands::Repair { dependency } => run_repair_flow(&ctx, &dependency),
        Commands::Completions { .. } => Ok(0),
    }
}
