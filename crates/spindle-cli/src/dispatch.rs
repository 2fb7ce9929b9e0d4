use anyhow::Result;
use spindle_installer::Relation;

use crate::command_flows::{
    run_env_command, run_find_command, run_info_command, run_list_command, run_relatives_command,
};
use crate::completion::write_completions_script;
use crate::core_flows::{run_install_command, run_spec_command, run_uninstall_command};
use crate::metadata::StoreContext;
use crate::render::TerminalRenderer;
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let env_name = cli.env.as_deref();

    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        return write_completions_script(shell, &mut stdout);
    }

    let context = StoreContext::open(cli.root.as_deref(), cli.registry_root.as_deref())?;

    match &cli.command {
        Commands::Spec { spec, json } => run_spec_command(&context, spec, *json, renderer)?,
        Commands::Install { specs } => run_install_command(&context, specs, env_name, renderer)?,
        Commands::Uninstall(args) => run_uninstall_command(&context, args, env_name, renderer)?,
        Commands::Find { spec } => {
            run_find_command(&context, spec.as_deref(), env_name, renderer)?
        }
        Commands::Dependents { spec, transitive } => run_relatives_command(
            &context,
            spec,
            Relation::Parents,
            *transitive,
            env_name,
            renderer,
        )?,
        Commands::Dependencies { spec, transitive } => run_relatives_command(
            &context,
            spec,
            Relation::Children,
            *transitive,
            env_name,
            renderer,
        )?,
        Commands::Info { name } => run_info_command(&context, name, renderer)?,
        Commands::List { query } => run_list_command(&context, query.as_deref(), renderer)?,
        Commands::Env { command } => run_env_command(&context, command, env_name, renderer)?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
