use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use spindle_core::SpecHash;
use spindle_installer::{Database, Environment, InstalledRecord, Query, Relation};
use spindle_resolver::Concretizer;

use crate::core_flows::{parse_query_args, parse_spec_args};
use crate::metadata::{format_info_lines, StoreContext};
use crate::render::TerminalRenderer;
use crate::EnvCommands;

pub(crate) fn format_record_lines(records: &[InstalledRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let marker = if record.explicit { "" } else { " (dependency)" };
            format!("{}{marker}", record.display())
        })
        .collect()
}

fn scope_hashes(active: Option<&Environment>) -> Option<BTreeSet<SpecHash>> {
    active.map(Environment::all_hashes)
}

pub(crate) fn run_find_command(
    context: &StoreContext,
    spec: Option<&str>,
    env_name: Option<&str>,
    renderer: TerminalRenderer,
) -> Result<()> {
    let queries = match spec {
        Some(text) => parse_query_args(&[text.to_string()])?,
        None => vec![Query::Any],
    };
    let database = context.database()?;
    let active = context.active_environment(env_name)?;
    let scope = scope_hashes(active.as_ref());

    let mut matching = Vec::new();
    for query in &queries {
        for record in database.query(query, scope.as_ref()) {
            if !matching.iter().any(|seen: &InstalledRecord| seen.hash == record.hash) {
                matching.push(record);
            }
        }
    }

    if matching.is_empty() {
        renderer.print_status("warn", "no installed package matches the query");
        return Ok(());
    }
    renderer.print_section(&format!("{} installed packages", matching.len()));
    renderer.print_lines(&format_record_lines(&matching));
    Ok(())
}

/// The one installed record `text` names; zero or several matches are errors.
pub(crate) fn resolve_single_installed(
    database: &Database,
    text: &str,
    active: Option<&Environment>,
) -> Result<InstalledRecord> {
    let queries = parse_query_args(&[text.to_string()])?;
    let [query] = queries.as_slice() else {
        return Err(anyhow!("expected exactly one spec, got '{text}'"));
    };
    let scope = scope_hashes(active);
    let mut matching = database.query(query, scope.as_ref());
    match matching.len() {
        0 => Err(anyhow!("{text} does not match any installed package")),
        1 => Ok(matching.remove(0)),
        _ => {
            let candidates = matching
                .iter()
                .map(InstalledRecord::display)
                .collect::<Vec<_>>()
                .join(", ");
            Err(anyhow!("{text} matches multiple packages: {candidates}"))
        }
    }
}

pub(crate) fn run_relatives_command(
    context: &StoreContext,
    text: &str,
    relation: Relation,
    transitive: bool,
    env_name: Option<&str>,
    renderer: TerminalRenderer,
) -> Result<()> {
    let database = context.database()?;
    let active = context.active_environment(env_name)?;
    let record = resolve_single_installed(&database, text, active.as_ref())?;
    let relatives = database.installed_relatives(&record.hash, relation, transitive);

    let noun = match relation {
        Relation::Parents => "dependents",
        Relation::Children => "dependencies",
    };
    if relatives.is_empty() {
        renderer.print_status("step", &format!("{} has no installed {noun}", record.display()));
        return Ok(());
    }
    renderer.print_section(&format!("{} installed {noun}", relatives.len()));
    renderer.print_lines(&format_record_lines(&relatives));
    Ok(())
}

pub(crate) fn run_info_command(
    context: &StoreContext,
    name: &str,
    renderer: TerminalRenderer,
) -> Result<()> {
    match context.registry().package_declaration(name)? {
        Some(declaration) => renderer.print_lines(&format_info_lines(&declaration)),
        None => renderer.print_status("warn", &format!("No package found: {name}")),
    }
    Ok(())
}

pub(crate) fn run_list_command(
    context: &StoreContext,
    query: Option<&str>,
    renderer: TerminalRenderer,
) -> Result<()> {
    let names = context.registry().search_names(query.unwrap_or(""))?;
    if names.is_empty() {
        renderer.print_status("warn", "no packages found");
        return Ok(());
    }
    renderer.print_lines(&names);
    Ok(())
}

pub(crate) fn format_environment_list_lines(
    environments: &[Environment],
    active: Option<&str>,
) -> Vec<String> {
    environments
        .iter()
        .map(|environment| {
            let marker = if Some(environment.name.as_str()) == active { "*" } else { " " };
            format!(
                "{marker} {} ({} roots)",
                environment.name,
                environment.roots.len()
            )
        })
        .collect()
}

/// Re-resolves every root together, reusing what is installed.
fn concretize_environment(context: &StoreContext, environment: &mut Environment) -> Result<()> {
    let catalog = context.load_catalog()?;
    let config = context.concretizer_config()?;
    let database = context.database()?;
    let installed = database.records();
    let concretizer = Concretizer::new(&catalog, &config)
        .with_installed(installed.iter().map(|record| &record.spec));
    environment.concretize(&concretizer)
}

fn require_env<'a>(env_name: Option<&'a str>, command: &str) -> Result<&'a str> {
    env_name.ok_or_else(|| anyhow!("`spindle env {command}` requires --env <name>"))
}

pub(crate) fn run_env_command(
    context: &StoreContext,
    command: &EnvCommands,
    env_name: Option<&str>,
    renderer: TerminalRenderer,
) -> Result<()> {
    let environments = context.environments();
    match command {
        EnvCommands::Create { name } => {
            environments.create(name)?;
            renderer.print_status("ok", &format!("created environment '{name}'"));
        }
        EnvCommands::List => {
            let all = environments.all()?;
            if all.is_empty() {
                renderer.print_status("warn", "no environments");
            } else {
                renderer.print_lines(&format_environment_list_lines(&all, env_name));
            }
        }
        EnvCommands::Add { specs } => {
            let name = require_env(env_name, "add")?;
            let mut environment = environments.load_active(name)?;
            for spec in parse_spec_args(specs)? {
                let label = spec.to_string();
                if environment.add_root(spec) {
                    renderer.print_status("ok", &format!("added {label} to '{name}'"));
                } else {
                    renderer.print_status("warn", &format!("{label} is already a root of '{name}'"));
                }
            }
            concretize_environment(context, &mut environment)?;
            environments.save(&environment)?;
        }
        EnvCommands::Remove { specs } => {
            let name = require_env(env_name, "remove")?;
            let mut environment = environments.load_active(name)?;
            for spec in parse_spec_args(specs)? {
                if environment.remove_root(&spec) {
                    renderer.print_status("ok", &format!("removed {spec} from '{name}'"));
                } else {
                    return Err(anyhow!("{spec} is not a root of environment '{name}'"));
                }
            }
            if !environment.roots.is_empty() {
                concretize_environment(context, &mut environment)?;
            }
            environments.save(&environment)?;
        }
        EnvCommands::Destroy { name, yes_to_all } => {
            if env_name == Some(name.as_str()) {
                return Err(anyhow!("environment '{name}' is active and cannot be destroyed"));
            }
            if !environments.exists(name) {
                return Err(anyhow!("environment '{name}' does not exist"));
            }
            if !*yes_to_all && !renderer.confirm(&format!("Really destroy environment '{name}'?")) {
                renderer.print_status("warn", "will not destroy any environment");
                return Ok(());
            }
            environments.destroy(name)?;
            renderer.print_status("ok", &format!("destroyed environment '{name}'"));
        }
    }
    Ok(())
}
