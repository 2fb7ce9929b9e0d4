use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use spindle_core::{parse_specs, Spec, SpecHash};
use spindle_installer::{
    Database, InstallPlan, InstallReport, InstallStatus, InstallStep, InstalledRecord, Installer,
    PrefixBuilder, PrefixRemover, Query, UninstallCoordinator, UninstallError, UninstallOptions,
    UninstallReport,
};
use spindle_resolver::Concretizer;
use tracing::debug;

use crate::metadata::StoreContext;
use crate::render::{render_status_line, OutputStyle, TerminalRenderer};
use crate::UninstallArgs;

pub(crate) fn parse_spec_args(args: &[String]) -> Result<Vec<Spec>> {
    let joined = args.join(" ");
    let specs = parse_specs(&joined).with_context(|| format!("invalid spec '{joined}'"))?;
    if specs.is_empty() {
        return Err(anyhow!("expected at least one spec"));
    }
    Ok(specs)
}

/// `/hash` arguments stand alone; everything else is spec syntax.
pub(crate) fn parse_query_args(args: &[String]) -> Result<Vec<Query>> {
    let mut queries = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let flush = |pending: &mut Vec<String>, queries: &mut Vec<Query>| -> Result<()> {
        if !pending.is_empty() {
            queries.extend(parse_spec_args(pending)?.into_iter().map(Query::Spec));
            pending.clear();
        }
        Ok(())
    };
    for arg in args {
        if arg.trim_start().starts_with('/') {
            flush(&mut pending, &mut queries)?;
            queries.push(Query::parse(arg).with_context(|| format!("invalid hash '{arg}'"))?);
        } else {
            pending.push(arg.clone());
        }
    }
    flush(&mut pending, &mut queries)?;
    Ok(queries)
}

/// Node text without its dependencies.
pub(crate) fn node_label(spec: &Spec) -> String {
    let mut node = spec.clone();
    node.dependencies.clear();
    node.to_string()
}

/// One line per edge, children indented under parents and marked `^`.
/// `[+]` flags installed nodes. A concrete node reached again along another
/// path gets its line but not its subtree.
pub(crate) fn format_spec_tree_lines(
    spec: &Spec,
    is_installed: &dyn Fn(&SpecHash) -> bool,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut expanded = BTreeSet::new();
    push_tree_lines(spec, 0, is_installed, &mut expanded, &mut lines);
    lines
}

fn push_tree_lines<'s>(
    spec: &'s Spec,
    depth: usize,
    is_installed: &dyn Fn(&SpecHash) -> bool,
    expanded: &mut BTreeSet<&'s SpecHash>,
    lines: &mut Vec<String>,
) {
    let (status, hash) = match spec.hash() {
        Some(hash) if is_installed(hash) => ("[+]", hash.short()),
        Some(hash) => (" - ", hash.short()),
        None => ("   ", "       "),
    };
    let caret = if depth == 0 { "" } else { "^" };
    lines.push(format!(
        "{status}  {hash}  {}{caret}{}",
        "    ".repeat(depth),
        node_label(spec)
    ));
    if let Some(hash) = spec.hash() {
        if !expanded.insert(hash) {
            return;
        }
    }
    for edge in &spec.dependencies {
        push_tree_lines(&edge.spec, depth + 1, is_installed, expanded, lines);
    }
}

pub(crate) fn run_spec_command(
    context: &StoreContext,
    text: &str,
    json: bool,
    renderer: TerminalRenderer,
) -> Result<()> {
    let requests = parse_spec_args(&[text.to_string()])?;
    let catalog = context.load_catalog()?;
    let config = context.concretizer_config()?;
    let database = context.database()?;
    let installed = database.records();
    let concretizer = Concretizer::new(&catalog, &config)
        .with_installed(installed.iter().map(|record| &record.spec));

    for request in &requests {
        let concrete = concretizer
            .concretize(request)
            .with_context(|| format!("failed to concretize {request}"))?;
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&concrete).context("failed to serialize spec")?
            );
            continue;
        }
        renderer.print_section("Input spec");
        println!("{request}");
        renderer.print_section("Concretized");
        renderer.print_lines(&format_spec_tree_lines(&concrete, &|hash| {
            database.contains(hash)
        }));
    }
    Ok(())
}

pub(crate) fn format_install_step_line(step: &InstallStep, style: OutputStyle) -> String {
    let label = step.spec.format_short();
    match &step.status {
        InstallStatus::Installed => render_status_line(style, "ok", &format!("installed {label}")),
        InstallStatus::AlreadyInstalled => {
            render_status_line(style, "step", &format!("{label} is already installed"))
        }
        InstallStatus::Failed(failure) => render_status_line(
            style,
            "error",
            &format!("failed to install {label}: {}", failure.reason),
        ),
        InstallStatus::Skipped { failed_dependency } => render_status_line(
            style,
            "skip",
            &format!("skipped {label}: dependency {failed_dependency} failed"),
        ),
    }
}

pub(crate) fn format_install_summary_line(report: &InstallReport) -> String {
    format!(
        "{} installed, {} already installed, {} failed",
        report.installed(),
        report.already_installed(),
        report.failures().len()
    )
}

pub(crate) fn run_install_command(
    context: &StoreContext,
    specs: &[String],
    env_name: Option<&str>,
    renderer: TerminalRenderer,
) -> Result<()> {
    let requests = parse_spec_args(specs)?;
    context.layout.ensure_base_dirs()?;
    let catalog = context.load_catalog()?;
    let config = context.concretizer_config()?;
    let database = context.database()?;
    let installer = Installer::new(&context.layout, &database, &catalog, &config);

    let plan = match env_name {
        Some(name) => {
            let environments = context.environments();
            let mut environment = environments.load_active(name)?;
            for request in requests {
                if !environment.add_root(request.clone()) {
                    debug!(env = %name, spec = %request, "root already present");
                }
            }
            let installed = database.records();
            let concretizer = Concretizer::new(&catalog, &config)
                .with_installed(installed.iter().map(|record| &record.spec));
            environment.concretize(&concretizer)?;
            environments.save(&environment)?;
            installer.plan_concrete(environment.concrete.clone())?
        }
        None => installer.plan(&requests)?,
    };

    let report = execute_install_plan(&installer, &plan, &PrefixBuilder::new(&catalog), renderer);
    renderer.print_status(
        if report.is_success() { "ok" } else { "warn" },
        &format_install_summary_line(&report),
    );
    if !report.is_success() {
        return Err(anyhow!(
            "{} package(s) were not installed",
            report.failures().len()
        ));
    }
    Ok(())
}

fn execute_install_plan(
    installer: &Installer<'_>,
    plan: &InstallPlan,
    builder: &PrefixBuilder<'_>,
    renderer: TerminalRenderer,
) -> InstallReport {
    let mut progress = renderer.start_progress("install", plan.order.len() as u64);
    let style = renderer.style();
    let report = installer.execute(plan, builder, &mut |step: &InstallStep| {
        progress.println(&format_install_step_line(step, style));
        progress.advance(&step.spec.name);
    });
    if report.is_success() {
        progress.finish_success();
    } else {
        progress.finish_abandon();
    }
    report
}

pub(crate) fn uninstall_targets(args: &UninstallArgs) -> Result<Vec<Query>> {
    if args.specs.is_empty() {
        if args.all {
            return Ok(vec![Query::Any]);
        }
        return Err(anyhow!("uninstall requires at least one spec, or --all"));
    }
    parse_query_args(&args.specs)
}

pub(crate) fn uninstall_options(args: &UninstallArgs) -> UninstallOptions {
    UninstallOptions {
        force: args.force,
        remove_dependents: args.dependents,
        assume_yes: args.yes_to_all,
        allow_multiple: args.all,
    }
}

pub(crate) fn format_removal_plan_lines(records: &[InstalledRecord]) -> Vec<String> {
    let mut lines = vec!["The following packages will be uninstalled:".to_string()];
    lines.extend(records.iter().map(|record| format!("    {}", record.display())));
    lines
}

pub(crate) fn format_uninstall_error_lines(err: &UninstallError) -> Vec<String> {
    match err {
        UninstallError::AmbiguousTarget { targets } => {
            let mut lines = Vec::new();
            for target in targets {
                lines.push(format!("{} matches multiple packages:", target.target));
                lines.extend(target.matches.iter().map(|spec| format!("    {spec}")));
            }
            lines.push(
                "use a more specific spec, a /hash, or --all to remove every match".to_string(),
            );
            lines
        }
        UninstallError::BlockedByDependents { blocked, guidance } => {
            let mut lines = Vec::new();
            for spec in blocked {
                lines.push(format!("will not uninstall {}", spec.spec));
                if !spec.dependents.is_empty() {
                    lines.push(format!(
                        "    still required by: {}",
                        spec.dependents.join(", ")
                    ));
                }
                if !spec.environments.is_empty() {
                    lines.push(format!(
                        "    still used by environments: {}",
                        spec.environments.join(", ")
                    ));
                }
            }
            lines.extend(guidance.iter().cloned());
            lines
        }
        UninstallError::RemovalFailed { failures } => failures
            .iter()
            .map(|failure| format!("failed to remove {}: {}", failure.record.display(), failure.reason))
            .collect(),
        other => vec![other.to_string()],
    }
}

pub(crate) fn run_uninstall_command(
    context: &StoreContext,
    args: &UninstallArgs,
    env_name: Option<&str>,
    renderer: TerminalRenderer,
) -> Result<()> {
    let targets = uninstall_targets(args)?;
    let options = uninstall_options(args);
    let database: Database = context.database()?;
    let environments = context.environments();
    let mut active = context.active_environment(env_name)?;
    let remover = PrefixRemover::new(&context.layout);
    let coordinator = UninstallCoordinator::new(&database, &environments, &remover);

    let mut confirm = |records: &[InstalledRecord]| {
        renderer.print_lines(&format_removal_plan_lines(records));
        renderer.confirm("Do you want to proceed?")
    };
    let outcome = coordinator.uninstall(&targets, &options, active.as_mut(), &mut confirm);

    let report = match outcome {
        Ok(report) => report,
        Err(UninstallError::EnvironmentNotSaved { name, reason, report }) => {
            for (status, line) in format_uninstall_report_lines(&report) {
                renderer.print_status(status, &line);
            }
            return Err(anyhow!("environment '{name}' was not saved: {reason}"));
        }
        Err(err) => {
            for line in format_uninstall_error_lines(&err) {
                renderer.print_status("error", &line);
            }
            return Err(err.into());
        }
    };

    if report.is_empty() {
        renderer.print_status("warn", "there are no packages to uninstall");
        return Ok(());
    }
    for (status, line) in format_uninstall_report_lines(&report) {
        renderer.print_status(status, &line);
    }
    Ok(())
}

/// Status-tagged lines for a finished uninstall: removals, then per-target
/// failures, then a tally when the run was partial.
pub(crate) fn format_uninstall_report_lines(report: &UninstallReport) -> Vec<(&'static str, String)> {
    let mut lines = report
        .removed
        .iter()
        .map(|record| ("ok", format!("uninstalled {}", record.display())))
        .collect::<Vec<_>>();
    lines.extend(report.failed.iter().map(|failure| {
        (
            "error",
            format!("failed to remove {}: {}", failure.record.display(), failure.reason),
        )
    }));
    if !report.is_complete() {
        lines.push((
            "warn",
            format!(
                "{} of {} packages could not be uninstalled",
                report.failed.len(),
                report.failed.len() + report.removed.len()
            ),
        ));
    }
    lines
}
