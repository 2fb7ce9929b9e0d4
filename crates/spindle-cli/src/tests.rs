use super::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use spindle_core::{
    CompilerSpec, DependencySpec, DependencyTypes, PackageDeclaration, Spec, Version,
    VersionConstraint,
};
use std::sync::Arc;
use spindle_installer::{
    AmbiguousMatch, BlockedSpec, InstalledRecord, Query, RemovalFailure, StoreConfig, StoreLayout,
    UninstallError, UninstallReport,
};

use crate::command_flows::{format_environment_list_lines, resolve_single_installed};
use crate::core_flows::{
    format_spec_tree_lines, format_uninstall_error_lines, format_uninstall_report_lines,
    node_label, parse_query_args,
    parse_spec_args, run_install_command, run_uninstall_command, uninstall_options,
    uninstall_targets,
};
use crate::logger::log_filter;
use crate::metadata::{format_info_lines, select_registry_root, StoreContext};
use crate::render::{
    output_style_for, parse_confirmation, render_progress_line, render_section_header,
    render_status_line, OutputStyle, TerminalRenderer,
};

const HDF5: &str = r#"
name = "hdf5"
build_system = "cmake"
description = "Hierarchical data format"
versions = [{ version = "1.14.3" }, { version = "1.12.2", preferred = true }]
variants = [
  { name = "mpi", default = false, description = "parallel I/O" },
  { name = "build_type", default = "Release", values = ["Debug", "Release"] },
]
dependencies = [{ spec = "zlib@1.2:" }, { spec = "cmake", types = ["build"] }]
conflicts = [{ with = "%intel", when = "+mpi", message = "parallel builds need gcc" }]
"#;

const ZLIB: &str = r#"
name = "zlib"
build_system = "autotools"
versions = [{ version = "1.3" }, { version = "1.2.13" }]
"#;

const CMAKE: &str = r#"
name = "cmake"
versions = [{ version = "3.27.9" }]
"#;

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "spindle-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    build_test_layout_path(nanos)
}

/// A store root whose default registry holds the test declarations.
fn test_context() -> StoreContext {
    let root = test_root();
    let layout = StoreLayout::new(&root);
    for (name, text) in [("hdf5", HDF5), ("zlib", ZLIB), ("cmake", CMAKE)] {
        let dir = layout.default_registry_dir().join("packages").join(name);
        fs::create_dir_all(&dir).expect("must create registry dir");
        fs::write(dir.join("package.toml"), text).expect("must write declaration");
    }
    StoreContext::open(Some(root.as_path()), None).expect("must open store")
}

fn plain() -> TerminalRenderer {
    TerminalRenderer::from_style(OutputStyle::Plain)
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    let first = build_test_layout_path(42);
    let second = build_test_layout_path(42);
    assert_ne!(
        first, second,
        "test layout paths must remain unique when timestamp granularity is coarse"
    );
}

#[test]
fn cli_parses_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from([
        "spindle",
        "install",
        "hdf5+mpi",
        "^zlib@1.3",
        "--root",
        "/tmp/store",
        "--env",
        "dev",
        "-v",
    ])
    .expect("command must parse");

    assert_eq!(cli.root.as_deref(), Some(Path::new("/tmp/store")));
    assert_eq!(cli.env.as_deref(), Some("dev"));
    assert!(cli.verbose);
    match cli.command {
        Commands::Install { specs } => assert_eq!(specs, vec!["hdf5+mpi", "^zlib@1.3"]),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_parses_uninstall_short_flags() {
    let cli = Cli::try_parse_from(["spindle", "uninstall", "zlib", "-f", "-R", "-y", "-a"])
        .expect("command must parse");

    match cli.command {
        Commands::Uninstall(args) => {
            assert_eq!(args.specs, vec!["zlib"]);
            let options = uninstall_options(&args);
            assert!(options.force);
            assert!(options.remove_dependents);
            assert!(options.assume_yes);
            assert!(options.allow_multiple);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_requires_specs_for_install() {
    let err = Cli::try_parse_from(["spindle", "install"]).expect_err("install needs a spec");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn cli_parses_env_and_relatives_subcommands() {
    let cli = Cli::try_parse_from(["spindle", "env", "add", "hdf5", "--env", "dev"])
        .expect("command must parse");
    assert!(matches!(
        cli.command,
        Commands::Env { command: EnvCommands::Add { ref specs } } if specs == &vec!["hdf5".to_string()]
    ));

    let cli = Cli::try_parse_from(["spindle", "dependents", "zlib", "-t"])
        .expect("command must parse");
    assert!(matches!(
        cli.command,
        Commands::Dependents { transitive: true, .. }
    ));
}

#[test]
fn uninstall_without_targets_needs_all() {
    let args = UninstallArgs::default();
    assert!(uninstall_targets(&args).is_err());

    let args = UninstallArgs {
        all: true,
        ..UninstallArgs::default()
    };
    assert_eq!(uninstall_targets(&args).expect("targets"), vec![Query::Any]);
}

#[test]
fn query_args_split_hashes_from_spec_syntax() {
    let queries = parse_query_args(&strings(&["hdf5", "+mpi", "/abc123", "zlib@1.3"]))
        .expect("queries should parse");
    assert_eq!(queries.len(), 3);
    assert!(matches!(&queries[0], Query::Spec(spec) if spec.name == "hdf5" && spec.variants.contains_key("mpi")));
    assert_eq!(queries[1], Query::HashPrefix("abc123".to_string()));
    assert!(matches!(&queries[2], Query::Spec(spec) if spec.name == "zlib"));

    assert!(parse_query_args(&strings(&["/xyz"])).is_err());
    assert!(parse_spec_args(&[]).is_err());
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "installed zlib@=1.3"),
        "installed zlib@=1.3"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "installed zlib@=1.3"),
        "[OK] installed zlib@=1.3"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "there are no packages to uninstall"),
        "[WARN] there are no packages to uninstall"
    );
}

#[test]
fn output_style_respects_terminal_and_no_color() {
    assert_eq!(output_style_for(true, false), OutputStyle::Rich);
    assert_eq!(output_style_for(true, true), OutputStyle::Plain);
    assert_eq!(output_style_for(false, false), OutputStyle::Plain);
    assert_eq!(render_section_header(OutputStyle::Plain, "Concretized"), None);
    assert_eq!(
        render_progress_line(OutputStyle::Plain, "install", 1, 2, None),
        None
    );
    let rich = render_progress_line(OutputStyle::Rich, "install", 1, 2, None)
        .expect("rich progress renders");
    assert!(rich.contains(" 50% 1/2"));
}

#[test]
fn verbose_filter_enables_debug_for_every_crate() {
    let filter = log_filter(true).to_string();
    for target in ["spindle_core", "spindle_resolver", "spindle_installer", "spindle_cli"] {
        assert!(
            filter.contains(&format!("{target}=debug")),
            "missing {target} in {filter}"
        );
    }
}

#[test]
fn confirmation_defaults_to_no() {
    assert!(parse_confirmation("y\n"));
    assert!(parse_confirmation(" YES "));
    assert!(!parse_confirmation("\n"));
    assert!(!parse_confirmation("n"));
    assert!(!parse_confirmation("sure"));
}

#[test]
fn registry_root_prefers_flag_then_config_then_default() {
    let layout = StoreLayout::new("/store");
    let config = StoreConfig {
        registry_root: Some(PathBuf::from("/from-config")),
        ..StoreConfig::default()
    };
    assert_eq!(
        select_registry_root(Some(Path::new("/from-flag")), &config, &layout),
        PathBuf::from("/from-flag")
    );
    assert_eq!(
        select_registry_root(None, &config, &layout),
        PathBuf::from("/from-config")
    );
    assert_eq!(
        select_registry_root(None, &StoreConfig::default(), &layout),
        PathBuf::from("/store/repo")
    );
}

#[test]
fn info_lines_describe_the_declaration() {
    let declaration = PackageDeclaration::from_toml_str(HDF5).expect("declaration should parse");
    let lines = format_info_lines(&declaration);
    assert_eq!(lines[0], "Package: hdf5");
    assert_eq!(lines[1], "Build system: cmake");
    assert!(lines.contains(&"  1.12.2 (preferred)".to_string()));
    assert!(lines.iter().any(|line| line.starts_with("  build_type [default: Release] values: Debug, Release")));
    assert!(lines.iter().any(|line| line.contains("parallel builds need gcc")));
}

#[test]
fn uninstall_error_lines_list_every_ambiguous_target_and_guidance() {
    let err = UninstallError::AmbiguousTarget {
        targets: vec![
            AmbiguousMatch {
                target: "zlib".to_string(),
                matches: strings(&["zlib@=1.3 /aaaaaaa", "zlib@=1.2.13 /bbbbbbb"]),
            },
            AmbiguousMatch {
                target: "cmake".to_string(),
                matches: strings(&["cmake@=3.27.9 /ccccccc", "cmake@=3.16.3 /ddddddd"]),
            },
        ],
    };
    let lines = format_uninstall_error_lines(&err);
    assert_eq!(lines[0], "zlib matches multiple packages:");
    assert_eq!(lines[3], "cmake matches multiple packages:");
    assert!(lines.last().expect("hint").contains("--all"));

    let err = UninstallError::BlockedByDependents {
        blocked: vec![BlockedSpec {
            spec: "zlib@=1.3 /aaaaaaa".to_string(),
            dependents: strings(&["hdf5@=1.12.2 /eeeeeee"]),
            environments: strings(&["dev"]),
        }],
        guidance: strings(&["use `spindle uninstall --dependents` to uninstall dependents as well"]),
    };
    assert_eq!(
        format_uninstall_error_lines(&err),
        strings(&[
            "will not uninstall zlib@=1.3 /aaaaaaa",
            "    still required by: hdf5@=1.12.2 /eeeeeee",
            "    still used by environments: dev",
            "use `spindle uninstall --dependents` to uninstall dependents as well",
        ])
    );
}

#[test]
fn environment_list_marks_the_active_environment() {
    let mut dev = spindle_installer::Environment::new("dev");
    dev.add_root(Spec::parse("hdf5").expect("spec"));
    let ci = spindle_installer::Environment::new("ci");
    assert_eq!(
        format_environment_list_lines(&[ci, dev], Some("dev")),
        strings(&["  ci (0 roots)", "* dev (1 roots)"])
    );
}

#[test]
fn install_then_uninstall_through_the_store() {
    let context = test_context();
    let renderer = plain();

    run_install_command(&context, &strings(&["hdf5"]), None, renderer)
        .expect("install should succeed");
    let database = context.database().expect("database");
    let names = database
        .records()
        .iter()
        .map(|record| record.name().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["cmake", "hdf5", "zlib"]);

    let hdf5 = resolve_single_installed(&database, "hdf5", None).expect("hdf5 is installed");
    assert!(hdf5.explicit);
    assert_eq!(
        hdf5.spec.concrete_version().map(ToString::to_string).as_deref(),
        Some("1.12.2")
    );
    let lines = format_spec_tree_lines(&hdf5.spec, &|hash| database.contains(hash));
    assert!(lines[0].starts_with("[+]"));
    assert!(lines[0].ends_with(&node_label(&hdf5.spec)));
    assert!(lines[1].contains("    ^"));
    drop(database);

    let blocked = run_uninstall_command(
        &context,
        &UninstallArgs {
            specs: strings(&["zlib"]),
            yes_to_all: true,
            ..UninstallArgs::default()
        },
        None,
        renderer,
    );
    assert!(blocked.is_err(), "hdf5 still depends on zlib");

    run_uninstall_command(
        &context,
        &UninstallArgs {
            specs: strings(&["zlib"]),
            dependents: true,
            yes_to_all: true,
            ..UninstallArgs::default()
        },
        None,
        renderer,
    )
    .expect("uninstall with dependents should succeed");
    let database = context.database().expect("database");
    assert_eq!(database.len(), 1);

    run_uninstall_command(
        &context,
        &UninstallArgs {
            all: true,
            yes_to_all: true,
            ..UninstallArgs::default()
        },
        None,
        renderer,
    )
    .expect("removing everything should succeed");
    assert!(context.database().expect("database").is_empty());

    let _ = fs::remove_dir_all(context.layout.root());
}

#[test]
fn install_into_environment_records_roots_and_lock() {
    let context = test_context();
    let renderer = plain();
    context.environments().create("dev").expect("must create environment");

    run_install_command(&context, &strings(&["zlib@1.2"]), Some("dev"), renderer)
        .expect("install should succeed");
    let environment = context.environments().load("dev").expect("must load environment");
    assert_eq!(environment.roots.len(), 1);
    assert!(environment.is_concretized());

    let database = context.database().expect("database");
    let hash = environment.concrete[0].hash().expect("concrete");
    assert!(database.contains(hash));
    drop(database);

    let err = run_uninstall_command(
        &context,
        &UninstallArgs {
            specs: strings(&["zlib"]),
            yes_to_all: true,
            ..UninstallArgs::default()
        },
        None,
        renderer,
    )
    .expect_err("dev still references zlib");
    assert!(err.to_string().contains("dependents"));

    run_uninstall_command(
        &context,
        &UninstallArgs {
            specs: strings(&["zlib"]),
            yes_to_all: true,
            ..UninstallArgs::default()
        },
        Some("dev"),
        renderer,
    )
    .expect("the active environment may drop its own root");
    let environment = context.environments().load("dev").expect("must load environment");
    assert!(environment.roots.is_empty());

    let _ = fs::remove_dir_all(context.layout.root());
}

fn concrete_node(name: &str, children: &[&Arc<Spec>]) -> Arc<Spec> {
    let mut spec = Spec::new(name);
    spec.version = VersionConstraint::exact(Version::parse("1.0").expect("version"));
    spec.compiler = Some(CompilerSpec::parse("gcc@=12.2.0").expect("compiler"));
    spec.architecture = Some("linux-x86_64".to_string());
    for child in children {
        spec.dependencies
            .push(DependencySpec::new(Arc::clone(child), DependencyTypes::build_link()));
    }
    Arc::new(spec.finalize().expect("spec should finalize"))
}

#[test]
fn spec_tree_expands_shared_nodes_once() {
    let leaf = concrete_node("leaf", &[]);
    let base = concrete_node("base", &[&leaf]);
    let left = concrete_node("left", &[&base]);
    let right = concrete_node("right", &[&base]);
    let top = concrete_node("top", &[&left, &right]);

    let lines = format_spec_tree_lines(&top, &|_| false);
    let labels = lines
        .iter()
        .map(|line| line.split('^').nth(1).unwrap_or(line.as_str()).split('@').next().unwrap_or(""))
        .collect::<Vec<_>>();
    assert_eq!(lines.len(), 6);
    assert_eq!(&labels[1..], &["left", "base", "leaf", "right", "base"]);
    assert!(lines[5].ends_with(&node_label(&base)));
    assert!(lines[5].contains("        ^"));
}

#[test]
fn partial_uninstall_report_lists_failures_and_a_tally() {
    let context = test_context();
    let renderer = plain();
    run_install_command(&context, &strings(&["zlib", "cmake"]), None, renderer)
        .expect("install should succeed");
    let records = context.database().expect("database").records();
    let removed = records[0].clone();
    let failed = records[1].clone();

    let report = UninstallReport {
        removed: vec![removed.clone()],
        failed: vec![RemovalFailure {
            record: failed.clone(),
            reason: "busy".to_string(),
        }],
    };
    let lines = format_uninstall_report_lines(&report);
    assert_eq!(lines[0], ("ok", format!("uninstalled {}", removed.display())));
    assert_eq!(lines[1], ("error", format!("failed to remove {}: busy", failed.display())));
    assert_eq!(lines[2], ("warn", "1 of 2 packages could not be uninstalled".to_string()));

    let complete = UninstallReport {
        removed: vec![removed],
        failed: Vec::new(),
    };
    assert_eq!(format_uninstall_report_lines(&complete).len(), 1);

    let _ = fs::remove_dir_all(context.layout.root());
}

#[test]
fn partial_uninstall_exits_cleanly_once_something_was_removed() {
    let context = test_context();
    let renderer = plain();
    run_install_command(&context, &strings(&["zlib", "cmake"]), None, renderer)
        .expect("install should succeed");
    let database = context.database().expect("database");
    let zlib: InstalledRecord =
        resolve_single_installed(&database, "zlib", None).expect("zlib is installed");
    drop(database);

    let prefix = context.layout.prefix_for(&zlib.spec).expect("prefix");
    let _ = fs::remove_dir_all(&prefix);
    fs::create_dir_all(prefix.parent().expect("prefix parent")).expect("must create parent");
    fs::write(&prefix, "not a directory").expect("must block prefix");

    run_uninstall_command(
        &context,
        &UninstallArgs {
            all: true,
            yes_to_all: true,
            ..UninstallArgs::default()
        },
        None,
        renderer,
    )
    .expect("cmake was removed, so the command succeeds");
    let names = context
        .database()
        .expect("database")
        .records()
        .iter()
        .map(|record| record.name().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["zlib"]);

    let err = run_uninstall_command(
        &context,
        &UninstallArgs {
            all: true,
            yes_to_all: true,
            ..UninstallArgs::default()
        },
        None,
        renderer,
    )
    .expect_err("nothing could be removed");
    assert!(err.to_string().contains("no target could be removed"));

    let _ = fs::remove_dir_all(context.layout.root());
}
