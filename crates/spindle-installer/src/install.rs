use anyhow::{anyhow, Context, Result};
use spindle_core::{BuildSystem, DeclarationStore, Spec, SpecHash, VariantValue};
use spindle_resolver::{Concretizer, ConcretizerConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::layout::StoreLayout;

/// Why one Spec could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("build of {package} failed: {reason}")]
pub struct BuildFailure {
    pub package: String,
    pub reason: String,
}

impl BuildFailure {
    pub fn new(spec: &Spec, reason: impl Into<String>) -> Self {
        Self {
            package: spec.format_short(),
            reason: reason.into(),
        }
    }
}

/// Produces the installed artifact for one concrete Spec in `prefix`.
pub trait BuildStep: Sync {
    fn build(&self, spec: &Spec, prefix: &Path) -> Result<(), BuildFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    pub phase: &'static str,
    pub command: String,
}

/// How one build system turns a concrete Spec into commands, phase by phase.
pub trait BuildStrategy: Sync {
    fn build_system(&self) -> BuildSystem;

    fn commands(&self, spec: &Spec, prefix: &Path) -> Vec<BuildCommand>;
}

struct GenericStrategy;
struct AutotoolsStrategy;
struct CMakeStrategy;
struct MakefileStrategy;
struct PythonStrategy;
struct BundleStrategy;

pub fn strategy_for(build_system: BuildSystem) -> &'static dyn BuildStrategy {
    match build_system {
        BuildSystem::Generic => &GenericStrategy,
        BuildSystem::Autotools => &AutotoolsStrategy,
        BuildSystem::CMake => &CMakeStrategy,
        BuildSystem::Makefile => &MakefileStrategy,
        BuildSystem::Python => &PythonStrategy,
        BuildSystem::Bundle => &BundleStrategy,
    }
}

fn command(phase: &'static str, text: String) -> BuildCommand {
    BuildCommand {
        phase,
        command: text,
    }
}

impl BuildStrategy for GenericStrategy {
    fn build_system(&self) -> BuildSystem {
        BuildSystem::Generic
    }

    fn commands(&self, spec: &Spec, prefix: &Path) -> Vec<BuildCommand> {
        vec![command(
            "install",
            format!("install {} into {}", spec.name, prefix.display()),
        )]
    }
}

impl BuildStrategy for AutotoolsStrategy {
    fn build_system(&self) -> BuildSystem {
        BuildSystem::Autotools
    }

    fn commands(&self, spec: &Spec, prefix: &Path) -> Vec<BuildCommand> {
        let mut configure = format!("./configure --prefix={}", prefix.display());
        for (name, value) in &spec.variants {
            let flag = name.replace('_', "-");
            match value {
                VariantValue::Bool(true) => configure.push_str(&format!(" --enable-{flag}")),
                VariantValue::Bool(false) => configure.push_str(&format!(" --disable-{flag}")),
                VariantValue::Single(value) => {
                    configure.push_str(&format!(" --with-{flag}={value}"))
                }
            }
        }
        vec![
            command("autoreconf", "autoreconf -ivf".to_string()),
            command("configure", configure),
            command("build", "make".to_string()),
            command("install", "make install".to_string()),
        ]
    }
}

impl BuildStrategy for CMakeStrategy {
    fn build_system(&self) -> BuildSystem {
        BuildSystem::CMake
    }

    fn commands(&self, spec: &Spec, prefix: &Path) -> Vec<BuildCommand> {
        let mut configure = format!(
            "cmake -S . -B spindle-build -DCMAKE_INSTALL_PREFIX={}",
            prefix.display()
        );
        for (name, value) in &spec.variants {
            let define = if name == "build_type" {
                "CMAKE_BUILD_TYPE".to_string()
            } else {
                name.to_ascii_uppercase()
            };
            let value = match value {
                VariantValue::Bool(true) => "ON".to_string(),
                VariantValue::Bool(false) => "OFF".to_string(),
                VariantValue::Single(value) => value.clone(),
            };
            configure.push_str(&format!(" -D{define}={value}"));
        }
        vec![
            command("cmake", configure),
            command("build", "cmake --build spindle-build".to_string()),
            command("install", "cmake --install spindle-build".to_string()),
        ]
    }
}

impl BuildStrategy for MakefileStrategy {
    fn build_system(&self) -> BuildSystem {
        BuildSystem::Makefile
    }

    fn commands(&self, _spec: &Spec, prefix: &Path) -> Vec<BuildCommand> {
        vec![
            command("edit", format!("set PREFIX={} in Makefile", prefix.display())),
            command("build", "make".to_string()),
            command("install", format!("make install PREFIX={}", prefix.display())),
        ]
    }
}

impl BuildStrategy for PythonStrategy {
    fn build_system(&self) -> BuildSystem {
        BuildSystem::Python
    }

    fn commands(&self, _spec: &Spec, prefix: &Path) -> Vec<BuildCommand> {
        vec![
            command("build", "python -m build --wheel".to_string()),
            command(
                "install",
                format!("python -m pip install --no-deps --prefix={} dist/*.whl", prefix.display()),
            ),
        ]
    }
}

impl BuildStrategy for BundleStrategy {
    fn build_system(&self) -> BuildSystem {
        BuildSystem::Bundle
    }

    fn commands(&self, _spec: &Spec, _prefix: &Path) -> Vec<BuildCommand> {
        Vec::new()
    }
}

/// Default build step: creates the prefix, records the concrete Spec in
/// `.spindle/spec.json` and the planned commands in `.spindle/build.log`.
pub struct PrefixBuilder<'a> {
    store: &'a dyn DeclarationStore,
}

impl<'a> PrefixBuilder<'a> {
    pub fn new(store: &'a dyn DeclarationStore) -> Self {
        Self { store }
    }

    fn write_prefix(&self, spec: &Spec, prefix: &Path) -> Result<()> {
        let build_system = self
            .store
            .get_declaration(&spec.name)
            .map(|declaration| declaration.build_system)
            .unwrap_or_default();
        let strategy = strategy_for(build_system);

        let metadata_dir = prefix.join(".spindle");
        fs::create_dir_all(&metadata_dir)
            .with_context(|| format!("failed to create {}", metadata_dir.display()))?;

        let spec_path = metadata_dir.join("spec.json");
        let payload = serde_json::to_string_pretty(spec).context("failed to serialize spec")?;
        fs::write(&spec_path, payload)
            .with_context(|| format!("failed to write {}", spec_path.display()))?;

        let mut log = format!("build_system={}\n", strategy.build_system().as_str());
        for step in strategy.commands(spec, prefix) {
            log.push_str(&format!("{}: {}\n", step.phase, step.command));
        }
        let log_path = metadata_dir.join("build.log");
        fs::write(&log_path, log)
            .with_context(|| format!("failed to write {}", log_path.display()))?;
        Ok(())
    }
}

impl BuildStep for PrefixBuilder<'_> {
    fn build(&self, spec: &Spec, prefix: &Path) -> Result<(), BuildFailure> {
        self.write_prefix(spec, prefix)
            .map_err(|err| BuildFailure::new(spec, format!("{err:#}")))
    }
}

/// Concrete roots plus every node to visit, leaves first.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub roots: Vec<Spec>,
    pub order: Vec<Spec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    Installed,
    AlreadyInstalled,
    Failed(BuildFailure),
    /// Not attempted because a dependency failed.
    Skipped { failed_dependency: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub spec: Spec,
    pub explicit: bool,
    pub status: InstallStatus,
}

#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub roots: Vec<Spec>,
    pub steps: Vec<InstallStep>,
}

impl InstallReport {
    pub fn installed(&self) -> usize {
        self.count(|status| matches!(status, InstallStatus::Installed))
    }

    pub fn already_installed(&self) -> usize {
        self.count(|status| matches!(status, InstallStatus::AlreadyInstalled))
    }

    pub fn failures(&self) -> Vec<&InstallStep> {
        self.steps
            .iter()
            .filter(|step| {
                matches!(
                    step.status,
                    InstallStatus::Failed(_) | InstallStatus::Skipped { .. }
                )
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }

    fn count(&self, predicate: impl Fn(&InstallStatus) -> bool) -> usize {
        self.steps.iter().filter(|step| predicate(&step.status)).count()
    }
}

/// Concretizes requests against what is installed and builds what is missing.
pub struct Installer<'a> {
    layout: &'a StoreLayout,
    database: &'a Database,
    store: &'a dyn DeclarationStore,
    config: &'a ConcretizerConfig,
}

impl<'a> Installer<'a> {
    pub fn new(
        layout: &'a StoreLayout,
        database: &'a Database,
        store: &'a dyn DeclarationStore,
        config: &'a ConcretizerConfig,
    ) -> Self {
        Self {
            layout,
            database,
            store,
            config,
        }
    }

    pub fn plan(&self, requests: &[Spec]) -> Result<InstallPlan> {
        let installed = self.database.records();
        let concretizer = Concretizer::new(self.store, self.config)
            .with_installed(installed.iter().map(|record| &record.spec));
        let roots = concretizer.concretize_together(requests).with_context(|| {
            let names = requests.iter().map(ToString::to_string).collect::<Vec<_>>();
            format!("failed to concretize {}", names.join(", "))
        })?;
        self.plan_concrete(roots)
    }

    /// Plans already concrete roots, e.g. an environment's lock.
    pub fn plan_concrete(&self, roots: Vec<Spec>) -> Result<InstallPlan> {
        let order = install_order(&roots)?;
        debug!(roots = roots.len(), nodes = order.len(), "planned install");
        Ok(InstallPlan { roots, order })
    }

    /// Visits the plan leaves first. A failed build skips everything that
    /// depends on it; nothing is recorded for either.
    pub fn execute(
        &self,
        plan: &InstallPlan,
        builder: &dyn BuildStep,
        on_step: &mut dyn FnMut(&InstallStep),
    ) -> InstallReport {
        let explicit = plan
            .roots
            .iter()
            .filter_map(|root| root.hash().cloned())
            .collect::<BTreeSet<_>>();
        let mut failed: BTreeMap<SpecHash, String> = BTreeMap::new();
        let mut report = InstallReport {
            roots: plan.roots.clone(),
            steps: Vec::with_capacity(plan.order.len()),
        };

        for spec in &plan.order {
            let Some(hash) = spec.hash().cloned() else {
                continue;
            };
            let is_explicit = explicit.contains(&hash);
            let status = self.install_one(spec, is_explicit, builder, &failed);
            match &status {
                InstallStatus::Installed => info!(spec = %spec.format_short(), "installed"),
                InstallStatus::AlreadyInstalled => {
                    debug!(spec = %spec.format_short(), "already installed")
                }
                InstallStatus::Failed(failure) => {
                    warn!(spec = %spec.format_short(), reason = %failure.reason, "build failed");
                    failed.insert(hash, spec.format_short());
                }
                InstallStatus::Skipped { failed_dependency } => {
                    warn!(spec = %spec.format_short(), %failed_dependency, "skipped");
                    failed.insert(hash, spec.format_short());
                }
            }
            let step = InstallStep {
                spec: spec.clone(),
                explicit: is_explicit,
                status,
            };
            on_step(&step);
            report.steps.push(step);
        }
        report
    }

    pub fn install(&self, requests: &[Spec], builder: &dyn BuildStep) -> Result<InstallReport> {
        let plan = self.plan(requests)?;
        Ok(self.execute(&plan, builder, &mut |_| {}))
    }

    fn install_one(
        &self,
        spec: &Spec,
        explicit: bool,
        builder: &dyn BuildStep,
        failed: &BTreeMap<SpecHash, String>,
    ) -> InstallStatus {
        if spec.hash().is_some_and(|hash| self.database.contains(hash)) {
            return InstallStatus::AlreadyInstalled;
        }
        let failed_dependency = spec
            .dependencies
            .iter()
            .filter(|edge| edge.types.is_installed_edge())
            .find_map(|edge| edge.spec.hash().and_then(|hash| failed.get(hash)));
        if let Some(failed_dependency) = failed_dependency {
            return InstallStatus::Skipped {
                failed_dependency: failed_dependency.clone(),
            };
        }

        let Some(prefix) = self.layout.prefix_for(spec) else {
            return InstallStatus::Failed(BuildFailure::new(spec, "spec is not concrete"));
        };
        if let Err(failure) = builder.build(spec, &prefix) {
            return InstallStatus::Failed(failure);
        }
        match self.database.insert(spec, explicit) {
            Ok(_) => InstallStatus::Installed,
            Err(err) => InstallStatus::Failed(BuildFailure::new(
                spec,
                format!("built but could not be recorded: {err}"),
            )),
        }
    }
}

/// Unique nodes of `roots`, children before parents, ties by name then hash.
pub fn install_order(roots: &[Spec]) -> Result<Vec<Spec>> {
    let mut nodes: BTreeMap<SpecHash, &Spec> = BTreeMap::new();
    for root in roots {
        for node in root.traverse() {
            let hash = node
                .hash()
                .ok_or_else(|| anyhow!("cannot install abstract spec '{node}'"))?;
            nodes.entry(hash.clone()).or_insert(node);
        }
    }

    let mut in_degree: BTreeMap<&SpecHash, usize> = BTreeMap::new();
    let mut reverse: BTreeMap<&SpecHash, BTreeSet<&SpecHash>> = BTreeMap::new();
    for (hash, spec) in &nodes {
        let children = spec
            .dependencies
            .iter()
            .filter(|edge| edge.types.is_installed_edge())
            .filter_map(|edge| edge.spec.hash())
            .filter(|child| nodes.contains_key(*child))
            .collect::<BTreeSet<_>>();
        in_degree.insert(hash, children.len());
        for child in children {
            reverse.entry(child).or_default().insert(hash);
        }
    }

    let key = |hash: &SpecHash| (nodes[hash].name.clone(), hash.clone());
    let mut ready = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(hash, _)| key(*hash))
        .collect::<BTreeSet<_>>();
    let mut ordered = Vec::with_capacity(nodes.len());

    while let Some((_, hash)) = ready.pop_first() {
        ordered.push(nodes[&hash].clone());
        if let Some(parents) = reverse.get(&hash) {
            for parent in parents {
                if let Some(degree) = in_degree.get_mut(parent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(key(*parent));
                    }
                }
            }
        }
    }

    if ordered.len() != nodes.len() {
        return Err(anyhow!("dependency cycle among the specs to install"));
    }
    Ok(ordered)
}
