use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use spindle_core::{DeclarationCatalog, PackageDeclaration};
use spindle_installer::{
    default_store_root, Database, Environment, EnvironmentStore, StoreConfig, StoreLayout,
};
use spindle_registry::RegistryIndex;
use spindle_resolver::ConcretizerConfig;
use tracing::debug;

/// Store root, its config and the package repository, resolved once per
/// command from flags, `config.toml` and defaults in that order.
pub(crate) struct StoreContext {
    pub(crate) layout: StoreLayout,
    pub(crate) config: StoreConfig,
    pub(crate) registry_root: PathBuf,
}

impl StoreContext {
    pub(crate) fn open(root: Option<&Path>, registry_root: Option<&Path>) -> Result<Self> {
        let root = match root {
            Some(root) => root.to_path_buf(),
            None => default_store_root()?,
        };
        let layout = StoreLayout::new(root);
        let config = StoreConfig::load(&layout.config_path())?;
        let registry_root = select_registry_root(registry_root, &config, &layout);
        debug!(
            root = %layout.root().display(),
            registry = %registry_root.display(),
            "opened store"
        );
        Ok(Self {
            layout,
            config,
            registry_root,
        })
    }

    pub(crate) fn concretizer_config(&self) -> Result<ConcretizerConfig> {
        self.config.to_concretizer_config().with_context(|| {
            format!("invalid store config: {}", self.layout.config_path().display())
        })
    }

    pub(crate) fn registry(&self) -> RegistryIndex {
        RegistryIndex::open(&self.registry_root)
    }

    pub(crate) fn load_catalog(&self) -> Result<DeclarationCatalog> {
        if !self.registry_root.exists() {
            return Err(anyhow!(
                "package repository not found: {} (pass --registry-root or set registry_root in config.toml)",
                self.registry_root.display()
            ));
        }
        self.registry().load_catalog()
    }

    pub(crate) fn database(&self) -> Result<Database> {
        Ok(Database::open(&self.layout)?)
    }

    pub(crate) fn environments(&self) -> EnvironmentStore {
        EnvironmentStore::new(&self.layout)
    }

    pub(crate) fn active_environment(&self, name: Option<&str>) -> Result<Option<Environment>> {
        name.map(|name| self.environments().load_active(name))
            .transpose()
    }
}

pub(crate) fn select_registry_root(
    flag: Option<&Path>,
    config: &StoreConfig,
    layout: &StoreLayout,
) -> PathBuf {
    flag.map(Path::to_path_buf)
        .or_else(|| config.registry_root.clone())
        .unwrap_or_else(|| layout.default_registry_dir())
}

pub(crate) fn format_info_lines(declaration: &PackageDeclaration) -> Vec<String> {
    let mut lines = vec![
        format!("Package: {}", declaration.name),
        format!("Build system: {}", declaration.build_system.as_str()),
    ];
    if let Some(description) = &declaration.description {
        lines.push(format!("Description: {description}"));
    }
    if let Some(homepage) = &declaration.homepage {
        lines.push(format!("Homepage: {homepage}"));
    }

    lines.push("Versions:".to_string());
    for declared in &declaration.versions {
        let marker = if declared.preferred { " (preferred)" } else { "" };
        lines.push(format!("  {}{marker}", declared.version));
    }

    if !declaration.variants.is_empty() {
        lines.push("Variants:".to_string());
        for variant in &declaration.variants {
            let mut line = format!("  {} [default: {}]", variant.name, variant.default);
            if let Some(values) = &variant.values {
                line.push_str(&format!(" values: {}", values.join(", ")));
            }
            if let Some(when) = &variant.when {
                line.push_str(&format!(" when {when}"));
            }
            if let Some(description) = &variant.description {
                line.push_str(&format!(" - {description}"));
            }
            lines.push(line);
        }
    }

    if !declaration.dependencies.is_empty() {
        lines.push("Dependencies:".to_string());
        for dependency in &declaration.dependencies {
            let mut line = format!("  {} ({})", dependency.spec, dependency.types);
            if let Some(when) = &dependency.when {
                line.push_str(&format!(" when {when}"));
            }
            lines.push(line);
        }
    }

    if !declaration.provides.is_empty() {
        lines.push("Provides:".to_string());
        for provided in &declaration.provides {
            let mut line = format!("  {}", provided.spec);
            if let Some(when) = &provided.when {
                line.push_str(&format!(" when {when}"));
            }
            lines.push(line);
        }
    }

    if !declaration.conflicts.is_empty() {
        lines.push("Conflicts:".to_string());
        for conflict in &declaration.conflicts {
            let mut line = format!("  {}", conflict.with);
            if let Some(when) = &conflict.when {
                line.push_str(&format!(" when {when}"));
            }
            if let Some(message) = &conflict.message {
                line.push_str(&format!(": {message}"));
            }
            lines.push(line);
        }
    }

    lines
}
