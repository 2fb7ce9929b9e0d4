use anyhow::{Context, Result};
use spindle_core::Spec;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of one spindle store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.root.join("opt")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.state_dir().join("db")
    }

    pub fn record_path(&self, hash: &str) -> PathBuf {
        self.db_dir().join(format!("{hash}.json"))
    }

    pub fn environments_dir(&self) -> PathBuf {
        self.state_dir().join("environments")
    }

    pub fn default_registry_dir(&self) -> PathBuf {
        self.root.join("repo")
    }

    /// `opt/<arch>/<compiler>-<version>/<name>-<version>-<hash>`; abstract
    /// specs have no prefix.
    pub fn prefix_for(&self, spec: &Spec) -> Option<PathBuf> {
        let hash = spec.hash()?;
        let version = spec.concrete_version()?;
        let compiler = spec.compiler.as_ref()?;
        let compiler_version = compiler.exact_version()?;
        let architecture = spec.architecture.as_deref()?;
        Some(
            self.opt_dir()
                .join(architecture)
                .join(format!("{}-{compiler_version}", compiler.name))
                .join(format!("{}-{version}-{}", spec.name, hash.short())),
        )
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.opt_dir(),
            self.state_dir(),
            self.db_dir(),
            self.environments_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_store_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("SPINDLE_ROOT").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows store root")?;
        return Ok(PathBuf::from(app_data).join("Spindle"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve store root")?;
    Ok(PathBuf::from(home).join(".spindle"))
}
