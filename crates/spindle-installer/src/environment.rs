use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use spindle_core::{Spec, SpecHash};
use spindle_resolver::Concretizer;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::layout::StoreLayout;

const MANIFEST_FILE: &str = "spindle.toml";
const LOCK_FILE: &str = "spindle.lock.json";

/// A named set of user-requested root Specs and their concretization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    /// Abstract roots in the order they were added.
    pub roots: Vec<Spec>,
    /// Concrete Specs aligned with `roots`; empty until concretized.
    pub concrete: Vec<Spec>,
    pub active: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EnvironmentManifest {
    #[serde(default)]
    roots: Vec<String>,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roots: Vec::new(),
            concrete: Vec::new(),
            active: false,
        }
    }

    /// Returns false when an identical root is already listed.
    pub fn add_root(&mut self, spec: Spec) -> bool {
        if self.roots.contains(&spec) {
            return false;
        }
        self.roots.push(spec);
        self.concrete.clear();
        true
    }

    /// Drops every root equal to `spec`; a concrete `spec` drops the root it
    /// was concretized from.
    pub fn remove_root(&mut self, spec: &Spec) -> bool {
        if let Some(hash) = spec.hash() {
            return self.remove_concrete_root(hash);
        }
        let before = self.roots.len();
        self.roots.retain(|root| root != spec);
        let removed = self.roots.len() != before;
        if removed {
            self.concrete.clear();
        }
        removed
    }

    /// Drops the root whose concretization has `hash`. Non-root members of
    /// the closure are left alone.
    pub fn remove_concrete_root(&mut self, hash: &SpecHash) -> bool {
        if self.concrete.len() != self.roots.len() {
            return false;
        }
        let Some(position) = self
            .concrete
            .iter()
            .position(|spec| spec.hash() == Some(hash))
        else {
            return false;
        };
        self.roots.remove(position);
        self.concrete.remove(position);
        true
    }

    pub fn is_concretized(&self) -> bool {
        self.concrete.len() == self.roots.len()
    }

    /// Resolves every root together so they share dependencies and virtual
    /// providers.
    pub fn concretize(&mut self, concretizer: &Concretizer<'_>) -> Result<()> {
        self.concrete = concretizer
            .concretize_together(&self.roots)
            .with_context(|| format!("failed to concretize environment '{}'", self.name))?;
        debug!(env = %self.name, roots = self.roots.len(), "concretized environment");
        Ok(())
    }

    /// Every concrete Spec reachable from the roots.
    pub fn all_specs(&self) -> Vec<&Spec> {
        let mut seen = BTreeSet::new();
        let mut specs = Vec::new();
        for root in &self.concrete {
            for node in root.traverse() {
                if let Some(hash) = node.hash() {
                    if seen.insert(hash.clone()) {
                        specs.push(node);
                    }
                }
            }
        }
        specs
    }

    pub fn all_hashes(&self) -> BTreeSet<SpecHash> {
        self.all_specs()
            .into_iter()
            .filter_map(|spec| spec.hash().cloned())
            .collect()
    }
}

/// Environments persisted under `state/environments/<name>/`.
#[derive(Debug, Clone)]
pub struct EnvironmentStore {
    dir: PathBuf,
}

impl EnvironmentStore {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            dir: layout.environments_dir(),
        }
    }

    fn env_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.env_dir(name).join(MANIFEST_FILE).is_file()
    }

    pub fn create(&self, name: &str) -> Result<Environment> {
        validate_environment_name(name)?;
        if self.exists(name) {
            return Err(anyhow!("environment '{name}' already exists"));
        }
        let environment = Environment::new(name);
        self.save(&environment)?;
        info!(env = %name, "created environment");
        Ok(environment)
    }

    pub fn load(&self, name: &str) -> Result<Environment> {
        validate_environment_name(name)?;
        let dir = self.env_dir(name);
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = match fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(anyhow!("environment '{name}' does not exist"));
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read environment manifest: {}", manifest_path.display())
                })
            }
        };
        let manifest: EnvironmentManifest = toml::from_str(&raw).with_context(|| {
            format!("failed to parse environment manifest: {}", manifest_path.display())
        })?;
        let roots = manifest
            .roots
            .iter()
            .map(|text| {
                Spec::parse(text)
                    .with_context(|| format!("invalid root '{text}' in environment '{name}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        let lock_path = dir.join(LOCK_FILE);
        let concrete = match fs::read_to_string(&lock_path) {
            Ok(raw) => serde_json::from_str::<Vec<Spec>>(&raw).with_context(|| {
                format!("failed to parse environment lock: {}", lock_path.display())
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read environment lock: {}", lock_path.display())
                })
            }
        };

        let mut environment = Environment::new(name);
        environment.roots = roots;
        // A lock written for a different root list is stale.
        if concrete.len() == environment.roots.len() {
            environment.concrete = concrete;
        }
        Ok(environment)
    }

    pub fn load_active(&self, name: &str) -> Result<Environment> {
        let mut environment = self.load(name)?;
        environment.active = true;
        Ok(environment)
    }

    pub fn save(&self, environment: &Environment) -> Result<()> {
        validate_environment_name(&environment.name)?;
        let dir = self.env_dir(&environment.name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create environment dir: {}", dir.display()))?;

        let manifest = EnvironmentManifest {
            roots: environment.roots.iter().map(ToString::to_string).collect(),
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        let payload = toml::to_string(&manifest).context("failed to serialize environment manifest")?;
        fs::write(&manifest_path, payload).with_context(|| {
            format!("failed to write environment manifest: {}", manifest_path.display())
        })?;

        let lock_path = dir.join(LOCK_FILE);
        if environment.is_concretized() && !environment.roots.is_empty() {
            let payload = serde_json::to_string_pretty(&environment.concrete)
                .context("failed to serialize environment lock")?;
            fs::write(&lock_path, payload).with_context(|| {
                format!("failed to write environment lock: {}", lock_path.display())
            })?;
        } else if lock_path.exists() {
            fs::remove_file(&lock_path).with_context(|| {
                format!("failed to remove stale environment lock: {}", lock_path.display())
            })?;
        }
        Ok(())
    }

    /// Environment names, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read environments dir: {}", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            if self.exists(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn all(&self) -> Result<Vec<Environment>> {
        self.list()?.iter().map(|name| self.load(name)).collect()
    }

    pub fn destroy(&self, name: &str) -> Result<()> {
        validate_environment_name(name)?;
        if !self.exists(name) {
            return Err(anyhow!("environment '{name}' does not exist"));
        }
        let dir = self.env_dir(name);
        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove environment dir: {}", dir.display()))?;
        info!(env = %name, "destroyed environment");
        Ok(())
    }
}

fn validate_environment_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if !valid {
        return Err(anyhow!(
            "invalid environment name '{name}': use letters, digits, '-', '_' or '.'"
        ));
    }
    Ok(())
}
