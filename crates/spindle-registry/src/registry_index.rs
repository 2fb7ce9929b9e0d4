use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use spindle_core::{DeclarationCatalog, DeclarationStore, PackageDeclaration};
use tracing::{debug, warn};

use crate::ProvidersFile;

const DECLARATION_FILE: &str = "package.toml";

/// One package repository on disk:
/// `<root>/packages/<name>/package.toml` plus an optional `<root>/providers.toml`.
#[derive(Debug, Clone)]
pub struct RegistryIndex {
    root: PathBuf,
}

/// Several repositories searched in order; the first one declaring a name wins.
#[derive(Debug, Clone)]
pub struct RegistryStack {
    indexes: Vec<RegistryIndex>,
}

impl RegistryIndex {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn packages_root(&self) -> PathBuf {
        self.root.join("packages")
    }

    pub fn declaration_path(&self, name: &str) -> PathBuf {
        self.packages_root().join(name).join(DECLARATION_FILE)
    }

    /// Package names containing `needle`, sorted.
    pub fn search_names(&self, needle: &str) -> Result<Vec<String>> {
        let packages_root = self.packages_root();
        if !packages_root.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&packages_root).with_context(|| {
            format!(
                "failed to read registry packages: {}",
                packages_root.display()
            )
        })? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(needle) && entry.path().join(DECLARATION_FILE).is_file() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    pub fn package_declaration(&self, name: &str) -> Result<Option<PackageDeclaration>> {
        let path = self.declaration_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed reading package declaration: {}", path.display())
                })
            }
        };

        let declaration = PackageDeclaration::from_toml_str(&content)
            .with_context(|| format!("failed parsing package declaration: {}", path.display()))?;
        if declaration.name != name {
            anyhow::bail!(
                "package declaration {} names '{}' but lives in directory '{}'",
                path.display(),
                declaration.name,
                name
            );
        }
        Ok(Some(declaration))
    }

    pub fn all_declarations(&self) -> Result<Vec<PackageDeclaration>> {
        let mut declarations = Vec::new();
        for name in self.search_names("")? {
            if let Some(declaration) = self.package_declaration(&name)? {
                declarations.push(declaration);
            }
        }
        Ok(declarations)
    }

    pub fn providers(&self) -> Result<ProvidersFile> {
        ProvidersFile::load(&self.root.join("providers.toml"))
    }

    /// Reads every declaration into an in-memory store.
    pub fn load_catalog(&self) -> Result<DeclarationCatalog> {
        RegistryStack::new(vec![self.clone()]).load_catalog()
    }
}

impl RegistryStack {
    pub fn new(indexes: Vec<RegistryIndex>) -> Self {
        Self { indexes }
    }

    pub fn open(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self::new(roots.into_iter().map(RegistryIndex::open).collect())
    }

    pub fn indexes(&self) -> &[RegistryIndex] {
        &self.indexes
    }

    pub fn search_names(&self, needle: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for index in &self.indexes {
            names.extend(index.search_names(needle)?);
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn package_declaration(&self, name: &str) -> Result<Option<PackageDeclaration>> {
        for index in &self.indexes {
            if let Some(declaration) = index.package_declaration(name)? {
                return Ok(Some(declaration));
            }
        }
        Ok(None)
    }

    pub fn load_catalog(&self) -> Result<DeclarationCatalog> {
        let mut catalog = DeclarationCatalog::new();
        for index in &self.indexes {
            if !index.root().exists() {
                warn!(root = %index.root().display(), "package repository does not exist");
                continue;
            }
            for declaration in index.all_declarations()? {
                if catalog.get_declaration(&declaration.name).is_some() {
                    debug!(
                        package = %declaration.name,
                        root = %index.root().display(),
                        "declaration shadowed by an earlier repository"
                    );
                    continue;
                }
                catalog.insert(declaration)?;
            }
        }

        // Earlier repositories take precedence for provider defaults too.
        for index in self.indexes.iter().rev() {
            for (virtual_name, providers) in index.providers()?.providers {
                catalog.set_default_providers(virtual_name, providers);
            }
        }

        debug!(packages = catalog.len(), "loaded declaration catalog");
        Ok(catalog)
    }
}
