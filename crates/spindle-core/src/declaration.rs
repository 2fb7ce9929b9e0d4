use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Deserializer};

use crate::build_system::BuildSystem;
use crate::constraint::SpecConstraint;
use crate::dependency::DependencyTypes;
use crate::spec::Spec;
use crate::variant::{VariantDomain, VariantValue};
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VersionDeclaration {
    pub version: Version,
    #[serde(default)]
    pub preferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariantDeclaration {
    pub name: String,
    pub default: VariantValue,
    /// Allowed values; a variant without them is boolean.
    #[serde(default)]
    pub values: Option<Vec<String>>,
    #[serde(default)]
    pub when: Option<SpecConstraint>,
    #[serde(default)]
    pub description: Option<String>,
}

impl VariantDeclaration {
    pub fn domain(&self) -> VariantDomain {
        match &self.values {
            Some(values) => VariantDomain::OneOf(values.clone()),
            None => VariantDomain::Bool,
        }
    }
}

/// A conditional edge template.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DependencyDeclaration {
    #[serde(deserialize_with = "deserialize_spec")]
    pub spec: Spec,
    #[serde(default = "DependencyTypes::build_link")]
    pub types: DependencyTypes,
    #[serde(default)]
    pub when: Option<SpecConstraint>,
}

/// The declaring package cannot be built with `with` while `when` holds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConflictDeclaration {
    pub with: SpecConstraint,
    #[serde(default)]
    pub when: Option<SpecConstraint>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProvidedVirtual {
    /// Virtual name plus the interface versions provided, e.g. `mpi@3`.
    #[serde(deserialize_with = "deserialize_spec")]
    pub spec: Spec,
    #[serde(default)]
    pub when: Option<SpecConstraint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackageDeclaration {
    pub name: String,
    #[serde(default)]
    pub build_system: BuildSystem,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub versions: Vec<VersionDeclaration>,
    #[serde(default)]
    pub variants: Vec<VariantDeclaration>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDeclaration>,
    #[serde(default)]
    pub conflicts: Vec<ConflictDeclaration>,
    #[serde(default)]
    pub provides: Vec<ProvidedVirtual>,
}

impl PackageDeclaration {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let declaration: Self =
            toml::from_str(input).context("failed to parse spindle package declaration")?;
        declaration.validate()?;
        Ok(declaration)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("package name must not be empty"));
        }
        if !self
            .name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        {
            return Err(anyhow!("package name contains invalid character(s): {}", self.name));
        }
        if self.versions.is_empty() {
            return Err(anyhow!("package '{}' declares no versions", self.name));
        }

        let mut seen_versions = HashSet::new();
        for declared in &self.versions {
            if !seen_versions.insert(declared.version.as_str()) {
                return Err(anyhow!(
                    "package '{}' declares version {} twice",
                    self.name,
                    declared.version
                ));
            }
        }

        let mut seen_variants = HashSet::new();
        for variant in &self.variants {
            if !seen_variants.insert(variant.name.as_str()) {
                return Err(anyhow!(
                    "package '{}' declares variant '{}' twice",
                    self.name,
                    variant.name
                ));
            }
            if matches!(variant.name.as_str(), "arch" | "target") {
                return Err(anyhow!(
                    "package '{}' uses reserved variant name '{}'",
                    self.name,
                    variant.name
                ));
            }
            let domain = variant.domain();
            if !domain.admits(&variant.default) {
                return Err(anyhow!(
                    "default '{}' of variant '{}' in package '{}' is not one of: {}",
                    variant.default,
                    variant.name,
                    self.name,
                    domain.describe()
                ));
            }
        }

        for dependency in &self.dependencies {
            if dependency.spec.name == self.name {
                return Err(anyhow!("package '{}' depends on itself", self.name));
            }
            if dependency.types.is_empty() {
                return Err(anyhow!(
                    "dependency '{}' of package '{}' has no dependency types",
                    dependency.spec.name,
                    self.name
                ));
            }
        }

        for provided in &self.provides {
            if provided.spec.name == self.name {
                return Err(anyhow!("package '{}' provides itself", self.name));
            }
        }

        Ok(())
    }

    pub fn variant(&self, name: &str) -> Option<&VariantDeclaration> {
        self.variants.iter().find(|variant| variant.name == name)
    }

    /// Every `provides` entry for `virtual_name`; a package may provide
    /// different interface versions under different conditions.
    pub fn provided(&self, virtual_name: &str) -> impl Iterator<Item = &ProvidedVirtual> {
        let virtual_name = virtual_name.to_string();
        self.provides
            .iter()
            .filter(move |provided| provided.spec.name == virtual_name)
    }

    pub fn provides_virtual(&self, virtual_name: &str) -> bool {
        self.provided(virtual_name).next().is_some()
    }
}

fn deserialize_spec<'de, D>(deserializer: D) -> Result<Spec, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    Spec::parse(&text).map_err(serde::de::Error::custom)
}

/// Read-only catalog of package declarations the concretizer resolves names
/// against.
pub trait DeclarationStore: Sync {
    fn get_declaration(&self, name: &str) -> Option<&PackageDeclaration>;

    /// A name is virtual when no real package carries it and at least one
    /// package provides it.
    fn is_virtual(&self, name: &str) -> bool;

    /// Packages providing `virtual_name`, sorted by name.
    fn providers(&self, virtual_name: &str) -> Vec<&PackageDeclaration>;

    /// Store-level default providers for `virtual_name`, most preferred first.
    fn default_providers(&self, virtual_name: &str) -> Vec<String>;
}

/// In-memory declaration store.
#[derive(Debug, Clone, Default)]
pub struct DeclarationCatalog {
    packages: BTreeMap<String, PackageDeclaration>,
    default_providers: BTreeMap<String, Vec<String>>,
}

impl DeclarationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_declarations(
        declarations: impl IntoIterator<Item = PackageDeclaration>,
    ) -> anyhow::Result<Self> {
        let mut catalog = Self::new();
        for declaration in declarations {
            catalog.insert(declaration)?;
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, declaration: PackageDeclaration) -> anyhow::Result<()> {
        if self.packages.contains_key(&declaration.name) {
            return Err(anyhow!("package '{}' is declared twice", declaration.name));
        }
        self.packages.insert(declaration.name.clone(), declaration);
        Ok(())
    }

    pub fn set_default_providers(&mut self, virtual_name: impl Into<String>, providers: Vec<String>) {
        self.default_providers.insert(virtual_name.into(), providers);
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    pub fn declarations(&self) -> impl Iterator<Item = &PackageDeclaration> {
        self.packages.values()
    }
}

impl DeclarationStore for DeclarationCatalog {
    fn get_declaration(&self, name: &str) -> Option<&PackageDeclaration> {
        self.packages.get(name)
    }

    fn is_virtual(&self, name: &str) -> bool {
        !self.packages.contains_key(name)
            && self
                .packages
                .values()
                .any(|declaration| declaration.provides_virtual(name))
    }

    fn providers(&self, virtual_name: &str) -> Vec<&PackageDeclaration> {
        self.packages
            .values()
            .filter(|declaration| declaration.provides_virtual(virtual_name))
            .collect()
    }

    fn default_providers(&self, virtual_name: &str) -> Vec<String> {
        self.default_providers
            .get(virtual_name)
            .cloned()
            .unwrap_or_default()
    }
}
