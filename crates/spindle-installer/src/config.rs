use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use spindle_core::{CompilerSpec, Spec, VersionConstraint};
use spindle_resolver::{
    ConcretizerConfig, PackagePreferences, ProviderTiebreak, DEFAULT_COMPILER,
    DEFAULT_COMPILER_VERSION,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Contents of `<root>/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// `name@version` entries, most preferred first.
    #[serde(default)]
    pub compilers: Vec<String>,
    #[serde(default)]
    pub default_target: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageConfig>,
    #[serde(default)]
    pub provider_tiebreak: Option<String>,
    #[serde(default)]
    pub registry_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageConfig {
    /// Version constraints, most preferred first.
    #[serde(default)]
    pub version: Vec<String>,
    /// Variant settings in spec syntax, e.g. `+mpi build_type=Debug`.
    #[serde(default)]
    pub variants: Option<String>,
}

impl StoreConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse store config")
    }

    /// Built-in defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)
                .with_context(|| format!("failed reading store config: {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read store config: {}", path.display()))
            }
        }
    }

    pub fn to_concretizer_config(&self) -> Result<ConcretizerConfig> {
        let mut config = ConcretizerConfig::default();

        if !self.compilers.is_empty() {
            config.compilers = self
                .compilers
                .iter()
                .map(|entry| parse_compiler(entry))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(target) = &self.default_target {
            if target.trim().is_empty() {
                return Err(anyhow!("default_target must not be empty"));
            }
            config.default_target = target.trim().to_string();
        }
        if let Some(tiebreak) = &self.provider_tiebreak {
            config.provider_tiebreak = ProviderTiebreak::parse(tiebreak).ok_or_else(|| {
                anyhow!("provider_tiebreak must be 'lexicographic' or 'strict', got '{tiebreak}'")
            })?;
        }

        for (virtual_name, providers) in &self.providers {
            if providers.is_empty() {
                return Err(anyhow!("providers.{virtual_name} must list at least one package"));
            }
            config.providers.insert(virtual_name.clone(), providers.clone());
        }

        for (name, package) in &self.packages {
            let versions = package
                .version
                .iter()
                .map(|text| {
                    VersionConstraint::parse(text)
                        .with_context(|| format!("invalid packages.{name}.version entry '{text}'"))
                })
                .collect::<Result<Vec<_>>>()?;
            let variants = match &package.variants {
                Some(text) => Spec::parse(&format!("{name} {text}"))
                    .with_context(|| format!("invalid packages.{name}.variants '{text}'"))?
                    .variants,
                None => BTreeMap::new(),
            };
            config
                .packages
                .insert(name.clone(), PackagePreferences { versions, variants });
        }

        Ok(config)
    }
}

/// Configured compilers are concrete: `gcc@12.2.0` means exactly 12.2.0.
fn parse_compiler(entry: &str) -> Result<CompilerSpec> {
    let compiler = CompilerSpec::parse(entry)
        .with_context(|| format!("invalid compiler entry '{entry}'"))?;
    let version = match &compiler.version {
        VersionConstraint::Exact(version) | VersionConstraint::Prefix(version) => version.clone(),
        _ => {
            return Err(anyhow!(
                "compiler entry '{entry}' must name one version, e.g. '{DEFAULT_COMPILER}@{DEFAULT_COMPILER_VERSION}'"
            ))
        }
    };
    Ok(CompilerSpec::new(compiler.name, VersionConstraint::exact(version)))
}
