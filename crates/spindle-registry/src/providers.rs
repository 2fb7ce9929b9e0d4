use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// `providers.toml`: virtual name to default providers, most preferred first.
///
/// ```toml
/// [providers]
/// mpi = ["openmpi", "mpich"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub providers: BTreeMap<String, Vec<String>>,
}

impl ProvidersFile {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let parsed: Self = toml::from_str(input).context("failed to parse providers file")?;
        for (virtual_name, providers) in &parsed.providers {
            if providers.is_empty() {
                return Err(anyhow!("virtual '{virtual_name}' lists no default providers"));
            }
            if providers.iter().any(|provider| provider == virtual_name) {
                return Err(anyhow!("virtual '{virtual_name}' lists itself as a provider"));
            }
        }
        Ok(parsed)
    }

    /// Missing file means no store-level defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)
                .with_context(|| format!("failed parsing providers file: {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err)
                .with_context(|| format!("failed reading providers file: {}", path.display())),
        }
    }
}
