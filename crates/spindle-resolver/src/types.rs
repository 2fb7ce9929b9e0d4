use std::collections::BTreeMap;

use spindle_core::{CompilerSpec, VariantValue, Version, VersionConstraint};

/// What to do when several providers of a virtual are equally preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderTiebreak {
    /// Pick the first provider by name.
    #[default]
    Lexicographic,
    /// Refuse to guess.
    Strict,
}

impl ProviderTiebreak {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "lexicographic" => Some(Self::Lexicographic),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lexicographic => "lexicographic",
            Self::Strict => "strict",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackagePreferences {
    /// Preferred versions, most preferred first.
    pub versions: Vec<VersionConstraint>,
    pub variants: BTreeMap<String, VariantValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcretizerConfig {
    /// Available compilers with exact versions, most preferred first.
    pub compilers: Vec<CompilerSpec>,
    pub default_target: String,
    /// Virtual name to preferred providers, most preferred first.
    pub providers: BTreeMap<String, Vec<String>>,
    pub packages: BTreeMap<String, PackagePreferences>,
    pub provider_tiebreak: ProviderTiebreak,
}

pub const DEFAULT_COMPILER: &str = "gcc";
pub const DEFAULT_COMPILER_VERSION: &str = "12.2.0";
pub const DEFAULT_TARGET: &str = "linux-x86_64";

impl Default for ConcretizerConfig {
    fn default() -> Self {
        let compilers = Version::parse(DEFAULT_COMPILER_VERSION)
            .map(|version| vec![CompilerSpec::new(DEFAULT_COMPILER, VersionConstraint::exact(version))])
            .unwrap_or_default();
        Self {
            compilers,
            default_target: DEFAULT_TARGET.to_string(),
            providers: BTreeMap::new(),
            packages: BTreeMap::new(),
            provider_tiebreak: ProviderTiebreak::default(),
        }
    }
}

impl ConcretizerConfig {
    pub fn package(&self, name: &str) -> Option<&PackagePreferences> {
        self.packages.get(name)
    }

    pub fn describe_compilers(&self) -> String {
        if self.compilers.is_empty() {
            return "(none)".to_string();
        }
        self.compilers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
