use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    Build,
    Link,
    Run,
    Test,
}

impl DependencyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Link => "link",
            Self::Run => "run",
            Self::Test => "test",
        }
    }
}

/// The roles one dependency edge plays. An empty set means "unspecified",
/// which is what a `^dep` clause in a request carries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyTypes(BTreeSet<DependencyType>);

impl DependencyTypes {
    pub fn new(types: impl IntoIterator<Item = DependencyType>) -> Self {
        Self(types.into_iter().collect())
    }

    /// What a declaration gets when it names no types.
    pub fn build_link() -> Self {
        Self::new([DependencyType::Build, DependencyType::Link])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, dependency_type: DependencyType) -> bool {
        self.0.contains(&dependency_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = DependencyType> + '_ {
        self.0.iter().copied()
    }

    pub fn merge(&mut self, other: &DependencyTypes) {
        self.0.extend(other.0.iter().copied());
    }

    /// Build and link children are part of what was built.
    pub fn affects_hash(&self) -> bool {
        self.contains(DependencyType::Build) || self.contains(DependencyType::Link)
    }

    /// Edges an installed Spec keeps alive: everything except test-only.
    pub fn is_installed_edge(&self) -> bool {
        self.affects_hash() || self.contains(DependencyType::Run)
    }
}

impl fmt::Display for DependencyTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.iter().map(DependencyType::as_str).collect::<Vec<_>>();
        f.write_str(&names.join(","))
    }
}
