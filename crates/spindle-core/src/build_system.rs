use serde::{Deserialize, Serialize};

/// Tag selecting how a package is built. The installer maps each tag to a
/// build strategy; declarations never carry build logic themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    #[default]
    Generic,
    Autotools,
    #[serde(rename = "cmake")]
    CMake,
    Makefile,
    Python,
    /// Groups dependencies; installs nothing of its own.
    Bundle,
}

impl BuildSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Autotools => "autotools",
            Self::CMake => "cmake",
            Self::Makefile => "makefile",
            Self::Python => "python",
            Self::Bundle => "bundle",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "generic" | "package" => Some(Self::Generic),
            "autotools" | "autoconf" => Some(Self::Autotools),
            "cmake" => Some(Self::CMake),
            "makefile" | "make" => Some(Self::Makefile),
            "python" | "pip" => Some(Self::Python),
            "bundle" => Some(Self::Bundle),
            _ => None,
        }
    }

    /// Phase names run in order for this build system.
    pub fn phases(self) -> &'static [&'static str] {
        match self {
            Self::Generic => &["install"],
            Self::Autotools => &["autoreconf", "configure", "build", "install"],
            Self::CMake => &["cmake", "build", "install"],
            Self::Makefile => &["edit", "build", "install"],
            Self::Python => &["build", "install"],
            Self::Bundle => &[],
        }
    }
}
