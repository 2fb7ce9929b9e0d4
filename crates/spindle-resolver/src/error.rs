use thiserror::Error;

/// Why a request could not be turned into a concrete Spec. Every variant is
/// terminal for the attempt; nothing is retried with different choices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcretizationError {
    #[error("no declared version of '{package}' satisfies @{constraint} (declared: {declared})")]
    NoMatchingVersion {
        package: String,
        constraint: String,
        declared: String,
    },

    #[error("invalid value '{value}' for variant '{variant}' of '{package}': {reason}")]
    InvalidVariantValue {
        package: String,
        variant: String,
        value: String,
        reason: String,
    },

    #[error("'{package}' cannot satisfy both '{first}' and '{second}': {reason}")]
    SpecConflict {
        package: String,
        first: String,
        second: String,
        reason: String,
    },

    #[error("no package provides virtual '{virtual_name}{constraint}'")]
    NoProvider {
        virtual_name: String,
        constraint: String,
    },

    #[error(
        "virtual '{virtual_name}' has several equally preferred providers: {}",
        candidates.join(", ")
    )]
    AmbiguousProvider {
        virtual_name: String,
        candidates: Vec<String>,
    },

    #[error("'{package}' is underconstrained: no {} could be chosen", missing.join(", "))]
    UnderconstrainedSpec {
        package: String,
        missing: Vec<String>,
    },

    #[error("unknown package '{name}' required by {required_by}")]
    UnknownPackage { name: String, required_by: String },

    #[error("'{package}' requires compiler '{constraint}' but configured compilers are: {available}")]
    NoMatchingCompiler {
        package: String,
        constraint: String,
        available: String,
    },

    #[error("dependency cycle detected involving: {}", packages.join(", "))]
    CyclicDependency { packages: Vec<String> },

    #[error("'{name}' is virtual; request one of its providers: {}", providers.join(", "))]
    VirtualRoot { name: String, providers: Vec<String> },
}

pub type ConcretizationResult<T> = Result<T, ConcretizationError>;
