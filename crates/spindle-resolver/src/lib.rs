mod bind;
mod constraints;
mod error;
mod graph;
mod order;
mod providers;
mod resolve;
mod types;

pub use error::{ConcretizationError, ConcretizationResult};
pub use resolve::Concretizer;
pub use types::{
    ConcretizerConfig, PackagePreferences, ProviderTiebreak, DEFAULT_COMPILER,
    DEFAULT_COMPILER_VERSION, DEFAULT_TARGET,
};
