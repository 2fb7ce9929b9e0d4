mod build_system;
mod constraint;
mod declaration;
mod dependency;
mod hash;
mod parse;
mod spec;
mod variant;
mod version;

pub use build_system::BuildSystem;
pub use constraint::{SpecConstraint, SpecView, Truth};
pub use declaration::{
    ConflictDeclaration, DeclarationCatalog, DeclarationStore, DependencyDeclaration,
    PackageDeclaration, ProvidedVirtual, VariantDeclaration, VersionDeclaration,
};
pub use dependency::{DependencyType, DependencyTypes};
pub use hash::SpecHash;
pub use parse::{parse_specs, SpecParseError};
pub use spec::{
    CompilerSpec, DependencySpec, FlatEdge, FlatNode, FlatSpec, IncompleteSpec, Spec,
};
pub use variant::{VariantDomain, VariantValue};
pub use version::{Version, VersionConstraint};

#[cfg(test)]
mod tests;
