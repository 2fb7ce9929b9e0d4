mod providers;
mod registry_index;

pub use providers::ProvidersFile;
pub use registry_index::{RegistryIndex, RegistryStack};

#[cfg(test)]
mod tests;
