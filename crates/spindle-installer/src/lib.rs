use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

mod config;
mod database;
mod environment;
mod install;
mod layout;
mod uninstall;

pub use config::{PackageConfig, StoreConfig};
pub use database::{
    Database, DatabaseError, ExclusiveDatabase, InstalledIndex, InstalledRecord, Query, Relation,
};
pub use environment::{Environment, EnvironmentStore};
pub use install::{
    install_order, strategy_for, BuildCommand, BuildFailure, BuildStep, BuildStrategy,
    InstallPlan, InstallReport, InstallStatus, InstallStep, Installer, PrefixBuilder,
};
pub use layout::{default_store_root, StoreLayout};
pub use uninstall::{
    expand_removal_set, find_matching, removal_order, AmbiguousMatch, ArtifactRemover,
    BlockedSpec, PrefixRemover, RemovalFailure, UninstallCoordinator, UninstallError,
    UninstallOptions, UninstallReport,
};

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
