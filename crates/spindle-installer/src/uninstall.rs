use spindle_core::SpecHash;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::{Database, DatabaseError, InstalledIndex, InstalledRecord, Query, Relation};
use crate::environment::{Environment, EnvironmentStore};
use crate::layout::StoreLayout;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UninstallOptions {
    /// Remove even when dependents or other environments still need a target.
    pub force: bool,
    /// Add every installed dependent of the targets to the removal set.
    pub remove_dependents: bool,
    /// Skip the confirmation callback.
    pub assume_yes: bool,
    /// Let one target match several installed Specs.
    pub allow_multiple: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousMatch {
    pub target: String,
    pub matches: Vec<String>,
}

/// Why one Spec cannot be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedSpec {
    pub spec: String,
    pub dependents: Vec<String>,
    pub environments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalFailure {
    pub record: InstalledRecord,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum UninstallError {
    #[error("{} matches multiple packages", describe_ambiguous(.targets))]
    AmbiguousTarget { targets: Vec<AmbiguousMatch> },
    #[error("{target} does not match any {}", scope_label(.environment))]
    NoSuchInstalledSpec {
        target: String,
        environment: Option<String>,
    },
    #[error("there are still dependents of {}", describe_blocked(.blocked))]
    BlockedByDependents {
        blocked: Vec<BlockedSpec>,
        guidance: Vec<String>,
    },
    #[error("uninstall declined; nothing was removed")]
    Declined,
    #[error("no target could be removed: {}", describe_failures(.failures))]
    RemovalFailed { failures: Vec<RemovalFailure> },
    #[error("environment '{name}': {reason}")]
    Environment { name: String, reason: String },
    /// Removal went ahead but the active environment could not be written
    /// back; `report` still lists what was removed.
    #[error("environment '{name}' was not saved after removing {} packages: {reason}", .report.removed.len())]
    EnvironmentNotSaved {
        name: String,
        reason: String,
        report: UninstallReport,
    },
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

fn describe_ambiguous(targets: &[AmbiguousMatch]) -> String {
    targets
        .iter()
        .map(|entry| entry.target.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn scope_label(environment: &Option<String>) -> String {
    match environment {
        Some(name) => format!("packages in environment '{name}'"),
        None => "installed packages".to_string(),
    }
}

fn describe_blocked(blocked: &[BlockedSpec]) -> String {
    blocked
        .iter()
        .map(|entry| entry.spec.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_failures(failures: &[RemovalFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.record.display(), failure.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of the mutation phase, one entry per target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub removed: Vec<InstalledRecord>,
    pub failed: Vec<RemovalFailure>,
}

impl UninstallReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.failed.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes the installed artifact behind a record.
pub trait ArtifactRemover {
    fn remove(&self, record: &InstalledRecord) -> Result<(), String>;
}

/// Removes the record's install prefix; a prefix already gone counts as done.
pub struct PrefixRemover<'a> {
    layout: &'a StoreLayout,
}

impl<'a> PrefixRemover<'a> {
    pub fn new(layout: &'a StoreLayout) -> Self {
        Self { layout }
    }
}

impl ArtifactRemover for PrefixRemover<'_> {
    fn remove(&self, record: &InstalledRecord) -> Result<(), String> {
        let Some(prefix) = self.layout.prefix_for(&record.spec) else {
            return Err("record holds an abstract spec".to_string());
        };
        match fs::remove_dir_all(&prefix) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(prefix = %prefix.display(), "prefix already absent");
                Ok(())
            }
            Err(err) => Err(format!("failed to remove {}: {err}", prefix.display())),
        }
    }
}

/// Safe multi-target removal: match, check dependents and environments,
/// confirm, then remove leaves of the dependent graph first.
pub struct UninstallCoordinator<'a> {
    database: &'a Database,
    environments: &'a EnvironmentStore,
    remover: &'a dyn ArtifactRemover,
}

impl<'a> UninstallCoordinator<'a> {
    pub fn new(
        database: &'a Database,
        environments: &'a EnvironmentStore,
        remover: &'a dyn ArtifactRemover,
    ) -> Self {
        Self {
            database,
            environments,
            remover,
        }
    }

    /// Removes what `targets` match. `confirm` sees the ordered removal set
    /// unless `options.assume_yes`; returning false aborts untouched.
    pub fn uninstall(
        &self,
        targets: &[Query],
        options: &UninstallOptions,
        mut active: Option<&mut Environment>,
        confirm: &mut dyn FnMut(&[InstalledRecord]) -> bool,
    ) -> Result<UninstallReport, UninstallError> {
        let mut database = self.database.exclusive();

        let matched = find_matching(&database, targets, options, active.as_deref())?;
        debug!(matched = matched.len(), "matched uninstall targets");

        let others = self.other_environments(active.as_deref())?;
        let removal = expand_removal_set(&database, matched, options, &others, active.as_deref())?;
        let ordered = removal_order(&database, &removal);
        if ordered.is_empty() {
            return Ok(UninstallReport::default());
        }

        if !options.assume_yes && !confirm(&ordered) {
            info!("uninstall declined");
            return Err(UninstallError::Declined);
        }

        let mut report = UninstallReport::default();
        for record in ordered {
            if !options.force {
                let still_needed = database
                    .installed_relatives(&record.hash, Relation::Parents, false)
                    .iter()
                    .map(InstalledRecord::display)
                    .collect::<Vec<_>>();
                if !still_needed.is_empty() {
                    warn!(spec = %record.display(), "dependents remain installed");
                    report.failed.push(RemovalFailure {
                        reason: format!("still required by {}", still_needed.join(", ")),
                        record,
                    });
                    continue;
                }
            }

            if let Some(environment) = active.as_deref_mut() {
                if environment.remove_concrete_root(&record.hash) {
                    info!(env = %environment.name, spec = %record.display(), "removed environment root");
                }
            }

            if let Err(reason) = self.remover.remove(&record) {
                warn!(spec = %record.display(), %reason, "artifact removal failed");
                report.failed.push(RemovalFailure { record, reason });
                continue;
            }
            match database.remove(&record.hash) {
                Ok(removed) => report.removed.push(removed),
                Err(err) => report.failed.push(RemovalFailure {
                    reason: err.to_string(),
                    record,
                }),
            }
        }
        drop(database);

        if let Some(environment) = active {
            if let Err(err) = self.environments.save(environment) {
                let reason = format!("{err:#}");
                warn!(env = %environment.name, %reason, "environment save failed after removal");
                return Err(UninstallError::EnvironmentNotSaved {
                    name: environment.name.clone(),
                    reason,
                    report,
                });
            }
        }

        if report.removed.is_empty() && !report.failed.is_empty() {
            return Err(UninstallError::RemovalFailed {
                failures: report.failed,
            });
        }
        Ok(report)
    }

    fn other_environments(
        &self,
        active: Option<&Environment>,
    ) -> Result<Vec<Environment>, UninstallError> {
        let names = self
            .environments
            .list()
            .map_err(|err| UninstallError::Environment {
                name: "*".to_string(),
                reason: format!("{err:#}"),
            })?;
        names
            .into_iter()
            .filter(|name| active.map_or(true, |environment| &environment.name != name))
            .map(|name| {
                self.environments
                    .load(&name)
                    .map_err(|err| UninstallError::Environment {
                        reason: format!("{err:#}"),
                        name,
                    })
            })
            .collect()
    }
}

/// Resolves targets to installed records, scoped to the active environment.
pub fn find_matching(
    database: &InstalledIndex,
    targets: &[Query],
    options: &UninstallOptions,
    active: Option<&Environment>,
) -> Result<Vec<InstalledRecord>, UninstallError> {
    let scope = active.map(Environment::all_hashes);
    let mut matched: BTreeMap<SpecHash, InstalledRecord> = BTreeMap::new();
    let mut ambiguous = Vec::new();

    for target in targets {
        let matching = database.query(target, scope.as_ref());
        let bulk = options.allow_multiple || *target == Query::Any;
        if !bulk && matching.len() > 1 {
            ambiguous.push(AmbiguousMatch {
                target: target.to_string(),
                matches: matching.iter().map(InstalledRecord::display).collect(),
            });
        }
        if matching.is_empty() && *target != Query::Any {
            return Err(UninstallError::NoSuchInstalledSpec {
                target: target.to_string(),
                environment: active.map(|environment| environment.name.clone()),
            });
        }
        for record in matching {
            matched.insert(record.hash.clone(), record);
        }
    }

    if !ambiguous.is_empty() {
        return Err(UninstallError::AmbiguousTarget { targets: ambiguous });
    }
    Ok(matched.into_values().collect())
}

/// Applies the dependents and environments checks, growing the set with
/// dependents when asked to.
pub fn expand_removal_set(
    database: &InstalledIndex,
    matched: Vec<InstalledRecord>,
    options: &UninstallOptions,
    others: &[Environment],
    active: Option<&Environment>,
) -> Result<Vec<InstalledRecord>, UninstallError> {
    let mut removal: BTreeMap<SpecHash, InstalledRecord> = matched
        .into_iter()
        .map(|record| (record.hash.clone(), record))
        .collect();
    let environment_hashes = others
        .iter()
        .map(|environment| (environment.name.clone(), environment.all_hashes()))
        .collect::<Vec<_>>();

    loop {
        let dependents = outside_dependents(database, &removal);
        let environments = referencing_environments(&removal, &environment_hashes);
        debug!(
            dependents = dependents.len(),
            environments = environments.len(),
            "checked uninstall safety"
        );

        let blocked = !options.force
            && ((!dependents.is_empty() && !options.remove_dependents) || !environments.is_empty());
        if blocked {
            return Err(blocked_error(
                &removal,
                &dependents,
                &environments,
                active.is_some(),
            ));
        }
        if !options.remove_dependents || dependents.is_empty() {
            break;
        }

        for records in dependents.into_values() {
            for record in records {
                removal.entry(record.hash.clone()).or_insert(record);
            }
        }
    }

    Ok(removal.into_values().collect())
}

/// Ascending count of installed dependents, recomputed as each earlier
/// entry is taken out; ties by name then hash.
pub fn removal_order(database: &InstalledIndex, removal: &[InstalledRecord]) -> Vec<InstalledRecord> {
    let mut remaining = removal.to_vec();
    let mut removed: BTreeSet<SpecHash> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let count = |record: &InstalledRecord| {
            database
                .relative_hashes(&record.hash, Relation::Parents, true)
                .iter()
                .filter(|hash| database.contains(hash) && !removed.contains(*hash))
                .count()
        };
        let Some(position) = remaining
            .iter()
            .enumerate()
            .min_by(|(_, left), (_, right)| {
                count(*left)
                    .cmp(&count(*right))
                    .then_with(|| left.spec.name.cmp(&right.spec.name))
                    .then_with(|| left.hash.cmp(&right.hash))
            })
            .map(|(position, _)| position)
        else {
            break;
        };
        let next = remaining.remove(position);
        removed.insert(next.hash.clone());
        ordered.push(next);
    }
    ordered
}

/// Installed dependents of each target that are not targets themselves.
fn outside_dependents(
    database: &InstalledIndex,
    removal: &BTreeMap<SpecHash, InstalledRecord>,
) -> BTreeMap<SpecHash, Vec<InstalledRecord>> {
    let mut dependents = BTreeMap::new();
    for hash in removal.keys() {
        let outside = database
            .installed_relatives(hash, Relation::Parents, true)
            .into_iter()
            .filter(|record| !removal.contains_key(&record.hash))
            .collect::<Vec<_>>();
        if !outside.is_empty() {
            dependents.insert(hash.clone(), outside);
        }
    }
    dependents
}

fn referencing_environments(
    removal: &BTreeMap<SpecHash, InstalledRecord>,
    environment_hashes: &[(String, BTreeSet<SpecHash>)],
) -> BTreeMap<SpecHash, Vec<String>> {
    let mut referenced: BTreeMap<SpecHash, Vec<String>> = BTreeMap::new();
    for (name, hashes) in environment_hashes {
        for hash in removal.keys().filter(|hash| hashes.contains(*hash)) {
            referenced.entry(hash.clone()).or_default().push(name.clone());
        }
    }
    referenced
}

fn blocked_error(
    removal: &BTreeMap<SpecHash, InstalledRecord>,
    dependents: &BTreeMap<SpecHash, Vec<InstalledRecord>>,
    environments: &BTreeMap<SpecHash, Vec<String>>,
    has_active: bool,
) -> UninstallError {
    let blocking = dependents
        .keys()
        .chain(environments.keys())
        .cloned()
        .collect::<BTreeSet<_>>();
    let mut blocked = blocking
        .iter()
        .filter_map(|hash| removal.get(hash))
        .map(|record| BlockedSpec {
            spec: record.display(),
            dependents: dependents
                .get(&record.hash)
                .map(|records| records.iter().map(InstalledRecord::display).collect())
                .unwrap_or_default(),
            environments: environments.get(&record.hash).cloned().unwrap_or_default(),
        })
        .collect::<Vec<_>>();
    blocked.sort_by(|left, right| left.spec.cmp(&right.spec));

    let mut guidance = Vec::new();
    if !dependents.is_empty() {
        guidance.push("use `spindle uninstall --dependents` to uninstall dependents as well".to_string());
    }
    if !environments.is_empty() {
        guidance.push(
            "use `spindle env destroy` to remove environments, or `spindle env remove` to remove specs from them"
                .to_string(),
        );
    }
    if has_active {
        guidance.push("consider `spindle env remove` to drop the spec from the active environment".to_string());
    }
    UninstallError::BlockedByDependents { blocked, guidance }
}
