use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use spindle_core::{Spec, SpecHash, SpecParseError};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, ErrorKind};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::current_unix_timestamp;
use crate::layout::StoreLayout;

/// One installed concrete Spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub hash: SpecHash,
    pub spec: Spec,
    pub installed_at_unix: u64,
    /// Requested directly rather than pulled in as a dependency.
    pub explicit: bool,
}

impl InstalledRecord {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn display(&self) -> String {
        self.spec.format_short()
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("spec '{spec}' is not concrete and cannot be recorded")]
    NotConcrete { spec: String },
    #[error("cannot record {spec}: dependency {dependency} is not installed")]
    MissingDependency { spec: String, dependency: String },
    #[error("no installed spec has hash {hash}")]
    NotInstalled { hash: String },
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt database record {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DatabaseError + '_ {
    move |source| DatabaseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Installed Specs depending on the subject.
    Parents,
    /// Installed Specs the subject depends on.
    Children,
}

/// What to look up among installed Specs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Every installed Spec.
    Any,
    Spec(Spec),
    /// `/abc1234`: a full hash or unique prefix.
    HashPrefix(String),
}

impl Query {
    pub fn parse(input: &str) -> Result<Self, SpecParseError> {
        let text = input.trim();
        if let Some(prefix) = text.strip_prefix('/') {
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(SpecParseError::InvalidSpec {
                    input: input.to_string(),
                    reason: "hash queries are '/' followed by hex digits".to_string(),
                });
            }
            return Ok(Self::HashPrefix(prefix.to_ascii_lowercase()));
        }
        Spec::parse(text).map(Self::Spec)
    }

    pub fn matches(&self, record: &InstalledRecord) -> bool {
        match self {
            Self::Any => true,
            Self::Spec(spec) => record.spec.satisfies(spec),
            Self::HashPrefix(prefix) => record.hash.starts_with(prefix),
        }
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("all"),
            Self::Spec(spec) => write!(f, "{spec}"),
            Self::HashPrefix(prefix) => write!(f, "/{prefix}"),
        }
    }
}

/// Records plus both adjacency directions, always updated together.
#[derive(Debug, Default)]
pub struct InstalledIndex {
    records: BTreeMap<SpecHash, InstalledRecord>,
    parents: BTreeMap<SpecHash, BTreeSet<SpecHash>>,
    children: BTreeMap<SpecHash, BTreeSet<SpecHash>>,
}

impl InstalledIndex {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, hash: &SpecHash) -> bool {
        self.records.contains_key(hash)
    }

    pub fn get(&self, hash: &SpecHash) -> Option<&InstalledRecord> {
        self.records.get(hash)
    }

    /// All records ordered by package name, then hash.
    pub fn records(&self) -> Vec<InstalledRecord> {
        let mut records = self.records.values().cloned().collect::<Vec<_>>();
        sort_records(&mut records);
        records
    }

    /// Installed Specs matching `query`, optionally limited to `restrict_to`.
    pub fn query(
        &self,
        query: &Query,
        restrict_to: Option<&BTreeSet<SpecHash>>,
    ) -> Vec<InstalledRecord> {
        let mut matching = self
            .records
            .values()
            .filter(|record| restrict_to.map_or(true, |allowed| allowed.contains(&record.hash)))
            .filter(|record| query.matches(record))
            .cloned()
            .collect::<Vec<_>>();
        sort_records(&mut matching);
        matching
    }

    pub fn installed_relatives(
        &self,
        hash: &SpecHash,
        relation: Relation,
        transitive: bool,
    ) -> Vec<InstalledRecord> {
        let mut records = self
            .relative_hashes(hash, relation, transitive)
            .iter()
            .filter_map(|hash| self.records.get(hash))
            .cloned()
            .collect::<Vec<_>>();
        sort_records(&mut records);
        records
    }

    pub fn relative_hashes(
        &self,
        hash: &SpecHash,
        relation: Relation,
        transitive: bool,
    ) -> BTreeSet<SpecHash> {
        let edges = match relation {
            Relation::Parents => &self.parents,
            Relation::Children => &self.children,
        };
        let mut found = BTreeSet::new();
        let mut stack = edges
            .get(hash)
            .map(|direct| direct.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if !found.insert(next.clone()) {
                continue;
            }
            if transitive {
                if let Some(more) = edges.get(&next) {
                    stack.extend(more.iter().cloned());
                }
            }
        }
        found.remove(hash);
        found
    }

    fn attach(&mut self, record: InstalledRecord) {
        let hash = record.hash.clone();
        for child in installed_children(&record.spec) {
            self.parents.entry(child.clone()).or_default().insert(hash.clone());
            self.children.entry(hash.clone()).or_default().insert(child);
        }
        // Restore edges from parents that outlived a forced removal of this hash.
        let orphaned_parents = self
            .records
            .values()
            .filter(|other| installed_children(&other.spec).contains(&hash))
            .map(|other| other.hash.clone())
            .collect::<Vec<_>>();
        for parent in orphaned_parents {
            self.parents.entry(hash.clone()).or_default().insert(parent.clone());
            self.children.entry(parent).or_default().insert(hash.clone());
        }
        self.records.insert(hash, record);
    }

    fn detach(&mut self, hash: &SpecHash) -> Option<InstalledRecord> {
        let record = self.records.remove(hash)?;
        if let Some(children) = self.children.remove(hash) {
            for child in children {
                if let Some(parents) = self.parents.get_mut(&child) {
                    parents.remove(hash);
                    if parents.is_empty() {
                        self.parents.remove(&child);
                    }
                }
            }
        }
        // Parents that were force-removed out of order keep no stale edge.
        if let Some(parents) = self.parents.remove(hash) {
            for parent in parents {
                if let Some(children) = self.children.get_mut(&parent) {
                    children.remove(hash);
                }
            }
        }
        Some(record)
    }

    fn insert_record(
        &mut self,
        dir: &Path,
        spec: &Spec,
        explicit: bool,
    ) -> Result<InstalledRecord, DatabaseError> {
        let Some(hash) = spec.hash().cloned() else {
            return Err(DatabaseError::NotConcrete {
                spec: spec.to_string(),
            });
        };
        if let Some(existing) = self.records.get(&hash) {
            debug!(spec = %existing.display(), "already recorded");
            return Ok(existing.clone());
        }
        for child in spec
            .dependencies
            .iter()
            .filter(|edge| edge.types.is_installed_edge())
        {
            let installed = child
                .spec
                .hash()
                .is_some_and(|child_hash| self.records.contains_key(child_hash));
            if !installed {
                return Err(DatabaseError::MissingDependency {
                    spec: spec.format_short(),
                    dependency: child.spec.format_short(),
                });
            }
        }

        let record = InstalledRecord {
            hash: hash.clone(),
            spec: spec.clone(),
            installed_at_unix: current_unix_timestamp().unwrap_or_default(),
            explicit,
        };
        let path = dir.join(format!("{hash}.json"));
        let payload = serde_json::to_string_pretty(&record).map_err(|err| DatabaseError::Corrupt {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        fs::write(&path, payload).map_err(io_error(&path))?;

        info!(spec = %record.display(), explicit, "recorded install");
        self.attach(record.clone());
        Ok(record)
    }

    fn remove_record(&mut self, dir: &Path, hash: &SpecHash) -> Result<InstalledRecord, DatabaseError> {
        if !self.records.contains_key(hash) {
            return Err(DatabaseError::NotInstalled {
                hash: hash.to_string(),
            });
        }
        let path = dir.join(format!("{hash}.json"));
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&path)(err)),
        }
        let record = self.detach(hash).ok_or_else(|| DatabaseError::NotInstalled {
            hash: hash.to_string(),
        })?;
        info!(spec = %record.display(), "removed install record");
        Ok(record)
    }
}

/// Persistent map from content hash to installed record, one JSON file per
/// record under `state/db`.
#[derive(Debug)]
pub struct Database {
    dir: PathBuf,
    index: RwLock<InstalledIndex>,
}

impl Database {
    /// Rebuilds the in-memory index from every record on disk.
    pub fn open(layout: &StoreLayout) -> Result<Self, DatabaseError> {
        Self::open_dir(layout.db_dir())
    }

    pub fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, DatabaseError> {
        let dir = dir.into();
        let mut index = InstalledIndex::default();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => Some(entries),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(io_error(&dir)(err)),
        };

        let mut paths = Vec::new();
        for entry in entries.into_iter().flatten() {
            let entry = entry.map_err(io_error(&dir))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let raw = fs::read_to_string(&path).map_err(io_error(&path))?;
            let record: InstalledRecord =
                serde_json::from_str(&raw).map_err(|err| DatabaseError::Corrupt {
                    path: path.clone(),
                    reason: err.to_string(),
                })?;
            if !record.hash.is_well_formed() {
                return Err(DatabaseError::Corrupt {
                    path,
                    reason: format!("'{}' is not a 64-digit lowercase hex hash", record.hash),
                });
            }
            if record.spec.hash() != Some(&record.hash) {
                return Err(DatabaseError::Corrupt {
                    path,
                    reason: "record hash does not match its spec".to_string(),
                });
            }
            index.attach(record);
        }
        debug!(dir = %dir.display(), records = index.len(), "opened database");

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn contains(&self, hash: &SpecHash) -> bool {
        self.index.read().contains(hash)
    }

    pub fn get(&self, hash: &SpecHash) -> Option<InstalledRecord> {
        self.index.read().get(hash).cloned()
    }

    pub fn records(&self) -> Vec<InstalledRecord> {
        self.index.read().records()
    }

    pub fn query(
        &self,
        query: &Query,
        restrict_to: Option<&BTreeSet<SpecHash>>,
    ) -> Vec<InstalledRecord> {
        self.index.read().query(query, restrict_to)
    }

    pub fn installed_relatives(
        &self,
        hash: &SpecHash,
        relation: Relation,
        transitive: bool,
    ) -> Vec<InstalledRecord> {
        self.index.read().installed_relatives(hash, relation, transitive)
    }

    /// Records a concrete Spec whose build succeeded. Recording a hash that
    /// is already present returns the existing record unchanged.
    pub fn insert(&self, spec: &Spec, explicit: bool) -> Result<InstalledRecord, DatabaseError> {
        self.index.write().insert_record(&self.dir, spec, explicit)
    }

    pub fn remove(&self, hash: &SpecHash) -> Result<InstalledRecord, DatabaseError> {
        self.index.write().remove_record(&self.dir, hash)
    }

    /// Holds the write lock until dropped so a caller sees one consistent
    /// snapshot across several queries and removals.
    pub fn exclusive(&self) -> ExclusiveDatabase<'_> {
        ExclusiveDatabase {
            dir: &self.dir,
            index: self.index.write(),
        }
    }
}

pub struct ExclusiveDatabase<'a> {
    dir: &'a Path,
    index: RwLockWriteGuard<'a, InstalledIndex>,
}

impl ExclusiveDatabase<'_> {
    pub fn insert(&mut self, spec: &Spec, explicit: bool) -> Result<InstalledRecord, DatabaseError> {
        self.index.insert_record(self.dir, spec, explicit)
    }

    pub fn remove(&mut self, hash: &SpecHash) -> Result<InstalledRecord, DatabaseError> {
        self.index.remove_record(self.dir, hash)
    }
}

impl Deref for ExclusiveDatabase<'_> {
    type Target = InstalledIndex;

    fn deref(&self) -> &Self::Target {
        &self.index
    }
}

/// Hashes of the direct build, link and run children of `spec`.
fn installed_children(spec: &Spec) -> Vec<SpecHash> {
    spec.dependencies
        .iter()
        .filter(|edge| edge.types.is_installed_edge())
        .filter_map(|edge| edge.spec.hash().cloned())
        .collect()
}

fn sort_records(records: &mut [InstalledRecord]) {
    records.sort_by(|left, right| {
        left.spec
            .name
            .cmp(&right.spec.name)
            .then_with(|| left.hash.cmp(&right.hash))
    });
}
