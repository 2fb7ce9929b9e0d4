use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::spec::Spec;

const SHORT_HASH_LEN: usize = 7;
const HASH_LEN: usize = 64;

/// Lowercase hex SHA-256 identifying one concrete build.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..SHORT_HASH_LEN).unwrap_or(&self.0)
    }

    /// True for exactly 64 lowercase hex digits, the shape `content_hash` emits.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == HASH_LEN
            && self
                .0
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
    }

    /// Accepts a full hash or an unambiguous prefix typed by a user.
    pub fn starts_with(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.0.starts_with(&prefix.to_ascii_lowercase())
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest over the canonical identity of `spec`. Only build and link children
/// contribute, so swapping a run or test dependency keeps the hash.
pub(crate) fn content_hash(spec: &Spec) -> SpecHash {
    let mut hasher = Sha256::new();
    let mut line = |key: &str, value: &str| {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    };

    line("name", &spec.name);
    line("version", &spec.version.to_string());
    if let Some(compiler) = &spec.compiler {
        line("compiler", &compiler.to_string());
    }
    if let Some(architecture) = &spec.architecture {
        line("arch", architecture);
    }
    for (name, value) in &spec.variants {
        line("variant", &format!("{name}:{value}"));
    }

    let mut children = spec
        .dependencies
        .iter()
        .filter(|edge| edge.types.affects_hash())
        .filter_map(|edge| {
            edge.spec
                .hash()
                .map(|hash| format!("{}:{}", edge.spec.name, hash.as_str()))
        })
        .collect::<Vec<_>>();
    children.sort();
    for child in &children {
        line("dep", child);
    }

    SpecHash(hex::encode(hasher.finalize()))
}
