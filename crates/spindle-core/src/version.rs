use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::parse::SpecParseError;

/// Names that sort above every numeric version, highest first.
const INFINITY_VERSIONS: [&str; 5] = ["develop", "main", "master", "head", "trunk"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Segment {
    Alpha(String),
    Numeric(u64),
}

/// A package version such as `1.2.11`, `7.9.1`, `2.0rc1` or `develop`.
///
/// Versions compare segment by segment. Equality follows the ordering, so
/// `1.2` and `1_2` are equal even though their text differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    text: String,
    segments: Vec<Segment>,
}

impl Version {
    pub fn parse(input: &str) -> Result<Self, SpecParseError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(SpecParseError::InvalidVersion {
                text: input.to_string(),
                reason: "version must not be empty".to_string(),
            });
        }

        let mut segments = Vec::new();
        let mut chars = text.chars().peekable();
        while let Some(&ch) = chars.peek() {
            if ch.is_ascii_digit() {
                let mut digits = String::new();
                while let Some(&d) = chars.peek().filter(|c| c.is_ascii_digit()) {
                    digits.push(d);
                    chars.next();
                }
                let value = digits.parse::<u64>().map_err(|_| SpecParseError::InvalidVersion {
                    text: text.to_string(),
                    reason: format!("numeric segment '{digits}' is out of range"),
                })?;
                segments.push(Segment::Numeric(value));
            } else if ch.is_ascii_alphabetic() {
                let mut word = String::new();
                while let Some(&a) = chars.peek().filter(|c| c.is_ascii_alphabetic()) {
                    word.push(a.to_ascii_lowercase());
                    chars.next();
                }
                segments.push(Segment::Alpha(word));
            } else if matches!(ch, '.' | '-' | '_') {
                chars.next();
            } else {
                return Err(SpecParseError::InvalidVersion {
                    text: text.to_string(),
                    reason: format!("unexpected character '{ch}'"),
                });
            }
        }

        if segments.is_empty() {
            return Err(SpecParseError::InvalidVersion {
                text: text.to_string(),
                reason: "version has no segments".to_string(),
            });
        }

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True for branch-like versions (`develop`, `main`, ...) that outrank releases.
    pub fn is_infinity(&self) -> bool {
        self.infinity_rank().is_some()
    }

    /// Position in [`INFINITY_VERSIONS`]; lower ranks sort higher.
    fn infinity_rank(&self) -> Option<usize> {
        match self.segments.as_slice() {
            [Segment::Alpha(word)] => INFINITY_VERSIONS
                .iter()
                .position(|name| *name == word.as_str()),
            _ => None,
        }
    }

    /// `1.2` is a prefix of `1.2`, `1.2.5` and `1.2rc1`, but not of `1.20`.
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(left, right)| left == right)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.infinity_rank(), other.infinity_rank()) {
            (Some(left), Some(right)) => return right.cmp(&left),
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => {}
        }

        for (left, right) in self.segments.iter().zip(other.segments.iter()) {
            match left.cmp(right) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }

        let common = self.segments.len().min(other.segments.len());
        match self.segments.len().cmp(&other.segments.len()) {
            Ordering::Equal => Ordering::Equal,
            // A trailing alphabetic segment marks a pre-release: 1.2rc1 < 1.2.
            Ordering::Greater => match self.segments[common] {
                Segment::Alpha(_) => Ordering::Less,
                Segment::Numeric(_) => Ordering::Greater,
            },
            Ordering::Less => match other.segments[common] {
                Segment::Alpha(_) => Ordering::Greater,
                Segment::Numeric(_) => Ordering::Less,
            },
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.segments.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl TryFrom<String> for Version {
    type Error = SpecParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.text
    }
}

/// The set of versions a Spec may bind to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionConstraint {
    #[default]
    Any,
    /// `@=1.2`: exactly this version.
    Exact(Version),
    /// `@1.2`: this version or any version it prefixes.
    Prefix(Version),
    /// `@1.2:`, `@:1.4`, `@1.2:1.4`; the high bound admits anything it prefixes.
    Range {
        low: Option<Version>,
        high: Option<Version>,
    },
    /// `@1.2,1.4:`: any member.
    Set(Vec<VersionConstraint>),
    /// Every member; produced by intersecting constraints.
    All(Vec<VersionConstraint>),
}

impl VersionConstraint {
    pub fn parse(input: &str) -> Result<Self, SpecParseError> {
        let text = input.trim();
        if text.is_empty() {
            return Ok(Self::Any);
        }

        let members = text
            .split(',')
            .map(parse_single_constraint)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(match members.len() {
            1 => members.into_iter().next().unwrap_or_default(),
            _ => Self::Set(members),
        })
    }

    pub fn exact(version: Version) -> Self {
        Self::Exact(version)
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// The single version this constraint pins, if it pins one.
    pub fn exact_version(&self) -> Option<&Version> {
        match self {
            Self::Exact(version) => Some(version),
            Self::All(members) => members.iter().find_map(Self::exact_version),
            _ => None,
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(exact) => exact == version,
            Self::Prefix(prefix) => prefix.is_prefix_of(version),
            Self::Range { low, high } => {
                let above_low = low
                    .as_ref()
                    .map(|low| version >= low || low.is_prefix_of(version))
                    .unwrap_or(true);
                let below_high = high
                    .as_ref()
                    .map(|high| version <= high || high.is_prefix_of(version))
                    .unwrap_or(true);
                above_low && below_high
            }
            Self::Set(members) => members.iter().any(|member| member.matches(version)),
            Self::All(members) => members.iter().all(|member| member.matches(version)),
        }
    }

    /// Conjunction of both constraints, flattened and without duplicates.
    pub fn intersect(&self, other: &VersionConstraint) -> VersionConstraint {
        let mut members = Vec::new();
        for constraint in [self, other] {
            match constraint {
                Self::Any => {}
                Self::All(inner) => members.extend(inner.iter().cloned()),
                single => members.push(single.clone()),
            }
        }

        let mut unique: Vec<VersionConstraint> = Vec::with_capacity(members.len());
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }

        match unique.len() {
            0 => Self::Any,
            1 => unique.into_iter().next().unwrap_or_default(),
            _ => Self::All(unique),
        }
    }
}

fn parse_single_constraint(text: &str) -> Result<VersionConstraint, SpecParseError> {
    let text = text.trim();
    if let Some(exact) = text.strip_prefix('=') {
        return Ok(VersionConstraint::Exact(Version::parse(exact)?));
    }
    if let Some((low, high)) = text.split_once(':') {
        let low = low.trim();
        let high = high.trim();
        let low = (!low.is_empty()).then(|| Version::parse(low)).transpose()?;
        let high = (!high.is_empty()).then(|| Version::parse(high)).transpose()?;
        if let (Some(low), Some(high)) = (&low, &high) {
            if low > high && !high.is_prefix_of(low) {
                return Err(SpecParseError::InvalidVersion {
                    text: text.to_string(),
                    reason: format!("range low bound {low} is above high bound {high}"),
                });
            }
        }
        return Ok(VersionConstraint::Range { low, high });
    }
    Ok(VersionConstraint::Prefix(Version::parse(text)?))
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => Ok(()),
            Self::Exact(version) => write!(f, "={version}"),
            Self::Prefix(version) => write!(f, "{version}"),
            Self::Range { low, high } => {
                if let Some(low) = low {
                    write!(f, "{low}")?;
                }
                f.write_str(":")?;
                if let Some(high) = high {
                    write!(f, "{high}")?;
                }
                Ok(())
            }
            Self::Set(members) => {
                let rendered = members.iter().map(ToString::to_string).collect::<Vec<_>>();
                f.write_str(&rendered.join(","))
            }
            // Each member renders as its own `@` clause.
            Self::All(members) => {
                let rendered = members.iter().map(ToString::to_string).collect::<Vec<_>>();
                f.write_str(&rendered.join("@"))
            }
        }
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = SpecParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .split('@')
            .map(VersionConstraint::parse)
            .try_fold(VersionConstraint::Any, |acc, next| Ok(acc.intersect(&next?)))
    }
}

impl From<VersionConstraint> for String {
    fn from(value: VersionConstraint) -> Self {
        value.to_string()
    }
}
