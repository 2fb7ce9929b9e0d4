use std::fmt;

use serde::Deserialize;

use crate::parse::{parse_anonymous, SpecParseError};
use crate::spec::{CompilerSpec, Spec};
use crate::variant::VariantValue;
use crate::version::{Version, VersionConstraint};

/// Three-valued result of testing a constraint against a partially bound node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }

    pub fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Self::False, _) | (_, Self::False) => Self::False,
            (Self::True, Self::True) => Self::True,
            _ => Self::Unknown,
        }
    }
}

/// Read access to a Spec-shaped node, bound or still being resolved.
pub trait SpecView {
    fn name(&self) -> &str;
    fn version(&self) -> Option<&Version>;
    fn compiler(&self) -> Option<&CompilerSpec>;
    fn architecture(&self) -> Option<&str>;
    fn variant(&self, name: &str) -> Option<&VariantValue>;
    /// Once settled, an absent variant is known to be absent.
    fn variants_settled(&self) -> bool;
    /// Looks a dependency up anywhere below this node, by package or virtual name.
    fn dependency(&self, name: &str) -> Option<Box<dyn SpecView + '_>>;
    fn dependencies_settled(&self) -> bool;
}

impl SpecView for Spec {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Option<&Version> {
        self.concrete_version()
    }

    fn compiler(&self) -> Option<&CompilerSpec> {
        self.compiler.as_ref()
    }

    fn architecture(&self) -> Option<&str> {
        self.architecture.as_deref()
    }

    fn variant(&self, name: &str) -> Option<&VariantValue> {
        self.variants.get(name)
    }

    fn variants_settled(&self) -> bool {
        self.is_concrete()
    }

    fn dependency(&self, name: &str) -> Option<Box<dyn SpecView + '_>> {
        Spec::dependency(self, name).map(|spec| Box::new(spec) as Box<dyn SpecView + '_>)
    }

    fn dependencies_settled(&self) -> bool {
        self.is_concrete()
    }
}

impl<T: SpecView + ?Sized> SpecView for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn version(&self) -> Option<&Version> {
        (**self).version()
    }

    fn compiler(&self) -> Option<&CompilerSpec> {
        (**self).compiler()
    }

    fn architecture(&self) -> Option<&str> {
        (**self).architecture()
    }

    fn variant(&self, name: &str) -> Option<&VariantValue> {
        (**self).variant(name)
    }

    fn variants_settled(&self) -> bool {
        (**self).variants_settled()
    }

    fn dependency(&self, name: &str) -> Option<Box<dyn SpecView + '_>> {
        (**self).dependency(name)
    }

    fn dependencies_settled(&self) -> bool {
        (**self).dependencies_settled()
    }
}

/// A typed query over Specs: `when=` conditions, conflicts and database
/// lookups all compile to this once and evaluate it against many nodes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SpecConstraint {
    Name(String),
    Version(VersionConstraint),
    Compiler(CompilerSpec),
    Architecture(String),
    Variant {
        name: String,
        value: VariantValue,
    },
    /// Some node below the subject answers to `name` and meets `constraint`.
    Dependency {
        name: String,
        constraint: Box<SpecConstraint>,
    },
    All(Vec<SpecConstraint>),
}

impl SpecConstraint {
    /// Parses spec syntax where the package name is optional.
    pub fn parse(input: &str) -> Result<Self, SpecParseError> {
        Ok(Self::from_spec(&parse_anonymous(input)?))
    }

    pub fn from_spec(spec: &Spec) -> Self {
        let mut clauses = Vec::new();
        if !spec.name.is_empty() {
            clauses.push(Self::Name(spec.name.clone()));
        }
        clauses.extend(Self::node_clauses(spec));
        for edge in &spec.dependencies {
            clauses.push(Self::Dependency {
                name: edge.spec.name.clone(),
                constraint: Box::new(Self::without_name(&edge.spec)),
            });
        }
        Self::collapse(clauses)
    }

    fn without_name(spec: &Spec) -> Self {
        let mut clauses = Self::node_clauses(spec);
        for edge in &spec.dependencies {
            clauses.push(Self::Dependency {
                name: edge.spec.name.clone(),
                constraint: Box::new(Self::without_name(&edge.spec)),
            });
        }
        Self::collapse(clauses)
    }

    fn node_clauses(spec: &Spec) -> Vec<Self> {
        let mut clauses = Vec::new();
        if !spec.version.is_any() {
            clauses.push(Self::Version(spec.version.clone()));
        }
        if let Some(compiler) = &spec.compiler {
            clauses.push(Self::Compiler(compiler.clone()));
        }
        if let Some(architecture) = &spec.architecture {
            clauses.push(Self::Architecture(architecture.clone()));
        }
        for (name, value) in &spec.variants {
            clauses.push(Self::Variant {
                name: name.clone(),
                value: value.clone(),
            });
        }
        clauses
    }

    fn collapse(mut clauses: Vec<Self>) -> Self {
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::All(clauses)
        }
    }

    pub fn evaluate(&self, subject: &dyn SpecView) -> Truth {
        match self {
            Self::Name(name) => Truth::from_bool(subject.name() == name),
            Self::Version(constraint) => match subject.version() {
                Some(version) => Truth::from_bool(constraint.matches(version)),
                None => Truth::Unknown,
            },
            Self::Compiler(wanted) => match subject.compiler() {
                Some(bound) if bound.name != wanted.name => Truth::False,
                Some(bound) => match bound.exact_version() {
                    Some(version) => Truth::from_bool(wanted.version.matches(version)),
                    None if wanted.version.is_any() => Truth::True,
                    None => Truth::Unknown,
                },
                None => Truth::Unknown,
            },
            Self::Architecture(wanted) => match subject.architecture() {
                Some(bound) => Truth::from_bool(bound == wanted),
                None => Truth::Unknown,
            },
            Self::Variant { name, value } => match subject.variant(name) {
                Some(bound) => Truth::from_bool(bound == value),
                None if subject.variants_settled() => Truth::False,
                None => Truth::Unknown,
            },
            Self::Dependency { name, constraint } => match subject.dependency(name) {
                Some(child) => constraint.evaluate(child.as_ref()),
                None if subject.dependencies_settled() => Truth::False,
                None => Truth::Unknown,
            },
            Self::All(clauses) => clauses
                .iter()
                .fold(Truth::True, |acc, clause| acc.and(clause.evaluate(subject))),
        }
    }

    pub fn matches(&self, subject: &dyn SpecView) -> bool {
        self.evaluate(subject) == Truth::True
    }
}

impl fmt::Display for SpecConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Version(constraint) => write!(f, "@{constraint}"),
            Self::Compiler(compiler) => write!(f, "%{compiler}"),
            Self::Architecture(architecture) => write!(f, " arch={architecture}"),
            Self::Variant { name, value } => f.write_str(value.render(name).trim_start()),
            Self::Dependency { name, constraint } => write!(f, " ^{name}{constraint}"),
            Self::All(clauses) if clauses.is_empty() => f.write_str("*"),
            Self::All(clauses) => {
                for clause in clauses {
                    write!(f, "{clause}")?;
                }
                Ok(())
            }
        }
    }
}

impl TryFrom<String> for SpecConstraint {
    type Error = SpecParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}
