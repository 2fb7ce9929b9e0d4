use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::constraint::SpecConstraint;
use crate::dependency::DependencyTypes;
use crate::hash::{content_hash, SpecHash};
use crate::parse::{parse_specs, SpecParseError};
use crate::variant::VariantValue;
use crate::version::{Version, VersionConstraint};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerSpec {
    pub name: String,
    #[serde(default)]
    pub version: VersionConstraint,
}

impl CompilerSpec {
    pub fn new(name: impl Into<String>, version: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Parses `gcc`, `gcc@12` or `clang@=16.0.6`.
    pub fn parse(input: &str) -> Result<Self, SpecParseError> {
        let (name, version) = match input.trim().split_once('@') {
            Some((name, version)) => (name.trim(), VersionConstraint::parse(version)?),
            None => (input.trim(), VersionConstraint::Any),
        };
        if name.is_empty() {
            return Err(SpecParseError::InvalidSpec {
                input: input.to_string(),
                reason: "compiler name must not be empty".to_string(),
            });
        }
        Ok(Self::new(name, version))
    }

    pub fn exact_version(&self) -> Option<&Version> {
        self.version.exact_version()
    }

    /// Whether a bound compiler (exact version) meets this constraint.
    pub fn admits(&self, bound_name: &str, bound_version: &Version) -> bool {
        self.name == bound_name && self.version.matches(bound_version)
    }
}

impl fmt::Display for CompilerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.version.is_any() {
            write!(f, "@{}", self.version)?;
        }
        Ok(())
    }
}

/// One outgoing edge of a Spec. Children are shared, so a node reached
/// along several paths exists once in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub spec: Arc<Spec>,
    pub types: DependencyTypes,
    /// The virtual capability this edge was declared against, when the
    /// child is a provider chosen for it.
    pub virtual_name: Option<String>,
}

impl DependencySpec {
    pub fn new(spec: impl Into<Arc<Spec>>, types: DependencyTypes) -> Self {
        Self {
            spec: spec.into(),
            types,
            virtual_name: None,
        }
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.spec.name == name || self.virtual_name.as_deref() == Some(name)
    }
}

/// A package request (abstract) or a fully bound build (concrete).
///
/// A Spec is concrete exactly when it carries a content hash; the only way to
/// get one is [`Spec::finalize`], which refuses unbound fields.
///
/// Equality, `Debug` and serde all go through [`FlatSpec`], so each is linear
/// in the number of unique nodes rather than the number of paths.
#[derive(Clone)]
pub struct Spec {
    pub name: String,
    pub version: VersionConstraint,
    pub compiler: Option<CompilerSpec>,
    pub architecture: Option<String>,
    pub variants: BTreeMap<String, VariantValue>,
    pub dependencies: Vec<DependencySpec>,
    hash: Option<SpecHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("spec '{name}' is not concrete: {missing}")]
pub struct IncompleteSpec {
    pub name: String,
    pub missing: String,
}

impl Spec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: VersionConstraint::Any,
            compiler: None,
            architecture: None,
            variants: BTreeMap::new(),
            dependencies: Vec::new(),
            hash: None,
        }
    }

    /// Parses exactly one named spec, e.g. `hdf5@1.10: +mpi ^openmpi@4`.
    pub fn parse(input: &str) -> Result<Self, SpecParseError> {
        let mut specs = parse_specs(input)?;
        match specs.len() {
            1 => Ok(specs.remove(0)),
            0 => Err(SpecParseError::InvalidSpec {
                input: input.to_string(),
                reason: "expected a package name".to_string(),
            }),
            count => Err(SpecParseError::InvalidSpec {
                input: input.to_string(),
                reason: format!("expected one spec, found {count}"),
            }),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    pub fn is_concrete(&self) -> bool {
        self.hash.is_some()
    }

    pub fn hash(&self) -> Option<&SpecHash> {
        self.hash.as_ref()
    }

    pub fn concrete_version(&self) -> Option<&Version> {
        self.version.exact_version()
    }

    /// Finds a node anywhere below this one by package or virtual name.
    pub fn dependency(&self, name: &str) -> Option<&Spec> {
        let mut stack = self.dependencies.iter().collect::<Vec<_>>();
        let mut visited = HashSet::new();
        while let Some(edge) = stack.pop() {
            if edge.answers_to(name) {
                return Some(edge.spec.as_ref());
            }
            if visited.insert(edge.spec.node_key()) {
                stack.extend(edge.spec.dependencies.iter());
            }
        }
        None
    }

    /// Unique nodes reachable from here, this node first, in preorder.
    pub fn traverse(&self) -> Vec<&Spec> {
        let mut ordered = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.node_key()) {
                continue;
            }
            ordered.push(node);
            for edge in node.dependencies.iter().rev() {
                stack.push(edge.spec.as_ref());
            }
        }
        ordered
    }

    /// Binds the content hash. Every field must be bound and every child
    /// must already be concrete.
    pub fn finalize(mut self) -> Result<Self, IncompleteSpec> {
        let missing = |what: &str| IncompleteSpec {
            name: self.name.clone(),
            missing: what.to_string(),
        };
        if self.name.is_empty() {
            return Err(missing("package name"));
        }
        if self.concrete_version().is_none() {
            return Err(missing("version"));
        }
        match &self.compiler {
            Some(compiler) if compiler.exact_version().is_some() => {}
            _ => return Err(missing("compiler")),
        }
        if self.architecture.is_none() {
            return Err(missing("architecture"));
        }
        if let Some(edge) = self.dependencies.iter().find(|edge| !edge.spec.is_concrete()) {
            return Err(missing(&format!("dependency {}", edge.spec.name)));
        }

        self.dependencies
            .sort_by(|left, right| left.spec.name.cmp(&right.spec.name));
        self.hash = Some(content_hash(&self));
        Ok(self)
    }

    /// True when this Spec meets every clause of `constraint`.
    pub fn satisfies(&self, constraint: &Spec) -> bool {
        SpecConstraint::from_spec(constraint).matches(self)
    }

    /// `name@version%compiler+variants arch=.. /hash`, without dependencies.
    pub fn format_short(&self) -> String {
        let mut out = String::new();
        self.write_node(&mut out);
        if let Some(hash) = &self.hash {
            out.push_str(&format!(" /{}", hash.short()));
        }
        out
    }

    /// The graph below this Spec with every unique node listed once, this
    /// node first.
    pub fn flatten(&self) -> FlatSpec {
        let nodes = self.traverse();
        let positions = nodes
            .iter()
            .enumerate()
            .map(|(position, node)| (node.node_key(), position))
            .collect::<HashMap<_, _>>();
        let nodes = nodes
            .into_iter()
            .map(|node| FlatNode {
                name: node.name.clone(),
                version: node.version.clone(),
                compiler: node.compiler.clone(),
                architecture: node.architecture.clone(),
                variants: node.variants.clone(),
                dependencies: node
                    .dependencies
                    .iter()
                    .filter_map(|edge| {
                        positions.get(&edge.spec.node_key()).map(|&node| FlatEdge {
                            node,
                            types: edge.types.clone(),
                            virtual_name: edge.virtual_name.clone(),
                        })
                    })
                    .collect(),
                hash: node.hash.clone(),
            })
            .collect();
        FlatSpec { nodes }
    }

    fn node_key(&self) -> (String, Option<SpecHash>) {
        (self.name.clone(), self.hash.clone())
    }

    fn write_node(&self, out: &mut String) {
        out.push_str(&self.name);
        if !self.version.is_any() {
            out.push_str(&format!("@{}", self.version));
        }
        if let Some(compiler) = &self.compiler {
            out.push_str(&format!("%{compiler}"));
        }
        let mut singles = String::new();
        for (name, value) in &self.variants {
            if value.is_bool() {
                out.push_str(&value.render(name));
            } else {
                singles.push_str(&value.render(name));
            }
        }
        out.push_str(&singles);
        if let Some(architecture) = &self.architecture {
            out.push_str(&format!(" arch={architecture}"));
        }
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_node(&mut out);
        for node in self.traverse().into_iter().skip(1) {
            out.push_str(" ^");
            node.write_node(&mut out);
        }
        f.write_str(&out)
    }
}

impl PartialEq for Spec {
    fn eq(&self, other: &Self) -> bool {
        if self.hash.is_some() && self.hash != other.hash {
            return false;
        }
        self.flatten() == other.flatten()
    }
}

impl Eq for Spec {}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec")
            .field("nodes", &self.flatten().nodes)
            .finish()
    }
}

impl Serialize for Spec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.flatten().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Spec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        FlatSpec::deserialize(deserializer)?
            .into_spec()
            .map_err(serde::de::Error::custom)
    }
}

/// A Spec graph as an adjacency list: `nodes[0]` is the root and edges
/// point at other entries by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatSpec {
    pub nodes: Vec<FlatNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "VersionConstraint::is_any")]
    pub version: VersionConstraint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<CompilerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, VariantValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<FlatEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<SpecHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatEdge {
    pub node: usize,
    #[serde(default, skip_serializing_if = "DependencyTypes::is_empty")]
    pub types: DependencyTypes,
    #[serde(default, rename = "virtual", skip_serializing_if = "Option::is_none")]
    pub virtual_name: Option<String>,
}

impl FlatSpec {
    /// Rebuilds the shared graph. Each entry becomes one node no matter how
    /// many edges point at it; cycles and dangling positions are rejected.
    pub fn into_spec(self) -> Result<Spec, String> {
        if self.nodes.is_empty() {
            return Err("spec graph has no nodes".to_string());
        }
        let mut built: Vec<Option<Arc<Spec>>> = vec![None; self.nodes.len()];
        let mut visiting = vec![false; self.nodes.len()];
        let root = self.build_node(0, &mut built, &mut visiting)?;
        drop(built);
        Ok(Arc::try_unwrap(root).unwrap_or_else(|shared| (*shared).clone()))
    }

    fn build_node(
        &self,
        position: usize,
        built: &mut [Option<Arc<Spec>>],
        visiting: &mut [bool],
    ) -> Result<Arc<Spec>, String> {
        if let Some(node) = &built[position] {
            return Ok(Arc::clone(node));
        }
        if visiting[position] {
            return Err(format!(
                "spec graph has a cycle through '{}'",
                self.nodes[position].name
            ));
        }
        visiting[position] = true;

        let flat = &self.nodes[position];
        let mut dependencies = Vec::with_capacity(flat.dependencies.len());
        for edge in &flat.dependencies {
            if edge.node >= self.nodes.len() {
                return Err(format!(
                    "'{}' points at missing node {}",
                    flat.name, edge.node
                ));
            }
            dependencies.push(DependencySpec {
                spec: self.build_node(edge.node, built, visiting)?,
                types: edge.types.clone(),
                virtual_name: edge.virtual_name.clone(),
            });
        }
        let node = Arc::new(Spec {
            name: flat.name.clone(),
            version: flat.version.clone(),
            compiler: flat.compiler.clone(),
            architecture: flat.architecture.clone(),
            variants: flat.variants.clone(),
            dependencies,
            hash: flat.hash.clone(),
        });

        visiting[position] = false;
        built[position] = Some(Arc::clone(&node));
        Ok(node)
    }
}
