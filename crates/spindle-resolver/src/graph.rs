use std::collections::{BTreeMap, BTreeSet};

use spindle_core::{
    CompilerSpec, DependencyTypes, Spec, SpecView, VariantValue, Version, VersionConstraint,
};

/// One outgoing edge, keyed by the child's package name in [`Node::edges`].
#[derive(Debug, Clone, Default)]
pub(crate) struct Edge {
    pub types: DependencyTypes,
    pub virtual_name: Option<String>,
}

/// A package being resolved. Constraint fields accumulate from every edge
/// and request that reaches the node; bound fields are set once.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub name: String,
    pub version_constraint: VersionConstraint,
    pub version: Option<Version>,
    pub compiler_constraint: Option<CompilerSpec>,
    pub compiler: Option<CompilerSpec>,
    pub architecture_constraint: Option<String>,
    pub architecture: Option<String>,
    /// Requested variant values with the constraint that asked for them.
    pub requested_variants: BTreeMap<String, (VariantValue, String)>,
    pub variants: BTreeMap<String, VariantValue>,
    pub variants_settled: bool,
    pub edges: BTreeMap<String, Edge>,
    pub parents: BTreeSet<String>,
    pub applied_templates: BTreeSet<usize>,
    /// Templates have been evaluated at least once.
    pub expanded: bool,
    /// Human-readable sources of this node's constraints, for error messages.
    pub origins: Vec<String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_constraint: VersionConstraint::Any,
            version: None,
            compiler_constraint: None,
            compiler: None,
            architecture_constraint: None,
            architecture: None,
            requested_variants: BTreeMap::new(),
            variants: BTreeMap::new(),
            variants_settled: false,
            edges: BTreeMap::new(),
            parents: BTreeSet::new(),
            applied_templates: BTreeSet::new(),
            expanded: false,
            origins: Vec::new(),
        }
    }

    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.version.is_none() {
            missing.push(format!("version (constraint @{})", self.version_constraint));
        }
        if self.compiler.is_none() {
            missing.push("compiler".to_string());
        }
        if self.architecture.is_none() {
            missing.push("architecture".to_string());
        }
        if !self.variants_settled {
            missing.push("variant values".to_string());
        }
        missing
    }
}

/// A virtual capability requested somewhere in the graph.
#[derive(Debug, Clone, Default)]
pub(crate) struct VirtualRequest {
    /// Interface versions required, e.g. `mpi@3:`.
    pub interface: VersionConstraint,
    /// Requesting package to the edge types it asked for.
    pub requesters: BTreeMap<String, DependencyTypes>,
    /// Extra constraints forwarded to whichever provider is chosen.
    pub constraints: Vec<(Spec, String)>,
    pub provider: Option<String>,
}

/// The whole resolution state for one concretization call.
#[derive(Debug, Clone, Default)]
pub(crate) struct Graph {
    pub nodes: BTreeMap<String, Node>,
    pub roots: Vec<String>,
    pub virtuals: BTreeMap<String, VirtualRequest>,
    /// `^name` constraints from the request, applied when `name` shows up.
    pub requested: BTreeMap<String, Vec<(Spec, String)>>,
    /// Targets of dependency templates whose condition is still unknown.
    pub pending: BTreeSet<String>,
    /// After a stall, absent dependencies are taken as absent for good.
    pub closed_world: bool,
}

impl Graph {
    pub fn view<'g>(&'g self, name: &'g str) -> NodeView<'g> {
        NodeView {
            graph: self,
            name,
            version: None,
        }
    }

    /// A view that pretends `name` is already bound to `version`.
    pub fn view_at<'g>(&'g self, name: &'g str, version: &'g Version) -> NodeView<'g> {
        NodeView {
            graph: self,
            name,
            version: Some(version),
        }
    }

    pub fn dependencies_settled(&self) -> bool {
        self.closed_world
            || (self.pending.is_empty()
                && self.nodes.values().all(|node| node.expanded)
                && self
                    .virtuals
                    .values()
                    .all(|request| request.provider.is_some() || request.requesters.is_empty()))
    }

    /// Virtuals bound to `provider`.
    pub fn provided_by<'g>(&'g self, provider: &'g str) -> impl Iterator<Item = (&'g str, &'g VirtualRequest)> {
        self.virtuals
            .iter()
            .filter(move |(_, request)| request.provider.as_deref() == Some(provider))
            .map(|(name, request)| (name.as_str(), request))
    }

    pub fn add_edge(
        &mut self,
        parent: &str,
        child: &str,
        types: &DependencyTypes,
        virtual_name: Option<&str>,
    ) {
        if let Some(node) = self.nodes.get_mut(parent) {
            let edge = node.edges.entry(child.to_string()).or_default();
            edge.types.merge(types);
            if edge.virtual_name.is_none() {
                edge.virtual_name = virtual_name.map(str::to_string);
            }
        }
        if let Some(node) = self.nodes.get_mut(child) {
            node.parents.insert(parent.to_string());
        }
    }
}

/// [`SpecView`] over a graph node so declaration conditions can be tested
/// while the node is still partially bound.
pub(crate) struct NodeView<'g> {
    graph: &'g Graph,
    name: &'g str,
    version: Option<&'g Version>,
}

impl NodeView<'_> {
    fn node(&self) -> Option<&Node> {
        self.graph.nodes.get(self.name)
    }
}

impl SpecView for NodeView<'_> {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> Option<&Version> {
        self.version
            .or_else(|| self.node().and_then(|node| node.version.as_ref()))
    }

    fn compiler(&self) -> Option<&CompilerSpec> {
        self.node().and_then(|node| node.compiler.as_ref())
    }

    fn architecture(&self) -> Option<&str> {
        self.node().and_then(|node| node.architecture.as_deref())
    }

    fn variant(&self, name: &str) -> Option<&VariantValue> {
        self.node().and_then(|node| node.variants.get(name))
    }

    fn variants_settled(&self) -> bool {
        self.node().is_some_and(|node| node.variants_settled)
    }

    fn dependency(&self, name: &str) -> Option<Box<dyn SpecView + '_>> {
        let graph = self.graph;
        let mut stack = vec![self.name];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = graph.nodes.get(current) else {
                continue;
            };
            for (child, edge) in &node.edges {
                if child == name || edge.virtual_name.as_deref() == Some(name) {
                    return Some(Box::new(graph.view(child)));
                }
                stack.push(child.as_str());
            }
        }
        None
    }

    fn dependencies_settled(&self) -> bool {
        self.graph.dependencies_settled()
    }
}
