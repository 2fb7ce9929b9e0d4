use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use spindle_core::{
    DeclarationStore, DependencySpec, PackageDeclaration, Spec, Truth, Version, VersionConstraint,
};
use tracing::{debug, info};

use crate::error::{ConcretizationError, ConcretizationResult};
use crate::graph::Graph;
use crate::order::topo_order;
use crate::providers::interfaces_overlap;
use crate::types::ConcretizerConfig;

/// Turns abstract Specs into concrete ones against a declaration store,
/// the configured preferences and whatever is already installed.
///
/// A concretizer holds only shared references, so one instance can serve
/// many independent requests concurrently.
pub struct Concretizer<'a> {
    pub(crate) store: &'a dyn DeclarationStore,
    pub(crate) config: &'a ConcretizerConfig,
    /// Installed versions per package, highest first.
    pub(crate) installed: BTreeMap<String, Vec<Version>>,
}

impl<'a> Concretizer<'a> {
    pub fn new(store: &'a dyn DeclarationStore, config: &'a ConcretizerConfig) -> Self {
        Self {
            store,
            config,
            installed: BTreeMap::new(),
        }
    }

    /// Installed Specs whose versions and providers should be reused.
    pub fn with_installed<'s>(mut self, installed: impl IntoIterator<Item = &'s Spec>) -> Self {
        for spec in installed {
            for node in spec.traverse() {
                if let Some(version) = node.concrete_version() {
                    self.installed
                        .entry(node.name.clone())
                        .or_default()
                        .push(version.clone());
                }
            }
        }
        for versions in self.installed.values_mut() {
            versions.sort_by(|left, right| right.cmp(left));
            versions.dedup();
        }
        self
    }

    pub fn concretize(&self, request: &Spec) -> ConcretizationResult<Spec> {
        if request.is_concrete() {
            return Ok(request.clone());
        }
        let built = self.solve(std::slice::from_ref(request))?;
        pick_root(&built, &request.name)
    }

    /// Resolves all requests in one graph: shared packages get one node and
    /// every virtual gets one provider across all roots.
    pub fn concretize_together(&self, requests: &[Spec]) -> ConcretizationResult<Vec<Spec>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let built = self.solve(requests)?;
        requests
            .iter()
            .map(|request| pick_root(&built, &request.name))
            .collect()
    }

    /// Resolves each request on its own, in parallel.
    pub fn concretize_separately(&self, requests: &[Spec]) -> ConcretizationResult<Vec<Spec>> {
        requests
            .par_iter()
            .map(|request| self.concretize(request))
            .collect()
    }

    pub(crate) fn declaration(&self, name: &str) -> ConcretizationResult<&'a PackageDeclaration> {
        self.store
            .get_declaration(name)
            .ok_or_else(|| ConcretizationError::UnknownPackage {
                name: name.to_string(),
                required_by: "the dependency graph".to_string(),
            })
    }

    fn solve(&self, requests: &[Spec]) -> ConcretizationResult<BTreeMap<String, Arc<Spec>>> {
        let mut graph = Graph::default();
        for request in requests {
            self.add_root(&mut graph, request)?;
        }
        self.propagate(&mut graph)?;
        self.validate(&graph)?;
        let built = self.build(&graph)?;
        for root in &graph.roots {
            if let Some(spec) = built.get(root) {
                info!(spec = %spec.format_short(), nodes = built.len(), "concretized");
            }
        }
        Ok(built)
    }

    fn add_root(&self, graph: &mut Graph, request: &Spec) -> ConcretizationResult<()> {
        if self.store.get_declaration(&request.name).is_none() {
            if !request.is_anonymous() && self.store.is_virtual(&request.name) {
                return Err(ConcretizationError::VirtualRoot {
                    name: request.name.clone(),
                    providers: self
                        .store
                        .providers(&request.name)
                        .into_iter()
                        .map(|declaration| declaration.name.clone())
                        .collect(),
                });
            }
            return Err(ConcretizationError::UnknownPackage {
                name: request.to_string(),
                required_by: "the request".to_string(),
            });
        }

        let origin = format!("request '{request}'");
        for edge in &request.dependencies {
            self.request_dependency(graph, &edge.spec, &origin)?;
        }
        self.ensure_node(graph, &request.name, &origin)?;
        self.constrain_node(graph, &request.name, &without_dependencies(request), &origin)?;
        if !graph.roots.contains(&request.name) {
            graph.roots.push(request.name.clone());
        }
        Ok(())
    }

    /// Runs binding passes until one changes nothing.
    fn propagate(&self, graph: &mut Graph) -> ConcretizationResult<()> {
        let mut passes = 0usize;
        loop {
            passes += 1;
            let mut progress = self.expand(graph)?;
            progress |= self.bind_virtuals(graph)?;
            progress |= self.bind_versions(graph, false)?;
            progress |= self.bind_compilers(graph)?;
            progress |= self.bind_architectures(graph);
            progress |= self.bind_variants(graph)?;
            self.check_conflicts(graph)?;
            if progress {
                continue;
            }

            // Stalled: every unbound version waits on a condition that waits on
            // a version. Bind one anyway and see what that unlocks.
            if self.bind_versions(graph, true)? {
                continue;
            }
            if !graph.closed_world {
                debug!("closing dependency conditions");
                graph.closed_world = true;
                continue;
            }
            break;
        }
        debug!(passes, nodes = graph.nodes.len(), "propagation reached a fixed point");
        Ok(())
    }

    fn validate(&self, graph: &Graph) -> ConcretizationResult<()> {
        let roots = graph.roots.join(", ");
        for (name, constraints) in &graph.requested {
            if !graph.nodes.contains_key(name) {
                let origin = constraints
                    .first()
                    .map(|(_, origin)| origin.clone())
                    .unwrap_or_else(|| roots.clone());
                return Err(ConcretizationError::SpecConflict {
                    package: roots.clone(),
                    first: origin,
                    second: format!("^{name}"),
                    reason: format!("'{name}' is not a dependency of the request"),
                });
            }
        }

        for (virtual_name, request) in &graph.virtuals {
            let Some(provider) = request.provider.as_deref() else {
                if request.requesters.is_empty() {
                    return Err(ConcretizationError::SpecConflict {
                        package: roots.clone(),
                        first: format!("request for {roots}"),
                        second: format!("^{virtual_name}"),
                        reason: format!("nothing in the graph depends on '{virtual_name}'"),
                    });
                }
                return Err(ConcretizationError::NoProvider {
                    virtual_name: virtual_name.clone(),
                    constraint: interface_suffix(&request.interface),
                });
            };
            let declaration = self.declaration(provider)?;
            let view = graph.view(provider);
            let supplies = declaration.provided(virtual_name).any(|entry| {
                interfaces_overlap(&request.interface, &entry.spec.version)
                    && entry
                        .when
                        .as_ref()
                        .map(|when| when.evaluate(&view) == Truth::True)
                        .unwrap_or(true)
            });
            if !supplies {
                let bound = graph
                    .nodes
                    .get(provider)
                    .and_then(|node| node.version.as_ref())
                    .map(|version| format!("{provider}@{version}"))
                    .unwrap_or_else(|| provider.to_string());
                return Err(ConcretizationError::SpecConflict {
                    package: provider.to_string(),
                    first: bound,
                    second: format!("{virtual_name}{}", interface_suffix(&request.interface)),
                    reason: "the bound provider does not supply this interface".to_string(),
                });
            }
        }

        for (name, node) in &graph.nodes {
            let missing = node.missing_fields();
            if !missing.is_empty() {
                return Err(ConcretizationError::UnderconstrainedSpec {
                    package: name.clone(),
                    missing,
                });
            }
        }
        Ok(())
    }

    /// Materializes concrete Specs leaves first so every child is hashed
    /// before its parents.
    fn build(&self, graph: &Graph) -> ConcretizationResult<BTreeMap<String, Arc<Spec>>> {
        let mut built: BTreeMap<String, Arc<Spec>> = BTreeMap::new();
        for name in topo_order(graph)? {
            let Some(node) = graph.nodes.get(&name) else {
                continue;
            };
            let mut spec = Spec::new(name.clone());
            if let Some(version) = &node.version {
                spec.version = VersionConstraint::exact(version.clone());
            }
            spec.compiler = node.compiler.clone();
            spec.architecture = node.architecture.clone();
            spec.variants = node.variants.clone();
            for (child, edge) in &node.edges {
                let Some(child_spec) = built.get(child) else {
                    return Err(ConcretizationError::CyclicDependency {
                        packages: vec![name.clone(), child.clone()],
                    });
                };
                spec.dependencies.push(DependencySpec {
                    spec: Arc::clone(child_spec),
                    types: edge.types.clone(),
                    virtual_name: edge.virtual_name.clone(),
                });
            }
            let spec = spec
                .finalize()
                .map_err(|err| ConcretizationError::UnderconstrainedSpec {
                    package: err.name,
                    missing: vec![err.missing],
                })?;
            built.insert(name, Arc::new(spec));
        }
        Ok(built)
    }
}

fn pick_root(built: &BTreeMap<String, Arc<Spec>>, name: &str) -> ConcretizationResult<Spec> {
    built
        .get(name)
        .map(|spec| spec.as_ref().clone())
        .ok_or_else(|| ConcretizationError::UnderconstrainedSpec {
            package: name.to_string(),
            missing: vec!["concrete graph".to_string()],
        })
}

pub(crate) fn without_dependencies(spec: &Spec) -> Spec {
    let mut copy = spec.clone();
    copy.dependencies.clear();
    copy
}

pub(crate) fn interface_suffix(interface: &VersionConstraint) -> String {
    if interface.is_any() {
        String::new()
    } else {
        format!("@{interface}")
    }
}
