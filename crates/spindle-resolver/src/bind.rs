use spindle_core::{
    CompilerSpec, PackageDeclaration, SpecView, Truth, VariantDeclaration, VariantValue, Version,
};
use tracing::debug;

use crate::error::{ConcretizationError, ConcretizationResult};
use crate::graph::{Graph, Node};
use crate::providers::interfaces_overlap;
use crate::resolve::{interface_suffix, Concretizer};

impl Concretizer<'_> {
    /// Binds versions of nodes no undecided template can still constrain.
    /// With `force`, binds the first unbound node regardless and stops.
    pub(crate) fn bind_versions(
        &self,
        graph: &mut Graph,
        force: bool,
    ) -> ConcretizationResult<bool> {
        let unbound = graph
            .nodes
            .values()
            .filter(|node| node.version.is_none())
            .map(|node| node.name.clone())
            .collect::<Vec<_>>();

        // Unexpanded nodes may still add constraints to anything.
        let expanded = graph.nodes.values().all(|node| node.expanded);
        let mut progress = false;
        for name in unbound {
            if !force && !(expanded && version_ready(graph, &name)) {
                continue;
            }
            let version = self.choose_version(graph, &name)?;
            debug!(package = %name, %version, forced = force, "bound version");
            if let Some(node) = graph.nodes.get_mut(&name) {
                node.version = Some(version);
            }
            progress = true;
            if force {
                break;
            }
        }
        Ok(progress)
    }

    fn choose_version(&self, graph: &Graph, name: &str) -> ConcretizationResult<Version> {
        let declaration = self.declaration(name)?;
        let Some(node) = graph.nodes.get(name) else {
            return Err(ConcretizationError::UnknownPackage {
                name: name.to_string(),
                required_by: "the dependency graph".to_string(),
            });
        };

        let matching = declaration
            .versions
            .iter()
            .filter(|declared| node.version_constraint.matches(&declared.version))
            .collect::<Vec<_>>();
        if matching.is_empty() {
            return Err(ConcretizationError::NoMatchingVersion {
                package: name.to_string(),
                constraint: node.version_constraint.to_string(),
                declared: declaration
                    .versions
                    .iter()
                    .map(|declared| declared.version.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        let candidates = matching
            .iter()
            .filter(|declared| provides_bound_interfaces(graph, declaration, name, &declared.version))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            let (virtual_name, request) = graph
                .provided_by(name)
                .next()
                .map(|(virtual_name, request)| (virtual_name.to_string(), request.interface.clone()))
                .unwrap_or_default();
            return Err(ConcretizationError::SpecConflict {
                package: name.to_string(),
                first: format!("{name}@{}", node.version_constraint),
                second: format!("{virtual_name}{}", interface_suffix(&request)),
                reason: "no matching version provides the requested interface".to_string(),
            });
        }

        if let Some(installed) = self.installed.get(name) {
            for version in installed {
                if let Some(found) = candidates.iter().find(|declared| &declared.version == version) {
                    return Ok(found.version.clone());
                }
            }
        }

        if let Some(preferences) = self.config.package(name) {
            for preferred in &preferences.versions {
                let best = highest(
                    candidates
                        .iter()
                        .map(|declared| &declared.version)
                        .filter(|version| preferred.matches(version)),
                );
                if let Some(version) = best {
                    return Ok(version.clone());
                }
            }
        }

        if let Some(declared) = candidates.iter().find(|declared| declared.preferred) {
            return Ok(declared.version.clone());
        }

        let finite = highest(
            candidates
                .iter()
                .map(|declared| &declared.version)
                .filter(|version| !version.is_infinity()),
        );
        let chosen = finite.or_else(|| highest(candidates.iter().map(|declared| &declared.version)));
        chosen
            .cloned()
            .ok_or_else(|| ConcretizationError::NoMatchingVersion {
                package: name.to_string(),
                constraint: node.version_constraint.to_string(),
                declared: String::new(),
            })
    }

    pub(crate) fn bind_compilers(&self, graph: &mut Graph) -> ConcretizationResult<bool> {
        let unbound = graph
            .nodes
            .values()
            .filter(|node| node.compiler.is_none())
            .map(|node| node.name.clone())
            .collect::<Vec<_>>();

        let mut progress = false;
        for name in unbound {
            let Some(node) = graph.nodes.get(&name) else {
                continue;
            };
            let chosen = match &node.compiler_constraint {
                Some(constraint) => Some(self.configured_compiler(&name, constraint)?),
                None => match inherited(graph, node, |parent| parent.compiler.clone()) {
                    Some(compiler) => Some(compiler),
                    None if is_root(graph, node) => Some(self.default_compiler(&name)?),
                    None => None,
                },
            };
            if let Some(compiler) = chosen {
                debug!(package = %name, %compiler, "bound compiler");
                if let Some(node) = graph.nodes.get_mut(&name) {
                    node.compiler = Some(compiler);
                }
                progress = true;
            }
        }
        Ok(progress)
    }

    fn configured_compiler(
        &self,
        package: &str,
        constraint: &CompilerSpec,
    ) -> ConcretizationResult<CompilerSpec> {
        self.config
            .compilers
            .iter()
            .find(|available| {
                available
                    .exact_version()
                    .is_some_and(|version| constraint.admits(&available.name, version))
            })
            .cloned()
            .ok_or_else(|| ConcretizationError::NoMatchingCompiler {
                package: package.to_string(),
                constraint: constraint.to_string(),
                available: self.config.describe_compilers(),
            })
    }

    fn default_compiler(&self, package: &str) -> ConcretizationResult<CompilerSpec> {
        self.config
            .compilers
            .iter()
            .find(|available| available.exact_version().is_some())
            .cloned()
            .ok_or_else(|| ConcretizationError::NoMatchingCompiler {
                package: package.to_string(),
                constraint: "(any)".to_string(),
                available: self.config.describe_compilers(),
            })
    }

    pub(crate) fn bind_architectures(&self, graph: &mut Graph) -> bool {
        let unbound = graph
            .nodes
            .values()
            .filter(|node| node.architecture.is_none())
            .map(|node| node.name.clone())
            .collect::<Vec<_>>();

        let mut progress = false;
        for name in unbound {
            let Some(node) = graph.nodes.get(&name) else {
                continue;
            };
            let chosen = match &node.architecture_constraint {
                Some(architecture) => Some(architecture.clone()),
                None => match inherited(graph, node, |parent| parent.architecture.clone()) {
                    Some(architecture) => Some(architecture),
                    None if is_root(graph, node) => Some(self.config.default_target.clone()),
                    None => None,
                },
            };
            if let Some(architecture) = chosen {
                if let Some(node) = graph.nodes.get_mut(&name) {
                    node.architecture = Some(architecture);
                }
                progress = true;
            }
        }
        progress
    }

    /// Assigns every variant whose condition holds on a node with a bound
    /// version; the node's variants settle once no condition is undecided.
    pub(crate) fn bind_variants(&self, graph: &mut Graph) -> ConcretizationResult<bool> {
        let candidates = graph
            .nodes
            .values()
            .filter(|node| !node.variants_settled && node.version.is_some())
            .map(|node| node.name.clone())
            .collect::<Vec<_>>();

        let mut progress = false;
        for name in candidates {
            let declaration = self.declaration(&name)?;
            let Some(node) = graph.nodes.get(&name) else {
                continue;
            };
            let view = graph.view(&name);

            let mut assignments = Vec::new();
            let mut undecided = false;
            for variant in &declaration.variants {
                if node.variants.contains_key(&variant.name) {
                    continue;
                }
                let truth = variant
                    .when
                    .as_ref()
                    .map(|when| when.evaluate(&view))
                    .unwrap_or(Truth::True);
                match truth {
                    Truth::True => {
                        let value = self.variant_value(node, variant)?;
                        assignments.push((variant.name.clone(), value));
                    }
                    Truth::Unknown => undecided = true,
                    Truth::False => {}
                }
            }

            if !undecided {
                for (variant, (value, origin)) in &node.requested_variants {
                    let assigned = node.variants.contains_key(variant)
                        || assignments.iter().any(|(name, _)| name == variant);
                    if !assigned {
                        return Err(not_applicable(declaration, view.name(), variant, value, origin));
                    }
                }
            }

            let Some(node) = graph.nodes.get_mut(&name) else {
                continue;
            };
            if !assignments.is_empty() {
                progress = true;
            }
            for (variant, value) in assignments {
                debug!(package = %name, %variant, %value, "bound variant");
                node.variants.insert(variant, value);
            }
            if !undecided {
                node.variants_settled = true;
                progress = true;
            }
        }
        Ok(progress)
    }

    fn variant_value(
        &self,
        node: &Node,
        variant: &VariantDeclaration,
    ) -> ConcretizationResult<VariantValue> {
        let domain = variant.domain();
        if let Some((value, origin)) = node.requested_variants.get(&variant.name) {
            if !domain.admits(value) {
                return Err(ConcretizationError::InvalidVariantValue {
                    package: node.name.clone(),
                    variant: variant.name.clone(),
                    value: value.to_string(),
                    reason: format!("expected one of {} (from {origin})", domain.describe()),
                });
            }
            return Ok(value.clone());
        }

        let preferred = self
            .config
            .package(&node.name)
            .and_then(|preferences| preferences.variants.get(&variant.name))
            .filter(|value| domain.admits(value));
        Ok(preferred.cloned().unwrap_or_else(|| variant.default.clone()))
    }
}

fn not_applicable(
    declaration: &PackageDeclaration,
    package: &str,
    variant: &str,
    value: &VariantValue,
    origin: &str,
) -> ConcretizationError {
    let reason = match declaration.variant(variant).and_then(|declared| declared.when.as_ref()) {
        Some(when) => format!("the variant only applies when '{when}' ({origin})"),
        None => format!("'{package}' declares no such variant ({origin})"),
    };
    ConcretizationError::InvalidVariantValue {
        package: package.to_string(),
        variant: variant.to_string(),
        value: value.to_string(),
        reason,
    }
}

/// No undecided template targets this node or a virtual it provides.
fn version_ready(graph: &Graph, name: &str) -> bool {
    !graph.pending.contains(name)
        && !graph
            .provided_by(name)
            .any(|(virtual_name, _)| graph.pending.contains(virtual_name))
}

/// Whether `version` of provider `name` could still supply every virtual
/// bound to it. Undecided conditions count as possible.
fn provides_bound_interfaces(
    graph: &Graph,
    declaration: &PackageDeclaration,
    name: &str,
    version: &Version,
) -> bool {
    let view = graph.view_at(name, version);
    graph.provided_by(name).all(|(virtual_name, request)| {
        declaration.provided(virtual_name).any(|entry| {
            interfaces_overlap(&request.interface, &entry.spec.version)
                && entry
                    .when
                    .as_ref()
                    .map(|when| when.evaluate(&view) != Truth::False)
                    .unwrap_or(true)
        })
    })
}

fn is_root(graph: &Graph, node: &Node) -> bool {
    node.parents.is_empty() || graph.roots.contains(&node.name)
}

/// The first bound value among the node's parents, in name order.
fn inherited<T>(graph: &Graph, node: &Node, field: impl Fn(&Node) -> Option<T>) -> Option<T> {
    node.parents
        .iter()
        .filter_map(|parent| graph.nodes.get(parent))
        .find_map(field)
}

/// Highest version; equal versions keep the earliest declared.
fn highest<'v>(versions: impl Iterator<Item = &'v Version>) -> Option<&'v Version> {
    let mut best: Option<&Version> = None;
    for version in versions {
        if best.map_or(true, |current| version > current) {
            best = Some(version);
        }
    }
    best
}
