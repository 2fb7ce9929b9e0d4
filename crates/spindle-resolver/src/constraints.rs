use std::collections::BTreeSet;

use spindle_core::{DependencyTypes, Spec, SpecView, Truth, VersionConstraint};
use tracing::debug;

use crate::error::{ConcretizationError, ConcretizationResult};
use crate::graph::{Graph, Node};
use crate::resolve::{without_dependencies, Concretizer};

fn conflict(package: &str, first: String, second: String, reason: &str) -> ConcretizationError {
    ConcretizationError::SpecConflict {
        package: package.to_string(),
        first,
        second,
        reason: reason.to_string(),
    }
}

impl Concretizer<'_> {
    /// Creates the node for a real package, applying any `^name` request
    /// constraints waiting for it.
    pub(crate) fn ensure_node(
        &self,
        graph: &mut Graph,
        name: &str,
        origin: &str,
    ) -> ConcretizationResult<()> {
        if graph.nodes.contains_key(name) {
            return Ok(());
        }
        debug!(package = %name, %origin, "adding node");
        let mut node = Node::new(name);
        node.origins.push(origin.to_string());
        graph.nodes.insert(name.to_string(), node);

        let waiting = graph.requested.get(name).cloned().unwrap_or_default();
        for (spec, request_origin) in waiting {
            self.constrain_node(graph, name, &spec, &request_origin)?;
        }
        Ok(())
    }

    /// Narrows a node by the node-level fields of `spec`. Contradicting an
    /// earlier constraint or an already bound field is a conflict.
    pub(crate) fn constrain_node(
        &self,
        graph: &mut Graph,
        name: &str,
        spec: &Spec,
        origin: &str,
    ) -> ConcretizationResult<()> {
        let Some(node) = graph.nodes.get_mut(name) else {
            return Ok(());
        };

        if !spec.version.is_any() {
            if let Some(bound) = &node.version {
                if !spec.version.matches(bound) {
                    return Err(conflict(
                        name,
                        format!("{name}@{bound}"),
                        format!("{name}@{}", spec.version),
                        origin,
                    ));
                }
            }
            node.version_constraint = node.version_constraint.intersect(&spec.version);
        }

        if let Some(wanted) = &spec.compiler {
            match &mut node.compiler_constraint {
                Some(existing) if existing.name != wanted.name => {
                    return Err(conflict(
                        name,
                        format!("%{existing} ({})", node.origins.join("; ")),
                        format!("%{wanted}"),
                        origin,
                    ));
                }
                Some(existing) => existing.version = existing.version.intersect(&wanted.version),
                None => node.compiler_constraint = Some(wanted.clone()),
            }
            if let Some(bound) = &node.compiler {
                let admitted = bound
                    .exact_version()
                    .is_some_and(|version| wanted.admits(&bound.name, version));
                if !admitted {
                    return Err(conflict(
                        name,
                        format!("%{bound}"),
                        format!("%{wanted}"),
                        origin,
                    ));
                }
            }
        }

        if let Some(wanted) = &spec.architecture {
            let existing = node
                .architecture
                .as_ref()
                .or(node.architecture_constraint.as_ref());
            if let Some(existing) = existing {
                if existing != wanted {
                    return Err(conflict(
                        name,
                        format!("arch={existing}"),
                        format!("arch={wanted}"),
                        origin,
                    ));
                }
            }
            node.architecture_constraint = Some(wanted.clone());
        }

        for (variant, value) in &spec.variants {
            if let Some((existing, existing_origin)) = node.requested_variants.get(variant) {
                if existing != value {
                    return Err(conflict(
                        name,
                        format!("{} ({existing_origin})", existing.render(variant).trim()),
                        value.render(variant).trim().to_string(),
                        origin,
                    ));
                }
                continue;
            }
            if let Some(bound) = node.variants.get(variant) {
                if bound != value {
                    return Err(conflict(
                        name,
                        bound.render(variant).trim().to_string(),
                        value.render(variant).trim().to_string(),
                        origin,
                    ));
                }
            } else if node.variants_settled {
                return Err(ConcretizationError::InvalidVariantValue {
                    package: name.to_string(),
                    variant: variant.clone(),
                    value: value.to_string(),
                    reason: format!("the variant does not apply to this build ({origin})"),
                });
            }
            node.requested_variants
                .insert(variant.clone(), (value.clone(), origin.to_string()));
        }

        if !node.origins.iter().any(|existing| existing == origin) {
            node.origins.push(origin.to_string());
        }
        Ok(())
    }

    /// Records a `^name` constraint that applies wherever `name` appears.
    pub(crate) fn request_dependency(
        &self,
        graph: &mut Graph,
        spec: &Spec,
        origin: &str,
    ) -> ConcretizationResult<()> {
        let name = spec.name.as_str();
        let node_spec = without_dependencies(spec);
        if self.store.get_declaration(name).is_some() {
            graph
                .requested
                .entry(name.to_string())
                .or_default()
                .push((node_spec.clone(), origin.to_string()));
            self.constrain_node(graph, name, &node_spec, origin)?;
        } else if self.store.is_virtual(name) {
            let provider = {
                let request = graph.virtuals.entry(name.to_string()).or_default();
                request.interface = request.interface.intersect(&spec.version);
                let forwarded = forwarded_constraint(spec);
                request.constraints.push((forwarded.clone(), origin.to_string()));
                request.provider.clone().map(|provider| (provider, forwarded))
            };
            if let Some((provider, forwarded)) = provider {
                self.constrain_node(graph, &provider, &forwarded, origin)?;
            }
        } else {
            return Err(ConcretizationError::UnknownPackage {
                name: name.to_string(),
                required_by: origin.to_string(),
            });
        }

        for nested in &spec.dependencies {
            self.request_dependency(graph, &nested.spec, origin)?;
        }
        Ok(())
    }

    /// Adds the edge `parent -> spec` with `types`, creating the child or
    /// registering a virtual request as needed.
    pub(crate) fn attach(
        &self,
        graph: &mut Graph,
        parent: &str,
        spec: &Spec,
        types: &DependencyTypes,
        origin: &str,
    ) -> ConcretizationResult<()> {
        let name = spec.name.as_str();
        if self.store.get_declaration(name).is_some() {
            self.ensure_node(graph, name, origin)?;
            self.constrain_node(graph, name, &without_dependencies(spec), origin)?;
            graph.add_edge(parent, name, types, None);
        } else if self.store.is_virtual(name) {
            let forwarded = forwarded_constraint(spec);
            let provider = {
                let request = graph.virtuals.entry(name.to_string()).or_default();
                request.interface = request.interface.intersect(&spec.version);
                request
                    .requesters
                    .entry(parent.to_string())
                    .or_default()
                    .merge(types);
                request.constraints.push((forwarded.clone(), origin.to_string()));
                request.provider.clone()
            };
            if let Some(provider) = provider {
                self.constrain_node(graph, &provider, &forwarded, origin)?;
                graph.add_edge(parent, &provider, types, Some(name));
            }
        } else {
            return Err(ConcretizationError::UnknownPackage {
                name: name.to_string(),
                required_by: parent.to_string(),
            });
        }

        for nested in &spec.dependencies {
            self.request_dependency(graph, &nested.spec, origin)?;
        }
        Ok(())
    }

    /// Applies every dependency template whose condition now holds and
    /// records the targets of those still undecided.
    pub(crate) fn expand(&self, graph: &mut Graph) -> ConcretizationResult<bool> {
        let mut ready = Vec::new();
        let mut pending = BTreeSet::new();
        for (name, node) in &graph.nodes {
            let declaration = self.declaration(name)?;
            let view = graph.view(name);
            for (index, template) in declaration.dependencies.iter().enumerate() {
                if node.applied_templates.contains(&index) {
                    continue;
                }
                let truth = template
                    .when
                    .as_ref()
                    .map(|when| when.evaluate(&view))
                    .unwrap_or(Truth::True);
                match truth {
                    Truth::True => ready.push((name.clone(), index)),
                    Truth::Unknown => {
                        pending.insert(template.spec.name.clone());
                    }
                    Truth::False => {}
                }
            }
        }

        let evaluated = graph.nodes.keys().cloned().collect::<Vec<_>>();
        graph.pending = pending;
        for name in evaluated {
            if let Some(node) = graph.nodes.get_mut(&name) {
                node.expanded = true;
            }
        }

        let progress = !ready.is_empty();
        for (parent, index) in ready {
            let declaration = self.declaration(&parent)?;
            let Some(template) = declaration.dependencies.get(index) else {
                continue;
            };
            let origin = format!("{parent} depends on {}", template.spec);
            debug!(%origin, types = %template.types, "applying dependency");
            self.attach(graph, &parent, &template.spec, &template.types, &origin)?;
            if let Some(node) = graph.nodes.get_mut(&parent) {
                node.applied_templates.insert(index);
            }
        }
        Ok(progress)
    }

    /// Fails on the first declared conflict that definitely holds.
    pub(crate) fn check_conflicts(&self, graph: &Graph) -> ConcretizationResult<()> {
        for name in graph.nodes.keys() {
            let declaration = self.declaration(name)?;
            let view = graph.view(name);
            for declared in &declaration.conflicts {
                let active = declared
                    .when
                    .as_ref()
                    .map(|when| when.evaluate(&view))
                    .unwrap_or(Truth::True);
                if active.and(declared.with.evaluate(&view)) != Truth::True {
                    continue;
                }
                let first = match &declared.when {
                    Some(when) => format!("{} {}", view.name(), when),
                    None => view.name().to_string(),
                };
                return Err(ConcretizationError::SpecConflict {
                    package: name.clone(),
                    first,
                    second: declared.with.to_string(),
                    reason: declared
                        .message
                        .clone()
                        .unwrap_or_else(|| "declared conflict".to_string()),
                });
            }
        }
        Ok(())
    }
}

/// What a virtual request passes on to its provider: everything except the
/// name and the interface version.
fn forwarded_constraint(spec: &Spec) -> Spec {
    let mut forwarded = without_dependencies(spec);
    forwarded.version = VersionConstraint::Any;
    forwarded
}
