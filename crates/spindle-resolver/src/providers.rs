use spindle_core::{Version, VersionConstraint};
use tracing::debug;

use crate::error::{ConcretizationError, ConcretizationResult};
use crate::graph::Graph;
use crate::resolve::{interface_suffix, Concretizer};
use crate::types::ProviderTiebreak;

impl Concretizer<'_> {
    /// Picks one provider for every requested virtual that has none yet and
    /// wires all requesters to it.
    pub(crate) fn bind_virtuals(&self, graph: &mut Graph) -> ConcretizationResult<bool> {
        let unbound = graph
            .virtuals
            .iter()
            .filter(|(_, request)| request.provider.is_none() && !request.requesters.is_empty())
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        let mut progress = false;
        for virtual_name in unbound {
            let provider = self.choose_provider(graph, &virtual_name)?;
            debug!(virtual_name = %virtual_name, %provider, "bound virtual");

            let origin = format!("provider of {virtual_name}");
            self.ensure_node(graph, &provider, &origin)?;
            let Some(request) = graph.virtuals.get_mut(&virtual_name) else {
                continue;
            };
            request.provider = Some(provider.clone());
            let requesters = request.requesters.clone();
            let constraints = request.constraints.clone();

            for (spec, origin) in constraints {
                self.constrain_node(graph, &provider, &spec, &origin)?;
            }
            for (parent, types) in requesters {
                graph.add_edge(&parent, &provider, &types, Some(&virtual_name));
            }
            progress = true;
        }
        Ok(progress)
    }

    /// Preference order: requested by name, already in the graph, installed,
    /// configured, store default, then the tiebreak policy.
    fn choose_provider(&self, graph: &Graph, virtual_name: &str) -> ConcretizationResult<String> {
        let interface = graph
            .virtuals
            .get(virtual_name)
            .map(|request| request.interface.clone())
            .unwrap_or_default();

        let mut candidates = self
            .store
            .providers(virtual_name)
            .into_iter()
            .filter(|declaration| {
                declaration
                    .provided(virtual_name)
                    .any(|entry| interfaces_overlap(&interface, &entry.spec.version))
            })
            .map(|declaration| declaration.name.clone())
            .collect::<Vec<_>>();
        candidates.sort();
        candidates.dedup();

        if candidates.is_empty() {
            return Err(ConcretizationError::NoProvider {
                virtual_name: virtual_name.to_string(),
                constraint: interface_suffix(&interface),
            });
        }
        let is_candidate = |name: &str| candidates.iter().any(|candidate| candidate == name);

        if let Some(name) = graph.requested.keys().find(|name| is_candidate(name)) {
            return Ok(name.clone());
        }
        if let Some(name) = graph.nodes.keys().find(|name| is_candidate(name)) {
            return Ok(name.clone());
        }
        if let Some(name) = self.installed.keys().find(|name| is_candidate(name)) {
            return Ok(name.clone());
        }
        let configured = self
            .config
            .providers
            .get(virtual_name)
            .into_iter()
            .flatten()
            .find(|name| is_candidate(name));
        if let Some(name) = configured {
            return Ok(name.clone());
        }
        if let Some(name) = self
            .store
            .default_providers(virtual_name)
            .into_iter()
            .find(|name| is_candidate(name))
        {
            return Ok(name);
        }

        match (candidates.len(), self.config.provider_tiebreak) {
            (1, _) | (_, ProviderTiebreak::Lexicographic) => Ok(candidates[0].clone()),
            (_, ProviderTiebreak::Strict) => Err(ConcretizationError::AmbiguousProvider {
                virtual_name: virtual_name.to_string(),
                candidates,
            }),
        }
    }
}

/// Whether some interface version satisfies both constraints, judged on the
/// bounds each constraint names.
pub(crate) fn interfaces_overlap(requested: &VersionConstraint, provided: &VersionConstraint) -> bool {
    if requested.is_any() || provided.is_any() {
        return true;
    }
    representatives(provided)
        .iter()
        .any(|version| requested.matches(version))
        || representatives(requested)
            .iter()
            .any(|version| provided.matches(version))
}

fn representatives(constraint: &VersionConstraint) -> Vec<Version> {
    match constraint {
        VersionConstraint::Any => Vec::new(),
        VersionConstraint::Exact(version) | VersionConstraint::Prefix(version) => {
            vec![version.clone()]
        }
        VersionConstraint::Range { low, high } => low.iter().chain(high.iter()).cloned().collect(),
        VersionConstraint::Set(members) | VersionConstraint::All(members) => {
            members.iter().flat_map(representatives).collect()
        }
    }
}
