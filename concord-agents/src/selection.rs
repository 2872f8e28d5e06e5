//! Choosing which live agents receive a request.

use concord_bus::EndpointInfo;
use concord_core::ComplexRequest;
use concord_quality::tokenize;
use std::collections::HashSet;

/// How an agent set was chosen, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    Preferred,
    Defaults,
    Capabilities,
    AllLive,
}

impl SelectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionSource::Preferred => "preferred",
            SelectionSource::Defaults => "defaults",
            SelectionSource::Capabilities => "capabilities",
            SelectionSource::AllLive => "all_live",
        }
    }
}

/// Pick the agents for `request` among `live` endpoints.
///
/// The first non-empty of these wins:
/// 1. the request's preferred agents, each naming an agent id or type
/// 2. the configured default agents, same matching
/// 3. agents with a capability named in the description
/// 4. every live agent
///
/// Preferences that match nothing are skipped. Results keep the order of the
/// preferences and never repeat an agent.
pub fn select_agents(
    request: &ComplexRequest,
    live: &[EndpointInfo],
    defaults: &[String],
) -> (Vec<EndpointInfo>, SelectionSource) {
    let live: Vec<&EndpointInfo> = live.iter().filter(|e| e.live).collect();

    if !request.preferred_agents.is_empty() {
        let chosen = match_names(&request.preferred_agents, &live);
        return (chosen, SelectionSource::Preferred);
    }

    let chosen = match_names(defaults, &live);
    if !chosen.is_empty() {
        return (chosen, SelectionSource::Defaults);
    }

    let words: HashSet<String> = tokenize(&request.description).into_iter().collect();
    let chosen: Vec<EndpointInfo> = live
        .iter()
        .filter(|e| {
            e.capabilities
                .iter()
                .any(|c| words.contains(&c.to_lowercase()))
        })
        .map(|e| (*e).clone())
        .collect();
    if !chosen.is_empty() {
        return (chosen, SelectionSource::Capabilities);
    }

    (
        live.into_iter().cloned().collect(),
        SelectionSource::AllLive,
    )
}

fn match_names(names: &[String], live: &[&EndpointInfo]) -> Vec<EndpointInfo> {
    let mut seen = HashSet::new();
    let mut chosen = Vec::new();
    for name in names {
        for endpoint in live
            .iter()
            .filter(|e| e.agent_id == *name || e.agent_type == *name)
        {
            if seen.insert(endpoint.agent_id.clone()) {
                chosen.push((*endpoint).clone());
            }
        }
    }
    chosen
}
