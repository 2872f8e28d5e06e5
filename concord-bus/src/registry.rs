//! Endpoint registry and topic index.
//!
//! Both maps are sharded (`DashMap`), so there is no global lock. When an
//! operation touches both, it takes the endpoint entry first and the topic
//! entry second; no guard is ever held across an `.await`.

use crate::handler::MessageHandler;
use chrono::Utc;
use concord_core::{AgentId, BusError, ConcordResult, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Topic every endpoint is subscribed to under its own id.
pub fn agent_topic(agent_id: &str) -> String {
    format!("agent.{agent_id}")
}

/// Topic shared by every endpoint of one agent type.
pub fn agent_type_topic(agent_type: &str) -> String {
    format!("agent-type.{agent_type}")
}

type Subscribers = BTreeMap<AgentId, Arc<dyn MessageHandler>>;

struct AgentEndpoint {
    agent_type: String,
    capabilities: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    subscriptions: BTreeSet<String>,
    registered_at: Timestamp,
    last_heartbeat: Instant,
    active: bool,
    /// Set once the current lapse has been announced; cleared by a heartbeat.
    lapse_announced: bool,
    unregistered_at: Option<Instant>,
}

impl AgentEndpoint {
    fn is_live(&self, now: Instant, window: Duration) -> bool {
        self.active && now.saturating_duration_since(self.last_heartbeat) < window
    }

    fn info(&self, agent_id: &str, now: Instant, window: Duration) -> EndpointInfo {
        EndpointInfo {
            agent_id: agent_id.to_string(),
            agent_type: self.agent_type.clone(),
            capabilities: self.capabilities.clone(),
            subscriptions: self.subscriptions.iter().cloned().collect(),
            registered_at: self.registered_at,
            active: self.active,
            live: self.is_live(now, window),
        }
    }
}

/// Read-only view of a registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub subscriptions: Vec<String>,
    pub registered_at: Timestamp,
    /// False once unregistered
    pub active: bool,
    /// Active and heartbeat within the liveness window
    pub live: bool,
}

#[derive(Default)]
pub(crate) struct EndpointRegistry {
    endpoints: DashMap<AgentId, AgentEndpoint>,
    topics: DashMap<String, Subscribers>,
}

impl EndpointRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh endpoint and subscribe it to its id and type topics.
    /// An unregistered endpoint with the same id is replaced.
    pub(crate) fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        capabilities: Vec<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> ConcordResult<()> {
        let own_topics = [agent_topic(agent_id), agent_type_topic(agent_type)];
        let endpoint = AgentEndpoint {
            agent_type: agent_type.to_string(),
            capabilities,
            handler: handler.clone(),
            subscriptions: own_topics.iter().cloned().collect(),
            registered_at: Utc::now(),
            last_heartbeat: Instant::now(),
            active: true,
            lapse_announced: false,
            unregistered_at: None,
        };

        let _guard = match self.endpoints.entry(agent_id.to_string()) {
            Entry::Occupied(entry) if entry.get().active => {
                return Err(BusError::AlreadyRegistered {
                    agent_id: agent_id.to_string(),
                }
                .into());
            }
            Entry::Occupied(mut entry) => {
                entry.insert(endpoint);
                entry.into_ref()
            }
            Entry::Vacant(entry) => entry.insert(endpoint),
        };
        for topic in own_topics {
            self.topics
                .entry(topic)
                .or_default()
                .insert(agent_id.to_string(), handler.clone());
        }
        Ok(())
    }

    /// Deactivate an endpoint and drop all of its subscriptions.
    pub(crate) fn unregister(&self, agent_id: &str) -> ConcordResult<EndpointInfo> {
        let now = Instant::now();
        let mut endpoint = match self.endpoints.get_mut(agent_id) {
            Some(ep) if ep.active => ep,
            _ => return Err(unknown(agent_id)),
        };
        endpoint.active = false;
        endpoint.unregistered_at = Some(now);
        let subscriptions = std::mem::take(&mut endpoint.subscriptions);
        for topic in &subscriptions {
            self.remove_subscriber(topic, agent_id);
        }
        let mut info = endpoint.info(agent_id, now, Duration::ZERO);
        info.subscriptions = subscriptions.into_iter().collect();
        Ok(info)
    }

    pub(crate) fn subscribe(
        &self,
        agent_id: &str,
        topic: &str,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> ConcordResult<()> {
        let mut endpoint = match self.endpoints.get_mut(agent_id) {
            Some(ep) if ep.active => ep,
            _ => return Err(unknown(agent_id)),
        };
        let handler = handler.unwrap_or_else(|| endpoint.handler.clone());
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(agent_id.to_string(), handler);
        endpoint.subscriptions.insert(topic.to_string());
        Ok(())
    }

    /// Returns whether the endpoint was subscribed.
    pub(crate) fn unsubscribe(&self, agent_id: &str, topic: &str) -> ConcordResult<bool> {
        let mut endpoint = match self.endpoints.get_mut(agent_id) {
            Some(ep) if ep.active => ep,
            _ => return Err(unknown(agent_id)),
        };
        let was_subscribed = endpoint.subscriptions.remove(topic);
        if was_subscribed {
            self.remove_subscriber(topic, agent_id);
        }
        Ok(was_subscribed)
    }

    fn remove_subscriber(&self, topic: &str, agent_id: &str) {
        if let Entry::Occupied(mut entry) = self.topics.entry(topic.to_string()) {
            entry.get_mut().remove(agent_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Refresh liveness and re-arm the inactive announcement.
    pub(crate) fn heartbeat(&self, agent_id: &str) -> ConcordResult<()> {
        match self.endpoints.get_mut(agent_id) {
            Some(mut ep) if ep.active => {
                ep.last_heartbeat = Instant::now();
                ep.lapse_announced = false;
                Ok(())
            }
            _ => Err(unknown(agent_id)),
        }
    }

    /// Handler of a live endpoint, for direct delivery.
    pub(crate) fn live_handler(
        &self,
        agent_id: &str,
        window: Duration,
    ) -> Option<Arc<dyn MessageHandler>> {
        let now = Instant::now();
        self.endpoints
            .get(agent_id)
            .filter(|ep| ep.is_live(now, window))
            .map(|ep| ep.handler.clone())
    }

    /// Live subscribers of a topic. The topic guard is released before
    /// endpoints are consulted.
    pub(crate) fn subscribers(
        &self,
        topic: &str,
        window: Duration,
    ) -> Vec<(AgentId, Arc<dyn MessageHandler>)> {
        let snapshot: Vec<(AgentId, Arc<dyn MessageHandler>)> = match self.topics.get(topic) {
            Some(subs) => subs
                .iter()
                .map(|(id, h)| (id.clone(), h.clone()))
                .collect(),
            None => return Vec::new(),
        };
        let now = Instant::now();
        snapshot
            .into_iter()
            .filter(|(id, _)| {
                self.endpoints
                    .get(id)
                    .is_some_and(|ep| ep.is_live(now, window))
            })
            .collect()
    }

    /// Endpoints that failed liveness since their last announcement. Each
    /// lapse is reported once.
    pub(crate) fn take_lapsed(&self, window: Duration) -> Vec<(AgentId, String)> {
        let now = Instant::now();
        let mut lapsed = Vec::new();
        for mut ep in self.endpoints.iter_mut() {
            if ep.active && !ep.lapse_announced && !ep.is_live(now, window) {
                ep.lapse_announced = true;
                lapsed.push((ep.key().clone(), ep.agent_type.clone()));
            }
        }
        lapsed.sort();
        lapsed
    }

    /// Forget endpoints unregistered longer than `retention` ago.
    pub(crate) fn purge_unregistered(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.endpoints.len();
        self.endpoints.retain(|_, ep| match ep.unregistered_at {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
        before.saturating_sub(self.endpoints.len())
    }

    pub(crate) fn endpoint(&self, agent_id: &str, window: Duration) -> Option<EndpointInfo> {
        let now = Instant::now();
        self.endpoints
            .get(agent_id)
            .map(|ep| ep.info(agent_id, now, window))
    }

    pub(crate) fn endpoints(&self, window: Duration) -> Vec<EndpointInfo> {
        let now = Instant::now();
        let mut all: Vec<EndpointInfo> = self
            .endpoints
            .iter()
            .map(|ep| ep.info(ep.key(), now, window))
            .collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Agent ids subscribed to a topic, live or not.
    pub(crate) fn topic_members(&self, topic: &str) -> Vec<AgentId> {
        self.topics
            .get(topic)
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.endpoints.len())
            .field("topics", &self.topics.len())
            .finish()
    }
}

fn unknown(agent_id: &str) -> concord_core::ConcordError {
    BusError::UnknownAgent {
        agent_id: agent_id.to_string(),
    }
    .into()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopHandler;

    const WINDOW: Duration = Duration::from_secs(60);

    fn noop() -> Arc<dyn MessageHandler> {
        Arc::new(NoopHandler)
    }

    #[test]
    fn test_register_subscribes_own_topics() {
        let registry = EndpointRegistry::new();
        registry.register("a1", "coder", vec![], noop()).unwrap();
        assert_eq!(registry.topic_members("agent.a1"), vec!["a1".to_string()]);
        assert_eq!(registry.topic_members("agent-type.coder"), vec!["a1".to_string()]);
        let info = registry.endpoint("a1", WINDOW).unwrap();
        assert!(info.live);
        assert_eq!(info.subscriptions.len(), 2);
    }

    #[test]
    fn test_double_register_rejected() {
        let registry = EndpointRegistry::new();
        registry.register("a1", "coder", vec![], noop()).unwrap();
        assert!(registry.register("a1", "coder", vec![], noop()).is_err());
    }

    #[test]
    fn test_unregister_clears_subscriptions_in_lockstep() {
        let registry = EndpointRegistry::new();
        registry.register("a1", "coder", vec![], noop()).unwrap();
        registry.subscribe("a1", "news", None).unwrap();
        let info = registry.unregister("a1").unwrap();
        assert_eq!(info.subscriptions.len(), 3);
        assert!(registry.topic_members("news").is_empty());
        assert!(registry.topic_members("agent.a1").is_empty());
        assert!(!registry.endpoint("a1", WINDOW).unwrap().active);
        assert!(registry.live_handler("a1", WINDOW).is_none());
        // Re-registration after unregister is allowed.
        registry.register("a1", "coder", vec![], noop()).unwrap();
    }

    #[test]
    fn test_subscribe_unknown_agent() {
        let registry = EndpointRegistry::new();
        assert!(registry.subscribe("ghost", "t", None).is_err());
        assert!(registry.heartbeat("ghost").is_err());
    }

    #[test]
    fn test_unsubscribe() {
        let registry = EndpointRegistry::new();
        registry.register("a1", "coder", vec![], noop()).unwrap();
        registry.subscribe("a1", "news", None).unwrap();
        assert!(registry.unsubscribe("a1", "news").unwrap());
        assert!(!registry.unsubscribe("a1", "news").unwrap());
        assert!(registry.topic_members("news").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapse_announced_once_until_heartbeat() {
        let registry = EndpointRegistry::new();
        registry.register("a1", "coder", vec![], noop()).unwrap();
        registry.register("a2", "coder", vec![], noop()).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        registry.heartbeat("a2").unwrap();

        assert_eq!(registry.take_lapsed(WINDOW), vec![("a1".to_string(), "coder".to_string())]);
        assert!(registry.take_lapsed(WINDOW).is_empty());
        assert!(registry.live_handler("a1", WINDOW).is_none());
        assert_eq!(registry.subscribers("agent-type.coder", WINDOW).len(), 1);

        registry.heartbeat("a1").unwrap();
        assert!(registry.live_handler("a1", WINDOW).is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.take_lapsed(WINDOW).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_unregistered() {
        let registry = EndpointRegistry::new();
        registry.register("a1", "coder", vec![], noop()).unwrap();
        registry.unregister("a1").unwrap();
        assert_eq!(registry.purge_unregistered(WINDOW), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.purge_unregistered(WINDOW), 1);
        assert!(registry.endpoint("a1", WINDOW).is_none());
    }
}
