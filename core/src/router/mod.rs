/// Router (§4.2): protocol-level helpers layered on top of the Bus — direct, broadcast and
/// type-based addressing — plus FIFO-within-priority accounting. Every route still goes
/// through the Bus so plain topic subscribers keep receiving traffic regardless of whether
/// they came in through the Router.
pub mod subscription;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

use crate::errors::{EventBusError, EventBusResult};
use crate::event_bus::EventBus;
use crate::model::{Envelope, RoutePriority};

pub use subscription::{SubscribeOptions, SubscriptionHandle, SubscriptionManager};

fn direct_topic(agent_id: &str) -> String {
    format!("message:direct:{agent_id}")
}

const BROADCAST_TOPIC: &str = "message:broadcast";

fn type_topic(agent_type: &str) -> String {
    format!("message:type:{agent_type}")
}

struct QueuedRoute {
    priority: RoutePriority,
    sequence: u64,
}

/// A runtime-registrable regex filter on route targets (§4.2: "Routing rules ... may be
/// registered and removed at runtime; they participate in match only when set"). An empty
/// rule set imposes no restriction; once at least one enabled rule exists, a direct or
/// type-based route target must match at least one of them to be delivered.
pub struct RoutingRule {
    pub id: String,
    pub pattern: String,
    pub enabled: bool,
    regex: Regex,
}

impl RoutingRule {
    fn matches(&self, target: &str) -> bool {
        self.enabled && self.regex.is_match(target)
    }
}

/// Thin addressing layer over [`EventBus`]; queues routes only for FIFO-within-priority
/// accounting, not for actual delivery ordering (delivery order follows the bus's own mode).
pub struct Router {
    bus: Arc<EventBus>,
    queue: Mutex<Vec<QueuedRoute>>,
    next_sequence: std::sync::atomic::AtomicU64,
    invocation_counts: Mutex<HashMap<String, u64>>,
    rules: Mutex<Vec<RoutingRule>>,
    next_rule_id: std::sync::atomic::AtomicU64,
}

impl Router {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Router {
            bus,
            queue: Mutex::new(Vec::new()),
            next_sequence: std::sync::atomic::AtomicU64::new(0),
            invocation_counts: Mutex::new(HashMap::new()),
            rules: Mutex::new(Vec::new()),
            next_rule_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn record_route(&self, priority: RoutePriority) {
        let sequence = self
            .next_sequence
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.queue.lock().push(QueuedRoute { priority, sequence });
    }

    /// Registers a regex-backed routing rule and returns its id. `pattern` is matched
    /// against the route target (agent id for direct routes, agent type for type routes);
    /// broadcast routes are never filtered by rules.
    pub fn register_rule(&self, pattern: &str) -> EventBusResult<String> {
        let regex = Regex::new(pattern).map_err(|e| EventBusError::InvalidPattern(e.to_string()))?;
        let id = format!(
            "rule-{}",
            self.next_rule_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        );
        self.rules.lock().push(RoutingRule {
            id: id.clone(),
            pattern: pattern.to_string(),
            enabled: true,
            regex,
        });
        Ok(id)
    }

    pub fn remove_rule(&self, rule_id: &str) {
        self.rules.lock().retain(|r| r.id != rule_id);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    /// A target passes when no rules are registered, or when at least one enabled rule
    /// matches it — rules only ever narrow delivery once at least one is set.
    fn target_allowed(&self, target: &str) -> bool {
        let rules = self.rules.lock();
        rules.is_empty() || rules.iter().any(|r| r.matches(target))
    }

    pub async fn send_direct(
        &self,
        agent_id: &str,
        data: serde_json::Value,
        priority: RoutePriority,
    ) -> EventBusResult<Envelope> {
        if !self.target_allowed(agent_id) {
            return Err(EventBusError::RuleRejected(agent_id.to_string()));
        }
        self.record_route(priority);
        self.bus.publish(&direct_topic(agent_id), data, None).await
    }

    pub async fn broadcast(
        &self,
        data: serde_json::Value,
        priority: RoutePriority,
    ) -> EventBusResult<Envelope> {
        self.record_route(priority);
        self.bus.publish(BROADCAST_TOPIC, data, None).await
    }

    pub async fn send_to_type(
        &self,
        agent_type: &str,
        data: serde_json::Value,
        priority: RoutePriority,
    ) -> EventBusResult<Envelope> {
        if !self.target_allowed(agent_type) {
            return Err(EventBusError::RuleRejected(agent_type.to_string()));
        }
        self.record_route(priority);
        self.bus.publish(&type_topic(agent_type), data, None).await
    }

    pub fn record_invocation(&self, subscriber_id: &str) {
        *self
            .invocation_counts
            .lock()
            .entry(subscriber_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn invocation_count(&self, subscriber_id: &str) -> u64 {
        *self.invocation_counts.lock().get(subscriber_id).unwrap_or(&0)
    }

    /// Routes queued for accounting/introspection, sorted FIFO within priority tier
    /// (highest priority first, original arrival order preserved within a tier).
    pub fn pending_by_priority(&self) -> Vec<(RoutePriority, u64)> {
        let mut routes: Vec<(RoutePriority, u64)> = self
            .queue
            .lock()
            .iter()
            .map(|r| (r.priority, r.sequence))
            .collect();
        routes.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_message_publishes_through_bus() {
        let bus = EventBus::new();
        let router = Router::new(bus.clone());
        let envelope = router
            .send_direct("agent-1", serde_json::json!({"hello": "world"}), RoutePriority::Normal)
            .await
            .unwrap();
        assert_eq!(envelope.topic, "message:direct:agent-1");
    }

    #[tokio::test]
    async fn unfiltered_router_allows_any_direct_target() {
        let bus = EventBus::new();
        let router = Router::new(bus);
        let envelope = router
            .send_direct("agent-9", serde_json::json!({}), RoutePriority::Normal)
            .await
            .unwrap();
        assert_eq!(envelope.topic, "message:direct:agent-9");
    }

    #[tokio::test]
    async fn registered_rule_rejects_non_matching_target() {
        let bus = EventBus::new();
        let router = Router::new(bus);
        router.register_rule("^agent-1$").unwrap();

        let err = router
            .send_direct("agent-2", serde_json::json!({}), RoutePriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::RuleRejected(_)));

        let envelope = router
            .send_direct("agent-1", serde_json::json!({}), RoutePriority::Normal)
            .await
            .unwrap();
        assert_eq!(envelope.topic, "message:direct:agent-1");
    }

    #[test]
    fn removed_rule_no_longer_restricts_targets() {
        let bus = EventBus::new();
        let router = Router::new(bus);
        let rule_id = router.register_rule("^agent-1$").unwrap();
        assert_eq!(router.rule_count(), 1);
        router.remove_rule(&rule_id);
        assert_eq!(router.rule_count(), 0);
        assert!(router.target_allowed("agent-anything"));
    }

    #[test]
    fn pending_routes_sort_high_priority_first_fifo_within_tier() {
        let bus = EventBus::new();
        let router = Router::new(bus);
        router.record_route(RoutePriority::Low);
        router.record_route(RoutePriority::High);
        router.record_route(RoutePriority::High);
        router.record_route(RoutePriority::Normal);

        let ordered = router.pending_by_priority();
        assert_eq!(ordered[0].0, RoutePriority::High);
        assert_eq!(ordered[1].0, RoutePriority::High);
        assert!(ordered[0].1 < ordered[1].1);
        assert_eq!(ordered[2].0, RoutePriority::Normal);
        assert_eq!(ordered[3].0, RoutePriority::Low);
    }
}
