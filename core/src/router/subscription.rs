/// Subscription Manager (§4.2): opaque handles, named groups, `once`/TTL auto-removal,
/// caller-supplied-id duplicate detection, and listener-leak warnings.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::event_bus::{EventBus, Handler};
use crate::model::DeliveryMode;
use crate::topics;

const LISTENER_LEAK_THRESHOLD: usize = 50;

/// Opaque handle returned by [`SubscriptionManager::subscribe`]; the only thing callers
/// need to retain in order to unsubscribe later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub String);

struct Registration {
    handle: SubscriptionHandle,
    topic: String,
    group_id: Option<String>,
    subscriber_id: Option<String>,
    once: bool,
    ttl_ms: Option<u64>,
    expires_at: Option<DateTime<Utc>>,
    subscribed_at: DateTime<Utc>,
    invocation_count: u64,
}

/// Options accepted by [`SubscriptionManager::subscribe`]; all optional fields default to
/// "no special lifecycle" (no TTL, no once, no group, no dedup).
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub group_id: Option<String>,
    pub subscriber_id: Option<String>,
    pub once: bool,
    pub ttl_ms: Option<u64>,
    pub mode: DeliveryMode,
}

/// Sits on top of an [`EventBus`], adding subscription lifecycle the bus itself doesn't
/// track. Registers every subscription it manages under a bus-level `subscriber_id` derived
/// from the handle, so unsubscribe always maps cleanly onto `EventBus::unsubscribe`.
pub struct SubscriptionManager {
    bus: Arc<EventBus>,
    registrations: Mutex<HashMap<String, Registration>>,
    dedup_index: Mutex<HashMap<(String, String, Option<String>), String>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl SubscriptionManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        SubscriptionManager {
            bus,
            registrations: Mutex::new(HashMap::new()),
            dedup_index: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn fresh_handle(&self) -> SubscriptionHandle {
        let n = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        SubscriptionHandle(format!("sub-{n}"))
    }

    /// Fire-and-forget publish onto the underlying bus; used for the manager's own
    /// bookkeeping topics (§4.2/§6), which are reported, never awaited, by callers of a
    /// synchronous API.
    fn publish_bookkeeping(&self, topic: &'static str, payload: serde_json::Value) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(topic, payload, None).await {
                warn!(topic, error = %e, "subscription manager: failed to publish bookkeeping event");
            }
        });
    }

    /// Registers `handler` against `topic`. When `opts.subscriber_id` is set and a prior
    /// subscription exists for the same `(topic, subscriber_id, group_id)` triple, that
    /// existing handle is returned unchanged and its invocation counter is bumped — this is
    /// the duplicate-subscription path described in §4.2.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
        opts: SubscribeOptions,
    ) -> SubscriptionHandle {
        if let Some(subscriber_id) = &opts.subscriber_id {
            let key = (topic.to_string(), subscriber_id.clone(), opts.group_id.clone());
            let mut dedup = self.dedup_index.lock();
            if let Some(existing_id) = dedup.get(&key).cloned() {
                let mut regs = self.registrations.lock();
                if let Some(reg) = regs.get_mut(&existing_id) {
                    reg.invocation_count += 1;
                    let handle = reg.handle.clone();
                    drop(regs);
                    self.publish_bookkeeping(
                        topics::DUPLICATE_SUBSCRIPTION,
                        serde_json::json!({ "topic": topic, "handle": handle.0 }),
                    );
                    return handle;
                }
            }
            let handle = self.register(topic, handler, &opts);
            dedup.insert(key, handle.0.clone());
            return handle;
        }

        self.register(topic, handler, &opts)
    }

    fn register(&self, topic: &str, handler: Handler, opts: &SubscribeOptions) -> SubscriptionHandle {
        let handle = self.fresh_handle();
        let now = Utc::now();
        let expires_at = opts
            .ttl_ms
            .map(|ms| now + chrono::Duration::milliseconds(ms as i64));

        self.bus
            .subscribe(handle.0.clone(), topic, opts.mode, handler)
            .expect("topic pattern validated by caller");

        self.registrations.lock().insert(
            handle.0.clone(),
            Registration {
                handle: handle.clone(),
                topic: topic.to_string(),
                group_id: opts.group_id.clone(),
                subscriber_id: opts.subscriber_id.clone(),
                once: opts.once,
                ttl_ms: opts.ttl_ms,
                expires_at,
                subscribed_at: now,
                invocation_count: 0,
            },
        );

        let count = self.listener_count(topic);
        if count > LISTENER_LEAK_THRESHOLD {
            warn!(topic, count, "listener-leak-warning");
            self.publish_bookkeeping(
                topics::LISTENER_LEAK_WARNING,
                serde_json::json!({ "topic": topic, "count": count }),
            );
        }

        handle
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut regs = self.registrations.lock();
        if let Some(reg) = regs.remove(&handle.0) {
            self.bus.unsubscribe(&handle.0, &reg.topic);
            let mut dedup = self.dedup_index.lock();
            dedup.retain(|_, v| v != &handle.0);
        }
    }

    pub fn unsubscribe_group(&self, group_id: &str) {
        let mut regs = self.registrations.lock();
        let to_remove: Vec<String> = regs
            .iter()
            .filter(|(_, r)| r.group_id.as_deref() == Some(group_id))
            .map(|(id, _)| id.clone())
            .collect();
        let mut dedup = self.dedup_index.lock();
        for id in to_remove {
            if let Some(reg) = regs.remove(&id) {
                self.bus.unsubscribe(&id, &reg.topic);
                dedup.retain(|_, v| v != &id);
            }
        }
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.registrations
            .lock()
            .values()
            .filter(|r| r.topic == topic)
            .count()
    }

    /// Called by a scheduler tick (or inline after dispatch) to remove `once` subscriptions
    /// that have already fired once and TTL subscriptions past their `expires_at`. TTL
    /// expiry additionally publishes `subscription-expired` (§4.2/§8); a `once` removal is
    /// its own documented lifecycle step and does not.
    pub fn sweep_expired(&self) -> Vec<SubscriptionHandle> {
        let now = Utc::now();
        let mut regs = self.registrations.lock();
        let expired: Vec<(String, bool)> = regs
            .iter()
            .filter_map(|(id, r)| {
                let ttl_expired = r.expires_at.map(|e| now >= e).unwrap_or(false);
                let once_fired = r.once && r.invocation_count >= 1;
                if ttl_expired || once_fired {
                    Some((id.clone(), ttl_expired))
                } else {
                    None
                }
            })
            .collect();

        let mut handles = Vec::new();
        let mut dedup = self.dedup_index.lock();
        for (id, ttl_expired) in expired {
            if let Some(reg) = regs.remove(&id) {
                self.bus.unsubscribe(&id, &reg.topic);
                dedup.retain(|_, v| v != &id);
                if ttl_expired {
                    self.publish_bookkeeping(
                        topics::SUBSCRIPTION_EXPIRED,
                        serde_json::json!({ "topic": reg.topic, "handle": reg.handle.0 }),
                    );
                }
                handles.push(reg.handle);
            }
        }
        handles
    }

    pub fn mark_invoked(&self, handle: &SubscriptionHandle) {
        if let Some(reg) = self.registrations.lock().get_mut(&handle.0) {
            reg.invocation_count += 1;
        }
    }

    pub fn subscribed_at(&self, handle: &SubscriptionHandle) -> Option<DateTime<Utc>> {
        self.registrations.lock().get(&handle.0).map(|r| r.subscribed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HandlerOutcome;

    fn noop_handler() -> Handler {
        Arc::new(|_| HandlerOutcome::ok())
    }

    #[test]
    fn duplicate_subscriber_id_reuses_handle() {
        let bus = EventBus::new();
        let mgr = SubscriptionManager::new(bus);
        let opts = SubscribeOptions {
            subscriber_id: Some("watcher-1".to_string()),
            ..Default::default()
        };
        let h1 = mgr.subscribe("agent:spawned", noop_handler(), opts.clone());
        let h2 = mgr.subscribe("agent:spawned", noop_handler(), opts);
        assert_eq!(h1, h2);
        assert_eq!(mgr.listener_count("agent:spawned"), 1);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_listener() {
        let bus = EventBus::new();
        let mgr = SubscriptionManager::new(bus);
        let h1 = mgr.subscribe("agent:spawned", noop_handler(), SubscribeOptions::default());
        mgr.subscribe("agent:spawned", noop_handler(), SubscribeOptions::default());
        assert_eq!(mgr.listener_count("agent:spawned"), 2);
        mgr.unsubscribe(&h1);
        assert_eq!(mgr.listener_count("agent:spawned"), 1);
    }

    #[test]
    fn sweep_expired_removes_fired_once_subscriptions() {
        let bus = EventBus::new();
        let mgr = SubscriptionManager::new(bus);
        let opts = SubscribeOptions {
            once: true,
            ..Default::default()
        };
        let handle = mgr.subscribe("agent:spawned", noop_handler(), opts);
        mgr.mark_invoked(&handle);
        let removed = mgr.sweep_expired();
        assert_eq!(removed, vec![handle]);
        assert_eq!(mgr.listener_count("agent:spawned"), 0);
    }

    #[test]
    fn group_unsubscribe_removes_all_members() {
        let bus = EventBus::new();
        let mgr = SubscriptionManager::new(bus);
        let opts = SubscribeOptions {
            group_id: Some("g1".to_string()),
            ..Default::default()
        };
        mgr.subscribe("agent:spawned", noop_handler(), opts.clone());
        mgr.subscribe("agent:terminated", noop_handler(), opts);
        mgr.unsubscribe_group("g1");
        assert_eq!(mgr.listener_count("agent:spawned"), 0);
        assert_eq!(mgr.listener_count("agent:terminated"), 0);
    }

    #[test]
    fn group_unsubscribe_clears_dedup_index() {
        let bus = EventBus::new();
        let mgr = SubscriptionManager::new(bus);
        let opts = SubscribeOptions {
            group_id: Some("g1".to_string()),
            subscriber_id: Some("watcher-1".to_string()),
            ..Default::default()
        };
        mgr.subscribe("agent:spawned", noop_handler(), opts);
        assert_eq!(mgr.dedup_index.lock().len(), 1);
        mgr.unsubscribe_group("g1");
        assert_eq!(mgr.dedup_index.lock().len(), 0);
    }

    #[test]
    fn sweep_expired_clears_dedup_index_for_ttl_subscriptions() {
        let bus = EventBus::new();
        let mgr = SubscriptionManager::new(bus);
        let opts = SubscribeOptions {
            subscriber_id: Some("watcher-1".to_string()),
            ttl_ms: Some(0),
            ..Default::default()
        };
        mgr.subscribe("agent:spawned", noop_handler(), opts);
        assert_eq!(mgr.dedup_index.lock().len(), 1);
        mgr.sweep_expired();
        assert_eq!(mgr.dedup_index.lock().len(), 0);
    }
}
