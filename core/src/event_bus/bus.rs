/// Event Bus (C2): an in-process publish/subscribe hub keyed on the topic grammar in
/// [`super::topic`]. Subscribers are stored in a `DashMap<String, Vec<Subscriber>>` rather
/// than a single global lock, so publish on one pattern bucket never blocks registration on
/// another.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, warn};

use super::envelope;
use super::topic::{matches, validate_pattern, validate_topic};
use crate::errors::{EventBusError, EventBusResult};
use crate::model::{DeliveryMode, Envelope, HandlerOutcome};
use crate::topics;

pub type Handler = Arc<dyn Fn(&Envelope) -> HandlerOutcome + Send + Sync>;

struct Subscriber {
    subscriber_id: String,
    pattern: String,
    mode: DeliveryMode,
    handler: Handler,
}

/// Aggregate counters exposed for introspection (§4.1).
#[derive(Debug, Default, Clone, Copy)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_errors: u64,
    pub cancelled: u64,
}

/// Constructed once by the daemon and shared via `Arc` across every component that
/// publishes or subscribes; there is deliberately no process-global singleton. Holds a
/// `Weak` reference to itself so the detached tasks spawned for Async/Parallel delivery can
/// re-enter `publish` to report bookkeeping events without needing the caller to pass an
/// `Arc<EventBus>` into every handler closure.
pub struct EventBus {
    subscribers: DashMap<String, Vec<Subscriber>>,
    published: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
    cancelled: AtomicU64,
    shut_down: AtomicBool,
    self_ref: Weak<EventBus>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| EventBus {
            subscribers: DashMap::new(),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// Registers a handler under `pattern`. `subscriber_id` is caller-supplied so that
    /// re-registering the same logical subscriber (e.g. after a reconnect) replaces rather
    /// than duplicates its entry — dedup is by identity, not by closure pointer.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        pattern: &str,
        mode: DeliveryMode,
        handler: Handler,
    ) -> EventBusResult<()> {
        validate_pattern(pattern)?;
        let subscriber_id = subscriber_id.into();
        let mut bucket = self.subscribers.entry(pattern.to_string()).or_default();
        bucket.retain(|s| s.subscriber_id != subscriber_id);
        bucket.push(Subscriber {
            subscriber_id,
            pattern: pattern.to_string(),
            mode,
            handler,
        });
        Ok(())
    }

    pub fn unsubscribe(&self, subscriber_id: &str, pattern: &str) {
        if let Some(mut bucket) = self.subscribers.get_mut(pattern) {
            bucket.retain(|s| s.subscriber_id != subscriber_id);
        }
    }

    /// Removes every subscription held by `subscriber_id` across all patterns. Intended as
    /// the leak-prevention hook: callers that forget to unsubscribe individually still get
    /// cleaned up when the owning component shuts down.
    pub fn unsubscribe_all(&self, subscriber_id: &str) {
        for mut bucket in self.subscribers.iter_mut() {
            bucket.retain(|s| s.subscriber_id != subscriber_id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|b| b.len()).sum()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    fn matching_subscribers(&self, topic: &str) -> Vec<(String, DeliveryMode, Handler)> {
        let mut out = Vec::new();
        for entry in self.subscribers.iter() {
            if matches(entry.key(), topic) {
                for sub in entry.value() {
                    out.push((sub.subscriber_id.clone(), sub.mode, sub.handler.clone()));
                }
            }
        }
        out
    }

    /// Publishes `topic`/`data`, injecting envelope metadata, and delivers to every matching
    /// subscriber per its own requested [`DeliveryMode`]. `Sync` subscribers are invoked
    /// inline and may cancel delivery to subsequent `Sync` subscribers (in registration
    /// order); `Async`/`Parallel` subscribers never block the publisher or each other.
    pub async fn publish(
        &self,
        topic: &str,
        data: serde_json::Value,
        publisher_id: Option<String>,
    ) -> EventBusResult<Envelope> {
        if self.shut_down.load(Ordering::SeqCst) {
            self.emit_bus_error("publish attempted on a bus that has shut down");
            return Err(EventBusError::ShutDown);
        }
        if let Err(e) = validate_topic(topic) {
            self.report_publish_error(topic, &e).await;
            return Err(e);
        }

        let envelope = envelope::build(topic, data, publisher_id);
        self.published.fetch_add(1, Ordering::Relaxed);

        let matching = self.matching_subscribers(topic);
        debug!(topic, count = matching.len(), "publishing event");

        let mut sync_handlers = Vec::new();
        let mut async_handlers = Vec::new();
        let mut parallel_handlers = Vec::new();
        for (id, mode, handler) in matching {
            match mode {
                DeliveryMode::Sync => sync_handlers.push((id, handler)),
                DeliveryMode::Async => async_handlers.push((id, handler)),
                DeliveryMode::Parallel => parallel_handlers.push((id, handler)),
            }
        }

        for (id, handler) in sync_handlers {
            let outcome = handler(&envelope);
            self.delivered.fetch_add(1, Ordering::Relaxed);
            if let Some(reason) = outcome.reason.clone() {
                warn!(subscriber = %id, reason = %reason, "sync handler reported an error");
                self.report_listener_error(&id, reason).await;
            }
            if outcome.cancel {
                debug!(subscriber = %id, reason = ?outcome.reason, "sync subscriber cancelled delivery");
                self.report_cancelled(&id, outcome.reason.clone()).await;
                return Ok(envelope);
            }
        }

        if !async_handlers.is_empty() {
            let env = envelope.clone();
            let weak = self.self_ref.clone();
            tokio::spawn(async move {
                let Some(bus) = weak.upgrade() else { return };
                for (id, handler) in async_handlers {
                    let outcome = handler(&env);
                    bus.delivered.fetch_add(1, Ordering::Relaxed);
                    if let Some(reason) = outcome.reason.clone() {
                        warn!(subscriber = %id, reason = %reason, "async handler reported an error");
                        bus.report_listener_error(&id, reason).await;
                    }
                    if outcome.cancel {
                        bus.report_cancelled(&id, outcome.reason.clone()).await;
                    }
                }
            });
        }

        if !parallel_handlers.is_empty() {
            for (id, handler) in parallel_handlers {
                let env = envelope.clone();
                let weak = self.self_ref.clone();
                tokio::spawn(async move {
                    let Some(bus) = weak.upgrade() else { return };
                    let outcome = handler(&env);
                    bus.delivered.fetch_add(1, Ordering::Relaxed);
                    if let Some(reason) = outcome.reason.clone() {
                        warn!(subscriber = %id, reason = %reason, "parallel handler reported an error");
                        bus.report_listener_error(&id, reason).await;
                    }
                    if outcome.cancel {
                        bus.report_cancelled(&id, outcome.reason.clone()).await;
                    }
                });
            }
        }

        Ok(envelope)
    }

    /// Reports a handler failure on `listener-error` (§4.1 Failure semantics, §7). Counted
    /// once per failing invocation, independent of delivery mode.
    async fn report_listener_error(&self, subscriber_id: &str, reason: String) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::json!({ "subscriber_id": subscriber_id, "reason": reason });
        if let Err(e) = self.publish(topics::LISTENER_ERROR, payload, None).await {
            warn!(error = %e, "failed to publish listener-error");
        }
    }

    /// Tallies a cancellation and emits the `event-cancelled` bookkeeping event (§4.1
    /// Cancellation: "In all modes ... total-cancelled counter is incremented").
    async fn report_cancelled(&self, subscriber_id: &str, reason: Option<String>) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::json!({ "subscriber_id": subscriber_id, "reason": reason });
        if let Err(e) = self.publish(topics::EVENT_CANCELLED, payload, None).await {
            warn!(error = %e, "failed to publish event-cancelled");
        }
    }

    /// Reports a malformed publish (bad topic grammar) on `publish-error`, then the caller
    /// still receives the original `Err` (§7: "reported on publish-error and re-thrown to
    /// the caller").
    async fn report_publish_error(&self, topic: &str, error: &EventBusError) {
        let payload = serde_json::json!({ "topic": topic, "error": error.to_string() });
        if let Err(e) = self.publish(topics::PUBLISH_ERROR, payload, None).await {
            warn!(error = %e, "failed to publish publish-error");
        }
    }

    /// Reports a bus-level invariant violation (currently: a publish attempted after
    /// `shutdown()`) on `bus-error`. Dispatches directly to matching subscribers rather than
    /// going through `publish` itself, since the bus is shut down and `publish` would reject
    /// the re-entrant call.
    fn emit_bus_error(&self, message: &str) {
        warn!(message, "bus-error");
        let envelope = envelope::build(
            topics::BUS_ERROR,
            serde_json::json!({ "message": message }),
            None,
        );
        for (_, _, handler) in self.matching_subscribers(topics::BUS_ERROR) {
            handler(&envelope);
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Per-subscriber view used by introspection/debugging callers.
pub fn subscriber_ids_by_pattern(bus: &EventBus) -> HashMap<String, Vec<String>> {
    bus.subscribers
        .iter()
        .map(|entry| {
            (
                entry.key().clone(),
                entry.value().iter().map(|s| s.subscriber_id.clone()).collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn sync_subscriber_can_cancel_further_sync_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(
            "first",
            "task:*",
            DeliveryMode::Sync,
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::cancel("stop")
            }),
        )
        .unwrap();
        let hits_clone2 = hits.clone();
        bus.subscribe(
            "second",
            "task:*",
            DeliveryMode::Sync,
            Arc::new(move |_| {
                hits_clone2.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::ok()
            }),
        )
        .unwrap();

        bus.publish("task:completed", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn sync_cancellation_emits_event_cancelled() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        bus.subscribe(
            topics::EVENT_CANCELLED,
            topics::EVENT_CANCELLED,
            DeliveryMode::Sync,
            Arc::new(move |envelope| {
                let _ = tx.send(
                    envelope.data.get("subscriber_id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                );
                HandlerOutcome::ok()
            }),
        )
        .unwrap();
        bus.subscribe(
            "canceller",
            "task:*",
            DeliveryMode::Sync,
            Arc::new(|_| HandlerOutcome::cancel("stop")),
        )
        .unwrap();

        bus.publish("task:completed", serde_json::json!({}), None)
            .await
            .unwrap();

        let seen = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, "canceller");
    }

    #[tokio::test]
    async fn async_handler_error_is_republished_on_listener_error() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        bus.subscribe(
            topics::LISTENER_ERROR,
            topics::LISTENER_ERROR,
            DeliveryMode::Sync,
            Arc::new(move |envelope| {
                let _ = tx.send(
                    envelope.data.get("reason").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                );
                HandlerOutcome::ok()
            }),
        )
        .unwrap();
        bus.subscribe(
            "failing",
            "task:*",
            DeliveryMode::Async,
            Arc::new(|_| HandlerOutcome::error("boom")),
        )
        .unwrap();

        bus.publish("task:completed", serde_json::json!({}), None)
            .await
            .unwrap();

        let seen = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, "boom");
        assert_eq!(bus.stats().handler_errors, 1);
    }

    #[tokio::test]
    async fn wildcard_pattern_receives_matching_topics() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(
            "watcher",
            "agent:**",
            DeliveryMode::Sync,
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                HandlerOutcome::ok()
            }),
        )
        .unwrap();

        bus.publish("agent:1:spawned", serde_json::json!({}), None)
            .await
            .unwrap();
        bus.publish("task:1:spawned", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_every_pattern_for_subscriber() {
        let bus = EventBus::new();
        bus.subscribe("a", "x:*", DeliveryMode::Sync, Arc::new(|_| HandlerOutcome::ok()))
            .unwrap();
        bus.subscribe("a", "y:*", DeliveryMode::Sync, Arc::new(|_| HandlerOutcome::ok()))
            .unwrap();
        assert_eq!(bus.subscriber_count(), 2);
        bus.unsubscribe_all("a");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_rejected() {
        let bus = EventBus::new();
        bus.shutdown();
        let result = bus.publish("a.b", serde_json::json!({}), None).await;
        assert!(matches!(result, Err(EventBusError::ShutDown)));
    }

    #[tokio::test]
    async fn malformed_publish_is_reported_and_rethrown() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        bus.subscribe(
            topics::PUBLISH_ERROR,
            topics::PUBLISH_ERROR,
            DeliveryMode::Sync,
            Arc::new(move |envelope| {
                let _ = tx.send(
                    envelope.data.get("topic").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                );
                HandlerOutcome::ok()
            }),
        )
        .unwrap();

        let result = bus.publish("bad topic!", serde_json::json!({}), None).await;
        assert!(result.is_err());

        let seen = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, "bad topic!");
    }
}
