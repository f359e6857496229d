/// Cross-Agent Coordinator (C15, §4.10): owns the handoff table in memory and an ordered
/// event log for introspection. Handoffs are strictly monotone (Pending -> Ready ->
/// Completed); this module is the sole writer of that progression.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::warn;

use crate::errors::{CoordinatorError, CoordinatorResult};
use crate::event_bus::EventBus;
use crate::model::{Handoff, HandoffStatus};
use crate::topics;

/// A dependency edge as reported by the external dependency-tracker client (§4.10's
/// "Inputs"): `{consumerTask, consumerAgent, producerTask, producerAgent}`.
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub consumer_task: String,
    pub consumer_agent: String,
    pub producer_task: String,
    pub producer_agent: String,
}

/// One entry in the coordinator's introspection log, most-recent first.
#[derive(Debug, Clone)]
pub struct CoordinatorEvent {
    pub topic: &'static str,
    pub handoff_id: String,
    pub at: chrono::DateTime<Utc>,
}

struct State {
    handoffs: HashMap<String, Handoff>,
    completed_outputs: HashSet<String>,
    log: Vec<CoordinatorEvent>,
}

pub struct Coordinator {
    state: Mutex<State>,
    bus: Arc<EventBus>,
}

impl Coordinator {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Coordinator {
            state: Mutex::new(State {
                handoffs: HashMap::new(),
                completed_outputs: HashSet::new(),
                log: Vec::new(),
            }),
            bus,
        }
    }

    /// Materializes `dependencies` as handoffs. A handoff whose producer is already in
    /// `completed_set` starts Ready rather than Pending; handoffs whose consumer is already
    /// completed are skipped entirely (there is nothing left for them to unblock).
    pub fn initialize(&self, dependencies: &[DependencyEdge], completed_set: &HashSet<String>) {
        let mut state = self.state.lock();
        state.completed_outputs.extend(completed_set.iter().cloned());
        for edge in dependencies {
            if completed_set.contains(&edge.consumer_task) {
                continue;
            }
            let handoff_id = Handoff::id_for(&edge.producer_task, &edge.consumer_task);
            let mut handoff = Handoff::new_pending(
                edge.consumer_task.as_str(),
                edge.consumer_agent.as_str(),
                edge.producer_task.as_str(),
                edge.producer_agent.as_str(),
            );
            if completed_set.contains(&edge.producer_task) {
                handoff.status = HandoffStatus::Ready;
                handoff.ready_at = Some(Utc::now());
            }
            state.handoffs.insert(handoff_id, handoff);
        }
    }

    /// Inserts one handoff. If the producer output is already known-complete, it is created
    /// directly in Ready rather than Pending. Fails if the handoff id already exists.
    pub async fn create_handoff(
        &self,
        consumer_task: impl Into<String>,
        consumer_agent: impl Into<String>,
        producer_task: impl Into<String>,
        producer_agent: impl Into<String>,
    ) -> CoordinatorResult<Handoff> {
        let consumer_task = consumer_task.into();
        let producer_task = producer_task.into();
        let handoff_id = Handoff::id_for(&producer_task, &consumer_task);

        let handoff = {
            let mut state = self.state.lock();
            if state.handoffs.contains_key(&handoff_id) {
                return Err(CoordinatorError::AlreadyExists(handoff_id));
            }
            let mut handoff = Handoff::new_pending(
                consumer_task,
                consumer_agent,
                producer_task.clone(),
                producer_agent,
            );
            if state.completed_outputs.contains(&producer_task) {
                handoff.status = HandoffStatus::Ready;
                handoff.ready_at = Some(Utc::now());
            }
            state.handoffs.insert(handoff.handoff_id.clone(), handoff.clone());
            state
                .log
                .insert(0, CoordinatorEvent { topic: topics::HANDOFF_CREATED, handoff_id: handoff.handoff_id.clone(), at: Utc::now() });
            handoff
        };

        self.publish(topics::HANDOFF_CREATED, &handoff).await;
        Ok(handoff)
    }

    /// Records `producer_task` as produced and promotes every Pending handoff whose producer
    /// is this task to Ready, emitting `handoff-ready` and `task-unblocked` for each.
    pub async fn mark_task_completed(&self, producer_task: &str, _producer_agent: &str) {
        let promoted: Vec<Handoff> = {
            let mut state = self.state.lock();
            state.completed_outputs.insert(producer_task.to_string());
            let now = Utc::now();
            let mut promoted = Vec::new();
            for handoff in state.handoffs.values_mut() {
                if handoff.producer_task == producer_task && handoff.status == HandoffStatus::Pending {
                    handoff.status = HandoffStatus::Ready;
                    handoff.ready_at = Some(now);
                    promoted.push(handoff.clone());
                }
            }
            for handoff in &promoted {
                state.log.insert(
                    0,
                    CoordinatorEvent { topic: topics::HANDOFF_READY, handoff_id: handoff.handoff_id.clone(), at: now },
                );
            }
            promoted
        };

        for handoff in &promoted {
            self.publish(topics::HANDOFF_READY, handoff).await;
            if self.can_task_proceed(&handoff.consumer_task) {
                let payload = json!({ "consumer_task": handoff.consumer_task });
                if let Err(e) = self.bus.publish(topics::TASK_UNBLOCKED, payload, None).await {
                    warn!(error = %e, "failed to publish task-unblocked event");
                }
            }
        }
    }

    /// Transitions Ready -> Completed. Fails for a non-existent or non-Ready handoff.
    pub async fn complete_handoff(&self, handoff_id: &str) -> CoordinatorResult<Handoff> {
        let handoff = {
            let mut state = self.state.lock();
            let handoff = state
                .handoffs
                .get_mut(handoff_id)
                .ok_or_else(|| CoordinatorError::NotFound(handoff_id.to_string()))?;
            if handoff.status != HandoffStatus::Ready {
                return Err(CoordinatorError::NotReady(handoff_id.to_string()));
            }
            handoff.status = HandoffStatus::Completed;
            handoff.completed_at = Some(Utc::now());
            let result = handoff.clone();
            state.log.insert(
                0,
                CoordinatorEvent { topic: topics::HANDOFF_COMPLETED, handoff_id: handoff_id.to_string(), at: Utc::now() },
            );
            result
        };

        self.publish(topics::HANDOFF_COMPLETED, &handoff).await;
        Ok(handoff)
    }

    /// True iff no handoff with `consumer_task = T` is Pending (Ready and Completed satisfy).
    pub fn can_task_proceed(&self, consumer_task: &str) -> bool {
        let state = self.state.lock();
        !state
            .handoffs
            .values()
            .any(|h| h.consumer_task == consumer_task && h.status == HandoffStatus::Pending)
    }

    /// Consumer tasks belonging to `agent` that still have at least one Pending handoff.
    pub fn blocked_tasks(&self, agent: &str) -> HashSet<String> {
        let state = self.state.lock();
        state
            .handoffs
            .values()
            .filter(|h| h.consumer_agent == agent && h.status == HandoffStatus::Pending)
            .map(|h| h.consumer_task.clone())
            .collect()
    }

    pub fn recent_events(&self, count: usize) -> Vec<CoordinatorEvent> {
        let state = self.state.lock();
        state.log.iter().take(count).cloned().collect()
    }

    async fn publish(&self, topic: &'static str, handoff: &Handoff) {
        let payload = serde_json::to_value(handoff)
            .unwrap_or_else(|_| json!({ "handoff_id": handoff.handoff_id }));
        if let Err(e) = self.bus.publish(topic, payload, None).await {
            warn!(topic, error = %e, "failed to publish coordinator event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn edge(consumer: &str, consumer_agent: &str, producer: &str, producer_agent: &str) -> DependencyEdge {
        DependencyEdge {
            consumer_task: consumer.to_string(),
            consumer_agent: consumer_agent.to_string(),
            producer_task: producer.to_string(),
            producer_agent: producer_agent.to_string(),
        }
    }

    #[tokio::test]
    async fn completion_driven_handoff_unblocks_consumer() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        for topic in [topics::HANDOFF_READY, topics::TASK_UNBLOCKED] {
            let tx = tx.clone();
            let topic_owned = topic.to_string();
            bus.subscribe(
                format!("watch-{topic}"),
                topic,
                crate::model::DeliveryMode::Sync,
                Arc::new(move |_| {
                    let _ = tx.send(topic_owned.clone());
                    crate::model::HandlerOutcome::ok()
                }),
            )
            .unwrap();
        }
        drop(tx);

        let coordinator = Coordinator::new(bus);
        coordinator
            .create_handoff("2.1", "agent-b", "1.1", "agent-a")
            .await
            .unwrap();

        assert!(!coordinator.can_task_proceed("2.1"));
        coordinator.mark_task_completed("1.1", "agent-a").await;
        assert!(coordinator.can_task_proceed("2.1"));

        let mut seen = Vec::new();
        while let Ok(Some(topic)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            seen.push(topic);
        }
        assert_eq!(seen, vec![topics::HANDOFF_READY.to_string(), topics::TASK_UNBLOCKED.to_string()]);
    }

    #[tokio::test]
    async fn initialize_promotes_handoffs_whose_producer_is_already_complete() {
        let coordinator = Coordinator::new(EventBus::new());
        let completed: HashSet<String> = ["1.1".to_string()].into_iter().collect();
        coordinator.initialize(&[edge("2.1", "agent-b", "1.1", "agent-a")], &completed);
        assert!(coordinator.can_task_proceed("2.1"));
    }

    #[tokio::test]
    async fn complete_handoff_requires_ready_state() {
        let coordinator = Coordinator::new(EventBus::new());
        let handoff = coordinator
            .create_handoff("2.1", "agent-b", "1.1", "agent-a")
            .await
            .unwrap();
        let result = coordinator.complete_handoff(&handoff.handoff_id).await;
        assert!(matches!(result, Err(CoordinatorError::NotReady(_))));

        coordinator.mark_task_completed("1.1", "agent-a").await;
        let completed = coordinator.complete_handoff(&handoff.handoff_id).await.unwrap();
        assert_eq!(completed.status, HandoffStatus::Completed);
    }

    #[tokio::test]
    async fn blocked_tasks_lists_pending_consumers_for_agent() {
        let coordinator = Coordinator::new(EventBus::new());
        coordinator
            .create_handoff("2.1", "agent-b", "1.1", "agent-a")
            .await
            .unwrap();
        coordinator
            .create_handoff("2.2", "agent-b", "1.2", "agent-a")
            .await
            .unwrap();
        let blocked = coordinator.blocked_tasks("agent-b");
        assert_eq!(blocked.len(), 2);
        coordinator.mark_task_completed("1.1", "agent-a").await;
        let blocked = coordinator.blocked_tasks("agent-b");
        assert_eq!(blocked.len(), 1);
        assert!(blocked.contains("2.2"));
    }
}
