/// State Updater (C11, §4.7): turns a parsed [`CompletionRecord`] into the single store
/// transaction that commits it, then fires the three follow-up events. The commit and the
/// event emission are deliberately separate steps — a handler that errors out never rolls
/// back the write that already landed.
use std::sync::Arc;
use tracing::warn;

use crate::errors::StoreResult;
use crate::event_bus::EventBus;
use crate::model::{Agent, StateTransitionRecord, TaskCompletion};
use crate::parser::completion::CompletionRecord;
use crate::store::Store;
use crate::topics;

pub struct StateUpdater {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
}

impl StateUpdater {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        StateUpdater { store, bus }
    }

    /// Commits `record` as a [`TaskCompletion`] and publishes the three completion events.
    /// The commit itself is atomic (see [`Store::commit_task_completion`]); event delivery
    /// failures are logged and otherwise ignored.
    pub async fn update_task_completion(
        &self,
        record: &CompletionRecord,
    ) -> StoreResult<(Agent, StateTransitionRecord)> {
        let completion = TaskCompletion {
            task_id: record.task_ref.clone(),
            agent_id: record.agent_id.clone(),
            status: record.status,
            completed_at: record.completion_timestamp,
            deliverables: record.deliverables.clone(),
            test_results: record.test_results.clone(),
            quality_gates: Some(record.quality_gates.clone()),
        };

        let (agent, transition) = self.store.commit_task_completion(&completion).await?;

        self.emit_completion_events(&completion, &agent, &transition)
            .await;

        Ok((agent, transition))
    }

    async fn emit_completion_events(
        &self,
        completion: &TaskCompletion,
        agent: &Agent,
        transition: &StateTransitionRecord,
    ) {
        let completion_payload = serde_json::to_value(completion)
            .unwrap_or_else(|_| serde_json::json!({"task_id": completion.task_id}));
        if let Err(e) = self
            .bus
            .publish(topics::TASK_COMPLETED_DB, completion_payload, None)
            .await
        {
            warn!(error = %e, topic = topics::TASK_COMPLETED_DB, "failed to publish completion event");
        }

        let agent_payload = serde_json::to_value(agent)
            .unwrap_or_else(|_| serde_json::json!({"id": agent.id}));
        if let Err(e) = self
            .bus
            .publish(topics::AGENT_STATE_UPDATED, agent_payload, None)
            .await
        {
            warn!(error = %e, topic = topics::AGENT_STATE_UPDATED, "failed to publish agent state event");
        }

        let transition_payload = serde_json::to_value(transition)
            .unwrap_or_else(|_| serde_json::json!({"id": transition.id}));
        if let Err(e) = self
            .bus
            .publish(topics::STATE_TRANSITION_RECORDED, transition_payload, None)
            .await
        {
            warn!(error = %e, topic = topics::STATE_TRANSITION_RECORDED, "failed to publish transition event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentMetadata, AgentStatus, AgentType, QualityGates, TaskStatus};
    use crate::store::SqliteStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn store_with_active_agent(agent_id: &str) -> Arc<dyn Store> {
        let store = SqliteStore::connect(":memory:").await.unwrap();
        let mut agent = Agent::new(agent_id, AgentType::Implementation, AgentMetadata::default());
        agent.status = AgentStatus::Active;
        agent.current_task = Some("1.1".to_string());
        store.upsert_agent(&agent).await.unwrap();
        Arc::new(store)
    }

    fn sample_record(agent_id: &str) -> CompletionRecord {
        CompletionRecord {
            task_ref: "1.1".to_string(),
            agent_id: agent_id.to_string(),
            status: TaskStatus::Completed,
            deliverables: vec!["src/lib.rs".to_string()],
            test_results: None,
            quality_gates: QualityGates::default(),
            completion_timestamp: Some(chrono::Utc::now()),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn update_task_completion_transitions_agent_and_emits_events() {
        let store = store_with_active_agent("agent-u1").await;
        let bus = EventBus::new();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        for topic in [
            topics::TASK_COMPLETED_DB,
            topics::AGENT_STATE_UPDATED,
            topics::STATE_TRANSITION_RECORDED,
        ] {
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

        let updater = StateUpdater::new(store.clone(), bus);
        let record = sample_record("agent-u1");
        let (agent, transition) = updater.update_task_completion(&record).await.unwrap();

        assert_eq!(agent.status, AgentStatus::Waiting);
        assert_eq!(transition.to_state, "waiting");

        let mut seen = Vec::new();
        while let Ok(Some(topic)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            seen.push(topic);
        }
        assert!(seen.contains(&topics::TASK_COMPLETED_DB.to_string()));
        assert!(seen.contains(&topics::AGENT_STATE_UPDATED.to_string()));
        assert!(seen.contains(&topics::STATE_TRANSITION_RECORDED.to_string()));
    }

    #[tokio::test]
    async fn update_task_completion_propagates_store_errors() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(":memory:").await.unwrap());
        let bus = EventBus::new();
        let updater = StateUpdater::new(store, bus);
        let record = sample_record("nonexistent-agent");
        let result = updater.update_task_completion(&record).await;
        assert!(result.is_err());
    }
}
