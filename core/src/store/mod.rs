/// Transactional store (C1): persists agents, state transitions, task completions and
/// handoffs behind a small trait so tests can swap in an in-memory fixture.
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreResult;
use crate::model::{Agent, AgentStatus, Handoff, StateTransitionRecord, TaskCompletion};

pub use sqlite::SqliteStore;

/// Persistence boundary for everything in §3's data model.
///
/// Every mutating method is expected to run inside its own transaction; callers that need
/// several writes to commit atomically use [`Store::transaction`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a brand-new agent row and its creation transition `(null -> Spawning)` in one
    /// transaction (§4.8). Use [`Store::upsert_agent`] for plain row upserts that don't need
    /// a paired audit row (e.g. restoring a snapshot).
    async fn create_agent(&self, agent: &Agent) -> StoreResult<StateTransitionRecord>;

    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()>;
    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<Agent>>;
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;
    async fn list_agents_by_status(&self, status: AgentStatus) -> StoreResult<Vec<Agent>>;

    /// Validates `agent.status -> to` via [`AgentStatus::can_transition_to`] before writing,
    /// then appends a [`StateTransitionRecord`] in the same transaction.
    async fn transition_agent(
        &self,
        agent_id: &str,
        to: AgentStatus,
        trigger: crate::model::TransitionTrigger,
        metadata: serde_json::Value,
    ) -> StoreResult<Agent>;

    async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Atomically commits a task completion (§4.7's State Updater): upserts the completion
    /// row, transitions `completion.agent_id` to `Waiting`, and appends the paired transition
    /// record `(from=current, to=Waiting, trigger=Automatic)`, all in one transaction.
    async fn commit_task_completion(
        &self,
        completion: &TaskCompletion,
    ) -> StoreResult<(Agent, StateTransitionRecord)>;

    async fn upsert_task_completion(&self, completion: &TaskCompletion) -> StoreResult<()>;
    async fn get_task_completion(&self, task_id: &str) -> StoreResult<Option<TaskCompletion>>;
    async fn list_task_completions(&self) -> StoreResult<Vec<TaskCompletion>>;

    async fn list_transitions_for_entity(
        &self,
        entity_type: crate::model::EntityType,
        entity_id: &str,
    ) -> StoreResult<Vec<StateTransitionRecord>>;

    async fn upsert_handoff(&self, handoff: &Handoff) -> StoreResult<()>;
    async fn get_handoff(&self, handoff_id: &str) -> StoreResult<Option<Handoff>>;
    async fn list_handoffs_for_consumer(&self, consumer_task: &str) -> StoreResult<Vec<Handoff>>;
    async fn list_pending_handoffs(&self) -> StoreResult<Vec<Handoff>>;
}
