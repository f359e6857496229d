/// Agent Lifecycle & Persistence (C12, §4.8): the state machine itself lives in
/// [`crate::model::AgentStatus`] and its storage in [`crate::store`]; this module is the
/// higher-level API a caller spawns/heartbeats/inspects agents through, plus the statistics
/// derived from the transition log.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::StoreResult;
use crate::model::{
    Agent, AgentMetadata, AgentStatus, AgentType, EntityType, StateTransitionRecord,
    TransitionTrigger,
};
use crate::store::Store;

/// Time spent in each status plus derived totals, computed from one entity's transition log
/// (§4.8's "Statistics" paragraph).
#[derive(Debug, Clone, Default)]
pub struct AgentStatistics {
    pub time_in_status: HashMap<AgentStatus, chrono::Duration>,
    pub transitions_by_trigger: HashMap<TransitionTrigger, usize>,
    pub lifetime: chrono::Duration,
    pub visits_per_status: HashMap<AgentStatus, usize>,
}

impl AgentStatistics {
    /// Average time spent per distinct status visited (zero visits excluded from the
    /// denominator, matching "average per state visited" rather than per calendar status).
    pub fn average_per_status(&self) -> HashMap<AgentStatus, chrono::Duration> {
        self.time_in_status
            .iter()
            .filter_map(|(status, total)| {
                let visits = *self.visits_per_status.get(status)?;
                if visits == 0 {
                    return None;
                }
                Some((*status, chrono::Duration::milliseconds(total.num_milliseconds() / visits as i64)))
            })
            .collect()
    }
}

pub struct AgentLifecycle {
    store: Arc<dyn Store>,
}

impl AgentLifecycle {
    pub fn new(store: Arc<dyn Store>) -> Self {
        AgentLifecycle { store }
    }

    /// Inserts the agent row and records the initial `(null -> Spawning)` transition in one
    /// transaction (§4.8).
    pub async fn spawn(
        &self,
        id: impl Into<String>,
        agent_type: AgentType,
        metadata: AgentMetadata,
    ) -> StoreResult<Agent> {
        let agent = Agent::new(id, agent_type, metadata);
        self.store.create_agent(&agent).await?;
        Ok(agent)
    }

    pub async fn transition(
        &self,
        agent_id: &str,
        to: AgentStatus,
        trigger: TransitionTrigger,
        metadata: serde_json::Value,
    ) -> StoreResult<Agent> {
        self.store.transition_agent(agent_id, to, trigger, metadata).await
    }

    /// `updateHeartbeat` (§4.8): bumps `lastActivityAt` without recording a transition.
    pub async fn heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.store.record_heartbeat(agent_id, at).await
    }

    pub async fn get(&self, agent_id: &str) -> StoreResult<Option<Agent>> {
        self.store.get_agent(agent_id).await
    }

    pub async fn list(&self) -> StoreResult<Vec<Agent>> {
        self.store.list_agents().await
    }

    pub async fn list_by_status(&self, status: AgentStatus) -> StoreResult<Vec<Agent>> {
        self.store.list_agents_by_status(status).await
    }

    /// Computes [`AgentStatistics`] from the transition log for one agent, using
    /// last-transition-wins interval math with `now` as the open interval's right endpoint.
    pub async fn statistics(&self, agent_id: &str) -> StoreResult<AgentStatistics> {
        let transitions = self
            .store
            .list_transitions_for_entity(EntityType::Agent, agent_id)
            .await?;
        Ok(compute_statistics(&transitions, Utc::now()))
    }
}

fn compute_statistics(
    transitions: &[StateTransitionRecord],
    now: DateTime<Utc>,
) -> AgentStatistics {
    let mut stats = AgentStatistics::default();
    if transitions.is_empty() {
        return stats;
    }

    let first_timestamp = transitions[0].timestamp;
    stats.lifetime = now - first_timestamp;

    for window in transitions.windows(2) {
        let [current, next] = window else { continue };
        if let Ok(status) = current.to_state.parse::<AgentStatus>() {
            let span = next.timestamp - current.timestamp;
            let entry = stats.time_in_status.entry(status).or_insert_with(chrono::Duration::zero);
            *entry = *entry + span;
            *stats.visits_per_status.entry(status).or_insert(0) += 1;
        }
    }

    if let Some(last) = transitions.last() {
        if let Ok(status) = last.to_state.parse::<AgentStatus>() {
            let span = now - last.timestamp;
            let entry = stats.time_in_status.entry(status).or_insert_with(chrono::Duration::zero);
            *entry = *entry + span;
            *stats.visits_per_status.entry(status).or_insert(0) += 1;
        }
    }

    for transition in transitions {
        *stats.transitions_by_trigger.entry(transition.trigger).or_insert(0) += 1;
    }

    stats
}
