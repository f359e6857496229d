/// Recovery Manager (C13, §4.9): periodically scans Active/Waiting agents for a stale
/// heartbeat and terminates crashed ones, bounding retries per agent.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::errors::{RecoveryError, RecoveryResult};
use crate::event_bus::EventBus;
use crate::model::{AgentStatus, TransitionTrigger};
use crate::store::Store;
use crate::topics;

/// Aggregate counters exposed for introspection (§4.9's "tracks totalAttempts,
/// successfulRecoveries, success rate").
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStats {
    pub total_attempts: u64,
    pub successful_recoveries: u64,
}

impl RecoveryStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        self.successful_recoveries as f64 / self.total_attempts as f64
    }
}

struct Shared {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    config: Mutex<RecoveryConfig>,
    attempt_counts: Mutex<HashMap<String, u32>>,
    total_attempts: AtomicU64,
    successful_recoveries: AtomicU64,
}

pub struct RecoveryManager {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>, config: RecoveryConfig) -> Self {
        RecoveryManager {
            shared: Arc::new(Shared {
                store,
                bus,
                config: Mutex::new(config),
                attempt_counts: Mutex::new(HashMap::new()),
                total_attempts: AtomicU64::new(0),
                successful_recoveries: AtomicU64::new(0),
            }),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn set_config(&self, config: RecoveryConfig) {
        *self.shared.config.lock() = config;
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            total_attempts: self.shared.total_attempts.load(Ordering::Relaxed),
            successful_recoveries: self.shared.successful_recoveries.load(Ordering::Relaxed),
        }
    }

    /// Starts the periodic scan. Idempotent: a second call while already running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        let running = self.running.clone();
        let join = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let interval = {
                    let config = shared.config.lock();
                    std::time::Duration::from_secs(config.scan_interval_secs)
                };
                scan_once(&shared).await;
                tokio::time::sleep(interval).await;
            }
        });
        *self.handle.lock() = Some(join);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

async fn scan_once(shared: &Arc<Shared>) {
    let timeout_secs = shared.config.lock().stale_heartbeat_secs as i64;
    let max_attempts = shared.config.lock().max_recovery_attempts;

    let mut candidates = Vec::new();
    for status in [AgentStatus::Active, AgentStatus::Waiting] {
        match shared.store.list_agents_by_status(status).await {
            Ok(agents) => candidates.extend(agents),
            Err(e) => {
                warn!(error = %e, "recovery scan failed to list agents");
                return;
            }
        }
    }

    let now = chrono::Utc::now();
    for agent in candidates {
        let stale_for = now - agent.last_activity_at;
        if stale_for.num_seconds() <= timeout_secs {
            continue;
        }
        if let Err(e) = recover_agent(shared, &agent.id, max_attempts).await {
            warn!(agent_id = %agent.id, error = %e, "recovery attempt did not complete");
        }
    }
}

async fn recover_agent(shared: &Arc<Shared>, agent_id: &str, max_attempts: u32) -> RecoveryResult<()> {
    let attempt = {
        let mut counts = shared.attempt_counts.lock();
        let count = counts.entry(agent_id.to_string()).or_insert(0);
        *count += 1;
        *count
    };
    shared.total_attempts.fetch_add(1, Ordering::Relaxed);

    if attempt > max_attempts {
        warn!(agent_id, attempt, max_attempts, "max recovery attempts exceeded");
        return Err(RecoveryError::MaxAttemptsExceeded(agent_id.to_string()));
    }

    let agent = shared
        .store
        .transition_agent(
            agent_id,
            AgentStatus::Terminated,
            TransitionTrigger::Recovery,
            json!({ "reason": "stale heartbeat" }),
        )
        .await?;

    shared.attempt_counts.lock().insert(agent_id.to_string(), 0);
    shared.successful_recoveries.fetch_add(1, Ordering::Relaxed);
    info!(agent_id = %agent.id, "recovered crashed agent");

    let payload = json!({ "agent_id": agent.id, "reason": "stale heartbeat" });
    if let Err(e) = shared.bus.publish(topics::AGENT_STATE_UPDATED, payload, None).await {
        warn!(agent_id, error = %e, "failed to publish recovery event");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, AgentMetadata, AgentType};
    use crate::store::SqliteStore;

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            stale_heartbeat_secs: 0,
            scan_interval_secs: 3600,
            max_recovery_attempts: 2,
        }
    }

    #[tokio::test]
    async fn scan_once_terminates_stale_active_agent() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(":memory:").await.unwrap());
        let mut agent = Agent::new("agent-stale", AgentType::Implementation, AgentMetadata::default());
        agent.status = AgentStatus::Active;
        agent.last_activity_at = chrono::Utc::now() - chrono::Duration::seconds(1000);
        store.upsert_agent(&agent).await.unwrap();

        let manager = RecoveryManager::new(store.clone(), EventBus::new(), fast_config());
        scan_once(&manager.shared).await;

        let fetched = store.get_agent("agent-stale").await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Terminated);
        assert_eq!(manager.stats().successful_recoveries, 1);
    }

    #[tokio::test]
    async fn fresh_heartbeat_is_left_alone() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(":memory:").await.unwrap());
        let mut agent = Agent::new("agent-fresh", AgentType::Implementation, AgentMetadata::default());
        agent.status = AgentStatus::Active;
        store.upsert_agent(&agent).await.unwrap();

        let manager = RecoveryManager::new(
            store.clone(),
            EventBus::new(),
            RecoveryConfig {
                stale_heartbeat_secs: 3600,
                scan_interval_secs: 3600,
                max_recovery_attempts: 2,
            },
        );
        scan_once(&manager.shared).await;

        let fetched = store.get_agent("agent-fresh").await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(":memory:").await.unwrap());
        let manager = RecoveryManager::new(store, EventBus::new(), fast_config());
        manager.start();
        manager.start();
        assert!(manager.handle.lock().is_some());
        manager.stop();
    }
}
