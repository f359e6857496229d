/// SQLite-backed implementation of [`Store`], grounded in the same connection-pool and
/// migration-bookkeeping shape used throughout the rest of the crate: a pooled connection
/// with WAL-friendly pragmas, a versioned migrations table, and a short-lived advisory lock
/// row guarding against two processes racing to apply migrations.
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::Store;
use crate::errors::{StoreError, StoreResult};
use crate::model::{
    Agent, AgentMetadata, AgentStatus, AgentType, EntityType, Handoff, HandoffStatus,
    StateTransitionRecord, TaskCompletion, TaskStatus, TestResults, TransitionTrigger,
};

/// One `(version, description, sql)` triple per schema change, applied in order.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "initial schema",
    r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        description TEXT NOT NULL,
        checksum TEXT NOT NULL,
        applied_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS migration_lock (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        locked_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        agent_type TEXT NOT NULL,
        status TEXT NOT NULL,
        current_task TEXT,
        spawned_at TEXT NOT NULL,
        last_activity_at TEXT NOT NULL,
        metadata TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents (status);

    CREATE TABLE IF NOT EXISTS state_transitions (
        id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        from_state TEXT,
        to_state TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        trigger TEXT NOT NULL,
        metadata TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transitions_entity
        ON state_transitions (entity_type, entity_id, timestamp);

    CREATE TABLE IF NOT EXISTS task_completions (
        task_id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        status TEXT NOT NULL,
        completed_at TEXT,
        deliverables TEXT NOT NULL,
        test_results TEXT,
        quality_gates TEXT
    );

    CREATE TABLE IF NOT EXISTS handoffs (
        handoff_id TEXT PRIMARY KEY,
        consumer_task TEXT NOT NULL,
        consumer_agent TEXT NOT NULL,
        producer_task TEXT NOT NULL,
        producer_agent TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        ready_at TEXT,
        completed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_handoffs_consumer ON handoffs (consumer_task);
    CREATE INDEX IF NOT EXISTS idx_handoffs_pending ON handoffs (status) WHERE status != 'completed';
    "#,
)];

const STALE_LOCK_SECS: i64 = 300;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_path: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_path)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let store = SqliteStore { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY, description TEXT NOT NULL,
                checksum TEXT NOT NULL, applied_at TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS migration_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1), locked_at TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        self.acquire_migration_lock().await?;
        let result = self.apply_pending_migrations().await;
        self.release_migration_lock().await?;
        result
    }

    async fn acquire_migration_lock(&self) -> StoreResult<()> {
        loop {
            let existing = sqlx::query("SELECT locked_at FROM migration_lock WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;

            if let Some(row) = existing {
                let locked_at: String = row.get("locked_at");
                let locked_at = DateTime::parse_from_rfc3339(&locked_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                if (Utc::now() - locked_at).num_seconds() < STALE_LOCK_SECS {
                    return Err(StoreError::Migration(
                        "migration lock held by another process".to_string(),
                    ));
                }
                sqlx::query("DELETE FROM migration_lock WHERE id = 1")
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Migration(e.to_string()))?;
            }

            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO migration_lock (id, locked_at) VALUES (1, ?)",
            )
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

            if inserted.rows_affected() == 1 {
                return Ok(());
            }
        }
    }

    async fn release_migration_lock(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM migration_lock WHERE id = 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Recomputes the checksum of every migration already recorded in `schema_migrations`
    /// and aborts startup if a stored migration's SQL no longer matches what was applied —
    /// an applied-then-modified migration is an invariant violation, not something to
    /// silently re-run or ignore.
    async fn verify_applied_migrations(&self) -> StoreResult<()> {
        let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        for row in rows {
            let version: i64 = row.get("version");
            let stored_checksum: String = row.get("checksum");
            let Some((_, _, sql)) = MIGRATIONS.iter().find(|(v, _, _)| *v == version) else {
                continue;
            };
            let recomputed = format!("{:x}", Sha256::digest(sql.as_bytes()));
            if recomputed != stored_checksum {
                return Err(StoreError::Migration(format!(
                    "checksum mismatch for applied migration {version}: expected {stored_checksum}, recomputed {recomputed}"
                )));
            }
        }
        Ok(())
    }

    async fn apply_pending_migrations(&self) -> StoreResult<()> {
        self.verify_applied_migrations().await?;

        let max_version: Option<i64> =
            sqlx::query("SELECT MAX(version) as v FROM schema_migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?
                .get("v");
        let current = max_version.unwrap_or(0);

        for (version, description, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let checksum = format!("{:x}", Sha256::digest(sql.as_bytes()));
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;
            sqlx::query(
                "INSERT INTO schema_migrations (version, description, checksum, applied_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(version)
            .bind(*description)
            .bind(&checksum)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
            tx.commit()
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Agent> {
        let status_str: String = row.get("status");
        let type_str: String = row.get("agent_type");
        let metadata_str: String = row.get("metadata");
        Ok(Agent {
            id: row.get("id"),
            agent_type: match type_str.as_str() {
                "manager" => AgentType::Manager,
                "implementation" => AgentType::Implementation,
                _ => AgentType::AdHoc,
            },
            status: status_str
                .parse()
                .map_err(|e: String| StoreError::Database(e))?,
            current_task: row.get("current_task"),
            spawned_at: parse_ts(row.get("spawned_at"))?,
            last_activity_at: parse_ts(row.get("last_activity_at"))?,
            metadata: serde_json::from_str::<AgentMetadata>(&metadata_str)?,
        })
    }

    fn row_to_handoff(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Handoff> {
        let status_str: String = row.get("status");
        Ok(Handoff {
            handoff_id: row.get("handoff_id"),
            consumer_task: row.get("consumer_task"),
            consumer_agent: row.get("consumer_agent"),
            producer_task: row.get("producer_task"),
            producer_agent: row.get("producer_agent"),
            status: match status_str.as_str() {
                "pending" => HandoffStatus::Pending,
                "ready" => HandoffStatus::Ready,
                _ => HandoffStatus::Completed,
            },
            created_at: parse_ts(row.get("created_at"))?,
            ready_at: row
                .get::<Option<String>, _>("ready_at")
                .map(|s| parse_ts(s))
                .transpose()?,
            completed_at: row
                .get::<Option<String>, _>("completed_at")
                .map(|s| parse_ts(s))
                .transpose()?,
        })
    }
}

fn parse_ts(raw: String) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("bad timestamp {raw}: {e}")))
}

fn agent_type_str(t: AgentType) -> &'static str {
    match t {
        AgentType::Manager => "manager",
        AgentType::Implementation => "implementation",
        AgentType::AdHoc => "ad_hoc",
    }
}

fn handoff_status_str(s: HandoffStatus) -> &'static str {
    match s {
        HandoffStatus::Pending => "pending",
        HandoffStatus::Ready => "ready",
        HandoffStatus::Completed => "completed",
    }
}

fn trigger_str(t: TransitionTrigger) -> &'static str {
    match t {
        TransitionTrigger::UserAction => "user_action",
        TransitionTrigger::Automatic => "automatic",
        TransitionTrigger::Timeout => "timeout",
        TransitionTrigger::Error => "error",
        TransitionTrigger::Dependency => "dependency",
        TransitionTrigger::Recovery => "recovery",
    }
}

fn entity_type_str(t: EntityType) -> &'static str {
    match t {
        EntityType::Agent => "agent",
        EntityType::Task => "task",
        EntityType::Session => "session",
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_agent(&self, agent: &Agent) -> StoreResult<StateTransitionRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let metadata = serde_json::to_string(&agent.metadata)?;
        sqlx::query(
            "INSERT INTO agents (id, agent_type, status, current_task, spawned_at, last_activity_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&agent.id)
        .bind(agent_type_str(agent.agent_type))
        .bind(agent.status.to_string())
        .bind(&agent.current_task)
        .bind(agent.spawned_at.to_rfc3339())
        .bind(agent.last_activity_at.to_rfc3339())
        .bind(metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let transition_id = uuid::Uuid::new_v4().to_string();
        let transition_metadata = serde_json::json!({ "reason": "Agent spawned" });
        sqlx::query(
            "INSERT INTO state_transitions (id, entity_type, entity_id, from_state, to_state, timestamp, trigger, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition_id)
        .bind(entity_type_str(EntityType::Agent))
        .bind(&agent.id)
        .bind(None::<String>)
        .bind(agent.status.to_string())
        .bind(agent.spawned_at.to_rfc3339())
        .bind(trigger_str(TransitionTrigger::Automatic))
        .bind(transition_metadata.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(StateTransitionRecord {
            id: transition_id,
            entity_type: EntityType::Agent,
            entity_id: agent.id.clone(),
            from_state: None,
            to_state: agent.status.to_string(),
            timestamp: agent.spawned_at,
            trigger: TransitionTrigger::Automatic,
            metadata: transition_metadata,
        })
    }

    async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()> {
        let metadata = serde_json::to_string(&agent.metadata)?;
        sqlx::query(
            "INSERT INTO agents (id, agent_type, status, current_task, spawned_at, last_activity_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                current_task = excluded.current_task,
                last_activity_at = excluded.last_activity_at,
                metadata = excluded.metadata",
        )
        .bind(&agent.id)
        .bind(agent_type_str(agent.agent_type))
        .bind(agent.status.to_string())
        .bind(&agent.current_task)
        .bind(agent.spawned_at.to_rfc3339())
        .bind(agent.last_activity_at.to_rfc3339())
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        row.map(|r| Self::row_to_agent(&r)).transpose()
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY spawned_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn list_agents_by_status(&self, status: AgentStatus) -> StoreResult<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE status = ? ORDER BY spawned_at")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn transition_agent(
        &self,
        agent_id: &str,
        to: AgentStatus,
        trigger: TransitionTrigger,
        metadata: serde_json::Value,
    ) -> StoreResult<Agent> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(agent_id.to_string()))?;
        let current = Self::row_to_agent(&row)?;

        if !current.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: current.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let current_task = if to.requires_no_current_task() {
            None
        } else {
            current.current_task.clone()
        };

        sqlx::query(
            "UPDATE agents SET status = ?, current_task = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(to.to_string())
        .bind(&current_task)
        .bind(now.to_rfc3339())
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO state_transitions (id, entity_type, entity_id, from_state, to_state, timestamp, trigger, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(entity_type_str(EntityType::Agent))
        .bind(agent_id)
        .bind(current.status.to_string())
        .bind(to.to_string())
        .bind(now.to_rfc3339())
        .bind(trigger_str(trigger))
        .bind(metadata.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Agent {
            status: to,
            current_task,
            last_activity_at: now,
            ..current
        })
    }

    async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET last_activity_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(agent_id.to_string()));
        }
        Ok(())
    }

    async fn commit_task_completion(
        &self,
        completion: &TaskCompletion,
    ) -> StoreResult<(Agent, StateTransitionRecord)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(&completion.agent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(completion.agent_id.clone()))?;
        let current = Self::row_to_agent(&row)?;

        if !current.status.can_transition_to(AgentStatus::Waiting) {
            return Err(StoreError::InvalidTransition {
                from: current.status.to_string(),
                to: AgentStatus::Waiting.to_string(),
            });
        }

        let deliverables = serde_json::to_string(&completion.deliverables)?;
        let test_results = completion
            .test_results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let quality_gates = completion
            .quality_gates
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO task_completions (task_id, agent_id, status, completed_at, deliverables, test_results, quality_gates)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                deliverables = excluded.deliverables,
                test_results = excluded.test_results,
                quality_gates = excluded.quality_gates",
        )
        .bind(&completion.task_id)
        .bind(&completion.agent_id)
        .bind(status_str(completion.status))
        .bind(completion.completed_at.map(|t| t.to_rfc3339()))
        .bind(deliverables)
        .bind(test_results)
        .bind(quality_gates)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let now = Utc::now();
        sqlx::query(
            "UPDATE agents SET status = ?, current_task = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(AgentStatus::Waiting.to_string())
        .bind(None::<String>)
        .bind(now.to_rfc3339())
        .bind(&completion.agent_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let transition_id = uuid::Uuid::new_v4().to_string();
        let transition_metadata = serde_json::json!({
            "reason": "Task completion",
            "task_id": completion.task_id,
        });
        sqlx::query(
            "INSERT INTO state_transitions (id, entity_type, entity_id, from_state, to_state, timestamp, trigger, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition_id)
        .bind(entity_type_str(EntityType::Agent))
        .bind(&completion.agent_id)
        .bind(current.status.to_string())
        .bind(AgentStatus::Waiting.to_string())
        .bind(now.to_rfc3339())
        .bind(trigger_str(TransitionTrigger::Automatic))
        .bind(transition_metadata.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let updated_agent = Agent {
            status: AgentStatus::Waiting,
            current_task: None,
            last_activity_at: now,
            ..current.clone()
        };
        let transition = StateTransitionRecord {
            id: transition_id,
            entity_type: EntityType::Agent,
            entity_id: completion.agent_id.clone(),
            from_state: Some(current.status.to_string()),
            to_state: AgentStatus::Waiting.to_string(),
            timestamp: now,
            trigger: TransitionTrigger::Automatic,
            metadata: transition_metadata,
        };

        Ok((updated_agent, transition))
    }

    async fn upsert_task_completion(&self, completion: &TaskCompletion) -> StoreResult<()> {
        let deliverables = serde_json::to_string(&completion.deliverables)?;
        let test_results = completion
            .test_results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let quality_gates = completion
            .quality_gates
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO task_completions (task_id, agent_id, status, completed_at, deliverables, test_results, quality_gates)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                deliverables = excluded.deliverables,
                test_results = excluded.test_results,
                quality_gates = excluded.quality_gates",
        )
        .bind(&completion.task_id)
        .bind(&completion.agent_id)
        .bind(status_str(completion.status))
        .bind(completion.completed_at.map(|t| t.to_rfc3339()))
        .bind(deliverables)
        .bind(test_results)
        .bind(quality_gates)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_task_completion(&self, task_id: &str) -> StoreResult<Option<TaskCompletion>> {
        let row = sqlx::query("SELECT * FROM task_completions WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        row.map(|r| row_to_completion(&r)).transpose()
    }

    async fn list_task_completions(&self) -> StoreResult<Vec<TaskCompletion>> {
        let rows = sqlx::query("SELECT * FROM task_completions")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_completion).collect()
    }

    async fn list_transitions_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StoreResult<Vec<StateTransitionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM state_transitions WHERE entity_type = ? AND entity_id = ? ORDER BY timestamp",
        )
        .bind(entity_type_str(entity_type))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(StateTransitionRecord {
                    id: row.get("id"),
                    entity_type,
                    entity_id: row.get("entity_id"),
                    from_state: row.get("from_state"),
                    to_state: row.get("to_state"),
                    timestamp: parse_ts(row.get("timestamp"))?,
                    trigger: match row.get::<String, _>("trigger").as_str() {
                        "user_action" => TransitionTrigger::UserAction,
                        "timeout" => TransitionTrigger::Timeout,
                        "error" => TransitionTrigger::Error,
                        "dependency" => TransitionTrigger::Dependency,
                        "recovery" => TransitionTrigger::Recovery,
                        _ => TransitionTrigger::Automatic,
                    },
                    metadata: serde_json::from_str(&row.get::<String, _>("metadata"))
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }

    async fn upsert_handoff(&self, handoff: &Handoff) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO handoffs (handoff_id, consumer_task, consumer_agent, producer_task, producer_agent, status, created_at, ready_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(handoff_id) DO UPDATE SET
                status = excluded.status,
                ready_at = excluded.ready_at,
                completed_at = excluded.completed_at",
        )
        .bind(&handoff.handoff_id)
        .bind(&handoff.consumer_task)
        .bind(&handoff.consumer_agent)
        .bind(&handoff.producer_task)
        .bind(&handoff.producer_agent)
        .bind(handoff_status_str(handoff.status))
        .bind(handoff.created_at.to_rfc3339())
        .bind(handoff.ready_at.map(|t| t.to_rfc3339()))
        .bind(handoff.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_handoff(&self, handoff_id: &str) -> StoreResult<Option<Handoff>> {
        let row = sqlx::query("SELECT * FROM handoffs WHERE handoff_id = ?")
            .bind(handoff_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        row.map(|r| Self::row_to_handoff(&r)).transpose()
    }

    async fn list_handoffs_for_consumer(&self, consumer_task: &str) -> StoreResult<Vec<Handoff>> {
        let rows = sqlx::query("SELECT * FROM handoffs WHERE consumer_task = ?")
            .bind(consumer_task)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_handoff).collect()
    }

    async fn list_pending_handoffs(&self) -> StoreResult<Vec<Handoff>> {
        let rows = sqlx::query("SELECT * FROM handoffs WHERE status != 'completed'")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_handoff).collect()
    }
}

fn status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Completed => "completed",
        TaskStatus::Partial => "partial",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Failed => "failed",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::NotStarted => "not_started",
    }
}

fn row_to_completion(row: &sqlx::sqlite::SqliteRow) -> StoreResult<TaskCompletion> {
    let status_str: String = row.get("status");
    let deliverables: String = row.get("deliverables");
    let test_results: Option<String> = row.get("test_results");
    let quality_gates: Option<String> = row.get("quality_gates");
    Ok(TaskCompletion {
        task_id: row.get("task_id"),
        agent_id: row.get("agent_id"),
        status: TaskStatus::normalize(&status_str).0,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(parse_ts)
            .transpose()?,
        deliverables: serde_json::from_str(&deliverables)?,
        test_results: test_results
            .map(|s| serde_json::from_str::<TestResults>(&s))
            .transpose()?,
        quality_gates: quality_gates
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
    })
}
