/// Core data model (§3): Agent, StateTransition, TaskCompletion, Handoff, Event Envelope,
/// Subscription, Polling State, Parsed Memory Log.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of agent process the orchestrator is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Manager,
    Implementation,
    AdHoc,
}

/// Lifecycle status of an agent (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Active,
    Waiting,
    Idle,
    Terminated,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Spawning => "spawning",
            AgentStatus::Active => "active",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Idle => "idle",
            AgentStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawning" => Ok(AgentStatus::Spawning),
            "active" => Ok(AgentStatus::Active),
            "waiting" => Ok(AgentStatus::Waiting),
            "idle" => Ok(AgentStatus::Idle),
            "terminated" => Ok(AgentStatus::Terminated),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

impl AgentStatus {
    /// Table in §4.8: returns true if `self -> target` is a legal transition.
    pub fn can_transition_to(&self, target: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, target),
            (Spawning, Active)
                | (Spawning, Terminated)
                | (Active, Waiting)
                | (Active, Idle)
                | (Active, Terminated)
                | (Waiting, Active)
                | (Waiting, Terminated)
                | (Idle, Active)
                | (Idle, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Terminated)
    }

    /// `currentTask` must be nil whenever status is in this set (§3 invariant).
    pub fn requires_no_current_task(&self) -> bool {
        matches!(self, AgentStatus::Waiting | AgentStatus::Idle | AgentStatus::Terminated)
    }
}

/// What triggered a state transition, recorded for audit (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    UserAction,
    Automatic,
    Timeout,
    Error,
    Dependency,
    Recovery,
}

/// Which kind of entity a state transition row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Agent,
    Task,
    Session,
}

/// An externally spawned worker process (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub spawned_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub metadata: AgentMetadata,
}

/// Typed metadata bag carried on every agent row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub process_id: Option<u32>,
    pub working_dir: Option<String>,
    pub memory_log_path: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Agent {
    pub fn new(id: impl Into<String>, agent_type: AgentType, metadata: AgentMetadata) -> Self {
        let now = Utc::now();
        Agent {
            id: id.into(),
            agent_type,
            status: AgentStatus::Spawning,
            current_task: None,
            spawned_at: now,
            last_activity_at: now,
            metadata,
        }
    }
}

/// Append-only state transition record, the authoritative history for an entity (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub timestamp: DateTime<Utc>,
    pub trigger: TransitionTrigger,
    pub metadata: serde_json::Value,
}

/// Status of a task as reported by a memory log or completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Partial,
    Blocked,
    Failed,
    InProgress,
    NotStarted,
}

impl TaskStatus {
    /// Map a frontmatter/body status string onto the enum (§6), case/space/underscore
    /// insensitive; unrecognized values fall back to `InProgress` with a caller-side warning.
    pub fn normalize(raw: &str) -> (TaskStatus, bool) {
        let cleaned = raw.trim().to_lowercase().replace(['_', '-'], " ");
        let status = match cleaned.as_str() {
            "completed" | "complete" | "done" => TaskStatus::Completed,
            "partial" | "partially complete" => TaskStatus::Partial,
            "blocked" => TaskStatus::Blocked,
            "failed" | "error" => TaskStatus::Failed,
            "in progress" | "inprogress" | "active" | "working" => TaskStatus::InProgress,
            "not started" | "notstarted" | "pending" | "todo" => TaskStatus::NotStarted,
            _ => return (TaskStatus::InProgress, true),
        };
        (status, false)
    }
}

/// Results of a test run as reported in a completion document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    pub total: u32,
    pub passed: u32,
    pub coverage_percent: Option<f64>,
}

/// Boolean quality-gate flags inferred from a completion document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityGates {
    pub tdd: bool,
    pub commits: bool,
    pub security: bool,
    pub coverage: bool,
}

/// Upserted record of a task's completion (§3). Primary key is `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub deliverables: Vec<String>,
    pub test_results: Option<TestResults>,
    pub quality_gates: Option<QualityGates>,
}

/// Status of a cross-agent handoff (§4.10). Strictly monotone: Pending -> Ready -> Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Ready,
    Completed,
}

/// A directed producer->consumer dependency edge tracked as a first-class record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub handoff_id: String,
    pub consumer_task: String,
    pub consumer_agent: String,
    pub producer_task: String,
    pub producer_agent: String,
    pub status: HandoffStatus,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Handoff {
    pub fn id_for(producer_task: &str, consumer_task: &str) -> String {
        format!("{producer_task}->{consumer_task}")
    }

    pub fn new_pending(
        consumer_task: impl Into<String>,
        consumer_agent: impl Into<String>,
        producer_task: impl Into<String>,
        producer_agent: impl Into<String>,
    ) -> Self {
        let consumer_task = consumer_task.into();
        let producer_task = producer_task.into();
        let handoff_id = Self::id_for(&producer_task, &consumer_task);
        Handoff {
            handoff_id,
            consumer_task,
            consumer_agent: consumer_agent.into(),
            producer_task,
            producer_agent: producer_agent.into(),
            status: HandoffStatus::Pending,
            created_at: Utc::now(),
            ready_at: None,
            completed_at: None,
        }
    }
}

/// Delivery mode for the event bus (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Async,
    Sync,
    Parallel,
}

/// Metadata injected by the bus on every publish; publishers supply only topic and data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub publisher_id: Option<String>,
    pub sequence_number: u64,
}

/// The wire shape of an event: topic, payload, injected metadata (§3, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub data: serde_json::Value,
    pub metadata: EventMetadata,
}

/// What a handler may return to request cancellation of further delivery (Sync mode) or
/// to report a failure (all modes).
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub cancel: bool,
    pub reason: Option<String>,
}

impl HandlerOutcome {
    pub fn ok() -> Self {
        HandlerOutcome::default()
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        HandlerOutcome {
            cancel: true,
            reason: Some(reason.into()),
        }
    }

    /// A failed-but-not-cancelling outcome (§4.1 Failure semantics): reported on
    /// `listener-error`, delivery to other handlers continues unaffected.
    pub fn error(reason: impl Into<String>) -> Self {
        HandlerOutcome {
            cancel: false,
            reason: Some(reason.into()),
        }
    }
}

/// Priority tier used by the Router for accounting/introspection (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePriority {
    Low,
    Normal,
    High,
}

impl Default for RoutePriority {
    fn default() -> Self {
        RoutePriority::Normal
    }
}

/// Per-task poller bookkeeping (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingState {
    pub task_id: String,
    pub memory_log_path: String,
    pub last_poll_time: Option<DateTime<Utc>>,
    pub last_detected_state: Option<TaskStatus>,
    pub poll_count: u64,
    pub consecutive_unchanged_polls: u64,
    pub polling_interval_ms: u64,
    /// The cadence a successful poll restores `polling_interval_ms` to, once any retry
    /// backoff has been cleared; widened permanently once `Completed` is observed.
    pub base_interval_ms: u64,
    pub is_paused: bool,
    pub retry_attempt: u32,
}

/// Result of parsing a memory log's frontmatter + body (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMemoryLog {
    pub task_id: String,
    pub agent_id: Option<String>,
    pub status: TaskStatus,
    pub progress_percent: Option<u8>,
    pub blockers: Option<Vec<String>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    pub has_important_findings: bool,
    pub has_ad_hoc_delegation: bool,
    pub has_compatibility_issues: bool,
    /// Set when frontmatter was missing and the parser fell back to plain-markdown recovery.
    pub plain_mode: bool,
}
