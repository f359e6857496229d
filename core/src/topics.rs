/// Well-known topic strings from the wire contract (§6). Centralized here so every
/// publisher and subscriber spells them identically; mirrors the teacher's convention of a
/// single `topics` module rather than scattering string literals per component.

// File monitor -> debouncer -> parser -> bridge pipeline.
pub const FILE_EVENT: &str = "file-event";
pub const DEBOUNCED_EVENT: &str = "debounced-event";

// State-integration bridge (§4.5). `state-update:*` is the subscribable prefix; the bridge
// also publishes the bare `STATE_UPDATE` topic for subscribers that want every update.
pub const STATE_UPDATE: &str = "state-update";
pub const STATE_UPDATE_WILDCARD: &str = "state-update:**";
pub const TASK_STARTED: &str = "state-update:task-started";
pub const TASK_STATUS_CHANGED: &str = "state-update:task-status-changed";
pub const TASK_COMPLETED: &str = "state-update:task-completed";
pub const TASK_BLOCKED: &str = "state-update:task-blocked";
pub const TASK_FAILED: &str = "state-update:task-failed";

// Completion poller (§4.6).
pub const POLL_STARTED: &str = "poll_started";
pub const POLL_ERROR: &str = "poll_error";
pub const STATE_DETECTED: &str = "state_detected";
pub const FILE_DETECTED: &str = "file_detected";

// State updater (§4.7 step 5).
pub const TASK_COMPLETED_DB: &str = "task_completed_db";
pub const AGENT_STATE_UPDATED: &str = "agent_state_updated";
pub const STATE_TRANSITION_RECORDED: &str = "state_transition_recorded";

// Cross-agent coordinator (§4.10).
pub const HANDOFF_CREATED: &str = "handoff-created";
pub const HANDOFF_READY: &str = "handoff-ready";
pub const HANDOFF_COMPLETED: &str = "handoff-completed";
pub const TASK_UNBLOCKED: &str = "task-unblocked";

// Router addressing helpers (§4.2) — parameterized, built via these functions rather than
// constants.
pub fn message_direct(agent_id: &str) -> String {
    format!("message:direct:{agent_id}")
}
pub const MESSAGE_BROADCAST: &str = "message:broadcast";
pub fn message_type(agent_type: &str) -> String {
    format!("message:type:{agent_type}")
}

// Error / bookkeeping topics (§6).
pub const LISTENER_ERROR: &str = "listener-error";
pub const PUBLISH_ERROR: &str = "publish-error";
pub const BUS_ERROR: &str = "bus-error";
pub const WATCHER_ERROR: &str = "watcher-error";
pub const WATCHER_FAILED: &str = "watcher-failed";
pub const SUBSCRIPTION_EXPIRED: &str = "subscription-expired";
pub const DUPLICATE_SUBSCRIPTION: &str = "duplicate-subscription";
pub const LISTENER_LEAK_WARNING: &str = "listener-leak-warning";
pub const EVENT_CANCELLED: &str = "event-cancelled";
