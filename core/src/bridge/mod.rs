/// State-Integration Bridge (C7, §4.5): turns debounced filesystem events into typed
/// state-update events, preserving per-agent ordering and keeping a bounded replay buffer
/// for diagnostics. Grounded in the per-agent-task-plus-channel pattern used for the
/// Debouncer and Poller's owning-task loops (§9's "per-agent FIFO queue" design note).
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::event_bus::EventBus;
use crate::model::TaskStatus;
use crate::parser;
use crate::topics;
use crate::watcher::debounce::DebouncedEvent;
use crate::watcher::FileEventKind;

const DEFAULT_REPLAY_CAPACITY: usize = 100;

/// Kind of state change the bridge inferred from an event and the status-cache diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateUpdateKind {
    TaskStarted,
    TaskStatusChanged,
    TaskCompleted,
    TaskBlocked,
    TaskFailed,
}

impl StateUpdateKind {
    fn topic(self) -> &'static str {
        match self {
            StateUpdateKind::TaskStarted => topics::TASK_STARTED,
            StateUpdateKind::TaskStatusChanged => topics::TASK_STATUS_CHANGED,
            StateUpdateKind::TaskCompleted => topics::TASK_COMPLETED,
            StateUpdateKind::TaskBlocked => topics::TASK_BLOCKED,
            StateUpdateKind::TaskFailed => topics::TASK_FAILED,
        }
    }
}

/// Typed payload emitted by the bridge onto `state-update:*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdateEvent {
    pub kind: StateUpdateKind,
    pub task_id: String,
    pub agent_id: String,
    pub previous_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub progress_percent: Option<u8>,
    pub blockers: Option<Vec<String>>,
    pub has_important_findings: bool,
    pub has_ad_hoc_delegation: bool,
    pub has_compatibility_issues: bool,
    pub source_path: String,
    pub timestamp: DateTime<Utc>,
}

fn kind_for(event_type: FileEventKind, previous: Option<TaskStatus>, new_status: TaskStatus) -> Option<StateUpdateKind> {
    match event_type {
        FileEventKind::Add => Some(StateUpdateKind::TaskStarted),
        FileEventKind::Change => {
            if previous == Some(new_status) {
                return None;
            }
            Some(match new_status {
                TaskStatus::Completed => StateUpdateKind::TaskCompleted,
                TaskStatus::Blocked => StateUpdateKind::TaskBlocked,
                TaskStatus::Failed => StateUpdateKind::TaskFailed,
                _ => StateUpdateKind::TaskStatusChanged,
            })
        }
        FileEventKind::Unlink => None,
    }
}

struct AgentQueue {
    tx: mpsc::UnboundedSender<StateUpdateEvent>,
}

/// Owns the per-path status cache, the per-agent task registry, and the replay buffer.
/// Constructed once by the daemon and shared via `Arc` alongside the `EventBus`.
pub struct Bridge {
    bus: Arc<EventBus>,
    status_cache: DashMap<String, TaskStatus>,
    agent_queues: Mutex<HashMap<String, AgentQueue>>,
    replay_buffer: Arc<Mutex<VecDeque<StateUpdateEvent>>>,
    replay_capacity: usize,
}

impl Bridge {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Bridge::with_replay_capacity(bus, DEFAULT_REPLAY_CAPACITY)
    }

    pub fn with_replay_capacity(bus: Arc<EventBus>, replay_capacity: usize) -> Self {
        Bridge {
            bus,
            status_cache: DashMap::new(),
            agent_queues: Mutex::new(HashMap::new()),
            replay_buffer: Arc::new(Mutex::new(VecDeque::with_capacity(replay_capacity))),
            replay_capacity,
        }
    }

    /// Processes one debounced filesystem event: parses the memory log, diffs it against
    /// the per-path status cache, and — if a state update results — enqueues it on the
    /// producing agent's ordered channel. Parse errors are logged and dropped, matching
    /// the bridge's documented failure policy.
    pub async fn handle_debounced_event(&self, event: DebouncedEvent) {
        if event.event_type == FileEventKind::Unlink {
            self.status_cache.remove(&event.file_path);
            return;
        }

        let parsed = match parser::parse_memory_log(Path::new(&event.file_path)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %event.file_path, error = %e, "bridge: dropping event, log failed to parse");
                return;
            }
        };

        let previous_status = self
            .status_cache
            .get(&event.file_path)
            .map(|entry| *entry.value());

        let Some(kind) = kind_for(event.event_type, previous_status, parsed.status) else {
            self.status_cache.insert(event.file_path.clone(), parsed.status);
            return;
        };

        self.status_cache.insert(event.file_path.clone(), parsed.status);

        let update = StateUpdateEvent {
            kind,
            task_id: parsed.task_id,
            agent_id: parsed.agent_id.clone().unwrap_or_else(|| "unknown".to_string()),
            previous_status,
            new_status: parsed.status,
            progress_percent: parsed.progress_percent,
            blockers: parsed.blockers,
            has_important_findings: parsed.has_important_findings,
            has_ad_hoc_delegation: parsed.has_ad_hoc_delegation,
            has_compatibility_issues: parsed.has_compatibility_issues,
            source_path: event.file_path,
            timestamp: event.emitted_at,
        };

        self.enqueue(update);
    }

    fn enqueue(&self, update: StateUpdateEvent) {
        let agent_id = update.agent_id.clone();
        let mut queues = self.agent_queues.lock();
        // If the existing worker's channel is closed, `send` hands `update` back via the
        // error so it can be replayed onto a freshly spawned worker below.
        let update = match queues.get(&agent_id) {
            Some(queue) => match queue.tx.send(update) {
                Ok(()) => return,
                Err(e) => e.0,
            },
            None => update,
        };
        queues.remove(&agent_id);
        let (tx, rx) = mpsc::unbounded_channel::<StateUpdateEvent>();
        self.spawn_agent_worker(agent_id.clone(), rx);
        let _ = tx.send(update);
        queues.insert(agent_id, AgentQueue { tx });
    }

    fn spawn_agent_worker(&self, agent_id: String, mut rx: mpsc::UnboundedReceiver<StateUpdateEvent>) {
        let bus = self.bus.clone();
        let replay_buffer = self.replay_buffer.clone();
        let replay_capacity = self.replay_capacity;
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let topic = update.kind.topic().to_string();
                let payload = match serde_json::to_value(&update) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "bridge: failed to serialize state update");
                        continue;
                    }
                };
                {
                    let mut buffer = replay_buffer.lock();
                    if buffer.len() >= replay_capacity {
                        buffer.pop_front();
                    }
                    buffer.push_back(update.clone());
                }
                if let Err(e) = bus.publish(&topic, payload, Some(agent_id.clone())).await {
                    warn!(agent_id = %agent_id, error = %e, "bridge: publish failed");
                }
            }
        });
    }

    /// Most recent replayed events, newest last; `count` caps how many are returned.
    pub fn recent_events(&self, count: usize) -> Vec<StateUpdateEvent> {
        let buffer = self.replay_buffer.lock();
        buffer.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn clear_replay_buffer(&self) {
        self.replay_buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryMode, HandlerOutcome};
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn write_log(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn debounced(file_path: String, event_type: FileEventKind) -> DebouncedEvent {
        let now = Utc::now();
        DebouncedEvent {
            event_type,
            file_path,
            first_change_timestamp: now,
            last_change_timestamp: now,
            changes_collapsed: 1,
            emitted_at: now,
        }
    }

    async fn recv_update(rx: &mut mpsc::UnboundedReceiver<StateUpdateEvent>) -> StateUpdateEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for state update")
            .expect("channel closed without a value")
    }

    fn subscribe_capture(bus: &EventBus) -> mpsc::UnboundedReceiver<StateUpdateEvent> {
        let (tx, rx) = unbounded_channel();
        bus.subscribe(
            "capture",
            "state-update:**",
            DeliveryMode::Sync,
            Arc::new(move |envelope: &crate::model::Envelope| {
                if let Ok(update) = serde_json::from_value::<StateUpdateEvent>(envelope.data.clone()) {
                    let _ = tx.send(update);
                }
                HandlerOutcome::ok()
            }),
        )
        .unwrap();
        rx
    }

    #[tokio::test]
    async fn add_event_emits_task_started() {
        let bus = EventBus::new();
        let mut rx = subscribe_capture(&bus);
        let bridge = Bridge::new(bus);

        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            &dir,
            "Task_1_1.md",
            "---\ntask_ref: \"1.1\"\nagent: agent-a\nstatus: InProgress\n---\n## Summary\nstarting\n",
        );
        bridge.handle_debounced_event(debounced(path, FileEventKind::Add)).await;

        let update = recv_update(&mut rx).await;
        assert_eq!(update.kind, StateUpdateKind::TaskStarted);
        assert_eq!(update.agent_id, "agent-a");
        assert!(update.previous_status.is_none());
    }

    #[tokio::test]
    async fn change_with_unchanged_status_emits_nothing() {
        let bus = EventBus::new();
        let mut rx = subscribe_capture(&bus);
        let bridge = Bridge::new(bus);

        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            &dir,
            "Task_1_1.md",
            "---\ntask_ref: \"1.1\"\nagent: agent-a\nstatus: InProgress\n---\n## Summary\nstarting\n",
        );
        bridge.handle_debounced_event(debounced(path.clone(), FileEventKind::Add)).await;
        recv_update(&mut rx).await;

        bridge.handle_debounced_event(debounced(path, FileEventKind::Change)).await;
        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "no event expected for an unchanged status");
    }

    #[tokio::test]
    async fn change_to_completed_emits_task_completed_with_previous_status() {
        let bus = EventBus::new();
        let mut rx = subscribe_capture(&bus);
        let bridge = Bridge::new(bus);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Task_1_1.md");
        std::fs::write(&path, "---\ntask_ref: \"1.1\"\nagent: agent-a\nstatus: InProgress\n---\n## Summary\nstarting\n").unwrap();
        let path_str = path.to_str().unwrap().to_string();
        bridge.handle_debounced_event(debounced(path_str.clone(), FileEventKind::Add)).await;
        recv_update(&mut rx).await;

        std::fs::write(&path, "---\ntask_ref: \"1.1\"\nagent: agent-a\nstatus: Completed\n---\n## Summary\ndone\n").unwrap();
        bridge.handle_debounced_event(debounced(path_str, FileEventKind::Change)).await;

        let update = recv_update(&mut rx).await;
        assert_eq!(update.kind, StateUpdateKind::TaskCompleted);
        assert_eq!(update.previous_status, Some(TaskStatus::InProgress));
        assert_eq!(update.new_status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn unlink_clears_cache_without_emitting() {
        let bus = EventBus::new();
        let mut rx = subscribe_capture(&bus);
        let bridge = Bridge::new(bus);

        bridge
            .handle_debounced_event(debounced("Task_1_1.md".to_string(), FileEventKind::Unlink))
            .await;
        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "unlink must not emit a state update");
        assert!(!bridge.status_cache.contains_key("Task_1_1.md"));
    }

    #[tokio::test]
    async fn replay_buffer_tracks_recent_events_bounded() {
        let bus = EventBus::new();
        let bridge = Bridge::with_replay_capacity(bus, 2);

        let dir = tempfile::tempdir().unwrap();
        for i in 1..=3 {
            let path = write_log(
                &dir,
                &format!("Task_1_{i}.md"),
                &format!("---\ntask_ref: \"1.{i}\"\nagent: agent-a\nstatus: InProgress\n---\n## Summary\nx\n"),
            );
            bridge.handle_debounced_event(debounced(path, FileEventKind::Add)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bridge.recent_events(10).len(), 2);
    }
}
