/// Completion Poller (C8, §4.6): adaptively samples a task's memory log for its frontmatter
/// `status`, with retry backoff on read/parse errors and file-watcher-driven resets of the
/// unchanged-poll counter. Each registered task owns exactly one spawned task and timer —
/// grounded in the crate's other owning-task-plus-channel components (Debouncer, Bridge).
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::PollerConfig;
use crate::errors::{ParserError, PollerError, PollerResult};
use crate::event_bus::EventBus;
use crate::model::{PollingState, TaskStatus};
use crate::parser::{extract_frontmatter_field, split_frontmatter};
use crate::topics;

const RETRY_DELAYS_MS: [u64; 3] = [1_000, 2_000, 4_000];

/// Declared polling cadence a task starts in (§4.6); widened to `Completed`'s interval once
/// a completed status is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Active,
    Queued,
    Completed,
}

impl PollPhase {
    fn interval_ms(self) -> u64 {
        match self {
            PollPhase::Active => 1_000,
            PollPhase::Queued => 5_000,
            PollPhase::Completed => 30_000,
        }
    }
}

struct TaskHandle {
    join: JoinHandle<()>,
    paused: Arc<AtomicBool>,
}

/// Reads only the frontmatter `status` field — the poller does not need the full
/// [`crate::model::ParsedMemoryLog`] shape the bridge's parser produces.
fn read_status(path: &Path) -> Result<TaskStatus, ParserError> {
    let content = std::fs::read_to_string(path).map_err(ParserError::Io)?;
    let (frontmatter, _) = split_frontmatter(&content).ok_or(ParserError::NoFrontmatter)?;
    let raw = extract_frontmatter_field(frontmatter, "status").unwrap_or("");
    let (status, _) = TaskStatus::normalize(raw);
    Ok(status)
}

async fn perform_poll(
    bus: &Arc<EventBus>,
    states: &Arc<DashMap<String, PollingState>>,
    task_id: &str,
    max_retry_attempts: u32,
) {
    let _ = bus
        .publish(topics::POLL_STARTED, serde_json::json!({"task_id": task_id}), None)
        .await;

    let memory_log_path = match states.get(task_id) {
        Some(s) => s.memory_log_path.clone(),
        None => return,
    };

    match read_status(Path::new(&memory_log_path)) {
        Ok(status) => {
            let mut state = match states.get_mut(task_id) {
                Some(s) => s,
                None => return,
            };
            state.poll_count += 1;
            state.last_poll_time = Some(Utc::now());
            state.retry_attempt = 0;
            state.polling_interval_ms = state.base_interval_ms;

            let changed_from = state.last_detected_state;
            let is_first = changed_from.is_none();
            let changed = changed_from != Some(status);

            if is_first || changed {
                state.last_detected_state = Some(status);
                if status == TaskStatus::Completed {
                    state.base_interval_ms = PollPhase::Completed.interval_ms();
                    state.polling_interval_ms = PollPhase::Completed.interval_ms();
                }
                let payload = serde_json::json!({
                    "task_id": task_id,
                    "state": status,
                    "changed_from": changed_from,
                });
                drop(state);
                let _ = bus.publish(topics::STATE_DETECTED, payload, None).await;
            } else {
                state.consecutive_unchanged_polls += 1;
            }
        }
        Err(e) => {
            let retry_attempt = {
                let mut state = match states.get_mut(task_id) {
                    Some(s) => s,
                    None => return,
                };
                state.retry_attempt += 1;
                state.retry_attempt
            };

            warn!(task_id, error = %e, retry_attempt, "poller: read/parse error");
            let _ = bus
                .publish(
                    topics::POLL_ERROR,
                    serde_json::json!({"task_id": task_id, "error": e.to_string(), "retry_attempt": retry_attempt}),
                    None,
                )
                .await;

            let delay_index = (retry_attempt as usize).saturating_sub(1).min(RETRY_DELAYS_MS.len() - 1);
            if let Some(mut state) = states.get_mut(task_id) {
                state.polling_interval_ms = RETRY_DELAYS_MS[delay_index];
            }

            if retry_attempt >= max_retry_attempts {
                if let Some(mut state) = states.get_mut(task_id) {
                    state.retry_attempt = 0;
                }
            }
        }
    }
}

/// Owns per-task [`PollingState`] and the spawned task that drives its timer.
pub struct Poller {
    bus: Arc<EventBus>,
    config: PollerConfig,
    states: Arc<DashMap<String, PollingState>>,
    handles: Mutex<HashMap<String, TaskHandle>>,
}

impl Poller {
    pub fn new(bus: Arc<EventBus>, config: PollerConfig) -> Self {
        Poller {
            bus,
            config,
            states: Arc::new(DashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, task_id: &str) -> Option<PollingState> {
        self.states.get(task_id).map(|e| e.value().clone())
    }

    /// Begins polling `task_id` at `memory_log_path`, starting at `phase`'s declared cadence.
    pub fn start_polling(&self, task_id: impl Into<String>, memory_log_path: impl Into<String>, phase: PollPhase) {
        let task_id = task_id.into();
        let memory_log_path = memory_log_path.into();

        self.states.insert(
            task_id.clone(),
            PollingState {
                task_id: task_id.clone(),
                memory_log_path,
                last_poll_time: None,
                last_detected_state: None,
                poll_count: 0,
                consecutive_unchanged_polls: 0,
                polling_interval_ms: phase.interval_ms(),
                base_interval_ms: phase.interval_ms(),
                is_paused: false,
                retry_attempt: 0,
            },
        );

        let paused = Arc::new(AtomicBool::new(false));
        let join = self.spawn_loop(task_id.clone(), paused.clone());

        let mut handles = self.handles.lock();
        if let Some(old) = handles.insert(task_id, TaskHandle { join, paused }) {
            old.join.abort();
        }
    }

    pub fn stop_polling(&self, task_id: &str) -> PollerResult<()> {
        let mut handles = self.handles.lock();
        let handle = handles
            .remove(task_id)
            .ok_or_else(|| PollerError::NotPolling(task_id.to_string()))?;
        handle.join.abort();
        self.states.remove(task_id);
        Ok(())
    }

    pub fn pause(&self, task_id: &str) -> PollerResult<()> {
        let handles = self.handles.lock();
        let handle = handles
            .get(task_id)
            .ok_or_else(|| PollerError::NotPolling(task_id.to_string()))?;
        handle.paused.store(true, Ordering::SeqCst);
        if let Some(mut state) = self.states.get_mut(task_id) {
            state.is_paused = true;
        }
        Ok(())
    }

    pub fn resume(&self, task_id: &str) -> PollerResult<()> {
        let handles = self.handles.lock();
        let handle = handles
            .get(task_id)
            .ok_or_else(|| PollerError::NotPolling(task_id.to_string()))?;
        handle.paused.store(false, Ordering::SeqCst);
        if let Some(mut state) = self.states.get_mut(task_id) {
            state.is_paused = false;
        }
        Ok(())
    }

    /// Resets the unchanged-poll counter when the file watcher independently observes a
    /// `change` on a polled path (§4.6's file-watcher integration note).
    pub fn notify_file_changed(&self, task_id: &str) {
        if let Some(mut state) = self.states.get_mut(task_id) {
            state.consecutive_unchanged_polls = 0;
        }
    }

    fn spawn_loop(&self, task_id: String, paused: Arc<AtomicBool>) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let states = self.states.clone();
        let max_retry_attempts = self.config.max_retry_attempts;

        tokio::spawn(async move {
            loop {
                let interval_ms = match states.get(&task_id) {
                    Some(s) => s.polling_interval_ms,
                    None => return,
                };
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;

                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                if !states.contains_key(&task_id) {
                    return;
                }

                perform_poll(&bus, &states, &task_id, max_retry_attempts).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryMode, Envelope, HandlerOutcome};
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc::unbounded_channel;

    fn fast_config() -> PollerConfig {
        PollerConfig {
            base_interval_ms: 20,
            max_interval_ms: 200,
            backoff_multiplier: 2.0,
            unchanged_polls_before_backoff: 3,
            max_retry_attempts: 3,
        }
    }

    fn subscribe_events(bus: &EventBus, pattern: &str) -> tokio::sync::mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = unbounded_channel();
        bus.subscribe(
            "test",
            pattern,
            DeliveryMode::Async,
            Arc::new(move |envelope: &Envelope| {
                let _ = tx.send(envelope.clone());
                HandlerOutcome::ok()
            }),
        )
        .unwrap();
        rx
    }

    #[tokio::test]
    async fn first_poll_emits_state_detected_with_no_previous_state() {
        let bus = EventBus::new();
        let mut rx = subscribe_events(&bus, "state_detected");
        let poller = Poller::new(bus, fast_config());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Task_1_1.md");
        std::fs::write(&path, "---\nstatus: InProgress\n---\n").unwrap();

        poller.start_polling("1.1", path.to_str().unwrap(), PollPhase::Active);

        let envelope = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.data["changed_from"], serde_json::Value::Null);
        poller.stop_polling("1.1").unwrap();
    }

    #[tokio::test]
    async fn status_change_widens_interval_on_completion() {
        let bus = EventBus::new();
        let mut rx = subscribe_events(&bus, "state_detected");
        let poller = Poller::new(bus, fast_config());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Task_1_1.md");
        std::fs::write(&path, "---\nstatus: InProgress\n---\n").unwrap();

        poller.start_polling("1.1", path.to_str().unwrap(), PollPhase::Active);
        tokio::time::timeout(StdDuration::from_secs(2), rx.recv()).await.unwrap();

        std::fs::write(&path, "---\nstatus: Completed\n---\n").unwrap();
        let second = tokio::time::timeout(StdDuration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.data["state"], serde_json::json!("completed"));

        let state = poller.state("1.1").unwrap();
        assert_eq!(state.polling_interval_ms, PollPhase::Completed.interval_ms());
        poller.stop_polling("1.1").unwrap();
    }

    #[tokio::test]
    async fn successful_poll_restores_base_interval_after_backoff() {
        let bus = EventBus::new();
        let poller = Poller::new(bus.clone(), fast_config());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Task_1_1.md");
        // Start pointed at a path that doesn't exist yet so the first polls error and back off.
        poller.start_polling("1.1", path.to_str().unwrap(), PollPhase::Active);
        perform_poll(&bus, &poller.states, "1.1", 3).await;
        perform_poll(&bus, &poller.states, "1.1", 3).await;
        assert_eq!(poller.state("1.1").unwrap().retry_attempt, 2);
        assert_eq!(poller.state("1.1").unwrap().polling_interval_ms, RETRY_DELAYS_MS[1]);

        std::fs::write(&path, "---\nstatus: InProgress\n---\n").unwrap();
        perform_poll(&bus, &poller.states, "1.1", 3).await;

        let state = poller.state("1.1").unwrap();
        assert_eq!(state.retry_attempt, 0);
        assert_eq!(state.polling_interval_ms, PollPhase::Active.interval_ms());
        poller.stop_polling("1.1").unwrap();
    }

    #[tokio::test]
    async fn missing_file_emits_poll_error_and_backs_off() {
        let bus = EventBus::new();
        let mut rx = subscribe_events(&bus, "poll_error");
        let poller = Poller::new(bus, fast_config());

        poller.start_polling("1.1", "/nonexistent/Task_1_1.md", PollPhase::Active);
        let envelope = tokio::time::timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.data["retry_attempt"], serde_json::json!(1));
        poller.stop_polling("1.1").unwrap();
    }

    #[tokio::test]
    async fn pause_suppresses_polling_without_removing_state() {
        let bus = EventBus::new();
        let poller = Poller::new(bus, fast_config());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Task_1_1.md");
        std::fs::write(&path, "---\nstatus: InProgress\n---\n").unwrap();

        poller.start_polling("1.1", path.to_str().unwrap(), PollPhase::Active);
        poller.pause("1.1").unwrap();
        assert!(poller.state("1.1").unwrap().is_paused);
        poller.resume("1.1").unwrap();
        assert!(!poller.state("1.1").unwrap().is_paused);
        poller.stop_polling("1.1").unwrap();
    }

    #[tokio::test]
    async fn notify_file_changed_resets_unchanged_counter() {
        let bus = EventBus::new();
        let poller = Poller::new(bus, fast_config());
        poller.start_polling("1.1", "/nonexistent.md", PollPhase::Active);
        if let Some(mut s) = poller.states.get_mut("1.1") {
            s.consecutive_unchanged_polls = 5;
        }
        poller.notify_file_changed("1.1");
        assert_eq!(poller.state("1.1").unwrap().consecutive_unchanged_polls, 0);
        poller.stop_polling("1.1").unwrap();
    }

    #[test]
    fn unregistered_task_operations_fail() {
        let bus = EventBus::new();
        let poller = Poller::new(bus, fast_config());
        assert!(matches!(poller.pause("ghost"), Err(PollerError::NotPolling(_))));
        assert!(matches!(poller.resume("ghost"), Err(PollerError::NotPolling(_))));
        assert!(matches!(poller.stop_polling("ghost"), Err(PollerError::NotPolling(_))));
    }
}
