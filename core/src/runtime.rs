/// Coordination runtime (§2): wires the fifteen components into the data flow the daemon
/// binary drives — file watch -> debounce -> bridge on one path, poll -> parse -> validate
/// -> commit on the other, with the coordinator listening on both. Constructed once by
/// `relay-daemon`'s `main.rs` and passed nowhere else; every component below holds its own
/// `Arc<EventBus>` rather than reaching back through this struct.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::agent::AgentLifecycle;
use crate::bridge::Bridge;
use crate::config::OrchestratorConfig;
use crate::coordinator::Coordinator;
use crate::errors::OrchestratorResult;
use crate::event_bus::EventBus;
use crate::model::{DeliveryMode, HandlerOutcome};
use crate::parser::completion::parse_completion;
use crate::parser::validator::{validate, Strictness};
use crate::poller::{PollPhase, Poller};
use crate::recovery::RecoveryManager;
use crate::router::Router;
use crate::store::{SqliteStore, Store};
use crate::topics;
use crate::updater::StateUpdater;
use crate::watcher::debounce::Debouncer;
use crate::watcher::{FileEvent, FileWatcher};

/// Every long-lived component, held by `Arc` so subscription closures and spawned tasks can
/// each keep their own handle (§9's "no global singleton" note).
pub struct Runtime {
    config: OrchestratorConfig,
    bus: Arc<EventBus>,
    store: Arc<dyn Store>,
    router: Arc<Router>,
    bridge: Arc<Bridge>,
    poller: Arc<Poller>,
    updater: Arc<StateUpdater>,
    lifecycle: Arc<AgentLifecycle>,
    recovery: Arc<RecoveryManager>,
    coordinator: Arc<Coordinator>,
}

fn strictness_of(config: &OrchestratorConfig) -> Strictness {
    if config.validator.strict {
        Strictness::Strict
    } else {
        Strictness::Lenient
    }
}

impl Runtime {
    pub async fn new(config: OrchestratorConfig) -> OrchestratorResult<Self> {
        let bus = EventBus::new();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&config.store.database_path).await?);
        let router = Arc::new(Router::new(bus.clone()));
        let bridge = Arc::new(Bridge::new(bus.clone()));
        let poller = Arc::new(Poller::new(bus.clone(), config.poller.clone()));
        let updater = Arc::new(StateUpdater::new(store.clone(), bus.clone()));
        let lifecycle = Arc::new(AgentLifecycle::new(store.clone()));
        let recovery = Arc::new(RecoveryManager::new(store.clone(), bus.clone(), config.recovery.clone()));
        let coordinator = Arc::new(Coordinator::new(bus.clone()));

        let runtime = Runtime {
            config,
            bus,
            store,
            router,
            bridge,
            poller,
            updater,
            lifecycle,
            recovery,
            coordinator,
        };
        runtime.wire_completion_pipeline();
        runtime.wire_coordinator();
        Ok(runtime)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycle> {
        &self.lifecycle
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Registers a task for adaptive polling the moment the bridge reports its memory log
    /// was first observed (§4.6 is otherwise silent on who calls `start_polling`; an
    /// external dependency-tracker client owns the DAG, but the watched-file path itself is
    /// the natural trigger for "start sampling this task's completion status").
    fn wire_bridge_to_poller(&self) {
        let poller = self.poller.clone();
        self.bus
            .subscribe(
                "runtime:poller-registration",
                topics::TASK_STARTED,
                DeliveryMode::Async,
                Arc::new(move |envelope| {
                    let task_id = envelope.data.get("task_id").and_then(|v| v.as_str());
                    let source_path = envelope.data.get("source_path").and_then(|v| v.as_str());
                    if let (Some(task_id), Some(source_path)) = (task_id, source_path) {
                        poller.start_polling(task_id.to_string(), source_path.to_string(), PollPhase::Active);
                    }
                    HandlerOutcome::ok()
                }),
            )
            .expect("static subscription pattern is always valid");
    }

    /// Routes a detected status change (C8) through the completion parser, validator and
    /// state updater (C9/C10/C11), per §2's "C8 ... routes through C9, C10, C11".
    fn wire_completion_pipeline(&self) {
        self.wire_bridge_to_poller();

        let poller = self.poller.clone();
        let updater = self.updater.clone();
        let strictness = strictness_of(&self.config);

        self.bus
            .subscribe(
                "runtime:completion-pipeline",
                topics::STATE_DETECTED,
                DeliveryMode::Async,
                Arc::new(move |envelope| {
                    let Some(task_id) = envelope.data.get("task_id").and_then(|v| v.as_str()) else {
                        return HandlerOutcome::ok();
                    };
                    let Some(state) = poller.state(task_id) else {
                        return HandlerOutcome::ok();
                    };
                    let poller = poller.clone();
                    let updater = updater.clone();
                    let task_id = task_id.to_string();
                    tokio::spawn(async move {
                        process_detected_state(&poller, &updater, &task_id, &state.memory_log_path, strictness).await;
                    });
                    HandlerOutcome::ok()
                }),
            )
            .expect("static subscription pattern is always valid");
    }

    /// Subscribes the coordinator to both completion streams (§2: "C15 listens on both
    /// streams, marks dependency outputs as produced").
    fn wire_coordinator(&self) {
        for topic in [topics::TASK_COMPLETED_DB, topics::TASK_COMPLETED] {
            let coordinator = self.coordinator.clone();
            self.bus
                .subscribe(
                    format!("runtime:coordinator:{topic}"),
                    topic,
                    DeliveryMode::Async,
                    Arc::new(move |envelope| {
                        let task_id = envelope
                            .data
                            .get("task_id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                        let agent_id = envelope
                            .data
                            .get("agent_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        let Some(task_id) = task_id else {
                            return HandlerOutcome::ok();
                        };
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            coordinator.mark_task_completed(&task_id, &agent_id).await;
                        });
                        HandlerOutcome::ok()
                    }),
                )
                .expect("static subscription pattern is always valid");
        }
    }

    /// Runs the file-watch -> debounce -> bridge pipeline and the recovery scan loop until
    /// `shutdown` resolves.
    pub async fn run(&self, shutdown: oneshot::Receiver<()>) -> OrchestratorResult<()> {
        self.recovery.start();

        let (file_tx, file_rx) = mpsc::channel(256);
        let (watcher_shutdown_tx, watcher_shutdown_rx) = oneshot::channel();

        let watch_root = self
            .config
            .watcher
            .watch_paths
            .first()
            .cloned()
            .unwrap_or_else(|| ".".to_string());
        let mut watcher = FileWatcher::new(
            watch_root,
            self.config.watcher.max_consecutive_restarts,
            Duration::from_millis(self.config.watcher.restart_backoff_ms),
        );
        let watcher_handle = tokio::spawn(async move {
            if let Err(e) = watcher.run(file_tx, watcher_shutdown_rx).await {
                warn!(error = %e, "file watcher exited");
            }
        });

        let pipeline_handle = self.spawn_pipeline(file_rx);

        tokio::select! {
            _ = shutdown => {
                info!("runtime: shutdown signal received");
            }
        }

        let _ = watcher_shutdown_tx.send(());
        self.recovery.stop();
        pipeline_handle.abort();
        let _ = watcher_handle.await;

        Ok(())
    }

    /// Feeds raw [`FileEvent`]s into the debouncer and flushes ready entries into the
    /// bridge, on a fixed tick independent of the watcher's own event cadence.
    fn spawn_pipeline(&self, mut file_rx: mpsc::Receiver<FileEvent>) -> tokio::task::JoinHandle<()> {
        let bridge = self.bridge.clone();
        let debounce_window = Duration::from_millis(self.config.debounce.window_ms);
        tokio::spawn(async move {
            let mut debouncer = Debouncer::new(debounce_window, None);
            let mut tick = tokio::time::interval(Duration::from_millis(50));
            loop {
                tokio::select! {
                    maybe_event = file_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                let path = event.path.to_string_lossy().to_string();
                                if let Some(ready) = debouncer.record(&path, event.event_type) {
                                    bridge.handle_debounced_event(ready).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tick.tick() => {
                        for ready in debouncer.poll_ready() {
                            bridge.handle_debounced_event(ready).await;
                        }
                    }
                }
            }
        })
    }
}

async fn process_detected_state(
    poller: &Arc<Poller>,
    updater: &Arc<StateUpdater>,
    task_id: &str,
    memory_log_path: &str,
    strictness: Strictness,
) {
    let path = Path::new(memory_log_path);
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(task_id, error = %e, "completion pipeline: failed to read memory log");
            return;
        }
    };

    if let Err(e) = validate(&content, strictness) {
        warn!(task_id, error = %e, "completion pipeline: validation rejected memory log");
        return;
    }

    let record = match parse_completion(path) {
        Ok(record) => record,
        Err(e) => {
            warn!(task_id, error = %e, "completion pipeline: failed to parse completion");
            return;
        }
    };

    if record.status != crate::model::TaskStatus::Completed {
        return;
    }

    match updater.update_task_completion(&record).await {
        Ok(_) => {
            if let Err(e) = poller.stop_polling(task_id) {
                warn!(task_id, error = %e, "completion pipeline: task was not registered for polling");
            }
        }
        Err(e) => warn!(task_id, error = %e, "completion pipeline: commit failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_wires_every_component_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.store.database_path = dir.path().join("state.db").to_str().unwrap().to_string();
        config.watcher.watch_paths = vec![dir.path().to_str().unwrap().to_string()];

        let runtime = Runtime::new(config).await.unwrap();
        assert_eq!(runtime.bus().stats().published, 0);
    }
}
