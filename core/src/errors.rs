/// Error taxonomy for the coordination runtime.
///
/// One `thiserror` enum per subsystem boundary, following the shape-level taxonomy of
/// transient I/O, validation, invariant violation, crash/timeout, and handler errors.
use thiserror::Error;

/// Errors raised by the transactional store (C1).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the event bus and router (C2/C3).
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),

    #[error("bus has been shut down")]
    ShutDown,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("no registered routing rule matches target: {0}")]
    RuleRejected(String),
}

pub type EventBusResult<T> = Result<T, EventBusError>;

/// Errors raised by the file watcher (C4).
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("watch path does not exist: {0}")]
    PathNotFound(String),

    #[error("underlying notify error: {0}")]
    Notify(String),

    #[error("watcher failed after {0} consecutive restarts")]
    TooManyFailures(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WatcherResult<T> = Result<T, WatcherError>;

/// Errors raised by the log parser and completion parser (C6/C9).
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("io error reading memory log: {0}")]
    Io(#[from] std::io::Error),

    #[error("no frontmatter block found")]
    NoFrontmatter,

    #[error("could not determine task reference")]
    MissingTaskRef,

    #[error("malformed frontmatter: {0}")]
    MalformedFrontmatter(String),
}

pub type ParserResult<T> = Result<T, ParserError>;

/// Errors raised by the log validator (C10).
#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("missing required frontmatter field: {0}")]
    MissingField(String),

    #[error("invalid status value: {0}")]
    InvalidStatus(String),

    #[error("missing required section: {0}")]
    MissingSection(String),

    #[error("validation failed with {0} error(s)")]
    Failed(usize),
}

pub type ValidatorResult<T> = Result<T, ValidatorError>;

/// Errors raised by the completion poller (C8).
#[derive(Error, Debug)]
pub enum PollerError {
    #[error("task not registered for polling: {0}")]
    NotPolling(String),

    #[error(transparent)]
    Parser(#[from] ParserError),
}

pub type PollerResult<T> = Result<T, PollerError>;

/// Errors raised by the recovery manager (C13).
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("max recovery attempts exceeded for agent {0}")]
    MaxAttemptsExceeded(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Errors raised by the cross-agent coordinator (C15).
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("handoff not found: {0}")]
    NotFound(String),

    #[error("handoff {0} is not Ready, cannot complete")]
    NotReady(String),

    #[error("handoff {0} already exists")]
    AlreadyExists(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Aggregated top-level error for the daemon binary's `anyhow`-style boundary.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Validator(#[from] ValidatorError),

    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
