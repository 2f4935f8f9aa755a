//! Error types used by the supervisor, the execution engines and the config store.
//!
//! This module defines the main error enums:
//!
//! - [`SupervisorError`]: errors raised while orchestrating instances and engines.
//! - [`EngineError`]: errors raised by a single engine's lifecycle calls.
//! - [`StoreError`]: errors raised by durable [`ConfigStore`](crate::ConfigStore) writes.
//!
//! Runtime failures inside an engine's loop are not errors in this sense: they are
//! converted into a [`Diagnostic`] and delivered as an event.
//!
//! All enums provide `as_label` (stable snake_case for logs/metrics).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineKind;
use crate::identity::Identity;

/// Structured description of a failure inside user code.
///
/// `kind` is the runtime's name for the failure class (e.g. `SyntaxError`),
/// `line` is 1-based when the runtime could attribute the failure to a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: String,
    pub message: String,
    pub line: Option<u32>,
}

impl Diagnostic {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            line: None,
        }
    }

    #[inline]
    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Diagnostic for a worker that panicked outside of user-code error handling.
    pub fn panic(info: impl Into<String>) -> Self {
        Self::new("Panic", info)
    }
}

impl fmt::Display for Diagnostic {
    /// Renders as `Kind: 'message'` with an ` at line N` suffix when known.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: '{}'", self.kind, self.message)?;
        if let Some(line) = self.line {
            write!(f, " at line {line}")?;
        }
        Ok(())
    }
}

/// # Errors produced by the supervisor.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// No engine variant configured for the identity, or the stored selector is not one we know.
    #[error("no usable engine configured for instance {id} (selector: {selector:?})")]
    Configuration {
        id: Identity,
        /// Raw stored selector, `None` when the key was absent.
        selector: Option<serde_json::Value>,
    },

    /// The engine's runtime or output device failed to initialize.
    #[error("engine {kind} for instance {id} failed to start: {source}")]
    EngineStart {
        id: Identity,
        kind: EngineKind,
        #[source]
        source: EngineError,
    },

    /// New source could not be loaded into a running engine; the previous program keeps running.
    #[error("hot reload rejected for instance {id}: {diagnostic}")]
    HotReloadRejected { id: Identity, diagnostic: Diagnostic },

    /// The instance declined to close; the caller may retry later.
    #[error("instance {id} is busy and refused to close")]
    InstanceBusy { id: Identity },

    /// No instance is registered under this identity.
    #[error("instance {id} is not registered")]
    UnknownInstance { id: Identity },

    /// Some engines did not exit within the grace period during shutdown and were abandoned.
    #[error("shutdown grace {grace:?} exceeded; abandoned engines: {stuck:?}")]
    GraceExceeded { grace: Duration, stuck: Vec<Identity> },

    /// The supervisor control loop is gone.
    #[error("supervisor control loop closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use livevisor::SupervisorError;
    ///
    /// let err = SupervisorError::InstanceBusy { id: 3 };
    /// assert_eq!(err.as_label(), "instance_busy");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::Configuration { .. } => "configuration_error",
            SupervisorError::EngineStart { .. } => "engine_start_error",
            SupervisorError::HotReloadRejected { .. } => "hot_reload_rejected",
            SupervisorError::InstanceBusy { .. } => "instance_busy",
            SupervisorError::UnknownInstance { .. } => "unknown_instance",
            SupervisorError::GraceExceeded { .. } => "grace_exceeded",
            SupervisorError::Closed => "supervisor_closed",
            SupervisorError::Store(_) => "store_error",
        }
    }

    /// Message shown to the owning instance.
    pub fn user_message(&self) -> String {
        match self {
            SupervisorError::Configuration { .. } => "Engine not found.".to_string(),
            SupervisorError::EngineStart { source, .. } => format!("Engine failed to start: {source}"),
            SupervisorError::HotReloadRejected { diagnostic, .. } => {
                format!("Code is faulty. {diagnostic}")
            }
            other => other.to_string(),
        }
    }
}

/// # Errors produced by engine lifecycle calls.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// Lifecycle call not valid in the engine's current state.
    #[error("invalid in state {state}: {op}")]
    InvalidState {
        op: &'static str,
        state: crate::engine::EngineState,
    },

    /// The runtime backend (interpreter, synth, renderer) could not be created.
    #[error("runtime unavailable: {0}")]
    Runtime(String),

    /// The audio output device could not be opened.
    #[error("output device unavailable: {0}")]
    Device(String),

    /// The worker thread could not be spawned.
    #[error("worker thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    /// Source text rejected before reaching the runtime.
    #[error("{0}")]
    Rejected(Diagnostic),
}

impl EngineError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::InvalidState { .. } => "engine_invalid_state",
            EngineError::Runtime(_) => "engine_runtime_unavailable",
            EngineError::Device(_) => "engine_device_unavailable",
            EngineError::Spawn(_) => "engine_spawn_failed",
            EngineError::Rejected(_) => "engine_source_rejected",
        }
    }
}

/// # Errors produced by durable config store writes.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("config store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config store document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::Io(_) => "store_io",
            StoreError::Malformed(_) => "store_malformed",
        }
    }
}
