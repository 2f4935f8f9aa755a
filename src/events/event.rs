//! # Runtime events emitted by the supervisor and the engines.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Instance events**: registration, close handshake, destruction
//! - **Engine lifecycle events**: starting, started, reloads, completion, failure, teardown
//! - **Shutdown events**: control-loop exit and grace handling
//! - **Subscriber events**: overflow and panics inside observers
//!
//! The [`Event`] struct carries additional metadata such as the instance identity,
//! engine variant, reason text and source line.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use livevisor::{EngineKind, Event, EventKind};
//!
//! let ev = Event::new(EventKind::EngineFailed)
//!     .with_instance(2)
//!     .with_engine(EngineKind::Script)
//!     .with_reason("NameError: 'x' at line 4")
//!     .with_line(4);
//!
//! assert_eq!(ev.kind, EventKind::EngineFailed);
//! assert_eq!(ev.instance, Some(2));
//! assert_eq!(ev.line, Some(4));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use crate::engine::EngineKind;
use crate::identity::Identity;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Instance events ===
    /// Instance registered with the supervisor.
    ///
    /// Sets:
    /// - `instance`: identity
    InstanceRegistered,

    /// Instance closed (or was destroyed) and was removed.
    ///
    /// Sets:
    /// - `instance`: identity
    /// - `reason`: `"closed"` or `"destroyed"`
    InstanceRemoved,

    /// Instance refused to close.
    ///
    /// Sets:
    /// - `instance`: identity
    InstanceBusy,

    /// Persisted configuration of an identity was erased.
    ///
    /// Sets:
    /// - `instance`: identity
    ConfigErased,

    /// No usable engine variant configured for a run request.
    ///
    /// Sets:
    /// - `instance`: identity
    /// - `reason`: stored selector, if any
    ConfigurationError,

    // === Engine lifecycle events ===
    /// Engine constructed and worker about to spawn.
    ///
    /// Sets:
    /// - `instance`, `engine`, `serial`
    EngineStarting,

    /// Engine setup failed; nothing was registered.
    ///
    /// Sets:
    /// - `instance`, `engine`
    /// - `reason`: start error
    EngineStartFailed,

    /// Worker loaded its initial source and entered the execution loop.
    ///
    /// Sets:
    /// - `instance`, `engine`, `serial`
    EngineStarted,

    /// New source was loaded into a running engine.
    ///
    /// Sets:
    /// - `instance`, `engine`, `serial`
    EngineReloaded,

    /// New source was rejected; the engine keeps its previous program.
    ///
    /// Sets:
    /// - `instance`, `engine`, `serial`
    /// - `reason`, `line` (when known)
    ReloadRejected,

    /// Engine reached end of stream.
    ///
    /// Sets:
    /// - `instance`, `engine`, `serial`
    EngineCompleted,

    /// Engine loop failed.
    ///
    /// Sets:
    /// - `instance`, `engine`, `serial`
    /// - `reason`, `line` (when known)
    EngineFailed,

    /// Engine worker exited and its record was removed.
    ///
    /// Sets:
    /// - `instance`, `engine`, `serial`
    EngineStopped,

    /// Cooperative stop did not finish in time; the worker was abandoned.
    ///
    /// Sets:
    /// - `instance`, `engine`, `serial`
    /// - `grace_ms`: configured grace
    TeardownTimeout,

    // === Shutdown events ===
    /// Control loop is shutting down (token cancelled or OS signal observed).
    ShutdownRequested,

    /// Every engine exited within the grace period.
    AllStoppedWithin,

    /// At least one engine had to be abandoned during shutdown.
    GraceExceeded,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Instance identity, if applicable.
    pub instance: Option<Identity>,
    /// Engine variant, if applicable.
    pub engine: Option<EngineKind>,
    /// Engine start serial, if applicable.
    pub serial: Option<u64>,
    /// Human-readable reason (errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
    /// Source line the reason refers to.
    pub line: Option<u32>,
    /// Grace period in milliseconds (compact).
    pub grace_ms: Option<u32>,
    /// Subscriber name for subscriber events.
    pub subscriber: Option<&'static str>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            instance: None,
            engine: None,
            serial: None,
            reason: None,
            line: None,
            grace_ms: None,
            subscriber: None,
        }
    }

    #[inline]
    pub fn with_instance(mut self, id: Identity) -> Self {
        self.instance = Some(id);
        self
    }

    #[inline]
    pub fn with_engine(mut self, kind: EngineKind) -> Self {
        self.engine = Some(kind);
        self
    }

    #[inline]
    pub fn with_serial(mut self, serial: u64) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[inline]
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// Attaches a grace duration (stored as milliseconds).
    #[inline]
    pub fn with_grace(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.grace_ms = Some(ms);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        let mut ev = Event::new(EventKind::SubscriberOverflow)
            .with_reason(format!("subscriber={subscriber} reason={reason}"));
        ev.subscriber = Some(subscriber);
        ev
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        let mut ev = Event::new(EventKind::SubscriberPanicked).with_reason(info);
        ev.subscriber = Some(subscriber);
        ev
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }
}
