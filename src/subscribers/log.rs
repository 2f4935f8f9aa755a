//! # LogWriter: events as structured `tracing` records
//!
//! A minimal subscriber that turns every [`Event`] into one `tracing` record on the
//! `livevisor::events` target. Failures and forced teardowns log at `warn`, routine
//! lifecycle at `info`/`debug`.
//!
//! ## Example output (fmt layer)
//! ```text
//! INFO livevisor::events: engine started instance=0 engine=script serial=1
//! WARN livevisor::events: engine failed instance=0 engine=script reason="NameError: 'y' at line 2" line=2
//! WARN livevisor::events: teardown timeout, worker abandoned instance=1 engine=audio-synth grace_ms=2000
//! ```

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let instance = e.instance;
        let engine = e.engine.map(|k| k.as_str());
        let serial = e.serial;
        let reason = e.reason.as_deref();

        match e.kind {
            EventKind::InstanceRegistered => {
                info!(target: "livevisor::events", ?instance, "instance registered")
            }
            EventKind::InstanceRemoved => {
                info!(target: "livevisor::events", ?instance, ?reason, "instance removed")
            }
            EventKind::InstanceBusy => {
                info!(target: "livevisor::events", ?instance, "instance refused to close")
            }
            EventKind::ConfigErased => {
                debug!(target: "livevisor::events", ?instance, "configuration erased")
            }
            EventKind::ConfigurationError => {
                warn!(target: "livevisor::events", ?instance, ?reason, "no usable engine configured")
            }
            EventKind::EngineStarting => {
                debug!(target: "livevisor::events", ?instance, ?engine, ?serial, "engine starting")
            }
            EventKind::EngineStartFailed => {
                warn!(target: "livevisor::events", ?instance, ?engine, ?reason, "engine failed to start")
            }
            EventKind::EngineStarted => {
                info!(target: "livevisor::events", ?instance, ?engine, ?serial, "engine started")
            }
            EventKind::EngineReloaded => {
                info!(target: "livevisor::events", ?instance, ?engine, ?serial, "engine reloaded")
            }
            EventKind::ReloadRejected => {
                warn!(target: "livevisor::events", ?instance, ?engine, ?reason, line = ?e.line, "reload rejected")
            }
            EventKind::EngineCompleted => {
                info!(target: "livevisor::events", ?instance, ?engine, ?serial, "engine completed")
            }
            EventKind::EngineFailed => {
                warn!(target: "livevisor::events", ?instance, ?engine, ?reason, line = ?e.line, "engine failed")
            }
            EventKind::EngineStopped => {
                info!(target: "livevisor::events", ?instance, ?engine, ?serial, "engine stopped")
            }
            EventKind::TeardownTimeout => {
                warn!(target: "livevisor::events", ?instance, ?engine, grace_ms = ?e.grace_ms, "teardown timeout, worker abandoned")
            }
            EventKind::ShutdownRequested => info!(target: "livevisor::events", "shutdown requested"),
            EventKind::AllStoppedWithin => {
                info!(target: "livevisor::events", "all engines stopped within grace")
            }
            EventKind::GraceExceeded => warn!(target: "livevisor::events", ?reason, "shutdown grace exceeded"),
            EventKind::SubscriberOverflow => {
                warn!(target: "livevisor::events", subscriber = ?e.subscriber, ?reason, "subscriber overflow")
            }
            EventKind::SubscriberPanicked => {
                warn!(target: "livevisor::events", subscriber = ?e.subscriber, ?reason, "subscriber panicked")
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
