//! # livevisor
//!
//! **Livevisor** supervises live-coding instances: each instance (an editor window
//! in a host UI) can run one execution engine at a time, push new source into it
//! while it runs, and keeps its settings in a configuration store scoped by its
//! identity.
//!
//! The crate owns the orchestration only. Interpreters, synthesizers and renderers
//! sit behind the [`Backends`] traits; [`ReferenceBackends`] wires small built-in
//! runtimes so the whole pipeline works out of the box.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!  ┌────────────┐   ┌────────────┐   ┌────────────┐
//!  │ Instance 0 │   │ Instance 1 │   │ Instance 2 │    (host UI, weak refs only)
//!  └─────┬──────┘   └─────┬──────┘   └─────┬──────┘
//!        └────── SupervisorHandle (commands) ───────┐
//!                                                   ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Supervisor (single control task)                                 │
//! │  - instances: id → Weak<dyn Instance>                             │
//! │  - engines:   id → Engine (at most one per id)                    │
//! │  - ids:       IdentitySet, persisted in the ConfigStore           │
//! └──────┬──────────────────┬──────────────────┬───────────────▲──────┘
//!        ▼                  ▼                  ▼               │ EngineEvent
//!  ┌────────────┐     ┌────────────┐     ┌────────────┐        │ {id, serial}
//!  │ Script     │     │ AudioSynth │     │ Graphics   │ ───────┘
//!  │ (thread)   │     │ (thread)   │     │ (thread)   │
//!  └────────────┘     └────────────┘     └────────────┘
//!        │ publish(Event)
//!        ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                     Bus (broadcast channel)                       │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                      subscriber_listener ──► SubscriberSet
//!                                              (per-subscriber queues)
//! ```
//!
//! ### Engine lifecycle
//! ```text
//! run_code(id, source)
//!   ├─ live engine Running  ─► update(source) ─► UpdateAccepted / UpdateRejected
//!   └─ none                 ─► read `engine` selector from the store
//!          ├─ unknown       ─► ConfigurationError, instance notified
//!          └─ EngineKind    ─► Engine::start ─► Started
//!                                  ├─ Completed("")   ─► teardown, instance notified
//!                                  └─ Failed(diag)    ─► teardown, instance notified
//! stop_code / unregister / shutdown ─► cancel ─► wait `stop_grace` ─► Graceful / Forced
//!   (stop_code and unregister wait on a background task; the control loop keeps serving)
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                         |
//! |-------------------|--------------------------------------------------------------|--------------------------------------------|
//! | **Supervision**   | Instances, engines, identities, control loop.                | [`Supervisor`], [`SupervisorHandle`], [`Instance`] |
//! | **Engines**       | Per-instance execution with hot reload and bounded stop.     | [`Engine`], [`EngineKind`], [`EngineState`] |
//! | **Backends**      | Runtimes behind the engines.                                 | [`Backends`], [`ReferenceBackends`]        |
//! | **Configuration** | Scoped persistent settings and runtime tuning.               | [`ConfigStore`], [`SupervisorConfig`]      |
//! | **Subscriber API**| Hook into lifecycle events.                                  | [`Subscribe`], [`Event`]                   |
//! | **Errors**        | Typed errors and user-code diagnostics.                      | [`SupervisorError`], [`Diagnostic`]        |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//! use livevisor::{
//!     ENGINE_KEY, EngineKind, Identity, Instance, MemoryStore, ReferenceBackends, Supervisor,
//!     SupervisorConfig,
//! };
//!
//! struct Console(Identity);
//!
//! impl Instance for Console {
//!     fn id(&self) -> Identity { self.0 }
//!     fn close(&self) -> bool { true }
//!     fn report_error(&self, m: &str) { eprintln!("error: {m}"); }
//!     fn report_warning(&self, m: &str) { eprintln!("warning: {m}"); }
//!     fn code_stopped(&self) {}
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sup = Supervisor::new(
//!         SupervisorConfig::default(),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(ReferenceBackends::silent()),
//!         Vec::new(),
//!     );
//!     let (handle, join) = sup.spawn(CancellationToken::new());
//!
//!     let window: Arc<dyn Instance> = Arc::new(Console(0));
//!     handle.register(window.clone(), false).await?;
//!     handle.set_config(0, ENGINE_KEY, json!(EngineKind::Script.selector())).await?;
//!
//!     handle.run_code(0, "main", "x = 1").await?;
//!     handle.run_code(0, "main", "x = x + 1").await?; // hot reload
//!     handle.stop_code(0).await?;
//!
//!     handle.shutdown().await?;
//!     join.await??;
//!     Ok(())
//! }
//! ```

pub mod backends;
mod config;
mod engine;
mod error;
pub mod events;
mod identity;
pub mod store;
pub mod subscribers;
mod supervisor;

// ---- Public re-exports ----

pub use backends::{
    AudioDevice, AudioOutput, AudioStream, Backends, ChannelDevice, Flow, Frame, Interpreter,
    NullDevice, ReferenceBackends, Renderer, SampleSource,
};
pub use config::{AudioFormat, SupervisorConfig};
pub use engine::{
    Engine, EngineContext, EngineEvent, EngineEventKind, EngineKind, EngineState, StopOutcome,
};
pub use error::{Diagnostic, EngineError, StoreError, SupervisorError};
pub use events::{Bus, Event, EventKind};
pub use identity::{Identity, IdentitySet};
pub use store::{
    ConfigStore, ENGINE_KEY, FileStore, INSTANCES_KEY, MemoryStore, Settings, WINDOW_COUNT_KEY,
};
pub use subscribers::{Subscribe, SubscriberSet};
pub use supervisor::{Instance, Supervisor, SupervisorHandle};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
