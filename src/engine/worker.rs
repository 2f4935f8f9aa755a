//! # Engine worker: one OS thread, one current-thread runtime, one [`Program`].
//!
//! Every engine variant is a [`Program`]; this module owns the part they share.
//!
//! ## Loop
//! ```text
//! boot(source) ──Err──► Failed(diag)
//!     │ Ok
//!     ▼
//! Started
//! loop select! (biased) {
//!   ├─► token cancelled      → exit (no event)
//!   ├─► reload requested     → reload() → UpdateAccepted / UpdateRejected(diag)
//!   └─► step()               → Continue   → loop
//!                            → Done       → Completed("")
//!                            → Err(diag)  → Failed(diag)
//! }
//! ```
//!
//! ## Rules
//! - `step` must be cancel-safe: it is dropped whenever a reload or cancellation wins.
//! - Terminal events are only sent if the state moves out of `Running`, so an engine
//!   already stopped by the supervisor stays silent.
//! - A panic anywhere in the loop is caught on the thread and reported as `Failed`.
//! - The exit signal fires after the runtime is dropped, when nothing of the engine
//!   is left running.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use async_trait::async_trait;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backends::Flow;
use crate::engine::state::{EngineState, StateCell};
use crate::engine::{EngineEvent, EngineEventKind};
use crate::error::{Diagnostic, EngineError};
use crate::identity::Identity;
use crate::subscribers::panic_message;

/// Variant-specific body of an engine.
#[async_trait]
pub(crate) trait Program: Send + 'static {
    /// Loads the initial source.
    fn boot(&mut self, title: &str, source: &str) -> Result<(), Diagnostic>;

    /// Loads new source into the live context. A rejection leaves the previous program running.
    fn reload(&mut self, title: &str, source: &str) -> Result<(), Diagnostic>;

    /// One unit of work. Must be cancel-safe.
    async fn step(&mut self) -> Result<Flow, Diagnostic>;
}

/// Source handed to a running worker.
#[derive(Debug)]
pub(crate) struct Reload {
    pub(crate) title: String,
    pub(crate) source: String,
}

/// Runtime owned by a worker; never blocks when dropped, wherever that happens.
pub(crate) struct WorkerRuntime(Option<Runtime>);

impl WorkerRuntime {
    pub(crate) fn build() -> Result<Self, EngineError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map(|rt| Self(Some(rt)))
            .map_err(|e| EngineError::Runtime(format!("worker runtime: {e}")))
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        if let Some(rt) = self.0.take() {
            rt.shutdown_background();
        }
    }
}

/// Everything a worker thread needs.
pub(crate) struct Worker {
    pub(crate) id: Identity,
    pub(crate) serial: u64,
    pub(crate) program: Box<dyn Program>,
    pub(crate) updates: mpsc::UnboundedReceiver<Reload>,
    pub(crate) token: CancellationToken,
    pub(crate) state: StateCell,
    pub(crate) events: mpsc::UnboundedSender<EngineEvent>,
}

enum Next {
    Cancelled,
    Reload(Reload),
    Stepped(Result<Flow, Diagnostic>),
}

impl Worker {
    /// Spawns the worker thread. Returns the exit signal.
    pub(crate) fn spawn(
        self,
        runtime: WorkerRuntime,
        thread_name: String,
        title: String,
        source: String,
    ) -> Result<oneshot::Receiver<()>, EngineError> {
        let (exit_tx, exit_rx) = oneshot::channel();
        thread::Builder::new().name(thread_name).spawn(move || {
            let mut runtime = runtime;
            let (id, serial) = (self.id, self.serial);
            let state = self.state.clone();
            let events = self.events.clone();

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(rt) = runtime.0.as_ref() {
                    rt.block_on(self.run(title, source));
                }
            }));
            if let Err(payload) = outcome {
                let diag = Diagnostic::panic(panic_message(&*payload));
                tracing::error!(instance = id, serial, %diag, "engine worker panicked");
                if state.transition(EngineState::Running, EngineState::Failed) {
                    let _ = events.send(EngineEvent::new(id, serial, EngineEventKind::Failed(diag)));
                }
            }

            drop(runtime.0.take());
            let _ = exit_tx.send(());
        })?;
        Ok(exit_rx)
    }

    fn emit(&self, kind: EngineEventKind) {
        let _ = self.events.send(EngineEvent::new(self.id, self.serial, kind));
    }

    /// Terminal event, sent only if this worker is the one leaving `Running`.
    fn finish(&self, to: EngineState, kind: EngineEventKind) {
        if self.state.transition(EngineState::Running, to) {
            self.emit(kind);
        }
    }

    async fn run(mut self, title: String, source: String) {
        if let Err(diag) = self.program.boot(&title, &source) {
            self.finish(EngineState::Failed, EngineEventKind::Failed(diag));
            return;
        }
        self.emit(EngineEventKind::Started);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => Next::Cancelled,
                Some(reload) = self.updates.recv() => Next::Reload(reload),
                res = self.program.step() => Next::Stepped(res),
            };

            match next {
                Next::Cancelled => return,
                Next::Reload(Reload { title, source }) => match self.program.reload(&title, &source) {
                    Ok(()) => self.emit(EngineEventKind::UpdateAccepted),
                    Err(diag) => self.emit(EngineEventKind::UpdateRejected(diag)),
                },
                Next::Stepped(Ok(Flow::Continue)) => {}
                Next::Stepped(Ok(Flow::Done)) => {
                    self.finish(EngineState::Completed, EngineEventKind::Completed(String::new()));
                    return;
                }
                Next::Stepped(Err(diag)) => {
                    self.finish(EngineState::Failed, EngineEventKind::Failed(diag));
                    return;
                }
            }
        }
    }
}
