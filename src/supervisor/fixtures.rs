//! Test doubles shared by the supervisor tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backends::{
    AudioOutput, Backends, CalcInterpreter, Flow, Interpreter, ReferenceBackends, Renderer,
    SampleSource,
};
use crate::config::AudioFormat;
use crate::error::{Diagnostic, EngineError};
use crate::identity::Identity;
use crate::supervisor::Instance;

/// Instance recording every callback as `"error:.."`, `"warning:.."`, `"started"`, `"stopped"`.
pub(crate) struct Window {
    id: Identity,
    accept_close: AtomicBool,
    log: Mutex<Vec<String>>,
}

impl Window {
    pub(crate) fn new(id: Identity) -> Arc<Self> {
        Arc::new(Self {
            id,
            accept_close: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Refuses every close request from now on.
    pub(crate) fn busy(self: &Arc<Self>) -> Arc<Self> {
        self.accept_close.store(false, Ordering::SeqCst);
        self.clone()
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl Instance for Window {
    fn id(&self) -> Identity {
        self.id
    }

    fn close(&self) -> bool {
        self.accept_close.load(Ordering::SeqCst)
    }

    fn report_error(&self, message: &str) {
        self.push(format!("error:{message}"));
    }

    fn report_warning(&self, message: &str) {
        self.push(format!("warning:{message}"));
    }

    fn code_started(&self) {
        self.push("started".to_string());
    }

    fn code_stopped(&self) {
        self.push("stopped".to_string());
    }
}

/// Interpreter whose every tick blocks the worker thread.
struct Stalling(Duration);

impl Interpreter for Stalling {
    fn exec(&mut self, _title: &str, _source: &str) -> Result<(), Diagnostic> {
        Ok(())
    }

    fn tick(&mut self) -> Result<Flow, Diagnostic> {
        std::thread::sleep(self.0);
        Ok(Flow::Continue)
    }
}

/// Reference backends, except that script engines of `stalled` identities ignore
/// cancellation for `stall` at a time.
pub(crate) struct StallingBackends {
    reference: ReferenceBackends,
    stalled: Vec<Identity>,
    stall: Duration,
}

impl StallingBackends {
    pub(crate) fn new(stalled: Vec<Identity>, stall: Duration) -> Self {
        Self {
            reference: ReferenceBackends::silent(),
            stalled,
            stall,
        }
    }
}

impl Backends for StallingBackends {
    fn interpreter(&self, id: Identity) -> Result<Box<dyn Interpreter>, EngineError> {
        if self.stalled.contains(&id) {
            Ok(Box::new(Stalling(self.stall)))
        } else {
            Ok(Box::new(CalcInterpreter::new()))
        }
    }

    fn synth(&self, id: Identity) -> Result<Box<dyn SampleSource>, EngineError> {
        self.reference.synth(id)
    }

    fn audio_script(&self, id: Identity) -> Result<Box<dyn SampleSource>, EngineError> {
        self.reference.audio_script(id)
    }

    fn renderer(&self, id: Identity) -> Result<Box<dyn Renderer>, EngineError> {
        self.reference.renderer(id)
    }

    fn audio_output(
        &self,
        id: Identity,
        format: &AudioFormat,
        capacity: usize,
    ) -> Result<AudioOutput, EngineError> {
        self.reference.audio_output(id, format, capacity)
    }
}
