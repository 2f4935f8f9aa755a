//! # Runtime backends behind the engine variants.
//!
//! Engines own the lifecycle (thread, cancellation, reload channel, state machine);
//! backends own the semantics. Each variant talks to exactly one backend trait:
//!
//! | Engine            | Backend                                  |
//! |-------------------|------------------------------------------|
//! | `Script`          | [`Interpreter`]                          |
//! | `AudioSynth`      | [`SampleSource`] (synth) + [`AudioOutput`] |
//! | `AudioScript`     | [`SampleSource`] (script) + [`AudioOutput`] |
//! | `Graphics`        | [`Renderer`]                             |
//!
//! [`Backends`] is the factory the supervisor is built with. Constructors run on the
//! control loop before a worker thread exists, so their failures surface as start
//! errors; the created objects then move to the worker and are only used there.
//!
//! [`ReferenceBackends`] wires the small built-in runtimes (`calc` interpreter, tone
//! synth, per-sample audio script, frame renderer) and an [`AudioDevice`].

pub mod calc;
mod device;
mod frames;
mod tone;

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::AudioFormat;
use crate::error::{Diagnostic, EngineError};
use crate::identity::Identity;

pub use calc::CalcInterpreter;
pub use device::{AudioDevice, AudioOutput, AudioStream, ChannelDevice, NullDevice};
pub use frames::{Frame, FrameRenderer};
pub use tone::{ScriptedSource, ToneSynth};

/// What a runtime wants after a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Normal end of program / stream.
    Done,
}

/// Persistent interpreter context of a script engine.
pub trait Interpreter: Send + 'static {
    /// Executes `source` in the persistent context. State defined earlier survives.
    fn exec(&mut self, title: &str, source: &str) -> Result<(), Diagnostic>;

    /// Gives the interpreter a slice of time between reloads.
    fn tick(&mut self) -> Result<Flow, Diagnostic>;
}

/// Audio producer of the two audio engines.
pub trait SampleSource: Send + 'static {
    /// Loads (or hot-loads) source into the persistent context.
    fn load(&mut self, title: &str, source: &str) -> Result<(), Diagnostic>;

    /// Next chunk of interleaved samples in `format`; `None` is end of stream.
    fn next_chunk(&mut self, format: &AudioFormat) -> Result<Option<Vec<f32>>, Diagnostic>;
}

/// Frame producer of the graphics engine.
pub trait Renderer: Send + 'static {
    /// Compiles (or recompiles) rendering source. A failed recompile keeps the previous program.
    fn compile(&mut self, title: &str, source: &str) -> Result<(), Diagnostic>;

    /// Renders frame `index` (0-based).
    fn render(&mut self, index: u64) -> Result<Flow, Diagnostic>;
}

/// Factory for runtime objects, one call per engine start.
pub trait Backends: Send + Sync + 'static {
    fn interpreter(&self, id: Identity) -> Result<Box<dyn Interpreter>, EngineError>;

    fn synth(&self, id: Identity) -> Result<Box<dyn SampleSource>, EngineError>;

    fn audio_script(&self, id: Identity) -> Result<Box<dyn SampleSource>, EngineError>;

    fn renderer(&self, id: Identity) -> Result<Box<dyn Renderer>, EngineError>;

    /// Opens an output holding at most `capacity` chunks before signalling backpressure.
    fn audio_output(
        &self,
        id: Identity,
        format: &AudioFormat,
        capacity: usize,
    ) -> Result<AudioOutput, EngineError>;
}

/// Built-in runtimes plus a pluggable audio device.
pub struct ReferenceBackends {
    device: Arc<dyn AudioDevice>,
    frames: broadcast::Sender<Frame>,
}

impl ReferenceBackends {
    /// Reference runtimes with audio going to `device`.
    pub fn new(device: Arc<dyn AudioDevice>) -> Self {
        let (frames, _rx) = broadcast::channel(64);
        Self { device, frames }
    }

    /// Reference runtimes with audio drained at real-time pace and discarded.
    pub fn silent() -> Self {
        Self::new(Arc::new(NullDevice))
    }

    /// Frames rendered by every graphics engine started from these backends.
    pub fn frames(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }
}

impl Backends for ReferenceBackends {
    fn interpreter(&self, _id: Identity) -> Result<Box<dyn Interpreter>, EngineError> {
        Ok(Box::new(CalcInterpreter::new()))
    }

    fn synth(&self, _id: Identity) -> Result<Box<dyn SampleSource>, EngineError> {
        Ok(Box::new(ToneSynth::new()))
    }

    fn audio_script(&self, _id: Identity) -> Result<Box<dyn SampleSource>, EngineError> {
        Ok(Box::new(ScriptedSource::new()))
    }

    fn renderer(&self, id: Identity) -> Result<Box<dyn Renderer>, EngineError> {
        Ok(Box::new(FrameRenderer::new(id, self.frames.clone())))
    }

    fn audio_output(
        &self,
        id: Identity,
        format: &AudioFormat,
        capacity: usize,
    ) -> Result<AudioOutput, EngineError> {
        self.device.open(id, format, capacity)
    }
}
