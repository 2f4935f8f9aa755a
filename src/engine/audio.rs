//! # Audio engines: sample production with output backpressure.
//!
//! Shared by `AudioSynth` and `AudioScript`; they differ only in the [`SampleSource`].
//!
//! ```text
//! step():
//!   pending empty? ── next_chunk() ── None ──► Done
//!        │                  └─ Some(chunk) → pending
//!        ▼
//!   try_reserve ── slot ──────────────► send(pending) → Continue
//!        └─ full → reserve().await ──► send(pending) → Continue
//! ```
//!
//! The chunk waiting for a slot lives in the program, not in the step future, so a
//! reload or cancellation that interrupts the wait loses nothing: the next step writes
//! that same chunk first.

use async_trait::async_trait;

use crate::backends::{AudioOutput, Flow, SampleSource};
use crate::config::AudioFormat;
use crate::engine::worker::Program;
use crate::error::{Diagnostic, EngineError};

pub(crate) struct AudioProgram {
    source: Box<dyn SampleSource>,
    output: AudioOutput,
    format: AudioFormat,
    pending: Option<Vec<f32>>,
    stalls: u64,
}

impl AudioProgram {
    pub(crate) fn new(source: Box<dyn SampleSource>, output: AudioOutput, format: AudioFormat) -> Self {
        Self {
            source,
            output,
            format,
            pending: None,
            stalls: 0,
        }
    }
}

fn device_failure(e: EngineError) -> Diagnostic {
    Diagnostic::new("DeviceError", e.to_string())
}

#[async_trait]
impl Program for AudioProgram {
    fn boot(&mut self, title: &str, source: &str) -> Result<(), Diagnostic> {
        self.source.load(title, source)
    }

    fn reload(&mut self, title: &str, source: &str) -> Result<(), Diagnostic> {
        self.source.load(title, source)
    }

    async fn step(&mut self) -> Result<Flow, Diagnostic> {
        if self.pending.is_none() {
            match self.source.next_chunk(&self.format)? {
                Some(chunk) => self.pending = Some(chunk),
                None => return Ok(Flow::Done),
            }
        }

        let permit = match self.output.try_reserve().map_err(device_failure)? {
            Some(permit) => permit,
            None => {
                self.stalls += 1;
                tracing::trace!(stalls = self.stalls, "audio output full, waiting for device");
                self.output.reserve().await.map_err(device_failure)?
            }
        };
        if let Some(chunk) = self.pending.take() {
            permit.send(chunk);
        }
        Ok(Flow::Continue)
    }
}
