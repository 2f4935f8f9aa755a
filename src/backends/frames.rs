//! Frame renderer of the graphics engine.
//!
//! Rendering source is a `calc` program evaluated once per frame with `frame` (index)
//! and `time` (seconds at 60 fps) set. Every variable the program leaves behind is
//! published as a [`Frame`] on a broadcast channel; whoever displays frames subscribes
//! there. Publishing never blocks: without subscribers frames are simply dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::backends::calc::{Calc, Program};
use crate::backends::{Flow, Renderer};
use crate::error::Diagnostic;
use crate::identity::Identity;

const NOMINAL_FPS: f64 = 60.0;

/// One rendered frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub instance: Identity,
    pub index: u64,
    pub values: Arc<BTreeMap<String, f64>>,
}

/// [`Renderer`] backed by a `calc` program.
pub struct FrameRenderer {
    id: Identity,
    calc: Calc,
    program: Option<Program>,
    out: broadcast::Sender<Frame>,
}

impl FrameRenderer {
    pub fn new(id: Identity, out: broadcast::Sender<Frame>) -> Self {
        Self {
            id,
            calc: Calc::new(),
            program: None,
            out,
        }
    }

    fn prepare(calc: &mut Calc, index: u64) {
        calc.set("frame", index as f64);
        calc.set("time", index as f64 / NOMINAL_FPS);
    }
}

impl Renderer for FrameRenderer {
    fn compile(&mut self, _title: &str, source: &str) -> Result<(), Diagnostic> {
        let program = Program::parse(source)?;
        let mut staged = self.calc.clone();
        Self::prepare(&mut staged, 0);
        staged.run(&program)?;
        self.program = Some(program);
        Ok(())
    }

    fn render(&mut self, index: u64) -> Result<Flow, Diagnostic> {
        let Some(program) = self.program.as_ref() else {
            return Ok(Flow::Continue);
        };
        Self::prepare(&mut self.calc, index);
        self.calc.run(program)?;

        let _ = self.out.send(Frame {
            instance: self.id,
            index,
            values: Arc::new(self.calc.vars().clone()),
        });
        Ok(if self.calc.is_done() { Flow::Done } else { Flow::Continue })
    }
}
