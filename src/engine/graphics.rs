//! Graphics engine: a paced frame loop over a [`Renderer`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Interval, MissedTickBehavior};

use crate::backends::{Flow, Renderer};
use crate::engine::worker::Program;
use crate::error::Diagnostic;

pub(crate) struct GraphicsProgram {
    renderer: Box<dyn Renderer>,
    pacing: Duration,
    ticker: Option<Interval>,
    frame: u64,
}

impl GraphicsProgram {
    pub(crate) fn new(renderer: Box<dyn Renderer>, pacing: Duration) -> Self {
        Self {
            renderer,
            pacing,
            ticker: None,
            frame: 0,
        }
    }
}

#[async_trait]
impl Program for GraphicsProgram {
    fn boot(&mut self, title: &str, source: &str) -> Result<(), Diagnostic> {
        self.renderer.compile(title, source)
    }

    fn reload(&mut self, title: &str, source: &str) -> Result<(), Diagnostic> {
        self.renderer.compile(title, source)
    }

    async fn step(&mut self) -> Result<Flow, Diagnostic> {
        let pacing = self.pacing;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut t = time::interval(pacing);
            // Late frames are skipped rather than rendered in a burst.
            t.set_missed_tick_behavior(MissedTickBehavior::Skip);
            t
        });
        ticker.tick().await;

        let flow = self.renderer.render(self.frame)?;
        self.frame += 1;
        Ok(flow)
    }
}
