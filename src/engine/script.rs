//! Script engine: a persistent interpreter context ticked at a fixed interval.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Interval, MissedTickBehavior};

use crate::backends::{Flow, Interpreter};
use crate::engine::worker::Program;
use crate::error::Diagnostic;

pub(crate) struct ScriptProgram {
    interp: Box<dyn Interpreter>,
    period: Duration,
    ticker: Option<Interval>,
}

impl ScriptProgram {
    pub(crate) fn new(interp: Box<dyn Interpreter>, period: Duration) -> Self {
        Self {
            interp,
            period,
            ticker: None,
        }
    }
}

#[async_trait]
impl Program for ScriptProgram {
    fn boot(&mut self, title: &str, source: &str) -> Result<(), Diagnostic> {
        self.interp.exec(title, source)
    }

    /// Same context as `boot`: whatever the earlier source defined is still there.
    fn reload(&mut self, title: &str, source: &str) -> Result<(), Diagnostic> {
        self.interp.exec(title, source)
    }

    async fn step(&mut self) -> Result<Flow, Diagnostic> {
        let period = self.period;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut t = time::interval(period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });
        ticker.tick().await;
        self.interp.tick()
    }
}
