//! # Execution engines.
//!
//! An [`Engine`] runs user source for one instance on a dedicated OS thread. The
//! variant is an [`EngineKind`] chosen once, at construction; the shared lifecycle
//! (state machine, reload channel, cancellation, exit signal) lives here, the
//! variant bodies live in `script`, `audio` and `graphics`.
//!
//! ## Architecture
//! ```text
//! control loop                               worker thread (current-thread runtime)
//! ────────────                               ──────────────────────────────────────
//! Engine::start ── backends + runtime ─────► Worker::run(program)
//! Engine::update ── Reload ── mpsc ────────►   select! { cancel | reload | step }
//! Engine::stop  ── CancellationToken ──────►
//!               ◄── exit signal (oneshot) ──  thread exit
//! Supervisor    ◄── EngineEvent (mpsc) ──────  Started / UpdateAccepted / UpdateRejected
//!                                              Completed / Failed
//! ```
//!
//! ## Rules
//! - Setup that can fail (backends, audio output, runtime, thread) happens inside
//!   [`Engine::start`]; a failed start leaves nothing running.
//! - [`Engine::update`] never changes the state; a rejected update leaves the previous
//!   program running.
//! - [`Engine::stop`] waits at most `grace` for the worker; past that the worker thread
//!   is detached and abandoned ([`StopOutcome::Forced`]).
//! - Every event carries the engine's `serial`; the supervisor drops events whose
//!   serial is no longer live.

mod audio;
mod graphics;
mod script;
mod state;
mod worker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::backends::Backends;
use crate::config::SupervisorConfig;
use crate::error::{Diagnostic, EngineError};
use crate::identity::Identity;

use audio::AudioProgram;
use graphics::GraphicsProgram;
use script::ScriptProgram;
use worker::{Program, Reload, Worker, WorkerRuntime};

pub use state::EngineState;
use state::StateCell;

/// Engine variant, persisted per instance as an integer selector.
///
/// | selector | variant       |
/// |----------|---------------|
/// | 0        | `AudioScript` |
/// | 1        | `AudioSynth`  |
/// | 2        | `Graphics`    |
/// | 3        | `Script`      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    AudioScript,
    AudioSynth,
    Graphics,
    Script,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] = [
        EngineKind::AudioScript,
        EngineKind::AudioSynth,
        EngineKind::Graphics,
        EngineKind::Script,
    ];

    /// Integer stored under the `engine` key.
    pub fn selector(self) -> i64 {
        match self {
            EngineKind::AudioScript => 0,
            EngineKind::AudioSynth => 1,
            EngineKind::Graphics => 2,
            EngineKind::Script => 3,
        }
    }

    /// Parses a stored selector. Numeric strings are accepted.
    ///
    /// # Example
    /// ```
    /// use livevisor::EngineKind;
    /// use serde_json::json;
    ///
    /// assert_eq!(EngineKind::from_selector(&json!(3)), Some(EngineKind::Script));
    /// assert_eq!(EngineKind::from_selector(&json!("1")), Some(EngineKind::AudioSynth));
    /// assert_eq!(EngineKind::from_selector(&json!(9)), None);
    /// ```
    pub fn from_selector(value: &Value) -> Option<Self> {
        let raw = match value {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Self::try_from(raw).ok()
    }

    /// Stable label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::AudioScript => "audio-script",
            EngineKind::AudioSynth => "audio-synth",
            EngineKind::Graphics => "graphics",
            EngineKind::Script => "script",
        }
    }
}

impl TryFrom<i64> for EngineKind {
    type Error = i64;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        EngineKind::ALL
            .into_iter()
            .find(|k| k.selector() == raw)
            .ok_or(raw)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`Engine::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker exited within the grace period (or never ran).
    Graceful,
    /// The worker was abandoned after the grace period.
    Forced,
}

/// Notification from a worker to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub id: Identity,
    /// Start serial of the engine that sent it.
    pub serial: u64,
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn new(id: Identity, serial: u64, kind: EngineEventKind) -> Self {
        Self { id, serial, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    /// Initial source loaded, loop entered.
    Started,
    UpdateAccepted,
    UpdateRejected(Diagnostic),
    /// Normal end of program or stream; the message is empty.
    Completed(String),
    Failed(Diagnostic),
}

/// What engines need from their owner at start.
#[derive(Clone)]
pub struct EngineContext {
    pub backends: Arc<dyn Backends>,
    pub config: SupervisorConfig,
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

/// Handle to one engine and its worker thread.
pub struct Engine {
    id: Identity,
    kind: EngineKind,
    serial: u64,
    state: StateCell,
    token: CancellationToken,
    updates: Option<mpsc::UnboundedSender<Reload>>,
    exited: Option<oneshot::Receiver<()>>,
}

impl Engine {
    /// New engine in `Idle`.
    pub fn new(id: Identity, kind: EngineKind, serial: u64) -> Self {
        Self {
            id,
            kind,
            serial,
            state: StateCell::new(EngineState::Idle),
            token: CancellationToken::new(),
            updates: None,
            exited: None,
        }
    }

    pub fn id(&self) -> Identity {
        self.id
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// `Idle → Running`: builds the variant, then spawns the worker that loads `source`.
    pub fn start(&mut self, title: &str, source: &str, ctx: &EngineContext) -> Result<(), EngineError> {
        let state = self.state.get();
        if state != EngineState::Idle {
            return Err(EngineError::InvalidState { op: "start", state });
        }

        let program = self.program(ctx)?;
        let runtime = WorkerRuntime::build()?;
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            id: self.id,
            serial: self.serial,
            program,
            updates: updates_rx,
            token: self.token.clone(),
            state: self.state.clone(),
            events: ctx.events.clone(),
        };

        self.state.set(EngineState::Running);
        let thread_name = format!("livevisor-{}-{}", self.kind, self.id);
        match worker.spawn(runtime, thread_name, title.to_string(), source.to_string()) {
            Ok(exited) => {
                self.updates = Some(updates_tx);
                self.exited = Some(exited);
                tracing::debug!(instance = self.id, engine = %self.kind, serial = self.serial, "engine worker spawned");
                Ok(())
            }
            Err(e) => {
                self.state.set(EngineState::Idle);
                Err(e)
            }
        }
    }

    fn program(&self, ctx: &EngineContext) -> Result<Box<dyn Program>, EngineError> {
        let cfg = &ctx.config;
        let backends = &ctx.backends;
        let program: Box<dyn Program> = match self.kind {
            EngineKind::Script => Box::new(ScriptProgram::new(
                backends.interpreter(self.id)?,
                cfg.tick_interval(),
            )),
            EngineKind::AudioSynth => {
                let source = backends.synth(self.id)?;
                let output = backends.audio_output(self.id, &cfg.audio, cfg.sink_capacity_clamped())?;
                Box::new(AudioProgram::new(source, output, cfg.audio))
            }
            EngineKind::AudioScript => {
                let source = backends.audio_script(self.id)?;
                let output = backends.audio_output(self.id, &cfg.audio, cfg.sink_capacity_clamped())?;
                Box::new(AudioProgram::new(source, output, cfg.audio))
            }
            EngineKind::Graphics => Box::new(GraphicsProgram::new(
                backends.renderer(self.id)?,
                cfg.frame_pacing(),
            )),
        };
        Ok(program)
    }

    /// Hands new source to the running worker.
    ///
    /// Empty source is rejected here; anything else is loaded by the worker, which
    /// answers with `UpdateAccepted` or `UpdateRejected`.
    pub fn update(&self, title: &str, source: &str) -> Result<(), EngineError> {
        let state = self.state.get();
        if state != EngineState::Running {
            return Err(EngineError::InvalidState { op: "update", state });
        }
        if source.trim().is_empty() {
            return Err(EngineError::Rejected(Diagnostic::new("SyntaxError", "empty source")));
        }
        let reload = Reload {
            title: title.to_string(),
            source: source.to_string(),
        };
        match &self.updates {
            Some(tx) if tx.send(reload).is_ok() => Ok(()),
            _ => Err(EngineError::InvalidState {
                op: "update",
                state: self.state.get(),
            }),
        }
    }

    /// Cancels the worker and waits up to `grace` for it to exit. Ends in `Stopped`.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        if self.state.get() == EngineState::Stopped {
            return StopOutcome::Graceful;
        }
        self.token.cancel();
        self.updates = None;

        let outcome = match self.exited.take() {
            None => StopOutcome::Graceful,
            Some(exited) => match time::timeout(grace, exited).await {
                Ok(_) => StopOutcome::Graceful,
                Err(_elapsed) => {
                    tracing::warn!(
                        instance = self.id,
                        engine = %self.kind,
                        serial = self.serial,
                        grace_ms = grace.as_millis() as u64,
                        "engine ignored cancellation, abandoning worker thread"
                    );
                    StopOutcome::Forced
                }
            },
        };
        self.state.set(EngineState::Stopped);
        outcome
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("serial", &self.serial)
            .field("state", &self.state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::backends::{
        AudioOutput, ChannelDevice, CalcInterpreter, Flow, Interpreter, ReferenceBackends, Renderer,
        SampleSource,
    };
    use crate::config::AudioFormat;

    struct Counting {
        produced: Arc<AtomicU32>,
    }

    impl SampleSource for Counting {
        fn load(&mut self, _title: &str, _source: &str) -> Result<(), Diagnostic> {
            Ok(())
        }

        fn next_chunk(&mut self, format: &AudioFormat) -> Result<Option<Vec<f32>>, Diagnostic> {
            let n = self.produced.fetch_add(1, Ordering::SeqCst);
            Ok(Some(vec![n as f32; format.chunk_samples()]))
        }
    }

    struct Sleepy;

    impl Interpreter for Sleepy {
        fn exec(&mut self, _title: &str, _source: &str) -> Result<(), Diagnostic> {
            Ok(())
        }

        fn tick(&mut self) -> Result<Flow, Diagnostic> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Flow::Continue)
        }
    }

    struct Panicky;

    impl Interpreter for Panicky {
        fn exec(&mut self, _title: &str, _source: &str) -> Result<(), Diagnostic> {
            Ok(())
        }

        fn tick(&mut self) -> Result<Flow, Diagnostic> {
            panic!("interpreter blew up");
        }
    }

    fn calc() -> Box<dyn Interpreter> {
        Box::new(CalcInterpreter::new())
    }

    fn sleepy() -> Box<dyn Interpreter> {
        Box::new(Sleepy)
    }

    fn panicky() -> Box<dyn Interpreter> {
        Box::new(Panicky)
    }

    struct Fixture {
        reference: ReferenceBackends,
        produced: Arc<AtomicU32>,
        interp: fn() -> Box<dyn Interpreter>,
    }

    impl Backends for Fixture {
        fn interpreter(&self, _id: Identity) -> Result<Box<dyn Interpreter>, EngineError> {
            Ok((self.interp)())
        }

        fn synth(&self, _id: Identity) -> Result<Box<dyn SampleSource>, EngineError> {
            Ok(Box::new(Counting {
                produced: self.produced.clone(),
            }))
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

    struct Harness {
        ctx: EngineContext,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        produced: Arc<AtomicU32>,
        streams: mpsc::UnboundedReceiver<(Identity, crate::backends::AudioStream)>,
    }

    fn harness(interp: fn() -> Box<dyn Interpreter>) -> Harness {
        let (device, streams) = ChannelDevice::new();
        let produced = Arc::new(AtomicU32::new(0));
        let backends = Fixture {
            reference: ReferenceBackends::new(Arc::new(device)),
            produced: produced.clone(),
            interp,
        };
        let config = SupervisorConfig {
            tick: Duration::from_millis(1),
            frame_interval: Duration::from_millis(1),
            sink_capacity: 2,
            audio: AudioFormat {
                sample_rate: 8_000,
                channels: 1,
                chunk_frames: 4,
            },
            ..SupervisorConfig::default()
        };
        let (tx, events) = mpsc::unbounded_channel();
        Harness {
            ctx: EngineContext {
                backends: Arc::new(backends),
                config,
                events: tx,
            },
            events,
            produced,
            streams,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEventKind {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("engine event in time")
            .expect("event channel open")
            .kind
    }

    #[test]
    fn test_selector_mapping_is_closed() {
        for kind in EngineKind::ALL {
            assert_eq!(EngineKind::try_from(kind.selector()), Ok(kind));
        }
        assert_eq!(EngineKind::try_from(4), Err(4));
        assert_eq!(EngineKind::try_from(-1), Err(-1));
        assert_eq!(EngineKind::from_selector(&Value::Null), None);
        assert_eq!(EngineKind::from_selector(&serde_json::json!(2.5)), None);
    }

    #[tokio::test]
    async fn test_script_hot_reload_keeps_running() {
        let mut h = harness(calc);
        let mut engine = Engine::new(0, EngineKind::Script, 1);
        assert_eq!(engine.state(), EngineState::Idle);

        engine.start("t", "x = 1", &h.ctx).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::Started);

        engine.update("t", "x = x + 1").unwrap();
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::UpdateAccepted);
        assert_eq!(engine.state(), EngineState::Running);

        engine.update("t", "y = 1\nz = nope").unwrap();
        match next_event(&mut h.events).await {
            EngineEventKind::UpdateRejected(d) => {
                assert_eq!(d.kind, "NameError");
                assert_eq!(d.line, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Running);

        assert!(matches!(engine.update("t", "  \n"), Err(EngineError::Rejected(_))));

        assert_eq!(engine.stop(Duration::from_secs(1)).await, StopOutcome::Graceful);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(
            engine.update("t", "x = 3"),
            Err(EngineError::InvalidState { op: "update", .. })
        ));
    }

    #[tokio::test]
    async fn test_deeply_nested_reload_is_rejected_and_engine_survives() {
        let mut h = harness(calc);
        let mut engine = Engine::new(0, EngineKind::Script, 1);
        engine.start("t", "x = 1", &h.ctx).unwrap();
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::Started);

        let depth = 100_000;
        for source in [
            format!("x = {}1{}", "(".repeat(depth), ")".repeat(depth)),
            format!("x = {}1", "-".repeat(depth)),
        ] {
            engine.update("t", &source).unwrap();
            match next_event(&mut h.events).await {
                EngineEventKind::UpdateRejected(d) => {
                    assert_eq!(d.kind, "SyntaxError");
                    assert_eq!(d.line, Some(1));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        engine.update("t", "x = x + 1").unwrap();
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::UpdateAccepted);
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.stop(Duration::from_secs(1)).await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_script_failure_reports_line() {
        let mut h = harness(calc);
        let mut engine = Engine::new(3, EngineKind::Script, 9);
        engine.start("t", "a = 1\nb = a / 0", &h.ctx).unwrap();

        let ev = time::timeout(Duration::from_secs(2), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((ev.id, ev.serial), (3, 9));
        match ev.kind {
            EngineEventKind::Failed(d) => {
                assert_eq!(d.kind, "ZeroDivisionError");
                assert_eq!(d.line, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Failed);
        assert_eq!(engine.stop(Duration::from_secs(1)).await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_script_completion_has_empty_message() {
        let mut h = harness(calc);
        let mut engine = Engine::new(0, EngineKind::Script, 1);
        engine.start("t", "done = 1", &h.ctx).unwrap();
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::Started);
        assert_eq!(
            next_event(&mut h.events).await,
            EngineEventKind::Completed(String::new())
        );
        assert_eq!(engine.state(), EngineState::Completed);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let h = harness(calc);
        let mut engine = Engine::new(0, EngineKind::Script, 1);
        engine.start("t", "x = 1", &h.ctx).unwrap();
        assert!(matches!(
            engine.start("t", "x = 1", &h.ctx),
            Err(EngineError::InvalidState { op: "start", state: EngineState::Running })
        ));
        engine.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_graceful() {
        let mut engine = Engine::new(0, EngineKind::Graphics, 1);
        assert_eq!(engine.stop(Duration::ZERO).await, StopOutcome::Graceful);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.stop(Duration::ZERO).await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_unresponsive_worker_is_abandoned() {
        let mut h = harness(sleepy);
        let mut engine = Engine::new(0, EngineKind::Script, 1);
        engine.start("t", "", &h.ctx).unwrap();
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::Started);
        // Let the worker enter its blocking tick.
        time::sleep(Duration::from_millis(30)).await;

        assert_eq!(engine.stop(Duration::from_millis(20)).await, StopOutcome::Forced);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let mut h = harness(panicky);
        let mut engine = Engine::new(0, EngineKind::Script, 1);
        engine.start("t", "", &h.ctx).unwrap();
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::Started);
        match next_event(&mut h.events).await {
            EngineEventKind::Failed(d) => {
                assert_eq!(d.kind, "Panic");
                assert!(d.message.contains("interpreter blew up"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_audio_backpressure_pauses_producer_and_keeps_every_chunk() {
        let mut h = harness(calc);
        let mut engine = Engine::new(5, EngineKind::AudioSynth, 1);
        engine.start("t", "", &h.ctx).unwrap();
        let (id, mut stream) = h.streams.recv().await.unwrap();
        assert_eq!(id, 5);
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::Started);

        // Nobody reads: two chunks queued, one pending, producer parked.
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.produced.load(Ordering::SeqCst), 3);
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.produced.load(Ordering::SeqCst), 3);

        for expected in 0..20 {
            let chunk = time::timeout(Duration::from_secs(2), stream.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(chunk, vec![expected as f32; 4]);
        }

        // A reload while parked on the device does not lose the pending chunk.
        engine.update("t", "freq = 1").unwrap();
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::UpdateAccepted);
        for expected in 20..30 {
            let chunk = stream.recv().await.unwrap();
            assert_eq!(chunk[0], expected as f32);
        }

        assert_eq!(engine.stop(Duration::from_secs(1)).await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_audio_script_start_failure_carries_diagnostic() {
        let mut h = harness(calc);
        let mut engine = Engine::new(0, EngineKind::AudioScript, 1);
        engine.start("t", "x = 1", &h.ctx).unwrap();
        match next_event(&mut h.events).await {
            EngineEventKind::Failed(d) => assert_eq!(d.kind, "NameError"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_graphics_renders_until_done() {
        let mut h = harness(calc);
        let (device, _streams) = ChannelDevice::new();
        let reference = ReferenceBackends::new(Arc::new(device));
        let mut frames = reference.frames();
        h.ctx.backends = Arc::new(reference);

        let mut engine = Engine::new(2, EngineKind::Graphics, 1);
        engine.start("g", "x = frame\ndone = max(frame - 1, 0)", &h.ctx).unwrap();
        assert_eq!(next_event(&mut h.events).await, EngineEventKind::Started);
        assert_eq!(
            next_event(&mut h.events).await,
            EngineEventKind::Completed(String::new())
        );

        let indices: Vec<u64> = std::iter::from_fn(|| frames.try_recv().ok()).map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
