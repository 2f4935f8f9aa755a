//! # Supervisor: instances, engines and their configuration.
//!
//! The [`Supervisor`] owns every map of the runtime (instances, live engines, the
//! identity set) and is driven by exactly one task, so none of them needs a lock.
//! Engine workers report over an unbounded channel the supervisor drains between
//! commands; see [`Supervisor::spawn`](crate::Supervisor::spawn) for the control loop.
//!
//! ## Architecture
//! ```text
//!                         ┌──────────────── Supervisor (control task) ────────────────┐
//! Instance ── command ──► │ instances: id → Weak<dyn Instance>                        │
//!                         │ engines:   id → Engine ── start/update/stop ──► worker    │
//!                         │ ids:       IdentitySet ── persisted ──► ConfigStore       │
//!                         └───────▲───────────────────────────────────────┬───────────┘
//!                                 │ EngineEvent {id, serial, kind}        │ publish(Event)
//!                           worker threads                                ▼
//!                                                                 Bus ──► SubscriberSet
//! ```
//!
//! ## Rules
//! - At most one live engine per identity; its variant never changes while it lives.
//! - An engine event is applied only if its serial matches the live engine for that
//!   identity. Anything else comes from an engine already torn down and is dropped.
//! - Erasing configuration on `unregister` is skipped while only one identity remains,
//!   so a host that immediately recreates a default instance keeps its settings.
//! - Teardown never waits on the control task: the engine leaves the map at once and
//!   its bounded stop runs in a spawned task that publishes `TeardownTimeout` and
//!   `EngineStopped` when it ends. [`Supervisor::shutdown`] waits for those tasks.
//! - Store write failures are logged and do not abort the operation.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::backends::Backends;
use crate::config::SupervisorConfig;
use crate::engine::{
    Engine, EngineContext, EngineEvent, EngineEventKind, EngineKind, EngineState, StopOutcome,
};
use crate::error::{Diagnostic, EngineError, StoreError, SupervisorError};
use crate::events::{Bus, Event, EventKind};
use crate::identity::{Identity, IdentitySet};
use crate::store::{ConfigStore, ENGINE_KEY, INSTANCES_KEY, Settings, WINDOW_COUNT_KEY};
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::supervisor::Instance;

/// Orchestrates instances, their engines and their configuration.
pub struct Supervisor {
    pub(crate) cfg: SupervisorConfig,
    store: Arc<dyn ConfigStore>,
    bus: Bus,
    ctx: EngineContext,
    events: mpsc::UnboundedReceiver<EngineEvent>,

    instances: BTreeMap<Identity, Weak<dyn Instance>>,
    engines: BTreeMap<Identity, Engine>,
    ids: IdentitySet,
    serial: u64,
    teardowns: JoinSet<(Identity, StopOutcome)>,

    listener: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Supervisor {
    /// Creates a supervisor. With subscribers, must be called inside a tokio runtime
    /// (one fan-out task and one worker per subscriber are spawned).
    pub fn new(
        cfg: SupervisorConfig,
        store: Arc<dyn ConfigStore>,
        backends: Arc<dyn Backends>,
        subscribers: Vec<Arc<dyn Subscribe>>,
    ) -> Self {
        let bus = Bus::new(cfg.bus_capacity_clamped());
        let (tx, events) = mpsc::unbounded_channel();
        let listener = (!subscribers.is_empty())
            .then(|| subscriber_listener(&bus, SubscriberSet::new(subscribers, bus.clone())));

        Self {
            ctx: EngineContext {
                backends,
                config: cfg.clone(),
                events: tx,
            },
            cfg,
            store,
            bus,
            events,
            instances: BTreeMap::new(),
            engines: BTreeMap::new(),
            ids: IdentitySet::new(),
            serial: 0,
            teardowns: JoinSet::new(),
            listener,
        }
    }

    /// Bus every lifecycle event is published on.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn ids(&self) -> &IdentitySet {
        &self.ids
    }

    pub fn is_registered(&self, id: Identity) -> bool {
        self.instance(id).is_some()
    }

    fn instance(&self, id: Identity) -> Option<Arc<dyn Instance>> {
        self.instances.get(&id).and_then(Weak::upgrade)
    }

    // ---- instances ----

    /// Registers `instance` under its identity. Returns `false` if one is already registered.
    ///
    /// With `discard_prior_config`, whatever was persisted for that identity is erased first.
    /// An engine left behind by a dropped instance with the same identity is torn down.
    pub fn register(&mut self, instance: &Arc<dyn Instance>, discard_prior_config: bool) -> bool {
        let id = instance.id();
        if self.is_registered(id) {
            return false;
        }
        // The previous instance under this identity was dropped without notice.
        if self.instances.remove(&id).is_some() {
            self.bus.publish(
                Event::new(EventKind::InstanceRemoved)
                    .with_instance(id)
                    .with_reason("dropped"),
            );
            self.teardown(id);
        }
        if discard_prior_config {
            self.erase_config(id);
        }
        self.instances.insert(id, Arc::downgrade(instance));
        self.ids.insert(id);
        self.persist_ids();
        self.bus.publish(Event::new(EventKind::InstanceRegistered).with_instance(id));
        true
    }

    /// Closes the instance and tears down its engine.
    ///
    /// A busy instance stays registered and [`SupervisorError::InstanceBusy`] is returned.
    /// With `erase_config`, configuration and identity are dropped too, unless `id` is the
    /// last identity left.
    pub fn unregister(&mut self, id: Identity, erase_config: bool) -> Result<(), SupervisorError> {
        if let Some(instance) = self.instance(id) {
            if !instance.close() {
                self.bus.publish(Event::new(EventKind::InstanceBusy).with_instance(id));
                return Err(SupervisorError::InstanceBusy { id });
            }
        }
        if self.instances.remove(&id).is_some() {
            self.bus.publish(
                Event::new(EventKind::InstanceRemoved)
                    .with_instance(id)
                    .with_reason("closed"),
            );
        }
        self.teardown(id);

        if erase_config && self.ids.len() > 1 {
            self.erase_config(id);
            self.ids.remove(id);
            self.persist_ids();
        }
        Ok(())
    }

    /// The instance announced it is closing.
    pub fn instance_closing(&mut self, id: Identity) -> Result<(), SupervisorError> {
        self.unregister(id, true)
    }

    /// The instance is gone without a close handshake. Configuration is kept.
    pub fn instance_destroyed(&mut self, id: Identity) {
        if self.instances.remove(&id).is_some() {
            self.bus.publish(
                Event::new(EventKind::InstanceRemoved)
                    .with_instance(id)
                    .with_reason("destroyed"),
            );
        }
        self.teardown(id);
    }

    /// Tries to close every known identity, keeping configuration.
    ///
    /// If some instances refuse, the identity set shrinks to exactly those and the
    /// configuration of the ones that closed is erased. If all close, identities and
    /// configuration stay as they are so the next start restores the same layout.
    /// Returns the identity set afterwards.
    pub fn close_all(&mut self) -> Vec<Identity> {
        let all = self.ids.to_vec();
        let mut survivors = IdentitySet::new();
        for id in all.iter().copied() {
            if self.unregister(id, false).is_err() {
                survivors.insert(id);
            }
        }

        if !survivors.is_empty() {
            for id in all.into_iter().filter(|id| !survivors.contains(*id)) {
                self.erase_config(id);
            }
            self.ids = survivors;
        }
        self.persist_ids();
        self.ids.to_vec()
    }

    // ---- engines ----

    /// Runs `source` for `id`: hot-reloads the live engine, or starts the configured one.
    pub fn run_code(&mut self, id: Identity, title: &str, source: &str) -> Result<(), SupervisorError> {
        let Some(instance) = self.instance(id) else {
            return Err(SupervisorError::UnknownInstance { id });
        };

        if let Some(engine) = self.engines.get(&id) {
            let kind = engine.kind();
            match engine.update(title, source) {
                Ok(()) => return Ok(()),
                Err(EngineError::Rejected(diagnostic)) => {
                    return Err(self.reload_rejected(&*instance, id, kind, diagnostic));
                }
                // Finished (terminal event not handled yet) or never started: replace it.
                Err(EngineError::InvalidState { state, .. }) => {
                    tracing::debug!(instance = id, %state, "live engine is not running, replacing it");
                    self.teardown(id);
                }
                Err(other) => {
                    let diagnostic = Diagnostic::new("EngineError", other.to_string());
                    return Err(self.reload_rejected(&*instance, id, kind, diagnostic));
                }
            }
        }

        let selector = self.store.get_scoped(id, ENGINE_KEY, Value::Null);
        let Some(kind) = EngineKind::from_selector(&selector) else {
            let err = SupervisorError::Configuration {
                id,
                selector: (!selector.is_null()).then_some(selector),
            };
            self.bus.publish(
                Event::new(EventKind::ConfigurationError)
                    .with_instance(id)
                    .with_reason(err.to_string()),
            );
            instance.code_stopped();
            instance.report_error(&err.user_message());
            return Err(err);
        };

        self.serial += 1;
        let mut engine = Engine::new(id, kind, self.serial);
        self.bus.publish(
            Event::new(EventKind::EngineStarting)
                .with_instance(id)
                .with_engine(kind)
                .with_serial(self.serial),
        );
        if let Err(source) = engine.start(title, source, &self.ctx) {
            let err = SupervisorError::EngineStart { id, kind, source };
            self.bus.publish(
                Event::new(EventKind::EngineStartFailed)
                    .with_instance(id)
                    .with_engine(kind)
                    .with_reason(err.to_string()),
            );
            instance.code_stopped();
            instance.report_error(&err.user_message());
            return Err(err);
        }

        self.engines.insert(id, engine);
        instance.code_started();
        Ok(())
    }

    /// Tears down the live engine of `id`, if any. Returns whether there was one.
    ///
    /// The engine is gone from the map when this returns; its worker is still given
    /// `stop_grace` to exit in the background.
    pub fn stop_code(&mut self, id: Identity) -> bool {
        self.teardown(id)
    }

    pub fn engine(&self, id: Identity) -> Option<&Engine> {
        self.engines.get(&id)
    }

    pub fn engine_state(&self, id: Identity) -> Option<EngineState> {
        self.engines.get(&id).map(Engine::state)
    }

    /// Identities with a live engine, ascending.
    pub fn live_engines(&self) -> Vec<Identity> {
        self.engines.keys().copied().collect()
    }

    fn reload_rejected(
        &self,
        instance: &dyn Instance,
        id: Identity,
        kind: EngineKind,
        diagnostic: Diagnostic,
    ) -> SupervisorError {
        let mut ev = Event::new(EventKind::ReloadRejected)
            .with_instance(id)
            .with_engine(kind)
            .with_reason(diagnostic.to_string());
        if let Some(line) = diagnostic.line {
            ev = ev.with_line(line);
        }
        self.bus.publish(ev);

        let err = SupervisorError::HotReloadRejected { id, diagnostic };
        instance.report_error(&err.user_message());
        err
    }

    /// Removes the engine of `id` and stops it off the control task.
    fn teardown(&mut self, id: Identity) -> bool {
        let Some(mut engine) = self.engines.remove(&id) else {
            return false;
        };
        let bus = self.bus.clone();
        let grace = self.cfg.stop_grace;
        self.teardowns.spawn(async move {
            let outcome = engine.stop(grace).await;
            publish_stopped(&bus, &engine, outcome, grace);
            (engine.id(), outcome)
        });
        true
    }

    /// Waits for the next engine event and applies it.
    pub async fn process_next_event(&mut self) -> bool {
        match self.events.recv().await {
            Some(ev) => {
                self.on_engine_event(ev);
                true
            }
            None => false,
        }
    }

    /// Next engine event or finished teardown, whichever comes first.
    pub(crate) async fn next_inbound(&mut self) -> Option<Inbound> {
        tokio::select! {
            biased;
            Some(res) = self.teardowns.join_next(), if !self.teardowns.is_empty() => {
                Some(Inbound::Reaped(res))
            }
            ev = self.events.recv() => ev.map(Inbound::Engine),
        }
    }

    pub(crate) fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Engine(ev) => self.on_engine_event(ev),
            Inbound::Reaped(Ok((id, outcome))) => {
                tracing::debug!(instance = id, ?outcome, "engine teardown finished");
            }
            Inbound::Reaped(Err(e)) => {
                tracing::warn!(error = %e, "engine teardown task failed");
            }
        }
    }

    /// Applies one engine event. Events from engines no longer live are dropped.
    pub fn on_engine_event(&mut self, ev: EngineEvent) {
        let EngineEvent { id, serial, kind: event } = ev;
        let Some(kind) = self
            .engines
            .get(&id)
            .filter(|e| e.serial() == serial)
            .map(Engine::kind)
        else {
            tracing::debug!(instance = id, serial, "dropping event of a torn-down engine");
            return;
        };
        let instance = self.instance(id);
        let base = Event::new(EventKind::EngineStarted)
            .with_instance(id)
            .with_engine(kind)
            .with_serial(serial);

        match event {
            EngineEventKind::Started => self.bus.publish(base),
            EngineEventKind::UpdateAccepted => self.bus.publish(Event {
                kind: EventKind::EngineReloaded,
                ..base
            }),
            EngineEventKind::UpdateRejected(diagnostic) => {
                // The engine keeps running; only the instance needs to know.
                match instance {
                    Some(instance) => {
                        self.reload_rejected(&*instance, id, kind, diagnostic);
                    }
                    None => self.bus.publish(Event {
                        kind: EventKind::ReloadRejected,
                        ..base
                    }),
                }
            }
            EngineEventKind::Completed(message) => {
                self.bus.publish(Event {
                    kind: EventKind::EngineCompleted,
                    ..base
                });
                self.finished(id, instance, message);
            }
            EngineEventKind::Failed(diagnostic) => {
                let mut ev = Event {
                    kind: EventKind::EngineFailed,
                    ..base
                }
                .with_reason(diagnostic.to_string());
                if let Some(line) = diagnostic.line {
                    ev = ev.with_line(line);
                }
                self.bus.publish(ev);
                self.finished(id, instance, diagnostic.to_string());
            }
        }
    }

    /// Terminal event: tear down, then forward the message whether error or normal end.
    fn finished(&mut self, id: Identity, instance: Option<Arc<dyn Instance>>, message: String) {
        self.teardown(id);
        if let Some(instance) = instance {
            instance.report_warning(&message);
            instance.code_stopped();
        }
    }

    /// Stops every live engine within the configured grace and waits for pending teardowns.
    ///
    /// Publishes `ShutdownRequested`, then `AllStoppedWithin` or `GraceExceeded`, and
    /// finally drains the subscribers. Identities whose workers had to be abandoned, here
    /// or by a teardown not yet reaped by the control loop, are listed in
    /// [`SupervisorError::GraceExceeded`].
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        let grace = self.cfg.stop_grace;

        let mut engines = std::mem::take(&mut self.engines);
        let outcomes =
            futures::future::join_all(engines.values_mut().map(|e| e.stop(grace))).await;

        let mut stuck = Vec::new();
        for (engine, outcome) in engines.values().zip(outcomes) {
            publish_stopped(&self.bus, engine, outcome, grace);
            if outcome == StopOutcome::Forced {
                stuck.push(engine.id());
            }
        }
        while let Some(res) = self.teardowns.join_next().await {
            match res {
                Ok((id, StopOutcome::Forced)) => stuck.push(id),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "engine teardown task failed"),
            }
        }
        stuck.sort_unstable();
        stuck.dedup();

        let res = if stuck.is_empty() {
            self.bus.publish(Event::new(EventKind::AllStoppedWithin));
            Ok(())
        } else {
            self.bus.publish(Event::new(EventKind::GraceExceeded).with_grace(grace));
            Err(SupervisorError::GraceExceeded { grace, stuck })
        };

        if let Some((stop, listener)) = self.listener.take() {
            stop.cancel();
            let _ = listener.await;
        }
        res
    }

    // ---- configuration ----

    /// Every key persisted for `id`.
    pub fn config(&self, id: Identity) -> Settings {
        self.store.all_scoped(id)
    }

    pub fn config_value(&self, id: Identity, key: &str, default: Value) -> Value {
        self.store.get_scoped(id, key, default)
    }

    pub fn set_config(&self, id: Identity, key: &str, value: Value) -> Result<(), SupervisorError> {
        self.store.set_scoped(id, key, value).map_err(|e| log_store_error(e, "set_config"))
    }

    pub fn set_config_batch(&self, id: Identity, entries: Settings) -> Result<(), SupervisorError> {
        self.store
            .set_scoped_batch(id, entries)
            .map_err(|e| log_store_error(e, "set_config_batch"))
    }

    /// Global (unscoped) key.
    pub fn setting(&self, key: &str, default: Value) -> Value {
        self.store.get(key, default)
    }

    pub fn set_setting(&self, key: &str, value: Value) -> Result<(), SupervisorError> {
        self.store.set(key, value).map_err(|e| log_store_error(e, "set_setting"))
    }

    /// Smallest identity not in use.
    pub fn next_id(&self) -> Identity {
        self.ids.next_free()
    }

    /// Identity set as persisted by the last run.
    pub fn persisted_ids(&self) -> IdentitySet {
        IdentitySet::from_value(&self.store.get(INSTANCES_KEY, Value::Array(Vec::new())))
    }

    /// Number of instances a fresh start opens (`window_count`, at least 1).
    pub fn default_instance_count(&self) -> usize {
        let raw = self.store.get(WINDOW_COUNT_KEY, Value::from(1));
        let count = match &raw {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        count.map_or(1, |c| usize::try_from(c).unwrap_or(0).max(1))
    }

    /// Identities the host should recreate at startup.
    ///
    /// The persisted set when there is one, otherwise `default_instance_count()` fresh
    /// identities.
    pub fn restore_plan(&self) -> Vec<Identity> {
        let persisted = self.persisted_ids();
        if !persisted.is_empty() {
            return persisted.to_vec();
        }
        let mut taken = self.ids.clone();
        (0..self.default_instance_count())
            .map(|_| {
                let id = taken.next_free();
                taken.insert(id);
                id
            })
            .collect()
    }

    fn erase_config(&self, id: Identity) {
        match self.store.erase_scoped(id) {
            Ok(()) => self.bus.publish(Event::new(EventKind::ConfigErased).with_instance(id)),
            Err(e) => {
                log_store_error(e, "erase_config");
            }
        }
    }

    fn persist_ids(&self) {
        if let Err(e) = self.store.set(INSTANCES_KEY, self.ids.to_value()) {
            log_store_error(e, "persist_ids");
        }
    }
}

/// What the control loop can receive besides commands.
pub(crate) enum Inbound {
    Engine(EngineEvent),
    Reaped(Result<(Identity, StopOutcome), JoinError>),
}

fn publish_stopped(bus: &Bus, engine: &Engine, outcome: StopOutcome, grace: Duration) {
    if outcome == StopOutcome::Forced {
        bus.publish(
            Event::new(EventKind::TeardownTimeout)
                .with_instance(engine.id())
                .with_engine(engine.kind())
                .with_serial(engine.serial())
                .with_grace(grace),
        );
    }
    bus.publish(
        Event::new(EventKind::EngineStopped)
            .with_instance(engine.id())
            .with_engine(engine.kind())
            .with_serial(engine.serial()),
    );
}

fn log_store_error(e: StoreError, op: &'static str) -> SupervisorError {
    tracing::warn!(op, label = e.as_label(), error = %e, "config store write failed");
    SupervisorError::Store(e)
}

/// Forwards bus events to the subscriber set until `stop` is cancelled, then drains it.
fn subscriber_listener(bus: &Bus, set: SubscriberSet) -> (CancellationToken, JoinHandle<()>) {
    let stop = CancellationToken::new();
    let token = stop.clone();
    let mut rx = bus.subscribe();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                res = rx.recv() => match res {
                    Ok(ev) => set.emit(&ev),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event listener lagged behind the bus");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = token.cancelled() => break,
            }
        }
        set.shutdown().await;
    });
    (stop, handle)
}
