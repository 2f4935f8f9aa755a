//! # Control loop and its handle.
//!
//! [`Supervisor::spawn`] starts the single task that owns the supervisor. Everything else
//! talks to it through a cloneable [`SupervisorHandle`]: each call becomes a
//! [`Command`] on a bounded queue and waits for the reply on a oneshot.
//!
//! ```text
//! SupervisorHandle ── Command{.., reply} ──► mpsc (bounded) ──┐
//!                                                             ▼
//! engine workers ── EngineEvent ──► mpsc (unbounded) ──► control loop  (select!, biased)
//! teardown tasks ── (id, StopOutcome) ──► JoinSet ───────────►  │
//! OS signal / CancellationToken ─────────────────────────────►  │
//!                                                               └─► shutdown() on exit
//! ```
//!
//! ## Rules
//! - Commands and engine events are handled one at a time, in arrival order per queue.
//!   No handler waits on an engine, so a stuck worker never delays other identities.
//! - The loop ends on a cancelled token, an OS termination signal, an explicit
//!   [`SupervisorHandle::shutdown`], or when every handle is dropped. It then runs
//!   [`Supervisor::shutdown`] and returns its result.
//! - Once the loop is gone every handle call fails with [`SupervisorError::Closed`].

use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineState;
use crate::error::SupervisorError;
use crate::identity::Identity;
use crate::store::Settings;
use crate::supervisor::core::Inbound;
use crate::supervisor::shutdown::wait_for_shutdown_signal;
use crate::supervisor::{Instance, Supervisor};

type Reply<T> = oneshot::Sender<T>;

/// Requests understood by the control loop.
pub(crate) enum Command {
    Register {
        instance: Arc<dyn Instance>,
        discard_prior_config: bool,
        reply: Reply<bool>,
    },
    Unregister {
        id: Identity,
        erase_config: bool,
        reply: Reply<Result<(), SupervisorError>>,
    },
    Closing {
        id: Identity,
        reply: Reply<Result<(), SupervisorError>>,
    },
    Destroyed {
        id: Identity,
        reply: Reply<()>,
    },
    CloseAll {
        reply: Reply<Vec<Identity>>,
    },
    RunCode {
        id: Identity,
        title: String,
        source: String,
        reply: Reply<Result<(), SupervisorError>>,
    },
    StopCode {
        id: Identity,
        reply: Reply<bool>,
    },
    EngineState {
        id: Identity,
        reply: Reply<Option<EngineState>>,
    },
    Config {
        id: Identity,
        reply: Reply<Settings>,
    },
    ConfigValue {
        id: Identity,
        key: String,
        default: Value,
        reply: Reply<Value>,
    },
    SetConfig {
        id: Identity,
        key: String,
        value: Value,
        reply: Reply<Result<(), SupervisorError>>,
    },
    SetConfigBatch {
        id: Identity,
        entries: Settings,
        reply: Reply<Result<(), SupervisorError>>,
    },
    Setting {
        key: String,
        default: Value,
        reply: Reply<Value>,
    },
    SetSetting {
        key: String,
        value: Value,
        reply: Reply<Result<(), SupervisorError>>,
    },
    NextId {
        reply: Reply<Identity>,
    },
    RestorePlan {
        reply: Reply<Vec<Identity>>,
    },
    Shutdown,
}

/// Cloneable handle to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// See [`Supervisor::register`].
    pub async fn register(
        &self,
        instance: Arc<dyn Instance>,
        discard_prior_config: bool,
    ) -> Result<bool, SupervisorError> {
        self.request(|reply| Command::Register {
            instance,
            discard_prior_config,
            reply,
        })
        .await
    }

    /// See [`Supervisor::unregister`].
    pub async fn unregister(&self, id: Identity, erase_config: bool) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Unregister {
            id,
            erase_config,
            reply,
        })
        .await?
    }

    pub async fn instance_closing(&self, id: Identity) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Closing { id, reply }).await?
    }

    pub async fn instance_destroyed(&self, id: Identity) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Destroyed { id, reply }).await
    }

    /// See [`Supervisor::close_all`].
    pub async fn close_all(&self) -> Result<Vec<Identity>, SupervisorError> {
        self.request(|reply| Command::CloseAll { reply }).await
    }

    /// See [`Supervisor::run_code`].
    pub async fn run_code(
        &self,
        id: Identity,
        title: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), SupervisorError> {
        let (title, source) = (title.into(), source.into());
        self.request(|reply| Command::RunCode {
            id,
            title,
            source,
            reply,
        })
        .await?
    }

    /// See [`Supervisor::stop_code`].
    pub async fn stop_code(&self, id: Identity) -> Result<bool, SupervisorError> {
        self.request(|reply| Command::StopCode { id, reply }).await
    }

    pub async fn engine_state(&self, id: Identity) -> Result<Option<EngineState>, SupervisorError> {
        self.request(|reply| Command::EngineState { id, reply }).await
    }

    pub async fn config(&self, id: Identity) -> Result<Settings, SupervisorError> {
        self.request(|reply| Command::Config { id, reply }).await
    }

    pub async fn config_value(
        &self,
        id: Identity,
        key: impl Into<String>,
        default: Value,
    ) -> Result<Value, SupervisorError> {
        let key = key.into();
        self.request(|reply| Command::ConfigValue {
            id,
            key,
            default,
            reply,
        })
        .await
    }

    pub async fn set_config(
        &self,
        id: Identity,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), SupervisorError> {
        let key = key.into();
        self.request(|reply| Command::SetConfig { id, key, value, reply })
            .await?
    }

    pub async fn set_config_batch(&self, id: Identity, entries: Settings) -> Result<(), SupervisorError> {
        self.request(|reply| Command::SetConfigBatch { id, entries, reply })
            .await?
    }

    pub async fn setting(&self, key: impl Into<String>, default: Value) -> Result<Value, SupervisorError> {
        let key = key.into();
        self.request(|reply| Command::Setting { key, default, reply })
            .await
    }

    pub async fn set_setting(&self, key: impl Into<String>, value: Value) -> Result<(), SupervisorError> {
        let key = key.into();
        self.request(|reply| Command::SetSetting { key, value, reply })
            .await?
    }

    pub async fn next_id(&self) -> Result<Identity, SupervisorError> {
        self.request(|reply| Command::NextId { reply }).await
    }

    pub async fn restore_plan(&self) -> Result<Vec<Identity>, SupervisorError> {
        self.request(|reply| Command::RestorePlan { reply }).await
    }

    /// Asks the control loop to shut down. The outcome is the loop's return value.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| SupervisorError::Closed)
    }
}

enum Step {
    Stop(&'static str),
    Inbound(Inbound),
    Command(Command),
}

impl Supervisor {
    /// Spawns the control loop on the current runtime.
    pub fn spawn(self, token: CancellationToken) -> (SupervisorHandle, JoinHandle<Result<(), SupervisorError>>) {
        let (tx, rx) = mpsc::channel(self.cfg.command_capacity_clamped());
        (SupervisorHandle { tx }, tokio::spawn(self.run(rx, token)))
    }

    /// Runs the control loop until told to stop, then shuts down.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        token: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let mut signal = Box::pin(wait_for_shutdown_signal().fuse());

        loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => Step::Stop("token cancelled"),
                res = &mut signal => match res {
                    Ok(()) => Step::Stop("termination signal"),
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot listen for termination signals");
                        continue;
                    }
                },
                Some(inbound) = self.next_inbound() => Step::Inbound(inbound),
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) => Step::Stop("shutdown requested"),
                    Some(cmd) => Step::Command(cmd),
                    None => Step::Stop("all handles dropped"),
                },
            };

            match step {
                Step::Stop(why) => {
                    tracing::info!(reason = why, "supervisor stopping");
                    break;
                }
                Step::Inbound(inbound) => self.on_inbound(inbound),
                Step::Command(cmd) => self.dispatch(cmd),
            }
        }
        self.shutdown().await
    }

    fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                instance,
                discard_prior_config,
                reply,
            } => {
                let _ = reply.send(self.register(&instance, discard_prior_config));
            }
            Command::Unregister {
                id,
                erase_config,
                reply,
            } => {
                let _ = reply.send(self.unregister(id, erase_config));
            }
            Command::Closing { id, reply } => {
                let _ = reply.send(self.instance_closing(id));
            }
            Command::Destroyed { id, reply } => {
                self.instance_destroyed(id);
                let _ = reply.send(());
            }
            Command::CloseAll { reply } => {
                let _ = reply.send(self.close_all());
            }
            Command::RunCode {
                id,
                title,
                source,
                reply,
            } => {
                let _ = reply.send(self.run_code(id, &title, &source));
            }
            Command::StopCode { id, reply } => {
                let _ = reply.send(self.stop_code(id));
            }
            Command::EngineState { id, reply } => {
                let _ = reply.send(self.engine_state(id));
            }
            Command::Config { id, reply } => {
                let _ = reply.send(self.config(id));
            }
            Command::ConfigValue {
                id,
                key,
                default,
                reply,
            } => {
                let _ = reply.send(self.config_value(id, &key, default));
            }
            Command::SetConfig {
                id,
                key,
                value,
                reply,
            } => {
                let _ = reply.send(self.set_config(id, &key, value));
            }
            Command::SetConfigBatch { id, entries, reply } => {
                let _ = reply.send(self.set_config_batch(id, entries));
            }
            Command::Setting { key, default, reply } => {
                let _ = reply.send(self.setting(&key, default));
            }
            Command::SetSetting { key, value, reply } => {
                let _ = reply.send(self.set_setting(&key, value));
            }
            Command::NextId { reply } => {
                let _ = reply.send(self.next_id());
            }
            Command::RestorePlan { reply } => {
                let _ = reply.send(self.restore_plan());
            }
            Command::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::backends::{Backends, ReferenceBackends};
    use crate::config::SupervisorConfig;
    use crate::store::{ENGINE_KEY, MemoryStore};
    use crate::supervisor::fixtures::{StallingBackends, Window};

    struct Quiet {
        id: Identity,
        stopped: AtomicUsize,
    }

    impl Instance for Quiet {
        fn id(&self) -> Identity {
            self.id
        }
        fn close(&self) -> bool {
            true
        }
        fn report_error(&self, _: &str) {}
        fn report_warning(&self, _: &str) {}
        fn code_stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawn(token: CancellationToken) -> (SupervisorHandle, JoinHandle<Result<(), SupervisorError>>) {
        spawn_with(token, Arc::new(ReferenceBackends::silent()), Duration::from_secs(1))
    }

    fn spawn_with(
        token: CancellationToken,
        backends: Arc<dyn Backends>,
        stop_grace: Duration,
    ) -> (SupervisorHandle, JoinHandle<Result<(), SupervisorError>>) {
        let cfg = SupervisorConfig {
            tick: Duration::from_millis(1),
            stop_grace,
            ..SupervisorConfig::default()
        };
        Supervisor::new(cfg, Arc::new(MemoryStore::new()), backends, Vec::new()).spawn(token)
    }

    #[tokio::test]
    async fn test_handle_drives_full_lifecycle() {
        let (handle, join) = spawn(CancellationToken::new());
        let win = Arc::new(Quiet {
            id: 0,
            stopped: AtomicUsize::new(0),
        });

        assert!(handle.register(win.clone(), false).await.unwrap());
        assert!(!handle.register(win.clone(), false).await.unwrap());
        assert_eq!(handle.next_id().await.unwrap(), 1);

        handle.set_config(0, ENGINE_KEY, json!(3)).await.unwrap();
        assert_eq!(handle.config_value(0, ENGINE_KEY, Value::Null).await.unwrap(), json!(3));

        handle.run_code(0, "main", "x = 1").await.unwrap();
        assert_eq!(handle.engine_state(0).await.unwrap(), Some(EngineState::Running));
        handle.run_code(0, "main", "x = 2").await.unwrap();

        assert!(handle.stop_code(0).await.unwrap());
        assert!(!handle.stop_code(0).await.unwrap());
        assert_eq!(handle.engine_state(0).await.unwrap(), None);

        handle.shutdown().await.unwrap();
        assert!(join.await.unwrap().is_ok());
        assert!(matches!(handle.next_id().await, Err(SupervisorError::Closed)));
        assert_eq!(win.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_live_engines() {
        let token = CancellationToken::new();
        let (handle, join) = spawn(token.clone());
        let win = Arc::new(Quiet {
            id: 3,
            stopped: AtomicUsize::new(0),
        });
        handle.register(win.clone(), false).await.unwrap();
        handle.set_config(3, ENGINE_KEY, json!("3")).await.unwrap();
        handle.run_code(3, "main", "x = 1").await.unwrap();

        token.cancel();
        assert!(join.await.unwrap().is_ok());
        assert!(matches!(
            handle.run_code(3, "main", "x = 1").await,
            Err(SupervisorError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_engine_events_are_applied_between_commands() {
        let (handle, join) = spawn(CancellationToken::new());
        let win = Arc::new(Quiet {
            id: 0,
            stopped: AtomicUsize::new(0),
        });
        handle.register(win.clone(), false).await.unwrap();
        handle.set_config(0, ENGINE_KEY, json!(3)).await.unwrap();
        handle.run_code(0, "main", "done = 1").await.unwrap();

        let mut state = handle.engine_state(0).await.unwrap();
        for _ in 0..200 {
            if state.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            state = handle.engine_state(0).await.unwrap();
        }
        assert_eq!(state, None);
        assert_eq!(win.stopped.load(Ordering::SeqCst), 1);

        drop(handle);
        assert!(join.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stopping_a_stuck_engine_does_not_delay_other_commands() {
        let backends = Arc::new(StallingBackends::new(vec![0], Duration::from_millis(1_500)));
        let (handle, join) = spawn_with(CancellationToken::new(), backends, Duration::from_secs(3));
        let windows = [Window::new(0), Window::new(1)];
        for w in &windows {
            handle.register(w.clone(), false).await.unwrap();
            handle.set_config(w.id(), ENGINE_KEY, json!(3)).await.unwrap();
            handle.run_code(w.id(), "main", "x = 1").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.stop_code(0).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reload = tokio::time::timeout(Duration::from_millis(300), handle.run_code(1, "main", "x = 2"));
        reload.await.expect("command answered while 0 winds down").unwrap();
        assert_eq!(handle.engine_state(1).await.unwrap(), Some(EngineState::Running));
        assert_eq!(handle.engine_state(0).await.unwrap(), None);

        handle.shutdown().await.unwrap();
        assert!(join.await.unwrap().is_ok());
    }
}
