//! # Example: live
//!
//! Two instances sharing one supervisor, a file-backed configuration store and the
//! built-in logging subscriber.
//!
//! Demonstrates:
//! - engine selection through the scoped `engine` key
//! - hot reload of a running script keeping its variables
//! - a faulty reload rejected while the engine keeps running
//! - a synth engine that completes on its own
//! - restoring the identity set from the store on the next start
//!
//! ## Run
//! ```bash
//! RUST_LOG=livevisor=debug cargo run --example live
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use livevisor::{
    ENGINE_KEY, EngineKind, FileStore, Identity, Instance, LogWriter, ReferenceBackends,
    Subscribe, Supervisor, SupervisorConfig,
};

/// Instance that prints what a host UI would show in its status bar.
struct Console(Identity);

impl Instance for Console {
    fn id(&self) -> Identity {
        self.0
    }

    fn close(&self) -> bool {
        true
    }

    fn report_error(&self, message: &str) {
        println!("[window {}] error: {message}", self.0);
    }

    fn report_warning(&self, message: &str) {
        if message.is_empty() {
            println!("[window {}] program finished", self.0);
        } else {
            println!("[window {}] warning: {message}", self.0);
        }
    }

    fn code_started(&self) {
        println!("[window {}] running", self.0);
    }

    fn code_stopped(&self) {
        println!("[window {}] stopped", self.0);
    }
}

fn supervisor(store: Arc<FileStore>) -> Supervisor {
    let cfg = SupervisorConfig {
        stop_grace: Duration::from_secs(1),
        ..SupervisorConfig::default()
    };
    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    Supervisor::new(cfg, store, Arc::new(ReferenceBackends::silent()), subs)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("livevisor=info")),
        )
        .init();

    let dir = tempfile::tempdir().context("temp dir")?;
    let path = dir.path().join("livevisor.json");
    let store = Arc::new(FileStore::open(&path).context("open config store")?);

    let (handle, join) = supervisor(store.clone()).spawn(CancellationToken::new());
    println!("restore plan on first start: {:?}", handle.restore_plan().await?);

    let windows: Vec<Arc<dyn Instance>> = vec![Arc::new(Console(0)), Arc::new(Console(1))];
    for w in &windows {
        handle.register(w.clone(), false).await?;
    }
    handle
        .set_config(0, ENGINE_KEY, json!(EngineKind::Script.selector()))
        .await?;
    handle
        .set_config(1, ENGINE_KEY, json!(EngineKind::AudioSynth.selector()))
        .await?;

    // Window 0: a script that is reloaded while it runs.
    handle.run_code(0, "counter", "count = 1").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.run_code(0, "counter", "count = count + 41").await?;
    handle.run_code(0, "counter", "count = (").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("window 0 engine: {:?}", handle.engine_state(0).await?);

    // Window 1: a short tone that ends by itself.
    handle
        .run_code(1, "beep", "freq = 660\namp = 0.1\nduration = 0.2")
        .await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    println!("window 1 engine: {:?}", handle.engine_state(1).await?);

    handle.stop_code(0).await?;
    handle.shutdown().await?;
    join.await.context("control loop")??;

    // Next start restores both identities and their engines.
    let (handle, join) = supervisor(store).spawn(CancellationToken::new());
    println!("restore plan on second start: {:?}", handle.restore_plan().await?);
    println!(
        "window 1 engine selector: {}",
        handle.config_value(1, ENGINE_KEY, json!(null)).await?
    );
    handle.shutdown().await?;
    join.await.context("control loop")??;
    Ok(())
}
