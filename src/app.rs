use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::initializer::initialize;
use crate::memory::{MemoryModel, MemoryStore};
use crate::worker::Worker;

/// The application object for when the peer group controller is running standalone.
///
/// The controller machines are seeded from config into an in-memory model, and the peer group is
/// managed in an in-memory store whose members become ready as soon as they are added.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The consensus store whose peer group is managed.
    store: Arc<MemoryStore>,
    /// The durable model holding the controller machines.
    model: Arc<MemoryModel>,
}

impl App {
    /// Create a new instance, bootstrapping the peer group if needed.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let machines = config.seed_machines()?;
        let bootstrap = machines
            .first()
            .cloned()
            .context("CONTROLLER_MACHINES must hold at least the bootstrap machine")?;
        let ha_space = config.ha_space();

        let store = Arc::new(MemoryStore::new_auto_ready());
        let model = Arc::new(MemoryModel::new(machines, ha_space.clone()));
        let topology = initialize(store.as_ref(), &bootstrap, ha_space.as_ref(), config.peer_port)
            .await
            .context("error initializing peer group")?;
        tracing::info!(machine = %bootstrap.id, members = topology.len(), "peer group bootstrapped");

        Ok(Self { config, store, model })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let restart_delay = Duration::from_secs(self.config.restart_delay_seconds);

        let mut worker = self.start_worker();
        loop {
            tokio::select! {
                res = worker.wait() => {
                    match res {
                        Ok(()) => tracing::warn!("peer group worker stopped unexpectedly"),
                        Err(err) => tracing::error!(error = ?err, "peer group worker stopped"),
                    }
                    tracing::info!(?restart_delay, "restarting peer group worker after delay");
                    tokio::select! {
                        _ = tokio::time::sleep(restart_delay) => worker = self.start_worker(),
                        Some((_, sig)) = signals.next() => {
                            tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                            break;
                        }
                    }
                }
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    worker.kill();
                    if let Err(err) = worker.wait().await {
                        tracing::error!(error = ?err, "error shutting down peer group worker");
                    }
                    break;
                }
            }
        }

        tracing::debug!("peer group controller shutdown complete");
        Ok(())
    }

    fn start_worker(&self) -> Worker {
        Worker::start(self.store.clone(), self.model.clone(), self.config.worker_config())
    }
}
