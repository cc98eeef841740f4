use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::gameservers::{GameServerController, HealthController, PortAllocator};
use crate::gameserversets::GameServerSetController;
use crate::server::{LivenessChecks, WebhookServer};

/// The application object wiring together the controllers and servers.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the webhook/health/metrics HTTP server.
    server: JoinHandle<Result<()>>,
    /// The join handle of the port allocator's watch loop.
    port_allocator: JoinHandle<Result<()>>,
    /// The join handle of the GameServer lifecycle controller.
    game_servers: JoinHandle<Result<()>>,
    /// The join handle of the GameServerSet reconciler.
    game_server_sets: JoinHandle<Result<()>>,
    /// The join handle of the health controller.
    health: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // The process-wide allocation coordination lock, shared between the set
        // reconciler and the external allocator surface.
        let allocation_mutex = Arc::new(Mutex::new(()));

        let port_allocator = PortAllocator::new(config.min_port, config.max_port);

        let game_servers_ctl = GameServerController::new(client.clone(), config.clone(), port_allocator.clone(), shutdown_tx.clone());
        let health_ctl = HealthController::new(client.clone(), config.clone(), shutdown_tx.clone());
        let game_server_sets_ctl = GameServerSetController::new(client.clone(), config.clone(), allocation_mutex, shutdown_tx.clone());

        let checks = LivenessChecks::new(vec![
            ("gameserver-workerqueue", game_servers_ctl.workerqueue()),
            ("gameserverset-workerqueue", game_server_sets_ctl.workerqueue()),
            ("health-workerqueue", health_ctl.workerqueue()),
        ]);

        // Spawn the various core tasks.
        let server = WebhookServer::new(config.clone(), checks, shutdown_tx.clone())
            .await
            .context("error setting up webhook server")?
            .spawn();
        let port_allocator = port_allocator.spawn(client, config.clone(), shutdown_tx.clone());
        let game_servers = game_servers_ctl.spawn();
        let game_server_sets = game_server_sets_ctl.spawn();
        let health = health_ctl.spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            port_allocator,
            game_servers,
            game_server_sets,
            health,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Agones controller is shutting down");
        let tasks = vec![
            ("webhook server", self.server),
            ("port allocator", self.port_allocator),
            ("GameServer controller", self.game_servers),
            ("GameServerSet controller", self.game_server_sets),
            ("health controller", self.health),
        ];
        for (name, handle) in tasks {
            if let Err(err) = handle.await.context("error joining task handle").and_then(|res| res) {
                tracing::error!(error = ?err, task = name, "error shutting down task");
            }
        }

        tracing::debug!("Agones controller shutdown complete");
        Ok(())
    }
}
