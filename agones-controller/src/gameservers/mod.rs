//! GameServer lifecycle management.
//!
//! The controller here walks a GameServer along its state machine: allocating
//! host ports, creating the backing Pod, recording scheduling results, and
//! tearing everything down again. The port allocator and health controller
//! are its siblings, sharing the same state machine.

mod health;
mod portallocator;

#[cfg(test)]
mod health_test;
#[cfg(test)]
mod portallocator_test;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::reflector::{reflector, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{watcher, Event};
use kube::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use agones_core::crd::{
    GameServer, GameServerState, GameServerStatus, RequiredMetadata, GAME_SERVER_POD_LABEL, GROUP_NAME,
};
use agones_core::GAME_SERVER_POD_SELECTOR;

use crate::config::Config;
use crate::events::{EventRecorder, REASON_SUCCESSFUL_CREATE};
use crate::workerqueue::WorkerQueue;

pub use health::HealthController;
pub use portallocator::PortAllocator;

/// Drives a GameServer through its lifecycle states.
pub struct GameServerController {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
    gs_writer: Writer<GameServer>,
    pod_writer: Writer<Pod>,
    node_writer: Writer<Node>,
}

struct Inner {
    client: Client,
    config: Arc<Config>,
    workerqueue: WorkerQueue,
    recorder: EventRecorder,
    port_allocator: Arc<PortAllocator>,
    game_servers: Store<GameServer>,
    pods: Store<Pod>,
    nodes: Store<Node>,
}

impl GameServerController {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, port_allocator: Arc<PortAllocator>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let gs_writer = Writer::<GameServer>::default();
        let pod_writer = Writer::<Pod>::default();
        let node_writer = Writer::<Node>::default();
        let recorder = EventRecorder::new(client.clone(), "gameserver-controller", &config.pod_name);
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                workerqueue: WorkerQueue::new("stable.agones.dev.GameServerController"),
                recorder,
                port_allocator,
                game_servers: gs_writer.as_reader(),
                pods: pod_writer.as_reader(),
                nodes: node_writer.as_reader(),
            }),
            shutdown_tx,
            gs_writer,
            pod_writer,
            node_writer,
        }
    }

    /// A handle to this controller's worker queue, for liveness reporting.
    pub fn workerqueue(&self) -> WorkerQueue {
        self.inner.workerqueue.clone()
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let gs_api: Api<GameServer> = Api::namespaced(self.inner.client.clone(), &self.inner.config.namespace);
        let gs_stream = reflector(self.gs_writer, watcher(gs_api, ListParams::default()));

        let pod_api: Api<Pod> = Api::namespaced(self.inner.client.clone(), &self.inner.config.namespace);
        let pod_stream = reflector(self.pod_writer, watcher(pod_api, ListParams::default().labels(GAME_SERVER_POD_SELECTOR)));

        let node_api: Api<Node> = Api::all(self.inner.client.clone());
        let node_stream = reflector(self.node_writer, watcher(node_api, ListParams::default()));

        tokio::pin!(gs_stream, pod_stream, node_stream);

        let workers = {
            let inner = self.inner.clone();
            let queue = self.inner.workerqueue.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            let worker_count = self.inner.config.workers;
            let handler = move |key: String| {
                let inner = inner.clone();
                async move { inner.sync_game_server(key).await }
            };
            tokio::spawn(async move { queue.run(worker_count, handler, shutdown_tx).await })
        };

        tracing::info!("GameServer controller initialized");
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());
        loop {
            tokio::select! {
                Some(res) = gs_stream.next() => match res {
                    Ok(Event::Applied(gs)) => self.inner.workerqueue.enqueue(&gs),
                    Ok(_) => (),
                    Err(err) => {
                        tracing::error!(error = ?err, "error from GameServer watch stream");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                },
                Some(res) = pod_stream.next() => match res {
                    Ok(Event::Applied(pod)) | Ok(Event::Deleted(pod)) => self.inner.enqueue_owner(&pod),
                    Ok(Event::Restarted(_)) => (),
                    Err(err) => {
                        tracing::error!(error = ?err, "error from Pod watch stream");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                },
                Some(res) = node_stream.next() => match res {
                    Ok(_) => (),
                    Err(err) => {
                        tracing::error!(error = ?err, "error from node watch stream");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                },
                _ = shutdown.next() => break,
            }
        }

        if let Err(err) = workers.await.context("error joining GameServer controller workers").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down GameServer controller workers");
        }
        Ok(())
    }
}

impl Inner {
    fn enqueue_owner(&self, pod: &Pod) {
        let owner = match pod.metadata.labels.as_ref().and_then(|labels| labels.get(GAME_SERVER_POD_LABEL)) {
            Some(owner) => owner,
            None => return,
        };
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        self.workerqueue.enqueue_key(format!("{}/{}", namespace, owner));
    }

    fn game_servers_api(&self, namespace: &str) -> Api<GameServer> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods_api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Synchronise the keyed GameServer with its backing resources.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn sync_game_server(&self, key: String) -> Result<()> {
        let (namespace, name) = match WorkerQueue::split_key(&key) {
            Some(parts) => parts,
            None => {
                // Don't retry; the key can never resolve.
                tracing::error!(%key, "invalid resource key, dropping");
                return Ok(());
            }
        };

        let gs = match self.game_servers.get(&ObjectRef::new(name).within(namespace)) {
            Some(gs) => gs,
            None => return Ok(()),
        };

        if gs.is_being_deleted() {
            return self.sync_being_deleted(gs).await;
        }
        if let Some(address) = gs.dev_address() {
            let address = address.to_string();
            return self.sync_development(gs, address).await;
        }

        match gs.state() {
            Some(GameServerState::PortAllocation) => self.sync_port_allocation(gs).await,
            Some(GameServerState::Creating) => self.sync_creating(gs).await,
            Some(GameServerState::Starting) => self.sync_starting(gs).await,
            Some(GameServerState::RequestReady) => self.sync_request_ready(gs).await,
            Some(GameServerState::Shutdown) => self.sync_shutdown(gs).await,
            // Scheduled is advanced by the SDK sidecar; terminal states are left
            // for the set reconciler.
            _ => Ok(()),
        }
    }

    /// A development GameServer gets no Pod; its status comes straight from the
    /// dev address annotation and the statically defined ports.
    async fn sync_development(&self, mut gs: GameServer, address: String) -> Result<()> {
        if gs.state() == Some(GameServerState::Ready) {
            return Ok(());
        }

        let name = RequiredMetadata::name(&gs).to_string();
        tracing::debug!(gs = %name, %address, "marking development GameServer Ready");
        gs.status = Some(GameServerStatus {
            state: GameServerState::Ready,
            ports: gs.spec.ports.iter().map(|port| port.status_port()).collect(),
            address,
            node_name: String::new(),
        });
        self.game_servers_api(RequiredMetadata::namespace(&gs))
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&gs)?)
            .await
            .with_context(|| format!("error updating development GameServer {}", name))?;
        Ok(())
    }

    /// Consult the port allocator, persist the assigned host ports, and move on
    /// to Creating. The allocator releases its lock before this write happens.
    async fn sync_port_allocation(&self, gs: GameServer) -> Result<()> {
        let name = RequiredMetadata::name(&gs).to_string();
        let namespace = RequiredMetadata::namespace(&gs).to_string();
        let allocated = self.port_allocator.allocate(gs);

        let api = self.game_servers_api(&namespace);
        let mut updated = api
            .replace(&name, &PostParams::default(), &allocated)
            .await
            .with_context(|| format!("error persisting allocated ports on GameServer {}", name))?;

        if let Some(status) = updated.status.as_mut() {
            status.state = GameServerState::Creating;
        }
        api.replace_status(&name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await
            .with_context(|| format!("error moving GameServer {} to Creating", name))?;
        Ok(())
    }

    /// Create the backing Pod and move on to Starting.
    async fn sync_creating(&self, mut gs: GameServer) -> Result<()> {
        let name = RequiredMetadata::name(&gs).to_string();
        let namespace = RequiredMetadata::namespace(&gs).to_string();

        let pod = match gs.pod(Vec::new()) {
            Ok(pod) => pod,
            Err(err) => {
                // The spec names a container the template doesn't have. Not retriable.
                tracing::error!(gs = %name, error = ?err, "could not project Pod for GameServer, moving to Error");
                self.recorder.warning(&gs, "Error", "Creating", err.to_string()).await;
                if let Some(status) = gs.status.as_mut() {
                    status.state = GameServerState::Error;
                }
                self.game_servers_api(&namespace)
                    .replace_status(&name, &PostParams::default(), serde_json::to_vec(&gs)?)
                    .await
                    .with_context(|| format!("error moving GameServer {} to Error", name))?;
                return Ok(());
            }
        };

        match self.pods_api(&namespace).create(&PostParams::default(), &pod).await {
            Ok(_) => {
                metrics::counter!("gameservers_pods_created_total", 1);
                self.recorder
                    .normal(&gs, REASON_SUCCESSFUL_CREATE, "Creating", format!("Pod {} created", name))
                    .await;
            }
            // The Pod already exists from a prior, partially applied pass.
            Err(kube::Error::Api(err)) if err.code == http::StatusCode::CONFLICT => (),
            Err(err) => return Err(err).with_context(|| format!("error creating Pod for GameServer {}", name)),
        }

        if let Some(status) = gs.status.as_mut() {
            status.state = GameServerState::Starting;
        }
        self.game_servers_api(&namespace)
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&gs)?)
            .await
            .with_context(|| format!("error moving GameServer {} to Starting", name))?;
        Ok(())
    }

    /// Once the backing Pod lands on a node, record where and move to Scheduled.
    async fn sync_starting(&self, mut gs: GameServer) -> Result<()> {
        let name = RequiredMetadata::name(&gs).to_string();
        let namespace = RequiredMetadata::namespace(&gs).to_string();

        let pod = match self.pods.get(&ObjectRef::new(&name).within(&namespace)) {
            Some(pod) => pod,
            None => bail!("backing Pod for GameServer {} not yet observed", name),
        };
        let node_name = match pod.spec.as_ref().and_then(|spec| spec.node_name.clone()) {
            Some(node_name) if !node_name.is_empty() => node_name,
            // Not scheduled yet; the Pod update will bring us back here.
            _ => return Ok(()),
        };

        let address = match self.nodes.get(&ObjectRef::new(&node_name)) {
            Some(node) => node_address(&node),
            None => bail!("node {} for GameServer {} not yet observed", node_name, name),
        };

        tracing::debug!(gs = %name, node = %node_name, %address, "GameServer Pod scheduled");
        if let Some(status) = gs.status.as_mut() {
            status.state = GameServerState::Scheduled;
            status.node_name = node_name;
            status.address = address;
        }
        self.game_servers_api(&namespace)
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&gs)?)
            .await
            .with_context(|| format!("error moving GameServer {} to Scheduled", name))?;
        Ok(())
    }

    /// The sidecar has requested readiness; publish the ports and go Ready.
    async fn sync_request_ready(&self, mut gs: GameServer) -> Result<()> {
        let name = RequiredMetadata::name(&gs).to_string();
        let namespace = RequiredMetadata::namespace(&gs).to_string();

        let ports = gs.spec.ports.iter().map(|port| port.status_port()).collect();
        if let Some(status) = gs.status.as_mut() {
            status.state = GameServerState::Ready;
            status.ports = ports;
        }
        self.game_servers_api(&namespace)
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&gs)?)
            .await
            .with_context(|| format!("error moving GameServer {} to Ready", name))?;
        Ok(())
    }

    /// A Shutdown GameServer is deleted outright; teardown continues through
    /// the deletion timestamp path.
    async fn sync_shutdown(&self, gs: GameServer) -> Result<()> {
        let name = RequiredMetadata::name(&gs).to_string();
        let namespace = RequiredMetadata::namespace(&gs).to_string();
        tracing::debug!(gs = %name, "deleting Shutdown GameServer");

        let res = self.game_servers_api(&namespace).delete(&name, &DeleteParams::default()).await;
        match res {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => Ok(()),
            Err(err) => Err(err).with_context(|| format!("error deleting GameServer {}", name)),
        }
    }

    /// Delete the backing Pod, then remove the finalizer as the very last step.
    async fn sync_being_deleted(&self, mut gs: GameServer) -> Result<()> {
        let name = RequiredMetadata::name(&gs).to_string();
        let namespace = RequiredMetadata::namespace(&gs).to_string();

        match self.pods_api(&namespace).get(&name).await {
            Ok(pod) => {
                if pod.metadata.deletion_timestamp.is_none() {
                    tracing::debug!(gs = %name, "deleting backing Pod for GameServer");
                    match self.pods_api(&namespace).delete(&name, &DeleteParams::default()).await {
                        Ok(_) => (),
                        Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => (),
                        Err(err) => return Err(err).with_context(|| format!("error deleting Pod for GameServer {}", name)),
                    }
                }
                // The Pod deletion event will re-queue this GameServer.
                return Ok(());
            }
            Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => (),
            Err(err) => return Err(err).with_context(|| format!("error fetching Pod for GameServer {}", name)),
        }

        let finalizers = match gs.metadata.finalizers.as_mut() {
            Some(finalizers) => finalizers,
            None => return Ok(()),
        };
        let before = finalizers.len();
        finalizers.retain(|finalizer| finalizer != GROUP_NAME);
        if finalizers.len() == before {
            return Ok(());
        }

        tracing::debug!(gs = %name, "removing GameServer finalizer");
        self.game_servers_api(&namespace)
            .replace(&name, &PostParams::default(), &gs)
            .await
            .with_context(|| format!("error removing finalizer from GameServer {}", name))?;
        Ok(())
    }
}

/// The connectable address of a node, preferring the external IP.
fn node_address(node: &Node) -> String {
    if let Some(addresses) = node.status.as_ref().and_then(|status| status.addresses.as_ref()) {
        for type_ in &["ExternalIP", "InternalIP"] {
            if let Some(address) = addresses.iter().find(|address| address.type_ == *type_) {
                return address.address.clone();
            }
        }
    }
    String::new()
}
