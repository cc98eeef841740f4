//! Health checking of GameServer backing Pods.
//!
//! Watches Pods and GameServers, and moves a GameServer to `Unhealthy` when
//! its game server container terminates or its Pod cannot be scheduled for
//! lack of free host ports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::reflector::{reflector, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{watcher, Event};
use kube::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use agones_core::crd::{GameServer, GameServerState, RequiredMetadata, GAME_SERVER_CONTAINER_ANNOTATION, GAME_SERVER_POD_LABEL};
use agones_core::GAME_SERVER_POD_SELECTOR;

use crate::config::Config;
use crate::events::{EventRecorder, REASON_UNHEALTHY};
use crate::workerqueue::WorkerQueue;

/// The phrase the scheduler puts into a Pod's unschedulable condition when the
/// requested host ports are exhausted.
const NO_FREE_PORTS_MESSAGE: &str = "didn't have free ports";

/// Watches Pods and projects container & scheduling failures back onto the
/// owning GameServer's status.
pub struct HealthController {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
    gs_writer: Writer<GameServer>,
    pod_writer: Writer<Pod>,
}

struct Inner {
    client: Client,
    config: Arc<Config>,
    workerqueue: WorkerQueue,
    recorder: EventRecorder,
    game_servers: Store<GameServer>,
    pods: Store<Pod>,
}

impl HealthController {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let gs_writer = Writer::<GameServer>::default();
        let pod_writer = Writer::<Pod>::default();
        let recorder = EventRecorder::new(client.clone(), "health-controller", &config.pod_name);
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                workerqueue: WorkerQueue::new("stable.agones.dev.HealthController"),
                recorder,
                game_servers: gs_writer.as_reader(),
                pods: pod_writer.as_reader(),
            }),
            shutdown_tx,
            gs_writer,
            pod_writer,
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
        let pod_params = ListParams::default().labels(GAME_SERVER_POD_SELECTOR);
        let pod_stream = reflector(self.pod_writer, watcher(pod_api, pod_params));

        tokio::pin!(gs_stream, pod_stream);

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

        tracing::info!("health controller initialized");
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());
        loop {
            tokio::select! {
                Some(res) = gs_stream.next() => match res {
                    Ok(Event::Applied(gs)) | Ok(Event::Deleted(gs)) => self.inner.workerqueue.enqueue(&gs),
                    Ok(Event::Restarted(_)) => (),
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
                _ = shutdown.next() => break,
            }
        }

        if let Err(err) = workers.await.context("error joining health controller workers").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down health controller workers");
        }
        Ok(())
    }
}

impl Inner {
    /// Enqueue the GameServer owning the given Pod, if it is a GameServer Pod.
    fn enqueue_owner(&self, pod: &Pod) {
        let owner = match pod.metadata.labels.as_ref().and_then(|labels| labels.get(GAME_SERVER_POD_LABEL)) {
            Some(owner) => owner,
            None => return,
        };
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        self.workerqueue.enqueue_key(format!("{}/{}", namespace, owner));
    }

    /// Check the backing Pod of the keyed GameServer and transition the
    /// GameServer to Unhealthy when the Pod has failed.
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
        if gs.is_being_deleted() || gs.is_terminal() {
            return Ok(());
        }

        let pod = match self.pods.get(&ObjectRef::new(name).within(namespace)) {
            Some(pod) => pod,
            None => return Ok(()),
        };

        if !should_mark_unhealthy(&gs, &pod) {
            return Ok(());
        }

        self.move_to_unhealthy(gs).await
    }

    /// Idempotently move the GameServer into the Unhealthy state.
    async fn move_to_unhealthy(&self, mut gs: GameServer) -> Result<()> {
        let name = RequiredMetadata::name(&gs).to_string();
        tracing::debug!(gs = %name, "marking GameServer as Unhealthy");

        match gs.status.as_mut() {
            Some(status) => status.state = GameServerState::Unhealthy,
            None => return Ok(()),
        }

        let api: Api<GameServer> = Api::namespaced(self.client.clone(), RequiredMetadata::namespace(&gs));
        api.replace_status(&name, &PostParams::default(), serde_json::to_vec(&gs)?)
            .await
            .with_context(|| format!("error moving GameServer {} to Unhealthy", name))?;

        metrics::counter!("gameservers_unhealthy_total", 1);
        self.recorder
            .warning(&gs, REASON_UNHEALTHY, "HealthCheck", "Issue with GameServer pod".to_string())
            .await;
        Ok(())
    }
}

/// Whether the Pod's failure should move its GameServer into Unhealthy.
///
/// Containers legitimately restart while a Pod is being scheduled, so a
/// terminated container is fatal only once the GameServer is past Scheduled.
/// Unschedulability for lack of free ports is fatal from any state.
pub(crate) fn should_mark_unhealthy(gs: &GameServer, pod: &Pod) -> bool {
    let container_failure_fatal = matches!(
        gs.state(),
        Some(GameServerState::Starting) | Some(GameServerState::RequestReady) | Some(GameServerState::Ready) | Some(GameServerState::Allocated)
    );
    unschedulable_with_no_free_ports(pod) || (container_failure_fatal && failed_container(pod))
}

/// Whether the Pod's game server container has terminated.
pub(crate) fn failed_container(pod: &Pod) -> bool {
    let container = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(GAME_SERVER_CONTAINER_ANNOTATION))
        .map(String::as_str)
        .unwrap_or_default();
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .any(|cs| cs.name == container && cs.state.as_ref().map(|state| state.terminated.is_some()).unwrap_or(false))
        })
        .unwrap_or(false)
}

/// Whether the Pod could not be scheduled because no node had free ports.
pub(crate) fn unschedulable_with_no_free_ports(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|condition| {
                condition.type_ == "PodScheduled"
                    && condition.reason.as_deref() == Some("Unschedulable")
                    && condition.message.as_deref().map(|message| message.contains(NO_FREE_PORTS_MESSAGE)).unwrap_or(false)
            })
        })
        .unwrap_or(false)
}
