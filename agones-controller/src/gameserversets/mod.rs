//! GameServerSet reconciliation.
//!
//! Keeps the population of GameServers owned by a set at its target replica
//! count, with per-tick batch caps so a large drift never herds the cluster
//! API. A pass that was capped re-enqueues itself immediately, so convergence
//! is amortized across batches.

mod statecache;

#[cfg(test)]
mod statecache_test;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::reflector::{reflector, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{watcher, Event};
use kube::Client;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use agones_core::crd::{
    controller_of, GameServer, GameServerSet, GameServerSetStatus, GameServerState, RequiredMetadata,
};

use crate::config::Config;
use crate::events::{EventRecorder, REASON_SUCCESSFUL_CREATE, REASON_SUCCESSFUL_DELETE};
use crate::workerqueue::WorkerQueue;

pub use statecache::{GameServerSetStateCache, GameServerStateCache};

const MAX_CREATION_PARALLELISM: usize = 16;
const MAX_GAME_SERVER_CREATIONS_PER_BATCH: usize = 64;

const MAX_DELETION_PARALLELISM: usize = 64;
const MAX_GAME_SERVER_DELETIONS_PER_BATCH: usize = 64;

/// The maximum number of pending Pods per GameServerSet.
const MAX_POD_PENDING_COUNT: usize = 5000;

/// The GameServerSet controller.
pub struct GameServerSetController {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
    gs_writer: Writer<GameServer>,
    gss_writer: Writer<GameServerSet>,
}

struct Inner {
    client: Client,
    config: Arc<Config>,
    workerqueue: WorkerQueue,
    recorder: EventRecorder,
    /// Held across the deletion phase so an external allocator flipping a
    /// GameServer into Allocated cannot race a Shutdown transition.
    allocation_mutex: Arc<Mutex<()>>,
    state_cache: GameServerSetStateCache,
    game_servers: Store<GameServer>,
    game_server_sets: Store<GameServerSet>,
}

impl GameServerSetController {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, allocation_mutex: Arc<Mutex<()>>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let gs_writer = Writer::<GameServer>::default();
        let gss_writer = Writer::<GameServerSet>::default();
        let recorder = EventRecorder::new(client.clone(), "gameserverset-controller", &config.pod_name);
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                workerqueue: WorkerQueue::new("stable.agones.dev.GameServerSetController"),
                recorder,
                allocation_mutex,
                state_cache: GameServerSetStateCache::default(),
                game_servers: gs_writer.as_reader(),
                game_server_sets: gss_writer.as_reader(),
            }),
            shutdown_tx,
            gs_writer,
            gss_writer,
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
        let gss_api: Api<GameServerSet> = Api::namespaced(self.inner.client.clone(), &self.inner.config.namespace);
        let gss_stream = reflector(self.gss_writer, watcher(gss_api, ListParams::default()));

        let gs_api: Api<GameServer> = Api::namespaced(self.inner.client.clone(), &self.inner.config.namespace);
        let gs_stream = reflector(self.gs_writer, watcher(gs_api, ListParams::default()));

        tokio::pin!(gss_stream, gs_stream);

        let workers = {
            let inner = self.inner.clone();
            let queue = self.inner.workerqueue.clone();
            let shutdown_tx = self.shutdown_tx.clone();
            let worker_count = self.inner.config.workers;
            let handler = move |key: String| {
                let inner = inner.clone();
                async move { inner.sync_game_server_set(key).await }
            };
            tokio::spawn(async move { queue.run(worker_count, handler, shutdown_tx).await })
        };

        tracing::info!("GameServerSet controller initialized");
        // Replica counts last seen per set; status-only updates don't re-sync.
        let mut observed_replicas: HashMap<String, i32> = HashMap::new();
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());
        loop {
            tokio::select! {
                Some(res) = gss_stream.next() => match res {
                    Ok(Event::Applied(gss)) => {
                        let key = match WorkerQueue::key_for(&gss) {
                            Some(key) => key,
                            None => continue,
                        };
                        if observed_replicas.get(&key) != Some(&gss.spec.replicas) {
                            observed_replicas.insert(key, gss.spec.replicas);
                            self.inner.workerqueue.enqueue(&gss);
                        }
                    }
                    Ok(Event::Deleted(gss)) => {
                        if let Some(key) = WorkerQueue::key_for(&gss) {
                            observed_replicas.remove(&key);
                        }
                        self.inner.state_cache.delete_set(&gss);
                    }
                    Ok(Event::Restarted(sets)) => {
                        observed_replicas.clear();
                        for gss in sets {
                            if let Some(key) = WorkerQueue::key_for(&gss) {
                                observed_replicas.insert(key, gss.spec.replicas);
                            }
                            self.inner.workerqueue.enqueue(&gss);
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, "error from GameServerSet watch stream");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                },
                Some(res) = gs_stream.next() => match res {
                    Ok(Event::Applied(gs)) => {
                        // Ignore if already being deleted.
                        if gs.metadata.deletion_timestamp.is_none() {
                            self.inner.enqueue_owner(&gs);
                        }
                    }
                    Ok(Event::Deleted(gs)) => self.inner.enqueue_owner(&gs),
                    Ok(Event::Restarted(_)) => (),
                    Err(err) => {
                        tracing::error!(error = ?err, "error from GameServer watch stream");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                },
                _ = shutdown.next() => break,
            }
        }

        if let Err(err) = workers.await.context("error joining GameServerSet controller workers").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down GameServerSet controller workers");
        }
        Ok(())
    }
}

impl Inner {
    /// Enqueue the set owning the given GameServer, immediately.
    fn enqueue_owner(&self, gs: &GameServer) {
        let owner = match controller_of(&gs.metadata) {
            Some(owner) if owner.kind == "GameServerSet" => owner,
            _ => return,
        };
        let namespace = gs.metadata.namespace.as_deref().unwrap_or_default();
        match self.game_server_sets.get(&ObjectRef::new(&owner.name).within(namespace)) {
            Some(gss) => self.workerqueue.enqueue_immediately(&gss),
            None => tracing::debug!(owner = %owner.name, "owner GameServerSet no longer available for syncing"),
        }
    }

    /// Synchronise the GameServers for the keyed set, making sure there are
    /// always as many GameServers as requested.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn sync_game_server_set(self: &Arc<Self>, key: String) -> Result<()> {
        let (namespace, name) = match WorkerQueue::split_key(&key) {
            Some(parts) => parts,
            None => {
                // Don't retry; the key can never resolve.
                tracing::error!(%key, "invalid resource key, dropping");
                return Ok(());
            }
        };

        let gss = match self.game_server_sets.get(&ObjectRef::new(name).within(namespace)) {
            Some(gss) => gss,
            None => {
                tracing::debug!(%key, "GameServerSet is no longer available for syncing");
                return Ok(());
            }
        };

        let list = self.list_game_servers(&gss);
        let list = self.state_cache.for_set(&gss).reconcile_with_updated_server_list(list);

        let target = gss.spec.replicas.max(0) as usize;
        let (num_to_add, to_delete, is_partial) = compute_reconciliation_action(
            &list,
            target,
            MAX_GAME_SERVER_CREATIONS_PER_BATCH,
            MAX_GAME_SERVER_DELETIONS_PER_BATCH,
            MAX_POD_PENDING_COUNT,
        );

        tracing::debug!(
            gss = %RequiredMetadata::name(&gss),
            target,
            num_to_add,
            num_to_delete = to_delete.len(),
            is_partial,
            "reconciling GameServerSet",
        );

        if num_to_add > 0 {
            if let Err(err) = self.create_game_servers(&gss, num_to_add).await {
                tracing::warn!(error = ?err, "error adding GameServers");
            }
        }

        if !to_delete.is_empty() {
            let to_delete: Vec<GameServer> = to_delete.into_iter().cloned().collect();
            // Hold the allocation mutex so nothing races into Allocated
            // while we shut these down.
            let _guard = self.allocation_mutex.lock().await;
            if let Err(err) = self.delete_game_servers(&gss, to_delete).await {
                tracing::warn!(error = ?err, "error deleting GameServers");
            }
        }

        self.sync_game_server_set_status(&gss, &list).await?;

        if is_partial {
            // There is work left that this pass chose not to do; get a follow-up
            // after the rest of the queue has had a chance to run.
            self.workerqueue.enqueue_immediately(&gss);
        }
        Ok(())
    }

    /// The GameServers owned by the given set, from the local cache.
    fn list_game_servers(&self, gss: &GameServerSet) -> Vec<GameServer> {
        let namespace = RequiredMetadata::namespace(gss);
        let uid = RequiredMetadata::uid(gss);
        self.game_servers
            .state()
            .into_iter()
            .filter(|gs| gs.metadata.namespace.as_deref() == Some(namespace))
            .filter(|gs| controller_of(&gs.metadata).map(|owner| owner.uid == uid).unwrap_or(false))
            .collect()
    }

    /// Create `count` more GameServers from the set's template, with bounded
    /// parallelism.
    async fn create_game_servers(self: &Arc<Self>, gss: &GameServerSet, count: usize) -> Result<()> {
        let name = RequiredMetadata::name(gss).to_string();
        tracing::debug!(count, gss = %name, "adding more GameServers");

        let api: Api<GameServer> = Api::namespaced(self.client.clone(), RequiredMetadata::namespace(gss));
        let state_cache = self.state_cache.for_set(gss);
        parallelize((0..count).map(|_| gss.game_server()), MAX_CREATION_PARALLELISM, |gs| {
            let api = api.clone();
            let state_cache = state_cache.clone();
            let name = name.clone();
            async move {
                let created = api
                    .create(&PostParams::default(), &gs)
                    .await
                    .with_context(|| format!("error creating GameServer for GameServerSet {}", name))?;

                state_cache.created(&created);
                metrics::counter!("gameserversets_created_total", 1);
                self.recorder
                    .normal(gss, REASON_SUCCESSFUL_CREATE, "Creating", format!("Created GameServer: {}", RequiredMetadata::name(&created)))
                    .await;
                Ok(())
            }
        })
        .await
    }

    /// Tear the given GameServers down, with bounded parallelism.
    ///
    /// GameServers are not deleted directly; their state is set to Shutdown and
    /// the GameServer controller performs the teardown.
    async fn delete_game_servers(self: &Arc<Self>, gss: &GameServerSet, to_delete: Vec<GameServer>) -> Result<()> {
        tracing::debug!(count = to_delete.len(), gss = %RequiredMetadata::name(gss), "deleting GameServers");

        let api: Api<GameServer> = Api::namespaced(self.client.clone(), RequiredMetadata::namespace(gss));
        let state_cache = self.state_cache.for_set(gss);
        parallelize(to_delete.into_iter(), MAX_DELETION_PARALLELISM, |mut gs| {
            let api = api.clone();
            let state_cache = state_cache.clone();
            async move {
                let name = RequiredMetadata::name(&gs).to_string();
                let previous = gs.state();
                if let Some(status) = gs.status.as_mut() {
                    status.state = GameServerState::Shutdown;
                }
                api.replace_status(&name, &PostParams::default(), serde_json::to_vec(&gs)?)
                    .await
                    .with_context(|| format!("error moving GameServer {} from {:?} to Shutdown", name, previous))?;

                state_cache.deleted(&gs);
                metrics::counter!("gameserversets_deleted_total", 1);
                self.recorder
                    .normal(gss, REASON_SUCCESSFUL_DELETE, "Deleting", format!("Deleted GameServer: {}", name))
                    .await;
                Ok(())
            }
        })
        .await
    }

    /// Synchronise the set's status with the active GameServer counts,
    /// skipping the write when nothing changed.
    async fn sync_game_server_set_status(&self, gss: &GameServerSet, list: &[GameServer]) -> Result<()> {
        let status = compute_status(list);
        if gss.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let name = RequiredMetadata::name(gss).to_string();
        let mut updated = gss.clone();
        updated.status = Some(status);
        let api: Api<GameServerSet> = Api::namespaced(self.client.clone(), RequiredMetadata::namespace(gss));
        api.replace_status(&name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await
            .with_context(|| format!("error updating status on GameServerSet {}", name))?;
        Ok(())
    }
}

/// Compute the action to take to reconcile a GameServerSet, given the list of
/// owned GameServers and the target replica count.
///
/// Returns the number of GameServers to create, the GameServers to tear down,
/// and whether batch caps made this a partial pass.
pub(crate) fn compute_reconciliation_action<'a>(
    list: &'a [GameServer],
    target: usize,
    max_creations: usize,
    max_deletions: usize,
    max_pending: usize,
) -> (usize, Vec<&'a GameServer>, bool) {
    let mut up_count = 0; // up == Ready or will become ready.

    // The number of Pods being created at this moment, to bound in-flight work
    // at a throughput the cluster can handle.
    let mut pod_pending_count = 0;
    let mut to_delete: Vec<&GameServer> = Vec::new();

    // Pass 1: count Allocated GameServers only, since those can't be touched.
    for gs in list {
        if is_allocated(gs) {
            up_count += 1;
        }
    }

    // Pass 2: classify every other state.
    for gs in list {
        if is_allocated(gs) {
            continue;
        }
        // A GameServer being deleted counts towards the target replica count:
        // it is pending teardown and will free a slot soon.
        if gs.is_being_deleted() {
            continue;
        }

        let (pending, delete) = match gs.state() {
            Some(GameServerState::Error) | Some(GameServerState::Unhealthy) => (false, true),
            Some(GameServerState::PortAllocation)
            | Some(GameServerState::Creating)
            | Some(GameServerState::Starting)
            | Some(GameServerState::Scheduled) => (true, false),
            // RequestReady, Ready and Shutdown (deleted soon) count as up, as
            // does any state this controller does not recognize.
            _ => (false, false),
        };

        if delete {
            to_delete.push(gs);
            continue;
        }
        if pending {
            pod_pending_count += 1;
        }
        if up_count >= target {
            to_delete.push(gs);
        } else {
            up_count += 1;
        }
    }

    let mut partial_reconciliation = false;
    let mut num_to_add = 0;

    if up_count < target {
        num_to_add = target - up_count;
        let original = num_to_add;

        if num_to_add > max_creations {
            num_to_add = max_creations;
        }
        if num_to_add + pod_pending_count > max_pending {
            num_to_add = max_pending.saturating_sub(pod_pending_count);
        }

        if original != num_to_add {
            partial_reconciliation = true;
        }
    }

    if to_delete.len() > max_deletions {
        // We have to pick which GameServers to tear down; take the newest
        // first, as they are the least likely to be serving traffic.
        to_delete.sort_by(|a, b| creation_timestamp(b).cmp(&creation_timestamp(a)));
        to_delete.truncate(max_deletions);
        partial_reconciliation = true;
    }

    (num_to_add, to_delete, partial_reconciliation)
}

fn is_allocated(gs: &GameServer) -> bool {
    gs.metadata.deletion_timestamp.is_none() && gs.state() == Some(GameServerState::Allocated)
}

fn creation_timestamp(gs: &GameServer) -> chrono::DateTime<chrono::Utc> {
    gs.metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}

/// Compute the status of a GameServerSet from its listed GameServers.
pub(crate) fn compute_status(list: &[GameServer]) -> GameServerSetStatus {
    let mut status = GameServerSetStatus {
        replicas: list.len() as i32,
        ..Default::default()
    };
    for gs in list {
        match gs.state() {
            Some(GameServerState::Ready) => status.ready_replicas += 1,
            Some(GameServerState::Allocated) => status.allocated_replicas += 1,
            _ => (),
        }
    }
    status
}

/// Process the given items with the specified degree of parallelism.
///
/// All workers join before this returns; the first error observed is returned,
/// not necessarily in submission order.
async fn parallelize<I, T, F, Fut>(items: I, parallelism: usize, work: F) -> Result<()>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut stream = futures::stream::iter(items.into_iter().map(work)).buffer_unordered(parallelism);
    let mut first_err = None;
    while let Some(res) = stream.next().await {
        if let Err(err) = res {
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
