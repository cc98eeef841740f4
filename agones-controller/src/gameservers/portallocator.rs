//! The dynamic host port allocation strategy.
//!
//! Only use the exposed methods to ensure appropriate locking is taken.
//! The allocator does not currently support mixing static port allocations
//! (or any pods with a defined HostPort) within the dynamic port window
//! other than the ones it coordinates.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::runtime::reflector::{reflector, store::Writer};
use kube::runtime::watcher::{watcher, Event};
use kube::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use agones_core::crd::{GameServer, PortPolicy, RequiredMetadata};

use crate::config::Config;

/// A set of port allocations for a single node.
type PortAllocation = HashMap<i32, bool>;

/// Allocates host ports for GameServers from a fixed `[min_port, max_port]` window.
pub struct PortAllocator {
    min_port: i32,
    max_port: i32,
    state: RwLock<AllocatorState>,
}

#[derive(Default)]
struct AllocatorState {
    /// An ordered sequence of per-node port maps.
    port_allocations: Vec<PortAllocation>,
    /// The UIDs of the GameServers this allocator has assigned ports to.
    game_server_registry: HashMap<String, bool>,
}

impl PortAllocator {
    /// Create a new dynamic port allocator for the given host port window.
    pub fn new(min_port: i32, max_port: i32) -> Arc<Self> {
        tracing::info!(min_port, max_port, "starting port allocator");
        Arc::new(Self {
            min_port,
            max_port,
            state: RwLock::new(AllocatorState::default()),
        })
    }

    /// Spawn the allocator's watch loop.
    ///
    /// This sets up the current state of port allocations from the observed
    /// cluster state and then tracks GameServer deletions to release ports.
    pub fn spawn(self: Arc<Self>, client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(client, config, shutdown_tx))
    }

    async fn run(self: Arc<Self>, client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
        let nodes_api: Api<Node> = Api::all(client.clone());
        let node_writer = Writer::<Node>::default();
        let node_store = node_writer.as_reader();
        let node_stream = reflector(node_writer, watcher(nodes_api, ListParams::default()));

        let gs_api: Api<GameServer> = Api::namespaced(client, &config.namespace);
        let gs_writer = Writer::<GameServer>::default();
        let gs_store = gs_writer.as_reader();
        let gs_stream = reflector(gs_writer, watcher(gs_api, ListParams::default()));

        tokio::pin!(node_stream, gs_stream);

        tracing::info!("port allocator initialized");
        let mut shutdown = BroadcastStream::new(shutdown_tx.subscribe());
        let (mut nodes_synced, mut game_servers_synced, mut cold_start_done) = (false, false, false);
        loop {
            tokio::select! {
                Some(res) = node_stream.next() => match res {
                    Ok(Event::Restarted(_)) => nodes_synced = true,
                    Ok(_) => (),
                    Err(err) => {
                        tracing::error!(error = ?err, "error from node watch stream");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                },
                Some(res) = gs_stream.next() => match res {
                    Ok(Event::Deleted(gs)) => {
                        tracing::debug!(gs = %RequiredMetadata::name(&gs), "syncing deleted GameServer");
                        self.deallocate(&gs);
                    }
                    Ok(Event::Restarted(_)) => game_servers_synced = true,
                    Ok(_) => (),
                    Err(err) => {
                        tracing::error!(error = ?err, "error from GameServer watch stream");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                },
                _ = shutdown.next() => break,
            }

            // On the first full listing of both caches, start with a perfect slate.
            if nodes_synced && game_servers_synced && !cold_start_done {
                cold_start_done = true;
                self.sync_all(node_store.state(), gs_store.state());
            }
        }

        Ok(())
    }

    /// Assign host ports to every dynamic port of the GameServer and return it.
    ///
    /// Allocation is total: if the observed node set has run out of ports, a
    /// brand new node-sized port map is synthesized and allocation retried.
    /// To scale up, GameServers are created before they can be scheduled on
    /// the current set of nodes, so there must always be ports available.
    pub fn allocate(&self, mut gs: GameServer) -> GameServer {
        let mut state = self.write_state();

        let amount = gs.count_ports(PortPolicy::Dynamic);
        loop {
            let open = Self::find_open_ports(&state.port_allocations, amount);
            if open.len() == amount {
                state.game_server_registry.insert(RequiredMetadata::uid(&gs).to_string(), true);

                let mut open = open.into_iter();
                for port in gs.spec.ports.iter_mut() {
                    if port.port_policy == PortPolicy::Dynamic {
                        if let Some((node, host_port)) = open.next() {
                            state.port_allocations[node].insert(host_port, true);
                            port.host_port = host_port;
                        }
                    }
                }
                return gs;
            }

            let fresh = self.new_port_allocation();
            state.port_allocations.push(fresh);
        }
    }

    /// Mark the GameServer's ports as no longer allocated.
    ///
    /// A no-op for GameServers this allocator never assigned ports to.
    pub fn deallocate(&self, gs: &GameServer) {
        let uid = RequiredMetadata::uid(gs);
        let found = { self.read_state().game_server_registry.contains_key(uid) };
        if !found {
            tracing::debug!(gs = %RequiredMetadata::name(gs), "did not allocate this GameServer, ignoring for deallocation");
            return;
        }

        let mut state = self.write_state();
        for port in &gs.spec.ports {
            if port.host_port < self.min_port || port.host_port > self.max_port {
                continue;
            }
            set_port_allocation(&mut state.port_allocations, port.host_port, false);
        }
        state.game_server_registry.remove(uid);
    }

    /// Rebuild the allocator's state from the observed nodes and GameServers.
    ///
    /// This is basically a stop-the-world garbage collection on port
    /// allocations, but it only happens on startup.
    pub fn sync_all(&self, nodes: Vec<Node>, game_servers: Vec<GameServer>) {
        tracing::info!("resetting port allocation");

        // Blank port maps for every schedulable node.
        let mut node_allocations: HashMap<String, PortAllocation> = nodes
            .iter()
            .filter(|node| !node.spec.as_ref().and_then(|spec| spec.unschedulable).unwrap_or(false))
            .filter_map(|node| node.metadata.name.clone())
            .map(|name| (name, self.new_port_allocation()))
            .collect();
        let mut node_counts: HashMap<String, i64> = node_allocations.keys().map(|name| (name.clone(), 0)).collect();

        let mut registry = HashMap::new();
        // GameServers holding a port but not yet assigned a node.
        let mut orphaned_ports = Vec::new();

        for gs in &game_servers {
            for port in &gs.spec.ports {
                if port.port_policy != PortPolicy::Dynamic {
                    continue;
                }
                registry.insert(RequiredMetadata::uid(gs).to_string(), true);

                let node_name = gs.status.as_ref().map(|status| status.node_name.as_str()).unwrap_or_default();
                match node_allocations.get_mut(node_name) {
                    // A missing node likely means the GameServer is unscheduled.
                    Some(allocation) if !node_name.is_empty() => {
                        allocation.insert(port.host_port, true);
                        if let Some(count) = node_counts.get_mut(node_name) {
                            *count += 1;
                        }
                    }
                    _ if port.host_port != 0 => orphaned_ports.push(port.host_port),
                    _ => (),
                }
            }
        }

        // Order nodes by descending usage, since that is how they would have
        // originally been allocated across the ordered sequence.
        let mut keys: Vec<String> = node_allocations.keys().cloned().collect();
        keys.sort_by(|a, b| node_counts[b].cmp(&node_counts[a]));
        let mut allocations: Vec<PortAllocation> = keys.iter().filter_map(|key| node_allocations.remove(key)).collect();

        // Close off each orphaned port on the first node map where it is free.
        // We don't mind which node carries the reservation; only that the port
        // is held *somewhere*, as the default scheduler re-routes pods based on
        // their HostPort.
        for port in orphaned_ports {
            set_port_allocation(&mut allocations, port, true);
        }

        let mut state = self.write_state();
        state.port_allocations = allocations;
        state.game_server_registry = registry;
    }

    /// The number of distinct GameServers currently holding allocations.
    pub fn registry_len(&self) -> usize {
        self.read_state().game_server_registry.len()
    }

    /// The number of ports currently marked taken across all node maps.
    pub fn ports_taken(&self) -> usize {
        let state = self.read_state();
        state
            .port_allocations
            .iter()
            .map(|allocation| allocation.values().filter(|taken| **taken).count())
            .sum()
    }

    /// Collect the first `amount` open `(node index, port)` pairs across the
    /// ordered node maps. Enumeration order within a node is the map's, which
    /// is deliberately unspecified.
    fn find_open_ports(allocations: &[PortAllocation], amount: usize) -> Vec<(usize, i32)> {
        let mut open = Vec::with_capacity(amount);
        for (node, allocation) in allocations.iter().enumerate() {
            for (port, taken) in allocation.iter() {
                if !taken {
                    open.push((node, *port));
                    // Only allocate as many ports as asked for by the GameServer.
                    if open.len() == amount {
                        return open;
                    }
                }
            }
        }
        open
    }

    fn new_port_allocation(&self) -> PortAllocation {
        (self.min_port..=self.max_port).map(|port| (port, false)).collect()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, AllocatorState> {
        self.state.read().expect("port allocator lock poisoned")
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, AllocatorState> {
        self.state.write().expect("port allocator lock poisoned")
    }
}

/// Flip the given port in the first node map whose record differs from `taken`.
fn set_port_allocation(allocations: &mut [PortAllocation], port: i32, taken: bool) {
    for allocation in allocations.iter_mut() {
        if let Some(value) = allocation.get_mut(&port) {
            if *value != taken {
                *value = taken;
                break;
            }
        }
    }
}
