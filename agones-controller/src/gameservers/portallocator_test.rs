use agones_core::crd::{GameServerState, PortPolicy};

use super::portallocator::PortAllocator;
use crate::fixtures::{game_server, node, status_with_state};

#[test]
fn allocate_assigns_distinct_ports_in_window() {
    let allocator = PortAllocator::new(7000, 7002);
    allocator.sync_all(vec![node("node1", false)], vec![]);

    let gs = allocator.allocate(game_server("gs1"));
    let port = gs.spec.ports[0].host_port;
    assert!((7000..=7002).contains(&port), "port {} outside the window", port);
    assert_eq!(allocator.registry_len(), 1);
    assert_eq!(allocator.ports_taken(), 1);
}

#[test]
fn allocate_synthesizes_node_maps_on_exhaustion() {
    // Window [7000, 7002], one node, two GameServers asking for 2 dynamic
    // ports each. The second allocation must synthesize a fresh node map.
    let allocator = PortAllocator::new(7000, 7002);
    allocator.sync_all(vec![node("node1", false)], vec![]);

    let mut first = game_server("gs1");
    first.spec.ports.push(first.spec.ports[0].clone());
    let mut second = game_server("gs2");
    second.spec.ports.push(second.spec.ports[0].clone());

    let first = allocator.allocate(first);
    let (p1, p2) = (first.spec.ports[0].host_port, first.spec.ports[1].host_port);
    assert!((7000..=7002).contains(&p1));
    assert!((7000..=7002).contains(&p2));
    assert_ne!(p1, p2);

    let second = allocator.allocate(second);
    let (p3, p4) = (second.spec.ports[0].host_port, second.spec.ports[1].host_port);
    assert!((7000..=7002).contains(&p3));
    assert!((7000..=7002).contains(&p4));
    assert_ne!(p3, p4);

    // Four allocations are held, each marked taken in exactly one node map.
    assert_eq!(allocator.ports_taken(), 4);
    assert_eq!(allocator.registry_len(), 2);
}

#[test]
fn allocate_never_starves_without_nodes() {
    // A freshly constructed allocator with no observed nodes still serves.
    let allocator = PortAllocator::new(7000, 7001);

    let gs = allocator.allocate(game_server("gs1"));
    assert!((7000..=7001).contains(&gs.spec.ports[0].host_port));
    assert_eq!(allocator.ports_taken(), 1);
}

#[test]
fn allocate_skips_static_ports() {
    let allocator = PortAllocator::new(7000, 7002);
    allocator.sync_all(vec![node("node1", false)], vec![]);

    let mut gs = game_server("gs1");
    gs.spec.ports[0].port_policy = PortPolicy::Static;
    gs.spec.ports[0].host_port = 9999;

    let gs = allocator.allocate(gs);
    assert_eq!(gs.spec.ports[0].host_port, 9999, "static host port must never be rewritten");
    assert_eq!(allocator.ports_taken(), 0);
}

#[test]
fn deallocate_releases_held_ports() {
    let allocator = PortAllocator::new(7000, 7002);
    allocator.sync_all(vec![node("node1", false)], vec![]);

    let gs = allocator.allocate(game_server("gs1"));
    assert_eq!(allocator.ports_taken(), 1);

    allocator.deallocate(&gs);
    assert_eq!(allocator.ports_taken(), 0);
    assert_eq!(allocator.registry_len(), 0);
}

#[test]
fn deallocate_ignores_unknown_game_servers() {
    let allocator = PortAllocator::new(7000, 7002);
    allocator.sync_all(vec![node("node1", false)], vec![]);

    let gs = allocator.allocate(game_server("gs1"));

    let mut stranger = game_server("stranger");
    stranger.spec.ports[0].host_port = gs.spec.ports[0].host_port;
    allocator.deallocate(&stranger);

    // The held port must survive a deallocation from a GameServer we never saw.
    assert_eq!(allocator.ports_taken(), 1);
    assert_eq!(allocator.registry_len(), 1);
}

#[test]
fn sync_all_rebuilds_from_observed_state() {
    let allocator = PortAllocator::new(7000, 7002);

    // One GameServer scheduled on node1, one allocated a port but unscheduled.
    let mut scheduled = game_server("scheduled");
    scheduled.spec.ports[0].host_port = 7000;
    let mut status = status_with_state(GameServerState::Ready);
    status.node_name = "node1".into();
    scheduled.status = Some(status);

    let mut unscheduled = game_server("unscheduled");
    unscheduled.spec.ports[0].host_port = 7001;
    unscheduled.status = Some(status_with_state(GameServerState::PortAllocation));

    allocator.sync_all(
        vec![node("node1", false), node("node2", false)],
        vec![scheduled.clone(), unscheduled.clone()],
    );

    // Both ports are reserved, each in exactly one node map.
    assert_eq!(allocator.ports_taken(), 2);
    assert_eq!(allocator.registry_len(), 2);

    // Deallocating the unscheduled reservation releases its port.
    allocator.deallocate(&unscheduled);
    assert_eq!(allocator.ports_taken(), 1);
}

#[test]
fn sync_all_skips_unschedulable_nodes() {
    let allocator = PortAllocator::new(7000, 7000);
    allocator.sync_all(vec![node("cordoned", true)], vec![]);

    // No node maps exist, but allocation still succeeds through synthesis.
    let gs = allocator.allocate(game_server("gs1"));
    assert_eq!(gs.spec.ports[0].host_port, 7000);
    assert_eq!(allocator.ports_taken(), 1);
}

#[test]
fn allocate_deallocate_churn_preserves_uniqueness() {
    let allocator = PortAllocator::new(7000, 7009);
    allocator.sync_all(vec![node("node1", false)], vec![]);

    let mut live = Vec::new();
    for i in 0..20 {
        let gs = allocator.allocate(game_server(&format!("gs{}", i)));
        live.push(gs);
        if i % 3 == 0 {
            let gs = live.remove(0);
            allocator.deallocate(&gs);
        }
    }

    // Every port held by a live GameServer is marked taken exactly once.
    let held: usize = live.iter().map(|gs| gs.spec.ports.len()).sum();
    assert_eq!(allocator.ports_taken(), held);
    assert_eq!(allocator.registry_len(), live.len());
}
