//! Shared fixtures for controller tests.

use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::{Container, Node, NodeSpec, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use agones_core::crd::{
    GameServer, GameServerPort, GameServerSpec, GameServerState, GameServerStatus, Health, PortPolicy, Protocol, SchedulingStrategy,
};

/// A GameServerSpec with a single game server container and one dynamic port.
pub fn single_container_spec() -> GameServerSpec {
    GameServerSpec {
        container: String::new(),
        ports: vec![GameServerPort {
            name: "default".into(),
            port_policy: PortPolicy::Dynamic,
            container_port: 7777,
            host_port: 0,
            protocol: Protocol::Udp,
        }],
        health: Health::default(),
        scheduling: SchedulingStrategy::Packed,
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta::default()),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "simple-game-server".into(),
                    image: Some("gcr.io/test/image:0.1".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
    }
}

/// A named GameServer in the default namespace, defaults not yet applied.
pub fn game_server(name: &str) -> GameServer {
    let mut gs = GameServer::new(name, single_container_spec());
    gs.metadata.namespace = Some("default".into());
    gs.metadata.uid = Some(format!("{}-uid", name));
    gs
}

/// A bare GameServer carrying only a state, for reconciliation tables.
pub fn gs_with_state(state: GameServerState) -> GameServer {
    let mut gs = GameServer::new("", single_container_spec());
    gs.metadata.name = None;
    gs.status = Some(status_with_state(state));
    gs
}

/// Like `gs_with_state`, but carrying a deletion timestamp.
pub fn gs_pending_deletion_with_state(state: GameServerState) -> GameServer {
    let mut gs = gs_with_state(state);
    gs.metadata.deletion_timestamp = Some(Time(Utc::now()));
    gs
}

/// Stamp the GameServer's creation time `offset_secs` after a fixed origin.
pub fn with_creation_offset(mut gs: GameServer, offset_secs: i64) -> GameServer {
    gs.metadata.creation_timestamp = Some(Time(Utc::now() + Duration::seconds(offset_secs)));
    gs
}

pub fn status_with_state(state: GameServerState) -> GameServerStatus {
    GameServerStatus {
        state,
        ports: Vec::new(),
        address: String::new(),
        node_name: String::new(),
    }
}

/// A named node, optionally marked unschedulable.
pub fn node(name: &str, unschedulable: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        }),
        status: None,
    }
}
