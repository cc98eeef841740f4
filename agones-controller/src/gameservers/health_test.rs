use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodCondition, PodStatus};

use agones_core::crd::{GameServer, GameServerState};

use super::health::{failed_container, should_mark_unhealthy, unschedulable_with_no_free_ports};
use crate::fixtures::{game_server, status_with_state};

fn fixture() -> (GameServer, Pod) {
    let mut gs = game_server("test");
    gs.apply_defaults();
    let pod = gs.pod(Vec::new()).expect("pod projection");
    (gs, pod)
}

fn terminated_container_status(name: &str) -> PodStatus {
    PodStatus {
        container_statuses: Some(vec![ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn unschedulable_condition(message: &str) -> PodStatus {
    PodStatus {
        conditions: Some(vec![PodCondition {
            type_: "PodScheduled".into(),
            status: "False".into(),
            reason: Some("Unschedulable".into()),
            message: Some(message.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

#[test]
fn failed_container_matches_the_game_server_container() {
    let (gs, mut pod) = fixture();

    pod.status = Some(terminated_container_status(&gs.spec.container));
    assert!(failed_container(&pod));

    let mut pod2 = pod.clone();

    pod.status.as_mut().unwrap().container_statuses.as_mut().unwrap()[0].state = None;
    assert!(!failed_container(&pod));

    pod2.status.as_mut().unwrap().container_statuses.as_mut().unwrap()[0].name = "not-a-matching-name".into();
    assert!(!failed_container(&pod2));
}

#[test]
fn unschedulable_requires_the_no_free_ports_message() {
    let (_gs, mut pod) = fixture();

    pod.status = Some(unschedulable_condition(
        "0/4 nodes are available: 4 node(s) didn't have free ports for the requested pod ports.",
    ));
    assert!(unschedulable_with_no_free_ports(&pod));

    pod.status = Some(unschedulable_condition("not a real reason"));
    assert!(!unschedulable_with_no_free_ports(&pod));
}

#[test]
fn container_failure_gates_on_state() {
    struct Case {
        state: GameServerState,
        expected: bool,
    }
    let cases = vec![
        Case {
            state: GameServerState::Starting,
            expected: true,
        },
        // Containers may legitimately restart while scheduling settles.
        Case {
            state: GameServerState::Scheduled,
            expected: false,
        },
        Case {
            state: GameServerState::RequestReady,
            expected: true,
        },
        Case {
            state: GameServerState::Ready,
            expected: true,
        },
        Case {
            state: GameServerState::Allocated,
            expected: true,
        },
        Case {
            state: GameServerState::Creating,
            expected: false,
        },
    ];

    for case in cases {
        let (mut gs, mut pod) = fixture();
        gs.status = Some(status_with_state(case.state));
        pod.status = Some(terminated_container_status(&gs.spec.container));
        assert_eq!(
            should_mark_unhealthy(&gs, &pod),
            case.expected,
            "unexpected verdict for container failure in state {}",
            case.state
        );
    }
}

#[test]
fn port_exhaustion_is_fatal_regardless_of_state() {
    for state in vec![GameServerState::Starting, GameServerState::Scheduled, GameServerState::Creating] {
        let (mut gs, mut pod) = fixture();
        gs.status = Some(status_with_state(state));
        pod.status = Some(unschedulable_condition("3 node(s) didn't have free ports for the requested pod ports."));
        assert!(should_mark_unhealthy(&gs, &pod), "port exhaustion should be fatal in state {}", state);
    }
}

#[test]
fn healthy_pod_is_left_alone() {
    let (mut gs, pod) = fixture();
    gs.status = Some(status_with_state(GameServerState::Ready));
    assert!(!should_mark_unhealthy(&gs, &pod));
}
