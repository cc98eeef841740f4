use anyhow::Result;
use axum::extract;
use kube::core::admission::AdmissionReview;
use serde_json::json;

use agones_core::crd::{GameServer, GameServerSet, GameServerSetSpec, GameServerTemplateSpec, SchedulingStrategy};

use super::webhook::{mutate_game_server, validate_game_server_set};
use crate::fixtures::{game_server, single_container_spec};

fn game_server_set(replicas: i32) -> GameServerSet {
    let mut gss = GameServerSet::new(
        "test",
        GameServerSetSpec {
            replicas,
            scheduling: SchedulingStrategy::Packed,
            template: GameServerTemplateSpec {
                metadata: Default::default(),
                spec: single_container_spec(),
            },
        },
    );
    gss.metadata.namespace = Some("default".into());
    gss
}

fn update_review(old: &GameServerSet, new: &GameServerSet) -> Result<AdmissionReview<GameServerSet>> {
    let value = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-uid",
            "kind": {"group": "stable.agones.dev", "version": "v1alpha1", "kind": "GameServerSet"},
            "resource": {"group": "stable.agones.dev", "version": "v1alpha1", "resource": "gameserversets"},
            "name": "test",
            "namespace": "default",
            "operation": "UPDATE",
            "userInfo": {},
            "object": new,
            "oldObject": old,
        }
    });
    Ok(serde_json::from_value(value)?)
}

fn create_review(gs: &GameServer) -> Result<AdmissionReview<GameServer>> {
    let value = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-uid",
            "kind": {"group": "stable.agones.dev", "version": "v1alpha1", "kind": "GameServer"},
            "resource": {"group": "stable.agones.dev", "version": "v1alpha1", "resource": "gameservers"},
            "name": "test",
            "namespace": "default",
            "operation": "CREATE",
            "userInfo": {},
            "object": gs,
        }
    });
    Ok(serde_json::from_value(value)?)
}

#[tokio::test]
async fn validate_allows_replica_updates() -> Result<()> {
    let old = game_server_set(3);
    let new = game_server_set(10);

    let review = update_review(&old, &new)?;
    let res = validate_game_server_set(extract::Json(review)).await.expect("infallible");
    let response = res.0.response.expect("response populated");
    assert!(response.allowed, "replica-only update should be allowed");
    Ok(())
}

#[tokio::test]
async fn validate_rejects_template_updates() -> Result<()> {
    let old = game_server_set(3);
    let mut new = game_server_set(3);
    new.spec.template.spec.ports[0].container_port = 9999;

    let review = update_review(&old, &new)?;
    let res = validate_game_server_set(extract::Json(review)).await.expect("infallible");
    let response = res.0.response.expect("response populated");
    assert!(!response.allowed, "template mutation must be rejected");
    let value = serde_json::to_value(&response)?;
    let message = value["status"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("template"), "rejection should name the template field, got {}", message);
    Ok(())
}

#[tokio::test]
async fn mutate_returns_a_defaulting_patch() -> Result<()> {
    let gs = game_server("test");

    let review = create_review(&gs)?;
    let res = mutate_game_server(extract::Json(review)).await.expect("infallible");
    let response = res.0.response.expect("response populated");
    assert!(response.allowed);
    let patch = response.patch.expect("defaults patch populated");
    assert!(!patch.is_empty());
    Ok(())
}

#[tokio::test]
async fn mutate_rejects_invalid_game_servers() -> Result<()> {
    let mut gs = game_server("test");
    // Dynamic policy with an explicit host port is invalid.
    gs.spec.ports[0].host_port = 7777;

    let review = create_review(&gs)?;
    let res = mutate_game_server(extract::Json(review)).await.expect("infallible");
    let response = res.0.response.expect("response populated");
    assert!(!response.allowed, "invalid GameServer must be rejected");
    let value = serde_json::to_value(&response)?;
    let message = value["status"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("hostPort"), "rejection should name the offending port, got {}", message);
    Ok(())
}
