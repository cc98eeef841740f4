//! GameServerSet CRD.
//!
//! A replicated collection of GameServers with a target replica count.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{GameServer, GameServerSpec, RequiredMetadata, SchedulingStrategy, StatusCause, GAME_SERVER_SET_LABEL};

pub type GameServerSet = GameServerSetCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the GameServerSet resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "GameServerSetCRD",
    status = "GameServerSetStatus",
    group = "stable.agones.dev",
    version = "v1alpha1",
    kind = "GameServerSet",
    namespaced,
    derive = "PartialEq",
    shortname = "gss",
    printcolumn = r#"{"name":"Desired","type":"number","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"number","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"number","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Allocated","type":"number","jsonPath":".status.allocatedReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    /// The target number of GameServers this set should maintain.
    pub replicas: i32,
    /// Scheduling strategy, propagated to every GameServer created from the template.
    /// Defaults to "Packed".
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Template describes the GameServers that will be created from this set.
    pub template: GameServerTemplateSpec,
}

/// A template for GameServers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct GameServerTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: GameServerSpec,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    /// The number of non-deleted GameServers owned by this set.
    #[serde(default)]
    pub replicas: i32,
    /// The number of owned GameServers in the Ready state.
    #[serde(default)]
    pub ready_replicas: i32,
    /// The number of owned GameServers in the Allocated state.
    #[serde(default)]
    pub allocated_replicas: i32,
}

impl GameServerSetCRD {
    /// Instantiate a single GameServer from this set's template.
    ///
    /// The GameServer is given a generated name prefixed with the set's name, so
    /// there can be no collisions, and is controller-ref'd to this set.
    pub fn game_server(&self) -> GameServer {
        let name = RequiredMetadata::name(self);
        let mut gs = GameServer::new("", self.spec.template.spec.clone());
        gs.metadata = self.spec.template.metadata.clone();

        // Switch to generateName so we always get a unique name for the GameServer.
        gs.metadata.name = None;
        gs.metadata.generate_name = Some(format!("{}-", name));
        gs.metadata.namespace = self.metadata.namespace.clone();
        gs.metadata.resource_version = None;
        gs.metadata.uid = None;
        gs.spec.scheduling = self.spec.scheduling;

        // Record the set's name as a label, for easy lookup of its GameServers.
        gs.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(GAME_SERVER_SET_LABEL.to_string(), name.to_string());
        gs.metadata
            .owner_references
            .get_or_insert_with(Default::default)
            .push(self.controller_ref());

        gs
    }

    /// Validate an update moving this GameServerSet to `new`.
    ///
    /// Replica changes are allowed; any meaningful change to the template is not.
    pub fn validate_update(&self, new: &GameServerSetCRD) -> Vec<StatusCause> {
        let mut causes = Vec::new();
        if self.spec.template != new.spec.template {
            causes.push(StatusCause {
                field: "template".into(),
                message: "template values cannot be updated after creation".into(),
            });
        }
        causes
    }

    /// A controller owner reference pointing at this GameServerSet.
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: GameServerSetCRD::api_version(&()).into_owned(),
            kind: GameServerSetCRD::kind(&()).into_owned(),
            name: RequiredMetadata::name(self).to_string(),
            uid: RequiredMetadata::uid(self).to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}
