//! Agones CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod gameserver;
mod gameserverset;


use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

pub use gameserver::{
    GameServer, GameServerPort, GameServerSpec, GameServerState, GameServerStatus, GameServerStatusPort, Health, PortPolicy, Protocol,
    SchedulingStrategy, StatusCause,
};
pub use gameserverset::{GameServerSet, GameServerSetSpec, GameServerSetStatus, GameServerTemplateSpec};

/// The API group of the Agones resources.
pub const GROUP_NAME: &str = "stable.agones.dev";
/// The label in which the Agones role is specified. Pods from a GameServer carry the value "gameserver".
pub const ROLE_LABEL: &str = "stable.agones.dev/role";
/// The GameServer label value for `ROLE_LABEL`.
pub const GAME_SERVER_ROLE: &str = "gameserver";
/// The label storing the name of the GameServer on the Pod the GameServer controls.
pub const GAME_SERVER_POD_LABEL: &str = "stable.agones.dev/gameserver";
/// The label storing the name of the owning GameServerSet on GameServers created from its template.
pub const GAME_SERVER_SET_LABEL: &str = "stable.agones.dev/gameserverset";
/// The annotation storing which container runs the dedicated game server.
pub const GAME_SERVER_CONTAINER_ANNOTATION: &str = "stable.agones.dev/container";
/// The annotation storing the version of the SDK sidecar this build ships.
pub const SDK_VERSION_ANNOTATION: &str = "stable.agones.dev/sdk-version";
/// The annotation marking a GameServer as a local development server.
///
/// No Pod is created for development GameServers; status is populated
/// straight from the annotation value, which must be a valid IP address.
pub const DEV_ADDRESS_ANNOTATION: &str = "stable.agones.dev/dev-address";
/// The default service account for managing access to get/update GameServers.
pub const SIDECAR_SERVICE_ACCOUNT: &str = "agones-sdk";
/// The cluster-autoscaler annotation which pins a Pod's node.
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;

    /// The UID of this object.
    fn uid(&self) -> &str;
}

impl RequiredMetadata for GameServer {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn uid(&self) -> &str {
        self.meta().uid.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for GameServerSet {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn uid(&self) -> &str {
        self.meta().uid.as_deref().unwrap_or_default()
    }
}

/// Find the controlling owner reference of the given object metadata, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references.as_ref()?.iter().find(|r| r.controller == Some(true))
}
