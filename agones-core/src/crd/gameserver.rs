//! GameServer CRD.
//!
//! The state machine, defaulting and validation rules, and the Pod
//! projection for a single dedicated game server.

use std::fmt;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, Pod, PodAffinity, PodAffinityTerm, PodTemplateSpec, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{
    RequiredMetadata, DEV_ADDRESS_ANNOTATION, GAME_SERVER_CONTAINER_ANNOTATION, GAME_SERVER_POD_LABEL, GAME_SERVER_ROLE, GROUP_NAME,
    ROLE_LABEL, SAFE_TO_EVICT_ANNOTATION, SDK_VERSION_ANNOTATION, SIDECAR_SERVICE_ACCOUNT,
};
use crate::Error;

pub type GameServer = GameServerCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the GameServer resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "GameServerCRD",
    status = "GameServerStatus",
    group = "stable.agones.dev",
    version = "v1alpha1",
    kind = "GameServer",
    namespaced,
    derive = "PartialEq",
    shortname = "gs",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.address"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Container specifies which Pod container is the game server. Only required if there
    /// is more than one container defined.
    #[serde(default)]
    pub container: String,
    /// Ports are the array of ports that can be exposed via the game server.
    #[serde(default)]
    pub ports: Vec<GameServerPort>,
    /// Health configures health checking.
    #[serde(default)]
    pub health: Health,
    /// Scheduling strategy. Defaults to "Packed".
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Template describes the Pod that will be created for the GameServer.
    pub template: PodTemplateSpec,
}

/// The current lifecycle state of a GameServer.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum GameServerState {
    /// A dynamically allocating GameServer is being created, an open port needs
    /// to be allocated.
    PortAllocation,
    /// The Pod for the GameServer is being created.
    Creating,
    /// The Pods for the GameServer are being created but are not yet Scheduled.
    Starting,
    /// We have determined that the Pod has been scheduled in the cluster --
    /// basically, we have a NodeName.
    Scheduled,
    /// The GameServer has declared that it is ready.
    RequestReady,
    /// The GameServer is ready to take connections from game clients.
    Ready,
    /// The GameServer has shutdown and everything needs to be deleted from the cluster.
    Shutdown,
    /// Something has gone wrong with the GameServer and it cannot be resolved.
    Error,
    /// The GameServer has failed its health checks.
    Unhealthy,
    /// The GameServer has been allocated to a session.
    Allocated,
}

impl GameServerState {
    /// Whether this state is terminal for reconciliation purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Error | Self::Unhealthy)
    }
}

impl fmt::Display for GameServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The policy for how a port's HostPort is populated.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PortPolicy {
    /// The user defines the host port to be used in the configuration.
    Static,
    /// The system will choose an open port for the GameServer in question.
    Dynamic,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self::Dynamic
    }
}

/// The network protocol exposed by a GameServer port.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum Protocol {
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Udp
    }
}

/// The strategy used when scheduling GameServer Pods across a cluster.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum SchedulingStrategy {
    /// Prefer co-locating GameServer Pods onto the same nodes, to bin pack as many
    /// GameServers on a single node as possible. Most useful for dynamically sized
    /// clusters, such as on cloud providers.
    Packed,
    /// No affinity; let the platform spread Pods freely. Most useful for statically
    /// sized clusters, such as on physical hardware.
    Distributed,
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        Self::Packed
    }
}

/// Health configures health checking on the GameServer.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// Whether health checking is disabled or not.
    #[serde(default)]
    pub disabled: bool,
    /// The number of seconds each health ping has to occur in.
    #[serde(default)]
    pub period_seconds: i32,
    /// How many failures in a row constitutes unhealthy.
    #[serde(default)]
    pub failure_threshold: i32,
    /// Initial delay before checking health.
    #[serde(default)]
    pub initial_delay_seconds: i32,
}

/// A port to be exposed via the GameServer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    /// Name is the descriptive name of the port.
    #[serde(default)]
    pub name: String,
    /// PortPolicy defines the policy for how the HostPort is populated.
    /// Dynamic will allocate a HostPort within the min/max port window passed to the
    /// controller at installation time. When `static` is specified, `HostPort` is
    /// required, and is the port that game clients will connect to.
    #[serde(default)]
    pub port_policy: PortPolicy,
    /// ContainerPort is the port that is being opened on the game server process.
    pub container_port: i32,
    /// HostPort the port exposed on the host for clients to connect to.
    #[serde(default)]
    pub host_port: i32,
    /// Protocol is the network protocol being used. Defaults to UDP. TCP is the only
    /// other option.
    #[serde(default)]
    pub protocol: Protocol,
}

impl GameServerPort {
    /// The status projection of this port.
    pub fn status_port(&self) -> GameServerStatusPort {
        GameServerStatusPort {
            name: self.name.clone(),
            port: self.host_port,
        }
    }
}

/// CRD status object.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    /// The current state of the GameServer, e.g. Creating, Starting, Ready.
    pub state: GameServerState,
    #[serde(default)]
    pub ports: Vec<GameServerStatusPort>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
}

/// The port that was allocated to a GameServer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct GameServerStatusPort {
    #[serde(default)]
    pub name: String,
    pub port: i32,
}

/// A single cause of a rejected resource, returned through the admission webhooks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusCause {
    /// The field of the resource the cause refers to.
    pub field: String,
    /// A human readable description of the cause.
    pub message: String,
}

impl fmt::Display for StatusCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl GameServerCRD {
    /// Apply default values to this GameServer where not already populated.
    ///
    /// Applying defaults to an already-defaulted GameServer is a no-op.
    pub fn apply_defaults(&mut self) {
        let finalizers = self.metadata.finalizers.get_or_insert_with(Default::default);
        if !finalizers.iter().any(|f| f == GROUP_NAME) {
            finalizers.push(GROUP_NAME.to_string());
        }

        self.apply_container_defaults();
        self.apply_state_defaults();
        self.apply_health_defaults();
    }

    fn apply_container_defaults(&mut self) {
        if let Some(pod_spec) = &self.spec.template.spec {
            if pod_spec.containers.len() == 1 {
                self.spec.container = pod_spec.containers[0].name.clone();
            }
        }
    }

    fn apply_state_defaults(&mut self) {
        if self.status.is_none() {
            let state = if self.has_port_policy(PortPolicy::Dynamic) {
                GameServerState::PortAllocation
            } else {
                GameServerState::Creating
            };
            self.status = Some(GameServerStatus {
                state,
                ports: Vec::new(),
                address: String::new(),
                node_name: String::new(),
            });
        }
    }

    fn apply_health_defaults(&mut self) {
        let health = &mut self.spec.health;
        if !health.disabled {
            if health.period_seconds <= 0 {
                health.period_seconds = 5;
            }
            if health.failure_threshold <= 0 {
                health.failure_threshold = 3;
            }
            if health.initial_delay_seconds <= 0 {
                health.initial_delay_seconds = 5;
            }
        }
    }

    /// Validate this GameServer's configuration.
    ///
    /// An invalid GameServer yields one or more causes in the returned list.
    pub fn validate(&self) -> Vec<StatusCause> {
        let mut causes = Vec::new();

        // A container must be named when the pod template holds more than one.
        let container_count = self.spec.template.spec.as_ref().map(|spec| spec.containers.len()).unwrap_or(0);
        if self.spec.container.is_empty() && container_count > 1 {
            causes.push(StatusCause {
                field: "container".into(),
                message: "Container is required when using multiple containers in the pod template".into(),
            });
        }

        // No host port may be set when using a dynamic PortPolicy.
        for port in &self.spec.ports {
            if port.host_port > 0 && port.port_policy == PortPolicy::Dynamic {
                causes.push(StatusCause {
                    field: format!("{}.hostPort", port.name),
                    message: "HostPort cannot be specified with a Dynamic PortPolicy".into(),
                });
            }
        }

        if let Err(err) = self.find_game_server_container() {
            causes.push(StatusCause {
                field: "container".into(),
                message: err.to_string(),
            });
        }

        if let Some(address) = self.dev_address() {
            if address.parse::<IpAddr>().is_err() {
                causes.push(StatusCause {
                    field: format!("annotations.{}", DEV_ADDRESS_ANNOTATION),
                    message: format!("Value '{}' must be a valid IP address", address),
                });
            }
        }

        causes
    }

    /// The container in the pod template named by `spec.container`.
    ///
    /// Returns the index and the container value.
    pub fn find_game_server_container(&self) -> Result<(usize, Container), Error> {
        if let Some(pod_spec) = &self.spec.template.spec {
            for (i, container) in pod_spec.containers.iter().enumerate() {
                if container.name == self.spec.container {
                    return Ok((i, container.clone()));
                }
            }
        }
        Err(Error::ContainerNotFound(self.spec.container.clone()))
    }

    /// The current state of this GameServer, if status has been populated.
    pub fn state(&self) -> Option<GameServerState> {
        self.status.as_ref().map(|status| status.state)
    }

    /// Whether this GameServer has a non-zero deletion timestamp.
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether this GameServer is in a state which is terminal for reconciliation.
    pub fn is_terminal(&self) -> bool {
        self.state().map(|state| state.is_terminal()).unwrap_or(false)
    }

    /// The value of the development address annotation, if set.
    pub fn dev_address(&self) -> Option<&str> {
        self.metadata.annotations.as_ref()?.get(DEV_ADDRESS_ANNOTATION).map(String::as_str)
    }

    /// Whether any port carries the given policy.
    pub fn has_port_policy(&self, policy: PortPolicy) -> bool {
        self.spec.ports.iter().any(|p| p.port_policy == policy)
    }

    /// The number of ports which carry the given policy.
    pub fn count_ports(&self, policy: PortPolicy) -> usize {
        self.spec.ports.iter().filter(|p| p.port_policy == policy).count()
    }

    /// A controller owner reference pointing at this GameServer.
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: GameServerCRD::api_version(&()).into_owned(),
            kind: GameServerCRD::kind(&()).into_owned(),
            name: RequiredMetadata::name(self).to_string(),
            uid: RequiredMetadata::uid(self).to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Create the Pod backing this GameServer from its pod template.
    ///
    /// Any sidecars are appended after the game server container.
    pub fn pod(&self, sidecars: Vec<Container>) -> Result<Pod, Error> {
        let mut pod = Pod {
            metadata: self.spec.template.metadata.clone().unwrap_or_default(),
            spec: self.spec.template.spec.clone(),
            status: None,
        };

        self.pod_object_meta(&mut pod);

        let (index, mut gs_container) = self.find_game_server_container()?;

        let pod_spec = pod.spec.get_or_insert_with(Default::default);
        if pod_spec.service_account_name.as_deref().unwrap_or_default().is_empty() {
            pod_spec.service_account_name = Some(SIDECAR_SERVICE_ACCOUNT.to_string());
        }

        let container_ports = gs_container.ports.get_or_insert_with(Default::default);
        for port in &self.spec.ports {
            container_ports.push(ContainerPort {
                container_port: port.container_port,
                host_port: if port.host_port != 0 { Some(port.host_port) } else { None },
                protocol: Some(port.protocol.as_str().to_string()),
                ..Default::default()
            });
        }
        pod_spec.containers[index] = gs_container;
        pod_spec.containers.extend(sidecars);

        self.pod_scheduling(&mut pod);

        Ok(pod)
    }

    /// Configure the Pod ObjectMeta details.
    fn pod_object_meta(&self, pod: &mut Pod) {
        let meta = &mut pod.metadata;
        meta.generate_name = None;
        // Pods inherit the name of their GameServer. Safe, since there is a
        // guarantee that a Pod won't outlive its parent.
        meta.name = self.metadata.name.clone();
        // Pods for GameServers need to stay in the same namespace.
        meta.namespace = self.metadata.namespace.clone();
        // Make sure these are blank, just in case.
        meta.resource_version = None;
        meta.uid = None;

        let labels = meta.labels.get_or_insert_with(Default::default);
        labels.insert(ROLE_LABEL.to_string(), GAME_SERVER_ROLE.to_string());
        // Store the GameServer name as a label, for easy lookup later on.
        labels.insert(GAME_SERVER_POD_LABEL.to_string(), RequiredMetadata::name(self).to_string());

        let annotations = meta.annotations.get_or_insert_with(Default::default);
        // Store the GameServer container as an annotation, to make lookup at a Pod level easier.
        annotations.insert(GAME_SERVER_CONTAINER_ANNOTATION.to_string(), self.spec.container.clone());
        annotations.insert(SDK_VERSION_ANNOTATION.to_string(), crate::VERSION.to_string());
        if self.spec.scheduling == SchedulingStrategy::Packed {
            // The autoscaler must not remove the node this Pod is on (and evict the
            // Pod in the process).
            annotations.insert(SAFE_TO_EVICT_ANNOTATION.to_string(), "false".to_string());
        }

        meta.owner_references.get_or_insert_with(Default::default).push(self.controller_ref());
    }

    /// Apply the scheduling strategy to the passed in Pod.
    ///
    /// For `Packed` this sets a preferred-during-scheduling pod affinity on the host
    /// topology, doing a half decent job of packing GameServer Pods together.
    fn pod_scheduling(&self, pod: &mut Pod) {
        if self.spec.scheduling != SchedulingStrategy::Packed {
            return;
        }

        let mut match_labels = std::collections::BTreeMap::new();
        match_labels.insert(ROLE_LABEL.to_string(), GAME_SERVER_ROLE.to_string());
        let term = WeightedPodAffinityTerm {
            weight: 100,
            pod_affinity_term: PodAffinityTerm {
                topology_key: "kubernetes.io/hostname".to_string(),
                label_selector: Some(LabelSelector {
                    match_labels: Some(match_labels),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };

        let pod_spec = pod.spec.get_or_insert_with(Default::default);
        let affinity = pod_spec.affinity.get_or_insert_with(Affinity::default);
        let pod_affinity = affinity.pod_affinity.get_or_insert_with(PodAffinity::default);
        pod_affinity
            .preferred_during_scheduling_ignored_during_execution
            .get_or_insert_with(Default::default)
            .push(term);
    }

    /// Create a minimal JSON patch moving this GameServer to the passed in delta.
    pub fn patch_to(&self, delta: &GameServerCRD) -> Result<json_patch::Patch, Error> {
        let current = serde_json::to_value(self)?;
        let updated = serde_json::to_value(delta)?;
        Ok(json_patch::diff(&current, &updated))
    }
}
