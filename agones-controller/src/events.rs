//! Event recording to the cluster's event stream.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

/// Event reason recorded for every GameServer created by a reconciler.
pub const REASON_SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
/// Event reason recorded for every GameServer torn down by a reconciler.
pub const REASON_SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
/// Event reason recorded when a GameServer fails its health checks.
pub const REASON_UNHEALTHY: &str = "Unhealthy";

/// A recorder of events against the objects a controller manages.
#[derive(Clone)]
pub struct EventRecorder {
    client: Client,
    reporter: Reporter,
}

impl EventRecorder {
    /// Create a new recorder reporting as the given controller component.
    pub fn new(client: Client, component: &str, instance: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: component.to_string(),
                instance: Some(instance.to_string()),
            },
        }
    }

    /// Record a normal event against the given object.
    pub async fn normal<K: Resource<DynamicType = ()>>(&self, obj: &K, reason: &str, action: &str, note: String) {
        self.publish(obj, EventType::Normal, reason, action, note).await
    }

    /// Record a warning event against the given object.
    pub async fn warning<K: Resource<DynamicType = ()>>(&self, obj: &K, reason: &str, action: &str, note: String) {
        self.publish(obj, EventType::Warning, reason, action, note).await
    }

    async fn publish<K: Resource<DynamicType = ()>>(&self, obj: &K, type_: EventType, reason: &str, action: &str, note: String) {
        let reference = ObjectReference {
            api_version: Some(K::api_version(&()).into_owned()),
            kind: Some(K::kind(&()).into_owned()),
            name: obj.meta().name.clone(),
            namespace: obj.meta().namespace.clone(),
            uid: obj.meta().uid.clone(),
            ..Default::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            tracing::error!(error = ?err, reason, "error publishing event");
        }
    }
}
