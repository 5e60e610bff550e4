//! Kubernetes Event recording for the autorestart controller.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so the engine can
//! report restarts and failures on the ConfigMap that caused them, visible
//! with `kubectl describe configmap`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::model::ConfigIdentity;

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// * `reason` - Machine-readable reason, see [`reasons`]
    /// * `action` - What the controller did, see [`actions`]
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event, for tests and `ledger` subcommands.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Reference to the ConfigMap an event is about
pub fn config_map_ref(identity: &ConfigIdentity) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("ConfigMap".to_string()),
        namespace: Some(identity.namespace.clone()),
        name: Some(identity.name.clone()),
        ..Default::default()
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Restarts were issued and the revision committed
    pub const RESTARTS_TRIGGERED: &str = "RestartsTriggered";
    /// A Pod binds to the ConfigMap in a contradictory way
    pub const AMBIGUOUS_BINDING: &str = "AmbiguousBinding";
    /// Reconcile gave up on this notification
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn events_target_the_configmap() {
        let r = config_map_ref(&ConfigIdentity::new("fedx-1000", "db-config"));
        assert_eq!(r.kind.as_deref(), Some("ConfigMap"));
        assert_eq!(r.namespace.as_deref(), Some("fedx-1000"));
        assert_eq!(r.name.as_deref(), Some("db-config"));
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::RESTARTS_TRIGGERED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
