//! Stories about ConfigMap changes rolling real workloads

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, PostParams};
use tokio_util::sync::CancellationToken;

use autorestart::config::EngineConfig;
use autorestart::controller::{ReconcileEngine, ReconcileOutcome};
use autorestart::events::NoopEventPublisher;
use autorestart::ledger::ConfigMapLedger;
use autorestart::model::{ConfigIdentity, ReconcileTask};
use autorestart::store::KubeResourceStore;
use autorestart::RESTARTED_AT_ANNOTATION;

use super::helpers::{apply_config_map, ensure_test_cluster, TestNamespace};

fn deployment_mounting(name: &str, config: &str) -> Deployment {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some("registry.k8s.io/pause:3.9".to_string()),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "config".to_string(),
                            mount_path: "/etc/config".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: config.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Story: editing a mounted ConfigMap rolls the Deployment exactly once
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn story_config_change_rolls_deployment_once() {
    let client = ensure_test_cluster().await;
    let ns = TestNamespace::create(&client, "autorestart-e2e").await;

    apply_config_map(&client, &ns.name, "db-config", &[("url", "postgres://a")]).await;
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns.name);
    deployments
        .create(&PostParams::default(), &deployment_mounting("api", "db-config"))
        .await
        .unwrap();

    // wait for the ReplicaSet's Pod to exist
    let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client.clone(), &ns.name);
    for _ in 0..60 {
        if !pods.list(&Default::default()).await.unwrap().items.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let engine = ReconcileEngine::new(
        Arc::new(KubeResourceStore::new(client.clone())),
        Arc::new(ConfigMapLedger::new(client.clone(), ns.name.clone())),
        Arc::new(NoopEventPublisher),
        EngineConfig::default(),
    );
    let task = ReconcileTask {
        identity: ConfigIdentity::new(&ns.name, "db-config"),
        enqueued_at: Utc::now(),
        attempt: 1,
    };

    apply_config_map(&client, &ns.name, "db-config", &[("url", "postgres://b")]).await;
    let outcome = engine
        .reconcile(&task, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Committed { ref actions, .. } if actions.len() == 1));

    let template_annotation = |d: &Deployment| {
        d.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(RESTARTED_AT_ANNOTATION).cloned())
    };
    let first = template_annotation(&deployments.get("api").await.unwrap());
    assert!(first.is_some(), "deployment template was not annotated");

    let again = engine
        .reconcile(&task, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(again, ReconcileOutcome::Dropped(_)));
    assert_eq!(
        template_annotation(&deployments.get("api").await.unwrap()),
        first
    );

    ns.cleanup().await;
}
