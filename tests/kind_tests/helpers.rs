//! Shared fixtures for cluster tests

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

/// Connect with the current kubeconfig
pub async fn ensure_test_cluster() -> Client {
    Client::try_default()
        .await
        .expect("a reachable cluster is required; is the kind cluster running?")
}

/// A throwaway namespace deleted when the test finishes
pub struct TestNamespace {
    client: Client,
    pub name: String,
}

impl TestNamespace {
    pub async fn create(client: &Client, prefix: &str) -> Self {
        let name = format!("{prefix}-{}", std::process::id());
        let api: Api<Namespace> = Api::all(client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns)
            .await
            .expect("failed to create test namespace");
        Self {
            client: client.clone(),
            name,
        }
    }

    pub async fn cleanup(self) {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let _ = api.delete(&self.name, &DeleteParams::background()).await;
    }
}

/// Create or update a ConfigMap and return its resourceVersion
pub async fn apply_config_map(
    client: &Client,
    namespace: &str,
    name: &str,
    data: &[(&str, &str)],
) -> String {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let mut cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..Default::default()
    };

    let written = match api.get_opt(name).await.expect("get configmap") {
        Some(existing) => {
            cm.metadata.resource_version = existing.metadata.resource_version;
            api.replace(name, &PostParams::default(), &cm)
                .await
                .expect("replace configmap")
        }
        None => api
            .create(&PostParams::default(), &cm)
            .await
            .expect("create configmap"),
    };
    written
        .metadata
        .resource_version
        .expect("API server always sets resourceVersion")
}
