//! kube-rs implementation of the Resource Store
//!
//! Restarts of managed Pods are performed on the object that owns the Pod
//! template (Deployment, StatefulSet or DaemonSet) the same way
//! `kubectl rollout restart` does it: by merging an annotation into
//! `spec.template.metadata.annotations`. Pods owned by anything without a
//! template get the annotation on the Pod itself.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::ResourceStore;
use crate::error::{is_not_found, kube_error_is_transient};
use crate::model::{
    ConfigIdentity, ConfigSnapshot, DependentRef, OwnerRef, Ownership, ResolvedDependent,
    RestartStamp, RevisionMarker, WorkloadSnapshot,
};
use crate::{
    Error, Result, EXPLICIT_BINDING_ANNOTATION, FIELD_MANAGER, RESTARTED_AT_ANNOTATION,
    TRIGGERED_BY_ANNOTATION,
};

/// Real Kubernetes store
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Find the controller of a ReplicaSet (normally its Deployment)
    async fn replica_set_owner(&self, namespace: &str, name: &str) -> Result<Option<OwnerRef>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let rs = api
            .get_opt(name)
            .await
            .map_err(|e| store_error("get replicaset", e))?;
        Ok(rs.and_then(|rs| controller_owner(rs.metadata.owner_references.as_deref())))
    }

    /// Merge restart annotations into a workload's pod template
    ///
    /// A template already stamped for this trigger is left untouched.
    async fn patch_template<K>(&self, namespace: &str, name: &str, stamp: &RestartStamp) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let kind = K::kind(&Default::default()).to_string();
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let current = api
            .get_opt(name)
            .await
            .map_err(|e| store_error("get restart target", e))?;

        let Some(current) = current else {
            debug!(%kind, %namespace, %name, "restart target already gone");
            return Ok(());
        };
        if carries_trigger(&current, TEMPLATE_ANNOTATIONS, stamp) {
            debug!(%kind, %namespace, %name, "pod template already restarted for this revision");
            return Ok(());
        }

        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": restart_annotations(stamp)
                    }
                }
            }
        });

        match api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                info!(%kind, %namespace, %name, "pod template annotated for restart");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(%namespace, %name, "restart target already gone");
                Ok(())
            }
            Err(e) => Err(store_error("patch pod template", e)),
        }
    }

    /// Merge restart annotations into the Pod itself
    async fn patch_pod(&self, target: &DependentRef, stamp: &RestartStamp) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let current = api
            .get_opt(&target.name)
            .await
            .map_err(|e| store_error("get pod", e))?;

        match current {
            None => return Ok(()),
            Some(pod) if carries_trigger(&pod, OBJECT_ANNOTATIONS, stamp) => {
                debug!(pod = %target, "pod already restarted for this revision");
                return Ok(());
            }
            Some(_) => {}
        }

        let patch = json!({
            "metadata": {
                "annotations": restart_annotations(stamp)
            }
        });

        match api
            .patch(
                &target.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(store_error("patch pod", e)),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_config(&self, identity: &ConfigIdentity) -> Result<Option<ConfigSnapshot>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &identity.namespace);
        let config_map = api
            .get_opt(&identity.name)
            .await
            .map_err(|e| store_error("get configmap", e))?;

        config_map
            .map(|cm| snapshot_from_config_map(identity, &cm))
            .transpose()
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<WorkloadSnapshot>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default())
            .await
            .map_err(|e| store_error("list pods", e))?;

        Ok(pods.items.iter().filter_map(workload_from_pod).collect())
    }

    async fn annotate_restart(
        &self,
        target: &ResolvedDependent,
        stamp: &RestartStamp,
    ) -> Result<()> {
        let dependent = &target.dependent;
        let namespace = dependent.namespace.as_str();

        let owner = match &target.ownership {
            Ownership::Managed(owner) if owner.kind == "ReplicaSet" => {
                self.replica_set_owner(namespace, &owner.name).await?
            }
            Ownership::Managed(owner) => Some(owner.clone()),
            Ownership::Unmanaged => None,
        };

        match owner {
            Some(o) if o.kind == "Deployment" => {
                self.patch_template::<Deployment>(namespace, &o.name, stamp)
                    .await
            }
            Some(o) if o.kind == "StatefulSet" => {
                self.patch_template::<StatefulSet>(namespace, &o.name, stamp)
                    .await
            }
            Some(o) if o.kind == "DaemonSet" => {
                self.patch_template::<DaemonSet>(namespace, &o.name, stamp)
                    .await
            }
            _ => self.patch_pod(dependent, stamp).await,
        }
    }

    async fn delete_workload(&self, target: &DependentRef) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        match api.delete(&target.name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(pod = %target, "pod deleted for restart");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(pod = %target, "pod already deleted");
                Ok(())
            }
            Err(e) => Err(store_error("delete pod", e)),
        }
    }
}

/// Map a kube error: transient failures become `StoreUnavailable`, the rest
/// keep their API detail
fn store_error(operation: &str, err: kube::Error) -> Error {
    if kube_error_is_transient(&err) {
        Error::store_unavailable(operation, err.to_string())
    } else {
        Error::Kube(err)
    }
}

fn restart_annotations(stamp: &RestartStamp) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        (RESTARTED_AT_ANNOTATION, stamp.restarted_at.to_rfc3339()),
        (TRIGGERED_BY_ANNOTATION, stamp.trigger()),
    ])
}

const TEMPLATE_ANNOTATIONS: &str = "/spec/template/metadata/annotations";
const OBJECT_ANNOTATIONS: &str = "/metadata/annotations";

/// Whether the annotations at `pointer` already name this stamp's trigger
fn carries_trigger<K: Serialize>(object: &K, pointer: &str, stamp: &RestartStamp) -> bool {
    serde_json::to_value(object)
        .ok()
        .and_then(|value| {
            value
                .pointer(pointer)?
                .get(TRIGGERED_BY_ANNOTATION)?
                .as_str()
                .map(|current| current == stamp.trigger())
        })
        .unwrap_or(false)
}

fn controller_owner(refs: Option<&[OwnerReference]>) -> Option<OwnerRef> {
    refs?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| OwnerRef {
            kind: r.kind.clone(),
            name: r.name.clone(),
        })
}

fn snapshot_from_config_map(identity: &ConfigIdentity, cm: &ConfigMap) -> Result<ConfigSnapshot> {
    let revision = cm
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| Error::serialization(format!("ConfigMap {identity} has no resourceVersion")))?;

    Ok(ConfigSnapshot {
        identity: identity.clone(),
        revision: RevisionMarker::new(revision),
        deletion_requested: cm.metadata.deletion_timestamp.is_some(),
        labels: cm.metadata.labels.clone().unwrap_or_default(),
    })
}

/// Extract the binding-relevant view of a Pod
///
/// Returns `None` for objects without a name or namespace.
pub fn workload_from_pod(pod: &Pod) -> Option<WorkloadSnapshot> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone()?;

    let volume_config_refs = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .flat_map(|v| {
                    let direct = v.config_map.as_ref().map(|c| c.name.clone());
                    let projected = v
                        .projected
                        .as_ref()
                        .and_then(|p| p.sources.as_ref())
                        .into_iter()
                        .flatten()
                        .filter_map(|src| src.config_map.as_ref().map(|c| c.name.clone()));
                    direct.into_iter().chain(projected)
                })
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let explicit_bindings = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(EXPLICIT_BINDING_ANNOTATION))
        .map(|raw| parse_binding_list(raw))
        .unwrap_or_default();

    Some(WorkloadSnapshot {
        namespace,
        name,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        volume_config_refs,
        explicit_bindings,
        controller_owner: controller_owner(pod.metadata.owner_references.as_deref()),
    })
}

/// Split a comma-separated annotation value, keeping duplicates
fn parse_binding_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
