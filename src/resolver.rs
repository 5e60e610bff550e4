//! Dependency Resolver: which Pods depend on a ConfigMap, and why
//!
//! A Pod depends on a ConfigMap when it names it in the
//! `autorestart.dev/configmaps` annotation, mounts it as a volume, or carries
//! every label of a labelled ConfigMap. The first matching reason in that
//! order wins and each Pod is reported once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::model::{
    BindingReason, ConfigSnapshot, DependentRef, Ownership, ResolvedDependent, WorkloadSnapshot,
};
use crate::store::{with_deadline, ResourceStore};
use crate::{Error, Result};

/// Resolves the dependents of a ConfigMap from a fresh Pod listing
pub struct DependencyResolver {
    store: Arc<dyn ResourceStore>,
    deadline: Duration,
}

impl DependencyResolver {
    /// Create a resolver reading through `store`, each list bounded by `deadline`
    pub fn new(store: Arc<dyn ResourceStore>, deadline: Duration) -> Self {
        Self { store, deadline }
    }

    /// List the ConfigMap's namespace and classify every Pod
    pub async fn resolve(&self, snapshot: &ConfigSnapshot) -> Result<Vec<ResolvedDependent>> {
        let namespace = &snapshot.identity.namespace;
        let workloads = with_deadline(
            self.deadline,
            "list pods",
            self.store.list_workloads(namespace),
        )
        .await?;

        let dependents = resolve_dependents(snapshot, &workloads)?;
        debug!(
            identity = %snapshot.identity,
            pods = workloads.len(),
            dependents = dependents.len(),
            "resolved dependents"
        );
        Ok(dependents)
    }
}

/// Pure classification of `workloads` against `snapshot`
///
/// Output is sorted by Pod name. A Pod that lists the ConfigMap more than
/// once in its explicit annotation makes the whole resolution ambiguous.
pub fn resolve_dependents(
    snapshot: &ConfigSnapshot,
    workloads: &[WorkloadSnapshot],
) -> Result<Vec<ResolvedDependent>> {
    let target = &snapshot.identity;
    let mut ambiguous = Vec::new();
    let mut found: BTreeMap<&str, ResolvedDependent> = BTreeMap::new();

    for workload in workloads.iter().filter(|w| w.namespace == target.namespace) {
        let explicit = workload
            .explicit_bindings
            .iter()
            .filter(|name| **name == target.name)
            .count();
        if explicit > 1 {
            ambiguous.push(workload.name.clone());
            continue;
        }

        let reason = if explicit == 1 {
            Some(BindingReason::ExplicitBinding)
        } else if workload.volume_config_refs.iter().any(|n| *n == target.name) {
            Some(BindingReason::VolumeReference)
        } else if labels_match(&snapshot.labels, &workload.labels) {
            Some(BindingReason::LabelMatch)
        } else {
            None
        };

        if let Some(binding_reason) = reason {
            found.insert(
                &workload.name,
                ResolvedDependent {
                    dependent: DependentRef {
                        namespace: workload.namespace.clone(),
                        name: workload.name.clone(),
                        binding_reason,
                    },
                    ownership: Ownership::from_owner(workload.controller_owner.as_ref()),
                },
            );
        }
    }

    if !ambiguous.is_empty() {
        ambiguous.sort();
        return Err(Error::AmbiguousBinding {
            identity: target.clone(),
            dependents: ambiguous,
        });
    }

    Ok(found.into_values().collect())
}

/// Every ConfigMap label is present on the Pod; no labels select nothing
fn labels_match(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
