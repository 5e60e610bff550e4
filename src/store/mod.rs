//! Resource Store: the controller's only view of the cluster
//!
//! The reconcile core never talks to the API server directly. It goes
//! through [`ResourceStore`], which allows mocking in tests while using
//! [`KubeResourceStore`] in production. NotFound is never an error at this
//! seam: reads return `None` and writes against an absent object succeed.

mod cluster;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::model::{
    ConfigIdentity, ConfigSnapshot, DependentRef, ResolvedDependent, RestartStamp,
    WorkloadSnapshot,
};
use crate::{Error, Result};

pub use self::cluster::{workload_from_pod, KubeResourceStore};

/// Trait abstracting the cluster operations the engine needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the current state of a ConfigMap, `None` if it does not exist
    async fn get_config(&self, identity: &ConfigIdentity) -> Result<Option<ConfigSnapshot>>;

    /// List every Pod in a namespace
    async fn list_workloads(&self, namespace: &str) -> Result<Vec<WorkloadSnapshot>>;

    /// Trigger a rolling restart by writing the stamp into a restart annotation
    ///
    /// A target already carrying the stamp's trigger is left as is and the
    /// call succeeds, so replaying an attempt never rolls a workload twice
    /// for the same revision.
    async fn annotate_restart(&self, target: &ResolvedDependent, stamp: &RestartStamp)
        -> Result<()>;

    /// Delete a Pod; deleting an absent Pod succeeds
    async fn delete_workload(&self, target: &DependentRef) -> Result<()>;
}

/// Run a store call under a deadline
///
/// An elapsed deadline is reported as [`Error::StoreUnavailable`] so the
/// caller's backoff treats it like any other transient failure.
pub async fn with_deadline<T, F>(deadline: Duration, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::store_unavailable(
            operation,
            format!("deadline of {}ms exceeded", deadline.as_millis()),
        )),
    }
}
