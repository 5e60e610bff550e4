//! Single-writer guard using a Kubernetes Lease
//!
//! Two controller replicas acting on the same ConfigMap change would each
//! issue restarts before one of them lost the ledger race. Only the holder
//! of the `coordination.k8s.io/v1` Lease runs the reconcile loop; standbys
//! wait for it to expire or be released.
//!
//! Every write carries the resourceVersion that was read, so two candidates
//! racing for an expired lease cannot both win: the loser gets 409 Conflict.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{is_conflict, is_not_found};
use crate::FIELD_MANAGER;

/// Lease name shared by every controller replica
pub const LEADER_LEASE_NAME: &str = "autorestart-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease object came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What a candidate may do with the current lease
#[derive(Debug, PartialEq, Eq)]
enum LeaseDecision {
    /// We hold it: renew
    Renew,
    /// Nobody valid holds it: take over
    TakeOver,
    /// Someone else holds a live lease
    Wait,
}

/// True when the lease has no holder or its holder stopped renewing
fn lease_is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().map_or(true, str::is_empty) {
        return true;
    }
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    }
}

fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        LeaseDecision::Renew
    } else if lease_is_expired(spec, now) {
        LeaseDecision::TakeOver
    } else {
        LeaseDecision::Wait
    }
}

/// Leader elector over a single Lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create an elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Block until leadership is acquired, then return a guard that renews it
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another replica"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(
                i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX),
            ),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// One round of the election: create, renew or take over the lease
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api = self.api();
        let now = Utc::now();

        let Some(existing) = api.get_opt(&self.lease_name).await? else {
            return self.create_lease(&api, now).await;
        };

        let resource_version = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;

        let spec = existing.spec.as_ref();
        let replacement = match decide(spec, &self.identity, now) {
            LeaseDecision::Wait => return Ok(false),
            LeaseDecision::Renew => {
                let mut renewed = existing.clone();
                if let Some(s) = renewed.spec.as_mut() {
                    s.renew_time = Some(MicroTime(now));
                }
                renewed
            }
            LeaseDecision::TakeOver => {
                let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1;
                Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        resource_version: Some(resource_version.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.lease_spec(now, transitions)),
                }
            }
        };

        match api
            .replace(&self.lease_name, &PostParams::default(), &replacement)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease written");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.identity, "Lease changed under us");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api = self.api();
        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past)
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// Held while this replica is the leader
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder; call on graceful shutdown
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}
