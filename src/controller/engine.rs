//! Reconciliation Engine
//!
//! One call to [`ReconcileEngine::reconcile`] drives a single identity
//! through Fetching, Deciding, Acting and Committing. Each stage that touches
//! the cluster is retried with bounded backoff. The ledger only advances
//! after every planned restart succeeded, and only if nobody else advanced it
//! first, so a revision is acted on at most once per successful commit and a
//! crash before the commit simply replays the restarts.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::events::{actions, config_map_ref, reasons, EventPublisher};
use crate::ledger::RevisionLedger;
use crate::metrics::{record_restart_action, ReconcileTimer};
use crate::model::{
    ConfigIdentity, ReconcileTask, RestartAction, RestartMethod, RestartStamp, RevisionMarker,
};
use crate::policy;
use crate::resolver::DependencyResolver;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::{with_deadline, ResourceStore};
use crate::{Error, Result};

/// Why a notification required no work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The ConfigMap does not exist and was never processed
    NotFound,
    /// The ledger already records the observed revision
    Unchanged,
}

/// Terminal state of a successful reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Restarts executed and the ledger advanced to `revision`
    Committed {
        /// Revision now recorded in the ledger
        revision: RevisionMarker,
        /// Restarts that were issued, in execution order
        actions: Vec<RestartAction>,
    },
    /// The ConfigMap is gone; its ledger entry was removed
    Cleaned,
    /// Nothing to do
    Dropped(DropReason),
    /// Another attempt committed first; this one changed nothing durable
    Superseded,
}

impl ReconcileOutcome {
    /// Metric label for the outcome
    pub fn label(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::Cleaned => "cleaned",
            Self::Dropped(DropReason::NotFound) => "dropped_not_found",
            Self::Dropped(DropReason::Unchanged) => "dropped_unchanged",
            Self::Superseded => "superseded",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed { revision, actions } => {
                write!(f, "committed revision {revision} ({} restarts)", actions.len())
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Drives one identity at a time from notification to committed revision
pub struct ReconcileEngine {
    store: Arc<dyn ResourceStore>,
    ledger: Arc<dyn RevisionLedger>,
    events: Arc<dyn EventPublisher>,
    resolver: DependencyResolver,
    config: EngineConfig,
    retry: RetryConfig,
}

impl ReconcileEngine {
    /// Build an engine over the given store, ledger and event sink
    pub fn new(
        store: Arc<dyn ResourceStore>,
        ledger: Arc<dyn RevisionLedger>,
        events: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resolver: DependencyResolver::new(Arc::clone(&store), config.store_timeout),
            retry: config.retry(),
            store,
            ledger,
            events,
            config,
        }
    }

    /// Backoff policy used for every stage
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Reconcile one identity
    ///
    /// Returns `Err` when the attempt ended Failed. The ledger is never
    /// advanced by a failed or cancelled attempt.
    #[instrument(skip(self, task, cancel), fields(identity = %task.identity, attempt = task.attempt))]
    pub async fn reconcile(
        &self,
        task: &ReconcileTask,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let timer = ReconcileTimer::start();
        let result = self.run(&task.identity, cancel).await;

        match &result {
            Ok(outcome) => {
                debug!(%outcome, "reconcile finished");
                timer.success(outcome.label());
            }
            Err(Error::Cancelled) => {
                debug!("reconcile cancelled before commit");
                timer.error("cancelled");
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "reconcile failed");
                timer.error(e.error_type());
                self.report_failure(&task.identity, e).await;
            }
        }
        result
    }

    /// Remove the ledger entry of a ConfigMap that no longer exists
    ///
    /// Never restarts anything. Returns true when an entry was removed and
    /// false when the ConfigMap still exists.
    #[instrument(skip(self, cancel), fields(identity = %identity))]
    pub async fn clean_up(&self, identity: &ConfigIdentity, cancel: &CancellationToken) -> Result<bool> {
        let store = self.store.as_ref();
        let ledger = self.ledger.as_ref();
        let timeout = self.config.store_timeout;

        ensure_live(cancel)?;
        let snapshot = self
            .step("get configmap", move || {
                with_deadline(timeout, "get configmap", store.get_config(identity))
            })
            .await?;
        if snapshot.is_some() {
            return Ok(false);
        }

        ensure_live(cancel)?;
        self.step("delete ledger entry", move || {
            with_deadline(timeout, "delete ledger entry", ledger.delete(identity))
        })
        .await?;
        info!("configmap gone, ledger entry removed");
        Ok(true)
    }

    async fn run(
        &self,
        identity: &ConfigIdentity,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let store = self.store.as_ref();
        let ledger = self.ledger.as_ref();
        let timeout = self.config.store_timeout;

        // Fetching
        ensure_live(cancel)?;
        let snapshot = self
            .step("get configmap", move || {
                with_deadline(timeout, "get configmap", store.get_config(identity))
            })
            .await?;
        let entry = self
            .step("get ledger entry", move || {
                with_deadline(timeout, "get ledger entry", ledger.get(identity))
            })
            .await?;

        let Some(snapshot) = snapshot else {
            if entry.is_none() {
                return Ok(ReconcileOutcome::Dropped(DropReason::NotFound));
            }
            ensure_live(cancel)?;
            self.step("delete ledger entry", move || {
                with_deadline(timeout, "delete ledger entry", ledger.delete(identity))
            })
            .await?;
            info!("configmap gone, ledger entry removed");
            return Ok(ReconcileOutcome::Cleaned);
        };

        // Deciding
        ensure_live(cancel)?;
        let previous = entry.map(|e| e.last_processed_revision);
        if previous.as_ref() == Some(&snapshot.revision) {
            return Ok(ReconcileOutcome::Dropped(DropReason::Unchanged));
        }

        let resolver = &self.resolver;
        let snapshot_ref = &snapshot;
        let dependents = self
            .step("resolve dependents", move || resolver.resolve(snapshot_ref))
            .await?;
        let plan = policy::plan(&snapshot, &dependents)?;
        info!(
            revision = %snapshot.revision,
            previous = ?previous.as_ref().map(RevisionMarker::as_str),
            restarts = plan.len(),
            deleting = snapshot.deletion_requested,
            "revision changed"
        );

        // Acting
        let stamp = RestartStamp {
            identity: identity.clone(),
            revision: snapshot.revision.clone(),
            restarted_at: Utc::now(),
        };
        for action in &plan {
            ensure_live(cancel)?;
            self.execute(action, &stamp).await?;
        }

        // Committing
        ensure_live(cancel)?;
        let revision = &snapshot.revision;
        let committed = self
            .step("ledger compare-and-set", move || {
                with_deadline(
                    timeout,
                    "ledger compare-and-set",
                    ledger.compare_and_set(identity, previous.clone(), revision),
                )
            })
            .await?;

        if !committed {
            let conflict = Error::LedgerConflict {
                identity: identity.clone(),
            };
            info!(reason = %conflict, "attempt superseded");
            return Ok(ReconcileOutcome::Superseded);
        }

        if !plan.is_empty() {
            self.events
                .publish(
                    &config_map_ref(identity),
                    EventType::Normal,
                    reasons::RESTARTS_TRIGGERED,
                    actions::RECONCILE,
                    Some(format!(
                        "restarted {} for revision {}",
                        plan.iter().map(RestartAction::name).collect::<Vec<_>>().join(", "),
                        snapshot.revision
                    )),
                )
                .await;
        }

        Ok(ReconcileOutcome::Committed {
            revision: snapshot.revision,
            actions: plan,
        })
    }

    /// Execute one restart with its own retry budget
    async fn execute(&self, action: &RestartAction, stamp: &RestartStamp) -> Result<()> {
        let store = self.store.as_ref();
        let timeout = self.config.store_timeout;
        let target = &action.target;

        let result = match action.method {
            RestartMethod::AnnotateTimestamp => {
                self.step("annotate restart", move || {
                    with_deadline(timeout, "annotate restart", store.annotate_restart(target, stamp))
                })
                .await
            }
            RestartMethod::Delete => {
                self.step("delete pod", move || {
                    with_deadline(timeout, "delete pod", store.delete_workload(&target.dependent))
                })
                .await
            }
        };

        result.map_err(|e| Error::ActionFailed {
            dependent: target.dependent.to_string(),
            method: action.method,
            message: e.to_string(),
        })?;

        record_restart_action(action.method);
        info!(
            pod = %target.dependent,
            reason = %target.dependent.binding_reason,
            method = %action.method,
            "restart issued"
        );
        Ok(())
    }

    async fn step<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.retry, operation, Error::is_retryable, call).await
    }

    async fn report_failure(&self, identity: &ConfigIdentity, error: &Error) {
        let reason = match error {
            Error::AmbiguousBinding { .. } => reasons::AMBIGUOUS_BINDING,
            e if e.is_retryable() => return,
            _ => reasons::RECONCILE_FAILED,
        };
        self.events
            .publish(
                &config_map_ref(identity),
                EventType::Warning,
                reason,
                actions::RECONCILE,
                Some(error.to_string()),
            )
            .await;
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
