//! kube `Controller` wiring and the ledger sweep
//!
//! The controller runtime owns scheduling: one reconcile per ConfigMap at a
//! time, coalescing of repeated triggers, the concurrency limit and delayed
//! requeues. Successful reconciles requeue after the resync interval.
//! Deleted ConfigMaps are never handed to [`reconcile`], so [`Runner`] also
//! sweeps the ledger for entries whose ConfigMap has disappeared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::ReconcileEngine;
use crate::config::EngineConfig;
use crate::ledger::RevisionLedger;
use crate::metrics::set_ledger_entries;
use crate::model::{ConfigIdentity, ReconcileTask};
use crate::store::with_deadline;
use crate::{Error, Result, LEDGER_LABEL};

/// Shared state handed to every reconcile
pub struct Context {
    engine: Arc<ReconcileEngine>,
    resync_interval: Duration,
    cancel: CancellationToken,
    /// Consecutive redelivered failures per ConfigMap
    failures: Mutex<HashMap<ConfigIdentity, u32>>,
}

impl Context {
    /// Create a context; `cancel` aborts in-flight attempts before their
    /// next stage
    pub fn new(
        engine: Arc<ReconcileEngine>,
        resync_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            resync_interval,
            cancel,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<ConfigIdentity, u32>> {
        self.failures.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn attempt(&self, identity: &ConfigIdentity) -> u32 {
        self.failures().get(identity).copied().unwrap_or(0) + 1
    }

    fn record_failure(&self, identity: &ConfigIdentity) -> u32 {
        let mut failures = self.failures();
        let count = failures.entry(identity.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn forget(&self, identity: &ConfigIdentity) {
        self.failures().remove(identity);
    }
}

/// Reconcile one ConfigMap
///
/// The object only names the identity; the engine re-reads everything it
/// needs from the store.
pub async fn reconcile(config_map: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action> {
    let identity = identity_of(&config_map)
        .ok_or_else(|| Error::validation("ConfigMap without a namespace"))?;
    let task = ReconcileTask {
        attempt: ctx.attempt(&identity),
        identity,
        enqueued_at: Utc::now(),
    };

    let outcome = ctx.engine.reconcile(&task, &ctx.cancel).await?;
    ctx.forget(&task.identity);
    debug!(identity = %task.identity, %outcome, "reconcile complete");
    Ok(Action::requeue(ctx.resync_interval))
}

/// Decide when a failed ConfigMap is tried again
///
/// Transient failures and failed restarts are redelivered with capped
/// backoff. Everything else waits for the ConfigMap to change.
pub fn error_policy(config_map: Arc<ConfigMap>, error: &Error, ctx: Arc<Context>) -> Action {
    let Some(identity) = identity_of(&config_map) else {
        return Action::await_change();
    };

    if error.should_redeliver() {
        let failures = ctx.record_failure(&identity);
        let delay = ctx.engine.retry_config().base_delay(failures);
        warn!(
            %identity,
            failures,
            delay_ms = delay.as_millis(),
            error = %error,
            "reconcile failed, redelivering"
        );
        Action::requeue(delay)
    } else {
        ctx.forget(&identity);
        if !matches!(error, Error::Cancelled) {
            error!(%identity, error = %error, "reconcile failed, waiting for the next change");
        }
        Action::await_change()
    }
}

/// Controller settings derived from the engine tunables
pub fn controller_config(config: &EngineConfig) -> controller::Config {
    let concurrency = u16::try_from(config.max_parallel_identities).unwrap_or(u16::MAX);
    controller::Config::default().concurrency(concurrency)
}

/// Watch configuration for user ConfigMaps; ledger objects are excluded
pub fn watcher_config() -> watcher::Config {
    watcher::Config::default().labels(&format!("!{LEDGER_LABEL}"))
}

/// Runs the ConfigMap controller and the ledger sweep
pub struct Runner {
    engine: Arc<ReconcileEngine>,
    ledger: Arc<dyn RevisionLedger>,
    config: EngineConfig,
}

impl Runner {
    /// Create a runner; `ledger` must be the one the engine commits to
    pub fn new(
        engine: Arc<ReconcileEngine>,
        ledger: Arc<dyn RevisionLedger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            ledger,
            config,
        }
    }

    /// Reconcile ConfigMaps until `cancel` fires
    ///
    /// Watches all namespaces when `namespace` is `None`. Returns after the
    /// controller has drained its in-flight reconciles, or when its watch
    /// stream ends.
    pub async fn run(self, client: Client, namespace: Option<String>, cancel: CancellationToken) {
        let api: Api<ConfigMap> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        info!(
            concurrency = self.config.max_parallel_identities,
            resync_secs = self.config.resync_interval.as_secs(),
            "starting configmap controller"
        );

        let ctx = Arc::new(Context::new(
            Arc::clone(&self.engine),
            self.config.resync_interval,
            cancel.clone(),
        ));
        let controller = Controller::new(api, watcher_config())
            .with_config(controller_config(&self.config))
            .graceful_shutdown_on(cancel.clone().cancelled_owned());
        let reader = controller.store();

        let reconciles = controller
            .run(reconcile, error_policy, ctx)
            .for_each(|result| async move {
                match result {
                    Ok((object, action)) => {
                        debug!(configmap = %object, ?action, "reconciliation completed");
                    }
                    Err(controller::Error::ObjectNotFound(object)) => {
                        debug!(configmap = %object, "configmap gone before its reconcile");
                    }
                    Err(e) => {
                        debug!(error = %e, "reconciliation error");
                    }
                }
            });

        // the controller alone decides when the runner stops
        let sweep = async {
            self.sweep_ledger(reader, &cancel).await;
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = reconciles => info!("configmap controller stopped"),
            _ = sweep => {}
        }
    }

    /// Periodically drop ledger entries of ConfigMaps that no longer exist
    ///
    /// The first pass runs once the watch cache is populated, so ConfigMaps
    /// deleted while the controller was down are cleaned at startup.
    async fn sweep_ledger(&self, reader: Store<ConfigMap>, cancel: &CancellationToken) {
        if reader.wait_until_ready().await.is_err() {
            warn!("configmap cache closed before it was ready");
            return;
        }

        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let entries =
                match with_deadline(self.config.store_timeout, "list ledger", self.ledger.list())
                    .await
                {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(error = %e, "ledger sweep failed");
                        continue;
                    }
                };
            set_ledger_entries(entries.len());

            let mut removed = 0usize;
            for entry in entries.iter().filter(|e| reader.get(&object_ref(&e.identity)).is_none()) {
                match self.engine.clean_up(&entry.identity, cancel).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(Error::Cancelled) => return,
                    Err(e) => warn!(identity = %entry.identity, error = %e, "ledger cleanup failed"),
                }
            }
            debug!(entries = entries.len(), removed, "ledger sweep");
        }
    }
}

fn identity_of(cm: &ConfigMap) -> Option<ConfigIdentity> {
    Some(ConfigIdentity::new(cm.namespace()?, cm.name_any()))
}

/// Cache key of a ConfigMap identity
pub fn object_ref(identity: &ConfigIdentity) -> ObjectRef<ConfigMap> {
    ObjectRef::new(&identity.name).within(&identity.namespace)
}
