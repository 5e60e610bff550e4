//! Ledger persisted as ConfigMaps in the controller namespace

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, warn};

use super::{ledger_object_name, RevisionLedger};
use crate::error::{is_conflict, is_not_found, kube_error_is_transient};
use crate::model::{ConfigIdentity, LedgerEntry, RevisionMarker};
use crate::{Error, Result, FIELD_MANAGER, LEDGER_LABEL};

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "autorestart";

const KEY_NAMESPACE: &str = "namespace";
const KEY_NAME: &str = "name";
const KEY_REVISION: &str = "revision";
const KEY_PROCESSED_AT: &str = "processedAt";

/// [`RevisionLedger`] backed by one ConfigMap per identity
///
/// Atomicity comes from the API server: creation fails with 409 if the
/// object exists and replacement fails with 409 if its resourceVersion
/// moved since it was read.
pub struct ConfigMapLedger {
    client: Client,
    namespace: String,
}

impl ConfigMapLedger {
    /// Ledger stored in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RevisionLedger for ConfigMapLedger {
    async fn get(&self, identity: &ConfigIdentity) -> Result<Option<LedgerEntry>> {
        let object = self
            .api()
            .get_opt(&ledger_object_name(identity))
            .await
            .map_err(|e| ledger_error("get ledger entry", e))?;

        object
            .map(|cm| entry_from_configmap(&cm))
            .transpose()?
            .map(|entry| {
                if &entry.identity == identity {
                    Ok(entry)
                } else {
                    Err(Error::ledger_corrupt(
                        ledger_object_name(identity),
                        format!("entry belongs to {}", entry.identity),
                    ))
                }
            })
            .transpose()
    }

    async fn compare_and_set(
        &self,
        identity: &ConfigIdentity,
        expected: Option<RevisionMarker>,
        new: &RevisionMarker,
    ) -> Result<bool> {
        let api = self.api();
        let name = ledger_object_name(identity);
        let current = api
            .get_opt(&name)
            .await
            .map_err(|e| ledger_error("get ledger entry", e))?;

        let entry = LedgerEntry {
            identity: identity.clone(),
            last_processed_revision: new.clone(),
            last_processed_at: Utc::now(),
        };

        match (expected, current) {
            (None, None) => {
                let object = entry_to_configmap(&entry, &self.namespace);
                match api.create(&Self::post_params(), &object).await {
                    Ok(_) => Ok(true),
                    Err(e) if is_conflict(&e) => {
                        debug!(%identity, "ledger entry created concurrently");
                        Ok(false)
                    }
                    Err(e) => Err(ledger_error("create ledger entry", e)),
                }
            }
            (None, Some(_)) | (Some(_), None) => Ok(false),
            (Some(expected), Some(existing)) => {
                let stored = entry_from_configmap(&existing)?;
                if stored.last_processed_revision != expected
                    || stored.last_processed_revision == *new
                {
                    return Ok(false);
                }

                let mut object = entry_to_configmap(&entry, &self.namespace);
                object.metadata.resource_version = existing.metadata.resource_version.clone();
                match api.replace(&name, &Self::post_params(), &object).await {
                    Ok(_) => Ok(true),
                    Err(e) if is_conflict(&e) => {
                        debug!(%identity, "ledger entry replaced concurrently");
                        Ok(false)
                    }
                    Err(e) => Err(ledger_error("replace ledger entry", e)),
                }
            }
        }
    }

    async fn delete(&self, identity: &ConfigIdentity) -> Result<()> {
        match self
            .api()
            .delete(&ledger_object_name(identity), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ledger_error("delete ledger entry", e)),
        }
    }

    async fn list(&self) -> Result<Vec<LedgerEntry>> {
        let selector = format!("{LEDGER_LABEL}=true");
        let objects = self
            .api()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| ledger_error("list ledger entries", e))?;

        let mut entries: Vec<LedgerEntry> = objects
            .items
            .iter()
            .filter_map(|cm| match entry_from_configmap(cm) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping corrupt ledger entry");
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(entries)
    }
}

fn ledger_error(operation: &str, err: kube::Error) -> Error {
    if kube_error_is_transient(&err) {
        Error::store_unavailable(operation, err.to_string())
    } else {
        Error::Kube(err)
    }
}

/// Encode an entry as the ConfigMap that stores it
fn entry_to_configmap(entry: &LedgerEntry, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(ledger_object_name(&entry.identity)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (LEDGER_LABEL.to_string(), "true".to_string()),
            ])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (KEY_NAMESPACE.to_string(), entry.identity.namespace.clone()),
            (KEY_NAME.to_string(), entry.identity.name.clone()),
            (
                KEY_REVISION.to_string(),
                entry.last_processed_revision.as_str().to_string(),
            ),
            (
                KEY_PROCESSED_AT.to_string(),
                entry.last_processed_at.to_rfc3339(),
            ),
        ])),
        ..Default::default()
    }
}

/// Decode a stored entry
fn entry_from_configmap(cm: &ConfigMap) -> Result<LedgerEntry> {
    let object = cm.metadata.name.clone().unwrap_or_default();
    let data = cm
        .data
        .as_ref()
        .ok_or_else(|| Error::ledger_corrupt(&object, "no data"))?;
    let field = |key: &str| {
        data.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::ledger_corrupt(&object, format!("missing {key}")))
    };

    let identity = ConfigIdentity::new(field(KEY_NAMESPACE)?, field(KEY_NAME)?);
    let revision = RevisionMarker::new(field(KEY_REVISION)?);
    let processed_at = DateTime::parse_from_rfc3339(field(KEY_PROCESSED_AT)?)
        .map_err(|e| Error::ledger_corrupt(&object, format!("bad {KEY_PROCESSED_AT}: {e}")))?
        .with_timezone(&Utc);

    if object != ledger_object_name(&identity) {
        return Err(Error::ledger_corrupt(
            &object,
            format!("name does not match identity {identity}"),
        ));
    }

    Ok(LedgerEntry {
        identity,
        last_processed_revision: revision,
        last_processed_at: processed_at,
    })
}
