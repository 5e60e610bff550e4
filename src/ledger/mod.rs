//! Revision Ledger: durable record of the last revision acted upon
//!
//! The ledger is what makes restarts happen exactly once per ConfigMap
//! revision. It outlives the process: [`ConfigMapLedger`] stores one
//! ConfigMap per tracked identity in the controller's namespace.
//! [`InMemoryLedger`] backs tests and dry runs.

mod configmap;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};

#[cfg(test)]
use mockall::automock;

use crate::model::{ConfigIdentity, LedgerEntry, RevisionMarker};
use crate::Result;

pub use self::configmap::ConfigMapLedger;

/// Prefix of every ledger object name
pub const LEDGER_NAME_PREFIX: &str = "autorestart-ledger-";

/// Durable per-identity revision store with compare-and-set
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RevisionLedger: Send + Sync {
    /// Last processed entry for an identity, `None` if never processed
    async fn get(&self, identity: &ConfigIdentity) -> Result<Option<LedgerEntry>>;

    /// Atomically move the entry from `expected` to `new`
    ///
    /// Returns `Ok(false)` when the stored revision is not `expected`
    /// (someone else committed first). `expected == None` means the entry
    /// must not exist yet.
    async fn compare_and_set(
        &self,
        identity: &ConfigIdentity,
        expected: Option<RevisionMarker>,
        new: &RevisionMarker,
    ) -> Result<bool>;

    /// Remove the entry; removing an absent entry succeeds
    async fn delete(&self, identity: &ConfigIdentity) -> Result<()>;

    /// Every entry currently recorded
    async fn list(&self) -> Result<Vec<LedgerEntry>>;
}

/// Deterministic, DNS-safe object name for an identity's ledger entry
pub fn ledger_object_name(identity: &ConfigIdentity) -> String {
    let digest = Sha256::digest(identity.to_string().as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{LEDGER_NAME_PREFIX}{hex}")
}

/// Process-local ledger
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashMap<ConfigIdentity, LedgerEntry>>,
}

impl InMemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConfigIdentity, LedgerEntry>> {
        // a poisoned map is still consistent: every mutation is a single insert or remove
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl RevisionLedger for InMemoryLedger {
    async fn get(&self, identity: &ConfigIdentity) -> Result<Option<LedgerEntry>> {
        Ok(self.lock().get(identity).cloned())
    }

    async fn compare_and_set(
        &self,
        identity: &ConfigIdentity,
        expected: Option<RevisionMarker>,
        new: &RevisionMarker,
    ) -> Result<bool> {
        let mut entries = self.lock();
        let current = entries.get(identity).map(|e| &e.last_processed_revision);
        if current != expected.as_ref() || current == Some(new) {
            return Ok(false);
        }
        entries.insert(
            identity.clone(),
            LedgerEntry {
                identity: identity.clone(),
                last_processed_revision: new.clone(),
                last_processed_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn delete(&self, identity: &ConfigIdentity) -> Result<()> {
        self.lock().remove(identity);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<_> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(entries)
    }
}
