//! Data model shared by the resolver, policy, ledger and engine
//!
//! Everything here is a plain value type. Snapshots are produced by the
//! [`ResourceStore`](crate::store::ResourceStore) and are read-only to the
//! reconciliation core.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace-scoped name identifying a ConfigMap
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigIdentity {
    /// Namespace of the ConfigMap
    pub namespace: String,
    /// Name of the ConfigMap
    pub name: String,
}

impl ConfigIdentity {
    /// Create an identity from a namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ConfigIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque revision token attached by the API server (`resourceVersion`)
///
/// Only equality is meaningful. Ordering of two markers says nothing about
/// which one is newer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionMarker(String);

impl RevisionMarker {
    /// Wrap a raw resourceVersion string
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw marker as stored by the API server
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time view of a ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Which ConfigMap this is
    pub identity: ConfigIdentity,
    /// Revision observed when the snapshot was taken
    pub revision: RevisionMarker,
    /// True once a deletionTimestamp is set
    pub deletion_requested: bool,
    /// Labels on the ConfigMap, used for label-based binding
    pub labels: BTreeMap<String, String>,
}

/// Controlling owner of a workload as recorded in its ownerReferences
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerRef {
    /// Owner kind, e.g. `ReplicaSet` or `StatefulSet`
    pub kind: String,
    /// Owner name
    pub name: String,
}

/// The parts of a Pod the resolver needs to classify it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
    /// ConfigMap names mounted through `configMap` or `projected` volumes
    pub volume_config_refs: Vec<String>,
    /// ConfigMap names listed in the explicit binding annotation, in
    /// declaration order with duplicates preserved
    pub explicit_bindings: Vec<String>,
    /// The owner with `controller: true`, if any
    pub controller_owner: Option<OwnerRef>,
}

/// How a dependent is known to reference a ConfigMap
///
/// Variants are declared in precedence order: when a workload matches
/// several reasons it is reported once with the smallest variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BindingReason {
    /// Listed in the `autorestart.dev/configmaps` annotation
    ExplicitBinding,
    /// Mounted as a volume
    VolumeReference,
    /// Carries every label of the ConfigMap
    LabelMatch,
}

impl fmt::Display for BindingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ExplicitBinding => "ExplicitBinding",
            Self::VolumeReference => "VolumeReference",
            Self::LabelMatch => "LabelMatch",
        };
        f.write_str(s)
    }
}

/// A workload instance whose lifecycle is tied to a ConfigMap
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependentRef {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Highest-precedence reason the Pod depends on the ConfigMap
    pub binding_reason: BindingReason,
}

impl fmt::Display for DependentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Whether something above the Pod will recreate it
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ownership {
    /// A controller owns the Pod and will perform a rolling replacement
    Managed(OwnerRef),
    /// Bare Pod; nothing recreates it except its own manifest being re-applied
    Unmanaged,
}

impl Ownership {
    /// Derive ownership from the controlling owner reference
    pub fn from_owner(owner: Option<&OwnerRef>) -> Self {
        owner
            .cloned()
            .map(Self::Managed)
            .unwrap_or(Self::Unmanaged)
    }

    /// True when a higher-level controller manages the Pod
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Managed(_))
    }
}

/// A dependent together with the ownership fact the policy needs
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedDependent {
    /// Which workload depends on the ConfigMap and why
    pub dependent: DependentRef,
    /// Who, if anyone, recreates it
    pub ownership: Ownership,
}

/// How a restart is performed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestartMethod {
    /// Delete the Pod outright
    Delete,
    /// Bump a restart annotation and let the owning controller roll it
    AnnotateTimestamp,
}

impl RestartMethod {
    /// Lowercase label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::AnnotateTimestamp => "annotate",
        }
    }
}

impl fmt::Display for RestartMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned restart
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartAction {
    /// Target of the restart
    pub target: ResolvedDependent,
    /// How to restart it
    pub method: RestartMethod,
}

impl RestartAction {
    /// Name of the targeted Pod
    pub fn name(&self) -> &str {
        &self.target.dependent.name
    }
}

/// Value written by annotate-style restarts
///
/// A target is restarted once per [`RestartStamp::trigger`]: a target that
/// already carries the trigger is left alone, so a replayed attempt keeps
/// the first `restarted_at` and does not roll the workload again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartStamp {
    /// ConfigMap that triggered the restart
    pub identity: ConfigIdentity,
    /// Revision being rolled out
    pub revision: RevisionMarker,
    /// Wall-clock time the attempt decided to restart
    pub restarted_at: DateTime<Utc>,
}

impl RestartStamp {
    /// `namespace/name@revision`, the restart's idempotency key
    pub fn trigger(&self) -> String {
        format!("{}@{}", self.identity, self.revision)
    }
}

/// Durable record of the last revision acted upon
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// ConfigMap the entry belongs to
    pub identity: ConfigIdentity,
    /// Revision whose restarts completed
    pub last_processed_revision: RevisionMarker,
    /// When the revision was committed
    pub last_processed_at: DateTime<Utc>,
}

/// A unit of work for one identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileTask {
    /// ConfigMap to reconcile
    pub identity: ConfigIdentity,
    /// When the controller handed the identity to a worker
    pub enqueued_at: DateTime<Utc>,
    /// 1 for a fresh notification, incremented by each redelivery
    pub attempt: u32,
}
