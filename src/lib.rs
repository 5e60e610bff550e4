//! autorestart - restart Pods exactly once per ConfigMap change
//!
//! The controller watches ConfigMaps, finds the Pods that depend on each one
//! and restarts them when its revision changes. A durable ledger records the
//! last revision acted upon so that restarts survive controller restarts
//! without being repeated.
//!
//! # Modules
//!
//! - [`model`] - Snapshots, dependents, restart actions and ledger entries
//! - [`store`] - Cluster access behind the [`store::ResourceStore`] trait
//! - [`ledger`] - Revision ledger with compare-and-set
//! - [`resolver`] - Finds the Pods bound to a ConfigMap
//! - [`policy`] - Chooses how each dependent is restarted
//! - [`controller`] - Reconciliation engine and its kube `Controller` wiring
//! - [`config`] - Engine tunables
//! - [`leader_election`] - Lease-based single-writer guard
//! - [`events`], [`metrics`], [`telemetry`] - Observability
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Pod annotation listing the ConfigMaps a Pod explicitly depends on
///
/// Comma-separated ConfigMap names in the Pod's namespace.
pub const EXPLICIT_BINDING_ANNOTATION: &str = "autorestart.dev/configmaps";

/// Pod template annotation bumped to trigger a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "autorestart.dev/restartedAt";

/// Pod template annotation naming the ConfigMap revision behind a restart
pub const TRIGGERED_BY_ANNOTATION: &str = "autorestart.dev/triggeredBy";

/// Label carried by ledger ConfigMaps; the watcher ignores them
pub const LEDGER_LABEL: &str = "autorestart.dev/ledger";

/// Field manager for every write the controller makes
pub const FIELD_MANAGER: &str = "autorestart-controller";

/// Namespace holding the ledger and lease when `POD_NAMESPACE` is unset
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "autorestart-system";
