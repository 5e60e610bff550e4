//! The reconcile loop: engine and controller wiring
//!
//! ConfigMap changes reach [`reconcile`] through a kube `Controller`, which
//! keeps a single ConfigMap on a single worker. [`reconcile`] hands the
//! identity to the [`ReconcileEngine`].

mod engine;
mod runner;

pub use engine::{DropReason, ReconcileEngine, ReconcileOutcome};
pub use runner::{
    controller_config, error_policy, object_ref, reconcile, watcher_config, Context, Runner,
};
