//! Restart Policy: turns dependents into an ordered restart plan

use std::collections::BTreeSet;

use crate::model::{ConfigSnapshot, ResolvedDependent, RestartAction, RestartMethod};
use crate::{Error, Result};

/// Plan one restart per dependent
///
/// Controller-managed Pods are restarted by annotation so their owner rolls
/// them; bare Pods are deleted. A ConfigMap being deleted restarts nothing.
/// The plan is ordered by Pod name.
pub fn plan(
    snapshot: &ConfigSnapshot,
    dependents: &[ResolvedDependent],
) -> Result<Vec<RestartAction>> {
    if snapshot.deletion_requested {
        return Ok(Vec::new());
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for d in dependents {
        if !seen.insert(d.dependent.name.as_str()) {
            duplicates.insert(d.dependent.name.clone());
        }
    }
    if !duplicates.is_empty() {
        return Err(Error::AmbiguousBinding {
            identity: snapshot.identity.clone(),
            dependents: duplicates.into_iter().collect(),
        });
    }

    let mut actions: Vec<RestartAction> = dependents
        .iter()
        .map(|d| RestartAction {
            target: d.clone(),
            method: if d.ownership.is_managed() {
                RestartMethod::AnnotateTimestamp
            } else {
                RestartMethod::Delete
            },
        })
        .collect();
    actions.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(actions)
}
