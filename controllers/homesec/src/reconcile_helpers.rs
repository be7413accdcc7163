//! Helper functions for common reconciliation patterns
//!
//! Condition bookkeeping, finalizer edits and the Capabilities lookup shared
//! by the device reconciler and the prober.

use crate::store::{ResourceStore, StoreError};
use chrono::{DateTime, Utc};
use crds::{Capabilities, Condition, ConditionStatus};
use kube::Resource;

/// Insert or update the condition of type `type_`.
///
/// `lastTransitionTime` only moves when the condition's status changes; a
/// new reason or message on an unchanged status keeps the original time.
/// Returns true if anything changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) if existing.status != status => {
            *existing = Condition::new(type_, status, reason, message, now);
            true
        }
        Some(existing) => {
            if existing.reason == reason && existing.message == message {
                return false;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            true
        }
        None => {
            conditions.push(Condition::new(type_, status, reason, message, now));
            true
        }
    }
}

/// Check if a status write is needed
///
/// Returns true when `desired` differs from what is stored (or nothing is).
pub fn status_needs_update<S: PartialEq>(current: Option<&S>, desired: Option<&S>) -> bool {
    current != desired
}

pub fn has_finalizer<K: Resource>(resource: &K, finalizer: &str) -> bool {
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == finalizer))
}

/// Returns a copy of `resource` with `finalizer` appended
pub fn with_finalizer<K: Resource + Clone>(resource: &K, finalizer: &str) -> K {
    let mut updated = resource.clone();
    let finalizers = updated.meta_mut().finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|name| name == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    updated
}

/// Returns a copy of `resource` with every occurrence of `finalizer` removed
pub fn without_finalizer<K: Resource + Clone>(resource: &K, finalizer: &str) -> K {
    let mut updated = resource.clone();
    if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
        finalizers.retain(|name| name != finalizer);
    }
    updated
}

/// Find the Capabilities resource describing `device_ref` in `namespace`.
///
/// When several resources name the same device an available one wins.
pub async fn find_capabilities(
    store: &dyn ResourceStore<Capabilities>,
    namespace: &str,
    device_ref: &str,
) -> Result<Option<Capabilities>, StoreError> {
    let mut matching: Vec<Capabilities> = store
        .list(Some(namespace))
        .await?
        .into_iter()
        .filter(|caps| caps.spec.device_ref == device_ref)
        .collect();
    matching.sort_by_key(|caps| !caps.is_available());
    Ok(matching.into_iter().next())
}
