//! restore/reconcile: drop markers and tablet moves applied to a group state.
//!
//! apply() is pure: it takes the state accumulated so far and returns the state
//! after one drop. Replay calls it for a manifest's drops before loading that
//! manifest's data; the live cluster uses the same function for its own drops,
//! so a replay ends where the live store ended.

use std::collections::BTreeSet;

use crate::manifest::{DropKind, DropRecord};
use crate::metrics::{record_drop_op_applied, record_predicates_pruned};
use crate::store::{GroupState, KeyKind};

/// State after one drop.
///
/// - ALL  : nothing survives (data, predicate schema, types)
/// - DATA : data values go, schema and types stay
/// - ATTR : data and schema of exactly one predicate go
pub fn apply(mut state: GroupState, drop: &DropRecord) -> GroupState {
    match drop.kind {
        DropKind::All => state = GroupState::new(),
        DropKind::Data => state.retain(|k| k.kind != KeyKind::Data),
        DropKind::Attr => {
            if let Some(p) = drop.predicate.as_deref() {
                state.retain(|k| k.predicate() != Some(p));
            }
        }
    }
    record_drop_op_applied();
    state
}

/// Apply drops in recorded order.
pub fn apply_all(state: GroupState, drops: &[DropRecord]) -> GroupState {
    drops.iter().fold(state, apply)
}

/// Keep only the predicates assigned to this group (types always stay).
/// Returns the pruned predicate names.
pub fn retain_assigned(state: &mut GroupState, assigned: &BTreeSet<String>) -> BTreeSet<String> {
    let mut pruned = BTreeSet::new();
    state.retain(|k| match k.predicate() {
        Some(p) if !assigned.contains(p) => {
            pruned.insert(p.to_string());
            false
        }
        _ => true,
    });
    if !pruned.is_empty() {
        record_predicates_pruned(pruned.len());
    }
    pruned
}
