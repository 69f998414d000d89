//! Cycle checks for orphan adoption.
//!
//! Adopting a root under a new message must not make the root an ancestor of
//! itself, which happens when two messages name each other as parents.

use std::collections::{HashMap, HashSet};

use crate::models::Email;

/// Parent links of a set of emails, keyed by email row id.
pub fn parent_links(emails: &[Email]) -> HashMap<i32, Option<i32>> {
    emails.iter().map(|e| (e.id, e.parent_id)).collect()
}

/// Whether putting `child_id` under `parent_id` would close a loop.
///
/// ## Algorithm
///
/// Walk up the parent links starting at `parent_id`. Reaching `child_id`
/// means the child is already an ancestor of the proposed parent. Revisiting
/// a row means the stored chain is already corrupt, which also counts as a
/// cycle so the caller leaves the orphan where it is.
///
/// ## Arguments
///
/// * `parent_links` - Email row id → parent row id, as built by [`parent_links`]
/// * `child_id` - Row id of the root about to be adopted
/// * `parent_id` - Row id of the message that would adopt it
///
/// ## Returns
///
/// `true` if the adoption must be skipped, `false` if it is safe
///
/// ## Example
///
/// ```text
/// Stored chain:  a → b → c
///
/// Adopt a under c: true (a → b → c → a)
/// Adopt d under c: false
/// ```
pub fn detect_cycle_in_ancestry(
    parent_links: &HashMap<i32, Option<i32>>,
    child_id: i32,
    parent_id: i32,
) -> bool {
    let mut visited = HashSet::new();
    let mut current = Some(parent_id);

    while let Some(email_id) = current {
        if !visited.insert(email_id) {
            return true;
        }

        if email_id == child_id {
            return true;
        }

        current = parent_links.get(&email_id).copied().flatten();
    }

    false
}
