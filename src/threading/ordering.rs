//! Thread ordering: `thread_depth` and `thread_order` recomputation.
//!
//! `thread_order` is the pre-order position of a message in a depth-first
//! traversal from the thread root, siblings sorted by `(date, message_id)`.
//! Traversal is iterative with an explicit stack, so deep threads cannot
//! overflow the call stack.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::models::{Email, ThreadPosition};
use crate::store::{ArchiveBackend, ArchiveStore, StoreResult};

fn sibling_key(email: &Email) -> (chrono::DateTime<chrono::Utc>, &str) {
    (email.date, email.message_id.as_str())
}

/// Pick the root of a thread: the preferred starting email when it has no
/// parent, otherwise the oldest parentless message, otherwise the oldest
/// message.
fn select_root<'a>(emails: &'a [Email], preferred: Option<i32>, ids: &HashSet<i32>) -> &'a Email {
    let is_root = |e: &Email| e.parent_id.is_none_or(|p| !ids.contains(&p) || p == e.id);

    if let Some(preferred) = preferred.and_then(|id| emails.iter().find(|e| e.id == id)) {
        if is_root(preferred) {
            return preferred;
        }
    }

    let mut candidates: Vec<&Email> = emails.iter().filter(|e| is_root(*e)).collect();
    if candidates.is_empty() {
        candidates = emails.iter().collect();
    }
    candidates
        .into_iter()
        .min_by(|a, b| sibling_key(a).cmp(&sibling_key(b)))
        .unwrap_or(&emails[0])
}

/// Iterative pre-order walk of the subtree below `start`.
fn walk_subtree<'a>(
    start: &'a Email,
    parent: Option<i32>,
    depth: i32,
    children: &HashMap<i32, Vec<&'a Email>>,
    visited: &mut HashSet<i32>,
    positions: &mut Vec<ThreadPosition>,
) {
    // Stack for iterative DFS: (email, parent_id, depth)
    let mut stack = vec![(start, parent, depth)];
    while let Some((email, parent_id, depth)) = stack.pop() {
        if !visited.insert(email.id) {
            continue;
        }
        let thread_order = positions.len() as i32;
        positions.push(ThreadPosition {
            email_id: email.id,
            parent_id,
            thread_depth: depth,
            thread_order,
        });
        if let Some(replies) = children.get(&email.id) {
            // Add children in reverse order to maintain DFS left-to-right order
            for reply in replies.iter().rev() {
                stack.push((*reply, Some(email.id), depth + 1));
            }
        }
    }
}

/// Compute the position of every message of a thread.
///
/// ## Algorithm
///
/// 1. Pick the root with `select_root`.
/// 2. Group messages under their parent, dropping links to rows outside the
///    thread and self links. Siblings are sorted by `(date, message_id)`.
/// 3. Walk the tree depth-first from the root with an explicit stack,
///    handing out `thread_order` in visit order and `thread_depth` as the
///    distance from the root.
/// 4. Messages the walk never reached (legacy threads with several roots,
///    or a corrupt parent chain) are re-attached as extra children of the
///    root and walked after its subtree, parentless ones first.
///
/// ## Arguments
///
/// * `emails` - Every message of one thread, in any order
/// * `preferred_root` - The thread's recorded starting email, if any
///
/// ## Returns
///
/// One [`ThreadPosition`] per message, root first, in `thread_order`.
/// Empty when the thread has no messages.
pub fn compute_thread_positions(emails: &[Email], preferred_root: Option<i32>) -> Vec<ThreadPosition> {
    if emails.is_empty() {
        return Vec::new();
    }

    let ids: HashSet<i32> = emails.iter().map(|e| e.id).collect();
    let root = select_root(emails, preferred_root, &ids);

    let mut children: HashMap<i32, Vec<&Email>> = HashMap::new();
    for email in emails {
        if email.id == root.id {
            continue;
        }
        if let Some(parent) = email.parent_id.filter(|p| ids.contains(p) && *p != email.id) {
            children.entry(parent).or_default().push(email);
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| sibling_key(a).cmp(&sibling_key(b)));
    }

    let mut positions = Vec::with_capacity(emails.len());
    let mut visited = HashSet::with_capacity(emails.len());

    walk_subtree(root, None, 0, &children, &mut visited, &mut positions);

    if positions.len() < emails.len() {
        let mut stragglers: Vec<&Email> = emails.iter().collect();
        stragglers.sort_by(|a, b| {
            // parentless messages first, so their subtrees stay intact
            (a.parent_id.is_some(), sibling_key(a)).cmp(&(b.parent_id.is_some(), sibling_key(b)))
        });
        for email in stragglers {
            if visited.contains(&email.id) {
                continue;
            }
            log::warn!(
                "message {} is unreachable from thread root {}, attaching it to the root",
                email.message_id,
                root.message_id
            );
            walk_subtree(email, Some(root.id), 1, &children, &mut visited, &mut positions);
        }
    }

    positions
}

/// Positions that differ from what is stored.
fn changed_positions(emails: &[Email], positions: &[ThreadPosition]) -> Vec<ThreadPosition> {
    let current: HashMap<i32, &Email> = emails.iter().map(|e| (e.id, e)).collect();
    positions
        .iter()
        .filter(|p| {
            current.get(&p.email_id).is_none_or(|e| {
                e.parent_id != p.parent_id
                    || e.thread_depth != p.thread_depth
                    || e.thread_order != p.thread_order
            })
        })
        .copied()
        .collect()
}

/// Recompute and persist the ordering of one thread, returning the number of
/// rewritten messages. Missing threads are skipped.
pub async fn recompute_thread(store: &mut dyn ArchiveStore, thread_id: i32) -> StoreResult<usize> {
    let Some(mut thread) = store.thread(thread_id).await? else {
        log::debug!("thread {} no longer exists, skipping ordering", thread_id);
        return Ok(0);
    };
    let emails = store.thread_emails(thread_id).await?;
    if emails.is_empty() {
        return Ok(0);
    }

    let positions = compute_thread_positions(&emails, thread.starting_email_id);
    let changed = changed_positions(&emails, &positions);
    if !changed.is_empty() {
        store.update_thread_positions(&changed).await?;
    }

    let root = positions.first().map(|p| p.email_id);
    if thread.starting_email_id != root {
        thread.starting_email_id = root;
        store.update_thread(&thread).await?;
    }

    log::trace!(
        "ordered thread {} ({} messages, {} changed)",
        thread.thread_id,
        emails.len(),
        changed.len()
    );
    Ok(changed.len())
}

/// Recompute each distinct thread once, `batch_size` threads per transaction.
pub async fn recompute_threads<I>(
    backend: &dyn ArchiveBackend,
    thread_ids: I,
    batch_size: usize,
) -> StoreResult<usize>
where
    I: IntoIterator<Item = i32>,
{
    let unique: Vec<i32> = thread_ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
    let mut rewritten = 0;

    for batch in unique.chunks(batch_size.max(1)) {
        let mut store = backend.begin().await?;
        for &thread_id in batch {
            rewritten += recompute_thread(store.as_mut(), thread_id).await?;
        }
        store.commit().await?;
        log::debug!("computed ordering for {} threads", batch.len());
    }

    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn email(id: i32, parent_id: Option<i32>, minutes: i64) -> Email {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Email {
            id,
            mailinglist: "list@example.com".into(),
            message_id: format!("m{}@x", id),
            message_id_hash: format!("H{}", id),
            sender_address: "dev@example.com".into(),
            sender_name: "dev".into(),
            subject: String::new(),
            content: String::new(),
            date: base + Duration::minutes(minutes),
            timezone: 0,
            in_reply_to: None,
            archived_date: base,
            thread_id: 1,
            parent_id,
            thread_depth: 0,
            thread_order: 0,
        }
    }

    fn summary(positions: &[ThreadPosition]) -> Vec<(i32, i32, i32)> {
        positions
            .iter()
            .map(|p| (p.email_id, p.thread_depth, p.thread_order))
            .collect()
    }

    #[test]
    fn preorder_with_siblings_by_date() {
        // 1 ─┬─ 3 (t=5) ── 4
        //    └─ 2 (t=10)
        let emails = vec![
            email(1, None, 0),
            email(2, Some(1), 10),
            email(3, Some(1), 5),
            email(4, Some(3), 20),
        ];
        let positions = compute_thread_positions(&emails, Some(1));
        assert_eq!(
            summary(&positions),
            vec![(1, 0, 0), (3, 1, 1), (4, 2, 2), (2, 1, 3)]
        );
    }

    #[test]
    fn identical_dates_fall_back_to_message_id() {
        let emails = vec![email(1, None, 0), email(3, Some(1), 5), email(2, Some(1), 5)];
        let positions = compute_thread_positions(&emails, None);
        assert_eq!(summary(&positions), vec![(1, 0, 0), (2, 1, 1), (3, 1, 2)]);
    }

    #[test]
    fn result_does_not_depend_on_input_order() {
        let mut emails = vec![
            email(1, None, 0),
            email(2, Some(1), 1),
            email(3, Some(2), 2),
            email(4, Some(1), 3),
        ];
        let forward = compute_thread_positions(&emails, None);
        emails.reverse();
        let backward = compute_thread_positions(&emails, None);
        assert_eq!(forward, backward);
    }

    #[test]
    fn extra_roots_follow_the_main_subtree() {
        let emails = vec![
            email(1, None, 0),
            email(2, Some(1), 1),
            email(3, None, 2),
            email(4, Some(3), 3),
        ];
        let positions = compute_thread_positions(&emails, Some(1));
        assert_eq!(
            summary(&positions),
            vec![(1, 0, 0), (2, 1, 1), (3, 1, 2), (4, 2, 3)]
        );
        assert_eq!(positions[2].parent_id, Some(1));
    }

    #[test]
    fn cyclic_parent_links_terminate() {
        let emails = vec![email(1, None, 0), email(2, Some(3), 1), email(3, Some(2), 2)];
        let positions = compute_thread_positions(&emails, None);
        assert_eq!(positions.len(), 3);
        assert_eq!(positions[0].email_id, 1);
        assert!(positions[1..].iter().all(|p| p.thread_depth >= 1));
    }

    #[test]
    fn unchanged_rows_are_not_rewritten() {
        let mut emails = vec![email(1, None, 0), email(2, Some(1), 1)];
        let positions = compute_thread_positions(&emails, None);
        emails[1].thread_depth = 1;
        emails[1].thread_order = 1;
        assert!(changed_positions(&emails, &positions).is_empty());
    }
}
