//! Thread resolution for newly ingested messages.
//!
//! A message joins the thread of the first stored message it references
//! (`In-Reply-To`, then `References` from newest to oldest) or starts a new
//! thread keyed by its own hash. Once stored, it adopts the roots that were
//! waiting for it (replies that arrived before their parent), merging their
//! threads into one.

use std::collections::HashSet;

use crate::ingest::NormalizedMessage;
use crate::models::{Email, Thread};
use crate::store::{ArchiveStore, StoreError, StoreResult};

use super::cycle_detection::{detect_cycle_in_ancestry, parent_links};

/// Where a new message goes.
#[derive(Debug, Clone)]
pub struct Placement {
    pub thread: Thread,
    pub parent: Option<Email>,
    pub created_thread: bool,
}

/// Candidate parent ids, most likely first. The message's own id is never a
/// candidate.
pub fn parent_candidates(message: &NormalizedMessage) -> Vec<&str> {
    let mut seen = HashSet::new();
    message
        .in_reply_to
        .iter()
        .chain(message.references.iter().rev())
        .map(String::as_str)
        .filter(|id| *id != message.message_id)
        .filter(|id| seen.insert(*id))
        .collect()
}

/// First candidate parent stored in the list.
pub async fn find_parent(
    store: &mut dyn ArchiveStore,
    mailinglist: &str,
    message: &NormalizedMessage,
) -> StoreResult<Option<Email>> {
    for candidate in parent_candidates(message) {
        if let Some(parent) = store.email_by_message_id(mailinglist, candidate).await? {
            log::trace!("{} replies to {}", message.message_id, parent.message_id);
            return Ok(Some(parent));
        }
    }
    Ok(None)
}

/// Decide the thread and parent of a message that is about to be inserted.
pub async fn place(
    store: &mut dyn ArchiveStore,
    mailinglist: &str,
    message: &NormalizedMessage,
    date: chrono::DateTime<chrono::Utc>,
) -> StoreResult<Placement> {
    if let Some(parent) = find_parent(store, mailinglist, message).await? {
        let thread = store
            .thread(parent.thread_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("thread {}", parent.thread_id)))?;
        return Ok(Placement {
            thread,
            parent: Some(parent),
            created_thread: false,
        });
    }

    if let Some(thread) = store
        .thread_by_key(mailinglist, &message.message_id_hash)
        .await?
    {
        log::debug!(
            "reusing existing thread {} for {}",
            thread.thread_id,
            message.message_id
        );
        return Ok(Placement {
            thread,
            parent: None,
            created_thread: false,
        });
    }

    let thread = store
        .insert_thread(mailinglist, &message.message_id_hash, date)
        .await?;
    Ok(Placement {
        thread,
        parent: None,
        created_thread: true,
    })
}

/// Merge two threads after `root_thread` adopted the root of `other`.
///
/// The earlier-discovered thread (lower row id) survives and keeps its key;
/// the root of `root_thread` becomes the starting email of the result.
pub async fn merge_threads(
    store: &mut dyn ArchiveStore,
    root_thread: i32,
    other: i32,
) -> StoreResult<i32> {
    if root_thread == other {
        return Ok(root_thread);
    }
    let adopter = store
        .thread(root_thread)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("thread {}", root_thread)))?;
    let adopted = store
        .thread(other)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("thread {}", other)))?;

    let starting_email_id = adopter.starting_email_id;
    let date_active = adopter.date_active.max(adopted.date_active);
    let (mut survivor, absorbed) = if adopter.id < adopted.id {
        (adopter, adopted)
    } else {
        (adopted, adopter)
    };

    let moved = store.move_emails_to_thread(absorbed.id, survivor.id).await?;
    survivor.date_active = date_active;
    survivor.starting_email_id = starting_email_id;
    store.update_thread(&survivor).await?;
    store.delete_thread(absorbed.id).await?;

    log::debug!(
        "merged thread {} into {} ({} messages moved)",
        absorbed.thread_id,
        survivor.thread_id,
        moved
    );
    Ok(survivor.id)
}

/// Re-parent the roots waiting for `email` under it, merging their threads.
///
/// Returns the id of the thread holding `email` afterwards. An orphan whose
/// adoption would create a cycle stays a root.
pub async fn adopt_orphans(store: &mut dyn ArchiveStore, email: &Email) -> StoreResult<i32> {
    let orphans = store
        .orphans_replying_to(&email.mailinglist, &email.message_id)
        .await?;
    let mut thread_id = email.thread_id;

    for orphan in orphans.into_iter().filter(|o| o.id != email.id) {
        let members = store.thread_emails(thread_id).await?;
        if detect_cycle_in_ancestry(&parent_links(&members), orphan.id, email.id) {
            log::warn!(
                "not adopting {} under {}: it would create a cycle",
                orphan.message_id,
                email.message_id
            );
            continue;
        }

        store.set_parent(orphan.id, Some(email.id)).await?;
        log::debug!("{} adopted orphan {}", email.message_id, orphan.message_id);

        if orphan.thread_id != thread_id {
            thread_id = merge_threads(store, thread_id, orphan.thread_id).await?;
        }
    }

    Ok(thread_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, in_reply_to: Option<&str>, references: &[&str]) -> NormalizedMessage {
        NormalizedMessage {
            message_id: id.to_string(),
            message_id_hash: id.to_uppercase(),
            generated_id: false,
            subject: String::new(),
            sender_address: "dev@example.com".into(),
            sender_name: String::new(),
            date: None,
            timezone: 0,
            in_reply_to: in_reply_to.map(str::to_string),
            references: references.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn candidates_prefer_in_reply_to_then_newest_reference() {
        let msg = message("d@x", Some("c@x"), &["a@x", "b@x", "c@x"]);
        assert_eq!(parent_candidates(&msg), vec!["c@x", "b@x", "a@x"]);
    }

    #[test]
    fn own_id_is_never_a_candidate() {
        let msg = message("a@x", Some("a@x"), &["root@x", "a@x"]);
        assert_eq!(parent_candidates(&msg), vec!["root@x"]);
    }
}
