//! Message and thread deletion with tree repair.

use crate::store::{ArchiveStore, StoreError, StoreResult};

use super::ordering::recompute_thread;

/// Delete one message, keeping its thread a tree.
///
/// Replies to a deleted root are re-rooted under the earliest of them;
/// replies to any other message move up to its parent. A thread left empty is
/// removed. Returns the surviving thread id, if any.
pub async fn delete_email(store: &mut dyn ArchiveStore, email_id: i32) -> StoreResult<Option<i32>> {
    let email = store
        .email(email_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("email {}", email_id)))?;
    let children = store.children(email.id).await?;

    match (email.parent_id, children.split_first()) {
        (None, Some((new_root, others))) => {
            store.set_parent(new_root.id, None).await?;
            for child in others {
                store.set_parent(child.id, Some(new_root.id)).await?;
            }
            log::debug!(
                "promoted {} to root after deleting {}",
                new_root.message_id,
                email.message_id
            );
        }
        (Some(parent_id), _) => {
            for child in &children {
                store.set_parent(child.id, Some(parent_id)).await?;
            }
        }
        (None, None) => {}
    }

    store.delete_email(email.id).await?;

    let remaining = store.thread_emails(email.thread_id).await?;
    if remaining.is_empty() {
        store.delete_thread(email.thread_id).await?;
        log::info!("deleted empty thread {}", email.thread_id);
        return Ok(None);
    }

    let Some(mut thread) = store.thread(email.thread_id).await? else {
        return Ok(None);
    };
    thread.starting_email_id = remaining
        .iter()
        .filter(|e| e.parent_id.is_none())
        .min_by(|a, b| (a.date, &a.message_id).cmp(&(b.date, &b.message_id)))
        .map(|e| e.id);
    if let Some(latest) = remaining.iter().map(|e| e.date).max() {
        thread.date_active = latest;
    }
    store.update_thread(&thread).await?;
    recompute_thread(store, thread.id).await?;

    Ok(Some(thread.id))
}

/// Delete a whole thread with its messages and attachments.
pub async fn delete_thread(store: &mut dyn ArchiveStore, thread_id: i32) -> StoreResult<()> {
    if store.thread(thread_id).await?.is_none() {
        return Err(StoreError::NotFound(format!("thread {}", thread_id)));
    }
    store.delete_thread(thread_id).await?;
    log::info!("deleted thread {}", thread_id);
    Ok(())
}
