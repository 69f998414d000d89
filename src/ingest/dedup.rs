//! Duplicate detection within a list.
//!
//! The identity of a message is its stored Message-ID within a list. The
//! check runs inside the ingestion transaction; the `(mailinglist,
//! message_id)` unique constraint backs it up when the check races.

use super::error::IngestError;
use crate::store::{ArchiveStore, StoreError, StoreResult};

/// Whether `message_id` is already archived in `mailinglist`.
pub async fn is_duplicate(
    store: &mut dyn ArchiveStore,
    mailinglist: &str,
    message_id: &str,
) -> StoreResult<bool> {
    Ok(store
        .email_by_message_id(mailinglist, message_id)
        .await?
        .is_some())
}

/// Map a store-level collision to the pipeline's duplicate error.
pub fn duplicate_from_store(err: &StoreError) -> Option<IngestError> {
    match err {
        StoreError::Duplicate(message_id) => Some(IngestError::DuplicateMessage(message_id.clone())),
        _ => None,
    }
}
