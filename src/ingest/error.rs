use thiserror::Error;

use crate::attachments::AttachmentError;
use crate::store::StoreError;

pub type IngestResult<T> = Result<T, IngestError>;

/// Failures of the ingestion pipeline and the archive maintenance operations.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("message {0} is already archived")]
    DuplicateMessage(String),
    #[error("malformed message {message_id}: {reason}")]
    MalformedMessage { message_id: String, reason: String },
    #[error("could not store message {message_id} from {sender} ({subject}): {source}")]
    PersistenceConflict {
        message_id: String,
        sender: String,
        subject: String,
        #[source]
        source: StoreError,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("attachment storage error: {0}")]
    Attachments(#[from] AttachmentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn malformed(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::MalformedMessage {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure only concerns the submitted message.
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            IngestError::DuplicateMessage(_) | IngestError::MalformedMessage { .. }
        )
    }
}
