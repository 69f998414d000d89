//! Relational persistence for the archive.
//!
//! Every ingestion runs inside one [`ArchiveStore`] transaction obtained from
//! an [`ArchiveBackend`]. Dropping a store without calling
//! [`ArchiveStore::commit`] discards its changes.
//!
//! Two backends exist: [`postgres::PgBackend`] for production and
//! [`memory::MemoryBackend`] for tests and local tooling.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    Attachment, Email, MailingList, NewAttachment, NewEmail, Sender, Thread, ThreadPosition,
};

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

/// Errors surfaced by archive backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} is already archived")]
    Duplicate(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    /// Whether replaying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict(_) => true,
            StoreError::Database(sqlx::Error::Io(_))
            | StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => StoreError::Conflict(db_err.message().to_string()),
                _ => StoreError::Database(err),
            },
            _ => StoreError::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Selection of messages for export.
#[derive(Debug, Clone, Default)]
pub struct EmailFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub thread_key: Option<String>,
    pub message_id_hashes: Vec<String>,
}

impl EmailFilter {
    /// In-process evaluation, shared with the in-memory backend.
    pub fn matches(&self, email: &Email, thread: Option<&Thread>) -> bool {
        if let Some(start) = self.start {
            if email.date < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if email.date >= end {
                return false;
            }
        }
        if let Some(key) = &self.thread_key {
            if thread.map(|t| &t.thread_id) != Some(key) {
                return false;
            }
        }
        if !self.message_id_hashes.is_empty()
            && !self.message_id_hashes.contains(&email.message_id_hash)
        {
            return false;
        }
        true
    }
}

/// One open transaction against the archive.
#[rocket::async_trait]
pub trait ArchiveStore: Send {
    /// Fetch the list row, creating it if needed, and hold it for the rest of
    /// the transaction.
    async fn lock_mailing_list(&mut self, name: &str) -> StoreResult<MailingList>;
    async fn mailing_list(&mut self, name: &str) -> StoreResult<Option<MailingList>>;
    async fn update_mailing_list(&mut self, list: &MailingList) -> StoreResult<()>;

    async fn sender(&mut self, address: &str) -> StoreResult<Option<Sender>>;
    /// Create the sender on first sighting; refresh the name when `name` is
    /// non-empty.
    async fn upsert_sender(&mut self, address: &str, name: &str) -> StoreResult<()>;

    async fn insert_thread(
        &mut self,
        mailinglist: &str,
        thread_key: &str,
        date_active: DateTime<Utc>,
    ) -> StoreResult<Thread>;
    async fn thread(&mut self, id: i32) -> StoreResult<Option<Thread>>;
    async fn thread_by_key(&mut self, mailinglist: &str, key: &str)
    -> StoreResult<Option<Thread>>;
    /// Persist `date_active` and `starting_email_id`.
    async fn update_thread(&mut self, thread: &Thread) -> StoreResult<()>;
    /// Remove the thread with its emails and their attachments.
    async fn delete_thread(&mut self, id: i32) -> StoreResult<()>;

    /// Insert an email; a `(mailinglist, message_id)` collision yields
    /// [`StoreError::Duplicate`].
    async fn insert_email(&mut self, email: &NewEmail) -> StoreResult<Email>;
    async fn email(&mut self, id: i32) -> StoreResult<Option<Email>>;
    async fn email_by_message_id(
        &mut self,
        mailinglist: &str,
        message_id: &str,
    ) -> StoreResult<Option<Email>>;
    async fn email_by_hash(&mut self, mailinglist: &str, hash: &str)
    -> StoreResult<Option<Email>>;
    async fn set_parent(&mut self, email_id: i32, parent_id: Option<i32>) -> StoreResult<()>;
    /// Move every email of `from_thread` into `to_thread`, returning the count.
    async fn move_emails_to_thread(&mut self, from_thread: i32, to_thread: i32)
    -> StoreResult<u64>;
    async fn thread_emails(&mut self, thread_id: i32) -> StoreResult<Vec<Email>>;
    /// Direct replies, oldest first.
    async fn children(&mut self, email_id: i32) -> StoreResult<Vec<Email>>;
    /// Roots of the list whose `in_reply_to` names `message_id`.
    async fn orphans_replying_to(
        &mut self,
        mailinglist: &str,
        message_id: &str,
    ) -> StoreResult<Vec<Email>>;
    async fn update_thread_positions(&mut self, positions: &[ThreadPosition]) -> StoreResult<()>;
    async fn delete_email(&mut self, id: i32) -> StoreResult<()>;
    async fn latest_email_date(&mut self, mailinglist: &str)
    -> StoreResult<Option<DateTime<Utc>>>;
    async fn count_emails(&mut self, mailinglist: &str) -> StoreResult<i64>;
    /// Emails matching `filter`, ordered by date.
    async fn emails_for_export(
        &mut self,
        mailinglist: &str,
        filter: &EmailFilter,
    ) -> StoreResult<Vec<Email>>;

    async fn insert_attachment(&mut self, attachment: &NewAttachment)
    -> StoreResult<Attachment>;
    async fn attachments_for_email(&mut self, email_id: i32) -> StoreResult<Vec<Attachment>>;
    async fn attachment(&mut self, email_id: i32, counter: i16)
    -> StoreResult<Option<Attachment>>;
    /// Attachments still holding inline content with an id above `after_id`.
    async fn inline_attachments(&mut self, after_id: i32, limit: i64)
    -> StoreResult<Vec<Attachment>>;
    async fn clear_attachment_content(&mut self, id: i32) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Factory for archive transactions.
#[rocket::async_trait]
pub trait ArchiveBackend: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn ArchiveStore>>;
}
