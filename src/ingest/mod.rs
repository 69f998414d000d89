//! Message ingestion pipeline.
//!
//! [`Archiver::add_to_list`] runs one raw message through normalization and
//! attachment extraction, then, inside a single store transaction,
//! deduplication, thread resolution, persistence and (outside batch mode)
//! ordering. Parsing happens before the transaction is opened so that a
//! retry after a conflict only repeats the store work.

pub mod dedup;
pub mod error;
pub mod identity;
pub mod normalize;
pub mod scrub;
pub mod settings;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::attachments::{
    read_content, AttachmentKey, AttachmentStorage, FilesystemStorage, InlineStorage,
    StoredContent,
};
use crate::config::ArchiverConfig;
use crate::models::{MailingList, NewAttachment, NewEmail};
use crate::store::{ArchiveBackend, ArchiveStore, StoreError};
use crate::threading::{deletion, ordering, resolver};

pub use error::{IngestError, IngestResult};
pub use normalize::NormalizedMessage;
pub use scrub::{ExtractedAttachment, ScrubbedMessage};
pub use settings::{ListSettings, ListSettingsProvider, StaticListSettings};

/// A message that parsed cleanly and is ready to be stored.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    pub message: NormalizedMessage,
    pub scrubbed: ScrubbedMessage,
}

impl PreparedMessage {
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.message.date
    }
}

/// Result of archiving one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub message_id: String,
    pub message_id_hash: String,
    pub email_id: i32,
    pub thread_id: i32,
    /// External key of the thread holding the message.
    pub thread_key: String,
    /// Threads whose ordering is stale after this message.
    pub impacted_threads: Vec<i32>,
}

#[derive(Clone)]
pub struct Archiver {
    backend: Arc<dyn ArchiveBackend>,
    config: ArchiverConfig,
    list_settings: Arc<dyn ListSettingsProvider>,
    attachments: Arc<dyn AttachmentStorage>,
}

impl Archiver {
    /// Attachments go to the configured folder when there is one, inline
    /// otherwise.
    pub fn new(backend: Arc<dyn ArchiveBackend>, config: ArchiverConfig) -> Self {
        let attachments: Arc<dyn AttachmentStorage> = match &config.attachment_folder {
            Some(folder) => Arc::new(FilesystemStorage::new(folder)),
            None => Arc::new(InlineStorage),
        };
        Self {
            backend,
            config,
            list_settings: Arc::new(StaticListSettings::new()),
            attachments,
        }
    }

    pub fn with_list_settings(mut self, provider: Arc<dyn ListSettingsProvider>) -> Self {
        self.list_settings = provider;
        self
    }

    pub fn with_attachment_storage(mut self, storage: Arc<dyn AttachmentStorage>) -> Self {
        self.attachments = storage;
        self
    }

    /// Same archiver with ordering deferred and settings sync skipped.
    pub fn batch(&self) -> Self {
        let mut archiver = self.clone();
        archiver.config.batch_mode = true;
        archiver
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn ArchiveBackend {
        self.backend.as_ref()
    }

    pub fn attachment_storage(&self) -> &dyn AttachmentStorage {
        self.attachments.as_ref()
    }

    /// Parse, repair and scrub a raw message without touching the store.
    pub fn prepare(&self, raw: &[u8]) -> IngestResult<PreparedMessage> {
        let (envelope, body) = normalize::split_envelope(raw);
        let parsed = normalize::parse(body)?;
        let message =
            normalize::normalize(&parsed, envelope.as_deref(), &self.config.message_id_domain)?;
        let scrubbed = scrub::scrub(&parsed, self.config.attachment_counter_base);
        Ok(PreparedMessage { message, scrubbed })
    }

    /// Archive a raw message in `list_name`.
    pub async fn add_to_list(&self, list_name: &str, raw: &[u8]) -> IngestResult<IngestOutcome> {
        let prepared = self.prepare(raw)?;
        self.add_prepared(list_name, &prepared).await
    }

    /// Archive an already prepared message, retrying transient store
    /// failures.
    pub async fn add_prepared(
        &self,
        list_name: &str,
        prepared: &PreparedMessage,
    ) -> IngestResult<IngestOutcome> {
        let list_name = list_name.trim().to_lowercase();
        if !list_name.contains('@') {
            return Err(IngestError::Configuration(format!(
                "list address {} must contain @",
                list_name
            )));
        }

        let date = match prepared.message.date {
            Some(date) => date,
            None if self.config.default_undated_to_now => {
                log::warn!(
                    "message {} has no usable date, using the archival time",
                    prepared.message.message_id
                );
                Utc::now()
            }
            None => {
                return Err(IngestError::malformed(
                    &prepared.message.message_id,
                    "no usable date",
                ));
            }
        };

        let mut attempt = 0;
        loop {
            match self.try_add(&list_name, prepared, date).await {
                Err(IngestError::PersistenceConflict { ref source, .. })
                    if source.is_retryable() && attempt < self.config.max_transaction_retries =>
                {
                    attempt += 1;
                    log::debug!(
                        "retrying {} after a store conflict (attempt {}): {}",
                        prepared.message.message_id,
                        attempt,
                        source
                    );
                }
                Err(err @ IngestError::PersistenceConflict { .. }) => {
                    log::error!("{}", err);
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    fn store_error(&self, message: &NormalizedMessage, err: StoreError) -> IngestError {
        if let Some(duplicate) = dedup::duplicate_from_store(&err) {
            return duplicate;
        }
        IngestError::PersistenceConflict {
            message_id: message.message_id.clone(),
            sender: message.sender_address.clone(),
            subject: message.subject.clone(),
            source: err,
        }
    }

    async fn try_add(
        &self,
        list_name: &str,
        prepared: &PreparedMessage,
        date: DateTime<Utc>,
    ) -> IngestResult<IngestOutcome> {
        let mut store = self
            .backend
            .begin()
            .await
            .map_err(|e| self.store_error(&prepared.message, e))?;

        let mut saved = Vec::new();
        let result = match self
            .persist(store.as_mut(), list_name, prepared, date, &mut saved)
            .await
        {
            Ok(outcome) => store
                .commit()
                .await
                .map(|()| outcome)
                .map_err(|e| self.store_error(&prepared.message, e)),
            Err(err) => Err(err),
        };

        if result.is_err() {
            for key in &saved {
                if let Err(err) = self.attachments.remove(key) {
                    log::warn!("failed to remove attachment after rollback: {}", err);
                }
            }
        }
        result
    }

    async fn persist(
        &self,
        store: &mut dyn ArchiveStore,
        list_name: &str,
        prepared: &PreparedMessage,
        date: DateTime<Utc>,
        saved: &mut Vec<AttachmentKey>,
    ) -> IngestResult<IngestOutcome> {
        let fail = |e: StoreError| self.store_error(&prepared.message, e);

        let mut list = store.lock_mailing_list(list_name).await.map_err(fail)?;
        if !self.config.batch_mode && self.apply_list_settings(&mut list) {
            store.update_mailing_list(&list).await.map_err(fail)?;
        }

        let mut message = prepared.message.clone();
        message.strip_subject_prefix(&list.subject_prefix);

        if dedup::is_duplicate(store, list_name, &message.message_id)
            .await
            .map_err(fail)?
        {
            log::debug!("{} is already archived in {}", message.message_id, list_name);
            return Err(IngestError::DuplicateMessage(message.message_id));
        }

        store
            .upsert_sender(&message.sender_address, &message.sender_name)
            .await
            .map_err(fail)?;

        let placement = resolver::place(store, list_name, &message, date)
            .await
            .map_err(fail)?;

        let email = store
            .insert_email(&NewEmail {
                mailinglist: list_name.to_string(),
                message_id: message.message_id.clone(),
                message_id_hash: message.message_id_hash.clone(),
                sender_address: message.sender_address.clone(),
                sender_name: message.display_sender().to_string(),
                subject: message.subject.clone(),
                content: prepared.scrubbed.body.clone(),
                date,
                timezone: message.timezone,
                in_reply_to: message.in_reply_to.clone(),
                thread_id: placement.thread.id,
                parent_id: placement.parent.as_ref().map(|p| p.id),
            })
            .await
            .map_err(fail)?;

        let mut thread = placement.thread;
        if placement.created_thread {
            thread.starting_email_id = Some(email.id);
        }
        thread.date_active = thread.date_active.max(date);
        store.update_thread(&thread).await.map_err(fail)?;

        for attachment in &prepared.scrubbed.attachments {
            let key = AttachmentKey {
                mailinglist: list_name.to_string(),
                message_id_hash: email.message_id_hash.clone(),
                email_id: email.id,
                counter: attachment.counter,
            };
            let stored = self.attachments.save(&key, &attachment.content)?;
            if stored == StoredContent::External {
                saved.push(key);
            }
            store
                .insert_attachment(&NewAttachment {
                    email_id: email.id,
                    counter: attachment.counter,
                    name: attachment.name.clone(),
                    content_type: attachment.content_type.clone(),
                    encoding: attachment.encoding.clone(),
                    size: attachment.content.len() as i32,
                    content: (stored == StoredContent::Inline).then(|| attachment.content.clone()),
                })
                .await
                .map_err(fail)?;
        }

        let thread_id = resolver::adopt_orphans(store, &email).await.map_err(fail)?;
        if !self.config.batch_mode {
            ordering::recompute_thread(store, thread_id)
                .await
                .map_err(fail)?;
        }

        let thread_key = match store.thread(thread_id).await.map_err(fail)? {
            Some(thread) => thread.thread_id,
            None => thread.thread_id,
        };

        log::debug!(
            "archived {} in {} (thread {})",
            message.message_id,
            list_name,
            thread_key
        );

        Ok(IngestOutcome {
            message_id: message.message_id,
            message_id_hash: email.message_id_hash,
            email_id: email.id,
            thread_id,
            thread_key,
            impacted_threads: vec![thread_id],
        })
    }

    fn apply_list_settings(&self, list: &mut MailingList) -> bool {
        match self.list_settings.settings(&list.name) {
            Some(settings) => settings.apply_to(list),
            None => false,
        }
    }

    /// Copy the list manager's settings onto the stored list, creating it if
    /// needed. Returns whether anything changed.
    pub async fn sync_list_settings(&self, list_name: &str) -> IngestResult<bool> {
        let mut store = self.backend.begin().await?;
        let mut list = store.lock_mailing_list(list_name).await?;
        let changed = self.apply_list_settings(&mut list);
        if changed {
            store.update_mailing_list(&list).await?;
            log::info!("updated settings of {}", list_name);
        }
        store.commit().await?;
        Ok(changed)
    }

    /// Recompute the ordering of each thread once, in configured batches.
    pub async fn recompute_threads<I>(&self, thread_ids: I) -> IngestResult<usize>
    where
        I: IntoIterator<Item = i32>,
    {
        Ok(ordering::recompute_threads(
            self.backend.as_ref(),
            thread_ids,
            self.config.ordering_batch_size,
        )
        .await?)
    }

    /// Delete one message by hash. Returns the surviving thread id, `None`
    /// when the thread went away with it.
    pub async fn delete_email(
        &self,
        list_name: &str,
        message_id_hash: &str,
    ) -> IngestResult<Option<i32>> {
        let mut store = self.backend.begin().await?;
        let email = store
            .email_by_hash(list_name, message_id_hash)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("message {}", message_id_hash)))?;
        let keys: Vec<AttachmentKey> = store
            .attachments_for_email(email.id)
            .await?
            .into_iter()
            .map(|a| AttachmentKey {
                mailinglist: email.mailinglist.clone(),
                message_id_hash: email.message_id_hash.clone(),
                email_id: email.id,
                counter: a.counter,
            })
            .collect();

        let thread_id = deletion::delete_email(store.as_mut(), email.id).await?;
        store.commit().await?;

        self.remove_attachment_files(&keys);
        log::info!("deleted message {} from {}", email.message_id, list_name);
        Ok(thread_id)
    }

    /// Delete a thread by key, with its messages and attachments.
    pub async fn delete_thread(&self, list_name: &str, thread_key: &str) -> IngestResult<()> {
        let mut store = self.backend.begin().await?;
        let thread = store
            .thread_by_key(list_name, thread_key)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("thread {}", thread_key)))?;

        let mut keys = Vec::new();
        for email in store.thread_emails(thread.id).await? {
            for attachment in store.attachments_for_email(email.id).await? {
                keys.push(AttachmentKey {
                    mailinglist: email.mailinglist.clone(),
                    message_id_hash: email.message_id_hash.clone(),
                    email_id: email.id,
                    counter: attachment.counter,
                });
            }
        }

        deletion::delete_thread(store.as_mut(), thread.id).await?;
        store.commit().await?;

        self.remove_attachment_files(&keys);
        Ok(())
    }

    fn remove_attachment_files(&self, keys: &[AttachmentKey]) {
        for key in keys {
            if let Err(err) = self.attachments.remove(key) {
                log::warn!("failed to remove attachment file: {}", err);
            }
        }
    }

    /// Bytes of one attachment, from external storage or the database.
    pub async fn attachment_content(
        &self,
        list_name: &str,
        message_id_hash: &str,
        counter: i16,
    ) -> IngestResult<Vec<u8>> {
        let mut store = self.backend.begin().await?;
        let email = store
            .email_by_hash(list_name, message_id_hash)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("message {}", message_id_hash)))?;
        let attachment = store
            .attachment(email.id, counter)
            .await?
            .ok_or_else(|| {
                IngestError::NotFound(format!("attachment {} of {}", counter, message_id_hash))
            })?;
        store.commit().await?;

        let key = AttachmentKey {
            mailinglist: email.mailinglist,
            message_id_hash: email.message_id_hash,
            email_id: email.id,
            counter,
        };
        read_content(self.attachments.as_ref(), &key, attachment.content.as_deref())?
            .ok_or_else(|| IngestError::NotFound(format!("content of attachment {}", counter)))
    }

    /// Move inline attachment bytes to the configured folder, `chunk_size`
    /// attachments per transaction. Returns the number moved.
    pub async fn externalize_attachments(&self, chunk_size: i64) -> IngestResult<usize> {
        let folder = self.config.attachment_folder.as_ref().ok_or_else(|| {
            IngestError::Configuration("no attachment folder is configured".to_string())
        })?;
        let storage = FilesystemStorage::new(folder);
        let mut after_id = 0;
        let mut moved = 0;

        loop {
            let mut store = self.backend.begin().await?;
            let batch = store.inline_attachments(after_id, chunk_size.max(1)).await?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;

            for attachment in &batch {
                let Some(email) = store.email(attachment.email_id).await? else {
                    continue;
                };
                let Some(content) = attachment.content.as_deref() else {
                    continue;
                };
                let key = AttachmentKey {
                    mailinglist: email.mailinglist,
                    message_id_hash: email.message_id_hash,
                    email_id: email.id,
                    counter: attachment.counter,
                };
                storage.save(&key, content)?;
                store.clear_attachment_content(attachment.id).await?;
                moved += 1;
            }
            store.commit().await?;
            log::info!("moved {} attachments to {}", moved, folder.display());
        }

        Ok(moved)
    }

    pub async fn latest_email_date(&self, list_name: &str) -> IngestResult<Option<DateTime<Utc>>> {
        let mut store = self.backend.begin().await?;
        let latest = store.latest_email_date(list_name).await?;
        store.commit().await?;
        Ok(latest)
    }

    pub async fn count_emails(&self, list_name: &str) -> IngestResult<i64> {
        let mut store = self.backend.begin().await?;
        let count = store.count_emails(list_name).await?;
        store.commit().await?;
        Ok(count)
    }
}
