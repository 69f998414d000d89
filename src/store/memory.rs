//! In-memory archive backend.
//!
//! Each transaction works on a private snapshot of the shared state. Commit
//! publishes the snapshot only if nobody else committed since it was taken;
//! otherwise it fails with a retryable [`StoreError::Conflict`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{ArchiveBackend, ArchiveStore, EmailFilter, StoreError, StoreResult};
use crate::models::{
    Attachment, Email, MailingList, NewAttachment, NewEmail, Sender, Thread, ThreadPosition,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    version: u64,
    lists: BTreeMap<String, MailingList>,
    senders: BTreeMap<String, Sender>,
    threads: BTreeMap<i32, Thread>,
    emails: BTreeMap<i32, Email>,
    attachments: BTreeMap<i32, Attachment>,
    next_thread_id: i32,
    next_email_id: i32,
    next_attachment_id: i32,
}

impl MemoryState {
    fn remove_email(&mut self, id: i32) {
        self.emails.remove(&id);
        self.attachments.retain(|_, attachment| attachment.email_id != id);
        for email in self.emails.values_mut() {
            if email.parent_id == Some(id) {
                email.parent_id = None;
            }
        }
        for thread in self.threads.values_mut() {
            if thread.starting_email_id == Some(id) {
                thread.starting_email_id = None;
            }
        }
    }
}

/// Shared in-process archive.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl ArchiveBackend for MemoryBackend {
    async fn begin(&self) -> StoreResult<Box<dyn ArchiveStore>> {
        let snapshot = self.shared.lock().clone();
        Ok(Box::new(MemoryArchive {
            shared: Arc::clone(&self.shared),
            base_version: snapshot.version,
            state: snapshot,
        }))
    }
}

pub struct MemoryArchive {
    shared: Arc<Mutex<MemoryState>>,
    base_version: u64,
    state: MemoryState,
}

fn sorted_by_date(mut emails: Vec<Email>) -> Vec<Email> {
    emails.sort_by(|a, b| (a.date, &a.message_id).cmp(&(b.date, &b.message_id)));
    emails
}

#[rocket::async_trait]
impl ArchiveStore for MemoryArchive {
    async fn lock_mailing_list(&mut self, name: &str) -> StoreResult<MailingList> {
        Ok(self
            .state
            .lists
            .entry(name.to_string())
            .or_insert_with(|| MailingList::new(name))
            .clone())
    }

    async fn mailing_list(&mut self, name: &str) -> StoreResult<Option<MailingList>> {
        Ok(self.state.lists.get(name).cloned())
    }

    async fn update_mailing_list(&mut self, list: &MailingList) -> StoreResult<()> {
        self.state.lists.insert(list.name.clone(), list.clone());
        Ok(())
    }

    async fn sender(&mut self, address: &str) -> StoreResult<Option<Sender>> {
        Ok(self.state.senders.get(address).cloned())
    }

    async fn upsert_sender(&mut self, address: &str, name: &str) -> StoreResult<()> {
        let sender = self
            .state
            .senders
            .entry(address.to_string())
            .or_insert_with(|| Sender {
                address: address.to_string(),
                name: String::new(),
                mailman_id: None,
            });
        if !name.is_empty() {
            sender.name = name.to_string();
        }
        Ok(())
    }

    async fn insert_thread(
        &mut self,
        mailinglist: &str,
        thread_key: &str,
        date_active: DateTime<Utc>,
    ) -> StoreResult<Thread> {
        let exists = self
            .state
            .threads
            .values()
            .any(|t| t.mailinglist == mailinglist && t.thread_id == thread_key);
        if exists {
            return Err(StoreError::Conflict(format!(
                "thread {} already exists in {}",
                thread_key, mailinglist
            )));
        }
        self.state.next_thread_id += 1;
        let thread = Thread {
            id: self.state.next_thread_id,
            mailinglist: mailinglist.to_string(),
            thread_id: thread_key.to_string(),
            date_active,
            starting_email_id: None,
        };
        self.state.threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    async fn thread(&mut self, id: i32) -> StoreResult<Option<Thread>> {
        Ok(self.state.threads.get(&id).cloned())
    }

    async fn thread_by_key(
        &mut self,
        mailinglist: &str,
        key: &str,
    ) -> StoreResult<Option<Thread>> {
        Ok(self
            .state
            .threads
            .values()
            .find(|t| t.mailinglist == mailinglist && t.thread_id == key)
            .cloned())
    }

    async fn update_thread(&mut self, thread: &Thread) -> StoreResult<()> {
        match self.state.threads.get_mut(&thread.id) {
            Some(stored) => {
                stored.date_active = thread.date_active;
                stored.starting_email_id = thread.starting_email_id;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("thread {}", thread.id))),
        }
    }

    async fn delete_thread(&mut self, id: i32) -> StoreResult<()> {
        let members: Vec<i32> = self
            .state
            .emails
            .values()
            .filter(|e| e.thread_id == id)
            .map(|e| e.id)
            .collect();
        for email_id in members {
            self.state.remove_email(email_id);
        }
        self.state.threads.remove(&id);
        Ok(())
    }

    async fn insert_email(&mut self, new: &NewEmail) -> StoreResult<Email> {
        let duplicate = self
            .state
            .emails
            .values()
            .any(|e| e.mailinglist == new.mailinglist && e.message_id == new.message_id);
        if duplicate {
            return Err(StoreError::Duplicate(new.message_id.clone()));
        }
        self.state.next_email_id += 1;
        let email = Email {
            id: self.state.next_email_id,
            mailinglist: new.mailinglist.clone(),
            message_id: new.message_id.clone(),
            message_id_hash: new.message_id_hash.clone(),
            sender_address: new.sender_address.clone(),
            sender_name: new.sender_name.clone(),
            subject: new.subject.clone(),
            content: new.content.clone(),
            date: new.date,
            timezone: new.timezone,
            in_reply_to: new.in_reply_to.clone(),
            archived_date: Utc::now(),
            thread_id: new.thread_id,
            parent_id: new.parent_id,
            thread_depth: 0,
            thread_order: 0,
        };
        self.state.emails.insert(email.id, email.clone());
        Ok(email)
    }

    async fn email(&mut self, id: i32) -> StoreResult<Option<Email>> {
        Ok(self.state.emails.get(&id).cloned())
    }

    async fn email_by_message_id(
        &mut self,
        mailinglist: &str,
        message_id: &str,
    ) -> StoreResult<Option<Email>> {
        Ok(self
            .state
            .emails
            .values()
            .find(|e| e.mailinglist == mailinglist && e.message_id == message_id)
            .cloned())
    }

    async fn email_by_hash(
        &mut self,
        mailinglist: &str,
        hash: &str,
    ) -> StoreResult<Option<Email>> {
        Ok(self
            .state
            .emails
            .values()
            .find(|e| e.mailinglist == mailinglist && e.message_id_hash == hash)
            .cloned())
    }

    async fn set_parent(&mut self, email_id: i32, parent_id: Option<i32>) -> StoreResult<()> {
        match self.state.emails.get_mut(&email_id) {
            Some(email) => {
                email.parent_id = parent_id;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("email {}", email_id))),
        }
    }

    async fn move_emails_to_thread(
        &mut self,
        from_thread: i32,
        to_thread: i32,
    ) -> StoreResult<u64> {
        let mut moved = 0;
        for email in self.state.emails.values_mut() {
            if email.thread_id == from_thread {
                email.thread_id = to_thread;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn thread_emails(&mut self, thread_id: i32) -> StoreResult<Vec<Email>> {
        let mut emails: Vec<Email> = self
            .state
            .emails
            .values()
            .filter(|e| e.thread_id == thread_id)
            .cloned()
            .collect();
        emails.sort_by_key(|e| (e.thread_order, e.id));
        Ok(emails)
    }

    async fn children(&mut self, email_id: i32) -> StoreResult<Vec<Email>> {
        Ok(sorted_by_date(
            self.state
                .emails
                .values()
                .filter(|e| e.parent_id == Some(email_id))
                .cloned()
                .collect(),
        ))
    }

    async fn orphans_replying_to(
        &mut self,
        mailinglist: &str,
        message_id: &str,
    ) -> StoreResult<Vec<Email>> {
        Ok(sorted_by_date(
            self.state
                .emails
                .values()
                .filter(|e| {
                    e.mailinglist == mailinglist
                        && e.parent_id.is_none()
                        && e.in_reply_to.as_deref() == Some(message_id)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn update_thread_positions(&mut self, positions: &[ThreadPosition]) -> StoreResult<()> {
        for position in positions {
            let email = self
                .state
                .emails
                .get_mut(&position.email_id)
                .ok_or_else(|| StoreError::NotFound(format!("email {}", position.email_id)))?;
            email.parent_id = position.parent_id;
            email.thread_depth = position.thread_depth;
            email.thread_order = position.thread_order;
        }
        Ok(())
    }

    async fn delete_email(&mut self, id: i32) -> StoreResult<()> {
        if !self.state.emails.contains_key(&id) {
            return Err(StoreError::NotFound(format!("email {}", id)));
        }
        self.state.remove_email(id);
        Ok(())
    }

    async fn latest_email_date(
        &mut self,
        mailinglist: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .emails
            .values()
            .filter(|e| e.mailinglist == mailinglist)
            .map(|e| e.date)
            .max())
    }

    async fn count_emails(&mut self, mailinglist: &str) -> StoreResult<i64> {
        Ok(self
            .state
            .emails
            .values()
            .filter(|e| e.mailinglist == mailinglist)
            .count() as i64)
    }

    async fn emails_for_export(
        &mut self,
        mailinglist: &str,
        filter: &EmailFilter,
    ) -> StoreResult<Vec<Email>> {
        let threads = &self.state.threads;
        Ok(sorted_by_date(
            self.state
                .emails
                .values()
                .filter(|e| e.mailinglist == mailinglist)
                .filter(|e| filter.matches(e, threads.get(&e.thread_id)))
                .cloned()
                .collect(),
        ))
    }

    async fn insert_attachment(&mut self, new: &NewAttachment) -> StoreResult<Attachment> {
        let taken = self
            .state
            .attachments
            .values()
            .any(|a| a.email_id == new.email_id && a.counter == new.counter);
        if taken {
            return Err(StoreError::Conflict(format!(
                "attachment {} of email {} already exists",
                new.counter, new.email_id
            )));
        }
        self.state.next_attachment_id += 1;
        let attachment = Attachment {
            id: self.state.next_attachment_id,
            email_id: new.email_id,
            counter: new.counter,
            name: new.name.clone(),
            content_type: new.content_type.clone(),
            encoding: new.encoding.clone(),
            size: new.size,
            content: new.content.clone(),
        };
        self.state
            .attachments
            .insert(attachment.id, attachment.clone());
        Ok(attachment)
    }

    async fn attachments_for_email(&mut self, email_id: i32) -> StoreResult<Vec<Attachment>> {
        let mut attachments: Vec<Attachment> = self
            .state
            .attachments
            .values()
            .filter(|a| a.email_id == email_id)
            .cloned()
            .collect();
        attachments.sort_by_key(|a| a.counter);
        Ok(attachments)
    }

    async fn attachment(
        &mut self,
        email_id: i32,
        counter: i16,
    ) -> StoreResult<Option<Attachment>> {
        Ok(self
            .state
            .attachments
            .values()
            .find(|a| a.email_id == email_id && a.counter == counter)
            .cloned())
    }

    async fn inline_attachments(
        &mut self,
        after_id: i32,
        limit: i64,
    ) -> StoreResult<Vec<Attachment>> {
        Ok(self
            .state
            .attachments
            .range(after_id + 1..)
            .map(|(_, a)| a)
            .filter(|a| a.content.is_some())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn clear_attachment_content(&mut self, id: i32) -> StoreResult<()> {
        match self.state.attachments.get_mut(&id) {
            Some(attachment) => {
                attachment.content = None;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("attachment {}", id))),
        }
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryArchive {
            shared,
            base_version,
            mut state,
        } = *self;
        let mut current = shared.lock();
        if current.version != base_version {
            return Err(StoreError::Conflict(format!(
                "archive changed since version {}",
                base_version
            )));
        }
        state.version = base_version + 1;
        *current = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_email(list: &str, message_id: &str, thread_id: i32) -> NewEmail {
        NewEmail {
            mailinglist: list.to_string(),
            message_id: message_id.to_string(),
            message_id_hash: message_id.to_uppercase(),
            sender_address: "dev@example.com".to_string(),
            sender_name: "Dev".to_string(),
            subject: "subject".to_string(),
            content: "body".to_string(),
            date: Utc::now(),
            timezone: 0,
            in_reply_to: None,
            thread_id,
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn uncommitted_changes_are_discarded() {
        let backend = MemoryBackend::new();
        {
            let mut tx = backend.begin().await.unwrap();
            tx.lock_mailing_list("list@example.com").await.unwrap();
        }
        let mut tx = backend.begin().await.unwrap();
        assert!(tx.mailing_list("list@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_commit_conflicts() {
        let backend = MemoryBackend::new();
        let mut first = backend.begin().await.unwrap();
        let mut second = backend.begin().await.unwrap();
        first.lock_mailing_list("a@example.com").await.unwrap();
        second.lock_mailing_list("b@example.com").await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.lock_mailing_list("list@example.com").await.unwrap();
        let thread = tx
            .insert_thread("list@example.com", "KEY", Utc::now())
            .await
            .unwrap();
        tx.insert_email(&new_email("list@example.com", "a@x", thread.id))
            .await
            .unwrap();
        let err = tx
            .insert_email(&new_email("list@example.com", "a@x", thread.id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "a@x"));
    }

    #[tokio::test]
    async fn deleting_thread_cascades_to_emails_and_attachments() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.lock_mailing_list("list@example.com").await.unwrap();
        let thread = tx
            .insert_thread("list@example.com", "KEY", Utc::now())
            .await
            .unwrap();
        let email = tx
            .insert_email(&new_email("list@example.com", "a@x", thread.id))
            .await
            .unwrap();
        tx.insert_attachment(&NewAttachment {
            email_id: email.id,
            counter: 2,
            name: "a.txt".into(),
            content_type: "text/plain".into(),
            encoding: Some("utf-8".into()),
            size: 2,
            content: Some(b"hi".to_vec()),
        })
        .await
        .unwrap();

        tx.delete_thread(thread.id).await.unwrap();
        assert!(tx.email(email.id).await.unwrap().is_none());
        assert!(tx.attachment(email.id, 2).await.unwrap().is_none());
        assert!(tx.thread(thread.id).await.unwrap().is_none());
    }
}
