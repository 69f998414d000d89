//! Postgres archive backend.
//!
//! Writers of the same list are serialized by locking the `mailing_lists`
//! row `FOR UPDATE` at the start of each ingestion transaction.

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool, Postgres, Transaction};

use super::{ArchiveBackend, ArchiveStore, EmailFilter, StoreError, StoreResult};
use crate::models::{
    Attachment, Email, MailingList, NewAttachment, NewEmail, Sender, Thread, ThreadPosition,
};

const EMAIL_COLUMNS: &str = "id, mailinglist, message_id, message_id_hash, sender_address, \
     sender_name, subject, content, date, timezone, in_reply_to, archived_date, thread_id, \
     parent_id, thread_depth, thread_order";

const ATTACHMENT_COLUMNS: &str =
    "id, email_id, counter, name, content_type, encoding, size, content";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}

#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[rocket::async_trait]
impl ArchiveBackend for PgBackend {
    async fn begin(&self) -> StoreResult<Box<dyn ArchiveStore>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgArchive { tx }))
    }
}

pub struct PgArchive {
    tx: Transaction<'static, Postgres>,
}

#[rocket::async_trait]
impl ArchiveStore for PgArchive {
    async fn lock_mailing_list(&mut self, name: &str) -> StoreResult<MailingList> {
        sqlx::query("INSERT INTO mailing_lists (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&mut *self.tx)
            .await?;

        let list = sqlx::query_as::<_, MailingList>(
            r#"SELECT name, display_name, description, subject_prefix, archive_policy, created_at
               FROM mailing_lists WHERE name = $1 FOR UPDATE"#,
        )
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(list)
    }

    async fn mailing_list(&mut self, name: &str) -> StoreResult<Option<MailingList>> {
        let list = sqlx::query_as::<_, MailingList>(
            r#"SELECT name, display_name, description, subject_prefix, archive_policy, created_at
               FROM mailing_lists WHERE name = $1"#,
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(list)
    }

    async fn update_mailing_list(&mut self, list: &MailingList) -> StoreResult<()> {
        sqlx::query(
            r#"UPDATE mailing_lists
               SET display_name = $2, description = $3, subject_prefix = $4, archive_policy = $5
               WHERE name = $1"#,
        )
        .bind(&list.name)
        .bind(&list.display_name)
        .bind(&list.description)
        .bind(&list.subject_prefix)
        .bind(list.archive_policy)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn sender(&mut self, address: &str) -> StoreResult<Option<Sender>> {
        let sender = sqlx::query_as::<_, Sender>(
            "SELECT address, name, mailman_id FROM senders WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(sender)
    }

    async fn upsert_sender(&mut self, address: &str, name: &str) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO senders (address, name) VALUES ($1, $2)
               ON CONFLICT (address) DO UPDATE
               SET name = CASE WHEN EXCLUDED.name = '' THEN senders.name ELSE EXCLUDED.name END"#,
        )
        .bind(address)
        .bind(name)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_thread(
        &mut self,
        mailinglist: &str,
        thread_key: &str,
        date_active: DateTime<Utc>,
    ) -> StoreResult<Thread> {
        let thread = sqlx::query_as::<_, Thread>(
            r#"INSERT INTO threads (mailinglist, thread_id, date_active)
               VALUES ($1, $2, $3)
               RETURNING id, mailinglist, thread_id, date_active, starting_email_id"#,
        )
        .bind(mailinglist)
        .bind(thread_key)
        .bind(date_active)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(format!(
                    "thread {} already exists in {}",
                    thread_key, mailinglist
                ))
            } else {
                StoreError::from(err)
            }
        })?;
        Ok(thread)
    }

    async fn thread(&mut self, id: i32) -> StoreResult<Option<Thread>> {
        let thread = sqlx::query_as::<_, Thread>(
            "SELECT id, mailinglist, thread_id, date_active, starting_email_id FROM threads WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(thread)
    }

    async fn thread_by_key(
        &mut self,
        mailinglist: &str,
        key: &str,
    ) -> StoreResult<Option<Thread>> {
        let thread = sqlx::query_as::<_, Thread>(
            r#"SELECT id, mailinglist, thread_id, date_active, starting_email_id
               FROM threads WHERE mailinglist = $1 AND thread_id = $2"#,
        )
        .bind(mailinglist)
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(thread)
    }

    async fn update_thread(&mut self, thread: &Thread) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE threads SET date_active = $2, starting_email_id = $3 WHERE id = $1",
        )
        .bind(thread.id)
        .bind(thread.date_active)
        .bind(thread.starting_email_id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("thread {}", thread.id)));
        }
        Ok(())
    }

    async fn delete_thread(&mut self, id: i32) -> StoreResult<()> {
        // emails and attachments cascade
        sqlx::query("DELETE FROM threads WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_email(&mut self, email: &NewEmail) -> StoreResult<Email> {
        let sql = format!(
            r#"INSERT INTO emails (
                   mailinglist, message_id, message_id_hash, sender_address, sender_name,
                   subject, content, date, timezone, in_reply_to, thread_id, parent_id
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               RETURNING {}"#,
            EMAIL_COLUMNS
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(&email.mailinglist)
            .bind(&email.message_id)
            .bind(&email.message_id_hash)
            .bind(&email.sender_address)
            .bind(&email.sender_name)
            .bind(&email.subject)
            .bind(&email.content)
            .bind(email.date)
            .bind(email.timezone)
            .bind(&email.in_reply_to)
            .bind(email.thread_id)
            .bind(email.parent_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::Duplicate(email.message_id.clone())
                } else {
                    StoreError::from(err)
                }
            })
    }

    async fn email(&mut self, id: i32) -> StoreResult<Option<Email>> {
        let sql = format!("SELECT {} FROM emails WHERE id = $1", EMAIL_COLUMNS);
        let email = sqlx::query_as::<_, Email>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(email)
    }

    async fn email_by_message_id(
        &mut self,
        mailinglist: &str,
        message_id: &str,
    ) -> StoreResult<Option<Email>> {
        let sql = format!(
            "SELECT {} FROM emails WHERE mailinglist = $1 AND message_id = $2",
            EMAIL_COLUMNS
        );
        let email = sqlx::query_as::<_, Email>(&sql)
            .bind(mailinglist)
            .bind(message_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(email)
    }

    async fn email_by_hash(
        &mut self,
        mailinglist: &str,
        hash: &str,
    ) -> StoreResult<Option<Email>> {
        let sql = format!(
            "SELECT {} FROM emails WHERE mailinglist = $1 AND message_id_hash = $2",
            EMAIL_COLUMNS
        );
        let email = sqlx::query_as::<_, Email>(&sql)
            .bind(mailinglist)
            .bind(hash)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(email)
    }

    async fn set_parent(&mut self, email_id: i32, parent_id: Option<i32>) -> StoreResult<()> {
        sqlx::query("UPDATE emails SET parent_id = $2 WHERE id = $1")
            .bind(email_id)
            .bind(parent_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn move_emails_to_thread(
        &mut self,
        from_thread: i32,
        to_thread: i32,
    ) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE emails SET thread_id = $2 WHERE thread_id = $1")
            .bind(from_thread)
            .bind(to_thread)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn thread_emails(&mut self, thread_id: i32) -> StoreResult<Vec<Email>> {
        let sql = format!(
            "SELECT {} FROM emails WHERE thread_id = $1 ORDER BY thread_order, id",
            EMAIL_COLUMNS
        );
        let emails = sqlx::query_as::<_, Email>(&sql)
            .bind(thread_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(emails)
    }

    async fn children(&mut self, email_id: i32) -> StoreResult<Vec<Email>> {
        let sql = format!(
            "SELECT {} FROM emails WHERE parent_id = $1 ORDER BY date, message_id",
            EMAIL_COLUMNS
        );
        let emails = sqlx::query_as::<_, Email>(&sql)
            .bind(email_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(emails)
    }

    async fn orphans_replying_to(
        &mut self,
        mailinglist: &str,
        message_id: &str,
    ) -> StoreResult<Vec<Email>> {
        let sql = format!(
            r#"SELECT {} FROM emails
               WHERE mailinglist = $1 AND in_reply_to = $2 AND parent_id IS NULL
               ORDER BY date, message_id"#,
            EMAIL_COLUMNS
        );
        let emails = sqlx::query_as::<_, Email>(&sql)
            .bind(mailinglist)
            .bind(message_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(emails)
    }

    async fn update_thread_positions(&mut self, positions: &[ThreadPosition]) -> StoreResult<()> {
        if positions.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(positions.len());
        let mut parents = Vec::with_capacity(positions.len());
        let mut depths = Vec::with_capacity(positions.len());
        let mut orders = Vec::with_capacity(positions.len());
        for position in positions {
            ids.push(position.email_id);
            parents.push(position.parent_id);
            depths.push(position.thread_depth);
            orders.push(position.thread_order);
        }

        sqlx::query(
            r#"UPDATE emails AS e
               SET parent_id = t.parent_id, thread_depth = t.depth, thread_order = t.ord
               FROM UNNEST($1::int[], $2::int[], $3::int[], $4::int[])
                    AS t(id, parent_id, depth, ord)
               WHERE e.id = t.id"#,
        )
        .bind(&ids)
        .bind(&parents)
        .bind(&depths)
        .bind(&orders)
        .execute(&mut *self.tx)
        .await?;

        log::trace!("updated {} thread positions", positions.len());
        Ok(())
    }

    async fn delete_email(&mut self, id: i32) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM emails WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("email {}", id)));
        }
        Ok(())
    }

    async fn latest_email_date(
        &mut self,
        mailinglist: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(date) FROM emails WHERE mailinglist = $1")
                .bind(mailinglist)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(latest)
    }

    async fn count_emails(&mut self, mailinglist: &str) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails WHERE mailinglist = $1")
            .bind(mailinglist)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count)
    }

    async fn emails_for_export(
        &mut self,
        mailinglist: &str,
        filter: &EmailFilter,
    ) -> StoreResult<Vec<Email>> {
        let sql = format!(
            r#"SELECT {} FROM emails e
               WHERE e.mailinglist = $1
                 AND ($2::timestamptz IS NULL OR e.date >= $2)
                 AND ($3::timestamptz IS NULL OR e.date < $3)
                 AND ($4::text IS NULL OR e.thread_id =
                      (SELECT t.id FROM threads t WHERE t.mailinglist = $1 AND t.thread_id = $4))
                 AND (cardinality($5::text[]) = 0 OR e.message_id_hash = ANY($5))
               ORDER BY e.date, e.message_id"#,
            EMAIL_COLUMNS
                .split(", ")
                .map(|column| format!("e.{}", column.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let emails = sqlx::query_as::<_, Email>(&sql)
            .bind(mailinglist)
            .bind(filter.start)
            .bind(filter.end)
            .bind(&filter.thread_key)
            .bind(&filter.message_id_hashes)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(emails)
    }

    async fn insert_attachment(&mut self, attachment: &NewAttachment) -> StoreResult<Attachment> {
        let sql = format!(
            r#"INSERT INTO attachments (email_id, counter, name, content_type, encoding, size, content)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING {}"#,
            ATTACHMENT_COLUMNS
        );
        let stored = sqlx::query_as::<_, Attachment>(&sql)
            .bind(attachment.email_id)
            .bind(attachment.counter)
            .bind(&attachment.name)
            .bind(&attachment.content_type)
            .bind(&attachment.encoding)
            .bind(attachment.size)
            .bind(&attachment.content)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(stored)
    }

    async fn attachments_for_email(&mut self, email_id: i32) -> StoreResult<Vec<Attachment>> {
        let sql = format!(
            "SELECT {} FROM attachments WHERE email_id = $1 ORDER BY counter",
            ATTACHMENT_COLUMNS
        );
        let attachments = sqlx::query_as::<_, Attachment>(&sql)
            .bind(email_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(attachments)
    }

    async fn attachment(
        &mut self,
        email_id: i32,
        counter: i16,
    ) -> StoreResult<Option<Attachment>> {
        let sql = format!(
            "SELECT {} FROM attachments WHERE email_id = $1 AND counter = $2",
            ATTACHMENT_COLUMNS
        );
        let attachment = sqlx::query_as::<_, Attachment>(&sql)
            .bind(email_id)
            .bind(counter)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(attachment)
    }

    async fn inline_attachments(
        &mut self,
        after_id: i32,
        limit: i64,
    ) -> StoreResult<Vec<Attachment>> {
        let sql = format!(
            r#"SELECT {} FROM attachments
               WHERE id > $1 AND content IS NOT NULL
               ORDER BY id LIMIT $2"#,
            ATTACHMENT_COLUMNS
        );
        let attachments = sqlx::query_as::<_, Attachment>(&sql)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(attachments)
    }

    async fn clear_attachment_content(&mut self, id: i32) -> StoreResult<()> {
        sqlx::query("UPDATE attachments SET content = NULL WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
