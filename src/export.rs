//! Gzip-compressed mbox export of archived messages.
//!
//! Each message is rebuilt from the stored fields: envelope line, the
//! identifying headers (Date in the sender's original offset), the body, and
//! the attachments as base64 parts of a `multipart/mixed` container.

use std::io::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{FixedOffset, Offset, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;

use crate::attachments::{read_content, AttachmentError, AttachmentKey};
use crate::import::mbox::{envelope_line, escape_from_lines};
use crate::ingest::Archiver;
use crate::models::{Attachment, Email};
use crate::store::{EmailFilter, StoreError};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Attachments(#[from] AttachmentError),
}

/// Header value, RFC 2047 encoded when it is not plain ASCII.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?b?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

fn wrap_base64(content: &[u8]) -> String {
    let encoded = STANDARD.encode(content);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / 76 + 1);
    for chunk in encoded.as_bytes().chunks(76) {
        wrapped.push_str(&String::from_utf8_lossy(chunk));
        wrapped.push('\n');
    }
    wrapped
}

fn quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Rebuild one message, envelope line included.
pub fn render_message(email: &Email, attachments: &[(Attachment, Vec<u8>)]) -> String {
    let mut out = String::new();
    out.push_str(&envelope_line(&email.sender_address, email.date));
    out.push('\n');

    let offset = FixedOffset::east_opt(i32::from(email.timezone) * 60)
        .unwrap_or_else(|| Utc.fix());
    let sender = if email.sender_name.is_empty() || email.sender_name == email.sender_address {
        email.sender_address.clone()
    } else {
        format!("{} <{}>", encode_header(&email.sender_name), email.sender_address)
    };

    out.push_str(&format!("Message-ID: <{}>\n", email.message_id));
    out.push_str(&format!("From: {}\n", sender));
    out.push_str(&format!("Subject: {}\n", encode_header(&email.subject)));
    out.push_str(&format!("Date: {}\n", email.date.with_timezone(&offset).to_rfc2822()));
    if let Some(parent) = &email.in_reply_to {
        out.push_str(&format!("In-Reply-To: <{}>\n", parent));
    }
    out.push_str("MIME-Version: 1.0\n");

    let body = escape_from_lines(&email.content);
    if attachments.is_empty() {
        out.push_str("Content-Type: text/plain; charset=\"utf-8\"\n");
        out.push_str("Content-Transfer-Encoding: 8bit\n\n");
        out.push_str(&body);
        out.push_str("\n\n");
        return out;
    }

    let boundary = format!("==============={}==", email.message_id_hash);
    out.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{}\"\n\n",
        boundary
    ));
    out.push_str(&format!("--{}\n", boundary));
    out.push_str("Content-Type: text/plain; charset=\"utf-8\"\n");
    out.push_str("Content-Transfer-Encoding: 8bit\n\n");
    out.push_str(&body);
    out.push('\n');

    for (attachment, content) in attachments {
        let name = quoted(&encode_header(&attachment.name));
        out.push_str(&format!("--{}\n", boundary));
        match &attachment.encoding {
            Some(charset) => out.push_str(&format!(
                "Content-Type: {}; charset=\"{}\"; name=\"{}\"\n",
                attachment.content_type, charset, name
            )),
            None => out.push_str(&format!(
                "Content-Type: {}; name=\"{}\"\n",
                attachment.content_type, name
            )),
        }
        out.push_str(&format!("Content-Disposition: attachment; filename=\"{}\"\n", name));
        out.push_str("Content-Transfer-Encoding: base64\n\n");
        out.push_str(&wrap_base64(content));
    }
    out.push_str(&format!("--{}--\n\n", boundary));
    out
}

/// Suggested file name for an export.
pub fn export_filename(list_name: &str, filter: &EmailFilter) -> String {
    let local_part = list_name.split('@').next().unwrap_or(list_name);
    let mut name = local_part.to_string();
    if let Some(start) = filter.start {
        name.push_str(&format!("-{}", start.format("%Y-%m-%d")));
    }
    if let Some(end) = filter.end {
        name.push_str(&format!("-{}", end.format("%Y-%m-%d")));
    }
    if let Some(thread_key) = &filter.thread_key {
        name.push_str(&format!("-{}", thread_key));
    }
    name.push_str(".mbox.gz");
    name
}

/// Write the matching messages of a list as a gzip-compressed mbox.
/// Returns the number of exported messages.
pub async fn export_mbox<W: Write>(
    archiver: &Archiver,
    list_name: &str,
    filter: &EmailFilter,
    out: W,
) -> Result<usize, ExportError> {
    let mut store = archiver.backend().begin().await?;
    let emails = store.emails_for_export(list_name, filter).await?;

    let mut encoder = GzEncoder::new(out, Compression::default());
    for email in &emails {
        let mut attachments = Vec::new();
        for attachment in store.attachments_for_email(email.id).await? {
            let key = AttachmentKey {
                mailinglist: email.mailinglist.clone(),
                message_id_hash: email.message_id_hash.clone(),
                email_id: email.id,
                counter: attachment.counter,
            };
            match read_content(
                archiver.attachment_storage(),
                &key,
                attachment.content.as_deref(),
            )? {
                Some(content) => attachments.push((attachment, content)),
                None => log::warn!(
                    "attachment {} of {} has no content, leaving it out",
                    attachment.counter,
                    email.message_id
                ),
            }
        }
        encoder.write_all(render_message(email, &attachments).as_bytes())?;
    }
    encoder.finish()?;
    store.commit().await?;

    log::info!("exported {} messages from {}", emails.len(), list_name);
    Ok(emails.len())
}
