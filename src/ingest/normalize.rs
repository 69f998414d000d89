//! Message parsing and repair.
//!
//! Turns a raw RFC 5322 message (optionally preceded by an mbox envelope
//! `From ` line) into the fields the archive stores: a repaired Message-ID and
//! its hash, the resolved date with its original UTC offset, the unwrapped
//! subject, the sender, and the references used for threading.
//!
//! Only a missing sender or an unparseable MIME structure rejects a message.
//! Every other defect is repaired or left absent for the pipeline to default.

use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use regex::Regex;

use super::error::{IngestError, IngestResult};
use super::identity::{
    message_id_hash, repair_message_id, storage_message_id, synthesize_message_id,
};

static TEXTWRAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\n|\r|\r\n|\n\r)\s*").expect("valid regex"));
static IN_BRACKETS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("valid regex"));
static TRAILING_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*$").expect("valid regex"));

/// A message after repair, ready for deduplication and threading.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    /// Stored form: no angle brackets, at most 254 characters.
    pub message_id: String,
    pub message_id_hash: String,
    /// Whether the Message-ID was synthesized.
    pub generated_id: bool,
    pub subject: String,
    pub sender_address: String,
    /// Decoded display name, empty when the From header has none.
    pub sender_name: String,
    pub date: Option<DateTime<Utc>>,
    /// UTC offset of the original date, in minutes.
    pub timezone: i16,
    pub in_reply_to: Option<String>,
    /// References, oldest first, in stored form.
    pub references: Vec<String>,
}

impl NormalizedMessage {
    /// Remove the first occurrence of the list's subject prefix.
    pub fn strip_subject_prefix(&mut self, prefix: &str) {
        if prefix.is_empty() {
            return;
        }
        self.subject = self.subject.replacen(prefix, "", 1).trim().to_string();
    }

    /// Display name, or the address when the sender gave none.
    pub fn display_sender(&self) -> &str {
        if self.sender_name.is_empty() {
            &self.sender_address
        } else {
            &self.sender_name
        }
    }
}

/// Separate a leading mbox envelope line from the message itself.
pub fn split_envelope(raw: &[u8]) -> (Option<String>, &[u8]) {
    if !raw.starts_with(b"From ") {
        return (None, raw);
    }
    match raw.iter().position(|&b| b == b'\n') {
        Some(end) => {
            let line = String::from_utf8_lossy(&raw[..end]).trim_end().to_string();
            (Some(line), &raw[end + 1..])
        }
        None => (Some(String::from_utf8_lossy(raw).trim_end().to_string()), &[]),
    }
}

/// Parse the MIME structure of a message body.
pub fn parse(raw: &[u8]) -> IngestResult<ParsedMail<'_>> {
    mailparse::parse_mail(raw).map_err(|e| {
        log::debug!("failed to parse MIME: {}", e);
        IngestError::malformed("n/a", format!("failed to parse MIME structure: {}", e))
    })
}

/// Sanitize text by removing NUL bytes that PostgreSQL cannot store
pub(crate) fn sanitize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

/// Collapse every line break and the whitespace after it into one space.
pub fn unwrap_subject(subject: &str) -> String {
    sanitize_text(&TEXTWRAP_RE.replace_all(subject, " "))
}

/// A referenced id repaired the same way as a Message-ID, in stored form.
fn normalize_reference(raw: &str) -> Option<String> {
    repair_message_id(&sanitize_text(raw)).map(|id| storage_message_id(&id))
}

/// Bracketed ids in a header value, in stored form. Headers without any
/// brackets fall back to whitespace-separated tokens.
fn extract_message_ids(header_value: &str) -> Vec<String> {
    let bracketed: Vec<String> = IN_BRACKETS_RE
        .captures_iter(header_value)
        .filter_map(|caps| normalize_reference(&caps[1]))
        .collect();
    if !bracketed.is_empty() {
        return bracketed;
    }

    header_value
        .split_whitespace()
        .filter(|token| token.contains('@'))
        .filter_map(normalize_reference)
        .collect()
}

/// Parse a date header value, keeping its UTC offset when the value is RFC
/// 2822 compliant.
pub fn parse_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let cleaned = TRAILING_COMMENT_RE.replace(raw, "");
    if let Ok(date) = DateTime::parse_from_rfc2822(cleaned.trim()) {
        return Some(date);
    }
    // dateparse yields the epoch for input it cannot read at all.
    if raw.bytes().any(|b| b.is_ascii_digit()) {
        if let Ok(timestamp) = mailparse::dateparse(raw) {
            if timestamp != 0 {
                if let Some(date) = DateTime::from_timestamp(timestamp, 0) {
                    return Some(date.fixed_offset());
                }
            }
        }
    }
    dateparser::parse(&cleaned)
        .ok()
        .map(|date| date.fixed_offset())
}

/// Timestamp of an envelope line such as
/// `From sender@example.com Tue Jan  1 00:00:00 2019`.
pub fn parse_envelope_date(line: &str) -> Option<DateTime<FixedOffset>> {
    let rest: Vec<&str> = line.split_whitespace().skip(2).collect();
    if rest.is_empty() {
        return None;
    }
    let joined = rest.join(" ");

    for format in ["%a %b %d %H:%M:%S %Y", "%a %b %d %H:%M %Y"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&joined, format) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    parse_date(&joined)
}

fn offset_minutes(date: &DateTime<FixedOffset>) -> i16 {
    (date.offset().local_minus_utc() / 60) as i16
}

/// Date of the message: `Date`, then `Resent-Date`, then the envelope.
fn resolve_date(
    parsed: &ParsedMail,
    envelope: Option<&str>,
    message_id: &str,
) -> Option<DateTime<FixedOffset>> {
    for header in ["Date", "Resent-Date"] {
        if let Some(raw) = parsed.headers.get_first_value(header) {
            match parse_date(&raw) {
                Some(date) => return Some(date),
                None => log::debug!("bad datetime in {} header of message {}", header, message_id),
            }
        }
    }
    envelope.and_then(parse_envelope_date)
}

/// First address of the From header: `(display name, lower-cased address)`.
fn parse_sender(from: &str) -> Option<(String, String)> {
    let addrs = mailparse::addrparse(from).ok()?;
    let info = addrs.iter().find_map(|addr| match addr {
        mailparse::MailAddr::Single(info) => Some(info.clone()),
        mailparse::MailAddr::Group(group) => group.addrs.first().cloned(),
    })?;

    let address = sanitize_text(&info.addr).to_lowercase();
    if address.is_empty() {
        return None;
    }
    let name = sanitize_text(&info.display_name.unwrap_or_default());
    Some((name, address))
}

/// Normalize a parsed message.
pub fn normalize(
    parsed: &ParsedMail,
    envelope: Option<&str>,
    message_id_domain: &str,
) -> IngestResult<NormalizedMessage> {
    let (bracketed, generated_id) = match parsed
        .headers
        .get_first_value("Message-ID")
        .and_then(|raw| repair_message_id(&raw))
    {
        Some(id) => (id, false),
        None => {
            let id = synthesize_message_id(message_id_domain);
            log::debug!("message without usable Message-ID, generated {}", id);
            (id, true)
        }
    };
    let message_id = storage_message_id(&bracketed);
    let message_id_hash = message_id_hash(&message_id);

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| unwrap_subject(&s))
        .unwrap_or_default();

    let from = parsed.headers.get_first_value("From").unwrap_or_default();
    let (sender_name, sender_address) = parse_sender(&from).ok_or_else(|| {
        log::warn!("email {} ({}) missing sender address", message_id, subject);
        IngestError::malformed(&message_id, "missing sender address")
    })?;

    let date = resolve_date(parsed, envelope, &message_id);
    let timezone = date.as_ref().map(offset_minutes).unwrap_or(0);
    let date = date.map(|d| d.with_timezone(&Utc));

    let references = parsed
        .headers
        .get_first_value("References")
        .map(|v| extract_message_ids(&v))
        .unwrap_or_default();

    let in_reply_to = parsed
        .headers
        .get_first_value("In-Reply-To")
        .and_then(|v| extract_message_ids(&v).into_iter().next())
        .or_else(|| references.last().cloned());

    log::trace!("normalized: {} - {}", message_id, subject);

    Ok(NormalizedMessage {
        message_id,
        message_id_hash,
        generated_id,
        subject,
        sender_address,
        sender_name,
        date,
        timezone,
        in_reply_to,
        references,
    })
}
