//! Body and attachment extraction.
//!
//! MIME leaves are walked depth-first. The first inline `text/plain` leaf is
//! the body; without one, the first inline `text/html` leaf is rendered to
//! text instead. An HTML alternative of the chosen plain body is dropped.
//! Every other leaf becomes an attachment, numbered from the counter base.

use mailparse::body::Body;
use mailparse::{DispositionType, ParsedMail};

use super::normalize::sanitize_text;

/// Attachment extracted from a message, before storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedAttachment {
    pub counter: i16,
    pub name: String,
    pub content_type: String,
    /// Charset of textual parts.
    pub encoding: Option<String>,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ScrubbedMessage {
    pub body: String,
    pub attachments: Vec<ExtractedAttachment>,
}

struct Leaf<'a, 'b> {
    part: &'b ParsedMail<'a>,
    /// Index of the enclosing `multipart/alternative`, if any.
    alternative_group: Option<usize>,
}

fn collect_leaves<'a, 'b>(root: &'b ParsedMail<'a>) -> Vec<Leaf<'a, 'b>> {
    let mut leaves = Vec::new();
    let mut group_counter = 0usize;
    // Stack for iterative depth-first walk: (part, enclosing alternative group)
    let mut stack = vec![(root, None)];

    while let Some((part, group)) = stack.pop() {
        if part.subparts.is_empty() {
            leaves.push(Leaf {
                part,
                alternative_group: group,
            });
            continue;
        }

        let child_group = if part.ctype.mimetype.eq_ignore_ascii_case("multipart/alternative") {
            group_counter += 1;
            Some(group_counter)
        } else {
            group
        };
        // Add children in reverse order to maintain DFS left-to-right order
        for child in part.subparts.iter().rev() {
            stack.push((child, child_group));
        }
    }

    leaves
}

fn is_attachment(part: &ParsedMail) -> bool {
    let disposition = part.get_content_disposition();
    matches!(disposition.disposition, DispositionType::Attachment)
        || disposition.params.contains_key("filename")
}

fn mimetype(part: &ParsedMail) -> String {
    part.ctype.mimetype.to_ascii_lowercase()
}

/// Transfer-decoded bytes, or the raw encoded bytes when decoding fails.
fn part_bytes(part: &ParsedMail) -> Vec<u8> {
    match part.get_body_raw() {
        Ok(bytes) => bytes,
        Err(err) => {
            log::warn!(
                "undecodable {} part, keeping raw bytes: {}",
                part.ctype.mimetype,
                err
            );
            match part.get_body_encoded() {
                Body::Base64(body) | Body::QuotedPrintable(body) => body.get_raw().to_vec(),
                Body::SevenBit(body) | Body::EightBit(body) => body.get_raw().to_vec(),
                Body::Binary(body) => body.get_raw().to_vec(),
            }
        }
    }
}

fn part_text(part: &ParsedMail) -> String {
    match part.get_body() {
        Ok(text) => text,
        Err(err) => {
            log::debug!("falling back to lossy decoding of text part: {}", err);
            String::from_utf8_lossy(&part_bytes(part)).into_owned()
        }
    }
}

fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), 80) {
        Ok(text) => text,
        Err(err) => {
            log::warn!("failed to render html body, keeping markup: {}", err);
            html.to_string()
        }
    }
}

/// Decode RFC 2047 encoded words by running the value through the header
/// decoder.
fn decode_encoded_words(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }
    match mailparse::parse_header(format!("X-Name: {}", value).as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => value.to_string(),
    }
}

fn extension_for(mimetype: &str) -> &'static str {
    match mimetype {
        "text/plain" => "txt",
        "text/html" => "html",
        "text/x-diff" | "text/x-patch" => "patch",
        "message/rfc822" => "eml",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/pgp-signature" => "sig",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Display name of an attachment, without path components.
fn attachment_name(part: &ParsedMail, mimetype: &str) -> String {
    let disposition = part.get_content_disposition();
    let raw = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .map(|name| decode_encoded_words(name))
        .unwrap_or_default();

    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .map(sanitize_text)
        .unwrap_or_default();

    if base.is_empty() {
        format!("attachment.{}", extension_for(mimetype))
    } else {
        base
    }
}

/// Split a message into its body text and attachments.
pub fn scrub(parsed: &ParsedMail, counter_base: usize) -> ScrubbedMessage {
    let leaves = collect_leaves(parsed);

    let inline_of = |wanted: &str| {
        leaves
            .iter()
            .position(|leaf| mimetype(leaf.part) == wanted && !is_attachment(leaf.part))
    };

    let (body_index, body) = match inline_of("text/plain") {
        Some(index) => (Some(index), part_text(leaves[index].part)),
        None => match inline_of("text/html") {
            Some(index) => (Some(index), html_to_text(&part_text(leaves[index].part))),
            None => (None, String::new()),
        },
    };

    let dropped_group = body_index.and_then(|index| leaves[index].alternative_group);

    let mut attachments = Vec::new();
    for (index, leaf) in leaves.iter().enumerate() {
        if Some(index) == body_index {
            continue;
        }
        let mime = mimetype(leaf.part);
        if mime == "text/html"
            && dropped_group.is_some_and(|group| leaf.alternative_group == Some(group))
            && !is_attachment(leaf.part)
        {
            log::trace!("dropping html alternative of the message body");
            continue;
        }

        let counter = counter_base + attachments.len();
        let encoding = if mime.starts_with("text/") {
            Some(leaf.part.ctype.charset.to_lowercase())
        } else {
            None
        };
        attachments.push(ExtractedAttachment {
            counter: i16::try_from(counter).unwrap_or(i16::MAX),
            name: attachment_name(leaf.part, &mime),
            content_type: mime,
            encoding,
            content: part_bytes(leaf.part),
        });
    }

    ScrubbedMessage {
        body: sanitize_text(&body),
        attachments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrub_raw(raw: &str) -> ScrubbedMessage {
        let parsed = mailparse::parse_mail(raw.as_bytes()).unwrap();
        scrub(&parsed, 2)
    }

    #[test]
    fn single_part_message_has_no_attachments() {
        let scrubbed = scrub_raw("Content-Type: text/plain\r\n\r\nHello\r\n");
        assert_eq!(scrubbed.body, "Hello");
        assert!(scrubbed.attachments.is_empty());
    }

    #[test]
    fn attachments_are_numbered_from_base() {
        let scrubbed = scrub_raw(concat!(
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Body text\r\n",
            "--b\r\n",
            "Content-Type: text/x-diff; charset=us-ascii; name=\"fix.patch\"\r\n",
            "Content-Disposition: attachment; filename=\"../../fix.patch\"\r\n",
            "\r\n",
            "--- a\r\n",
            "--b\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "Content-Disposition: attachment\r\n",
            "\r\n",
            "AAEC\r\n",
            "--b--\r\n"
        ));

        assert_eq!(scrubbed.body, "Body text");
        assert_eq!(scrubbed.attachments.len(), 2);

        let patch = &scrubbed.attachments[0];
        assert_eq!(patch.counter, 2);
        assert_eq!(patch.name, "fix.patch");
        assert_eq!(patch.content_type, "text/x-diff");
        assert_eq!(patch.encoding.as_deref(), Some("us-ascii"));

        let binary = &scrubbed.attachments[1];
        assert_eq!(binary.counter, 3);
        assert_eq!(binary.name, "attachment.bin");
        assert_eq!(binary.content, vec![0u8, 1, 2]);
        assert_eq!(binary.encoding, None);
    }

    #[test]
    fn html_alternative_of_plain_body_is_dropped() {
        let scrubbed = scrub_raw(concat!(
            "Content-Type: multipart/alternative; boundary=\"alt\"\r\n",
            "\r\n",
            "--alt\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Plain version\r\n",
            "--alt\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>HTML version</p>\r\n",
            "--alt--\r\n"
        ));
        assert_eq!(scrubbed.body, "Plain version");
        assert!(scrubbed.attachments.is_empty());
    }

    #[test]
    fn html_only_message_is_rendered_to_text() {
        let scrubbed = scrub_raw(concat!(
            "Content-Type: text/html\r\n",
            "\r\n",
            "<html><body><p>Hello <b>world</b></p></body></html>\r\n"
        ));
        assert!(scrubbed.body.contains("Hello"));
        assert!(scrubbed.body.contains("world"));
        assert!(!scrubbed.body.contains("<p>"));
        assert!(scrubbed.attachments.is_empty());
    }

    #[test]
    fn encoded_attachment_names_are_decoded() {
        let scrubbed = scrub_raw(concat!(
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Body\r\n",
            "--b\r\n",
            "Content-Type: application/pdf; name=\"=?utf-8?q?r=C3=A9sum=C3=A9.pdf?=\"\r\n",
            "Content-Disposition: attachment\r\n",
            "\r\n",
            "pdf\r\n",
            "--b--\r\n"
        ));
        assert_eq!(scrubbed.attachments[0].name, "résumé.pdf");
    }

    #[test]
    fn undecodable_base64_keeps_raw_bytes() {
        let scrubbed = scrub_raw(concat!(
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Body\r\n",
            "--b\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "!!!not base64!!!\r\n",
            "--b--\r\n"
        ));
        assert_eq!(scrubbed.attachments.len(), 1);
        assert!(!scrubbed.attachments[0].content.is_empty());
    }
}
