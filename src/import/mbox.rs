//! Reading and writing the mbox container format.
//!
//! Messages are delimited by envelope lines starting with `From ` (a header
//! line reads `From:` and never matches). Content before the first envelope
//! is ignored. Body lines are not unescaped on read: a `>From ` line stays
//! as archived.

use chrono::{DateTime, Utc};

/// Iterator over the messages of an mbox, each starting with its envelope
/// line.
pub struct MboxMessages<'a> {
    data: &'a [u8],
    pos: usize,
}

pub fn messages(data: &[u8]) -> MboxMessages<'_> {
    let mut pos = 0;
    while pos < data.len() && !data[pos..].starts_with(b"From ") {
        match data[pos..].iter().position(|&b| b == b'\n') {
            Some(offset) => pos += offset + 1,
            None => pos = data.len(),
        }
    }
    if pos > 0 {
        log::debug!("ignoring {} bytes before the first envelope line", pos);
    }
    MboxMessages { data, pos }
}

impl<'a> Iterator for MboxMessages<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        let mut cursor = start;
        let end = loop {
            match self.data[cursor..].iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    cursor += offset + 1;
                    if self.data[cursor..].starts_with(b"From ") {
                        break cursor;
                    }
                }
                None => break self.data.len(),
            }
        };
        self.pos = end;
        Some(&self.data[start..end])
    }
}

/// Envelope line for a message: `From <sender> <asctime date>`.
pub fn envelope_line(sender: &str, date: DateTime<Utc>) -> String {
    let sender = if sender.is_empty() {
        "MAILER-DAEMON"
    } else {
        sender
    };
    format!("From {} {}", sender, date.format("%a %b %e %H:%M:%S %Y"))
}

/// Quote body lines that would read as an envelope.
pub fn escape_from_lines(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        if line.starts_with("From ") {
            escaped.push('>');
        }
        escaped.push_str(line);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MBOX: &[u8] = b"garbage before\n\
From a@example.com Mon Jan  1 10:00:00 2024\n\
From: a@example.com\n\
Subject: one\n\
\n\
>From the archive\n\
\n\
From b@example.com Mon Jan  1 11:00:00 2024\n\
From: b@example.com\n\
Subject: two\n\
\n\
body\n";

    #[test]
    fn splits_on_envelope_lines_only() {
        let parts: Vec<&[u8]> = messages(MBOX).collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with(b"From a@example.com"));
        assert!(String::from_utf8_lossy(parts[0]).contains(">From the archive"));
        assert!(parts[1].starts_with(b"From b@example.com"));
        assert!(parts[1].ends_with(b"body\n"));
    }

    #[test]
    fn empty_input_has_no_messages() {
        assert_eq!(messages(b"").count(), 0);
        assert_eq!(messages(b"no envelope here\n").count(), 0);
    }

    #[test]
    fn envelope_uses_asctime_format() {
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(
            envelope_line("dev@example.com", date),
            "From dev@example.com Mon Jan  1 10:00:00 2024"
        );
        assert!(envelope_line("", date).starts_with("From MAILER-DAEMON "));
    }

    #[test]
    fn escapes_lines_that_look_like_envelopes() {
        let escaped = escape_from_lines("From here\nnot From here\nFrom: header-ish\n");
        assert_eq!(escaped, ">From here\nnot From here\nFrom: header-ish\n");
    }
}
