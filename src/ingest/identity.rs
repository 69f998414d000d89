//! Message identity: Message-ID repair and the external message hash.

use data_encoding::BASE32;
use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Longest stored Message-ID, in characters.
pub const MAX_MESSAGE_ID_LEN: usize = 254;

/// External identifier of a message: base32 of the SHA-1 of its Message-ID
/// without angle brackets.
pub fn message_id_hash(message_id: &str) -> String {
    let bare = message_id.trim_start_matches('<').trim_end_matches('>');
    BASE32.encode(&Sha1::digest(bare.as_bytes()))
}

/// Repair a raw Message-ID header into `<...>` form.
///
/// Whitespace and non-ASCII characters are dropped, anything after the first
/// `>` is cut, and missing brackets are added. Returns `None` when nothing
/// usable remains.
pub fn repair_message_id(raw: &str) -> Option<String> {
    let mut id: String = raw
        .chars()
        .filter(|c| c.is_ascii() && !c.is_whitespace())
        .collect();

    if id.starts_with('<') {
        if let Some(end) = id.find('>') {
            id.truncate(end + 1);
        }
    } else {
        id.insert(0, '<');
    }
    if !id.ends_with('>') {
        id.push('>');
    }

    if id == "<>" { None } else { Some(id) }
}

/// Fresh `<uuid.generated@domain>` identifier for messages lacking one.
pub fn synthesize_message_id(domain: &str) -> String {
    format!("<{}.generated@{}>", Uuid::new_v4().simple(), domain)
}

/// Stored form of a bracketed Message-ID.
pub fn storage_message_id(bracketed: &str) -> String {
    let bare = bracketed.trim_start_matches('<').trim_end_matches('>');
    bare.chars().take(MAX_MESSAGE_ID_LEN).collect()
}
