use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::FromRow;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ===== Mailing List Models =====

/// Archiving policy of a mailing list, stored as a SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArchivePolicy {
    Never,
    Private,
    #[default]
    Public,
}

impl ArchivePolicy {
    pub fn as_i16(self) -> i16 {
        match self {
            ArchivePolicy::Never => 0,
            ArchivePolicy::Private => 1,
            ArchivePolicy::Public => 2,
        }
    }

    /// Unknown values fall back to the most restrictive archiving policy
    /// that still archives.
    pub fn from_i16(value: i16) -> Self {
        match value {
            0 => ArchivePolicy::Never,
            2 => ArchivePolicy::Public,
            _ => ArchivePolicy::Private,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MailingList {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub subject_prefix: String,
    pub archive_policy: i16,
    pub created_at: DateTime<Utc>,
}

impl MailingList {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: String::new(),
            description: String::new(),
            subject_prefix: String::new(),
            archive_policy: ArchivePolicy::default().as_i16(),
            created_at: Utc::now(),
        }
    }

    pub fn policy(&self) -> ArchivePolicy {
        ArchivePolicy::from_i16(self.archive_policy)
    }

    /// Domain part of the list address (`list@example.com` -> `example.com`).
    pub fn mail_domain(&self) -> &str {
        self.name.split_once('@').map(|(_, domain)| domain).unwrap_or("")
    }
}

// ===== Core Data Models =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct Sender {
    pub address: String,
    pub name: String,
    pub mailman_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Thread {
    pub id: i32,
    pub mailinglist: String,
    pub thread_id: String,
    pub date_active: DateTime<Utc>,
    pub starting_email_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Email {
    pub id: i32,
    pub mailinglist: String,
    pub message_id: String,
    pub message_id_hash: String,
    pub sender_address: String,
    pub sender_name: String,
    pub subject: String,
    pub content: String,
    pub date: DateTime<Utc>,
    /// Offset of the original Date header from UTC, in minutes.
    pub timezone: i16,
    pub in_reply_to: Option<String>,
    pub archived_date: DateTime<Utc>,
    pub thread_id: i32,
    pub parent_id: Option<i32>,
    pub thread_depth: i32,
    pub thread_order: i32,
}

/// Email row about to be inserted; ids and ordering are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub mailinglist: String,
    pub message_id: String,
    pub message_id_hash: String,
    pub sender_address: String,
    pub sender_name: String,
    pub subject: String,
    pub content: String,
    pub date: DateTime<Utc>,
    pub timezone: i16,
    pub in_reply_to: Option<String>,
    pub thread_id: i32,
    pub parent_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attachment {
    pub id: i32,
    pub email_id: i32,
    pub counter: i16,
    pub name: String,
    pub content_type: String,
    pub encoding: Option<String>,
    pub size: i32,
    /// Inline bytes; `None` once the content has been moved to file storage.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub email_id: i32,
    pub counter: i16,
    pub name: String,
    pub content_type: String,
    pub encoding: Option<String>,
    pub size: i32,
    /// `None` when the bytes live in external storage.
    pub content: Option<Vec<u8>>,
}

/// Depth/order pair computed by the ordering engine for one email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPosition {
    pub email_id: i32,
    pub parent_id: Option<i32>,
    pub thread_depth: i32,
    pub thread_order: i32,
}

// ===== API Responses =====

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArchivedUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_policy_round_trips_known_values() {
        for policy in [
            ArchivePolicy::Never,
            ArchivePolicy::Private,
            ArchivePolicy::Public,
        ] {
            assert_eq!(ArchivePolicy::from_i16(policy.as_i16()), policy);
        }
        assert_eq!(ArchivePolicy::from_i16(42), ArchivePolicy::Private);
    }

    #[test]
    fn mail_domain_splits_list_address() {
        let list = MailingList::new("devel@lists.example.org");
        assert_eq!(list.mail_domain(), "lists.example.org");
        assert_eq!(MailingList::new("broken").mail_domain(), "");
    }
}
