//! Runtime settings, read from the environment at startup.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use thiserror::Error;

pub(crate) fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_string(key, default)
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Largest message the archiving endpoint accepts, in MiB.
pub fn message_size_limit_mib() -> u64 {
    env_usize("ARCHIVER_MAX_MESSAGE_MIB", 32).max(1) as u64
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Settings of the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Defer ordering and skip list-settings sync.
    pub batch_mode: bool,
    /// Domain used when synthesizing a missing Message-ID.
    pub message_id_domain: String,
    /// Counter of the first attachment of a message.
    pub attachment_counter_base: usize,
    /// When set, attachment bytes are written below this folder instead of inline.
    pub attachment_folder: Option<PathBuf>,
    pub max_transaction_retries: usize,
    /// Store undated messages with the archival time instead of rejecting them.
    pub default_undated_to_now: bool,
    pub ordering_batch_size: usize,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            batch_mode: false,
            message_id_domain: "localhost".to_string(),
            attachment_counter_base: 2,
            attachment_folder: None,
            max_transaction_retries: 3,
            default_undated_to_now: true,
            ordering_batch_size: 100,
        }
    }
}

impl ArchiverConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_mode: env_bool("ARCHIVER_BATCH_MODE", defaults.batch_mode),
            message_id_domain: env_string(
                "ARCHIVER_MESSAGE_ID_DOMAIN",
                &defaults.message_id_domain,
            ),
            attachment_counter_base: env_usize(
                "ARCHIVER_ATTACHMENT_COUNTER_BASE",
                defaults.attachment_counter_base,
            ),
            attachment_folder: env::var("ARCHIVER_ATTACHMENT_FOLDER")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            max_transaction_retries: env_usize(
                "ARCHIVER_MAX_TRANSACTION_RETRIES",
                defaults.max_transaction_retries,
            ),
            default_undated_to_now: env_bool(
                "ARCHIVER_DEFAULT_UNDATED_TO_NOW",
                defaults.default_undated_to_now,
            ),
            ordering_batch_size: env_usize(
                "ARCHIVER_ORDERING_BATCH_SIZE",
                defaults.ordering_batch_size,
            )
            .max(1),
        }
    }

    pub fn with_batch_mode(mut self, batch_mode: bool) -> Self {
        self.batch_mode = batch_mode;
        self
    }
}

/// Settings of the archiving callback endpoints.
#[derive(Debug, Clone)]
pub struct ArchivingApiConfig {
    /// Shared secret expected in `Authorization: Token <key>`.
    pub archiver_key: String,
    /// Client addresses allowed to call the endpoints; `*` allows any.
    pub allowed_from: Vec<String>,
    /// Mail domain to web domain mapping for canonical URLs.
    pub site_domains: HashMap<String, String>,
}

impl ArchivingApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let archiver_key = env::var("MAILMAN_ARCHIVER_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("MAILMAN_ARCHIVER_KEY"))?;
        let allowed_from = env_list("MAILMAN_ARCHIVER_FROM", "127.0.0.1,::1");
        let site_domains = parse_site_domains(&env_string("ARCHIVER_SITE_DOMAINS", ""))?;

        Ok(Self {
            archiver_key,
            allowed_from,
            site_domains,
        })
    }

    /// Web domain serving the archives of `mail_domain`.
    pub fn web_domain<'a>(&'a self, mail_domain: &'a str) -> &'a str {
        self.site_domains
            .get(mail_domain)
            .map(String::as_str)
            .unwrap_or(mail_domain)
    }

    pub fn allows_any_address(&self) -> bool {
        self.allowed_from.iter().any(|entry| entry == "*")
    }
}

/// Parse `mail.example.com=lists.example.com,other.org=archive.other.org`.
fn parse_site_domains(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut domains = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((mail, web)) if !mail.trim().is_empty() && !web.trim().is_empty() => {
                domains.insert(mail.trim().to_lowercase(), web.trim().to_string());
            }
            _ => {
                return Err(ConfigError::Invalid {
                    key: "ARCHIVER_SITE_DOMAINS",
                    value: entry.to_string(),
                });
            }
        }
    }
    Ok(domains)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_number_attachments_from_two() {
        let config = ArchiverConfig::default();
        assert_eq!(config.attachment_counter_base, 2);
        assert_eq!(config.ordering_batch_size, 100);
        assert!(!config.batch_mode);
        assert!(config.with_batch_mode(true).batch_mode);
    }

    #[test]
    fn site_domains_parse_pairs() {
        let domains = parse_site_domains("example.com=lists.example.com, b.org = web.b.org")
            .expect("valid mapping");
        assert_eq!(domains.get("example.com").unwrap(), "lists.example.com");
        assert_eq!(domains.get("b.org").unwrap(), "web.b.org");
        assert!(parse_site_domains("").unwrap().is_empty());
        assert!(matches!(
            parse_site_domains("broken"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn web_domain_falls_back_to_mail_domain() {
        let config = ArchivingApiConfig {
            archiver_key: "secret".into(),
            allowed_from: vec!["*".into()],
            site_domains: HashMap::from([("example.com".into(), "lists.example.com".into())]),
        };
        assert_eq!(config.web_domain("example.com"), "lists.example.com");
        assert_eq!(config.web_domain("other.org"), "other.org");
        assert!(config.allows_any_address());
    }
}
