//! Archiving API called by the list manager.
//!
//! Both endpoints require the shared archiver key in an
//! `Authorization: Token <key>` header and a client address listed in
//! `MAILMAN_ARCHIVER_FROM` (`*` accepts any address). The address is checked
//! first.

use rocket::form::Form;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{FromForm, State, catch, get, post};
use rocket_okapi::openapi;
use rocket_okapi::request::OpenApiFromRequest;
use thiserror::Error;

use crate::config::ArchivingApiConfig;
use crate::error::ApiError;
use crate::ingest::identity::{message_id_hash, repair_message_id, storage_message_id};
use crate::ingest::{Archiver, IngestError};
use crate::models::{ArchiveErrorBody, ArchivedUrl};

#[derive(Debug, Error)]
pub enum ArchiverAuthError {
    #[error("the archiver key must be sent in the Authorization header")]
    MissingKey,
    #[error("the archiver key is invalid")]
    InvalidKey,
    #[error("access from {0} is forbidden, check MAILMAN_ARCHIVER_FROM")]
    ForbiddenAddress(String),
    #[error("the archiving api is not configured")]
    Unconfigured,
}

impl ArchiverAuthError {
    pub fn status(&self) -> Status {
        match self {
            ArchiverAuthError::MissingKey | ArchiverAuthError::InvalidKey => Status::Unauthorized,
            ArchiverAuthError::ForbiddenAddress(_) => Status::Forbidden,
            ArchiverAuthError::Unconfigured => Status::InternalServerError,
        }
    }
}

/// Proof that the caller is the list manager.
#[derive(Debug, OpenApiFromRequest)]
pub struct ArchiverAuth;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ArchiverAuth {
    type Error = ArchiverAuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = match request.guard::<&State<ArchivingApiConfig>>().await {
            Outcome::Success(config) => config,
            _ => {
                let err = ArchiverAuthError::Unconfigured;
                return Outcome::Error((err.status(), err));
            }
        };

        match authorize(request, config) {
            Ok(()) => Outcome::Success(ArchiverAuth),
            Err(err) => {
                log::error!("archiving api: {}", err);
                Outcome::Error((err.status(), err))
            }
        }
    }
}

fn authorize(request: &Request<'_>, config: &ArchivingApiConfig) -> Result<(), ArchiverAuthError> {
    if !config.allows_any_address() {
        let client = request.client_ip().map(|ip| ip.to_string());
        let allowed = client
            .as_ref()
            .is_some_and(|ip| config.allowed_from.iter().any(|a| a == ip));
        if !allowed {
            return Err(ArchiverAuthError::ForbiddenAddress(
                client.unwrap_or_else(|| "an unknown address".to_string()),
            ));
        }
    }

    let header = request
        .headers()
        .get_one("Authorization")
        .ok_or(ArchiverAuthError::MissingKey)?;
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Token"), Some(key), None)
            if constant_time_eq::constant_time_eq(
                key.as_bytes(),
                config.archiver_key.as_bytes(),
            ) =>
        {
            Ok(())
        }
        _ => Err(ArchiverAuthError::InvalidKey),
    }
}

mod constant_time_eq {
    /// Constant-time comparison to avoid timing side-channels.
    pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }

        let mut result: u8 = 0;
        for (&x, &y) in a.iter().zip(b.iter()) {
            result |= x ^ y;
        }

        result == 0
    }
}

fn list_url(config: &ArchivingApiConfig, list_name: &str) -> Result<String, ApiError> {
    let (_, mail_domain) = list_name
        .split_once('@')
        .ok_or_else(|| ApiError::BadRequest(format!("invalid list address: {}", list_name)))?;
    Ok(format!(
        "https://{}/list/{}/",
        config.web_domain(mail_domain),
        list_name
    ))
}

/// Canonical URL of a list, or of one of its messages.
pub fn canonical_url(
    config: &ArchivingApiConfig,
    list_name: &str,
    message_id_hash: Option<&str>,
) -> Result<String, ApiError> {
    let base = list_url(config, list_name)?;
    Ok(match message_id_hash {
        Some(hash) => format!("{}message/{}/", base, hash),
        None => base,
    })
}

/// Hash of a Message-ID as the list manager sends it (brackets optional).
fn hash_of(raw_message_id: &str) -> Option<String> {
    repair_message_id(raw_message_id.trim())
        .map(|bracketed| message_id_hash(&storage_message_id(&bracketed)))
}

#[derive(Debug, FromForm)]
pub struct ArchiveForm<'r> {
    pub mlist: String,
    pub message: &'r [u8],
}

/// Archive one message posted as a multipart form.
#[openapi(skip)]
#[post("/mailman/archive", data = "<form>")]
pub async fn archive_message(
    _auth: ArchiverAuth,
    archiver: &State<Archiver>,
    config: &State<ArchivingApiConfig>,
    form: Form<ArchiveForm<'_>>,
) -> Result<Json<ArchivedUrl>, ApiError> {
    let list_name = form.mlist.trim().to_lowercase();
    if !list_name.contains('@') {
        return Err(ApiError::BadRequest(format!(
            "invalid list address: {}",
            list_name
        )));
    }

    let hash = match archiver.add_to_list(&list_name, form.message).await {
        Ok(outcome) => outcome.message_id_hash,
        Err(IngestError::DuplicateMessage(message_id)) => {
            log::info!("duplicate email with message-id {}", message_id);
            message_id_hash(&message_id)
        }
        Err(err) if err.is_message_error() => {
            log::warn!("could not archive the email: {}", err);
            return Err(ApiError::BadRequest(err.to_string()));
        }
        Err(err) => return Err(ApiError::from(err)),
    };

    let url = canonical_url(config, &list_name, Some(&hash))?;
    log::info!("archived message {} to {}", hash, url);
    Ok(Json(ArchivedUrl { url }))
}

/// Canonical URL of a list (`mlist` only) or of a message (`mlist` and
/// `msgid`).
#[openapi(tag = "Archiving")]
#[get("/mailman/urls?<mlist>&<msgid>")]
pub async fn archived_url(
    _auth: ArchiverAuth,
    config: &State<ArchivingApiConfig>,
    mlist: String,
    msgid: Option<String>,
) -> Result<Json<ArchivedUrl>, ApiError> {
    let list_name = mlist.trim().to_lowercase();
    let hash = match msgid.as_deref() {
        Some(raw) => Some(
            hash_of(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid message id: {}", raw)))?,
        ),
        None => None,
    };
    let url = canonical_url(config, &list_name, hash.as_deref())?;
    Ok(Json(ArchivedUrl { url }))
}

#[catch(401)]
pub fn unauthorized() -> Json<ArchiveErrorBody> {
    Json(ArchiveErrorBody {
        error: "authorization required: check the archiver key".to_string(),
    })
}

#[catch(403)]
pub fn forbidden() -> Json<ArchiveErrorBody> {
    Json(ArchiveErrorBody {
        error: "access is forbidden: check MAILMAN_ARCHIVER_FROM".to_string(),
    })
}

#[catch(422)]
pub fn unprocessable() -> Json<ArchiveErrorBody> {
    Json(ArchiveErrorBody {
        error: "the request must carry the mlist and message fields".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> ArchivingApiConfig {
        ArchivingApiConfig {
            archiver_key: "secret".into(),
            allowed_from: vec!["127.0.0.1".into()],
            site_domains: HashMap::from([("lists.example.com".into(), "archives.example.com".into())]),
        }
    }

    #[test]
    fn urls_use_the_site_domain() {
        let config = config();
        assert_eq!(
            canonical_url(&config, "devel@lists.example.com", None).unwrap(),
            "https://archives.example.com/list/devel@lists.example.com/"
        );
        assert_eq!(
            canonical_url(&config, "devel@example.org", Some("ABC")).unwrap(),
            "https://example.org/list/devel@example.org/message/ABC/"
        );
        assert!(canonical_url(&config, "devel", None).is_err());
    }

    #[test]
    fn message_id_hash_ignores_brackets() {
        assert_eq!(hash_of("<msg>").unwrap(), "DHZU5YPEA3VIJSUDZA22GMA3LWIBJJ4I");
        assert_eq!(hash_of(" msg ").unwrap(), "DHZU5YPEA3VIJSUDZA22GMA3LWIBJJ4I");
    }

    #[test]
    fn key_comparison() {
        assert!(constant_time_eq::constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq::constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq::constant_time_eq(b"secret", b"secre"));
    }
}
