use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use list_archiver::config::{ArchiverConfig, ArchivingApiConfig};
use list_archiver::ingest::Archiver;
use list_archiver::models::{ArchiveErrorBody, ArchivedUrl};
use list_archiver::routes::mailman::{archive_message, archived_url};
use list_archiver::store::MemoryBackend;
use list_archiver::test_support::TestRocketBuilder;
use rocket::http::{ContentType, Header, Status};
use rocket::local::asynchronous::Client;
use rocket::routes;

const LIST: &str = "devel@example.com";
const KEY: &str = "archiver-secret";
const MSG_HASH: &str = "DHZU5YPEA3VIJSUDZA22GMA3LWIBJJ4I";

fn local() -> SocketAddr {
    "127.0.0.1:8000".parse().unwrap()
}

fn api_config(allowed_from: &[&str]) -> ArchivingApiConfig {
    ArchivingApiConfig {
        archiver_key: KEY.to_string(),
        allowed_from: allowed_from.iter().map(|a| a.to_string()).collect(),
        site_domains: HashMap::new(),
    }
}

async fn client(allowed_from: &[&str]) -> (MemoryBackend, Client) {
    let backend = MemoryBackend::new();
    let archiver = Archiver::new(Arc::new(backend.clone()), ArchiverConfig::default());
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![archive_message, archived_url])
        .manage_archiver(archiver)
        .manage_api_config(api_config(allowed_from))
        .async_client()
        .await;
    (backend, client)
}

fn token() -> Header<'static> {
    Header::new("Authorization", format!("Token {}", KEY))
}

fn urlencode(value: &[u8]) -> String {
    value
        .iter()
        .map(|&b| {
            if b.is_ascii_alphanumeric() || b"-_.~".contains(&b) {
                (b as char).to_string()
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}

fn form(list: &str, message: &str) -> String {
    format!(
        "mlist={}&message={}",
        urlencode(list.as_bytes()),
        urlencode(message.as_bytes())
    )
}

fn message() -> &'static str {
    "From: Dev <dev@example.com>\r\n\
     Message-ID: <msg>\r\n\
     Subject: hello\r\n\
     Date: Mon, 01 Jan 2024 10:00:00 +0000\r\n\
     \r\n\
     body\r\n"
}

fn expected_url() -> String {
    format!("https://example.com/list/{}/message/{}/", LIST, MSG_HASH)
}

#[rocket::async_test]
async fn archiving_returns_the_message_url() {
    let (_, client) = client(&["127.0.0.1"]).await;

    let response = client
        .post("/api/mailman/archive")
        .remote(local())
        .header(token())
        .header(ContentType::Form)
        .body(form(LIST, message()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let payload: ArchivedUrl = response.into_json().await.expect("valid JSON payload");
    assert_eq!(payload.url, expected_url());
}

#[rocket::async_test]
async fn multipart_uploads_are_accepted() {
    let (backend, client) = client(&["*"]).await;
    let boundary = "archiver-test-boundary";
    let body = format!(
        "--{b}\r\n\
         Content-Disposition: form-data; name=\"mlist\"\r\n\r\n\
         {list}\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"message\"; filename=\"message.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         {msg}\r\n\
         --{b}--\r\n",
        b = boundary,
        list = LIST,
        msg = message()
    );

    let response = client
        .post("/api/mailman/archive")
        .remote(local())
        .header(token())
        .header(ContentType::new("multipart", "form-data").with_params(("boundary", boundary)))
        .body(body)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let archiver = Archiver::new(Arc::new(backend), ArchiverConfig::default());
    assert_eq!(archiver.count_emails(LIST).await.unwrap(), 1);
}

#[rocket::async_test]
async fn duplicates_still_return_the_url() {
    let (backend, client) = client(&["127.0.0.1"]).await;

    for _ in 0..2 {
        let response = client
            .post("/api/mailman/archive")
            .remote(local())
            .header(token())
            .header(ContentType::Form)
            .body(form(LIST, message()))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let payload: ArchivedUrl = response.into_json().await.expect("valid JSON payload");
        assert_eq!(payload.url, expected_url());
    }

    let archiver = Archiver::new(Arc::new(backend), ArchiverConfig::default());
    assert_eq!(archiver.count_emails(LIST).await.unwrap(), 1);
}

#[rocket::async_test]
async fn messages_without_sender_are_rejected() {
    let (_, client) = client(&["127.0.0.1"]).await;
    let unsigned = "Message-ID: <nosender>\r\nSubject: hi\r\n\r\nbody\r\n";

    let response = client
        .post("/api/mailman/archive")
        .remote(local())
        .header(token())
        .header(ContentType::Form)
        .body(form(LIST, unsigned))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);
    let payload: ArchiveErrorBody = response.into_json().await.expect("valid JSON payload");
    assert!(!payload.error.is_empty());
}

#[rocket::async_test]
async fn missing_fields_are_unprocessable() {
    let (_, client) = client(&["127.0.0.1"]).await;

    let response = client
        .post("/api/mailman/archive")
        .remote(local())
        .header(token())
        .header(ContentType::Form)
        .body(format!("mlist={}", urlencode(LIST.as_bytes())))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::UnprocessableEntity);
    let payload: ArchiveErrorBody = response.into_json().await.expect("valid JSON payload");
    assert!(payload.error.contains("message"));
}

#[rocket::async_test]
async fn missing_or_wrong_key_is_unauthorized() {
    let (backend, client) = client(&["127.0.0.1"]).await;

    let response = client
        .post("/api/mailman/archive")
        .remote(local())
        .header(ContentType::Form)
        .body(form(LIST, message()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);
    let payload: ArchiveErrorBody = response.into_json().await.expect("valid JSON payload");
    assert!(payload.error.contains("archiver key"));

    let response = client
        .post("/api/mailman/archive")
        .remote(local())
        .header(Header::new("Authorization", "Token not-the-key"))
        .header(ContentType::Form)
        .body(form(LIST, message()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);

    let archiver = Archiver::new(Arc::new(backend), ArchiverConfig::default());
    assert_eq!(archiver.count_emails(LIST).await.unwrap(), 0);
}

#[rocket::async_test]
async fn unlisted_addresses_are_forbidden() {
    let (_, client) = client(&["127.0.0.1"]).await;

    let response = client
        .post("/api/mailman/archive")
        .remote("10.1.2.3:4000".parse().unwrap())
        .header(token())
        .header(ContentType::Form)
        .body(form(LIST, message()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Forbidden);
    let payload: ArchiveErrorBody = response.into_json().await.expect("valid JSON payload");
    assert!(payload.error.contains("MAILMAN_ARCHIVER_FROM"));
}

#[rocket::async_test]
async fn urls_for_lists_and_messages() {
    let (_, client) = client(&["127.0.0.1"]).await;

    let response = client
        .get(format!("/api/mailman/urls?mlist={}", LIST))
        .remote(local())
        .header(token())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let payload: ArchivedUrl = response.into_json().await.expect("valid JSON payload");
    assert_eq!(payload.url, format!("https://example.com/list/{}/", LIST));

    let response = client
        .get(format!("/api/mailman/urls?mlist={}&msgid=%3Cmsg%3E", LIST))
        .remote(local())
        .header(token())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let payload: ArchivedUrl = response.into_json().await.expect("valid JSON payload");
    assert_eq!(payload.url, expected_url());
}

#[rocket::async_test]
async fn urls_require_the_key() {
    let (_, client) = client(&["*"]).await;

    let response = client
        .get(format!("/api/mailman/urls?mlist={}", LIST))
        .remote(local())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);
}
