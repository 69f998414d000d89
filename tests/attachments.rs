use std::sync::Arc;

use list_archiver::attachments::{AttachmentKey, FilesystemStorage};
use list_archiver::config::ArchiverConfig;
use list_archiver::ingest::Archiver;
use list_archiver::store::{ArchiveBackend, MemoryBackend};
use tempfile::tempdir;

const LIST: &str = "devel@example.com";

fn message_with_attachments(id: &str) -> Vec<u8> {
    format!(
        concat!(
            "From: Dev <dev@example.com>\r\n",
            "Message-ID: <{id}>\r\n",
            "Subject: [PATCH] fix the build\r\n",
            "Date: Mon, 01 Jan 2024 10:00:00 +0000\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"part\"\r\n",
            "\r\n",
            "--part\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Patch attached.\r\n",
            "--part\r\n",
            "Content-Type: text/x-diff; charset=us-ascii; name=\"fix.patch\"\r\n",
            "Content-Disposition: attachment; filename=\"fix.patch\"\r\n",
            "\r\n",
            "--- a/build\r\n",
            "--part\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "Content-Disposition: attachment; filename=\"blob.bin\"\r\n",
            "\r\n",
            "AAEC\r\n",
            "--part--\r\n"
        ),
        id = id
    )
    .into_bytes()
}

#[tokio::test]
async fn inline_attachments_are_numbered_from_two() {
    let backend = MemoryBackend::new();
    let archiver = Archiver::new(Arc::new(backend.clone()), ArchiverConfig::default());
    let outcome = archiver
        .add_to_list(LIST, &message_with_attachments("patch@x"))
        .await
        .unwrap();

    let mut store = backend.begin().await.unwrap();
    let email = store.email(outcome.email_id).await.unwrap().unwrap();
    assert_eq!(email.content, "Patch attached.");
    let attachments = store.attachments_for_email(outcome.email_id).await.unwrap();
    drop(store);

    let summary: Vec<(i16, &str, &str)> = attachments
        .iter()
        .map(|a| (a.counter, a.name.as_str(), a.content_type.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (2, "fix.patch", "text/x-diff"),
            (3, "blob.bin", "application/octet-stream"),
        ]
    );
    assert_eq!(attachments[1].size, 3);
    assert_eq!(attachments[1].content.as_deref(), Some(&[0u8, 1, 2][..]));

    let bytes = archiver
        .attachment_content(LIST, &outcome.message_id_hash, 3)
        .await
        .unwrap();
    assert_eq!(bytes, vec![0, 1, 2]);
}

#[tokio::test]
async fn configured_folder_receives_attachment_files() {
    let folder = tempdir().unwrap();
    let backend = MemoryBackend::new();
    let config = ArchiverConfig {
        attachment_folder: Some(folder.path().to_path_buf()),
        ..Default::default()
    };
    let archiver = Archiver::new(Arc::new(backend.clone()), config);
    let outcome = archiver
        .add_to_list(LIST, &message_with_attachments("patch@x"))
        .await
        .unwrap();

    let mut store = backend.begin().await.unwrap();
    let attachments = store.attachments_for_email(outcome.email_id).await.unwrap();
    drop(store);
    assert!(attachments.iter().all(|a| a.content.is_none()));

    let storage = FilesystemStorage::new(folder.path());
    let path = storage
        .path_for(&AttachmentKey {
            mailinglist: LIST.to_string(),
            message_id_hash: outcome.message_id_hash.clone(),
            email_id: outcome.email_id,
            counter: 2,
        })
        .unwrap();
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(String::from_utf8_lossy(&on_disk).trim_end(), "--- a/build");

    let bytes = archiver
        .attachment_content(LIST, &outcome.message_id_hash, 2)
        .await
        .unwrap();
    assert_eq!(bytes, on_disk);

    archiver
        .delete_email(LIST, &outcome.message_id_hash)
        .await
        .unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn externalizing_moves_inline_content() {
    let folder = tempdir().unwrap();
    let backend = MemoryBackend::new();

    let inline = Archiver::new(Arc::new(backend.clone()), ArchiverConfig::default());
    let first = inline
        .add_to_list(LIST, &message_with_attachments("one@x"))
        .await
        .unwrap();
    inline
        .add_to_list(LIST, &message_with_attachments("two@x"))
        .await
        .unwrap();

    let external = Archiver::new(
        Arc::new(backend.clone()),
        ArchiverConfig {
            attachment_folder: Some(folder.path().to_path_buf()),
            ..Default::default()
        },
    );
    // chunk size smaller than the attachment count exercises paging
    assert_eq!(external.externalize_attachments(3).await.unwrap(), 4);
    assert_eq!(external.externalize_attachments(3).await.unwrap(), 0);

    let mut store = backend.begin().await.unwrap();
    let attachments = store.attachments_for_email(first.email_id).await.unwrap();
    drop(store);
    assert!(attachments.iter().all(|a| a.content.is_none()));

    let bytes = external
        .attachment_content(LIST, &first.message_id_hash, 3)
        .await
        .unwrap();
    assert_eq!(bytes, vec![0, 1, 2]);
}

#[tokio::test]
async fn unknown_attachments_are_not_found() {
    let backend = MemoryBackend::new();
    let archiver = Archiver::new(Arc::new(backend), ArchiverConfig::default());
    let outcome = archiver
        .add_to_list(LIST, &message_with_attachments("patch@x"))
        .await
        .unwrap();

    let err = archiver
        .attachment_content(LIST, &outcome.message_id_hash, 9)
        .await
        .unwrap_err();
    assert!(matches!(err, list_archiver::ingest::IngestError::NotFound(_)));
}
