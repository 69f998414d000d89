use std::io::Read;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use list_archiver::config::ArchiverConfig;
use list_archiver::export::{export_filename, export_mbox};
use list_archiver::import::{ImportOptions, MboxImporter};
use list_archiver::ingest::Archiver;
use list_archiver::ingest::identity::message_id_hash;
use list_archiver::store::{ArchiveBackend, EmailFilter, MemoryBackend};
use tempfile::tempdir;

const LIST: &str = "devel@example.com";

const MBOX: &str = "From dev@example.com Mon Jan  1 10:00:00 2024
From: Dev <dev@example.com>
Message-ID: <a@x>
Subject: [Devel] first
Date: Mon, 01 Jan 2024 10:00:00 +0100

first body

From other@example.com Mon Jan  1 11:00:00 2024
From: Other <other@example.com>
Message-ID: <b@x>
Subject: Re: [Devel] first
In-Reply-To: <a@x>
Date: Mon, 01 Jan 2024 11:00:00 +0000

reply body

From dev@example.com Fri Feb  2 09:00:00 2024
From: Dev <dev@example.com>
Message-ID: <c@x>
Subject: unrelated
Date: Fri, 02 Feb 2024 09:00:00 +0000

another topic
";

fn archiver() -> (MemoryBackend, Archiver) {
    let backend = MemoryBackend::new();
    let archiver = Archiver::new(Arc::new(backend.clone()), ArchiverConfig::default());
    (backend, archiver)
}

async fn imported_archive() -> (MemoryBackend, Archiver) {
    let (backend, archiver) = archiver();
    let dir = tempdir().unwrap();
    let path = dir.path().join("devel.mbox");
    std::fs::write(&path, MBOX).unwrap();

    let mut importer = MboxImporter::new(
        &archiver,
        LIST,
        ImportOptions {
            ignore_mtime: true,
            ..Default::default()
        },
    );
    let stats = importer.import_paths(&[path]).await.unwrap();
    assert_eq!(stats.read, 3);
    assert_eq!(stats.imported, 3);
    (backend, archiver)
}

async fn export(archiver: &Archiver, filter: &EmailFilter) -> (usize, Vec<u8>) {
    let mut compressed = Vec::new();
    let count = export_mbox(archiver, LIST, filter, &mut compressed)
        .await
        .unwrap();
    let mut mbox = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut mbox)
        .unwrap();
    (count, mbox)
}

#[tokio::test]
async fn imported_threads_survive_an_export_round_trip() {
    let (_, source) = imported_archive().await;
    let (count, mbox) = export(&source, &EmailFilter::default()).await;
    assert_eq!(count, 3);

    let text = String::from_utf8(mbox.clone()).unwrap();
    assert!(text.starts_with("From dev@example.com Mon Jan  1 09:00:00 2024\n"));
    let a = text.find("Message-ID: <a@x>").unwrap();
    let b = text.find("Message-ID: <b@x>").unwrap();
    let c = text.find("Message-ID: <c@x>").unwrap();
    assert!(a < b && b < c);

    let (backend, copy) = archiver();
    let mut importer = MboxImporter::new(&copy, LIST, ImportOptions::default());
    let stats = importer.import_bytes(&mbox).await;
    importer.finish().await.unwrap();
    assert_eq!(stats.imported, 3);
    assert_eq!(stats.failed, 0);

    let mut store = backend.begin().await.unwrap();
    let first = store.email_by_message_id(LIST, "a@x").await.unwrap().unwrap();
    let reply = store.email_by_message_id(LIST, "b@x").await.unwrap().unwrap();
    assert_eq!(reply.parent_id, Some(first.id));
    assert_eq!(reply.thread_id, first.thread_id);
    assert_eq!(reply.thread_depth, 1);
    assert_eq!(first.content, "first body");
    assert_eq!(first.timezone, 60);
}

#[tokio::test]
async fn filters_select_threads_dates_and_messages() {
    let (_, source) = imported_archive().await;

    let by_thread = EmailFilter {
        thread_key: Some(message_id_hash("a@x")),
        ..Default::default()
    };
    assert_eq!(export(&source, &by_thread).await.0, 2);

    let by_date = EmailFilter {
        start: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
        ..Default::default()
    };
    let (count, mbox) = export(&source, &by_date).await;
    assert_eq!(count, 1);
    assert!(String::from_utf8(mbox).unwrap().contains("Message-ID: <c@x>"));

    let by_message = EmailFilter {
        message_id_hashes: vec![message_id_hash("b@x"), message_id_hash("c@x")],
        ..Default::default()
    };
    assert_eq!(export(&source, &by_message).await.0, 2);

    assert_eq!(export_filename(LIST, &by_date), "devel-2024-02-01.mbox.gz");
}

#[tokio::test]
async fn empty_exports_are_valid_archives() {
    let (_, archiver) = archiver();
    let (count, mbox) = export(&archiver, &EmailFilter::default()).await;
    assert_eq!(count, 0);
    assert!(mbox.is_empty());
}
