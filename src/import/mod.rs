//! Bulk import of mbox archives.
//!
//! Messages go through the regular pipeline in batch mode: ordering is
//! deferred and recomputed once per impacted thread when the run ends, and a
//! failing message is logged and skipped without aborting the import.

pub mod mbox;
pub mod stats;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ingest::{Archiver, IngestError};

pub use stats::ImportStats;

/// Progress is logged every this many messages.
const PROGRESS_INTERVAL: usize = 1_000;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Skip messages dated at or before this instant. Defaults to the newest
    /// stored message of the list.
    pub since: Option<DateTime<Utc>>,
    /// Read files even when their mtime is at or before the cutoff.
    pub ignore_mtime: bool,
    /// Do not sync list settings before and after the import.
    pub no_sync: bool,
}

/// Sequential importer for one list.
pub struct MboxImporter {
    archiver: Archiver,
    list_name: String,
    options: ImportOptions,
    impacted_threads: BTreeSet<i32>,
}

impl MboxImporter {
    pub fn new(archiver: &Archiver, list_name: &str, options: ImportOptions) -> Self {
        Self {
            archiver: archiver.batch(),
            list_name: list_name.trim().to_lowercase(),
            options,
            impacted_threads: BTreeSet::new(),
        }
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.options.since
    }

    /// Fill in the cutoff from the archive when none was given.
    pub async fn resolve_since(&mut self) -> Result<Option<DateTime<Utc>>, ImportError> {
        if self.options.since.is_none() {
            if let Some(latest) = self.archiver.latest_email_date(&self.list_name).await? {
                log::warn!(
                    "{} already has messages, importing only those after {} (pass --since to override)",
                    self.list_name,
                    latest
                );
                self.options.since = Some(latest);
            }
        }
        Ok(self.options.since)
    }

    /// Import every file, then recompute the ordering of the touched threads.
    pub async fn import_paths(&mut self, paths: &[PathBuf]) -> Result<ImportStats, ImportError> {
        if !self.options.no_sync {
            self.archiver.sync_list_settings(&self.list_name).await?;
        }
        self.resolve_since().await?;

        let mut total = ImportStats::default();
        for path in paths {
            if self.skip_by_mtime(path)? {
                log::info!("skipping {}: not modified since {:?}", path.display(), self.options.since);
                total.skipped_files += 1;
                continue;
            }

            log::info!("importing from {}", path.display());
            let data = fs::read(path).map_err(|source| ImportError::Io {
                path: path.clone(),
                source,
            })?;
            let stats = self.import_bytes(&data).await;
            log::info!("{}: {}", path.display(), stats);
            total.merge(stats);
        }

        self.finish().await?;
        if !self.options.no_sync {
            self.archiver.sync_list_settings(&self.list_name).await?;
        }
        log::info!("import of {} finished: {}", self.list_name, total);
        Ok(total)
    }

    fn skip_by_mtime(&self, path: &Path) -> Result<bool, ImportError> {
        let Some(since) = self.options.since else {
            return Ok(false);
        };
        if self.options.ignore_mtime {
            return Ok(false);
        }
        let modified = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map_err(|source| ImportError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(DateTime::<Utc>::from(modified) <= since)
    }

    /// Import the messages of one mbox. Ordering stays deferred until
    /// [`MboxImporter::finish`].
    pub async fn import_bytes(&mut self, data: &[u8]) -> ImportStats {
        let mut stats = ImportStats::default();

        for raw in mbox::messages(data) {
            stats.read += 1;
            self.import_message(raw, &mut stats).await;

            if stats.read % PROGRESS_INTERVAL == 0 {
                log::info!("{} messages read, {} imported", stats.read, stats.imported);
            }
        }

        stats
    }

    async fn import_message(&mut self, raw: &[u8], stats: &mut ImportStats) {
        let prepared = match self.archiver.prepare(raw) {
            Ok(prepared) => prepared,
            Err(err) => {
                log::warn!("skipping unparseable message #{}: {}", stats.read, err);
                stats.failed += 1;
                return;
            }
        };

        if let (Some(since), Some(date)) = (self.options.since, prepared.date()) {
            if date <= since {
                log::trace!("{} is too old, skipping", prepared.message.message_id);
                stats.too_old += 1;
                return;
            }
        }

        match self.archiver.add_prepared(&self.list_name, &prepared).await {
            Ok(outcome) => {
                stats.imported += 1;
                self.impacted_threads.extend(outcome.impacted_threads);
            }
            Err(IngestError::DuplicateMessage(message_id)) => {
                log::debug!("duplicate email with message-id {}", message_id);
                stats.duplicates += 1;
            }
            Err(err) => {
                log::warn!(
                    "failed to import message {} from {} ({}): {}",
                    prepared.message.message_id,
                    prepared.message.sender_address,
                    prepared.message.subject,
                    err
                );
                stats.failed += 1;
            }
        }
    }

    /// Recompute the ordering of every thread touched since the last call.
    pub async fn finish(&mut self) -> Result<usize, ImportError> {
        let threads = std::mem::take(&mut self.impacted_threads);
        if threads.is_empty() {
            return Ok(0);
        }
        log::info!("computing thread structure for {} threads", threads.len());
        Ok(self.archiver.recompute_threads(threads).await?)
    }
}
