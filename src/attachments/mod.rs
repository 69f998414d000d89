//! Attachment content storage.
//!
//! Attachment metadata always lives in the database. The bytes are either
//! kept inline in the `attachments.content` column ([`InlineStorage`]) or
//! written to a folder tree ([`FilesystemStorage`]):
//!
//! ```text
//! <folder>/
//!   example.com/            # list mail domain
//!     devel/                # list local part
//!       DH/ZU/5Y/           # first six characters of the message hash
//!         42/               # email row id
//!           2               # attachment counter
//! ```
//!
//! Readers try the folder first and fall back to inline content, so
//! externalization can run while the archive is live.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid attachment key: {0}")]
    InvalidKey(String),
}

/// Identifies one attachment of one archived message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentKey {
    pub mailinglist: String,
    pub message_id_hash: String,
    pub email_id: i32,
    pub counter: i16,
}

/// Where the bytes ended up after [`AttachmentStorage::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredContent {
    Inline,
    External,
}

pub trait AttachmentStorage: Send + Sync {
    fn save(&self, key: &AttachmentKey, content: &[u8]) -> Result<StoredContent, AttachmentError>;

    /// External bytes, `None` when this storage does not hold them.
    fn load(&self, key: &AttachmentKey) -> Result<Option<Vec<u8>>, AttachmentError>;

    fn remove(&self, key: &AttachmentKey) -> Result<(), AttachmentError>;
}

/// Keeps content in the database row.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineStorage;

impl AttachmentStorage for InlineStorage {
    fn save(&self, _key: &AttachmentKey, _content: &[u8]) -> Result<StoredContent, AttachmentError> {
        Ok(StoredContent::Inline)
    }

    fn load(&self, _key: &AttachmentKey) -> Result<Option<Vec<u8>>, AttachmentError> {
        Ok(None)
    }

    fn remove(&self, _key: &AttachmentKey) -> Result<(), AttachmentError> {
        Ok(())
    }
}

/// Writes content below a folder, sharded by list and message hash.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the file path for an attachment key
    pub fn path_for(&self, key: &AttachmentKey) -> Result<PathBuf, AttachmentError> {
        let (local_part, domain) = key
            .mailinglist
            .split_once('@')
            .ok_or_else(|| AttachmentError::InvalidKey(key.mailinglist.clone()))?;
        let hash = key.message_id_hash.as_str();
        if hash.len() < 6 || !hash.is_ascii() {
            return Err(AttachmentError::InvalidKey(key.message_id_hash.clone()));
        }
        if [local_part, domain]
            .iter()
            .any(|part| part.is_empty() || part.contains(['/', '\\']) || *part == "..")
        {
            return Err(AttachmentError::InvalidKey(key.mailinglist.clone()));
        }

        Ok(self
            .root
            .join(domain)
            .join(local_part)
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash[4..6])
            .join(key.email_id.to_string())
            .join(key.counter.to_string()))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> AttachmentError + '_ {
    move |source| AttachmentError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl AttachmentStorage for FilesystemStorage {
    fn save(&self, key: &AttachmentKey, content: &[u8]) -> Result<StoredContent, AttachmentError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        // Write atomically (write to temp, then rename)
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, content).map_err(io_error(&temp_path))?;
        fs::rename(&temp_path, &path).map_err(io_error(&path))?;

        log::trace!("stored attachment at {}", path.display());
        Ok(StoredContent::External)
    }

    fn load(&self, key: &AttachmentKey) -> Result<Option<Vec<u8>>, AttachmentError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AttachmentError::Io { path, source: err }),
        }
    }

    fn remove(&self, key: &AttachmentKey) -> Result<(), AttachmentError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AttachmentError::Io { path, source: err }),
        }
    }
}

/// Content of an attachment: external copy first, inline bytes otherwise.
pub fn read_content(
    storage: &dyn AttachmentStorage,
    key: &AttachmentKey,
    inline: Option<&[u8]>,
) -> Result<Option<Vec<u8>>, AttachmentError> {
    if let Some(bytes) = storage.load(key)? {
        return Ok(Some(bytes));
    }
    Ok(inline.map(<[u8]>::to_vec))
}
