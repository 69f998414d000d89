//! Import statistics tracking.

use std::fmt;

/// Counters for one import run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Messages read from the mbox files
    pub read: usize,
    /// Messages newly archived
    pub imported: usize,
    pub duplicates: usize,
    /// Messages skipped after a parse or store error
    pub failed: usize,
    /// Messages dated at or before the cutoff
    pub too_old: usize,
    /// Files skipped because they were not modified after the cutoff
    pub skipped_files: usize,
}

impl ImportStats {
    /// Merge another ImportStats into this one by summing all counts.
    pub fn merge(&mut self, other: ImportStats) {
        self.read += other.read;
        self.imported += other.imported;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.too_old += other.too_old;
        self.skipped_files += other.skipped_files;
    }
}

impl fmt::Display for ImportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} read, {} imported, {} duplicates, {} failed, {} too old",
            self.read, self.imported, self.duplicates, self.failed, self.too_old
        )?;
        if self.skipped_files > 0 {
            write!(f, ", {} files skipped", self.skipped_files)?;
        }
        Ok(())
    }
}
