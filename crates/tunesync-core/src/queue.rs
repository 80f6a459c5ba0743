//! The operation queue handed from planning to execution.
//!
//! Destinations are device-relative. Each destination is queued at most once
//! per batch, keeping its first position; queuing it again replaces the source.
//! A deletion whose destination is also being copied is kept but marked as
//! no longer required, so the executor skips it.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A file to transfer onto the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOperation {
    /// Local source file.
    pub source: PathBuf,
    /// Device-relative destination.
    pub destination: String,
}

/// A file to remove from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOperation {
    /// Device-relative path.
    pub destination: String,
    /// False once a copy to the same destination has been queued.
    pub required: bool,
}

/// One step of a run, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Remove a music file.
    Delete(String),
    /// Remove a playlist file.
    DeletePlaylist(String),
    /// Transfer a music file.
    Copy {
        /// Local source file.
        source: PathBuf,
        /// Device-relative destination.
        destination: String,
    },
    /// Transfer a rendered playlist.
    CopyPlaylist {
        /// Local source file.
        source: PathBuf,
        /// Device-relative destination.
        destination: String,
    },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete(dst) => write!(f, "delete({dst})"),
            Self::DeletePlaylist(dst) => write!(f, "delete_playlist({dst})"),
            Self::Copy { destination, .. } => write!(f, "copy({destination})"),
            Self::CopyPlaylist { destination, .. } => write!(f, "copy_playlist({destination})"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CopyBatch {
    operations: Vec<CopyOperation>,
    index: HashMap<String, usize>,
}

impl CopyBatch {
    fn insert(&mut self, source: &Path, destination: &str) {
        if let Some(&i) = self.index.get(destination) {
            self.operations[i].source = source.to_path_buf();
        } else {
            self.index.insert(destination.to_string(), self.operations.len());
            self.operations.push(CopyOperation {
                source: source.to_path_buf(),
                destination: destination.to_string(),
            });
        }
    }

    fn contains(&self, destination: &str) -> bool {
        self.index.contains_key(destination)
    }
}

#[derive(Debug, Clone, Default)]
struct DeleteBatch {
    operations: Vec<DeleteOperation>,
    index: HashMap<String, usize>,
}

impl DeleteBatch {
    fn insert(&mut self, destination: &str, required: bool) {
        if let Some(&i) = self.index.get(destination) {
            self.operations[i].required = required;
        } else {
            self.index.insert(destination.to_string(), self.operations.len());
            self.operations.push(DeleteOperation {
                destination: destination.to_string(),
                required,
            });
        }
    }

    fn cancel(&mut self, destination: &str) {
        if let Some(&i) = self.index.get(destination) {
            self.operations[i].required = false;
        }
    }

    fn required(&self) -> impl Iterator<Item = &DeleteOperation> {
        self.operations.iter().filter(|op| op.required)
    }
}

/// Copies and deletions for one sync run.
#[derive(Debug, Clone, Default)]
pub struct OperationQueue {
    copies: CopyBatch,
    playlist_copies: CopyBatch,
    deletions: DeleteBatch,
    playlist_deletions: DeleteBatch,
}

impl OperationQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_copied(&self, destination: &str) -> bool {
        self.copies.contains(destination) || self.playlist_copies.contains(destination)
    }

    /// Queue a music file transfer, cancelling any deletion of `destination`.
    pub fn copy(&mut self, source: &Path, destination: &str) {
        self.copies.insert(source, destination);
        self.deletions.cancel(destination);
    }

    /// Queue a playlist transfer, run after every music file transfer.
    pub fn copy_playlist(&mut self, source: &Path, destination: &str) {
        self.playlist_copies.insert(source, destination);
        self.playlist_deletions.cancel(destination);
    }

    /// Queue removal of a music file, unless it is being copied.
    pub fn delete(&mut self, destination: &str) {
        let required = !self.is_copied(destination);
        self.deletions.insert(destination, required);
    }

    /// Queue removal of a playlist file, run after music file removals.
    pub fn delete_playlist(&mut self, destination: &str) {
        let required = !self.is_copied(destination);
        self.playlist_deletions.insert(destination, required);
    }

    /// Music file transfers, in queue order.
    #[must_use]
    pub fn copies(&self) -> &[CopyOperation] {
        &self.copies.operations
    }

    /// Playlist transfers, in queue order.
    #[must_use]
    pub fn playlist_copies(&self) -> &[CopyOperation] {
        &self.playlist_copies.operations
    }

    /// Music file removals, including cancelled ones.
    #[must_use]
    pub fn deletions(&self) -> &[DeleteOperation] {
        &self.deletions.operations
    }

    /// Playlist file removals, including cancelled ones.
    #[must_use]
    pub fn playlist_deletions(&self) -> &[DeleteOperation] {
        &self.playlist_deletions.operations
    }

    /// Whether `destination` has a deletion that will actually run.
    #[must_use]
    pub fn deletion_required(&self, destination: &str) -> bool {
        self.deletions
            .required()
            .chain(self.playlist_deletions.required())
            .any(|op| op.destination == destination)
    }

    /// Number of transfers.
    #[must_use]
    pub fn copy_count(&self) -> usize {
        self.copies.operations.len() + self.playlist_copies.operations.len()
    }

    /// Number of removals that will actually run.
    #[must_use]
    pub fn required_deletion_count(&self) -> usize {
        self.deletions.required().count() + self.playlist_deletions.required().count()
    }

    /// Number of removals cancelled by a later copy.
    #[must_use]
    pub fn skipped_deletion_count(&self) -> usize {
        self.deletions.operations.len() + self.playlist_deletions.operations.len()
            - self.required_deletion_count()
    }

    /// Operations that will run, counted for progress.
    #[must_use]
    pub fn total_operations(&self) -> usize {
        self.copy_count() + self.required_deletion_count()
    }

    /// Whether there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_operations() == 0
    }

    /// One-line summary of the queue.
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "{} files to copy and {} to delete",
            self.copy_count(),
            self.required_deletion_count()
        )
    }

    /// Operations that will run, in execution order: music removals,
    /// playlist removals, music transfers, playlist transfers.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        let deletions = self
            .deletions
            .required()
            .map(|op| Operation::Delete(op.destination.clone()));
        let playlist_deletions = self
            .playlist_deletions
            .required()
            .map(|op| Operation::DeletePlaylist(op.destination.clone()));
        let copies = self.copies.operations.iter().map(|op| Operation::Copy {
            source: op.source.clone(),
            destination: op.destination.clone(),
        });
        let playlist_copies = self
            .playlist_copies
            .operations
            .iter()
            .map(|op| Operation::CopyPlaylist {
                source: op.source.clone(),
                destination: op.destination.clone(),
            });
        deletions
            .chain(playlist_deletions)
            .chain(copies)
            .chain(playlist_copies)
            .collect()
    }
}
