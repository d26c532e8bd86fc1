//! Source and destination abstractions the transfer engine is written against.
//!
//! Transfers identify objects by a path relative to the job's source and destination roots; the
//! endpoint resolves it to whatever addressing the backing store uses.

use futures::future::BoxFuture;

use crate::folder::FolderCreationTracker;
use crate::retry_reader::RangeGetter;

pub trait Source: Send + Sync + std::fmt::Debug {
    /// Range getter reading the object at `relative`.
    fn getter(&self, relative: &std::path::Path) -> anyhow::Result<std::sync::Arc<dyn RangeGetter>>;

    /// Human readable location of `relative`, used in logs and error messages.
    fn describe(&self, relative: &std::path::Path) -> String;

    /// Path on the local filesystem, if the object lives there.
    fn local_path(&self, _relative: &std::path::Path) -> Option<std::path::PathBuf> {
        None
    }
}

pub trait Destination: Send + Sync + std::fmt::Debug {
    /// Modification time of the object already present at `relative`, `None` if there is none.
    fn modified(
        &self,
        relative: &std::path::Path,
    ) -> BoxFuture<'_, anyhow::Result<Option<std::time::SystemTime>>>;

    /// Prepares `relative` to receive `size` bytes. Missing parent containers are created through
    /// `tracker` so that folder transfers know they were made by this job.
    fn open_writer<'a>(
        &'a self,
        relative: &'a std::path::Path,
        size: u64,
        tracker: std::sync::Arc<dyn FolderCreationTracker>,
    ) -> BoxFuture<'a, anyhow::Result<std::sync::Arc<dyn ChunkWriter>>>;

    fn describe(&self, relative: &std::path::Path) -> String;

    fn local_path(&self, _relative: &std::path::Path) -> Option<std::path::PathBuf> {
        None
    }
}

/// Receives the chunks of one object. Writes target disjoint ranges and may run concurrently.
pub trait ChunkWriter: Send + Sync {
    fn write_at(&self, offset: u64, data: Vec<u8>) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Called once after every chunk was written successfully.
    fn commit(
        &self,
        modified: Option<std::time::SystemTime>,
    ) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Called instead of [`ChunkWriter::commit`] when the transfer did not succeed.
    fn abort(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}
