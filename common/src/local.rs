//! Local filesystem endpoints.

use std::os::unix::fs::FileExt;

use anyhow::Context;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::endpoint::{ChunkWriter, Destination, Source};
use crate::folder::FolderCreationTracker;
use crate::range::ByteRange;
use crate::retry_reader::{Body, RangeGetter};

#[derive(Debug, Clone)]
pub struct LocalSource {
    root: std::path::PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, relative: &std::path::Path) -> std::path::PathBuf {
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

/// Range getter over one local file; each request opens the file anew.
#[derive(Debug, Clone)]
pub struct LocalFileGetter {
    path: std::path::PathBuf,
}

impl LocalFileGetter {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RangeGetter for LocalFileGetter {
    fn get(&self, range: ByteRange) -> BoxFuture<'static, std::io::Result<Body>> {
        let path = self.path.clone();
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(std::io::SeekFrom::Start(range.offset)).await?;
            Ok(Box::pin(file.take(range.count)) as Body)
        })
    }
}

impl Source for LocalSource {
    fn getter(
        &self,
        relative: &std::path::Path,
    ) -> anyhow::Result<std::sync::Arc<dyn RangeGetter>> {
        Ok(std::sync::Arc::new(LocalFileGetter::new(self.path(relative))))
    }

    fn describe(&self, relative: &std::path::Path) -> String {
        format!("{:?}", self.path(relative))
    }

    fn local_path(&self, relative: &std::path::Path) -> Option<std::path::PathBuf> {
        Some(self.path(relative))
    }
}

/// Hidden sibling of `path` that receives the data until the transfer commits; the destination
/// path itself only ever holds complete files.
#[must_use]
pub fn partial_path(path: &std::path::Path) -> std::path::PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or(path.as_os_str()));
    name.push(".rxcp-part");
    path.with_file_name(name)
}

#[derive(Debug, Clone)]
pub struct LocalDestination {
    root: std::path::PathBuf,
}

impl LocalDestination {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, relative: &std::path::Path) -> std::path::PathBuf {
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

impl Destination for LocalDestination {
    fn modified(
        &self,
        relative: &std::path::Path,
    ) -> BoxFuture<'_, anyhow::Result<Option<std::time::SystemTime>>> {
        let path = self.path(relative);
        Box::pin(async move {
            match tokio::fs::metadata(&path).await {
                Ok(metadata) => {
                    let modified = metadata
                        .modified()
                        .with_context(|| format!("cannot read modification time of {:?}", &path))?;
                    Ok(Some(modified))
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(error) => Err(error).with_context(|| format!("cannot stat {:?}", &path)),
            }
        })
    }

    fn open_writer<'a>(
        &'a self,
        relative: &'a std::path::Path,
        size: u64,
        tracker: std::sync::Arc<dyn FolderCreationTracker>,
    ) -> BoxFuture<'a, anyhow::Result<std::sync::Arc<dyn ChunkWriter>>> {
        let path = self.path(relative);
        Box::pin(async move {
            let writer = tokio::task::spawn_blocking(move || -> anyhow::Result<LocalWriter> {
                if let Some(parent) = path.parent() {
                    tracker.create_if_absent(parent)?;
                }
                let partial = partial_path(&path);
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&partial)
                    .with_context(|| format!("cannot open {:?} for writing", &partial))?;
                file.set_len(size)
                    .with_context(|| format!("cannot resize {:?} to {} bytes", &partial, size))?;
                Ok(LocalWriter {
                    file: std::sync::Arc::new(file),
                    partial,
                    path,
                })
            })
            .await??;
            Ok(std::sync::Arc::new(writer) as std::sync::Arc<dyn ChunkWriter>)
        })
    }

    fn describe(&self, relative: &std::path::Path) -> String {
        format!("{:?}", self.path(relative))
    }

    fn local_path(&self, relative: &std::path::Path) -> Option<std::path::PathBuf> {
        Some(self.path(relative))
    }
}

/// Positional writer over a pre-sized partial file; disjoint chunks write without locking.
struct LocalWriter {
    file: std::sync::Arc<std::fs::File>,
    partial: std::path::PathBuf,
    path: std::path::PathBuf,
}

impl ChunkWriter for LocalWriter {
    fn write_at(&self, offset: u64, data: Vec<u8>) -> BoxFuture<'_, anyhow::Result<()>> {
        let file = self.file.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
                .await?
                .with_context(|| format!("failed writing {:?} at offset {}", &self.partial, offset))
        })
    }

    fn commit(
        &self,
        modified: Option<std::time::SystemTime>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let file = self.file.clone();
        let partial = self.partial.clone();
        let path = self.path.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                file.sync_all()?;
                if let Some(modified) = modified {
                    let mtime = filetime::FileTime::from_system_time(modified);
                    filetime::set_file_handle_times(&file, None, Some(mtime))?;
                }
                std::fs::rename(&partial, &path)?;
                Ok(())
            })
            .await?
            .with_context(|| format!("failed finalizing {:?}", &self.path))
        })
    }

    fn abort(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            match tokio::fs::remove_file(&self.partial).await {
                Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error)
                    .with_context(|| format!("cannot remove partial file {:?}", &self.partial)),
                _ => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::DirectoryTracker;
    use crate::testutils::random_bytes;

    #[tokio::test]
    async fn getter_reads_requested_range() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        tokio::fs::write(tmp_dir.path().join("f"), "0123456789").await?;
        let getter = LocalSource::new(tmp_dir.path()).getter(std::path::Path::new("f"))?;
        let mut body = getter.get(ByteRange::new(3, 4)).await?;
        let mut out = String::new();
        body.read_to_string(&mut out).await?;
        assert_eq!(out, "3456");
        Ok(())
    }

    #[tokio::test]
    async fn writer_assembles_out_of_order_chunks() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let destination = LocalDestination::new(tmp_dir.path());
        let tracker = std::sync::Arc::new(DirectoryTracker::new());
        let relative = std::path::Path::new("deep/dir/file.bin");
        let data = random_bytes(300);
        let writer = destination
            .open_writer(relative, data.len() as u64, tracker.clone())
            .await?;
        assert!(tracker.created_by_job(&tmp_dir.path().join("deep")));
        for chunk in ByteRange::new(0, 300).chunks(64).collect::<Vec<_>>().into_iter().rev() {
            let range = chunk.offset as usize..chunk.end() as usize;
            writer.write_at(chunk.offset, data[range].to_vec()).await?;
        }
        let modified = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(12345);
        writer.commit(Some(modified)).await?;
        let path = tmp_dir.path().join(relative);
        assert_eq!(tokio::fs::read(&path).await?, data);
        assert_eq!(
            destination.modified(relative).await?,
            Some(modified)
        );
        Ok(())
    }

    #[tokio::test]
    async fn abort_removes_partial_file() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let destination = LocalDestination::new(tmp_dir.path());
        let relative = std::path::Path::new("partial");
        let writer = destination
            .open_writer(relative, 10, std::sync::Arc::new(DirectoryTracker::new()))
            .await?;
        let partial = partial_path(&tmp_dir.path().join(relative));
        assert!(tokio::fs::try_exists(&partial).await?);
        writer.abort().await?;
        assert!(!tokio::fs::try_exists(&partial).await?);
        assert_eq!(destination.modified(relative).await?, None);
        // aborting twice is fine
        writer.abort().await?;
        Ok(())
    }

    #[tokio::test]
    async fn unfinished_writes_never_appear_at_the_destination() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let destination = LocalDestination::new(tmp_dir.path());
        let relative = std::path::Path::new("big.bin");
        let data = random_bytes(4096);
        let writer = destination
            .open_writer(relative, data.len() as u64, std::sync::Arc::new(DirectoryTracker::new()))
            .await?;
        writer.write_at(0, data[..1024].to_vec()).await?;
        // an interrupted run leaves only the partial file behind
        drop(writer);
        assert_eq!(destination.modified(relative).await?, None);
        let partial = partial_path(&tmp_dir.path().join(relative));
        assert_eq!(tokio::fs::metadata(&partial).await?.len(), 4096);
        // the rerun starts over and replaces the leftover
        let writer = destination
            .open_writer(relative, data.len() as u64, std::sync::Arc::new(DirectoryTracker::new()))
            .await?;
        writer.write_at(0, data.clone()).await?;
        assert_eq!(destination.modified(relative).await?, None);
        writer.commit(None).await?;
        assert_eq!(tokio::fs::read(tmp_dir.path().join(relative)).await?, data);
        assert!(!tokio::fs::try_exists(&partial).await?);
        Ok(())
    }

    #[test]
    fn partial_path_is_a_hidden_sibling() {
        assert_eq!(
            partial_path(std::path::Path::new("/dst/dir/file.bin")),
            std::path::PathBuf::from("/dst/dir/.file.bin.rxcp-part")
        );
    }
}
