use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Poll, ready};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, ReadBuf};

use crate::endpoint::{ChunkWriter, Destination, Source};
use crate::fault::{FaultInjector, FaultPlan};
use crate::folder::FolderCreationTracker;
use crate::range::ByteRange;
use crate::retry_reader::{Body, RangeGetter};

pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// In-memory remote object. Every `get` opens a fresh body and is counted.
#[derive(Clone)]
pub struct MemoryObject {
    data: std::sync::Arc<Vec<u8>>,
    gets: std::sync::Arc<AtomicUsize>,
    max_read: Option<usize>,
    read_delay: Option<std::time::Duration>,
}

impl std::fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObject")
            .field("len", &self.data.len())
            .field("gets", &self.get_count())
            .finish()
    }
}

impl MemoryObject {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: std::sync::Arc::new(data),
            gets: Default::default(),
            max_read: None,
            read_delay: None,
        }
    }

    /// Caps how many bytes a single body read returns.
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = Some(max_read);
        self
    }

    /// Makes every body read wait before returning data.
    pub fn with_read_delay(mut self, delay: std::time::Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

impl RangeGetter for MemoryObject {
    fn get(&self, range: ByteRange) -> BoxFuture<'static, std::io::Result<Body>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let body = if range.end() > self.data.len() as u64 {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "range {} is outside of a {} byte object",
                    range,
                    self.data.len()
                ),
            ))
        } else {
            Ok(Box::pin(MemoryBody {
                data: self.data.clone(),
                position: range.offset as usize,
                end: range.end() as usize,
                max_read: self.max_read,
                read_delay: self.read_delay,
                sleep: None,
            }) as Body)
        };
        Box::pin(async move { body })
    }
}

struct MemoryBody {
    data: std::sync::Arc<Vec<u8>>,
    position: usize,
    end: usize,
    max_read: Option<usize>,
    read_delay: Option<std::time::Duration>,
    sleep: Option<std::pin::Pin<Box<tokio::time::Sleep>>>,
}

impl AsyncRead for MemoryBody {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        let pending_data = this.position < this.end;
        if let Some(delay) = this.read_delay.filter(|_| pending_data) {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
            ready!(std::future::Future::poll(sleep.as_mut(), cx));
            this.sleep = None;
        }
        let mut len = std::cmp::min(this.end - this.position, buf.remaining());
        if let Some(max_read) = this.max_read {
            len = std::cmp::min(len, max_read);
        }
        buf.put_slice(&this.data[this.position..this.position + len]);
        this.position += len;
        Poll::Ready(Ok(()))
    }
}

/// Source serving in-memory objects, optionally through a [`FaultPlan`].
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    objects: std::collections::HashMap<std::path::PathBuf, MemoryObject>,
    faults: Option<FaultPlan>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, relative: &str, object: MemoryObject) -> Self {
        self.objects.insert(relative.into(), object);
        self
    }

    pub fn with_faults(mut self, plan: FaultPlan) -> Self {
        self.faults = Some(plan);
        self
    }

    pub fn object(&self, relative: &str) -> &MemoryObject {
        &self.objects[std::path::Path::new(relative)]
    }

    pub fn total_gets(&self) -> usize {
        self.objects.values().map(MemoryObject::get_count).sum()
    }
}

impl Source for MemorySource {
    fn getter(
        &self,
        relative: &std::path::Path,
    ) -> anyhow::Result<std::sync::Arc<dyn RangeGetter>> {
        let object = self
            .objects
            .get(relative)
            .ok_or_else(|| anyhow::anyhow!("no such object: {:?}", relative))?
            .clone();
        Ok(match &self.faults {
            Some(plan) => std::sync::Arc::new(FaultInjector::new(
                std::sync::Arc::new(object),
                plan.clone(),
            )),
            None => std::sync::Arc::new(object),
        })
    }

    fn describe(&self, relative: &std::path::Path) -> String {
        format!("memory://{}", relative.display())
    }
}

#[derive(Debug, Default)]
struct MemoryFile {
    data: Vec<u8>,
    modified: Option<std::time::SystemTime>,
    committed: bool,
}

#[derive(Debug, Default)]
struct DestinationState {
    files: std::collections::HashMap<std::path::PathBuf, MemoryFile>,
    opens: usize,
    writes: usize,
}

/// Destination keeping objects in memory and counting opens and writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    state: std::sync::Arc<parking_lot::Mutex<DestinationState>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates an already committed object.
    pub fn with_existing(self, relative: &str, data: &[u8], modified: std::time::SystemTime) -> Self {
        self.state.lock().files.insert(
            relative.into(),
            MemoryFile {
                data: data.to_vec(),
                modified: Some(modified),
                committed: true,
            },
        );
        self
    }

    pub fn contents(&self, relative: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(std::path::Path::new(relative))
            .map(|file| file.data.clone())
    }

    pub fn is_committed(&self, relative: &str) -> bool {
        self.state
            .lock()
            .files
            .get(std::path::Path::new(relative))
            .is_some_and(|file| file.committed)
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }
}

impl Destination for MemoryDestination {
    fn modified(
        &self,
        relative: &std::path::Path,
    ) -> BoxFuture<'_, anyhow::Result<Option<std::time::SystemTime>>> {
        let modified = self.state.lock().files.get(relative).map(|file| {
            file.modified.unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });
        Box::pin(async move { Ok(modified) })
    }

    fn open_writer<'a>(
        &'a self,
        relative: &'a std::path::Path,
        size: u64,
        _tracker: std::sync::Arc<dyn FolderCreationTracker>,
    ) -> BoxFuture<'a, anyhow::Result<std::sync::Arc<dyn ChunkWriter>>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.opens += 1;
            state.files.insert(
                relative.to_owned(),
                MemoryFile {
                    data: vec![0; usize::try_from(size)?],
                    modified: None,
                    committed: false,
                },
            );
            Ok(std::sync::Arc::new(MemoryWriter {
                state: self.state.clone(),
                relative: relative.to_owned(),
            }) as std::sync::Arc<dyn ChunkWriter>)
        })
    }

    fn describe(&self, relative: &std::path::Path) -> String {
        format!("memory://{}", relative.display())
    }
}

struct MemoryWriter {
    state: std::sync::Arc<parking_lot::Mutex<DestinationState>>,
    relative: std::path::PathBuf,
}

impl ChunkWriter for MemoryWriter {
    fn write_at(&self, offset: u64, data: Vec<u8>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.writes += 1;
            let file = state
                .files
                .get_mut(&self.relative)
                .ok_or_else(|| anyhow::anyhow!("{:?} was removed", &self.relative))?;
            let start = usize::try_from(offset)?;
            anyhow::ensure!(
                start + data.len() <= file.data.len(),
                "write past the end of {:?}",
                &self.relative
            );
            file.data[start..start + data.len()].copy_from_slice(&data);
            Ok(())
        })
    }

    fn commit(
        &self,
        modified: Option<std::time::SystemTime>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let file = state
                .files
                .get_mut(&self.relative)
                .ok_or_else(|| anyhow::anyhow!("{:?} was removed", &self.relative))?;
            file.committed = true;
            file.modified = modified.or(Some(std::time::SystemTime::now()));
            Ok(())
        })
    }

    fn abort(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.state.lock().files.remove(&self.relative);
            Ok(())
        })
    }
}
