//! Per-object transfer state.
//!
//! A [`Transfer`] is mutated concurrently by the chunks that move its bytes. Chunks record
//! failures and byte counts, then decrement the outstanding-chunk counter; the chunk that takes the
//! counter to zero is the only one allowed to run the completion epilogue, and the final status is
//! reported upwards exactly once.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::job::{JobId, JobTemplate};
use crate::progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TransferStatus {
    Queued = 0,
    InProgress = 1,
    Completed = 2,
    Failed = 3,
    SkippedExists = 4,
    Cancelled = 5,
}

impl TransferStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::InProgress,
            2 => Self::Completed,
            3 => Self::Failed,
            4 => Self::SkippedExists,
            5 => Self::Cancelled,
            _ => unreachable!("invalid transfer status: {value}"),
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress)
    }

    /// Terminal states a resumed job does not need to revisit.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::SkippedExists)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::InProgress => "in progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::SkippedExists => "skipped (destination exists)",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EntityType {
    File,
    Folder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TransferId {
    pub job: JobId,
    pub part: u32,
    pub index: u32,
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.job, self.part, self.index)
    }
}

/// What the enumerator knows about one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    /// Path relative to both the source and the destination root.
    pub relative: std::path::PathBuf,
    pub entity: EntityType,
    pub size: u64,
    pub source_modified: Option<std::time::SystemTime>,
}

impl TransferInfo {
    pub fn file(relative: impl Into<std::path::PathBuf>, size: u64) -> Self {
        Self {
            relative: relative.into(),
            entity: EntityType::File,
            size,
            source_modified: None,
        }
    }

    pub fn folder(relative: impl Into<std::path::PathBuf>) -> Self {
        Self {
            relative: relative.into(),
            entity: EntityType::Folder,
            size: 0,
            source_modified: None,
        }
    }

    #[must_use]
    pub fn modified(mut self, modified: std::time::SystemTime) -> Self {
        self.source_modified = Some(modified);
        self
    }
}

/// Final outcome of a transfer, handed to the observer exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub id: TransferId,
    pub relative: std::path::PathBuf,
    pub entity: EntityType,
    pub status: TransferStatus,
    pub bytes: u64,
    pub error: Option<String>,
}

pub trait TransferObserver: Send + Sync {
    /// The transfer moved to [`TransferStatus::InProgress`].
    fn transfer_started(&self, _id: TransferId) {}

    fn transfer_finished(&self, report: TransferReport);
}

pub struct Transfer {
    id: TransferId,
    info: TransferInfo,
    template: std::sync::Arc<JobTemplate>,
    ctx: CancellationToken,
    observer: std::sync::Arc<dyn TransferObserver>,
    status: AtomicU8,
    outstanding_chunks: AtomicU64,
    failed: AtomicBool,
    cancelled: AtomicBool,
    skipped: AtomicBool,
    last_error: parking_lot::Mutex<Option<anyhow::Error>>,
    bytes: AtomicU64,
    reported: AtomicBool,
    // released once the outcome is reported
    permit: parking_lot::Mutex<Option<tokio::sync::OwnedSemaphorePermit>>,
    progress_guard: parking_lot::Mutex<Option<progress::ProgressGuard<'static>>>,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("relative", &self.info.relative)
            .field("status", &self.status())
            .field(
                "outstanding_chunks",
                &self.outstanding_chunks.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Transfer {
    pub fn new(
        id: TransferId,
        info: TransferInfo,
        template: std::sync::Arc<JobTemplate>,
        ctx: CancellationToken,
        observer: std::sync::Arc<dyn TransferObserver>,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            id,
            info,
            template,
            ctx,
            observer,
            status: AtomicU8::new(TransferStatus::Queued as u8),
            outstanding_chunks: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
            last_error: parking_lot::Mutex::new(None),
            bytes: AtomicU64::new(0),
            reported: AtomicBool::new(false),
            permit: parking_lot::Mutex::new(None),
            progress_guard: parking_lot::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> TransferId {
        self.id
    }

    #[must_use]
    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    #[must_use]
    pub fn template(&self) -> &std::sync::Arc<JobTemplate> {
        &self.template
    }

    #[must_use]
    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    #[must_use]
    pub fn status(&self) -> TransferStatus {
        TransferStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    /// Ties a concurrency permit to this transfer; it is released when the outcome is reported.
    pub fn hold_permit(&self, permit: tokio::sync::OwnedSemaphorePermit) {
        *self.permit.lock() = Some(permit);
    }

    fn transition(&self, allowed_from: &[TransferStatus], to: TransferStatus) {
        let result = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                allowed_from
                    .contains(&TransferStatus::from_u8(current))
                    .then_some(to as u8)
            });
        if let Err(current) = result {
            panic!(
                "transfer {} cannot move from {:?} to {:?}",
                self.id,
                TransferStatus::from_u8(current),
                to
            );
        }
    }

    /// Moves the transfer to in-progress with `num_chunks` chunks outstanding.
    pub fn begin(&self, num_chunks: u64) {
        self.transition(&[TransferStatus::Queued], TransferStatus::InProgress);
        self.outstanding_chunks.store(num_chunks, Ordering::Release);
        *self.progress_guard.lock() = Some(progress::get_progress().ops.guard());
        self.observer.transfer_started(self.id);
    }

    /// Ends a transfer that never started; used for cancellation, overwrite skips and setup
    /// failures.
    pub fn finish_early(&self, status: TransferStatus, error: Option<anyhow::Error>) {
        assert!(
            status.is_terminal(),
            "transfer {} cannot finish as {:?}",
            self.id,
            status
        );
        if let Some(error) = error {
            self.failed.store(true, Ordering::Release);
            *self.last_error.lock() = Some(error);
        }
        self.transition(&[TransferStatus::Queued], status);
        self.report(status);
    }

    /// Records a fatal chunk failure. The transfer ends [`TransferStatus::Failed`] once its last
    /// outstanding chunk finishes.
    pub fn fail(&self, error: anyhow::Error) {
        self.failed.store(true, Ordering::Release);
        *self.last_error.lock() = Some(error);
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// The destination already had this object and must not be touched.
    pub fn mark_skipped(&self) {
        self.skipped.store(true, Ordering::Release);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Marks `count` chunks as finished (successfully or not). Returns true for exactly one
    /// caller: the one whose decrement reached zero, which must then run the epilogue.
    pub fn chunks_finished(&self, count: u64) -> bool {
        assert_eq!(
            self.status(),
            TransferStatus::InProgress,
            "chunks finished for transfer {} which is not in progress",
            self.id
        );
        let previous = self.outstanding_chunks.fetch_sub(count, Ordering::AcqRel);
        assert!(
            previous >= count,
            "transfer {} finished {} chunks with only {} outstanding",
            self.id,
            count,
            previous
        );
        previous == count
    }

    /// Decides and reports the final status. Called once, after the last chunk finished.
    pub fn complete(&self) -> TransferStatus {
        assert_eq!(
            self.outstanding_chunks.load(Ordering::Acquire),
            0,
            "transfer {} completed with chunks outstanding",
            self.id
        );
        let status = if self.has_failed() {
            TransferStatus::Failed
        } else if self.is_cancelled() {
            TransferStatus::Cancelled
        } else if self.skipped.load(Ordering::Acquire) {
            TransferStatus::SkippedExists
        } else {
            TransferStatus::Completed
        };
        self.transition(&[TransferStatus::InProgress], status);
        self.report(status);
        status
    }

    fn report(&self, status: TransferStatus) {
        let already_reported = self.reported.swap(true, Ordering::AcqRel);
        assert!(
            !already_reported,
            "transfer {} reported more than once",
            self.id
        );
        let error = self
            .last_error
            .lock()
            .take()
            .map(|error| format!("{error:#}"));
        let prog = progress::get_progress();
        match status {
            TransferStatus::Completed => prog.transfers_completed.inc(),
            TransferStatus::Failed => prog.transfers_failed.inc(),
            TransferStatus::SkippedExists => prog.transfers_skipped.inc(),
            TransferStatus::Cancelled => prog.transfers_cancelled.inc(),
            TransferStatus::Queued | TransferStatus::InProgress => {}
        }
        match &error {
            Some(error) => tracing::debug!(
                "transfer {} of {:?} finished: {}: {}",
                self.id,
                &self.info.relative,
                status,
                error
            ),
            None => tracing::debug!(
                "transfer {} of {:?} finished: {}",
                self.id,
                &self.info.relative,
                status
            ),
        }
        self.observer.transfer_finished(TransferReport {
            id: self.id,
            relative: self.info.relative.clone(),
            entity: self.info.entity,
            status,
            bytes: self.bytes(),
            error,
        });
        self.progress_guard.lock().take();
        self.permit.lock().take();
    }
}
