//! Job and part coordination.
//!
//! A job is an ordered sequence of transfers fed by an enumerator through
//! [`Job::enqueue_transfer`]. Transfers are numbered in enqueue order and grouped into parts of
//! [`TransferConfig::transfers_per_part`]; the numbering is what makes resumption work: a re-run
//! that enumerates the same objects in the same order produces the same `(job, part, index)` keys
//! and finds their persisted statuses in the [`StatusStore`].
//!
//! All bookkeeping lives in a single driver task fed by a channel, so part and job completion are
//! decided in one place without locks:
//!
//! - a part is done once it is sealed (full, or enumeration completed) and every transfer in it is
//!   terminal
//! - the job is done once enumeration completed and every part is done
//!
//! The store is flushed whenever a part or the job completes.

use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::endpoint::{Destination, Source};
use crate::fastcopy::CopyStrategy;
use crate::folder::{DirectoryTracker, FolderCreationTracker};
use crate::overwrite::{DeclineAll, OverwritePrompter};
use crate::pool::WorkerPool;
use crate::progress;
use crate::store::StatusStore;
use crate::transfer::{
    Transfer, TransferId, TransferInfo, TransferObserver, TransferReport, TransferStatus,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// Settings shared by every transfer of a job.
pub struct JobTemplate {
    pub source: std::sync::Arc<dyn Source>,
    pub destination: std::sync::Arc<dyn Destination>,
    pub config: TransferConfig,
    pub tracker: std::sync::Arc<dyn FolderCreationTracker>,
    pub prompter: std::sync::Arc<dyn OverwritePrompter>,
    pub copy_strategy: CopyStrategy,
    /// Opaque reference to the credential the endpoints authenticate with.
    pub credential: Option<String>,
}

impl std::fmt::Debug for JobTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTemplate")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("config", &self.config)
            .field("copy_strategy", &self.copy_strategy)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl JobTemplate {
    pub fn new(
        source: std::sync::Arc<dyn Source>,
        destination: std::sync::Arc<dyn Destination>,
        config: TransferConfig,
    ) -> Self {
        Self {
            source,
            destination,
            config,
            tracker: std::sync::Arc::new(DirectoryTracker::new()),
            prompter: std::sync::Arc::new(DeclineAll),
            copy_strategy: CopyStrategy::detect(),
            credential: None,
        }
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: std::sync::Arc<dyn FolderCreationTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    #[must_use]
    pub fn with_prompter(mut self, prompter: std::sync::Arc<dyn OverwritePrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    #[must_use]
    pub fn with_copy_strategy(mut self, copy_strategy: CopyStrategy) -> Self {
        self.copy_strategy = copy_strategy;
        self
    }

    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// Receives job events. `transfer_done` is called exactly once per enqueued transfer.
pub trait CompletionSink: Send + Sync {
    fn transfer_done(&self, report: &TransferReport);

    /// Called once per part, before its first transfer starts and at the latest right before
    /// [`CompletionSink::part_done`].
    fn part_started(&self, _job: JobId, _part: u32) {}

    fn part_done(&self, _job: JobId, _part: u32) {}

    fn job_done(&self, _summary: &JobSummary) {}
}

/// Sink for callers that only care about the final summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl CompletionSink for DiscardSink {
    fn transfer_done(&self, _report: &TransferReport) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransfer {
    pub relative: std::path::PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub transfers_completed: usize,
    pub transfers_failed: usize,
    pub transfers_skipped: usize,
    pub transfers_cancelled: usize,
    /// Transfers a previous run already finished; no bytes were moved for them.
    pub transfers_resumed: usize,
    pub parts: u32,
    pub bytes_transferred: u64,
    pub failures: Vec<FailedTransfer>,
}

impl JobSummary {
    fn add(&mut self, report: &TransferReport) {
        self.bytes_transferred += report.bytes;
        match report.status {
            TransferStatus::Completed => self.transfers_completed += 1,
            TransferStatus::SkippedExists => self.transfers_skipped += 1,
            TransferStatus::Cancelled => self.transfers_cancelled += 1,
            TransferStatus::Failed => {
                self.transfers_failed += 1;
                self.failures.push(FailedTransfer {
                    relative: report.relative.clone(),
                    error: report
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }
            TransferStatus::Queued | TransferStatus::InProgress => {
                unreachable!("transfer {} reported as {:?}", report.id, report.status)
            }
        }
    }

    #[must_use]
    pub fn transfers(&self) -> usize {
        self.transfers_completed
            + self.transfers_failed
            + self.transfers_skipped
            + self.transfers_cancelled
            + self.transfers_resumed
    }

    /// Nothing failed and nothing was left undone.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.transfers_failed == 0 && self.transfers_cancelled == 0
    }
}

impl std::fmt::Display for JobSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            transfers completed: {}\n\
            transfers skipped (destination exists): {}\n\
            transfers resumed (done by a previous run): {}\n\
            transfers cancelled: {}\n\
            transfers failed: {}\n\
            job parts: {}",
            bytesize::ByteSize(self.bytes_transferred),
            self.transfers_completed,
            self.transfers_skipped,
            self.transfers_resumed,
            self.transfers_cancelled,
            self.transfers_failed,
            self.parts,
        )?;
        for failure in &self.failures {
            write!(f, "\n  {:?}: {}", &failure.relative, &failure.error)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Event {
    Enqueued(TransferId),
    EnumerationComplete,
    Started(TransferId),
    Finished(TransferReport),
    Resumed(TransferReport),
}

/// Forwards transfer state changes to the driver.
struct EventObserver {
    events: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl TransferObserver for EventObserver {
    fn transfer_started(&self, id: TransferId) {
        let _ = self.events.send(Event::Started(id));
    }

    fn transfer_finished(&self, report: TransferReport) {
        let _ = self.events.send(Event::Finished(report));
    }
}

#[derive(Debug, Default)]
struct PartState {
    enqueued: u32,
    terminal: u32,
    sealed: bool,
    started: bool,
    done: bool,
}

struct Driver {
    id: JobId,
    transfers_per_part: u32,
    store: std::sync::Arc<dyn StatusStore>,
    sink: std::sync::Arc<dyn CompletionSink>,
    parts: std::collections::BTreeMap<u32, PartState>,
    enumeration_complete: bool,
    summary: JobSummary,
}

impl Driver {
    fn part(&mut self, part: u32) -> &mut PartState {
        self.parts.entry(part).or_default()
    }

    fn start_part(&mut self, part: u32) {
        let state = self.part(part);
        if !state.started {
            state.started = true;
            tracing::debug!("job {} part {} started", self.id, part);
            self.sink.part_started(self.id, part);
        }
    }

    fn on_terminal(&mut self, report: &TransferReport) {
        self.store
            .record(&report.id, &report.relative, report.status);
        self.sink.transfer_done(report);
        self.part(report.id.part).terminal += 1;
    }

    /// Settles every part that became done. Returns true once the whole job is.
    async fn settle(&mut self) -> bool {
        let ready: Vec<u32> = self
            .parts
            .iter()
            .filter(|(_, state)| !state.done && state.sealed && state.terminal == state.enqueued)
            .map(|(&part, _)| part)
            .collect();
        for part in ready {
            self.start_part(part);
            self.part(part).done = true;
            self.summary.parts += 1;
            if let Err(error) = self.store.flush().await {
                tracing::error!("cannot persist status of job {} part {}: {:#}", self.id, part, &error);
            }
            tracing::info!("job {} part {} done", self.id, part);
            self.sink.part_done(self.id, part);
        }
        self.enumeration_complete && self.parts.values().all(|state| state.done)
    }

    async fn run(mut self, mut events: tokio::sync::mpsc::UnboundedReceiver<Event>) -> JobSummary {
        while let Some(event) = events.recv().await {
            match event {
                Event::Enqueued(id) => {
                    let per_part = self.transfers_per_part;
                    let state = self.part(id.part);
                    state.enqueued += 1;
                    state.sealed = state.enqueued == per_part;
                }
                Event::EnumerationComplete => {
                    self.enumeration_complete = true;
                    if let Some((_, last)) = self.parts.iter_mut().next_back() {
                        last.sealed = true;
                    }
                }
                Event::Started(id) => self.start_part(id.part),
                Event::Finished(report) => {
                    self.summary.add(&report);
                    self.on_terminal(&report);
                }
                Event::Resumed(report) => {
                    self.summary.transfers_resumed += 1;
                    progress::get_progress().transfers_resumed.inc();
                    self.on_terminal(&report);
                }
            }
            if self.settle().await {
                break;
            }
        }
        if let Err(error) = self.store.flush().await {
            tracing::error!("cannot persist status of job {}: {:#}", self.id, &error);
        }
        tracing::info!("job {} done: {} transfers", self.id, self.summary.transfers());
        self.sink.job_done(&self.summary);
        self.summary
    }
}

struct Dispatcher {
    template: std::sync::Arc<JobTemplate>,
    ctx: CancellationToken,
    pool: WorkerPool,
    store: std::sync::Arc<dyn StatusStore>,
    active: std::sync::Arc<tokio::sync::Semaphore>,
    events: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl Dispatcher {
    /// Starts transfers in enqueue order, at most `max_active_transfers` at a time.
    async fn run(
        self,
        mut queue: tokio::sync::mpsc::Receiver<(TransferId, TransferInfo)>,
    ) {
        let observer: std::sync::Arc<dyn TransferObserver> = std::sync::Arc::new(EventObserver {
            events: self.events.clone(),
        });
        while let Some((id, info)) = queue.recv().await {
            if let Some(status) = self
                .store
                .load(&id, &info.relative)
                .filter(|status| status.is_done())
            {
                tracing::debug!("{} {:?} already {}, skipping", id, &info.relative, status);
                let _ = self.events.send(Event::Resumed(TransferReport {
                    id,
                    relative: info.relative,
                    entity: info.entity,
                    status,
                    bytes: 0,
                    error: None,
                }));
                continue;
            }
            let transfer = Transfer::new(
                id,
                info,
                self.template.clone(),
                self.ctx.clone(),
                observer.clone(),
            );
            let permit = tokio::select! {
                permit = self.active.clone().acquire_owned() => permit.ok(),
                () = self.ctx.cancelled() => None,
            };
            let Some(permit) = permit else {
                transfer.finish_early(TransferStatus::Cancelled, None);
                continue;
            };
            transfer.hold_permit(permit);
            tokio::spawn(crate::chunk::schedule(transfer, self.pool.clone()));
        }
        tracing::debug!("all transfers dispatched");
    }
}

/// Handle to a running job.
pub struct Job {
    id: JobId,
    template: std::sync::Arc<JobTemplate>,
    ctx: CancellationToken,
    transfers_per_part: u32,
    enqueued: std::sync::atomic::AtomicU64,
    events: tokio::sync::mpsc::UnboundedSender<Event>,
    queue: parking_lot::Mutex<Option<tokio::sync::mpsc::Sender<(TransferId, TransferInfo)>>>,
    done: tokio::sync::watch::Receiver<Option<JobSummary>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field(
                "enqueued",
                &self.enqueued.load(std::sync::atomic::Ordering::Relaxed),
            )
            .field("cancelled", &self.ctx.is_cancelled())
            .finish()
    }
}

impl Job {
    /// Starts the job's driver on the current runtime. Transfers run on `pool`, which may be
    /// shared with other jobs.
    pub fn start(
        id: JobId,
        template: JobTemplate,
        pool: WorkerPool,
        store: std::sync::Arc<dyn StatusStore>,
        sink: std::sync::Arc<dyn CompletionSink>,
    ) -> Self {
        let template = std::sync::Arc::new(template);
        let ctx = CancellationToken::new();
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        // enumeration runs at most this far ahead of dispatch
        let (queue_tx, queue_rx) =
            tokio::sync::mpsc::channel(template.config.max_active_transfers.max(1));
        let (done_tx, done_rx) = tokio::sync::watch::channel(None);
        let driver = Driver {
            id,
            transfers_per_part: template.config.transfers_per_part,
            store: store.clone(),
            sink,
            parts: Default::default(),
            enumeration_complete: false,
            summary: Default::default(),
        };
        tokio::spawn(async move {
            let summary = driver.run(events_rx).await;
            let _ = done_tx.send(Some(summary));
        });
        let dispatcher = Dispatcher {
            template: template.clone(),
            ctx: ctx.clone(),
            pool,
            store,
            active: std::sync::Arc::new(tokio::sync::Semaphore::new(
                template.config.max_active_transfers,
            )),
            events: events_tx.clone(),
        };
        tokio::spawn(dispatcher.run(queue_rx));
        tracing::info!("job {} started", id);
        Self {
            id,
            transfers_per_part: template.config.transfers_per_part,
            template,
            ctx,
            enqueued: std::sync::atomic::AtomicU64::new(0),
            events: events_tx,
            queue: parking_lot::Mutex::new(Some(queue_tx)),
            done: done_rx,
        }
    }

    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    #[must_use]
    pub fn template(&self) -> &std::sync::Arc<JobTemplate> {
        &self.template
    }

    /// Adds the next object of the enumeration. Its outcome is reported through the
    /// [`CompletionSink`].
    ///
    /// Waits while `max_active_transfers` enqueued transfers are still waiting to be dispatched.
    pub async fn enqueue_transfer(&self, info: TransferInfo) {
        let Some(queue) = self.queue.lock().clone() else {
            panic!("job {}: transfer enqueued after enumeration completed", self.id);
        };
        let Ok(slot) = queue.reserve().await else {
            tracing::error!("job {}: dispatcher stopped, dropping {:?}", self.id, &info.relative);
            return;
        };
        // numbering and the driver notification happen under the lock so that they stay in
        // enqueue order and precede the end of enumeration
        let queue = self.queue.lock();
        if queue.is_none() {
            panic!("job {}: transfer enqueued after enumeration completed", self.id);
        }
        let sequence = self
            .enqueued
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let per_part = u64::from(self.transfers_per_part);
        let (Ok(part), Ok(index)) = (
            u32::try_from(sequence / per_part),
            u32::try_from(sequence % per_part),
        ) else {
            panic!("job {}: too many transfers", self.id);
        };
        let id = TransferId {
            job: self.id,
            part,
            index,
        };
        // the driver must learn about the transfer before anything can finish it
        let _ = self.events.send(Event::Enqueued(id));
        slot.send((id, info));
    }

    /// No more transfers will be enqueued; the last part is sealed.
    pub fn complete_enumeration(&self) {
        if self.queue.lock().take().is_some() {
            tracing::debug!(
                "job {} enumeration complete: {} transfers",
                self.id,
                self.enqueued.load(std::sync::atomic::Ordering::Relaxed)
            );
            let _ = self.events.send(Event::EnumerationComplete);
        }
    }

    /// Transfers not started yet end up cancelled; running chunks stop at their next read.
    pub fn cancel(&self) {
        tracing::info!("cancelling job {}", self.id);
        self.ctx.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    /// Waits until every part is done. Requires [`Job::complete_enumeration`] to be called.
    pub async fn wait(&self) -> anyhow::Result<JobSummary> {
        let mut done = self.done.clone();
        let summary = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow::anyhow!("job {} driver stopped unexpectedly", self.id))?;
        summary
            .clone()
            .ok_or_else(|| anyhow::anyhow!("job {} finished without a summary", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStatusStore;
    use crate::testutils::{MemoryDestination, MemoryObject, MemorySource, random_bytes};
    use tracing_test::traced_test;

    #[derive(Debug, Default)]
    struct RecordingSink {
        transfers: parking_lot::Mutex<Vec<TransferReport>>,
        parts: parking_lot::Mutex<Vec<String>>,
        jobs: std::sync::atomic::AtomicUsize,
    }

    impl CompletionSink for RecordingSink {
        fn transfer_done(&self, report: &TransferReport) {
            self.transfers.lock().push(report.clone());
        }

        fn part_started(&self, _job: JobId, part: u32) {
            self.parts.lock().push(format!("start {part}"));
        }

        fn part_done(&self, _job: JobId, part: u32) {
            self.parts.lock().push(format!("done {part}"));
        }

        fn job_done(&self, _summary: &JobSummary) {
            self.jobs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn fixture(count: usize, size: usize) -> (MemorySource, Vec<TransferInfo>) {
        let mut source = MemorySource::new();
        let mut transfers = Vec::new();
        for i in 0..count {
            let name = format!("obj{i:03}");
            source = source.with_object(&name, MemoryObject::new(random_bytes(size)));
            transfers.push(TransferInfo::file(name, size as u64));
        }
        (source, transfers)
    }

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 100,
            transfers_per_part: 4,
            max_active_transfers: 3,
            max_retry_count: 2,
            ..Default::default()
        }
    }

    async fn run_job(
        id: JobId,
        source: &MemorySource,
        destination: &MemoryDestination,
        transfers: &[TransferInfo],
        store: std::sync::Arc<dyn StatusStore>,
        sink: std::sync::Arc<RecordingSink>,
    ) -> JobSummary {
        let template = JobTemplate::new(
            std::sync::Arc::new(source.clone()),
            std::sync::Arc::new(destination.clone()),
            config(),
        );
        let pool = WorkerPool::new(4);
        let job = Job::start(id, template, pool.clone(), store, sink);
        for info in transfers {
            job.enqueue_transfer(info.clone()).await;
        }
        job.complete_enumeration();
        let summary = job.wait().await.unwrap();
        pool.shutdown().await;
        summary
    }

    fn assert_copied(source: &MemorySource, destination: &MemoryDestination, transfers: &[TransferInfo]) {
        for info in transfers {
            let name = info.relative.to_str().unwrap();
            assert_eq!(
                destination.contents(name).unwrap(),
                source.object(name).data()
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[traced_test]
    async fn all_parts_complete() {
        let (source, transfers) = fixture(10, 250);
        let destination = MemoryDestination::new();
        let sink = std::sync::Arc::new(RecordingSink::default());
        let store = std::sync::Arc::new(MemoryStatusStore::new());
        let summary = run_job(
            JobId::new(),
            &source,
            &destination,
            &transfers,
            store.clone(),
            sink.clone(),
        )
        .await;
        assert_eq!(summary.transfers_completed, 10);
        assert_eq!(summary.parts, 3);
        assert_eq!(summary.bytes_transferred, 2500);
        assert!(summary.is_success());
        assert_eq!(sink.transfers.lock().len(), 10);
        assert_eq!(sink.jobs.load(std::sync::atomic::Ordering::SeqCst), 1);
        let parts = sink.parts.lock();
        for part in 0..3 {
            let started = parts.iter().position(|e| *e == format!("start {part}"));
            let done = parts.iter().position(|e| *e == format!("done {part}"));
            assert!(started.unwrap() < done.unwrap(), "{parts:?}");
        }
        assert_copied(&source, &destination, &transfers);
        assert_eq!(store.len(), 10);
        // every part and the job itself
        assert!(store.flushes() >= 4);
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_job_completes() {
        let sink = std::sync::Arc::new(RecordingSink::default());
        let summary = run_job(
            JobId::new(),
            &MemorySource::new(),
            &MemoryDestination::new(),
            &[],
            std::sync::Arc::new(MemoryStatusStore::new()),
            sink.clone(),
        )
        .await;
        assert_eq!(summary, JobSummary::default());
        assert_eq!(sink.jobs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_are_summarized() {
        let (source, mut transfers) = fixture(3, 300);
        transfers[1] = TransferInfo::file("missing", 300);
        let summary = run_job(
            JobId::new(),
            &source,
            &MemoryDestination::new(),
            &transfers,
            std::sync::Arc::new(MemoryStatusStore::new()),
            std::sync::Arc::new(RecordingSink::default()),
        )
        .await;
        assert_eq!(summary.transfers_completed, 2);
        assert_eq!(summary.transfers_failed, 1);
        assert!(!summary.is_success());
        assert_eq!(summary.failures[0].relative, std::path::Path::new("missing"));
        let rendered = summary.to_string();
        assert!(rendered.contains("transfers failed: 1"), "{rendered}");
        assert!(rendered.contains("no such object"), "{rendered}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[traced_test]
    async fn resumed_job_skips_finished_transfers() {
        let (source, transfers) = fixture(6, 200);
        let destination = MemoryDestination::new();
        let id = JobId::new();
        let store = std::sync::Arc::new(MemoryStatusStore::new());
        // the first run cannot find the last object
        let partial = transfers[..5].iter().fold(MemorySource::new(), |partial, info| {
            let name = info.relative.to_str().unwrap();
            partial.with_object(name, source.object(name).clone())
        });
        let summary = run_job(
            id,
            &partial,
            &destination,
            &transfers,
            store.clone(),
            std::sync::Arc::new(RecordingSink::default()),
        )
        .await;
        assert_eq!(summary.transfers_failed, 1);
        assert_eq!(summary.transfers_completed, 5);
        let gets_before = source.total_gets();
        let opens_before = destination.opens();
        let sink = std::sync::Arc::new(RecordingSink::default());
        let summary = run_job(
            id,
            &source,
            &destination,
            &transfers,
            store.clone(),
            sink.clone(),
        )
        .await;
        assert_eq!(summary.transfers_resumed, 5);
        assert_eq!(summary.transfers_completed, 1);
        assert_eq!(summary.bytes_transferred, 200);
        assert!(summary.is_success());
        // resumed transfers are still reported, once each
        assert_eq!(sink.transfers.lock().len(), 6);
        // only the failed object was read and written again
        assert_eq!(destination.opens(), opens_before + 1);
        assert_eq!(source.total_gets() - gets_before, 2);
        assert_copied(&source, &destination, &transfers);
    }

    #[tokio::test]
    #[traced_test]
    async fn changed_enumeration_is_not_resumed() {
        let (source, transfers) = fixture(2, 50);
        let id = JobId::new();
        let store = std::sync::Arc::new(MemoryStatusStore::new());
        store.record(
            &TransferId {
                job: id,
                part: 0,
                index: 0,
            },
            std::path::Path::new("something-else"),
            TransferStatus::Completed,
        );
        let summary = run_job(
            id,
            &source,
            &MemoryDestination::new(),
            &transfers,
            store,
            std::sync::Arc::new(RecordingSink::default()),
        )
        .await;
        assert_eq!(summary.transfers_resumed, 0);
        assert_eq!(summary.transfers_completed, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn cancelled_job_reports_every_transfer() {
        let (source, transfers) = fixture(8, 100);
        let destination = MemoryDestination::new();
        let sink = std::sync::Arc::new(RecordingSink::default());
        let template = JobTemplate::new(
            std::sync::Arc::new(source),
            std::sync::Arc::new(destination.clone()),
            config(),
        );
        let pool = WorkerPool::new(2);
        let job = Job::start(
            JobId::new(),
            template,
            pool.clone(),
            std::sync::Arc::new(MemoryStatusStore::new()),
            sink.clone(),
        );
        job.cancel();
        for info in transfers {
            job.enqueue_transfer(info).await;
        }
        job.complete_enumeration();
        let summary = job.wait().await.unwrap();
        pool.shutdown().await;
        assert!(job.is_cancelled());
        assert_eq!(summary.transfers_cancelled, 8);
        assert_eq!(sink.transfers.lock().len(), 8);
        assert_eq!(destination.opens(), 0);
        assert!(!summary.is_success());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn enumeration_waits_for_dispatch() {
        let mut source = MemorySource::new();
        let mut transfers = Vec::new();
        for i in 0..10 {
            let name = format!("slow{i}");
            let object = MemoryObject::new(random_bytes(10))
                .with_read_delay(std::time::Duration::from_secs(3600));
            source = source.with_object(&name, object);
            transfers.push(TransferInfo::file(name, 10));
        }
        let template = JobTemplate::new(
            std::sync::Arc::new(source),
            std::sync::Arc::new(MemoryDestination::new()),
            TransferConfig {
                max_active_transfers: 1,
                ..config()
            },
        );
        let pool = WorkerPool::new(2);
        let job = Job::start(
            JobId::new(),
            template,
            pool.clone(),
            std::sync::Arc::new(MemoryStatusStore::new()),
            std::sync::Arc::new(RecordingSink::default()),
        );
        let mut accepted = 0;
        for info in &transfers {
            let enqueue = job.enqueue_transfer(info.clone());
            if tokio::time::timeout(std::time::Duration::from_secs(1), enqueue)
                .await
                .is_err()
            {
                break;
            }
            accepted += 1;
        }
        // one running, one waiting for a permit, one queued
        assert!((1..=3).contains(&accepted), "{accepted} transfers accepted");
        job.cancel();
        job.complete_enumeration();
        let summary = job.wait().await.unwrap();
        pool.shutdown().await;
        assert_eq!(summary.transfers(), accepted);
        assert!(!summary.is_success());
    }

    #[test]
    fn job_ids_round_trip_through_strings() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
