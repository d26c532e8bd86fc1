//! Chunked execution of transfers.
//!
//! [`schedule`] splits a file into fixed-size [`Chunk`]s and submits each to the shared
//! [`WorkerPool`]. Every chunk reads its own sub-range through a [`RetryReader`] and writes it at
//! its own offset, so chunks of one file need no ordering between them. Whichever chunk finishes
//! last runs the epilogue: commit (or clean up) the destination and settle the transfer.
//!
//! Once a transfer has failed or the job was cancelled no further chunks are dispatched for it;
//! chunks already running are left to finish.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use tracing::instrument;

use crate::endpoint::ChunkWriter;
use crate::folder;
use crate::local;
use crate::overwrite::OverwritePolicy;
use crate::pool::WorkerPool;
use crate::progress;
use crate::range::ByteRange;
use crate::retry_reader::{
    FailedRead, FailedReadNotifier, ForceRetryHandle, RangeGetter, RetryReader,
    RetryReaderOptions, is_job_cancelled,
};
use crate::transfer::{EntityType, Transfer, TransferId, TransferStatus};

// most bytes a chunk holds in memory between reading and writing
const COPY_BUFFER_SIZE: u64 = 1 << 20;

/// One sub-range of a file transfer; the unit of work executed by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub transfer: TransferId,
    pub range: ByteRange,
    pub index: u64,
}

/// State shared by the chunks of one file.
struct FileTransfer {
    transfer: std::sync::Arc<Transfer>,
    getter: std::sync::Arc<dyn RangeGetter>,
    writer: std::sync::Arc<dyn ChunkWriter>,
}

/// Forces a reconnect of a reader that delivered nothing for a whole `timeout`.
struct StallWatchdog {
    task: tokio::task::JoinHandle<()>,
}

impl StallWatchdog {
    fn start(
        timeout: std::time::Duration,
        handle: ForceRetryHandle,
        delivered: std::sync::Arc<AtomicU64>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(timeout);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            let mut last = delivered.load(Ordering::Relaxed);
            loop {
                interval.tick().await;
                let current = delivered.load(Ordering::Relaxed);
                if current == last {
                    tracing::warn!(
                        "no data received for {:?} after {} bytes, forcing a reconnect",
                        timeout,
                        current
                    );
                    handle.close();
                }
                last = current;
            }
        });
        Self { task }
    }
}

impl Drop for StallWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs `transfer` to a terminal status: folders directly, files as chunks on `pool`.
#[instrument(skip_all, fields(transfer = %transfer.id(), relative = ?transfer.info().relative))]
pub async fn schedule(transfer: std::sync::Arc<Transfer>, pool: WorkerPool) {
    if transfer.ctx().is_cancelled() {
        transfer.finish_early(TransferStatus::Cancelled, None);
        return;
    }
    throttle::get_transfer_token().await;
    match transfer.info().entity {
        EntityType::Folder => folder::transfer_folder(transfer).await,
        EntityType::File => schedule_file(transfer, pool).await,
    }
}

async fn overwrite_allowed(transfer: &std::sync::Arc<Transfer>) -> anyhow::Result<bool> {
    let template = transfer.template().clone();
    let info = transfer.info().clone();
    let Some(existing) = template
        .destination
        .modified(&info.relative)
        .await
        .with_context(|| {
            format!(
                "cannot check destination {}",
                template.destination.describe(&info.relative)
            )
        })?
    else {
        return Ok(true);
    };
    let policy = template.config.overwrite;
    let decide = move || {
        policy.should_overwrite_file(
            &info.relative,
            info.source_modified,
            existing,
            template.prompter.as_ref(),
        )
    };
    if policy == OverwritePolicy::Prompt {
        // prompters may block on user input
        Ok(tokio::task::spawn_blocking(decide).await?)
    } else {
        Ok(decide())
    }
}

async fn schedule_file(transfer: std::sync::Arc<Transfer>, pool: WorkerPool) {
    match overwrite_allowed(&transfer).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("destination exists, skipping");
            transfer.finish_early(TransferStatus::SkippedExists, None);
            return;
        }
        Err(error) => {
            tracing::error!("{:#}", &error);
            transfer.finish_early(TransferStatus::Failed, Some(error));
            return;
        }
    }
    let template = transfer.template().clone();
    let relative = transfer.info().relative.clone();
    let size = transfer.info().size;
    if template.config.fast_copy {
        let local_paths = template
            .source
            .local_path(&relative)
            .zip(template.destination.local_path(&relative));
        if let Some((from, to)) = local_paths {
            fast_copy(transfer, from, to).await;
            return;
        }
    }
    let getter = match template.source.getter(&relative) {
        Ok(getter) => getter,
        Err(error) => {
            tracing::error!("cannot read {}: {:#}", template.source.describe(&relative), &error);
            transfer.finish_early(TransferStatus::Failed, Some(error));
            return;
        }
    };
    let writer = match template
        .destination
        .open_writer(&relative, size, template.tracker.clone())
        .await
    {
        Ok(writer) => writer,
        Err(error) => {
            tracing::error!(
                "cannot open {}: {:#}",
                template.destination.describe(&relative),
                &error
            );
            transfer.finish_early(TransferStatus::Failed, Some(error));
            return;
        }
    };
    let range = ByteRange::new(0, size);
    let num_chunks = range.num_chunks(template.config.chunk_size);
    tracing::debug!("transferring {} bytes in {} chunks", size, num_chunks);
    transfer.begin(num_chunks);
    let file = std::sync::Arc::new(FileTransfer {
        transfer: transfer.clone(),
        getter,
        writer,
    });
    if num_chunks == 0 {
        finish(&file).await;
        return;
    }
    for (index, chunk_range) in (0u64..).zip(range.chunks(template.config.chunk_size)) {
        let undispatched = num_chunks - index;
        if transfer.ctx().is_cancelled() || transfer.has_failed() {
            if transfer.ctx().is_cancelled() {
                transfer.mark_cancelled();
            }
            tracing::debug!("dropping {} undispatched chunks", undispatched);
            if transfer.chunks_finished(undispatched) {
                finish(&file).await;
            }
            return;
        }
        let chunk = Chunk {
            transfer: transfer.id(),
            range: chunk_range,
            index,
        };
        if let Err(error) = pool.submit(run_chunk(file.clone(), chunk)) {
            transfer.fail(anyhow::Error::from(error).context("cannot dispatch chunks"));
            if transfer.chunks_finished(undispatched) {
                finish(&file).await;
            }
            return;
        }
    }
}

async fn run_chunk(file: std::sync::Arc<FileTransfer>, chunk: Chunk) {
    let transfer = &file.transfer;
    let prog = progress::get_progress();
    if transfer.ctx().is_cancelled() {
        transfer.mark_cancelled();
    } else if !transfer.has_failed() {
        match copy_chunk(&file, chunk).await {
            Ok(()) => prog.chunks_completed.inc(),
            Err(error) => {
                prog.chunks_failed.inc();
                let cancelled = error
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(is_job_cancelled);
                if cancelled || transfer.ctx().is_cancelled() {
                    tracing::debug!("chunk {} of {} cancelled", chunk.index, chunk.transfer);
                    transfer.mark_cancelled();
                } else {
                    tracing::error!(
                        "chunk {} {} of {} failed: {:#}",
                        chunk.index,
                        chunk.range,
                        chunk.transfer,
                        &error
                    );
                    transfer.fail(error);
                }
            }
        }
    }
    if transfer.chunks_finished(1) {
        finish(&file).await;
    }
}

async fn copy_chunk(file: &FileTransfer, chunk: Chunk) -> anyhow::Result<()> {
    let transfer = &file.transfer;
    let config = &transfer.template().config;
    let unit = if config.chunk_size == 0 {
        chunk.range.count
    } else {
        config.chunk_size
    };
    throttle::get_chunk_tokens(unit, chunk.range.count).await;
    let notify: FailedReadNotifier = std::sync::Arc::new(move |failed: &FailedRead<'_>| {
        if failed.will_retry {
            progress::get_progress().retries.inc();
        }
        tracing::debug!(
            "chunk {} of {}: read failure {} with {} left ({}): {:#}",
            chunk.index,
            chunk.transfer,
            failed.failure_count,
            failed.remaining,
            if failed.will_retry { "reconnecting" } else { "giving up" },
            failed.error
        );
    });
    let mut reader = RetryReader::new(
        transfer.ctx().clone(),
        None,
        chunk.range,
        RetryReaderOptions {
            max_retry_count: config.max_retry_count,
            treat_early_close_as_error: config.treat_early_close_as_error,
            notify_failed_read: Some(notify),
        },
        file.getter.clone(),
    );
    let delivered = std::sync::Arc::new(AtomicU64::new(0));
    let _watchdog = config.stall_timeout.map(|timeout| {
        StallWatchdog::start(timeout, reader.force_retry_handle(), delivered.clone())
    });
    let mut buffer = vec![0u8; usize::try_from(chunk.range.count.min(COPY_BUFFER_SIZE))?];
    let mut written = 0u64;
    while written < chunk.range.count {
        let want = usize::try_from(chunk.range.count - written)
            .map_or(buffer.len(), |left| left.min(buffer.len()));
        let mut filled = 0;
        while filled < want {
            let read = reader
                .read(&mut buffer[filled..want])
                .await
                .with_context(|| {
                    format!(
                        "failed reading {} of {}",
                        reader.remaining(),
                        transfer.template().source.describe(&transfer.info().relative)
                    )
                })?;
            anyhow::ensure!(read > 0, "source ended early in {}", chunk.range);
            filled += read;
            delivered.fetch_add(read as u64, Ordering::Relaxed);
        }
        let offset = chunk.range.offset + written;
        file.writer
            .write_at(offset, buffer[..filled].to_vec())
            .await
            .with_context(|| {
                format!(
                    "failed writing {} of {}",
                    ByteRange::new(offset, filled as u64),
                    transfer
                        .template()
                        .destination
                        .describe(&transfer.info().relative)
                )
            })?;
        written += filled as u64;
        progress::get_progress().bytes_transferred.add(filled as u64);
    }
    transfer.add_bytes(chunk.range.count);
    Ok(())
}

/// Epilogue, run once after the last chunk of a file finished.
async fn finish(file: &FileTransfer) {
    let transfer = &file.transfer;
    if !transfer.has_failed() && !transfer.is_cancelled() {
        let modified = if transfer.template().config.preserve_mtime {
            transfer.info().source_modified
        } else {
            None
        };
        if let Err(error) = file.writer.commit(modified).await {
            tracing::error!("cannot finalize destination: {:#}", &error);
            transfer.fail(error);
        }
    }
    if (transfer.has_failed() || transfer.is_cancelled())
        && let Err(error) = file.writer.abort().await
    {
        tracing::warn!("cannot clean up destination: {:#}", &error);
    }
    transfer.complete();
}

async fn fast_copy(
    transfer: std::sync::Arc<Transfer>,
    from: std::path::PathBuf,
    to: std::path::PathBuf,
) {
    transfer.begin(1);
    let template = transfer.template().clone();
    let prog = progress::get_progress();
    let partial = local::partial_path(&to);
    let copied = async {
        if let Some(parent) = to.parent() {
            let tracker = template.tracker.clone();
            let parent = parent.to_path_buf();
            tokio::task::spawn_blocking(move || tracker.create_if_absent(&parent)).await??;
        }
        let copied = template.copy_strategy.copy(&from, &partial).await?;
        if let Some(modified) = transfer.info().source_modified
            && template.config.preserve_mtime
        {
            filetime::set_file_mtime(&partial, filetime::FileTime::from_system_time(modified))
                .with_context(|| format!("cannot set modification time of {:?}", &partial))?;
        }
        tokio::fs::rename(&partial, &to)
            .await
            .with_context(|| format!("cannot move {:?} into place", &to))?;
        anyhow::Ok(copied)
    }
    .await;
    match copied {
        Ok(copied) => {
            tracing::debug!("copied {} bytes with {:?}", copied, template.copy_strategy);
            transfer.add_bytes(copied);
            prog.bytes_transferred.add(copied);
            prog.chunks_completed.inc();
        }
        Err(error) => {
            tracing::error!("copying {:?} to {:?} failed: {:#}", &from, &to, &error);
            prog.chunks_failed.inc();
            transfer.fail(error);
            if let Err(error) = tokio::fs::remove_file(&partial).await
                && error.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!("cannot remove partial file {:?}: {}", &partial, &error);
            }
        }
    }
    if transfer.chunks_finished(1) {
        transfer.complete();
    }
}
