//! Resumable reads over range requests.
//!
//! [`RetryReader`] presents the bytes `[offset, offset + count)` of a remote object as one
//! sequential stream. When the underlying response body dies mid-stream with a transient error the
//! reader drops it, asks the [`RangeGetter`] for a fresh body starting at the first byte the caller
//! has not seen yet, and carries on. The caller never observes a gap or a repeated byte.
//!
//! A supervisor (e.g. a stall watchdog) can abort the in-flight attempt from another task through a
//! [`ForceRetryHandle`]; unless the reader is configured to treat that as an error it reconnects
//! exactly as it would after a network failure.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::range::ByteRange;

pub type Body = std::pin::Pin<Box<dyn AsyncRead + Send>>;

/// Opens a fresh response body positioned at `range.offset`, yielding at most `range.count` bytes.
pub trait RangeGetter: Send + Sync {
    fn get(&self, range: ByteRange) -> BoxFuture<'static, std::io::Result<Body>>;
}

impl<F, Fut> RangeGetter for F
where
    F: Fn(ByteRange) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::io::Result<Body>> + Send + 'static,
{
    fn get(&self, range: ByteRange) -> BoxFuture<'static, std::io::Result<Body>> {
        Box::pin(self(range))
    }
}

/// The in-flight read was aborted through a [`ForceRetryHandle`].
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("read on response body closed by caller")]
pub struct ClosedByCaller;

/// The job owning the reader was cancelled.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("transfer job was cancelled")]
pub struct JobCancelled;

/// Marker for temporary network conditions (DNS hiccups, resets surfaced by an HTTP client, ...)
/// that range getters attach so the reader knows the failure is worth retrying.
#[derive(Debug, thiserror::Error)]
#[error("temporary network error: {message}")]
pub struct TransientNetworkError {
    message: String,
}

impl TransientNetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<TransientNetworkError> for std::io::Error {
    fn from(error: TransientNetworkError) -> Self {
        std::io::Error::other(error)
    }
}

fn wraps<T: std::error::Error + 'static>(error: &std::io::Error) -> bool {
    error.get_ref().is_some_and(|inner| inner.is::<T>())
}

#[must_use]
pub fn is_closed_by_caller(error: &std::io::Error) -> bool {
    wraps::<ClosedByCaller>(error)
}

#[must_use]
pub fn is_job_cancelled(error: &std::io::Error) -> bool {
    wraps::<JobCancelled>(error)
}

/// Whether `error` is a transport condition that a new range request can recover from.
#[must_use]
pub fn is_transient(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::NotConnected
    ) || wraps::<TransientNetworkError>(error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    EarlyClose,
    Transient,
    Fatal,
}

fn classify(error: &std::io::Error) -> Failure {
    if is_closed_by_caller(error) {
        Failure::EarlyClose
    } else if is_job_cancelled(error) {
        Failure::Fatal
    } else if is_transient(error) {
        Failure::Transient
    } else {
        Failure::Fatal
    }
}

/// Details passed to the failed-read observer.
#[derive(Debug)]
pub struct FailedRead<'a> {
    /// Failed attempts so far over the reader's lifetime, starting at 1.
    pub failure_count: usize,
    pub error: &'a std::io::Error,
    /// Bytes not yet delivered when the attempt failed.
    pub remaining: ByteRange,
    pub will_retry: bool,
}

pub type FailedReadNotifier = std::sync::Arc<dyn Fn(&FailedRead<'_>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RetryReaderOptions {
    /// Reconnects allowed over the reader's lifetime.
    pub max_retry_count: usize,
    /// Surface a forced early close as a fatal error instead of reconnecting.
    pub treat_early_close_as_error: bool,
    /// Called once per failed attempt, retried or not; never on success.
    pub notify_failed_read: Option<FailedReadNotifier>,
}

impl std::fmt::Debug for RetryReaderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryReaderOptions")
            .field("max_retry_count", &self.max_retry_count)
            .field("treat_early_close_as_error", &self.treat_early_close_as_error)
            .field("notify_failed_read", &self.notify_failed_read.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct CloseSignal {
    requests: AtomicU64,
    notify: tokio::sync::Notify,
}

/// Aborts a reader's current attempt from any thread.
#[derive(Debug, Clone)]
pub struct ForceRetryHandle {
    signal: std::sync::Arc<CloseSignal>,
}

impl ForceRetryHandle {
    /// Closes the body the reader is currently reading from. A read in flight returns promptly
    /// with [`ClosedByCaller`]; if no read is in flight the next one does.
    pub fn close(&self) {
        self.signal.requests.fetch_add(1, Ordering::SeqCst);
        self.signal.notify.notify_waiters();
    }
}

pub struct RetryReader {
    ctx: CancellationToken,
    getter: std::sync::Arc<dyn RangeGetter>,
    body: Option<Body>,
    remaining: ByteRange,
    options: RetryReaderOptions,
    failures: usize,
    signal: std::sync::Arc<CloseSignal>,
    // close requests already accounted for by the current body
    seen_close_requests: u64,
}

impl std::fmt::Debug for RetryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryReader")
            .field("remaining", &self.remaining)
            .field("failures", &self.failures)
            .field("connected", &self.body.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl RetryReader {
    /// Creates a reader over `range`. `initial` is a body already opened at `range.offset`; when
    /// absent the getter is called on the first read.
    pub fn new(
        ctx: CancellationToken,
        initial: Option<Body>,
        range: ByteRange,
        options: RetryReaderOptions,
        getter: std::sync::Arc<dyn RangeGetter>,
    ) -> Self {
        Self {
            ctx,
            getter,
            // nothing will ever be read from the body of an empty range
            body: if range.is_empty() { None } else { initial },
            remaining: range,
            options,
            failures: 0,
            signal: std::sync::Arc::new(CloseSignal::default()),
            seen_close_requests: 0,
        }
    }

    #[must_use]
    pub fn force_retry_handle(&self) -> ForceRetryHandle {
        ForceRetryHandle {
            signal: self.signal.clone(),
        }
    }

    /// Bytes not yet delivered.
    #[must_use]
    pub fn remaining(&self) -> ByteRange {
        self.remaining
    }

    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Reads the next bytes of the range into `buf`.
    ///
    /// Returns `Ok(0)` once the whole range was delivered. Errors are the underlying transport
    /// error, never a wrapper, so callers may inspect their kind.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.remaining.is_empty() {
                self.body = None;
                return Ok(0);
            }
            if self.body.is_none() {
                self.seen_close_requests = self.signal.requests.load(Ordering::SeqCst);
                match open_body(
                    &self.ctx,
                    self.getter.as_ref(),
                    self.remaining,
                    &self.signal,
                    self.seen_close_requests,
                )
                .await
                {
                    Ok(body) => self.body = Some(body),
                    // a reconnect that hangs can be abandoned like a stalled body
                    Err(error) if is_closed_by_caller(&error) => {
                        self.record_failure(error)?;
                        continue;
                    }
                    Err(error) => return Err(error),
                }
            }
            let Some(body) = self.body.as_mut() else {
                continue;
            };
            let want = usize::try_from(self.remaining.count)
                .map_or(buf.len(), |count| count.min(buf.len()));
            let attempt = read_attempt(
                body,
                &self.signal,
                self.seen_close_requests,
                &self.ctx,
                &mut buf[..want],
            )
            .await;
            let error = match attempt {
                Ok(0) => std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "response body ended with {} bytes outstanding at offset {}",
                        self.remaining.count, self.remaining.offset
                    ),
                ),
                Ok(n) => {
                    self.remaining.advance(n as u64);
                    return Ok(n);
                }
                Err(error) => error,
            };
            // the broken body is never read again
            self.body = None;
            self.record_failure(error)?;
        }
    }

    /// Counts a failed attempt; returns the error back if it must not be retried.
    fn record_failure(&mut self, error: std::io::Error) -> std::io::Result<()> {
        self.failures += 1;
        let within_budget = self.failures <= self.options.max_retry_count;
        let will_retry = match classify(&error) {
            Failure::EarlyClose => !self.options.treat_early_close_as_error && within_budget,
            Failure::Transient => within_budget,
            Failure::Fatal => false,
        };
        if let Some(notify) = &self.options.notify_failed_read {
            notify(&FailedRead {
                failure_count: self.failures,
                error: &error,
                remaining: self.remaining,
                will_retry,
            });
        }
        if !will_retry {
            tracing::debug!(
                "read of {} failed after {} attempt(s): {:#}",
                self.remaining,
                self.failures,
                &error
            );
            return Err(error);
        }
        tracing::debug!(
            "retrying read of {} (failure {}/{}): {:#}",
            self.remaining,
            self.failures,
            self.options.max_retry_count,
            &error
        );
        Ok(())
    }

    /// Reads the rest of the range into `out`, returning the number of bytes appended.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> std::io::Result<usize> {
        let mut total = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }
}

async fn open_body(
    ctx: &CancellationToken,
    getter: &dyn RangeGetter,
    range: ByteRange,
    signal: &CloseSignal,
    seen_close_requests: u64,
) -> std::io::Result<Body> {
    let closed = signal.notify.notified();
    tokio::pin!(closed);
    closed.as_mut().enable();
    if signal.requests.load(Ordering::SeqCst) != seen_close_requests {
        return Err(std::io::Error::other(ClosedByCaller));
    }
    tokio::select! {
        biased;
        () = ctx.cancelled() => Err(std::io::Error::other(JobCancelled)),
        () = &mut closed => Err(std::io::Error::other(ClosedByCaller)),
        body = getter.get(range) => body,
    }
}

async fn read_attempt(
    body: &mut Body,
    signal: &CloseSignal,
    seen_close_requests: u64,
    ctx: &CancellationToken,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let closed = signal.notify.notified();
    tokio::pin!(closed);
    // register before checking the counter so a concurrent close can't slip in between
    closed.as_mut().enable();
    if signal.requests.load(Ordering::SeqCst) != seen_close_requests {
        return Err(std::io::Error::other(ClosedByCaller));
    }
    tokio::select! {
        biased;
        () = ctx.cancelled() => Err(std::io::Error::other(JobCancelled)),
        () = &mut closed => Err(std::io::Error::other(ClosedByCaller)),
        result = body.read(buf) => result,
    }
}
