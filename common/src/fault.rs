//! Deterministic fault injection for the transport layer.
//!
//! A [`FaultPlan`] scripts failures at absolute object offsets; a [`Blackout`] is a switch the
//! test flips to make every body fail until it's lifted. [`FaultInjector`] wraps any range getter
//! and threads both into the bodies it hands out, so the code under test sees ordinary transport
//! errors while the test keeps full control over when they happen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Poll, ready};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, ReadBuf};

use crate::range::ByteRange;
use crate::retry_reader::{Body, RangeGetter, TransientNetworkError};

type ErrorFactory = std::sync::Arc<dyn Fn() -> std::io::Error + Send + Sync>;

enum FaultKind {
    Error(ErrorFactory),
    /// Body reports end-of-data at this offset, as a truncated response would.
    EndEarly,
}

struct Fault {
    offset: u64,
    remaining: usize,
    kind: FaultKind,
}

/// Scripted read failures shared by every body created through one [`FaultInjector`].
#[derive(Clone, Default)]
pub struct FaultPlan {
    faults: std::sync::Arc<parking_lot::Mutex<Vec<Fault>>>,
    blackout: Blackout,
}

impl std::fmt::Debug for FaultPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultPlan")
            .field("pending", &self.pending())
            .field("blackout", &self.blackout.is_engaged())
            .finish()
    }
}

impl FaultPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `times` reads positioned at `offset` with an error from `make_error`.
    #[must_use]
    pub fn fail_at<F>(self, offset: u64, times: usize, make_error: F) -> Self
    where
        F: Fn() -> std::io::Error + Send + Sync + 'static,
    {
        self.faults.lock().push(Fault {
            offset,
            remaining: times,
            kind: FaultKind::Error(std::sync::Arc::new(make_error)),
        });
        self
    }

    /// Fails the next `times` reads at `offset` with a temporary network error.
    #[must_use]
    pub fn transient_at(self, offset: u64, times: usize) -> Self {
        self.fail_at(offset, times, || {
            TransientNetworkError::new("temporary failure in name resolution").into()
        })
    }

    /// Makes the next `times` bodies reaching `offset` end cleanly there.
    #[must_use]
    pub fn end_early_at(self, offset: u64, times: usize) -> Self {
        self.faults.lock().push(Fault {
            offset,
            remaining: times,
            kind: FaultKind::EndEarly,
        });
        self
    }

    #[must_use]
    pub fn with_blackout(mut self, blackout: Blackout) -> Self {
        self.blackout = blackout;
        self
    }

    #[must_use]
    pub fn blackout(&self) -> &Blackout {
        &self.blackout
    }

    /// Number of injections that have not fired yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.faults
            .lock()
            .iter()
            .map(|fault| fault.remaining)
            .fold(0, usize::saturating_add)
    }

    fn next_fault_after(&self, offset: u64) -> Option<u64> {
        self.faults
            .lock()
            .iter()
            .filter(|fault| fault.remaining > 0 && fault.offset > offset)
            .map(|fault| fault.offset)
            .min()
    }

    fn take(&self, offset: u64) -> Option<FaultKind> {
        let mut faults = self.faults.lock();
        let fault = faults
            .iter_mut()
            .find(|fault| fault.offset == offset && fault.remaining > 0)?;
        fault.remaining -= 1;
        Some(match &fault.kind {
            FaultKind::Error(make_error) => FaultKind::Error(make_error.clone()),
            FaultKind::EndEarly => FaultKind::EndEarly,
        })
    }
}

/// Caller-controlled network outage.
#[derive(Clone, Debug, Default)]
pub struct Blackout(std::sync::Arc<AtomicBool>);

impl Blackout {
    pub fn engage(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn lift(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Range getter decorator applying a [`FaultPlan`] to every body it returns.
pub struct FaultInjector {
    inner: std::sync::Arc<dyn RangeGetter>,
    plan: FaultPlan,
}

impl FaultInjector {
    pub fn new(inner: std::sync::Arc<dyn RangeGetter>, plan: FaultPlan) -> Self {
        Self { inner, plan }
    }
}

impl RangeGetter for FaultInjector {
    fn get(&self, range: ByteRange) -> BoxFuture<'static, std::io::Result<Body>> {
        let request = self.inner.get(range);
        let plan = self.plan.clone();
        Box::pin(async move {
            let inner = request.await?;
            Ok(Box::pin(FaultyBody {
                inner,
                position: range.offset,
                plan,
            }) as Body)
        })
    }
}

/// Body wrapper that consults the plan before every read.
pub struct FaultyBody {
    inner: Body,
    position: u64,
    plan: FaultPlan,
}

impl FaultyBody {
    pub fn new(inner: Body, start: u64, plan: FaultPlan) -> Self {
        Self {
            inner,
            position: start,
            plan,
        }
    }
}

impl AsyncRead for FaultyBody {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        if this.plan.blackout.is_engaged() {
            return Poll::Ready(Err(
                TransientNetworkError::new("simulated network blackout").into()
            ));
        }
        match this.plan.take(this.position) {
            Some(FaultKind::Error(make_error)) => return Poll::Ready(Err(make_error())),
            Some(FaultKind::EndEarly) => return Poll::Ready(Ok(())),
            None => {}
        }
        // never read across a pending injection point, or it would be skipped
        let limit = this.plan.next_fault_after(this.position).map_or(
            buf.remaining(),
            |next| usize::try_from(next - this.position).map_or(buf.remaining(), |gap| gap.min(buf.remaining())),
        );
        let mut scratch = vec![0u8; limit];
        let mut limited = ReadBuf::new(&mut scratch);
        ready!(this.inner.as_mut().poll_read(cx, &mut limited))?;
        buf.put_slice(limited.filled());
        this.position += limited.filled().len() as u64;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MemoryObject;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn injections_fire_the_requested_number_of_times() {
        let object = MemoryObject::new(b"abcdef".to_vec());
        let plan = FaultPlan::new().transient_at(2, 2);
        let getter = FaultInjector::new(std::sync::Arc::new(object), plan.clone());
        let mut body = getter.get(ByteRange::new(0, 6)).await.unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(body.read(&mut buf).await.unwrap(), 2);
        assert!(body.read(&mut buf).await.is_err());
        assert_eq!(plan.pending(), 1);
        let mut body = getter.get(ByteRange::new(2, 4)).await.unwrap();
        assert!(body.read(&mut buf).await.is_err());
        assert_eq!(plan.pending(), 0);
        let mut rest = Vec::new();
        body.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"cdef");
    }

    #[tokio::test]
    async fn blackout_fails_reads_until_lifted() {
        let object = MemoryObject::new(b"xyz".to_vec());
        let blackout = Blackout::default();
        let plan = FaultPlan::new().with_blackout(blackout.clone());
        let getter = FaultInjector::new(std::sync::Arc::new(object), plan);
        blackout.engage();
        let mut body = getter.get(ByteRange::new(0, 3)).await.unwrap();
        let mut buf = [0u8; 3];
        let error = body.read(&mut buf).await.unwrap_err();
        assert!(crate::retry_reader::is_transient(&error));
        blackout.lift();
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"xyz");
    }

    #[tokio::test]
    async fn end_early_truncates_the_body() {
        let object = MemoryObject::new(b"0123456789".to_vec());
        let plan = FaultPlan::new().end_early_at(4, 1);
        let getter = FaultInjector::new(std::sync::Arc::new(object), plan);
        let mut body = getter.get(ByteRange::new(0, 10)).await.unwrap();
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123");
    }
}
