use tracing::{Level, event, instrument};

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<parking_lot::Mutex<u64>>,
}

impl TlsCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| parking_lot::Mutex::new(0));
        *mutex.lock() += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| x + *y.lock())
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: TlsCounter::new(),
            finished: TlsCounter::new(),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Process-wide transfer counters.
pub struct Progress {
    /// Transfers that entered in-progress, and how many of those have finished.
    pub ops: ProgressCounter,
    pub bytes_transferred: TlsCounter,
    pub chunks_completed: TlsCounter,
    pub chunks_failed: TlsCounter,
    pub retries: TlsCounter,
    pub transfers_completed: TlsCounter,
    pub transfers_failed: TlsCounter,
    pub transfers_skipped: TlsCounter,
    pub transfers_cancelled: TlsCounter,
    pub transfers_resumed: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Default::default(),
            bytes_transferred: Default::default(),
            chunks_completed: Default::default(),
            chunks_failed: Default::default(),
            retries: Default::default(),
            transfers_completed: Default::default(),
            transfers_failed: Default::default(),
            transfers_skipped: Default::default(),
            transfers_cancelled: Default::default(),
            transfers_resumed: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

static PROGRESS: std::sync::LazyLock<Progress> = std::sync::LazyLock::new(Progress::new);

pub fn get_progress() -> &'static Progress {
    &PROGRESS
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_ops: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_ops: progress.ops.get().finished,
            last_bytes: progress.bytes_transferred.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let ops = self.progress.ops.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_ops_rate = ops.finished as f64 / total_duration_secs;
        let current_ops_rate = (ops.finished - self.last_ops) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_transferred.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = (bytes - self.last_bytes) as f64 / curr_duration_secs;
        // update self
        self.last_ops = ops.finished;
        self.last_bytes = bytes;
        self.last_update = time_now;
        Ok(format!(
            "---------------------\n\
            TRANSFERS:\n\
            in flight: {:>10}\n\
            average:   {:>10.2} items/s\n\
            current:   {:>10.2} items/s\n\
            -----------------------\n\
            BYTES:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            -----------------------\n\
            CHUNKS:\n\
            completed: {:>10}\n\
            failed:    {:>10}\n\
            retries:   {:>10}\n\
            -----------------------\n\
            OUTCOMES:\n\
            completed: {:>10}\n\
            failed:    {:>10}\n\
            skipped:   {:>10}\n\
            cancelled: {:>10}\n\
            resumed:   {:>10}",
            ops.started - ops.finished,
            average_ops_rate,
            current_ops_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.chunks_completed.get(),
            self.progress.chunks_failed.get(),
            self.progress.retries.get(),
            self.progress.transfers_completed.get(),
            self.progress.transfers_failed.get(),
            self.progress.transfers_skipped.get(),
            self.progress.transfers_cancelled.get(),
            self.progress.transfers_resumed.get(),
        ))
    }

    /// One-line variant for the progress bar message.
    pub fn short(&self) -> String {
        let ops = self.progress.ops.get();
        format!(
            "in flight: {} | done: {} | failed: {} | {} transferred | {} retries",
            ops.started - ops.finished,
            self.progress.transfers_completed.get() + self.progress.transfers_skipped.get(),
            self.progress.transfers_failed.get(),
            bytesize::ByteSize(self.progress.bytes_transferred.get()),
            self.progress.retries.get(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn guard_counts_finished_on_drop() -> Result<()> {
        let counter = ProgressCounter::new();
        {
            let _guard = counter.guard();
            let status = counter.get();
            assert_eq!((status.started, status.finished), (1, 0));
        }
        let status = counter.get();
        assert_eq!((status.started, status.finished), (1, 1));
        Ok(())
    }

    #[test]
    fn printer_reports_totals() -> Result<()> {
        let progress = Progress::new();
        progress.bytes_transferred.add(2048);
        progress.retries.add(3);
        progress.transfers_failed.inc();
        let mut printer = ProgressPrinter::new(&progress);
        let text = printer.print()?;
        assert!(text.contains("2.0 KiB"), "{text}");
        assert!(printer.short().contains("3 retries"));
        Ok(())
    }
}
