//! Resumable transfer engine shared by the rxfer tools
//!
//! This crate moves large numbers of objects between a source and a destination over links that
//! are expected to fail. It is organised bottom-up:
//!
//! - [`retry_reader`]: a byte stream over `[offset, offset + count)` of a remote object that
//!   survives connection failures by re-issuing range requests from the first undelivered byte
//! - [`chunk`]: splits an object into fixed-size chunks and runs them on the shared
//!   [`pool::WorkerPool`]
//! - [`transfer`]: per-object state machine; the chunk that finishes last decides the outcome
//! - [`job`]: groups transfers into parts, decides part and job completion, and resumes a job by
//!   consulting the statuses persisted in a [`store::StatusStore`]
//!
//! Endpoints ([`endpoint::Source`], [`endpoint::Destination`]) abstract where bytes come from and
//! go to; [`local`] and [`http`] provide the implementations used by the command line tools.
//!
//! # Failure handling
//!
//! Transient transport errors are recovered inside the [`retry_reader::RetryReader`] and never
//! reach the transfer unless the retry budget runs out. Anything else fails the chunk, which fails
//! its transfer; other transfers and the job keep going. Only a job-level cancellation stops
//! everything.
//!
//! # Running
//!
//! Binaries call [`run`], which builds the tokio runtime, installs logging, starts the throttles
//! and optional progress reporting, runs the async main and prints its summary.

use std::io::IsTerminal;

pub mod chunk;
pub mod config;
pub mod endpoint;
pub mod fastcopy;
pub mod fault;
pub mod folder;
pub mod http;
pub mod job;
pub mod local;
pub mod overwrite;
pub mod pool;
pub mod progress;
pub mod range;
pub mod retry_reader;
pub mod store;
pub mod transfer;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, TransferConfig};
pub use job::{CompletionSink, Job, JobId, JobSummary, JobTemplate};
pub use overwrite::OverwritePolicy;
pub use range::ByteRange;
pub use retry_reader::{RangeGetter, RetryReader, RetryReaderOptions};
pub use transfer::{EntityType, TransferInfo, TransferReport, TransferStatus};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar on a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    #[value(alias = "ProgressBar")]
    ProgressBar,
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    fn resolve(&self) -> (ProgressType, std::time::Duration) {
        let progress_type = match self.progress_type {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        };
        let default_delay = match progress_type {
            ProgressType::ProgressBar => std::time::Duration::from_millis(200),
            _ => std::time::Duration::from_secs(10),
        };
        let delay = match self.progress_delay.as_deref().map(humantime::parse_duration) {
            Some(Ok(delay)) if !delay.is_zero() => delay,
            Some(Ok(_)) => default_delay,
            Some(Err(error)) => {
                tracing::warn!("invalid progress delay, using {:?}: {}", default_delay, error);
                default_delay
            }
            None => default_delay,
        };
        (progress_type, delay)
    }
}

async fn show_progress(settings: ProgressSettings, stop: tokio_util::sync::CancellationToken) {
    let (progress_type, delay) = settings.resolve();
    let mut printer = progress::ProgressPrinter::new(progress::get_progress());
    let bar = (progress_type == ProgressType::ProgressBar).then(|| {
        let bar = indicatif::ProgressBar::new_spinner();
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        bar
    });
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        match &bar {
            Some(bar) => {
                bar.set_message(printer.short());
                bar.tick();
            }
            None => match printer.print() {
                Ok(text) => eprintln!("{text}"),
                Err(error) => tracing::error!("failed rendering progress: {:#}", &error),
            },
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

fn init_tracing(output: &OutputConfig) {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logging: {error}");
    }
}

fn start_throttle(tokens_per_second: usize, init: fn(usize)) -> Option<(usize, std::time::Duration)> {
    if tokens_per_second == 0 {
        return None;
    }
    // replenish in tenths of a second when the rate allows it, for a smoother flow
    let (replenish, interval) = if tokens_per_second >= 10 {
        (tokens_per_second / 10, std::time::Duration::from_millis(100))
    } else {
        (tokens_per_second, std::time::Duration::from_secs(1))
    };
    init(replenish);
    Some((replenish, interval))
}

/// Runs `func` on a freshly built runtime. Returns `None` (after reporting the error) if
/// configuration is invalid or `func` fails.
pub fn run<Fut, Summary>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    if let Err(error) = throttle.validate() {
        if !output.quiet {
            eprintln!("{error}");
        }
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the runtime: {error}");
            }
            return None;
        }
    };
    let start = std::time::Instant::now();
    let res = tokio_runtime.block_on(async move {
        if let Some((replenish, interval)) =
            start_throttle(throttle.transfer_throttle, ::throttle::init_transfer_tokens)
        {
            tokio::spawn(::throttle::run_transfer_replenish_thread(replenish, interval));
        }
        if let Some((replenish, interval)) =
            start_throttle(throttle.chunk_iops_throttle, ::throttle::init_chunk_tokens)
        {
            tokio::spawn(::throttle::run_chunk_replenish_thread(replenish, interval));
        }
        let stop = tokio_util::sync::CancellationToken::new();
        let progress_task = progress.map(|settings| tokio::spawn(show_progress(settings, stop.clone())));
        let res = func().await;
        stop.cancel();
        if let Some(progress_task) = progress_task
            && let Err(error) = progress_task.await
        {
            tracing::error!("progress reporting failed: {}", &error);
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
                println!("walltime: {:.2?}", start.elapsed());
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
