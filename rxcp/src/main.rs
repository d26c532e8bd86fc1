use anyhow::{Context, Result, anyhow};
use async_recursion::async_recursion;
use clap::Parser;
use common::store::{JsonStatusStore, MemoryStatusStore, StatusStore};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rxcp",
    version,
    about = "Copy large object sets reliably - chunked, retrying and resumable",
    long_about = "`rxcp` copies a file, a directory tree or an HTTP object, splitting every object into chunks
that are fetched with range requests and retried from the first missing byte when the connection
fails.

EXAMPLE:
    # Copy a tree, keeping a plan so that an interrupted run can be resumed
    rxcp /data/src /data/dst --plan-dir /var/tmp/rxcp --progress --summary

    # Continue the job above after an interruption
    rxcp /data/src /data/dst --plan-dir /var/tmp/rxcp --resume <JOB-ID>

    # Download a single object
    rxcp https://example.com/images/disk.img /data/ --max-retries 20 --stall-timeout 30s"
)]
struct Args {
    // Transfer options
    /// Size of the byte ranges objects are split into, 0 copies every object as one chunk
    #[arg(
        long,
        default_value = "8MiB",
        value_name = "SIZE",
        help_heading = "Transfer options"
    )]
    chunk_size: bytesize::ByteSize,

    /// Number of chunks moved concurrently
    #[arg(
        long,
        default_value = "32",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    workers: usize,

    /// Number of transfers grouped into one job part
    #[arg(
        long,
        default_value = "10000",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    transfers_per_part: u32,

    /// Number of objects being transferred at the same time, bounds the open files
    #[arg(
        long,
        default_value = "1024",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    max_active_transfers: usize,

    /// Reconnects a single chunk may make before its transfer fails
    #[arg(
        long,
        default_value = "5",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    max_retries: usize,

    /// Reconnect a chunk whose read made no progress for this long, e.g. "30s"
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Transfer options")]
    stall_timeout: Option<std::time::Duration>,

    /// Fail a stalled chunk instead of reconnecting it
    #[arg(long, requires = "stall_timeout", help_heading = "Transfer options")]
    fail_stalled: bool,

    /// What to do with objects already present at the destination
    #[arg(
        long,
        default_value = "always",
        value_name = "POLICY",
        help_heading = "Transfer options"
    )]
    overwrite: common::OverwritePolicy,

    /// Carry modification times over to the destination
    #[arg(long, help_heading = "Transfer options")]
    preserve: bool,

    /// Always use chunked transfers, even between two local paths
    #[arg(long, help_heading = "Transfer options")]
    no_fast_copy: bool,

    // Resumption
    /// Directory where the job plan is kept, required to resume a job later
    #[arg(long, value_name = "PATH", help_heading = "Resumption")]
    plan_dir: Option<std::path::PathBuf>,

    /// Run as the given job, skipping whatever its previous runs already finished
    ///
    /// The source must enumerate the same way it did before; transfers whose position or path
    /// changed are copied again.
    #[arg(
        long,
        value_name = "JOB-ID",
        requires = "plan_dir",
        help_heading = "Resumption"
    )]
    resume: Option<common::JobId>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Throttle the number of transfers started per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    transfer_throttle: usize,

    /// Throttle the number of chunks read per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source: a file, a directory or an http(s) URL of a single object
    #[arg()]
    src: String,

    /// Destination path; a trailing slash copies into it under the source's name
    #[arg()]
    dst: String,
}

impl Args {
    fn transfer_config(&self) -> common::TransferConfig {
        common::TransferConfig {
            chunk_size: self.chunk_size.as_u64(),
            pool_size: self.workers,
            transfers_per_part: self.transfers_per_part,
            max_active_transfers: self.max_active_transfers,
            max_retry_count: self.max_retries,
            treat_early_close_as_error: self.fail_stalled,
            stall_timeout: self.stall_timeout,
            overwrite: self.overwrite,
            preserve_mtime: self.preserve,
            fast_copy: !self.no_fast_copy,
        }
    }
}

/// What the job will enqueue once it is running.
enum Enumeration {
    Object(common::TransferInfo),
    Tree(std::path::PathBuf),
}

struct Endpoints {
    source: std::sync::Arc<dyn common::endpoint::Source>,
    destination: std::sync::Arc<dyn common::endpoint::Destination>,
    enumeration: Enumeration,
}

fn with_modified(info: common::TransferInfo, metadata: &std::fs::Metadata) -> common::TransferInfo {
    match metadata.modified() {
        Ok(modified) => info.modified(modified),
        Err(_) => info,
    }
}

/// A trailing slash means "copy into", under the source's name. Anything else is the target
/// itself, so that re-running a job writes to the same place.
fn destination_path(dst: &str, name: Option<&std::ffi::OsStr>) -> Result<std::path::PathBuf> {
    let dst_path = std::path::PathBuf::from(dst);
    if !dst.ends_with('/') {
        return Ok(dst_path);
    }
    let name = name.ok_or_else(|| {
        anyhow!(
            "cannot derive a name from the source, specify the full destination path instead of {:?}",
            dst
        )
    })?;
    Ok(dst_path.join(name))
}

async fn http_endpoints(args: &Args, url: reqwest::Url) -> Result<Endpoints> {
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build the HTTP client")?;
    let size = common::http::object_size(&client, &url).await?;
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(std::ffi::OsStr::new);
    let dst_path = destination_path(&args.dst, name)?;
    tracing::info!("downloading {} ({}) to {:?}", &url, bytesize::ByteSize(size), &dst_path);
    Ok(Endpoints {
        source: std::sync::Arc::new(common::http::HttpSource::new(client, url)),
        destination: std::sync::Arc::new(common::local::LocalDestination::new(dst_path)),
        enumeration: Enumeration::Object(common::TransferInfo::file("", size)),
    })
}

async fn local_endpoints(args: &Args) -> Result<Endpoints> {
    let src_path = std::path::PathBuf::from(&args.src);
    let metadata = tokio::fs::metadata(&src_path)
        .await
        .with_context(|| format!("cannot access source {:?}", &src_path))?;
    let dst_path = destination_path(&args.dst, src_path.file_name())?;
    let enumeration = if metadata.is_dir() {
        Enumeration::Tree(src_path.clone())
    } else if metadata.is_file() {
        Enumeration::Object(with_modified(
            common::TransferInfo::file("", metadata.len()),
            &metadata,
        ))
    } else {
        return Err(anyhow!("source {:?} is neither a file nor a directory", &src_path));
    };
    Ok(Endpoints {
        source: std::sync::Arc::new(common::local::LocalSource::new(src_path)),
        destination: std::sync::Arc::new(common::local::LocalDestination::new(dst_path)),
        enumeration,
    })
}

/// Enqueues everything under `root/relative` in name order, folders before their contents.
#[async_recursion]
async fn enqueue_tree(
    job: &common::Job,
    root: &std::path::Path,
    relative: &std::path::Path,
) -> Result<()> {
    let dir = root.join(relative);
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", &dir))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &dir))?
    {
        names.push(entry.file_name());
    }
    // sorted, so that every run numbers transfers the same way
    names.sort();
    for name in names {
        if job.is_cancelled() {
            return Err(anyhow!("enumeration of {:?} interrupted", &dir));
        }
        let child = relative.join(&name);
        let path = root.join(&child);
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", &path))?;
        if metadata.is_dir() {
            job.enqueue_transfer(with_modified(
                common::TransferInfo::folder(child.clone()),
                &metadata,
            ))
            .await;
            enqueue_tree(job, root, &child).await?;
        } else if metadata.is_file() {
            job.enqueue_transfer(with_modified(
                common::TransferInfo::file(child, metadata.len()),
                &metadata,
            ))
            .await;
        } else {
            tracing::warn!("skipping {:?}: not a regular file or directory", &path);
        }
    }
    Ok(())
}

async fn enqueue(job: &common::Job, enumeration: Enumeration) -> Result<()> {
    match enumeration {
        Enumeration::Object(info) => job.enqueue_transfer(info).await,
        Enumeration::Tree(root) => {
            let metadata = tokio::fs::metadata(&root)
                .await
                .with_context(|| format!("failed reading metadata from {:?}", &root))?;
            job.enqueue_transfer(with_modified(common::TransferInfo::folder(""), &metadata))
                .await;
            enqueue_tree(job, &root, std::path::Path::new("")).await?;
        }
    }
    Ok(())
}

static PROMPT_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn prompt_on_terminal(path: &std::path::Path, entity: common::EntityType) -> bool {
    let _guard = PROMPT_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let kind = match entity {
        common::EntityType::File => "file",
        common::EntityType::Folder => "folder",
    };
    eprint!("overwrite {} {:?}? [y/N] ", kind, path);
    let mut answer = String::new();
    match std::io::stdin().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Err(error) => {
            tracing::warn!("cannot read the answer, not overwriting {:?}: {}", path, &error);
            false
        }
    }
}

#[instrument(skip_all)]
async fn async_main(args: Args) -> Result<common::JobSummary> {
    let config = args.transfer_config();
    config.validate().map_err(|error| anyhow!(error))?;
    let endpoints = match reqwest::Url::parse(&args.src) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => http_endpoints(&args, url).await?,
        _ => local_endpoints(&args).await?,
    };
    let job_id = args.resume.unwrap_or_default();
    let store: std::sync::Arc<dyn StatusStore> = match &args.plan_dir {
        Some(plan_dir) => std::sync::Arc::new(JsonStatusStore::open(plan_dir, job_id).await?),
        None => std::sync::Arc::new(MemoryStatusStore::new()),
    };
    if let Some(plan_dir) = &args.plan_dir
        && !args.quiet
    {
        eprintln!(
            "job {}: plan kept in {:?}, pass --resume {} to continue it",
            job_id,
            JsonStatusStore::plan_path(plan_dir, job_id),
            job_id
        );
    }
    let mut template =
        common::JobTemplate::new(endpoints.source, endpoints.destination, config);
    if config.overwrite == common::OverwritePolicy::Prompt {
        template = template.with_prompter(std::sync::Arc::new(prompt_on_terminal));
    }
    let pool = common::pool::WorkerPool::new(config.pool_size);
    let job = std::sync::Arc::new(common::Job::start(
        job_id,
        template,
        pool.clone(),
        store,
        std::sync::Arc::new(common::job::DiscardSink),
    ));
    let interrupt = {
        let job = job.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling job {}", job.id());
                job.cancel();
            }
        })
    };
    let enumerated = enqueue(&job, endpoints.enumeration).await;
    job.complete_enumeration();
    if enumerated.is_err() {
        job.cancel();
    }
    let summary = job.wait().await;
    interrupt.abort();
    pool.shutdown().await;
    enumerated?;
    let summary = summary?;
    if !summary.is_success() {
        if args.summary {
            return Err(anyhow!("rxcp encountered errors\n\n{}", &summary));
        }
        return Err(anyhow!(
            "rxcp encountered errors: {} transfers failed, {} cancelled",
            summary.transfers_failed,
            summary.transfers_cancelled
        ));
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        transfer_throttle: args.transfer_throttle,
        chunk_iops_throttle: args.iops_throttle,
        chunk_size: args.chunk_size.as_u64(),
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
