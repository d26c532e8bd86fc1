//! Whole-file copies between two local paths.
//!
//! Local to local transfers skip the chunked read/write path when the platform can copy in the
//! kernel. The strategy is picked once at startup; [`CopyStrategy::Generic`] works everywhere.

use anyhow::Context;

// largest count a single sendfile call transfers on linux
const MAX_SENDFILE_SLICE: usize = 0x7fff_f000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// `sendfile(2)` loop; data never enters user space.
    Kernel,
    /// Buffered read/write loop.
    Generic,
}

impl CopyStrategy {
    #[must_use]
    pub fn detect() -> Self {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            CopyStrategy::Kernel
        } else {
            CopyStrategy::Generic
        }
    }

    /// Copies `from` over `to` (created or truncated) and syncs it. Returns the bytes copied.
    pub async fn copy(self, from: &std::path::Path, to: &std::path::Path) -> anyhow::Result<u64> {
        match self {
            CopyStrategy::Kernel => {
                let from = from.to_path_buf();
                let to = to.to_path_buf();
                tokio::task::spawn_blocking(move || kernel_copy(&from, &to)).await?
            }
            CopyStrategy::Generic => generic_copy(from, to).await,
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn kernel_copy(from: &std::path::Path, to: &std::path::Path) -> anyhow::Result<u64> {
    let source =
        std::fs::File::open(from).with_context(|| format!("cannot open {:?} for reading", from))?;
    let size = source
        .metadata()
        .with_context(|| format!("failed reading metadata from {:?}", from))?
        .len();
    let destination = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(to)
        .with_context(|| format!("cannot open {:?} for writing", to))?;
    let mut copied = 0u64;
    while copied < size {
        let slice = usize::try_from(size - copied)
            .unwrap_or(MAX_SENDFILE_SLICE)
            .min(MAX_SENDFILE_SLICE);
        let sent = nix::sys::sendfile::sendfile(&destination, &source, None, slice)
            .with_context(|| format!("sendfile from {:?} to {:?} failed", from, to))?;
        if sent == 0 {
            return Err(anyhow::anyhow!(
                "{:?} shrank while being copied: {} of {} bytes copied",
                from,
                copied,
                size
            ));
        }
        copied += sent as u64;
    }
    destination
        .sync_all()
        .with_context(|| format!("failed syncing {:?}", to))?;
    tracing::trace!("sendfile copied {} bytes from {:?} to {:?}", copied, from, to);
    Ok(copied)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn kernel_copy(from: &std::path::Path, to: &std::path::Path) -> anyhow::Result<u64> {
    let mut source =
        std::fs::File::open(from).with_context(|| format!("cannot open {:?} for reading", from))?;
    let mut destination =
        std::fs::File::create(to).with_context(|| format!("cannot open {:?} for writing", to))?;
    let copied = std::io::copy(&mut source, &mut destination)
        .with_context(|| format!("failed copying {:?} to {:?}", from, to))?;
    destination.sync_all()?;
    Ok(copied)
}

async fn generic_copy(from: &std::path::Path, to: &std::path::Path) -> anyhow::Result<u64> {
    let mut source = tokio::fs::File::open(from)
        .await
        .with_context(|| format!("cannot open {:?} for reading", from))?;
    let mut destination = tokio::fs::File::create(to)
        .await
        .with_context(|| format!("cannot open {:?} for writing", to))?;
    let copied = tokio::io::copy(&mut source, &mut destination)
        .await
        .with_context(|| format!("failed copying {:?} to {:?}", from, to))?;
    destination
        .sync_all()
        .await
        .with_context(|| format!("failed syncing {:?}", to))?;
    Ok(copied)
}
