//! Folder transfers and the bookkeeping of which destination folders this job created.
//!
//! Folders carry no bytes. A folder transfer ensures the destination directory exists and, when the
//! overwrite policy allows it, applies the source folder's properties. Whether properties may be
//! applied depends on who created the directory: one made by this job (either by the folder
//! transfer itself or as the parent of a file) is always ours to modify.

use anyhow::Context;
use tracing::instrument;

use crate::overwrite::{OverwritePolicy, OverwritePrompter};
use crate::transfer::{EntityType, Transfer, TransferStatus};

pub trait FolderCreationTracker: Send + Sync + std::fmt::Debug {
    /// Creates `path` (and any missing parents) unless it already exists.
    fn create_if_absent(&self, path: &std::path::Path) -> anyhow::Result<()>;

    fn should_set_properties(
        &self,
        path: &std::path::Path,
        policy: OverwritePolicy,
        prompter: &dyn OverwritePrompter,
    ) -> bool;

    /// Forgets `path`; no further decisions will be asked about it.
    fn stop_tracking(&self, path: &std::path::Path);
}

/// Tracks directories on the local filesystem.
#[derive(Debug, Default)]
pub struct DirectoryTracker {
    created: parking_lot::Mutex<std::collections::HashSet<std::path::PathBuf>>,
}

impl DirectoryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn created_by_job(&self, path: &std::path::Path) -> bool {
        self.created.lock().contains(path)
    }
}

impl FolderCreationTracker for DirectoryTracker {
    fn create_if_absent(&self, path: &std::path::Path) -> anyhow::Result<()> {
        match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => return Ok(()),
            Ok(_) => return Err(anyhow::anyhow!("{:?} exists and is not a directory", path)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error).with_context(|| format!("cannot stat {:?}", path));
            }
        }
        let missing: Vec<_> = path
            .ancestors()
            .take_while(|ancestor| !ancestor.as_os_str().is_empty() && !ancestor.exists())
            .map(std::path::Path::to_path_buf)
            .collect();
        std::fs::create_dir_all(path)
            .with_context(|| format!("cannot create directory {:?}", path))?;
        tracing::debug!("created {} directories for {:?}", missing.len(), path);
        self.created.lock().extend(missing);
        Ok(())
    }

    fn should_set_properties(
        &self,
        path: &std::path::Path,
        policy: OverwritePolicy,
        prompter: &dyn OverwritePrompter,
    ) -> bool {
        if policy == OverwritePolicy::Always || self.created_by_job(path) {
            return true;
        }
        match policy {
            OverwritePolicy::Prompt => prompter.should_overwrite(path, EntityType::Folder),
            OverwritePolicy::Always | OverwritePolicy::Never | OverwritePolicy::IfSourceNewer => {
                false
            }
        }
    }

    fn stop_tracking(&self, path: &std::path::Path) {
        self.created.lock().remove(path);
    }
}

struct StopTracking<'a> {
    tracker: &'a dyn FolderCreationTracker,
    path: &'a std::path::Path,
}

impl Drop for StopTracking<'_> {
    fn drop(&mut self) {
        self.tracker.stop_tracking(self.path);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FolderOutcome {
    PropertiesSet,
    Skipped,
}

fn prepare_folder(
    tracker: &dyn FolderCreationTracker,
    prompter: &dyn OverwritePrompter,
    policy: OverwritePolicy,
    path: &std::path::Path,
    modified: Option<std::time::SystemTime>,
) -> anyhow::Result<FolderOutcome> {
    let _stop_tracking = StopTracking { tracker, path };
    tracker
        .create_if_absent(path)
        .context("ensuring destination folder exists")?;
    if !tracker.should_set_properties(path, policy, prompter) {
        return Ok(FolderOutcome::Skipped);
    }
    if let Some(modified) = modified {
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(modified))
            .with_context(|| format!("setting folder properties of {:?}", path))?;
    }
    Ok(FolderOutcome::PropertiesSet)
}

/// Runs a folder transfer to completion. It goes through the same epilogue as a file transfer
/// of exactly one chunk.
#[instrument(skip_all, fields(transfer = %transfer.id()))]
pub async fn transfer_folder(transfer: std::sync::Arc<Transfer>) {
    if transfer.ctx().is_cancelled() {
        transfer.finish_early(TransferStatus::Cancelled, None);
        return;
    }
    let template = transfer.template().clone();
    let relative = transfer.info().relative.clone();
    let Some(path) = template.destination.local_path(&relative) else {
        transfer.finish_early(
            TransferStatus::Failed,
            Some(anyhow::anyhow!(
                "destination {} does not support folders",
                template.destination.describe(&relative)
            )),
        );
        return;
    };
    let modified = if template.config.preserve_mtime {
        transfer.info().source_modified
    } else {
        None
    };
    transfer.begin(1);
    let outcome = tokio::task::spawn_blocking(move || {
        prepare_folder(
            template.tracker.as_ref(),
            template.prompter.as_ref(),
            template.config.overwrite,
            &path,
            modified,
        )
    })
    .await;
    match outcome {
        Ok(Ok(FolderOutcome::PropertiesSet)) => {}
        Ok(Ok(FolderOutcome::Skipped)) => transfer.mark_skipped(),
        Ok(Err(error)) => {
            tracing::error!("folder {:?} failed: {:#}", &relative, &error);
            transfer.fail(error);
        }
        Err(error) => transfer.fail(anyhow::Error::from(error).context("folder task failed")),
    }
    if transfer.chunks_finished(1) {
        transfer.complete();
    }
}
