//! Persisted transfer status, the basis of job resumption.
//!
//! Statuses are keyed by transfer identity (job, part, index). The relative path is stored next to
//! the status and a lookup only hits when it matches, so a source tree that changed between runs
//! never causes a different object to be skipped.

use anyhow::Context;
use futures::future::BoxFuture;

use crate::job::JobId;
use crate::transfer::{TransferId, TransferStatus};

pub type TransferKey = TransferId;

pub trait StatusStore: Send + Sync + std::fmt::Debug {
    /// Status recorded for `key` by this or a previous run.
    fn load(&self, key: &TransferKey, relative: &std::path::Path) -> Option<TransferStatus>;

    fn record(&self, key: &TransferKey, relative: &std::path::Path, status: TransferStatus);

    /// Makes everything recorded so far durable.
    fn flush(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct Record {
    relative: std::path::PathBuf,
    status: TransferStatus,
}

#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: parking_lot::Mutex<std::collections::HashMap<TransferKey, Record>>,
    flushes: std::sync::atomic::AtomicUsize,
}

impl MemoryStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl StatusStore for MemoryStatusStore {
    fn load(&self, key: &TransferKey, relative: &std::path::Path) -> Option<TransferStatus> {
        self.records
            .lock()
            .get(key)
            .filter(|record| record.relative == relative)
            .map(|record| record.status)
    }

    fn record(&self, key: &TransferKey, relative: &std::path::Path, status: TransferStatus) {
        self.records.lock().insert(
            *key,
            Record {
                relative: relative.to_path_buf(),
                status,
            },
        );
    }

    fn flush(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        self.flushes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Entry {
    part: u32,
    index: u32,
    #[serde(flatten)]
    record: Record,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PlanFile {
    job: JobId,
    transfers: Vec<Entry>,
}

/// One JSON document per job, `<plan_dir>/<job id>.json`, rewritten atomically on every flush.
#[derive(Debug)]
pub struct JsonStatusStore {
    job: JobId,
    path: std::path::PathBuf,
    records: parking_lot::Mutex<std::collections::BTreeMap<(u32, u32), Record>>,
    dirty: std::sync::atomic::AtomicBool,
}

impl JsonStatusStore {
    #[must_use]
    pub fn plan_path(plan_dir: &std::path::Path, job: JobId) -> std::path::PathBuf {
        plan_dir.join(format!("{job}.json"))
    }

    /// Opens the plan of `job`, loading whatever a previous run persisted.
    pub async fn open(plan_dir: &std::path::Path, job: JobId) -> anyhow::Result<Self> {
        let path = Self::plan_path(plan_dir, job);
        let records = match tokio::fs::read(&path).await {
            Ok(contents) => {
                let plan: PlanFile = serde_json::from_slice(&contents)
                    .with_context(|| format!("job plan {:?} is corrupted", &path))?;
                anyhow::ensure!(
                    plan.job == job,
                    "job plan {:?} belongs to job {}, not {}",
                    &path,
                    plan.job,
                    job
                );
                tracing::info!(
                    "loaded {} transfer statuses from {:?}",
                    plan.transfers.len(),
                    &path
                );
                plan.transfers
                    .into_iter()
                    .map(|entry| ((entry.part, entry.index), entry.record))
                    .collect()
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Default::default(),
            Err(error) => {
                return Err(error).with_context(|| format!("cannot read job plan {:?}", &path));
            }
        };
        tokio::fs::create_dir_all(plan_dir)
            .await
            .with_context(|| format!("cannot create plan directory {:?}", plan_dir))?;
        Ok(Self {
            job,
            path,
            records: parking_lot::Mutex::new(records),
            dirty: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl StatusStore for JsonStatusStore {
    fn load(&self, key: &TransferKey, relative: &std::path::Path) -> Option<TransferStatus> {
        if key.job != self.job {
            return None;
        }
        self.records
            .lock()
            .get(&(key.part, key.index))
            .filter(|record| record.relative == relative)
            .map(|record| record.status)
    }

    fn record(&self, key: &TransferKey, relative: &std::path::Path, status: TransferStatus) {
        assert_eq!(key.job, self.job, "transfer recorded in another job's plan");
        self.records.lock().insert(
            (key.part, key.index),
            Record {
                relative: relative.to_path_buf(),
                status,
            },
        );
        self.dirty.store(true, std::sync::atomic::Ordering::Release);
    }

    fn flush(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            if !self.dirty.swap(false, std::sync::atomic::Ordering::AcqRel) {
                return Ok(());
            }
            let plan = PlanFile {
                job: self.job,
                transfers: self
                    .records
                    .lock()
                    .iter()
                    .map(|(&(part, index), record)| Entry {
                        part,
                        index,
                        record: record.clone(),
                    })
                    .collect(),
            };
            let path = self.path.clone();
            let written = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
                let contents = serde_json::to_vec(&plan)?;
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, &contents)
                    .with_context(|| format!("cannot write job plan {:?}", &tmp))?;
                std::fs::rename(&tmp, &path)
                    .with_context(|| format!("cannot replace job plan {:?}", &path))?;
                Ok(plan.transfers.len())
            })
            .await?;
            match written {
                Ok(count) => {
                    tracing::debug!("persisted {} transfer statuses to {:?}", count, &self.path);
                    Ok(())
                }
                Err(error) => {
                    self.dirty.store(true, std::sync::atomic::Ordering::Release);
                    Err(error)
                }
            }
        })
    }
}
