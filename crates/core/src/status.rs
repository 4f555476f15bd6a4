use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::model::{JobSnapshot, JobStatus};

pub const SNAPSHOT_TYPE: &str = "jobs.snapshot";
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Wall-clock milliseconds, never going backwards within the process.
pub fn now_unix_ms() -> u64 {
    static LAST_UNIX_MS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

pub fn status_json_path(data_dir: &Path) -> PathBuf {
    data_dir.join("status").join("jobs.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSource {
    pub kind: String, // "daemon" | "file"
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTotals {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
}

impl JobTotals {
    pub fn from_jobs(jobs: &[JobSnapshot]) -> Self {
        let mut t = Self::default();
        for job in jobs {
            match job.status {
                JobStatus::Completed => t.completed += 1,
                JobStatus::Failed => t.failed += 1,
                JobStatus::Cancelled => t.cancelled += 1,
                JobStatus::Pending | JobStatus::Fetching | JobStatus::Uploading => t.active += 1,
            }
            t.bytes_uploaded += job.uploaded_bytes();
            t.bytes_total += job.total_bytes();
        }
        t
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsStatusSnapshot {
    #[serde(rename = "type")]
    pub type_: String, // "jobs.snapshot"
    pub schema_version: u32,
    pub generated_at: u64,
    pub source: StatusSource,
    #[serde(default)]
    pub totals: JobTotals,
    pub jobs: Vec<JobSnapshot>,
}

impl JobsStatusSnapshot {
    pub fn from_jobs(jobs: Vec<JobSnapshot>, detail: Option<String>) -> Self {
        Self {
            type_: SNAPSHOT_TYPE.to_string(),
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            generated_at: now_unix_ms(),
            source: StatusSource {
                kind: "daemon".to_string(),
                detail,
            },
            totals: JobTotals::from_jobs(&jobs),
            jobs,
        }
    }
}

pub fn read_status_snapshot_json(path: &Path) -> std::io::Result<JobsStatusSnapshot> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    let snap: JobsStatusSnapshot = serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(snap)
}

#[derive(Debug, Clone, Copy)]
pub struct StatusWriteOptions {
    pub fsync_file: bool,
    pub fsync_dir: bool,
}

impl Default for StatusWriteOptions {
    fn default() -> Self {
        Self {
            fsync_file: true,
            fsync_dir: true,
        }
    }
}

pub fn write_status_snapshot_json_atomic(
    path: &Path,
    snapshot: &JobsStatusSnapshot,
) -> std::io::Result<()> {
    write_status_snapshot_json_atomic_with_options(path, snapshot, StatusWriteOptions::default())
}

pub fn write_status_snapshot_json_atomic_with_options(
    path: &Path,
    snapshot: &JobsStatusSnapshot,
    options: StatusWriteOptions,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let data = serde_json::to_vec(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    f.write_all(&data)?;
    if options.fsync_file {
        f.sync_all()?;
    }
    drop(f);

    std::fs::rename(&tmp, path)?;

    if options.fsync_dir
        && let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
