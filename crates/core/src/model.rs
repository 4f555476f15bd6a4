use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::{Descriptor, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Fetching,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Uploading)
                | (Fetching, Failed)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Pending | Fetching | Uploading, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FetchFailed,
    DestinationInitFailed,
    UploadTransient,
    UploadPermanent,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled")
    }
}

/// One entry of the file list reported by acquisition readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub peer_count: u32,
}

impl FetchProgress {
    /// Whole percent of the content acquired so far.
    pub fn percent(&self) -> u32 {
        if self.bytes_total == 0 {
            return 0;
        }
        let done = self.bytes_done.min(self.bytes_total) as u128;
        (done * 100 / self.bytes_total as u128) as u32
    }
}

/// Transfer rates derived by the registry from successive progress samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Throughput {
    pub fetch_percent: u32,
    pub download_bytes_per_sec: u64,
    pub upload_bytes_per_sec: u64,
    /// Estimated time until acquisition finishes; unknown until a rate exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_eta_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransfer {
    pub name: String,
    pub size_bytes: u64,
    pub uploaded_bytes: u64,
    pub status: FileStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Failure>,
}

impl FileTransfer {
    pub fn new(entry: FileEntry) -> Self {
        Self {
            name: entry.name,
            size_bytes: entry.size,
            uploaded_bytes: 0,
            status: FileStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Raises `uploaded_bytes` to `bytes` (capped at the size); never lowers it.
    pub fn record_progress(&mut self, bytes: u64) {
        let bytes = bytes.min(self.size_bytes);
        if bytes > self.uploaded_bytes {
            self.uploaded_bytes = bytes;
        }
    }

    pub fn complete(&mut self) {
        self.uploaded_bytes = self.size_bytes;
        self.status = FileStatus::Completed;
        self.last_error = None;
    }

    pub fn fail(&mut self, failure: Failure) {
        self.status = FileStatus::Failed;
        self.last_error = Some(failure);
    }
}

/// Immutable point-in-time copy of a job, handed to readers.
pub type JobSnapshot = TransferJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJob {
    pub id: JobId,
    /// Distinguishes a resubmitted job from the earlier job with the same id.
    #[serde(default)]
    pub generation: u64,
    pub source: Descriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: JobStatus,
    pub files: Vec<FileTransfer>,
    pub fetch_progress: Option<FetchProgress>,
    #[serde(default)]
    pub throughput: Throughput,
    pub destination_folder_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferJob {
    pub fn new(id: JobId, generation: u64, source: Descriptor) -> Self {
        let now = Utc::now();
        Self {
            id,
            generation,
            name: source.display_name(),
            source,
            status: JobStatus::Pending,
            files: Vec::new(),
            fetch_progress: None,
            throughput: Throughput::default(),
            destination_folder_id: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn file(&self, name: &str) -> Option<&FileTransfer> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.uploaded_bytes).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Job status implied by the file states, once every file is terminal.
///
/// Returns `None` while any file is still pending or uploading, and for an
/// empty file list.
pub fn aggregate_status(files: &[FileTransfer]) -> Option<JobStatus> {
    if files.is_empty() || !files.iter().all(|f| f.status.is_terminal()) {
        return None;
    }
    if files.iter().all(|f| f.status == FileStatus::Completed) {
        Some(JobStatus::Completed)
    } else {
        Some(JobStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(status: FileStatus) -> FileTransfer {
        FileTransfer {
            status,
            ..FileTransfer::new(FileEntry {
                name: "a".to_string(),
                size: 10,
            })
        }
    }

    #[test]
    fn state_machine_allows_only_documented_edges() {
        use JobStatus::*;
        let all = [Pending, Fetching, Uploading, Completed, Failed, Cancelled];
        let allowed = [
            (Pending, Fetching),
            (Fetching, Uploading),
            (Fetching, Failed),
            (Uploading, Completed),
            (Uploading, Failed),
            (Pending, Cancelled),
            (Fetching, Cancelled),
            (Uploading, Cancelled),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn aggregate_waits_for_every_file() {
        assert_eq!(aggregate_status(&[]), None);
        assert_eq!(
            aggregate_status(&[file(FileStatus::Completed), file(FileStatus::Uploading)]),
            None
        );
        assert_eq!(
            aggregate_status(&[file(FileStatus::Completed), file(FileStatus::Completed)]),
            Some(JobStatus::Completed)
        );
        assert_eq!(
            aggregate_status(&[file(FileStatus::Failed), file(FileStatus::Completed)]),
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let mut f = file(FileStatus::Uploading);
        f.record_progress(4);
        f.record_progress(2);
        assert_eq!(f.uploaded_bytes, 4);
        f.record_progress(50);
        assert_eq!(f.uploaded_bytes, 10);
    }

    #[test]
    fn snapshot_json_uses_camel_case() {
        let mut job = TransferJob::new(
            JobId::from("abc"),
            7,
            Descriptor::Magnet {
                uri: "magnet:?xt=urn:btih:abc".to_string(),
            },
        );
        job.files.push(file(FileStatus::Pending));
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["id"], "abc");
        assert_eq!(v["status"], "pending");
        assert_eq!(v["files"][0]["uploadedBytes"], 0);
        assert_eq!(v["files"][0]["sizeBytes"], 10);
        assert!(v["fetchProgress"].is_null());
        assert_eq!(v["generation"], 7);
        assert_eq!(v["throughput"]["uploadBytesPerSec"], 0);
        assert!(v["throughput"].get("fetchEtaMs").is_none());
    }

    #[test]
    fn fetch_percent_is_floored_and_bounded() {
        let p = |done, total| FetchProgress {
            bytes_done: done,
            bytes_total: total,
            peer_count: 1,
        };
        assert_eq!(p(0, 0).percent(), 0);
        assert_eq!(p(199, 200).percent(), 99);
        assert_eq!(p(200, 200).percent(), 100);
        assert_eq!(p(500, 200).percent(), 100);
    }
}
