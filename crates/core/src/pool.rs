use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::descriptor::JobId;
use crate::model::{Failure, FailureKind, FileStatus, FileTransfer};
use crate::registry::JobRegistry;
use crate::storage::{BoxFuture, ByteStream, ObjectStore};
use crate::{Error, Result};

/// How long an in-flight upload may run after cancellation to reach its next
/// chunk boundary before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global cap on simultaneously running uploads.
    pub workers: usize,
    /// Cap on simultaneously running uploads of one job.
    pub per_job: usize,
    pub retry: RetryPolicy,
    pub read_buffer_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            per_job: 2,
            retry: RetryPolicy::default(),
            read_buffer_bytes: 64 * 1024,
        }
    }
}

/// Reopenable source of one file's bytes. Each attempt opens a fresh stream.
pub trait StreamSource: Send + Sync {
    fn open(&self) -> BoxFuture<'_, Result<ByteStream>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub folder_id: String,
    pub name: String,
}

/// Completion notice sent once per enqueued file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub job_id: JobId,
    pub generation: u64,
    pub file_name: String,
    pub status: FileStatus,
}

type LaneKey = (JobId, u64);

struct Lane {
    permits: Arc<Semaphore>,
    outstanding: usize,
}

struct PoolInner {
    registry: Arc<JobRegistry>,
    store: Arc<dyn ObjectStore>,
    config: PoolConfig,
    global: Arc<Semaphore>,
    /// Keyed by job id and generation, so a resubmitted job never shares
    /// permits with tasks of the job it replaced.
    lanes: Mutex<HashMap<LaneKey, Lane>>,
    outcomes: mpsc::UnboundedSender<UploadOutcome>,
}

/// Bounded executor for file uploads.
///
/// Admission never blocks: every enqueued file gets its own task, which waits
/// for a per-job permit and then a global one before touching the store.
#[derive(Clone)]
pub struct UploadWorkerPool {
    inner: Arc<PoolInner>,
}

impl UploadWorkerPool {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn ObjectStore>,
        config: PoolConfig,
        outcomes: mpsc::UnboundedSender<UploadOutcome>,
    ) -> Self {
        let global = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                registry,
                store,
                config,
                global,
                lanes: Mutex::new(HashMap::new()),
                outcomes,
            }),
        }
    }

    pub fn enqueue(
        &self,
        job_id: JobId,
        generation: u64,
        file: FileTransfer,
        source: Arc<dyn StreamSource>,
        destination: Destination,
        cancel: CancellationToken,
    ) {
        let inner = self.inner.clone();
        let key = (job_id, generation);
        let lane = inner.join_lane(&key);
        tokio::spawn(async move {
            let job_id = &key.0;
            let status = inner
                .run(job_id, &file, lane, source.as_ref(), &destination, &cancel)
                .await;
            inner.leave_lane(&key);
            let (job_id, generation) = key;
            let _ = inner.outcomes.send(UploadOutcome {
                job_id,
                generation,
                file_name: file.name,
                status,
            });
        });
    }
}

impl PoolInner {
    fn join_lane(&self, key: &LaneKey) -> Arc<Semaphore> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let lane = lanes.entry(key.clone()).or_insert_with(|| Lane {
            permits: Arc::new(Semaphore::new(self.config.per_job.max(1))),
            outstanding: 0,
        });
        lane.outstanding += 1;
        lane.permits.clone()
    }

    fn leave_lane(&self, key: &LaneKey) {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lane) = lanes.get_mut(key) {
            lane.outstanding = lane.outstanding.saturating_sub(1);
            if lane.outstanding == 0 {
                lanes.remove(key);
            }
        }
    }

    async fn run(
        &self,
        job_id: &JobId,
        file: &FileTransfer,
        lane: Arc<Semaphore>,
        source: &dyn StreamSource,
        destination: &Destination,
        cancel: &CancellationToken,
    ) -> FileStatus {
        let Some(_lane_permit) = acquire(lane, cancel).await else {
            return self.finish_cancelled(job_id, &file.name);
        };
        let Some(_permit) = acquire(self.global.clone(), cancel).await else {
            return self.finish_cancelled(job_id, &file.name);
        };

        let started = self.registry.mutate_file(job_id, &file.name, |f| {
            if cancel.is_cancelled() || f.status != FileStatus::Pending {
                return false;
            }
            f.status = FileStatus::Uploading;
            true
        });
        match started {
            Ok(true) => {}
            Ok(false) => return self.finish_cancelled(job_id, &file.name),
            Err(e) => {
                debug!(event = "upload.skipped", job_id = %job_id, file = %file.name, error = %e, "upload.skipped");
                return FileStatus::Failed;
            }
        }

        loop {
            let err = match self.attempt(job_id, file, source, destination, cancel).await {
                Ok(()) => return self.finish_completed(job_id, &file.name, cancel),
                Err(Error::Cancelled) => return self.finish_cancelled(job_id, &file.name),
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                return self.finish_cancelled(job_id, &file.name);
            }

            if !err.is_transient() {
                return self.finish_failed(job_id, &file.name, FailureKind::UploadPermanent, err, cancel);
            }

            let max_retries = self.config.retry.max_retries;
            let retry = self.registry.mutate_file(job_id, &file.name, |f| {
                if cancel.is_cancelled() || f.retry_count >= max_retries {
                    return None;
                }
                f.retry_count += 1;
                Some(f.retry_count)
            });
            let attempt = match retry {
                Ok(Some(n)) => n,
                Ok(None) if cancel.is_cancelled() => {
                    return self.finish_cancelled(job_id, &file.name);
                }
                Ok(None) => {
                    return self.finish_failed(
                        job_id,
                        &file.name,
                        FailureKind::UploadTransient,
                        err,
                        cancel,
                    );
                }
                Err(_) => return FileStatus::Failed,
            };

            let delay = self.config.retry.delay(attempt - 1);
            warn!(
                event = "upload.retry",
                job_id = %job_id,
                file = %file.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "upload.retry"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.finish_cancelled(job_id, &file.name),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        job_id: &JobId,
        file: &FileTransfer,
        source: &dyn StreamSource,
        destination: &Destination,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            s = source.open() => s?,
        };

        let read = Arc::new(AtomicU64::new(0));
        let reader = ProgressReader {
            inner: stream,
            read: read.clone(),
            registry: self.registry.clone(),
            job_id: job_id.clone(),
            file_name: file.name.clone(),
            cancel: cancel.clone(),
        };
        let reader = BufReader::with_capacity(self.config.read_buffer_bytes, reader);

        let upload =
            self.store
                .upload_stream(&destination.folder_id, &destination.name, Box::new(reader));
        tokio::pin!(upload);
        let object_id = tokio::select! {
            r = &mut upload => r?,
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut upload).await;
                return Err(Error::Cancelled);
            }
        };

        let read = read.load(Ordering::Relaxed);
        if read != file.size_bytes {
            return Err(Error::transient(format!(
                "source yielded {read} of {} bytes",
                file.size_bytes
            )));
        }
        debug!(
            event = "upload.object_stored",
            job_id = %job_id,
            file = %file.name,
            object_id = %object_id,
            "upload.object_stored"
        );
        Ok(())
    }

    fn finish_completed(&self, job_id: &JobId, name: &str, cancel: &CancellationToken) -> FileStatus {
        let done = self.registry.mutate_file(job_id, name, |f| {
            if cancel.is_cancelled() || f.status != FileStatus::Uploading {
                return f.status;
            }
            f.complete();
            f.status
        });
        done.unwrap_or(FileStatus::Failed)
    }

    fn finish_failed(
        &self,
        job_id: &JobId,
        name: &str,
        kind: FailureKind,
        err: Error,
        cancel: &CancellationToken,
    ) -> FileStatus {
        error!(
            event = "upload.failed",
            job_id = %job_id,
            file = %name,
            transient = err.is_transient(),
            error = %err,
            "upload.failed"
        );
        let failure = Failure::new(kind, err.to_string());
        let done = self.registry.mutate_file(job_id, name, |f| {
            if !cancel.is_cancelled() && !f.status.is_terminal() {
                f.fail(failure);
            }
            f.status
        });
        done.unwrap_or(FileStatus::Failed)
    }

    /// The job-level cancel transition already failed every open file, so a
    /// cancelled task only reports back.
    fn finish_cancelled(&self, job_id: &JobId, name: &str) -> FileStatus {
        debug!(event = "upload.cancelled", job_id = %job_id, file = %name, "upload.cancelled");
        FileStatus::Failed
    }
}

async fn acquire(sem: Arc<Semaphore>, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        p = sem.acquire_owned() => p.ok(),
    }
}

/// Counts bytes pulled from the source and mirrors them into the file's
/// `uploaded_bytes`. Fails the next read once the job is cancelled.
struct ProgressReader {
    inner: ByteStream,
    read: Arc<AtomicU64>,
    registry: Arc<JobRegistry>,
    job_id: JobId,
    file_name: String,
    cancel: CancellationToken,
}

impl AsyncRead for ProgressReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "upload cancelled",
            )));
        }
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                let total = this.read.fetch_add(n, Ordering::Relaxed) + n;
                let cancel = &this.cancel;
                let _ = this
                    .registry
                    .mutate_file(&this.job_id, &this.file_name, |f| {
                        if !cancel.is_cancelled() && f.status == FileStatus::Uploading {
                            f.record_progress(total);
                        }
                    });
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn lanes_are_dropped_when_idle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = UploadWorkerPool::new(
            Arc::new(JobRegistry::new()),
            Arc::new(crate::storage::InMemoryStore::new()),
            PoolConfig::default(),
            tx,
        );
        let key = (JobId::from("a"), 0);
        let first = pool.inner.join_lane(&key);
        let second = pool.inner.join_lane(&key);
        assert!(Arc::ptr_eq(&first, &second));
        pool.inner.leave_lane(&key);
        assert_eq!(pool.inner.lanes.lock().unwrap().len(), 1);
        pool.inner.leave_lane(&key);
        assert!(pool.inner.lanes.lock().unwrap().is_empty());
    }

    #[test]
    fn resubmitted_job_gets_a_fresh_lane() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = UploadWorkerPool::new(
            Arc::new(JobRegistry::new()),
            Arc::new(crate::storage::InMemoryStore::new()),
            PoolConfig {
                per_job: 2,
                ..PoolConfig::default()
            },
            tx,
        );
        let old = (JobId::from("a"), 0);
        let new = (JobId::from("a"), 1);

        // Tasks of the replaced job still draining hold their lane permits.
        let stale = pool.inner.join_lane(&old);
        let _held = stale.clone().try_acquire_many_owned(2).unwrap();

        let fresh = pool.inner.join_lane(&new);
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.available_permits(), 2);
        assert_eq!(pool.inner.lanes.lock().unwrap().len(), 2);
    }
}
