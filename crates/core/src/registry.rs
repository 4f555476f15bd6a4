use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use crate::descriptor::{Descriptor, JobId};
use crate::model::{
    FailureKind, FetchProgress, FileEntry, FileStatus, FileTransfer, Failure, JobSnapshot,
    JobStatus, TransferJob, aggregate_status,
};
use crate::{Error, Result};

/// A requested change of job state, validated against the job state machine.
#[derive(Debug, Clone)]
pub enum Transition {
    BeginFetch,
    BeginUpload {
        folder_id: String,
        name: Option<String>,
        files: Vec<FileEntry>,
    },
    Complete,
    Fail(Failure),
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Self::BeginFetch => JobStatus::Fetching,
            Self::BeginUpload { .. } => JobStatus::Uploading,
            Self::Complete => JobStatus::Completed,
            Self::Fail(_) => JobStatus::Failed,
            Self::Cancel => JobStatus::Cancelled,
        }
    }
}

struct Slot {
    seq: u64,
    job: Mutex<TransferJob>,
    meters: Mutex<Meters>,
}

impl Slot {
    fn new(seq: u64, job: TransferJob) -> Self {
        Self {
            seq,
            job: Mutex::new(job),
            meters: Mutex::new(Meters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransferJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Taken only while the job lock is held.
    fn meters(&self) -> MutexGuard<'_, Meters> {
        self.meters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Minimum spacing between two samples that produce a rate.
const RATE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct RateMeter {
    mark: Option<(Instant, u64)>,
}

impl RateMeter {
    /// Bytes per second since the previous mark, once at least
    /// [`RATE_WINDOW`] has passed.
    fn sample(&mut self, now: Instant, total: u64) -> Option<u64> {
        let Some((at, bytes)) = self.mark else {
            self.mark = Some((now, total));
            return None;
        };
        let elapsed = now.saturating_duration_since(at);
        if elapsed < RATE_WINDOW {
            return None;
        }
        self.mark = Some((now, total));
        let delta = u128::from(total.saturating_sub(bytes));
        Some((delta * 1000 / elapsed.as_millis().max(1)) as u64)
    }
}

#[derive(Debug, Default)]
struct Meters {
    fetch: RateMeter,
    upload: RateMeter,
}

#[derive(Default)]
struct Jobs {
    next_seq: u64,
    by_id: HashMap<JobId, Arc<Slot>>,
}

/// Owns every transfer job. Mutations are serialized per job; readers get
/// snapshots and never hold a lock past the copy.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<Jobs>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job for `descriptor` unless live work for the same content
    /// already exists. A previous failed or cancelled job is replaced by one
    /// with a new generation.
    ///
    /// Returns the job id and whether a new job was created.
    pub fn submit(&self, descriptor: Descriptor) -> Result<(JobId, bool)> {
        let id = descriptor.job_id()?;
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(slot) = jobs.by_id.get(&id) {
            let status = slot.lock().status;
            if !matches!(status, JobStatus::Failed | JobStatus::Cancelled) {
                return Ok((id, false));
            }
            debug!(
                event = "job.resubmitted",
                job_id = %id,
                previous = status.as_str(),
                "job.resubmitted"
            );
        }

        let seq = jobs.next_seq;
        jobs.next_seq += 1;
        let job = TransferJob::new(id.clone(), seq, descriptor);
        jobs.by_id.insert(id.clone(), Arc::new(Slot::new(seq, job)));
        Ok((id, true))
    }

    pub fn get(&self, id: &JobId) -> Result<JobSnapshot> {
        let slot = self.slot(id)?;
        let job = slot.lock();
        Ok(job.clone())
    }

    /// Snapshots of all jobs, oldest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut slots: Vec<Arc<Slot>> = {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.by_id.values().cloned().collect()
        };
        slots.sort_by_key(|s| s.seq);
        let mut out: Vec<JobSnapshot> = slots.iter().map(|s| s.lock().clone()).collect();
        out.sort_by_key(|j| j.created_at);
        out
    }

    pub fn has_active(&self) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.by_id.values().any(|s| !s.lock().status.is_terminal())
    }

    pub fn update_status(&self, id: &JobId, transition: Transition) -> Result<JobSnapshot> {
        let slot = self.slot(id)?;
        let mut job = slot.lock();
        apply_transition(&mut job, transition)?;
        Ok(job.clone())
    }

    /// Like [`update_status`](Self::update_status), but only for the job of
    /// the given generation. A replaced job reports [`Error::NotFound`].
    pub fn update_status_at(
        &self,
        id: &JobId,
        generation: u64,
        transition: Transition,
    ) -> Result<JobSnapshot> {
        let slot = self.slot_at(id, generation)?;
        let mut job = slot.lock();
        apply_transition(&mut job, transition)?;
        Ok(job.clone())
    }

    /// Applies `mutator` to one file of a job under the job lock.
    pub fn mutate_file<R>(
        &self,
        id: &JobId,
        file_name: &str,
        mutator: impl FnOnce(&mut FileTransfer) -> R,
    ) -> Result<R> {
        self.mutate_file_at(id, file_name, Instant::now(), mutator)
    }

    fn mutate_file_at<R>(
        &self,
        id: &JobId,
        file_name: &str,
        now: Instant,
        mutator: impl FnOnce(&mut FileTransfer) -> R,
    ) -> Result<R> {
        let slot = self.slot(id)?;
        let mut job = slot.lock();
        let file = job
            .files
            .iter_mut()
            .find(|f| f.name == file_name)
            .ok_or_else(|| Error::NotFound {
                what: format!("file {file_name:?} in job {id}"),
            })?;
        let out = mutator(file);
        if job.status == JobStatus::Uploading {
            if let Some(rate) = slot.meters().upload.sample(now, job.uploaded_bytes()) {
                job.throughput.upload_bytes_per_sec = rate;
            }
        }
        job.updated_at = Utc::now();
        Ok(out)
    }

    /// Records acquisition progress and refreshes the download rate and ETA.
    pub fn set_fetch_progress(&self, id: &JobId, progress: FetchProgress) -> Result<()> {
        self.set_fetch_progress_at(id, progress, Instant::now())
    }

    fn set_fetch_progress_at(&self, id: &JobId, progress: FetchProgress, now: Instant) -> Result<()> {
        let slot = self.slot(id)?;
        let mut job = slot.lock();
        if let Some(rate) = slot.meters().fetch.sample(now, progress.bytes_done) {
            job.throughput.download_bytes_per_sec = rate;
        }
        let rate = job.throughput.download_bytes_per_sec;
        let remaining = progress.bytes_total.saturating_sub(progress.bytes_done);
        job.throughput.fetch_percent = progress.percent();
        job.throughput.fetch_eta_ms = if progress.bytes_total > 0 && remaining == 0 {
            Some(0)
        } else if rate > 0 {
            Some((u128::from(remaining) * 1000 / u128::from(rate)) as u64)
        } else {
            None
        };
        job.fetch_progress = Some(progress);
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Moves an uploading job of the given generation to its terminal status
    /// once every file has settled. Returns the job status after the call.
    pub fn settle(&self, id: &JobId, generation: u64) -> Result<JobStatus> {
        let slot = self.slot_at(id, generation)?;
        let mut job = slot.lock();
        if job.status != JobStatus::Uploading {
            return Ok(job.status);
        }
        match aggregate_status(&job.files) {
            Some(JobStatus::Completed) => apply_transition(&mut job, Transition::Complete)?,
            Some(_) => {
                let failed = job
                    .files
                    .iter()
                    .filter(|f| f.status == FileStatus::Failed)
                    .count();
                let kind = job
                    .files
                    .iter()
                    .find_map(|f| f.last_error.as_ref().map(|e| e.kind))
                    .unwrap_or(FailureKind::UploadPermanent);
                let message = format!("{failed} of {} files failed to upload", job.files.len());
                apply_transition(&mut job, Transition::Fail(Failure::new(kind, message)))?;
            }
            None => {}
        }
        Ok(job.status)
    }

    /// Drops a job that reached a terminal state.
    pub fn purge(&self, id: &JobId) -> Result<JobSnapshot> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let slot = jobs.by_id.get(id).ok_or_else(|| not_found(id))?;
        let snapshot = slot.lock().clone();
        if !snapshot.status.is_terminal() {
            return Err(Error::InvalidTransition {
                job_id: id.to_string(),
                from: snapshot.status.as_str(),
                to: "purged",
            });
        }
        jobs.by_id.remove(id);
        Ok(snapshot)
    }

    /// Forgets every job.
    pub fn reset(&self) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.by_id.clear();
    }

    fn slot(&self, id: &JobId) -> Result<Arc<Slot>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.by_id.get(id).cloned().ok_or_else(|| not_found(id))
    }

    fn slot_at(&self, id: &JobId, generation: u64) -> Result<Arc<Slot>> {
        let slot = self.slot(id)?;
        if slot.seq != generation {
            return Err(Error::NotFound {
                what: format!("job {id} generation {generation}"),
            });
        }
        Ok(slot)
    }
}

fn not_found(id: &JobId) -> Error {
    Error::NotFound {
        what: format!("job {id}"),
    }
}

fn apply_transition(job: &mut TransferJob, transition: Transition) -> Result<()> {
    let next = transition.target();
    if !job.status.can_transition_to(next) {
        return Err(Error::InvalidTransition {
            job_id: job.id.to_string(),
            from: job.status.as_str(),
            to: next.as_str(),
        });
    }

    match transition {
        Transition::BeginFetch | Transition::Complete => {}
        Transition::BeginUpload {
            folder_id,
            name,
            files,
        } => {
            if files.is_empty() {
                return Err(Error::InvalidTransition {
                    job_id: job.id.to_string(),
                    from: job.status.as_str(),
                    to: next.as_str(),
                });
            }
            job.destination_folder_id = Some(folder_id);
            if name.is_some() {
                job.name = name;
            }
            job.files = files.into_iter().map(FileTransfer::new).collect();
        }
        Transition::Fail(failure) => job.failure = Some(failure),
        Transition::Cancel => {
            for f in job.files.iter_mut().filter(|f| !f.status.is_terminal()) {
                f.fail(Failure::cancelled());
            }
            job.failure = Some(Failure::cancelled());
        }
    }

    if next.is_terminal() {
        job.throughput.download_bytes_per_sec = 0;
        job.throughput.upload_bytes_per_sec = 0;
    }
    job.status = next;
    job.updated_at = Utc::now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn magnet(n: u8) -> Descriptor {
        Descriptor::magnet(format!("magnet:?xt=urn:btih:{}", format!("{n:02x}").repeat(20)))
            .unwrap()
    }

    fn entries() -> Vec<FileEntry> {
        vec![
            FileEntry {
                name: "a".to_string(),
                size: 100,
            },
            FileEntry {
                name: "b".to_string(),
                size: 200,
            },
        ]
    }

    fn uploading(reg: &JobRegistry, n: u8) -> JobId {
        let (id, _) = reg.submit(magnet(n)).unwrap();
        reg.update_status(&id, Transition::BeginFetch).unwrap();
        reg.update_status(
            &id,
            Transition::BeginUpload {
                folder_id: "folder".to_string(),
                name: None,
                files: entries(),
            },
        )
        .unwrap();
        id
    }

    fn settle(reg: &JobRegistry, id: &JobId) -> JobStatus {
        let generation = reg.get(id).unwrap().generation;
        reg.settle(id, generation).unwrap()
    }

    fn progress(done: u64) -> FetchProgress {
        FetchProgress {
            bytes_done: done,
            bytes_total: 1000,
            peer_count: 3,
        }
    }

    #[test]
    fn submit_is_idempotent_while_live() {
        let reg = JobRegistry::new();
        let (a, s1) = reg.submit(magnet(1)).unwrap();
        let (b, s2) = reg.submit(magnet(1)).unwrap();
        assert_eq!(a, b);
        assert!(s1);
        assert!(!s2);
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn failed_or_cancelled_job_is_replaced_on_resubmit() {
        let reg = JobRegistry::new();
        let (id, _) = reg.submit(magnet(1)).unwrap();
        reg.update_status(&id, Transition::Cancel).unwrap();
        let (again, s) = reg.submit(magnet(1)).unwrap();
        assert_eq!(id, again);
        assert!(s);
        assert_eq!(reg.get(&id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn invalid_transition_leaves_state_untouched() {
        let reg = JobRegistry::new();
        let (id, _) = reg.submit(magnet(1)).unwrap();
        let before = reg.get(&id).unwrap();
        let err = reg.update_status(&id, Transition::Complete).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        let after = reg.get(&id).unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn begin_upload_requires_files() {
        let reg = JobRegistry::new();
        let (id, _) = reg.submit(magnet(1)).unwrap();
        reg.update_status(&id, Transition::BeginFetch).unwrap();
        let err = reg
            .update_status(
                &id,
                Transition::BeginUpload {
                    folder_id: "f".to_string(),
                    name: None,
                    files: Vec::new(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(reg.get(&id).unwrap().status, JobStatus::Fetching);
    }

    #[test]
    fn unknown_job_and_file_are_not_found() {
        let reg = JobRegistry::new();
        assert!(matches!(
            reg.get(&JobId::from("nope")),
            Err(Error::NotFound { .. })
        ));
        let id = uploading(&reg, 1);
        assert!(matches!(
            reg.mutate_file(&id, "missing", |_| ()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn settle_completes_only_when_all_files_complete() {
        let reg = JobRegistry::new();
        let id = uploading(&reg, 1);
        reg.mutate_file(&id, "a", |f| f.complete()).unwrap();
        assert_eq!(settle(&reg, &id), JobStatus::Uploading);
        reg.mutate_file(&id, "b", |f| f.complete()).unwrap();
        assert_eq!(settle(&reg, &id), JobStatus::Completed);

        let snap = reg.get(&id).unwrap();
        assert_eq!(snap.file("a").unwrap().uploaded_bytes, 100);
        assert_eq!(snap.file("b").unwrap().uploaded_bytes, 200);
    }

    #[test]
    fn settle_fails_when_any_file_failed() {
        let reg = JobRegistry::new();
        let id = uploading(&reg, 1);
        reg.mutate_file(&id, "a", |f| {
            f.fail(Failure::new(FailureKind::UploadPermanent, "quota"))
        })
        .unwrap();
        reg.mutate_file(&id, "b", |f| f.complete()).unwrap();
        assert_eq!(settle(&reg, &id), JobStatus::Failed);
        let snap = reg.get(&id).unwrap();
        assert_eq!(
            snap.failure.map(|f| f.kind),
            Some(FailureKind::UploadPermanent)
        );
    }

    #[test]
    fn cancel_marks_unfinished_files_failed() {
        let reg = JobRegistry::new();
        let id = uploading(&reg, 1);
        reg.mutate_file(&id, "a", |f| f.complete()).unwrap();
        let snap = reg.update_status(&id, Transition::Cancel).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert_eq!(snap.file("a").unwrap().status, FileStatus::Completed);
        let b = snap.file("b").unwrap();
        assert_eq!(b.status, FileStatus::Failed);
        assert_eq!(
            b.last_error.as_ref().map(|e| e.kind),
            Some(FailureKind::Cancelled)
        );
        assert_eq!(settle(&reg, &id), JobStatus::Cancelled);
    }

    #[test]
    fn list_is_ordered_by_creation() {
        let reg = JobRegistry::new();
        for n in [3u8, 1, 2] {
            reg.submit(magnet(n)).unwrap();
        }
        let ids: Vec<String> = reg
            .list()
            .into_iter()
            .map(|j| j.id.as_str()[..2].to_string())
            .collect();
        assert_eq!(ids, vec!["03", "01", "02"]);
    }

    #[test]
    fn purge_only_removes_terminal_jobs() {
        let reg = JobRegistry::new();
        let (id, _) = reg.submit(magnet(1)).unwrap();
        assert!(matches!(
            reg.purge(&id),
            Err(Error::InvalidTransition { .. })
        ));
        reg.update_status(&id, Transition::Cancel).unwrap();
        reg.purge(&id).unwrap();
        assert!(reg.list().is_empty());
        assert!(matches!(reg.purge(&id), Err(Error::NotFound { .. })));
    }

    #[test]
    fn snapshots_are_detached_from_live_state() {
        let reg = JobRegistry::new();
        let id = uploading(&reg, 1);
        let snap = reg.get(&id).unwrap();
        reg.mutate_file(&id, "a", |f| {
            f.status = FileStatus::Uploading;
            f.record_progress(50);
        })
        .unwrap();
        assert_eq!(snap.file("a").unwrap().uploaded_bytes, 0);
        assert_eq!(reg.get(&id).unwrap().file("a").unwrap().uploaded_bytes, 50);
    }

    #[test]
    fn resubmission_gets_a_new_generation() {
        let reg = JobRegistry::new();
        let (id, _) = reg.submit(magnet(1)).unwrap();
        let first = reg.get(&id).unwrap().generation;
        reg.update_status(&id, Transition::Cancel).unwrap();
        reg.submit(magnet(1)).unwrap();
        let second = reg.get(&id).unwrap().generation;
        assert_ne!(first, second);

        let err = reg
            .update_status_at(&id, first, Transition::BeginFetch)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(matches!(reg.settle(&id, first), Err(Error::NotFound { .. })));
        assert_eq!(reg.get(&id).unwrap().status, JobStatus::Pending);

        reg.update_status_at(&id, second, Transition::BeginFetch)
            .unwrap();
        assert_eq!(reg.get(&id).unwrap().status, JobStatus::Fetching);
    }

    #[test]
    fn fetch_samples_yield_rate_and_eta() {
        let reg = JobRegistry::new();
        let (id, _) = reg.submit(magnet(1)).unwrap();
        let t0 = Instant::now();

        reg.set_fetch_progress_at(&id, progress(0), t0).unwrap();
        let snap = reg.get(&id).unwrap();
        assert_eq!(snap.throughput.download_bytes_per_sec, 0);
        assert_eq!(snap.throughput.fetch_eta_ms, None);

        // Inside the sampling window the rate is not recomputed.
        reg.set_fetch_progress_at(&id, progress(50), t0 + Duration::from_millis(100))
            .unwrap();
        assert_eq!(reg.get(&id).unwrap().throughput.download_bytes_per_sec, 0);

        reg.set_fetch_progress_at(&id, progress(200), t0 + Duration::from_secs(1))
            .unwrap();
        let t = reg.get(&id).unwrap().throughput;
        assert_eq!(t.download_bytes_per_sec, 200);
        assert_eq!(t.fetch_percent, 20);
        assert_eq!(t.fetch_eta_ms, Some(4000));

        reg.set_fetch_progress_at(&id, progress(1000), t0 + Duration::from_secs(2))
            .unwrap();
        let t = reg.get(&id).unwrap().throughput;
        assert_eq!(t.download_bytes_per_sec, 800);
        assert_eq!(t.fetch_percent, 100);
        assert_eq!(t.fetch_eta_ms, Some(0));
    }

    #[test]
    fn upload_rate_follows_file_progress_and_stops_when_done() {
        let reg = JobRegistry::new();
        let id = uploading(&reg, 1);
        let t0 = Instant::now();
        let bump = |name: &str, bytes: u64, at: Instant| {
            reg.mutate_file_at(&id, name, at, |f| {
                f.status = FileStatus::Uploading;
                f.record_progress(bytes);
            })
            .unwrap();
        };

        bump("a", 0, t0);
        bump("a", 100, t0 + Duration::from_millis(500));
        assert_eq!(reg.get(&id).unwrap().throughput.upload_bytes_per_sec, 200);
        bump("b", 200, t0 + Duration::from_millis(1500));
        assert_eq!(reg.get(&id).unwrap().throughput.upload_bytes_per_sec, 200);

        reg.mutate_file(&id, "a", |f| f.complete()).unwrap();
        reg.mutate_file(&id, "b", |f| f.complete()).unwrap();
        assert_eq!(settle(&reg, &id), JobStatus::Completed);
        assert_eq!(reg.get(&id).unwrap().throughput.upload_bytes_per_sec, 0);
    }
}
