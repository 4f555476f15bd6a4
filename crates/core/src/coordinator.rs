use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::descriptor::{Descriptor, JobId};
use crate::fetcher::{FetchEvent, FetchSession, PeerFetcher, ReadyInfo};
use crate::model::{Failure, FailureKind, JobSnapshot, JobStatus};
use crate::pool::{Destination, PoolConfig, StreamSource, UploadOutcome, UploadWorkerPool};
use crate::registry::{JobRegistry, Transition};
use crate::storage::{BoxFuture, ByteStream, ObjectStore};
use crate::{Error, Result};

/// Drives jobs from submission through acquisition and upload to a terminal
/// state. Every job mutation goes through the [`JobRegistry`].
pub struct Coordinator {
    registry: Arc<JobRegistry>,
    fetcher: Arc<dyn PeerFetcher>,
    store: Arc<dyn ObjectStore>,
    pool: UploadWorkerPool,
    tokens: Mutex<HashMap<JobId, JobToken>>,
    shutdown: CancellationToken,
}

/// Cancellation handle of one job generation.
struct JobToken {
    generation: u64,
    token: CancellationToken,
}

impl Coordinator {
    /// Must be called from within a tokio runtime.
    pub fn new(
        fetcher: Arc<dyn PeerFetcher>,
        store: Arc<dyn ObjectStore>,
        config: PoolConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(JobRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = UploadWorkerPool::new(registry.clone(), store.clone(), config, tx);
        let coordinator = Arc::new(Self {
            registry,
            fetcher,
            store,
            pool,
            tokens: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(settle_loop(Arc::downgrade(&coordinator), rx));
        coordinator
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Registers the descriptor and starts acquisition for a newly created job.
    /// Resubmitting content with live work returns the existing id.
    pub fn add_job(self: &Arc<Self>, descriptor: Descriptor) -> Result<(JobId, bool)> {
        let (id, created) = self.registry.submit(descriptor)?;
        info!(event = "job.submitted", job_id = %id, created, "job.submitted");
        if created {
            self.start_job(&id)?;
        }
        Ok((id, created))
    }

    /// Begins acquisition for a pending job. A second call fails with
    /// [`Error::InvalidTransition`] and leaves the running job untouched.
    pub fn start_job(self: &Arc<Self>, id: &JobId) -> Result<()> {
        let snapshot = self.registry.get(id)?;
        let generation = snapshot.generation;
        let token = self.shutdown.child_token();
        {
            let mut tokens = self.tokens_lock();
            if let Some(live) = tokens.get(id) {
                if live.generation == generation {
                    return Err(Error::InvalidTransition {
                        job_id: id.to_string(),
                        from: snapshot.status.as_str(),
                        to: JobStatus::Fetching.as_str(),
                    });
                }
                // Left over from the job this one replaced.
                live.token.cancel();
            }
            tokens.insert(
                id.clone(),
                JobToken {
                    generation,
                    token: token.clone(),
                },
            );
        }
        if let Err(e) = self
            .registry
            .update_status_at(id, generation, Transition::BeginFetch)
        {
            self.take_token(id, generation);
            return Err(e);
        }

        let handle = match self.fetcher.begin(&snapshot.source, token.child_token()) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_job(
                    id,
                    generation,
                    Failure::new(FailureKind::FetchFailed, e.to_string()),
                );
                return Ok(());
            }
        };
        info!(event = "job.fetch_started", job_id = %id, generation, "job.fetch_started");

        let driver = JobDriver {
            coordinator: self.clone(),
            job_id: id.clone(),
            generation,
            token,
            session: handle.session,
            ready: false,
        };
        tokio::spawn(driver.run(handle.events));
        Ok(())
    }

    pub fn job(&self, id: &JobId) -> Result<JobSnapshot> {
        self.registry.get(id)
    }

    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.registry.list()
    }

    /// Aborts acquisition and uploads of a job. Cancelling a job that already
    /// finished returns its snapshot unchanged.
    pub fn cancel_job(&self, id: &JobId) -> Result<JobSnapshot> {
        let snapshot = self.registry.get(id)?;
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }
        let generation = snapshot.generation;
        if let Some(token) = self.take_token(id, generation) {
            token.cancel();
        }
        match self
            .registry
            .update_status_at(id, generation, Transition::Cancel)
        {
            Ok(snapshot) => {
                info!(event = "job.cancelled", job_id = %id, generation, "job.cancelled");
                Ok(snapshot)
            }
            // Settled or was replaced between the read and the transition.
            Err(Error::InvalidTransition { .. } | Error::NotFound { .. }) => self.registry.get(id),
            Err(e) => Err(e),
        }
    }

    pub fn purge_job(&self, id: &JobId) -> Result<JobSnapshot> {
        let snapshot = self.registry.purge(id)?;
        debug!(event = "job.purged", job_id = %id, "job.purged");
        Ok(snapshot)
    }

    /// Cancels every live job and stops all background work.
    pub fn shutdown(&self) {
        for job in self.registry.list() {
            if !job.status.is_terminal() {
                let _ = self.cancel_job(&job.id);
            }
        }
        self.shutdown.cancel();
    }

    fn tokens_lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the token of `generation`; a newer job's token stays in place.
    fn take_token(&self, id: &JobId, generation: u64) -> Option<CancellationToken> {
        let mut tokens = self.tokens_lock();
        match tokens.get(id) {
            Some(live) if live.generation == generation => tokens.remove(id).map(|t| t.token),
            _ => None,
        }
    }

    fn on_upload_outcome(&self, outcome: UploadOutcome) {
        match self.registry.settle(&outcome.job_id, outcome.generation) {
            Ok(status) if status.is_terminal() => {
                self.finish(&outcome.job_id, outcome.generation, status)
            }
            Ok(_) => {}
            Err(e) => debug!(
                event = "job.settle_skipped",
                job_id = %outcome.job_id,
                error = %e,
                "job.settle_skipped"
            ),
        }
    }

    fn fail_job(&self, id: &JobId, generation: u64, failure: Failure) {
        error!(
            event = "job.failed",
            job_id = %id,
            kind = ?failure.kind,
            message = %failure.message,
            "job.failed"
        );
        match self
            .registry
            .update_status_at(id, generation, Transition::Fail(failure))
        {
            Ok(_) => self.finish(id, generation, JobStatus::Failed),
            Err(e) => debug!(event = "job.fail_skipped", job_id = %id, error = %e, "job.fail_skipped"),
        }
    }

    /// Releases the job's token once it reached a terminal state, which also
    /// stops its acquisition.
    fn finish(&self, id: &JobId, generation: u64, status: JobStatus) {
        let Some(token) = self.take_token(id, generation) else {
            return;
        };
        token.cancel();
        info!(event = "job.finish", job_id = %id, status = status.as_str(), "job.finish");
    }
}

async fn settle_loop(
    coordinator: Weak<Coordinator>,
    mut outcomes: mpsc::UnboundedReceiver<UploadOutcome>,
) {
    while let Some(outcome) = outcomes.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        coordinator.on_upload_outcome(outcome);
    }
}

struct SessionFileSource {
    session: Arc<dyn FetchSession>,
    name: String,
}

impl StreamSource for SessionFileSource {
    fn open(&self) -> BoxFuture<'_, Result<ByteStream>> {
        self.session.open_file(&self.name)
    }
}

/// Consumes one job's acquisition events. Readiness and error are honoured
/// once; anything after the first of them is logged and dropped.
struct JobDriver {
    coordinator: Arc<Coordinator>,
    job_id: JobId,
    generation: u64,
    token: CancellationToken,
    session: Arc<dyn FetchSession>,
    ready: bool,
}

impl JobDriver {
    async fn run(mut self, mut events: mpsc::Receiver<FetchEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                ev = events.recv() => ev,
            };
            match event {
                Some(FetchEvent::Progress(progress)) => {
                    let _ = self
                        .coordinator
                        .registry
                        .set_fetch_progress(&self.job_id, progress);
                }
                Some(FetchEvent::Ready(info)) if self.ready => {
                    warn!(
                        event = "fetch.duplicate_ready",
                        job_id = %self.job_id,
                        files = info.files.len(),
                        "fetch.duplicate_ready"
                    );
                }
                Some(FetchEvent::Ready(info)) => {
                    self.ready = true;
                    self.on_ready(info).await;
                }
                Some(FetchEvent::Error(message)) if self.ready => {
                    warn!(
                        event = "fetch.error_after_ready",
                        job_id = %self.job_id,
                        message = %message,
                        "fetch.error_after_ready"
                    );
                }
                Some(FetchEvent::Error(message)) => {
                    self.fail(FailureKind::FetchFailed, message);
                    return;
                }
                None => {
                    if !self.ready {
                        self.fail(
                            FailureKind::FetchFailed,
                            "acquisition ended before readiness".to_string(),
                        );
                    }
                    return;
                }
            }
        }
    }

    async fn on_ready(&self, info: ReadyInfo) {
        if info.files.is_empty() {
            self.fail(
                FailureKind::FetchFailed,
                "acquisition reported no files".to_string(),
            );
            return;
        }
        let mut seen = HashSet::new();
        if let Some(dup) = info.files.iter().find(|f| !seen.insert(f.name.as_str())) {
            self.fail(
                FailureKind::FetchFailed,
                format!("acquisition reported duplicate file {:?}", dup.name),
            );
            return;
        }

        let folder_name = info
            .name
            .clone()
            .or_else(|| {
                self.coordinator
                    .registry
                    .get(&self.job_id)
                    .ok()
                    .and_then(|j| j.name)
            })
            .unwrap_or_else(|| self.job_id.to_string());

        let store = &self.coordinator.store;
        let created = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            r = store.create_folder(&folder_name) => r,
        };
        let folder_id = match created {
            Ok(id) => id,
            Err(e) => {
                self.fail(FailureKind::DestinationInitFailed, e.to_string());
                return;
            }
        };

        let snapshot = match self.coordinator.registry.update_status_at(
            &self.job_id,
            self.generation,
            Transition::BeginUpload {
                folder_id: folder_id.clone(),
                name: info.name,
                files: info.files,
            },
        ) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(event = "job.ready_skipped", job_id = %self.job_id, error = %e, "job.ready_skipped");
                return;
            }
        };
        info!(
            event = "job.ready",
            job_id = %self.job_id,
            provider = store.provider(),
            folder_id = %folder_id,
            files = snapshot.files.len(),
            bytes = snapshot.total_bytes(),
            "job.ready"
        );

        for file in snapshot.files {
            let source = Arc::new(SessionFileSource {
                session: self.session.clone(),
                name: file.name.clone(),
            });
            let destination = Destination {
                folder_id: folder_id.clone(),
                name: file.name.clone(),
            };
            self.coordinator.pool.enqueue(
                self.job_id.clone(),
                self.generation,
                file,
                source,
                destination,
                self.token.clone(),
            );
        }
    }

    fn fail(&self, kind: FailureKind, message: String) {
        self.coordinator
            .fail_job(&self.job_id, self.generation, Failure::new(kind, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchHandle;
    use crate::model::FileStatus;
    use crate::storage::InMemoryStore;

    /// Acquisition that never becomes ready and records its tokens.
    #[derive(Default)]
    struct StalledFetcher {
        tokens: Mutex<Vec<CancellationToken>>,
    }

    struct NoFiles;

    impl FetchSession for NoFiles {
        fn open_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<ByteStream>> {
            Box::pin(async move {
                Err(Error::NotFound {
                    what: format!("file {name:?}"),
                })
            })
        }
    }

    impl PeerFetcher for StalledFetcher {
        fn begin(&self, _descriptor: &Descriptor, cancel: CancellationToken) -> Result<FetchHandle> {
            self.tokens.lock().unwrap().push(cancel.clone());
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                cancel.cancelled().await;
                drop(tx);
            });
            Ok(FetchHandle {
                events: rx,
                session: Arc::new(NoFiles),
            })
        }
    }

    fn descriptor() -> Descriptor {
        Descriptor::magnet(format!("magnet:?xt=urn:btih:{}", "cd".repeat(20))).unwrap()
    }

    #[tokio::test]
    async fn late_settlement_of_replaced_job_spares_its_successor() {
        let fetcher = Arc::new(StalledFetcher::default());
        let coordinator = Coordinator::new(
            fetcher.clone(),
            Arc::new(InMemoryStore::new()),
            PoolConfig::default(),
        );

        let (id, _) = coordinator.add_job(descriptor()).unwrap();
        let old = coordinator.job(&id).unwrap().generation;
        coordinator.cancel_job(&id).unwrap();

        let (again, created) = coordinator.add_job(descriptor()).unwrap();
        assert!(created);
        assert_eq!(again, id);
        let current = coordinator.job(&id).unwrap();
        assert_ne!(current.generation, old);
        assert_eq!(current.status, JobStatus::Fetching);

        // Work of the replaced generation finishing after the resubmission.
        coordinator.fail_job(&id, old, Failure::new(FailureKind::FetchFailed, "late"));
        coordinator.on_upload_outcome(UploadOutcome {
            job_id: id.clone(),
            generation: old,
            file_name: "a".to_string(),
            status: FileStatus::Failed,
        });
        coordinator.finish(&id, old, JobStatus::Failed);

        let tokens = fetcher.tokens.lock().unwrap().clone();
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].is_cancelled());
        assert!(!tokens[1].is_cancelled());
        assert_eq!(coordinator.job(&id).unwrap().status, JobStatus::Fetching);

        coordinator.cancel_job(&id).unwrap();
        assert!(tokens[1].is_cancelled());
    }
}
