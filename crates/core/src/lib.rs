pub mod config;
pub mod control;
mod coordinator;
mod descriptor;
mod error;
mod fetcher;
pub mod logging;
mod model;
mod pool;
mod registry;
pub mod status;
mod storage;

pub const APP_NAME: &str = "seedferry";

pub use coordinator::Coordinator;
pub use descriptor::{Descriptor, JobId};
pub use error::{Error, Result};
pub use fetcher::{FetchEvent, FetchHandle, FetchSession, PeerFetcher, ReadyInfo, SeedDirFetcher};
pub use model::{
    FailureKind, Failure, FetchProgress, FileEntry, FileStatus, FileTransfer, JobSnapshot,
    JobStatus, Throughput, TransferJob, aggregate_status,
};
pub use pool::{
    Destination, PoolConfig, RetryPolicy, StreamSource, UploadOutcome, UploadWorkerPool,
};
pub use registry::{JobRegistry, Transition};
pub use storage::{BoxFuture, ByteStream, InMemoryStore, LocalDirStore, ObjectStore};
