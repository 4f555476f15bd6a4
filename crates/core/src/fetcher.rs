use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use crate::descriptor::Descriptor;
use crate::model::{FetchProgress, FileEntry};
use crate::storage::{BoxFuture, ByteStream};
use crate::{Error, Result};

const EVENT_BUFFER: usize = 64;

/// Readiness payload: the content's file list, known once acquisition has
/// resolved the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyInfo {
    pub name: Option<String>,
    pub files: Vec<FileEntry>,
}

/// Events emitted by an acquisition. `Ready` and `Error` are mutually
/// exclusive and each delivered at most once; `Progress` may repeat.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    Ready(ReadyInfo),
    Progress(FetchProgress),
    Error(String),
}

/// Per-acquisition access to file content after readiness.
pub trait FetchSession: Send + Sync {
    fn open_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<ByteStream>>;
}

pub struct FetchHandle {
    pub events: mpsc::Receiver<FetchEvent>,
    pub session: Arc<dyn FetchSession>,
}

/// Peer-to-peer acquisition capability.
///
/// `begin` returns immediately; progress and the readiness/error outcome are
/// delivered on the handle's event channel. Cancelling `cancel` stops the
/// acquisition.
pub trait PeerFetcher: Send + Sync {
    fn begin(&self, descriptor: &Descriptor, cancel: CancellationToken) -> Result<FetchHandle>;
}

/// Resolves content from pre-seeded directories laid out as
/// `<seed_dir>/<job id>/...`.
#[derive(Debug, Clone)]
pub struct SeedDirFetcher {
    seed_dir: PathBuf,
}

impl SeedDirFetcher {
    pub fn new(seed_dir: impl Into<PathBuf>) -> Self {
        Self {
            seed_dir: seed_dir.into(),
        }
    }
}

impl PeerFetcher for SeedDirFetcher {
    fn begin(&self, descriptor: &Descriptor, cancel: CancellationToken) -> Result<FetchHandle> {
        let id = descriptor.job_id()?;
        let root = self.seed_dir.join(id.as_str());
        let name = descriptor.display_name();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let scan_root = root.clone();
        tokio::spawn(async move {
            let scanned = tokio::task::spawn_blocking(move || scan_seed_dir(&scan_root)).await;
            if cancel.is_cancelled() {
                return;
            }
            let event = match scanned {
                Ok(Ok(files)) if !files.is_empty() => {
                    let total: u64 = files.iter().map(|f| f.size).sum();
                    let _ = tx
                        .send(FetchEvent::Progress(FetchProgress {
                            bytes_done: total,
                            bytes_total: total,
                            peer_count: 1,
                        }))
                        .await;
                    FetchEvent::Ready(ReadyInfo { name, files })
                }
                Ok(Ok(_)) => FetchEvent::Error("no seeded files for content".to_string()),
                Ok(Err(e)) => FetchEvent::Error(e.to_string()),
                Err(e) => FetchEvent::Error(format!("seed scan aborted: {e}")),
            };
            debug!(event = "fetch.seed_resolved", job_id = %id, "fetch.seed_resolved");
            let _ = tx.send(event).await;
        });

        Ok(FetchHandle {
            events: rx,
            session: Arc::new(SeedDirSession { root }),
        })
    }
}

fn scan_seed_dir(root: &Path) -> Result<Vec<FileEntry>> {
    if !root.is_dir() {
        return Err(Error::FetchFailed {
            message: format!("content not seeded at {}", root.display()),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| Error::FetchFailed {
            message: format!("seed scan failed: {e}"),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::FetchFailed {
                message: "seed path strip_prefix failed".to_string(),
            })?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(FileEntry {
            name,
            size: entry.metadata().map_err(|e| Error::FetchFailed {
                message: format!("seed stat failed: {e}"),
            })?.len(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

struct SeedDirSession {
    root: PathBuf,
}

impl FetchSession for SeedDirSession {
    fn open_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<ByteStream>> {
        Box::pin(async move {
            let rel = Path::new(name);
            if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
                return Err(Error::NotFound {
                    what: format!("file {name:?}"),
                });
            }
            let file = tokio::fs::File::open(self.root.join(rel)).await?;
            Ok(Box::new(file) as ByteStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    fn descriptor() -> Descriptor {
        Descriptor::magnet(format!("magnet:?xt=urn:btih:{}&dn=Seeded", "ab".repeat(20))).unwrap()
    }

    #[tokio::test]
    async fn seeded_content_reports_progress_then_ready() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ab".repeat(20));
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("b.bin"), [1u8; 200]).unwrap();
        std::fs::write(root.join("sub/a.bin"), [2u8; 100]).unwrap();

        let fetcher = SeedDirFetcher::new(dir.path());
        let mut handle = fetcher
            .begin(&descriptor(), CancellationToken::new())
            .unwrap();

        let first = handle.events.recv().await.unwrap();
        assert!(matches!(
            first,
            FetchEvent::Progress(FetchProgress {
                bytes_done: 300,
                bytes_total: 300,
                ..
            })
        ));
        let FetchEvent::Ready(info) = handle.events.recv().await.unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(info.name.as_deref(), Some("Seeded"));
        let names: Vec<&str> = info.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["b.bin", "sub/a.bin"]);
        assert!(handle.events.recv().await.is_none());

        let mut stream = handle.session.open_file("sub/a.bin").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, vec![2u8; 100]);
    }

    #[tokio::test]
    async fn missing_seed_reports_error_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = SeedDirFetcher::new(dir.path());
        let mut handle = fetcher
            .begin(&descriptor(), CancellationToken::new())
            .unwrap();
        assert!(matches!(
            handle.events.recv().await,
            Some(FetchEvent::Error(_))
        ));
        assert!(handle.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn session_refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = SeedDirFetcher::new(dir.path());
        let handle = fetcher
            .begin(&descriptor(), CancellationToken::new())
            .unwrap();
        assert!(handle.session.open_file("../x").await.is_err());
    }
}
