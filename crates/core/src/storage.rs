use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{Error, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Readable byte stream of one file's content.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Remote object storage the acquired files are streamed into.
///
/// Upload failures must be reported as [`Error::Destination`] so the caller
/// can tell transient failures from permanent ones.
pub trait ObjectStore: Send + Sync {
    fn provider(&self) -> &'static str;

    fn create_folder<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String>>;

    fn upload_stream<'a>(
        &'a self,
        folder_id: &'a str,
        name: &'a str,
        stream: ByteStream,
    ) -> BoxFuture<'a, Result<String>>;
}

/// Stores folders as directories below `root`.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStore for LocalDirStore {
    fn provider(&self) -> &'static str {
        "local.dir"
    }

    fn create_folder<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let id = uuid::Uuid::new_v4().simple().to_string();
            let folder_id = format!("{}-{}", sanitize_folder_name(name), &id[..8]);
            tokio::fs::create_dir_all(self.root.join(&folder_id))
                .await
                .map_err(|e| classify_io("create folder", e))?;
            Ok(folder_id)
        })
    }

    fn upload_stream<'a>(
        &'a self,
        folder_id: &'a str,
        name: &'a str,
        mut stream: ByteStream,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let folder = self.root.join(folder_id);
            if !tokio::fs::try_exists(&folder).await.unwrap_or(false) {
                return Err(Error::permanent(format!("unknown folder: {folder_id}")));
            }
            let rel = relative_object_path(name)?;
            let path = folder.join(&rel);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| classify_io("create parent", e))?;
            }

            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(|e| classify_io("create object", e))?;
            tokio::io::copy(&mut stream, &mut file)
                .await
                .map_err(|e| classify_io("write object", e))?;
            file.flush()
                .await
                .map_err(|e| classify_io("flush object", e))?;

            Ok(format!("{folder_id}/{name}"))
        })
    }
}

fn classify_io(op: &str, e: std::io::Error) -> Error {
    use std::io::ErrorKind;
    let message = format!("{op}: {e}");
    match e.kind() {
        ErrorKind::PermissionDenied
        | ErrorKind::StorageFull
        | ErrorKind::ReadOnlyFilesystem
        | ErrorKind::InvalidInput => Error::permanent(message),
        _ => Error::transient(message),
    }
}

fn relative_object_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(Error::permanent(format!("object name rejected: {name:?}")));
    }
    Ok(path.to_path_buf())
}

fn sanitize_folder_name(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' | ' ' => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "content".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    folders: Mutex<HashMap<String, String>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, object_id: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(object_id).cloned()
    }

    pub async fn folder_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.folders.lock().await.values().cloned().collect();
        names.sort();
        names
    }
}

impl ObjectStore for InMemoryStore {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn create_folder<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let folder_id = format!("memdir:{}", uuid::Uuid::new_v4());
            self.folders
                .lock()
                .await
                .insert(folder_id.clone(), name.to_string());
            Ok(folder_id)
        })
    }

    fn upload_stream<'a>(
        &'a self,
        folder_id: &'a str,
        name: &'a str,
        mut stream: ByteStream,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if !self.folders.lock().await.contains_key(folder_id) {
                return Err(Error::permanent(format!("unknown folder: {folder_id}")));
            }
            let mut bytes = Vec::new();
            stream
                .read_to_end(&mut bytes)
                .await
                .map_err(|e| Error::transient(format!("read source: {e}")))?;
            let object_id = format!("{folder_id}/{name}");
            self.objects.lock().await.insert(object_id.clone(), bytes);
            Ok(object_id)
        })
    }
}
