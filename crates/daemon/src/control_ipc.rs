use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};

use seedferry_core::control::{
    ControlError, ControlRequest, ControlResponse, JobIdParams, JobsAddParams, JobsAddResult,
    JobsCancelResult, JobsListResult, MAX_REQUEST_LINE_BYTES,
};
use seedferry_core::{Coordinator, Descriptor, JobId};

pub struct ControlIpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ControlIpcServerHandle {
    pub async fn shutdown(self) {
        let mut this = self;
        if let Some(tx) = this.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&this.socket_path);
    }
}

impl Drop for ControlIpcServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

pub fn spawn_control_ipc_server(
    socket_path: PathBuf,
    coordinator: Arc<Coordinator>,
) -> std::io::Result<ControlIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
            {
                tracing::error!(
                    event = "control.ipc_permissions_failed",
                    error = %e,
                    path = %parent.display(),
                    "control.ipc_permissions_failed"
                );
                return Err(e);
            }
        }
    }

    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        {
            tracing::error!(
                event = "control.ipc_permissions_failed",
                error = %e,
                path = %socket_path.display(),
                "control.ipc_permissions_failed"
            );
            drop(listener);
            let _ = std::fs::remove_file(&socket_path);
            return Err(e);
        }
    }

    let handle_socket_path = socket_path.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let (shutdown_broadcast, _) = broadcast::channel::<()>(8);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = shutdown_broadcast.send(());
                    break;
                }
                accept = listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(
                                event = "control.ipc_accept_failed",
                                error = %e,
                                path = %socket_path.display(),
                                "control.ipc_accept_failed"
                            );
                            continue;
                        }
                    };

                    let mut shutdown = shutdown_broadcast.subscribe();
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_control_ipc_client(stream, &coordinator, &mut shutdown).await {
                            tracing::debug!(
                                event = "control.ipc_client_failed",
                                error = %e,
                                "control.ipc_client_failed"
                            );
                        }
                    });
                }
            }
        }
    });

    Ok(ControlIpcServerHandle {
        socket_path: handle_socket_path,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn handle_control_ipc_client(
    stream: UnixStream,
    coordinator: &Arc<Coordinator>,
    shutdown: &mut broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (r, w) = stream.into_split();
    let mut r = BufReader::new(r);
    let mut w = BufWriter::new(w);

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        if buf.len() > MAX_REQUEST_LINE_BYTES {
            break;
        }

        tokio::select! {
            res = r.read(&mut chunk) => {
                let n = res?;
                if n == 0 {
                    break;
                }

                if let Some(pos) = chunk[..n].iter().position(|b| *b == b'\n') {
                    buf.extend_from_slice(&chunk[..pos]);
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }

    if buf.is_empty() {
        return Ok(());
    }

    if buf.len() > MAX_REQUEST_LINE_BYTES {
        return write_json_line(
            &mut w,
            &ControlResponse::err(
                "unknown",
                ControlError::invalid_request(
                    "request too large",
                    serde_json::json!({ "maxBytes": MAX_REQUEST_LINE_BYTES }),
                ),
            ),
        )
        .await;
    }

    let req: ControlRequest = match serde_json::from_slice(buf.trim_ascii_end()) {
        Ok(x) => x,
        Err(e) => {
            return write_json_line(
                &mut w,
                &ControlResponse::err(
                    "unknown",
                    ControlError::invalid_request(
                        "invalid json",
                        serde_json::json!({ "error": e.to_string() }),
                    ),
                ),
            )
            .await;
        }
    };

    let resp = handle_request(&req, coordinator);
    write_json_line(&mut w, &resp).await
}

fn handle_request(req: &ControlRequest, coordinator: &Arc<Coordinator>) -> ControlResponse {
    if req.type_ != "control.request" || req.id.trim().is_empty() || req.method.trim().is_empty() {
        return ControlResponse::err(
            req.id.clone(),
            ControlError::invalid_request(
                "invalid request envelope",
                serde_json::json!({
                    "type": req.type_,
                    "method": req.method,
                }),
            ),
        );
    }

    tracing::debug!(
        event = "control.request",
        id = %req.id,
        method = %req.method,
        "control.request"
    );

    let result = match req.method.as_str() {
        "jobs.add" => params::<JobsAddParams>(req).and_then(|p| jobs_add(coordinator, p)),
        "jobs.list" => to_result(&JobsListResult {
            jobs: coordinator.list_jobs(),
        }),
        "jobs.get" => params::<JobIdParams>(req).and_then(|p| {
            let job = coordinator
                .job(&JobId::new(p.job_id))
                .map_err(|e| ControlError::from_core(&e))?;
            to_result(&job)
        }),
        "jobs.cancel" => params::<JobIdParams>(req).and_then(|p| {
            let job = coordinator
                .cancel_job(&JobId::new(p.job_id))
                .map_err(|e| ControlError::from_core(&e))?;
            to_result(&JobsCancelResult {
                job_id: job.id.to_string(),
                status: job.status,
            })
        }),
        "jobs.purge" => params::<JobIdParams>(req).and_then(|p| {
            let job = coordinator
                .purge_job(&JobId::new(p.job_id))
                .map_err(|e| ControlError::from_core(&e))?;
            to_result(&job)
        }),
        _ => Err(ControlError::method_not_found(
            "method not found",
            serde_json::json!({ "method": req.method }),
        )),
    };

    match result {
        Ok(v) => ControlResponse::ok(req.id.clone(), v),
        Err(e) => ControlResponse::err(req.id.clone(), e),
    }
}

fn jobs_add(
    coordinator: &Arc<Coordinator>,
    p: JobsAddParams,
) -> Result<serde_json::Value, ControlError> {
    let descriptor = match (p.magnet_uri, p.descriptor_file) {
        (Some(uri), None) => Descriptor::magnet(uri),
        (None, Some(file)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(file.content_base64.trim())
                .map_err(|e| {
                    ControlError::invalid_request(
                        "descriptorFile.contentBase64 is not valid base64",
                        serde_json::json!({ "error": e.to_string() }),
                    )
                })?;
            Descriptor::file(file.name, bytes)
        }
        _ => {
            return Err(ControlError::invalid_request(
                "exactly one of magnetUri and descriptorFile is required",
                serde_json::json!({}),
            ));
        }
    }
    .map_err(|e| ControlError::from_core(&e))?;

    let (id, created) = coordinator
        .add_job(descriptor)
        .map_err(|e| ControlError::from_core(&e))?;
    to_result(&JobsAddResult {
        job_id: id.to_string(),
        created,
    })
}

fn params<T: DeserializeOwned>(req: &ControlRequest) -> Result<T, ControlError> {
    serde_json::from_value(req.params.clone()).map_err(|e| {
        ControlError::invalid_request(
            "invalid params",
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

fn to_result<T: serde::Serialize>(v: &T) -> Result<serde_json::Value, ControlError> {
    serde_json::to_value(v).map_err(|e| ControlError::internal(e.to_string()))
}

async fn write_json_line(
    w: &mut BufWriter<tokio::net::unix::OwnedWriteHalf>,
    v: &ControlResponse,
) -> std::io::Result<()> {
    let line = serde_json::to_string(v).map_err(|e| std::io::Error::other(e.to_string()))?;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use seedferry_core::{InMemoryStore, PoolConfig, SeedDirFetcher};
    use tokio::io::AsyncBufReadExt;

    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    async fn call(socket_path: &Path, req: &ControlRequest) -> ControlResponse {
        let stream = UnixStream::connect(socket_path).await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut r = tokio::io::BufReader::new(r).lines();

        let line = serde_json::to_string(req).unwrap() + "\n";
        w.write_all(line.as_bytes()).await.unwrap();
        w.flush().await.unwrap();

        let resp_line = r.next_line().await.unwrap().unwrap();
        serde_json::from_str(&resp_line).unwrap()
    }

    fn server(dir: &Path) -> (PathBuf, ControlIpcServerHandle) {
        let socket_path = dir.join("ipc").join("control.sock");
        let coordinator = Coordinator::new(
            Arc::new(SeedDirFetcher::new(dir.join("seeds"))),
            Arc::new(InMemoryStore::new()),
            PoolConfig::default(),
        );
        let handle = spawn_control_ipc_server(socket_path.clone(), coordinator).unwrap();
        (socket_path, handle)
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, _server) = server(dir.path());

        let req = ControlRequest::new("1", "unknown.method", serde_json::json!({}));
        let resp = call(&socket_path, &req).await;
        assert!(!resp.ok);
        assert_eq!(
            resp.error.as_ref().unwrap().code,
            "control.method_not_found"
        );
    }

    #[tokio::test]
    async fn jobs_add_dedupes_and_get_returns_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("seeds").join(HASH);
        std::fs::create_dir_all(&seed).unwrap();
        std::fs::write(seed.join("a.bin"), [1u8; 32]).unwrap();
        let (socket_path, _server) = server(dir.path());

        let add = ControlRequest::new(
            "1",
            "jobs.add",
            serde_json::json!({ "magnetUri": format!("magnet:?xt=urn:btih:{HASH}&dn=demo") }),
        );
        let resp = call(&socket_path, &add).await;
        assert!(resp.ok, "{resp:?}");
        let result: JobsAddResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.job_id, HASH);

        let get = ControlRequest::new("2", "jobs.get", serde_json::json!({ "jobId": HASH }));
        let resp = call(&socket_path, &get).await;
        assert!(resp.ok);
        assert_eq!(resp.result.unwrap()["id"], HASH);

        let list = ControlRequest::new("3", "jobs.list", serde_json::json!({}));
        let resp = call(&socket_path, &list).await;
        assert_eq!(resp.result.unwrap()["jobs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_descriptor_and_unknown_job_map_to_job_codes() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, _server) = server(dir.path());

        let add = ControlRequest::new(
            "1",
            "jobs.add",
            serde_json::json!({ "magnetUri": "invalid-magnet" }),
        );
        let resp = call(&socket_path, &add).await;
        assert_eq!(resp.error.unwrap().code, "job.invalid_descriptor");

        let add = ControlRequest::new(
            "2",
            "jobs.add",
            serde_json::json!({ "descriptorFile": { "name": "x.torrent", "contentBase64": "!!" } }),
        );
        let resp = call(&socket_path, &add).await;
        assert_eq!(resp.error.unwrap().code, "control.invalid_request");

        let cancel = ControlRequest::new("3", "jobs.cancel", serde_json::json!({ "jobId": "nope" }));
        let resp = call(&socket_path, &cancel).await;
        assert_eq!(resp.error.unwrap().code, "job.not_found");
    }

    #[tokio::test]
    async fn descriptor_file_travels_as_base64() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, _server) = server(dir.path());

        let content = base64::engine::general_purpose::STANDARD.encode(b"d4:infod4:name1:aee");
        let add = ControlRequest::new(
            "1",
            "jobs.add",
            serde_json::json!({ "descriptorFile": { "name": "show.torrent", "contentBase64": content } }),
        );
        let resp = call(&socket_path, &add).await;
        assert!(resp.ok, "{resp:?}");
        let result: JobsAddResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.job_id.len(), 40);
        assert!(result.created);
    }
}
