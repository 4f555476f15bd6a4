use std::path::PathBuf;
use std::sync::Arc;

use seedferry_core::config::{
    self as settings_config, CONFIG_DIR_ENV, DATA_DIR_ENV, default_config_dir, default_data_dir,
    resolve_dir,
};
use seedferry_core::control::control_ipc_socket_path;
use seedferry_core::status::{
    JobsStatusSnapshot, StatusWriteOptions, status_json_path,
    write_status_snapshot_json_atomic_with_options,
};
use seedferry_core::{Coordinator, LocalDirStore, SeedDirFetcher, logging};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

mod control_ipc;

const ACTIVE_TICK: Duration = Duration::from_millis(250);
const IDLE_TICK: Duration = Duration::from_secs(2);

async fn write_status(coordinator: &Coordinator, status_path: &PathBuf) {
    let snapshot = JobsStatusSnapshot::from_jobs(
        coordinator.list_jobs(),
        Some("seedferryd".to_string()),
    );

    // Atomic rename is enough; the snapshot is not durable state.
    let options = StatusWriteOptions {
        fsync_file: false,
        fsync_dir: false,
    };
    let path = status_path.clone();
    let res = tokio::task::spawn_blocking(move || {
        write_status_snapshot_json_atomic_with_options(&path, &snapshot, options)
    })
    .await;
    let err = match res {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    tracing::warn!(
        event = "status.write_failed",
        error = %err,
        path = %status_path.display(),
        "status.write_failed"
    );
}

async fn status_writer_loop(
    coordinator: Arc<Coordinator>,
    status_path: PathBuf,
    shutdown: CancellationToken,
) {
    loop {
        write_status(&coordinator, &status_path).await;

        let tick = if coordinator.registry().has_active() {
            ACTIVE_TICK
        } else {
            IDLE_TICK
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(tick) => {}
        }
    }
    write_status(&coordinator, &status_path).await;
}

async fn wait_for_stop_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_root = resolve_dir(None, CONFIG_DIR_ENV, default_config_dir);
    let data_root = resolve_dir(None, DATA_DIR_ENV, default_data_dir);

    let settings = settings_config::load_settings(&config_root)?;
    settings_config::validate_settings(&settings)?;

    std::fs::create_dir_all(&data_root)?;
    let _log = logging::start_daemon_log(&data_root)?;

    let seed_dir = settings.seed_dir(&data_root);
    let store_root = settings.store_root(&data_root);
    std::fs::create_dir_all(&seed_dir)?;
    std::fs::create_dir_all(&store_root)?;

    let pool = settings.pool_config();
    tracing::info!(
        event = "daemon.start",
        config_dir = %config_root.display(),
        data_dir = %data_root.display(),
        seed_dir = %seed_dir.display(),
        store_root = %store_root.display(),
        workers = pool.workers,
        per_job = pool.per_job,
        "daemon.start"
    );

    let coordinator = Coordinator::new(
        Arc::new(SeedDirFetcher::new(seed_dir)),
        Arc::new(LocalDirStore::new(store_root)),
        pool,
    );

    let shutdown = CancellationToken::new();
    let status_task = tokio::spawn(status_writer_loop(
        coordinator.clone(),
        status_json_path(&data_root),
        shutdown.clone(),
    ));

    let server = control_ipc::spawn_control_ipc_server(
        control_ipc_socket_path(&data_root),
        coordinator.clone(),
    )?;

    wait_for_stop_signal().await?;
    tracing::info!(event = "daemon.stop", "daemon.stop");

    server.shutdown().await;
    coordinator.shutdown();
    shutdown.cancel();
    let _ = status_task.await;
    Ok(())
}
