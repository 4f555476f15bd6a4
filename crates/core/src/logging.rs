use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "SEEDFERRY_LOG";
pub const LOG_DIR_ENV: &str = "SEEDFERRY_LOG_DIR";

static DAEMON_LOGGER: OnceLock<FileLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug)]
struct LogState {
    writer: Option<BufWriter<std::fs::File>>,
}

/// Process-wide NDJSON sink. Events are dropped until a log file is started.
#[derive(Debug)]
struct FileLogger {
    state: Mutex<LogState>,
}

impl FileLogger {
    fn new() -> Self {
        Self {
            state: Mutex::new(LogState { writer: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.writer.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "daemon log already active",
            ));
        }

        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        guard.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn finish(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

pub struct LogWriter<'a> {
    guard: MutexGuard<'a, LogState>,
}

impl Write for LogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.guard.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.guard.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FileLogger {
    type Writer = LogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter { guard: self.lock() }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &FileLogger {
    type Writer = LogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(seedferry_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    if let Some(v) = seedferry_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the global JSON subscriber once. Safe to call repeatedly.
pub fn init_logging() {
    TRACING_INIT.get_or_init(|| {
        let logger = DAEMON_LOGGER.get_or_init(FileLogger::new);

        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(logger);

        let subscriber = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer);
        let _ = subscriber.try_init();
    });
}

/// Keeps the daemon log open; flushes and fsyncs it on drop.
pub struct LogGuard {
    path: PathBuf,
}

impl LogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(logger) = DAEMON_LOGGER.get() {
            let _ = logger.finish();
        }
    }
}

pub fn start_daemon_log(data_dir: &Path) -> std::io::Result<LogGuard> {
    init_logging();

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "seedferryd-{}.ndjson",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    );
    let path = log_dir.join(file_name);

    let logger = DAEMON_LOGGER.get_or_init(FileLogger::new);
    logger.start(&path)?;

    Ok(LogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Some(v) = std::env::var_os(LOG_DIR_ENV) {
        return PathBuf::from(v);
    }
    data_dir.join("logs")
}
