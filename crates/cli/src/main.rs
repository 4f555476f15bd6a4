use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use clap::{Parser, Subcommand};
use serde::Serialize;
use seedferry_core::config::{
    self as settings_config, CONFIG_DIR_ENV, DATA_DIR_ENV, default_config_dir, default_data_dir,
    resolve_dir,
};
use seedferry_core::control::{
    ControlError, ControlRequest, ControlResponse, DescriptorFileParam, JobsAddParams,
    JobsAddResult, JobsCancelResult, JobsListResult, control_ipc_socket_path,
};
use seedferry_core::status::{read_status_snapshot_json, status_json_path};
use seedferry_core::{APP_NAME, JobSnapshot};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "seedferry")]
#[command(about = "Seedferry CLI: submit and inspect transfer jobs", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Jobs {
        #[command(subcommand)]
        cmd: JobsCmd,
    },
    /// Prints the daemon's last status snapshot without contacting it.
    Status,
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum JobsCmd {
    Add {
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        magnet: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    List,
    Get {
        job_id: String,
    },
    Cancel {
        job_id: String,
    },
    Purge {
        job_id: String,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    /// Replaces config.toml with a validated document read from stdin.
    Set,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: String,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }
}

impl From<ControlError> for CliError {
    fn from(e: ControlError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
            retryable: e.retryable,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = resolve_dir(cli.config_dir, CONFIG_DIR_ENV, default_config_dir);
    let data_dir = resolve_dir(cli.data_dir, DATA_DIR_ENV, default_data_dir);

    match cli.cmd {
        Command::Jobs { cmd } => match cmd {
            JobsCmd::Add { magnet, file } => jobs_add(&data_dir, magnet, file, cli.json).await,
            JobsCmd::List => jobs_list(&data_dir, cli.json).await,
            JobsCmd::Get { job_id } => jobs_get(&data_dir, "jobs.get", job_id, cli.json).await,
            JobsCmd::Cancel { job_id } => jobs_cancel(&data_dir, job_id, cli.json).await,
            JobsCmd::Purge { job_id } => jobs_get(&data_dir, "jobs.purge", job_id, cli.json).await,
        },
        Command::Status => status(&data_dir, cli.json),
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, &data_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
    }
}

async fn jobs_add(
    data_dir: &Path,
    magnet: Option<String>,
    file: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    let params = match (magnet, file) {
        (Some(uri), None) => JobsAddParams {
            magnet_uri: Some(uri),
            descriptor_file: None,
        },
        (None, Some(path)) => {
            let bytes = std::fs::read(&path)
                .map_err(|e| CliError::new("descriptor.read_failed", e.to_string()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            JobsAddParams {
                magnet_uri: None,
                descriptor_file: Some(DescriptorFileParam {
                    name,
                    content_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
                }),
            }
        }
        _ => {
            return Err(CliError::new(
                "cli.invalid_args",
                "pass exactly one of --magnet and --file",
            ));
        }
    };

    let params = serde_json::to_value(params)
        .map_err(|e| CliError::new("cli.encode_failed", e.to_string()))?;
    let result: JobsAddResult = call(data_dir, "jobs.add", params).await?;
    if json {
        print_json(&result)?;
    } else {
        let verb = if result.created { "created" } else { "existing" };
        println!("{} {verb}", result.job_id);
    }
    Ok(())
}

async fn jobs_list(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let result: JobsListResult = call(data_dir, "jobs.list", serde_json::json!({})).await?;
    if json {
        return print_json(&result);
    }
    for job in &result.jobs {
        print_job_line(job);
    }
    Ok(())
}

async fn jobs_get(
    data_dir: &Path,
    method: &str,
    job_id: String,
    json: bool,
) -> Result<(), CliError> {
    let job: JobSnapshot = call(data_dir, method, serde_json::json!({ "jobId": job_id })).await?;
    if json {
        return print_json(&job);
    }
    print_job_line(&job);
    let t = &job.throughput;
    let eta = t
        .fetch_eta_ms
        .map(|ms| format!("{}s", ms.div_ceil(1000)))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  fetched={}% down={}B/s up={}B/s eta={eta}",
        t.fetch_percent, t.download_bytes_per_sec, t.upload_bytes_per_sec
    );
    for f in &job.files {
        println!(
            "  {} {:?} {}/{} retries={}",
            f.name, f.status, f.uploaded_bytes, f.size_bytes, f.retry_count
        );
    }
    if let Some(failure) = &job.failure {
        println!("  failure={:?}: {}", failure.kind, failure.message);
    }
    Ok(())
}

async fn jobs_cancel(data_dir: &Path, job_id: String, json: bool) -> Result<(), CliError> {
    let result: JobsCancelResult =
        call(data_dir, "jobs.cancel", serde_json::json!({ "jobId": job_id })).await?;
    if json {
        print_json(&result)?;
    } else {
        println!("{} {}", result.job_id, result.status.as_str());
    }
    Ok(())
}

fn status(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let path = status_json_path(data_dir);
    let snapshot = read_status_snapshot_json(&path).map_err(|e| {
        let mut err = CliError::new("status.unavailable", e.to_string());
        err.details = serde_json::json!({ "path": path.display().to_string() });
        err.retryable = true;
        err
    })?;
    if json {
        return print_json(&snapshot);
    }
    let t = &snapshot.totals;
    println!(
        "generatedAt={} active={} completed={} failed={} cancelled={} bytes={}/{}",
        snapshot.generated_at,
        t.active,
        t.completed,
        t.failed,
        t.cancelled,
        t.bytes_uploaded,
        t.bytes_total
    );
    for job in &snapshot.jobs {
        print_job_line(job);
    }
    Ok(())
}

fn settings_get(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = settings_config::load_settings(config_dir)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    settings_config::validate_settings(&settings)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;

    let seed_dir = settings.seed_dir(data_dir);
    let store_root = settings.store_root(data_dir);
    if json {
        println!(
            "{}",
            serde_json::json!({
                "settings": settings,
                "paths": {
                    "configDir": config_dir.display().to_string(),
                    "dataDir": data_dir.display().to_string(),
                    "seedDir": seed_dir.display().to_string(),
                    "storeRoot": store_root.display().to_string(),
                }
            })
        );
    } else {
        let text = settings_config::to_toml(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        println!();
        println!("seedDir={}", seed_dir.display());
        println!("storeRoot={}", store_root.display());
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = settings_config::parse_settings(&input)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    settings_config::save_settings(config_dir, &settings)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        println!("saved {}", settings_config::config_path(config_dir).display());
    }
    Ok(())
}

async fn call<T: serde::de::DeserializeOwned>(
    data_dir: &Path,
    method: &str,
    params: serde_json::Value,
) -> Result<T, CliError> {
    let socket_path = control_ipc_socket_path(data_dir);
    let req = ControlRequest::new(uuid::Uuid::new_v4().to_string(), method, params);

    let resp = tokio::time::timeout(CONTROL_TIMEOUT, round_trip(&socket_path, &req))
        .await
        .map_err(|_| {
            ControlError::timeout(
                format!("{APP_NAME} daemon did not answer"),
                serde_json::json!({ "method": method }),
            )
        })?
        .map_err(|e| {
            ControlError::unavailable(
                format!("{APP_NAME} daemon unreachable: {e}"),
                serde_json::json!({ "socket": socket_path.display().to_string() }),
            )
        })?;

    if !resp.ok {
        let err = resp
            .error
            .unwrap_or_else(|| ControlError::internal("error response without error body"));
        return Err(err.into());
    }
    let result = resp.result.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(result).map_err(|e| CliError::new("control.invalid_response", e.to_string()))
}

async fn round_trip(socket_path: &Path, req: &ControlRequest) -> std::io::Result<ControlResponse> {
    let stream = UnixStream::connect(socket_path).await?;
    let (r, mut w) = stream.into_split();

    let line = serde_json::to_string(req).map_err(std::io::Error::other)? + "\n";
    w.write_all(line.as_bytes()).await?;
    w.flush().await?;

    let mut lines = BufReader::new(r).lines();
    let resp_line = lines.next_line().await?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed")
    })?;
    serde_json::from_str(&resp_line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn print_job_line(job: &JobSnapshot) {
    println!(
        "{} {} {}/{} {}",
        job.id,
        job.status.as_str(),
        job.uploaded_bytes(),
        job.total_bytes(),
        job.name.as_deref().unwrap_or("-")
    );
}

fn print_json<T: Serialize>(v: &T) -> Result<(), CliError> {
    let text =
        serde_json::to_string(v).map_err(|e| CliError::new("cli.encode_failed", e.to_string()))?;
    println!("{text}");
    Ok(())
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
