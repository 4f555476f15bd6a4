use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::model::{JobSnapshot, JobStatus};

/// Upper bound on one request line; descriptor files travel base64-encoded.
pub const MAX_REQUEST_LINE_BYTES: usize = 16 * 1024 * 1024;

pub fn control_ipc_socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ipc").join("control.sock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ControlError {
    pub fn unavailable(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.unavailable".to_string(),
            message: message.into(),
            retryable: true,
            details,
        }
    }

    pub fn timeout(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.timeout".to_string(),
            message: message.into(),
            retryable: true,
            details,
        }
    }

    pub fn invalid_request(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.invalid_request".to_string(),
            message: message.into(),
            retryable: false,
            details,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "internal".to_string(),
            message: message.into(),
            retryable: false,
            details: serde_json::json!({}),
        }
    }

    /// Maps a core error onto the wire error taxonomy.
    pub fn from_core(e: &Error) -> Self {
        let code = match e {
            Error::InvalidDescriptor { .. } => "job.invalid_descriptor",
            Error::NotFound { .. } => "job.not_found",
            Error::InvalidTransition { .. } => "job.invalid_transition",
            Error::InvalidConfig { .. } => "config.invalid",
            _ => "internal",
        };
        let details = match e {
            Error::InvalidTransition { job_id, from, to } => {
                serde_json::json!({ "jobId": job_id, "from": from, "to": to })
            }
            _ => serde_json::json!({}),
        };
        Self {
            code: code.to_string(),
            message: e.to_string(),
            retryable: e.is_transient(),
            details,
        }
    }

    pub fn method_not_found(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.method_not_found".to_string(),
            message: message.into(),
            retryable: false,
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ControlRequest {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            type_: "control.request".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            type_: "control.response".to_string(),
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ControlError) -> Self {
        Self {
            type_: "control.response".to_string(),
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorFileParam {
    pub name: String,
    pub content_base64: String,
}

/// `jobs.add`: exactly one of `magnet_uri` and `descriptor_file` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsAddParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnet_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_file: Option<DescriptorFileParam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsAddResult {
    pub job_id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdParams {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsListResult {
    pub jobs: Vec<JobSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsCancelResult {
    pub job_id: String,
    pub status: JobStatus,
}
