pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("invalid descriptor: {message}")]
    InvalidDescriptor { message: String },

    #[error("fetch failed: {message}")]
    FetchFailed { message: String },

    #[error("destination init failed: {message}")]
    DestinationInitFailed { message: String },

    #[error("destination error ({}): {message}", failure_class(.transient))]
    Destination { transient: bool, message: String },

    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

fn failure_class(transient: &bool) -> &'static str {
    if *transient { "transient" } else { "permanent" }
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Destination {
            transient: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Destination {
            transient: false,
            message: message.into(),
        }
    }

    /// Whether retrying the failed upload attempt is expected to help.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Destination { transient, .. } => *transient,
            Self::Io(_) => true,
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config.invalid",
            Self::InvalidDescriptor { .. } => "job.invalid_descriptor",
            Self::FetchFailed { .. } => "job.fetch_failed",
            Self::DestinationInitFailed { .. } => "job.destination_init_failed",
            Self::Destination { .. } => "upload.failed",
            Self::InvalidTransition { .. } => "job.invalid_transition",
            Self::NotFound { .. } => "job.not_found",
            Self::Io(_) => "io",
            Self::Cancelled => "job.cancelled",
        }
    }
}
