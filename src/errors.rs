use std::time::Duration;

use thiserror::Error;

use crate::models::TaskStatusResponse;

/// Broad classification of an [`Error`], useful for matching without
/// destructuring every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Authentication,
    Network,
    Provider,
    Task,
    Metering,
    Internal,
}

/// Why a task wait ended without a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// The overall polling deadline passed.
    Timeout(Duration),
    /// Every permitted status lookup was spent.
    AttemptsExhausted(u32),
    /// The provider reported FAILED.
    Failed,
    /// The provider reported CANCELED.
    Canceled,
    /// The caller's cancellation token fired.
    Aborted,
}

/// All errors that can occur when generating or metering a video.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The accounting endpoint rejected the payload (any 4xx). Never retried.
    #[error("validation failed ({status_code}): {message}")]
    Validation { status_code: u16, message: String },

    /// The provider rejected our credentials (HTTP 401/403).
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// A transport-level failure: connect, TLS, timeout, or body read.
    #[error("network error: {context}: {source}")]
    Network {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The provider answered with a non-2xx status or an undecodable body.
    #[error("provider API error {status_code}: {message}")]
    Provider {
        status_code: u16,
        message: String,
        code: Option<String>,
        error_type: Option<String>,
    },

    /// Waiting for the task failed. `last_status` holds the most recent
    /// status lookup, when one succeeded before the wait ended.
    #[error("task error: {message}")]
    Task {
        kind: TaskErrorKind,
        message: String,
        last_status: Option<Box<TaskStatusResponse>>,
    },

    /// Usage delivery failed. The final error after exhausted retries wraps
    /// the last attempt's error as its source.
    #[error("metering error: {message}")]
    Metering {
        message: String,
        status_code: Option<u16>,
        #[source]
        source: Option<Box<Error>>,
    },

    /// Unexpected fault, e.g. a panic recovered inside a dispatch task.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::Network { .. } => ErrorKind::Network,
            Error::Provider { .. } => ErrorKind::Provider,
            Error::Task { .. } => ErrorKind::Task,
            Error::Metering { .. } => ErrorKind::Metering,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status associated with this error: the concrete code when the
    /// error came from a response, otherwise a per-kind default.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation { status_code, .. } | Error::Provider { status_code, .. } => {
                *status_code
            }
            Error::Metering {
                status_code: Some(code),
                ..
            } => *code,
            Error::Configuration(_) => 400,
            Error::Authentication { .. } => 401,
            Error::Task { .. } => 502,
            Error::Network { .. } => 503,
            Error::Metering { .. } | Error::Internal(_) => 500,
        }
    }

    /// Whether a metering attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } => true,
            Error::Metering {
                status_code: Some(code),
                ..
            } => *code >= 500,
            _ => false,
        }
    }

    /// The last observed task status carried by a [`Error::Task`], if any.
    pub fn last_status(&self) -> Option<&TaskStatusResponse> {
        match self {
            Error::Task { last_status, .. } => last_status.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn network(context: &'static str, source: reqwest::Error) -> Self {
        Error::Network { context, source }
    }
}

/// A convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
