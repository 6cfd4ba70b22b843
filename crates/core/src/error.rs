use thiserror::Error;

const UPSTREAM_BODY_PREVIEW_CHARS: usize = 512;

/// Failure modes of a generation task.
///
/// Every variant ends up in the task record: `Cancelled` surfaces as the
/// Cancelled status, everything else as Failed with `to_string()` as the
/// error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The request violates a provider's static constraints. Raised before any
    /// network call.
    #[error("validation error: {0}")]
    Validation(String),

    /// The provider HTTP call failed, either with an error status or after the
    /// transport retries were exhausted.
    #[error("upstream error: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
        transient: bool,
    },

    /// The provider reported the remote task as failed.
    #[error("remote task failed: {0}")]
    Remote(String),

    #[error("task {task_id} polling timeout after {attempts} attempts")]
    Timeout { task_id: String, attempts: u32 },

    #[error("task was cancelled")]
    Cancelled,

    /// The worker panicked, usually inside a provider client.
    #[error("worker panicked: {0}")]
    Panicked(String),

    /// Unknown model or missing credentials/base URL.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TaskError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Error for a request that never produced an HTTP response.
    pub fn transport(context: &str, err: &reqwest::Error) -> Self {
        Self::Upstream {
            status: None,
            message: format!("{context}: {err}"),
            transient: is_transient_reqwest_error(err),
        }
    }

    /// Error for an HTTP response with a non-success status.
    pub fn http_status(context: &str, status: u16, body: &str) -> Self {
        let body = body.trim();
        let message = if body.is_empty() {
            format!("{context} returned HTTP {status}")
        } else {
            format!(
                "{context} returned HTTP {status}: {}",
                truncate_chars(body, UPSTREAM_BODY_PREVIEW_CHARS)
            )
        };

        Self::Upstream {
            status: Some(status),
            message,
            transient: false,
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: message.into(),
            transient: false,
        }
    }

    /// Transport-level failure eligible for automatic retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream { transient: true, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub(crate) fn is_transient_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &input[..byte_index]),
        None => input.to_string(),
    }
}
