use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::provider::ProviderClient;
use crate::task::{ProgressCallback, ProgressEvent, TaskStatus};

const DEFAULT_FAILURE_MESSAGE: &str = "Task failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingSettings {
    /// Fixed delay between status queries.
    pub interval: Duration,
    /// Non-terminal observations allowed before giving up.
    pub max_attempts: u32,
    /// Failed status queries tolerated over the whole poll.
    pub max_retries: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 360,
            max_retries: 3,
        }
    }
}

/// Drives one remote task to a terminal state.
///
/// Every successful query that reports Pending/Processing consumes one
/// attempt. Upstream query failures consume the separate retry budget
/// instead, which is never refilled.
pub struct TaskPoller<'a> {
    client: &'a dyn ProviderClient,
    remote_task_id: String,
    settings: PollingSettings,
    callback: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl<'a> TaskPoller<'a> {
    pub fn new(
        client: &'a dyn ProviderClient,
        remote_task_id: impl Into<String>,
        settings: PollingSettings,
    ) -> Self {
        Self {
            client,
            remote_task_id: remote_task_id.into(),
            settings,
            callback: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn remote_task_id(&self) -> &str {
        &self.remote_task_id
    }

    /// Poll until the provider reports Completed and return its payload.
    pub async fn poll_until_complete(&self) -> Result<Value, TaskError> {
        let mut attempts = 0u32;
        let mut error_retries = 0u32;

        while attempts < self.settings.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            let queried = tokio::select! {
                queried = self.client.query(&self.remote_task_id) => queried,
                _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
            };
            let payload = match queried {
                Ok(payload) => payload,
                Err(err @ TaskError::Upstream { .. }) => {
                    error_retries += 1;
                    if error_retries > self.settings.max_retries {
                        return Err(err);
                    }
                    warn!(
                        remote_task_id = %self.remote_task_id,
                        retry = error_retries,
                        max_retries = self.settings.max_retries,
                        error = %err,
                        "status query failed; retrying"
                    );
                    self.sleep_interval().await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let status = self.client.parse_status(&payload);
            match status {
                TaskStatus::Completed => return Ok(payload),
                TaskStatus::Failed => return Err(TaskError::Remote(failure_message(&payload))),
                TaskStatus::Cancelled => return Err(TaskError::Cancelled),
                TaskStatus::Pending | TaskStatus::Processing => {}
            }

            let event = ProgressEvent {
                task_id: self.remote_task_id.clone(),
                progress: progress_from_payload(&payload),
                status,
                message: payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
            debug!(
                remote_task_id = %self.remote_task_id,
                attempt = attempts + 1,
                status = %status,
                progress = event.progress,
                "remote task still running"
            );
            self.notify(&event);

            attempts += 1;
            if attempts < self.settings.max_attempts {
                self.sleep_interval().await?;
            }
        }

        Err(TaskError::Timeout {
            task_id: self.remote_task_id.clone(),
            attempts: self.settings.max_attempts,
        })
    }

    async fn sleep_interval(&self) -> Result<(), TaskError> {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.interval) => Ok(()),
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }

    fn notify(&self, event: &ProgressEvent) {
        let Some(callback) = &self.callback else {
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| callback(event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(remote_task_id = %event.task_id, error = %err, "progress callback failed");
            }
            Err(_) => {
                warn!(remote_task_id = %event.task_id, "progress callback panicked");
            }
        }
    }
}

/// Read `progress` as a number or numeric string (optionally `%`-suffixed),
/// clamped to 0..=100.
pub fn progress_from_payload(payload: &Value) -> u8 {
    let raw = match payload.get("progress") {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };

    match raw {
        Some(value) if value.is_finite() => value.clamp(0.0, 100.0) as u8,
        _ => 0,
    }
}

fn failure_message(payload: &Value) -> String {
    let message = match payload.get("error") {
        Some(Value::String(text)) => Some(text.trim().to_string()),
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string()),
        _ => None,
    };

    message
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string())
}
