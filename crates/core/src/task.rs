use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

pub const DEFAULT_DURATION_SECS: u32 = 10;
pub const MIN_DURATION_SECS: u32 = 1;
pub const MAX_DURATION_SECS: u32 = 25;
pub const DEFAULT_ASPECT_RATIO: &str = "16:9";
pub const DEFAULT_RESOLUTION: &str = "1080p";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider selector carried by a request.
///
/// The tag is open: unrecognised values deserialize into `Other` so the
/// request still produces a task, which then fails with a configuration
/// error when no client is registered for it.
/// Tags are trimmed and matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelType {
    Sora2,
    Veo,
    Seedance,
    NewModel,
    Other(String),
}

impl ModelType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sora2 => "sora2",
            Self::Veo => "veo",
            Self::Seedance => "seedance",
            Self::NewModel => "newmodel",
            Self::Other(tag) => tag.as_str(),
        }
    }
}

impl From<String> for ModelType {
    fn from(value: String) -> Self {
        let tag = value.trim().to_ascii_lowercase();
        match tag.as_str() {
            "sora2" => Self::Sora2,
            "veo" => Self::Veo,
            "seedance" => Self::Seedance,
            "newmodel" => Self::NewModel,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for ModelType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ModelType> for String {
    fn from(value: ModelType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single video generation request as received from a caller.
///
/// Only the request shape is checked here; each provider client enforces its
/// own legal duration/aspect-ratio/resolution combinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: ModelType,
    pub prompt: String,
    /// URL, `data:` URI or local path of a reference image.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_duration")]
    pub duration: Option<u32>,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: Option<String>,
    #[serde(default = "default_resolution")]
    pub resolution: Option<String>,
    #[serde(default)]
    pub extra_params: serde_json::Map<String, serde_json::Value>,
}

fn default_duration() -> Option<u32> {
    Some(DEFAULT_DURATION_SECS)
}

fn default_aspect_ratio() -> Option<String> {
    Some(DEFAULT_ASPECT_RATIO.to_string())
}

fn default_resolution() -> Option<String> {
    Some(DEFAULT_RESOLUTION.to_string())
}

impl GenerationRequest {
    pub fn new(model: impl Into<ModelType>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            image: None,
            duration: default_duration(),
            aspect_ratio: default_aspect_ratio(),
            resolution: default_resolution(),
            extra_params: serde_json::Map::new(),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_duration(mut self, duration: u32) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(aspect_ratio.into());
        self
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra_params.insert(key.into(), value);
        self
    }

    /// Shape checks a caller must fix before retrying. Provider-specific
    /// rules are not checked here.
    pub fn check_shape(&self) -> Result<(), TaskError> {
        if let Some(duration) = self.duration {
            if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&duration) {
                return Err(TaskError::validation(format!(
                    "duration must be between {MIN_DURATION_SECS} and {MAX_DURATION_SECS} seconds, got {duration}"
                )));
            }
        }
        Ok(())
    }
}

/// Externally visible state of one logical task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub video_url: Option<String>,
    pub video_base64: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn pending(task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            progress: 0,
            message: None,
            video_url: None,
            video_base64: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply the fields set in `update` and refresh `updated_at`.
    ///
    /// A record in a terminal state is frozen: the update is dropped and
    /// `false` is returned.
    pub fn apply(&mut self, update: TaskUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        if let Some(video_url) = update.video_url {
            self.video_url = Some(video_url);
        }
        if let Some(video_base64) = update.video_base64 {
            self.video_base64 = Some(video_base64);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(message) = update.message {
            self.message = Some(message);
        }
        self.updated_at = Utc::now();
        true
    }
}

/// Partial mutation of a [`TaskRecord`]. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub video_url: Option<String>,
    pub video_base64: Option<String>,
    pub error: Option<String>,
    pub message: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn video_url(mut self, video_url: Option<String>) -> Self {
        self.video_url = video_url;
        self
    }

    pub fn video_base64(mut self, video_base64: Option<String>) -> Self {
        self.video_base64 = video_base64;
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Incremental progress reported while a remote task is still running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub progress: u8,
    pub status: TaskStatus,
    pub message: String,
}

/// Best-effort observer of [`ProgressEvent`]s. Errors and panics raised by the
/// callback are discarded by the caller.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) -> anyhow::Result<()> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn model_type_parses_known_tags_and_keeps_unknown_ones() {
        assert_eq!(ModelType::from("sora2"), ModelType::Sora2);
        assert_eq!(ModelType::from("VEO"), ModelType::Veo);
        assert_eq!(ModelType::from("newmodel"), ModelType::NewModel);
        assert_eq!(
            ModelType::from("kling"),
            ModelType::Other("kling".to_string())
        );
        assert_eq!(ModelType::from(" Kling "), ModelType::from("kling"));

        let json = serde_json::to_value(ModelType::Seedance).unwrap();
        assert_eq!(json, "seedance");
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: GenerationRequest =
            serde_json::from_value(serde_json::json!({"model": "veo", "prompt": "a cat"}))
                .unwrap();

        assert_eq!(request.model, ModelType::Veo);
        assert_eq!(request.duration, Some(DEFAULT_DURATION_SECS));
        assert_eq!(request.aspect_ratio.as_deref(), Some(DEFAULT_ASPECT_RATIO));
        assert_eq!(request.resolution.as_deref(), Some(DEFAULT_RESOLUTION));
        assert!(request.extra_params.is_empty());
        assert!(request.image.is_none());
    }

    #[test]
    fn request_with_unknown_model_still_deserializes() {
        let request: GenerationRequest =
            serde_json::from_value(serde_json::json!({"model": "mystery", "prompt": "x"}))
                .unwrap();
        assert_eq!(request.model, ModelType::Other("mystery".to_string()));
    }

    #[test]
    fn check_shape_rejects_out_of_range_duration() {
        assert!(GenerationRequest::new("sora2", "x")
            .with_duration(0)
            .check_shape()
            .is_err());
        assert!(GenerationRequest::new("sora2", "x")
            .with_duration(26)
            .check_shape()
            .is_err());
        assert!(GenerationRequest::new("sora2", "x")
            .with_duration(25)
            .check_shape()
            .is_ok());
    }

    #[test]
    fn partial_update_leaves_unset_fields_untouched() {
        let mut record = TaskRecord::pending("t1");
        record.apply(TaskUpdate::status(TaskStatus::Processing).message("queued upstream"));
        record.apply(TaskUpdate::default().progress(40));

        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.progress, 40);
        assert_eq!(record.message.as_deref(), Some("queued upstream"));
        assert!(record.error.is_none());
    }

    #[test]
    fn update_refreshes_timestamp() {
        let mut record = TaskRecord::pending("t1");
        let before = record.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        record.apply(TaskUpdate::default().progress(1));
        assert!(record.updated_at > before);
        assert_eq!(record.created_at, before);
    }

    #[test]
    fn terminal_record_is_frozen() {
        let mut record = TaskRecord::pending("t1");
        assert!(record.apply(TaskUpdate::status(TaskStatus::Cancelled)));
        let frozen_at = record.updated_at;

        let applied = record.apply(TaskUpdate::status(TaskStatus::Failed).error("late failure"));
        assert!(!applied);
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(record.error.is_none());
        assert_eq!(record.updated_at, frozen_at);
    }

    #[test]
    fn progress_is_clamped() {
        let mut record = TaskRecord::pending("t1");
        record.apply(TaskUpdate::default().progress(250));
        assert_eq!(record.progress, 100);
    }
}
