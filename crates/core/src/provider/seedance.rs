use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskError;
use crate::provider::transport::HttpTransport;
use crate::provider::{
    generic_payload, non_empty, remote_task_id, require_prompt, require_remote_id,
    ProviderClient, ProviderSettings,
};
use crate::task::GenerationRequest;

const MODEL_TAG: &str = "seedance";

/// Seedance client.
///
/// `first_frame` + `last_frame` extra params select frames-to-video; a
/// reference image selects image-to-video; otherwise text-to-video.
#[derive(Debug, Clone)]
pub struct SeedanceClient {
    transport: HttpTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeedanceMode {
    TextToVideo,
    ImageToVideo,
    FramesToVideo,
}

impl SeedanceMode {
    fn select(request: &GenerationRequest) -> Self {
        let frame = |key: &str| {
            request
                .extra_params
                .get(key)
                .and_then(Value::as_str)
                .is_some_and(|value| !value.trim().is_empty())
        };

        if frame("first_frame") && frame("last_frame") {
            Self::FramesToVideo
        } else if non_empty(request.image.as_deref()).is_some() {
            Self::ImageToVideo
        } else {
            Self::TextToVideo
        }
    }

    fn action(self) -> &'static str {
        match self {
            Self::TextToVideo => "text-to-video",
            Self::ImageToVideo => "image-to-video",
            Self::FramesToVideo => "frames-to-video",
        }
    }
}

impl SeedanceClient {
    pub fn new(settings: &ProviderSettings, api_key: Option<&str>) -> Result<Self, TaskError> {
        Ok(Self {
            transport: HttpTransport::new(settings, api_key)?,
        })
    }
}

#[async_trait]
impl ProviderClient for SeedanceClient {
    fn name(&self) -> &str {
        MODEL_TAG
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, TaskError> {
        require_prompt(request)?;
        let mode = SeedanceMode::select(request);
        let image = match mode {
            SeedanceMode::ImageToVideo => non_empty(request.image.as_deref()),
            _ => None,
        };

        let payload = generic_payload(MODEL_TAG, request, image);
        let response = self
            .transport
            .post_json(&["v1", "video", MODEL_TAG, mode.action()], &payload)
            .await?;
        remote_task_id(&response)
    }

    async fn query(&self, remote_task_id: &str) -> Result<Value, TaskError> {
        require_remote_id(remote_task_id)?;
        self.transport
            .get_json(&["v1", "video", MODEL_TAG, "tasks", remote_task_id])
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::provider::testing::{local_settings, spawn_stub};

    #[test]
    fn mode_prefers_frames_then_image() {
        let text = GenerationRequest::new("seedance", "waves");
        assert_eq!(SeedanceMode::select(&text), SeedanceMode::TextToVideo);

        let image = text.clone().with_image("https://x/a.png");
        assert_eq!(SeedanceMode::select(&image), SeedanceMode::ImageToVideo);

        let frames = image
            .clone()
            .with_param("first_frame", json!("https://x/1.png"))
            .with_param("last_frame", json!("https://x/2.png"));
        assert_eq!(SeedanceMode::select(&frames), SeedanceMode::FramesToVideo);

        let half = image.with_param("first_frame", json!("https://x/1.png"));
        assert_eq!(SeedanceMode::select(&half), SeedanceMode::ImageToVideo);
    }

    #[tokio::test]
    async fn frames_request_omits_single_image() {
        let seen: Arc<Mutex<Option<(String, Value)>>> = Arc::default();
        let router = Router::new()
            .route(
                "/v1/video/seedance/{action}",
                post(
                    |State(seen): State<Arc<Mutex<Option<(String, Value)>>>>,
                     Path(action): Path<String>,
                     Json(body): Json<Value>| async move {
                        *seen.lock().unwrap() = Some((action, body));
                        Json(json!({"task_id": "sd-1"}))
                    },
                ),
            )
            .with_state(Arc::clone(&seen));
        let base = spawn_stub(router).await;
        let client = SeedanceClient::new(&local_settings(&base), None).unwrap();

        let request = GenerationRequest::new("seedance", "waves")
            .with_image("https://x/a.png")
            .with_param("first_frame", json!("https://x/1.png"))
            .with_param("last_frame", json!("https://x/2.png"));
        assert_eq!(client.submit(&request).await.unwrap(), "sd-1");

        let (action, body) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(action, "frames-to-video");
        assert_eq!(body["first_frame"], "https://x/1.png");
        assert_eq!(body["last_frame"], "https://x/2.png");
        assert!(body.get("image").is_none());
    }
}
