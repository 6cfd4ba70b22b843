use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskError;
use crate::provider::transport::HttpTransport;
use crate::provider::{
    generic_payload, non_empty, remote_task_id, require_prompt, require_remote_id,
    ProviderClient, ProviderSettings,
};
use crate::task::GenerationRequest;

const MODEL_TAG: &str = "veo";

/// Veo client. Chooses image-to-video when the request carries a reference
/// image, text-to-video otherwise.
#[derive(Debug, Clone)]
pub struct VeoClient {
    transport: HttpTransport,
}

impl VeoClient {
    pub fn new(settings: &ProviderSettings, api_key: Option<&str>) -> Result<Self, TaskError> {
        Ok(Self {
            transport: HttpTransport::new(settings, api_key)?,
        })
    }
}

fn route(request: &GenerationRequest) -> (&'static str, Option<&str>) {
    match non_empty(request.image.as_deref()) {
        Some(image) => ("image-to-video", Some(image)),
        None => ("text-to-video", None),
    }
}

#[async_trait]
impl ProviderClient for VeoClient {
    fn name(&self) -> &str {
        MODEL_TAG
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, TaskError> {
        require_prompt(request)?;
        let (action, image) = route(request);
        let payload = generic_payload(MODEL_TAG, request, image);
        let response = self
            .transport
            .post_json(&["v1", "video", MODEL_TAG, action], &payload)
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
