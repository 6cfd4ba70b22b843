use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::TaskError;
use crate::provider::transport::HttpTransport;
use crate::provider::{
    non_empty, remote_task_id, require_remote_id, ProviderClient, ProviderSettings,
};
use crate::task::{GenerationRequest, DEFAULT_ASPECT_RATIO, DEFAULT_DURATION_SECS};

const GENERATIONS_PATH: [&str; 3] = ["v2", "videos", "generations"];
const DEFAULT_MODEL: &str = "sora-2";
const PRO_MODEL: &str = "sora-2-pro";
const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// Sora 2 client (`sora-2` / `sora-2-pro`).
///
/// - Create: `POST {base}/v2/videos/generations`
/// - Query:  `GET  {base}/v2/videos/generations/{task_id}`
#[derive(Debug, Clone)]
pub struct Sora2Client {
    transport: HttpTransport,
}

/// Sora-specific options resolved from the request and its extra params.
#[derive(Debug, Clone, PartialEq)]
struct SoraOptions {
    model: String,
    aspect_ratio: String,
    duration: u32,
    hd: bool,
    watermark: bool,
    private: bool,
    notify_hook: Option<String>,
    images: Option<Vec<String>>,
}

impl Sora2Client {
    pub fn new(settings: &ProviderSettings, api_key: Option<&str>) -> Result<Self, TaskError> {
        Ok(Self {
            transport: HttpTransport::new(settings, api_key)?,
        })
    }

    /// Resolve options, embed local images and validate the result. No
    /// network I/O happens here.
    async fn build_payload(&self, request: &GenerationRequest) -> Result<Value, TaskError> {
        let mut options = resolve_options(request)?;
        if let Some(images) = options.images.take() {
            let mut prepared = Vec::with_capacity(images.len());
            for image in &images {
                prepared.push(prepare_image(image).await?);
            }
            options.images = Some(prepared);
        }

        validate(&request.prompt, &options)?;

        let mut payload = Map::new();
        payload.insert("model".to_string(), Value::from(options.model));
        payload.insert("prompt".to_string(), Value::from(request.prompt.as_str()));
        if let Some(images) = options.images {
            payload.insert("images".to_string(), Value::from(images));
        }
        payload.insert("aspect_ratio".to_string(), Value::from(options.aspect_ratio));
        payload.insert("duration".to_string(), Value::from(options.duration));
        payload.insert("hd".to_string(), Value::from(options.hd));
        payload.insert("watermark".to_string(), Value::from(options.watermark));
        payload.insert("private".to_string(), Value::from(options.private));
        if let Some(hook) = options.notify_hook {
            payload.insert("notify_hook".to_string(), Value::from(hook));
        }
        Ok(Value::Object(payload))
    }
}

#[async_trait]
impl ProviderClient for Sora2Client {
    fn name(&self) -> &str {
        "sora2"
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, TaskError> {
        let payload = self.build_payload(request).await?;
        debug!(model = %payload["model"], "submitting sora generation");
        let response = self.transport.post_json(&GENERATIONS_PATH, &payload).await?;
        remote_task_id(&response)
    }

    async fn query(&self, remote_task_id: &str) -> Result<Value, TaskError> {
        require_remote_id(remote_task_id)?;
        let [v2, videos, generations] = GENERATIONS_PATH;
        self.transport
            .get_json(&[v2, videos, generations, remote_task_id])
            .await
    }
}

fn resolve_options(request: &GenerationRequest) -> Result<SoraOptions, TaskError> {
    let extra = &request.extra_params;

    let duration = match extra.get("duration") {
        Some(value) => integer_param("duration", value)?,
        None => request.duration.unwrap_or(DEFAULT_DURATION_SECS),
    };

    let aspect_ratio = match extra.get("aspect_ratio") {
        Some(Value::String(value)) => value.clone(),
        Some(other) => other.to_string(),
        None => request
            .aspect_ratio
            .clone()
            .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string()),
    };

    let model = match extra.get("model") {
        Some(Value::String(value)) => value.clone(),
        Some(_) => return Err(TaskError::validation("model must be sora-2 or sora-2-pro")),
        None => DEFAULT_MODEL.to_string(),
    };

    let images = match extra.get("images") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|item| match item {
                    Value::String(value) => Ok(value.clone()),
                    _ => Err(TaskError::validation("images must be an array of strings")),
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(Value::Null) | None => {
            non_empty(request.image.as_deref()).map(|image| vec![image.to_string()])
        }
        Some(_) => return Err(TaskError::validation("images must be an array of strings")),
    };

    let notify_hook = match extra.get("notify_hook") {
        Some(Value::String(value)) => Some(value.clone()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(TaskError::validation("notify_hook must be a valid URL")),
    };

    Ok(SoraOptions {
        model,
        aspect_ratio,
        duration,
        hd: bool_param(extra, "hd")?,
        watermark: bool_param(extra, "watermark")?,
        private: bool_param(extra, "private")?,
        notify_hook,
        images,
    })
}

fn integer_param(name: &str, value: &Value) -> Result<u32, TaskError> {
    let parsed = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| TaskError::validation(format!("{name} must be an integer")))
}

fn bool_param(extra: &Map<String, Value>, name: &str) -> Result<bool, TaskError> {
    match extra.get(name) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(TaskError::validation(
            "hd/watermark/private must be booleans",
        )),
    }
}

fn validate(prompt: &str, options: &SoraOptions) -> Result<(), TaskError> {
    if prompt.trim().is_empty() {
        return Err(TaskError::validation("prompt must not be empty"));
    }

    if options.model != DEFAULT_MODEL && options.model != PRO_MODEL {
        return Err(TaskError::validation("model must be sora-2 or sora-2-pro"));
    }

    if options.aspect_ratio != "16:9" && options.aspect_ratio != "9:16" {
        return Err(TaskError::validation("aspect_ratio must be 16:9 or 9:16"));
    }

    if ![10, 15, 25].contains(&options.duration) {
        return Err(TaskError::validation("duration must be 10, 15 or 25"));
    }

    if options.model == DEFAULT_MODEL {
        if options.hd {
            return Err(TaskError::validation(
                "sora-2 does not support hd, use sora-2-pro",
            ));
        }
        if options.duration == 25 {
            return Err(TaskError::validation(
                "sora-2 does not support 25 second videos, use sora-2-pro",
            ));
        }
    }

    if options.duration == 25 && options.hd {
        return Err(TaskError::validation(
            "hd has no effect at duration 25, disable hd or use 10/15 seconds",
        ));
    }

    if let Some(hook) = &options.notify_hook {
        let valid = Url::parse(hook)
            .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
            .unwrap_or(false);
        if !valid {
            return Err(TaskError::validation("notify_hook must be a valid URL"));
        }
    }

    if matches!(&options.images, Some(images) if images.is_empty()) {
        return Err(TaskError::validation("images must not be an empty list"));
    }

    Ok(())
}

/// Pass through `data:image` URIs and http(s) URLs; embed existing local
/// files as base64 data URIs.
async fn prepare_image(raw: &str) -> Result<String, TaskError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(TaskError::validation("images must not contain empty strings"));
    }

    if value.starts_with("data:image") {
        return Ok(value.to_string());
    }

    if let Ok(url) = Url::parse(value) {
        if matches!(url.scheme(), "http" | "https") && url.has_host() {
            return Ok(value.to_string());
        }
    }

    let path = Path::new(value);
    let is_file = tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(TaskError::validation(format!(
            "unrecognized image reference: {value}"
        )));
    }

    let bytes = tokio::fs::read(path).await.map_err(|err| {
        TaskError::validation(format!("failed to read image {}: {err}", path.display()))
    })?;
    Ok(format!(
        "data:{};base64,{}",
        image_mime_type(path),
        STANDARD.encode(bytes)
    ))
}

/// Image MIME type guessed from the extension, `image/jpeg` otherwise.
fn image_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .iter()
        .find(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string())
}
