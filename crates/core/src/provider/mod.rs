//! Upstream video providers.
//!
//! Every provider implements [`ProviderClient`]: submit a generation request,
//! fetch the raw status payload of a remote task, and map that payload onto
//! the shared [`TaskStatus`]. Clients own their HTTP connection pool and
//! release it when dropped.

pub mod newmodel;
pub mod seedance;
pub mod sora;
pub mod transport;
pub mod veo;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::task::{GenerationRequest, ModelType, TaskStatus};

use self::newmodel::NewModelClient;
use self::seedance::SeedanceClient;
use self::sora::Sora2Client;
use self::transport::RetryPolicy;
use self::veo::VeoClient;

/// Process-wide provider connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub allow_insecure_http: bool,
    pub retry: RetryPolicy,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(60),
            allow_insecure_http: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    /// Validate provider-specific constraints, create the remote job and
    /// return the provider's task id.
    async fn submit(&self, request: &GenerationRequest) -> Result<String, TaskError>;

    /// Single status fetch for a remote task.
    async fn query(&self, remote_task_id: &str) -> Result<Value, TaskError>;

    fn parse_status(&self, payload: &Value) -> TaskStatus {
        status_from_vocabulary(payload)
    }
}

/// Map the common `status` vocabulary onto [`TaskStatus`]. Matching is
/// case-insensitive and anything unrecognised is treated as Pending.
pub fn status_from_vocabulary(payload: &Value) -> TaskStatus {
    let raw = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match raw.as_str() {
        "processing" => TaskStatus::Processing,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Pending,
    }
}

pub(crate) fn require_prompt(request: &GenerationRequest) -> Result<(), TaskError> {
    if request.prompt.trim().is_empty() {
        return Err(TaskError::validation("prompt must not be empty"));
    }
    Ok(())
}

pub(crate) fn require_remote_id(remote_task_id: &str) -> Result<(), TaskError> {
    if remote_task_id.trim().is_empty() {
        return Err(TaskError::validation("remote task id must not be empty"));
    }
    Ok(())
}

/// Extract `task_id` from a submission response. Providers return it either
/// as a string or as a number.
pub(crate) fn remote_task_id(response: &Value) -> Result<String, TaskError> {
    match response.get("task_id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(TaskError::upstream("provider response is missing task_id")),
    }
}

/// Payload shared by the generic `/v1/video/<family>` providers: model tag,
/// prompt and the optional request fields, with extra params merged last so
/// callers can override any of them.
pub(crate) fn generic_payload(
    model_tag: &str,
    request: &GenerationRequest,
    image: Option<&str>,
) -> Value {
    let mut payload = Map::new();
    payload.insert("model".to_string(), Value::from(model_tag));
    payload.insert("prompt".to_string(), Value::from(request.prompt.as_str()));
    if let Some(image) = image {
        payload.insert("image".to_string(), Value::from(image));
    }
    if let Some(duration) = request.duration {
        payload.insert("duration".to_string(), Value::from(duration));
    }
    if let Some(aspect_ratio) = &request.aspect_ratio {
        payload.insert("aspect_ratio".to_string(), Value::from(aspect_ratio.as_str()));
    }
    if let Some(resolution) = &request.resolution {
        payload.insert("resolution".to_string(), Value::from(resolution.as_str()));
    }
    for (key, value) in &request.extra_params {
        payload.insert(key.clone(), value.clone());
    }
    Value::Object(payload)
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

type ProviderFactory = dyn Fn(&ProviderSettings, Option<&str>) -> Result<Box<dyn ProviderClient>, TaskError>
    + Send
    + Sync;

/// Lookup table from [`ModelType`] to a client factory.
pub struct ProviderRegistry {
    settings: ProviderSettings,
    factories: HashMap<ModelType, Box<ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            factories: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in providers.
    pub fn with_builtin_providers(settings: ProviderSettings) -> Self {
        let mut registry = Self::new(settings);
        register_builtin_providers(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, model: impl Into<ModelType>, factory: F)
    where
        F: Fn(&ProviderSettings, Option<&str>) -> Result<Box<dyn ProviderClient>, TaskError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(model.into(), Box::new(factory));
    }

    /// Build a fresh client for `model`. `api_key_override` replaces the
    /// configured key for this client only.
    pub fn create(
        &self,
        model: &ModelType,
        api_key_override: Option<&str>,
    ) -> Result<Box<dyn ProviderClient>, TaskError> {
        let factory = self
            .factories
            .get(model)
            .ok_or_else(|| TaskError::configuration(format!("unsupported model type: {model}")))?;

        factory(&self.settings, api_key_override)
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn list_models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.factories.keys().map(ModelType::as_str).collect();
        models.sort_unstable();
        models
    }
}

pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(ModelType::Sora2, |settings, api_key| {
        Ok(Box::new(Sora2Client::new(settings, api_key)?))
    });
    registry.register(ModelType::Veo, |settings, api_key| {
        Ok(Box::new(VeoClient::new(settings, api_key)?))
    });
    registry.register(ModelType::Seedance, |settings, api_key| {
        Ok(Box::new(SeedanceClient::new(settings, api_key)?))
    });
    registry.register(ModelType::NewModel, |settings, api_key| {
        Ok(Box::new(NewModelClient::new(settings, api_key)?))
    });
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_vocabulary_is_case_insensitive() {
        assert_eq!(
            status_from_vocabulary(&json!({"status": "COMPLETED"})),
            TaskStatus::Completed
        );
        assert_eq!(
            status_from_vocabulary(&json!({"status": "Processing"})),
            TaskStatus::Processing
        );
        assert_eq!(
            status_from_vocabulary(&json!({"status": "failed"})),
            TaskStatus::Failed
        );
        assert_eq!(
            status_from_vocabulary(&json!({"status": "cancelled"})),
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn unknown_or_missing_status_maps_to_pending() {
        assert_eq!(
            status_from_vocabulary(&json!({"status": "queued_for_gpu"})),
            TaskStatus::Pending
        );
        assert_eq!(status_from_vocabulary(&json!({})), TaskStatus::Pending);
        assert_eq!(
            status_from_vocabulary(&json!({"status": 3})),
            TaskStatus::Pending
        );
    }

    #[test]
    fn remote_task_id_accepts_strings_and_numbers() {
        assert_eq!(remote_task_id(&json!({"task_id": "abc"})).unwrap(), "abc");
        assert_eq!(remote_task_id(&json!({"task_id": 42})).unwrap(), "42");
        assert!(remote_task_id(&json!({"task_id": ""})).is_err());
        assert!(remote_task_id(&json!({"id": "abc"})).is_err());
    }

    #[test]
    fn generic_payload_lets_extra_params_override_fields() {
        let request = GenerationRequest::new("veo", "a cat")
            .with_resolution("720p")
            .with_param("duration", json!(8))
            .with_param("seed", json!(7));

        let payload = generic_payload("veo", &request, Some("https://x/cat.png"));

        assert_eq!(payload["model"], "veo");
        assert_eq!(payload["prompt"], "a cat");
        assert_eq!(payload["image"], "https://x/cat.png");
        assert_eq!(payload["duration"], 8);
        assert_eq!(payload["aspect_ratio"], "16:9");
        assert_eq!(payload["resolution"], "720p");
        assert_eq!(payload["seed"], 7);
    }

    #[test]
    fn builtin_registry_lists_all_providers() {
        let registry = ProviderRegistry::with_builtin_providers(ProviderSettings::default());
        assert_eq!(
            registry.list_models(),
            vec!["newmodel", "seedance", "sora2", "veo"]
        );
    }

    #[test]
    fn unknown_model_is_a_configuration_error() {
        let registry = ProviderRegistry::with_builtin_providers(ProviderSettings::default());
        let err = match registry.create(&ModelType::from("kling"), None) {
            Ok(_) => panic!("unknown model should not resolve"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            TaskError::configuration("unsupported model type: kling")
        );
    }

    #[test]
    fn builtin_factory_requires_base_url() {
        let registry = ProviderRegistry::with_builtin_providers(ProviderSettings::default());
        let err = match registry.create(&ModelType::Veo, Some("sk-user")) {
            Ok(_) => panic!("missing base url should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, TaskError::Configuration(_)), "got: {err:?}");
    }

    #[test]
    fn builtin_factory_builds_named_clients() {
        let settings = ProviderSettings {
            base_url: "https://api.example.com".to_string(),
            api_key: "sk-test".to_string(),
            ..ProviderSettings::default()
        };
        let registry = ProviderRegistry::with_builtin_providers(settings);

        for (model, name) in [
            (ModelType::Sora2, "sora2"),
            (ModelType::Veo, "veo"),
            (ModelType::Seedance, "seedance"),
            (ModelType::NewModel, "newmodel"),
        ] {
            let client = match registry.create(&model, None) {
                Ok(client) => client,
                Err(err) => panic!("{model} should resolve: {err}"),
            };
            assert_eq!(client.name(), name);
        }
    }
}
