use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::TaskError;
use crate::poller::{PollingSettings, TaskPoller};
use crate::provider::ProviderRegistry;
use crate::task::{
    GenerationRequest, ProgressCallback, ProgressEvent, TaskRecord, TaskStatus, TaskUpdate,
};

/// Final result of one worker, shared with every waiter.
pub type WorkerOutcome = Result<(), TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSettings {
    pub max_concurrent: usize,
    pub polling: PollingSettings,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            polling: PollingSettings::default(),
        }
    }
}

/// Per-task knobs supplied at creation time.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub owner: Option<String>,
    /// Replaces the configured provider key for this task only.
    pub api_key: Option<String>,
    pub callback: Option<ProgressCallback>,
}

impl TaskOptions {
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

struct WorkerHandle {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<WorkerOutcome>>,
}

impl WorkerHandle {
    fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some() || self.outcome.has_changed().is_err()
    }
}

struct TaskManagerInner {
    records: DashMap<String, TaskRecord>,
    owners: DashMap<String, String>,
    workers: DashMap<String, WorkerHandle>,
    gate: Arc<Semaphore>,
    providers: ProviderRegistry,
    settings: TaskSettings,
}

impl TaskManagerInner {
    /// Apply `update` to a live record. Returns `false` when the record is
    /// gone or already terminal.
    fn update(&self, task_id: &str, update: TaskUpdate) -> bool {
        match self.records.get_mut(task_id) {
            Some(mut record) => record.apply(update),
            None => false,
        }
    }
}

/// In-memory registry of generation tasks and their background workers.
///
/// Cloning is cheap; all clones share the same registry and admission gate.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskManagerInner>,
}

impl TaskManager {
    pub fn new(settings: TaskSettings, providers: ProviderRegistry) -> Self {
        let max_concurrent = settings.max_concurrent.max(1);
        Self {
            inner: Arc::new(TaskManagerInner {
                records: DashMap::new(),
                owners: DashMap::new(),
                workers: DashMap::new(),
                gate: Arc::new(Semaphore::new(max_concurrent)),
                providers,
                settings: TaskSettings {
                    max_concurrent,
                    ..settings
                },
            }),
        }
    }

    /// Manager wired to the built-in providers using `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.task_settings(),
            ProviderRegistry::with_builtin_providers(config.provider_settings()),
        )
    }

    pub fn settings(&self) -> &TaskSettings {
        &self.inner.settings
    }

    /// Free worker slots in the admission gate.
    pub fn available_slots(&self) -> usize {
        self.inner.gate.available_permits()
    }

    /// Register a Pending task and start its worker. Must be called from
    /// within a Tokio runtime. Never waits for the admission gate.
    pub fn create_task(
        &self,
        request: GenerationRequest,
        owner: Option<&str>,
    ) -> Result<String, TaskError> {
        let options = TaskOptions {
            owner: owner.map(str::to_string),
            ..TaskOptions::default()
        };
        self.create_task_with(request, options)
    }

    pub fn create_task_with(
        &self,
        request: GenerationRequest,
        options: TaskOptions,
    ) -> Result<String, TaskError> {
        request.check_shape()?;

        let task_id = Uuid::new_v4().to_string();
        if let Some(owner) = options.owner.as_deref().filter(|owner| !owner.is_empty()) {
            self.inner.owners.insert(task_id.clone(), owner.to_string());
        }
        self.inner
            .records
            .insert(task_id.clone(), TaskRecord::pending(task_id.clone()));

        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        self.inner.workers.insert(
            task_id.clone(),
            WorkerHandle {
                cancel: cancel.clone(),
                outcome: outcome_rx,
            },
        );

        info!(
            task_id = %task_id,
            model = %request.model,
            owner = options.owner.as_deref().unwrap_or("-"),
            "task created"
        );

        let worker = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let worker_id = task_id.clone();
            async move { run_task(&inner, &worker_id, request, options, cancel).await }
        });

        let inner = Arc::clone(&self.inner);
        let worker_id = task_id.clone();
        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(err) => Err(worker_aborted(&inner, &worker_id, err)),
            };
            let _ = outcome_tx.send(Some(outcome));
        });

        Ok(task_id)
    }

    pub fn get_task_status(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner.records.get(task_id).map(|record| record.clone())
    }

    pub fn task_owner(&self, task_id: &str) -> Option<String> {
        self.inner.owners.get(task_id).map(|owner| owner.clone())
    }

    /// Records owned by `owner`, newest first.
    pub fn list_tasks_for_owner(&self, owner: &str) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .inner
            .owners
            .iter()
            .filter(|entry| entry.value() == owner)
            .filter_map(|entry| self.get_task_status(entry.key()))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Request cooperative cancellation. Returns `true` only when this call
    /// moved a running task to Cancelled.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let cancel = {
            let Some(handle) = self.inner.workers.get(task_id) else {
                return false;
            };
            if handle.is_finished() {
                return false;
            }
            handle.cancel.clone()
        };

        if !self
            .inner
            .update(task_id, TaskUpdate::status(TaskStatus::Cancelled))
        {
            return false;
        }

        cancel.cancel();
        info!(task_id = %task_id, "task cancelled");
        true
    }

    /// Wait for one worker to finish. `None` for unknown ids.
    pub async fn wait_for(&self, task_id: &str) -> Option<WorkerOutcome> {
        let outcome = self.inner.workers.get(task_id)?.outcome.clone();
        Some(wait_outcome(outcome).await)
    }

    /// Wait for every known worker and return each outcome, failures
    /// included.
    pub async fn wait_all(&self) -> Vec<(String, WorkerOutcome)> {
        let pending: Vec<(String, watch::Receiver<Option<WorkerOutcome>>)> = self
            .inner
            .workers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().outcome.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        for (task_id, outcome) in pending {
            outcomes.push((task_id, wait_outcome(outcome).await));
        }
        outcomes
    }

    /// Drop terminal tasks whose last update is older than `max_age`, along
    /// with their owner and worker entries. Returns how many were evicted.
    pub fn prune_finished(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = chrono::Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };

        let expired: Vec<String> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.status.is_terminal() && entry.updated_at <= cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for task_id in expired {
            let removed = self
                .inner
                .records
                .remove_if(&task_id, |_, record| {
                    record.status.is_terminal() && record.updated_at <= cutoff
                })
                .is_some();
            if removed {
                self.inner.owners.remove(&task_id);
                self.inner.workers.remove(&task_id);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, "pruned finished tasks");
        }
        evicted
    }

    /// Periodically evict terminal tasks older than `max_age`.
    pub fn spawn_retention_sweeper(&self, every: Duration, max_age: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = manager.prune_finished(max_age);
                if evicted > 0 {
                    info!(evicted, "retention sweep evicted finished tasks");
                }
            }
        })
    }
}

/// A sender dropped without an outcome means the worker was torn down with
/// the runtime before finishing.
async fn wait_outcome(mut outcome: watch::Receiver<Option<WorkerOutcome>>) -> WorkerOutcome {
    match outcome.wait_for(Option::is_some).await {
        Ok(value) => value.clone().unwrap_or(Err(TaskError::Cancelled)),
        Err(_) => Err(TaskError::Cancelled),
    }
}

async fn run_task(
    inner: &Arc<TaskManagerInner>,
    task_id: &str,
    request: GenerationRequest,
    options: TaskOptions,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let _permit = tokio::select! {
        permit = Arc::clone(&inner.gate).acquire_owned() => {
            match permit {
                Ok(permit) => permit,
                Err(_) => return Err(TaskError::Cancelled),
            }
        }
        _ = cancel.cancelled() => {
            debug!(task_id = %task_id, "task cancelled while queued");
            return Err(TaskError::Cancelled);
        }
    };

    if !inner.update(
        task_id,
        TaskUpdate::status(TaskStatus::Processing).progress(0),
    ) {
        return Err(TaskError::Cancelled);
    }

    let result = execute(inner, task_id, &request, &options, &cancel).await;

    match &result {
        Ok(payload) => {
            let update = TaskUpdate::status(TaskStatus::Completed)
                .progress(100)
                .video_url(string_field(payload, "video_url"))
                .video_base64(string_field(payload, "video_base64"));
            if inner.update(task_id, update) {
                info!(task_id = %task_id, model = %request.model, "task completed");
            }
        }
        Err(TaskError::Cancelled) => {
            inner.update(task_id, TaskUpdate::status(TaskStatus::Cancelled));
            info!(task_id = %task_id, "task stopped after cancellation");
        }
        Err(err) => {
            let update = TaskUpdate::status(TaskStatus::Failed).error(err.to_string());
            if inner.update(task_id, update) {
                warn!(task_id = %task_id, model = %request.model, error = %err, "task failed");
            }
        }
    }

    result.map(|_| ())
}

/// Record a worker that panicked (or was aborted) so the task still ends in a
/// terminal state.
fn worker_aborted(inner: &TaskManagerInner, task_id: &str, err: JoinError) -> TaskError {
    let error = if err.is_panic() {
        TaskError::Panicked(panic_message(err.into_panic()))
    } else {
        TaskError::Cancelled
    };

    let update = match &error {
        TaskError::Cancelled => TaskUpdate::status(TaskStatus::Cancelled),
        other => TaskUpdate::status(TaskStatus::Failed).error(other.to_string()),
    };
    if inner.update(task_id, update) {
        warn!(task_id = %task_id, error = %error, "task worker aborted");
    }
    error
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Submit and poll. The provider client lives only for this call.
async fn execute(
    inner: &Arc<TaskManagerInner>,
    task_id: &str,
    request: &GenerationRequest,
    options: &TaskOptions,
    cancel: &CancellationToken,
) -> Result<Value, TaskError> {
    let client = inner
        .providers
        .create(&request.model, options.api_key.as_deref())?;

    let remote_task_id = tokio::select! {
        submitted = client.submit(request) => submitted?,
        _ = cancel.cancelled() => {
            debug!(task_id = %task_id, "submit abandoned after cancellation");
            return Err(TaskError::Cancelled);
        }
    };
    info!(
        task_id = %task_id,
        remote_task_id = %remote_task_id,
        provider = client.name(),
        "remote task submitted"
    );

    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    let callback = progress_mirror(inner, task_id, options.callback.clone());
    TaskPoller::new(client.as_ref(), remote_task_id, inner.settings.polling)
        .with_callback(callback)
        .with_cancellation(cancel.clone())
        .poll_until_complete()
        .await
}

/// Mirror poll progress into the record and forward it to the caller's
/// callback under the logical task id.
fn progress_mirror(
    inner: &Arc<TaskManagerInner>,
    task_id: &str,
    forward: Option<ProgressCallback>,
) -> ProgressCallback {
    let inner = Arc::clone(inner);
    let task_id = task_id.to_string();
    Arc::new(move |event: &ProgressEvent| -> anyhow::Result<()> {
        let mut update = TaskUpdate::default().progress(event.progress);
        if !event.message.is_empty() {
            update = update.message(event.message.clone());
        }
        inner.update(&task_id, update);

        if let Some(forward) = &forward {
            forward(&ProgressEvent {
                task_id: task_id.clone(),
                ..event.clone()
            })?;
        }
        Ok(())
    })
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::provider::{ProviderClient, ProviderSettings};

    struct InstantClient;

    #[async_trait]
    impl ProviderClient for InstantClient {
        fn name(&self) -> &str {
            "instant"
        }

        async fn submit(&self, _request: &GenerationRequest) -> Result<String, TaskError> {
            Ok("remote".to_string())
        }

        async fn query(&self, _remote_task_id: &str) -> Result<Value, TaskError> {
            Ok(json!({"status": "completed", "video_base64": "AAAA"}))
        }
    }

    fn manager() -> TaskManager {
        let mut providers = ProviderRegistry::new(ProviderSettings::default());
        providers.register("instant", |_settings, _api_key| Ok(Box::new(InstantClient)));
        TaskManager::new(
            TaskSettings {
                max_concurrent: 2,
                polling: PollingSettings {
                    interval: Duration::from_millis(10),
                    max_attempts: 5,
                    max_retries: 1,
                },
            },
            providers,
        )
    }

    #[test]
    fn zero_concurrency_is_raised_to_one() {
        let manager = TaskManager::new(
            TaskSettings {
                max_concurrent: 0,
                ..TaskSettings::default()
            },
            ProviderRegistry::new(ProviderSettings::default()),
        );
        assert_eq!(manager.settings().max_concurrent, 1);
        assert_eq!(manager.available_slots(), 1);
    }

    #[tokio::test]
    async fn shape_errors_fail_creation_synchronously() {
        let manager = manager();
        let err = manager
            .create_task(GenerationRequest::new("instant", "x").with_duration(99), None)
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
        assert!(manager.wait_all().await.is_empty());
    }

    #[tokio::test]
    async fn completed_payload_fills_inline_result() {
        let manager = manager();
        let task_id = manager
            .create_task(GenerationRequest::new("instant", "x"), Some("alice"))
            .unwrap();

        assert_eq!(manager.wait_for(&task_id).await, Some(Ok(())));

        let record = manager.get_task_status(&task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.video_base64.as_deref(), Some("AAAA"));
        assert!(record.video_url.is_none());
        assert_eq!(manager.task_owner(&task_id).as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn list_tasks_filters_by_owner() {
        let manager = manager();
        let a1 = manager
            .create_task(GenerationRequest::new("instant", "1"), Some("alice"))
            .unwrap();
        let b1 = manager
            .create_task(GenerationRequest::new("instant", "2"), Some("bob"))
            .unwrap();
        let anon = manager
            .create_task(GenerationRequest::new("instant", "3"), None)
            .unwrap();

        let alice: Vec<String> = manager
            .list_tasks_for_owner("alice")
            .into_iter()
            .map(|record| record.task_id)
            .collect();
        assert_eq!(alice, vec![a1]);
        assert_eq!(manager.list_tasks_for_owner("bob")[0].task_id, b1);
        assert!(manager.task_owner(&anon).is_none());
        assert!(manager.list_tasks_for_owner("carol").is_empty());
    }

    #[tokio::test]
    async fn prune_evicts_only_terminal_records() {
        let manager = manager();
        let task_id = manager
            .create_task(GenerationRequest::new("instant", "x"), Some("alice"))
            .unwrap();
        manager.wait_for(&task_id).await;

        assert_eq!(manager.prune_finished(Duration::from_secs(3600)), 0);
        assert!(manager.get_task_status(&task_id).is_some());

        assert_eq!(manager.prune_finished(Duration::ZERO), 1);
        assert!(manager.get_task_status(&task_id).is_none());
        assert!(manager.task_owner(&task_id).is_none());
        assert!(manager.wait_for(&task_id).await.is_none());
        assert!(!manager.cancel_task(&task_id));
    }
}
