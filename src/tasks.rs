//! Background task queue for long-running media jobs.
//!
//! Tasks run on spawned workers behind a semaphore that caps simultaneous
//! execution; everything past the cap waits as `Pending`. Each task walks
//! an ordered provider list: on timeout or provider failure the next
//! provider is tried, and the task is `Failed` only after the whole list
//! is exhausted. Every attempt's error is kept on the record.
//!
//! Cost is accounted per task as the servicing provider's unit price times
//! the request's units, realized only on success. A task cancelled while
//! still pending never touches a provider and costs nothing.
//!
//! The registry is in-memory: task state does not survive a restart, which
//! is acceptable for jobs whose outputs land in external storage anyway.
//! Terminal records stay queryable until [`TaskQueue::prune_terminal`]
//! drops them; cancel flags are released as soon as their task finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ProviderConfig, TasksConfig};
use crate::error::TaskError;
use crate::models::{TaskKind, TaskRecord, TaskRequest, TaskState};

/// An external generation service. `dispatch` blocks until the provider
/// delivers an output reference or fails; it must check `cancel` at its
/// polling points and return promptly once set.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn cost_per_unit(&self) -> f64;

    /// Preference order among providers with no explicit preference:
    /// lower tier first, price breaking ties.
    fn tier(&self) -> u32;

    /// Per-attempt deadline. The queue abandons the attempt and moves to
    /// the next provider when it elapses.
    fn max_timeout(&self) -> Duration;

    fn supports(&self, kind: TaskKind) -> bool;

    async fn dispatch(
        &self,
        request: &TaskRequest,
        cancel: Arc<AtomicBool>,
    ) -> Result<String, TaskError>;

    /// Best-effort remote cancellation. Providers without a cancel API
    /// rely on the flag alone.
    async fn cancel(&self) {}
}

pub struct TaskQueue {
    providers: Vec<Arc<dyn Provider>>,
    semaphore: Arc<Semaphore>,
    registry: Arc<StdMutex<HashMap<String, TaskRecord>>>,
    cancel_flags: Arc<StdMutex<HashMap<String, Arc<AtomicBool>>>>,
    cancel_grace: Duration,
}

impl TaskQueue {
    pub fn new(providers: Vec<Arc<dyn Provider>>, config: &TasksConfig) -> Self {
        Self {
            providers,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            registry: Arc::new(StdMutex::new(HashMap::new())),
            cancel_flags: Arc::new(StdMutex::new(HashMap::new())),
            cancel_grace: Duration::from_secs(config.cancel_grace_secs),
        }
    }

    /// Providers able to service `kind`, in preference order. An explicit
    /// `preference` of provider ids overrides the tier ordering; unknown
    /// or unsupporting ids in it are skipped.
    fn provider_order(
        &self,
        kind: TaskKind,
        preference: Option<&[String]>,
    ) -> Vec<Arc<dyn Provider>> {
        match preference {
            Some(ids) => ids
                .iter()
                .filter_map(|id| {
                    self.providers
                        .iter()
                        .find(|p| p.id() == id && p.supports(kind))
                        .cloned()
                })
                .collect(),
            None => {
                let mut eligible: Vec<Arc<dyn Provider>> = self
                    .providers
                    .iter()
                    .filter(|p| p.supports(kind))
                    .cloned()
                    .collect();
                eligible.sort_by(|a, b| {
                    a.tier().cmp(&b.tier()).then(
                        a.cost_per_unit()
                            .partial_cmp(&b.cost_per_unit())
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                });
                eligible
            }
        }
    }

    /// Cheapest possible spend for this request across the given order.
    pub fn estimate_cost(&self, request: &TaskRequest, preference: Option<&[String]>) -> Option<f64> {
        self.provider_order(request.kind, preference)
            .iter()
            .map(|p| p.cost_per_unit() * request.units)
            .fold(None, |min, c| {
                Some(match min {
                    Some(m) if m <= c => m,
                    _ => c,
                })
            })
    }

    /// Submit a task. Returns its id immediately; execution happens on a
    /// spawned worker once a concurrency slot frees up.
    ///
    /// Rejected up front, before anything is queued, when no provider can
    /// service the kind or when even the cheapest eligible provider would
    /// blow the request's budget ceiling.
    pub fn enqueue(
        &self,
        request: TaskRequest,
        preference: Option<Vec<String>>,
    ) -> Result<String, TaskError> {
        let order = self.provider_order(request.kind, preference.as_deref());
        if order.is_empty() {
            return Err(TaskError::NoProviders);
        }

        if let Some(ceiling) = request.budget_ceiling {
            let estimate = order
                .iter()
                .map(|p| p.cost_per_unit() * request.units)
                .fold(f64::INFINITY, f64::min);
            if estimate > ceiling {
                return Err(TaskError::BudgetExceeded { estimate, ceiling });
            }
        }

        let id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));

        let record = TaskRecord {
            id: id.clone(),
            kind: request.kind,
            state: TaskState::Pending,
            provider: None,
            cost: 0.0,
            result: None,
            errors: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
            finished_at: None,
        };
        self.registry.lock().unwrap().insert(id.clone(), record);
        self.cancel_flags
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::clone(&cancel));

        let worker = Worker {
            id: id.clone(),
            request,
            order,
            cancel,
            semaphore: Arc::clone(&self.semaphore),
            registry: Arc::clone(&self.registry),
            cancel_flags: Arc::clone(&self.cancel_flags),
        };
        tokio::spawn(worker.run());

        Ok(id)
    }

    pub fn status(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.registry
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))
    }

    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> =
            self.registry.lock().unwrap().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Cancel a task. A `Pending` task flips to `Cancelled` immediately at
    /// zero cost. A `Running` task gets the cancellation flag plus a
    /// best-effort provider cancel, then a grace period; if the provider
    /// has not returned by then the record is marked `Cancelled` anyway.
    /// Cancelling a terminal task is a no-op.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskState, TaskError> {
        let (state, provider_id) = {
            let registry = self.registry.lock().unwrap();
            let record = registry
                .get(task_id)
                .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
            (record.state, record.provider.clone())
        };

        if state.is_terminal() {
            return Ok(state);
        }

        if let Some(flag) = self.cancel_flags.lock().unwrap().get(task_id) {
            flag.store(true, Ordering::SeqCst);
        }

        if state == TaskState::Pending {
            // The worker has not touched a provider; finish it here. The
            // worker sees the flag when its slot comes up and exits.
            finish(&self.registry, task_id, TaskState::Cancelled);
            info!(task = %task_id, "cancelled while pending");
            return Ok(TaskState::Cancelled);
        }

        if let Some(pid) = provider_id {
            if let Some(provider) = self.providers.iter().find(|p| p.id() == pid) {
                provider.cancel().await;
            }
        }

        // Give the provider call the grace period to notice the flag.
        let deadline = tokio::time::Instant::now() + self.cancel_grace;
        while tokio::time::Instant::now() < deadline {
            if self.status(task_id)?.state.is_terminal() {
                return Ok(self.status(task_id)?.state);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        finish(&self.registry, task_id, TaskState::Cancelled);
        warn!(task = %task_id, "provider did not acknowledge cancel within grace period");
        Ok(TaskState::Cancelled)
    }

    /// Drop terminal task records and any lingering cancel flags, keeping
    /// a long-lived queue's registry bounded by its in-flight work.
    /// Returns how many records were removed.
    pub fn prune_terminal(&self) -> usize {
        let mut registry = self.registry.lock().unwrap();
        let mut flags = self.cancel_flags.lock().unwrap();
        let before = registry.len();
        registry.retain(|id, record| {
            if record.state.is_terminal() {
                flags.remove(id);
                false
            } else {
                true
            }
        });
        before - registry.len()
    }

    /// Poll until the task reaches a terminal state. Test and CLI helper.
    pub async fn wait_terminal(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        loop {
            let record = self.status(task_id)?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

struct Worker {
    id: String,
    request: TaskRequest,
    order: Vec<Arc<dyn Provider>>,
    cancel: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
    registry: Arc<StdMutex<HashMap<String, TaskRecord>>>,
    cancel_flags: Arc<StdMutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl Worker {
    async fn run(self) {
        self.execute().await;
        // The record is terminal now; the flag has no further readers.
        self.cancel_flags.lock().unwrap().remove(&self.id);
    }

    async fn execute(&self) {
        // Never closed while the queue lives.
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };

        // Cancelled while waiting for a slot: the record is already
        // terminal and no provider is contacted.
        if self.cancel.load(Ordering::SeqCst) {
            return;
        }

        for provider in &self.order {
            if self.cancel.load(Ordering::SeqCst) {
                finish(&self.registry, &self.id, TaskState::Cancelled);
                return;
            }

            // Claim the attempt. A record that went terminal while we
            // waited stays exactly as it is.
            {
                let mut registry = self.registry.lock().unwrap();
                match registry.get_mut(&self.id) {
                    Some(record) if !record.state.is_terminal() => {
                        record.state = TaskState::Running;
                        record.provider = Some(provider.id().to_string());
                    }
                    _ => return,
                }
            }
            info!(task = %self.id, provider = provider.id(), "dispatching");

            let attempt = tokio::time::timeout(
                provider.max_timeout(),
                provider.dispatch(&self.request, Arc::clone(&self.cancel)),
            )
            .await;

            let error = match attempt {
                Ok(Ok(output)) => {
                    // Only a still-Running record accepts the result. A
                    // record cancelled past the grace period stays
                    // Cancelled at zero cost even when the provider call
                    // straggles to completion.
                    let cost = provider.cost_per_unit() * self.request.units;
                    let committed = {
                        let mut registry = self.registry.lock().unwrap();
                        match registry.get_mut(&self.id) {
                            Some(record) if record.state == TaskState::Running => {
                                record.state = TaskState::Completed;
                                record.result = Some(output);
                                record.cost = cost;
                                record.finished_at = Some(chrono::Utc::now().timestamp());
                                true
                            }
                            _ => false,
                        }
                    };
                    if committed {
                        info!(task = %self.id, provider = provider.id(), cost, "completed");
                    } else {
                        info!(task = %self.id, provider = provider.id(), "late result discarded, record already terminal");
                    }
                    return;
                }
                Ok(Err(e)) => e,
                Err(_) => TaskError::Timeout(provider.id().to_string()),
            };

            if self.cancel.load(Ordering::SeqCst) {
                finish(&self.registry, &self.id, TaskState::Cancelled);
                return;
            }

            warn!(task = %self.id, provider = provider.id(), error = %error, "attempt failed, trying next provider");
            let mut registry = self.registry.lock().unwrap();
            match registry.get_mut(&self.id) {
                Some(record) if !record.state.is_terminal() => {
                    record
                        .errors
                        .push((provider.id().to_string(), error.to_string()));
                }
                _ => return,
            }
        }

        finish(&self.registry, &self.id, TaskState::Failed);
        warn!(task = %self.id, "all providers exhausted");
    }
}

/// Move a record to a terminal state, unless it already reached one.
fn finish(registry: &StdMutex<HashMap<String, TaskRecord>>, task_id: &str, state: TaskState) {
    let mut registry = registry.lock().unwrap();
    if let Some(record) = registry.get_mut(task_id) {
        if !record.state.is_terminal() {
            record.state = state;
            record.finished_at = Some(chrono::Utc::now().timestamp());
        }
    }
}

/// HTTP provider driven entirely by configuration: submits the request
/// payload to the provider's endpoint and expects a JSON reply carrying an
/// output reference.
pub struct HttpProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    kinds: Vec<TaskKind>,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let kinds = config
            .kinds
            .iter()
            .filter_map(|k| match k.as_str() {
                "image" => Some(TaskKind::Image),
                "video" => Some(TaskKind::Video),
                "text" => Some(TaskKind::Text),
                _ => None,
            })
            .collect();
        Self {
            config,
            client: reqwest::Client::new(),
            kinds,
        }
    }

    fn check_limits(&self, request: &TaskRequest) -> Result<(), TaskError> {
        if let Some(max) = self.config.max_duration_secs {
            let duration = request.payload["duration_secs"].as_u64().unwrap_or(0);
            if duration > max {
                return Err(TaskError::Unsupported {
                    provider: self.config.id.clone(),
                });
            }
        }
        if let (Some(max), Some(requested)) = (
            self.config.max_resolution.as_deref(),
            request.payload["resolution"].as_str(),
        ) {
            if requested != max {
                return Err(TaskError::Unsupported {
                    provider: self.config.id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn cost_per_unit(&self) -> f64 {
        self.config.cost_per_unit
    }

    fn tier(&self) -> u32 {
        self.config.tier
    }

    fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn supports(&self, kind: TaskKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn dispatch(
        &self,
        request: &TaskRequest,
        cancel: Arc<AtomicBool>,
    ) -> Result<String, TaskError> {
        self.check_limits(request)?;

        let mut http = self
            .client
            .post(format!(
                "{}/generate",
                self.config.base_url.trim_end_matches('/')
            ))
            .json(&request.payload);
        if let Some(env) = &self.config.api_key_env {
            if let Ok(key) = std::env::var(env) {
                http = http.bearer_auth(key);
            }
        }

        let call = async {
            let response = http.send().await.map_err(|e| TaskError::Transport {
                provider: self.config.id.clone(),
                message: e.to_string(),
            })?;

            let status = response.status();
            if status.as_u16() == 429 || status.as_u16() == 402 {
                let message = response.text().await.unwrap_or_default();
                return Err(TaskError::Quota {
                    provider: self.config.id.clone(),
                    message,
                });
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(TaskError::Transport {
                    provider: self.config.id.clone(),
                    message: format!("{}: {}", status, message),
                });
            }

            let body: serde_json::Value =
                response.json().await.map_err(|e| TaskError::Transport {
                    provider: self.config.id.clone(),
                    message: e.to_string(),
                })?;

            body["output_url"]
                .as_str()
                .or_else(|| body["url"].as_str())
                .map(str::to_string)
                .ok_or_else(|| TaskError::Transport {
                    provider: self.config.id.clone(),
                    message: "response carried no output reference".to_string(),
                })
        };

        // Abandon the request as soon as cancellation is flagged instead
        // of riding it out to the timeout.
        tokio::select! {
            result = call => result,
            _ = cancelled(&cancel) => Err(TaskError::Transport {
                provider: self.config.id.clone(),
                message: "cancelled by caller".to_string(),
            }),
        }
    }
}

/// Resolves once the flag is set.
async fn cancelled(cancel: &AtomicBool) {
    while !cancel.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Build the queue from configuration.
pub fn create_queue(providers: &[ProviderConfig], config: &TasksConfig) -> TaskQueue {
    let providers: Vec<Arc<dyn Provider>> = providers
        .iter()
        .cloned()
        .map(|p| Arc::new(HttpProvider::new(p)) as Arc<dyn Provider>)
        .collect();
    TaskQueue::new(providers, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted provider for queue tests: fixed outcome, optional delay.
    pub(crate) struct FakeProvider {
        pub id: String,
        pub tier: u32,
        pub cost_per_unit: f64,
        pub delay: Duration,
        pub outcome: Result<String, String>,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn id(&self) -> &str {
            &self.id
        }
        fn cost_per_unit(&self) -> f64 {
            self.cost_per_unit
        }
        fn tier(&self) -> u32 {
            self.tier
        }
        fn max_timeout(&self) -> Duration {
            Duration::from_secs(30)
        }
        fn supports(&self, _kind: TaskKind) -> bool {
            true
        }

        async fn dispatch(
            &self,
            _request: &TaskRequest,
            cancel: Arc<AtomicBool>,
        ) -> Result<String, TaskError> {
            let step = Duration::from_millis(5);
            let mut waited = Duration::ZERO;
            while waited < self.delay {
                if cancel.load(Ordering::SeqCst) {
                    return Err(TaskError::Transport {
                        provider: self.id.clone(),
                        message: "cancelled".to_string(),
                    });
                }
                tokio::time::sleep(step).await;
                waited += step;
            }
            self.outcome.clone().map_err(|message| TaskError::Transport {
                provider: self.id.clone(),
                message,
            })
        }
    }

    fn ok_provider(id: &str, tier: u32, cost: f64) -> Arc<dyn Provider> {
        Arc::new(FakeProvider {
            id: id.to_string(),
            tier,
            cost_per_unit: cost,
            delay: Duration::ZERO,
            outcome: Ok(format!("https://{}.test/out", id)),
        })
    }

    fn request(units: f64) -> TaskRequest {
        TaskRequest {
            kind: TaskKind::Image,
            payload: serde_json::json!({"prompt": "a lighthouse"}),
            units,
            budget_ceiling: None,
        }
    }

    #[tokio::test]
    async fn test_completed_task_records_cost() {
        let queue = TaskQueue::new(
            vec![ok_provider("acme", 0, 0.05)],
            &TasksConfig::default(),
        );
        let id = queue.enqueue(request(4.0), None).unwrap();
        let record = queue.wait_terminal(&id).await.unwrap();

        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(record.provider.as_deref(), Some("acme"));
        assert!((record.cost - 0.20).abs() < 1e-9);
        assert_eq!(record.result.as_deref(), Some("https://acme.test/out"));
    }

    #[tokio::test]
    async fn test_fallback_to_next_provider() {
        let failing: Arc<dyn Provider> = Arc::new(FakeProvider {
            id: "alpha".to_string(),
            tier: 0,
            cost_per_unit: 0.01,
            delay: Duration::ZERO,
            outcome: Err("upstream 500".to_string()),
        });
        let queue = TaskQueue::new(
            vec![failing, ok_provider("beta", 1, 0.10)],
            &TasksConfig::default(),
        );

        let id = queue.enqueue(request(1.0), None).unwrap();
        let record = queue.wait_terminal(&id).await.unwrap();

        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(record.provider.as_deref(), Some("beta"));
        assert!((record.cost - 0.10).abs() < 1e-9);
        // The failed attempt is preserved on the record.
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].0, "alpha");
    }

    #[tokio::test]
    async fn test_failed_only_after_all_providers() {
        let make_failing = |id: &str| -> Arc<dyn Provider> {
            Arc::new(FakeProvider {
                id: id.to_string(),
                tier: 0,
                cost_per_unit: 0.01,
                delay: Duration::ZERO,
                outcome: Err("boom".to_string()),
            })
        };
        let queue = TaskQueue::new(
            vec![make_failing("a"), make_failing("b"), make_failing("c")],
            &TasksConfig::default(),
        );

        let id = queue.enqueue(request(1.0), None).unwrap();
        let record = queue.wait_terminal(&id).await.unwrap();

        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.cost, 0.0);
        assert_eq!(record.errors.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_capped() {
        let slow = |id: &str| -> Arc<dyn Provider> {
            Arc::new(FakeProvider {
                id: id.to_string(),
                tier: 0,
                cost_per_unit: 0.0,
                delay: Duration::from_millis(100),
                outcome: Ok("out".to_string()),
            })
        };
        let config = TasksConfig {
            max_concurrent: 2,
            cancel_grace_secs: 1,
        };
        let queue = TaskQueue::new(vec![slow("only")], &config);

        let ids: Vec<String> = (0..5)
            .map(|_| queue.enqueue(request(1.0), None).unwrap())
            .collect();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let running = ids
            .iter()
            .filter(|id| queue.status(id).unwrap().state == TaskState::Running)
            .count();
        let pending = ids
            .iter()
            .filter(|id| queue.status(id).unwrap().state == TaskState::Pending)
            .count();
        assert!(running <= 2);
        assert_eq!(running + pending, 5);

        for id in &ids {
            assert_eq!(
                queue.wait_terminal(id).await.unwrap().state,
                TaskState::Completed
            );
        }
    }

    #[tokio::test]
    async fn test_pending_cancellation_is_free() {
        let slow: Arc<dyn Provider> = Arc::new(FakeProvider {
            id: "slow".to_string(),
            tier: 0,
            cost_per_unit: 1.0,
            delay: Duration::from_millis(200),
            outcome: Ok("out".to_string()),
        });
        let config = TasksConfig {
            max_concurrent: 1,
            cancel_grace_secs: 1,
        };
        let queue = TaskQueue::new(vec![slow], &config);

        let first = queue.enqueue(request(1.0), None).unwrap();
        let second = queue.enqueue(request(1.0), None).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.status(&second).unwrap().state, TaskState::Pending);

        let state = queue.cancel(&second).await.unwrap();
        assert_eq!(state, TaskState::Cancelled);
        let record = queue.status(&second).unwrap();
        assert_eq!(record.cost, 0.0);
        assert!(record.provider.is_none());

        // The running task is unaffected.
        assert_eq!(
            queue.wait_terminal(&first).await.unwrap().state,
            TaskState::Completed
        );
    }

    #[tokio::test]
    async fn test_running_cancellation_stops_task() {
        let slow: Arc<dyn Provider> = Arc::new(FakeProvider {
            id: "slow".to_string(),
            tier: 0,
            cost_per_unit: 1.0,
            delay: Duration::from_millis(500),
            outcome: Ok("out".to_string()),
        });
        let config = TasksConfig {
            max_concurrent: 1,
            cancel_grace_secs: 2,
        };
        let queue = TaskQueue::new(vec![slow], &config);

        let id = queue.enqueue(request(1.0), None).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.status(&id).unwrap().state, TaskState::Running);

        let state = queue.cancel(&id).await.unwrap();
        assert_eq!(state, TaskState::Cancelled);
        assert_eq!(queue.status(&id).unwrap().cost, 0.0);
    }

    #[tokio::test]
    async fn test_budget_ceiling_rejects_at_enqueue() {
        let queue = TaskQueue::new(
            vec![ok_provider("pricey", 0, 2.0)],
            &TasksConfig::default(),
        );
        let mut req = request(10.0);
        req.budget_ceiling = Some(1.0);

        let result = queue.enqueue(req, None);
        assert!(matches!(
            result,
            Err(TaskError::BudgetExceeded { estimate, ceiling })
                if (estimate - 20.0).abs() < 1e-9 && (ceiling - 1.0).abs() < 1e-9
        ));
        assert!(queue.list().is_empty());
    }

    #[tokio::test]
    async fn test_preference_overrides_tier_order() {
        let queue = TaskQueue::new(
            vec![ok_provider("cheap", 0, 0.01), ok_provider("fancy", 5, 0.50)],
            &TasksConfig::default(),
        );

        let id = queue
            .enqueue(request(1.0), Some(vec!["fancy".to_string()]))
            .unwrap();
        let record = queue.wait_terminal(&id).await.unwrap();
        assert_eq!(record.provider.as_deref(), Some("fancy"));
    }

    #[tokio::test]
    async fn test_no_providers_rejected() {
        let queue = TaskQueue::new(Vec::new(), &TasksConfig::default());
        assert!(matches!(
            queue.enqueue(request(1.0), None),
            Err(TaskError::NoProviders)
        ));
    }

    #[test]
    fn test_estimate_cost_picks_cheapest() {
        let queue = TaskQueue::new(
            vec![ok_provider("a", 0, 0.30), ok_provider("b", 1, 0.10)],
            &TasksConfig::default(),
        );
        let estimate = queue.estimate_cost(&request(2.0), None).unwrap();
        assert!((estimate - 0.20).abs() < 1e-9);
    }
}
