//! Task dispatch with retry, backoff and timeout
//!
//! One `run` call is one dispatch: it resolves the task through the cache or
//! the provider registry, retries transient failures, and leaves exactly one
//! history entry behind (an artifact on success, a failure record otherwise).
//! No LLM is involved here.

use crate::cache::Cache;
use crate::config::{ExecutorSettings, RetryPolicy};
use crate::error::ResearchError;
use crate::models::{
    FailedDispatch, FailureClass, LoopRecord, MessageRole, NewArtifact, ResearchArtifact, Task,
};
use crate::providers::{ProviderError, ProviderRegistry, ProviderResponse};
use crate::store::SessionStore;
use crate::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub error: ProviderError,
    pub class: FailureClass,
}

/// Result of one dispatch.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task: Task,
    pub outcome: std::result::Result<ResearchArtifact, ExecutionFailure>,
    /// Provider calls made; zero for cache hits and pre-call rejections.
    pub attempts: u32,
    pub cost_usd: f64,
    pub from_cache: bool,
}

impl Dispatch {
    pub fn artifact(&self) -> Option<&ResearchArtifact> {
        self.outcome.as_ref().ok()
    }
}

pub struct Executor {
    registry: Arc<ProviderRegistry>,
    cache: Arc<Cache>,
    store: Arc<dyn SessionStore>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl Executor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<Cache>,
        store: Arc<dyn SessionStore>,
        settings: &ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            cache,
            store,
            permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            retry: settings.retry.clone(),
            call_timeout: settings.call_timeout,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Dispatches one task. Only persistence failures are returned as `Err`.
    ///
    /// Cancellation cuts a backoff sleep short; the task then settles with
    /// its last transient error. A call already in flight is never abandoned.
    pub async fn run(
        &self,
        session_id: Uuid,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<Dispatch> {
        let capability = task.capability;

        if !self.registry.supports(capability) {
            let error = ProviderError::UnsupportedCapability(capability);
            return self.record_failure(session_id, task, error, 0, 0.0).await;
        }

        if let Some(response) = self.cache.get(capability, &task.args).await {
            debug!(session_id = %session_id, task = %task.label(), "served from cache");
            let artifact = self.persist_artifact(session_id, task, response, 0.0, true).await?;
            return Ok(Dispatch {
                task: task.clone(),
                outcome: Ok(artifact),
                attempts: 0,
                cost_usd: 0.0,
                from_cache: true,
            });
        }

        let cost = self.registry.estimated_cost(capability);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = {
                // the permit covers one provider call, never a backoff sleep
                let _permit = self.permits.acquire().await.map_err(|_| {
                    ResearchError::Config("executor worker pool is closed".to_string())
                })?;
                match tokio::time::timeout(
                    self.call_timeout,
                    self.registry.dispatch(capability, &task.args),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(self.call_timeout)),
                }
            };

            match result {
                Ok(response) => {
                    self.cache.set(capability, &task.args, &response).await;
                    let artifact = self
                        .persist_artifact(session_id, task, response, cost, false)
                        .await?;
                    debug!(
                        session_id = %session_id,
                        task = %task.label(),
                        attempts = attempt,
                        "task dispatched"
                    );
                    return Ok(Dispatch {
                        task: task.clone(),
                        outcome: Ok(artifact),
                        attempts: attempt,
                        cost_usd: cost,
                        from_cache: false,
                    });
                }
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = compute_retry_delay(&self.retry, attempt - 1, error.retry_after());
                    warn!(
                        session_id = %session_id,
                        task = %task.label(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient provider failure; retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!(session_id = %session_id, task = %task.label(), "backoff cancelled");
                            return self
                                .record_failure(session_id, task, error, attempt, cost)
                                .await;
                        }
                    }
                }
                Err(error) => {
                    let charged = match error {
                        ProviderError::InvalidArguments(_) | ProviderError::NotConfigured(_) => 0.0,
                        _ => cost,
                    };
                    return self
                        .record_failure(session_id, task, error, attempt, charged)
                        .await;
                }
            }
        }
    }

    async fn persist_artifact(
        &self,
        session_id: Uuid,
        task: &Task,
        response: ProviderResponse,
        cost_usd: f64,
        from_cache: bool,
    ) -> Result<ResearchArtifact> {
        self.store
            .append_artifact(
                session_id,
                NewArtifact {
                    capability: task.capability,
                    args: task.args.clone(),
                    digest: task.digest.clone(),
                    payload: response.data,
                    source: response.source,
                    cost_usd,
                    from_cache,
                },
            )
            .await
    }

    async fn record_failure(
        &self,
        session_id: Uuid,
        task: &Task,
        error: ProviderError,
        attempts: u32,
        cost_usd: f64,
    ) -> Result<Dispatch> {
        let class = error.class();
        warn!(
            session_id = %session_id,
            task = %task.label(),
            attempts,
            class = ?class,
            error = %error,
            "dispatch failed"
        );

        let record = LoopRecord::DispatchFailed(FailedDispatch {
            capability: task.capability,
            args: task.args.clone(),
            digest: task.digest.clone(),
            class,
            reason: error.to_string(),
            attempts,
            cost_usd,
        });

        self.store
            .append_message_with_metadata(
                session_id,
                MessageRole::System,
                &format!("{} failed: {}", task.label(), error),
                Some(serde_json::to_value(&record)?),
            )
            .await?;

        Ok(Dispatch {
            task: task.clone(),
            outcome: Err(ExecutionFailure { error, class }),
            attempts,
            cost_usd,
            from_cache: false,
        })
    }
}

/// Exponential backoff capped at `max_delay`. A server `Retry-After` raises
/// the delay but never past `max_delay`.
pub fn compute_retry_delay(
    policy: &RetryPolicy,
    retries_used: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let base_ms = policy.base_delay.as_millis();
    let max_ms = policy.max_delay.as_millis().max(base_ms);
    let shift = retries_used.min(20);
    let backoff_ms = base_ms.saturating_mul(1u128 << shift).min(max_ms);
    let mut millis = u64::try_from(backoff_ms).unwrap_or(u64::MAX);

    if policy.jitter && millis > 1 {
        let half = millis / 2;
        millis = half + rand::thread_rng().gen_range(0..=half);
    }

    let delay = Duration::from_millis(millis);
    let ceiling = Duration::from_millis(u64::try_from(max_ms).unwrap_or(u64::MAX));
    match retry_after {
        Some(server) if server > delay => server.min(ceiling),
        _ => delay,
    }
}
