//! Task executor: one delivered message in, one classified outcome out.
//!
//! Order of operations per message: registry lookup, pre-execution
//! revocation check, rate-limit admission, revocation registration (linked
//! cancellation token), Started state, then the handler wrapped in the
//! filter pipeline and time-limit enforcer, and finally outcome
//! classification with result persistence and signals. The revocation
//! registration is released on every exit path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use conveyor_core::models::message::TaskMessage;
use conveyor_core::models::result::{ExceptionInfo, TaskResult, TaskState};
use conveyor_core::models::signal::{SignalKind, TaskSignal};
use conveyor_core::{RateLimiter, ResultBackend, StoreError, TaskError};
use conveyor_infra::RetryPolicy;

use crate::context::{ScopedServices, ServiceScope, TaskContext};
use crate::filter::{FilterPipeline, PipelineOutcome, TaskFilter};
use crate::registry::{TaskRegistration, TaskRegistry};
use crate::revocation::RevocationManager;
use crate::signals::SignalBus;
use crate::time_limit;

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// No registration for the message's task name; the caller nacks and
    /// dead-letters the message.
    #[error("no handler registered for task \"{0}\"")]
    UnknownTask(String),

    /// The caller's own token fired; nothing was persisted.
    #[error("execution of task {0} was cancelled externally")]
    Cancelled(String),

    /// A store operation failed past the retry policy.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub enable_revocation: bool,
    pub check_revocation_before_execution: bool,
    pub enable_rate_limiting: bool,
    /// Fixed delay for rate-limit requeues; the lease's retry-after is used
    /// when unset.
    pub rate_limit_requeue_delay: Option<Duration>,
    pub default_result_expiry: Option<Duration>,
    pub worker_identity: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            enable_revocation: true,
            check_revocation_before_execution: true,
            enable_rate_limiting: true,
            rate_limit_requeue_delay: None,
            default_result_expiry: Some(Duration::from_secs(24 * 3600)),
            worker_identity: default_worker_identity(),
        }
    }
}

impl ExecutorOptions {
    /// Derive the executor's toggles from the worker configuration.
    pub fn from_worker_config(config: &conveyor_core::config::WorkerConfig) -> Self {
        Self {
            enable_revocation: config.enable_revocation,
            check_revocation_before_execution: config.check_revocation_before_execution,
            enable_rate_limiting: config.enable_rate_limiting,
            rate_limit_requeue_delay: config.rate_limit_requeue_delay,
            ..Default::default()
        }
    }
}

fn default_worker_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    backend: Arc<dyn ResultBackend>,
    revocation: Option<Arc<RevocationManager>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    signals: Arc<SignalBus>,
    global_filters: Vec<Arc<dyn TaskFilter>>,
    services: Arc<ServiceScope>,
    retry_policy: RetryPolicy,
    options: ExecutorOptions,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TaskRegistry>,
        backend: Arc<dyn ResultBackend>,
        revocation: Option<Arc<RevocationManager>>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        signals: Arc<SignalBus>,
        global_filters: Vec<Arc<dyn TaskFilter>>,
        services: Arc<ServiceScope>,
        retry_policy: RetryPolicy,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            registry,
            backend,
            revocation,
            rate_limiter,
            signals,
            global_filters,
            services,
            retry_policy,
            options,
        }
    }

    pub fn worker_identity(&self) -> &str {
        &self.options.worker_identity
    }

    #[tracing::instrument(skip(self, message, external), fields(task.id = %message.id, task.name = %message.task_name))]
    pub async fn execute(
        &self,
        message: &TaskMessage,
        external: CancellationToken,
    ) -> Result<TaskResult, ExecuteError> {
        let registration = self
            .registry
            .get(&message.task_name)
            .ok_or_else(|| ExecuteError::UnknownTask(message.task_name.clone()))?;

        let manager = if self.options.enable_revocation {
            self.revocation.as_ref()
        } else {
            None
        };

        // Pre-execution revocation check: skip without running the handler.
        if let Some(manager) = manager {
            if self.options.check_revocation_before_execution {
                match manager.is_revoked(&message.id).await {
                    Ok(true) => {
                        tracing::info!(task_id = %message.id, "Task revoked before start, skipping");
                        let result = self.finish(message, TaskResult::revoked(&message.id, false));
                        self.persist(&result).await?;
                        self.publish(SignalKind::TaskRevoked, message, &[("terminated", "false")])
                            .await;
                        return Ok(result);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Revocation check failed, continuing");
                    }
                }
            }
        }

        // Rate-limit admission. Denials become non-persisted Retry results
        // that never consume the retry budget.
        if self.options.enable_rate_limiting {
            if let (Some(limiter), Some(policy)) =
                (self.rate_limiter.as_ref(), registration.rate_limit.as_ref())
            {
                let key = policy.key_for(&message.task_name);
                match limiter.try_acquire(key, policy).await {
                    Ok(lease) if !lease.acquired() => {
                        let delay = self
                            .options
                            .rate_limit_requeue_delay
                            .or(lease.retry_after());
                        tracing::debug!(
                            task_id = %message.id,
                            resource_key = key,
                            retry_after_ms = delay.unwrap_or_default().as_millis() as u64,
                            "Rate limited, requeueing without retry increment"
                        );
                        let mut result =
                            self.finish(message, TaskResult::retry(&message.id, delay, None));
                        result.do_not_increment_retries = true;
                        return Ok(result);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Rate limiter unavailable, admitting task");
                    }
                }
            }
        }

        let token = match manager {
            Some(manager) => manager.register(&message.id, &external),
            None => external.child_token(),
        };

        let outcome = self
            .run_registered(message, &registration, &token, &external)
            .await;

        if let Some(manager) = manager {
            manager.unregister(&message.id);
        }
        outcome
    }

    async fn run_registered(
        &self,
        message: &TaskMessage,
        registration: &TaskRegistration,
        token: &CancellationToken,
        external: &CancellationToken,
    ) -> Result<TaskResult, ExecuteError> {
        let started = Instant::now();
        self.update_state(&message.id, TaskState::Started).await?;
        self.publish(SignalKind::TaskPreRun, message, &[]).await;

        let ctx = TaskContext::from_message(
            message,
            self.backend.clone(),
            ScopedServices::new(self.services.clone()),
        );
        let pipeline = FilterPipeline::new(&self.global_filters, &registration.filters);
        let time_limits = registration.time_limits;
        let invoker = registration.invoker.clone();

        let ctx_ref = &ctx;
        let outcome = pipeline
            .run(message, move || async move {
                time_limit::enforce(time_limits.as_ref(), &message.id, token, |linked| {
                    invoker.invoke(&message.args, &message.content_type, ctx_ref, linked)
                })
                .await
            })
            .await;

        let duration = started.elapsed();
        match outcome {
            PipelineOutcome::HandlerOutput {
                output,
                content_type,
            } => {
                let result = self
                    .finish(message, TaskResult::success(&message.id, output, content_type))
                    .with_duration(duration);
                self.persist(&result).await?;
                self.publish(SignalKind::TaskSuccess, message, &[]).await;
                self.publish(SignalKind::TaskPostRun, message, &[]).await;
                tracing::info!(task_id = %message.id, duration_ms = duration.as_millis() as u64, "Task succeeded");
                Ok(result)
            }

            PipelineOutcome::FilterResult(result) => {
                let result = self.finish(message, result).with_duration(duration);
                if result.state.is_terminal() {
                    self.persist(&result).await?;
                }
                self.publish(SignalKind::TaskPostRun, message, &[]).await;
                Ok(result)
            }

            PipelineOutcome::Requeue { delay } => {
                self.update_state(&message.id, TaskState::Requeued).await?;
                self.publish(
                    SignalKind::TaskRequeued,
                    message,
                    &[(
                        "requeue_delay_ms",
                        &delay.unwrap_or_default().as_millis().to_string(),
                    )],
                )
                .await;
                Ok(self.finish(message, TaskResult::requeued(&message.id, delay)))
            }

            PipelineOutcome::Error(error) => {
                self.classify_error(message, error, token, external, duration)
                    .await
            }
        }
    }

    async fn classify_error(
        &self,
        message: &TaskMessage,
        error: TaskError,
        token: &CancellationToken,
        external: &CancellationToken,
        duration: Duration,
    ) -> Result<TaskResult, ExecuteError> {
        match error {
            TaskError::Retry { countdown, cause } => {
                let exception = cause.map(|c| ExceptionInfo::new("retry", c));
                let result = self
                    .finish(message, TaskResult::retry(&message.id, countdown, exception))
                    .with_duration(duration);
                self.persist(&result).await?;
                self.publish(
                    SignalKind::TaskRetry,
                    message,
                    &[(
                        "retry_after_ms",
                        &countdown.unwrap_or_default().as_millis().to_string(),
                    )],
                )
                .await;
                self.publish(SignalKind::TaskPostRun, message, &[]).await;
                tracing::info!(task_id = %message.id, retry_count = message.retry_count, "Task requested retry");
                Ok(result)
            }

            TaskError::Reject { reason } => {
                let result = self
                    .finish(message, TaskResult::rejected(&message.id, reason.clone()))
                    .with_duration(duration);
                self.persist(&result).await?;
                self.publish(SignalKind::TaskRejected, message, &[("reason", &reason)])
                    .await;
                self.publish(SignalKind::TaskPostRun, message, &[]).await;
                tracing::warn!(task_id = %message.id, reason = %reason, "Task rejected");
                Ok(result)
            }

            TaskError::Cancelled => {
                if token.is_cancelled() && !external.is_cancelled() {
                    // The revocation-linked token fired without the caller's
                    // token: the task was revoked mid-flight.
                    let result = self
                        .finish(message, TaskResult::revoked(&message.id, true))
                        .with_duration(duration);
                    self.persist(&result).await?;
                    self.publish(SignalKind::TaskRevoked, message, &[("terminated", "true")])
                        .await;
                    self.publish(SignalKind::TaskPostRun, message, &[]).await;
                    tracing::info!(task_id = %message.id, "Task revoked mid-flight");
                    Ok(result)
                } else {
                    // Caller cancellation: no partial outcome is persisted.
                    Err(ExecuteError::Cancelled(message.id.clone()))
                }
            }

            error @ (TaskError::SoftTimeLimitExceeded { .. }
            | TaskError::TimeLimitExceeded { .. }
            | TaskError::Failure(_)) => {
                let exception = ExceptionInfo::from_task_error(&error);
                let result = self
                    .finish(message, TaskResult::failure(&message.id, exception))
                    .with_duration(duration);
                self.persist(&result).await?;
                self.publish(
                    SignalKind::TaskFailure,
                    message,
                    &[("error", &error.to_string())],
                )
                .await;
                self.publish(SignalKind::TaskPostRun, message, &[]).await;
                tracing::error!(task_id = %message.id, error = %error, "Task failed");
                Ok(result)
            }
        }
    }

    /// Stamp worker identity and retry count onto an outcome.
    fn finish(&self, message: &TaskMessage, result: TaskResult) -> TaskResult {
        result
            .with_retries(message.retry_count)
            .with_worker(self.options.worker_identity.clone())
    }

    async fn persist(&self, result: &TaskResult) -> Result<(), ExecuteError> {
        let expiry = self.options.default_result_expiry;
        self.retry_policy
            .run("store_result", || self.backend.store_result(result, expiry))
            .await
            .map_err(ExecuteError::Store)
    }

    async fn update_state(&self, task_id: &str, state: TaskState) -> Result<(), ExecuteError> {
        self.retry_policy
            .run("update_state", || {
                self.backend.update_state(task_id, state, None)
            })
            .await
            .map_err(ExecuteError::Store)
    }

    async fn publish(&self, kind: SignalKind, message: &TaskMessage, fields: &[(&str, &str)]) {
        let mut signal = TaskSignal::new(
            kind,
            &message.id,
            &message.task_name,
            &self.options.worker_identity,
        );
        for (key, value) in fields {
            signal = signal.with_field(*key, *value);
        }
        self.signals.publish(signal).await;
    }
}
