//! Filter pipeline around task invocation.
//!
//! Filters run in declared order before the handler (`on_executing`), in
//! reverse order after it resolves (`on_executed`), and on exceptions
//! (`on_exception`). A before-hook may short-circuit the handler with a
//! terminal result or ask for the message to be requeued; after-hooks only
//! run for filters whose before-hook actually fired.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conveyor_core::models::message::TaskMessage;
use conveyor_core::models::result::TaskResult;
use conveyor_core::TaskError;

pub struct FilterContext<'a> {
    pub message: &'a TaskMessage,
    /// Terminal result to return without invoking the handler.
    pub skip_result: Option<TaskResult>,
    /// Ask the worker to put the message back on the queue.
    pub requeue: bool,
    pub requeue_delay: Option<Duration>,
    /// Result produced so far; after-hooks may replace it.
    pub result: Option<TaskResult>,
    /// Error raised by the handler (or an earlier filter).
    pub error: Option<TaskError>,
    /// Set by an exception hook that handled the error; `result` then
    /// carries the replacement outcome.
    pub exception_handled: bool,
}

impl<'a> FilterContext<'a> {
    fn new(message: &'a TaskMessage) -> Self {
        Self {
            message,
            skip_result: None,
            requeue: false,
            requeue_delay: None,
            result: None,
            error: None,
            exception_handled: false,
        }
    }

    /// Short-circuit the handler with `result`.
    pub fn skip_with(&mut self, result: TaskResult) {
        self.skip_result = Some(result);
    }

    /// Request a requeue with an optional delay.
    pub fn requeue_with(&mut self, delay: Option<Duration>) {
        self.requeue = true;
        self.requeue_delay = delay;
    }
}

#[async_trait]
pub trait TaskFilter: Send + Sync {
    /// Filters sort ascending by order; ties keep registration order.
    fn order(&self) -> i32 {
        0
    }

    async fn on_executing(&self, _ctx: &mut FilterContext<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    async fn on_executed(&self, _ctx: &mut FilterContext<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    async fn on_exception(&self, _ctx: &mut FilterContext<'_>) -> Result<(), TaskError> {
        Ok(())
    }
}

/// What the pipeline resolved to; the executor classifies this into a
/// terminal [`TaskResult`].
pub enum PipelineOutcome {
    /// The handler ran and returned serialized output.
    HandlerOutput { output: Vec<u8>, content_type: String },
    /// A filter supplied the result (skip, synthesized success, replacement
    /// after an exception, or a rewrite in `on_executed`).
    FilterResult(TaskResult),
    /// A filter asked for the message to be requeued.
    Requeue { delay: Option<Duration> },
    /// The handler (or a filter) raised and nothing handled it.
    Error(TaskError),
}

pub struct FilterPipeline {
    filters: Vec<Arc<dyn TaskFilter>>,
}

impl FilterPipeline {
    /// Merge global and per-task filters, sorted by declared order.
    pub fn new(global: &[Arc<dyn TaskFilter>], per_task: &[Arc<dyn TaskFilter>]) -> Self {
        let mut filters: Vec<Arc<dyn TaskFilter>> =
            global.iter().chain(per_task.iter()).cloned().collect();
        filters.sort_by_key(|f| f.order());
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub async fn run<F, Fut>(&self, message: &TaskMessage, handler: F) -> PipelineOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Vec<u8>, String), TaskError>>,
    {
        let mut ctx = FilterContext::new(message);
        let mut fired = 0usize;

        for filter in &self.filters {
            match filter.on_executing(&mut ctx).await {
                Ok(()) => {}
                Err(e) => {
                    ctx.error = Some(e);
                    fired += 1;
                    break;
                }
            }
            fired += 1;
            if ctx.skip_result.is_some() || ctx.requeue {
                break;
            }
        }

        // On a normal return the preliminary success result is exposed to
        // the after-hooks; returning it untouched keeps the plain
        // handler-output path.
        let mut handler_output = None;
        let mut preliminary = None;
        if ctx.error.is_none() && ctx.skip_result.is_none() && !ctx.requeue {
            match handler().await {
                Ok((output, content_type)) => {
                    let result = TaskResult::success(
                        message.id.clone(),
                        output.clone(),
                        content_type.clone(),
                    );
                    preliminary = Some(result.clone());
                    ctx.result = Some(result);
                    handler_output = Some((output, content_type));
                }
                Err(e) => ctx.error = Some(e),
            }
        }

        if let Some(result) = ctx.skip_result.take() {
            ctx.result = Some(result);
        }

        // Exception hooks run before the after-hooks so a replacement result
        // is visible to them.
        if ctx.error.is_some() {
            for filter in self.filters[..fired].iter().rev() {
                if let Err(e) = filter.on_exception(&mut ctx).await {
                    tracing::warn!(error = %e, "Filter on_exception raised; ignoring");
                }
                if ctx.exception_handled {
                    break;
                }
            }
        }

        for filter in self.filters[..fired].iter().rev() {
            if let Err(e) = filter.on_executed(&mut ctx).await {
                tracing::warn!(error = %e, "Filter on_executed raised; ignoring");
            }
        }

        if ctx.requeue {
            return PipelineOutcome::Requeue {
                delay: ctx.requeue_delay,
            };
        }
        if ctx.exception_handled {
            if let Some(result) = ctx.result.take() {
                return PipelineOutcome::FilterResult(result);
            }
        }
        if let Some(error) = ctx.error.take() {
            return PipelineOutcome::Error(error);
        }
        if let Some(result) = ctx.result.take() {
            if preliminary.as_ref() != Some(&result) {
                return PipelineOutcome::FilterResult(result);
            }
        }
        match handler_output {
            Some((output, content_type)) => PipelineOutcome::HandlerOutput {
                output,
                content_type,
            },
            // No handler, no skip, no error: a filter consumed the outcome
            // without providing one.
            None => PipelineOutcome::Error(TaskError::Failure(anyhow::anyhow!(
                "filter pipeline resolved without an outcome"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        order: i32,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TaskFilter for Recording {
        fn order(&self) -> i32 {
            self.order
        }

        async fn on_executing(&self, _ctx: &mut FilterContext<'_>) -> Result<(), TaskError> {
            self.log.lock().unwrap().push(format!("{}:executing", self.name));
            Ok(())
        }

        async fn on_executed(&self, _ctx: &mut FilterContext<'_>) -> Result<(), TaskError> {
            self.log.lock().unwrap().push(format!("{}:executed", self.name));
            Ok(())
        }
    }

    struct Skipping;

    #[async_trait]
    impl TaskFilter for Skipping {
        async fn on_executing(&self, ctx: &mut FilterContext<'_>) -> Result<(), TaskError> {
            ctx.skip_with(TaskResult::rejected(ctx.message.id.clone(), "filtered out"));
            Ok(())
        }
    }

    struct Requeueing;

    #[async_trait]
    impl TaskFilter for Requeueing {
        async fn on_executing(&self, ctx: &mut FilterContext<'_>) -> Result<(), TaskError> {
            ctx.requeue_with(Some(Duration::from_secs(5)));
            Ok(())
        }
    }

    struct Handling;

    #[async_trait]
    impl TaskFilter for Handling {
        async fn on_exception(&self, ctx: &mut FilterContext<'_>) -> Result<(), TaskError> {
            ctx.exception_handled = true;
            ctx.result = Some(TaskResult::success(
                ctx.message.id.clone(),
                b"\"recovered\"".to_vec(),
                "application/json",
            ));
            Ok(())
        }
    }

    fn message() -> TaskMessage {
        TaskMessage::builder("t").build()
    }

    async fn ok_handler() -> Result<(Vec<u8>, String), TaskError> {
        Ok((b"\"ok\"".to_vec(), "application/json".to_string()))
    }

    #[tokio::test]
    async fn hooks_run_in_order_then_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let filters: Vec<Arc<dyn TaskFilter>> = vec![
            Arc::new(Recording { name: "b", order: 2, log: log.clone() }),
            Arc::new(Recording { name: "a", order: 1, log: log.clone() }),
        ];
        let pipeline = FilterPipeline::new(&filters, &[]);
        let msg = message();
        let outcome = pipeline.run(&msg, ok_handler).await;

        assert!(matches!(outcome, PipelineOutcome::HandlerOutput { .. }));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                "a:executing".to_string(),
                "b:executing".to_string(),
                "b:executed".to_string(),
                "a:executed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn skip_prevents_handler_and_later_filters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let invoked = Arc::new(AtomicUsize::new(0));
        let filters: Vec<Arc<dyn TaskFilter>> = vec![
            Arc::new(Recording { name: "a", order: 0, log: log.clone() }),
            Arc::new(Skipping),
            Arc::new(Recording { name: "z", order: 9, log: log.clone() }),
        ];
        let pipeline = FilterPipeline::new(&filters, &[]);
        let msg = message();
        let invoked_clone = invoked.clone();
        let outcome = pipeline
            .run(&msg, || async move {
                invoked_clone.fetch_add(1, Ordering::SeqCst);
                ok_handler().await
            })
            .await;

        match outcome {
            PipelineOutcome::FilterResult(result) => {
                assert_eq!(result.state, conveyor_core::TaskState::Rejected)
            }
            _ => panic!("expected FilterResult"),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        // The later filter never fired, so only "a" sees executed.
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["a:executing".to_string(), "a:executed".to_string()]
        );
    }

    #[tokio::test]
    async fn requeue_request_short_circuits() {
        let filters: Vec<Arc<dyn TaskFilter>> = vec![Arc::new(Requeueing)];
        let pipeline = FilterPipeline::new(&filters, &[]);
        let msg = message();
        let outcome = pipeline.run(&msg, ok_handler).await;
        match outcome {
            PipelineOutcome::Requeue { delay } => {
                assert_eq!(delay, Some(Duration::from_secs(5)))
            }
            _ => panic!("expected Requeue"),
        }
    }

    #[tokio::test]
    async fn exception_hook_may_replace_the_outcome() {
        let filters: Vec<Arc<dyn TaskFilter>> = vec![Arc::new(Handling)];
        let pipeline = FilterPipeline::new(&filters, &[]);
        let msg = message();
        let outcome = pipeline
            .run(&msg, || async {
                Err(TaskError::Failure(anyhow::anyhow!("boom")))
            })
            .await;
        match outcome {
            PipelineOutcome::FilterResult(result) => {
                assert_eq!(result.state, conveyor_core::TaskState::Success)
            }
            _ => panic!("expected FilterResult"),
        }
    }

    #[tokio::test]
    async fn unhandled_exception_propagates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let filters: Vec<Arc<dyn TaskFilter>> =
            vec![Arc::new(Recording { name: "a", order: 0, log: log.clone() })];
        let pipeline = FilterPipeline::new(&filters, &[]);
        let msg = message();
        let outcome = pipeline
            .run(&msg, || async {
                Err(TaskError::Failure(anyhow::anyhow!("boom")))
            })
            .await;
        assert!(matches!(outcome, PipelineOutcome::Error(_)));
        // on_executed still ran for the fired filter.
        assert!(log
            .lock()
            .unwrap()
            .contains(&"a:executed".to_string()));
    }

    #[tokio::test]
    async fn empty_pipeline_passes_handler_output_through() {
        let pipeline = FilterPipeline::new(&[], &[]);
        let msg = message();
        let outcome = pipeline.run(&msg, ok_handler).await;
        match outcome {
            PipelineOutcome::HandlerOutput { output, .. } => {
                assert_eq!(output, b"\"ok\"".to_vec())
            }
            _ => panic!("expected HandlerOutput"),
        }
    }
}
