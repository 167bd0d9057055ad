//! Per-execution context handed to handlers and filters.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use conveyor_core::models::message::TaskMessage;
use conveyor_core::models::result::TaskState;
use conveyor_core::{ResultBackend, StoreError, TaskError};

/// Services a task may resolve during execution. Built once per executor and
/// cloned into each execution scope.
#[derive(Default)]
pub struct ServiceScope {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, service: Arc<T>) {
        self.entries.insert(TypeId::of::<T>(), service);
    }
}

/// Restricted service locator exposed on the task context.
///
/// Lookups of the container types themselves are refused so a task cannot
/// reach back into the scope and escalate out of it.
#[derive(Clone, Default)]
pub struct ScopedServices {
    scope: Arc<ServiceScope>,
}

impl ScopedServices {
    pub fn new(scope: Arc<ServiceScope>) -> Self {
        Self { scope }
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let requested = TypeId::of::<T>();
        if requested == TypeId::of::<ServiceScope>() || requested == TypeId::of::<ScopedServices>()
        {
            tracing::warn!("Task attempted to resolve the service container itself; refused");
            return None;
        }
        self.scope
            .entries
            .get(&requested)
            .and_then(|any| any.clone().downcast::<T>().ok())
    }
}

/// Identity, envelope metadata and callbacks for one task execution.
pub struct TaskContext {
    pub task_id: String,
    pub task_name: String,
    pub parent_id: Option<String>,
    pub root_id: Option<String>,
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub queue: String,
    pub sent_at: DateTime<Utc>,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub headers: HashMap<String, String>,
    pub retry_count: u32,
    pub max_retries: u32,
    backend: Arc<dyn ResultBackend>,
    services: ScopedServices,
}

impl TaskContext {
    pub fn from_message(
        message: &TaskMessage,
        backend: Arc<dyn ResultBackend>,
        services: ScopedServices,
    ) -> Self {
        Self {
            task_id: message.id.clone(),
            task_name: message.task_name.clone(),
            parent_id: message.parent_id.clone(),
            root_id: message.root_id.clone(),
            correlation_id: message.correlation_id.clone(),
            tenant_id: message.tenant_id.clone(),
            queue: message.queue.clone(),
            sent_at: message.sent_at,
            eta: message.eta,
            expires: message.expires,
            headers: message.headers.clone(),
            retry_count: message.retry_count,
            max_retries: message.max_retries,
            backend,
            services,
        }
    }

    pub fn services(&self) -> &ScopedServices {
        &self.services
    }

    /// Express a retry. Past the retry budget this becomes a rejection, so
    /// handlers can `return Err(ctx.retry(...))` unconditionally.
    pub fn retry(&self, countdown: Option<Duration>, cause: Option<String>) -> TaskError {
        if self.retry_count >= self.max_retries {
            TaskError::reject(format!(
                "max retries ({}) exceeded for task {}",
                self.max_retries, self.task_name
            ))
        } else {
            TaskError::retry(countdown, cause)
        }
    }

    /// Push an intermediate state (with optional metadata) to the backend.
    pub async fn update_state(
        &self,
        state: TaskState,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<(), StoreError> {
        self.backend
            .update_state(&self.task_id, state, metadata)
            .await
    }

    /// Progress reporting rides on state metadata.
    pub async fn report_progress(
        &self,
        percent: u8,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut metadata = HashMap::new();
        metadata.insert("progress".to_string(), percent.min(100).to_string());
        if let Some(message) = message {
            metadata.insert("progress_message".to_string(), message.to_string());
        }
        self.backend
            .update_state(&self.task_id, TaskState::Started, Some(metadata))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmailClient {
        host: String,
    }

    #[test]
    fn scoped_services_resolve_registered_types() {
        let mut scope = ServiceScope::new();
        scope.insert(Arc::new(EmailClient {
            host: "smtp.example.com".to_string(),
        }));
        let services = ScopedServices::new(Arc::new(scope));

        let client = services.get::<EmailClient>().unwrap();
        assert_eq!(client.host, "smtp.example.com");
        assert!(services.get::<String>().is_none());
    }

    #[test]
    fn retry_sugar_turns_into_reject_past_budget() {
        let backend = Arc::new(conveyor_memory::InMemoryResultBackend::new());
        let mut message = TaskMessage::builder("t").max_retries(2).build();
        message.retry_count = 1;
        let ctx = TaskContext::from_message(&message, backend.clone(), ScopedServices::default());
        assert!(matches!(ctx.retry(None, None), TaskError::Retry { .. }));

        message.retry_count = 2;
        let ctx = TaskContext::from_message(&message, backend, ScopedServices::default());
        assert!(matches!(ctx.retry(None, None), TaskError::Reject { .. }));
    }

    #[test]
    fn container_reflection_lookups_are_refused() {
        let mut scope = ServiceScope::new();
        // Even a scope that (wrongly) contains itself must refuse the lookup.
        scope.insert(Arc::new(ServiceScope::new()));
        let services = ScopedServices::new(Arc::new(scope));
        assert!(services.get::<ServiceScope>().is_none());
        assert!(services.get::<ScopedServices>().is_none());
    }
}
