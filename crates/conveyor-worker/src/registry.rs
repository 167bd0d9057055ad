//! Process-wide task registry.
//!
//! Lookups are lock-free in spirit: readers clone an `Arc` snapshot of an
//! immutable map; registration takes a mutex, builds a new map and swaps it
//! in. Each entry holds the descriptor plus a type-erased invoker closure
//! bound at registration time; input deserialization targets the type the
//! descriptor declares.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use conveyor_core::models::rate_limit::RateLimitPolicy;

use crate::filter::TaskFilter;
use crate::handler::{ErasedHandler, HandlerInvoker, TaskHandler};
use crate::time_limit::TimeLimitPolicy;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("task \"{task_name}\" is already registered by {existing_type}")]
    Collision {
        task_name: String,
        existing_type: &'static str,
    },
}

/// Per-registration options. The defaults leave everything to the worker
/// configuration.
#[derive(Default)]
pub struct RegistrationOptions {
    pub rate_limit: Option<RateLimitPolicy>,
    pub queue: Option<String>,
    pub time_limits: Option<TimeLimitPolicy>,
    pub filters: Vec<Arc<dyn TaskFilter>>,
}

pub struct TaskRegistration {
    pub task_name: String,
    pub handler_type: &'static str,
    pub input_type: &'static str,
    pub output_type: &'static str,
    pub rate_limit: Option<RateLimitPolicy>,
    pub queue: Option<String>,
    pub time_limits: Option<TimeLimitPolicy>,
    pub filters: Vec<Arc<dyn TaskFilter>>,
    pub(crate) invoker: Arc<dyn ErasedHandler>,
}

type RegistrationMap = HashMap<String, Arc<TaskRegistration>>;

pub struct TaskRegistry {
    snapshot: RwLock<Arc<RegistrationMap>>,
    write_lock: Mutex<()>,
    /// When set, a name collision with a different handler type errors
    /// instead of overwriting.
    strict: bool,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

impl TaskRegistry {
    pub fn new(strict: bool) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            write_lock: Mutex::new(()),
            strict,
        }
    }

    pub fn register<H: TaskHandler>(
        &self,
        handler: H,
        options: RegistrationOptions,
    ) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().unwrap();
        let current = self.snapshot.read().unwrap().clone();

        if let Some(existing) = current.get(H::NAME) {
            if existing.handler_type == type_name::<H>() {
                tracing::debug!(task_name = H::NAME, "Task already registered, skipping");
                return Ok(());
            }
            if self.strict {
                return Err(RegistryError::Collision {
                    task_name: H::NAME.to_string(),
                    existing_type: existing.handler_type,
                });
            }
            tracing::warn!(
                task_name = H::NAME,
                existing_type = existing.handler_type,
                new_type = type_name::<H>(),
                "Task name collision, overwriting registration"
            );
        }

        let registration = Arc::new(TaskRegistration {
            task_name: H::NAME.to_string(),
            handler_type: type_name::<H>(),
            input_type: type_name::<H::Input>(),
            output_type: type_name::<H::Output>(),
            rate_limit: options.rate_limit,
            queue: options.queue,
            time_limits: options.time_limits,
            filters: options.filters,
            invoker: Arc::new(HandlerInvoker::new(handler)),
        });

        let mut next = (*current).clone();
        next.insert(H::NAME.to_string(), registration);
        *self.snapshot.write().unwrap() = Arc::new(next);
        tracing::info!(task_name = H::NAME, "Task registered");
        Ok(())
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<TaskRegistration>> {
        self.snapshot.read().unwrap().get(task_name).cloned()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.snapshot.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use async_trait::async_trait;
    use conveyor_core::TaskError;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    #[derive(Deserialize, Serialize)]
    struct Empty {}

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        const NAME: &'static str = "tests.echo";
        type Input = Empty;
        type Output = Empty;

        async fn execute(
            &self,
            input: Self::Input,
            _ctx: &TaskContext,
            _token: CancellationToken,
        ) -> Result<Self::Output, TaskError> {
            Ok(input)
        }
    }

    struct Other;

    #[async_trait]
    impl TaskHandler for Other {
        const NAME: &'static str = "tests.echo";
        type Input = Empty;
        type Output = Empty;

        async fn execute(
            &self,
            input: Self::Input,
            _ctx: &TaskContext,
            _token: CancellationToken,
        ) -> Result<Self::Output, TaskError> {
            Ok(input)
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = TaskRegistry::new(false);
        registry.register(Echo, RegistrationOptions::default()).unwrap();

        let registration = registry.get("tests.echo").unwrap();
        assert_eq!(registration.task_name, "tests.echo");
        assert!(registration.input_type.contains("Empty"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_type_re_registration_is_idempotent() {
        let registry = TaskRegistry::new(true);
        registry.register(Echo, RegistrationOptions::default()).unwrap();
        registry.register(Echo, RegistrationOptions::default()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn collision_overwrites_when_not_strict() {
        let registry = TaskRegistry::new(false);
        registry.register(Echo, RegistrationOptions::default()).unwrap();
        registry.register(Other, RegistrationOptions::default()).unwrap();
        let registration = registry.get("tests.echo").unwrap();
        assert!(registration.handler_type.contains("Other"));
    }

    #[test]
    fn collision_errors_when_strict() {
        let registry = TaskRegistry::new(true);
        registry.register(Echo, RegistrationOptions::default()).unwrap();
        let err = registry
            .register(Other, RegistrationOptions::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Collision { .. }));
    }
}
