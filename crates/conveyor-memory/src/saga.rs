//! In-memory saga store.
//!
//! Mirrors the Postgres store's structure: every mutation reads the saga,
//! applies the pure transition logic from `conveyor_core::models::saga`,
//! maintains the per-state index (saga IDs ordered by creation time) and
//! applies the terminal TTL, all under one lock.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use conveyor_core::config::SagaStoreConfig;
use conveyor_core::models::saga::{Saga, SagaState, SagaStepState, StepUpdate};
use conveyor_core::{SagaStore, StoreError};

type StateIndexKey = (DateTime<Utc>, Uuid);

#[derive(Default)]
struct SagaStateMap {
    sagas: HashMap<Uuid, Saga>,
    task_index: HashMap<String, Uuid>,
    state_index: HashMap<SagaState, BTreeSet<StateIndexKey>>,
    expirations: HashMap<Uuid, DateTime<Utc>>,
}

impl SagaStateMap {
    fn index_tasks(&mut self, saga: &Saga) {
        for task_id in saga.referenced_task_ids() {
            self.task_index.insert(task_id, saga.id);
        }
    }

    fn move_state_index(&mut self, saga: &Saga, from: SagaState, to: SagaState) {
        if from == to {
            return;
        }
        let key = (saga.created_at, saga.id);
        if let Some(set) = self.state_index.get_mut(&from) {
            set.remove(&key);
        }
        self.state_index.entry(to).or_default().insert(key);
    }

    fn purge_expired(&mut self) {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .expirations
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.remove_saga(id);
        }
    }

    fn remove_saga(&mut self, id: Uuid) {
        if let Some(saga) = self.sagas.remove(&id) {
            let key = (saga.created_at, saga.id);
            if let Some(set) = self.state_index.get_mut(&saga.state) {
                set.remove(&key);
            }
            self.task_index.retain(|_, saga_id| *saga_id != id);
            self.expirations.remove(&id);
        }
    }
}

pub struct InMemorySagaStore {
    config: SagaStoreConfig,
    state: Mutex<SagaStateMap>,
}

impl InMemorySagaStore {
    pub fn new(config: SagaStoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SagaStateMap::default()),
        }
    }

    fn apply_ttl(&self, state: &mut SagaStateMap, saga_id: Uuid, saga_state: SagaState) {
        if saga_state.is_terminal() {
            if let Some(ttl) = self.config.completed_ttl {
                if let Ok(ttl) = chrono::Duration::from_std(ttl) {
                    state.expirations.insert(saga_id, Utc::now() + ttl);
                }
            }
        }
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    #[tracing::instrument(skip(self, saga), fields(saga.id = %saga.id, saga.name = %saga.name))]
    async fn create(&self, saga: Saga) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.sagas.contains_key(&saga.id) {
            return Err(StoreError::Conflict(format!("saga {} already exists", saga.id)));
        }
        let key = (saga.created_at, saga.id);
        state.state_index.entry(saga.state).or_default().insert(key);
        state.index_tasks(&saga);
        state.sagas.insert(saga.id, saga);
        Ok(())
    }

    async fn get(&self, saga_id: Uuid) -> Result<Option<Saga>, StoreError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.sagas.get(&saga_id).cloned())
    }

    async fn update_state(
        &self,
        saga_id: Uuid,
        new_state: SagaState,
        failure_reason: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let saga = state
            .sagas
            .get_mut(&saga_id)
            .ok_or_else(|| StoreError::NotFound(format!("saga {}", saga_id)))?;
        let old = saga.transition(new_state, failure_reason);
        let snapshot = saga.clone();
        state.move_state_index(&snapshot, old, new_state);
        self.apply_ttl(&mut state, saga_id, new_state);
        Ok(())
    }

    async fn update_step_state(
        &self,
        saga_id: Uuid,
        step_id: Uuid,
        new_state: SagaStepState,
        update: StepUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let saga = state
            .sagas
            .get_mut(&saga_id)
            .ok_or_else(|| StoreError::NotFound(format!("saga {}", saga_id)))?;
        let (old, new) = saga
            .apply_step_update(step_id, new_state, update)
            .map_err(|e| StoreError::NotFound(e.to_string()))?;
        let snapshot = saga.clone();
        state.index_tasks(&snapshot);
        state.move_state_index(&snapshot, old, new);
        self.apply_ttl(&mut state, saga_id, new);
        Ok(())
    }

    async fn advance_step(&self, saga_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let saga = state
            .sagas
            .get_mut(&saga_id)
            .ok_or_else(|| StoreError::NotFound(format!("saga {}", saga_id)))?;
        let (old, new) = saga.advance_step();
        let snapshot = saga.clone();
        state.move_state_index(&snapshot, old, new);
        self.apply_ttl(&mut state, saga_id, new);
        Ok(())
    }

    async fn mark_step_compensated(
        &self,
        saga_id: Uuid,
        step_id: Uuid,
        success: bool,
        compensate_task_id: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let saga = state
            .sagas
            .get_mut(&saga_id)
            .ok_or_else(|| StoreError::NotFound(format!("saga {}", saga_id)))?;
        let (old, new) = saga
            .apply_compensation(step_id, success, compensate_task_id, error)
            .map_err(|e| StoreError::NotFound(e.to_string()))?;
        let snapshot = saga.clone();
        state.index_tasks(&snapshot);
        state.move_state_index(&snapshot, old, new);
        self.apply_ttl(&mut state, saga_id, new);
        Ok(())
    }

    async fn delete(&self, saga_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.remove_saga(saga_id);
        Ok(())
    }

    async fn get_saga_id_for_task(&self, task_id: &str) -> Result<Option<Uuid>, StoreError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.task_index.get(task_id).copied())
    }

    async fn get_by_state(
        &self,
        saga_state: SagaState,
        limit: usize,
    ) -> Result<Vec<Saga>, StoreError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        let ids: Vec<Uuid> = state
            .state_index
            .get(&saga_state)
            .map(|set| set.iter().take(limit).map(|(_, id)| *id).collect())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.sagas.get(&id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::models::saga::SagaStep;
    use std::time::Duration;

    fn config() -> SagaStoreConfig {
        SagaStoreConfig {
            completed_ttl: None,
            ..Default::default()
        }
    }

    fn three_step_saga() -> Saga {
        Saga::new(
            "order",
            vec![
                SagaStep::new("reserve", 0, "stock.reserve").with_compensation("stock.release"),
                SagaStep::new("charge", 1, "payment.charge").with_compensation("payment.refund"),
                SagaStep::new("ship", 2, "shipping.dispatch"),
            ],
        )
    }

    #[tokio::test]
    async fn step_failure_auto_transitions_to_compensating() {
        let store = InMemorySagaStore::new(config());
        let saga = three_step_saga();
        let saga_id = saga.id;
        let step_ids: Vec<Uuid> = saga.steps.iter().map(|s| s.id).collect();
        store.create(saga).await.unwrap();

        store
            .update_step_state(saga_id, step_ids[0], SagaStepState::Completed, StepUpdate::default())
            .await
            .unwrap();
        store
            .update_step_state(saga_id, step_ids[1], SagaStepState::Completed, StepUpdate::default())
            .await
            .unwrap();
        store
            .update_step_state(
                saga_id,
                step_ids[2],
                SagaStepState::Failed,
                StepUpdate {
                    error: Some("x".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let saga = store.get(saga_id).await.unwrap().unwrap();
        assert_eq!(saga.state, SagaState::Compensating);
        assert_eq!(saga.failure_reason.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn advance_through_all_steps_completes() {
        let store = InMemorySagaStore::new(config());
        let saga = three_step_saga();
        let saga_id = saga.id;
        store.create(saga).await.unwrap();

        for _ in 0..3 {
            store.advance_step(saga_id).await.unwrap();
        }
        let saga = store.get(saga_id).await.unwrap().unwrap();
        assert_eq!(saga.state, SagaState::Completed);
        assert!(saga.completed_at.is_some());

        let completed = store.get_by_state(SagaState::Completed, 10).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert!(store
            .get_by_state(SagaState::Created, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn task_index_resolves_saga() {
        let store = InMemorySagaStore::new(config());
        let saga = three_step_saga();
        let saga_id = saga.id;
        let first_step = saga.steps[0].id;
        store.create(saga).await.unwrap();

        store
            .update_step_state(
                saga_id,
                first_step,
                SagaStepState::Executing,
                StepUpdate {
                    execute_task_id: Some("T-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            store.get_saga_id_for_task("T-1").await.unwrap(),
            Some(saga_id)
        );
        assert_eq!(store.get_saga_id_for_task("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn terminal_ttl_expires_sagas() {
        let store = InMemorySagaStore::new(SagaStoreConfig {
            completed_ttl: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let saga = three_step_saga();
        let saga_id = saga.id;
        store.create(saga).await.unwrap();
        store
            .update_state(saga_id, SagaState::Cancelled, None)
            .await
            .unwrap();

        assert!(store.get(saga_id).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get(saga_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let store = InMemorySagaStore::new(config());
        let saga = three_step_saga();
        let saga_id = saga.id;
        let first_step = saga.steps[0].id;
        store.create(saga).await.unwrap();
        store
            .update_step_state(
                saga_id,
                first_step,
                SagaStepState::Executing,
                StepUpdate {
                    execute_task_id: Some("T-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.delete(saga_id).await.unwrap();
        assert!(store.get(saga_id).await.unwrap().is_none());
        assert_eq!(store.get_saga_id_for_task("T-1").await.unwrap(), None);
        assert!(store
            .get_by_state(SagaState::Executing, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn get_by_state_orders_by_creation_time() {
        let store = InMemorySagaStore::new(config());
        let first = three_step_saga();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = three_step_saga();
        let (first_id, second_id) = (first.id, second.id);
        store.create(first).await.unwrap();
        store.create(second).await.unwrap();

        let created = store.get_by_state(SagaState::Created, 10).await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].id, first_id);
        assert_eq!(created[1].id, second_id);

        let limited = store.get_by_state(SagaState::Created, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, first_id);
    }
}
