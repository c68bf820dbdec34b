use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::cat::decision::AgentSnapshot;
use crate::cat::persistence::{AbilityStore, AgentStateStore, ItemBank, ResponseSource, StoreError};
use crate::cat::types::{AbilityEstimate, CategoryId, Item, ItemId, Response};

/// Process-local store for tests and embedding. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<(CategoryId, ItemId), Item>>,
    responses: RwLock<HashMap<String, Vec<Response>>>,
    abilities: RwLock<HashMap<(String, CategoryId), AbilityEstimate>>,
    agent: RwLock<Option<serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let store = Self::new();
        store.add_items(items);
        store
    }

    pub fn add_items(&self, items: impl IntoIterator<Item = Item>) {
        let mut guard = self.items.write();
        for item in items {
            guard.insert((item.category_id, item.id), item);
        }
    }

    /// Append a response to the learner's history.
    pub fn record_response(&self, learner_id: &str, response: Response) {
        self.responses
            .write()
            .entry(learner_id.to_string())
            .or_default()
            .push(response);
    }

    pub fn response_count(&self, learner_id: &str) -> usize {
        self.responses.read().get(learner_id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl ResponseSource for MemoryStore {
    async fn get_responses(
        &self,
        learner_id: &str,
        category_id: Option<CategoryId>,
    ) -> Result<Vec<Response>, StoreError> {
        let guard = self.responses.read();
        let history = guard.get(learner_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(history
            .iter()
            .filter(|r| category_id.map_or(true, |c| r.category_id == c))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ItemBank for MemoryStore {
    async fn get_item_pool(&self, category_ids: &[CategoryId]) -> Result<Vec<Item>, StoreError> {
        let guard = self.items.read();
        Ok(guard
            .values()
            .filter(|item| category_ids.is_empty() || category_ids.contains(&item.category_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AbilityStore for MemoryStore {
    async fn load_ability(
        &self,
        learner_id: &str,
        category_id: CategoryId,
    ) -> Result<Option<AbilityEstimate>, StoreError> {
        Ok(self
            .abilities
            .read()
            .get(&(learner_id.to_string(), category_id))
            .cloned())
    }

    async fn save_ability(&self, estimate: &AbilityEstimate) -> Result<(), StoreError> {
        self.abilities.write().insert(
            (estimate.learner_id.clone(), estimate.category_id),
            estimate.clone(),
        );
        Ok(())
    }

    async fn load_abilities(&self, learner_id: &str) -> Result<Vec<AbilityEstimate>, StoreError> {
        let mut rows: Vec<AbilityEstimate> = self
            .abilities
            .read()
            .values()
            .filter(|e| e.learner_id == learner_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.category_id);
        Ok(rows)
    }
}

#[async_trait]
impl AgentStateStore for MemoryStore {
    async fn load_agent_state(&self) -> Result<Option<AgentSnapshot>, StoreError> {
        let value = self.agent.read().clone();
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save_agent_state(&self, snapshot: &AgentSnapshot) -> Result<(), StoreError> {
        let value = serde_json::to_value(snapshot)?;
        *self.agent.write() = Some(value);
        Ok(())
    }
}
