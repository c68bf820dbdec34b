//! Storage ports consumed by the controller.
//!
//! The engine never talks to a database directly; it goes through these
//! traits so the same controller runs against SQLite in production and an
//! in-memory store in tests.

use async_trait::async_trait;

use crate::cat::decision::AgentSnapshot;
use crate::cat::types::{AbilityEstimate, CategoryId, Item, Response};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Recorded responses for a learner, oldest first. `None` means every
/// category.
#[async_trait]
pub trait ResponseSource: Send + Sync {
    async fn get_responses(
        &self,
        learner_id: &str,
        category_id: Option<CategoryId>,
    ) -> Result<Vec<Response>, StoreError>;
}

#[async_trait]
pub trait ItemBank: Send + Sync {
    /// Items of the given categories, ordered by category then id. An empty
    /// slice returns the whole bank.
    async fn get_item_pool(&self, category_ids: &[CategoryId]) -> Result<Vec<Item>, StoreError>;
}

#[async_trait]
pub trait AbilityStore: Send + Sync {
    async fn load_ability(
        &self,
        learner_id: &str,
        category_id: CategoryId,
    ) -> Result<Option<AbilityEstimate>, StoreError>;

    /// Insert or replace the row keyed by (learner, category).
    async fn save_ability(&self, estimate: &AbilityEstimate) -> Result<(), StoreError>;

    async fn load_abilities(&self, learner_id: &str) -> Result<Vec<AbilityEstimate>, StoreError>;
}

#[async_trait]
pub trait AgentStateStore: Send + Sync {
    async fn load_agent_state(&self) -> Result<Option<AgentSnapshot>, StoreError>;

    /// Last write wins.
    async fn save_agent_state(&self, snapshot: &AgentSnapshot) -> Result<(), StoreError>;
}

pub trait CatStore: ResponseSource + ItemBank + AbilityStore + AgentStateStore {}

impl<T> CatStore for T where T: ResponseSource + ItemBank + AbilityStore + AgentStateStore {}
