use crate::cat::persistence::StoreError;
use crate::cat::types::CategoryId;

#[derive(Debug, thiserror::Error)]
pub enum CatError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("optimizer did not converge within {iterations} iterations")]
    ConvergenceFailure { iterations: usize },
    #[error("item pool exhausted for category {category_id:?}: requested {requested}, selected {selected}")]
    PoolExhausted {
        category_id: Option<CategoryId>,
        requested: usize,
        selected: usize,
    },
    #[error("training step rejected: {0}")]
    TrainingRejected(String),
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl CatError {
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, CatError::PoolExhausted { .. })
    }
}
