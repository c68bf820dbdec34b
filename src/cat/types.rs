use serde::{Deserialize, Serialize};

use crate::cat::error::CatError;

pub type ItemId = i64;
pub type CategoryId = i64;

/// Rating every new (learner, category) pair starts from.
pub const DEFAULT_ELO_RATING: f64 = 1500.0;
/// Theta every new (learner, category) pair starts from.
pub const DEFAULT_THETA: f64 = 0.0;

pub const THETA_MIN: f64 = -3.0;
pub const THETA_MAX: f64 = 3.0;

/// 3PL item parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemParams {
    /// Discrimination (a), must be positive.
    pub a: f64,
    /// Difficulty (b) on the theta scale.
    pub b: f64,
    /// Guessing floor (c) in [0, 1).
    pub c: f64,
}

impl ItemParams {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    pub fn validate(&self) -> Result<(), CatError> {
        if !self.a.is_finite() || !self.b.is_finite() || !self.c.is_finite() {
            return Err(CatError::InvalidInput(format!(
                "non-finite item parameters a={} b={} c={}",
                self.a, self.b, self.c
            )));
        }
        if self.a <= 0.0 {
            return Err(CatError::InvalidInput(format!(
                "discrimination must be positive, got {}",
                self.a
            )));
        }
        if !(0.0..1.0).contains(&self.c) {
            return Err(CatError::InvalidInput(format!(
                "guessing must lie in [0, 1), got {}",
                self.c
            )));
        }
        Ok(())
    }
}

impl Default for ItemParams {
    fn default() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub category_id: CategoryId,
    pub params: ItemParams,
    /// Difficulty on the rating scale (roughly 1000..2000).
    pub elo_difficulty: f64,
}

impl Item {
    pub fn difficulty(&self) -> f64 {
        self.params.b
    }
}

/// A graded attempt. Immutable once recorded; callers hand them over in
/// recorded order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub item_id: ItemId,
    pub category_id: CategoryId,
    pub params: ItemParams,
    pub elo_difficulty: f64,
    pub correct: bool,
    /// Seconds spent answering, never negative.
    pub time_spent: f64,
    pub answered_at: i64,
}

impl Response {
    pub fn for_item(item: &Item, correct: bool, time_spent: f64) -> Self {
        Self {
            item_id: item.id,
            category_id: item.category_id,
            params: item.params,
            elo_difficulty: item.elo_difficulty,
            correct,
            time_spent: time_spent.max(0.0),
            answered_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Reject responses whose parameters would poison a stored rating.
    pub fn validate(&self) -> Result<(), CatError> {
        self.params.validate()?;
        if !self.elo_difficulty.is_finite() {
            return Err(CatError::InvalidInput(format!(
                "item {} has non-finite rating difficulty {}",
                self.item_id, self.elo_difficulty
            )));
        }
        if !self.time_spent.is_finite() || self.time_spent < 0.0 {
            return Err(CatError::InvalidInput(format!(
                "item {} has invalid time spent {}",
                self.item_id, self.time_spent
            )));
        }
        Ok(())
    }

    pub fn actual(&self) -> f64 {
        if self.correct {
            1.0
        } else {
            0.0
        }
    }
}

/// One row per (learner, category). `irt_theta` and `elo_rating` are
/// independent signals and are never reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityEstimate {
    pub learner_id: String,
    pub category_id: CategoryId,
    pub irt_theta: f64,
    pub elo_rating: f64,
    #[serde(default)]
    pub elo_time_rating: Option<f64>,
    pub updated_at: i64,
}

impl AbilityEstimate {
    pub fn new(learner_id: &str, category_id: CategoryId) -> Self {
        Self {
            learner_id: learner_id.to_string(),
            category_id,
            irt_theta: DEFAULT_THETA,
            elo_rating: DEFAULT_ELO_RATING,
            elo_time_rating: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
