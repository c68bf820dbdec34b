use serde::{Deserialize, Serialize};

use crate::cat::config::EloConfig;
use crate::cat::types::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EloRule {
    Classic,
    TimeWeighted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EloUpdate {
    pub new_rating: f64,
    pub delta: f64,
    pub expected: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EloRater {
    config: EloConfig,
}

impl EloRater {
    pub fn new(config: EloConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EloConfig {
        &self.config
    }

    pub fn default_rating(&self) -> f64 {
        self.config.default_rating
    }

    /// Chance-corrected expected score: a learner who knows nothing still
    /// guesses right `1 / num_choices` of the time.
    pub fn expected_score(&self, rating: f64, item_rating: f64) -> f64 {
        let floor = self.guess_floor();
        let logistic = 1.0 / (1.0 + 10f64.powf((item_rating - rating) / 400.0));
        floor + (1.0 - floor) * logistic
    }

    pub fn update(&self, rating: f64, item_rating: f64, correct: bool) -> EloUpdate {
        let expected = self.expected_score(rating, item_rating);
        let actual = if correct { 1.0 } else { 0.0 };
        let delta = self.config.k_factor * (actual - expected);
        EloUpdate {
            new_rating: rating + delta,
            delta,
            expected,
        }
    }

    pub fn update_timed(
        &self,
        rating: f64,
        item_rating: f64,
        correct: bool,
        time_spent_secs: f64,
    ) -> EloUpdate {
        let expected = self.expected_score(rating, item_rating);
        let actual = if correct { 1.0 } else { 0.0 };
        let correctness_score = actual - expected;
        let time_score = correctness_score * (1.0 + self.speed(time_spent_secs)) / 2.0;
        let delta = self.config.time_k_factor
            * (self.config.correctness_weight * correctness_score
                + self.config.time_weight * time_score);
        EloUpdate {
            new_rating: rating + delta,
            delta,
            expected,
        }
    }

    pub fn apply(&self, rule: EloRule, rating: f64, response: &Response) -> EloUpdate {
        match rule {
            EloRule::Classic => self.update(rating, response.elo_difficulty, response.correct),
            EloRule::TimeWeighted => self.update_timed(
                rating,
                response.elo_difficulty,
                response.correct,
                response.time_spent,
            ),
        }
    }

    /// Fold responses into a rating one at a time, in the order given.
    pub fn apply_sequence<'a, I>(&self, rule: EloRule, start: f64, responses: I) -> f64
    where
        I: IntoIterator<Item = &'a Response>,
    {
        responses
            .into_iter()
            .fold(start, |rating, response| self.apply(rule, rating, response).new_rating)
    }

    /// Log-time surprise in (-1, 1): positive when faster than the reference.
    fn speed(&self, time_spent_secs: f64) -> f64 {
        let reference = self.config.reference_time_secs.max(self.config.min_time_secs);
        let actual = if time_spent_secs.is_finite() {
            time_spent_secs.max(self.config.min_time_secs)
        } else {
            reference
        };
        (reference.ln() - actual.ln()).tanh()
    }

    fn guess_floor(&self) -> f64 {
        if self.config.num_choices == 0 {
            0.0
        } else {
            1.0 / self.config.num_choices as f64
        }
    }
}
