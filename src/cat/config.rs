use serde::{Deserialize, Serialize};

use crate::cat::types::{DEFAULT_ELO_RATING, THETA_MAX, THETA_MIN};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub theta_min: f64,
    pub theta_max: f64,
    pub initial_theta: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub fallback_theta: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            theta_min: THETA_MIN,
            theta_max: THETA_MAX,
            initial_theta: 0.0,
            max_iterations: 100,
            tolerance: 1e-8,
            fallback_theta: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EloConfig {
    pub default_rating: f64,
    pub k_factor: f64,
    pub num_choices: u32,
    pub time_k_factor: f64,
    pub correctness_weight: f64,
    pub time_weight: f64,
    pub reference_time_secs: f64,
    pub min_time_secs: f64,
}

impl Default for EloConfig {
    fn default() -> Self {
        Self {
            default_rating: DEFAULT_ELO_RATING,
            k_factor: 32.0,
            num_choices: 4,
            time_k_factor: 32.0,
            correctness_weight: 0.7,
            time_weight: 0.3,
            reference_time_secs: 30.0,
            min_time_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub category_slots: usize,
    pub hidden_layers: Vec<usize>,
    pub learning_rate: f64,
    pub gamma: f64,
    pub epsilon: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    pub replay_capacity: usize,
    pub batch_size: usize,
    pub max_grad_norm: f64,
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            category_slots: 8,
            hidden_layers: vec![24, 24],
            learning_rate: 0.001,
            gamma: 0.95,
            epsilon: 1.0,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            replay_capacity: 2000,
            batch_size: 32,
            max_grad_norm: 5.0,
            seed: None,
        }
    }
}

impl AgentConfig {
    /// Length of every state vector the agent scores.
    pub fn state_dim(&self) -> usize {
        2 * self.category_slots.max(1) + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Smallest denominator in the `1 / (ability + 1)` weight. Abilities at
    /// or below `min_denominator - 1` all get the maximum weight
    /// `1 / min_denominator`.
    pub min_denominator: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self { min_denominator: 0.1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizConfig {
    /// Fill shortfalls from other categories' remaining pools.
    pub backfill: bool,
    /// Return a short quiz instead of failing when pools run dry.
    pub allow_partial: bool,
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            backfill: true,
            allow_partial: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub every_steps: u64,
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_steps: 1,
            interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatConfig {
    pub estimator: EstimatorConfig,
    pub elo: EloConfig,
    pub agent: AgentConfig,
    pub allocation: AllocationConfig,
    pub quiz: QuizConfig,
    pub checkpoint: CheckpointConfig,
}

impl CatConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CAT_ESTIMATOR_MAX_ITERATIONS") {
            config.estimator.max_iterations = val.parse().unwrap_or(config.estimator.max_iterations);
        }
        if let Ok(val) = std::env::var("CAT_ELO_K_FACTOR") {
            config.elo.k_factor = val.parse().unwrap_or(config.elo.k_factor);
        }
        if let Ok(val) = std::env::var("CAT_ELO_NUM_CHOICES") {
            config.elo.num_choices = val.parse().unwrap_or(config.elo.num_choices);
        }
        if let Ok(val) = std::env::var("CAT_ELO_TIME_K_FACTOR") {
            config.elo.time_k_factor = val.parse().unwrap_or(config.elo.time_k_factor);
        }
        if let Ok(val) = std::env::var("CAT_ELO_REFERENCE_TIME_SECS") {
            config.elo.reference_time_secs = val.parse().unwrap_or(config.elo.reference_time_secs);
        }
        if let Ok(val) = std::env::var("CAT_AGENT_CATEGORY_SLOTS") {
            config.agent.category_slots = val.parse().unwrap_or(config.agent.category_slots).max(1);
        }
        if let Ok(val) = std::env::var("CAT_AGENT_EPSILON") {
            config.agent.epsilon = val.parse().unwrap_or(config.agent.epsilon);
        }
        if let Ok(val) = std::env::var("CAT_AGENT_EPSILON_DECAY") {
            config.agent.epsilon_decay = val.parse().unwrap_or(config.agent.epsilon_decay);
        }
        if let Ok(val) = std::env::var("CAT_AGENT_REPLAY_CAPACITY") {
            config.agent.replay_capacity = val.parse().unwrap_or(config.agent.replay_capacity);
        }
        if let Ok(val) = std::env::var("CAT_AGENT_BATCH_SIZE") {
            config.agent.batch_size = val.parse().unwrap_or(config.agent.batch_size);
        }
        if let Ok(val) = std::env::var("CAT_AGENT_SEED") {
            config.agent.seed = val.parse().ok();
        }
        if let Ok(val) = std::env::var("CAT_ALLOCATION_MIN_DENOMINATOR") {
            let parsed: f64 = val.parse().unwrap_or(config.allocation.min_denominator);
            if parsed.is_finite() && parsed > 0.0 {
                config.allocation.min_denominator = parsed;
            }
        }
        if let Ok(val) = std::env::var("CAT_QUIZ_BACKFILL") {
            config.quiz.backfill = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("CAT_QUIZ_ALLOW_PARTIAL") {
            config.quiz.allow_partial = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("CAT_CHECKPOINT_EVERY_STEPS") {
            config.checkpoint.every_steps = val.parse().unwrap_or(config.checkpoint.every_steps);
        }
        if let Ok(val) = std::env::var("CAT_CHECKPOINT_INTERVAL_SECS") {
            config.checkpoint.interval_secs = val.parse().unwrap_or(config.checkpoint.interval_secs);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_dim_follows_slots() {
        let config = AgentConfig {
            category_slots: 3,
            ..Default::default()
        };
        assert_eq!(config.state_dim(), 7);
    }

    #[test]
    fn test_zero_slots_still_encodes_one() {
        let config = AgentConfig {
            category_slots: 0,
            ..Default::default()
        };
        assert_eq!(config.state_dim(), 3);
    }

    #[test]
    fn test_env_slots_clamped() {
        std::env::set_var("CAT_AGENT_CATEGORY_SLOTS", "0");
        let config = CatConfig::from_env();
        std::env::remove_var("CAT_AGENT_CATEGORY_SLOTS");
        assert_eq!(config.agent.category_slots, 1);
    }

    #[test]
    fn test_defaults_are_consistent() {
        let config = CatConfig::default();
        assert!((config.elo.correctness_weight + config.elo.time_weight - 1.0).abs() < 1e-12);
        assert!(config.estimator.theta_min < config.estimator.theta_max);
        assert!(config.agent.epsilon_min <= config.agent.epsilon);
    }
}
