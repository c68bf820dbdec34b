//! Item selection agent.
//!
//! A value-based agent that scores candidate items from a fixed-length state
//! vector and picks one with an epsilon-greedy policy:
//! - with probability `epsilon` it draws from a supplied probability
//!   distribution over the candidates (exploration)
//! - otherwise it takes the argmax of the learned value plus a closeness
//!   heuristic `-|difficulty - ability|` (exploitation)
//!
//! State layout, for `S` category slots:
//! `[ability_1 .. ability_S, item_difficulty, one_hot_category_1 .. one_hot_category_S]`
//! with abilities and difficulty on the theta scale divided by `THETA_MAX`
//! and clamped to [-1, 1].
//!
//! Parameters, the current state vector, the replay buffer, epsilon and the
//! category slot assignment make up the persisted [`AgentSnapshot`].

use std::collections::{BTreeMap, HashSet};

use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::cat::config::AgentConfig;
use crate::cat::decision::network::ValueNetwork;
use crate::cat::decision::replay::{Experience, ReplayBuffer};
use crate::cat::error::CatError;
use crate::cat::metrics::{registry, AlgorithmId};
use crate::cat::types::{CategoryId, Item, ItemId, THETA_MAX};
use crate::track_algorithm;

/// Only schema version of [`AgentSnapshot`] this build reads or writes.
pub const AGENT_STATE_VERSION: u32 = 1;

// ==================== Data Structures ====================

/// How candidate scores are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Single-item selection: learned value plus closeness heuristic.
    Combined,
    /// Batch ranking: softmax of learned values weighted by the supplied
    /// exploration distribution.
    Batch,
}

/// Outcome of one selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub item_id: ItemId,
    /// Index into the candidate slice.
    pub index: usize,
    /// Whether the pick came from the exploration branch.
    pub explored: bool,
    pub score: f64,
}

/// Outcome of one applied training step.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub loss: f64,
    pub grad_norm: f64,
    pub batch_size: usize,
    pub epsilon: f64,
    pub train_steps: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("agent state version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("agent state dimension {found} does not match configured {expected}")]
    DimensionMismatch { found: usize, expected: usize },
    #[error("malformed agent state: {0}")]
    Malformed(String),
}

/// Serializable agent state for checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub version: u32,
    pub params: ValueNetwork,
    pub state_vector: Vec<f64>,
    /// Oldest first.
    pub replay_buffer: Vec<Experience>,
    pub epsilon: f64,
    pub train_steps: u64,
    pub category_slots: Vec<CategoryId>,
    pub saved_at: i64,
}

// ==================== Main Implementation ====================

pub struct ItemSelectionAgent {
    config: AgentConfig,
    network: ValueNetwork,
    state_vector: Vec<f64>,
    replay: ReplayBuffer,
    epsilon: f64,
    train_steps: u64,
    /// Category assigned to each slot, in first-seen order.
    slots: Vec<CategoryId>,
    rng: ChaCha8Rng,
}

impl ItemSelectionAgent {
    /// Fresh agent with randomly initialized parameters.
    pub fn new(config: AgentConfig) -> Self {
        let seed = config.seed.unwrap_or_else(|| {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(42)
        });
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let network = ValueNetwork::new(
            config.state_dim(),
            &config.hidden_layers,
            config.learning_rate,
            &mut rng,
        );
        Self {
            state_vector: vec![0.0; config.state_dim()],
            replay: ReplayBuffer::new(config.replay_capacity),
            epsilon: config.epsilon,
            train_steps: 0,
            slots: Vec::new(),
            network,
            rng,
            config,
        }
    }

    /// Create an agent with a fixed seed (for testing)
    pub fn with_seed(config: AgentConfig, seed: u64) -> Self {
        Self::new(AgentConfig {
            seed: Some(seed),
            ..config
        })
    }

    /// Resume from a checkpoint. The snapshot must match the configured
    /// schema version and state dimension exactly.
    pub fn from_snapshot(config: AgentConfig, snapshot: AgentSnapshot) -> Result<Self, SnapshotError> {
        if snapshot.version != AGENT_STATE_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: snapshot.version,
                expected: AGENT_STATE_VERSION,
            });
        }
        let dim = config.state_dim();
        if snapshot.params.input_dim() != dim {
            return Err(SnapshotError::DimensionMismatch {
                found: snapshot.params.input_dim(),
                expected: dim,
            });
        }
        if snapshot.state_vector.len() != dim {
            return Err(SnapshotError::DimensionMismatch {
                found: snapshot.state_vector.len(),
                expected: dim,
            });
        }
        if !snapshot.params.is_well_formed() {
            return Err(SnapshotError::Malformed("network parameters".to_string()));
        }
        if snapshot.params.hidden_widths() != config.hidden_layers {
            return Err(SnapshotError::Malformed(format!(
                "hidden layers {:?} differ from configured {:?}",
                snapshot.params.hidden_widths(),
                config.hidden_layers
            )));
        }
        if let Some(bad) = snapshot
            .replay_buffer
            .iter()
            .find(|e| e.state.len() != dim || e.next_state.len() != dim)
        {
            return Err(SnapshotError::DimensionMismatch {
                found: bad.state.len(),
                expected: dim,
            });
        }
        if snapshot.category_slots.len() > config.category_slots.max(1) {
            return Err(SnapshotError::Malformed(format!(
                "{} category slots assigned, {} configured",
                snapshot.category_slots.len(),
                config.category_slots
            )));
        }
        if !snapshot.epsilon.is_finite() {
            return Err(SnapshotError::Malformed("epsilon".to_string()));
        }

        let mut agent = Self::new(config);
        let mut network = snapshot.params;
        network.set_learning_rate(agent.config.learning_rate);
        agent.network = network;
        agent.state_vector = snapshot.state_vector;
        agent.replay = ReplayBuffer::from_entries(agent.config.replay_capacity, snapshot.replay_buffer);
        agent.epsilon = snapshot.epsilon.clamp(agent.config.epsilon_min, 1.0);
        agent.train_steps = snapshot.train_steps;
        agent.slots = snapshot.category_slots;
        Ok(agent)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            version: AGENT_STATE_VERSION,
            params: self.network.clone(),
            state_vector: self.state_vector.clone(),
            replay_buffer: self.replay.to_vec(),
            epsilon: self.epsilon,
            train_steps: self.train_steps,
            category_slots: self.slots.clone(),
            saved_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn set_epsilon(&mut self, epsilon: f64) {
        self.epsilon = epsilon.clamp(0.0, 1.0);
    }

    pub fn train_steps(&self) -> u64 {
        self.train_steps
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    pub fn state_vector(&self) -> &[f64] {
        &self.state_vector
    }

    pub fn set_state_vector(&mut self, state: Vec<f64>) -> Result<(), CatError> {
        self.check_dim(&state)?;
        self.state_vector = state;
        Ok(())
    }

    // ==================== State Encoding ====================

    /// Slot index for a category, assigning a free slot on first sight.
    pub fn slot_for(&mut self, category_id: CategoryId) -> usize {
        if let Some(pos) = self.slots.iter().position(|c| *c == category_id) {
            return pos;
        }
        let capacity = self.config.category_slots.max(1);
        if self.slots.len() < capacity {
            self.slots.push(category_id);
            return self.slots.len() - 1;
        }
        category_id.rem_euclid(capacity as i64) as usize
    }

    pub fn encode_state(
        &mut self,
        abilities: &BTreeMap<CategoryId, f64>,
        difficulty: f64,
        category_id: CategoryId,
    ) -> Vec<f64> {
        let slots = self.config.category_slots.max(1);
        let mut state = vec![0.0; self.config.state_dim()];
        for (category, ability) in abilities {
            let slot = self.slot_for(*category);
            state[slot] = scale(*ability);
        }
        state[slots] = scale(difficulty);
        let slot = self.slot_for(category_id);
        state[slots + 1 + slot] = 1.0;
        state
    }

    pub fn value(&self, state: &[f64]) -> f64 {
        self.network.predict(state)
    }

    /// Default exploration distribution: `exp(-|difficulty - ability|)`,
    /// normalized to sum to one.
    pub fn exploration_weights(candidates: &[Item], ability: f64) -> Vec<f64> {
        let raw: Vec<f64> = candidates
            .iter()
            .map(|item| (-(item.difficulty() - ability).abs()).exp())
            .collect();
        let total: f64 = raw.iter().sum();
        if total > 0.0 && total.is_finite() {
            raw.into_iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / candidates.len().max(1) as f64; candidates.len()]
        }
    }

    // ==================== Scoring ====================

    pub fn score_candidates(
        &mut self,
        candidates: &[Item],
        weights: &[f64],
        ability: f64,
        abilities: &BTreeMap<CategoryId, f64>,
        mode: ScoringMode,
    ) -> Vec<f64> {
        let learned: Vec<f64> = candidates
            .iter()
            .map(|item| {
                let state = self.encode_state(abilities, item.difficulty(), item.category_id);
                self.value(&state)
            })
            .collect();

        match mode {
            ScoringMode::Combined => learned
                .iter()
                .zip(candidates)
                .map(|(v, item)| v - (item.difficulty() - ability).abs())
                .collect(),
            ScoringMode::Batch => {
                let max = learned.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let exp: Vec<f64> = learned.iter().map(|v| (v - max).exp()).collect();
                let sum: f64 = exp.iter().sum();
                exp.iter()
                    .zip(weights)
                    .map(|(e, w)| if sum > 0.0 { e / sum * w } else { 0.0 })
                    .collect()
            }
        }
    }

    /// Rank all candidates in batch mode, best first.
    pub fn rank_batch(
        &mut self,
        candidates: &[Item],
        weights: &[f64],
        ability: f64,
        abilities: &BTreeMap<CategoryId, f64>,
    ) -> Result<Vec<(ItemId, f64)>, CatError> {
        validate_weights(candidates.len(), weights)?;
        let scores = self.score_candidates(candidates, weights, ability, abilities, ScoringMode::Batch);
        let mut ranked: Vec<(ItemId, f64)> = candidates
            .iter()
            .map(|item| item.id)
            .zip(scores)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(ranked)
    }

    // ==================== Selection ====================

    /// Pick one item not in `exclude`, exploring over
    /// [`exploration_weights`](Self::exploration_weights).
    pub fn select(
        &mut self,
        candidates: &[Item],
        ability: f64,
        abilities: &BTreeMap<CategoryId, f64>,
        exclude: &HashSet<ItemId>,
    ) -> Result<Selection, CatError> {
        let weights = Self::exploration_weights(candidates, ability);
        self.select_weighted(candidates, &weights, ability, abilities, exclude)
    }

    /// Pick one item not in `exclude`. `weights` is the exploration
    /// distribution, aligned with `candidates`.
    ///
    /// Returns `PoolExhausted` when every candidate is excluded.
    pub fn select_weighted(
        &mut self,
        candidates: &[Item],
        weights: &[f64],
        ability: f64,
        abilities: &BTreeMap<CategoryId, f64>,
        exclude: &HashSet<ItemId>,
    ) -> Result<Selection, CatError> {
        validate_weights(candidates.len(), weights)?;
        track_algorithm!(
            AlgorithmId::ItemSelection,
            self.select_inner(candidates, weights, ability, abilities, exclude)
        )
    }

    fn select_inner(
        &mut self,
        candidates: &[Item],
        weights: &[f64],
        ability: f64,
        abilities: &BTreeMap<CategoryId, f64>,
        exclude: &HashSet<ItemId>,
    ) -> Result<Selection, CatError> {
        let available: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, item)| !exclude.contains(&item.id))
            .map(|(i, _)| i)
            .collect();
        if available.is_empty() {
            return Err(CatError::PoolExhausted {
                category_id: candidates.first().map(|item| item.category_id),
                requested: 1,
                selected: 0,
            });
        }

        if self.rng.gen::<f64>() < self.epsilon {
            let available_weights: Vec<f64> = available.iter().map(|&i| weights[i]).collect();
            let pick = match WeightedIndex::new(&available_weights) {
                Ok(dist) => dist.sample(&mut self.rng),
                // every remaining weight is zero: fall back to uniform
                Err(_) => self.rng.gen_range(0..available.len()),
            };
            let index = available[pick];
            return Ok(Selection {
                item_id: candidates[index].id,
                index,
                explored: true,
                score: weights[index],
            });
        }

        let subset: Vec<Item> = available.iter().map(|&i| candidates[i].clone()).collect();
        let subset_weights: Vec<f64> = available.iter().map(|&i| weights[i]).collect();
        let scores = self.score_candidates(&subset, &subset_weights, ability, abilities, ScoringMode::Combined);

        let mut best = 0;
        for (i, score) in scores.iter().enumerate() {
            if *score > scores[best] {
                best = i;
            }
        }
        let index = available[best];
        Ok(Selection {
            item_id: candidates[index].id,
            index,
            explored: false,
            score: scores[best],
        })
    }

    // ==================== Training ====================

    pub fn remember(&mut self, experience: Experience) -> Result<(), CatError> {
        self.check_experience(&experience)?;
        self.replay.push(experience);
        Ok(())
    }

    /// Store a whole batch, or none of it when any entry is invalid.
    pub fn remember_batch(&mut self, experiences: Vec<Experience>) -> Result<(), CatError> {
        for experience in &experiences {
            self.check_experience(experience)?;
        }
        for experience in experiences {
            self.replay.push(experience);
        }
        Ok(())
    }

    /// Run one mini-batch update once the buffer holds more than
    /// `batch_size` experiences. Either the new parameters and the epsilon
    /// decay are both applied, or nothing changes.
    pub fn train_step(&mut self) -> Result<Option<TrainReport>, CatError> {
        let batch_size = self.config.batch_size.max(1);
        if self.replay.len() <= batch_size {
            return Ok(None);
        }

        let result = track_algorithm!(AlgorithmId::AgentTraining, {
            let batch = self.replay.sample(&mut self.rng, batch_size);
            let samples: Vec<(Vec<f64>, f64)> = batch
                .iter()
                .map(|e| {
                    let target = if e.terminal {
                        e.reward
                    } else {
                        e.reward + self.config.gamma * self.network.predict(&e.next_state)
                    };
                    (e.state.clone(), target)
                })
                .collect();
            self.network
                .stepped(&samples, self.config.max_grad_norm)
                .map(|(network, report)| (network, report, samples.len()))
        });

        let (network, report, used) = match result {
            Ok(ok) => ok,
            Err(reason) => {
                registry().record_error(AlgorithmId::AgentTraining);
                tracing::warn!(reason = %reason, "agent training step rejected");
                return Err(CatError::TrainingRejected(reason));
            }
        };

        self.network = network;
        self.decay_epsilon();
        self.train_steps += 1;

        tracing::debug!(
            loss = report.loss,
            grad_norm = report.grad_norm,
            epsilon = self.epsilon,
            train_steps = self.train_steps,
            "agent training step applied"
        );

        Ok(Some(TrainReport {
            loss: report.loss,
            grad_norm: report.grad_norm,
            batch_size: used,
            epsilon: self.epsilon,
            train_steps: self.train_steps,
        }))
    }

    fn decay_epsilon(&mut self) {
        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
    }

    fn check_experience(&self, experience: &Experience) -> Result<(), CatError> {
        self.check_dim(&experience.state)?;
        self.check_dim(&experience.next_state)?;
        if !experience.reward.is_finite() {
            return Err(CatError::InvalidInput(format!(
                "non-finite reward {}",
                experience.reward
            )));
        }
        Ok(())
    }

    fn check_dim(&self, state: &[f64]) -> Result<(), CatError> {
        let expected = self.config.state_dim();
        if state.len() != expected {
            return Err(CatError::InvalidInput(format!(
                "state vector has length {}, expected {expected}",
                state.len()
            )));
        }
        Ok(())
    }
}

fn scale(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value / THETA_MAX).clamp(-1.0, 1.0)
}

fn validate_weights(candidates: usize, weights: &[f64]) -> Result<(), CatError> {
    if weights.len() != candidates {
        return Err(CatError::InvalidInput(format!(
            "{} exploration weights for {candidates} candidates",
            weights.len()
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(CatError::InvalidInput(
            "exploration weights must be finite and non-negative".to_string(),
        ));
    }
    if candidates > 0 && weights.iter().sum::<f64>() <= 0.0 {
        return Err(CatError::InvalidInput(
            "exploration weights must have a positive sum".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cat::types::ItemParams;

    fn config() -> AgentConfig {
        AgentConfig {
            category_slots: 3,
            hidden_layers: vec![8, 8],
            learning_rate: 0.01,
            replay_capacity: 64,
            batch_size: 4,
            ..Default::default()
        }
    }

    fn items(category: CategoryId, difficulties: &[f64]) -> Vec<Item> {
        difficulties
            .iter()
            .enumerate()
            .map(|(i, b)| Item {
                id: category * 100 + i as i64,
                category_id: category,
                params: ItemParams::new(1.0, *b, 0.25),
                elo_difficulty: 1500.0 + b * 100.0,
            })
            .collect()
    }

    fn experience(agent: &mut ItemSelectionAgent, reward: f64) -> Experience {
        let abilities = BTreeMap::from([(1, 0.5)]);
        let state = agent.encode_state(&abilities, 0.2, 1);
        let next = agent.encode_state(&BTreeMap::from([(1, 0.6)]), 0.2, 1);
        Experience {
            state,
            reward,
            next_state: next,
            terminal: false,
        }
    }

    #[test]
    fn test_encode_state_layout() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 1);
        let abilities = BTreeMap::from([(10, 1.5), (20, -3.0)]);
        let state = agent.encode_state(&abilities, 6.0, 20);
        assert_eq!(state.len(), 7);
        assert_eq!(state[0], 0.5);
        assert_eq!(state[1], -1.0);
        assert_eq!(state[3], 1.0);
        assert_eq!(&state[4..], &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_slots_overflow_wraps() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 1);
        assert_eq!(agent.slot_for(7), 0);
        assert_eq!(agent.slot_for(8), 1);
        assert_eq!(agent.slot_for(9), 2);
        assert_eq!(agent.slot_for(7), 0);
        assert_eq!(agent.slot_for(11), 2);
    }

    #[test]
    fn test_exploration_weights_normalized() {
        let pool = items(1, &[-1.0, 0.0, 2.0]);
        let weights = ItemSelectionAgent::exploration_weights(&pool, 0.0);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(weights[1] > weights[0] && weights[0] > weights[2]);
    }

    #[test]
    fn test_greedy_takes_best_combined_score() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 3);
        agent.set_epsilon(0.0);
        let pool = items(1, &[-3.0, 0.1, 3.0]);
        let abilities = BTreeMap::from([(1, 0.0)]);
        let weights = ItemSelectionAgent::exploration_weights(&pool, 0.0);
        let scores = agent.score_candidates(&pool, &weights, 0.0, &abilities, ScoringMode::Combined);
        let selection = agent.select(&pool, 0.0, &abilities, &HashSet::new()).unwrap();
        assert!(!selection.explored);
        assert!(scores.iter().all(|s| *s <= selection.score));
        assert_eq!(selection.score, scores[selection.index]);
    }

    #[test]
    fn test_excluded_items_never_selected() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 4);
        let pool = items(1, &[0.0, 0.5, 1.0]);
        let exclude: HashSet<ItemId> = [pool[0].id, pool[1].id].into_iter().collect();
        for _ in 0..20 {
            let selection = agent.select(&pool, 0.0, &BTreeMap::new(), &exclude).unwrap();
            assert_eq!(selection.item_id, pool[2].id);
        }
    }

    #[test]
    fn test_exhausted_pool_reported() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 5);
        let pool = items(2, &[0.0]);
        let exclude: HashSet<ItemId> = [pool[0].id].into_iter().collect();
        let err = agent.select(&pool, 0.0, &BTreeMap::new(), &exclude).unwrap_err();
        assert!(err.is_pool_exhausted());
        let err = agent.select(&[], 0.0, &BTreeMap::new(), &HashSet::new()).unwrap_err();
        assert!(err.is_pool_exhausted());
    }

    #[test]
    fn test_full_exploration_follows_weights() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 6);
        agent.set_epsilon(1.0);
        let pool = items(1, &[0.0, 0.0, 0.0]);
        let weights = [0.6, 0.3, 0.1];
        let trials = 20_000;
        let mut counts = [0usize; 3];
        for _ in 0..trials {
            let s = agent
                .select_weighted(&pool, &weights, 0.0, &BTreeMap::new(), &HashSet::new())
                .unwrap();
            assert!(s.explored);
            counts[s.index] += 1;
        }
        for (count, weight) in counts.iter().zip(weights) {
            let freq = *count as f64 / trials as f64;
            assert!((freq - weight).abs() < 0.02, "freq {freq} vs weight {weight}");
        }
    }

    #[test]
    fn test_bad_weights_rejected() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 7);
        let pool = items(1, &[0.0, 1.0]);
        let empty = HashSet::new();
        let abilities = BTreeMap::new();
        assert!(agent.select_weighted(&pool, &[1.0], 0.0, &abilities, &empty).is_err());
        assert!(agent.select_weighted(&pool, &[1.0, -1.0], 0.0, &abilities, &empty).is_err());
        assert!(agent.select_weighted(&pool, &[0.0, 0.0], 0.0, &abilities, &empty).is_err());
    }

    #[test]
    fn test_rank_batch_orders_by_score() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 8);
        let pool = items(1, &[0.0, 0.5, 1.0]);
        let weights = ItemSelectionAgent::exploration_weights(&pool, 0.0);
        let ranked = agent.rank_batch(&pool, &weights, 0.0, &BTreeMap::new()).unwrap();
        assert_eq!(ranked.len(), 3);
        assert!(ranked.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_no_training_until_buffer_exceeds_batch() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 9);
        for _ in 0..4 {
            let e = experience(&mut agent, 0.3);
            agent.remember(e).unwrap();
        }
        assert!(agent.train_step().unwrap().is_none());
        assert_eq!(agent.epsilon(), 1.0);

        let e = experience(&mut agent, 0.3);
        agent.remember(e).unwrap();
        let report = agent.train_step().unwrap().unwrap();
        assert_eq!(report.batch_size, 4);
        assert_eq!(agent.train_steps(), 1);
    }

    #[test]
    fn test_epsilon_decay_schedule() {
        let cfg = AgentConfig {
            epsilon: 1.0,
            epsilon_min: 0.5,
            epsilon_decay: 0.9,
            ..config()
        };
        let mut agent = ItemSelectionAgent::with_seed(cfg.clone(), 10);
        for _ in 0..6 {
            let e = experience(&mut agent, -0.2);
            agent.remember(e).unwrap();
        }
        for n in 1..=10 {
            agent.train_step().unwrap().unwrap();
            let expected = (cfg.epsilon * cfg.epsilon_decay.powi(n)).max(cfg.epsilon_min);
            assert!((agent.epsilon() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_remember_rejects_wrong_dimension() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 11);
        let bad = Experience {
            state: vec![0.0; 3],
            reward: 0.0,
            next_state: vec![0.0; 3],
            terminal: false,
        };
        assert!(agent.remember(bad).is_err());
    }

    #[test]
    fn test_remember_batch_is_all_or_nothing() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 14);
        let good = experience(&mut agent, 0.4);
        let mut bad = experience(&mut agent, 0.0);
        bad.reward = f64::NAN;

        assert!(agent.remember_batch(vec![good.clone(), bad]).is_err());
        assert_eq!(agent.replay_len(), 0);

        agent.remember_batch(vec![good.clone(), good]).unwrap();
        assert_eq!(agent.replay_len(), 2);
    }

    #[test]
    fn test_zero_slots_encodes_single_slot() {
        let cfg = AgentConfig {
            category_slots: 0,
            ..config()
        };
        let mut agent = ItemSelectionAgent::with_seed(cfg, 15);
        let state = agent.encode_state(&BTreeMap::from([(4, 1.5), (9, -1.5)]), 0.0, 9);
        assert_eq!(state.len(), 3);
        assert_eq!(state[2], 1.0);

        let pool = items(9, &[0.0, 1.0]);
        let abilities = BTreeMap::from([(9, 0.5)]);
        assert!(agent.select(&pool, 0.5, &abilities, &HashSet::new()).is_ok());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut agent = ItemSelectionAgent::with_seed(config(), 12);
        for _ in 0..6 {
            let e = experience(&mut agent, 0.1);
            agent.remember(e).unwrap();
        }
        agent.train_step().unwrap();
        let snapshot = agent.snapshot();

        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: AgentSnapshot = serde_json::from_str(&json).unwrap();
        let restored = ItemSelectionAgent::from_snapshot(config(), decoded).unwrap();

        assert!((restored.epsilon() - agent.epsilon()).abs() < 1e-12);
        assert_eq!(restored.train_steps(), agent.train_steps());
        assert_eq!(restored.replay_len(), agent.replay_len());
        assert_eq!(restored.state_vector().len(), agent.state_vector().len());
        let state = vec![0.1; 7];
        assert!((restored.value(&state) - agent.value(&state)).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_rejects_other_shapes() {
        let agent = ItemSelectionAgent::with_seed(config(), 13);
        let mut snapshot = agent.snapshot();
        snapshot.version = 0;
        assert!(matches!(
            ItemSelectionAgent::from_snapshot(config(), snapshot),
            Err(SnapshotError::VersionMismatch { .. })
        ));

        let wider = AgentConfig {
            category_slots: 4,
            ..config()
        };
        assert!(matches!(
            ItemSelectionAgent::from_snapshot(wider, agent.snapshot()),
            Err(SnapshotError::DimensionMismatch { .. })
        ));
    }
}
