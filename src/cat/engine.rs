use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::cat::config::CatConfig;
use crate::cat::decision::{allocate_categories, Experience, ItemSelectionAgent};
use crate::cat::error::CatError;
use crate::cat::metrics::AlgorithmId;
use crate::cat::modeling::{AbilityEstimator, EloRater, EloRule};
use crate::cat::persistence::CatStore;
use crate::cat::types::{AbilityEstimate, CategoryId, Item, ItemId, Response, THETA_MAX, THETA_MIN};
use crate::track_algorithm;

/// Items chosen for one quiz.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizPlan {
    pub item_ids: Vec<ItemId>,
    /// Per-category quota before backfill.
    pub allocation: BTreeMap<CategoryId, usize>,
    /// Per-category quota the pool could not fill.
    pub shortfalls: BTreeMap<CategoryId, usize>,
}

impl QuizPlan {
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

type AbilityLocks = HashMap<(String, CategoryId), Arc<tokio::sync::Mutex<()>>>;

/// Held row locks. Dropping releases them and removes table entries no
/// other task is holding or waiting on.
struct RowGuards<'a> {
    table: &'a Mutex<AbilityLocks>,
    keys: Vec<(String, CategoryId)>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for RowGuards<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        let mut locks = self.table.lock();
        for key in &self.keys {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }
}

/// Orchestrates estimation, rating, selection and training for all learners.
///
/// Built once at start-up and shared by `Arc`. The agent is process-wide
/// state guarded by a synchronous mutex that is never held across an
/// `.await`; ability rows are serialized per (learner, category).
pub struct AdaptiveTestingController {
    config: CatConfig,
    store: Arc<dyn CatStore>,
    estimator: AbilityEstimator,
    elo: EloRater,
    agent: Arc<Mutex<ItemSelectionAgent>>,
    ability_locks: Mutex<AbilityLocks>,
}

impl AdaptiveTestingController {
    /// Controller with a freshly initialized agent.
    pub fn new(config: CatConfig, store: Arc<dyn CatStore>) -> Self {
        let agent = ItemSelectionAgent::new(config.agent.clone());
        Self::with_agent(config, store, agent)
    }

    pub fn with_agent(config: CatConfig, store: Arc<dyn CatStore>, agent: ItemSelectionAgent) -> Self {
        Self {
            estimator: AbilityEstimator::new(config.estimator.clone()),
            elo: EloRater::new(config.elo.clone()),
            agent: Arc::new(Mutex::new(agent)),
            ability_locks: Mutex::new(HashMap::new()),
            config,
            store,
        }
    }

    /// Resume the agent from the stored checkpoint. A missing, unreadable
    /// or incompatible checkpoint starts a fresh agent instead.
    pub async fn bootstrap(config: CatConfig, store: Arc<dyn CatStore>) -> Self {
        let agent = match store.load_agent_state().await {
            Ok(Some(snapshot)) => {
                let train_steps = snapshot.train_steps;
                match ItemSelectionAgent::from_snapshot(config.agent.clone(), snapshot) {
                    Ok(agent) => {
                        tracing::info!(train_steps, "agent restored from checkpoint");
                        agent
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "stored agent state incompatible, starting fresh");
                        ItemSelectionAgent::new(config.agent.clone())
                    }
                }
            }
            Ok(None) => {
                tracing::info!("no stored agent state, starting fresh");
                ItemSelectionAgent::new(config.agent.clone())
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to load agent state, starting fresh");
                ItemSelectionAgent::new(config.agent.clone())
            }
        };
        Self::with_agent(config, store, agent)
    }

    pub fn config(&self) -> &CatConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CatStore> {
        &self.store
    }

    pub fn agent_epsilon(&self) -> f64 {
        self.agent.lock().epsilon()
    }

    pub fn agent_train_steps(&self) -> u64 {
        self.agent.lock().train_steps()
    }

    pub fn agent_replay_len(&self) -> usize {
        self.agent.lock().replay_len()
    }

    pub fn agent_state_vector(&self) -> Vec<f64> {
        self.agent.lock().state_vector().to_vec()
    }

    /// Row locks currently held or awaited.
    pub fn active_row_locks(&self) -> usize {
        self.ability_locks.lock().len()
    }

    // ==================== Ability ====================

    /// Recompute theta and both ratings from the learner's full recorded
    /// history. `scope = None` covers every category with responses;
    /// scoped categories without responses report neutral defaults.
    pub async fn refresh_ability(
        &self,
        learner_id: &str,
        scope: Option<&[CategoryId]>,
    ) -> Result<BTreeMap<CategoryId, AbilityEstimate>, CatError> {
        let responses = self.store.get_responses(learner_id, None).await?;
        validate_responses(&responses)?;

        let mut grouped: BTreeMap<CategoryId, Vec<Response>> = BTreeMap::new();
        if let Some(scope) = scope {
            for category_id in scope {
                grouped.entry(*category_id).or_default();
            }
        }
        for response in responses {
            if scope.map_or(true, |s| s.contains(&response.category_id)) {
                grouped.entry(response.category_id).or_default().push(response);
            }
        }

        let categories: BTreeSet<CategoryId> = grouped.keys().copied().collect();
        let _guards = self.lock_categories(learner_id, &categories).await;

        let mut out = BTreeMap::new();
        for (category_id, history) in grouped {
            let mut estimate = self
                .store
                .load_ability(learner_id, category_id)
                .await?
                .unwrap_or_else(|| AbilityEstimate::new(learner_id, category_id));

            if history.is_empty() {
                out.insert(category_id, estimate);
                continue;
            }

            let theta = self.estimator.estimate_responses(&history)?;
            if theta.fallback {
                tracing::warn!(
                    learner_id,
                    category_id,
                    iterations = theta.iterations,
                    "theta fell back to default"
                );
            }
            let default = self.elo.default_rating();
            let (elo_rating, elo_time_rating) = track_algorithm!(AlgorithmId::EloRater, {
                (
                    self.elo.apply_sequence(EloRule::Classic, default, history.iter()),
                    self.elo.apply_sequence(EloRule::TimeWeighted, default, history.iter()),
                )
            });

            estimate.irt_theta = theta.theta;
            estimate.elo_rating = elo_rating;
            estimate.elo_time_rating = Some(elo_time_rating);
            estimate.touch();
            self.store.save_ability(&estimate).await?;

            tracing::debug!(
                learner_id,
                category_id,
                theta = estimate.irt_theta,
                elo = estimate.elo_rating,
                responses = history.len(),
                "ability refreshed"
            );
            out.insert(category_id, estimate);
        }
        Ok(out)
    }

    pub async fn estimate_ability(
        &self,
        learner_id: &str,
        category_ids: Option<&[CategoryId]>,
    ) -> Result<BTreeMap<CategoryId, f64>, CatError> {
        let estimates = self.refresh_ability(learner_id, category_ids).await?;
        Ok(estimates
            .into_iter()
            .map(|(category_id, estimate)| (category_id, estimate.irt_theta))
            .collect())
    }

    /// Apply both rating rules to the stored ratings, one response at a
    /// time in the order given.
    pub async fn update_elo(
        &self,
        learner_id: &str,
        responses: &[Response],
    ) -> Result<BTreeMap<CategoryId, f64>, CatError> {
        validate_responses(responses)?;
        let categories: BTreeSet<CategoryId> = responses.iter().map(|r| r.category_id).collect();
        let _guards = self.lock_categories(learner_id, &categories).await;

        let mut estimates = self.load_estimates(learner_id, &categories).await?;
        track_algorithm!(AlgorithmId::EloRater, {
            for response in responses {
                if let Some(estimate) = estimates.get_mut(&response.category_id) {
                    self.rate(estimate, response);
                }
            }
        });
        self.save_estimates(&mut estimates).await?;

        Ok(estimates
            .into_iter()
            .map(|(category_id, estimate)| (category_id, estimate.elo_rating))
            .collect())
    }

    // ==================== Selection ====================

    /// Build a quiz of up to `count` distinct items across `category_ids`.
    ///
    /// Abilities missing from `abilities` are read from the stored estimates
    /// (theta 0.0 when the learner has none). They drive the allocation and
    /// the closeness heuristic. The agent's state vector is encoded from the
    /// stored ratings, the same features training uses.
    pub async fn select_next_items(
        &self,
        learner_id: &str,
        category_ids: &[CategoryId],
        abilities: &BTreeMap<CategoryId, f64>,
        count: usize,
    ) -> Result<QuizPlan, CatError> {
        if count == 0 || category_ids.is_empty() {
            return Ok(QuizPlan::default());
        }

        let categories: BTreeSet<CategoryId> = category_ids.iter().copied().collect();
        let requested: Vec<CategoryId> = categories.iter().copied().collect();
        let pool = self.store.get_item_pool(&requested).await?;

        let mut by_category: BTreeMap<CategoryId, Vec<Item>> =
            categories.iter().map(|c| (*c, Vec::new())).collect();
        for item in pool {
            if let Some(items) = by_category.get_mut(&item.category_id) {
                items.push(item);
            }
        }

        let abilities = self.resolve_abilities(learner_id, &categories, abilities).await?;
        let features = self.state_features(learner_id, &categories).await?;

        let pool_sizes: BTreeMap<CategoryId, usize> =
            by_category.iter().map(|(c, items)| (*c, items.len())).collect();
        let allocation = allocate_categories(&pool_sizes, &abilities, count, &self.config.allocation);

        let mut chosen: Vec<ItemId> = Vec::with_capacity(count);
        let mut seen: HashSet<ItemId> = HashSet::new();
        let mut shortfalls = BTreeMap::new();
        {
            let mut agent = self.agent.lock();

            for (category_id, quota) in &allocation {
                let candidates = &by_category[category_id];
                let ability = abilities.get(category_id).copied().unwrap_or(0.0);
                let mut picked = 0;
                while picked < *quota && chosen.len() < count {
                    match agent.select(candidates, ability, &features, &seen) {
                        Ok(selection) => {
                            seen.insert(selection.item_id);
                            chosen.push(selection.item_id);
                            picked += 1;
                        }
                        Err(err) if err.is_pool_exhausted() => break,
                        Err(err) => return Err(err),
                    }
                }
                if picked < *quota {
                    shortfalls.insert(*category_id, quota - picked);
                }
            }

            if self.config.quiz.backfill && chosen.len() < count {
                let mut order: Vec<CategoryId> = categories.iter().copied().collect();
                order.sort_by(|a, b| {
                    let ta = abilities.get(a).copied().unwrap_or(0.0);
                    let tb = abilities.get(b).copied().unwrap_or(0.0);
                    ta.total_cmp(&tb).then(a.cmp(b))
                });
                for category_id in order {
                    let candidates = &by_category[&category_id];
                    let ability = abilities.get(&category_id).copied().unwrap_or(0.0);
                    while chosen.len() < count {
                        match agent.select(candidates, ability, &features, &seen) {
                            Ok(selection) => {
                                seen.insert(selection.item_id);
                                chosen.push(selection.item_id);
                            }
                            Err(err) if err.is_pool_exhausted() => break,
                            Err(err) => return Err(err),
                        }
                    }
                }
            }
        }

        if chosen.len() < count {
            tracing::warn!(
                learner_id,
                requested = count,
                selected = chosen.len(),
                "item pool exhausted before quiz was filled"
            );
            if !self.config.quiz.allow_partial {
                return Err(CatError::PoolExhausted {
                    category_id: None,
                    requested: count,
                    selected: chosen.len(),
                });
            }
        }

        Ok(QuizPlan {
            item_ids: chosen,
            allocation,
            shortfalls,
        })
    }

    /// Rank every item of each category in batch scoring mode, best first.
    /// `abilities` works as in [`select_next_items`](Self::select_next_items).
    pub async fn rank_items(
        &self,
        learner_id: &str,
        category_ids: &[CategoryId],
        abilities: &BTreeMap<CategoryId, f64>,
    ) -> Result<BTreeMap<CategoryId, Vec<(ItemId, f64)>>, CatError> {
        let categories: BTreeSet<CategoryId> = category_ids.iter().copied().collect();
        if categories.is_empty() {
            return Ok(BTreeMap::new());
        }
        let requested: Vec<CategoryId> = categories.iter().copied().collect();
        let pool = self.store.get_item_pool(&requested).await?;
        let features = self.state_features(learner_id, &categories).await?;

        let thetas = self.resolve_abilities(learner_id, &categories, abilities).await?;

        let mut by_category: BTreeMap<CategoryId, Vec<Item>> = BTreeMap::new();
        for item in pool {
            by_category.entry(item.category_id).or_default().push(item);
        }

        let mut agent = self.agent.lock();
        let mut out = BTreeMap::new();
        for (category_id, candidates) in &by_category {
            let ability = thetas.get(category_id).copied().unwrap_or(0.0);
            let weights = ItemSelectionAgent::exploration_weights(candidates, ability);
            let ranked = track_algorithm!(
                AlgorithmId::ItemSelection,
                agent.rank_batch(candidates, &weights, ability, &features)
            )?;
            out.insert(*category_id, ranked);
        }
        Ok(out)
    }

    /// The state vector the agent scores when `item` is a selection
    /// candidate for `learner_id`.
    pub async fn selection_state(&self, learner_id: &str, item: &Item) -> Result<Vec<f64>, CatError> {
        let categories = BTreeSet::from([item.category_id]);
        let features = self.state_features(learner_id, &categories).await?;
        let mut agent = self.agent.lock();
        Ok(agent.encode_state(&features, item.difficulty(), item.category_id))
    }

    // ==================== Training ====================

    /// Turn a batch of graded responses into agent experience, run one
    /// training step when enough experience has accumulated, and persist
    /// the updated ratings.
    pub async fn train_on_batch(
        &self,
        learner_id: &str,
        responses: &[Response],
    ) -> Result<BTreeMap<CategoryId, AbilityEstimate>, CatError> {
        if responses.is_empty() {
            return Ok(BTreeMap::new());
        }
        validate_responses(responses)?;

        let categories: BTreeSet<CategoryId> = responses.iter().map(|r| r.category_id).collect();
        let _guards = self.lock_categories(learner_id, &categories).await;

        let mut estimates: BTreeMap<CategoryId, AbilityEstimate> = self
            .store
            .load_abilities(learner_id)
            .await?
            .into_iter()
            .map(|e| (e.category_id, e))
            .collect();
        for category_id in &categories {
            estimates
                .entry(*category_id)
                .or_insert_with(|| AbilityEstimate::new(learner_id, *category_id));
        }

        let default = self.elo.default_rating();
        let mut features = encoding_features(estimates.values(), default);

        // Experiences are built in full before the agent takes any of them.
        let mut experiences = Vec::with_capacity(responses.len());
        {
            let mut agent = self.agent.lock();
            for response in responses {
                let Some(estimate) = estimates.get_mut(&response.category_id) else {
                    continue;
                };
                let difficulty = response.params.b;
                let state = agent.encode_state(&features, difficulty, response.category_id);
                let expected = self.rate(estimate, response);
                features.insert(response.category_id, elo_to_theta(estimate.elo_rating, default));
                let next_state = agent.encode_state(&features, difficulty, response.category_id);
                experiences.push(Experience {
                    state,
                    reward: response.actual() - expected,
                    next_state,
                    terminal: false,
                });
            }
        }

        let mut touched: BTreeMap<CategoryId, AbilityEstimate> = estimates
            .into_iter()
            .filter(|(c, _)| categories.contains(c))
            .collect();
        self.save_estimates(&mut touched).await?;

        let checkpoint = {
            let mut agent = self.agent.lock();
            let last_state = experiences.last().map(|e| e.next_state.clone());
            agent.remember_batch(experiences)?;
            if let Some(state) = last_state {
                agent.set_state_vector(state)?;
            }

            match agent.train_step() {
                Ok(Some(report)) => {
                    let every = self.config.checkpoint.every_steps;
                    (every > 0 && report.train_steps % every == 0).then(|| agent.snapshot())
                }
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(learner_id, error = %err, "training step skipped");
                    None
                }
            }
        };

        if let Some(snapshot) = checkpoint {
            if let Err(err) = self.store.save_agent_state(&snapshot).await {
                tracing::warn!(error = %err, "agent checkpoint failed");
            }
        }

        Ok(touched)
    }

    /// Run [`train_on_batch`](Self::train_on_batch) as a background task.
    pub fn spawn_training(
        self: &Arc<Self>,
        learner_id: String,
        responses: Vec<Response>,
    ) -> JoinHandle<Result<BTreeMap<CategoryId, AbilityEstimate>, CatError>> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let result = controller.train_on_batch(&learner_id, &responses).await;
            if let Err(ref err) = result {
                tracing::error!(learner_id = %learner_id, error = %err, "background training failed");
            }
            result
        })
    }

    // ==================== Checkpointing ====================

    pub async fn checkpoint(&self) -> Result<(), CatError> {
        let snapshot = self.agent.lock().snapshot();
        self.store.save_agent_state(&snapshot).await?;
        tracing::debug!(train_steps = snapshot.train_steps, "agent checkpoint saved");
        Ok(())
    }

    /// Save the agent every `interval` until `shutdown` fires. Failures are
    /// logged and retried on the next tick.
    pub fn spawn_checkpoint_worker(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("checkpoint worker stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = controller.checkpoint().await {
                            tracing::warn!(error = %err, "periodic agent checkpoint failed");
                        }
                    }
                }
            }
        })
    }

    // ==================== Internals ====================

    /// Update both ratings for one response and return the classic
    /// expected score under the rating held before the update.
    fn rate(&self, estimate: &mut AbilityEstimate, response: &Response) -> f64 {
        let classic = self.elo.apply(EloRule::Classic, estimate.elo_rating, response);
        let timed_from = estimate.elo_time_rating.unwrap_or(self.elo.default_rating());
        let timed = self.elo.apply(EloRule::TimeWeighted, timed_from, response);
        estimate.elo_rating = classic.new_rating;
        estimate.elo_time_rating = Some(timed.new_rating);
        classic.expected
    }

    async fn load_estimates(
        &self,
        learner_id: &str,
        categories: &BTreeSet<CategoryId>,
    ) -> Result<BTreeMap<CategoryId, AbilityEstimate>, CatError> {
        let mut out = BTreeMap::new();
        for category_id in categories {
            let estimate = self
                .store
                .load_ability(learner_id, *category_id)
                .await?
                .unwrap_or_else(|| AbilityEstimate::new(learner_id, *category_id));
            out.insert(*category_id, estimate);
        }
        Ok(out)
    }

    async fn save_estimates(
        &self,
        estimates: &mut BTreeMap<CategoryId, AbilityEstimate>,
    ) -> Result<(), CatError> {
        for estimate in estimates.values_mut() {
            estimate.touch();
            self.store.save_ability(estimate).await?;
        }
        Ok(())
    }

    /// Supplied thetas, completed from the stored `irt_theta` (0.0 without a
    /// row) for the rest of `categories`.
    async fn resolve_abilities(
        &self,
        learner_id: &str,
        categories: &BTreeSet<CategoryId>,
        supplied: &BTreeMap<CategoryId, f64>,
    ) -> Result<BTreeMap<CategoryId, f64>, CatError> {
        let mut abilities = supplied.clone();
        for category_id in categories {
            if !abilities.contains_key(category_id) {
                let theta = self
                    .store
                    .load_ability(learner_id, *category_id)
                    .await?
                    .map(|e| e.irt_theta)
                    .unwrap_or(0.0);
                abilities.insert(*category_id, theta);
            }
        }
        Ok(abilities)
    }

    /// Stored ratings on the theta scale for every category the learner
    /// has, plus neutral entries for `categories`.
    async fn state_features(
        &self,
        learner_id: &str,
        categories: &BTreeSet<CategoryId>,
    ) -> Result<BTreeMap<CategoryId, f64>, CatError> {
        let stored = self.store.load_abilities(learner_id).await?;
        let mut features = encoding_features(stored.iter(), self.elo.default_rating());
        for category_id in categories {
            features.entry(*category_id).or_insert(0.0);
        }
        Ok(features)
    }

    /// Acquire the row locks for `categories` in ascending order.
    async fn lock_categories(&self, learner_id: &str, categories: &BTreeSet<CategoryId>) -> RowGuards<'_> {
        let mut rows = RowGuards {
            table: &self.ability_locks,
            keys: Vec::with_capacity(categories.len()),
            guards: Vec::with_capacity(categories.len()),
        };
        for category_id in categories {
            let key = (learner_id.to_string(), *category_id);
            let lock = {
                let mut locks = self.ability_locks.lock();
                Arc::clone(locks.entry(key.clone()).or_default())
            };
            rows.keys.push(key);
            rows.guards.push(lock.lock_owned().await);
        }
        rows
    }
}

fn validate_responses(responses: &[Response]) -> Result<(), CatError> {
    responses.iter().try_for_each(Response::validate)
}

fn encoding_features<'a>(
    estimates: impl Iterator<Item = &'a AbilityEstimate>,
    default_rating: f64,
) -> BTreeMap<CategoryId, f64> {
    estimates
        .map(|e| (e.category_id, elo_to_theta(e.elo_rating, default_rating)))
        .collect()
}

/// Map a rating onto the theta scale: a 400-point gap is one decade of
/// odds, theta is in natural-log odds.
pub fn elo_to_theta(rating: f64, default_rating: f64) -> f64 {
    if !rating.is_finite() {
        return 0.0;
    }
    ((rating - default_rating) * std::f64::consts::LN_10 / 400.0).clamp(THETA_MIN, THETA_MAX)
}
