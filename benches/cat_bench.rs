//! Benchmark suite for cat-engine
//!
//! Run with: cargo bench

use std::collections::{BTreeMap, HashSet};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cat_engine::cat::config::{AgentConfig, EstimatorConfig};
use cat_engine::cat::decision::{Experience, ItemSelectionAgent};
use cat_engine::cat::modeling::estimation::Observation;
use cat_engine::cat::modeling::AbilityEstimator;
use cat_engine::cat::types::{Item, ItemParams};

fn observations(n: usize) -> Vec<Observation> {
    (0..n)
        .map(|i| Observation {
            params: ItemParams::new(0.8 + (i % 5) as f64 * 0.2, -2.0 + (i % 9) as f64 * 0.5, 0.2),
            correct: i % 3 != 0,
        })
        .collect()
}

fn pool(n: i64) -> Vec<Item> {
    (0..n)
        .map(|i| Item {
            id: i,
            category_id: i % 4,
            params: ItemParams::new(1.0, -3.0 + 6.0 * i as f64 / n as f64, 0.25),
            elo_difficulty: 1500.0,
        })
        .collect()
}

fn bench_estimate(c: &mut Criterion) {
    let estimator = AbilityEstimator::new(EstimatorConfig::default());
    let obs = observations(50);
    c.bench_function("AbilityEstimator::estimate(50)", |b| {
        b.iter(|| estimator.estimate(black_box(&obs)))
    });
}

fn bench_select(c: &mut Criterion) {
    let mut agent = ItemSelectionAgent::new(AgentConfig {
        seed: Some(1),
        ..Default::default()
    });
    agent.set_epsilon(0.0);
    let items = pool(200);
    let abilities = BTreeMap::from([(0, 0.5), (1, -0.5), (2, 1.0), (3, 0.0)]);
    let exclude = HashSet::new();
    c.bench_function("ItemSelectionAgent::select(200)", |b| {
        b.iter(|| agent.select(black_box(&items), 0.3, &abilities, &exclude))
    });
}

fn bench_rank_batch(c: &mut Criterion) {
    let mut agent = ItemSelectionAgent::new(AgentConfig {
        seed: Some(3),
        ..Default::default()
    });
    let items = pool(200);
    let weights = ItemSelectionAgent::exploration_weights(&items, 0.3);
    let abilities = BTreeMap::from([(0, 0.5), (1, -0.5), (2, 1.0), (3, 0.0)]);
    c.bench_function("ItemSelectionAgent::rank_batch(200)", |b| {
        b.iter(|| agent.rank_batch(black_box(&items), &weights, 0.3, &abilities))
    });
}

fn bench_train_step(c: &mut Criterion) {
    let config = AgentConfig {
        seed: Some(2),
        ..Default::default()
    };
    let dim = config.state_dim();
    let mut agent = ItemSelectionAgent::new(config);
    for i in 0..256 {
        let x = (i % 17) as f64 / 17.0;
        agent
            .remember(Experience {
                state: vec![x; dim],
                reward: x - 0.5,
                next_state: vec![1.0 - x; dim],
                terminal: false,
            })
            .unwrap();
    }
    c.bench_function("ItemSelectionAgent::train_step", |b| b.iter(|| agent.train_step()));
}

criterion_group!(benches, bench_estimate, bench_select, bench_rank_batch, bench_train_step);
criterion_main!(benches);
