//! Per-algorithm call counters for the estimation, rating and selection
//! paths. One process-wide registry; all counters are lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

static REGISTRY: OnceLock<AlgorithmRegistry> = OnceLock::new();

pub fn registry() -> &'static AlgorithmRegistry {
    REGISTRY.get_or_init(AlgorithmRegistry::new)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmId {
    AbilityEstimator,
    EloRater,
    ItemSelection,
    AgentTraining,
}

impl AlgorithmId {
    pub const ALL: [AlgorithmId; 4] = [
        AlgorithmId::AbilityEstimator,
        AlgorithmId::EloRater,
        AlgorithmId::ItemSelection,
        AlgorithmId::AgentTraining,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn id(&self) -> &'static str {
        match self {
            AlgorithmId::AbilityEstimator => "modeling_mle",
            AlgorithmId::EloRater => "modeling_elo",
            AlgorithmId::ItemSelection => "decision_select",
            AlgorithmId::AgentTraining => "decision_train",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmId::AbilityEstimator => "3PL Maximum Likelihood",
            AlgorithmId::EloRater => "Elo Rating",
            AlgorithmId::ItemSelection => "Epsilon-Greedy Item Selection",
            AlgorithmId::AgentTraining => "Replay Training",
        }
    }
}

#[derive(Debug, Default)]
pub struct AlgorithmCounters {
    calls: AtomicU64,
    errors: AtomicU64,
    latency_total_us: AtomicU64,
    latency_max_us: AtomicU64,
    /// Unix millis, 0 = never.
    last_call_ms: AtomicU64,
}

impl AlgorithmCounters {
    fn record(&self, latency_us: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.latency_total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_max_us.fetch_max(latency_us, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis().max(1) as u64;
        self.last_call_ms.store(now, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn mean_latency_ms(&self) -> f64 {
        match self.calls() {
            0 => 0.0,
            n => self.latency_total_us.load(Ordering::Relaxed) as f64 / n as f64 / 1000.0,
        }
    }

    pub fn max_latency_ms(&self) -> f64 {
        self.latency_max_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn last_call_ms(&self) -> Option<u64> {
        Some(self.last_call_ms.load(Ordering::Relaxed)).filter(|ts| *ts != 0)
    }
}

pub struct AlgorithmRegistry {
    counters: [AlgorithmCounters; 4],
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
        }
    }

    pub fn record(&self, id: AlgorithmId, latency_us: u64) {
        self.counters[id.index()].record(latency_us);
    }

    pub fn record_error(&self, id: AlgorithmId) {
        self.counters[id.index()].errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self, id: AlgorithmId) -> &AlgorithmCounters {
        &self.counters[id.index()]
    }

    pub fn snapshot(&self) -> Vec<AlgorithmStatus> {
        AlgorithmId::ALL
            .iter()
            .map(|id| {
                let c = self.counters(*id);
                AlgorithmStatus {
                    id: id.id(),
                    name: id.name(),
                    calls: c.calls(),
                    errors: c.errors(),
                    mean_latency_ms: c.mean_latency_ms(),
                    max_latency_ms: c.max_latency_ms(),
                    last_call_ms: c.last_call_ms(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmStatus {
    pub id: &'static str,
    pub name: &'static str,
    pub calls: u64,
    pub errors: u64,
    pub mean_latency_ms: f64,
    pub max_latency_ms: f64,
    pub last_call_ms: Option<u64>,
}

/// Evaluate `$body`, recording its wall time against `$id`.
#[macro_export]
macro_rules! track_algorithm {
    ($id:expr, $body:expr) => {{
        let started = std::time::Instant::now();
        let value = $body;
        $crate::cat::metrics::registry().record($id, started.elapsed().as_micros() as u64);
        value
    }};
}
