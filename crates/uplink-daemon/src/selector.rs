/// Interface selection policies.
///
/// A selector is a pure function from a health snapshot to a preference
/// order: no I/O, no mutation. That purity is what lets the dispatcher
/// re-ask during its fallback loop with a locally modified snapshot copy.
///
/// Two policies exist: the default score heuristic, and a logistic model
/// produced by the offline training pipeline.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use uplink_protocol::health::{HealthSnapshot, IfaceHealth};

pub const DEFAULT_LATENCY_WEIGHT: f64 = 0.8;
pub const DEFAULT_SUCCESS_WEIGHT: f64 = 20.0;

/// How many of the newest latency samples feed the model's rolling mean.
pub const MODEL_LATENCY_WINDOW: usize = 5;

// -- Heuristic policy --

/// Weighted latency minus a success-rate bonus; lower scores win.
/// The weights are policy, not protocol, and both are configurable.
#[derive(Debug, Clone)]
pub struct Heuristic {
    pub latency_weight: f64,
    pub success_weight: f64,
}

impl Default for Heuristic {
    fn default() -> Self {
        Self {
            latency_weight: DEFAULT_LATENCY_WEIGHT,
            success_weight: DEFAULT_SUCCESS_WEIGHT,
        }
    }
}

impl Heuristic {
    fn score(&self, health: &IfaceHealth) -> f64 {
        self.latency_weight * health.avg_latency() - self.success_weight * health.success_rate()
    }
}

// -- Learned policy --

/// Logistic scorer over per-interface features. The feature vector order
/// is part of the model contract and must match the training pipeline:
/// `[latency_avg_5, failures, successes, active_conns]`.
#[derive(Debug, Clone, Deserialize)]
pub struct LearnedModel {
    weights: Vec<f64>,
    bias: f64,
}

impl LearnedModel {
    pub const FEATURE_COUNT: usize = 4;

    /// Load model parameters from a JSON file:
    /// `{ "weights": [w0, w1, w2, w3], "bias": b }`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model file {}", path.display()))?;
        let model: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse model file {}", path.display()))?;
        if model.weights.len() != Self::FEATURE_COUNT {
            anyhow::bail!(
                "model file {} has {} weights, expected {}",
                path.display(),
                model.weights.len(),
                Self::FEATURE_COUNT
            );
        }
        Ok(model)
    }

    fn features(health: &IfaceHealth) -> [f64; Self::FEATURE_COUNT] {
        [
            health.latency_avg_last(MODEL_LATENCY_WINDOW),
            health.failures as f64,
            health.successes as f64,
            health.active_conns as f64,
        ]
    }

    /// Probability that this interface is currently the best choice.
    fn probability(&self, health: &IfaceHealth) -> f64 {
        let x = Self::features(health);
        let z: f64 = self.bias
            + self
                .weights
                .iter()
                .zip(x.iter())
                .map(|(w, f)| w * f)
                .sum::<f64>();
        1.0 / (1.0 + (-z).exp())
    }
}

// -- Selector --

#[derive(Debug, Clone)]
pub enum Selector {
    Heuristic(Heuristic),
    Model(LearnedModel),
}

impl Default for Selector {
    fn default() -> Self {
        Self::Heuristic(Heuristic::default())
    }
}

impl Selector {
    /// Preference value for one interface: always lower-is-better so both
    /// policies rank the same way.
    fn preference(&self, health: &IfaceHealth) -> f64 {
        match self {
            Self::Heuristic(h) => h.score(health),
            Self::Model(m) => -m.probability(health),
        }
    }

    /// The single best interface, or `None` on an empty snapshot. Ties go
    /// to the earlier interface in enumeration order.
    pub fn best(&self, snapshot: &HealthSnapshot) -> Option<String> {
        let mut best: Option<(&str, f64)> = None;
        for (name, health) in snapshot.iter() {
            let pref = self.preference(health);
            match best {
                Some((_, current)) if pref >= current => {}
                _ => best = Some((name, pref)),
            }
        }
        best.map(|(name, _)| name.to_string())
    }

    /// Every interface, best first. Stable sort keeps enumeration order
    /// between equally scored interfaces.
    pub fn rank(&self, snapshot: &HealthSnapshot) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = snapshot
            .iter()
            .map(|(name, health)| (name.to_string(), self.preference(health)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(name, _)| name).collect()
    }
}
