use rand::Rng;
use serde::{Deserialize, Serialize};

/// Epsilon-greedy exploration schedule with multiplicative per-episode decay.
///
/// `epsilon` never drops below `epsilon_min`, so exploration never stops entirely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpsilonGreedy {
    epsilon: f64,
    decay: f64,
    epsilon_min: f64,
    exploration_count: u64,
    exploitation_count: u64,
}

impl EpsilonGreedy {
    pub fn new(
        epsilon: f64,
        decay: f64,
        epsilon_min: f64,
    ) -> Self {
        debug_assert!((0.0..=1.0).contains(&epsilon_min));
        Self {
            epsilon: epsilon.max(epsilon_min),
            decay,
            epsilon_min,
            exploration_count: 0,
            exploitation_count: 0,
        }
    }

    pub fn epsilon(&self) -> f64 { self.epsilon }

    pub fn epsilon_min(&self) -> f64 { self.epsilon_min }

    /// Restores a persisted epsilon (still bounded by `epsilon_min`)
    pub fn set_epsilon(
        &mut self,
        epsilon: f64,
    ) {
        self.epsilon = epsilon.max(self.epsilon_min);
    }

    /// Decides whether the next action shall be a random one and counts the decision.
    pub fn explore<R: Rng>(
        &mut self,
        rng: &mut R,
    ) -> bool {
        if rng.gen::<f64>() < self.epsilon {
            self.exploration_count += 1;
            true
        } else {
            self.exploitation_count += 1;
            false
        }
    }

    /// `ε ← max(ε_min, ε·decay)`; called once per episode boundary
    pub fn decay(&mut self) {
        self.epsilon = f64::max(self.epsilon_min, self.epsilon * self.decay);
    }

    pub fn exploration_count(&self) -> u64 { self.exploration_count }

    pub fn exploitation_count(&self) -> u64 { self.exploitation_count }

    pub fn restore_counts(
        &mut self,
        exploration_count: u64,
        exploitation_count: u64,
    ) {
        self.exploration_count = exploration_count;
        self.exploitation_count = exploitation_count;
    }

    pub fn exploration_rate(&self) -> f64 {
        match self.exploration_count + self.exploitation_count {
            0 => 0.0,
            total => self.exploration_count as f64 / total as f64,
        }
    }
}
