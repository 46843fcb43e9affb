use std::path::Path;

use anyhow::Result;
use itertools::{Itertools, MinMaxResult};
use rand::rngs::StdRng;
use rand::Rng;

use ql::learn::exploration::EpsilonGreedy;
use ql::learn::replay_buffer::Transition;

use crate::agent::q_table::QTable;
use crate::agent::{seeded_rng, AgentKind, AgentStats, AgentStatsDetail, PolicyAgent};
use crate::config::{Divisors, TabularParameter};
use crate::snapshot::{FlapAction, Snapshot};
use crate::state_encoder::{StateEncoder, StateKey};

/// Classic one-step Q-learning over discretized [StateKey]s.
pub struct TabularAgent {
    param: TabularParameter,
    divisors: Divisors,
    exploration: EpsilonGreedy,
    q_table: QTable,
    rng: StdRng,
    episode_count: u64,
    total_updates: u64,
    /// running mean of |ΔQ| over all updates
    avg_q_change: f64,
    max_q: f64,
    min_q: f64,
}

impl TabularAgent {
    pub fn new(
        param: TabularParameter,
        divisors: Divisors,
        seed: Option<u64>,
    ) -> Self {
        Self::with_table(param, divisors, QTable::new(), seed)
    }

    pub fn with_table(
        param: TabularParameter,
        divisors: Divisors,
        q_table: QTable,
        seed: Option<u64>,
    ) -> Self {
        let exploration = EpsilonGreedy::new(param.epsilon, param.epsilon_decay, param.epsilon_min);
        let (min_q, max_q) = value_range(&q_table);
        Self {
            param,
            divisors,
            exploration,
            q_table,
            rng: seeded_rng(seed),
            episode_count: 0,
            total_updates: 0,
            avg_q_change: 0.0,
            max_q,
            min_q,
        }
    }

    /// Starts from the table persisted at `path`, or from an empty one.
    pub fn from_file(
        param: TabularParameter,
        divisors: Divisors,
        path: &Path,
        seed: Option<u64>,
    ) -> Self {
        let q_table = QTable::load(path, &divisors);
        Self::with_table(param, divisors, q_table, seed)
    }

    pub fn param(&self) -> &TabularParameter { &self.param }

    pub fn q_table(&self) -> &QTable { &self.q_table }

    /// Replaces the whole table (knowledge sharing, operator reset)
    pub fn replace_q_table(
        &mut self,
        q_table: QTable,
    ) {
        (self.min_q, self.max_q) = value_range(&q_table);
        self.q_table = q_table;
    }

    /// Best known action; unseen states and ties resolve to [FlapAction::Wait].
    pub fn greedy_action(
        &self,
        state: &StateKey,
    ) -> FlapAction {
        match self.q_table.get(state) {
            Some(q) if q[FlapAction::Flap.index()] > q[FlapAction::Wait.index()] => FlapAction::Flap,
            _ => FlapAction::Wait,
        }
    }

    /// One-step update `Q(s,a) ← Q(s,a) + 𝛼·(r + 𝛾·max Q(s') − Q(s,a))`.
    ///
    /// Both states enter the table if they were unseen. Returns the new `Q(s,a)`.
    pub fn update(
        &mut self,
        state: StateKey,
        action: FlapAction,
        reward: f64,
        next_state: StateKey,
    ) -> f64 {
        self.q_table.entry(state);
        let max_next = {
            let next = self.q_table.entry(next_state);
            next[0].max(next[1])
        };
        let q = &mut self.q_table.entry(state)[action.index()];
        let old = *q;
        *q = old + self.param.learning_rate * (reward + self.param.discount * max_next - old);
        let new = *q;

        self.total_updates += 1;
        self.avg_q_change += ((new - old).abs() - self.avg_q_change) / self.total_updates as f64;
        self.max_q = self.max_q.max(new);
        self.min_q = self.min_q.min(new);
        new
    }

    pub fn decay_exploration(&mut self) { self.exploration.decay() }
}

/// `(min, max)` over all stored values; `(0, 0)` for an empty table
fn value_range(q_table: &QTable) -> (f64, f64) {
    match q_table.iter().flat_map(|(_, q)| q.iter().copied()).minmax() {
        MinMaxResult::NoElements => (0.0, 0.0),
        MinMaxResult::OneElement(v) => (v, v),
        MinMaxResult::MinMax(min, max) => (min, max),
    }
}

impl PolicyAgent for TabularAgent {
    type State = StateKey;

    fn kind(&self) -> AgentKind { AgentKind::Tabular }

    fn observe(
        &self,
        encoder: &StateEncoder,
        snapshot: &Snapshot,
        gap_offset: i32,
    ) -> StateKey {
        encoder.discretize(snapshot, gap_offset)
    }

    fn select_action(
        &mut self,
        state: &StateKey,
    ) -> FlapAction {
        if self.exploration.explore(&mut self.rng) {
            if self.rng.gen::<bool>() { FlapAction::Flap } else { FlapAction::Wait }
        } else {
            self.greedy_action(state)
        }
    }

    fn learn(
        &mut self,
        transition: Transition<StateKey, FlapAction>,
    ) {
        self.update(transition.state, transition.action, transition.reward, transition.next_state);
    }

    fn end_episode(&mut self) {
        self.episode_count += 1;
        self.decay_exploration();
    }

    fn epsilon(&self) -> f64 { self.exploration.epsilon() }

    fn stats(&self) -> AgentStats {
        AgentStats {
            episode_count: self.episode_count,
            total_updates: self.total_updates,
            epsilon: self.exploration.epsilon(),
            exploration_rate: self.exploration.exploration_rate(),
            detail: AgentStatsDetail::Tabular {
                states: self.q_table.len(),
                avg_q_change: self.avg_q_change,
                max_q: self.max_q,
                min_q: self.min_q,
            },
        }
    }

    fn save(
        &self,
        path: &Path,
    ) -> Result<()> {
        self.q_table.save(path, &self.divisors)
    }
}
