use std::fmt::{Debug, Display, Formatter};
use std::path::Path;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use ql::learn::replay_buffer::Transition;

use crate::snapshot::{FlapAction, Snapshot};
use crate::state_encoder::StateEncoder;

pub mod neural;
pub mod q_table;
pub mod tabular;

/// Which value function drives the decisions of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentKind {
    Tabular,
    Neural,
}

impl Display for AgentKind {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            AgentKind::Tabular => write!(f, "tabular"),
            AgentKind::Neural => write!(f, "neural"),
        }
    }
}

/// A learning policy over the two game actions.
pub trait PolicyAgent {
    /// State representation this agent learns on
    type State: Clone + Debug;

    fn kind(&self) -> AgentKind;

    fn observe(
        &self,
        encoder: &StateEncoder,
        snapshot: &Snapshot,
        gap_offset: i32,
    ) -> Self::State;

    /// 𝜀-greedy action choice
    fn select_action(
        &mut self,
        state: &Self::State,
    ) -> FlapAction;

    fn learn(
        &mut self,
        transition: Transition<Self::State, FlapAction>,
    );

    /// Episode boundary: counts the episode and decays exploration.
    fn end_episode(&mut self);

    fn epsilon(&self) -> f64;

    fn stats(&self) -> AgentStats;

    fn save(
        &self,
        path: &Path,
    ) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentStats {
    pub episode_count: u64,
    pub total_updates: u64,
    pub epsilon: f64,
    pub exploration_rate: f64,
    pub detail: AgentStatsDetail,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AgentStatsDetail {
    Tabular {
        states: usize,
        avg_q_change: f64,
        max_q: f64,
        min_q: f64,
    },
    Neural {
        replay_len: usize,
        avg_recent_loss: Option<f32>,
    },
}

impl Display for AgentStats {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "episodes: {}, updates: {}, 𝜀={:.3}, exploration_rate: {:.1}%, ",
            self.episode_count,
            self.total_updates,
            self.epsilon,
            100.0 * self.exploration_rate
        )?;
        match &self.detail {
            AgentStatsDetail::Tabular {
                states,
                avg_q_change,
                max_q,
                min_q,
            } => write!(
                f,
                "states: {}, avg_q_change: {:.4}, q_range: [{:.2}, {:.2}]",
                states, avg_q_change, min_q, max_q
            ),
            AgentStatsDetail::Neural {
                replay_len,
                avg_recent_loss,
            } => match avg_recent_loss {
                Some(loss) => write!(f, "replay: {}, avg_loss: {:.4}", replay_len, loss),
                None => write!(f, "replay: {}, avg_loss: -", replay_len),
            },
        }
    }
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}
