//! Several tabular agents training side by side on their own environments, periodically
//! pooling what they learned.

use anyhow::Result;
use itertools::Itertools;

use ql::prelude::QlError;

use crate::agent::q_table::QTable;
use crate::agent::tabular::TabularAgent;
use crate::agent::PolicyAgent;
use crate::config::{MultiAgentParameter, TabularParameter};
use crate::reward::RewardShaper;
use crate::session::{EpisodeCursor, TrainingSession};
use crate::snapshot::FlappyEnvironment;
use crate::state_encoder::StateKey;

/// Pools Q-tables into a shared table and blends it back into every agent.
#[derive(Clone, Debug)]
pub struct KnowledgeSharing {
    param: MultiAgentParameter,
}

impl KnowledgeSharing {
    pub fn new(param: MultiAgentParameter) -> Self { Self { param } }

    /// Builds the shared table: the first agent's table, moved towards every further agent's
    /// table with `sharing_strength`. Each agent then keeps `own_weight` of its own values.
    pub fn share(
        &self,
        agents: &mut [&mut TabularAgent],
    ) -> QTable {
        let mut shared = QTable::new();
        for (i, agent) in agents.iter().enumerate() {
            let weight = if i == 0 { 1.0 } else { self.param.sharing_strength };
            shared.blend_from(agent.q_table(), weight);
        }
        for agent in agents.iter_mut() {
            let mut table = agent.q_table().clone();
            table.blend_from(&shared, 1.0 - self.param.own_weight);
            agent.replace_q_table(table);
        }
        shared
    }
}

/// Exploration and learning rate of agent `index`, spread so agents behave differently.
pub fn diversified_parameter(
    base: &TabularParameter,
    multi: &MultiAgentParameter,
    index: usize,
) -> TabularParameter {
    let i = index as f64;
    TabularParameter {
        epsilon: (base.epsilon * (1.0 + multi.epsilon_spread * i)).min(1.0),
        learning_rate: (base.learning_rate * (1.0 + multi.learning_rate_spread * i)).min(1.0),
        ..base.clone()
    }
}

struct Lane<E: FlappyEnvironment> {
    agent: TabularAgent,
    environment: E,
    reward_shaper: RewardShaper,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOutcome {
    pub scores: Vec<u32>,
    pub stopped: bool,
}

pub struct MultiAgentTrainer<'s, E: FlappyEnvironment> {
    session: &'s mut TrainingSession,
    lanes: Vec<Lane<E>>,
    sharing: KnowledgeSharing,
    shared: QTable,
    generation: u64,
}

impl<'s, E: FlappyEnvironment> MultiAgentTrainer<'s, E> {
    /// One agent per environment, each continuing from its own persisted table.
    pub fn new(
        session: &'s mut TrainingSession,
        environments: Vec<E>,
    ) -> Result<Self> {
        if environments.is_empty() {
            return Err(QlError::from("multi-agent training needs at least one environment").into());
        }
        let config = session.config();
        let storage = &config.storage;
        let lanes = environments
            .into_iter()
            .enumerate()
            .map(|(i, environment)| Lane {
                agent: TabularAgent::from_file(
                    diversified_parameter(&config.tabular, &config.multi_agent, i),
                    config.divisors.clone(),
                    &storage.agent_q_table_file(i),
                    config.training.seed.map(|s| s + i as u64),
                ),
                environment,
                reward_shaper: RewardShaper::new(config.reward.clone()),
            })
            .collect();
        let shared = QTable::load(&storage.shared_q_table_file(), &config.divisors);
        let sharing = KnowledgeSharing::new(config.multi_agent.clone());
        Ok(Self {
            session,
            lanes,
            sharing,
            shared,
            generation: 0,
        })
    }

    pub fn generation(&self) -> u64 { self.generation }

    pub fn agents(&self) -> impl Iterator<Item = &TabularAgent> { self.lanes.iter().map(|l| &l.agent) }

    pub fn shared_table(&self) -> &QTable { &self.shared }

    /// Plays one episode per agent, ticking all of them in turn until every one is done.
    pub fn train_generation(&mut self) -> Result<GenerationOutcome> {
        let max_ticks = self.session.config().training.max_ticks_per_episode;
        let mut cursors: Vec<EpisodeCursor<StateKey>> = Vec::with_capacity(self.lanes.len());
        for lane in self.lanes.iter_mut() {
            lane.reward_shaper.reset();
            cursors.push(self.session.begin_episode(&mut lane.environment, &lane.agent));
        }

        let running = |c: &EpisodeCursor<StateKey>| !c.done && c.ticks < max_ticks;
        while cursors.iter().any(running) {
            if self.session.stop_requested() {
                return Ok(GenerationOutcome {
                    scores: cursors.iter().map(|c| c.snapshot.score).collect(),
                    stopped: true,
                });
            }
            for (lane, cursor) in self.lanes.iter_mut().zip(cursors.iter_mut()) {
                if running(cursor) {
                    self.session
                        .play_tick(&mut lane.environment, &mut lane.agent, &mut lane.reward_shaper, cursor);
                }
            }
        }

        for lane in self.lanes.iter_mut() {
            lane.agent.end_episode();
        }
        self.generation += 1;

        if self.generation % self.session.config().multi_agent.sharing_every_generations == 0 {
            self.share_knowledge();
        }

        let scores = cursors.iter().map(|c| c.snapshot.score).collect::<Vec<_>>();
        let best = scores.iter().copied().max().unwrap_or(0);
        if self.session.record_score(best) {
            log::info!("new high score {} in generation {}", best, self.generation);
            self.save_all();
        } else if self.generation % self.session.config().training.save_every_generations == 0 {
            self.save_all();
        }
        self.session.save_calibration();

        if self.generation % self.session.config().training.stats_every_generations == 0 {
            log::info!(
                "generation: {}, scores: [{}], best_score: {}, shared_states: {}, gap_offset: {}",
                self.generation,
                scores.iter().join(", "),
                self.session.best_score(),
                self.shared.len(),
                self.session.gap_offset()
            );
            for (i, lane) in self.lanes.iter().enumerate() {
                log::info!("agent {}: {}", i + 1, lane.agent.stats());
            }
        }
        Ok(GenerationOutcome { scores, stopped: false })
    }

    pub fn train(
        &mut self,
        generations: Option<u64>,
    ) -> Result<u64> {
        let start = self.generation;
        while generations.map_or(true, |n| self.generation - start < n) {
            if self.train_generation()?.stopped {
                break;
            }
        }
        self.save_all();
        self.session.save_calibration();
        Ok(self.generation - start)
    }

    pub fn share_knowledge(&mut self) {
        let mut agents = self.lanes.iter_mut().map(|l| &mut l.agent).collect_vec();
        self.shared = self.sharing.share(&mut agents);
        log::debug!("knowledge shared: {} states in shared table", self.shared.len());
    }

    /// Persists every agent's table and the shared table
    pub fn save_all(&self) {
        let config = self.session.config();
        for (i, lane) in self.lanes.iter().enumerate() {
            let path = config.storage.agent_q_table_file(i);
            if let Err(e) = lane.agent.save(&path) {
                log::warn!("failed to save agent {} table to {:?}: {:#}", i + 1, path, e);
            }
        }
        let path = config.storage.shared_q_table_file();
        if let Err(e) = self.shared.save(&path, &config.divisors) {
            log::warn!("failed to save shared table to {:?}: {:#}", path, e);
        }
    }

    /// Operator action: forget everything learned, in memory and on disk.
    pub fn reset_tables(&mut self) {
        for lane in self.lanes.iter_mut() {
            lane.agent.replace_q_table(QTable::new());
        }
        self.shared.clear();
        self.save_all();
        log::info!("all Q-tables reset");
    }
}
