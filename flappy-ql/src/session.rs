use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use ql::learn::replay_buffer::Transition;
use ql::prelude::DebugVisualizer;

use crate::agent::neural::NeuralAgent;
use crate::agent::tabular::TabularAgent;
use crate::agent::{AgentKind, PolicyAgent};
use crate::calibrator::AdaptiveGapCalibrator;
use crate::config::FlappyConfig;
use crate::heuristic::{HeuristicOverride, OverrideRule};
use crate::learner::{SelfDrivingLearner, TrainingSummary};
use crate::persistence::{self, BestScore};
use crate::reward::RewardShaper;
use crate::snapshot::{FlapAction, FlappyEnvironment, Snapshot};
use crate::state_encoder::StateEncoder;

/// Shared context of one training run.
///
/// Owns the pieces every agent of the run reads or writes: encoder, safety rules, the gap
/// calibration, the best score and the stop signal. Built once and handed by reference to
/// learners.
pub struct TrainingSession {
    config: FlappyConfig,
    encoder: StateEncoder,
    heuristic: HeuristicOverride,
    calibrator: AdaptiveGapCalibrator,
    best_score: u32,
    stop_signal: Arc<AtomicBool>,
}

/// Where an episode currently stands
pub struct EpisodeCursor<S> {
    pub snapshot: Snapshot,
    pub state: S,
    pub ticks: u64,
    pub done: bool,
}

/// What happened during a single tick
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickReport {
    pub action: FlapAction,
    pub rule: Option<OverrideRule>,
    pub reward: f64,
}

impl TrainingSession {
    /// Validates `config` and restores calibration and best score from its storage location.
    pub fn new(config: FlappyConfig) -> Result<Self> {
        config.validate()?;
        let storage = &config.storage;
        let calibrator = AdaptiveGapCalibrator::load(
            &config.geometry,
            &config.gap,
            &storage.heatmap_file(),
            &storage.gap_offset_file(),
        );
        let best_score = persistence::load_or_default(
            &storage.best_score_file(),
            "best score",
            |doc: BestScore| Ok(doc.best_score),
            0,
        );
        let encoder = StateEncoder::new(
            config.geometry.clone(),
            config.divisors.clone(),
            config.neural.velocity_scale,
        );
        let heuristic = HeuristicOverride::new(config.heuristic.clone(), &config.geometry);
        log::info!(
            "training session ready (data dir: {:?}, gap offset: {}, best score: {})",
            storage.data_dir,
            calibrator.offset(),
            best_score
        );
        Ok(Self {
            config,
            encoder,
            heuristic,
            calibrator,
            best_score,
            stop_signal: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &FlappyConfig { &self.config }

    pub fn encoder(&self) -> &StateEncoder { &self.encoder }

    pub fn heuristic(&self) -> &HeuristicOverride { &self.heuristic }

    pub fn calibrator(&self) -> &AdaptiveGapCalibrator { &self.calibrator }

    pub fn gap_offset(&self) -> i32 { self.calibrator.offset() }

    pub fn best_score(&self) -> u32 { self.best_score }

    /// Handle for another thread (e.g. an input handler) to request a stop.
    pub fn stop_signal(&self) -> Arc<AtomicBool> { Arc::clone(&self.stop_signal) }

    pub fn request_stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        log::info!("stop requested");
    }

    pub fn stop_requested(&self) -> bool { self.stop_signal.load(Ordering::SeqCst) }

    /// Records an episode score; persists and returns `true` on a new best.
    pub fn record_score(
        &mut self,
        score: u32,
    ) -> bool {
        if score <= self.best_score {
            return false;
        }
        self.best_score = score;
        persistence::save_best_effort(
            &self.config.storage.best_score_file(),
            "best score",
            &BestScore { best_score: score },
        );
        true
    }

    pub fn save_calibration(&self) {
        let storage = &self.config.storage;
        self.calibrator.save(&storage.heatmap_file(), &storage.gap_offset_file());
    }

    /// Operator action: forget collected collision statistics
    pub fn reset_heatmap(&mut self) {
        self.calibrator.reset_heatmap();
        self.save_calibration();
    }

    /// Tabular agent continuing from the persisted table
    pub fn create_tabular_agent(&self) -> TabularAgent {
        TabularAgent::from_file(
            self.config.tabular.clone(),
            self.config.divisors.clone(),
            &self.config.storage.q_table_file(),
            self.config.training.seed,
        )
    }

    /// Neural agent continuing from the persisted checkpoint
    pub fn create_neural_agent(&self) -> NeuralAgent {
        NeuralAgent::from_checkpoint(
            self.config.neural.clone(),
            &self.config.storage.neural_checkpoint_file(),
            self.config.training.seed,
        )
    }

    /// Trains a single agent of the given kind until `generations` episodes are done or a stop
    /// is requested.
    pub fn train<E: FlappyEnvironment>(
        &mut self,
        kind: AgentKind,
        environment: E,
        generations: Option<u64>,
    ) -> Result<TrainingSummary> {
        match kind {
            AgentKind::Tabular => {
                let agent = self.create_tabular_agent();
                let policy_file = self.config.storage.q_table_file();
                SelfDrivingLearner::new(self, environment, agent, policy_file).learn_generations(generations)
            }
            AgentKind::Neural => {
                let agent = self.create_neural_agent();
                let policy_file = self.config.storage.neural_checkpoint_file();
                SelfDrivingLearner::new(self, environment, agent, policy_file).learn_generations(generations)
            }
        }
    }

    /// Resets `environment` for a new episode with the current gap offset.
    pub fn begin_episode<E, A>(
        &self,
        environment: &mut E,
        agent: &A,
    ) -> EpisodeCursor<A::State>
    where
        E: FlappyEnvironment,
        A: PolicyAgent,
    {
        let offset = self.gap_offset();
        environment.set_gap_offset(offset);
        environment.reset();
        let snapshot = environment.state().clone();
        let state = agent.observe(&self.encoder, &snapshot, offset);
        EpisodeCursor {
            snapshot,
            state,
            ticks: 0,
            done: false,
        }
    }

    /// One tick: safety rules or policy pick the action, the environment steps, the reward is
    /// shaped, the agent learns and a collision feeds the calibration.
    pub fn play_tick<E, A>(
        &mut self,
        environment: &mut E,
        agent: &mut A,
        reward_shaper: &mut RewardShaper,
        cursor: &mut EpisodeCursor<A::State>,
    ) -> TickReport
    where
        E: FlappyEnvironment,
        A: PolicyAgent,
    {
        let offset = self.gap_offset();
        let rule = self.heuristic.check(&cursor.snapshot, offset);
        let action = match rule {
            Some(r) => r.action(),
            None => agent.select_action(&cursor.state),
        };

        log::trace!("{}", cursor.snapshot.one_line_info());
        let (next_snapshot, done) = environment.step(action);
        let next_snapshot = next_snapshot.clone();
        let reward = reward_shaper.shape(&next_snapshot, action, offset);
        let next_state = agent.observe(&self.encoder, &next_snapshot, offset);
        log::trace!("step with action {} resulted in reward: {:.2}, done: {}", action, reward, done);

        agent.learn(Transition {
            state: cursor.state.clone(),
            action,
            reward,
            next_state: next_state.clone(),
            done,
        });

        if let Some(collision) = &next_snapshot.collision {
            self.calibrator.record_collision(collision);
            environment.set_gap_offset(self.calibrator.offset());
        }

        cursor.snapshot = next_snapshot;
        cursor.state = next_state;
        cursor.ticks += 1;
        cursor.done = done;
        TickReport { action, rule, reward }
    }
}
