use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Result;
use itertools::Itertools;
use num_format::ToFormattedString;
use rustc_hash::FxHashMap;

use ql::util::format;

use crate::agent::PolicyAgent;
use crate::heuristic::OverrideRule;
use crate::reward::RewardShaper;
use crate::session::TrainingSession;
use crate::snapshot::{FlapAction, FlappyEnvironment};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpisodeOutcome {
    pub score: u32,
    pub ticks: u64,
    pub reward: f64,
    /// the episode was cut short by a stop request
    pub stopped: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainingSummary {
    pub generations: u64,
    pub ticks: u64,
    pub best_score: u32,
    pub stopped: bool,
}

/// A self-driving Q-learning loop.
///
/// It is directly connected to a game environment and drives it tick by tick; each finished
/// episode ("generation") decays exploration and persists calibration. The policy is saved on
/// a new best score, every `save_every_generations` and when training ends.
pub struct SelfDrivingLearner<'s, E, A>
where
    E: FlappyEnvironment,
    A: PolicyAgent,
{
    session: &'s mut TrainingSession,
    environment: E,
    agent: A,
    reward_shaper: RewardShaper,
    policy_file: PathBuf,
    generation: u64,
    step_count: u64,
    recent_scores: VecDeque<u32>,
    action_counts: FxHashMap<FlapAction, usize>,
    override_counts: FxHashMap<OverrideRule, usize>,
}

impl<'s, E, A> SelfDrivingLearner<'s, E, A>
where
    E: FlappyEnvironment,
    A: PolicyAgent,
{
    pub fn new(
        session: &'s mut TrainingSession,
        environment: E,
        agent: A,
        policy_file: PathBuf,
    ) -> Self {
        let reward_shaper = RewardShaper::new(session.config().reward.clone());
        let recent_scores = VecDeque::with_capacity(session.config().training.recent_scores_window);
        Self {
            session,
            environment,
            agent,
            reward_shaper,
            policy_file,
            generation: 0,
            step_count: 0,
            recent_scores,
            action_counts: FxHashMap::default(),
            override_counts: FxHashMap::default(),
        }
    }

    pub fn agent(&self) -> &A { &self.agent }

    pub fn into_agent(self) -> A { self.agent }

    pub fn generation(&self) -> u64 { self.generation }

    pub fn learn_generations(
        &mut self,
        generations: Option<u64>,
    ) -> Result<TrainingSummary> {
        log::info!("{} learning started", self.agent.kind());
        let mut stopped = false;
        while generations.map_or(true, |n| self.generation < n) {
            if self.learn_episode()?.stopped {
                stopped = true;
                break;
            }
        }
        self.save_policy();
        self.session.save_calibration();
        self.learning_update_log();
        Ok(TrainingSummary {
            generations: self.generation,
            ticks: self.step_count,
            best_score: self.session.best_score(),
            stopped,
        })
    }

    pub fn learn_episode(&mut self) -> Result<EpisodeOutcome> {
        self.reward_shaper.reset();
        let mut cursor = self.session.begin_episode(&mut self.environment, &self.agent);
        log::trace!("started learning generation {}", self.generation);

        let max_ticks = self.session.config().training.max_ticks_per_episode;
        let mut episode_reward = 0.0;
        while !cursor.done && cursor.ticks < max_ticks {
            if self.session.stop_requested() {
                return Ok(EpisodeOutcome {
                    score: cursor.snapshot.score,
                    ticks: cursor.ticks,
                    reward: episode_reward,
                    stopped: true,
                });
            }
            let report =
                self.session
                    .play_tick(&mut self.environment, &mut self.agent, &mut self.reward_shaper, &mut cursor);
            self.step_count += 1;
            episode_reward += report.reward;
            *self.action_counts.entry(report.action).or_insert(0) += 1;
            if let Some(rule) = report.rule {
                *self.override_counts.entry(rule).or_insert(0) += 1;
            }
        }

        let score = cursor.snapshot.score;
        self.end_generation(score);
        Ok(EpisodeOutcome {
            score,
            ticks: cursor.ticks,
            reward: episode_reward,
            stopped: false,
        })
    }

    fn end_generation(
        &mut self,
        score: u32,
    ) {
        self.agent.end_episode();
        self.generation += 1;

        let window = self.session.config().training.recent_scores_window;
        if self.recent_scores.len() == window {
            self.recent_scores.pop_front();
        }
        self.recent_scores.push_back(score);

        let training = &self.session.config().training;
        let periodic_save = self.generation % training.save_every_generations == 0;
        let stats_due = self.generation % training.stats_every_generations == 0;

        if self.session.record_score(score) {
            log::info!("new best score {} in generation {}", score, self.generation);
            self.save_policy();
        } else if periodic_save {
            self.save_policy();
        }
        self.session.save_calibration();

        if stats_due {
            self.learning_update_log();
        }
    }

    fn save_policy(&self) {
        match self.agent.save(&self.policy_file) {
            Ok(()) => log::debug!("saved {} policy to {:?}", self.agent.kind(), self.policy_file),
            Err(e) => log::warn!("failed to save policy to {:?}: {:#}", self.policy_file, e),
        }
    }

    fn learning_update_log(&mut self) {
        let number_format = format::number_format();

        let (mean_score, max_score) = match self.recent_scores.len() {
            0 => (0.0, 0),
            n => (
                self.recent_scores.iter().sum::<u32>() as f64 / n as f64,
                self.recent_scores.iter().copied().max().unwrap_or(0),
            ),
        };

        let total_actions: usize = self.action_counts.values().sum();
        let action_distribution_line = self
            .action_counts
            .iter()
            .sorted()
            .map(|(&action, &count)| {
                let ratio = 100.0 * count as f32 / total_actions as f32;
                format!("{} {:.1}%", action, ratio)
            })
            .join(", ");
        let override_line = self
            .override_counts
            .iter()
            .sorted()
            .map(|(rule, count)| format!("{} {}", rule, count.to_formatted_string(&number_format)))
            .join(", ");

        log::info!(
            "\n\
    generation: {}, ticks: {}, 𝜀={:.3}, gap_offset: {}, best_score: {}, recent_scores: {{mean: {:.1}, max: {}}}\n\
    agent: {}\n\
    action_distribution (of last {}): {}\n\
    overrides: {}",
            self.generation.to_formatted_string(&number_format),
            self.step_count.to_formatted_string(&number_format),
            self.agent.epsilon(),
            self.session.gap_offset(),
            self.session.best_score(),
            mean_score,
            max_score,
            self.agent.stats(),
            total_actions.to_formatted_string(&number_format),
            action_distribution_line,
            if override_line.is_empty() { "-".to_string() } else { override_line }
        );
        self.action_counts.clear();
        self.override_counts.clear();
    }
}
