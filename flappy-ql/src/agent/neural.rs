use std::collections::VecDeque;
use std::path::Path;

use anyhow::Result;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use ql::learn::exploration::EpsilonGreedy;
use ql::learn::replay_buffer::{ReplayBuffer, Transition};
use ql::model::mlp::{Adam, Mlp};
use ql::prelude::QlError;

use crate::agent::{seeded_rng, AgentKind, AgentStats, AgentStatsDetail, PolicyAgent};
use crate::config::NeuralParameter;
use crate::persistence;
use crate::snapshot::{FlapAction, Snapshot};
use crate::state_encoder::{FeatureVector, StateEncoder, FEATURES};

const LOSS_WINDOW: usize = 100;

/// Deep Q-learning agent: online network, periodically synchronized target network and
/// uniform experience replay.
pub struct NeuralAgent {
    param: NeuralParameter,
    exploration: EpsilonGreedy,
    online: Mlp,
    // "target network"
    target: Mlp,
    optimizer: Adam,
    replay_buffer: ReplayBuffer<FeatureVector, FlapAction>,
    rng: StdRng,
    episode_count: u64,
    total_updates: u64,
    recent_losses: VecDeque<f32>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    architecture: Vec<usize>,
    online: Mlp,
    target: Mlp,
    optimizer: Adam,
    epsilon: f64,
    episode_count: u64,
    total_updates: u64,
    exploration_count: u64,
    exploitation_count: u64,
    recent_losses: Vec<f32>,
}

impl NeuralAgent {
    /// `[inputs, hidden.., outputs]` of both networks
    pub fn architecture(param: &NeuralParameter) -> Vec<usize> {
        let mut sizes = vec![FEATURES];
        sizes.extend(&param.hidden_layers);
        sizes.push(2);
        sizes
    }

    pub fn new(
        param: NeuralParameter,
        seed: Option<u64>,
    ) -> Self {
        let mut rng = seeded_rng(seed);
        let online = Mlp::new(&Self::architecture(&param), &mut rng);
        let target = online.clone();
        let optimizer = Adam::new(&online, param.learning_rate);
        Self {
            exploration: EpsilonGreedy::new(param.epsilon, param.epsilon_decay, param.epsilon_min),
            replay_buffer: ReplayBuffer::new(param.replay_capacity),
            online,
            target,
            optimizer,
            rng,
            episode_count: 0,
            total_updates: 0,
            recent_losses: VecDeque::with_capacity(LOSS_WINDOW),
            param,
        }
    }

    /// Restores networks, optimizer state and counters from the checkpoint at `path`.
    /// The optimizer continues with the configured learning rate.
    ///
    /// A missing, malformed or differently shaped checkpoint leaves a freshly initialized agent.
    pub fn from_checkpoint(
        param: NeuralParameter,
        path: &Path,
        seed: Option<u64>,
    ) -> Self {
        let mut agent = Self::new(param, seed);
        let architecture = Self::architecture(&agent.param);
        let checkpoint = persistence::load_or_default(
            path,
            "neural checkpoint",
            |c: Checkpoint| -> Result<Option<Checkpoint>> {
                let fits = c.architecture == architecture
                    && c.online.has_architecture(&architecture)
                    && c.target.has_architecture(&architecture)
                    && c.optimizer.fits(&c.online);
                if !fits {
                    return Err(QlError(format!(
                        "checkpoint architecture {:?} does not match {:?}",
                        c.architecture, architecture
                    ))
                    .into());
                }
                Ok(Some(c))
            },
            None,
        );
        if let Some(c) = checkpoint {
            agent.online = c.online;
            agent.target = c.target;
            agent.optimizer = c.optimizer;
            // the configured learning rate wins over the persisted one
            agent.optimizer.set_learning_rate(agent.param.learning_rate);
            agent.exploration.set_epsilon(c.epsilon);
            agent.exploration.restore_counts(c.exploration_count, c.exploitation_count);
            agent.episode_count = c.episode_count;
            agent.total_updates = c.total_updates;
            agent.recent_losses = c.recent_losses.into_iter().collect();
        }
        agent
    }

    pub fn total_updates(&self) -> u64 { self.total_updates }

    pub fn replay_len(&self) -> usize { self.replay_buffer.len() }

    pub fn q_values(
        &self,
        state: &FeatureVector,
    ) -> [f32; 2] {
        let q = self.online.forward(Array1::from(state.to_vec()).view());
        [q[0], q[1]]
    }

    /// Argmax over the online network; ties resolve to [FlapAction::Wait].
    pub fn greedy_action(
        &self,
        state: &FeatureVector,
    ) -> FlapAction {
        let q = self.q_values(state);
        if q[FlapAction::Flap.index()] > q[FlapAction::Wait.index()] {
            FlapAction::Flap
        } else {
            FlapAction::Wait
        }
    }

    /// Stores a transition and runs one training step once a full batch is available.
    pub fn remember(
        &mut self,
        transition: Transition<FeatureVector, FlapAction>,
    ) -> Option<f32> {
        self.replay_buffer.add(transition);
        self.update()
    }

    /// One gradient step on a uniformly sampled batch; `None` while the buffer holds fewer
    /// transitions than a batch.
    ///
    /// Targets are `r + 𝛾·max_a' Q_target(s', a')`, or just `r` for terminal transitions.
    /// The loss is the mean squared error on the taken actions only.
    pub fn update(&mut self) -> Option<f32> {
        let batch_size = self.param.batch_size;
        let (states, next_states, actions, rewards, dones) = {
            let batch = self.replay_buffer.sample(&mut self.rng, batch_size)?;
            (
                Array2::from_shape_fn((batch_size, FEATURES), |(i, j)| batch[i].state[j]),
                Array2::from_shape_fn((batch_size, FEATURES), |(i, j)| batch[i].next_state[j]),
                batch.iter().map(|t| t.action.index()).collect::<Vec<_>>(),
                batch.iter().map(|t| t.reward as f32).collect::<Vec<_>>(),
                batch.iter().map(|t| t.done).collect::<Vec<_>>(),
            )
        };

        let next_q = self.target.forward_batch(next_states.view());
        let targets = (0..batch_size).map(|i| {
            if dones[i] {
                rewards[i]
            } else {
                let best_next = next_q.row(i).fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                rewards[i] + self.param.discount * best_next
            }
        });

        let trace = self.online.forward_trace(states.view());
        let q = trace.output();
        let mut output_grad = Array2::<f32>::zeros((batch_size, 2));
        let mut loss = 0.0;
        for (i, target) in targets.enumerate() {
            let diff = q[[i, actions[i]]] - target;
            loss += diff * diff;
            output_grad[[i, actions[i]]] = 2.0 * diff / batch_size as f32;
        }
        loss /= batch_size as f32;

        let mut gradients = self.online.backward(&trace, output_grad);
        let norm = gradients.clip_global_norm(self.param.max_grad_norm);
        self.optimizer.step(&mut self.online, &gradients);
        self.total_updates += 1;
        log::trace!("update {}: loss {:.5}, gradient norm {:.3}", self.total_updates, loss, norm);

        if self.total_updates % self.param.target_sync_interval == 0 {
            self.target = self.online.clone();
            log::debug!("target network synchronized after {} updates", self.total_updates);
        }

        if self.recent_losses.len() == LOSS_WINDOW {
            self.recent_losses.pop_front();
        }
        self.recent_losses.push_back(loss);
        Some(loss)
    }

    fn avg_recent_loss(&self) -> Option<f32> {
        match self.recent_losses.len() {
            0 => None,
            n => Some(self.recent_losses.iter().sum::<f32>() / n as f32),
        }
    }
}

impl PolicyAgent for NeuralAgent {
    type State = FeatureVector;

    fn kind(&self) -> AgentKind { AgentKind::Neural }

    fn observe(
        &self,
        encoder: &StateEncoder,
        snapshot: &Snapshot,
        gap_offset: i32,
    ) -> FeatureVector {
        encoder.encode(snapshot, gap_offset)
    }

    fn select_action(
        &mut self,
        state: &FeatureVector,
    ) -> FlapAction {
        if self.exploration.explore(&mut self.rng) {
            if self.rng.gen::<bool>() { FlapAction::Flap } else { FlapAction::Wait }
        } else {
            self.greedy_action(state)
        }
    }

    fn learn(
        &mut self,
        transition: Transition<FeatureVector, FlapAction>,
    ) {
        self.remember(transition);
    }

    fn end_episode(&mut self) {
        self.episode_count += 1;
        self.exploration.decay();
    }

    fn epsilon(&self) -> f64 { self.exploration.epsilon() }

    fn stats(&self) -> AgentStats {
        AgentStats {
            episode_count: self.episode_count,
            total_updates: self.total_updates,
            epsilon: self.exploration.epsilon(),
            exploration_rate: self.exploration.exploration_rate(),
            detail: AgentStatsDetail::Neural {
                replay_len: self.replay_buffer.len(),
                avg_recent_loss: self.avg_recent_loss(),
            },
        }
    }

    fn save(
        &self,
        path: &Path,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            architecture: Self::architecture(&self.param),
            online: self.online.clone(),
            target: self.target.clone(),
            optimizer: self.optimizer.clone(),
            epsilon: self.exploration.epsilon(),
            episode_count: self.episode_count,
            total_updates: self.total_updates,
            exploration_count: self.exploration.exploration_count(),
            exploitation_count: self.exploration.exploitation_count(),
            recent_losses: self.recent_losses.iter().copied().collect(),
        };
        persistence::write_json(path, &checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    use super::*;

    fn param() -> NeuralParameter {
        NeuralParameter {
            batch_size: 8,
            replay_capacity: 64,
            target_sync_interval: 5,
            hidden_layers: vec![16, 8],
            ..NeuralParameter::default()
        }
    }

    fn transition(
        i: usize,
        done: bool,
    ) -> Transition<FeatureVector, FlapAction> {
        let v = i as f32 / 10.0;
        Transition {
            state: [v, -v, 0.5, 0.4, 0.1, 1.0],
            action: if i % 2 == 0 { FlapAction::Wait } else { FlapAction::Flap },
            reward: if done { -100.0 } else { 0.05 },
            next_state: [v, 0.0, 0.4, 0.4, 0.1, 1.0],
            done,
        }
    }

    #[test]
    fn test_no_update_before_full_batch() {
        let mut agent = NeuralAgent::new(param(), Some(3));
        for i in 0..7 {
            assert_eq!(agent.remember(transition(i, false)), None);
        }
        assert_eq!(agent.total_updates(), 0);
        assert!(agent.remember(transition(7, true)).is_some());
        assert_eq!(agent.total_updates(), 1);
    }

    #[test]
    fn test_target_network_synchronizes_periodically() {
        let mut agent = NeuralAgent::new(param(), Some(4));
        for i in 0..8 {
            agent.replay_buffer.add(transition(i, i == 7));
        }
        for _ in 0..4 {
            agent.update();
        }
        assert_ne!(agent.online, agent.target);
        agent.update();
        assert_eq!(agent.total_updates(), 5);
        assert_eq!(agent.online, agent.target);
    }

    #[test]
    fn test_terminal_transitions_are_learned() {
        // a single terminal transition: the taken action's value must approach the reward
        let mut agent = NeuralAgent::new(
            NeuralParameter {
                batch_size: 1,
                replay_capacity: 1,
                learning_rate: 0.01,
                max_grad_norm: 100.0,
                ..param()
            },
            Some(5),
        );
        let t = Transition {
            state: [0.5, 0.0, 0.5, 0.5, 0.0, 1.0],
            action: FlapAction::Flap,
            reward: -1.0,
            next_state: [0.9, 1.0, 0.5, 0.5, 0.8, 1.0],
            done: true,
        };
        agent.remember(t.clone());
        for _ in 0..1000 {
            agent.update();
        }
        let q = agent.q_values(&t.state);
        assert!((q[1] + 1.0).abs() < 0.1, "q: {:?}", q);
    }

    #[test]
    fn test_checkpoint_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dqn.json");
        let mut agent = NeuralAgent::new(param(), Some(6));
        for i in 0..20 {
            agent.learn(transition(i, i % 9 == 8));
            agent.select_action(&transition(i, false).state);
        }
        agent.end_episode();
        agent.save(&path)?;

        let restored = NeuralAgent::from_checkpoint(param(), &path, Some(99));
        assert_eq!(restored.online, agent.online);
        assert_eq!(restored.target, agent.target);
        assert_eq!(restored.optimizer, agent.optimizer);
        assert_eq!(restored.stats(), agent.stats().with_replay_len(0));
        let probe = transition(3, false).state;
        assert_eq!(restored.greedy_action(&probe), agent.greedy_action(&probe));
        Ok(())
    }

    #[test]
    fn test_bootstrap_uses_target_network() {
        let mut agent = NeuralAgent::new(
            NeuralParameter {
                batch_size: 1,
                replay_capacity: 1,
                target_sync_interval: 10_000,
                learning_rate: 0.01,
                max_grad_norm: 100.0,
                ..param()
            },
            Some(8),
        );
        let s1 = [0.2, -0.1, 0.6, 0.5, -0.1, 1.0];
        let s2 = [0.3, 0.2, 0.5, 0.5, 0.0, 1.0];

        // drive the online estimate of s2 far away from the frozen target network
        agent.remember(Transition {
            state: s2,
            action: FlapAction::Flap,
            reward: 10.0,
            next_state: s2,
            done: true,
        });
        for _ in 0..300 {
            agent.update();
        }
        assert_ne!(agent.online, agent.target);

        agent.replay_buffer.add(Transition {
            state: s1,
            action: FlapAction::Wait,
            reward: 0.5,
            next_state: s2,
            done: false,
        });
        let best = |q: Array1<f32>| q.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let discount = agent.param.discount;
        let taken = agent.q_values(&s1)[FlapAction::Wait.index()];
        let from_target = 0.5 + discount * best(agent.target.forward(Array1::from(s2.to_vec()).view()));
        let from_online = 0.5 + discount * best(agent.online.forward(Array1::from(s2.to_vec()).view()));

        let loss = agent.update().unwrap();
        assert_relative_eq!(loss, (taken - from_target).powi(2), max_relative = 1e-4);
        assert!((loss - (taken - from_online).powi(2)).abs() > 1.0, "loss {}", loss);
    }

    #[test]
    fn test_checkpoint_keeps_configured_learning_rate() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dqn.json");
        let mut agent = NeuralAgent::new(param(), Some(6));
        for i in 0..12 {
            agent.learn(transition(i, i == 11));
        }
        agent.save(&path)?;

        let faster = NeuralParameter {
            learning_rate: 0.5,
            ..param()
        };
        let restored = NeuralAgent::from_checkpoint(faster, &path, Some(6));
        assert_eq!(restored.optimizer.learning_rate(), 0.5);
        assert_eq!(restored.optimizer.step_count(), agent.optimizer.step_count());
        assert_eq!(restored.online, agent.online);
        Ok(())
    }

    #[test]
    fn test_mismatched_checkpoint_is_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dqn.json");
        NeuralAgent::new(param(), Some(6)).save(&path)?;

        let other = NeuralParameter {
            hidden_layers: vec![32, 32, 16],
            ..param()
        };
        let fresh = NeuralAgent::from_checkpoint(other, &path, Some(1));
        assert!(fresh.online.has_architecture(&[6, 32, 32, 16, 2]));
        assert_eq!(fresh.total_updates(), 0);
        Ok(())
    }

    impl AgentStats {
        fn with_replay_len(
            mut self,
            len: usize,
        ) -> Self {
            if let AgentStatsDetail::Neural { replay_len, .. } = &mut self.detail {
                *replay_len = len;
            }
            self
        }
    }
}
