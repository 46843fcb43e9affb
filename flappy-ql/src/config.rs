use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ql::prelude::QlError;

/// Complete parameter set of a training session.
///
/// Every field has a tuned default, so a config file only needs to name what it changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlappyConfig {
    pub geometry: Geometry,
    pub divisors: Divisors,
    pub tabular: TabularParameter,
    pub neural: NeuralParameter,
    pub reward: RewardParameter,
    pub heuristic: HeuristicParameter,
    pub gap: GapParameter,
    pub training: TrainingParameter,
    pub multi_agent: MultiAgentParameter,
    pub storage: StoragePaths,
}

impl FlappyConfig {
    /// Reads a JSON config file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading config file {:?}", path))?;
        let config: FlappyConfig =
            serde_json::from_str(&content).with_context(|| format!("parsing config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn check(
            condition: bool,
            msg: &str,
        ) -> Result<()> {
            if condition { Ok(()) } else { Err(QlError::from(msg).into()) }
        }
        fn probability(v: f64) -> bool { (0.0..=1.0).contains(&v) }

        let g = &self.geometry;
        check(g.screen_width > 0.0 && g.screen_height > 0.0, "screen dimensions must be positive")?;
        check((0.0..g.screen_height).contains(&g.ground_height), "ground must lie within the screen")?;

        let d = &self.divisors;
        check(
            [d.avatar_y, d.velocity, d.obstacle_x, d.gap_center_y, d.gap_offset].iter().all(|&v| v > 0.0),
            "state divisors must be positive",
        )?;

        let t = &self.tabular;
        check(t.learning_rate > 0.0 && t.learning_rate <= 1.0, "tabular learning rate must be in (0,1]")?;
        check(probability(t.discount), "tabular discount must be in [0,1]")?;
        check(probability(t.epsilon) && probability(t.epsilon_min), "tabular epsilon must be in [0,1]")?;
        check(t.epsilon_decay > 0.0 && t.epsilon_decay <= 1.0, "tabular epsilon decay must be in (0,1]")?;

        let n = &self.neural;
        check(n.learning_rate > 0.0, "neural learning rate must be positive")?;
        check(probability(n.discount as f64), "neural discount must be in [0,1]")?;
        check(probability(n.epsilon) && probability(n.epsilon_min), "neural epsilon must be in [0,1]")?;
        check(n.epsilon_decay > 0.0 && n.epsilon_decay <= 1.0, "neural epsilon decay must be in (0,1]")?;
        check(n.batch_size > 0, "batch size must be positive")?;
        check(n.replay_capacity >= n.batch_size, "replay capacity must hold at least one batch")?;
        check(n.target_sync_interval > 0, "target sync interval must be positive")?;
        check(n.hidden_layers.iter().all(|&h| h > 0), "hidden layer sizes must be positive")?;
        check(n.max_grad_norm > 0.0, "gradient norm limit must be positive")?;
        check(n.velocity_scale > 0.0, "velocity scale must be positive")?;

        let r = &self.reward;
        check(r.terminal_penalty > 0.0, "terminal penalty must be positive")?;
        check(r.distance_bands.len() >= 3, "at least three distance bands are required")?;
        check(
            r.distance_bands.windows(2).all(|w| w[0].max_distance < w[1].max_distance && w[0].reward > w[1].reward),
            "distance bands must be ordered by distance with strictly decreasing rewards",
        )?;
        check(
            r.distance_bands.last().map_or(false, |b| b.reward > r.beyond_bands_reward),
            "reward beyond the last band must be below the last band",
        )?;
        check(
            r.consecutive_flap_penalty >= 0.0 && r.flap_toward_gap_penalty >= 0.0 && r.ceiling_penalty >= 0.0,
            "penalties are magnitudes and must not be negative",
        )?;

        let h = &self.heuristic;
        check(
            h.ground_margin >= 0.0 && h.ceiling_margin >= 0.0 && h.above_gap_threshold >= 0.0 && h.below_gap_threshold >= 0.0,
            "heuristic margins must not be negative",
        )?;

        check(self.gap.gap_size > 0, "gap size must be positive")?;
        check(self.gap.offset_bound() >= 0, "gap edge margin must not exceed half the gap")?;
        check(self.gap.offset_step > 0, "gap offset step must be positive")?;
        check(self.gap.placement_margin >= 0, "gap placement margin must not be negative")?;
        check(
            (self.gap.gap_size + 2 * self.gap.placement_margin) as f32 <= g.floor_y(),
            "gap and its placement margins must fit between ceiling and ground",
        )?;

        let m = &self.multi_agent;
        check(m.agents > 0, "at least one agent is required")?;
        check(m.sharing_every_generations > 0, "knowledge sharing interval must be positive")?;
        check(probability(m.sharing_strength) && probability(m.own_weight), "sharing weights must be in [0,1]")?;
        Ok(())
    }
}

/// World dimensions in pixels; y grows downwards, `0` is the ceiling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    pub screen_width: f32,
    pub screen_height: f32,
    pub ground_height: f32,
}

impl Geometry {
    /// y coordinate of the ground surface
    pub fn floor_y(&self) -> f32 { self.screen_height - self.ground_height }

    /// number of pixel rows, one heatmap slot each
    pub fn rows(&self) -> usize { self.screen_height as usize }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            screen_width: 400.0,
            screen_height: 600.0,
            ground_height: 100.0,
        }
    }
}

/// Bucket sizes of the tabular state key.
///
/// A persisted Q-table is only valid for the divisors it was produced with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Divisors {
    pub avatar_y: f32,
    pub velocity: f32,
    pub obstacle_x: f32,
    pub gap_center_y: f32,
    /// signed vertical offset of the avatar from the gap center
    pub gap_offset: f32,
}

impl Default for Divisors {
    fn default() -> Self {
        Self {
            avatar_y: 25.0,
            velocity: 1.0,
            obstacle_x: 25.0,
            gap_center_y: 25.0,
            gap_offset: 20.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabularParameter {
    /// 𝛼
    pub learning_rate: f64,
    /// 𝛾 (0 <= 𝛾 <= 1); the bigger, the more farsighted the agent becomes
    pub discount: f64,
    /// initial 𝜀
    pub epsilon: f64,
    /// multiplicative 𝜀 decay per episode
    pub epsilon_decay: f64,
    pub epsilon_min: f64,
}

impl Default for TabularParameter {
    fn default() -> Self {
        Self {
            learning_rate: 0.15,
            discount: 0.99,
            epsilon: 0.2,
            epsilon_decay: 0.9999,
            epsilon_min: 0.05,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralParameter {
    /// Adam learning rate
    pub learning_rate: f32,
    pub discount: f32,
    pub epsilon: f64,
    pub epsilon_decay: f64,
    pub epsilon_min: f64,
    pub batch_size: usize,
    // Maximum replay length
    pub replay_capacity: usize,
    /// number of network updates between two hard copies online → target
    pub target_sync_interval: u64,
    pub hidden_layers: Vec<usize>,
    /// global gradient L2 norm limit per update
    pub max_grad_norm: f32,
    /// velocity (px/tick) mapped onto the feature value 1.0
    pub velocity_scale: f32,
}

impl Default for NeuralParameter {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            discount: 0.99,
            epsilon: 0.1,
            epsilon_decay: 0.995,
            epsilon_min: 0.01,
            batch_size: 32,
            replay_capacity: 10_000,
            target_sync_interval: 100,
            hidden_layers: vec![64, 64, 32],
            max_grad_norm: 1.0,
            velocity_scale: 10.0,
        }
    }
}

/// A reward band: applies while the avatar is less than `max_distance` px away from the gap center.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistanceBand {
    pub max_distance: f32,
    pub reward: f64,
}

/// Reward term weights. Penalties are magnitudes; they get subtracted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardParameter {
    pub terminal_penalty: f64,
    pub survival_bonus: f64,
    pub score_bonus: f64,
    /// ordered by `max_distance`, closer bands pay more
    pub distance_bands: Vec<DistanceBand>,
    pub beyond_bands_reward: f64,
    /// multiplied with the number of consecutive flaps
    pub consecutive_flap_penalty: f64,
    /// vertical distance from the gap center below which the directional term stays silent
    pub directional_tolerance: f32,
    pub flap_toward_gap_penalty: f64,
    pub flap_below_gap_reward: f64,
    pub ceiling_penalty: f64,
}

impl Default for RewardParameter {
    fn default() -> Self {
        Self {
            terminal_penalty: 100.0,
            survival_bonus: 0.05,
            score_bonus: 10.0,
            distance_bands: vec![
                DistanceBand { max_distance: 30.0, reward: 2.0 },
                DistanceBand { max_distance: 60.0, reward: 1.0 },
                DistanceBand { max_distance: 100.0, reward: 0.0 },
            ],
            beyond_bands_reward: -1.0,
            consecutive_flap_penalty: 0.1,
            directional_tolerance: 20.0,
            flap_toward_gap_penalty: 0.5,
            flap_below_gap_reward: 0.3,
            ceiling_penalty: 5.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicParameter {
    pub enabled: bool,
    /// avatar bottom closer than this to the ground forces a flap
    pub ground_margin: f32,
    /// avatar top closer than this to the ceiling forces a wait
    pub ceiling_margin: f32,
    pub above_gap_threshold: f32,
    pub below_gap_threshold: f32,
    /// horizontal distance at which the next obstacle counts as close
    pub obstacle_close_distance: f32,
}

impl Default for HeuristicParameter {
    fn default() -> Self {
        Self {
            enabled: true,
            ground_margin: 10.0,
            ceiling_margin: 10.0,
            above_gap_threshold: 20.0,
            below_gap_threshold: 10.0,
            obstacle_close_distance: 120.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapParameter {
    pub gap_size: i32,
    /// minimal distance of the shifted gap center from either obstacle face
    pub edge_margin: i32,
    pub offset_step: i32,
    /// minimal distance of a placed gap from the ceiling and from the ground
    pub placement_margin: i32,
}

impl GapParameter {
    /// `gap/2 - margin`; the offset stays within `[-bound, bound]`
    pub fn offset_bound(&self) -> i32 { self.gap_size / 2 - self.edge_margin }
}

impl Default for GapParameter {
    fn default() -> Self {
        Self {
            gap_size: 180,
            edge_margin: 50,
            offset_step: 1,
            placement_margin: 50,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParameter {
    pub stats_every_generations: u64,
    pub save_every_generations: u64,
    /// number of recent episode scores kept for progress lines
    pub recent_scores_window: usize,
    /// episodes get truncated after that many ticks
    pub max_ticks_per_episode: u64,
    /// fixed seed for reproducible runs; random otherwise
    pub seed: Option<u64>,
}

impl Default for TrainingParameter {
    fn default() -> Self {
        Self {
            stats_every_generations: 50,
            save_every_generations: 100,
            recent_scores_window: 100,
            max_ticks_per_episode: 1_000_000,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiAgentParameter {
    pub agents: usize,
    pub sharing_every_generations: u64,
    /// weight of each additional table while building the shared table
    pub sharing_strength: f64,
    /// weight of an agent's own values when the shared table is blended back
    pub own_weight: f64,
    /// agent `i` explores with `𝜀·(1 + i·epsilon_spread)`
    pub epsilon_spread: f64,
    /// agent `i` learns with `𝛼·(1 + i·learning_rate_spread)`
    pub learning_rate_spread: f64,
}

impl Default for MultiAgentParameter {
    fn default() -> Self {
        Self {
            agents: 4,
            sharing_every_generations: 10,
            sharing_strength: 0.1,
            own_weight: 0.7,
            epsilon_spread: 0.1,
            learning_rate_spread: 0.05,
        }
    }
}

/// Where durable state lives
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
}

impl StoragePaths {
    pub fn q_table_file(&self) -> PathBuf { self.data_dir.join("q_table.json") }

    pub fn agent_q_table_file(
        &self,
        agent: usize,
    ) -> PathBuf {
        self.data_dir.join(format!("q_table_agent_{}.json", agent + 1))
    }

    pub fn shared_q_table_file(&self) -> PathBuf { self.data_dir.join("q_table_shared.json") }

    pub fn neural_checkpoint_file(&self) -> PathBuf { self.data_dir.join("dqn_checkpoint.json") }

    pub fn heatmap_file(&self) -> PathBuf { self.data_dir.join("collision_heatmap.json") }

    pub fn gap_offset_file(&self) -> PathBuf { self.data_dir.join("adaptive_gap_offset.json") }

    pub fn best_score_file(&self) -> PathBuf { self.data_dir.join("best_score.json") }
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("data") }
    }
}
