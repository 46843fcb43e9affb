use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::Result;

use ql::prelude::QlError;

use crate::config::{Divisors, Geometry};
use crate::snapshot::Snapshot;

/// Number of network input features
pub const FEATURES: usize = 6;

/// Normalized network input; see [StateEncoder::encode]
pub type FeatureVector = [f32; FEATURES];

/// Discretized game state of the tabular agent.
///
/// Every component is `floor(value / divisor)` of the corresponding raw quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub avatar_y: i32,
    pub velocity: i32,
    /// horizontal distance from the avatar to the next obstacle
    pub obstacle_x: i32,
    pub gap_center_y: i32,
    /// signed vertical offset of the avatar from the gap center
    pub gap_offset: i32,
}

impl StateKey {
    /// Key used for every state without an obstacle ahead
    pub const NO_OBSTACLE: StateKey = StateKey {
        avatar_y: 0,
        velocity: 0,
        obstacle_x: 0,
        gap_center_y: 0,
        gap_offset: 0,
    };

    /// Identifies the textual key layout of persisted tables
    pub const FORMAT: &'static str = "v1:avatar_y,velocity,obstacle_x,gap_center_y,gap_offset";
}

impl Display for StateKey {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.avatar_y, self.velocity, self.obstacle_x, self.gap_center_y, self.gap_offset
        )
    }
}

impl FromStr for StateKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split(',')
            .map(|p| p.parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QlError(format!("malformed state key '{}': {}", s, e)))?;
        match parts[..] {
            [avatar_y, velocity, obstacle_x, gap_center_y, gap_offset] => Ok(StateKey {
                avatar_y,
                velocity,
                obstacle_x,
                gap_center_y,
                gap_offset,
            }),
            _ => Err(QlError(format!("state key '{}' must have exactly 5 components", s)).into()),
        }
    }
}

fn bucket(
    value: f32,
    divisor: f32,
) -> i32 {
    (value / divisor).floor() as i32
}

/// Turns a [Snapshot] into the representation the agents learn on.
///
/// Both encodings use the *effective* gap center: gap midpoint plus the adaptive offset.
#[derive(Clone, Debug)]
pub struct StateEncoder {
    geometry: Geometry,
    divisors: Divisors,
    velocity_scale: f32,
}

impl StateEncoder {
    pub fn new(
        geometry: Geometry,
        divisors: Divisors,
        velocity_scale: f32,
    ) -> Self {
        Self {
            geometry,
            divisors,
            velocity_scale,
        }
    }

    pub fn divisors(&self) -> &Divisors { &self.divisors }

    pub fn discretize(
        &self,
        snapshot: &Snapshot,
        gap_offset: i32,
    ) -> StateKey {
        let (obstacle, gap_center) = match (snapshot.next_obstacle(), snapshot.gap_center(gap_offset)) {
            (Some(o), Some(c)) => (o, c),
            _ => return StateKey::NO_OBSTACLE,
        };
        let d = &self.divisors;
        let avatar = &snapshot.avatar;
        StateKey {
            avatar_y: bucket(avatar.y, d.avatar_y),
            velocity: bucket(avatar.velocity, d.velocity),
            obstacle_x: bucket(obstacle.x - avatar.x, d.obstacle_x),
            gap_center_y: bucket(gap_center, d.gap_center_y),
            gap_offset: bucket(avatar.y - gap_center, d.gap_offset),
        }
    }

    /// Six features, each bounded:
    /// 0. avatar height `y/H` in `[0,1]`
    /// 1. velocity in `[-1,1]`
    /// 2. horizontal distance to the next obstacle `/W` in `[0,1]`, `1` without obstacle
    /// 3. gap center `/H`, `0.5` without obstacle
    /// 4. vertical offset from the gap center `/(H/2)` in `[-1,1]`, `0` without obstacle
    /// 5. obstacle presence flag
    pub fn encode(
        &self,
        snapshot: &Snapshot,
        gap_offset: i32,
    ) -> FeatureVector {
        let height = self.geometry.screen_height;
        let avatar = &snapshot.avatar;
        let y = (avatar.y / height).clamp(0.0, 1.0);
        let velocity = (avatar.velocity / self.velocity_scale).clamp(-1.0, 1.0);
        match (snapshot.next_obstacle(), snapshot.gap_center(gap_offset)) {
            (Some(obstacle), Some(gap_center)) => [
                y,
                velocity,
                ((obstacle.x - avatar.x) / self.geometry.screen_width).clamp(0.0, 1.0),
                (gap_center / height).clamp(0.0, 1.0),
                ((avatar.y - gap_center) / (height / 2.0)).clamp(-1.0, 1.0),
                1.0,
            ],
            _ => [y, velocity, 1.0, 0.5, 0.0, 0.0],
        }
    }
}
