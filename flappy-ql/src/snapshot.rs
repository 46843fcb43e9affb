use std::fmt::{Display, Formatter};

use anyhow::Result;

use ql::prelude::{Action, DebugVisualizer, Environment, ModelActionType, QlError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlapAction {
    Wait,
    Flap,
}

impl Display for FlapAction {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            FlapAction::Wait => write!(f, "Wait"),
            FlapAction::Flap => write!(f, "Flap"),
        }
    }
}

impl Action for FlapAction {
    const ACTION_SPACE: ModelActionType = 2;

    fn numeric(&self) -> ModelActionType {
        match self {
            FlapAction::Wait => 0,
            FlapAction::Flap => 1,
        }
    }

    fn try_from_numeric(value: ModelActionType) -> Result<Self> {
        match value {
            0 => Ok(FlapAction::Wait),
            1 => Ok(FlapAction::Flap),
            _ => Err(QlError(format!("value out of range: {}", value)).into()),
        }
    }
}

impl FlapAction {
    /// column of this action in a Q-value pair
    pub fn index(&self) -> usize { self.numeric() as usize }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Avatar {
    pub x: f32,
    /// vertical center; y grows downwards
    pub y: f32,
    /// px per tick, positive = descending
    pub velocity: f32,
    pub half_height: f32,
    /// avatar was clamped at the ceiling during the last tick
    pub touched_ceiling: bool,
}

impl Avatar {
    pub fn top(&self) -> f32 { self.y - self.half_height }

    pub fn bottom(&self) -> f32 { self.y + self.half_height }
}

/// A vertical obstacle pair with an open gap between `gap_top` and `gap_bottom`.
#[derive(Clone, Debug, PartialEq)]
pub struct Obstacle {
    /// left edge
    pub x: f32,
    pub width: f32,
    pub gap_top: f32,
    pub gap_bottom: f32,
}

impl Obstacle {
    pub fn gap_midpoint(&self) -> f32 { (self.gap_top + self.gap_bottom) / 2.0 }
}

/// Which body of an obstacle pair was hit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Face {
    /// body above the gap
    Upper,
    /// body below the gap
    Lower,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Collision {
    pub face: Face,
    pub avatar_top: f32,
    pub avatar_bottom: f32,
    pub obstacle: Obstacle,
}

/// Read-only view of the game world after a tick.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub avatar: Avatar,
    pub obstacles: Vec<Obstacle>,
    pub score: u32,
    pub terminal: bool,
    /// set on the tick the avatar hit an obstacle
    pub collision: Option<Collision>,
}

impl Snapshot {
    /// Nearest obstacle the avatar has not fully passed yet
    pub fn next_obstacle(&self) -> Option<&Obstacle> {
        self.obstacles.iter().find(|o| o.x + o.width >= self.avatar.x)
    }

    /// Gap center of the next obstacle, shifted by the adaptive offset.
    pub fn gap_center(
        &self,
        gap_offset: i32,
    ) -> Option<f32> {
        self.next_obstacle().map(|o| o.gap_midpoint() + gap_offset as f32)
    }
}

impl DebugVisualizer for Snapshot {
    fn one_line_info(&self) -> String {
        let obstacle = match self.next_obstacle() {
            Some(o) => format!("x: {:.0}, gap: {:.0}..{:.0}", o.x, o.gap_top, o.gap_bottom),
            None => "none".to_string(),
        };
        format!(
            "Snapshot: avatar (y: {:.1}, v: {:.1}), next obstacle ({}), score: {}{}",
            self.avatar.y,
            self.avatar.velocity,
            obstacle,
            self.score,
            if self.terminal { ", terminal" } else { "" }
        )
    }
}

/// Game environment the learner plays in.
///
/// Besides the plain stepping contract it accepts the adaptive gap offset, which a
/// cooperating environment may use to shift where new gaps are placed.
pub trait FlappyEnvironment: Environment<S = Snapshot, A = FlapAction> {
    fn set_gap_offset(
        &mut self,
        offset: i32,
    );
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn avatar(
        y: f32,
        velocity: f32,
    ) -> Avatar {
        Avatar {
            x: 50.0,
            y,
            velocity,
            half_height: 12.0,
            touched_ceiling: false,
        }
    }

    pub fn obstacle(
        x: f32,
        gap_top: f32,
    ) -> Obstacle {
        Obstacle {
            x,
            width: 52.0,
            gap_top,
            gap_bottom: gap_top + 180.0,
        }
    }

    pub fn snapshot(
        avatar: Avatar,
        obstacles: Vec<Obstacle>,
    ) -> Snapshot {
        Snapshot {
            avatar,
            obstacles,
            score: 0,
            terminal: false,
            collision: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_action_numeric_round_trip() -> Result<()> {
        for a in [FlapAction::Wait, FlapAction::Flap] {
            assert_eq!(FlapAction::try_from_numeric(a.numeric())?, a);
        }
        assert!(FlapAction::try_from_numeric(2).is_err());
        Ok(())
    }

    #[test]
    fn test_next_obstacle_skips_passed_ones() {
        let s = snapshot(avatar(300.0, 0.0), vec![obstacle(-10.0, 100.0), obstacle(200.0, 150.0)]);
        assert_eq!(s.next_obstacle().map(|o| o.x), Some(200.0));
        assert_eq!(s.gap_center(0), Some(240.0));
        assert_eq!(s.gap_center(-15), Some(225.0));
    }

    #[test]
    fn test_obstacle_overlapping_avatar_is_still_next() {
        let s = snapshot(avatar(300.0, 0.0), vec![obstacle(20.0, 100.0)]);
        assert!(s.next_obstacle().is_some());
    }

    #[test]
    fn test_no_obstacle_no_gap_center() {
        let s = snapshot(avatar(300.0, 0.0), vec![]);
        assert_eq!(s.gap_center(10), None);
    }
}
