use std::fmt::{Display, Formatter};

use crate::config::{Geometry, HeuristicParameter};
use crate::snapshot::{FlapAction, Snapshot};

/// Safety rules that take precedence over the learned policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OverrideRule {
    /// avatar about to touch the ground
    GroundGuard,
    /// avatar about to touch the ceiling
    CeilingGuard,
    /// far above the gap and falling already
    AboveGapDescending,
    /// below the gap with an obstacle close ahead
    BelowGapObstacleClose,
}

impl OverrideRule {
    pub fn action(&self) -> FlapAction {
        match self {
            OverrideRule::GroundGuard | OverrideRule::BelowGapObstacleClose => FlapAction::Flap,
            OverrideRule::CeilingGuard | OverrideRule::AboveGapDescending => FlapAction::Wait,
        }
    }
}

impl Display for OverrideRule {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        let name = match self {
            OverrideRule::GroundGuard => "ground",
            OverrideRule::CeilingGuard => "ceiling",
            OverrideRule::AboveGapDescending => "above-gap",
            OverrideRule::BelowGapObstacleClose => "below-gap",
        };
        f.write_str(name)
    }
}

/// Decides whether a hard rule pre-empts the agent in the current snapshot.
#[derive(Clone, Debug)]
pub struct HeuristicOverride {
    param: HeuristicParameter,
    floor_y: f32,
}

impl HeuristicOverride {
    pub fn new(
        param: HeuristicParameter,
        geometry: &Geometry,
    ) -> Self {
        Self {
            param,
            floor_y: geometry.floor_y(),
        }
    }

    /// First matching rule in priority order, `None` if the agent may decide.
    pub fn check(
        &self,
        snapshot: &Snapshot,
        gap_offset: i32,
    ) -> Option<OverrideRule> {
        if !self.param.enabled {
            return None;
        }
        let p = &self.param;
        let avatar = &snapshot.avatar;
        if avatar.bottom() > self.floor_y - p.ground_margin {
            return Some(OverrideRule::GroundGuard);
        }
        if avatar.top() < p.ceiling_margin {
            return Some(OverrideRule::CeilingGuard);
        }
        let obstacle = snapshot.next_obstacle()?;
        let gap_center = obstacle.gap_midpoint() + gap_offset as f32;
        if avatar.y < gap_center - p.above_gap_threshold && avatar.velocity > 0.0 {
            return Some(OverrideRule::AboveGapDescending);
        }
        if avatar.y > gap_center + p.below_gap_threshold && obstacle.x - avatar.x < p.obstacle_close_distance {
            return Some(OverrideRule::BelowGapObstacleClose);
        }
        None
    }
}
