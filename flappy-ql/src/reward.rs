use crate::config::RewardParameter;
use crate::snapshot::{FlapAction, Snapshot};

/// Computes the scalar learning signal of a tick.
///
/// Keeps two bits of per-episode memory: the number of consecutive flaps and the last seen
/// score. [RewardShaper::reset] must be called at every episode start.
#[derive(Clone, Debug)]
pub struct RewardShaper {
    param: RewardParameter,
    consecutive_flaps: u32,
    last_score: u32,
}

impl RewardShaper {
    pub fn new(param: RewardParameter) -> Self {
        Self {
            param,
            consecutive_flaps: 0,
            last_score: 0,
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_flaps = 0;
        self.last_score = 0;
    }

    pub fn consecutive_flaps(&self) -> u32 { self.consecutive_flaps }

    fn distance_reward(
        &self,
        distance: f32,
    ) -> f64 {
        self.param
            .distance_bands
            .iter()
            .find(|band| distance < band.max_distance)
            .map_or(self.param.beyond_bands_reward, |band| band.reward)
    }

    /// Reward for arriving in `snapshot` after taking `action`.
    ///
    /// A terminal snapshot yields the terminal penalty alone.
    pub fn shape(
        &mut self,
        snapshot: &Snapshot,
        action: FlapAction,
        gap_offset: i32,
    ) -> f64 {
        if snapshot.terminal {
            return -self.param.terminal_penalty;
        }
        let p = &self.param;
        let avatar = &snapshot.avatar;
        let mut reward = p.survival_bonus;

        if snapshot.score > self.last_score {
            reward += p.score_bonus;
        }
        self.last_score = snapshot.score;

        let gap_center = snapshot.gap_center(gap_offset);
        if let Some(center) = gap_center {
            reward += self.distance_reward((avatar.y - center).abs());
        }

        match action {
            FlapAction::Flap => {
                self.consecutive_flaps += 1;
                reward -= p.consecutive_flap_penalty * self.consecutive_flaps as f64;
                if let Some(center) = gap_center {
                    let above = avatar.y < center - p.directional_tolerance;
                    let below = avatar.y > center + p.directional_tolerance;
                    if above && avatar.velocity > 0.0 {
                        reward -= p.flap_toward_gap_penalty;
                    } else if below && avatar.velocity >= 0.0 {
                        reward += p.flap_below_gap_reward;
                    }
                }
            }
            FlapAction::Wait => self.consecutive_flaps = 0,
        }

        if avatar.touched_ceiling {
            reward -= p.ceiling_penalty;
        }
        reward
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rstest::rstest;

    use crate::snapshot::fixtures::*;

    use super::*;

    // gap of the fixture obstacle is 150..330, center 240
    fn at(
        y: f32,
        velocity: f32,
    ) -> Snapshot {
        snapshot(avatar(y, velocity), vec![obstacle(200.0, 150.0)])
    }

    #[test]
    fn test_terminal_ignores_everything_else() {
        let mut shaper = RewardShaper::new(RewardParameter::default());
        let mut s = at(240.0, 0.0);
        s.terminal = true;
        s.score = 5;
        s.avatar.touched_ceiling = true;
        assert_eq!(shaper.shape(&s, FlapAction::Flap, 0), -100.0);
        assert_eq!(shaper.consecutive_flaps(), 0);
    }

    #[rstest]
    #[case(240.0, 2.05)]
    #[case(269.0, 2.05)]
    #[case(270.0, 1.05)]
    #[case(181.0, 1.05)]
    #[case(300.0, 0.05)]
    #[case(340.0, -0.95)]
    fn test_distance_bands(
        #[case] y: f32,
        #[case] expected: f64,
    ) {
        let mut shaper = RewardShaper::new(RewardParameter::default());
        assert_relative_eq!(shaper.shape(&at(y, 0.0), FlapAction::Wait, 0), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_distance_uses_effective_gap_center() {
        let mut shaper = RewardShaper::new(RewardParameter::default());
        assert_relative_eq!(shaper.shape(&at(280.0, 0.0), FlapAction::Wait, 0), 1.05, epsilon = 1e-9);
        assert_relative_eq!(shaper.shape(&at(280.0, 0.0), FlapAction::Wait, 40), 2.05, epsilon = 1e-9);
    }

    #[test]
    fn test_score_bonus_once_per_increase() {
        let mut shaper = RewardShaper::new(RewardParameter::default());
        let mut s = at(240.0, 0.0);
        s.score = 1;
        assert_relative_eq!(shaper.shape(&s, FlapAction::Wait, 0), 12.05, epsilon = 1e-9);
        assert_relative_eq!(shaper.shape(&s, FlapAction::Wait, 0), 2.05, epsilon = 1e-9);
        shaper.reset();
        assert_relative_eq!(shaper.shape(&s, FlapAction::Wait, 0), 12.05, epsilon = 1e-9);
    }

    #[test]
    fn test_consecutive_flap_penalty_grows_and_resets() {
        let mut shaper = RewardShaper::new(RewardParameter::default());
        let s = at(240.0, 0.0);
        let r1 = shaper.shape(&s, FlapAction::Flap, 0);
        let r2 = shaper.shape(&s, FlapAction::Flap, 0);
        let r3 = shaper.shape(&s, FlapAction::Flap, 0);
        assert_relative_eq!(r1, 1.95, epsilon = 1e-9);
        assert_relative_eq!(r2, 1.85, epsilon = 1e-9);
        assert_relative_eq!(r3, 1.75, epsilon = 1e-9);
        shaper.shape(&s, FlapAction::Wait, 0);
        assert_eq!(shaper.consecutive_flaps(), 0);
        assert_relative_eq!(shaper.shape(&s, FlapAction::Flap, 0), 1.95, epsilon = 1e-9);
    }

    #[rstest]
    // above the gap, descending towards it
    #[case(200.0, 3.0, 1.0 - 0.1 + 0.05 - 0.5)]
    // above the gap, rising
    #[case(200.0, -3.0, 1.0 - 0.1 + 0.05)]
    // below the gap, falling further
    #[case(280.0, 2.0, 1.0 - 0.1 + 0.05 + 0.3)]
    // below the gap, already rising
    #[case(280.0, -6.0, 1.0 - 0.1 + 0.05)]
    // within tolerance
    #[case(255.0, 4.0, 2.0 - 0.1 + 0.05)]
    fn test_directional_flap_term(
        #[case] y: f32,
        #[case] velocity: f32,
        #[case] expected: f64,
    ) {
        let mut shaper = RewardShaper::new(RewardParameter::default());
        assert_relative_eq!(shaper.shape(&at(y, velocity), FlapAction::Flap, 0), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_ceiling_penalty() {
        let mut shaper = RewardShaper::new(RewardParameter::default());
        let mut s = snapshot(avatar(12.0, 0.0), vec![]);
        assert_relative_eq!(shaper.shape(&s, FlapAction::Wait, 0), 0.05, epsilon = 1e-9);
        s.avatar.touched_ceiling = true;
        assert_relative_eq!(shaper.shape(&s, FlapAction::Wait, 0), -4.95, epsilon = 1e-9);
    }
}
