use std::ops::Range;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use ql::prelude::QlError;

use crate::config::{GapParameter, Geometry};
use crate::persistence;
use crate::snapshot::{Collision, Face};

/// Per pixel row collision counters, kept separately for the two obstacle faces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollisionHeatmap {
    upper: Vec<u64>,
    lower: Vec<u64>,
}

impl CollisionHeatmap {
    pub fn new(rows: usize) -> Self {
        Self {
            upper: vec![0; rows],
            lower: vec![0; rows],
        }
    }

    pub fn rows(&self) -> usize { self.upper.len() }

    pub fn counts(
        &self,
        face: Face,
    ) -> &[u64] {
        match face {
            Face::Upper => &self.upper,
            Face::Lower => &self.lower,
        }
    }

    pub fn total(
        &self,
        face: Face,
    ) -> u64 {
        self.counts(face).iter().sum()
    }

    /// Increments every row in `rows`; rows outside the screen are ignored.
    pub fn record(
        &mut self,
        face: Face,
        rows: Range<usize>,
    ) {
        let counts = match face {
            Face::Upper => &mut self.upper,
            Face::Lower => &mut self.lower,
        };
        let end = rows.end.min(counts.len());
        let start = rows.start.min(end);
        for c in &mut counts[start..end] {
            *c += 1;
        }
    }

    pub fn reset(&mut self) {
        self.upper.iter_mut().for_each(|c| *c = 0);
        self.lower.iter_mut().for_each(|c| *c = 0);
    }
}

/// Signed vertical shift of the targeted gap center, bounded to `[-bound, bound]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdaptiveGapOffset {
    value: i32,
    bound: i32,
}

impl AdaptiveGapOffset {
    pub fn new(bound: i32) -> Self {
        Self::with_value(0, bound)
    }

    /// clamps `value` into the bounds
    pub fn with_value(
        value: i32,
        bound: i32,
    ) -> Self {
        debug_assert!(bound >= 0);
        Self {
            value: value.clamp(-bound, bound),
            bound,
        }
    }

    pub fn value(&self) -> i32 { self.value }

    pub fn bound(&self) -> i32 { self.bound }

    /// Moves the offset by `step` away from the face that was hit (towards higher y after an
    /// upper face hit).
    pub fn nudge_away_from(
        &mut self,
        face: Face,
        step: i32,
    ) {
        let delta = match face {
            Face::Upper => step,
            Face::Lower => -step,
        };
        self.value = (self.value + delta).clamp(-self.bound, self.bound);
    }
}

#[derive(Serialize, Deserialize)]
struct OffsetDocument {
    offset: i32,
}

/// Learns from collisions where the agent should aim inside a gap.
///
/// Every obstacle hit is counted in the [CollisionHeatmap] and nudges the [AdaptiveGapOffset]
/// one step away from the face that was hit.
#[derive(Clone, Debug)]
pub struct AdaptiveGapCalibrator {
    heatmap: CollisionHeatmap,
    offset: AdaptiveGapOffset,
    step: i32,
    floor_y: f32,
}

impl AdaptiveGapCalibrator {
    pub fn new(
        geometry: &Geometry,
        gap: &GapParameter,
    ) -> Self {
        Self {
            heatmap: CollisionHeatmap::new(geometry.rows()),
            offset: AdaptiveGapOffset::new(gap.offset_bound()),
            step: gap.offset_step,
            floor_y: geometry.floor_y(),
        }
    }

    /// Restores heatmap and offset; each part falls back to its zero state independently when
    /// absent or unusable.
    pub fn load(
        geometry: &Geometry,
        gap: &GapParameter,
        heatmap_file: &Path,
        offset_file: &Path,
    ) -> Self {
        let mut calibrator = Self::new(geometry, gap);
        let rows = calibrator.heatmap.rows();
        calibrator.heatmap = persistence::load_or_default(
            heatmap_file,
            "collision heatmap",
            |heatmap: CollisionHeatmap| -> Result<CollisionHeatmap> {
                if heatmap.upper.len() != rows || heatmap.lower.len() != rows {
                    return Err(QlError(format!(
                        "heatmap has {}/{} rows, expected {}",
                        heatmap.upper.len(),
                        heatmap.lower.len(),
                        rows
                    ))
                    .into());
                }
                Ok(heatmap)
            },
            calibrator.heatmap.clone(),
        );
        let bound = calibrator.offset.bound();
        calibrator.offset = persistence::load_or_default(
            offset_file,
            "gap offset",
            |doc: OffsetDocument| {
                if doc.offset.abs() > bound {
                    log::warn!("persisted gap offset {} exceeds bound {}, clamping", doc.offset, bound);
                }
                Ok(AdaptiveGapOffset::with_value(doc.offset, bound))
            },
            calibrator.offset,
        );
        calibrator
    }

    pub fn save(
        &self,
        heatmap_file: &Path,
        offset_file: &Path,
    ) {
        persistence::save_best_effort(heatmap_file, "collision heatmap", &self.heatmap);
        persistence::save_best_effort(
            offset_file,
            "gap offset",
            &OffsetDocument {
                offset: self.offset.value(),
            },
        );
    }

    pub fn heatmap(&self) -> &CollisionHeatmap { &self.heatmap }

    pub fn offset(&self) -> i32 { self.offset.value() }

    pub fn offset_bound(&self) -> i32 { self.offset.bound() }

    /// Rows covered by both the avatar and the body of the face that was hit
    fn collision_rows(
        &self,
        collision: &Collision,
    ) -> Range<usize> {
        let (body_top, body_bottom) = match collision.face {
            Face::Upper => (0.0, collision.obstacle.gap_top),
            Face::Lower => (collision.obstacle.gap_bottom, self.floor_y),
        };
        let top = collision.avatar_top.max(body_top).max(0.0);
        let bottom = collision.avatar_bottom.min(body_bottom).max(0.0);
        top.floor() as usize..bottom.ceil() as usize
    }

    pub fn record_collision(
        &mut self,
        collision: &Collision,
    ) {
        let rows = self.collision_rows(collision);
        self.heatmap.record(collision.face, rows.clone());
        self.offset.nudge_away_from(collision.face, self.step);
        log::debug!(
            "{:?} face collision at rows {:?}, gap offset now {}",
            collision.face,
            rows,
            self.offset.value()
        );
    }

    /// Clears the heatmap; the offset stays where it is.
    pub fn reset_heatmap(&mut self) {
        self.heatmap.reset();
        log::info!("collision heatmap reset");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::snapshot::fixtures::obstacle;

    use super::*;

    fn calibrator() -> AdaptiveGapCalibrator { AdaptiveGapCalibrator::new(&Geometry::default(), &GapParameter::default()) }

    fn collision(
        face: Face,
        avatar_y: f32,
    ) -> Collision {
        Collision {
            face,
            avatar_top: avatar_y - 12.0,
            avatar_bottom: avatar_y + 12.0,
            obstacle: obstacle(40.0, 150.0),
        }
    }

    #[test]
    fn test_upper_hits_saturate_at_bound() {
        let mut c = calibrator();
        for _ in 0..100 {
            c.record_collision(&collision(Face::Upper, 155.0));
        }
        assert_eq!(c.offset(), 40);
        assert_eq!(c.heatmap().total(Face::Lower), 0);
        assert!(c.heatmap().counts(Face::Upper)[145] == 100);
    }

    #[test]
    fn test_lower_hits_move_offset_up() {
        let mut c = calibrator();
        for _ in 0..5 {
            c.record_collision(&collision(Face::Lower, 325.0));
        }
        assert_eq!(c.offset(), -5);
        c.record_collision(&collision(Face::Upper, 155.0));
        assert_eq!(c.offset(), -4);
    }

    #[test]
    fn test_only_overlapping_rows_are_counted() {
        let mut c = calibrator();
        // avatar 143..167, upper body ends at 150
        c.record_collision(&collision(Face::Upper, 155.0));
        let upper = c.heatmap().counts(Face::Upper);
        assert_eq!(upper[142], 0);
        assert!(upper[143..150].iter().all(|&v| v == 1));
        assert_eq!(upper[150], 0);
        // avatar 313..337, lower body starts at 330
        c.record_collision(&collision(Face::Lower, 325.0));
        let lower = c.heatmap().counts(Face::Lower);
        assert_eq!(lower[329], 0);
        assert!(lower[330..337].iter().all(|&v| v == 1));
        assert_eq!(lower[337], 0);
    }

    #[test]
    fn test_heatmap_ignores_rows_out_of_screen() {
        let mut h = CollisionHeatmap::new(10);
        h.record(Face::Lower, 8..20);
        h.record(Face::Upper, 30..40);
        assert_eq!(h.total(Face::Lower), 2);
        assert_eq!(h.total(Face::Upper), 0);
    }

    #[test]
    fn test_reset_heatmap_keeps_offset() {
        let mut c = calibrator();
        c.record_collision(&collision(Face::Upper, 155.0));
        c.reset_heatmap();
        assert_eq!(c.heatmap().total(Face::Upper), 0);
        assert_eq!(c.offset(), 1);
    }

    #[test]
    fn test_persistence_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let (heatmap_file, offset_file) = (dir.path().join("heatmap.json"), dir.path().join("offset.json"));
        let mut c = calibrator();
        for _ in 0..3 {
            c.record_collision(&collision(Face::Lower, 325.0));
        }
        c.save(&heatmap_file, &offset_file);

        let restored =
            AdaptiveGapCalibrator::load(&Geometry::default(), &GapParameter::default(), &heatmap_file, &offset_file);
        assert_eq!(restored.offset(), -3);
        assert_eq!(restored.heatmap(), c.heatmap());
        Ok(())
    }

    #[test]
    fn test_load_clamps_offset_and_rejects_foreign_heatmap() -> Result<()> {
        let dir = TempDir::new()?;
        let (heatmap_file, offset_file) = (dir.path().join("heatmap.json"), dir.path().join("offset.json"));
        persistence::write_json(&heatmap_file, &CollisionHeatmap::new(17))?;
        persistence::write_json(&offset_file, &OffsetDocument { offset: 90 })?;

        let restored =
            AdaptiveGapCalibrator::load(&Geometry::default(), &GapParameter::default(), &heatmap_file, &offset_file);
        assert_eq!(restored.offset(), 40);
        assert_eq!(restored.heatmap().rows(), 600);
        Ok(())
    }

    #[test]
    fn test_load_without_files_starts_at_zero() -> Result<()> {
        let dir = TempDir::new()?;
        let restored = AdaptiveGapCalibrator::load(
            &Geometry::default(),
            &GapParameter::default(),
            &dir.path().join("a.json"),
            &dir.path().join("b.json"),
        );
        assert_eq!(restored.offset(), 0);
        assert_eq!(restored.heatmap().total(Face::Upper) + restored.heatmap().total(Face::Lower), 0);
        Ok(())
    }
}
