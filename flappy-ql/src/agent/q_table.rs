use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use ql::prelude::QlError;

use crate::config::Divisors;
use crate::persistence;
use crate::snapshot::FlapAction;
use crate::state_encoder::StateKey;

/// Q-values of both actions, indexed by [FlapAction::index]
pub type QValues = [f64; 2];

/// Sparse action-value table; states are added lazily with `[0, 0]`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QTable {
    entries: FxHashMap<StateKey, QValues>,
}

/// On-disk form of a [QTable].
///
/// Carries the key layout and the divisors the keys were bucketed with, a table is only
/// meaningful together with those.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QTableDocument {
    pub key_format: String,
    pub divisors: Divisors,
    pub entries: BTreeMap<String, QValues>,
}

impl QTable {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn contains(
        &self,
        state: &StateKey,
    ) -> bool {
        self.entries.contains_key(state)
    }

    pub fn get(
        &self,
        state: &StateKey,
    ) -> Option<&QValues> {
        self.entries.get(state)
    }

    pub fn value(
        &self,
        state: &StateKey,
        action: FlapAction,
    ) -> f64 {
        self.entries.get(state).map_or(0.0, |q| q[action.index()])
    }

    /// Entry of `state`, created with zeros on first access
    pub fn entry(
        &mut self,
        state: StateKey,
    ) -> &mut QValues {
        self.entries.entry(state).or_insert([0.0; 2])
    }

    pub fn insert(
        &mut self,
        state: StateKey,
        values: QValues,
    ) {
        self.entries.insert(state, values);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &QValues)> { self.entries.iter() }

    pub fn clear(&mut self) { self.entries.clear() }

    /// Moves this table towards `other`: `q ← (1-w)·q + w·q_other` for shared states; states
    /// only known to `other` are copied.
    pub fn blend_from(
        &mut self,
        other: &QTable,
        weight: f64,
    ) {
        for (state, other_values) in other.iter() {
            match self.entries.get_mut(state) {
                Some(values) => {
                    for (v, o) in values.iter_mut().zip(other_values) {
                        *v = (1.0 - weight) * *v + weight * o;
                    }
                }
                None => {
                    self.entries.insert(*state, *other_values);
                }
            }
        }
    }

    pub fn to_document(
        &self,
        divisors: &Divisors,
    ) -> QTableDocument {
        QTableDocument {
            key_format: StateKey::FORMAT.to_string(),
            divisors: divisors.clone(),
            entries: self.entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    /// Rejects documents written with a different key layout or different divisors.
    pub fn from_document(
        document: QTableDocument,
        divisors: &Divisors,
    ) -> Result<Self> {
        if document.key_format != StateKey::FORMAT {
            return Err(QlError(format!("unknown state key format '{}'", document.key_format)).into());
        }
        if &document.divisors != divisors {
            return Err(QlError(format!(
                "table was built with divisors {:?}, current divisors are {:?}",
                document.divisors, divisors
            ))
            .into());
        }
        let entries = document
            .entries
            .into_iter()
            .map(|(k, v)| k.parse::<StateKey>().map(|state| (state, v)))
            .collect::<Result<FxHashMap<_, _>>>()?;
        Ok(Self { entries })
    }

    pub fn save(
        &self,
        path: &Path,
        divisors: &Divisors,
    ) -> Result<()> {
        persistence::write_json(path, &self.to_document(divisors))
    }

    /// Loads a persisted table; an absent or incompatible table yields an empty one.
    pub fn load(
        path: &Path,
        divisors: &Divisors,
    ) -> Self {
        persistence::load_or_default(
            path,
            "Q-table",
            |doc: QTableDocument| QTable::from_document(doc, divisors),
            QTable::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use approx::assert_relative_eq;
    use tempfile::TempDir;

    use super::*;

    fn key(avatar_y: i32) -> StateKey {
        StateKey {
            avatar_y,
            velocity: -3,
            obstacle_x: 7,
            gap_center_y: 9,
            gap_offset: -1,
        }
    }

    #[test]
    fn test_entry_is_lazily_zero() {
        let mut table = QTable::new();
        assert_eq!(table.value(&key(1), FlapAction::Flap), 0.0);
        assert!(table.is_empty());
        assert_eq!(*table.entry(key(1)), [0.0, 0.0]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_save_load_is_bit_identical() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("q_table.json");
        let mut table = QTable::new();
        table.insert(key(1), [0.1 + 0.2, -1.0 / 3.0]);
        table.insert(key(2), [f64::MIN_POSITIVE, 123456.789012345]);
        table.insert(StateKey::NO_OBSTACLE, [-0.0, 1e-300]);
        table.save(&path, &Divisors::default())?;

        let loaded = QTable::load(&path, &Divisors::default());
        assert_eq!(loaded.len(), 3);
        for (state, values) in table.iter() {
            let restored = loaded.get(state).unwrap();
            assert_eq!(values[0].to_bits(), restored[0].to_bits());
            assert_eq!(values[1].to_bits(), restored[1].to_bits());
        }
        Ok(())
    }

    #[test]
    fn test_load_rejects_other_divisors() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("q_table.json");
        let mut table = QTable::new();
        table.insert(key(1), [1.0, 2.0]);
        table.save(&path, &Divisors::default())?;

        let divisors = Divisors {
            avatar_y: 30.0,
            ..Divisors::default()
        };
        assert!(QTable::load(&path, &divisors).is_empty());
        Ok(())
    }

    #[test]
    fn test_load_rejects_malformed_keys() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("q_table.json");
        let mut document = QTable::new().to_document(&Divisors::default());
        document.entries.insert("1,2,3".to_string(), [1.0, 2.0]);
        persistence::write_json(&path, &document)?;
        assert!(QTable::load(&path, &Divisors::default()).is_empty());

        fs::write(&path, "[1, 2")?;
        assert!(QTable::load(&path, &Divisors::default()).is_empty());
        Ok(())
    }

    #[test]
    fn test_blend_from() {
        let mut own = QTable::new();
        own.insert(key(1), [10.0, 0.0]);
        let mut other = QTable::new();
        other.insert(key(1), [0.0, 10.0]);
        other.insert(key(2), [4.0, 5.0]);

        own.blend_from(&other, 0.3);
        let blended = own.get(&key(1)).unwrap();
        assert_relative_eq!(blended[0], 7.0, epsilon = 1e-12);
        assert_relative_eq!(blended[1], 3.0, epsilon = 1e-12);
        assert_eq!(own.get(&key(2)), Some(&[4.0, 5.0]));
    }
}
