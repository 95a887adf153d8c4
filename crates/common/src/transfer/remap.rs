//! Identifier remap table

use std::collections::BTreeMap;

use super::report::RemapPair;
use crate::errors::{AppError, Result};
use crate::snapshot::EntityId;

/// Old id to new id for one materialization run
///
/// Entries are only ever added. Recording the same pair twice is a no-op;
/// recording a different new id for a known old id is a `RemapConflict`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapTable {
    entries: BTreeMap<EntityId, EntityId>,
}

impl RemapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, old: EntityId, new: EntityId) -> Result<()> {
        match self.entries.get(&old) {
            Some(existing) if *existing == new => Ok(()),
            Some(existing) => Err(AppError::RemapConflict {
                old_id: old.0,
                existing: existing.0,
                attempted: new.0,
            }),
            None => {
                self.entries.insert(old, new);
                Ok(())
            }
        }
    }

    pub fn get(&self, old: EntityId) -> Option<EntityId> {
        self.entries.get(&old).copied()
    }

    /// Lookup by raw numeric value
    pub fn get_raw(&self, old: u64) -> Option<u64> {
        self.get(EntityId(old)).map(|id| id.0)
    }

    pub fn contains(&self, old: EntityId) -> bool {
        self.entries.contains_key(&old)
    }

    /// Pairs in ascending old-id order
    pub fn pairs(&self) -> impl Iterator<Item = (EntityId, EntityId)> + '_ {
        self.entries.iter().map(|(old, new)| (*old, *new))
    }

    pub fn new_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entries.values().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_pairs(&self) -> Vec<RemapPair> {
        self.pairs()
            .map(|(old_id, new_id)| RemapPair { old_id, new_id })
            .collect()
    }
}
