use std::collections::BTreeMap;

use objsheet_engine::engine::{FamilyFilter, FamilyRecord, FamilyStore, MemoryStore, QFamilyId};
use tracing::debug;

/// Transaction overlay over a shared store.
///
/// Reads fall through to the base store until a family is written. Writes and
/// removals are kept here; [`TransactionCells::commit`] applies them to the
/// base, and dropping the overlay discards them.
#[derive(Debug)]
pub struct TransactionCells {
    base: MemoryStore,
    /// `None` marks a removed family.
    changes: BTreeMap<QFamilyId, Option<FamilyRecord>>,
}

impl TransactionCells {
    pub fn new(base: MemoryStore) -> Self {
        TransactionCells {
            base,
            changes: BTreeMap::new(),
        }
    }

    /// Number of families written or removed so far.
    pub fn pending(&self) -> usize {
        self.changes.len()
    }

    /// Apply the net changes to the base store.
    pub fn commit(self) -> usize {
        let count = self.changes.len();
        for (id, change) in self.changes {
            match change {
                Some(record) => self.base.set(id, record),
                None => {
                    self.base.delete(&id);
                }
            }
        }
        debug!(families = count, "committed transaction overlay");
        count
    }
}

impl FamilyStore for TransactionCells {
    fn find_one(&self, id: &QFamilyId) -> Option<FamilyRecord> {
        match self.changes.get(id) {
            Some(change) => change.clone(),
            None => self.base.get(id),
        }
    }

    fn find(&self, filter: FamilyFilter<'_>) -> Vec<(QFamilyId, FamilyRecord)> {
        let mut merged: BTreeMap<QFamilyId, FamilyRecord> = self
            .base
            .select(filter)
            .into_iter()
            .filter(|(id, _)| !self.changes.contains_key(id))
            .collect();
        for (id, change) in &self.changes {
            if let Some(record) = change {
                if filter.matches(id) {
                    merged.insert(id.clone(), record.clone());
                }
            }
        }
        merged.into_iter().collect()
    }

    fn insert(&mut self, id: QFamilyId, record: FamilyRecord) {
        self.changes.insert(id, Some(record));
    }

    fn update(&mut self, id: &QFamilyId, modify: &mut dyn FnMut(&mut FamilyRecord)) -> bool {
        let Some(mut record) = self.find_one(id) else {
            return false;
        };
        modify(&mut record);
        self.changes.insert(id.clone(), Some(record));
        true
    }

    fn remove(&mut self, id: &QFamilyId) -> Option<FamilyRecord> {
        let old = self.find_one(id);
        if old.is_some() {
            self.changes.insert(id.clone(), None);
        }
        old
    }

    fn remove_where(&mut self, filter: FamilyFilter<'_>) -> usize {
        let ids: Vec<QFamilyId> = self.find(filter).into_iter().map(|(id, _)| id).collect();
        for id in &ids {
            self.changes.insert(id.clone(), None);
        }
        ids.len()
    }
}
