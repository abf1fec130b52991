//! The family record store.
//!
//! Every family, stored or computed, is one [`FamilyRecord`] keyed by
//! [`QFamilyId`]. A record with neither values nor an error is a placeholder
//! for a family whose evaluation is in progress.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::value::{ColumnId, QFamilyId, Value};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyRecord {
    pub values: Option<BTreeSet<Value>>,
    pub error: Option<String>,
    /// Blank rows requested by an editing surface.
    pub num_placeholders: u32,
}

impl FamilyRecord {
    pub fn placeholder() -> Self {
        FamilyRecord::default()
    }

    pub fn with_values(values: BTreeSet<Value>) -> Self {
        FamilyRecord {
            values: Some(values),
            ..FamilyRecord::default()
        }
    }

    pub fn with_error(message: impl Into<String>) -> Self {
        FamilyRecord {
            error: Some(message.into()),
            ..FamilyRecord::default()
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.values.is_none() && self.error.is_none()
    }

    /// Values of the family, treating errors and placeholders as empty.
    pub fn values_or_empty(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyFilter<'a> {
    All,
    Column(&'a ColumnId),
}

impl FamilyFilter<'_> {
    pub fn matches(&self, id: &QFamilyId) -> bool {
        match self {
            FamilyFilter::All => true,
            FamilyFilter::Column(c) => id.column == **c,
        }
    }
}

/// Keyed record store of families.
pub trait FamilyStore {
    fn find_one(&self, id: &QFamilyId) -> Option<FamilyRecord>;

    /// Matching records, ordered by id.
    fn find(&self, filter: FamilyFilter<'_>) -> Vec<(QFamilyId, FamilyRecord)>;

    fn insert(&mut self, id: QFamilyId, record: FamilyRecord);

    /// Modify an existing record in place. Returns false if there is none.
    fn update(&mut self, id: &QFamilyId, modify: &mut dyn FnMut(&mut FamilyRecord)) -> bool;

    fn remove(&mut self, id: &QFamilyId) -> Option<FamilyRecord>;

    fn remove_where(&mut self, filter: FamilyFilter<'_>) -> usize;

    /// Modify a record, first creating it with an empty value set if absent.
    fn upsert(&mut self, id: &QFamilyId, modify: &mut dyn FnMut(&mut FamilyRecord)) {
        if !self.update(id, modify) {
            let mut record = FamilyRecord::with_values(BTreeSet::new());
            modify(&mut record);
            self.insert(id.clone(), record);
        }
    }
}

/// Shared in-memory store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    families: Arc<DashMap<QFamilyId, FamilyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &QFamilyId) -> Option<FamilyRecord> {
        self.families.get(id).map(|r| r.value().clone())
    }

    pub fn set(&self, id: QFamilyId, record: FamilyRecord) {
        self.families.insert(id, record);
    }

    pub fn delete(&self, id: &QFamilyId) -> Option<FamilyRecord> {
        self.families.remove(id).map(|(_, r)| r)
    }

    pub fn modify(&self, id: &QFamilyId, modify: &mut dyn FnMut(&mut FamilyRecord)) -> bool {
        match self.families.get_mut(id) {
            Some(mut entry) => {
                modify(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn select(&self, filter: FamilyFilter<'_>) -> Vec<(QFamilyId, FamilyRecord)> {
        let mut out: Vec<(QFamilyId, FamilyRecord)> = self
            .families
            .iter()
            .filter(|e| filter.matches(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn delete_where(&self, filter: FamilyFilter<'_>) -> usize {
        let before = self.families.len();
        self.families.retain(|k, _| !filter.matches(k));
        before - self.families.len()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// A sorted copy of every record.
    pub fn snapshot(&self) -> Vec<(QFamilyId, FamilyRecord)> {
        self.select(FamilyFilter::All)
    }
}

impl FamilyStore for MemoryStore {
    fn find_one(&self, id: &QFamilyId) -> Option<FamilyRecord> {
        self.get(id)
    }

    fn find(&self, filter: FamilyFilter<'_>) -> Vec<(QFamilyId, FamilyRecord)> {
        self.select(filter)
    }

    fn insert(&mut self, id: QFamilyId, record: FamilyRecord) {
        self.set(id, record);
    }

    fn update(&mut self, id: &QFamilyId, modify: &mut dyn FnMut(&mut FamilyRecord)) -> bool {
        self.modify(id, modify)
    }

    fn remove(&mut self, id: &QFamilyId) -> Option<FamilyRecord> {
        self.delete(id)
    }

    fn remove_where(&mut self, filter: FamilyFilter<'_>) -> usize {
        self.delete_where(filter)
    }
}
