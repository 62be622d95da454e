use std::collections::HashMap;

use govscout_adapters::identity_key;
use govscout_core::QueryStrategy;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupInsert {
    Inserted,
    Duplicate,
    /// Neither a notice id nor a source url; the record cannot be keyed.
    MissingIdentity,
}

#[derive(Debug, Clone)]
struct Entry {
    strategy: QueryStrategy,
    seq: usize,
    record: JsonValue,
}

/// One record per identity key. The record kept for a key is the one from
/// the earliest strategy in enumeration order, then the earliest fetched,
/// regardless of the order records arrive in.
#[derive(Debug, Default)]
pub struct Deduplicator {
    entries: HashMap<String, Entry>,
    seq: usize,
    seen: u64,
    duplicates: u64,
    malformed: u64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, strategy: QueryStrategy, record: JsonValue) -> DedupInsert {
        self.seen += 1;
        let Some(key) = identity_key(&record) else {
            self.malformed += 1;
            return DedupInsert::MissingIdentity;
        };
        self.seq += 1;
        let entry = Entry {
            strategy,
            seq: self.seq,
            record,
        };
        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(key, entry);
                DedupInsert::Inserted
            }
            Some(existing) => {
                self.duplicates += 1;
                if strategy < existing.strategy {
                    *existing = entry;
                }
                DedupInsert::Duplicate
            }
        }
    }

    pub fn extend(&mut self, strategy: QueryStrategy, records: impl IntoIterator<Item = JsonValue>) {
        for record in records {
            self.insert(strategy, record);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records offered, including duplicates and unkeyable ones.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Unique records with their attributed strategy, in strategy then fetch
    /// order.
    pub fn into_records(self) -> Vec<(QueryStrategy, JsonValue)> {
        let mut entries: Vec<Entry> = self.entries.into_values().collect();
        entries.sort_by_key(|entry| (entry.strategy, entry.seq));
        entries
            .into_iter()
            .map(|entry| (entry.strategy, entry.record))
            .collect()
    }
}
