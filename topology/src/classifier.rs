// Copyright (c) 2024 Botho Foundation

//! Per-batch classification and deduplication.
//!
//! Events are keyed by element identity only, never by origin, so that a
//! transient ADD from one instance and the matching REMOVE from another
//! cancel out.

use crate::{
    event::{ElementKind, EventEntry, TopologyEvent},
    ids::ElementKey,
};
use std::collections::BTreeMap;

type KindTable = BTreeMap<ElementKind, BTreeMap<ElementKey, TopologyEvent>>;

/// The net outcome of a batch: at most one ADD or REMOVE per identity.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClassifiedBatch {
    added: KindTable,
    removed: KindTable,
}

impl ClassifiedBatch {
    /// Record one entry; a later entry for the same identity replaces an
    /// earlier one of either action.
    pub fn push(&mut self, entry: EventEntry) {
        let kind = entry.event.kind();
        let key = entry.event.key();
        let (insert, erase) = if entry.is_add() {
            (&mut self.added, &mut self.removed)
        } else {
            (&mut self.removed, &mut self.added)
        };
        if let Some(table) = erase.get_mut(&kind) {
            table.remove(&key);
        }
        insert.entry(kind).or_default().insert(key, entry.event);
    }

    /// Net ADDs of `kind`, ordered by identity.
    pub fn added(&self, kind: ElementKind) -> impl Iterator<Item = &TopologyEvent> {
        self.added.get(&kind).into_iter().flat_map(|t| t.values())
    }

    /// Net REMOVEs of `kind`, ordered by identity.
    pub fn removed(&self, kind: ElementKind) -> impl Iterator<Item = &TopologyEvent> {
        self.removed.get(&kind).into_iter().flat_map(|t| t.values())
    }

    /// Identities with a net outcome, of any kind.
    pub fn keys(&self) -> impl Iterator<Item = &ElementKey> {
        self.added
            .values()
            .chain(self.removed.values())
            .flat_map(|t| t.keys())
    }

    /// Number of net events.
    pub fn len(&self) -> usize {
        self.added
            .values()
            .chain(self.removed.values())
            .map(BTreeMap::len)
            .sum()
    }

    /// Whether the batch nets to nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<EventEntry> for ClassifiedBatch {
    fn from_iter<I: IntoIterator<Item = EventEntry>>(iter: I) -> Self {
        let mut batch = Self::default();
        for entry in iter {
            batch.push(entry);
        }
        batch
    }
}

/// Classify a batch of admitted entries.
pub fn classify(entries: impl IntoIterator<Item = EventEntry>) -> ClassifiedBatch {
    entries.into_iter().collect()
}
