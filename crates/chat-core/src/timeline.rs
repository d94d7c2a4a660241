use std::collections::HashMap;

use thiserror::Error;

use crate::types::{PendingMessage, StoredEntry, TimelineItem};

/// Errors that can occur while updating a store in place.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An update referenced a key that is not present in the store.
    #[error("store entry with key '{0}' was not found")]
    MissingEntry(String),
}

/// Values that can live in an [`OrderedStore`].
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for StoredEntry {
    fn key(&self) -> &str {
        self.id()
    }
}

impl Keyed for PendingMessage {
    fn key(&self) -> &str {
        &self.correlation_id
    }
}

/// Insertion-ordered store with an index from key to position.
///
/// Re-inserting an existing key replaces the value where it already sits, so
/// arrival order is the order of first insertion.
#[derive(Debug, Clone)]
pub struct OrderedStore<T> {
    entries: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for OrderedStore<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Keyed> OrderedStore<T> {
    /// Entries in arrival order.
    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.index.get(key).map(|&idx| &self.entries[idx])
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.index.get(key).map(|&idx| &mut self.entries[idx])
    }

    /// Insert or replace by key. Returns `true` when the key was new.
    pub fn upsert(&mut self, value: T) -> bool {
        if let Some(&idx) = self.index.get(value.key()) {
            self.entries[idx] = value;
            return false;
        }

        self.index.insert(value.key().to_owned(), self.entries.len());
        self.entries.push(value);
        true
    }

    /// Replace an entry that must already exist.
    pub fn replace_existing(&mut self, value: T) -> Result<(), StoreError> {
        let idx = *self
            .index
            .get(value.key())
            .ok_or_else(|| StoreError::MissingEntry(value.key().to_owned()))?;
        self.entries[idx] = value;
        Ok(())
    }

    /// Remove by key, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        let idx = self.index.remove(key)?;
        let removed = self.entries.remove(idx);
        for position in self.index.values_mut() {
            if *position > idx {
                *position -= 1;
            }
        }
        Some(removed)
    }
}

/// Message stores of one conversation.
///
/// `past` holds backfilled history in fetch order, `live` holds entries
/// that arrived from the event log or from confirmed sends, and `pending`
/// holds optimistic sends keyed by correlation ID. A confirmed ID lives in
/// whichever of `past` and `live` saw it first; later copies update it there.
#[derive(Debug, Clone, Default)]
pub struct ConversationTimeline {
    past: OrderedStore<StoredEntry>,
    live: OrderedStore<StoredEntry>,
    pending: OrderedStore<PendingMessage>,
}

impl ConversationTimeline {
    pub fn past(&self) -> &OrderedStore<StoredEntry> {
        &self.past
    }

    pub fn live(&self) -> &OrderedStore<StoredEntry> {
        &self.live
    }

    pub fn pending(&self) -> &OrderedStore<PendingMessage> {
        &self.pending
    }

    /// Store a backfilled entry by ID.
    ///
    /// An ID that already arrived live is refreshed in `live` instead.
    pub fn insert_past(&mut self, entry: StoredEntry) -> bool {
        if self.live.contains(entry.id()) {
            let _ = self.live.replace_existing(entry);
            return false;
        }
        self.past.upsert(entry)
    }

    /// Store a live or confirmed entry by ID. Idempotent per ID.
    ///
    /// An ID already backfilled into `past` is refreshed there instead, so
    /// the same message never renders twice.
    pub fn insert_live(&mut self, entry: StoredEntry) -> bool {
        if self.past.contains(entry.id()) {
            let _ = self.past.replace_existing(entry);
            return false;
        }
        self.live.upsert(entry)
    }

    /// Apply a deletion to whichever store already knows the ID.
    ///
    /// Returns `false` (and stores nothing) for IDs that were never seen.
    pub fn apply_deletion(&mut self, entry: StoredEntry) -> bool {
        if self.past.contains(entry.id()) {
            return self.past.replace_existing(entry).is_ok();
        }
        if self.live.contains(entry.id()) {
            return self.live.replace_existing(entry).is_ok();
        }
        false
    }

    pub fn insert_pending(&mut self, message: PendingMessage) {
        self.pending.upsert(message);
    }

    pub fn pending_mut(&mut self, correlation_id: &str) -> Option<&mut PendingMessage> {
        self.pending.get_mut(correlation_id)
    }

    pub fn remove_pending(&mut self, correlation_id: &str) -> Option<PendingMessage> {
        self.pending.remove(correlation_id)
    }

    /// Build the rendered sequence, newest first.
    ///
    /// Pending entries come first (latest arrival first), then live entries
    /// (latest arrival first), then backfilled history in fetch order. Each
    /// confirmed item is then linked to the confirmed item directly before
    /// it, which is the chronologically next message.
    pub fn project(&self) -> Vec<TimelineItem> {
        let mut items: Vec<TimelineItem> =
            Vec::with_capacity(self.pending.len() + self.live.len() + self.past.len());

        items.extend(self.pending.entries().iter().rev().cloned().map(Into::into));
        items.extend(self.live.entries().iter().rev().cloned().map(Into::into));
        items.extend(self.past.entries().iter().cloned().map(Into::into));

        let mut previous: Option<StoredEntry> = None;
        for item in &mut items {
            let current = item.confirmed();
            match item {
                TimelineItem::Message { next_message, .. }
                | TimelineItem::DeletedMessage { next_message, .. } => {
                    *next_message = previous.take();
                }
                TimelineItem::PendingMessage { .. } => {}
            }
            previous = current;
        }

        items
    }
}
