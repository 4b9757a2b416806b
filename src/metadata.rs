//! Mutable stream metadata (Vorbis-comment style tags).
//!
//! Keys are compared ASCII-case-insensitively and map to an ordered list of
//! values; duplicate values are allowed and insertion order is preserved
//! within a key. The store is shared: cloning a [`Metadata`] yields another
//! reference to the same tags, so a session and its encoder always see the
//! same state.
//!
//! Tag slots are pooled. Removing a key frees its slot for reuse and slots
//! are only allocated in batches once no free one is left, which bounds
//! memory when the same few keys are churned repeatedly. Adding thousands
//! of distinct keys grows the pool monotonically until the store is
//! dropped.

use std::sync::{Arc, Mutex};

/// How many slots to add when the pool runs out of free ones.
const SLOT_INCREMENT: usize = 8;

struct TagSlot {
    key: Option<String>,
    values: Vec<Option<String>>,
}

struct MetadataInner {
    tags: Vec<TagSlot>,
}

impl MetadataInner {
    fn find(&mut self, key: &str) -> Option<&mut TagSlot> {
        self.tags
            .iter_mut()
            .find(|slot| matches!(&slot.key, Some(k) if k.eq_ignore_ascii_case(key)))
    }

    /// Returns the slot for `key`, claiming a free slot or growing the pool
    /// when the key is new.
    fn find_or_insert(&mut self, key: &str) -> &mut TagSlot {
        // One pass finds both the matching slot and the first free one.
        let mut free = None;
        let mut found = None;
        for (i, slot) in self.tags.iter().enumerate() {
            match &slot.key {
                Some(k) if k.eq_ignore_ascii_case(key) => {
                    found = Some(i);
                    break;
                }
                Some(_) => {}
                None if free.is_none() => free = Some(i),
                None => {}
            }
        }

        // An existing slot keeps the key spelling it was created with.
        if let Some(index) = found {
            return &mut self.tags[index];
        }

        let index = free.unwrap_or_else(|| {
            let index = self.tags.len();
            for _ in 0..SLOT_INCREMENT {
                self.tags.push(TagSlot {
                    key: None,
                    values: Vec::new(),
                });
            }
            index
        });

        let slot = &mut self.tags[index];
        slot.key = Some(key.to_string());
        slot
    }
}

impl TagSlot {
    fn push_value(&mut self, value: &str) {
        if let Some(free) = self.values.iter_mut().find(|v| v.is_none()) {
            *free = Some(value.to_string());
            return;
        }

        let index = self.values.len();
        self.values
            .extend(std::iter::repeat_with(|| None).take(SLOT_INCREMENT));
        self.values[index] = Some(value.to_string());
    }

    fn clear_values(&mut self) {
        for value in &mut self.values {
            *value = None;
        }
    }
}

/// Shared, mutable tag store.
#[derive(Clone)]
pub struct Metadata {
    inner: Arc<Mutex<MetadataInner>>,
}

impl Metadata {
    /// Creates an empty store.
    pub fn new() -> Self {
        Metadata {
            inner: Arc::new(Mutex::new(MetadataInner { tags: Vec::new() })),
        }
    }

    /// Appends `value` to `key`, keeping any values already present.
    pub fn add(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.find_or_insert(key).push_value(value);
    }

    /// Replaces all values of `key` with the single `value`.
    pub fn set(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.find_or_insert(key);
        slot.clear_values();
        slot.push_value(value);
    }

    /// Drops `key` and all its values. The slot is kept for reuse.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.find(key) {
            slot.key = None;
            slot.clear_values();
        }
    }

    /// Returns a snapshot of every `(key, value)` pair in insertion order.
    ///
    /// Codec backends iterate this to build their comment packets; taking a
    /// snapshot keeps the lock out of the encoding path.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap();
        let mut pairs = Vec::new();

        for slot in &inner.tags {
            let Some(key) = &slot.key else { continue };
            for value in slot.values.iter().flatten() {
                pairs.push((key.clone(), value.clone()));
            }
        }

        pairs
    }

    /// Returns a snapshot of the values stored for `key`.
    pub fn values(&self, key: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .tags
            .iter()
            .filter(|slot| matches!(&slot.key, Some(k) if k.eq_ignore_ascii_case(key)))
            .flat_map(|slot| slot.values.iter().flatten().cloned())
            .collect()
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata::new()
    }
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pairs = self.pairs();
        f.debug_map()
            .entries(pairs.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_preserves_insertion_order() {
        let meta = Metadata::new();
        meta.add("TITLE", "A");
        meta.add("TITLE", "B");
        meta.add("ARTIST", "X");

        assert_eq!(meta.values("TITLE"), vec!["A", "B"]);
        assert_eq!(
            meta.pairs(),
            vec![
                ("TITLE".to_string(), "A".to_string()),
                ("TITLE".to_string(), "B".to_string()),
                ("ARTIST".to_string(), "X".to_string()),
            ]
        );
    }

    #[test]
    fn keys_are_case_insensitive() {
        let meta = Metadata::new();
        meta.add("Title", "A");
        meta.add("TITLE", "B");

        assert_eq!(meta.values("title"), vec!["A", "B"]);
        assert_eq!(meta.pairs().len(), 2);
    }

    #[test]
    fn set_is_remove_then_add() {
        let meta = Metadata::new();
        meta.add("GENRE", "rock");
        meta.add("GENRE", "pop");
        meta.set("GENRE", "jazz");

        assert_eq!(meta.values("GENRE"), vec!["jazz"]);

        let replay = Metadata::new();
        replay.remove("GENRE");
        replay.add("GENRE", "jazz");
        assert_eq!(replay.pairs(), meta.pairs());
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let meta = Metadata::new();
        meta.add("A", "1");
        meta.add("B", "2");
        meta.remove("A");

        assert!(meta.values("A").is_empty());
        assert_eq!(meta.values("B"), vec!["2"]);

        // The freed slot is claimed by the next new key, so it now comes
        // first in iteration order.
        meta.add("C", "3");
        assert_eq!(
            meta.pairs(),
            vec![
                ("C".to_string(), "3".to_string()),
                ("B".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn duplicate_values_are_kept() {
        let meta = Metadata::new();
        meta.add("TITLE", "same");
        meta.add("TITLE", "same");
        assert_eq!(meta.values("TITLE"), vec!["same", "same"]);
    }

    #[test]
    fn clones_share_state() {
        let meta = Metadata::new();
        let alias = meta.clone();
        alias.add("TITLE", "shared");
        assert_eq!(meta.values("TITLE"), vec!["shared"]);
    }

    #[test]
    fn removing_unknown_key_is_harmless() {
        let meta = Metadata::new();
        meta.remove("NOPE");
        assert!(meta.pairs().is_empty());
    }
}
