//! In-memory entries with dirty tracking, shared by the resource caches.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall clock time in milliseconds.
pub fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

/// A cached value, whether it still needs persisting, and when it last
/// changed.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub dirty: bool,
    pub updated_at: u64,
}

impl<T> CacheEntry<T> {
    /// An entry that already matches the persisted copy.
    pub fn clean(value: T) -> Self {
        Self {
            value,
            dirty: false,
            updated_at: now_millis(),
        }
    }

    /// An entry that must be written by the next flush.
    pub fn dirty(value: T) -> Self {
        Self {
            value,
            dirty: true,
            updated_at: now_millis(),
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.updated_at = now_millis();
    }
}

/// Keyed entries plus the keys removed since the last flush.
#[derive(Debug)]
pub struct EntryMap<K, V> {
    entries: BTreeMap<K, CacheEntry<V>>,
    removed: BTreeSet<K>,
}

/// Everything a flush has to write for an [`EntryMap`].
#[derive(Debug, Clone, PartialEq)]
pub struct DirtySet<K, V> {
    pub upserts: Vec<(K, V)>,
    pub removals: Vec<K>,
}

impl<K, V> DirtySet<K, V> {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }
}

impl<K: Ord + Clone, V: Clone> EntryMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Seeds the map from persisted values, all clean.
    pub fn load(values: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            entries: values
                .into_iter()
                .map(|(key, value)| (key, CacheEntry::clean(value)))
                .collect(),
            removed: BTreeSet::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn entry(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|entry| &entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.removed.remove(&key);
        self.entries.insert(key, CacheEntry::dirty(value));
    }

    /// Applies `update` to the value under `key` and marks it dirty.
    pub fn update<R>(&mut self, key: &K, update: impl FnOnce(&mut V) -> R) -> Option<R> {
        let entry = self.entries.get_mut(key)?;
        let result = update(&mut entry.value);
        entry.mark_dirty();
        Some(result)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.removed.insert(key.clone());
        Some(entry.value)
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.dirty).count() + self.removed.len()
    }

    /// Collects pending writes and marks everything clean.
    pub fn take_dirty(&mut self) -> DirtySet<K, V> {
        let upserts = self
            .entries
            .iter_mut()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, entry)| {
                entry.dirty = false;
                (key.clone(), entry.value.clone())
            })
            .collect();
        let removals = std::mem::take(&mut self.removed).into_iter().collect();
        DirtySet { upserts, removals }
    }
}

impl<K: Ord + Clone, V: Clone> Default for EntryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
