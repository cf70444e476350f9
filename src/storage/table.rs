use im::HashMap;
use std::hash::Hash;

/// A row stamped with the commit version that last wrote it.
///
/// `value == None` is a tombstone: the row was deleted at `version`. Tombstones
/// stay around until no running transaction can still conflict with them.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub version: u64,
    pub value: Option<V>,
}

/// Persistent (structurally shared) map of versioned rows.
///
/// Cloning is O(1), which is what lets every transaction work on its own
/// snapshot of the whole store.
#[derive(Debug, Clone)]
pub struct VersionedTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    rows: HashMap<K, Versioned<V>>,
}

impl<K, V> Default for VersionedTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

impl<K, V> VersionedTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<&V> {
        self.rows.get(key).and_then(|row| row.value.as_ref())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Version of the last write to `key`, live or tombstone. `0` if never written.
    pub fn version_of(&self, key: &K) -> u64 {
        self.rows.get(key).map(|row| row.version).unwrap_or(0)
    }

    pub fn row(&self, key: &K) -> Option<&Versioned<V>> {
        self.rows.get(key)
    }

    pub fn put(&mut self, key: K, value: V, version: u64) {
        self.rows.insert(
            key,
            Versioned {
                version,
                value: Some(value),
            },
        );
    }

    /// Replaces a live row with a tombstone. Returns the removed value.
    pub fn tombstone(&mut self, key: &K, version: u64) -> Option<V> {
        let previous = self.rows.get(key).and_then(|row| row.value.clone())?;
        self.rows.insert(
            key.clone(),
            Versioned {
                version,
                value: None,
            },
        );
        Some(previous)
    }

    /// Copies a row as-is (tombstones included) from another table.
    pub fn install(&mut self, key: K, row: Versioned<V>) {
        self.rows.insert(key, row);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.rows
            .iter()
            .filter_map(|(key, row)| row.value.as_ref().map(|value| (key, value)))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.rows.values().filter_map(|row| row.value.as_ref())
    }

    pub fn len(&self) -> usize {
        self.rows.values().filter(|row| row.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.rows.values().filter(|row| row.value.is_none()).count()
    }

    /// Drops tombstones written at or before `horizon`. Returns how many were removed.
    pub fn vacuum(&mut self, horizon: u64) -> usize {
        let dead: Vec<K> = self
            .rows
            .iter()
            .filter(|(_, row)| row.value.is_none() && row.version <= horizon)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &dead {
            self.rows.remove(key);
        }
        dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_hides_row_but_keeps_version() {
        let mut table: VersionedTable<u32, &str> = VersionedTable::default();
        table.put(1, "a", 3);
        assert_eq!(table.get(&1), Some(&"a"));

        assert_eq!(table.tombstone(&1, 5), Some("a"));
        assert_eq!(table.get(&1), None);
        assert_eq!(table.version_of(&1), 5);
        assert_eq!(table.tombstone(&1, 6), None);
        assert_eq!(table.version_of(&1), 5);
    }

    #[test]
    fn vacuum_respects_horizon() {
        let mut table: VersionedTable<u32, &str> = VersionedTable::default();
        table.put(1, "a", 1);
        table.put(2, "b", 1);
        table.tombstone(&1, 2);
        table.tombstone(&2, 4);

        assert_eq!(table.vacuum(3), 1);
        assert_eq!(table.version_of(&1), 0);
        assert_eq!(table.version_of(&2), 4);
        assert_eq!(table.tombstone_count(), 1);
    }

    #[test]
    fn clones_are_isolated() {
        let mut table: VersionedTable<u32, &str> = VersionedTable::default();
        table.put(1, "a", 1);
        let snapshot = table.clone();
        table.put(1, "b", 2);

        assert_eq!(snapshot.get(&1), Some(&"a"));
        assert_eq!(table.get(&1), Some(&"b"));
    }
}
