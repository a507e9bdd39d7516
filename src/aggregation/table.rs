use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use super::accumulator::Accumulator;
use super::keys::GroupKey;

/// Mapping from group key to its accumulator, ordered by key.
#[derive(Debug, Clone)]
pub struct AggregationTable<K: GroupKey> {
    groups: BTreeMap<K, Accumulator>,
    sketch_size: usize,
}

impl<K: GroupKey> AggregationTable<K> {
    pub fn new(sketch_size: usize) -> Self {
        Self {
            groups: BTreeMap::new(),
            sketch_size,
        }
    }

    /// Adds one observation to the group for `key`, creating it if needed.
    pub fn update(&mut self, key: K, distance: f64, amount: f64) {
        let sketch_size = self.sketch_size;
        self.groups
            .entry(key)
            .or_insert_with(|| Accumulator::new(sketch_size))
            .update(distance, amount);
    }

    /// Merges a partial table built from other observations into this one.
    pub fn merge_chunk(&mut self, partial: AggregationTable<K>) {
        for (key, acc) in partial.groups {
            match self.groups.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(acc);
                }
                Entry::Occupied(mut slot) => slot.get_mut().merge(acc),
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&Accumulator> {
        self.groups.get(key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &Accumulator)> {
        self.groups.iter()
    }

    pub fn sketch_size(&self) -> usize {
        self.sketch_size
    }
}

impl<K: GroupKey> IntoIterator for AggregationTable<K> {
    type Item = (K, Accumulator);
    type IntoIter = std::collections::btree_map::IntoIter<K, Accumulator>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.into_iter()
    }
}
