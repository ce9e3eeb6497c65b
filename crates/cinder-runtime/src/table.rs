//! String-keyed hash table
//!
//! Open addressing with linear probing. Capacity is a power of two after the
//! first growth; the load factor ceiling is 0.75. Keys are interned string
//! handles compared by identity, so probing never touches string bytes —
//! entries cache the key's FNV-1a hash for bucket selection and rehashing.
//!
//! Tombstones are encoded as `{key: None, value: true}`, empty slots as
//! `{key: None, value: nil}`. Backs globals, interning, method tables, and
//! instance fields.

use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Debug, Clone)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: None,
            hash: 0,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Value::Bool(true)
    }
}

/// Open-addressed table from interned strings to values
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    /// Create a new empty table
    pub fn new() -> Self {
        Self {
            count: 0,
            entries: Vec::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Look up `key`; `hash` must be the key string's cached hash
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = self.find_entry(key, hash);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Insert or update `key`; returns `true` when the key was new
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.capacity() * MAX_LOAD_NUM {
            self.grow();
        }

        let index = self.find_entry(key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // A reused tombstone was already counted
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }

        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new
    }

    /// Remove `key`, leaving a tombstone; returns whether it was present
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.find_entry(key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }

        entry.key = None;
        entry.hash = 0;
        entry.value = Value::Bool(true);
        true
    }

    /// Shallow-merge every entry of `other` into this table
    pub fn add_all(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// Find an interned string by content, comparing bytes through `eq`.
    ///
    /// Only the interner uses this: probing matches on hash first, then asks
    /// the heap (via `eq`) for a byte-wise comparison.
    pub fn find_string(&self, hash: u32, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    // Empty (non-tombstone) slot ends the probe chain
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && eq(key) {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Delete every entry whose key is unmarked.
    ///
    /// Runs before the GC sweep so the sweep can safely free those strings.
    pub fn remove_white(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for i in 0..self.entries.len() {
            if let Some(key) = self.entries[i].key {
                if !is_marked(key) {
                    let hash = self.entries[i].hash;
                    self.delete(key, hash);
                }
            }
        }
    }

    /// Iterate live entries as `(key, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Current backing-store footprint, for GC byte accounting
    pub fn byte_size(&self) -> usize {
        self.capacity() * std::mem::size_of::<Entry>()
    }

    /// Probe for `key`, returning the index of its entry or of the slot it
    /// would occupy. Thanks to the load-factor ceiling there is always an
    /// empty slot to terminate the probe.
    fn find_entry(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        // Empty slot: reuse an earlier tombstone if any
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(existing) => {
                    if existing == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity() < 8 {
            8
        } else {
            self.capacity() * 2
        };

        let old_entries = std::mem::replace(&mut self.entries, vec![Entry::empty(); new_capacity]);

        // Rebuild without tombstones
        self.count = 0;
        for entry in old_entries {
            if let Some(key) = entry.key {
                let index = self.find_entry(key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> (ObjRef, u32) {
        // Identity-keyed entries with a synthetic hash; the table never
        // dereferences keys, so tests can fabricate handles freely.
        (ObjRef(n), n.wrapping_mul(2654435761))
    }

    #[test]
    fn test_get_missing_from_empty() {
        let table = Table::new();
        let (k, h) = key(1);
        assert_eq!(table.get(k, h), None);
    }

    #[test]
    fn test_set_reports_new_keys() {
        let mut table = Table::new();
        let (k, h) = key(1);
        assert!(table.set(k, h, Value::Number(1.0)));
        assert!(!table.set(k, h, Value::Number(2.0)));
        assert_eq!(table.get(k, h), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_delete_then_get() {
        let mut table = Table::new();
        let (k, h) = key(7);
        table.set(k, h, Value::Bool(true));
        assert!(table.delete(k, h));
        assert_eq!(table.get(k, h), None);
        assert!(!table.delete(k, h));
    }

    #[test]
    fn test_survives_growth() {
        let mut table = Table::new();
        for n in 0..100 {
            let (k, h) = key(n);
            table.set(k, h, Value::Number(n as f64));
        }
        for n in 0..100 {
            let (k, h) = key(n);
            assert_eq!(table.get(k, h), Some(Value::Number(n as f64)));
        }
    }

    #[test]
    fn test_tombstone_slots_are_reused() {
        let mut table = Table::new();
        for n in 0..16 {
            let (k, h) = key(n);
            table.set(k, h, Value::Nil);
        }
        for n in 0..16 {
            let (k, h) = key(n);
            table.delete(k, h);
        }
        // Reinserting over tombstones must not grow the probe chains forever
        for n in 0..16 {
            let (k, h) = key(n);
            assert!(table.set(k, h, Value::Number(n as f64)));
        }
        for n in 0..16 {
            let (k, h) = key(n);
            assert_eq!(table.get(k, h), Some(Value::Number(n as f64)));
        }
    }

    #[test]
    fn test_add_all() {
        let mut src = Table::new();
        let mut dest = Table::new();
        let (k1, h1) = key(1);
        let (k2, h2) = key(2);
        src.set(k1, h1, Value::Number(1.0));
        src.set(k2, h2, Value::Number(2.0));
        dest.add_all(&src);
        assert_eq!(dest.get(k1, h1), Some(Value::Number(1.0)));
        assert_eq!(dest.get(k2, h2), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_remove_white_keeps_marked() {
        let mut table = Table::new();
        let (k1, h1) = key(1);
        let (k2, h2) = key(2);
        table.set(k1, h1, Value::Nil);
        table.set(k2, h2, Value::Nil);
        table.remove_white(|k| k == k1);
        assert_eq!(table.get(k1, h1), Some(Value::Nil));
        assert_eq!(table.get(k2, h2), None);
    }

    #[test]
    fn test_table_matches_model_map() {
        use proptest::prelude::*;

        // The open-addressed table agrees with a model map under arbitrary
        // insert/delete interleavings, across growth and tombstone reuse.
        proptest!(|(ops in proptest::collection::vec(
            (0u32..64, proptest::bool::ANY, proptest::num::f64::NORMAL),
            0..200
        ))| {
            let mut table = Table::new();
            let mut model = std::collections::HashMap::new();

            for (n, insert, number) in ops {
                let (k, h) = key(n);
                if insert {
                    let was_new = table.set(k, h, Value::Number(number));
                    prop_assert_eq!(was_new, model.insert(n, number).is_none());
                } else {
                    let was_present = table.delete(k, h);
                    prop_assert_eq!(was_present, model.remove(&n).is_some());
                }
            }

            for n in 0u32..64 {
                let (k, h) = key(n);
                let expected = model.get(&n).map(|&number| Value::Number(number));
                prop_assert_eq!(table.get(k, h), expected);
            }
        });
    }

    #[test]
    fn test_iter_skips_tombstones() {
        let mut table = Table::new();
        let (k1, h1) = key(1);
        let (k2, h2) = key(2);
        table.set(k1, h1, Value::Number(1.0));
        table.set(k2, h2, Value::Number(2.0));
        table.delete(k1, h1);
        let live: Vec<_> = table.iter().collect();
        assert_eq!(live, vec![(k2, Value::Number(2.0))]);
    }
}
