//! Open-addressed hash table with linear probing and tombstone deletion,
//! matching clox's `table.c` exactly (including its historically-buggy
//! `tableAddAll`/`tableGet` contracts, corrected per the spec's open
//! questions — see `DESIGN.md`).
//!
//! A bucket is occupied iff `key != Value::Empty`; it is a tombstone iff
//! `key == Value::Empty && value != Value::Nil` (we stash `Bool(true)` there,
//! matching the spec). `count` includes tombstones, so the load factor
//! calculation naturally forces a grow (and implicit tombstone compaction)
//! once deletions pile up.

use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: Value::Empty,
            value: Value::Nil,
        }
    }
}

pub struct Table {
    entries: Vec<Entry>,
    /// Occupied buckets plus tombstones.
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count - self.tombstone_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tombstone_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.key, Value::Empty) && !matches!(e.value, Value::Nil))
            .count()
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe from `hash(key) mod cap`, matching clox's `findEntry`: return
    /// the first slot whose key equals `key`, else the first tombstone seen
    /// (remembered on first encounter, used if no exact match exists), else
    /// the first empty slot. Terminates because load factor is kept < 1.
    fn find_entry(entries: &[Entry], key: &Value) -> usize {
        let cap = entries.len();
        let mut index = (key.hash() as usize) % cap;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Value::Empty => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                other if other.values_equal(key) => return index,
                _ => {}
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self, new_cap: usize) {
        let mut new_entries = vec![Entry::empty(); new_cap];
        let mut new_count = 0;
        for entry in &self.entries {
            if matches!(entry.key, Value::Empty) {
                continue;
            }
            let index = Self::find_entry(&new_entries, &entry.key);
            new_entries[index] = *entry;
            new_count += 1;
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Returns `true` if this created a new entry (didn't overwrite an
    /// existing key).
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if self.capacity() == 0 || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_cap = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.grow(new_cap);
        }

        let index = Self::find_entry(&self.entries, &key);
        let entry = &mut self.entries[index];
        let is_new_key = matches!(entry.key, Value::Empty);
        if is_new_key && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if matches!(entry.key, Value::Empty) {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn delete(&mut self, key: &Value) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if matches!(entry.key, Value::Empty) {
            return false;
        }
        entry.key = Value::Empty;
        entry.value = Value::Bool(true);
        true
    }

    /// Copy every non-empty, non-tombstone entry from `other` into `self`.
    /// (clox's `tableAddAll` checked `IS_EMPTY(entry->key)` backwards; the
    /// corrected contract copies occupied entries only — see `DESIGN.md`.)
    pub fn add_all(&mut self, other: &Table) {
        for entry in &other.entries {
            if !matches!(entry.key, Value::Empty) {
                self.set(entry.key, entry.value);
            }
        }
    }

    /// Find an interned string by raw bytes + precomputed hash without
    /// constructing a `Value` key first — used only by the intern table.
    pub fn find_string_by_bytes(&self, bytes: &[u8], hash: u32) -> Option<*mut crate::object::ObjString> {
        if self.capacity() == 0 {
            return None;
        }
        let cap = self.capacity();
        let mut index = (hash as usize) % cap;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Value::Empty if matches!(entry.value, Value::Nil) => return None,
                Value::Obj(ptr) => unsafe {
                    let s = &*crate::object::as_string(ptr);
                    if s.hash == hash && s.bytes.as_bytes() == bytes {
                        return Some(ptr as *mut crate::object::ObjString);
                    }
                },
                _ => {}
            }
            index = (index + 1) % cap;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries
            .iter()
            .filter(|e| !matches!(e.key, Value::Empty))
            .map(|e| (&e.key, &e.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&mut Value, &mut Value)> {
        self.entries
            .iter_mut()
            .filter(|e| !matches!(e.key, Value::Empty))
            .map(|e| (&mut e.key, &mut e.value))
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let mut t = Table::new();
        assert!(t.set(Value::Number(1.0), Value::Number(42.0)));
        assert_eq!(t.get(&Value::Number(1.0)), Some(Value::Number(42.0)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn overwrite_does_not_grow_count() {
        let mut t = Table::new();
        t.set(Value::Number(1.0), Value::Number(1.0));
        let is_new = t.set(Value::Number(1.0), Value::Number(2.0));
        assert!(!is_new);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&Value::Number(1.0)), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_then_reinsert_reuses_tombstone() {
        let mut t = Table::new();
        t.set(Value::Number(1.0), Value::Number(1.0));
        assert!(t.delete(&Value::Number(1.0)));
        assert_eq!(t.get(&Value::Number(1.0)), None);
        assert_eq!(t.len(), 0);
        t.set(Value::Number(2.0), Value::Number(2.0));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(Value::Number(i as f64), Value::Number(i as f64));
        }
        assert_eq!(t.len(), 100);
        for i in 0..100 {
            assert_eq!(t.get(&Value::Number(i as f64)), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn add_all_copies_non_empty_entries() {
        let mut a = Table::new();
        a.set(Value::Number(1.0), Value::Number(1.0));
        a.set(Value::Number(2.0), Value::Number(2.0));
        a.delete(&Value::Number(2.0));

        let mut b = Table::new();
        b.add_all(&a);
        assert_eq!(b.len(), 1);
        assert_eq!(b.get(&Value::Number(1.0)), Some(Value::Number(1.0)));
    }
}
