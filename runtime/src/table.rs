use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

fn empty_entry() -> Entry {
    Entry { key: None, value: Value::Bool(false) }
}

fn tombstone() -> Entry {
    Entry { key: None, value: Value::Bool(true) }
}

fn is_empty_marker(value: Value) -> bool {
    matches!(value, Value::Bool(false))
}

/// Open-addressed hash map keyed by interned strings, linear-probed with
/// tombstone deletion. Used for globals, instance fields and class method
/// tables alike. Grown by doubling from 8 whenever the load factor would
/// exceed 0.75.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self { count: 0, entries: Vec::new() }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], capacity: usize, key: ObjRef) -> usize {
        let mut index = (key.string_hash() as usize) % capacity;
        let mut tombstone_idx: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if is_empty_marker(entry.value) {
                        return tombstone_idx.unwrap_or(index);
                    } else if tombstone_idx.is_none() {
                        tombstone_idx = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
        let mut new_entries = vec![empty_entry(); new_capacity];
        let mut new_count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let idx = Self::find_entry(&new_entries, new_capacity, key);
                new_entries[idx] = Entry { key: Some(key), value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Inserts or overwrites `key`; returns `true` if this is a brand-new key.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow();
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        let is_new_key = self.entries[idx].key.is_none();
        if is_new_key && is_empty_marker(self.entries[idx].value) {
            self.count += 1;
        }
        self.entries[idx] = Entry { key: Some(key), value };
        is_new_key
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        self.entries[idx].key.map(|_| self.entries[idx].value)
    }

    pub fn contains(&self, key: ObjRef) -> bool {
        self.get(key).is_some()
    }

    /// Marks the slot a tombstone rather than truly emptying it, so probe
    /// chains through it stay intact.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_entry(&self.entries, self.capacity(), key);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = tombstone();
        true
    }

    /// Looks up an already-interned string by content, used by the heap's
    /// string table to decide whether a freshly scanned literal needs
    /// allocating at all.
    pub fn find_string(&self, text: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if is_empty_marker(entry.value) => return None,
                Some(key) => {
                    let s = key.as_string().expect("table key is always a string");
                    if s.hash == hash && s.chars.as_ref() == text {
                        return Some(key);
                    }
                }
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Drops every entry whose key hasn't survived the current mark phase.
    /// Only meaningful for the heap's intern table, which holds weak
    /// references to strings the sweep is about to reclaim.
    pub fn remove_white(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.is_marked() {
                    *entry = tombstone();
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Used by `OP_INHERIT` to copy a superclass's method table into a
    /// subclass at class-declaration time.
    pub fn copy_all_into(&self, dest: &mut Table) {
        for (key, value) in self.iter() {
            dest.set(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{GcRoots, Heap};

    struct NoRoots;
    impl GcRoots for NoRoots {
        fn mark_roots(&self, _heap: &mut Heap) {}
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let key = heap.intern_string(&NoRoots, "answer");
        let mut table = Table::new();
        assert!(table.set(key, Value::Number(42.0)));
        assert_eq!(table.get(key), Some(Value::Number(42.0)));
        assert!(table.delete(key));
        assert_eq!(table.get(key), None);
    }

    #[test]
    fn overwrite_is_not_a_new_key() {
        let mut heap = Heap::new();
        let key = heap.intern_string(&NoRoots, "x");
        let mut table = Table::new();
        assert!(table.set(key, Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(2.0)));
        assert_eq!(table.get(key), Some(Value::Number(2.0)));
    }

    #[test]
    fn grows_past_many_entries() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..200 {
            let key = heap.intern_string(&NoRoots, &format!("key{i}"));
            table.set(key, Value::Number(i as f64));
        }
        for i in 0..200 {
            let key = heap.intern_string(&NoRoots, &format!("key{i}"));
            assert_eq!(table.get(key), Some(Value::Number(i as f64)));
        }
    }
}
