//! The hash table itself: the bucket-materialization, insert/get/delete
//! and growth protocols that tie the directory to the split-ordered list
//! (spec.md §4.4–§4.6).

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::collections::HashMap;
use std::hash::Hash;

use crossbeam_epoch::{self as epoch, Guard, Owned, Shared};

use crate::directory::Directory;
use crate::entry::Entry;
use crate::error::VerifyError;
use crate::key::TableKey;
use crate::list::{Cursor, List, Node, NodeRef};

/// Default load factor (spec.md §6.1).
const DEFAULT_LOAD_FACTOR: f64 = 0.5;

/// Directory top level is fixed at 32 slots (32-bit split-ordered keys),
/// so the exponent saturates there (spec.md §7, "Directory bounds").
const MAX_EXPONENT: u32 = 31;

/// A lock-free, concurrently extensible hash table (Shalev & Shavit's
/// split-ordered lists).
///
/// All data-path operations take an explicit [`crossbeam_epoch::Guard`]
/// from `crossbeam_epoch::pin()`, following the convention of
/// epoch-based concurrent collections in this ecosystem (e.g.
/// `crossbeam-skiplist`): values are returned by reference, valid for as
/// long as the guard that produced them is alive.
pub struct HashTable<K, V> {
    list: List<Entry<K, V>>,
    directory: Directory<Node<Entry<K, V>>>,
    exponent: AtomicU32,
    size: AtomicUsize,
    load_factor: f64,
}

impl<K: TableKey, V> Default for HashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TableKey, V> HashTable<K, V> {
    /// Creates a table with the default load factor (0.5). Bucket 0 is
    /// pre-materialized before this returns (spec.md I3).
    pub fn new() -> Self {
        Self::with_load_factor(DEFAULT_LOAD_FACTOR)
    }

    pub fn with_load_factor(load_factor: f64) -> Self {
        let table = HashTable {
            list: List::new(),
            directory: Directory::new(),
            exponent: AtomicU32::new(0),
            size: AtomicUsize::new(0),
            load_factor,
        };
        let guard = epoch::pin();
        table.get_bucket_by_index(0, &guard);
        table
    }

    /// Eventually consistent with concurrent inserts/deletes (spec.md
    /// §4.5, Non-goals).
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The current number of hash bits consulted for bucketing.
    pub fn exponent(&self) -> u32 {
        self.exponent.load(Ordering::Acquire)
    }

    pub fn get<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        let hash_code = key.hash_code();
        let (cursor, found) = self.find_entry_cursor(hash_code, key, guard);
        if !found {
            return None;
        }
        let entry = List::entry(cursor.curr);
        unsafe { entry.value.load(Ordering::Acquire, guard).as_ref() }
    }

    /// Inserts or replaces; returns the value that was there before, if
    /// any.
    pub fn put<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        let hash_code = key.hash_code();
        let (cursor0, found0) = self.find_entry_cursor(hash_code, &key, guard);
        if found0 {
            let existing = List::entry(cursor0.curr);
            let new_value = Owned::new(value);
            let old = existing.value.swap(new_value, Ordering::AcqRel, guard);
            unsafe { guard.defer_destroy(old) };
            return unsafe { old.as_ref() };
        }

        let mut owned = List::new_node(Entry::new_real(hash_code, key, value));
        let mut cursor = cursor0;
        loop {
            match self.list.add_before(&cursor, owned, guard) {
                Ok(_) => {
                    self.record_insert(guard);
                    return None;
                }
                Err(rejected) => {
                    owned = rejected;
                    let probe_key = List::peek(&owned)
                        .key
                        .as_ref()
                        .expect("a node built via Entry::new_real always carries a key");
                    let (new_cursor, found) = self.find_entry_cursor(hash_code, probe_key, guard);
                    if found {
                        let existing = List::entry(new_cursor.curr);
                        let entry = List::into_entry(owned);
                        let new_value = unsafe { entry.into_value().into_owned() };
                        let old = existing.value.swap(new_value, Ordering::AcqRel, guard);
                        unsafe { guard.defer_destroy(old) };
                        return unsafe { old.as_ref() };
                    }
                    cursor = new_cursor;
                }
            }
        }
    }

    /// Inserts only if `key` is absent; never mutates an existing entry.
    pub fn put_if_missing<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> bool {
        let hash_code = key.hash_code();
        let (cursor0, found0) = self.find_entry_cursor(hash_code, &key, guard);
        if found0 {
            return false;
        }

        let mut owned = List::new_node(Entry::new_real(hash_code, key, value));
        let mut cursor = cursor0;
        loop {
            match self.list.add_before(&cursor, owned, guard) {
                Ok(_) => {
                    self.record_insert(guard);
                    return true;
                }
                Err(rejected) => {
                    owned = rejected;
                    let probe_key = List::peek(&owned)
                        .key
                        .as_ref()
                        .expect("a node built via Entry::new_real always carries a key");
                    let (new_cursor, found) = self.find_entry_cursor(hash_code, probe_key, guard);
                    if found {
                        // `owned` drops here: Entry's Drop frees the boxed value.
                        return false;
                    }
                    cursor = new_cursor;
                }
            }
        }
    }

    /// Removes `key` if present, returning its value.
    pub fn delete<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        let hash_code = key.hash_code();
        loop {
            let (cursor, found) = self.find_entry_cursor(hash_code, key, guard);
            if !found {
                return None;
            }
            if self.list.do_remove(&cursor, guard) {
                self.size.fetch_sub(1, Ordering::AcqRel);
                let entry = List::entry(cursor.curr);
                return unsafe { entry.value.load(Ordering::Acquire, guard).as_ref() };
            }
            // Lost the race to mark `cursor.curr`; someone else removed
            // it first. Re-search: `key` is very likely absent now.
        }
    }

    /// A non-atomic snapshot of the table's current logical mapping.
    pub fn to_mapping(&self) -> HashMap<K, V>
    where
        K: Clone + Hash,
        V: Clone,
    {
        let guard = epoch::pin();
        let mut map = HashMap::new();
        for entry in self.list.iter(&guard) {
            if !entry.is_real() {
                continue;
            }
            if let Some(k) = entry.key.as_ref() {
                let v = unsafe { entry.value.load(Ordering::Acquire, &guard).as_ref() };
                if let Some(v) = v {
                    map.insert(k.clone(), v.clone());
                }
            }
        }
        map
    }

    /// A multi-line human-readable dump, for debugging.
    pub fn describe(&self) -> String {
        let guard = epoch::pin();
        let mut out = format!(
            "HashTable {{ exponent: {}, size: {}, load_factor: {} }}\n",
            self.exponent(),
            self.size(),
            self.load_factor
        );
        for entry in self.list.iter(&guard) {
            if entry.is_real() {
                out.push_str(&format!(
                    "  real  split_key={:#010x} hash_code={:#010x}\n",
                    entry.split_key, entry.hash_code
                ));
            } else {
                out.push_str(&format!(
                    "  dummy split_key={:#010x} bucket={}\n",
                    entry.split_key, entry.hash_code
                ));
            }
        }
        out
    }

    /// Checks spec.md's invariants P6/P7 and returns the first
    /// violation found, if any.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let guard = epoch::pin();
        let exponent = self.exponent();
        let mut last_split_key: Option<u32> = None;
        let mut current_bucket: Option<u32> = None;

        for entry in self.list.iter(&guard) {
            if let Some(last) = last_split_key {
                if entry.split_key <= last {
                    return Err(VerifyError::OutOfOrder {
                        before: last,
                        after: entry.split_key,
                    });
                }
            }
            last_split_key = Some(entry.split_key);

            if entry.is_real() {
                let expected = entry.hash_code % (1u32 << exponent);
                match current_bucket {
                    None => {
                        return Err(VerifyError::RealEntryBeforeAnyBucket {
                            hash_code: entry.hash_code,
                        })
                    }
                    Some(found_under) if found_under != expected => {
                        return Err(VerifyError::BucketMismatch {
                            hash_code: entry.hash_code,
                            expected,
                            found_under,
                        })
                    }
                    _ => {}
                }
            } else {
                let index = entry.hash_code;
                current_bucket = Some(index);
                let cell = self
                    .directory
                    .cell(index, &guard)
                    .load(Ordering::Acquire, &guard);
                if cell.is_null() {
                    return Err(VerifyError::DummyMissingFromDirectory { index });
                }
            }
        }
        Ok(())
    }
}

/// `put_if_present` needs `V: PartialEq` to compare against `expected`,
/// so it lives in its own `impl` block rather than widening every other
/// method's bound.
impl<K: TableKey, V: PartialEq> HashTable<K, V> {
    /// Replaces `key`'s value with `value` only if its current value
    /// equals `expected`. Returns `false`, without inserting, if `key` is
    /// absent (spec.md §9, Open Question) or if the current value never
    /// matches `expected`. A lost CAS race is retried from the top —
    /// re-resolving the bucket and re-searching — exactly as spec.md
    /// §4.5 prescribes, not treated as a final answer: another thread's
    /// winning CAS doesn't mean `expected` stopped holding, only that the
    /// read we raced against is stale.
    pub fn put_if_present<'g>(&'g self, key: &K, value: V, expected: &V, guard: &'g Guard) -> bool {
        let hash_code = key.hash_code();
        let mut value = value;
        loop {
            let (cursor, found) = self.find_entry_cursor(hash_code, key, guard);
            if !found {
                return false;
            }
            let existing = List::entry(cursor.curr);
            let old_ptr = existing.value.load(Ordering::Acquire, guard);
            let matches = unsafe { old_ptr.as_ref() }.is_some_and(|v| v == expected);
            if !matches {
                return false;
            }
            let new_value = Owned::new(value);
            match existing.value.compare_exchange(
                old_ptr,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(prev) => {
                    unsafe { guard.defer_destroy(prev) };
                    return true;
                }
                Err(e) => value = *e.new.into_box(),
            }
        }
    }
}

impl<K: TableKey, V> HashTable<K, V> {
    /// Increments `size` and attempts to grow (spec.md §4.6).
    fn record_insert(&self, guard: &Guard) {
        self.size.fetch_add(1, Ordering::AcqRel);
        self.maybe_grow(guard);
    }

    fn maybe_grow(&self, guard: &Guard) {
        let exponent = self.exponent();
        if exponent >= MAX_EXPONENT {
            return;
        }
        let size = self.size() as f64;
        let capacity = (1u64 << exponent) as f64;
        if size <= self.load_factor * capacity {
            return;
        }
        let new_exponent = exponent + 1;
        log::debug!(
            "growing directory: exponent {} -> {} (size {})",
            exponent,
            new_exponent,
            size
        );
        self.directory.ensure_segment(new_exponent as usize, guard);
        let _ = self.exponent.compare_exchange(
            exponent,
            new_exponent,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Resolves the bucket dummy for `index`, materializing it (and, if
    /// necessary, its ancestors) if it doesn't exist yet (spec.md §4.4).
    fn get_bucket_by_index<'g>(&'g self, index: u32, guard: &'g Guard) -> NodeRef<'g, Entry<K, V>> {
        loop {
            let ptr = self
                .directory
                .cell(index, guard)
                .load(Ordering::Acquire, guard);
            if !ptr.is_null() {
                return ptr;
            }
            self.initialize_bucket(index, guard);
        }
    }

    /// The parent bucket index for `index > 0` (spec.md §4.4): clearing
    /// the index's most significant set bit yields the nearest ancestor
    /// bucket guaranteed to already be materialized.
    fn parent_bucket_index(&self, index: u32) -> u32 {
        let msb = 1u32 << crate::bits::log2floor(index);
        index - msb
    }

    fn initialize_bucket<'g>(&'g self, index: u32, guard: &'g Guard) {
        log::trace!("materializing bucket {index}");
        let start = if index == 0 {
            self.list.head_slot()
        } else {
            let parent_index = self.parent_bucket_index(index);
            let parent_node = self.get_bucket_by_index(parent_index, guard);
            List::next_slot(parent_node)
        };

        let dummy_split_key = Entry::<K, V>::dummy_split_key(index);
        let mut owned = List::new_node(Entry::<K, V>::new_dummy(index));
        loop {
            let cursor = self
                .list
                .search(start, |e| e.split_key.cmp(&dummy_split_key), guard);
            let already_present = !cursor.curr.is_null() && List::entry(cursor.curr).split_key == dummy_split_key;
            if already_present {
                let _ = self.directory.cell(index, guard).compare_exchange(
                    Shared::null(),
                    cursor.curr,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                );
                List::into_entry(owned);
                return;
            }
            match self.list.add_before(&cursor, owned, guard) {
                Ok(inserted) => {
                    let _ = self.directory.cell(index, guard).compare_exchange(
                        Shared::null(),
                        inserted,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    );
                    return;
                }
                Err(rejected) => owned = rejected,
            }
        }
    }

    /// The key-aware search of spec.md §4.3: resolves the bucket, finds
    /// the first node whose `split_key` matches, then walks forward
    /// through same-`split_key` collisions checking true key equality.
    fn find_entry_cursor<'g>(
        &'g self,
        hash_code: u32,
        key: &K,
        guard: &'g Guard,
    ) -> (Cursor<'g, Entry<K, V>>, bool) {
        let exponent = self.exponent();
        let bucket_index = hash_code % (1u32 << exponent);
        let dummy_node = self.get_bucket_by_index(bucket_index, guard);
        let split_key = Entry::<K, V>::real_split_key(hash_code);
        let mut start = List::next_slot(dummy_node);

        loop {
            let cursor = self.list.search(start, |e| e.split_key.cmp(&split_key), guard);
            match unsafe { cursor.curr.as_ref() } {
                None => return (cursor, false),
                Some(_) => {
                    let entry = List::entry(cursor.curr);
                    if entry.split_key != split_key {
                        return (cursor, false);
                    }
                    if entry.key.as_ref().is_some_and(|k| k == key) {
                        return (cursor, true);
                    }
                    start = List::next_slot(cursor.curr);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn put_then_get_roundtrips() {
        let table: HashTable<String, i32> = HashTable::new();
        let guard = epoch::pin();
        assert_eq!(table.put("a".to_string(), 1, &guard), None);
        assert_eq!(table.get(&"a".to_string(), &guard), Some(&1));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn put_replaces_and_returns_old_value() {
        let table: HashTable<String, i32> = HashTable::new();
        let guard = epoch::pin();
        table.put("a".to_string(), 1, &guard);
        let old = table.put("a".to_string(), 2, &guard);
        assert_eq!(old, Some(&1));
        assert_eq!(table.get(&"a".to_string(), &guard), Some(&2));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn put_if_missing_only_inserts_once() {
        let table: HashTable<String, i32> = HashTable::new();
        let guard = epoch::pin();
        assert!(table.put_if_missing("a".to_string(), 1, &guard));
        assert!(!table.put_if_missing("a".to_string(), 2, &guard));
        assert_eq!(table.get(&"a".to_string(), &guard), Some(&1));
    }

    #[test]
    fn put_if_present_requires_matching_expected() {
        let table: HashTable<String, i32> = HashTable::new();
        let guard = epoch::pin();
        assert!(!table.put_if_present(&"a".to_string(), 2, &1, &guard));
        table.put("a".to_string(), 1, &guard);
        assert!(!table.put_if_present(&"a".to_string(), 2, &99, &guard));
        assert!(table.put_if_present(&"a".to_string(), 2, &1, &guard));
        assert_eq!(table.get(&"a".to_string(), &guard), Some(&2));
    }

    #[test]
    fn delete_removes_and_returns_value() {
        let table: HashTable<String, i32> = HashTable::new();
        let guard = epoch::pin();
        table.put("a".to_string(), 1, &guard);
        assert_eq!(table.delete(&"a".to_string(), &guard), Some(&1));
        assert_eq!(table.get(&"a".to_string(), &guard), None);
        assert_eq!(table.size(), 0);
        assert_eq!(table.delete(&"a".to_string(), &guard), None);
    }

    #[test]
    fn get_on_missing_key_is_none() {
        let table: HashTable<String, i32> = HashTable::new();
        let guard = epoch::pin();
        assert_eq!(table.get(&"missing".to_string(), &guard), None);
    }

    #[test]
    fn many_inserts_grow_the_directory_and_verify_holds() {
        let table: HashTable<u32, u32> = HashTable::new();
        let guard = epoch::pin();
        for k in 0..2000u32 {
            table.put(k, k * 2, &guard);
        }
        assert_eq!(table.size(), 2000);
        assert!(table.exponent() > 0);
        for k in 0..2000u32 {
            assert_eq!(table.get(&k, &guard), Some(&(k * 2)));
        }
        table.verify().expect("a table built from sequential puts must satisfy its invariants");
    }

    #[test]
    fn to_mapping_matches_inserted_keys() {
        let table: HashTable<u32, u32> = HashTable::new();
        let guard = epoch::pin();
        for k in 0..50u32 {
            table.put(k, k + 100, &guard);
        }
        let map = table.to_mapping();
        assert_eq!(map.len(), 50);
        for k in 0..50u32 {
            assert_eq!(map.get(&k), Some(&(k + 100)));
        }
    }

    #[test]
    fn concurrent_inserts_and_deletes_leave_a_consistent_table() {
        const THREADS: u32 = 64;
        const KEYS_PER_THREAD: u32 = 1000;

        let table = Arc::new(HashTable::<u32, u32>::new());
        let threads: Vec<_> = (0..THREADS)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let guard = epoch::pin();
                    for i in 0..KEYS_PER_THREAD {
                        let key = t * KEYS_PER_THREAD + i;
                        table.put(key, key, &guard);
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        assert_eq!(table.size(), (THREADS * KEYS_PER_THREAD) as usize);
        let guard = epoch::pin();
        for t in 0..THREADS {
            for i in 0..KEYS_PER_THREAD {
                let key = t * KEYS_PER_THREAD + i;
                assert_eq!(table.get(&key, &guard), Some(&key));
            }
        }
        table.verify().expect("concurrently built table must still satisfy its invariants");
        assert_eq!(table.to_mapping().len(), (THREADS * KEYS_PER_THREAD) as usize);

        let deleters: Vec<_> = (0..THREADS)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let guard = epoch::pin();
                    for i in 0..KEYS_PER_THREAD {
                        let key = t * KEYS_PER_THREAD + i;
                        assert_eq!(table.delete(&key, &guard), Some(&key));
                    }
                })
            })
            .collect();
        for handle in deleters {
            handle.join().unwrap();
        }
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn exponent_never_decreases_as_keys_are_removed() {
        let table: HashTable<u32, u32> = HashTable::new();
        let guard = epoch::pin();
        for k in 0..500u32 {
            table.put(k, k, &guard);
        }
        let grown_exponent = table.exponent();
        assert!(grown_exponent > 0);
        for k in 0..500u32 {
            table.delete(&k, &guard);
        }
        assert_eq!(table.exponent(), grown_exponent);
    }
}
