//! The list payload (spec.md §3.1, §4.2): a real entry or a bucket dummy,
//! ordered on the list by split-ordered key alone.

use core::cmp::Ordering;
use core::sync::atomic::Ordering as AtomicOrdering;
use crossbeam_epoch::Atomic;

use crate::bits::reverse32;

/// A node payload on the split-ordered list.
///
/// For a real entry the low bit of `split_key` is set and `key` is
/// `Some`; for a bucket dummy it is clear and `key` is `None`. The tag bit
/// is fixed at construction and never mutated, so a real entry and a
/// dummy can never collide on `split_key` even when their underlying
/// 32-bit hash/index happens to coincide.
#[derive(Debug)]
pub(crate) struct Entry<K, V> {
    pub(crate) hash_code: u32,
    pub(crate) split_key: u32,
    pub(crate) key: Option<K>,
    pub(crate) value: Atomic<V>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn real_split_key(hash_code: u32) -> u32 {
        reverse32(hash_code) | 1
    }

    pub(crate) fn dummy_split_key(index: u32) -> u32 {
        reverse32(index) & !1
    }

    pub(crate) fn new_real(hash_code: u32, key: K, value: V) -> Self {
        Entry {
            hash_code,
            split_key: Self::real_split_key(hash_code),
            key: Some(key),
            value: Atomic::new(value),
        }
    }

    pub(crate) fn new_dummy(index: u32) -> Self {
        Entry {
            hash_code: index,
            split_key: Self::dummy_split_key(index),
            key: None,
            value: Atomic::null(),
        }
    }

    /// The derived predicate from spec.md §3.1: `split_key & 1 == 1`.
    pub(crate) fn is_real(&self) -> bool {
        self.split_key & 1 == 1
    }

    /// Takes ownership of the boxed value, consuming `self`. Leaves
    /// `self.value` null before it drops, so `Entry`'s own `Drop` (which
    /// only frees a non-null value) becomes a no-op for the rest of this
    /// value's teardown.
    pub(crate) fn into_value(mut self) -> Atomic<V> {
        core::mem::replace(&mut self.value, Atomic::null())
    }
}

impl<K, V> PartialEq for Entry<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.split_key == other.split_key
    }
}

impl<K, V> Eq for Entry<K, V> {}

impl<K, V> PartialOrd for Entry<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K, V> Ord for Entry<K, V> {
    /// List ordering is by `split_key` alone (spec.md §4.2); two entries
    /// with different keys but the same `hash_code` compare equal here,
    /// and are told apart by the key-aware second pass (§4.3).
    fn cmp(&self, other: &Self) -> Ordering {
        self.split_key.cmp(&other.split_key)
    }
}

/// Frees the boxed value, if any. Only ever runs on an `Entry` that is no
/// longer reachable by any other thread: either it is owned locally (a
/// node rejected by a failed CAS) or the surrounding `Node` is being
/// freed by `List`'s own `Drop`, which only happens after the epoch has
/// confirmed no reader can still be dereferencing it.
impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let v = self.value.load(AtomicOrdering::Relaxed, guard);
            if !v.is_null() {
                drop(v.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_and_dummy_tag_bits_differ() {
        let real: Entry<u32, u32> = Entry::new_real(7, 7, 7);
        let dummy: Entry<u32, u32> = Entry::new_dummy(7);
        assert!(real.is_real());
        assert!(!dummy.is_real());
        assert_ne!(real.split_key, dummy.split_key);
    }

    #[test]
    fn ordering_is_by_split_key_only() {
        let a: Entry<u32, u32> = Entry::new_real(1, 1, 10);
        let b: Entry<u32, u32> = Entry::new_dummy(0);
        assert_eq!(a.cmp(&b), Entry::<u32, u32>::real_split_key(1).cmp(&0));
    }
}
