//! A Harris–Michael lock-free sorted singly linked list over
//! `crossbeam-epoch`.
//!
//! spec.md treats this structure as an external collaborator (§6.2),
//! fixing only the contract the hash table needs from it (`search`,
//! `next`, `add_before`, `do_remove`). In the project this spec was
//! distilled from, that collaborator lives in a separate crate fetched
//! from a private course repository; since this crate can't depend on
//! that repository, it supplies its own, grounded in the same
//! Harris–Michael algorithm the reference pack's `ebr`-based list
//! implementations use.
//!
//! Ordering is supplied per call as a comparator rather than fixed via an
//! `Ord` bound on the payload, so the hash table can search by
//! `split_key` alone without constructing a throwaway payload just to
//! compare against it (needed for the key-aware second pass of §4.3).

use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::Ordering;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

#[derive(Debug)]
pub(crate) struct Node<P> {
    entry: P,
    /// Tag 1 on this pointer marks `self`, not the successor, as
    /// logically removed (Harris's technique).
    next: Atomic<Node<P>>,
}

impl<P> Node<P> {
    fn new(entry: P) -> Self {
        Node {
            entry,
            next: Atomic::null(),
        }
    }
}

/// A lock-free list of `P`, ordered by whatever comparator callers search
/// it with.
#[derive(Debug)]
pub(crate) struct List<P> {
    head: Atomic<Node<P>>,
}

impl<P> Default for List<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot cursor: `prev` is the slot that should point at the node
/// satisfying the search (for `add_before`), `curr` is that node itself,
/// or null if none does (§6.2: "node = nil if none, with left/right
/// bracketing the insertion point").
pub(crate) struct Cursor<'g, P> {
    prev: &'g Atomic<Node<P>>,
    pub(crate) curr: Shared<'g, Node<P>>,
}

/// A handle to a node already known to be in the list, usable as the
/// starting point for a subsequent search (e.g. searching past a bucket
/// dummy, or past a colliding entry during the key-aware refinement).
pub(crate) type NodeRef<'g, P> = Shared<'g, Node<P>>;

impl<P> List<P> {
    pub(crate) fn new() -> Self {
        List {
            head: Atomic::null(),
        }
    }

    /// The slot to search from when resolving bucket 0 (spec.md §4.4,
    /// base case): the list's own head.
    pub(crate) fn head_slot(&self) -> &Atomic<Node<P>> {
        &self.head
    }

    /// The slot to search from when resolving anything past `node`.
    pub(crate) fn next_slot<'g>(node: NodeRef<'g, P>) -> &'g Atomic<Node<P>> {
        unsafe { &node.deref().next }
    }

    pub(crate) fn entry<'g>(node: NodeRef<'g, P>) -> &'g P {
        unsafe { &node.deref().entry }
    }

    /// Peeks at the payload of a not-yet-published node, e.g. to read a
    /// search key back out before attempting `add_before`.
    pub(crate) fn peek(owned: &Owned<Node<P>>) -> &P {
        &owned.entry
    }

    /// Harris–Michael find: advances `prev`/`curr` while `cmp(curr) ==
    /// Less`, physically unlinking logically-removed nodes it passes
    /// over along the way.
    pub(crate) fn search<'g>(
        &'g self,
        from: &'g Atomic<Node<P>>,
        mut cmp: impl FnMut(&P) -> CmpOrdering,
        guard: &'g Guard,
    ) -> Cursor<'g, P> {
        loop {
            if let Some(cursor) = self.search_inner(from, &mut cmp, guard) {
                return cursor;
            }
        }
    }

    fn search_inner<'g>(
        &'g self,
        from: &'g Atomic<Node<P>>,
        cmp: &mut impl FnMut(&P) -> CmpOrdering,
        guard: &'g Guard,
    ) -> Option<Cursor<'g, P>> {
        let mut cursor = Cursor {
            prev: from,
            curr: from.load(Ordering::Acquire, guard),
        };
        loop {
            let curr_node = match unsafe { cursor.curr.as_ref() } {
                None => return Some(cursor),
                Some(n) => n,
            };
            let mut next = curr_node.next.load(Ordering::Acquire, guard);
            if next.tag() == 0 {
                match cmp(&curr_node.entry) {
                    CmpOrdering::Less => cursor.prev = &curr_node.next,
                    _ => return Some(cursor),
                }
            } else {
                next = next.with_tag(0);
                match cursor.prev.compare_exchange(
                    cursor.curr,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Err(_) => return None,
                    Ok(_) => unsafe { guard.defer_destroy(cursor.curr) },
                }
            }
            cursor.curr = next;
        }
    }

    /// Atomically inserts `new` between `cursor.prev` and `cursor.curr`,
    /// provided nothing has changed there since the search. On failure
    /// the rejected `Owned` is handed back so the caller can retry
    /// without reconstructing it.
    pub(crate) fn add_before<'g>(
        &'g self,
        cursor: &Cursor<'g, P>,
        mut new: Owned<Node<P>>,
        guard: &'g Guard,
    ) -> Result<NodeRef<'g, P>, Owned<Node<P>>> {
        new.next.store(cursor.curr, Ordering::Relaxed);
        match cursor
            .prev
            .compare_exchange(cursor.curr, new, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(inserted) => Ok(inserted),
            Err(e) => Err(e.new),
        }
    }

    /// Logically then physically removes the node at `cursor.curr`.
    /// Returns `false` if it lost the race to mark the node (someone
    /// else removed it first); the caller's retry loop re-searches.
    pub(crate) fn do_remove<'g>(&'g self, cursor: &Cursor<'g, P>, guard: &'g Guard) -> bool {
        let curr_node = unsafe { cursor.curr.as_ref().expect("do_remove on a null cursor") };
        let next = curr_node.next.fetch_or(1, Ordering::AcqRel, guard);
        if next.tag() == 1 {
            return false;
        }
        if cursor
            .prev
            .compare_exchange(cursor.curr, next, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            unsafe { guard.defer_destroy(cursor.curr) };
        }
        true
    }

    /// Creates a fresh, not-yet-linked node, for `add_before`.
    pub(crate) fn new_node(entry: P) -> Owned<Node<P>> {
        Owned::new(Node::new(entry))
    }

    /// Unwraps a node rejected by a failed `add_before`/never published,
    /// handing back its payload.
    pub(crate) fn into_entry(owned: Owned<Node<P>>) -> P {
        owned.into_box().entry
    }

    /// A snapshot, skip-marked-nodes iterator from the head of the list.
    pub(crate) fn iter<'g>(&'g self, guard: &'g Guard) -> ListIter<'g, P> {
        ListIter {
            current: self.head.load(Ordering::Acquire, guard),
            guard,
        }
    }
}

pub(crate) struct ListIter<'g, P> {
    current: Shared<'g, Node<P>>,
    guard: &'g Guard,
}

impl<'g, P> Iterator for ListIter<'g, P> {
    type Item = &'g P;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = unsafe { self.current.as_ref() }?;
            let next = node.next.load(Ordering::Acquire, self.guard);
            let marked = next.tag() != 0;
            self.current = next.with_tag(0);
            if !marked {
                return Some(&node.entry);
            }
            // `node` is logically removed; skip it and keep walking.
        }
    }
}

impl<P> Drop for List<P> {
    /// Frees every remaining node's storage (marked or not); `Entry`'s
    /// own `Drop` (run as part of dropping `Node<P>`, where `P = Entry<K,
    /// V>`) frees any boxed value still attached.
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let mut curr = self.head.load(Ordering::Relaxed, guard);
            while let Some(node) = curr.as_ref() {
                let next = node.next.load(Ordering::Relaxed, guard).with_tag(0);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    fn insert(list: &List<i32>, value: i32, guard: &Guard) {
        let mut owned = List::new_node(value);
        loop {
            let cursor = list.search(list.head_slot(), |e| e.cmp(&value), guard);
            if unsafe { cursor.curr.as_ref() }.is_some_and(|n| n.entry == value) {
                List::into_entry(owned);
                return;
            }
            match list.add_before(&cursor, owned, guard) {
                Ok(_) => return,
                Err(rejected) => owned = rejected,
            }
        }
    }

    #[test]
    fn search_finds_inserted_values_in_order() {
        let list: List<i32> = List::new();
        let guard = epoch::pin();
        for v in [5, 1, 3, 2, 4] {
            insert(&list, v, &guard);
        }
        let collected: Vec<i32> = list.iter(&guard).copied().collect();
        assert_eq!(collected, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn do_remove_drops_from_iteration() {
        let list: List<i32> = List::new();
        let guard = epoch::pin();
        for v in [1, 2, 3] {
            insert(&list, v, &guard);
        }
        let cursor = list.search(list.head_slot(), |e| e.cmp(&2), &guard);
        assert!(list.do_remove(&cursor, &guard));
        let collected: Vec<i32> = list.iter(&guard).copied().collect();
        assert_eq!(collected, vec![1, 3]);
    }

    #[test]
    fn do_remove_twice_fails_second_time() {
        let list: List<i32> = List::new();
        let guard = epoch::pin();
        insert(&list, 1, &guard);
        let cursor = list.search(list.head_slot(), |e| e.cmp(&1), &guard);
        assert!(list.do_remove(&cursor, &guard));
        assert!(!list.do_remove(&cursor, &guard));
    }
}
