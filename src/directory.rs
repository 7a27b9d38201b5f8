//! The two-level bucket directory (spec.md §3.1, component 4 of §2).
//!
//! Level 0 is a fixed array of 32 slots. Slot `s` (once allocated) backs
//! `max(1, 2^(s-1))` logical buckets. Sub-arrays are published once, by
//! CAS, and never mutated afterward — only their individual cells are
//! CAS-filled from null to a node pointer as buckets are lazily
//! materialized (spec.md §4.4) or proactively reserved by growth (§4.6).

use core::sync::atomic::Ordering;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::bits::super_sub;

/// The directory top level is fixed at 32 slots because the ordering key
/// is 32-bit (spec.md §9, "Growth cap").
pub(crate) const TOP_SLOTS: usize = 32;

struct Segment<T> {
    cells: Box<[Atomic<T>]>,
}

impl<T> Segment<T> {
    fn new(len: usize) -> Self {
        let cells = (0..len).map(|_| Atomic::null()).collect::<Vec<_>>().into_boxed_slice();
        Segment { cells }
    }
}

pub(crate) struct Directory<T> {
    top: [Atomic<Segment<T>>; TOP_SLOTS],
}

impl<T> Directory<T> {
    pub(crate) fn new() -> Self {
        Directory {
            top: core::array::from_fn(|_| Atomic::null()),
        }
    }

    fn segment_len(super_idx: usize) -> usize {
        if super_idx == 0 {
            1
        } else {
            1usize << (super_idx - 1)
        }
    }

    /// Ensures the sub-array backing `super_idx` exists, CAS-publishing
    /// one if not. Idempotent and safe to race: at most one publisher
    /// wins, everyone else just reads what won.
    pub(crate) fn ensure_segment<'g>(&'g self, super_idx: usize, guard: &'g Guard) {
        let slot = &self.top[super_idx];
        if !slot.load(Ordering::Acquire, guard).is_null() {
            return;
        }
        let fresh = Owned::new(Segment::new(Self::segment_len(super_idx)));
        if let Err(e) = slot.compare_exchange(
            Shared::null(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            drop(e.new);
        }
    }

    /// The directory cell for logical bucket `index`, materializing the
    /// backing sub-array if necessary. The cell itself may still hold
    /// null — callers decide whether that means "not yet materialized".
    pub(crate) fn cell<'g>(&'g self, index: u32, guard: &'g Guard) -> &'g Atomic<T> {
        let (super_idx, sub_idx) = super_sub(index);
        self.ensure_segment(super_idx, guard);
        let segment = unsafe {
            self.top[super_idx]
                .load(Ordering::Acquire, guard)
                .deref()
        };
        &segment.cells[sub_idx]
    }
}

impl<T> Drop for Directory<T> {
    /// Frees the segment backing arrays. The cells inside them are
    /// non-owning references into the list — those nodes are the list's
    /// responsibility to free, not the directory's.
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            for slot in self.top.iter() {
                let seg = slot.load(Ordering::Relaxed, guard);
                if !seg.is_null() {
                    drop(seg.into_owned());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn cell_is_stable_across_calls() {
        let dir: Directory<u64> = Directory::new();
        let guard = epoch::pin();
        let a = dir.cell(5, &guard) as *const _;
        let b = dir.cell(5, &guard) as *const _;
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_indices_in_same_segment_get_distinct_cells() {
        let dir: Directory<u64> = Directory::new();
        let guard = epoch::pin();
        let a = dir.cell(6, &guard) as *const _;
        let b = dir.cell(7, &guard) as *const _;
        assert_ne!(a, b);
    }

    #[test]
    fn publish_and_read_back() {
        let dir: Directory<u64> = Directory::new();
        let guard = epoch::pin();
        let owned = Owned::new(99u64);
        let cell = dir.cell(3, &guard);
        cell.compare_exchange(
            Shared::null(),
            owned,
            Ordering::AcqRel,
            Ordering::Acquire,
            &guard,
        )
        .unwrap();
        let read = unsafe { dir.cell(3, &guard).load(Ordering::Acquire, &guard).deref() };
        assert_eq!(*read, 99);
    }
}
