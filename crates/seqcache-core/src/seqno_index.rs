//! Dense-by-seqno index of live buffers.
//!
//! Maps sequence numbers to payload pointers. Storage is a deque indexed
//! by `seqno - base`, dense between [`SeqnoIndex::index_front`] and
//! [`SeqnoIndex::index_back`] with `None` holes where a seqno was never
//! seen or has been erased. Inserts are strictly increasing, so the deque
//! only ever grows at the back; erasure trims both ends.

use std::collections::VecDeque;
use std::ptr::NonNull;

use crate::header::{Seqno, SEQNO_NONE};

/// Error from [`SeqnoIndex::insert`].
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The seqno does not extend the index.
    #[error("seqno {seqno} is not greater than the index back {back}")]
    NotMonotonic {
        /// The rejected seqno.
        seqno: Seqno,
        /// Current back (or the clear base when empty).
        back: Seqno,
    },
    /// The gap to the new seqno could not be reserved.
    #[error("failed to reserve {entries} index entries")]
    OutOfMemory {
        /// Number of entries the insert needed.
        entries: usize,
    },
}

/// A compact seqno-to-pointer map.
#[derive(Debug, Default)]
pub struct SeqnoIndex {
    /// Seqno of `slots[0]`; meaningful only when `slots` is non-empty.
    base: Seqno,
    /// Floor for the first insert after a clear.
    clear_base: Seqno,
    slots: VecDeque<Option<NonNull<u8>>>,
}

// SAFETY: the index stores plain pointers into a mapping owned by the
// ring buffer; it never dereferences them itself.
unsafe impl Send for SeqnoIndex {}

impl SeqnoIndex {
    /// Creates an empty index accepting any positive seqno.
    #[must_use]
    pub fn new() -> Self {
        SeqnoIndex {
            base: SEQNO_NONE,
            clear_base: SEQNO_NONE,
            slots: VecDeque::new(),
        }
    }

    /// Whether the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots between front and back, holes included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Lowest indexed seqno.
    #[must_use]
    pub fn index_front(&self) -> Option<Seqno> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.base)
        }
    }

    /// Highest indexed seqno.
    #[must_use]
    pub fn index_back(&self) -> Option<Seqno> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.base + self.slots.len() as Seqno - 1)
        }
    }

    /// Pointer stored under `seqno`, if any.
    #[must_use]
    pub fn get(&self, seqno: Seqno) -> Option<NonNull<u8>> {
        let idx = usize::try_from(seqno.checked_sub(self.base)?).ok()?;
        self.slots.get(idx).copied().flatten()
    }

    /// Pointer at the front (always non-null by construction).
    #[must_use]
    pub fn front(&self) -> Option<NonNull<u8>> {
        self.slots.front().copied().flatten()
    }

    /// Pointer at the back (always non-null by construction).
    #[must_use]
    pub fn back(&self) -> Option<NonNull<u8>> {
        self.slots.back().copied().flatten()
    }

    /// Inserts `ptr` under `seqno`.
    ///
    /// # Errors
    ///
    /// The seqno must be positive and exceed [`Self::index_back`] (or the
    /// clear base when the index is empty); the gap, if any, must be
    /// reservable.
    pub fn insert(&mut self, seqno: Seqno, ptr: NonNull<u8>) -> Result<(), IndexError> {
        let floor = self.index_back().unwrap_or(self.clear_base);
        if seqno <= floor {
            return Err(IndexError::NotMonotonic { seqno, back: floor });
        }

        if self.slots.is_empty() {
            self.slots.push_back(Some(ptr));
            self.base = seqno;
            return Ok(());
        }

        let gap = usize::try_from(seqno - floor - 1).unwrap_or(usize::MAX);
        let needed = gap.saturating_add(1);
        self.slots
            .try_reserve(needed)
            .map_err(|_| IndexError::OutOfMemory { entries: needed })?;
        for _ in 0..gap {
            self.slots.push_back(None);
        }
        self.slots.push_back(Some(ptr));
        Ok(())
    }

    /// Removes the entry for `seqno`, leaving a hole (or trimming the
    /// edges when the hole would border the front or back).
    pub fn erase(&mut self, seqno: Seqno) {
        let Some(front) = self.index_front() else {
            return;
        };
        let Ok(idx) = usize::try_from(seqno - front) else {
            return;
        };
        if idx >= self.slots.len() {
            return;
        }
        self.slots[idx] = None;
        self.trim();
    }

    /// Removes every entry with seqno at most `seqno`.
    pub fn erase_up_to(&mut self, seqno: Seqno) {
        while let Some(front) = self.index_front() {
            if front > seqno {
                break;
            }
            self.slots.pop_front();
            self.base += 1;
            self.trim_front();
        }
    }

    /// Drops all entries; the next insert must exceed `base`.
    pub fn clear(&mut self, base: Seqno) {
        self.slots.clear();
        self.base = SEQNO_NONE;
        self.clear_base = base;
    }

    /// Iterates `(seqno, ptr)` for every present entry, front to back.
    pub fn iter(&self) -> impl Iterator<Item = (Seqno, NonNull<u8>)> + '_ {
        let base = self.base;
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(i, p)| p.map(|p| (base + i as Seqno, p)))
    }

    /// Iterates `(seqno, slot)` back to front, holes included — recovery
    /// walks this to find the longest gapless suffix.
    pub fn iter_rev_with_holes(
        &self,
    ) -> impl Iterator<Item = (Seqno, Option<NonNull<u8>>)> + '_ {
        let base = self.base;
        self.slots
            .iter()
            .enumerate()
            .rev()
            .map(move |(i, p)| (base + i as Seqno, *p))
    }

    /// Drops leading and trailing holes so front/back stay non-null.
    fn trim(&mut self) {
        self.trim_front();
        while matches!(self.slots.back(), Some(None)) {
            self.slots.pop_back();
        }
    }

    fn trim_front(&mut self) {
        while matches!(self.slots.front(), Some(None)) {
            self.slots.pop_front();
            self.base += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(v: usize) -> NonNull<u8> {
        NonNull::new(v as *mut u8).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let mut idx = SeqnoIndex::new();
        assert!(idx.is_empty());
        idx.insert(5, ptr(0x50)).unwrap();
        idx.insert(6, ptr(0x60)).unwrap();
        assert_eq!(idx.index_front(), Some(5));
        assert_eq!(idx.index_back(), Some(6));
        assert_eq!(idx.get(5), Some(ptr(0x50)));
        assert_eq!(idx.get(6), Some(ptr(0x60)));
        assert_eq!(idx.get(7), None);
        assert_eq!(idx.get(4), None);
    }

    #[test]
    fn test_insert_rejects_non_monotonic() {
        let mut idx = SeqnoIndex::new();
        idx.insert(10, ptr(0x10)).unwrap();
        assert!(idx.insert(10, ptr(0x11)).is_err());
        assert!(idx.insert(3, ptr(0x03)).is_err());
        idx.insert(11, ptr(0x11)).unwrap();
    }

    #[test]
    fn test_holes() {
        let mut idx = SeqnoIndex::new();
        idx.insert(1, ptr(0x1)).unwrap();
        idx.insert(4, ptr(0x4)).unwrap();
        assert_eq!(idx.len(), 4);
        assert_eq!(idx.get(2), None);
        assert_eq!(idx.get(3), None);
        assert_eq!(idx.get(4), Some(ptr(0x4)));

        let present: Vec<Seqno> = idx.iter().map(|(s, _)| s).collect();
        assert_eq!(present, vec![1, 4]);
    }

    #[test]
    fn test_erase_trims_edges() {
        let mut idx = SeqnoIndex::new();
        for s in 1..=5 {
            idx.insert(s, ptr(s as usize)).unwrap();
        }
        idx.erase(1);
        assert_eq!(idx.index_front(), Some(2));
        idx.erase(5);
        assert_eq!(idx.index_back(), Some(4));
        // A middle erase leaves a hole.
        idx.erase(3);
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.get(3), None);
        assert_eq!(idx.index_front(), Some(2));
        assert_eq!(idx.index_back(), Some(4));
    }

    #[test]
    fn test_erase_up_to() {
        let mut idx = SeqnoIndex::new();
        for s in 3..=9 {
            idx.insert(s, ptr(s as usize)).unwrap();
        }
        idx.erase_up_to(6);
        assert_eq!(idx.index_front(), Some(7));
        assert_eq!(idx.index_back(), Some(9));
        idx.erase_up_to(100);
        assert!(idx.is_empty());
    }

    #[test]
    fn test_clear_sets_floor() {
        let mut idx = SeqnoIndex::new();
        idx.insert(5, ptr(0x5)).unwrap();
        idx.clear(10);
        assert!(idx.is_empty());
        assert!(idx.insert(10, ptr(0xA)).is_err());
        idx.insert(11, ptr(0xB)).unwrap();
    }

    #[test]
    fn test_reverse_iteration_with_holes() {
        let mut idx = SeqnoIndex::new();
        idx.insert(5, ptr(0x5)).unwrap();
        idx.insert(6, ptr(0x6)).unwrap();
        idx.insert(8, ptr(0x8)).unwrap();

        let walk: Vec<(Seqno, bool)> = idx
            .iter_rev_with_holes()
            .map(|(s, p)| (s, p.is_some()))
            .collect();
        assert_eq!(walk, vec![(8, true), (7, false), (6, true), (5, true)]);
    }

    #[test]
    fn test_front_back_pointers() {
        let mut idx = SeqnoIndex::new();
        idx.insert(2, ptr(0x2)).unwrap();
        idx.insert(3, ptr(0x3)).unwrap();
        assert_eq!(idx.front(), Some(ptr(0x2)));
        assert_eq!(idx.back(), Some(ptr(0x3)));
    }
}
