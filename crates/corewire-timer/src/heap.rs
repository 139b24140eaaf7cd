use std::{
    cmp::Ordering,
    sync::{atomic::{AtomicU32, Ordering as AtomicOrdering}, Arc},
    time::Instant,
};

use crate::handle::{TimerHandle, INVALID_HANDLE};

/// Shared cell backing one live heap reference to a timer entry.
///
/// Holds the owning timer's handle while the reference is live, or
/// [`INVALID_HANDLE`] once tombstoned. A timer entry and the heap slot that
/// points at it share one of these; `stop`/`restart`/`delete` tombstone it
/// in O(1) instead of touching the heap, and the worker discards tombstoned
/// slots lazily as it pops them.
pub(crate) type SlotCell = Arc<AtomicU32>;

pub(crate) fn new_cell(handle: TimerHandle) -> SlotCell {
    Arc::new(AtomicU32::new(handle))
}

pub(crate) fn tombstone(cell: &SlotCell) {
    cell.store(INVALID_HANDLE, AtomicOrdering::SeqCst);
}

pub(crate) fn is_tombstoned(cell: &SlotCell) -> bool {
    cell.load(AtomicOrdering::SeqCst) == INVALID_HANDLE
}

/// One live heap reference: an absolute expiration and the cell it's
/// indirected through. Ordered for use in a `BinaryHeap` as a min-heap by
/// expiration (earliest first).
pub(crate) struct HeapItem {
    pub(crate) expiration: Instant,
    pub(crate) cell: SlotCell,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.expiration == other.expiration
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest
        // expiration at the top.
        other.expiration.cmp(&self.expiration)
    }
}
