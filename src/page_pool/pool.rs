//! Page pool bookkeeping: the buffer arena, page map, and pool-level lists.

use std::collections::HashMap;

use super::buffer::{BufferId, PageBuffer};
use super::list::{BufferList, FreeSlot, LogSlot, LruSlot};
use crate::store::StoreId;

/// Bounded cache of page buffers keyed by (store, page id).
///
/// Buffers are created lazily up to `capacity`, then recycled forever. An
/// unpinned buffer lives in exactly one pool-level list: the LRU list while
/// bound to a store, the free list while unbound. Pinned buffers are in
/// neither.
///
/// Eviction is strict LRU over unpinned bound buffers. The free list is
/// used as a stack (LIFO) because the most recently freed buffer has the
/// highest chance of still being in the CPU's caches; the LRU list evicts
/// from the front (oldest first). Both orders are observable.
pub(crate) struct PagePool {
    page_shift: usize,
    page_size: usize,
    capacity: usize,

    /// Buffer arena. Grows up to `capacity`; never shrinks before teardown.
    buffers: Vec<PageBuffer>,

    /// Maps (store, page id) to the buffer caching that page.
    map: HashMap<(StoreId, u64), BufferId>,

    free_list: BufferList<FreeSlot>,
    lru_list: BufferList<LruSlot>,

    /// Pages with outstanding log records, in insertion order. Walked in
    /// that order at commit time.
    log_list: BufferList<LogSlot>,

    /// Number of buffers with pin count > 0.
    pinned: usize,
}

impl PagePool {
    pub(crate) fn new(page_shift: usize, capacity: usize) -> Self {
        let page_size = 1usize << page_shift;
        debug_assert_eq!(page_size & (page_size - 1), 0);

        Self {
            page_shift,
            page_size,
            capacity,
            buffers: Vec::new(),
            map: HashMap::new(),
            free_list: BufferList::new(),
            lru_list: BufferList::new(),
            log_list: BufferList::new(),
            pinned: 0,
        }
    }

    pub(crate) fn page_shift(&self) -> usize {
        self.page_shift
    }

    /// Number of buffers created so far.
    pub(crate) fn allocated_pages(&self) -> usize {
        self.buffers.len()
    }

    /// Number of buffers sitting in the free list.
    pub(crate) fn unused_pages(&self) -> usize {
        self.free_list.len()
    }

    /// Number of buffers with pin count > 0.
    pub(crate) fn pinned_pages(&self) -> usize {
        self.pinned
    }

    pub(crate) fn buffer(&self, id: BufferId) -> &PageBuffer {
        &self.buffers[id.as_usize()]
    }

    pub(crate) fn buffer_mut(&mut self, id: BufferId) -> &mut PageBuffer {
        &mut self.buffers[id.as_usize()]
    }

    /// The raw arena, for lists whose heads live outside the pool
    /// (per-transaction page lists).
    pub(crate) fn arena(&self) -> &[PageBuffer] {
        &self.buffers
    }

    pub(crate) fn arena_mut(&mut self) -> &mut [PageBuffer] {
        &mut self.buffers
    }

    /// Adds a pin, maintaining the pinned-buffer counter. Does not touch
    /// list membership; callers handle the transition.
    pub(crate) fn pin(&mut self, id: BufferId) {
        let buffer = &mut self.buffers[id.as_usize()];
        if buffer.is_unpinned() {
            self.pinned += 1;
        }
        buffer.add_pin();
    }

    /// Removes a pin, maintaining the pinned-buffer counter.
    pub(crate) fn unpin(&mut self, id: BufferId) {
        let buffer = &mut self.buffers[id.as_usize()];
        buffer.remove_pin();
        if buffer.is_unpinned() {
            self.pinned -= 1;
        }
    }

    /// Re-pins a buffer that is bound to a store, removing it from the LRU
    /// list if this is its first pin.
    pub(crate) fn pin_store_page(&mut self, id: BufferId) {
        debug_assert!(self.buffer(id).owner().is_some());
        if self.buffer(id).is_unpinned() {
            self.lru_list.remove(&mut self.buffers, id);
        }
        self.pin(id);
    }

    /// Drops a pin on a bound buffer; the last pin moves it to the LRU list.
    pub(crate) fn unpin_store_page(&mut self, id: BufferId) {
        debug_assert!(self.buffer(id).owner().is_some());
        self.unpin(id);
        if self.buffer(id).is_unpinned() {
            self.lru_list.push_back(&mut self.buffers, id);
        }
    }

    /// Drops a pin on an unbound buffer; the last pin moves it to the free
    /// list.
    pub(crate) fn unpin_unassigned_page(&mut self, id: BufferId) {
        debug_assert!(self.buffer(id).owner().is_none());
        self.unpin(id);
        if self.buffer(id).is_unpinned() {
            self.free_list.push_front(&mut self.buffers, id);
        }
    }

    /// Parks an unpinned, unbound buffer in the free list.
    pub(crate) fn push_free(&mut self, id: BufferId) {
        debug_assert!(self.buffer(id).is_unpinned());
        debug_assert!(self.buffer(id).owner().is_none());
        self.free_list.push_front(&mut self.buffers, id);
    }

    /// Produces a pinned buffer from the free list or by growing the arena.
    ///
    /// Returns `None` when the free list is empty and the arena is at
    /// capacity; the caller decides whether to evict.
    pub(crate) fn alloc_ready(&mut self) -> Option<BufferId> {
        if let Some(id) = self.free_list.pop_front(&mut self.buffers) {
            self.pin(id);
            debug_assert!(self.buffer(id).owner().is_none());
            debug_assert!(!self.buffer(id).is_dirty());
            return Some(id);
        }

        if self.buffers.len() < self.capacity {
            let id = BufferId(self.buffers.len() as u32);
            self.buffers.push(PageBuffer::new(self.page_size));
            // New buffers start with one pin.
            self.pinned += 1;
            return Some(id);
        }

        None
    }

    /// Oldest unpinned bound buffer, if any.
    pub(crate) fn lru_front(&self) -> Option<BufferId> {
        self.lru_list.front()
    }

    pub(crate) fn lru_remove(&mut self, id: BufferId) {
        self.lru_list.remove(&mut self.buffers, id);
    }

    pub(crate) fn lookup(&self, store: StoreId, page_id: u64) -> Option<BufferId> {
        self.map.get(&(store, page_id)).copied()
    }

    pub(crate) fn map_insert(&mut self, store: StoreId, page_id: u64, id: BufferId) {
        let previous = self.map.insert((store, page_id), id);
        debug_assert!(previous.is_none(), "two buffers bound to one store page");
    }

    pub(crate) fn map_remove(&mut self, store: StoreId, page_id: u64) {
        let removed = self.map.remove(&(store, page_id));
        debug_assert!(removed.is_some());
    }

    #[cfg(test)]
    pub(crate) fn mapped_pages(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn log_list_push(&mut self, id: BufferId) {
        if !self.log_list.contains(&self.buffers, id) {
            self.log_list.push_back(&mut self.buffers, id);
        }
    }

    pub(crate) fn log_list_remove(&mut self, id: BufferId) {
        if self.log_list.contains(&self.buffers, id) {
            self.log_list.remove(&mut self.buffers, id);
        }
    }

    pub(crate) fn log_list_front(&self) -> Option<BufferId> {
        self.log_list.front()
    }

    pub(crate) fn log_list_next(&self, id: BufferId) -> Option<BufferId> {
        self.log_list.next_of(&self.buffers, id)
    }

    /// Releases every buffer. All pins must have been dropped; the LRU list
    /// may still hold pages of stores that were closed by a write failure
    /// (crash-close), which are discarded without writeback.
    pub(crate) fn teardown(&mut self) {
        debug_assert_eq!(self.pinned, 0, "teardown with pinned pages");

        while self.free_list.pop_front(&mut self.buffers).is_some() {}
        while self.lru_list.pop_front(&mut self.buffers).is_some() {}
        self.map.clear();
        self.buffers.clear();
    }

    /// Checks the per-buffer list/pin/binding invariants.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert!(self.buffers.len() <= self.capacity);
        assert!(self.map.len() <= self.buffers.len());

        let mut pinned = 0;
        for (index, buffer) in self.buffers.iter().enumerate() {
            let id = BufferId(index as u32);
            let in_free = self.free_list.contains(&self.buffers, id);
            let in_lru = self.lru_list.contains(&self.buffers, id);
            let bound = buffer.owner().is_some();

            if buffer.is_unpinned() {
                // Unpinned: in exactly the list matching its binding.
                assert_eq!(in_lru, bound, "buffer {index} in wrong list");
                assert_eq!(in_free, !bound, "buffer {index} in wrong list");
            } else {
                pinned += 1;
                assert!(!in_free && !in_lru, "pinned buffer {index} in a list");
            }

            if buffer.is_dirty() {
                assert!(bound, "dirty buffer {index} is unbound");
            }
        }
        assert_eq!(pinned, self.pinned);

        for &id in self.map.values() {
            assert!(self.buffer(id).owner().is_some());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pool_is_empty() {
        let pool = PagePool::new(12, 42);
        assert_eq!(pool.page_shift(), 12);
        assert_eq!(pool.page_size, 4096);
        assert_eq!(pool.capacity, 42);
        assert_eq!(pool.allocated_pages(), 0);
        assert_eq!(pool.unused_pages(), 0);
        assert_eq!(pool.pinned_pages(), 0);
    }

    #[test]
    fn test_alloc_state() {
        let mut pool = PagePool::new(12, 1);

        let id = pool.alloc_ready().expect("one buffer under capacity");
        assert_eq!(pool.allocated_pages(), 1);
        assert_eq!(pool.unused_pages(), 0);
        assert_eq!(pool.pinned_pages(), 1);

        let buffer = pool.buffer(id);
        assert!(!buffer.is_dirty());
        assert!(!buffer.is_unpinned());
        assert!(buffer.owner().is_none());
        assert_eq!(buffer.data().len(), 4096);

        pool.unpin_unassigned_page(id);
        pool.check_invariants();
        pool.teardown();
    }

    #[test]
    fn test_alloc_respects_capacity() {
        let mut pool = PagePool::new(12, 1);

        let id = pool.alloc_ready().unwrap();
        assert!(pool.alloc_ready().is_none());
        assert_eq!(pool.allocated_pages(), 1);
        assert_eq!(pool.pinned_pages(), 1);

        pool.unpin_unassigned_page(id);
        assert_eq!(pool.allocated_pages(), 1);
        assert_eq!(pool.unused_pages(), 1);
        assert_eq!(pool.pinned_pages(), 0);
        pool.teardown();
    }

    #[test]
    fn test_alloc_reuses_freed_buffer() {
        let mut pool = PagePool::new(12, 1);

        let id = pool.alloc_ready().unwrap();
        pool.unpin_unassigned_page(id);
        assert_eq!(pool.unused_pages(), 1);

        let id2 = pool.alloc_ready().unwrap();
        assert_eq!(id, id2);
        assert_eq!(pool.allocated_pages(), 1);
        assert_eq!(pool.unused_pages(), 0);
        assert_eq!(pool.pinned_pages(), 1);

        pool.unpin_unassigned_page(id2);
        pool.teardown();
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut pool = PagePool::new(12, 3);

        let a = pool.alloc_ready().unwrap();
        let b = pool.alloc_ready().unwrap();
        let c = pool.alloc_ready().unwrap();

        pool.unpin_unassigned_page(a);
        pool.unpin_unassigned_page(b);
        pool.unpin_unassigned_page(c);

        // Most recently freed comes back first.
        assert_eq!(pool.alloc_ready(), Some(c));
        assert_eq!(pool.alloc_ready(), Some(b));
        assert_eq!(pool.alloc_ready(), Some(a));

        for id in [a, b, c] {
            pool.unpin_unassigned_page(id);
        }
        pool.teardown();
    }

    #[test]
    fn test_pin_counter_tracks_transitions() {
        let mut pool = PagePool::new(12, 2);

        let a = pool.alloc_ready().unwrap();
        let b = pool.alloc_ready().unwrap();
        assert_eq!(pool.pinned_pages(), 2);

        // Extra pins on an already pinned buffer do not change the counter.
        pool.pin(a);
        assert_eq!(pool.pinned_pages(), 2);
        pool.unpin(a);
        assert_eq!(pool.pinned_pages(), 2);

        pool.unpin_unassigned_page(a);
        assert_eq!(pool.pinned_pages(), 1);
        pool.unpin_unassigned_page(b);
        assert_eq!(pool.pinned_pages(), 0);
        pool.teardown();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "teardown with pinned pages")]
    fn test_teardown_with_pinned_page_panics() {
        let mut pool = PagePool::new(12, 1);
        let _id = pool.alloc_ready().unwrap();
        pool.teardown();
    }
}
