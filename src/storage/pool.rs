//! # Buffer Pool with LRU Eviction and Pinning
//!
//! A process-level cache of fixed-size page frames in front of the paged
//! files. Trees never touch the disk directly: every page access goes
//! through [`BufferPool::get_mut`], which returns a pinned [`PageGuard`].
//!
//! ## Frame States
//!
//! Every frame is in exactly one state:
//!
//! ```text
//! free list ──get_mut miss──> resident (in LRU + both pid↔slot maps)
//!     ^                            │
//!     └───────── eviction ─────────┘  (only with pin count 0;
//!                                      dirty frames written back first)
//! ```
//!
//! ## Pin/Unpin Protocol
//!
//! 1. `get_mut(pid)` loads the page if absent and increments the frame's
//!    pin count.
//! 2. The caller reads or writes through the returned guard; `data_mut`
//!    marks the frame dirty.
//! 3. Dropping the guard decrements the pin count. A frame with a non-zero
//!    pin count is never evicted, so guard-held bytes stay valid.
//!
//! Unpinning below zero is a programming error and fails fast.
//!
//! ## Eviction Policy
//!
//! Strict LRU: on a miss with no free frame, the LRU list is scanned from
//! the least-recent end and the first unpinned frame is taken. If every
//! frame is pinned the miss fails with a pool-exhausted error. A dirty
//! victim is written back before its frame is reused; a miss therefore
//! never loses a committed modification.
//!
//! ## Thread Safety
//!
//! One mutex guards the index state (pid↔slot maps, LRU order, free list).
//! Pin counts and dirty flags are per-frame atomics so guards can be
//! dropped without re-entering the mutex. The pool hands out overlapping
//! mutable borrows of distinct frames; exclusive access *within* one page
//! is the caller's obligation (the tree's per-leaf locks), the same
//! division of labour the page formats assume.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::file::FileTable;

/// Identity of one on-disk page: the registry's file id plus the page index
/// within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub file: u32,
    pub page_no: u32,
}

impl PageId {
    pub fn new(file: u32, page_no: u32) -> Self {
        Self { file, page_no }
    }
}

struct Frame {
    data: UnsafeCell<Box<[u8]>>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }
}

struct PoolState {
    map: HashMap<PageId, usize>,
    resident: Vec<Option<PageId>>,
    lru: VecDeque<usize>,
    free: Vec<usize>,
}

impl PoolState {
    fn new(pool_size: usize) -> Self {
        Self {
            map: HashMap::with_capacity(pool_size),
            resident: vec![None; pool_size],
            lru: VecDeque::with_capacity(pool_size),
            free: (0..pool_size).rev().collect(),
        }
    }

    fn touch(&mut self, slot: usize) {
        if let Some(pos) = self.lru.iter().position(|&s| s == slot) {
            self.lru.remove(pos);
        }
        self.lru.push_front(slot);
    }
}

pub struct BufferPool {
    frames: Box<[Frame]>,
    state: Mutex<PoolState>,
    files: Arc<FileTable>,
    page_size: usize,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("pool_size", &self.frames.len())
            .field("page_size", &self.page_size)
            .finish()
    }
}

// SAFETY: the UnsafeCell'd frame bytes are only reachable through PageGuard,
// whose pin keeps the frame resident; concurrent access to one frame is
// serialized by the callers' per-node locks, and all index state sits behind
// the pool mutex.
unsafe impl Sync for BufferPool {}
unsafe impl Send for BufferPool {}

impl BufferPool {
    pub fn new(pool_size: usize, page_size: usize, files: Arc<FileTable>) -> Self {
        let frames = (0..pool_size).map(|_| Frame::new(page_size)).collect();
        Self {
            frames,
            state: Mutex::new(PoolState::new(pool_size)),
            files,
            page_size,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns a pinned guard over the page, loading it from disk on a miss.
    pub fn get_mut(&self, pid: PageId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        if let Some(&slot) = state.map.get(&pid) {
            state.touch(slot);
            self.frames[slot].pin_count.fetch_add(1, Ordering::AcqRel);
            return Ok(PageGuard {
                pool: self,
                pid,
                slot,
            });
        }

        let slot = self.reclaim_slot(&mut state)?;
        let file = match self.files.get(pid.file) {
            Ok(file) => file,
            Err(e) => {
                state.free.push(slot);
                return Err(e);
            }
        };
        // SAFETY: the slot came off the free list (or was just evicted and
        // unmapped) with pin count 0 while the pool mutex is held, so no
        // guard can reference this frame.
        let frame = unsafe { &mut **self.frames[slot].data.get() };
        if let Err(e) = file.read_page(pid.page_no, frame) {
            state.free.push(slot);
            return Err(e);
        }

        state.map.insert(pid, slot);
        state.resident[slot] = Some(pid);
        state.lru.push_front(slot);
        self.frames[slot].dirty.store(false, Ordering::Release);
        self.frames[slot].pin_count.store(1, Ordering::Release);
        Ok(PageGuard {
            pool: self,
            pid,
            slot,
        })
    }

    fn reclaim_slot(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(slot) = state.free.pop() {
            return Ok(slot);
        }

        let mut victim = None;
        for (pos, &slot) in state.lru.iter().enumerate().rev() {
            if self.frames[slot].pin_count.load(Ordering::Acquire) == 0 {
                victim = Some((pos, slot));
                break;
            }
        }
        let Some((pos, slot)) = victim else {
            bail!(
                "buffer pool exhausted: all {} frames are pinned",
                self.frames.len()
            );
        };

        state.lru.remove(pos);
        let pid = state.resident[slot]
            .take()
            .expect("resident slot in the LRU list has an owner");
        state.map.remove(&pid);

        if self.frames[slot].dirty.swap(false, Ordering::AcqRel) {
            tracing::trace!(file = pid.file, page = pid.page_no, "evicting dirty page");
            let file = match self.files.get(pid.file) {
                Ok(file) => file,
                Err(e) => {
                    state.free.push(slot);
                    return Err(e);
                }
            };
            // SAFETY: pin count is zero and the mapping was removed under
            // the pool mutex; nothing else can touch this frame.
            let data = unsafe { &**self.frames[slot].data.get() };
            if let Err(e) = file.write_page(pid.page_no, data) {
                state.free.push(slot);
                return Err(e);
            }
        }

        Ok(slot)
    }

    /// Non-authoritative membership test.
    pub fn contains(&self, pid: PageId) -> bool {
        self.state.lock().map.contains_key(&pid)
    }

    /// Marks a cached page dirty. Calling this for a page that is not
    /// cached is a logic error and fails fast.
    pub fn mark_dirty(&self, pid: PageId) {
        let state = self.state.lock();
        match state.map.get(&pid) {
            Some(&slot) => self.frames[slot].dirty.store(true, Ordering::Release),
            None => panic!("mark_dirty: page {:?} is not cached", pid),
        }
    }

    /// Writes the page back if it is cached and dirty.
    pub fn flush(&self, pid: PageId) -> Result<()> {
        let state = self.state.lock();
        let Some(&slot) = state.map.get(&pid) else {
            return Ok(());
        };
        self.flush_slot(slot, pid)
    }

    /// Writes back every dirty page; returns how many were written.
    pub fn flush_all(&self) -> Result<usize> {
        let state = self.state.lock();
        let mut flushed = 0;
        for (slot, owner) in state.resident.iter().enumerate() {
            if let Some(pid) = owner {
                if self.frames[slot].dirty.load(Ordering::Acquire) {
                    self.flush_slot(slot, *pid)?;
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }

    /// Writes back every dirty page belonging to one file.
    pub fn flush_file(&self, file: u32) -> Result<usize> {
        let state = self.state.lock();
        let mut flushed = 0;
        for (slot, owner) in state.resident.iter().enumerate() {
            if let Some(pid) = owner {
                if pid.file == file && self.frames[slot].dirty.load(Ordering::Acquire) {
                    self.flush_slot(slot, *pid)?;
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }

    fn flush_slot(&self, slot: usize, pid: PageId) -> Result<()> {
        if !self.frames[slot].dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let file = self.files.get(pid.file)?;
        // SAFETY: the pool mutex is held, so the slot cannot be remapped;
        // flush runs at points where no writer mutates the page (pool
        // teardown, explicit tree flush under its locks).
        let data = unsafe { &**self.frames[slot].data.get() };
        file.write_page(pid.page_no, data)?;
        self.frames[slot].dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn unpin(&self, pid: PageId, slot: usize) {
        let prev = self.frames[slot].pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpin below zero for page {:?}", pid);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            tracing::debug!(error = %e, "flush on pool teardown failed");
        }
    }
}

/// Pinned reference to one cached page. The pin is released on drop, so
/// every `get_mut` pairs with exactly one unpin on every exit path.
#[derive(Debug)]
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    pid: PageId,
    slot: usize,
}

impl<'a> PageGuard<'a> {
    pub fn pid(&self) -> PageId {
        self.pid
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the frame is pinned for this guard's lifetime, so the slot
        // cannot be evicted or remapped. Concurrent mutation of the same
        // page is excluded by the tree's per-node lock discipline.
        unsafe { &**self.pool.frames[self.slot].data.get() }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.pool.frames[self.slot].dirty.store(true, Ordering::Release);
        // SAFETY: as in `data`, plus `&mut self` guarantees this guard hands
        // out one mutable borrow at a time.
        unsafe { &mut **self.pool.frames[self.slot].data.get() }
    }

    pub fn mark_dirty(&self) {
        self.pool.frames[self.slot].dirty.store(true, Ordering::Release);
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.pid, self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool_with_file(pool_size: usize) -> (tempfile::TempDir, BufferPool, u32) {
        let dir = tempdir().unwrap();
        let files = Arc::new(FileTable::new(256));
        let file = files.open(dir.path().join("pool.db")).unwrap();
        let pool = BufferPool::new(pool_size, 256, files);
        (dir, pool, file)
    }

    #[test]
    fn miss_loads_zero_filled_page() {
        let (_dir, pool, file) = pool_with_file(4);

        let guard = pool.get_mut(PageId::new(file, 0)).unwrap();
        assert!(guard.data().iter().all(|&b| b == 0));
        assert!(pool.contains(PageId::new(file, 0)));
    }

    #[test]
    fn writes_survive_eviction_and_reload() {
        let (_dir, pool, file) = pool_with_file(2);

        {
            let mut guard = pool.get_mut(PageId::new(file, 0)).unwrap();
            guard.data_mut()[0] = 0x42;
        }

        // Fill the pool past capacity so page 0 gets evicted (written back).
        for page_no in 1..4 {
            let _ = pool.get_mut(PageId::new(file, page_no)).unwrap();
        }
        assert!(!pool.contains(PageId::new(file, 0)));

        let guard = pool.get_mut(PageId::new(file, 0)).unwrap();
        assert_eq!(guard.data()[0], 0x42);
    }

    #[test]
    fn pinned_pages_are_never_evicted() {
        let (_dir, pool, file) = pool_with_file(2);

        let g0 = pool.get_mut(PageId::new(file, 0)).unwrap();
        let g1 = pool.get_mut(PageId::new(file, 1)).unwrap();

        let err = pool.get_mut(PageId::new(file, 2)).unwrap_err();
        assert!(err.to_string().contains("buffer pool exhausted"));

        drop(g1);
        let _g2 = pool.get_mut(PageId::new(file, 2)).unwrap();
        assert!(pool.contains(PageId::new(file, 0)));
        assert!(!pool.contains(PageId::new(file, 1)));
        drop(g0);
    }

    #[test]
    fn lru_refresh_on_hit_changes_the_victim() {
        let (_dir, pool, file) = pool_with_file(2);

        let _ = pool.get_mut(PageId::new(file, 0)).unwrap();
        let _ = pool.get_mut(PageId::new(file, 1)).unwrap();
        // Re-touch page 0 so page 1 becomes the LRU victim.
        let _ = pool.get_mut(PageId::new(file, 0)).unwrap();

        let _ = pool.get_mut(PageId::new(file, 2)).unwrap();
        assert!(pool.contains(PageId::new(file, 0)));
        assert!(!pool.contains(PageId::new(file, 1)));
    }

    #[test]
    fn flush_writes_dirty_page_without_evicting() {
        let (_dir, pool, file) = pool_with_file(4);
        let pid = PageId::new(file, 5);

        {
            let mut guard = pool.get_mut(pid).unwrap();
            guard.data_mut()[10] = 7;
        }
        assert_eq!(pool.flush_file(file).unwrap(), 1);
        assert!(pool.contains(pid));

        // Clean page: nothing left to write.
        assert_eq!(pool.flush_all().unwrap(), 0);

        let files = Arc::new(FileTable::new(256));
        let reopened = files.open(pool.files.get(file).unwrap().path()).unwrap();
        let mut buf = vec![0u8; 256];
        files.get(reopened).unwrap().read_page(5, &mut buf).unwrap();
        assert_eq!(buf[10], 7);
    }

    #[test]
    #[should_panic(expected = "mark_dirty")]
    fn mark_dirty_on_uncached_page_fails_fast() {
        let (_dir, pool, file) = pool_with_file(2);
        pool.mark_dirty(PageId::new(file, 9));
    }
}
