/// Page pool and page cache.
///
/// A fixed table of page descriptors covers every page-sized region the
/// cache layer can hand out, and `get_free_page` doubles as the page-sized
/// allocator for the rest of the kernel: buffer data areas draw from this
/// pool and the reclaimer returns them here. Pages holding file contents
/// are additionally keyed by (inode, offset, device) in a hash table. A
/// cached page stays hashed while it sits unreferenced on the free list, so
/// a later lookup can revive it without touching the device; it loses that
/// identity only when `get_free_page` repurposes it.
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::slice;

use bitflags::bitflags;
use spin::Mutex;
use static_assertions::const_assert;

use crate::dev::DeviceId;
use crate::sched::{Channel, Scheduler};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// In use; others must wait.
        const LOCKED = 1;
        /// Permanently unavailable (kernel image, firmware-reserved ranges).
        const RESERVED = 0x100;
    }
}

const_assert!(PageFlags::LOCKED.bits() & PageFlags::RESERVED.bits() == 0);

/// Geometry of the page pool.
#[derive(Debug, Clone, Copy)]
pub struct PageConfig {
    /// Number of page descriptors.
    pub nr_pages: usize,
    /// Number of hash buckets.
    pub nr_hash: usize,
    /// Bytes per page. Must be a power of two and a multiple of every
    /// mounted filesystem's block size.
    pub page_size: usize,
    /// Leading pages marked reserved at init; they are never freed, never
    /// hashed and never handed out.
    pub reserved_pages: usize,
    /// Free-page threshold above which `release_page` wakes `FreePage`
    /// waiters.
    pub nr_reclaim: usize,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            nr_pages: 256,
            nr_hash: 64,
            page_size: 4096,
            reserved_pages: 0,
            nr_reclaim: 32,
        }
    }
}

struct PageDesc {
    /// Page-sized storage; `None` only on reserved pages.
    data: Option<Box<[u8]>>,
    /// Cache identity. `ino == 0` means anonymous.
    ino: u32,
    offset: u64,
    dev: DeviceId,
    /// Outstanding users. Zero iff the page is on the free list.
    count: u32,
    flags: PageFlags,
    hash_prev: Option<usize>,
    hash_next: Option<usize>,
    /// Circular free-list links; meaningful only while the page is free.
    free_prev: usize,
    free_next: usize,
}

struct PagePool {
    pages: Vec<PageDesc>,
    hash: Vec<Option<usize>>,
    free_head: Option<usize>,
    free_count: usize,
    nr_reclaim: usize,
}

impl PagePool {
    fn bucket(&self, ino: u32, offset: u64) -> usize {
        ((ino as u64 ^ offset) % self.hash.len() as u64) as usize
    }

    fn hash_insert(&mut self, idx: usize) {
        let b = self.bucket(self.pages[idx].ino, self.pages[idx].offset);
        let head = self.hash[b];
        self.pages[idx].hash_prev = None;
        self.pages[idx].hash_next = head;
        if let Some(h) = head {
            self.pages[h].hash_prev = Some(idx);
        }
        self.hash[b] = Some(idx);
    }

    fn in_hash(&self, idx: usize) -> bool {
        if self.pages[idx].hash_prev.is_some() {
            return true;
        }
        let b = self.bucket(self.pages[idx].ino, self.pages[idx].offset);
        self.hash[b] == Some(idx)
    }

    fn hash_remove(&mut self, idx: usize) {
        let prev = self.pages[idx].hash_prev;
        let next = self.pages[idx].hash_next;
        match prev {
            Some(p) => self.pages[p].hash_next = next,
            None => {
                let b = self.bucket(self.pages[idx].ino, self.pages[idx].offset);
                self.hash[b] = next;
            }
        }
        if let Some(n) = next {
            self.pages[n].hash_prev = prev;
        }
        self.pages[idx].hash_prev = None;
        self.pages[idx].hash_next = None;
    }

    /// Insert before the head, i.e. at the tail of the rotation order.
    fn free_insert_tail(&mut self, idx: usize) {
        match self.free_head {
            None => {
                self.pages[idx].free_prev = idx;
                self.pages[idx].free_next = idx;
                self.free_head = Some(idx);
            }
            Some(head) => {
                let tail = self.pages[head].free_prev;
                self.pages[idx].free_prev = tail;
                self.pages[idx].free_next = head;
                self.pages[tail].free_next = idx;
                self.pages[head].free_prev = idx;
            }
        }
    }

    fn free_insert_head(&mut self, idx: usize) {
        self.free_insert_tail(idx);
        self.free_head = Some(idx);
    }

    fn free_remove(&mut self, idx: usize) {
        let next = self.pages[idx].free_next;
        if next == idx {
            self.free_head = None;
        } else {
            let prev = self.pages[idx].free_prev;
            self.pages[prev].free_next = next;
            self.pages[next].free_prev = prev;
            if self.free_head == Some(idx) {
                self.free_head = Some(next);
            }
        }
    }
}

/// A counted reference to a page.
///
/// Obtained from `get_free_page` or `search_page_hash` and surrendered with
/// `release_page`. Dropping a handle without releasing it leaks the
/// reference and pins the page forever.
#[derive(Debug)]
pub struct PageHandle {
    index: usize,
}

impl PageHandle {
    /// Position in the page table; the page's stable identity.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Exclusive view of a locked page's storage. Dropping the guard unlocks
/// the page and wakes `PageLock` waiters.
pub struct PageGuard<'a> {
    cache: &'a PageCache,
    index: usize,
    data: *mut u8,
    len: usize,
}

impl Deref for PageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the guard holds the page's LOCKED bit, which excludes
        // every other accessor, and page storage is never freed while the
        // cache is alive.
        unsafe { slice::from_raw_parts(self.data, self.len) }
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`.
        unsafe { slice::from_raw_parts_mut(self.data, self.len) }
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.cache.unlock_index(self.index);
    }
}

/// Counters for the memory reporting surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStat {
    pub total: usize,
    pub free: usize,
    /// Pages currently carrying a cache identity in the hash.
    pub cached: usize,
    pub reserved: usize,
}

pub struct PageCache {
    inner: Mutex<PagePool>,
    sched: Arc<dyn Scheduler>,
    page_size: usize,
    reserved: usize,
}

impl PageCache {
    pub fn new(cfg: PageConfig, sched: Arc<dyn Scheduler>) -> Self {
        assert!(cfg.nr_pages > 0 && cfg.nr_hash > 0);
        assert!(cfg.page_size.is_power_of_two());
        assert!(cfg.reserved_pages <= cfg.nr_pages);

        let mut pool = PagePool {
            pages: Vec::with_capacity(cfg.nr_pages),
            hash: vec![None; cfg.nr_hash],
            free_head: None,
            free_count: 0,
            nr_reclaim: cfg.nr_reclaim,
        };
        for i in 0..cfg.nr_pages {
            let reserved = i < cfg.reserved_pages;
            pool.pages.push(PageDesc {
                data: if reserved {
                    None
                } else {
                    Some(vec![0u8; cfg.page_size].into_boxed_slice())
                },
                ino: 0,
                offset: 0,
                dev: DeviceId::NONE,
                count: 0,
                flags: if reserved {
                    PageFlags::RESERVED
                } else {
                    PageFlags::empty()
                },
                hash_prev: None,
                hash_next: None,
                free_prev: i,
                free_next: i,
            });
        }
        for i in cfg.reserved_pages..cfg.nr_pages {
            pool.free_insert_tail(i);
            pool.free_count += 1;
        }

        Self {
            inner: Mutex::new(pool),
            sched,
            page_size: cfg.page_size,
            reserved: cfg.reserved_pages,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pop the least-recently-released free page and take a reference to
    /// it. Whatever the page cached before is evicted.
    ///
    /// When the free list is empty the reclaimer is woken and the caller
    /// sleeps on `FreePage` once; if the list is still empty after that the
    /// allocation has genuinely failed.
    pub fn get_free_page(&self) -> Option<PageHandle> {
        let mut slept = false;
        loop {
            let mut pool = self.inner.lock();
            if let Some(idx) = pool.free_head {
                pool.free_remove(idx);
                pool.free_count -= 1;
                if pool.in_hash(idx) {
                    pool.hash_remove(idx);
                }
                let pg = &mut pool.pages[idx];
                pg.ino = 0;
                pg.offset = 0;
                pg.dev = DeviceId::NONE;
                pg.count = 1;
                return Some(PageHandle { index: idx });
            }
            drop(pool);
            if slept {
                log::error!("[page] out of memory, free list empty after reclaim");
                return None;
            }
            self.sched.wakeup(Channel::Reclaimer);
            self.sched.sleep_on(Channel::FreePage);
            slept = true;
        }
    }

    /// Look up a cached page and take a reference to it. A page revived
    /// from the free list leaves the list before its count goes up.
    pub fn search_page_hash(&self, dev: DeviceId, ino: u32, offset: u64) -> Option<PageHandle> {
        let mut pool = self.inner.lock();
        let mut cur = pool.hash[pool.bucket(ino, offset)];
        while let Some(idx) = cur {
            let pg = &pool.pages[idx];
            let (found, next) = (
                pg.ino == ino && pg.offset == offset && pg.dev == dev,
                pg.hash_next,
            );
            if found {
                if pool.pages[idx].count == 0 {
                    pool.free_remove(idx);
                    pool.free_count -= 1;
                }
                pool.pages[idx].count += 1;
                return Some(PageHandle { index: idx });
            }
            cur = next;
        }
        None
    }

    /// Drop the reference held by `handle`.
    pub fn release_page(&self, handle: PageHandle) {
        self.release_page_index(handle.index);
    }

    /// Drop one reference to page `index`. When the count reaches zero the
    /// page rejoins the free list: anonymous pages at the head (they cache
    /// nothing worth keeping), named pages at the tail.
    ///
    /// # Panics
    ///
    /// On an out-of-range index or an unreferenced page. Both are invariant
    /// violations in the caller, not runtime conditions.
    pub fn release_page_index(&self, index: usize) {
        let mut pool = self.inner.lock();
        assert!(index < pool.pages.len(), "release of invalid page {}", index);
        let pg = &mut pool.pages[index];
        assert!(pg.count > 0, "releasing unreferenced page {}", index);
        pg.count -= 1;
        if pg.count > 0 {
            return;
        }
        if pg.ino == 0 {
            pool.free_insert_head(index);
        } else {
            pool.free_insert_tail(index);
        }
        pool.free_count += 1;
        let above_threshold = pool.free_count > pool.nr_reclaim;
        drop(pool);
        if above_threshold {
            self.sched.wakeup(Channel::FreePage);
        }
    }

    /// Lock the page and return exclusive access to its storage.
    pub fn lock_page(&self, handle: &PageHandle) -> PageGuard<'_> {
        let idx = handle.index;
        loop {
            let mut pool = self.inner.lock();
            if !pool.pages[idx].flags.contains(PageFlags::LOCKED) {
                pool.pages[idx].flags.insert(PageFlags::LOCKED);
                let data = pool.pages[idx]
                    .data
                    .as_mut()
                    .expect("reserved page behind a handle");
                let ptr = data.as_mut_ptr();
                let len = data.len();
                return PageGuard {
                    cache: self,
                    index: idx,
                    data: ptr,
                    len,
                };
            }
            drop(pool);
            self.sched.sleep_on(Channel::PageLock);
        }
    }

    fn unlock_index(&self, index: usize) {
        let mut pool = self.inner.lock();
        pool.pages[index].flags.remove(PageFlags::LOCKED);
        drop(pool);
        self.sched.wakeup(Channel::PageLock);
    }

    /// Give the page a cache identity without making it findable. Used for
    /// fills that must not be shared (private writable mappings).
    pub fn set_page_identity(&self, handle: &PageHandle, dev: DeviceId, ino: u32, offset: u64) {
        let mut pool = self.inner.lock();
        let idx = handle.index;
        if pool.in_hash(idx) {
            pool.hash_remove(idx);
        }
        let pg = &mut pool.pages[idx];
        pg.dev = dev;
        pg.ino = ino;
        pg.offset = offset;
    }

    /// Give the page a cache identity and insert it into the hash, evicting
    /// any previous identity it had. If a competing fill already hashed
    /// another page under the same identity while this one was being
    /// filled, this page keeps the identity but stays out of the hash, so
    /// a lookup never returns two answers.
    pub fn insert_page_hash(&self, handle: &PageHandle, dev: DeviceId, ino: u32, offset: u64) {
        let mut pool = self.inner.lock();
        let idx = handle.index;
        if pool.in_hash(idx) {
            pool.hash_remove(idx);
        }
        let pg = &mut pool.pages[idx];
        pg.dev = dev;
        pg.ino = ino;
        pg.offset = offset;

        let mut cur = pool.hash[pool.bucket(ino, offset)];
        while let Some(other) = cur {
            let pg = &pool.pages[other];
            if pg.ino == ino && pg.offset == offset && pg.dev == dev {
                return;
            }
            cur = pg.hash_next;
        }
        pool.hash_insert(idx);
    }

    pub fn stat(&self) -> PageStat {
        let pool = self.inner.lock();
        let cached = (0..pool.pages.len()).filter(|&i| pool.in_hash(i)).count();
        PageStat {
            total: pool.pages.len(),
            free: pool.free_count,
            cached,
            reserved: self.reserved,
        }
    }

    /// Raw storage pointer for a page the buffer cache owns as a data area.
    ///
    /// The caller must hold an exclusive claim on the page (the owning
    /// buffer's LOCKED bit) for as long as it dereferences the pointer.
    pub(crate) fn storage_ptr(&self, index: usize) -> *mut u8 {
        let mut pool = self.inner.lock();
        pool.pages[index]
            .data
            .as_mut()
            .expect("reserved page used as a data area")
            .as_mut_ptr()
    }
}

#[cfg(test)]
impl PageCache {
    /// Free-list order from head to tail.
    pub(crate) fn free_list(&self) -> Vec<usize> {
        let pool = self.inner.lock();
        let mut order = Vec::new();
        if let Some(head) = pool.free_head {
            let mut cur = head;
            loop {
                order.push(cur);
                cur = pool.pages[cur].free_next;
                if cur == head {
                    break;
                }
            }
        }
        order
    }

    pub(crate) fn page_count(&self, index: usize) -> u32 {
        self.inner.lock().pages[index].count
    }

    pub(crate) fn is_page_hashed(&self, dev: DeviceId, ino: u32, offset: u64) -> bool {
        let pool = self.inner.lock();
        let mut cur = pool.hash[pool.bucket(ino, offset)];
        while let Some(idx) = cur {
            let pg = &pool.pages[idx];
            if pg.ino == ino && pg.offset == offset && pg.dev == dev {
                return true;
            }
            cur = pg.hash_next;
        }
        false
    }

    pub(crate) fn free_pages(&self) -> usize {
        self.inner.lock().free_count
    }
}
