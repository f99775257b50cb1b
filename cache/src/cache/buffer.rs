/// Buffer cache.
///
/// A fixed table of buffer descriptors holds in-memory copies of disk
/// blocks, keyed by (device, block, size). Every descriptor sits on a
/// circular free list except while a caller holds it locked; releases go to
/// the tail and victims come from the head, which is what makes the list
/// LRU. Dirty buffers additionally sit on a dirty list until written back
/// by `sync_buffers` or evicted with a synchronous flush. Data areas are
/// pages borrowed from the page pool and handed back by the reclaimer under
/// memory pressure.
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::slice;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

use crate::dev::{DeviceId, DeviceTable};
use crate::errno::Errno;
use crate::sched::{Channel, Scheduler};

use super::page::PageCache;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u8 {
        /// Contents reflect the last read or write.
        const VALID = 1;
        /// In use; others must wait.
        const LOCKED = 2;
        /// Contents newer than the device.
        const DIRTY = 4;
    }
}

const_assert!(
    BufferFlags::VALID.bits() & BufferFlags::LOCKED.bits() == 0
        && BufferFlags::LOCKED.bits() & BufferFlags::DIRTY.bits() == 0
);

/// Geometry of the buffer pool.
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    /// Number of buffer descriptors.
    pub nr_bufs: usize,
    /// Number of hash buckets.
    pub nr_hash: usize,
    /// Most data areas one `reclaim_buffers` call gives back.
    pub nr_reclaim: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            nr_bufs: 64,
            nr_hash: 16,
            nr_reclaim: 32,
        }
    }
}

struct Buf {
    dev: DeviceId,
    block: u32,
    /// Block size in bytes. Part of the identity: the same (dev, block)
    /// cached at two sizes is two entries.
    size: usize,
    /// Backing page in the page pool; `None` until first use and after the
    /// reclaimer takes the storage back.
    page: Option<usize>,
    flags: BufferFlags,
    hash_prev: Option<usize>,
    hash_next: Option<usize>,
    /// Circular free-list links; meaningful only while the buffer is free.
    free_prev: usize,
    free_next: usize,
    dirty_prev: Option<usize>,
    dirty_next: Option<usize>,
}

struct BufPool {
    bufs: Vec<Buf>,
    hash: Vec<Option<usize>>,
    free_head: Option<usize>,
    dirty_head: Option<usize>,
    /// One `sync_buffers` traversal at a time.
    sync_locked: bool,
    nr_reclaim: usize,
}

impl BufPool {
    fn bucket(&self, dev: DeviceId, block: u32) -> usize {
        ((dev.as_u16() as u32 ^ block) % self.hash.len() as u32) as usize
    }

    /// At most one buffer carries any (dev, block, size) identity.
    fn hash_probe(&self, dev: DeviceId, block: u32, size: usize) -> Option<usize> {
        let mut cur = self.hash[self.bucket(dev, block)];
        while let Some(idx) = cur {
            let b = &self.bufs[idx];
            if b.dev == dev && b.block == block && b.size == size {
                return Some(idx);
            }
            cur = b.hash_next;
        }
        None
    }

    fn hash_insert(&mut self, idx: usize) {
        let b = self.bucket(self.bufs[idx].dev, self.bufs[idx].block);
        let head = self.hash[b];
        self.bufs[idx].hash_prev = None;
        self.bufs[idx].hash_next = head;
        if let Some(h) = head {
            self.bufs[h].hash_prev = Some(idx);
        }
        self.hash[b] = Some(idx);
    }

    fn in_hash(&self, idx: usize) -> bool {
        if self.bufs[idx].hash_prev.is_some() {
            return true;
        }
        let b = self.bucket(self.bufs[idx].dev, self.bufs[idx].block);
        self.hash[b] == Some(idx)
    }

    fn hash_remove(&mut self, idx: usize) {
        let prev = self.bufs[idx].hash_prev;
        let next = self.bufs[idx].hash_next;
        match prev {
            Some(p) => self.bufs[p].hash_next = next,
            None => {
                let b = self.bucket(self.bufs[idx].dev, self.bufs[idx].block);
                self.hash[b] = next;
            }
        }
        if let Some(n) = next {
            self.bufs[n].hash_prev = prev;
        }
        self.bufs[idx].hash_prev = None;
        self.bufs[idx].hash_next = None;
    }

    /// Insert before the head: most-recently-used position.
    fn free_insert_tail(&mut self, idx: usize) {
        match self.free_head {
            None => {
                self.bufs[idx].free_prev = idx;
                self.bufs[idx].free_next = idx;
                self.free_head = Some(idx);
            }
            Some(head) => {
                let tail = self.bufs[head].free_prev;
                self.bufs[idx].free_prev = tail;
                self.bufs[idx].free_next = head;
                self.bufs[tail].free_next = idx;
                self.bufs[head].free_prev = idx;
            }
        }
    }

    /// Insert as the new head: next victim, reused first.
    fn free_insert_head(&mut self, idx: usize) {
        self.free_insert_tail(idx);
        self.free_head = Some(idx);
    }

    fn free_remove(&mut self, idx: usize) {
        let next = self.bufs[idx].free_next;
        if next == idx {
            self.free_head = None;
        } else {
            let prev = self.bufs[idx].free_prev;
            self.bufs[prev].free_next = next;
            self.bufs[next].free_prev = prev;
            if self.free_head == Some(idx) {
                self.free_head = Some(next);
            }
        }
    }

    fn on_dirty(&self, idx: usize) -> bool {
        self.bufs[idx].dirty_prev.is_some() || self.dirty_head == Some(idx)
    }

    fn dirty_insert(&mut self, idx: usize) {
        let head = self.dirty_head;
        self.bufs[idx].dirty_prev = None;
        self.bufs[idx].dirty_next = head;
        if let Some(h) = head {
            self.bufs[h].dirty_prev = Some(idx);
        }
        self.dirty_head = Some(idx);
    }

    fn dirty_remove(&mut self, idx: usize) {
        let prev = self.bufs[idx].dirty_prev;
        let next = self.bufs[idx].dirty_next;
        match prev {
            Some(p) => self.bufs[p].dirty_next = next,
            None => self.dirty_head = next,
        }
        if let Some(n) = next {
            self.bufs[n].dirty_prev = prev;
        }
        self.bufs[idx].dirty_prev = None;
        self.bufs[idx].dirty_next = None;
    }
}

/// A locked buffer.
///
/// Holding the handle is holding the buffer's LOCKED bit: the descriptor is
/// off the free list and its data area belongs to the holder until
/// `brelse`/`bwrite` consumes the handle. Dropping a handle without
/// releasing it keeps the buffer locked forever.
#[derive(Debug)]
pub struct BufHandle {
    index: usize,
    dev: DeviceId,
    block: u32,
    data: *mut u8,
    size: usize,
}

impl BufHandle {
    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn block(&self) -> u32 {
        self.block
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the handle witnesses the buffer's LOCKED bit, which
        // excludes every other accessor, and the backing page is pinned by
        // the buffer's reference for as long as the buffer is locked.
        unsafe { slice::from_raw_parts(self.data, self.size) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `data`.
        unsafe { slice::from_raw_parts_mut(self.data, self.size) }
    }
}

/// Counters for the memory reporting surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStat {
    pub total: usize,
    pub free: usize,
    pub dirty: usize,
    /// Buffers currently owning a data area.
    pub with_data: usize,
}

pub struct BufferCache {
    inner: Mutex<BufPool>,
    devices: Arc<DeviceTable>,
    pages: Arc<PageCache>,
    sched: Arc<dyn Scheduler>,
}

impl BufferCache {
    pub fn new(
        cfg: BufferConfig,
        devices: Arc<DeviceTable>,
        pages: Arc<PageCache>,
        sched: Arc<dyn Scheduler>,
    ) -> Self {
        assert!(cfg.nr_bufs > 0 && cfg.nr_hash > 0);

        let mut pool = BufPool {
            bufs: Vec::with_capacity(cfg.nr_bufs),
            hash: vec![None; cfg.nr_hash],
            free_head: None,
            dirty_head: None,
            sync_locked: false,
            nr_reclaim: cfg.nr_reclaim,
        };
        for i in 0..cfg.nr_bufs {
            pool.bufs.push(Buf {
                dev: DeviceId::NONE,
                block: 0,
                size: 0,
                page: None,
                flags: BufferFlags::empty(),
                hash_prev: None,
                hash_next: None,
                free_prev: i,
                free_next: i,
                dirty_prev: None,
                dirty_next: None,
            });
        }
        for i in 0..cfg.nr_bufs {
            pool.free_insert_tail(i);
        }

        Self {
            inner: Mutex::new(pool),
            devices,
            pages,
            sched,
        }
    }

    /// Return a locked, `VALID` buffer holding the current contents of
    /// `block` on `dev`. `size` must be a positive block size no larger
    /// than the page size.
    pub fn bread(&self, dev: DeviceId, block: u32, size: usize) -> Result<BufHandle, Errno> {
        assert!(
            size > 0 && size <= self.pages.page_size(),
            "bad block size {}",
            size
        );
        let idx = self.getblk(dev, block, size)?;
        let mut handle = self.handle_for(idx);

        let valid = self.inner.lock().bufs[idx]
            .flags
            .contains(BufferFlags::VALID);
        if !valid {
            let Some(driver) = self.devices.get(dev) else {
                log::error!("[buffer] no driver for dev {}", dev);
                self.brelse(handle);
                return Err(Errno::NxIo);
            };
            match driver.read_block(dev, block, handle.data_mut()) {
                Ok(_) => {
                    self.inner.lock().bufs[idx].flags.insert(BufferFlags::VALID);
                }
                Err(e) => {
                    log::error!("[buffer] read of dev {} block {} failed: {}", dev, block, e);
                    self.brelse(handle);
                    return Err(Errno::Io);
                }
            }
        }
        Ok(handle)
    }

    /// Mark the buffer dirty and release it. The write reaches the device
    /// later, from the dirty list.
    pub fn bwrite(&self, handle: BufHandle) {
        {
            let mut pool = self.inner.lock();
            pool.bufs[handle.index]
                .flags
                .insert(BufferFlags::DIRTY | BufferFlags::VALID);
        }
        self.brelse(handle);
    }

    /// Release a buffer: queue it for write-back if dirty, reinsert it into
    /// the free list, drop LOCKED and wake waiters. Buffers released while
    /// not `VALID` become the new free head so they are reused first.
    pub fn brelse(&self, handle: BufHandle) {
        self.release_index(handle.index);
    }

    fn release_index(&self, idx: usize) {
        let mut pool = self.inner.lock();
        if pool.bufs[idx].flags.contains(BufferFlags::DIRTY) && !pool.on_dirty(idx) {
            pool.dirty_insert(idx);
        }
        if pool.bufs[idx].flags.contains(BufferFlags::VALID) {
            pool.free_insert_tail(idx);
        } else {
            pool.free_insert_head(idx);
        }
        pool.bufs[idx].flags.remove(BufferFlags::LOCKED);
        drop(pool);
        self.sched.wakeup(Channel::FreeBuffer);
        self.sched.wakeup(Channel::BufferLock);
    }

    /// Get-or-allocate the descriptor for (dev, block, size) and lock it.
    fn getblk(&self, dev: DeviceId, block: u32, size: usize) -> Result<usize, Errno> {
        loop {
            let mut pool = self.inner.lock();

            if let Some(idx) = pool.hash_probe(dev, block, size) {
                if pool.bufs[idx].flags.contains(BufferFlags::LOCKED) {
                    drop(pool);
                    self.sched.sleep_on(Channel::BufferLock);
                    continue;
                }
                pool.bufs[idx].flags.insert(BufferFlags::LOCKED);
                pool.free_remove(idx);
                return Ok(idx);
            }

            let Some(victim) = pool.free_head else {
                drop(pool);
                self.sched.sleep_on(Channel::FreeBuffer);
                continue;
            };
            pool.bufs[victim].flags.insert(BufferFlags::LOCKED);
            pool.free_remove(victim);

            // A dirty victim is flushed before its identity goes away. A
            // failed flush is logged and the contents are abandoned; the
            // reclaimer avoids this data-loss window, eviction accepts it.
            if pool.bufs[victim].flags.contains(BufferFlags::DIRTY) {
                let (p, res) = self.write_out(pool, victim);
                pool = p;
                if res.is_err() {
                    log::error!(
                        "[buffer] discarding dirty dev {} block {} on eviction",
                        pool.bufs[victim].dev,
                        pool.bufs[victim].block
                    );
                }
                if pool.on_dirty(victim) {
                    pool.dirty_remove(victim);
                }
                pool.bufs[victim].flags.remove(BufferFlags::DIRTY);
            }

            if pool.bufs[victim].page.is_none() {
                drop(pool);
                let Some(pg) = self.pages.get_free_page() else {
                    // The page pool is exhausted even after reclaim; put
                    // the victim back (non-VALID, so as the new head).
                    let mut pool = self.inner.lock();
                    pool.bufs[victim].flags.remove(BufferFlags::VALID);
                    drop(pool);
                    self.release_index(victim);
                    return Err(Errno::NoMem);
                };
                // The buffer now owns the page's reference; it is given
                // back in `reclaim_buffers`.
                let page_index = pg.index();
                pool = self.inner.lock();
                pool.bufs[victim].page = Some(page_index);
            }

            // The flush and the allocator may both sleep; a competitor can
            // have created this identity meanwhile. Keep the hash unique:
            // give the victim up and retry.
            if pool.hash_probe(dev, block, size).is_some() {
                pool.bufs[victim].flags.remove(BufferFlags::VALID);
                drop(pool);
                self.release_index(victim);
                continue;
            }

            if pool.in_hash(victim) {
                pool.hash_remove(victim);
            }
            let b = &mut pool.bufs[victim];
            b.dev = dev;
            b.block = block;
            b.size = size;
            b.flags.remove(BufferFlags::VALID);
            pool.hash_insert(victim);
            return Ok(victim);
        }
    }

    /// Build the caller-facing handle for a buffer locked by us.
    fn handle_for(&self, idx: usize) -> BufHandle {
        let (dev, block, size, page) = {
            let pool = self.inner.lock();
            let b = &pool.bufs[idx];
            (b.dev, b.block, b.size, b.page)
        };
        let page = page.expect("locked buffer without a data area");
        BufHandle {
            index: idx,
            dev,
            block,
            data: self.pages.storage_ptr(page),
            size,
        }
    }

    /// Write buffer `idx`, which the caller holds LOCKED, out to its
    /// device. The pool mutex is released around the driver call and
    /// re-acquired before returning; dirty bookkeeping is the caller's.
    fn write_out<'a>(
        &'a self,
        pool: MutexGuard<'a, BufPool>,
        idx: usize,
    ) -> (MutexGuard<'a, BufPool>, Result<(), Errno>) {
        let (dev, block, size, page) = {
            let b = &pool.bufs[idx];
            (b.dev, b.block, b.size, b.page)
        };
        drop(pool);

        let page = page.expect("dirty buffer without a data area");
        let res = match self.devices.get(dev) {
            Some(driver) => {
                // SAFETY: we hold the buffer's LOCKED bit; nobody else
                // touches its data area and its page cannot be reclaimed.
                let data = unsafe { slice::from_raw_parts(self.pages.storage_ptr(page), size) };
                driver.write_block(dev, block, data).map(|_| ())
            }
            None => Err(Errno::NxIo),
        };
        match res {
            Ok(()) => {}
            Err(Errno::Rofs) => {
                log::warn!("[buffer] dev {} is write-protected, block {} kept dirty", dev, block)
            }
            Err(e) => log::error!("[buffer] write of dev {} block {} failed: {}", dev, block, e),
        }
        (self.inner.lock(), res)
    }

    /// Flush dirty buffers of `dev` to their devices; `None` flushes every
    /// device. Serialized: concurrent callers queue on the sync lock.
    ///
    /// Driver errors are logged and the affected buffer stays on the dirty
    /// list for a later retry; they are not surfaced to the caller.
    pub fn sync_buffers(&self, dev: Option<DeviceId>) {
        let mut pool = loop {
            let mut pool = self.inner.lock();
            if !pool.sync_locked {
                pool.sync_locked = true;
                break pool;
            }
            drop(pool);
            self.sched.sleep_on(Channel::SyncLock);
        };

        let mut cur = pool.dirty_head;
        while let Some(idx) = cur {
            if dev.is_some() && dev != Some(pool.bufs[idx].dev) {
                cur = pool.bufs[idx].dirty_next;
                continue;
            }
            if pool.bufs[idx].flags.contains(BufferFlags::LOCKED) {
                drop(pool);
                self.sched.sleep_on(Channel::BufferLock);
                pool = self.inner.lock();
                // The list may have changed while we waited; start over.
                cur = pool.dirty_head;
                continue;
            }
            pool.bufs[idx].flags.insert(BufferFlags::LOCKED);
            pool.free_remove(idx);

            let (p, res) = self.write_out(pool, idx);
            pool = p;

            // The next link is read only under the re-acquired mutex;
            // neighbours may have left the list during the write.
            let next = pool.bufs[idx].dirty_next;
            if res.is_ok() {
                pool.dirty_remove(idx);
                pool.bufs[idx].flags.remove(BufferFlags::DIRTY);
            }
            if pool.bufs[idx].flags.contains(BufferFlags::VALID) {
                pool.free_insert_tail(idx);
            } else {
                pool.free_insert_head(idx);
            }
            pool.bufs[idx].flags.remove(BufferFlags::LOCKED);
            drop(pool);
            self.sched.wakeup(Channel::FreeBuffer);
            self.sched.wakeup(Channel::BufferLock);

            pool = self.inner.lock();
            cur = match next {
                Some(n) if pool.on_dirty(n) => Some(n),
                // Our successor was flushed by an evicting getblk while we
                // were waking waiters; re-find our place from the head.
                Some(_) => pool.dirty_head,
                None => None,
            };
        }

        pool.sync_locked = false;
        drop(pool);
        self.sched.wakeup(Channel::SyncLock);
    }

    /// Drop every unlocked buffer of `dev` from the cache. Dirty contents
    /// are discarded, dirty-list entries included; callers that care run
    /// `sync_buffers` first.
    pub fn invalidate_buffers(&self, dev: DeviceId) {
        let mut pool = self.inner.lock();
        for idx in 0..pool.bufs.len() {
            if pool.bufs[idx].dev != dev || pool.bufs[idx].flags.contains(BufferFlags::LOCKED) {
                continue;
            }
            if pool.in_hash(idx) {
                pool.hash_remove(idx);
            }
            if pool.on_dirty(idx) {
                pool.dirty_remove(idx);
            }
            pool.bufs[idx]
                .flags
                .remove(BufferFlags::VALID | BufferFlags::LOCKED | BufferFlags::DIRTY);
        }
    }

    /// Give buffer data areas back to the page pool under memory pressure.
    ///
    /// Walks the free list from the head (LRU first). Dirty buffers are
    /// flushed before their storage is released; a buffer whose flush fails
    /// keeps its data and stays dirty. Every visited buffer is marked
    /// `VALID` and moved to the tail so the walk terminates after one full
    /// rotation; a buffer that was invalid before the visit keeps that
    /// `VALID` bit until it is reused, which is harmless because a freed
    /// buffer is also unhashed. At most `nr_reclaim` pages are freed per
    /// call. Returns the number freed, waking `FreePage` waiters when it is
    /// nonzero.
    pub fn reclaim_buffers(&self) -> usize {
        let mut freed = 0;
        let mut first: Option<usize> = None;

        loop {
            let mut pool = self.inner.lock();
            if freed >= pool.nr_reclaim {
                break;
            }
            let Some(idx) = pool.free_head else { break };
            if first == Some(idx) {
                break;
            }
            if first.is_none() {
                first = Some(idx);
            }

            pool.bufs[idx].flags.insert(BufferFlags::LOCKED);
            pool.free_remove(idx);

            let mut keep_data = false;
            if pool.bufs[idx].flags.contains(BufferFlags::DIRTY) {
                let (p, res) = self.write_out(pool, idx);
                pool = p;
                match res {
                    Ok(()) => {
                        if pool.on_dirty(idx) {
                            pool.dirty_remove(idx);
                        }
                        pool.bufs[idx].flags.remove(BufferFlags::DIRTY);
                    }
                    // Logged by write_out; losing the contents here is not
                    // acceptable, so the buffer keeps its data area.
                    Err(_) => keep_data = true,
                }
            }

            // Visited buffers migrate to the tail so the rotation ends.
            pool.bufs[idx].flags.insert(BufferFlags::VALID);
            pool.free_insert_tail(idx);

            let mut released = None;
            if !keep_data {
                if let Some(page) = pool.bufs[idx].page.take() {
                    if pool.in_hash(idx) {
                        pool.hash_remove(idx);
                    }
                    pool.bufs[idx].flags.remove(BufferFlags::VALID);
                    released = Some(page);
                    freed += 1;
                }
            }
            pool.bufs[idx].flags.remove(BufferFlags::LOCKED);
            drop(pool);

            if let Some(page) = released {
                self.pages.release_page_index(page);
            }
            self.sched.wakeup(Channel::BufferLock);
        }

        if freed > 0 {
            self.sched.wakeup(Channel::FreePage);
        }
        freed
    }

    pub fn stat(&self) -> BufferStat {
        let pool = self.inner.lock();
        let mut free = 0;
        if let Some(head) = pool.free_head {
            let mut cur = head;
            loop {
                free += 1;
                cur = pool.bufs[cur].free_next;
                if cur == head {
                    break;
                }
            }
        }
        let mut dirty = 0;
        let mut cur = pool.dirty_head;
        while let Some(idx) = cur {
            dirty += 1;
            cur = pool.bufs[idx].dirty_next;
        }
        BufferStat {
            total: pool.bufs.len(),
            free,
            dirty,
            with_data: pool.bufs.iter().filter(|b| b.page.is_some()).count(),
        }
    }
}

#[cfg(test)]
impl BufferCache {
    /// Free-list identities from head (next victim) to tail.
    pub(crate) fn free_order(&self) -> Vec<(DeviceId, u32)> {
        let pool = self.inner.lock();
        let mut order = Vec::new();
        if let Some(head) = pool.free_head {
            let mut cur = head;
            loop {
                order.push((pool.bufs[cur].dev, pool.bufs[cur].block));
                cur = pool.bufs[cur].free_next;
                if cur == head {
                    break;
                }
            }
        }
        order
    }

    pub(crate) fn dirty_blocks(&self) -> Vec<(DeviceId, u32)> {
        let pool = self.inner.lock();
        let mut blocks = Vec::new();
        let mut cur = pool.dirty_head;
        while let Some(idx) = cur {
            blocks.push((pool.bufs[idx].dev, pool.bufs[idx].block));
            cur = pool.bufs[idx].dirty_next;
        }
        blocks
    }

    pub(crate) fn is_hashed(&self, dev: DeviceId, block: u32, size: usize) -> bool {
        self.inner.lock().hash_probe(dev, block, size).is_some()
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free_order().len()
    }
}
