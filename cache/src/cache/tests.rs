/// Unit tests for the buffer and page pools.
///
/// Everything runs against the RAM-backed device, so the tests exercise the
/// full bread/bwrite/sync/reclaim machinery without any hardware I/O.
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use super::*;
use crate::dev::{BlockDriver, DeviceId, DeviceTable, RamDisk};
use crate::errno::Errno;
use crate::sched::{Channel, NoopScheduler, Scheduler};

const BSIZE: usize = 512;

fn page_cfg(nr_pages: usize) -> PageConfig {
    PageConfig {
        nr_pages,
        nr_hash: 8,
        page_size: 4096,
        reserved_pages: 0,
        nr_reclaim: 4,
    }
}

fn buf_cfg(nr_bufs: usize) -> BufferConfig {
    BufferConfig {
        nr_bufs,
        nr_hash: 4,
        nr_reclaim: 4,
    }
}

struct Rig {
    devices: Arc<DeviceTable>,
    pages: Arc<PageCache>,
    bufs: BufferCache,
    disk: Arc<RamDisk>,
    dev: DeviceId,
}

fn setup(nr_bufs: usize, major: u8) -> Rig {
    setup_cfg(buf_cfg(nr_bufs), page_cfg(64), major)
}

fn setup_cfg(bcfg: BufferConfig, pcfg: PageConfig, major: u8) -> Rig {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let devices = Arc::new(DeviceTable::new());
    let pages = Arc::new(PageCache::new(pcfg, sched.clone()));
    let bufs = BufferCache::new(bcfg, devices.clone(), pages.clone(), sched);
    let disk = Arc::new(RamDisk::new(128, BSIZE));
    let dev = DeviceId::new(major, 0);
    devices.register(dev, disk.clone());
    Rig {
        devices,
        pages,
        bufs,
        disk,
        dev,
    }
}

// ---- buffer cache ----

#[test]
fn bread_caches_block() {
    let rig = setup(4, 7);
    rig.disk.fill_block(100, &[0xAA; BSIZE]);

    let buf = rig.bufs.bread(rig.dev, 100, BSIZE).unwrap();
    assert_eq!(buf.dev(), rig.dev);
    assert_eq!(buf.block(), 100);
    assert_eq!(buf.size(), BSIZE);
    assert_eq!(buf.data(), &[0xAA; BSIZE][..]);
    rig.bufs.brelse(buf);
    assert_eq!(rig.disk.read_count(), 1);

    // Second access is served from the cache.
    let buf = rig.bufs.bread(rig.dev, 100, BSIZE).unwrap();
    assert_eq!(buf.data(), &[0xAA; BSIZE][..]);
    rig.bufs.brelse(buf);
    assert_eq!(rig.disk.read_count(), 1);
}

#[test]
fn lru_evicts_oldest_release() {
    let rig = setup(2, 1);

    let b1 = rig.bufs.bread(rig.dev, 1, BSIZE).unwrap();
    rig.bufs.brelse(b1);
    let b2 = rig.bufs.bread(rig.dev, 2, BSIZE).unwrap();
    rig.bufs.brelse(b2);
    assert_eq!(rig.disk.read_count(), 2);

    // Block 1 sits at the free head and is the victim for block 3.
    let b3 = rig.bufs.bread(rig.dev, 3, BSIZE).unwrap();
    rig.bufs.brelse(b3);
    assert!(!rig.bufs.is_hashed(rig.dev, 1, BSIZE));
    assert!(rig.bufs.is_hashed(rig.dev, 2, BSIZE));

    // Re-reading block 1 goes back to the device.
    let b1 = rig.bufs.bread(rig.dev, 1, BSIZE).unwrap();
    rig.bufs.brelse(b1);
    assert_eq!(rig.disk.read_count(), 4);
}

#[test]
fn bwrite_defers_until_sync() {
    let rig = setup(4, 1);

    let mut buf = rig.bufs.bread(rig.dev, 5, BSIZE).unwrap();
    buf.data_mut().fill(0xBB);
    rig.bufs.bwrite(buf);

    // Nothing reaches the device before the sync.
    assert_eq!(rig.disk.write_count(), 0);
    assert_eq!(rig.bufs.dirty_blocks(), vec![(rig.dev, 5)]);

    rig.bufs.sync_buffers(Some(rig.dev));
    assert_eq!(rig.disk.write_count(), 1);
    assert_eq!(rig.disk.block_contents(5, BSIZE), vec![0xBB; BSIZE]);
    assert!(rig.bufs.dirty_blocks().is_empty());

    // A second sync has nothing to do.
    rig.bufs.sync_buffers(Some(rig.dev));
    assert_eq!(rig.disk.write_count(), 1);
}

#[test]
fn sync_all_devices() {
    let rig = setup(4, 1);
    let disk2 = Arc::new(RamDisk::new(128, BSIZE));
    let dev2 = DeviceId::new(2, 0);
    rig.devices.register(dev2, disk2.clone());

    let mut b = rig.bufs.bread(rig.dev, 1, BSIZE).unwrap();
    b.data_mut().fill(1);
    rig.bufs.bwrite(b);
    let mut b = rig.bufs.bread(dev2, 1, BSIZE).unwrap();
    b.data_mut().fill(2);
    rig.bufs.bwrite(b);

    // A device-bound sync leaves the other device dirty.
    rig.bufs.sync_buffers(Some(dev2));
    assert_eq!(disk2.write_count(), 1);
    assert_eq!(rig.bufs.dirty_blocks(), vec![(rig.dev, 1)]);

    rig.bufs.sync_buffers(None);
    assert_eq!(rig.disk.write_count(), 1);
    assert!(rig.bufs.dirty_blocks().is_empty());
}

#[test]
fn write_protected_sync_keeps_dirty() {
    let rig = setup(4, 1);

    let mut buf = rig.bufs.bread(rig.dev, 5, BSIZE).unwrap();
    buf.data_mut().fill(0xBB);
    rig.bufs.bwrite(buf);

    rig.disk.set_write_protected(true);
    rig.bufs.sync_buffers(Some(rig.dev));
    assert_eq!(rig.disk.write_count(), 0);
    assert_eq!(rig.bufs.dirty_blocks(), vec![(rig.dev, 5)]);

    // The error is retryable: the next sync succeeds.
    rig.disk.set_write_protected(false);
    rig.bufs.sync_buffers(Some(rig.dev));
    assert_eq!(rig.disk.write_count(), 1);
    assert!(rig.bufs.dirty_blocks().is_empty());
}

#[test]
fn eviction_flushes_dirty_victim() {
    let rig = setup(1, 1);

    let mut buf = rig.bufs.bread(rig.dev, 1, BSIZE).unwrap();
    buf.data_mut().fill(0xEE);
    rig.bufs.bwrite(buf);

    // The single descriptor is reused for block 2; the dirty contents of
    // block 1 must hit the device first.
    let b2 = rig.bufs.bread(rig.dev, 2, BSIZE).unwrap();
    rig.bufs.brelse(b2);
    assert_eq!(rig.disk.block_contents(1, BSIZE), vec![0xEE; BSIZE]);
    assert!(rig.bufs.dirty_blocks().is_empty());
}

#[test]
fn invalidate_drops_cache_and_dirty_state() {
    let rig = setup(4, 1);

    let b = rig.bufs.bread(rig.dev, 9, BSIZE).unwrap();
    rig.bufs.brelse(b);
    let mut b = rig.bufs.bread(rig.dev, 10, BSIZE).unwrap();
    b.data_mut().fill(0x55);
    rig.bufs.bwrite(b);

    rig.bufs.invalidate_buffers(rig.dev);
    assert!(!rig.bufs.is_hashed(rig.dev, 9, BSIZE));
    assert!(!rig.bufs.is_hashed(rig.dev, 10, BSIZE));
    assert!(rig.bufs.dirty_blocks().is_empty());

    // The discarded write never reaches the device.
    rig.bufs.sync_buffers(Some(rig.dev));
    assert_eq!(rig.disk.write_count(), 0);

    // Re-reading goes back to the device.
    let reads = rig.disk.read_count();
    let b = rig.bufs.bread(rig.dev, 9, BSIZE).unwrap();
    rig.bufs.brelse(b);
    assert_eq!(rig.disk.read_count(), reads + 1);
}

#[test]
fn locked_buffer_leaves_free_list() {
    let rig = setup(3, 1);
    assert_eq!(rig.bufs.free_len(), 3);

    let buf = rig.bufs.bread(rig.dev, 1, BSIZE).unwrap();
    assert_eq!(rig.bufs.free_len(), 2);

    rig.bufs.brelse(buf);
    assert_eq!(rig.bufs.free_len(), 3);
    // Released valid buffers go to the tail, most-recently-used.
    assert_eq!(rig.bufs.free_order().last(), Some(&(rig.dev, 1)));
}

#[test]
fn same_block_distinct_sizes_are_distinct_entries() {
    let rig = setup(4, 1);

    let b = rig.bufs.bread(rig.dev, 20, BSIZE).unwrap();
    rig.bufs.brelse(b);
    let b = rig.bufs.bread(rig.dev, 20, 2 * BSIZE).unwrap();
    rig.bufs.brelse(b);

    assert!(rig.bufs.is_hashed(rig.dev, 20, BSIZE));
    assert!(rig.bufs.is_hashed(rig.dev, 20, 2 * BSIZE));
    assert_eq!(rig.disk.read_count(), 2);
}

#[test]
fn rebread_same_block_keeps_one_entry() {
    let rig = setup(4, 1);

    for _ in 0..3 {
        let b = rig.bufs.bread(rig.dev, 11, BSIZE).unwrap();
        rig.bufs.brelse(b);
    }
    let matching = rig
        .bufs
        .free_order()
        .into_iter()
        .filter(|&(d, b)| d == rig.dev && b == 11)
        .count();
    assert_eq!(matching, 1);
}

#[test]
fn descriptor_reuse_keeps_data_area() {
    let rig = setup(1, 1);
    let free_before = rig.pages.free_pages();

    let b = rig.bufs.bread(rig.dev, 1, BSIZE).unwrap();
    rig.bufs.brelse(b);
    assert_eq!(rig.pages.free_pages(), free_before - 1);

    // Re-identification reuses the page already attached to the slot.
    let b = rig.bufs.bread(rig.dev, 2, BSIZE).unwrap();
    rig.bufs.brelse(b);
    assert_eq!(rig.pages.free_pages(), free_before - 1);
}

#[test]
fn bread_fails_when_page_pool_exhausted() {
    let rig = setup_cfg(buf_cfg(2), page_cfg(1), 1);

    let hog = rig.pages.get_free_page().unwrap();
    assert!(matches!(
        rig.bufs.bread(rig.dev, 1, BSIZE),
        Err(Errno::NoMem)
    ));

    // Releasing the page makes the next bread succeed.
    rig.pages.release_page(hog);
    let b = rig.bufs.bread(rig.dev, 1, BSIZE).unwrap();
    rig.bufs.brelse(b);
}

struct FailingDisk {
    attempts: AtomicU64,
}

impl BlockDriver for FailingDisk {
    fn read_block(&self, _dev: DeviceId, _block: u32, _buf: &mut [u8]) -> Result<usize, Errno> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(Errno::Io)
    }

    fn write_block(&self, _dev: DeviceId, _block: u32, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::Io)
    }
}

#[test]
fn bread_surfaces_driver_error_and_releases() {
    let rig = setup(2, 1);
    let bad = DeviceId::new(9, 0);
    let failing = Arc::new(FailingDisk {
        attempts: AtomicU64::new(0),
    });
    rig.devices.register(bad, failing.clone());

    assert!(matches!(rig.bufs.bread(bad, 1, BSIZE), Err(Errno::Io)));
    assert_eq!(rig.bufs.free_len(), 2);

    // The descriptor was released non-valid; a retry reaches the driver
    // again instead of serving garbage.
    assert!(matches!(rig.bufs.bread(bad, 1, BSIZE), Err(Errno::Io)));
    assert_eq!(failing.attempts.load(Ordering::Relaxed), 2);
}

#[test]
fn unregister_after_invalidate_detaches_device() {
    let rig = setup(4, 1);

    let b = rig.bufs.bread(rig.dev, 6, BSIZE).unwrap();
    rig.bufs.brelse(b);

    // The documented teardown order: drop the device's cache entries,
    // then its driver.
    rig.bufs.invalidate_buffers(rig.dev);
    rig.devices.unregister(rig.dev);

    assert!(!rig.bufs.is_hashed(rig.dev, 6, BSIZE));
    assert!(matches!(
        rig.bufs.bread(rig.dev, 6, BSIZE),
        Err(Errno::NxIo)
    ));
}

#[test]
fn bread_unregistered_device() {
    let rig = setup(2, 1);
    assert!(matches!(
        rig.bufs.bread(DeviceId::new(42, 0), 1, BSIZE),
        Err(Errno::NxIo)
    ));
    assert_eq!(rig.bufs.free_len(), 2);
}

// ---- reclaim ----

#[test]
fn reclaim_returns_data_areas_to_page_pool() {
    let rig = setup(4, 1);
    let free_before = rig.pages.free_pages();

    for block in 1..=3 {
        let b = rig.bufs.bread(rig.dev, block, BSIZE).unwrap();
        rig.bufs.brelse(b);
    }
    assert_eq!(rig.pages.free_pages(), free_before - 3);
    assert_eq!(rig.bufs.stat().with_data, 3);

    let freed = rig.bufs.reclaim_buffers();
    assert_eq!(freed, 3);
    assert_eq!(rig.pages.free_pages(), free_before);
    assert_eq!(rig.bufs.stat().with_data, 0);
    for block in 1..=3 {
        assert!(!rig.bufs.is_hashed(rig.dev, block, BSIZE));
    }

    // Reclaimed blocks are gone from the cache entirely.
    let reads = rig.disk.read_count();
    let b = rig.bufs.bread(rig.dev, 1, BSIZE).unwrap();
    rig.bufs.brelse(b);
    assert_eq!(rig.disk.read_count(), reads + 1);
}

#[test]
fn reclaim_bounded_per_call() {
    let rig = setup_cfg(
        BufferConfig {
            nr_bufs: 4,
            nr_hash: 4,
            nr_reclaim: 2,
        },
        page_cfg(64),
        1,
    );

    for block in 1..=3 {
        let b = rig.bufs.bread(rig.dev, block, BSIZE).unwrap();
        rig.bufs.brelse(b);
    }

    assert_eq!(rig.bufs.reclaim_buffers(), 2);
    assert_eq!(rig.bufs.reclaim_buffers(), 1);
    // Nothing left: the walk stops after one rotation.
    assert_eq!(rig.bufs.reclaim_buffers(), 0);
}

#[test]
fn reclaim_flushes_dirty_buffers_first() {
    let rig = setup(4, 1);

    let mut b = rig.bufs.bread(rig.dev, 7, BSIZE).unwrap();
    b.data_mut().fill(0xCD);
    rig.bufs.bwrite(b);

    let freed = rig.bufs.reclaim_buffers();
    assert!(freed >= 1);
    assert_eq!(rig.disk.block_contents(7, BSIZE), vec![0xCD; BSIZE]);
    assert!(rig.bufs.dirty_blocks().is_empty());
    assert!(!rig.bufs.is_hashed(rig.dev, 7, BSIZE));
}

#[test]
fn reclaim_keeps_data_when_flush_fails() {
    let rig = setup(2, 1);

    let mut b = rig.bufs.bread(rig.dev, 7, BSIZE).unwrap();
    b.data_mut().fill(0xCD);
    rig.bufs.bwrite(b);

    rig.disk.set_write_protected(true);
    let freed = rig.bufs.reclaim_buffers();
    assert_eq!(freed, 0);

    // The dirty block survived with its contents intact.
    assert_eq!(rig.bufs.dirty_blocks(), vec![(rig.dev, 7)]);
    assert!(rig.bufs.is_hashed(rig.dev, 7, BSIZE));
    let b = rig.bufs.bread(rig.dev, 7, BSIZE).unwrap();
    assert_eq!(b.data(), &[0xCD; BSIZE][..]);
    rig.bufs.brelse(b);
}

// ---- page pool ----

#[test]
fn get_free_page_takes_a_reference() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(page_cfg(4), sched);

    let pg = pages.get_free_page().unwrap();
    assert_eq!(pages.page_count(pg.index()), 1);
    assert_eq!(pages.free_pages(), 3);

    pages.release_page(pg);
    assert_eq!(pages.free_pages(), 4);
}

#[test]
fn anonymous_release_goes_to_head_named_to_tail() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(page_cfg(2), sched);

    let a = pages.get_free_page().unwrap();
    let b = pages.get_free_page().unwrap();
    let (ai, bi) = (a.index(), b.index());
    pages.insert_page_hash(&b, DeviceId::new(1, 0), 5, 0);

    // Anonymous page first in line for reuse, named page behind it.
    pages.release_page(a);
    pages.release_page(b);
    assert_eq!(pages.free_list(), vec![ai, bi]);
}

#[test]
fn search_revives_free_page() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(page_cfg(4), sched);
    let dev = DeviceId::new(1, 0);

    let pg = pages.get_free_page().unwrap();
    let idx = pg.index();
    pages.insert_page_hash(&pg, dev, 5, 4096);
    pages.release_page(pg);
    assert_eq!(pages.free_pages(), 4);

    // A free page keeps its identity and comes back off the free list.
    let hit = pages.search_page_hash(dev, 5, 4096).unwrap();
    assert_eq!(hit.index(), idx);
    assert_eq!(pages.page_count(idx), 1);
    assert_eq!(pages.free_pages(), 3);
    pages.release_page(hit);
}

#[test]
fn get_free_page_evicts_previous_identity() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(page_cfg(1), sched);
    let dev = DeviceId::new(1, 0);

    let pg = pages.get_free_page().unwrap();
    pages.insert_page_hash(&pg, dev, 5, 0);
    pages.release_page(pg);
    assert!(pages.is_page_hashed(dev, 5, 0));

    // Reallocation strips the old identity.
    let pg = pages.get_free_page().unwrap();
    assert!(!pages.is_page_hashed(dev, 5, 0));
    pages.release_page(pg);
}

#[test]
fn page_storage_persists_across_lock_cycles() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(page_cfg(2), sched);

    let pg = pages.get_free_page().unwrap();
    {
        let mut guard = pages.lock_page(&pg);
        guard[..4].copy_from_slice(&[1, 2, 3, 4]);
    }
    {
        let guard = pages.lock_page(&pg);
        assert_eq!(&guard[..4], &[1, 2, 3, 4]);
    }
    pages.release_page(pg);
}

#[test]
fn reserved_pages_never_free() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(
        PageConfig {
            nr_pages: 4,
            reserved_pages: 2,
            ..page_cfg(4)
        },
        sched,
    );

    assert_eq!(pages.free_pages(), 2);
    assert!(!pages.free_list().contains(&0));
    assert!(!pages.free_list().contains(&1));
    assert_eq!(pages.stat().reserved, 2);
}

#[test]
fn get_free_page_oom_returns_none() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(page_cfg(1), sched);

    let pg = pages.get_free_page().unwrap();
    assert!(pages.get_free_page().is_none());
    pages.release_page(pg);
}

#[test]
#[should_panic(expected = "unreferenced")]
fn double_release_panics() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(page_cfg(2), sched);

    let pg = pages.get_free_page().unwrap();
    let idx = pg.index();
    pages.release_page(pg);
    pages.release_page_index(idx);
}

#[test]
#[should_panic(expected = "invalid page")]
fn out_of_range_release_panics() {
    let sched: Arc<dyn Scheduler> = Arc::new(NoopScheduler);
    let pages = PageCache::new(page_cfg(2), sched);
    pages.release_page_index(99);
}

// ---- back-pressure ----

/// Scheduler standing in for kswapd: waiting for a free page runs the
/// buffer reclaimer, as the real reclaimer task would after its wakeup.
struct ReclaimOnSleep {
    bufs: Mutex<Option<Arc<BufferCache>>>,
    reclaimer_woken: AtomicBool,
}

impl Scheduler for ReclaimOnSleep {
    fn sleep_on(&self, chan: Channel) {
        if chan == Channel::FreePage {
            let bufs = self.bufs.lock().clone();
            if let Some(bufs) = bufs {
                bufs.reclaim_buffers();
            }
        }
    }

    fn wakeup(&self, chan: Channel) {
        if chan == Channel::Reclaimer {
            self.reclaimer_woken.store(true, Ordering::Relaxed);
        }
    }
}

#[test]
fn empty_page_pool_wakes_reclaimer_and_retries() {
    let sched = Arc::new(ReclaimOnSleep {
        bufs: Mutex::new(None),
        reclaimer_woken: AtomicBool::new(false),
    });
    let devices = Arc::new(DeviceTable::new());
    let pages = Arc::new(PageCache::new(page_cfg(2), sched.clone()));
    let bufs = Arc::new(BufferCache::new(
        buf_cfg(2),
        devices.clone(),
        pages.clone(),
        sched.clone(),
    ));
    *sched.bufs.lock() = Some(bufs.clone());

    let disk = Arc::new(RamDisk::new(128, BSIZE));
    let dev = DeviceId::new(1, 0);
    devices.register(dev, disk);

    // Both pages end up as buffer data areas.
    for block in 1..=2 {
        let b = bufs.bread(dev, block, BSIZE).unwrap();
        bufs.brelse(b);
    }
    assert_eq!(pages.free_pages(), 0);

    // The allocation wakes the reclaimer, which pulls the data areas back.
    let pg = pages.get_free_page().expect("reclaim should free a page");
    assert!(sched.reclaimer_woken.load(Ordering::Relaxed));
    pages.release_page(pg);
}
