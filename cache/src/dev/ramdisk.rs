/// RAM-backed block device.
///
/// Serves a fixed number of blocks entirely from memory. Used as the backing
/// store in unit tests and for memory-resident filesystems. The read/write
/// counters expose how often the caches actually reached the device, and the
/// write-protect toggle exercises the `Rofs` paths.
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::errno::Errno;

use super::block_device::{BlockDriver, DeviceId};

pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    block_size: usize,
    total_blocks: usize,
    reads: AtomicU64,
    writes: AtomicU64,
    write_protected: AtomicBool,
}

impl RamDisk {
    /// Create a zero-filled RAM disk with the given geometry. `block_size`
    /// is the device's native block size; I/O in any size that fits the
    /// disk is accepted, since the caches address the device in the
    /// filesystem's block size, not the device's.
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; total_blocks * block_size]),
            block_size,
            total_blocks,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_protected: AtomicBool::new(false),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// How many `read_block` calls reached the device.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// How many `write_block` calls the device accepted.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Refuse (`Rofs`) or accept subsequent writes.
    pub fn set_write_protected(&self, protected: bool) {
        self.write_protected.store(protected, Ordering::Relaxed);
    }

    /// Seed device contents directly, bypassing counters and protection.
    /// `block` is addressed in units of `src.len()` bytes.
    pub fn fill_block(&self, block: u32, src: &[u8]) {
        let start = block as usize * src.len();
        let mut data = self.data.lock();
        data[start..start + src.len()].copy_from_slice(src);
    }

    /// Copy of the device contents at `block`, addressed in units of `len`
    /// bytes. For test verification.
    pub fn block_contents(&self, block: u32, len: usize) -> Vec<u8> {
        let start = block as usize * len;
        self.data.lock()[start..start + len].to_vec()
    }

    fn span(&self, block: u32, len: usize) -> Result<usize, Errno> {
        let start = block as usize * len;
        if len == 0 || start + len > self.total_blocks * self.block_size {
            return Err(Errno::Io);
        }
        Ok(start)
    }
}

impl BlockDriver for RamDisk {
    fn read_block(&self, _dev: DeviceId, block: u32, buf: &mut [u8]) -> Result<usize, Errno> {
        let start = self.span(block, buf.len())?;
        let data = self.data.lock();
        buf.copy_from_slice(&data[start..start + buf.len()]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn write_block(&self, _dev: DeviceId, block: u32, buf: &[u8]) -> Result<usize, Errno> {
        if self.write_protected.load(Ordering::Relaxed) {
            return Err(Errno::Rofs);
        }
        let start = self.span(block, buf.len())?;
        let mut data = self.data.lock();
        data[start..start + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }
}
