/// In-core inode contract between filesystems and the cache layer.
///
/// The cache glue sees an inode as an identity, a size, a block size and a
/// pair of callbacks; everything else about the on-disk format stays in the
/// filesystem. The long-term inode lock serializes readers and writers of
/// the file's data across their whole operation, while the short state
/// mutex only covers attribute words.
use alloc::sync::Arc;

use spin::Mutex;

use crate::dev::DeviceId;
use crate::errno::Errno;
use crate::sched::{Channel, Scheduler};

use super::file::OpenFile;
use super::FsContext;

/// Direction of a block-map lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmapMode {
    /// Resolve only; `Ok(0)` marks a hole.
    ForReading,
    /// Resolve, allocating missing blocks.
    ForWriting,
}

/// Filesystem callbacks the cache glue depends on.
pub trait InodeOps: Send + Sync {
    /// Map a byte offset of `inode` to a device block.
    fn bmap(&self, inode: &Inode, offset: u64, mode: BmapMode) -> Result<u32, Errno>;

    /// Write `src` at `file`'s cursor, used by the mm layer to clean dirty
    /// mapped pages. Filesystems that cannot accept writes keep the
    /// default.
    fn write(
        &self,
        ctx: &FsContext<'_>,
        inode: &Inode,
        file: &mut OpenFile,
        src: &[u8],
    ) -> Result<usize, Errno> {
        let _ = (ctx, inode, file, src);
        Err(Errno::Inval)
    }
}

struct InodeState {
    size: u64,
    mtime: u64,
    ctime: u64,
    dirty: bool,
    locked: bool,
}

/// An in-core inode: stable identity plus the mutable attributes the cache
/// glue may touch.
pub struct Inode {
    ino: u32,
    dev: DeviceId,
    /// Block size of the owning superblock.
    block_size: usize,
    ops: Arc<dyn InodeOps>,
    state: Mutex<InodeState>,
}

impl Inode {
    pub fn new(
        ino: u32,
        dev: DeviceId,
        block_size: usize,
        size: u64,
        ops: Arc<dyn InodeOps>,
    ) -> Self {
        assert!(ino != 0, "inode number 0 marks anonymous pages");
        assert!(block_size.is_power_of_two());
        Self {
            ino,
            dev,
            block_size,
            ops,
            state: Mutex::new(InodeState {
                size,
                mtime: 0,
                ctime: 0,
                dirty: false,
                locked: false,
            }),
        }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn mtime(&self) -> u64 {
        self.state.lock().mtime
    }

    pub fn ctime(&self) -> u64 {
        self.state.lock().ctime
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Clear the dirty bit once the filesystem has written the inode back.
    pub fn mark_clean(&self) {
        self.state.lock().dirty = false;
    }

    pub fn bmap(&self, offset: u64, mode: BmapMode) -> Result<u32, Errno> {
        self.ops.bmap(self, offset, mode)
    }

    pub(crate) fn ops(&self) -> &dyn InodeOps {
        &*self.ops
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    /// Touch mtime/ctime and mark the inode dirty.
    pub(crate) fn touch(&self, now: u64) {
        let mut st = self.state.lock();
        st.mtime = now;
        st.ctime = now;
        st.dirty = true;
    }

    /// Take the long-term inode lock, sleeping until it is free.
    pub fn lock(&self, sched: &dyn Scheduler) {
        loop {
            let mut st = self.state.lock();
            if !st.locked {
                st.locked = true;
                return;
            }
            drop(st);
            sched.sleep_on(Channel::InodeLock);
        }
    }

    /// Release the long-term inode lock and wake waiters.
    pub fn unlock(&self, sched: &dyn Scheduler) {
        self.state.lock().locked = false;
        sched.wakeup(Channel::InodeLock);
    }
}
