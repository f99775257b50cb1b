mod file;
mod inode;

pub use file::{
    bread_page, file_read, file_write, update_page_cache, write_page, OpenFile, OpenFlags, Whence,
};
pub use inode::{BmapMode, Inode, InodeOps};

use crate::cache::{BufferCache, PageCache};
use crate::sched::Scheduler;

/// Wall-clock source for mtime/ctime updates.
pub trait Clock: Send + Sync {
    /// Seconds since the epoch.
    fn now(&self) -> u64;
}

/// Everything the generic file I/O paths need from the rest of the kernel.
pub struct FsContext<'a> {
    pub buffers: &'a BufferCache,
    pub pages: &'a PageCache,
    pub sched: &'a dyn Scheduler,
    pub clock: &'a dyn Clock,
}
